//! veil-core: error taxonomy and small shared helpers for the veilfs workspace.
//!
//! Every crate in the workspace reports failures through [`VeilError`] so
//! callers can distinguish a wrong password from tampered data from a plain
//! I/O failure without string matching.

pub mod error;
pub mod hex;

pub use error::{VeilError, VeilResult};

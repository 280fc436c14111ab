//! veil-fs: an encrypted virtual filesystem layered over a real directory.
//!
//! Every virtual file or directory maps 1:1 to a real file or directory
//! whose name and bytes are encrypted. A [`Drive`] owns the password-derived
//! key material and issues a fresh nonce for every encryption through a
//! crash-durable [`NonceSequencer`]; device authorization hands disjoint
//! nonce sub-ranges to other machines so no two writers can ever collide on
//! a counter.
//!
//! ```no_run
//! use std::sync::Arc;
//! use veil_fs::{Drive, FileSequencer, LocalFile};
//!
//! let sequencer = Arc::new(FileSequencer::new("/home/me/.veil/sequencer.json".into())?);
//! let root = Box::new(LocalFile::new("/home/me/vault".into()));
//! let drive = Drive::create(root, "correct horse battery staple", sequencer)?;
//!
//! let vault_root = drive.root()?;
//! let notes = vault_root.create_file("notes.txt")?;
//! # drop(notes);
//! # Ok::<(), veil_core::VeilError>(())
//! ```

pub mod auth;
pub mod commander;
pub mod drive;
pub mod exporter;
pub mod file;
pub mod importer;
pub mod reader;
pub mod sequence;
pub mod vfile;

pub use auth::{export_auth_file, import_auth_file, AuthConfig};
pub use commander::{
    BatchExportOptions, BatchImportOptions, BatchProgress, BatchProgressFn, FileCommander,
};
pub use drive::Drive;
pub use exporter::{ExportOptions, FileExporter};
pub use file::{LocalFile, RealFile};
pub use importer::{FileImporter, ImportOptions};
pub use reader::SeekableCachedReader;
pub use sequence::{FileSequencer, NonceSequence, NonceSequencer, SequenceStatus};
pub use vfile::VirtualFile;

/// Per-part progress callback: `(bytes_processed, bytes_total)`.
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;

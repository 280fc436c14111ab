//! veil-crypto: client-side encryption plumbing for veilfs
//!
//! Encrypted file format (binary):
//! ```text
//! [3 bytes: magic "VLF"][1 byte: version][4 bytes: chunk size, BE][8 bytes: nonce]
//! then, with integrity enabled (chunk size > 0), repeated:
//!   [<= chunk_size bytes: AES-256-CTR ciphertext][32 bytes: HMAC-SHA256]
//! with integrity disabled (chunk size == 0): raw ciphertext only.
//! ```
//!
//! The HMAC of the first chunk additionally covers the 16 header bytes, so
//! header tampering is detected on the first read. The CTR counter block is
//! `nonce(8) || block_index(8, BE)`. A nonce must never be reused under the
//! same key, which is why nonce issuance lives behind a sequencer and not
//! here.
//!
//! Key hierarchy:
//! ```text
//! Master key (256-bit, PBKDF2-HMAC-SHA256 from password + salt + iterations)
//!   └── wraps the combined key (AES-CTR under a random IV):
//!         ├── drive key (256-bit): file contents and filenames
//!         └── hash key  (256-bit): HMAC-SHA256 integrity + config signature
//! ```

pub mod header;
pub mod integrity;
pub mod kdf;
pub mod keys;
pub mod names;
pub mod nonce;
pub mod rng;
pub mod stream;
pub mod transform;

pub use header::Header;
pub use integrity::Integrity;
pub use kdf::{derive_master_key, MasterKey};
pub use keys::DriveKey;
pub use names::{decrypt_name, encrypt_name};
pub use stream::{DecryptingStream, EncryptingStream};
pub use transform::CtrTransformer;

/// AES block size in bytes; also the minimum write alignment without
/// integrity chunks.
pub const BLOCK_SIZE: usize = 16;

/// AES-256 key length.
pub const KEY_LENGTH: usize = 32;

/// HMAC-SHA256 key length.
pub const HASH_KEY_LENGTH: usize = 32;

/// HMAC-SHA256 output length.
pub const HASH_RESULT_LENGTH: usize = 32;

/// Drive key + hash key, protected together by the master key.
pub const COMBINED_KEY_LENGTH: usize = KEY_LENGTH + HASH_KEY_LENGTH;

/// Password-derived master key length.
pub const MASTER_KEY_LENGTH: usize = 32;

/// PBKDF2 salt length.
pub const SALT_LENGTH: usize = 24;

/// IV length for the master-key encryption of the combined key.
pub const IV_LENGTH: usize = 16;

/// Stream nonce length (big-endian u64).
pub const NONCE_LENGTH: usize = 8;

/// Drive identifier length.
pub const DRIVE_ID_LENGTH: usize = 16;

/// Device authorization identifier length.
pub const AUTH_ID_LENGTH: usize = 16;

/// Default integrity chunk size.
pub const DEFAULT_CHUNK_SIZE: u32 = 256 * 1024;

/// Maximum accepted integrity chunk size.
pub const MAX_CHUNK_SIZE: u32 = 8 * 1024 * 1024;

/// Default PBKDF2 iteration count for new drives.
pub const DEFAULT_ITERATIONS: u32 = 65_536;

/// A stream nonce: 8 bytes, interpreted as a big-endian u64 counter value.
pub type Nonce = [u8; NONCE_LENGTH];

//! Per-file header codec.
//!
//! Header layout (16 bytes, prefix of every encrypted file):
//! ```text
//! [3 bytes: magic "VLF"][1 byte: version][4 bytes: chunk size, BE][8 bytes: nonce]
//! ```
//! A chunk size of zero means the file carries no integrity data. The nonce
//! is written exactly once, when the first output stream opens, and is
//! immutable afterwards.

use std::io::{Read, Write};

use veil_core::{VeilError, VeilResult};

use crate::{Nonce, NONCE_LENGTH};

/// Magic bytes identifying an encrypted veilfs file.
pub const MAGIC: [u8; 3] = *b"VLF";

/// Current format version.
pub const VERSION: u8 = 1;

/// Total header length in bytes.
pub const HEADER_LENGTH: usize = MAGIC.len() + 1 + 4 + NONCE_LENGTH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    version: u8,
    chunk_size: u32,
    nonce: Nonce,
}

impl Header {
    pub fn new(chunk_size: u32, nonce: Nonce) -> Self {
        Self {
            version: VERSION,
            chunk_size,
            nonce,
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Integrity chunk size; zero when the file has no integrity data.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        let mut bytes = [0u8; HEADER_LENGTH];
        bytes[..3].copy_from_slice(&MAGIC);
        bytes[3] = self.version;
        bytes[4..8].copy_from_slice(&self.chunk_size.to_be_bytes());
        bytes[8..].copy_from_slice(&self.nonce);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> VeilResult<Self> {
        if bytes.len() < HEADER_LENGTH {
            return Err(VeilError::Format(format!(
                "header too short: {} bytes, expected {HEADER_LENGTH}",
                bytes.len()
            )));
        }
        if bytes[..3] != MAGIC {
            return Err(VeilError::Format("bad magic bytes".into()));
        }
        let version = bytes[3];
        if version != VERSION {
            return Err(VeilError::Format(format!(
                "unsupported format version {version}"
            )));
        }
        let chunk_size = u32::from_be_bytes(bytes[4..8].try_into().expect("fixed slice"));
        let nonce: Nonce = bytes[8..HEADER_LENGTH].try_into().expect("fixed slice");
        Ok(Self {
            version,
            chunk_size,
            nonce,
        })
    }

    pub fn read_from<R: Read>(reader: &mut R) -> VeilResult<Self> {
        let mut bytes = [0u8; HEADER_LENGTH];
        reader.read_exact(&mut bytes).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                VeilError::Format("file too short for header".into())
            } else {
                VeilError::Io(e)
            }
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> VeilResult<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }
}

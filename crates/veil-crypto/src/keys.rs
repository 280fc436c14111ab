//! Unlocked drive key material.

use zeroize::Zeroize;

use crate::kdf::MasterKey;
use crate::{HASH_KEY_LENGTH, KEY_LENGTH};

/// The key set held in memory while a drive is unlocked.
///
/// Written once at unlock, read-only afterwards, and zeroized either on
/// `Drop` or explicitly when the drive closes. Never persisted in
/// plaintext.
pub struct DriveKey {
    master: MasterKey,
    drive_key: [u8; KEY_LENGTH],
    hash_key: [u8; HASH_KEY_LENGTH],
    iterations: u32,
}

impl DriveKey {
    pub fn new(
        master: MasterKey,
        drive_key: [u8; KEY_LENGTH],
        hash_key: [u8; HASH_KEY_LENGTH],
        iterations: u32,
    ) -> Self {
        Self {
            master,
            drive_key,
            hash_key,
            iterations,
        }
    }

    /// Key used to encrypt/decrypt file contents and filenames.
    pub fn drive_key(&self) -> &[u8; KEY_LENGTH] {
        &self.drive_key
    }

    /// Key used for HMAC-SHA256 integrity and the config signature.
    pub fn hash_key(&self) -> &[u8; HASH_KEY_LENGTH] {
        &self.hash_key
    }

    pub fn master_key(&self) -> &MasterKey {
        &self.master
    }

    /// PBKDF2 iteration count the master key was derived with.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}

impl Drop for DriveKey {
    fn drop(&mut self) {
        self.drive_key.zeroize();
        self.hash_key.zeroize();
        self.iterations = 0;
    }
}

impl std::fmt::Debug for DriveKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveKey")
            .field("drive_key", &"[REDACTED]")
            .field("hash_key", &"[REDACTED]")
            .field("iterations", &self.iterations)
            .finish()
    }
}

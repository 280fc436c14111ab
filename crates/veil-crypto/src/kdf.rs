//! Key derivation: PBKDF2-HMAC-SHA256 password → master key.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroize;

use veil_core::{VeilError, VeilResult};

use crate::{MASTER_KEY_LENGTH, SALT_LENGTH};

/// A 256-bit master key derived from the drive password.
///
/// Zeroized on drop so key material does not linger in memory.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; MASTER_KEY_LENGTH],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; MASTER_KEY_LENGTH]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; MASTER_KEY_LENGTH] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive the master key from a password, salt, and iteration count.
///
/// The salt and iteration count are stored in the drive config; they are
/// not secret.
pub fn derive_master_key(
    password: &str,
    salt: &[u8; SALT_LENGTH],
    iterations: u32,
) -> VeilResult<MasterKey> {
    if password.is_empty() {
        return Err(VeilError::Auth("password is missing".into()));
    }
    if iterations == 0 {
        return Err(VeilError::Format("zero KDF iterations".into()));
    }
    let mut key = [0u8; MASTER_KEY_LENGTH];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut key);
    Ok(MasterKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_ITERATIONS: u32 = 100;

    #[test]
    fn test_kdf_deterministic() {
        let salt = [1u8; SALT_LENGTH];
        let key1 = derive_master_key("password-123", &salt, TEST_ITERATIONS).unwrap();
        let key2 = derive_master_key("password-123", &salt, TEST_ITERATIONS).unwrap();
        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_different_passwords() {
        let salt = [1u8; SALT_LENGTH];
        let key1 = derive_master_key("password-a", &salt, TEST_ITERATIONS).unwrap();
        let key2 = derive_master_key("password-b", &salt, TEST_ITERATIONS).unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_different_salts() {
        let key1 = derive_master_key("same", &[1u8; SALT_LENGTH], TEST_ITERATIONS).unwrap();
        let key2 = derive_master_key("same", &[2u8; SALT_LENGTH], TEST_ITERATIONS).unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_different_iterations() {
        let salt = [3u8; SALT_LENGTH];
        let key1 = derive_master_key("same", &salt, 100).unwrap();
        let key2 = derive_master_key("same", &salt, 101).unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_empty_password_rejected() {
        let err = derive_master_key("", &[0u8; SALT_LENGTH], TEST_ITERATIONS).unwrap_err();
        assert!(matches!(err, VeilError::Auth(_)));
    }
}

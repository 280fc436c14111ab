//! Secure random generation for ids, salts, IVs, and key material.

use rand::RngCore;
use zeroize::Zeroizing;

use crate::{
    AUTH_ID_LENGTH, COMBINED_KEY_LENGTH, DRIVE_ID_LENGTH, IV_LENGTH, NONCE_LENGTH, SALT_LENGTH,
};

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate a random drive identifier.
pub fn generate_drive_id() -> [u8; DRIVE_ID_LENGTH] {
    random_bytes()
}

/// Generate a random device authorization identifier.
pub fn generate_auth_id() -> [u8; AUTH_ID_LENGTH] {
    random_bytes()
}

/// Generate a PBKDF2 salt.
pub fn generate_salt() -> [u8; SALT_LENGTH] {
    random_bytes()
}

/// Generate the IV used with the master key to encrypt the combined key.
pub fn generate_master_key_iv() -> [u8; IV_LENGTH] {
    random_bytes()
}

/// Generate a fresh combined key (drive key || hash key).
///
/// Returned in a `Zeroizing` wrapper: the caller splits it into the two
/// sub-keys and the buffer is wiped when it goes out of scope.
pub fn generate_combined_key() -> Zeroizing<[u8; COMBINED_KEY_LENGTH]> {
    Zeroizing::new(random_bytes())
}

/// The first nonce of a brand-new drive sequence.
pub fn starting_nonce() -> [u8; NONCE_LENGTH] {
    [0u8; NONCE_LENGTH]
}

/// The ceiling of a brand-new drive sequence.
pub fn max_nonce() -> [u8; NONCE_LENGTH] {
    (i64::MAX as u64).to_be_bytes()
}

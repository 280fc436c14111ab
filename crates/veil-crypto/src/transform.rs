//! Thin wrapper over the AES-256-CTR keystream.
//!
//! The counter block is `nonce(8) || block_index(8, BE)`, so the keystream
//! position in bytes equals the plaintext offset. Seeking past the 64-bit
//! block counter is a range error, surfaced as such rather than wrapping.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ctr::{Ctr128BE, Ctr64BE};

use veil_core::{VeilError, VeilResult};

use crate::{Nonce, BLOCK_SIZE, KEY_LENGTH};

type Aes256Ctr = Ctr64BE<Aes256>;

/// AES-256-CTR transform positioned by plaintext byte offset.
pub struct CtrTransformer {
    cipher: Aes256Ctr,
}

impl CtrTransformer {
    pub fn new(key: &[u8; KEY_LENGTH], nonce: &Nonce) -> Self {
        let mut iv = [0u8; BLOCK_SIZE];
        iv[..nonce.len()].copy_from_slice(nonce);
        let cipher = Aes256Ctr::new(key.into(), (&iv).into());
        Self { cipher }
    }

    /// Position the keystream at an absolute plaintext byte offset.
    pub fn seek(&mut self, position: u64) -> VeilResult<()> {
        self.cipher
            .try_seek(position)
            .map_err(|_| VeilError::RangeExceeded("CTR counter block range exceeded".into()))
    }

    /// XOR the keystream into `data` in place (encrypts or decrypts).
    pub fn apply(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }
}

/// One-shot AES-256-CTR with a full random 16-byte IV (128-bit counter).
///
/// Used to wrap the combined key in the drive config, where the IV is
/// random rather than a sequenced nonce.
pub fn apply_with_iv(key: &[u8; KEY_LENGTH], iv: &[u8; BLOCK_SIZE], data: &mut [u8]) {
    let mut cipher = Ctr128BE::<Aes256>::new(key.into(), iv.into());
    cipher.apply_keystream(data);
}

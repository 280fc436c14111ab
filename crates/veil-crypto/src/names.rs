//! Filename encryption.
//!
//! Each path segment is encrypted independently with a fresh nonce. The
//! stored form is `base64(header || AES-CTR ciphertext)` with '/' escaped
//! to '-' so the result is filesystem-safe; the nonce travels inside the
//! embedded header, so decryption needs only the key.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use veil_core::{VeilError, VeilResult};

use crate::header::{Header, HEADER_LENGTH};
use crate::transform::CtrTransformer;
use crate::{Nonce, KEY_LENGTH};

/// Encrypt one name segment under a fresh nonce.
///
/// The nonce must come from the drive sequencer and never be reused.
pub fn encrypt_name(name: &str, key: &[u8; KEY_LENGTH], nonce: Nonce) -> String {
    let header = Header::new(0, nonce);
    let mut bytes = Vec::with_capacity(HEADER_LENGTH + name.len());
    bytes.extend_from_slice(&header.to_bytes());

    let mut ciphertext = name.as_bytes().to_vec();
    CtrTransformer::new(key, &nonce).apply(&mut ciphertext);
    bytes.extend_from_slice(&ciphertext);

    BASE64.encode(&bytes).replace('/', "-")
}

/// Decrypt a stored name segment produced by [`encrypt_name`].
pub fn decrypt_name(stored: &str, key: &[u8; KEY_LENGTH]) -> VeilResult<String> {
    let unescaped = stored.replace('-', "/");
    let bytes = BASE64
        .decode(unescaped.as_bytes())
        .map_err(|e| VeilError::Format(format!("undecodable name: {e}")))?;
    if bytes.len() < HEADER_LENGTH {
        return Err(VeilError::Format("encrypted name too short".into()));
    }
    let header = Header::from_bytes(&bytes[..HEADER_LENGTH])?;

    let mut plaintext = bytes[HEADER_LENGTH..].to_vec();
    CtrTransformer::new(key, &header.nonce()).apply(&mut plaintext);
    String::from_utf8(plaintext)
        .map_err(|_| VeilError::Format("decrypted name is not UTF-8".into()))
}

//! Chunked HMAC-SHA256 integrity.
//!
//! With integrity enabled, every `chunk_size` bytes of ciphertext are
//! followed by a 32-byte HMAC-SHA256 tag. The first chunk's tag also covers
//! the 16 file-header bytes. Tampering with any ciphertext, tag, or header
//! byte fails the read of the affected chunk; it can never produce silently
//! wrong plaintext.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use veil_core::{VeilError, VeilResult};

use crate::{BLOCK_SIZE, DEFAULT_CHUNK_SIZE, HASH_KEY_LENGTH, HASH_RESULT_LENGTH, MAX_CHUNK_SIZE};

type HmacSha256 = Hmac<Sha256>;

/// Integrity configuration for one stream: whether tags are generated and
/// verified, the hash key, and the chunk layout of the underlying file.
///
/// A decrypting stream over an integrity-carrying file always needs the
/// chunk layout to skip tag bytes, even when verification is off, so
/// `chunk_size` is tracked independently of `enabled`.
#[derive(Clone)]
pub struct Integrity {
    enabled: bool,
    key: Option<[u8; HASH_KEY_LENGTH]>,
    chunk_size: u32,
}

impl Integrity {
    /// Build an integrity config.
    ///
    /// - `enabled`: generate/verify tags. Requires a key.
    /// - `key`: the HMAC key.
    /// - `chunk_size`: layout chunk size; `0` with `enabled` selects the
    ///   default. Must be a multiple of the AES block size and at most
    ///   [`MAX_CHUNK_SIZE`].
    pub fn new(
        enabled: bool,
        key: Option<[u8; HASH_KEY_LENGTH]>,
        chunk_size: u32,
    ) -> VeilResult<Self> {
        if chunk_size > 0
            && (chunk_size < BLOCK_SIZE as u32
                || chunk_size % BLOCK_SIZE as u32 != 0
                || chunk_size > MAX_CHUNK_SIZE)
        {
            return Err(VeilError::Integrity(format!(
                "invalid chunk size {chunk_size}: must be a multiple of {BLOCK_SIZE} and at most {MAX_CHUNK_SIZE}"
            )));
        }
        if enabled && key.is_none() {
            return Err(VeilError::Security(
                "integrity requires a hash key".into(),
            ));
        }
        let chunk_size = if enabled && chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            chunk_size
        };
        Ok(Self {
            enabled,
            key,
            chunk_size,
        })
    }

    /// A config with no chunks and no verification (plain CTR stream).
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            key: None,
            chunk_size: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Chunk layout size; zero when the stream has no integrity data.
    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// HMAC-SHA256 over `prefix || data`.
    pub fn calculate(
        key: &[u8; HASH_KEY_LENGTH],
        data: &[u8],
        prefix: Option<&[u8]>,
    ) -> [u8; HASH_RESULT_LENGTH] {
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
        if let Some(prefix) = prefix {
            mac.update(prefix);
        }
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// Tag for one ciphertext chunk. `header` is supplied for chunk zero
    /// only, binding the file header into the first tag.
    pub fn chunk_tag(
        &self,
        chunk: &[u8],
        header: Option<&[u8]>,
    ) -> VeilResult<[u8; HASH_RESULT_LENGTH]> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| VeilError::Security("integrity requires a hash key".into()))?;
        Ok(Self::calculate(key, chunk, header))
    }

    /// Verify one chunk tag in constant time.
    pub fn verify_chunk(
        &self,
        chunk: &[u8],
        header: Option<&[u8]>,
        expected: &[u8],
    ) -> VeilResult<()> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| VeilError::Security("integrity requires a hash key".into()))?;
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
        if let Some(header) = header {
            mac.update(header);
        }
        mac.update(chunk);
        mac.verify_slice(expected)
            .map_err(|_| VeilError::Integrity("data corrupt or tampered".into()))
    }

    /// Constant-time check of a detached HMAC signature (drive config).
    pub fn signature_matches(
        key: &[u8; HASH_KEY_LENGTH],
        data: &[u8],
        expected: &[u8],
    ) -> bool {
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.verify_slice(expected).is_ok()
    }

    /// Bytes of tag data interleaved into `stored_len` bytes of on-disk
    /// content (header excluded).
    pub fn tag_bytes_in_stored(stored_len: u64, chunk_size: u32) -> u64 {
        if chunk_size == 0 {
            return 0;
        }
        let span = chunk_size as u64 + HASH_RESULT_LENGTH as u64;
        let mut chunks = stored_len / span;
        if stored_len % span > HASH_RESULT_LENGTH as u64 {
            chunks += 1;
        }
        chunks * HASH_RESULT_LENGTH as u64
    }

    /// Bytes of tag data that `plain_len` bytes of plaintext will produce.
    pub fn tag_bytes_for_plain(plain_len: u64, chunk_size: u32) -> u64 {
        if chunk_size == 0 {
            return 0;
        }
        plain_len.div_ceil(chunk_size as u64) * HASH_RESULT_LENGTH as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        let integrity = Integrity::new(true, Some([5u8; HASH_KEY_LENGTH]), 0).unwrap();
        let chunk = vec![0xAAu8; 1024];
        let tag = integrity.chunk_tag(&chunk, None).unwrap();
        integrity.verify_chunk(&chunk, None, &tag).unwrap();
    }

    #[test]
    fn test_tamper_detected() {
        let integrity = Integrity::new(true, Some([5u8; HASH_KEY_LENGTH]), 0).unwrap();
        let mut chunk = vec![0xAAu8; 1024];
        let tag = integrity.chunk_tag(&chunk, None).unwrap();
        chunk[100] ^= 1;
        let err = integrity.verify_chunk(&chunk, None, &tag).unwrap_err();
        assert!(matches!(err, VeilError::Integrity(_)));
    }

    #[test]
    fn test_header_bound_into_first_tag() {
        let integrity = Integrity::new(true, Some([5u8; HASH_KEY_LENGTH]), 0).unwrap();
        let chunk = vec![1u8; 64];
        let with_header = integrity.chunk_tag(&chunk, Some(b"headerbytes")).unwrap();
        let without = integrity.chunk_tag(&chunk, None).unwrap();
        assert_ne!(with_header, without);
    }

    #[test]
    fn test_enabled_requires_key() {
        assert!(Integrity::new(true, None, 0).is_err());
    }

    #[test]
    fn test_rejects_unaligned_chunk_size() {
        assert!(Integrity::new(false, None, 100).is_err());
        assert!(Integrity::new(false, None, MAX_CHUNK_SIZE + 16).is_err());
    }

    #[test]
    fn test_default_chunk_size_applied() {
        let integrity = Integrity::new(true, Some([0u8; HASH_KEY_LENGTH]), 0).unwrap();
        assert_eq!(integrity.chunk_size(), DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_tag_math_for_plain() {
        // 3 full chunks
        assert_eq!(Integrity::tag_bytes_for_plain(3 * 1024, 1024), 96);
        // partial tail chunk still gets a tag
        assert_eq!(Integrity::tag_bytes_for_plain(3 * 1024 + 1, 1024), 128);
        assert_eq!(Integrity::tag_bytes_for_plain(0, 1024), 0);
        assert_eq!(Integrity::tag_bytes_for_plain(5000, 0), 0);
    }

    #[test]
    fn test_tag_math_roundtrip() {
        // stored = plain + tags; recovering tag bytes from stored length
        // must agree with what encryption produced
        for plain in [0u64, 1, 1023, 1024, 1025, 10_000, 64 * 1024] {
            let cs = 1024u32;
            let tags = Integrity::tag_bytes_for_plain(plain, cs);
            let stored = plain + tags;
            assert_eq!(
                Integrity::tag_bytes_in_stored(stored, cs),
                tags,
                "plain={plain}"
            );
        }
    }
}

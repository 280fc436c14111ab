//! Integrity-aware AES-CTR streams over a positioned base stream.
//!
//! [`EncryptingStream`] writes the file header, then ciphertext in
//! chunk-aligned batches, appending an HMAC tag after every chunk.
//! [`DecryptingStream`] is a `Read + Seek` view of the plaintext: positions
//! and lengths exclude the header and tag bytes, so callers never see the
//! authentication overhead.
//!
//! Positioned writes (`seek_to`) exist for one purpose only: parallel
//! part encryption of a brand-new file, where every part shares the header
//! nonce and writes a disjoint chunk-aligned range. They are gated behind
//! `set_allow_range_write` because overwriting existing ciphertext would
//! reuse the keystream.

use std::io::{Read, Seek, SeekFrom, Write};

use veil_core::{VeilError, VeilResult};

use crate::header::{Header, HEADER_LENGTH};
use crate::integrity::Integrity;
use crate::transform::CtrTransformer;
use crate::{Nonce, BLOCK_SIZE, HASH_RESULT_LENGTH, KEY_LENGTH};

/// Decrypted window size for files without integrity chunks.
const READ_WINDOW: usize = 256 * 1024;

/// Write side: encrypts to the base stream.
pub struct EncryptingStream<W: Write + Seek> {
    base: W,
    transformer: CtrTransformer,
    integrity: Integrity,
    header_bytes: [u8; HEADER_LENGTH],
    virtual_pos: u64,
    allow_range_write: bool,
}

impl<W: Write + Seek> std::fmt::Debug for EncryptingStream<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptingStream").finish_non_exhaustive()
    }
}

impl<W: Write + Seek> EncryptingStream<W> {
    /// Open an encrypting stream, writing the header at position zero.
    ///
    /// `integrity` decides the chunk layout; a chunk size above zero
    /// requires tag generation to be enabled, otherwise the header would
    /// promise tags the stream never writes.
    pub fn new(
        key: &[u8; KEY_LENGTH],
        nonce: Nonce,
        mut base: W,
        integrity: Integrity,
    ) -> VeilResult<Self> {
        if integrity.chunk_size() > 0 && !integrity.enabled() {
            return Err(VeilError::Security(
                "chunked layout requires integrity generation".into(),
            ));
        }
        let header = Header::new(integrity.chunk_size(), nonce);
        base.seek(SeekFrom::Start(0))?;
        header.write_to(&mut base)?;
        Ok(Self {
            base,
            transformer: CtrTransformer::new(key, &nonce),
            integrity,
            header_bytes: header.to_bytes(),
            virtual_pos: 0,
            allow_range_write: false,
        })
    }

    /// Smallest write alignment: the chunk size with integrity, else the
    /// AES block size.
    pub fn align_size(&self) -> usize {
        match self.integrity.chunk_size() {
            0 => BLOCK_SIZE,
            cs => cs as usize,
        }
    }

    /// Allow positioned writes into this stream. Only safe for initial
    /// parallel encryption of disjoint ranges, never for overwriting.
    pub fn set_allow_range_write(&mut self, allow: bool) {
        self.allow_range_write = allow;
    }

    pub fn position(&self) -> u64 {
        self.virtual_pos
    }

    /// Position the stream at an absolute plaintext offset.
    pub fn seek_to(&mut self, position: u64) -> VeilResult<()> {
        if position != 0 && !self.allow_range_write {
            return Err(VeilError::Security(
                "positioned writes reuse the keystream; only initial parallel \
                 encryption of a new file may request them"
                    .into(),
            ));
        }
        let real = self.real_position(position);
        self.base.seek(SeekFrom::Start(real))?;
        self.transformer.seek(position)?;
        self.virtual_pos = position;
        Ok(())
    }

    /// Map a plaintext offset to the on-disk offset, accounting for the
    /// header and interleaved tags.
    fn real_position(&self, virtual_pos: u64) -> u64 {
        let cs = self.integrity.chunk_size() as u64;
        if cs == 0 {
            HEADER_LENGTH as u64 + virtual_pos
        } else {
            let span = cs + HASH_RESULT_LENGTH as u64;
            HEADER_LENGTH as u64 + (virtual_pos / cs) * span + virtual_pos % cs
        }
    }

    /// Flush and return the base stream.
    pub fn into_inner(mut self) -> VeilResult<W> {
        self.base.flush()?;
        Ok(self.base)
    }
}

impl<W: Write + Seek> Write for EncryptingStream<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let align = self.align_size() as u64;
        if self.virtual_pos % align != 0 {
            return Err(VeilError::Integrity(format!(
                "writes must be aligned to {align} bytes (only the final write may be partial)"
            ))
            .into_io());
        }

        let mut data = buf.to_vec();
        self.transformer.apply(&mut data);

        let cs = self.integrity.chunk_size() as usize;
        if cs > 0 {
            let first_chunk = self.virtual_pos / cs as u64;
            for (i, chunk) in data.chunks(cs).enumerate() {
                let header = (first_chunk == 0 && i == 0).then_some(&self.header_bytes[..]);
                let tag = self
                    .integrity
                    .chunk_tag(chunk, header)
                    .map_err(VeilError::into_io)?;
                self.base.write_all(chunk)?;
                self.base.write_all(&tag)?;
            }
        } else {
            self.base.write_all(&data)?;
        }
        self.virtual_pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.base.flush()
    }
}

/// Read side: a seekable plaintext view that verifies tags as it goes.
pub struct DecryptingStream<R: Read + Seek> {
    base: R,
    transformer: CtrTransformer,
    integrity: Integrity,
    header_bytes: [u8; HEADER_LENGTH],
    virtual_pos: u64,
    virtual_len: u64,
    fail_silently: bool,
    window: Vec<u8>,
    window_start: u64,
}

impl<R: Read + Seek> std::fmt::Debug for DecryptingStream<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptingStream").finish_non_exhaustive()
    }
}

impl<R: Read + Seek> DecryptingStream<R> {
    /// Open a decrypting stream over an encrypted file.
    ///
    /// The nonce and chunk layout come from the file header. When `verify`
    /// is requested the file must actually carry integrity data.
    pub fn new(
        key: &[u8; KEY_LENGTH],
        mut base: R,
        verify: bool,
        hash_key: Option<[u8; crate::HASH_KEY_LENGTH]>,
    ) -> VeilResult<Self> {
        base.seek(SeekFrom::Start(0))?;
        let header = Header::read_from(&mut base)?;
        if verify && header.chunk_size() == 0 {
            return Err(VeilError::Security(
                "integrity verification requested but the file carries no integrity data".into(),
            ));
        }
        let integrity = Integrity::new(verify, hash_key, header.chunk_size())?;

        let real_len = base.seek(SeekFrom::End(0))?;
        let stored = real_len.saturating_sub(HEADER_LENGTH as u64);
        let virtual_len =
            stored - Integrity::tag_bytes_in_stored(stored, header.chunk_size());

        Ok(Self {
            base,
            transformer: CtrTransformer::new(key, &header.nonce()),
            integrity,
            header_bytes: header.to_bytes(),
            virtual_pos: 0,
            virtual_len,
            fail_silently: false,
            window: Vec::new(),
            window_start: 0,
        })
    }

    /// Plaintext length (header and tag bytes excluded).
    pub fn len(&self) -> u64 {
        self.virtual_len
    }

    pub fn is_empty(&self) -> bool {
        self.virtual_len == 0
    }

    pub fn position(&self) -> u64 {
        self.virtual_pos
    }

    /// Read alignment that avoids re-decrypting: the chunk size with
    /// integrity, else the AES block size.
    pub fn align_size(&self) -> usize {
        match self.integrity.chunk_size() {
            0 => BLOCK_SIZE,
            cs => cs as usize,
        }
    }

    /// Report end-of-stream instead of an error on integrity failure.
    /// Keeps third-party consumers (media decoders) from crashing; the
    /// failure is still logged.
    pub fn set_fail_silently(&mut self, fail_silently: bool) {
        self.fail_silently = fail_silently;
    }

    fn window_contains(&self, pos: u64) -> bool {
        !self.window.is_empty()
            && pos >= self.window_start
            && pos < self.window_start + self.window.len() as u64
    }

    /// Load and decrypt the window covering `pos`: one integrity chunk, or
    /// a fixed-size block-aligned window for plain files.
    fn load_window(&mut self, pos: u64) -> VeilResult<()> {
        let cs = self.integrity.chunk_size() as u64;
        if cs > 0 {
            let chunk_index = pos / cs;
            let start = chunk_index * cs;
            let plain_len = (self.virtual_len - start).min(cs) as usize;
            let real = HEADER_LENGTH as u64 + chunk_index * (cs + HASH_RESULT_LENGTH as u64);
            self.base.seek(SeekFrom::Start(real))?;

            let mut stored = vec![0u8; plain_len + HASH_RESULT_LENGTH];
            self.base.read_exact(&mut stored).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    VeilError::Format("file truncated inside an integrity chunk".into())
                } else {
                    VeilError::Io(e)
                }
            })?;
            let (ciphertext, tag) = stored.split_at(plain_len);

            if self.integrity.enabled() {
                let header = (chunk_index == 0).then_some(&self.header_bytes[..]);
                self.integrity.verify_chunk(ciphertext, header, tag)?;
            }

            let mut data = ciphertext.to_vec();
            self.transformer.seek(start)?;
            self.transformer.apply(&mut data);
            self.window = data;
            self.window_start = start;
        } else {
            let start = pos / BLOCK_SIZE as u64 * BLOCK_SIZE as u64;
            let len = (self.virtual_len - start).min(READ_WINDOW as u64) as usize;
            self.base
                .seek(SeekFrom::Start(HEADER_LENGTH as u64 + start))?;
            let mut data = vec![0u8; len];
            self.base.read_exact(&mut data)?;
            self.transformer.seek(start)?;
            self.transformer.apply(&mut data);
            self.window = data;
            self.window_start = start;
        }
        Ok(())
    }
}

impl<R: Read + Seek> Read for DecryptingStream<R> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if out.is_empty() || self.virtual_pos >= self.virtual_len {
            return Ok(0);
        }
        if !self.window_contains(self.virtual_pos) {
            match self.load_window(self.virtual_pos) {
                Ok(()) => {}
                Err(VeilError::Integrity(msg)) if self.fail_silently => {
                    tracing::warn!(%msg, "integrity failure suppressed, reporting EOF");
                    return Ok(0);
                }
                Err(e) => return Err(e.into_io()),
            }
        }
        let offset = (self.virtual_pos - self.window_start) as usize;
        let n = out.len().min(self.window.len() - offset);
        out[..n].copy_from_slice(&self.window[offset..offset + n]);
        self.virtual_pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for DecryptingStream<R> {
    fn seek(&mut self, from: SeekFrom) -> std::io::Result<u64> {
        let target = match from {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.virtual_pos as i128 + delta as i128,
            SeekFrom::End(delta) => self.virtual_len as i128 + delta as i128,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }
        self.virtual_pos = target as u64;
        Ok(self.virtual_pos)
    }
}

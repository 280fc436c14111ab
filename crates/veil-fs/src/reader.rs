//! Seek-optimized cached reads over an encrypted file.
//!
//! Media decoders read sparsely: a few KiB here, a seek, a few KiB a
//! little earlier. Decrypting a whole integrity chunk for every such read
//! is wasted work, so this reader keeps a small LRU pool of decrypted
//! cache buffers and refills them with several independent decrypting
//! streams in parallel. Refills start a back-offset *before* the requested
//! position, absorbing consumers that re-request slightly earlier bytes.

use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::trace;
use zeroize::Zeroize;

use veil_core::{VeilError, VeilResult};
use veil_crypto::{DecryptingStream, BLOCK_SIZE};

use crate::file::{FileStream, read_fully};
use crate::vfile::VirtualFile;

/// Default cache buffer size; high enough for video decoders to stay
/// inside one buffer between seeks.
pub const DEFAULT_BUFFER_SIZE: usize = 512 * 1024;

/// Default number of cache buffers.
pub const DEFAULT_BUFFERS: usize = 3;

/// Maximum allowed cache buffers.
pub const MAX_BUFFERS: usize = 6;

/// Default backwards offset applied when refilling a buffer.
pub const DEFAULT_BACK_OFFSET: usize = 32_768;

struct CacheBuffer {
    data: Vec<u8>,
    start: u64,
    count: usize,
}

impl CacheBuffer {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0u8; size],
            start: 0,
            count: 0,
        }
    }

    fn contains(&self, position: u64) -> bool {
        self.count > 0 && position >= self.start && position < self.start + self.count as u64
    }

    fn clear(&mut self) {
        self.data.zeroize();
        self.count = 0;
    }
}

/// Read-only, seekable, cached view of a [`VirtualFile`].
pub struct SeekableCachedReader {
    streams: Vec<Mutex<DecryptingStream<Box<dyn FileStream>>>>,
    buffers: Vec<CacheBuffer>,
    /// Most-recently-used buffer indexes, front first. The pool is tiny,
    /// so a list scan is fast enough.
    lru: VecDeque<usize>,
    pool: rayon::ThreadPool,
    buffer_size: usize,
    back_offset: usize,
    align: usize,
    threads: usize,
    total_size: u64,
    position: u64,
}

impl SeekableCachedReader {
    /// Open with default buffer pool, buffer size, back offset, and a
    /// single stream.
    pub fn open(file: &VirtualFile) -> VeilResult<Self> {
        Self::new(file, DEFAULT_BUFFERS, DEFAULT_BUFFER_SIZE, 1, DEFAULT_BACK_OFFSET)
    }

    /// Open with explicit tuning.
    ///
    /// - `buffers_count` is clamped to [1, 6].
    /// - `threads` must be a power of two; each thread gets its own
    ///   decrypting stream.
    /// - `back_offset` and `buffer_size` are aligned up to the file's
    ///   chunk (or block) size.
    pub fn new(
        file: &VirtualFile,
        buffers_count: usize,
        buffer_size: usize,
        threads: usize,
        back_offset: usize,
    ) -> VeilResult<Self> {
        let threads = threads.max(1);
        if !threads.is_power_of_two() {
            return Err(VeilError::State(
                "reader threads must be a power of two".into(),
            ));
        }

        let chunk_size = file.chunk_size()?;
        let align = if chunk_size > 0 {
            chunk_size as usize
        } else {
            BLOCK_SIZE
        };

        let mut buffers_count = buffers_count.clamp(1, MAX_BUFFERS);
        let mut buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        let mut back_offset = back_offset;

        // align the back offset and buffer size for efficient decryption
        if back_offset > 0 {
            back_offset = back_offset.div_ceil(align) * align;
        }
        buffer_size = (buffer_size.div_ceil(align) * align).max(align);

        if back_offset > 0 {
            buffer_size += back_offset;
            // the previous buffer usually holds the new one's back-offset
            // bytes, so two buffers minimum
            buffers_count = buffers_count.max(2);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| VeilError::State(format!("could not build worker pool: {e}")))?;

        let mut streams = Vec::with_capacity(threads);
        for _ in 0..threads {
            streams.push(Mutex::new(file.open_read()?));
        }

        Ok(Self {
            streams,
            buffers: (0..buffers_count).map(|_| CacheBuffer::new(buffer_size)).collect(),
            lru: VecDeque::new(),
            pool,
            buffer_size,
            back_offset,
            align,
            threads,
            total_size: file.size()?,
            position: 0,
        })
    }

    /// Plaintext length of the underlying file.
    pub fn len(&self) -> u64 {
        self.total_size
    }

    pub fn is_empty(&self) -> bool {
        self.total_size == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Release streams and zero all cached plaintext.
    pub fn close(&mut self) {
        self.streams.clear();
        for buffer in &mut self.buffers {
            buffer.clear();
        }
        self.lru.clear();
    }

    fn touch(&mut self, index: usize) {
        if let Some(at) = self.lru.iter().position(|&i| i == index) {
            self.lru.remove(at);
        }
        self.lru.push_front(index);
    }

    fn hit_index(&self, position: u64) -> Option<usize> {
        self.buffers.iter().position(|b| b.contains(position))
    }

    /// An empty buffer if one remains, else the least recently used.
    fn victim_index(&self) -> usize {
        if let Some(empty) = self.buffers.iter().position(|b| b.count == 0) {
            return empty;
        }
        self.lru.back().copied().unwrap_or(self.buffers.len() - 1)
    }

    /// True if some buffer already covers `[position - back_offset,
    /// position)`, making a backwards refill pointless.
    fn has_back_data(&self, position: u64) -> bool {
        let wanted = position.saturating_sub(self.back_offset as u64);
        self.buffers.iter().any(|b| {
            b.count > 0 && b.start <= wanted && position <= b.start + b.count as u64
        })
    }

    /// Refill the victim buffer so it covers `position`.
    fn refill(&mut self, position: u64) -> VeilResult<usize> {
        let index = self.victim_index();

        let mut start = position / self.align as u64 * self.align as u64;
        let mut length = self.buffer_size;
        if start > 0 && !self.has_back_data(start) {
            start = start.saturating_sub(self.back_offset as u64);
        } else {
            length -= self.back_offset;
        }
        let length = length.min((self.total_size - start) as usize);

        trace!(start, length, buffer = index, "refilling cache buffer");
        let streams = &self.streams;
        let threads = self.threads;
        let buffer = &mut self.buffers[index];
        let filled = if threads == 1 {
            let mut stream = streams[0].lock().expect("stream lock poisoned");
            stream
                .seek(SeekFrom::Start(start))
                .map_err(VeilError::from_io)?;
            read_fully(&mut *stream, &mut buffer.data[..length]).map_err(VeilError::from_io)?
        } else {
            Self::fill_parallel(
                &self.pool,
                streams,
                threads,
                &mut buffer.data[..length],
                start,
                self.back_offset,
                length == self.buffer_size,
            )?
        };

        buffer.start = start;
        buffer.count = filled;
        self.touch(index);
        Ok(index)
    }

    /// Fill disjoint slices of the buffer from independent streams, one
    /// worker per stream. The first part carries the back-offset span so
    /// the split stays even across the rest.
    #[allow(clippy::too_many_arguments)]
    fn fill_parallel(
        pool: &rayon::ThreadPool,
        streams: &[Mutex<DecryptingStream<Box<dyn FileStream>>>],
        threads: usize,
        data: &mut [u8],
        start: u64,
        back_offset: usize,
        has_back_span: bool,
    ) -> VeilResult<usize> {
        let length = data.len();
        let first_extra = if has_back_span && threads > 1 {
            back_offset.min(length)
        } else {
            0
        };
        let part = (length - first_extra).div_ceil(threads);

        let mut bounds = Vec::with_capacity(threads);
        let mut offset = 0usize;
        for i in 0..threads {
            if offset >= length {
                break;
            }
            let mut len = part + if i == 0 { first_extra } else { 0 };
            if i == threads - 1 || offset + len > length {
                len = length - offset;
            }
            bounds.push((offset, len));
            offset += len;
        }

        // carve the buffer into the disjoint part slices
        let mut slices: Vec<&mut [u8]> = Vec::with_capacity(bounds.len());
        let mut rest = data;
        for &(_, len) in &bounds {
            let (head, tail) = rest.split_at_mut(len);
            slices.push(head);
            rest = tail;
        }

        let filled = AtomicU64::new(0);
        let first_error: Mutex<Option<VeilError>> = Mutex::new(None);
        pool.scope(|scope| {
            for ((slice, &(offset, _)), stream) in
                slices.into_iter().zip(bounds.iter()).zip(streams.iter())
            {
                let filled = &filled;
                let first_error = &first_error;
                scope.spawn(move |_| {
                    let result = (|| -> VeilResult<usize> {
                        let mut stream = stream.lock().expect("stream lock poisoned");
                        stream
                            .seek(SeekFrom::Start(start + offset as u64))
                            .map_err(VeilError::from_io)?;
                        read_fully(&mut *stream, slice).map_err(VeilError::from_io)
                    })();
                    match result {
                        Ok(n) => {
                            filled.fetch_add(n as u64, Ordering::Relaxed);
                        }
                        Err(e) => {
                            let mut slot = first_error.lock().expect("error slot poisoned");
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                        }
                    }
                });
            }
        });

        if let Some(e) = first_error.into_inner().expect("error slot poisoned") {
            return Err(e);
        }
        Ok(filled.load(Ordering::Relaxed) as usize)
    }
}

impl Read for SeekableCachedReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if out.is_empty() || self.position >= self.total_size {
            return Ok(0);
        }
        if self.streams.is_empty() {
            return Ok(0); // closed
        }

        let index = match self.hit_index(self.position) {
            Some(index) => {
                self.touch(index);
                index
            }
            None => self.refill(self.position).map_err(VeilError::into_io)?,
        };

        let buffer = &self.buffers[index];
        let offset = (self.position - buffer.start) as usize;
        let available = buffer.count - offset;
        let n = out.len().min(available);
        out[..n].copy_from_slice(&buffer.data[offset..offset + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for SeekableCachedReader {
    fn seek(&mut self, from: SeekFrom) -> std::io::Result<u64> {
        let target = match from {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => self.total_size as i128 + delta as i128,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }
        self.position = (target as u64).min(self.total_size);
        Ok(self.position)
    }
}

impl Drop for SeekableCachedReader {
    fn drop(&mut self) {
        self.close();
    }
}

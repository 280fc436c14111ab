//! Parallel chunked import: real file → encrypted virtual file.
//!
//! The file is split into parts aligned down to the minimum independently
//! encryptable size (the integrity chunk size, else the cipher block); one
//! worker per part opens its own encrypting stream positioned at the part
//! offset. Ranges are disjoint, so workers never contend; the header is
//! written synchronously before any part is dispatched. The first failure
//! wins, the partial target is deleted, and cancellation is cooperative.

use std::io::{Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use veil_core::{VeilError, VeilResult};

use crate::file::{read_fully, RealFile};
use crate::vfile::VirtualFile;
use crate::ProgressFn;

/// Default copy buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 512 * 1024;

/// Options for a single-file import.
#[derive(Default)]
pub struct ImportOptions {
    /// Virtual filename override; defaults to the source name.
    pub filename: Option<String>,
    /// Delete the source after a fully successful import.
    pub delete_source: bool,
    /// Write integrity chunks (drive default chunk size).
    pub integrity: bool,
    /// Per-file progress: `(bytes_done, bytes_total)`.
    pub on_progress: Option<ProgressFn>,
}

/// Imports one real file at a time into a drive.
///
/// Directories are walked by the commander; a single importer instance
/// runs one operation at a time.
pub struct FileImporter {
    buffer_size: usize,
    threads: usize,
    pool: rayon::ThreadPool,
    stopped: AtomicBool,
    running: AtomicBool,
}

impl FileImporter {
    /// `buffer_size` zero selects the default; `threads` zero selects one.
    pub fn new(buffer_size: usize, threads: usize) -> VeilResult<Self> {
        let buffer_size = if buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            buffer_size
        };
        let threads = threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| VeilError::State(format!("could not build worker pool: {e}")))?;
        Ok(Self {
            buffer_size,
            threads,
            pool,
            stopped: AtomicBool::new(true),
            running: AtomicBool::new(false),
        })
    }

    /// Request cooperative cancellation of the running import.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Import `source` into the virtual directory `dir`.
    ///
    /// Returns the imported file, or `None` when the operation was stopped
    /// (the partial target is deleted either way).
    pub fn import_file(
        &self,
        source: &dyn RealFile,
        dir: &VirtualFile,
        options: ImportOptions,
    ) -> VeilResult<Option<VirtualFile>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(VeilError::State("another import is running".into()));
        }
        let result = self.import_file_inner(source, dir, options);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn import_file_inner(
        &self,
        source: &dyn RealFile,
        dir: &VirtualFile,
        options: ImportOptions,
    ) -> VeilResult<Option<VirtualFile>> {
        if source.is_dir() {
            return Err(VeilError::State(
                "cannot import a directory; use the commander".into(),
            ));
        }
        self.stopped.store(false, Ordering::Relaxed);

        let filename = options.filename.clone().unwrap_or_else(|| source.name());
        let imported = dir.create_file(&filename)?;
        // parts position into the shared target, which requires the
        // explicit overwrite opt-in on a brand-new file
        imported.set_allow_overwrite(true);
        if options.integrity {
            imported.set_apply_integrity(true, None, 0)?;
        }

        let file_size = source.length();
        debug!(
            source = %source.path().display(),
            virtual_name = %filename,
            file_size,
            "importing file"
        );

        // the header (and its nonce claim) must be on disk before any part
        // starts writing content
        {
            let header_stream = imported.open_write()?;
            drop(header_stream.into_inner()?);
        }

        let (part_size, parts) = split_parts(file_size, self.threads, imported.min_part_size()?);
        let result = if parts <= 1 {
            let total = AtomicU64::new(0);
            self.copy_part(source, &imported, 0, file_size, &total, &options)
        } else {
            self.run_parts(source, &imported, file_size, part_size, parts, &options)
        };

        let stopped = self.stopped.load(Ordering::Relaxed);
        if result.is_err() || stopped {
            if let Err(e) = imported.real_file().delete() {
                warn!(error = %e, "could not remove partial import target");
            }
        }
        result?;
        if stopped {
            return Ok(None);
        }
        if options.delete_source {
            source.delete()?;
        }
        info!(virtual_name = %filename, file_size, "import finished");
        Ok(Some(imported))
    }

    fn run_parts(
        &self,
        source: &dyn RealFile,
        imported: &VirtualFile,
        file_size: u64,
        part_size: u64,
        parts: u64,
        options: &ImportOptions,
    ) -> VeilResult<()> {
        let total = AtomicU64::new(0);
        let first_error: Mutex<Option<VeilError>> = Mutex::new(None);

        self.pool.scope(|scope| {
            for index in 0..parts {
                let total = &total;
                let first_error = &first_error;
                scope.spawn(move |_| {
                    let start = part_size * index;
                    let length = if index == parts - 1 {
                        file_size - start
                    } else {
                        part_size
                    };
                    if let Err(e) =
                        self.copy_part(source, imported, start, length, total, options)
                    {
                        let mut slot = first_error.lock().expect("error slot poisoned");
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                        drop(slot);
                        self.stop();
                    }
                });
            }
        });

        match first_error.into_inner().expect("error slot poisoned") {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Encrypt `[start, start + length)` of the source into the target.
    fn copy_part(
        &self,
        source: &dyn RealFile,
        imported: &VirtualFile,
        start: u64,
        length: u64,
        total: &AtomicU64,
        options: &ImportOptions,
    ) -> VeilResult<()> {
        let mut target = imported.open_write()?;
        target.seek_to(start)?;

        let mut input = source.open_read()?;
        input.seek(SeekFrom::Start(start))?;

        // keep every non-final write aligned to the stream's chunk/block
        let align = target.align_size();
        let buffer_len = (self.buffer_size / align).max(1) * align;
        let mut buffer = vec![0u8; buffer_len];

        let file_size = source.length();
        let mut done: u64 = 0;
        while done < length {
            if self.stopped.load(Ordering::Relaxed) {
                break;
            }
            let want = buffer_len.min((length - done) as usize);
            let got = read_fully(&mut input, &mut buffer[..want])?;
            if got == 0 {
                break;
            }
            target.write_all(&buffer[..got])?;
            done += got as u64;
            let overall = total.fetch_add(got as u64, Ordering::Relaxed) + got as u64;
            if let Some(progress) = &options.on_progress {
                progress(overall, file_size);
            }
        }
        target.flush()?;
        Ok(())
    }
}

/// Split `file_size` into up to `threads` parts aligned down to
/// `min_part_size`; the last part absorbs the remainder.
pub(crate) fn split_parts(file_size: u64, threads: usize, min_part_size: u64) -> (u64, u64) {
    if file_size <= min_part_size || threads <= 1 {
        return (file_size, 1);
    }
    let mut part_size = file_size.div_ceil(threads as u64);
    if part_size > min_part_size {
        part_size -= part_size % min_part_size;
    } else {
        part_size = min_part_size;
    }
    let parts = file_size / part_size;
    (part_size, parts.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_small_file_single_part() {
        assert_eq!(split_parts(100, 4, 1024), (100, 1));
    }

    #[test]
    fn test_split_aligns_down() {
        let (part, parts) = split_parts(10 * 1024, 4, 1024);
        assert_eq!(part % 1024, 0);
        assert!(parts >= 2);
        // parts cover the whole file with the last absorbing the remainder
        assert!(part * (parts - 1) < 10 * 1024);
    }

    #[test]
    fn test_split_single_thread() {
        assert_eq!(split_parts(1 << 20, 1, 16), ((1 << 20), 1));
    }

    #[test]
    fn test_split_odd_sizes_cover_file() {
        for size in [16u64, 17, 4095, 4096, 4097, 100_000] {
            for threads in [2usize, 3, 4, 8] {
                let (part, parts) = split_parts(size, threads, 16);
                assert!(part * (parts - 1) <= size, "size={size} threads={threads}");
                assert!(part * parts <= size || parts == 1);
            }
        }
    }

    proptest::proptest! {
        #[test]
        fn split_always_covers_and_aligns(
            size in 1u64..50_000_000,
            threads in 1usize..32,
            min_part in proptest::sample::select(vec![16u64, 1024, 262_144]),
        ) {
            let (part, parts) = split_parts(size, threads, min_part);
            proptest::prop_assert!(parts >= 1);
            if parts > 1 {
                // all but the last part are aligned and the last absorbs
                // the remainder
                proptest::prop_assert_eq!(part % min_part, 0);
                let last = size - part * (parts - 1);
                proptest::prop_assert!(last >= part);
                proptest::prop_assert_eq!(part * (parts - 1) + last, size);
            }
        }
    }
}

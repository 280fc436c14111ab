//! Parallel chunked export: encrypted virtual file → real file.
//!
//! The mirror of the importer: parts are split on the same minimum part
//! size, each worker opens its own decrypting stream and writes its
//! disjoint range of the shared plaintext target. Integrity verification
//! (when requested) happens inside the decrypting streams, per chunk.

use std::io::{Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use veil_core::{VeilError, VeilResult};

use crate::file::RealFile;
use crate::importer::DEFAULT_BUFFER_SIZE;
use crate::vfile::VirtualFile;
use crate::ProgressFn;

/// Options for a single-file export.
#[derive(Default)]
pub struct ExportOptions {
    /// Real filename override; defaults to the decrypted virtual name.
    pub filename: Option<String>,
    /// Delete the virtual source after a fully successful export.
    pub delete_source: bool,
    /// Verify integrity chunks while reading.
    pub integrity: bool,
    /// Per-file progress: `(bytes_done, bytes_total)`.
    pub on_progress: Option<ProgressFn>,
}

/// Exports one virtual file at a time out of a drive.
pub struct FileExporter {
    buffer_size: usize,
    threads: usize,
    pool: rayon::ThreadPool,
    stopped: AtomicBool,
    running: AtomicBool,
}

impl FileExporter {
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

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Export `source` into the real directory `dir`.
    ///
    /// Returns the exported file, or `None` when the operation was stopped
    /// (the partial target is deleted either way). The source is left
    /// untouched unless `delete_source` was set and the export fully
    /// succeeded.
    pub fn export_file(
        &self,
        source: &VirtualFile,
        dir: &dyn RealFile,
        options: ExportOptions,
    ) -> VeilResult<Option<Box<dyn RealFile>>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(VeilError::State("another export is running".into()));
        }
        let result = self.export_file_inner(source, dir, options);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn export_file_inner(
        &self,
        source: &VirtualFile,
        dir: &dyn RealFile,
        options: ExportOptions,
    ) -> VeilResult<Option<Box<dyn RealFile>>> {
        if source.is_dir() {
            return Err(VeilError::State(
                "cannot export a directory; use the commander".into(),
            ));
        }
        self.stopped.store(false, Ordering::Relaxed);

        if options.integrity {
            source.set_verify_integrity(true, None)?;
        }

        let filename = match options.filename.clone() {
            Some(name) => name,
            None => source.name()?,
        };
        let target = dir.create_file(&filename)?;
        let file_size = source.size()?;
        debug!(
            virtual_path = %source.path().unwrap_or_default(),
            target = %target.path().display(),
            file_size,
            "exporting file"
        );

        let (part_size, parts) =
            crate::importer::split_parts(file_size, self.threads, source.min_part_size()?);
        let result = if parts <= 1 {
            let total = AtomicU64::new(0);
            self.copy_part(source, target.as_ref(), 0, file_size, &total, &options)
        } else {
            self.run_parts(source, target.as_ref(), file_size, part_size, parts, &options)
        };

        let stopped = self.stopped.load(Ordering::Relaxed);
        if result.is_err() || stopped {
            if let Err(e) = target.delete() {
                warn!(error = %e, "could not remove partial export target");
            }
        }
        result?;
        if stopped {
            return Ok(None);
        }
        if options.delete_source {
            source.delete()?;
        }
        info!(target = %target.path().display(), file_size, "export finished");
        Ok(Some(target))
    }

    fn run_parts(
        &self,
        source: &VirtualFile,
        target: &dyn RealFile,
        file_size: u64,
        part_size: u64,
        parts: u64,
        options: &ExportOptions,
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
                    if let Err(e) = self.copy_part(source, target, start, length, total, options)
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

    /// Decrypt `[start, start + length)` of the source into the target.
    fn copy_part(
        &self,
        source: &VirtualFile,
        target: &dyn RealFile,
        start: u64,
        length: u64,
        total: &AtomicU64,
        options: &ExportOptions,
    ) -> VeilResult<()> {
        let mut input = source.open_read()?;
        input.seek(SeekFrom::Start(start)).map_err(VeilError::from_io)?;

        let mut output = target.open_write()?;
        output.seek(SeekFrom::Start(start))?;

        let align = input.align_size();
        let buffer_len = (self.buffer_size / align).max(1) * align;
        let mut buffer = vec![0u8; buffer_len];

        let file_size = source.size()?;
        let mut done: u64 = 0;
        while done < length {
            if self.stopped.load(Ordering::Relaxed) {
                break;
            }
            let want = buffer_len.min((length - done) as usize);
            let got = crate::file::read_fully(&mut input, &mut buffer[..want])
                .map_err(VeilError::from_io)?;
            if got == 0 {
                break;
            }
            output.write_all(&buffer[..got])?;
            done += got as u64;
            let overall = total.fetch_add(got as u64, Ordering::Relaxed) + got as u64;
            if let Some(progress) = &options.on_progress {
                progress(overall, file_size);
            }
        }
        output.flush()?;
        Ok(())
    }
}

//! Batch operations over directory trees: import, export, search.
//!
//! The importer and exporter handle one file at a time; the commander
//! supplies sequencing across many files, directory recursion, aggregate
//! progress, and stop-all.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use veil_core::{VeilError, VeilResult};

use crate::exporter::{ExportOptions, FileExporter};
use crate::file::{auto_rename_name, RealFile};
use crate::importer::{FileImporter, ImportOptions};
use crate::vfile::VirtualFile;

/// Aggregate progress across a batch:
/// `(files_processed, total_files, bytes_processed, total_bytes)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchProgress {
    pub files_processed: u64,
    pub total_files: u64,
    pub bytes_processed: u64,
    pub total_bytes: u64,
}

/// Batch progress callback.
pub type BatchProgressFn = Arc<dyn Fn(BatchProgress) + Send + Sync>;

/// Options for batch import.
#[derive(Default)]
pub struct BatchImportOptions {
    pub delete_source: bool,
    pub integrity: bool,
    /// Rename on virtual-name collision instead of failing.
    pub auto_rename: bool,
    pub on_progress: Option<BatchProgressFn>,
    /// Called per failed file; the batch continues.
    pub on_failed: Option<Box<dyn Fn(&dyn RealFile, &VeilError) + Send + Sync>>,
}

/// Options for batch export.
#[derive(Default)]
pub struct BatchExportOptions {
    pub delete_source: bool,
    pub integrity: bool,
    pub on_progress: Option<BatchProgressFn>,
    pub on_failed: Option<Box<dyn Fn(&VirtualFile, &VeilError) + Send + Sync>>,
}

/// Running totals shared with the per-file progress closures.
struct BatchState {
    progress: Mutex<BatchProgress>,
    on_progress: Option<BatchProgressFn>,
}

impl BatchState {
    fn new(total_files: u64, total_bytes: u64, on_progress: Option<BatchProgressFn>) -> Arc<Self> {
        Arc::new(Self {
            progress: Mutex::new(BatchProgress {
                total_files,
                total_bytes,
                ..Default::default()
            }),
            on_progress,
        })
    }

    /// Per-file callback folding file-local bytes into the batch totals.
    fn per_file(self: &Arc<Self>) -> Option<crate::ProgressFn> {
        self.on_progress.as_ref()?;
        let state = Arc::clone(self);
        Some(Box::new(move |done, _total| {
            let snapshot = {
                let base = state.progress.lock().expect("progress lock poisoned");
                BatchProgress {
                    bytes_processed: base.bytes_processed + done,
                    ..*base
                }
            };
            if let Some(callback) = &state.on_progress {
                callback(snapshot);
            }
        }))
    }

    /// Commit one finished file into the running totals.
    fn finish_file(&self, file_bytes: u64) {
        let mut progress = self.progress.lock().expect("progress lock poisoned");
        progress.files_processed += 1;
        progress.bytes_processed += file_bytes;
        let snapshot = *progress;
        drop(progress);
        if let Some(callback) = &self.on_progress {
            callback(snapshot);
        }
    }
}

/// Façade composing the importer and exporter over directory trees.
pub struct FileCommander {
    importer: FileImporter,
    exporter: FileExporter,
    stopped: AtomicBool,
}

impl FileCommander {
    /// Build with shared buffer size and thread count for both engines.
    pub fn new(buffer_size: usize, threads: usize) -> VeilResult<Self> {
        Ok(Self {
            importer: FileImporter::new(buffer_size, threads)?,
            exporter: FileExporter::new(buffer_size, threads)?,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn importer(&self) -> &FileImporter {
        &self.importer
    }

    pub fn exporter(&self) -> &FileExporter {
        &self.exporter
    }

    /// Stop the batch and any in-flight file operation.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.importer.stop();
        self.exporter.stop();
    }

    /// Import real files (and directory trees) into a virtual directory.
    /// Returns the imported files.
    pub fn import_files(
        &self,
        sources: &[Box<dyn RealFile>],
        dest: &VirtualFile,
        options: BatchImportOptions,
    ) -> VeilResult<Vec<VirtualFile>> {
        self.stopped.store(false, Ordering::Relaxed);

        let mut total_files = 0u64;
        let mut total_bytes = 0u64;
        for source in sources {
            count_real_tree(source.as_ref(), &mut total_files, &mut total_bytes);
        }
        let state = BatchState::new(total_files, total_bytes, options.on_progress.clone());

        let mut imported = Vec::new();
        for source in sources {
            if self.stopped.load(Ordering::Relaxed) {
                break;
            }
            self.import_one(source.as_ref(), dest, &options, &state, &mut imported)?;
        }
        Ok(imported)
    }

    fn import_one(
        &self,
        source: &dyn RealFile,
        dest: &VirtualFile,
        options: &BatchImportOptions,
        state: &Arc<BatchState>,
        imported: &mut Vec<VirtualFile>,
    ) -> VeilResult<()> {
        if self.stopped.load(Ordering::Relaxed) {
            return Ok(());
        }
        if source.is_dir() {
            let name = source.name();
            let sub_dest = match dest.child(&name)? {
                Some(existing) if existing.is_dir() => existing,
                Some(_) => {
                    return Err(VeilError::State(format!(
                        "{name} exists in the drive and is not a directory"
                    )))
                }
                None => dest.create_dir(&name)?,
            };
            for child in source.list()? {
                self.import_one(child.as_ref(), &sub_dest, options, state, imported)?;
            }
            return Ok(());
        }

        let mut filename = source.name();
        if dest.child(&filename)?.is_some() {
            if !options.auto_rename {
                let e = VeilError::State(format!("{filename} already exists in the drive"));
                match &options.on_failed {
                    Some(callback) => {
                        callback(source, &e);
                        return Ok(());
                    }
                    None => return Err(e),
                }
            }
            filename = auto_rename_name(&filename);
        }

        let file_options = ImportOptions {
            filename: Some(filename),
            delete_source: options.delete_source,
            integrity: options.integrity,
            on_progress: state.per_file(),
        };
        match self.importer.import_file(source, dest, file_options) {
            Ok(Some(file)) => {
                state.finish_file(source.length());
                imported.push(file);
            }
            Ok(None) => {} // stopped
            Err(e) => match &options.on_failed {
                Some(callback) => {
                    warn!(source = %source.path().display(), error = %e, "import failed");
                    callback(source, &e);
                }
                None => return Err(e),
            },
        }
        Ok(())
    }

    /// Export virtual files (and directory trees) into a real directory.
    pub fn export_files(
        &self,
        sources: &[&VirtualFile],
        dest: &dyn RealFile,
        options: BatchExportOptions,
    ) -> VeilResult<Vec<Box<dyn RealFile>>> {
        self.stopped.store(false, Ordering::Relaxed);

        let mut total_files = 0u64;
        let mut total_bytes = 0u64;
        for source in sources {
            count_virtual_tree(source, &mut total_files, &mut total_bytes)?;
        }
        let state = BatchState::new(total_files, total_bytes, options.on_progress.clone());

        let mut exported = Vec::new();
        for source in sources {
            if self.stopped.load(Ordering::Relaxed) {
                break;
            }
            self.export_one(source, dest, &options, &state, &mut exported)?;
        }
        Ok(exported)
    }

    fn export_one(
        &self,
        source: &VirtualFile,
        dest: &dyn RealFile,
        options: &BatchExportOptions,
        state: &Arc<BatchState>,
        exported: &mut Vec<Box<dyn RealFile>>,
    ) -> VeilResult<()> {
        if self.stopped.load(Ordering::Relaxed) {
            return Ok(());
        }
        if source.is_dir() {
            let name = source.name()?;
            let existing = dest.child(&name);
            let sub_dest = if existing.exists() {
                if !existing.is_dir() {
                    return Err(VeilError::State(format!(
                        "{name} exists in the destination and is not a directory"
                    )));
                }
                existing
            } else {
                dest.create_dir(&name)?
            };
            for child in source.list()? {
                self.export_one(&child, sub_dest.as_ref(), options, state, exported)?;
            }
            return Ok(());
        }

        let size = source.size()?;
        let file_options = ExportOptions {
            filename: None,
            delete_source: options.delete_source,
            integrity: options.integrity,
            on_progress: state.per_file(),
        };
        match self.exporter.export_file(source, dest, file_options) {
            Ok(Some(file)) => {
                state.finish_file(size);
                exported.push(file);
            }
            Ok(None) => {}
            Err(e) => match &options.on_failed {
                Some(callback) => {
                    warn!(error = %e, "export failed");
                    callback(source, &e);
                }
                None => return Err(e),
            },
        }
        Ok(())
    }

    /// Delete virtual files and directory trees; failed entries are
    /// reported through the callback and left in place.
    pub fn delete_files(
        &self,
        files: &[&VirtualFile],
        on_failed: Option<&(dyn Fn(&VirtualFile, &VeilError) + Sync)>,
    ) -> VeilResult<()> {
        self.stopped.store(false, Ordering::Relaxed);
        for file in files {
            if self.stopped.load(Ordering::Relaxed) {
                break;
            }
            file.delete_recursively(on_failed)?;
        }
        Ok(())
    }

    /// Recursively search a virtual directory for entries whose decrypted
    /// name contains `query` (case-insensitive). Entries that fail to
    /// decrypt are skipped.
    pub fn search(&self, dir: &VirtualFile, query: &str) -> VeilResult<Vec<VirtualFile>> {
        self.stopped.store(false, Ordering::Relaxed);
        let needle = query.to_lowercase();
        let mut matches = Vec::new();
        self.search_inner(dir, &needle, &mut matches)?;
        Ok(matches)
    }

    fn search_inner(
        &self,
        dir: &VirtualFile,
        needle: &str,
        matches: &mut Vec<VirtualFile>,
    ) -> VeilResult<()> {
        for child in dir.list()? {
            if self.stopped.load(Ordering::Relaxed) {
                return Ok(());
            }
            match child.name() {
                Ok(name) => {
                    if child.is_dir() {
                        self.search_inner(&child, needle, matches)?;
                    }
                    if name.to_lowercase().contains(needle) {
                        matches.push(child);
                    }
                }
                Err(VeilError::Format(e)) => {
                    warn!(stored = %child.real_file().name(), error = %e, "skipping undecryptable entry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn count_real_tree(file: &dyn RealFile, files: &mut u64, bytes: &mut u64) {
    if file.is_dir() {
        if let Ok(children) = file.list() {
            for child in children {
                count_real_tree(child.as_ref(), files, bytes);
            }
        }
    } else {
        *files += 1;
        *bytes += file.length();
    }
}

fn count_virtual_tree(file: &VirtualFile, files: &mut u64, bytes: &mut u64) -> VeilResult<()> {
    if file.is_dir() {
        for child in file.list()? {
            count_virtual_tree(&child, files, bytes)?;
        }
    } else {
        *files += 1;
        *bytes += file.size()?;
    }
    Ok(())
}

//! The real-file boundary: a minimal abstraction over the host filesystem.
//!
//! Directory semantics (listing, create, delete, move) come entirely from
//! the host; this layer adds nothing on top. [`LocalFile`] is the std::fs
//! implementation; network or platform-specific backends implement
//! [`RealFile`] elsewhere.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::PathBuf;
use std::time::SystemTime;

use rand::RngCore;

/// Readable positioned stream over a real file.
pub trait FileStream: Read + Seek + Send {}
impl<T: Read + Seek + Send> FileStream for T {}

/// Writable positioned stream over a real file.
pub trait WriteStream: Write + Seek + Send {}
impl<T: Write + Seek + Send> WriteStream for T {}

/// A file or directory on the host filesystem.
///
/// Handles are cheap paths, not open descriptors; streams are opened on
/// demand so parallel workers can each hold their own.
pub trait RealFile: Send + Sync + std::fmt::Debug {
    /// Basename as stored on disk (encrypted form for vault members).
    fn name(&self) -> String;

    /// Full path for display and relative-path computation.
    fn path(&self) -> PathBuf;

    fn exists(&self) -> bool;
    fn is_file(&self) -> bool;
    fn is_dir(&self) -> bool;

    /// Size in bytes; zero for directories and missing files.
    fn length(&self) -> u64;

    fn last_modified(&self) -> Option<SystemTime>;

    fn parent(&self) -> Option<Box<dyn RealFile>>;

    /// Child handle by stored name. The child need not exist.
    fn child(&self, name: &str) -> Box<dyn RealFile>;

    fn list(&self) -> io::Result<Vec<Box<dyn RealFile>>>;

    fn create_file(&self, name: &str) -> io::Result<Box<dyn RealFile>>;
    fn create_dir(&self, name: &str) -> io::Result<Box<dyn RealFile>>;

    /// Delete this file, or this directory and everything under it.
    fn delete(&self) -> io::Result<()>;

    /// Rename in place; returns the handle under the new name.
    fn rename(&self, new_name: &str) -> io::Result<Box<dyn RealFile>>;

    /// Move into `dest_dir`, keeping the stored name.
    fn move_to(&self, dest_dir: &dyn RealFile) -> io::Result<Box<dyn RealFile>> {
        self.move_to_as(dest_dir, &self.name())
    }

    /// Move into `dest_dir` under a different stored name.
    fn move_to_as(&self, dest_dir: &dyn RealFile, name: &str) -> io::Result<Box<dyn RealFile>>;

    /// Copy into `dest_dir`, keeping the stored name.
    fn copy_to(&self, dest_dir: &dyn RealFile) -> io::Result<Box<dyn RealFile>> {
        self.copy_to_as(dest_dir, &self.name())
    }

    /// Copy into `dest_dir` under a different stored name.
    fn copy_to_as(&self, dest_dir: &dyn RealFile, name: &str) -> io::Result<Box<dyn RealFile>>;

    fn open_read(&self) -> io::Result<Box<dyn FileStream>>;

    /// Open for writing without truncating: parallel part writers position
    /// into disjoint ranges of the same file.
    fn open_write(&self) -> io::Result<Box<dyn WriteStream>>;

    fn clone_box(&self) -> Box<dyn RealFile>;
}

impl Clone for Box<dyn RealFile> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// `std::fs` implementation of [`RealFile`].
#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
}

impl LocalFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl RealFile for LocalFile {
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn path(&self) -> PathBuf {
        self.path.clone()
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn is_file(&self) -> bool {
        self.path.is_file()
    }

    fn is_dir(&self) -> bool {
        self.path.is_dir()
    }

    fn length(&self) -> u64 {
        fs::metadata(&self.path)
            .map(|m| if m.is_file() { m.len() } else { 0 })
            .unwrap_or(0)
    }

    fn last_modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    fn parent(&self) -> Option<Box<dyn RealFile>> {
        self.path
            .parent()
            .map(|p| Box::new(LocalFile::new(p.to_path_buf())) as Box<dyn RealFile>)
    }

    fn child(&self, name: &str) -> Box<dyn RealFile> {
        Box::new(LocalFile::new(self.path.join(name)))
    }

    fn list(&self) -> io::Result<Vec<Box<dyn RealFile>>> {
        let mut entries: Vec<Box<dyn RealFile>> = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            entries.push(Box::new(LocalFile::new(entry?.path())));
        }
        entries.sort_by_key(|f| f.name());
        Ok(entries)
    }

    fn create_file(&self, name: &str) -> io::Result<Box<dyn RealFile>> {
        let path = self.path.join(name);
        fs::File::create(&path)?;
        Ok(Box::new(LocalFile::new(path)))
    }

    fn create_dir(&self, name: &str) -> io::Result<Box<dyn RealFile>> {
        let path = self.path.join(name);
        fs::create_dir(&path)?;
        Ok(Box::new(LocalFile::new(path)))
    }

    fn delete(&self) -> io::Result<()> {
        if self.path.is_dir() {
            fs::remove_dir_all(&self.path)
        } else {
            fs::remove_file(&self.path)
        }
    }

    fn rename(&self, new_name: &str) -> io::Result<Box<dyn RealFile>> {
        let dest = self
            .path
            .parent()
            .map(|p| p.join(new_name))
            .unwrap_or_else(|| PathBuf::from(new_name));
        fs::rename(&self.path, &dest)?;
        Ok(Box::new(LocalFile::new(dest)))
    }

    fn move_to_as(&self, dest_dir: &dyn RealFile, name: &str) -> io::Result<Box<dyn RealFile>> {
        let dest = dest_dir.path().join(name);
        if dest.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", dest.display()),
            ));
        }
        fs::rename(&self.path, &dest)?;
        Ok(Box::new(LocalFile::new(dest)))
    }

    fn copy_to_as(&self, dest_dir: &dyn RealFile, name: &str) -> io::Result<Box<dyn RealFile>> {
        let dest = dest_dir.path().join(name);
        if dest.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", dest.display()),
            ));
        }
        fs::copy(&self.path, &dest)?;
        Ok(Box::new(LocalFile::new(dest)))
    }

    fn open_read(&self) -> io::Result<Box<dyn FileStream>> {
        Ok(Box::new(fs::File::open(&self.path)?))
    }

    fn open_write(&self) -> io::Result<Box<dyn WriteStream>> {
        Ok(Box::new(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)?,
        ))
    }

    fn clone_box(&self) -> Box<dyn RealFile> {
        Box::new(self.clone())
    }
}

/// Produce an alternative name for conflict resolution: inserts a short
/// random suffix before the extension.
pub fn auto_rename_name(name: &str) -> String {
    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    let tag: String = suffix.iter().map(|b| format!("{b:02x}")).collect();
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({tag}).{ext}"),
        _ => format!("{name} ({tag})"),
    }
}

/// Read until `buf` is full or the stream ends; returns bytes read.
pub fn read_fully<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

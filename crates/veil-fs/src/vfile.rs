//! Virtual files: the encrypted file/directory handle.
//!
//! A `VirtualFile` binds one real file or directory to a drive (or to an
//! explicit key for standalone use). Names decrypt lazily and are cached;
//! content access goes through the encrypting/decrypting stream factories.
//! Sizes are computed, never stored: callers see plaintext lengths with the
//! header and integrity tags subtracted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use veil_core::{VeilError, VeilResult};
use veil_crypto::header::HEADER_LENGTH;
use veil_crypto::{
    decrypt_name, encrypt_name, DecryptingStream, EncryptingStream, Header, Integrity, Nonce,
    BLOCK_SIZE, HASH_KEY_LENGTH, KEY_LENGTH,
};

use crate::drive::Drive;
use crate::file::{auto_rename_name, FileStream, RealFile, WriteStream};

/// Virtual path separator.
pub const SEPARATOR: char = '/';

#[derive(Default)]
struct IntegrityRequest {
    apply: bool,
    verify: bool,
    chunk_size: u32,
}

#[derive(Default)]
struct Caches {
    header: Option<Header>,
    name: Option<String>,
}

/// An encrypted file or directory inside (or outside) a drive.
pub struct VirtualFile {
    real: Box<dyn RealFile>,
    drive: Option<Arc<Drive>>,
    key: Option<[u8; KEY_LENGTH]>,
    hash_key: Mutex<Option<[u8; HASH_KEY_LENGTH]>>,
    requested_nonce: Mutex<Option<Nonce>>,
    integrity: Mutex<IntegrityRequest>,
    caches: Mutex<Caches>,
    allow_overwrite: AtomicBool,
    /// Serializes output-stream creation so two writers cannot race to
    /// claim a nonce for the same file.
    write_lock: Mutex<()>,
    tag: Mutex<Option<String>>,
}

impl std::fmt::Debug for VirtualFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualFile").finish_non_exhaustive()
    }
}

impl VirtualFile {
    /// Wrap a real file that belongs to a drive.
    pub fn new(real: Box<dyn RealFile>, drive: Arc<Drive>) -> Self {
        Self {
            real,
            drive: Some(drive),
            key: None,
            hash_key: Mutex::new(None),
            requested_nonce: Mutex::new(None),
            integrity: Mutex::new(IntegrityRequest::default()),
            caches: Mutex::new(Caches::default()),
            allow_overwrite: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            tag: Mutex::new(None),
        }
    }

    /// Wrap a real file with an explicit key, outside any drive.
    ///
    /// `nonce` is required before the first write; reads take the nonce
    /// from the file header as usual.
    pub fn standalone(
        real: Box<dyn RealFile>,
        key: [u8; KEY_LENGTH],
        nonce: Option<Nonce>,
    ) -> Self {
        Self {
            real,
            drive: None,
            key: Some(key),
            hash_key: Mutex::new(None),
            requested_nonce: Mutex::new(nonce),
            integrity: Mutex::new(IntegrityRequest::default()),
            caches: Mutex::new(Caches::default()),
            allow_overwrite: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            tag: Mutex::new(None),
        }
    }

    fn wrap(&self, real: Box<dyn RealFile>) -> VirtualFile {
        match &self.drive {
            Some(drive) => VirtualFile::new(real, Arc::clone(drive)),
            None => VirtualFile {
                real,
                drive: None,
                key: self.key,
                hash_key: Mutex::new(*self.hash_key.lock().expect("lock poisoned")),
                requested_nonce: Mutex::new(None),
                integrity: Mutex::new(IntegrityRequest::default()),
                caches: Mutex::new(Caches::default()),
                allow_overwrite: AtomicBool::new(false),
                write_lock: Mutex::new(()),
                tag: Mutex::new(None),
            },
        }
    }

    // ----- identity -------------------------------------------------------

    pub fn real_file(&self) -> &dyn RealFile {
        self.real.as_ref()
    }

    pub fn drive(&self) -> Option<&Arc<Drive>> {
        self.drive.as_ref()
    }

    pub fn exists(&self) -> bool {
        self.real.exists()
    }

    pub fn is_file(&self) -> bool {
        self.real.is_file()
    }

    pub fn is_dir(&self) -> bool {
        self.real.is_dir()
    }

    fn encryption_key(&self) -> VeilResult<[u8; KEY_LENGTH]> {
        if let Some(key) = self.key {
            return Ok(key);
        }
        match &self.drive {
            Some(drive) => drive.drive_key(),
            None => Err(VeilError::Security(
                "file has no key: bind it to a drive or set one explicitly".into(),
            )),
        }
    }

    fn integrity_hash_key(&self) -> VeilResult<Option<[u8; HASH_KEY_LENGTH]>> {
        if let Some(hash_key) = *self.hash_key.lock().expect("lock poisoned") {
            return Ok(Some(hash_key));
        }
        match &self.drive {
            Some(drive) => Ok(Some(drive.hash_key()?)),
            None => Ok(None),
        }
    }

    fn is_drive_root(&self) -> bool {
        match &self.drive {
            Some(drive) => drive
                .root()
                .map(|root| root.real.path() == self.real.path())
                .unwrap_or(false),
            None => false,
        }
    }

    /// Decrypted basename. Empty string for the drive root. Cached until
    /// rename.
    pub fn name(&self) -> VeilResult<String> {
        if let Some(name) = &self.caches.lock().expect("lock poisoned").name {
            return Ok(name.clone());
        }
        if self.is_drive_root() {
            return Ok(String::new());
        }
        let key = self.encryption_key()?;
        let name = decrypt_name(&self.real.name(), &key)?;
        self.caches.lock().expect("lock poisoned").name = Some(name.clone());
        Ok(name)
    }

    /// Decrypted virtual path, rooted at the drive's virtual root.
    pub fn path(&self) -> VeilResult<String> {
        let drive = match &self.drive {
            Some(drive) => drive,
            None => return Ok(format!("{SEPARATOR}{}", self.name()?)),
        };
        let root_path = drive.root()?.real.path();
        let real_path = self.real.path();
        let relative = real_path
            .strip_prefix(&root_path)
            .map_err(|_| VeilError::State("file is outside the drive".into()))?;

        let key = self.encryption_key()?;
        let mut path = String::new();
        for component in relative.components() {
            let stored = component.as_os_str().to_string_lossy();
            path.push(SEPARATOR);
            path.push_str(&decrypt_name(&stored, &key)?);
        }
        if path.is_empty() {
            path.push(SEPARATOR);
        }
        Ok(path)
    }

    /// Virtual parent directory; `None` at the drive root.
    pub fn parent(&self) -> Option<VirtualFile> {
        if self.is_drive_root() {
            return None;
        }
        self.real.parent().map(|real| self.wrap(real))
    }

    // ----- header and size ------------------------------------------------

    /// Parse (and cache) the content header, or `None` while the file has
    /// no content yet.
    pub fn header(&self) -> VeilResult<Option<Header>> {
        if let Some(header) = self.caches.lock().expect("lock poisoned").header {
            return Ok(Some(header));
        }
        if !self.exists() || self.real.length() < HEADER_LENGTH as u64 {
            return Ok(None);
        }
        let mut stream = self.real.open_read()?;
        let header = Header::read_from(&mut stream)?;
        self.caches.lock().expect("lock poisoned").header = Some(header);
        Ok(Some(header))
    }

    /// Integrity chunk size from the header; zero when absent or disabled.
    pub fn chunk_size(&self) -> VeilResult<u32> {
        Ok(self.header()?.map(|h| h.chunk_size()).unwrap_or(0))
    }

    /// The content nonce, once a header exists.
    pub fn nonce(&self) -> VeilResult<Option<Nonce>> {
        Ok(self.header()?.map(|h| h.nonce()))
    }

    /// Virtual (plaintext) size: real length minus header and tag bytes.
    pub fn size(&self) -> VeilResult<u64> {
        let real_len = self.real.length();
        if real_len == 0 {
            return Ok(0);
        }
        let chunk_size = self.chunk_size()?;
        let stored = real_len.saturating_sub(HEADER_LENGTH as u64);
        Ok(stored - Integrity::tag_bytes_in_stored(stored, chunk_size))
    }

    /// Smallest part that can be encrypted or decrypted independently: the
    /// integrity chunk size when present, else the cipher block size.
    pub fn min_part_size(&self) -> VeilResult<u64> {
        let from_header = self.chunk_size()?;
        if from_header > 0 {
            return Ok(from_header as u64);
        }
        let requested = self.integrity.lock().expect("lock poisoned").chunk_size;
        if requested > 0 {
            return Ok(requested as u64);
        }
        Ok(BLOCK_SIZE as u64)
    }

    // ----- integrity & overwrite switches ---------------------------------

    /// Request integrity generation for the next output stream.
    /// `chunk_size` zero selects the drive default.
    pub fn set_apply_integrity(
        &self,
        apply: bool,
        hash_key: Option<[u8; HASH_KEY_LENGTH]>,
        chunk_size: u32,
    ) -> VeilResult<()> {
        if let Some(header) = self.header()? {
            if header.chunk_size() > 0 && !self.allow_overwrite.load(Ordering::Relaxed) {
                return Err(VeilError::Integrity(
                    "cannot redefine the chunk size of an existing file".into(),
                ));
            }
        }
        let mut request = self.integrity.lock().expect("lock poisoned");
        request.apply = apply;
        request.chunk_size = if apply {
            match chunk_size {
                0 => self
                    .drive
                    .as_ref()
                    .map(|d| d.default_chunk_size())
                    .unwrap_or(veil_crypto::DEFAULT_CHUNK_SIZE),
                cs => cs,
            }
        } else {
            0
        };
        if let Some(hash_key) = hash_key {
            *self.hash_key.lock().expect("lock poisoned") = Some(hash_key);
        }
        Ok(())
    }

    /// Request integrity verification for the next input stream. The file
    /// must carry integrity data.
    pub fn set_verify_integrity(
        &self,
        verify: bool,
        hash_key: Option<[u8; HASH_KEY_LENGTH]>,
    ) -> VeilResult<()> {
        if verify && self.chunk_size()? == 0 {
            return Err(VeilError::Integrity(
                "file carries no integrity data".into(),
            ));
        }
        self.integrity.lock().expect("lock poisoned").verify = verify;
        if let Some(hash_key) = hash_key {
            *self.hash_key.lock().expect("lock poisoned") = Some(hash_key);
        }
        Ok(())
    }

    /// Allow the output stream to open although a header already exists.
    /// Safe only for initial parallel part encryption of a new file:
    /// overwriting real content would reuse the nonce.
    pub fn set_allow_overwrite(&self, allow: bool) {
        self.allow_overwrite.store(allow, Ordering::Relaxed);
    }

    // ----- streams --------------------------------------------------------

    /// Open a decrypting stream over this file's contents.
    pub fn open_read(&self) -> VeilResult<DecryptingStream<Box<dyn FileStream>>> {
        if !self.exists() {
            return Err(VeilError::State("file does not exist".into()));
        }
        let request = self.integrity.lock().expect("lock poisoned");
        let verify = request.verify;
        drop(request);
        if verify && self.chunk_size()? == 0 {
            return Err(VeilError::Security(
                "integrity verification requested but the file carries none".into(),
            ));
        }
        let key = self.encryption_key()?;
        let hash_key = if verify { self.integrity_hash_key()? } else { None };
        let base = self.real.open_read()?;
        DecryptingStream::new(&key, base, verify, hash_key)
    }

    /// Open an encrypting stream, claiming a fresh nonce from the drive.
    pub fn open_write(&self) -> VeilResult<EncryptingStream<Box<dyn WriteStream>>> {
        self.open_write_with(None)
    }

    /// Open an encrypting stream with an explicit nonce (auth config files,
    /// standalone use).
    ///
    /// Serialized per file handle: when a header (and therefore a nonce)
    /// already exists, opening fails unless overwrite was explicitly
    /// allowed. Encrypting new data under an old nonce is a security
    /// violation, so the correct way to replace content is delete + create.
    pub fn open_write_with(
        &self,
        nonce: Option<Nonce>,
    ) -> VeilResult<EncryptingStream<Box<dyn WriteStream>>> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");

        let existing = self.header()?;
        let (nonce, chunk_size, apply) = match existing {
            Some(header) => {
                if !self.allow_overwrite.load(Ordering::Relaxed) {
                    return Err(VeilError::Security(
                        "file already has a nonce; delete it and create a new file instead \
                         of overwriting (or allow overwrite for initial parallel writes)"
                            .into(),
                    ));
                }
                // the layout is already fixed by the on-disk header
                (header.nonce(), header.chunk_size(), header.chunk_size() > 0)
            }
            None => {
                let request = self.integrity.lock().expect("lock poisoned");
                let chunk_size = if request.apply { request.chunk_size } else { 0 };
                let apply = request.apply;
                drop(request);

                let nonce = match nonce {
                    Some(nonce) => nonce,
                    None => {
                        let requested = *self.requested_nonce.lock().expect("lock poisoned");
                        match requested {
                            Some(nonce) => nonce,
                            None => match &self.drive {
                                Some(drive) => drive.next_nonce()?,
                                None => {
                                    return Err(VeilError::Security(
                                        "file requires a nonce".into(),
                                    ))
                                }
                            },
                        }
                    }
                };
                (nonce, chunk_size, apply)
            }
        };

        let key = self.encryption_key()?;
        let integrity = if apply && chunk_size > 0 {
            let hash_key = self.integrity_hash_key()?.ok_or_else(|| {
                VeilError::Security("integrity requires a hash key".into())
            })?;
            Integrity::new(true, Some(hash_key), chunk_size)?
        } else {
            Integrity::disabled()
        };

        let base = self.real.open_write()?;
        let mut stream = EncryptingStream::new(&key, nonce, base, integrity)?;
        stream.set_allow_range_write(self.allow_overwrite.load(Ordering::Relaxed));

        // the header is on disk now; remember it so a second open on this
        // handle is refused without re-reading
        self.caches.lock().expect("lock poisoned").header =
            Some(Header::new(if apply { chunk_size } else { 0 }, nonce));
        Ok(stream)
    }

    // ----- tree operations ------------------------------------------------

    /// List children as virtual files.
    pub fn list(&self) -> VeilResult<Vec<VirtualFile>> {
        let children = self.real.list()?;
        Ok(children.into_iter().map(|real| self.wrap(real)).collect())
    }

    pub fn children_count(&self) -> VeilResult<usize> {
        Ok(self.real.list()?.len())
    }

    /// Find a child by decrypted name. Foreign entries whose stored names
    /// are not valid ciphertext are skipped; other failures propagate.
    pub fn child(&self, name: &str) -> VeilResult<Option<VirtualFile>> {
        for candidate in self.list()? {
            match candidate.name() {
                Ok(candidate_name) if candidate_name == name => return Ok(Some(candidate)),
                Ok(_) => {}
                Err(VeilError::Format(e)) => {
                    warn!(stored = %candidate.real.name(), error = %e, "skipping undecryptable entry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn encrypt_child_name(&self, name: &str, nonce: Option<Nonce>) -> VeilResult<String> {
        let key = self.encryption_key()?;
        let nonce = match (&self.drive, nonce) {
            (Some(_), Some(_)) => {
                return Err(VeilError::Security(
                    "nonce is issued by the drive; do not supply one".into(),
                ))
            }
            // every name encryption consumes a fresh nonce, never derived
            (Some(drive), None) => drive.next_nonce()?,
            (None, Some(nonce)) => nonce,
            (None, None) => {
                return Err(VeilError::Security(
                    "name encryption outside a drive requires a nonce".into(),
                ))
            }
        };
        Ok(encrypt_name(name, &key, nonce))
    }

    /// Create an encrypted file under this directory.
    pub fn create_file(&self, name: &str) -> VeilResult<VirtualFile> {
        self.create_file_with(name, None, None)
    }

    /// Standalone variant with explicit name and content nonces.
    pub fn create_file_with(
        &self,
        name: &str,
        name_nonce: Option<Nonce>,
        content_nonce: Option<Nonce>,
    ) -> VeilResult<VirtualFile> {
        if self.drive.is_some() && content_nonce.is_some() {
            return Err(VeilError::Security(
                "nonce is issued by the drive; do not supply one".into(),
            ));
        }
        let stored = self.encrypt_child_name(name, name_nonce)?;
        let real = self.real.create_file(&stored)?;
        let file = self.wrap(real);
        *file.requested_nonce.lock().expect("lock poisoned") = content_nonce;
        file.caches.lock().expect("lock poisoned").name = Some(name.to_string());
        Ok(file)
    }

    /// Create an encrypted directory under this directory.
    pub fn create_dir(&self, name: &str) -> VeilResult<VirtualFile> {
        self.create_dir_with(name, None)
    }

    /// Standalone variant with an explicit name nonce.
    pub fn create_dir_with(&self, name: &str, name_nonce: Option<Nonce>) -> VeilResult<VirtualFile> {
        let stored = self.encrypt_child_name(name, name_nonce)?;
        let real = self.real.create_dir(&stored)?;
        let dir = self.wrap(real);
        dir.caches.lock().expect("lock poisoned").name = Some(name.to_string());
        Ok(dir)
    }

    /// Rename to a new virtual name; consumes a fresh nonce for the name.
    pub fn rename(&mut self, new_name: &str) -> VeilResult<()> {
        self.rename_with(new_name, None)
    }

    /// Standalone variant with an explicit name nonce.
    pub fn rename_with(&mut self, new_name: &str, name_nonce: Option<Nonce>) -> VeilResult<()> {
        let stored = self.encrypt_child_name(new_name, name_nonce)?;
        self.real = self.real.rename(&stored)?;
        let mut caches = self.caches.lock().expect("lock poisoned");
        caches.name = None;
        Ok(())
    }

    /// Move into another virtual directory. Stored (encrypted) name is kept.
    pub fn move_to(&self, dest: &VirtualFile) -> VeilResult<VirtualFile> {
        let real = self.real.move_to(dest.real.as_ref())?;
        Ok(self.wrap(real))
    }

    /// Copy into another virtual directory. Stored (encrypted) name is
    /// kept; ciphertext is byte-identical, which is safe because it is the
    /// same data under the same nonce.
    pub fn copy_to(&self, dest: &VirtualFile) -> VeilResult<VirtualFile> {
        let real = self.real.copy_to(dest.real.as_ref())?;
        Ok(self.wrap(real))
    }

    /// Delete this file or directory tree.
    pub fn delete(&self) -> VeilResult<()> {
        Ok(self.real.delete()?)
    }

    /// Depth-first delete with a per-entry failure callback; failed
    /// entries are left in place.
    pub fn delete_recursively(
        &self,
        on_failed: Option<&(dyn Fn(&VirtualFile, &VeilError) + Sync)>,
    ) -> VeilResult<()> {
        if self.is_dir() {
            for child in self.list()? {
                child.delete_recursively(on_failed)?;
            }
        }
        if let Err(e) = self.real.delete().map_err(VeilError::Io) {
            match on_failed {
                Some(callback) => callback(self, &e),
                None => return Err(e),
            }
        }
        Ok(())
    }

    /// Recursively copy this tree into `dest`. With `auto_rename`, name
    /// collisions get a fresh name (and a fresh name nonce); without it
    /// they fail. With `on_failed`, failing files are reported and the
    /// walk continues.
    pub fn copy_recursively(
        &self,
        dest: &VirtualFile,
        auto_rename: bool,
        on_failed: Option<&(dyn Fn(&VirtualFile, &VeilError) + Sync)>,
    ) -> VeilResult<()> {
        if self.is_dir() {
            let target = match dest.child(&self.name()?)? {
                Some(existing) if existing.is_dir() => existing,
                Some(_) => {
                    return Err(VeilError::State(
                        "destination exists and is not a directory".into(),
                    ))
                }
                // same stored name: the name ciphertext is reused as-is
                None => dest.wrap(dest.real.create_dir(&self.real.name())?),
            };
            for child in self.list()? {
                child.copy_recursively(&target, auto_rename, on_failed)?;
            }
            Ok(())
        } else {
            match self.copy_one(dest, auto_rename) {
                Ok(()) => Ok(()),
                Err(e) => match on_failed {
                    Some(callback) => {
                        callback(self, &e);
                        Ok(())
                    }
                    None => Err(e),
                },
            }
        }
    }

    fn copy_one(&self, dest: &VirtualFile, auto_rename: bool) -> VeilResult<()> {
        // collisions are on the decrypted name: stored names are
        // nonce-unique and never collide
        let name = self.name()?;
        if dest.child(&name)?.is_some() {
            if !auto_rename {
                return Err(VeilError::State(format!(
                    "{name} already exists in destination"
                )));
            }
            let new_stored = dest.encrypt_child_name(&auto_rename_name(&name), None)?;
            self.real.copy_to_as(dest.real.as_ref(), &new_stored)?;
        } else {
            self.real.copy_to(dest.real.as_ref())?;
        }
        Ok(())
    }

    /// Recursively move this tree into `dest`; directories are merged,
    /// files renamed on collision when `auto_rename` is set. With
    /// `on_failed`, failing files are reported, left in place, and the
    /// walk continues (the emptied source directories survive too).
    pub fn move_recursively(
        &self,
        dest: &VirtualFile,
        auto_rename: bool,
        on_failed: Option<&(dyn Fn(&VirtualFile, &VeilError) + Sync)>,
    ) -> VeilResult<()> {
        if self.is_dir() {
            let target = match dest.child(&self.name()?)? {
                Some(existing) if existing.is_dir() => existing,
                Some(_) => {
                    return Err(VeilError::State(
                        "destination exists and is not a directory".into(),
                    ))
                }
                None => dest.wrap(dest.real.create_dir(&self.real.name())?),
            };
            for child in self.list()? {
                child.move_recursively(&target, auto_rename, on_failed)?;
            }
            if self.children_count()? == 0 {
                self.real.delete()?;
            }
            Ok(())
        } else {
            match self.move_one(dest, auto_rename) {
                Ok(()) => Ok(()),
                Err(e) => match on_failed {
                    Some(callback) => {
                        callback(self, &e);
                        Ok(())
                    }
                    None => Err(e),
                },
            }
        }
    }

    fn move_one(&self, dest: &VirtualFile, auto_rename: bool) -> VeilResult<()> {
        let name = self.name()?;
        if dest.child(&name)?.is_some() {
            if !auto_rename {
                return Err(VeilError::State(format!(
                    "{name} already exists in destination"
                )));
            }
            let new_stored = dest.encrypt_child_name(&auto_rename_name(&name), None)?;
            self.real.move_to_as(dest.real.as_ref(), &new_stored)?;
        } else {
            self.real.move_to(dest.real.as_ref())?;
        }
        Ok(())
    }

    // ----- tag ------------------------------------------------------------

    /// Opaque caller tag (UI bookkeeping).
    pub fn set_tag(&self, tag: Option<String>) {
        *self.tag.lock().expect("lock poisoned") = tag;
    }

    pub fn tag(&self) -> Option<String> {
        self.tag.lock().expect("lock poisoned").clone()
    }
}

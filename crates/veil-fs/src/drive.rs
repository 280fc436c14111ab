//! Drive lifecycle: create, open, lock, and nonce issuance.
//!
//! Drive config file layout (binary, big-endian):
//! ```text
//! [3: magic "VLF"][1: version][24: salt][4: iterations][16: master-key IV]
//! [80: combined key (64) + drive id (16), AES-CTR under the master key]
//! [32: HMAC-SHA256 of the 80 encrypted bytes, keyed by the hash key]
//! ```
//! The signature doubles as the password check: a wrong password derives a
//! wrong master key, decrypts a wrong hash key, and the recomputed HMAC no
//! longer matches. That is reported as an authentication failure, never as
//! corruption.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};
use zeroize::Zeroize;

use veil_core::{hex, VeilError, VeilResult};
use veil_crypto::header::{MAGIC, VERSION};
use veil_crypto::{
    derive_master_key, rng, transform, DriveKey, Integrity, Nonce, COMBINED_KEY_LENGTH,
    DEFAULT_CHUNK_SIZE, DEFAULT_ITERATIONS, DRIVE_ID_LENGTH, HASH_KEY_LENGTH, HASH_RESULT_LENGTH,
    IV_LENGTH, KEY_LENGTH, SALT_LENGTH,
};

use crate::file::RealFile;
use crate::sequence::NonceSequencer;
use crate::vfile::VirtualFile;

/// Drive config filename inside the real root.
pub const CONFIG_FILENAME: &str = "veil.cfg";

/// Default filename for device authorization exports.
pub const AUTH_CONFIG_FILENAME: &str = "auth.cfg";

/// Real directory that holds the encrypted virtual tree.
pub const VIRTUAL_DIR_NAME: &str = "fs";

/// Default directory for decrypted exports.
pub const EXPORT_DIR_NAME: &str = "export";

const ENC_DATA_LENGTH: usize = COMBINED_KEY_LENGTH + DRIVE_ID_LENGTH;
const CONFIG_LENGTH: usize =
    MAGIC.len() + 1 + SALT_LENGTH + 4 + IV_LENGTH + ENC_DATA_LENGTH + HASH_RESULT_LENGTH;

/// Parsed drive config file.
pub struct DriveConfig {
    salt: [u8; SALT_LENGTH],
    iterations: u32,
    iv: [u8; IV_LENGTH],
    enc_data: [u8; ENC_DATA_LENGTH],
    signature: [u8; HASH_RESULT_LENGTH],
}

impl DriveConfig {
    pub fn from_bytes(bytes: &[u8]) -> VeilResult<Self> {
        if bytes.len() < CONFIG_LENGTH {
            return Err(VeilError::Format(format!(
                "drive config too short: {} bytes, expected {CONFIG_LENGTH}",
                bytes.len()
            )));
        }
        if bytes[..3] != MAGIC {
            return Err(VeilError::Format("bad drive config magic".into()));
        }
        if bytes[3] != VERSION {
            return Err(VeilError::Format(format!(
                "unsupported drive config version {}",
                bytes[3]
            )));
        }
        let mut offset = 4;
        let mut take = |len: usize| {
            let slice = &bytes[offset..offset + len];
            offset += len;
            slice
        };
        let salt: [u8; SALT_LENGTH] = take(SALT_LENGTH).try_into().expect("fixed slice");
        let iterations = u32::from_be_bytes(take(4).try_into().expect("fixed slice"));
        let iv: [u8; IV_LENGTH] = take(IV_LENGTH).try_into().expect("fixed slice");
        let enc_data: [u8; ENC_DATA_LENGTH] =
            take(ENC_DATA_LENGTH).try_into().expect("fixed slice");
        let signature: [u8; HASH_RESULT_LENGTH] =
            take(HASH_RESULT_LENGTH).try_into().expect("fixed slice");
        Ok(Self {
            salt,
            iterations,
            iv,
            enc_data,
            signature,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(CONFIG_LENGTH);
        bytes.extend_from_slice(&MAGIC);
        bytes.push(VERSION);
        bytes.extend_from_slice(&self.salt);
        bytes.extend_from_slice(&self.iterations.to_be_bytes());
        bytes.extend_from_slice(&self.iv);
        bytes.extend_from_slice(&self.enc_data);
        bytes.extend_from_slice(&self.signature);
        bytes
    }
}

struct DriveState {
    key: Option<DriveKey>,
    drive_id: Option<[u8; DRIVE_ID_LENGTH]>,
}

/// An unlocked (or locked) encrypted drive rooted at one real directory.
///
/// The handle is explicitly owned and passed around; nothing is
/// process-global, so multiple drives can coexist. Lifecycle transitions
/// (`create`/`open`/`close`/`set_password`) must be serialized by the
/// caller; everything else may run concurrently.
pub struct Drive {
    real_root: Box<dyn RealFile>,
    sequencer: Arc<dyn NonceSequencer>,
    state: RwLock<DriveState>,
    default_chunk_size: AtomicU32,
}

impl std::fmt::Debug for Drive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drive").finish_non_exhaustive()
    }
}

impl Drive {
    /// Create a brand-new drive at `root`. Fails if a config already
    /// exists there.
    pub fn create(
        root: Box<dyn RealFile>,
        password: &str,
        sequencer: Arc<dyn NonceSequencer>,
    ) -> VeilResult<Arc<Self>> {
        let drive = Arc::new(Self::new(root, sequencer)?);
        if drive.has_config() {
            return Err(VeilError::State("drive already exists".into()));
        }
        drive.create_config(password)?;
        drive.init_fs()?;
        info!(root = %drive.real_root.path().display(), "created drive");
        Ok(drive)
    }

    /// Open and unlock an existing drive at `root`.
    pub fn open(
        root: Box<dyn RealFile>,
        password: &str,
        sequencer: Arc<dyn NonceSequencer>,
    ) -> VeilResult<Arc<Self>> {
        let drive = Arc::new(Self::new(root, sequencer)?);
        if !drive.has_config() {
            return Err(VeilError::State("drive does not exist".into()));
        }
        drive.unlock(password)?;
        drive.init_fs()?;
        drive.ensure_sequence()?;
        info!(root = %drive.real_root.path().display(), "opened drive");
        Ok(drive)
    }

    fn new(root: Box<dyn RealFile>, sequencer: Arc<dyn NonceSequencer>) -> VeilResult<Self> {
        if !root.is_dir() {
            return Err(VeilError::State(format!(
                "drive root {} is not a directory",
                root.path().display()
            )));
        }
        Ok(Self {
            real_root: root,
            sequencer,
            state: RwLock::new(DriveState {
                key: None,
                drive_id: None,
            }),
            default_chunk_size: AtomicU32::new(DEFAULT_CHUNK_SIZE),
        })
    }

    /// True if a parseable config file is present.
    pub fn has_config(&self) -> bool {
        self.read_config().is_ok()
    }

    fn read_config(&self) -> VeilResult<DriveConfig> {
        let file = self.real_root.child(CONFIG_FILENAME);
        if !file.exists() {
            return Err(VeilError::State("no drive config".into()));
        }
        let mut stream = file.open_read()?;
        let mut bytes = Vec::new();
        std::io::Read::read_to_end(&mut stream, &mut bytes)?;
        DriveConfig::from_bytes(&bytes)
    }

    /// Write a fresh config. Reuses the unlocked key material when present
    /// (password change), otherwise generates a new drive.
    fn create_config(&self, password: &str) -> VeilResult<()> {
        let mut state = self.state.write().expect("drive state lock poisoned");

        let config_file = self.real_root.child(CONFIG_FILENAME);
        if state.key.is_none() && config_file.exists() {
            return Err(VeilError::Auth("not authorized".into()));
        }

        let mut drive_key = [0u8; KEY_LENGTH];
        let mut hash_key = [0u8; HASH_KEY_LENGTH];
        let drive_id;
        let new_drive;
        match &state.key {
            Some(key) => {
                drive_key.copy_from_slice(key.drive_key());
                hash_key.copy_from_slice(key.hash_key());
                drive_id = state.drive_id.expect("unlocked drive has an id");
                new_drive = false;
            }
            None => {
                let combined = rng::generate_combined_key();
                drive_key.copy_from_slice(&combined[..KEY_LENGTH]);
                hash_key.copy_from_slice(&combined[KEY_LENGTH..]);
                drive_id = rng::generate_drive_id();
                new_drive = true;
            }
        }

        let salt = rng::generate_salt();
        let iterations = DEFAULT_ITERATIONS;
        let iv = rng::generate_master_key_iv();
        let master = derive_master_key(password, &salt, iterations)?;

        let mut enc_data = [0u8; ENC_DATA_LENGTH];
        enc_data[..KEY_LENGTH].copy_from_slice(&drive_key);
        enc_data[KEY_LENGTH..COMBINED_KEY_LENGTH].copy_from_slice(&hash_key);
        enc_data[COMBINED_KEY_LENGTH..].copy_from_slice(&drive_id);
        transform::apply_with_iv(master.as_bytes(), &iv, &mut enc_data);

        let signature = Integrity::calculate(&hash_key, &enc_data, None);

        // replace any previous config wholesale
        if config_file.exists() {
            config_file.delete()?;
        }
        let config_file = self.real_root.create_file(CONFIG_FILENAME)?;
        let config = DriveConfig {
            salt,
            iterations,
            iv,
            enc_data,
            signature,
        };
        let mut out = config_file.open_write()?;
        std::io::Write::write_all(&mut out, &config.to_bytes())?;
        std::io::Write::flush(&mut out)?;
        drop(out);

        state.key = Some(DriveKey::new(master, drive_key, hash_key, iterations));
        state.drive_id = Some(drive_id);
        drive_key.zeroize();
        hash_key.zeroize();
        drop(state);

        if new_drive {
            let drive_hex = hex::encode(&drive_id);
            let auth_hex = hex::encode(&rng::generate_auth_id());
            self.sequencer.create_sequence(&drive_hex, &auth_hex)?;
            self.sequencer.initialize_sequence(
                &drive_hex,
                &auth_hex,
                rng::starting_nonce(),
                rng::max_nonce(),
            )?;
        }
        Ok(())
    }

    /// Change the drive password. Requires an unlocked drive; the combined
    /// key and drive id are preserved, so existing files stay readable.
    pub fn set_password(&self, new_password: &str) -> VeilResult<()> {
        {
            let state = self.state.read().expect("drive state lock poisoned");
            if state.key.is_none() {
                return Err(VeilError::Auth("drive is locked".into()));
            }
        }
        self.create_config(new_password)?;
        info!("drive password changed");
        Ok(())
    }

    fn unlock(&self, password: &str) -> VeilResult<()> {
        let config = self.read_config()?;
        let master = derive_master_key(password, &config.salt, config.iterations)?;

        let mut decrypted = config.enc_data;
        transform::apply_with_iv(master.as_bytes(), &config.iv, &mut decrypted);

        let mut drive_key = [0u8; KEY_LENGTH];
        let mut hash_key = [0u8; HASH_KEY_LENGTH];
        let mut drive_id = [0u8; DRIVE_ID_LENGTH];
        drive_key.copy_from_slice(&decrypted[..KEY_LENGTH]);
        hash_key.copy_from_slice(&decrypted[KEY_LENGTH..COMBINED_KEY_LENGTH]);
        drive_id.copy_from_slice(&decrypted[COMBINED_KEY_LENGTH..]);
        decrypted.zeroize();

        // recompute the signature with the decrypted hash key: a mismatch
        // means the password was wrong, not that the file is corrupt
        if !Integrity::signature_matches(&hash_key, &config.enc_data, &config.signature) {
            drive_key.zeroize();
            hash_key.zeroize();
            return Err(VeilError::Auth("wrong password".into()));
        }

        let mut state = self.state.write().expect("drive state lock poisoned");
        state.key = Some(DriveKey::new(
            master,
            drive_key,
            hash_key,
            config.iterations,
        ));
        state.drive_id = Some(drive_id);
        drive_key.zeroize();
        hash_key.zeroize();
        debug!(drive_id = %hex::encode(&drive_id), "drive unlocked");
        Ok(())
    }

    fn init_fs(&self) -> VeilResult<()> {
        let virtual_dir = self.real_root.child(VIRTUAL_DIR_NAME);
        if !virtual_dir.exists() {
            self.real_root.create_dir(VIRTUAL_DIR_NAME)?;
        }
        Ok(())
    }

    /// Create a `New` sequence for this drive/device pair if none exists.
    fn ensure_sequence(&self) -> VeilResult<()> {
        let drive_hex = hex::encode(&self.drive_id()?);
        if self.sequencer.get_sequence(&drive_hex)?.is_none() {
            let auth_hex = hex::encode(&rng::generate_auth_id());
            self.sequencer.create_sequence(&drive_hex, &auth_hex)?;
        }
        Ok(())
    }

    /// Lock the drive: zero all key material and forget the drive id.
    /// Subsequent operations fail as not authenticated.
    pub fn close(&self) {
        // tolerate a poisoned lock: this also runs on drop during unwind
        // and zeroing keys matters more than lock hygiene
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.key = None; // DriveKey zeroizes on drop
        state.drive_id = None;
        info!("drive closed");
    }

    pub fn is_unlocked(&self) -> bool {
        self.state
            .read()
            .expect("drive state lock poisoned")
            .key
            .is_some()
    }

    pub fn drive_id(&self) -> VeilResult<[u8; DRIVE_ID_LENGTH]> {
        self.state
            .read()
            .expect("drive state lock poisoned")
            .drive_id
            .ok_or_else(|| VeilError::Auth("drive is locked".into()))
    }

    /// Copy of the content/filename encryption key.
    pub fn drive_key(&self) -> VeilResult<[u8; KEY_LENGTH]> {
        let state = self.state.read().expect("drive state lock poisoned");
        state
            .key
            .as_ref()
            .map(|k| *k.drive_key())
            .ok_or_else(|| VeilError::Auth("drive is locked".into()))
    }

    /// Copy of the integrity hash key.
    pub fn hash_key(&self) -> VeilResult<[u8; HASH_KEY_LENGTH]> {
        let state = self.state.read().expect("drive state lock poisoned");
        state
            .key
            .as_ref()
            .map(|k| *k.hash_key())
            .ok_or_else(|| VeilError::Auth("drive is locked".into()))
    }

    /// Issue the next unique nonce for this drive on this device.
    pub fn next_nonce(&self) -> VeilResult<Nonce> {
        let drive_id = self.drive_id()?;
        self.sequencer.next_nonce(&hex::encode(&drive_id))
    }

    /// This device's authorization id for the drive, creating a `New`
    /// sequence on first use.
    pub fn auth_id(&self) -> VeilResult<String> {
        let drive_hex = hex::encode(&self.drive_id()?);
        let sequence = match self.sequencer.get_sequence(&drive_hex)? {
            Some(seq) => seq,
            None => {
                let auth_hex = hex::encode(&rng::generate_auth_id());
                self.sequencer.create_sequence(&drive_hex, &auth_hex)?;
                self.sequencer
                    .get_sequence(&drive_hex)?
                    .ok_or_else(|| VeilError::Sequence("sequence vanished after create".into()))?
            }
        };
        Ok(sequence.auth_id)
    }

    pub fn auth_id_bytes(&self) -> VeilResult<[u8; 16]> {
        let auth_hex = self.auth_id()?;
        let bytes = hex::decode(&auth_hex)?;
        bytes
            .try_into()
            .map_err(|_| VeilError::Format("auth id must be 16 bytes".into()))
    }

    /// Terminate this device's write authorization for the drive.
    pub fn revoke_authorization(&self) -> VeilResult<()> {
        let drive_hex = hex::encode(&self.drive_id()?);
        self.sequencer.revoke_sequence(&drive_hex)
    }

    /// The virtual root directory of the drive.
    pub fn root(self: &Arc<Self>) -> VeilResult<VirtualFile> {
        if !self.is_unlocked() {
            return Err(VeilError::Auth("drive is locked".into()));
        }
        let virtual_dir = self.real_root.child(VIRTUAL_DIR_NAME);
        if !virtual_dir.exists() {
            return Err(VeilError::State("virtual root is missing".into()));
        }
        Ok(VirtualFile::new(virtual_dir, Arc::clone(self)))
    }

    /// Default decrypted-export directory, created on first use.
    pub fn export_dir(&self) -> VeilResult<Box<dyn RealFile>> {
        let dir = self.real_root.child(EXPORT_DIR_NAME);
        if !dir.exists() {
            return Ok(self.real_root.create_dir(EXPORT_DIR_NAME)?);
        }
        Ok(dir)
    }

    pub fn real_root(&self) -> &dyn RealFile {
        self.real_root.as_ref()
    }

    pub fn sequencer(&self) -> &Arc<dyn NonceSequencer> {
        &self.sequencer
    }

    /// Default integrity chunk size for files created on this drive.
    pub fn default_chunk_size(&self) -> u32 {
        self.default_chunk_size.load(Ordering::Relaxed)
    }

    pub fn set_default_chunk_size(&self, chunk_size: u32) {
        self.default_chunk_size.store(chunk_size, Ordering::Relaxed);
    }
}

impl Drop for Drive {
    fn drop(&mut self) {
        // key zeroization must not depend on callers remembering close()
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::LocalFile;
    use crate::sequence::FileSequencer;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Box<dyn RealFile>, Arc<dyn NonceSequencer>) {
        let tmp = TempDir::new().unwrap();
        let vault = tmp.path().join("vault");
        std::fs::create_dir(&vault).unwrap();
        let root: Box<dyn RealFile> = Box::new(LocalFile::new(vault));
        let sequencer: Arc<dyn NonceSequencer> =
            Arc::new(FileSequencer::new(tmp.path().join("seq.json")).unwrap());
        (tmp, root, sequencer)
    }

    #[test]
    fn test_create_then_open() {
        let (_tmp, root, sequencer) = fixture();
        let drive = Drive::create(root.clone_box(), "pw1", Arc::clone(&sequencer)).unwrap();
        let id = drive.drive_id().unwrap();
        drive.close();
        drop(drive);

        let drive = Drive::open(root, "pw1", sequencer).unwrap();
        assert_eq!(drive.drive_id().unwrap(), id);
        assert!(drive.is_unlocked());
    }

    #[test]
    fn test_wrong_password_is_auth_failure() {
        let (_tmp, root, sequencer) = fixture();
        Drive::create(root.clone_box(), "right", Arc::clone(&sequencer)).unwrap();
        let err = Drive::open(root, "wrong", sequencer).unwrap_err();
        assert!(matches!(err, VeilError::Auth(_)), "got {err:?}");
    }

    #[test]
    fn test_create_refuses_existing_drive() {
        let (_tmp, root, sequencer) = fixture();
        Drive::create(root.clone_box(), "pw", Arc::clone(&sequencer)).unwrap();
        let err = Drive::create(root, "pw", sequencer).unwrap_err();
        assert!(matches!(err, VeilError::State(_)));
    }

    #[test]
    fn test_open_without_config_fails() {
        let (_tmp, root, sequencer) = fixture();
        let err = Drive::open(root, "pw", sequencer).unwrap_err();
        assert!(matches!(err, VeilError::State(_)));
    }

    #[test]
    fn test_close_locks_everything() {
        let (_tmp, root, sequencer) = fixture();
        let drive = Drive::create(root, "pw", sequencer).unwrap();
        drive.close();
        assert!(!drive.is_unlocked());
        assert!(matches!(drive.drive_id(), Err(VeilError::Auth(_))));
        assert!(matches!(drive.next_nonce(), Err(VeilError::Auth(_))));
        assert!(matches!(drive.root(), Err(VeilError::Auth(_))));
    }

    #[test]
    fn test_nonces_strictly_increase() {
        let (_tmp, root, sequencer) = fixture();
        let drive = Drive::create(root, "pw", sequencer).unwrap();
        let mut last = u64::from_be_bytes(drive.next_nonce().unwrap());
        for _ in 0..20 {
            let next = u64::from_be_bytes(drive.next_nonce().unwrap());
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_set_password_keeps_keys() {
        let (_tmp, root, sequencer) = fixture();
        let drive = Drive::create(root.clone_box(), "old", Arc::clone(&sequencer)).unwrap();
        let key_before = drive.drive_key().unwrap();
        drive.set_password("new").unwrap();
        drop(drive);

        assert!(matches!(
            Drive::open(root.clone_box(), "old", Arc::clone(&sequencer)).unwrap_err(),
            VeilError::Auth(_)
        ));
        let drive = Drive::open(root, "new", sequencer).unwrap();
        assert_eq!(drive.drive_key().unwrap(), key_before);
    }

    #[test]
    fn test_config_codec_roundtrip() {
        let config = DriveConfig {
            salt: [1u8; SALT_LENGTH],
            iterations: 4096,
            iv: [2u8; IV_LENGTH],
            enc_data: [3u8; ENC_DATA_LENGTH],
            signature: [4u8; HASH_RESULT_LENGTH],
        };
        let parsed = DriveConfig::from_bytes(&config.to_bytes()).unwrap();
        assert_eq!(parsed.salt, config.salt);
        assert_eq!(parsed.iterations, config.iterations);
        assert_eq!(parsed.iv, config.iv);
        assert_eq!(parsed.enc_data[..], config.enc_data[..]);
        assert_eq!(parsed.signature, config.signature);
    }

    #[test]
    fn test_corrupt_config_reads_as_missing_drive() {
        let (_tmp, root, sequencer) = fixture();
        Drive::create(root.clone_box(), "pw", Arc::clone(&sequencer)).unwrap();
        let config_path = root.child(CONFIG_FILENAME).path();
        let mut bytes = std::fs::read(&config_path).unwrap();
        bytes[0] ^= 0xFF;
        std::fs::write(&config_path, bytes).unwrap();
        // unparseable config reads as "no drive", not as wrong password
        let err = Drive::open(root, "pw", sequencer).unwrap_err();
        assert!(matches!(err, VeilError::State(_)));
    }
}

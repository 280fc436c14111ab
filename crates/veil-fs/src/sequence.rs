//! Nonce sequences and the file-backed sequencer.
//!
//! The sequencer is the only cross-call shared mutable resource in the
//! system: it persists, per drive and device, a monotonically advancing
//! nonce counter bounded by a maximum. Every operation re-reads the store,
//! mutates, and saves atomically (temp file + rename), so a crash can lose
//! at most an unissued nonce, never reissue one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use veil_core::{VeilError, VeilResult};
use veil_crypto::nonce::{increase_nonce, to_u64};
use veil_crypto::Nonce;

/// Lifecycle of a device's nonce sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceStatus {
    /// Created but not yet granted a range.
    New,
    /// Holds a range and can issue nonces.
    Active,
    /// Terminated; will never issue again.
    Revoked,
}

/// One device's nonce allocation for one drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceSequence {
    /// Drive id, hex.
    pub drive_id: String,
    /// Device authorization id, hex.
    pub auth_id: String,
    /// Next nonce to hand out; `None` until the sequence is initialized.
    pub next_nonce: Option<Nonce>,
    /// Exclusive ceiling; `next_nonce` never reaches past it.
    pub max_nonce: Option<Nonce>,
    pub status: SequenceStatus,
}

/// Issues unique, strictly increasing nonces per drive+device.
///
/// Implementations must be crash-durable and safe against concurrent
/// callers; `next_nonce` and `set_max_nonce` are atomic.
pub trait NonceSequencer: Send + Sync {
    /// Register a sequence for a drive/device pair. Fails if one exists.
    fn create_sequence(&self, drive_id: &str, auth_id: &str) -> VeilResult<()>;

    /// Grant a range to a created sequence; activates it. A sequence can
    /// only be initialized once (replay protection for auth imports).
    fn initialize_sequence(
        &self,
        drive_id: &str,
        auth_id: &str,
        start: Nonce,
        max: Nonce,
    ) -> VeilResult<()>;

    /// Lower the ceiling. Raising it is always an error.
    fn set_max_nonce(&self, drive_id: &str, auth_id: &str, max: Nonce) -> VeilResult<()>;

    /// Issue the next nonce and durably advance the counter.
    fn next_nonce(&self, drive_id: &str) -> VeilResult<Nonce>;

    /// Permanently terminate the drive's sequence on this device.
    fn revoke_sequence(&self, drive_id: &str) -> VeilResult<()>;

    /// The drive's live (new or active) sequence, if any.
    fn get_sequence(&self, drive_id: &str) -> VeilResult<Option<NonceSequence>>;
}

/// JSON-file-backed [`NonceSequencer`].
///
/// The store file lives outside the drive (typically in the user config
/// directory) so that exporting a vault does not export its counters.
pub struct FileSequencer {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSequencer {
    /// Open or create the sequencer store at `path`.
    pub fn new(path: PathBuf) -> VeilResult<Self> {
        let sequencer = Self {
            path,
            lock: Mutex::new(()),
        };
        if !sequencer.path.exists() {
            if let Some(parent) = sequencer.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            sequencer.save(&HashMap::new())?;
        }
        Ok(sequencer)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn load(&self) -> VeilResult<HashMap<String, NonceSequence>> {
        let contents = std::fs::read(&self.path)?;
        serde_json::from_slice(&contents)
            .map_err(|e| VeilError::Sequence(format!("corrupt sequencer store: {e}")))
    }

    fn save(&self, sequences: &HashMap<String, NonceSequence>) -> VeilResult<()> {
        let contents = serde_json::to_vec_pretty(sequences)
            .map_err(|e| VeilError::Sequence(format!("could not serialize sequences: {e}")))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// The single live sequence for a drive. Two live sequences for one
    /// drive mean the store is corrupt.
    fn find<'a>(
        sequences: &'a mut HashMap<String, NonceSequence>,
        drive_id: &str,
    ) -> VeilResult<Option<&'a mut NonceSequence>> {
        let mut found: Option<&'a mut NonceSequence> = None;
        for seq in sequences.values_mut() {
            if seq.drive_id.eq_ignore_ascii_case(drive_id)
                && matches!(seq.status, SequenceStatus::New | SequenceStatus::Active)
            {
                if found.is_some() {
                    return Err(VeilError::Sequence(
                        "corrupt sequencer store: multiple live sequences for one drive".into(),
                    ));
                }
                found = Some(seq);
            }
        }
        Ok(found)
    }
}

impl NonceSequencer for FileSequencer {
    fn create_sequence(&self, drive_id: &str, auth_id: &str) -> VeilResult<()> {
        let _guard = self.lock.lock().expect("sequencer lock poisoned");
        let mut sequences = self.load()?;
        if Self::find(&mut sequences, drive_id)?.is_some() {
            return Err(VeilError::Sequence("sequence already exists".into()));
        }
        debug!(drive_id, auth_id, "creating nonce sequence");
        sequences.insert(
            format!("{drive_id}:{auth_id}"),
            NonceSequence {
                drive_id: drive_id.to_string(),
                auth_id: auth_id.to_string(),
                next_nonce: None,
                max_nonce: None,
                status: SequenceStatus::New,
            },
        );
        self.save(&sequences)
    }

    fn initialize_sequence(
        &self,
        drive_id: &str,
        auth_id: &str,
        start: Nonce,
        max: Nonce,
    ) -> VeilResult<()> {
        let _guard = self.lock.lock().expect("sequencer lock poisoned");
        let mut sequences = self.load()?;
        let seq = Self::find(&mut sequences, drive_id)?
            .ok_or_else(|| VeilError::Sequence("sequence does not exist".into()))?;
        if seq.next_nonce.is_some() {
            return Err(VeilError::Sequence("cannot reinitialize sequence".into()));
        }
        if !seq.auth_id.eq_ignore_ascii_case(auth_id) {
            return Err(VeilError::Sequence(
                "sequence belongs to a different device".into(),
            ));
        }
        info!(
            drive_id,
            auth_id,
            start = to_u64(&start),
            max = to_u64(&max),
            "initializing nonce sequence"
        );
        seq.next_nonce = Some(start);
        seq.max_nonce = Some(max);
        seq.status = SequenceStatus::Active;
        self.save(&sequences)
    }

    fn set_max_nonce(&self, drive_id: &str, auth_id: &str, max: Nonce) -> VeilResult<()> {
        let _guard = self.lock.lock().expect("sequencer lock poisoned");
        let mut sequences = self.load()?;
        let seq = Self::find(&mut sequences, drive_id)?
            .ok_or_else(|| VeilError::Sequence("sequence does not exist".into()))?;
        if !seq.auth_id.eq_ignore_ascii_case(auth_id) {
            return Err(VeilError::Sequence(
                "sequence belongs to a different device".into(),
            ));
        }
        let current = seq
            .max_nonce
            .ok_or_else(|| VeilError::Sequence("sequence has no max nonce".into()))?;
        if to_u64(&max) > to_u64(&current) {
            return Err(VeilError::Sequence("max nonce cannot be increased".into()));
        }
        debug!(drive_id, max = to_u64(&max), "lowering max nonce");
        seq.max_nonce = Some(max);
        self.save(&sequences)
    }

    fn next_nonce(&self, drive_id: &str) -> VeilResult<Nonce> {
        let _guard = self.lock.lock().expect("sequencer lock poisoned");
        let mut sequences = self.load()?;
        let seq = Self::find(&mut sequences, drive_id)?
            .ok_or_else(|| VeilError::Sequence("device not authorized".into()))?;
        let (next, max) = match (seq.next_nonce, seq.max_nonce) {
            (Some(next), Some(max)) => (next, max),
            _ => return Err(VeilError::Sequence("device not authorized".into())),
        };
        // advance-then-save before handing the value out: a crash after the
        // save skips a nonce, a crash before it reissues nothing
        seq.next_nonce = Some(increase_nonce(&next, &max)?);
        self.save(&sequences)?;
        Ok(next)
    }

    fn revoke_sequence(&self, drive_id: &str) -> VeilResult<()> {
        let _guard = self.lock.lock().expect("sequencer lock poisoned");
        let mut sequences = self.load()?;
        let seq = Self::find(&mut sequences, drive_id)?
            .ok_or_else(|| VeilError::Sequence("sequence does not exist".into()))?;
        info!(drive_id, "revoking nonce sequence");
        seq.status = SequenceStatus::Revoked;
        self.save(&sequences)
    }

    fn get_sequence(&self, drive_id: &str) -> VeilResult<Option<NonceSequence>> {
        let _guard = self.lock.lock().expect("sequencer lock poisoned");
        let mut sequences = self.load()?;
        Ok(Self::find(&mut sequences, drive_id)?.map(|s| s.clone()))
    }
}

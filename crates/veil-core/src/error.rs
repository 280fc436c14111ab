use thiserror::Error;

pub type VeilResult<T> = Result<T, VeilError>;

/// Failure taxonomy for the whole workspace.
///
/// The security-relevant variants are deliberately distinct: a wrong
/// password is `Auth`, tampered ciphertext is `Integrity`, and an attempted
/// nonce reuse is `Security`. None of them are retried anywhere.
#[derive(Debug, Error)]
pub enum VeilError {
    /// Wrong password / key-check signature mismatch.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Attempted nonce or key reuse, overwrite without explicit opt-in.
    #[error("security violation: {0}")]
    Security(String),

    /// Per-chunk HMAC mismatch on read: data is corrupt or tampered with.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// The device exhausted its allotted nonce range. Not recoverable for
    /// this device without re-authorization.
    #[error("nonce range exceeded: {0}")]
    RangeExceeded(String),

    /// Authorization config does not match this drive or device, or the
    /// device is already authorized.
    #[error("authorization protocol error: {0}")]
    Protocol(String),

    /// Nonce sequencer state errors (missing, revoked, corrupt store).
    #[error("sequence error: {0}")]
    Sequence(String),

    /// Malformed on-disk data: bad magic, short header, undecodable name.
    #[error("format error: {0}")]
    Format(String),

    /// An operation was called in the wrong state (drive locked, importer
    /// already running, bad argument).
    #[error("invalid state: {0}")]
    State(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VeilError {
    /// Wrap into `std::io::Error` for use inside `Read`/`Write`/`Seek`
    /// implementations. Recover the original with [`VeilError::from_io`].
    pub fn into_io(self) -> std::io::Error {
        match self {
            VeilError::Io(e) => e,
            other => std::io::Error::other(other),
        }
    }

    /// Inverse of [`VeilError::into_io`]: unwraps a `VeilError` smuggled
    /// through an `std::io::Error`, or falls back to `Io`.
    pub fn from_io(err: std::io::Error) -> VeilError {
        let is_veil = err
            .get_ref()
            .is_some_and(|inner| inner.is::<VeilError>());
        if is_veil {
            let inner = err.into_inner().expect("checked above");
            *inner.downcast::<VeilError>().expect("checked above")
        } else {
            VeilError::Io(err)
        }
    }
}

impl From<VeilError> for std::io::Error {
    fn from(err: VeilError) -> Self {
        err.into_io()
    }
}

//! Device authorization: granting another device a disjoint nonce range.
//!
//! Export hands the *upper* half of the exporting device's remaining nonce
//! range to the target and shrinks its own ceiling to the pivot *before*
//! the config file leaves the machine. As long as exports happen serially,
//! no two devices' ranges can ever overlap.
//!
//! The auth config file is itself an ordinary encrypted file; its
//! decrypted payload is:
//! ```text
//! [16: drive id][16: target auth id][8: start nonce][8: max nonce]
//! ```

use std::io::Read;
use std::sync::Arc;

use tracing::info;

use veil_core::{hex, VeilError, VeilResult};
use veil_crypto::nonce::split_nonce_range;
use veil_crypto::{Nonce, AUTH_ID_LENGTH, DRIVE_ID_LENGTH, NONCE_LENGTH};

use crate::drive::Drive;
use crate::file::RealFile;
use crate::sequence::SequenceStatus;
use crate::vfile::VirtualFile;

const PAYLOAD_LENGTH: usize = DRIVE_ID_LENGTH + AUTH_ID_LENGTH + 2 * NONCE_LENGTH;

/// Decrypted contents of a device authorization file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthConfig {
    pub drive_id: [u8; DRIVE_ID_LENGTH],
    pub auth_id: [u8; AUTH_ID_LENGTH],
    pub start_nonce: Nonce,
    pub max_nonce: Nonce,
}

impl AuthConfig {
    pub fn from_bytes(bytes: &[u8]) -> VeilResult<Self> {
        if bytes.len() < PAYLOAD_LENGTH {
            return Err(VeilError::Format(format!(
                "auth config too short: {} bytes, expected {PAYLOAD_LENGTH}",
                bytes.len()
            )));
        }
        let mut offset = 0;
        let mut take = |len: usize| {
            let slice = &bytes[offset..offset + len];
            offset += len;
            slice
        };
        Ok(Self {
            drive_id: take(DRIVE_ID_LENGTH).try_into().expect("fixed slice"),
            auth_id: take(AUTH_ID_LENGTH).try_into().expect("fixed slice"),
            start_nonce: take(NONCE_LENGTH).try_into().expect("fixed slice"),
            max_nonce: take(NONCE_LENGTH).try_into().expect("fixed slice"),
        })
    }

    pub fn to_bytes(&self) -> [u8; PAYLOAD_LENGTH] {
        let mut bytes = [0u8; PAYLOAD_LENGTH];
        bytes[..DRIVE_ID_LENGTH].copy_from_slice(&self.drive_id);
        bytes[DRIVE_ID_LENGTH..DRIVE_ID_LENGTH + AUTH_ID_LENGTH].copy_from_slice(&self.auth_id);
        let nonces = DRIVE_ID_LENGTH + AUTH_ID_LENGTH;
        bytes[nonces..nonces + NONCE_LENGTH].copy_from_slice(&self.start_nonce);
        bytes[nonces + NONCE_LENGTH..].copy_from_slice(&self.max_nonce);
        bytes
    }
}

/// Export an authorization file granting `target_auth_id` (hex) the upper
/// half of this device's remaining nonce range.
///
/// Order matters: the exporter's ceiling is lowered to the pivot *before*
/// the file is written, so even a crash mid-export can only waste nonces,
/// never duplicate them.
pub fn export_auth_file(
    drive: &Arc<Drive>,
    target_auth_id: &str,
    file: Box<dyn RealFile>,
) -> VeilResult<()> {
    let drive_id = drive.drive_id()?;
    let drive_hex = hex::encode(&drive_id);

    let target_auth: [u8; AUTH_ID_LENGTH] = hex::decode(target_auth_id)?
        .try_into()
        .map_err(|_| VeilError::Format("target auth id must be 16 bytes of hex".into()))?;

    // one nonce is spent on encrypting the config file itself
    let config_nonce = drive.sequencer().next_nonce(&drive_hex)?;

    let sequence = drive
        .sequencer()
        .get_sequence(&drive_hex)?
        .ok_or_else(|| VeilError::Protocol("this device is not authorized to export".into()))?;
    let next_nonce = sequence
        .next_nonce
        .ok_or_else(|| VeilError::Sequence("sequence has no next nonce".into()))?;
    let max_nonce = sequence
        .max_nonce
        .ok_or_else(|| VeilError::Sequence("sequence has no max nonce".into()))?;

    let pivot = split_nonce_range(&next_nonce, &max_nonce)?;

    // shrink our own range first; only then may the upper half leave
    drive
        .sequencer()
        .set_max_nonce(&drive_hex, &sequence.auth_id, pivot)?;

    if file.exists() {
        file.delete()?;
    }
    let real = file
        .parent()
        .ok_or_else(|| VeilError::State("auth file has no parent directory".into()))?
        .create_file(&file.name())?;

    let config = AuthConfig {
        drive_id,
        auth_id: target_auth,
        start_nonce: pivot,
        max_nonce,
    };
    let vfile = VirtualFile::new(real, Arc::clone(drive));
    let mut stream = vfile.open_write_with(Some(config_nonce))?;
    std::io::Write::write_all(&mut stream, &config.to_bytes())?;
    drop(stream.into_inner()?);

    info!(
        target = %target_auth_id,
        start = u64::from_be_bytes(pivot),
        max = u64::from_be_bytes(max_nonce),
        "exported device authorization"
    );
    Ok(())
}

/// Import an authorization file on the target device, initializing its
/// local sequence to the received range.
pub fn import_auth_file(drive: &Arc<Drive>, file: &dyn RealFile) -> VeilResult<()> {
    let drive_id = drive.drive_id()?;
    let drive_hex = hex::encode(&drive_id);

    // replay protection: an active device must not re-import
    if let Some(sequence) = drive.sequencer().get_sequence(&drive_hex)? {
        if sequence.status == SequenceStatus::Active {
            return Err(VeilError::Protocol("device is already authorized".into()));
        }
    }

    if !file.exists() {
        return Err(VeilError::State("auth config file not found".into()));
    }

    let vfile = VirtualFile::new(file.clone_box(), Arc::clone(drive));
    let mut stream = vfile.open_read()?;
    let mut payload = Vec::new();
    stream
        .read_to_end(&mut payload)
        .map_err(VeilError::from_io)?;
    let config = AuthConfig::from_bytes(&payload)?;

    if config.drive_id != drive_id {
        return Err(VeilError::Protocol(
            "auth config was issued for a different drive".into(),
        ));
    }
    let my_auth_id = drive.auth_id_bytes()?;
    if config.auth_id != my_auth_id {
        return Err(VeilError::Protocol(
            "auth config was issued for a different device".into(),
        ));
    }

    drive.sequencer().initialize_sequence(
        &drive_hex,
        &hex::encode(&config.auth_id),
        config.start_nonce,
        config.max_nonce,
    )?;
    info!(
        start = u64::from_be_bytes(config.start_nonce),
        max = u64::from_be_bytes(config.max_nonce),
        "imported device authorization"
    );
    Ok(())
}

//! Device authorization protocol: range halving, disjointness, replay
//! protection, and mismatch rejection. Each "device" is a separate
//! sequencer store sharing one vault directory.

use std::io::{Read, Write};
use std::sync::Arc;

use tempfile::TempDir;

use veil_core::VeilError;
use veil_fs::drive::AUTH_CONFIG_FILENAME;
use veil_fs::{
    export_auth_file, import_auth_file, Drive, FileSequencer, LocalFile, NonceSequencer, RealFile,
};

struct TwoDevices {
    _tmp: TempDir,
    root: Box<dyn RealFile>,
    seq_a: Arc<dyn NonceSequencer>,
    seq_b: Arc<dyn NonceSequencer>,
    drive_a: Arc<Drive>,
    drive_b: Arc<Drive>,
}

fn two_devices() -> TwoDevices {
    let tmp = TempDir::new().unwrap();
    let vault = tmp.path().join("vault");
    std::fs::create_dir(&vault).unwrap();
    let root: Box<dyn RealFile> = Box::new(LocalFile::new(vault));

    let seq_a: Arc<dyn NonceSequencer> =
        Arc::new(FileSequencer::new(tmp.path().join("device-a.json")).unwrap());
    let seq_b: Arc<dyn NonceSequencer> =
        Arc::new(FileSequencer::new(tmp.path().join("device-b.json")).unwrap());

    let drive_a = Drive::create(root.clone_box(), "pw", Arc::clone(&seq_a)).unwrap();
    let drive_b = Drive::open(root.clone_box(), "pw", Arc::clone(&seq_b)).unwrap();

    TwoDevices {
        _tmp: tmp,
        root,
        seq_a,
        seq_b,
        drive_a,
        drive_b,
    }
}

fn range_of(seq: &Arc<dyn NonceSequencer>, drive: &Arc<Drive>) -> (u64, u64) {
    let drive_hex = veil_core::hex::encode(&drive.drive_id().unwrap());
    let sequence = seq.get_sequence(&drive_hex).unwrap().unwrap();
    (
        u64::from_be_bytes(sequence.next_nonce.unwrap()),
        u64::from_be_bytes(sequence.max_nonce.unwrap()),
    )
}

#[test]
fn second_device_cannot_write_before_authorization() {
    let devices = two_devices();
    let vault_b = devices.drive_b.root().unwrap();
    let err = vault_b.create_file("premature.txt").unwrap_err();
    assert!(matches!(err, VeilError::Sequence(_)), "got {err:?}");
}

#[test]
fn export_import_partitions_the_range() {
    let devices = two_devices();

    let (next_before, max_before) = range_of(&devices.seq_a, &devices.drive_a);

    let target_auth = devices.drive_b.auth_id().unwrap();
    let auth_file = devices.root.child(AUTH_CONFIG_FILENAME);
    export_auth_file(&devices.drive_a, &target_auth, auth_file).unwrap();

    let auth_file = devices.root.child(AUTH_CONFIG_FILENAME);
    import_auth_file(&devices.drive_b, auth_file.as_ref()).unwrap();

    let (next_a, max_a) = range_of(&devices.seq_a, &devices.drive_a);
    let (next_b, max_b) = range_of(&devices.seq_b, &devices.drive_b);

    // exporter kept the lower half, importer received the upper half
    assert!(next_a >= next_before);
    assert_eq!(max_b, max_before, "importer's ceiling is the original max");
    assert_eq!(next_b, max_a, "ranges meet exactly at the pivot");
    assert!(next_a < max_a, "exporter retains usable nonces");
    assert!(next_b < max_b, "importer receives usable nonces");

    // both devices can now write, into disjoint counter ranges
    let vault_a = devices.drive_a.root().unwrap();
    let file_a = vault_a.create_file("from-a.txt").unwrap();
    let mut out = file_a.open_write().unwrap();
    out.write_all(b"written on A").unwrap();
    out.flush().unwrap();
    drop(out);

    let vault_b = devices.drive_b.root().unwrap();
    let file_b = vault_b.create_file("from-b.txt").unwrap();
    let mut out = file_b.open_write().unwrap();
    out.write_all(b"written on B").unwrap();
    out.flush().unwrap();
    drop(out);

    let nonce_a = u64::from_be_bytes(file_a.nonce().unwrap().unwrap());
    let nonce_b = u64::from_be_bytes(file_b.nonce().unwrap().unwrap());
    assert!(nonce_a < max_a);
    assert!(nonce_b >= next_b);
    assert_ne!(nonce_a, nonce_b);

    // and each device can read what the other wrote
    let b_sees_a = vault_b.child("from-a.txt").unwrap().unwrap();
    let mut contents = Vec::new();
    b_sees_a
        .open_read()
        .unwrap()
        .read_to_end(&mut contents)
        .unwrap();
    assert_eq!(contents, b"written on A");
}

#[test]
fn reimport_on_active_device_is_rejected() {
    let devices = two_devices();
    let target_auth = devices.drive_b.auth_id().unwrap();
    let auth_file = devices.root.child(AUTH_CONFIG_FILENAME);
    export_auth_file(&devices.drive_a, &target_auth, auth_file).unwrap();

    let auth_file = devices.root.child(AUTH_CONFIG_FILENAME);
    import_auth_file(&devices.drive_b, auth_file.as_ref()).unwrap();

    let err = import_auth_file(&devices.drive_b, auth_file.as_ref()).unwrap_err();
    assert!(matches!(err, VeilError::Protocol(_)), "got {err:?}");
}

#[test]
fn auth_file_for_another_device_is_rejected() {
    let devices = two_devices();

    // device C with its own store
    let seq_c: Arc<dyn NonceSequencer> = Arc::new(
        FileSequencer::new(devices._tmp.path().join("device-c.json")).unwrap(),
    );
    let drive_c = Drive::open(devices.root.clone_box(), "pw", seq_c).unwrap();

    // authorization issued for B, presented by C
    let target_auth = devices.drive_b.auth_id().unwrap();
    let auth_file = devices.root.child(AUTH_CONFIG_FILENAME);
    export_auth_file(&devices.drive_a, &target_auth, auth_file).unwrap();

    let auth_file = devices.root.child(AUTH_CONFIG_FILENAME);
    let err = import_auth_file(&drive_c, auth_file.as_ref()).unwrap_err();
    assert!(matches!(err, VeilError::Protocol(_)), "got {err:?}");
}

#[test]
fn revoked_device_stops_writing() {
    let devices = two_devices();
    let vault_a = devices.drive_a.root().unwrap();
    vault_a.create_file("before-revoke.txt").unwrap();

    devices.drive_a.revoke_authorization().unwrap();
    let err = vault_a.create_file("after-revoke.txt").unwrap_err();
    assert!(matches!(err, VeilError::Sequence(_)));

    let drive_hex = veil_core::hex::encode(&devices.drive_a.drive_id().unwrap());
    // the revoked sequence is terminal; a live lookup finds nothing
    assert!(devices.seq_a.get_sequence(&drive_hex).unwrap().is_none());
}

#[test]
fn serial_exports_keep_halving() {
    let devices = two_devices();

    let target_auth = devices.drive_b.auth_id().unwrap();
    let auth_file = devices.root.child(AUTH_CONFIG_FILENAME);
    export_auth_file(&devices.drive_a, &target_auth, auth_file).unwrap();
    let (_, max_after_first) = range_of(&devices.seq_a, &devices.drive_a);

    // a second export (to yet another device) halves the remainder again
    let seq_d: Arc<dyn NonceSequencer> = Arc::new(
        FileSequencer::new(devices._tmp.path().join("device-d.json")).unwrap(),
    );
    let drive_d = Drive::open(devices.root.clone_box(), "pw", seq_d).unwrap();
    let target_d = drive_d.auth_id().unwrap();
    let auth_file_d = devices.root.child("auth-d.cfg");
    export_auth_file(&devices.drive_a, &target_d, auth_file_d).unwrap();

    let (_, max_after_second) = range_of(&devices.seq_a, &devices.drive_a);
    assert!(max_after_second < max_after_first);
}

//! Seekable cached reader: correctness under seek-heavy access patterns,
//! parallel refills, and buffer reuse.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use tempfile::TempDir;

use veil_fs::{Drive, FileSequencer, LocalFile, NonceSequencer, SeekableCachedReader, VirtualFile};

struct Fixture {
    _tmp: TempDir,
    _drive: Arc<Drive>,
    file: VirtualFile,
    payload: Vec<u8>,
}

fn fixture(len: usize, integrity: bool) -> Fixture {
    let tmp = TempDir::new().unwrap();
    let vault_dir = tmp.path().join("vault");
    std::fs::create_dir(&vault_dir).unwrap();
    let sequencer: Arc<dyn NonceSequencer> =
        Arc::new(FileSequencer::new(tmp.path().join("sequencer.json")).unwrap());
    let drive = Drive::create(Box::new(LocalFile::new(vault_dir)), "pw", sequencer).unwrap();
    drive.set_default_chunk_size(32 * 1024);

    let payload: Vec<u8> = (0..len).map(|i| (i * 131 % 251) as u8).collect();
    let vault = drive.root().unwrap();
    let file = vault.create_file("media.bin").unwrap();
    if integrity {
        file.set_apply_integrity(true, None, 0).unwrap();
    }
    let mut out = file.open_write().unwrap();
    // write in aligned batches
    for chunk in payload.chunks(64 * 1024) {
        out.write_all(chunk).unwrap();
    }
    out.flush().unwrap();
    drop(out);

    if integrity {
        file.set_verify_integrity(true, None).unwrap();
    }
    Fixture {
        _tmp: tmp,
        _drive: drive,
        file,
        payload,
    }
}

#[test]
fn sequential_read_matches() {
    let fx = fixture(1_000_000, true);
    let mut reader = SeekableCachedReader::open(&fx.file).unwrap();
    assert_eq!(reader.len(), fx.payload.len() as u64);

    let mut contents = Vec::new();
    reader.read_to_end(&mut contents).unwrap();
    assert_eq!(contents, fx.payload);
}

#[test]
fn seek_heavy_pattern_matches() {
    let fx = fixture(2_000_000, true);
    let mut reader = SeekableCachedReader::new(&fx.file, 3, 128 * 1024, 2, 16 * 1024).unwrap();

    // simulate a video decoder: jump around, read small windows, step
    // back a few bytes between requests
    let positions: &[u64] = &[
        0, 1_500_000, 1_499_900, 64_000, 63_990, 1_999_000, 512_345, 512_300, 7, 1_048_576,
    ];
    for &pos in positions {
        reader.seek(SeekFrom::Start(pos)).unwrap();
        let want = 4_096.min(fx.payload.len() - pos as usize);
        let mut buf = vec![0u8; want];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, fx.payload[pos as usize..pos as usize + want], "at {pos}");
    }
}

#[test]
fn parallel_streams_match_single() {
    let fx = fixture(3_000_000, true);

    let mut single = SeekableCachedReader::new(&fx.file, 3, 256 * 1024, 1, 32 * 1024).unwrap();
    let mut multi = SeekableCachedReader::new(&fx.file, 3, 256 * 1024, 4, 32 * 1024).unwrap();

    for &pos in &[0u64, 999_999, 2_500_000, 123_456] {
        let mut a = vec![0u8; 50_000];
        let mut b = vec![0u8; 50_000];
        single.seek(SeekFrom::Start(pos)).unwrap();
        single.read_exact(&mut a).unwrap();
        multi.seek(SeekFrom::Start(pos)).unwrap();
        multi.read_exact(&mut b).unwrap();
        assert_eq!(a, b, "at {pos}");
        assert_eq!(a, fx.payload[pos as usize..pos as usize + 50_000]);
    }
}

#[test]
fn works_without_integrity() {
    let fx = fixture(500_000, false);
    let mut reader = SeekableCachedReader::new(&fx.file, 2, 64 * 1024, 2, 8 * 1024).unwrap();
    reader.seek(SeekFrom::Start(250_000)).unwrap();
    let mut buf = vec![0u8; 10_000];
    reader.read_exact(&mut buf).unwrap();
    assert_eq!(buf, fx.payload[250_000..260_000]);
}

#[test]
fn reads_past_end_return_zero() {
    let fx = fixture(10_000, true);
    let mut reader = SeekableCachedReader::open(&fx.file).unwrap();
    reader.seek(SeekFrom::End(0)).unwrap();
    let mut buf = [0u8; 100];
    assert_eq!(reader.read(&mut buf).unwrap(), 0);

    reader.seek(SeekFrom::Start(9_990)).unwrap();
    let n = reader.read(&mut buf).unwrap();
    assert_eq!(n, 10);
}

#[test]
fn close_releases_and_reports_eof() {
    let fx = fixture(50_000, true);
    let mut reader = SeekableCachedReader::open(&fx.file).unwrap();
    let mut buf = [0u8; 16];
    reader.read_exact(&mut buf).unwrap();
    reader.close();
    assert_eq!(reader.read(&mut buf).unwrap(), 0);
}

#[test]
fn non_power_of_two_threads_rejected() {
    let fx = fixture(10_000, true);
    assert!(SeekableCachedReader::new(&fx.file, 3, 64 * 1024, 3, 0).is_err());
}

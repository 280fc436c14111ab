//! Integration tests for the parallel import/export engines: thread-count
//! equivalence, integrity round-trips, cancellation, and the commander's
//! batch recursion.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use veil_core::VeilError;
use veil_fs::{
    BatchImportOptions, Drive, ExportOptions, FileCommander, FileExporter, FileImporter,
    FileSequencer, ImportOptions, LocalFile, NonceSequencer, RealFile,
};

struct Fixture {
    _tmp: TempDir,
    drive: Arc<Drive>,
    outside: LocalFile,
}

fn fixture() -> Fixture {
    // log output for failing runs: RUST_LOG=debug cargo test
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let tmp = TempDir::new().unwrap();
    let vault = tmp.path().join("vault");
    std::fs::create_dir(&vault).unwrap();
    let outside_dir = tmp.path().join("outside");
    std::fs::create_dir(&outside_dir).unwrap();
    let sequencer: Arc<dyn NonceSequencer> =
        Arc::new(FileSequencer::new(tmp.path().join("sequencer.json")).unwrap());
    let drive = Drive::create(Box::new(LocalFile::new(vault)), "pw1", sequencer).unwrap();
    Fixture {
        _tmp: tmp,
        drive,
        outside: LocalFile::new(outside_dir),
    }
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn write_source(outside: &LocalFile, name: &str, content: &[u8]) -> Box<dyn RealFile> {
    let file = outside.create_file(name).unwrap();
    std::fs::write(file.path(), content).unwrap();
    file
}

#[test]
fn import_export_roundtrip_5mb_with_integrity() -> anyhow::Result<()> {
    let fx = fixture();
    let vault = fx.drive.root()?;
    let payload = patterned(5 * 1024 * 1024);
    let source = write_source(&fx.outside, "movie.bin", &payload);

    let importer = FileImporter::new(0, 2)?;
    let imported = importer
        .import_file(
            source.as_ref(),
            &vault,
            ImportOptions {
                integrity: true,
                ..Default::default()
            },
        )?
        .expect("import completed");

    // virtual size equals original length exactly, overhead hidden
    assert_eq!(imported.size()?, payload.len() as u64);
    assert_eq!(imported.chunk_size()?, 256 * 1024);
    assert!(imported.real_file().length() > payload.len() as u64);

    let exporter = FileExporter::new(0, 2)?;
    let export_dir = fx.drive.export_dir()?;
    let exported = exporter
        .export_file(
            &imported,
            export_dir.as_ref(),
            ExportOptions {
                integrity: true,
                ..Default::default()
            },
        )?
        .expect("export completed");

    assert_eq!(std::fs::read(exported.path())?, payload);
    Ok(())
}

#[test]
fn thread_counts_produce_identical_plaintext() {
    let fx = fixture();
    let vault = fx.drive.root().unwrap();
    // large enough to split across 4 workers with 256 KiB chunks
    let payload = patterned(3 * 1024 * 1024 + 12_345);

    let mut exported_bytes = Vec::new();
    for threads in [1usize, 2, 4] {
        let source = write_source(&fx.outside, &format!("src-{threads}.bin"), &payload);
        let importer = FileImporter::new(0, threads).unwrap();
        let imported = importer
            .import_file(
                source.as_ref(),
                &vault,
                ImportOptions {
                    integrity: true,
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();

        let exporter = FileExporter::new(0, threads).unwrap();
        let out_dir = fx.outside.create_dir(&format!("out-{threads}")).unwrap();
        let exported = exporter
            .export_file(
                &imported,
                out_dir.as_ref(),
                ExportOptions {
                    integrity: true,
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();
        exported_bytes.push(std::fs::read(exported.path()).unwrap());
    }

    for bytes in &exported_bytes {
        assert_eq!(bytes, &payload);
    }
}

#[test]
fn import_without_integrity_roundtrips() {
    let fx = fixture();
    let vault = fx.drive.root().unwrap();
    let payload = patterned(123_456);
    let source = write_source(&fx.outside, "plain.bin", &payload);

    let importer = FileImporter::new(0, 4).unwrap();
    let imported = importer
        .import_file(source.as_ref(), &vault, ImportOptions::default())
        .unwrap()
        .unwrap();
    assert_eq!(imported.chunk_size().unwrap(), 0);
    assert_eq!(imported.size().unwrap(), payload.len() as u64);

    let mut contents = Vec::new();
    imported
        .open_read()
        .unwrap()
        .read_to_end(&mut contents)
        .unwrap();
    assert_eq!(contents, payload);
}

#[test]
fn progress_reaches_total() {
    let fx = fixture();
    let vault = fx.drive.root().unwrap();
    let payload = patterned(2 * 1024 * 1024);
    let source = write_source(&fx.outside, "tracked.bin", &payload);

    let seen_max = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&seen_max);
    let importer = FileImporter::new(0, 2).unwrap();
    importer
        .import_file(
            source.as_ref(),
            &vault,
            ImportOptions {
                integrity: true,
                on_progress: Some(Box::new(move |done, _total| {
                    seen.fetch_max(done, Ordering::Relaxed);
                })),
                ..Default::default()
            },
        )
        .unwrap()
        .unwrap();
    assert_eq!(seen_max.load(Ordering::Relaxed), payload.len() as u64);
}

#[test]
fn delete_source_only_after_success() {
    let fx = fixture();
    let vault = fx.drive.root().unwrap();
    let payload = patterned(64 * 1024);
    let source = write_source(&fx.outside, "gone-after.bin", &payload);

    let importer = FileImporter::new(0, 1).unwrap();
    importer
        .import_file(
            source.as_ref(),
            &vault,
            ImportOptions {
                delete_source: true,
                ..Default::default()
            },
        )
        .unwrap()
        .unwrap();
    assert!(!source.exists(), "source deleted after full success");
}

#[test]
fn tampered_vault_file_fails_export_and_cleans_target() {
    let fx = fixture();
    let vault = fx.drive.root().unwrap();
    let payload = patterned(1024 * 1024);
    let source = write_source(&fx.outside, "tamper.bin", &payload);

    let importer = FileImporter::new(0, 1).unwrap();
    let imported = importer
        .import_file(
            source.as_ref(),
            &vault,
            ImportOptions {
                integrity: true,
                ..Default::default()
            },
        )
        .unwrap()
        .unwrap();

    // flip one byte in the middle of the stored ciphertext
    let stored_path = imported.real_file().path();
    let mut bytes = std::fs::read(&stored_path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0x01;
    std::fs::write(&stored_path, bytes).unwrap();

    let exporter = FileExporter::new(0, 2).unwrap();
    let out_dir = fx.outside.create_dir("tamper-out").unwrap();
    let err = exporter
        .export_file(
            &imported,
            out_dir.as_ref(),
            ExportOptions {
                integrity: true,
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, VeilError::Integrity(_)), "got {err:?}");
    assert!(
        out_dir.list().unwrap().is_empty(),
        "partial export target removed"
    );
}

#[test]
fn commander_imports_and_exports_trees() {
    let fx = fixture();
    let vault = fx.drive.root().unwrap();

    // build a small source tree
    let tree = fx.outside.create_dir("album").unwrap();
    let sub = tree.create_dir("raw").unwrap();
    let a = patterned(300_000);
    let b = patterned(70_000);
    let c = patterned(5_000);
    std::fs::write(tree.child("a.jpg").path(), &a).unwrap();
    std::fs::write(sub.child("b.raw").path(), &b).unwrap();
    std::fs::write(sub.child("c.raw").path(), &c).unwrap();

    let commander = FileCommander::new(0, 2).unwrap();
    let progress_calls = Arc::new(AtomicU64::new(0));
    let calls = Arc::clone(&progress_calls);
    let imported = commander
        .import_files(
            &[tree.clone_box()],
            &vault,
            BatchImportOptions {
                integrity: true,
                on_progress: Some(Arc::new(move |p| {
                    calls.fetch_add(1, Ordering::Relaxed);
                    assert_eq!(p.total_files, 3);
                    assert_eq!(p.total_bytes, 375_000);
                    assert!(p.bytes_processed <= p.total_bytes);
                })),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(imported.len(), 3);
    assert!(progress_calls.load(Ordering::Relaxed) > 0);

    // the tree shape survived
    let album = vault.child("album").unwrap().expect("album dir");
    let raw = album.child("raw").unwrap().expect("raw dir");
    assert_eq!(raw.child("b.raw").unwrap().unwrap().size().unwrap(), 70_000);

    // export the whole album back out and compare a leaf
    let out_dir = fx.outside.create_dir("exported").unwrap();
    let exported = commander
        .export_files(
            &[&album],
            out_dir.as_ref(),
            Default::default(),
        )
        .unwrap();
    assert_eq!(exported.len(), 3);
    let exported_b = out_dir
        .child("album")
        .child("raw")
        .child("b.raw");
    assert_eq!(std::fs::read(exported_b.path()).unwrap(), b);
}

#[test]
fn commander_search_finds_nested_names() {
    let fx = fixture();
    let vault = fx.drive.root().unwrap();
    let docs = vault.create_dir("documents").unwrap();
    docs.create_file("taxes-2025.pdf").unwrap();
    docs.create_file("notes.txt").unwrap();
    let nested = docs.create_dir("archive").unwrap();
    nested.create_file("taxes-2024.pdf").unwrap();

    let commander = FileCommander::new(0, 1).unwrap();
    let found = commander.search(&vault, "taxes").unwrap();
    let mut names: Vec<String> = found.iter().map(|f| f.name().unwrap()).collect();
    names.sort();
    assert_eq!(names, vec!["taxes-2024.pdf", "taxes-2025.pdf"]);

    let dirs = commander.search(&vault, "archive").unwrap();
    assert_eq!(dirs.len(), 1);
    assert!(dirs[0].is_dir());
}

#[test]
fn commander_auto_renames_on_collision() {
    let fx = fixture();
    let vault = fx.drive.root().unwrap();
    let payload = patterned(10_000);
    let source = write_source(&fx.outside, "dup.bin", &payload);

    let commander = FileCommander::new(0, 1).unwrap();
    let options = || BatchImportOptions {
        auto_rename: true,
        ..Default::default()
    };
    commander
        .import_files(&[source.clone_box()], &vault, options())
        .unwrap();
    let renamed = commander
        .import_files(&[source.clone_box()], &vault, options())
        .unwrap();

    assert_eq!(renamed.len(), 1);
    let new_name = renamed[0].name().unwrap();
    assert_ne!(new_name, "dup.bin");
    assert!(new_name.starts_with("dup"), "{new_name}");
    assert_eq!(vault.list().unwrap().len(), 2);

    // the renamed copy decrypts to the same bytes
    let mut contents = Vec::new();
    renamed[0]
        .open_read()
        .unwrap()
        .read_to_end(&mut contents)
        .unwrap();
    assert_eq!(contents, payload);

    // batch delete clears both
    let listed = vault.list().unwrap();
    let refs: Vec<&veil_fs::VirtualFile> = listed.iter().collect();
    commander.delete_files(&refs, None).unwrap();
    assert!(vault.list().unwrap().is_empty());
}

#[test]
fn second_import_on_same_importer_waits_for_first() {
    // one importer instance permits one operation at a time; a second
    // sequential call must succeed once the first finished
    let fx = fixture();
    let vault = fx.drive.root().unwrap();
    let importer = FileImporter::new(0, 2).unwrap();
    for i in 0..3 {
        let source = write_source(&fx.outside, &format!("seq-{i}.bin"), &patterned(50_000));
        importer
            .import_file(source.as_ref(), &vault, ImportOptions::default())
            .unwrap()
            .unwrap();
    }
    assert_eq!(vault.list().unwrap().len(), 3);
}

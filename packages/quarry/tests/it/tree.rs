//! File-tree import/export behavior against a live store.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use quarry::{
    cas::{ContentStore, MemoryStore},
    tree::{
        self, ExportOptions, ImportOptions, ImportPhase, ImportProgress, Parsed,
        WireFormat,
    },
};
use tempfile::TempDir;

use crate::{memory_store, patterned_bytes};

fn write_fixture(dir: &std::path::Path) {
    std::fs::create_dir_all(dir.join("src/nested")).unwrap();
    std::fs::create_dir_all(dir.join("empty")).unwrap();
    std::fs::write(dir.join("README.md"), b"hello quarry\n").unwrap();
    std::fs::write(dir.join("src/main.rs"), b"fn main() {}\n").unwrap();
    std::fs::write(dir.join("src/nested/data.bin"), patterned_bytes(4096, 7)).unwrap();

    let tool = dir.join("src/tool.sh");
    std::fs::write(&tool, b"#!/bin/sh\nexit 0\n").unwrap();
    let mut permissions = std::fs::metadata(&tool).unwrap().permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&tool, permissions).unwrap();

    std::os::unix::fs::symlink("README.md", dir.join("link.md")).unwrap();
}

async fn import_fixture(store: &MemoryStore, dir: &std::path::Path) -> quarry::DataId {
    let progress = ImportProgress::new();
    let options = ImportOptions::default();
    let root = tree::import(store, dir, &options, Arc::clone(&progress))
        .await
        .expect("import fixture");
    assert_eq!(progress.phase(), ImportPhase::ImportSucceeded);
    root
}

#[test_log::test(tokio::test)]
async fn import_export_round_trip() {
    let store = memory_store();
    let source = TempDir::new().unwrap();
    write_fixture(source.path());

    let root = import_fixture(&store, source.path()).await;

    let dest = TempDir::new().unwrap();
    tree::export(store.as_ref(), &root, dest.path(), &ExportOptions::default())
        .await
        .expect("export fixture");

    for file in [
        "README.md",
        "src/main.rs",
        "src/nested/data.bin",
        "src/tool.sh",
    ] {
        let original = std::fs::read(source.path().join(file)).unwrap();
        let exported = std::fs::read(dest.path().join(file)).unwrap();
        assert_eq!(original, exported, "bytes differ for {file}");
    }

    // Executable bit survives.
    let mode = std::fs::metadata(dest.path().join("src/tool.sh"))
        .unwrap()
        .permissions()
        .mode();
    assert_ne!(mode & 0o111, 0, "tool.sh lost its executable bit");
    let mode = std::fs::metadata(dest.path().join("README.md"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o111, 0, "README.md gained an executable bit");

    // Symlink target survives verbatim.
    let target = std::fs::read_link(dest.path().join("link.md")).unwrap();
    assert_eq!(target.to_str(), Some("README.md"));

    // Directory structure, including the empty directory.
    assert!(dest.path().join("empty").is_dir());
    assert!(dest.path().join("src/nested").is_dir());
}

#[test_log::test(tokio::test)]
async fn chunked_import_has_expected_shape() {
    let store = memory_store();
    let source = TempDir::new().unwrap();
    let payload = patterned_bytes(9 * 1024 * 1024, 42);
    std::fs::write(source.path().join("big.bin"), &payload).unwrap();

    let chunk_size = 8 * 1024 * 1024;
    let options = ImportOptions::builder().chunk_size(chunk_size).build();
    let root = tree::import(store.as_ref(), source.path(), &options, ImportProgress::new())
        .await
        .unwrap();

    // The outer file object carries exactly two chunk refs.
    let (entry, file_id) = tree::lookup(store.as_ref(), &root, "big.bin")
        .await
        .unwrap()
        .expect("big.bin present");
    assert_eq!(entry.size, payload.len() as u64);
    let object = store.get(&file_id).await.unwrap().unwrap();
    assert_eq!(object.refs.len(), 2);
    let Parsed::File(blob) = tree::parse(&file_id, &object, entry.kind).unwrap() else {
        panic!("expected chunked file");
    };

    // All three objects are present in the store.
    assert!(store.contains(&file_id).await.unwrap());
    for chunk in object.refs.iter() {
        assert!(store.contains(chunk).await.unwrap());
    }

    // Ranged reads splice across the chunk boundary.
    let boundary = chunk_size as usize;
    let spliced = blob
        .read(store.as_ref(), chunk_size - 8, 16)
        .await
        .unwrap();
    assert_eq!(spliced, &payload[boundary - 8..boundary + 8]);

    // Export reproduces the original bytes exactly.
    let dest = TempDir::new().unwrap();
    tree::export(store.as_ref(), &root, dest.path(), &ExportOptions::default())
        .await
        .unwrap();
    let exported = std::fs::read(dest.path().join("big.bin")).unwrap();
    assert_eq!(exported.len(), payload.len());
    assert_eq!(exported, payload);
}

#[test_log::test(tokio::test)]
async fn compressed_wire_format_round_trips() {
    let store = memory_store();
    let source = TempDir::new().unwrap();
    // Repetitive content compresses well and exceeds the 1 KiB floor.
    let payload = b"the quick brown fox jumps over the lazy dog\n".repeat(512);
    std::fs::write(source.path().join("corpus.txt"), &payload).unwrap();

    let options = ImportOptions::builder()
        .wire_format(WireFormat::Compressed)
        .build();
    let root = tree::import(store.as_ref(), source.path(), &options, ImportProgress::new())
        .await
        .unwrap();

    // The stored file goes through a zstd wrapper chunk.
    let (entry, file_id) = tree::lookup(store.as_ref(), &root, "corpus.txt")
        .await
        .unwrap()
        .unwrap();
    let object = store.get(&file_id).await.unwrap().unwrap();
    assert_eq!(object.refs.len(), 1, "single compressed chunk expected");
    let Parsed::File(blob) = tree::parse(&file_id, &object, entry.kind).unwrap() else {
        panic!("expected file");
    };
    assert_eq!(blob.read_all(store.as_ref()).await.unwrap(), payload);

    let dest = TempDir::new().unwrap();
    tree::export(store.as_ref(), &root, dest.path(), &ExportOptions::default())
        .await
        .unwrap();
    assert_eq!(std::fs::read(dest.path().join("corpus.txt")).unwrap(), payload);
}

#[test_log::test(tokio::test)]
async fn import_filter_prunes_subtrees() {
    let store = memory_store();
    let source = TempDir::new().unwrap();
    std::fs::create_dir_all(source.path().join("keep")).unwrap();
    std::fs::create_dir_all(source.path().join("drop")).unwrap();
    std::fs::write(source.path().join("keep/a.txt"), b"a").unwrap();
    std::fs::write(source.path().join("drop/b.txt"), b"b").unwrap();

    let options = ImportOptions::builder()
        .filter(Arc::new(|path: &str| !path.starts_with("/drop")))
        .build();
    let root = tree::import(store.as_ref(), source.path(), &options, ImportProgress::new())
        .await
        .unwrap();

    assert!(
        tree::lookup(store.as_ref(), &root, "keep/a.txt")
            .await
            .unwrap()
            .is_some()
    );
    assert!(
        tree::lookup(store.as_ref(), &root, "drop")
            .await
            .unwrap()
            .is_none()
    );
}

#[test_log::test(tokio::test)]
async fn deduplicated_content_is_stored_once() {
    let store = memory_store();
    let source = TempDir::new().unwrap();
    std::fs::write(source.path().join("one.txt"), b"same bytes").unwrap();
    std::fs::write(source.path().join("two.txt"), b"same bytes").unwrap();

    let root = import_fixture(&store, source.path()).await;
    let (_, one) = tree::lookup(store.as_ref(), &root, "one.txt")
        .await
        .unwrap()
        .unwrap();
    let (_, two) = tree::lookup(store.as_ref(), &root, "two.txt")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(one, two, "equal content must share one object");
}

//! Integration test: snapshot then restore reproduces the store.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use vcp_core::types::{ReleaseDescriptor, SNAPSHOT_RELEASE_KEY};
use vcp_core::ObjectStorage;
use vcp_snapshot::{restore_snapshot, write_snapshot, MemoryStore, SnapshotRestorer};
use vcp_storage::FileStore;

fn release(version: &str) -> ReleaseDescriptor {
    ReleaseDescriptor {
        release_name: "team-a".to_string(),
        release_namespace: "vcp-team-a".to_string(),
        chart_name: "vcp".to_string(),
        chart_version: version.to_string(),
        values: b"controlPlane:\n  distro: k8s\n".to_vec(),
    }
}

fn sample_store() -> MemoryStore {
    let mut records: Vec<(Vec<u8>, Vec<u8>)> = (0..250)
        .map(|i| {
            (
                format!("/registry/configmaps/default/cm-{i:04}").into_bytes(),
                format!("value-{i}").into_bytes(),
            )
        })
        .collect();
    records.push((b"/registry/secrets/kube-system/binary".to_vec(), vec![0, 159, 146, 150, 255]));
    records.push((format!("/registry/long/{}", "k".repeat(180)).into_bytes(), b"long".to_vec()));
    records.push((b"/registry/empty".to_vec(), Vec::new()));
    MemoryStore::from_records(records)
}

/// Archive entry names in order, read with a plain tar reader.
fn archive_entries(path: &std::path::Path, compressed: bool) -> Vec<(Vec<u8>, Vec<u8>)> {
    let file = std::fs::File::open(path).unwrap();
    let reader: Box<dyn Read> = if compressed {
        Box::new(flate2::read::GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut archive = tar::Archive::new(reader);
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let name = entry.path_bytes().into_owned();
            let mut data = Vec::new();
            entry.read_to_end(&mut data).unwrap();
            (name, data)
        })
        .collect()
}

async fn roundtrip(compress: bool) {
    let tmp = tempfile::TempDir::new().unwrap();
    let source = sample_store();
    let expected = source.dump().await;
    let sink: Arc<dyn ObjectStorage> = Arc::new(FileStore::new(tmp.path().join("snap.tar")));
    let cancel = CancellationToken::new();

    let report = write_snapshot(Arc::new(source), Arc::clone(&sink), compress, None, &cancel)
        .await
        .unwrap();
    assert_eq!(report.keys, expected.len() as u64);

    let target = MemoryStore::new();
    let restored = restore_snapshot(sink, Arc::new(target.clone()), &cancel)
        .await
        .unwrap();
    assert_eq!(restored.restored, expected.len() as u64);
    assert!(restored.release.is_none());
    assert_eq!(target.dump().await, expected);
}

#[tokio::test]
async fn test_roundtrip_compressed() {
    roundtrip(true).await;
}

#[tokio::test]
async fn test_roundtrip_uncompressed() {
    roundtrip(false).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_roundtrip_multi_thread_runtime() {
    roundtrip(true).await;
}

#[tokio::test]
async fn test_release_entry_first_and_not_replayed() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("team-a.tar.gz");
    let source = MemoryStore::from_records([("/a", "1"), ("/b", "2")]);
    let sink: Arc<dyn ObjectStorage> = Arc::new(FileStore::new(&path));
    let cancel = CancellationToken::new();

    let report = write_snapshot(
        Arc::new(source),
        Arc::clone(&sink),
        true,
        Some(release("v1.2.3")),
        &cancel,
    )
    .await
    .unwrap();
    assert_eq!(report.keys, 2);
    assert_eq!(report.target, format!("container://{}", path.display()));

    let entries = archive_entries(&path, true);
    let names: Vec<&[u8]> = entries.iter().map(|(name, _)| name.as_slice()).collect();
    assert_eq!(names, vec![SNAPSHOT_RELEASE_KEY.as_bytes(), &b"/a"[..], &b"/b"[..]]);
    assert_eq!(
        ReleaseDescriptor::from_json(&entries[0].1).unwrap().chart_version,
        "v1.2.3"
    );

    let target = MemoryStore::new();
    let restored = restore_snapshot(sink, Arc::new(target.clone()), &cancel)
        .await
        .unwrap();
    assert_eq!(restored.restored, 2);
    assert_eq!(restored.release, Some(release("v1.2.3")));

    let expected: BTreeMap<Vec<u8>, Vec<u8>> = [
        (b"/a".to_vec(), b"1".to_vec()),
        (b"/b".to_vec(), b"2".to_vec()),
    ]
    .into_iter()
    .collect();
    assert_eq!(target.dump().await, expected);
}

#[tokio::test]
async fn test_literal_release_key_in_store_is_kept() {
    let tmp = tempfile::TempDir::new().unwrap();
    let source = MemoryStore::from_records([("/a", "1"), ("/release", "v0.9.0")]);
    let sink: Arc<dyn ObjectStorage> = Arc::new(FileStore::new(tmp.path().join("snap.tar.gz")));
    let cancel = CancellationToken::new();

    write_snapshot(Arc::new(source.clone()), Arc::clone(&sink), true, Some(release("v1.2.3")), &cancel)
        .await
        .unwrap();

    let target = MemoryStore::new();
    let restored = restore_snapshot(sink, Arc::new(target.clone()), &cancel)
        .await
        .unwrap();
    assert_eq!(restored.release.unwrap().chart_version, "v1.2.3");
    assert_eq!(target.dump().await, source.dump().await);
}

#[tokio::test]
async fn test_empty_store_roundtrip() {
    let tmp = tempfile::TempDir::new().unwrap();
    let sink: Arc<dyn ObjectStorage> = Arc::new(FileStore::new(tmp.path().join("empty.tar")));
    let cancel = CancellationToken::new();

    let report = write_snapshot(Arc::new(MemoryStore::new()), Arc::clone(&sink), false, None, &cancel)
        .await
        .unwrap();
    assert_eq!(report.keys, 0);
    // end-of-archive marker only
    assert_eq!(std::fs::metadata(tmp.path().join("empty.tar")).unwrap().len() % 512, 0);

    let target = MemoryStore::new();
    let restored = restore_snapshot(sink, Arc::new(target.clone()), &cancel)
        .await
        .unwrap();
    assert_eq!(restored.restored, 0);
    assert!(target.is_empty().await);
}

#[tokio::test]
async fn test_restore_missing_snapshot() {
    let tmp = tempfile::TempDir::new().unwrap();
    let sink: Arc<dyn ObjectStorage> = Arc::new(FileStore::new(tmp.path().join("missing.tar")));
    let result = restore_snapshot(sink, Arc::new(MemoryStore::new()), &CancellationToken::new()).await;
    assert!(matches!(result, Err(vcp_core::VcpError::NotFound { .. })));
}

#[tokio::test]
async fn test_new_cluster_restore_drops_source_cluster_keys() {
    let tmp = tempfile::TempDir::new().unwrap();
    let sink: Arc<dyn ObjectStorage> = Arc::new(FileStore::new(tmp.path().join("snap.tar.gz")));
    let cancel = CancellationToken::new();
    let source = MemoryStore::from_records([
        ("/registry/pods/default/web", "pod"),
        ("/registry/configmaps/default/kube-root-ca.crt", "old ca"),
        ("/registry/configmaps/default/app", "config"),
        ("/vcp/mappings/secrets/default/token", "mapping"),
    ]);
    write_snapshot(Arc::new(source), Arc::clone(&sink), true, Some(release("v1.2.3")), &cancel)
        .await
        .unwrap();

    let target = MemoryStore::new();
    let report = SnapshotRestorer::new(Arc::clone(&sink), Arc::new(target.clone()))
        .new_cluster(true)
        .restore(&cancel)
        .await
        .unwrap();
    assert_eq!(report.restored, 2);
    assert_eq!(report.skipped, 2);
    let keys: Vec<Vec<u8>> = target.dump().await.into_keys().collect();
    assert_eq!(
        keys,
        vec![
            b"/registry/configmaps/default/app".to_vec(),
            b"/registry/pods/default/web".to_vec(),
        ]
    );

    // the same archive restored in place keeps every key
    let in_place = MemoryStore::new();
    let report = restore_snapshot(sink, Arc::new(in_place.clone()), &cancel)
        .await
        .unwrap();
    assert_eq!(report.restored, 4);
    assert_eq!(report.skipped, 0);
}

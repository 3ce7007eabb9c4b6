// ContentStore behaviour on a real temporary directory.

use std::time::{Duration, Instant};

use relay_proxy_engine::engine::store::{ContentStore, Fingerprint};
use relay_proxy_engine::{ContentMetadata, EngineConfig, EngineError};

const PNG_HEADER: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

fn config(dir: &std::path::Path) -> EngineConfig {
    EngineConfig {
        content_dir: dir.to_string_lossy().into_owned(),
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn test_put_and_get_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = ContentStore::open(&config(dir.path())).unwrap();

    let fp = store
        .put(b"hello world", ContentMetadata::default())
        .await
        .unwrap();
    assert_eq!(fp, Fingerprint::of(b"hello world"));
    assert_eq!(
        fp.as_str(),
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
    );

    let path = store.path_for(&fp);
    assert!(path.starts_with(dir.path().join("b9")));
    assert!(path.exists());

    let bytes = store.get(&fp).await.unwrap();
    assert_eq!(&bytes[..], b"hello world");
    assert_eq!(store.stored_bytes(), 11);

    let content = store.metadata(&fp).unwrap();
    assert_eq!(content.media_type, "text/plain");
    assert_eq!(content.display_name, format!("file_{}.txt", fp.short()));
}

/// Storing identical bytes twice keeps a single entry.
#[tokio::test]
async fn test_put_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = ContentStore::open(&config(dir.path())).unwrap();

    let meta = ContentMetadata {
        display_name: Some("uploads/a.txt".to_string()),
        media_type: Some("text/plain".to_string()),
    };
    let first = store.put(b"same", meta.clone()).await.unwrap();
    let second = store.put(b"same", ContentMetadata::default()).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(store.len(), 1);
    assert_eq!(store.stored_bytes(), 4);
    assert_eq!(store.metadata(&first).unwrap().display_name, "a.txt");
}

/// A generic declared type is replaced by the sniffed one.
#[tokio::test]
async fn test_generic_media_type_is_corrected() {
    let dir = tempfile::tempdir().unwrap();
    let store = ContentStore::open(&config(dir.path())).unwrap();

    let meta = ContentMetadata {
        display_name: None,
        media_type: Some("application/octet-stream".to_string()),
    };
    let fp = store.put(PNG_HEADER, meta).await.unwrap();
    let content = store.metadata(&fp).unwrap();
    assert_eq!(content.media_type, "image/png");
    assert_eq!(content.display_name, format!("file_{}.png", fp.short()));
}

/// Files written by a previous run are indexed again on open.
#[tokio::test]
async fn test_reopen_reindexes_existing_files() {
    let dir = tempfile::tempdir().unwrap();
    let fp = {
        let store = ContentStore::open(&config(dir.path())).unwrap();
        store.put(PNG_HEADER, ContentMetadata::default()).await.unwrap()
    };
    let shard = dir.path().join(&fp.as_str()[..2]);
    std::fs::write(shard.join(format!("{}.tmp-leftover", fp)), b"partial").unwrap();

    let store = ContentStore::open(&config(dir.path())).unwrap();
    assert!(store.contains(&fp));
    assert_eq!(store.stored_bytes(), PNG_HEADER.len() as u64);
    assert_eq!(store.metadata(&fp).unwrap().media_type, "image/png");
    assert!(!shard.join(format!("{}.tmp-leftover", fp)).exists());
}

/// Bytes altered on disk are refused on read.
#[tokio::test]
async fn test_corrupted_file_fails_integrity_check() {
    let dir = tempfile::tempdir().unwrap();
    let store = ContentStore::open(&config(dir.path())).unwrap();
    let fp = store.put(b"original", ContentMetadata::default()).await.unwrap();

    std::fs::write(store.path_for(&fp), b"tampered").unwrap();
    let err = store.get(&fp).await.unwrap_err();
    assert!(matches!(err, EngineError::ContentIntegrity { .. }), "got {}", err);

    let missing = Fingerprint::of(b"never stored");
    assert!(matches!(
        store.get(&missing).await.unwrap_err(),
        EngineError::ContentNotFound { .. }
    ));
}

/// The most recently used entries survive a sweep regardless of age.
#[tokio::test]
async fn test_sweep_evicts_old_entries_beyond_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = EngineConfig {
        content_ttl_ms: 1_000,
        content_capacity: 1,
        ..config(dir.path())
    };
    let store = ContentStore::open(&cfg).unwrap();

    let old = store.put(b"old", ContentMetadata::default()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let recent = store.put(b"recent", ContentMetadata::default()).await.unwrap();

    assert!(store.sweep(Instant::now()).is_empty());

    let later = Instant::now() + Duration::from_secs(5);
    assert_eq!(store.sweep(later), vec![old.clone()]);
    assert!(!store.contains(&old));
    assert!(!store.path_for(&old).exists());
    assert!(store.contains(&recent));
    assert_eq!(store.stored_bytes(), 6);
}

/// Download grants are single-use and bound to one fingerprint.
#[tokio::test]
async fn test_grants_are_one_time() {
    let dir = tempfile::tempdir().unwrap();
    let store = ContentStore::open(&config(dir.path())).unwrap();
    let fp = store.put(b"granted", ContentMetadata::default()).await.unwrap();
    let other = store.put(b"other", ContentMetadata::default()).await.unwrap();

    let token = store.grant(&fp);
    assert!(!store.redeem(&other, &token));
    let token = store.grant(&fp);
    assert!(store.redeem(&fp, &token));
    assert!(!store.redeem(&fp, &token));

    let revoked = store.grant(&fp);
    store.revoke(&revoked);
    assert!(!store.redeem(&fp, &revoked));
}

#[tokio::test]
async fn test_remove_and_list() {
    let dir = tempfile::tempdir().unwrap();
    let store = ContentStore::open(&config(dir.path())).unwrap();
    let a = store.put(b"a-bytes", ContentMetadata::default()).await.unwrap();
    let b = store.put(b"b-bytes", ContentMetadata::default()).await.unwrap();

    let page = store.list(10, None).unwrap();
    assert_eq!(page.files.len(), 2);
    assert!(page.next_page_token.is_none());
    assert!(store.list(10, Some("not-a-number")).is_err());

    assert!(store.remove(&a).await.unwrap());
    assert!(!store.remove(&a).await.unwrap());
    let page = store.list(10, None).unwrap();
    assert_eq!(page.files.len(), 1);
    assert_eq!(page.files[0].sha256, b);
    assert_eq!(page.files[0].name, format!("files/{}", b));
}

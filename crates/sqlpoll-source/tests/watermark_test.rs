//! Integration tests for the status file backed watermark store

use sqlpoll_source::config::SourceConfig;
use sqlpoll_source::error::SourceError;
use sqlpoll_source::watermark::{Watermark, WatermarkStore};
use std::collections::HashMap;
use std::path::Path;
use tempfile::tempdir;

fn config(dir: &Path, extra: &[(&str, &str)]) -> SourceConfig {
    let mut props: HashMap<String, String> = HashMap::new();
    props.insert("statusFileName".into(), "source.status".into());
    props.insert("statusFilePath".into(), dir.display().to_string());
    props.insert("connectionURL".into(), "postgres://localhost/db".into());
    props.insert("queryTemplate".into(), "SELECT * FROM t WHERE id > $@$".into());
    for (k, v) in extra {
        props.insert(k.to_string(), v.to_string());
    }
    SourceConfig::from_properties(&props).unwrap()
}

#[tokio::test]
async fn test_open_creates_directory() {
    let root = tempdir().unwrap();
    let dir = root.path().join("nested").join("state");
    assert!(!dir.exists());

    let store = WatermarkStore::open(&config(&dir, &[]), "orders")
        .await
        .unwrap();

    assert!(dir.is_dir());
    assert!(!store.path().exists());
    assert_eq!(store.source_name(), "orders");
}

#[tokio::test]
async fn test_initial_value_defaults() {
    let dir = tempdir().unwrap();
    let store = WatermarkStore::open(&config(dir.path(), &[]), "s")
        .await
        .unwrap();
    assert_eq!(store.current_value().as_str(), "0");

    let store = WatermarkStore::open(&config(dir.path(), &[("initialWatermark", "500")]), "s")
        .await
        .unwrap();
    assert_eq!(store.current_value().as_str(), "500");
}

#[tokio::test]
async fn test_persist_creates_file_and_roundtrips() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), &[]);

    let mut store = WatermarkStore::open(&cfg, "s").await.unwrap();
    store.advance(Watermark::new("10"));
    store.persist().await.unwrap();
    assert!(store.path().exists());

    let reopened = WatermarkStore::open(&cfg, "s").await.unwrap();
    assert_eq!(reopened.current_value().as_str(), "10");
}

#[tokio::test]
async fn test_persisted_value_beats_configured_default() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("source.status"), "2015-01-01\n").unwrap();

    let store = WatermarkStore::open(&config(dir.path(), &[("initialWatermark", "1999-12-31")]), "s")
        .await
        .unwrap();
    assert_eq!(store.current_value().as_str(), "2015-01-01");
}

#[tokio::test]
async fn test_advance_without_persist_is_not_durable() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), &[]);

    let mut store = WatermarkStore::open(&cfg, "s").await.unwrap();
    store.advance(Watermark::new("99"));
    assert!(store.is_dirty());
    drop(store);

    let reopened = WatermarkStore::open(&cfg, "s").await.unwrap();
    assert_eq!(reopened.current_value().as_str(), "0");
}

#[tokio::test]
async fn test_load_missing_file() {
    let dir = tempdir().unwrap();
    let store = WatermarkStore::open(&config(dir.path(), &[]), "s")
        .await
        .unwrap();
    assert_eq!(store.load().await.unwrap(), None);
}

#[tokio::test]
async fn test_malformed_status_files() {
    let cases: [(&str, &[u8]); 4] = [
        ("empty", b""),
        ("blank", b"   \n"),
        ("multi-line", b"10\n20\n"),
        ("binary", &[0xff, 0xfe, 0x00]),
    ];

    for (label, contents) in cases {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("source.status"), contents).unwrap();

        let err = WatermarkStore::open(&config(dir.path(), &[]), "s")
            .await
            .unwrap_err();
        assert!(
            matches!(err, SourceError::MalformedStatus { .. }),
            "{}: {:?}",
            label,
            err
        );
        assert!(err.is_storage());
    }
}

#[tokio::test]
async fn test_unreadable_status_path() {
    let dir = tempdir().unwrap();
    // a directory where the file should be
    std::fs::create_dir(dir.path().join("source.status")).unwrap();

    let err = WatermarkStore::open(&config(dir.path(), &[]), "s")
        .await
        .unwrap_err();
    assert!(matches!(err, SourceError::Storage { .. }));
}

#[tokio::test]
async fn test_persist_recreates_missing_directory() {
    let root = tempdir().unwrap();
    let dir = root.path().join("state");
    let mut store = WatermarkStore::open(&config(&dir, &[]), "s")
        .await
        .unwrap();

    std::fs::remove_dir_all(&dir).unwrap();
    store.advance(Watermark::new("3"));
    store.persist().await.unwrap();

    assert_eq!(std::fs::read_to_string(dir.join("source.status")).unwrap(), "3\n");
}

#[tokio::test]
async fn test_failed_persist_keeps_value_and_cleans_up() {
    let root = tempdir().unwrap();
    let dir = root.path().join("state");
    let mut store = WatermarkStore::open(&config(&dir, &[]), "s")
        .await
        .unwrap();

    // the status file path is occupied by a non-empty directory, so the rename fails
    std::fs::create_dir_all(dir.join("source.status").join("child")).unwrap();
    store.advance(Watermark::new("42"));

    let err = store.persist().await.unwrap_err();
    assert!(err.is_storage());
    assert_eq!(store.current_value().as_str(), "42");
    assert!(store.is_dirty());
    assert!(!dir.join("source.status.tmp").exists());
}

#[tokio::test]
async fn test_overwrite_keeps_single_line() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), &[]);
    let mut store = WatermarkStore::open(&cfg, "s").await.unwrap();

    for value in ["1", "22", "333"] {
        store.advance(Watermark::new(value));
        store.persist().await.unwrap();
    }

    assert_eq!(
        std::fs::read_to_string(dir.path().join("source.status")).unwrap(),
        "333\n"
    );
}

#[tokio::test]
async fn test_surrounding_whitespace_roundtrips() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), &[]);

    let mut store = WatermarkStore::open(&cfg, "s").await.unwrap();
    store.advance(Watermark::new(" abc "));
    store.persist().await.unwrap();

    let reopened = WatermarkStore::open(&cfg, "s").await.unwrap();
    assert_eq!(reopened.current_value().as_str(), " abc ");
}

#[tokio::test]
async fn test_multi_line_watermark_is_refused_before_writing() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path(), &[]);

    let mut store = WatermarkStore::open(&cfg, "s").await.unwrap();
    store.advance(Watermark::new("7"));
    store.persist().await.unwrap();

    for value in ["line1\nline2", "trailing\r", "  "] {
        store.advance(Watermark::new(value));
        let err = store.persist().await.unwrap_err();
        assert!(matches!(err, SourceError::MalformedStatus { .. }), "{:?}", value);
        assert_eq!(store.current_value().as_str(), value);
        assert!(store.is_dirty());
    }

    // the last good value is still on disk and the source can restart
    let reopened = WatermarkStore::open(&cfg, "s").await.unwrap();
    assert_eq!(reopened.current_value().as_str(), "7");
    assert!(!dir.path().join("source.status.tmp").exists());
}

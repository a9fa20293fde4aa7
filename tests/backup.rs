//! Backup and restore over async streams.

use livestore::{
    read_records, Meta, MetaPatch, Snapshot, Store, StoreConfig, StoreError, Timestamp,
};
use serde_json::{json, Value};
use std::io;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::io::Builder;

fn permanent_store(data: Value, meta: Vec<(&str, Meta)>) -> Store {
    Store::from_snapshot(
        StoreConfig {
            permanent: true,
            ..Default::default()
        },
        Snapshot {
            data: data.as_object().cloned().unwrap_or_default(),
            meta: meta
                .into_iter()
                .map(|(path, meta)| (path.to_string(), meta))
                .collect(),
        },
    )
}

// --- Reading ---

#[tokio::test]
async fn test_read_tolerates_chunk_boundaries() {
    let mut stream = Builder::new()
        .read(b"[]\n\"more")
        .read(b" data\"\n\n{\"a\"")
        .read(b":1}")
        .build();

    let mut records = Vec::new();
    let count = read_records(&mut stream, |value| records.push(value))
        .await
        .unwrap();

    assert_eq!(count, 3);
    assert_eq!(records, vec![json!([]), json!("more data"), json!({"a": 1})]);
}

#[tokio::test]
async fn test_restore_replaces_contents() {
    let store = Store::new(StoreConfig::default());
    store.set("stale.value", json!(1));

    let mut stream = Builder::new()
        .read(b"{\"path\":\"a.b\",\"data\":{\"x\":1},\"meta\":{\"permanent\":true,\"writtenAt\":1}}\n{\"pa")
        .read(b"th\":\"c\",\"data\":[1,2]}\nnot json\n{\"data\":3}\n")
        .build();
    let applied = store.restore(&mut stream).await.unwrap();

    assert_eq!(applied, 2);
    assert_eq!(store.get(""), Some(json!({"a": {"b": {"x": 1}}, "c": [1, 2]})));
    assert!(store.meta("a.b").unwrap().permanent);
    assert!(store.meta("stale.value").is_none());
}

#[tokio::test]
async fn test_restore_stream_error_keeps_applied_records() {
    let store = Store::new(StoreConfig::default());
    let mut stream = Builder::new()
        .read(b"{\"path\":\"a\",\"data\":1}\n")
        .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        .build();

    let result = store.restore(&mut stream).await;

    assert!(matches!(result, Err(StoreError::Io(_))));
    assert_eq!(store.get("a"), Some(json!(1)));
}

// --- Writing ---

#[tokio::test]
async fn test_backup_writes_one_line_per_meta_path() {
    let store = permanent_store(
        json!({"a": 1, "b": {"c": true}}),
        vec![
            (
                "b.c",
                Meta {
                    expires_at: None,
                    permanent: true,
                    written_at: Timestamp(2_000),
                },
            ),
            (
                "a",
                Meta {
                    expires_at: Some(Timestamp(5_000)),
                    permanent: false,
                    written_at: Timestamp(1_000),
                },
            ),
        ],
    );

    let mut sink = Builder::new()
        .write(b"{\"path\":\"b.c\",\"data\":true,\"meta\":{\"permanent\":true,\"writtenAt\":2000}}\n")
        .write(b"{\"path\":\"a\",\"data\":1,\"meta\":{\"expiresAt\":5000,\"writtenAt\":1000}}\n")
        .build();

    assert_eq!(store.backup(&mut sink).await.unwrap(), 2);
}

#[tokio::test]
async fn test_backup_write_error_rejects() {
    let store = Store::new(StoreConfig::default());
    store.set("a", json!(1));

    let mut sink = Builder::new()
        .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        .build();

    let result = store.backup(&mut sink).await;
    assert!(matches!(result, Err(StoreError::Io(_))));
}

#[tokio::test]
async fn test_backup_sweeps_first() {
    let store = Store::new(StoreConfig::default());
    store.set_with_meta("gone", json!(1), MetaPatch::expires_at(Timestamp(1)));
    store.set("kept", json!(2));

    let mut out = Vec::new();
    let written = store.backup(&mut out).await.unwrap();

    assert_eq!(written, 1);
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("{\"path\":\"kept\",\"data\":2,"));
    assert!(!text.contains("gone"));
}

// --- Files ---

#[tokio::test]
async fn test_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("store.ndjson");

    let source = Store::new(StoreConfig::default());
    source.set("users.alice", json!({"name": "Alice", "tags": ["a", "b"]}));
    source.set_with_meta("config", json!({"mode": "dark"}), MetaPatch::permanent());
    source.set_with_meta(
        "session",
        json!("token"),
        MetaPatch::expire_in(Duration::from_secs(3_600)),
    );
    assert_eq!(source.backup_to_file(&file).await.unwrap(), 3);

    let target = Store::new(StoreConfig::default());
    target.set("leftover", json!(true));
    assert_eq!(target.restore_from_file(&file).await.unwrap(), 3);

    assert_eq!(target.get(""), source.get(""));
    assert!(target.meta("config").unwrap().permanent);
    assert_eq!(
        target.meta("session").unwrap().expires_at,
        source.meta("session").unwrap().expires_at
    );
}

#[tokio::test]
async fn test_restore_missing_file_fails() {
    let dir = TempDir::new().unwrap();
    let store = Store::new(StoreConfig::default());

    let result = store.restore_from_file(dir.path().join("nope.ndjson")).await;
    assert!(matches!(result, Err(StoreError::Io(_))));
}

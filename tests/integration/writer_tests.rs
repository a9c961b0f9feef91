//! Writer behaviour over a file-backed store with the harvest collections

use crate::create_test_config;
use community_harvester::harvest::{register_collections, COMMUNITIES, POSTS, USERS};
use community_harvester::ratelimit::RateLimiter;
use community_harvester::resilience::CircuitBreaker;
use community_harvester::storage::{Record, RecordStore, SqliteStore};
use community_harvester::writer::BatchWriter;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

fn build_writer(store: Arc<dyn RecordStore>) -> BatchWriter {
    let config = create_test_config("http://127.0.0.1:9");
    register_collections(BatchWriter::new(
        store,
        Arc::new(CircuitBreaker::new(3, Duration::from_secs(60))),
        RateLimiter::from_config(&config.rate_limit, RateLimiter::shared_gate(4)),
        &config.writer,
    ))
}

#[tokio::test]
async fn test_posts_create_parent_placeholders() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn RecordStore> =
        Arc::new(SqliteStore::new(&dir.path().join("harvest.db")).unwrap());
    let writer = build_writer(Arc::clone(&store));

    writer
        .add(
            POSTS,
            record(json!({"id": "p1", "community": "rust", "author": "ferris", "score": 5})),
        )
        .await
        .unwrap();
    let report = writer.flush_all().await.unwrap();

    assert_eq!(report.written, 1);
    assert_eq!(report.placeholders, 2);

    let communities = store.select(COMMUNITIES, &["rust".to_string()]).unwrap();
    assert_eq!(communities.len(), 1);
    assert_eq!(communities[0]["placeholder"], json!(true));

    let users = store.select(USERS, &["ferris".to_string()]).unwrap();
    assert_eq!(users.len(), 1);
    assert_eq!(store.count(POSTS).unwrap(), 1);
}

#[tokio::test]
async fn test_real_row_replaces_placeholder_and_keeps_category() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn RecordStore> =
        Arc::new(SqliteStore::new(&dir.path().join("harvest.db")).unwrap());
    store
        .upsert(
            COMMUNITIES,
            &["name".to_string()],
            &[record(json!({"name": "rust", "category": "technology", "subscribers": 1}))],
        )
        .unwrap();

    let writer = build_writer(Arc::clone(&store));
    writer
        .add(COMMUNITIES, record(json!({"name": "rust", "subscribers": 300000})))
        .await
        .unwrap();
    writer.flush_all().await.unwrap();

    let rows = store.select(COMMUNITIES, &["rust".to_string()]).unwrap();
    assert_eq!(rows[0]["subscribers"], json!(300000));
    assert_eq!(rows[0]["category"], json!("technology"));

    writer
        .add(
            COMMUNITIES,
            record(json!({"name": "rust", "category": "programming"})),
        )
        .await
        .unwrap();
    writer.flush_all().await.unwrap();

    let rows = store.select(COMMUNITIES, &["rust".to_string()]).unwrap();
    assert_eq!(rows[0]["category"], json!("programming"));
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("harvest.db");
    {
        let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::new(&db).unwrap());
        let writer = build_writer(Arc::clone(&store));
        for i in 0..3 {
            writer
                .add(USERS, record(json!({"username": format!("user{}", i)})))
                .await
                .unwrap();
        }
        writer.flush_all().await.unwrap();
    }

    let reopened = SqliteStore::new(&db).unwrap();
    assert_eq!(reopened.count(USERS).unwrap(), 3);
    assert_eq!(
        reopened.collections().unwrap(),
        vec![(USERS.to_string(), 3)]
    );
}

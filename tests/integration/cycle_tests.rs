//! Full discovery cycles against a mock upstream

use crate::{create_test_config, direct_factory};
use community_harvester::control::{ControlFlag, FileFlag, SharedSwitch};
use community_harvester::harvest::{COMMUNITIES, COMMUNITY_RULES, POSTS, USERS};
use community_harvester::scheduler::TargetKind;
use community_harvester::storage::{RecordStore, SqliteStore};
use community_harvester::Harvester;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn community_about(name: &str, subscribers: u64) -> Value {
    json!({"kind": "t5", "data": {"display_name": name, "subscribers": subscribers}})
}

fn listing(posts: Vec<Value>) -> Value {
    let children: Vec<Value> = posts
        .into_iter()
        .map(|p| json!({"kind": "t3", "data": p}))
        .collect();
    json!({"kind": "Listing", "data": {"children": children}})
}

async fn mount_json(server: &MockServer, route: &str, body: Value) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// r/rust mentions r/learnrust, carries a crosspost from r/golang and has
/// two authors. Unmocked paths answer 404.
async fn mount_upstream(server: &MockServer) {
    mount_json(server, "/r/rust/about.json", community_about("rust", 300_000)).await;
    mount_json(
        server,
        "/r/rust/new.json",
        listing(vec![
            json!({
                "id": "p1",
                "subreddit": "rust",
                "author": "ferris",
                "title": "New to the language? Try r/learnrust",
                "score": 42
            }),
            json!({
                "id": "p2",
                "subreddit": "rust",
                "author": "gopher",
                "title": "Interesting comparison",
                "score": 7,
                "crosspost_parent_list": [{"subreddit": "golang"}]
            }),
        ]),
    )
    .await;
    mount_json(
        server,
        "/r/rust/about/rules.json",
        json!({"rules": [{"short_name": "Be civil", "kind": "all"}]}),
    )
    .await;

    mount_json(server, "/r/learnrust/about.json", community_about("learnrust", 40_000)).await;
    mount_json(
        server,
        "/r/learnrust/new.json",
        listing(vec![json!({
            "id": "p3",
            "subreddit": "learnrust",
            "author": "ferris",
            "title": "Ownership explained",
            "score": 3
        })]),
    )
    .await;

    mount_json(
        server,
        "/user/ferris/about.json",
        json!({"kind": "t2", "data": {"name": "ferris", "link_karma": 1000, "comment_karma": 50}}),
    )
    .await;
    mount_json(server, "/user/ferris/submitted.json", listing(vec![])).await;
}

#[tokio::test]
async fn test_two_wave_cycle_end_to_end() {
    let mock_server = MockServer::start().await;
    mount_upstream(&mock_server).await;

    let mut config = create_test_config(&mock_server.uri());
    config.scheduler.seeds = vec!["rust".to_string()];
    let store: Arc<dyn RecordStore> = Arc::new(SqliteStore::new_in_memory().unwrap());
    let mut harvester = Harvester::with_parts(
        config,
        Arc::clone(&store),
        Arc::new(SharedSwitch::new(true)),
        Some(direct_factory()),
    )
    .unwrap();

    let stats = harvester.run_once().await.unwrap();

    assert_eq!(stats.wave_one.succeeded, 1);
    assert_eq!(stats.wave_one.records, 4);
    // golang, learnrust, ferris, gopher
    assert_eq!(stats.promoted, 4);
    assert_eq!(stats.wave_two.processed(), 4);
    assert_eq!(stats.wave_two.failed, 0);
    // golang and gopher are unknown upstream
    assert_eq!(stats.wave_two.skipped, 2);
    assert!(!stats.aborted);

    let rust = store.select(COMMUNITIES, &["rust".to_string()]).unwrap();
    assert_eq!(rust[0]["subscribers"], json!(300_000));
    let learnrust = store.select(COMMUNITIES, &["learnrust".to_string()]).unwrap();
    assert_eq!(learnrust[0]["subscribers"], json!(40_000));

    assert_eq!(store.count(POSTS).unwrap(), 3);
    assert_eq!(store.count(COMMUNITY_RULES).unwrap(), 1);

    let ferris = store.select(USERS, &["ferris".to_string()]).unwrap();
    assert_eq!(ferris[0]["link_karma"], json!(1000));
    let gopher = store.select(USERS, &["gopher".to_string()]).unwrap();
    assert_eq!(gopher[0]["placeholder"], json!(true));

    for key in ["r/rust", "r/learnrust", "r/golang", "u/ferris", "u/gopher"] {
        assert!(harvester.processed().contains(&key.to_string()), "{} not processed", key);
    }

    harvester.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_second_cycle_skips_processed_discoveries() {
    let mock_server = MockServer::start().await;
    mount_upstream(&mock_server).await;

    let mut config = create_test_config(&mock_server.uri());
    config.scheduler.seeds = vec!["rust".to_string()];
    let mut harvester = Harvester::with_parts(
        config,
        Arc::new(SqliteStore::new_in_memory().unwrap()),
        Arc::new(SharedSwitch::new(true)),
        Some(direct_factory()),
    )
    .unwrap()
    .with_promotion(|d| d.kind == TargetKind::Community);

    let first = harvester.run_once().await.unwrap();
    assert_eq!(first.promoted, 2);

    let second = harvester.run_once().await.unwrap();
    assert_eq!(second.wave_one.succeeded, 1);
    assert_eq!(second.promoted, 0);
    assert_eq!(harvester.cycles(), 2);

    harvester.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disabled_flag_file_sends_nothing() {
    let mock_server = MockServer::start().await;
    mount_upstream(&mock_server).await;

    let dir = TempDir::new().unwrap();
    let flag_path = dir.path().join("harvester.flag");
    std::fs::write(&flag_path, "off").unwrap();
    let flag = FileFlag::new(&flag_path);
    assert!(!flag.is_enabled());

    let mut config = create_test_config(&mock_server.uri());
    config.scheduler.seeds = vec!["rust".to_string()];
    let mut harvester = Harvester::with_parts(
        config,
        Arc::new(SqliteStore::new_in_memory().unwrap()),
        Arc::new(flag),
        Some(direct_factory()),
    )
    .unwrap();

    let stats = harvester.run_once().await.unwrap();
    assert!(stats.stopped);
    assert!(mock_server.received_requests().await.unwrap().is_empty());

    harvester.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_recovered_backend_reactivated_before_cycle() {
    let mock_server = MockServer::start().await;
    mount_upstream(&mock_server).await;
    mount_json(&mock_server, "/r/popular/about.json", community_about("popular", 1)).await;

    let mut config = create_test_config(&mock_server.uri());
    config.scheduler.seeds = vec!["rust".to_string()];
    let mut harvester = Harvester::with_parts(
        config,
        Arc::new(SqliteStore::new_in_memory().unwrap()),
        Arc::new(SharedSwitch::new(true)),
        Some(direct_factory()),
    )
    .unwrap()
    .with_promotion(|_| false);
    harvester.start().unwrap();

    for _ in 0..10 {
        harvester
            .registry()
            .report_outcome("a", false, Duration::ZERO, Some("HTTP 502"));
    }
    assert!(!harvester.registry().is_active("a"));

    let stats = harvester.run_once().await.unwrap();
    assert!(harvester.registry().is_active("a"));
    assert_eq!(stats.wave_one.succeeded, 1);
    assert!(stats.disabled_backends.is_empty());

    let health_checks = mock_server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path() == "/r/popular/about.json")
        .count();
    assert_eq!(health_checks, 1);

    harvester.shutdown().await.unwrap();
}

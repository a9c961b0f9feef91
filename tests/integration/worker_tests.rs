//! Worker client behaviour against a mock upstream

use crate::{build_worker, create_test_config, direct_factory};
use community_harvester::client::{FetchOperation, FetchOutcome, PostSort, SessionFactory, TimeFilter};
use community_harvester::proxy::ProxyConnection;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn about(name: &str) -> FetchOperation {
    FetchOperation::CommunityAbout {
        name: name.to_string(),
    }
}

#[tokio::test]
async fn test_429_retries_exactly_then_rate_limited() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/r/rust/about.json"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server.uri());
    let (mut worker, registry) = build_worker(&config, direct_factory());

    let outcome = worker.fetch(&about("rust")).await;
    assert_eq!(outcome, FetchOutcome::RateLimited);

    // one initial attempt plus the configured retries
    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 4);

    let delays = worker.last_retry_delays().to_vec();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(20),
            Duration::from_millis(30),
            Duration::from_millis(40)
        ]
    );
    assert!(delays.windows(2).all(|w| w[0] < w[1]));

    let snapshot = registry.snapshot();
    assert_eq!(snapshot[0].stats.requests, 4);
    assert_eq!(snapshot[0].stats.consecutive_errors, 4);
}

#[tokio::test]
async fn test_server_error_retried_then_succeeds() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/r/rust/about.json"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/r/rust/about.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"kind": "t5", "data": {"display_name": "rust"}})),
        )
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server.uri());
    let (mut worker, registry) = build_worker(&config, direct_factory());

    match worker.fetch(&about("rust")).await {
        FetchOutcome::Ok(payload) => assert_eq!(payload["data"]["display_name"], "rust"),
        other => panic!("expected payload, got {:?}", other),
    }
    assert_eq!(worker.last_retry_delays(), &[Duration::from_millis(10)]);

    let stats = &registry.snapshot()[0].stats;
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.successes, 1);
    assert_eq!(stats.consecutive_errors, 0);
}

#[tokio::test]
async fn test_transport_budget_exhausted() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server.uri());
    let (mut worker, _registry) = build_worker(&config, direct_factory());

    let outcome = worker.fetch(&about("rust")).await;
    assert!(matches!(outcome, FetchOutcome::TransportError(_)));
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 3);
    assert_eq!(
        worker.last_retry_delays(),
        &[Duration::from_millis(10), Duration::from_millis(20)]
    );
}

#[tokio::test]
async fn test_banned_community_is_not_retried() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/r/gone/about.json"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({"reason": "banned", "error": 404})),
        )
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server.uri());
    let (mut worker, registry) = build_worker(&config, direct_factory());

    let outcome = worker.fetch(&about("gone")).await;
    assert_eq!(outcome, FetchOutcome::NotFound { banned: true });
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 1);
    assert!(worker.last_retry_delays().is_empty());

    // a 404 proves the proxy works
    assert_eq!(registry.snapshot()[0].stats.consecutive_errors, 0);
}

#[tokio::test]
async fn test_private_community_is_forbidden() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/r/secret/about.json"))
        .respond_with(
            ResponseTemplate::new(403).set_body_json(json!({"reason": "private", "error": 403})),
        )
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/r/blocked/about.json"))
        .respond_with(ResponseTemplate::new(403).set_body_string("<html>Blocked</html>"))
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server.uri());
    let (mut worker, registry) = build_worker(&config, direct_factory());

    assert_eq!(
        worker.fetch(&about("secret")).await,
        FetchOutcome::Forbidden {
            reason: Some("private".to_string())
        }
    );
    assert_eq!(registry.snapshot()[0].stats.consecutive_errors, 0);

    assert_eq!(
        worker.fetch(&about("blocked")).await,
        FetchOutcome::Forbidden { reason: None }
    );
    assert_eq!(registry.snapshot()[0].stats.consecutive_errors, 1);
}

#[tokio::test]
async fn test_session_recycled_on_same_backend() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"kind": "t5", "data": {}})))
        .mount(&mock_server)
        .await;

    let mut config = create_test_config(&mock_server.uri());
    config.workers.session_max_requests = 2;

    let built = Arc::new(AtomicUsize::new(0));
    let backends = Arc::new(Mutex::new(Vec::new()));
    let factory: SessionFactory = {
        let built = Arc::clone(&built);
        let backends = Arc::clone(&backends);
        Arc::new(move |conn: &ProxyConnection| {
            built.fetch_add(1, Ordering::SeqCst);
            backends.lock().unwrap().push(conn.id.clone());
            reqwest::Client::builder().no_proxy().build()
        })
    };
    let (mut worker, _registry) = build_worker(&config, factory);

    for _ in 0..5 {
        assert!(matches!(
            worker.fetch(&about("rust")).await,
            FetchOutcome::Ok(_)
        ));
    }

    assert_eq!(worker.sessions_built(), 3);
    assert_eq!(built.load(Ordering::SeqCst), 3);
    assert!(backends.lock().unwrap().iter().all(|id| id == "a"));
}

#[tokio::test]
async fn test_identity_rotates_between_requests() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&mock_server)
        .await;

    let mut config = create_test_config(&mock_server.uri());
    config.upstream.user_agents = vec!["agent-one".to_string(), "agent-two".to_string()];
    let (mut worker, _registry) = build_worker(&config, direct_factory());

    for _ in 0..4 {
        worker.fetch(&about("rust")).await;
    }

    let agents: Vec<String> = mock_server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| {
            r.headers
                .get("user-agent")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        })
        .collect();
    assert_eq!(agents.len(), 4);
    assert!(agents.windows(2).all(|w| w[0] != w[1]), "{:?}", agents);
}

#[tokio::test]
async fn test_listing_query_parameters() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/r/rust/top.json"))
        .and(query_param("raw_json", "1"))
        .and(query_param("t", "week"))
        .and(query_param("limit", "25"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"children": []}})))
        .mount(&mock_server)
        .await;

    let config = create_test_config(&mock_server.uri());
    let (mut worker, _registry) = build_worker(&config, direct_factory());

    let operation = FetchOperation::CommunityPosts {
        name: "rust".to_string(),
        sort: PostSort::Top,
        time_filter: Some(TimeFilter::Week),
        limit: 25,
    };
    assert!(matches!(worker.fetch(&operation).await, FetchOutcome::Ok(_)));
}

#[tokio::test]
async fn test_worker_requires_an_assigned_slot() {
    use community_harvester::client::WorkerClient;
    use community_harvester::proxy::{ProxyRegistry, WorkerSlot};
    use community_harvester::ratelimit::RateLimiter;

    let config = create_test_config("http://127.0.0.1:9");
    let registry = Arc::new(ProxyRegistry::from_config(&config).unwrap());
    let limiter = || RateLimiter::from_config(&config.rate_limit, RateLimiter::shared_gate(4));

    // quota 2: slots 0 and 1 exist, slot 2 was never handed out
    let slots = registry.assign_slots(registry.total_quota());
    assert_eq!(slots.len(), 2);
    let stray = WorkerSlot {
        slot_id: 2,
        backend_id: "a".to_string(),
        group: 0,
    };
    assert!(WorkerClient::with_session_factory(
        stray,
        Arc::clone(&registry),
        limiter(),
        &config,
        direct_factory(),
    )
    .is_err());

    let worker = WorkerClient::with_session_factory(
        slots[1].clone(),
        Arc::clone(&registry),
        limiter(),
        &config,
        direct_factory(),
    )
    .unwrap();
    assert_eq!(worker.backend_id(), "a");
}

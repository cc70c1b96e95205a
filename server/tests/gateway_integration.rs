//! End-to-end scenarios exercising the broker, session manager, presence
//! service, and keypackage directory together against a real (in-memory)
//! database, the way a client driving the wire protocol would observe them.

use std::sync::Arc;
use std::time::Duration;

use ds_gateway::actors::ActorRegistry;
use ds_gateway::broker::ConversationBroker;
use ds_gateway::config::GatewayConfig;
use ds_gateway::db;
use ds_gateway::keypackages::KeyPackageService;
use ds_gateway::middleware::rate_limit::OperationLimiter;
use ds_gateway::presence::{PresenceHub, PresenceService};
use ds_gateway::session::SessionManager;

async fn test_pool() -> db::DbPool {
    db::init_db(&db::DbConfig {
        db_path: None,
        max_connections: 5,
        acquire_timeout: Duration::from_secs(5),
    })
    .await
    .unwrap()
}

fn test_config() -> GatewayConfig {
    GatewayConfig {
        gateway_id: "gw_test".to_string(),
        ..GatewayConfig::from_env()
    }
}

async fn test_broker(pool: db::DbPool) -> ConversationBroker {
    let config = test_config();
    let registry = Arc::new(ActorRegistry::new(pool.clone(), config.gateway_id.clone()));
    let limiter = Arc::new(OperationLimiter::new(&config.rate_limits));
    ConversationBroker::new(pool, registry, limiter, &config)
}

#[tokio::test]
async fn scenario_ordered_fan_out_to_all_subscribers() {
    let pool = test_pool().await;
    db::ensure_conversation(&pool, "c1", "gw_test", "group", None).await.unwrap();
    db::add_member(&pool, "c1", "dA", false).await.unwrap();
    db::add_member(&pool, "c1", "dB", false).await.unwrap();
    let broker = test_broker(pool).await;

    let (_backlog_a, mut rx_a) = broker.admit_subscribe("c1", "dA", Some(1)).await.unwrap();
    let (_backlog_b, mut rx_b) = broker.admit_subscribe("c1", "dB", Some(1)).await.unwrap();

    let out1 = broker.admit_send("c1", "dA", "userA", "m1", "RTE=").await.unwrap();
    let out2 = broker.admit_send("c1", "dA", "userA", "m2", "RTI=").await.unwrap();
    assert_eq!(out1.event.seq, 1);
    assert_eq!(out2.event.seq, 2);

    for rx in [&mut rx_a, &mut rx_b] {
        let e1 = rx.recv().await.unwrap();
        assert_eq!(e1.seq, 1);
        assert_eq!(e1.msg_id, "m1");
        let e2 = rx.recv().await.unwrap();
        assert_eq!(e2.seq, 2);
        assert_eq!(e2.msg_id, "m2");
    }
}

#[tokio::test]
async fn scenario_idempotent_retry_returns_same_seq_without_refanout() {
    let pool = test_pool().await;
    db::ensure_conversation(&pool, "c1", "gw_test", "group", None).await.unwrap();
    db::add_member(&pool, "c1", "dA", false).await.unwrap();
    let broker = test_broker(pool).await;

    let (_backlog, mut rx) = broker.admit_subscribe("c1", "dA", Some(1)).await.unwrap();
    let first = broker.admit_send("c1", "dA", "userA", "m1", "RTE=").await.unwrap();
    assert!(!first.duplicate);

    let retry = broker.admit_send("c1", "dA", "userA", "m1", "RTE=").await.unwrap();
    assert!(retry.duplicate);
    assert_eq!(retry.event.seq, first.event.seq);

    let delivered = rx.recv().await.unwrap();
    assert_eq!(delivered.seq, 1);
    let nothing_else = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(nothing_else.is_err(), "a duplicate send must not fan out a second event");
}

#[tokio::test]
async fn scenario_resume_reports_stored_cursor_and_replays_from_it() {
    let pool = test_pool().await;
    db::ensure_conversation(&pool, "c1", "gw_test", "group", None).await.unwrap();
    db::add_member(&pool, "c1", "dB", false).await.unwrap();
    let broker = test_broker(pool.clone()).await;
    let sessions = SessionManager::new(pool.clone(), 3600, None);

    let started = sessions.start("any", Some("dB"), None).await.unwrap();
    let user_id = started.user_id.clone();
    broker.admit_send("c1", "dB", &user_id, "m1", "RTE=").await.unwrap();
    broker.admit_send("c1", "dB", &user_id, "m2", "RTI=").await.unwrap();

    db::ack_cursor(&pool, "dB", "c1", 1).await.unwrap();

    let resumed = sessions.resume(&started.resume_token).await.unwrap();
    assert_ne!(resumed.resume_token, started.resume_token);
    let cursor = resumed.cursors.iter().find(|c| c.conv_id == "c1").unwrap();
    assert_eq!(cursor.next_seq, 2);

    let (backlog, _rx) = broker.admit_subscribe("c1", "dB", None).await.unwrap();
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog[0].seq, 2);
}

#[tokio::test]
async fn scenario_replay_window_exceeded_when_subscribing_behind_the_retained_floor() {
    let pool = test_pool().await;
    db::ensure_conversation(&pool, "c1", "gw_test", "group", None).await.unwrap();
    db::add_member(&pool, "c1", "dX", false).await.unwrap();
    for i in 0..5 {
        db::allocate_and_insert(&pool, "c1", &format!("m{i}"), b"x", "gw_test").await.unwrap();
    }
    // Simulate a retention sweep in HARD mode pruning everything below seq 4.
    db::prune_events_by_count(&pool, "c1", 2, None).await.unwrap();

    let broker = test_broker(pool).await;
    let err = broker.admit_subscribe("c1", "dX", Some(1)).await.unwrap_err();
    assert_eq!(err.code(), "replay_window_exceeded");
}

#[tokio::test]
async fn scenario_presence_mutual_watch_gates_fanout() {
    let pool = test_pool().await;
    let hub = Arc::new(PresenceHub::new(32));
    let presence = PresenceService::new(pool, hub.clone(), 500, 5000);

    presence.watch("u1", "u2").await.unwrap();
    presence.lease("devU2", "u2", "online", 60, false).await.unwrap();

    let mut rx = hub.subscribe("u1").await;
    let not_yet = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(not_yet.is_err(), "u1 must not see u2's presence until the watch is mutual");

    presence.watch("u2", "u1").await.unwrap();
    presence.lease("devU2", "u2", "online", 60, false).await.unwrap();

    let update = tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("update should arrive once the watch is mutual")
        .unwrap();
    assert_eq!(update.user_id, "u2");
    assert_eq!(update.status, "online");
}

#[tokio::test]
async fn scenario_keypackage_one_shot_fetch_never_returns_a_blob_twice() {
    let pool = test_pool().await;
    let config = test_config();
    let service = KeyPackageService::new(pool, &config);

    service.publish("dev1", "user1", b"k1").await.unwrap();
    service.publish("dev1", "user1", b"k2").await.unwrap();
    service.publish("dev1", "user1", b"k3").await.unwrap();

    let mut seen = std::collections::HashSet::new();
    for _ in 0..2 {
        let kp = service.fetch("user1").await.unwrap();
        assert!(seen.insert(kp.blob), "a blob must never be served twice");
    }
    let kp = service.fetch("user1").await.unwrap();
    assert!(seen.insert(kp.blob));

    let exhausted = service.fetch("user1").await.unwrap_err();
    assert_eq!(exhausted.code(), "not_found");
}

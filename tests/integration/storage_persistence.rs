//! Integration tests for storage persistence
//!
//! These tests verify that:
//! - Committed target state and events survive a reopen of the database
//! - Retention cleanup removes old metrics and, when configured, old events
//! - The cross-target event feed filters by kind, tag and limit
//! - Both backends agree on the feed semantics

use chrono::{Duration, Utc};
use guardia_watch::actors::retention::prune;
use guardia_watch::config::RetentionConfig;
use guardia_watch::model::{EventFeedFilter, EventKind, Metric, NewEvent, Status};
use guardia_watch::storage::sqlite::SqliteBackend;
use guardia_watch::storage::{
    EventStore, MemoryBackend, StateStore, StorageBackend, TargetStore,
};
use tempfile::tempdir;

use super::helpers::*;

fn metric(target_id: i64, age: Duration) -> Metric {
    Metric {
        target_id,
        at: Utc::now() - age,
        latency_ms: 20,
        ok: true,
        error: None,
    }
}

#[tokio::test]
async fn test_retention_keeps_recent_metrics() {
    let temp_dir = tempdir().unwrap();
    let backend = SqliteBackend::new(temp_dir.path().join("retention.db"))
        .await
        .unwrap();

    backend.add_metric(&metric(1, Duration::days(40))).await.unwrap();
    backend.add_metric(&metric(1, Duration::hours(2))).await.unwrap();

    let report = prune(&backend, &RetentionConfig::default(), Utc::now())
        .await
        .unwrap();

    assert_eq!(report.metrics_deleted, 1);
    let remaining = backend
        .list_metrics(1, Utc::now() - Duration::days(365))
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
}

#[tokio::test]
async fn test_event_retention_is_opt_in() {
    let temp_dir = tempdir().unwrap();
    let backend = SqliteBackend::new(temp_dir.path().join("events.db"))
        .await
        .unwrap();

    backend
        .add_event(&NewEvent {
            target_id: 1,
            at: Utc::now() - Duration::days(200),
            kind: EventKind::Down,
            message: "target down: timeout after 10s".to_string(),
        })
        .await
        .unwrap();

    let kept = prune(&backend, &RetentionConfig::default(), Utc::now())
        .await
        .unwrap();
    assert_eq!(kept.events_deleted, 0);

    let config = RetentionConfig {
        events_retention_days: Some(90),
        ..Default::default()
    };
    let pruned = prune(&backend, &config, Utc::now()).await.unwrap();
    assert_eq!(pruned.events_deleted, 1);
}

#[tokio::test]
async fn test_engine_state_survives_reopen() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("reopen.db");

    {
        let backend = SqliteBackend::new(&db_path).await.unwrap();
        backend.upsert_target(&tcp_target(1, "api")).await.unwrap();
        backend
            .commit_check(
                &guardia_watch::model::TargetState {
                    target_id: 1,
                    status: Status::Down,
                    last_error: Some("connection refused".to_string()),
                    maintenance_active: false,
                    last_checked_at: start_time(),
                    last_notified_at: Some(start_time()),
                },
                &[NewEvent {
                    target_id: 1,
                    at: start_time(),
                    kind: EventKind::Down,
                    message: "target down: connection refused".to_string(),
                }],
            )
            .await
            .unwrap();
        backend.close().await.unwrap();
    }

    let backend = SqliteBackend::new(&db_path).await.unwrap();
    let state = backend.get_state(1).await.unwrap().unwrap();
    assert_eq!(state.status, Status::Down);
    assert_eq!(state.last_notified_at, Some(start_time()));
    assert_eq!(
        backend.list_events(1, start_time()).await.unwrap().len(),
        1
    );
    assert!(backend.health_check().await.unwrap().healthy);
}

async fn seed_feed<B: StorageBackend>(backend: &B) {
    let mut edge = tcp_target(1, "edge");
    edge.tags = tags(&["edge"]);
    let core = tcp_target(2, "core");
    backend.upsert_target(&edge).await.unwrap();
    backend.upsert_target(&core).await.unwrap();

    let base = start_time();
    let rows = [
        (1, 0, EventKind::Down),
        (2, 1, EventKind::Down),
        (1, 2, EventKind::Up),
        (2, 3, EventKind::MaintenanceStart),
    ];
    for (target_id, minute, kind) in rows {
        backend
            .add_event(&NewEvent {
                target_id,
                at: base + Duration::minutes(minute),
                kind,
                message: kind.as_str().to_string(),
            })
            .await
            .unwrap();
    }
}

async fn assert_feed_semantics<B: StorageBackend>(backend: &B) {
    seed_feed(backend).await;

    let all = backend
        .list_events_feed(&EventFeedFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 4);
    assert_eq!(all[0].kind, EventKind::MaintenanceStart, "newest first");

    let downs = backend
        .list_events_feed(&EventFeedFilter {
            kinds: vec![EventKind::Down],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(downs.len(), 2);

    let edge = backend
        .list_events_feed(&EventFeedFilter {
            tags: tags(&["edge"]),
            limit: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(edge.len(), 1);
    assert_eq!(edge[0].target_id, 1);
    assert_eq!(edge[0].kind, EventKind::Up);

    let recent = backend
        .list_events_feed(&EventFeedFilter {
            since: Some(start_time() + Duration::minutes(2)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(recent.len(), 2);
}

#[tokio::test]
async fn test_feed_filters_sqlite() {
    let temp_dir = tempdir().unwrap();
    let backend = SqliteBackend::new(temp_dir.path().join("feed.db"))
        .await
        .unwrap();
    assert_feed_semantics(&backend).await;
}

#[tokio::test]
async fn test_feed_filters_memory() {
    assert_feed_semantics(&MemoryBackend::new()).await;
}

//! End-to-end behavior of `Engine::check_now`
//!
//! These tests drive the engine with a switchable probe and a manual clock:
//! - Status transitions emit exactly one event per change
//! - The notification throttle and the "still down" reminder
//! - Auto-incidents open once and close on recovery
//! - Maintenance windows record boundary events and silence side effects
//! - Concurrent checks of one target never double-report a transition
//! - Store failures abort the check

use assert_matches::assert_matches;
use async_trait::async_trait;
use guardia_watch::config::EngineSettings;
use guardia_watch::crypto::AesGcmEncryptor;
use guardia_watch::engine::{Engine, EngineError};
use guardia_watch::incident::IncidentAction;
use guardia_watch::model::{
    EventKind, IncidentStatus, MONITORING_SOURCE, NewEvent, NewMaintenanceWindow, Severity,
    Status, TargetId, TargetState,
};
use guardia_watch::notify::{DispatchOutcome, NotificationDispatcher, NotificationKind};
use guardia_watch::storage::{
    EventStore, IncidentStore, MaintenanceStore, MemoryBackend, StateStore, StorageError,
    StorageResult, Stores, TargetStore,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::helpers::*;

fn kinds(events: &[guardia_watch::model::Event]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

#[tokio::test]
async fn test_up_down_up_emits_one_event_per_transition() {
    let rig = TestRig::new(&[tcp_target(1, "api")], EngineSettings::default()).await;
    let cancel = CancellationToken::new();

    rig.engine.check_now(1, &cancel).await.unwrap();

    rig.advance_minutes(1);
    rig.probe.set_up(false);
    let down = rig.engine.check_now(1, &cancel).await.unwrap();
    assert!(down.transition);
    assert_eq!(down.previous_status, Some(Status::Up));

    rig.advance_minutes(1);
    rig.probe.set_up(true);
    rig.engine.check_now(1, &cancel).await.unwrap();

    // the first up check is the baseline and emits nothing
    let events = rig.backend.list_events(1, start_time()).await.unwrap();
    assert_eq!(kinds(&events), vec![EventKind::Down, EventKind::Up]);
    assert!(events[0].message.starts_with("target down: connection refused"));
    assert!(events[0].at < events[1].at);

    let state = rig.backend.get_state(1).await.unwrap().unwrap();
    assert_eq!(state.status, Status::Up);
    assert_eq!(state.last_error, None);
    assert_eq!(rig.backend.list_metrics(1, start_time()).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_steady_state_only_writes_metrics() {
    let rig = TestRig::new(&[tcp_target(1, "api")], EngineSettings::default()).await;
    let cancel = CancellationToken::new();

    for _ in 0..5 {
        let outcome = rig.engine.check_now(1, &cancel).await.unwrap();
        rig.advance_minutes(1);
        assert!(outcome.notification.is_none());
    }

    assert!(rig.backend.list_events(1, start_time()).await.unwrap().is_empty());
    assert_eq!(rig.backend.list_metrics(1, start_time()).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_suppression_window_gates_recovery_notice() {
    for (suppress, expected) in [(0, 2), (10, 1)] {
        let settings = EngineSettings {
            notify_suppress_minutes: suppress,
            ..Default::default()
        };
        let rig = TestRig::with_probe(
            &[tcp_target(1, "api")],
            settings,
            Arc::new(SwitchProbe::new(false)),
        )
        .await;
        rig.add_channel("ops").await;
        let cancel = CancellationToken::new();

        rig.engine.check_now(1, &cancel).await.unwrap();
        rig.probe.set_up(true);
        let up = rig.engine.check_now(1, &cancel).await.unwrap();

        assert_eq!(
            rig.sender.sent().len(),
            expected,
            "suppress window of {suppress} minutes"
        );
        if suppress > 0 {
            assert_eq!(
                up.notification,
                Some((NotificationKind::Up, DispatchOutcome::Throttled))
            );
        }
    }
}

#[tokio::test]
async fn test_message_texts_reach_the_sender() {
    let rig = TestRig::with_probe(
        &[tcp_target(1, "billing")],
        unthrottled(),
        Arc::new(SwitchProbe::new(false)),
    )
    .await;
    rig.add_channel("ops").await;
    let cancel = CancellationToken::new();

    rig.engine.check_now(1, &cancel).await.unwrap();
    rig.probe.set_up(true);
    rig.engine.check_now(1, &cancel).await.unwrap();

    let sent = rig.sender.sent();
    let (secret, down) = &sent[0];
    assert_eq!(secret, "bot-token");
    assert_eq!(down.kind, NotificationKind::Down);
    assert!(down.text.contains("target unreachable: billing"));
    assert!(down.text.contains("connection refused"));

    let (_, up) = &sent[1];
    assert_eq!(up.kind, NotificationKind::Up);
    assert!(up.text.contains("target recovered: billing"));
}

#[tokio::test]
async fn test_still_down_reminder_cadence() {
    let settings = EngineSettings {
        notify_suppress_minutes: 5,
        notify_repeat_down_minutes: 30,
        ..Default::default()
    };
    let rig = TestRig::with_probe(
        &[tcp_target(1, "api")],
        settings,
        Arc::new(SwitchProbe::new(false)),
    )
    .await;
    rig.add_channel("ops").await;
    let cancel = CancellationToken::new();

    rig.engine.check_now(1, &cancel).await.unwrap();

    rig.advance_minutes(10);
    let early = rig.engine.check_now(1, &cancel).await.unwrap();
    assert!(early.notification.is_none());

    rig.advance_minutes(25);
    let reminder = rig.engine.check_now(1, &cancel).await.unwrap();
    assert_matches!(
        reminder.notification,
        Some((NotificationKind::StillDown, DispatchOutcome::Sent { delivered: 1, .. }))
    );

    let sent = rig.sender.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].1.text.contains("still down"));

    let state = rig.backend.get_state(1).await.unwrap().unwrap();
    assert_eq!(state.last_notified_at, Some(reminder.checked_at));
    // reminders are not status changes
    assert_eq!(rig.backend.list_events(1, start_time()).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failing_channel_is_isolated() {
    let rig = TestRig::with_probe(
        &[tcp_target(1, "api")],
        unthrottled(),
        Arc::new(SwitchProbe::new(false)),
    )
    .await;
    rig.add_channel("broken").await;
    rig.add_channel("ops").await;
    rig.sender.fail_for("broken");
    let cancel = CancellationToken::new();

    let outcome = rig.engine.check_now(1, &cancel).await.unwrap();

    assert_eq!(
        outcome.notification,
        Some((
            NotificationKind::Down,
            DispatchOutcome::Sent {
                delivered: 1,
                failed: 1
            }
        ))
    );
    assert_eq!(rig.sender.count_by_destination().get("ops"), Some(&1));

    let state = rig.backend.get_state(1).await.unwrap().unwrap();
    assert_eq!(state.status, Status::Down);
    assert_eq!(state.last_notified_at, Some(outcome.checked_at));
}

#[tokio::test]
async fn test_undelivered_notification_keeps_throttle_open() {
    let rig = TestRig::with_probe(
        &[tcp_target(1, "api")],
        EngineSettings::default(),
        Arc::new(SwitchProbe::new(false)),
    )
    .await;
    rig.add_channel("broken").await;
    rig.sender.fail_for("broken");
    let cancel = CancellationToken::new();

    rig.engine.check_now(1, &cancel).await.unwrap();

    let state = rig.backend.get_state(1).await.unwrap().unwrap();
    assert_eq!(state.status, Status::Down);
    assert_eq!(state.last_notified_at, None);
}

#[tokio::test]
async fn test_auto_incident_opens_once_and_closes() {
    let mut target = tcp_target(1, "api");
    target.auto_incident = true;
    target.incident_severity = Some(Severity::High);

    let rig = TestRig::with_probe(
        &[target],
        EngineSettings::default(),
        Arc::new(SwitchProbe::new(false)),
    )
    .await;
    let cancel = CancellationToken::new();

    let first = rig.engine.check_now(1, &cancel).await.unwrap();
    let incident_id = match first.incident {
        Some(IncidentAction::Opened(incident)) => {
            assert_eq!(incident.registration_number, "INC-0001");
            assert_eq!(incident.severity, Severity::High);
            assert!(incident.title.contains("api"));
            incident.id
        }
        other => panic!("expected an opened incident, got {other:?}"),
    };

    rig.advance_minutes(1);
    let second = rig.engine.check_now(1, &cancel).await.unwrap();
    assert_eq!(second.incident, Some(IncidentAction::AlreadyOpen(incident_id)));

    rig.advance_minutes(1);
    rig.probe.set_up(true);
    let up = rig.engine.check_now(1, &cancel).await.unwrap();
    assert_eq!(up.incident, Some(IncidentAction::Closed(incident_id)));

    let incidents = rig
        .backend
        .list_incidents_by_source(MONITORING_SOURCE, "1")
        .await
        .unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].status, IncidentStatus::Closed);
    assert_eq!(incidents[0].closed_at, Some(up.checked_at));

    rig.advance_minutes(1);
    let steady = rig.engine.check_now(1, &cancel).await.unwrap();
    assert_eq!(steady.incident, Some(IncidentAction::NoneOpen));
}

#[tokio::test]
async fn test_maintenance_boundary_events() {
    let rig = TestRig::new(&[tcp_target(1, "api")], EngineSettings::default()).await;
    let cancel = CancellationToken::new();

    rig.engine.check_now(1, &cancel).await.unwrap();

    let window_id = rig
        .backend
        .create_window(&NewMaintenanceWindow {
            name: "db upgrade".to_string(),
            target_id: Some(1),
            tags: Default::default(),
            starts_at: start_time(),
            ends_at: start_time() + chrono::Duration::hours(2),
            is_active: true,
        })
        .await
        .unwrap();

    rig.advance_minutes(1);
    let started = rig.engine.check_now(1, &cancel).await.unwrap();
    assert!(started.in_maintenance);
    assert_eq!(started.maintenance_change, Some(EventKind::MaintenanceStart));

    rig.advance_minutes(1);
    let inside = rig.engine.check_now(1, &cancel).await.unwrap();
    assert_eq!(inside.maintenance_change, None);

    let mut window = rig.backend.get_window(window_id).await.unwrap().unwrap();
    window.is_active = false;
    rig.backend.update_window(&window).await.unwrap();

    rig.advance_minutes(1);
    let ended = rig.engine.check_now(1, &cancel).await.unwrap();
    assert!(!ended.in_maintenance);
    assert_eq!(ended.maintenance_change, Some(EventKind::MaintenanceEnd));

    let events = rig.backend.list_events(1, start_time()).await.unwrap();
    assert_eq!(
        kinds(&events),
        vec![EventKind::MaintenanceStart, EventKind::MaintenanceEnd]
    );
    assert_eq!(events[0].message, "maintenance started: db upgrade");
}

#[tokio::test]
async fn test_tag_window_covers_tagged_targets_only() {
    let mut tagged = tcp_target(1, "edge");
    tagged.tags = tags(&["edge", "eu"]);
    let plain = tcp_target(2, "core");

    let rig = TestRig::new(&[tagged, plain], EngineSettings::default()).await;
    rig.backend
        .create_window(&NewMaintenanceWindow {
            name: "edge rollout".to_string(),
            target_id: None,
            tags: tags(&["edge"]),
            starts_at: start_time() - chrono::Duration::minutes(5),
            ends_at: start_time() + chrono::Duration::minutes(30),
            is_active: true,
        })
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    assert!(rig.engine.check_now(1, &cancel).await.unwrap().in_maintenance);
    assert!(!rig.engine.check_now(2, &cancel).await.unwrap().in_maintenance);
}

#[tokio::test]
async fn test_maintenance_silences_side_effects() {
    let mut target = tcp_target(1, "api");
    target.auto_incident = true;

    let rig = TestRig::with_probe(&[target], unthrottled(), Arc::new(SwitchProbe::new(false)))
        .await;
    rig.add_channel("ops").await;
    rig.backend
        .create_window(&NewMaintenanceWindow {
            name: "planned".to_string(),
            target_id: Some(1),
            tags: Default::default(),
            starts_at: start_time(),
            ends_at: start_time() + chrono::Duration::hours(1),
            is_active: true,
        })
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    let outcome = rig.engine.check_now(1, &cancel).await.unwrap();

    assert!(outcome.in_maintenance);
    assert!(outcome.notification.is_none());
    assert!(outcome.incident.is_none());
    assert!(rig.sender.sent().is_empty());
    assert!(
        rig.backend
            .find_open_incident_by_source(MONITORING_SOURCE, "1")
            .await
            .unwrap()
            .is_none()
    );

    let state = rig.backend.get_state(1).await.unwrap().unwrap();
    assert_eq!(state.status, Status::Down);
    assert!(state.maintenance_active);

    let events = rig.backend.list_events(1, start_time()).await.unwrap();
    assert_eq!(
        kinds(&events),
        vec![EventKind::MaintenanceStart, EventKind::Down]
    );
}

#[tokio::test]
async fn test_concurrent_checks_of_one_target_report_one_transition() {
    let probe = Arc::new(SwitchProbe::with_delay(
        false,
        std::time::Duration::from_millis(30),
    ));
    let rig = TestRig::with_probe(&[tcp_target(1, "api")], unthrottled(), probe).await;
    rig.add_channel("ops").await;

    let mut tasks = vec![];
    for _ in 0..5 {
        let engine = rig.engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.check_now(1, &CancellationToken::new()).await
        }));
    }

    let mut transitions = 0;
    for task in tasks {
        if task.await.unwrap().unwrap().transition {
            transitions += 1;
        }
    }

    assert_eq!(transitions, 1);
    assert_eq!(rig.probe.calls(), 5);
    assert_eq!(rig.backend.list_events(1, start_time()).await.unwrap().len(), 1);
    assert_eq!(rig.backend.list_metrics(1, start_time()).await.unwrap().len(), 5);
    assert_eq!(rig.sender.sent().len(), 1);
    assert_eq!(rig.engine.tracked_locks(), 0);
}

#[tokio::test]
async fn test_checks_of_different_targets_run_in_parallel() {
    let probe = Arc::new(SwitchProbe::with_delay(
        true,
        std::time::Duration::from_millis(200),
    ));
    let targets: Vec<_> = (1..=4).map(|id| tcp_target(id, &format!("t{id}"))).collect();
    let rig = TestRig::with_probe(&targets, EngineSettings::default(), probe).await;

    let started = std::time::Instant::now();
    let checks = (1..=4).map(|id| {
        let engine = rig.engine.clone();
        async move { engine.check_now(id, &CancellationToken::new()).await }
    });
    for result in futures::future::join_all(checks).await {
        result.unwrap();
    }

    assert!(
        started.elapsed() < std::time::Duration::from_millis(700),
        "checks were serialized: {:?}",
        started.elapsed()
    );
}

/// State store whose commit always fails
struct BrokenCommit;

#[async_trait]
impl StateStore for BrokenCommit {
    async fn get_state(&self, _target_id: TargetId) -> StorageResult<Option<TargetState>> {
        Ok(None)
    }

    async fn list_states(&self) -> StorageResult<Vec<TargetState>> {
        Ok(Vec::new())
    }

    async fn commit_check(&self, _state: &TargetState, _events: &[NewEvent]) -> StorageResult<()> {
        Err(StorageError::QueryFailed("disk full".to_string()))
    }
}

#[tokio::test]
async fn test_store_failure_aborts_check() {
    let backend = Arc::new(MemoryBackend::new());
    backend.upsert_target(&tcp_target(1, "api")).await.unwrap();

    let mut stores = Stores::from_backend(backend.clone());
    stores.states = Arc::new(BrokenCommit);

    let dispatcher = NotificationDispatcher::new(
        stores.channels.clone(),
        Arc::new(AesGcmEncryptor::from_passphrase(PASSPHRASE)),
    );
    let engine = Engine::new(
        stores,
        Arc::new(SwitchProbe::new(true)),
        dispatcher,
        EngineSettings::default(),
        "INC-{seq}",
    );

    let result = engine.check_now(1, &CancellationToken::new()).await;

    assert_matches!(result, Err(EngineError::Storage(StorageError::QueryFailed(_))));
    let since = engine.now() - chrono::Duration::hours(1);
    assert!(backend.list_events(1, since).await.unwrap().is_empty());
}

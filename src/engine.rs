//! Engine - the per-target state machine
//!
//! [`Engine::check_now`] runs one complete check of one target:
//!
//! ```text
//! lock target → load state → probe → metric row
//!     → maintenance overlay diff → status diff
//!     → (outside maintenance) notification + auto-incident
//!     → commit state + events atomically → unlock
//! ```
//!
//! Checks of the same target are serialized through a per-target lock held
//! from the state read to the commit, so two racing checks can never both
//! observe the same previous status. Different targets never contend.
//!
//! Store failures abort the check. Notification and incident failures are
//! logged and reported in the [`CheckOutcome`] but never stop the commit.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineSettings;
use crate::incident::{AutoIncidentManager, IncidentAction};
use crate::maintenance::MaintenanceResolver;
use crate::model::{EventKind, Metric, NewEvent, Status, Target, TargetId, TargetState};
use crate::notify::{DispatchOutcome, NotificationDispatcher, NotificationKind, reminder_due};
use crate::prober::{CheckResult, Probe};
use crate::storage::{StorageError, Stores};

#[derive(Debug)]
pub enum EngineError {
    /// A store read or write failed; nothing of this check was committed
    Storage(StorageError),

    TargetNotFound(TargetId),

    /// Cancelled before the probe started
    Cancelled,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Storage(err) => write!(f, "storage failure: {}", err),
            EngineError::TargetNotFound(id) => write!(f, "target {} not found", id),
            EngineError::Cancelled => write!(f, "check cancelled"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        EngineError::Storage(err)
    }
}

/// Everything one `check_now` call did
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub target_id: TargetId,
    pub checked_at: DateTime<Utc>,
    pub result: CheckResult,
    /// `None` on the very first check
    pub previous_status: Option<Status>,
    pub status: Status,
    /// An `up`/`down` event was emitted
    pub transition: bool,
    pub in_maintenance: bool,
    /// `MaintenanceStart` or `MaintenanceEnd` when the overlay flipped
    pub maintenance_change: Option<EventKind>,
    /// Set when a notification was attempted
    pub notification: Option<(NotificationKind, DispatchOutcome)>,
    pub incident: Option<IncidentAction>,
    /// Side-effect failures (notification or incident) that were swallowed
    pub side_effect_errors: Vec<String>,
}

type LockMap = Mutex<HashMap<TargetId, Arc<tokio::sync::Mutex<()>>>>;

/// Holds a target's lock for one check and drops the map entry once no
/// other check is waiting on it
struct TargetSlot<'a> {
    locks: &'a LockMap,
    target_id: TargetId,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for TargetSlot<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(&self.target_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.target_id);
        }
    }
}

pub struct Engine {
    stores: Stores,
    prober: Arc<dyn Probe>,
    maintenance: MaintenanceResolver,
    dispatcher: NotificationDispatcher,
    incidents: AutoIncidentManager,
    clock: Arc<dyn Clock>,
    settings: RwLock<EngineSettings>,
    locks: LockMap,
}

impl Engine {
    pub fn new(
        stores: Stores,
        prober: Arc<dyn Probe>,
        dispatcher: NotificationDispatcher,
        settings: EngineSettings,
        registration_template: impl Into<String>,
    ) -> Self {
        Self {
            maintenance: MaintenanceResolver::new(stores.maintenance.clone()),
            incidents: AutoIncidentManager::new(stores.incidents.clone(), registration_template),
            stores,
            prober,
            dispatcher,
            clock: Arc::new(SystemClock),
            settings: RwLock::new(settings),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Snapshot of the current settings
    pub fn settings(&self) -> EngineSettings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the settings; checks already running keep their snapshot
    pub fn update_settings(&self, settings: EngineSettings) {
        *self.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }

    fn target_lock(&self, target_id: TargetId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(target_id).or_default().clone()
    }

    /// Number of targets with a live lock entry
    pub fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Run one check of one target and commit its outcome
    #[instrument(skip(self, cancel))]
    pub async fn check_now(
        &self,
        target_id: TargetId,
        cancel: &CancellationToken,
    ) -> Result<CheckOutcome, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let mut slot = TargetSlot {
            locks: &self.locks,
            target_id,
            guard: None,
        };
        slot.guard = Some(tokio::select! {
            guard = self.target_lock(target_id).lock_owned() => guard,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        });

        let target = self
            .stores
            .targets
            .get_target(target_id)
            .await?
            .ok_or(EngineError::TargetNotFound(target_id))?;
        let previous = self.stores.states.get_state(target_id).await?;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let settings = self.settings();
        let result = self.prober.probe(&target, &settings).await;
        let now = self.clock.now();

        self.stores
            .events
            .add_metric(&Metric {
                target_id,
                at: now,
                latency_ms: result.latency_ms(),
                ok: result.ok,
                error: result.error_message(),
            })
            .await?;

        let status = if result.ok { Status::Up } else { Status::Down };
        let previous_status = previous.as_ref().map(|s| s.status);
        let was_in_maintenance = previous.as_ref().is_some_and(|s| s.maintenance_active);
        let mut last_notified_at = previous.as_ref().and_then(|s| s.last_notified_at);

        let windows = self
            .maintenance
            .active_windows(target_id, &target.tags, now)
            .await?;
        let in_maintenance = !windows.is_empty();

        let mut events = Vec::new();

        let maintenance_change = match (was_in_maintenance, in_maintenance) {
            (false, true) => {
                let names: Vec<&str> = windows.iter().map(|w| w.name.as_str()).collect();
                events.push(NewEvent {
                    target_id,
                    at: now,
                    kind: EventKind::MaintenanceStart,
                    message: format!("maintenance started: {}", names.join(", ")),
                });
                Some(EventKind::MaintenanceStart)
            }
            (true, false) => {
                events.push(NewEvent {
                    target_id,
                    at: now,
                    kind: EventKind::MaintenanceEnd,
                    message: "maintenance ended".to_string(),
                });
                Some(EventKind::MaintenanceEnd)
            }
            _ => None,
        };

        // the first up check only records the baseline, a first down is an outage
        let transition = match previous_status {
            None => status == Status::Down,
            Some(prev) => prev != status,
        };
        if transition {
            let (kind, message) = match status {
                Status::Up => (
                    EventKind::Up,
                    format!("target up ({} ms)", result.latency_ms()),
                ),
                Status::Down => (
                    EventKind::Down,
                    format!(
                        "target down: {}",
                        result.error_message().unwrap_or_default()
                    ),
                ),
            };
            info!("{} is now {}", target.name, status);
            events.push(NewEvent {
                target_id,
                at: now,
                kind,
                message,
            });
        }

        let mut outcome = CheckOutcome {
            target_id,
            checked_at: now,
            previous_status,
            status,
            transition,
            in_maintenance,
            maintenance_change,
            notification: None,
            incident: None,
            side_effect_errors: Vec::new(),
            result,
        };

        if in_maintenance {
            debug!("in maintenance, side effects suppressed");
        } else {
            let notification = match (previous_status, status) {
                (_, Status::Down) if transition => Some(NotificationKind::Down),
                (Some(Status::Down), Status::Up) => Some(NotificationKind::Up),
                (Some(Status::Down), Status::Down)
                    if reminder_due(last_notified_at, now, &settings) =>
                {
                    Some(NotificationKind::StillDown)
                }
                _ => None,
            };

            if let Some(kind) = notification {
                self.notify(&target, kind, last_notified_at, now, &settings, &mut outcome)
                    .await;
                if outcome
                    .notification
                    .is_some_and(|(_, dispatched)| dispatched.delivered())
                {
                    last_notified_at = Some(now);
                }
            }

            if target.auto_incident {
                self.reconcile_incident(&target, now, &mut outcome).await;
            }
        }

        let state = TargetState {
            target_id,
            status,
            last_error: outcome.result.error_message(),
            maintenance_active: in_maintenance,
            last_checked_at: now,
            last_notified_at,
        };
        self.stores.states.commit_check(&state, &events).await?;

        debug!(
            "check committed: status={} transition={} events={}",
            status,
            transition,
            events.len()
        );

        Ok(outcome)
    }

    async fn notify(
        &self,
        target: &Target,
        kind: NotificationKind,
        last_notified_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        settings: &EngineSettings,
        outcome: &mut CheckOutcome,
    ) {
        let detail = outcome.result.error_message();
        match self
            .dispatcher
            .dispatch(kind, target, detail.as_deref(), last_notified_at, now, settings)
            .await
        {
            Ok(dispatched) => outcome.notification = Some((kind, dispatched)),
            Err(e) => {
                warn!("failed to load notification channels: {}", e);
                outcome
                    .side_effect_errors
                    .push(format!("notification: {}", e));
            }
        }
    }

    /// Level-triggered: a down check ensures an open incident, an up check
    /// closes it. Checks inside maintenance never get here.
    async fn reconcile_incident(
        &self,
        target: &Target,
        now: DateTime<Utc>,
        outcome: &mut CheckOutcome,
    ) {
        let action = match outcome.status {
            Status::Down => {
                let detail = outcome.result.error_message().unwrap_or_default();
                self.incidents.on_down(target, &detail, now).await
            }
            Status::Up => self.incidents.on_up(target, now).await,
        };

        match action {
            Ok(action) => outcome.incident = Some(action),
            Err(e) => {
                warn!("auto-incident update failed: {}", e);
                outcome.side_effect_errors.push(format!("incident: {}", e));
            }
        }
    }
}

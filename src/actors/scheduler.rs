//! SchedulerActor - dispatches due checks to a bounded worker pool
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick ──(engine_enabled?)──► scan active targets → pick due ones
//!     ↑                                        │ skip targets already in flight
//!     │                                        ▼
//!     │                      JoinSet task: acquire permit → Engine::check_now
//!     │
//!     └─── Commands (CheckNow, TickNow, Shutdown)
//! ```
//!
//! The semaphore bounds the number of concurrent probes, not correctness:
//! the engine serializes checks of one target on its own.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{EngineSettings, SchedulerConfig};
use crate::engine::{CheckOutcome, Engine, EngineError};
use crate::model::{Target, TargetId};
use crate::storage::StorageResult;

use super::messages::{SchedulerCommand, TickReport};

/// Whether a target's check interval has elapsed
///
/// A target that was never checked is always due. An interval too large for
/// chrono is never due again.
pub fn is_due(
    target: &Target,
    last_checked_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    settings: &EngineSettings,
) -> bool {
    match last_checked_at {
        None => true,
        Some(last) => chrono::Duration::from_std(target.interval(settings))
            .is_ok_and(|interval| now - last >= interval),
    }
}

/// Removes a target from the in-flight set when its check task ends
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<TargetId>>>,
    target_id: TargetId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.target_id);
    }
}

/// Tick logic and the worker pool, usable without the actor loop
pub struct Scheduler {
    engine: Arc<Engine>,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<TargetId>>>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, max_concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            tasks: JoinSet::new(),
            cancel,
        }
    }

    /// Scan for due targets and hand them to the worker pool
    #[instrument(skip(self))]
    pub async fn tick(&mut self) -> StorageResult<TickReport> {
        let stores = self.engine.stores();
        let targets = stores.targets.list_active_targets().await?;
        let last_checked: HashMap<TargetId, DateTime<Utc>> = stores
            .states
            .list_states()
            .await?
            .into_iter()
            .map(|s| (s.target_id, s.last_checked_at))
            .collect();

        let now = self.engine.now();
        let settings = self.engine.settings();
        let mut report = TickReport::default();

        for target in targets {
            if !is_due(&target, last_checked.get(&target.id).copied(), now, &settings) {
                continue;
            }
            report.due += 1;

            let newly_added = self
                .in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(target.id);
            if !newly_added {
                trace!(target_id = target.id, "check still running, skipping");
                report.in_flight += 1;
                continue;
            }

            self.spawn_check(target.id);
            report.dispatched += 1;
        }

        if report.dispatched > 0 {
            debug!(
                "dispatched {} of {} due targets ({} in flight)",
                report.dispatched, report.due, report.in_flight
            );
        }

        Ok(report)
    }

    fn spawn_check(&mut self, target_id: TargetId) {
        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            target_id,
        };
        let engine = self.engine.clone();
        let permits = self.permits.clone();
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };

            match engine.check_now(target_id, &cancel).await {
                Ok(outcome) => trace!(target_id, "check finished: {}", outcome.status),
                Err(EngineError::Cancelled) => debug!(target_id, "check cancelled"),
                Err(e) => error!(target_id, "check failed: {}", e),
            }
        });
    }

    /// Run a check outside the tick, answering on `respond_to`
    ///
    /// Direct checks skip the worker pool bound.
    fn spawn_direct(
        &mut self,
        target_id: TargetId,
        respond_to: oneshot::Sender<Result<CheckOutcome, EngineError>>,
    ) {
        let engine = self.engine.clone();
        let cancel = self.cancel.clone();

        self.tasks.spawn(async move {
            let result = engine.check_now(target_id, &cancel).await;
            let _ = respond_to.send(result);
        });
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Wait for every spawned check to finish
    pub async fn wait_idle(&mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!("check task panicked: {}", e);
            }
        }
    }
}

/// Actor owning the scheduler loop
pub struct SchedulerActor {
    scheduler: Scheduler,
    command_rx: mpsc::Receiver<SchedulerCommand>,
    tick_period: Duration,
    cancel: CancellationToken,
}

impl SchedulerActor {
    pub fn new(
        engine: Arc<Engine>,
        config: &SchedulerConfig,
        command_rx: mpsc::Receiver<SchedulerCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(engine, config.max_concurrency, cancel.child_token()),
            command_rx,
            tick_period: Duration::from_secs(config.tick_seconds.max(1)),
            cancel,
        }
    }

    /// Run the actor's main loop
    ///
    /// This runs until:
    /// - A Shutdown command is received
    /// - The cancellation token fires
    /// - The command channel is closed
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        info!("scheduler started, tick every {:?}", self.tick_period);

        let mut ticker = interval(self.tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown_ack = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.scheduler.engine.settings().engine_enabled {
                        if let Err(e) = self.scheduler.tick().await {
                            error!("scheduler tick failed: {}", e);
                        }
                    } else {
                        trace!("engine disabled, skipping tick");
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SchedulerCommand::CheckNow { target_id, respond_to }) => {
                            debug!(target_id, "received CheckNow command");
                            self.scheduler.spawn_direct(target_id, respond_to);
                        }

                        Some(SchedulerCommand::TickNow { respond_to }) => {
                            let _ = respond_to.send(self.scheduler.tick().await);
                        }

                        Some(SchedulerCommand::Shutdown { respond_to }) => {
                            debug!("received shutdown command");
                            shutdown_ack = Some(respond_to);
                            break;
                        }

                        None => {
                            warn!("command channel closed, shutting down");
                            break;
                        }
                    }
                }

                Some(result) = self.scheduler.tasks.join_next(), if !self.scheduler.tasks.is_empty() => {
                    if let Err(e) = result {
                        error!("check task panicked: {}", e);
                    }
                }

                _ = self.cancel.cancelled() => {
                    debug!("cancellation requested");
                    break;
                }
            }
        }

        // new checks see the token and bail out before probing
        self.scheduler.cancel.cancel();
        self.scheduler.wait_idle().await;

        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }

        info!("scheduler stopped");
    }
}

/// Handle for controlling a SchedulerActor
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    /// Spawn a new scheduler actor
    pub fn spawn(engine: Arc<Engine>, config: &SchedulerConfig, cancel: CancellationToken) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let actor = SchedulerActor::new(engine, config, cmd_rx, cancel);

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Check one target now and wait for its outcome
    pub async fn check_now(&self, target_id: TargetId) -> anyhow::Result<CheckOutcome> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::CheckNow {
                target_id,
                respond_to: tx,
            })
            .await?;

        Ok(rx.await??)
    }

    /// Scan for due targets right away
    pub async fn tick_now(&self) -> anyhow::Result<TickReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::TickNow { respond_to: tx })
            .await?;

        Ok(rx.await??)
    }

    /// Stop the scheduler and wait until in-flight checks are done
    pub async fn shutdown(self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SchedulerCommand::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

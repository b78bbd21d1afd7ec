//! RetentionActor - periodic pruning of the check history
//!
//! Metrics older than `metrics_retention_days` are always pruned. Events are
//! only pruned when `events_retention_days` is configured.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::RetentionConfig;
use crate::storage::{EventStore, StorageResult};

use super::messages::{RetentionCommand, RetentionReport};

/// Delete everything older than the configured retention, relative to `now`
pub async fn prune(
    store: &dyn EventStore,
    config: &RetentionConfig,
    now: DateTime<Utc>,
) -> StorageResult<RetentionReport> {
    let metrics_deleted = match cutoff(now, config.metrics_retention_days) {
        Some(cutoff) => store.delete_metrics_before(cutoff).await?,
        None => 0,
    };

    let events_deleted = match config.events_retention_days.and_then(|days| cutoff(now, days)) {
        Some(cutoff) => store.delete_events_before(cutoff).await?,
        None => 0,
    };

    Ok(RetentionReport {
        metrics_deleted,
        events_deleted,
    })
}

/// `now` minus `days`, or `None` when that lies before the earliest representable time
fn cutoff(now: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
    chrono::Duration::try_days(i64::from(days)).and_then(|age| now.checked_sub_signed(age))
}

pub struct RetentionActor {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
    command_rx: mpsc::Receiver<RetentionCommand>,
    cancel: CancellationToken,
}

impl RetentionActor {
    pub fn new(
        store: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
        config: RetentionConfig,
        command_rx: mpsc::Receiver<RetentionCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            command_rx,
            cancel,
        }
    }

    async fn sweep(&self) -> StorageResult<RetentionReport> {
        let report = prune(self.store.as_ref(), &self.config, self.clock.now()).await?;

        if report.metrics_deleted > 0 || report.events_deleted > 0 {
            info!(
                metrics = report.metrics_deleted,
                events = report.events_deleted,
                "retention: purged old rows"
            );
        } else {
            debug!("retention: no rows to purge");
        }

        Ok(report)
    }

    #[instrument(skip(self))]
    pub async fn run(mut self) {
        let period =
            Duration::from_secs(u64::from(self.config.cleanup_interval_hours.max(1)) * 3600);
        info!(
            metrics_retention_days = self.config.metrics_retention_days,
            events_retention_days = ?self.config.events_retention_days,
            interval_secs = period.as_secs(),
            "retention job started"
        );

        if let Err(e) = self.sweep().await {
            error!(error = %e, "retention: cleanup failed");
        }

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("retention job stopping");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "retention: cleanup failed");
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(RetentionCommand::RunNow { respond_to }) => {
                            let _ = respond_to.send(self.sweep().await);
                        }
                        Some(RetentionCommand::Shutdown) => break,
                        None => {
                            warn!("command channel closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }
}

/// Handle for controlling a RetentionActor
#[derive(Clone)]
pub struct RetentionHandle {
    sender: mpsc::Sender<RetentionCommand>,
}

impl RetentionHandle {
    pub fn spawn(
        store: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
        config: RetentionConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let actor = RetentionActor::new(store, clock, config, cmd_rx, cancel);

        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    pub async fn run_now(&self) -> anyhow::Result<RetentionReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RetentionCommand::RunNow { respond_to: tx })
            .await?;

        Ok(rx.await??)
    }

    pub async fn shutdown(self) {
        let _ = self.sender.send(RetentionCommand::Shutdown).await;
    }
}

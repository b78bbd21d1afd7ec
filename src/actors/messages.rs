//! Message types for actor communication
//!
//! Every actor owns an mpsc command channel; request/response commands carry
//! a oneshot `respond_to` sender.

use tokio::sync::oneshot;

use crate::engine::{CheckOutcome, EngineError};
use crate::model::TargetId;
use crate::storage::StorageResult;

/// Commands that can be sent to the SchedulerActor
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Check one target right away, regardless of `engine_enabled` and its interval
    ///
    /// Used for the operator "check now" action.
    CheckNow {
        target_id: TargetId,
        respond_to: oneshot::Sender<Result<CheckOutcome, EngineError>>,
    },

    /// Run a scan for due targets immediately (bypassing the tick timer)
    TickNow {
        respond_to: oneshot::Sender<StorageResult<TickReport>>,
    },

    /// Stop ticking, wait for in-flight checks, then exit
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Result of one scan for due targets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Active targets whose interval has elapsed
    pub due: usize,

    /// Checks handed to the worker pool
    pub dispatched: usize,

    /// Due targets skipped because a check is still running
    pub in_flight: usize,
}

/// Commands that can be sent to the RetentionActor
#[derive(Debug)]
pub enum RetentionCommand {
    /// Prune right away (bypassing the cleanup interval)
    RunNow {
        respond_to: oneshot::Sender<StorageResult<RetentionReport>>,
    },

    Shutdown,
}

/// Rows removed by one retention sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub metrics_deleted: usize,
    pub events_deleted: usize,
}

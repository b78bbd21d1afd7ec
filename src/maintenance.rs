//! Maintenance resolver
//!
//! Answers "which maintenance windows apply to this target right now".
//! Windows are never merged; callers usually only need [`MaintenanceResolver::in_maintenance`].

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::model::{MaintenanceWindow, TargetId};
use crate::storage::{MaintenanceStore, StorageResult};

#[derive(Clone)]
pub struct MaintenanceResolver {
    store: Arc<dyn MaintenanceStore>,
}

impl MaintenanceResolver {
    pub fn new(store: Arc<dyn MaintenanceStore>) -> Self {
        Self { store }
    }

    /// All active windows covering the target at `now`
    pub async fn active_windows(
        &self,
        target_id: TargetId,
        tags: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<MaintenanceWindow>> {
        let windows = self.store.active_windows_for(target_id, tags, now).await?;
        trace!(target_id, "{} active maintenance windows", windows.len());
        Ok(windows)
    }

    pub async fn in_maintenance(
        &self,
        target_id: TargetId,
        tags: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        Ok(!self.active_windows(target_id, tags, now).await?.is_empty())
    }
}

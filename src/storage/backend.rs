//! Collaborator contracts consumed by the engine
//!
//! The engine never talks to a database directly. Every store it needs is a
//! trait in this module; [`MemoryBackend`](super::memory::MemoryBackend) and
//! [`SqliteBackend`](super::sqlite::SqliteBackend) implement all of them.
//!
//! ## Thread Safety
//!
//! Implementations must be `Send + Sync` as they are shared across the
//! scheduler's worker tasks.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use crate::model::{
    Event, EventFeedFilter, Incident, MaintenanceWindow, Metric, NewEvent, NewIncident,
    NewMaintenanceWindow, NewNotificationChannel, NotificationChannel, Target, TargetId,
    TargetState, UptimeStats,
};

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Read access to target configuration
///
/// Targets are created and edited by the admin layer; `upsert_target` exists
/// for bootstrap seeding and tests.
#[async_trait]
pub trait TargetStore: Send + Sync {
    async fn upsert_target(&self, target: &Target) -> StorageResult<()>;

    async fn get_target(&self, id: TargetId) -> StorageResult<Option<Target>>;

    async fn list_active_targets(&self) -> StorageResult<Vec<Target>>;
}

/// The per-target state record
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_state(&self, target_id: TargetId) -> StorageResult<Option<TargetState>>;

    async fn list_states(&self) -> StorageResult<Vec<TargetState>>;

    /// Append `events` and write `state` as one atomic step.
    ///
    /// Either everything is visible afterwards or nothing is.
    async fn commit_check(&self, state: &TargetState, events: &[NewEvent]) -> StorageResult<()>;
}

/// Append-only metric and event history
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn add_metric(&self, metric: &Metric) -> StorageResult<()>;

    /// Metrics of one target at or after `since`, oldest first
    async fn list_metrics(
        &self,
        target_id: TargetId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<Metric>>;

    /// Delete metrics strictly older than `cutoff`, returning how many were removed
    async fn delete_metrics_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize>;

    async fn add_event(&self, event: &NewEvent) -> StorageResult<i64>;

    /// Events of one target at or after `since`, oldest first
    async fn list_events(
        &self,
        target_id: TargetId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<Event>>;

    /// Cross-target feed, newest first
    async fn list_events_feed(&self, filter: &EventFeedFilter) -> StorageResult<Vec<Event>>;

    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize>;

    /// Availability of a target computed from its metric rows
    async fn uptime(
        &self,
        target_id: TargetId,
        since: DateTime<Utc>,
    ) -> StorageResult<UptimeStats> {
        let metrics = self.list_metrics(target_id, since).await?;
        Ok(UptimeStats::from_metrics(&metrics))
    }
}

/// Maintenance window CRUD plus the resolver query
#[async_trait]
pub trait MaintenanceStore: Send + Sync {
    async fn create_window(&self, window: &NewMaintenanceWindow) -> StorageResult<i64>;

    async fn update_window(&self, window: &MaintenanceWindow) -> StorageResult<()>;

    async fn delete_window(&self, id: i64) -> StorageResult<bool>;

    async fn get_window(&self, id: i64) -> StorageResult<Option<MaintenanceWindow>>;

    async fn list_windows(&self) -> StorageResult<Vec<MaintenanceWindow>>;

    /// All windows that put the target into maintenance at `now`
    async fn active_windows_for(
        &self,
        target_id: TargetId,
        tags: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<MaintenanceWindow>>;
}

#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn add_channel(&self, channel: &NewNotificationChannel) -> StorageResult<i64>;

    async fn list_active_channels(&self) -> StorageResult<Vec<NotificationChannel>>;
}

/// The platform's incident records, as far as the engine needs them
#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn find_open_incident_by_source(
        &self,
        source: &str,
        source_id: &str,
    ) -> StorageResult<Option<Incident>>;

    /// Create an open incident; its registration number is rendered from
    /// `registration_template` with the new sequence number.
    async fn create_incident(
        &self,
        incident: &NewIncident,
        registration_template: &str,
    ) -> StorageResult<Incident>;

    /// Close an incident, returning false if it was not open
    async fn close_incident(&self, id: i64, closed_at: DateTime<Utc>) -> StorageResult<bool>;

    async fn list_incidents_by_source(
        &self,
        source: &str,
        source_id: &str,
    ) -> StorageResult<Vec<Incident>>;
}

/// A backend providing every store the engine consumes
#[async_trait]
pub trait StorageBackend:
    TargetStore + StateStore + EventStore + MaintenanceStore + ChannelStore + IncidentStore
{
    /// Performs a lightweight operation to verify the backend is operational
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Release connections and flush pending writes
    async fn close(&self) -> StorageResult<()>;
}

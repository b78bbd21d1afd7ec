//! In-memory storage backend (no persistence)
//!
//! Keeps every record in plain collections behind one `RwLock`.
//! It's useful for:
//! - Testing the engine without database dependencies
//! - Running the daemon with `storage.backend = "none"`
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Linear scans**: Feed and metric queries walk the whole history

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{
    ChannelStore, EventStore, HealthStatus, IncidentStore, MaintenanceStore, StateStore,
    StorageBackend, TargetStore,
};
use super::error::{StorageError, StorageResult};
use crate::incident::render_registration_number;
use crate::model::{
    Event, EventFeedFilter, Incident, IncidentStatus, MaintenanceWindow, Metric, NewEvent,
    NewIncident, NewMaintenanceWindow, NewNotificationChannel, NotificationChannel, Target,
    TargetId, TargetState,
};

#[derive(Default)]
struct Inner {
    targets: BTreeMap<TargetId, Target>,
    states: HashMap<TargetId, TargetState>,
    metrics: Vec<Metric>,
    events: Vec<Event>,
    windows: BTreeMap<i64, MaintenanceWindow>,
    channels: BTreeMap<i64, NotificationChannel>,
    incidents: BTreeMap<i64, Incident>,
    last_event_id: i64,
    last_window_id: i64,
    last_channel_id: i64,
    last_incident_id: i64,
}

impl Inner {
    fn push_event(&mut self, event: &NewEvent) -> i64 {
        self.last_event_id += 1;
        self.events.push(Event {
            id: self.last_event_id,
            target_id: event.target_id,
            at: event.at,
            kind: event.kind,
            message: event.message.clone(),
        });
        self.last_event_id
    }
}

/// In-memory storage backend
#[derive(Default)]
pub struct MemoryBackend {
    inner: RwLock<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TargetStore for MemoryBackend {
    async fn upsert_target(&self, target: &Target) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        inner.targets.insert(target.id, target.clone());
        Ok(())
    }

    async fn get_target(&self, id: TargetId) -> StorageResult<Option<Target>> {
        Ok(self.inner.read().await.targets.get(&id).cloned())
    }

    async fn list_active_targets(&self) -> StorageResult<Vec<Target>> {
        let inner = self.inner.read().await;
        Ok(inner
            .targets
            .values()
            .filter(|t| t.is_active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl StateStore for MemoryBackend {
    async fn get_state(&self, target_id: TargetId) -> StorageResult<Option<TargetState>> {
        Ok(self.inner.read().await.states.get(&target_id).cloned())
    }

    async fn list_states(&self) -> StorageResult<Vec<TargetState>> {
        let inner = self.inner.read().await;
        let mut states: Vec<TargetState> = inner.states.values().cloned().collect();
        states.sort_by_key(|s| s.target_id);
        Ok(states)
    }

    async fn commit_check(&self, state: &TargetState, events: &[NewEvent]) -> StorageResult<()> {
        // one write guard covers the whole commit
        let mut inner = self.inner.write().await;
        for event in events {
            inner.push_event(event);
        }
        inner.states.insert(state.target_id, state.clone());
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryBackend {
    async fn add_metric(&self, metric: &Metric) -> StorageResult<()> {
        self.inner.write().await.metrics.push(metric.clone());
        Ok(())
    }

    async fn list_metrics(
        &self,
        target_id: TargetId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<Metric>> {
        let inner = self.inner.read().await;
        let mut metrics: Vec<Metric> = inner
            .metrics
            .iter()
            .filter(|m| m.target_id == target_id && m.at >= since)
            .cloned()
            .collect();
        metrics.sort_by_key(|m| m.at);
        Ok(metrics)
    }

    async fn delete_metrics_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let mut inner = self.inner.write().await;
        let before = inner.metrics.len();
        inner.metrics.retain(|m| m.at >= cutoff);
        let deleted = before - inner.metrics.len();
        debug!("deleted {} metrics from memory", deleted);
        Ok(deleted)
    }

    async fn add_event(&self, event: &NewEvent) -> StorageResult<i64> {
        Ok(self.inner.write().await.push_event(event))
    }

    async fn list_events(
        &self,
        target_id: TargetId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<Event>> {
        let inner = self.inner.read().await;
        let mut events: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| e.target_id == target_id && e.at >= since)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.at, e.id));
        Ok(events)
    }

    async fn list_events_feed(&self, filter: &EventFeedFilter) -> StorageResult<Vec<Event>> {
        let inner = self.inner.read().await;

        let tagged = |target_id: TargetId| -> bool {
            filter.tags.is_empty()
                || inner
                    .targets
                    .get(&target_id)
                    .is_some_and(|t| !t.tags.is_disjoint(&filter.tags))
        };

        let mut events: Vec<Event> = inner
            .events
            .iter()
            .filter(|e| filter.since.is_none_or(|since| e.at >= since))
            .filter(|e| filter.kinds.is_empty() || filter.kinds.contains(&e.kind))
            .filter(|e| tagged(e.target_id))
            .cloned()
            .collect();

        events.sort_by(|a, b| (b.at, b.id).cmp(&(a.at, a.id)));
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let mut inner = self.inner.write().await;
        let before = inner.events.len();
        inner.events.retain(|e| e.at >= cutoff);
        Ok(before - inner.events.len())
    }
}

#[async_trait]
impl MaintenanceStore for MemoryBackend {
    async fn create_window(&self, window: &NewMaintenanceWindow) -> StorageResult<i64> {
        let mut inner = self.inner.write().await;
        inner.last_window_id += 1;
        let id = inner.last_window_id;
        inner.windows.insert(
            id,
            MaintenanceWindow {
                id,
                name: window.name.clone(),
                target_id: window.target_id,
                tags: window.tags.clone(),
                starts_at: window.starts_at,
                ends_at: window.ends_at,
                is_active: window.is_active,
            },
        );
        Ok(id)
    }

    async fn update_window(&self, window: &MaintenanceWindow) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        match inner.windows.get_mut(&window.id) {
            Some(existing) => {
                *existing = window.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound(format!(
                "maintenance window {}",
                window.id
            ))),
        }
    }

    async fn delete_window(&self, id: i64) -> StorageResult<bool> {
        Ok(self.inner.write().await.windows.remove(&id).is_some())
    }

    async fn get_window(&self, id: i64) -> StorageResult<Option<MaintenanceWindow>> {
        Ok(self.inner.read().await.windows.get(&id).cloned())
    }

    async fn list_windows(&self) -> StorageResult<Vec<MaintenanceWindow>> {
        Ok(self.inner.read().await.windows.values().cloned().collect())
    }

    async fn active_windows_for(
        &self,
        target_id: TargetId,
        tags: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<MaintenanceWindow>> {
        let inner = self.inner.read().await;
        Ok(inner
            .windows
            .values()
            .filter(|w| w.covers(target_id, tags, now))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ChannelStore for MemoryBackend {
    async fn add_channel(&self, channel: &NewNotificationChannel) -> StorageResult<i64> {
        let mut inner = self.inner.write().await;
        inner.last_channel_id += 1;
        let id = inner.last_channel_id;
        inner.channels.insert(
            id,
            NotificationChannel {
                id,
                kind: channel.kind.clone(),
                name: channel.name.clone(),
                secret: channel.secret.clone(),
                destination: channel.destination.clone(),
                silent: channel.silent,
                protect_content: channel.protect_content,
                is_default: channel.is_default,
                is_active: channel.is_active,
            },
        );
        Ok(id)
    }

    async fn list_active_channels(&self) -> StorageResult<Vec<NotificationChannel>> {
        let inner = self.inner.read().await;
        Ok(inner
            .channels
            .values()
            .filter(|c| c.is_active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl IncidentStore for MemoryBackend {
    async fn find_open_incident_by_source(
        &self,
        source: &str,
        source_id: &str,
    ) -> StorageResult<Option<Incident>> {
        let inner = self.inner.read().await;
        Ok(inner
            .incidents
            .values()
            .find(|i| {
                i.status == IncidentStatus::Open && i.source == source && i.source_id == source_id
            })
            .cloned())
    }

    async fn create_incident(
        &self,
        incident: &NewIncident,
        registration_template: &str,
    ) -> StorageResult<Incident> {
        let mut inner = self.inner.write().await;

        let duplicate = inner.incidents.values().any(|i| {
            i.status == IncidentStatus::Open
                && i.source == incident.source
                && i.source_id == incident.source_id
        });
        if duplicate {
            return Err(StorageError::Conflict(format!(
                "open incident for {}/{} already exists",
                incident.source, incident.source_id
            )));
        }

        inner.last_incident_id += 1;
        let id = inner.last_incident_id;
        let created = Incident {
            id,
            registration_number: render_registration_number(
                registration_template,
                id,
                incident.opened_at,
            ),
            title: incident.title.clone(),
            description: incident.description.clone(),
            severity: incident.severity,
            status: IncidentStatus::Open,
            source: incident.source.clone(),
            source_id: incident.source_id.clone(),
            opened_at: incident.opened_at,
            closed_at: None,
        };
        inner.incidents.insert(id, created.clone());
        Ok(created)
    }

    async fn close_incident(&self, id: i64, closed_at: DateTime<Utc>) -> StorageResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.incidents.get_mut(&id) {
            Some(incident) if incident.status == IncidentStatus::Open => {
                incident.status = IncidentStatus::Closed;
                incident.closed_at = Some(closed_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_incidents_by_source(
        &self,
        source: &str,
        source_id: &str,
    ) -> StorageResult<Vec<Incident>> {
        let inner = self.inner.read().await;
        Ok(inner
            .incidents
            .values()
            .filter(|i| i.source == source && i.source_id == source_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let inner = self.inner.read().await;

        let mut metadata = HashMap::new();
        metadata.insert("backend".to_string(), "memory".to_string());
        metadata.insert("metrics".to_string(), inner.metrics.len().to_string());
        metadata.insert("events".to_string(), inner.events.len().to_string());

        Ok(HealthStatus {
            healthy: true,
            message: "in-memory backend operational".to_string(),
            metadata,
        })
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

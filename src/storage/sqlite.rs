//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Readers (dashboards, the feed) don't block the engine's writes
//! - **Connection pooling**: Shared by all scheduler workers
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! ## Limitations
//!
//! - **Concurrency**: One writer at a time; writes queue on the busy timeout
//! - **Distributed**: Single-machine only

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use tracing::{debug, info, instrument, warn};

use super::backend::{
    ChannelStore, EventStore, HealthStatus, IncidentStore, MaintenanceStore, StateStore,
    StorageBackend, TargetStore,
};
use super::error::{StorageError, StorageResult};
use super::schema::{
    TargetColumns, channel_from_row, decode_tags, encode_tags, event_from_row, incident_from_row,
    metric_from_row, state_from_row, target_from_row, to_millis, window_from_row,
};
use crate::incident::render_registration_number;
use crate::model::{
    Event, EventFeedFilter, Incident, IncidentStatus, MaintenanceWindow, Metric, NewEvent,
    NewIncident, NewMaintenanceWindow, NewNotificationChannel, NotificationChannel, Target,
    TargetId, TargetState,
};

const TARGET_COLUMNS: &str = "id, name, kind, url, method, allowed_status, host, port, \
     timeout_seconds, interval_seconds, tags, is_active, auto_incident, incident_severity, owner";

const INCIDENT_COLUMNS: &str = "id, registration_number, title, description, severity, status, \
     source, source_id, opened_at, closed_at";

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (or create) the database file and run migrations
    ///
    /// ## Example
    ///
    /// ```no_run
    /// # use guardia_watch::storage::sqlite::SqliteBackend;
    /// # async fn example() -> anyhow::Result<()> {
    /// let backend = SqliteBackend::new("./guardia.db").await?;
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }
}

#[async_trait]
impl TargetStore for SqliteBackend {
    #[instrument(skip(self, target), fields(target_id = target.id))]
    async fn upsert_target(&self, target: &Target) -> StorageResult<()> {
        let columns = TargetColumns::from_kind(&target.kind)?;

        sqlx::query(
            r#"
            INSERT INTO targets (
                id, name, kind, url, method, allowed_status, host, port,
                timeout_seconds, interval_seconds, tags, is_active, auto_incident,
                incident_severity, owner
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                url = excluded.url,
                method = excluded.method,
                allowed_status = excluded.allowed_status,
                host = excluded.host,
                port = excluded.port,
                timeout_seconds = excluded.timeout_seconds,
                interval_seconds = excluded.interval_seconds,
                tags = excluded.tags,
                is_active = excluded.is_active,
                auto_incident = excluded.auto_incident,
                incident_severity = excluded.incident_severity,
                owner = excluded.owner
            "#,
        )
        .bind(target.id)
        .bind(&target.name)
        .bind(columns.kind)
        .bind(columns.url)
        .bind(columns.method)
        .bind(columns.allowed_status)
        .bind(columns.host)
        .bind(columns.port)
        .bind(target.timeout_seconds.map(|v| v as i64))
        .bind(target.interval_seconds.map(|v| v as i64))
        .bind(encode_tags(&target.tags)?)
        .bind(target.is_active)
        .bind(target.auto_incident)
        .bind(target.incident_severity.map(|s| s.as_str()))
        .bind(&target.owner)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_target(&self, id: TargetId) -> StorageResult<Option<Target>> {
        let sql = format!("SELECT {TARGET_COLUMNS} FROM targets WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(target_from_row).transpose()
    }

    async fn list_active_targets(&self) -> StorageResult<Vec<Target>> {
        let sql = format!("SELECT {TARGET_COLUMNS} FROM targets WHERE is_active = 1 ORDER BY id");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;

        rows.iter().map(target_from_row).collect()
    }
}

#[async_trait]
impl StateStore for SqliteBackend {
    async fn get_state(&self, target_id: TargetId) -> StorageResult<Option<TargetState>> {
        let row = sqlx::query(
            r#"
            SELECT target_id, status, last_error, maintenance_active,
                   last_checked_at, last_notified_at
            FROM target_states
            WHERE target_id = ?
            "#,
        )
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(state_from_row).transpose()
    }

    async fn list_states(&self) -> StorageResult<Vec<TargetState>> {
        let rows = sqlx::query(
            r#"
            SELECT target_id, status, last_error, maintenance_active,
                   last_checked_at, last_notified_at
            FROM target_states
            ORDER BY target_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(state_from_row).collect()
    }

    #[instrument(
        skip(self, state, events),
        fields(target_id = state.target_id, events = events.len())
    )]
    async fn commit_check(&self, state: &TargetState, events: &[NewEvent]) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        for event in events {
            sqlx::query(
                "INSERT INTO events (target_id, timestamp, kind, message) VALUES (?, ?, ?, ?)",
            )
            .bind(event.target_id)
            .bind(to_millis(&event.at))
            .bind(event.kind.as_str())
            .bind(&event.message)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO target_states (
                target_id, status, last_error, maintenance_active,
                last_checked_at, last_notified_at
            )
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (target_id) DO UPDATE SET
                status = excluded.status,
                last_error = excluded.last_error,
                maintenance_active = excluded.maintenance_active,
                last_checked_at = excluded.last_checked_at,
                last_notified_at = excluded.last_notified_at
            "#,
        )
        .bind(state.target_id)
        .bind(state.status.as_str())
        .bind(&state.last_error)
        .bind(state.maintenance_active)
        .bind(to_millis(&state.last_checked_at))
        .bind(state.last_notified_at.as_ref().map(to_millis))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!("check committed");
        Ok(())
    }
}

#[async_trait]
impl EventStore for SqliteBackend {
    async fn add_metric(&self, metric: &Metric) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO metrics (target_id, timestamp, latency_ms, ok, error) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(metric.target_id)
        .bind(to_millis(&metric.at))
        .bind(metric.latency_ms.min(i64::MAX as u64) as i64)
        .bind(metric.ok)
        .bind(&metric.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_metrics(
        &self,
        target_id: TargetId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<Metric>> {
        let rows = sqlx::query(
            r#"
            SELECT target_id, timestamp, latency_ms, ok, error
            FROM metrics
            WHERE target_id = ? AND timestamp >= ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(target_id)
        .bind(to_millis(&since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(metric_from_row).collect()
    }

    #[instrument(skip(self), fields(cutoff = %cutoff))]
    async fn delete_metrics_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let result = sqlx::query("DELETE FROM metrics WHERE timestamp < ?")
            .bind(to_millis(&cutoff))
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() as usize;
        debug!("deleted {} old metrics", deleted);
        Ok(deleted)
    }

    async fn add_event(&self, event: &NewEvent) -> StorageResult<i64> {
        let result = sqlx::query(
            "INSERT INTO events (target_id, timestamp, kind, message) VALUES (?, ?, ?, ?)",
        )
        .bind(event.target_id)
        .bind(to_millis(&event.at))
        .bind(event.kind.as_str())
        .bind(&event.message)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn list_events(
        &self,
        target_id: TargetId,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT id, target_id, timestamp, kind, message
            FROM events
            WHERE target_id = ? AND timestamp >= ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(target_id)
        .bind(to_millis(&since))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn list_events_feed(&self, filter: &EventFeedFilter) -> StorageResult<Vec<Event>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT e.id, e.target_id, e.timestamp, e.kind, e.message, t.tags AS target_tags \
             FROM events e LEFT JOIN targets t ON t.id = e.target_id WHERE 1 = 1",
        );

        if let Some(since) = filter.since {
            query.push(" AND e.timestamp >= ").push_bind(to_millis(&since));
        }

        if !filter.kinds.is_empty() {
            query.push(" AND e.kind IN (");
            let mut kinds = query.separated(", ");
            for kind in &filter.kinds {
                kinds.push_bind(kind.as_str());
            }
            kinds.push_unseparated(")");
        }

        query.push(" ORDER BY e.timestamp DESC, e.id DESC");

        // tag filtering happens after decoding, so the limit can only be pushed
        // down when no tags are requested
        if filter.tags.is_empty() {
            if let Some(limit) = filter.limit {
                query.push(" LIMIT ").push_bind(limit as i64);
            }
        }

        let rows = query.build().fetch_all(&self.pool).await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            if !filter.tags.is_empty() {
                let raw: Option<String> = row.try_get("target_tags")?;
                let tags = decode_tags(raw.as_deref().unwrap_or_default())?;
                if tags.is_disjoint(&filter.tags) {
                    continue;
                }
            }
            events.push(event_from_row(row)?);
            if filter.limit.is_some_and(|limit| events.len() >= limit) {
                break;
            }
        }

        Ok(events)
    }

    #[instrument(skip(self), fields(cutoff = %cutoff))]
    async fn delete_events_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let result = sqlx::query("DELETE FROM events WHERE timestamp < ?")
            .bind(to_millis(&cutoff))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl MaintenanceStore for SqliteBackend {
    async fn create_window(&self, window: &NewMaintenanceWindow) -> StorageResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO maintenance_windows (name, target_id, tags, starts_at, ends_at, is_active)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&window.name)
        .bind(window.target_id)
        .bind(encode_tags(&window.tags)?)
        .bind(to_millis(&window.starts_at))
        .bind(to_millis(&window.ends_at))
        .bind(window.is_active)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn update_window(&self, window: &MaintenanceWindow) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE maintenance_windows
            SET name = ?, target_id = ?, tags = ?, starts_at = ?, ends_at = ?, is_active = ?
            WHERE id = ?
            "#,
        )
        .bind(&window.name)
        .bind(window.target_id)
        .bind(encode_tags(&window.tags)?)
        .bind(to_millis(&window.starts_at))
        .bind(to_millis(&window.ends_at))
        .bind(window.is_active)
        .bind(window.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "maintenance window {}",
                window.id
            )));
        }
        Ok(())
    }

    async fn delete_window(&self, id: i64) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM maintenance_windows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_window(&self, id: i64) -> StorageResult<Option<MaintenanceWindow>> {
        let row = sqlx::query(
            "SELECT id, name, target_id, tags, starts_at, ends_at, is_active \
             FROM maintenance_windows WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(window_from_row).transpose()
    }

    async fn list_windows(&self) -> StorageResult<Vec<MaintenanceWindow>> {
        let rows = sqlx::query(
            "SELECT id, name, target_id, tags, starts_at, ends_at, is_active \
             FROM maintenance_windows ORDER BY starts_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(window_from_row).collect()
    }

    async fn active_windows_for(
        &self,
        target_id: TargetId,
        tags: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<MaintenanceWindow>> {
        let now_millis = to_millis(&now);
        let rows = sqlx::query(
            r#"
            SELECT id, name, target_id, tags, starts_at, ends_at, is_active
            FROM maintenance_windows
            WHERE is_active = 1
              AND starts_at <= ? AND ends_at >= ?
              AND (target_id = ? OR target_id IS NULL)
            ORDER BY starts_at, id
            "#,
        )
        .bind(now_millis)
        .bind(now_millis)
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;

        let mut windows = Vec::new();
        for row in &rows {
            let window = window_from_row(row)?;
            if window.covers(target_id, tags, now) {
                windows.push(window);
            }
        }
        Ok(windows)
    }
}

#[async_trait]
impl ChannelStore for SqliteBackend {
    async fn add_channel(&self, channel: &NewNotificationChannel) -> StorageResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_channels (
                kind, name, secret, destination, silent, protect_content, is_default, is_active
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&channel.kind)
        .bind(&channel.name)
        .bind(&channel.secret)
        .bind(&channel.destination)
        .bind(channel.silent)
        .bind(channel.protect_content)
        .bind(channel.is_default)
        .bind(channel.is_active)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn list_active_channels(&self) -> StorageResult<Vec<NotificationChannel>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, name, secret, destination, silent, protect_content,
                   is_default, is_active
            FROM notification_channels
            WHERE is_active = 1
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(channel_from_row).collect()
    }
}

#[async_trait]
impl IncidentStore for SqliteBackend {
    async fn find_open_incident_by_source(
        &self,
        source: &str,
        source_id: &str,
    ) -> StorageResult<Option<Incident>> {
        let sql = format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents \
             WHERE source = ? AND source_id = ? AND status = 'open'"
        );
        let row = sqlx::query(&sql)
            .bind(source)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(incident_from_row).transpose()
    }

    #[instrument(skip(self, incident), fields(source_id = %incident.source_id))]
    async fn create_incident(
        &self,
        incident: &NewIncident,
        registration_template: &str,
    ) -> StorageResult<Incident> {
        let mut tx = self.pool.begin().await?;

        // the row id doubles as the sequence number, so insert first and
        // render the registration number once the id is known
        let result = sqlx::query(
            r#"
            INSERT INTO incidents (
                registration_number, title, description, severity, status,
                source, source_id, opened_at
            )
            VALUES ('', ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&incident.title)
        .bind(&incident.description)
        .bind(incident.severity.as_str())
        .bind(IncidentStatus::Open.as_str())
        .bind(&incident.source)
        .bind(&incident.source_id)
        .bind(to_millis(&incident.opened_at))
        .execute(&mut *tx)
        .await?;

        let id = result.last_insert_rowid();
        let registration_number =
            render_registration_number(registration_template, id, incident.opened_at);

        sqlx::query("UPDATE incidents SET registration_number = ? WHERE id = ?")
            .bind(&registration_number)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Incident {
            id,
            registration_number,
            title: incident.title.clone(),
            description: incident.description.clone(),
            severity: incident.severity,
            status: IncidentStatus::Open,
            source: incident.source.clone(),
            source_id: incident.source_id.clone(),
            opened_at: incident.opened_at,
            closed_at: None,
        })
    }

    async fn close_incident(&self, id: i64, closed_at: DateTime<Utc>) -> StorageResult<bool> {
        let result = sqlx::query(
            "UPDATE incidents SET status = 'closed', closed_at = ? WHERE id = ? AND status = 'open'",
        )
        .bind(to_millis(&closed_at))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_incidents_by_source(
        &self,
        source: &str,
        source_id: &str,
    ) -> StorageResult<Vec<Incident>> {
        let sql = format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents WHERE source = ? AND source_id = ? ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(source)
            .bind(source_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(incident_from_row).collect()
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    #[instrument(skip(self))]
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => {
                let mut metadata = HashMap::new();
                metadata.insert("backend".to_string(), "sqlite".to_string());
                metadata.insert("db_path".to_string(), self.db_path.clone());

                Ok(HealthStatus {
                    healthy: true,
                    message: "SQLite backend operational".to_string(),
                    metadata,
                })
            }
            Err(e) => {
                warn!("health check failed: {}", e);
                Ok(HealthStatus {
                    healthy: false,
                    message: format!("health check failed: {}", e),
                    metadata: HashMap::new(),
                })
            }
        }
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}

//! Row mapping between the SQLite tables and the domain types
//!
//! ## Encoding
//!
//! - Timestamps are stored as Unix milliseconds (`INTEGER`)
//! - Tag sets and allowed status lists are stored as JSON arrays (`TEXT`)
//! - Enums are stored by their lowercase name (`TEXT`)
//! - Target kinds are spread over nullable columns (`url`, `method`, `host`, `port`)

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

use super::error::{StorageError, StorageResult};
use crate::model::{
    Event, HttpMethod, Incident, MaintenanceWindow, Metric, NotificationChannel, Severity,
    StatusMatcher, Target, TargetKind, TargetState,
};

pub fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn from_millis(millis: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::SerializationError(format!("timestamp {millis} out of range")))
}

fn opt_from_millis(millis: Option<i64>) -> StorageResult<Option<DateTime<Utc>>> {
    millis.map(from_millis).transpose()
}

pub fn encode_tags(tags: &BTreeSet<String>) -> StorageResult<String> {
    Ok(serde_json::to_string(tags)?)
}

pub fn decode_tags(raw: &str) -> StorageResult<BTreeSet<String>> {
    if raw.trim().is_empty() {
        return Ok(BTreeSet::new());
    }
    Ok(serde_json::from_str(raw)?)
}

/// Columns a target is spread over
pub struct TargetColumns {
    pub kind: &'static str,
    pub url: Option<String>,
    pub method: Option<&'static str>,
    pub allowed_status: Option<String>,
    pub host: Option<String>,
    pub port: Option<i64>,
}

impl TargetColumns {
    pub fn from_kind(kind: &TargetKind) -> StorageResult<Self> {
        Ok(match kind {
            TargetKind::Http {
                url,
                method,
                allowed_status,
            } => Self {
                kind: kind.as_str(),
                url: Some(url.clone()),
                method: Some(method.as_str()),
                allowed_status: Some(serde_json::to_string(allowed_status)?),
                host: None,
                port: None,
            },
            TargetKind::Tcp { host, port } => Self {
                kind: kind.as_str(),
                url: None,
                method: None,
                allowed_status: None,
                host: Some(host.clone()),
                port: Some(i64::from(*port)),
            },
        })
    }
}

fn missing(column: &str, kind: &str) -> StorageError {
    StorageError::SerializationError(format!("{kind} target without {column}"))
}

pub fn target_from_row(row: &SqliteRow) -> StorageResult<Target> {
    let kind_name: String = row.try_get("kind")?;

    let kind = match kind_name.as_str() {
        "http" => {
            let url: Option<String> = row.try_get("url")?;
            let method: Option<String> = row.try_get("method")?;
            let allowed: Option<String> = row.try_get("allowed_status")?;

            let allowed_status: Vec<StatusMatcher> = match allowed {
                Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)?,
                _ => Vec::new(),
            };

            TargetKind::Http {
                url: url.ok_or_else(|| missing("url", "http"))?,
                method: method
                    .map(|m| m.parse::<HttpMethod>())
                    .transpose()?
                    .unwrap_or_default(),
                allowed_status,
            }
        }
        "tcp" => {
            let host: Option<String> = row.try_get("host")?;
            let port: Option<i64> = row.try_get("port")?;
            let port = port.ok_or_else(|| missing("port", "tcp"))?;

            TargetKind::Tcp {
                host: host.ok_or_else(|| missing("host", "tcp"))?,
                port: u16::try_from(port).map_err(|_| {
                    StorageError::SerializationError(format!("port {port} out of range"))
                })?,
            }
        }
        other => {
            return Err(StorageError::SerializationError(format!(
                "unknown target kind '{other}'"
            )));
        }
    };

    let severity: Option<String> = row.try_get("incident_severity")?;
    let tags: String = row.try_get("tags")?;

    Ok(Target {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind,
        timeout_seconds: row
            .try_get::<Option<i64>, _>("timeout_seconds")?
            .map(|v| v.max(0) as u64),
        interval_seconds: row
            .try_get::<Option<i64>, _>("interval_seconds")?
            .map(|v| v.max(0) as u64),
        tags: decode_tags(&tags)?,
        is_active: row.try_get("is_active")?,
        auto_incident: row.try_get("auto_incident")?,
        incident_severity: severity.map(|s| s.parse::<Severity>()).transpose()?,
        owner: row.try_get("owner")?,
    })
}

pub fn state_from_row(row: &SqliteRow) -> StorageResult<TargetState> {
    let status: String = row.try_get("status")?;

    Ok(TargetState {
        target_id: row.try_get("target_id")?,
        status: status.parse()?,
        last_error: row.try_get("last_error")?,
        maintenance_active: row.try_get("maintenance_active")?,
        last_checked_at: from_millis(row.try_get("last_checked_at")?)?,
        last_notified_at: opt_from_millis(row.try_get("last_notified_at")?)?,
    })
}

pub fn metric_from_row(row: &SqliteRow) -> StorageResult<Metric> {
    let latency: i64 = row.try_get("latency_ms")?;

    Ok(Metric {
        target_id: row.try_get("target_id")?,
        at: from_millis(row.try_get("timestamp")?)?,
        latency_ms: latency.max(0) as u64,
        ok: row.try_get("ok")?,
        error: row.try_get("error")?,
    })
}

pub fn event_from_row(row: &SqliteRow) -> StorageResult<Event> {
    let kind: String = row.try_get("kind")?;

    Ok(Event {
        id: row.try_get("id")?,
        target_id: row.try_get("target_id")?,
        at: from_millis(row.try_get("timestamp")?)?,
        kind: kind.parse()?,
        message: row.try_get("message")?,
    })
}

pub fn window_from_row(row: &SqliteRow) -> StorageResult<MaintenanceWindow> {
    let tags: String = row.try_get("tags")?;

    Ok(MaintenanceWindow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        target_id: row.try_get("target_id")?,
        tags: decode_tags(&tags)?,
        starts_at: from_millis(row.try_get("starts_at")?)?,
        ends_at: from_millis(row.try_get("ends_at")?)?,
        is_active: row.try_get("is_active")?,
    })
}

pub fn channel_from_row(row: &SqliteRow) -> StorageResult<NotificationChannel> {
    Ok(NotificationChannel {
        id: row.try_get("id")?,
        kind: row.try_get("kind")?,
        name: row.try_get("name")?,
        secret: row.try_get("secret")?,
        destination: row.try_get("destination")?,
        silent: row.try_get("silent")?,
        protect_content: row.try_get("protect_content")?,
        is_default: row.try_get("is_default")?,
        is_active: row.try_get("is_active")?,
    })
}

pub fn incident_from_row(row: &SqliteRow) -> StorageResult<Incident> {
    let severity: String = row.try_get("severity")?;
    let status: String = row.try_get("status")?;

    Ok(Incident {
        id: row.try_get("id")?,
        registration_number: row.try_get("registration_number")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        severity: severity.parse()?,
        status: status.parse()?,
        source: row.try_get("source")?,
        source_id: row.try_get("source_id")?,
        opened_at: from_millis(row.try_get("opened_at")?)?,
        closed_at: opt_from_millis(row.try_get("closed_at")?)?,
    })
}

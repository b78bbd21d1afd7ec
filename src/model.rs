//! Domain types shared by the engine, the stores and the transports
//!
//! Targets, maintenance windows and notification channels are configured
//! outside of the engine and are read-only here. Target state, events,
//! metrics and incidents are written by the engine.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::EngineSettings;

/// Identifier of a monitored target
pub type TargetId = i64;

/// Source name used for incidents opened by the engine
pub const MONITORING_SOURCE: &str = "monitoring";

fn default_true() -> bool {
    true
}

// ============================================================================
// Targets
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Head,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "HEAD" => Ok(HttpMethod::Head),
            "POST" => Ok(HttpMethod::Post),
            other => Err(ParseError(format!("unknown http method '{other}'"))),
        }
    }
}

/// Error returned when a textual representation can't be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(pub String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseError {}

static STATUS_MATCHER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d{3})\s*(?:-\s*(\d{3})\s*)?$").expect("status matcher pattern is valid")
});

/// One entry of a target's allowed status list
///
/// Written as either a literal code (`"204"`) or an inclusive range (`"200-299"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum StatusMatcher {
    Code(u16),
    Range(u16, u16),
}

impl StatusMatcher {
    pub fn matches(&self, code: u16) -> bool {
        match *self {
            StatusMatcher::Code(expected) => expected == code,
            StatusMatcher::Range(lo, hi) => (lo..=hi).contains(&code),
        }
    }
}

/// Check a status code against a list of matchers.
///
/// An empty list accepts any 2xx code.
pub fn status_allowed(matchers: &[StatusMatcher], code: u16) -> bool {
    if matchers.is_empty() {
        return (200..300).contains(&code);
    }
    matchers.iter().any(|m| m.matches(code))
}

impl FromStr for StatusMatcher {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = STATUS_MATCHER_RE
            .captures(s)
            .ok_or_else(|| ParseError(format!("invalid status entry '{s}'")))?;

        let parse_code = |raw: &str| -> Result<u16, ParseError> {
            let code: u16 = raw
                .parse()
                .map_err(|_| ParseError(format!("invalid status code '{raw}'")))?;
            if !(100..=599).contains(&code) {
                return Err(ParseError(format!("status code {code} out of range")));
            }
            Ok(code)
        };

        let lo = parse_code(&caps[1])?;
        match caps.get(2) {
            None => Ok(StatusMatcher::Code(lo)),
            Some(hi) => {
                let hi = parse_code(hi.as_str())?;
                if lo > hi {
                    return Err(ParseError(format!("empty status range '{s}'")));
                }
                Ok(StatusMatcher::Range(lo, hi))
            }
        }
    }
}

impl TryFrom<String> for StatusMatcher {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StatusMatcher> for String {
    fn from(value: StatusMatcher) -> Self {
        value.to_string()
    }
}

impl fmt::Display for StatusMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusMatcher::Code(code) => write!(f, "{code}"),
            StatusMatcher::Range(lo, hi) => write!(f, "{lo}-{hi}"),
        }
    }
}

/// What kind of check is performed against a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TargetKind {
    Http {
        url: String,
        #[serde(default)]
        method: HttpMethod,
        #[serde(default)]
        allowed_status: Vec<StatusMatcher>,
    },
    Tcp {
        host: String,
        port: u16,
    },
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Http { .. } => "http",
            TargetKind::Tcp { .. } => "tcp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(ParseError(format!("unknown severity '{other}'"))),
        }
    }
}

/// A configured endpoint to be health-checked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub name: String,
    #[serde(flatten)]
    pub kind: TargetKind,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub auto_incident: bool,
    #[serde(default)]
    pub incident_severity: Option<Severity>,
    #[serde(default)]
    pub owner: Option<String>,
}

impl Target {
    /// Per-target timeout, falling back to the global default
    pub fn timeout(&self, settings: &EngineSettings) -> Duration {
        let secs = self
            .timeout_seconds
            .filter(|s| *s > 0)
            .unwrap_or(settings.default_timeout_seconds);
        Duration::from_secs(secs.max(1))
    }

    /// Per-target check interval, falling back to the global default
    pub fn interval(&self, settings: &EngineSettings) -> Duration {
        let secs = self
            .interval_seconds
            .filter(|s| *s > 0)
            .unwrap_or(settings.default_interval_seconds);
        Duration::from_secs(secs.max(1))
    }

    /// Human readable address of the probed endpoint
    pub fn endpoint(&self) -> String {
        match &self.kind {
            TargetKind::Http { url, .. } => url.clone(),
            TargetKind::Tcp { host, port } => format!("{host}:{port}"),
        }
    }
}

// ============================================================================
// State, events, metrics
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Up,
    Down,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Up => "up",
            Status::Down => "down",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Status::Up),
            "down" => Ok(Status::Down),
            other => Err(ParseError(format!("unknown status '{other}'"))),
        }
    }
}

/// Durable current status of one target
///
/// A missing record means the target has never been checked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetState {
    pub target_id: TargetId,
    pub status: Status,
    /// Error of the most recent check, if it failed
    pub last_error: Option<String>,
    pub maintenance_active: bool,
    pub last_checked_at: DateTime<Utc>,
    pub last_notified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Up,
    Down,
    MaintenanceStart,
    MaintenanceEnd,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Up => "up",
            EventKind::Down => "down",
            EventKind::MaintenanceStart => "maintenance_start",
            EventKind::MaintenanceEnd => "maintenance_end",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(EventKind::Up),
            "down" => Ok(EventKind::Down),
            "maintenance_start" => Ok(EventKind::MaintenanceStart),
            "maintenance_end" => Ok(EventKind::MaintenanceEnd),
            other => Err(ParseError(format!("unknown event kind '{other}'"))),
        }
    }
}

/// An event that has not been persisted yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub target_id: TargetId,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub target_id: TargetId,
    pub at: DateTime<Utc>,
    pub kind: EventKind,
    pub message: String,
}

/// One latency/ok sample, written for every check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metric {
    pub target_id: TargetId,
    pub at: DateTime<Utc>,
    pub latency_ms: u64,
    pub ok: bool,
    pub error: Option<String>,
}

/// Filter for the cross-target event feed
#[derive(Debug, Clone, Default)]
pub struct EventFeedFilter {
    pub since: Option<DateTime<Utc>>,
    /// Empty means all kinds
    pub kinds: Vec<EventKind>,
    /// Only events of targets carrying at least one of these tags (empty = all)
    pub tags: BTreeSet<String>,
    pub limit: Option<usize>,
}

/// Availability summary computed from metric rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UptimeStats {
    pub total_checks: u64,
    pub successful_checks: u64,
    pub uptime_percentage: f64,
    pub avg_latency_ms: Option<f64>,
}

impl UptimeStats {
    pub fn from_metrics<'a>(metrics: impl IntoIterator<Item = &'a Metric>) -> Self {
        let mut total = 0u64;
        let mut ok = 0u64;
        let mut latency_sum = 0u64;

        for metric in metrics {
            total += 1;
            if metric.ok {
                ok += 1;
                latency_sum += metric.latency_ms;
            }
        }

        Self {
            total_checks: total,
            successful_checks: ok,
            uptime_percentage: if total == 0 {
                0.0
            } else {
                ok as f64 / total as f64 * 100.0
            },
            avg_latency_ms: (ok > 0).then(|| latency_sum as f64 / ok as f64),
        }
    }
}

// ============================================================================
// Maintenance
// ============================================================================

/// A scheduled suppression interval for one target or a tag group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub id: i64,
    pub name: String,
    /// `None` means the window applies by tag
    pub target_id: Option<TargetId>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub is_active: bool,
}

impl MaintenanceWindow {
    /// Whether this window puts the given target into maintenance at `now`
    pub fn covers(&self, target_id: TargetId, tags: &BTreeSet<String>, now: DateTime<Utc>) -> bool {
        if !self.is_active || now < self.starts_at || now > self.ends_at {
            return false;
        }

        match self.target_id {
            Some(id) => id == target_id,
            None => !self.tags.is_disjoint(tags),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMaintenanceWindow {
    pub name: String,
    #[serde(default)]
    pub target_id: Option<TargetId>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

// ============================================================================
// Notification channels
// ============================================================================

/// A configured outbound alert destination
///
/// `secret` holds the encrypted blob; it is only decrypted right before a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationChannel {
    pub id: i64,
    /// Transport name, e.g. `telegram`
    pub kind: String,
    pub name: String,
    pub secret: Vec<u8>,
    pub destination: String,
    pub silent: bool,
    pub protect_content: bool,
    pub is_default: bool,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNotificationChannel {
    pub kind: String,
    pub name: String,
    pub secret: Vec<u8>,
    pub destination: String,
    pub silent: bool,
    pub protect_content: bool,
    pub is_default: bool,
    pub is_active: bool,
}

// ============================================================================
// Incidents
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Open,
    Closed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Closed => "closed",
        }
    }
}

impl FromStr for IncidentStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(IncidentStatus::Open),
            "closed" => Ok(IncidentStatus::Closed),
            other => Err(ParseError(format!("unknown incident status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub registration_number: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub source: String,
    pub source_id: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIncident {
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub source: String,
    pub source_id: String,
    pub opened_at: DateTime<Utc>,
}

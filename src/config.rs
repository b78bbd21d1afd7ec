use std::path::PathBuf;

use tracing::trace;

use crate::model::Target;

/// Storage backend configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default for most deployments)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./monitoring.db")
}

/// Global engine settings
///
/// These are owned by the platform's settings module; the engine only reads them.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct EngineSettings {
    /// Gates the automatic scheduler loop (direct checks stay possible)
    #[serde(default = "default_true")]
    pub engine_enabled: bool,

    /// When false, probes to loopback/private/link-local addresses are refused
    #[serde(default)]
    pub allow_private_networks: bool,

    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,

    #[serde(default = "default_interval_seconds")]
    pub default_interval_seconds: u64,

    /// Minimum gap between two notifications for the same target
    #[serde(default = "default_notify_suppress_minutes")]
    pub notify_suppress_minutes: u64,

    /// Cadence of "still down" reminders (0 disables them)
    #[serde(default = "default_notify_repeat_down_minutes")]
    pub notify_repeat_down_minutes: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            engine_enabled: true,
            allow_private_networks: false,
            default_timeout_seconds: default_timeout_seconds(),
            default_interval_seconds: default_interval_seconds(),
            notify_suppress_minutes: default_notify_suppress_minutes(),
            notify_repeat_down_minutes: default_notify_repeat_down_minutes(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_seconds() -> u64 {
    10
}

fn default_interval_seconds() -> u64 {
    60
}

fn default_notify_suppress_minutes() -> u64 {
    5
}

fn default_notify_repeat_down_minutes() -> u64 {
    60
}

/// Scheduler loop configuration
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two scans for due targets
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,

    /// Upper bound of concurrently running checks
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_seconds: default_tick_seconds(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_tick_seconds() -> u64 {
    5
}

fn default_max_concurrency() -> usize {
    16
}

/// Retention policy for the append-only history
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RetentionConfig {
    /// Metrics older than this are deleted
    #[serde(default = "default_metrics_retention_days")]
    pub metrics_retention_days: u32,

    /// Events older than this are deleted (unset keeps events forever)
    #[serde(default)]
    pub events_retention_days: Option<u32>,

    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            metrics_retention_days: default_metrics_retention_days(),
            events_retention_days: None,
            cleanup_interval_hours: default_cleanup_interval_hours(),
        }
    }
}

fn default_metrics_retention_days() -> u32 {
    30
}

fn default_cleanup_interval_hours() -> u32 {
    24
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct IncidentConfig {
    /// Registration number pattern, e.g. `INC-{seq}` or `MON-{year}-{seq:5}`
    #[serde(default = "default_registration_template")]
    pub registration_template: String,
}

impl Default for IncidentConfig {
    fn default() -> Self {
        Self {
            registration_template: default_registration_template(),
        }
    }
}

pub fn default_registration_template() -> String {
    "INC-{seq}".to_string()
}

/// Notification channel as written in the config file
///
/// The secret is given in plain text here and encrypted before it is stored.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ChannelConfig {
    pub kind: String,
    pub name: String,
    pub secret: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub protect_content: bool,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct TransportConfig {
    /// Override for the Telegram Bot API base URL
    pub telegram_api_base: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: EngineSettings,

    /// Storage configuration (optional - defaults to SQLite)
    pub storage: Option<StorageConfig>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub incidents: IncidentConfig,

    #[serde(default)]
    pub transports: TransportConfig,

    /// Targets seeded into the store on startup
    pub targets: Option<Vec<Target>>,

    /// Channels seeded into the store on startup
    pub channels: Option<Vec<ChannelConfig>>,
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    parse_config(&file_content)
}

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    serde_json::from_str(content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config: &Config| trace!("loaded config: {config:?}"))
}

//! Prober - executes one HTTP or TCP check against one target
//!
//! The prober holds no per-target state: a check is a function of the target
//! configuration and the global settings. It never fails in the `Result`
//! sense; every failure category is normalized into a [`CheckResult`] with
//! `ok = false` and a classified [`ProbeError`].
//!
//! ```text
//! resolve host → network policy → connect / request → evaluate → CheckResult
//!        └───────────── bounded by the target timeout ─────────────┘
//! ```

mod http;
pub mod policy;
mod tcp;

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument, trace};

use crate::config::EngineSettings;
use crate::model::{Target, TargetKind};

/// Classified probe failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// No answer within the target timeout
    Timeout(Duration),

    /// The remote side actively refused the connection
    Refused(String),

    /// The host name could not be resolved
    Dns(String),

    /// The HTTP status code is not in the allowed list
    DisallowedStatus(u16),

    /// The target resolves to an address the network policy forbids
    PolicyBlocked(String),

    /// Any other transport failure
    Network(String),

    /// The target configuration can't be probed (e.g. malformed URL)
    InvalidTarget(String),
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::Timeout(after) => write!(f, "timeout after {}s", after.as_secs_f32()),
            ProbeError::Refused(msg) => write!(f, "connection refused: {}", msg),
            ProbeError::Dns(msg) => write!(f, "dns failure: {}", msg),
            ProbeError::DisallowedStatus(code) => write!(f, "disallowed status {}", code),
            ProbeError::PolicyBlocked(addr) => {
                write!(f, "blocked by network policy: {}", addr)
            }
            ProbeError::Network(msg) => write!(f, "network error: {}", msg),
            ProbeError::InvalidTarget(msg) => write!(f, "invalid target: {}", msg),
        }
    }
}

impl std::error::Error for ProbeError {}

/// Outcome of one probe attempt
///
/// Transient: it feeds the metric row, the events and the target state but is
/// never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub ok: bool,
    pub error: Option<ProbeError>,
    pub latency: Duration,
    pub status_code: Option<u16>,
}

impl CheckResult {
    pub fn success(latency: Duration, status_code: Option<u16>) -> Self {
        Self {
            ok: true,
            error: None,
            latency,
            status_code,
        }
    }

    pub fn failure(latency: Duration, error: ProbeError) -> Self {
        let status_code = match error {
            ProbeError::DisallowedStatus(code) => Some(code),
            _ => None,
        };

        Self {
            ok: false,
            error: Some(error),
            latency,
            status_code,
        }
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency.as_millis() as u64
    }

    /// Error text as stored in metrics, events and state
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

/// Anything that can check a target
///
/// The engine depends on this trait so a scripted implementation can stand in
/// for the network in tests.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, target: &Target, settings: &EngineSettings) -> CheckResult;
}

/// Network prober for HTTP and TCP targets
///
/// Two HTTP clients are kept: one whose redirect policy refuses hops to
/// private addresses (used while `allow_private_networks` is false) and an
/// unrestricted one.
#[derive(Debug, Clone)]
pub struct Prober {
    guarded_client: Client,
    open_client: Client,
}

impl Prober {
    pub fn new() -> reqwest::Result<Self> {
        let user_agent = concat!("guardia-watch/", env!("CARGO_PKG_VERSION"));

        let guarded_client = Client::builder()
            .user_agent(user_agent)
            .redirect(policy::guarded_redirects())
            .build()?;

        let open_client = Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(policy::MAX_REDIRECTS))
            .build()?;

        Ok(Self {
            guarded_client,
            open_client,
        })
    }

    async fn execute(
        &self,
        target: &Target,
        settings: &EngineSettings,
        timeout: Duration,
    ) -> Result<Option<u16>, ProbeError> {
        let allow_private = settings.allow_private_networks;

        match &target.kind {
            TargetKind::Http {
                url,
                method,
                allowed_status,
            } => {
                let client = if allow_private {
                    &self.open_client
                } else {
                    &self.guarded_client
                };
                let code =
                    http::check_http(client, url, *method, allowed_status, timeout, allow_private)
                        .await?;
                Ok(Some(code))
            }
            TargetKind::Tcp { host, port } => {
                tcp::check_tcp(host, *port, allow_private).await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Probe for Prober {
    #[instrument(skip_all, fields(target_id = target.id, kind = target.kind.as_str()))]
    async fn probe(&self, target: &Target, settings: &EngineSettings) -> CheckResult {
        let timeout = target.timeout(settings);
        trace!("probing {} (timeout {:?})", target.endpoint(), timeout);

        let start = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.execute(target, settings, timeout)).await;
        let latency = start.elapsed();

        let result = match outcome {
            Ok(Ok(status_code)) => CheckResult::success(latency, status_code),
            Ok(Err(e)) => CheckResult::failure(latency, e),
            Err(_) => CheckResult::failure(latency, ProbeError::Timeout(timeout)),
        };

        debug!(
            "probe finished: ok={} latency={}ms error={:?}",
            result.ok,
            result.latency_ms(),
            result.error_message()
        );

        result
    }
}

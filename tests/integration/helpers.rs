//! Helper functions for integration tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guardia_watch::{
    clock::ManualClock,
    config::EngineSettings,
    crypto::{AesGcmEncryptor, Encryptor, Secret},
    engine::Engine,
    model::{NewNotificationChannel, Target, TargetKind},
    notify::{NotificationDispatcher, OutboundMessage, SendError, Sender},
    prober::{CheckResult, Probe, ProbeError},
    storage::{ChannelStore, MemoryBackend, Stores, TargetStore},
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PASSPHRASE: &str = "integration-secret";

pub fn tcp_target(id: i64, name: &str) -> Target {
    Target {
        id,
        name: name.to_string(),
        kind: TargetKind::Tcp {
            host: format!("{name}.example.com"),
            port: 443,
        },
        timeout_seconds: None,
        interval_seconds: None,
        tags: BTreeSet::new(),
        is_active: true,
        auto_incident: false,
        incident_severity: None,
        owner: None,
    }
}

pub fn http_target(id: i64, url: &str) -> Target {
    Target {
        id,
        name: format!("http-{id}"),
        kind: TargetKind::Http {
            url: url.to_string(),
            method: Default::default(),
            allowed_status: Vec::new(),
        },
        timeout_seconds: Some(2),
        interval_seconds: None,
        tags: BTreeSet::new(),
        is_active: true,
        auto_incident: false,
        incident_severity: None,
        owner: None,
    }
}

pub fn tags(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Probe that reports whatever the test switched it to
pub struct SwitchProbe {
    up: AtomicBool,
    calls: AtomicUsize,
    delay: Duration,
}

impl SwitchProbe {
    pub fn new(up: bool) -> Self {
        Self::with_delay(up, Duration::ZERO)
    }

    pub fn with_delay(up: bool, delay: Duration) -> Self {
        Self {
            up: AtomicBool::new(up),
            calls: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for SwitchProbe {
    async fn probe(&self, _target: &Target, _settings: &EngineSettings) -> CheckResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.up.load(Ordering::SeqCst) {
            CheckResult::success(Duration::from_millis(12), Some(200))
        } else {
            CheckResult::failure(
                Duration::from_millis(12),
                ProbeError::Refused("connection refused".to_string()),
            )
        }
    }
}

/// Probe that counts how many probes overlap
pub struct GaugeProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
}

impl GaugeProbe {
    pub fn new(delay: Duration) -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay,
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for GaugeProbe {
    async fn probe(&self, _target: &Target, _settings: &EngineSettings) -> CheckResult {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        CheckResult::success(self.delay, Some(200))
    }
}

/// Sender that records delivered messages per destination
///
/// Destinations listed in `failing` are rejected.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(String, OutboundMessage)>>,
    failing: Mutex<Vec<String>>,
}

impl RecordingSender {
    pub fn fail_for(&self, destination: &str) {
        self.failing.lock().unwrap().push(destination.to_string());
    }

    pub fn sent(&self) -> Vec<(String, OutboundMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count_by_destination(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for (_, message) in self.sent() {
            *counts.entry(message.destination).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl Sender for RecordingSender {
    fn kind(&self) -> &str {
        "recording"
    }

    async fn send(&self, secret: &Secret, message: &OutboundMessage) -> Result<(), SendError> {
        if self.failing.lock().unwrap().contains(&message.destination) {
            return Err(SendError::Rejected {
                status: 400,
                body: "chat not found".to_string(),
            });
        }

        self.sent
            .lock()
            .unwrap()
            .push((secret.expose().to_string(), message.clone()));
        Ok(())
    }
}

/// Everything a test needs to drive the engine by hand
pub struct TestRig {
    pub backend: Arc<MemoryBackend>,
    pub engine: Arc<Engine>,
    pub probe: Arc<SwitchProbe>,
    pub sender: Arc<RecordingSender>,
    pub clock: Arc<ManualClock>,
}

impl TestRig {
    pub async fn new(targets: &[Target], settings: EngineSettings) -> Self {
        Self::with_probe(targets, settings, Arc::new(SwitchProbe::new(true))).await
    }

    pub async fn with_probe(
        targets: &[Target],
        settings: EngineSettings,
        probe: Arc<SwitchProbe>,
    ) -> Self {
        let backend = Arc::new(MemoryBackend::new());
        for target in targets {
            backend.upsert_target(target).await.unwrap();
        }

        let stores = Stores::from_backend(backend.clone());
        let sender = Arc::new(RecordingSender::default());
        let dispatcher = NotificationDispatcher::new(
            stores.channels.clone(),
            Arc::new(AesGcmEncryptor::from_passphrase(PASSPHRASE)),
        )
        .with_sender(sender.clone());

        let clock = Arc::new(ManualClock::new(start_time()));
        let engine = Arc::new(
            Engine::new(stores, probe.clone(), dispatcher, settings, "INC-{seq:4}")
                .with_clock(clock.clone()),
        );

        Self {
            backend,
            engine,
            probe,
            sender,
            clock,
        }
    }

    pub async fn add_channel(&self, destination: &str) -> i64 {
        let encryptor = AesGcmEncryptor::from_passphrase(PASSPHRASE);
        self.backend
            .add_channel(&NewNotificationChannel {
                kind: "recording".to_string(),
                name: destination.to_string(),
                secret: encryptor.encrypt("bot-token").unwrap(),
                destination: destination.to_string(),
                silent: false,
                protect_content: false,
                is_default: false,
                is_active: true,
            })
            .await
            .unwrap()
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.clock.advance(chrono::Duration::minutes(minutes));
    }
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Settings that let every notification through
pub fn unthrottled() -> EngineSettings {
    EngineSettings {
        notify_suppress_minutes: 0,
        notify_repeat_down_minutes: 0,
        ..Default::default()
    }
}

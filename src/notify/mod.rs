//! Notification dispatcher
//!
//! Decides whether an alert for a target is sent at all (throttle and
//! reminder cadence), composes the fixed message text and fans it out to
//! every active channel through the [`Sender`] registered for its kind.
//!
//! ```text
//! should_send? ──no──► Throttled
//!      │yes
//! active channels ──none──► NoChannels
//!      │
//! per channel (concurrently): decrypt secret → Sender::send → drop secret
//!      │
//! Sent { delivered, failed }
//! ```

pub mod discord;
pub mod telegram;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use crate::config::EngineSettings;
use crate::crypto::{CryptoError, Encryptor, Secret};
use crate::model::{NotificationChannel, Target};
use crate::storage::{ChannelStore, StorageResult};

pub use discord::DiscordSender;
pub use telegram::TelegramSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Down,
    Up,
    StillDown,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Down => "down",
            NotificationKind::Up => "up",
            NotificationKind::StillDown => "still_down",
        }
    }
}

/// Fixed alert text for a target
pub fn compose_message(
    kind: NotificationKind,
    target: &Target,
    detail: Option<&str>,
    at: DateTime<Utc>,
) -> String {
    let when = at.format("%Y-%m-%d %H:%M:%S UTC");
    let detail = detail.unwrap_or("no error reported");

    match kind {
        NotificationKind::Down => format!(
            "🔴 target unreachable: {} ({})\nerror: {}\nat: {}",
            target.name,
            target.endpoint(),
            detail,
            when
        ),
        NotificationKind::Up => format!(
            "✅ target recovered: {} ({})\nat: {}",
            target.name,
            target.endpoint(),
            when
        ),
        NotificationKind::StillDown => format!(
            "⏰ target still down: {} ({})\nerror: {}\nat: {}",
            target.name,
            target.endpoint(),
            detail,
            when
        ),
    }
}

/// What a sender needs to deliver one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub destination: String,
    pub text: String,
    pub silent: bool,
    pub protect_content: bool,
    pub kind: NotificationKind,
}

#[derive(Debug)]
pub enum SendError {
    /// The request never got a response
    Transport(String),

    /// The transport answered with a non-success status
    Rejected { status: u16, body: String },

    /// The transport accepted the request but reported a failure
    Api(String),

    /// The channel secret could not be decrypted
    Secret(CryptoError),

    /// No sender is registered for the channel kind
    NoSender(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Transport(msg) => write!(f, "transport error: {}", msg),
            SendError::Rejected { status, body } => {
                write!(f, "rejected with status {}: {}", status, body)
            }
            SendError::Api(msg) => write!(f, "api error: {}", msg),
            SendError::Secret(err) => write!(f, "channel secret unusable: {}", err),
            SendError::NoSender(kind) => write!(f, "no sender for channel kind '{}'", kind),
        }
    }
}

impl std::error::Error for SendError {}

impl From<reqwest::Error> for SendError {
    fn from(err: reqwest::Error) -> Self {
        // the URL may carry the bot token
        SendError::Transport(err.without_url().to_string())
    }
}

/// One notification transport
#[async_trait]
pub trait Sender: Send + Sync {
    /// Channel kind this sender handles, e.g. `telegram`
    fn kind(&self) -> &str;

    async fn send(&self, secret: &Secret, message: &OutboundMessage) -> Result<(), SendError>;
}

/// Minimum-gap throttle shared by every notification kind of a target
pub fn should_send(
    last_notified_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    settings: &EngineSettings,
) -> bool {
    match last_notified_at {
        None => true,
        Some(last) => minutes_elapsed(last, now, settings.notify_suppress_minutes),
    }
}

/// Whether a "still down" reminder is due for a target that stayed down
pub fn reminder_due(
    last_notified_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    settings: &EngineSettings,
) -> bool {
    if settings.notify_repeat_down_minutes == 0 {
        return false;
    }
    match last_notified_at {
        None => true,
        Some(last) => minutes_elapsed(last, now, settings.notify_repeat_down_minutes),
    }
}

/// Whether `minutes` have passed since `since`
///
/// A gap too large for chrono never elapses.
fn minutes_elapsed(since: DateTime<Utc>, now: DateTime<Utc>, minutes: u64) -> bool {
    i64::try_from(minutes)
        .ok()
        .and_then(chrono::Duration::try_minutes)
        .is_some_and(|gap| now - since >= gap)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Throttled,
    NoChannels,
    Sent { delivered: usize, failed: usize },
}

impl DispatchOutcome {
    /// Whether at least one channel got the message
    pub fn delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Sent { delivered, .. } if *delivered > 0)
    }
}

pub struct NotificationDispatcher {
    channels: Arc<dyn ChannelStore>,
    encryptor: Arc<dyn Encryptor>,
    senders: HashMap<String, Arc<dyn Sender>>,
}

impl NotificationDispatcher {
    pub fn new(channels: Arc<dyn ChannelStore>, encryptor: Arc<dyn Encryptor>) -> Self {
        Self {
            channels,
            encryptor,
            senders: HashMap::new(),
        }
    }

    pub fn with_sender(mut self, sender: Arc<dyn Sender>) -> Self {
        self.senders.insert(sender.kind().to_string(), sender);
        self
    }

    /// Notify every active channel about a target, unless throttled.
    ///
    /// Per-channel failures are logged and counted; only listing the channels
    /// can fail the call.
    #[instrument(skip_all, fields(target_id = target.id, kind = kind.as_str()))]
    pub async fn dispatch(
        &self,
        kind: NotificationKind,
        target: &Target,
        detail: Option<&str>,
        last_notified_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        settings: &EngineSettings,
    ) -> StorageResult<DispatchOutcome> {
        if !should_send(last_notified_at, now, settings) {
            debug!("notification throttled");
            return Ok(DispatchOutcome::Throttled);
        }

        let channels = self.channels.list_active_channels().await?;
        if channels.is_empty() {
            debug!("no active notification channels");
            return Ok(DispatchOutcome::NoChannels);
        }

        let text = compose_message(kind, target, detail, now);
        let results = join_all(
            channels
                .iter()
                .map(|channel| self.deliver(channel, kind, &text)),
        )
        .await;

        let mut delivered = 0;
        let mut failed = 0;
        for (channel, result) in channels.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    failed += 1;
                    warn!(
                        channel_id = channel.id,
                        "failed to notify channel '{}': {}", channel.name, e
                    );
                }
            }
        }

        debug!("notification delivered to {delivered} channels, {failed} failed");
        Ok(DispatchOutcome::Sent { delivered, failed })
    }

    async fn deliver(
        &self,
        channel: &NotificationChannel,
        kind: NotificationKind,
        text: &str,
    ) -> Result<(), SendError> {
        let sender = self
            .senders
            .get(&channel.kind)
            .ok_or_else(|| SendError::NoSender(channel.kind.clone()))?;

        let secret = self
            .encryptor
            .decrypt(&channel.secret)
            .map_err(SendError::Secret)?;

        let message = OutboundMessage {
            destination: channel.destination.clone(),
            text: text.to_string(),
            silent: channel.silent,
            protect_content: channel.protect_content,
            kind,
        };

        sender.send(&secret, &message).await
    }
}

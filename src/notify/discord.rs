use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, instrument};

use super::{NotificationKind, OutboundMessage, SendError, Sender};
use crate::crypto::Secret;

/// Discord's SUPPRESS_NOTIFICATIONS message flag
const SUPPRESS_NOTIFICATIONS: u32 = 1 << 12;

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Default)]
pub struct MessageBuilder {
    content: Option<String>,
    embeds: Vec<Embed>,
    flags: Option<u32>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl ToString) -> Self {
        self.content = Some(content.to_string());
        self
    }

    pub fn add_embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.flags = silent.then_some(SUPPRESS_NOTIFICATIONS);
        self
    }

    pub fn build(self) -> Message {
        Message {
            content: self.content,
            embeds: self.embeds,
            flags: self.flags,
        }
    }
}

/// Embed for one alert, coloured by kind
pub fn build_embed(message: &OutboundMessage) -> Embed {
    let (title, color) = match message.kind {
        NotificationKind::Down => ("🔴 Target Down", 15158332), // Red
        NotificationKind::Up => ("✅ Target Recovered", 3066993), // Green
        NotificationKind::StillDown => ("⏰ Target Still Down", 15105570), // Orange
    };

    Embed {
        title: Some(title.to_string()),
        description: Some(message.text.clone()),
        color: Some(color),
        footer: Some(EmbedFooter {
            text: "guardia-watch".to_string(),
        }),
        timestamp: Some(Utc::now().to_rfc3339()),
    }
}

/// Discord webhook transport
///
/// The channel secret is the webhook URL. A non-empty destination is a user
/// id that gets mentioned in the message content.
#[derive(Debug, Clone)]
pub struct DiscordSender {
    client: Client,
}

impl DiscordSender {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Sender for DiscordSender {
    fn kind(&self) -> &str {
        "discord"
    }

    #[instrument(skip_all)]
    async fn send(&self, secret: &Secret, message: &OutboundMessage) -> Result<(), SendError> {
        let mut builder = MessageBuilder::new()
            .add_embed(build_embed(message))
            .silent(message.silent);
        if !message.destination.is_empty() {
            builder = builder.content(format!("<@{}>", message.destination));
        }

        let response = self
            .client
            .post(secret.expose())
            .json(&builder.build())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!("discord message sent");
        Ok(())
    }
}

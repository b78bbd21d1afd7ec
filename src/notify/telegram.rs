use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{OutboundMessage, SendError, Sender};
use crate::crypto::Secret;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_notification: bool,
    protect_content: bool,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram Bot API transport
///
/// The channel secret is the bot token, the destination the chat id.
#[derive(Debug, Clone)]
pub struct TelegramSender {
    client: Client,
    api_base: String,
}

impl TelegramSender {
    pub fn new(client: Client) -> Self {
        Self::with_api_base(client, DEFAULT_API_BASE)
    }

    pub fn with_api_base(client: Client, api_base: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl Sender for TelegramSender {
    fn kind(&self) -> &str {
        "telegram"
    }

    #[instrument(skip_all, fields(chat_id = %message.destination))]
    async fn send(&self, secret: &Secret, message: &OutboundMessage) -> Result<(), SendError> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, secret.expose());
        let payload = SendMessage {
            chat_id: &message.destination,
            text: &message.text,
            disable_notification: message.silent,
            protect_content: message.protect_content,
        };

        let response = self.client.post(url).json(&payload).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SendError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body: ApiResponse = response.json().await?;
        if !body.ok {
            return Err(SendError::Api(
                body.description
                    .unwrap_or_else(|| "telegram reported failure".to_string()),
            ));
        }

        debug!("telegram message sent");
        Ok(())
    }
}

//! Dispatch transports — deliver transformed messages to destination feeds.
//!
//! The Bot API transport posts JSON to api.telegram.org. Failures are
//! classified at this boundary: network errors, 429 and 5xx are transient
//! (retried on a later sweep); other 4xx are permanent (destination gone,
//! bot kicked) and terminal for the owning queue.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

use crate::error::SendError;
use crate::pipeline::types::TransformedMessage;

/// Delivery of a single transformed message to a destination feed.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        destination_id: &str,
        message: &TransformedMessage,
    ) -> Result<(), SendError>;
}

/// Telegram Bot API transport.
pub struct BotApiTransport {
    bot_token: SecretString,
    client: reqwest::Client,
}

impl BotApiTransport {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.bot_token.expose_secret()
        )
    }

    async fn post(
        &self,
        destination_id: &str,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<(), SendError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| SendError::Transient {
                destination: destination_id.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let detail = resp.text().await.unwrap_or_default();
        let reason = format!("{method} returned {status}: {detail}");
        if is_permanent_status(status.as_u16()) {
            Err(SendError::Permanent {
                destination: destination_id.to_string(),
                reason,
            })
        } else {
            Err(SendError::Transient {
                destination: destination_id.to_string(),
                reason,
            })
        }
    }
}

/// 4xx minus 429 is permanent; everything else retries.
fn is_permanent_status(status: u16) -> bool {
    (400..500).contains(&status) && status != 429
}

#[async_trait]
impl Transport for BotApiTransport {
    async fn send(
        &self,
        destination_id: &str,
        message: &TransformedMessage,
    ) -> Result<(), SendError> {
        match message.media_refs.len() {
            0 => {
                let body = serde_json::json!({
                    "chat_id": destination_id,
                    "text": message.text,
                });
                self.post(destination_id, "sendMessage", &body).await?;
            }
            1 => {
                let body = serde_json::json!({
                    "chat_id": destination_id,
                    "photo": message.media_refs[0].0,
                    "caption": message.text,
                });
                self.post(destination_id, "sendPhoto", &body).await?;
            }
            _ => {
                // Album: caption rides on the first item only.
                let media: Vec<serde_json::Value> = message
                    .media_refs
                    .iter()
                    .enumerate()
                    .map(|(i, m)| {
                        let mut item = serde_json::json!({
                            "type": "photo",
                            "media": m.0,
                        });
                        if i == 0 && !message.text.is_empty() {
                            item["caption"] = serde_json::Value::String(message.text.clone());
                        }
                        item
                    })
                    .collect();
                let body = serde_json::json!({
                    "chat_id": destination_id,
                    "media": media,
                });
                self.post(destination_id, "sendMediaGroup", &body).await?;
            }
        }

        debug!(
            destination_id = %destination_id,
            message_id = %message.id,
            media = message.media_refs.len(),
            "Message delivered"
        );
        Ok(())
    }
}

/// Dry-run transport: logs every would-be send and succeeds. Used when no
/// bot token is configured.
#[derive(Default)]
pub struct NullTransport {
    sent: AtomicUsize,
}

impl NullTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for NullTransport {
    async fn send(
        &self,
        destination_id: &str,
        message: &TransformedMessage,
    ) -> Result<(), SendError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        info!(
            destination_id = %destination_id,
            message_id = %message.id,
            text = %message.text,
            "Dry-run send"
        );
        Ok(())
    }
}

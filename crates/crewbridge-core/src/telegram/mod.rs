//! Thin typed client for the Telegram Bot API.
//!
//! Direct HTTP via `reqwest`: the bridge needs a dozen methods, so there is
//! no framework in between, just serde request/response structs per call.
//! Ordinary calls run with a 10 second timeout; uploads and downloads get a
//! more generous one. The client never retries on its own; the one retried
//! operation (webhook registration at startup) owns its schedule.

pub mod types;

use std::path::Path;
use std::time::Duration;

use reqwest::multipart;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{BridgeError, Result};
use types::{BotCommand, File, Me, WebhookInfo};

/// Timeout for ordinary API calls.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for file uploads and downloads.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);

/// Reaction set on an inbound message once a worker accepted it.
pub const ACK_REACTION: &str = "👀";

/// Every Bot API response is wrapped in this envelope.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    base: String,
    file_base: String,
}

impl TelegramClient {
    pub fn new(token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: format!("https://api.telegram.org/bot{token}"),
            file_base: format!("https://api.telegram.org/file/bot{token}"),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
        timeout: Duration,
    ) -> Result<T> {
        let url = format!("{}/{}", self.base, method);
        let resp = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::Upstream(format!("{method}: {e}")))?;

        let status = resp.status();
        let envelope: ApiResponse<T> = resp
            .json()
            .await
            .map_err(|e| BridgeError::Upstream(format!("{method}: bad response: {e}")))?;

        if !envelope.ok {
            let desc = envelope
                .description
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(BridgeError::Upstream(format!("{method}: {desc}")));
        }
        envelope
            .result
            .ok_or_else(|| BridgeError::Upstream(format!("{method}: empty result")))
    }

    // ── Messages ────────────────────────────────────────────────────

    /// Send an HTML-formatted message.
    pub async fn send_message(&self, chat_id: i64, html: &str) -> Result<()> {
        debug!(chat_id, len = html.len(), "sendMessage");
        let _: serde_json::Value = self
            .call(
                "sendMessage",
                json!({
                    "chat_id": chat_id,
                    "text": html,
                    "parse_mode": "HTML",
                    "disable_web_page_preview": true,
                }),
                CALL_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    /// Show the "typing…" indicator in a chat.
    pub async fn send_typing(&self, chat_id: i64) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "sendChatAction",
                json!({"chat_id": chat_id, "action": "typing"}),
                CALL_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    /// React to a message with the acknowledgement emoji.
    pub async fn set_ack_reaction(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "setMessageReaction",
                json!({
                    "chat_id": chat_id,
                    "message_id": message_id,
                    "reaction": [{"type": "emoji", "emoji": ACK_REACTION}],
                }),
                CALL_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    /// Replace the bot's slash-command menu.
    pub async fn set_my_commands(&self, commands: &[BotCommand]) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "setMyCommands",
                json!({ "commands": commands }),
                CALL_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    // ── Attachments ─────────────────────────────────────────────────

    /// Upload a photo from disk.
    pub async fn send_photo(&self, chat_id: i64, path: &Path, caption: &str) -> Result<()> {
        self.upload("sendPhoto", "photo", chat_id, path, caption).await
    }

    /// Upload a document from disk.
    pub async fn send_document(&self, chat_id: i64, path: &Path, caption: &str) -> Result<()> {
        self.upload("sendDocument", "document", chat_id, path, caption)
            .await
    }

    async fn upload(
        &self,
        method: &str,
        field: &'static str,
        chat_id: i64,
        path: &Path,
        caption: &str,
    ) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| BridgeError::io(path.to_path_buf(), e))?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("attachment")
            .to_string();
        debug!(chat_id, file = %filename, size = bytes.len(), "{method}");

        let mut form = multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field, multipart::Part::bytes(bytes).file_name(filename));
        if !caption.is_empty() {
            form = form.text("caption", caption.to_string());
        }

        let url = format!("{}/{}", self.base, method);
        let resp = self
            .http
            .post(&url)
            .timeout(TRANSFER_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(|e| BridgeError::Upstream(format!("{method}: {e}")))?;
        let status = resp.status();
        let envelope: ApiResponse<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| BridgeError::Upstream(format!("{method}: bad response: {e}")))?;
        if !envelope.ok {
            let desc = envelope
                .description
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(BridgeError::Upstream(format!("{method}: {desc}")));
        }
        Ok(())
    }

    /// Resolve a `file_id` and download its bytes.
    pub async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let file: File = self
            .call("getFile", json!({"file_id": file_id}), CALL_TIMEOUT)
            .await?;
        let file_path = file
            .file_path
            .ok_or_else(|| BridgeError::Upstream("getFile: no file_path".into()))?;

        let url = format!("{}/{}", self.file_base, file_path);
        let resp = self
            .http
            .get(&url)
            .timeout(TRANSFER_TIMEOUT)
            .send()
            .await
            .map_err(|e| BridgeError::Upstream(format!("file download: {e}")))?;
        if !resp.status().is_success() {
            return Err(BridgeError::Upstream(format!(
                "file download: HTTP {}",
                resp.status()
            )));
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| BridgeError::Upstream(format!("file download: {e}")))?;
        Ok(bytes.to_vec())
    }

    // ── Bot identity and webhook ────────────────────────────────────

    pub async fn get_me(&self) -> Result<Me> {
        self.call("getMe", json!({}), CALL_TIMEOUT).await
    }

    pub async fn set_webhook(&self, url: &str) -> Result<()> {
        let _: serde_json::Value = self
            .call("setWebhook", json!({"url": url}), CALL_TIMEOUT)
            .await?;
        Ok(())
    }

    pub async fn get_webhook_info(&self) -> Result<WebhookInfo> {
        self.call("getWebhookInfo", json!({}), CALL_TIMEOUT).await
    }
}

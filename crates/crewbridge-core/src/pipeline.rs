//! Outbound response pipeline.
//!
//! The Stop hook POSTs raw assistant output to `/response`; this module
//! turns it into chat messages. Order matters: media tags come out first
//! (so their syntax never reaches the HTML pass), then markdown becomes
//! Telegram-HTML, the worker-name header goes on, the text is split to the
//! 4096 limit, and finally the media fan-out runs with every path checked
//! against the sandbox. A rejected attachment is logged and dropped; the
//! text and the remaining attachments still go out.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::format::html::markdown_to_html;
use crate::format::media::{extract_media_tags, MediaKind, PathValidator};
use crate::format::split::{split_message, MAX_MESSAGE_LEN};
use crate::store::FileStore;
use crate::telegram::TelegramClient;

pub struct ResponsePipeline {
    cfg: Arc<Config>,
    tg: Arc<TelegramClient>,
    store: Arc<FileStore>,
    validator: PathValidator,
}

impl ResponsePipeline {
    pub fn new(cfg: Arc<Config>, tg: Arc<TelegramClient>, store: Arc<FileStore>) -> Self {
        let validator = PathValidator::new(&cfg.sessions_dir);
        Self {
            cfg,
            tg,
            store,
            validator,
        }
    }

    /// Deliver one assistant response for `session` (the worker name).
    pub async fn handle_response(&self, session: &str, text: &str) -> Result<()> {
        let chat_id = self
            .store
            .get_chat_id(session)
            .and_then(|id| id.parse::<i64>().ok())
            .unwrap_or(self.cfg.admin_chat_id);

        if let Err(e) = self.store.clear_pending(session) {
            warn!(worker = session, "pending clear failed: {e}");
        }

        let (cleaned, media) = extract_media_tags(text);
        let html = markdown_to_html(&cleaned);
        let message = format!("<b>{session}:</b>\n{html}");

        for chunk in split_message(&message, MAX_MESSAGE_LEN) {
            self.tg.send_message(chat_id, &chunk).await?;
        }

        for tag in &media {
            let path = match self.validator.validate(tag) {
                Ok(p) => p,
                Err(BridgeError::Security(note)) => {
                    info!(worker = session, "media dropped: {note}");
                    continue;
                }
                Err(e) => {
                    warn!(worker = session, "media validation failed: {e}");
                    continue;
                }
            };
            let caption = tag.caption.as_deref().unwrap_or("");
            let sent = match tag.kind {
                MediaKind::Image => self.tg.send_photo(chat_id, &path, caption).await,
                MediaKind::File => self.tg.send_document(chat_id, &path, caption).await,
            };
            if let Err(e) = sent {
                warn!(worker = session, path = %path.display(), "media send failed: {e}");
            }
        }

        Ok(())
    }
}

//! Inbound attachments: photos and documents from the admin chat.
//!
//! The file lands in the target worker's inbox, and the worker gets a
//! message naming the saved path so the assistant can open it. Target
//! resolution mirrors text routing: a `/<worker>` caption prefix, then the
//! `[worker]` reply prefix, then the focused worker.

use tracing::warn;

use crate::format::media::MediaKind;
use crate::telegram::types::Message;

use super::{reply_prefix_worker, split_word, strip_bot_suffix, Router};

pub(crate) async fn handle_attachment(router: &Router, msg: &Message) {
    let caption_raw = msg.caption.clone().unwrap_or_default();
    let caption_raw = caption_raw.trim();

    // ── Resolve the target worker ───────────────────────────────────
    let mut caption = caption_raw;
    let target = if let Some(rest) = caption_raw.strip_prefix('/') {
        let (token_raw, remainder) = split_word(rest);
        let token = strip_bot_suffix(token_raw).to_lowercase();
        if router.runtime().session_exists(&token).await.unwrap_or(false) {
            caption = remainder;
            Some(token)
        } else {
            None
        }
    } else {
        None
    };

    let target = match target {
        Some(t) => t,
        None => {
            let reply_text = msg
                .reply_to_message
                .as_deref()
                .and_then(|r| r.text.as_deref());
            if let Some(worker) = reply_text.and_then(reply_prefix_worker) {
                if router
                    .runtime()
                    .session_exists(worker)
                    .await
                    .unwrap_or(false)
                {
                    worker.to_string()
                } else {
                    router
                        .reply(msg, &format!("Worker {worker} does not exist."))
                        .await;
                    return;
                }
            } else if let Some(focused) = router.focused().await {
                focused
            } else {
                router
                    .reply(
                        msg,
                        "No one assigned. Use /focus <name> or caption the file with /<name>.",
                    )
                    .await;
                return;
            }
        }
    };

    // ── Download and stash ──────────────────────────────────────────
    let (file_id, filename, kind) = if let Some(doc) = &msg.document {
        (
            doc.file_id.clone(),
            doc.file_name.clone().unwrap_or_else(|| "file".to_string()),
            MediaKind::File,
        )
    } else if let Some(photo) = msg.largest_photo() {
        (
            photo.file_id.clone(),
            format!("photo_{}.jpg", chrono::Utc::now().timestamp()),
            MediaKind::Image,
        )
    } else {
        return;
    };

    let bytes = match router.tg().download_file(&file_id).await {
        Ok(b) => b,
        Err(e) => {
            warn!(worker = %target, "attachment download failed: {e}");
            router
                .reply(msg, "Could not download the attachment from Telegram.")
                .await;
            return;
        }
    };

    let path = match router.store().save_file(&target, &filename, &bytes) {
        Ok(p) => p,
        Err(e) => {
            warn!(worker = %target, "attachment save failed: {e}");
            router.reply(msg, "Could not save the attachment.").await;
            return;
        }
    };

    let input = match kind {
        MediaKind::Image => format!("{caption}\n[Image: {}]", path.display()),
        MediaKind::File => format!("{caption}\n[File: {}]", path.display()),
    };
    router.deliver_to(&target, &input, msg).await;
}

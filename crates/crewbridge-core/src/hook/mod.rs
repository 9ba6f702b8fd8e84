//! The assistant-side Stop hook.
//!
//! Claude runs `crewbridge hook` inside the worker's tmux session whenever
//! it finishes a turn. The hook reads the Stop payload from stdin, pulls
//! the last assistant message out of the transcript (falling back to a pane
//! capture when the transcript is missing), figures out which worker it is
//! from the session environment, and POSTs the text to the node's
//! `/response` endpoint over loopback.

pub mod install;

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

/// The `/response` POST gets a generous timeout: the pipeline in front of
/// it may be uploading media.
const POST_TIMEOUT: Duration = Duration::from_secs(30);

/// Fallback bridge endpoint when no flag or environment says otherwise.
const DEFAULT_BRIDGE_URL: &str = "http://localhost:8080";

/// The Stop payload fields the hook cares about.
#[derive(Debug, Default, Deserialize)]
pub struct StopPayload {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<String>,
}

/// Run the hook: stdin → transcript → `/response`.
pub async fn run(url_override: Option<String>, session_override: Option<String>) -> Result<()> {
    let mut stdin = String::new();
    tokio::io::stdin()
        .read_to_string(&mut stdin)
        .await
        .map_err(|e| BridgeError::Internal(format!("read stdin: {e}")))?;
    let payload: StopPayload = serde_json::from_str(&stdin).unwrap_or_default();

    let text = match transcript_text(&payload).await {
        Some(text) => text,
        None if pane_fallback_enabled() => {
            debug!("no transcript; falling back to pane capture");
            capture_pane().await.unwrap_or_default()
        }
        None => String::new(),
    };
    if text.trim().is_empty() {
        debug!("nothing to report");
        return Ok(());
    }

    let session = match session_override.or_else(|| env_nonempty("SESSION_NAME")) {
        Some(s) => s,
        None => current_tmux_session().await.ok_or_else(|| {
            BridgeError::Config("cannot determine session: set --session or SESSION_NAME".into())
        })?,
    };
    let session = match env_nonempty("TMUX_PREFIX") {
        Some(prefix) => session
            .strip_prefix(&prefix)
            .unwrap_or(&session)
            .to_string(),
        None => session,
    };

    let base = url_override
        .or_else(|| env_nonempty("BRIDGE_URL"))
        .unwrap_or_else(|| DEFAULT_BRIDGE_URL.to_string());

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/response"))
        .timeout(POST_TIMEOUT)
        .json(&json!({ "session": session, "text": text }))
        .send()
        .await
        .map_err(|e| BridgeError::Upstream(format!("POST /response: {e}")))?;
    if !resp.status().is_success() {
        return Err(BridgeError::Upstream(format!(
            "POST /response: HTTP {}",
            resp.status()
        )));
    }
    Ok(())
}

async fn transcript_text(payload: &StopPayload) -> Option<String> {
    let path = payload.transcript_path.as_deref()?;
    match tokio::fs::read_to_string(path).await {
        Ok(content) => last_assistant_text(&content),
        Err(e) => {
            warn!(path, "transcript unreadable: {e}");
            None
        }
    }
}

/// Last assistant message in a transcript JSONL, text blocks joined.
pub fn last_assistant_text(jsonl: &str) -> Option<String> {
    for line in jsonl.lines().rev() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(entry) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if entry.get("type").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        let Some(content) = entry.get("message").and_then(|m| m.get("content")) else {
            continue;
        };
        let text = match content {
            Value::String(s) => s.clone(),
            Value::Array(blocks) => {
                let parts: Vec<&str> = blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect();
                parts.join("\n")
            }
            _ => continue,
        };
        if !text.trim().is_empty() {
            return Some(text);
        }
    }
    None
}

/// Capture the current pane; the hook runs inside the worker's session.
async fn capture_pane() -> Option<String> {
    let out = tokio::process::Command::new("tmux")
        .args(["capture-pane", "-p", "-S", "-200"])
        .output()
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&out.stdout).trim_end().to_string())
}

async fn current_tmux_session() -> Option<String> {
    let out = tokio::process::Command::new("tmux")
        .args(["display-message", "-p", "#{session_name}"])
        .output()
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// `TMUX_FALLBACK=0` (or `false`) turns the pane-capture fallback off.
fn pane_fallback_enabled() -> bool {
    !matches!(
        env_nonempty("TMUX_FALLBACK").as_deref().map(str::trim),
        Some("0") | Some("false") | Some("no")
    )
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_assistant_text_from_blocks() {
        let jsonl = r#"
{"type":"user","message":{"content":"hi"}}
{"type":"assistant","message":{"content":[{"type":"text","text":"first"}]}}
{"type":"assistant","message":{"content":[{"type":"tool_use","name":"bash"},{"type":"text","text":"done"},{"type":"text","text":"and dusted"}]}}
"#;
        assert_eq!(
            last_assistant_text(jsonl),
            Some("done\nand dusted".to_string())
        );
    }

    #[test]
    fn test_last_assistant_text_string_content() {
        let jsonl = r#"{"type":"assistant","message":{"content":"plain"}}"#;
        assert_eq!(last_assistant_text(jsonl), Some("plain".to_string()));
    }

    #[test]
    fn test_last_assistant_skips_tool_only_turns() {
        let jsonl = r#"
{"type":"assistant","message":{"content":[{"type":"text","text":"real answer"}]}}
{"type":"assistant","message":{"content":[{"type":"tool_use","name":"bash"}]}}
"#;
        assert_eq!(last_assistant_text(jsonl), Some("real answer".to_string()));
    }

    #[test]
    fn test_last_assistant_text_none_cases() {
        assert_eq!(last_assistant_text(""), None);
        assert_eq!(last_assistant_text("not json"), None);
        assert_eq!(
            last_assistant_text(r#"{"type":"user","message":{"content":"hi"}}"#),
            None
        );
    }

    #[test]
    fn test_stop_payload_lenient_parse() {
        let payload: StopPayload =
            serde_json::from_str(r#"{"session_id":"s1","unknown_field":true}"#).unwrap();
        assert_eq!(payload.session_id.as_deref(), Some("s1"));
        assert!(payload.transcript_path.is_none());
    }
}

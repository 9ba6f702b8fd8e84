//! Inbound routing: one update in, one decision out.
//!
//! Every webhook update flows through here. The admin gate drops anything
//! from another chat without a reply (the bot stays invisible). Text then
//! goes through a fixed routing priority: bridge command, `/<worker>`
//! shortcut, blocked Claude command, `@all` broadcast, reply-to routing via
//! the `[worker]` prefix, and finally the focused worker.
//!
//! The decision itself is a pure function ([`classify`]) over the message
//! text plus the current worker list and focus; the [`Router`] wraps it with
//! the actual side effects (tmux sends, Telegram acks, focus mutation).

pub mod command;
pub mod files;
pub mod menu;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::BridgeError;
use crate::format::html::escape_html;
use crate::store::FileStore;
use crate::telegram::types::{Message, Update};
use crate::telegram::TelegramClient;
use crate::tmux::WorkerRuntime;

use command::Command;

/// How long to wait for the assistant to accept a submitted message before
/// giving up on the acknowledgement reaction.
const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

// ── Routing decision ────────────────────────────────────────────────

/// Where one piece of inbound text should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// A bridge command with its argument remainder.
    Command(Command, String),
    /// `/<worker>`: focus the worker, optionally routing the remainder.
    WorkerShortcut {
        worker: String,
        remainder: Option<String>,
    },
    /// A Claude command that needs a real terminal.
    Blocked(String),
    /// `@all <text>`: send to every worker.
    Broadcast(String),
    /// Reply-to a `[worker]` message.
    ReplyTo { worker: String, text: String },
    /// Reply-to names a worker that does not exist.
    ReplyToMissing(String),
    /// Plain text for the focused worker.
    Focused { worker: String, text: String },
    /// Nothing matched and the team is empty.
    NoWorkers,
    /// Nothing matched and no worker is focused.
    NoFocus,
}

/// First word and the trimmed remainder.
fn split_word(text: &str) -> (&str, &str) {
    match text.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (text, ""),
    }
}

/// `/team@mybot` → `team`. The menu sends commands suffixed with the bot
/// name in group-style clients; the suffix never matters here.
fn strip_bot_suffix(token: &str) -> &str {
    token.split('@').next().unwrap_or(token)
}

/// Worker named by a `[worker] ...` reply prefix, if the text has one.
fn reply_prefix_worker(referenced: &str) -> Option<&str> {
    let rest = referenced.strip_prefix('[')?;
    let (worker, _) = rest.split_once("] ")?;
    if worker.is_empty() || worker.contains(char::is_whitespace) {
        return None;
    }
    Some(worker)
}

/// Apply the routing priority to already-trimmed text.
///
/// Pure: worker existence and focus come in as arguments. `reply_text` is
/// the referenced message's text when the update is a reply.
pub fn classify(
    text: &str,
    workers: &[String],
    focused: Option<&str>,
    reply_text: Option<&str>,
) -> Route {
    if let Some(rest) = text.strip_prefix('/') {
        let (token_raw, remainder) = split_word(rest);
        let token = strip_bot_suffix(token_raw).to_lowercase();

        if let Some(cmd) = command::lookup(&token) {
            return Route::Command(cmd, remainder.to_string());
        }
        if workers.iter().any(|w| *w == token) {
            return Route::WorkerShortcut {
                worker: token,
                remainder: (!remainder.is_empty()).then(|| remainder.to_string()),
            };
        }
        if command::is_blocked_claude_command(&token) {
            return Route::Blocked(token);
        }
        // Unknown slash tokens fall through: they may be Claude commands
        // the focused worker understands (e.g. /clear).
    }

    if let Some(rest) = text.strip_prefix("@all ") {
        return Route::Broadcast(rest.trim().to_string());
    }

    if let Some(worker) = reply_text.and_then(reply_prefix_worker) {
        return if workers.iter().any(|w| w == worker) {
            Route::ReplyTo {
                worker: worker.to_string(),
                text: text.to_string(),
            }
        } else {
            Route::ReplyToMissing(worker.to_string())
        };
    }

    if let Some(worker) = focused {
        return Route::Focused {
            worker: worker.to_string(),
            text: text.to_string(),
        };
    }

    if workers.is_empty() {
        Route::NoWorkers
    } else {
        Route::NoFocus
    }
}

/// Worker names: short, lowercase, filesystem- and tmux-safe.
pub fn valid_worker_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ── Router ──────────────────────────────────────────────────────────

pub struct Router {
    cfg: Arc<Config>,
    tg: Arc<TelegramClient>,
    runtime: Arc<WorkerRuntime>,
    store: Arc<FileStore>,
    focus: RwLock<Option<String>>,
}

impl Router {
    pub fn new(
        cfg: Arc<Config>,
        tg: Arc<TelegramClient>,
        runtime: Arc<WorkerRuntime>,
        store: Arc<FileStore>,
    ) -> Self {
        Self {
            cfg,
            tg,
            runtime,
            store,
            focus: RwLock::new(None),
        }
    }

    /// Current focused worker, if any.
    pub async fn focused(&self) -> Option<String> {
        self.focus.read().await.clone()
    }

    /// Entry point for one webhook update. Never fails outward: the
    /// webhook handler already answered 200, so problems end up in the log
    /// and, when actionable, in the admin chat.
    pub async fn handle_update(&self, update: Update) {
        let Some(msg) = update.message else {
            return;
        };

        if msg.chat.id != self.cfg.admin_chat_id {
            debug!(chat_id = msg.chat.id, "dropping update from non-admin chat");
            return;
        }

        if msg.document.is_some() || msg.photo.is_some() {
            files::handle_attachment(self, &msg).await;
            return;
        }

        let text = msg.text.clone().unwrap_or_default();
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        let workers = self.runtime.list_sessions().await.unwrap_or_default();
        let focused = self.focused().await;
        let reply_text = msg
            .reply_to_message
            .as_deref()
            .and_then(|r| r.text.as_deref());

        match classify(text, &workers, focused.as_deref(), reply_text) {
            Route::Command(cmd, args) => self.execute(cmd, &args, &msg).await,
            Route::WorkerShortcut { worker, remainder } => {
                *self.focus.write().await = Some(worker.clone());
                match remainder {
                    Some(rest) => self.deliver(&worker, &rest, &msg).await,
                    None => {
                        self.reply(&msg, &format!("Now talking to {worker}.")).await
                    }
                }
            }
            Route::Blocked(token) => {
                self.reply(
                    &msg,
                    &format!("/{token} is interactive and not supported here."),
                )
                .await;
            }
            Route::Broadcast(text) => self.broadcast(&text, &msg, &workers).await,
            Route::ReplyTo { worker, text } => self.deliver(&worker, &text, &msg).await,
            Route::ReplyToMissing(worker) => {
                self.reply(&msg, &format!("Worker {worker} does not exist.")).await
            }
            Route::Focused { worker, text } => self.deliver(&worker, &text, &msg).await,
            Route::NoWorkers => {
                self.reply(&msg, "No team members yet. Use /hire <name> to add one.")
                    .await
            }
            Route::NoFocus => {
                self.reply(&msg, "No one assigned. Use /focus <name> to pick a worker.")
                    .await
            }
        }
    }

    // ── Worker delivery ─────────────────────────────────────────────

    /// Route text to one worker and acknowledge the inbound message with
    /// the eyes reaction iff the assistant accepted it.
    async fn deliver(&self, worker: &str, text: &str, msg: &Message) {
        if self.send_to_worker(worker, text, msg).await {
            self.ack(msg).await;
        }
    }

    /// The per-worker send sequence: chat-id persistence, typing indicator,
    /// pending marker, keystrokes, acceptance poll.
    async fn send_to_worker(&self, worker: &str, text: &str, msg: &Message) -> bool {
        if let Err(e) = self.store.save_chat_id(worker, &msg.chat.id.to_string()) {
            warn!(worker, "chat-id save failed: {e}");
        }
        if let Err(e) = self.tg.send_typing(msg.chat.id).await {
            warn!(worker, "typing indicator failed: {e}");
        }
        if let Err(e) = self.store.set_pending(worker) {
            warn!(worker, "pending marker failed: {e}");
        }
        if let Err(e) = self.runtime.send_message(worker, text).await {
            let note = match e {
                BridgeError::NotFound(m) => m,
                other => format!("Could not reach {worker}: {other}"),
            };
            self.reply(msg, &note).await;
            return false;
        }
        let accepted = self.runtime.prompt_empty(worker, ACCEPT_POLL_TIMEOUT).await;
        if !accepted {
            info!(worker, "assistant input buffer did not clear; skipping ack");
        }
        accepted
    }

    /// `@all`: sequential sends in listing order, one shared reaction.
    async fn broadcast(&self, text: &str, msg: &Message, workers: &[String]) {
        if workers.is_empty() {
            self.reply(msg, "No team members yet. Use /hire <name> to add one.")
                .await;
            return;
        }
        let mut accepted_any = false;
        for worker in workers {
            accepted_any |= self.send_to_worker(worker, text, msg).await;
        }
        if accepted_any {
            self.ack(msg).await;
        }
    }

    async fn ack(&self, msg: &Message) {
        if let Err(e) = self.tg.set_ack_reaction(msg.chat.id, msg.message_id).await {
            warn!("ack reaction failed: {e}");
        }
    }

    pub(crate) async fn reply(&self, msg: &Message, text: &str) {
        if let Err(e) = self.tg.send_message(msg.chat.id, &escape_html(text)).await {
            warn!("reply failed: {e}");
        }
    }

    // ── Commands ────────────────────────────────────────────────────

    async fn execute(&self, cmd: Command, args: &str, msg: &Message) {
        match cmd {
            Command::Hire => self.cmd_hire(args, msg).await,
            Command::End => self.cmd_end(args, msg).await,
            Command::Team => self.cmd_team(msg).await,
            Command::Focus => self.cmd_focus(args, msg).await,
            Command::Pause => self.cmd_pause(msg).await,
            Command::Progress => self.cmd_progress(msg).await,
            Command::Relaunch => self.cmd_relaunch(msg).await,
            Command::Settings => self.cmd_settings(msg).await,
            Command::Learn => self.cmd_learn(args, msg).await,
        }
    }

    async fn cmd_hire(&self, args: &str, msg: &Message) {
        let (name_raw, workdir) = split_word(args);
        if name_raw.is_empty() {
            self.reply(msg, "Usage: /hire <name> [workdir]").await;
            return;
        }
        let name = name_raw.to_lowercase();
        if !valid_worker_name(&name) {
            self.reply(
                msg,
                "Worker names use lowercase letters, digits and hyphens.",
            )
            .await;
            return;
        }
        if command::is_reserved(&name) {
            self.reply(
                msg,
                &format!("{name} is a reserved word and cannot be a worker name."),
            )
            .await;
            return;
        }

        let workdir = (!workdir.is_empty()).then_some(workdir);
        match self.runtime.create_session(&name, workdir).await {
            Ok(()) => {
                *self.focus.write().await = Some(name.clone());
                if let Err(e) = self.store.save_chat_id(&name, &msg.chat.id.to_string()) {
                    warn!(worker = %name, "chat-id save failed: {e}");
                }
                menu::rebuild(&self.tg, &self.runtime).await;
                info!(worker = %name, "hired");
                self.reply(msg, &format!("{} added and assigned.", capitalize(&name)))
                    .await;
            }
            Err(BridgeError::Conflict(note)) | Err(BridgeError::NotFound(note)) => {
                self.reply(msg, &note).await
            }
            Err(e) => {
                warn!(worker = %name, "hire failed: {e}");
                self.reply(msg, &format!("Could not add {name}: {e}")).await;
            }
        }
    }

    async fn cmd_end(&self, args: &str, msg: &Message) {
        let (name_raw, _) = split_word(args);
        if name_raw.is_empty() {
            self.reply(msg, "Usage: /end <name>").await;
            return;
        }
        let name = name_raw.to_lowercase();
        match self.runtime.kill_session(&name).await {
            Ok(()) => {
                let _ = self.store.clear_pending(&name);
                let mut focus = self.focus.write().await;
                if focus.as_deref() == Some(name.as_str()) {
                    *focus = None;
                }
                drop(focus);
                menu::rebuild(&self.tg, &self.runtime).await;
                info!(worker = %name, "dismissed");
                self.reply(msg, &format!("{} dismissed.", capitalize(&name))).await;
            }
            Err(BridgeError::NotFound(note)) => self.reply(msg, &note).await,
            Err(e) => {
                warn!(worker = %name, "end failed: {e}");
                self.reply(msg, &format!("Could not dismiss {name}: {e}")).await;
            }
        }
    }

    async fn cmd_team(&self, msg: &Message) {
        let workers = self.runtime.list_sessions().await.unwrap_or_default();
        if workers.is_empty() {
            self.reply(msg, "No team members yet.").await;
            return;
        }
        let focused = self.focused().await;
        let mut lines = vec!["Your team:".to_string()];
        for worker in &workers {
            let marker = if focused.as_deref() == Some(worker.as_str()) {
                "→"
            } else {
                " "
            };
            let state = if self.runtime.is_claude_running(worker).await {
                "ready"
            } else {
                "offline"
            };
            lines.push(format!("{marker} {worker} ({state})"));
        }
        self.reply(msg, &lines.join("\n")).await;
    }

    async fn cmd_focus(&self, args: &str, msg: &Message) {
        let (name_raw, _) = split_word(args);
        if name_raw.is_empty() {
            self.reply(msg, "Usage: /focus <name>").await;
            return;
        }
        let name = name_raw.to_lowercase();
        match self.runtime.session_exists(&name).await {
            Ok(true) => {
                *self.focus.write().await = Some(name.clone());
                self.reply(msg, &format!("Now talking to {name}.")).await;
            }
            Ok(false) => {
                self.reply(msg, &format!("Worker {name} does not exist.")).await
            }
            Err(e) => {
                warn!("focus check failed: {e}");
                self.reply(msg, &format!("Could not check {name}: {e}")).await;
            }
        }
    }

    async fn cmd_pause(&self, msg: &Message) {
        let Some(worker) = self.focused().await else {
            self.reply(msg, "No one assigned. Use /focus <name> to pick a worker.")
                .await;
            return;
        };
        match self.runtime.send_keys(&worker, &["Escape"]).await {
            Ok(()) => self.reply(msg, &format!("Paused {worker}.")).await,
            Err(e) => self.reply(msg, &format!("Could not pause {worker}: {e}")).await,
        }
    }

    async fn cmd_progress(&self, msg: &Message) {
        let Some(worker) = self.focused().await else {
            self.reply(msg, "No one assigned. Use /focus <name> to pick a worker.")
                .await;
            return;
        };
        let exists = self.runtime.session_exists(&worker).await.unwrap_or(false);
        if !exists {
            self.reply(msg, &format!("Worker {worker} does not exist.")).await;
            return;
        }
        let running = self.runtime.is_claude_running(&worker).await;
        let pane = self
            .runtime
            .get_pane_command(&worker)
            .await
            .unwrap_or_else(|_| "?".to_string());
        let state = if running {
            "assistant running"
        } else {
            "assistant not running"
        };
        let load = if self.store.is_pending(&worker) {
            "a request is pending"
        } else {
            "idle"
        };
        self.reply(msg, &format!("{worker}: {state} (pane: {pane}), {load}."))
            .await;
    }

    async fn cmd_relaunch(&self, msg: &Message) {
        let Some(worker) = self.focused().await else {
            self.reply(msg, "No one assigned. Use /focus <name> to pick a worker.")
                .await;
            return;
        };
        match self.runtime.restart_claude(&worker).await {
            Ok(()) => {
                self.reply(msg, &format!("Restarting the assistant for {worker}."))
                    .await
            }
            Err(e) => {
                self.reply(msg, &format!("Could not restart {worker}: {e}")).await
            }
        }
    }

    async fn cmd_settings(&self, msg: &Message) {
        let workers = self.runtime.list_sessions().await.unwrap_or_default();
        let focused = self.focused().await;
        let sandbox = if self.cfg.sandbox.enabled {
            let mounts = if self.cfg.sandbox.mounts.is_empty() {
                "none".to_string()
            } else {
                self.cfg
                    .sandbox
                    .mounts
                    .iter()
                    .map(|m| {
                        let ro = if m.read_only { " (ro)" } else { "" };
                        format!("{}:{}{ro}", m.host, m.container)
                    })
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            format!("enabled, image {}, mounts: {mounts}", self.cfg.sandbox.image)
        } else {
            "disabled".to_string()
        };
        let text = format!(
            "Node: {}\nAdmin chat: {}\nStorage: {}\nFocus: {}\nWorkers: {}\nSandbox: {sandbox}",
            self.cfg.node,
            self.cfg.admin_chat_id,
            self.cfg.sessions_dir.display(),
            focused.as_deref().unwrap_or("none"),
            if workers.is_empty() {
                "none".to_string()
            } else {
                workers.join(", ")
            },
        );
        self.reply(msg, &text).await;
    }

    async fn cmd_learn(&self, args: &str, msg: &Message) {
        let Some(worker) = self.focused().await else {
            self.reply(msg, "No one assigned. Use /focus <name> to pick a worker.")
                .await;
            return;
        };
        let subject = if args.is_empty() { "the last task" } else { args };
        let prompt = format!(
            "Reflect on {subject}. Answer in three short sections:\n\
             Problem: what was hard or went wrong.\n\
             Fix: what change resolved it.\n\
             Why: why that fix works."
        );
        self.deliver(&worker, &prompt, msg).await;
    }

    // Accessors for the sibling modules.
    pub(crate) fn tg(&self) -> &TelegramClient {
        &self.tg
    }

    pub(crate) fn runtime(&self) -> &WorkerRuntime {
        &self.runtime
    }

    pub(crate) fn store(&self) -> &FileStore {
        &self.store
    }

    pub(crate) async fn deliver_to(&self, worker: &str, text: &str, msg: &Message) {
        self.deliver(worker, text, msg).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_classify_known_command() {
        let route = classify("/hire alice /tmp/proj", &[], None, None);
        assert_eq!(
            route,
            Route::Command(Command::Hire, "alice /tmp/proj".into())
        );
    }

    #[test]
    fn test_classify_alias_and_bot_suffix() {
        assert_eq!(
            classify("/new@crewbot alice", &[], None, None),
            Route::Command(Command::Hire, "alice".into())
        );
        assert_eq!(
            classify("/TEAM", &[], None, None),
            Route::Command(Command::Team, String::new())
        );
    }

    #[test]
    fn test_classify_worker_shortcut() {
        let ws = workers(&["alice", "bob"]);
        assert_eq!(
            classify("/alice", &ws, None, None),
            Route::WorkerShortcut {
                worker: "alice".into(),
                remainder: None
            }
        );
        assert_eq!(
            classify("/alice run the tests", &ws, None, None),
            Route::WorkerShortcut {
                worker: "alice".into(),
                remainder: Some("run the tests".into())
            }
        );
    }

    #[test]
    fn test_classify_blocked_command() {
        assert_eq!(
            classify("/mcp list", &workers(&["alice"]), None, None),
            Route::Blocked("mcp".into())
        );
    }

    #[test]
    fn test_classify_unknown_slash_falls_to_focus() {
        // /clear is not blocked; the focused worker may understand it.
        assert_eq!(
            classify("/clear", &workers(&["alice"]), Some("alice"), None),
            Route::Focused {
                worker: "alice".into(),
                text: "/clear".into()
            }
        );
    }

    #[test]
    fn test_classify_broadcast() {
        assert_eq!(
            classify("@all commit", &workers(&["alice"]), None, None),
            Route::Broadcast("commit".into())
        );
    }

    #[test]
    fn test_classify_reply_routing() {
        let ws = workers(&["alice"]);
        assert_eq!(
            classify("more?", &ws, None, Some("[alice] done")),
            Route::ReplyTo {
                worker: "alice".into(),
                text: "more?".into()
            }
        );
        assert_eq!(
            classify("more?", &[], None, Some("[ghost] done")),
            Route::ReplyToMissing("ghost".into())
        );
    }

    #[test]
    fn test_classify_focus_fallback_and_hints() {
        assert_eq!(
            classify("hello", &workers(&["alice"]), Some("alice"), None),
            Route::Focused {
                worker: "alice".into(),
                text: "hello".into()
            }
        );
        assert_eq!(classify("hello", &[], None, None), Route::NoWorkers);
        assert_eq!(
            classify("hello", &workers(&["alice"]), None, None),
            Route::NoFocus
        );
    }

    #[test]
    fn test_classify_priority_command_over_worker() {
        // A worker cannot shadow a command even if tmux somehow has the
        // session; the command table wins.
        let ws = workers(&["team"]);
        assert_eq!(
            classify("/team", &ws, None, None),
            Route::Command(Command::Team, String::new())
        );
    }

    #[test]
    fn test_reply_prefix_worker() {
        assert_eq!(reply_prefix_worker("[alice] done"), Some("alice"));
        assert_eq!(reply_prefix_worker("[alice]done"), None);
        assert_eq!(reply_prefix_worker("no prefix"), None);
        assert_eq!(reply_prefix_worker("[] done"), None);
        assert_eq!(reply_prefix_worker("[two words] done"), None);
    }

    #[test]
    fn test_valid_worker_names() {
        assert!(valid_worker_name("alice"));
        assert!(valid_worker_name("build-2"));
        assert!(!valid_worker_name(""));
        assert!(!valid_worker_name("Alice"));
        assert!(!valid_worker_name("a b"));
        assert!(!valid_worker_name(&"x".repeat(33)));
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("alice"), "Alice");
        assert_eq!(capitalize(""), "");
    }
}

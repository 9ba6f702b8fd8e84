//! Worker runtime: the bridge's only door to tmux.
//!
//! Every worker is one tmux session named `<prefix><worker>`. The runtime
//! creates, kills, introspects and types into those sessions by invoking the
//! `tmux` binary; nothing is cached, so a session killed behind our back is
//! observed on the next call. Operations on the same session are serialized
//! through a per-session mutex; different sessions proceed in parallel.

pub mod sandbox;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{Config, SandboxConfig};
use crate::error::{BridgeError, Result};

/// Ceiling on any single tmux invocation.
const TMUX_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between keystroke batches so the assistant's input buffer keeps up.
const KEY_DELAY: Duration = Duration::from_millis(50);

/// How often `prompt_empty` re-reads the pane.
const PROMPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wait between the interrupt and the relaunch in `restart_claude`.
const RESTART_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct WorkerRuntime {
    prefix: String,
    sessions_dir: PathBuf,
    bridge_url: String,
    port: u16,
    sandbox: SandboxConfig,
    home: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkerRuntime {
    pub fn new(cfg: &Config) -> Self {
        Self {
            prefix: cfg.prefix.clone(),
            sessions_dir: cfg.sessions_dir.clone(),
            bridge_url: cfg.bridge_url.clone(),
            port: cfg.port,
            sandbox: cfg.sandbox.clone(),
            home: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// A runtime for introspection only (health checks), without a full
    /// bridge configuration.
    pub fn for_node(prefix: String, sessions_dir: PathBuf, port: u16) -> Self {
        Self {
            bridge_url: format!("http://localhost:{port}"),
            prefix,
            sessions_dir,
            port,
            sandbox: SandboxConfig::default(),
            home: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Full tmux session name for a worker.
    pub fn session_name(&self, worker: &str) -> String {
        format!("{}{}", self.prefix, worker)
    }

    fn lock_for(&self, worker: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(worker.to_string()).or_default())
    }

    async fn tmux(&self, args: &[&str]) -> Result<std::process::Output> {
        let verb = args.first().copied().unwrap_or("?");
        let mut cmd = Command::new("tmux");
        cmd.args(args);
        let output = tokio::time::timeout(TMUX_TIMEOUT, cmd.output())
            .await
            .map_err(|_| BridgeError::Internal(format!("tmux {verb} timed out")))?
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    BridgeError::Dependency("tmux is not on PATH".into())
                } else {
                    BridgeError::Internal(format!("tmux {verb}: {e}"))
                }
            })?;
        Ok(output)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Create the session for a new worker and start the assistant in it.
    pub async fn create_session(&self, worker: &str, workdir: Option<&str>) -> Result<()> {
        let session = self.session_name(worker);
        if self.session_exists(worker).await? {
            return Err(BridgeError::Conflict(format!(
                "Worker {worker} already exists."
            )));
        }

        let launch = sandbox::launch_command(&self.sandbox, &self.home);
        let env = [
            format!("BRIDGE_URL={}", self.bridge_url),
            format!("TMUX_PREFIX={}", self.prefix),
            format!("SESSIONS_DIR={}", self.sessions_dir.display()),
            format!("PORT={}", self.port),
        ];

        let mut args: Vec<&str> = vec!["new-session", "-d", "-s", &session];
        if let Some(dir) = workdir {
            args.push("-c");
            args.push(dir);
        }
        for pair in &env {
            args.push("-e");
            args.push(pair);
        }
        args.push(&launch);

        let out = self.tmux(&args).await?;
        if !out.status.success() {
            return Err(BridgeError::Internal(format!(
                "tmux new-session failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        debug!(worker, session = %session, sandboxed = self.sandbox.enabled, "session created");
        Ok(())
    }

    /// Kill a worker's session. Missing session is an error.
    pub async fn kill_session(&self, worker: &str) -> Result<()> {
        let session = self.session_name(worker);
        let _guard = self.lock_for(worker).lock_owned().await;
        let out = self.tmux(&["kill-session", "-t", &exact(&session)]).await?;
        if !out.status.success() {
            return Err(BridgeError::NotFound(format!(
                "Worker {worker} does not exist."
            )));
        }
        Ok(())
    }

    pub async fn session_exists(&self, worker: &str) -> Result<bool> {
        let session = self.session_name(worker);
        let out = self.tmux(&["has-session", "-t", &exact(&session)]).await?;
        Ok(out.status.success())
    }

    /// Worker names of all sessions under this node's prefix.
    ///
    /// Goes to the binary every time; tmux is the single source of truth for
    /// which workers exist.
    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        let out = self
            .tmux(&["list-sessions", "-F", "#{session_name}"])
            .await?;
        // A dead tmux server answers with an error; that just means no sessions.
        if !out.status.success() {
            return Ok(Vec::new());
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        let mut workers: Vec<String> = stdout
            .lines()
            .filter_map(|name| name.strip_prefix(&self.prefix))
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        workers.sort();
        Ok(workers)
    }

    // ── Input ───────────────────────────────────────────────────────

    /// Type a message into the worker's prompt and submit it.
    ///
    /// Multi-line text is entered line by line with literal newlines in
    /// between, so only the final Enter submits.
    pub async fn send_message(&self, worker: &str, text: &str) -> Result<()> {
        let session = self.session_name(worker);
        let _guard = self.lock_for(worker).lock_owned().await;

        let lines: Vec<&str> = text.split('\n').collect();
        let last = lines.len() - 1;
        for (i, line) in lines.iter().enumerate() {
            if !line.is_empty() {
                let out = self.tmux(&["send-keys", "-t", &session, "-l", line]).await?;
                if !out.status.success() {
                    return Err(BridgeError::NotFound(format!(
                        "Worker {worker} does not exist."
                    )));
                }
            }
            if i != last {
                self.tmux(&["send-keys", "-t", &session, "-l", "\n"]).await?;
            }
            tokio::time::sleep(KEY_DELAY).await;
        }
        self.tmux(&["send-keys", "-t", &session, "Enter"]).await?;
        Ok(())
    }

    /// Send literal key tokens (e.g. `Escape`) to the worker.
    pub async fn send_keys(&self, worker: &str, keys: &[&str]) -> Result<()> {
        let session = self.session_name(worker);
        let _guard = self.lock_for(worker).lock_owned().await;
        let mut args = vec!["send-keys", "-t", session.as_str()];
        args.extend_from_slice(keys);
        let out = self.tmux(&args).await?;
        if !out.status.success() {
            return Err(BridgeError::NotFound(format!(
                "Worker {worker} does not exist."
            )));
        }
        Ok(())
    }

    // ── Introspection ───────────────────────────────────────────────

    /// Foreground command of the worker's pane.
    pub async fn get_pane_command(&self, worker: &str) -> Result<String> {
        let session = self.session_name(worker);
        let out = self
            .tmux(&["display-message", "-p", "-t", &session, "#{pane_current_command}"])
            .await?;
        if !out.status.success() {
            return Err(BridgeError::NotFound(format!(
                "Worker {worker} does not exist."
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// Is the assistant process alive in this worker's pane?
    ///
    /// The pane command usually says so directly; when the pane runs a shell
    /// or container wrapper, fall back to scanning its descendant processes.
    pub async fn is_claude_running(&self, worker: &str) -> bool {
        match self.get_pane_command(worker).await {
            Ok(cmd) if cmd.contains(sandbox::CLAUDE_PROCESS) => true,
            Ok(_) => self.pane_has_claude_descendant(worker).await,
            Err(_) => false,
        }
    }

    async fn pane_has_claude_descendant(&self, worker: &str) -> bool {
        let session = self.session_name(worker);
        let Ok(out) = self
            .tmux(&["display-message", "-p", "-t", &session, "#{pane_pid}"])
            .await
        else {
            return false;
        };
        let Ok(root) = String::from_utf8_lossy(&out.stdout).trim().parse::<u32>() else {
            return false;
        };

        // Breadth-first over the process tree, a few levels deep.
        let mut frontier = vec![root];
        for _ in 0..4 {
            let mut next = Vec::new();
            for pid in frontier.drain(..) {
                let Ok(out) = Command::new("pgrep")
                    .args(["-P", &pid.to_string()])
                    .output()
                    .await
                else {
                    return false;
                };
                for line in String::from_utf8_lossy(&out.stdout).lines() {
                    if let Ok(child) = line.trim().parse::<u32>() {
                        next.push(child);
                    }
                }
            }
            if next.is_empty() {
                return false;
            }
            for pid in &next {
                if let Ok(out) = Command::new("ps")
                    .args(["-o", "comm=", "-p", &pid.to_string()])
                    .output()
                    .await
                {
                    if String::from_utf8_lossy(&out.stdout)
                        .trim()
                        .contains(sandbox::CLAUDE_PROCESS)
                    {
                        return true;
                    }
                }
            }
            frontier = next;
        }
        false
    }

    /// Poll the pane until the assistant's input box is empty or `timeout`
    /// elapses. An empty box means the last submit was accepted.
    pub async fn prompt_empty(&self, worker: &str, timeout: Duration) -> bool {
        let session = self.session_name(worker);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(out) = self.tmux(&["capture-pane", "-p", "-t", &session]).await {
                if out.status.success()
                    && input_prompt_empty(&String::from_utf8_lossy(&out.stdout))
                {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(PROMPT_POLL_INTERVAL).await;
        }
    }

    /// Environment value inside a worker's session, as tmux sees it.
    pub async fn session_env(&self, worker: &str, key: &str) -> Result<Option<String>> {
        let session = self.session_name(worker);
        let out = self
            .tmux(&["show-environment", "-t", &session, key])
            .await?;
        if !out.status.success() {
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        Ok(stdout
            .trim()
            .strip_prefix(&format!("{key}="))
            .map(str::to_string))
    }

    /// Interrupt whatever the pane is doing and start the assistant again.
    pub async fn restart_claude(&self, worker: &str) -> Result<()> {
        let session = self.session_name(worker);
        let launch = sandbox::launch_command(&self.sandbox, &self.home);
        let _guard = self.lock_for(worker).lock_owned().await;

        let out = self.tmux(&["send-keys", "-t", &session, "C-c"]).await?;
        if !out.status.success() {
            return Err(BridgeError::NotFound(format!(
                "Worker {worker} does not exist."
            )));
        }
        tokio::time::sleep(RESTART_DELAY).await;
        self.tmux(&["send-keys", "-t", &session, "-l", &launch]).await?;
        self.tmux(&["send-keys", "-t", &session, "Enter"]).await?;
        warn!(worker, "assistant relaunched");
        Ok(())
    }
}

/// tmux `-t` target with exact-name matching instead of prefix matching.
fn exact(session: &str) -> String {
    format!("={session}")
}

/// Decide from a pane capture whether the assistant's input box is empty.
///
/// The box renders as a bordered line whose content starts with `>`; the
/// last such line is the live prompt. Anything after the `>` other than
/// whitespace and border characters means there is still text queued.
fn input_prompt_empty(pane: &str) -> bool {
    for line in pane.lines().rev() {
        let inner = line.trim().trim_matches('│').trim();
        if let Some(rest) = inner.strip_prefix('>') {
            return rest.trim().is_empty();
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_target() {
        assert_eq!(exact("crew-prod-alice"), "=crew-prod-alice");
    }

    #[test]
    fn test_prompt_empty_detection() {
        let empty = "some output\n╭──────╮\n│ >    │\n╰──────╯\n";
        assert!(input_prompt_empty(empty));

        let typing = "some output\n╭──────────────╮\n│ > still here │\n╰──────────────╯\n";
        assert!(!input_prompt_empty(typing));

        let no_prompt = "plain shell output\n$ ls\n";
        assert!(!input_prompt_empty(no_prompt));
    }

    #[test]
    fn test_prompt_empty_uses_last_prompt_line() {
        let pane = "│ > old text │\nmore output\n│ > │\n";
        assert!(input_prompt_empty(pane));
        let pane = "│ > │\nmore output\n│ > new text │\n";
        assert!(!input_prompt_empty(pane));
    }
}

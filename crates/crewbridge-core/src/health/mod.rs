//! Node diagnostics and the one safe auto-repair.
//!
//! `status` walks a node from the outside in: state directory, bridge
//! listener, tunnel process and URL, webhook registration, worker session
//! environment, and the Stop hook in Claude's settings. Each finding is an
//! [`Issue`] with a severity and, where one exists, the command that fixes
//! it. `fix` performs exactly one repair by itself (re-registering the
//! webhook against the current tunnel URL) because everything else either
//! loses state or needs a decision from the operator.

use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::config;
use crate::error::{BridgeError, Result};
use crate::hook::install as hook_install;
use crate::node::{pid_alive, NodeFiles};
use crate::telegram::TelegramClient;
use crate::tmux::WorkerRuntime;

/// Probe budget for the public tunnel URL.
const TUNNEL_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Probe budget for the local listener.
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warn,
    Error,
}

impl Severity {
    fn exit_code(self) -> i32 {
        match self {
            Severity::Warn => 1,
            Severity::Error => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Issue {
    pub severity: Severity,
    pub message: String,
    pub fix_hint: Option<String>,
    /// Whether `fix` can repair this one on its own.
    pub auto_fixable: bool,
}

impl Issue {
    fn error(message: impl Into<String>, fix_hint: Option<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            fix_hint,
            auto_fixable: false,
        }
    }

    fn warn(message: impl Into<String>, fix_hint: Option<String>) -> Self {
        Self {
            severity: Severity::Warn,
            message: message.into(),
            fix_hint,
            auto_fixable: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub node: String,
    pub issues: Vec<Issue>,
}

impl HealthReport {
    /// 0 when clean, 1 when only warnings, 2 when anything is broken.
    pub fn exit_code(&self) -> i32 {
        self.issues
            .iter()
            .map(|i| i.severity.exit_code())
            .max()
            .unwrap_or(0)
    }

    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Run every check for one node.
pub async fn check_node(state_root: &Path, node: &str, token: Option<&str>) -> HealthReport {
    let mut issues = Vec::new();
    let node_dir = state_root.join("nodes").join(node);
    let files = NodeFiles::new(&node_dir);

    if !node_dir.is_dir() {
        issues.push(Issue::error(
            format!("node directory missing: {}", node_dir.display()),
            Some(format!("crewbridge serve --node {node}")),
        ));
        return HealthReport {
            node: node.to_string(),
            issues,
        };
    }

    // ── Bridge listener ─────────────────────────────────────────────
    let port = files.read_port();
    match port {
        None => issues.push(Issue::error(
            "bridge is not running (no port file)",
            Some(format!("crewbridge serve --node {node}")),
        )),
        Some(port) => {
            if !port_listening(port).await {
                issues.push(Issue::error(
                    format!("nothing is listening on port {port}"),
                    Some(format!("crewbridge serve --node {node}")),
                ));
            }
        }
    }

    // ── Tunnel ──────────────────────────────────────────────────────
    let tunnel_url = files.read_tunnel_url();
    match files.read_tunnel_pid() {
        None => issues.push(Issue::warn(
            "no tunnel registered for this node",
            Some("crewbridge tunnel".to_string()),
        )),
        Some(pid) if !pid_alive(pid) => issues.push(Issue::error(
            format!("tunnel process {pid} is dead"),
            Some("crewbridge tunnel".to_string()),
        )),
        Some(_) => {
            if let Some(url) = &tunnel_url {
                if !url_reachable(url).await {
                    issues.push(Issue::error(
                        format!("tunnel URL {url} is unreachable"),
                        Some("crewbridge tunnel".to_string()),
                    ));
                }
            }
        }
    }

    // ── Webhook registration ────────────────────────────────────────
    match (token, &tunnel_url) {
        (Some(token), Some(tunnel_url)) => {
            let expected = format!("{tunnel_url}/webhook");
            let tg = TelegramClient::new(token);
            match tg.get_webhook_info().await {
                Ok(info) if info.url == expected => {}
                Ok(info) => {
                    let mut issue = Issue::error(
                        format!(
                            "webhook points at {:?}, expected {expected}",
                            info.url
                        ),
                        Some(format!("crewbridge fix --node {node}")),
                    );
                    issue.auto_fixable = true;
                    issues.push(issue);
                }
                Err(e) => issues.push(Issue::warn(
                    format!("webhook registration not checked: {e}"),
                    None,
                )),
            }
        }
        (None, Some(_)) => issues.push(Issue::warn(
            "bot token not provided; webhook registration not checked",
            Some("crewbridge status --token <token>".to_string()),
        )),
        _ => {}
    }

    // ── Worker session environment ──────────────────────────────────
    let prefix = config::node_prefix(node);
    let sessions_dir = node_dir.join("sessions");
    let runtime = WorkerRuntime::for_node(
        prefix.clone(),
        sessions_dir.clone(),
        port.unwrap_or_else(|| config::node_port(node)),
    );
    if let Ok(workers) = runtime.list_sessions().await {
        let expected = [
            ("BRIDGE_URL", format!("http://localhost:{}", port.unwrap_or_else(|| config::node_port(node)))),
            ("TMUX_PREFIX", prefix.clone()),
            ("SESSIONS_DIR", sessions_dir.display().to_string()),
        ];
        for worker in workers {
            for (key, want) in &expected {
                let got = runtime.session_env(&worker, key).await.unwrap_or(None);
                if got.as_deref() != Some(want.as_str()) {
                    debug!(worker = %worker, key = %key, ?got, "environment mismatch");
                    issues.push(Issue::warn(
                        format!("worker {worker}: {key} is {got:?}, expected {want:?}"),
                        Some(format!("/end {worker} then /hire {worker}")),
                    ));
                }
            }
        }
    }

    // ── Stop hook ───────────────────────────────────────────────────
    if !hook_install::installed(&hook_install::settings_path()) {
        issues.push(Issue::warn(
            "Stop hook is not installed in Claude settings",
            Some("crewbridge hook install".to_string()),
        ));
    }

    HealthReport {
        node: node.to_string(),
        issues,
    }
}

/// Outcome of a `fix` run, for display.
pub struct FixOutcome {
    pub repaired: Vec<String>,
    pub remaining: Vec<Issue>,
}

/// Perform the single safe auto-repair and report what is left.
pub async fn fix_node(state_root: &Path, node: &str, token: &str) -> Result<FixOutcome> {
    let report = check_node(state_root, node, Some(token)).await;
    let mut repaired = Vec::new();
    let mut remaining = Vec::new();

    for issue in report.issues {
        if !issue.auto_fixable {
            remaining.push(issue);
            continue;
        }
        let files = NodeFiles::new(state_root.join("nodes").join(node));
        let Some(tunnel_url) = files.read_tunnel_url() else {
            remaining.push(issue);
            continue;
        };
        let expected = format!("{tunnel_url}/webhook");
        let tg = TelegramClient::new(token);
        match tg.set_webhook(&expected).await {
            Ok(()) => repaired.push(format!("webhook re-registered to {expected}")),
            Err(e) => {
                return Err(BridgeError::Upstream(format!(
                    "webhook re-registration failed: {e}"
                )))
            }
        }
    }

    Ok(FixOutcome {
        repaired,
        remaining,
    })
}

async fn port_listening(port: u16) -> bool {
    tokio::time::timeout(
        PORT_PROBE_TIMEOUT,
        tokio::net::TcpStream::connect(("127.0.0.1", port)),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false)
}

/// Any HTTP answer counts as reachable; the probe only proves the tunnel
/// forwards traffic.
async fn url_reachable(url: &str) -> bool {
    let client = reqwest::Client::new();
    client
        .get(url)
        .timeout(TUNNEL_PROBE_TIMEOUT)
        .send()
        .await
        .is_ok()
}

//! The tunnel runner and its watchdog.
//!
//! Telegram can only deliver webhooks to a public HTTPS URL, so the bridge
//! leans on cloudflared's quick tunnels: start the process, scrape the
//! `*.trycloudflare.com` URL it prints, register the webhook against it,
//! and then keep watching. When the process dies or the URL stops
//! answering, the tunnel is restarted, the webhook re-registered, and the
//! admin told about the new URL through the node's local `/notify`.

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crewbridge_core::config;
use crewbridge_core::error::{BridgeError, Result};
use crewbridge_core::node::server::register_webhook_with_retry;
use crewbridge_core::node::NodeFiles;
use crewbridge_core::telegram::TelegramClient;

/// How long to wait for cloudflared to print its URL.
const URL_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Watchdog probe cadence.
const WATCH_INTERVAL: Duration = Duration::from_secs(30);

/// Reachability probe budget (matches the health check).
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consecutive failed probes before the tunnel is declared dead.
const PROBE_STRIKES: u32 = 2;

static TUNNEL_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://[a-zA-Z0-9-]+\.trycloudflare\.com").unwrap());

pub struct TunnelOpts {
    pub token: String,
    pub url: Option<String>,
    pub port: Option<u16>,
    pub node: String,
    pub webhook_path: String,
    pub cloudflared: String,
}

/// Run the tunnel until interrupted. With `--url` there is no process to
/// babysit: the webhook is registered once and we are done.
pub async fn run(opts: TunnelOpts, cancel: CancellationToken) -> Result<i32> {
    let files = NodeFiles::new(config::state_root().join("nodes").join(&opts.node));
    let tg = TelegramClient::new(&opts.token);

    if let Some(url) = &opts.url {
        register_webhook_with_retry(&tg, &format!("{url}{}", opts.webhook_path)).await?;
        files.write_tunnel_url(url)?;
        println!("Webhook registered at {url}{}", opts.webhook_path);
        return Ok(0);
    }

    let port = opts
        .port
        .or_else(|| files.read_port())
        .unwrap_or_else(|| config::node_port(&opts.node));

    loop {
        let (mut child, url) = start_tunnel(&opts.cloudflared, port).await?;
        files.write_tunnel_pid(child.id().unwrap_or_default())?;
        files.write_tunnel_url(&url)?;
        register_webhook_with_retry(&tg, &format!("{url}{}", opts.webhook_path)).await?;
        info!(url = %url, port, "tunnel up");
        notify_local(port, &format!("Tunnel online at {url}.")).await;

        if watch(&mut child, &url, &cancel).await {
            // Cancelled: take the tunnel down with us.
            let _ = child.kill().await;
            return Ok(0);
        }

        warn!("tunnel lost; restarting");
        let _ = child.kill().await;
        notify_local(port, "Tunnel lost. Restarting with a fresh URL.").await;
    }
}

/// Spawn cloudflared and scrape the public URL from its output.
async fn start_tunnel(cloudflared: &str, port: u16) -> Result<(Child, String)> {
    let mut child = Command::new(cloudflared)
        .args(["tunnel", "--url", &format!("http://localhost:{port}")])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BridgeError::Dependency(format!("{cloudflared} is not on PATH"))
            } else {
                BridgeError::Internal(format!("spawn {cloudflared}: {e}"))
            }
        })?;

    // cloudflared logs to stderr, including the quick-tunnel URL banner.
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| BridgeError::Internal("no stderr from tunnel process".into()))?;
    let mut lines = BufReader::new(stderr).lines();

    let url = tokio::time::timeout(URL_WAIT_TIMEOUT, async {
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(url) = extract_tunnel_url(&line) {
                return Some(url);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
    .ok_or_else(|| {
        BridgeError::Upstream("tunnel started but never printed a public URL".into())
    })?;

    // Keep draining stderr so the child never blocks on a full pipe.
    tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    Ok((child, url))
}

/// Watch one tunnel. Returns `true` when cancelled, `false` when the
/// tunnel died or went unreachable.
async fn watch(child: &mut Child, url: &str, cancel: &CancellationToken) -> bool {
    let mut strikes = 0u32;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return true,
            _ = tokio::time::sleep(WATCH_INTERVAL) => {}
        }

        if let Ok(Some(status)) = child.try_wait() {
            warn!(%status, "tunnel process exited");
            return false;
        }

        if url_reachable(url).await {
            strikes = 0;
        } else {
            strikes += 1;
            warn!(url = %url, strikes, "tunnel probe failed");
            if strikes >= PROBE_STRIKES {
                return false;
            }
        }
    }
}

async fn url_reachable(url: &str) -> bool {
    reqwest::Client::new()
        .get(url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .is_ok()
}

/// Best-effort note to the admin through the node's loopback endpoint.
async fn notify_local(port: u16, text: &str) {
    let body = serde_json::json!({ "text": text });
    let result = reqwest::Client::new()
        .post(format!("http://localhost:{port}/notify"))
        .timeout(PROBE_TIMEOUT)
        .json(&body)
        .send()
        .await;
    if let Err(e) = result {
        warn!("notify failed (bridge not running?): {e}");
    }
}

/// The quick-tunnel URL, if this log line carries one.
pub fn extract_tunnel_url(line: &str) -> Option<String> {
    TUNNEL_URL_RE.find(line).map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_tunnel_url() {
        let line = "2026-08-01T10:00:00Z INF +  https://lucky-crab-example.trycloudflare.com  +";
        assert_eq!(
            extract_tunnel_url(line),
            Some("https://lucky-crab-example.trycloudflare.com".to_string())
        );
        assert_eq!(extract_tunnel_url("no url here"), None);
        assert_eq!(
            extract_tunnel_url("visit https://example.com today"),
            None
        );
    }
}

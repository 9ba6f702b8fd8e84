//! The node's HTTP surface and its run loop.
//!
//! Three routes on one loopback listener: `/webhook` (Telegram updates,
//! forwarded by the tunnel), `/response` (Stop-hook callbacks), and
//! `/notify` (local broadcast). The webhook handler answers 200 as soon as
//! the update parses; Telegram re-delivers on anything else, and duplicate
//! storms are worse than a lost message. Shutdown drains handlers for at
//! most five seconds, tells every known chat the bridge is going away, and
//! removes the node's marker files. tmux sessions are left running.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Json;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::pipeline::ResponsePipeline;
use crate::router::{menu, Router};
use crate::store::{FileStore, INBOX_MAX_AGE};
use crate::telegram::types::Update;
use crate::telegram::TelegramClient;
use crate::tmux::WorkerRuntime;

use super::NodeFiles;

/// Ceiling on draining in-flight handlers at shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Backoff schedule for webhook registration while tunnel DNS propagates.
const WEBHOOK_RETRY_DELAYS: &[u64] = &[0, 1, 2, 5, 15, 30, 60];

/// How often stale inbox files are swept.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct AppState {
    pub cfg: Arc<Config>,
    pub tg: Arc<TelegramClient>,
    pub router: Arc<Router>,
    pub pipeline: Arc<ResponsePipeline>,
    pub store: Arc<FileStore>,
}

pub fn app(state: Arc<AppState>) -> axum::Router {
    axum::Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/response", post(handle_response))
        .route("/notify", post(handle_notify))
        .with_state(state)
}

// ── Handlers ────────────────────────────────────────────────────────

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    Json(update): Json<Update>,
) -> StatusCode {
    // Answer immediately; the routing work happens off the request path so
    // an internal failure can never turn into a Telegram retry storm.
    tokio::spawn(async move {
        state.router.handle_update(update).await;
    });
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct ResponseBody {
    session: Option<String>,
    text: Option<String>,
}

async fn handle_response(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ResponseBody>,
) -> StatusCode {
    let (Some(session), Some(text)) = (body.session, body.text) else {
        return StatusCode::BAD_REQUEST;
    };
    match state.pipeline.handle_response(&session, &text).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!(worker = %session, "response pipeline failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[derive(Debug, Deserialize)]
struct NotifyBody {
    text: Option<String>,
}

async fn handle_notify(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NotifyBody>,
) -> StatusCode {
    let Some(text) = body.text else {
        return StatusCode::BAD_REQUEST;
    };
    broadcast(&state.tg, &state.store, state.cfg.admin_chat_id, &text).await;
    StatusCode::OK
}

/// Send `text` to every chat that ever addressed a worker, plus the admin.
pub async fn broadcast(tg: &TelegramClient, store: &FileStore, admin: i64, text: &str) {
    let mut targets: BTreeSet<i64> = store
        .get_all_chat_ids()
        .iter()
        .filter_map(|id| id.parse().ok())
        .collect();
    targets.insert(admin);
    let html = crate::format::html::escape_html(text);
    for chat_id in targets {
        if let Err(e) = tg.send_message(chat_id, &html).await {
            warn!(chat_id, "broadcast failed: {e}");
        }
    }
}

// ── Run loop ────────────────────────────────────────────────────────

/// Bring the node up, serve until cancelled, then tear down.
pub async fn run(cfg: Config, cancel: CancellationToken) -> Result<()> {
    let cfg = Arc::new(cfg);
    let files = NodeFiles::new(&cfg.node_dir);
    files.acquire_pid()?;

    let result = run_inner(Arc::clone(&cfg), &files, cancel).await;
    files.cleanup();
    result
}

async fn run_inner(
    cfg: Arc<Config>,
    files: &NodeFiles,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = format!("127.0.0.1:{}", cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            BridgeError::Conflict(format!(
                "port {} is already in use (is node {} already running?)",
                cfg.port, cfg.node
            ))
        } else {
            BridgeError::Internal(format!("bind {addr}: {e}"))
        }
    })?;
    files.write_port(cfg.port)?;
    files.write_bridge_pid()?;

    let tg = Arc::new(TelegramClient::new(&cfg.token));
    let store = Arc::new(FileStore::new(&cfg.sessions_dir));
    let runtime = Arc::new(WorkerRuntime::new(&cfg));
    let router = Arc::new(Router::new(
        Arc::clone(&cfg),
        Arc::clone(&tg),
        Arc::clone(&runtime),
        Arc::clone(&store),
    ));
    let pipeline = Arc::new(ResponsePipeline::new(
        Arc::clone(&cfg),
        Arc::clone(&tg),
        Arc::clone(&store),
    ));

    match tg.get_me().await {
        Ok(me) => {
            if let Err(e) = files.save_bot_identity(me.id, me.username.as_deref()) {
                warn!("bot identity save failed: {e}");
            }
        }
        Err(e) => warn!("getMe failed: {e}"),
    }
    menu::rebuild(&tg, &runtime).await;

    if let Some(tunnel_url) = files.read_tunnel_url() {
        register_webhook_with_retry(&tg, &format!("{tunnel_url}/webhook")).await?;
    }

    // Hourly sweep of stale inbox files, plus one pass right away.
    {
        let store = Arc::clone(&store);
        let sweep_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let removed = store.cleanup_all_inboxes(INBOX_MAX_AGE);
                if removed > 0 {
                    info!(removed, "inbox cleanup");
                }
                tokio::select! {
                    _ = sweep_cancel.cancelled() => break,
                    _ = tokio::time::sleep(CLEANUP_INTERVAL) => {}
                }
            }
        });
    }

    let state = Arc::new(AppState {
        cfg: Arc::clone(&cfg),
        tg: Arc::clone(&tg),
        router,
        pipeline,
        store: Arc::clone(&store),
    });

    info!(node = %cfg.node, port = cfg.port, "bridge online");
    if let Err(e) = tg
        .send_message(
            cfg.admin_chat_id,
            &format!("Bridge online. Node <b>{}</b> on port {}.", cfg.node, cfg.port),
        )
        .await
    {
        warn!("online notice failed: {e}");
    }

    let shutdown = cancel.clone();
    let server = axum::serve(listener, app(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await });
    let mut serving = tokio::spawn(async move { server.await });

    tokio::select! {
        res = &mut serving => {
            // The listener died on its own; report it.
            let inner = res.map_err(|e| BridgeError::Internal(format!("server task: {e}")))?;
            inner.map_err(|e| BridgeError::Internal(format!("server: {e}")))?;
        }
        _ = cancel.cancelled() => {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut serving).await.is_err() {
                warn!("drain timeout; closing remaining connections");
                serving.abort();
            }
        }
    }

    info!(node = %cfg.node, "bridge going offline");
    broadcast(
        &tg,
        &store,
        cfg.admin_chat_id,
        "Going offline briefly. Your team stays the same.",
    )
    .await;
    Ok(())
}

/// Register the webhook, tolerating tunnel DNS that is still propagating.
pub async fn register_webhook_with_retry(tg: &TelegramClient, url: &str) -> Result<()> {
    let mut last_err = None;
    for (attempt, delay) in WEBHOOK_RETRY_DELAYS.iter().enumerate() {
        if *delay > 0 {
            tokio::time::sleep(Duration::from_secs(*delay)).await;
        }
        match tg.set_webhook(url).await {
            Ok(()) => {
                info!(url, "webhook registered");
                return Ok(());
            }
            Err(e) => {
                warn!(attempt, url, "webhook registration failed: {e}");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| BridgeError::Upstream("webhook registration failed".into())))
}

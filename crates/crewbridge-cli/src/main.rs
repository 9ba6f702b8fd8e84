//! crewbridge CLI — run a node, wire the hook, keep the tunnel alive.
//!
//! Usage:
//!   crewbridge serve --token T --admin A     — run a bridge node
//!   crewbridge hook [install]                — Stop hook / its installer
//!   crewbridge webhook --url U               — register the webhook once
//!   crewbridge tunnel                        — cloudflared + watchdog
//!   crewbridge status [--all]                — diagnose nodes
//!   crewbridge fix                           — re-register the webhook
//!
//! Exit codes: 0 ok, 1 degraded (warnings), 2 critical, 3 bad config,
//! 4 missing external dependency.

mod tunnel;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crewbridge_core::config::{self, Config, ConfigOverrides};
use crewbridge_core::error::{BridgeError, Result};
use crewbridge_core::health;
use crewbridge_core::hook;
use crewbridge_core::node;
use crewbridge_core::telegram::TelegramClient;

#[derive(Parser)]
#[command(
    name = "crewbridge",
    version,
    about = "A single-admin Telegram gateway for a team of tmux-hosted Claude sessions"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bridge node (webhook router + response pipeline)
    Serve {
        /// Bot token (or TELEGRAM_BOT_TOKEN)
        #[arg(long)]
        token: Option<String>,
        /// Admin chat id (or ADMIN_CHAT_ID)
        #[arg(long)]
        admin: Option<String>,
        /// Node name (or NODE_NAME; default "prod")
        #[arg(long)]
        node: Option<String>,
        /// Port override (or PORT; default derived from the node name)
        #[arg(long)]
        port: Option<u16>,
        /// JSON log output
        #[arg(long)]
        json: bool,
        /// Run workers inside the sandbox container
        #[arg(long, conflicts_with = "no_sandbox")]
        sandbox: bool,
        /// Run workers directly even if SANDBOX_ENABLED is set
        #[arg(long)]
        no_sandbox: bool,
        /// Sandbox image (or SANDBOX_IMAGE)
        #[arg(long)]
        sandbox_image: Option<String>,
        /// Extra sandbox mount host:container (repeatable)
        #[arg(long = "mount")]
        mounts: Vec<String>,
        /// Extra read-only sandbox mount host:container (repeatable)
        #[arg(long = "mount-ro")]
        mounts_ro: Vec<String>,
    },

    /// Forward the assistant's Stop output to the node (runs from Claude)
    Hook {
        #[command(subcommand)]
        action: Option<HookAction>,
        /// Bridge URL override (or BRIDGE_URL)
        #[arg(long)]
        url: Option<String>,
        /// Session name override (or SESSION_NAME)
        #[arg(long)]
        session: Option<String>,
    },

    /// Register the Telegram webhook once
    Webhook {
        /// Bot token (or TELEGRAM_BOT_TOKEN)
        #[arg(long)]
        token: Option<String>,
        /// Public HTTPS URL of the /webhook endpoint
        #[arg(long)]
        url: String,
    },

    /// Run cloudflared in front of the node and keep the webhook registered
    Tunnel {
        /// Bot token (or TELEGRAM_BOT_TOKEN)
        #[arg(long)]
        token: Option<String>,
        /// Use an existing public URL instead of starting cloudflared
        #[arg(long)]
        url: Option<String>,
        /// Local port to expose (default: the node's port)
        #[arg(long)]
        port: Option<u16>,
        /// Node name (default "prod")
        #[arg(long)]
        node: Option<String>,
        /// Webhook path appended to the public URL
        #[arg(long, default_value = "/webhook")]
        webhook_path: String,
        /// cloudflared binary
        #[arg(long, default_value = "cloudflared")]
        cloudflared: String,
    },

    /// Diagnose one node (or all of them)
    Status {
        #[arg(long)]
        node: Option<String>,
        /// Check every node under the state root
        #[arg(long)]
        all: bool,
        /// Bot token, needed for the webhook check (or TELEGRAM_BOT_TOKEN)
        #[arg(long)]
        token: Option<String>,
    },

    /// Re-register the webhook against the current tunnel URL
    Fix {
        #[arg(long)]
        node: Option<String>,
        /// Bot token (or TELEGRAM_BOT_TOKEN)
        #[arg(long)]
        token: Option<String>,
    },

    /// Print the version
    Version,
}

#[derive(Subcommand)]
enum HookAction {
    /// Patch ~/.claude/settings.json to run the hook on Stop
    Install,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json_log = matches!(&cli.command, Commands::Serve { json: true, .. });
    init_tracing(json_log);

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e}");
            std::process::exit(e.exit_code());
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Serve {
            token,
            admin,
            node,
            port,
            json,
            sandbox,
            no_sandbox,
            sandbox_image,
            mounts,
            mounts_ro,
        } => {
            let cfg = Config::resolve(ConfigOverrides {
                token,
                admin,
                node,
                port,
                json_log: json,
                sandbox: sandbox_flag(sandbox, no_sandbox),
                sandbox_image,
                mounts,
                mounts_ro,
            })?;
            let cancel = CancellationToken::new();
            spawn_signal_listener(cancel.clone());
            node::server::run(cfg, cancel).await?;
            Ok(0)
        }

        Commands::Hook { action, url, session } => match action {
            Some(HookAction::Install) => {
                let bin = std::env::current_exe()
                    .ok()
                    .and_then(|p| p.to_str().map(str::to_string))
                    .unwrap_or_else(|| "crewbridge".to_string());
                let path = hook::install::settings_path();
                let changed = hook::install::install(&path, &hook::install::hook_command(&bin))?;
                if changed {
                    println!("Stop hook installed in {}", path.display());
                } else {
                    println!("Stop hook already installed in {}", path.display());
                }
                Ok(0)
            }
            None => {
                hook::run(url, session).await?;
                Ok(0)
            }
        },

        Commands::Webhook { token, url } => {
            let tg = TelegramClient::new(&require_token(token)?);
            node::server::register_webhook_with_retry(&tg, &url).await?;
            println!("Webhook registered at {url}");
            Ok(0)
        }

        Commands::Tunnel {
            token,
            url,
            port,
            node,
            webhook_path,
            cloudflared,
        } => {
            let cancel = CancellationToken::new();
            spawn_signal_listener(cancel.clone());
            tunnel::run(
                tunnel::TunnelOpts {
                    token: require_token(token)?,
                    url,
                    port,
                    node: node.unwrap_or_else(|| "prod".to_string()),
                    webhook_path,
                    cloudflared,
                },
                cancel,
            )
            .await
        }

        Commands::Status { node, all, token } => {
            let token = token.or_else(|| env_nonempty("TELEGRAM_BOT_TOKEN"));
            let state_root = config::state_root();
            let nodes = if all {
                let found = node::list_nodes(&state_root);
                if found.is_empty() {
                    println!("No nodes found under {}", state_root.display());
                    return Ok(0);
                }
                found
            } else {
                vec![node.unwrap_or_else(|| "prod".to_string())]
            };

            let mut exit = 0;
            for name in nodes {
                let files = node::NodeFiles::new(state_root.join("nodes").join(&name));
                if let Some(bot) = files.read_bot_username() {
                    println!("Bot @{bot}");
                }
                let report = health::check_node(&state_root, &name, token.as_deref()).await;
                print_report(&report);
                exit = exit.max(report.exit_code());
            }
            Ok(exit)
        }

        Commands::Fix { node, token } => {
            let token = require_token(token)?;
            let name = node.unwrap_or_else(|| "prod".to_string());
            let outcome = health::fix_node(&config::state_root(), &name, &token).await?;

            for line in &outcome.repaired {
                println!("fixed: {line}");
            }
            if outcome.repaired.is_empty() {
                println!("Nothing to auto-fix on node {name}.");
            }
            let mut exit = 0;
            for issue in &outcome.remaining {
                match &issue.fix_hint {
                    Some(hint) => println!("cannot fix: {} (try: {hint})", issue.message),
                    None => println!("cannot fix: {}", issue.message),
                }
                exit = exit.max(match issue.severity {
                    health::Severity::Warn => 1,
                    health::Severity::Error => 2,
                });
            }
            Ok(exit)
        }

        Commands::Version => {
            println!("crewbridge {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}

fn sandbox_flag(sandbox: bool, no_sandbox: bool) -> Option<bool> {
    if sandbox {
        Some(true)
    } else if no_sandbox {
        Some(false)
    } else {
        None
    }
}

fn require_token(flag: Option<String>) -> Result<String> {
    flag.or_else(|| env_nonempty("TELEGRAM_BOT_TOKEN")).ok_or_else(|| {
        BridgeError::Config("bot token missing: set --token or TELEGRAM_BOT_TOKEN".into())
    })
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn print_report(report: &health::HealthReport) {
    if report.is_healthy() {
        println!("Node {}: healthy", report.node);
        return;
    }
    println!("Node {}:", report.node);
    for issue in &report.issues {
        let tag = match issue.severity {
            health::Severity::Warn => "WARN ",
            health::Severity::Error => "ERROR",
        };
        match &issue.fix_hint {
            Some(hint) => println!("  {tag} {} (fix: {hint})", issue.message),
            None => println!("  {tag} {}", issue.message),
        }
    }
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                error!("cannot listen for SIGTERM: {e}");
                let _ = ctrl_c.await;
                cancel.cancel();
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
        cancel.cancel();
    });
}

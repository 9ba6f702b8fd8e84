//! Typed configuration for a bridge node.
//!
//! Everything the node needs is resolved up front into one [`Config`] record:
//! bot token, admin chat, node identity and its derived port/prefix/paths,
//! and the sandbox settings. CLI flags win over environment variables, which
//! win over defaults. No global state; the record is passed explicitly into
//! whatever needs it.

use std::path::PathBuf;

use crate::error::{BridgeError, Result};

/// Well-known node names and their fixed ports.
const NODE_PORTS: &[(&str, u16)] = &[("prod", 8080), ("dev", 8081), ("test", 8082)];

/// Fallback port for nodes outside the fixed mapping.
const DEFAULT_PORT: u16 = 8080;

/// Session name prefix brand. Sessions are named `crew-<node>-<worker>`.
const PREFIX_BRAND: &str = "crew";

/// Default container image for sandboxed workers.
pub const DEFAULT_SANDBOX_IMAGE: &str = "claude-sandbox:latest";

/// Root of all persistent bridge state: `~/.claude/telegram`.
pub fn state_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("telegram")
}

/// Validate a node name: non-empty lowercase alphanumeric with hyphens.
pub fn validate_node_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if ok {
        Ok(())
    } else {
        Err(BridgeError::Config(format!(
            "invalid node name {name:?}: use lowercase letters, digits and hyphens"
        )))
    }
}

/// Port assigned to a node name when no explicit override is given.
pub fn node_port(name: &str) -> u16 {
    NODE_PORTS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, p)| *p)
        .unwrap_or(DEFAULT_PORT)
}

/// Session prefix for a node, e.g. `crew-prod-`.
pub fn node_prefix(name: &str) -> String {
    format!("{PREFIX_BRAND}-{name}-")
}

// ── Sandbox ─────────────────────────────────────────────────────────

/// One host→container bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: String,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    /// Parse `host:container` with an optional trailing `:ro`.
    pub fn parse(spec: &str, read_only: bool) -> Result<Self> {
        let mut parts: Vec<&str> = spec.split(':').collect();
        let ro = if parts.last() == Some(&"ro") {
            parts.pop();
            true
        } else {
            read_only
        };
        if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(BridgeError::Config(format!(
                "invalid mount spec {spec:?}: expected host:container"
            )));
        }
        Ok(Self {
            host: parts[0].to_string(),
            container: parts[1].to_string(),
            read_only: ro,
        })
    }
}

/// Container isolation settings for worker sessions.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfig {
    pub enabled: bool,
    pub image: String,
    pub mounts: Vec<Mount>,
}

impl SandboxConfig {
    /// Parse the `SANDBOX_MOUNTS` environment format:
    /// comma-separated `host:container[:ro]` specs.
    pub fn parse_mounts(value: &str) -> Result<Vec<Mount>> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|spec| Mount::parse(spec, false))
            .collect()
    }
}

// ── Config record ───────────────────────────────────────────────────

/// Raw options collected from CLI flags; `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub token: Option<String>,
    pub admin: Option<String>,
    pub node: Option<String>,
    pub port: Option<u16>,
    pub json_log: bool,
    pub sandbox: Option<bool>,
    pub sandbox_image: Option<String>,
    pub mounts: Vec<String>,
    pub mounts_ro: Vec<String>,
}

/// Fully-resolved node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub token: String,
    pub admin_chat_id: i64,
    pub node: String,
    pub port: u16,
    pub prefix: String,
    pub state_root: PathBuf,
    pub node_dir: PathBuf,
    pub sessions_dir: PathBuf,
    pub bridge_url: String,
    pub json_log: bool,
    pub sandbox: SandboxConfig,
}

impl Config {
    /// Resolve the effective configuration from CLI overrides plus the
    /// environment. Fails with a `Config` error when a required secret is
    /// missing or a value does not parse.
    pub fn resolve(overrides: ConfigOverrides) -> Result<Self> {
        Self::resolve_in(overrides, state_root())
    }

    /// Same as [`Config::resolve`] but against an explicit state root.
    pub fn resolve_in(overrides: ConfigOverrides, state_root: PathBuf) -> Result<Self> {
        let token = overrides
            .token
            .or_else(|| env_nonempty("TELEGRAM_BOT_TOKEN"))
            .ok_or_else(|| {
                BridgeError::Config("bot token missing: set --token or TELEGRAM_BOT_TOKEN".into())
            })?;

        let admin_raw = overrides
            .admin
            .or_else(|| env_nonempty("ADMIN_CHAT_ID"))
            .ok_or_else(|| {
                BridgeError::Config("admin chat missing: set --admin or ADMIN_CHAT_ID".into())
            })?;
        let admin_chat_id: i64 = admin_raw.trim().parse().map_err(|_| {
            BridgeError::Config(format!("admin chat id {admin_raw:?} is not a number"))
        })?;

        let node = overrides
            .node
            .or_else(|| env_nonempty("NODE_NAME"))
            .unwrap_or_else(|| "prod".to_string());
        validate_node_name(&node)?;

        let port = match overrides.port {
            Some(p) => p,
            None => match env_nonempty("PORT") {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map_err(|_| BridgeError::Config(format!("PORT {raw:?} is not a number")))?,
                None => node_port(&node),
            },
        };

        let sandbox_enabled = match overrides.sandbox {
            Some(v) => v,
            None => env_nonempty("SANDBOX_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
                .unwrap_or(false),
        };
        let sandbox_image = overrides
            .sandbox_image
            .or_else(|| env_nonempty("SANDBOX_IMAGE"))
            .unwrap_or_else(|| DEFAULT_SANDBOX_IMAGE.to_string());

        let mut mounts = Vec::new();
        for spec in &overrides.mounts {
            mounts.push(Mount::parse(spec, false)?);
        }
        for spec in &overrides.mounts_ro {
            mounts.push(Mount::parse(spec, true)?);
        }
        if let Some(env_mounts) = env_nonempty("SANDBOX_MOUNTS") {
            mounts.extend(SandboxConfig::parse_mounts(&env_mounts)?);
        }

        let node_dir = state_root.join("nodes").join(&node);
        let sessions_dir = node_dir.join("sessions");

        Ok(Self {
            token,
            admin_chat_id,
            prefix: node_prefix(&node),
            bridge_url: format!("http://localhost:{port}"),
            node,
            port,
            state_root,
            node_dir,
            sessions_dir,
            json_log: overrides.json_log,
            sandbox: SandboxConfig {
                enabled: sandbox_enabled,
                image: sandbox_image,
                mounts,
            },
        })
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

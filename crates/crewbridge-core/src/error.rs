//! Error type shared across the bridge.
//!
//! Every fallible operation in the core returns [`BridgeError`]. The variants
//! map one-to-one onto the failure classes the CLI turns into exit codes:
//! configuration problems, missing external binaries, conflicts (port taken,
//! duplicate worker), lookups that came up empty, upstream API failures,
//! security rejections on media paths, and plain IO.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Missing or invalid configuration (bad node name, missing token).
    #[error("config error: {0}")]
    Config(String),

    /// An external binary the bridge depends on is not available.
    #[error("missing dependency: {0}")]
    Dependency(String),

    /// The requested state already exists or is held by someone else.
    #[error("{0}")]
    Conflict(String),

    /// A worker, file, or chat that was asked for does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The Telegram API or the tunnel answered with an error.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// A media path failed sandbox validation.
    #[error("blocked: {0}")]
    Security(String),

    /// Unexpected IO failure, with the path it happened on.
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Anything else that should not happen.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Attach path context to an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this error, per the CLI contract:
    /// 3 config, 4 missing dependency, 2 for everything else critical.
    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::Config(_) => 3,
            BridgeError::Dependency(_) => 4,
            _ => 2,
        }
    }
}

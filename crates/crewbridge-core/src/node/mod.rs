//! Node identity and its on-disk footprint.
//!
//! A node owns one port, one state directory and one session prefix. The
//! directory holds small marker files (`pid`, `bridge.pid`, `port`,
//! `tunnel.pid`, `tunnel_url`, `bot_id`, `bot_username`) that the status
//! and fix commands read back later. Exclusive ownership is a PID file: a
//! second process refuses to start while the recorded PID is still alive.

pub mod server;

use std::fs;
use std::path::{Path, PathBuf};

use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::error::{BridgeError, Result};
use crate::store::{ensure_dir, write_private};

/// Marker files inside one node directory.
#[derive(Debug, Clone)]
pub struct NodeFiles {
    node_dir: PathBuf,
}

impl NodeFiles {
    pub fn new(node_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_dir: node_dir.into(),
        }
    }

    pub fn node_dir(&self) -> &Path {
        &self.node_dir
    }

    pub fn pid_path(&self) -> PathBuf {
        self.node_dir.join("pid")
    }

    pub fn bridge_pid_path(&self) -> PathBuf {
        self.node_dir.join("bridge.pid")
    }

    pub fn tunnel_pid_path(&self) -> PathBuf {
        self.node_dir.join("tunnel.pid")
    }

    pub fn port_path(&self) -> PathBuf {
        self.node_dir.join("port")
    }

    pub fn tunnel_url_path(&self) -> PathBuf {
        self.node_dir.join("tunnel_url")
    }

    /// Claim this node. Fails with `Conflict` while a previous owner's PID
    /// is still alive; a stale PID file is simply replaced.
    pub fn acquire_pid(&self) -> Result<()> {
        ensure_dir(&self.node_dir)?;
        if let Some(pid) = read_pid(&self.pid_path()) {
            if pid_alive(pid) {
                return Err(BridgeError::Conflict(format!(
                    "node already running (pid {pid}); stop it or pick another --node"
                )));
            }
        }
        write_private(
            &self.pid_path(),
            std::process::id().to_string().as_bytes(),
        )
    }

    pub fn write_port(&self, port: u16) -> Result<()> {
        write_private(&self.port_path(), port.to_string().as_bytes())
    }

    pub fn write_bridge_pid(&self) -> Result<()> {
        write_private(
            &self.bridge_pid_path(),
            std::process::id().to_string().as_bytes(),
        )
    }

    pub fn write_tunnel_pid(&self, pid: u32) -> Result<()> {
        ensure_dir(&self.node_dir)?;
        write_private(&self.tunnel_pid_path(), pid.to_string().as_bytes())
    }

    pub fn write_tunnel_url(&self, url: &str) -> Result<()> {
        ensure_dir(&self.node_dir)?;
        write_private(&self.tunnel_url_path(), url.as_bytes())
    }

    pub fn save_bot_identity(&self, id: i64, username: Option<&str>) -> Result<()> {
        write_private(&self.node_dir.join("bot_id"), id.to_string().as_bytes())?;
        if let Some(name) = username {
            write_private(&self.node_dir.join("bot_username"), name.as_bytes())?;
        }
        Ok(())
    }

    pub fn read_port(&self) -> Option<u16> {
        read_trimmed(&self.port_path())?.parse().ok()
    }

    pub fn read_tunnel_url(&self) -> Option<String> {
        read_trimmed(&self.tunnel_url_path())
    }

    pub fn read_tunnel_pid(&self) -> Option<i32> {
        read_trimmed(&self.tunnel_pid_path())?.parse().ok()
    }

    pub fn read_bot_username(&self) -> Option<String> {
        read_trimmed(&self.node_dir.join("bot_username"))
    }

    /// Remove the runtime marker files. Sessions and inboxes stay: tmux is
    /// the persistence layer and survives the bridge on purpose.
    pub fn cleanup(&self) {
        for path in [
            self.pid_path(),
            self.bridge_pid_path(),
            self.tunnel_pid_path(),
            self.port_path(),
            self.tunnel_url_path(),
        ] {
            let _ = fs::remove_file(path);
        }
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    read_trimmed(path)?.parse().ok()
}

/// Signal-0 probe: does this PID still name a live process?
pub fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Names of all nodes that have a directory under the state root.
pub fn list_nodes(state_root: &Path) -> Vec<String> {
    let mut nodes = Vec::new();
    if let Ok(entries) = fs::read_dir(state_root.join("nodes")) {
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    nodes.push(name.to_string());
                }
            }
        }
    }
    nodes.sort();
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_pid_then_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let files = NodeFiles::new(tmp.path().join("nodes/prod"));
        files.acquire_pid().unwrap();

        // Our own PID is alive, so a second claim must fail.
        let again = files.acquire_pid();
        assert!(matches!(again, Err(BridgeError::Conflict(_))));
    }

    #[test]
    fn test_stale_pid_is_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let files = NodeFiles::new(tmp.path().join("nodes/prod"));
        ensure_dir(files.node_dir()).unwrap();
        // PID 1 is init and alive but never us; use an absurd dead PID.
        fs::write(files.pid_path(), "999999999").unwrap();
        files.acquire_pid().unwrap();
        assert_eq!(
            read_pid(&files.pid_path()),
            Some(std::process::id() as i32)
        );
    }

    #[test]
    fn test_cleanup_removes_markers_only() {
        let tmp = tempfile::tempdir().unwrap();
        let files = NodeFiles::new(tmp.path());
        files.acquire_pid().unwrap();
        files.write_port(8080).unwrap();
        files.write_tunnel_url("https://x.example").unwrap();
        let sessions = tmp.path().join("sessions/alice");
        fs::create_dir_all(&sessions).unwrap();

        files.cleanup();
        assert!(!files.pid_path().exists());
        assert!(!files.port_path().exists());
        assert!(!files.tunnel_url_path().exists());
        assert!(sessions.exists());
    }

    #[test]
    fn test_round_trip_markers() {
        let tmp = tempfile::tempdir().unwrap();
        let files = NodeFiles::new(tmp.path());
        files.write_tunnel_pid(4242).unwrap();
        files.write_port(8081).unwrap();
        files.write_tunnel_url("https://t.example\n").unwrap();
        assert_eq!(files.read_tunnel_pid(), Some(4242));
        assert_eq!(files.read_port(), Some(8081));
        assert_eq!(files.read_tunnel_url(), Some("https://t.example".into()));
    }

    #[test]
    fn test_list_nodes_sorted() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("nodes/prod")).unwrap();
        fs::create_dir_all(tmp.path().join("nodes/dev")).unwrap();
        assert_eq!(list_nodes(tmp.path()), vec!["dev", "prod"]);
        assert!(list_nodes(&tmp.path().join("empty")).is_empty());
    }
}

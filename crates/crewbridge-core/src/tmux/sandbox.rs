//! Launch command construction for worker sessions.
//!
//! A worker either runs Claude directly, or inside a container when the
//! sandbox is enabled. The container always gets the user's home directory
//! bound to `/workspace`, plus whatever extra mounts are configured.

use std::path::Path;

use crate::config::SandboxConfig;

/// The assistant process, launched with its permissions prompt disabled:
/// there is no human at this terminal to answer it.
pub const CLAUDE_LAUNCH: &str = "claude --dangerously-skip-permissions";

/// The process name to look for when probing worker liveness.
pub const CLAUDE_PROCESS: &str = "claude";

/// Shell command that starts the assistant for one worker session.
pub fn launch_command(sandbox: &SandboxConfig, home: &Path) -> String {
    if !sandbox.enabled {
        return CLAUDE_LAUNCH.to_string();
    }

    let mut cmd = String::from("docker run --rm -it");
    cmd.push_str(&format!(
        " -v {}:/workspace",
        quote(&home.to_string_lossy())
    ));
    for mount in &sandbox.mounts {
        let ro = if mount.read_only { ":ro" } else { "" };
        cmd.push_str(&format!(
            " -v {}:{}{ro}",
            quote(&mount.host),
            quote(&mount.container)
        ));
    }
    cmd.push_str(" -w /workspace ");
    cmd.push_str(&sandbox.image);
    cmd.push(' ');
    cmd.push_str(CLAUDE_LAUNCH);
    cmd
}

/// Single-quote a path when it contains characters the shell would eat.
fn quote(s: &str) -> String {
    if s.chars().all(|c| c.is_ascii_alphanumeric() || "/_-.:".contains(c)) {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mount;
    use std::path::PathBuf;

    #[test]
    fn test_direct_launch_when_sandbox_disabled() {
        let sandbox = SandboxConfig::default();
        assert_eq!(
            launch_command(&sandbox, &PathBuf::from("/home/me")),
            "claude --dangerously-skip-permissions"
        );
    }

    #[test]
    fn test_container_launch_with_mounts() {
        let sandbox = SandboxConfig {
            enabled: true,
            image: "claude-sandbox:latest".into(),
            mounts: vec![
                Mount {
                    host: "/srv/data".into(),
                    container: "/data".into(),
                    read_only: true,
                },
                Mount {
                    host: "/home/me/src".into(),
                    container: "/src".into(),
                    read_only: false,
                },
            ],
        };
        let cmd = launch_command(&sandbox, &PathBuf::from("/home/me"));
        assert_eq!(
            cmd,
            "docker run --rm -it -v /home/me:/workspace \
             -v /srv/data:/data:ro -v /home/me/src:/src \
             -w /workspace claude-sandbox:latest claude --dangerously-skip-permissions"
        );
    }

    #[test]
    fn test_quote_spaces() {
        assert_eq!(quote("/home/my user"), "'/home/my user'");
        assert_eq!(quote("/plain/path"), "/plain/path");
    }
}

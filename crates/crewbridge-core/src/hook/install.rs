//! Idempotent Stop-hook installation into Claude's settings file.
//!
//! The settings JSON is user-owned and may already carry other hooks, so
//! the patch is an explicit walk that distinguishes "missing", "right
//! shape" and "wrong shape" at every level. Wrong shapes are errors,
//! never overwritten. The patch adds one
//! `{type: "command", command: "<bin> hook"}` entry under
//! `hooks.Stop[0].hooks`, exactly once, leaving sibling entries alone.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};

use crate::error::{BridgeError, Result};

/// Claude's settings file: `~/.claude/settings.json`.
pub fn settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("settings.json")
}

/// The hook command line for a given bridge binary.
pub fn hook_command(bin: &str) -> String {
    format!("{bin} hook")
}

/// Patch the settings file. Returns `true` when the file was modified,
/// `false` when the hook was already present.
pub fn install(path: &Path, command: &str) -> Result<bool> {
    let mut root = match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str::<Value>(&content).map_err(|e| {
            BridgeError::Config(format!("{}: not valid JSON: {e}", path.display()))
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => json!({}),
        Err(e) => return Err(BridgeError::io(path.to_path_buf(), e)),
    };

    let changed = patch(&mut root, command, path)?;
    if changed {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BridgeError::io(parent.to_path_buf(), e))?;
        }
        let mut pretty = serde_json::to_string_pretty(&root)
            .map_err(|e| BridgeError::Internal(format!("serialize settings: {e}")))?;
        pretty.push('\n');
        fs::write(path, pretty).map_err(|e| BridgeError::io(path.to_path_buf(), e))?;
    }
    Ok(changed)
}

fn patch(root: &mut Value, command: &str, path: &Path) -> Result<bool> {
    let Value::Object(map) = root else {
        return Err(BridgeError::Config(format!(
            "{}: top level is not an object",
            path.display()
        )));
    };

    let hooks = map.entry("hooks").or_insert_with(|| json!({}));
    let Value::Object(hooks) = hooks else {
        return Err(BridgeError::Config(format!(
            "{}: \"hooks\" is not an object",
            path.display()
        )));
    };

    let stop = hooks.entry("Stop").or_insert_with(|| json!([]));
    let Value::Array(stop) = stop else {
        return Err(BridgeError::Config(format!(
            "{}: \"hooks.Stop\" is not a list",
            path.display()
        )));
    };
    if stop.is_empty() {
        stop.push(json!({ "hooks": [] }));
    }

    let Value::Object(first) = &mut stop[0] else {
        return Err(BridgeError::Config(format!(
            "{}: \"hooks.Stop[0]\" is not an object",
            path.display()
        )));
    };

    let entries = first.entry("hooks").or_insert_with(|| json!([]));
    let Value::Array(entries) = entries else {
        return Err(BridgeError::Config(format!(
            "{}: \"hooks.Stop[0].hooks\" is not a list",
            path.display()
        )));
    };

    let present = entries
        .iter()
        .any(|e| e.get("command").and_then(Value::as_str) == Some(command));
    if present {
        return Ok(false);
    }
    entries.push(json!({ "type": "command", "command": command }));
    Ok(true)
}

/// Does the settings file already carry a bridge hook entry?
///
/// Used by the health check, which may not know where the binary lives;
/// any Stop command mentioning `hook` counts.
pub fn installed(path: &Path) -> bool {
    let Ok(content) = fs::read_to_string(path) else {
        return false;
    };
    let Ok(root) = serde_json::from_str::<Value>(&content) else {
        return false;
    };
    let Some(stop) = root.get("hooks").and_then(|h| h.get("Stop")).and_then(Value::as_array)
    else {
        return false;
    };
    stop.iter().any(|entry| {
        entry
            .get("hooks")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter().any(|e| {
                    e.get("command")
                        .and_then(Value::as_str)
                        .is_some_and(|c| c.contains("hook"))
                })
            })
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_settings(content: Option<&str>) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        if let Some(c) = content {
            fs::write(&path, c).unwrap();
        }
        (dir, path)
    }

    #[test]
    fn test_install_into_missing_file() {
        let (_dir, path) = tmp_settings(None);
        assert!(install(&path, "crewbridge hook").unwrap());

        let root: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            root["hooks"]["Stop"][0]["hooks"][0]["command"],
            "crewbridge hook"
        );
        assert_eq!(root["hooks"]["Stop"][0]["hooks"][0]["type"], "command");
    }

    #[test]
    fn test_install_is_idempotent() {
        let (_dir, path) = tmp_settings(None);
        assert!(install(&path, "crewbridge hook").unwrap());
        assert!(!install(&path, "crewbridge hook").unwrap());

        let root: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(root["hooks"]["Stop"][0]["hooks"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_install_preserves_sibling_hooks() {
        let existing = r#"{
            "model": "opus",
            "hooks": {
                "Stop": [{"hooks": [{"type": "command", "command": "other-tool notify"}]}],
                "PreToolUse": [{"hooks": []}]
            }
        }"#;
        let (_dir, path) = tmp_settings(Some(existing));
        assert!(install(&path, "crewbridge hook").unwrap());

        let root: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let entries = root["hooks"]["Stop"][0]["hooks"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["command"], "other-tool notify");
        assert_eq!(entries[1]["command"], "crewbridge hook");
        assert_eq!(root["model"], "opus");
        assert!(root["hooks"]["PreToolUse"].is_array());
    }

    #[test]
    fn test_install_rejects_wrong_shapes() {
        for bad in [
            r#"[1, 2]"#,
            r#"{"hooks": "nope"}"#,
            r#"{"hooks": {"Stop": {}}}"#,
            r#"{"hooks": {"Stop": [{"hooks": 42}]}}"#,
        ] {
            let (_dir, path) = tmp_settings(Some(bad));
            let err = install(&path, "crewbridge hook").unwrap_err();
            assert!(matches!(err, BridgeError::Config(_)), "accepted: {bad}");
            // the file is untouched on error
            assert_eq!(fs::read_to_string(&path).unwrap(), bad);
        }
    }

    #[test]
    fn test_install_rejects_invalid_json() {
        let (_dir, path) = tmp_settings(Some("{not json"));
        assert!(matches!(
            install(&path, "crewbridge hook"),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_installed_detection() {
        let (_dir, path) = tmp_settings(None);
        assert!(!installed(&path));
        install(&path, "crewbridge hook").unwrap();
        assert!(installed(&path));
    }
}

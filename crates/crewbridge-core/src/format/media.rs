//! Media tags in assistant output, and the path sandbox around them.
//!
//! The assistant asks for an attachment by embedding
//! `[[image:<path>|<caption>]]` or `[[file:<path>|<caption>]]` in its output.
//! Tags are stripped from the text and returned in source order; each path
//! must then pass [`PathValidator`] before anything leaves the machine.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{BridgeError, Result};

static MEDIA_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[(image|file):([^|\]]+)(?:\|([^\]]*))?\]\]").unwrap());

/// Basenames and suffixes that never leave the machine.
const SENSITIVE_SUFFIXES: &[&str] = &[".pem", ".key", ".crt"];
const SENSITIVE_NAMES: &[&str] = &["id_rsa", "id_ed25519", ".env"];

/// Size ceiling for photos (Telegram rejects larger uploads anyway).
pub const MAX_IMAGE_BYTES: u64 = 50 * 1024 * 1024;
/// Size ceiling for documents.
pub const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// What kind of attachment a tag asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    File,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::File => "file",
        }
    }

    fn max_bytes(self) -> u64 {
        match self {
            MediaKind::Image => MAX_IMAGE_BYTES,
            MediaKind::File => MAX_FILE_BYTES,
        }
    }
}

/// One parsed `[[kind:path|caption]]` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTag {
    pub kind: MediaKind,
    pub path: String,
    pub caption: Option<String>,
}

impl MediaTag {
    /// Serialize back to tag syntax.
    pub fn to_tag(&self) -> String {
        match &self.caption {
            Some(c) => format!("[[{}:{}|{}]]", self.kind.as_str(), self.path, c),
            None => format!("[[{}:{}]]", self.kind.as_str(), self.path),
        }
    }
}

/// Strip all media tags from `text`. Returns the cleaned text and the tags
/// in source order.
pub fn extract_media_tags(text: &str) -> (String, Vec<MediaTag>) {
    let mut tags = Vec::new();
    let cleaned = MEDIA_TAG_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let kind = match &caps[1] {
                "image" => MediaKind::Image,
                _ => MediaKind::File,
            };
            tags.push(MediaTag {
                kind,
                path: caps[2].to_string(),
                caption: caps.get(3).map(|m| m.as_str().to_string()),
            });
            ""
        })
        .into_owned();
    (cleaned, tags)
}

// ── Path sandbox ────────────────────────────────────────────────────

/// Closed allow-list of directories attachments may come from.
#[derive(Debug, Clone)]
pub struct PathValidator {
    roots: Vec<PathBuf>,
}

impl PathValidator {
    /// The standard allow-list: the node's sessions directory, `/tmp`, and
    /// the user's home directory.
    pub fn new(sessions_dir: &Path) -> Self {
        let mut roots = vec![sessions_dir.to_path_buf(), PathBuf::from("/tmp")];
        if let Some(home) = dirs::home_dir() {
            roots.push(home);
        }
        Self::with_roots(roots)
    }

    /// An explicit allow-list (tests, or non-default layouts).
    pub fn with_roots(roots: Vec<PathBuf>) -> Self {
        let roots = roots
            .into_iter()
            .map(|r| r.canonicalize().unwrap_or(r))
            .collect();
        Self { roots }
    }

    /// Check one tag's path. Returns the canonical path on success; every
    /// rejection is a `Security` error so callers can drop the attachment
    /// and keep going.
    pub fn validate(&self, tag: &MediaTag) -> Result<PathBuf> {
        let raw = Path::new(tag.path.trim());
        let path = raw.canonicalize().map_err(|_| {
            BridgeError::Security(format!("{}: no such file", raw.display()))
        })?;

        if !self.roots.iter().any(|root| path.starts_with(root)) {
            return Err(BridgeError::Security(format!(
                "{}: outside allowed directories",
                path.display()
            )));
        }

        if is_sensitive(&path) {
            return Err(BridgeError::Security(format!(
                "{}: sensitive file",
                path.display()
            )));
        }

        let meta = path
            .metadata()
            .map_err(|_| BridgeError::Security(format!("{}: unreadable", path.display())))?;
        if !meta.is_file() {
            return Err(BridgeError::Security(format!(
                "{}: not a regular file",
                path.display()
            )));
        }
        if meta.len() > tag.kind.max_bytes() {
            return Err(BridgeError::Security(format!(
                "{}: {} bytes exceeds the {} limit",
                path.display(),
                meta.len(),
                tag.kind.as_str()
            )));
        }

        Ok(path)
    }
}

/// Key material, env files, and anything under a `.ssh` directory.
fn is_sensitive(path: &Path) -> bool {
    if path
        .components()
        .any(|c| c.as_os_str().to_str() == Some(".ssh"))
    {
        return true;
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return true;
    };
    SENSITIVE_NAMES.contains(&name) || SENSITIVE_SUFFIXES.iter().any(|s| name.ends_with(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_extract_single_tag_with_caption() {
        let (cleaned, tags) =
            extract_media_tags("Here is the chart [[image:/tmp/ok.png|Chart]] done");
        assert_eq!(cleaned, "Here is the chart  done");
        assert_eq!(
            tags,
            vec![MediaTag {
                kind: MediaKind::Image,
                path: "/tmp/ok.png".into(),
                caption: Some("Chart".into()),
            }]
        );
    }

    #[test]
    fn test_extract_tag_without_caption() {
        let (cleaned, tags) = extract_media_tags("see [[file:/etc/shadow]]");
        assert_eq!(cleaned, "see ");
        assert_eq!(tags[0].kind, MediaKind::File);
        assert_eq!(tags[0].caption, None);
    }

    #[test]
    fn test_extract_preserves_source_order() {
        let (_, tags) = extract_media_tags("[[file:/a]] x [[image:/b|c]] y [[file:/d|]]");
        assert_eq!(tags.len(), 3);
        assert_eq!(tags[0].path, "/a");
        assert_eq!(tags[1].path, "/b");
        assert_eq!(tags[2].caption, Some(String::new()));
    }

    #[test]
    fn test_tag_roundtrip() {
        for input in ["[[image:/tmp/a.png|Chart]]", "[[file:/tmp/b.txt]]", "[[file:/x|]]"] {
            let (_, tags) = extract_media_tags(input);
            assert_eq!(tags[0].to_tag(), input);
        }
    }

    #[test]
    fn test_no_tags_text_untouched() {
        let (cleaned, tags) = extract_media_tags("plain [not:a|tag] text");
        assert_eq!(cleaned, "plain [not:a|tag] text");
        assert!(tags.is_empty());
    }

    fn tag(kind: MediaKind, path: &Path) -> MediaTag {
        MediaTag {
            kind,
            path: path.to_str().unwrap().to_string(),
            caption: None,
        }
    }

    #[test]
    fn test_validate_accepts_file_in_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("ok.png");
        fs::write(&file, b"data").unwrap();
        let v = PathValidator::with_roots(vec![dir.path().to_path_buf()]);
        assert!(v.validate(&tag(MediaKind::Image, &file)).is_ok());
    }

    #[test]
    fn test_validate_rejects_outside_roots() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let file = outside.path().join("leak.txt");
        fs::write(&file, b"data").unwrap();
        let v = PathValidator::with_roots(vec![dir.path().to_path_buf()]);
        let err = v.validate(&tag(MediaKind::File, &file)).unwrap_err();
        assert!(matches!(err, BridgeError::Security(_)));
    }

    #[test]
    fn test_validate_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let v = PathValidator::with_roots(vec![dir.path().to_path_buf()]);
        let err = v
            .validate(&tag(MediaKind::File, &dir.path().join("nope")))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Security(_)));
    }

    #[test]
    fn test_validate_rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.txt");
        fs::write(&secret, b"data").unwrap();
        let link = dir.path().join("innocent.txt");
        std::os::unix::fs::symlink(&secret, &link).unwrap();
        let v = PathValidator::with_roots(vec![dir.path().to_path_buf()]);
        assert!(v.validate(&tag(MediaKind::File, &link)).is_err());
    }

    #[test]
    fn test_validate_rejects_sensitive_names() {
        let dir = tempfile::tempdir().unwrap();
        let v = PathValidator::with_roots(vec![dir.path().to_path_buf()]);
        for name in ["server.pem", "host.key", "ca.crt", "id_rsa", "id_ed25519", ".env"] {
            let file = dir.path().join(name);
            fs::write(&file, b"data").unwrap();
            let err = v.validate(&tag(MediaKind::File, &file)).unwrap_err();
            assert!(matches!(err, BridgeError::Security(_)), "{name} passed");
        }
    }

    #[test]
    fn test_validate_rejects_ssh_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = dir.path().join(".ssh");
        fs::create_dir(&ssh).unwrap();
        let file = ssh.join("known_hosts");
        fs::write(&file, b"data").unwrap();
        let v = PathValidator::with_roots(vec![dir.path().to_path_buf()]);
        assert!(v.validate(&tag(MediaKind::File, &file)).is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_image() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("big.png");
        let f = fs::File::create(&file).unwrap();
        f.set_len(MAX_IMAGE_BYTES + 1).unwrap();
        let v = PathValidator::with_roots(vec![dir.path().to_path_buf()]);
        assert!(v.validate(&tag(MediaKind::Image, &file)).is_err());
        // the same size is fine as a document
        assert!(v.validate(&tag(MediaKind::File, &file)).is_ok());
    }

    #[test]
    fn test_validate_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        let v = PathValidator::with_roots(vec![dir.path().to_path_buf()]);
        assert!(v.validate(&tag(MediaKind::File, &sub)).is_err());
    }
}

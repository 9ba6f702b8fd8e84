//! Length-limited message splitting.
//!
//! Telegram caps a message at 4096 characters. Long output is split on the
//! friendliest boundary available (paragraph break, then line break, then
//! word break, then a hard cut) and never cuts through a `<...>` tag.
//! When a `<pre>`/`<code>` block has to straddle two chunks, the block is
//! closed at the end of one chunk and reopened at the start of the next.

use std::sync::LazyLock;

use regex::Regex;

/// Telegram's hard message length limit, in characters.
pub const MAX_MESSAGE_LEN: usize = 4096;

static BLOCK_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?(pre|code)>").unwrap());

/// Split `text` into chunks of at most `max_len` characters.
///
/// Without straddling code blocks the chunks are exact slices of the input,
/// so their concatenation reproduces it; carried close/reopen tags are the
/// only insertions ever made.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    debug_assert!(max_len > 0);
    let mut chunks = Vec::new();
    let mut rest = text.to_string();

    loop {
        if rest.chars().count() <= max_len {
            chunks.push(rest);
            break;
        }

        let mut cut = pick_cut(&rest, byte_limit(&rest, max_len));

        // A straddling pre/code block costs us the close tags in this chunk
        // and the reopen tags in the next; shrink the window to make room.
        let closers = open_block_closers(&rest[..cut]);
        if !closers.is_empty() {
            let budget = max_len.saturating_sub(closers.chars().count()).max(1);
            let limit = byte_limit(&rest, budget);
            if cut > limit {
                cut = pick_cut(&rest, limit);
            }
        }

        let closers = open_block_closers(&rest[..cut]);
        if closers.is_empty() {
            chunks.push(rest[..cut].to_string());
            rest = rest[cut..].to_string();
        } else {
            let reopeners = reopeners_for(&closers);
            chunks.push(format!("{}{closers}", &rest[..cut]));
            rest = format!("{reopeners}{}", &rest[cut..]);
        }
    }

    chunks
}

/// Byte index of the first character past `max_chars` (or the end).
fn byte_limit(s: &str, max_chars: usize) -> usize {
    s.char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}

/// Choose a cut point at or before `limit`, preferring paragraph, line,
/// then word boundaries, and refusing to land inside a `<...>` tag.
fn pick_cut(s: &str, limit: usize) -> usize {
    let window = &s[..limit];
    let mut cut = if let Some(i) = window.rfind("\n\n") {
        i + 2
    } else if let Some(i) = window.rfind('\n') {
        i + 1
    } else if let Some(i) = window.rfind(' ') {
        i + 1
    } else {
        limit
    };
    if cut == 0 {
        cut = limit;
    }

    // Back out of an unclosed tag.
    if let Some(lt) = s[..cut].rfind('<') {
        if !s[lt..cut].contains('>') && lt > 0 {
            cut = lt;
        }
    }
    cut
}

/// Tags needed to close the `<pre>`/`<code>` blocks still open at the end
/// of `prefix`, innermost first. Empty when nothing is open.
fn open_block_closers(prefix: &str) -> String {
    let mut pre_open = false;
    let mut code_open = false;
    for m in BLOCK_TAG_RE.find_iter(prefix) {
        match m.as_str() {
            "<pre>" => pre_open = true,
            "</pre>" => pre_open = false,
            "<code>" => code_open = true,
            "</code>" => code_open = false,
            _ => {}
        }
    }
    let mut closers = String::new();
    if code_open {
        closers.push_str("</code>");
    }
    if pre_open {
        closers.push_str("</pre>");
    }
    closers
}

/// The reopening tags matching a closer sequence, outermost first.
fn reopeners_for(closers: &str) -> String {
    let mut out = String::new();
    if closers.contains("</pre>") {
        out.push_str("<pre>");
    }
    if closers.contains("</code>") {
        out.push_str("<code>");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_message_passes_through() {
        assert_eq!(split_message("hello", 4096), vec!["hello"]);
        assert_eq!(split_message("", 4096), vec![""]);
    }

    #[test]
    fn test_chunks_respect_limit_and_concatenate() {
        let text = "word ".repeat(2000);
        let chunks = split_message(&text, 100);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 100);
        }
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_prefers_paragraph_break() {
        let text = format!("{}\n\n{}", "a".repeat(80), "b".repeat(80));
        let chunks = split_message(&text, 100);
        assert_eq!(chunks[0], format!("{}\n\n", "a".repeat(80)));
        assert_eq!(chunks[1], "b".repeat(80));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_falls_back_to_line_break() {
        let text = format!("{}\n{}", "a".repeat(80), "b".repeat(80));
        let chunks = split_message(&text, 100);
        assert_eq!(chunks[0], format!("{}\n", "a".repeat(80)));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_hard_cut_without_boundaries() {
        let text = "x".repeat(250);
        let chunks = split_message(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_never_cuts_inside_a_tag() {
        let text = format!("{} <a href=\"https://example.com\">link</a> tail", "x".repeat(80));
        let chunks = split_message(&text, 100);
        for chunk in &chunks {
            let opens = chunk.matches('<').count();
            let closes = chunk.matches('>').count();
            assert_eq!(opens, closes, "tag split across chunks: {chunk:?}");
        }
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_code_block_close_then_reopen() {
        let body = "line one two three ".repeat(20);
        let text = format!("<pre><code>{body}</code></pre>");
        let chunks = split_message(&text, 120);
        assert!(chunks.len() > 1);
        for (i, chunk) in chunks.iter().enumerate() {
            assert!(chunk.chars().count() <= 120);
            if i > 0 {
                assert!(chunk.starts_with("<pre><code>"), "chunk {i} not reopened");
            }
            if i < chunks.len() - 1 {
                assert!(chunk.ends_with("</code></pre>"), "chunk {i} not closed");
            }
        }
        // Stripping the carried tags reproduces the original body.
        let joined: String = chunks.join("");
        let stripped = joined
            .replace("</code></pre><pre><code>", "");
        assert_eq!(stripped, text);
    }

    #[test]
    fn test_multibyte_safe() {
        let text = "é".repeat(300);
        let chunks = split_message(&text, 100);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 100);
        }
        assert_eq!(chunks.concat(), text);
    }
}

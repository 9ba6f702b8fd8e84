//! Markdown to Telegram-HTML conversion.
//!
//! Telegram's HTML dialect allows only a handful of tags (`b`, `i`, `u`,
//! `s`, `code`, `pre`, `a`, `blockquote`) and rejects the whole message on
//! anything else, so the conversion is deliberately conservative:
//!
//! 1. pull code blocks and inline code out and replace them with placeholders
//! 2. HTML-escape the remaining text
//! 3. convert bold / italic / strikethrough / links
//! 4. reinsert the code segments, escaped verbatim, in `<code>` / `<pre>`
//! 5. collapse runs of blank lines
//!
//! Each pass is safe against the output of the previous one; the result
//! never contains a raw `<` or `>` outside a generated tag.

use std::sync::LazyLock;

use regex::Regex;

static FENCED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[^\n`]*\n?(.*?)```").unwrap());
static INLINE_CODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`\n]+)`").unwrap());
static BOLD_STARS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*([^\n]+?)\*\*").unwrap());
static BOLD_UNDERSCORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__([^\n]+?)__").unwrap());
static STRIKE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"~~([^\n]+?)~~").unwrap());
static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]\n]+)\]\(([^)\s]+)\)").unwrap());
static ITALIC_STAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*\n]+)\*").unwrap());
// Underscore italics only at word edges, so snake_case identifiers survive.
static ITALIC_UNDERSCORE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|[\s(])_([^_\n]+)_($|[\s).,!?:;])").unwrap());
static BLANK_RUNS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Escape the three characters Telegram-HTML reserves.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Convert assistant markdown into Telegram-HTML.
pub fn markdown_to_html(input: &str) -> String {
    // Pass 1: extract code so later passes cannot touch it.
    let mut fenced: Vec<String> = Vec::new();
    let text = FENCED_RE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            fenced.push(caps[1].to_string());
            format!("\u{f000}{}\u{f001}", fenced.len() - 1)
        })
        .into_owned();

    let mut inline: Vec<String> = Vec::new();
    let text = INLINE_CODE_RE
        .replace_all(&text, |caps: &regex::Captures<'_>| {
            inline.push(caps[1].to_string());
            format!("\u{f002}{}\u{f003}", inline.len() - 1)
        })
        .into_owned();

    // Pass 2: escape everything outside code.
    let text = escape_html(&text);

    // Pass 3: markdown emphasis and links. Bold before italic so `**` is
    // not consumed as two single stars.
    let text = BOLD_STARS_RE.replace_all(&text, "<b>$1</b>");
    let text = BOLD_UNDERSCORE_RE.replace_all(&text, "<b>$1</b>");
    let text = STRIKE_RE.replace_all(&text, "<s>$1</s>");
    let text = LINK_RE.replace_all(&text, |caps: &regex::Captures<'_>| {
        let href = caps[2].replace('"', "%22");
        format!("<a href=\"{href}\">{}</a>", &caps[1])
    });
    let text = ITALIC_STAR_RE.replace_all(&text, "<i>$1</i>");
    let text = ITALIC_UNDERSCORE_RE
        .replace_all(&text, "$1<i>$2</i>$3")
        .into_owned();

    // Pass 4: reinsert code, escaped verbatim.
    let mut out = text;
    for (i, code) in inline.iter().enumerate() {
        out = out.replace(
            &format!("\u{f002}{i}\u{f003}"),
            &format!("<code>{}</code>", escape_html(code)),
        );
    }
    for (i, code) in fenced.iter().enumerate() {
        let body = code.strip_suffix('\n').unwrap_or(code);
        out = out.replace(
            &format!("\u{f000}{i}\u{f001}"),
            &format!("<pre><code>{}</code></pre>", escape_html(body)),
        );
    }

    // Pass 5: at most one blank line in a row.
    BLANK_RUNS_RE.replace_all(&out, "\n\n").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_escaped() {
        assert_eq!(markdown_to_html("a < b & c > d"), "a &lt; b &amp; c &gt; d");
    }

    #[test]
    fn test_bold_italic_strike() {
        assert_eq!(markdown_to_html("**hi**"), "<b>hi</b>");
        assert_eq!(markdown_to_html("__hi__"), "<b>hi</b>");
        assert_eq!(markdown_to_html("*hi*"), "<i>hi</i>");
        assert_eq!(markdown_to_html("~~gone~~"), "<s>gone</s>");
    }

    #[test]
    fn test_snake_case_survives() {
        assert_eq!(markdown_to_html("use my_var_name here"), "use my_var_name here");
        assert_eq!(markdown_to_html("say _softly_ now"), "say <i>softly</i> now");
    }

    #[test]
    fn test_link() {
        assert_eq!(
            markdown_to_html("[docs](https://example.com/a?b=1)"),
            "<a href=\"https://example.com/a?b=1\">docs</a>"
        );
    }

    #[test]
    fn test_inline_code_escaped_verbatim() {
        assert_eq!(
            markdown_to_html("run `a < b` now"),
            "run <code>a &lt; b</code> now"
        );
        // markdown inside code is not converted
        assert_eq!(markdown_to_html("`**x**`"), "<code>**x**</code>");
    }

    #[test]
    fn test_fenced_block() {
        let input = "before\n```rust\nlet x = 1 < 2;\n```\nafter";
        assert_eq!(
            markdown_to_html(input),
            "before\n<pre><code>let x = 1 &lt; 2;</code></pre>\nafter"
        );
    }

    #[test]
    fn test_blank_lines_collapse() {
        assert_eq!(markdown_to_html("a\n\n\n\nb"), "a\n\nb");
    }

    #[test]
    fn test_no_raw_angle_brackets_outside_tags() {
        let out = markdown_to_html("x <script> **y** `1<2`");
        assert!(!out.contains("<script>"));
        assert!(out.contains("&lt;script&gt;"));
        assert!(out.contains("<b>y</b>"));
    }

    #[test]
    fn test_text_only_roundtrip() {
        // Escaping text-only segments is reversible.
        let original = "tuples <a, b> & friends";
        let html = markdown_to_html(original);
        let back = html
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&amp;", "&");
        assert_eq!(back, original);
    }
}

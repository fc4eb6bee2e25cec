//! Post-processing: turn a raw transcript into the persisted artifact.
//!
//! Models wrap output in code fences despite being told not to, emit CRLF,
//! or sprinkle zero-width characters copied from the page. These rules fix
//! those quirks deterministically so the prompt can stay about *what* to
//! transcribe. Every rule is a pure `&str → String` pass.

use crate::config::OutputFormat;
use crate::prompts::PAGE_STYLESHEET;
use once_cell::sync::Lazy;
use regex::Regex;

/// Render `raw` as the artifact for `format`.
///
/// Returns `None` when nothing is left after cleanup: an empty page must not
/// be written, or it would mark the unit complete with no content.
pub fn render(format: OutputFormat, raw: &str) -> Option<String> {
    let body = strip_fences(raw);
    let body = remove_invisible_chars(&normalise_line_endings(&body));
    if body.trim().is_empty() {
        return None;
    }
    Some(match format {
        OutputFormat::Html => wrap_html(body.trim()),
        OutputFormat::Markdown => clean_markdown(&body),
    })
}

/// Wrap inner body markup in the standalone styled page.
pub fn wrap_html(body: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset='utf-8'>{PAGE_STYLESHEET}</head><body>{body}</body></html>\n"
    )
}

/// Markdown cleanup, in order:
/// 1. Trim trailing whitespace per line
/// 2. Collapse 3+ consecutive blank lines down to 2
/// 3. Insert a missing GFM separator row after a table header
/// 4. Ensure the file ends with exactly one newline
pub fn clean_markdown(input: &str) -> String {
    let s = trim_trailing_whitespace(input);
    let s = collapse_blank_lines(&s);
    let s = fix_missing_table_separator(&s);
    ensure_final_newline(&s)
}

// ── Fences ───────────────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)\r?\n?```\s*$").unwrap());

static RE_FENCE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*```[A-Za-z0-9_-]*[ \t]*\r?$\n?").unwrap());

/// Remove a wrapping ```` ```html ```` / ```` ```markdown ```` fence, and any
/// stray fence lines a model left mid-payload.
pub fn strip_fences(input: &str) -> String {
    let trimmed = input.trim();
    let inner = match RE_OUTER_FENCES.captures(trimmed) {
        Some(caps) => caps[1].to_string(),
        None => trimmed.to_string(),
    };
    RE_FENCE_LINE.replace_all(&inner, "").into_owned()
}

// ── Whitespace ───────────────────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

fn trim_trailing_whitespace(input: &str) -> String {
    input.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").into_owned()
}

fn ensure_final_newline(input: &str) -> String {
    format!("{}\n", input.trim_end())
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'],
        "",
    )
}

// ── Tables ───────────────────────────────────────────────────────────────────

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.contains('-') && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// Historical ledgers are mostly tables; a header row without its `| --- |`
/// line renders as plain text, so add one where a table starts without it.
fn fix_missing_table_separator(input: &str) -> String {
    let lines: Vec<&str> = input.lines().collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 4);
    for (i, line) in lines.iter().enumerate() {
        out.push((*line).to_string());
        let starts_table = is_table_row(line)
            && !is_separator_row(line)
            && (i == 0 || !is_table_row(lines[i - 1]));
        let next = lines.get(i + 1).copied().unwrap_or("");
        if starts_table && is_table_row(next) && !is_separator_row(next) {
            let cols = line.trim().matches('|').count().saturating_sub(1).max(1);
            out.push(format!("|{}", " --- |".repeat(cols)));
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_html_fence() {
        let raw = "```html\n<h1>GUIDE</h1>\n<p>Mooltan</p>\n```";
        assert_eq!(strip_fences(raw), "<h1>GUIDE</h1>\n<p>Mooltan</p>");
    }

    #[test]
    fn strips_stray_fence_lines() {
        let raw = "<p>a</p>\n```\n<p>b</p>";
        assert_eq!(strip_fences(raw), "<p>a</p>\n<p>b</p>");
    }

    #[test]
    fn unfenced_passthrough() {
        assert_eq!(strip_fences("  <p>Calcutta</p>  "), "<p>Calcutta</p>");
    }

    #[test]
    fn html_render_wraps_in_stylesheet_page() {
        let page = render(OutputFormat::Html, "```html\n<p>Bombay</p>\n```").unwrap();
        assert!(page.starts_with("<!DOCTYPE html>"));
        assert!(page.contains("<body><p>Bombay</p></body>"));
        assert!(page.contains("font-family: 'Georgia'"));
        assert!(!page.contains("```"));
    }

    #[test]
    fn empty_payload_renders_nothing() {
        assert_eq!(render(OutputFormat::Html, "```html\n\n```"), None);
        assert_eq!(render(OutputFormat::Markdown, " \u{200B} \n"), None);
    }

    #[test]
    fn markdown_render_cleans_whitespace() {
        let md = render(OutputFormat::Markdown, "```markdown\r\n# Title   \r\n\r\n\r\n\r\n\r\nBody\r\n```").unwrap();
        assert_eq!(md, "# Title\n\n\nBody\n");
    }

    #[test]
    fn adds_missing_table_separator() {
        let fixed = fix_missing_table_separator("| Office | Rate |\n| Agra | 2 |");
        let lines: Vec<&str> = fixed.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "| --- | --- |");
    }

    #[test]
    fn table_with_separator_unchanged() {
        let input = "| A | B |\n| --- | --- |\n| 1 | 2 |";
        assert_eq!(fix_missing_table_separator(input), input);
    }

    #[test]
    fn body_rows_do_not_get_separators() {
        let input = "| A | B |\n|---|---|\n| 1 | 2 |\n| 3 | 4 |";
        assert_eq!(fix_missing_table_separator(input), input);
    }
}

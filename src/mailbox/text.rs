//! Body text helpers for HTML conversion and quote stripping.
//!
//! No network; HTML rendering is delegated to html2text.

/// Wide enough that html2text never wraps a sentence across lines, which
/// would hide reply attributions from `strip_quoted_text`.
const RENDER_WIDTH: usize = 10_000;

/// Convert an HTML body to plain text.
///
/// Rendering goes through html2text; the result has whitespace collapsed
/// per line and runs of blank lines squeezed.
pub fn html_to_text(html: &str) -> Result<String, html2text::Error> {
    let text = html2text::from_read(html.as_bytes(), RENDER_WIDTH)?;
    Ok(normalize_lines(&text))
}

/// Collapse runs of whitespace within lines and runs of blank lines.
fn normalize_lines(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in text.lines() {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() && lines.last().is_none_or(|l| l.is_empty()) {
            continue;
        }
        lines.push(collapsed);
    }
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Strip quoted history from a reply body.
///
/// Removes:
/// - Lines starting with `>` (quoted reply lines)
/// - Everything after an "On ... wrote:" attribution line
/// - Everything after an Outlook "From: / Sent:" header block or an
///   "Original Message" separator
pub fn strip_quoted_text(body: &str) -> String {
    let lines: Vec<&str> = body.lines().collect();
    let mut result = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();

        if trimmed.starts_with('>') {
            continue;
        }

        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }

        if trimmed.contains("Original Message") && trimmed.starts_with("--") {
            break;
        }

        if trimmed.starts_with("From:")
            && lines[i + 1..]
                .iter()
                .take(3)
                .any(|l| l.trim().starts_with("Sent:"))
        {
            break;
        }

        result.push(*line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }

    result.join("\n")
}

/// Truncate to at most `max` characters, on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

//! Hygiene for user-facing model output.
//!
//! Strips `<think>…</think>` blocks and leftover fenced tool blocks, then
//! collapses runs of blank lines. If stripping leaves nothing (some models
//! wrap their entire answer in think tags), the think content is recovered
//! instead of returning an empty result.

/// Clean a final result for delivery.
pub fn clean_result(text: &str) -> String {
    let (stripped, think_contents) = strip_think(text);
    let stripped = strip_tool_blocks(&stripped);
    let stripped = collapse_blank_lines(stripped.trim());
    if !stripped.is_empty() {
        return stripped;
    }

    // Entire output was think blocks - recover the content.
    let recovered = think_contents
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");
    collapse_blank_lines(recovered.trim())
}

/// Remove `<think>…</think>` spans, returning the remainder and the
/// captured contents.
fn strip_think(text: &str) -> (String, Vec<String>) {
    let mut out = String::with_capacity(text.len());
    let mut captured = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("<think>") {
        out.push_str(&rest[..open]);
        let after = &rest[open + "<think>".len()..];
        match after.find("</think>") {
            Some(close) => {
                captured.push(after[..close].to_string());
                rest = &after[close + "</think>".len()..];
            }
            None => {
                // Unterminated think block swallows the rest.
                captured.push(after.to_string());
                rest = "";
            }
        }
    }
    out.push_str(rest);
    (out, captured)
}

/// Remove leftover fenced tool-invocation blocks (```` ```tool ```` fences
/// and `<tool_code>` spans, including mixed open/close pairs).
fn strip_tool_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    loop {
        let fence = rest.find("```tool");
        let tag = rest.find("<tool_code>");
        let Some(open) = [fence, tag].into_iter().flatten().min() else {
            out.push_str(rest);
            break;
        };

        out.push_str(&rest[..open]);
        let after_open = if rest[open..].starts_with("```tool") {
            &rest[open + "```tool".len()..]
        } else {
            &rest[open + "<tool_code>".len()..]
        };

        // Close on whichever terminator comes first.
        let close_fence = after_open.find("```").map(|i| (i, "```".len()));
        let close_tag = after_open.find("</tool_code>").map(|i| (i, "</tool_code>".len()));
        match [close_fence, close_tag]
            .into_iter()
            .flatten()
            .min_by_key(|(i, _)| *i)
        {
            Some((i, len)) => rest = &after_open[i + len..],
            None => {
                rest = "";
            }
        }
    }
    out
}

/// Collapse runs of 3+ newlines down to a blank line.
fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0;
    for ch in text.chars() {
        if ch == '\n' {
            newlines += 1;
            if newlines <= 2 {
                out.push(ch);
            }
        } else {
            newlines = 0;
            out.push(ch);
        }
    }
    out
}

/// Extract `FILE:` delivery markers from a result, returning the cleaned
/// text and the named paths.
pub fn extract_file_markers(text: &str) -> (String, Vec<String>) {
    let mut files = Vec::new();
    let mut kept = Vec::new();
    for line in text.lines() {
        match line.trim().strip_prefix("FILE:") {
            Some(path) if !path.trim().is_empty() => files.push(path.trim().to_string()),
            _ => kept.push(line),
        }
    }
    (kept.join("\n").trim().to_string(), files)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

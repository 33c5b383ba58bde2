//! Tool result formatting.
//!
//! Turns a tool outcome into the `output` string of a call-result. Successful
//! output is bounded to a character budget: arrays drop trailing items with a
//! note saying how many were left out, text is cut at a line or sentence
//! boundary when one is close enough. Failures become a structured payload
//! the speech model can act on.

use serde_json::{json, Value};

use crate::error::ToolError;
use crate::utils::string::{char_boundary, prefix_chars};

/// A call-result body ready to go on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedResult {
    pub output: String,
    pub is_error: bool,
}

impl FormattedResult {
    pub fn from_outcome(outcome: &Result<Value, ToolError>, max_chars: usize) -> Self {
        match outcome {
            Ok(value) => Self {
                output: format_success(value, max_chars),
                is_error: false,
            },
            Err(err) => Self {
                output: format_failure(err),
                is_error: true,
            },
        }
    }
}

/// Format a successful tool value, bounded to `max_chars` characters.
///
/// Strings are passed through as-is, everything else is compact JSON.
pub fn format_success(value: &Value, max_chars: usize) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() <= max_chars {
        return text;
    }
    if let Value::Array(items) = value {
        if let Some(out) = truncate_array(items, max_chars) {
            return out;
        }
    }
    truncate_text(&text, max_chars)
}

/// Structured failure payload carrying kind, recoverability and a suggestion.
pub fn format_failure(err: &ToolError) -> String {
    json!({
        "error": {
            "kind": err.kind.as_str(),
            "message": err.message,
            "recoverable": err.is_recoverable(),
            "suggestion": err.suggestion(),
        }
    })
    .to_string()
}

/// Keep the leading items that fit, then note how many were dropped.
/// Returns `None` when not even the first item fits.
fn truncate_array(items: &[Value], max_chars: usize) -> Option<String> {
    let reserve = more_items_note(items.len()).chars().count();
    let budget = max_chars.saturating_sub(reserve);

    // "[" + "]"
    let mut used = 2;
    let mut kept: Vec<String> = Vec::new();
    for item in items {
        let encoded = item.to_string();
        let separator = usize::from(!kept.is_empty());
        let cost = encoded.chars().count() + separator;
        if used + cost > budget {
            break;
        }
        used += cost;
        kept.push(encoded);
    }
    if kept.is_empty() {
        return None;
    }

    let omitted = items.len() - kept.len();
    Some(format!("[{}]{}", kept.join(","), more_items_note(omitted)))
}

fn more_items_note(n: usize) -> String {
    format!("\n({} more items)", n)
}

/// Cut text to the budget, preferring the last newline or sentence end in
/// the second half of the kept prefix.
fn truncate_text(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    let reserve = truncation_marker(total).chars().count();
    if max_chars <= reserve {
        // No room for the marker.
        return prefix_chars(text, max_chars);
    }
    let budget = max_chars - reserve;

    let hard_cut = char_boundary(text, budget);
    let head = &text[..hard_cut];
    let floor = hard_cut / 2;

    let soft_cut = head
        .rfind('\n')
        .filter(|&i| i >= floor && i > 0)
        .or_else(|| head.rfind(". ").filter(|&i| i >= floor).map(|i| i + 1));
    let cut = soft_cut.unwrap_or(hard_cut);

    let kept = &text[..cut];
    let omitted = total - kept.chars().count();
    format!("{}{}", kept, truncation_marker(omitted))
}

fn truncation_marker(omitted: usize) -> String {
    format!("\n...[truncated {} chars]", omitted)
}

//! Configuration validation: unknown field detection and value range checks.

use serde_json::Value;
use std::collections::HashSet;

use super::Config;

/// Known top-level config field names.
const KNOWN_TOP_LEVEL: &[&str] = &[
    "session",
    "tools",
    "context",
    "broadcast",
    "recovery",
    "reconnect",
    "playback",
    "logging",
];

/// Known fields per section, used for nested unknown-field detection.
const KNOWN_SECTION_FIELDS: &[(&str, &[&str])] = &[
    (
        "session",
        &[
            "max_duration_secs",
            "warning_before_secs",
            "idle_timeout_secs",
            "checkpoint_interval_secs",
            "recent_results_capacity",
            "max_active_calls",
            "channel_buffer",
            "instructions",
            "voice",
            "turn_detection",
        ],
    ),
    (
        "tools",
        &[
            "max_concurrent",
            "direct_timeout_ms",
            "delegated_timeout_ms",
            "long_running_threshold_ms",
            "progress_interval_ms",
            "max_output_chars",
            "approval",
            "expose_cancel_tool",
        ],
    ),
    (
        "context",
        &[
            "ceiling_tokens",
            "headroom_tokens",
            "prune_threshold",
            "keep_recent",
            "summary_ratio",
        ],
    ),
    ("broadcast", &["subscriber_queue_capacity"]),
    ("recovery", &["enabled", "dir", "verbatim_turns"]),
    ("reconnect", &["max_attempts", "base_delay_ms", "max_delay_ms"]),
    ("playback", &["bytes_per_ms"]),
    ("logging", &["format", "level", "file"]),
];

/// A validation diagnostic.
#[derive(Debug)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub path: String,
    pub message: String,
}

#[derive(Debug, PartialEq)]
pub enum DiagnosticLevel {
    Ok,
    Warn,
    Error,
}

impl Diagnostic {
    fn error(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            path: path.into(),
            message: message.into(),
        }
    }

    fn warn(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warn,
            path: path.into(),
            message: message.into(),
        }
    }

    fn ok(message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Ok,
            path: String::new(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.level {
            DiagnosticLevel::Ok => "[OK]",
            DiagnosticLevel::Warn => "[WARN]",
            DiagnosticLevel::Error => "[ERROR]",
        };
        if self.path.is_empty() {
            write!(f, "{} {}", prefix, self.message)
        } else {
            write!(f, "{} {}: {}", prefix, self.path, self.message)
        }
    }
}

/// Simple Levenshtein distance for "did you mean?" suggestions.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// Suggest the closest known field name (if distance <= 3).
pub fn suggest_field(unknown: &str, known: &[&str]) -> Option<String> {
    known
        .iter()
        .map(|k| (k, levenshtein(unknown, k)))
        .filter(|(_, d)| *d <= 3)
        .min_by_key(|(_, d)| *d)
        .map(|(k, _)| format!("did you mean '{}'?", k))
}

fn unknown_field(path: String, key: &str, known: &[&str]) -> Diagnostic {
    let message = match suggest_field(key, known) {
        Some(hint) => format!("Unknown field '{}' ({})", key, hint),
        None => format!("Unknown field '{}'", key),
    };
    Diagnostic::error(path, message)
}

/// Validate a raw JSON config value against known field names.
pub fn validate_raw(raw: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let Some(obj) = raw.as_object() else {
        diagnostics.push(Diagnostic::error("", "Config must be a JSON object"));
        return diagnostics;
    };
    diagnostics.push(Diagnostic::ok("Valid JSON"));

    let top: HashSet<&str> = KNOWN_TOP_LEVEL.iter().copied().collect();
    let mut has_unknown = false;
    for (key, value) in obj {
        if !top.contains(key.as_str()) {
            has_unknown = true;
            diagnostics.push(unknown_field(key.clone(), key, KNOWN_TOP_LEVEL));
            continue;
        }
        let Some(section) = value.as_object() else {
            continue;
        };
        let Some((_, known)) = KNOWN_SECTION_FIELDS.iter().find(|(name, _)| name == key) else {
            continue;
        };
        for field in section.keys() {
            if !known.contains(&field.as_str()) {
                has_unknown = true;
                diagnostics.push(unknown_field(format!("{}.{}", key, field), field, known));
            }
        }
    }

    if !has_unknown {
        diagnostics.push(Diagnostic::ok("All fields recognized"));
    }
    diagnostics
}

/// Check value ranges on a parsed config.
pub fn validate_values(config: &Config) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let session = &config.session;
    if session.max_duration_secs == 0 {
        diagnostics.push(Diagnostic::error(
            "session.max_duration_secs",
            "must be greater than zero",
        ));
    }
    if session.warning_before_secs >= session.max_duration_secs {
        diagnostics.push(Diagnostic::warn(
            "session.warning_before_secs",
            "is not shorter than the session budget; the warning fires immediately",
        ));
    }
    if session.channel_buffer == 0 {
        diagnostics.push(Diagnostic::error(
            "session.channel_buffer",
            "must be greater than zero",
        ));
    }
    if session.max_active_calls == 0 {
        diagnostics.push(Diagnostic::error(
            "session.max_active_calls",
            "must be greater than zero",
        ));
    }

    let tools = &config.tools;
    if tools.max_concurrent == 0 {
        diagnostics.push(Diagnostic::error(
            "tools.max_concurrent",
            "must be greater than zero",
        ));
    }
    if tools.direct_timeout_ms == 0 || tools.delegated_timeout_ms == 0 {
        diagnostics.push(Diagnostic::error(
            "tools",
            "tool timeouts must be greater than zero",
        ));
    }
    if tools.progress_interval_ms == 0 {
        diagnostics.push(Diagnostic::error(
            "tools.progress_interval_ms",
            "must be greater than zero",
        ));
    }

    let context = &config.context;
    if context.ceiling_tokens == 0 {
        diagnostics.push(Diagnostic::error(
            "context.ceiling_tokens",
            "must be greater than zero",
        ));
    }
    if context.headroom_tokens >= context.ceiling_tokens {
        diagnostics.push(Diagnostic::error(
            "context.headroom_tokens",
            "must be smaller than the ceiling",
        ));
    }
    if !(0.0 < context.prune_threshold && context.prune_threshold <= 1.0) {
        diagnostics.push(Diagnostic::error(
            "context.prune_threshold",
            "must be in (0.0, 1.0]",
        ));
    }
    if !(0.0 < context.summary_ratio && context.summary_ratio < 1.0) {
        diagnostics.push(Diagnostic::error(
            "context.summary_ratio",
            "must be in (0.0, 1.0)",
        ));
    }

    if config.broadcast.subscriber_queue_capacity == 0 {
        diagnostics.push(Diagnostic::error(
            "broadcast.subscriber_queue_capacity",
            "must be greater than zero",
        ));
    }
    if config.reconnect.base_delay_ms > config.reconnect.max_delay_ms {
        diagnostics.push(Diagnostic::warn(
            "reconnect.base_delay_ms",
            "is larger than max_delay_ms; every attempt waits max_delay_ms",
        ));
    }
    if config.playback.bytes_per_ms == 0 {
        diagnostics.push(Diagnostic::error(
            "playback.bytes_per_ms",
            "must be greater than zero",
        ));
    }

    diagnostics
}

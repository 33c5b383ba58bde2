//! Spoken pre-announcements for tool calls.
//!
//! When a call starts, observers get a short phrase the voice layer can speak
//! ("Let me look that up.") plus a detail line derived from well-known
//! arguments ("Searching for: train times"). Phrases come from a fixed table,
//! first by exact name, then by name fragment; unknown tools get a generic one.

use super::ToolArgs;
use crate::utils::string::preview;

/// Phrase used for tools with no table entry.
pub const GENERIC_ANNOUNCEMENT: &str = "One moment while I work on that.";

/// Ordered so that more specific fragments win partial matches.
const PHRASES: &[(&str, &str)] = &[
    ("delegate", "Let me hand that off, I'll get back to you."),
    ("lookup", "Let me look that up."),
    ("read_file", "Let me read that file."),
    ("write_file", "I'll write that file now."),
    ("list_directory", "Let me look through that folder."),
    ("search", "Let me search for that."),
    ("fetch", "Let me fetch that."),
    ("web", "Let me check the web."),
    ("bash", "Running that command now."),
    ("execute", "Running that now."),
    ("calendar", "Let me check the calendar."),
    ("weather", "Let me check the weather."),
];

const FRIENDLY_NAMES: &[(&str, &str)] = &[
    ("read_file", "reading file"),
    ("write_file", "writing file"),
    ("list_directory", "listing directory"),
    ("filesystem", "file system"),
    ("bash", "command line"),
    ("execute", "running command"),
    ("search", "web search"),
    ("fetch", "fetching URL"),
    ("web", "web browser"),
];

const COMMAND_PREVIEW_CHARS: usize = 30;

/// What observers are told when a call starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    /// Sentence suitable for speaking before the result arrives.
    pub phrase: String,
    /// Short description of what is being done with which arguments.
    pub detail: String,
}

fn table_lookup(table: &[(&str, &'static str)], tool_name: &str) -> Option<&'static str> {
    if let Some((_, value)) = table.iter().find(|(key, _)| *key == tool_name) {
        return Some(*value);
    }
    let lowered = tool_name.to_lowercase();
    table
        .iter()
        .find(|(key, _)| lowered.contains(key))
        .map(|(_, value)| *value)
}

/// Voice-friendly tool name, e.g. `read_file` -> "reading file".
pub fn friendly_name(tool_name: &str) -> String {
    match table_lookup(FRIENDLY_NAMES, tool_name) {
        Some(name) => name.to_string(),
        None => tool_name.replace(['_', '-'], " "),
    }
}

/// Pre-announcement phrase for a tool name.
pub fn phrase_for(tool_name: &str) -> &'static str {
    table_lookup(PHRASES, tool_name).unwrap_or(GENERIC_ANNOUNCEMENT)
}

/// Detail line derived from well-known argument names.
pub fn detail_for(tool_name: &str, args: &ToolArgs) -> String {
    if let Some(path) = args.get_str("path") {
        let file = path.rsplit('/').next().unwrap_or(path);
        return format!("Accessing {}", file);
    }
    if let Some(cmd) = args.get_str("command") {
        return format!("Running: {}", preview(cmd, COMMAND_PREVIEW_CHARS));
    }
    if args.get("url").is_some() {
        return "Fetching from the web".to_string();
    }
    if let Some(query) = args.get_str("query").or_else(|| args.get_str("q")) {
        return format!("Searching for: {}", query);
    }
    format!("Using {}", friendly_name(tool_name))
}

/// Build the announcement, preferring a phrase declared in tool metadata.
pub fn announce(tool_name: &str, args: &ToolArgs, declared: Option<&str>) -> Announcement {
    Announcement {
        phrase: declared
            .map(str::to_string)
            .unwrap_or_else(|| phrase_for(tool_name).to_string()),
        detail: detail_for(tool_name, args),
    }
}

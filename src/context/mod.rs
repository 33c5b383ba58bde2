//! Context window accounting for a voice session.
//!
//! The speech model keeps the conversation server-side; this module mirrors
//! it closely enough to know when the model's context is about to overflow.
//! Tokens are estimated as `ceil(chars / 4)`, which is deterministic and
//! monotonic in content length.
//!
//! When the estimate (plus headroom) crosses `ceiling × prune_threshold`,
//! the oldest contiguous run of summarizable entries outside the most recent
//! K is folded into a single `system` summary entry whose token estimate is a
//! fixed fraction of what it replaced. The most recent K entries and any
//! non-summarizable entry (e.g. an unresolved tool call) are never touched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ContextConfig;
use crate::utils::string::{preview, squash_whitespace};

/// Header of every synthetic summary entry.
pub const SUMMARY_HEADER: &str = "[Conversation Summary]";

/// Per-entry preview length inside a summary.
const SUMMARY_LINE_CHARS: usize = 160;

/// Upper bound on summary body length; older lines are dropped first.
const SUMMARY_MAX_CHARS: usize = 4_000;

/// Estimate the token count of `text` as `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Who produced a context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
            Role::System => write!(f, "system"),
        }
    }
}

/// One turn or tool exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Assigned by the window on append; 0 until then.
    pub id: u64,
    pub role: Role,
    pub content: String,
    pub approx_tokens: usize,
    pub timestamp: DateTime<Utc>,
    pub summarizable: bool,
    /// Synthetic entry produced by pruning or reseeding.
    #[serde(default)]
    pub is_summary: bool,
}

impl ContextEntry {
    /// A summarizable entry with its token estimate derived from `content`.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: 0,
            role,
            approx_tokens: estimate_tokens(&content),
            content,
            timestamp: Utc::now(),
            summarizable: true,
            is_summary: false,
        }
    }

    /// Mark the entry as non-summarizable until explicitly released.
    pub fn pinned(mut self) -> Self {
        self.summarizable = false;
        self
    }

    fn summary(body: String, approx_tokens: usize) -> Self {
        Self {
            id: 0,
            role: Role::System,
            content: format!("{}\n{}", SUMMARY_HEADER, body),
            approx_tokens,
            timestamp: Utc::now(),
            summarizable: true,
            is_summary: true,
        }
    }

    /// Summary body without the header line.
    fn summary_body(&self) -> &str {
        self.content
            .strip_prefix(SUMMARY_HEADER)
            .map(|rest| rest.trim_start_matches('\n'))
            .unwrap_or(&self.content)
    }

    fn summary_line(&self) -> String {
        format!(
            "{}: {}",
            self.role,
            preview(&squash_whitespace(&self.content), SUMMARY_LINE_CHARS)
        )
    }
}

/// Result of a pruning check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PruneOutcome {
    /// Size was already under the trigger.
    NotNeeded,
    /// One or more runs were folded into summaries.
    Pruned {
        runs: usize,
        replaced_entries: usize,
        tokens_before: usize,
        tokens_after: usize,
    },
    /// Nothing summarizable is left but the window is still over the trigger.
    OverBudget {
        tokens: usize,
        runs: usize,
    },
}

/// Ordered conversation mirror with size accounting.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    entries: Vec<ContextEntry>,
    next_id: u64,
    total_tokens: usize,
    ceiling: usize,
    headroom: usize,
    prune_threshold: f64,
    keep_recent: usize,
    summary_ratio: f64,
}

impl ContextWindow {
    pub fn new(config: &ContextConfig) -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
            total_tokens: 0,
            ceiling: config.ceiling_tokens,
            headroom: config.headroom_tokens,
            prune_threshold: config.prune_threshold,
            keep_recent: config.keep_recent,
            summary_ratio: config.summary_ratio,
        }
    }

    /// Append an entry, returning the id assigned to it.
    pub fn append(&mut self, mut entry: ContextEntry) -> u64 {
        entry.id = self.next_id;
        self.next_id += 1;
        self.total_tokens += entry.approx_tokens;
        let id = entry.id;
        self.entries.push(entry);
        id
    }

    /// Sum of `approx_tokens` over all entries.
    pub fn current_size(&self) -> usize {
        self.total_tokens
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Size at which pruning starts, headroom included.
    pub fn trigger_size(&self) -> usize {
        (self.ceiling as f64 * self.prune_threshold).floor() as usize
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn get(&self, id: u64) -> Option<&ContextEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Allow a previously pinned entry to be summarized. Returns `false` for unknown ids.
    pub fn mark_summarizable(&mut self, id: u64) -> bool {
        match self.entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.summarizable = true;
                true
            }
            None => false,
        }
    }

    /// Replace an entry's content and re-estimate its tokens.
    pub fn update_content(&mut self, id: u64, content: impl Into<String>) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        let content = content.into();
        let tokens = estimate_tokens(&content);
        self.total_tokens = self.total_tokens - entry.approx_tokens + tokens;
        entry.content = content;
        entry.approx_tokens = tokens;
        true
    }

    fn over_trigger(&self) -> bool {
        self.total_tokens + self.headroom > self.trigger_size()
    }

    /// Locate the oldest summarizable run outside the protected tail.
    ///
    /// A run made of a single existing summary is skipped; folding it again
    /// would only shrink an already-compact entry.
    fn next_run(&self) -> Option<(usize, usize)> {
        let protected_from = self.entries.len().saturating_sub(self.keep_recent);
        let mut i = 0;
        while i < protected_from {
            if !self.entries[i].summarizable {
                i += 1;
                continue;
            }
            let start = i;
            while i < protected_from && self.entries[i].summarizable {
                i += 1;
            }
            let lone_summary = i - start == 1 && self.entries[start].is_summary;
            if !lone_summary {
                return Some((start, i));
            }
        }
        None
    }

    /// Fold `[start, end)` into one summary entry.
    fn fold(&mut self, start: usize, end: usize) -> usize {
        let run: Vec<ContextEntry> = self.entries.drain(start..end).collect();
        let replaced_tokens: usize = run.iter().map(|e| e.approx_tokens).sum();

        let mut lines: Vec<String> = Vec::with_capacity(run.len());
        for entry in &run {
            if entry.is_summary {
                lines.extend(entry.summary_body().lines().map(str::to_string));
            } else {
                lines.push(entry.summary_line());
            }
        }
        let mut body_len: usize = lines.iter().map(|l| l.chars().count() + 1).sum();
        let mut first = 0;
        while body_len > SUMMARY_MAX_CHARS && first + 1 < lines.len() {
            body_len -= lines[first].chars().count() + 1;
            first += 1;
        }
        let body = lines[first..].join("\n");

        let tokens = ((replaced_tokens as f64 * self.summary_ratio).ceil() as usize).max(1);
        let mut summary = ContextEntry::summary(body, tokens);
        summary.id = self.next_id;
        self.next_id += 1;

        self.total_tokens = self.total_tokens - replaced_tokens + tokens;
        self.entries.insert(start, summary);
        run.len()
    }

    /// Summarize old runs until the window is back under the trigger.
    pub fn prune_if_needed(&mut self) -> PruneOutcome {
        if !self.over_trigger() {
            return PruneOutcome::NotNeeded;
        }

        let tokens_before = self.total_tokens;
        let mut runs = 0;
        let mut replaced_entries = 0;
        // Each fold removes at least one entry or leaves a lone summary that
        // is skipped afterwards, so this bound is never the limiting factor.
        for _ in 0..self.entries.len() {
            if !self.over_trigger() {
                break;
            }
            let Some((start, end)) = self.next_run() else {
                break;
            };
            replaced_entries += self.fold(start, end);
            runs += 1;
        }

        if self.over_trigger() {
            PruneOutcome::OverBudget {
                tokens: self.total_tokens,
                runs,
            }
        } else {
            PruneOutcome::Pruned {
                runs,
                replaced_entries,
                tokens_before,
                tokens_after: self.total_tokens,
            }
        }
    }

    /// Summary covering everything except the last `verbatim` entries.
    ///
    /// Complements [`recent_turns`](Self::recent_turns) with the same
    /// `verbatim`: existing summaries always contribute their bodies, other
    /// entries older than the verbatim tail contribute one preview line each.
    pub fn summary_for_recovery(&self, verbatim: usize) -> String {
        let first_verbatim = self
            .entries
            .iter()
            .rev()
            .filter(|e| !e.is_summary)
            .take(verbatim)
            .last()
            .map(|e| e.id);
        let mut lines: Vec<String> = Vec::new();
        for entry in &self.entries {
            if entry.is_summary {
                lines.extend(entry.summary_body().lines().map(str::to_string));
            } else if first_verbatim.is_some_and(|id| entry.id >= id) {
                continue;
            } else {
                lines.push(entry.summary_line());
            }
        }
        lines.join("\n")
    }

    /// The last `n` non-summary entries, oldest first.
    pub fn recent_turns(&self, n: usize) -> Vec<ContextEntry> {
        let mut turns: Vec<ContextEntry> = self
            .entries
            .iter()
            .rev()
            .filter(|e| !e.is_summary)
            .take(n)
            .cloned()
            .collect();
        turns.reverse();
        turns
    }

    /// Replace the whole window with a summary and verbatim turns, as after a rotation.
    ///
    /// Turns get fresh ids; the returned pairs map each turn's previous id to
    /// its new one.
    pub fn reseed(&mut self, summary: &str, turns: Vec<ContextEntry>) -> Vec<(u64, u64)> {
        self.entries.clear();
        self.total_tokens = 0;
        if !summary.trim().is_empty() {
            let tokens = estimate_tokens(summary);
            self.append(ContextEntry::summary(summary.to_string(), tokens));
        }
        let mut remapped = Vec::with_capacity(turns.len());
        for mut turn in turns {
            let old_id = turn.id;
            turn.approx_tokens = estimate_tokens(&turn.content);
            remapped.push((old_id, self.append(turn)));
        }
        remapped
    }
}

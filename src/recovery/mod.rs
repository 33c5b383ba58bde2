//! Session recovery snapshots.
//!
//! A [`SessionRecoveryRecord`] is the compact state a session needs to carry
//! on after a reconnect or rotation: a context summary, the last few turns
//! verbatim, calls that were still running, and user preferences. Records
//! are written whole (each checkpoint supersedes the previous one) through a
//! [`RecoveryStore`] and consumed once with [`RecoveryStore::take`].
//!
//! On disk and over any other persistence boundary a record travels inside a
//! versioned JSON envelope; see [`encode`] and [`decode`].

pub mod file;
pub mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{ContextEntry, Role};
use crate::error::{ParleyError, Result};

/// Envelope version written by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Why a checkpoint was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    Periodic,
    Teardown,
    Rotation,
    TransportLoss,
}

impl std::fmt::Display for CheckpointReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CheckpointReason::Periodic => "periodic",
            CheckpointReason::Teardown => "teardown",
            CheckpointReason::Rotation => "rotation",
            CheckpointReason::TransportLoss => "transport_loss",
        };
        f.write_str(s)
    }
}

/// A call that had not completed when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// Durable snapshot of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecoveryRecord {
    pub session_id: String,
    pub saved_at: DateTime<Utc>,
    pub reason: CheckpointReason,
    /// Summary of everything older than `last_turns`.
    pub context_summary: String,
    pub last_turns: Vec<ContextEntry>,
    #[serde(default)]
    pub pending_tool_calls: Vec<PendingToolCall>,
    #[serde(default)]
    pub preferences: BTreeMap<String, String>,
}

impl SessionRecoveryRecord {
    pub fn new(session_id: impl Into<String>, reason: CheckpointReason) -> Self {
        Self {
            session_id: session_id.into(),
            saved_at: Utc::now(),
            reason,
            context_summary: String::new(),
            last_turns: Vec::new(),
            pending_tool_calls: Vec::new(),
            preferences: BTreeMap::new(),
        }
    }

    /// Text injected as a system message when a session is re-established
    /// from this record.
    pub fn seed_message(&self) -> String {
        let mut out = String::from(
            "[Session resumed] The connection was re-established. Continue the \
             conversation naturally without mentioning the interruption unless asked.",
        );

        if !self.context_summary.trim().is_empty() {
            out.push_str("\n\nEarlier in this conversation:\n");
            out.push_str(self.context_summary.trim());
        }

        let turns: Vec<String> = self
            .last_turns
            .iter()
            .filter(|t| matches!(t.role, Role::User | Role::Assistant | Role::Tool))
            .filter(|t| !t.content.trim().is_empty())
            .map(|t| format!("{}: {}", t.role, t.content.trim()))
            .collect();
        if !turns.is_empty() {
            out.push_str("\n\nMost recent turns:\n");
            out.push_str(&turns.join("\n"));
        }

        if !self.pending_tool_calls.is_empty() {
            out.push_str(
                "\n\nThese tools were still running and their results were lost; \
                 offer to run them again if they still matter:",
            );
            for call in &self.pending_tool_calls {
                out.push_str(&format!("\n- {} {}", call.tool_name, call.arguments));
            }
        }

        if !self.preferences.is_empty() {
            out.push_str("\n\nUser preferences:");
            for (key, value) in &self.preferences {
                out.push_str(&format!("\n- {}: {}", key, value));
            }
        }

        out
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    format_version: u32,
    record: &'a SessionRecoveryRecord,
}

#[derive(Deserialize)]
struct Envelope {
    format_version: u32,
    record: Value,
}

/// Serialize a record inside a versioned envelope.
pub fn encode(record: &SessionRecoveryRecord) -> Result<String> {
    Ok(serde_json::to_string_pretty(&EnvelopeRef {
        format_version: FORMAT_VERSION,
        record,
    })?)
}

/// Parse an envelope written by [`encode`]. Versions newer than
/// [`FORMAT_VERSION`] are rejected rather than guessed at.
pub fn decode(raw: &str) -> Result<SessionRecoveryRecord> {
    let envelope: Envelope = serde_json::from_str(raw)
        .map_err(|e| ParleyError::Recovery(format!("Malformed recovery envelope: {}", e)))?;
    if envelope.format_version == 0 || envelope.format_version > FORMAT_VERSION {
        return Err(ParleyError::Recovery(format!(
            "Unsupported recovery format version {} (this build reads up to {})",
            envelope.format_version, FORMAT_VERSION
        )));
    }
    Ok(serde_json::from_value(envelope.record)?)
}

/// Persistence seam for recovery records.
///
/// `save` replaces any existing record for the session. `take` returns the
/// record and removes it, so a snapshot seeds at most one new connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecoveryStore: Send + Sync {
    async fn save(&self, record: &SessionRecoveryRecord) -> Result<()>;

    async fn load(&self, session_id: &str) -> Result<Option<SessionRecoveryRecord>>;

    async fn take(&self, session_id: &str) -> Result<Option<SessionRecoveryRecord>>;

    /// Session ids with a stored record, sorted.
    async fn list(&self) -> Result<Vec<String>>;
}

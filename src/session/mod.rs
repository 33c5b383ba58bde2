//! Session module - live voice sessions
//!
//! This module provides the per-conversation machinery:
//! - `SessionState`: the session state machine and its allowed edges
//! - `ToolCall`: bookkeeping for one requested tool invocation
//! - `SessionOrchestrator`: the single task that owns and mutates a session
//! - `SessionSupervisor`: the explicit directory of live sessions
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use parley::broadcast::EventBroadcaster;
//! use parley::config::Config;
//! use parley::protocol::LoopbackConnector;
//! use parley::session::{EndReason, SessionSupervisor};
//! use parley::tools::{builtin::EchoTool, ToolRegistry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut registry = ToolRegistry::new();
//!     registry.register(EchoTool);
//!     let (connector, _remotes) = LoopbackConnector::new(64);
//!
//!     let supervisor = SessionSupervisor::new(
//!         Arc::new(Config::default()),
//!         Arc::new(registry),
//!         Arc::new(EventBroadcaster::default()),
//!         Arc::new(connector),
//!         None,
//!     );
//!     let handle = supervisor.spawn_session(None, false).await.unwrap();
//!     let summary = supervisor.close(handle.session_id(), EndReason::UserEnded).await;
//!     println!("{:?}", summary);
//! }
//! ```

pub mod orchestrator;
pub mod playback;
pub mod reconnect;
pub mod supervisor;

pub use orchestrator::{SessionControl, SessionDeps, SessionOrchestrator};
pub use playback::{PlaybackTracker, Truncation};
pub use supervisor::{SessionDirectory, SessionHandle, SessionSupervisor};

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ToolError;
use crate::tools::{CallStatus, FormattedResult};
use crate::utils::metrics::MetricsSnapshot;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Ready,
    Listening,
    Processing,
    Speaking,
    ExecutingTool,
    Reconnecting,
    Terminated,
}

impl SessionState {
    /// Whether `self -> to` is an allowed edge. Same-state moves are not
    /// edges; callers treat them as no-ops.
    ///
    /// Besides the core request/response cycle, a realtime conversation
    /// needs barge-in (speaking -> listening), calls interleaved with audio
    /// (speaking -> executing_tool), responses without audio
    /// (processing -> ready), responses requested without new speech
    /// (ready -> processing) and the user talking over a running tool
    /// (executing_tool -> listening).
    pub fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        match (*self, to) {
            (Terminated, _) => false,
            (_, Reconnecting) | (_, Terminated) => true,
            (Initializing, Ready) => true,
            (Ready, Listening) | (Ready, Processing) => true,
            (Listening, Processing) => true,
            (Processing, Speaking) | (Processing, ExecutingTool) | (Processing, Ready) => true,
            (ExecutingTool, Processing) | (ExecutingTool, Listening) => true,
            (Speaking, Ready) | (Speaking, Listening) | (Speaking, ExecutingTool) => true,
            (Reconnecting, Initializing) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Listening => "listening",
            SessionState::Processing => "processing",
            SessionState::Speaking => "speaking",
            SessionState::ExecutingTool => "executing_tool",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    UserEnded,
    IdleTimeout,
    SessionLimit,
    NetworkError,
    Error,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndReason::UserEnded => "user_ended",
            EndReason::IdleTimeout => "idle_timeout",
            EndReason::SessionLimit => "session_limit",
            EndReason::NetworkError => "network_error",
            EndReason::Error => "error",
        };
        f.write_str(s)
    }
}

/// One tool invocation requested by the speech model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub status: CallStatus,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Formatted call-result, set once the call is terminal.
    pub result: Option<FormattedResult>,
    pub error: Option<ToolError>,
    /// Connection epoch the call was requested under.
    pub epoch: u64,
    /// The call-result reached the speech model.
    pub delivered: bool,
    /// Context entry mirroring this call.
    pub context_entry: Option<u64>,
}

impl ToolCall {
    pub fn new(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
        epoch: u64,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            arguments,
            status: CallStatus::Pending,
            requested_at: Utc::now(),
            started_at: None,
            result: None,
            error: None,
            epoch,
            delivered: false,
            context_entry: None,
        }
    }

    /// Move to `next` if the status order allows it.
    pub fn advance(&mut self, next: CallStatus) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        if next == CallStatus::Running {
            self.started_at = Some(Utc::now());
        }
        self.status = next;
        true
    }
}

/// A call as reported by [`SessionStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSummary {
    pub call_id: String,
    pub tool_name: String,
    pub status: CallStatus,
}

/// Answer to a status query.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: SessionState,
    pub epoch: u64,
    /// Calls not yet acknowledged by the speech model, oldest first.
    pub calls: Vec<CallSummary>,
    pub context_tokens: usize,
    pub context_ceiling: usize,
    /// Time left before the connection is rotated.
    pub remaining_secs: u64,
    pub preferences: BTreeMap<String, String>,
}

impl SessionStatus {
    /// Calls still queued or running.
    pub fn running_calls(&self) -> impl Iterator<Item = &CallSummary> {
        self.calls.iter().filter(|c| !c.status.is_terminal())
    }
}

/// Returned when a session's run loop finishes.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub end_reason: EndReason,
    pub final_state: SessionState,
    pub metrics: MetricsSnapshot,
}

//! Parley - voice session orchestrator
//!
//! Sits between a realtime speech model and a set of tools: owns each
//! conversation's state machine, runs tool calls under deadlines, keeps a
//! bounded context mirror, and survives dropped connections and session
//! length limits by checkpointing and reseeding.

pub mod broadcast;
pub mod config;
pub mod context;
pub mod error;
pub mod protocol;
pub mod recovery;
pub mod session;
pub mod tools;
pub mod utils;

pub use broadcast::{BroadcastEvent, EventBroadcaster, SessionFilter};
pub use config::Config;
pub use context::{ContextEntry, ContextWindow, Role};
pub use error::{ParleyError, Result, ToolError, ToolErrorKind};
pub use protocol::{InboundEvent, OutboundEvent, SpeechConnector, SpeechLink};
pub use recovery::{RecoveryStore, SessionRecoveryRecord};
pub use session::{
    EndReason, SessionHandle, SessionState, SessionStatus, SessionSummary, SessionSupervisor,
    ToolCall,
};
pub use tools::{Tool, ToolArgs, ToolContext, ToolRegistry};

//! Error types for Parley
//!
//! This module defines all error types used throughout the orchestrator.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Tool Error Classification
// ============================================================================

/// Structured tool failure classification.
///
/// Every tool failure is reported back to the speech model through a
/// call-result, so the kind decides both the `recoverable` flag and the
/// suggested next step the model sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// No tool registered under the requested name
    NotFound,
    /// Denied by the session's approval policy
    Permission,
    /// Deadline elapsed before the tool finished
    Timeout,
    /// Arguments were not a JSON object or missed required fields
    InvalidInput,
    /// The tool itself failed or panicked
    Internal,
    /// Cancelled by the user or by session teardown
    Cancelled,
}

impl ToolErrorKind {
    /// Returns `true` if the model may reasonably retry or rephrase.
    ///
    /// Unknown tools and permission denials will fail the same way again.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ToolErrorKind::NotFound | ToolErrorKind::Permission)
    }

    /// Suggested next step for the speech model, keyed by kind.
    pub fn suggestion(&self) -> &'static str {
        match self {
            ToolErrorKind::NotFound => {
                "This tool does not exist. Answer without it or choose one of the available tools."
            }
            ToolErrorKind::Permission => {
                "This action is not allowed in this session. Explain the restriction to the user."
            }
            ToolErrorKind::Timeout => {
                "The operation took too long. Try a narrower request or tell the user it is slow right now."
            }
            ToolErrorKind::InvalidInput => {
                "The arguments were invalid. Check the parameter schema and call the tool again."
            }
            ToolErrorKind::Internal => {
                "The tool failed unexpectedly. Retry once, then tell the user if it fails again."
            }
            ToolErrorKind::Cancelled => {
                "The operation was cancelled. Ask the user whether they want to try again."
            }
        }
    }

    /// Wire name used in payloads and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolErrorKind::NotFound => "not_found",
            ToolErrorKind::Permission => "permission",
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::InvalidInput => "invalid_input",
            ToolErrorKind::Internal => "internal",
            ToolErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool failure with its classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(tool_name: &str) -> Self {
        Self::new(
            ToolErrorKind::NotFound,
            format!("Tool not found: {}", tool_name),
        )
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Permission, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Timeout, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::InvalidInput, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Internal, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::Cancelled, message)
    }

    pub fn is_recoverable(&self) -> bool {
        self.kind.is_recoverable()
    }

    pub fn suggestion(&self) -> &'static str {
        self.kind.suggestion()
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl std::error::Error for ToolError {}

impl From<ToolError> for ParleyError {
    fn from(err: ToolError) -> Self {
        ParleyError::Tool(err)
    }
}

// ============================================================================
// Primary Error Type
// ============================================================================

/// The primary error type for Parley operations.
#[derive(Error, Debug)]
pub enum ParleyError {
    /// Configuration-related errors (invalid values, unreadable file, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Speech-model connection failures (connect refused, link dropped, etc.)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected protocol events
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Structured tool failure
    #[error("Tool error: {0}")]
    Tool(ToolError),

    /// Recovery snapshot persistence failures
    #[error("Recovery error: {0}")]
    Recovery(String),

    /// A state machine edge that is not allowed
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A session channel closed unexpectedly
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Resource not found (sessions, records, etc.)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ParleyError {
    /// Transport failures are the only class the orchestrator retries.
    pub fn is_transport(&self) -> bool {
        matches!(self, ParleyError::Transport(_) | ParleyError::ChannelClosed(_))
    }
}

/// A specialized `Result` type for Parley operations.
pub type Result<T> = std::result::Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ParleyError::Config("ceiling must be positive".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: ceiling must be positive"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ParleyError = io_err.into();
        assert!(matches!(err, ParleyError::Io(_)));
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = ParleyError::InvalidTransition {
            from: "ready".into(),
            to: "speaking".into(),
        };
        assert_eq!(err.to_string(), "Invalid transition: ready -> speaking");
    }

    #[test]
    fn test_is_transport() {
        assert!(ParleyError::Transport("reset".into()).is_transport());
        assert!(ParleyError::ChannelClosed("inbound".into()).is_transport());
        assert!(!ParleyError::Protocol("bad".into()).is_transport());
    }

    #[test]
    fn test_tool_error_recoverable() {
        assert!(!ToolError::not_found("nope").is_recoverable());
        assert!(!ToolError::permission("denied").is_recoverable());
        assert!(ToolError::timeout("2s").is_recoverable());
        assert!(ToolError::invalid_input("missing q").is_recoverable());
        assert!(ToolError::internal("boom").is_recoverable());
        assert!(ToolError::cancelled("user").is_recoverable());
    }

    #[test]
    fn test_every_kind_has_suggestion() {
        for kind in [
            ToolErrorKind::NotFound,
            ToolErrorKind::Permission,
            ToolErrorKind::Timeout,
            ToolErrorKind::InvalidInput,
            ToolErrorKind::Internal,
            ToolErrorKind::Cancelled,
        ] {
            assert!(!kind.suggestion().is_empty(), "{kind} has no suggestion");
        }
    }

    #[test]
    fn test_tool_error_display() {
        let err = ToolError::not_found("nope");
        assert_eq!(err.to_string(), "not_found error: Tool not found: nope");
    }

    #[test]
    fn test_tool_error_into_parley_error() {
        let err: ParleyError = ToolError::timeout("slow").into();
        assert!(matches!(err, ParleyError::Tool(_)));
        assert!(err.to_string().contains("timeout error"));
    }

    #[test]
    fn test_kind_serde_snake_case() {
        let json = serde_json::to_string(&ToolErrorKind::InvalidInput).unwrap();
        assert_eq!(json, "\"invalid_input\"");
    }
}

//! Tools module - capabilities the speech model can call
//!
//! # Overview
//!
//! - `Tool` trait: the interface every capability implements
//! - `ToolArgs`: schema-checked JSON object handed to a tool
//! - `ToolContext`: call id, deadline, cancellation and progress reporting
//! - `ToolRegistry`: name → capability map, shared read-only by all sessions
//! - `ToolExecutor`: per-session runner enforcing deadlines and concurrency
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use parley::broadcast::EventBroadcaster;
//! use parley::config::ToolsConfig;
//! use parley::tools::builtin::EchoTool;
//! use parley::tools::{ExecutionRequest, ToolArgs, ToolExecutor, ToolRegistry};
//! use parley::utils::metrics::MetricsCollector;
//!
//! # tokio_test::block_on(async {
//! let mut registry = ToolRegistry::new();
//! registry.register(EchoTool);
//!
//! let (tx, _rx) = tokio::sync::mpsc::channel(8);
//! let executor = ToolExecutor::new(
//!     "session-1",
//!     Arc::new(registry),
//!     Arc::new(EventBroadcaster::default()),
//!     ToolsConfig::default(),
//!     tx,
//!     Arc::new(MetricsCollector::new()),
//! );
//!
//! let args = ToolArgs::from_json(r#"{"message": "Hello!"}"#).unwrap();
//! let done = executor.execute(ExecutionRequest::new("call_1", "echo", args)).await;
//! assert_eq!(done.outcome.unwrap(), "Hello!");
//! # });
//! ```

pub mod announce;
pub mod builtin;
pub mod executor;
pub mod format;
mod registry;
mod types;

pub use executor::{ExecutionRequest, ExecutorEvent, Submission, ToolCompletion, ToolExecutor};
pub use format::FormattedResult;
pub use registry::ToolRegistry;
pub use types::{
    CallStatus, ExecutionTier, ProgressReporter, Tool, ToolArgs, ToolContext, ToolDefinition,
    ToolMetadata, ToolSafety,
};

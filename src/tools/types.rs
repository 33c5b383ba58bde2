//! Tool types for Parley
//!
//! This module defines the `Tool` trait every capability implements, the
//! schema-checked argument map handed to it, and the `ToolContext` carrying
//! deadline, cancellation and progress reporting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;

/// Which default deadline applies to a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTier {
    /// Quick lookups answered within one conversational beat.
    #[default]
    Direct,
    /// Long-running work handed to another agent or service.
    Delegated,
}

/// Whether a tool may run under the `safe_only` approval policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSafety {
    /// Read-only, no side effects.
    #[default]
    Safe,
    /// Modifies external state (files, commands, messages).
    Dangerous,
}

/// Lifecycle of a single tool call. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Succeeded | CallStatus::Failed | CallStatus::TimedOut
        )
    }

    /// Pending may run or fail outright; running may end any way; terminal
    /// states never change.
    pub fn can_advance_to(&self, next: CallStatus) -> bool {
        match (self, next) {
            (CallStatus::Pending, CallStatus::Running) => true,
            (CallStatus::Pending, CallStatus::Failed) => true,
            (CallStatus::Running, n) => n.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Pending => "pending",
            CallStatus::Running => "running",
            CallStatus::Succeeded => "succeeded",
            CallStatus::Failed => "failed",
            CallStatus::TimedOut => "timed_out",
        }
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability metadata consulted by the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolMetadata {
    pub tier: ExecutionTier,
    pub safety: ToolSafety,
    /// Overrides the tier's default deadline.
    pub timeout: Option<Duration>,
    /// The tool observes `ToolContext::cancellation`.
    pub cancellable: bool,
    /// Spoken before the call starts, instead of the announcement table.
    pub announcement: Option<String>,
}

/// Tool definition advertised to the speech model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Tool arguments: a JSON object checked against the tool's `required` list.
///
/// Tools convert to their own typed struct with [`ToolArgs::parse`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolArgs(Map<String, Value>);

impl ToolArgs {
    /// Parse the raw `arguments_json` string sent by the speech model.
    ///
    /// An empty string is treated as `{}`; anything that is not a JSON
    /// object is `invalid_input`.
    pub fn from_json(raw: &str) -> Result<Self, ToolError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Ok(Self(map)),
            Ok(other) => Err(ToolError::invalid_input(format!(
                "Arguments must be a JSON object, got {}",
                json_type_name(&other)
            ))),
            Err(e) => Err(ToolError::invalid_input(format!(
                "Arguments are not valid JSON: {}",
                e
            ))),
        }
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Check the `required` list of a JSON schema `parameters` object.
    pub fn check_required(&self, schema: &Value) -> Result<(), ToolError> {
        let missing: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|req| {
                req.iter()
                    .filter_map(Value::as_str)
                    .filter(|key| self.0.get(*key).map_or(true, Value::is_null))
                    .collect()
            })
            .unwrap_or_default();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ToolError::invalid_input(format!(
                "Missing required argument(s): {}",
                missing.join(", ")
            )))
        }
    }

    /// Convert into a concrete argument struct.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ToolError> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| ToolError::invalid_input(e.to_string()))
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Handle a tool uses to publish a completion percentage.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<Option<u8>>>,
}

impl ProgressReporter {
    /// A reporter plus the receiver the executor polls when emitting progress.
    pub fn channel() -> (Self, watch::Receiver<Option<u8>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Report progress; values above 100 are clamped.
    pub fn report(&self, percent: u8) {
        self.tx.send_replace(Some(percent.min(100)));
    }
}

/// Context provided to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub call_id: String,
    pub session_id: String,
    /// Absolute deadline; work past it is discarded.
    pub deadline: Instant,
    /// Cancelled on timeout (cancellable tools), user cancel or teardown.
    pub cancellation: CancellationToken,
    pub progress: ProgressReporter,
}

impl ToolContext {
    /// Context for running a tool outside the executor (tests, CLI).
    pub fn detached(call_id: impl Into<String>, timeout: Duration) -> Self {
        let (progress, _rx) = ProgressReporter::channel();
        Self {
            call_id: call_id.into(),
            session_id: String::new(),
            deadline: Instant::now() + timeout,
            cancellation: CancellationToken::new(),
            progress,
        }
    }

    /// Time left until the deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Trait that all tools must implement.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
/// use parley::error::ToolError;
/// use parley::tools::{Tool, ToolArgs, ToolContext};
///
/// struct Weather;
///
/// #[async_trait]
/// impl Tool for Weather {
///     fn name(&self) -> &str { "weather" }
///     fn description(&self) -> &str { "Current weather for a city" }
///     fn parameters(&self) -> Value {
///         json!({
///             "type": "object",
///             "properties": {"city": {"type": "string"}},
///             "required": ["city"]
///         })
///     }
///     async fn invoke(&self, args: ToolArgs, _ctx: &ToolContext) -> Result<Value, ToolError> {
///         let city = args.get_str("city").unwrap_or_default();
///         Ok(json!({"city": city, "forecast": "sunny"}))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the speech model calls the tool by.
    fn name(&self) -> &str;

    /// Description sent to the speech model.
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn parameters(&self) -> Value;

    /// Run the tool. Arguments have already passed the `required` check.
    async fn invoke(&self, args: ToolArgs, ctx: &ToolContext) -> Result<Value, ToolError>;

    /// Execution tier, safety class and overrides. Defaults to a safe,
    /// non-cancellable direct tool.
    fn metadata(&self) -> ToolMetadata {
        ToolMetadata::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_args_from_json_object() {
        let args = ToolArgs::from_json(r#"{"q": "x", "limit": 3}"#).unwrap();
        assert_eq!(args.get_str("q"), Some("x"));
        assert_eq!(args.get("limit"), Some(&json!(3)));
    }

    #[test]
    fn test_args_from_empty_string() {
        let args = ToolArgs::from_json("  ").unwrap();
        assert!(args.as_map().is_empty());
    }

    #[test]
    fn test_args_rejects_non_object() {
        let err = ToolArgs::from_json("[1,2]").unwrap_err();
        assert_eq!(err.kind, crate::error::ToolErrorKind::InvalidInput);
        assert!(err.message.contains("array"));
    }

    #[test]
    fn test_args_rejects_bad_json() {
        let err = ToolArgs::from_json("{\"q\": ").unwrap_err();
        assert!(err.message.contains("not valid JSON"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_check_required() {
        let schema = json!({"type": "object", "required": ["q", "lang"]});
        let args = ToolArgs::from_json(r#"{"q": "x", "lang": null}"#).unwrap();
        let err = args.check_required(&schema).unwrap_err();
        assert_eq!(err.message, "Missing required argument(s): lang");

        let ok = ToolArgs::from_json(r#"{"q": "x", "lang": "en"}"#).unwrap();
        assert!(ok.check_required(&schema).is_ok());
        assert!(ok.check_required(&json!({"type": "object"})).is_ok());
    }

    #[test]
    fn test_parse_typed() {
        #[derive(Deserialize)]
        struct Lookup {
            q: String,
            #[serde(default)]
            limit: Option<u32>,
        }
        let args = ToolArgs::from_json(r#"{"q": "x"}"#).unwrap();
        let typed: Lookup = args.parse().unwrap();
        assert_eq!(typed.q, "x");
        assert!(typed.limit.is_none());

        let bad = ToolArgs::from_json(r#"{"q": 5}"#).unwrap();
        assert!(bad.parse::<Lookup>().is_err());
    }

    #[test]
    fn test_progress_reporter_clamps() {
        let (reporter, rx) = ProgressReporter::channel();
        assert_eq!(*rx.borrow(), None);
        reporter.report(140);
        assert_eq!(*rx.borrow(), Some(100));
    }

    #[tokio::test]
    async fn test_detached_context_remaining() {
        let ctx = ToolContext::detached("call_1", Duration::from_secs(5));
        assert!(ctx.remaining() <= Duration::from_secs(5));
        assert!(!ctx.cancellation.is_cancelled());
    }

    #[test]
    fn test_call_status_is_monotone() {
        use CallStatus::*;
        assert!(Pending.can_advance_to(Running));
        assert!(Pending.can_advance_to(Failed));
        assert!(!Pending.can_advance_to(Succeeded));
        assert!(Running.can_advance_to(TimedOut));
        assert!(!Running.can_advance_to(Pending));
        assert!(!Succeeded.can_advance_to(Failed));
        assert!(!TimedOut.can_advance_to(Running));
        assert_eq!(TimedOut.to_string(), "timed_out");
    }

    #[test]
    fn test_metadata_defaults() {
        let meta = ToolMetadata::default();
        assert_eq!(meta.tier, ExecutionTier::Direct);
        assert_eq!(meta.safety, ToolSafety::Safe);
        assert!(!meta.cancellable);
        assert!(meta.timeout.is_none());
    }
}

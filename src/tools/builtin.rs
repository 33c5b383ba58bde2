//! Built-in tools and the server-side cancel tool definition.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Tool, ToolArgs, ToolContext, ToolDefinition, ToolMetadata};
use crate::error::ToolError;

/// Name of the cancel tool handled by the orchestrator itself.
pub const CANCEL_TOOL_NAME: &str = "cancel_current_task";

/// Definition of the orchestrator-handled cancel tool.
pub fn cancel_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: CANCEL_TOOL_NAME.to_string(),
        description: "Cancel the currently running task. Use when the user says 'stop', \
                      'cancel', 'never mind' or otherwise wants to interrupt what you are \
                      doing. Call again with immediate=true if work keeps running."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "description": "Brief reason for cancelling (e.g. 'user requested')"
                },
                "immediate": {
                    "type": "boolean",
                    "description": "Stop without waiting for running work to wind down. Default false."
                }
            },
            "required": []
        }),
    }
}

/// Arguments of the cancel tool.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelArgs {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub immediate: bool,
}

/// A simple echo tool for testing purposes.
///
/// This tool echoes back any message provided to it.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes back the provided message"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo back"
                }
            },
            "required": ["message"]
        })
    }

    async fn invoke(&self, args: ToolArgs, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let message = args.get_str("message").unwrap_or_default();
        Ok(Value::String(message.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct WaitArgs {
    ms: u64,
    #[serde(default)]
    label: Option<String>,
}

/// Sleeps for `ms` milliseconds, reporting progress and honouring cancellation.
///
/// Handy for exercising timeouts and progress reporting from the CLI.
pub struct WaitTool;

const WAIT_STEPS: u64 = 20;

#[async_trait]
impl Tool for WaitTool {
    fn name(&self) -> &str {
        "wait"
    }

    fn description(&self) -> &str {
        "Waits for the given number of milliseconds, then reports how long it waited"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "ms": {"type": "integer", "minimum": 0},
                "label": {"type": "string"}
            },
            "required": ["ms"]
        })
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            cancellable: true,
            announcement: Some("Give me a moment.".to_string()),
            ..ToolMetadata::default()
        }
    }

    async fn invoke(&self, args: ToolArgs, ctx: &ToolContext) -> Result<Value, ToolError> {
        let args: WaitArgs = args.parse()?;
        let step = Duration::from_millis(args.ms / WAIT_STEPS);
        let remainder = Duration::from_millis(args.ms % WAIT_STEPS);

        for i in 0..WAIT_STEPS {
            tokio::select! {
                _ = ctx.cancellation.cancelled() => {
                    return Err(ToolError::cancelled(format!(
                        "wait cancelled after {}%",
                        i * 100 / WAIT_STEPS
                    )));
                }
                _ = tokio::time::sleep(step) => {}
            }
            ctx.progress.report(((i + 1) * 100 / WAIT_STEPS) as u8);
        }
        tokio::time::sleep(remainder).await;

        Ok(json!({
            "waited_ms": args.ms,
            "label": args.label,
        }))
    }
}

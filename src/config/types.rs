//! Configuration type definitions for Parley
//!
//! This module defines all configuration structs used by the orchestrator.
//! All types implement serde traits for JSON serialization and have sensible defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration struct for Parley
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session lifetime, budgets and protocol setup
    pub session: SessionConfig,
    /// Tool execution limits and policies
    pub tools: ToolsConfig,
    /// Context window accounting
    pub context: ContextConfig,
    /// Event fan-out
    pub broadcast: BroadcastConfig,
    /// Recovery snapshot persistence
    pub recovery: RecoveryConfig,
    /// Reconnect backoff
    pub reconnect: ReconnectConfig,
    /// Audio playback accounting
    pub playback: PlaybackConfig,
    /// Logging output
    pub logging: LoggingConfig,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Session lifetime and protocol setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Hard session length imposed by the speech model.
    pub max_duration_secs: u64,
    /// Broadcast a budget warning this long before the deadline.
    pub warning_before_secs: u64,
    /// Close the session after this long without any inbound event (0 disables).
    pub idle_timeout_secs: u64,
    /// Periodic recovery checkpoint interval (0 disables).
    pub checkpoint_interval_secs: u64,
    /// Completed tool calls kept for duplicate call-request answers.
    pub recent_results_capacity: usize,
    /// Upper bound on simultaneously tracked tool calls.
    pub max_active_calls: usize,
    /// Buffer size for the inbound, outbound, executor and control channels.
    pub channel_buffer: usize,
    /// System instructions sent in session-configure.
    pub instructions: String,
    /// Output voice name.
    pub voice: String,
    /// Server-side voice activity detection.
    pub turn_detection: TurnDetectionConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 60 * 60,
            warning_before_secs: 5 * 60,
            idle_timeout_secs: 15 * 60,
            checkpoint_interval_secs: 120,
            recent_results_capacity: 32,
            max_active_calls: 16,
            channel_buffer: 256,
            instructions: "You are a helpful voice assistant. Keep spoken answers short and \
                           tell the user before you start work that takes a while."
                .to_string(),
            voice: "marin".to_string(),
            turn_detection: TurnDetectionConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn warning_before(&self) -> Duration {
        Duration::from_secs(self.warning_before_secs)
    }
}

/// Voice activity detection settings forwarded to the speech model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TurnDetectionConfig {
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

// ============================================================================
// Tools Configuration
// ============================================================================

/// Which tool calls may run without a human in the loop.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    /// Every registered tool may run.
    #[default]
    AutoApprove,
    /// Tools marked dangerous are refused with a permission error.
    SafeOnly,
}

/// Tool execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Maximum executions in flight per session; excess calls queue FIFO.
    pub max_concurrent: usize,
    /// Default deadline for direct-tier tools.
    pub direct_timeout_ms: u64,
    /// Default deadline for delegated-tier tools.
    pub delegated_timeout_ms: u64,
    /// Calls running longer than this start emitting progress.
    pub long_running_threshold_ms: u64,
    /// Cadence of `tool.progress` broadcasts once long-running.
    pub progress_interval_ms: u64,
    /// Successful output is truncated to this many characters.
    pub max_output_chars: usize,
    /// Approval policy applied before execution.
    pub approval: ApprovalPolicy,
    /// Advertise the built-in `cancel_current_task` tool.
    pub expose_cancel_tool: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            direct_timeout_ms: 60_000,
            delegated_timeout_ms: 300_000,
            long_running_threshold_ms: 5_000,
            progress_interval_ms: 5_000,
            max_output_chars: 4_000,
            approval: ApprovalPolicy::AutoApprove,
            expose_cancel_tool: true,
        }
    }
}

// ============================================================================
// Context Configuration
// ============================================================================

/// Context window accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Hard token ceiling of the speech model's context.
    pub ceiling_tokens: usize,
    /// Tokens reserved for the model's own output.
    pub headroom_tokens: usize,
    /// Fraction (0.0-1.0) of the ceiling that triggers pruning.
    pub prune_threshold: f64,
    /// Most recent entries that are never summarized.
    pub keep_recent: usize,
    /// Token estimate of a summary as a fraction of what it replaced.
    pub summary_ratio: f64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            ceiling_tokens: 32_000,
            headroom_tokens: 1_024,
            prune_threshold: 0.80,
            keep_recent: 6,
            summary_ratio: 0.10,
        }
    }
}

// ============================================================================
// Broadcast Configuration
// ============================================================================

/// Event fan-out settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Per-subscriber queue length; the oldest event is dropped on overflow.
    pub subscriber_queue_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: 256,
        }
    }
}

// ============================================================================
// Recovery Configuration
// ============================================================================

/// Recovery snapshot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Persist snapshots at all.
    pub enabled: bool,
    /// Snapshot directory; defaults to `~/.parley/recovery`.
    pub dir: Option<String>,
    /// Turns kept verbatim in each snapshot.
    pub verbatim_turns: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            verbatim_turns: 6,
        }
    }
}

// ============================================================================
// Reconnect Configuration
// ============================================================================

/// Exponential backoff for transport reconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 15_000,
        }
    }
}

// ============================================================================
// Playback Configuration
// ============================================================================

/// Output audio format used to convert flushed bytes into milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// 24 kHz mono PCM16 is 48 bytes per millisecond.
    pub bytes_per_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self { bytes_per_ms: 48 }
    }
}

// ============================================================================
// Logging Configuration
// ============================================================================

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Pretty,
    #[default]
    Component,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Append logs to this file instead of stderr.
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Component,
            level: "info".to_string(),
            file: None,
        }
    }
}

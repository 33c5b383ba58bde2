//! Session metrics collector.
//!
//! Tracks tool execution statistics and orchestration counters for one
//! session. Uses interior mutability so all recording methods take `&self`
//! and the collector can be shared with executor tasks via `Arc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Per-tool execution statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolMetrics {
    /// Total number of calls made to this tool.
    pub call_count: u64,
    /// Number of calls that ended in any failure, timeouts included.
    pub error_count: u64,
    /// Number of calls that hit their deadline.
    pub timeout_count: u64,
    /// Cumulative duration of all calls.
    #[serde(skip)]
    pub total_duration: Duration,
    #[serde(skip)]
    pub min_duration: Option<Duration>,
    #[serde(skip)]
    pub max_duration: Option<Duration>,
}

impl ToolMetrics {
    /// Returns the average call duration, or `None` if no calls have been recorded.
    pub fn average_duration(&self) -> Option<Duration> {
        if self.call_count == 0 {
            return None;
        }
        Some(self.total_duration / self.call_count as u32)
    }

    /// Returns the success rate as a value between 0.0 and 1.0.
    ///
    /// If no calls have been recorded, returns 1.0 (100%).
    pub fn success_rate(&self) -> f64 {
        if self.call_count == 0 {
            return 1.0;
        }
        (self.call_count - self.error_count) as f64 / self.call_count as f64
    }
}

/// How a recorded tool call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

/// Session-level metrics collector.
#[derive(Debug)]
pub struct MetricsCollector {
    tools: Mutex<HashMap<String, ToolMetrics>>,
    session_start: Instant,
    invalid_transitions: AtomicU64,
    prune_passes: AtomicU64,
    interruptions: AtomicU64,
    reconnects: AtomicU64,
    duplicate_calls: AtomicU64,
}

/// Point-in-time copy of the counters, suitable for logging and summaries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub session_secs: u64,
    pub tool_calls: u64,
    pub tool_errors: u64,
    pub tool_timeouts: u64,
    pub invalid_transitions: u64,
    pub prune_passes: u64,
    pub interruptions: u64,
    pub reconnects: u64,
    pub duplicate_calls: u64,
}

impl MetricsCollector {
    /// Creates a new metrics collector. The session clock starts immediately.
    pub fn new() -> Self {
        Self {
            tools: Mutex::new(HashMap::new()),
            session_start: Instant::now(),
            invalid_transitions: AtomicU64::new(0),
            prune_passes: AtomicU64::new(0),
            interruptions: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            duplicate_calls: AtomicU64::new(0),
        }
    }

    /// Records a single finished tool call.
    pub fn record_tool_call(&self, tool_name: &str, duration: Duration, outcome: CallOutcome) {
        let mut tools = self.tools.lock();
        let metrics = tools.entry(tool_name.to_string()).or_default();

        metrics.call_count += 1;
        if outcome != CallOutcome::Succeeded {
            metrics.error_count += 1;
        }
        if outcome == CallOutcome::TimedOut {
            metrics.timeout_count += 1;
        }
        metrics.total_duration += duration;

        metrics.min_duration = Some(match metrics.min_duration {
            Some(current) => current.min(duration),
            None => duration,
        });
        metrics.max_duration = Some(match metrics.max_duration {
            Some(current) => current.max(duration),
            None => duration,
        });
    }

    pub fn record_invalid_transition(&self) {
        self.invalid_transitions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_prune(&self) {
        self.prune_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_interruption(&self) {
        self.interruptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_call(&self) {
        self.duplicate_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a clone of the metrics for a specific tool, or `None` if the
    /// tool has never been called.
    pub fn tool_metrics(&self, tool_name: &str) -> Option<ToolMetrics> {
        self.tools.lock().get(tool_name).cloned()
    }

    /// Returns the sum of `call_count` across all tools.
    pub fn total_tool_calls(&self) -> u64 {
        self.tools.lock().values().map(|m| m.call_count).sum()
    }

    pub fn invalid_transitions(&self) -> u64 {
        self.invalid_transitions.load(Ordering::Relaxed)
    }

    /// Returns the elapsed time since the collector was created.
    pub fn session_duration(&self) -> Duration {
        self.session_start.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let tools = self.tools.lock();
        MetricsSnapshot {
            session_secs: self.session_duration().as_secs(),
            tool_calls: tools.values().map(|m| m.call_count).sum(),
            tool_errors: tools.values().map(|m| m.error_count).sum(),
            tool_timeouts: tools.values().map(|m| m.timeout_count).sum(),
            invalid_transitions: self.invalid_transitions.load(Ordering::Relaxed),
            prune_passes: self.prune_passes.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            duplicate_calls: self.duplicate_calls.load(Ordering::Relaxed),
        }
    }

    /// Produces a human-readable summary of the session metrics.
    ///
    /// Example output:
    /// ```text
    /// Session: 312s | Tools: 7 calls (1 errors, 1 timeouts) | Interruptions: 2 | Reconnects: 0
    ///   lookup: 4 calls, avg 180ms, 100% success
    ///   delegate: 3 calls, avg 21.4s, 67% success
    /// ```
    pub fn summary(&self) -> String {
        let snap = self.snapshot();
        let mut summary = format!(
            "Session: {}s | Tools: {} calls ({} errors, {} timeouts) | Interruptions: {} | Reconnects: {}",
            snap.session_secs,
            snap.tool_calls,
            snap.tool_errors,
            snap.tool_timeouts,
            snap.interruptions,
            snap.reconnects,
        );

        let tools = self.tools.lock();
        let mut entries: Vec<_> = tools.iter().collect();
        entries.sort_by(|a, b| b.1.call_count.cmp(&a.1.call_count).then(a.0.cmp(b.0)));

        for (name, metrics) in entries {
            let avg = match metrics.average_duration() {
                Some(d) => format_duration(d),
                None => "N/A".to_string(),
            };
            let success_pct = (metrics.success_rate() * 100.0).round() as u64;
            summary.push_str(&format!(
                "\n  {}: {} calls, avg {}, {}% success",
                name, metrics.call_count, avg, success_pct,
            ));
        }

        summary
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Formats a duration in a human-friendly way.
///
/// - Under 1ms: shows microseconds (e.g. "500us")
/// - Under 1s: shows milliseconds (e.g. "200ms")
/// - 1s or more: shows seconds with one decimal (e.g. "1.2s")
pub fn format_duration(d: Duration) -> String {
    let micros = d.as_micros();
    if micros < 1_000 {
        format!("{}us", micros)
    } else if micros < 1_000_000 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

/// Convert a `Duration` to milliseconds, rounding up so fast calls never report 0ms.
pub fn duration_ceil_ms(d: Duration) -> u64 {
    let micros = d.as_micros();
    if micros == 0 {
        return 0;
    }
    micros.div_ceil(1000) as u64
}

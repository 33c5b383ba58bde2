//! Per-session tool executor.
//!
//! Runs registered tools as independent tasks under a deadline, with at most
//! `max_concurrent` calls in flight (excess calls wait on a FIFO semaphore).
//! Lifecycle messages go back to the owning session over a single-consumer
//! channel; progress and queueing are broadcast directly.
//!
//! Each call gets two cancellation tokens. The tool token is handed to the
//! tool and asks it to wind down; the abort token, its parent, makes the
//! executor stop waiting and report the call cancelled right away. Both hang
//! off the executor's session token, so [`ToolExecutor::shutdown`] reaches
//! every call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CallStatus, ProgressReporter, Tool, ToolArgs, ToolContext, ToolMetadata, ToolSafety};
use super::{ExecutionTier, ToolRegistry};
use crate::broadcast::{topics, EventBroadcaster};
use crate::config::{ApprovalPolicy, ToolsConfig};
use crate::error::{ToolError, ToolErrorKind};
use crate::utils::metrics::{format_duration, CallOutcome, MetricsCollector};

/// A call handed to the executor.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub call_id: String,
    pub tool_name: String,
    pub args: ToolArgs,
    /// Overrides both the tool's metadata and its tier default.
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    pub fn new(call_id: impl Into<String>, tool_name: impl Into<String>, args: ToolArgs) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            args,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Final outcome of one call.
#[derive(Debug, Clone)]
pub struct ToolCompletion {
    pub call_id: String,
    pub tool_name: String,
    pub outcome: Result<Value, ToolError>,
    /// Time spent executing, excluding time queued for a slot.
    pub duration: Duration,
}

impl ToolCompletion {
    pub fn succeeded(call_id: &str, tool_name: &str, value: Value) -> Self {
        Self {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            outcome: Ok(value),
            duration: Duration::ZERO,
        }
    }

    pub fn failed(call_id: &str, tool_name: &str, err: ToolError) -> Self {
        Self {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            outcome: Err(err),
            duration: Duration::ZERO,
        }
    }

    pub fn status(&self) -> CallStatus {
        match &self.outcome {
            Ok(_) => CallStatus::Succeeded,
            Err(e) if e.kind == ToolErrorKind::Timeout => CallStatus::TimedOut,
            Err(_) => CallStatus::Failed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Lifecycle messages delivered to the owning session, in order per call.
#[derive(Debug)]
pub enum ExecutorEvent {
    /// A slot was acquired and the tool was invoked.
    Running { call_id: String, started_at: Instant },
    Completed(ToolCompletion),
}

/// Result of [`ToolExecutor::submit`].
#[derive(Debug)]
pub enum Submission {
    /// The call runs in the background; its events arrive on the channel.
    Spawned,
    /// The call failed before it could start (unknown tool, policy, arguments).
    Rejected(ToolCompletion),
}

struct CallHandle {
    tool_name: String,
    tool_token: CancellationToken,
    abort_token: CancellationToken,
}

struct PreparedCall {
    request: ExecutionRequest,
    tool: Arc<dyn Tool>,
    timeout: Duration,
    tool_token: CancellationToken,
    abort_token: CancellationToken,
}

struct ExecutorInner {
    session_id: String,
    registry: Arc<ToolRegistry>,
    broadcaster: Arc<EventBroadcaster>,
    config: ToolsConfig,
    slots: Arc<Semaphore>,
    events: mpsc::Sender<ExecutorEvent>,
    session_token: CancellationToken,
    metrics: Arc<MetricsCollector>,
    in_flight: Mutex<HashMap<String, CallHandle>>,
}

/// Tool executor for one session. Cheap to clone.
#[derive(Clone)]
pub struct ToolExecutor {
    inner: Arc<ExecutorInner>,
}

impl ToolExecutor {
    pub fn new(
        session_id: impl Into<String>,
        registry: Arc<ToolRegistry>,
        broadcaster: Arc<EventBroadcaster>,
        config: ToolsConfig,
        events: mpsc::Sender<ExecutorEvent>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            inner: Arc::new(ExecutorInner {
                session_id: session_id.into(),
                registry,
                broadcaster,
                config,
                slots,
                events,
                session_token: CancellationToken::new(),
                metrics,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Deadline a call to `tool` gets when the request does not override it.
    pub fn timeout_for(&self, meta: &ToolMetadata) -> Duration {
        meta.timeout.unwrap_or_else(|| match meta.tier {
            ExecutionTier::Direct => Duration::from_millis(self.inner.config.direct_timeout_ms),
            ExecutionTier::Delegated => {
                Duration::from_millis(self.inner.config.delegated_timeout_ms)
            }
        })
    }

    /// Run a call in the background. Lifecycle events are sent on the
    /// executor channel; calls that cannot start are returned directly.
    pub fn submit(&self, request: ExecutionRequest) -> Submission {
        let prepared = match self.prepare(request) {
            Ok(p) => p,
            Err(completion) => return Submission::Rejected(completion),
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let completion = run_call(&inner, prepared).await;
            if inner
                .events
                .send(ExecutorEvent::Completed(completion))
                .await
                .is_err()
            {
                debug!(session_id = %inner.session_id, "Executor channel closed, completion dropped");
            }
        });
        Submission::Spawned
    }

    /// Run a call to completion on the current task.
    pub async fn execute(&self, request: ExecutionRequest) -> ToolCompletion {
        match self.prepare(request) {
            Ok(prepared) => run_call(&self.inner, prepared).await,
            Err(completion) => completion,
        }
    }

    /// Cancel every queued or running call. Returns the affected tool names.
    ///
    /// Without `immediate`, tools are asked to stop and the executor waits
    /// for them to return. With it, the executor reports them cancelled now
    /// and discards whatever they produce later.
    pub fn cancel_all(&self, immediate: bool) -> Vec<String> {
        let in_flight = self.inner.in_flight.lock();
        let mut names = Vec::with_capacity(in_flight.len());
        for handle in in_flight.values() {
            handle.tool_token.cancel();
            if immediate {
                handle.abort_token.cancel();
            }
            names.push(handle.tool_name.clone());
        }
        names.sort();
        names
    }

    /// Calls that are queued or running, as `(call_id, tool_name)`.
    pub fn in_flight(&self) -> Vec<(String, String)> {
        let mut calls: Vec<(String, String)> = self
            .inner
            .in_flight
            .lock()
            .iter()
            .map(|(id, h)| (id.clone(), h.tool_name.clone()))
            .collect();
        calls.sort();
        calls
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Abort every call; used on session teardown.
    pub fn shutdown(&self) {
        self.inner.session_token.cancel();
    }

    /// Lookup, approval and argument checks. Everything that can fail before
    /// a slot is taken.
    fn prepare(&self, request: ExecutionRequest) -> Result<PreparedCall, ToolCompletion> {
        let inner = &self.inner;
        let reject = |request: &ExecutionRequest, err: ToolError| {
            warn!(
                session_id = %inner.session_id,
                call_id = %request.call_id,
                tool = %request.tool_name,
                kind = %err.kind,
                "Tool call rejected: {}",
                err.message
            );
            inner
                .metrics
                .record_tool_call(&request.tool_name, Duration::ZERO, CallOutcome::Failed);
            ToolCompletion::failed(&request.call_id, &request.tool_name, err)
        };

        let Some(tool) = inner.registry.get(&request.tool_name) else {
            let err = ToolError::not_found(&request.tool_name);
            return Err(reject(&request, err));
        };
        let meta = tool.metadata();

        if inner.config.approval == ApprovalPolicy::SafeOnly && meta.safety == ToolSafety::Dangerous
        {
            let err = ToolError::permission(format!(
                "{} modifies external state and this session only allows safe tools",
                request.tool_name
            ));
            return Err(reject(&request, err));
        }

        if let Err(err) = request.args.check_required(&tool.parameters()) {
            return Err(reject(&request, err));
        }

        let timeout = request.timeout.unwrap_or_else(|| self.timeout_for(&meta));
        let abort_token = inner.session_token.child_token();
        let tool_token = abort_token.child_token();
        inner.in_flight.lock().insert(
            request.call_id.clone(),
            CallHandle {
                tool_name: request.tool_name.clone(),
                tool_token: tool_token.clone(),
                abort_token: abort_token.clone(),
            },
        );

        Ok(PreparedCall {
            request,
            tool,
            timeout,
            tool_token,
            abort_token,
        })
    }
}

async fn run_call(inner: &ExecutorInner, call: PreparedCall) -> ToolCompletion {
    let PreparedCall {
        request,
        tool,
        timeout,
        tool_token,
        abort_token,
    } = call;
    let ExecutionRequest {
        call_id,
        tool_name,
        args,
        ..
    } = request;

    let outcome = match acquire_slot(inner, &call_id, &tool_name, &tool_token).await {
        Ok(permit) => {
            let started_at = Instant::now();
            if inner
                .events
                .send(ExecutorEvent::Running {
                    call_id: call_id.clone(),
                    started_at,
                })
                .await
                .is_err()
            {
                debug!(session_id = %inner.session_id, call_id = %call_id, "Executor channel closed");
            }
            let (progress, progress_rx) = ProgressReporter::channel();
            let ctx = ToolContext {
                call_id: call_id.clone(),
                session_id: inner.session_id.clone(),
                deadline: started_at + timeout,
                cancellation: tool_token.clone(),
                progress,
            };
            let outcome = supervise(inner, tool, args, ctx, progress_rx, &abort_token).await;
            drop(permit);
            (outcome, started_at.elapsed())
        }
        Err(err) => (Err(err), Duration::ZERO),
    };
    let (outcome, duration) = outcome;

    inner.in_flight.lock().remove(&call_id);

    let completion = ToolCompletion {
        call_id,
        tool_name,
        outcome,
        duration,
    };
    let status = completion.status();
    let recorded = match status {
        CallStatus::Succeeded => CallOutcome::Succeeded,
        CallStatus::TimedOut => CallOutcome::TimedOut,
        _ => CallOutcome::Failed,
    };
    inner
        .metrics
        .record_tool_call(&completion.tool_name, duration, recorded);
    info!(
        session_id = %inner.session_id,
        call_id = %completion.call_id,
        tool = %completion.tool_name,
        status = %status,
        duration = %format_duration(duration),
        "Tool call finished"
    );
    completion
}

/// Wait for a concurrency slot, broadcasting `tool.queued` if none is free.
async fn acquire_slot(
    inner: &ExecutorInner,
    call_id: &str,
    tool_name: &str,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit, ToolError> {
    if let Ok(permit) = Arc::clone(&inner.slots).try_acquire_owned() {
        return Ok(permit);
    }

    debug!(session_id = %inner.session_id, call_id = %call_id, tool = %tool_name, "Waiting for a tool slot");
    inner.broadcaster.publish(
        topics::TOOL_QUEUED,
        Some(inner.session_id.as_str()),
        json!({
            "call_id": call_id,
            "tool": tool_name,
            "max_concurrent": inner.config.max_concurrent,
        }),
    );

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ToolError::cancelled("Cancelled while waiting to start")),
        permit = Arc::clone(&inner.slots).acquire_owned() => {
            permit.map_err(|_| ToolError::internal("Tool slots closed"))
        }
    }
}

/// Drive one invocation: deadline, progress ticks and abort.
async fn supervise(
    inner: &ExecutorInner,
    tool: Arc<dyn Tool>,
    args: ToolArgs,
    ctx: ToolContext,
    progress_rx: watch::Receiver<Option<u8>>,
    abort: &CancellationToken,
) -> Result<Value, ToolError> {
    let call_id = ctx.call_id.clone();
    let tool_name = tool.name().to_string();
    let cancellable = tool.metadata().cancellable;
    let tool_token = ctx.cancellation.clone();
    let started = Instant::now();
    let deadline = ctx.deadline;
    let timeout = ctx.remaining();

    let mut handle = tokio::spawn(async move { tool.invoke(args, &ctx).await });

    let threshold = Duration::from_millis(inner.config.long_running_threshold_ms);
    let period = Duration::from_millis(inner.config.progress_interval_ms.max(1));
    let mut ticker = tokio::time::interval_at(started + threshold, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let expiry = tokio::time::sleep_until(deadline);
    tokio::pin!(expiry);

    loop {
        tokio::select! {
            joined = &mut handle => {
                return match joined {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => {
                        warn!(call_id = %call_id, tool = %tool_name, "Tool panicked");
                        Err(ToolError::internal(format!("{} panicked", tool_name)))
                    }
                    Err(_) => Err(ToolError::cancelled("Tool task was aborted")),
                };
            }
            _ = &mut expiry => {
                if cancellable {
                    tool_token.cancel();
                }
                discard_late(handle, call_id, tool_name.clone());
                return Err(ToolError::timeout(format!(
                    "{} did not finish within {}",
                    tool_name,
                    format_duration(timeout)
                )));
            }
            _ = abort.cancelled() => {
                discard_late(handle, call_id, tool_name);
                return Err(ToolError::cancelled("Cancelled before completion"));
            }
            _ = ticker.tick() => {
                let percent = *progress_rx.borrow();
                inner.broadcaster.publish(
                    topics::TOOL_PROGRESS,
                    Some(inner.session_id.as_str()),
                    json!({
                        "call_id": call_id,
                        "tool": tool_name,
                        "elapsed_ms": started.elapsed().as_millis() as u64,
                        "percent": percent,
                    }),
                );
            }
        }
    }
}

/// Let a tool that outlived its call finish in the background; its result
/// is logged and dropped.
fn discard_late(
    handle: JoinHandle<Result<Value, ToolError>>,
    call_id: String,
    tool_name: String,
) {
    tokio::spawn(async move {
        match handle.await {
            Ok(Ok(_)) => debug!(call_id = %call_id, tool = %tool_name, "Discarding late tool result"),
            Ok(Err(e)) => debug!(call_id = %call_id, tool = %tool_name, "Late tool failure ignored: {}", e),
            Err(_) => debug!(call_id = %call_id, tool = %tool_name, "Late tool task ended abnormally"),
        }
    });
}

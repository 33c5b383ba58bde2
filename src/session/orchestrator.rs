//! The per-session orchestrator task.
//!
//! One [`SessionOrchestrator`] owns one voice session: its state machine,
//! tool calls, context mirror and playback accounting. Everything that
//! mutates the session happens inside [`SessionOrchestrator::run`], which
//! waits on four sources at once:
//!
//! - the speech link (inbound protocol events)
//! - the tool executor channel (`Running` / `Completed`)
//! - the control channel (close, playback progress, status queries)
//! - timers (budget warning and rotation, periodic checkpoints, idle timeout)
//!
//! Transport failures and budget expiry leave the loop long enough to
//! checkpoint, reconnect and seed the new connection, then processing
//! resumes where it left off.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::reconnect::backoff_delay;
use super::{
    CallSummary, EndReason, PlaybackTracker, SessionDirectory, SessionState, SessionStatus,
    SessionSummary, ToolCall,
};
use crate::broadcast::{topics, EventBroadcaster};
use crate::config::Config;
use crate::context::{ContextEntry, ContextWindow, PruneOutcome, Role};
use crate::error::{ParleyError, Result, ToolError};
use crate::protocol::{
    ChunkKind, InboundEvent, OutboundEvent, SessionConfigure, SpeechConnector, SpeechLink,
};
use crate::recovery::{CheckpointReason, PendingToolCall, RecoveryStore, SessionRecoveryRecord};
use crate::tools::announce::announce;
use crate::tools::builtin::{cancel_tool_definition, CancelArgs, CANCEL_TOOL_NAME};
use crate::tools::{
    CallStatus, ExecutionRequest, ExecutorEvent, FormattedResult, Submission, ToolArgs,
    ToolCompletion, ToolExecutor, ToolRegistry,
};
use crate::utils::metrics::{duration_ceil_ms, MetricsCollector};

/// Out-of-band requests to a running session.
#[derive(Debug)]
pub enum SessionControl {
    Close { reason: EndReason },
    /// The output device started playing the current assistant item.
    PlaybackStarted,
    /// The output device consumed `bytes` more audio.
    PlaybackFlushed { bytes: u64 },
    CancelTools { immediate: bool },
    SetPreference { key: String, value: String },
    Status(oneshot::Sender<SessionStatus>),
}

/// Shared collaborators injected into every orchestrator.
#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<Config>,
    pub registry: Arc<ToolRegistry>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub connector: Arc<dyn SpeechConnector>,
    pub store: Option<Arc<dyn RecoveryStore>>,
    pub directory: SessionDirectory,
}

enum Wake {
    Inbound(Option<InboundEvent>),
    Executor(Option<ExecutorEvent>),
    Control(Option<SessionControl>),
    BudgetWarning,
    BudgetExpired,
    Checkpoint,
    Idle,
}

enum Flow {
    Continue,
    End(EndReason),
    TransportLost(String),
    Rotate,
}

/// Single writer for one voice session.
pub struct SessionOrchestrator {
    session_id: String,
    deps: SessionDeps,
    state: SessionState,
    created_at: DateTime<Utc>,
    last_event_at: Instant,
    budget_deadline: Instant,
    warning_sent: bool,
    /// Incremented on every successful connection.
    epoch: u64,
    link: Option<SpeechLink>,
    active: HashMap<String, ToolCall>,
    seen: HashSet<String>,
    recent: VecDeque<(String, FormattedResult)>,
    context: ContextWindow,
    playback: PlaybackTracker,
    /// Transcript of the response currently being spoken.
    transcript: String,
    preferences: BTreeMap<String, String>,
    resume_seed: Option<String>,
    executor: ToolExecutor,
    executor_rx: mpsc::Receiver<ExecutorEvent>,
    control_rx: mpsc::Receiver<SessionControl>,
    metrics: Arc<MetricsCollector>,
}

impl SessionOrchestrator {
    /// Build an orchestrator. With `resume`, the context and preferences are
    /// restored from the record and its seed message is sent after the first
    /// connection is configured.
    pub fn new(
        session_id: impl Into<String>,
        deps: SessionDeps,
        control_rx: mpsc::Receiver<SessionControl>,
        resume: Option<SessionRecoveryRecord>,
    ) -> Self {
        let session_id = session_id.into();
        let config = Arc::clone(&deps.config);
        let metrics = Arc::new(MetricsCollector::new());
        let (executor_tx, executor_rx) = mpsc::channel(config.session.channel_buffer.max(1));
        let executor = ToolExecutor::new(
            session_id.clone(),
            Arc::clone(&deps.registry),
            Arc::clone(&deps.broadcaster),
            config.tools.clone(),
            executor_tx,
            Arc::clone(&metrics),
        );

        let mut context = ContextWindow::new(&config.context);
        let mut preferences = BTreeMap::new();
        let mut resume_seed = None;
        if let Some(record) = resume {
            info!(
                session_id = %session_id,
                saved_at = %record.saved_at,
                reason = %record.reason,
                "Resuming from recovery record"
            );
            resume_seed = Some(record.seed_message());
            context.reseed(&record.context_summary, record.last_turns);
            preferences = record.preferences;
        }

        let now = Instant::now();
        Self {
            session_id,
            deps,
            state: SessionState::Initializing,
            created_at: Utc::now(),
            last_event_at: now,
            budget_deadline: now + config.session.max_duration(),
            warning_sent: false,
            epoch: 0,
            link: None,
            active: HashMap::new(),
            seen: HashSet::new(),
            recent: VecDeque::new(),
            context,
            playback: PlaybackTracker::new(config.playback.bytes_per_ms),
            transcript: String::new(),
            preferences,
            resume_seed,
            executor,
            executor_rx,
            control_rx,
            metrics,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Connect, process events until the session ends, then tear down.
    pub async fn run(mut self) -> SessionSummary {
        info!(session_id = %self.session_id, "Session starting");
        let seed = self.resume_seed.take();
        let reason = match self.establish(seed.as_deref()).await {
            Ok(()) => self.event_loop().await,
            Err(reason) => reason,
        };
        self.teardown(reason).await
    }

    /// Snapshot for [`SessionControl::Status`].
    pub fn status(&self) -> SessionStatus {
        let mut calls: Vec<&ToolCall> = self.active.values().collect();
        calls.sort_by(|a, b| {
            a.requested_at
                .cmp(&b.requested_at)
                .then_with(|| a.call_id.cmp(&b.call_id))
        });
        SessionStatus {
            session_id: self.session_id.clone(),
            state: self.state,
            epoch: self.epoch,
            calls: calls
                .into_iter()
                .map(|c| CallSummary {
                    call_id: c.call_id.clone(),
                    tool_name: c.tool_name.clone(),
                    status: c.status,
                })
                .collect(),
            context_tokens: self.context.current_size(),
            context_ceiling: self.context.ceiling(),
            remaining_secs: self
                .budget_deadline
                .saturating_duration_since(Instant::now())
                .as_secs(),
            preferences: self.preferences.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Connection management
    // ------------------------------------------------------------------

    /// Open a connection, retrying with backoff. Gives up with
    /// [`EndReason::NetworkError`] once the attempts are exhausted.
    async fn establish(&mut self, seed: Option<&str>) -> std::result::Result<(), EndReason> {
        let config = Arc::clone(&self.deps.config);
        let attempts = config.reconnect.max_attempts.max(1);

        for attempt in 0..attempts {
            if attempt > 0 || self.epoch > 0 {
                let delay = match attempt {
                    0 => Duration::ZERO,
                    n => backoff_delay(n - 1, &config.reconnect),
                };
                self.publish(
                    topics::SESSION_RECONNECTING,
                    json!({
                        "attempt": attempt + 1,
                        "max_attempts": attempts,
                        "delay_ms": delay.as_millis() as u64,
                    }),
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            let link = match self.deps.connector.connect(&self.session_id).await {
                Ok(link) => link,
                Err(e) => {
                    warn!(
                        session_id = %self.session_id,
                        attempt = attempt + 1,
                        "Speech connection failed: {}",
                        e
                    );
                    continue;
                }
            };
            match self.on_connected(link, seed).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(session_id = %self.session_id, "Session setup failed: {}", e);
                    self.link = None;
                }
            }
        }

        error!(
            session_id = %self.session_id,
            attempts,
            "Giving up on the speech connection"
        );
        Err(EndReason::NetworkError)
    }

    async fn on_connected(&mut self, link: SpeechLink, seed: Option<&str>) -> Result<()> {
        self.link = Some(link);
        self.epoch += 1;
        if self.epoch > 1 {
            self.metrics.record_reconnect();
        }
        self.transition(SessionState::Initializing);

        let now = Instant::now();
        self.last_event_at = now;
        self.budget_deadline = now + self.deps.config.session.max_duration();
        self.warning_sent = false;

        let configure = self.configure();
        self.send(OutboundEvent::SessionConfigure(configure)).await?;
        if let Some(seed) = seed {
            self.send(OutboundEvent::ContextSeed {
                text: seed.to_string(),
            })
            .await?;
        }
        self.settle_previous_epochs().await?;

        info!(session_id = %self.session_id, epoch = self.epoch, "Speech connection established");
        Ok(())
    }

    fn configure(&self) -> SessionConfigure {
        let config = &self.deps.config;
        let mut tools = self.deps.registry.definitions();
        if config.tools.expose_cancel_tool {
            tools.push(cancel_tool_definition());
        }
        SessionConfigure {
            instructions: config.session.instructions.clone(),
            tools,
            turn_detection: config.session.turn_detection.clone(),
            voice: config.session.voice.clone(),
        }
    }

    /// Calls from an earlier connection that finished while it was down are
    /// reported now; ones the old connection already saw are retired.
    async fn settle_previous_epochs(&mut self) -> Result<()> {
        let mut stale: Vec<(DateTime<Utc>, String, bool)> = self
            .active
            .values()
            .filter(|c| c.epoch != self.epoch && c.status.is_terminal())
            .map(|c| (c.requested_at, c.call_id.clone(), c.delivered))
            .collect();
        stale.sort();
        for (_, call_id, delivered) in stale {
            if delivered {
                self.retire(&call_id);
            } else {
                self.deliver(&call_id).await?;
            }
        }
        Ok(())
    }

    async fn send(&self, event: OutboundEvent) -> Result<()> {
        match &self.link {
            Some(link) => link.send(event).await,
            None => Err(ParleyError::Transport(format!(
                "no speech connection for {}",
                event.name()
            ))),
        }
    }

    fn publish(&self, topic: &str, payload: Value) {
        self.deps
            .broadcaster
            .publish(topic, Some(self.session_id.as_str()), payload);
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    async fn event_loop(&mut self) -> EndReason {
        let every = Duration::from_secs(self.deps.config.session.checkpoint_interval_secs.max(1));
        let mut checkpoints = tokio::time::interval_at(Instant::now() + every, every);
        checkpoints.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = self.next_wake(&mut checkpoints).await;
            match self.dispatch(wake).await {
                Flow::Continue => {}
                Flow::End(reason) => return reason,
                Flow::TransportLost(message) => {
                    if let Err(reason) = self.recover_transport(&message).await {
                        return reason;
                    }
                }
                Flow::Rotate => {
                    if let Err(reason) = self.rotate().await {
                        return reason;
                    }
                }
            }
        }
    }

    async fn next_wake(&mut self, checkpoints: &mut Interval) -> Wake {
        let config = Arc::clone(&self.deps.config);
        let idle = Duration::from_secs(config.session.idle_timeout_secs);
        let idle_at = self.last_event_at + idle;
        let warning_at = self
            .budget_deadline
            .checked_sub(config.session.warning_before())
            .unwrap_or(self.budget_deadline);
        let checkpointing = config.recovery.enabled
            && config.session.checkpoint_interval_secs > 0
            && self.deps.store.is_some();

        tokio::select! {
            event = recv_link(&mut self.link) => Wake::Inbound(event),
            event = self.executor_rx.recv() => Wake::Executor(event),
            msg = self.control_rx.recv() => Wake::Control(msg),
            _ = tokio::time::sleep_until(warning_at), if !self.warning_sent => Wake::BudgetWarning,
            _ = tokio::time::sleep_until(self.budget_deadline) => Wake::BudgetExpired,
            _ = checkpoints.tick(), if checkpointing => Wake::Checkpoint,
            _ = tokio::time::sleep_until(idle_at), if !idle.is_zero() => Wake::Idle,
        }
    }

    async fn dispatch(&mut self, wake: Wake) -> Flow {
        let outcome = match wake {
            Wake::Inbound(Some(event)) => self.handle_inbound(event).await,
            Wake::Inbound(None) => Ok(Flow::TransportLost("speech connection closed".into())),
            Wake::Executor(Some(event)) => self.handle_executor(event).await.map(|_| Flow::Continue),
            Wake::Executor(None) => {
                error!(session_id = %self.session_id, "Executor channel closed");
                Ok(Flow::End(EndReason::Error))
            }
            Wake::Control(Some(msg)) => Ok(self.handle_control(msg)),
            Wake::Control(None) => Ok(Flow::End(EndReason::UserEnded)),
            Wake::BudgetWarning => {
                self.budget_warning();
                Ok(Flow::Continue)
            }
            Wake::BudgetExpired => Ok(Flow::Rotate),
            Wake::Checkpoint => {
                self.checkpoint(CheckpointReason::Periodic).await;
                Ok(Flow::Continue)
            }
            Wake::Idle => {
                info!(session_id = %self.session_id, "Session idle, closing");
                Ok(Flow::End(EndReason::IdleTimeout))
            }
        };

        match outcome {
            Ok(flow) => flow,
            Err(e) if e.is_transport() => Flow::TransportLost(e.to_string()),
            Err(e) => {
                warn!(session_id = %self.session_id, "Event handling failed: {}", e);
                Flow::Continue
            }
        }
    }

    fn handle_control(&mut self, msg: SessionControl) -> Flow {
        match msg {
            SessionControl::Close { reason } => return Flow::End(reason),
            SessionControl::PlaybackStarted => self.playback.on_playback_started(Instant::now()),
            SessionControl::PlaybackFlushed { bytes } => self.playback.on_flushed(bytes),
            SessionControl::CancelTools { immediate } => {
                let cancelled = self.executor.cancel_all(immediate);
                info!(
                    session_id = %self.session_id,
                    immediate,
                    count = cancelled.len(),
                    "Cancelling tool calls on request"
                );
            }
            SessionControl::SetPreference { key, value } => {
                debug!(session_id = %self.session_id, key = %key, "Preference set");
                self.preferences.insert(key, value);
            }
            SessionControl::Status(reply) => {
                if reply.send(self.status()).is_err() {
                    debug!(session_id = %self.session_id, "Status requester went away");
                }
            }
        }
        Flow::Continue
    }

    // ------------------------------------------------------------------
    // Inbound protocol events
    // ------------------------------------------------------------------

    async fn handle_inbound(&mut self, event: InboundEvent) -> Result<Flow> {
        self.last_event_at = Instant::now();
        debug!(
            session_id = %self.session_id,
            event = event.name(),
            state = %self.state,
            "Inbound event"
        );

        match event {
            InboundEvent::SessionEstablished => {
                self.transition(SessionState::Ready);
            }
            InboundEvent::SpeechStarted => {
                if self.state == SessionState::Speaking && self.playback.is_active() {
                    self.interrupt().await?;
                }
                self.transition(SessionState::Listening);
            }
            InboundEvent::SpeechStopped => {
                self.transition(SessionState::Processing);
            }
            InboundEvent::InputTranscript { text, .. } => {
                if !text.trim().is_empty() {
                    self.context
                        .append(ContextEntry::new(Role::User, text.trim()));
                    self.after_turn();
                }
            }
            InboundEvent::CallRequest {
                call_id,
                name,
                arguments_json,
            } => {
                self.handle_call_request(call_id, name, arguments_json)
                    .await?;
            }
            InboundEvent::ResponseChunk { item_id, kind, .. } => {
                self.transition(SessionState::Speaking);
                match kind {
                    ChunkKind::Audio { bytes } => self.playback.on_audio(&item_id, bytes),
                    ChunkKind::Transcript { delta } => self.transcript.push_str(&delta),
                }
            }
            InboundEvent::ResponseDone { response_id } => {
                self.response_done(response_id.as_deref());
            }
            InboundEvent::CallResultAcknowledged { call_id } => {
                self.acknowledge(&call_id);
            }
            InboundEvent::Error { code, message } => {
                warn!(
                    session_id = %self.session_id,
                    code = code.as_deref().unwrap_or("-"),
                    "Speech model reported an error: {}",
                    message
                );
                self.publish(
                    topics::SESSION_ERROR,
                    json!({"code": code, "message": message}),
                );
            }
            InboundEvent::TransportError { message } => return Ok(Flow::TransportLost(message)),
        }
        Ok(Flow::Continue)
    }

    /// Barge-in: cut the assistant item at what was actually heard.
    async fn interrupt(&mut self) -> Result<()> {
        let Some(cut) = self.playback.interrupt(Instant::now()) else {
            return Ok(());
        };
        info!(
            session_id = %self.session_id,
            item_id = %cut.item_id,
            audio_ms = cut.audio_ms,
            "User interrupted playback"
        );
        self.metrics.record_interruption();
        self.publish(
            topics::PLAYBACK_TRUNCATED,
            json!({
                "item_id": cut.item_id,
                "audio_ms": cut.audio_ms,
                "discarded_bytes": cut.discarded_bytes,
            }),
        );

        let heard = std::mem::take(&mut self.transcript);
        if !heard.trim().is_empty() {
            self.context.append(ContextEntry::new(
                Role::Assistant,
                format!("{} [interrupted]", heard.trim()),
            ));
            self.after_turn();
        }

        self.send(OutboundEvent::Truncate {
            item_id: cut.item_id,
            audio_ms: cut.audio_ms,
        })
        .await?;
        self.send(OutboundEvent::ClearOutputAudio).await
    }

    fn response_done(&mut self, response_id: Option<&str>) {
        let text = std::mem::take(&mut self.transcript);
        if !text.trim().is_empty() {
            self.context
                .append(ContextEntry::new(Role::Assistant, text.trim()));
        }
        self.playback.finish();

        // A finished response has consumed every result delivered before it.
        let delivered: Vec<String> = self
            .active
            .values()
            .filter(|c| c.delivered)
            .map(|c| c.call_id.clone())
            .collect();
        for call_id in &delivered {
            self.retire(call_id);
        }

        if matches!(self.state, SessionState::Speaking | SessionState::Processing) {
            self.transition(SessionState::Ready);
        }
        debug!(
            session_id = %self.session_id,
            response_id = response_id.unwrap_or("-"),
            retired = delivered.len(),
            "Response done"
        );
        self.after_turn();
    }

    fn acknowledge(&mut self, call_id: &str) {
        if self.active.get(call_id).is_some_and(|c| c.delivered) {
            self.retire(call_id);
        } else {
            debug!(session_id = %self.session_id, call_id = %call_id, "Acknowledgement for an undelivered call");
        }
    }

    // ------------------------------------------------------------------
    // Tool calls
    // ------------------------------------------------------------------

    async fn handle_call_request(
        &mut self,
        call_id: String,
        name: String,
        arguments_json: String,
    ) -> Result<()> {
        if self.seen.contains(&call_id) {
            return self.handle_duplicate(&call_id).await;
        }
        self.seen.insert(call_id.clone());

        let parsed = ToolArgs::from_json(&arguments_json);
        let arguments = match &parsed {
            Ok(args) => args.clone().into_value(),
            Err(_) => Value::String(arguments_json),
        };

        let mut call = ToolCall::new(&call_id, &name, arguments.clone(), self.epoch);
        let entry = ContextEntry::new(Role::Tool, format!("{}({})", name, arguments)).pinned();
        call.context_entry = Some(self.context.append(entry));
        self.active.insert(call_id.clone(), call);
        self.transition(SessionState::ExecutingTool);

        let declared = self
            .deps
            .registry
            .get(&name)
            .and_then(|tool| tool.metadata().announcement);
        let announce_args = parsed.as_ref().cloned().unwrap_or_default();
        let announcement = announce(&name, &announce_args, declared.as_deref());
        self.publish(
            topics::TOOL_STARTED,
            json!({
                "call_id": call_id,
                "tool": name,
                "arguments": arguments,
                "phrase": announcement.phrase,
                "detail": announcement.detail,
            }),
        );
        info!(session_id = %self.session_id, call_id = %call_id, tool = %name, "Tool call requested");

        let args = match parsed {
            Ok(args) => args,
            Err(err) => {
                return self
                    .handle_completion(ToolCompletion::failed(&call_id, &name, err))
                    .await;
            }
        };

        let limit = self.deps.config.session.max_active_calls;
        let live = self
            .active
            .values()
            .filter(|c| !c.status.is_terminal())
            .count();
        if live > limit {
            let err = ToolError::internal(format!(
                "Too many tool calls in progress ({} allowed); wait for one to finish",
                limit
            ));
            return self
                .handle_completion(ToolCompletion::failed(&call_id, &name, err))
                .await;
        }

        if name == CANCEL_TOOL_NAME && self.deps.config.tools.expose_cancel_tool {
            return self.cancel_request(&call_id, &args).await;
        }

        match self
            .executor
            .submit(ExecutionRequest::new(call_id, name, args))
        {
            Submission::Spawned => Ok(()),
            Submission::Rejected(done) => self.handle_completion(done).await,
        }
    }

    async fn handle_duplicate(&mut self, call_id: &str) -> Result<()> {
        self.metrics.record_duplicate_call();
        let stored = match self.active.get(call_id) {
            Some(call) if call.status.is_terminal() => call.result.clone(),
            Some(_) => {
                debug!(session_id = %self.session_id, call_id = %call_id, "Duplicate call request while the original runs; ignoring");
                return Ok(());
            }
            None => self
                .recent
                .iter()
                .find(|(id, _)| id == call_id)
                .map(|(_, result)| result.clone()),
        };

        let Some(result) = stored else {
            warn!(session_id = %self.session_id, call_id = %call_id, "Duplicate call request for an evicted result; ignoring");
            return Ok(());
        };
        info!(session_id = %self.session_id, call_id = %call_id, "Re-sending stored result for duplicate call request");
        self.send(OutboundEvent::CallResult {
            call_id: call_id.to_string(),
            output: result.output,
            is_error: result.is_error,
        })
        .await?;
        self.send(OutboundEvent::ResponseRequest).await
    }

    async fn cancel_request(&mut self, call_id: &str, args: &ToolArgs) -> Result<()> {
        let request: CancelArgs = args.parse().unwrap_or_default();
        let running = self.executor.cancel_all(request.immediate);
        info!(
            session_id = %self.session_id,
            reason = request.reason.as_deref().unwrap_or("unspecified"),
            immediate = request.immediate,
            count = running.len(),
            "Cancel requested by the speech model"
        );

        let cancelled = !running.is_empty();
        let message = if cancelled {
            format!(
                "Cancelled {} running task(s): {}.",
                running.len(),
                running.join(", ")
            )
        } else {
            "Nothing was running.".to_string()
        };
        let payload = json!({
            "cancelled": cancelled,
            "running_tools": running,
            "message": message,
        });
        self.handle_completion(ToolCompletion::succeeded(call_id, CANCEL_TOOL_NAME, payload))
            .await
    }

    async fn handle_executor(&mut self, event: ExecutorEvent) -> Result<()> {
        match event {
            ExecutorEvent::Running { call_id, .. } => {
                if let Some(call) = self.active.get_mut(&call_id) {
                    if call.status == CallStatus::Pending {
                        call.advance(CallStatus::Running);
                    }
                }
                Ok(())
            }
            ExecutorEvent::Completed(done) => self.handle_completion(done).await,
        }
    }

    /// Record a finished call, tell observers, and answer the speech model.
    async fn handle_completion(&mut self, done: ToolCompletion) -> Result<()> {
        let max_chars = self.deps.config.tools.max_output_chars;
        let status = done.status();

        let Some(call) = self.active.get_mut(&done.call_id) else {
            warn!(
                session_id = %self.session_id,
                call_id = %done.call_id,
                tool = %done.tool_name,
                "Completion for an unknown call; dropping"
            );
            return Ok(());
        };
        if call.status.is_terminal() {
            warn!(
                session_id = %self.session_id,
                call_id = %done.call_id,
                status = %call.status,
                "Completion for a finished call; dropping"
            );
            return Ok(());
        }
        if call.status == CallStatus::Pending && status != CallStatus::Failed {
            call.advance(CallStatus::Running);
        }
        call.advance(status);

        let result = FormattedResult::from_outcome(&done.outcome, max_chars);
        let error = done.outcome.as_ref().err().cloned();
        call.result = Some(result.clone());
        call.error = error.clone();
        let entry_text = format!("{}({}) -> {}", call.tool_name, call.arguments, result.output);
        let entry_id = call.context_entry;

        let linked = entry_id.is_some_and(|id| {
            self.context.update_content(id, entry_text.clone()) && self.context.mark_summarizable(id)
        });
        if !linked {
            self.context.append(ContextEntry::new(Role::Tool, entry_text));
        }

        self.publish(
            topics::TOOL_COMPLETED,
            json!({
                "call_id": done.call_id,
                "tool": done.tool_name,
                "status": status,
                "duration_ms": duration_ceil_ms(done.duration),
                "is_error": result.is_error,
                "error": error.as_ref().map(|e| json!({
                    "kind": e.kind.as_str(),
                    "recoverable": e.is_recoverable(),
                    "suggestion": e.suggestion(),
                })),
            }),
        );

        self.deliver(&done.call_id).await?;

        // A response was requested, whether or not other calls are still running.
        if matches!(
            self.state,
            SessionState::ExecutingTool | SessionState::Ready
        ) {
            self.transition(SessionState::Processing);
        }
        self.after_turn();
        Ok(())
    }

    /// Send a finished call's result: call-result then response-request on
    /// the connection that issued it, or a context note on a newer one.
    async fn deliver(&mut self, call_id: &str) -> Result<()> {
        let Some(call) = self.active.get(call_id) else {
            return Ok(());
        };
        let Some(result) = call.result.clone() else {
            return Ok(());
        };
        if self.link.is_none() {
            return Ok(());
        }

        if call.epoch != self.epoch {
            let note = format!(
                "[Background result] {} finished after the connection was re-established. \
                 Result: {}",
                call.tool_name, result.output
            );
            info!(session_id = %self.session_id, call_id = %call_id, "Reporting orphaned tool result");
            self.send(OutboundEvent::ContextSeed { text: note }).await?;
            self.send(OutboundEvent::ResponseRequest).await?;
            self.retire(call_id);
            return Ok(());
        }

        self.send(OutboundEvent::CallResult {
            call_id: call_id.to_string(),
            output: result.output,
            is_error: result.is_error,
        })
        .await?;
        self.send(OutboundEvent::ResponseRequest).await?;
        if let Some(call) = self.active.get_mut(call_id) {
            call.delivered = true;
        }
        Ok(())
    }

    /// Move a call out of the active set, keeping its result for duplicates.
    fn retire(&mut self, call_id: &str) {
        let Some(call) = self.active.remove(call_id) else {
            return;
        };
        if let Some(result) = call.result {
            self.recent.push_back((call.call_id, result));
            while self.recent.len() > self.deps.config.session.recent_results_capacity {
                self.recent.pop_front();
            }
        }
    }

    // ------------------------------------------------------------------
    // State, context and budget
    // ------------------------------------------------------------------

    /// Apply a state change. Same-state is a no-op; disallowed edges are
    /// logged, counted and refused.
    fn transition(&mut self, to: SessionState) -> bool {
        let from = self.state;
        if from == to {
            return true;
        }
        if !from.can_transition_to(to) {
            let err = ParleyError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            };
            warn!(session_id = %self.session_id, "{}", err);
            self.metrics.record_invalid_transition();
            return false;
        }
        self.state = to;
        debug!(session_id = %self.session_id, from = %from, to = %to, "State changed");
        self.publish(topics::SESSION_STATE, json!({"from": from, "to": to}));
        true
    }

    fn after_turn(&mut self) {
        match self.context.prune_if_needed() {
            PruneOutcome::NotNeeded => {}
            PruneOutcome::Pruned {
                runs,
                replaced_entries,
                tokens_before,
                tokens_after,
            } => {
                self.metrics.record_prune();
                info!(
                    session_id = %self.session_id,
                    runs,
                    replaced_entries,
                    tokens_before,
                    tokens_after,
                    "Context pruned"
                );
                self.publish(
                    topics::CONTEXT_PRUNED,
                    json!({
                        "runs": runs,
                        "replaced_entries": replaced_entries,
                        "tokens_before": tokens_before,
                        "tokens_after": tokens_after,
                    }),
                );
            }
            PruneOutcome::OverBudget { tokens, runs } => {
                if runs > 0 {
                    self.metrics.record_prune();
                }
                warn!(
                    session_id = %self.session_id,
                    tokens,
                    ceiling = self.context.ceiling(),
                    "Context over budget with nothing left to summarize"
                );
                self.publish(
                    topics::CONTEXT_OVER_BUDGET,
                    json!({
                        "tokens": tokens,
                        "ceiling": self.context.ceiling(),
                        "runs": runs,
                    }),
                );
            }
        }
    }

    fn budget_warning(&mut self) {
        self.warning_sent = true;
        let remaining = self.budget_deadline.saturating_duration_since(Instant::now());
        info!(
            session_id = %self.session_id,
            remaining_secs = remaining.as_secs(),
            "Session budget running out"
        );
        self.publish(
            topics::SESSION_BUDGET_WARNING,
            json!({"remaining_secs": remaining.as_secs(), "epoch": self.epoch}),
        );
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    fn build_record(&self, reason: CheckpointReason) -> SessionRecoveryRecord {
        let verbatim = self.deps.config.recovery.verbatim_turns;
        let mut record = SessionRecoveryRecord::new(self.session_id.clone(), reason);
        record.context_summary = self.context.summary_for_recovery(verbatim);
        record.last_turns = self.context.recent_turns(verbatim);

        let mut pending: Vec<&ToolCall> = self
            .active
            .values()
            .filter(|c| !c.status.is_terminal())
            .collect();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at));
        record.pending_tool_calls = pending
            .into_iter()
            .map(|c| PendingToolCall {
                call_id: c.call_id.clone(),
                tool_name: c.tool_name.clone(),
                arguments: c.arguments.clone(),
            })
            .collect();
        record.preferences = self.preferences.clone();
        record
    }

    /// Build and persist a record. Persistence failures only degrade recovery.
    async fn checkpoint(&self, reason: CheckpointReason) -> SessionRecoveryRecord {
        let record = self.build_record(reason);
        if !self.deps.config.recovery.enabled {
            return record;
        }
        if let Some(store) = &self.deps.store {
            match store.save(&record).await {
                Ok(()) => debug!(session_id = %self.session_id, reason = %reason, "Checkpoint saved"),
                Err(e) => warn!(
                    session_id = %self.session_id,
                    reason = %reason,
                    "Checkpoint failed, recovery degraded: {}",
                    e
                ),
            }
        }
        record
    }

    /// Remove the stored record once the live snapshot has seeded a new
    /// connection. The stored copy may be older if a save failed.
    async fn consume_stored_record(&self) {
        if !self.deps.config.recovery.enabled {
            return;
        }
        let Some(store) = &self.deps.store else {
            return;
        };
        if let Err(e) = store.take(&self.session_id).await {
            warn!(session_id = %self.session_id, "Could not clear recovery record: {}", e);
        }
    }

    /// Seed text for a reconnect inside this process. Calls still owned by
    /// the executor are reported when they finish, so they are not listed
    /// as lost.
    fn seed_for(&self, record: &SessionRecoveryRecord) -> String {
        let mut record = record.clone();
        record
            .pending_tool_calls
            .retain(|p| !self.active.contains_key(&p.call_id));
        record.seed_message()
    }

    async fn reconnect_with(
        &mut self,
        record: SessionRecoveryRecord,
    ) -> std::result::Result<(), EndReason> {
        self.playback.finish();
        self.transcript.clear();
        let seed = self.seed_for(&record);
        self.establish(Some(&seed)).await?;

        let remapped = self
            .context
            .reseed(&record.context_summary, record.last_turns);
        for call in self.active.values_mut() {
            call.context_entry = call.context_entry.and_then(|old| {
                remapped
                    .iter()
                    .find(|(from, _)| *from == old)
                    .map(|(_, to)| *to)
            });
        }
        Ok(())
    }

    async fn recover_transport(&mut self, message: &str) -> std::result::Result<(), EndReason> {
        warn!(session_id = %self.session_id, "Speech connection lost: {}", message);
        let record = self.checkpoint(CheckpointReason::TransportLoss).await;
        self.transition(SessionState::Reconnecting);
        self.link = None;
        self.consume_stored_record().await;
        self.reconnect_with(record).await
    }

    /// Budget expiry: snapshot, reconnect, and replay the summary.
    async fn rotate(&mut self) -> std::result::Result<(), EndReason> {
        info!(session_id = %self.session_id, epoch = self.epoch, "Session budget reached, rotating connection");
        let record = self.checkpoint(CheckpointReason::Rotation).await;
        self.transition(SessionState::Reconnecting);
        self.publish(
            topics::SESSION_ROTATING,
            json!({
                "epoch": self.epoch,
                "context_tokens": self.context.current_size(),
            }),
        );
        self.link = None;
        self.consume_stored_record().await;
        self.reconnect_with(record)
            .await
            .map_err(|_| EndReason::SessionLimit)
    }

    async fn teardown(mut self, reason: EndReason) -> SessionSummary {
        self.executor.shutdown();
        self.link = None;
        self.checkpoint(CheckpointReason::Teardown).await;
        self.transition(SessionState::Terminated);

        let metrics = self.metrics.snapshot();
        self.publish(
            topics::SESSION_ENDED,
            json!({
                "reason": reason,
                "created_at": self.created_at,
                "metrics": metrics,
            }),
        );
        self.deps.directory.remove(&self.session_id);
        info!(
            session_id = %self.session_id,
            reason = %reason,
            "Session ended: {}",
            self.metrics.summary()
        );

        SessionSummary {
            session_id: self.session_id,
            end_reason: reason,
            final_state: self.state,
            metrics,
        }
    }
}

async fn recv_link(link: &mut Option<SpeechLink>) -> Option<InboundEvent> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::SessionFilter;
    use crate::protocol::{LoopbackConnector, RemoteEnd};
    use crate::recovery::{MemoryStore, MockRecoveryStore};
    use crate::tools::builtin::{EchoTool, WaitTool};
    use crate::tools::{Tool, ToolContext};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::JoinHandle;

    struct CountingTool(Arc<AtomicUsize>);

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "lookup"
        }
        fn description(&self) -> &str {
            "Counts invocations"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {"q": {"type": "string"}}})
        }
        async fn invoke(
            &self,
            _args: ToolArgs,
            _ctx: &ToolContext,
        ) -> std::result::Result<Value, ToolError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({"invocations": n}))
        }
    }

    struct Harness {
        control: mpsc::Sender<SessionControl>,
        remotes: mpsc::UnboundedReceiver<RemoteEnd>,
        remote: RemoteEnd,
        connector: Arc<LoopbackConnector>,
        broadcaster: Arc<EventBroadcaster>,
        store: Arc<MemoryStore>,
        invocations: Arc<AtomicUsize>,
        task: JoinHandle<SessionSummary>,
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.session.idle_timeout_secs = 0;
        config.tools.expose_cancel_tool = true;
        config
    }

    async fn start(config: Config) -> Harness {
        start_with_store(config, None).await
    }

    /// Like `start`, but checkpoints go to `store` instead of the harness
    /// memory store.
    async fn start_with_store(config: Config, store: Option<Arc<dyn RecoveryStore>>) -> Harness {
        let invocations = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(WaitTool);
        registry.register(CountingTool(Arc::clone(&invocations)));

        let (connector, mut remotes) = LoopbackConnector::new(64);
        let connector = Arc::new(connector);
        let broadcaster = Arc::new(EventBroadcaster::new(256));
        let memory = Arc::new(MemoryStore::new());
        let (control, control_rx) = mpsc::channel(16);
        let deps = SessionDeps {
            config: Arc::new(config),
            registry: Arc::new(registry),
            broadcaster: Arc::clone(&broadcaster),
            connector: connector.clone(),
            store: Some(store.unwrap_or_else(|| memory.clone() as Arc<dyn RecoveryStore>)),
            directory: SessionDirectory::default(),
        };
        let task = tokio::spawn(SessionOrchestrator::new("s1", deps, control_rx, None).run());

        let mut remote = remotes.recv().await.unwrap();
        assert!(matches!(
            remote.recv().await,
            Some(OutboundEvent::SessionConfigure(_))
        ));
        remote.send(InboundEvent::SessionEstablished).await.unwrap();

        Harness {
            control,
            remotes,
            remote,
            connector,
            broadcaster,
            store: memory,
            invocations,
            task,
        }
    }

    impl Harness {
        async fn status(&self) -> SessionStatus {
            let (tx, rx) = oneshot::channel();
            self.control.send(SessionControl::Status(tx)).await.unwrap();
            rx.await.unwrap()
        }

        async fn wait_for_state(&self, state: SessionState) {
            for _ in 0..100 {
                if self.status().await.state == state {
                    return;
                }
                tokio::task::yield_now().await;
            }
            panic!("session never reached {}", state);
        }

        async fn call(&self, call_id: &str, name: &str, args: &str) {
            self.remote
                .send(InboundEvent::CallRequest {
                    call_id: call_id.into(),
                    name: name.into(),
                    arguments_json: args.into(),
                })
                .await
                .unwrap();
        }

        /// Hang up the current connection and pick up the one the
        /// orchestrator opens next.
        async fn drop_connection(&mut self) {
            let placeholder = RemoteEnd {
                session_id: String::new(),
                connection: 0,
                inbound: mpsc::channel(1).0,
                outbound: mpsc::channel(1).1,
            };
            drop(std::mem::replace(&mut self.remote, placeholder));
            self.remote = self.remotes.recv().await.unwrap();
        }

        async fn close(self) -> SessionSummary {
            self.control
                .send(SessionControl::Close {
                    reason: EndReason::UserEnded,
                })
                .await
                .unwrap();
            self.task.await.unwrap()
        }
    }

    async fn expect_result(remote: &mut RemoteEnd) -> (String, String, bool) {
        match remote.recv().await {
            Some(OutboundEvent::CallResult {
                call_id,
                output,
                is_error,
            }) => {
                assert_eq!(remote.recv().await, Some(OutboundEvent::ResponseRequest));
                (call_id, output, is_error)
            }
            other => panic!("expected a call result, got {:?}", other),
        }
    }

    async fn speak_until_processing(h: &Harness) {
        h.remote.send(InboundEvent::SpeechStarted).await.unwrap();
        h.remote.send(InboundEvent::SpeechStopped).await.unwrap();
        h.wait_for_state(SessionState::Processing).await;
    }

    #[tokio::test]
    async fn test_configure_lists_registry_and_cancel_tool() {
        let invocations = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(CountingTool(invocations));
        let (connector, mut remotes) = LoopbackConnector::new(8);
        let (_control, control_rx) = mpsc::channel(4);
        let deps = SessionDeps {
            config: Arc::new(test_config()),
            registry: Arc::new(registry),
            broadcaster: Arc::new(EventBroadcaster::default()),
            connector: Arc::new(connector),
            store: None,
            directory: SessionDirectory::default(),
        };
        let _task = tokio::spawn(SessionOrchestrator::new("s1", deps, control_rx, None).run());
        let mut remote = remotes.recv().await.unwrap();
        match remote.recv().await {
            Some(OutboundEvent::SessionConfigure(cfg)) => {
                let names: Vec<&str> = cfg.tools.iter().map(|t| t.name.as_str()).collect();
                assert_eq!(names, vec!["lookup", CANCEL_TOOL_NAME]);
            }
            other => panic!("expected configure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_call_result_precedes_response_request() {
        let mut h = start(test_config()).await;
        let sub = h
            .broadcaster
            .subscribe(SessionFilter::Only("s1".into()), ["tool.*"]);
        speak_until_processing(&h).await;

        h.call("c1", "echo", r#"{"message": "hello"}"#).await;
        let (call_id, output, is_error) = expect_result(&mut h.remote).await;
        assert_eq!(call_id, "c1");
        assert_eq!(output, "hello");
        assert!(!is_error);

        let topics: Vec<String> = sub.drain().iter().map(|e| e.topic.clone()).collect();
        assert_eq!(topics, vec!["tool.started", "tool.completed"]);
        h.wait_for_state(SessionState::Processing).await;
        h.close().await;
    }

    #[tokio::test]
    async fn test_unknown_tool_answered_with_error() {
        let mut h = start(test_config()).await;
        speak_until_processing(&h).await;
        h.call("c1", "nope", "{}").await;
        let (_, output, is_error) = expect_result(&mut h.remote).await;
        assert!(is_error);
        let payload: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(payload["error"]["kind"], "not_found");
        assert_eq!(payload["error"]["recoverable"], false);
        h.close().await;
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_invalid_input() {
        let mut h = start(test_config()).await;
        speak_until_processing(&h).await;
        h.call("c1", "echo", "{not json").await;
        let (_, output, is_error) = expect_result(&mut h.remote).await;
        assert!(is_error);
        assert!(output.contains("invalid_input"));
        h.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_call_id_never_reinvokes() {
        let mut h = start(test_config()).await;
        speak_until_processing(&h).await;

        h.call("c1", "lookup", r#"{"q": "x"}"#).await;
        let (_, first, _) = expect_result(&mut h.remote).await;
        h.call("c1", "lookup", r#"{"q": "x"}"#).await;
        let (_, second, _) = expect_result(&mut h.remote).await;
        assert_eq!(first, second);

        // Still found after the call is retired to the recent results.
        h.remote
            .send(InboundEvent::ResponseDone { response_id: None })
            .await
            .unwrap();
        h.call("c1", "lookup", r#"{"q": "x"}"#).await;
        let (_, third, _) = expect_result(&mut h.remote).await;
        assert_eq!(first, third);

        assert_eq!(h.invocations.load(Ordering::SeqCst), 1);
        let summary = h.close().await;
        assert_eq!(summary.metrics.duplicate_calls, 2);
    }

    #[tokio::test]
    async fn test_invalid_transition_counted_but_call_answered() {
        let mut h = start(test_config()).await;
        h.wait_for_state(SessionState::Ready).await;
        // Ready -> ExecutingTool is not an edge.
        h.call("c1", "echo", r#"{"message": "hi"}"#).await;
        let (_, output, _) = expect_result(&mut h.remote).await;
        assert_eq!(output, "hi");
        let summary = h.close().await;
        assert!(summary.metrics.invalid_transitions >= 1);
        assert_eq!(summary.final_state, SessionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_barge_in_truncates_at_flushed_audio() {
        let mut h = start(test_config()).await;
        let sub = h
            .broadcaster
            .subscribe(SessionFilter::Any, ["playback.truncated"]);
        speak_until_processing(&h).await;

        h.remote
            .send(InboundEvent::ResponseChunk {
                response_id: "r1".into(),
                item_id: "item_1".into(),
                kind: ChunkKind::Audio { bytes: 48_000 },
            })
            .await
            .unwrap();
        h.wait_for_state(SessionState::Speaking).await;
        h.control.send(SessionControl::PlaybackStarted).await.unwrap();
        h.control
            .send(SessionControl::PlaybackFlushed { bytes: 4_800 })
            .await
            .unwrap();
        h.status().await;

        tokio::time::advance(Duration::from_secs(2)).await;
        h.remote.send(InboundEvent::SpeechStarted).await.unwrap();
        assert_eq!(
            h.remote.recv().await,
            Some(OutboundEvent::Truncate {
                item_id: "item_1".into(),
                audio_ms: 100,
            })
        );
        assert_eq!(h.remote.recv().await, Some(OutboundEvent::ClearOutputAudio));
        h.wait_for_state(SessionState::Listening).await;
        assert_eq!(sub.drain()[0].payload["audio_ms"], 100);

        let summary = h.close().await;
        assert_eq!(summary.metrics.interruptions, 1);
    }

    #[tokio::test]
    async fn test_status_reports_preferences_and_running_calls() {
        let h = start(test_config()).await;
        speak_until_processing(&h).await;
        h.control
            .send(SessionControl::SetPreference {
                key: "units".into(),
                value: "metric".into(),
            })
            .await
            .unwrap();
        h.call("c1", "wait", r#"{"ms": 60000}"#).await;
        h.wait_for_state(SessionState::ExecutingTool).await;

        let status = h.status().await;
        assert_eq!(status.preferences["units"], "metric");
        assert_eq!(status.running_calls().count(), 1);
        assert_eq!(status.calls[0].tool_name, "wait");
        assert_eq!(status.epoch, 1);
        h.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_tool_cancels_running_calls() {
        let mut h = start(test_config()).await;
        speak_until_processing(&h).await;
        h.call("c1", "wait", r#"{"ms": 60000}"#).await;
        h.wait_for_state(SessionState::ExecutingTool).await;
        for _ in 0..100 {
            if h.status().await.calls[0].status == CallStatus::Running {
                break;
            }
            tokio::task::yield_now().await;
        }

        h.call("c2", CANCEL_TOOL_NAME, r#"{"reason": "user said stop"}"#)
            .await;
        let mut results = vec![
            expect_result(&mut h.remote).await,
            expect_result(&mut h.remote).await,
        ];
        results.sort();
        assert_eq!(results[0].0, "c1");
        assert!(results[0].1.contains("cancelled"));
        assert!(results[0].2);
        let answer: Value = serde_json::from_str(&results[1].1).unwrap();
        assert_eq!(answer["cancelled"], true);
        assert_eq!(answer["running_tools"], json!(["wait"]));
        h.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_after_reconnect_becomes_context_note() {
        let mut h = start(test_config()).await;
        speak_until_processing(&h).await;
        h.call("c1", "wait", r#"{"ms": 500}"#).await;
        h.wait_for_state(SessionState::ExecutingTool).await;

        h.drop_connection().await;
        assert_eq!(h.remote.connection, 2);
        assert!(matches!(
            h.remote.recv().await,
            Some(OutboundEvent::SessionConfigure(_))
        ));
        match h.remote.recv().await {
            Some(OutboundEvent::ContextSeed { text }) => {
                assert!(text.starts_with("[Session resumed]"));
                assert!(!text.contains("results were lost"));
            }
            other => panic!("expected seed, got {:?}", other),
        }
        match h.remote.recv().await {
            Some(OutboundEvent::ContextSeed { text }) => {
                assert!(text.starts_with("[Background result] wait"));
            }
            other => panic!("expected background note, got {:?}", other),
        }
        assert_eq!(h.remote.recv().await, Some(OutboundEvent::ResponseRequest));
        assert!(h.store.is_empty());

        let summary = h.close().await;
        assert_eq!(summary.metrics.reconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_ends_session() {
        let mut config = test_config();
        config.reconnect.max_attempts = 3;
        let h = start(config).await;
        h.wait_for_state(SessionState::Ready).await;
        h.connector.fail_next(10);
        let Harness {
            remote,
            task,
            control: _control,
            ..
        } = h;
        drop(remote);
        let summary = task.await.unwrap();
        assert_eq!(summary.end_reason, EndReason::NetworkError);
        assert_eq!(summary.final_state, SessionState::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_ends_session() {
        let mut config = test_config();
        config.session.idle_timeout_secs = 30;
        let h = start(config).await;
        let summary = h.task.await.unwrap();
        assert_eq!(summary.end_reason, EndReason::IdleTimeout);
    }

    #[tokio::test]
    async fn test_teardown_checkpoints_and_reports() {
        let h = start(test_config()).await;
        let sub = h
            .broadcaster
            .subscribe(SessionFilter::Any, ["session.ended"]);
        h.remote
            .send(InboundEvent::InputTranscript {
                item_id: "i1".into(),
                text: "what time is it".into(),
            })
            .await
            .unwrap();
        h.status().await;
        let store = Arc::clone(&h.store);
        let summary = h.close().await;
        assert_eq!(summary.end_reason, EndReason::UserEnded);

        let record = store.load("s1").await.unwrap().unwrap();
        assert_eq!(record.reason, CheckpointReason::Teardown);
        let ended = sub.drain();
        assert_eq!(ended[0].payload["reason"], "user_ended");
    }

    #[tokio::test(start_paused = true)]
    async fn test_barge_in_truncates_while_another_call_runs() {
        let mut h = start(test_config()).await;
        speak_until_processing(&h).await;
        h.call("c2", "wait", r#"{"ms": 60000}"#).await;
        h.wait_for_state(SessionState::ExecutingTool).await;
        h.call("c1", "echo", r#"{"message": "first"}"#).await;
        let (call_id, _, _) = expect_result(&mut h.remote).await;
        assert_eq!(call_id, "c1");
        h.wait_for_state(SessionState::Processing).await;

        h.remote
            .send(InboundEvent::ResponseChunk {
                response_id: "r2".into(),
                item_id: "item_2".into(),
                kind: ChunkKind::Audio { bytes: 48_000 },
            })
            .await
            .unwrap();
        h.wait_for_state(SessionState::Speaking).await;
        h.control.send(SessionControl::PlaybackStarted).await.unwrap();
        h.control
            .send(SessionControl::PlaybackFlushed { bytes: 4_800 })
            .await
            .unwrap();
        h.status().await;

        tokio::time::advance(Duration::from_secs(2)).await;
        h.remote.send(InboundEvent::SpeechStarted).await.unwrap();
        assert_eq!(
            h.remote.recv().await,
            Some(OutboundEvent::Truncate {
                item_id: "item_2".into(),
                audio_ms: 100,
            })
        );
        assert_eq!(h.remote.recv().await, Some(OutboundEvent::ClearOutputAudio));
        assert_eq!(h.status().await.running_calls().count(), 1);

        let summary = h.close().await;
        assert_eq!(summary.metrics.invalid_transitions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_seeds_from_live_context_when_save_fails() {
        let mut store = MockRecoveryStore::new();
        store
            .expect_save()
            .returning(|_| Err(ParleyError::Recovery("disk full".into())));
        store.expect_take().returning(|id| {
            let mut old = SessionRecoveryRecord::new(id, CheckpointReason::Periodic);
            old.context_summary = "user: STALE topic from long ago".into();
            Ok(Some(old))
        });
        let store: Arc<dyn RecoveryStore> = Arc::new(store);
        let mut h = start_with_store(test_config(), Some(store)).await;
        h.remote
            .send(InboundEvent::InputTranscript {
                item_id: "i1".into(),
                text: "book the FRESH flight to Oslo".into(),
            })
            .await
            .unwrap();
        h.status().await;

        h.drop_connection().await;
        assert!(matches!(
            h.remote.recv().await,
            Some(OutboundEvent::SessionConfigure(_))
        ));
        match h.remote.recv().await {
            Some(OutboundEvent::ContextSeed { text }) => {
                assert!(text.contains("user: book the FRESH flight to Oslo"));
                assert!(!text.contains("STALE"));
            }
            other => panic!("expected seed, got {:?}", other),
        }
        h.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_checkpoint_interval_disables_periodic_saves() {
        let mut config = test_config();
        config.session.checkpoint_interval_secs = 0;
        let h = start(config).await;
        h.wait_for_state(SessionState::Ready).await;

        tokio::time::advance(Duration::from_millis(1_500)).await;
        h.status().await;
        tokio::time::advance(Duration::from_secs(30)).await;
        h.status().await;
        assert!(h.store.load("s1").await.unwrap().is_none());
        h.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_checkpoint_saved() {
        let mut config = test_config();
        config.session.checkpoint_interval_secs = 1;
        let h = start(config).await;
        h.wait_for_state(SessionState::Ready).await;

        tokio::time::advance(Duration::from_millis(1_500)).await;
        let mut saved = None;
        for _ in 0..100 {
            h.status().await;
            saved = h.store.load("s1").await.unwrap();
            if saved.is_some() {
                break;
            }
        }
        assert_eq!(saved.unwrap().reason, CheckpointReason::Periodic);
        h.close().await;
    }
}

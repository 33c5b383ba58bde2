//! Integration tests for Parley
//!
//! These drive whole sessions through the supervisor and a loopback speech
//! connection: tool calls end to end, duplicate and unknown calls, timeouts,
//! context pruning, recovery, barge-in, reconnection and rotation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::tempdir;
use tokio::sync::mpsc;

use parley::broadcast::{EventBroadcaster, SessionFilter, Subscription};
use parley::config::{Config, ContextConfig};
use parley::context::{ContextEntry, ContextWindow, PruneOutcome, Role};
use parley::protocol::{InboundEvent, LoopbackConnector, OutboundEvent, RemoteEnd};
use parley::recovery::{
    CheckpointReason, JsonFileStore, PendingToolCall, RecoveryStore, SessionRecoveryRecord,
};
use parley::session::{EndReason, SessionHandle, SessionState, SessionSupervisor};
use parley::tools::builtin::EchoTool;
use parley::tools::{Tool, ToolArgs, ToolContext, ToolMetadata, ToolRegistry};
use parley::ToolError;

// ============================================================================
// Fixtures
// ============================================================================

/// Sleeps for a fixed time, then answers; counts invocations.
struct LookupTool {
    delay: Duration,
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for LookupTool {
    fn name(&self) -> &str {
        "lookup"
    }

    fn description(&self) -> &str {
        "Looks something up"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"q": {"type": "string"}},
            "required": ["q"]
        })
    }

    async fn invoke(&self, args: ToolArgs, _ctx: &ToolContext) -> Result<Value, ToolError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(json!({"q": args.get_str("q"), "answer": 42}))
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            announcement: Some("Let me look that up.".into()),
            ..ToolMetadata::default()
        }
    }
}

struct Rig {
    supervisor: SessionSupervisor,
    remotes: mpsc::UnboundedReceiver<RemoteEnd>,
    connector: Arc<LoopbackConnector>,
    broadcaster: Arc<EventBroadcaster>,
    invocations: Arc<AtomicUsize>,
}

fn quiet_config() -> Config {
    let mut config = Config::default();
    config.session.idle_timeout_secs = 0;
    config
}

fn rig(config: Config, lookup_delay: Duration, store: Option<Arc<dyn RecoveryStore>>) -> Rig {
    let invocations = Arc::new(AtomicUsize::new(0));
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(LookupTool {
        delay: lookup_delay,
        invocations: Arc::clone(&invocations),
    });

    let (connector, remotes) = LoopbackConnector::new(64);
    let connector = Arc::new(connector);
    let broadcaster = Arc::new(EventBroadcaster::new(256));
    let supervisor = SessionSupervisor::new(
        Arc::new(config),
        Arc::new(registry),
        Arc::clone(&broadcaster),
        connector.clone(),
        store,
    );
    Rig {
        supervisor,
        remotes,
        connector,
        broadcaster,
        invocations,
    }
}

/// Spawn a session and complete the handshake up to `processing`.
async fn open(rig: &mut Rig, session_id: &str) -> (SessionHandle, RemoteEnd) {
    let handle = rig
        .supervisor
        .spawn_session(Some(session_id.into()), false)
        .await
        .unwrap();
    let mut remote = rig.remotes.recv().await.unwrap();
    assert!(matches!(
        remote.recv().await,
        Some(OutboundEvent::SessionConfigure(_))
    ));
    for event in [
        InboundEvent::SessionEstablished,
        InboundEvent::SpeechStarted,
        InboundEvent::SpeechStopped,
    ] {
        remote.send(event).await.unwrap();
    }
    wait_for_state(&handle, SessionState::Processing).await;
    (handle, remote)
}

async fn wait_for_state(handle: &SessionHandle, state: SessionState) {
    for _ in 0..200 {
        if handle.status().await.unwrap().state == state {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("session never reached {}", state);
}

async fn call(remote: &RemoteEnd, call_id: &str, name: &str, args: Value) {
    remote
        .send(InboundEvent::CallRequest {
            call_id: call_id.into(),
            name: name.into(),
            arguments_json: args.to_string(),
        })
        .await
        .unwrap();
}

/// Next call-result; asserts the response-request that must follow it.
async fn next_result(remote: &mut RemoteEnd) -> (String, Value, bool) {
    match remote.recv().await {
        Some(OutboundEvent::CallResult {
            call_id,
            output,
            is_error,
        }) => {
            assert_eq!(remote.recv().await, Some(OutboundEvent::ResponseRequest));
            let output = serde_json::from_str(&output).unwrap_or(Value::String(output));
            (call_id, output, is_error)
        }
        other => panic!("expected call_result, got {:?}", other),
    }
}

fn topics(sub: &Subscription) -> Vec<String> {
    sub.drain().iter().map(|e| e.topic.clone()).collect()
}

// ============================================================================
// Tool call scenarios
// ============================================================================

#[tokio::test]
async fn test_lookup_succeeds_end_to_end() {
    let mut rig = rig(quiet_config(), Duration::from_millis(50), None);
    let sub = rig
        .broadcaster
        .subscribe(SessionFilter::Only("s1".into()), ["tool.*"]);
    let (_handle, mut remote) = open(&mut rig, "s1").await;

    call(&remote, "c1", "lookup", json!({"q": "x"})).await;
    let (call_id, output, is_error) = next_result(&mut remote).await;
    assert_eq!(call_id, "c1");
    assert!(!is_error);
    assert_eq!(output["answer"], 42);

    let seen = sub.drain();
    let names: Vec<&str> = seen.iter().map(|e| e.topic.as_str()).collect();
    assert_eq!(names, vec!["tool.started", "tool.completed"]);
    assert_eq!(seen[0].payload["phrase"], "Let me look that up.");
    assert_eq!(seen[1].payload["status"], "succeeded");
    assert!(seen[1].payload["duration_ms"].as_u64().unwrap() >= 50);

    let summary = rig
        .supervisor
        .close("s1", EndReason::UserEnded)
        .await
        .unwrap();
    assert_eq!(summary.metrics.tool_calls, 1);
    assert_eq!(summary.metrics.tool_errors, 0);
}

#[tokio::test]
async fn test_unregistered_tool_fails_immediately() {
    let mut rig = rig(quiet_config(), Duration::ZERO, None);
    let (_handle, mut remote) = open(&mut rig, "s1").await;

    call(&remote, "c1", "nope", json!({})).await;
    let (_, output, is_error) = next_result(&mut remote).await;
    assert!(is_error);
    assert_eq!(output["error"]["kind"], "not_found");
    assert_eq!(output["error"]["recoverable"], false);
    assert!(!output["error"]["suggestion"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_call_id_invokes_once() {
    let mut rig = rig(quiet_config(), Duration::from_millis(5), None);
    let (_handle, mut remote) = open(&mut rig, "s1").await;

    call(&remote, "c1", "lookup", json!({"q": "x"})).await;
    let first = next_result(&mut remote).await;
    call(&remote, "c1", "lookup", json!({"q": "x"})).await;
    let second = next_result(&mut remote).await;

    assert_eq!(first, second);
    assert_eq!(rig.invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_tool_exceeding_deadline_times_out() {
    let mut config = quiet_config();
    config.tools.direct_timeout_ms = 2_000;
    let mut rig = rig(config, Duration::from_secs(10), None);
    let sub = rig
        .broadcaster
        .subscribe(SessionFilter::Any, ["tool.completed"]);
    let (_handle, mut remote) = open(&mut rig, "s1").await;

    call(&remote, "c1", "lookup", json!({"q": "slow"})).await;
    let (_, output, is_error) = next_result(&mut remote).await;
    assert!(is_error);
    assert_eq!(output["error"]["kind"], "timeout");
    assert_eq!(output["error"]["recoverable"], true);
    assert!(!output["error"]["suggestion"].as_str().unwrap().is_empty());

    let completed = sub.drain();
    assert_eq!(completed[0].payload["status"], "timed_out");
}

#[tokio::test]
async fn test_independent_calls_each_answered() {
    let mut rig = rig(quiet_config(), Duration::from_millis(20), None);
    let (handle, mut remote) = open(&mut rig, "s1").await;

    call(&remote, "c1", "lookup", json!({"q": "a"})).await;
    call(&remote, "c2", "echo", json!({"message": "b"})).await;
    let mut ids = vec![
        next_result(&mut remote).await.0,
        next_result(&mut remote).await.0,
    ];
    ids.sort();
    assert_eq!(ids, vec!["c1", "c2"]);

    remote
        .send(InboundEvent::ResponseDone { response_id: None })
        .await
        .unwrap();
    wait_for_state(&handle, SessionState::Ready).await;
    assert!(handle.status().await.unwrap().calls.is_empty());
}

// ============================================================================
// Context pruning
// ============================================================================

#[test]
fn test_pruning_replaces_prefix_and_keeps_recent() {
    let mut window = ContextWindow::new(&ContextConfig {
        ceiling_tokens: 1_000,
        headroom_tokens: 0,
        prune_threshold: 0.80,
        keep_recent: 5,
        summary_ratio: 0.10,
    });
    // 20 entries of 50 tokens each: 1000 tokens, past the 800 trigger.
    for i in 0..20 {
        let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
        window.append(ContextEntry::new(role, format!("{:02}{}", i, "x".repeat(198))));
    }
    let tail: Vec<String> = window.entries()[15..]
        .iter()
        .map(|e| e.content.clone())
        .collect();

    let outcome = window.prune_if_needed();
    assert!(matches!(outcome, PruneOutcome::Pruned { runs: 1, replaced_entries: 15, .. }));
    assert!(window.current_size() <= 1_000);

    let entries = window.entries();
    assert_eq!(entries.len(), 6);
    assert_eq!(entries.iter().filter(|e| e.is_summary).count(), 1);
    assert!(entries[0].is_summary);
    let kept: Vec<String> = entries[1..].iter().map(|e| e.content.clone()).collect();
    assert_eq!(kept, tail);
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_recovery_record_round_trips_through_file_store() {
    let dir = tempdir().unwrap();
    let store = JsonFileStore::new(dir.path()).unwrap();

    let mut record = SessionRecoveryRecord::new("s-42", CheckpointReason::Rotation);
    record.context_summary = "User: booked a table for two".into();
    record.last_turns = vec![ContextEntry::new(Role::User, "make it 8pm")];
    record.pending_tool_calls = vec![PendingToolCall {
        call_id: "c9".into(),
        tool_name: "lookup".into(),
        arguments: json!({"q": "opening hours"}),
    }];
    record.preferences.insert("units".into(), "metric".into());

    store.save(&record).await.unwrap();
    assert_eq!(store.load("s-42").await.unwrap(), Some(record.clone()));
    assert_eq!(store.list().await.unwrap(), vec!["s-42".to_string()]);
    assert_eq!(store.take("s-42").await.unwrap(), Some(record));
    assert_eq!(store.load("s-42").await.unwrap(), None);
}

#[tokio::test]
async fn test_closed_session_resumes_with_seed() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn RecoveryStore> = Arc::new(JsonFileStore::new(dir.path()).unwrap());
    let mut rig = rig(quiet_config(), Duration::ZERO, Some(Arc::clone(&store)));

    let (handle, remote) = open(&mut rig, "s1").await;
    remote
        .send(InboundEvent::InputTranscript {
            item_id: "i1".into(),
            text: "Book a table at Nomad for Friday".into(),
        })
        .await
        .unwrap();
    handle.set_preference("language", "en").await.unwrap();
    for _ in 0..200 {
        if handle.status().await.unwrap().context_tokens > 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    rig.supervisor
        .close("s1", EndReason::UserEnded)
        .await
        .unwrap();

    let saved = store.load("s1").await.unwrap().unwrap();
    assert_eq!(saved.reason, CheckpointReason::Teardown);

    let resumed = rig
        .supervisor
        .spawn_session(Some("s1".into()), true)
        .await
        .unwrap();
    let mut remote = rig.remotes.recv().await.unwrap();
    assert!(matches!(
        remote.recv().await,
        Some(OutboundEvent::SessionConfigure(_))
    ));
    match remote.recv().await {
        Some(OutboundEvent::ContextSeed { text }) => {
            assert!(text.contains("Book a table at Nomad"));
            assert!(text.contains("language: en"));
        }
        other => panic!("expected context seed, got {:?}", other),
    }
    assert_eq!(
        resumed.status().await.unwrap().preferences["language"],
        "en"
    );
}

// ============================================================================
// Barge-in
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_interruption_reports_only_flushed_audio() {
    let mut rig = rig(quiet_config(), Duration::ZERO, None);
    let (handle, mut remote) = open(&mut rig, "s1").await;

    remote
        .send(InboundEvent::ResponseChunk {
            response_id: "r1".into(),
            item_id: "item_7".into(),
            kind: parley::protocol::ChunkKind::Audio { bytes: 96_000 },
        })
        .await
        .unwrap();
    wait_for_state(&handle, SessionState::Speaking).await;
    handle.playback_started().await.unwrap();
    handle.playback_flushed(24_000).await.unwrap();
    handle.status().await.unwrap();

    tokio::time::advance(Duration::from_secs(3)).await;
    remote.send(InboundEvent::SpeechStarted).await.unwrap();
    match remote.recv().await {
        Some(OutboundEvent::Truncate { item_id, audio_ms }) => {
            assert_eq!(item_id, "item_7");
            // 24000 bytes at 48 bytes/ms, although 3s have passed.
            assert_eq!(audio_ms, 500);
        }
        other => panic!("expected truncate, got {:?}", other),
    }
    assert_eq!(remote.recv().await, Some(OutboundEvent::ClearOutputAudio));
}

// ============================================================================
// Reconnection and rotation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_transport_loss() {
    let mut rig = rig(quiet_config(), Duration::ZERO, None);
    let sub = rig
        .broadcaster
        .subscribe(SessionFilter::Any, ["session.reconnecting"]);
    let (handle, remote) = open(&mut rig, "s1").await;

    rig.connector.fail_next(2);
    remote
        .send(InboundEvent::TransportError {
            message: "socket reset".into(),
        })
        .await
        .unwrap();
    drop(remote);

    let mut remote = rig.remotes.recv().await.unwrap();
    assert_eq!(remote.connection, 2);
    assert!(matches!(
        remote.recv().await,
        Some(OutboundEvent::SessionConfigure(_))
    ));
    assert!(matches!(
        remote.recv().await,
        Some(OutboundEvent::ContextSeed { .. })
    ));
    assert_eq!(topics(&sub).len(), 3);

    let status = handle.status().await.unwrap();
    assert_eq!(status.epoch, 2);
    let summary = rig
        .supervisor
        .close("s1", EndReason::UserEnded)
        .await
        .unwrap();
    assert_eq!(summary.metrics.reconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn test_budget_expiry_rotates_connection() {
    let mut config = quiet_config();
    config.session.max_duration_secs = 60;
    config.session.warning_before_secs = 10;
    let mut rig = rig(config, Duration::ZERO, None);
    let sub = rig
        .broadcaster
        .subscribe(SessionFilter::Only("s1".into()), ["session.budget_warning", "session.rotating"]);
    let (_handle, remote) = open(&mut rig, "s1").await;
    remote
        .send(InboundEvent::InputTranscript {
            item_id: "i1".into(),
            text: "Remind me to water the plants".into(),
        })
        .await
        .unwrap();

    let mut next = rig.remotes.recv().await.unwrap();
    assert_eq!(next.connection, 2);
    assert!(matches!(
        next.recv().await,
        Some(OutboundEvent::SessionConfigure(_))
    ));
    match next.recv().await {
        Some(OutboundEvent::ContextSeed { text }) => {
            assert!(text.contains("water the plants"));
        }
        other => panic!("expected context seed, got {:?}", other),
    }
    assert_eq!(
        topics(&sub),
        vec!["session.budget_warning", "session.rotating"]
    );
    drop(remote);
}

//! Simulate command: play the speech model from a script.
//!
//! Each line of the script is a realtime event object, decoded exactly as a
//! live connection would decode it. A few `sim.*` directives drive the parts
//! a script cannot express as protocol events:
//!
//! - `{"type": "sim.sleep", "ms": 250}`
//! - `{"type": "sim.playback_started"}` / `{"type": "sim.playback_flushed", "bytes": 4800}`
//! - `{"type": "sim.disconnect"}` drops the connection so the session reconnects
//! - `{"type": "sim.status"}` prints the session status
//!
//! Outbound events are printed as `>> {json}`, broadcasts as `** topic {payload}`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use parley::broadcast::{EventBroadcaster, SessionFilter};
use parley::config::Config;
use parley::protocol::wire::{decode_inbound, encode_outbound};
use parley::protocol::{InboundEvent, LoopbackConnector, RemoteEnd};
use parley::recovery::{JsonFileStore, MemoryStore, RecoveryStore};
use parley::session::{EndReason, SessionHandle, SessionSupervisor};
use parley::tools::builtin::{EchoTool, WaitTool};
use parley::tools::ToolRegistry;

pub(crate) struct SimulateOptions {
    pub script: PathBuf,
    pub session: Option<String>,
    pub resume: bool,
    pub persist: bool,
    pub settle_ms: u64,
}

/// Script lines that are not protocol events.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type")]
enum Directive {
    #[serde(rename = "sim.sleep")]
    Sleep { ms: u64 },
    #[serde(rename = "sim.playback_started")]
    PlaybackStarted,
    #[serde(rename = "sim.playback_flushed")]
    PlaybackFlushed { bytes: u64 },
    #[serde(rename = "sim.disconnect")]
    Disconnect,
    #[serde(rename = "sim.status")]
    Status,
}

enum Line {
    Directive(Directive),
    Event(InboundEvent),
    Skip,
}

fn parse_line(raw: &str) -> Result<Line> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(Line::Skip);
    }
    if trimmed.contains("\"sim.") {
        if let Ok(directive) = serde_json::from_str::<Directive>(trimmed) {
            return Ok(Line::Directive(directive));
        }
    }
    match decode_inbound(trimmed)? {
        Some(event) => Ok(Line::Event(event)),
        None => Ok(Line::Skip),
    }
}

/// The speech-model side of the current connection.
struct Remote {
    inbound: mpsc::Sender<InboundEvent>,
    printer: JoinHandle<()>,
}

impl Remote {
    fn attach(remote: RemoteEnd) -> Self {
        let RemoteEnd {
            inbound,
            mut outbound,
            connection,
            ..
        } = remote;
        println!("-- connection {}", connection);
        let printer = tokio::spawn(async move {
            while let Some(event) = outbound.recv().await {
                println!(">> {}", encode_outbound(&event));
            }
        });
        Self { inbound, printer }
    }

    fn hang_up(self) {
        self.printer.abort();
    }
}

pub(crate) async fn cmd_simulate(config: Config, options: SimulateOptions) -> Result<()> {
    let script = std::fs::read_to_string(&options.script)
        .with_context(|| format!("Failed to read script {}", options.script.display()))?;
    config.validate()?;

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(WaitTool);

    let store: Arc<dyn RecoveryStore> = if options.persist {
        Arc::new(JsonFileStore::new(config.recovery_dir())?)
    } else {
        Arc::new(MemoryStore::new())
    };

    let broadcaster = Arc::new(EventBroadcaster::new(
        config.broadcast.subscriber_queue_capacity,
    ));
    let subscription = broadcaster.subscribe(SessionFilter::Any, ["*"]);
    let events = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            println!("** {} {}", event.topic, event.payload);
        }
    });

    let (connector, mut remotes) = LoopbackConnector::new(config.session.channel_buffer);
    let supervisor = SessionSupervisor::new(
        Arc::new(config),
        Arc::new(registry),
        Arc::clone(&broadcaster),
        Arc::new(connector),
        Some(store),
    );
    let handle = supervisor
        .spawn_session(options.session, options.resume)
        .await?;
    println!("-- session {}", handle.session_id());

    let Some(first) = remotes.recv().await else {
        bail!("session ended before connecting");
    };
    let mut remote = Remote::attach(first);

    for (number, raw) in script.lines().enumerate() {
        let line = parse_line(raw).with_context(|| format!("script line {}", number + 1))?;
        match line {
            Line::Skip => {}
            Line::Event(event) => {
                if remote.inbound.send(event).await.is_err() {
                    println!("-- session closed at script line {}", number + 1);
                    break;
                }
            }
            Line::Directive(directive) => {
                match run_directive(directive, &handle, remote, &mut remotes).await? {
                    Some(next) => remote = next,
                    None => {
                        println!("-- session closed at script line {}", number + 1);
                        events.abort();
                        return Ok(());
                    }
                }
            }
        }
    }

    tokio::time::sleep(Duration::from_millis(options.settle_ms)).await;
    let summary = supervisor
        .close(handle.session_id(), EndReason::UserEnded)
        .await?;
    remote.hang_up();
    tokio::time::sleep(Duration::from_millis(20)).await;
    events.abort();

    println!("-- summary");
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Returns the connection to keep using, or `None` when the session is gone.
async fn run_directive(
    directive: Directive,
    handle: &SessionHandle,
    remote: Remote,
    remotes: &mut mpsc::UnboundedReceiver<RemoteEnd>,
) -> Result<Option<Remote>> {
    match directive {
        Directive::Sleep { ms } => tokio::time::sleep(Duration::from_millis(ms)).await,
        Directive::PlaybackStarted => handle.playback_started().await?,
        Directive::PlaybackFlushed { bytes } => handle.playback_flushed(bytes).await?,
        Directive::Status => {
            let status = handle.status().await?;
            println!("-- status {}", serde_json::to_string(&status)?);
        }
        Directive::Disconnect => {
            remote.hang_up();
            return Ok(remotes.recv().await.map(Remote::attach));
        }
    }
    Ok(Some(remote))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directives() {
        match parse_line(r#"{"type": "sim.sleep", "ms": 20}"#).unwrap() {
            Line::Directive(d) => assert_eq!(d, Directive::Sleep { ms: 20 }),
            _ => panic!("expected directive"),
        }
        match parse_line(r#"{"type":"sim.disconnect"}"#).unwrap() {
            Line::Directive(d) => assert_eq!(d, Directive::Disconnect),
            _ => panic!("expected directive"),
        }
    }

    #[test]
    fn test_parse_protocol_event() {
        match parse_line(r#"{"type": "input_audio_buffer.speech_started"}"#).unwrap() {
            Line::Event(event) => assert_eq!(event, InboundEvent::SpeechStarted),
            _ => panic!("expected event"),
        }
    }

    #[test]
    fn test_blank_and_comment_lines_skipped() {
        assert!(matches!(parse_line("   ").unwrap(), Line::Skip));
        assert!(matches!(parse_line("# greeting").unwrap(), Line::Skip));
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        assert!(parse_line("{not json").is_err());
    }
}

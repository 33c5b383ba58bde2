//! Speech-model protocol
//!
//! Domain-level events exchanged with the speech model, independent of how
//! they are framed on the wire (see [`wire`] for the realtime JSON mapping),
//! and the [`SpeechConnector`] seam that opens a connection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  InboundEvent   ┌──────────────────────┐
//! │ speech model │────────────────>│ SessionOrchestrator  │
//! │ (connector)  │<────────────────│ (one task / session) │
//! └──────────────┘  OutboundEvent  └──────────────────────┘
//! ```
//!
//! A connection is a [`SpeechLink`]: one inbound receiver and one outbound
//! sender. The inbound channel closing, or a send failing, is a transport
//! failure and triggers reconnection.

pub mod loopback;
pub mod wire;

pub use loopback::{LoopbackConnector, RemoteEnd};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::TurnDetectionConfig;
use crate::error::{ParleyError, Result};
use crate::tools::ToolDefinition;

/// What a response chunk carries.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkKind {
    /// Decoded audio of `bytes` length, ready for the output device.
    Audio { bytes: usize },
    /// Incremental transcript of the spoken response.
    Transcript { delta: String },
}

/// Events received from the speech model.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    SessionEstablished,
    SpeechStarted,
    /// The user stopped speaking and the input was committed.
    SpeechStopped,
    InputTranscript {
        item_id: String,
        text: String,
    },
    CallRequest {
        call_id: String,
        name: String,
        arguments_json: String,
    },
    ResponseChunk {
        response_id: String,
        item_id: String,
        kind: ChunkKind,
    },
    ResponseDone {
        response_id: Option<String>,
    },
    /// The speech model stored the call-result for `call_id`.
    CallResultAcknowledged {
        call_id: String,
    },
    Error {
        code: Option<String>,
        message: String,
    },
    /// Produced by a connector when the underlying connection fails.
    TransportError {
        message: String,
    },
}

impl InboundEvent {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::SessionEstablished => "session_established",
            InboundEvent::SpeechStarted => "speech_started",
            InboundEvent::SpeechStopped => "speech_stopped",
            InboundEvent::InputTranscript { .. } => "input_transcript",
            InboundEvent::CallRequest { .. } => "call_request",
            InboundEvent::ResponseChunk { .. } => "response_chunk",
            InboundEvent::ResponseDone { .. } => "response_done",
            InboundEvent::CallResultAcknowledged { .. } => "call_result_acknowledged",
            InboundEvent::Error { .. } => "error",
            InboundEvent::TransportError { .. } => "transport_error",
        }
    }
}

/// Session setup sent right after connecting.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfigure {
    pub instructions: String,
    pub tools: Vec<ToolDefinition>,
    pub turn_detection: TurnDetectionConfig,
    pub voice: String,
}

/// Events sent to the speech model.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    SessionConfigure(SessionConfigure),
    /// Always followed by a `ResponseRequest`.
    CallResult {
        call_id: String,
        output: String,
        is_error: bool,
    },
    ResponseRequest,
    /// Cut the assistant item at `audio_ms` of played audio.
    Truncate {
        item_id: String,
        audio_ms: u64,
    },
    /// System message injected into the conversation.
    ContextSeed {
        text: String,
    },
    /// Drop audio buffered for playback but not yet played.
    ClearOutputAudio,
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::SessionConfigure(_) => "session_configure",
            OutboundEvent::CallResult { .. } => "call_result",
            OutboundEvent::ResponseRequest => "response_request",
            OutboundEvent::Truncate { .. } => "truncate",
            OutboundEvent::ContextSeed { .. } => "context_seed",
            OutboundEvent::ClearOutputAudio => "clear_output_audio",
        }
    }
}

/// One live connection to the speech model.
#[derive(Debug)]
pub struct SpeechLink {
    pub inbound: mpsc::Receiver<InboundEvent>,
    pub outbound: mpsc::Sender<OutboundEvent>,
}

impl SpeechLink {
    /// Send an outbound event. A closed channel is a transport failure.
    pub async fn send(&self, event: OutboundEvent) -> Result<()> {
        let name = event.name();
        self.outbound
            .send(event)
            .await
            .map_err(|_| ParleyError::Transport(format!("outbound channel closed sending {}", name)))
    }
}

/// Opens connections to the speech model.
#[async_trait]
pub trait SpeechConnector: Send + Sync {
    /// Connect (or reconnect) on behalf of `session_id`.
    async fn connect(&self, session_id: &str) -> Result<SpeechLink>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_on_closed_link_is_transport_error() {
        let (_in_tx, inbound) = mpsc::channel(1);
        let (outbound, out_rx) = mpsc::channel(1);
        drop(out_rx);
        let link = SpeechLink { inbound, outbound };
        let err = link.send(OutboundEvent::ResponseRequest).await.unwrap_err();
        assert!(err.is_transport());
        assert!(err.to_string().contains("response_request"));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(
            InboundEvent::CallRequest {
                call_id: "c".into(),
                name: "n".into(),
                arguments_json: "{}".into()
            }
            .name(),
            "call_request"
        );
        assert_eq!(OutboundEvent::ClearOutputAudio.name(), "clear_output_audio");
    }
}

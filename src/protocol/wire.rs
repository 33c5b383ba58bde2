//! Realtime JSON wire codec.
//!
//! Maps realtime API event objects (`{"type": "...", ...}`) to and from the
//! domain events in [`super`]. Inbound event types the orchestrator does not
//! act on decode to `None`.

use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ChunkKind, InboundEvent, OutboundEvent, SessionConfigure};
use crate::error::{ParleyError, Result};

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum WireInbound {
    #[serde(rename = "session.created")]
    SessionCreated {},
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {},
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {},
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        #[serde(default)]
        item_id: String,
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    #[serde(rename = "response.output_audio.delta", alias = "response.audio.delta")]
    AudioDelta {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        delta: String,
    },
    #[serde(
        rename = "response.output_audio_transcript.delta",
        alias = "response.audio_transcript.delta"
    )]
    TranscriptDelta {
        #[serde(default)]
        response_id: String,
        #[serde(default)]
        item_id: String,
        delta: String,
    },
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: Option<Value>,
    },
    #[serde(rename = "conversation.item.created", alias = "conversation.item.added")]
    ItemCreated { item: Value },
    #[serde(rename = "error")]
    Error { error: WireError },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: String,
}

/// Decode one inbound wire event. `Ok(None)` for event types that carry
/// nothing the orchestrator needs.
pub fn decode_inbound(raw: &str) -> Result<Option<InboundEvent>> {
    let wire: WireInbound = serde_json::from_str(raw)
        .map_err(|e| ParleyError::Protocol(format!("Malformed inbound event: {}", e)))?;

    let event = match wire {
        WireInbound::SessionCreated {} => InboundEvent::SessionEstablished,
        WireInbound::SpeechStarted {} => InboundEvent::SpeechStarted,
        WireInbound::SpeechStopped {} => InboundEvent::SpeechStopped,
        WireInbound::TranscriptionCompleted {
            item_id,
            transcript,
        } => InboundEvent::InputTranscript {
            item_id,
            text: transcript,
        },
        WireInbound::FunctionCallArgumentsDone {
            call_id,
            name,
            arguments,
        } => InboundEvent::CallRequest {
            call_id,
            name,
            arguments_json: arguments,
        },
        WireInbound::AudioDelta {
            response_id,
            item_id,
            delta,
        } => {
            let audio = base64::engine::general_purpose::STANDARD
                .decode(delta.as_bytes())
                .map_err(|e| ParleyError::Protocol(format!("Audio delta is not base64: {}", e)))?;
            InboundEvent::ResponseChunk {
                response_id,
                item_id,
                kind: ChunkKind::Audio { bytes: audio.len() },
            }
        }
        WireInbound::TranscriptDelta {
            response_id,
            item_id,
            delta,
        } => InboundEvent::ResponseChunk {
            response_id,
            item_id,
            kind: ChunkKind::Transcript { delta },
        },
        WireInbound::ResponseDone { response } => InboundEvent::ResponseDone {
            response_id: response
                .as_ref()
                .and_then(|r| r.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        WireInbound::ItemCreated { item } => {
            if item.get("type").and_then(Value::as_str) != Some("function_call_output") {
                return Ok(None);
            }
            match item.get("call_id").and_then(Value::as_str) {
                Some(call_id) => InboundEvent::CallResultAcknowledged {
                    call_id: call_id.to_string(),
                },
                None => return Ok(None),
            }
        }
        WireInbound::Error { error } => InboundEvent::Error {
            code: error.code,
            message: error.message,
        },
        WireInbound::Unknown => return Ok(None),
    };
    Ok(Some(event))
}

/// Encode an outbound event as a realtime API event object.
pub fn encode_outbound(event: &OutboundEvent) -> Value {
    match event {
        OutboundEvent::SessionConfigure(cfg) => encode_session_update(cfg),
        OutboundEvent::CallResult {
            call_id, output, ..
        } => json!({
            "type": "conversation.item.create",
            "item": {
                "type": "function_call_output",
                "call_id": call_id,
                "output": output,
            }
        }),
        OutboundEvent::ResponseRequest => json!({"type": "response.create"}),
        OutboundEvent::Truncate { item_id, audio_ms } => json!({
            "type": "conversation.item.truncate",
            "item_id": item_id,
            "content_index": 0,
            "audio_end_ms": audio_ms,
        }),
        OutboundEvent::ContextSeed { text } => json!({
            "type": "conversation.item.create",
            "item": {
                "type": "message",
                "role": "system",
                "content": [{"type": "input_text", "text": text}],
            }
        }),
        OutboundEvent::ClearOutputAudio => json!({"type": "output_audio_buffer.clear"}),
    }
}

fn encode_session_update(cfg: &SessionConfigure) -> Value {
    let tools: Vec<Value> = cfg
        .tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "name": t.name,
                "description": t.description,
                "parameters": t.parameters,
            })
        })
        .collect();
    json!({
        "type": "session.update",
        "session": {
            "type": "realtime",
            "instructions": cfg.instructions,
            "tools": tools,
            "tool_choice": "auto",
            "audio": {
                "input": {
                    "turn_detection": {
                        "type": "server_vad",
                        "threshold": cfg.turn_detection.threshold,
                        "prefix_padding_ms": cfg.turn_detection.prefix_padding_ms,
                        "silence_duration_ms": cfg.turn_detection.silence_duration_ms,
                    }
                },
                "output": {"voice": cfg.voice}
            }
        }
    })
}

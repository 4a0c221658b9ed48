//! The realtime provider's event dialect, as seen by the client.
//!
//! The gateway forwards these frames verbatim; only the session state machine
//! builds and interprets them.

use crate::{
    control::{ERROR, SESSION_CONNECTED, SESSION_DISCONNECTED},
    frame::Frame,
    message::Role,
    pcm,
};
use serde::{Deserialize, Serialize};

pub const USER_TRANSCRIPT_DELTA: &str = "conversation.item.input_audio_transcription.delta";
pub const USER_TRANSCRIPT_DONE: &str = "conversation.item.input_audio_transcription.completed";
pub const ASSISTANT_TRANSCRIPT_DELTA: &str = "response.audio_transcript.delta";
pub const ASSISTANT_TRANSCRIPT_DONE: &str = "response.audio_transcript.done";
pub const AUDIO_DELTA: &str = "response.audio.delta";
pub const RESPONSE_DONE: &str = "response.done";

/// Events the client (or the gateway, for `session.update`) sends to the provider.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Appends base64 PCM16 audio to the provider's input buffer.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },
    /// Marks the end of the current utterance.
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioCommit,
    /// Asks the provider to respond to the committed input.
    #[serde(rename = "response.create")]
    ResponseCreate,
    /// Configures the provider session. Sent by the gateway on upstream open.
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },
}

impl ClientEvent {
    pub fn append_audio(samples: &[i16]) -> Self {
        ClientEvent::InputAudioAppend {
            audio: pcm::encode_base64(samples),
        }
    }

    pub fn to_frame(&self) -> serde_json::Result<Frame> {
        Ok(Frame::Text(serde_json::to_string(self)?))
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub modalities: Vec<String>,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: Option<TranscriptionSettings>,
    /// `None` serializes as `null`, which disables server-side turn detection:
    /// utterances end when the client commits the input buffer.
    pub turn_detection: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TranscriptionSettings {
    pub model: String,
}

/// Where an `error` frame came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOrigin {
    /// `{type: "error", message}` produced by the relay itself.
    Gateway,
    /// `{type: "error", error: {...}}` forwarded from the provider.
    Provider,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub origin: ErrorOrigin,
    pub message: String,
    pub code: Option<String>,
}

/// Every inbound frame the session state machine reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    SessionConnected,
    SessionDisconnected,
    TranscriptDelta { role: Role, delta: String },
    /// Finalizes the in-flight transcript. `transcript` is the provider's own
    /// rendition of the full turn, when it sends one.
    TranscriptDone { role: Role, transcript: Option<String> },
    AudioDelta(Vec<i16>),
    ResponseDone,
    Error(ErrorFrame),
    /// A well-formed event the session has no use for.
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("`{kind}` frame is missing `{field}`")]
    MissingField { kind: String, field: &'static str },
    #[error("invalid audio payload: {0}")]
    InvalidAudio(String),
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    delta: Option<String>,
    transcript: Option<String>,
    message: Option<String>,
    error: Option<RawError>,
}

#[derive(Deserialize)]
struct RawError {
    message: Option<String>,
    code: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

/// Parses one inbound frame. Binary frames are raw PCM16 audio output.
pub fn parse_inbound(frame: &Frame) -> Result<InboundEvent, ProtocolError> {
    let text = match frame {
        Frame::Binary(data) => return Ok(InboundEvent::AudioDelta(pcm::samples_from_le_bytes(data))),
        Frame::Text(text) => text,
    };
    let raw: RawEvent =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let event = match raw.kind.as_str() {
        SESSION_CONNECTED => InboundEvent::SessionConnected,
        SESSION_DISCONNECTED => InboundEvent::SessionDisconnected,
        USER_TRANSCRIPT_DELTA => InboundEvent::TranscriptDelta {
            role: Role::User,
            delta: required(&raw.kind, "delta", raw.delta)?,
        },
        ASSISTANT_TRANSCRIPT_DELTA => InboundEvent::TranscriptDelta {
            role: Role::Assistant,
            delta: required(&raw.kind, "delta", raw.delta)?,
        },
        USER_TRANSCRIPT_DONE => InboundEvent::TranscriptDone {
            role: Role::User,
            transcript: raw.transcript,
        },
        ASSISTANT_TRANSCRIPT_DONE => InboundEvent::TranscriptDone {
            role: Role::Assistant,
            transcript: raw.transcript,
        },
        AUDIO_DELTA => {
            let delta = required(&raw.kind, "delta", raw.delta)?;
            let samples = pcm::decode_base64(&delta)
                .map_err(|e| ProtocolError::InvalidAudio(e.to_string()))?;
            InboundEvent::AudioDelta(samples)
        }
        RESPONSE_DONE => InboundEvent::ResponseDone,
        ERROR => InboundEvent::Error(error_frame(raw)?),
        _ => InboundEvent::Other(raw.kind),
    };
    Ok(event)
}

fn required(
    kind: &str,
    field: &'static str,
    value: Option<String>,
) -> Result<String, ProtocolError> {
    value.ok_or_else(|| ProtocolError::MissingField {
        kind: kind.to_string(),
        field,
    })
}

fn error_frame(raw: RawEvent) -> Result<ErrorFrame, ProtocolError> {
    if let Some(message) = raw.message {
        return Ok(ErrorFrame {
            origin: ErrorOrigin::Gateway,
            message,
            code: None,
        });
    }
    let error = raw.error.ok_or_else(|| ProtocolError::MissingField {
        kind: ERROR.to_string(),
        field: "message",
    })?;
    Ok(ErrorFrame {
        origin: ErrorOrigin::Provider,
        message: error
            .message
            .unwrap_or_else(|| "unknown provider error".to_string()),
        code: error.code.or(error.kind),
    })
}

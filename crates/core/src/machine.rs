//! Session State Machine
//!
//! `SessionMachine` is the single owner of a session's data. It performs no
//! I/O: operations and [`SessionEvent`]s go in, [`Effect`]s come out, and the
//! runtime in [`crate::session`] carries them out in order.

use crate::error::SessionError;
use practice_protocol::{ErrorFrame, ErrorOrigin, InboundEvent, Message, Role, pcm};
use serde::Serialize;
use std::fmt;

/// Provider error codes that mean the upstream leg cannot be used again.
const FATAL_PROVIDER_CODES: &[&str] = &["invalid_api_key", "authentication_error", "insufficient_quota"];

const PROVIDER_DISCONNECTED: &str = "voice provider disconnected";
const GATEWAY_CONNECTION_LOST: &str = "connection to the gateway was lost";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Recording,
    Speaking,
    Disconnected,
    Error,
}

impl SessionState {
    /// The gateway acknowledged the session and it has not ended since.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Recording | SessionState::Speaking
        )
    }

    /// `Disconnected` and `Error` need a fresh `connect()` to resume.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Recording => "recording",
            SessionState::Speaking => "speaking",
            SessionState::Disconnected => "disconnected",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Immutable view of the session handed to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub is_connected: bool,
    pub is_connecting: bool,
    pub is_recording: bool,
    pub is_speaking: bool,
    pub audio_level: f32,
    pub transcript: String,
    pub messages: Vec<Message>,
    pub connection_error: Option<String>,
}

/// Everything that can happen to a session besides a caller operation.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    TransportOpened,
    TransportFailed(SessionError),
    TransportClosed { reason: Option<String> },
    /// A frame could not be written to the gateway socket.
    SendFailed(SessionError),
    Inbound(InboundEvent),
    ConnectTimedOut,
    MicrophoneReady,
    MicrophoneFailed(String),
    Captured(Vec<i16>),
    CaptureEnded,
    PlaybackIdle,
    PlaybackFailed(String),
}

/// Frames the session asks the runtime to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Initialize,
    Audio(Vec<i16>),
    /// Commits the input buffer and requests a response.
    EndOfUtterance,
}

/// Side effects, executed by the runtime in the order given.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    OpenTransport,
    CloseTransport,
    Send(Outbound),
    AcquireMicrophone,
    /// Cancels a pending acquisition or releases the open capture. With
    /// `flush`, undelivered samples are sent before anything that follows.
    ReleaseMicrophone { flush: bool },
    Play(Vec<i16>),
    StopPlayback,
    ArmConnectTimer,
    DisarmConnectTimer,
    /// Resolves every pending `connect()`/`reinitialize()` caller.
    ConnectSettled(Result<(), SessionError>),
    /// Resolves every pending `start_recording()` caller.
    RecordingSettled(Result<(), SessionError>),
}

/// Text received for turns that have not been finalized yet, one buffer per
/// speaker. User and assistant transcription events may interleave.
#[derive(Debug, Default)]
struct Transcripts {
    user: String,
    assistant: String,
    /// Speaker whose buffer was appended to most recently.
    latest: Option<Role>,
}

impl Transcripts {
    fn buffer(&mut self, role: Role) -> &mut String {
        match role {
            Role::User => &mut self.user,
            Role::Assistant => &mut self.assistant,
        }
    }

    fn push(&mut self, role: Role, delta: &str) {
        self.buffer(role).push_str(delta);
        self.latest = Some(role);
    }

    fn take(&mut self, role: Role) -> String {
        let content = std::mem::take(self.buffer(role));
        if self.latest == Some(role) {
            let other = match role {
                Role::User => Role::Assistant,
                Role::Assistant => Role::User,
            };
            self.latest = (!self.buffer(other).is_empty()).then_some(other);
        }
        content
    }

    /// The in-progress turn shown to the caller.
    fn current(&self) -> &str {
        match self.latest {
            Some(Role::User) => &self.user,
            Some(Role::Assistant) => &self.assistant,
            None => "",
        }
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

pub struct SessionMachine {
    state: SessionState,
    transcript: Transcripts,
    messages: Vec<Message>,
    connection_error: Option<String>,
    audio_level: f32,
    /// Socket to the gateway is open (only meaningful while `Connecting`).
    transport_open: bool,
    /// The gateway's provider leg is acknowledged and has not closed since.
    upstream_ready: bool,
    microphone_pending: bool,
    initialize_sent: u32,
    initialize_attempts: u32,
}

impl SessionMachine {
    pub fn new(initialize_attempts: u32) -> Self {
        Self {
            state: SessionState::Idle,
            transcript: Transcripts::default(),
            messages: Vec::new(),
            connection_error: None,
            audio_level: 0.0,
            transport_open: false,
            upstream_ready: false,
            microphone_pending: false,
            initialize_sent: 0,
            initialize_attempts: initialize_attempts.max(1),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn transcript(&self) -> &str {
        self.transcript.current()
    }

    pub fn connection_error(&self) -> Option<&str> {
        self.connection_error.as_deref()
    }

    pub fn upstream_ready(&self) -> bool {
        self.upstream_ready
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            is_connected: self.state.is_live(),
            is_connecting: self.state == SessionState::Connecting,
            is_recording: self.state == SessionState::Recording,
            is_speaking: self.state == SessionState::Speaking,
            audio_level: self.audio_level,
            transcript: self.transcript.current().to_string(),
            messages: self.messages.clone(),
            connection_error: self.connection_error.clone(),
        }
    }

    // --- Operations ---

    pub fn connect(&mut self) -> Vec<Effect> {
        match self.state {
            SessionState::Connecting => vec![],
            state if state.is_live() => vec![Effect::ConnectSettled(Ok(()))],
            _ => {
                self.state = SessionState::Connecting;
                self.transcript.clear();
                self.messages.clear();
                self.connection_error = None;
                self.audio_level = 0.0;
                self.transport_open = false;
                self.upstream_ready = false;
                self.initialize_sent = 0;
                vec![Effect::OpenTransport, Effect::ArmConnectTimer]
            }
        }
    }

    /// Reopens the provider leg over the socket that is already open.
    pub fn reinitialize(&mut self) -> Result<Vec<Effect>, SessionError> {
        if self.state != SessionState::Connected || self.microphone_pending {
            return Err(SessionError::InvalidState {
                operation: "reinitialize",
                state: self.state,
            });
        }
        self.state = SessionState::Connecting;
        self.transport_open = true;
        self.upstream_ready = false;
        self.initialize_sent = 1;
        Ok(vec![
            Effect::ArmConnectTimer,
            Effect::Send(Outbound::Initialize),
        ])
    }

    pub fn start_recording(&mut self) -> Vec<Effect> {
        match self.state {
            SessionState::Recording => vec![Effect::RecordingSettled(Ok(()))],
            SessionState::Connected if self.microphone_pending => vec![],
            SessionState::Connected if !self.upstream_ready => {
                vec![Effect::RecordingSettled(Err(SessionError::UpstreamUnavailable))]
            }
            SessionState::Connected => {
                self.microphone_pending = true;
                vec![Effect::AcquireMicrophone]
            }
            state => vec![Effect::RecordingSettled(Err(SessionError::InvalidState {
                operation: "start recording",
                state,
            }))],
        }
    }

    pub fn stop_recording(&mut self) -> Result<Vec<Effect>, SessionError> {
        if self.state == SessionState::Recording {
            self.state = SessionState::Connected;
            self.audio_level = 0.0;
            return Ok(vec![
                Effect::ReleaseMicrophone { flush: true },
                Effect::Send(Outbound::EndOfUtterance),
            ]);
        }
        if self.microphone_pending {
            self.microphone_pending = false;
            return Ok(vec![
                Effect::ReleaseMicrophone { flush: false },
                Effect::RecordingSettled(Err(SessionError::Cancelled)),
            ]);
        }
        Err(SessionError::InvalidState {
            operation: "stop recording",
            state: self.state,
        })
    }

    /// Ends the session. A no-op once already `Disconnected`.
    pub fn disconnect(&mut self) -> Vec<Effect> {
        if self.state == SessionState::Disconnected {
            return vec![];
        }
        self.teardown(SessionState::Disconnected, SessionError::Cancelled)
    }

    // --- Events ---

    pub fn handle(&mut self, event: SessionEvent) -> Vec<Effect> {
        match event {
            SessionEvent::TransportOpened => {
                if self.state != SessionState::Connecting || self.transport_open {
                    return vec![];
                }
                self.transport_open = true;
                self.initialize_sent = 1;
                vec![Effect::Send(Outbound::Initialize)]
            }
            SessionEvent::TransportFailed(err) => {
                if self.state != SessionState::Connecting {
                    return vec![];
                }
                self.fail_connect(err)
            }
            SessionEvent::ConnectTimedOut => {
                if self.state != SessionState::Connecting {
                    return vec![];
                }
                self.fail_connect(SessionError::Timeout)
            }
            SessionEvent::TransportClosed { reason } => match self.state {
                SessionState::Connecting => self.fail_connect(SessionError::Connection(
                    reason.unwrap_or_else(|| GATEWAY_CONNECTION_LOST.to_string()),
                )),
                state if state.is_live() => {
                    let effects = self.teardown(SessionState::Error, SessionError::Cancelled);
                    self.connection_error = Some(GATEWAY_CONNECTION_LOST.to_string());
                    effects
                }
                _ => vec![],
            },
            SessionEvent::SendFailed(err) => match self.state {
                SessionState::Connecting => self.fail_connect(err),
                state if state.is_live() => {
                    self.connection_error = Some(err.to_string());
                    vec![]
                }
                _ => vec![],
            },
            SessionEvent::Inbound(event) => self.handle_inbound(event),
            SessionEvent::MicrophoneReady => {
                if !self.microphone_pending {
                    return vec![Effect::ReleaseMicrophone { flush: false }];
                }
                self.microphone_pending = false;
                if self.state == SessionState::Connected && self.upstream_ready {
                    self.state = SessionState::Recording;
                    vec![Effect::RecordingSettled(Ok(()))]
                } else {
                    let err = if self.state == SessionState::Connected {
                        SessionError::UpstreamUnavailable
                    } else {
                        SessionError::InvalidState {
                            operation: "start recording",
                            state: self.state,
                        }
                    };
                    vec![
                        Effect::ReleaseMicrophone { flush: false },
                        Effect::RecordingSettled(Err(err)),
                    ]
                }
            }
            SessionEvent::MicrophoneFailed(reason) => {
                if !self.microphone_pending {
                    return vec![];
                }
                self.microphone_pending = false;
                let err = SessionError::RecordingDevice(reason);
                self.connection_error = Some(err.to_string());
                vec![Effect::RecordingSettled(Err(err))]
            }
            SessionEvent::Captured(samples) => {
                if self.state != SessionState::Recording {
                    return vec![];
                }
                self.audio_level = pcm::rms_level(&samples);
                vec![Effect::Send(Outbound::Audio(samples))]
            }
            SessionEvent::CaptureEnded => {
                if self.state != SessionState::Recording {
                    return vec![Effect::ReleaseMicrophone { flush: false }];
                }
                self.state = SessionState::Connected;
                self.audio_level = 0.0;
                self.connection_error = Some(
                    SessionError::RecordingDevice("capture stopped unexpectedly".to_string())
                        .to_string(),
                );
                vec![
                    Effect::ReleaseMicrophone { flush: true },
                    Effect::Send(Outbound::EndOfUtterance),
                ]
            }
            SessionEvent::PlaybackIdle => {
                if self.state == SessionState::Speaking {
                    self.state = SessionState::Connected;
                }
                vec![]
            }
            SessionEvent::PlaybackFailed(reason) => {
                self.connection_error = Some(format!("playback failed: {reason}"));
                if self.state == SessionState::Speaking {
                    self.state = SessionState::Connected;
                }
                vec![Effect::StopPlayback]
            }
        }
    }

    fn handle_inbound(&mut self, event: InboundEvent) -> Vec<Effect> {
        match event {
            InboundEvent::SessionConnected => {
                if self.state == SessionState::Connecting && self.transport_open {
                    self.state = SessionState::Connected;
                    self.upstream_ready = true;
                    self.connection_error = None;
                    return vec![Effect::DisarmConnectTimer, Effect::ConnectSettled(Ok(()))];
                }
                if self.state.is_live() {
                    self.upstream_ready = true;
                }
                vec![]
            }
            InboundEvent::SessionDisconnected => {
                if self.state == SessionState::Connecting && self.transport_open {
                    return self.retry_initialize(PROVIDER_DISCONNECTED.to_string());
                }
                if !self.state.is_live() {
                    return vec![];
                }
                let mut effects = Vec::new();
                if self.state == SessionState::Recording || self.microphone_pending {
                    effects.push(Effect::ReleaseMicrophone { flush: false });
                }
                if self.microphone_pending {
                    self.microphone_pending = false;
                    effects.push(Effect::RecordingSettled(Err(SessionError::UpstreamUnavailable)));
                }
                if self.state == SessionState::Speaking {
                    effects.push(Effect::StopPlayback);
                }
                self.state = SessionState::Connected;
                self.upstream_ready = false;
                self.audio_level = 0.0;
                self.transcript.clear();
                self.connection_error = Some(PROVIDER_DISCONNECTED.to_string());
                effects
            }
            InboundEvent::TranscriptDelta { role, delta } => {
                if self.state.is_live() {
                    self.transcript.push(role, &delta);
                }
                vec![]
            }
            InboundEvent::TranscriptDone { role, transcript } => {
                if !self.state.is_live() {
                    return vec![];
                }
                let mut content = self.transcript.take(role);
                if content.is_empty() {
                    content = transcript.unwrap_or_default();
                }
                if !content.is_empty() {
                    self.messages.push(Message::new(role, content));
                }
                vec![]
            }
            InboundEvent::AudioDelta(samples) => {
                if samples.is_empty() || !self.state.is_live() {
                    return vec![];
                }
                if self.state == SessionState::Connected {
                    self.state = SessionState::Speaking;
                }
                vec![Effect::Play(samples)]
            }
            InboundEvent::ResponseDone => {
                if self.state == SessionState::Speaking {
                    self.state = SessionState::Connected;
                }
                vec![]
            }
            InboundEvent::Error(frame) => self.handle_error(frame),
            InboundEvent::Other(_) => vec![],
        }
    }

    fn handle_error(&mut self, frame: ErrorFrame) -> Vec<Effect> {
        if self.state == SessionState::Connecting
            && self.transport_open
            && frame.origin == ErrorOrigin::Gateway
        {
            return self.retry_initialize(frame.message);
        }
        if is_fatal(&frame) {
            let err = SessionError::Upstream(frame.message);
            let effects = self.teardown(SessionState::Disconnected, err.clone());
            self.connection_error = Some(err.to_string());
            return effects;
        }
        self.connection_error = Some(frame.message);
        vec![]
    }

    /// Re-sends `session.initialize` while the handshake budget lasts.
    fn retry_initialize(&mut self, reason: String) -> Vec<Effect> {
        if self.initialize_sent < self.initialize_attempts {
            self.initialize_sent += 1;
            self.connection_error = Some(reason);
            return vec![Effect::Send(Outbound::Initialize)];
        }
        self.fail_connect(SessionError::Upstream(reason))
    }

    fn fail_connect(&mut self, err: SessionError) -> Vec<Effect> {
        self.state = SessionState::Error;
        self.transport_open = false;
        self.upstream_ready = false;
        self.connection_error = Some(err.to_string());
        vec![
            Effect::DisarmConnectTimer,
            Effect::CloseTransport,
            Effect::ConnectSettled(Err(err)),
        ]
    }

    /// Releases every resource and enters `target`. Pending callers are
    /// resolved with `pending_err`.
    fn teardown(&mut self, target: SessionState, pending_err: SessionError) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.state == SessionState::Recording || self.microphone_pending {
            effects.push(Effect::ReleaseMicrophone { flush: false });
        }
        if self.microphone_pending {
            effects.push(Effect::RecordingSettled(Err(pending_err.clone())));
        }
        effects.push(Effect::StopPlayback);
        if self.state == SessionState::Connecting {
            effects.push(Effect::DisarmConnectTimer);
            effects.push(Effect::ConnectSettled(Err(pending_err)));
        }
        effects.push(Effect::CloseTransport);

        self.state = target;
        self.transport_open = false;
        self.upstream_ready = false;
        self.microphone_pending = false;
        self.audio_level = 0.0;
        effects
    }
}

/// Whether a provider error invalidates the upstream leg for good.
pub fn is_fatal(frame: &ErrorFrame) -> bool {
    frame.origin == ErrorOrigin::Provider
        && frame
            .code
            .as_deref()
            .is_some_and(|code| FATAL_PROVIDER_CODES.contains(&code))
}

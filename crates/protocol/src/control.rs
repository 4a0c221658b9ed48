//! Gateway control frames.
//!
//! These four frame types are the only ones the relay ever interprets. Any
//! other frame, in either direction, is forwarded without being touched.

use crate::frame::Frame;
use serde::{Deserialize, Serialize};

pub const SESSION_INITIALIZE: &str = "session.initialize";
pub const SESSION_CONNECTED: &str = "session.connected";
pub const SESSION_DISCONNECTED: &str = "session.disconnected";
pub const ERROR: &str = "error";

/// Control frames exchanged between the browser client and the gateway.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum ControlFrame {
    /// Client asks the gateway to (re)open the provider connection.
    #[serde(rename = "session.initialize")]
    Initialize,
    /// The provider connection is open and authenticated.
    #[serde(rename = "session.connected")]
    Connected,
    /// The provider connection closed; the client socket stays open.
    #[serde(rename = "session.disconnected")]
    Disconnected,
    /// The provider leg failed.
    #[serde(rename = "error")]
    Error { message: String },
}

impl ControlFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ControlFrame::Error {
            message: message.into(),
        }
    }

    /// Serializes the control frame into a text frame.
    pub fn to_frame(&self) -> serde_json::Result<Frame> {
        Ok(Frame::Text(serde_json::to_string(self)?))
    }
}

/// How the gateway should treat a frame received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Downstream {
    /// `session.initialize`: open (or reopen) the provider connection.
    Initialize,
    /// A frame carrying a gateway-owned type that clients must not send.
    /// It is dropped.
    Reserved(String),
    /// Anything else, forwarded byte-for-byte.
    Opaque,
}

#[derive(Deserialize)]
struct Tagged {
    #[serde(rename = "type")]
    kind: String,
}

/// Extracts the `type` discriminator of a JSON text frame, if there is one.
pub fn frame_type(text: &str) -> Option<String> {
    serde_json::from_str::<Tagged>(text).ok().map(|t| t.kind)
}

/// Decides how a client-to-gateway frame is handled.
pub fn classify_downstream(frame: &Frame) -> Downstream {
    let Some(text) = frame.as_text() else {
        return Downstream::Opaque;
    };
    let Some(kind) = frame_type(text) else {
        return Downstream::Opaque;
    };
    match kind.as_str() {
        SESSION_INITIALIZE => Downstream::Initialize,
        SESSION_CONNECTED | SESSION_DISCONNECTED | ERROR => Downstream::Reserved(kind),
        _ => Downstream::Opaque,
    }
}

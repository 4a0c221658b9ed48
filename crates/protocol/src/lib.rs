//! Voice Practice Wire Protocol
//!
//! Types shared by the relay gateway, the transport client and the session
//! state machine. The gateway only ever looks at [`control`]; the provider
//! dialect in [`provider`] is interpreted by the client alone.

pub mod control;
pub mod frame;
pub mod message;
pub mod pcm;
pub mod provider;

pub use control::{ControlFrame, Downstream, classify_downstream, frame_type};
pub use frame::Frame;
pub use message::{Message, Role};
pub use provider::{ClientEvent, ErrorFrame, ErrorOrigin, InboundEvent, ProtocolError, parse_inbound};

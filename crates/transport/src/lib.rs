//! Transport Client
//!
//! A protocol-agnostic wrapper around one outbound WebSocket to the relay
//! gateway. It knows how to open, write to and close the socket, and hands
//! every inbound frame to the single event channel registered at
//! construction. It holds no reference to whatever consumes those events.

mod client;
mod error;

pub use client::{DEFAULT_CONNECT_TIMEOUT, TransportClient, TransportConfig, TransportEvent};
pub use error::TransportError;

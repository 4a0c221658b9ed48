//! Realtime Voice Gateway
//!
//! A WebSocket relay that pairs each client session with one connection to
//! the realtime voice provider. The provider credential stays on the server;
//! the client only ever sees the gateway's control frames and whatever the
//! provider sends back. The `gateway` binary is a thin wrapper around this
//! library.

pub mod config;
pub mod provider;
pub mod relay;
pub mod router;
pub mod state;

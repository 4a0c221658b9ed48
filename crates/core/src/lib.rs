//! Voice Practice Session Core
//!
//! The client-side half of a voice practice conversation. [`machine`] holds
//! the session's state and transition rules as plain synchronous code: it
//! consumes [`machine::SessionEvent`]s and answers with [`machine::Effect`]s.
//! [`session`] is the runtime that owns the sockets and audio devices,
//! executes those effects, and feeds every outcome back through one
//! sequential event loop.

pub mod audio;
pub mod config;
pub mod error;
pub mod machine;
pub mod session;

pub use audio::{Capture, CaptureControl, DeviceError, Microphone, Playback, PlaybackSignal, Speaker};
pub use config::SessionConfig;
pub use error::SessionError;
pub use machine::{SessionSnapshot, SessionState};
pub use session::VoiceSession;

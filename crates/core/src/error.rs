use crate::machine::SessionState;
use practice_transport::TransportError;

/// Errors reported by [`crate::VoiceSession`] operations and recorded as the
/// session's `connection_error`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("gateway is misconfigured: {0}")]
    Configuration(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("timed out waiting for the session to connect")]
    Timeout,
    #[error("voice provider error: {0}")]
    Upstream(String),
    #[error("voice provider is not connected")]
    UpstreamUnavailable,
    #[error("recording device error: {0}")]
    RecordingDevice(String),
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("operation cancelled by disconnect")]
    Cancelled,
    #[error("session runtime has shut down")]
    Closed,
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            // The gateway answers 500 only when it holds no provider credential.
            TransportError::Rejected { status: 500 } => SessionError::Configuration(
                "gateway refused the upgrade with HTTP 500".to_string(),
            ),
            TransportError::Timeout => SessionError::Timeout,
            TransportError::Cancelled => SessionError::Cancelled,
            other => SessionError::Connection(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_mapping() {
        assert!(matches!(
            SessionError::from(TransportError::Rejected { status: 500 }),
            SessionError::Configuration(_)
        ));
        assert!(matches!(
            SessionError::from(TransportError::Rejected { status: 404 }),
            SessionError::Connection(_)
        ));
        assert_eq!(SessionError::from(TransportError::Timeout), SessionError::Timeout);
        assert_eq!(SessionError::from(TransportError::Cancelled), SessionError::Cancelled);
    }

    #[test]
    fn test_invalid_state_display() {
        let err = SessionError::InvalidState {
            operation: "stop recording",
            state: SessionState::Connected,
        };
        assert_eq!(err.to_string(), "cannot stop recording while connected");
    }
}

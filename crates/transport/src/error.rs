use tokio_tungstenite::tungstenite;

/// Failures surfaced by the transport client.
///
/// `Clone` so one failed connection attempt can be reported to every caller
/// that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("socket is not open")]
    NotOpen,
    #[error("timed out opening the socket")]
    Timeout,
    #[error("server refused the upgrade with HTTP {status}")]
    Rejected { status: u16 },
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("failed to send frame: {0}")]
    Send(String),
    #[error("connection attempt was cancelled")]
    Cancelled,
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => TransportError::Rejected {
                status: response.status().as_u16(),
            },
            other => TransportError::Connect(other.to_string()),
        }
    }
}

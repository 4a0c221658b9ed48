//! Upstream connection to the realtime voice provider.

use crate::config::Config;
use futures_util::SinkExt;
use practice_protocol::provider::{ClientEvent, SessionSettings, TranscriptionSettings};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, client::IntoClientRequest, http::HeaderValue, protocol::Message as WsMessage},
};
use tracing::{debug, info};

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TRANSCRIPTION_MODEL: &str = "whisper-1";

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("no provider credential is configured")]
    MissingCredential,
    #[error("invalid provider request: {0}")]
    Request(String),
    #[error("provider rejected the connection with HTTP {0}")]
    Rejected(u16),
    #[error("failed to reach the provider: {0}")]
    Connect(String),
    #[error("timed out connecting to the provider")]
    Timeout,
    #[error("failed to configure the provider session: {0}")]
    Bootstrap(String),
}

impl From<tungstenite::Error> for UpstreamError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => UpstreamError::Rejected(response.status().as_u16()),
            other => UpstreamError::Connect(other.to_string()),
        }
    }
}

/// The frame that configures a fresh provider session.
pub fn session_update(config: &Config) -> ClientEvent {
    ClientEvent::SessionUpdate {
        session: SessionSettings {
            modalities: vec!["text".to_string(), "audio".to_string()],
            voice: config.voice.clone(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: Some(TranscriptionSettings {
                model: TRANSCRIPTION_MODEL.to_string(),
            }),
            turn_detection: None,
            instructions: config.instructions.clone(),
        },
    }
}

/// Opens an authenticated provider socket and sends the session bootstrap.
///
/// The returned socket is ready to relay: nothing has been read from it.
pub async fn connect(config: &Config) -> Result<UpstreamSocket, UpstreamError> {
    let api_key = config
        .openai_api_key
        .as_ref()
        .ok_or(UpstreamError::MissingCredential)?;

    let mut request = config
        .provider_url()
        .into_client_request()
        .map_err(|e| UpstreamError::Request(e.to_string()))?;
    let authorization = HeaderValue::from_str(&format!("Bearer {}", api_key.expose_secret()))
        .map_err(|e| UpstreamError::Request(e.to_string()))?;
    request.headers_mut().insert("Authorization", authorization);
    request
        .headers_mut()
        .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

    debug!(url = %config.provider_url(), "Connecting to provider");
    let (mut socket, response) = tokio::time::timeout(config.upstream_connect_timeout, connect_async(request))
        .await
        .map_err(|_| UpstreamError::Timeout)??;
    info!(status = %response.status(), "Connected to provider");

    let bootstrap = serde_json::to_string(&session_update(config))
        .map_err(|e| UpstreamError::Bootstrap(e.to_string()))?;
    socket
        .send(WsMessage::text(bootstrap))
        .await
        .map_err(|e| UpstreamError::Bootstrap(e.to_string()))?;

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tracing::Level;

    fn config() -> Config {
        Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            openai_api_key: None,
            realtime_url: "ws://127.0.0.1:1/v1/realtime".to_string(),
            realtime_model: "gpt-4o-realtime-preview".to_string(),
            voice: "alloy".to_string(),
            instructions: None,
            upstream_connect_timeout: Duration::from_secs(1),
            log_level: Level::INFO,
        }
    }

    #[test]
    fn test_session_update_wire_format() {
        let mut config = config();
        let value = serde_json::to_value(session_update(&config)).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "session.update",
                "session": {
                    "modalities": ["text", "audio"],
                    "voice": "alloy",
                    "input_audio_format": "pcm16",
                    "output_audio_format": "pcm16",
                    "input_audio_transcription": {"model": "whisper-1"},
                    "turn_detection": null
                }
            })
        );

        config.instructions = Some("Speak slowly.".to_string());
        let value = serde_json::to_value(session_update(&config)).unwrap();
        assert_eq!(value["session"]["instructions"], "Speak slowly.");
    }

    #[tokio::test]
    async fn test_connect_without_credential() {
        let err = connect(&config()).await.unwrap_err();
        assert!(matches!(err, UpstreamError::MissingCredential));
    }
}

//! Per-session relay between one client socket and one provider socket.

use crate::{
    provider::{self, UpstreamError, UpstreamSocket},
    state::AppState,
};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{
    FutureExt, Sink, SinkExt, StreamExt,
    future::BoxFuture,
    stream::{SplitSink, SplitStream},
};
use practice_protocol::{ControlFrame, Downstream, Frame, classify_downstream};
use std::{fmt::Display, sync::Arc, time::Duration};
use tokio_tungstenite::tungstenite::{self, protocol::Message as WsMessage};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

type ClientSink = SplitSink<WebSocket, Message>;

/// How long a provider gets to take our close frame.
const UPSTREAM_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// The open provider leg of a session.
struct Upstream {
    sink: SplitSink<UpstreamSocket, WsMessage>,
    stream: SplitStream<UpstreamSocket>,
}

impl Upstream {
    async fn close(mut self) {
        close_within(&mut self.sink, UPSTREAM_CLOSE_GRACE).await;
    }
}

/// Axum handler to upgrade an HTTP connection to a relay session.
///
/// Plain HTTP requests get a 400. Without a provider credential every upgrade
/// is refused with a 500 before any socket exists.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => {
            debug!(reason = %rejection, "Rejected non-WebSocket request");
            return (StatusCode::BAD_REQUEST, "expected a WebSocket upgrade").into_response();
        }
    };
    if !state.has_credential() {
        error!("Refusing upgrade: no provider credential is configured");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "voice provider is not configured",
        )
            .into_response();
    }
    ws.on_upgrade(|socket| relay_session(socket, state))
}

/// Drives one session until the client goes away.
///
/// Client frames, upstream frames and the pending provider connect are all
/// handled in one loop, so each direction keeps its arrival order.
#[instrument(name = "relay_session", skip_all, fields(session_id = %Uuid::new_v4()))]
async fn relay_session(socket: WebSocket, state: Arc<AppState>) {
    info!("Client connected. Awaiting session.initialize...");
    let (mut client_tx, mut client_rx) = socket.split();
    let mut upstream: Option<Upstream> = None;
    let mut connecting: Option<BoxFuture<'static, Result<UpstreamSocket, UpstreamError>>> = None;

    loop {
        tokio::select! {
            msg = client_rx.next() => {
                let frame = match msg {
                    Some(Ok(msg)) => match client_frame(msg) {
                        Some(frame) => frame,
                        None => continue,
                    },
                    Some(Err(e)) => {
                        warn!(error = %e, "Client socket failed");
                        break;
                    }
                    None => {
                        info!("Client disconnected");
                        break;
                    }
                };
                match classify_downstream(&frame) {
                    Downstream::Initialize => {
                        if let Some(previous) = upstream.take() {
                            info!("Re-initializing: closing the current provider connection");
                            previous.close().await;
                        }
                        let config = state.config.clone();
                        connecting = Some(async move { provider::connect(&config).await }.boxed());
                    }
                    Downstream::Reserved(kind) => {
                        warn!(frame_type = %kind, "Dropping gateway-owned frame sent by client");
                    }
                    Downstream::Opaque => match upstream.as_mut() {
                        Some(leg) => {
                            if let Err(e) = leg.sink.send(provider_message(frame)).await {
                                warn!(error = %e, "Failed to forward frame to provider");
                                if let Some(leg) = upstream.take() {
                                    leg.close().await;
                                }
                                let message = format!("voice provider connection failed: {e}");
                                if notify(&mut client_tx, ControlFrame::error(message)).await.is_err()
                                    || notify(&mut client_tx, ControlFrame::Disconnected).await.is_err()
                                {
                                    break;
                                }
                            }
                        }
                        None => debug!(bytes = frame.len(), "Dropping frame received before the provider is connected"),
                    },
                }
            }
            result = settle(&mut connecting) => match result {
                Ok(socket) => {
                    let (sink, stream) = socket.split();
                    upstream = Some(Upstream { sink, stream });
                    info!("Provider connected");
                    if notify(&mut client_tx, ControlFrame::Connected).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Provider connection failed");
                    let message = format!("voice provider connection failed: {e}");
                    if notify(&mut client_tx, ControlFrame::error(message)).await.is_err() {
                        break;
                    }
                }
            },
            msg = next_upstream(&mut upstream) => {
                let retired = match msg {
                    Some(Ok(WsMessage::Close(reason))) => {
                        info!(reason = ?reason, "Provider closed the connection");
                        None
                    }
                    Some(Ok(msg)) => {
                        if let Some(message) = client_message(msg) {
                            if let Err(e) = client_tx.send(message).await {
                                warn!(error = %e, "Failed to forward frame to client");
                                break;
                            }
                        }
                        continue;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Provider connection failed");
                        Some(format!("voice provider connection failed: {e}"))
                    }
                    None => {
                        info!("Provider connection ended");
                        None
                    }
                };
                if let Some(leg) = upstream.take() {
                    leg.close().await;
                }
                if let Some(message) = retired {
                    if notify(&mut client_tx, ControlFrame::error(message)).await.is_err() {
                        break;
                    }
                }
                if notify(&mut client_tx, ControlFrame::Disconnected).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(connecting);
    if let Some(leg) = upstream.take() {
        leg.close().await;
        debug!("Closed provider connection");
    }
    info!("Relay session finished");
}

/// Sends a control frame to the client.
async fn notify(client_tx: &mut ClientSink, frame: ControlFrame) -> Result<(), axum::Error> {
    let text = match frame.to_frame() {
        Ok(Frame::Text(text)) => text,
        Ok(Frame::Binary(_)) => return Ok(()),
        Err(e) => {
            error!(error = %e, "Failed to encode control frame");
            return Ok(());
        }
    };
    client_tx.send(Message::Text(text.into())).await
}

/// Unwraps a client message into a relayable frame. Pings, pongs and close
/// frames are handled by the socket itself.
fn client_frame(msg: Message) -> Option<Frame> {
    match msg {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(Frame::Binary(data)),
        _ => None,
    }
}

fn provider_message(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::text(text),
        Frame::Binary(data) => WsMessage::binary(data),
    }
}

fn client_message(msg: WsMessage) -> Option<Message> {
    match msg {
        WsMessage::Text(text) => Some(Message::Text(text.as_str().to_owned().into())),
        WsMessage::Binary(data) => Some(Message::Binary(data)),
        _ => None,
    }
}

async fn close_within<S>(sink: &mut S, grace: Duration)
where
    S: Sink<WsMessage> + Unpin,
    S::Error: Display,
{
    match tokio::time::timeout(grace, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(error = %e, "Provider close failed"),
        Err(_) => warn!("Timed out closing provider connection"),
    }
}

async fn settle<T>(pending: &mut Option<BoxFuture<'static, T>>) -> T {
    match pending {
        Some(future) => {
            let output = future.await;
            *pending = None;
            output
        }
        None => std::future::pending().await,
    }
}

async fn next_upstream(
    upstream: &mut Option<Upstream>,
) -> Option<Result<WsMessage, tungstenite::Error>> {
    match upstream {
        Some(leg) => leg.stream.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        pin::Pin,
        task::{Context, Poll},
        time::Instant,
    };

    /// A provider socket whose writes never complete.
    struct StalledSink;

    impl Sink<WsMessage> for StalledSink {
        type Error = tungstenite::Error;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: WsMessage) -> Result<(), Self::Error> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_close_gives_up_on_stalled_provider() {
        let started = Instant::now();
        close_within(&mut StalledSink, Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}

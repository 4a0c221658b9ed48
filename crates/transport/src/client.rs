use crate::error::TransportError;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use practice_protocol::Frame;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    net::TcpStream,
    sync::{Mutex, mpsc},
    task::{AbortHandle, JoinHandle},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage,
};
use tracing::{debug, info, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_GRACE: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type Attempt = Shared<BoxFuture<'static, Result<(), TransportError>>>;

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub url: String,
    pub connect_timeout: Duration,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// What the transport reports to its registered handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(Frame),
    /// The peer closed the socket or reading from it failed. Not emitted
    /// for closes requested through [`TransportClient::close`].
    Closed { reason: Option<String> },
}

enum Link {
    Idle,
    Connecting {
        epoch: u64,
        attempt: Attempt,
        abort: AbortHandle,
    },
    Open {
        epoch: u64,
        sink: Arc<Mutex<WsSink>>,
        reader: JoinHandle<()>,
    },
}

impl Link {
    fn is_current(&self, expected: u64) -> bool {
        match self {
            Link::Connecting { epoch, .. } | Link::Open { epoch, .. } => *epoch == expected,
            Link::Idle => false,
        }
    }
}

struct Inner {
    config: TransportConfig,
    events: mpsc::UnboundedSender<TransportEvent>,
    link: Mutex<Link>,
    epoch: AtomicU64,
}

/// Handle to a single outbound socket. Clones share the same socket.
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<Inner>,
}

impl TransportClient {
    pub fn new(config: TransportConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                events,
                link: Mutex::new(Link::Idle),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    /// Opens the socket, or joins the attempt already in flight.
    ///
    /// Every concurrent caller observes the outcome of the same attempt, so
    /// at most one socket is ever opened. Resolves immediately when the
    /// socket is already open.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let attempt = {
            let mut link = self.inner.link.lock().await;
            match &*link {
                Link::Open { .. } => return Ok(()),
                Link::Connecting { attempt, .. } => attempt.clone(),
                Link::Idle => {
                    let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                    let task = tokio::spawn(open(self.inner.clone(), epoch));
                    let abort = task.abort_handle();
                    let attempt = task
                        .map(|joined| joined.unwrap_or(Err(TransportError::Cancelled)))
                        .boxed()
                        .shared();
                    *link = Link::Connecting {
                        epoch,
                        attempt: attempt.clone(),
                        abort,
                    };
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Writes one frame. Fails with [`TransportError::NotOpen`] instead of
    /// buffering when the socket is not open.
    pub async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let sink = {
            let link = self.inner.link.lock().await;
            match &*link {
                Link::Open { sink, .. } => sink.clone(),
                _ => return Err(TransportError::NotOpen),
            }
        };
        let message = match frame {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Binary(data) => WsMessage::Binary(data),
        };
        sink.lock()
            .await
            .send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    pub async fn is_open(&self) -> bool {
        matches!(&*self.inner.link.lock().await, Link::Open { .. })
    }

    /// Closes the socket or cancels the attempt in flight. Safe to call in
    /// any state, any number of times.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.inner.link.lock().await, Link::Idle);
        match previous {
            Link::Idle => {}
            Link::Connecting { abort, .. } => {
                abort.abort();
                debug!(url = %self.inner.config.url, "Cancelled in-flight connect.");
            }
            Link::Open { sink, reader, .. } => {
                reader.abort();
                let mut sink = sink.lock().await;
                if tokio::time::timeout(CLOSE_GRACE, sink.close()).await.is_err() {
                    warn!("Timed out sending close frame.");
                }
                info!(url = %self.inner.config.url, "Socket closed.");
            }
        }
    }
}

/// Runs one connection attempt and installs the socket if the attempt is
/// still the current one when it completes.
async fn open(inner: Arc<Inner>, epoch: u64) -> Result<(), TransportError> {
    let result = tokio::time::timeout(
        inner.config.connect_timeout,
        connect_async(inner.config.url.as_str()),
    )
    .await;

    let mut link = inner.link.lock().await;
    let current = link.is_current(epoch);
    let ws = match result {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => {
            if current {
                *link = Link::Idle;
            }
            let err = TransportError::from(e);
            warn!(url = %inner.config.url, error = %err, "Connect failed.");
            return Err(err);
        }
        Err(_) => {
            if current {
                *link = Link::Idle;
            }
            warn!(url = %inner.config.url, "Connect timed out.");
            return Err(TransportError::Timeout);
        }
    };
    if !current {
        return Err(TransportError::Cancelled);
    }

    let (sink, stream) = ws.split();
    let reader = tokio::spawn(read_loop(inner.clone(), epoch, stream));
    *link = Link::Open {
        epoch,
        sink: Arc::new(Mutex::new(sink)),
        reader,
    };
    info!(url = %inner.config.url, "Socket open.");
    Ok(())
}

/// Hands inbound frames to the event channel in arrival order.
async fn read_loop(inner: Arc<Inner>, epoch: u64, mut stream: SplitStream<WsStream>) {
    let reason = loop {
        let frame = match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => Frame::Text(text.as_str().to_owned()),
            Some(Ok(WsMessage::Binary(data))) => Frame::Binary(data),
            Some(Ok(WsMessage::Close(close))) => {
                break close.map(|c| c.reason.as_str().to_owned());
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Some(e.to_string()),
            None => break None,
        };
        if inner.events.send(TransportEvent::Frame(frame)).is_err() {
            debug!("Event handler dropped; stopping reader.");
            return;
        }
    };

    {
        let mut link = inner.link.lock().await;
        if !link.is_current(epoch) {
            // Already replaced or closed locally; the owner knows.
            debug!(?reason, "Stale reader finished.");
            return;
        }
        *link = Link::Idle;
    }
    info!(?reason, "Socket closed by peer.");
    let _ = inner.events.send(TransportEvent::Closed { reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn closing_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(mut ws) = accept_async(stream).await {
                    let _ = ws.close(None).await;
                }
            }
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_stale_reader_does_not_report_close() {
        let url = closing_server().await;
        let (events, mut rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config: TransportConfig::new(url.clone()),
            events,
            link: Mutex::new(Link::Idle),
            epoch: AtomicU64::new(1),
        });

        let (ws, _) = connect_async(url.as_str()).await.unwrap();
        let (_sink, stream) = ws.split();
        read_loop(inner.clone(), 1, stream).await;

        assert!(rx.try_recv().is_err());
        assert!(matches!(*inner.link.lock().await, Link::Idle));
    }
}

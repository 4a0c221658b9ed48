//! End-to-end session tests against an in-process fake gateway.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use practice_core::{
    Capture, CaptureControl, DeviceError, Microphone, Playback, PlaybackSignal, SessionConfig,
    SessionError, SessionSnapshot, SessionState, Speaker, VoiceSession,
};
use practice_protocol::{Role, pcm};
use serde_json::{Value, json};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::AsyncWriteExt,
    net::TcpListener,
    sync::{Mutex as AsyncMutex, mpsc},
    time::{sleep, timeout},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

const CLOSED: &str = "<closed>";

/// A gateway double. Text frames from the client land on `received`;
/// `push` and `hang_up` act on the most recent connection.
struct FakeGateway {
    url: String,
    accepted: Arc<AtomicUsize>,
    received: mpsc::UnboundedReceiver<String>,
    commands: mpsc::UnboundedSender<Option<String>>,
}

impl FakeGateway {
    /// `ack` answers every `session.initialize` with `session.connected`.
    async fn start(ack: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (received_tx, received) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel::<Option<String>>();
        let commands_rx = Arc::new(AsyncMutex::new(commands_rx));

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let received_tx = received_tx.clone();
                let commands_rx = commands_rx.clone();
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(stream).await else { return };
                    loop {
                        tokio::select! {
                            msg = ws.next() => match msg {
                                Some(Ok(Message::Text(text))) => {
                                    let text = text.to_string();
                                    let initialize = text.contains("session.initialize");
                                    let _ = received_tx.send(text);
                                    if ack && initialize {
                                        let ack = json!({"type": "session.connected"}).to_string();
                                        if ws.send(Message::text(ack)).await.is_err() {
                                            break;
                                        }
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {
                                    let _ = received_tx.send(CLOSED.to_string());
                                    break;
                                }
                                _ => {}
                            },
                            command = async { commands_rx.lock().await.recv().await } => match command {
                                Some(Some(text)) => {
                                    if ws.send(Message::text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                _ => {
                                    let _ = ws.close(None).await;
                                    break;
                                }
                            },
                        }
                    }
                });
            }
        });

        Self {
            url: format!("ws://{}", addr),
            accepted,
            received,
            commands,
        }
    }

    fn push(&self, frame: Value) {
        self.commands.send(Some(frame.to_string())).unwrap();
    }

    fn push_raw(&self, text: &str) {
        self.commands.send(Some(text.to_string())).unwrap();
    }

    fn hang_up(&self) {
        self.commands.send(None).unwrap();
    }

    async fn next_text(&mut self) -> String {
        timeout(Duration::from_secs(2), self.received.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("gateway stopped")
    }

    async fn next_type(&mut self) -> String {
        let text = self.next_text().await;
        if text == CLOSED {
            return text;
        }
        let value: Value = serde_json::from_str(&text).unwrap();
        value["type"].as_str().unwrap().to_string()
    }

    /// Collects frames up to and including the next `response.create`.
    async fn utterance(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        loop {
            let value: Value = serde_json::from_str(&self.next_text().await).unwrap();
            let done = value["type"] == "response.create";
            frames.push(value);
            if done {
                return frames;
            }
        }
    }
}

struct StopCounter {
    stops: Arc<AtomicUsize>,
    tail: Vec<i16>,
    // Keeps the chunk stream open until the device is stopped.
    _feed: mpsc::Sender<Vec<i16>>,
}

impl CaptureControl for StopCounter {
    fn stop(&mut self) -> Vec<i16> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        std::mem::take(&mut self.tail)
    }
}

#[derive(Default)]
struct FakeMicrophone {
    chunks: Vec<Vec<i16>>,
    tail: Vec<i16>,
    deny: bool,
    acquired: AtomicUsize,
    stops: Arc<AtomicUsize>,
}

#[async_trait]
impl Microphone for FakeMicrophone {
    async fn acquire(&self) -> Result<Capture, DeviceError> {
        if self.deny {
            return Err(DeviceError::PermissionDenied);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        for chunk in &self.chunks {
            tx.try_send(chunk.clone()).unwrap();
        }
        Ok(Capture::new(
            rx,
            StopCounter {
                stops: self.stops.clone(),
                tail: self.tail.clone(),
                _feed: tx,
            },
        ))
    }
}

#[derive(Default)]
struct FakeSpeaker {
    played: Arc<Mutex<Vec<i16>>>,
    stops: Arc<AtomicUsize>,
}

struct FakePlayback {
    played: Arc<Mutex<Vec<i16>>>,
    stops: Arc<AtomicUsize>,
}

impl Speaker for FakeSpeaker {
    fn open(
        &self,
        _signals: mpsc::UnboundedSender<PlaybackSignal>,
    ) -> Result<Box<dyn Playback>, DeviceError> {
        Ok(Box::new(FakePlayback {
            played: self.played.clone(),
            stops: self.stops.clone(),
        }))
    }
}

impl Playback for FakePlayback {
    fn enqueue(&mut self, samples: Vec<i16>) -> Result<(), DeviceError> {
        self.played.lock().unwrap().extend(samples);
        Ok(())
    }

    fn stop(self: Box<Self>) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

fn session(url: &str, microphone: Arc<FakeMicrophone>, speaker: Arc<FakeSpeaker>) -> VoiceSession {
    let config = SessionConfig::new(url)
        .with_connect_timeout(Duration::from_secs(2))
        .with_transport_timeout(Duration::from_secs(1));
    VoiceSession::spawn(config, microphone, speaker)
}

async fn wait_for(session: &VoiceSession, predicate: impl Fn(&SessionSnapshot) -> bool) -> SessionSnapshot {
    let mut snapshots = session.subscribe();
    let snapshot = timeout(Duration::from_secs(2), snapshots.wait_for(|s| predicate(s)))
        .await
        .expect("timed out waiting for session state")
        .expect("session runtime stopped");
    snapshot.clone()
}

fn decode_audio(frames: &[Value]) -> Vec<i16> {
    frames
        .iter()
        .filter(|f| f["type"] == "input_audio_buffer.append")
        .flat_map(|f| pcm::decode_base64(f["audio"].as_str().unwrap()).unwrap())
        .collect()
}

#[tokio::test]
async fn test_connect_waits_for_gateway_ack() {
    let mut gateway = FakeGateway::start(false).await;
    let session = Arc::new(session(&gateway.url, Default::default(), Default::default()));

    let connecting = tokio::spawn({
        let session = session.clone();
        async move { session.connect().await }
    });

    assert_eq!(gateway.next_type().await, "session.initialize");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(session.state(), SessionState::Connecting);
    assert!(session.snapshot().is_connecting);

    gateway.push(json!({"type": "session.connected"}));
    assert_eq!(connecting.await.unwrap(), Ok(()));
    assert_eq!(session.state(), SessionState::Connected);
    assert!(session.snapshot().is_connected);
}

#[tokio::test]
async fn test_concurrent_connects_share_one_socket() {
    let gateway = FakeGateway::start(true).await;
    let session = session(&gateway.url, Default::default(), Default::default());

    let (a, b, c) = tokio::join!(session.connect(), session.connect(), session.connect());
    assert_eq!(a, Ok(()));
    assert_eq!(b, Ok(()));
    assert_eq!(c, Ok(()));
    assert_eq!(session.connect().await, Ok(()));
    assert_eq!(gateway.accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_recording_streams_audio_in_order() {
    let mut gateway = FakeGateway::start(true).await;
    let microphone = Arc::new(FakeMicrophone {
        chunks: vec![vec![1, 2, 3], vec![4, 5], vec![6]],
        tail: vec![7, 8],
        ..Default::default()
    });
    let session = session(&gateway.url, microphone.clone(), Default::default());

    session.connect().await.unwrap();
    assert_eq!(gateway.next_type().await, "session.initialize");

    session.start_recording().await.unwrap();
    assert_eq!(session.state(), SessionState::Recording);
    // Already recording: resolves without touching the device again.
    session.start_recording().await.unwrap();
    assert_eq!(microphone.acquired.load(Ordering::SeqCst), 1);

    session.stop_recording().await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(microphone.stops.load(Ordering::SeqCst), 1);

    let frames = gateway.utterance().await;
    assert_eq!(decode_audio(&frames), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    let n = frames.len();
    assert_eq!(frames[n - 2]["type"], "input_audio_buffer.commit");
    assert_eq!(frames[n - 1]["type"], "response.create");

    assert!(matches!(
        session.stop_recording().await,
        Err(SessionError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_recording_before_connect_is_rejected() {
    let gateway = FakeGateway::start(true).await;
    let microphone = Arc::new(FakeMicrophone::default());
    let session = session(&gateway.url, microphone.clone(), Default::default());

    assert!(matches!(
        session.start_recording().await,
        Err(SessionError::InvalidState {
            state: SessionState::Idle,
            ..
        })
    ));
    assert_eq!(microphone.acquired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_denied_microphone_keeps_session_connected() {
    let gateway = FakeGateway::start(true).await;
    let microphone = Arc::new(FakeMicrophone {
        deny: true,
        ..Default::default()
    });
    let session = session(&gateway.url, microphone, Default::default());

    session.connect().await.unwrap();
    assert!(matches!(
        session.start_recording().await,
        Err(SessionError::RecordingDevice(_))
    ));
    let snapshot = session.snapshot();
    assert_eq!(snapshot.state, SessionState::Connected);
    assert!(snapshot.connection_error.is_some());
}

#[tokio::test]
async fn test_provider_disconnect_while_recording() {
    let mut gateway = FakeGateway::start(true).await;
    let microphone = Arc::new(FakeMicrophone {
        chunks: vec![vec![10; 240]],
        ..Default::default()
    });
    let session = session(&gateway.url, microphone.clone(), Default::default());

    session.connect().await.unwrap();
    assert_eq!(gateway.next_type().await, "session.initialize");
    session.start_recording().await.unwrap();

    gateway.push(json!({"type": "session.disconnected"}));
    let snapshot = wait_for(&session, |s| s.state == SessionState::Connected).await;
    assert!(snapshot.connection_error.is_some());
    assert_eq!(microphone.stops.load(Ordering::SeqCst), 1);

    assert_eq!(
        session.start_recording().await,
        Err(SessionError::UpstreamUnavailable)
    );

    // The socket survived, so the provider leg can be reopened over it.
    session.reinitialize().await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(gateway.accepted.load(Ordering::SeqCst), 1);
    session.start_recording().await.unwrap();
}

#[tokio::test]
async fn test_gateway_without_credential_is_a_configuration_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let _ = stream
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\n\r\n")
                .await;
        }
    });
    let session = session(&format!("ws://{}", addr), Default::default(), Default::default());

    assert!(matches!(
        session.connect().await,
        Err(SessionError::Configuration(_))
    ));
    let snapshot = session.snapshot();
    assert_eq!(snapshot.state, SessionState::Error);
    assert!(!snapshot.is_connecting);
    assert!(snapshot.connection_error.is_some());
}

#[tokio::test]
async fn test_connect_times_out_without_ack() {
    let gateway = FakeGateway::start(false).await;
    let config = SessionConfig::new(gateway.url.clone()).with_connect_timeout(Duration::from_millis(200));
    let session = VoiceSession::spawn(
        config,
        Arc::new(FakeMicrophone::default()),
        Arc::new(FakeSpeaker::default()),
    );

    assert_eq!(session.connect().await, Err(SessionError::Timeout));
    assert_eq!(session.state(), SessionState::Error);
}

#[tokio::test]
async fn test_socket_lost_during_handshake_fails_fast() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            // Completes the upgrade, then drops the socket without a close frame.
            let _ = accept_async(stream).await;
        }
    });
    let config = SessionConfig::new(format!("ws://{}", addr))
        .with_connect_timeout(Duration::from_secs(10))
        .with_transport_timeout(Duration::from_secs(1));
    let session = VoiceSession::spawn(
        config,
        Arc::new(FakeMicrophone::default()),
        Arc::new(FakeSpeaker::default()),
    );

    let result = timeout(Duration::from_secs(3), session.connect())
        .await
        .expect("connect waited for the full deadline");
    assert!(matches!(result, Err(SessionError::Connection(_))));
    let snapshot = session.snapshot();
    assert_eq!(snapshot.state, SessionState::Error);
    assert!(snapshot.connection_error.is_some());
}

#[tokio::test]
async fn test_assistant_reply_plays_and_is_transcribed() {
    let gateway = FakeGateway::start(true).await;
    let speaker = Arc::new(FakeSpeaker::default());
    let session = session(&gateway.url, Default::default(), speaker.clone());
    session.connect().await.unwrap();

    gateway.push(json!({"type": "conversation.item.input_audio_transcription.delta", "delta": "Hel"}));
    gateway.push(json!({"type": "conversation.item.input_audio_transcription.delta", "delta": "lo, "}));
    gateway.push(json!({"type": "conversation.item.input_audio_transcription.delta", "delta": "how are you?"}));
    gateway.push(json!({"type": "conversation.item.input_audio_transcription.completed", "transcript": "Hello, how are you?"}));
    gateway.push(json!({"type": "response.audio.delta", "delta": pcm::encode_base64(&[100, -100, 50])}));

    let snapshot = wait_for(&session, |s| s.state == SessionState::Speaking).await;
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].role, Role::User);
    assert_eq!(snapshot.messages[0].content, "Hello, how are you?");
    assert_eq!(snapshot.transcript, "");

    gateway.push(json!({"type": "response.audio_transcript.delta", "delta": "I'm well."}));
    gateway.push(json!({"type": "response.audio_transcript.done"}));
    gateway.push(json!({"type": "response.done"}));

    let snapshot = wait_for(&session, |s| s.state == SessionState::Connected).await;
    assert_eq!(snapshot.messages.len(), 2);
    assert_eq!(snapshot.messages[1].role, Role::Assistant);
    assert_eq!(snapshot.messages[1].content, "I'm well.");
    assert_eq!(*speaker.played.lock().unwrap(), vec![100, -100, 50]);
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let gateway = FakeGateway::start(true).await;
    let session = session(&gateway.url, Default::default(), Default::default());
    session.connect().await.unwrap();

    gateway.push_raw("definitely not json");
    gateway.push(json!({"type": "response.audio.delta", "delta": "%%%"}));
    gateway.push(json!({"type": "rate_limits.updated"}));
    gateway.push(json!({"type": "response.audio_transcript.delta", "delta": "still here"}));

    let snapshot = wait_for(&session, |s| s.transcript == "still here").await;
    assert_eq!(snapshot.state, SessionState::Connected);
}

#[tokio::test]
async fn test_fatal_provider_error_ends_session() {
    let mut gateway = FakeGateway::start(true).await;
    let session = session(&gateway.url, Default::default(), Default::default());
    session.connect().await.unwrap();
    assert_eq!(gateway.next_type().await, "session.initialize");

    gateway.push(json!({
        "type": "error",
        "error": {"type": "invalid_request_error", "code": "invalid_api_key", "message": "Incorrect API key"}
    }));
    let snapshot = wait_for(&session, |s| s.state == SessionState::Disconnected).await;
    assert!(snapshot.connection_error.unwrap().contains("Incorrect API key"));
    assert_eq!(gateway.next_type().await, CLOSED);
}

#[tokio::test]
async fn test_gateway_hang_up_is_fatal() {
    let gateway = FakeGateway::start(true).await;
    let microphone = Arc::new(FakeMicrophone::default());
    let session = session(&gateway.url, microphone.clone(), Default::default());
    session.connect().await.unwrap();
    session.start_recording().await.unwrap();

    gateway.hang_up();
    let snapshot = wait_for(&session, |s| s.state == SessionState::Error).await;
    assert!(snapshot.connection_error.is_some());
    assert_eq!(microphone.stops.load(Ordering::SeqCst), 1);

    // A fresh connect starts over on a new socket.
    session.connect().await.unwrap();
    assert_eq!(gateway.accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_disconnect_twice() {
    let mut gateway = FakeGateway::start(true).await;
    let speaker = Arc::new(FakeSpeaker::default());
    let session = session(&gateway.url, Default::default(), speaker.clone());
    session.connect().await.unwrap();
    assert_eq!(gateway.next_type().await, "session.initialize");

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);
    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Disconnected);

    assert_eq!(gateway.next_type().await, CLOSED);
    assert!(!session.snapshot().is_connected);
}

#[tokio::test]
async fn test_disconnect_cancels_pending_connect() {
    let gateway = FakeGateway::start(false).await;
    let session = Arc::new(session(&gateway.url, Default::default(), Default::default()));

    let connecting = tokio::spawn({
        let session = session.clone();
        async move { session.connect().await }
    });
    sleep(Duration::from_millis(100)).await;
    session.disconnect().await;

    assert_eq!(connecting.await.unwrap(), Err(SessionError::Cancelled));
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_dropping_session_releases_everything() {
    let mut gateway = FakeGateway::start(true).await;
    let microphone = Arc::new(FakeMicrophone::default());
    let session = session(&gateway.url, microphone.clone(), Default::default());
    session.connect().await.unwrap();
    assert_eq!(gateway.next_type().await, "session.initialize");
    session.start_recording().await.unwrap();

    drop(session);

    assert_eq!(gateway.next_type().await, CLOSED);
    assert_eq!(microphone.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shutdown_waits_for_runtime() {
    let gateway = FakeGateway::start(true).await;
    let session = session(&gateway.url, Default::default(), Default::default());
    session.connect().await.unwrap();
    let mut snapshots = session.subscribe();

    session.shutdown().await;
    assert_eq!(snapshots.borrow_and_update().state, SessionState::Disconnected);
}

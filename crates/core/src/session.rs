//! Session runtime.
//!
//! [`VoiceSession`] is a handle to one spawned task. The task owns the
//! [`SessionMachine`], the transport and the audio devices. Caller
//! operations, transport events, device callbacks and the connect timer all
//! arrive at a single `select!` loop, so state only ever changes from one
//! place, one event at a time.

use crate::audio::{Capture, DeviceError, Microphone, Playback, PlaybackSignal, Speaker};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::machine::{Effect, Outbound, SessionEvent, SessionMachine, SessionSnapshot, SessionState};
use futures::FutureExt;
use futures::future::BoxFuture;
use practice_protocol::{ClientEvent, ControlFrame, Frame, parse_inbound};
use practice_transport::{TransportClient, TransportConfig, TransportError, TransportEvent};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

type Reply = oneshot::Sender<Result<(), SessionError>>;

enum Operation {
    Connect(Reply),
    Reinitialize(Reply),
    StartRecording(Reply),
    StopRecording(Reply),
    Disconnect(oneshot::Sender<()>),
}

/// Handle to a running voice session.
///
/// Dropping the handle disconnects the session and releases its devices.
pub struct VoiceSession {
    operations: mpsc::Sender<Operation>,
    snapshots: watch::Receiver<SessionSnapshot>,
    runtime: JoinHandle<()>,
}

impl VoiceSession {
    /// Spawns the session task onto the current Tokio runtime.
    pub fn spawn(
        config: SessionConfig,
        microphone: Arc<dyn Microphone>,
        speaker: Arc<dyn Speaker>,
    ) -> Self {
        let (operations_tx, operations_rx) = mpsc::channel(32);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();

        let machine = SessionMachine::new(config.initialize_attempts);
        let (snapshots_tx, snapshots_rx) = watch::channel(machine.snapshot());
        let transport = TransportClient::new(
            TransportConfig::new(config.gateway_url.clone())
                .with_connect_timeout(config.transport_timeout),
            events_tx,
        );

        let span = info_span!("voice_session", gateway = %config.gateway_url);
        let runtime = Runtime {
            config,
            machine,
            transport,
            transport_events: events_rx,
            operations: operations_rx,
            snapshots: snapshots_tx,
            microphone,
            speaker,
            opening: None,
            acquiring: None,
            capture: None,
            playback: None,
            playback_tx,
            playback_rx,
            connect_deadline: None,
            connect_waiters: Vec::new(),
            recording_waiters: Vec::new(),
        };

        Self {
            operations: operations_tx,
            snapshots: snapshots_rx,
            runtime: tokio::spawn(runtime.run().instrument(span)),
        }
    }

    /// Opens the gateway socket and waits for `session.connected`.
    ///
    /// Concurrent calls share the same attempt. Resolves immediately once
    /// the session is connected.
    pub async fn connect(&self) -> Result<(), SessionError> {
        self.request(Operation::Connect).await
    }

    /// Asks the gateway to reopen the provider leg over the existing socket.
    pub async fn reinitialize(&self) -> Result<(), SessionError> {
        self.request(Operation::Reinitialize).await
    }

    /// Acquires the microphone and starts streaming audio upstream.
    pub async fn start_recording(&self) -> Result<(), SessionError> {
        self.request(Operation::StartRecording).await
    }

    /// Stops capture, sends any remaining audio and asks for a response.
    pub async fn stop_recording(&self) -> Result<(), SessionError> {
        self.request(Operation::StopRecording).await
    }

    /// Ends the session. Safe to call any number of times.
    pub async fn disconnect(&self) {
        let (tx, rx) = oneshot::channel();
        if self.operations.send(Operation::Disconnect(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.snapshots.borrow().state
    }

    /// Receiver that is notified on every observable change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Disconnects and waits for the runtime to release everything.
    pub async fn shutdown(self) {
        let VoiceSession {
            operations,
            runtime,
            ..
        } = self;
        drop(operations);
        if let Err(err) = runtime.await {
            warn!(error = %err, "session runtime ended abnormally");
        }
    }

    async fn request(&self, operation: fn(Reply) -> Operation) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.operations
            .send(operation(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
}

struct Runtime {
    config: SessionConfig,
    machine: SessionMachine,
    transport: TransportClient,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    operations: mpsc::Receiver<Operation>,
    snapshots: watch::Sender<SessionSnapshot>,
    microphone: Arc<dyn Microphone>,
    speaker: Arc<dyn Speaker>,
    opening: Option<BoxFuture<'static, Result<(), TransportError>>>,
    acquiring: Option<BoxFuture<'static, Result<Capture, DeviceError>>>,
    capture: Option<Capture>,
    playback: Option<Box<dyn Playback>>,
    playback_tx: mpsc::UnboundedSender<PlaybackSignal>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackSignal>,
    connect_deadline: Option<Instant>,
    connect_waiters: Vec<Reply>,
    recording_waiters: Vec<Reply>,
}

impl Runtime {
    async fn run(mut self) {
        debug!("session runtime started");
        loop {
            tokio::select! {
                operation = self.operations.recv() => match operation {
                    Some(operation) => self.on_operation(operation).await,
                    None => {
                        let effects = self.machine.disconnect();
                        self.execute(effects).await;
                        self.publish();
                        break;
                    }
                },
                Some(event) = self.transport_events.recv() => self.on_transport_event(event).await,
                result = settle(&mut self.opening) => {
                    let event = match result {
                        Ok(()) => SessionEvent::TransportOpened,
                        Err(err) => SessionEvent::TransportFailed(err.into()),
                    };
                    self.dispatch(event).await;
                }
                result = settle(&mut self.acquiring) => {
                    let event = match result {
                        Ok(capture) => {
                            self.capture = Some(capture);
                            SessionEvent::MicrophoneReady
                        }
                        Err(err) => SessionEvent::MicrophoneFailed(err.to_string()),
                    };
                    self.dispatch(event).await;
                }
                chunk = next_chunk(&mut self.capture) => {
                    let event = match chunk {
                        Some(samples) => SessionEvent::Captured(samples),
                        None => SessionEvent::CaptureEnded,
                    };
                    self.dispatch(event).await;
                }
                Some(signal) = self.playback_rx.recv() => {
                    let event = match signal {
                        PlaybackSignal::Idle => SessionEvent::PlaybackIdle,
                        PlaybackSignal::Failed(reason) => SessionEvent::PlaybackFailed(reason),
                    };
                    self.dispatch(event).await;
                }
                () = deadline(self.connect_deadline) => {
                    self.connect_deadline = None;
                    self.dispatch(SessionEvent::ConnectTimedOut).await;
                }
            }
            self.publish();
        }
        debug!("session runtime stopped");
    }

    async fn on_operation(&mut self, operation: Operation) {
        match operation {
            Operation::Connect(reply) => {
                self.connect_waiters.push(reply);
                let effects = self.machine.connect();
                self.execute(effects).await;
            }
            Operation::Reinitialize(reply) => match self.machine.reinitialize() {
                Ok(effects) => {
                    self.connect_waiters.push(reply);
                    self.execute(effects).await;
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Operation::StartRecording(reply) => {
                self.recording_waiters.push(reply);
                let effects = self.machine.start_recording();
                self.execute(effects).await;
            }
            Operation::StopRecording(reply) => match self.machine.stop_recording() {
                Ok(effects) => {
                    self.execute(effects).await;
                    self.publish();
                    let _ = reply.send(Ok(()));
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Operation::Disconnect(reply) => {
                let effects = self.machine.disconnect();
                self.execute(effects).await;
                self.publish();
                let _ = reply.send(());
            }
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(frame) => match parse_inbound(&frame) {
                Ok(inbound) => self.dispatch(SessionEvent::Inbound(inbound)).await,
                Err(err) => warn!(error = %err, "dropping malformed frame from gateway"),
            },
            TransportEvent::Closed { reason } => {
                info!(reason = ?reason, "gateway closed the connection");
                self.dispatch(SessionEvent::TransportClosed { reason }).await;
            }
        }
    }

    async fn dispatch(&mut self, event: SessionEvent) {
        let effects = self.machine.handle(event);
        self.execute(effects).await;
    }

    /// Runs effects in order. Events raised while executing one are handled
    /// before the effects they produce, which queue behind the rest.
    async fn execute(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            if let Some(event) = self.apply(effect).await {
                queue.extend(self.machine.handle(event));
            }
        }
    }

    async fn apply(&mut self, effect: Effect) -> Option<SessionEvent> {
        match effect {
            Effect::OpenTransport => {
                // Leftovers from a previous socket must not reach the new session.
                while self.transport_events.try_recv().is_ok() {}
                let transport = self.transport.clone();
                self.opening = Some(async move { transport.connect().await }.boxed());
            }
            Effect::CloseTransport => {
                self.opening = None;
                self.transport.close().await;
            }
            Effect::Send(outbound) => {
                if let Err(err) = self.send(outbound).await {
                    return Some(SessionEvent::SendFailed(err.into()));
                }
            }
            Effect::AcquireMicrophone => {
                let microphone = self.microphone.clone();
                self.acquiring = Some(async move { microphone.acquire().await }.boxed());
            }
            Effect::ReleaseMicrophone { flush } => {
                self.acquiring = None;
                if let Some(capture) = self.capture.take() {
                    let tail = capture.release();
                    if flush && !tail.is_empty() {
                        if let Err(err) = self.send(Outbound::Audio(tail)).await {
                            return Some(SessionEvent::SendFailed(err.into()));
                        }
                    }
                }
            }
            Effect::Play(samples) => {
                if self.playback.is_none() {
                    match self.speaker.open(self.playback_tx.clone()) {
                        Ok(playback) => self.playback = Some(playback),
                        Err(err) => return Some(SessionEvent::PlaybackFailed(err.to_string())),
                    }
                }
                if let Some(playback) = self.playback.as_mut() {
                    if let Err(err) = playback.enqueue(samples) {
                        return Some(SessionEvent::PlaybackFailed(err.to_string()));
                    }
                }
            }
            Effect::StopPlayback => {
                if let Some(playback) = self.playback.take() {
                    playback.stop();
                }
                while self.playback_rx.try_recv().is_ok() {}
            }
            Effect::ArmConnectTimer => {
                self.connect_deadline = Some(Instant::now() + self.config.connect_timeout);
            }
            Effect::DisarmConnectTimer => self.connect_deadline = None,
            Effect::ConnectSettled(result) => {
                self.publish();
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(result.clone());
                }
            }
            Effect::RecordingSettled(result) => {
                self.publish();
                for waiter in self.recording_waiters.drain(..) {
                    let _ = waiter.send(result.clone());
                }
            }
        }
        None
    }

    /// Stops at the first frame the socket refuses; later frames of the same
    /// batch are not sent.
    async fn send(&mut self, outbound: Outbound) -> Result<(), TransportError> {
        let frames = match outbound {
            Outbound::Initialize => vec![ControlFrame::Initialize.to_frame()],
            Outbound::Audio(samples) if samples.is_empty() => return Ok(()),
            Outbound::Audio(samples) => vec![ClientEvent::append_audio(&samples).to_frame()],
            Outbound::EndOfUtterance => vec![
                ClientEvent::InputAudioCommit.to_frame(),
                ClientEvent::ResponseCreate.to_frame(),
            ],
        };
        for frame in frames {
            let frame: Frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "failed to encode outbound frame");
                    continue;
                }
            };
            if let Err(err) = self.transport.send(frame).await {
                warn!(error = %err, "failed to send frame to gateway");
                return Err(err);
            }
        }
        Ok(())
    }

    fn publish(&self) {
        let next = self.machine.snapshot();
        let previous = self.snapshots.borrow().state;
        if previous != next.state {
            debug!(from = %previous, to = %next.state, "session state changed");
        }
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
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

async fn next_chunk(capture: &mut Option<Capture>) -> Option<Vec<i16>> {
    match capture {
        Some(capture) => capture.recv().await,
        None => std::future::pending().await,
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

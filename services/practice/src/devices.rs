//! File-backed audio devices.
//!
//! `FileMicrophone` replays a PCM16 recording at real-time pace, as a live
//! microphone would deliver it. `FileSpeaker` appends assistant audio to a
//! file and reports idle once the audio would have finished playing.

use async_trait::async_trait;
use practice_core::{Capture, CaptureControl, DeviceError, Microphone, Playback, PlaybackSignal, Speaker};
use practice_protocol::pcm;
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{Notify, mpsc},
    task::JoinHandle,
    time::Instant,
};
use tracing::debug;

/// Playback length of `samples` mono samples at the session rate.
pub fn duration_of(samples: usize) -> Duration {
    Duration::from_secs_f64(samples as f64 / f64::from(pcm::SAMPLE_RATE))
}

pub struct FileMicrophone {
    samples: Arc<Vec<i16>>,
    chunk_samples: usize,
    interval: Duration,
    drained: Arc<Notify>,
}

impl FileMicrophone {
    pub fn new(samples: Vec<i16>, chunk: Duration) -> Self {
        let chunk_samples =
            ((chunk.as_secs_f64() * f64::from(pcm::SAMPLE_RATE)) as usize).max(1);
        Self {
            samples: Arc::new(samples),
            chunk_samples,
            interval: chunk,
            drained: Arc::new(Notify::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Resolves once the whole recording has been delivered.
    pub async fn drained(&self) {
        self.drained.notified().await
    }
}

struct Pacer {
    task: JoinHandle<()>,
}

impl CaptureControl for Pacer {
    fn stop(&mut self) -> Vec<i16> {
        self.task.abort();
        // Chunks are delivered whole, so nothing is left behind.
        Vec::new()
    }
}

#[async_trait]
impl Microphone for FileMicrophone {
    async fn acquire(&self) -> Result<Capture, DeviceError> {
        if self.samples.is_empty() {
            return Err(DeviceError::Unavailable("input recording is empty".to_string()));
        }
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(pace(
            self.samples.clone(),
            self.chunk_samples,
            self.interval,
            tx,
            self.drained.clone(),
        ));
        Ok(Capture::new(rx, Pacer { task }))
    }
}

async fn pace(
    samples: Arc<Vec<i16>>,
    chunk_samples: usize,
    interval: Duration,
    tx: mpsc::Sender<Vec<i16>>,
    drained: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(interval);
    for chunk in samples.chunks(chunk_samples) {
        ticker.tick().await;
        if tx.send(chunk.to_vec()).await.is_err() {
            return;
        }
    }
    debug!(samples = samples.len(), "Recording fully delivered");
    drained.notify_one();
    // A live device keeps its stream open until it is released.
    tx.closed().await;
}

pub struct FileSpeaker {
    output: Option<PathBuf>,
}

impl FileSpeaker {
    /// Truncates `output` so each run starts with an empty reply file.
    pub fn create(output: Option<PathBuf>) -> std::io::Result<Self> {
        if let Some(path) = &output {
            File::create(path)?;
        }
        Ok(Self { output })
    }
}

impl Speaker for FileSpeaker {
    fn open(
        &self,
        signals: mpsc::UnboundedSender<PlaybackSignal>,
    ) -> Result<Box<dyn Playback>, DeviceError> {
        let writer = match &self.output {
            Some(path) => Some(BufWriter::new(
                OpenOptions::new()
                    .append(true)
                    .open(path)
                    .map_err(|e| DeviceError::Unavailable(e.to_string()))?,
            )),
            None => None,
        };
        let (queued, queue) = mpsc::unbounded_channel();
        let clock = tokio::spawn(playback_clock(queue, signals));
        Ok(Box::new(FilePlayback {
            writer,
            queued,
            clock,
        }))
    }
}

struct FilePlayback {
    writer: Option<BufWriter<File>>,
    queued: mpsc::UnboundedSender<Duration>,
    clock: JoinHandle<()>,
}

impl Playback for FilePlayback {
    fn enqueue(&mut self, samples: Vec<i16>) -> Result<(), DeviceError> {
        if let Some(writer) = self.writer.as_mut() {
            writer
                .write_all(&pcm::samples_to_le_bytes(&samples))
                .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
        }
        self.queued
            .send(duration_of(samples.len()))
            .map_err(|_| DeviceError::Unavailable("playback clock stopped".to_string()))
    }

    fn stop(mut self: Box<Self>) {
        self.clock.abort();
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush() {
                debug!(error = %e, "Failed to flush reply audio");
            }
        }
    }
}

impl Drop for FilePlayback {
    fn drop(&mut self) {
        self.clock.abort();
    }
}

/// Tracks when queued audio would finish playing and reports `Idle` then.
async fn playback_clock(
    mut queued: mpsc::UnboundedReceiver<Duration>,
    signals: mpsc::UnboundedSender<PlaybackSignal>,
) {
    let mut playing_until: Option<Instant> = None;
    loop {
        tokio::select! {
            length = queued.recv() => match length {
                Some(length) => {
                    let now = Instant::now();
                    let start = playing_until.map_or(now, |until| until.max(now));
                    playing_until = Some(start + length);
                }
                None => break,
            },
            () = finish(playing_until) => {
                playing_until = None;
                if signals.send(PlaybackSignal::Idle).is_err() {
                    break;
                }
            }
        }
    }
}

async fn finish(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

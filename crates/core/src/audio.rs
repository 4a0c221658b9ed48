//! Audio collaborators.
//!
//! The session never touches hardware directly. A [`Microphone`] hands out a
//! [`Capture`] stream of PCM16 chunks; a [`Speaker`] hands out a [`Playback`]
//! queue. Both are released through the handle they returned.

use async_trait::async_trait;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("device unavailable: {0}")]
    Unavailable(String),
}

/// Source of microphone audio.
#[async_trait]
pub trait Microphone: Send + Sync {
    /// Opens the capture device. May suspend on a permission prompt.
    async fn acquire(&self) -> Result<Capture, DeviceError>;
}

/// Device side of an open capture.
pub trait CaptureControl: Send {
    /// Stops the device and returns samples it captured but never delivered.
    fn stop(&mut self) -> Vec<i16>;
}

/// An open microphone. Chunks arrive in capture order.
///
/// Dropping a `Capture` stops the device.
pub struct Capture {
    chunks: mpsc::Receiver<Vec<i16>>,
    control: Option<Box<dyn CaptureControl>>,
}

impl Capture {
    pub fn new(chunks: mpsc::Receiver<Vec<i16>>, control: impl CaptureControl + 'static) -> Self {
        Self {
            chunks,
            control: Some(Box::new(control)),
        }
    }

    /// Next captured chunk; `None` once the device stops delivering.
    pub async fn recv(&mut self) -> Option<Vec<i16>> {
        self.chunks.recv().await
    }

    /// Stops the device and returns every sample not yet consumed: chunks
    /// still queued, followed by the device's unflushed tail.
    pub fn release(mut self) -> Vec<i16> {
        self.chunks.close();
        let tail = self
            .control
            .take()
            .map(|mut control| control.stop())
            .unwrap_or_default();
        let mut samples = Vec::new();
        while let Ok(chunk) = self.chunks.try_recv() {
            samples.extend(chunk);
        }
        samples.extend(tail);
        samples
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        if let Some(mut control) = self.control.take() {
            control.stop();
        }
    }
}

/// Reported by a [`Playback`] through the channel it was opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackSignal {
    /// Everything queued so far has been played.
    Idle,
    Failed(String),
}

/// Sink for assistant audio.
pub trait Speaker: Send + Sync {
    fn open(
        &self,
        signals: mpsc::UnboundedSender<PlaybackSignal>,
    ) -> Result<Box<dyn Playback>, DeviceError>;
}

/// An open output device.
pub trait Playback: Send {
    fn enqueue(&mut self, samples: Vec<i16>) -> Result<(), DeviceError>;
    /// Drops anything still queued and releases the device.
    fn stop(self: Box<Self>);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    struct Tail {
        samples: Vec<i16>,
        stops: Arc<AtomicUsize>,
    }

    impl CaptureControl for Tail {
        fn stop(&mut self) -> Vec<i16> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            std::mem::take(&mut self.samples)
        }
    }

    #[tokio::test]
    async fn test_release_returns_queued_then_tail() {
        let (tx, rx) = mpsc::channel(8);
        let stops = Arc::new(AtomicUsize::new(0));
        let mut capture = Capture::new(
            rx,
            Tail {
                samples: vec![7, 8],
                stops: stops.clone(),
            },
        );
        tx.send(vec![1, 2]).await.unwrap();
        tx.send(vec![3]).await.unwrap();
        tx.send(vec![4, 5, 6]).await.unwrap();

        assert_eq!(capture.recv().await, Some(vec![1, 2]));
        assert_eq!(capture.release(), vec![3, 4, 5, 6, 7, 8]);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(tx.send(vec![9]).await.is_err());
    }

    #[test]
    fn test_drop_stops_device() {
        let (_tx, rx) = mpsc::channel(1);
        let stops = Arc::new(AtomicUsize::new(0));
        drop(Capture::new(
            rx,
            Tail {
                samples: vec![],
                stops: stops.clone(),
            },
        ));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}

use crate::codec::{self, EncodedFrame};
use crate::error::SessionError;
use crate::visualizer::AnalyserTap;
use std::future::Future;
use tokio::sync::mpsc;

/// Default frame: 4096 samples at 16 kHz, 256 ms.
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// What a live input stream delivers to the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    Frame(Vec<f32>),
    /// The device went away. No frames follow.
    Ended(String),
}

/// Handle to an acquired input device. `stop` releases the OS handle.
pub trait InputTrack: Send {
    fn stop(&mut self);
}

/// A live microphone: fixed-size mono frames plus the track that owns the device.
pub struct CaptureStream {
    pub frames: mpsc::Receiver<CaptureEvent>,
    pub track: Box<dyn InputTrack>,
}

/// Source of microphone streams.
pub trait InputDevice {
    fn open(
        &mut self,
        sample_rate: u32,
        frame_size: usize,
    ) -> impl Future<Output = Result<CaptureStream, SessionError>> + Send;
}

/// Non-blocking destination for encoded frames.
pub trait FrameSink {
    fn enqueue(&mut self, frame: EncodedFrame) -> Result<(), SessionError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Sent { bytes: usize },
    Muted,
    /// Arrived before the transport opened, or after detach.
    Discarded,
    Failed(SessionError),
}

/// Per-frame capture logic: tap, mute check, encode, enqueue.
pub struct CapturePipeline {
    sample_rate: u32,
    wired: bool,
    tap: Option<AnalyserTap>,
}

impl CapturePipeline {
    pub fn new(sample_rate: u32, tap: AnalyserTap) -> Self {
        Self {
            sample_rate,
            wired: false,
            tap: Some(tap),
        }
    }

    /// Start forwarding frames to the transport.
    pub fn wire(&mut self) {
        self.wired = true;
    }

    pub fn is_wired(&self) -> bool {
        self.wired
    }

    /// Turn the frame callback into a no-op. Frames still in flight are dropped.
    pub fn detach(&mut self) {
        self.wired = false;
    }

    pub fn disconnect_tap(&mut self) {
        self.tap = None;
    }

    pub fn process(
        &mut self,
        frame: &[f32],
        muted: bool,
        sink: &mut dyn FrameSink,
    ) -> FrameOutcome {
        // The tap sits upstream of the mute check.
        if let Some(tap) = &self.tap {
            tap.push(frame);
        }
        if !self.wired {
            return FrameOutcome::Discarded;
        }
        if muted {
            return FrameOutcome::Muted;
        }
        let encoded = codec::encode(frame, self.sample_rate);
        let bytes = encoded.data.len();
        match sink.enqueue(encoded) {
            Ok(()) => FrameOutcome::Sent { bytes },
            Err(e) => FrameOutcome::Failed(e),
        }
    }
}

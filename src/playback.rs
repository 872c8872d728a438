use crate::codec::{self, AudioBuffer};
use crate::error::{DecodeError, SessionError};
use std::future::Future;

/// An open output device: a monotonic clock plus a way to start buffers on it.
pub trait OutputContext: Send {
    /// Seconds since the context started rendering.
    fn current_time(&self) -> f64;
    /// Queue `buffer` to start at `when` on the context clock.
    fn start(&mut self, buffer: AudioBuffer, when: f64);
    /// Silence every queued or playing buffer.
    fn stop_all(&mut self);
    /// Release the device. The context is unusable afterwards.
    fn close(&mut self);
}

pub trait OutputDevice {
    fn open(
        &mut self,
        sample_rate: u32,
        channels: u16,
    ) -> impl Future<Output = Result<Box<dyn OutputContext>, SessionError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduled {
    pub start: f64,
    pub duration: f64,
}

/// Gapless scheduler over an output context.
///
/// `next_start_time` is the end of everything queued so far. A new buffer
/// starts at `max(next_start_time, now)` and pushes the cursor forward by
/// exactly its duration, so back-to-back buffers neither gap nor overlap.
pub struct PlaybackScheduler {
    output: Box<dyn OutputContext>,
    sample_rate: u32,
    channels: u16,
    next_start_time: f64,
    closed: bool,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn OutputContext>, sample_rate: u32, channels: u16) -> Self {
        Self {
            output,
            sample_rate,
            channels,
            next_start_time: 0.0,
            closed: false,
        }
    }

    pub fn cursor(&self) -> f64 {
        self.next_start_time
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns `None` once the scheduler is closed; late buffers are dropped.
    pub fn schedule(&mut self, buffer: AudioBuffer) -> Option<Scheduled> {
        if self.closed {
            return None;
        }
        let now = self.output.current_time();
        let start = self.next_start_time.max(now);
        let duration = buffer.duration();
        self.output.start(buffer, start);
        self.next_start_time = start + duration;
        Some(Scheduled { start, duration })
    }

    /// Decode a base64 payload and schedule it. A malformed payload leaves
    /// the cursor untouched.
    pub fn schedule_payload(&mut self, payload: &str) -> Result<Option<Scheduled>, DecodeError> {
        let buffer = codec::decode_base64(payload, self.sample_rate, self.channels)?;
        Ok(self.schedule(buffer))
    }

    /// Barge-in: drop everything queued and restart the timeline at "now".
    pub fn interrupt(&mut self) {
        if self.closed {
            return;
        }
        self.output.stop_all();
        self.next_start_time = 0.0;
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.output.stop_all();
        self.output.close();
        self.next_start_time = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Log {
        now: f64,
        starts: Vec<(f64, usize)>,
        stops: usize,
        closes: usize,
    }

    struct FakeOutput(Arc<Mutex<Log>>);

    impl OutputContext for FakeOutput {
        fn current_time(&self) -> f64 {
            self.0.lock().unwrap().now
        }
        fn start(&mut self, buffer: AudioBuffer, when: f64) {
            self.0.lock().unwrap().starts.push((when, buffer.frames()));
        }
        fn stop_all(&mut self) {
            self.0.lock().unwrap().stops += 1;
        }
        fn close(&mut self) {
            self.0.lock().unwrap().closes += 1;
        }
    }

    fn scheduler() -> (PlaybackScheduler, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let out = PlaybackScheduler::new(Box::new(FakeOutput(log.clone())), 24_000, 1);
        (out, log)
    }

    fn silence(frames: usize) -> AudioBuffer {
        AudioBuffer {
            samples: vec![0.0; frames],
            sample_rate: 24_000,
            channels: 1,
        }
    }

    #[test]
    fn first_buffer_starts_now() {
        let (mut sched, log) = scheduler();
        log.lock().unwrap().now = 3.25;
        let s = sched.schedule(silence(2400)).unwrap();
        assert_eq!(s.start, 3.25);
        assert!((sched.cursor() - 3.35).abs() < 1e-9);
    }

    #[test]
    fn buffers_are_contiguous_despite_jitter() {
        let (mut sched, log) = scheduler();
        let sizes = [2400usize, 1200, 4800, 960, 2400, 3600];
        let mut prev: Option<Scheduled> = None;
        for (i, frames) in sizes.iter().enumerate() {
            // Clock wanders forward but never past the queued audio.
            log.lock().unwrap().now = 1.0 + i as f64 * 0.01;
            let s = sched.schedule(silence(*frames)).unwrap();
            if let Some(p) = prev {
                assert_eq!(s.start, p.start + p.duration);
            }
            prev = Some(s);
        }
        assert_eq!(log.lock().unwrap().starts.len(), sizes.len());
    }

    #[test]
    fn underrun_restarts_at_clock() {
        let (mut sched, log) = scheduler();
        sched.schedule(silence(2400)).unwrap();
        log.lock().unwrap().now = 5.0;
        let s = sched.schedule(silence(2400)).unwrap();
        assert_eq!(s.start, 5.0);
    }

    #[test]
    fn malformed_payload_leaves_cursor() {
        let (mut sched, log) = scheduler();
        log.lock().unwrap().now = 1.0;
        sched.schedule(silence(2400)).unwrap();
        let before = sched.cursor();

        let err = sched.schedule_payload(&BASE64.encode([1u8, 2, 3])).unwrap_err();
        assert_eq!(err, DecodeError::PartialSample(3));
        assert_eq!(sched.cursor(), before);
        assert_eq!(log.lock().unwrap().starts.len(), 1);
    }

    #[test]
    fn interrupt_resets_the_timeline() {
        let (mut sched, log) = scheduler();
        log.lock().unwrap().now = 2.0;
        sched.schedule(silence(24_000)).unwrap();
        sched.interrupt();
        assert_eq!(sched.cursor(), 0.0);
        let s = sched.schedule(silence(240)).unwrap();
        assert_eq!(s.start, 2.0);
        assert_eq!(log.lock().unwrap().stops, 1);
    }

    #[test]
    fn close_is_idempotent_and_drops_late_buffers() {
        let (mut sched, log) = scheduler();
        sched.schedule(silence(2400)).unwrap();
        assert!(!sched.is_closed());
        sched.close();
        sched.close();
        assert!(sched.is_closed());
        assert_eq!(sched.cursor(), 0.0);
        assert!(sched.schedule(silence(2400)).is_none());
        let log = log.lock().unwrap();
        assert_eq!(log.closes, 1);
        assert_eq!(log.stops, 1);
        assert_eq!(log.starts.len(), 1);
    }
}

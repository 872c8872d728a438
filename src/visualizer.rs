//! Live input spectrum.
//!
//! The capture path pushes raw frames into an [`AnalyserTap`]; a
//! [`Visualizer`] task reads byte-scaled frequency bins from it on a fixed
//! cadence and hands them to a [`SpectrumRenderer`].

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const FFT_SIZE: usize = 256;
pub const BIN_COUNT: usize = FFT_SIZE / 2;
pub const BAR_COUNT: usize = 50;
const SMOOTHING: f32 = 0.8;
const MIN_DB: f32 = -100.0;
const MAX_DB: f32 = -30.0;

struct Analyser {
    fft: Arc<dyn Fft<f32>>,
    ring: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    smoothed: [f32; BIN_COUNT],
    samples_seen: u64,
}

impl Analyser {
    fn new() -> Self {
        let mut planner = FftPlanner::<f32>::new();
        Self {
            fft: planner.plan_fft_forward(FFT_SIZE),
            ring: Vec::with_capacity(FFT_SIZE * 2),
            buffer: vec![Complex::new(0.0, 0.0); FFT_SIZE],
            smoothed: [0.0; BIN_COUNT],
            samples_seen: 0,
        }
    }

    fn push(&mut self, samples: &[f32]) {
        self.samples_seen += samples.len() as u64;
        self.ring.extend_from_slice(samples);
        // Keep only the latest window
        if self.ring.len() > FFT_SIZE * 2 {
            let drain = self.ring.len() - FFT_SIZE * 2;
            self.ring.drain(..drain);
        }
    }

    fn frequency_data(&mut self) -> [u8; BIN_COUNT] {
        let mut out = [0u8; BIN_COUNT];
        if self.ring.len() < FFT_SIZE {
            return out;
        }
        let start = self.ring.len() - FFT_SIZE;
        for i in 0..FFT_SIZE {
            let window = 0.5
                * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (FFT_SIZE as f32 - 1.0)).cos());
            self.buffer[i] = Complex::new(self.ring[start + i] * window, 0.0);
        }
        self.fft.process(&mut self.buffer);

        for (k, byte) in out.iter_mut().enumerate() {
            let magnitude = self.buffer[k].norm() / FFT_SIZE as f32;
            self.smoothed[k] = SMOOTHING * self.smoothed[k] + (1.0 - SMOOTHING) * magnitude;
            if self.smoothed[k] <= 0.0 {
                continue;
            }
            let db = 20.0 * self.smoothed[k].log10();
            let scaled = (db - MIN_DB) / (MAX_DB - MIN_DB) * 255.0;
            *byte = scaled.clamp(0.0, 255.0) as u8;
        }
        out
    }
}

/// Shared handle onto the input analyser. Cloning shares the same window.
#[derive(Clone)]
pub struct AnalyserTap {
    inner: Arc<Mutex<Analyser>>,
}

impl AnalyserTap {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Analyser::new())),
        }
    }

    pub fn push(&self, samples: &[f32]) {
        if let Ok(mut analyser) = self.inner.lock() {
            analyser.push(samples);
        }
    }

    /// Current bin magnitudes, 0-255 over a -100..-30 dB range.
    pub fn frequency_data(&self) -> [u8; BIN_COUNT] {
        match self.inner.lock() {
            Ok(mut analyser) => analyser.frequency_data(),
            Err(_) => [0; BIN_COUNT],
        }
    }

    pub fn samples_seen(&self) -> u64 {
        self.inner.lock().map(|a| a.samples_seen).unwrap_or(0)
    }
}

impl Default for AnalyserTap {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse frequency bins into `count` bars in `0.0..=1.0`, skipping DC.
pub fn bars(bins: &[u8], count: usize) -> Vec<f32> {
    if bins.len() < 2 || count == 0 {
        return vec![0.0; count];
    }
    let max_bin = bins.len();
    (0..count)
        .map(|i| {
            let idx = 1 + ((i as f32 / count as f32) * (max_bin as f32 - 1.0)) as usize;
            bins[idx.min(max_bin - 1)] as f32 / 255.0
        })
        .collect()
}

pub trait SpectrumRenderer: Send {
    fn render(&mut self, bins: &[u8]);
}

/// Renderer that draws nothing, for headless sessions.
pub struct NullRenderer;

impl SpectrumRenderer for NullRenderer {
    fn render(&mut self, _bins: &[u8]) {}
}

/// One-line block-character spectrum, redrawn in place on stderr.
pub struct TerminalBars {
    width: usize,
}

impl TerminalBars {
    pub fn new(width: usize) -> Self {
        Self { width: width.max(1) }
    }
}

impl Default for TerminalBars {
    fn default() -> Self {
        Self::new(BAR_COUNT)
    }
}

const BLOCKS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

impl SpectrumRenderer for TerminalBars {
    fn render(&mut self, bins: &[u8]) {
        let line: String = bars(bins, self.width)
            .into_iter()
            .map(|level| BLOCKS[((level * 7.0).round() as usize).min(7)])
            .collect();
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "\r{}", line);
        let _ = err.flush();
    }
}

/// Periodic render task. The liveness flag is checked on every tick so a
/// cancelled visualizer never draws again.
pub struct Visualizer {
    live: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Visualizer {
    pub fn start(tap: AnalyserTap, mut renderer: Box<dyn SpectrumRenderer>, period: Duration) -> Self {
        let live = Arc::new(AtomicBool::new(true));
        let live_task = live.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !live_task.load(Ordering::SeqCst) {
                    break;
                }
                let bins = tap.frequency_data();
                renderer.render(&bins);
            }
            log::debug!("[visualizer] render loop stopped");
        });
        Self {
            live,
            task: Some(task),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn cancel(&mut self) {
        self.live.store(false, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Visualizer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn tone(bin: usize) -> Vec<f32> {
        (0..FFT_SIZE)
            .map(|n| (2.0 * std::f32::consts::PI * bin as f32 * n as f32 / FFT_SIZE as f32).sin())
            .collect()
    }

    #[test]
    fn silence_has_no_energy() {
        let tap = AnalyserTap::new();
        tap.push(&[0.0; FFT_SIZE]);
        assert!(tap.frequency_data().iter().all(|&b| b == 0));
    }

    #[test]
    fn tone_peaks_in_its_bin() {
        let tap = AnalyserTap::new();
        tap.push(&tone(16));
        let bins = tap.frequency_data();
        assert_eq!(bins[16], 255);
        assert!(bins[16] > bins[100]);
    }

    #[test]
    fn short_window_reads_as_silence() {
        let tap = AnalyserTap::new();
        tap.push(&[0.9; FFT_SIZE / 2]);
        assert!(tap.frequency_data().iter().all(|&b| b == 0));
    }

    #[test]
    fn bars_skip_dc_and_scale() {
        let mut bins = [0u8; BIN_COUNT];
        bins[0] = 255;
        bins[1] = 255;
        let out = bars(&bins, 4);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], 1.0);
        assert!(out[1..].iter().all(|&v| v == 0.0));
    }

    struct Counting(Arc<AtomicUsize>);

    impl SpectrumRenderer for Counting {
        fn render(&mut self, _bins: &[u8]) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn cancelled_visualizer_stops_rendering() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut vis = Visualizer::start(
            AnalyserTap::new(),
            Box::new(Counting(count.clone())),
            Duration::from_millis(5),
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(count.load(Ordering::SeqCst) > 0);

        vis.cancel();
        assert!(!vis.is_live());
        let after_cancel = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
        vis.cancel();
    }
}

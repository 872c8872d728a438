//! cpal-backed microphone and speaker.
//!
//! cpal streams are not `Send`, so each one lives on its own OS thread and
//! is dropped there when the owning handle signals stop.

use crate::capture::{CaptureEvent, CaptureStream, InputDevice, InputTrack};
use crate::codec::AudioBuffer;
use crate::error::SessionError;
use crate::playback::{OutputContext, OutputDevice};
use crate::resample::{downmix, resample_linear, ResamplerState};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const FALLBACK_INPUT_RATE: u32 = 48_000;
const FRAME_QUEUE: usize = 32;
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Microphone on the default host. `None` picks the default input device.
#[derive(Debug, Clone, Default)]
pub struct CpalInput {
    pub device_name: Option<String>,
}

impl CpalInput {
    pub fn new(device_name: Option<&str>) -> Self {
        Self {
            device_name: device_name.map(str::to_string),
        }
    }
}

impl InputDevice for CpalInput {
    fn open(
        &mut self,
        sample_rate: u32,
        frame_size: usize,
    ) -> impl Future<Output = Result<CaptureStream, SessionError>> + Send {
        let device_name = self.device_name.clone();
        async move {
            let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE);
            let (ready_tx, ready_rx) = oneshot::channel();
            let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
            let lost_tx = stop_tx.clone();

            let thread = std::thread::Builder::new()
                .name("aura-capture".into())
                .spawn(move || {
                    let stream = match build_input_stream(
                        device_name.as_deref(),
                        sample_rate,
                        frame_size.max(1),
                        frames_tx,
                        lost_tx,
                    ) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(()));
                    // An explicit stop, a dropped track, or the device going away.
                    let _ = stop_rx.recv();
                    drop(stream);
                    info!("[audio] capture stream released");
                })
                .map_err(|e| {
                    SessionError::DeviceAcquisition(format!("Failed to spawn capture thread: {}", e))
                })?;

            match tokio::time::timeout(OPEN_TIMEOUT, ready_rx).await {
                Ok(Ok(Ok(()))) => Ok(CaptureStream {
                    frames: frames_rx,
                    track: Box::new(CpalTrack {
                        stop_tx: Some(stop_tx),
                        thread: Some(thread),
                    }),
                }),
                Ok(Ok(Err(e))) => {
                    reap(thread, "capture");
                    Err(SessionError::DeviceAcquisition(e))
                }
                Ok(Err(_)) => Err(SessionError::DeviceAcquisition(
                    "capture thread exited before the stream started".into(),
                )),
                Err(_) => {
                    let _ = stop_tx.send(());
                    reap(thread, "capture");
                    Err(SessionError::DeviceAcquisition(
                        "input device did not start in time".into(),
                    ))
                }
            }
        }
    }
}

fn build_input_stream(
    device_name: Option<&str>,
    target_rate: u32,
    frame_size: usize,
    frames_tx: mpsc::Sender<CaptureEvent>,
    lost_tx: std_mpsc::Sender<()>,
) -> Result<cpal::Stream, String> {
    let host = cpal::default_host();
    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| format!("Failed to list devices: {}", e))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| format!("Device '{}' not found", name))?
    } else {
        host.default_input_device()
            .ok_or("No default input device")?
    };
    info!(
        "[audio] using input device: {}",
        device.name().unwrap_or_else(|_| "unknown".into())
    );

    let config = match try_config(&device, target_rate) {
        Some(cfg) => cfg,
        None => match try_config(&device, FALLBACK_INPUT_RATE) {
            Some(cfg) => cfg,
            None => {
                let default = device
                    .default_input_config()
                    .map_err(|e| format!("No input config: {}", e))?;
                default.config()
            }
        },
    };
    let input_rate = config.sample_rate.0;
    let channels = config.channels as usize;
    info!(
        "[audio] capture config: {}Hz {}ch -> {}Hz mono, {} samples/frame",
        input_rate, channels, target_rate, frame_size
    );

    let data_tx = frames_tx.clone();
    let mut resampler = ResamplerState::default();
    let mut pending: Vec<f32> = Vec::with_capacity(frame_size * 2);
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels);
                let samples = resample_linear(&mono, input_rate, target_rate, &mut resampler);
                pending.extend_from_slice(&samples);
                while pending.len() >= frame_size {
                    let frame: Vec<f32> = pending.drain(..frame_size).collect();
                    // A full queue means the session loop is behind; drop the frame.
                    if data_tx.try_send(CaptureEvent::Frame(frame)).is_err() {
                        debug!("[audio] frame queue full or closed");
                    }
                }
            },
            move |err| {
                error!("[audio] stream error: {}", err);
                if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                    signal_device_lost(&frames_tx, &lost_tx, err.to_string());
                }
            },
            None,
        )
        .map_err(|e| format!("Failed to build stream: {}", e))?;

    stream
        .play()
        .map_err(|e| format!("Failed to start stream: {}", e))?;
    Ok(stream)
}

/// Report a lost input device. The capture thread is also told to drop the
/// stream, which closes the frame channel even when `Ended` does not fit in
/// a full queue.
fn signal_device_lost(
    frames_tx: &mpsc::Sender<CaptureEvent>,
    lost_tx: &std_mpsc::Sender<()>,
    reason: String,
) {
    if frames_tx.try_send(CaptureEvent::Ended(reason)).is_err() {
        warn!("[audio] frame queue full, closing capture to report the lost device");
    }
    let _ = lost_tx.send(());
}

fn try_config(device: &cpal::Device, rate: u32) -> Option<StreamConfig> {
    let supported: Vec<_> = device.supported_input_configs().ok()?.collect();
    let fits = |r: &cpal::SupportedStreamConfigRange| {
        r.min_sample_rate().0 <= rate && r.max_sample_rate().0 >= rate
    };
    // Prefer mono; anything wider gets downmixed.
    let range = supported
        .iter()
        .find(|r| r.channels() == 1 && fits(*r))
        .or_else(|| supported.iter().find(|r| fits(*r)))?;
    Some(StreamConfig {
        channels: range.channels(),
        sample_rate: SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    })
}

/// Owns the capture thread. Stopping drops the cpal stream on that thread.
pub struct CpalTrack {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl InputTrack for CpalTrack {
    fn stop(&mut self) {
        let Some(stop_tx) = self.stop_tx.take() else {
            return;
        };
        let _ = stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            reap(thread, "capture");
        }
    }
}

/// Join a device thread without blocking an async runtime worker.
fn reap(thread: JoinHandle<()>, name: &'static str) {
    let join = move || {
        if thread.join().is_err() {
            warn!("[audio] {} thread panicked", name);
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(join);
        }
        Err(_) => join(),
    }
}

impl Drop for CpalTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Speaker on the default host. `None` picks the default output device.
#[derive(Debug, Clone, Default)]
pub struct CpalOutput {
    pub device_name: Option<String>,
}

impl CpalOutput {
    pub fn new(device_name: Option<&str>) -> Self {
        Self {
            device_name: device_name.map(str::to_string),
        }
    }
}

struct Source {
    start_frame: u64,
    samples: Vec<f32>,
    started: bool,
}

impl Source {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Buffers queued against the device frame counter.
#[derive(Default)]
struct Timeline {
    sources: Vec<Source>,
}

impl Timeline {
    /// Mix mono sources into `out` for device frames starting at `first`.
    fn render(&mut self, out: &mut [f32], channels: usize, first: u64) {
        let rendered = (out.len() / channels.max(1)) as u64;
        // A source queued just after its slot passed still plays from its first sample.
        for source in self.sources.iter_mut().filter(|s| !s.started) {
            source.start_frame = source.start_frame.max(first);
        }
        for (k, frame) in out.chunks_mut(channels.max(1)).enumerate() {
            let t = first + k as u64;
            let mut value = 0.0f32;
            for source in &self.sources {
                if t >= source.start_frame && t < source.end_frame() {
                    value += source.samples[(t - source.start_frame) as usize];
                }
            }
            let value = value.clamp(-1.0, 1.0);
            for sample in frame.iter_mut() {
                *sample = value;
            }
        }
        for source in &mut self.sources {
            if source.start_frame < first + rendered {
                source.started = true;
            }
        }
        self.sources.retain(|s| s.end_frame() > first + rendered);
    }
}

impl OutputDevice for CpalOutput {
    fn open(
        &mut self,
        sample_rate: u32,
        channels: u16,
    ) -> impl Future<Output = Result<Box<dyn OutputContext>, SessionError>> + Send {
        let device_name = self.device_name.clone();
        async move { open_output(device_name, sample_rate, channels).await }
    }
}

async fn open_output(
    device_name: Option<String>,
    sample_rate: u32,
    channels: u16,
) -> Result<Box<dyn OutputContext>, SessionError> {
    let timeline = Arc::new(Mutex::new(Timeline::default()));
    let frames_played = Arc::new(AtomicU64::new(0));
    let (ready_tx, ready_rx) = oneshot::channel::<Result<u32, String>>();
    let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

    let thread_timeline = timeline.clone();
    let thread_counter = frames_played.clone();
    let thread = std::thread::Builder::new()
        .name("aura-playback".into())
        .spawn(move || {
            let (stream, device_rate) = match build_output_stream(
                device_name.as_deref(),
                thread_timeline,
                thread_counter,
            ) {
                Ok(ok) => ok,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(device_rate));
            let _ = stop_rx.recv();
            drop(stream);
            info!("[audio] playback stream released");
        })
        .map_err(|e| {
            SessionError::DeviceAcquisition(format!("Failed to spawn playback thread: {}", e))
        })?;

    let device_rate = match tokio::time::timeout(OPEN_TIMEOUT, ready_rx).await {
        Ok(Ok(Ok(rate))) => rate,
        Ok(Ok(Err(e))) => {
            reap(thread, "playback");
            return Err(SessionError::DeviceAcquisition(e));
        }
        Ok(Err(_)) => {
            return Err(SessionError::DeviceAcquisition(
                "playback thread exited before the stream started".into(),
            ))
        }
        Err(_) => {
            let _ = stop_tx.send(());
            reap(thread, "playback");
            return Err(SessionError::DeviceAcquisition(
                "output device did not start in time".into(),
            ));
        }
    };
    info!(
        "[audio] playback context: {}Hz {}ch in, device {}Hz",
        sample_rate, channels, device_rate
    );
    Ok(Box::new(CpalContext {
        timeline,
        frames_played,
        device_rate,
        stop_tx: Some(stop_tx),
        thread: Some(thread),
    }))
}

fn build_output_stream(
    device_name: Option<&str>,
    timeline: Arc<Mutex<Timeline>>,
    frames_played: Arc<AtomicU64>,
) -> Result<(cpal::Stream, u32), String> {
    let host = cpal::default_host();
    let device = if let Some(name) = device_name {
        host.output_devices()
            .map_err(|e| format!("Failed to list devices: {}", e))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| format!("Device '{}' not found", name))?
    } else {
        host.default_output_device()
            .ok_or("No default output device")?
    };
    info!(
        "[audio] using output device: {}",
        device.name().unwrap_or_else(|_| "unknown".into())
    );

    let config: StreamConfig = device
        .default_output_config()
        .map_err(|e| format!("No output config: {}", e))?
        .into();
    let device_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let first = frames_played.load(Ordering::Relaxed);
                // Never block the audio thread; emit silence if the queue is busy.
                match timeline.try_lock() {
                    Ok(mut tl) => tl.render(data, channels, first),
                    Err(_) => data.iter_mut().for_each(|s| *s = 0.0),
                }
                frames_played.fetch_add((data.len() / channels.max(1)) as u64, Ordering::Relaxed);
            },
            |err| error!("[audio] output stream error: {}", err),
            None,
        )
        .map_err(|e| format!("Failed to build output stream: {}", e))?;
    stream
        .play()
        .map_err(|e| format!("Failed to start output stream: {}", e))?;
    Ok((stream, device_rate))
}

/// Output clock is the number of device frames rendered so far.
pub struct CpalContext {
    timeline: Arc<Mutex<Timeline>>,
    frames_played: Arc<AtomicU64>,
    device_rate: u32,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl OutputContext for CpalContext {
    fn current_time(&self) -> f64 {
        self.frames_played.load(Ordering::Relaxed) as f64 / self.device_rate as f64
    }

    fn start(&mut self, buffer: AudioBuffer, when: f64) {
        let samples = to_device_rate(&buffer, self.device_rate);
        let wanted = (when * self.device_rate as f64).round().max(0.0) as u64;
        match self.timeline.lock() {
            Ok(mut tl) => {
                let start_frame = wanted.max(self.frames_played.load(Ordering::Relaxed));
                tl.sources.push(Source {
                    start_frame,
                    samples,
                    started: false,
                });
            }
            Err(_) => warn!("[audio] playback timeline poisoned, buffer dropped"),
        }
    }

    fn stop_all(&mut self) {
        if let Ok(mut tl) = self.timeline.lock() {
            tl.sources.clear();
        }
    }

    fn close(&mut self) {
        self.stop_all();
        let Some(stop_tx) = self.stop_tx.take() else {
            return;
        };
        let _ = stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            reap(thread, "playback");
        }
    }
}

impl Drop for CpalContext {
    fn drop(&mut self) {
        self.close();
    }
}

/// Mono at the device rate, padded or trimmed so the buffer occupies
/// exactly its own duration on the device clock.
fn to_device_rate(buffer: &AudioBuffer, device_rate: u32) -> Vec<f32> {
    let mono = downmix(&buffer.samples, buffer.channels as usize);
    let mut resampler = ResamplerState::default();
    let mut out = resample_linear(&mono, buffer.sample_rate, device_rate, &mut resampler);
    let target = (buffer.duration() * device_rate as f64).round() as usize;
    let tail = out.last().copied().unwrap_or(0.0);
    out.resize(target, tail);
    out
}

/// List available input devices (name strings).
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.input_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(_) => Vec::new(),
    }
}

pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.output_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_mixes_at_start_frame_and_retires_sources() {
        let mut tl = Timeline::default();
        tl.sources.push(Source {
            start_frame: 2,
            samples: vec![0.5; 3],
            started: false,
        });
        let mut out = vec![9.0f32; 8]; // 4 stereo frames
        tl.render(&mut out, 2, 0);
        assert_eq!(out, vec![0.0, 0.0, 0.0, 0.0, 0.5, 0.5, 0.5, 0.5]);
        assert_eq!(tl.sources.len(), 1);

        let mut out = vec![0.0f32; 4];
        tl.render(&mut out, 2, 4);
        assert_eq!(out, vec![0.5, 0.5, 0.0, 0.0]);
        assert!(tl.sources.is_empty());
    }

    #[test]
    fn late_source_plays_from_its_first_sample() {
        let mut tl = Timeline::default();
        tl.sources.push(Source {
            start_frame: 2,
            samples: vec![0.1, 0.2, 0.3],
            started: false,
        });
        // The device already rendered past frame 2 before the source was seen.
        let mut out = vec![0.0f32; 4];
        tl.render(&mut out, 1, 5);
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.0]);
        assert!(tl.sources.is_empty());
    }

    #[test]
    fn started_source_is_not_shifted() {
        let mut tl = Timeline::default();
        tl.sources.push(Source {
            start_frame: 0,
            samples: vec![0.1, 0.2, 0.3, 0.4],
            started: false,
        });
        let mut out = vec![0.0f32; 2];
        tl.render(&mut out, 1, 0);
        assert_eq!(out, vec![0.1, 0.2]);
        // A skipped callback leaves a gap; the source keeps its position.
        tl.render(&mut out, 1, 3);
        assert_eq!(out, vec![0.4, 0.0]);
    }

    #[test]
    fn lost_device_is_reported_with_room_in_the_queue() {
        let (frames_tx, mut frames_rx) = mpsc::channel(4);
        let (lost_tx, lost_rx) = std_mpsc::channel();
        signal_device_lost(&frames_tx, &lost_tx, "device unplugged".into());
        assert_eq!(
            frames_rx.try_recv().unwrap(),
            CaptureEvent::Ended("device unplugged".into())
        );
        assert!(lost_rx.try_recv().is_ok());
    }

    #[test]
    fn lost_device_stops_capture_when_the_queue_is_full() {
        let (frames_tx, mut frames_rx) = mpsc::channel(1);
        frames_tx.try_send(CaptureEvent::Frame(vec![0.0; 4])).unwrap();
        let (lost_tx, lost_rx) = std_mpsc::channel();
        signal_device_lost(&frames_tx, &lost_tx, "device unplugged".into());

        // The capture thread is told to drop the stream, which owns the senders.
        assert!(lost_rx.try_recv().is_ok());
        drop(frames_tx);
        assert!(matches!(frames_rx.try_recv(), Ok(CaptureEvent::Frame(_))));
        assert!(matches!(
            frames_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn reap_joins_inline_without_a_runtime() {
        let done = Arc::new(AtomicU64::new(0));
        let flag = done.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            flag.store(1, Ordering::SeqCst);
        });
        reap(thread, "test");
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reap_does_not_block_the_runtime() {
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let thread = std::thread::spawn(move || {
            let _ = release_rx.recv();
        });
        // Returns before the thread can finish; the join runs on the blocking pool.
        reap(thread, "test");
        release_tx.send(()).unwrap();
    }

    #[test]
    fn device_rate_conversion_keeps_duration() {
        let buffer = AudioBuffer {
            samples: vec![0.25; 2400],
            sample_rate: 24_000,
            channels: 1,
        };
        assert_eq!(to_device_rate(&buffer, 48_000).len(), 4800);
        assert_eq!(to_device_rate(&buffer, 44_100).len(), 4410);
        assert_eq!(to_device_rate(&buffer, 24_000), vec![0.25; 2400]);
    }
}

#![allow(dead_code)]

use aura_live::capture::{CaptureEvent, CaptureStream, InputDevice, InputTrack};
use aura_live::codec::{AudioBuffer, EncodedFrame};
use aura_live::controller::{Incoming, SessionConfig, SessionController, SessionEvent};
use aura_live::error::SessionError;
use aura_live::playback::{OutputContext, OutputDevice};
use aura_live::transport::{LiveChannel, LiveConfig, LiveConnector, LiveSession, TransportEvent};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ---- remote ----

#[derive(Default)]
pub struct Wire {
    pub connects: usize,
    pub configs: Vec<LiveConfig>,
    pub sent: Vec<EncodedFrame>,
    pub closes: usize,
    pub reject_sends: bool,
    server: Option<mpsc::UnboundedSender<TransportEvent>>,
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    pub wire: Arc<Mutex<Wire>>,
    pub fail_with: Arc<Mutex<Option<SessionError>>>,
}

impl FakeConnector {
    pub fn fail_next(&self, err: SessionError) {
        *self.fail_with.lock().unwrap() = Some(err);
    }

    /// Deliver an event as if the server had sent it.
    pub fn server_send(&self, event: TransportEvent) {
        let wire = self.wire.lock().unwrap();
        wire.server
            .as_ref()
            .expect("no live channel")
            .send(event)
            .expect("controller dropped the channel");
    }

    /// Drop the server side of the event channel without a close frame.
    pub fn hang_up(&self) {
        self.wire.lock().unwrap().server = None;
    }

    pub fn sent(&self) -> Vec<EncodedFrame> {
        self.wire.lock().unwrap().sent.clone()
    }

    pub fn closes(&self) -> usize {
        self.wire.lock().unwrap().closes
    }

    pub fn connects(&self) -> usize {
        self.wire.lock().unwrap().connects
    }
}

impl LiveConnector for FakeConnector {
    fn connect(
        &self,
        config: &LiveConfig,
    ) -> impl Future<Output = Result<LiveChannel, SessionError>> + Send {
        let wire = self.wire.clone();
        let failure = self.fail_with.lock().unwrap().take();
        let config = config.clone();
        async move {
            if let Some(err) = failure {
                return Err(err);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            {
                let mut w = wire.lock().unwrap();
                w.connects += 1;
                w.configs.push(config);
                w.server = Some(tx);
            }
            Ok(LiveChannel {
                session: Box::new(FakeSession { wire, closed: false }),
                events: rx,
            })
        }
    }
}

struct FakeSession {
    wire: Arc<Mutex<Wire>>,
    closed: bool,
}

impl LiveSession for FakeSession {
    fn send_realtime_input(&mut self, frame: EncodedFrame) -> Result<(), SessionError> {
        let mut wire = self.wire.lock().unwrap();
        if self.closed || wire.reject_sends {
            return Err(SessionError::Transport("socket gone".into()));
        }
        wire.sent.push(frame);
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
        self.wire.lock().unwrap().closes += 1;
    }
}

// ---- microphone ----

#[derive(Default)]
pub struct Mic {
    pub opens: usize,
    pub stops: usize,
    pub requested: Vec<(u32, usize)>,
    frames: Option<mpsc::Sender<CaptureEvent>>,
}

#[derive(Clone, Default)]
pub struct FakeInput {
    pub mic: Arc<Mutex<Mic>>,
    pub fail_with: Arc<Mutex<Option<SessionError>>>,
}

impl FakeInput {
    pub fn fail_next(&self, err: SessionError) {
        *self.fail_with.lock().unwrap() = Some(err);
    }

    /// Push a frame from the "device". `false` once the consumer is gone.
    pub fn capture(&self, frame: Vec<f32>) -> bool {
        self.emit(CaptureEvent::Frame(frame))
    }

    pub fn emit(&self, event: CaptureEvent) -> bool {
        let sender = self.mic.lock().unwrap().frames.clone();
        match sender {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// The device disappears: its frame channel closes with no `Ended` event.
    pub fn unplug(&self) {
        self.mic.lock().unwrap().frames = None;
    }

    pub fn stops(&self) -> usize {
        self.mic.lock().unwrap().stops
    }

    pub fn opens(&self) -> usize {
        self.mic.lock().unwrap().opens
    }
}

impl InputDevice for FakeInput {
    fn open(
        &mut self,
        sample_rate: u32,
        frame_size: usize,
    ) -> impl Future<Output = Result<CaptureStream, SessionError>> + Send {
        let mic = self.mic.clone();
        let failure = self.fail_with.lock().unwrap().take();
        async move {
            if let Some(err) = failure {
                return Err(err);
            }
            let (tx, rx) = mpsc::channel(64);
            {
                let mut m = mic.lock().unwrap();
                m.opens += 1;
                m.requested.push((sample_rate, frame_size));
                m.frames = Some(tx);
            }
            Ok(CaptureStream {
                frames: rx,
                track: Box::new(FakeTrack { mic }),
            })
        }
    }
}

struct FakeTrack {
    mic: Arc<Mutex<Mic>>,
}

impl InputTrack for FakeTrack {
    fn stop(&mut self) {
        let mut mic = self.mic.lock().unwrap();
        mic.stops += 1;
        // A stopped device produces nothing further.
        mic.frames = None;
    }
}

// ---- speaker ----

#[derive(Default)]
pub struct Speaker {
    pub now: f64,
    pub opens: usize,
    pub starts: Vec<(f64, f64)>,
    pub stop_alls: usize,
    pub closes: usize,
}

#[derive(Clone, Default)]
pub struct FakeOutput {
    pub speaker: Arc<Mutex<Speaker>>,
    pub fail_with: Arc<Mutex<Option<SessionError>>>,
}

impl FakeOutput {
    pub fn fail_next(&self, err: SessionError) {
        *self.fail_with.lock().unwrap() = Some(err);
    }

    pub fn set_now(&self, now: f64) {
        self.speaker.lock().unwrap().now = now;
    }

    /// (start, duration) of every buffer handed to the device.
    pub fn starts(&self) -> Vec<(f64, f64)> {
        self.speaker.lock().unwrap().starts.clone()
    }

    pub fn stop_alls(&self) -> usize {
        self.speaker.lock().unwrap().stop_alls
    }

    pub fn closes(&self) -> usize {
        self.speaker.lock().unwrap().closes
    }

    pub fn opens(&self) -> usize {
        self.speaker.lock().unwrap().opens
    }
}

impl OutputDevice for FakeOutput {
    fn open(
        &mut self,
        _sample_rate: u32,
        _channels: u16,
    ) -> impl Future<Output = Result<Box<dyn OutputContext>, SessionError>> + Send {
        let speaker = self.speaker.clone();
        let failure = self.fail_with.lock().unwrap().take();
        async move {
            if let Some(err) = failure {
                return Err(err);
            }
            speaker.lock().unwrap().opens += 1;
            Ok(Box::new(FakeContext { speaker }) as Box<dyn OutputContext>)
        }
    }
}

struct FakeContext {
    speaker: Arc<Mutex<Speaker>>,
}

impl OutputContext for FakeContext {
    fn current_time(&self) -> f64 {
        self.speaker.lock().unwrap().now
    }

    fn start(&mut self, buffer: AudioBuffer, when: f64) {
        self.speaker
            .lock()
            .unwrap()
            .starts
            .push((when, buffer.duration()));
    }

    fn stop_all(&mut self) {
        self.speaker.lock().unwrap().stop_alls += 1;
    }

    fn close(&mut self) {
        self.speaker.lock().unwrap().closes += 1;
    }
}

// ---- harness ----

pub type TestController = SessionController<FakeConnector, FakeInput, FakeOutput>;

pub struct Harness {
    pub controller: TestController,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub remote: FakeConnector,
    pub mic: FakeInput,
    pub speaker: FakeOutput,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut SessionConfig)) -> Self {
        let remote = FakeConnector::default();
        let mic = FakeInput::default();
        let speaker = FakeOutput::default();
        let mut config = SessionConfig::default();
        config.visualizer_period = Duration::from_millis(5);
        adjust(&mut config);
        let (controller, events) =
            SessionController::new(remote.clone(), mic.clone(), speaker.clone(), config);
        Self {
            controller,
            events,
            remote,
            mic,
            speaker,
        }
    }

    /// Connect and complete the open handshake.
    pub async fn open(&mut self) {
        self.controller.connect().await.expect("connect");
        self.remote.server_send(TransportEvent::Open);
        self.step().await;
    }

    /// Handle exactly one queued item.
    pub async fn step(&mut self) {
        let incoming: Incoming =
            tokio::time::timeout(Duration::from_secs(1), self.controller.next_incoming())
                .await
                .expect("nothing queued for the session loop");
        self.controller.handle_incoming(incoming);
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn pcm_payload(bytes: usize) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(vec![0u8; bytes])
}

//! Session supervisor.
//!
//! [`SessionController`] exclusively owns everything that lives for one
//! connection (transport, capture pipeline, playback scheduler, visualizer)
//! and is the only place that changes [`SessionState`], surfaces errors and
//! runs teardown. All inbound work is serialized through
//! [`SessionController::next_incoming`] / [`SessionController::handle_incoming`],
//! so the mute flag and the playback cursor are only touched from one task.

use crate::capture::{CaptureEvent, CapturePipeline, FrameOutcome, InputDevice, InputTrack};
use crate::error::SessionError;
use crate::playback::{OutputDevice, PlaybackScheduler};
use crate::settings::Settings;
use crate::transport::{
    LiveChannel, LiveConfig, LiveConnector, ServerMessage, SessionState, Transport,
    TransportEvent,
};
use crate::visualizer::{AnalyserTap, NullRenderer, SpectrumRenderer, Visualizer};
use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub live: LiveConfig,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub output_channels: u16,
    pub frame_size: usize,
    pub visualizer_period: Duration,
    /// How long the remote may take to acknowledge setup.
    pub setup_timeout: Duration,
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let system_instruction = settings.system_instruction.trim();
        Self {
            live: LiveConfig {
                model: settings.model.clone(),
                voice: settings.voice.clone(),
                system_instruction: if system_instruction.is_empty() {
                    None
                } else {
                    Some(system_instruction.to_string())
                },
                input_transcription: true,
                output_transcription: true,
            },
            input_sample_rate: settings.input_sample_rate,
            output_sample_rate: settings.output_sample_rate,
            output_channels: 1,
            frame_size: settings.frame_size.max(1),
            visualizer_period: Duration::from_millis(1000 / settings.visualizer_fps.clamp(1, 240) as u64),
            setup_timeout: Duration::from_secs(settings.setup_timeout_secs.max(1)),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Model,
}

/// User-facing notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    MuteChanged(bool),
    Error(String),
    /// The remote rejected the credential; a new key must be verified before reconnecting.
    ReauthRequired(String),
    Transcript { speaker: Speaker, text: String },
    Interrupted,
    TurnComplete,
    GoAway(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_muted: u64,
    pub frames_discarded: u64,
    pub bytes_sent: u64,
    pub payloads_received: u64,
    pub payloads_scheduled: u64,
    pub decode_errors: u64,
}

/// One unit of work for the session loop.
#[derive(Debug)]
pub enum Incoming {
    Transport(Option<TransportEvent>),
    Capture(Option<CaptureEvent>),
    /// The remote never acknowledged setup.
    SetupExpired,
}

struct ActiveSession {
    transport: Transport,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    capture: CapturePipeline,
    frames: Option<mpsc::Receiver<CaptureEvent>>,
    track: Option<Box<dyn InputTrack>>,
    playback: PlaybackScheduler,
    visualizer: Visualizer,
    setup_deadline: Option<Instant>,
    stats: SessionStats,
    started_at: DateTime<Local>,
}

type RendererFactory = Box<dyn Fn() -> Box<dyn SpectrumRenderer> + Send>;

pub struct SessionController<C, I, O> {
    connector: C,
    input: I,
    output: O,
    config: SessionConfig,
    renderer: RendererFactory,
    state: SessionState,
    muted: bool,
    last_error: Option<SessionError>,
    last_stats: SessionStats,
    active: Option<ActiveSession>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl<C, I, O> SessionController<C, I, O> {
    pub fn new(
        connector: C,
        input: I,
        output: O,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let controller = Self {
            connector,
            input,
            output,
            config,
            renderer: Box::new(|| Box::new(NullRenderer) as Box<dyn SpectrumRenderer>),
            state: SessionState::Disconnected,
            muted: false,
            last_error: None,
            last_stats: SessionStats::default(),
            active: None,
            events_tx,
        };
        (controller, events_rx)
    }

    /// Renderer built fresh for each connection's visualizer.
    pub fn with_renderer<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn SpectrumRenderer> + Send + 'static,
    {
        self.renderer = Box::new(factory);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Playback timeline cursor; 0 when no session is live.
    pub fn playback_cursor(&self) -> f64 {
        self.active
            .as_ref()
            .map(|a| a.playback.cursor())
            .unwrap_or(0.0)
    }

    pub fn visualizer_live(&self) -> bool {
        self.active
            .as_ref()
            .map(|a| a.visualizer.is_live())
            .unwrap_or(false)
    }

    /// Stats of the live session, or of the last one after teardown.
    pub fn stats(&self) -> SessionStats {
        self.active
            .as_ref()
            .map(|a| a.stats)
            .unwrap_or(self.last_stats)
    }

    pub fn connector_mut(&mut self) -> &mut C {
        &mut self.connector
    }

    pub fn set_muted(&mut self, muted: bool) {
        if self.muted == muted {
            return;
        }
        self.muted = muted;
        info!("[session] microphone {}", if muted { "muted" } else { "unmuted" });
        self.emit(SessionEvent::MuteChanged(muted));
    }

    pub fn toggle_mute(&mut self) -> bool {
        self.set_muted(!self.muted);
        self.muted
    }

    /// Tear the session down. Safe to call at any point, any number of times.
    pub fn disconnect(&mut self) {
        if self.active.is_none() {
            debug!("[session] disconnect: nothing to release");
            self.set_state(SessionState::Disconnected);
            return;
        }
        info!("[session] disconnecting");
        self.teardown();
    }

    /// Wait for the next transport event or captured frame. Pends forever
    /// while no session is live.
    pub async fn next_incoming(&mut self) -> Incoming {
        let Some(active) = self.active.as_mut() else {
            return std::future::pending().await;
        };
        tokio::select! {
            event = active.events.recv() => Incoming::Transport(event),
            capture = next_capture(&mut active.frames) => Incoming::Capture(capture),
            _ = until(active.setup_deadline) => Incoming::SetupExpired,
        }
    }

    pub fn handle_incoming(&mut self, incoming: Incoming) {
        if self.active.is_none() {
            debug!("[session] dropping {:?} after teardown", incoming);
            return;
        }
        match incoming {
            Incoming::Transport(Some(event)) => self.handle_transport_event(event),
            Incoming::Transport(None) => {
                self.fail_session(SessionError::Transport("channel closed unexpectedly".into()))
            }
            Incoming::Capture(Some(CaptureEvent::Frame(frame))) => self.handle_frame(&frame),
            Incoming::Capture(Some(CaptureEvent::Ended(reason))) => self.fail_session(
                SessionError::Transport(format!("input stream ended: {}", reason)),
            ),
            Incoming::Capture(None) => {
                self.fail_session(SessionError::Transport("input stream ended".into()))
            }
            Incoming::SetupExpired => self.on_setup_expired(),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Message(msg) => self.on_message(msg),
            TransportEvent::Closed { code, reason } => self.on_closed(code, reason),
            TransportEvent::Error(err) => self.fail_session(err),
        }
    }

    fn on_open(&mut self) {
        if self.state != SessionState::Connecting {
            debug!("[session] ignoring open while {}", self.state);
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.setup_deadline = None;
        active.transport.mark_open();
        active.capture.wire();
        info!("[session] live session open");
        self.set_state(SessionState::Connected);
    }

    fn on_message(&mut self, msg: ServerMessage) {
        let mut events = Vec::new();
        {
            let Some(active) = self.active.as_mut() else {
                return;
            };
            if msg.interrupted {
                debug!("[playback] interrupted, flushing queued audio");
                active.playback.interrupt();
                events.push(SessionEvent::Interrupted);
            }
            if let Some(payload) = msg.audio.as_deref() {
                active.stats.payloads_received += 1;
                match active.playback.schedule_payload(payload) {
                    Ok(Some(s)) => {
                        active.stats.payloads_scheduled += 1;
                        debug!("[playback] {:.3}s at t={:.3}", s.duration, s.start);
                    }
                    Ok(None) => debug!("[playback] scheduler closed, payload dropped"),
                    Err(e) => {
                        active.stats.decode_errors += 1;
                        warn!("[playback] dropping malformed audio frame: {}", e);
                    }
                }
            }
        }
        if let Some(text) = msg.input_transcript.filter(|t| !t.trim().is_empty()) {
            events.push(SessionEvent::Transcript {
                speaker: Speaker::User,
                text,
            });
        }
        if let Some(text) = msg.output_transcript.filter(|t| !t.trim().is_empty()) {
            events.push(SessionEvent::Transcript {
                speaker: Speaker::Model,
                text,
            });
        }
        if msg.turn_complete {
            events.push(SessionEvent::TurnComplete);
        }
        if let Some(time_left) = msg.go_away {
            warn!("[session] server going away (time left: {})", time_left);
            events.push(SessionEvent::GoAway(time_left));
        }
        for event in events {
            self.emit(event);
        }
    }

    fn on_setup_expired(&mut self) {
        if self.state != SessionState::Connecting {
            return;
        }
        let secs = self.config.setup_timeout.as_secs_f64();
        self.fail_session(SessionError::Transport(format!(
            "no setup reply within {:.1}s",
            secs
        )));
    }

    fn on_closed(&mut self, code: Option<u16>, reason: String) {
        if is_credential_rejection(&reason) {
            self.fail_session(SessionError::InvalidCredential(reason));
        } else if code == Some(NORMAL_CLOSURE) {
            info!("[session] remote closed the session: {}", reason);
            self.teardown();
        } else {
            let code = code.map(|c| c.to_string()).unwrap_or_else(|| "-".into());
            self.fail_session(SessionError::Transport(format!(
                "closed by remote ({}): {}",
                code, reason
            )));
        }
    }

    fn handle_frame(&mut self, frame: &[f32]) {
        let muted = self.muted;
        let Some(active) = self.active.as_mut() else {
            return;
        };
        match active.capture.process(frame, muted, &mut active.transport) {
            FrameOutcome::Sent { bytes } => {
                active.stats.frames_sent += 1;
                active.stats.bytes_sent += bytes as u64;
            }
            FrameOutcome::Muted => active.stats.frames_muted += 1,
            FrameOutcome::Discarded => active.stats.frames_discarded += 1,
            FrameOutcome::Failed(err) => self.fail_session(err),
        }
    }

    fn fail_session(&mut self, err: SessionError) {
        if self.active.is_none() {
            debug!("[session] error after teardown: {}", err);
            return;
        }
        error!("[session] {}", err);
        self.set_state(SessionState::Erroring);
        self.surface(err);
        self.teardown();
    }

    fn surface(&mut self, err: SessionError) {
        let message = err.to_string();
        if err.needs_reauth() {
            self.emit(SessionEvent::ReauthRequired(message));
        } else {
            self.emit(SessionEvent::Error(message));
        }
        self.last_error = Some(err);
    }

    /// Release order: output context, input tracks, frame callback, tap,
    /// render loop, remote channel. Each handle is taken exactly once.
    fn teardown(&mut self) {
        let Some(mut active) = self.active.take() else {
            self.set_state(SessionState::Disconnected);
            return;
        };
        active.playback.close();
        if let Some(mut track) = active.track.take() {
            track.stop();
        }
        active.capture.detach();
        drop(active.frames.take());
        active.capture.disconnect_tap();
        active.visualizer.cancel();
        active.transport.close();

        let stats = active.stats;
        let secs = (Local::now() - active.started_at).num_milliseconds() as f64 / 1000.0;
        info!(
            "[usage] session started {} lasted {:.1}s sent={} muted={} discarded={} bytes={:.1}KB received={} decode_errors={}",
            active.started_at.format("%H:%M:%S"),
            secs,
            stats.frames_sent,
            stats.frames_muted,
            stats.frames_discarded,
            stats.bytes_sent as f64 / 1024.0,
            stats.payloads_received,
            stats.decode_errors
        );
        self.last_stats = stats;
        self.set_state(SessionState::Disconnected);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!("[session] {} -> {}", self.state, state);
        self.state = state;
        self.emit(SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }
}

impl<C, I, O> SessionController<C, I, O>
where
    C: LiveConnector,
    I: InputDevice,
    O: OutputDevice,
{
    /// Open the output context, then the microphone and the remote channel
    /// concurrently. The session only becomes `Connected` once the remote
    /// sends its open event through [`Self::handle_incoming`].
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.active.is_some() {
            debug!("[session] connect ignored while {}", self.state);
            return Ok(());
        }
        self.last_error = None;
        self.set_state(SessionState::Connecting);

        let mut output = match self
            .output
            .open(self.config.output_sample_rate, self.config.output_channels)
            .await
        {
            Ok(ctx) => ctx,
            Err(e) => return Err(self.fail_connect(e)),
        };

        let live = self.config.live.clone();
        let input_rate = self.config.input_sample_rate;
        let frame_size = self.config.frame_size;
        info!(
            "[session] connecting: model={} voice={}",
            live.model, live.voice
        );
        let (channel, stream) = tokio::join!(
            self.connector.connect(&live),
            self.input.open(input_rate, frame_size),
        );

        let (channel, stream) = match (channel, stream) {
            (Ok(channel), Ok(stream)) => (channel, stream),
            (channel, stream) => {
                let mut failure = None;
                if let Err(e) = &stream {
                    failure = Some(e.clone());
                }
                if let Err(e) = &channel {
                    failure.get_or_insert_with(|| e.clone());
                }
                if let Ok(mut channel) = channel {
                    channel.session.close();
                }
                if let Ok(mut stream) = stream {
                    stream.track.stop();
                }
                output.close();
                let err = failure
                    .unwrap_or_else(|| SessionError::Transport("connect failed".into()));
                return Err(self.fail_connect(err));
            }
        };

        let tap = AnalyserTap::new();
        let visualizer = Visualizer::start(
            tap.clone(),
            (self.renderer)(),
            self.config.visualizer_period,
        );
        let LiveChannel { session, events } = channel;
        self.active = Some(ActiveSession {
            transport: Transport::new(session),
            events,
            capture: CapturePipeline::new(input_rate, tap),
            frames: Some(stream.frames),
            track: Some(stream.track),
            playback: PlaybackScheduler::new(
                output,
                self.config.output_sample_rate,
                self.config.output_channels,
            ),
            visualizer,
            setup_deadline: Some(Instant::now() + self.config.setup_timeout),
            stats: SessionStats::default(),
            started_at: Local::now(),
        });
        info!("[session] channel established, waiting for setup");
        Ok(())
    }

    fn fail_connect(&mut self, err: SessionError) -> SessionError {
        error!("[session] connect failed: {}", err);
        self.surface(err.clone());
        self.set_state(SessionState::Disconnected);
        err
    }
}

impl<C, I, O> Drop for SessionController<C, I, O> {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn next_capture(frames: &mut Option<mpsc::Receiver<CaptureEvent>>) -> Option<CaptureEvent> {
    match frames {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Whether a close reason means the credential was refused.
pub fn is_credential_rejection(reason: &str) -> bool {
    let lower = reason.to_ascii_lowercase();
    lower.contains("api key") || lower.contains("unauthenticated") || lower.contains("permission denied")
}

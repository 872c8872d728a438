use crate::capture::FrameSink;
use crate::codec::EncodedFrame;
use crate::error::SessionError;
use std::fmt;
use std::future::Future;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Transient: an error was surfaced and teardown is running.
    Erroring,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Erroring => "erroring",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Parameters sent when opening a live session.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveConfig {
    pub model: String,
    pub voice: String,
    pub system_instruction: Option<String>,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

/// Transport-neutral view of one server message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerMessage {
    /// Base64 PCM, at most one per message.
    pub audio: Option<String>,
    pub interrupted: bool,
    pub turn_complete: bool,
    pub input_transcript: Option<String>,
    pub output_transcript: Option<String>,
    /// Set when the server announced it will drop the connection.
    pub go_away: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The remote confirmed the session is ready.
    Open,
    Message(ServerMessage),
    Closed { code: Option<u16>, reason: String },
    Error(SessionError),
}

/// Outbound half of an open channel.
pub trait LiveSession: Send {
    /// Queue a frame. Never waits on the network.
    fn send_realtime_input(&mut self, frame: EncodedFrame) -> Result<(), SessionError>;
    fn close(&mut self);
}

pub struct LiveChannel {
    pub session: Box<dyn LiveSession>,
    /// Inbound events in arrival order; unbounded so nothing is dropped.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

pub trait LiveConnector {
    fn connect(
        &self,
        config: &LiveConfig,
    ) -> impl Future<Output = Result<LiveChannel, SessionError>> + Send;
}

/// One connection's outbound side, gated on the open handshake.
pub struct Transport {
    session: Box<dyn LiveSession>,
    open: bool,
    closed: bool,
    frames_sent: u64,
    bytes_sent: u64,
}

impl Transport {
    pub fn new(session: Box<dyn LiveSession>) -> Self {
        Self {
            session,
            open: false,
            closed: false,
            frames_sent: 0,
            bytes_sent: 0,
        }
    }

    pub fn mark_open(&mut self) {
        if !self.closed {
            self.open = true;
        }
    }

    pub fn is_open(&self) -> bool {
        self.open && !self.closed
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.open = false;
        self.session.close();
    }
}

impl FrameSink for Transport {
    fn enqueue(&mut self, frame: EncodedFrame) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::NotConnected);
        }
        let bytes = frame.data.len() as u64;
        self.session.send_realtime_input(frame)?;
        self.frames_sent += 1;
        self.bytes_sent += bytes;
        Ok(())
    }
}

use thiserror::Error;

/// Malformed inbound audio. Absorbed by the playback path: the frame is
/// logged and dropped, the session keeps running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload has {0} bytes, not a whole number of 16-bit samples")]
    PartialSample(usize),
    #[error("payload is not valid base64: {0}")]
    Base64(String),
    #[error("channel count must be at least 1")]
    NoChannels,
}

/// Connection-lifecycle failures. These always reach the session controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("audio device unavailable: {0}")]
    DeviceAcquisition(String),
    #[error("connection failed: {0}")]
    Transport(String),
    #[error("credential rejected: {0}")]
    InvalidCredential(String),
    #[error("session is not connected")]
    NotConnected,
}

impl SessionError {
    /// Whether the caller should re-authenticate before reconnecting.
    pub fn needs_reauth(&self) -> bool {
        matches!(self, SessionError::InvalidCredential(_))
    }
}

/// Failures of the one-shot studio requests.
#[derive(Error, Debug)]
pub enum StudioError {
    #[error("no image returned")]
    NoImageReturned,
    #[error("no video URI returned")]
    NoVideoUri,
    /// Message reported by the remote job, surfaced verbatim.
    #[error("{0}")]
    RemoteJob(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to download result: {0}")]
    Download(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

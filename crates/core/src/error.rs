//! Error taxonomy for live voice sessions.
//!
//! `SessionError` is user facing: its `Display` output is exactly the message the
//! UI shows next to the retry button. `AudioError` stays internal and is only
//! ever logged.

use thiserror::Error;

/// Websocket close code for a normal, deliberate close.
pub const NORMAL_CLOSE_CODE: u16 = 1000;
/// Websocket close code the backend uses when the API key's referrer/domain
/// policy rejects the connection.
pub const POLICY_VIOLATION_CLOSE_CODE: u16 = 1008;

/// Failures that end a session attempt (or, for `StaleSession`, a single send).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Missing API Key")]
    MissingApiKey,
    #[error("Microphone access denied")]
    PermissionDenied(String),
    #[error("Access Denied: Please check API Key Referrer/Domain restrictions.")]
    AccessDenied,
    #[error("Failed to start session")]
    Handshake(String),
    #[error("Connection Error")]
    Connection(String),
    #[error("Connection closed unexpectedly (code {0})")]
    ClosedUnexpectedly(u16),
    #[error("Audio output unavailable")]
    OutputUnavailable(String),
    /// A frame was handed to a transport that has already been replaced or closed.
    #[error("session was superseded before the frame could be sent")]
    StaleSession,
}

impl SessionError {
    /// Classifies a close notification from the backend.
    ///
    /// Returns `None` for a normal close, which is not an error at all.
    pub fn from_close_code(code: Option<u16>) -> Option<Self> {
        match code {
            None | Some(NORMAL_CLOSE_CODE) => None,
            Some(POLICY_VIOLATION_CLOSE_CODE) => Some(SessionError::AccessDenied),
            Some(other) => Some(SessionError::ClosedUnexpectedly(other)),
        }
    }

    /// The underlying detail, for logs. The `Display` message is kept short for the UI.
    pub fn detail(&self) -> Option<&str> {
        match self {
            SessionError::PermissionDenied(detail)
            | SessionError::Handshake(detail)
            | SessionError::Connection(detail)
            | SessionError::OutputUnavailable(detail) => Some(detail),
            _ => None,
        }
    }
}

/// Failures while converting audio between wire and sample formats.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("PCM16 payload has an odd byte length ({0})")]
    OddLength(usize),
    #[error("failed to construct resampler: {0}")]
    Resampler(#[from] rubato::ResamplerConstructionError),
    #[error("resampling failed: {0}")]
    Resample(#[from] rubato::ResampleError),
}

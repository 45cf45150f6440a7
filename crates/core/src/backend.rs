//! Provider-neutral seam between the session manager and a live speech backend.

use crate::error::SessionError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// What the backend needs to know when a session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSessionConfig {
    pub system_instruction: String,
    /// Provider voice identifier, e.g. "Fenrir".
    pub voice_name: String,
}

/// Events a live backend emits for one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// The backend accepted the session and is ready for audio.
    Opened,
    /// A text part of the model's turn.
    Text(String),
    /// A chunk of model speech, base64 PCM16 at the playback rate.
    Audio(String),
    /// The model finished its turn.
    TurnComplete,
    /// The transport closed. `code` is `None` when no close frame was received.
    Closed { code: Option<u16>, reason: String },
    /// The transport failed.
    Error(String),
}

/// Outbound half of a connection.
///
/// Sending is synchronous and non-blocking: frames are handed to a writer task.
/// Once the connection is closed every send fails with
/// [`SessionError::StaleSession`].
pub trait AudioSender: Send {
    fn send_audio(&self, base64_pcm: String) -> Result<(), SessionError>;

    /// Closes the connection. Calling it more than once is harmless.
    fn close(&self);
}

pub struct BackendConnection {
    pub sender: Box<dyn AudioSender>,
    pub events: mpsc::UnboundedReceiver<BackendEvent>,
}

impl std::fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnection").finish_non_exhaustive()
    }
}

/// A live speech backend able to open duplex audio sessions.
#[async_trait]
pub trait VoiceBackend: Send + Sync {
    /// Opens a connection and sends the session setup.
    ///
    /// Resolving only means the transport is up; [`BackendEvent::Opened`]
    /// arrives on the event stream once the backend has accepted the setup.
    async fn connect(&self, config: LiveSessionConfig) -> Result<BackendConnection, SessionError>;
}

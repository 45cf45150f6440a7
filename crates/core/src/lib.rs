//! Core of the Samvad live voice conversation: audio conversion, capture
//! framing, playback scheduling, activity metrics and the connection
//! lifecycle controller. Nothing in this crate touches a device or a socket.

pub mod activity;
pub mod audio_utils;
pub mod backend;
pub mod capture;
pub mod content;
pub mod error;
pub mod persona;
pub mod playback;
pub mod session;
pub mod turn;

pub use backend::{AudioSender, BackendConnection, BackendEvent, LiveSessionConfig, VoiceBackend};
pub use error::{AudioError, SessionError};
pub use session::{
    ConnectionId, Dispatch, Effect, SessionController, SessionEvent, SessionSnapshot,
    SessionStatus, VoiceProfile,
};

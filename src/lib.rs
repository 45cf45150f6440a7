//! Samvad: live voice conversations with historical figures.
//!
//! This umbrella crate re-exports the workspace members so downstream code can
//! depend on a single crate:
//!
//! - [`core`]: audio conversion, capture framing, playback scheduling, the
//!   activity feed and the connection lifecycle controller.
//! - [`gemini`]: the Gemini Live websocket client.
//! - [`service`]: configuration, cpal devices and the live session manager.

pub use gemini_live as gemini;
pub use samvad_core as core;
pub use samvad_service as service;

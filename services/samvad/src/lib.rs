//! Samvad Service Library Crate
//!
//! Everything the `samvad` binary needs to hold a live voice conversation with a
//! historical figure: configuration, the cpal audio devices, the Gemini Live
//! backend adapter, the session manager that drives the connection lifecycle
//! controller, and the line-oriented terminal shell.

pub mod config;
pub mod devices;
pub mod gemini;
pub mod manager;
pub mod shell;

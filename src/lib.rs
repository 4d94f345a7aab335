//! Full-duplex voice streaming client.
//!
//! Microphone audio is streamed to a voice server as raw PCM while the
//! server's reply audio is re-chunked, scheduled gaplessly and cut off the
//! moment the user starts talking over it.

pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod net_link;
pub mod protocol;
pub mod session;

pub use error::{AudioError, Result};

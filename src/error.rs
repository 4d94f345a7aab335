//! Error types for the audio core.

use thiserror::Error;

/// Result alias used throughout the audio core.
pub type Result<T> = std::result::Result<T, AudioError>;

#[derive(Debug, Error)]
pub enum AudioError {
    /// PCM payload that is empty where data is required, or not a whole
    /// number of 16-bit samples. The offending unit is dropped.
    #[error("misaligned PCM payload of {len} bytes")]
    Alignment { len: usize },

    /// A capture or output device could not be acquired. Fatal to session startup.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A device that was open refused an operation.
    #[error("audio device error: {0}")]
    Device(String),
}

impl AudioError {
    pub fn is_alignment(&self) -> bool {
        matches!(self, AudioError::Alignment { .. })
    }
}

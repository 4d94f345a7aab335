//! audio - Capture, jitter buffering, gapless playback scheduling and barge-in.
//!
//! Everything except `system` and `alsa_device` is pure state driven by the
//! session's event loop; those two own the real-time device threads.

#[cfg(feature = "alsa-backend")]
mod alsa_device;
pub mod capture;
pub mod codec;
pub mod interrupt;
pub mod jitter;
pub mod scheduler;
pub mod system;
pub mod timeline;

pub use capture::{CaptureOutcome, CapturePipeline, Delivery, FrameSink, SinkError};
pub use codec::{PcmFrame, SampleBlock};
pub use interrupt::{BargeInTrigger, InterruptReport, InterruptionController, TranscriptLengthTrigger};
pub use jitter::{JitterBuffer, PlaybackBlock};
pub use scheduler::{HandleId, OutputDevice, Placement, PlaybackScheduler, ScheduledBlock, StarvationGap};
pub use system::{AudioConfig, AudioSystem, BackendKind, DeviceEvent, DeviceEventKind};
pub use timeline::{Timeline, TimelineOutput};

//! Capture path: sample block → PCM frame → transport, with a level side output.

use thiserror::Error;
use tokio::sync::watch;

use super::codec::{self, PcmFrame, SampleBlock};

/// Why an outbound frame could not be handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("transport queue full")]
    Full,
    #[error("transport closed")]
    Closed,
}

/// Non-blocking outbound side of the transport.
///
/// Implementations must never wait: a frame that cannot be accepted right
/// now is refused and the caller drops it.
pub trait FrameSink {
    fn try_send_frame(&mut self, frame: PcmFrame) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Dropped(SinkError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureOutcome {
    /// Mean absolute magnitude, if it could be computed.
    pub level: Option<f32>,
    pub delivery: Delivery,
}

/// Mean absolute sample magnitude. `None` for empty blocks or non-finite input.
pub fn block_level(samples: &[f32]) -> Option<f32> {
    if samples.is_empty() {
        return None;
    }
    let sum: f64 = samples.iter().map(|s| f64::from(s.abs())).sum();
    let level = (sum / samples.len() as f64) as f32;
    level.is_finite().then_some(level)
}

pub struct CapturePipeline {
    sample_rate: u32,
    level_tx: watch::Sender<f32>,
    frames_sent: u64,
    frames_dropped: u64,
}

impl CapturePipeline {
    pub fn new(sample_rate: u32) -> Self {
        let (level_tx, _) = watch::channel(0.0);
        Self {
            sample_rate,
            level_tx,
            frames_sent: 0,
            frames_dropped: 0,
        }
    }

    /// Latest capture level, for metering.
    pub fn subscribe_level(&self) -> watch::Receiver<f32> {
        self.level_tx.subscribe()
    }

    /// Encode one captured block and offer it to the sink without blocking.
    pub fn process<S: FrameSink + ?Sized>(
        &mut self,
        block: &SampleBlock,
        sink: &mut S,
    ) -> CaptureOutcome {
        if block.sample_rate() != self.sample_rate {
            log::warn!(
                "Captured block at {}Hz, session negotiated {}Hz",
                block.sample_rate(),
                self.sample_rate
            );
        }

        let frame = codec::encode(block);
        let delivery = match sink.try_send_frame(frame) {
            Ok(()) => {
                self.frames_sent += 1;
                Delivery::Sent
            }
            Err(e) => {
                self.frames_dropped += 1;
                log::debug!("Dropping capture frame: {}", e);
                Delivery::Dropped(e)
            }
        };

        let level = block_level(block.samples());
        if let Some(level) = level {
            // send_replace never fails, even with no subscribers
            self.level_tx.send_replace(level);
        }

        CaptureOutcome { level, delivery }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }
}

//! Barge-in: cancel all queued and playing assistant audio when the user speaks.

use super::jitter::JitterBuffer;
use super::scheduler::{HandleId, OutputDevice, PlaybackScheduler};

/// Barge-in threshold used by the default trigger.
pub const DEFAULT_MIN_TRANSCRIPT_CHARS: usize = 2;

/// Decides whether a user transcript update counts as the user speaking.
pub trait BargeInTrigger: Send {
    fn should_interrupt(&self, transcript: &str) -> bool;
}

impl<F> BargeInTrigger for F
where
    F: Fn(&str) -> bool + Send,
{
    fn should_interrupt(&self, transcript: &str) -> bool {
        self(transcript)
    }
}

/// Fires when the trimmed transcript is longer than `min_chars` characters.
#[derive(Debug, Clone, Copy)]
pub struct TranscriptLengthTrigger {
    pub min_chars: usize,
}

impl Default for TranscriptLengthTrigger {
    fn default() -> Self {
        Self {
            min_chars: DEFAULT_MIN_TRANSCRIPT_CHARS,
        }
    }
}

impl BargeInTrigger for TranscriptLengthTrigger {
    fn should_interrupt(&self, transcript: &str) -> bool {
        transcript.trim().chars().count() > self.min_chars
    }
}

/// What one interrupt tore down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptReport {
    pub stopped: Vec<HandleId>,
    pub discarded_bytes: usize,
    /// Device clock the cursor was reset to.
    pub cursor: u64,
}

pub struct InterruptionController {
    trigger: Box<dyn BargeInTrigger>,
    interrupts: u64,
}

impl InterruptionController {
    pub fn new(trigger: Box<dyn BargeInTrigger>) -> Self {
        Self {
            trigger,
            interrupts: 0,
        }
    }

    pub fn with_min_chars(min_chars: usize) -> Self {
        Self::new(Box::new(TranscriptLengthTrigger { min_chars }))
    }

    pub fn interrupt_count(&self) -> u64 {
        self.interrupts
    }

    pub fn should_interrupt(&self, transcript: &str) -> bool {
        self.trigger.should_interrupt(transcript)
    }

    /// Stop everything and rewind. Runs to completion before returning:
    /// afterwards no handle is tracked, nothing is queued, and blocks that
    /// had not started yet are gone from the device.
    pub fn interrupt<D: OutputDevice + ?Sized>(
        &mut self,
        jitter: &mut JitterBuffer,
        scheduler: &mut PlaybackScheduler,
        device: &mut D,
    ) -> InterruptReport {
        let stopped = scheduler.cancel_all(device);
        let discarded_bytes = jitter.clear();
        let cursor = device.now();
        scheduler.reset_cursor(cursor);
        self.interrupts += 1;

        log::info!(
            "Barge-in: stopped {} blocks, discarded {} queued bytes",
            stopped.len(),
            discarded_bytes
        );

        InterruptReport {
            stopped,
            discarded_bytes,
            cursor,
        }
    }
}

impl Default for InterruptionController {
    fn default() -> Self {
        Self::new(Box::new(TranscriptLengthTrigger::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::scheduler::DEFAULT_START_LEAD;
    use crate::audio::scheduler::testing::{ManualDevice, block};

    #[test]
    fn default_trigger_needs_more_than_two_chars() {
        let trigger = TranscriptLengthTrigger::default();
        assert!(!trigger.should_interrupt(""));
        assert!(!trigger.should_interrupt("  hi  "));
        assert!(!trigger.should_interrupt("ok"));
        assert!(trigger.should_interrupt("hey"));
        assert!(trigger.should_interrupt("  wait a second"));
        // Characters, not bytes
        assert!(!trigger.should_interrupt("日本"));
        assert!(trigger.should_interrupt("日本語"));
    }

    #[test]
    fn closures_work_as_triggers() {
        let controller = InterruptionController::new(Box::new(|t: &str| t.contains("stop")));
        assert!(controller.should_interrupt("please stop"));
        assert!(!controller.should_interrupt("keep going"));
    }

    #[test]
    fn interrupt_mid_stream_clears_everything() {
        let mut device = ManualDevice::new(24000);
        let mut scheduler = PlaybackScheduler::new(24000, DEFAULT_START_LEAD, 0);
        let mut jitter = JitterBuffer::with_block_bytes(900);
        let mut controller = InterruptionController::default();

        scheduler.schedule(&mut device, block(0, 450)).unwrap();
        scheduler.schedule(&mut device, block(1, 450)).unwrap();
        jitter.push(vec![0u8; 300]).unwrap();
        device.clock = 200;

        let report = controller.interrupt(&mut jitter, &mut scheduler, &mut device);

        assert_eq!(report.stopped.len(), 2);
        assert_eq!(report.discarded_bytes, 300);
        assert_eq!(report.cursor, 200);
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(jitter.queued_bytes(), 0);
        assert_eq!(scheduler.cursor(), 200);
        // The second block had not started; it must be gone from the device
        assert!(device.pending().is_empty());
        assert_eq!(controller.interrupt_count(), 1);
    }

    #[test]
    fn interrupt_when_idle_is_harmless() {
        let mut device = ManualDevice::new(24000);
        device.clock = 42;
        let mut scheduler = PlaybackScheduler::new(24000, DEFAULT_START_LEAD, 0);
        let mut jitter = JitterBuffer::new(24000);
        let mut controller = InterruptionController::default();

        let report = controller.interrupt(&mut jitter, &mut scheduler, &mut device);
        assert!(report.stopped.is_empty());
        assert_eq!(report.discarded_bytes, 0);
        assert_eq!(scheduler.cursor(), 42);
    }

    #[test]
    fn completion_after_interrupt_is_ignored() {
        let mut device = ManualDevice::new(24000);
        let mut scheduler = PlaybackScheduler::new(24000, DEFAULT_START_LEAD, 0);
        let mut jitter = JitterBuffer::new(24000);
        let mut controller = InterruptionController::default();

        let scheduled = scheduler.schedule(&mut device, block(0, 2400)).unwrap();
        controller.interrupt(&mut jitter, &mut scheduler, &mut device);

        assert!(!scheduler.complete(scheduled.handle));
        assert_eq!(scheduler.active_count(), 0);
    }
}

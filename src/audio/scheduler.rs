//! Gapless playback scheduling against the output device clock.
//!
//! The cursor is kept in output frames and advanced by each block's exact
//! frame count, so consecutive blocks are contiguous to the sample. When the
//! device clock overtakes the cursor (starvation), the cursor is moved to
//! `now + lead` instead of trying to catch up.

use std::collections::BTreeMap;
use std::time::Duration;

use super::codec::{self, SampleBlock};
use super::jitter::PlaybackBlock;
use crate::error::Result;

/// Default headroom used when resynchronizing after starvation.
pub const DEFAULT_START_LEAD: Duration = Duration::from_millis(50);

/// Identifies one scheduled block on the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a block actually landed on the output clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub start: u64,
    /// How far the clock had already passed the requested position.
    pub late_by: Option<u64>,
}

impl Placement {
    /// Start at `at`, or at `now + lead` if the clock has already passed it.
    pub fn resolve(at: u64, lead: u64, now: u64) -> Self {
        if at < now {
            Self {
                start: now + lead,
                late_by: Some(now - at),
            }
        } else {
            Self {
                start: at,
                late_by: None,
            }
        }
    }
}

/// The output side of an audio device, driven by frame positions.
pub trait OutputDevice {
    fn sample_rate(&self) -> u32;

    /// Current output clock, in frames since the device opened.
    fn now(&self) -> u64;

    /// Schedule `block` at frame `at`, or at `now + lead` if the clock is
    /// already past `at`. Reading the clock and inserting the block must be
    /// one step, so a block is never placed partly in the past.
    fn start_at(
        &mut self,
        handle: HandleId,
        block: SampleBlock,
        at: u64,
        lead: u64,
    ) -> Result<Placement>;

    /// Stop a block immediately, whether playing or still pending.
    /// Unknown or already finished handles are a no-op.
    fn stop(&mut self, handle: HandleId);
}

/// Blocks currently scheduled or playing, with the frame each one ends at.
#[derive(Debug, Default)]
pub struct ActiveHandleSet {
    handles: BTreeMap<HandleId, u64>,
}

impl ActiveHandleSet {
    pub fn insert(&mut self, handle: HandleId, end: u64) {
        self.handles.insert(handle, end);
    }

    pub fn remove(&mut self, handle: HandleId) -> bool {
        self.handles.remove(&handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Forget every block that has ended by `now`.
    pub fn reap(&mut self, now: u64) -> Vec<HandleId> {
        let finished: Vec<HandleId> = self
            .handles
            .iter()
            .filter(|&(_, &end)| end <= now)
            .map(|(&h, _)| h)
            .collect();
        for handle in &finished {
            self.handles.remove(handle);
        }
        finished
    }

    /// Empty the set, returning what it held in scheduling order.
    pub fn drain(&mut self) -> Vec<HandleId> {
        std::mem::take(&mut self.handles).into_keys().collect()
    }
}

/// The cursor had fallen behind the device clock by `behind_by` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StarvationGap {
    pub behind_by: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledBlock {
    pub handle: HandleId,
    pub seq: u64,
    /// Start position on the output clock, in frames.
    pub start: u64,
    pub frames: u64,
    pub starvation: Option<StarvationGap>,
}

#[derive(Debug)]
pub struct PlaybackScheduler {
    sample_rate: u32,
    lead_frames: u64,
    cursor: u64,
    active: ActiveHandleSet,
    next_handle: u64,
}

pub fn duration_to_frames(duration: Duration, sample_rate: u32) -> u64 {
    (duration.as_secs_f64() * f64::from(sample_rate)).round() as u64
}

impl PlaybackScheduler {
    /// `now` is the device clock at session start; the cursor begins there.
    pub fn new(sample_rate: u32, lead: Duration, now: u64) -> Self {
        Self {
            sample_rate,
            lead_frames: duration_to_frames(lead, sample_rate),
            cursor: now,
            active: ActiveHandleSet::default(),
            next_handle: 0,
        }
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn lead_frames(&self) -> u64 {
        self.lead_frames
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn active(&self) -> &ActiveHandleSet {
        &self.active
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Decode a block and place it at the cursor.
    ///
    /// If the device refuses the block the cursor does not move and no
    /// handle is registered.
    pub fn schedule<D: OutputDevice + ?Sized>(
        &mut self,
        device: &mut D,
        block: PlaybackBlock,
    ) -> Result<ScheduledBlock> {
        self.reap_finished(device.now());

        let samples = codec::decode(&block.frame, self.sample_rate);
        let frames = samples.len() as u64;

        let handle = HandleId(self.next_handle);
        let placed = device.start_at(handle, samples, self.cursor, self.lead_frames)?;
        self.next_handle += 1;

        let start = placed.start;
        self.cursor = start + frames;
        self.active.insert(handle, self.cursor);

        let starvation = placed.late_by.map(|behind_by| StarvationGap { behind_by });
        if let Some(gap) = starvation {
            log::debug!(
                "Playback starved by {} frames, block {} resynced to {}",
                gap.behind_by,
                block.seq,
                start
            );
        }

        Ok(ScheduledBlock {
            handle,
            seq: block.seq,
            start,
            frames,
            starvation,
        })
    }

    /// Drop handles whose blocks have ended by `now`, whether or not their
    /// completion was ever reported.
    pub fn reap_finished(&mut self, now: u64) -> Vec<HandleId> {
        let reaped = self.active.reap(now);
        if !reaped.is_empty() {
            log::trace!("Reaped {} finished blocks", reaped.len());
        }
        reaped
    }

    /// A block finished on its own. Returns false for handles that are no
    /// longer tracked (e.g. already cancelled).
    pub fn complete(&mut self, handle: HandleId) -> bool {
        self.active.remove(handle)
    }

    /// Stop every tracked block and forget it.
    pub fn cancel_all<D: OutputDevice + ?Sized>(&mut self, device: &mut D) -> Vec<HandleId> {
        let handles = self.active.drain();
        for &handle in &handles {
            device.stop(handle);
        }
        handles
    }

    pub fn reset_cursor(&mut self, now: u64) {
        self.cursor = now;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::AudioError;
    use std::collections::BTreeMap;

    /// Output device with a hand-driven clock.
    #[derive(Debug, Default)]
    pub struct ManualDevice {
        pub rate: u32,
        pub clock: u64,
        pub scheduled: BTreeMap<HandleId, (u64, usize)>,
        pub stopped: Vec<HandleId>,
        pub refuse: bool,
        /// Clock the device sees when a block arrives, if it moved on
        /// since `now()` was last read
        pub clock_on_start: Option<u64>,
    }

    impl ManualDevice {
        pub fn new(rate: u32) -> Self {
            Self {
                rate,
                ..Default::default()
            }
        }

        /// Handles whose start lies in the future and were not stopped.
        pub fn pending(&self) -> Vec<HandleId> {
            self.scheduled
                .iter()
                .filter(|(_, (start, _))| *start > self.clock)
                .map(|(h, _)| *h)
                .collect()
        }
    }

    impl OutputDevice for ManualDevice {
        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn now(&self) -> u64 {
            self.clock
        }

        fn start_at(
            &mut self,
            handle: HandleId,
            block: SampleBlock,
            at: u64,
            lead: u64,
        ) -> Result<Placement> {
            if self.refuse {
                return Err(AudioError::Device("refused".into()));
            }
            if let Some(clock) = self.clock_on_start.take() {
                self.clock = clock;
            }
            let placed = Placement::resolve(at, lead, self.clock);
            self.scheduled.insert(handle, (placed.start, block.len()));
            Ok(placed)
        }

        fn stop(&mut self, handle: HandleId) {
            self.scheduled.remove(&handle);
            self.stopped.push(handle);
        }
    }

    pub fn block(seq: u64, samples: usize) -> PlaybackBlock {
        PlaybackBlock {
            seq,
            frame: crate::audio::codec::PcmFrame::new(vec![0u8; samples * 2]).unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ManualDevice, block};
    use super::*;

    #[test]
    fn consecutive_blocks_are_contiguous() {
        let mut device = ManualDevice::new(24000);
        device.clock = 1000;
        let mut scheduler = PlaybackScheduler::new(24000, DEFAULT_START_LEAD, device.now());

        let first = scheduler.schedule(&mut device, block(0, 2400)).unwrap();
        let mut starts = vec![first.start];
        for k in 1..50u64 {
            // Clock advances, but never past the cursor
            device.clock = scheduler.cursor() - 100;
            let scheduled = scheduler.schedule(&mut device, block(k, 2400)).unwrap();
            assert!(scheduled.starvation.is_none());
            starts.push(scheduled.start);
        }

        for (k, start) in starts.iter().enumerate() {
            assert_eq!(*start, first.start + k as u64 * 2400);
        }
        // Everything but the last two has ended by the clock
        assert_eq!(scheduler.active_count(), 2);
    }

    #[test]
    fn first_block_at_session_clock_has_no_gap() {
        let mut device = ManualDevice::new(24000);
        device.clock = 500;
        let mut scheduler = PlaybackScheduler::new(24000, DEFAULT_START_LEAD, 500);

        let scheduled = scheduler.schedule(&mut device, block(0, 2400)).unwrap();
        assert_eq!(scheduled.start, 500);
        assert_eq!(scheduler.cursor(), 2900);
    }

    #[test]
    fn starvation_resyncs_to_clock_plus_lead() {
        let mut device = ManualDevice::new(24000);
        let mut scheduler = PlaybackScheduler::new(24000, DEFAULT_START_LEAD, 0);
        assert_eq!(scheduler.lead_frames(), 1200);

        scheduler.schedule(&mut device, block(0, 2400)).unwrap();
        // Nothing arrives until well after the cursor was reached
        device.clock = 10_000;
        let scheduled = scheduler.schedule(&mut device, block(1, 2400)).unwrap();

        assert_eq!(scheduled.start, 11_200);
        assert_eq!(
            scheduled.starvation,
            Some(StarvationGap {
                behind_by: 10_000 - 2400
            })
        );
        assert_eq!(scheduler.cursor(), 11_200 + 2400);
    }

    #[test]
    fn completion_removes_handle_once() {
        let mut device = ManualDevice::new(16000);
        let mut scheduler = PlaybackScheduler::new(16000, DEFAULT_START_LEAD, 0);
        let scheduled = scheduler.schedule(&mut device, block(0, 1600)).unwrap();

        assert_eq!(scheduler.active_count(), 1);
        assert!(scheduler.complete(scheduled.handle));
        assert!(!scheduler.complete(scheduled.handle));
        assert!(scheduler.active().is_empty());
    }

    #[test]
    fn refused_block_leaves_cursor_alone() {
        let mut device = ManualDevice::new(16000);
        let mut scheduler = PlaybackScheduler::new(16000, DEFAULT_START_LEAD, 0);
        device.refuse = true;

        assert!(scheduler.schedule(&mut device, block(0, 1600)).is_err());
        assert_eq!(scheduler.cursor(), 0);
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn cancel_all_stops_every_handle() {
        let mut device = ManualDevice::new(16000);
        let mut scheduler = PlaybackScheduler::new(16000, DEFAULT_START_LEAD, 0);
        let a = scheduler.schedule(&mut device, block(0, 1600)).unwrap();
        let b = scheduler.schedule(&mut device, block(1, 1600)).unwrap();

        let cancelled = scheduler.cancel_all(&mut device);
        assert_eq!(cancelled, vec![a.handle, b.handle]);
        assert_eq!(device.stopped, vec![a.handle, b.handle]);
        assert!(device.scheduled.is_empty());
        assert!(scheduler.active().is_empty());
    }

    #[test]
    fn clock_moving_during_insert_still_resyncs() {
        let mut device = ManualDevice::new(24000);
        let mut scheduler = PlaybackScheduler::new(24000, DEFAULT_START_LEAD, 0);
        scheduler.schedule(&mut device, block(0, 2400)).unwrap();

        // Cursor is at 2400 and the clock reads 2000, but a period renders
        // before the block reaches the device
        device.clock = 2000;
        device.clock_on_start = Some(2480);
        let scheduled = scheduler.schedule(&mut device, block(1, 2400)).unwrap();

        assert_eq!(scheduled.start, 2480 + 1200);
        assert_eq!(scheduled.starvation, Some(StarvationGap { behind_by: 80 }));
        assert_eq!(device.scheduled[&scheduled.handle].0, 3680);
        assert_eq!(scheduler.cursor(), 3680 + 2400);
    }

    #[test]
    fn finished_blocks_are_reaped_without_completions() {
        let mut device = ManualDevice::new(16000);
        let mut scheduler = PlaybackScheduler::new(16000, DEFAULT_START_LEAD, 0);
        let a = scheduler.schedule(&mut device, block(0, 1600)).unwrap();
        scheduler.schedule(&mut device, block(1, 1600)).unwrap();

        device.clock = 1600;
        assert_eq!(scheduler.reap_finished(device.now()), vec![a.handle]);
        assert_eq!(scheduler.active_count(), 1);
        assert!(!scheduler.complete(a.handle));

        // Scheduling reaps too, so lost completions never accumulate
        for k in 2..20 {
            device.clock = scheduler.cursor();
            scheduler.schedule(&mut device, block(k, 1600)).unwrap();
            assert_eq!(scheduler.active_count(), 1);
        }
    }
}

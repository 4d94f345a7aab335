//! Software output timeline: scheduled sample runs at absolute frame
//! positions, rendered period by period into a device buffer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::codec::SampleBlock;
use super::scheduler::{HandleId, OutputDevice, Placement};
use crate::error::Result;

#[derive(Debug)]
struct Run {
    handle: HandleId,
    start: u64,
    samples: Vec<f32>,
}

impl Run {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

#[derive(Debug, Default)]
pub struct Timeline {
    position: u64,
    runs: Vec<Run>,
    /// A run that had already been rendered was cancelled; whatever the
    /// device still holds from it must be discarded.
    flush: bool,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames rendered so far; this is the output clock.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn pending(&self) -> usize {
        self.runs.len()
    }

    pub fn schedule(&mut self, handle: HandleId, start: u64, samples: Vec<f32>) {
        self.runs.push(Run {
            handle,
            start,
            samples,
        });
    }

    /// Schedule at `at`, or at `position + lead` if `at` is already behind
    /// the clock.
    pub fn place(&mut self, handle: HandleId, at: u64, lead: u64, samples: Vec<f32>) -> Placement {
        let placed = Placement::resolve(at, lead, self.position);
        self.schedule(handle, placed.start, samples);
        placed
    }

    /// Remove a run whether or not it has started. Returns false if unknown.
    pub fn cancel(&mut self, handle: HandleId) -> bool {
        let position = self.position;
        let mut started = false;
        let before = self.runs.len();
        self.runs.retain(|r| {
            if r.handle == handle {
                started |= r.start < position;
                false
            } else {
                true
            }
        });
        self.flush |= started;
        self.runs.len() != before
    }

    /// True once after a started run was cancelled. The render thread then
    /// drops any audio already queued on the hardware.
    pub fn take_flush(&mut self) -> bool {
        std::mem::take(&mut self.flush)
    }

    /// Mix every run overlapping the next `out.len()` frames into `out`,
    /// advance the clock, and return the handles that finished.
    ///
    /// Runs scheduled in the past are played from the current position;
    /// the part already behind the clock is skipped.
    pub fn render(&mut self, out: &mut [f32]) -> Vec<HandleId> {
        out.fill(0.0);
        let from = self.position;
        let to = from + out.len() as u64;

        for run in &self.runs {
            let begin = run.start.max(from);
            let end = run.end().min(to);
            if begin >= end {
                continue;
            }
            let src = (begin - run.start) as usize..(end - run.start) as usize;
            let dst = (begin - from) as usize;
            for (o, s) in out[dst..].iter_mut().zip(&run.samples[src]) {
                *o += *s;
            }
        }
        for o in out.iter_mut() {
            *o = o.clamp(-1.0, 1.0);
        }

        self.position = to;
        let mut finished = Vec::new();
        self.runs.retain(|r| {
            if r.end() <= to {
                finished.push(r.handle);
                false
            } else {
                true
            }
        });
        finished
    }
}

/// `OutputDevice` over a timeline shared with a render thread.
#[derive(Debug, Clone)]
pub struct TimelineOutput {
    timeline: Arc<Mutex<Timeline>>,
    sample_rate: u32,
}

impl TimelineOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            timeline: Arc::new(Mutex::new(Timeline::new())),
            sample_rate,
        }
    }

    pub fn shared(&self) -> Arc<Mutex<Timeline>> {
        self.timeline.clone()
    }

    pub fn lock(&self) -> MutexGuard<'_, Timeline> {
        lock_timeline(&self.timeline)
    }
}

/// A panicking render thread must not take the session down with it.
pub fn lock_timeline(timeline: &Mutex<Timeline>) -> MutexGuard<'_, Timeline> {
    timeline.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OutputDevice for TimelineOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn now(&self) -> u64 {
        self.lock().position()
    }

    fn start_at(
        &mut self,
        handle: HandleId,
        block: SampleBlock,
        at: u64,
        lead: u64,
    ) -> Result<Placement> {
        Ok(self.lock().place(handle, at, lead, block.into_samples()))
    }

    fn stop(&mut self, handle: HandleId) {
        self.lock().cancel(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(raw: u64) -> HandleId {
        HandleId::new(raw)
    }

    #[test]
    fn back_to_back_runs_render_without_gap() {
        let mut timeline = Timeline::new();
        timeline.schedule(h(0), 0, vec![0.5; 6]);
        timeline.schedule(h(1), 6, vec![0.25; 6]);

        let mut out = vec![9.0; 4];
        assert!(timeline.render(&mut out).is_empty());
        assert_eq!(out, vec![0.5; 4]);

        let finished = timeline.render(&mut out);
        assert_eq!(out, vec![0.5, 0.5, 0.25, 0.25]);
        assert_eq!(finished, vec![h(0)]);

        let finished = timeline.render(&mut out);
        assert_eq!(out, vec![0.25, 0.25, 0.25, 0.25]);
        assert_eq!(finished, vec![h(1)]);
        assert_eq!(timeline.position(), 12);
    }

    #[test]
    fn gap_before_start_is_silence() {
        let mut timeline = Timeline::new();
        timeline.schedule(h(0), 3, vec![1.0; 2]);

        let mut out = vec![0.0; 6];
        let finished = timeline.render(&mut out);
        assert_eq!(out, vec![0.0, 0.0, 0.0, 1.0, 1.0, 0.0]);
        assert_eq!(finished, vec![h(0)]);
    }

    #[test]
    fn cancelled_pending_run_never_sounds() {
        let mut timeline = Timeline::new();
        timeline.schedule(h(0), 0, vec![0.5; 4]);
        timeline.schedule(h(1), 4, vec![0.5; 4]);

        let mut out = vec![0.0; 2];
        timeline.render(&mut out);
        assert!(timeline.cancel(h(0)));
        assert!(timeline.cancel(h(1)));
        assert!(!timeline.cancel(h(1)));

        let mut out = vec![0.0; 8];
        let finished = timeline.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(finished.is_empty());
    }

    #[test]
    fn overlapping_runs_are_mixed_and_clamped() {
        let mut timeline = Timeline::new();
        timeline.schedule(h(0), 0, vec![0.75; 2]);
        timeline.schedule(h(1), 1, vec![0.75; 2]);

        let mut out = vec![0.0; 3];
        timeline.render(&mut out);
        assert_eq!(out, vec![0.75, 1.0, 0.75]);
    }

    #[test]
    fn output_device_follows_rendered_clock() {
        let mut output = TimelineOutput::new(24000);
        output
            .start_at(h(0), SampleBlock::new(vec![0.1; 10], 24000), 0, 5)
            .unwrap();
        assert_eq!(output.now(), 0);

        let mut out = vec![0.0; 10];
        let finished = output.lock().render(&mut out);
        assert_eq!(finished, vec![h(0)]);
        assert_eq!(output.now(), 10);

        output.stop(h(7));
        assert_eq!(output.lock().pending(), 0);
    }

    #[test]
    fn late_start_is_placed_after_the_clock() {
        let mut output = TimelineOutput::new(24000);
        let mut out = vec![0.0; 480];
        output.lock().render(&mut out);

        let placed = output
            .start_at(h(0), SampleBlock::new(vec![0.5; 100], 24000), 400, 120)
            .unwrap();
        assert_eq!(placed.start, 600);
        assert_eq!(placed.late_by, Some(80));

        // Nothing of the block is skipped
        let mut out = vec![0.0; 220];
        output.lock().render(&mut out);
        assert!(out[..120].iter().all(|&s| s == 0.0));
        assert!(out[120..].iter().all(|&s| s == 0.5));
    }

    #[test]
    fn cancelling_a_started_run_requests_flush() {
        let mut timeline = Timeline::new();
        timeline.schedule(h(0), 0, vec![0.5; 8]);
        timeline.schedule(h(1), 8, vec![0.5; 8]);

        let mut out = vec![0.0; 4];
        timeline.render(&mut out);

        // Not rendered yet: nothing on the hardware to discard
        assert!(timeline.cancel(h(1)));
        assert!(!timeline.take_flush());

        assert!(timeline.cancel(h(0)));
        assert!(timeline.take_flush());
        assert!(!timeline.take_flush());
    }
}

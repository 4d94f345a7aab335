//! One duplex connection's worth of audio state.
//!
//! A `Session` owns exactly one jitter buffer, playback cursor and active
//! handle set, plus its capture pipeline and output device. Nothing here is
//! shared: reconnecting means dropping the session and building a new one.

use bytes::Bytes;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::audio::capture::{CaptureOutcome, CapturePipeline, FrameSink};
use crate::audio::codec::SampleBlock;
use crate::audio::interrupt::{BargeInTrigger, InterruptReport, InterruptionController};
use crate::audio::jitter::{JitterBuffer, target_block_bytes};
use crate::audio::scheduler::{HandleId, OutputDevice, PlaybackScheduler, ScheduledBlock};
use crate::audio::system::AudioConfig;
use crate::config::Config;
use crate::error::Result;

/// Parameters negotiated once per session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub block_duration: Duration,
    pub start_lead: Duration,
    pub min_transcript_chars: usize,
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            min_transcript_chars: config.barge_in.min_transcript_chars,
            ..Self::from_audio(&config.audio)
        }
    }

    pub fn from_audio(audio: &AudioConfig) -> Self {
        Self {
            capture_sample_rate: audio.capture_sample_rate,
            playback_sample_rate: audio.playback_sample_rate,
            block_duration: Duration::from_millis(audio.block_duration_ms),
            start_lead: Duration::from_millis(audio.start_lead_ms),
            min_transcript_chars: crate::audio::interrupt::DEFAULT_MIN_TRANSCRIPT_CHARS,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_audio(&AudioConfig::default())
    }
}

pub struct Session<D: OutputDevice> {
    id: Uuid,
    chat_id: Option<String>,
    capture: CapturePipeline,
    jitter: JitterBuffer,
    scheduler: PlaybackScheduler,
    interrupts: InterruptionController,
    device: D,
    closed: bool,
}

impl<D: OutputDevice> Session<D> {
    pub fn new(id: Uuid, config: &SessionConfig, device: D) -> Self {
        let interrupts = InterruptionController::with_min_chars(config.min_transcript_chars);
        Self::with_interrupts(id, config, device, interrupts)
    }

    pub fn with_trigger(
        id: Uuid,
        config: &SessionConfig,
        device: D,
        trigger: Box<dyn BargeInTrigger>,
    ) -> Self {
        Self::with_interrupts(id, config, device, InterruptionController::new(trigger))
    }

    fn with_interrupts(
        id: Uuid,
        config: &SessionConfig,
        device: D,
        interrupts: InterruptionController,
    ) -> Self {
        if device.sample_rate() != config.playback_sample_rate {
            log::warn!(
                "Output device runs at {}Hz, inbound audio is {}Hz",
                device.sample_rate(),
                config.playback_sample_rate
            );
        }
        let block_bytes = target_block_bytes(config.playback_sample_rate, config.block_duration);
        let scheduler =
            PlaybackScheduler::new(config.playback_sample_rate, config.start_lead, device.now());

        log::info!(
            "Session {} opened: capture {}Hz, playback {}Hz, {} bytes per block",
            id,
            config.capture_sample_rate,
            config.playback_sample_rate,
            block_bytes
        );

        Self {
            id,
            chat_id: None,
            capture: CapturePipeline::new(config.capture_sample_rate),
            jitter: JitterBuffer::with_block_bytes(block_bytes),
            scheduler,
            interrupts,
            device,
            closed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.chat_id.as_deref()
    }

    pub fn set_chat_id(&mut self, chat_id: String) {
        log::info!("Session {} bound to chat {}", self.id, chat_id);
        self.chat_id = Some(chat_id);
    }

    /// Capture callback: encode and offer the block to the transport.
    ///
    /// Capture ticks steadily, so finished blocks whose completion was lost
    /// are forgotten here as well.
    pub fn on_captured<S: FrameSink + ?Sized>(
        &mut self,
        block: &SampleBlock,
        sink: &mut S,
    ) -> CaptureOutcome {
        self.scheduler.reap_finished(self.device.now());
        self.capture.process(block, sink)
    }

    /// Transport callback: queue inbound PCM and schedule every block it completes.
    ///
    /// A misaligned fragment is refused with `Alignment` and nothing else
    /// changes. A block the device refuses is logged and dropped.
    pub fn on_inbound_audio(&mut self, fragment: Bytes) -> Result<Vec<ScheduledBlock>> {
        self.jitter.push(fragment)?;

        let mut scheduled = Vec::new();
        while let Some(block) = self.jitter.pop_block() {
            let seq = block.seq;
            match self.scheduler.schedule(&mut self.device, block) {
                Ok(s) => scheduled.push(s),
                Err(e) => log::error!("Dropping playback block {}: {}", seq, e),
            }
        }
        Ok(scheduled)
    }

    /// Output callback: a block finished playing on its own.
    pub fn on_block_complete(&mut self, handle: HandleId) -> bool {
        self.scheduler.complete(handle)
    }

    /// Transcript callback: barge in if the trigger says the user is talking.
    pub fn on_transcript(&mut self, transcript: &str) -> Option<InterruptReport> {
        if self.interrupts.should_interrupt(transcript) {
            Some(self.interrupt())
        } else {
            None
        }
    }

    pub fn interrupt(&mut self) -> InterruptReport {
        self.interrupts
            .interrupt(&mut self.jitter, &mut self.scheduler, &mut self.device)
    }

    /// Stop all playback and drop queued audio. Safe to call more than once.
    pub fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let stopped = self.scheduler.cancel_all(&mut self.device);
        let discarded = self.jitter.clear();
        log::info!(
            "Session {} closed: {} frames sent, {} dropped, {} blocks stopped, {} bytes discarded",
            self.id,
            self.capture.frames_sent(),
            self.capture.frames_dropped(),
            stopped.len(),
            discarded
        );
    }

    pub fn queued_bytes(&self) -> usize {
        self.jitter.queued_bytes()
    }

    pub fn active_count(&self) -> usize {
        self.scheduler.active_count()
    }

    pub fn cursor(&self) -> u64 {
        self.scheduler.cursor()
    }

    pub fn interrupt_count(&self) -> u64 {
        self.interrupts.interrupt_count()
    }

    pub fn capture(&self) -> &CapturePipeline {
        &self.capture
    }

    pub fn subscribe_level(&self) -> watch::Receiver<f32> {
        self.capture.subscribe_level()
    }

    pub fn device(&self) -> &D {
        &self.device
    }
}

impl<D: OutputDevice> Drop for Session<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::scheduler::testing::ManualDevice;
    use crate::error::AudioError;

    fn config() -> SessionConfig {
        SessionConfig {
            capture_sample_rate: 16000,
            playback_sample_rate: 24000,
            block_duration: Duration::from_millis(100),
            start_lead: Duration::from_millis(50),
            min_transcript_chars: 2,
        }
    }

    #[test]
    fn inbound_audio_is_rechunked_and_scheduled() {
        let mut session = Session::new(Uuid::new_v4(), &config(), ManualDevice::new(24000));

        assert!(session.on_inbound_audio(Bytes::from(vec![0u8; 3000])).unwrap().is_empty());
        let scheduled = session.on_inbound_audio(Bytes::from(vec![0u8; 7000])).unwrap();

        // 10000 bytes at 4800 per block
        assert_eq!(scheduled.len(), 2);
        assert_eq!(scheduled[1].start, scheduled[0].start + 2400);
        assert_eq!(session.queued_bytes(), 400);
        assert_eq!(session.active_count(), 2);
    }

    #[test]
    fn misaligned_fragment_is_dropped_without_side_effects() {
        let mut session = Session::new(Uuid::new_v4(), &config(), ManualDevice::new(24000));
        session.on_inbound_audio(Bytes::from(vec![0u8; 100])).unwrap();

        let err = session.on_inbound_audio(Bytes::from(vec![0u8; 101])).unwrap_err();
        assert!(matches!(err, AudioError::Alignment { len: 101 }));
        assert_eq!(session.queued_bytes(), 100);
    }

    #[test]
    fn short_transcripts_do_not_barge_in() {
        let mut session = Session::new(Uuid::new_v4(), &config(), ManualDevice::new(24000));
        session.on_inbound_audio(Bytes::from(vec![0u8; 4800])).unwrap();

        assert!(session.on_transcript(" um ").is_none());
        assert_eq!(session.active_count(), 1);

        let report = session.on_transcript("hold on").unwrap();
        assert_eq!(report.stopped.len(), 1);
        assert_eq!(session.active_count(), 0);
        assert_eq!(session.interrupt_count(), 1);
    }

    #[test]
    fn custom_trigger_replaces_length_heuristic() {
        let mut session = Session::with_trigger(
            Uuid::new_v4(),
            &config(),
            ManualDevice::new(24000),
            Box::new(|_: &str| false),
        );
        session.on_inbound_audio(Bytes::from(vec![0u8; 4800])).unwrap();
        assert!(session.on_transcript("a very long interruption").is_none());
        assert_eq!(session.active_count(), 1);
    }

    #[test]
    fn teardown_stops_everything_once() {
        let mut session = Session::new(Uuid::new_v4(), &config(), ManualDevice::new(24000));
        session.on_inbound_audio(Bytes::from(vec![0u8; 5000])).unwrap();

        session.teardown();
        assert_eq!(session.active_count(), 0);
        assert_eq!(session.queued_bytes(), 0);
        assert_eq!(session.device().stopped.len(), 1);

        session.teardown();
        assert_eq!(session.device().stopped.len(), 1);
    }

    #[test]
    fn lost_completions_do_not_pin_handles() {
        let mut session = Session::new(Uuid::new_v4(), &config(), ManualDevice::new(24000));
        session.on_inbound_audio(Bytes::from(vec![0u8; 9600])).unwrap();
        assert_eq!(session.active_count(), 2);

        // Both blocks play out but no completion is ever delivered
        session.device.clock = 4800;
        let mut sink = Vec::new();
        session.on_captured(&SampleBlock::silence(160, 16000), &mut sink);
        assert_eq!(session.active_count(), 0);
    }

    impl FrameSink for Vec<crate::audio::codec::PcmFrame> {
        fn try_send_frame(
            &mut self,
            frame: crate::audio::codec::PcmFrame,
        ) -> std::result::Result<(), crate::audio::capture::SinkError> {
            self.push(frame);
            Ok(())
        }
    }

    #[test]
    fn chat_id_is_recorded() {
        let mut session = Session::new(Uuid::new_v4(), &config(), ManualDevice::new(24000));
        assert!(session.chat_id().is_none());
        session.set_chat_id("c-1".into());
        assert_eq!(session.chat_id(), Some("c-1"));
    }
}

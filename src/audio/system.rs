//! The AudioSystem that owns one session's capture and render threads.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O to avoid
//! contention with async network tasks. Threads talk to the controller only
//! through `DeviceEvent`s sent with `try_send`; they never wait on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use super::codec::SampleBlock;
use super::scheduler::{HandleId, OutputDevice, Placement};
use super::timeline::{Timeline, TimelineOutput, lock_timeline};
use crate::error::{AudioError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// ALSA capture and playback (feature `alsa-backend`)
    Alsa,
    /// Real-time paced clock with silent capture, no hardware
    Virtual,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "alsa-backend") {
            BackendKind::Alsa
        } else {
            BackendKind::Virtual
        }
    }
}

/// Audio system configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub backend: BackendKind,
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Rate of outbound PCM
    pub capture_sample_rate: u32,
    /// Rate of inbound PCM and of the output device
    pub playback_sample_rate: u32,
    /// Fixed at 1; kept so a mismatching config is rejected loudly
    pub channels: u16,
    /// Samples per captured block (one outbound frame each)
    pub capture_block_samples: usize,
    /// Frames mixed per render pass
    pub render_period_frames: usize,
    /// Playback block duration assembled by the jitter buffer
    pub block_duration_ms: u64,
    /// Headroom added after a starvation gap
    pub start_lead_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            capture_sample_rate: 16000,
            playback_sample_rate: 24000,
            channels: 1,
            capture_block_samples: 2048,
            render_period_frames: 480,
            block_duration_ms: 100,
            start_lead_ms: 50,
        }
    }
}

#[derive(Debug)]
pub enum DeviceEventKind {
    /// One capture block is ready
    Captured(SampleBlock),
    /// A scheduled block played to its end
    Completed(HandleId),
    /// A device thread gave up; the session should be torn down
    Fault(String),
}

impl DeviceEventKind {
    pub fn label(&self) -> &'static str {
        match self {
            DeviceEventKind::Captured(_) => "captured block",
            DeviceEventKind::Completed(_) => "completion",
            DeviceEventKind::Fault(_) => "fault",
        }
    }
}

/// Event from a device thread, tagged with the session that owns the device.
#[derive(Debug)]
pub struct DeviceEvent {
    pub session: Uuid,
    pub kind: DeviceEventKind,
}

/// Non-blocking delivery from device threads. Returns false once the
/// receiver is gone and the thread should exit.
#[derive(Debug, Clone)]
pub(crate) struct EventPort {
    session: Uuid,
    tx: mpsc::Sender<DeviceEvent>,
}

impl EventPort {
    pub(crate) fn new(session: Uuid, tx: mpsc::Sender<DeviceEvent>) -> Self {
        Self { session, tx }
    }

    pub(crate) fn send(&self, kind: DeviceEventKind) -> bool {
        match self.tx.try_send(DeviceEvent {
            session: self.session,
            kind,
        }) {
            Ok(()) => true,
            Err(TrySendError::Full(ev)) => {
                log::warn!("Device event queue full, dropping {}", ev.kind.label());
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub(crate) fn completed(&self, handles: Vec<HandleId>) -> bool {
        handles
            .into_iter()
            .all(|h| self.send(DeviceEventKind::Completed(h)))
    }
}

/// Accumulates device reads into fixed-size capture blocks.
pub(crate) struct BlockAccumulator {
    buf: Vec<f32>,
    block_samples: usize,
    sample_rate: u32,
}

impl BlockAccumulator {
    pub(crate) fn new(block_samples: usize, sample_rate: u32) -> Self {
        Self {
            buf: Vec::with_capacity(block_samples * 2),
            block_samples,
            sample_rate,
        }
    }

    /// Append samples and hand every complete block to `emit`.
    /// Stops early (returning false) if `emit` does.
    pub(crate) fn push(&mut self, samples: &[f32], mut emit: impl FnMut(SampleBlock) -> bool) -> bool {
        self.buf.extend_from_slice(samples);
        while self.buf.len() >= self.block_samples {
            let block: Vec<f32> = self.buf.drain(..self.block_samples).collect();
            if !emit(SampleBlock::new(block, self.sample_rate)) {
                return false;
            }
        }
        true
    }
}

/// The audio system manages capture and rendering in dedicated OS threads.
///
/// - Capture thread: device read → fixed-size `SampleBlock` → `DeviceEvent::Captured`
/// - Render thread: shared `Timeline` → device write → `DeviceEvent::Completed`
pub struct AudioSystem {
    running: Arc<AtomicBool>,
    record_handle: Option<JoinHandle<()>>,
    play_handle: Option<JoinHandle<()>>,
    output: TimelineOutput,
}

impl AudioSystem {
    /// Acquire both devices and start the threads.
    ///
    /// Fails with `DeviceUnavailable` before any thread is spawned if either
    /// device cannot be opened, so no partial session is left behind.
    pub fn start(
        config: &AudioConfig,
        session: Uuid,
        events: mpsc::Sender<DeviceEvent>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let output = TimelineOutput::new(config.playback_sample_rate);
        let port = EventPort::new(session, events);

        log::info!(
            "AudioSystem starting: backend: {:?}, capture: \"{}\" {}Hz, playback: \"{}\" {}Hz",
            config.backend,
            config.capture_device,
            config.capture_sample_rate,
            config.playback_device,
            config.playback_sample_rate,
        );

        let spawned = match config.backend {
            BackendKind::Virtual => spawn_virtual(config, port, output.shared(), &running),
            BackendKind::Alsa => spawn_alsa(config, port, output.shared(), &running),
        };
        let (record_handle, play_handle) = match spawned {
            Ok(pair) => pair,
            Err(e) => {
                // Release any thread that did get started
                running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        Ok(Self {
            running,
            record_handle: Some(record_handle),
            play_handle: Some(play_handle),
            output,
        })
    }

    /// Signal threads to stop and wait for them to finish.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in [self.record_handle.take(), self.play_handle.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                log::error!("Audio thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

impl Drop for AudioSystem {
    fn drop(&mut self) {
        self.stop();
    }
}

impl OutputDevice for AudioSystem {
    fn sample_rate(&self) -> u32 {
        self.output.sample_rate()
    }

    fn now(&self) -> u64 {
        self.output.now()
    }

    fn start_at(
        &mut self,
        handle: HandleId,
        block: SampleBlock,
        at: u64,
        lead: u64,
    ) -> Result<Placement> {
        if !self.is_running() {
            return Err(AudioError::Device("audio system stopped".into()));
        }
        self.output.start_at(handle, block, at, lead)
    }

    fn stop(&mut self, handle: HandleId) {
        OutputDevice::stop(&mut self.output, handle);
    }
}

type ThreadPair = (JoinHandle<()>, JoinHandle<()>);

#[cfg(feature = "alsa-backend")]
fn spawn_alsa(
    config: &AudioConfig,
    port: EventPort,
    timeline: Arc<Mutex<Timeline>>,
    running: &Arc<AtomicBool>,
) -> Result<ThreadPair> {
    super::alsa_device::spawn(config, port, timeline, running)
}

#[cfg(not(feature = "alsa-backend"))]
fn spawn_alsa(
    _config: &AudioConfig,
    _port: EventPort,
    _timeline: Arc<Mutex<Timeline>>,
    _running: &Arc<AtomicBool>,
) -> Result<ThreadPair> {
    Err(AudioError::DeviceUnavailable(
        "built without the alsa-backend feature".into(),
    ))
}

// ======================== Virtual backend ========================

fn spawn_virtual(
    config: &AudioConfig,
    port: EventPort,
    timeline: Arc<Mutex<Timeline>>,
    running: &Arc<AtomicBool>,
) -> Result<ThreadPair> {
    if config.capture_sample_rate == 0 || config.playback_sample_rate == 0 {
        return Err(AudioError::DeviceUnavailable(
            "virtual device needs non-zero sample rates".into(),
        ));
    }

    let record_handle = {
        let running = running.clone();
        let port = port.clone();
        let block_samples = config.capture_block_samples;
        let rate = config.capture_sample_rate;
        thread::Builder::new()
            .name("audio-record".into())
            .spawn(move || virtual_record_thread(block_samples, rate, port, &running))
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
    };

    let play_handle = {
        let running = running.clone();
        let period = config.render_period_frames;
        let rate = config.playback_sample_rate;
        thread::Builder::new()
            .name("audio-play".into())
            .spawn(move || virtual_play_thread(period, rate, timeline, port, &running))
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
    };

    Ok((record_handle, play_handle))
}

fn period_duration(frames: usize, rate: u32) -> Duration {
    Duration::from_secs_f64(frames as f64 / f64::from(rate))
}

/// Sleep in short slices so `running` is honoured promptly.
fn pace_until(deadline: Instant, running: &AtomicBool) {
    const SLICE: Duration = Duration::from_millis(10);
    while running.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep((deadline - now).min(SLICE));
    }
}

/// Frames per simulated device read.
const VIRTUAL_READ_FRAMES: usize = 160;

fn virtual_record_thread(block_samples: usize, rate: u32, port: EventPort, running: &AtomicBool) {
    let period = period_duration(VIRTUAL_READ_FRAMES, rate);
    let silence = [0.0f32; VIRTUAL_READ_FRAMES];
    let mut accum = BlockAccumulator::new(block_samples, rate);
    let mut deadline = Instant::now() + period;
    log::info!("Virtual capture started: rate={}, block={}", rate, block_samples);

    while running.load(Ordering::Relaxed) {
        pace_until(deadline, running);
        if !running.load(Ordering::Relaxed) {
            break;
        }
        deadline += period;
        if !accum.push(&silence, |block| port.send(DeviceEventKind::Captured(block))) {
            break;
        }
    }
    log::info!("Virtual capture stopped");
}

fn virtual_play_thread(
    period_frames: usize,
    rate: u32,
    timeline: Arc<Mutex<Timeline>>,
    port: EventPort,
    running: &AtomicBool,
) {
    let period = period_duration(period_frames, rate);
    let mut buf = vec![0.0f32; period_frames];
    let mut deadline = Instant::now();
    log::info!("Virtual playback started: rate={}, period={}", rate, period_frames);

    while running.load(Ordering::Relaxed) {
        let finished = {
            let mut timeline = lock_timeline(&timeline);
            // No hardware queue to discard
            timeline.take_flush();
            timeline.render(&mut buf)
        };
        if !port.completed(finished) {
            break;
        }
        deadline += period;
        pace_until(deadline, running);
    }
    log::info!("Virtual playback stopped");
}

//! ALSA PCM devices for one session: float capture and S16LE playback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};

use super::codec::sample_to_i16;
use super::system::{AudioConfig, BlockAccumulator, DeviceEventKind, EventPort};
use super::timeline::{Timeline, lock_timeline};
use crate::error::{AudioError, Result};

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
    /// Ring buffer size in frames
    pub buffer_size: usize,
}

/// Consecutive failed writes tolerated before the rest of a period is dropped.
const MAX_WRITE_RETRIES: u32 = 3;

/// Playback ring size in periods. The render clock runs ahead of what is
/// audible by at most this much.
const PLAYBACK_BUFFER_PERIODS: usize = 3;

/// Open both devices, then start capture and render threads.
///
/// Both devices are acquired before any thread exists.
pub(crate) fn spawn(
    config: &AudioConfig,
    port: EventPort,
    timeline: Arc<Mutex<Timeline>>,
    running: &Arc<AtomicBool>,
) -> Result<(thread::JoinHandle<()>, thread::JoinHandle<()>)> {
    let (capture, capture_params) = open_checked(
        &config.capture_device,
        Direction::Capture,
        Format::FloatLE,
        config.capture_sample_rate,
        None,
    )?;
    let (playback, playback_params) = open_checked(
        &config.playback_device,
        Direction::Playback,
        Format::S16LE,
        config.playback_sample_rate,
        Some(config.render_period_frames),
    )?;

    let record_handle = {
        let running = running.clone();
        let port = port.clone();
        let block_samples = config.capture_block_samples;
        thread::Builder::new()
            .name("audio-record".into())
            .spawn(move || {
                if let Err(e) = record_thread(&capture, &capture_params, block_samples, &port, &running) {
                    log::error!("Recording thread error: {}", e);
                    port.send(DeviceEventKind::Fault(format!("capture: {}", e)));
                }
            })
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
    };

    let play_handle = {
        let running = running.clone();
        thread::Builder::new()
            .name("audio-play".into())
            .spawn(move || {
                if let Err(e) = play_thread(&playback, &playback_params, &timeline, &port, &running) {
                    log::error!("Playback thread error: {}", e);
                    port.send(DeviceEventKind::Fault(format!("playback: {}", e)));
                }
            })
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?
    };

    Ok((record_handle, play_handle))
}

/// Open a mono device and insist the hardware accepted the session's rate.
fn open_checked(
    device: &str,
    direction: Direction,
    format: Format,
    sample_rate: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    let dir_name = match direction {
        Direction::Capture => "Capture",
        Direction::Playback => "Playback",
    };
    let (pcm, params) = open_pcm(device, direction, format, sample_rate, period_size).map_err(|e| {
        AudioError::DeviceUnavailable(format!("{} device '{}': {}", dir_name, device, e))
    })?;

    if params.sample_rate != sample_rate || params.channels != 1 {
        return Err(AudioError::DeviceUnavailable(format!(
            "{} device '{}' negotiated {}Hz/{}ch, session needs {}Hz mono",
            dir_name, device, params.sample_rate, params.channels, sample_rate
        )));
    }

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}, buffer_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
        params.buffer_size,
    );
    Ok((pcm, params))
}

fn open_pcm(
    device: &str,
    direction: Direction,
    format: Format,
    sample_rate: u32,
    period_size: Option<usize>,
) -> std::result::Result<(PCM, AlsaParams), alsa::Error> {
    let pcm = PCM::new(device, direction, false)?;

    {
        let hwp = HwParams::any(&pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(format)?;
        hwp.set_channels(1)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            let ps = hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
            hwp.set_buffer_size_near(ps * PLAYBACK_BUFFER_PERIODS as alsa::pcm::Frames)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
            buffer_size: hwp.get_buffer_size()? as usize,
        }
    };

    Ok((pcm, params))
}

// ======================== Recording thread ========================

fn record_thread(
    pcm: &PCM,
    params: &AlsaParams,
    block_samples: usize,
    port: &EventPort,
    running: &AtomicBool,
) -> std::result::Result<(), alsa::Error> {
    let io = pcm.io_f32()?;
    let mut read_buf = vec![0f32; params.period_size.max(1)];
    let mut accum = BlockAccumulator::new(block_samples, params.sample_rate);

    log::info!(
        "Recording started: rate={}, period={}, block={}",
        params.sample_rate,
        params.period_size,
        block_samples,
    );

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                let delivered = accum.push(&read_buf[..frames], |block| {
                    port.send(DeviceEventKind::Captured(block))
                });
                if !delivered {
                    log::warn!("Capture receiver dropped");
                    break;
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                pcm.prepare()?;
            }
        }
    }

    log::info!("Recording stopped");
    Ok(())
}

// ======================== Playback thread ========================

fn play_thread(
    pcm: &PCM,
    params: &AlsaParams,
    timeline: &Mutex<Timeline>,
    port: &EventPort,
    running: &AtomicBool,
) -> std::result::Result<(), alsa::Error> {
    let io = pcm.io_i16()?;
    let period = params.period_size.max(1);
    let mut mix = vec![0f32; period];
    let mut out = vec![0i16; period];

    log::info!(
        "Playback started: rate={}, period={}",
        params.sample_rate,
        period,
    );

    while running.load(Ordering::Relaxed) {
        // Lock only while mixing, never across the blocking write
        let (flush, finished) = {
            let mut timeline = lock_timeline(timeline);
            (timeline.take_flush(), timeline.render(&mut mix))
        };
        if flush {
            // Cancelled audio may still sit in the ring; discard it now
            pcm.drop()?;
            pcm.prepare()?;
        }
        for (o, s) in out.iter_mut().zip(&mix) {
            *o = sample_to_i16(*s);
        }

        // Retry short writes and XRUNs without losing frames
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < period {
            match io.writei(&out[frames_written..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    pcm.prepare()?;
                    if retry_count >= MAX_WRITE_RETRIES {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            period - frames_written
                        );
                        break;
                    }
                }
            }
        }

        if !port.completed(finished) {
            break;
        }
    }

    log::info!("Playback stopped");
    Ok(())
}

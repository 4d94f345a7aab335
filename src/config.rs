use anyhow::{Context, bail};
use serde::Deserialize;
use std::path::Path;

use crate::audio::system::AudioConfig;

/// Looked up in the working directory; optional.
pub const DEFAULT_CONFIG_FILE: &str = "voice_client.toml";

/// Prefix for overrides, e.g. `VOICE_CLIENT__AUDIO__PLAYBACK_SAMPLE_RATE=16000`.
pub const ENV_PREFIX: &str = "VOICE_CLIENT";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub barge_in: BargeInConfig,
    pub queues: QueueConfig,
}

/// Where to connect and which server-side options to request.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    pub voice: Option<String>,
    pub assistant_lang: Option<String>,
    /// Server VAD endpointing sensitivity: HIGH, MEDIUM or LOW
    pub endpointing: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/ws".to_string(),
            voice: None,
            assistant_lang: None,
            endpointing: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BargeInConfig {
    /// Barge in once a trimmed user transcript is longer than this
    pub min_transcript_chars: usize,
}

impl Default for BargeInConfig {
    fn default() -> Self {
        Self {
            min_transcript_chars: crate::audio::interrupt::DEFAULT_MIN_TRANSCRIPT_CHARS,
        }
    }
}

/// Capacities of the bounded queues between tasks and threads.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub net_events: usize,
    pub net_commands: usize,
    pub device_events: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            net_events: 100,
            net_commands: 100,
            device_events: 100,
        }
    }
}

impl Config {
    /// Defaults, then `voice_client.toml` if present, then environment.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(Some(Path::new(DEFAULT_CONFIG_FILE)))
    }

    pub fn load_from(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let audio = &self.audio;
        if audio.channels != 1 {
            bail!("audio.channels must be 1 (mono), got {}", audio.channels);
        }
        if audio.capture_sample_rate == 0 || audio.playback_sample_rate == 0 {
            bail!("audio sample rates must be non-zero");
        }
        if audio.capture_block_samples == 0 || audio.render_period_frames == 0 {
            bail!("audio block and period sizes must be non-zero");
        }
        if audio.block_duration_ms == 0 {
            bail!("audio.block_duration_ms must be non-zero");
        }
        let queues = &self.queues;
        if queues.net_events == 0 || queues.net_commands == 0 || queues.device_events == 0 {
            bail!("queue capacities must be non-zero");
        }
        url::Url::parse(&self.server.url)
            .with_context(|| format!("server.url '{}' is not a valid URL", self.server.url))?;
        Ok(())
    }
}

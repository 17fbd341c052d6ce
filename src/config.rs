use anyhow::Result;
use serde::Deserialize;

use crate::audio::{AudioFormat, SampleFormat};
use crate::session::{SessionConfig, TransferConfig};

/// Prefix for environment overrides, e.g. `LOQA_ROOMS__SERVER__HOST`
pub const ENV_PREFIX: &str = "LOQA_ROOMS";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub session: SessionConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Service identity shared by the chat and audio channels
    pub service: String,
}

impl ServerConfig {
    pub fn url(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_size: usize,
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_format: SampleFormat::I16,
            channels: self.channels,
            sample_rate: self.sample_rate,
            frame_size: self.frame_size,
        }
    }
}

impl Config {
    /// Built-in defaults overlaid with `LOQA_ROOMS__*` environment variables
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .set_default("server.host", "localhost")?
            .set_default("server.port", 4222)?
            .set_default("server.service", "chat")?
            .set_default("audio.sample_rate", 44100)?
            .set_default("audio.channels", 1)?
            .set_default("audio.frame_size", 1024)?
            .set_default("session.max_join_attempts", 5)?
            .set_default("session.receiver_join_timeout_ms", 1000)?
            .set_default("session.outbound_grace_ms", 1000)?
            .set_default("transfer.download_dir", "~/Downloads/loqa-rooms")?
            .set_default("transfer.chunk_size", 65536)?
            .set_default("transfer.answer_timeout_ms", 65000)?
            .set_default("transfer.max_pending_offers", 10)?
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

/*
 * Whisper Bridge - Rust Edition
 * Copyright (c) 2025 Whisper Bridge Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use anyhow::{Context, Result};
use dirs::home_dir;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Process-level configuration for either side of the bridge. These are
/// deployment knobs; the shared per-session settings live in the
/// rendezvous (`settings/settings.json`).
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared rendezvous root containing audio/, transcripts/, control/,
    /// settings/.
    pub bridge_dir: PathBuf,
    /// Quantized Whisper model file.
    pub model_path: PathBuf,
    pub use_gpu: bool,
    /// Producer chunking granularity.
    pub chunk_size_ms: u64,
    /// How long the producer waits for a final transcript after end().
    pub transcription_timeout: Duration,
    /// Producer-side rendezvous poll cadence.
    pub producer_poll_interval: Duration,
    /// Consumer-side rendezvous poll cadence.
    pub consumer_poll_interval: Duration,
    pub status_interval: Duration,
    pub reaper_interval: Duration,
    /// Consumer cancels the session and pauses ingest past this RSS.
    /// 0 disables the check.
    pub memory_limit_mb: u64,
    pub log_dir: PathBuf,
}

fn app_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".whisper-bridge")
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        dotenv::dotenv().ok();

        let bridge_dir = env::var("BRIDGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| app_dir().join("bridge"));

        let model_path = env::var("MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| app_dir().join("models").join("ggml-base.en-q5_1.bin"));

        let use_gpu = env::var("USE_GPU")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let chunk_size_ms = env::var("CHUNK_SIZE_MS")
            .unwrap_or_else(|_| "200".to_string())
            .parse::<u64>()
            .unwrap_or(200);

        let transcription_timeout_ms = env::var("TRANSCRIPTION_TIMEOUT_MS")
            .unwrap_or_else(|_| "10000".to_string())
            .parse::<u64>()
            .unwrap_or(10_000);

        let memory_limit_mb = env::var("MEMORY_LIMIT_MB")
            .unwrap_or_else(|_| "2048".to_string())
            .parse::<u64>()
            .unwrap_or(2048);

        let log_dir = env::var("LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| app_dir().join("logs"));

        if let Some(parent) = bridge_dir.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create bridge parent directory")?;
        }

        Ok(Config {
            bridge_dir,
            model_path,
            use_gpu,
            chunk_size_ms,
            transcription_timeout: Duration::from_millis(transcription_timeout_ms),
            producer_poll_interval: Duration::from_millis(100),
            consumer_poll_interval: Duration::from_millis(50),
            status_interval: Duration::from_secs(1),
            reaper_interval: Duration::from_secs(60),
            memory_limit_mb,
            log_dir,
        })
    }

    /// Configuration rooted at an explicit directory, with the default
    /// cadences. Used by tests and by tooling that manages its own
    /// paths.
    pub fn rooted_at(bridge_dir: impl Into<PathBuf>) -> Self {
        let bridge_dir = bridge_dir.into();
        let log_dir = bridge_dir.join("logs");
        Config {
            bridge_dir,
            model_path: PathBuf::new(),
            use_gpu: false,
            chunk_size_ms: 200,
            transcription_timeout: Duration::from_secs(10),
            producer_poll_interval: Duration::from_millis(100),
            consumer_poll_interval: Duration::from_millis(50),
            status_interval: Duration::from_secs(1),
            reaper_interval: Duration::from_secs(60),
            memory_limit_mb: 0,
            log_dir,
        }
    }
}

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
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use whisper_bridge_rs::audio::{AudioSource, WavFileSource};
use whisper_bridge_rs::config::Config;
use whisper_bridge_rs::consumer::{self, Consumer};
use whisper_bridge_rs::inference::SpeechEngine;
use whisper_bridge_rs::messages::{self, SessionSettings, StatusRecord, STATUS_FILE};
use whisper_bridge_rs::producer::ProducerSession;
use whisper_bridge_rs::reaper;
use whisper_bridge_rs::rendezvous::{RendezvousStore, Subdir};
use whisper_bridge_rs::types::{ProducerEvent, PunctuationMode};
use whisper_bridge_rs::ui::{TerminalUI, TextSink};

/// Whisper Bridge - streaming on-device dictation across two processes
#[derive(Parser)]
#[command(name = "whisper-bridge")]
#[command(version = "0.1.0")]
#[command(about = "On-device streaming speech-to-text over a filesystem rendezvous")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the model host: load the model and serve transcription sessions
    Serve,

    /// Stream a 16 kHz mono WAV file through the bridge as one utterance
    Capture {
        /// Path to the WAV file
        file: PathBuf,

        /// 2-char language code (default: auto-detect)
        #[arg(long)]
        language: Option<String>,

        /// Punctuation mode: auto, none, or sentence
        #[arg(long, default_value = "auto")]
        punctuation: String,

        /// Do not publish partial transcripts
        #[arg(long)]
        no_streaming: bool,
    },

    /// Show the consumer's latest status record
    Status,

    /// Run the orphan sweep once and exit
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;
    setup_logging(&config)?;

    match cli.command {
        Commands::Serve => run_serve(config).await,
        Commands::Capture {
            file,
            language,
            punctuation,
            no_streaming,
        } => run_capture(config, file, language, punctuation, no_streaming).await,
        Commands::Status => run_status(config),
        Commands::Clean => run_clean(config),
    }
}

fn setup_logging(config: &Config) -> Result<()> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, "whisper-bridge.log");

    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive("whisper_bridge_rs=debug".parse()?)
                        .add_directive("debug".parse()?),
                ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(false)
                .compact()
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive("whisper_bridge_rs=error".parse()?)
                        .add_directive("error".parse()?),
                ),
        );

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;
    Ok(())
}

fn load_engine(config: &Config) -> Result<Box<dyn SpeechEngine + Send>> {
    #[cfg(feature = "whisper")]
    {
        use whisper_bridge_rs::inference::WhisperEngine;
        whisper_bridge_rs::system::check_model_file(&config.model_path)?;
        let engine = WhisperEngine::load(&config.model_path, config.use_gpu)?;
        return Ok(Box::new(engine));
    }

    #[cfg(not(feature = "whisper"))]
    {
        let _ = config;
        tracing::warn!("Built without the whisper feature; serving a scripted stub engine");
        Ok(Box::new(whisper_bridge_rs::inference::ScriptedEngine::new(
            Vec::<String>::new(),
        )))
    }
}

async fn run_serve(config: Config) -> Result<()> {
    let ui = TerminalUI::new();
    let store = RendezvousStore::open(&config.bridge_dir)
        .with_context(|| format!("Failed to open rendezvous at {}", config.bridge_dir.display()))?;

    let engine = match load_engine(&config) {
        Ok(engine) => engine,
        Err(e) => {
            consumer::publish_model_load_failure(&store, &e.to_string());
            ui.print_error(&format!("Model load failed: {e}"));
            return Err(e);
        }
    };

    ui.print_status(&format!(
        "Serving transcription sessions over {}",
        config.bridge_dir.display()
    ));

    let cancel = CancellationToken::new();
    let consumer = Consumer::start(&config, store, engine, cancel.clone()).await?;
    ui.print_status("Model warm; press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    ui.print_status("Shutting down");
    cancel.cancel();
    consumer.join().await;
    Ok(())
}

async fn run_capture(
    config: Config,
    file: PathBuf,
    language: Option<String>,
    punctuation: String,
    no_streaming: bool,
) -> Result<()> {
    let ui = TerminalUI::new();
    let store = RendezvousStore::open(&config.bridge_dir)
        .with_context(|| format!("Failed to open rendezvous at {}", config.bridge_dir.display()))?;

    let punctuation = match punctuation.as_str() {
        "auto" => PunctuationMode::Auto,
        "none" => PunctuationMode::None,
        "sentence" => PunctuationMode::Sentence,
        other => anyhow::bail!("unknown punctuation mode '{other}'"),
    };
    let settings = SessionSettings {
        punctuation,
        language,
        streaming_enabled: !no_streaming,
        chunk_size_ms: config.chunk_size_ms,
        ..SessionSettings::default()
    };

    let mut source = WavFileSource::open(&file, config.chunk_size_ms)?;
    ui.print_status(&format!(
        "Streaming {} ({:.1}s) through the bridge",
        file.display(),
        source.total_duration_secs()
    ));

    let (mut session, mut events) = ProducerSession::new(store, &config);
    session.publish_settings(&settings)?;

    if !session.consumer_available() {
        ui.print_warning("No fresh consumer status; is `whisper-bridge serve` running?");
    }

    let session_id = session.begin().await?;
    tracing::info!("Capturing into session {}", session_id);

    let max_duration = settings.max_session_secs as f64;
    let mut sent = 0.0f64;
    let chunk_pause = std::time::Duration::from_millis(config.chunk_size_ms);

    let mut pending = source.next_block()?;
    while let Some(block) = pending {
        pending = source.next_block()?;
        let is_last = pending.is_none() || sent + block.duration_secs >= max_duration;
        sent += block.duration_secs;
        session.submit_chunk(&block, is_last).await?;
        if is_last {
            if pending.is_some() {
                ui.print_warning(&format!(
                    "Input exceeds the {max_duration:.0}s session cap; truncating"
                ));
            }
            break;
        }
        // Pace like a live microphone, and back off when the consumer
        // reports drops.
        sleep(chunk_pause).await;
        if session.should_throttle() {
            tracing::debug!("Consumer is dropping chunks; throttling");
            sleep(chunk_pause).await;
        }
    }
    session.end().await?;

    while let Some(event) = events.recv().await {
        match event {
            ProducerEvent::Partial { text } => ui.print_partial(&text),
            ProducerEvent::Final {
                text,
                processing_time_ms,
            } => {
                ui.print_final(&text);
                ui.print_status(&format!("Transcribed in {processing_time_ms}ms"));
                ui.insert(&text).await?;
                break;
            }
            ProducerEvent::Error { kind, description } => {
                ui.print_error(&format!("{kind}: {description}"));
                session.acknowledge_failure().await;
                break;
            }
            ProducerEvent::TimedOut => {
                ui.print_error("Timed out waiting for a transcript — try again");
                session.acknowledge_failure().await;
                break;
            }
        }
    }
    Ok(())
}

fn run_status(config: Config) -> Result<()> {
    let store = RendezvousStore::open(&config.bridge_dir)?;
    let bytes = match store.read(Subdir::Control, STATUS_FILE) {
        Ok(bytes) => bytes,
        Err(_) => {
            println!("{}", "No status record; consumer has never run here".yellow());
            return Ok(());
        }
    };
    let record: StatusRecord = messages::decode(&bytes)
        .map_err(|e| anyhow::anyhow!("status record unreadable: {e}"))?;

    let fresh = record.is_fresh(Utc::now(), 3);
    let health = if fresh {
        "online".green()
    } else {
        "stale (consumer unavailable)".red()
    };
    println!("Consumer:        {health}");
    println!("Model:           {} (loaded: {})", record.model_variant, record.model_loaded);
    println!("Processing:      {}", record.processing);
    println!(
        "Session:         {}",
        record.current_session.as_deref().unwrap_or("-")
    );
    println!("Memory:          {} MB", record.memory_mb);
    println!("Dropped chunks:  {}", record.dropped_chunks);
    println!("Last update:     {}", record.last_update.to_rfc3339());
    Ok(())
}

fn run_clean(config: Config) -> Result<()> {
    let store = RendezvousStore::open(&config.bridge_dir)?;
    let removed = reaper::startup_sweep(&store)?;
    println!("Removed {removed} stale rendezvous entries");
    Ok(())
}

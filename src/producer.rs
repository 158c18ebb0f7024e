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
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{silence_block, AudioBlock};
use crate::config::Config;
use crate::messages::{
    self, chunk_meta_name, chunk_pcm_name, ChunkMetadata, ControlSignal, ErrorRecord,
    FinalTranscript, PartialTranscript, SessionSettings, StatusRecord, CHANNELS, CONTROL_FILE,
    ERROR_FILE, FINAL_FILE, PARTIAL_PREFIX, SAMPLE_RATE, SETTINGS_FILE, STATUS_FILE,
};
use crate::rendezvous::{RendezvousError, RendezvousStore, Subdir};
use crate::types::{ControlKind, ProducerEvent, ProducerState};

/// Seconds after which a status record no longer counts as a live
/// consumer.
const STATUS_FRESH_SECS: i64 = 3;

#[derive(Debug)]
struct Shared {
    state: ProducerState,
    session_id: Option<String>,
    deadline: Option<Instant>,
    last_final_mtime: Option<SystemTime>,
    last_final_timestamp: Option<DateTime<Utc>>,
}

/// Capture-side session driver: numbers and publishes chunks, sends
/// control signals, and surfaces partial/final/error/timeout events from
/// a background poller.
pub struct ProducerSession {
    store: RendezvousStore,
    shared: Arc<RwLock<Shared>>,
    next_chunk_id: u64,
    last_sent: bool,
    drops_baseline: u64,
    timeout: Duration,
    cancel: CancellationToken,
}

impl ProducerSession {
    pub fn new(
        store: RendezvousStore,
        config: &Config,
    ) -> (Self, mpsc::UnboundedReceiver<ProducerEvent>) {
        let shared = Arc::new(RwLock::new(Shared {
            state: ProducerState::Idle,
            session_id: None,
            deadline: None,
            // A final left over from before this process started must
            // not be delivered as if it were ours.
            last_final_mtime: store.mtime(Subdir::Transcripts, FINAL_FILE).unwrap_or(None),
            last_final_timestamp: None,
        }));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        spawn_poller(
            store.clone(),
            shared.clone(),
            event_tx,
            config.producer_poll_interval,
            cancel.clone(),
        );

        (
            Self {
                store,
                shared,
                next_chunk_id: 0,
                last_sent: false,
                drops_baseline: 0,
                timeout: config.transcription_timeout,
                cancel,
            },
            event_rx,
        )
    }

    pub async fn state(&self) -> ProducerState {
        self.shared.read().await.state
    }

    pub async fn session_id(&self) -> Option<String> {
        self.shared.read().await.session_id.clone()
    }

    /// Publish a control signal. The channel is a single name, so a
    /// still-unconsumed signal would be lost by an immediate overwrite;
    /// wait for the consumer to take it first. `cancel` is the
    /// exception: it supersedes whatever is pending.
    async fn send_control(&self, kind: ControlKind, session_id: &str) -> Result<()> {
        if kind != ControlKind::Cancel {
            for _ in 0..50 {
                if !self.store.exists(Subdir::Control, CONTROL_FILE)? {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
        let signal = ControlSignal::new(kind, session_id);
        let bytes = messages::encode(&signal)?;
        self.store
            .write_atomic(Subdir::Control, CONTROL_FILE, &bytes)
            .with_context(|| format!("Failed to publish {kind} signal"))?;
        Ok(())
    }

    fn read_status(&self) -> Option<StatusRecord> {
        let bytes = self.store.read(Subdir::Control, STATUS_FILE).ok()?;
        messages::decode::<StatusRecord>(&bytes).ok()
    }

    /// Mint a new session and announce it. An unfinished session is
    /// superseded: it gets cancelled first.
    pub async fn begin(&mut self) -> Result<String> {
        {
            let shared = self.shared.read().await;
            if matches!(
                shared.state,
                ProducerState::Recording | ProducerState::AwaitingFinal
            ) {
                drop(shared);
                self.abort().await?;
            }
        }

        let session_id = Uuid::new_v4().to_string();
        self.next_chunk_id = 0;
        self.last_sent = false;
        self.drops_baseline = self.read_status().map(|s| s.dropped_chunks).unwrap_or(0);

        self.send_control(ControlKind::Start, &session_id).await?;

        let mut shared = self.shared.write().await;
        shared.state = ProducerState::Recording;
        shared.session_id = Some(session_id.clone());
        shared.deadline = None;

        tracing::info!("Producer session {} started", session_id);
        Ok(session_id)
    }

    /// Publish one chunk: PCM first, metadata second, so a consumer that
    /// sees the metadata is guaranteed to find the samples.
    pub async fn submit_chunk(&mut self, block: &AudioBlock, is_last: bool) -> Result<()> {
        let session_id = {
            let shared = self.shared.read().await;
            if shared.state != ProducerState::Recording {
                anyhow::bail!("cannot submit a chunk while {}", shared.state);
            }
            shared
                .session_id
                .clone()
                .context("recording without a session id")?
        };

        let chunk_id = self.next_chunk_id;
        let pcm_name = chunk_pcm_name(&session_id, chunk_id);
        let meta = ChunkMetadata {
            session_id: session_id.clone(),
            chunk_id,
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            format: block.format,
            duration_secs: block.duration_secs,
            timestamp: Utc::now(),
            is_last_chunk: is_last,
            pcm_filename: pcm_name.clone(),
        };
        meta.validate(Utc::now())
            .map_err(|e| anyhow::anyhow!("refusing to publish invalid chunk: {e}"))?;
        meta.check_pcm_len(block.bytes.len())
            .map_err(|e| anyhow::anyhow!("refusing to publish invalid chunk: {e}"))?;

        self.store
            .write_atomic(Subdir::Audio, &pcm_name, &block.bytes)?;
        self.store.write_atomic(
            Subdir::Audio,
            &chunk_meta_name(&session_id, chunk_id),
            &messages::encode(&meta)?,
        )?;

        self.next_chunk_id += 1;
        if is_last {
            self.last_sent = true;
        }
        tracing::debug!(
            "Published chunk {} ({:.2}s, last: {})",
            chunk_id,
            block.duration_secs,
            is_last
        );
        Ok(())
    }

    /// Finish the utterance: flag the last chunk if none was flagged,
    /// send `stop`, and start the final-transcript timer.
    pub async fn end(&mut self) -> Result<()> {
        let session_id = {
            let shared = self.shared.read().await;
            if shared.state != ProducerState::Recording {
                anyhow::bail!("cannot end a session while {}", shared.state);
            }
            shared
                .session_id
                .clone()
                .context("recording without a session id")?
        };

        if !self.last_sent {
            // Without an is_last chunk the consumer never finalizes;
            // flush with a short run of silence.
            let flush = silence_block(0.1);
            self.submit_chunk(&flush, true).await?;
        }
        self.send_control(ControlKind::Stop, &session_id).await?;

        let mut shared = self.shared.write().await;
        shared.state = ProducerState::AwaitingFinal;
        shared.deadline = Some(Instant::now() + self.timeout);
        tracing::info!("Producer session {} awaiting final", session_id);
        Ok(())
    }

    /// Cancel the in-flight session. Calling this twice is a no-op the
    /// second time.
    pub async fn abort(&mut self) -> Result<()> {
        let session_id = {
            let shared = self.shared.read().await;
            match shared.session_id.clone() {
                Some(id) => id,
                None => return Ok(()),
            }
        };
        self.send_control(ControlKind::Cancel, &session_id).await?;

        let mut shared = self.shared.write().await;
        shared.state = ProducerState::Idle;
        shared.session_id = None;
        shared.deadline = None;
        tracing::info!("Producer session {} aborted", session_id);
        Ok(())
    }

    /// Return to Idle after the UI has shown a failure.
    pub async fn acknowledge_failure(&mut self) {
        let mut shared = self.shared.write().await;
        if shared.state == ProducerState::Failed {
            shared.state = ProducerState::Idle;
            shared.session_id = None;
            shared.deadline = None;
        }
    }

    /// Whether the capture loop should slow down: the consumer is alive
    /// and has started dropping chunks this session.
    pub fn should_throttle(&self) -> bool {
        match self.read_status() {
            Some(status) => {
                status.is_fresh(Utc::now(), STATUS_FRESH_SECS)
                    && status.dropped_chunks > self.drops_baseline
            }
            None => false,
        }
    }

    /// Whether a fresh consumer status record exists at all.
    pub fn consumer_available(&self) -> bool {
        self.read_status()
            .map(|s| s.is_fresh(Utc::now(), STATUS_FRESH_SECS))
            .unwrap_or(false)
    }

    /// Publish shared session settings for the consumer to pick up.
    pub fn publish_settings(&self, settings: &SessionSettings) -> Result<()> {
        settings
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid settings: {e}"))?;
        let bytes = messages::encode(settings)?;
        self.store
            .write_atomic(Subdir::Settings, SETTINGS_FILE, &bytes)?;
        Ok(())
    }
}

impl Drop for ProducerSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_poller(
    store: RendezvousStore,
    shared: Arc<RwLock<Shared>>,
    event_tx: mpsc::UnboundedSender<ProducerEvent>,
    interval: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    poll_partials(&store, &shared, &event_tx).await;
                    poll_final(&store, &shared, &event_tx).await;
                    poll_error(&store, &shared, &event_tx).await;
                    check_timeout(&store, &shared, &event_tx).await;
                }
            }
        }
        tracing::debug!("Producer poller stopped");
    });
}

async fn poll_partials(
    store: &RendezvousStore,
    shared: &Arc<RwLock<Shared>>,
    event_tx: &mpsc::UnboundedSender<ProducerEvent>,
) {
    let entries = match store.list(Subdir::Transcripts) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Partial poll failed: {}", e);
            return;
        }
    };
    for (name, _) in entries {
        if !name.starts_with(PARTIAL_PREFIX) {
            continue;
        }
        let bytes = match store.read(Subdir::Transcripts, &name) {
            Ok(bytes) => bytes,
            Err(RendezvousError::NotFound(_)) => continue,
            Err(e) => {
                tracing::warn!("Failed to read partial {}: {}", name, e);
                continue;
            }
        };
        // Partials are delete-on-consume regardless of whether they are
        // still relevant.
        if let Err(e) = store.delete(Subdir::Transcripts, &name) {
            tracing::warn!("Failed to consume partial {}: {}", name, e);
        }
        let partial = match messages::decode::<PartialTranscript>(&bytes)
            .and_then(|p| p.validate().map(|_| p))
        {
            Ok(partial) => partial,
            Err(e) => {
                tracing::warn!("Discarding invalid partial {}: {}", name, e);
                continue;
            }
        };

        let state = shared.read().await;
        let relevant = state.session_id.as_deref() == Some(partial.session_id.as_str())
            && matches!(
                state.state,
                ProducerState::Recording | ProducerState::AwaitingFinal
            );
        // A delayed partial must not flicker over an already-shown
        // final.
        let stale = state
            .last_final_timestamp
            .map(|final_ts| partial.timestamp <= final_ts)
            .unwrap_or(false);
        drop(state);

        if relevant && !stale {
            let _ = event_tx.send(ProducerEvent::Partial { text: partial.text });
        }
    }
}

async fn poll_final(
    store: &RendezvousStore,
    shared: &Arc<RwLock<Shared>>,
    event_tx: &mpsc::UnboundedSender<ProducerEvent>,
) {
    let mtime = match store.mtime(Subdir::Transcripts, FINAL_FILE) {
        Ok(Some(mtime)) => mtime,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!("Final poll failed: {}", e);
            return;
        }
    };

    {
        let state = shared.read().await;
        if state.last_final_mtime == Some(mtime) {
            return;
        }
    }

    let bytes = match store.read(Subdir::Transcripts, FINAL_FILE) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("Failed to read final transcript: {}", e);
            return;
        }
    };
    let record = match messages::decode::<FinalTranscript>(&bytes)
        .and_then(|f| f.validate().map(|_| f))
    {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!("Discarding invalid final transcript: {}", e);
            return;
        }
    };

    let mut state = shared.write().await;
    state.last_final_mtime = Some(mtime);
    let ours = state.session_id.as_deref() == Some(record.session_id.as_str())
        && matches!(
            state.state,
            ProducerState::Recording | ProducerState::AwaitingFinal
        );
    if !ours {
        tracing::debug!(
            "Ignoring final transcript for other session {}",
            record.session_id
        );
        return;
    }

    state.state = ProducerState::Idle;
    state.session_id = None;
    state.deadline = None;
    state.last_final_timestamp = Some(record.timestamp);
    drop(state);

    tracing::info!(
        "Final transcript received for {} ({}ms)",
        record.session_id,
        record.processing_time_ms
    );
    let _ = event_tx.send(ProducerEvent::Final {
        text: record.text,
        processing_time_ms: record.processing_time_ms,
    });
}

async fn poll_error(
    store: &RendezvousStore,
    shared: &Arc<RwLock<Shared>>,
    event_tx: &mpsc::UnboundedSender<ProducerEvent>,
) {
    let bytes = match store.read(Subdir::Control, ERROR_FILE) {
        Ok(bytes) => bytes,
        Err(RendezvousError::NotFound(_)) => return,
        Err(e) => {
            tracing::warn!("Error poll failed: {}", e);
            return;
        }
    };
    if let Err(e) = store.delete(Subdir::Control, ERROR_FILE) {
        tracing::warn!("Failed to consume error record: {}", e);
    }
    let record = match messages::decode::<ErrorRecord>(&bytes).and_then(|r| r.validate().map(|_| r))
    {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!("Discarding invalid error record: {}", e);
            return;
        }
    };

    let mut state = shared.write().await;
    let ours = match (&record.session_id, &state.session_id) {
        (Some(err_sid), Some(cur_sid)) => err_sid == cur_sid,
        // Session-less errors (e.g. model load failure) concern every
        // producer.
        (None, _) => true,
        _ => false,
    };
    if !ours || (state.state == ProducerState::Idle && record.session_id.is_some()) {
        return;
    }
    state.state = ProducerState::Failed;
    state.deadline = None;
    drop(state);

    tracing::warn!("Consumer reported {}: {}", record.kind, record.description);
    let _ = event_tx.send(ProducerEvent::Error {
        kind: record.kind,
        description: record.description,
    });
}

async fn check_timeout(
    store: &RendezvousStore,
    shared: &Arc<RwLock<Shared>>,
    event_tx: &mpsc::UnboundedSender<ProducerEvent>,
) {
    let expired_session = {
        let mut state = shared.write().await;
        let expired = state.state == ProducerState::AwaitingFinal
            && state
                .deadline
                .map(|d| Instant::now() >= d)
                .unwrap_or(false);
        if !expired {
            return;
        }
        let session = state.session_id.take();
        state.state = ProducerState::Failed;
        state.deadline = None;
        session
    };

    if let Some(session_id) = expired_session {
        tracing::warn!("Session {} timed out waiting for a final transcript", session_id);
        // The consumer may still be chewing; tell it to stop.
        let signal = ControlSignal::new(ControlKind::Cancel, &session_id);
        if let Ok(bytes) = messages::encode(&signal) {
            if let Err(e) = store.write_atomic(Subdir::Control, CONTROL_FILE, &bytes) {
                tracing::warn!("Failed to publish cancel after timeout: {}", e);
            }
        }
    }
    let _ = event_tx.send(ProducerEvent::TimedOut);
}

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

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::messages::{
    self, chunk_meta_name, ChunkMetadata, ControlSignal, ErrorRecord, CHUNK_PREFIX, CONTROL_FILE,
    ERROR_FILE,
};
use crate::orchestrator::OrchestratorCommand;
use crate::reaper::AuditLog;
use crate::rendezvous::{RendezvousStore, Subdir};
use crate::sequencer::{BufferedChunk, ChunkSequencer};
use crate::status::SharedStatus;
use crate::system;
use crate::types::{ControlKind, ErrorKind};

/// RSS is probed every this many poll ticks (~1 s at the default
/// cadence).
const MEMORY_CHECK_EVERY_TICKS: u64 = 20;
/// Repeated pressure within this window earns a louder warning.
const MEMORY_PRESSURE_WINDOW: Duration = Duration::from_secs(60);

struct Monitor {
    store: RendezvousStore,
    sequencer: ChunkSequencer,
    current: Option<String>,
    orch_tx: mpsc::UnboundedSender<OrchestratorCommand>,
    status: SharedStatus,
    ping_tx: mpsc::UnboundedSender<()>,
    audit: Arc<AuditLog>,
    memory_limit_mb: u64,
    pressure_pause: Duration,
    paused_until: Option<Instant>,
    pressure_history: Vec<Instant>,
    ticks: u64,
}

impl Monitor {
    /// Remove a metadata/PCM pair. Either file may already be gone.
    fn delete_pair(&self, meta_name: &str, pcm_name: &str) {
        if let Err(e) = self.store.delete(Subdir::Audio, meta_name) {
            tracing::warn!("Failed to delete {}: {}", meta_name, e);
        }
        if let Err(e) = self.store.delete(Subdir::Audio, pcm_name) {
            tracing::warn!("Failed to delete {}: {}", pcm_name, e);
        }
    }

    fn delete_chunk_files(&self, chunk: &BufferedChunk) {
        let meta_name = chunk_meta_name(&chunk.meta.session_id, chunk.meta.chunk_id);
        self.delete_pair(&meta_name, &chunk.meta.pcm_filename);
    }

    /// Delete every rendezvous entry whose name carries the session id.
    fn purge_session_files(&self, session_id: &str) {
        for sub in [Subdir::Audio, Subdir::Transcripts] {
            let entries = match self.store.list(sub) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!("Session purge list failed: {}", e);
                    continue;
                }
            };
            for (name, _) in entries {
                if name.contains(session_id) {
                    if let Err(e) = self.store.delete(sub, &name) {
                        tracing::warn!("Session purge delete failed for {}: {}", name, e);
                    }
                }
            }
        }
    }

    fn purge_sequencer(&mut self) {
        for chunk in self.sequencer.reset() {
            self.delete_chunk_files(&chunk);
        }
    }

    async fn handle_control(&mut self, signal: ControlSignal) {
        tracing::debug!("Control signal {} for session {}", signal.signal, signal.session_id);
        match signal.signal {
            ControlKind::Start => {
                self.purge_sequencer();
                self.current = Some(signal.session_id.clone());
                let _ = self.orch_tx.send(OrchestratorCommand::StartSession {
                    session_id: signal.session_id,
                });
            }
            ControlKind::Stop => {
                // Finalization rides on the is_last_chunk flag; nothing
                // to do on the ingest path.
            }
            ControlKind::Cancel | ControlKind::Reset => {
                let _ = self.orch_tx.send(OrchestratorCommand::CancelSession);
                self.purge_sequencer();
                self.purge_session_files(&signal.session_id);
                self.current = None;
                self.audit
                    .record(&format!("session {} purged on {}", signal.session_id, signal.signal));
            }
            ControlKind::Ping => {
                let _ = self.ping_tx.send(());
            }
        }
    }

    async fn poll_control(&mut self) {
        let bytes = match self.store.read(Subdir::Control, CONTROL_FILE) {
            Ok(bytes) => bytes,
            Err(crate::rendezvous::RendezvousError::NotFound(_)) => return,
            Err(e) => {
                tracing::warn!("Control poll failed: {}", e);
                return;
            }
        };
        // Consume the file whether or not it parses; a corrupt signal
        // must not wedge the channel.
        if let Err(e) = self.store.delete(Subdir::Control, CONTROL_FILE) {
            tracing::warn!("Failed to consume control signal: {}", e);
        }
        match messages::decode::<ControlSignal>(&bytes).and_then(|s| s.validate().map(|_| s)) {
            Ok(signal) => self.handle_control(signal).await,
            Err(e) => tracing::warn!("Discarding invalid control signal: {}", e),
        }
    }

    async fn process_metadata_file(&mut self, meta_name: &str) {
        let bytes = match self.store.read(Subdir::Audio, meta_name) {
            Ok(bytes) => bytes,
            Err(crate::rendezvous::RendezvousError::NotFound(_)) => return,
            Err(e) => {
                tracing::warn!("Failed to read {}: {}", meta_name, e);
                return;
            }
        };

        let fallback_pcm = meta_name.replace(".json", ".pcm");
        let meta = match messages::decode::<ChunkMetadata>(&bytes)
            .and_then(|m| m.validate(Utc::now()).map(|_| m))
        {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!("Rejecting chunk metadata {}: {}", meta_name, e);
                self.delete_pair(meta_name, &fallback_pcm);
                return;
            }
        };

        if meta.chunk_id as i64 <= self.sequencer.last_processed() {
            tracing::debug!("Duplicate chunk {} discarded", meta.chunk_id);
            self.delete_pair(meta_name, &meta.pcm_filename);
            return;
        }

        if self.sequencer.contains(meta.chunk_id) {
            // Already buffered; its files belong to the buffer entry.
            return;
        }

        if self.current.as_deref() != Some(meta.session_id.as_str()) {
            tracing::debug!(
                "Discarding chunk {} from stale session {}",
                meta.chunk_id,
                meta.session_id
            );
            self.delete_pair(meta_name, &meta.pcm_filename);
            return;
        }

        let pcm = match self.store.read(Subdir::Audio, &meta.pcm_filename) {
            Ok(pcm) => pcm,
            Err(e) => {
                tracing::warn!(
                    "PCM sibling {} missing for {}: {}",
                    meta.pcm_filename,
                    meta_name,
                    e
                );
                self.delete_pair(meta_name, &meta.pcm_filename);
                return;
            }
        };

        if let Err(e) = meta.check_pcm_len(pcm.len()) {
            tracing::warn!("Rejecting chunk {}: {}", meta.chunk_id, e);
            self.delete_pair(meta_name, &meta.pcm_filename);
            return;
        }

        let result = self.sequencer.accept(BufferedChunk { meta, pcm });

        if let Some(evicted) = result.evicted {
            tracing::warn!(
                "Sequencer overflow: dropping buffered chunk {} of session {}",
                evicted.meta.chunk_id,
                evicted.meta.session_id
            );
            self.audit.record(&format!(
                "session {} dropped chunk {} on overflow",
                evicted.meta.session_id, evicted.meta.chunk_id
            ));
            self.delete_chunk_files(&evicted);
            self.status.write().await.dropped_chunks = self.sequencer.dropped();
        }

        for chunk in result.deliver {
            self.delete_chunk_files(&chunk);
            let _ = self.orch_tx.send(OrchestratorCommand::Chunk(chunk));
        }
    }

    async fn poll_audio(&mut self) {
        let entries = match self.store.list(Subdir::Audio) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Audio poll failed: {}", e);
                return;
            }
        };
        for (name, _) in entries {
            if name.starts_with(CHUNK_PREFIX) && name.ends_with(".json") {
                self.process_metadata_file(&name).await;
            }
        }
    }

    fn publish_error(&self, kind: ErrorKind, description: String, session_id: Option<String>) {
        let record = ErrorRecord::new(kind, description, session_id);
        match messages::encode(&record) {
            Ok(bytes) => {
                if let Err(e) = self.store.write_atomic(Subdir::Control, ERROR_FILE, &bytes) {
                    tracing::warn!("Failed to publish error record: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to encode error record: {}", e),
        }
    }

    /// Cancel the current session and pause ingest when resident memory
    /// crosses the limit; repeated pressure inside the window is shouted
    /// about.
    async fn check_memory(&mut self) {
        if self.memory_limit_mb == 0 {
            return;
        }
        let rss_mb = system::resident_memory_mb().await;
        if rss_mb <= self.memory_limit_mb {
            return;
        }

        let now = Instant::now();
        self.pressure_history
            .retain(|t| now.duration_since(*t) <= MEMORY_PRESSURE_WINDOW);
        self.pressure_history.push(now);
        if self.pressure_history.len() > 1 {
            tracing::error!(
                "Memory pressure recurred {} times within {:?}; consider a smaller model",
                self.pressure_history.len(),
                MEMORY_PRESSURE_WINDOW
            );
        } else {
            tracing::warn!(
                "Resident memory {}MB exceeds limit {}MB; cancelling session and pausing ingest",
                rss_mb,
                self.memory_limit_mb
            );
        }

        let session = self.current.take();
        self.publish_error(
            ErrorKind::MemoryPressure,
            format!("resident memory {rss_mb}MB over {}MB limit", self.memory_limit_mb),
            session.clone(),
        );
        let _ = self.orch_tx.send(OrchestratorCommand::CancelSession);
        self.purge_sequencer();
        if let Some(ref session_id) = session {
            self.purge_session_files(session_id);
            self.audit
                .record(&format!("session {session_id} cancelled on memory pressure"));
        }
        self.paused_until = Some(now + self.pressure_pause);
    }

    async fn tick(&mut self) {
        if let Some(until) = self.paused_until {
            if Instant::now() < until {
                return;
            }
            self.paused_until = None;
            tracing::info!("Resuming ingest after memory pressure pause");
        }
        if self.ticks % MEMORY_CHECK_EVERY_TICKS == 0 {
            self.check_memory().await;
        }
        self.ticks += 1;
        if self.paused_until.is_some() {
            return;
        }
        self.poll_control().await;
        self.poll_audio().await;
    }
}

/// Spawn the consumer's polling lane.
pub fn spawn(
    store: RendezvousStore,
    orch_tx: mpsc::UnboundedSender<OrchestratorCommand>,
    status: SharedStatus,
    ping_tx: mpsc::UnboundedSender<()>,
    audit: Arc<AuditLog>,
    poll_interval: Duration,
    memory_limit_mb: u64,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut monitor = Monitor {
            store,
            sequencer: ChunkSequencer::new(),
            current: None,
            orch_tx,
            status,
            ping_tx,
            audit,
            memory_limit_mb,
            pressure_pause: Duration::from_secs(5),
            paused_until: None,
            pressure_history: Vec::new(),
            ticks: 0,
        };
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => monitor.tick().await,
            }
        }
        tracing::debug!("Consumer monitor stopped");
    })
}

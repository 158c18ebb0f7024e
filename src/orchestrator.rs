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

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio;
use crate::inference::{InferenceParams, SpeechEngine};
use crate::messages::{
    self, partial_name, ErrorRecord, FinalTranscript, PartialTranscript, SessionSettings,
    ERROR_FILE, FINAL_FILE, SETTINGS_FILE,
};
use crate::reaper::AuditLog;
use crate::rendezvous::{RendezvousStore, Subdir};
use crate::sequencer::BufferedChunk;
use crate::status::SharedStatus;
use crate::types::{ErrorKind, PunctuationMode};

/// Commands from the monitor lane to the single inference worker.
#[derive(Debug)]
pub enum OrchestratorCommand {
    StartSession { session_id: String },
    Chunk(BufferedChunk),
    CancelSession,
}

/// Strip punctuation, keeping apostrophes so contractions survive.
/// `keep_terminators` preserves sentence boundaries for re-capitalization.
fn strip_punctuation(text: &str, keep_terminators: bool) -> String {
    text.chars()
        .filter(|c| {
            !c.is_ascii_punctuation()
                || *c == '\''
                || (keep_terminators && matches!(c, '.' | '!' | '?'))
        })
        .collect()
}

fn capitalize_sentences(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut capitalize_next = true;
    for c in text.chars() {
        if capitalize_next && c.is_alphabetic() {
            out.extend(c.to_uppercase());
            capitalize_next = false;
        } else {
            out.push(c);
        }
        if matches!(c, '.' | '!' | '?') {
            capitalize_next = true;
        }
    }
    out
}

/// Post-process model output per the shared punctuation setting. The
/// model may emit punctuation of its own; `auto` trusts it, the other
/// modes normalize it away.
pub fn apply_punctuation(text: &str, mode: PunctuationMode) -> String {
    match mode {
        PunctuationMode::Auto => text.to_string(),
        PunctuationMode::None => strip_punctuation(text, false),
        PunctuationMode::Sentence => capitalize_sentences(&strip_punctuation(text, true)),
    }
}

struct Worker {
    engine: Arc<Mutex<Box<dyn SpeechEngine + Send>>>,
    store: RendezvousStore,
    status: SharedStatus,
    audit: Arc<AuditLog>,
    current: Option<String>,
    settings: SessionSettings,
    session_text: String,
    session_started: Instant,
}

impl Worker {
    fn load_settings(&self) -> SessionSettings {
        match self.store.read(Subdir::Settings, SETTINGS_FILE) {
            Ok(bytes) => match messages::decode::<SessionSettings>(&bytes)
                .and_then(|s| s.validate().map(|_| s))
            {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!("Ignoring invalid settings record: {}", e);
                    SessionSettings::default()
                }
            },
            Err(_) => SessionSettings::default(),
        }
    }

    async fn start_session(&mut self, session_id: String) {
        if let Some(prior) = self.current.take() {
            tracing::warn!(
                "Session {} superseded by {} before finishing; cancelling it",
                prior,
                session_id
            );
            self.audit.record(&format!("session {prior} superseded"));
        }
        self.settings = self.load_settings();
        self.session_text.clear();
        self.session_started = Instant::now();
        self.current = Some(session_id.clone());

        let mut status = self.status.write().await;
        status.processing = true;
        status.current_session = Some(session_id.clone());
        drop(status);

        self.audit.record(&format!("session {session_id} started"));
        tracing::info!("Inference session {} started", session_id);
    }

    async fn cancel_session(&mut self) {
        if let Some(id) = self.current.take() {
            self.audit.record(&format!("session {id} cancelled"));
            tracing::info!("Inference session {} cancelled", id);
        }
        self.session_text.clear();
        let mut status = self.status.write().await;
        status.processing = false;
        status.current_session = None;
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

    fn publish_partial(&self, session_id: &str, tokens: Vec<String>) {
        let now = Utc::now();
        let record = PartialTranscript {
            session_id: session_id.to_string(),
            text: apply_punctuation(&self.session_text, self.settings.punctuation),
            tokens,
            timestamp: now,
        };
        match messages::encode(&record) {
            Ok(bytes) => {
                if let Err(e) =
                    self.store
                        .write_atomic(Subdir::Transcripts, &partial_name(now), &bytes)
                {
                    tracing::warn!("Failed to publish partial: {}", e);
                }
            }
            Err(e) => tracing::warn!("Failed to encode partial: {}", e),
        }
    }

    async fn finish_session(&mut self, session_id: String) -> Result<()> {
        let elapsed_ms = self.session_started.elapsed().as_millis() as u64;
        let record = FinalTranscript {
            session_id: session_id.clone(),
            text: apply_punctuation(&self.session_text, self.settings.punctuation),
            is_final: true,
            processing_time_ms: elapsed_ms,
            confidence: None,
            timestamp: Utc::now(),
        };
        let bytes = messages::encode(&record)?;
        self.store
            .write_atomic(Subdir::Transcripts, FINAL_FILE, &bytes)?;

        self.current = None;
        self.session_text.clear();
        let mut status = self.status.write().await;
        status.processing = false;
        status.current_session = None;
        drop(status);

        self.audit
            .record(&format!("session {session_id} finalized in {elapsed_ms}ms"));
        tracing::info!(
            "Session {} finalized after {}ms",
            session_id,
            elapsed_ms
        );
        Ok(())
    }

    async fn on_chunk(&mut self, chunk: BufferedChunk) {
        let session_id = match &self.current {
            Some(id) if *id == chunk.meta.session_id => id.clone(),
            _ => {
                tracing::debug!(
                    "Dropping chunk {} for inactive session {}",
                    chunk.meta.chunk_id,
                    chunk.meta.session_id
                );
                return;
            }
        };

        let samples = match audio::samples_from_bytes(chunk.meta.format, &chunk.pcm) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!("Chunk {} payload unusable: {}", chunk.meta.chunk_id, e);
                self.publish_error(
                    ErrorKind::AudioProcessingFailed,
                    e.to_string(),
                    Some(session_id),
                );
                return;
            }
        };

        let params = InferenceParams {
            language: self.settings.language.clone(),
        };
        let engine = self.engine.clone();
        let result =
            tokio::task::spawn_blocking(move || engine.lock().transcribe(&samples, &params)).await;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::warn!("Inference failed on chunk {}: {}", chunk.meta.chunk_id, e);
                self.publish_error(ErrorKind::InferenceFailed, e.to_string(), Some(session_id));
                return;
            }
            Err(e) => {
                tracing::error!("Inference worker panicked: {}", e);
                self.publish_error(
                    ErrorKind::InferenceFailed,
                    e.to_string(),
                    Some(session_id),
                );
                return;
            }
        };

        let text = output.text();
        if !text.is_empty() {
            if !self.session_text.is_empty() {
                self.session_text.push(' ');
            }
            self.session_text.push_str(&text);
        }

        if self.settings.streaming_enabled {
            self.publish_partial(&session_id, output.tokens());
        }

        if chunk.meta.is_last_chunk {
            if let Err(e) = self.finish_session(session_id.clone()).await {
                tracing::error!("Failed to publish final transcript: {}", e);
                self.publish_error(ErrorKind::InferenceFailed, e.to_string(), Some(session_id));
            }
        }
    }
}

/// Spawn the single inference worker. All model operations happen on
/// this lane; the model is never entered from anywhere else.
pub fn spawn(
    engine: Box<dyn SpeechEngine + Send>,
    store: RendezvousStore,
    status: SharedStatus,
    audit: Arc<AuditLog>,
    cancel: CancellationToken,
) -> (
    mpsc::UnboundedSender<OrchestratorCommand>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let mut worker = Worker {
            engine: Arc::new(Mutex::new(engine)),
            store,
            status,
            audit,
            current: None,
            settings: SessionSettings::default(),
            session_text: String::new(),
            session_started: Instant::now(),
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => match cmd {
                    Some(OrchestratorCommand::StartSession { session_id }) => {
                        worker.start_session(session_id).await;
                    }
                    Some(OrchestratorCommand::Chunk(chunk)) => {
                        worker.on_chunk(chunk).await;
                    }
                    Some(OrchestratorCommand::CancelSession) => {
                        worker.cancel_session().await;
                    }
                    None => break,
                }
            }
        }
        tracing::debug!("Inference orchestrator stopped");
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::ScriptedEngine;
    use crate::messages::{chunk_pcm_name, decode, ChunkMetadata, CHANNELS, SAMPLE_RATE};
    use crate::status;
    use crate::types::AudioFormat;
    use std::time::Duration;
    use tempfile::TempDir;

    fn chunk(session: &str, id: u64, is_last: bool) -> BufferedChunk {
        // 0.2s of silence: 3200 samples, 6400 bytes.
        BufferedChunk {
            meta: ChunkMetadata {
                session_id: session.to_string(),
                chunk_id: id,
                sample_rate: SAMPLE_RATE,
                channels: CHANNELS,
                format: AudioFormat::Pcm16,
                duration_secs: 0.2,
                timestamp: Utc::now(),
                is_last_chunk: is_last,
                pcm_filename: chunk_pcm_name(session, id),
            },
            pcm: vec![0; 6400],
        }
    }

    struct Rig {
        _dir: TempDir,
        store: RendezvousStore,
        tx: mpsc::UnboundedSender<OrchestratorCommand>,
        cancel: CancellationToken,
        status: SharedStatus,
    }

    fn rig(engine: ScriptedEngine) -> Rig {
        let dir = TempDir::new().unwrap();
        let store = RendezvousStore::open(dir.path().join("bridge")).unwrap();
        let status = status::shared("scripted", true);
        let audit = Arc::new(AuditLog::new(&store));
        let cancel = CancellationToken::new();
        let (tx, _handle) = spawn(
            Box::new(engine),
            store.clone(),
            status.clone(),
            audit,
            cancel.clone(),
        );
        Rig {
            _dir: dir,
            store,
            tx,
            cancel,
            status,
        }
    }

    async fn wait_for_final(store: &RendezvousStore) -> FinalTranscript {
        for _ in 0..100 {
            if let Ok(bytes) = store.read(Subdir::Transcripts, FINAL_FILE) {
                return decode(&bytes).unwrap();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no final transcript published");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn chunks_accumulate_into_a_final_transcript() {
        let engine = ScriptedEngine::new(["hello", "world"]);
        let log = engine.call_log();
        let r = rig(engine);

        r.tx.send(OrchestratorCommand::StartSession {
            session_id: "s1".into(),
        })
        .unwrap();
        r.tx.send(OrchestratorCommand::Chunk(chunk("s1", 0, false))).unwrap();
        r.tx.send(OrchestratorCommand::Chunk(chunk("s1", 1, true))).unwrap();

        let final_rec = wait_for_final(&r.store).await;
        assert_eq!(final_rec.session_id, "s1");
        assert_eq!(final_rec.text, "hello world");
        assert!(final_rec.is_final);
        // Both chunks hit the model, in order, 3200 samples each.
        assert_eq!(*log.lock(), vec![3200, 3200]);
        assert!(!r.status.read().await.processing);
        r.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn partials_are_published_while_streaming() {
        let r = rig(ScriptedEngine::new(["one", "two"]));
        r.tx.send(OrchestratorCommand::StartSession {
            session_id: "s1".into(),
        })
        .unwrap();
        r.tx.send(OrchestratorCommand::Chunk(chunk("s1", 0, false))).unwrap();

        let mut partial = None;
        for _ in 0..100 {
            let entries = r.store.list(Subdir::Transcripts).unwrap();
            if let Some((name, _)) = entries
                .iter()
                .find(|(n, _)| n.starts_with(messages::PARTIAL_PREFIX))
            {
                let bytes = r.store.read(Subdir::Transcripts, name).unwrap();
                partial = Some(decode::<PartialTranscript>(&bytes).unwrap());
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let partial = partial.expect("partial transcript published");
        assert_eq!(partial.session_id, "s1");
        assert_eq!(partial.text, "one");
        assert_eq!(partial.tokens, vec!["one"]);
        r.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn chunks_for_other_sessions_are_dropped() {
        let engine = ScriptedEngine::new(["x"]);
        let log = engine.call_log();
        let r = rig(engine);
        r.tx.send(OrchestratorCommand::StartSession {
            session_id: "s1".into(),
        })
        .unwrap();
        r.tx.send(OrchestratorCommand::Chunk(chunk("other", 0, true))).unwrap();
        r.tx.send(OrchestratorCommand::Chunk(chunk("s1", 0, true))).unwrap();

        let final_rec = wait_for_final(&r.store).await;
        assert_eq!(final_rec.session_id, "s1");
        // Only the matching chunk reached the model.
        assert_eq!(log.lock().len(), 1);
        r.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_prevents_any_final() {
        let r = rig(ScriptedEngine::new(["x"]));
        r.tx.send(OrchestratorCommand::StartSession {
            session_id: "s1".into(),
        })
        .unwrap();
        r.tx.send(OrchestratorCommand::CancelSession).unwrap();
        r.tx.send(OrchestratorCommand::Chunk(chunk("s1", 0, true))).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!r.store.exists(Subdir::Transcripts, FINAL_FILE).unwrap());
        assert!(!r.status.read().await.processing);
        r.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inference_failure_publishes_recoverable_error() {
        let r = rig(ScriptedEngine::new(["x"]).fail_on_call(0));
        r.tx.send(OrchestratorCommand::StartSession {
            session_id: "s1".into(),
        })
        .unwrap();
        r.tx.send(OrchestratorCommand::Chunk(chunk("s1", 0, false))).unwrap();

        let mut error = None;
        for _ in 0..100 {
            if let Ok(bytes) = r.store.read(Subdir::Control, ERROR_FILE) {
                error = Some(decode::<ErrorRecord>(&bytes).unwrap());
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let error = error.expect("error record published");
        assert_eq!(error.kind, ErrorKind::InferenceFailed);
        assert!(error.is_recoverable);
        assert_eq!(error.session_id.as_deref(), Some("s1"));

        // The session survives: a later chunk still finalizes.
        r.tx.send(OrchestratorCommand::Chunk(chunk("s1", 1, true))).unwrap();
        let final_rec = wait_for_final(&r.store).await;
        assert_eq!(final_rec.session_id, "s1");
        r.cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn new_session_supersedes_unfinished_one() {
        let engine = ScriptedEngine::new(["a", "b"]);
        let r = rig(engine);
        r.tx.send(OrchestratorCommand::StartSession {
            session_id: "s1".into(),
        })
        .unwrap();
        r.tx.send(OrchestratorCommand::Chunk(chunk("s1", 0, false))).unwrap();
        r.tx.send(OrchestratorCommand::StartSession {
            session_id: "s2".into(),
        })
        .unwrap();
        r.tx.send(OrchestratorCommand::Chunk(chunk("s2", 0, true))).unwrap();

        let final_rec = wait_for_final(&r.store).await;
        assert_eq!(final_rec.session_id, "s2");
        // Text restarts for the new session.
        assert_eq!(final_rec.text, "b");
        r.cancel.cancel();
    }

    #[test]
    fn punctuation_auto_passes_through() {
        assert_eq!(
            apply_punctuation("Hello, world! it's fine.", PunctuationMode::Auto),
            "Hello, world! it's fine."
        );
    }

    #[test]
    fn punctuation_none_strips_marks_but_keeps_apostrophes() {
        assert_eq!(
            apply_punctuation("Hello, world! it's fine.", PunctuationMode::None),
            "Hello world it's fine"
        );
    }

    #[test]
    fn punctuation_sentence_capitalizes_after_terminators() {
        assert_eq!(
            apply_punctuation("hello, world. it's fine? yes", PunctuationMode::Sentence),
            "Hello world. It's fine? Yes"
        );
    }
}

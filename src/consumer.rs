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
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::inference::{self, SpeechEngine};
use crate::messages::{self, ErrorRecord, ERROR_FILE};
use crate::monitor;
use crate::orchestrator;
use crate::reaper::{self, AuditLog};
use crate::rendezvous::{RendezvousStore, Subdir};
use crate::status;
use crate::types::ErrorKind;

/// The model host: monitor, inference worker, status publisher and
/// reaper over one rendezvous.
pub struct Consumer {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Consumer {
    /// Wire up and spawn all consumer lanes. The engine is warmed with
    /// one second of silence before the first session can arrive.
    pub async fn start(
        config: &Config,
        store: RendezvousStore,
        mut engine: Box<dyn SpeechEngine + Send>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let swept = reaper::startup_sweep(&store).context("Startup sweep failed")?;
        if swept > 0 {
            tracing::info!("Removed {} stale rendezvous entries at startup", swept);
        }

        let engine = tokio::task::spawn_blocking(move || {
            let elapsed = inference::warm_up(engine.as_mut())?;
            tracing::info!("Model warm-up finished in {:?}", elapsed);
            Ok::<_, anyhow::Error>(engine)
        })
        .await
        .context("Warm-up task failed")??;

        let variant = engine.model_variant().to_string();
        let shared_status = status::shared(&variant, true);
        let audit = Arc::new(AuditLog::new(&store));
        audit.record("consumer started");

        let (ping_tx, ping_rx) = mpsc::unbounded_channel();

        let (orch_tx, orch_handle) = orchestrator::spawn(
            engine,
            store.clone(),
            shared_status.clone(),
            audit.clone(),
            cancel.clone(),
        );
        let monitor_handle = monitor::spawn(
            store.clone(),
            orch_tx,
            shared_status.clone(),
            ping_tx,
            audit.clone(),
            config.consumer_poll_interval,
            config.memory_limit_mb,
            cancel.clone(),
        );
        let status_handle = status::spawn(
            store.clone(),
            shared_status,
            config.status_interval,
            ping_rx,
            cancel.clone(),
        );
        let reaper_handle = reaper::spawn(store, audit, config.reaper_interval, cancel);

        Ok(Self {
            handles: vec![orch_handle, monitor_handle, status_handle, reaper_handle],
        })
    }

    /// Wait for every lane to wind down after cancellation.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!("Consumer lane ended abnormally: {}", e);
            }
        }
    }
}

/// Publish the non-recoverable model-load failure so producers can show
/// something better than a timeout.
pub fn publish_model_load_failure(store: &RendezvousStore, description: &str) {
    let record = ErrorRecord::new(ErrorKind::ModelLoadFailed, description, None);
    match messages::encode(&record) {
        Ok(bytes) => {
            if let Err(e) = store.write_atomic(Subdir::Control, ERROR_FILE, &bytes) {
                tracing::warn!("Failed to publish model load failure: {}", e);
            }
        }
        Err(e) => tracing::warn!("Failed to encode model load failure: {}", e),
    }
}

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
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::messages::{self, StatusRecord, STATUS_FILE};
use crate::rendezvous::{RendezvousStore, Subdir};
use crate::system;

/// Live consumer health, updated by the monitor and orchestrator lanes
/// and snapshotted by the publisher.
#[derive(Debug, Default)]
pub struct StatusFields {
    pub model_loaded: bool,
    pub model_variant: String,
    pub processing: bool,
    pub current_session: Option<String>,
    pub dropped_chunks: u64,
}

pub type SharedStatus = Arc<RwLock<StatusFields>>;

pub fn shared(model_variant: &str, model_loaded: bool) -> SharedStatus {
    Arc::new(RwLock::new(StatusFields {
        model_loaded,
        model_variant: model_variant.to_string(),
        ..Default::default()
    }))
}

async fn publish(store: &RendezvousStore, shared: &SharedStatus) {
    let record = {
        let fields = shared.read().await;
        StatusRecord {
            model_loaded: fields.model_loaded,
            processing: fields.processing,
            current_session: fields.current_session.clone(),
            model_variant: fields.model_variant.clone(),
            memory_mb: 0,
            dropped_chunks: fields.dropped_chunks,
            last_update: Utc::now(),
        }
    };
    let record = StatusRecord {
        memory_mb: system::resident_memory_mb().await,
        ..record
    };
    match messages::encode(&record) {
        Ok(bytes) => {
            if let Err(e) = store.write_atomic(Subdir::Control, STATUS_FILE, &bytes) {
                tracing::warn!("Failed to publish status: {}", e);
            }
        }
        Err(e) => tracing::warn!("Failed to encode status: {}", e),
    }
}

/// Publish a status record every `interval` and whenever a ping arrives.
pub fn spawn(
    store: RendezvousStore,
    shared: SharedStatus,
    interval: Duration,
    mut ping_rx: mpsc::UnboundedReceiver<()>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => publish(&store, &shared).await,
                Some(()) = ping_rx.recv() => publish(&store, &shared).await,
            }
        }
        tracing::debug!("Status publisher stopped");
    })
}

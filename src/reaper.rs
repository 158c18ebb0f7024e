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
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;

use crate::rendezvous::{RendezvousStore, Subdir};

pub const STARTUP_MAX_AGE: Duration = Duration::from_secs(60 * 60);
pub const AUDIO_MAX_AGE: Duration = Duration::from_secs(60);
pub const PARTIAL_MAX_AGE: Duration = Duration::from_secs(5 * 60);
pub const AUDIT_MAX_BYTES: u64 = 5 * 1024 * 1024;
pub const AUDIT_ARCHIVE_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const AUDIT_FILE: &str = "audit.log";

/// Delete entries in `sub` whose name passes `filter` and whose
/// modification time is older than `max_age`. Returns how many were
/// removed.
fn sweep_older_than(
    store: &RendezvousStore,
    sub: Subdir,
    max_age: Duration,
    filter: impl Fn(&str) -> bool,
) -> Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;
    for (name, mtime) in store.list(sub)? {
        if !filter(&name) {
            continue;
        }
        let age = now.duration_since(mtime).unwrap_or_default();
        if age > max_age {
            store.delete(sub, &name)?;
            tracing::debug!("Reaped stale entry {}/{}", sub.as_str(), name);
            removed += 1;
        }
    }
    Ok(removed)
}

/// Startup sweep: anything left behind by a crashed peer, older than an
/// hour, goes. Settings are spared; they are long-lived by design.
pub fn startup_sweep(store: &RendezvousStore) -> Result<usize> {
    startup_sweep_with_age(store, STARTUP_MAX_AGE)
}

pub fn startup_sweep_with_age(store: &RendezvousStore, max_age: Duration) -> Result<usize> {
    let mut removed = 0;
    for sub in [Subdir::Audio, Subdir::Transcripts, Subdir::Control] {
        removed += sweep_older_than(store, sub, max_age, |_| true)?;
    }
    if removed > 0 {
        tracing::info!("Startup sweep removed {} orphaned entries", removed);
    }
    Ok(removed)
}

/// Periodic sweep: audio chunks have a 60 s retention, partial
/// transcripts five minutes.
pub fn periodic_sweep(store: &RendezvousStore) -> Result<usize> {
    periodic_sweep_with_ages(store, AUDIO_MAX_AGE, PARTIAL_MAX_AGE)
}

pub fn periodic_sweep_with_ages(
    store: &RendezvousStore,
    audio_max_age: Duration,
    partial_max_age: Duration,
) -> Result<usize> {
    let mut removed = sweep_older_than(store, Subdir::Audio, audio_max_age, |_| true)?;
    removed += sweep_older_than(store, Subdir::Transcripts, partial_max_age, |name| {
        name.starts_with(crate::messages::PARTIAL_PREFIX)
    })?;
    Ok(removed)
}

/// Append-only log of session lifecycle events on the consumer,
/// rotated by size.
pub struct AuditLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(store: &RendezvousStore) -> Self {
        Self {
            path: store.root().join(AUDIT_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append one event line. Failures are logged, never fatal: the
    /// audit trail must not take a session down.
    pub fn record(&self, event: &str) {
        let _guard = self.lock.lock();
        let line = format!("{} {}\n", chrono::Utc::now().to_rfc3339(), event);
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            tracing::warn!("Failed to append audit event: {}", e);
        }
    }

    /// Archive the log with an epoch suffix once it exceeds the size
    /// bound, and drop archives past their retention.
    pub fn rotate_if_needed(&self) -> Result<usize> {
        self.rotate_with_limits(AUDIT_MAX_BYTES, AUDIT_ARCHIVE_MAX_AGE)
    }

    pub fn rotate_with_limits(&self, max_bytes: u64, archive_max_age: Duration) -> Result<usize> {
        let _guard = self.lock.lock();

        let size = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if size > max_bytes {
            let epoch = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let archive = self.path.with_file_name(format!("audit.{epoch}.log"));
            fs::rename(&self.path, &archive).context("Failed to archive audit log")?;
            tracing::info!("Rotated audit log to {}", archive.display());
        }

        // Expire old archives.
        let dir = match self.path.parent() {
            Some(dir) => dir,
            None => return Ok(0),
        };
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("audit.") || !name.ends_with(".log") || name == AUDIT_FILE {
                continue;
            }
            let mtime = entry.metadata()?.modified()?;
            if now.duration_since(mtime).unwrap_or_default() > archive_max_age {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Run the periodic sweeps until cancelled.
pub fn spawn(
    store: RendezvousStore,
    audit: std::sync::Arc<AuditLog>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = periodic_sweep(&store) {
                        tracing::warn!("Periodic sweep failed: {}", e);
                    }
                    if let Err(e) = audit.rotate_if_needed() {
                        tracing::warn!("Audit rotation failed: {}", e);
                    }
                }
            }
        }
        tracing::debug!("Reaper stopped");
    })
}

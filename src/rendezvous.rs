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

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;

/// The four named channels under the shared rendezvous root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subdir {
    Audio,
    Transcripts,
    Control,
    Settings,
}

impl Subdir {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subdir::Audio => "audio",
            Subdir::Transcripts => "transcripts",
            Subdir::Control => "control",
            Subdir::Settings => "settings",
        }
    }

    pub const ALL: [Subdir; 4] = [
        Subdir::Audio,
        Subdir::Transcripts,
        Subdir::Control,
        Subdir::Settings,
    ];
}

#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    #[error("rendezvous container not found: {0}")]
    ContainerNotFound(PathBuf),

    #[error("invalid rendezvous entry name: {0}")]
    InvalidDir(String),

    #[error("rendezvous I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("rendezvous entry not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, RendezvousError>;

/// Typed view over the shared rendezvous directory.
///
/// All writes go through a temporary sibling followed by a rename, so
/// readers never observe a half-written file. Entry names are flat: no
/// separators, no parent references, nothing above the root is
/// addressable.
#[derive(Debug, Clone)]
pub struct RendezvousStore {
    root: PathBuf,
}

impl RendezvousStore {
    /// Open the store at `root`, creating the four subdirectories.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if let Some(parent) = root.parent() {
            if !parent.exists() {
                return Err(RendezvousError::ContainerNotFound(parent.to_path_buf()));
            }
        }
        for sub in Subdir::ALL {
            fs::create_dir_all(root.join(sub.as_str()))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, sub: Subdir) -> PathBuf {
        self.root.join(sub.as_str())
    }

    fn resolve(&self, sub: Subdir, name: &str) -> Result<PathBuf> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
        {
            return Err(RendezvousError::InvalidDir(name.to_string()));
        }
        Ok(self.dir(sub).join(name))
    }

    /// Write `bytes` under `name`, atomically with respect to readers.
    pub fn write_atomic(&self, sub: Subdir, name: &str, bytes: &[u8]) -> Result<()> {
        let target = self.resolve(sub, name)?;
        let dir = self.dir(sub);
        if !dir.exists() {
            return Err(RendezvousError::ContainerNotFound(dir));
        }
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn read(&self, sub: Subdir, name: &str) -> Result<Vec<u8>> {
        let path = self.resolve(sub, name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(RendezvousError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, sub: Subdir, name: &str) -> Result<bool> {
        Ok(self.resolve(sub, name)?.exists())
    }

    /// Remove an entry. Deleting a name that is already gone is fine:
    /// delete-on-consume channels may race session-scoped cleanup.
    pub fn delete(&self, sub: Subdir, name: &str) -> Result<()> {
        let path = self.resolve(sub, name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// List entries with their modification times, oldest first.
    pub fn list(&self, sub: Subdir) -> Result<Vec<(String, SystemTime)>> {
        let dir = self.dir(sub);
        if !dir.exists() {
            return Err(RendezvousError::ContainerNotFound(dir));
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = match entry.metadata() {
                Ok(m) => m,
                // Entry vanished between readdir and stat; another lane
                // consumed it.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let mtime = meta.modified()?;
            entries.push((name, mtime));
        }
        entries.sort_by_key(|(_, mtime)| *mtime);
        Ok(entries)
    }

    pub fn mtime(&self, sub: Subdir, name: &str) -> Result<Option<SystemTime>> {
        let path = self.resolve(sub, name)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, RendezvousStore) {
        let dir = TempDir::new().unwrap();
        let store = RendezvousStore::open(dir.path().join("bridge")).unwrap();
        (dir, store)
    }

    #[test]
    fn open_creates_all_subdirs() {
        let (_dir, store) = store();
        for sub in Subdir::ALL {
            assert!(store.root().join(sub.as_str()).is_dir());
        }
    }

    #[test]
    fn open_fails_without_container() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("no").join("such").join("bridge");
        let err = RendezvousStore::open(missing).unwrap_err();
        assert!(matches!(err, RendezvousError::ContainerNotFound(_)));
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, store) = store();
        store
            .write_atomic(Subdir::Control, "status.json", b"{\"ok\":true}")
            .unwrap();
        let bytes = store.read(Subdir::Control, "status.json").unwrap();
        assert_eq!(bytes, b"{\"ok\":true}");
    }

    #[test]
    fn write_replaces_existing_entry() {
        let (_dir, store) = store();
        store.write_atomic(Subdir::Control, "x.json", b"one").unwrap();
        store.write_atomic(Subdir::Control, "x.json", b"two").unwrap();
        assert_eq!(store.read(Subdir::Control, "x.json").unwrap(), b"two");
    }

    #[test]
    fn read_missing_is_not_found() {
        let (_dir, store) = store();
        let err = store.read(Subdir::Audio, "nope.pcm").unwrap_err();
        assert!(matches!(err, RendezvousError::NotFound(_)));
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = store();
        store.write_atomic(Subdir::Audio, "a.pcm", b"x").unwrap();
        store.delete(Subdir::Audio, "a.pcm").unwrap();
        store.delete(Subdir::Audio, "a.pcm").unwrap();
        assert!(!store.exists(Subdir::Audio, "a.pcm").unwrap());
    }

    #[test]
    fn names_cannot_escape_the_root() {
        let (_dir, store) = store();
        for bad in ["../evil", "a/b", "a\\b", ""] {
            let err = store.write_atomic(Subdir::Audio, bad, b"x").unwrap_err();
            assert!(matches!(err, RendezvousError::InvalidDir(_)), "{bad}");
        }
    }

    #[test]
    fn list_orders_by_mtime() {
        let (_dir, store) = store();
        store.write_atomic(Subdir::Audio, "first.pcm", b"1").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        store.write_atomic(Subdir::Audio, "second.pcm", b"2").unwrap();
        let names: Vec<String> = store
            .list(Subdir::Audio)
            .unwrap()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(names, vec!["first.pcm", "second.pcm"]);
    }

    #[test]
    fn mtime_of_missing_entry_is_none() {
        let (_dir, store) = store();
        assert!(store.mtime(Subdir::Transcripts, "gone.json").unwrap().is_none());
    }
}

//! Selector choice persistence.
//!
//! # Responsibilities
//! - Remember which member each Selector group has pinned
//! - Persist the map as JSON so choices survive restarts
//!
//! # Design Decisions
//! - Written through on every change; the map is tiny
//! - A missing or unreadable file starts an empty cache
//! - The file path is kept even while persistence is off, so a reload can
//!   switch writing back on
//! - Writes go to a temporary file first, then rename

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

/// Thread-safe group → member map backed by a JSON file.
#[derive(Debug, Clone, Default)]
pub struct SelectionCache {
    inner: Arc<DashMap<String, String>>,
    path: Option<PathBuf>,
    persist: Arc<AtomicBool>,
}

impl SelectionCache {
    /// Cache that never touches disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path` if it exists.
    pub fn load_from_file(path: impl Into<PathBuf>) -> Self {
        Self::open(path, true)
    }

    /// Cache bound to `path`. The file is read and written only while
    /// `persist` is on.
    pub fn open(path: impl Into<PathBuf>, persist: bool) -> Self {
        let path = path.into();
        let cache = Self {
            inner: Arc::new(DashMap::new()),
            path: Some(path.clone()),
            persist: Arc::new(AtomicBool::new(persist)),
        };
        if !persist {
            return cache;
        }
        match read_map(&path) {
            Ok(Some(map)) => {
                for (group, member) in map {
                    cache.inner.insert(group, member);
                }
                tracing::info!(path = %path.display(), entries = cache.inner.len(), "Loaded selection cache");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable selection cache");
            }
        }
        cache
    }

    pub fn persists(&self) -> bool {
        self.path.is_some() && self.persist.load(Ordering::Relaxed)
    }

    /// Turn writing to disk on or off. Shared by every clone.
    pub fn set_persist(&self, persist: bool) {
        self.persist.store(persist, Ordering::Relaxed);
    }

    pub fn get_selected(&self, group: &str) -> Option<String> {
        self.inner.get(group).map(|r| r.value().clone())
    }

    /// Record a choice and write it through.
    pub fn set_selected(&self, group: &str, member: &str) {
        self.inner.insert(group.to_string(), member.to_string());
        if !self.persists() {
            return;
        }
        if let Err(e) = self.save_to_file() {
            tracing::warn!(error = %e, "Failed to persist selection cache");
        }
    }

    /// Snapshot of all choices.
    pub fn selections(&self) -> BTreeMap<String, String> {
        self.inner
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    pub fn save_to_file(&self) -> io::Result<()> {
        let Some(path) = self.path.as_ref().filter(|_| self.persists()) else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&self.selections())?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn read_map(path: &Path) -> io::Result<Option<BTreeMap<String, String>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

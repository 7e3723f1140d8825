//! Readiness state machine around a [`JournalStore`].
//!
//! The tier starts in [`TierState::Starting`]; readers wait on a watch channel
//! until initialization has run and moved it to [`TierState::Ready`], whether
//! or not a store could actually be opened. A tier that failed to open stays
//! `Ready` with no store and every operation degrades to a miss or a no-op.

use super::hash::DiskKey;
use super::store::{JournalStore, Snapshot};
use crate::Error;
use parking_lot::RwLock;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, watch};

/// Readiness of a persistent tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TierState {
    /// Initialization (or a clear) is in progress; readers wait.
    Starting,
    /// Readers may proceed; the store may still be absent.
    Ready,
}

/// Lazily opened on-disk tier.
#[derive(Debug)]
pub struct PersistentTier {
    dir: PathBuf,
    budget: u64,
    version: u32,
    clear_on_start: bool,
    enabled: bool,
    state: watch::Sender<TierState>,
    store: RwLock<Option<JournalStore>>,
    /// Serializes init, evict and close.
    lifecycle: Mutex<()>,
    initialized: AtomicBool,
    cleared_on_start: AtomicBool,
}

impl PersistentTier {
    pub fn new(dir: impl Into<PathBuf>, budget: u64, version: u32, clear_on_start: bool) -> Self {
        let (state, _) = watch::channel(TierState::Starting);
        Self {
            dir: dir.into(),
            budget,
            version,
            clear_on_start,
            enabled: true,
            state,
            store: RwLock::new(None),
            lifecycle: Mutex::new(()),
            initialized: AtomicBool::new(false),
            cleared_on_start: AtomicBool::new(false),
        }
    }

    /// A tier that is permanently ready and never stores anything.
    pub fn disabled() -> Self {
        let mut tier = Self::new(PathBuf::new(), 0, 0, false);
        tier.enabled = false;
        tier.initialized.store(true, Ordering::Release);
        tier.state.send_replace(TierState::Ready);
        tier
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> TierState {
        *self.state.borrow()
    }

    /// Whether a store is currently open.
    pub fn is_available(&self) -> bool {
        self.store.read().is_some()
    }

    /// Open the store. Idempotent until [`close`](Self::close).
    ///
    /// Never fails: any problem leaves the tier ready without a store.
    pub async fn init(&self) {
        let _guard = self.lifecycle.lock().await;
        if self.initialized.load(Ordering::Acquire) {
            return;
        }

        let store = self.open_store().await;
        let store = match store {
            Some(store) if self.clear_on_start && !self.cleared_on_start.swap(true, Ordering::AcqRel) => {
                tracing::info!(dir = %self.dir.display(), "Clearing store on start");
                self.reopen_cleared(store).await
            }
            other => other,
        };

        *self.store.write() = store;
        self.initialized.store(true, Ordering::Release);
        self.state.send_replace(TierState::Ready);
    }

    async fn open_store(&self) -> Option<JournalStore> {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            tracing::warn!(dir = %self.dir.display(), error = %e, "Cannot create store directory, disk tier disabled");
            return None;
        }

        match crate::sys::available_space(&self.dir) {
            Ok(available) if available <= self.budget => {
                let err = Error::InsufficientSpace { available, required: self.budget };
                tracing::warn!(dir = %self.dir.display(), error = %err, "Disk tier disabled");
                return None;
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(dir = %self.dir.display(), error = %e, "Free space unknown, opening anyway"),
        }

        match JournalStore::open(&self.dir, self.version, self.budget).await {
            Ok(store) => {
                tracing::debug!(dir = %self.dir.display(), budget = self.budget, "Disk tier ready");
                Some(store)
            }
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "Cannot open store, disk tier disabled");
                None
            }
        }
    }

    async fn reopen_cleared(&self, store: JournalStore) -> Option<JournalStore> {
        if let Err(e) = store.destroy().await {
            tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to destroy store");
        }
        self.open_store().await
    }

    async fn wait_ready(&self) {
        let mut rx = self.state.subscribe();
        // the sender lives as long as self
        let _ = rx.wait_for(|state| *state == TierState::Ready).await;
    }

    /// Wait for readiness and return the open store, if any.
    pub async fn store(&self) -> Option<JournalStore> {
        self.wait_ready().await;
        self.store.read().clone()
    }

    /// Committed bytes for `key`; failures are misses.
    pub async fn get(&self, key: &DiskKey) -> Option<Snapshot> {
        let store = self.store().await?;
        match store.get(key).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::debug!(disk_key = %key, error = %e, "Disk tier read failed");
                None
            }
        }
    }

    /// Store `bytes` under `key` unless an entry already exists or another
    /// write of the same key is pending. Returns whether bytes were written.
    pub async fn put_if_absent(&self, key: &DiskKey, bytes: &[u8]) -> bool {
        let Some(store) = self.store().await else {
            return false;
        };

        match write_if_absent(&store, key, bytes).await {
            Ok(written) => written,
            Err(e) => {
                tracing::warn!(disk_key = %key, error = %e, "Disk tier write failed");
                false
            }
        }
    }

    /// Destroy all entries and reopen an empty store.
    ///
    /// Readers arriving meanwhile wait for the reopened store.
    pub async fn evict(&self) {
        let _guard = self.lifecycle.lock().await;
        if !self.initialized.load(Ordering::Acquire) {
            return;
        }
        self.state.send_replace(TierState::Starting);

        let current = self.store.write().take();
        let reopened = match current {
            Some(store) => self.reopen_cleared(store).await,
            None => None,
        };

        *self.store.write() = reopened;
        self.state.send_replace(TierState::Ready);
        tracing::debug!(dir = %self.dir.display(), "Disk tier cleared");
    }

    /// Checkpoint the journal.
    pub async fn flush(&self) {
        let Some(store) = self.store.read().clone() else {
            return;
        };
        if let Err(e) = store.flush().await {
            tracing::warn!(dir = %self.dir.display(), error = %e, "Disk tier flush failed");
        }
    }

    /// Release the store; the tier is absent until the next [`init`](Self::init).
    pub async fn close(&self) {
        let _guard = self.lifecycle.lock().await;
        if !self.enabled {
            return;
        }
        let current = self.store.write().take();
        if let Some(store) = current {
            if let Err(e) = store.close().await {
                tracing::warn!(dir = %self.dir.display(), error = %e, "Disk tier close failed");
            }
        }
        self.initialized.store(false, Ordering::Release);
    }

    /// Stored payload bytes, zero without a store.
    pub async fn size_bytes(&self) -> u64 {
        let store = self.store.read().clone();
        match store {
            Some(store) => store.size_bytes().await.unwrap_or(0),
            None => 0,
        }
    }
}

async fn write_if_absent(store: &JournalStore, key: &DiskKey, bytes: &[u8]) -> Result<bool, Error> {
    // Holding the editor first makes the existence check race-free.
    let Some(mut editor) = store.edit(key)? else {
        return Ok(false);
    };
    if store.contains(key).await? {
        editor.abort();
        return Ok(false);
    }
    editor.write_all(bytes)?;
    editor.commit().await?;
    Ok(true)
}

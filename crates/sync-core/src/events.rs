//! Sync status and progress events.
//!
//! `EventBus` fans `SyncProgress` out to every subscriber. Progress is
//! best-effort telemetry; the authoritative outcome of a cycle is its
//! `SyncResult`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Phase of the sync state machine.
///
/// `Idle → Connecting → Scanning → Uploading → Downloading → Done → Idle`,
/// with `Error` reachable from any phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Connecting,
    Scanning,
    Uploading,
    Downloading,
    Done,
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Connecting => "connecting",
            SyncStatus::Scanning => "scanning",
            SyncStatus::Uploading => "uploading",
            SyncStatus::Downloading => "downloading",
            SyncStatus::Done => "done",
            SyncStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A progress update, emitted on every phase transition and per-file completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub status: SyncStatus,
    pub current: usize,
    pub total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncProgress {
    /// A phase transition with no per-file detail.
    pub fn phase(status: SyncStatus) -> Self {
        Self {
            status,
            current: 0,
            total: 0,
            file_name: None,
            error: None,
        }
    }

    /// Per-file progress within a phase.
    pub fn file(status: SyncStatus, current: usize, total: usize, file_name: &str) -> Self {
        Self {
            status,
            current,
            total,
            file_name: Some(file_name.to_string()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::phase(SyncStatus::Error)
        }
    }
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(SyncProgress) + Send + Sync>;

/// Event bus for publishing progress to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to progress. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(SyncProgress) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run while emit holds the read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Emit progress to all subscribers.
    pub fn emit(&self, progress: SyncProgress) {
        // Snapshot so a callback can subscribe without deadlocking
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(progress.clone());
        }
    }
}

//! The sync cycle state machine.
//!
//! One `SyncOrchestrator` owns all engine state for an open vault: the
//! relay session, the status cell, and the cycle guard. A cycle scans the
//! vault, diffs it against the relay's manifest, transfers files in bounded
//! batches, resolves conflicts one at a time, applies deletions, and
//! persists the merged manifest.

use crate::batch::run_batched;
use crate::config::{ConfigError, DeleteMode, SyncSettings};
use crate::relay::{ConnectionState, RelayClient, RelayError, RelayNotification, RelayTimeouts, UploadRequest};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use sync_core::crypto::{self, CryptoError, KdfParams, VaultKey};
use sync_core::diff::diff;
use sync_core::events::{EventBus, Subscription, SyncProgress, SyncStatus};
use sync_core::fs::{FileSystem, FsError, now_millis};
use sync_core::manifest::{FileInfo, Manifest, ManifestError, ManifestStore, scan_file};
use sync_core::protocol::RemoteEntry;
use sync_core::rules::ScanRules;
use sync_core::trash::{free_conflict_copy_path, move_to_sync_trash};
use sync_core::vault_id::{VaultId, VaultIdError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync already in progress")]
    AlreadyInProgress,

    #[error("Vault is not configured; run init or join first")]
    NotConfigured,

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Failed to read {path}: {source}")]
    LocalRead { path: String, source: FsError },

    #[error("Failed to write {path}: {source}")]
    LocalWrite { path: String, source: FsError },

    #[error(transparent)]
    VaultId(#[from] VaultIdError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Key derivation task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Whether this error ends the whole cycle rather than one file.
    ///
    /// Connection failures, decryption failures, and local write failures
    /// are fatal. A relay `error` reply or an unreadable local file only
    /// fails that file.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Relay(e) => e.is_connection_error(),
            SyncError::LocalRead { .. } => false,
            _ => true,
        }
    }
}

/// Outcome of one `sync()` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub uploaded: usize,
    pub downloaded: usize,
    pub conflicts: usize,
    pub deleted_local: usize,
    pub deleted_remote: usize,
    /// Paths that failed without aborting the cycle
    pub failed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }
}

/// Key material and relay connection for one vault.
struct Session {
    vault_id: VaultId,
    key: VaultKey,
    relay: RelayClient,
}

/// A session plus its notification stream, not yet installed.
type OpenedSession = (Session, mpsc::UnboundedReceiver<RelayNotification>);

struct StatusCell {
    status: SyncStatus,
    /// Bumped on every change so a delayed relax can tell it went stale
    epoch: u64,
}

#[derive(Default)]
struct Tasks {
    auto_sync: Option<JoinHandle<()>>,
    notifications: Option<JoinHandle<()>>,
    debounce: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for task in [
            self.auto_sync.take(),
            self.notifications.take(),
            self.debounce.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

/// Per-phase progress counter.
struct PhaseProgress<'a> {
    events: &'a EventBus,
    status: SyncStatus,
    total: usize,
    done: AtomicUsize,
}

impl<'a> PhaseProgress<'a> {
    fn new(events: &'a EventBus, status: SyncStatus, total: usize) -> Self {
        Self {
            events,
            status,
            total,
            done: AtomicUsize::new(0),
        }
    }

    fn file_done(&self, path: &str) {
        let current = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        self.events
            .emit(SyncProgress::file(self.status, current, self.total, path));
    }
}

/// Owns the sync engine for one vault.
pub struct SyncOrchestrator<F: FileSystem + 'static> {
    fs: F,
    settings: RwLock<SyncSettings>,
    store: ManifestStore,
    session: RwLock<Option<Arc<Session>>>,
    cycle: tokio::sync::Mutex<()>,
    status: Mutex<StatusCell>,
    events: Arc<EventBus>,
    tasks: Mutex<Tasks>,
    self_ref: Weak<Self>,
}

impl<F: FileSystem + 'static> SyncOrchestrator<F> {
    pub fn new(fs: F, settings: SyncSettings) -> Arc<Self> {
        let store = ManifestStore::new(ScanRules::new(settings.exclude.clone()));
        Arc::new_cyclic(|self_ref| Self {
            fs,
            settings: RwLock::new(settings),
            store,
            session: RwLock::new(None),
            cycle: tokio::sync::Mutex::new(()),
            status: Mutex::new(StatusCell {
                status: SyncStatus::Idle,
                epoch: 0,
            }),
            events: Arc::new(EventBus::new()),
            tasks: Mutex::new(Tasks::default()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    /// Current settings, including the vault ID once `init`/`join` succeeded.
    pub fn settings(&self) -> SyncSettings {
        self.settings.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn vault_id(&self) -> Option<VaultId> {
        self.session().map(|s| s.vault_id)
    }

    pub fn status(&self) -> SyncStatus {
        self.status_cell().status
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session()
            .map(|s| s.relay.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Receive progress for every phase transition and file completion.
    pub fn subscribe(&self, callback: impl Fn(SyncProgress) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(callback)
    }

    // ------------------------------------------------------------------
    // Vault registration
    // ------------------------------------------------------------------

    /// Create a new vault: generate its ID, derive the key, connect, and
    /// write the initial manifest (merged with any existing one).
    pub async fn init(&self, passphrase: &str, relay_url: &str) -> Result<VaultId, SyncError> {
        let vault_id = VaultId::generate();
        info!("Initializing vault {}", vault_id);

        let opened = self.open_session(vault_id, passphrase, relay_url).await?;
        opened.0.relay.connect().await?;

        let mut manifest = self.store.build(&self.fs, &vault_id.to_string()).await?;
        if let Some(existing) = self.store.load(&self.fs).await {
            manifest.merge_synced_at(&existing);
            manifest.last_sync_time = existing.last_sync_time;
        }
        self.store.save(&self.fs, &manifest).await?;

        self.install_session(opened, relay_url);
        Ok(vault_id)
    }

    /// Join an existing vault by ID. Returns whether the relay accepted the connection.
    pub async fn join(&self, vault_id: &str, passphrase: &str, relay_url: &str) -> bool {
        let result = async {
            let vault_id: VaultId = vault_id.parse()?;
            let opened = self.open_session(vault_id, passphrase, relay_url).await?;
            opened.0.relay.connect().await?;
            Ok::<_, SyncError>(opened)
        }
        .await;

        match result {
            Ok(opened) => {
                info!("Joined vault {}", opened.0.vault_id);
                self.install_session(opened, relay_url);
                true
            }
            Err(e) => {
                error!("Failed to join vault: {}", e);
                false
            }
        }
    }

    /// Derive the key for the configured vault without connecting.
    pub async fn unlock(&self, passphrase: &str) -> Result<VaultId, SyncError> {
        let settings = self.settings();
        let (Some(vault_id), Some(relay_url)) = (settings.vault_id, settings.relay_url) else {
            return Err(SyncError::NotConfigured);
        };

        let opened = self.open_session(vault_id, passphrase, &relay_url).await?;
        self.install_session(opened, &relay_url);
        Ok(vault_id)
    }

    async fn open_session(
        &self,
        vault_id: VaultId,
        passphrase: &str,
        relay_url: &str,
    ) -> Result<OpenedSession, SyncError> {
        let settings = self.settings();
        let key = derive_key_blocking(passphrase, vault_id, settings.kdf).await?;
        let (relay, notifications) = RelayClient::new(
            relay_url,
            vault_id.to_string(),
            RelayTimeouts::from(&settings.timing),
        );
        Ok((
            Session {
                vault_id,
                key,
                relay,
            },
            notifications,
        ))
    }

    fn install_session(
        &self,
        (session, notifications): OpenedSession,
        relay_url: &str,
    ) {
        {
            let mut settings = self.settings.write().unwrap_or_else(|e| e.into_inner());
            settings.vault_id = Some(session.vault_id);
            settings.relay_url = Some(relay_url.to_string());
        }
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(session));

        // The listener only holds a weak handle
        let listener = tokio::spawn(listen_for_notifications(self.self_ref.clone(), notifications));
        if let Some(old) = self.tasks().notifications.replace(listener) {
            old.abort();
        }
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    fn status_cell(&self) -> MutexGuard<'_, StatusCell> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: SyncStatus) -> u64 {
        let epoch = {
            let mut cell = self.status_cell();
            cell.status = status;
            cell.epoch += 1;
            cell.epoch
        };
        debug!("Sync status: {}", status);
        epoch
    }

    fn enter_phase(&self, status: SyncStatus) {
        self.set_status(status);
        self.events.emit(SyncProgress::phase(status));
    }

    /// Return to idle after the relax delay unless another cycle moved on.
    fn schedule_relax(&self, epoch: u64) {
        let weak = self.self_ref.clone();
        let delay = self.settings().timing.done_relax();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(this) = weak.upgrade() else {
                return;
            };
            let relaxed = {
                let mut cell = this.status_cell();
                let stale = cell.epoch != epoch;
                if !stale && matches!(cell.status, SyncStatus::Done | SyncStatus::Error) {
                    cell.status = SyncStatus::Idle;
                    cell.epoch += 1;
                    true
                } else {
                    false
                }
            };
            if relaxed {
                this.events.emit(SyncProgress::phase(SyncStatus::Idle));
            }
        });
    }

    // ------------------------------------------------------------------
    // Sync cycle
    // ------------------------------------------------------------------

    /// Run one full sync cycle.
    ///
    /// Returns immediately with an error result if a cycle is already
    /// running. Never panics or propagates errors past this point.
    pub async fn sync(&self) -> SyncResult {
        let Ok(_cycle) = self.cycle.try_lock() else {
            debug!("Sync requested while a cycle is running");
            return SyncResult::failure(SyncError::AlreadyInProgress);
        };

        let mut result = SyncResult::default();
        match self.run_cycle(&mut result).await {
            Ok(()) => {
                result.success = true;
                info!(
                    "Sync complete: {} uploaded, {} downloaded, {} conflicts, {} deleted locally, {} deleted remotely, {} failed",
                    result.uploaded,
                    result.downloaded,
                    result.conflicts,
                    result.deleted_local,
                    result.deleted_remote,
                    result.failed.len()
                );
                let epoch = self.set_status(SyncStatus::Done);
                self.events.emit(SyncProgress::phase(SyncStatus::Done));
                self.schedule_relax(epoch);
            }
            Err(e) => {
                error!("Sync failed: {}", e);
                result.success = false;
                result.error = Some(e.to_string());
                let epoch = self.set_status(SyncStatus::Error);
                self.events.emit(SyncProgress::failed(e.to_string()));
                self.schedule_relax(epoch);
            }
        }
        result
    }

    async fn run_cycle(&self, result: &mut SyncResult) -> Result<(), SyncError> {
        let session = self.session().ok_or(SyncError::NotConfigured)?;
        let settings = self.settings();
        let vault_id = session.vault_id.to_string();

        self.enter_phase(SyncStatus::Connecting);
        session.relay.connect().await?;

        self.enter_phase(SyncStatus::Scanning);
        let previous = self.store.load(&self.fs).await;
        let mut local = self.store.build(&self.fs, &vault_id).await?;
        if let Some(previous) = &previous {
            local.merge_synced_at(previous);
            local.last_sync_time = previous.last_sync_time;
        }

        let entries = session.relay.get_manifest().await?;
        let remote = resolve_remote(&session, entries, &local, previous.as_ref())?;
        let plan = diff(&local, &remote, previous.as_ref());
        info!(
            "Plan: {} up, {} down, {} conflicts, {} delete local, {} delete remote",
            plan.to_upload.len(),
            plan.to_download.len(),
            plan.conflicts.len(),
            plan.to_delete_local.len(),
            plan.to_delete_remote.len()
        );

        // Working copy; replaces the persisted manifest at the end. Entries
        // pending a remote delete stay until the relay confirms it, so an
        // aborted cycle still retries the delete next time.
        let mut working = local.clone();
        let now = now_millis();
        for path in &plan.unchanged {
            if let Some(info) = working.files.get_mut(path) {
                info.synced_at = Some(now);
            }
        }
        if let Some(previous) = &previous {
            for path in &plan.to_delete_remote {
                if let Some(info) = previous.get(path) {
                    working.files.insert(path.clone(), info.clone());
                }
            }
        }

        let batch_size = settings.batch_size;

        // Uploads
        self.enter_phase(SyncStatus::Uploading);
        let progress = PhaseProgress::new(&self.events, SyncStatus::Uploading, plan.to_upload.len());
        let report = run_batched(
            &plan.to_upload,
            batch_size,
            |path| self.upload_file(&session, path, &progress),
            SyncError::is_fatal,
        )
        .await;
        let mut fatal = None;
        let attempted = report.results.len();
        for (path, outcome) in plan.to_upload.iter().zip(report.results) {
            match outcome {
                Ok(info) => {
                    working.files.insert(path.clone(), info);
                    result.uploaded += 1;
                }
                Err(e) => record_failure(path, e, &mut result.failed, &mut fatal),
            }
        }
        if report.aborted {
            warn!(
                "Stopped uploads after a fatal error; {} left for the next sync",
                plan.to_upload.len() - attempted
            );
        }
        if let Some(e) = fatal {
            return Err(self.abort(&working, e).await);
        }

        // Downloads
        self.enter_phase(SyncStatus::Downloading);
        let progress = PhaseProgress::new(
            &self.events,
            SyncStatus::Downloading,
            plan.to_download.len() + plan.conflicts.len(),
        );
        let report = run_batched(
            &plan.to_download,
            batch_size,
            |path| self.download_file(&session, path, remote.get(path), &progress),
            SyncError::is_fatal,
        )
        .await;
        let attempted = report.results.len();
        for (path, outcome) in plan.to_download.iter().zip(report.results) {
            match outcome {
                Ok(info) => {
                    working.files.insert(path.clone(), info);
                    result.downloaded += 1;
                }
                Err(e) => record_failure(path, e, &mut result.failed, &mut fatal),
            }
        }
        if report.aborted {
            warn!(
                "Stopped downloads after a fatal error; {} left for the next sync",
                plan.to_download.len() - attempted
            );
        }
        if let Some(e) = fatal {
            return Err(self.abort(&working, e).await);
        }

        // Conflicts, one at a time
        for path in &plan.conflicts {
            let (Some(local_info), Some(remote_info)) = (local.get(path), remote.get(path)) else {
                continue;
            };
            match self
                .resolve_conflict(&session, path, local_info, remote_info, &progress)
                .await
            {
                Ok(info) => {
                    working.files.insert(path.clone(), info);
                    result.conflicts += 1;
                }
                Err(e) => {
                    record_failure(path, e, &mut result.failed, &mut fatal);
                    if let Some(e) = fatal {
                        return Err(self.abort(&working, e).await);
                    }
                }
            }
        }

        // Deleted elsewhere
        for path in &plan.to_delete_local {
            match self.delete_local(path, settings.delete_mode).await {
                Ok(()) => {
                    working.files.remove(path);
                    result.deleted_local += 1;
                }
                Err(e) => {
                    warn!("Failed to remove {}: {}", path, e);
                    result.failed.push(path.clone());
                }
            }
        }

        // Deleted here
        for path in &plan.to_delete_remote {
            match session.relay.delete(&crypto::hash_path(path)).await {
                Ok(()) => {
                    debug!("Deleted {} from relay", path);
                    working.files.remove(path);
                    result.deleted_remote += 1;
                }
                Err(e) => {
                    record_failure(path, e.into(), &mut result.failed, &mut fatal);
                    if let Some(e) = fatal {
                        return Err(self.abort(&working, e).await);
                    }
                }
            }
        }

        working.last_sync_time = now_millis();
        self.store.save(&self.fs, &working).await?;
        Ok(())
    }

    /// Persist what completed before a fatal error, without advancing
    /// `lastSyncTime`, then hand the error back.
    async fn abort(&self, working: &Manifest, e: SyncError) -> SyncError {
        if let Err(save_err) = self.store.save(&self.fs, working).await {
            warn!("Failed to save partial manifest: {}", save_err);
        }
        e
    }

    async fn upload_file(
        &self,
        session: &Session,
        path: &str,
        progress: &PhaseProgress<'_>,
    ) -> Result<FileInfo, SyncError> {
        // Edits after this instant must look newer than the sync
        let started = now_millis();
        let content = self.fs.read(path).await.map_err(|source| SyncError::LocalRead {
            path: path.to_string(),
            source,
        })?;
        let stat = self.fs.stat(path).await.map_err(|source| SyncError::LocalRead {
            path: path.to_string(),
            source,
        })?;

        let hash = crypto::hash_content(&content);
        let payload = crypto::encrypt(&content, &session.key)?;
        let upload = UploadRequest {
            path: crypto::hash_path(path),
            original_path: crypto::seal_path(path, &session.key)?,
            iv: payload.iv.to_vec(),
            tag: payload.tag.to_vec(),
            data: payload.ciphertext,
            hash: hash.clone(),
            size: content.len() as u64,
            modified_at: stat.mtime_millis,
        };
        session.relay.upload(upload).await?;

        debug!("Uploaded {}", path);
        progress.file_done(path);
        Ok(FileInfo {
            hash,
            size: content.len() as u64,
            modified_at: stat.mtime_millis,
            synced_at: Some(started),
        })
    }

    async fn download_file(
        &self,
        session: &Session,
        path: &str,
        expected: Option<&FileInfo>,
        progress: &PhaseProgress<'_>,
    ) -> Result<FileInfo, SyncError> {
        let file = session.relay.download(&crypto::hash_path(path)).await?;
        let plaintext = crypto::decrypt(&file.data, &session.key, &file.iv, &file.tag)?;

        let hash = crypto::hash_content(&plaintext);
        if let Some(expected) = expected {
            if expected.hash != hash {
                warn!("{}: downloaded content does not match the relay's manifest hash", path);
            }
        }

        self.fs
            .write(path, &plaintext)
            .await
            .map_err(|source| SyncError::LocalWrite {
                path: path.to_string(),
                source,
            })?;

        let now = now_millis();
        debug!("Downloaded {}", path);
        progress.file_done(path);
        Ok(FileInfo {
            hash,
            size: plaintext.len() as u64,
            modified_at: now,
            synced_at: Some(now),
        })
    }

    /// Last writer wins; the remote side wins ties.
    async fn resolve_conflict(
        &self,
        session: &Session,
        path: &str,
        local: &FileInfo,
        remote: &FileInfo,
        progress: &PhaseProgress<'_>,
    ) -> Result<FileInfo, SyncError> {
        if remote.modified_at >= local.modified_at {
            info!("Conflict on {}: remote wins", path);
            self.keep_conflict_copy(path).await;
            self.download_file(session, path, Some(remote), progress).await
        } else {
            // The other device keeps its own copy when it sees this conflict
            info!("Conflict on {}: local wins", path);
            self.upload_file(session, path, progress).await
        }
    }

    /// Best-effort copy of the local side next to the file.
    async fn keep_conflict_copy(&self, path: &str) {
        let content = match self.fs.read(path).await {
            Ok(content) => content,
            Err(e) => {
                warn!("No local copy of {} to preserve: {}", path, e);
                return;
            }
        };

        let today = chrono::Local::now().date_naive();
        let copy_path = match free_conflict_copy_path(&self.fs, path, today).await {
            Ok(copy_path) => copy_path,
            Err(e) => {
                warn!("No free conflict copy name for {}: {}", path, e);
                return;
            }
        };
        match self.fs.write(&copy_path, &content).await {
            Ok(()) => info!("Preserved local version as {}", copy_path),
            Err(e) => warn!("Failed to write conflict copy {}: {}", copy_path, e),
        }
    }

    async fn delete_local(&self, path: &str, mode: DeleteMode) -> Result<(), FsError> {
        let result = match mode {
            DeleteMode::Remove => self.fs.delete(path).await,
            DeleteMode::Trash => move_to_sync_trash(&self.fs, path).await.map(|_| ()),
        };
        match result {
            // Already gone
            Err(FsError::NotFound(_)) => Ok(()),
            other => {
                if other.is_ok() {
                    info!("Removed {} (deleted on another device)", path);
                }
                other
            }
        }
    }

    // ------------------------------------------------------------------
    // Single-file push, scheduling
    // ------------------------------------------------------------------

    /// Upload one file outside a full cycle and record it in the manifest.
    ///
    /// Returns false without uploading when disconnected, while a cycle
    /// runs, for excluded paths, and for content the manifest already has.
    pub async fn push_file(&self, path: &str) -> bool {
        let Some(session) = self.session() else {
            return false;
        };
        if !session.relay.is_connected() || !self.store.rules().is_included(path) {
            return false;
        }
        let Ok(_cycle) = self.cycle.try_lock() else {
            debug!("Skipping push of {}: sync in progress", path);
            return false;
        };

        let mut manifest = self
            .store
            .load(&self.fs)
            .await
            .unwrap_or_else(|| Manifest::new(session.vault_id.to_string()));

        // Files a cycle just wrote come back through the watcher unchanged
        if let (Ok(current), Some(known)) = (scan_file(&self.fs, path).await, manifest.get(path)) {
            if current.hash == known.hash && known.synced_at.is_some() {
                debug!("Skipping push of {}: already synced", path);
                return false;
            }
        }

        let progress = PhaseProgress::new(&self.events, SyncStatus::Uploading, 1);
        let info = match self.upload_file(&session, path, &progress).await {
            Ok(info) => info,
            Err(e) => {
                debug!("Push of {} failed: {}", path, e);
                return false;
            }
        };
        manifest.files.insert(path.to_string(), info);
        if let Err(e) = self.store.save(&self.fs, &manifest).await {
            warn!("Pushed {} but failed to save manifest: {}", path, e);
        }
        true
    }

    /// Run a full cycle every `interval_secs`, skipping ticks while busy.
    pub fn start_auto_sync(&self, interval_secs: u64) {
        self.stop_auto_sync();

        let period = Duration::from_secs(interval_secs.max(1));
        let weak = self.self_ref.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let Some(this) = weak.upgrade() else {
                    break;
                };
                if this.status() != SyncStatus::Idle {
                    debug!("Auto-sync tick skipped: {}", this.status());
                    continue;
                }
                this.sync().await;
            }
        });

        info!("Auto-sync every {:?}", period);
        self.tasks().auto_sync = Some(task);
    }

    pub fn stop_auto_sync(&self) {
        if let Some(task) = self.tasks().auto_sync.take() {
            task.abort();
            debug!("Auto-sync stopped");
        }
    }

    /// React to a remote change: sync once the notification burst settles.
    ///
    /// Ignored while a cycle is running; that cycle observes the change.
    pub fn notify_remote_change(&self) {
        if self.cycle.try_lock().is_err() {
            debug!("Remote change during sync; ignoring");
            return;
        }

        let weak = self.self_ref.clone();
        let delay = self.settings().timing.notify_debounce();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(this) = weak.upgrade() {
                this.sync().await;
            }
        });

        if let Some(old) = self.tasks().debounce.replace(task) {
            old.abort();
        }
    }

    /// Stop timers and close the relay connection. An in-flight cycle is not interrupted.
    pub async fn disconnect(&self) {
        self.tasks().abort_all();
        if let Some(session) = self.session() {
            session.relay.disconnect().await;
        }
    }
}

impl<F: FileSystem + 'static> Drop for SyncOrchestrator<F> {
    fn drop(&mut self) {
        self.tasks().abort_all();
    }
}

async fn listen_for_notifications<F: FileSystem + 'static>(
    orchestrator: Weak<SyncOrchestrator<F>>,
    mut notifications: mpsc::UnboundedReceiver<RelayNotification>,
) {
    while let Some(notification) = notifications.recv().await {
        let Some(this) = orchestrator.upgrade() else {
            break;
        };
        match notification {
            RelayNotification::FileChanged => this.notify_remote_change(),
            RelayNotification::ConnectionLost => {
                warn!("Relay connection lost; the next sync will reconnect")
            }
        }
    }
}

async fn derive_key_blocking(
    passphrase: &str,
    vault_id: VaultId,
    kdf: KdfParams,
) -> Result<VaultKey, SyncError> {
    let passphrase = passphrase.to_string();
    let key = tokio::task::spawn_blocking(move || {
        crypto::derive_key_with(&passphrase, &vault_id.to_string(), &kdf)
    })
    .await
    .map_err(|e| SyncError::Task(e.to_string()))??;
    Ok(key)
}

fn record_failure(path: &str, e: SyncError, failed: &mut Vec<String>, fatal: &mut Option<SyncError>) {
    if e.is_fatal() {
        error!("{}: {}", path, e);
        if fatal.is_none() {
            *fatal = Some(e);
        }
    } else {
        warn!("{}: {}", path, e);
        failed.push(path.to_string());
    }
}

/// Map the relay's hashed-path manifest back to relative paths.
///
/// Paths come from the sealed `originalPath` token when present, otherwise
/// from paths this device already knows. Unresolvable entries are skipped.
fn resolve_remote(
    session: &Session,
    entries: BTreeMap<String, RemoteEntry>,
    local: &Manifest,
    previous: Option<&Manifest>,
) -> Result<Manifest, SyncError> {
    let known: HashMap<String, &String> = local
        .files
        .keys()
        .chain(previous.into_iter().flat_map(|p| p.files.keys()))
        .map(|p| (crypto::hash_path(p), p))
        .collect();

    let mut remote = Manifest::new(session.vault_id.to_string());
    for (hashed, entry) in entries {
        let path = match &entry.original_path {
            Some(token) => crypto::open_path(token, &session.key)?,
            None => match known.get(&hashed) {
                Some(path) => (*path).clone(),
                None => {
                    warn!("Skipping remote entry {} with no recoverable path", hashed);
                    continue;
                }
            },
        };

        if crypto::hash_path(&path) != hashed {
            warn!("Skipping remote entry {}: path does not match its hash", hashed);
            continue;
        }

        remote.files.insert(
            path,
            FileInfo {
                hash: entry.hash,
                size: entry.size,
                modified_at: entry.modified_at,
                synced_at: None,
            },
        );
    }
    Ok(remote)
}

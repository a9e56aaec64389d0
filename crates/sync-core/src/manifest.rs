//! Manifest: per-file metadata snapshot of a vault.
//!
//! The local manifest is persisted at `.sync/manifest.json` and carries
//! `syncedAt` provenance from cycle to cycle. A remote manifest is rebuilt
//! from the relay every cycle and never has `syncedAt` set.

use crate::crypto::hash_content;
use crate::fs::{FileSystem, FsError};
use crate::rules::{MANIFEST_PATH, SYNC_DIR, ScanRules};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// Metadata of a single synced file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// SHA-256 hex of the plaintext content
    pub hash: String,
    pub size: u64,
    /// Modification time, ms since epoch
    pub modified_at: u64,
    /// When this content was last confirmed synced. `None` = never.
    pub synced_at: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Keyed by vault-relative path
    pub files: BTreeMap<String, FileInfo>,
    pub last_sync_time: u64,
    pub vault_id: String,
}

impl Manifest {
    pub fn new(vault_id: impl Into<String>) -> Self {
        Self {
            files: BTreeMap::new(),
            last_sync_time: 0,
            vault_id: vault_id.into(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&FileInfo> {
        self.files.get(path)
    }

    /// Carry `synced_at` forward from a previously persisted manifest.
    ///
    /// Hashes, sizes, and mtimes stay as freshly scanned; only sync
    /// provenance survives. Entries missing from `self` are not resurrected.
    pub fn merge_synced_at(&mut self, previous: &Manifest) {
        for (path, info) in self.files.iter_mut() {
            if let Some(prev) = previous.files.get(path) {
                info.synced_at = prev.synced_at;
            }
        }
    }

    /// Mark `path` as confirmed synced at `now` with the given content.
    pub fn record_synced(&mut self, path: &str, hash: String, size: u64, modified_at: u64, now: u64) {
        self.files.insert(
            path.to_string(),
            FileInfo {
                hash,
                size,
                modified_at,
                synced_at: Some(now),
            },
        );
    }
}

/// Builds, loads, and persists manifests through a [`FileSystem`].
#[derive(Debug, Clone, Default)]
pub struct ManifestStore {
    rules: ScanRules,
}

impl ManifestStore {
    pub fn new(rules: ScanRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ScanRules {
        &self.rules
    }

    /// Scan the vault and hash every included file.
    ///
    /// Files that vanish or can't be read mid-scan are skipped. Only failure
    /// to list the vault root is an error.
    pub async fn build<F: FileSystem + ?Sized>(&self, fs: &F, vault_id: &str) -> Result<Manifest> {
        let mut manifest = Manifest::new(vault_id);
        let mut dirs_to_visit = vec![String::new()];

        while let Some(dir) = dirs_to_visit.pop() {
            let entries = match fs.list(&dir).await {
                Ok(entries) => entries,
                Err(e) if dir.is_empty() => return Err(e.into()),
                Err(e) => {
                    warn!("Skipping unreadable directory {}: {}", dir, e);
                    continue;
                }
            };

            for entry in entries {
                let path = if dir.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}/{}", dir, entry.name)
                };

                if entry.is_dir {
                    if self.rules.should_descend(&path) {
                        dirs_to_visit.push(path);
                    }
                } else if self.rules.is_included(&path) {
                    match scan_file(fs, &path).await {
                        Ok(info) => {
                            manifest.files.insert(path, info);
                        }
                        Err(e) => warn!("Skipping {} during scan: {}", path, e),
                    }
                }
            }
        }

        debug!("Scanned {} files", manifest.files.len());
        Ok(manifest)
    }

    /// Load the persisted manifest.
    ///
    /// `None` when absent or unreadable; a fresh vault is not an error.
    pub async fn load<F: FileSystem + ?Sized>(&self, fs: &F) -> Option<Manifest> {
        let bytes = match fs.read(MANIFEST_PATH).await {
            Ok(bytes) => bytes,
            Err(FsError::NotFound(_)) => return None,
            Err(e) => {
                warn!("Failed to read manifest: {}", e);
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!("Ignoring malformed manifest: {}", e);
                None
            }
        }
    }

    /// Persist the manifest as pretty JSON.
    ///
    /// Writes a temp file and renames it over the old manifest, so a crash
    /// mid-write leaves the previous manifest intact.
    pub async fn save<F: FileSystem + ?Sized>(&self, fs: &F, manifest: &Manifest) -> Result<()> {
        let json = serde_json::to_vec_pretty(manifest)?;
        let tmp_path = format!("{}.tmp", MANIFEST_PATH);

        fs.mkdir(SYNC_DIR).await?;
        fs.write(&tmp_path, &json).await?;
        fs.rename(&tmp_path, MANIFEST_PATH).await?;

        debug!("Saved manifest with {} files", manifest.files.len());
        Ok(())
    }
}

/// Hash and stat one file. `synced_at` starts unset.
pub async fn scan_file<F: FileSystem + ?Sized>(fs: &F, path: &str) -> std::result::Result<FileInfo, FsError> {
    let content = fs.read(path).await?;
    let stat = fs.stat(path).await?;

    Ok(FileInfo {
        hash: hash_content(&content),
        size: content.len() as u64,
        modified_at: stat.mtime_millis,
        synced_at: None,
    })
}

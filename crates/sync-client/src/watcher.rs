//! Vault file watcher.
//!
//! Saves are reported as soon as they settle so the CLI can push them
//! without waiting for the next full cycle. Only paths the scanner would
//! include are reported.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{DebouncedEvent, Debouncer, new_debouncer};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use sync_core::rules::ScanRules;
use tokio::sync::mpsc;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Vault-relative path with `/` separators
    pub path: String,
    pub kind: FileEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// Created or modified
    Modified,
    Deleted,
}

/// Last mtime reported per path; some mounts repeat events for untouched files
type MtimeCache = Arc<Mutex<HashMap<String, SystemTime>>>;

pub struct FileWatcher {
    vault_path: PathBuf,
    _debouncer: Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

impl FileWatcher {
    /// Watch `vault_path` recursively, settling events for `settle`.
    pub fn new(vault_path: PathBuf, rules: ScanRules, settle: Duration) -> Result<Self> {
        // FSEvents reports real paths, so /var must become /private/var
        let vault_path = vault_path.canonicalize().unwrap_or(vault_path);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root = vault_path.clone();
        let mtimes: MtimeCache = Arc::default();

        let mut debouncer = new_debouncer(
            settle,
            move |result: std::result::Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    for event in events {
                        let Some(file_event) = classify(&event.path, &root, &rules, &mtimes) else {
                            continue;
                        };
                        if event_tx.send(file_event).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            },
        )?;

        debouncer
            .watcher()
            .watch(&vault_path, RecursiveMode::Recursive)?;

        Ok(Self {
            vault_path,
            _debouncer: debouncer,
            event_rx,
        })
    }

    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }
}

/// Turn a raw path into a vault event, or `None` when it should be ignored.
fn classify(path: &Path, root: &Path, rules: &ScanRules, mtimes: &MtimeCache) -> Option<FileEvent> {
    let relative = relative_path(path, root)?;
    if !rules.is_included(&relative) {
        return None;
    }

    let mut cache = mtimes.lock().unwrap_or_else(|e| e.into_inner());
    let kind = match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => return None,
        Ok(meta) => {
            if let Ok(mtime) = meta.modified() {
                if cache.get(&relative) == Some(&mtime) {
                    return None;
                }
                cache.insert(relative.clone(), mtime);
            }
            FileEventKind::Modified
        }
        Err(_) => {
            cache.remove(&relative);
            FileEventKind::Deleted
        }
    };

    debug!("File event: {:?} {}", kind, relative);
    Some(FileEvent {
        path: relative,
        kind,
    })
}

fn relative_path(path: &Path, root: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::rules::ExcludeConfig;
    use tempfile::TempDir;

    fn rules() -> ScanRules {
        ScanRules::new(ExcludeConfig::default())
    }

    #[test]
    fn test_classify_filters_and_dedupes() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("notes")).unwrap();
        std::fs::write(root.join("notes/a.md"), "x").unwrap();
        std::fs::write(root.join("notes/a.md.tmp"), "x").unwrap();
        std::fs::create_dir_all(root.join(".sync")).unwrap();
        std::fs::write(root.join(".sync/manifest.json"), "{}").unwrap();

        let mtimes = MtimeCache::default();
        let event = classify(&root.join("notes/a.md"), root, &rules(), &mtimes).unwrap();
        assert_eq!(event.path, "notes/a.md");
        assert_eq!(event.kind, FileEventKind::Modified);

        // Same mtime again is spurious
        assert!(classify(&root.join("notes/a.md"), root, &rules(), &mtimes).is_none());

        assert!(classify(&root.join("notes/a.md.tmp"), root, &rules(), &mtimes).is_none());
        assert!(classify(&root.join(".sync/manifest.json"), root, &rules(), &mtimes).is_none());
        assert!(classify(&root.join("notes"), root, &rules(), &mtimes).is_none());
    }

    #[test]
    fn test_classify_deleted() {
        let temp = TempDir::new().unwrap();
        let mtimes = MtimeCache::default();
        let event = classify(&temp.path().join("gone.md"), temp.path(), &rules(), &mtimes).unwrap();
        assert_eq!(event.kind, FileEventKind::Deleted);
    }

    #[tokio::test]
    async fn test_watcher_reports_saves() {
        let temp = TempDir::new().unwrap();
        let mut watcher = FileWatcher::new(
            temp.path().to_path_buf(),
            rules(),
            Duration::from_millis(50),
        )
        .unwrap();

        // Let the backend start watching
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(temp.path().join("fresh.md"), "hello").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), watcher.event_rx().recv())
            .await
            .expect("watcher timed out")
            .expect("channel closed");
        assert_eq!(event.path, "fresh.md");
        assert_eq!(event.kind, FileEventKind::Modified);
    }
}

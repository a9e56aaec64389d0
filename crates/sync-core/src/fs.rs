//! FileSystem trait abstraction for vault file operations.
//!
//! All paths are vault-relative and `/`-separated.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in sync-client) - Uses tokio::fs

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Not a directory: {0}")]
    NotDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction rooted at the vault.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Move a file, replacing any existing file at `to`.
    ///
    /// Creates parent directories of `to` as needed. Replacement is atomic on
    /// native filesystems, which is what makes manifest saves crash-safe.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<HashMap<String, Vec<u8>>>,
    dirs: RwLock<HashSet<String>>,
    /// Tracks file modification times (path -> mtime in ms)
    mtimes: RwLock<HashMap<String, u64>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = HashSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(HashMap::new()),
            dirs: RwLock::new(dirs),
            mtimes: RwLock::new(HashMap::new()),
        }
    }

    /// Set a specific mtime, for driving last-writer-wins scenarios
    pub fn set_mtime(&self, path: &str, mtime: u64) {
        let path = Self::normalize_path(path);
        self.mtimes.write().unwrap().insert(path, mtime);
    }

    /// Snapshot of all file paths (sorted), for assertions
    pub fn file_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.read().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        let normalized = Self::normalize_path(path);
        if normalized.is_empty() {
            None
        } else {
            match normalized.rfind('/') {
                Some(pos) => Some(normalized[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }

    fn ensure_dirs(&self, path: &str) {
        let mut dirs = self.dirs.write().unwrap();
        let mut current = Some(Self::normalize_path(path));
        while let Some(dir) = current {
            current = Self::parent_path(&dir);
            dirs.insert(dir);
        }
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        if self.dirs.read().unwrap().contains(&path) {
            return Err(FsError::IsDirectory(path));
        }
        let files = self.files.read().unwrap();
        files.get(&path).cloned().ok_or(FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if self.dirs.read().unwrap().contains(&path) {
            return Err(FsError::IsDirectory(path));
        }

        if let Some(parent) = Self::parent_path(&path) {
            self.ensure_dirs(&parent);
        }

        self.files
            .write()
            .unwrap()
            .insert(path.clone(), content.to_vec());
        self.mtimes.write().unwrap().insert(path, now_millis());
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        let dirs = self.dirs.read().unwrap();
        if !dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }

        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        let files = self.files.read().unwrap();
        for file_path in files.keys() {
            if let Some(rest) = file_path.strip_prefix(&prefix) {
                if !rest.contains('/') && seen.insert(rest.to_string()) {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: false,
                    });
                }
            }
        }

        for dir_path in dirs.iter() {
            if let Some(rest) = dir_path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') && seen.insert(rest.to_string()) {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: true,
                    });
                }
            }
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);

        if self.files.write().unwrap().remove(&path).is_some() {
            self.mtimes.write().unwrap().remove(&path);
            return Ok(());
        }

        let mut dirs = self.dirs.write().unwrap();
        if dirs.contains(&path) && !path.is_empty() {
            let prefix = format!("{}/", path);
            let has_children = dirs.iter().any(|d| d.starts_with(&prefix))
                || self
                    .files
                    .read()
                    .unwrap()
                    .keys()
                    .any(|f| f.starts_with(&prefix));
            if has_children {
                return Err(FsError::Io(format!("Directory not empty: {}", path)));
            }
            dirs.remove(&path);
            return Ok(());
        }

        Err(FsError::NotFound(path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap();
        let dirs = self.dirs.read().unwrap();
        Ok(files.contains_key(&path) || dirs.contains(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = Self::normalize_path(path);

        if let Some(content) = self.files.read().unwrap().get(&path) {
            let mtime = self.mtimes.read().unwrap().get(&path).copied().unwrap_or(0);
            return Ok(FileStat {
                mtime_millis: mtime,
                size: content.len() as u64,
                is_dir: false,
            });
        }

        if self.dirs.read().unwrap().contains(&path) {
            return Ok(FileStat {
                mtime_millis: 0,
                size: 0,
                is_dir: true,
            });
        }

        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if self.files.read().unwrap().contains_key(&path) {
            return Err(FsError::NotDirectory(path));
        }
        self.ensure_dirs(&path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = Self::normalize_path(from);
        let to = Self::normalize_path(to);

        let content = self
            .files
            .write()
            .unwrap()
            .remove(&from)
            .ok_or_else(|| FsError::NotFound(from.clone()))?;
        let mtime = self.mtimes.write().unwrap().remove(&from);

        if let Some(parent) = Self::parent_path(&to) {
            self.ensure_dirs(&parent);
        }

        self.files.write().unwrap().insert(to.clone(), content);
        // A rename keeps the file's modification time
        self.mtimes
            .write()
            .unwrap()
            .insert(to, mtime.unwrap_or_else(now_millis));
        Ok(())
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This lets tests keep a handle on the filesystem an orchestrator owns
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        (**self).rename(from, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_fs_basic_operations() {
        let fs = InMemoryFs::new();

        fs.write("test.md", b"hello world").await.unwrap();
        assert_eq!(fs.read("test.md").await.unwrap(), b"hello world");

        assert!(fs.exists("test.md").await.unwrap());
        assert!(!fs.exists("nonexistent.md").await.unwrap());

        fs.delete("test.md").await.unwrap();
        assert!(!fs.exists("test.md").await.unwrap());
        assert!(matches!(
            fs.delete("test.md").await,
            Err(FsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_inmemory_fs_directories() {
        let fs = InMemoryFs::new();

        fs.write("a/b/c.md", b"content").await.unwrap();

        assert!(fs.exists("a").await.unwrap());
        assert!(fs.exists("a/b").await.unwrap());

        let entries = fs.list("a").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
        assert!(entries[0].is_dir);

        let entries = fs.list("a/b").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "c.md");
        assert!(!entries[0].is_dir);

        let mut root: Vec<String> = fs.list("").await.unwrap().into_iter().map(|e| e.name).collect();
        root.sort();
        assert_eq!(root, vec!["a"]);
    }

    #[tokio::test]
    async fn test_inmemory_fs_rename_keeps_mtime() {
        let fs = InMemoryFs::new();
        fs.write("draft.md", b"text").await.unwrap();
        fs.set_mtime("draft.md", 1234);

        fs.rename("draft.md", "archive/final.md").await.unwrap();

        assert!(!fs.exists("draft.md").await.unwrap());
        assert_eq!(fs.read("archive/final.md").await.unwrap(), b"text");
        assert_eq!(fs.stat("archive/final.md").await.unwrap().mtime_millis, 1234);
    }

    #[tokio::test]
    async fn test_inmemory_fs_rename_replaces_target() {
        let fs = InMemoryFs::new();
        fs.write("a.json", b"old").await.unwrap();
        fs.write("a.json.tmp", b"new").await.unwrap();

        fs.rename("a.json.tmp", "a.json").await.unwrap();

        assert_eq!(fs.read("a.json").await.unwrap(), b"new");
        assert_eq!(fs.file_paths(), vec!["a.json"]);
    }

    #[tokio::test]
    async fn test_inmemory_fs_non_empty_dir_delete_fails() {
        let fs = InMemoryFs::new();
        fs.write("dir/file.md", b"x").await.unwrap();
        assert!(fs.delete("dir").await.is_err());
        fs.delete("dir/file.md").await.unwrap();
        fs.delete("dir").await.unwrap();
        assert!(!fs.exists("dir").await.unwrap());
    }
}

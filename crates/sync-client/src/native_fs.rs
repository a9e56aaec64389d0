//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use sync_core::fs::{FileEntry, FileStat, FileSystem, FsError, Result};
use tokio::fs;

/// Filesystem rooted at a vault directory on disk
pub struct NativeFs {
    base_path: PathBuf,
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> PathBuf {
        let path = path.trim_matches('/');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }
}

fn map_err(path: &str, e: io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
        _ => FsError::Io(format!("{}: {}", path, e)),
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_err(path, e))?;
        }

        fs::write(&full_path, content)
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))?;

        while let Some(entry) = dir.next_entry().await.map_err(|e| map_err(path, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            // file_type doesn't follow symlinks; a vanished entry is just skipped
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };

            entries.push(FileEntry {
                name,
                is_dir: file_type.is_dir(),
            });
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| map_err(path, e))?;

        let result = if metadata.is_dir() {
            fs::remove_dir(&full_path).await
        } else {
            fs::remove_file(&full_path).await
        };
        result.map_err(|e| map_err(path, e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let metadata = fs::metadata(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))?;

        // Millisecond-truncated mtime
        let mtime_millis = metadata
            .modified()
            .map(|t| {
                t.duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0)
            })
            .unwrap_or(0);

        Ok(FileStat {
            mtime_millis,
            size: metadata.len(),
            is_dir: metadata.is_dir(),
        })
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.full_path(path))
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let to_path = self.full_path(to);
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_err(to, e))?;
        }

        fs::rename(self.full_path(from), &to_path)
            .await
            .map_err(|e| map_err(from, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_creates_parents() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        fs.write("a/b/note.md", b"hello").await.unwrap();

        assert_eq!(fs.read("a/b/note.md").await.unwrap(), b"hello");
        assert!(dir.path().join("a/b/note.md").exists());

        let stat = fs.stat("a/b/note.md").await.unwrap();
        assert_eq!(stat.size, 5);
        assert!(!stat.is_dir);
        assert!(stat.mtime_millis > 0);
    }

    #[tokio::test]
    async fn test_not_found_mapped() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        assert!(matches!(fs.read("missing.md").await, Err(FsError::NotFound(_))));
        assert!(matches!(fs.delete("missing.md").await, Err(FsError::NotFound(_))));
        assert!(matches!(fs.stat("missing.md").await, Err(FsError::NotFound(_))));
        assert!(!fs.exists("missing.md").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());
        fs.write("x.md", b"1").await.unwrap();
        fs.mkdir("sub").await.unwrap();

        let mut entries: Vec<(String, bool)> = fs
            .list("")
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.is_dir))
            .collect();
        entries.sort();
        assert_eq!(entries, vec![("sub".into(), true), ("x.md".into(), false)]);

        fs.delete("x.md").await.unwrap();
        fs.delete("sub").await.unwrap();
        assert!(fs.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_replaces_and_creates_parents() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());
        fs.write("src.md", b"new").await.unwrap();
        fs.write("deep/dst.md", b"old").await.unwrap();

        fs.rename("src.md", "deep/dst.md").await.unwrap();
        assert_eq!(fs.read("deep/dst.md").await.unwrap(), b"new");
        assert!(!fs.exists("src.md").await.unwrap());

        fs.rename("deep/dst.md", ".trash/deep/dst.md").await.unwrap();
        assert!(fs.exists(".trash/deep/dst.md").await.unwrap());
    }
}

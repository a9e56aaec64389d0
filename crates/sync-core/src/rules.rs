//! Include/exclude rules applied while scanning a vault.
//!
//! Order of evaluation: hard exclusions, then user exclusions, then the
//! include allowlist. A path must pass all three.

use serde::{Deserialize, Serialize};

/// Directory holding sync state (manifest, settings). Never synced.
pub const SYNC_DIR: &str = ".sync";
/// Vault-relative path of the persisted manifest.
pub const MANIFEST_PATH: &str = ".sync/manifest.json";
/// Reserved directory for non-destructive deletes.
pub const TRASH_DIR: &str = ".trash";
/// The one hidden top-level directory whose JSON files are synced.
pub const CONFIG_DIR: &str = ".config";
/// Top-level directory whose files are synced regardless of extension.
pub const ATTACHMENTS_DIR: &str = "attachments";

/// Extensions synced anywhere in the vault.
const INCLUDED_EXTENSIONS: &[&str] = &[
    "md", "markdown", "txt", "canvas", "pdf", "png", "jpg", "jpeg", "gif", "svg", "webp", "bmp",
];

const TEMP_SUFFIXES: &[&str] = &[".tmp", ".bak", ".swp", "~"];

/// User-configurable exclusions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExcludeConfig {
    /// File extensions to skip, with or without the leading dot.
    pub extensions: Vec<String>,
    /// Folder prefixes to skip, vault-relative.
    pub folders: Vec<String>,
}

/// Compiled scan rules.
#[derive(Debug, Clone, Default)]
pub struct ScanRules {
    excluded_extensions: Vec<String>,
    excluded_folders: Vec<String>,
}

impl ScanRules {
    pub fn new(exclude: ExcludeConfig) -> Self {
        let excluded_extensions = exclude
            .extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        let excluded_folders = exclude
            .folders
            .iter()
            .map(|f| f.trim().trim_matches('/').to_string())
            .filter(|f| !f.is_empty())
            .collect();

        Self {
            excluded_extensions,
            excluded_folders,
        }
    }

    /// Whether a vault-relative file path takes part in sync.
    pub fn is_included(&self, path: &str) -> bool {
        let path = path.trim_matches('/');
        if path.is_empty() || path == MANIFEST_PATH {
            return false;
        }

        let segments: Vec<&str> = path.split('/').collect();
        let Some((name, dirs)) = segments.split_last() else {
            return false;
        };

        if is_temp_name(name) {
            return false;
        }

        // Hidden segments, except JSON directly or nested under the config dir
        let in_config_dir = dirs.first() == Some(&CONFIG_DIR);
        let hidden_dir = dirs
            .iter()
            .enumerate()
            .any(|(i, d)| d.starts_with('.') && !(i == 0 && *d == CONFIG_DIR));
        if hidden_dir || name.starts_with('.') {
            return false;
        }

        if self.is_user_excluded(path, name) {
            return false;
        }

        let ext = extension(name);
        if in_config_dir {
            return ext.as_deref() == Some("json");
        }
        if dirs.first() == Some(&ATTACHMENTS_DIR) {
            return true;
        }
        ext.is_some_and(|e| INCLUDED_EXTENSIONS.contains(&e.as_str()))
    }

    /// Whether the scanner should recurse into a vault-relative directory.
    pub fn should_descend(&self, dir: &str) -> bool {
        let dir = dir.trim_matches('/');
        if dir.is_empty() {
            return true;
        }

        let hidden = dir
            .split('/')
            .enumerate()
            .any(|(i, d)| d.starts_with('.') && !(i == 0 && d == CONFIG_DIR));
        if hidden {
            return false;
        }

        !self.is_folder_excluded(dir)
    }

    fn is_user_excluded(&self, path: &str, name: &str) -> bool {
        if let Some(ext) = extension(name) {
            if self.excluded_extensions.contains(&ext) {
                return true;
            }
        }
        self.is_folder_excluded(path)
    }

    fn is_folder_excluded(&self, path: &str) -> bool {
        self.excluded_folders.iter().any(|folder| {
            path == folder
                || path
                    .strip_prefix(folder.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with('~') || TEMP_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Lowercase extension without the dot. Dotfiles have none.
fn extension(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

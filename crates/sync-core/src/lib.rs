//! sync-core: platform-independent pieces of encrypted vault sync.
//!
//! This crate provides:
//! - Vault encryption and path pseudonymization (`crypto`)
//! - Manifest scanning, persistence, and three-way diffing
//! - The relay wire protocol
//! - FileSystem trait abstraction and progress events

pub mod crypto;
pub mod diff;
pub mod events;
pub mod fs;
pub mod manifest;
pub mod protocol;
pub mod rules;
pub mod trash;
pub mod vault_id;

pub use crypto::{CryptoError, KdfParams, VaultKey};
pub use diff::{ManifestDiff, diff};
pub use events::{EventBus, Subscription, SyncProgress, SyncStatus};
pub use fs::{FileEntry, FileStat, FileSystem, FsError, InMemoryFs, now_millis};
pub use manifest::{FileInfo, Manifest, ManifestError, ManifestStore};
pub use protocol::{ClientMessage, RelayMessage, RemoteEntry};
pub use rules::{ExcludeConfig, ScanRules};
pub use trash::move_to_sync_trash;
pub use vault_id::{VaultId, VaultIdError, generate_vault_id};

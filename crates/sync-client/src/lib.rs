//! sync-client library: relay client, sync orchestrator and native filesystem.
//!
//! The `vault-sync` binary is a thin layer over these modules; integration
//! tests drive them directly.

pub mod batch;
pub mod config;
pub mod native_fs;
pub mod orchestrator;
pub mod pending;
pub mod relay;
pub mod watcher;

// Re-export key types for convenience
pub use config::{DeleteMode, SyncSettings, TimingConfig};
pub use native_fs::NativeFs;
pub use orchestrator::{SyncError, SyncOrchestrator, SyncResult};
pub use relay::{ConnectionState, RelayClient, RelayError, RelayTimeouts};
pub use watcher::{FileEvent, FileEventKind, FileWatcher};

//! End-to-end tests for the sync client.
//!
//! Two or more in-memory vaults sync through a mock relay that speaks the
//! JSON protocol over a real WebSocket. The relay can be told to go silent,
//! reject uploads, tamper with downloads, or push change notifications.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use sync_client::{ConnectionState, DeleteMode, SyncOrchestrator, SyncSettings, TimingConfig};
use sync_core::crypto::{KdfParams, hash_path};
use sync_core::events::SyncStatus;
use sync_core::fs::{FileSystem, InMemoryFs};
use sync_core::protocol::{ClientMessage, FILE_CHANGED_EVENT, RelayMessage, RemoteEntry};
use sync_core::rules::MANIFEST_PATH;
use sync_core::trash::conflict_copy_path;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

const PASSPHRASE: &str = "correct horse battery staple";

// ============================================================================
// Mock relay
// ============================================================================

struct StoredFile {
    entry: RemoteEntry,
    iv: Vec<u8>,
    tag: Vec<u8>,
    data: Vec<u8>,
}

#[derive(Default)]
struct RelayState {
    files: BTreeMap<String, StoredFile>,
    clients: Vec<mpsc::UnboundedSender<String>>,
    /// Never answer get-manifest
    silent: bool,
    /// Flip a ciphertext bit on download
    tamper: bool,
    /// Hashed paths whose uploads get an error reply
    rejected: HashSet<String>,
}

impl RelayState {
    fn handle(&mut self, request: ClientMessage, tx: &mpsc::UnboundedSender<String>) -> Option<RelayMessage> {
        match request {
            ClientMessage::Register { .. } => {
                self.clients.push(tx.clone());
                None
            }
            ClientMessage::GetManifest { .. } => {
                if self.silent {
                    return None;
                }
                let files = self
                    .files
                    .iter()
                    .map(|(path, f)| (path.clone(), f.entry.clone()))
                    .collect();
                Some(RelayMessage::Manifest { files })
            }
            ClientMessage::Upload {
                path,
                original_path,
                iv,
                tag,
                data,
                hash,
                size,
                modified_at,
                ..
            } => {
                if self.rejected.contains(&path) {
                    return Some(RelayMessage::error("quota exceeded"));
                }
                let entry = RemoteEntry {
                    hash,
                    size,
                    modified_at,
                    original_path: Some(original_path),
                };
                self.files.insert(path, StoredFile { entry, iv, tag, data });
                Some(RelayMessage::Ack {})
            }
            ClientMessage::Download { path, .. } => match self.files.get(&path) {
                Some(file) => {
                    let mut data = file.data.clone();
                    if self.tamper {
                        if let Some(byte) = data.first_mut() {
                            *byte ^= 0x01;
                        }
                    }
                    Some(RelayMessage::FileData {
                        path,
                        iv: file.iv.clone(),
                        tag: file.tag.clone(),
                        data,
                    })
                }
                None => Some(RelayMessage::error("file not found")),
            },
            ClientMessage::Delete { path, .. } => {
                self.files.remove(&path);
                Some(RelayMessage::Ack {})
            }
        }
    }
}

struct MockRelay {
    addr: SocketAddr,
    state: Arc<Mutex<RelayState>>,
}

impl MockRelay {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(RelayState::default()));

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&accept_state)));
            }
        });

        Self { addr, state }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.state.lock().unwrap()
    }

    fn file_count(&self) -> usize {
        self.state().files.len()
    }

    fn notify_all(&self) {
        let notify = RelayMessage::Notify {
            event: FILE_CHANGED_EVENT.into(),
        }
        .to_json();
        for client in &self.state().clients {
            let _ = client.send(notify.clone());
        }
    }
}

async fn serve(stream: TcpStream, state: Arc<Mutex<RelayState>>) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = read.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let Ok(request) = ClientMessage::from_json(&text) else {
            continue;
        };
        let reply = state.lock().unwrap().handle(request, &tx);
        if let Some(reply) = reply {
            let _ = tx.send(reply.to_json());
        }
    }
    writer.abort();
}

// ============================================================================
// Devices
// ============================================================================

fn test_settings() -> SyncSettings {
    SyncSettings {
        // Cheap KDF; every device in a test must agree
        kdf: KdfParams { log_n: 4, r: 8, p: 1 },
        timing: TimingConfig {
            done_relax_ms: 50,
            notify_debounce_ms: 60_000,
            ..TimingConfig::default()
        },
        ..SyncSettings::default()
    }
}

struct Device {
    fs: Arc<InMemoryFs>,
    sync: Arc<SyncOrchestrator<Arc<InMemoryFs>>>,
}

impl Device {
    fn new(settings: SyncSettings) -> Self {
        let fs = Arc::new(InMemoryFs::new());
        let sync = SyncOrchestrator::new(Arc::clone(&fs), settings);
        Self { fs, sync }
    }

    async fn write(&self, path: &str, content: &str) {
        self.fs.write(path, content.as_bytes()).await.unwrap();
    }

    async fn read(&self, path: &str) -> Option<String> {
        let bytes = self.fs.read(path).await.ok()?;
        Some(String::from_utf8(bytes).unwrap())
    }
}

/// One device creates the vault, the other joins it.
async fn paired(relay: &MockRelay, a: SyncSettings, b: SyncSettings) -> (Device, Device) {
    let alice = Device::new(a);
    let bob = Device::new(b);

    let vault_id = alice.sync.init(PASSPHRASE, &relay.url()).await.unwrap();
    assert!(bob.sync.join(&vault_id.to_string(), PASSPHRASE, &relay.url()).await);
    (alice, bob)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_init_writes_manifest_and_settings() {
    let relay = MockRelay::start().await;
    let device = Device::new(test_settings());
    device.write("notes/a.md", "hello").await;

    let vault_id = device.sync.init(PASSPHRASE, &relay.url()).await.unwrap();

    assert_eq!(device.sync.vault_id(), Some(vault_id));
    assert_eq!(device.sync.settings().vault_id, Some(vault_id));
    assert_eq!(device.sync.settings().relay_url, Some(relay.url()));
    assert_eq!(device.sync.connection_state(), ConnectionState::Connected);

    let manifest = String::from_utf8(device.fs.read(MANIFEST_PATH).await.unwrap()).unwrap();
    assert!(manifest.contains("notes/a.md"));
    assert!(manifest.contains(&vault_id.to_string()));
}

#[tokio::test]
async fn test_two_devices_converge() {
    let relay = MockRelay::start().await;
    let (alice, bob) = paired(&relay, test_settings(), test_settings()).await;

    alice.write("notes/a.md", "alpha").await;
    alice.write("attachments/pic.png", "\u{89}PNG").await;

    let result = alice.sync.sync().await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.uploaded, 2);
    assert_eq!(relay.file_count(), 2);

    // The relay only ever sees hashed paths and sealed tokens
    {
        let state = relay.state();
        for (path, file) in &state.files {
            assert_eq!(path.len(), 64);
            assert!(path.chars().all(|c| c.is_ascii_hexdigit()));
            let token = file.entry.original_path.as_deref().unwrap();
            assert!(!token.contains("notes"));
        }
        assert!(state.files.contains_key(&hash_path("notes/a.md")));
    }

    let result = bob.sync.sync().await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.downloaded, 2);
    assert_eq!(bob.read("notes/a.md").await.as_deref(), Some("alpha"));
    assert_eq!(bob.read("attachments/pic.png").await.as_deref(), Some("\u{89}PNG"));

    // Nothing left to do on either side
    for device in [&alice, &bob] {
        let result = device.sync.sync().await;
        assert!(result.success);
        assert_eq!(
            (result.uploaded, result.downloaded, result.conflicts),
            (0, 0, 0)
        );
        assert!(result.failed.is_empty());
    }
}

#[tokio::test]
async fn test_edit_propagates() {
    let relay = MockRelay::start().await;
    let (alice, bob) = paired(&relay, test_settings(), test_settings()).await;

    alice.write("todo.md", "v1").await;
    alice.sync.sync().await;
    bob.sync.sync().await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    bob.write("todo.md", "v2").await;

    let result = bob.sync.sync().await;
    assert_eq!(result.uploaded, 1);
    assert_eq!(result.conflicts, 0);

    let result = alice.sync.sync().await;
    assert_eq!(result.downloaded, 1);
    assert_eq!(result.conflicts, 0);
    assert_eq!(alice.read("todo.md").await.as_deref(), Some("v2"));
}

#[tokio::test]
async fn test_conflict_tie_goes_to_remote() {
    let relay = MockRelay::start().await;
    let (alice, bob) = paired(&relay, test_settings(), test_settings()).await;

    alice.write("plan.md", "base").await;
    alice.sync.sync().await;
    bob.sync.sync().await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    alice.write("plan.md", "alice edit").await;
    bob.write("plan.md", "bob edit").await;
    let edited_at = sync_core::fs::now_millis();
    alice.fs.set_mtime("plan.md", edited_at);
    bob.fs.set_mtime("plan.md", edited_at);
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(alice.sync.sync().await.uploaded, 1);

    let result = bob.sync.sync().await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.conflicts, 1);
    assert_eq!(bob.read("plan.md").await.as_deref(), Some("alice edit"));

    let copy = conflict_copy_path("plan.md", chrono::Local::now().date_naive());
    assert_eq!(bob.read(&copy).await.as_deref(), Some("bob edit"));

    // The conflict copy is an ordinary new file from here on
    assert_eq!(bob.sync.sync().await.uploaded, 1);
    let result = alice.sync.sync().await;
    assert_eq!(result.downloaded, 1);
    assert_eq!(result.conflicts, 0);
    assert_eq!(alice.read(&copy).await.as_deref(), Some("bob edit"));
}

#[tokio::test]
async fn test_second_conflict_same_day_keeps_both_copies() {
    let relay = MockRelay::start().await;
    let (alice, bob) = paired(&relay, test_settings(), test_settings()).await;

    alice.write("plan.md", "base").await;
    alice.sync.sync().await;
    bob.sync.sync().await;

    for round in 1..=2 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        alice.write("plan.md", &format!("alice edit {}", round)).await;
        bob.write("plan.md", &format!("bob edit {}", round)).await;
        let edited_at = sync_core::fs::now_millis();
        alice.fs.set_mtime("plan.md", edited_at);
        bob.fs.set_mtime("plan.md", edited_at);
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(alice.sync.sync().await.success);
        let result = bob.sync.sync().await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.conflicts, 1);
    }

    let today = chrono::Local::now().date_naive();
    let first = conflict_copy_path("plan.md", today);
    let second = format!("plan.sync-conflict-{}-2.md", today.format("%Y-%m-%d"));
    assert_eq!(bob.read(&first).await.as_deref(), Some("bob edit 1"));
    assert_eq!(bob.read(&second).await.as_deref(), Some("bob edit 2"));
    assert_eq!(bob.read("plan.md").await.as_deref(), Some("alice edit 2"));
}

#[tokio::test]
async fn test_conflict_newer_local_wins() {
    let relay = MockRelay::start().await;
    let (alice, bob) = paired(&relay, test_settings(), test_settings()).await;

    alice.write("plan.md", "base").await;
    alice.sync.sync().await;
    bob.sync.sync().await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    alice.write("plan.md", "older").await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    bob.write("plan.md", "newer").await;

    alice.sync.sync().await;
    let result = bob.sync.sync().await;
    assert_eq!(result.conflicts, 1);
    assert_eq!(bob.read("plan.md").await.as_deref(), Some("newer"));
    assert!(
        !bob.fs.file_paths().iter().any(|p| p.contains("sync-conflict")),
        "local winner keeps no copy"
    );

    alice.sync.sync().await;
    assert_eq!(alice.read("plan.md").await.as_deref(), Some("newer"));
}

#[tokio::test]
async fn test_delete_propagates() {
    let relay = MockRelay::start().await;
    let (alice, bob) = paired(&relay, test_settings(), test_settings()).await;

    alice.write("gone.md", "bye").await;
    alice.write("kept.md", "stay").await;
    alice.sync.sync().await;
    bob.sync.sync().await;

    alice.fs.delete("gone.md").await.unwrap();
    let result = alice.sync.sync().await;
    assert_eq!(result.deleted_remote, 1);
    assert_eq!(relay.file_count(), 1);

    let result = bob.sync.sync().await;
    assert_eq!(result.deleted_local, 1);
    assert!(!bob.fs.exists("gone.md").await.unwrap());
    assert!(bob.fs.exists("kept.md").await.unwrap());

    // Settled: a deleted file doesn't come back
    assert_eq!(alice.sync.sync().await.downloaded, 0);
}

#[tokio::test]
async fn test_delete_survives_aborted_cycle() {
    let relay = MockRelay::start().await;
    let (alice, bob) = paired(&relay, test_settings(), test_settings()).await;

    alice.write("gone.md", "bye").await;
    alice.sync.sync().await;
    bob.sync.sync().await;
    bob.write("new.md", "hello").await;
    assert_eq!(bob.sync.sync().await.uploaded, 1);

    // Download of new.md fails before the delete phase runs
    alice.fs.delete("gone.md").await.unwrap();
    relay.state().tamper = true;
    let result = alice.sync.sync().await;
    assert!(!result.success);
    assert_eq!(relay.file_count(), 2);

    relay.state().tamper = false;
    let result = alice.sync.sync().await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.deleted_remote, 1);
    assert_eq!(result.downloaded, 1);
    assert_eq!(relay.file_count(), 1);
    assert!(!alice.fs.exists("gone.md").await.unwrap());
    assert_eq!(alice.read("new.md").await.as_deref(), Some("hello"));
}

#[tokio::test]
async fn test_delete_to_trash() {
    let relay = MockRelay::start().await;
    let trash_settings = SyncSettings {
        delete_mode: DeleteMode::Trash,
        ..test_settings()
    };
    let (alice, bob) = paired(&relay, test_settings(), trash_settings).await;

    alice.write("notes/old.md", "archive me").await;
    alice.sync.sync().await;
    bob.sync.sync().await;

    alice.fs.delete("notes/old.md").await.unwrap();
    alice.sync.sync().await;

    let result = bob.sync.sync().await;
    assert_eq!(result.deleted_local, 1);
    assert!(!bob.fs.exists("notes/old.md").await.unwrap());
    assert_eq!(bob.read(".trash/notes/old.md").await.as_deref(), Some("archive me"));
}

#[tokio::test]
async fn test_sync_already_in_progress() {
    let relay = MockRelay::start().await;
    let settings = SyncSettings {
        timing: TimingConfig {
            manifest_timeout_ms: 300,
            ..test_settings().timing
        },
        ..test_settings()
    };
    let device = Device::new(settings);
    device.sync.init(PASSPHRASE, &relay.url()).await.unwrap();
    relay.state().silent = true;

    let sync = Arc::clone(&device.sync);
    let first = tokio::spawn(async move { sync.sync().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = device.sync.sync().await;
    assert!(!second.success);
    assert_eq!(second.error.as_deref(), Some("Sync already in progress"));

    let first = first.await.unwrap();
    assert!(!first.success);
    assert_eq!(
        first.error.as_deref(),
        Some("Timed out waiting for manifest reply from relay")
    );
    assert_eq!(device.sync.status(), SyncStatus::Error);
}

#[tokio::test]
async fn test_tampered_download_aborts_cycle() {
    let relay = MockRelay::start().await;
    let (alice, bob) = paired(&relay, test_settings(), test_settings()).await;

    alice.write("secret.md", "classified").await;
    alice.sync.sync().await;
    relay.state().tamper = true;

    let result = bob.sync.sync().await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("Authentication failed"));
    assert!(!bob.fs.exists("secret.md").await.unwrap());
}

#[tokio::test]
async fn test_wrong_passphrase_cannot_read_vault() {
    let relay = MockRelay::start().await;
    let alice = Device::new(test_settings());
    let mallory = Device::new(test_settings());

    alice.write("diary.md", "private").await;
    let vault_id = alice.sync.init(PASSPHRASE, &relay.url()).await.unwrap();
    alice.sync.sync().await;

    assert!(mallory.sync.join(&vault_id.to_string(), "guess", &relay.url()).await);
    let result = mallory.sync.sync().await;
    assert!(!result.success);
    assert!(!mallory.fs.exists("diary.md").await.unwrap());
}

#[tokio::test]
async fn test_rejected_upload_is_not_fatal() {
    let relay = MockRelay::start().await;
    let device = Device::new(test_settings());
    device.sync.init(PASSPHRASE, &relay.url()).await.unwrap();

    device.write("good.md", "ok").await;
    device.write("bad.md", "too big").await;
    relay.state().rejected.insert(hash_path("bad.md"));

    let result = device.sync.sync().await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.uploaded, 1);
    assert_eq!(result.failed, vec!["bad.md".to_string()]);

    // Retried next cycle
    relay.state().rejected.clear();
    let result = device.sync.sync().await;
    assert_eq!(result.uploaded, 1);
    assert!(result.failed.is_empty());
    assert_eq!(relay.file_count(), 2);
}

#[tokio::test]
async fn test_push_file() {
    let relay = MockRelay::start().await;
    let device = Device::new(test_settings());
    device.sync.init(PASSPHRASE, &relay.url()).await.unwrap();
    device.sync.sync().await;

    device.write("quick.md", "saved").await;
    assert!(device.sync.push_file("quick.md").await);
    assert_eq!(relay.file_count(), 1);

    // Already on the relay
    assert!(!device.sync.push_file("quick.md").await);
    assert_eq!(device.sync.sync().await.uploaded, 0);

    // Excluded paths are never pushed
    device.write("scratch.md.tmp", "x").await;
    assert!(!device.sync.push_file("scratch.md.tmp").await);

    device.sync.disconnect().await;
    device.write("offline.md", "x").await;
    assert!(!device.sync.push_file("offline.md").await);
}

#[tokio::test]
async fn test_notifications_trigger_one_debounced_sync() {
    let relay = MockRelay::start().await;
    let listening = SyncSettings {
        timing: TimingConfig {
            notify_debounce_ms: 200,
            ..test_settings().timing
        },
        ..test_settings()
    };
    let (alice, bob) = paired(&relay, test_settings(), listening).await;

    let cycles = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&cycles);
    let _sub = bob.sync.subscribe(move |progress| {
        if progress.status == SyncStatus::Connecting {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    alice.write("news.md", "fresh").await;
    alice.sync.sync().await;

    for _ in 0..3 {
        relay.notify_all();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!(cycles.load(Ordering::SeqCst), 1);
    assert_eq!(bob.read("news.md").await.as_deref(), Some("fresh"));
}

#[tokio::test]
async fn test_unreachable_relay() {
    let device = Device::new(test_settings());
    assert!(!device.sync.join("mg-a1b2-c3d4-e5f6-7890", PASSPHRASE, "ws://127.0.0.1:1").await);
    assert!(device.sync.vault_id().is_none());

    let configured = SyncSettings {
        vault_id: Some("mg-a1b2-c3d4-e5f6-7890".parse().unwrap()),
        relay_url: Some("ws://127.0.0.1:1".into()),
        ..test_settings()
    };
    let device = Device::new(configured);
    device.sync.unlock(PASSPHRASE).await.unwrap();

    let result = device.sync.sync().await;
    assert!(!result.success);
    assert!(result.error.unwrap().starts_with("Failed to connect to relay"));
    assert_eq!(device.sync.connection_state(), ConnectionState::Error);

    // Status relaxes so auto-sync can try again
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(device.sync.status(), SyncStatus::Idle);
}

#[tokio::test]
async fn test_auto_sync_picks_up_remote_changes() {
    let relay = MockRelay::start().await;
    let (alice, bob) = paired(&relay, test_settings(), test_settings()).await;

    bob.sync.start_auto_sync(1);
    alice.write("later.md", "arrives").await;
    alice.sync.sync().await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(bob.read("later.md").await.as_deref(), Some("arrives"));

    bob.sync.stop_auto_sync();
    bob.sync.disconnect().await;
    assert_eq!(bob.sync.connection_state(), ConnectionState::Disconnected);
}

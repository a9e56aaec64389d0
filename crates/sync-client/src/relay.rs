//! Persistent WebSocket connection to the sync relay.
//!
//! Lifecycle: `Disconnected → Connecting → Connected → Disconnected/Error`.
//! Reconnection is always caller-initiated. Every request registers a
//! pending entry (see [`crate::pending`]) before sending and waits for the
//! correlated reply with its own timeout. A request that times out retires
//! its connection, since a late reply could not be told apart from the next.

use crate::config::TimingConfig;
use crate::pending::{Expect, PendingRequests, Rejection};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use sync_core::protocol::{ClientMessage, FILE_CHANGED_EVENT, RelayMessage, RemoteEntry};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to connect to relay: {0}")]
    Connect(String),

    #[error("Timed out connecting to relay after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Timed out waiting for {0} reply from relay")]
    Timeout(&'static str),

    #[error("Connection to relay closed")]
    Closed,

    #[error("Not connected to relay")]
    NotConnected,

    /// The relay answered with an `error` message
    #[error("Relay error: {0}")]
    Relay(String),

    #[error("Failed to send to relay: {0}")]
    Send(String),

    #[error("Unexpected {0} reply from relay")]
    UnexpectedReply(&'static str),
}

impl RelayError {
    /// Connection-level failures end the connection's usefulness; a relay
    /// `error` reply only concerns one request.
    pub fn is_connection_error(&self) -> bool {
        !matches!(self, RelayError::Relay(_) | RelayError::UnexpectedReply(_))
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Per-request timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTimeouts {
    pub connect: Duration,
    pub manifest: Duration,
    pub download: Duration,
    pub ack: Duration,
}

impl Default for RelayTimeouts {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for RelayTimeouts {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            connect: Duration::from_millis(timing.connect_timeout_ms),
            manifest: Duration::from_millis(timing.manifest_timeout_ms),
            download: Duration::from_millis(timing.download_timeout_ms),
            ack: Duration::from_millis(timing.ack_timeout_ms),
        }
    }
}

/// Unsolicited events from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayNotification {
    /// Another device changed the vault
    FileChanged,
    /// The connection dropped without `disconnect()`
    ConnectionLost,
}

/// Encrypted file as served by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileData {
    pub iv: Vec<u8>,
    pub tag: Vec<u8>,
    pub data: Vec<u8>,
}

/// Everything an `upload` carries besides the vault ID.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Hashed path
    pub path: String,
    /// Sealed relative path
    pub original_path: String,
    pub iv: Vec<u8>,
    pub tag: Vec<u8>,
    pub data: Vec<u8>,
    pub hash: String,
    pub size: u64,
    pub modified_at: u64,
}

struct Connection {
    id: u64,
    writer: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    pending: PendingRequests,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    state: ConnectionState,
    conn: Option<Arc<Connection>>,
}

/// Client side of the relay protocol.
pub struct RelayClient {
    url: String,
    vault_id: String,
    timeouts: RelayTimeouts,
    shared: Arc<Mutex<Shared>>,
    connect_lock: tokio::sync::Mutex<()>,
    next_conn_id: AtomicU64,
    notify_tx: mpsc::UnboundedSender<RelayNotification>,
}

impl RelayClient {
    /// Create a disconnected client. Notifications arrive on the returned receiver.
    pub fn new(
        url: impl Into<String>,
        vault_id: impl Into<String>,
        timeouts: RelayTimeouts,
    ) -> (Self, mpsc::UnboundedReceiver<RelayNotification>) {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let client = Self {
            url: url.into(),
            vault_id: vault_id.into(),
            timeouts,
            shared: Arc::new(Mutex::new(Shared {
                state: ConnectionState::Disconnected,
                conn: None,
            })),
            connect_lock: tokio::sync::Mutex::new(()),
            next_conn_id: AtomicU64::new(0),
            notify_tx,
        };
        (client, notify_rx)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn vault_id(&self) -> &str {
        &self.vault_id
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open the connection and register the vault. No-op when connected.
    pub async fn connect(&self) -> Result<()> {
        let _connecting = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        self.shared().state = ConnectionState::Connecting;
        info!("Connecting to relay at {}", self.url);

        let result = tokio::time::timeout(self.timeouts.connect, self.open()).await;
        match result {
            Ok(Ok(conn)) => {
                let mut shared = self.shared();
                // Relay hung up right after the handshake
                if conn.pending.is_closed() {
                    shared.state = ConnectionState::Disconnected;
                    return Err(RelayError::Closed);
                }
                shared.conn = Some(conn);
                shared.state = ConnectionState::Connected;
                info!("Connected to relay");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Relay connection failed: {}", e);
                self.shared().state = ConnectionState::Error;
                Err(e)
            }
            Err(_) => {
                error!("Relay connection timed out after {:?}", self.timeouts.connect);
                self.shared().state = ConnectionState::Error;
                Err(RelayError::ConnectTimeout(self.timeouts.connect))
            }
        }
    }

    async fn open(&self) -> Result<Arc<Connection>> {
        let (ws_stream, _) = connect_async(&self.url)
            .await
            .map_err(|e| RelayError::Connect(e.to_string()))?;
        let (mut write, read) = ws_stream.split();

        let register = ClientMessage::Register {
            vault_id: self.vault_id.clone(),
        };
        write
            .send(Message::Text(register.to_json()))
            .await
            .map_err(|e| RelayError::Send(e.to_string()))?;

        let conn = Arc::new(Connection {
            id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
            writer: tokio::sync::Mutex::new(write),
            pending: PendingRequests::new(),
            read_task: Mutex::new(None),
        });

        let task = tokio::spawn(read_loop(
            read,
            conn.id,
            conn.pending.clone(),
            Arc::clone(&self.shared),
            self.notify_tx.clone(),
        ));
        *conn.read_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        Ok(conn)
    }

    /// Close the connection. Outstanding requests fail with `Closed`.
    pub async fn disconnect(&self) {
        let conn = {
            let mut shared = self.shared();
            shared.state = ConnectionState::Disconnected;
            shared.conn.take()
        };
        let Some(conn) = conn else {
            return;
        };

        shutdown(&conn).await;
        info!("Disconnected from relay");
    }

    /// Retire `conn` if it is still the current connection.
    async fn abandon(&self, conn: &Arc<Connection>) {
        {
            let mut shared = self.shared();
            if shared.conn.as_ref().is_some_and(|c| c.id == conn.id) {
                shared.conn = None;
                shared.state = ConnectionState::Disconnected;
            }
        }
        shutdown(conn).await;
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.shared().conn.clone().ok_or(RelayError::NotConnected)
    }

    /// Send `msg` and wait for the reply described by `expect`.
    async fn request(
        &self,
        msg: ClientMessage,
        expect: Expect,
        timeout: Duration,
    ) -> Result<RelayMessage> {
        let conn = self.connection()?;
        let kind = msg.kind();

        // Register under the writer lock so table order equals send order
        let pending = {
            let mut writer = conn.writer.lock().await;
            let pending = conn.pending.register(expect).map_err(|_| RelayError::Closed)?;
            writer
                .send(Message::Text(msg.to_json()))
                .await
                .map_err(|e| RelayError::Send(e.to_string()))?;
            pending
        };
        debug!("Sent {} request", kind);

        match pending.wait(timeout).await {
            Ok(reply) => Ok(reply),
            Err(Rejection::Relay(text)) => Err(RelayError::Relay(text)),
            Err(Rejection::Closed) => Err(RelayError::Closed),
            Err(Rejection::Timeout) => {
                // A late reply would be credited to the next request of its type
                warn!("No {} reply from relay; dropping connection", reply_name(kind));
                self.abandon(&conn).await;
                Err(RelayError::Timeout(reply_name(kind)))
            }
        }
    }

    /// Fetch the relay's manifest, keyed by hashed path.
    pub async fn get_manifest(&self) -> Result<BTreeMap<String, RemoteEntry>> {
        let msg = ClientMessage::GetManifest {
            vault_id: self.vault_id.clone(),
        };
        match self.request(msg, Expect::Manifest, self.timeouts.manifest).await? {
            RelayMessage::Manifest { files } => Ok(files),
            other => Err(RelayError::UnexpectedReply(other.kind())),
        }
    }

    /// Upload one encrypted file and wait for its ack.
    pub async fn upload(&self, upload: UploadRequest) -> Result<()> {
        let msg = ClientMessage::Upload {
            vault_id: self.vault_id.clone(),
            path: upload.path,
            original_path: upload.original_path,
            iv: upload.iv,
            tag: upload.tag,
            data: upload.data,
            hash: upload.hash,
            size: upload.size,
            modified_at: upload.modified_at,
        };
        self.request(msg, Expect::Ack, self.timeouts.ack).await?;
        Ok(())
    }

    /// Download one encrypted file by hashed path.
    pub async fn download(&self, hashed_path: &str) -> Result<FileData> {
        let msg = ClientMessage::Download {
            vault_id: self.vault_id.clone(),
            path: hashed_path.to_string(),
        };
        let expect = Expect::FileData(hashed_path.to_string());
        match self.request(msg, expect, self.timeouts.download).await? {
            RelayMessage::FileData { iv, tag, data, .. } => Ok(FileData { iv, tag, data }),
            other => Err(RelayError::UnexpectedReply(other.kind())),
        }
    }

    /// Remove one file from the relay.
    pub async fn delete(&self, hashed_path: &str) -> Result<()> {
        let msg = ClientMessage::Delete {
            vault_id: self.vault_id.clone(),
            path: hashed_path.to_string(),
        };
        self.request(msg, Expect::Ack, self.timeouts.ack).await?;
        Ok(())
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if let Some(conn) = self.shared().conn.take() {
            conn.pending.close();
            if let Some(task) = conn.read_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
                task.abort();
            }
        }
    }
}

/// Fail outstanding requests, stop the read loop, and close the socket.
async fn shutdown(conn: &Connection) {
    if !conn.pending.is_empty() {
        debug!("Failing {} outstanding requests", conn.pending.len());
    }
    conn.pending.close();
    if let Some(task) = conn.read_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
        task.abort();
    }
    let _ = conn.writer.lock().await.send(Message::Close(None)).await;
}

fn reply_name(request_kind: &'static str) -> &'static str {
    match request_kind {
        "get-manifest" => "manifest",
        "download" => "file-data",
        _ => "ack",
    }
}

/// Decode inbound frames once and route them.
async fn read_loop(
    mut read: SplitStream<WsStream>,
    conn_id: u64,
    pending: PendingRequests,
    shared: Arc<Mutex<Shared>>,
    notify_tx: mpsc::UnboundedSender<RelayNotification>,
) {
    let mut failed = false;

    loop {
        let text = match read.next().await {
            Some(Ok(Message::Text(text))) => text.to_string(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    warn!("Dropping non-UTF-8 binary frame from relay");
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) => {
                debug!("Relay sent close frame");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                debug!("Relay connection closed");
                break;
            }
            Some(Err(e)) => {
                error!("WebSocket error from relay: {}", e);
                failed = true;
                break;
            }
            None => {
                debug!("Relay stream ended");
                break;
            }
        };

        let msg = match RelayMessage::from_json(&text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Ignoring undecodable relay message: {}", e);
                continue;
            }
        };

        let Some(unclaimed) = pending.dispatch(msg) else {
            continue;
        };
        match unclaimed {
            RelayMessage::Notify { event } if event == FILE_CHANGED_EVENT => {
                debug!("Relay reports remote change");
                let _ = notify_tx.send(RelayNotification::FileChanged);
            }
            RelayMessage::Notify { event } => debug!("Ignoring relay notification: {}", event),
            RelayMessage::Unknown => debug!("Ignoring relay message of unknown type"),
            RelayMessage::Error { .. } => {
                warn!(
                    "Relay error with no pending request: {}",
                    unclaimed.error_text().unwrap_or_default()
                );
            }
            other => warn!("Unsolicited {} from relay", other.kind()),
        }
    }

    pending.close();

    // Only touch state if this is still the current connection
    let lost = {
        let mut shared = shared.lock().unwrap_or_else(|e| e.into_inner());
        if shared.conn.as_ref().is_some_and(|c| c.id == conn_id) {
            shared.conn = None;
            shared.state = if failed {
                ConnectionState::Error
            } else {
                ConnectionState::Disconnected
            };
            true
        } else {
            false
        }
    };
    if lost {
        warn!("Lost connection to relay");
        let _ = notify_tx.send(RelayNotification::ConnectionLost);
    }
}

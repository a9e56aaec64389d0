//! Correlation of relay replies with outstanding requests.
//!
//! The relay protocol carries no request IDs, so a reply is matched by its
//! `type` (and, for file data, its hashed path) to the oldest request that
//! expects it. Entries are registered in send order and removed by their
//! guard on completion, timeout, or cancellation.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use sync_core::protocol::RelayMessage;
use tokio::sync::oneshot;

/// Which reply a request is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    Manifest,
    /// File data for this hashed path
    FileData(String),
    Ack,
}

impl Expect {
    fn matches(&self, msg: &RelayMessage) -> bool {
        match (self, msg) {
            (Expect::Manifest, RelayMessage::Manifest { .. }) => true,
            (Expect::FileData(wanted), RelayMessage::FileData { path, .. }) => wanted == path,
            (Expect::Ack, RelayMessage::Ack {}) => true,
            _ => false,
        }
    }
}

/// Why a request completed without its reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The relay answered with `error`
    Relay(String),
    /// The connection went away
    Closed,
    Timeout,
}

type Outcome = Result<RelayMessage, Rejection>;

struct Entry {
    id: u64,
    expect: Expect,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: VecDeque<Entry>,
    closed: bool,
}

/// Table of requests awaiting a reply on one connection.
#[derive(Clone, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<Inner>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a request. Must happen before its message is sent.
    pub fn register(&self, expect: Expect) -> Result<PendingRequest, Rejection> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Rejection::Closed);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let (tx, rx) = oneshot::channel();
        inner.entries.push_back(Entry { id, expect, tx });

        Ok(PendingRequest {
            table: self.clone(),
            id,
            rx,
        })
    }

    /// Route an inbound message to the request it answers.
    ///
    /// Returns the message back when no request claims it (notifications,
    /// unknown types, unsolicited replies).
    pub fn dispatch(&self, msg: RelayMessage) -> Option<RelayMessage> {
        let mut inner = self.lock();

        let index = match &msg {
            // Errors carry no correlation; blame the oldest request
            RelayMessage::Error { .. } if !inner.entries.is_empty() => Some(0),
            RelayMessage::Error { .. } => None,
            _ => inner.entries.iter().position(|e| e.expect.matches(&msg)),
        };
        let Some(entry) = index.and_then(|i| inner.entries.remove(i)) else {
            return Some(msg);
        };

        let outcome = match msg.error_text() {
            Some(text) => Err(Rejection::Relay(text)),
            None => Ok(msg),
        };
        // Receiver may have just timed out; nothing to do then
        let _ = entry.tx.send(outcome);
        None
    }

    /// Fail every outstanding request and refuse new ones.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        for entry in inner.entries.drain(..) {
            let _ = entry.tx.send(Err(Rejection::Closed));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, id: u64) {
        self.lock().entries.retain(|e| e.id != id);
    }
}

/// A registered request. Dropping it removes its table entry.
pub struct PendingRequest {
    table: PendingRequests,
    id: u64,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingRequest {
    /// Wait for the reply, failing after `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Outcome {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without an answer
            Ok(Err(_)) => Err(Rejection::Closed),
            Err(_) => Err(Rejection::Timeout),
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

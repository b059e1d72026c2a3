use std::{
    collections::BTreeMap,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
};

use parking_lot::Mutex;
use picochat_core::Packet;
use serde::Serialize;
use tokio::sync::mpsc;

/// Identifier issued to a connection when it registers. Ids grow
/// monotonically and are never reused by a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Connecting,
    Active,
    Closed,
}

/// Per-socket state shared between a connection's handler and the relay.
pub struct ConnectionRecord {
    id: ConnectionId,
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Packet>,
    display_name: OnceLock<String>,
    tombstoned: AtomicBool,
}

impl ConnectionRecord {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn display_name(&self) -> Option<&str> {
        self.display_name.get().map(String::as_str)
    }

    pub fn liveness(&self) -> Liveness {
        if self.is_tombstoned() {
            Liveness::Closed
        } else if self.display_name.get().is_some() {
            Liveness::Active
        } else {
            Liveness::Connecting
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned.load(Ordering::Acquire)
    }

    /// True while the writer draining this connection's channel is alive.
    pub fn is_open(&self) -> bool {
        !self.is_tombstoned() && !self.outbound.is_closed()
    }

    pub fn outbound(&self) -> &mpsc::Sender<Packet> {
        &self.outbound
    }

    /// Sets the display name. Returns `false` if one was already assigned.
    pub(crate) fn assign_name(&self, name: String) -> bool {
        self.display_name.set(name).is_ok()
    }

    pub(crate) async fn send(&self, packet: Packet) -> Result<(), mpsc::error::SendError<Packet>> {
        self.outbound.send(packet).await
    }

    fn tombstone(&self) -> bool {
        !self.tombstoned.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("display_name", &self.display_name.get())
            .field("liveness", &self.liveness())
            .finish()
    }
}

/// Live connections keyed by id. Only the relay holds one.
pub(crate) struct ConnectionRegistry {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<ConnectionId, Arc<ConnectionRecord>>>,
}

impl ConnectionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub(crate) fn register(
        &self,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<Packet>,
    ) -> Arc<ConnectionRecord> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = Arc::new(ConnectionRecord {
            id,
            remote_addr,
            outbound,
            display_name: OnceLock::new(),
            tombstoned: AtomicBool::new(false),
        });
        self.entries.lock().insert(id, Arc::clone(&record));
        record
    }

    /// Tombstones and removes `id`. Only the first caller for a given id gets
    /// the record back; later callers see `None`.
    pub(crate) fn evict(&self, id: ConnectionId) -> Option<Arc<ConnectionRecord>> {
        let record = self.entries.lock().remove(&id)?;
        record.tombstone().then_some(record)
    }

    /// Copy of the live records in id order. Callers iterate the copy, so
    /// evictions during iteration never touch the set being walked.
    pub(crate) fn snapshot(&self) -> Vec<Arc<ConnectionRecord>> {
        self.entries.lock().values().cloned().collect()
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionRecord>> {
        self.entries.lock().get(&id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

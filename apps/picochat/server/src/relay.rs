use std::{collections::VecDeque, net::SocketAddr, sync::Arc};

use metrics::{counter, gauge};
use picochat_core::{encode, leave_notice, EncodingError, Packet};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::{
    audit::AuditLog,
    config::RelayConfig,
    registry::{ConnectionId, ConnectionRecord, ConnectionRegistry, Liveness},
};

/// Owns the connection registry and is the only place notifications are fanned
/// out from. Handlers reach the registry through `register`, `assign_name`,
/// `disconnect` and `broadcast`.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    registry: ConnectionRegistry,
    audit: Option<AuditLog>,
    config: RelayConfig,
}

/// Outcome of one `broadcast` call, including the leave notices it triggered.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub remote_addr: String,
    pub display_name: Option<String>,
    pub liveness: Liveness,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let audit = config.audit_log.clone().map(AuditLog::new);
        Self {
            inner: Arc::new(RelayInner {
                registry: ConnectionRegistry::new(),
                audit,
                config,
            }),
        }
    }

    /// Creates the bounded outbound channel for a new connection.
    pub fn outbound_channel(&self) -> (mpsc::Sender<Packet>, mpsc::Receiver<Packet>) {
        mpsc::channel(self.inner.config.outbound_buffer)
    }

    pub fn register(
        &self,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<Packet>,
    ) -> Arc<ConnectionRecord> {
        let record = self.inner.registry.register(remote_addr, outbound);
        counter!("picochat_connections_total", 1);
        gauge!("picochat_connections_active", self.connection_count() as f64);
        debug!(connection_id = %record.id(), remote_addr = %remote_addr, "connection registered");
        record
    }

    /// Fixes the display name of a connection. Returns `false` when the
    /// connection already had one.
    pub fn assign_name(&self, record: &ConnectionRecord, display_name: String) -> bool {
        record.assign_name(display_name)
    }

    /// Removes a connection whose inbound stream ended. If it was still live
    /// and had joined, the remaining connections are told it left.
    pub async fn disconnect(&self, id: ConnectionId) -> Result<BroadcastReport, EncodingError> {
        let Some(record) = self.inner.registry.evict(id) else {
            return Ok(BroadcastReport::default());
        };
        self.on_evicted(&record);

        match record.display_name() {
            Some(name) => self.fan_out(None, leave_notice(name)).await,
            None => Ok(BroadcastReport::default()),
        }
    }

    /// Sends `text` to every live connection except `origin`.
    ///
    /// Connections found closed during the pass are evicted once the pass is
    /// complete, and each eviction of a named connection is followed by its
    /// own leave broadcast.
    pub async fn broadcast(
        &self,
        origin: Option<ConnectionId>,
        text: String,
    ) -> Result<BroadcastReport, EncodingError> {
        self.fan_out(origin, text).await
    }

    async fn fan_out(
        &self,
        origin: Option<ConnectionId>,
        text: String,
    ) -> Result<BroadcastReport, EncodingError> {
        let mut report = BroadcastReport::default();
        let mut pending = VecDeque::from([(origin, encode(&text)?)]);

        while let Some((origin, packet)) = pending.pop_front() {
            let mut dead = Vec::new();
            let mut delivered = 0usize;
            for record in self.inner.registry.snapshot() {
                if record.is_tombstoned() || Some(record.id()) == origin {
                    continue;
                }
                if record.is_open() && record.send(packet.clone()).await.is_ok() {
                    delivered += 1;
                } else {
                    dead.push(record.id());
                }
            }
            report.delivered += delivered;
            counter!("picochat_packets_delivered_total", delivered as u64);

            for id in dead {
                let Some(record) = self.inner.registry.evict(id) else {
                    continue;
                };
                report.evicted += 1;
                self.on_evicted(&record);
                if let Some(name) = record.display_name() {
                    pending.push_back((None, encode(&leave_notice(name))?));
                }
            }
        }

        Ok(report)
    }

    fn on_evicted(&self, record: &ConnectionRecord) {
        counter!("picochat_evictions_total", 1);
        gauge!("picochat_connections_active", self.connection_count() as f64);
        info!(
            connection_id = %record.id(),
            display_name = record.display_name().unwrap_or_default(),
            "connection removed"
        );
    }

    /// Appends a chat message to the audit log when auditing is enabled.
    pub async fn audit(&self, record: &ConnectionRecord, display_name: &str, message: &str) {
        if let Some(audit) = &self.inner.audit {
            audit.record(record.remote_addr(), display_name, message).await;
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.registry.get(id).is_some()
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        self.inner
            .registry
            .snapshot()
            .into_iter()
            .map(|record| ConnectionSnapshot {
                id: record.id(),
                remote_addr: record.remote_addr().to_string(),
                display_name: record.display_name().map(str::to_owned),
                liveness: record.liveness(),
            })
            .collect()
    }
}

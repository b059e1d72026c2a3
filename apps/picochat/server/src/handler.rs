use std::{fmt, net::SocketAddr, sync::Arc};

use futures_util::{Stream, StreamExt};
use metrics::counter;
use picochat_core::{
    chat_notice, decode_frame, display_name, join_notice, DecodingError, EncodingError, Packet,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    registry::{ConnectionId, ConnectionRecord},
    relay::Relay,
};

/// Lifecycle of one connection. The first payload moves it to `Active`;
/// every later payload is chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active { display_name: String },
    Closed,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid packet: {0}")]
    Decoding(#[from] DecodingError),
    #[error("failed to encode broadcast: {0}")]
    Encoding(#[from] EncodingError),
}

/// Drives one connection from registration to removal.
pub struct ConnectionHandler {
    relay: Relay,
    record: Arc<ConnectionRecord>,
    state: ConnectionState,
}

impl ConnectionHandler {
    /// Registers a new connection with no display name yet.
    pub fn open(relay: Relay, remote_addr: SocketAddr, outbound: mpsc::Sender<Packet>) -> Self {
        let record = relay.register(remote_addr, outbound);
        Self {
            relay,
            record,
            state: ConnectionState::Connecting,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.record.id()
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Handles one inbound payload: the handshake while `Connecting`, a chat
    /// message while `Active`.
    pub async fn on_payload(&mut self, payload: &str) -> Result<(), HandlerError> {
        let text = decode_frame(payload)?;

        match &self.state {
            ConnectionState::Connecting => {
                let name = display_name(&text);
                let assigned = self.relay.assign_name(&self.record, name.clone());
                debug_assert!(assigned, "connecting record already carried a name");
                info!(connection_id = %self.id(), display_name = %name, "client joined");
                self.state = ConnectionState::Active {
                    display_name: name.clone(),
                };
                self.relay
                    .broadcast(Some(self.id()), join_notice(&name))
                    .await?;
            }
            ConnectionState::Active { display_name } => {
                let name = display_name.clone();
                self.relay.audit(&self.record, &name, &text).await;
                let report = self
                    .relay
                    .broadcast(Some(self.id()), chat_notice(&name, &text))
                    .await?;
                counter!("picochat_messages_relayed_total", 1);
                debug!(
                    connection_id = %self.id(),
                    delivered = report.delivered,
                    evicted = report.evicted,
                    "chat relayed"
                );
            }
            ConnectionState::Closed => {
                debug!(connection_id = %self.id(), "payload after close ignored");
            }
        }

        Ok(())
    }

    /// Consumes inbound payloads until the stream ends, the outbound side
    /// closes, or a payload fails to decode; then deregisters the connection.
    pub async fn run<S, E>(mut self, inbound: S) -> Result<(), HandlerError>
    where
        S: Stream<Item = Result<String, E>>,
        E: fmt::Display,
    {
        tokio::pin!(inbound);
        let outbound = self.record.outbound().clone();
        let mut outcome = Ok(());

        loop {
            tokio::select! {
                biased;

                _ = outbound.closed() => {
                    debug!(connection_id = %self.id(), "outbound channel closed");
                    break;
                }
                frame = inbound.next() => match frame {
                    Some(Ok(payload)) => {
                        if let Err(err) = self.on_payload(&payload).await {
                            if matches!(err, HandlerError::Decoding(_)) {
                                counter!("picochat_decode_failures_total", 1);
                            }
                            warn!(connection_id = %self.id(), error = %err, "closing connection");
                            outcome = Err(err);
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(connection_id = %self.id(), error = %err, "error receiving frame");
                        break;
                    }
                    None => {
                        debug!(connection_id = %self.id(), "inbound stream ended");
                        break;
                    }
                },
            }
        }

        self.close().await;
        outcome
    }

    async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        if let Err(err) = self.relay.disconnect(self.id()).await {
            warn!(connection_id = %self.id(), error = %err, "failed to announce departure");
        }
    }
}

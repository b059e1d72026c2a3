//! WebSocket broadcast relay: the first packet a client sends names it, every
//! later packet is relayed to the other connected clients.

pub mod audit;
pub mod client;
pub mod config;
pub mod handler;
pub mod registry;
pub mod relay;
pub mod server;
pub mod telemetry;

pub use config::{RelayConfig, ServerConfig};
pub use handler::{ConnectionHandler, ConnectionState, HandlerError};
pub use registry::{ConnectionId, Liveness};
pub use relay::{BroadcastReport, Relay};

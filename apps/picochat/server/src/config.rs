use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};

const DEFAULT_OUTBOUND_BUFFER: usize = 64;

#[derive(Debug, Parser)]
#[command(
    name = "picochat-server",
    author,
    version,
    about = "picochat WebSocket broadcast relay and debug client"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the relay (default when no subcommand is given).
    Serve(ServeArgs),
    /// Join a relay from the terminal: the name is sent first, then every
    /// stdin line as a chat message.
    Connect {
        /// Relay URL, e.g. ws://localhost:8888
        #[arg(short, long, default_value = "ws://localhost:8888")]
        url: String,

        /// Display name sent as the handshake packet.
        #[arg(short, long)]
        name: String,
    },
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the websocket listener to.
    #[arg(long, env = "PICOCHAT_LISTEN_ADDR", default_value = "0.0.0.0:8888")]
    pub listen_addr: String,

    /// File chat messages are appended to.
    #[arg(long, env = "PICOCHAT_AUDIT_LOG", default_value = "log.txt")]
    pub audit_log: PathBuf,

    /// Relay chat without writing the audit log.
    #[arg(long, env = "PICOCHAT_DISABLE_AUDIT", default_value_t = false)]
    pub disable_audit: bool,

    /// Packets queued per connection before broadcasts wait on it.
    #[arg(long, env = "PICOCHAT_OUTBOUND_BUFFER", default_value_t = DEFAULT_OUTBOUND_BUFFER)]
    pub outbound_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "PICOCHAT_SHUTDOWN_GRACE_SECS", default_value_t = 1)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub shutdown_grace: Duration,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// `None` disables auditing.
    pub audit_log: Option<PathBuf>,
    pub outbound_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            audit_log: None,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.outbound_buffer == 0 {
            bail!("outbound buffer must hold at least one packet");
        }

        Ok(ServerConfig {
            listen_addr,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
            relay: RelayConfig {
                audit_log: (!args.disable_audit).then_some(args.audit_log),
                outbound_buffer: args.outbound_buffer,
            },
        })
    }
}

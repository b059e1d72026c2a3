use anyhow::{Context, Result};
use clap::Parser;
use picochat_server::{
    client,
    config::{Cli, Command},
    server::{self, AppState},
    telemetry::{self, Telemetry},
    Relay, ServerConfig,
};
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let args = match cli.command {
        Some(Command::Connect { url, name }) => {
            telemetry::init_tracing()?;
            return client::run_debug_client(url, name).await;
        }
        Some(Command::Serve(args)) => args,
        None => cli.serve,
    };

    let telemetry = Telemetry::init()?;
    let config = ServerConfig::try_from(args)?;
    info!(
        listen_addr = %config.listen_addr,
        audit_log = ?config.relay.audit_log,
        outbound_buffer = config.relay.outbound_buffer,
        "starting picochat relay"
    );

    run(config, telemetry).await
}

async fn run(config: ServerConfig, telemetry: Telemetry) -> Result<()> {
    let state = AppState {
        relay: Relay::new(config.relay.clone()),
        metrics: Some(telemetry.metrics_handle()),
    };

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("picochat relay listening on {}", config.listen_addr);

    server::serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

use std::{io, net::SocketAddr, path::PathBuf};

use chrono::{Local, SecondsFormat};
use metrics::counter;
use thiserror::Error;
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to open audit log {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to append to audit log {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Append-only file of chat message metadata.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Appends one chat message. Failures are logged and counted, never
    /// returned, so relaying continues when the disk does not cooperate.
    pub async fn record(&self, remote_addr: SocketAddr, display_name: &str, message: &str) {
        let entry = render_entry(&timestamp(), remote_addr, display_name, message);
        info!(
            remote_ip = %remote_addr.ip(),
            display_name,
            message,
            "chat message"
        );

        if let Err(err) = self.append(&entry).await {
            counter!("picochat_audit_failures_total", 1);
            warn!(error = %err, "audit log write failed");
        }
    }

    async fn append(&self, entry: &str) -> Result<(), AuditError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|source| AuditError::Open {
                path: self.path.clone(),
                source,
            })?;
        file.write_all(entry.as_bytes())
            .await
            .map_err(|source| AuditError::Write {
                path: self.path.clone(),
                source,
            })?;
        file.flush().await.map_err(|source| AuditError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

fn timestamp() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn render_entry(timestamp: &str, remote_addr: SocketAddr, display_name: &str, message: &str) -> String {
    format!(
        "{timestamp}\n{}\n{display_name}\n{message}\n\n",
        remote_addr.ip()
    )
}

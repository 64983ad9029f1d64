use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, Level};

use crate::config::LoggingConfig;

/// Structured access log record, one JSON line per forwarded request
#[derive(Debug, Clone, serde::Serialize)]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub server: String,
    pub protocol: String,
    pub client_ip: String,
    pub method: String,
    pub uri: String,
    pub status: u16,
    pub duration_ms: u64,
    pub upstream: Option<String>,
    pub request_id: String,
}

/// Per-instance access logger appending JSON lines to the configured file.
/// The instance's configured level gates which records are written; error
/// responses record at error, client errors at warn, everything else at
/// info. Rotation is left to the log collection tooling.
pub struct AccessLogger {
    server: String,
    min_level: Level,
    writer: Option<Arc<Mutex<tokio::fs::File>>>,
}

impl AccessLogger {
    pub fn new(server_name: &str, config: &LoggingConfig) -> Self {
        let path = config
            .file
            .clone()
            .unwrap_or_else(|| format!("logs/{}.log", server_name));

        let writer = match Self::open_writer(&path) {
            Ok(file) => Some(Arc::new(Mutex::new(file))),
            Err(e) => {
                error!(server = server_name, %path, error = %e, "failed to open access log");
                None
            }
        };

        Self {
            server: server_name.to_string(),
            min_level: config.level.parse().unwrap_or(Level::INFO),
            writer,
        }
    }

    /// Logger that discards entries, for instances without file logging
    pub fn disabled(server_name: &str) -> Self {
        Self {
            server: server_name.to_string(),
            min_level: Level::INFO,
            writer: None,
        }
    }

    fn open_writer(path: &str) -> std::io::Result<tokio::fs::File> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        Ok(tokio::fs::File::from_std(file))
    }

    pub fn entry(
        &self,
        protocol: &str,
        client_ip: IpAddr,
        method: &str,
        uri: &str,
        status: u16,
        duration: Duration,
        upstream: Option<&str>,
        request_id: &str,
    ) -> AccessLogEntry {
        AccessLogEntry {
            timestamp: Utc::now(),
            level: severity(status).to_string().to_lowercase(),
            server: self.server.clone(),
            protocol: protocol.to_string(),
            client_ip: client_ip.to_string(),
            method: method.to_string(),
            uri: uri.to_string(),
            status,
            duration_ms: duration.as_millis() as u64,
            upstream: upstream.map(|s| s.to_string()),
            request_id: request_id.to_string(),
        }
    }

    pub async fn write(&self, entry: &AccessLogEntry) {
        if severity(entry.status) > self.min_level {
            return;
        }
        let Some(writer) = &self.writer else {
            return;
        };

        let line = match serde_json::to_string(entry) {
            Ok(json) => format!("{}\n", json),
            Err(_) => return,
        };

        let mut file = writer.lock().await;
        if let Err(e) = file.write_all(line.as_bytes()).await {
            error!(server = %self.server, error = %e, "failed to write access log");
            return;
        }
        let _ = file.flush().await;
    }
}

/// Record severity from the response status: upstream failures at error,
/// client errors at warn, successes at info
fn severity(status: u16) -> Level {
    match status {
        s if s >= 500 => Level::ERROR,
        s if s >= 400 => Level::WARN,
        _ => Level::INFO,
    }
}

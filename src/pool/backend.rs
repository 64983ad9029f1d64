use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use url::Url;

use crate::config::UpstreamConfig;
use crate::error::{ProxyError, Result};

/// A single upstream server with immutable identity and atomic runtime state
#[derive(Debug)]
pub struct Backend {
    pub name: String,
    pub url: Url,
    pub weight: u32,
    pub health_path: String,
    healthy: AtomicBool,
    in_flight: AtomicU64,
}

impl Backend {
    pub fn from_config(config: &UpstreamConfig) -> Result<Self> {
        let url = Url::parse(&config.url)
            .map_err(|e| ProxyError::Config(format!("invalid upstream URL {}: {}", config.url, e)))?;

        Ok(Self {
            name: config.name.clone(),
            url,
            weight: config.weight,
            health_path: config.health_check.clone(),
            // assume healthy until the first probe says otherwise
            healthy: AtomicBool::new(true),
            in_flight: AtomicU64::new(0),
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// WebSocket-scheme backends are healthy by construction and skip probing
    pub fn is_websocket(&self) -> bool {
        matches!(self.url.scheme(), "ws" | "wss")
    }

    /// Compose the health probe URL from the backend URL and health path
    pub fn health_url(&self) -> String {
        format!(
            "{}{}",
            self.url.as_str().trim_end_matches('/'),
            self.health_path
        )
    }

    fn acquire_raw(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    fn release_raw(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Scoped acquisition of a backend's in-flight counter. The decrement runs
/// on drop, so release is guaranteed on every exit path.
#[derive(Debug)]
pub struct InFlightGuard {
    backend: Arc<Backend>,
}

impl InFlightGuard {
    pub fn acquire(backend: Arc<Backend>) -> Self {
        backend.acquire_raw();
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.backend.release_raw();
    }
}

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pool::backend::Backend;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Periodic background probe that flips each backend's health flag.
/// Probes run concurrently across backends and never block the tick.
pub struct HealthChecker {
    client: reqwest::Client,
    // last observed status per backend, so transitions log once
    seen: Arc<DashMap<String, bool>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .expect("failed to create health probe client");

        Self {
            client,
            seen: Arc::new(DashMap::new()),
        }
    }

    pub async fn run(self, backends: Vec<Arc<Backend>>, token: CancellationToken) {
        let mut interval = tokio::time::interval(CHECK_INTERVAL);
        // the first tick completes immediately; probes start one period in
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for backend in &backends {
                        let checker = self.clone();
                        let backend = Arc::clone(backend);
                        tokio::spawn(async move {
                            checker.probe(&backend).await;
                        });
                    }
                }
                _ = token.cancelled() => {
                    debug!("health check loop cancelled");
                    return;
                }
            }
        }
    }

    async fn probe(&self, backend: &Backend) {
        if backend.is_websocket() {
            backend.set_healthy(true);
            return;
        }

        let healthy = match self.client.get(backend.health_url()).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(error) => {
                debug!(backend = %backend.name, %error, "health probe failed");
                false
            }
        };

        backend.set_healthy(healthy);
        self.record_transition(backend, healthy);
    }

    fn record_transition(&self, backend: &Backend, healthy: bool) {
        let changed = self
            .seen
            .insert(backend.name.clone(), healthy)
            .map_or(true, |previous| previous != healthy);

        if changed {
            if healthy {
                debug!(backend = %backend.name, "backend became healthy");
            } else {
                warn!(backend = %backend.name, url = %backend.url, "backend became unhealthy");
            }
        }
    }
}

impl Clone for HealthChecker {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            seen: Arc::clone(&self.seen),
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;

    fn backend(url: &str) -> Arc<Backend> {
        Arc::new(
            Backend::from_config(&UpstreamConfig {
                name: "b".to_string(),
                url: url.to_string(),
                weight: 1,
                health_check: "/health".to_string(),
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_websocket_backend_skips_probe() {
        let checker = HealthChecker::new();
        let backend = backend("ws://127.0.0.1:1");
        backend.set_healthy(false);

        checker.probe(&backend).await;
        assert!(backend.is_healthy());
    }

    #[tokio::test]
    async fn test_unreachable_backend_marked_unhealthy() {
        let checker = HealthChecker::new();
        // nothing listens on this port; the probe errors out fast
        let backend = backend("http://127.0.0.1:1");

        checker.probe(&backend).await;
        assert!(!backend.is_healthy());
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_loop() {
        let checker = HealthChecker::new();
        let token = CancellationToken::new();
        let task = tokio::spawn(checker.run(vec![backend("http://127.0.0.1:1")], token.clone()));

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop should exit on cancellation")
            .unwrap();
    }
}

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{ProxyError, Result};
use crate::server::instance::ProxyInstance;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);
const SHUTDOWN_HARD_LIMIT: Duration = Duration::from_secs(35);

/// Owns every proxy instance: builds them from configuration, starts them in
/// parallel with one aggregated error channel, and orchestrates coordinated
/// graceful shutdown with a deadline.
pub struct Supervisor {
    config: Config,
    instances: RwLock<Vec<Arc<ProxyInstance>>>,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            instances: RwLock::new(Vec::new()),
        }
    }

    /// Build every enabled instance. The first failure aborts creation;
    /// already-created instances are shut down best-effort.
    pub async fn create_instances(&self) -> Result<()> {
        let enabled = self.config.enabled_servers();
        if enabled.is_empty() {
            return Err(ProxyError::Config(
                "no enabled servers found in configuration".to_string(),
            ));
        }

        let mut created: Vec<Arc<ProxyInstance>> = Vec::with_capacity(enabled.len());
        for server in enabled {
            match ProxyInstance::from_config(server, &self.config) {
                Ok(instance) => created.push(instance),
                Err(e) => {
                    error!(server = %server.name, error = %e, "failed to create server instance");
                    for instance in &created {
                        instance.shutdown(Instant::now()).await;
                    }
                    return Err(e);
                }
            }
        }

        info!(count = created.len(), "created server instances");
        *self.instances.write().await = created;
        Ok(())
    }

    /// Start every instance concurrently. Returns the aggregated error
    /// channel once each instance has signaled readiness; the first bind
    /// failure is propagated instead.
    pub async fn start_all(&self) -> Result<mpsc::Receiver<ProxyError>> {
        let instances = self.instances.read().await.clone();
        let (error_tx, error_rx) = mpsc::channel(instances.len() * 3);

        let starts = instances.iter().map(|instance| {
            let error_tx = error_tx.clone();
            async move { instance.start(error_tx).await }
        });

        for result in futures_util::future::join_all(starts).await {
            result?;
        }

        info!(count = instances.len(), "all server instances started");
        Ok(error_rx)
    }

    /// Full lifecycle: create, start, block until a shutdown signal or a
    /// fatal instance error, then drain everything.
    pub async fn run(&self) -> Result<()> {
        self.create_instances().await?;

        let mut error_rx = match self.start_all().await {
            Ok(error_rx) => error_rx,
            Err(e) => {
                self.shutdown_all().await;
                return Err(e);
            }
        };

        let fatal = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt signal, stopping all servers");
                None
            }
            _ = terminate_signal() => {
                info!("received terminate signal, stopping all servers");
                None
            }
            Some(e) = error_rx.recv() => {
                error!(error = %e, "server error occurred, shutting down all servers");
                Some(e)
            }
        };

        self.shutdown_all().await;
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Shut down every instance in parallel against a shared deadline. Each
    /// instance drains in its own task so a panicking instance cannot abort
    /// the others; the outer hard limit guarantees termination.
    pub async fn shutdown_all(&self) {
        let instances = self.instances.read().await.clone();
        if instances.is_empty() {
            return;
        }

        info!("starting graceful shutdown of all server instances");
        let deadline = Instant::now() + SHUTDOWN_DEADLINE;

        let handles: Vec<_> = instances
            .into_iter()
            .map(|instance| {
                tokio::spawn(async move {
                    instance.shutdown(deadline).await;
                })
            })
            .collect();

        let drain = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        warn!("recovered from panic during instance shutdown");
                    }
                }
            }
        };

        if tokio::time::timeout(SHUTDOWN_HARD_LIMIT, drain).await.is_err() {
            warn!("graceful shutdown timeout exceeded, forcing exit");
        }

        info!("multi-server shutdown completed");
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServerConfig, ServerKind, UpstreamConfig};

    fn server(name: &str, port: u16) -> ServerConfig {
        ServerConfig {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port,
            websocket_port: None,
            kind: ServerKind::Http,
            upstreams: vec!["app1".to_string()],
            enabled: true,
            load_balancer: None,
            logging: None,
            proxy: None,
            cors: None,
        }
    }

    fn config(servers: Vec<ServerConfig>) -> Config {
        Config {
            servers,
            upstreams: vec![UpstreamConfig {
                name: "app1".to_string(),
                url: "http://127.0.0.1:9001".to_string(),
                weight: 1,
                health_check: "/health".to_string(),
            }],
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_no_enabled_servers_is_an_error() {
        let mut disabled = server("edge", 0);
        disabled.enabled = false;
        let supervisor = Supervisor::new(config(vec![disabled]));

        assert!(supervisor.create_instances().await.is_err());
    }

    #[tokio::test]
    async fn test_creation_aborts_on_first_bad_instance() {
        let mut cfg = config(vec![server("good", 0), server("bad", 0)]);
        cfg.upstreams.push(UpstreamConfig {
            name: "broken".to_string(),
            url: ":// not a url".to_string(),
            weight: 1,
            health_check: "/health".to_string(),
        });
        cfg.servers[1].upstreams = vec!["broken".to_string()];

        let supervisor = Supervisor::new(cfg);
        assert!(supervisor.create_instances().await.is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown_two_instances() {
        let supervisor = Supervisor::new(config(vec![server("edge-a", 0), server("edge-b", 0)]));

        supervisor.create_instances().await.unwrap();
        let mut error_rx = supervisor.start_all().await.unwrap();

        supervisor.shutdown_all().await;
        // shutdown is coordinated, not error-driven
        assert!(error_rx.try_recv().is_err());

        // second shutdown is a no-op
        supervisor.shutdown_all().await;
    }
}

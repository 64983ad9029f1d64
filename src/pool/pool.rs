use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{LoadBalancerConfig, LoadBalancerMethod, UpstreamConfig};
use crate::error::Result;
use crate::pool::backend::{Backend, InFlightGuard};
use crate::pool::health::HealthChecker;

/// A thread-safe set of backends with health state and selection algorithms.
/// The backend sequence is frozen after construction; selection runs under a
/// read lock so shutdown can fence future selections.
pub struct UpstreamPool {
    backends: Vec<Arc<Backend>>,
    method: LoadBalancerMethod,
    counter: AtomicU64,
    timeout: Duration,
    retries: u32,
    state: RwLock<PoolState>,
    health: Mutex<HealthLifecycle>,
}

#[derive(Debug, Default)]
struct PoolState {
    closed: bool,
}

/// Single-shot health check lifecycle; double-start and double-stop are no-ops
#[derive(Debug, Default)]
struct HealthLifecycle {
    stopped: bool,
    token: Option<CancellationToken>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl UpstreamPool {
    pub fn new(upstreams: &[UpstreamConfig], config: &LoadBalancerConfig) -> Result<Self> {
        let backends = upstreams
            .iter()
            .map(Backend::from_config)
            .map(|b| b.map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            backends,
            method: config.method,
            counter: AtomicU64::new(0),
            timeout: config.timeout,
            retries: config.max_retries,
            state: RwLock::new(PoolState::default()),
            health: Mutex::new(HealthLifecycle::default()),
        })
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Select one backend per the configured policy, or `None` when the pool
    /// is empty, closed, or every backend is unhealthy.
    pub fn select(&self) -> Option<Arc<Backend>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if state.closed || self.backends.is_empty() {
            return None;
        }

        let healthy: Vec<Arc<Backend>> = self
            .backends
            .iter()
            .filter(|b| b.is_healthy())
            .cloned()
            .collect();
        drop(state);

        if healthy.is_empty() {
            return None;
        }

        let selected = match self.method {
            LoadBalancerMethod::RoundRobin => self.round_robin(),
            LoadBalancerMethod::WeightedRoundRobin => self.weighted_round_robin(&healthy),
            LoadBalancerMethod::LeastConnections => self.least_connections(&healthy),
            LoadBalancerMethod::Single => healthy.first().cloned(),
        };

        if let Some(ref backend) = selected {
            debug!(backend = %backend.name, "selected upstream");
        }
        selected
    }

    /// Return the named backend iff it is healthy
    pub fn select_by_name(&self, name: &str) -> Option<Arc<Backend>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return None;
        }
        self.backends
            .iter()
            .find(|b| b.name == name && b.is_healthy())
            .cloned()
    }

    /// Atomically increment the backend's in-flight counter; the returned
    /// guard decrements it on drop.
    pub fn acquire(&self, backend: Arc<Backend>) -> InFlightGuard {
        InFlightGuard::acquire(backend)
    }

    pub fn set_health(&self, backend: &Backend, healthy: bool) {
        backend.set_healthy(healthy);
    }

    /// Walk pool order from the shared counter, skipping unhealthy entries
    fn round_robin(&self) -> Option<Arc<Backend>> {
        let len = self.backends.len() as u64;
        for _ in 0..self.backends.len() {
            let index = (self.counter.fetch_add(1, Ordering::Relaxed) % len) as usize;
            let backend = &self.backends[index];
            if backend.is_healthy() {
                return Some(Arc::clone(backend));
            }
        }
        // concurrent walks can exhaust the probes without covering every slot
        self.backends.iter().find(|b| b.is_healthy()).cloned()
    }

    fn weighted_round_robin(&self, healthy: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let total: u64 = healthy.iter().map(|b| u64::from(b.weight)).sum();
        if total == 0 {
            return self.round_robin();
        }

        let mut draw = self.counter.fetch_add(1, Ordering::Relaxed) % total;
        for backend in healthy {
            let weight = u64::from(backend.weight);
            if draw < weight {
                return Some(Arc::clone(backend));
            }
            draw -= weight;
        }
        healthy.first().cloned()
    }

    fn least_connections(&self, healthy: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        // min_by_key keeps the first minimum, which preserves pool-order ties
        healthy
            .iter()
            .min_by_key(|b| b.in_flight())
            .map(Arc::clone)
    }

    /// Start the background health checker. Idempotent; a no-op after stop.
    pub fn start_health_checks(&self) {
        let mut lifecycle = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if lifecycle.stopped || lifecycle.task.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let checker = HealthChecker::new();
        let backends = self.backends.clone();
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            checker.run(backends, task_token).await;
        });

        lifecycle.token = Some(token);
        lifecycle.task = Some(task);
        info!(backends = self.backends.len(), "health checks started");
    }

    /// Stop the background health checker. Double-stop is tolerated.
    pub fn stop_health_checks(&self) {
        let mut lifecycle = self.health.lock().unwrap_or_else(|e| e.into_inner());
        if lifecycle.stopped {
            return;
        }
        lifecycle.stopped = true;

        if let Some(token) = lifecycle.token.take() {
            token.cancel();
        }
        if let Some(task) = lifecycle.task.take() {
            task.abort();
        }
        info!("health checks stopped");
    }

    /// Fence future selections; in-flight requests keep their backends.
    pub fn close(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
    }
}

impl std::fmt::Debug for UpstreamPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamPool")
            .field("backends", &self.backends.len())
            .field("method", &self.method)
            .field("retries", &self.retries)
            .finish()
    }
}

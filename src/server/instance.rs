use axum::extract::{ConnectInfo, FromRequestParts, Request, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{Config, ProxyOptions, ServerConfig, ServerKind};
use crate::error::{ProxyError, Result};
use crate::logging::AccessLogger;
use crate::pool::UpstreamPool;
use crate::proxy::{is_websocket_request, CorsFilter, HttpForwarder, WebSocketRelay};
use crate::server::{http3::Http3Server, tls};

/// One proxy endpoint: a listener bound to an upstream pool, forwarder,
/// optional WebSocket relay, and access logger.
pub struct ProxyInstance {
    name: String,
    kind: ServerKind,
    address: String,
    websocket_address: String,
    options: ProxyOptions,
    http_pool: Arc<UpstreamPool>,
    websocket_pool: Arc<UpstreamPool>,
    forwarder: Arc<HttpForwarder>,
    relay: Arc<WebSocketRelay>,
    token: CancellationToken,
    state: RwLock<InstanceState>,
}

#[derive(Default)]
struct InstanceState {
    started: bool,
    shut_down: bool,
    local_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Clone)]
struct HttpState {
    forwarder: Arc<HttpForwarder>,
    // present when enable_websocket lets the HTTP listener relay upgrades
    relay: Option<Arc<WebSocketRelay>>,
    proto: &'static str,
}

#[derive(Clone)]
struct WebSocketState {
    forwarder: Arc<HttpForwarder>,
    relay: Arc<WebSocketRelay>,
}

impl ProxyInstance {
    pub fn from_config(server: &ServerConfig, config: &Config) -> Result<Arc<Self>> {
        let lb_config = config.load_balancer_for(server);
        let options = config.proxy_for(server);
        let cors = config.cors_for(server);
        let logging = config.logging_for(server);

        let upstreams = config.upstreams_by_names(&server.upstreams);
        let websocket_upstreams = config.websocket_upstreams_by_names(&server.upstreams);

        let http_pool = Arc::new(UpstreamPool::new(&upstreams, &lb_config)?);
        let websocket_pool = Arc::new(UpstreamPool::new(&websocket_upstreams, &lb_config)?);

        let logger = Arc::new(AccessLogger::new(&server.name, &logging));
        let forwarder = Arc::new(HttpForwarder::new(
            Arc::clone(&http_pool),
            options.clone(),
            CorsFilter::new(cors),
            Arc::clone(&logger),
        )?);
        let relay = Arc::new(WebSocketRelay::new(
            Arc::clone(&websocket_pool),
            &options,
            logger,
        ));

        Ok(Arc::new(Self {
            name: server.name.clone(),
            kind: server.kind,
            address: server.address(),
            websocket_address: server.websocket_address(),
            options,
            http_pool,
            websocket_pool,
            forwarder,
            relay,
            token: CancellationToken::new(),
            state: RwLock::new(InstanceState::default()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ServerKind {
        self.kind
    }

    pub fn http_pool(&self) -> &Arc<UpstreamPool> {
        &self.http_pool
    }

    pub fn websocket_pool(&self) -> &Arc<UpstreamPool> {
        &self.websocket_pool
    }

    /// The bound listener address, available once started
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.read().await.local_addr
    }

    /// Delegates to the relay's upgrade detection
    pub fn is_websocket_request(&self, headers: &HeaderMap) -> bool {
        is_websocket_request(headers)
    }

    /// Bind the listener(s) and begin accepting. Returns once every listener
    /// is bound, which is the instance's readiness point; unrecoverable
    /// listener errors after that are published to `error_tx`.
    pub async fn start(&self, error_tx: mpsc::Sender<ProxyError>) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if state.started || state.shut_down {
                return Ok(());
            }
            state.started = true;
        }

        let mut tasks = Vec::new();
        let local_addr = match self.kind {
            ServerKind::Websocket => {
                let (task, addr) = self.start_websocket_listener(error_tx.clone()).await?;
                tasks.push(task);
                addr
            }
            ServerKind::Http => {
                let (task, addr) = self.start_http_listener(error_tx.clone()).await?;
                tasks.push(task);
                if self.options.enable_http3 {
                    tasks.push(self.start_http3_listener().await?);
                }
                addr
            }
        };

        self.http_pool.start_health_checks();
        self.websocket_pool.start_health_checks();

        {
            let mut state = self.state.write().await;
            state.tasks = tasks;
            state.local_addr = Some(local_addr);
        }
        info!(server = %self.name, address = %self.address, "server instance started");
        Ok(())
    }

    /// Plain HTTP/1.1, or TLS with ALPN h2 + http/1.1 when HTTP/2 is enabled
    async fn start_http_listener(
        &self,
        error_tx: mpsc::Sender<ProxyError>,
    ) -> Result<(JoinHandle<()>, SocketAddr)> {
        let listener = TcpListener::bind(&self.address)
            .await
            .map_err(|e| ProxyError::Listener(format!("failed to bind {}: {}", self.address, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::Listener(e.to_string()))?;

        if self.options.enable_http2 {
            let tls_config = tls::load_tls_config(
                self.options.tls_cert_file.as_deref().unwrap_or_default(),
                self.options.tls_key_file.as_deref().unwrap_or_default(),
                self.options.enable_http3,
            )?;

            info!(server = %self.name, address = %self.address, "TLS listener bound");
            let forwarder = Arc::clone(&self.forwarder);
            let token = self.token.clone();
            let task = tokio::spawn(async move {
                tls::serve(listener, tls_config, forwarder, token).await;
            });
            return Ok((task, local_addr));
        }

        let state = HttpState {
            forwarder: Arc::clone(&self.forwarder),
            relay: self
                .options
                .enable_websocket
                .then(|| Arc::clone(&self.relay)),
            proto: "http",
        };
        let app = self.apply_layers(Router::new().fallback(http_handler).with_state(state));

        info!(server = %self.name, address = %self.address, "HTTP listener bound");
        let token = self.token.clone();
        let name = self.name.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(token.cancelled_owned());

            if let Err(e) = serve.await {
                let _ = error_tx
                    .send(ProxyError::Listener(format!("server {}: {}", name, e)))
                    .await;
            }
        });
        Ok((task, local_addr))
    }

    /// Single listener handing upgrades to the relay and everything else to
    /// the HTTP forwarder
    async fn start_websocket_listener(
        &self,
        error_tx: mpsc::Sender<ProxyError>,
    ) -> Result<(JoinHandle<()>, SocketAddr)> {
        let listener = TcpListener::bind(&self.websocket_address).await.map_err(|e| {
            ProxyError::Listener(format!("failed to bind {}: {}", self.websocket_address, e))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ProxyError::Listener(e.to_string()))?;

        let state = WebSocketState {
            forwarder: Arc::clone(&self.forwarder),
            relay: Arc::clone(&self.relay),
        };
        let app =
            self.apply_layers(Router::new().fallback(websocket_handler).with_state(state));

        info!(server = %self.name, address = %self.websocket_address, "WebSocket listener bound");
        let token = self.token.clone();
        let name = self.name.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(token.cancelled_owned());

            if let Err(e) = serve.await {
                let _ = error_tx
                    .send(ProxyError::Listener(format!("server {}: {}", name, e)))
                    .await;
            }
        });
        Ok((task, local_addr))
    }

    async fn start_http3_listener(&self) -> Result<JoinHandle<()>> {
        let tls_config = tls::load_tls_config(
            self.options.tls_cert_file.as_deref().unwrap_or_default(),
            self.options.tls_key_file.as_deref().unwrap_or_default(),
            true,
        )?;

        let host = self
            .address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or("0.0.0.0");
        let addr: SocketAddr = format!("{}:{}", host, self.options.http3_port)
            .parse()
            .map_err(|e| ProxyError::Config(format!("invalid HTTP/3 address: {}", e)))?;

        let server = Http3Server::bind(
            addr,
            &tls_config,
            self.options.keep_alive_timeout,
            Arc::clone(&self.forwarder),
        )?;

        info!(server = %self.name, %addr, "HTTP/3 listener bound");
        let token = self.token.clone();
        Ok(tokio::spawn(async move {
            server.run(token).await;
        }))
    }

    fn apply_layers<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let mut router = router
            .layer(TraceLayer::new_for_http())
            .layer(TimeoutLayer::new(self.options.request_timeout))
            .layer(tower::limit::ConcurrencyLimitLayer::new(self.options.max_connections));

        if self.options.enable_compression {
            router = router.layer(CompressionLayer::new());
        }
        router
    }

    /// Stop accepting immediately, drain in-flight connections up to the
    /// deadline, then force-close and stop health checks. Idempotent, and
    /// safe to call on an instance that never started.
    pub async fn shutdown(&self, deadline: Instant) {
        let tasks = {
            let mut state = self.state.write().await;
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            std::mem::take(&mut state.tasks)
        };

        info!(server = %self.name, "shutting down server instance");
        self.token.cancel();

        for mut task in tasks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut task).await.is_err() {
                warn!(server = %self.name, "drain deadline exceeded, force-closing listener");
                task.abort();
            }
        }

        self.http_pool.close();
        self.websocket_pool.close();
        self.http_pool.stop_health_checks();
        self.websocket_pool.stop_health_checks();

        info!(server = %self.name, "server instance shutdown completed");
    }
}

async fn http_handler(
    State(state): State<HttpState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    if let Some(relay) = &state.relay {
        if is_websocket_request(req.headers()) {
            let (mut parts, _body) = req.into_parts();
            return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
                Ok(ws) => relay.handle_upgrade(ws, &parts, client_addr),
                Err(rejection) => rejection.into_response(),
            };
        }
    }

    match state.forwarder.forward(req, client_addr, state.proto).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn websocket_handler(
    State(state): State<WebSocketState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    if is_websocket_request(req.headers()) {
        let (mut parts, _body) = req.into_parts();
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) => state.relay.handle_upgrade(ws, &parts, client_addr),
            Err(rejection) => rejection.into_response(),
        };
    }

    match state.forwarder.forward(req, client_addr, "http").await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

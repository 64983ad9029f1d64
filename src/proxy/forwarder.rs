use axum::body::Body;
use axum::http::{header, request::Parts, HeaderMap, Response, Uri};
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ProxyOptions;
use crate::error::{ProxyError, Result};
use crate::logging::AccessLogger;
use crate::pool::{Backend, UpstreamPool};
use crate::proxy::cors::{CorsDecision, CorsFilter};

const RETRY_DELAY: Duration = Duration::from_millis(50);

/// The single forwarding state machine shared by every listener:
/// size gate -> parse -> CORS -> select -> acquire -> dispatch with bounded
/// retry -> stream response. Each listener adapts its native request type to
/// this entry point exactly once.
pub struct HttpForwarder {
    pool: Arc<UpstreamPool>,
    client: reqwest::Client,
    options: ProxyOptions,
    cors: CorsFilter,
    logger: Arc<AccessLogger>,
}

impl HttpForwarder {
    pub fn new(
        pool: Arc<UpstreamPool>,
        options: ProxyOptions,
        cors: CorsFilter,
        logger: Arc<AccessLogger>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(options.idle_conn_timeout)
            .pool_max_idle_per_host(options.max_idle_conns_per_host)
            .build()
            .map_err(|e| ProxyError::Internal(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            pool,
            client,
            options,
            cors,
            logger,
        })
    }

    pub fn pool(&self) -> &Arc<UpstreamPool> {
        &self.pool
    }

    /// Forward one client request and produce the response to write back.
    /// `proto` is the listener's protocol label, stamped into
    /// `X-Forwarded-Proto` and the access log.
    pub async fn forward(
        &self,
        req: axum::http::Request<Body>,
        client_addr: SocketAddr,
        proto: &'static str,
    ) -> Result<Response<Body>> {
        let request_id = Uuid::new_v4().to_string();
        let start = Instant::now();

        let (parts, body) = req.into_parts();
        let method = parts.method.to_string();
        let uri = parts.uri.to_string();

        let header_bytes: usize = parts
            .headers
            .iter()
            .map(|(name, value)| name.as_str().len() + value.len())
            .sum();
        if header_bytes > self.options.max_header_size {
            debug!(%request_id, size = header_bytes, "request headers exceed cap");
            return Err(ProxyError::PayloadTooLarge {
                size: header_bytes,
                max: self.options.max_header_size,
            });
        }

        let body_bytes = match Limited::new(body, self.options.max_body_size).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    debug!(%request_id, max = self.options.max_body_size, "request body exceeds cap");
                    return Err(ProxyError::PayloadTooLarge {
                        size: self.options.max_body_size + 1,
                        max: self.options.max_body_size,
                    });
                }
                debug!(%request_id, error = %e, "failed to read request body");
                return Err(ProxyError::BadRequest(e.to_string()));
            }
        };

        let origin = parts
            .headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        match self.cors.check(&parts.method, &parts.headers) {
            CorsDecision::Preflight(response) => {
                debug!(%request_id, ?origin, "answered CORS preflight");
                return Ok(response);
            }
            CorsDecision::Pass | CorsDecision::Reject => {}
        }

        let backend = self.pool.select().ok_or_else(|| {
            info!(%request_id, %method, %uri, "no healthy upstream available");
            ProxyError::NoUpstream
        })?;

        let guard = self.pool.acquire(backend.clone());
        let result = async {
            let upstream_response = self
                .dispatch(&parts, body_bytes, &backend, client_addr, proto, &request_id)
                .await?;
            self.build_response(upstream_response, origin.as_deref(), &request_id)
                .await
        }
        .await;
        drop(guard);

        match result {
            Ok(response) => {
                let entry = self.logger.entry(
                    proto,
                    client_addr.ip(),
                    &method,
                    &uri,
                    response.status().as_u16(),
                    start.elapsed(),
                    Some(&backend.name),
                    &request_id,
                );
                self.logger.write(&entry).await;

                debug!(
                    %request_id,
                    %method,
                    %uri,
                    backend = %backend.name,
                    status = response.status().as_u16(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "request proxied"
                );
                Ok(response)
            }
            Err(e) => {
                let entry = self.logger.entry(
                    proto,
                    client_addr.ip(),
                    &method,
                    &uri,
                    e.status_code().as_u16(),
                    start.elapsed(),
                    Some(&backend.name),
                    &request_id,
                );
                self.logger.write(&entry).await;
                Err(e)
            }
        }
    }

    /// Attempt the upstream request up to retries + 1 times. A retry is only
    /// possible while the upstream has not produced headers; reqwest resolves
    /// the future as soon as headers arrive, so every send error qualifies.
    async fn dispatch(
        &self,
        parts: &Parts,
        body: Bytes,
        backend: &Arc<Backend>,
        client_addr: SocketAddr,
        proto: &'static str,
        request_id: &str,
    ) -> Result<reqwest::Response> {
        let target = target_url(backend, &parts.uri);
        let attempts = self.pool.retries() + 1;
        let mut last_error = None;

        for attempt in 1..=attempts {
            let mut builder = self.client.request(parts.method.clone(), &target);

            // client headers are preserved verbatim; only Host is relocated,
            // travelling in X-Forwarded-Host while the request line carries
            // the backend authority
            for (name, value) in parts.headers.iter() {
                if name != header::HOST {
                    builder = builder.header(name, value);
                }
            }

            let forwarded_host = parts
                .headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
                .or_else(|| parts.uri.host().map(String::from))
                .unwrap_or_default();

            builder = builder
                .header("x-forwarded-for", client_addr.ip().to_string())
                .header("x-forwarded-proto", proto)
                .header("x-forwarded-host", forwarded_host)
                .header(header::CONNECTION, "keep-alive");

            if !body.is_empty() {
                builder = builder.body(body.clone());
            }

            match builder.send().await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    warn!(
                        %request_id,
                        backend = %backend.name,
                        %target,
                        attempt,
                        max_attempts = attempts,
                        %error,
                        "upstream dispatch failed"
                    );
                    last_error = Some(error);
                    if attempt < attempts {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }

        backend.set_healthy(false);
        let error = last_error.expect("at least one attempt was made");
        if error.is_timeout() {
            Err(ProxyError::Timeout(error.to_string()))
        } else {
            Err(ProxyError::Upstream(error.to_string()))
        }
    }

    /// Copy status, headers (minus the connection header) and body back to
    /// the client, synthesizing Content-Length when the upstream omitted it.
    async fn build_response(
        &self,
        upstream: reqwest::Response,
        origin: Option<&str>,
        request_id: &str,
    ) -> Result<Response<Body>> {
        let status = upstream.status();
        let upstream_headers = upstream.headers().clone();

        let body = tokio::time::timeout(self.options.response_timeout, upstream.bytes())
            .await
            .map_err(|_| {
                error!(%request_id, "timed out reading upstream response body");
                ProxyError::Timeout("upstream response body".to_string())
            })?
            .map_err(|e| {
                error!(%request_id, error = %e, "upstream response body failed mid-stream");
                ProxyError::Upstream(e.to_string())
            })?;

        let mut headers = HeaderMap::new();
        for (name, value) in upstream_headers.iter() {
            if name != header::CONNECTION {
                headers.append(name.clone(), value.clone());
            }
        }

        if !headers.contains_key(header::CONTENT_LENGTH) {
            headers.insert(header::CONTENT_LENGTH, body.len().into());
        }

        self.cors.decorate(&mut headers, origin);

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Retarget the request URI at the backend URL, preserving path and query
fn target_url(backend: &Backend, uri: &Uri) -> String {
    let base = backend.url.as_str().trim_end_matches('/');
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}{}", base, path_and_query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CorsOptions, LoadBalancerConfig, LoadBalancerMethod, UpstreamConfig};
    use axum::http::StatusCode;

    fn test_pool(upstreams: &[UpstreamConfig]) -> Arc<UpstreamPool> {
        let config = LoadBalancerConfig {
            method: LoadBalancerMethod::RoundRobin,
            timeout: Duration::from_secs(5),
            max_retries: 1,
        };
        Arc::new(UpstreamPool::new(upstreams, &config).unwrap())
    }

    fn forwarder(pool: Arc<UpstreamPool>, options: ProxyOptions, cors: CorsOptions) -> HttpForwarder {
        HttpForwarder::new(
            pool,
            options,
            CorsFilter::new(cors),
            Arc::new(AccessLogger::disabled("test")),
        )
        .unwrap()
    }

    fn request(method: &str, uri: &str, body: Body) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .body(body)
            .unwrap()
    }

    fn client_addr() -> SocketAddr {
        "192.0.2.10:40000".parse().unwrap()
    }

    #[test]
    fn test_target_url_preserves_path_and_query() {
        let backend = Backend::from_config(&UpstreamConfig {
            name: "a".to_string(),
            url: "http://127.0.0.1:9001/".to_string(),
            weight: 1,
            health_check: "/health".to_string(),
        })
        .unwrap();

        let uri: Uri = "/api/items?page=2".parse().unwrap();
        assert_eq!(
            target_url(&backend, &uri),
            "http://127.0.0.1:9001/api/items?page=2"
        );
    }

    #[tokio::test]
    async fn test_empty_pool_yields_503() {
        let forwarder = forwarder(test_pool(&[]), ProxyOptions::default(), CorsOptions::default());

        let err = forwarder
            .forward(request("GET", "/anything", Body::empty()), client_addr(), "http")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_oversize_body_rejected_before_selection() {
        let pool = test_pool(&[UpstreamConfig {
            name: "a".to_string(),
            url: "http://127.0.0.1:9001".to_string(),
            weight: 1,
            health_check: "/health".to_string(),
        }]);
        let backend = pool.backends()[0].clone();

        let options = ProxyOptions {
            max_body_size: 1024,
            ..ProxyOptions::default()
        };
        let forwarder = forwarder(pool, options, CorsOptions::default());

        let err = forwarder
            .forward(
                request("POST", "/upload", Body::from(vec![0u8; 2048])),
                client_addr(),
                "http",
            )
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        // no upstream contact: the in-flight counter never moved
        assert_eq!(backend.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_oversize_headers_rejected() {
        let pool = test_pool(&[]);
        let options = ProxyOptions {
            max_header_size: 16,
            ..ProxyOptions::default()
        };
        let forwarder = forwarder(pool, options, CorsOptions::default());

        let req = axum::http::Request::builder()
            .method("GET")
            .uri("/")
            .header("x-padding", "a".repeat(64))
            .body(Body::empty())
            .unwrap();

        let err = forwarder.forward(req, client_addr(), "http").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_preflight_short_circuits_without_selection() {
        // empty pool: reaching selection would 503, so a 200 proves the
        // preflight never consulted the pool
        let cors = CorsOptions {
            enabled: true,
            allowed_origins: vec!["https://app".to_string()],
            allowed_methods: vec!["GET".to_string(), "POST".to_string()],
            allowed_headers: vec!["Content-Type".to_string()],
            exposed_headers: vec![],
            allow_credentials: false,
            max_age: 600,
        };
        let forwarder = forwarder(test_pool(&[]), ProxyOptions::default(), cors);

        let req = axum::http::Request::builder()
            .method("OPTIONS")
            .uri("/x")
            .header("origin", "https://app")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();

        let response = forwarder.forward(req, client_addr(), "http").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "https://app"
        );
        assert_eq!(
            response.headers().get("access-control-max-age").unwrap(),
            "600"
        );
    }

    #[tokio::test]
    async fn test_retry_budget_bounds_dispatch_attempts() {
        // a listener that drops every connection before responding forces a
        // retryable error on each attempt; counting accepts counts dispatches
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = accepts.clone();
        tokio::spawn(async move {
            loop {
                if let Ok((stream, _)) = listener.accept().await {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    drop(stream);
                }
            }
        });

        let pool = test_pool(&[UpstreamConfig {
            name: "flaky".to_string(),
            url: format!("http://{}", addr),
            weight: 1,
            health_check: "/health".to_string(),
        }]);
        let forwarder = forwarder(pool, ProxyOptions::default(), CorsOptions::default());

        let err = forwarder
            .forward(request("GET", "/", Body::empty()), client_addr(), "http")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);

        // max_retries = 1 in the test pool, so exactly two dispatches
        assert_eq!(accepts.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreachable_backend_yields_502_and_marks_unhealthy() {
        // port 1 refuses connections immediately, so retries stay fast
        let pool = test_pool(&[UpstreamConfig {
            name: "dead".to_string(),
            url: "http://127.0.0.1:1".to_string(),
            weight: 1,
            health_check: "/health".to_string(),
        }]);
        let backend = pool.backends()[0].clone();
        let forwarder = forwarder(pool, ProxyOptions::default(), CorsOptions::default());

        let err = forwarder
            .forward(request("GET", "/", Body::empty()), client_addr(), "http")
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(!backend.is_healthy());
        assert_eq!(backend.in_flight(), 0);
    }
}

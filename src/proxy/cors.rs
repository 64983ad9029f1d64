use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::config::CorsOptions;

/// Outcome of evaluating a request against the CORS policy
pub enum CorsDecision {
    /// No CORS action; forward the request
    Pass,
    /// Write this preflight response and stop
    Preflight(Response),
    /// Origin not permitted; forward without adding CORS headers
    Reject,
}

/// Pure function over (request headers, policy). Preflights are answered
/// directly; everything else passes through, optionally decorated on the
/// response path.
#[derive(Debug, Clone)]
pub struct CorsFilter {
    options: CorsOptions,
}

impl CorsFilter {
    pub fn new(options: CorsOptions) -> Self {
        Self { options }
    }

    pub fn enabled(&self) -> bool {
        self.options.enabled
    }

    pub fn check(&self, method: &Method, headers: &HeaderMap) -> CorsDecision {
        if !self.options.enabled {
            return CorsDecision::Pass;
        }

        let origin = headers.get("origin").and_then(|v| v.to_str().ok());
        let allowed = match self.allowed_origin(origin) {
            Some(allowed) => allowed,
            None => return CorsDecision::Reject,
        };

        if method == Method::OPTIONS {
            return CorsDecision::Preflight(self.preflight_response(&allowed));
        }

        CorsDecision::Pass
    }

    /// Stamp CORS headers onto an outgoing response
    pub fn decorate(&self, headers: &mut HeaderMap, origin: Option<&str>) {
        if !self.options.enabled {
            return;
        }

        let allowed = match self.allowed_origin(origin) {
            Some(allowed) => allowed,
            None => return,
        };

        if let Ok(value) = HeaderValue::from_str(&allowed) {
            headers.insert("access-control-allow-origin", value);
        }
        if !self.options.exposed_headers.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.options.exposed_headers.join(", ")) {
                headers.insert("access-control-expose-headers", value);
            }
        }
        if self.options.allow_credentials {
            headers.insert(
                "access-control-allow-credentials",
                HeaderValue::from_static("true"),
            );
        }
    }

    /// The advertised allow-origin for this request, or `None` when the
    /// origin is not permitted. An empty or wildcard list permits every
    /// origin and advertises `*`.
    fn allowed_origin(&self, origin: Option<&str>) -> Option<String> {
        let origins = &self.options.allowed_origins;
        if origins.is_empty() || origins.iter().any(|o| o == "*") {
            return Some("*".to_string());
        }

        let origin = origin?;
        origins.iter().find(|o| o.as_str() == origin).cloned()
    }

    fn preflight_response(&self, allowed_origin: &str) -> Response {
        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header("access-control-allow-origin", allowed_origin)
            .header(
                "access-control-allow-methods",
                self.options.allowed_methods.join(", "),
            )
            .header(
                "access-control-allow-headers",
                self.options.allowed_headers.join(", "),
            );

        if self.options.allow_credentials {
            builder = builder.header("access-control-allow-credentials", "true");
        }

        builder = builder
            .header("access-control-max-age", self.options.max_age.to_string())
            .header("content-length", "0");

        builder
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::OK.into_response())
    }
}

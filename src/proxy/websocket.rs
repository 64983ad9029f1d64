use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::http::{header, request::Parts, HeaderMap, Uri};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message as UpstreamMessage};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ProxyOptions;
use crate::error::ProxyError;
use crate::logging::AccessLogger;
use crate::pool::{Backend, InFlightGuard, UpstreamPool};

/// Detect a WebSocket upgrade: `Connection` contains `upgrade`
/// (case-insensitive) and `Upgrade` equals `websocket`.
pub fn is_websocket_request(headers: &HeaderMap) -> bool {
    let connection = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    connection.contains("upgrade") && upgrade == "websocket"
}

/// Bidirectional frame shuttle between an upgraded client connection and a
/// freshly dialed backend connection. One upstream connection per client,
/// never pooled.
pub struct WebSocketRelay {
    pool: Arc<UpstreamPool>,
    handshake_timeout: Duration,
    frame_buffer_size: usize,
    logger: Arc<AccessLogger>,
}

impl WebSocketRelay {
    pub fn new(pool: Arc<UpstreamPool>, options: &ProxyOptions, logger: Arc<AccessLogger>) -> Self {
        Self {
            pool,
            handshake_timeout: options.websocket_timeout,
            frame_buffer_size: options.websocket_buffer_size,
            logger,
        }
    }

    pub fn pool(&self) -> &Arc<UpstreamPool> {
        &self.pool
    }

    /// Accept the client upgrade and start relaying. The backend is selected
    /// before upgrading so an exhausted pool answers 503 on the HTTP side.
    pub fn handle_upgrade(
        &self,
        ws: WebSocketUpgrade,
        parts: &Parts,
        client_addr: SocketAddr,
    ) -> Response {
        let Some(backend) = self.pool.select() else {
            info!(client = %client_addr, "no healthy WebSocket upstream available");
            return ProxyError::NoUpstream.into_response();
        };

        let guard = self.pool.acquire(backend.clone());
        let target = rewrite_ws_url(&backend, &parts.uri);
        let timeout = self.handshake_timeout;
        let logger = Arc::clone(&self.logger);
        let uri = parts.uri.to_string();

        ws.write_buffer_size(self.frame_buffer_size)
            .on_upgrade(move |client| async move {
                relay(client, target, timeout, guard, client_addr, uri, logger).await;
            })
    }
}

async fn relay(
    mut client: WebSocket,
    target: String,
    timeout: Duration,
    guard: InFlightGuard,
    client_addr: SocketAddr,
    uri: String,
    logger: Arc<AccessLogger>,
) {
    let request_id = Uuid::new_v4().to_string();
    let start = Instant::now();
    let backend_name = guard.backend().name.clone();

    let upstream = match tokio::time::timeout(timeout, connect_async(target.as_str())).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            error!(%request_id, %target, error = %e, "failed to connect to upstream WebSocket");
            close_with_policy_violation(&mut client).await;
            return;
        }
        Err(_) => {
            error!(%request_id, %target, "upstream WebSocket handshake timed out");
            close_with_policy_violation(&mut client).await;
            return;
        }
    };

    info!(%request_id, client = %client_addr, %target, "WebSocket connection established");

    let (mut upstream_sink, mut upstream_stream) = upstream.split();
    let (mut client_sink, mut client_stream) = client.split();

    let client_to_upstream = async {
        loop {
            let message = match tokio::time::timeout(timeout, client_stream.next()).await {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(e))) => {
                    debug!(%request_id, error = %e, "client read failed");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(%request_id, "client read deadline exceeded");
                    break;
                }
            };

            let message = client_to_upstream_message(message);
            match tokio::time::timeout(timeout, upstream_sink.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(%request_id, error = %e, "upstream write failed");
                    break;
                }
                Err(_) => {
                    warn!(%request_id, "upstream write deadline exceeded");
                    break;
                }
            }
        }
    };

    let upstream_to_client = async {
        loop {
            let message = match tokio::time::timeout(timeout, upstream_stream.next()).await {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(e))) => {
                    debug!(%request_id, error = %e, "upstream read failed");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(%request_id, "upstream read deadline exceeded");
                    break;
                }
            };

            let Some(message) = upstream_to_client_message(message) else {
                continue;
            };
            match tokio::time::timeout(timeout, client_sink.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(%request_id, error = %e, "client write failed");
                    break;
                }
                Err(_) => {
                    warn!(%request_id, "client write deadline exceeded");
                    break;
                }
            }
        }
    };

    // the first direction to error or reach EOF ends the relay; dropping the
    // halves closes both connections and the guard releases the counter
    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }

    let entry = logger.entry(
        "websocket",
        client_addr.ip(),
        "GET",
        &uri,
        101,
        start.elapsed(),
        Some(&backend_name),
        &request_id,
    );
    logger.write(&entry).await;

    debug!(%request_id, client = %client_addr, "WebSocket relay closed");
}

async fn close_with_policy_violation(client: &mut WebSocket) {
    let frame = CloseFrame {
        code: 1008,
        reason: "Upstream connection failed".into(),
    };
    let _ = client.send(ClientMessage::Close(Some(frame))).await;
}

/// Rewrite the backend URL to the ws/wss scheme, preserving the request's
/// path and query
fn rewrite_ws_url(backend: &Backend, uri: &Uri) -> String {
    let scheme = match backend.url.scheme() {
        "http" => "ws",
        "https" => "wss",
        scheme => scheme,
    };
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}://{}{}", scheme, backend.url.authority(), path_and_query)
}

fn client_to_upstream_message(message: ClientMessage) -> UpstreamMessage {
    match message {
        ClientMessage::Text(text) => UpstreamMessage::Text(text.to_string().into()),
        ClientMessage::Binary(data) => UpstreamMessage::Binary(data),
        ClientMessage::Ping(data) => UpstreamMessage::Ping(data),
        ClientMessage::Pong(data) => UpstreamMessage::Pong(data),
        ClientMessage::Close(frame) => UpstreamMessage::Close(frame.map(|f| {
            tungstenite::protocol::CloseFrame {
                code: f.code.into(),
                reason: f.reason.to_string().into(),
            }
        })),
    }
}

fn upstream_to_client_message(message: UpstreamMessage) -> Option<ClientMessage> {
    match message {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(text.to_string().into())),
        UpstreamMessage::Binary(data) => Some(ClientMessage::Binary(data)),
        UpstreamMessage::Ping(data) => Some(ClientMessage::Ping(data)),
        UpstreamMessage::Pong(data) => Some(ClientMessage::Pong(data)),
        UpstreamMessage::Close(frame) => Some(ClientMessage::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason.to_string().into(),
        }))),
        // raw frames are an internal tungstenite variant, not relayed
        UpstreamMessage::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use axum::http::HeaderValue;

    fn backend(url: &str) -> Backend {
        Backend::from_config(&UpstreamConfig {
            name: "ws-1".to_string(),
            url: url.to_string(),
            weight: 1,
            health_check: "/health".to_string(),
        })
        .unwrap()
    }

    fn upgrade_headers(connection: &str, upgrade: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_str(connection).unwrap());
        headers.insert(header::UPGRADE, HeaderValue::from_str(upgrade).unwrap());
        headers
    }

    #[test]
    fn test_upgrade_detection() {
        assert!(is_websocket_request(&upgrade_headers("Upgrade", "websocket")));
        assert!(is_websocket_request(&upgrade_headers("keep-alive, Upgrade", "WebSocket")));
        assert!(!is_websocket_request(&upgrade_headers("keep-alive", "websocket")));
        assert!(!is_websocket_request(&upgrade_headers("Upgrade", "h2c")));
        assert!(!is_websocket_request(&HeaderMap::new()));
    }

    #[test]
    fn test_ws_url_rewrite_schemes() {
        let uri: Uri = "/stream?room=7".parse().unwrap();
        assert_eq!(
            rewrite_ws_url(&backend("http://127.0.0.1:9100"), &uri),
            "ws://127.0.0.1:9100/stream?room=7"
        );
        assert_eq!(
            rewrite_ws_url(&backend("https://127.0.0.1:9100"), &uri),
            "wss://127.0.0.1:9100/stream?room=7"
        );
        assert_eq!(
            rewrite_ws_url(&backend("ws://127.0.0.1:9100"), &uri),
            "ws://127.0.0.1:9100/stream?room=7"
        );
        assert_eq!(
            rewrite_ws_url(&backend("wss://chat.internal:9100"), &uri),
            "wss://chat.internal:9100/stream?room=7"
        );
    }

    #[test]
    fn test_close_frame_conversion_preserves_code_and_reason() {
        let message = ClientMessage::Close(Some(CloseFrame {
            code: 1001,
            reason: "going away".into(),
        }));
        match client_to_upstream_message(message) {
            UpstreamMessage::Close(Some(frame)) => {
                let code: u16 = frame.code.into();
                assert_eq!(code, 1001);
                assert_eq!(frame.reason.as_str(), "going away");
            }
            other => panic!("unexpected conversion: {:?}", other),
        }
    }

    #[test]
    fn test_raw_frames_are_not_relayed() {
        // only the enumerated message kinds cross the relay
        let message = UpstreamMessage::Text("hello".into());
        assert!(upstream_to_client_message(message).is_some());
    }
}

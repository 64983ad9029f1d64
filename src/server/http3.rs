use axum::body::Body;
use axum::response::IntoResponse;
use bytes::{Buf, Bytes, BytesMut};
use h3::server::RequestStream;
use http_body_util::BodyExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{ProxyError, Result};
use crate::proxy::HttpForwarder;

/// HTTP/3 listener: a QUIC endpoint whose requests are adapted onto the
/// shared forwarder with the `HTTP/3` forwarded-proto label.
pub struct Http3Server {
    endpoint: quinn::Endpoint,
    forwarder: Arc<HttpForwarder>,
}

impl Http3Server {
    /// Bind the UDP endpoint. QUIC keep-alive runs at half the keep-alive
    /// timeout, which also bounds idle connections.
    pub fn bind(
        addr: SocketAddr,
        tls_config: &rustls::ServerConfig,
        keep_alive: Duration,
        forwarder: Arc<HttpForwarder>,
    ) -> Result<Self> {
        let mut tls_config = tls_config.clone();
        tls_config.alpn_protocols = vec![b"h3".to_vec()];

        let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| ProxyError::Config(format!("TLS config unsuitable for QUIC: {}", e)))?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));

        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(keep_alive / 2));
        transport.max_idle_timeout(Some(keep_alive.try_into().map_err(|_| {
            ProxyError::Config("keep_alive_timeout too large for QUIC idle timeout".to_string())
        })?));
        server_config.transport = Arc::new(transport);

        let endpoint = quinn::Endpoint::server(server_config, addr)
            .map_err(|e| ProxyError::Listener(format!("failed to bind QUIC endpoint {}: {}", addr, e)))?;

        Ok(Self { endpoint, forwarder })
    }

    pub async fn run(self, token: CancellationToken) {
        info!("HTTP/3 listener running");

        loop {
            let incoming = tokio::select! {
                _ = token.cancelled() => break,
                incoming = self.endpoint.accept() => match incoming {
                    Some(incoming) => incoming,
                    None => break,
                },
            };

            let remote_addr = incoming.remote_address();
            let forwarder = Arc::clone(&self.forwarder);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(incoming, remote_addr, forwarder).await {
                    debug!(peer = %remote_addr, error = %e, "HTTP/3 connection ended");
                }
            });
        }

        self.endpoint.close(0u32.into(), b"shutdown");
        self.endpoint.wait_idle().await;
        info!("HTTP/3 listener stopped");
    }
}

async fn handle_connection(
    incoming: quinn::Incoming,
    remote_addr: SocketAddr,
    forwarder: Arc<HttpForwarder>,
) -> anyhow::Result<()> {
    let connection = incoming.accept()?.await?;
    let mut h3_conn: h3::server::Connection<h3_quinn::Connection, Bytes> = h3::server::builder()
        .build(h3_quinn::Connection::new(connection))
        .await?;

    loop {
        match h3_conn.accept().await {
            Ok(Some(resolver)) => {
                let (request, stream) = match resolver.resolve_request().await {
                    Ok(resolved) => resolved,
                    Err(e) => {
                        debug!(peer = %remote_addr, error = %e, "failed to resolve HTTP/3 request");
                        continue;
                    }
                };

                let forwarder = Arc::clone(&forwarder);
                tokio::spawn(async move {
                    if let Err(e) = handle_request(request, stream, remote_addr, forwarder).await {
                        error!(peer = %remote_addr, error = %e, "HTTP/3 request failed");
                    }
                });
            }
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %remote_addr, error = %e, "HTTP/3 accept ended");
                break;
            }
        }
    }

    Ok(())
}

async fn handle_request<S>(
    request: http::Request<()>,
    mut stream: RequestStream<S, Bytes>,
    remote_addr: SocketAddr,
    forwarder: Arc<HttpForwarder>,
) -> anyhow::Result<()>
where
    S: h3::quic::BidiStream<Bytes>,
{
    let mut body = BytesMut::new();
    while let Some(mut chunk) = stream.recv_data().await? {
        while chunk.has_remaining() {
            let bytes = chunk.chunk();
            body.extend_from_slice(bytes);
            let advanced = bytes.len();
            chunk.advance(advanced);
        }
    }

    let (parts, ()) = request.into_parts();
    let request = http::Request::from_parts(parts, Body::from(body.freeze()));

    let response = match forwarder.forward(request, remote_addr, "HTTP/3").await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };

    let (parts, body) = response.into_parts();
    let body = body.collect().await?.to_bytes();

    stream.send_response(http::Response::from_parts(parts, ())).await?;
    if !body.is_empty() {
        stream.send_data(body).await?;
    }
    stream.finish().await?;

    Ok(())
}

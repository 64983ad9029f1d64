use axum::response::IntoResponse;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::convert::Infallible;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{ProxyError, Result};
use crate::proxy::HttpForwarder;

/// Load a rustls server config from PEM files. ALPN offers `h2, http/1.1`,
/// with `h3` prepended when HTTP/3 is enabled on the same certificate.
pub fn load_tls_config(
    cert_path: &str,
    key_path: &str,
    enable_http3: bool,
) -> Result<Arc<rustls::ServerConfig>> {
    let cert_file = std::fs::File::open(cert_path)
        .map_err(|e| ProxyError::Config(format!("failed to open TLS certificate {}: {}", cert_path, e)))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| ProxyError::Config(format!("failed to parse TLS certificate {}: {}", cert_path, e)))?;

    let key_file = std::fs::File::open(key_path)
        .map_err(|e| ProxyError::Config(format!("failed to open TLS key {}: {}", key_path, e)))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| ProxyError::Config(format!("failed to parse TLS key {}: {}", key_path, e)))?
        .ok_or_else(|| ProxyError::Config(format!("no private key found in {}", key_path)))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Config(format!("invalid TLS certificate/key pair: {}", e)))?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    if enable_http3 {
        config.alpn_protocols.insert(0, b"h3".to_vec());
    }

    Ok(Arc::new(config))
}

/// Accept TLS connections and serve them through the shared forwarder with
/// the `https` forwarded-proto label. HTTP/1.1 and HTTP/2 are negotiated via
/// ALPN by the auto connection builder.
pub async fn serve(
    listener: TcpListener,
    tls_config: Arc<rustls::ServerConfig>,
    forwarder: Arc<HttpForwarder>,
    token: CancellationToken,
) {
    let acceptor = TlsAcceptor::from(tls_config);

    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "failed to accept TLS connection");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let forwarder = Arc::clone(&forwarder);
        let connection_token = token.clone();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(e) => {
                    debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                let forwarder = Arc::clone(&forwarder);
                async move {
                    let req = req.map(axum::body::Body::new);
                    let response = match forwarder.forward(req, peer_addr, "https").await {
                        Ok(response) => response,
                        Err(e) => e.into_response(),
                    };
                    Ok::<_, Infallible>(response)
                }
            });

            let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
            let connection = builder.serve_connection(TokioIo::new(tls_stream), service);
            tokio::pin!(connection);

            tokio::select! {
                result = connection.as_mut() => {
                    if let Err(e) = result {
                        debug!(peer = %peer_addr, error = %e, "TLS connection ended with error");
                    }
                }
                _ = connection_token.cancelled() => {
                    connection.as_mut().graceful_shutdown();
                    let _ = connection.as_mut().await;
                }
            }
        });
    }
}

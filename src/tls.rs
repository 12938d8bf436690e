//! HTTPS termination.
//!
//! Loads PEM material once, then accepts TLS connections in an explicit
//! loop and serves each stream through hyper's HTTP/1.1 connection driver
//! against the shared Router. rustls speaks TLS 1.2+ only, so the legacy
//! SSL protocol versions are off by construction.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ConnectInfo;
use axum::Router;
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig as RustlsServerConfig;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::util::Oneshot;
use tracing::{debug, error, info};

/// Build a TLS acceptor from PEM certificate and key files.
pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("TLS certificate/key rejected")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("Failed to read certificate: {}", path.display()))?;
    let certs: std::io::Result<Vec<_>> = rustls_pemfile::certs(&mut pem.as_slice()).collect();
    let certs = certs.context("Malformed certificate PEM")?;
    anyhow::ensure!(!certs.is_empty(), "No certificates in {}", path.display());
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("Failed to read private key: {}", path.display()))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .context("Malformed private key PEM")?
        .with_context(|| format!("No private key in {}", path.display()))
}

/// Accept-and-serve loop with graceful shutdown.
pub async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    info!("HTTPS listener ready");
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => {
                info!("HTTPS listener stopping");
                return Ok(());
            }
        };

        match accepted {
            Ok((tcp_stream, peer_addr)) => {
                let acceptor = acceptor.clone();
                let app = app.clone();

                tokio::spawn(async move {
                    match acceptor.accept(tcp_stream).await {
                        Ok(tls_stream) => {
                            debug!(peer = %peer_addr, "TLS connection established");
                            let io = TokioIo::new(tls_stream);
                            let service = hyper::service::service_fn(move |req| {
                                let app = app.clone();
                                async move {
                                    let mut req = req.map(axum::body::Body::new);
                                    // The pipeline derives the client IP
                                    // from the socket peer.
                                    req.extensions_mut().insert(ConnectInfo(peer_addr));
                                    Oneshot::new(app, req).await.map_err(|e| {
                                        std::io::Error::new(std::io::ErrorKind::Other, e)
                                    })
                                }
                            });

                            if let Err(e) = hyper::server::conn::http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(peer = %peer_addr, error = %e, "HTTPS connection closed");
                            }
                        }
                        Err(e) => {
                            error!(peer = %peer_addr, error = %e, "TLS handshake failed");
                        }
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "HTTPS accept failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_material_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.pem");
        assert!(load_certs(&missing).is_err());
        assert!(load_key(&missing).is_err());
    }

    #[test]
    fn empty_pem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        std::fs::write(&cert, b"").unwrap();
        assert!(load_certs(&cert).is_err());
    }
}

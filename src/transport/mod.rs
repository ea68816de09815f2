//! HTTP/2 transport: TCP listener, TLS/mTLS acceptor, and the per-connection
//! request loop that hands each H2 stream to the protocol router.

mod handler;

pub use handler::H2Stream;

use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::config::{Config, TlsMode};
use crate::connection::ConnectionManager;
use crate::identity::{self, PinnedClientVerifier};
use crate::router::Router;

/// Bind the listener and serve connections until `shutdown` resolves.
pub async fn run(
    config: Arc<Config>,
    router: Arc<Router>,
    connections: Arc<ConnectionManager>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, mode = ?config.server.tls_mode, "listening");

    let tls_acceptor = build_tls_acceptor(&config)?;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let _ = socket.set_nodelay(true);

                let router = router.clone();
                let connections = connections.clone();
                let tls_acceptor = tls_acceptor.clone();

                tokio::spawn(async move {
                    let result = if let Some(acceptor) = tls_acceptor {
                        match acceptor.accept(socket).await {
                            Ok(tls) => serve_connection(tls, peer, router, connections).await,
                            Err(e) => {
                                warn!(peer = %peer, error = %e, "TLS handshake failed");
                                return;
                            }
                        }
                    } else {
                        serve_connection(socket, peer, router, connections).await
                    };
                    if let Err(e) = result {
                        warn!(peer = %peer, error = %e, "connection closed with error");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("shutdown signal received, no longer accepting connections");
                return Ok(());
            }
        }
    }
}

async fn serve_connection<T>(
    io: T,
    peer: std::net::SocketAddr,
    router: Arc<Router>,
    connections: Arc<ConnectionManager>,
) -> Result<()>
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut conn = h2::server::handshake(io)
        .await
        .context("h2 handshake failed")?;

    let conn_id = connections.register(peer);
    info!(peer = %peer, conn_id = %conn_id, "connection established");

    while let Some(result) = conn.accept().await {
        let (request, respond) = result.context("h2 accept failed")?;
        let router = router.clone();
        let connections = connections.clone();
        tokio::spawn(async move {
            if let Err(e) = handler::handle_request(request, respond, peer, router).await {
                error!(peer = %peer, error = %e, "request handling failed");
            }
        });
        connections.touch(conn_id);
    }

    connections.remove(conn_id);
    info!(peer = %peer, conn_id = %conn_id, "connection closed");
    Ok(())
}

fn build_tls_acceptor(config: &Config) -> Result<Option<TlsAcceptor>> {
    if config.server.tls_mode == TlsMode::Plaintext {
        return Ok(None);
    }

    let key_path = config
        .server
        .private_key
        .as_ref()
        .context("private_key is required for TLS modes")?;
    let signing_key = identity::load_or_generate_keypair(std::path::Path::new(key_path))?;
    let (cert_der, key_der): (CertificateDer<'static>, PrivatePkcs8KeyDer<'static>) =
        identity::self_signed_cert(&signing_key)?;

    let builder = rustls::ServerConfig::builder();

    let mut tls_config = match config.server.tls_mode {
        TlsMode::Mutual => {
            let authorized: Result<Vec<_>> = config
                .server
                .authorized_clients
                .iter()
                .map(|s| identity::decode_public_key(s))
                .collect();
            let verifier = PinnedClientVerifier::new(authorized?);
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(vec![cert_der], key_der.into())
                .context("failed to build mTLS server config")?
        }
        TlsMode::Server => builder
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der.into())
            .context("failed to build TLS server config")?,
        TlsMode::Plaintext => unreachable!(),
    };

    tls_config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(Some(TlsAcceptor::from(Arc::new(tls_config))))
}

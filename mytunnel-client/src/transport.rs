//! Pinning transport: an HTTP/2 client connection to the tunnel server,
//! with Ed25519 certificate pinning and failure-driven hard resets.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::{Buf, Bytes};
use h2::client::SendRequest;
use h2::{RecvStream, SendStream};
use http::{Method, Request};
use parking_lot::RwLock;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::identity;

pub const HEADER_PROTOCOL: &str = "x-nerve-protocol";
pub const HEADER_TARGET: &str = "x-nerve-target";

const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const RESET_BACKOFF: Duration = Duration::from_secs(2);
const FAILURE_THRESHOLD: u32 = 3;

/// One of the three transport modes `spec.md` §4.2 describes.
enum TlsMode {
    Unsecured,
    PinnedServer,
    PinnedMutual,
}

/// Adapts an H2 request/response stream pair to `AsyncRead` + `AsyncWrite`.
pub struct H2ClientStream {
    recv: RecvStream,
    send: SendStream<Bytes>,
    read_buf: Option<Bytes>,
}

impl AsyncRead for H2ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if let Some(data) = self.read_buf.take() {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.read_buf = Some(data.slice(n..));
                }
                return Poll::Ready(Ok(()));
            }
            match Pin::new(&mut self.recv).poll_data(cx) {
                Poll::Ready(Some(Ok(mut data))) => {
                    let len = data.len();
                    let _ = self.recv.flow_control().release_capacity(len);
                    if data.remaining() == 0 {
                        continue;
                    }
                    self.read_buf = Some(data.copy_to_bytes(len));
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for H2ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.send.reserve_capacity(buf.len());
        match self.send.poll_capacity(cx) {
            Poll::Ready(Some(Ok(cap))) => {
                let n = cap.min(buf.len());
                self.send
                    .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "h2 stream closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        let _ = self.send.send_data(Bytes::new(), true);
        Poll::Ready(Ok(()))
    }
}

/// The client's single HTTP/2 connection to the server, with the 3-strike
/// failure counter and serialized hard reset from `spec.md` §4.2.
pub struct PinningTransport {
    config: Arc<Config>,
    mode: TlsMode,
    scheme: &'static str,
    handle: RwLock<SendRequest<Bytes>>,
    failures: AtomicU32,
    reset_lock: AsyncMutex<()>,
}

impl PinningTransport {
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let mode = match (&config.private_key, &config.server_public_key) {
            (None, None) => TlsMode::Unsecured,
            (None, Some(_)) => TlsMode::PinnedServer,
            (Some(_), Some(_)) => TlsMode::PinnedMutual,
            (Some(_), None) => {
                anyhow::bail!("private_key set without server_public_key: mutual mode requires both")
            }
        };
        let scheme = match mode {
            TlsMode::Unsecured => "http",
            TlsMode::PinnedServer | TlsMode::PinnedMutual => "https",
        };
        let handle = connect_once(&config, &mode).await?;
        Ok(Self {
            config,
            mode,
            scheme,
            handle: RwLock::new(handle),
            failures: AtomicU32::new(0),
            reset_lock: AsyncMutex::new(()),
        })
    }

    /// Open one logical stream tagged `protocol`, optionally carrying a
    /// dial target, and wait up to 10s for response headers.
    pub async fn open_stream(
        &self,
        protocol: &str,
        target: Option<&str>,
    ) -> Result<H2ClientStream> {
        let mut send_request = self.handle.read().clone();

        let uri = format!("{}://{}/", self.scheme, self.config.remote_addr);
        let mut builder = Request::builder().method(Method::POST).uri(uri);
        builder = builder.header(HEADER_PROTOCOL, protocol);
        if let Some(target) = target {
            builder = builder.header(HEADER_TARGET, target);
        }
        let request = builder.body(()).context("failed to build request")?;

        let attempt = async {
            let (response_fut, send_stream) = send_request
                .send_request(request, false)
                .context("failed to issue tunnel request")?;
            let response = response_fut
                .await
                .context("tunnel request failed before headers")?;
            if response.status() != http::StatusCode::OK {
                anyhow::bail!("tunnel rejected stream: status {}", response.status());
            }
            let recv = response.into_body();
            Ok(H2ClientStream {
                recv,
                send: send_stream,
                read_buf: None,
            })
        };

        match tokio::time::timeout(STREAM_OPEN_TIMEOUT, attempt).await {
            Ok(Ok(stream)) => {
                self.failures.store(0, Ordering::SeqCst);
                Ok(stream)
            }
            Ok(Err(e)) => {
                self.record_failure().await;
                Err(e)
            }
            Err(_) => {
                self.record_failure().await;
                Err(anyhow::anyhow!("timed out waiting for tunnel response headers"))
            }
        }
    }

    async fn record_failure(&self) {
        let count = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= FAILURE_THRESHOLD {
            self.hard_reset().await;
        }
    }

    /// Destroy and reconstruct the HTTP/2 client, serialized so at most
    /// one reset runs at a time.
    async fn hard_reset(&self) {
        let _guard = self.reset_lock.lock().await;
        if self.failures.load(Ordering::SeqCst) < FAILURE_THRESHOLD {
            // Another task already reset while we waited for the lock.
            return;
        }
        warn!("transport failure threshold reached, resetting HTTP/2 connection");
        match connect_once(&self.config, &self.mode).await {
            Ok(new_handle) => {
                *self.handle.write() = new_handle;
                self.failures.store(0, Ordering::SeqCst);
                info!("transport reset complete");
            }
            Err(e) => {
                warn!(error = %e, "transport reset failed, keeping stale connection");
            }
        }
        tokio::time::sleep(RESET_BACKOFF).await;
    }
}

async fn connect_once(config: &Config, mode: &TlsMode) -> Result<SendRequest<Bytes>> {
    let addr = resolve_address(&config.remote_addr).await?;
    let tcp = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    tcp.set_nodelay(true).ok();

    let mut send_request = match mode {
        TlsMode::Unsecured => {
            let (send_request, connection) = h2::client::handshake(tcp)
                .await
                .context("h2c handshake failed")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!(error = %e, "h2 connection task ended");
                }
            });
            send_request
        }
        TlsMode::PinnedServer | TlsMode::PinnedMutual => {
            let tls_config = build_tls_config(config, mode)?;
            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name = server_name(config)?;
            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .context("TLS handshake failed")?;
            let (send_request, connection) = h2::client::handshake(tls_stream)
                .await
                .context("h2 handshake failed")?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!(error = %e, "h2 connection task ended");
                }
            });
            send_request
        }
    };

    send_request
        .ready()
        .await
        .context("h2 client never became ready")
}

fn build_tls_config(config: &Config, mode: &TlsMode) -> Result<rustls::ClientConfig> {
    let verifier: Arc<dyn rustls::client::danger::ServerCertVerifier> =
        if config.tls_mode.as_deref() == Some("system") {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::client::WebPkiServerVerifier::builder(Arc::new(roots))
                .build()
                .context("failed to build system trust verifier")?
        } else {
            let expected = config
                .server_public_key
                .as_deref()
                .map(identity::decode_public_key)
                .transpose()
                .context("invalid server_public_key")?;
            identity::PinnedServerVerifier::new(expected)
        };

    let builder = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let mut tls_config = match mode {
        TlsMode::PinnedMutual => {
            let key_path = config
                .private_key
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("pinned-mutual mode requires private_key"))?;
            let signing_key = identity::load_or_generate_keypair(std::path::Path::new(key_path))?;
            let (cert, key) = identity::self_signed_cert(&signing_key)?;
            builder
                .with_client_auth_cert(vec![cert], key.into())
                .context("failed to configure client certificate")?
        }
        _ => builder.with_no_client_auth(),
    };

    tls_config.alpn_protocols = vec![b"h2".to_vec()];
    Ok(tls_config)
}

fn server_name(config: &Config) -> Result<ServerName<'static>> {
    let host = config
        .remote_addr
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(&config.remote_addr);
    ServerName::try_from(host.to_string()).context("invalid server name for TLS SNI")
}

async fn resolve_address(address: &str) -> Result<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let mut addrs = tokio::net::lookup_host(address)
        .await
        .with_context(|| format!("failed to resolve {address}"))?;
    addrs
        .next()
        .ok_or_else(|| anyhow::anyhow!("no addresses found for {address}"))
}

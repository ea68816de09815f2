//! Per-request dispatch: header extraction, capability gate, and the
//! `RecvStream`/`SendStream` -> `AsyncRead`/`AsyncWrite` adapter that lets
//! the rest of the codebase treat an H2 stream like any other socket.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use h2::server::SendResponse;
use h2::{RecvStream, SendStream};
use http::{Request, Response, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

use crate::router::Router;

pub const HEADER_PROTOCOL: &str = "x-nerve-protocol";
pub const HEADER_TARGET: &str = "x-nerve-target";

/// Adapts an H2 request/response stream pair to `AsyncRead` + `AsyncWrite`
/// so downstream proxy code doesn't need to know it isn't a plain socket.
pub struct H2Stream {
    recv: RecvStream,
    send: SendStream<Bytes>,
    read_buf: Option<Bytes>,
}

impl H2Stream {
    pub fn new(recv: RecvStream, send: SendStream<Bytes>) -> Self {
        Self {
            recv,
            send,
            read_buf: None,
        }
    }
}

impl AsyncRead for H2Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
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

impl AsyncWrite for H2Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
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

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let _ = self.send.send_data(Bytes::new(), true);
        Poll::Ready(Ok(()))
    }
}

/// Handle one HTTP/2 request: validate method and headers, gate on the
/// server's enabled-protocol matrix, flush a 200 before the body starts,
/// and hand the resulting stream to the matching proxy implementation.
pub async fn handle_request(
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    peer: SocketAddr,
    router: Arc<Router>,
) -> anyhow::Result<()> {
    if request.method() != http::Method::POST {
        reject(&mut respond, StatusCode::METHOD_NOT_ALLOWED)?;
        return Ok(());
    }

    let protocol = match request.headers().get(HEADER_PROTOCOL) {
        Some(v) => v.to_str().unwrap_or("").to_string(),
        None => {
            reject(&mut respond, StatusCode::BAD_REQUEST)?;
            return Ok(());
        }
    };
    let target = request
        .headers()
        .get(HEADER_TARGET)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if !router.allow(&protocol) {
        debug!(peer = %peer, protocol = %protocol, "protocol disabled by server policy");
        reject(&mut respond, StatusCode::FORBIDDEN)?;
        return Ok(());
    }

    let response = Response::builder().status(StatusCode::OK).body(())?;
    let send_stream = respond.send_response(response, false)?;
    let recv_stream = request.into_body();
    let stream = H2Stream::new(recv_stream, send_stream);

    match crate::router::dispatch(&protocol, target, stream, peer).await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(peer = %peer, protocol = %protocol, error = %e, "stream handling failed");
            Ok(())
        }
    }
}

fn reject(respond: &mut SendResponse<Bytes>, status: StatusCode) -> anyhow::Result<()> {
    let response = Response::builder().status(status).body(())?;
    respond.send_response(response, true)?;
    Ok(())
}

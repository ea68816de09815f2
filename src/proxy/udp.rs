//! UDP-tunnel server: one ephemeral UDP socket per `socks5-udp` H2 stream,
//! relaying framed datagrams in both directions.
//!
//! The stream carries length-prefixed SOCKS5 UDP-request frames
//! (`RSV RSV FRAG ATYP ADDR PORT payload`) in both directions. Each
//! direction runs its own loop; a reply datagram must reach the stream in
//! a single `write_all` call so two replies racing on the same stream
//! can't interleave a length header with another reply's payload.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::metrics::METRICS;
use crate::util::socket::create_udp_socket;
use crate::wire::{self, SocksAddr};

const MAX_DATAGRAM_SIZE: usize = 65535;

pub async fn serve<S>(stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let bind_addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
    let std_socket = create_udp_socket(bind_addr).context("failed to create UDP socket")?;
    let socket = UdpSocket::from_std(std_socket).context("failed to adopt UDP socket")?;
    debug!(local_addr = ?socket.local_addr().ok(), "UDP association opened");

    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(stream);

    let socket_in = Arc::new(socket);
    let socket_out = socket_in.clone();

    let to_target = async move {
        loop {
            let frame = match wire::read_frame(&mut tunnel_read).await {
                Ok(f) => f,
                Err(_) => break,
            };
            let (addr, port, frag, payload) = match wire::parse_udp_header(&frame) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "dropping malformed UDP frame");
                    continue;
                }
            };
            if frag != 0 {
                // Fragmented datagrams aren't reassembled; drop and keep serving.
                continue;
            }
            let dest = match resolve(&addr, port).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "failed to resolve UDP destination");
                    continue;
                }
            };
            if socket_out.send_to(payload, dest).await.is_err() {
                break;
            }
            METRICS.bytes_rx(payload.len() as u64);
        }
    };

    let to_client = async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, from) = match socket_in.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => break,
            };
            let header =
                wire::build_udp_header(SocksAddr::from_socket_addr(from), from.port(), &buf[..n]);
            if wire::write_frame(&mut tunnel_write, &header).await.is_err() {
                break;
            }
            METRICS.bytes_tx(n as u64);
        }
    };

    tokio::join!(to_target, to_client);
    debug!("UDP association closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn relays_datagram_to_echo_target_and_back() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                let (n, from) = match echo.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => break,
                };
                if echo.send_to(&buf[..n], from).await.is_err() {
                    break;
                }
            }
        });

        let (client_side, server_side) = tokio::io::duplex(8192);
        let serve_task = tokio::spawn(async move { serve(server_side).await });

        let (mut read_half, mut write_half) = tokio::io::split(client_side);
        let request = wire::build_udp_header(
            SocksAddr::from_socket_addr(echo_addr),
            echo_addr.port(),
            b"ping",
        );
        wire::write_frame(&mut write_half, &request).await.unwrap();

        let reply = wire::read_frame(&mut read_half).await.unwrap();
        let (_, _, frag, payload) = wire::parse_udp_header(&reply).unwrap();
        assert_eq!(frag, 0);
        assert_eq!(payload, b"ping");

        drop(write_half);
        let _ = serve_task.await;
    }
}

async fn resolve(addr: &SocksAddr, port: u16) -> Result<SocketAddr> {
    match addr {
        SocksAddr::V4(ip) => Ok(SocketAddr::new((*ip).into(), port)),
        SocksAddr::V6(ip) => Ok(SocketAddr::new((*ip).into(), port)),
        SocksAddr::Domain(name) => {
            let mut addrs = tokio::net::lookup_host((name.as_str(), port))
                .await
                .with_context(|| format!("failed to resolve {name}"))?;
            addrs
                .next()
                .ok_or_else(|| anyhow::anyhow!("no addresses found for {name}"))
        }
    }
}

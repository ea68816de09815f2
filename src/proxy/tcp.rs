//! Blind TCP forwarding: dial the tagged target and splice bytes between it
//! and the tunneled H2 stream in both directions.

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::metrics::METRICS;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Dial `target` and forward bytes bidirectionally until either side
/// closes. `socks5`, `shadowsocks`, and `ssh` tunnels all land here - the
/// protocol-specific work happened client-side before the stream was
/// opened, so the server only ever sees opaque bytes and a destination.
#[instrument(skip(stream))]
pub async fn forward<S>(stream: S, target: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let tcp = TcpStream::connect(target)
        .await
        .with_context(|| format!("failed to connect to {target}"))?;
    debug!(target, "connected to target");

    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(stream);
    let (mut tcp_read, mut tcp_write) = tcp.into_split();

    let client_to_target = async {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            match tunnel_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tcp_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    total += n as u64;
                    METRICS.bytes_rx(n as u64);
                }
                Err(_) => break,
            }
        }
        let _ = tcp_write.shutdown().await;
        total
    };

    let target_to_client = async {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            match tcp_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tunnel_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    total += n as u64;
                    METRICS.bytes_tx(n as u64);
                }
                Err(_) => break,
            }
        }
        let _ = tunnel_write.shutdown().await;
        total
    };

    let (rx_bytes, tx_bytes) = tokio::join!(client_to_target, target_to_client);
    debug!(rx_bytes, tx_bytes, "forward completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn forwards_bytes_to_echo_target() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let (client_side, server_side) = tokio::io::duplex(4096);

        let forward_target = target_addr.to_string();
        let forward_task = tokio::spawn(async move {
            forward(server_side, &forward_target).await.unwrap();
        });

        let (mut read_half, mut write_half) = tokio::io::split(client_side);
        write_half.write_all(b"hello echo").await.unwrap();
        write_half.shutdown().await.unwrap();

        let mut response = Vec::new();
        read_half.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"hello echo");

        forward_task.await.unwrap();
    }
}

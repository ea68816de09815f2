//! SSH / generic inbound: blind byte forwarding to a fixed target. SSH
//! itself is opaque here - the server dials `target` over plain TCP and
//! splices, same as any `X-Nerve-Target` request.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::InboundConfig;
use crate::transport::PinningTransport;

const DEFAULT_SSH_TARGET: &str = "127.0.0.1:22";

pub async fn run(
    inbound: InboundConfig,
    transport: Arc<PinningTransport>,
    ready: Option<watch::Sender<bool>>,
) -> Result<()> {
    let listener = TcpListener::bind(&inbound.local_addr)
        .await
        .with_context(|| format!("failed to bind SSH inbound to {}", inbound.local_addr))?;
    info!(bind = %inbound.local_addr, "SSH inbound listening");
    if let Some(tx) = ready {
        let _ = tx.send(true);
    }

    let target = inbound
        .target_addr
        .clone()
        .unwrap_or_else(|| DEFAULT_SSH_TARGET.to_string());

    loop {
        let (stream, client_addr) = listener.accept().await?;
        let transport = transport.clone();
        let target = target.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, client_addr, transport, &target).await {
                debug!(client = %client_addr, error = %e, "SSH inbound client error");
            }
        });
    }
}

async fn handle_client(
    stream: TcpStream,
    client_addr: SocketAddr,
    transport: Arc<PinningTransport>,
    target: &str,
) -> Result<()> {
    let tunnel_stream = match transport.open_stream("ssh", Some(target)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(target = %target, error = %e, "failed to open SSH tunnel stream");
            return Err(e);
        }
    };
    debug!(client = %client_addr, target = %target, "SSH tunnel established");

    let (mut local_read, mut local_write) = stream.into_split();
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel_stream);

    let up = async {
        let _ = tokio::io::copy(&mut local_read, &mut tunnel_write).await;
        let _ = tunnel_write.shutdown().await;
    };
    let down = async {
        let _ = tokio::io::copy(&mut tunnel_read, &mut local_write).await;
        let _ = local_write.shutdown().await;
    };
    tokio::join!(up, down);
    Ok(())
}

//! Protocol routing: gates a tunneled stream against the server's enabled
//! protocols, then dispatches to the matching proxy implementation.

mod capability;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::info;

use crate::config::Config;
use crate::transport::H2Stream;

pub struct Router {
    config: Arc<Config>,
}

impl Router {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self { config })
    }

    pub fn allow(&self, protocol: &str) -> bool {
        capability::is_enabled(&self.config.security, protocol)
    }
}

/// Dispatch a gated stream to its protocol handler. `socks5`/`shadowsocks`/
/// `ssh` are all blind TCP forwards to `target` - the client has already
/// terminated whatever local protocol it speaks and tags the tunnel with
/// where the bytes should end up. `socks5-udp` instead serves a UDP
/// association with no fixed target.
pub async fn dispatch(
    protocol: &str,
    target: Option<String>,
    stream: H2Stream,
    peer: SocketAddr,
) -> Result<()> {
    match protocol {
        "ssh" => {
            // A missing or empty target defaults to the local sshd.
            let target = match target {
                Some(t) if !t.is_empty() => t,
                _ => "127.0.0.1:22".to_string(),
            };
            info!(peer = %peer, protocol, target = %target, "forwarding stream");
            crate::proxy::tcp::forward(stream, &target).await
        }
        "socks5" | "shadowsocks" => {
            let target = target.ok_or_else(|| anyhow!("missing target for {protocol} stream"))?;
            info!(peer = %peer, protocol, target = %target, "forwarding stream");
            crate::proxy::tcp::forward(stream, &target).await
        }
        "socks5-udp" => {
            info!(peer = %peer, "serving UDP association");
            crate::proxy::udp::serve(stream).await
        }
        other => Err(anyhow!("unknown protocol tag {other}")),
    }
}

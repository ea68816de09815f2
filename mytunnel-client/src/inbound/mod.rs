//! Inbound supervisor: one listener task per configured inbound, spawned
//! and supervised independently so a bind failure on one doesn't bring
//! down the others.

pub mod shadowsocks;
pub mod socks5;
pub mod ssh;

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use crate::config::{InboundConfig, ProtocolTag};
use crate::transport::PinningTransport;

/// Run every configured inbound listener to completion (i.e. forever,
/// barring a bind error). `ready` is set once the first SOCKS5 listener
/// has successfully bound - the hook an external orchestrator (e.g. an
/// Android VPN supervisor) polls before handing off a TUN file
/// descriptor, which it then drives as a SOCKS5 client (see `spec.md`
/// §4.5/§11). Shadowsocks and SSH inbounds never signal readiness; if no
/// SOCKS5 inbound is configured, the signal never fires.
pub async fn run(
    inbounds: Vec<InboundConfig>,
    transport: Arc<PinningTransport>,
    ready: watch::Sender<bool>,
) {
    let mut handles = Vec::new();
    let mut socks5_signaled = false;

    for inbound in inbounds {
        let transport = transport.clone();
        let bind_addr = inbound.local_addr.clone();
        let protocol = inbound.protocol;
        let signal = if protocol == ProtocolTag::Socks5 && !socks5_signaled {
            socks5_signaled = true;
            Some(ready.clone())
        } else {
            None
        };

        handles.push(tokio::spawn(async move {
            let result = match protocol {
                ProtocolTag::Socks5 => socks5::run(inbound, transport, signal).await,
                ProtocolTag::Shadowsocks => shadowsocks::run(inbound, transport, signal).await,
                ProtocolTag::Ssh => ssh::run(inbound, transport, signal).await,
            };
            if let Err(e) = result {
                error!(bind = %bind_addr, error = %e, "inbound listener exited");
            }
        }));
    }

    info!(count = handles.len(), "inbound listeners started");
    for handle in handles {
        let _ = handle.await;
    }
}

//! SOCKS5 inbound: RFC 1928 subset (NO-AUTH, CONNECT, UDP-ASSOCIATE).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::InboundConfig;
use crate::transport::PinningTransport;
use crate::wire::{self, SocksAddr};

const VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CONN_REFUSED: u8 = 0x05;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;

const UDP_BUFFER_SIZE: usize = 4 * 1024 * 1024;
const MAX_DATAGRAM_SIZE: usize = 65535;

pub async fn run(
    inbound: InboundConfig,
    transport: Arc<PinningTransport>,
    ready: Option<watch::Sender<bool>>,
) -> Result<()> {
    let listener = TcpListener::bind(&inbound.local_addr)
        .await
        .with_context(|| format!("failed to bind SOCKS5 inbound to {}", inbound.local_addr))?;
    info!(bind = %inbound.local_addr, "SOCKS5 inbound listening");
    if let Some(tx) = ready {
        let _ = tx.send(true);
    }

    let enable_udp = inbound.enable_udp.unwrap_or(false);

    loop {
        let (stream, client_addr) = listener.accept().await?;
        let transport = transport.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, client_addr, transport, enable_udp).await {
                debug!(client = %client_addr, error = %e, "SOCKS5 client error");
            }
        });
    }
}

async fn handle_client(
    mut stream: TcpStream,
    client_addr: SocketAddr,
    transport: Arc<PinningTransport>,
    enable_udp: bool,
) -> Result<()> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION {
        anyhow::bail!("unsupported SOCKS version {}", header[0]);
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    let method = if methods.contains(&AUTH_NONE) {
        AUTH_NONE
    } else {
        AUTH_NO_ACCEPTABLE
    };
    stream.write_all(&[VERSION, method]).await?;
    if method == AUTH_NO_ACCEPTABLE {
        anyhow::bail!("no acceptable SOCKS5 auth method");
    }

    let mut request_header = [0u8; 3];
    stream.read_exact(&mut request_header).await?;
    if request_header[0] != VERSION {
        anyhow::bail!("invalid SOCKS5 request version");
    }
    let cmd = request_header[1];
    let (addr, port) = SocksAddr::read_from(&mut stream).await?;

    match cmd {
        CMD_CONNECT => handle_connect(stream, transport, &addr, port).await,
        CMD_UDP_ASSOCIATE if enable_udp => {
            handle_udp_associate(stream, transport, client_addr).await
        }
        CMD_UDP_ASSOCIATE => {
            let reply = reply_frame(REP_CMD_NOT_SUPPORTED, zero_bind());
            stream.write_all(&reply).await?;
            Ok(())
        }
        other => {
            let reply = reply_frame(REP_CMD_NOT_SUPPORTED, zero_bind());
            stream.write_all(&reply).await?;
            anyhow::bail!("unsupported SOCKS5 command {other}")
        }
    }
}

async fn handle_connect(
    mut stream: TcpStream,
    transport: Arc<PinningTransport>,
    addr: &SocksAddr,
    port: u16,
) -> Result<()> {
    let target = format!("{}:{}", addr.to_host_string(), port);
    let tunnel_stream = match transport.open_stream("socks5", Some(&target)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(target = %target, error = %e, "failed to open tunnel stream");
            let reply = reply_frame(REP_CONN_REFUSED, zero_bind());
            stream.write_all(&reply).await?;
            return Err(e);
        }
    };

    let reply = reply_frame(REP_SUCCESS, zero_bind());
    stream.write_all(&reply).await?;
    debug!(target = %target, "SOCKS5 CONNECT established");

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

/// Bind a fresh UDP socket, latch the calling application's source address
/// from the first datagram, and relay to/from one `socks5-udp` tunnel
/// stream until the control TCP connection closes.
async fn handle_udp_associate(
    mut control: TcpStream,
    transport: Arc<PinningTransport>,
    _client_addr: SocketAddr,
) -> Result<()> {
    let std_socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    std_socket.set_send_buffer_size(UDP_BUFFER_SIZE)?;
    std_socket.set_recv_buffer_size(UDP_BUFFER_SIZE)?;
    std_socket.set_nonblocking(true)?;
    let bind_addr: SocketAddr = "0.0.0.0:0".parse().unwrap();
    std_socket.bind(&bind_addr.into())?;
    let socket = UdpSocket::from_std(std_socket.into())?;
    let local_addr = socket.local_addr()?;

    let tunnel_stream = match transport.open_stream("socks5-udp", None).await {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to open UDP tunnel stream");
            let reply = reply_frame(REP_GENERAL_FAILURE, zero_bind());
            control.write_all(&reply).await?;
            return Err(e);
        }
    };

    let reply = reply_frame(REP_SUCCESS, local_addr);
    control.write_all(&reply).await?;
    info!(udp_addr = %local_addr, "SOCKS5 UDP ASSOCIATE established");

    let socket = Arc::new(socket);
    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel_stream);
    // Relatch whenever a new source appears, per spec.md §9 (NAT rebinding
    // can legitimately occur mid-session).
    let latched = Arc::new(Mutex::new(None::<SocketAddr>));
    let have_latch = Arc::new(AtomicBool::new(false));

    let socket_in = socket.clone();
    let latched_write = latched.clone();
    let have_latch_write = have_latch.clone();
    let datagram_in = async move {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, from) = match socket_in.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => break,
            };
            *latched_write.lock() = Some(from);
            have_latch_write.store(true, Ordering::SeqCst);

            let (addr, port, frag, payload) = match wire::parse_udp_header(&buf[..n]) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if frag != 0 {
                continue;
            }
            let framed = wire::build_udp_header(addr, port, payload);
            if wire::write_frame(&mut tunnel_write, &framed).await.is_err() {
                break;
            }
        }
    };

    let socket_out = socket.clone();
    let latched_read = latched.clone();
    let have_latch_read = have_latch.clone();
    let stream_in = async move {
        loop {
            let frame = match wire::read_frame(&mut tunnel_read).await {
                Ok(f) => f,
                Err(_) => break,
            };
            if !have_latch_read.load(Ordering::SeqCst) {
                continue;
            }
            let dest = *latched_read.lock();
            if let Some(dest) = dest {
                if socket_out.send_to(&frame, dest).await.is_err() {
                    break;
                }
            }
        }
    };

    let control_watch = async {
        let mut buf = [0u8; 1];
        let _ = control.read(&mut buf).await;
    };

    tokio::select! {
        _ = datagram_in => {}
        _ = stream_in => {}
        _ = control_watch => { debug!("UDP-ASSOCIATE control connection closed"); }
    }
    Ok(())
}

fn reply_frame(status: u8, bind_addr: SocketAddr) -> Vec<u8> {
    let mut buf = vec![VERSION, status, 0x00];
    SocksAddr::from_socket_addr(bind_addr).encode(bind_addr.port(), &mut buf);
    buf
}

fn zero_bind() -> SocketAddr {
    "0.0.0.0:0".parse().unwrap()
}

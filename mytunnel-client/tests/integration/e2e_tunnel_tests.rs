//! End-to-end test driving a real client SOCKS5 inbound against a real
//! phoenix-server instance over a loopback HTTP/2 (h2c) connection.
//!
//! This exercises the actual wire path - `inbound::socks5::handle_client`'s
//! RFC 1928 handshake, `PinningTransport::open_stream`, the server's h2
//! accept loop, and `router::dispatch` - rather than calling
//! `proxy::tcp::forward` directly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use phoenix_client::config::{Config as ClientConfig, InboundConfig, ProtocolTag};
use phoenix_client::inbound;
use phoenix_client::transport::PinningTransport;
use phoenix_client::wire::SocksAddr;
use phoenix_server::config::{
    Config as PhoenixServerConfig, LoggingConfig, MetricsConfig, SecurityConfig, ServerConfig,
    TlsMode,
};
use phoenix_server::connection::ConnectionManager;
use phoenix_server::router::Router;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Bind an ephemeral port, hand back its address, then drop the listener
/// so the real owner can rebind it. Small TOCTOU window, acceptable for a
/// local loopback test.
async fn reserve_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut sock, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
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
        }
    });
    addr
}

#[tokio::test]
async fn socks5_connect_round_trips_through_real_tunnel() {
    let echo_addr = spawn_echo_server().await;
    let server_addr = reserve_port().await;

    let server_config = Arc::new(PhoenixServerConfig {
        server: ServerConfig {
            listen_addr: server_addr,
            tls_mode: TlsMode::Plaintext,
            private_key: None,
            authorized_clients: vec![],
        },
        security: SecurityConfig {
            enable_socks5: true,
            enable_udp: false,
            enable_shadowsocks: false,
            enable_ssh: false,
        },
        metrics: MetricsConfig {
            enabled: false,
            bind_addr: "127.0.0.1:0".parse().unwrap(),
        },
        logging: LoggingConfig {
            level: "error".into(),
            format: "pretty".into(),
        },
    });

    let connections = ConnectionManager::new();
    let router = Router::new(server_config.clone());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(phoenix_server::transport::run(
        server_config,
        router,
        connections,
        shutdown_rx,
    ));

    let client_config = Arc::new(ClientConfig {
        remote_addr: server_addr.to_string(),
        private_key: None,
        server_public_key: None,
        tls_mode: None,
        inbounds: vec![],
        logging: Default::default(),
    });
    let transport = Arc::new(connect_with_retry(client_config).await);

    let socks_addr = reserve_port().await;
    let inbound_config = InboundConfig {
        protocol: ProtocolTag::Socks5,
        local_addr: socks_addr.to_string(),
        enable_udp: Some(false),
        target_addr: None,
        auth: None,
    };
    let (ready_tx, mut ready_rx) = watch::channel(false);
    tokio::spawn(inbound::socks5::run(inbound_config, transport, Some(ready_tx)));
    ready_rx.changed().await.unwrap();

    let mut client = tokio::net::TcpStream::connect(socks_addr).await.unwrap();

    // Greeting: version 5, one method, NO-AUTH.
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut greeting_reply = [0u8; 2];
    client.read_exact(&mut greeting_reply).await.unwrap();
    assert_eq!(greeting_reply, [0x05, 0x00]);

    // CONNECT request to the echo server.
    let mut request = vec![0x05, 0x01, 0x00];
    SocksAddr::from_socket_addr(echo_addr).encode(echo_addr.port(), &mut request);
    client.write_all(&request).await.unwrap();

    let mut connect_reply = [0u8; 10];
    client.read_exact(&mut connect_reply).await.unwrap();
    assert_eq!(connect_reply[1], 0x00, "expected SOCKS5 success reply");

    client.write_all(b"hello through the tunnel").await.unwrap();
    client.shutdown().await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"hello through the tunnel");
}

#[tokio::test]
async fn socks5_udp_associate_rejected_when_disabled() {
    let server_addr = reserve_port().await;

    let server_config = Arc::new(PhoenixServerConfig {
        server: ServerConfig {
            listen_addr: server_addr,
            tls_mode: TlsMode::Plaintext,
            private_key: None,
            authorized_clients: vec![],
        },
        security: SecurityConfig {
            enable_socks5: true,
            enable_udp: false,
            enable_shadowsocks: false,
            enable_ssh: false,
        },
        metrics: MetricsConfig {
            enabled: false,
            bind_addr: "127.0.0.1:0".parse().unwrap(),
        },
        logging: LoggingConfig {
            level: "error".into(),
            format: "pretty".into(),
        },
    });

    let connections = ConnectionManager::new();
    let router = Router::new(server_config.clone());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(phoenix_server::transport::run(
        server_config,
        router,
        connections,
        shutdown_rx,
    ));

    let client_config = Arc::new(ClientConfig {
        remote_addr: server_addr.to_string(),
        private_key: None,
        server_public_key: None,
        tls_mode: None,
        inbounds: vec![],
        logging: Default::default(),
    });
    let transport = Arc::new(connect_with_retry(client_config).await);

    // The inbound itself allows UDP-Associate (the client's local gate);
    // this test is about the *server's* capability gate rejecting the
    // resulting tunnel stream, which surfaces to the SOCKS5 caller as a
    // dial failure on the CONNECT-equivalent open_stream call.
    let result = transport.open_stream("socks5-udp", None).await;
    assert!(result.is_err(), "server should refuse socks5-udp when enable_udp is false");
}

/// The server task is spawned concurrently with the client connect attempt;
/// retry briefly until the listener is actually accepting.
async fn connect_with_retry(config: Arc<ClientConfig>) -> PinningTransport {
    let mut last_err = None;
    for _ in 0..50 {
        match PinningTransport::new(config.clone()).await {
            Ok(t) => return t,
            Err(e) => {
                last_err = Some(e);
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
    panic!("failed to connect to phoenix-server: {:?}", last_err);
}

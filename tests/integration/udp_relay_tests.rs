//! UDP tunnel-server integration tests.

use phoenix_server::proxy::udp::serve;
use phoenix_server::wire::{self, SocksAddr};
use tokio::net::UdpSocket;

#[tokio::test]
async fn udp_association_relays_datagram_round_trip() {
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
    let task = tokio::spawn(async move { serve(server_side).await });

    let (mut read_half, mut write_half) = tokio::io::split(client_side);
    let request =
        wire::build_udp_header(SocksAddr::from_socket_addr(echo_addr), echo_addr.port(), b"dns-ish query");
    wire::write_frame(&mut write_half, &request).await.unwrap();

    let reply = wire::read_frame(&mut read_half).await.unwrap();
    let (addr, port, frag, payload) = wire::parse_udp_header(&reply).unwrap();
    assert_eq!(frag, 0);
    assert_eq!(port, echo_addr.port());
    assert_eq!(payload, b"dns-ish query");
    match addr {
        SocksAddr::V4(ip) => assert_eq!(ip, std::net::Ipv4Addr::LOCALHOST),
        other => panic!("unexpected reply address: {other:?}"),
    }

    drop(write_half);
    let _ = task.await;
}

#[tokio::test]
async fn fragmented_datagram_is_dropped_not_fatal() {
    let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        if let Ok((n, from)) = echo.recv_from(&mut buf).await {
            let _ = echo.send_to(&buf[..n], from).await;
        }
    });

    let (client_side, server_side) = tokio::io::duplex(8192);
    let task = tokio::spawn(async move { serve(server_side).await });

    let (mut read_half, mut write_half) = tokio::io::split(client_side);

    // Hand-build a FRAG != 0 frame: it should be dropped silently.
    let mut fragmented = vec![0x00, 0x00, 0x01];
    SocksAddr::from_socket_addr(echo_addr).encode(echo_addr.port(), &mut fragmented);
    fragmented.extend_from_slice(b"lost fragment");
    wire::write_frame(&mut write_half, &fragmented).await.unwrap();

    // Then a well-formed datagram should still go through on the same stream.
    let request = wire::build_udp_header(SocksAddr::from_socket_addr(echo_addr), echo_addr.port(), b"ok");
    wire::write_frame(&mut write_half, &request).await.unwrap();

    let reply = wire::read_frame(&mut read_half).await.unwrap();
    let (_, _, _, payload) = wire::parse_udp_header(&reply).unwrap();
    assert_eq!(payload, b"ok");

    drop(write_half);
    let _ = task.await;
}

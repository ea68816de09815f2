//! TCP forwarding integration tests.

use phoenix_server::proxy::tcp::forward;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::test]
async fn forward_relays_bytes_both_ways() {
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

    let (client_side, server_side) = tokio::io::duplex(8192);
    let target = target_addr.to_string();
    let task = tokio::spawn(async move { forward(server_side, &target).await });

    let (mut read_half, mut write_half) = tokio::io::split(client_side);
    write_half.write_all(b"round trip payload").await.unwrap();
    write_half.shutdown().await.unwrap();

    let mut response = Vec::new();
    read_half.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"round trip payload");

    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn forward_fails_fast_on_unroutable_target() {
    let (client_side, server_side) = tokio::io::duplex(1024);
    drop(client_side);
    let result = forward(server_side, "127.0.0.1:1").await;
    assert!(result.is_err());
}

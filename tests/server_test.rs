mod common;

use common::{ack, compressed, data_frame, json_frame, v2_batch, window};
use rask_shipper::domain::Value;
use rask_shipper::server::{ProtocolVersion, Server, ServerConfig};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

async fn bind(config: ServerConfig) -> Server {
    Server::bind("127.0.0.1:0", config, CancellationToken::new())
        .await
        .unwrap()
}

fn config() -> ServerConfig {
    ServerConfig {
        timeout: Duration::from_secs(2),
        keepalive: None,
        sniff_timeout: Duration::from_secs(2),
        ..ServerConfig::default()
    }
}

async fn read_ack(client: &mut TcpStream) -> [u8; 6] {
    let mut buf = [0u8; 6];
    tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

/// Reads until the peer closes; `true` if it did within two seconds.
async fn closed_by_peer(client: &mut TcpStream) -> bool {
    let mut sink = Vec::new();
    matches!(
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut sink)).await,
        Ok(_)
    )
}

#[tokio::test]
async fn v2_window_is_delivered_and_acked_with_its_count() {
    let server = bind(config()).await;
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client.write_all(&v2_batch(3)).await.unwrap();

    let batch = server.receive().await.unwrap();
    assert_eq!(batch.version(), ProtocolVersion::V2);
    assert_eq!(batch.len(), 3);
    assert_eq!(batch.events()[2].get("n"), Some(&Value::Integer(3)));
    assert_eq!(batch.peer().map(|p| p.ip()), client.local_addr().ok().map(|a| a.ip()));

    assert!(batch.ack());
    assert_eq!(read_ack(&mut client).await, ack(ProtocolVersion::V2, 3));
}

#[tokio::test]
async fn v1_and_v2_share_one_socket() {
    let server = bind(config()).await;

    let mut v1 = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut frames = window(ProtocolVersion::V1, 1);
    frames.extend_from_slice(&data_frame(1, &[("message", "hello"), ("type", "syslog")]));
    v1.write_all(&frames).await.unwrap();

    let batch = server.receive().await.unwrap();
    assert_eq!(batch.version(), ProtocolVersion::V1);
    assert_eq!(batch.events()[0].get("message"), Some(&Value::from("hello")));
    batch.ack();
    assert_eq!(read_ack(&mut v1).await, ack(ProtocolVersion::V1, 1));

    let mut v2 = TcpStream::connect(server.local_addr()).await.unwrap();
    v2.write_all(&v2_batch(2)).await.unwrap();
    let batch = server.receive().await.unwrap();
    assert_eq!(batch.version(), ProtocolVersion::V2);
    batch.ack();
    assert_eq!(read_ack(&mut v2).await, ack(ProtocolVersion::V2, 2));
}

#[tokio::test]
async fn compressed_window_is_expanded() {
    let server = bind(config()).await;
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

    let mut inner = json_frame(1, r#"{"type":"app","n":1}"#);
    inner.extend_from_slice(&json_frame(2, r#"{"type":"app","n":2}"#));
    let mut frames = window(ProtocolVersion::V2, 2);
    frames.extend_from_slice(&compressed(ProtocolVersion::V2, &inner));
    client.write_all(&frames).await.unwrap();

    let batch = server.receive().await.unwrap();
    assert_eq!(batch.len(), 2);
    batch.ack();
    assert_eq!(read_ack(&mut client).await, ack(ProtocolVersion::V2, 2));
}

#[tokio::test]
async fn unknown_version_byte_is_rejected() {
    let server = bind(config()).await;
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client.write_all(b"9W\0\0\0\x01").await.unwrap();

    assert!(closed_by_peer(&mut client).await);
    assert_eq!(server.stats().snapshot().connections_rejected, 1);
}

#[tokio::test]
async fn disabled_version_is_rejected() {
    let server = bind(ServerConfig {
        versions: vec![ProtocolVersion::V2],
        ..config()
    })
    .await;
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client.write_all(&window(ProtocolVersion::V1, 1)).await.unwrap();

    assert!(closed_by_peer(&mut client).await);
}

#[tokio::test]
async fn dropped_batch_closes_the_connection() {
    let server = bind(config()).await;
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client.write_all(&v2_batch(2)).await.unwrap();

    let batch = server.receive().await.unwrap();
    drop(batch);

    let mut received = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut received)).await;
    assert!(received.is_empty(), "no ack expected, got {received:?}");
    assert_eq!(server.stats().snapshot().batches_abandoned, 1);
}

#[tokio::test]
async fn keepalive_precedes_the_full_ack() {
    let server = bind(ServerConfig {
        keepalive: Some(Duration::from_millis(30)),
        ..config()
    })
    .await;
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client.write_all(&v2_batch(4)).await.unwrap();

    let batch = server.receive().await.unwrap();
    assert_eq!(read_ack(&mut client).await, ack(ProtocolVersion::V2, 0));
    batch.ack();

    loop {
        let frame = read_ack(&mut client).await;
        if frame != ack(ProtocolVersion::V2, 0) {
            assert_eq!(frame, ack(ProtocolVersion::V2, 4));
            break;
        }
    }
}

#[tokio::test]
async fn close_ends_receive_and_connections() {
    let server = bind(config()).await;
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client.write_all(&window(ProtocolVersion::V2, 1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    server.close();
    assert!(server.is_closed());
    assert!(server.receive().await.is_none());
    assert!(closed_by_peer(&mut client).await);
}

#[tokio::test]
async fn batches_from_many_connections_all_arrive() {
    let server = bind(config()).await;
    let mut clients = Vec::new();
    for _ in 0..5 {
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(&v2_batch(2)).await.unwrap();
        clients.push(client);
    }

    for _ in 0..5 {
        let batch = tokio::time::timeout(Duration::from_secs(2), server.receive())
            .await
            .unwrap()
            .unwrap();
        batch.ack();
    }
    for client in &mut clients {
        assert_eq!(read_ack(client).await, ack(ProtocolVersion::V2, 2));
    }
    assert_eq!(server.stats().snapshot().batches_acked, 5);
}

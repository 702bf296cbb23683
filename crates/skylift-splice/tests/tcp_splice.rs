//! Splice over real TCP sockets

use skylift_splice::splice;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Echo server that reads to EOF, then writes everything back and closes.
async fn spawn_read_then_echo() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut data = Vec::new();
        // Returns only once the peer half-closes; this is the behavior the
        // splice's CloseWrite propagation makes possible.
        stream.read_to_end(&mut data).await.unwrap();
        stream.write_all(&data).await.unwrap();
        stream.shutdown().await.unwrap();
    });
    addr
}

#[tokio::test]
async fn test_tcp_splice_round_trip_with_half_close() {
    let upstream_addr = spawn_read_then_echo().await;

    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().unwrap();
    tokio::spawn(async move {
        let (downstream, _) = relay.accept().await.unwrap();
        let upstream = TcpStream::connect(upstream_addr).await.unwrap();
        splice(downstream, upstream).await;
    });

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    client.write_all(b"PING\n").await.unwrap();
    // Half-close: the upstream's read_to_end must observe EOF through the
    // splice, otherwise it never answers.
    client.shutdown().await.unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"PING\n");
}

#[tokio::test]
async fn test_tcp_splice_large_transfer_in_order() {
    let upstream_addr = spawn_read_then_echo().await;

    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().unwrap();
    tokio::spawn(async move {
        let (downstream, _) = relay.accept().await.unwrap();
        let upstream = TcpStream::connect(upstream_addr).await.unwrap();
        let (sent, returned) = splice(downstream, upstream).await;
        assert_eq!(sent, returned);
    });

    let payload: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        let (mut read_half, mut write_half) = client.into_split();
        write_half.write_all(&payload).await.unwrap();
        write_half.shutdown().await.unwrap();
        let mut response = Vec::new();
        read_half.read_to_end(&mut response).await.unwrap();
        response
    });

    let response = writer.await.unwrap();
    assert_eq!(response, expected);
}

#[tokio::test]
async fn test_upstream_dial_refused_leaves_client_closed() {
    // Bind-then-drop to obtain a port nothing listens on.
    let closed_port = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };

    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().unwrap();
    tokio::spawn(async move {
        let (downstream, _) = relay.accept().await.unwrap();
        match TcpStream::connect(("127.0.0.1", closed_port)).await {
            Ok(upstream) => {
                splice(downstream, upstream).await;
            }
            Err(_) => drop(downstream),
        }
    });

    let mut client = TcpStream::connect(relay_addr).await.unwrap();
    let mut buf = Vec::new();
    // The relay drops the connection; the client sees clean EOF.
    client.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());
}

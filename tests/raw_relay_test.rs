// Raw relay against scripted TCP origins.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use geo_radio_proxy::config::RelayConfig;
use geo_radio_proxy::source::raw_relay::{RawRelay, RelayTarget};

const PAYLOAD_SIZE: usize = 64 * 1024;

fn payload() -> Vec<u8> {
    (0..PAYLOAD_SIZE).map(|i| (i % 251) as u8).collect()
}

fn relay_to(addr: SocketAddr, config: RelayConfig) -> RawRelay {
    RawRelay::new(
        RelayTarget {
            host: addr.ip().to_string(),
            port: addr.port(),
            path: "/stream".to_string(),
            use_tls: false,
        },
        config,
    )
}

/// Read the client's request head and return it as text.
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match socket.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => buf.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Origin that answers one connection with `head` then `body`, then closes.
async fn scripted_origin(head: &'static [u8], body: Vec<u8>) -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        let _ = tx.send(request);
        socket.write_all(head).await.unwrap();
        socket.write_all(&body).await.unwrap();
        let _ = socket.shutdown().await;
    });
    (addr, rx)
}

async fn collect(relay: RawRelay) -> Vec<u8> {
    let chunks: Vec<Bytes> = relay.into_stream().collect().await;
    chunks.concat()
}

#[tokio::test]
async fn test_relay_strips_headers() {
    let (addr, _rx) = scripted_origin(
        b"HTTP/1.0 200 OK\r\nContent-Type: audio/mpeg\r\n\r\n",
        payload(),
    )
    .await;

    let out = collect(relay_to(addr, RelayConfig::default())).await;
    assert_eq!(out.len(), PAYLOAD_SIZE);
    assert_eq!(out, payload());
}

#[tokio::test]
async fn test_relay_accepts_bare_newline_separator() {
    let (addr, _rx) = scripted_origin(b"ICY 200 OK\nicy-name: Test FM\n\n", b"AUDIO".to_vec()).await;

    let out = collect(relay_to(addr, RelayConfig::default())).await;
    assert_eq!(out, b"AUDIO");
}

#[tokio::test]
async fn test_relay_request_omits_metadata() {
    let (addr, rx) = scripted_origin(b"HTTP/1.0 200 OK\r\n\r\n", b"x".to_vec()).await;

    let _ = collect(relay_to(addr, RelayConfig::default())).await;
    let request = rx.await.unwrap();
    assert!(request.starts_with("GET /stream HTTP/1.0\r\n"));
    assert!(request.contains("User-Agent: MidnightRadio/1.0\r\n"));
    assert!(request.contains("Connection: close\r\n"));
    assert!(!request.to_ascii_lowercase().contains("icy-metadata"));
}

#[tokio::test]
async fn test_relay_chunks_respect_chunk_size() {
    // Head and body in one segment, so the header read pulls in body bytes.
    let mut segment = b"HTTP/1.0 200 OK\r\n\r\n".to_vec();
    segment.extend_from_slice(&payload());
    let (addr, _rx) = scripted_origin(b"", segment).await;
    let config = RelayConfig {
        chunk_size: 256,
        ..RelayConfig::default()
    };

    let chunks: Vec<Bytes> = relay_to(addr, config).into_stream().collect().await;
    assert!(chunks.iter().all(|c| !c.is_empty() && c.len() <= 256));
    assert_eq!(chunks.concat(), payload());
}

#[tokio::test]
async fn test_relay_oversized_header_block_ends_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        let _ = socket.write_all(b"HTTP/1.0 200 OK\r\nX-Pad: ").await;
        // Header line that never terminates.
        let _ = socket.write_all(&vec![b'a'; 32 * 1024]).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let config = RelayConfig {
        max_header_bytes: 8 * 1024,
        header_timeout_ms: 10_000,
        ..RelayConfig::default()
    };
    let out = tokio::time::timeout(Duration::from_secs(5), collect(relay_to(addr, config)))
        .await
        .expect("relay hung on an unterminated header block");
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_relay_stalled_headers_time_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        let _ = socket.write_all(b"HTTP/1.0 200 OK\r\n").await;
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let config = RelayConfig {
        header_timeout_ms: 300,
        ..RelayConfig::default()
    };
    let out = tokio::time::timeout(Duration::from_secs(5), collect(relay_to(addr, config)))
        .await
        .expect("relay hung on stalled headers");
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_relay_connection_refused_ends_quietly() {
    // Bind then drop to get a port with nothing listening.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let out = collect(relay_to(addr, RelayConfig::default())).await;
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_relay_closes_origin_socket_on_cancel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        read_request(&mut socket).await;
        socket.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await.unwrap();
        let (mut reader, mut writer) = socket.into_split();
        tokio::spawn(async move {
            loop {
                if writer.write_all(&[0x55; 512]).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });
        // The relay never sends anything after its request, so any read
        // completion means the connection was closed.
        let mut buf = [0u8; 64];
        let _ = reader.read(&mut buf).await;
        let _ = closed_tx.send(());
    });

    let mut stream = relay_to(addr, RelayConfig::default()).into_stream();
    let first = stream.next().await;
    assert!(first.is_some());
    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), closed_rx)
        .await
        .expect("origin socket still open after cancellation")
        .unwrap();
}

// Raw socket relay: speaks a minimal HTTP/1.0 request to legacy radio origins
// (Shoutcast/Icecast style), drops the response headers and relays the body.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::traits::{ByteStream, Delivery, DeliveryStrategy, StrategyKind};
use crate::config::{RelayConfig, RAW_RELAY_CONTENT_TYPE};
use crate::error::ProxyError;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Where a raw relay connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub use_tls: bool,
}

impl RelayTarget {
    fn host_header(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        let default_port = if self.use_tls { 443 } else { 80 };
        if self.port == default_port {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// Minimal HTTP/1.0 request. No `Icy-MetaData` header, so the origin
    /// never interleaves metadata frames into the audio.
    fn request(&self, user_agent: &str) -> String {
        format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
            self.path,
            self.host_header(),
            user_agent
        )
    }
}

#[derive(Debug, Clone)]
pub struct RawRelay {
    target: RelayTarget,
    config: RelayConfig,
}

impl RawRelay {
    pub fn new(target: RelayTarget, config: RelayConfig) -> Self {
        Self { target, config }
    }

    /// Build the lazy byte stream. Nothing touches the network until polled.
    pub fn into_stream(self) -> ByteStream {
        let RawRelay { target, config } = self;
        Box::pin(async_stream::stream! {
            let mut conn = match connect(&target, &config).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("raw relay connect {}:{} failed: {}", target.host, target.port, e);
                    return;
                }
            };

            let request = target.request(&config.user_agent);
            if let Err(e) = conn.send(request.as_bytes()).await {
                warn!("raw relay request to {} failed: {}", target.host, e);
                conn.close().await;
                return;
            }

            let chunk_size = config.chunk_size.max(1);
            let mut first = match timeout(config.header_timeout(), conn.skip_headers(config.max_header_bytes)).await {
                Ok(Ok(first)) => first,
                Ok(Err(e)) => {
                    warn!("raw relay header scan on {} failed: {}", target.host, e);
                    conn.close().await;
                    return;
                }
                Err(_) => {
                    warn!(
                        "raw relay header scan on {} timed out after {:?}",
                        target.host,
                        config.header_timeout()
                    );
                    conn.close().await;
                    return;
                }
            };

            info!("raw relay streaming {}:{}{}", target.host, target.port, target.path);
            // Body bytes that arrived with the header block.
            while first.len() > chunk_size {
                yield first.split_to(chunk_size);
            }
            if !first.is_empty() {
                yield first;
            }

            let mut buf = vec![0u8; chunk_size];
            loop {
                match conn.read(&mut buf).await {
                    Ok(0) => {
                        debug!("raw relay origin {} closed", target.host);
                        break;
                    }
                    Ok(n) => {
                        yield Bytes::copy_from_slice(&buf[..n]);
                    }
                    Err(e) => {
                        warn!("raw relay read from {} failed: {}", target.host, e);
                        break;
                    }
                }
            }
            conn.close().await;
        })
    }
}

#[async_trait]
impl DeliveryStrategy for RawRelay {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RawRelay
    }

    async fn open(&self) -> Result<Delivery, ProxyError> {
        Ok(Delivery {
            content_type: RAW_RELAY_CONTENT_TYPE.to_string(),
            body: self.clone().into_stream(),
        })
    }
}

/// Owns the origin connection. Dropping it without `close` (consumer went
/// away mid-stream) still shuts the transport down in the background.
struct RelayConnection {
    transport: Option<Box<dyn Transport>>,
}

impl RelayConnection {
    async fn send(&mut self, data: &[u8]) -> std::io::Result<()> {
        let transport = self.transport_mut()?;
        transport.write_all(data).await?;
        transport.flush().await
    }

    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.transport_mut()?.read(buf).await
    }

    /// Consume the header block and return whatever body bytes followed it.
    async fn skip_headers(&mut self, max_header_bytes: usize) -> Result<Bytes, ProxyError> {
        let transport = self.transport_mut()?;
        let mut buf = BytesMut::with_capacity(1024);
        loop {
            if let Some(end) = find_header_end(&buf) {
                if end > max_header_bytes {
                    break;
                }
                let line_end = buf.iter().position(|b| *b == b'\n').unwrap_or(end);
                let status = String::from_utf8_lossy(&buf[..line_end]);
                debug!("origin status line: {}", status.trim_end());
                return Ok(buf.split_off(end).freeze());
            }
            if buf.len() >= max_header_bytes {
                break;
            }
            buf.reserve(1024);
            let n = transport.read_buf(&mut buf).await?;
            if n == 0 {
                return Err(ProxyError::Connection(
                    "origin closed before end of headers".to_string(),
                ));
            }
        }
        Err(ProxyError::Connection(format!(
            "header block exceeds {} bytes",
            max_header_bytes
        )))
    }

    async fn close(mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _ = timeout(SHUTDOWN_GRACE, transport.shutdown()).await;
        }
    }

    fn transport_mut(&mut self) -> std::io::Result<&mut Box<dyn Transport>> {
        self.transport
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "closed"))
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        debug!("raw relay connection dropped mid-stream, shutting down");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = timeout(SHUTDOWN_GRACE, transport.shutdown()).await;
            });
        }
    }
}

async fn connect(target: &RelayTarget, config: &RelayConfig) -> Result<RelayConnection, ProxyError> {
    let addr = (target.host.as_str(), target.port);
    let tcp = timeout(config.connect_timeout(), TcpStream::connect(addr))
        .await
        .map_err(|_| ProxyError::Connection("connect timed out".to_string()))??;
    let _ = tcp.set_nodelay(true);

    if !target.use_tls {
        return Ok(RelayConnection {
            transport: Some(Box::new(tcp)),
        });
    }

    let server_name = ServerName::try_from(target.host.clone())
        .map_err(|e| ProxyError::Connection(format!("invalid tls name: {}", e)))?;
    let tls = timeout(config.connect_timeout(), tls_connector()?.connect(server_name, tcp))
        .await
        .map_err(|_| ProxyError::Connection("tls handshake timed out".to_string()))??;
    Ok(RelayConnection {
        transport: Some(Box::new(tls)),
    })
}

fn tls_connector() -> Result<TlsConnector, ProxyError> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Connection(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Index of the first body byte, accepting `\r\n\r\n` or a bare `\n\n`.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.iter().enumerate().find_map(|(i, b)| {
        if *b != b'\n' {
            return None;
        }
        match &buf[i + 1..] {
            [b'\n', ..] => Some(i + 2),
            [b'\r', b'\n', ..] => Some(i + 3),
            _ => None,
        }
    })
}

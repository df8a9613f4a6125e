use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::ProxyError;

/// Lazy, finite, non-restartable sequence of audio bytes owned by one response.
///
/// Mid-stream failures are logged by the producer and simply end the stream.
pub type ByteStream = BoxStream<'static, Bytes>;

/// A committed delivery: the media type to declare and the body to stream.
pub struct Delivery {
    pub content_type: String,
    pub body: ByteStream,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// The three delivery strategies, used for logging and stream accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    RawRelay,
    ExternalBridge,
    CdnPassthrough,
}

impl StrategyKind {
    pub fn label(self) -> &'static str {
        match self {
            StrategyKind::RawRelay => "raw-relay",
            StrategyKind::ExternalBridge => "external-bridge",
            StrategyKind::CdnPassthrough => "cdn-passthrough",
        }
    }
}

/// One way of turning a source URL into a byte stream.
#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Prepare the delivery. Errors returned here happen before any byte is
    /// sent and become HTTP status codes.
    async fn open(&self) -> Result<Delivery, ProxyError>;
}

// CDN passthrough: resolves a page URL to its expiring media URL and relays it.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tracing::{debug, info, warn};

use super::resolver::MediaResolver;
use super::traits::{ByteStream, Delivery, DeliveryStrategy, StrategyKind};
use crate::error::ProxyError;

pub struct CdnPassthrough {
    source_url: String,
    resolver: Arc<dyn MediaResolver>,
    client: Client,
    chunk_size: usize,
}

impl CdnPassthrough {
    pub fn new(
        source_url: String,
        resolver: Arc<dyn MediaResolver>,
        client: Client,
        chunk_size: usize,
    ) -> Self {
        Self {
            source_url,
            resolver,
            client,
            chunk_size: chunk_size.max(1),
        }
    }
}

#[async_trait]
impl DeliveryStrategy for CdnPassthrough {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CdnPassthrough
    }

    /// Resolution and the CDN request both happen here, before any byte is
    /// committed, so either failure still yields a proper error status.
    async fn open(&self) -> Result<Delivery, ProxyError> {
        let media = self.resolver.resolve(&self.source_url).await?;
        debug!("cdn passthrough for {} via {}", self.source_url, media.cdn_url);

        let resp = self.client.get(&media.cdn_url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            warn!("cdn fetch failed status={}", status.as_u16());
            return Err(ProxyError::Connection(format!("cdn returned HTTP {}", status.as_u16())));
        }

        info!("cdn passthrough streaming {} ({})", self.source_url, media.media_type);
        let chunk_size = self.chunk_size;
        let source_url = self.source_url.clone();
        let mut upstream = Box::pin(resp.bytes_stream());
        let body: ByteStream = Box::pin(async_stream::stream! {
            while let Some(item) = upstream.next().await {
                match item {
                    Ok(mut chunk) => {
                        while chunk.len() > chunk_size {
                            yield chunk.split_to(chunk_size);
                        }
                        if !chunk.is_empty() {
                            yield chunk;
                        }
                    }
                    Err(e) => {
                        warn!("cdn stream for {} interrupted: {}", source_url, e);
                        break;
                    }
                }
            }
            debug!("cdn stream for {} ended", source_url);
        });

        Ok(Delivery {
            content_type: media.media_type,
            body,
        })
    }
}

// Stream accounting: active streams, totals per strategy, relay throughput.

use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::source::traits::{ByteStream, StrategyKind};

struct StatsSample {
    at: Instant,
    relayed_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub active_streams: u32,
    pub streams_total: u64,
    pub raw_relay_streams: u64,
    pub bridge_streams: u64,
    pub cdn_streams: u64,
    pub bytes_relayed: u64,
    pub relay_bps: u64,
}

pub struct StatsCollector {
    active_streams: AtomicU32,
    streams_total: AtomicU64,
    raw_relay_streams: AtomicU64,
    bridge_streams: AtomicU64,
    cdn_streams: AtomicU64,
    bytes_relayed: AtomicU64,
    last_sample: Mutex<StatsSample>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            active_streams: AtomicU32::new(0),
            streams_total: AtomicU64::new(0),
            raw_relay_streams: AtomicU64::new(0),
            bridge_streams: AtomicU64::new(0),
            cdn_streams: AtomicU64::new(0),
            bytes_relayed: AtomicU64::new(0),
            last_sample: Mutex::new(StatsSample {
                at: Instant::now(),
                relayed_bytes: 0,
            }),
        }
    }

    fn stream_opened(&self, strategy: StrategyKind) {
        self.active_streams.fetch_add(1, Ordering::Relaxed);
        self.streams_total.fetch_add(1, Ordering::Relaxed);
        let counter = match strategy {
            StrategyKind::RawRelay => &self.raw_relay_streams,
            StrategyKind::ExternalBridge => &self.bridge_streams,
            StrategyKind::CdnPassthrough => &self.cdn_streams,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn stream_closed(&self) {
        self.active_streams.fetch_sub(1, Ordering::Relaxed);
    }

    fn record_relayed(&self, bytes: u64) {
        self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn active_streams(&self) -> u32 {
        self.active_streams.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let now = Instant::now();
        let relayed = self.bytes_relayed.load(Ordering::Relaxed);

        let relay_bps = {
            let mut sample = self.last_sample.lock();
            let elapsed = now.duration_since(sample.at).as_secs_f64();
            let bps = if elapsed > 0.1 {
                (relayed.saturating_sub(sample.relayed_bytes) as f64 / elapsed) as u64
            } else {
                0
            };
            sample.at = now;
            sample.relayed_bytes = relayed;
            bps
        };

        StatsSnapshot {
            active_streams: self.active_streams.load(Ordering::Relaxed),
            streams_total: self.streams_total.load(Ordering::Relaxed),
            raw_relay_streams: self.raw_relay_streams.load(Ordering::Relaxed),
            bridge_streams: self.bridge_streams.load(Ordering::Relaxed),
            cdn_streams: self.cdn_streams.load(Ordering::Relaxed),
            bytes_relayed: relayed,
            relay_bps,
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte stream wrapper that counts relayed bytes and logs when the response
/// body is finished or dropped by a disconnecting client.
pub struct MeteredStream {
    inner: ByteStream,
    stats: Arc<StatsCollector>,
    strategy: StrategyKind,
    bytes: u64,
    opened_at: Instant,
}

impl MeteredStream {
    pub fn new(inner: ByteStream, stats: Arc<StatsCollector>, strategy: StrategyKind) -> Self {
        stats.stream_opened(strategy);
        Self {
            inner,
            stats,
            strategy,
            bytes: 0,
            opened_at: Instant::now(),
        }
    }
}

impl Stream for MeteredStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        let polled = self.inner.as_mut().poll_next(cx);
        if let Poll::Ready(Some(chunk)) = &polled {
            let len = chunk.len() as u64;
            self.bytes += len;
            self.stats.record_relayed(len);
        }
        polled
    }
}

impl Drop for MeteredStream {
    fn drop(&mut self) {
        self.stats.stream_closed();
        info!(
            "{} stream closed after {:?}, {} bytes relayed",
            self.strategy.label(),
            self.opened_at.elapsed(),
            self.bytes
        );
    }
}

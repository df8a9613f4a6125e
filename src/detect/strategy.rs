// Strategy classifier: picks how a source URL is turned into a byte stream.
// Pure parsing, no network I/O.

use url::Url;

use crate::error::ProxyError;
use crate::source::traits::StrategyKind;

/// Live-video platforms whose streams are only reachable through the media tool.
const LIVE_VIDEO_DOMAINS: &[&str] = &["youtube.com", "youtu.be", "youtube-nocookie.com"];

/// Short-audio platforms that front their media with expiring CDN URLs.
const CDN_AUDIO_DOMAINS: &[&str] = &["soundcloud.com", "snd.sc"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryPlan {
    RawRelay {
        host: String,
        port: u16,
        /// Path plus query, never empty.
        path: String,
        use_tls: bool,
    },
    ExternalBridge {
        source_url: String,
    },
    CdnPassthrough {
        source_url: String,
    },
}

impl DeliveryPlan {
    pub fn kind(&self) -> StrategyKind {
        match self {
            DeliveryPlan::RawRelay { .. } => StrategyKind::RawRelay,
            DeliveryPlan::ExternalBridge { .. } => StrategyKind::ExternalBridge,
            DeliveryPlan::CdnPassthrough { .. } => StrategyKind::CdnPassthrough,
        }
    }

    pub fn label(&self) -> &'static str {
        self.kind().label()
    }
}

/// True when `host` equals `domain` or is a subdomain of it.
fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn matches_any(host: &str, domains: &[&str]) -> bool {
    domains.iter().any(|d| host_matches(host, d))
}

/// Classify a source URL. First match wins: live video, CDN audio, raw relay.
pub fn classify(source_url: &str) -> Result<DeliveryPlan, ProxyError> {
    let trimmed = source_url.trim();
    let parsed = Url::parse(trimmed)
        .map_err(|e| ProxyError::Classification(format!("{}: {}", trimmed, e)))?;

    let use_tls = match parsed.scheme() {
        "http" => false,
        "https" => true,
        other => {
            return Err(ProxyError::Classification(format!(
                "unsupported scheme {}",
                other
            )))
        }
    };

    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProxyError::Classification("source url has no host".to_string()))?
        .to_ascii_lowercase();

    if matches_any(&host, LIVE_VIDEO_DOMAINS) {
        return Ok(DeliveryPlan::ExternalBridge {
            source_url: parsed.to_string(),
        });
    }
    if matches_any(&host, CDN_AUDIO_DOMAINS) {
        return Ok(DeliveryPlan::CdnPassthrough {
            source_url: parsed.to_string(),
        });
    }

    let port = parsed
        .port_or_known_default()
        .unwrap_or(if use_tls { 443 } else { 80 });

    let mut path = parsed.path().to_string();
    if path.is_empty() {
        path.push('/');
    }
    if let Some(query) = parsed.query() {
        path.push('?');
        path.push_str(query);
    }

    // IPv6 literals come back bracketed; sockets want the bare address.
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();

    Ok(DeliveryPlan::RawRelay {
        host,
        port,
        path,
        use_tls,
    })
}

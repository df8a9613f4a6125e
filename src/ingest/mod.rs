// Station ingestion: pluggable fetchers that feed the station store.

pub mod curated;
pub mod radio_browser;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::store::StationStore;

/// One geo-tagged station as stored and listed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationRecord {
    pub uuid: String,
    pub name: String,
    pub url: String,
    pub country: Option<String>,
    pub tags: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub source: String,
}

#[async_trait]
pub trait StationSource: Send + Sync {
    fn source_name(&self) -> &'static str;
    async fn fetch_and_parse(&self) -> Result<Vec<StationRecord>>;
}

/// Built-in sources, in ingestion order.
pub fn registry(config: &ServerConfig) -> Vec<Box<dyn StationSource>> {
    vec![
        Box::new(radio_browser::RadioBrowserSource::new()),
        Box::new(curated::CuratedSource::soundcloud(&config.media_tool)),
        Box::new(curated::CuratedSource::youtube(&config.media_tool)),
    ]
}

/// Run every source once and upsert what it returns. A failing source is
/// logged and skipped. Returns the number of stations written.
pub async fn run_ingestion(sources: &[Box<dyn StationSource>], store: Arc<StationStore>) -> usize {
    let mut written = 0;
    for source in sources {
        let name = source.source_name();
        let stations = match source.fetch_and_parse().await {
            Ok(stations) => stations,
            Err(e) => {
                warn!("[{}] ingestion failed: {:#}", name, e);
                continue;
            }
        };
        if stations.is_empty() {
            info!("[{}] produced no stations", name);
            continue;
        }

        let store = Arc::clone(&store);
        match tokio::task::spawn_blocking(move || store.upsert_all(&stations)).await {
            Ok(Ok(n)) => {
                info!("[{}] stored {} stations", name, n);
                written += n;
            }
            Ok(Err(e)) => warn!("[{}] store failed: {:#}", name, e),
            Err(e) => warn!("[{}] store task failed: {}", name, e),
        }
    }
    info!("ingestion finished, {} stations written", written);
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    struct FixedSource(Vec<StationRecord>);

    #[async_trait]
    impl StationSource for FixedSource {
        fn source_name(&self) -> &'static str {
            "fixed"
        }

        async fn fetch_and_parse(&self) -> Result<Vec<StationRecord>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl StationSource for BrokenSource {
        fn source_name(&self) -> &'static str {
            "broken"
        }

        async fn fetch_and_parse(&self) -> Result<Vec<StationRecord>> {
            anyhow::bail!("upstream unavailable")
        }
    }

    #[tokio::test]
    async fn test_failing_source_is_skipped() {
        let store = Arc::new(StationStore::open(&StorageConfig::InMemory).unwrap());
        let record = StationRecord {
            uuid: "u1".to_string(),
            name: "One".to_string(),
            url: "http://radio.example/one".to_string(),
            country: None,
            tags: None,
            lat: 1.0,
            lng: 2.0,
            source: "fixed".to_string(),
        };
        let sources: Vec<Box<dyn StationSource>> =
            vec![Box::new(BrokenSource), Box::new(FixedSource(vec![record]))];

        let written = run_ingestion(&sources, Arc::clone(&store)).await;
        assert_eq!(written, 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_registry_names() {
        let names: Vec<_> = registry(&ServerConfig::default())
            .iter()
            .map(|s| s.source_name())
            .collect();
        assert_eq!(
            names,
            vec!["radio_browser_api", "soundcloud_curated", "youtube_curated"]
        );
    }
}

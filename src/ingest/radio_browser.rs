use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::info;

use super::{StationRecord, StationSource};

const DATA_URL: &str = "https://de1.api.radio-browser.info/json/stations/topclick/500";

/// Radio Browser coordinates arrive as numbers or strings depending on mirror.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Coordinate {
    Number(f64),
    Text(String),
}

impl Coordinate {
    fn value(&self) -> Option<f64> {
        match self {
            Coordinate::Number(v) => Some(*v),
            Coordinate::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiStation {
    stationuuid: Option<String>,
    #[serde(default)]
    name: String,
    url_resolved: Option<String>,
    country: Option<String>,
    tags: Option<String>,
    geo_lat: Option<Coordinate>,
    geo_long: Option<Coordinate>,
}

pub struct RadioBrowserSource {
    client: Client,
    data_url: String,
}

impl RadioBrowserSource {
    pub fn new() -> Self {
        Self::with_url(DATA_URL)
    }

    pub fn with_url(data_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            data_url: data_url.into(),
        }
    }
}

impl Default for RadioBrowserSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep only entries with an id, a stream URL and non-zero coordinates.
fn parse_stations(items: Vec<ApiStation>, source_name: &str) -> Vec<StationRecord> {
    items
        .into_iter()
        .filter_map(|item| {
            let lat = item.geo_lat.as_ref().and_then(Coordinate::value)?;
            let lng = item.geo_long.as_ref().and_then(Coordinate::value)?;
            if lat == 0.0 || lng == 0.0 {
                return None;
            }
            Some(StationRecord {
                uuid: item.stationuuid?,
                name: item.name.trim().to_string(),
                url: item.url_resolved.filter(|u| !u.is_empty())?,
                country: item.country,
                tags: item.tags,
                lat,
                lng,
                source: source_name.to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl StationSource for RadioBrowserSource {
    fn source_name(&self) -> &'static str {
        "radio_browser_api"
    }

    async fn fetch_and_parse(&self) -> Result<Vec<StationRecord>> {
        info!("[{}] fetching {}", self.source_name(), self.data_url);
        let items: Vec<ApiStation> = self
            .client
            .get(&self.data_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("decoding radio browser response")?;

        let total = items.len();
        let stations = parse_stations(items, self.source_name());
        info!(
            "[{}] parsed {} geo-stations out of {}",
            self.source_name(),
            stations.len(),
            total
        );
        Ok(stations)
    }
}

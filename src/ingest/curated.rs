// Curated platform sources: hand-placed SoundCloud sets and YouTube streams.
// The platforms carry no geo data, so coordinates come from the entry list.
// Only page URLs are stored; playable URLs are resolved at proxy time.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::Deserialize;
use tracing::{info, warn};

use super::{StationRecord, StationSource};
use crate::config::{MediaToolConfig, RESOLVE_TIMEOUT_SECONDS};
use crate::source::resolver::run_media_tool;

/// Playlists contribute at most this many entries.
const MAX_PLAYLIST_ENTRIES: usize = 10;

/// Degrees of jitter applied to playlist entries around the source point.
const PLAYLIST_SCATTER_DEGREES: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    SoundCloud,
    YouTube,
}

impl Platform {
    fn source_name(self) -> &'static str {
        match self {
            Platform::SoundCloud => "soundcloud_curated",
            Platform::YouTube => "youtube_curated",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Platform::SoundCloud => "SoundCloud",
            Platform::YouTube => "YouTube",
        }
    }

    fn uuid_prefix(self) -> &'static str {
        match self {
            Platform::SoundCloud => "sc",
            Platform::YouTube => "yt",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CuratedEntry {
    pub url: String,
    pub lat: f64,
    pub lng: f64,
    pub override_name: Option<String>,
    pub tags: Option<String>,
}

impl CuratedEntry {
    fn new(url: &str, lat: f64, lng: f64, name: &str, tags: &str) -> Self {
        Self {
            url: url.to_string(),
            lat,
            lng,
            override_name: Some(name.to_string()),
            tags: Some(tags.to_string()),
        }
    }
}

/// Flat (non-resolving) description from the media tool.
#[derive(Debug, Default, Deserialize)]
struct FlatInfo {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    entries: Option<Vec<Option<FlatInfo>>>,
}

pub struct CuratedSource {
    platform: Platform,
    entries: Vec<CuratedEntry>,
    program: String,
}

impl CuratedSource {
    pub fn new(platform: Platform, entries: Vec<CuratedEntry>, tool: &MediaToolConfig) -> Self {
        Self {
            platform,
            entries,
            program: tool.program.clone(),
        }
    }

    /// DJ sets work best here; a one to two hour track plays like a broadcast.
    pub fn soundcloud(tool: &MediaToolConfig) -> Self {
        let entries = vec![
            CuratedEntry::new(
                "https://soundcloud.com/sam-selis/kokoro-4am-5am",
                51.5074,
                -0.1278,
                "Rinse FM: Saoirse",
                "House, Techno, UK",
            ),
            CuratedEntry::new(
                "https://on.soundcloud.com/M6BeT0cgEwXMY9ECQ4",
                54.5973,
                -5.9301,
                "Bicep (Boiler Room)",
                "Breakbeat, Live Set",
            ),
            CuratedEntry::new(
                "https://soundcloud.com/sam-selis/kbbq-2am-3am",
                34.0522,
                -118.2437,
                "Soulection Radio 685",
                "Future Beats, Soul",
            ),
        ];
        Self::new(Platform::SoundCloud, entries, tool)
    }

    pub fn youtube(tool: &MediaToolConfig) -> Self {
        let entries = vec![
            CuratedEntry::new(
                "https://www.youtube.com/live/jfKfPfyJRdk",
                48.8566,
                2.3522,
                "Lofi Girl Radio",
                "LoFi, Study, Chill",
            ),
            CuratedEntry::new(
                "https://youtu.be/c0-hvjV2A5Y",
                51.5074,
                -0.1278,
                "Fred Again - London set",
                "House, Funk",
            ),
        ];
        Self::new(Platform::YouTube, entries, tool)
    }

    async fn fetch_flat(&self, url: &str) -> Result<FlatInfo> {
        let mut command = Command::new(&self.program);
        command.args(["-J", "--flat-playlist", "--quiet", "--no-warnings", "--", url]);
        let limit = Duration::from_secs(RESOLVE_TIMEOUT_SECONDS);

        let output = run_media_tool(command, limit).await?;
        if !output.status.success() {
            anyhow::bail!(
                "media tool exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        serde_json::from_slice(&output.stdout).context("decoding media tool output")
    }
}

fn record(
    platform: Platform,
    entry: &CuratedEntry,
    info: &FlatInfo,
    offset: (f64, f64),
) -> StationRecord {
    let id = info.id.clone().filter(|id| !id.is_empty());
    let url = match (platform, &id) {
        (Platform::YouTube, Some(id)) => format!("https://www.youtube.com/watch?v={}", id),
        _ => entry.url.clone(),
    };
    let name = entry
        .override_name
        .clone()
        .or_else(|| info.title.clone())
        .unwrap_or_else(|| "Unknown".to_string());

    StationRecord {
        uuid: format!(
            "{}-{}",
            platform.uuid_prefix(),
            id.as_deref().unwrap_or(&entry.url)
        ),
        name,
        url,
        country: Some(platform.label().to_string()),
        tags: Some(
            entry
                .tags
                .clone()
                .unwrap_or_else(|| platform.label().to_string()),
        ),
        lat: entry.lat + offset.0,
        lng: entry.lng + offset.1,
        source: platform.source_name().to_string(),
    }
}

/// Turn one flat description into station records. YouTube playlists fan out
/// into scattered entries; everything else yields a single station.
fn records_for<R: Rng>(
    platform: Platform,
    entry: &CuratedEntry,
    info: &FlatInfo,
    rng: &mut R,
) -> Vec<StationRecord> {
    match (&info.entries, platform) {
        (Some(children), Platform::YouTube) => children
            .iter()
            .flatten()
            .take(MAX_PLAYLIST_ENTRIES)
            .map(|child| {
                let offset = (
                    rng.random_range(-PLAYLIST_SCATTER_DEGREES..PLAYLIST_SCATTER_DEGREES),
                    rng.random_range(-PLAYLIST_SCATTER_DEGREES..PLAYLIST_SCATTER_DEGREES),
                );
                record(platform, entry, child, offset)
            })
            .collect(),
        _ => vec![record(platform, entry, info, (0.0, 0.0))],
    }
}

#[async_trait]
impl StationSource for CuratedSource {
    fn source_name(&self) -> &'static str {
        self.platform.source_name()
    }

    async fn fetch_and_parse(&self) -> Result<Vec<StationRecord>> {
        info!(
            "[{}] processing {} curated entries",
            self.source_name(),
            self.entries.len()
        );
        let mut results = Vec::new();
        for entry in &self.entries {
            match self.fetch_flat(&entry.url).await {
                Ok(info) => {
                    let records = records_for(self.platform, entry, &info, &mut rand::rng());
                    for r in &records {
                        info!("   -> found {} ({})", r.name, r.url);
                    }
                    results.extend(records);
                }
                Err(e) => warn!("   -> failed {}: {:#}", entry.url, e),
            }
        }
        info!("[{}] parsed {} stations", self.source_name(), results.len());
        Ok(results)
    }
}

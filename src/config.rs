use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

/// Size of each read from a raw origin socket (4 KB).
pub const RELAY_CHUNK_BYTES: usize = 4096;

/// Upper bound on the response header block of a raw origin (8 KB).
pub const MAX_HEADER_BYTES: usize = 8 * 1024;

/// Seconds allowed for the origin to finish its header block.
pub const HEADER_SCAN_TIMEOUT_SECONDS: u64 = 5;

/// Seconds allowed to establish a TCP (and TLS) connection to an origin.
pub const CONNECT_TIMEOUT_SECONDS: u64 = 10;

/// Number of chunks the process bridge may hold before the worker blocks.
pub const BRIDGE_QUEUE_DEPTH: usize = 64;

/// Size of each blocking read from the external process stdout (16 KB).
pub const BRIDGE_READ_BYTES: usize = 16 * 1024;

/// Number of stderr lines kept from the external process for diagnostics.
pub const BRIDGE_STDERR_TAIL_LINES: usize = 50;

/// Seconds a metadata resolution by the media tool may take.
pub const RESOLVE_TIMEOUT_SECONDS: u64 = 30;

/// Format preference for CDN resolution: direct progressive audio first,
/// segmented renditions last.
pub const CDN_FORMAT_PREFERENCE: &str = "bestaudio[protocol=https]/bestaudio[protocol=http]/bestaudio";

/// Identifying user agent sent to raw origins.
pub const RELAY_USER_AGENT: &str = "MidnightRadio/1.0";

/// Content type declared for raw relays; origin headers are discarded.
pub const RAW_RELAY_CONTENT_TYPE: &str = "audio/mpeg";

/// Content type declared for the process bridge (MPEG transport stream).
pub const BRIDGE_CONTENT_TYPE: &str = "video/mp2t";

/// Maximum number of stations returned by the directory listing.
pub const DEFAULT_STATION_LIMIT: u32 = 2000;

/// Tunables for the raw socket relay.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub chunk_size: usize,
    pub max_header_bytes: usize,
    pub header_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub user_agent: String,
}

impl RelayConfig {
    pub fn header_timeout(&self) -> Duration {
        Duration::from_millis(self.header_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: RELAY_CHUNK_BYTES,
            max_header_bytes: MAX_HEADER_BYTES,
            header_timeout_ms: HEADER_SCAN_TIMEOUT_SECONDS * 1000,
            connect_timeout_ms: CONNECT_TIMEOUT_SECONDS * 1000,
            user_agent: RELAY_USER_AGENT.to_string(),
        }
    }
}

/// How the external media tool is invoked.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaToolConfig {
    /// Program name or path of the media tool.
    pub program: String,
    /// JS runtime handed to the tool for sites that need script execution.
    pub js_runtime: Option<String>,
    pub queue_depth: usize,
    pub read_size: usize,
    /// Chunk size used when relaying a resolved CDN body.
    pub cdn_chunk_size: usize,
}

impl Default for MediaToolConfig {
    fn default() -> Self {
        Self {
            program: "yt-dlp".to_string(),
            js_runtime: Some("node".to_string()),
            queue_depth: BRIDGE_QUEUE_DEPTH,
            read_size: BRIDGE_READ_BYTES,
            cdn_chunk_size: BRIDGE_READ_BYTES,
        }
    }
}

/// Top-level configuration for the proxy service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Directory of built front-end assets, served as a fallback.
    pub static_dir: Option<PathBuf>,
    pub database_path: PathBuf,
    pub fallback_database_path: Option<PathBuf>,
    pub station_limit: u32,
    /// Run the ingestion sources once in the background at startup.
    pub ingest_on_start: bool,
    pub relay: RelayConfig,
    pub media_tool: MediaToolConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            static_dir: None,
            database_path: PathBuf::from("stations.db"),
            fallback_database_path: Some(std::env::temp_dir().join("geo-radio-stations.db")),
            station_limit: DEFAULT_STATION_LIMIT,
            ingest_on_start: true,
            relay: RelayConfig::default(),
            media_tool: MediaToolConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from an optional YAML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_yaml::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = PathBuf::from(path);
            }
        }
        if let Ok(bind) = std::env::var("GEO_RADIO_BIND") {
            if !bind.trim().is_empty() {
                self.bind = bind;
            }
        }
        if let Ok(program) = std::env::var("GEO_RADIO_YTDLP") {
            if !program.trim().is_empty() {
                self.media_tool.program = program;
            }
        }
    }
}

/// Where the station database lives. Chosen once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Primary(PathBuf),
    Fallback(PathBuf),
    InMemory,
}

impl StorageConfig {
    /// Try the primary path, then the fallback path, then fall back to memory.
    ///
    /// A path tier is accepted when its parent directory exists (or can be
    /// created) and the database file can be opened for writing.
    pub fn resolve(primary: &Path, fallback: Option<&Path>) -> Self {
        let chosen = if usable_path(primary) {
            StorageConfig::Primary(primary.to_path_buf())
        } else if let Some(fallback) = fallback.filter(|p| usable_path(p)) {
            warn!(
                "database path {} unusable, falling back to {}",
                primary.display(),
                fallback.display()
            );
            StorageConfig::Fallback(fallback.to_path_buf())
        } else {
            warn!("no writable database path, stations will be kept in memory");
            StorageConfig::InMemory
        };
        info!("station storage: {}", chosen.describe());
        chosen
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            StorageConfig::Primary(p) | StorageConfig::Fallback(p) => Some(p),
            StorageConfig::InMemory => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            StorageConfig::Primary(p) => format!("primary {}", p.display()),
            StorageConfig::Fallback(p) => format!("fallback {}", p.display()),
            StorageConfig::InMemory => "in-memory".to_string(),
        }
    }
}

fn usable_path(path: &Path) -> bool {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if std::fs::create_dir_all(parent).is_err() {
            return false;
        }
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .is_ok()
}

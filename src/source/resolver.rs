// CDN resolution: asks the media tool for the playable URL behind a page URL.

use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{MediaToolConfig, CDN_FORMAT_PREFERENCE, RESOLVE_TIMEOUT_SECONDS};
use crate::error::ProxyError;

/// A freshly resolved, time-limited media URL. Never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedia {
    pub cdn_url: String,
    pub media_type: String,
}

#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve(&self, source_url: &str) -> Result<ResolvedMedia, ProxyError>;
}

/// Subset of the media tool's JSON description that resolution needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub formats: Vec<MediaFormat>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaFormat {
    #[serde(default)]
    pub format_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default)]
    pub tbr: Option<f64>,
}

impl MediaFormat {
    fn is_progressive(&self) -> bool {
        is_progressive(self.protocol.as_deref(), self.url.as_deref())
    }

    fn has_audio(&self) -> bool {
        self.acodec.as_deref() != Some("none")
    }

    fn bitrate(&self) -> f64 {
        self.abr.or(self.tbr).unwrap_or(0.0)
    }
}

fn is_progressive(protocol: Option<&str>, url: Option<&str>) -> bool {
    match protocol {
        Some(p) => p == "https" || p == "http",
        // No protocol reported: judge by the URL itself.
        None => url.is_some_and(|u| {
            (u.starts_with("https://") || u.starts_with("http://")) && !u.contains(".m3u8")
        }),
    }
}

/// Pick a single continuous media resource, preferring progressive HTTP(S)
/// over segmented manifests. Returns `None` when only manifests are offered.
pub fn select_media(info: &MediaInfo) -> Option<ResolvedMedia> {
    if let Some(url) = info.url.as_deref() {
        if is_progressive(info.protocol.as_deref(), Some(url)) && info.acodec.as_deref() != Some("none") {
            return Some(ResolvedMedia {
                cdn_url: url.to_string(),
                media_type: media_type_for(info.ext.as_deref()),
            });
        }
    }

    info.formats
        .iter()
        .filter(|f| f.url.is_some() && f.has_audio() && f.is_progressive())
        .max_by(|a, b| a.bitrate().total_cmp(&b.bitrate()))
        .and_then(|f| {
            Some(ResolvedMedia {
                cdn_url: f.url.clone()?,
                media_type: media_type_for(f.ext.as_deref()),
            })
        })
}

/// Audio MIME type for a container extension.
pub fn media_type_for(ext: Option<&str>) -> String {
    match ext.map(|e| e.to_ascii_lowercase()).as_deref() {
        Some("mp3") => "audio/mpeg",
        Some("m4a") | Some("mp4") | Some("aac") => "audio/mp4",
        Some("opus") | Some("ogg") | Some("oga") => "audio/ogg",
        Some("webm") => "audio/webm",
        Some("flac") => "audio/flac",
        Some("wav") => "audio/wav",
        _ => "audio/mpeg",
    }
    .to_string()
}

/// Resolver backed by the external media tool's JSON dump.
#[derive(Debug, Clone)]
pub struct MediaToolResolver {
    program: String,
    format: String,
    timeout: Duration,
}

impl MediaToolResolver {
    pub fn new(tool: &MediaToolConfig) -> Self {
        Self {
            program: tool.program.clone(),
            format: CDN_FORMAT_PREFERENCE.to_string(),
            timeout: Duration::from_secs(RESOLVE_TIMEOUT_SECONDS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn args(&self, source_url: &str) -> Vec<String> {
        [
            "-J",
            "--no-playlist",
            "--quiet",
            "--no-warnings",
            "-f",
            self.format.as_str(),
            "--",
            source_url,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

#[async_trait]
impl MediaResolver for MediaToolResolver {
    async fn resolve(&self, source_url: &str) -> Result<ResolvedMedia, ProxyError> {
        let mut command = Command::new(&self.program);
        command.args(self.args(source_url));

        let started = Instant::now();
        let output = run_media_tool(command, self.timeout).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProxyError::Resolution(format!(
                "media tool exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let info: MediaInfo = serde_json::from_slice(&output.stdout)
            .map_err(|e| ProxyError::Resolution(format!("unreadable media description: {}", e)))?;
        let media = select_media(&info).ok_or_else(|| {
            ProxyError::Resolution("no progressive audio rendition offered".to_string())
        })?;

        info!(
            "resolved {} in {:?} -> {} ({})",
            source_url,
            started.elapsed(),
            info.title.as_deref().unwrap_or("untitled"),
            media.media_type
        );
        Ok(media)
    }
}

/// Run the media tool off the scheduler. Dropping the returned future kills
/// and reaps the process.
pub(crate) async fn run_media_tool(command: Command, limit: Duration) -> Result<Output, ProxyError> {
    let cancel = CancellationToken::new();
    let _kill_on_drop = cancel.clone().drop_guard();
    tokio::task::spawn_blocking(move || run_with_timeout(command, limit, &cancel))
        .await
        .map_err(|e| ProxyError::Resolution(format!("media tool task failed: {}", e)))?
}

/// Run the media tool to completion, killing it past `limit` or once
/// `cancel` fires. Blocking.
fn run_with_timeout(
    mut command: Command,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<Output, ProxyError> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ProxyError::Resolution(format!("spawn media tool: {}", e)))?;

    // Drain both pipes concurrently so a large dump never fills a pipe and stalls.
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = Instant::now() + limit;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if cancel.is_cancelled() => {
                debug!("media tool run cancelled, killing pid={}", child.id());
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProxyError::Resolution("cancelled".to_string()));
            }
            Ok(None) if Instant::now() >= deadline => {
                warn!("media tool timed out after {:?}, killing", limit);
                let _ = child.kill();
                let _ = child.wait();
                return Err(ProxyError::Resolution(format!("timed out after {:?}", limit)));
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(50)),
            Err(e) => return Err(ProxyError::Resolution(format!("wait media tool: {}", e))),
        }
    };

    let collect = |handle: Option<std::thread::JoinHandle<Vec<u8>>>| {
        handle.and_then(|h| h.join().ok()).unwrap_or_default()
    };
    let output = Output {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    };
    debug!(
        "media tool exited {} stdout={}B stderr={}B",
        output.status,
        output.stdout.len(),
        output.stderr.len()
    );
    Ok(output)
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

// CDN resolution and curated metadata driven by shell scripts standing in
// for the media tool.
#![cfg(target_os = "linux")]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use geo_radio_proxy::config::{MediaToolConfig, CDN_FORMAT_PREFERENCE};
use geo_radio_proxy::error::ProxyError;
use geo_radio_proxy::ingest::curated::{CuratedEntry, CuratedSource, Platform};
use geo_radio_proxy::ingest::StationSource;
use geo_radio_proxy::source::resolver::{MediaResolver, MediaToolResolver};

const SOURCE_URL: &str = "https://soundcloud.com/artist/long-set";

/// Write an executable fake media tool into `dir` and return its config.
fn fake_tool(dir: &TempDir, body: &str) -> MediaToolConfig {
    let path = dir.path().join("fake-media-tool");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    MediaToolConfig {
        program: path.to_string_lossy().into_owned(),
        ..MediaToolConfig::default()
    }
}

fn pid_file(dir: &TempDir) -> PathBuf {
    dir.path().join("tool.pid")
}

/// Script that records its pid, then blocks far past any test deadline.
fn hanging_tool(dir: &TempDir) -> MediaToolConfig {
    fake_tool(
        dir,
        &format!("echo $$ > '{}'\nexec sleep 20", pid_file(dir).display()),
    )
}

async fn read_pid(path: &Path) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Ok(text) = std::fs::read_to_string(path) {
            if let Ok(pid) = text.trim().parse() {
                return pid;
            }
        }
        assert!(Instant::now() < deadline, "fake tool never wrote its pid");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_gone(pid: u32, limit: Duration) -> bool {
    let proc_entry = format!("/proc/{}", pid);
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if !Path::new(&proc_entry).exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    !Path::new(&proc_entry).exists()
}

#[tokio::test]
async fn test_resolve_reads_json_dump() {
    let dir = tempfile::tempdir().unwrap();
    let args_file = dir.path().join("args");
    let tool = fake_tool(
        &dir,
        &format!(
            "printf '%s\\n' \"$@\" > '{}'\ncat <<'JSON'\n{}\nJSON",
            args_file.display(),
            r#"{"id":"998","title":"Long Set","url":"https://cdn.example/998.mp3","protocol":"https","ext":"mp3","acodec":"mp3"}"#
        ),
    );

    let media = MediaToolResolver::new(&tool).resolve(SOURCE_URL).await.unwrap();
    assert_eq!(media.cdn_url, "https://cdn.example/998.mp3");
    assert_eq!(media.media_type, "audio/mpeg");

    let args: Vec<String> = std::fs::read_to_string(&args_file)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(args[0], "-J");
    assert!(args.iter().any(|a| a == "--no-playlist"));
    assert!(args.iter().any(|a| a == "--quiet"));
    assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == CDN_FORMAT_PREFERENCE));
    assert_eq!(args[args.len() - 2], "--");
    assert_eq!(args[args.len() - 1], SOURCE_URL);
}

#[tokio::test]
async fn test_resolve_prefers_progressive_format() {
    let dir = tempfile::tempdir().unwrap();
    let dump = r#"{"title":"Set","formats":[
        {"format_id":"hls","url":"https://cdn.example/set.m3u8","protocol":"m3u8_native","ext":"mp3","abr":256},
        {"format_id":"http_mp3","url":"https://cdn.example/set.mp3","protocol":"https","ext":"mp3","abr":128},
        {"format_id":"http_opus","url":"https://cdn.example/set.opus","protocol":"https","ext":"opus","abr":64}
    ]}"#;
    let tool = fake_tool(&dir, &format!("cat <<'JSON'\n{}\nJSON", dump));

    let media = MediaToolResolver::new(&tool).resolve(SOURCE_URL).await.unwrap();
    assert_eq!(media.cdn_url, "https://cdn.example/set.mp3");
    assert_eq!(media.media_type, "audio/mpeg");
}

#[tokio::test]
async fn test_resolve_nonzero_exit_is_resolution_error() {
    let dir = tempfile::tempdir().unwrap();
    let tool = fake_tool(&dir, "echo 'ERROR: track removed' >&2\nexit 1");

    let err = MediaToolResolver::new(&tool).resolve(SOURCE_URL).await.unwrap_err();
    match err {
        ProxyError::Resolution(msg) => assert!(msg.contains("track removed"), "{}", msg),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_resolve_invalid_json_is_resolution_error() {
    let dir = tempfile::tempdir().unwrap();
    let tool = fake_tool(&dir, "printf 'not json at all'");

    let err = MediaToolResolver::new(&tool).resolve(SOURCE_URL).await.unwrap_err();
    assert!(matches!(err, ProxyError::Resolution(_)), "{:?}", err);
}

#[tokio::test]
async fn test_resolve_manifest_only_is_resolution_error() {
    let dir = tempfile::tempdir().unwrap();
    let dump = r#"{"title":"Set","url":"https://cdn.example/set.m3u8","protocol":"m3u8_native","formats":[
        {"url":"https://cdn.example/set.m3u8","protocol":"m3u8_native","ext":"mp3"}
    ]}"#;
    let tool = fake_tool(&dir, &format!("cat <<'JSON'\n{}\nJSON", dump));

    let err = MediaToolResolver::new(&tool).resolve(SOURCE_URL).await.unwrap_err();
    assert!(matches!(err, ProxyError::Resolution(_)), "{:?}", err);
}

#[tokio::test]
async fn test_resolve_missing_tool_is_resolution_error() {
    let tool = MediaToolConfig {
        program: "/nonexistent/media-tool".to_string(),
        ..MediaToolConfig::default()
    };
    let err = MediaToolResolver::new(&tool).resolve(SOURCE_URL).await.unwrap_err();
    assert!(matches!(err, ProxyError::Resolution(_)), "{:?}", err);
}

#[tokio::test]
async fn test_resolve_timeout_kills_and_reaps_tool() {
    let dir = tempfile::tempdir().unwrap();
    let tool = hanging_tool(&dir);
    let resolver = MediaToolResolver::new(&tool).with_timeout(Duration::from_millis(300));

    let started = Instant::now();
    let err = resolver.resolve(SOURCE_URL).await.unwrap_err();
    assert!(matches!(err, ProxyError::Resolution(_)), "{:?}", err);
    assert!(started.elapsed() < Duration::from_secs(5));

    let pid = read_pid(&pid_file(&dir)).await;
    assert!(wait_gone(pid, Duration::from_secs(2)).await, "pid {} still present", pid);
}

#[tokio::test]
async fn test_dropped_resolution_kills_tool() {
    let dir = tempfile::tempdir().unwrap();
    let tool = hanging_tool(&dir);
    let resolver = MediaToolResolver::new(&tool);

    // The caller gives up long before the resolver's own deadline.
    let abandoned = tokio::time::timeout(Duration::from_millis(500), resolver.resolve(SOURCE_URL)).await;
    assert!(abandoned.is_err());

    let pid = read_pid(&pid_file(&dir)).await;
    assert!(
        wait_gone(pid, Duration::from_secs(2)).await,
        "resolution process {} outlived its request",
        pid
    );
}

#[tokio::test]
async fn test_curated_youtube_playlist_from_flat_dump() {
    let dir = tempfile::tempdir().unwrap();
    let args_file = dir.path().join("args");
    let dump = r#"{"id":"PLlist","title":"Live Sets","entries":[
        {"id":"aaa","title":"First"},
        null,
        {"id":"bbb","title":"Second"}
    ]}"#;
    let tool = fake_tool(
        &dir,
        &format!(
            "printf '%s\\n' \"$@\" > '{}'\ncat <<'JSON'\n{}\nJSON",
            args_file.display(),
            dump
        ),
    );
    let entry = CuratedEntry {
        url: "https://www.youtube.com/playlist?list=PLlist".to_string(),
        lat: 48.8566,
        lng: 2.3522,
        override_name: None,
        tags: Some("House".to_string()),
    };
    let source = CuratedSource::new(Platform::YouTube, vec![entry], &tool);

    let mut records = source.fetch_and_parse().await.unwrap();
    records.sort_by(|a, b| a.uuid.cmp(&b.uuid));
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].uuid, "yt-aaa");
    assert_eq!(records[0].name, "First");
    assert_eq!(records[0].url, "https://www.youtube.com/watch?v=aaa");
    assert_eq!(records[1].uuid, "yt-bbb");
    assert!(records.iter().all(|r| r.source == "youtube_curated"));
    assert!(records.iter().all(|r| (r.lat - 48.8566).abs() <= 0.05));

    let args = std::fs::read_to_string(&args_file).unwrap();
    assert!(args.lines().any(|a| a == "--flat-playlist"));
}

#[tokio::test]
async fn test_curated_skips_failing_entry() {
    let dir = tempfile::tempdir().unwrap();
    let tool = fake_tool(&dir, "exit 2");
    let entry = CuratedEntry {
        url: "https://soundcloud.com/artist/gone".to_string(),
        lat: 51.5,
        lng: -0.1,
        override_name: Some("Gone".to_string()),
        tags: None,
    };
    let source = CuratedSource::new(Platform::SoundCloud, vec![entry], &tool);

    let records = source.fetch_and_parse().await.unwrap();
    assert!(records.is_empty());
}

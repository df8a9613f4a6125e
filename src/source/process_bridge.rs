// External-process bridge: runs the media tool with its output on stdout and
// hands the blocking reads to the async response through a bounded queue.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::traits::{ByteStream, Delivery, DeliveryStrategy, StrategyKind};
use crate::config::{
    MediaToolConfig, BRIDGE_CONTENT_TYPE, BRIDGE_QUEUE_DEPTH, BRIDGE_READ_BYTES,
    BRIDGE_STDERR_TAIL_LINES,
};
use crate::error::ProxyError;

const REAP_POLL: Duration = Duration::from_millis(20);

/// Time a process may linger after closing stdout before it is killed.
const REAP_GRACE: Duration = Duration::from_secs(10);

/// Lowest-bandwidth track that carries both audio and video; live sources
/// of this kind offer no audio-only rendition.
const LIVE_FORMAT_SELECTOR: &str = "worst[acodec!=none][vcodec!=none]/worst";

/// Messages from the blocking worker to the response stream.
enum Handoff {
    Chunk(Bytes),
    /// Sent once the process has been reaped.
    Eof,
}

/// How a bridged process ended, as observed by its worker.
#[derive(Debug, Clone)]
pub struct BridgeOutcome {
    pub pid: u32,
    pub bytes: u64,
    pub exit_code: Option<i32>,
    pub cancelled: bool,
}

impl BridgeOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.bytes > 0
    }
}

#[derive(Debug, Clone)]
pub struct ProcessBridge {
    program: String,
    args: Vec<String>,
    queue_depth: usize,
    read_size: usize,
}

impl ProcessBridge {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            queue_depth: BRIDGE_QUEUE_DEPTH,
            read_size: BRIDGE_READ_BYTES,
        }
    }

    /// Media tool invocation for a live segmented source: smallest combined
    /// track, raw MPEG-TS on stdout, no progress noise.
    pub fn for_live_source(source_url: &str, tool: &MediaToolConfig) -> Self {
        let mut args: Vec<String> = [
            "-f",
            LIVE_FORMAT_SELECTOR,
            "-o",
            "-",
            "--quiet",
            "--no-warnings",
            "--no-progress",
            "--no-playlist",
            "--hls-use-mpegts",
            "--downloader",
            "m3u8:native",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(runtime) = tool.js_runtime.as_deref().filter(|r| !r.is_empty()) {
            args.push("--js-runtimes".to_string());
            args.push(runtime.to_string());
        }
        args.push("--".to_string());
        args.push(source_url.to_string());

        Self::new(tool.program.clone(), args).with_buffers(tool.queue_depth, tool.read_size)
    }

    pub fn with_buffers(mut self, queue_depth: usize, read_size: usize) -> Self {
        self.queue_depth = queue_depth.max(1);
        self.read_size = read_size.max(1);
        self
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Start the process and its worker. Fails only if the process cannot be spawned.
    pub fn spawn(&self) -> Result<BridgedProcess, ProxyError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProxyError::ProcessFailure(format!("spawn {}: {}", self.program, e)))?;

        let pid = child.id();
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProxyError::ProcessFailure("stdout not captured".to_string()));
        };
        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_reader(pid, stderr, Arc::clone(&stderr_tail));
        }
        info!("bridge process started pid={} program={}", pid, self.program);

        let child = Arc::new(Mutex::new(child));
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<Handoff>(self.queue_depth);

        let worker = {
            let child = Arc::clone(&child);
            let cancel = cancel.clone();
            let read_size = self.read_size;
            tokio::task::spawn_blocking(move || {
                pump(pid, stdout, tx, &child, &cancel, read_size, &stderr_tail)
            })
        };

        let mut guard = KillOnDrop {
            pid,
            child,
            cancel,
            armed: true,
        };

        let body: ByteStream = Box::pin(async_stream::stream! {
            let mut rx = rx;
            while let Some(message) = rx.recv().await {
                match message {
                    Handoff::Chunk(chunk) => {
                        yield chunk;
                    }
                    Handoff::Eof => break,
                }
            }
            // The worker has reaped the process by the time it finishes.
            match worker.await {
                Ok(outcome) => debug!("bridge worker joined: {:?}", outcome),
                Err(e) => warn!("bridge worker for pid={} panicked: {}", pid, e),
            }
            guard.disarm();
        });

        Ok(BridgedProcess { pid, body })
    }
}

#[async_trait]
impl DeliveryStrategy for ProcessBridge {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ExternalBridge
    }

    async fn open(&self) -> Result<Delivery, ProxyError> {
        let process = self.spawn()?;
        Ok(Delivery {
            content_type: BRIDGE_CONTENT_TYPE.to_string(),
            body: process.into_stream(),
        })
    }
}

/// A running bridged process and the stream that drains it.
pub struct BridgedProcess {
    pid: u32,
    body: ByteStream,
}

impl BridgedProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn into_stream(self) -> ByteStream {
        self.body
    }
}

/// Kills the process if the response stream is dropped before the worker
/// has reaped it.
struct KillOnDrop {
    pid: u32,
    child: Arc<Mutex<Child>>,
    cancel: CancellationToken,
    armed: bool,
}

impl KillOnDrop {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancel.cancel();
        info!("bridge stream cancelled, killing pid={}", self.pid);
        if let Err(e) = self.child.lock().kill() {
            debug!("kill pid={} failed: {}", self.pid, e);
        }
    }
}

/// Blocking read loop: stdout → bounded queue, then reap the process and
/// send the end sentinel.
fn pump(
    pid: u32,
    mut stdout: ChildStdout,
    tx: mpsc::Sender<Handoff>,
    child: &Mutex<Child>,
    cancel: &CancellationToken,
    read_size: usize,
    stderr_tail: &Mutex<VecDeque<String>>,
) -> BridgeOutcome {
    let mut buf = vec![0u8; read_size];
    let mut bytes = 0u64;

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match stdout.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                bytes += n as u64;
                if tx
                    .blocking_send(Handoff::Chunk(Bytes::copy_from_slice(&buf[..n])))
                    .is_err()
                {
                    cancel.cancel();
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("bridge stdout read pid={} failed: {}", pid, e);
                break;
            }
        }
    }
    drop(stdout);

    let status = reap(child, cancel);
    let outcome = BridgeOutcome {
        pid,
        bytes,
        exit_code: status.as_ref().ok().and_then(ExitStatus::code),
        cancelled: cancel.is_cancelled(),
    };

    if outcome.cancelled {
        info!("bridge pid={} stopped after {} bytes (consumer gone)", pid, bytes);
    } else if outcome.succeeded() {
        info!("bridge pid={} finished, {} bytes", pid, bytes);
    } else {
        let tail = stderr_tail.lock().iter().cloned().collect::<Vec<_>>().join("\n");
        match &status {
            Ok(status) => warn!(
                "bridge pid={} failed status={} bytes={} stderr:\n{}",
                pid, status, bytes, tail
            ),
            Err(e) => warn!("bridge pid={} wait failed: {} stderr:\n{}", pid, e, tail),
        }
    }

    // End sentinel; ignored if the consumer is already gone.
    let _ = tx.blocking_send(Handoff::Eof);
    outcome
}

/// Wait for the process without holding the lock across sleeps, killing it
/// when cancelled or when it outlives its stdout by `REAP_GRACE`.
fn reap(child: &Mutex<Child>, cancel: &CancellationToken) -> std::io::Result<ExitStatus> {
    let started = Instant::now();
    let mut killed = false;
    loop {
        if let Some(status) = child.lock().try_wait()? {
            return Ok(status);
        }
        if !killed && (cancel.is_cancelled() || started.elapsed() >= REAP_GRACE) {
            let _ = child.lock().kill();
            killed = true;
        }
        std::thread::sleep(REAP_POLL);
    }
}

fn spawn_stderr_reader(
    pid: u32,
    stderr: std::process::ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let spawned = std::thread::Builder::new()
        .name(format!("bridge-stderr-{}", pid))
        .spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(Result::ok) {
                debug!("bridge pid={} stderr: {}", pid, line);
                let mut tail = tail.lock();
                tail.push_back(line);
                if tail.len() > BRIDGE_STDERR_TAIL_LINES {
                    tail.pop_front();
                }
            }
        });
    if let Err(e) = spawned {
        warn!("stderr reader for pid={} not started: {}", pid, e);
    }
}

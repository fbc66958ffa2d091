//! Shared fixtures for queue integration tests
//!
//! A minimal range-capable HTTP server on a local port, plus a canned
//! resolver. The server records every request (path + Range header) and
//! tracks how many bodies are streaming at once so tests can assert the
//! concurrency bound from the outside.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use melodown::{
    DownloadConfig, MelodownError, Quality, ResolvedSource, ResourceResolver, Result, SaveMode,
};

// ============================================================================
// Fixture HTTP server
// ============================================================================

#[derive(Debug, Clone)]
pub struct RouteOptions {
    /// Honor Range requests with 206; otherwise always answer 200 full-body
    pub support_range: bool,
    /// Drop the connection once this absolute offset has been served
    pub fail_after: Option<u64>,
    /// Delay between body chunks (drip feed)
    pub chunk_delay: Duration,
    /// Non-200 value forces an error response with no body
    pub status: u16,
    pub content_type: &'static str,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            support_range: true,
            fail_after: None,
            chunk_delay: Duration::ZERO,
            status: 200,
            content_type: "audio/mpeg",
        }
    }
}

struct Route {
    body: Vec<u8>,
    options: RouteOptions,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub range: Option<String>,
}

#[derive(Default)]
struct ServerState {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<RecordedRequest>>,
    streaming_now: AtomicUsize,
    streaming_peak: AtomicUsize,
}

pub struct FixtureServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl FixtureServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::default());

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = handle_connection(stream, state).await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn add_route(&self, path: &str, body: Vec<u8>, options: RouteOptions) {
        self.state
            .routes
            .lock()
            .unwrap()
            .insert(path.to_string(), Route { body, options });
    }

    pub fn requests_for(&self, path: &str) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    /// Most bodies ever streaming at the same instant
    pub fn peak_concurrency(&self) -> usize {
        self.state.streaming_peak.load(Ordering::SeqCst)
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<ServerState>,
) -> std::io::Result<()> {
    // Read until the end of the request headers
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > 64 * 1024 {
            return Ok(());
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines = text.lines();
    let request_line = lines.next().unwrap_or("");
    let raw_path = request_line.split_whitespace().nth(1).unwrap_or("/");
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();

    let mut range = None;
    for line in lines {
        if line.is_empty() {
            break;
        }
        if line.to_ascii_lowercase().starts_with("range:") {
            if let Some((_, value)) = line.split_once(':') {
                range = Some(value.trim().to_string());
            }
        }
    }

    state.requests.lock().unwrap().push(RecordedRequest {
        path: path.clone(),
        range: range.clone(),
    });

    let route = {
        let routes = state.routes.lock().unwrap();
        routes
            .get(&path)
            .map(|r| (r.body.clone(), r.options.clone()))
    };

    let Some((body, options)) = route else {
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
            .await?;
        return Ok(());
    };

    if options.status != 200 {
        let head = format!(
            "HTTP/1.1 {} Fixture Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
            options.status
        );
        stream.write_all(head.as_bytes()).await?;
        return Ok(());
    }

    let total = body.len() as u64;
    let offset = match (&range, options.support_range) {
        (Some(value), true) => parse_range_start(value).unwrap_or(0).min(total),
        _ => 0,
    };
    let slice = &body[offset as usize..];

    let head = if offset > 0 {
        format!(
            "HTTP/1.1 206 Partial Content\r\ncontent-type: {}\r\ncontent-length: {}\r\ncontent-range: bytes {}-{}/{}\r\nconnection: close\r\n\r\n",
            options.content_type,
            slice.len(),
            offset,
            total.saturating_sub(1),
            total
        )
    } else {
        format!(
            "HTTP/1.1 200 OK\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            options.content_type,
            slice.len()
        )
    };

    let now = state.streaming_now.fetch_add(1, Ordering::SeqCst) + 1;
    state.streaming_peak.fetch_max(now, Ordering::SeqCst);

    let result = stream_body(&mut stream, head.as_bytes(), slice, &options, offset).await;

    state.streaming_now.fetch_sub(1, Ordering::SeqCst);
    result
}

async fn stream_body(
    stream: &mut TcpStream,
    head: &[u8],
    slice: &[u8],
    options: &RouteOptions,
    base_offset: u64,
) -> std::io::Result<()> {
    stream.write_all(head).await?;

    const CHUNK: usize = 8 * 1024;
    let mut served = base_offset;
    for chunk in slice.chunks(CHUNK) {
        if let Some(limit) = options.fail_after {
            if served >= limit {
                // Drop the connection mid-body; the client sees a premature EOF
                return Ok(());
            }
        }
        stream.write_all(chunk).await?;
        stream.flush().await?;
        served += chunk.len() as u64;
        if options.chunk_delay > Duration::ZERO {
            tokio::time::sleep(options.chunk_delay).await;
        }
    }
    Ok(())
}

/// Parse the start offset out of `bytes=N-`
fn parse_range_start(value: &str) -> Option<u64> {
    value
        .trim()
        .strip_prefix("bytes=")?
        .split('-')
        .next()?
        .parse()
        .ok()
}

// ============================================================================
// Canned resolver
// ============================================================================

#[derive(Debug, Clone)]
pub struct StaticEntry {
    pub url: String,
    pub quality: Quality,
    pub size: u64,
    pub downgraded: bool,
}

/// Resolver answering from a fixed table, no network involved
#[derive(Default)]
pub struct StaticResolver {
    entries: Mutex<HashMap<String, StaticEntry>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, resource_id: &str, entry: StaticEntry) {
        self.entries
            .lock()
            .unwrap()
            .insert(resource_id.to_string(), entry);
    }
}

#[async_trait]
impl ResourceResolver for StaticResolver {
    async fn resolve(&self, resource_id: &str, _quality: Quality) -> Result<ResolvedSource> {
        let entries = self.entries.lock().unwrap();
        match entries.get(resource_id) {
            Some(entry) => Ok(ResolvedSource {
                url: entry.url.clone(),
                actual_quality: entry.quality,
                total_bytes: entry.size,
                downgraded: entry.downgraded,
            }),
            None => Err(MelodownError::ResourceUnavailable {
                message: format!("unknown resource {resource_id}"),
            }),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Deterministic payload starting with an ID3 magic so sniffing lands on mp3
pub fn mp3_body(len: usize) -> Vec<u8> {
    let mut body = Vec::with_capacity(len);
    body.extend_from_slice(b"ID3\x04\x00\x00\x00\x00\x00\x00");
    while body.len() < len {
        body.push((body.len() % 251) as u8);
    }
    body.truncate(len);
    body
}

/// Queue configuration tuned for fast tests
pub fn test_config(root: &Path) -> DownloadConfig {
    DownloadConfig {
        max_concurrent: 2,
        staging_directory: root.join("staging"),
        music_directory: root.join("music"),
        save_mode: SaveMode::Silent,
        progress_interval: Duration::from_millis(25),
        progress_byte_quantum: 16 * 1024,
        standard_inactivity_timeout: Duration::from_secs(5),
        lossless_inactivity_timeout: Duration::from_secs(8),
        load_sample_interval: Duration::from_millis(100),
        resolve_retries: 1,
        resolve_retry_delay: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Poll until `condition` holds, panicking after `timeout`
pub async fn wait_until<F>(what: &str, timeout: Duration, condition: F)
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

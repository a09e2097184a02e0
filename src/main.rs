use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Local};
use clap::{ArgAction, Parser, ValueEnum};
use comfy_table::{presets::ASCII_MARKDOWN, Cell, Color, Table};
use futures::StreamExt;
use rand::RngCore;
use reqwest::Client as HttpClient;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const DEFAULT_SERVER_LIST_URL: &str = "https://www.speedtest.net/speedtest-servers-static.php";
const DEFAULT_DOWNLOAD_WORKERS: usize = 200;
const DEFAULT_UPLOAD_WORKERS: usize = 200;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF: f64 = 2.0;
const DEFAULT_MEASURE_INTERVAL_SECS: u64 = 10;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_UPLOAD_SIZE_MB: usize = 10;

const UPLOAD_ACCEPTED: [u16; 3] = [200, 201, 204];
const UNKNOWN_PEER: &str = "unknown";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const CSV_HEADER: [&str; 10] = [
    "Timestamp",
    "Type",
    "URL",
    "Server IP",
    "Location",
    "Total Data (MB)",
    "Latency (s)",
    "Elapsed Time (s)",
    "Average Speed (Mbps)",
    "Error Message",
];

#[derive(Parser, Debug)]
#[command(name = "netsoak")]
#[command(about = "Sustained concurrent download/upload throughput benchmark")]
struct Cli {
    /// Path to config file (TOML). If omitted, reads ./netsoak.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Ignore any config file
    #[arg(long, default_value_t = false)]
    no_config: bool,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// Server directory URL (speed-test server list XML)
    #[arg(long)]
    server_list_url: Option<String>,

    /// Fixed target URL; repeat to supply several. Skips the directory fetch.
    #[arg(long, action = ArgAction::Append)]
    url: Option<Vec<String>>,

    /// download, upload, or both
    #[arg(long, value_enum)]
    direction: Option<DirectionArg>,

    /// Concurrent download workers
    #[arg(long)]
    download_workers: Option<usize>,

    /// Concurrent upload workers
    #[arg(long)]
    upload_workers: Option<usize>,

    /// Attempts per transfer before recording a failure
    #[arg(long)]
    max_retries: Option<u32>,

    /// Backoff base; the n-th failed attempt sleeps base^n seconds
    #[arg(long)]
    retry_backoff: Option<f64>,

    /// Seconds between throughput samples
    #[arg(long)]
    measure_interval: Option<u64>,

    /// Per-request timeout in seconds
    #[arg(long)]
    request_timeout: Option<u64>,

    /// Upload payload size (MB)
    #[arg(long)]
    upload_size_mb: Option<usize>,

    /// Output format for the end-of-run summary
    #[arg(long, value_enum)]
    output: Option<OutputArg>,

    /// Disable ANSI colors in the summary table
    #[arg(long, default_value_t = false)]
    no_color: bool,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            server_list_url: None,
            url: None,
            direction: None,
            download_workers: None,
            upload_workers: None,
            max_retries: None,
            retry_backoff: None,
            measure_interval: None,
            request_timeout: None,
            upload_size_mb: None,
            output: None,
            no_color: false,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DirectionArg {
    Download,
    Upload,
    Both,
}

impl DirectionArg {
    fn wants_download(self) -> bool {
        matches!(self, DirectionArg::Download | DirectionArg::Both)
    }

    fn wants_upload(self) -> bool {
        matches!(self, DirectionArg::Upload | DirectionArg::Both)
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum OutputArg {
    Human,
    Json,
}

/// Serialized into the CSV "Type" column, so the variant names are the
/// record values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
enum Direction {
    Download,
    Upload,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::Download => "download",
            Direction::Upload => "upload",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
    server_list_url: Option<String>,
    urls: Option<Vec<String>>,
    direction: Option<DirectionArg>,
    download_workers: Option<usize>,
    upload_workers: Option<usize>,
    max_retries: Option<u32>,
    retry_backoff: Option<f64>,
    measure_interval: Option<u64>,
    request_timeout: Option<u64>,
    upload_size_mb: Option<usize>,
    output: Option<OutputArg>,
    no_color: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
struct RunConfig {
    server_list_url: String,
    urls: Vec<String>,
    direction: DirectionArg,
    download_workers: usize,
    upload_workers: usize,
    max_retries: u32,
    retry_backoff: f64,
    measure_interval_secs: u64,
    request_timeout_secs: u64,
    upload_size_mb: usize,
    output: OutputArg,
    no_color: bool,
}

fn default_config_path() -> PathBuf {
    PathBuf::from("netsoak.toml")
}

fn load_file_config(path: &Path, required: bool) -> Result<Option<FileConfig>> {
    if !path.exists() {
        if required {
            return Err(anyhow!("config file not found: {}", path.display()));
        }
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    let cfg: FileConfig =
        toml::from_str(&raw).with_context(|| format!("parse config file {}", path.display()))?;
    Ok(Some(cfg))
}

fn merge_config(args: RunArgs, file: Option<FileConfig>) -> RunConfig {
    let file = file.unwrap_or_default();

    let urls = match args.url {
        Some(list) if !list.is_empty() => list,
        _ => file.urls.unwrap_or_default(),
    };

    // The fixed-URL mode defaults to download-only; the directory mode
    // exercises both directions.
    let direction = args.direction.or(file.direction).unwrap_or(if urls.is_empty() {
        DirectionArg::Both
    } else {
        DirectionArg::Download
    });

    RunConfig {
        server_list_url: args
            .server_list_url
            .or(file.server_list_url)
            .unwrap_or_else(|| DEFAULT_SERVER_LIST_URL.to_string()),
        urls,
        direction,
        download_workers: args
            .download_workers
            .or(file.download_workers)
            .unwrap_or(DEFAULT_DOWNLOAD_WORKERS),
        upload_workers: args
            .upload_workers
            .or(file.upload_workers)
            .unwrap_or(DEFAULT_UPLOAD_WORKERS),
        max_retries: args.max_retries.or(file.max_retries).unwrap_or(DEFAULT_MAX_RETRIES),
        retry_backoff: args
            .retry_backoff
            .or(file.retry_backoff)
            .unwrap_or(DEFAULT_RETRY_BACKOFF),
        measure_interval_secs: args
            .measure_interval
            .or(file.measure_interval)
            .unwrap_or(DEFAULT_MEASURE_INTERVAL_SECS),
        request_timeout_secs: args
            .request_timeout
            .or(file.request_timeout)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        upload_size_mb: args
            .upload_size_mb
            .or(file.upload_size_mb)
            .unwrap_or(DEFAULT_UPLOAD_SIZE_MB),
        output: args.output.or(file.output).unwrap_or(OutputArg::Human),
        no_color: args.no_color || file.no_color.unwrap_or(false),
    }
}

fn validate_config(cfg: &RunConfig) -> Result<()> {
    if cfg.direction.wants_download() && cfg.download_workers == 0 {
        bail!("download_workers must be >= 1 when downloads are enabled");
    }
    if cfg.direction.wants_upload() && cfg.upload_workers == 0 {
        bail!("upload_workers must be >= 1 when uploads are enabled");
    }
    if cfg.direction.wants_upload() && cfg.upload_size_mb == 0 {
        bail!("upload_size_mb must be >= 1 when uploads are enabled");
    }
    if cfg.max_retries == 0 {
        bail!("max_retries must be >= 1");
    }
    if cfg.retry_backoff < 0.0 {
        bail!("retry_backoff must not be negative");
    }
    if cfg.measure_interval_secs == 0 {
        bail!("measure_interval must be >= 1 second");
    }
    if cfg.request_timeout_secs == 0 {
        bail!("request_timeout must be >= 1 second");
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ServerEntry {
    url: String,
    location: String,
}

/// Pulls one double-quoted attribute value out of an element tag. Matches on
/// a word boundary so `purl="..."` is not mistaken for `url="..."`.
fn xml_attr<'a>(element: &'a str, name: &str) -> Option<&'a str> {
    let mut search = 0;
    while let Some(pos) = element[search..].find(name) {
        let at = search + pos;
        let boundary = at == 0 || element.as_bytes()[at - 1].is_ascii_whitespace();
        let after = at + name.len();
        if boundary && element[after..].starts_with("=\"") {
            let value = &element[after + 2..];
            return value.find('"').map(|end| &value[..end]);
        }
        search = after;
    }
    None
}

/// Scans the server directory document for `<server ...>` elements and keeps
/// those carrying both a `url` and a `country` attribute, in document order.
fn parse_server_directory(body: &str) -> Vec<ServerEntry> {
    let mut entries = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find("<server ") {
        let element = &rest[start..];
        let Some(end) = element.find('>') else {
            break;
        };
        let tag = &element[..end];
        if let (Some(url), Some(location)) = (xml_attr(tag, "url"), xml_attr(tag, "country")) {
            if !url.is_empty() && !location.is_empty() {
                entries.push(ServerEntry {
                    url: url.replace("&amp;", "&"),
                    location: location.replace("&amp;", "&"),
                });
            }
        }
        rest = &element[end..];
    }
    entries
}

async fn fetch_server_directory(client: &HttpClient, url: &str) -> Result<Vec<ServerEntry>> {
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("fetch server directory from {}", url))?;
    let status = resp.status();
    if !status.is_success() {
        bail!("server directory request failed (HTTP {})", status.as_u16());
    }
    let body = resp.text().await.context("read server directory body")?;
    Ok(parse_server_directory(&body))
}

fn fixed_directory(urls: &[String]) -> Vec<ServerEntry> {
    urls.iter()
        .map(|u| ServerEntry {
            url: u.clone(),
            location: "static".to_string(),
        })
        .collect()
}

fn url_host(url: &str) -> String {
    let u = url.trim();
    let u = u
        .strip_prefix("https://")
        .or_else(|| u.strip_prefix("http://"))
        .unwrap_or(u);
    u.split('/').next().unwrap_or(u).to_string()
}

/// The test endpoints expose the upload handler at the download URL with the
/// path token swapped; this is a convention of those endpoints, not a general
/// URL rule.
fn upload_url(download_url: &str) -> String {
    download_url.replace("download", "upload")
}

/// Best-effort hostname resolution for the "Server IP" column. Failure never
/// affects the transfer itself.
async fn resolve_peer_addr(url: &str) -> String {
    let host = url_host(url);
    if host.is_empty() {
        return UNKNOWN_PEER.to_string();
    }
    let default_port = if url.trim_start().starts_with("https://") { 443 } else { 80 };
    let (name, port) = match host.rsplit_once(':') {
        Some((h, p)) if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) => {
            (h.to_string(), p.parse::<u16>().unwrap_or(default_port))
        }
        _ => (host.clone(), default_port),
    };
    let resolved = match tokio::net::lookup_host((name.as_str(), port)).await {
        Ok(mut addrs) => addrs
            .next()
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_PEER.to_string()),
        Err(_) => UNKNOWN_PEER.to_string(),
    };
    resolved
}

fn mbps(bytes: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs > 0.0 {
        (bytes as f64 * 8.0) / (elapsed_secs * 1_000_000.0)
    } else {
        0.0
    }
}

/// Shared run state handed to every task: the two byte counters, the result
/// log, and the cancellation latch. The counters and the log are the only
/// cross-task mutations in the process; neither critical section spans I/O.
struct Shared {
    bytes_down: AtomicU64,
    bytes_up: AtomicU64,
    results: Mutex<Vec<TransferResult>>,
    cancel: CancellationToken,
}

impl Shared {
    fn new(cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            bytes_down: AtomicU64::new(0),
            bytes_up: AtomicU64::new(0),
            results: Mutex::new(Vec::new()),
            cancel,
        })
    }

    fn add_bytes(&self, direction: Direction, n: u64) {
        match direction {
            Direction::Download => self.bytes_down.fetch_add(n, Ordering::Relaxed),
            Direction::Upload => self.bytes_up.fetch_add(n, Ordering::Relaxed),
        };
    }

    fn snapshot(&self) -> (u64, u64) {
        (
            self.bytes_down.load(Ordering::Relaxed),
            self.bytes_up.load(Ordering::Relaxed),
        )
    }

    fn append_result(&self, result: TransferResult) {
        if let Ok(mut log) = self.results.lock() {
            log.push(result);
        }
    }

    fn take_results(&self) -> Vec<TransferResult> {
        self.results
            .lock()
            .map(|mut log| std::mem::take(&mut *log))
            .unwrap_or_default()
    }
}

/// One row of the output file. Field order matches CSV_HEADER; rows are
/// appended once per completed attempt and never mutated afterwards.
#[derive(Debug, Clone, Serialize)]
struct TransferResult {
    timestamp: String,
    direction: Direction,
    url: String,
    peer_addr: String,
    location: String,
    total_mb: f64,
    latency_secs: Option<f64>,
    elapsed_secs: f64,
    avg_speed_mbps: f64,
    error: String,
}

/// Per-invocation retry machine: Attempting -> Succeeded, or Attempting ->
/// (backoff) -> Attempting until max_retries failures accumulate, then
/// Exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryState {
    Attempting { attempt: u32 },
    Succeeded,
    Exhausted,
}

impl RetryState {
    fn start() -> Self {
        RetryState::Attempting { attempt: 0 }
    }

    fn attempt_number(self) -> u32 {
        match self {
            RetryState::Attempting { attempt } => attempt + 1,
            _ => 0,
        }
    }

    /// Transition after a recoverable failure. Returns the next state and,
    /// when another attempt remains, the backoff to sleep before it.
    fn fail(self, max_retries: u32, backoff_base: f64) -> (Self, Option<Duration>) {
        match self {
            RetryState::Attempting { attempt } => {
                let failures = attempt + 1;
                if failures < max_retries {
                    let delay = Duration::from_secs_f64(backoff_base.powi(failures as i32));
                    (RetryState::Attempting { attempt: failures }, Some(delay))
                } else {
                    (RetryState::Exhausted, None)
                }
            }
            terminal => (terminal, None),
        }
    }
}

/// One logical download: bounded retries around a streaming GET, then exactly
/// one appended result whatever the exit path was.
async fn run_download(client: &HttpClient, server: &ServerEntry, shared: &Shared, cfg: &RunConfig) {
    let started = Instant::now();
    let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
    let peer_addr = resolve_peer_addr(&server.url).await;

    println!("[download] starting {}", server.url);

    let mut state = RetryState::start();
    let mut latency_secs: Option<f64> = None;
    let mut moved: u64 = 0;
    let mut error = String::new();

    while matches!(state, RetryState::Attempting { .. }) && !shared.cancel.is_cancelled() {
        let dispatched = Instant::now();
        let sent = client
            .get(&server.url)
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .send()
            .await;

        let fault = match sent {
            Ok(resp) => {
                latency_secs = Some(dispatched.elapsed().as_secs_f64());
                if resp.status() != StatusCode::OK {
                    Some(format!("HTTP status {}", resp.status().as_u16()))
                } else {
                    let mut stream = resp.bytes_stream();
                    let mut stream_fault = None;
                    while !shared.cancel.is_cancelled() {
                        match stream.next().await {
                            Some(Ok(chunk)) => {
                                let n = chunk.len() as u64;
                                shared.add_bytes(Direction::Download, n);
                                moved += n;
                            }
                            Some(Err(e)) => {
                                stream_fault = Some(e.to_string());
                                break;
                            }
                            None => break,
                        }
                    }
                    stream_fault
                }
            }
            Err(e) => Some(e.to_string()),
        };

        match fault {
            None => {
                state = RetryState::Succeeded;
                error.clear();
            }
            Some(message) => {
                // Faults observed while winding down are not new failures.
                if shared.cancel.is_cancelled() {
                    break;
                }
                eprintln!(
                    "[download] {} attempt {} failed: {}",
                    server.url,
                    state.attempt_number(),
                    message
                );
                error = message;
                let (next, delay) = state.fail(cfg.max_retries, cfg.retry_backoff);
                state = next;
                if let Some(delay) = delay {
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shared.cancel.cancelled() => {}
                    }
                }
            }
        }
    }

    let elapsed_secs = started.elapsed().as_secs_f64();
    let speed = mbps(moved, elapsed_secs);
    match state {
        RetryState::Succeeded => println!(
            "[download] {} done: {:.2} MB in {:.1}s ({:.2} Mbps)",
            server.url,
            moved as f64 / (1024.0 * 1024.0),
            elapsed_secs,
            speed
        ),
        RetryState::Exhausted => eprintln!(
            "[download] {} giving up after {} attempts: {}",
            server.url, cfg.max_retries, error
        ),
        RetryState::Attempting { .. } => {}
    }

    shared.append_result(TransferResult {
        timestamp,
        direction: Direction::Download,
        url: server.url.clone(),
        peer_addr,
        location: server.location.clone(),
        total_mb: moved as f64 / (1024.0 * 1024.0),
        latency_secs,
        elapsed_secs,
        avg_speed_mbps: speed,
        error,
    });
}

/// One logical upload: bounded retries around a single-call POST of a random
/// payload. Bytes count toward the shared counter only on an accepted status.
/// The in-flight call is never aborted by shutdown.
async fn run_upload(client: &HttpClient, server: &ServerEntry, shared: &Shared, cfg: &RunConfig) {
    let started = Instant::now();
    let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
    let target = upload_url(&server.url);
    let peer_addr = resolve_peer_addr(&target).await;
    let payload_len = (cfg.upload_size_mb * 1024 * 1024) as u64;

    println!("[upload] starting {}", target);

    let mut state = RetryState::start();
    let mut latency_secs: Option<f64> = None;
    let mut moved: u64 = 0;
    let mut error = String::new();

    while matches!(state, RetryState::Attempting { .. }) && !shared.cancel.is_cancelled() {
        let mut payload = vec![0u8; payload_len as usize];
        rand::rng().fill_bytes(&mut payload);

        let dispatched = Instant::now();
        let sent = client
            .post(&target)
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .body(Bytes::from(payload))
            .send()
            .await;

        let fault = match sent {
            Ok(resp) => {
                latency_secs = Some(dispatched.elapsed().as_secs_f64());
                if UPLOAD_ACCEPTED.contains(&resp.status().as_u16()) {
                    shared.add_bytes(Direction::Upload, payload_len);
                    moved = payload_len;
                    None
                } else {
                    Some(format!("HTTP status {}", resp.status().as_u16()))
                }
            }
            Err(e) => Some(e.to_string()),
        };

        match fault {
            None => {
                state = RetryState::Succeeded;
                error.clear();
            }
            Some(message) => {
                if shared.cancel.is_cancelled() {
                    break;
                }
                eprintln!(
                    "[upload] {} attempt {} failed: {}",
                    target,
                    state.attempt_number(),
                    message
                );
                error = message;
                let (next, delay) = state.fail(cfg.max_retries, cfg.retry_backoff);
                state = next;
                if let Some(delay) = delay {
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shared.cancel.cancelled() => {}
                    }
                }
            }
        }
    }

    let elapsed_secs = started.elapsed().as_secs_f64();
    let speed = mbps(moved, elapsed_secs);
    match state {
        RetryState::Succeeded => println!(
            "[upload] {} done: {:.2} MB in {:.1}s ({:.2} Mbps)",
            target,
            moved as f64 / (1024.0 * 1024.0),
            elapsed_secs,
            speed
        ),
        RetryState::Exhausted => eprintln!(
            "[upload] {} giving up after {} attempts: {}",
            target, cfg.max_retries, error
        ),
        RetryState::Attempting { .. } => {}
    }

    shared.append_result(TransferResult {
        timestamp,
        direction: Direction::Upload,
        url: target,
        peer_addr,
        location: server.location.clone(),
        total_mb: moved as f64 / (1024.0 * 1024.0),
        latency_secs,
        elapsed_secs,
        avg_speed_mbps: speed,
        error,
    });
}

/// Long-lived worker bound to one direction: round-robin over the directory,
/// one executor invocation at a time, until the token fires. The cursor is
/// shared across the pool so the pool as a whole cycles the directory.
async fn transfer_worker(
    client: HttpClient,
    direction: Direction,
    directory: Arc<Vec<ServerEntry>>,
    cursor: Arc<AtomicUsize>,
    shared: Arc<Shared>,
    cfg: Arc<RunConfig>,
) {
    while !shared.cancel.is_cancelled() {
        let i = cursor.fetch_add(1, Ordering::Relaxed) % directory.len();
        let server = &directory[i];
        match direction {
            Direction::Download => run_download(&client, server, &shared, &cfg).await,
            Direction::Upload => run_upload(&client, server, &shared, &cfg).await,
        }
    }
}

/// Sampling reporter: snapshots the counters around a fixed wall-clock window
/// and emits one Mbps line per direction. A worker increment may land on
/// either side of a snapshot; the window is wall-clock, so ramp-up and
/// shutdown transients show up as-is.
async fn rate_reporter(shared: Arc<Shared>, interval_secs: u64) {
    let interval = Duration::from_secs(interval_secs);
    while !shared.cancel.is_cancelled() {
        let (down_start, up_start) = shared.snapshot();
        let window = Instant::now();
        tokio::select! {
            _ = sleep(interval) => {}
            _ = shared.cancel.cancelled() => break,
        }
        let (down_end, up_end) = shared.snapshot();
        let elapsed = window.elapsed().as_secs_f64();
        println!(
            "Average download speed over the last {}s: {:.2} Mbps",
            interval_secs,
            mbps(down_end.saturating_sub(down_start), elapsed)
        );
        println!(
            "Average upload speed over the last {}s: {:.2} Mbps",
            interval_secs,
            mbps(up_end.saturating_sub(up_start), elapsed)
        );
    }
}

fn flush_results(results: &[TransferResult], path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("create results file {}", path.display()))?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    writer.write_record(CSV_HEADER).context("write results header")?;
    for result in results {
        writer.serialize(result).context("write result row")?;
    }
    writer.flush().context("flush results file")?;
    Ok(())
}

fn p50(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    values[(values.len() - 1) / 2]
}

fn p90(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    let idx = (((n as f64) * 0.90).ceil() as usize).saturating_sub(1);
    values[idx.min(n - 1)]
}

fn fmt_rate(ok: u64, attempts: u64) -> String {
    if attempts == 0 {
        return "0.0%".to_string();
    }
    format!("{:.1}%", (ok as f64) * 100.0 / (attempts as f64))
}

#[derive(Debug, Clone, Serialize)]
struct DirectionSummary {
    direction: Direction,
    attempts: u64,
    ok: u64,
    total_mb: f64,
    mbps_mean: f64,
    mbps_p50: f64,
    mbps_p90: f64,
}

#[derive(Debug, Clone, Serialize)]
struct RunSummary {
    started: String,
    elapsed_secs: f64,
    results_file: String,
    config: RunConfig,
    directions: Vec<DirectionSummary>,
}

fn summarize(
    results: &[TransferResult],
    started: &DateTime<Local>,
    elapsed_secs: f64,
    results_file: &str,
    cfg: &RunConfig,
) -> RunSummary {
    let mut directions = Vec::new();
    for dir in [Direction::Download, Direction::Upload] {
        let rows: Vec<&TransferResult> = results.iter().filter(|r| r.direction == dir).collect();
        if rows.is_empty() {
            continue;
        }
        let attempts = rows.len() as u64;
        let ok = rows.iter().filter(|r| r.error.is_empty()).count() as u64;
        let total_mb: f64 = rows.iter().map(|r| r.total_mb).sum();
        let mut speeds: Vec<f64> = rows.iter().map(|r| r.avg_speed_mbps).collect();
        let mean = speeds.iter().sum::<f64>() / speeds.len() as f64;
        let med = p50(&mut speeds);
        let p90v = p90(&mut speeds);
        directions.push(DirectionSummary {
            direction: dir,
            attempts,
            ok,
            total_mb,
            mbps_mean: mean,
            mbps_p50: med,
            mbps_p90: p90v,
        });
    }
    RunSummary {
        started: started.format(TIMESTAMP_FORMAT).to_string(),
        elapsed_secs,
        results_file: results_file.to_string(),
        config: cfg.clone(),
        directions,
    }
}

fn print_summary(summary: &RunSummary, no_color: bool) {
    let use_color = !no_color && std::io::stdout().is_terminal();

    let mut table = Table::new();
    table.load_preset(ASCII_MARKDOWN).set_header([
        "direction",
        "attempts",
        "ok%",
        "MB moved",
        "Mbps(mean/p50/p90)",
    ]);

    for d in &summary.directions {
        let rate = fmt_rate(d.ok, d.attempts);
        let mut ok_cell = Cell::new(rate);
        if use_color {
            let pct = (d.ok as f64) * 100.0 / (d.attempts.max(1) as f64);
            ok_cell = if pct >= 99.0 {
                ok_cell.fg(Color::Green)
            } else if pct >= 90.0 {
                ok_cell.fg(Color::Yellow)
            } else {
                ok_cell.fg(Color::Red)
            };
        }
        table.add_row(vec![
            Cell::new(d.direction.label()),
            Cell::new(d.attempts.to_string()),
            ok_cell,
            Cell::new(format!("{:.2}", d.total_mb)),
            Cell::new(format!("{:.2}/{:.2}/{:.2}", d.mbps_mean, d.mbps_p50, d.mbps_p90)),
        ]);
    }

    println!("\nRun started {} ({:.0}s elapsed)", summary.started, summary.elapsed_secs);
    println!("{}", table);
}

fn build_client(cfg: &RunConfig) -> Result<HttpClient> {
    HttpClient::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(cfg.download_workers + cfg.upload_workers)
        .tcp_nodelay(true)
        .build()
        .context("build http client")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file_cfg = if cli.no_config {
        None
    } else {
        let path = cli.config.clone().unwrap_or_else(default_config_path);
        let required = cli.config.is_some();
        load_file_config(&path, required)?
    };

    let cfg = merge_config(cli.run, file_cfg);
    validate_config(&cfg)?;

    let run_started = Local::now();
    let run_clock = Instant::now();
    let client = build_client(&cfg)?;

    let directory = if cfg.urls.is_empty() {
        println!("Fetching server directory from {}", cfg.server_list_url);
        fetch_server_directory(&client, &cfg.server_list_url).await?
    } else {
        fixed_directory(&cfg.urls)
    };
    if directory.is_empty() {
        bail!("server directory is empty; nothing to test against");
    }
    let locations: HashSet<&str> = directory.iter().map(|s| s.location.as_str()).collect();
    println!("Loaded {} servers across {} locations.", directory.len(), locations.len());

    let directory = Arc::new(directory);
    let cancel = CancellationToken::new();
    let shared = Shared::new(cancel.clone());
    let cfg = Arc::new(cfg);

    // Flipping the latch is idempotent, so repeated interrupts while workers
    // drain cannot double-trigger the shutdown path.
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if signal_cancel.is_cancelled() {
                eprintln!("Still draining in-flight transfers...");
            } else {
                println!("\nInterrupt received. Stopping all transfers...");
            }
            signal_cancel.cancel();
        }
    });

    println!(
        "Starting continuous concurrent transfers ({} download / {} upload workers). Press Ctrl-C to stop.",
        if cfg.direction.wants_download() { cfg.download_workers } else { 0 },
        if cfg.direction.wants_upload() { cfg.upload_workers } else { 0 },
    );

    let reporter = tokio::spawn(rate_reporter(shared.clone(), cfg.measure_interval_secs));

    let mut handles = Vec::new();
    if cfg.direction.wants_download() {
        let cursor = Arc::new(AtomicUsize::new(0));
        for _ in 0..cfg.download_workers {
            handles.push(tokio::spawn(transfer_worker(
                client.clone(),
                Direction::Download,
                directory.clone(),
                cursor.clone(),
                shared.clone(),
                cfg.clone(),
            )));
        }
    }
    if cfg.direction.wants_upload() {
        let cursor = Arc::new(AtomicUsize::new(0));
        for _ in 0..cfg.upload_workers {
            handles.push(tokio::spawn(transfer_worker(
                client.clone(),
                Direction::Upload,
                directory.clone(),
                cursor.clone(),
                shared.clone(),
                cfg.clone(),
            )));
        }
    }

    for handle in handles {
        let _ = handle.await;
    }
    let _ = reporter.await;

    // All writers are joined; the log is read exactly once from here on.
    let results = shared.take_results();
    let results_file = run_started.format("results_%Y%m%d_%H%M%S.csv").to_string();
    flush_results(&results, Path::new(&results_file))?;
    println!("Results saved to {}", results_file);

    let summary = summarize(
        &results,
        &run_started,
        run_clock.elapsed().as_secs_f64(),
        &results_file,
        &cfg,
    );
    match cfg.output {
        OutputArg::Human => print_summary(&summary, cfg.no_color),
        OutputArg::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
    }

    Ok(())
}

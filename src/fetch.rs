//! HTTP utility: plain requests, chunk-streaming POST, and resumable file
//! downloads with retry/backoff.
//!
//! Downloads write to `{path}.partial` and rename into place only on
//! success, so an interrupted transfer can resume with an HTTP Range
//! request on the next attempt and a crash never leaves a truncated file
//! at the final path.

use crate::error::{GatewayError, Result};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("lemonade/", env!("CARGO_PKG_VERSION"));

/// Shared HTTP client. Connection pooling matters for readiness probing,
/// which hits the same loopback port once per second.
pub fn client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default()
    })
}

/// A buffered HTTP response.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    /// Parse the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Backend`] when the body is not valid JSON.
    pub fn json(&self) -> Result<serde_json::Value> {
        serde_json::from_str(&self.body).map_err(|e| GatewayError::Backend {
            backend: "upstream".to_owned(),
            message: format!("invalid JSON response: {e}"),
            status: Some(self.status),
        })
    }
}

/// GET a URL, following redirects, with optional extra headers.
///
/// # Errors
///
/// Returns [`GatewayError::Network`] on connect/read failure.
pub async fn get(url: &str, headers: &[(String, String)], timeout: Duration) -> Result<HttpResponse> {
    let mut req = client().get(url).timeout(timeout);
    for (name, value) in headers {
        req = req.header(name, value);
    }
    let resp = req.send().await?;
    let status = resp.status().as_u16();
    let body = resp.text().await?;
    Ok(HttpResponse { status, body })
}

/// POST a JSON body, returning the buffered response.
///
/// # Errors
///
/// Returns [`GatewayError::Network`] on connect/read failure.
pub async fn post_json(
    url: &str,
    body: &serde_json::Value,
    headers: &[(String, String)],
    timeout: Duration,
) -> Result<HttpResponse> {
    let mut req = client().post(url).json(body).timeout(timeout);
    for (name, value) in headers {
        req = req.header(name, value);
    }
    let resp = req.send().await?;
    let status = resp.status().as_u16();
    let body = resp.text().await?;
    Ok(HttpResponse { status, body })
}

/// POST a JSON body and stream the response through `on_chunk`.
///
/// The callback returning `false` aborts the transfer (client went away);
/// this is not an error. Read errors after the first byte are normal for
/// SSE backends that close the connection after `[DONE]`, so they end the
/// stream instead of failing it.
///
/// # Errors
///
/// Returns [`GatewayError::Network`] when the request cannot be sent at
/// all.
pub async fn post_stream<F>(
    url: &str,
    body: &serde_json::Value,
    mut on_chunk: F,
    headers: &[(String, String)],
    timeout: Duration,
) -> Result<u16>
where
    F: FnMut(&[u8]) -> bool + Send,
{
    let mut req = client().post(url).json(body).timeout(timeout);
    for (name, value) in headers {
        req = req.header(name, value);
    }
    let resp = req.send().await?;
    let status = resp.status().as_u16();

    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                if !on_chunk(&bytes) {
                    debug!("stream consumer cancelled, aborting upstream read");
                    break;
                }
            }
            Err(e) => {
                // Backends drop the connection once the stream is done.
                debug!(error = %e, "upstream stream ended");
                break;
            }
        }
    }
    Ok(status)
}

/// GET with a short timeout; `true` iff the response is HTTP 200.
pub async fn is_reachable(url: &str, timeout: Duration) -> bool {
    match client().get(url).timeout(timeout).send().await {
        Ok(resp) => resp.status().as_u16() == 200,
        Err(_) => false,
    }
}

/// Options for [`download_file`].
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Retry attempts after the first failure.
    pub max_retries: u32,
    /// Resume an existing `.partial` file via HTTP Range.
    pub resume_partial: bool,
    /// First retry delay; doubles each retry.
    pub initial_retry_delay: Duration,
    /// Backoff ceiling.
    pub max_retry_delay: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            resume_partial: true,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(32),
        }
    }
}

/// Outcome of a successful [`download_file`].
#[derive(Debug, Default)]
pub struct DownloadResult {
    /// Bytes transferred by this call (0 when the file was already there).
    pub bytes_downloaded: u64,
    /// Total size of the file, when the server reported one.
    pub total_bytes: u64,
}

/// Progress callback: `(bytes_so_far, bytes_total)`.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

enum AttemptFailure {
    /// Worth retrying; `resumable` keeps the partial file.
    Transient { resumable: bool, message: String },
    /// HTTP-level rejection; retrying cannot help.
    Terminal { message: String },
}

/// Download `url` to `output_path`, resumable and retried.
///
/// See the module docs for the `.partial` protocol. Progress callbacks are
/// throttled to at most one per second with a guaranteed final 100% tick.
/// On failure the partial file is preserved so a later call resumes.
///
/// # Errors
///
/// Returns [`GatewayError::Download`] after all retries are exhausted or on
/// a terminal HTTP error.
pub async fn download_file(
    url: &str,
    output_path: &Path,
    opts: &DownloadOptions,
    progress: Option<ProgressFn<'_>>,
    headers: &[(String, String)],
) -> Result<DownloadResult> {
    let partial_path = partial_path_for(output_path);

    // Final file with no partial sibling: a previous download completed.
    if output_path.exists() && !partial_path.exists() {
        debug!(path = %output_path.display(), "file already downloaded");
        return Ok(DownloadResult::default());
    }

    if let Some(parent) = output_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut resume_offset = if opts.resume_partial {
        file_size(&partial_path)
    } else {
        0
    };
    if resume_offset > 0 {
        info!(
            offset = resume_offset,
            path = %partial_path.display(),
            "resuming partial download"
        );
    }

    let mut delay = opts.initial_retry_delay;
    let mut last_error = String::new();

    for attempt in 0..=opts.max_retries {
        if attempt > 0 {
            info!(attempt, max = opts.max_retries, ?delay, "retrying download");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(opts.max_retry_delay);
            if opts.resume_partial {
                resume_offset = resume_offset.max(file_size(&partial_path));
            }
        }

        match download_attempt(url, &partial_path, resume_offset, progress, headers).await {
            Ok(result) => {
                finalize_partial(&partial_path, output_path).await?;
                return Ok(result);
            }
            Err(AttemptFailure::Transient { resumable, message }) => {
                warn!(attempt, error = %message, "download attempt failed");
                last_error = message;
                if !resumable {
                    let _ = tokio::fs::remove_file(&partial_path).await;
                    resume_offset = 0;
                }
            }
            Err(AttemptFailure::Terminal { message }) => {
                return Err(GatewayError::Download(message));
            }
        }
    }

    let mut message = format!(
        "download failed after {} attempts: {last_error}",
        opts.max_retries + 1
    );
    let partial_size = file_size(&partial_path);
    if partial_size > 0 {
        message.push_str(&format!(
            " (partial file preserved at {}, {partial_size} bytes; rerun to resume)",
            partial_path.display()
        ));
    }
    Err(GatewayError::Download(message))
}

async fn download_attempt(
    url: &str,
    partial_path: &Path,
    resume_offset: u64,
    progress: Option<ProgressFn<'_>>,
    headers: &[(String, String)],
) -> std::result::Result<DownloadResult, AttemptFailure> {
    let mut req = client().get(url);
    for (name, value) in headers {
        req = req.header(name, value);
    }
    if resume_offset > 0 {
        req = req.header("Range", format!("bytes={resume_offset}-"));
    }

    let resp = req.send().await.map_err(|e| AttemptFailure::Transient {
        resumable: resume_offset > 0,
        message: format!("connect failed: {e}"),
    })?;
    let status = resp.status().as_u16();

    // 416 on resume: either the partial is already the whole file, or it
    // diverged from the remote and must be thrown away.
    if status == 416 && resume_offset > 0 {
        return match remote_size(url, headers).await {
            Some(remote) if remote <= resume_offset => {
                info!(local = resume_offset, remote, "partial file verified complete");
                Ok(DownloadResult {
                    bytes_downloaded: 0,
                    total_bytes: remote,
                })
            }
            Some(remote) => Err(AttemptFailure::Transient {
                resumable: false,
                message: format!(
                    "resume rejected: local {resume_offset} bytes vs remote {remote} bytes"
                ),
            }),
            None => Err(AttemptFailure::Transient {
                resumable: false,
                message: "resume rejected (HTTP 416) and remote size unknown".to_owned(),
            }),
        };
    }

    if status >= 400 {
        return Err(AttemptFailure::Terminal {
            message: format!("HTTP error {status} for {url}"),
        });
    }

    let remaining = resp.content_length().unwrap_or(0);
    let total = resume_offset + remaining;

    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(resume_offset > 0)
        .write(true)
        .truncate(resume_offset == 0)
        .open(partial_path)
        .await
        .map_err(|e| AttemptFailure::Transient {
            resumable: false,
            message: format!("cannot open {}: {e}", partial_path.display()),
        })?;
    let mut writer = tokio::io::BufWriter::new(file);

    let mut throttle = ProgressThrottle::new();
    let mut written = 0u64;
    let mut stream = resp.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let bytes = chunk.map_err(|e| AttemptFailure::Transient {
            resumable: resume_offset + written > 0,
            message: format!("read failed mid-transfer: {e}"),
        })?;
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| AttemptFailure::Transient {
                resumable: false,
                message: format!("write failed: {e}"),
            })?;
        written += bytes.len() as u64;

        if let Some(cb) = progress {
            if total > 0 && throttle.should_tick() {
                cb(resume_offset + written, total);
            }
        }
    }

    writer.flush().await.map_err(|e| AttemptFailure::Transient {
        resumable: false,
        message: format!("flush failed: {e}"),
    })?;

    if total > 0 && resume_offset + written < total {
        return Err(AttemptFailure::Transient {
            resumable: resume_offset + written > 0,
            message: format!(
                "short read: got {} of {total} bytes",
                resume_offset + written
            ),
        });
    }

    // Guaranteed 100% tick regardless of throttling.
    if let Some(cb) = progress {
        let done = if total > 0 { total } else { resume_offset + written };
        cb(done, done);
    }

    Ok(DownloadResult {
        bytes_downloaded: written,
        total_bytes: total,
    })
}

async fn remote_size(url: &str, headers: &[(String, String)]) -> Option<u64> {
    let mut req = client().head(url).timeout(Duration::from_secs(30));
    for (name, value) in headers {
        req = req.header(name, value);
    }
    let resp = req.send().await.ok()?;
    resp.content_length()
        .filter(|len| *len > 0)
        .or_else(|| {
            resp.headers()
                .get(reqwest::header::CONTENT_LENGTH)?
                .to_str()
                .ok()?
                .parse()
                .ok()
        })
}

async fn finalize_partial(partial_path: &Path, output_path: &Path) -> Result<()> {
    if !partial_path.exists() {
        // 416-verified-complete path: data is already at neither location
        // only when the final file exists.
        if output_path.exists() {
            return Ok(());
        }
        return Err(GatewayError::Download(format!(
            "download finished but {} is missing",
            partial_path.display()
        )));
    }
    match tokio::fs::rename(partial_path, output_path).await {
        Ok(()) => Ok(()),
        Err(_) => {
            // Rename can fail across filesystems; fall back to copy+delete.
            tokio::fs::copy(partial_path, output_path).await?;
            tokio::fs::remove_file(partial_path).await?;
            Ok(())
        }
    }
}

fn partial_path_for(output_path: &Path) -> PathBuf {
    let mut name = output_path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Limits progress ticks to one per second.
struct ProgressThrottle {
    last: Option<Instant>,
}

impl ProgressThrottle {
    fn new() -> Self {
        Self { last: None }
    }

    fn should_tick(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(prev) if now.duration_since(prev) < Duration::from_secs(1) => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

//! Content-addressed extraction cache + HTTP retry utilities for roster.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use roster_core::Participant;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roster-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Cache key for a raw profile text.
pub fn content_hash(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// One line of the append-only cache log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub record: Participant,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawCacheEntry {
    key: Option<String>,
    record: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheLoadReport {
    pub entries: usize,
    pub distinct_keys: usize,
    pub skipped_lines: usize,
}

#[derive(Debug, Default)]
struct CacheWriter {
    file: Option<fs::File>,
    needs_leading_newline: bool,
}

/// Append-only JSONL store mapping a content hash to the record produced for it.
///
/// The log is replayed once on open; for repeated keys the last line wins and
/// lines that fail to parse are skipped. Appends go through a single writer
/// lock, and the in-memory map is only updated once the line is on disk.
#[derive(Debug)]
pub struct CacheStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, Participant>>,
    writer: Mutex<CacheWriter>,
}

impl CacheStore {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<(Self, CacheLoadReport)> {
        let path = path.into();
        let mut entries = HashMap::new();
        let mut report = CacheLoadReport::default();
        let mut needs_leading_newline = false;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking cache log {}", path.display()))?
        {
            let bytes = fs::read(&path)
                .await
                .with_context(|| format!("reading cache log {}", path.display()))?;
            needs_leading_newline = bytes.last().is_some_and(|b| *b != b'\n');

            for (idx, line) in bytes.split(|b| *b == b'\n').enumerate() {
                let Ok(line) = std::str::from_utf8(line) else {
                    warn!(path = %path.display(), line = idx + 1, "skipping non-utf8 cache line");
                    report.skipped_lines += 1;
                    continue;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_cache_line(line) {
                    Some((key, record)) => {
                        entries.insert(key, record);
                        report.entries += 1;
                    }
                    None => {
                        warn!(path = %path.display(), line = idx + 1, "skipping malformed cache line");
                        report.skipped_lines += 1;
                    }
                }
            }
        }
        report.distinct_keys = entries.len();

        Ok((
            Self {
                path,
                entries: RwLock::new(entries),
                writer: Mutex::new(CacheWriter {
                    file: None,
                    needs_leading_newline,
                }),
            },
            report,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Option<Participant> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Append `{key, record, timestamp}` to the log. Earlier entries are never rewritten.
    pub async fn put(&self, key: &str, record: &Participant) -> anyhow::Result<()> {
        let entry = CacheEntry {
            key: key.to_string(),
            record: record.clone(),
            timestamp: Utc::now(),
        };
        let mut line = serde_json::to_string(&entry).context("serializing cache entry")?;
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = &mut *guard;
        if writer.needs_leading_newline {
            line.insert(0, '\n');
        }
        // Stays set if the append below fails part-way.
        writer.needs_leading_newline = true;

        // A failed write drops the handle; the next put reopens in append mode.
        let mut file = match writer.file.take() {
            Some(file) => file,
            None => {
                if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("creating cache directory {}", parent.display()))?;
                }
                fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await
                    .with_context(|| format!("opening cache log {}", self.path.display()))?
            }
        };

        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending to cache log {}", self.path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing cache log {}", self.path.display()))?;
        writer.file = Some(file);
        writer.needs_leading_newline = false;

        self.entries
            .write()
            .await
            .insert(entry.key, entry.record);
        debug!(key, "cache entry appended");
        Ok(())
    }
}

fn parse_cache_line(line: &str) -> Option<(String, Participant)> {
    let raw: RawCacheEntry = serde_json::from_str(line).ok()?;
    let key = raw.key.filter(|k| !k.trim().is_empty())?;
    let record = raw.record.filter(serde_json::Value::is_object)?;
    let record: Participant = serde_json::from_value(record).ok()?;
    Some((key, record.sanitized()))
}

/// Replace `path` with `bytes` through a temp file + rename in the same directory.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after {attempts} attempt(s): {source}")]
    Request {
        #[source]
        source: reqwest::Error,
        attempts: usize,
    },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request { source, .. } => classify_reqwest_error(source),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request { source, .. } if source.is_timeout())
    }
}

/// JSON-over-HTTP client with a per-request timeout and bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// POST a JSON body, retrying timeouts, connection errors, 429 and 5xx.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        bearer_token: Option<&str>,
        body: &B,
    ) -> Result<HttpResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.post(url).json(body);
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }

            let failure = match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(body) => {
                                return Ok(HttpResponse {
                                    status,
                                    body: body.to_vec(),
                                    attempts: attempt + 1,
                                })
                            }
                            Err(source) => FetchError::Request {
                                source,
                                attempts: attempt + 1,
                            },
                        }
                    } else {
                        let body = resp.text().await.unwrap_or_default();
                        FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                            body,
                        }
                    }
                }
                Err(source) => FetchError::Request {
                    source,
                    attempts: attempt + 1,
                },
            };

            if failure.disposition() == RetryDisposition::Retryable
                && attempt < self.backoff.max_retries
            {
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(url, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %failure, "retrying request");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            return Err(failure);
        }
    }
}

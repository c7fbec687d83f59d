//! HTTP transport + report file storage for the MOPS digest.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, FixedOffset};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "mops-storage";

pub const REPORT_EXTENSION: &str = "xls";

#[derive(Debug, Clone)]
pub struct StoredReport {
    pub file_name: String,
    pub absolute_path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

/// Directory that receives one spreadsheet-compatible report per run.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn report_file_name(generated_at: DateTime<FixedOffset>, prefix: &str) -> String {
        let stamp = generated_at.format("%Y%m%d_%H%M%S");
        let prefix = prefix.trim();
        let prefix = if prefix.is_empty() { "report" } else { prefix };
        format!("{prefix}_{stamp}.{REPORT_EXTENSION}")
    }

    /// Write the report through a temp file + rename so readers never see a partial file.
    pub async fn store_report(
        &self,
        generated_at: DateTime<FixedOffset>,
        prefix: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredReport> {
        let file_name = Self::report_file_name(generated_at, prefix);
        let absolute_path = self.root.join(&file_name);

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating report directory {}", self.root.display()))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp report file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp report file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp report file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp report {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredReport {
            file_name,
            absolute_path,
            content_hash: Self::sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid response body from {url}: {reason}")]
    InvalidBody { url: String, reason: String },
}

/// Single-attempt HTTP client; every request is made exactly once.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// POST an already form-encoded body.
    pub async fn post_form(&self, url: &str, body: String) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", method = "POST", url);
        async move {
            debug!(bytes = body.len(), "sending form body");
            let resp = self
                .client
                .post(url)
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded; charset=UTF-8")
                .body(body)
                .send()
                .await
                .map_err(|source| request_error(url, source))?;
            let resp = ensure_success(resp)?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp
                .bytes()
                .await
                .map_err(|source| request_error(url, source))?
                .to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    /// GET a page and decode it using the charset the server declared.
    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", method = "GET", url);
        async move {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|source| request_error(url, source))?;
            let resp = ensure_success(resp)?;
            resp.text().await.map_err(|source| request_error(url, source))
        }
        .instrument(span)
        .await
    }
}

fn request_error(url: &str, source: reqwest::Error) -> FetchError {
    FetchError::Request {
        url: url.to_string(),
        source,
    }
}

fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, FetchError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: resp.url().to_string(),
        })
    }
}

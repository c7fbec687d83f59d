//! Disclosure digest orchestration: bulk listing, concurrent per-stock resolution, report assembly.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use mops_adapters::{
    build_detail_address, extract_fragment, DisclosureSource, HttpDisclosureSource,
    DEFAULT_DETAIL_URL, DEFAULT_LISTING_URL,
};
use mops_core::{
    normalize_rows, DisclosureRecord, ListingWindow, RawRow, RecordIndex, Resolution,
};
use mops_storage::{FetchError, HttpClientConfig, HttpFetcher, ReportStore};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "mops-sync";

/// Literal "no data" marker rendered for stocks without a disclosure table.
pub const NO_DATA_MARKER: &str = "無資料";

pub const FRAGMENT_SEPARATOR: &str = "<br><br><br>";

pub const REPORT_SHELL_HEAD: &str = r#"<html xmlns:o="urn:schemas-microsoft-com:office:office" xmlns:x="urn:schemas-microsoft-com:office:excel" xmlns="http://www.w3.org/TR/REC-html40">
<head>
<meta http-equiv="Content-Type" content="text/html; charset=utf-8">
<style>
table { border-collapse: collapse; }
td, th { border: 1px solid #999999; padding: 4px; mso-number-format: "\@"; }
p { font-weight: bold; }
</style>
</head>
<body>
"#;

pub const REPORT_SHELL_TAIL: &str = "\n</body>\n</html>\n";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing {0} date (set MOPS_START_DATE / MOPS_END_DATE or pass --start-date / --end-date)")]
    MissingDate(&'static str),
    #[error("no stock ids given (set MOPS_STOCK_IDS or pass --ids)")]
    EmptyStockIds,
    #[error("stock id #{position} is blank")]
    BlankStockId { position: usize },
    #[error("utc offset of {0} hours is out of range")]
    InvalidUtcOffset(i32),
}

#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub stock_ids: Vec<String>,
    pub listing_url: String,
    pub detail_url: String,
    pub output_dir: PathBuf,
    pub report_prefix: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub detail_timeout_secs: u64,
    pub utc_offset_hours: i32,
}

impl ReportConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            start_date: non_blank("MOPS_START_DATE"),
            end_date: non_blank("MOPS_END_DATE"),
            stock_ids: lookup("MOPS_STOCK_IDS")
                .map(|raw| parse_stock_ids(&raw))
                .unwrap_or_default(),
            listing_url: non_blank("MOPS_LISTING_URL")
                .unwrap_or_else(|| DEFAULT_LISTING_URL.to_string()),
            detail_url: non_blank("MOPS_DETAIL_URL")
                .unwrap_or_else(|| DEFAULT_DETAIL_URL.to_string()),
            output_dir: non_blank("MOPS_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            report_prefix: non_blank("MOPS_REPORT_PREFIX").unwrap_or_else(|| "mops".to_string()),
            user_agent: non_blank("MOPS_USER_AGENT")
                .unwrap_or_else(|| "mops-digest/0.1".to_string()),
            http_timeout_secs: lookup("MOPS_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(20),
            detail_timeout_secs: lookup("MOPS_DETAIL_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(30),
            utc_offset_hours: lookup("MOPS_UTC_OFFSET_HOURS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8),
        }
    }

    pub fn run_request(&self) -> Result<RunRequest, ConfigError> {
        RunRequest::new(
            self.start_date.clone().unwrap_or_default(),
            self.end_date.clone().unwrap_or_default(),
            self.stock_ids.clone(),
        )
    }

    pub fn utc_offset(&self) -> Result<FixedOffset, ConfigError> {
        FixedOffset::east_opt(self.utc_offset_hours.saturating_mul(3600))
            .ok_or(ConfigError::InvalidUtcOffset(self.utc_offset_hours))
    }

    pub fn report_output(&self) -> Result<ReportOutput, ConfigError> {
        Ok(ReportOutput {
            store: ReportStore::new(self.output_dir.clone()),
            prefix: self.report_prefix.clone(),
            utc_offset: self.utc_offset()?,
        })
    }
}

/// Split a `1101, 2330 2454` style list; separators are commas and whitespace.
pub fn parse_stock_ids(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Validated input to a run: a date window plus at least one non-blank stock id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    window: ListingWindow,
    stock_ids: Vec<String>,
}

impl RunRequest {
    pub fn new(
        start_date: impl Into<String>,
        end_date: impl Into<String>,
        stock_ids: Vec<String>,
    ) -> Result<Self, ConfigError> {
        let start_date = start_date.into().trim().to_string();
        let end_date = end_date.into().trim().to_string();
        if start_date.is_empty() {
            return Err(ConfigError::MissingDate("start"));
        }
        if end_date.is_empty() {
            return Err(ConfigError::MissingDate("end"));
        }
        if stock_ids.is_empty() {
            return Err(ConfigError::EmptyStockIds);
        }
        let stock_ids = stock_ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| {
                let id = id.trim().to_string();
                if id.is_empty() {
                    Err(ConfigError::BlankStockId { position: i + 1 })
                } else {
                    Ok(id)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            window: ListingWindow {
                start_date,
                end_date,
            },
            stock_ids,
        })
    }

    pub fn window(&self) -> &ListingWindow {
        &self.window
    }

    pub fn stock_ids(&self) -> &[String] {
        &self.stock_ids
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStage {
    BulkFetching,
    Resolving,
    Assembling,
    Done,
    Failed,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::BulkFetching => "bulk_fetching",
            RunStage::Resolving => "resolving",
            RunStage::Assembling => "assembling",
            RunStage::Done => "done",
            RunStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub fn render_fragment(resolution: &Resolution) -> String {
    match resolution {
        Resolution::Detailed { stock_id, fragment } => {
            format!("<p>stock id: {stock_id}</p>{fragment}")
        }
        Resolution::NoDetail { stock_id } | Resolution::Unmatched { stock_id } => {
            format!("<p>stock id: {stock_id}</p><div>{stock_id} {NO_DATA_MARKER}</div>")
        }
    }
}

/// Rendered fragments in stock-id order; the shell is added by [`ReportDocument::html`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportDocument {
    fragments: Vec<String>,
}

impl ReportDocument {
    pub fn fragments(&self) -> &[String] {
        &self.fragments
    }

    pub fn body(&self) -> String {
        self.fragments.join(FRAGMENT_SEPARATOR)
    }

    pub fn html(&self) -> String {
        format!("{REPORT_SHELL_HEAD}{}{REPORT_SHELL_TAIL}", self.body())
    }
}

pub fn assemble(resolutions: &[Resolution]) -> ReportDocument {
    ReportDocument {
        fragments: resolutions.iter().map(render_fragment).collect(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionCounts {
    pub detailed: usize,
    pub no_detail: usize,
    pub unmatched: usize,
}

impl ResolutionCounts {
    pub fn tally(resolutions: &[Resolution]) -> Self {
        let mut counts = Self::default();
        for resolution in resolutions {
            match resolution {
                Resolution::Detailed { .. } => counts.detailed += 1,
                Resolution::NoDetail { .. } => counts.no_detail += 1,
                Resolution::Unmatched { .. } => counts.unmatched += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone)]
pub struct CompiledReport {
    pub listed_records: usize,
    pub resolutions: Vec<Resolution>,
    pub document: ReportDocument,
}

/// Where and under which name a finished report is written.
#[derive(Debug, Clone)]
pub struct ReportOutput {
    pub store: ReportStore,
    pub prefix: String,
    pub utc_offset: FixedOffset,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<FixedOffset>,
    pub finished_at: DateTime<FixedOffset>,
    pub requested: usize,
    pub listed_records: usize,
    pub counts: ResolutionCounts,
    pub report_path: String,
    pub content_hash: String,
    pub byte_size: usize,
}

pub struct DisclosurePipeline {
    source: Arc<dyn DisclosureSource>,
    detail_timeout: Duration,
}

impl DisclosurePipeline {
    pub fn new(source: Arc<dyn DisclosureSource>, detail_timeout: Duration) -> Self {
        Self {
            source,
            detail_timeout,
        }
    }

    pub fn from_config(config: &ReportConfig) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let source = HttpDisclosureSource::new(http, &config.listing_url, &config.detail_url)
            .context("configuring MOPS endpoints")?;
        Ok(Self::new(
            Arc::new(source),
            Duration::from_secs(config.detail_timeout_secs),
        ))
    }

    /// Fetch, resolve and assemble. Only the bulk listing can fail the run.
    pub async fn compile(&self, request: &RunRequest) -> Result<CompiledReport, FetchError> {
        let window = request.window();
        info!(
            stage = %RunStage::BulkFetching,
            start_date = %window.start_date,
            end_date = %window.end_date,
            "fetching disclosure listing"
        );
        let rows = match self.source.fetch_listing(window).await {
            Ok(rows) => rows,
            Err(err) => {
                error!(stage = %RunStage::Failed, error = %err, "listing fetch failed; no report produced");
                return Err(err);
            }
        };

        let index = Arc::new(index_rows(&rows));
        info!(
            stage = %RunStage::Resolving,
            listed = index.len(),
            stock_ids = request.stock_ids().len(),
            "resolving stock ids"
        );
        let resolutions = self.resolve_all(index.clone(), request.stock_ids()).await;

        info!(stage = %RunStage::Assembling, "assembling report");
        let document = assemble(&resolutions);
        let counts = ResolutionCounts::tally(&resolutions);
        info!(
            stage = %RunStage::Done,
            detailed = counts.detailed,
            no_detail = counts.no_detail,
            unmatched = counts.unmatched,
            "report assembled"
        );

        Ok(CompiledReport {
            listed_records: index.len(),
            resolutions,
            document,
        })
    }

    pub async fn run_once(&self, request: &RunRequest, output: &ReportOutput) -> Result<RunSummary> {
        let started_at = Utc::now().with_timezone(&output.utc_offset);
        let compiled = self
            .compile(request)
            .await
            .context("fetching disclosure listing")?;

        let html = compiled.document.html();
        let stored = output
            .store
            .store_report(started_at, &output.prefix, html.as_bytes())
            .await?;
        info!(path = %stored.absolute_path.display(), bytes = stored.byte_size, "report written");

        Ok(RunSummary {
            started_at,
            finished_at: Utc::now().with_timezone(&output.utc_offset),
            requested: request.stock_ids().len(),
            listed_records: compiled.listed_records,
            counts: ResolutionCounts::tally(&compiled.resolutions),
            report_path: stored.absolute_path.display().to_string(),
            content_hash: stored.content_hash,
            byte_size: stored.byte_size,
        })
    }

    async fn resolve_all(&self, index: Arc<RecordIndex>, stock_ids: &[String]) -> Vec<Resolution> {
        let mut tasks = JoinSet::new();
        for (slot, stock_id) in stock_ids.iter().enumerate() {
            let source = Arc::clone(&self.source);
            let index = Arc::clone(&index);
            let stock_id = stock_id.clone();
            let detail_timeout = self.detail_timeout;
            tasks.spawn(async move {
                let resolution = resolve_one(source.as_ref(), &index, stock_id, detail_timeout).await;
                (slot, resolution)
            });
        }

        let mut slots: Vec<Option<Resolution>> = vec![None; stock_ids.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, resolution)) => slots[slot] = Some(resolution),
                Err(err) => warn!(error = %err, "resolution task aborted"),
            }
        }

        slots
            .into_iter()
            .zip(stock_ids)
            .map(|(resolved, stock_id)| {
                resolved.unwrap_or_else(|| Resolution::NoDetail {
                    stock_id: stock_id.clone(),
                })
            })
            .collect()
    }
}

fn index_rows(rows: &[RawRow]) -> RecordIndex {
    let canonical = normalize_rows(rows);
    let total = canonical.len();
    let records: Vec<DisclosureRecord> = canonical
        .into_iter()
        .filter_map(DisclosureRecord::from_row)
        .collect();
    if records.len() < total {
        warn!(dropped = total - records.len(), "listing rows without companyId skipped");
    }
    let index = RecordIndex::new(records);
    if index.shadowed_duplicates() > 0 {
        debug!(
            shadowed = index.shadowed_duplicates(),
            "duplicate companyId rows; first listed row wins"
        );
    }
    index
}

async fn resolve_one(
    source: &dyn DisclosureSource,
    index: &RecordIndex,
    stock_id: String,
    detail_timeout: Duration,
) -> Resolution {
    let Some(record) = index.lookup(&stock_id) else {
        debug!(%stock_id, "stock id not in listing");
        return Resolution::Unmatched { stock_id };
    };

    let address = build_detail_address(source.detail_base(), &record.hyperlink);
    debug!(%stock_id, %address, "fetching detail page");
    match tokio::time::timeout(detail_timeout, extract_fragment(source, &address)).await {
        Ok(Some(fragment)) => Resolution::Detailed { stock_id, fragment },
        Ok(None) => {
            warn!(%stock_id, %address, "no disclosure table; falling back to no data");
            Resolution::NoDetail { stock_id }
        }
        Err(_) => {
            warn!(%stock_id, %address, ?detail_timeout, "detail fetch timed out; falling back to no data");
            Resolution::NoDetail { stock_id }
        }
    }
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = ReportConfig::from_env();
    let request = config.run_request()?;
    let output = config.report_output()?;
    DisclosurePipeline::from_config(&config)?
        .run_once(&request, &output)
        .await
}

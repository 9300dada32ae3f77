//! Spreadsheet side of the ingest: the transport contract, the Google Sheets
//! values API client, and the row parser that turns raw cells into
//! submissions.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use ingest_core::Submission;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "ingest-sheets";

/// Cells of one spreadsheet row as returned by the values API.
pub type RawRow = Vec<JsonValue>;

/// Rendered form-response timestamp, e.g. `1/2/2019 15:04:05`.
pub const TIMESTAMP_FORMAT: &str = "%m/%d/%Y %H:%M:%S";

pub const DEFAULT_SHEET_NAME: &str = "SUBMISSIONS";
pub const DEFAULT_SHEETS_BASE_URL: &str = "https://sheets.googleapis.com";

/// Data row `i` lives at sheet row `i + HEADER_ROWS + 1`.
const HEADER_ROWS: usize = 1;
const LAST_COLUMN: char = 'I';
const IMPORTED_COLUMN: char = 'H';

const COL_TIMESTAMP: usize = 0;
const COL_MATCH_ID: usize = 1;
const COL_NAME: usize = 2;
const COL_DESCRIPTION: usize = 3;
const COL_CATEGORY: usize = 4;
const COL_HERO: usize = 5;
const COL_INGAME_TIME: usize = 6;
const COL_IMPORTED: usize = 7;

#[derive(Debug, Error)]
pub enum RowParseError {
    #[error("row {row_index}: unparseable timestamp {value:?}: {source}")]
    Timestamp {
        row_index: usize,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

#[derive(Debug, Error)]
pub enum SheetsError {
    #[error("sheets request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("parse submissions: {0}")]
    Schema(#[from] RowParseError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SheetsError {
    /// Whether the failure looks like a network or rate-limit blip rather
    /// than a configuration or schema problem.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            Self::HttpStatus { status, .. } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            Self::Schema(_) | Self::Other(_) => false,
        }
    }
}

/// Row-level access to the submissions sheet.
#[async_trait]
pub trait SheetTransport: Send + Sync {
    /// Returns every row from `start_index` (zero-based, header excluded) to
    /// the end of the sheet.
    async fn fetch_rows(&self, start_index: usize) -> Result<Vec<RawRow>, SheetsError>;

    /// Writes the imported flag of every listed row in a single request.
    async fn update_imported(&self, row_indices: &[usize], imported: bool) -> Result<(), SheetsError>;
}

/// Result of one tail fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedWindow {
    pub start_index: usize,
    /// Raw rows returned, blank ones included.
    pub row_count: usize,
    pub submissions: Vec<Submission>,
}

impl FetchedWindow {
    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    pub fn end_index(&self) -> usize {
        self.start_index + self.row_count
    }
}

/// Submission-level view over a [`SheetTransport`].
#[derive(Debug, Clone)]
pub struct SubmissionSheet<T> {
    transport: T,
}

impl<T: SheetTransport> SubmissionSheet<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Fetches the tail starting at `start_index` and parses it. A single bad
    /// timestamp fails the whole window.
    pub async fn fetch_submissions(&self, start_index: usize) -> Result<FetchedWindow, SheetsError> {
        let rows = self.transport.fetch_rows(start_index).await?;
        let submissions = parse_rows(start_index, &rows)?;
        Ok(FetchedWindow {
            start_index,
            row_count: rows.len(),
            submissions,
        })
    }

    pub async fn set_submissions_imported(
        &self,
        row_indices: &[usize],
        imported: bool,
    ) -> Result<(), SheetsError> {
        if row_indices.is_empty() {
            return Ok(());
        }
        self.transport.update_imported(row_indices, imported).await
    }
}

/// Parses a window of rows whose first row sits at `start_index`. Blank rows
/// are dropped; the returned submissions keep their absolute row index.
pub fn parse_rows(start_index: usize, rows: &[RawRow]) -> Result<Vec<Submission>, RowParseError> {
    let mut submissions = Vec::with_capacity(rows.len());
    for (offset, row) in rows.iter().enumerate() {
        if let Some(submission) = parse_submission_row(start_index + offset, row)? {
            submissions.push(submission);
        }
    }
    Ok(submissions)
}

/// Parses one row. `Ok(None)` means the row carries no submission.
pub fn parse_submission_row(row_index: usize, cells: &[JsonValue]) -> Result<Option<Submission>, RowParseError> {
    let row = RowCells { cells };
    let Some(raw_timestamp) = row.text(COL_TIMESTAMP) else {
        return Ok(None);
    };
    let timestamp = parse_timestamp(&raw_timestamp).map_err(|source| RowParseError::Timestamp {
        row_index,
        value: raw_timestamp.clone(),
        source,
    })?;

    Ok(Some(Submission {
        id: None,
        timestamp,
        match_id: row.int64_or_zero(COL_MATCH_ID),
        name: row.text_or_empty(COL_NAME),
        description: row.text_or_empty(COL_DESCRIPTION),
        category_raw: row.text_or_empty(COL_CATEGORY),
        category_code: None,
        hero: row.text_or_empty(COL_HERO),
        imported: row.text_or_empty(COL_IMPORTED).eq_ignore_ascii_case("true"),
        reviewed: false,
        status: 0,
        match_time: 0,
        ingame_time: filter_ingame_time(&row.text_or_empty(COL_INGAME_TIME)),
        row_index,
    }))
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT).map(|naive| naive.and_utc())
}

/// Keeps ASCII letters, digits and `:`.
pub fn filter_ingame_time(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ':')
        .collect::<String>()
        .trim()
        .to_string()
}

struct RowCells<'a> {
    cells: &'a [JsonValue],
}

impl RowCells<'_> {
    /// Trimmed cell text, `None` when the cell is missing or blank.
    fn text(&self, col: usize) -> Option<String> {
        let text = match self.cells.get(col)? {
            JsonValue::String(s) => s.trim().to_string(),
            JsonValue::Number(n) => n.to_string(),
            JsonValue::Bool(b) => b.to_string(),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    }

    fn text_or_empty(&self, col: usize) -> String {
        self.text(col).unwrap_or_default()
    }

    fn int64_or_zero(&self, col: usize) -> i64 {
        match self.cells.get(col) {
            Some(JsonValue::Number(n)) => n
                .as_i64()
                .or_else(|| {
                    n.as_f64()
                        .filter(|f| f.is_finite() && f.fract() == 0.0)
                        .map(|f| f as i64)
                })
                .unwrap_or(0),
            Some(JsonValue::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GoogleSheetsConfig {
    pub base_url: String,
    pub spreadsheet_id: String,
    pub sheet_name: String,
    pub access_token: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl GoogleSheetsConfig {
    pub fn new(spreadsheet_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_SHEETS_BASE_URL.to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            sheet_name: DEFAULT_SHEET_NAME.to_string(),
            access_token: access_token.into(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// [`SheetTransport`] over the Google Sheets v4 values API.
#[derive(Debug, Clone)]
pub struct GoogleSheetsTransport {
    client: reqwest::Client,
    config: GoogleSheetsConfig,
}

#[derive(Debug, Default, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<RawRow>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchUpdateValuesRequest {
    value_input_option: &'static str,
    data: Vec<ValueRangeUpdate>,
}

#[derive(Debug, Serialize)]
struct ValueRangeUpdate {
    range: String,
    values: Vec<Vec<&'static str>>,
}

impl GoogleSheetsTransport {
    pub fn new(config: GoogleSheetsConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building sheets http client")?;
        Url::parse(&config.base_url)
            .with_context(|| format!("parsing sheets base url {}", config.base_url))?;
        Ok(Self { client, config })
    }

    pub fn spreadsheet_id(&self) -> &str {
        &self.config.spreadsheet_id
    }

    /// A1 range covering every column from `start_index` to the sheet end.
    pub fn tail_range(&self, start_index: usize) -> String {
        format!(
            "{}!A{}:{}",
            self.config.sheet_name,
            sheet_row(start_index),
            LAST_COLUMN
        )
    }

    pub fn imported_cell(&self, row_index: usize) -> String {
        format!(
            "{}!{}{}",
            self.config.sheet_name,
            IMPORTED_COLUMN,
            sheet_row(row_index)
        )
    }

    fn endpoint(&self, last_segment: &str) -> Result<Url, SheetsError> {
        let mut url = Url::parse(&self.config.base_url)
            .with_context(|| format!("parsing sheets base url {}", self.config.base_url))?;
        url.path_segments_mut()
            .map_err(|()| anyhow::anyhow!("sheets base url cannot carry a path"))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", self.config.spreadsheet_id.as_str()])
            .push(last_segment);
        Ok(url)
    }

    fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, SheetsError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        Err(SheetsError::HttpStatus {
            status: status.as_u16(),
            url: resp.url().to_string(),
        })
    }
}

fn sheet_row(row_index: usize) -> usize {
    row_index + HEADER_ROWS + 1
}

#[async_trait]
impl SheetTransport for GoogleSheetsTransport {
    async fn fetch_rows(&self, start_index: usize) -> Result<Vec<RawRow>, SheetsError> {
        let range = self.tail_range(start_index);
        let span = info_span!("sheets_fetch", spreadsheet_id = %self.config.spreadsheet_id, %range);

        async move {
            let mut url = self.endpoint("values")?;
            url.path_segments_mut()
                .map_err(|()| anyhow::anyhow!("sheets base url cannot carry a path"))?
                .push(&range);

            let resp = self
                .client
                .get(url)
                .bearer_auth(&self.config.access_token)
                .send()
                .await?;
            let body: ValueRange = Self::check_status(resp)?.json().await?;
            debug!(rows = body.values.len(), "fetched sheet tail");
            Ok::<_, SheetsError>(body.values)
        }
        .instrument(span)
        .await
    }

    async fn update_imported(&self, row_indices: &[usize], imported: bool) -> Result<(), SheetsError> {
        if row_indices.is_empty() {
            return Ok(());
        }
        let value = if imported { "TRUE" } else { "FALSE" };
        let request = BatchUpdateValuesRequest {
            value_input_option: "RAW",
            data: row_indices
                .iter()
                .map(|&row_index| ValueRangeUpdate {
                    range: self.imported_cell(row_index),
                    values: vec![vec![value]],
                })
                .collect(),
        };

        let url = self.endpoint("values:batchUpdate")?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.config.access_token)
            .json(&request)
            .send()
            .await?;
        Self::check_status(resp)?;
        debug!(rows = row_indices.len(), imported, "batch updated imported column");
        Ok(())
    }
}

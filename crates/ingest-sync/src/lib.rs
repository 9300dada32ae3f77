//! Incremental spreadsheet-to-store sync engine.
//!
//! One engine owns one tail cursor. Each cycle fetches every row from the
//! cursor to the end of the sheet, writes the valid ones through the
//! deduplicating writer, marks the handled rows imported in one batch and
//! only then moves the cursor past the fetched window.

mod config;

use std::time::Duration;

use anyhow::Context;
use ingest_core::{Submission, SubmissionPolicy};
use ingest_sheets::{FetchedWindow, GoogleSheetsTransport, SheetTransport, SheetsError, SubmissionSheet};
use ingest_storage::{DedupWriter, PgSubmissionStore, SubmissionStore, WriteOutcome};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::IngestConfig;

pub const CRATE_NAME: &str = "ingest-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncPhase {
    Idle,
    Fetching,
    Processing,
    Acknowledging,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fetching rows from {start_index}: {source}")]
    Fetch {
        start_index: usize,
        #[source]
        source: SheetsError,
    },
    #[error("marking {rows} rows imported: {source}")]
    Acknowledge {
        rows: usize,
        #[source]
        source: SheetsError,
    },
}

impl CycleError {
    /// Whether the sheet failure looks like a blip that the next tick may
    /// clear.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Fetch { source, .. } | Self::Acknowledge { source, .. } => source.is_transient(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub poll_interval: Duration,
    pub policy: SubmissionPolicy,
    /// Derive the starting cursor from the sheet's imported column when
    /// `execute` starts.
    pub resume_from_sheet: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            policy: SubmissionPolicy::default(),
            resume_from_sheet: true,
        }
    }
}

impl From<&IngestConfig> for EngineConfig {
    fn from(config: &IngestConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            policy: config.policy(),
            resume_from_sheet: true,
        }
    }
}

/// What happened to the rows of one fetched window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WindowOutcome {
    /// Row indices to mark imported, in sheet order.
    pub handled: Vec<usize>,
    pub inserted: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub already_imported: usize,
    pub write_failures: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub start_index: usize,
    pub fetched_rows: usize,
    pub outcome: WindowOutcome,
    pub next_cursor: usize,
}

pub struct SyncEngine<T, S> {
    sheet: SubmissionSheet<T>,
    writer: DedupWriter<S>,
    config: EngineConfig,
    cursor: usize,
    phase: SyncPhase,
}

impl<T: SheetTransport, S: SubmissionStore> SyncEngine<T, S> {
    pub fn new(transport: T, store: S, config: EngineConfig) -> Self {
        Self {
            sheet: SubmissionSheet::new(transport),
            writer: DedupWriter::new(store),
            config,
            cursor: 0,
            phase: SyncPhase::Idle,
        }
    }

    pub fn with_cursor(mut self, cursor: usize) -> Self {
        self.cursor = cursor;
        self
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn sheet(&self) -> &SubmissionSheet<T> {
        &self.sheet
    }

    pub fn store(&self) -> &S {
        self.writer.store()
    }

    /// Runs cycles on the poll interval until `cancel` fires. Cancellation is
    /// only observed between cycles.
    pub async fn execute(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        if self.config.resume_from_sheet {
            match self.resume_cursor().await {
                Ok(cursor) => info!(cursor, "resuming after rows already marked imported"),
                Err(err) => warn!(error = %err, cursor = self.cursor, "could not derive resume point from sheet"),
            }
        }

        let period = self.config.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(cursor = self.cursor, "sync loop cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            match self.run_cycle().await {
                Ok(report) if report.fetched_rows > 0 => info!(
                    run_id = %report.run_id,
                    fetched = report.fetched_rows,
                    handled = report.outcome.handled.len(),
                    inserted = report.outcome.inserted,
                    duplicates = report.outcome.duplicates,
                    invalid = report.outcome.invalid,
                    write_failures = report.outcome.write_failures,
                    cursor = report.next_cursor,
                    "sync cycle complete"
                ),
                Ok(_) => {}
                Err(err) => warn!(
                    error = %err,
                    transient = err.is_transient(),
                    cursor = self.cursor,
                    "sync cycle failed, will retry"
                ),
            }
        }
    }

    /// Sets the cursor to the end of the leading run of rows that the sheet
    /// already marks imported. Blank rows inside that run count as consumed.
    pub async fn resume_cursor(&mut self) -> Result<usize, SheetsError> {
        let window = self.sheet.fetch_submissions(0).await?;
        self.cursor = leading_imported_rows(&window);
        Ok(self.cursor)
    }

    /// One fetch, process and acknowledge pass. The cursor only moves, past the
    /// whole window, when the pass succeeds and every row was handled.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", %run_id, start_index = self.cursor);
        let result = self.run_cycle_inner(run_id).instrument(span).await;
        self.enter_phase(SyncPhase::Idle);
        result
    }

    fn enter_phase(&mut self, phase: SyncPhase) {
        debug!(from = ?self.phase, to = ?phase, "sync phase");
        self.phase = phase;
    }

    async fn run_cycle_inner(&mut self, run_id: Uuid) -> Result<CycleReport, CycleError> {
        let start_index = self.cursor;

        self.enter_phase(SyncPhase::Fetching);
        let window = self
            .sheet
            .fetch_submissions(start_index)
            .await
            .map_err(|source| CycleError::Fetch { start_index, source })?;

        if window.is_empty() {
            return Ok(CycleReport {
                run_id,
                start_index,
                fetched_rows: 0,
                outcome: WindowOutcome::default(),
                next_cursor: start_index,
            });
        }
        let fetched_rows = window.row_count;

        self.enter_phase(SyncPhase::Processing);
        let outcome = self.process_window(window.submissions).await;

        self.enter_phase(SyncPhase::Acknowledging);
        self.sheet
            .set_submissions_imported(&outcome.handled, true)
            .await
            .map_err(|source| CycleError::Acknowledge {
                rows: outcome.handled.len(),
                source,
            })?;
        if !outcome.handled.is_empty() {
            debug!(rows = outcome.handled.len(), "batch updated rows to imported");
        }

        // Failed writes stay unacknowledged and must be re-fetched.
        if outcome.write_failures == 0 {
            self.cursor = start_index + fetched_rows;
        } else {
            debug!(failed = outcome.write_failures, "holding cursor for rows that failed to write");
        }
        Ok(CycleReport {
            run_id,
            start_index,
            fetched_rows,
            outcome,
            next_cursor: self.cursor,
        })
    }

    /// Validates and writes each submission in sheet order and collects the
    /// rows that are safe to mark imported.
    pub async fn process_window(&mut self, submissions: Vec<Submission>) -> WindowOutcome {
        let mut outcome = WindowOutcome::default();

        for mut submission in submissions {
            let row_index = submission.row_index;
            let match_id = submission.match_id;

            if submission.imported {
                outcome.already_imported += 1;
                outcome.handled.push(row_index);
                continue;
            }

            submission.normalize_category();
            if let Err(err) = self.config.policy.validate(&submission) {
                warn!(match_id, row_index, error = %err, "ignoring invalid submission");
                outcome.invalid += 1;
                outcome.handled.push(row_index);
                continue;
            }

            match self.writer.write(&mut submission).await {
                Ok(WriteOutcome::Inserted) => {
                    debug!(match_id, row_index, id = submission.id.as_deref().unwrap_or_default(), "inserted submission");
                    outcome.inserted += 1;
                }
                Ok(WriteOutcome::AlreadyPresent) => {
                    debug!(match_id, row_index, "entry already existed in database");
                    outcome.duplicates += 1;
                }
                Err(err) => {
                    warn!(match_id, row_index, error = %err, "unable to write entry to database");
                    outcome.write_failures += 1;
                    continue;
                }
            }
            submission.imported = true;
            outcome.handled.push(row_index);
        }

        outcome
    }
}

fn leading_imported_rows(window: &FetchedWindow) -> usize {
    let first_pending = window
        .submissions
        .iter()
        .find(|s| !s.imported)
        .map(|s| s.row_index);
    match first_pending {
        Some(row_index) => row_index,
        None => window.end_index(),
    }
}

/// Builds the production engine: Postgres store (migrated) plus the Google
/// Sheets transport. Any failure here is fatal to the process.
pub async fn connect_engine(
    config: &IngestConfig,
) -> anyhow::Result<SyncEngine<GoogleSheetsTransport, PgSubmissionStore>> {
    let transport = GoogleSheetsTransport::new(config.sheets_config()?)?;
    let store = PgSubmissionStore::connect(&config.database_url).await?;
    store.migrate().await?;
    Ok(SyncEngine::new(transport, store, EngineConfig::from(config)))
}

/// Fetches the whole sheet once.
pub async fn fetch_all_submissions(config: &IngestConfig) -> anyhow::Result<Vec<Submission>> {
    let sheet = SubmissionSheet::new(GoogleSheetsTransport::new(config.sheets_config()?)?);
    let window = sheet
        .fetch_submissions(0)
        .await
        .context("fetching submissions from sheet")?;
    Ok(window.submissions)
}

//! Submission persistence: the store contract, the PostgreSQL and in-memory
//! backends, and the deduplicating writer that sits in front of them.

use std::collections::{HashMap, HashSet};

use anyhow::Context;
use async_trait::async_trait;
use ingest_core::{generate_submission_id, Submission};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "ingest-storage";

/// Unique index enforcing one stored submission per match.
pub const MATCH_ID_CONSTRAINT: &str = "submissions_match_id_key";
/// Primary key on the submission id.
pub const ID_CONSTRAINT: &str = "submissions_pkey";

/// Fresh ids tried by [`DedupWriter::write`] before an id clash is reported.
const MAX_ID_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("submission for match {match_id} already exists")]
    Duplicate { match_id: i64 },
    #[error("submission id {id} is already taken")]
    IdConflict { id: String },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn count_by_match_id(&self, match_id: i64) -> Result<i64, StoreError>;

    /// Inserts a submission that already carries an id. A clash on the match
    /// id must surface as [`StoreError::Duplicate`], a clash on the id itself
    /// as [`StoreError::IdConflict`].
    async fn insert(&self, submission: &Submission) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted,
    AlreadyPresent,
}

/// Check-then-insert writer keyed on the match id.
///
/// `write` takes `&mut self`, so one writer never interleaves two
/// check/insert pairs. The store's unique index covers anything racing in
/// from outside this process.
#[derive(Debug)]
pub struct DedupWriter<S> {
    store: S,
}

impl<S: SubmissionStore> DedupWriter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn write(&mut self, submission: &mut Submission) -> Result<WriteOutcome, StoreError> {
        let existing = self.store.count_by_match_id(submission.match_id).await?;
        if existing > 0 {
            debug!(match_id = submission.match_id, existing, "submission already stored");
            return Ok(WriteOutcome::AlreadyPresent);
        }

        submission.ensure_id();
        let mut attempt = 1;
        loop {
            match self.store.insert(submission).await {
                Ok(()) => return Ok(WriteOutcome::Inserted),
                Err(StoreError::Duplicate { match_id }) => {
                    debug!(match_id, "insert lost a race on the unique index");
                    return Ok(WriteOutcome::AlreadyPresent);
                }
                Err(StoreError::IdConflict { id }) if attempt < MAX_ID_ATTEMPTS => {
                    warn!(match_id = submission.match_id, id = %id, attempt, "submission id taken, regenerating");
                    submission.id = Some(generate_submission_id());
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgSubmissionStore {
    pool: PgPool,
}

impl PgSubmissionStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await
            .context("connecting to submissions database")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying submissions migrations")
    }
}

#[async_trait]
impl SubmissionStore for PgSubmissionStore {
    async fn count_by_match_id(&self, match_id: i64) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM submissions WHERE match_id = $1")
            .bind(match_id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("counting submissions for match {match_id}"))?;
        Ok(count)
    }

    async fn insert(&self, submission: &Submission) -> Result<(), StoreError> {
        let id = submission
            .id
            .as_deref()
            .context("submission id must be assigned before insert")?;

        let result = sqlx::query(
            r#"
            INSERT INTO submissions
                (id, created_at, match_id, uname, description, "show",
                 hero_to_watch, reviewed, status, matchtime, ingame_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(id)
        .bind(submission.timestamp)
        .bind(submission.match_id)
        .bind(&submission.name)
        .bind(&submission.description)
        .bind(submission.category_code_or_fallback())
        .bind(&submission.hero)
        .bind(submission.reviewed)
        .bind(submission.status)
        .bind(submission.match_time)
        .bind(&submission.ingame_time)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if db_err.is_unique_violation() && db_err.constraint() == Some(MATCH_ID_CONSTRAINT) =>
            {
                Err(StoreError::Duplicate {
                    match_id: submission.match_id,
                })
            }
            Err(sqlx::Error::Database(db_err))
                if db_err.is_unique_violation() && db_err.constraint() == Some(ID_CONSTRAINT) =>
            {
                Err(StoreError::IdConflict { id: id.to_string() })
            }
            Err(err) => Err(anyhow::Error::new(err)
                .context(format!("inserting submission for match {}", submission.match_id))
                .into()),
        }
    }
}

/// Process-local store with the same uniqueness rules as the database (one
/// record per match id, one record per id).
#[derive(Debug, Default)]
pub struct MemorySubmissionStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: HashMap<i64, Submission>,
    /// Records that exist but are not yet visible to `count_by_match_id`.
    hidden: HashSet<i64>,
    failing_inserts: HashSet<i64>,
    fail_counts: bool,
}

impl MemorySubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn get(&self, match_id: i64) -> Option<Submission> {
        self.state.lock().await.records.get(&match_id).cloned()
    }

    pub async fn match_ids(&self) -> Vec<i64> {
        let mut ids = self
            .state
            .lock()
            .await
            .records
            .keys()
            .copied()
            .collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }
}

/// Seeding and failure injection for exercising the writer and engine.
#[cfg(any(test, feature = "test-support"))]
impl MemorySubmissionStore {
    /// Seeds a record directly, bypassing the writer.
    pub async fn seed(&self, submission: Submission) {
        let mut state = self.state.lock().await;
        state.records.insert(submission.match_id, submission);
    }

    /// Seeds a record that the count query cannot see yet, as if another
    /// writer committed it between our check and our insert.
    pub async fn seed_concurrent(&self, submission: Submission) {
        let mut state = self.state.lock().await;
        state.hidden.insert(submission.match_id);
        state.records.insert(submission.match_id, submission);
    }

    pub async fn fail_inserts_for(&self, match_id: i64) {
        self.state.lock().await.failing_inserts.insert(match_id);
    }

    pub async fn clear_insert_failures(&self) {
        self.state.lock().await.failing_inserts.clear();
    }

    pub async fn set_count_failures(&self, fail: bool) {
        self.state.lock().await.fail_counts = fail;
    }
}

#[async_trait]
impl SubmissionStore for MemorySubmissionStore {
    async fn count_by_match_id(&self, match_id: i64) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        if state.fail_counts {
            return Err(anyhow::anyhow!("store unavailable").into());
        }
        let visible = state.records.contains_key(&match_id) && !state.hidden.contains(&match_id);
        Ok(i64::from(visible))
    }

    async fn insert(&self, submission: &Submission) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.failing_inserts.contains(&submission.match_id) {
            return Err(anyhow::anyhow!("write timed out for match {}", submission.match_id).into());
        }
        if state.records.contains_key(&submission.match_id) {
            return Err(StoreError::Duplicate {
                match_id: submission.match_id,
            });
        }
        let Some(id) = submission.id.as_deref() else {
            return Err(anyhow::anyhow!("submission id must be assigned before insert").into());
        };
        if state.records.values().any(|r| r.id.as_deref() == Some(id)) {
            return Err(StoreError::IdConflict { id: id.to_string() });
        }
        state.records.insert(submission.match_id, submission.clone());
        Ok(())
    }
}

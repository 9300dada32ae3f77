//! Core domain model for replay submission ingest: the submission record,
//! the acceptance policy and show category normalization.

use chrono::{DateTime, TimeZone, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ingest-core";

/// Length of locally generated submission identifiers.
pub const SUBMISSION_ID_LEN: usize = 8;

/// Code used for any category label that is not in the lookup table.
pub const FALLBACK_CATEGORY: &str = "top";

/// Lowercase show label -> canonical show code.
const CATEGORY_CODES: &[(&str, &str)] = &[
    ("fails of the week", "fail"),
    ("rampage", "rampage"),
    ("headshot", "headshot"),
    ("symphony of skills", "sos"),
    ("sos", "sos"),
    ("top plays", "top"),
];

/// Maps a free-text show label to its canonical code, falling back to
/// [`FALLBACK_CATEGORY`].
pub fn normalize_category(label: &str) -> &'static str {
    let label = label.to_lowercase();
    CATEGORY_CODES
        .iter()
        .find(|(name, _)| *name == label)
        .map(|(_, code)| *code)
        .unwrap_or(FALLBACK_CATEGORY)
}

/// Random `[A-Za-z0-9]` identifier for a submission that arrived without one.
pub fn generate_submission_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SUBMISSION_ID_LEN)
        .map(char::from)
        .collect()
}

/// One candidate replay event extracted from one spreadsheet row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    #[serde(rename = "_id", default)]
    pub id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "matchID")]
    pub match_id: i64,
    pub name: String,
    pub description: String,
    #[serde(rename = "showName")]
    pub category_raw: String,
    #[serde(rename = "showCode", default)]
    pub category_code: Option<String>,
    pub hero: String,
    /// Set once the source row is known to be handled. Never persisted.
    pub imported: bool,
    pub reviewed: bool,
    pub status: i32,
    /// Deprecated seconds-into-match field, always zero.
    #[serde(rename = "matchtime")]
    pub match_time: i32,
    pub ingame_time: String,
    /// Zero-based index of the data row this submission was parsed from.
    #[serde(skip)]
    pub row_index: usize,
}

impl Submission {
    /// Resolves `category_code` from `category_raw`.
    pub fn normalize_category(&mut self) {
        self.category_code = Some(normalize_category(&self.category_raw).to_string());
    }

    /// Assigns a fresh identifier unless one is already present.
    pub fn ensure_id(&mut self) -> &str {
        self.id.get_or_insert_with(generate_submission_id)
    }

    /// Category code to persist; unresolved submissions use the fallback.
    pub fn category_code_or_fallback(&self) -> &str {
        self.category_code.as_deref().unwrap_or(FALLBACK_CATEGORY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("timestamp too early: {timestamp} < {earliest}")]
    TimestampTooEarly {
        timestamp: DateTime<Utc>,
        earliest: DateTime<Utc>,
    },
    #[error("match id too low: {match_id} < {minimum}")]
    MatchIdTooLow { match_id: i64, minimum: i64 },
}

/// Minimum acceptable values for a submission to be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionPolicy {
    pub earliest_timestamp: DateTime<Utc>,
    pub min_match_id: i64,
}

impl SubmissionPolicy {
    pub const DEFAULT_MIN_MATCH_ID: i64 = 5_118_704_000;

    pub fn default_earliest_timestamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 1, 1, 1, 1, 1)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn validate(&self, submission: &Submission) -> Result<(), ValidationError> {
        if submission.timestamp < self.earliest_timestamp {
            return Err(ValidationError::TimestampTooEarly {
                timestamp: submission.timestamp,
                earliest: self.earliest_timestamp,
            });
        }
        if submission.match_id < self.min_match_id {
            return Err(ValidationError::MatchIdTooLow {
                match_id: submission.match_id,
                minimum: self.min_match_id,
            });
        }
        Ok(())
    }
}

impl Default for SubmissionPolicy {
    fn default() -> Self {
        Self {
            earliest_timestamp: Self::default_earliest_timestamp(),
            min_match_id: Self::DEFAULT_MIN_MATCH_ID,
        }
    }
}

//! Postgres store checks. They run only when `INGEST_TEST_DATABASE_URL` points
//! at a database the tests may write to.

use chrono::{TimeZone, Utc};
use ingest_core::Submission;
use ingest_storage::{DedupWriter, PgSubmissionStore, SubmissionStore, WriteOutcome};
use sqlx::postgres::PgPoolOptions;

const MATCH_A: i64 = 5_399_000_001;
const MATCH_B: i64 = 5_399_000_002;
const MATCH_C: i64 = 5_399_000_003;

fn mk_submission(match_id: i64, id: &str) -> Submission {
    Submission {
        id: Some(id.to_string()),
        timestamp: Utc.with_ymd_and_hms(2020, 3, 4, 5, 6, 7).single().unwrap(),
        match_id,
        name: "caster".into(),
        description: "teamwipe".into(),
        category_raw: "Rampage".into(),
        category_code: Some("rampage".into()),
        hero: "Tidehunter".into(),
        imported: false,
        reviewed: false,
        status: 0,
        match_time: 0,
        ingame_time: "31:02".into(),
        row_index: 0,
    }
}

/// Connects, migrates and removes rows left behind by an earlier run.
async fn connect(match_ids: &[i64], ids: &[&str]) -> Option<(PgSubmissionStore, sqlx::PgPool)> {
    let url = std::env::var("INGEST_TEST_DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .expect("connect test database");
    let store = PgSubmissionStore::from_pool(pool.clone());
    store.migrate().await.expect("migrate");
    sqlx::query("DELETE FROM submissions WHERE match_id = ANY($1) OR id = ANY($2)")
        .bind(match_ids.to_vec())
        .bind(ids.iter().map(|id| id.to_string()).collect::<Vec<_>>())
        .execute(&pool)
        .await
        .expect("clean fixtures");
    Some((store, pool))
}

#[tokio::test]
async fn id_clash_is_not_reported_as_duplicate_match() {
    let Some((store, pool)) = connect(&[MATCH_A, MATCH_B], &["deadbeef"]).await else {
        eprintln!("INGEST_TEST_DATABASE_URL not set, skipping");
        return;
    };

    let mut writer = DedupWriter::new(store);
    let first = writer
        .write(&mut mk_submission(MATCH_A, "deadbeef"))
        .await
        .expect("first write");
    assert_eq!(first, WriteOutcome::Inserted);

    let mut second = mk_submission(MATCH_B, "deadbeef");
    let outcome = writer.write(&mut second).await.expect("second write");
    assert_eq!(outcome, WriteOutcome::Inserted);
    assert_ne!(second.id.as_deref(), Some("deadbeef"));

    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM submissions WHERE match_id = $1")
        .bind(MATCH_B)
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(stored, 1);
}

#[tokio::test]
async fn same_match_twice_is_already_present() {
    let Some((store, _pool)) = connect(&[MATCH_C], &["pgfirst0", "pgsecond"]).await else {
        eprintln!("INGEST_TEST_DATABASE_URL not set, skipping");
        return;
    };

    store
        .insert(&mk_submission(MATCH_C, "pgfirst0"))
        .await
        .expect("first insert");
    let mut writer = DedupWriter::new(store);
    let outcome = writer
        .write(&mut mk_submission(MATCH_C, "pgsecond"))
        .await
        .expect("second write");

    assert_eq!(outcome, WriteOutcome::AlreadyPresent);
    assert_eq!(writer.store().count_by_match_id(MATCH_C).await.expect("count"), 1);
}

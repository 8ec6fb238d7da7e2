// Runs against a real database only when TEST_DATABASE_URL is set.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use jobetl_core::{JobListing, RecordOutcome, RunStatus, UpsertOutcome};
use jobetl_storage::{
    connect_pool, run_migrations, FinalStatus, ListingStore, PgListingStore, PgRunStore,
    RunStore, RunTracker,
};
use serde_json::json;
use sqlx::PgPool;

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = connect_pool(&url, 2).await.expect("connect");
    run_migrations(&pool).await.expect("migrate");
    Some(pool)
}

fn unique_id(prefix: &str) -> String {
    format!(
        "{prefix}-{}",
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

#[tokio::test]
async fn upsert_is_idempotent_on_position_id() {
    let Some(pool) = test_pool().await else {
        eprintln!("TEST_DATABASE_URL not set; skipping");
        return;
    };
    let store = PgListingStore::new(pool.clone());
    let id = unique_id("TEST-UPSERT");

    let mut listing = JobListing::new(id.clone(), "Original Title");
    listing.position_location = Some(json!([{"CityName": "Chicago, Illinois"}]));
    listing.city_name = Some("Chicago, Illinois".into());
    listing.min_salary = Some(90_000);
    listing.application_close_date = NaiveDate::from_ymd_opt(2025, 10, 1);

    assert_eq!(store.upsert(&listing).await, Ok(UpsertOutcome::Inserted));
    let first = store.get(&id).await.expect("get").expect("row");

    listing.position_title = "Updated Title".into();
    listing.min_salary = None;
    assert_eq!(store.upsert(&listing).await, Ok(UpsertOutcome::Updated));
    let second = store.get(&id).await.expect("get").expect("row");

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_listings WHERE position_id = $1")
        .bind(&id)
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(rows, 1);
    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at > first.updated_at);
    assert!(second.etl_timestamp > first.etl_timestamp);
    assert_eq!(second.listing.position_title, "Updated Title");
    assert_eq!(second.listing.min_salary, None);
    assert_eq!(second.listing.position_location, listing.position_location);
    assert_eq!(second.listing.application_close_date, listing.application_close_date);

    sqlx::query("DELETE FROM job_listings WHERE position_id = $1")
        .bind(&id)
        .execute(&pool)
        .await
        .expect("cleanup");
}

#[tokio::test]
async fn run_rows_are_finalized_exactly_once() {
    let Some(pool) = test_pool().await else {
        eprintln!("TEST_DATABASE_URL not set; skipping");
        return;
    };
    let store = Arc::new(PgRunStore::new(pool.clone()));
    let tracker = RunTracker::new(store.clone());

    let run = tracker.start_run().await.expect("start");
    let run_id = run.run_id();
    run.record_outcome(RecordOutcome::Inserted);
    run.record_outcome(RecordOutcome::Failed);
    tracker.checkpoint(&run).await.expect("checkpoint");

    let finished = tracker
        .finish_run(run, FinalStatus::Success)
        .await
        .expect("finish");
    assert!(store.finalize_run(&finished).await.is_err());

    let stored = store.get_run(run_id).await.expect("get").expect("row");
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.counters.records_processed, 2);
    assert_eq!(stored.counters.records_failed, 1);
    assert!(stored.completed_at.is_some());
    assert!(stored.error_message.is_none());

    let recent = store.recent_runs(5).await.expect("recent");
    assert!(recent.iter().any(|r| r.run_id == run_id));
}

//! sqlx/Postgres implementations of the listing and run stores.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobetl_core::{EtlRun, JobListing, RunCounters, RunStatus, StoredListing, UpsertOutcome};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::{classify_sqlx_error, is_transient_link_error, ListingStore, RunStore, WriteError};

pub async fn connect_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

/// Creates `job_listings` and `etl_runs` when missing. Safe to run on every start.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("running database migrations")?;
    info!("database schema is up to date");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A broken link fails only this record unless the pool cannot reach
    /// the server either.
    async fn link_failure(&self, listing: &JobListing, err: sqlx::Error) -> WriteError {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => {
                warn!(position_id = %listing.position_id, error = %err, "transient storage error");
                WriteError::Rejected(err.to_string())
            }
            Err(probe) => WriteError::ConnectionLost(format!("{err}; health check: {probe}")),
        }
    }
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn upsert(&self, listing: &JobListing) -> Result<UpsertOutcome, WriteError> {
        // xmax is 0 only for a freshly inserted tuple.
        let row = sqlx::query(
            r#"
            INSERT INTO job_listings (
                position_id, position_title, position_uri, position_location,
                city_name, state_code, organization_name, department_name,
                position_remuneration, min_salary, max_salary,
                position_start_date, position_end_date,
                publication_start_date, application_close_date,
                job_summary, job_category, job_grade,
                created_at, updated_at, etl_timestamp
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18,
                NOW(), NOW(), NOW()
            )
            ON CONFLICT (position_id) DO UPDATE SET
                position_title = EXCLUDED.position_title,
                position_uri = EXCLUDED.position_uri,
                position_location = EXCLUDED.position_location,
                city_name = EXCLUDED.city_name,
                state_code = EXCLUDED.state_code,
                organization_name = EXCLUDED.organization_name,
                department_name = EXCLUDED.department_name,
                position_remuneration = EXCLUDED.position_remuneration,
                min_salary = EXCLUDED.min_salary,
                max_salary = EXCLUDED.max_salary,
                position_start_date = EXCLUDED.position_start_date,
                position_end_date = EXCLUDED.position_end_date,
                publication_start_date = EXCLUDED.publication_start_date,
                application_close_date = EXCLUDED.application_close_date,
                job_summary = EXCLUDED.job_summary,
                job_category = EXCLUDED.job_category,
                job_grade = EXCLUDED.job_grade,
                updated_at = NOW(),
                etl_timestamp = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&listing.position_id)
        .bind(&listing.position_title)
        .bind(&listing.position_uri)
        .bind(&listing.position_location)
        .bind(&listing.city_name)
        .bind(&listing.state_code)
        .bind(&listing.organization_name)
        .bind(&listing.department_name)
        .bind(&listing.position_remuneration)
        .bind(listing.min_salary)
        .bind(listing.max_salary)
        .bind(listing.position_start_date)
        .bind(listing.position_end_date)
        .bind(listing.publication_start_date)
        .bind(listing.application_close_date)
        .bind(&listing.job_summary)
        .bind(&listing.job_category)
        .bind(&listing.job_grade)
        .fetch_one(&self.pool)
        .await;

        let row = match row {
            Ok(row) => row,
            Err(err) if is_transient_link_error(&err) => {
                return Err(self.link_failure(listing, err).await)
            }
            Err(err) => return Err(classify_sqlx_error(err)),
        };

        let inserted: bool = row.try_get("inserted").map_err(classify_sqlx_error)?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn get(&self, position_id: &str) -> Result<Option<StoredListing>, WriteError> {
        let row = sqlx::query(
            r#"
            SELECT position_id, position_title, position_uri, position_location,
                   city_name, state_code, organization_name, department_name,
                   position_remuneration, min_salary, max_salary,
                   position_start_date, position_end_date,
                   publication_start_date, application_close_date,
                   job_summary, job_category, job_grade,
                   created_at, updated_at, etl_timestamp
              FROM job_listings
             WHERE position_id = $1
            "#,
        )
        .bind(position_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        row.map(|r| stored_listing_from_row(&r))
            .transpose()
            .map_err(classify_sqlx_error)
    }

    async fn count(&self) -> Result<u64, WriteError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_listings")
            .fetch_one(&self.pool)
            .await
            .map_err(classify_sqlx_error)?;
        Ok(from_db_count(total))
    }
}

fn stored_listing_from_row(row: &PgRow) -> Result<StoredListing, sqlx::Error> {
    Ok(StoredListing {
        listing: JobListing {
            position_id: row.try_get("position_id")?,
            position_title: row.try_get("position_title")?,
            position_uri: row.try_get("position_uri")?,
            position_location: row.try_get("position_location")?,
            city_name: row.try_get("city_name")?,
            state_code: row.try_get("state_code")?,
            organization_name: row.try_get("organization_name")?,
            department_name: row.try_get("department_name")?,
            position_remuneration: row.try_get("position_remuneration")?,
            min_salary: row.try_get("min_salary")?,
            max_salary: row.try_get("max_salary")?,
            position_start_date: row.try_get("position_start_date")?,
            position_end_date: row.try_get("position_end_date")?,
            publication_start_date: row.try_get("publication_start_date")?,
            application_close_date: row.try_get("application_close_date")?,
            job_summary: row.try_get("job_summary")?,
            job_category: row.try_get("job_category")?,
            job_grade: row.try_get("job_grade")?,
        },
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        etl_timestamp: row.try_get("etl_timestamp")?,
    })
}

#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn create_run(&self, started_at: DateTime<Utc>) -> Result<i64, WriteError> {
        sqlx::query_scalar(
            r#"
            INSERT INTO etl_runs (started_at, status)
            VALUES ($1, 'running')
            RETURNING run_id
            "#,
        )
        .bind(started_at)
        .fetch_one(&self.pool)
        .await
        .map_err(classify_sqlx_error)
    }

    async fn save_progress(&self, run: &EtlRun) -> Result<(), WriteError> {
        sqlx::query(
            r#"
            UPDATE etl_runs
               SET records_processed = $2,
                   records_inserted = $3,
                   records_updated = $4,
                   records_failed = $5
             WHERE run_id = $1
               AND status = 'running'
            "#,
        )
        .bind(run.run_id)
        .bind(to_db_count(run.counters.records_processed))
        .bind(to_db_count(run.counters.records_inserted))
        .bind(to_db_count(run.counters.records_updated))
        .bind(to_db_count(run.counters.records_failed))
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;
        Ok(())
    }

    async fn finalize_run(&self, run: &EtlRun) -> Result<(), WriteError> {
        let result = sqlx::query(
            r#"
            UPDATE etl_runs
               SET completed_at = $2,
                   records_processed = $3,
                   records_inserted = $4,
                   records_updated = $5,
                   records_failed = $6,
                   status = $7,
                   error_message = $8
             WHERE run_id = $1
               AND status = 'running'
            "#,
        )
        .bind(run.run_id)
        .bind(run.completed_at)
        .bind(to_db_count(run.counters.records_processed))
        .bind(to_db_count(run.counters.records_inserted))
        .bind(to_db_count(run.counters.records_updated))
        .bind(to_db_count(run.counters.records_failed))
        .bind(run.status.as_str())
        .bind(&run.error_message)
        .execute(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(WriteError::Rejected(format!(
                "etl run {} is not running",
                run.run_id
            )));
        }
        Ok(())
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<EtlRun>, WriteError> {
        let row = sqlx::query(
            r#"
            SELECT run_id, started_at, completed_at,
                   records_processed, records_inserted, records_updated, records_failed,
                   status, error_message
              FROM etl_runs
             WHERE run_id = $1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        row.map(|r| etl_run_from_row(&r)).transpose()
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<EtlRun>, WriteError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, started_at, completed_at,
                   records_processed, records_inserted, records_updated, records_failed,
                   status, error_message
              FROM etl_runs
             ORDER BY run_id DESC
             LIMIT $1
            "#,
        )
        .bind(to_db_count(limit as u64))
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        rows.iter().map(etl_run_from_row).collect()
    }
}

fn etl_run_from_row(row: &PgRow) -> Result<EtlRun, WriteError> {
    let status: String = row.try_get("status").map_err(classify_sqlx_error)?;
    let status = status
        .parse::<RunStatus>()
        .map_err(|e| WriteError::Rejected(e.to_string()))?;
    let count = |column: &str| -> Result<u64, WriteError> {
        let value: i64 = row.try_get(column).map_err(classify_sqlx_error)?;
        Ok(from_db_count(value))
    };

    Ok(EtlRun {
        run_id: row.try_get("run_id").map_err(classify_sqlx_error)?,
        started_at: row.try_get("started_at").map_err(classify_sqlx_error)?,
        completed_at: row.try_get("completed_at").map_err(classify_sqlx_error)?,
        counters: RunCounters {
            records_processed: count("records_processed")?,
            records_inserted: count("records_inserted")?,
            records_updated: count("records_updated")?,
            records_failed: count("records_failed")?,
        },
        status,
        error_message: row.try_get("error_message").map_err(classify_sqlx_error)?,
    })
}

fn to_db_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

//! Persistence + HTTP fetch utilities for the job listings ETL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobetl_core::{EtlRun, JobListing, StoredListing, UpsertOutcome};
use thiserror::Error;

pub mod http;
pub mod memory;
pub mod postgres;
pub mod runs;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition, SimpleTokenBucket, TokenBucketConfig,
};
pub use memory::{MemoryListingStore, MemoryRunStore};
pub use postgres::{connect_pool, run_migrations, PgListingStore, PgRunStore};
pub use runs::{ActiveRun, FinalStatus, RunCounterHandle, RunTracker};

pub const CRATE_NAME: &str = "jobetl-storage";

/// Storage write failure, split by whether the connection itself is gone.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WriteError {
    #[error("storage connection lost: {0}")]
    ConnectionLost(String),
    #[error("write rejected: {0}")]
    Rejected(String),
}

impl WriteError {
    /// Connection-level faults end the run; everything else stays with the record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WriteError::ConnectionLost(_))
    }
}

/// Only pool-level failures are fatal here. A broken link on one pooled
/// connection stays with the record; see [`is_transient_link_error`].
pub fn classify_sqlx_error(err: sqlx::Error) -> WriteError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            WriteError::ConnectionLost(err.to_string())
        }
        other => WriteError::Rejected(other.to_string()),
    }
}

/// Errors that may mean one dead connection or the whole server; callers
/// check pool health before treating them as fatal.
pub fn is_transient_link_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_)
    )
}

/// Keyed "insert or update" storage for listings.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Single conditional write keyed by `position_id`.
    async fn upsert(&self, listing: &JobListing) -> Result<UpsertOutcome, WriteError>;

    async fn get(&self, position_id: &str) -> Result<Option<StoredListing>, WriteError>;

    async fn count(&self) -> Result<u64, WriteError>;
}

/// Durable home of `etl_runs` rows. Use through [`RunTracker`].
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, started_at: DateTime<Utc>) -> Result<i64, WriteError>;

    /// Persists the counters of a run that is still `running`.
    async fn save_progress(&self, run: &EtlRun) -> Result<(), WriteError>;

    /// Writes the terminal state. Rejects runs that are already finalized.
    async fn finalize_run(&self, run: &EtlRun) -> Result<(), WriteError>;

    async fn get_run(&self, run_id: i64) -> Result<Option<EtlRun>, WriteError>;

    async fn recent_runs(&self, limit: usize) -> Result<Vec<EtlRun>, WriteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_connection_level() {
        assert!(classify_sqlx_error(sqlx::Error::PoolTimedOut).is_fatal());
        assert!(classify_sqlx_error(sqlx::Error::PoolClosed).is_fatal());
        assert!(classify_sqlx_error(sqlx::Error::WorkerCrashed).is_fatal());
    }

    #[test]
    fn connection_reset_stays_with_the_record() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = sqlx::Error::Io(io);
        assert!(is_transient_link_error(&err));
        let classified = classify_sqlx_error(err);
        assert!(!classified.is_fatal());
        assert!(matches!(classified, WriteError::Rejected(_)));
        assert!(!is_transient_link_error(&sqlx::Error::PoolClosed));
    }

    #[test]
    fn row_level_errors_stay_with_the_record() {
        let err = classify_sqlx_error(sqlx::Error::RowNotFound);
        assert!(!err.is_fatal());
        assert!(matches!(err, WriteError::Rejected(_)));
        let err = classify_sqlx_error(sqlx::Error::ColumnNotFound("city_name".into()));
        assert!(!err.is_fatal());
    }
}

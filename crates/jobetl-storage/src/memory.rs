//! In-process stores backing dry runs and tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobetl_core::{EtlRun, JobListing, StoredListing, UpsertOutcome};
use tokio::sync::Mutex;

use crate::{classify_sqlx_error, ListingStore, RunStore, WriteError};

#[derive(Debug, Default)]
pub struct MemoryListingStore {
    state: Mutex<ListingState>,
}

#[derive(Debug, Default)]
struct ListingState {
    rows: BTreeMap<String, StoredListing>,
    rejected_ids: HashMap<String, String>,
    connection_budget: Option<usize>,
    connection_resets: usize,
    writes: usize,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write of `position_id` fails with [`WriteError::Rejected`].
    pub async fn reject_writes_for(&self, position_id: impl Into<String>, reason: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.rejected_ids.insert(position_id.into(), reason.into());
    }

    /// After `successful_writes` more writes, every write fails with
    /// [`WriteError::ConnectionLost`].
    pub async fn lose_connection_after(&self, successful_writes: usize) {
        let mut state = self.state.lock().await;
        state.connection_budget = Some(state.writes + successful_writes);
    }

    /// The next `count` writes fail the way a reset pooled connection does;
    /// later writes succeed.
    pub async fn reset_connection_for_next(&self, count: usize) {
        self.state.lock().await.connection_resets = count;
    }

    pub async fn rows(&self) -> Vec<StoredListing> {
        self.state.lock().await.rows.values().cloned().collect()
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn upsert(&self, listing: &JobListing) -> Result<UpsertOutcome, WriteError> {
        let mut state = self.state.lock().await;
        if let Some(budget) = state.connection_budget {
            if state.writes >= budget {
                return Err(WriteError::ConnectionLost(
                    "in-memory store connection dropped".to_string(),
                ));
            }
        }
        if state.connection_resets > 0 {
            state.connection_resets -= 1;
            let reset = std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            );
            return Err(classify_sqlx_error(sqlx::Error::Io(reset)));
        }
        if let Some(reason) = state.rejected_ids.get(&listing.position_id) {
            return Err(WriteError::Rejected(format!(
                "{}: {reason}",
                listing.position_id
            )));
        }
        state.writes += 1;

        let now = Utc::now();
        match state.rows.get_mut(&listing.position_id) {
            Some(existing) => {
                existing.listing = listing.clone();
                existing.updated_at = now;
                existing.etl_timestamp = now;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                state.rows.insert(
                    listing.position_id.clone(),
                    StoredListing {
                        listing: listing.clone(),
                        created_at: now,
                        updated_at: now,
                        etl_timestamp: now,
                    },
                );
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn get(&self, position_id: &str) -> Result<Option<StoredListing>, WriteError> {
        Ok(self.state.lock().await.rows.get(position_id).cloned())
    }

    async fn count(&self) -> Result<u64, WriteError> {
        Ok(self.state.lock().await.rows.len() as u64)
    }
}

#[derive(Debug, Default)]
pub struct MemoryRunStore {
    runs: Mutex<Vec<EtlRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_runs(&self) -> Vec<EtlRun> {
        self.runs.lock().await.clone()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, started_at: DateTime<Utc>) -> Result<i64, WriteError> {
        let mut runs = self.runs.lock().await;
        let run_id = runs.len() as i64 + 1;
        runs.push(EtlRun::started(run_id, started_at));
        Ok(run_id)
    }

    async fn save_progress(&self, run: &EtlRun) -> Result<(), WriteError> {
        let mut runs = self.runs.lock().await;
        if let Some(stored) = runs
            .iter_mut()
            .find(|r| r.run_id == run.run_id && !r.status.is_terminal())
        {
            stored.counters = run.counters;
        }
        Ok(())
    }

    async fn finalize_run(&self, run: &EtlRun) -> Result<(), WriteError> {
        let mut runs = self.runs.lock().await;
        match runs
            .iter_mut()
            .find(|r| r.run_id == run.run_id && !r.status.is_terminal())
        {
            Some(stored) => {
                *stored = run.clone();
                Ok(())
            }
            None => Err(WriteError::Rejected(format!(
                "etl run {} is not running",
                run.run_id
            ))),
        }
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<EtlRun>, WriteError> {
        Ok(self
            .runs
            .lock()
            .await
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<EtlRun>, WriteError> {
        Ok(self
            .runs
            .lock()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

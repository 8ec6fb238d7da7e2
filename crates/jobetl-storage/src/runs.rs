//! Run bookkeeping: one `etl_runs` row per pipeline execution.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobetl_core::{EtlRun, RecordOutcome, RunCounters, RunStatus};
use tracing::info;

use crate::{RunStore, WriteError};

/// Terminal state handed to [`RunTracker::finish_run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalStatus {
    Success,
    Failed(String),
}

/// Lock-free counters shared by every worker of one run.
#[derive(Debug, Default)]
pub struct RunCounterHandle {
    processed: AtomicU64,
    inserted: AtomicU64,
    updated: AtomicU64,
    failed: AtomicU64,
}

impl RunCounterHandle {
    /// Counts one attempted record. Call exactly once per record.
    pub fn record(&self, outcome: RecordOutcome) {
        let counter = match outcome {
            RecordOutcome::Inserted => &self.inserted,
            RecordOutcome::Updated => &self.updated,
            RecordOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> RunCounters {
        RunCounters {
            records_processed: self.processed.load(Ordering::SeqCst),
            records_inserted: self.inserted.load(Ordering::SeqCst),
            records_updated: self.updated.load(Ordering::SeqCst),
            records_failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

/// A started, not yet finalized run. Consumed by [`RunTracker::finish_run`],
/// so a run cannot be finished twice or finished without being started.
#[derive(Debug)]
pub struct ActiveRun {
    run_id: i64,
    started_at: DateTime<Utc>,
    counters: Arc<RunCounterHandle>,
}

impl ActiveRun {
    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn record_outcome(&self, outcome: RecordOutcome) {
        self.counters.record(outcome);
    }

    /// Shared handle for concurrent workers.
    pub fn counters(&self) -> Arc<RunCounterHandle> {
        Arc::clone(&self.counters)
    }

    pub fn snapshot(&self) -> EtlRun {
        EtlRun {
            counters: self.counters.snapshot(),
            ..EtlRun::started(self.run_id, self.started_at)
        }
    }
}

#[derive(Clone)]
pub struct RunTracker {
    store: Arc<dyn RunStore>,
}

impl RunTracker {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub async fn start_run(&self) -> Result<ActiveRun, WriteError> {
        let started_at = Utc::now();
        let run_id = self.store.create_run(started_at).await?;
        info!(run_id, %started_at, "etl run started");
        Ok(ActiveRun {
            run_id,
            started_at,
            counters: Arc::new(RunCounterHandle::default()),
        })
    }

    /// Persists the counters so far; the run stays `running`.
    pub async fn checkpoint(&self, run: &ActiveRun) -> Result<(), WriteError> {
        self.store.save_progress(&run.snapshot()).await
    }

    pub async fn finish_run(
        &self,
        run: ActiveRun,
        status: FinalStatus,
    ) -> Result<EtlRun, WriteError> {
        let mut record = run.snapshot();
        record.completed_at = Some(Utc::now());
        match status {
            FinalStatus::Success => record.status = RunStatus::Success,
            FinalStatus::Failed(message) => {
                record.status = RunStatus::Failed;
                record.error_message = Some(message);
            }
        }
        self.store.finalize_run(&record).await?;
        info!(
            run_id = record.run_id,
            status = %record.status,
            processed = record.counters.records_processed,
            inserted = record.counters.records_inserted,
            updated = record.counters.records_updated,
            failed = record.counters.records_failed,
            "etl run finished"
        );
        Ok(record)
    }
}

//! Core domain model for the job listings ETL.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "jobetl-core";

/// Normalized listing handed from the mapper to the upsert writer.
///
/// Structured source fields are kept verbatim next to the scalars derived
/// from them; a scalar is `None` whenever it could not be extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobListing {
    pub position_id: String,
    pub position_title: String,
    pub position_uri: Option<String>,
    pub position_location: Option<JsonValue>,
    pub city_name: Option<String>,
    pub state_code: Option<String>,
    pub organization_name: Option<String>,
    pub department_name: Option<String>,
    pub position_remuneration: Option<JsonValue>,
    pub min_salary: Option<i64>,
    pub max_salary: Option<i64>,
    pub position_start_date: Option<NaiveDate>,
    pub position_end_date: Option<NaiveDate>,
    pub publication_start_date: Option<NaiveDate>,
    pub application_close_date: Option<NaiveDate>,
    pub job_summary: Option<String>,
    pub job_category: Option<JsonValue>,
    pub job_grade: Option<JsonValue>,
}

impl JobListing {
    /// A listing with only the required fields set.
    pub fn new(position_id: impl Into<String>, position_title: impl Into<String>) -> Self {
        Self {
            position_id: position_id.into(),
            position_title: position_title.into(),
            position_uri: None,
            position_location: None,
            city_name: None,
            state_code: None,
            organization_name: None,
            department_name: None,
            position_remuneration: None,
            min_salary: None,
            max_salary: None,
            position_start_date: None,
            position_end_date: None,
            publication_start_date: None,
            application_close_date: None,
            job_summary: None,
            job_category: None,
            job_grade: None,
        }
    }
}

/// Persisted listing row with its bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredListing {
    pub listing: JobListing,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub etl_timestamp: DateTime<Utc>,
}

/// Result of a successful conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Per-record result fed into the run counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOutcome {
    Inserted,
    Updated,
    Failed,
}

impl From<UpsertOutcome> for RecordOutcome {
    fn from(outcome: UpsertOutcome) -> Self {
        match outcome {
            UpsertOutcome::Inserted => RecordOutcome::Inserted,
            UpsertOutcome::Updated => RecordOutcome::Updated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown run status {0:?}")]
pub struct UnknownRunStatus(pub String);

impl FromStr for RunStatus {
    type Err = UnknownRunStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(UnknownRunStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub records_processed: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_failed: u64,
}

impl RunCounters {
    pub fn record(&mut self, outcome: RecordOutcome) {
        self.records_processed += 1;
        match outcome {
            RecordOutcome::Inserted => self.records_inserted += 1,
            RecordOutcome::Updated => self.records_updated += 1,
            RecordOutcome::Failed => self.records_failed += 1,
        }
    }

    /// `processed == inserted + updated + failed`
    pub fn is_balanced(&self) -> bool {
        self.records_processed
            == self.records_inserted + self.records_updated + self.records_failed
    }
}

/// Audit record for one pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtlRun {
    pub run_id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub counters: RunCounters,
    pub status: RunStatus,
    pub error_message: Option<String>,
}

impl EtlRun {
    pub fn started(run_id: i64, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            completed_at: None,
            counters: RunCounters::default(),
            status: RunStatus::Running,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips_through_storage_text() {
        for status in [RunStatus::Running, RunStatus::Success, RunStatus::Failed] {
            assert_eq!(status.as_str().parse::<RunStatus>(), Ok(status));
        }
        assert_eq!("SUCCESS".parse::<RunStatus>(), Ok(RunStatus::Success));
        let err = "done".parse::<RunStatus>().expect_err("unknown");
        assert_eq!(err.to_string(), "unknown run status \"done\"");
        let _: &dyn std::error::Error = &err;
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn counters_stay_balanced() {
        let mut counters = RunCounters::default();
        counters.record(RecordOutcome::Inserted);
        counters.record(RecordOutcome::Updated);
        counters.record(RecordOutcome::Failed);
        counters.record(UpsertOutcome::Inserted.into());
        assert_eq!(counters.records_processed, 4);
        assert_eq!(counters.records_inserted, 2);
        assert_eq!(counters.records_updated, 1);
        assert_eq!(counters.records_failed, 1);
        assert!(counters.is_balanced());
    }
}

//! ETL orchestration: page through the source, map each record, upsert it,
//! and keep the run row current.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use jobetl_adapters::{
    map_listing, FixtureJobSource, JobSource, MapOptions, UsaJobsClient, UsaJobsClientConfig,
};
use jobetl_core::{EtlRun, JobListing, RecordOutcome};
use jobetl_storage::{
    connect_pool, run_migrations, ActiveRun, FetchError, FinalStatus, ListingStore,
    MemoryListingStore, MemoryRunStore, PgListingStore, PgRunStore, RunStore, RunTracker,
    WriteError,
};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

pub mod config;

pub use config::EtlConfig;

pub const CRATE_NAME: &str = "jobetl-sync";

/// Why a run stopped early. Anything not listed here is absorbed per record.
#[derive(Debug, Error)]
pub enum RunFault {
    #[error("fetching page {page} failed: {source}")]
    Fetch {
        page: u32,
        #[source]
        source: FetchError,
    },
    #[error("storage unavailable: {0}")]
    StorageLost(WriteError),
}

/// Serializes writes that share a position id across the workers of one batch.
#[derive(Debug, Default)]
struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocks {
    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

pub struct EtlPipeline {
    config: EtlConfig,
    source: Arc<dyn JobSource>,
    listings: Arc<dyn ListingStore>,
    tracker: RunTracker,
}

impl EtlPipeline {
    pub fn new(
        config: EtlConfig,
        source: Arc<dyn JobSource>,
        listings: Arc<dyn ListingStore>,
        runs: Arc<dyn RunStore>,
    ) -> Self {
        Self {
            config,
            source,
            listings,
            tracker: RunTracker::new(runs),
        }
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    /// Executes one run end to end. Fetch and storage faults end up in the
    /// returned run's status; `Err` means the run row itself could not be
    /// created or finalized.
    pub async fn run_once(&self) -> Result<EtlRun> {
        let run = self
            .tracker
            .start_run()
            .await
            .context("creating etl run record")?;
        let span = info_span!("etl_run", run_id = run.run_id(), source = self.source.source_id());

        let status = match self.extract_and_load(&run).instrument(span.clone()).await {
            Ok(()) => FinalStatus::Success,
            Err(fault) => {
                error!(parent: &span, error = %fault, "etl run aborted");
                FinalStatus::Failed(fault.to_string())
            }
        };

        self.tracker
            .finish_run(run, status)
            .instrument(span)
            .await
            .context("finalizing etl run record")
    }

    async fn extract_and_load(&self, run: &ActiveRun) -> Result<(), RunFault> {
        let query = self.config.search_query();
        let options = self.config.map_options();
        let mut seen = 0u64;

        for page_no in 1..=self.config.max_pages {
            let page = self
                .source
                .fetch_page(&query, page_no)
                .await
                .map_err(|source| RunFault::Fetch {
                    page: page_no,
                    source,
                })?;
            if page.is_empty() {
                info!(page = page_no, "no more results");
                break;
            }

            info!(
                page = page_no,
                items = page.items.len(),
                total_available = ?page.total_available,
                "processing page"
            );
            seen += page.items.len() as u64;
            let total_available = page.total_available;
            self.load_page(run, page.items, &options).await?;

            if total_available.is_some_and(|total| seen >= total) {
                info!(seen, "all available results fetched");
                break;
            }
            if page_no == self.config.max_pages {
                info!(max_pages = self.config.max_pages, "page limit reached");
            }
        }
        Ok(())
    }

    async fn load_page(
        &self,
        run: &ActiveRun,
        items: Vec<JsonValue>,
        options: &MapOptions,
    ) -> Result<(), RunFault> {
        let parallel = self.config.parallel_enabled && self.config.worker_count > 1;
        for batch in items.chunks(self.config.write_batch_size.max(1)) {
            let result = if parallel {
                self.load_batch_parallel(run, batch, options).await
            } else {
                self.load_batch(run, batch, options).await
            };
            if let Err(err) = self.tracker.checkpoint(run).await {
                warn!(error = %err, "failed to checkpoint run progress");
            }
            result?;
        }
        Ok(())
    }

    async fn load_batch(
        &self,
        run: &ActiveRun,
        batch: &[JsonValue],
        options: &MapOptions,
    ) -> Result<(), RunFault> {
        for raw in batch {
            let Some(listing) = map_or_skip(raw, options) else {
                run.record_outcome(RecordOutcome::Failed);
                continue;
            };
            match write_listing(self.listings.as_ref(), &listing).await {
                Ok(outcome) => run.record_outcome(outcome),
                Err(err) => {
                    run.record_outcome(RecordOutcome::Failed);
                    return Err(RunFault::StorageLost(err));
                }
            }
        }
        Ok(())
    }

    async fn load_batch_parallel(
        &self,
        run: &ActiveRun,
        batch: &[JsonValue],
        options: &MapOptions,
    ) -> Result<(), RunFault> {
        let permits = Arc::new(Semaphore::new(self.config.worker_count));
        let aborted = Arc::new(AtomicBool::new(false));
        let key_locks = Arc::new(KeyLocks::default());
        let mut workers = JoinSet::new();

        for raw in batch {
            let Some(listing) = map_or_skip(raw, options) else {
                run.record_outcome(RecordOutcome::Failed);
                continue;
            };
            let permits = Arc::clone(&permits);
            let aborted = Arc::clone(&aborted);
            let listings = Arc::clone(&self.listings);
            let key_locks = Arc::clone(&key_locks);
            let counters = run.counters();

            workers.spawn(
                async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return Ok(());
                    };
                    if aborted.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    let key_lock = key_locks.lock_for(&listing.position_id).await;
                    let _held = key_lock.lock().await;
                    match write_listing(listings.as_ref(), &listing).await {
                        Ok(outcome) => {
                            counters.record(outcome);
                            Ok(())
                        }
                        Err(err) => {
                            counters.record(RecordOutcome::Failed);
                            aborted.store(true, Ordering::SeqCst);
                            Err(err)
                        }
                    }
                }
                .instrument(Span::current()),
            );
        }

        let mut fatal = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    fatal.get_or_insert(err);
                }
                Err(join_err) => {
                    error!(error = %join_err, "write worker panicked");
                    run.record_outcome(RecordOutcome::Failed);
                }
            }
        }
        match fatal {
            Some(err) => Err(RunFault::StorageLost(err)),
            None => Ok(()),
        }
    }
}

fn map_or_skip(raw: &JsonValue, options: &MapOptions) -> Option<JobListing> {
    match map_listing(raw, options) {
        Ok(listing) => Some(listing),
        Err(err) => {
            let id = raw_position_id(raw);
            warn!(error = %err, position_id = ?id, "skipping unmappable record");
            None
        }
    }
}

/// Best-effort id of a raw item for log lines.
fn raw_position_id(raw: &JsonValue) -> Option<String> {
    let descriptor = raw.get("MatchedObjectDescriptor");
    [
        raw.get("MatchedObjectId"),
        descriptor.and_then(|d| d.get("PositionID")),
        raw.get("PositionID"),
        raw.get("position_id"),
    ]
    .into_iter()
    .flatten()
    .find_map(|value| match value {
        JsonValue::String(text) => Some(text.clone()),
        JsonValue::Number(number) => Some(number.to_string()),
        _ => None,
    })
}

/// Upserts one listing. Rejected rows count as failed; only a fatal store
/// error comes back as `Err`.
async fn write_listing(
    listings: &dyn ListingStore,
    listing: &JobListing,
) -> Result<RecordOutcome, WriteError> {
    match listings.upsert(listing).await {
        Ok(outcome) => {
            debug!(position_id = %listing.position_id, ?outcome, "listing upserted");
            Ok(outcome.into())
        }
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            warn!(position_id = %listing.position_id, error = %err, "listing write rejected");
            Ok(RecordOutcome::Failed)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub fixture: Option<PathBuf>,
    pub max_pages: Option<u32>,
}

fn build_source(config: &EtlConfig, fixture: Option<&PathBuf>) -> Result<Arc<dyn JobSource>> {
    if let Some(path) = fixture {
        info!(path = %path.display(), "using recorded search responses");
        return Ok(Arc::new(FixtureJobSource::load(path)?));
    }
    let api_key = config.require_api_key()?;
    if api_key.len() < 20 {
        warn!("USAJOBS_API_KEY looks too short to be valid");
    }
    let client = UsaJobsClient::new(UsaJobsClientConfig {
        base_url: config.api_base_url.clone(),
        api_key: api_key.to_string(),
        results_per_page: config.results_per_page,
        http: config.http_client_config(),
    })?;
    Ok(Arc::new(client))
}

fn pool_size(config: &EtlConfig) -> u32 {
    if config.parallel_enabled {
        config.worker_count as u32 + 1
    } else {
        2
    }
}

/// Runs once with the given config. Dry runs write to in-memory stores and
/// never touch the database.
pub async fn run_etl(mut config: EtlConfig, options: RunOptions) -> Result<EtlRun> {
    config.dry_run |= options.dry_run;
    if let Some(max_pages) = options.max_pages {
        config.max_pages = max_pages;
    }
    info!(
        keyword = %config.keyword,
        location = %config.default_location,
        api_key = %config.masked_api_key(),
        max_pages = config.max_pages,
        parallel = config.parallel_enabled,
        dry_run = config.dry_run,
        "starting etl"
    );

    let source = build_source(&config, options.fixture.as_ref())?;
    let (listings, runs): (Arc<dyn ListingStore>, Arc<dyn RunStore>) = if config.dry_run {
        (
            Arc::new(MemoryListingStore::new()),
            Arc::new(MemoryRunStore::new()),
        )
    } else {
        let pool = connect_pool(config.require_database_url()?, pool_size(&config)).await?;
        run_migrations(&pool).await?;
        (
            Arc::new(PgListingStore::new(pool.clone())),
            Arc::new(PgRunStore::new(pool)),
        )
    };

    EtlPipeline::new(config, source, listings, runs)
        .run_once()
        .await
}

pub async fn run_etl_from_env(options: RunOptions) -> Result<EtlRun> {
    let config = EtlConfig::from_env()?;
    run_etl(config, options).await
}

pub async fn migrate(config: &EtlConfig) -> Result<()> {
    let pool = connect_pool(config.require_database_url()?, 1).await?;
    run_migrations(&pool).await
}

pub async fn recent_runs(config: &EtlConfig, limit: usize) -> Result<Vec<EtlRun>> {
    let pool = connect_pool(config.require_database_url()?, 1).await?;
    let runs = PgRunStore::new(pool)
        .recent_runs(limit)
        .await
        .context("loading recent etl runs")?;
    Ok(runs)
}

//! Job orchestration: a bounded worker pool that walks each county's adapter
//! chain, reconciles whatever the first productive source yields, enriches the
//! touched properties, and records progress as a persisted state machine.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use taxsale_adapters::{
    AdapterOutcome, CountyConfig, CountyRegistry, SourceAdapter, SourceClient,
};
use taxsale_core::{JobStatus, Property, ScrapingJob};
use taxsale_enrich::EnrichmentEngine;
use taxsale_storage::{HttpFetcher, SnapshotStore, Store, StoreError};

pub mod writer;

pub use writer::{merge_property, ReconciliationWriter, UpsertStats};

pub const CRATE_NAME: &str = "taxsale-jobs";

/// Everything past this many errors collapses into a single overflow line.
pub const ERROR_DISPLAY_CAP: usize = 10;

const DEFAULT_WORKERS: usize = 3;
const MIN_WORKERS: usize = 2;
const MAX_WORKERS: usize = 5;
const DEFAULT_ENRICH_WORKERS: usize = 5;

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown county: {0}")]
    UnknownCounty(String),
}

/// One progress write, sent over a channel so the fetch/parse path never
/// touches the store directly.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub progress: u8,
    pub message: String,
    pub properties_found: i64,
    pub sales_found: i64,
}

/// First `ERROR_DISPLAY_CAP` errors verbatim, the rest summarized.
pub fn cap_errors(errors: &[String]) -> Vec<String> {
    if errors.len() <= ERROR_DISPLAY_CAP {
        return errors.to_vec();
    }
    let mut capped = errors[..ERROR_DISPLAY_CAP].to_vec();
    capped.push(format!("…and {} more", errors.len() - ERROR_DISPLAY_CAP));
    capped
}

/// Hands the orchestrator a priority-ordered adapter chain per county.
/// The registry is the production implementation.
pub trait AdapterChainFactory: Send + Sync {
    fn chain_for(&self, county: &str) -> Option<Vec<Box<dyn SourceAdapter>>>;
    fn county_codes(&self) -> Vec<String>;
}

impl AdapterChainFactory for CountyRegistry {
    fn chain_for(&self, county: &str) -> Option<Vec<Box<dyn SourceAdapter>>> {
        self.county(county).map(CountyConfig::build_chain)
    }

    fn county_codes(&self) -> Vec<String> {
        CountyRegistry::county_codes(self)
    }
}

/// Runs scrape jobs. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn Store>,
    factory: Arc<dyn AdapterChainFactory>,
    fetcher: Arc<HttpFetcher>,
    snapshots: Option<Arc<SnapshotStore>>,
    engine: Arc<EnrichmentEngine>,
    workers: Arc<Semaphore>,
    fetch_delay: Duration,
    enrich_workers: usize,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        factory: Arc<dyn AdapterChainFactory>,
        fetcher: Arc<HttpFetcher>,
        engine: Arc<EnrichmentEngine>,
    ) -> Self {
        Self {
            store,
            factory,
            fetcher,
            snapshots: None,
            engine,
            workers: Arc::new(Semaphore::new(DEFAULT_WORKERS)),
            fetch_delay: Duration::from_secs(1),
            enrich_workers: DEFAULT_ENRICH_WORKERS,
        }
    }

    pub fn with_snapshots(mut self, snapshots: Arc<SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Concurrent job limit, clamped to the supported pool range.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Arc::new(Semaphore::new(workers.clamp(MIN_WORKERS, MAX_WORKERS)));
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    pub fn with_enrich_workers(mut self, workers: usize) -> Self {
        self.enrich_workers = workers.max(1);
        self
    }

    /// Create a pending job for the county and run it on the worker pool.
    /// Returns immediately with the job id; callers poll `job` for status.
    pub async fn submit(&self, county: &str) -> Result<Uuid, JobError> {
        if self.factory.chain_for(county).is_none() {
            return Err(JobError::UnknownCounty(county.to_string()));
        }

        let job = ScrapingJob::pending(county);
        let job_id = job.job_id;
        self.store.create_job(&job).await?;

        let orchestrator = self.clone();
        let county = county.to_string();
        tokio::spawn(async move {
            let _permit = match orchestrator.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if let Err(err) = orchestrator.run_job(job_id, &county).await {
                error!(%job_id, county, error = %err, "scrape job aborted");
                let errors = vec![err.to_string()];
                if let Err(err) = orchestrator
                    .store
                    .finish_job(job_id, JobStatus::Failed, &errors)
                    .await
                {
                    error!(%job_id, error = %err, "failed to record job failure");
                }
            }
        });

        Ok(job_id)
    }

    /// Submit one job per registered county.
    pub async fn scrape_all(&self) -> Result<Vec<Uuid>, JobError> {
        let mut job_ids = Vec::new();
        for county in self.factory.county_codes() {
            job_ids.push(self.submit(&county).await?);
        }
        Ok(job_ids)
    }

    pub async fn job(&self, job_id: Uuid) -> Result<Option<ScrapingJob>, JobError> {
        Ok(self.store.job(job_id).await?)
    }

    async fn run_job(&self, job_id: Uuid, county: &str) -> Result<(), JobError> {
        self.store.mark_job_running(job_id).await?;
        let chain = self
            .factory
            .chain_for(county)
            .ok_or_else(|| JobError::UnknownCounty(county.to_string()))?;

        // All progress writes funnel through one task so fetch and parse code
        // never holds a store handle.
        let (tx, mut rx) = mpsc::channel::<ProgressEvent>(32);
        let store = self.store.clone();
        let progress_writer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(err) = store
                    .record_job_progress(
                        job_id,
                        event.progress,
                        &event.message,
                        event.properties_found,
                        event.sales_found,
                    )
                    .await
                {
                    warn!(%job_id, error = %err, "progress write failed");
                }
            }
        });

        let client = SourceClient::new(
            self.fetcher.clone(),
            self.snapshots.clone(),
            self.fetch_delay,
        );
        let mut errors: Vec<String> = Vec::new();

        let _ = tx
            .send(ProgressEvent {
                progress: 5,
                message: format!("fetching {county} sources"),
                properties_found: 0,
                sales_found: 0,
            })
            .await;

        // Walk the chain front to back. Only an empty result advances to the
        // next source; a source error is recorded and also advances, but a
        // productive source always wins.
        let mut outcome: Option<AdapterOutcome> = None;
        for adapter in &chain {
            match adapter.fetch_and_parse(&client).await {
                Ok(out) if out.property_count() > 0 => {
                    info!(
                        %job_id,
                        source_id = adapter.source_id(),
                        properties = out.property_count(),
                        "source yielded records"
                    );
                    errors.extend(out.row_errors.iter().cloned());
                    outcome = Some(out);
                    break;
                }
                Ok(out) => {
                    info!(
                        %job_id,
                        source_id = adapter.source_id(),
                        "source returned no records, falling back"
                    );
                    errors.extend(out.row_errors);
                }
                Err(err) => {
                    warn!(
                        %job_id,
                        source_id = adapter.source_id(),
                        error = %err,
                        "source failed, falling back"
                    );
                    errors.push(format!("{}: {err}", adapter.source_id()));
                }
            }
        }

        let Some(outcome) = outcome else {
            errors.push("no source available".to_string());
            let _ = tx
                .send(ProgressEvent {
                    progress: 5,
                    message: "no source available".to_string(),
                    properties_found: 0,
                    sales_found: 0,
                })
                .await;
            drop(tx);
            let _ = progress_writer.await;
            self.store
                .finish_job(job_id, JobStatus::Failed, &cap_errors(&errors))
                .await?;
            return Ok(());
        };

        let properties_found = outcome.property_count() as i64;
        let sales_found = outcome.sales.len() as i64;
        let _ = tx
            .send(ProgressEvent {
                progress: 40,
                message: format!("reconciling {properties_found} property records"),
                properties_found,
                sales_found,
            })
            .await;

        let writer = ReconciliationWriter::new(self.store.clone());
        let mut targets: Vec<(Property, f64)> = Vec::new();
        for sale in &outcome.sales {
            writer.upsert_sale(sale).await?;
            for record in &sale.properties {
                if let Some(property) =
                    self.store.property_by_parcel(&record.parcel_number).await?
                {
                    targets.push((property, record.minimum_bid));
                }
            }
        }

        let _ = tx
            .send(ProgressEvent {
                progress: 80,
                message: format!("enriching {} properties", targets.len()),
                properties_found,
                sales_found,
            })
            .await;

        let enrichments = self.engine.enrich_batch(&targets, self.enrich_workers).await;
        for enrichment in &enrichments {
            self.store.upsert_enrichment(enrichment).await?;
        }

        // 100 is reserved for a clean run; anything with recorded errors
        // finishes just short of it.
        if errors.is_empty() {
            let _ = tx
                .send(ProgressEvent {
                    progress: 100,
                    message: "completed".to_string(),
                    properties_found,
                    sales_found,
                })
                .await;
        } else {
            let _ = tx
                .send(ProgressEvent {
                    progress: 99,
                    message: format!("completed with {} errors", errors.len()),
                    properties_found,
                    sales_found,
                })
                .await;
        }
        drop(tx);
        let _ = progress_writer.await;

        let status = if errors.is_empty() {
            JobStatus::Completed
        } else {
            JobStatus::CompletedWithErrors
        };
        self.store
            .finish_job(job_id, status, &cap_errors(&errors))
            .await?;
        Ok(())
    }
}

/// Environment-driven pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub registry_path: String,
    pub snapshot_dir: Option<String>,
    pub workers: usize,
    pub enrich_workers: usize,
    pub fetch_delay: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub scrape_cron: String,
    pub geocoder_url: Option<String>,
    pub geocoder_key: String,
    pub valuation_url: Option<String>,
    pub valuation_key: String,
    pub places_url: Option<String>,
    pub places_key: String,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        use anyhow::Context;

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        Ok(Self {
            database_url,
            registry_path: env_or("TAXSALE_REGISTRY", "counties.yaml"),
            snapshot_dir: env::var("TAXSALE_SNAPSHOT_DIR").ok(),
            workers: env_parse("TAXSALE_WORKERS", DEFAULT_WORKERS)
                .clamp(MIN_WORKERS, MAX_WORKERS),
            enrich_workers: env_parse("TAXSALE_ENRICH_WORKERS", DEFAULT_ENRICH_WORKERS).max(1),
            fetch_delay: Duration::from_millis(env_parse("TAXSALE_FETCH_DELAY_MS", 1_000)),
            http_timeout: Duration::from_secs(env_parse("TAXSALE_HTTP_TIMEOUT_SECS", 30)),
            user_agent: env_or(
                "TAXSALE_USER_AGENT",
                "taxsale-pipeline/0.1 (+property research)",
            ),
            scheduler_enabled: env_or("TAXSALE_SCHEDULER_ENABLED", "false") == "true",
            // Every morning at 06:00.
            scrape_cron: env_or("TAXSALE_SCRAPE_CRON", "0 6 * * *"),
            geocoder_url: env::var("TAXSALE_GEOCODER_URL").ok(),
            geocoder_key: env_or("TAXSALE_GEOCODER_KEY", ""),
            valuation_url: env::var("TAXSALE_VALUATION_URL").ok(),
            valuation_key: env_or("TAXSALE_VALUATION_KEY", ""),
            places_url: env::var("TAXSALE_PLACES_URL").ok(),
            places_key: env_or("TAXSALE_PLACES_KEY", ""),
        })
    }
}

/// Start the recurring all-county scrape when the scheduler is enabled.
pub async fn maybe_build_scheduler(
    orchestrator: Orchestrator,
    config: &PipelineConfig,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        info!("scheduler disabled, skipping");
        return Ok(None);
    }

    let scheduler = JobScheduler::new().await?;
    let cron = config.scrape_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_id, _lock| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            match orchestrator.scrape_all().await {
                Ok(job_ids) => info!(jobs = job_ids.len(), "scheduled scrape submitted"),
                Err(err) => error!(error = %err, "scheduled scrape failed to submit"),
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;
    info!(cron = %config.scrape_cron, "scrape scheduler started");
    Ok(Some(scheduler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::HashMap;
    use taxsale_adapters::AdapterError;
    use taxsale_core::{NormalizedSale, PropertyRecord};
    use taxsale_storage::{HttpClientConfig, MemStore};
    use tokio::time::sleep;

    #[derive(Clone, Copy)]
    enum Behavior {
        Records(usize),
        Empty,
        Fail(&'static str),
    }

    struct StubAdapter {
        source_id: String,
        county: String,
        behavior: Behavior,
    }

    #[async_trait]
    impl SourceAdapter for StubAdapter {
        fn source_id(&self) -> &str {
            &self.source_id
        }

        fn county(&self) -> &str {
            &self.county
        }

        async fn fetch_and_parse(
            &self,
            _client: &SourceClient,
        ) -> Result<AdapterOutcome, AdapterError> {
            match self.behavior {
                Behavior::Fail(message) => Err(AdapterError::Parse(message.to_string())),
                Behavior::Empty => Ok(AdapterOutcome::default()),
                Behavior::Records(count) => {
                    let properties = (0..count)
                        .map(|i| PropertyRecord {
                            parcel_number: format!("{}-{i:04}", self.source_id),
                            owner_name: Some("Jane Doe".into()),
                            address: Some(format!("{i} Main St")),
                            state: Some("TX".into()),
                            assessed_value: Some(100_000.0),
                            minimum_bid: 10_000.0,
                            taxes_owed: Some(2_000.0),
                            ..PropertyRecord::default()
                        })
                        .collect();
                    Ok(AdapterOutcome {
                        sales: vec![NormalizedSale {
                            sale_date: NaiveDate::from_ymd_opt(2025, 9, 2).unwrap(),
                            county: self.county.clone(),
                            platform: None,
                            properties,
                        }],
                        row_errors: Vec::new(),
                    })
                }
            }
        }
    }

    struct StubFactory {
        chains: HashMap<String, Vec<Behavior>>,
    }

    impl StubFactory {
        fn with_chain(county: &str, behaviors: Vec<Behavior>) -> Self {
            let mut chains = HashMap::new();
            chains.insert(county.to_string(), behaviors);
            Self { chains }
        }
    }

    impl AdapterChainFactory for StubFactory {
        fn chain_for(&self, county: &str) -> Option<Vec<Box<dyn SourceAdapter>>> {
            let behaviors = self.chains.get(county)?;
            Some(
                behaviors
                    .iter()
                    .enumerate()
                    .map(|(i, behavior)| -> Box<dyn SourceAdapter> {
                        Box::new(StubAdapter {
                            source_id: format!("{county}-src{i}"),
                            county: county.to_string(),
                            behavior: *behavior,
                        })
                    })
                    .collect(),
            )
        }

        fn county_codes(&self) -> Vec<String> {
            let mut codes: Vec<String> = self.chains.keys().cloned().collect();
            codes.sort();
            codes
        }
    }

    fn orchestrator(store: Arc<MemStore>, factory: StubFactory) -> Orchestrator {
        let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        Orchestrator::new(
            store,
            Arc::new(factory),
            fetcher,
            Arc::new(EnrichmentEngine::new()),
        )
        .with_fetch_delay(Duration::ZERO)
    }

    async fn wait_terminal(store: &MemStore, job_id: Uuid) -> ScrapingJob {
        for _ in 0..500 {
            if let Some(job) = store.job(job_id).await.unwrap() {
                if job.status.is_terminal() {
                    return job;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn exhausted_chain_fails_without_reaching_full_progress() {
        let store = Arc::new(MemStore::new());
        let factory =
            StubFactory::with_chain("collin", vec![Behavior::Empty, Behavior::Fail("timed out")]);
        let orch = orchestrator(store.clone(), factory);

        let job_id = orch.submit("collin").await.unwrap();
        let job = wait_terminal(&store, job_id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.errors.iter().any(|e| e == "no source available"));
        assert!(job.errors.iter().any(|e| e.contains("timed out")));
        assert!(!store.progress_log(job_id).contains(&100));
    }

    #[tokio::test]
    async fn chain_falls_back_until_a_source_yields_records() {
        let store = Arc::new(MemStore::new());
        let factory =
            StubFactory::with_chain("collin", vec![Behavior::Empty, Behavior::Records(2)]);
        let orch = orchestrator(store.clone(), factory);

        let job_id = orch.submit("collin").await.unwrap();
        let job = wait_terminal(&store, job_id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.properties_found, 2);
        assert_eq!(store.property_count(), 2);
        assert_eq!(store.sale_count(), 2);

        let log = store.progress_log(job_id);
        assert!(log.windows(2).all(|w| w[0] <= w[1]), "progress regressed: {log:?}");
        assert_eq!(log.last(), Some(&100));

        // Enrichment rows landed for every reconciled property.
        let property = store
            .property_by_parcel("collin-src1-0000")
            .await
            .unwrap()
            .unwrap();
        let enrichment = store.enrichment_for(property.id).await.unwrap().unwrap();
        // Local fallback: 100k assessed -> 120k value against a 10k bid.
        assert_eq!(enrichment.estimated_value, Some(120_000.0));
        assert!(enrichment.investment_score >= 50.0);
    }

    #[tokio::test]
    async fn source_error_before_success_completes_with_errors() {
        let store = Arc::new(MemStore::new());
        let factory =
            StubFactory::with_chain("dallas", vec![Behavior::Fail("boom"), Behavior::Records(1)]);
        let orch = orchestrator(store.clone(), factory);

        let job_id = orch.submit("dallas").await.unwrap();
        let job = wait_terminal(&store, job_id).await;

        assert_eq!(job.status, JobStatus::CompletedWithErrors);
        assert!(job.errors.iter().any(|e| e.contains("boom")));
        assert!(job.progress < 100);
        assert_eq!(store.property_count(), 1);
    }

    #[tokio::test]
    async fn unknown_county_is_rejected_before_a_job_exists() {
        let store = Arc::new(MemStore::new());
        let factory = StubFactory::with_chain("collin", vec![Behavior::Empty]);
        let orch = orchestrator(store.clone(), factory);

        let err = orch.submit("tarrant").await.unwrap_err();
        assert!(matches!(err, JobError::UnknownCounty(county) if county == "tarrant"));
    }

    #[tokio::test]
    async fn scrape_all_submits_one_job_per_county() {
        let store = Arc::new(MemStore::new());
        let mut factory = StubFactory::with_chain("collin", vec![Behavior::Records(1)]);
        factory
            .chains
            .insert("dallas".to_string(), vec![Behavior::Records(1)]);
        let orch = orchestrator(store.clone(), factory);

        let job_ids = orch.scrape_all().await.unwrap();
        assert_eq!(job_ids.len(), 2);
        for job_id in job_ids {
            let job = wait_terminal(&store, job_id).await;
            assert_eq!(job.status, JobStatus::Completed);
        }
    }

    #[test]
    fn error_list_is_capped_for_display() {
        let few: Vec<String> = (0..3).map(|i| format!("err {i}")).collect();
        assert_eq!(cap_errors(&few), few);

        let many: Vec<String> = (0..25).map(|i| format!("err {i}")).collect();
        let capped = cap_errors(&many);
        assert_eq!(capped.len(), ERROR_DISPLAY_CAP + 1);
        assert_eq!(capped[ERROR_DISPLAY_CAP], "…and 15 more");
    }
}

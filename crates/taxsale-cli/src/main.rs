use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use taxsale_adapters::CountyRegistry;
use taxsale_enrich::{
    EnrichmentEngine, HttpGeocoder, HttpPlacesProvider, HttpValuationProvider,
};
use taxsale_jobs::{maybe_build_scheduler, Orchestrator, PipelineConfig};
use taxsale_storage::{
    HttpClientConfig, HttpFetcher, PgStore, SnapshotStore, Store,
};

#[derive(Debug, Parser)]
#[command(name = "taxsale-cli")]
#[command(about = "Tax-sale acquisition and enrichment pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape one county and wait for the job to finish.
    Scrape { county: String },
    /// Submit a scrape job for every registered county.
    ScrapeAll,
    /// Show the state of a previously submitted job.
    Status { job_id: Uuid },
    /// Re-run enrichment for a single parcel.
    Enrich { parcel: String },
    /// Apply pending database migrations and exit.
    Migrate,
    /// Run the recurring scrape scheduler in the foreground.
    Scheduler,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("taxsale=info".parse()?))
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::ScrapeAll);

    let mut config = PipelineConfig::from_env()?;

    let store = Arc::new(PgStore::connect(&config.database_url).await?);
    store.migrate().await?;

    if matches!(command, Commands::Migrate) {
        println!("migrations applied");
        return Ok(());
    }

    let registry = CountyRegistry::load(&config.registry_path)?;
    let fetcher = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout,
        user_agent: Some(config.user_agent.clone()),
        ..HttpClientConfig::default()
    })?);
    let engine = Arc::new(build_engine(&config, fetcher.clone()));

    let mut orchestrator = Orchestrator::new(
        store.clone() as Arc<dyn Store>,
        Arc::new(registry),
        fetcher,
        engine.clone(),
    )
    .with_workers(config.workers)
    .with_enrich_workers(config.enrich_workers)
    .with_fetch_delay(config.fetch_delay);
    if let Some(dir) = &config.snapshot_dir {
        orchestrator = orchestrator.with_snapshots(Arc::new(SnapshotStore::new(dir)));
    }

    match command {
        Commands::Migrate => {}
        Commands::Scrape { county } => {
            let job_id = orchestrator.submit(&county).await?;
            info!(%job_id, county, "job submitted");
            let job = wait_for_job(&orchestrator, job_id).await?;
            println!(
                "job {} {}: {} properties, {} sales, {} errors",
                job.job_id,
                job.status.as_str(),
                job.properties_found,
                job.sales_found,
                job.errors.len()
            );
            for error in &job.errors {
                eprintln!("  {error}");
            }
        }
        Commands::ScrapeAll => {
            let job_ids = orchestrator.scrape_all().await?;
            for job_id in &job_ids {
                println!("submitted {job_id}");
            }
            for job_id in job_ids {
                let job = wait_for_job(&orchestrator, job_id).await?;
                println!(
                    "job {} ({}) {}: {} properties",
                    job.job_id,
                    job.county,
                    job.status.as_str(),
                    job.properties_found
                );
            }
        }
        Commands::Status { job_id } => match orchestrator.job(job_id).await? {
            Some(job) => {
                println!(
                    "job {} ({}) {} {}% — {}",
                    job.job_id,
                    job.county,
                    job.status.as_str(),
                    job.progress,
                    job.message
                );
                for error in &job.errors {
                    eprintln!("  {error}");
                }
            }
            None => bail!("no job with id {job_id}"),
        },
        Commands::Enrich { parcel } => {
            let property = store
                .property_by_parcel(&parcel)
                .await?
                .with_context(|| format!("no property with parcel {parcel}"))?;
            let sales = store.sales_for_property(property.id).await?;
            let minimum_bid = sales
                .iter()
                .max_by_key(|s| s.sale_date)
                .map(|s| s.minimum_bid)
                .unwrap_or(0.0);
            let enrichment = engine.enrich(&property, minimum_bid).await;
            store.upsert_enrichment(&enrichment).await?;
            println!(
                "parcel {}: score {:.0}, quality {:.0}, value {}",
                parcel,
                enrichment.investment_score,
                enrichment.data_quality_score,
                enrichment
                    .estimated_value
                    .map(|v| format!("${v:.0}"))
                    .unwrap_or_else(|| "unknown".to_string())
            );
        }
        Commands::Scheduler => {
            config.scheduler_enabled = true;
            let scheduler = maybe_build_scheduler(orchestrator, &config).await?;
            if scheduler.is_none() {
                bail!("scheduler did not start");
            }
            info!(cron = %config.scrape_cron, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    Ok(())
}

fn build_engine(config: &PipelineConfig, fetcher: Arc<HttpFetcher>) -> EnrichmentEngine {
    let mut engine = EnrichmentEngine::new();
    if let Some(url) = &config.geocoder_url {
        engine = engine.with_geocoder(Arc::new(HttpGeocoder::new(
            fetcher.clone(),
            url,
            &config.geocoder_key,
        )));
    }
    if let Some(url) = &config.valuation_url {
        engine = engine.with_valuation(Arc::new(HttpValuationProvider::new(
            fetcher.clone(),
            url,
            &config.valuation_key,
        )));
    }
    if let Some(url) = &config.places_url {
        engine = engine.with_places(Arc::new(HttpPlacesProvider::new(
            fetcher,
            url,
            &config.places_key,
        )));
    }
    engine
}

async fn wait_for_job(
    orchestrator: &Orchestrator,
    job_id: Uuid,
) -> Result<taxsale_core::ScrapingJob> {
    loop {
        if let Some(job) = orchestrator.job(job_id).await? {
            if job.status.is_terminal() {
                return Ok(job);
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

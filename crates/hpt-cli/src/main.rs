use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hpt_analytics::{AnalyticsEngine, RefreshOptions};
use hpt_core::{JobKind, JobStatus, NewJob};
use hpt_queue::{DownloadWorker, PgIngestQueue, RetentionLimits, WorkerTick};
use hpt_registry::HttpRegistryClient;
use hpt_storage::{
    ArtifactStore, HttpClientConfig, HttpFetcher, JobFilter, JobHandle, JobStore, PgFactAggregates,
    PgHospitalStore, PgJobStore, PgMetricStore,
};
use hpt_sync::{
    AppConfig, JurisdictionSet, ScanOptions, Scanner, ScheduleRuntime, ScheduleSet, ScheduledTask,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "hpt-cli")]
#[command(about = "Hospital price transparency aggregation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scan jurisdictional registries and enqueue changed files.
    Scan {
        /// Jurisdiction codes to scan; defaults to the configured set.
        #[arg(long, value_delimiter = ',')]
        jurisdictions: Vec<String>,
        /// Re-enqueue files even when the change detector sees no change.
        #[arg(long)]
        force: bool,
        /// Scan only the smoke-test subset of jurisdictions.
        #[arg(long)]
        test_subset: bool,
    },
    /// Recompute pre-aggregated metrics for the current periods.
    Refresh {
        /// Catalog metric names; defaults to the full catalog.
        #[arg(long, value_delimiter = ',')]
        metrics: Vec<String>,
        /// Recompute even where live rows already exist.
        #[arg(long)]
        force: bool,
    },
    /// Service the ingestion queue.
    Worker {
        /// Process at most one queue item, then exit.
        #[arg(long)]
        once: bool,
    },
    /// Run the cron schedules until interrupted.
    Schedule,
    /// Apply database migrations.
    Migrate,
    /// List job ledger entries.
    Jobs {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command {
        Commands::Scan {
            jurisdictions,
            force,
            test_subset,
        } => {
            let pool = connect(&config).await?;
            let scanner = build_scanner(&config, &pool)?;
            let jurisdictions = if !jurisdictions.is_empty() {
                jurisdictions
            } else if test_subset {
                JurisdictionSet::test_subset().jurisdictions
            } else {
                JurisdictionSet::load(config.workspace_root.join("jurisdictions.yaml"))?
                    .jurisdictions
            };
            let run = scanner
                .run_scan(&ScanOptions {
                    jurisdictions,
                    force_refresh: force,
                })
                .await?;
            println!(
                "scan {}: jurisdictions={} hospitals={} new={} updated={} enqueued={} errors={} success={}",
                run.job_id,
                run.result.scanned_jurisdictions,
                run.result.total_hospitals,
                run.result.new_hospitals,
                run.result.updated_hospitals,
                run.result.files_enqueued,
                run.result.errors.len(),
                run.result.success,
            );
        }
        Commands::Refresh { metrics, force } => {
            let pool = connect(&config).await?;
            let jobs: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool.clone()));
            let engine = build_engine(&pool);
            let opts = RefreshOptions {
                metric_names: (!metrics.is_empty()).then_some(metrics),
                force_refresh: force,
                now: chrono::Utc::now(),
            };
            let result = run_refresh_job(&engine, &jobs, &opts).await?;
            println!(
                "refresh: metrics_updated={} errors={} success={}",
                result.metrics_updated,
                result.errors.len(),
                result.success,
            );
        }
        Commands::Worker { once } => {
            let pool = connect(&config).await?;
            let worker = build_worker(&config, &pool)?;
            run_worker(worker, once).await?;
        }
        Commands::Schedule => {
            let pool = connect(&config).await?;
            run_schedules(&config, &pool).await?;
        }
        Commands::Migrate => {
            let pool = connect(&config).await?;
            sqlx::migrate!("../../migrations")
                .run(&pool)
                .await
                .context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Jobs {
            status,
            kind,
            limit,
        } => {
            let pool = connect(&config).await?;
            let jobs = PgJobStore::new(pool);
            let filter = JobFilter {
                status: status
                    .as_deref()
                    .map(|s| JobStatus::parse(s).with_context(|| format!("unknown status {s}")))
                    .transpose()?,
                kind: kind
                    .as_deref()
                    .map(|k| JobKind::parse(k).with_context(|| format!("unknown kind {k}")))
                    .transpose()?,
                limit,
                offset: 0,
            };
            for record in jobs.list(filter).await? {
                println!(
                    "{} {:>16} {:>9} {:>4}% {} {}",
                    record.id,
                    record.kind.as_str(),
                    record.status.as_str(),
                    record.progress_percent,
                    record.created_at.format("%Y-%m-%d %H:%M:%S"),
                    record.name,
                );
            }
        }
    }

    Ok(())
}

async fn connect(config: &AppConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(8)
        .connect(&config.database_url)
        .await
        .context("connecting to database")
}

fn build_fetcher(config: &AppConfig) -> Result<Arc<HttpFetcher>> {
    Ok(Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?))
}

fn build_scanner(config: &AppConfig, pool: &PgPool) -> Result<Scanner> {
    let http = build_fetcher(config)?;
    Ok(Scanner::new(
        Arc::new(HttpRegistryClient::new(http, &config.registry_base_url)),
        Arc::new(PgHospitalStore::new(pool.clone())),
        Arc::new(PgIngestQueue::new(pool.clone())),
        Arc::new(PgJobStore::new(pool.clone())),
        Duration::from_millis(config.scan_pacing_ms),
    ))
}

fn build_engine(pool: &PgPool) -> AnalyticsEngine {
    AnalyticsEngine::new(
        Arc::new(PgFactAggregates::new(pool.clone())),
        Arc::new(PgMetricStore::new(pool.clone())),
    )
}

fn build_worker(config: &AppConfig, pool: &PgPool) -> Result<DownloadWorker> {
    let http = build_fetcher(config)?;
    Ok(DownloadWorker::new(
        Arc::new(PgIngestQueue::new(pool.clone())),
        Arc::new(PgJobStore::new(pool.clone())),
        http,
        ArtifactStore::new(config.artifacts_dir.clone()),
        Duration::from_secs(config.http_timeout_secs.max(60)),
        RetentionLimits::default(),
    ))
}

/// Run one metrics refresh under a fresh ledger job.
async fn run_refresh_job(
    engine: &AnalyticsEngine,
    jobs: &Arc<dyn JobStore>,
    opts: &RefreshOptions,
) -> Result<hpt_core::RefreshResult> {
    let job_id = jobs
        .create(
            NewJob::new(JobKind::MetricsRefresh, "metrics refresh", "analytics").with_input(
                serde_json::json!({
                    "metrics": opts.metric_names,
                    "forceRefresh": opts.force_refresh,
                }),
            ),
        )
        .await?;
    jobs.mark_running(job_id).await?;

    let handle = JobHandle::new(Arc::clone(jobs), job_id);
    match engine.refresh(opts, Some(&handle)).await {
        Ok(result) => {
            if handle.cancel_requested().await? {
                jobs.cancel(job_id).await?;
            } else {
                jobs.complete(job_id, serde_json::to_value(&result)?).await?;
            }
            Ok(result)
        }
        Err(err) => {
            jobs.fail(job_id, &format!("{err:#}"), None).await?;
            Err(err)
        }
    }
}

async fn run_worker(worker: DownloadWorker, once: bool) -> Result<()> {
    loop {
        let tick = tokio::select! {
            tick = worker.run_once() => tick?,
            _ = tokio::signal::ctrl_c() => {
                info!("worker interrupted, exiting");
                return Ok(());
            }
        };
        match tick {
            WorkerTick::Idle => {
                if once {
                    println!("queue empty");
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            WorkerTick::Completed { queue_id, .. } => {
                info!(%queue_id, "item processed");
                if once {
                    return Ok(());
                }
            }
            WorkerTick::Failed {
                queue_id,
                will_retry,
                ..
            } => {
                error!(%queue_id, will_retry, "item failed");
                if once {
                    return Ok(());
                }
            }
        }
    }
}

struct ScanTask {
    scanner: Scanner,
    jurisdictions: Vec<String>,
}

#[async_trait::async_trait]
impl ScheduledTask for ScanTask {
    async fn run(&self) -> Result<()> {
        let run = self
            .scanner
            .run_scan(&ScanOptions {
                jurisdictions: self.jurisdictions.clone(),
                force_refresh: false,
            })
            .await?;
        if !run.result.success {
            anyhow::bail!(
                "scan {} finished with {} errors",
                run.job_id,
                run.result.errors.len()
            );
        }
        Ok(())
    }
}

struct RefreshTask {
    engine: AnalyticsEngine,
    jobs: Arc<dyn JobStore>,
}

#[async_trait::async_trait]
impl ScheduledTask for RefreshTask {
    async fn run(&self) -> Result<()> {
        let opts = RefreshOptions::full(chrono::Utc::now());
        let result = run_refresh_job(&self.engine, &self.jobs, &opts).await?;
        if !result.success {
            anyhow::bail!("metrics refresh finished with {} errors", result.errors.len());
        }
        Ok(())
    }
}

async fn run_schedules(config: &AppConfig, pool: &PgPool) -> Result<()> {
    let set = ScheduleSet::load(config.workspace_root.join("schedules.yaml"))?;
    let jurisdictions =
        JurisdictionSet::load(config.workspace_root.join("jurisdictions.yaml"))?.jurisdictions;

    let mut tasks: HashMap<String, Arc<dyn ScheduledTask>> = HashMap::new();
    tasks.insert(
        "scan".to_string(),
        Arc::new(ScanTask {
            scanner: build_scanner(config, pool)?,
            jurisdictions,
        }),
    );
    tasks.insert(
        "metrics_refresh".to_string(),
        Arc::new(RefreshTask {
            engine: build_engine(pool),
            jobs: Arc::new(PgJobStore::new(pool.clone())),
        }),
    );

    let mut runtime = ScheduleRuntime::build(&set, tasks).await?;
    runtime.start().await?;
    info!(schedules = set.schedules.len(), "scheduler running");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    runtime.shutdown().await
}

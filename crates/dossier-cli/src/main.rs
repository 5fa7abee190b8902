use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dossier_core::{ScrapeTarget, TriggerType};
use dossier_storage::connect_and_migrate;
use dossier_sync::scheduler::enqueue_scheduled;
use dossier_sync::{
    build_coordinator, load_subscriptions, maybe_build_scheduler, scrape_once_from_env,
    spawn_worker_pool, Backends, SyncConfig,
};
use dossier_web::AppState;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::JobScheduler;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dossier-cli")]
#[command(about = "Dealership competitive-intelligence dossiers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the worker pool and, when enabled, the weekly scheduler.
    Worker {
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Run the HTTP interface, with workers in the same process unless disabled.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        no_workers: bool,
    },
    /// Enqueue one job, or every subscription in a file as scheduled jobs.
    Enqueue {
        #[arg(long, required_unless_present = "subscriptions")]
        user: Option<String>,
        /// NAME=URL, or a bare URL.
        #[arg(long, value_parser = parse_site, required_unless_present = "subscriptions")]
        host: Option<(String, String)>,
        #[arg(long = "competitor", value_parser = parse_site)]
        competitors: Vec<(String, String)>,
        #[arg(long)]
        scheduled: bool,
        #[arg(long, conflicts_with_all = ["user", "host", "competitors"])]
        subscriptions: Option<PathBuf>,
    },
    /// Apply database migrations.
    Migrate,
    /// Scrape one site and print what was detected and extracted.
    Scrape {
        #[arg(value_parser = parse_site)]
        site: (String, String),
    },
}

fn parse_site(raw: &str) -> Result<(String, String), String> {
    let (name, url) = match raw.split_once('=') {
        Some((name, url)) => (name.trim(), url.trim()),
        None => (raw.trim(), raw.trim()),
    };
    if url.is_empty() {
        return Err("site url must not be empty".to_string());
    }
    Ok((name.to_string(), url.to_string()))
}

/// An enqueued job must outlive this command, so the in-memory queue will not do.
fn require_durable_queue(config: &SyncConfig) -> Result<()> {
    if config.database_url.is_none() {
        bail!("DATABASE_URL must be set to enqueue; an in-memory queue is lost when this command exits");
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Worker { workers } => {
            let backends = Backends::from_config(&config).await?;
            let (tx, rx) = watch::channel(false);
            let runtime = start_workers(&config, workers, &backends, rx).await?;
            wait_for_ctrl_c().await;
            runtime.stop(tx).await?;
        }
        Commands::Serve { port, no_workers } => {
            let backends = Backends::from_config(&config).await?;
            let (tx, rx) = watch::channel(false);
            let runtime = if no_workers {
                None
            } else {
                Some(start_workers(&config, None, &backends, rx).await?)
            };
            dossier_web::serve(
                port.unwrap_or(config.web_port),
                AppState::from(backends),
                wait_for_ctrl_c(),
            )
            .await
            .context("running http interface")?;
            if let Some(runtime) = runtime {
                runtime.stop(tx).await?;
            }
        }
        Commands::Enqueue {
            user,
            host,
            competitors,
            scheduled,
            subscriptions,
        } => {
            require_durable_queue(&config)?;
            let backends = Backends::from_config(&config).await?;
            if let Some(path) = subscriptions {
                let file = load_subscriptions(&path).await?;
                let summary = enqueue_scheduled(backends.queue.as_ref(), &file)
                    .await
                    .context("enqueueing subscriptions")?;
                println!(
                    "enqueued={} duplicates={} rejected={}",
                    summary.enqueued.len(),
                    summary.duplicates,
                    summary.rejected
                );
                return Ok(());
            }
            let (Some(user), Some((host_name, host_url))) = (user, host) else {
                bail!("--user and --host are required without --subscriptions");
            };
            let targets = std::iter::once(ScrapeTarget::host(host_name, host_url))
                .chain(
                    competitors
                        .into_iter()
                        .map(|(name, url)| ScrapeTarget::competitor(name, url)),
                )
                .collect();
            let trigger_type = if scheduled {
                TriggerType::Scheduled
            } else {
                TriggerType::Admin
            };
            let job_id = backends
                .queue
                .enqueue(&user, targets, trigger_type)
                .await
                .context("enqueueing job")?;
            println!("job_id={job_id}");
        }
        Commands::Migrate => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to migrate");
            };
            connect_and_migrate(url).await?;
            println!("migrations applied");
        }
        Commands::Scrape { site: (name, url) } => {
            let result = scrape_once_from_env(ScrapeTarget::competitor(name, url)).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

type WorkerHandle = JoinHandle<Result<(), dossier_sync::WorkerError>>;

struct WorkerRuntime {
    handles: Vec<WorkerHandle>,
    scheduler: Option<JobScheduler>,
}

impl WorkerRuntime {
    async fn stop(self, tx: watch::Sender<bool>) -> Result<()> {
        if let Some(mut sched) = self.scheduler {
            if let Err(err) = sched.shutdown().await {
                warn!(error = %err, "scheduler shutdown failed");
            }
        }
        let _ = tx.send(true);
        let mut outage = None;
        for handle in self.handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => outage = Some(err),
                Err(err) => warn!(error = %err, "worker task ended abnormally"),
            }
        }
        match outage {
            Some(err) => Err(err).context("worker stopped on storage outage"),
            None => Ok(()),
        }
    }
}

async fn start_workers(
    config: &SyncConfig,
    workers: Option<usize>,
    backends: &Backends,
    shutdown: watch::Receiver<bool>,
) -> Result<WorkerRuntime> {
    let coordinator = build_coordinator(config)?;
    let count = workers.unwrap_or(config.workers);
    let handles = spawn_worker_pool(
        count,
        backends.queue.clone(),
        backends.dossiers.clone(),
        coordinator,
        config.worker_config(),
        shutdown,
    );
    info!(workers = handles.len(), max_sessions = config.max_sessions, "worker pool started");

    let scheduler = maybe_build_scheduler(config, backends.queue.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!("scheduler started");
    }
    Ok(WorkerRuntime { handles, scheduler })
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for ctrl-c");
    }
    info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_requires_a_database() {
        let err = require_durable_queue(&SyncConfig::default()).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));

        let config = SyncConfig {
            database_url: Some("postgres://localhost/dossiers".to_string()),
            ..SyncConfig::default()
        };
        assert!(require_durable_queue(&config).is_ok());
    }

    #[test]
    fn sites_parse_with_or_without_a_name() {
        assert_eq!(
            parse_site("Rival Auto=https://rival.example").unwrap(),
            ("Rival Auto".to_string(), "https://rival.example".to_string())
        );
        assert_eq!(
            parse_site("https://rival.example").unwrap(),
            ("https://rival.example".to_string(), "https://rival.example".to_string())
        );
        assert!(parse_site("Rival=").is_err());
    }
}

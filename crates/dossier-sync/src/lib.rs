//! Job execution: scrape coordination, market comparison, dossier assembly, workers and the
//! weekly scheduler.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dossier_core::{ScrapeResult, ScrapeTarget};
use dossier_scrape::{HttpSiteScraper, NhtsaVinDecoder, RuleSet, ScraperConfig};
use dossier_storage::{
    connect_and_migrate, ArtifactStore, BackoffPolicy, DossierStore, HttpClientConfig,
    HttpFetcher, JobQueue, MemoryDossierStore, MemoryJobQueue, PgDossierStore, PgJobQueue,
    QueueConfig,
};
use tracing::{info, warn};
use uuid::Uuid;

pub mod ask_why;
pub mod builder;
pub mod compare;
pub mod coordinator;
pub mod scheduler;
pub mod worker;

#[cfg(test)]
mod testing;

pub use ask_why::{answer_question, ask_why, catalog, AskWhyError, AskWhyQuestion};
pub use builder::build_dossier;
pub use compare::{compare_market, CompareError};
pub use coordinator::{CoordinatorConfig, CoordinatorError, ScrapeCoordinator};
pub use scheduler::{load_subscriptions, maybe_build_scheduler, Subscription, SubscriptionFile};
pub use worker::{spawn_worker_pool, JobOutcome, Worker, WorkerConfig, WorkerError};

pub const CRATE_NAME: &str = "dossier-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub artifacts_dir: Option<PathBuf>,
    pub rules_dir: Option<PathBuf>,
    pub subscriptions_path: PathBuf,
    pub scheduler_enabled: bool,
    pub schedule_cron: String,
    pub user_agent: String,
    pub page_timeout_secs: u64,
    pub max_sessions: usize,
    pub target_timeout_secs: u64,
    pub job_timeout_secs: u64,
    pub scrape_retries: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_listing_pages: usize,
    pub max_finance_pages: usize,
    /// Look up incomplete records by VIN against the NHTSA decoder.
    pub vin_enrichment: bool,
    pub lease_secs: u64,
    pub max_attempts: u32,
    pub workers: usize,
    pub poll_interval_secs: u64,
    pub web_port: u16,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            artifacts_dir: None,
            rules_dir: None,
            subscriptions_path: PathBuf::from("./subscriptions.yaml"),
            scheduler_enabled: false,
            schedule_cron: "0 6 * * 1".to_string(),
            user_agent: "dossier-bot/0.1".to_string(),
            page_timeout_secs: 30,
            max_sessions: 8,
            target_timeout_secs: 900,
            job_timeout_secs: 4 * 60 * 60,
            scrape_retries: 2,
            backoff_base_ms: 2_000,
            backoff_max_ms: 30_000,
            max_listing_pages: 10,
            max_finance_pages: 3,
            vin_enrichment: false,
            lease_secs: 300,
            max_attempts: 3,
            workers: 2,
            poll_interval_secs: 10,
            web_port: 8000,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            artifacts_dir: env_path("ARTIFACTS_DIR"),
            rules_dir: env_path("DOSSIER_RULES_DIR"),
            subscriptions_path: env_path("DOSSIER_SUBSCRIPTIONS")
                .unwrap_or(defaults.subscriptions_path),
            scheduler_enabled: env_flag("DOSSIER_SCHEDULER_ENABLED"),
            schedule_cron: std::env::var("DOSSIER_SCHEDULE_CRON")
                .unwrap_or(defaults.schedule_cron),
            user_agent: std::env::var("DOSSIER_USER_AGENT").unwrap_or(defaults.user_agent),
            page_timeout_secs: env_or("DOSSIER_PAGE_TIMEOUT_SECS", defaults.page_timeout_secs),
            max_sessions: env_or("DOSSIER_MAX_SESSIONS", defaults.max_sessions).max(1),
            target_timeout_secs: env_or("DOSSIER_TARGET_TIMEOUT_SECS", defaults.target_timeout_secs),
            job_timeout_secs: env_or("DOSSIER_JOB_TIMEOUT_SECS", defaults.job_timeout_secs),
            scrape_retries: env_or("DOSSIER_SCRAPE_RETRIES", defaults.scrape_retries),
            backoff_base_ms: env_or("DOSSIER_BACKOFF_BASE_MS", defaults.backoff_base_ms),
            backoff_max_ms: env_or("DOSSIER_BACKOFF_MAX_MS", defaults.backoff_max_ms),
            max_listing_pages: env_or("DOSSIER_MAX_LISTING_PAGES", defaults.max_listing_pages),
            max_finance_pages: env_or("DOSSIER_MAX_FINANCE_PAGES", defaults.max_finance_pages),
            vin_enrichment: env_flag("DOSSIER_VIN_ENRICHMENT"),
            lease_secs: env_or("DOSSIER_LEASE_SECS", defaults.lease_secs).max(3),
            max_attempts: env_or("DOSSIER_MAX_ATTEMPTS", defaults.max_attempts).max(1),
            workers: env_or("DOSSIER_WORKERS", defaults.workers).max(1),
            poll_interval_secs: env_or("DOSSIER_POLL_INTERVAL_SECS", defaults.poll_interval_secs),
            web_port: env_or("DOSSIER_WEB_PORT", defaults.web_port),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            lease: Duration::from_secs(self.lease_secs),
            max_attempts: self.max_attempts,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            page_timeout: Duration::from_secs(self.page_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn scraper_config(&self) -> ScraperConfig {
        ScraperConfig {
            max_listing_pages: self.max_listing_pages,
            max_finance_pages: self.max_finance_pages,
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_sessions: self.max_sessions,
            target_timeout: Duration::from_secs(self.target_timeout_secs),
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            backoff: BackoffPolicy {
                max_retries: self.scrape_retries,
                base_delay: Duration::from_millis(self.backoff_base_ms),
                max_delay: Duration::from_millis(self.backoff_max_ms),
            },
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            lease: Duration::from_secs(self.lease_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            ..Default::default()
        }
    }
}

/// Job queue and dossier store chosen for this process.
#[derive(Clone)]
pub struct Backends {
    pub queue: Arc<dyn JobQueue>,
    pub dossiers: Arc<dyn DossierStore>,
}

impl Backends {
    pub fn memory(config: &SyncConfig) -> Self {
        Self {
            queue: Arc::new(MemoryJobQueue::new(config.queue_config())),
            dossiers: Arc::new(MemoryDossierStore::new()),
        }
    }

    /// Postgres when `DATABASE_URL` is set, otherwise in-memory stores.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        let Some(url) = config.database_url.as_deref() else {
            warn!("DATABASE_URL not set; jobs and dossiers live in memory for this process only");
            return Ok(Self::memory(config));
        };
        let pool = connect_and_migrate(url)
            .await
            .context("connecting to dossier database")?;
        info!("using postgres job queue and dossier store");
        Ok(Self {
            queue: Arc::new(PgJobQueue::new(pool.clone(), config.queue_config())),
            dossiers: Arc::new(PgDossierStore::new(pool)),
        })
    }
}

/// Coordinator over live HTTP sessions, with the configured rule tables and artifact store.
pub fn build_coordinator(config: &SyncConfig) -> Result<ScrapeCoordinator> {
    let rules = RuleSet::load(config.rules_dir.as_deref()).with_context(|| match &config.rules_dir {
        Some(dir) => format!("loading rule tables from {}", dir.display()),
        None => "loading built-in rule tables".to_string(),
    })?;
    let fetcher = HttpFetcher::new(config.http_client_config());
    let scraper = HttpSiteScraper::new(fetcher.clone(), config.scraper_config());
    let mut coordinator =
        ScrapeCoordinator::new(Arc::new(scraper), rules, config.coordinator_config());
    if let Some(dir) = &config.artifacts_dir {
        coordinator = coordinator.with_artifacts(ArtifactStore::new(dir.clone()));
    }
    if config.vin_enrichment {
        let decoder = NhtsaVinDecoder::new(&fetcher).context("building vin decoder")?;
        coordinator = coordinator.with_vin_decoder(Arc::new(decoder));
        info!("vin enrichment enabled");
    }
    Ok(coordinator)
}

/// Scrapes one site outside any job, for manual inspection of rule tables.
pub async fn scrape_once_from_env(target: ScrapeTarget) -> Result<ScrapeResult> {
    let config = SyncConfig::from_env();
    let coordinator = build_coordinator(&config)?;
    Ok(coordinator.run_target(Uuid::new_v4(), target).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.schedule_cron, "0 6 * * 1");
        assert_eq!(config.max_sessions, 8);
        assert_eq!(config.job_timeout_secs, 14_400);

        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.backoff.max_retries, 2);
        assert_eq!(coordinator.backoff.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(coordinator.target_timeout, Duration::from_secs(900));

        let queue = config.queue_config();
        assert_eq!(queue.lease, Duration::from_secs(300));
        assert_eq!(queue.max_attempts, 3);
        assert!(!config.vin_enrichment);
    }

    #[test]
    fn builtin_rules_build_a_coordinator() {
        let coordinator = build_coordinator(&SyncConfig::default()).expect("coordinator");
        assert_eq!(coordinator.config().max_sessions, 8);
        assert_eq!(coordinator.available_sessions(), 8);

        let with_vin = SyncConfig {
            vin_enrichment: true,
            ..SyncConfig::default()
        };
        assert!(build_coordinator(&with_vin).is_ok());
    }
}

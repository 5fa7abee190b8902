//! Scrape coordination for one job.
//!
//! Every target runs as its own task. A task first waits for a session permit from the
//! process-wide pool (shared by all jobs, granted in arrival order), then scrapes under its
//! own wall-clock budget, retrying transient failures with backoff. Outcomes are collected
//! as they finish; a job-level deadline aborts whatever is still pending.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dossier_core::{FailureReason, Job, ScrapeResult, ScrapeTarget};
use dossier_scrape::{
    enrich_inventory, InventoryExtractor, RuleSet, ScrapeError, SiteScraper, SiteSnapshot,
    ToolDetector, VinDecoder,
};
use dossier_storage::{ArtifactStore, BackoffPolicy};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// Concurrent sessions across every job in the process.
    pub max_sessions: usize,
    /// Wall clock per target, retries included, admission wait excluded.
    pub target_timeout: Duration,
    pub job_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_sessions: 8,
            target_timeout: Duration::from_secs(900),
            job_timeout: Duration::from_secs(4 * 60 * 60),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("job {job_id} has no host target")]
    MissingHost { job_id: Uuid },
    #[error("host target {name} failed: {reason}")]
    HostFailed { name: String, reason: FailureReason },
}

impl CoordinatorError {
    /// Text recorded as the job's failure reason.
    pub fn failure_reason(&self) -> String {
        match self {
            Self::MissingHost { .. } => "job has no host target".to_string(),
            Self::HostFailed { reason, .. } => format!("host scrape failed: {reason}"),
        }
    }
}

/// Cheap to clone; clones share the session pool.
#[derive(Clone)]
pub struct ScrapeCoordinator {
    scraper: Arc<dyn SiteScraper>,
    detector: Arc<ToolDetector>,
    extractor: Arc<InventoryExtractor>,
    sessions: Arc<Semaphore>,
    artifacts: Option<ArtifactStore>,
    vin_decoder: Option<Arc<dyn VinDecoder>>,
    config: CoordinatorConfig,
}

impl ScrapeCoordinator {
    pub fn new(scraper: Arc<dyn SiteScraper>, rules: RuleSet, config: CoordinatorConfig) -> Self {
        Self {
            scraper,
            detector: Arc::new(ToolDetector::new(rules.tools)),
            extractor: Arc::new(InventoryExtractor::new(rules.inventory)),
            sessions: Arc::new(Semaphore::new(config.max_sessions.max(1))),
            artifacts: None,
            vin_decoder: None,
            config,
        }
    }

    pub fn with_artifacts(mut self, store: ArtifactStore) -> Self {
        self.artifacts = Some(store);
        self
    }

    /// Fills gaps in extracted records from VIN lookups. Off unless set.
    pub fn with_vin_decoder(mut self, decoder: Arc<dyn VinDecoder>) -> Self {
        self.vin_decoder = Some(decoder);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn available_sessions(&self) -> usize {
        self.sessions.available_permits()
    }

    /// Runs every target of `job` and returns their results in target order.
    ///
    /// Each result is also sent to `progress` as soon as it is known. A failed host turns
    /// into [`CoordinatorError::HostFailed`]; competitor failures stay in the result set.
    pub async fn run_job(
        &self,
        job: &Job,
        progress: Option<mpsc::UnboundedSender<ScrapeResult>>,
    ) -> Result<Vec<ScrapeResult>, CoordinatorError> {
        if job.host().is_none() {
            return Err(CoordinatorError::MissingHost { job_id: job.id });
        }
        let results = self.collect(job, progress).await;

        if let Some(host) = results.iter().find(|r| r.target.is_host()) {
            if let Some(reason) = host.failure() {
                warn!(job_id = %job.id, site = %host.target.name, %reason, "host scrape failed");
                return Err(CoordinatorError::HostFailed {
                    name: host.target.name.clone(),
                    reason: reason.clone(),
                });
            }
        }
        Ok(results)
    }

    async fn collect(
        &self,
        job: &Job,
        progress: Option<mpsc::UnboundedSender<ScrapeResult>>,
    ) -> Vec<ScrapeResult> {
        let deadline = Instant::now() + self.config.job_timeout;
        let mut slots: Vec<Option<ScrapeResult>> = vec![None; job.targets.len()];
        let mut tasks = JoinSet::new();
        for (index, target) in job.targets.iter().cloned().enumerate() {
            let coordinator = self.clone();
            let job_id = job.id;
            tasks.spawn(async move { (index, coordinator.run_target(job_id, target).await) });
        }

        let mut timed_out = false;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((index, result)))) => {
                    if let Some(tx) = &progress {
                        let _ = tx.send(result.clone());
                    }
                    slots[index] = Some(result);
                }
                Ok(Some(Err(err))) => {
                    warn!(job_id = %job.id, error = %err, "scrape task ended abnormally");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        job_id = %job.id,
                        pending = tasks.len(),
                        "job timeout reached; abandoning pending targets"
                    );
                    timed_out = true;
                    tasks.abort_all();
                    break;
                }
            }
        }

        let now = Utc::now();
        job.targets
            .iter()
            .zip(slots)
            .map(|(target, slot)| {
                slot.unwrap_or_else(|| {
                    let reason = if timed_out {
                        FailureReason::Timeout
                    } else {
                        FailureReason::Internal("scrape task panicked".to_string())
                    };
                    let result = ScrapeResult::failed(target.clone(), reason, now);
                    if let Some(tx) = &progress {
                        let _ = tx.send(result.clone());
                    }
                    result
                })
            })
            .collect()
    }

    /// Scrapes and analyzes one target. Never fails; problems become a failed result.
    pub async fn run_target(&self, job_id: Uuid, target: ScrapeTarget) -> ScrapeResult {
        let span = info_span!("scrape_target", job_id = %job_id, site = %target.name, host = target.is_host());
        async move {
            let permit = match self.sessions.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return ScrapeResult::failed(
                        target,
                        FailureReason::Internal("session pool closed".to_string()),
                        Utc::now(),
                    )
                }
            };
            debug!(available = self.sessions.available_permits(), "session admitted");

            let scraped =
                tokio::time::timeout(self.config.target_timeout, self.scrape_with_retries(&target))
                    .await;
            drop(permit);

            let snapshot = match scraped {
                Err(_) => {
                    warn!(timeout_secs = self.config.target_timeout.as_secs(), "target timed out");
                    return ScrapeResult::failed(target, FailureReason::Timeout, Utc::now());
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "target scrape failed");
                    return ScrapeResult::failed(target, err.failure_reason(), Utc::now());
                }
                Ok(Ok(snapshot)) => snapshot,
            };

            if let Some(store) = &self.artifacts {
                if let Err(err) = snapshot.persist(store, job_id).await {
                    warn!(error = %err, "could not persist page artifacts");
                }
            }
            self.analyze(target, snapshot).await
        }
        .instrument(span)
        .await
    }

    async fn scrape_with_retries(&self, target: &ScrapeTarget) -> Result<SiteSnapshot, ScrapeError> {
        let backoff = self.config.backoff;
        let mut retry = 0usize;
        loop {
            match self.scraper.scrape(target).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(err) if err.is_transient() && retry < backoff.max_retries => {
                    let delay = backoff.delay_for_attempt(retry);
                    retry += 1;
                    warn!(
                        error = %err,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "transient scrape failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Detection and extraction run on the blocking pool; a panic there fails only this target.
    async fn analyze(&self, target: ScrapeTarget, snapshot: SiteSnapshot) -> ScrapeResult {
        let detector = Arc::clone(&self.detector);
        let extractor = Arc::clone(&self.extractor);
        let fetched_at = snapshot.fetched_at();
        let analysis = tokio::task::spawn_blocking(move || {
            let tools = detector.detect(&snapshot);
            let inventory = extractor.extract(&snapshot);
            (tools, inventory)
        })
        .await;

        match analysis {
            Ok((tools, mut inventory)) => {
                if let Some(decoder) = &self.vin_decoder {
                    let enriched =
                        enrich_inventory(&mut inventory, decoder.as_ref(), self.extractor.rules())
                            .await;
                    debug!(enriched, "vin enrichment applied");
                }
                info!(
                    tools_present = tools.values().filter(|present| **present).count(),
                    vehicles = inventory.len(),
                    "target analyzed"
                );
                ScrapeResult::ok(target, tools, inventory, fetched_at)
            }
            Err(err) => {
                warn!(error = %err, "analysis failed");
                ScrapeResult::failed(
                    target,
                    FailureReason::Extraction(format!("analysis aborted: {err}")),
                    fetched_at,
                )
            }
        }
    }
}

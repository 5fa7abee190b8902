//! Persistent workers: claim a job, scrape, compare, persist the dossier, complete.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dossier_core::{DossierStatus, Job, JobStatus};
use dossier_storage::{BackoffPolicy, DossierStore, DossierStoreError, JobQueue, QueueError};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::builder::build_dossier;
use crate::coordinator::ScrapeCoordinator;

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Lease window granted by the queue; renewed every third of it.
    pub lease: Duration,
    /// Sleep between claims when the queue is empty.
    pub poll_interval: Duration,
    /// Consecutive claim storage errors tolerated before the worker stops.
    pub max_storage_errors: u32,
    pub storage_backoff: BackoffPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
            max_storage_errors: 5,
            storage_backoff: BackoffPolicy {
                max_retries: 5,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("job queue unavailable after {attempts} consecutive attempts: {last}")]
    StorageOutage { attempts: u32, last: QueueError },
}

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed {
        job_id: Uuid,
        dossier_id: Uuid,
        status: DossierStatus,
    },
    Failed { job_id: Uuid, reason: String },
    /// Canceled while running; results were discarded.
    Canceled { job_id: Uuid },
    /// Left to lease expiry so another worker retries it.
    Abandoned { job_id: Uuid, reason: String },
}

impl JobOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Canceled { job_id }
            | Self::Abandoned { job_id, .. } => *job_id,
        }
    }
}

pub struct Worker {
    id: String,
    queue: Arc<dyn JobQueue>,
    dossiers: Arc<dyn DossierStore>,
    coordinator: ScrapeCoordinator,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn JobQueue>,
        dossiers: Arc<dyn DossierStore>,
        coordinator: ScrapeCoordinator,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            dossiers,
            coordinator,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claims and processes jobs until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        info!(worker_id = %self.id, "worker started");
        let mut storage_errors = 0u32;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match self.run_once().await {
                Ok(Some(_)) => {
                    storage_errors = 0;
                    None
                }
                Ok(None) => {
                    storage_errors = 0;
                    Some(self.config.poll_interval)
                }
                Err(err) if err.is_storage() => {
                    storage_errors += 1;
                    if storage_errors >= self.config.max_storage_errors {
                        error!(worker_id = %self.id, error = %err, attempts = storage_errors, "job queue unavailable; stopping worker");
                        return Err(WorkerError::StorageOutage {
                            attempts: storage_errors,
                            last: err,
                        });
                    }
                    let delay = self
                        .config
                        .storage_backoff
                        .delay_for_attempt(storage_errors as usize - 1);
                    warn!(worker_id = %self.id, error = %err, attempts = storage_errors, delay_ms = delay.as_millis() as u64, "claim failed; backing off");
                    Some(delay)
                }
                Err(err) => {
                    warn!(worker_id = %self.id, error = %err, "claim failed");
                    Some(self.config.poll_interval)
                }
            };
            if let Some(delay) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!(worker_id = %self.id, "worker stopped");
        Ok(())
    }

    /// One claim. `Ok(None)` when nothing is claimable; errors come only from the claim itself.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, QueueError> {
        let Some(job) = self.queue.claim(&self.id).await? else {
            return Ok(None);
        };
        Ok(Some(self.process(job).await))
    }

    async fn process(&self, job: Job) -> JobOutcome {
        let span = info_span!("job", job_id = %job.id, worker_id = %self.id, attempt = job.attempt);
        async move {
            info!(targets = job.targets.len(), trigger = %job.trigger_type, "processing job");
            let renewal = self.spawn_renewal(job.id);
            let outcome = self.execute(&job).await;
            renewal.abort();
            match &outcome {
                JobOutcome::Completed { status, dossier_id, .. } => {
                    info!(dossier_id = %dossier_id, status = %status, "job completed")
                }
                JobOutcome::Failed { reason, .. } => warn!(reason = %reason, "job failed"),
                JobOutcome::Canceled { .. } => info!("job canceled; results discarded"),
                JobOutcome::Abandoned { reason, .. } => {
                    warn!(reason = %reason, "job abandoned; lease left to expire")
                }
            }
            outcome
        }
        .instrument(span)
        .await
    }

    fn spawn_renewal(&self, job_id: Uuid) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let worker_id = self.id.clone();
        let period = (self.config.lease / 3).max(Duration::from_millis(100));
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    match queue.renew(job_id, &worker_id).await {
                        Ok(expires_at) => debug!(expires_at = %expires_at, "lease renewed"),
                        Err(QueueError::Canceled(_)) => {
                            info!("job canceled; lease renewal stopped");
                            return;
                        }
                        Err(err @ QueueError::LeaseLost { .. }) => {
                            warn!(error = %err, "lease lost; renewal stopped");
                            return;
                        }
                        Err(err) => warn!(error = %err, "lease renewal failed"),
                    }
                }
            }
            .instrument(Span::current()),
        )
    }

    async fn execute(&self, job: &Job) -> JobOutcome {
        let results = match self.coordinator.run_job(job, None).await {
            Ok(results) => results,
            Err(err) => {
                if self.is_canceled(job.id).await {
                    return JobOutcome::Canceled { job_id: job.id };
                }
                return self.fail(job.id, err.failure_reason()).await;
            }
        };

        if self.is_canceled(job.id).await {
            return JobOutcome::Canceled { job_id: job.id };
        }

        let dossier = match build_dossier(job, &results, Utc::now()) {
            Ok(dossier) => dossier,
            Err(err) => return self.fail(job.id, err.to_string()).await,
        };

        let (dossier_id, status) = match self.dossiers.insert(&dossier).await {
            Ok(()) => (dossier.id, dossier.status),
            Err(DossierStoreError::DuplicateForJob { existing, .. }) => {
                match self.dossiers.get(existing).await {
                    Ok(Some(stored)) => {
                        info!(dossier_id = %existing, "reusing dossier from an earlier attempt");
                        (stored.id, stored.status)
                    }
                    Ok(None) => (existing, dossier.status),
                    Err(err) => return abandon(job.id, err),
                }
            }
            Err(err) => return abandon(job.id, err),
        };

        match self
            .queue
            .complete(job.id, &self.id, dossier_id, status)
            .await
        {
            Ok(()) => JobOutcome::Completed {
                job_id: job.id,
                dossier_id,
                status,
            },
            Err(QueueError::Canceled(_)) => {
                if let Err(err) = self.dossiers.delete(dossier_id).await {
                    warn!(dossier_id = %dossier_id, error = %err, "could not delete dossier of canceled job");
                }
                JobOutcome::Canceled { job_id: job.id }
            }
            Err(err) => abandon(job.id, err),
        }
    }

    async fn fail(&self, job_id: Uuid, reason: String) -> JobOutcome {
        match self.queue.fail(job_id, &self.id, &reason).await {
            Ok(()) => JobOutcome::Failed { job_id, reason },
            Err(QueueError::Canceled(_)) => JobOutcome::Canceled { job_id },
            Err(err) => abandon(job_id, err),
        }
    }

    async fn is_canceled(&self, job_id: Uuid) -> bool {
        match self.queue.get(job_id).await {
            Ok(Some(job)) => job.status == JobStatus::Canceled,
            Ok(None) => false,
            Err(err) => {
                warn!(error = %err, "could not read job status");
                false
            }
        }
    }
}

fn abandon(job_id: Uuid, err: impl std::fmt::Display) -> JobOutcome {
    JobOutcome::Abandoned {
        job_id,
        reason: err.to_string(),
    }
}

/// Starts `count` workers over one coordinator, so they share its session pool.
pub fn spawn_worker_pool(
    count: usize,
    queue: Arc<dyn JobQueue>,
    dossiers: Arc<dyn DossierStore>,
    coordinator: ScrapeCoordinator,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<Result<(), WorkerError>>> {
    let process_tag = Uuid::new_v4().simple().to_string();
    let process_tag = &process_tag[..8];
    (0..count.max(1))
        .map(|index| {
            let worker = Worker::new(
                format!("worker-{process_tag}-{index}"),
                queue.clone(),
                dossiers.clone(),
                coordinator.clone(),
                config,
            );
            let shutdown = shutdown.clone();
            tokio::spawn(async move { worker.run(shutdown).await })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorConfig;
    use crate::testing::{Behavior, ScriptedScraper};
    use async_trait::async_trait;
    use chrono::DateTime;
    use dossier_core::{ScrapeTarget, TriggerType};
    use dossier_scrape::RuleSet;
    use dossier_storage::{MemoryDossierStore, MemoryJobQueue, QueueConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HOST: &str = "https://host.example";
    const RIVAL: &str = "https://rival.example";

    struct Harness {
        queue: Arc<MemoryJobQueue>,
        dossiers: Arc<MemoryDossierStore>,
        coordinator: ScrapeCoordinator,
    }

    impl Harness {
        fn new(scraper: ScriptedScraper) -> Self {
            let config = CoordinatorConfig {
                max_sessions: 4,
                target_timeout: Duration::from_secs(600),
                job_timeout: Duration::from_secs(3600),
                backoff: BackoffPolicy::default(),
            };
            Self {
                queue: Arc::new(MemoryJobQueue::new(QueueConfig::default())),
                dossiers: Arc::new(MemoryDossierStore::new()),
                coordinator: ScrapeCoordinator::new(
                    Arc::new(scraper),
                    RuleSet::builtin().expect("rules"),
                    config,
                ),
            }
        }

        fn worker(&self, queue: Arc<dyn JobQueue>) -> Worker {
            Worker::new(
                "worker-test",
                queue,
                self.dossiers.clone(),
                self.coordinator.clone(),
                WorkerConfig::default(),
            )
        }

        async fn enqueue(&self) -> Uuid {
            self.queue
                .enqueue(
                    "user-1",
                    vec![
                        ScrapeTarget::host("Host Motors", HOST),
                        ScrapeTarget::competitor("Rival Auto", RIVAL),
                    ],
                    TriggerType::Admin,
                )
                .await
                .expect("enqueue")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn all_targets_ok_completes_the_job() {
        let harness = Harness::new(ScriptedScraper::default());
        let job_id = harness.enqueue().await;
        let worker = harness.worker(harness.queue.clone());

        let outcome = worker.run_once().await.unwrap().expect("claimed");
        let JobOutcome::Completed { dossier_id, status, .. } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(status, DossierStatus::Complete);

        let job = harness.queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert_eq!(job.dossier_id, Some(dossier_id));
        assert!(harness.dossiers.get(dossier_id).await.unwrap().is_some());
        assert!(worker.run_once().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_competitor_yields_a_partial_job() {
        let harness = Harness::new(ScriptedScraper::default().with(RIVAL, Behavior::Blocked));
        let job_id = harness.enqueue().await;
        let worker = harness.worker(harness.queue.clone());

        let outcome = worker.run_once().await.unwrap().expect("claimed");
        assert!(matches!(
            outcome,
            JobOutcome::Completed { status: DossierStatus::Degraded, .. }
        ));
        let job = harness.queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Partial);

        let dossier = harness.dossiers.find_by_job(job_id).await.unwrap().unwrap();
        assert_eq!(dossier.failed_targets.len(), 1);
        assert_eq!(dossier.failed_targets[0].url, RIVAL);
        assert!(dossier.competitors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn host_failure_fails_the_job_without_a_dossier() {
        let harness = Harness::new(ScriptedScraper::default().with(HOST, Behavior::Blocked));
        let job_id = harness.enqueue().await;
        let worker = harness.worker(harness.queue.clone());

        let outcome = worker.run_once().await.unwrap().expect("claimed");
        let JobOutcome::Failed { reason, .. } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(reason.starts_with("host scrape failed"), "{reason}");

        let job = harness.queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_reason.as_deref(), Some(reason.as_str()));
        assert!(harness.dossiers.find_by_job(job_id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_scrape_discards_results() {
        let harness = Harness::new(ScriptedScraper::default().with(
            HOST,
            Behavior::Ok {
                delay: Duration::from_secs(30),
            },
        ));
        let job_id = harness.enqueue().await;
        let worker = harness.worker(harness.queue.clone());

        let running = tokio::spawn(async move { worker.run_once().await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        harness.queue.cancel(job_id).await.expect("cancel");

        let outcome = running.await.unwrap().unwrap().expect("claimed");
        assert_eq!(outcome, JobOutcome::Canceled { job_id });
        let job = harness.queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert!(harness.dossiers.find_by_job(job_id).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dossier_from_an_earlier_attempt_is_reused() {
        let harness = Harness::new(ScriptedScraper::default());
        let job_id = harness.enqueue().await;
        let job = harness.queue.get(job_id).await.unwrap().unwrap();
        let earlier = build_dossier(
            &job,
            &harness.coordinator.run_job(&job, None).await.unwrap(),
            Utc::now(),
        )
        .unwrap();
        harness.dossiers.insert(&earlier).await.unwrap();

        let worker = harness.worker(harness.queue.clone());
        let outcome = worker.run_once().await.unwrap().expect("claimed");
        assert_eq!(
            outcome,
            JobOutcome::Completed {
                job_id,
                dossier_id: earlier.id,
                status: earlier.status,
            }
        );
    }

    struct CountingQueue {
        inner: Arc<MemoryJobQueue>,
        renewals: AtomicUsize,
    }

    #[async_trait]
    impl JobQueue for CountingQueue {
        async fn enqueue(
            &self,
            user_id: &str,
            targets: Vec<ScrapeTarget>,
            trigger_type: TriggerType,
        ) -> Result<Uuid, QueueError> {
            self.inner.enqueue(user_id, targets, trigger_type).await
        }

        async fn claim(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
            self.inner.claim(worker_id).await
        }

        async fn renew(&self, job_id: Uuid, worker_id: &str) -> Result<DateTime<Utc>, QueueError> {
            self.renewals.fetch_add(1, Ordering::SeqCst);
            self.inner.renew(job_id, worker_id).await
        }

        async fn complete(
            &self,
            job_id: Uuid,
            worker_id: &str,
            dossier_id: Uuid,
            dossier_status: DossierStatus,
        ) -> Result<(), QueueError> {
            self.inner
                .complete(job_id, worker_id, dossier_id, dossier_status)
                .await
        }

        async fn fail(&self, job_id: Uuid, worker_id: &str, reason: &str) -> Result<(), QueueError> {
            self.inner.fail(job_id, worker_id, reason).await
        }

        async fn cancel(&self, job_id: Uuid) -> Result<(), QueueError> {
            self.inner.cancel(job_id).await
        }

        async fn get(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
            self.inner.get(job_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lease_is_renewed_every_third_of_the_window() {
        let harness = Harness::new(ScriptedScraper::default().with(
            HOST,
            Behavior::Ok {
                delay: Duration::from_secs(250),
            },
        ));
        harness.enqueue().await;
        let counting = Arc::new(CountingQueue {
            inner: harness.queue.clone(),
            renewals: AtomicUsize::new(0),
        });
        let worker = harness.worker(counting.clone());

        let outcome = worker.run_once().await.unwrap().expect("claimed");
        assert!(matches!(outcome, JobOutcome::Completed { .. }));
        // 300s lease: renewals at 100s and 200s while the host takes 250s.
        assert_eq!(counting.renewals.load(Ordering::SeqCst), 2);
    }

    struct UnavailableQueue {
        claims: AtomicUsize,
    }

    #[async_trait]
    impl JobQueue for UnavailableQueue {
        async fn enqueue(&self, _: &str, _: Vec<ScrapeTarget>, _: TriggerType) -> Result<Uuid, QueueError> {
            Err(QueueError::Storage("connection refused".into()))
        }

        async fn claim(&self, _: &str) -> Result<Option<Job>, QueueError> {
            self.claims.fetch_add(1, Ordering::SeqCst);
            Err(QueueError::Storage("connection refused".into()))
        }

        async fn renew(&self, _: Uuid, _: &str) -> Result<DateTime<Utc>, QueueError> {
            Err(QueueError::Storage("connection refused".into()))
        }

        async fn complete(&self, _: Uuid, _: &str, _: Uuid, _: DossierStatus) -> Result<(), QueueError> {
            Err(QueueError::Storage("connection refused".into()))
        }

        async fn fail(&self, _: Uuid, _: &str, _: &str) -> Result<(), QueueError> {
            Err(QueueError::Storage("connection refused".into()))
        }

        async fn cancel(&self, _: Uuid) -> Result<(), QueueError> {
            Err(QueueError::Storage("connection refused".into()))
        }

        async fn get(&self, _: Uuid) -> Result<Option<Job>, QueueError> {
            Err(QueueError::Storage("connection refused".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn storage_outage_stops_the_worker() {
        let harness = Harness::new(ScriptedScraper::default());
        let queue = Arc::new(UnavailableQueue {
            claims: AtomicUsize::new(0),
        });
        let worker = harness.worker(queue.clone());
        let (_tx, rx) = watch::channel(false);

        let err = worker.run(rx).await.expect_err("outage");
        let WorkerError::StorageOutage { attempts, last } = err;
        assert_eq!(attempts, 5);
        assert!(last.is_storage());
        assert_eq!(queue.claims.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_drains_the_queue_and_stops_on_shutdown() {
        let harness = Harness::new(ScriptedScraper::default().with(
            RIVAL,
            Behavior::Ok {
                delay: Duration::from_secs(3),
            },
        ));
        let first = harness.enqueue().await;
        let second = harness.enqueue().await;
        let (tx, rx) = watch::channel(false);
        let handles = spawn_worker_pool(
            2,
            harness.queue.clone(),
            harness.dossiers.clone(),
            harness.coordinator.clone(),
            WorkerConfig {
                poll_interval: Duration::from_secs(1),
                ..Default::default()
            },
            rx,
        );

        for _ in 0..120 {
            let a = harness.queue.get(first).await.unwrap().unwrap();
            let b = harness.queue.get(second).await.unwrap().unwrap();
            if a.status.is_terminal() && b.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        for job_id in [first, second] {
            let job = harness.queue.get(job_id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Complete);
        }

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap().expect("clean stop");
        }
    }
}

//! Durable job lifecycle store with lease-based claiming.
//!
//! ```text
//! scheduler/admin        JobQueue                 worker
//!      │                    │                       │
//!      ├─ enqueue() ───────►│ queued                │
//!      │                    │◄────────── claim() ───┤ running, lease = now + window
//!      │                    │◄────────── renew() ───┤ lease extended
//!      │                    │◄─ complete()/fail() ──┤ terminal, event emitted
//!      ├─ cancel() ────────►│ canceled, event       │
//! ```
//!
//! A running job whose lease lapsed is claimable again, so a crashed worker's job
//! moves to another worker. Every mutating call from a worker is fenced by its id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dossier_core::{
    validate_targets, CompletionEvent, DossierStatus, Job, JobStatus, JobTransitionError,
    ScrapeTarget, TargetListError, TriggerType,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{CompletionSink, TracingCompletionSink};

pub const EXHAUSTED_REASON: &str = "lease attempts exhausted";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid targets: {0}")]
    InvalidTargets(#[from] TargetListError),
    #[error("a scheduled job already exists for this user and period: {existing}")]
    DuplicateScheduled { existing: Uuid },
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {job_id} is no longer leased to worker {worker_id}")]
    LeaseLost { job_id: Uuid, worker_id: String },
    #[error("job {0} was canceled")]
    Canceled(Uuid),
    #[error(transparent)]
    Transition(#[from] JobTransitionError),
    #[error("queue storage error: {0}")]
    Storage(String),
}

impl QueueError {
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub lease: Duration,
    /// Claims allowed before a job whose lease keeps lapsing is failed.
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(300),
            max_attempts: 3,
        }
    }
}

impl QueueConfig {
    pub fn lease_delta(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lease.as_millis().min(i64::MAX as u128) as i64)
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        user_id: &str,
        targets: Vec<ScrapeTarget>,
        trigger_type: TriggerType,
    ) -> Result<Uuid, QueueError>;

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>, QueueError>;

    /// Extends the lease; returns the new expiry.
    async fn renew(&self, job_id: Uuid, worker_id: &str) -> Result<DateTime<Utc>, QueueError>;

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        dossier_id: Uuid,
        dossier_status: DossierStatus,
    ) -> Result<(), QueueError>;

    async fn fail(&self, job_id: Uuid, worker_id: &str, reason: &str) -> Result<(), QueueError>;

    async fn cancel(&self, job_id: Uuid) -> Result<(), QueueError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, QueueError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: StdMutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: StdMutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fencing check shared by the stores: the caller must still hold the lease on a running job.
pub(crate) fn check_lease(
    job_id: Uuid,
    status: JobStatus,
    lease_owner: Option<&str>,
    worker_id: &str,
    to: JobStatus,
) -> Result<(), QueueError> {
    match status {
        JobStatus::Canceled => Err(QueueError::Canceled(job_id)),
        JobStatus::Running if lease_owner == Some(worker_id) => Ok(()),
        JobStatus::Running => Err(QueueError::LeaseLost {
            job_id,
            worker_id: worker_id.to_string(),
        }),
        from => Err(QueueError::Transition(JobTransitionError { from, to })),
    }
}

pub(crate) fn completion_event(job: &Job) -> CompletionEvent {
    CompletionEvent {
        job_id: job.id,
        user_id: job.user_id.clone(),
        dossier_id: job.dossier_id,
        status: job.status,
    }
}

#[derive(Debug)]
struct QueuedJob {
    seq: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    jobs: HashMap<Uuid, QueuedJob>,
    next_seq: u64,
}

/// Single-process queue used when no database is configured, and in tests.
pub struct MemoryJobQueue {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn CompletionSink>,
    state: Mutex<MemoryQueueState>,
}

impl MemoryJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            sink: Arc::new(TracingCompletionSink),
            state: Mutex::new(MemoryQueueState::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn CompletionSink>) -> Self {
        self.sink = sink;
        self
    }

    fn finish(job: &mut Job, to: JobStatus, now: DateTime<Utc>) -> Result<(), QueueError> {
        job.transition(to)?;
        job.completed_at = Some(now);
        job.lease_owner = None;
        job.lease_expires_at = None;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        user_id: &str,
        targets: Vec<ScrapeTarget>,
        trigger_type: TriggerType,
    ) -> Result<Uuid, QueueError> {
        validate_targets(&targets)?;
        let job = Job::new(user_id, targets, trigger_type, self.clock.now());

        let mut state = self.state.lock().await;
        if trigger_type == TriggerType::Scheduled {
            if let Some(existing) = state.jobs.values().find(|q| {
                q.job.trigger_type == TriggerType::Scheduled
                    && q.job.user_id == job.user_id
                    && q.job.period_key == job.period_key
            }) {
                return Err(QueueError::DuplicateScheduled {
                    existing: existing.job.id,
                });
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let job_id = job.id;
        info!(
            job_id = %job_id,
            user_id,
            trigger = %trigger_type,
            period = %job.period_key,
            targets = job.targets.len(),
            "job enqueued"
        );
        state.jobs.insert(job_id, QueuedJob { seq, job });
        Ok(job_id)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let now = self.clock.now();
        let mut events = Vec::new();

        let claimed = {
            let mut state = self.state.lock().await;

            for queued in state.jobs.values_mut() {
                let job = &mut queued.job;
                if job.lease_expired(now) && job.attempt >= self.config.max_attempts {
                    Self::finish(job, JobStatus::Failed, now)?;
                    job.failure_reason = Some(EXHAUSTED_REASON.to_string());
                    warn!(job_id = %job.id, attempt = job.attempt, "job failed after repeated lease expiry");
                    events.push(completion_event(job));
                }
            }

            let next = state
                .jobs
                .values()
                .filter(|q| q.job.status == JobStatus::Queued || q.job.lease_expired(now))
                .min_by_key(|q| (q.job.trigger_type.priority_tier(), q.seq))
                .map(|q| q.job.id);

            match next {
                None => None,
                Some(job_id) => {
                    let queued = state
                        .jobs
                        .get_mut(&job_id)
                        .ok_or(QueueError::NotFound(job_id))?;
                    let job = &mut queued.job;
                    let previous_owner = job.lease_owner.take();
                    job.transition(JobStatus::Running)?;
                    job.attempt += 1;
                    job.lease_owner = Some(worker_id.to_string());
                    job.lease_expires_at = Some(now + self.config.lease_delta());
                    job.started_at.get_or_insert(now);
                    if let Some(previous) = previous_owner {
                        warn!(job_id = %job.id, previous_worker = %previous, worker_id, "reclaimed job with lapsed lease");
                    }
                    info!(job_id = %job.id, worker_id, attempt = job.attempt, "job claimed");
                    Some(job.clone())
                }
            }
        };

        for event in events {
            self.sink.emit(event);
        }
        Ok(claimed)
    }

    async fn renew(&self, job_id: Uuid, worker_id: &str) -> Result<DateTime<Utc>, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let job = &mut state
            .jobs
            .get_mut(&job_id)
            .ok_or(QueueError::NotFound(job_id))?
            .job;
        check_lease(
            job_id,
            job.status,
            job.lease_owner.as_deref(),
            worker_id,
            JobStatus::Running,
        )?;
        let expires = now + self.config.lease_delta();
        job.lease_expires_at = Some(expires);
        Ok(expires)
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        dossier_id: Uuid,
        dossier_status: DossierStatus,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        let to = dossier_status.job_status();
        let event = {
            let mut state = self.state.lock().await;
            let job = &mut state
                .jobs
                .get_mut(&job_id)
                .ok_or(QueueError::NotFound(job_id))?
                .job;
            check_lease(job_id, job.status, job.lease_owner.as_deref(), worker_id, to)?;
            Self::finish(job, to, now)?;
            job.dossier_id = Some(dossier_id);
            info!(job_id = %job_id, dossier_id = %dossier_id, status = %to, "job completed");
            completion_event(job)
        };
        self.sink.emit(event);
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, worker_id: &str, reason: &str) -> Result<(), QueueError> {
        let now = self.clock.now();
        let event = {
            let mut state = self.state.lock().await;
            let job = &mut state
                .jobs
                .get_mut(&job_id)
                .ok_or(QueueError::NotFound(job_id))?
                .job;
            check_lease(
                job_id,
                job.status,
                job.lease_owner.as_deref(),
                worker_id,
                JobStatus::Failed,
            )?;
            Self::finish(job, JobStatus::Failed, now)?;
            job.failure_reason = Some(reason.to_string());
            warn!(job_id = %job_id, reason, "job failed");
            completion_event(job)
        };
        self.sink.emit(event);
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<(), QueueError> {
        let now = self.clock.now();
        let event = {
            let mut state = self.state.lock().await;
            let job = &mut state
                .jobs
                .get_mut(&job_id)
                .ok_or(QueueError::NotFound(job_id))?
                .job;
            Self::finish(job, JobStatus::Canceled, now)?;
            info!(job_id = %job_id, "job canceled");
            completion_event(job)
        };
        self.sink.emit(event);
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).map(|q| q.job.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelCompletionSink;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 12, 6, 0, 0).single().unwrap()
    }

    fn targets(name: &str) -> Vec<ScrapeTarget> {
        vec![
            ScrapeTarget::host(name, format!("https://{name}.example")),
            ScrapeTarget::competitor("Rival", "https://rival.example"),
        ]
    }

    fn queue(
        config: QueueConfig,
    ) -> (
        MemoryJobQueue,
        Arc<ManualClock>,
        tokio::sync::mpsc::UnboundedReceiver<CompletionEvent>,
    ) {
        let clock = Arc::new(ManualClock::new(start()));
        let (sink, rx) = ChannelCompletionSink::channel();
        let queue = MemoryJobQueue::new(config)
            .with_clock(clock.clone())
            .with_sink(Arc::new(sink));
        (queue, clock, rx)
    }

    #[tokio::test]
    async fn admin_jobs_are_claimed_before_scheduled_fifo_within_tier() {
        let (queue, _clock, _rx) = queue(QueueConfig::default());
        let s1 = queue.enqueue("u1", targets("a"), TriggerType::Scheduled).await.unwrap();
        let s2 = queue.enqueue("u2", targets("b"), TriggerType::Scheduled).await.unwrap();
        let a1 = queue.enqueue("u3", targets("c"), TriggerType::Admin).await.unwrap();
        let a2 = queue.enqueue("u1", targets("d"), TriggerType::Admin).await.unwrap();

        let mut order = Vec::new();
        while let Some(job) = queue.claim("w1").await.unwrap() {
            order.push(job.id);
        }
        assert_eq!(order, vec![a1, a2, s1, s2]);
    }

    #[tokio::test]
    async fn scheduled_enqueue_is_idempotent_per_user_per_week() {
        let (queue, clock, _rx) = queue(QueueConfig::default());
        let first = queue.enqueue("u1", targets("a"), TriggerType::Scheduled).await.unwrap();

        clock.advance(chrono::Duration::days(2));
        match queue.enqueue("u1", targets("a"), TriggerType::Scheduled).await {
            Err(QueueError::DuplicateScheduled { existing }) => assert_eq!(existing, first),
            other => panic!("expected duplicate rejection, got {other:?}"),
        }

        queue.enqueue("u2", targets("b"), TriggerType::Scheduled).await.unwrap();
        queue.enqueue("u1", targets("a"), TriggerType::Admin).await.unwrap();
        queue.enqueue("u1", targets("a"), TriggerType::Admin).await.unwrap();

        clock.advance(chrono::Duration::days(7));
        queue.enqueue("u1", targets("a"), TriggerType::Scheduled).await.unwrap();
    }

    #[tokio::test]
    async fn failed_scheduled_job_still_blocks_its_period() {
        let (queue, _clock, _rx) = queue(QueueConfig::default());
        let job_id = queue.enqueue("u1", targets("a"), TriggerType::Scheduled).await.unwrap();
        queue.claim("w1").await.unwrap().unwrap();
        queue.fail(job_id, "w1", "host failed: timeout").await.unwrap();

        assert!(matches!(
            queue.enqueue("u1", targets("a"), TriggerType::Scheduled).await,
            Err(QueueError::DuplicateScheduled { .. })
        ));
        queue.enqueue("u1", targets("a"), TriggerType::Admin).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_target_lists_are_rejected() {
        let (queue, _clock, _rx) = queue(QueueConfig::default());
        let err = queue
            .enqueue("u1", vec![ScrapeTarget::competitor("Rival", "https://rival.example")], TriggerType::Admin)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTargets(TargetListError::HostNotFirst)));
    }

    #[tokio::test]
    async fn lapsed_lease_moves_job_to_another_worker_and_fences_the_old_one() {
        let (queue, clock, _rx) = queue(QueueConfig::default());
        let job_id = queue.enqueue("u1", targets("a"), TriggerType::Scheduled).await.unwrap();

        let first = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        assert!(queue.claim("w2").await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(301));
        let second = queue.claim("w2").await.unwrap().unwrap();
        assert_eq!(second.id, job_id);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.started_at, first.started_at);

        assert!(matches!(
            queue.renew(job_id, "w1").await,
            Err(QueueError::LeaseLost { .. })
        ));
        assert!(matches!(
            queue.complete(job_id, "w1", Uuid::new_v4(), DossierStatus::Complete).await,
            Err(QueueError::LeaseLost { .. })
        ));
        queue
            .complete(job_id, "w2", Uuid::new_v4(), DossierStatus::Complete)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn renewal_keeps_the_lease() {
        let (queue, clock, _rx) = queue(QueueConfig::default());
        let job_id = queue.enqueue("u1", targets("a"), TriggerType::Scheduled).await.unwrap();
        queue.claim("w1").await.unwrap().unwrap();

        clock.advance(chrono::Duration::seconds(200));
        let expires = queue.renew(job_id, "w1").await.unwrap();
        assert_eq!(expires, start() + chrono::Duration::seconds(500));

        clock.advance(chrono::Duration::seconds(200));
        assert!(queue.claim("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn repeated_lease_expiry_fails_the_job() {
        let (queue, clock, mut rx) = queue(QueueConfig {
            lease: Duration::from_secs(60),
            max_attempts: 2,
        });
        let job_id = queue.enqueue("u1", targets("a"), TriggerType::Admin).await.unwrap();

        queue.claim("w1").await.unwrap().unwrap();
        clock.advance(chrono::Duration::seconds(61));
        queue.claim("w2").await.unwrap().unwrap();
        clock.advance(chrono::Duration::seconds(61));
        assert!(queue.claim("w3").await.unwrap().is_none());

        let job = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_reason.as_deref(), Some(EXHAUSTED_REASON));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.status, JobStatus::Failed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn cancel_is_terminal_and_fences_the_worker() {
        let (queue, _clock, mut rx) = queue(QueueConfig::default());
        let job_id = queue.enqueue("u1", targets("a"), TriggerType::Admin).await.unwrap();
        queue.claim("w1").await.unwrap().unwrap();

        queue.cancel(job_id).await.unwrap();
        assert!(matches!(queue.cancel(job_id).await, Err(QueueError::Transition(_))));
        assert!(matches!(queue.renew(job_id, "w1").await, Err(QueueError::Canceled(_))));
        assert!(matches!(
            queue.complete(job_id, "w1", Uuid::new_v4(), DossierStatus::Complete).await,
            Err(QueueError::Canceled(_))
        ));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.status, JobStatus::Canceled);
        assert_eq!(event.dossier_id, None);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn degraded_dossier_marks_job_partial_and_emits_once() {
        let (queue, _clock, mut rx) = queue(QueueConfig::default());
        let job_id = queue.enqueue("u1", targets("a"), TriggerType::Admin).await.unwrap();
        queue.claim("w1").await.unwrap().unwrap();
        let dossier_id = Uuid::new_v4();

        queue
            .complete(job_id, "w1", dossier_id, DossierStatus::Degraded)
            .await
            .unwrap();
        assert!(matches!(
            queue.fail(job_id, "w1", "late failure").await,
            Err(QueueError::Transition(_))
        ));

        let job = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Partial);
        assert_eq!(job.dossier_id, Some(dossier_id));
        assert!(job.completed_at.is_some());
        assert!(job.lease_owner.is_none());

        let event = rx.try_recv().unwrap();
        assert_eq!(event.dossier_id, Some(dossier_id));
        assert_eq!(event.user_id, "u1");
        assert!(rx.try_recv().is_err());
    }
}

//! Weekly scheduling. The scheduler only enqueues; workers do the rest.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use dossier_core::{ScrapeTarget, TriggerType};
use dossier_storage::{JobQueue, QueueError};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::SyncConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionFile {
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteEntry {
    pub name: String,
    pub url: String,
}

/// A user's host dealership and the competitors it is compared against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: String,
    pub host: SiteEntry,
    #[serde(default)]
    pub competitors: Vec<SiteEntry>,
}

impl Subscription {
    /// Host first, then competitors in file order.
    pub fn targets(&self) -> Vec<ScrapeTarget> {
        std::iter::once(ScrapeTarget::host(&self.host.name, &self.host.url))
            .chain(
                self.competitors
                    .iter()
                    .map(|c| ScrapeTarget::competitor(&c.name, &c.url)),
            )
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueSummary {
    pub enqueued: Vec<Uuid>,
    /// Users who already have a scheduled job this period.
    pub duplicates: usize,
    pub rejected: usize,
}

pub async fn load_subscriptions(path: &Path) -> Result<SubscriptionFile> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// One scheduled job per subscription. Storage errors abort the pass; other rejections are
/// counted and logged.
pub async fn enqueue_scheduled(
    queue: &dyn JobQueue,
    file: &SubscriptionFile,
) -> Result<EnqueueSummary, QueueError> {
    let mut summary = EnqueueSummary::default();
    for subscription in &file.subscriptions {
        match queue
            .enqueue(
                &subscription.user_id,
                subscription.targets(),
                TriggerType::Scheduled,
            )
            .await
        {
            Ok(job_id) => {
                info!(job_id = %job_id, user_id = %subscription.user_id, "scheduled job enqueued");
                summary.enqueued.push(job_id);
            }
            Err(QueueError::DuplicateScheduled { existing }) => {
                debug!(user_id = %subscription.user_id, existing = %existing, "already scheduled this period");
                summary.duplicates += 1;
            }
            Err(err) if err.is_storage() => return Err(err),
            Err(err) => {
                warn!(user_id = %subscription.user_id, error = %err, "subscription rejected");
                summary.rejected += 1;
            }
        }
    }
    Ok(summary)
}

async fn run_tick(queue: Arc<dyn JobQueue>, path: PathBuf) {
    let file = match load_subscriptions(&path).await {
        Ok(file) => file,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "scheduler tick skipped");
            return;
        }
    };
    match enqueue_scheduled(queue.as_ref(), &file).await {
        Ok(summary) => info!(
            enqueued = summary.enqueued.len(),
            duplicates = summary.duplicates,
            rejected = summary.rejected,
            "scheduler tick finished"
        ),
        Err(err) => warn!(error = %err, "scheduler tick aborted"),
    }
}

/// `None` unless the scheduler is enabled. The subscriptions file is re-read on every tick.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    queue: Arc<dyn JobQueue>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.schedule_cron.as_str();
    let path = config.subscriptions_path.clone();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let queue = queue.clone();
        let path = path.clone();
        Box::pin(async move { run_tick(queue, path).await })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron = %cron, subscriptions = %config.subscriptions_path.display(), "weekly scheduler configured");
    Ok(Some(sched))
}

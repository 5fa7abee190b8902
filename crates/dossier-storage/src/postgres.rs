//! Postgres-backed queue and dossier store.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dossier_core::{
    validate_targets, AskWhyAnswer, AskWhySection, DossierStatus, Dossier, DossierSummary, Job,
    JobStatus, JobTransitionError, ScrapeTarget, TriggerType,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::dossiers::{DossierStore, DossierStoreError};
use crate::events::{CompletionSink, TracingCompletionSink};
use crate::queue::{
    check_lease, completion_event, Clock, JobQueue, QueueConfig, QueueError, SystemClock,
    EXHAUSTED_REASON,
};

pub async fn connect_and_migrate(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("connecting to postgres")?;
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("running migrations")?;
    Ok(pool)
}

const JOB_COLUMNS: &str = "id, user_id, targets, trigger_type, status, attempt, period_key, \
     created_at, started_at, completed_at, lease_owner, lease_expires_at, dossier_id, failure_reason";

fn decode_err(err: impl std::fmt::Display) -> QueueError {
    QueueError::Storage(format!("decoding job row: {err}"))
}

fn job_from_row(row: &PgRow) -> Result<Job, QueueError> {
    let targets: Json<Vec<ScrapeTarget>> = row.try_get("targets")?;
    let trigger_type: String = row.try_get("trigger_type")?;
    let status: String = row.try_get("status")?;
    let attempt: i32 = row.try_get("attempt")?;
    Ok(Job {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        targets: targets.0,
        trigger_type: trigger_type.parse().map_err(decode_err)?,
        status: status.parse().map_err(decode_err)?,
        attempt: u32::try_from(attempt).map_err(decode_err)?,
        period_key: row.try_get("period_key")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        dossier_id: row.try_get("dossier_id")?,
        failure_reason: row.try_get("failure_reason")?,
    })
}

pub struct PgJobQueue {
    pool: PgPool,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn CompletionSink>,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self {
            pool,
            config,
            clock: Arc::new(SystemClock),
            sink: Arc::new(TracingCompletionSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn CompletionSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn lease_state(
        &self,
        job_id: Uuid,
    ) -> Result<Option<(JobStatus, Option<String>)>, QueueError> {
        let row = sqlx::query("SELECT status, lease_owner FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status")?;
        let owner: Option<String> = row.try_get("lease_owner")?;
        Ok(Some((status.parse().map_err(decode_err)?, owner)))
    }

    /// Explains why a fenced update touched no row.
    async fn diagnose(&self, job_id: Uuid, worker_id: &str, to: JobStatus) -> QueueError {
        match self.lease_state(job_id).await {
            Ok(None) => QueueError::NotFound(job_id),
            Ok(Some((status, owner))) => {
                match check_lease(job_id, status, owner.as_deref(), worker_id, to) {
                    Err(err) => err,
                    Ok(()) => QueueError::LeaseLost {
                        job_id,
                        worker_id: worker_id.to_string(),
                    },
                }
            }
            Err(err) => err,
        }
    }

    async fn finish_fenced(
        &self,
        job_id: Uuid,
        worker_id: &str,
        to: JobStatus,
        dossier_id: Option<Uuid>,
        failure_reason: Option<&str>,
    ) -> Result<Job, QueueError> {
        let sql = format!(
            r#"
            UPDATE jobs
               SET status = $3, dossier_id = $4, failure_reason = $5, completed_at = $6,
                   lease_owner = NULL, lease_expires_at = NULL
             WHERE id = $1 AND status = 'running' AND lease_owner = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_id)
            .bind(worker_id)
            .bind(to.as_str())
            .bind(dossier_id)
            .bind(failure_reason)
            .bind(self.clock.now())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.diagnose(job_id, worker_id, to).await),
        }
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(
        &self,
        user_id: &str,
        targets: Vec<ScrapeTarget>,
        trigger_type: TriggerType,
    ) -> Result<Uuid, QueueError> {
        validate_targets(&targets)?;
        let job = Job::new(user_id, targets, trigger_type, self.clock.now());

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (id, user_id, targets, trigger_type, status, attempt, period_key, created_at)
            VALUES ($1, $2, $3, $4, 'queued', 0, $5, $6)
            ON CONFLICT (user_id, period_key) WHERE trigger_type = 'scheduled' DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job.id)
        .bind(&job.user_id)
        .bind(Json(&job.targets))
        .bind(trigger_type.as_str())
        .bind(&job.period_key)
        .bind(job.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_none() {
            let existing: Uuid = sqlx::query(
                r#"
                SELECT id FROM jobs
                 WHERE user_id = $1 AND period_key = $2 AND trigger_type = 'scheduled'
                "#,
            )
            .bind(&job.user_id)
            .bind(&job.period_key)
            .fetch_one(&self.pool)
            .await?
            .try_get("id")?;
            return Err(QueueError::DuplicateScheduled { existing });
        }

        info!(
            job_id = %job.id,
            user_id,
            trigger = %trigger_type,
            period = %job.period_key,
            "job enqueued"
        );
        Ok(job.id)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let exhausted_sql = format!(
            r#"
            UPDATE jobs
               SET status = 'failed', failure_reason = $3, completed_at = $1,
                   lease_owner = NULL, lease_expires_at = NULL
             WHERE status = 'running'
               AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
               AND attempt >= $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        let exhausted = sqlx::query(&exhausted_sql)
            .bind(now)
            .bind(i32::try_from(self.config.max_attempts).unwrap_or(i32::MAX))
            .bind(EXHAUSTED_REASON)
            .fetch_all(&mut *tx)
            .await?;

        let claim_sql = format!(
            r#"
            UPDATE jobs
               SET status = 'running', attempt = attempt + 1, lease_owner = $1,
                   lease_expires_at = $2, started_at = COALESCE(started_at, $3)
             WHERE id = (
                   SELECT id FROM jobs
                    WHERE status = 'queued'
                       OR (status = 'running' AND (lease_expires_at IS NULL OR lease_expires_at <= $3))
                    ORDER BY CASE trigger_type WHEN 'admin' THEN 0 ELSE 1 END, seq
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
             )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let claimed = sqlx::query(&claim_sql)
            .bind(worker_id)
            .bind(now + self.config.lease_delta())
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;

        for row in &exhausted {
            let job = job_from_row(row)?;
            warn!(job_id = %job.id, attempt = job.attempt, "job failed after repeated lease expiry");
            self.sink.emit(completion_event(&job));
        }

        match claimed {
            Some(row) => {
                let job = job_from_row(&row)?;
                info!(job_id = %job.id, worker_id, attempt = job.attempt, "job claimed");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn renew(&self, job_id: Uuid, worker_id: &str) -> Result<DateTime<Utc>, QueueError> {
        let expires = self.clock.now() + self.config.lease_delta();
        let row = sqlx::query(
            r#"
            UPDATE jobs SET lease_expires_at = $3
             WHERE id = $1 AND status = 'running' AND lease_owner = $2
            RETURNING id
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(expires)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(_) => Ok(expires),
            None => Err(self.diagnose(job_id, worker_id, JobStatus::Running).await),
        }
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        dossier_id: Uuid,
        dossier_status: DossierStatus,
    ) -> Result<(), QueueError> {
        let job = self
            .finish_fenced(job_id, worker_id, dossier_status.job_status(), Some(dossier_id), None)
            .await?;
        info!(job_id = %job_id, dossier_id = %dossier_id, status = %job.status, "job completed");
        self.sink.emit(completion_event(&job));
        Ok(())
    }

    async fn fail(&self, job_id: Uuid, worker_id: &str, reason: &str) -> Result<(), QueueError> {
        let job = self
            .finish_fenced(job_id, worker_id, JobStatus::Failed, None, Some(reason))
            .await?;
        warn!(job_id = %job_id, reason, "job failed");
        self.sink.emit(completion_event(&job));
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<(), QueueError> {
        let sql = format!(
            r#"
            UPDATE jobs
               SET status = 'canceled', completed_at = $2, lease_owner = NULL, lease_expires_at = NULL
             WHERE id = $1 AND status IN ('queued', 'running')
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(job_id)
            .bind(self.clock.now())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let job = job_from_row(&row)?;
                info!(job_id = %job_id, "job canceled");
                self.sink.emit(completion_event(&job));
                Ok(())
            }
            None => match self.lease_state(job_id).await? {
                None => Err(QueueError::NotFound(job_id)),
                Some((from, _)) => Err(QueueError::Transition(JobTransitionError {
                    from,
                    to: JobStatus::Canceled,
                })),
            },
        }
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }
}

pub struct PgDossierStore {
    pool: PgPool,
}

impl PgDossierStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn exists(&self, id: Uuid) -> Result<bool, DossierStoreError> {
        let row = sqlx::query("SELECT 1 AS present FROM dossiers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl DossierStore for PgDossierStore {
    async fn insert(&self, dossier: &Dossier) -> Result<(), DossierStoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO dossiers (id, job_id, user_id, generated_at, status, competitor_count, body)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (job_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(dossier.id)
        .bind(dossier.job_id)
        .bind(&dossier.user_id)
        .bind(dossier.generated_at)
        .bind(dossier.status.as_str())
        .bind(i32::try_from(dossier.competitors.len()).unwrap_or(i32::MAX))
        .bind(Json(dossier))
        .fetch_optional(&self.pool)
        .await?;

        if inserted.is_none() {
            let existing: Uuid = sqlx::query("SELECT id FROM dossiers WHERE job_id = $1")
                .bind(dossier.job_id)
                .fetch_one(&self.pool)
                .await?
                .try_get("id")?;
            return Err(DossierStoreError::DuplicateForJob {
                job_id: dossier.job_id,
                existing,
            });
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Dossier>, DossierStoreError> {
        let row = sqlx::query("SELECT body FROM dossiers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let Json(mut dossier): Json<Dossier> = row.try_get("body")?;

        let answers = sqlx::query("SELECT answer FROM ask_why_answers WHERE dossier_id = $1")
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        for row in answers {
            let Json(answer): Json<AskWhyAnswer> = row.try_get("answer")?;
            dossier.ask_why.insert(
                dossier_core::ask_why_key(answer.section, &answer.question_id),
                answer,
            );
        }
        Ok(Some(dossier))
    }

    async fn find_by_job(&self, job_id: Uuid) -> Result<Option<Dossier>, DossierStoreError> {
        let row = sqlx::query("SELECT id FROM dossiers WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => self.get(row.try_get("id")?).await,
            None => Ok(None),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<(), DossierStoreError> {
        let result = sqlx::query("DELETE FROM dossiers WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DossierStoreError::NotFound(id));
        }
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<DossierSummary>, DossierStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, generated_at, status, competitor_count
              FROM dossiers
             WHERE user_id = $1
             ORDER BY generated_at DESC, id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let competitor_count: i32 = row.try_get("competitor_count")?;
            out.push(DossierSummary {
                id: row.try_get("id")?,
                job_id: row.try_get("job_id")?,
                generated_at: row.try_get("generated_at")?,
                status: status
                    .parse()
                    .map_err(|e| DossierStoreError::Storage(format!("{e}")))?,
                competitor_count: usize::try_from(competitor_count).unwrap_or_default(),
            });
        }
        Ok(out)
    }

    async fn cached_answer(
        &self,
        id: Uuid,
        section: AskWhySection,
        question_id: &str,
    ) -> Result<Option<AskWhyAnswer>, DossierStoreError> {
        let row = sqlx::query(
            r#"
            SELECT answer FROM ask_why_answers
             WHERE dossier_id = $1 AND section = $2 AND question_id = $3
            "#,
        )
        .bind(id)
        .bind(section.as_str())
        .bind(question_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let Json(answer): Json<AskWhyAnswer> = row.try_get("answer")?;
                Ok(Some(answer))
            }
            None if self.exists(id).await? => Ok(None),
            None => Err(DossierStoreError::NotFound(id)),
        }
    }

    async fn append_answer(
        &self,
        id: Uuid,
        answer: &AskWhyAnswer,
    ) -> Result<AskWhyAnswer, DossierStoreError> {
        if !self.exists(id).await? {
            return Err(DossierStoreError::NotFound(id));
        }
        sqlx::query(
            r#"
            INSERT INTO ask_why_answers (dossier_id, section, question_id, answer)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (dossier_id, section, question_id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(answer.section.as_str())
        .bind(&answer.question_id)
        .bind(Json(answer))
        .execute(&self.pool)
        .await?;

        self.cached_answer(id, answer.section, &answer.question_id)
            .await?
            .ok_or(DossierStoreError::NotFound(id))
    }
}

// crates/logoflow/src/jobs/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::jobs::model::{Job, JobRow, JobStatus, LogoDetection, NewJob};

/// Outcome of a guarded status write.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The row moved to the requested state.
    Applied(Job),
    /// The row was not in a legal predecessor state. `current` is `None`
    /// when no row exists for the id.
    Rejected { current: Option<JobStatus> },
}

impl Transition {
    pub fn applied(&self) -> Option<&Job> {
        match self {
            Transition::Applied(job) => Some(job),
            Transition::Rejected { .. } => None,
        }
    }
}

/// Durable record of job identity and status.
///
/// Every transition is keyed by job id and "sets final state", so replaying
/// the same write converges instead of duplicating.
#[async_trait]
pub trait JobLedger: Send + Sync {
    async fn create_job(&self, job: NewJob) -> Result<Job, PersistenceError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, PersistenceError>;

    /// `pending|processing -> processing`.
    async fn mark_processing(&self, id: Uuid) -> Result<Transition, PersistenceError>;

    /// Moves the job to a failed `status` carrying `error_message`.
    async fn update_job_error(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: &str,
    ) -> Result<Transition, PersistenceError>;

    /// `pending -> failed` after the message for the job could not be
    /// published. A row the consumer has already claimed is left alone.
    async fn compensate_pending(
        &self,
        id: Uuid,
        error_message: &str,
    ) -> Result<Transition, PersistenceError>;

    /// Moves the job to a completed `status` with its detection result.
    async fn update_job_result(
        &self,
        id: Uuid,
        status: JobStatus,
        result_url: &str,
        logos: &[LogoDetection],
        completed_at: DateTime<Utc>,
    ) -> Result<Transition, PersistenceError>;
}

#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn current_status(&self, id: Uuid) -> Result<Option<JobStatus>, PersistenceError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        status
            .map(|s| {
                JobStatus::parse(&s).ok_or_else(|| {
                    PersistenceError::Corrupt(format!("job {id} has unknown status {s:?}"))
                })
            })
            .transpose()
    }

    async fn finish(
        &self,
        id: Uuid,
        row: Option<JobRow>,
    ) -> Result<Transition, PersistenceError> {
        match row {
            Some(row) => Ok(Transition::Applied(Job::try_from(row)?)),
            None => Ok(Transition::Rejected {
                current: self.current_status(id).await?,
            }),
        }
    }

    // ----------------------------
    // Operator queries
    // ----------------------------

    pub async fn find_by_source_key(&self, key: &str) -> Result<Vec<Job>, PersistenceError> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE s3_key = $1 ORDER BY created_at ASC",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    /// Jobs still `pending` or `processing` whose last transition is older than `cutoff`.
    ///
    /// These are either compensation failures left `pending`, or consumers that
    /// died mid-job and have not been redelivered yet.
    pub async fn list_stuck(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Job>, PersistenceError> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT *
            FROM jobs
            WHERE status IN ('pending', 'processing')
              AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    /// Returns (status, count) for every status present in the ledger.
    pub async fn status_counts(&self) -> Result<Vec<(String, i64)>, PersistenceError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

fn status_list(target: JobStatus) -> Vec<String> {
    target
        .predecessors()
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

#[async_trait]
impl JobLedger for JobsRepo {
    async fn create_job(&self, job: NewJob) -> Result<Job, PersistenceError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (id, status, s3_key, upload_url)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(job.status.as_str())
        .bind(&job.source_key)
        .bind(&job.upload_url)
        .fetch_one(&self.pool)
        .await?;

        Job::try_from(row)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, PersistenceError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn mark_processing(&self, id: Uuid) -> Result<Transition, PersistenceError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'processing',
                updated_at = GREATEST(now(), updated_at)
            WHERE id = $1
              AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status_list(JobStatus::Processing))
        .fetch_optional(&self.pool)
        .await?;

        self.finish(id, row).await
    }

    async fn update_job_error(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: &str,
    ) -> Result<Transition, PersistenceError> {
        if status != JobStatus::Failed {
            return Err(PersistenceError::Corrupt(format!(
                "update_job_error cannot write status {status}"
            )));
        }

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = $2,
                error_message = $3,
                result_url = NULL,
                updated_at = GREATEST(now(), updated_at),
                completed_at = COALESCE(completed_at, GREATEST(now(), updated_at))
            WHERE id = $1
              AND status = ANY($4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .bind(status_list(status))
        .fetch_optional(&self.pool)
        .await?;

        self.finish(id, row).await
    }

    async fn compensate_pending(
        &self,
        id: Uuid,
        error_message: &str,
    ) -> Result<Transition, PersistenceError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'failed',
                error_message = $2,
                updated_at = GREATEST(now(), updated_at),
                completed_at = COALESCE(completed_at, GREATEST(now(), updated_at))
            WHERE id = $1
              AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(error_message)
        .fetch_optional(&self.pool)
        .await?;

        self.finish(id, row).await
    }

    async fn update_job_result(
        &self,
        id: Uuid,
        status: JobStatus,
        result_url: &str,
        logos: &[LogoDetection],
        completed_at: DateTime<Utc>,
    ) -> Result<Transition, PersistenceError> {
        if status != JobStatus::Completed {
            return Err(PersistenceError::Corrupt(format!(
                "update_job_result cannot write status {status}"
            )));
        }

        let logos_json = serde_json::to_value(logos)
            .map_err(|e| PersistenceError::Backend(anyhow::anyhow!(e)))?;

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = $2,
                result_url = $3,
                logos_found = $4,
                logos_json = $5,
                error_message = NULL,
                updated_at = GREATEST(now(), updated_at),
                completed_at = COALESCE(completed_at, GREATEST($6, updated_at))
            WHERE id = $1
              AND status = ANY($7)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(result_url)
        .bind(logos.len() as i32)
        .bind(logos_json)
        .bind(completed_at)
        .bind(status_list(status))
        .fetch_optional(&self.pool)
        .await?;

        self.finish(id, row).await
    }
}

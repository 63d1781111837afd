//! Email job repository

use crate::db::{db_error, DatabasePool};
use crate::models::{CreateEmailJob, EmailJob, JobInsert, JobStatus, QueueStats, StaleRelease};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outpost_common::types::JobId;
use outpost_common::{Error, Result};
use sqlx::Row;
use uuid::Uuid;

/// Email job repository trait
///
/// State transitions are conditional on the current status so that a job is
/// only ever advanced by the worker that claimed it, and terminal states are
/// never overwritten. Each transition returns whether it took effect.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a job, or return the existing one with the same idempotency key
    async fn insert(&self, input: CreateEmailJob) -> Result<JobInsert>;
    async fn get(&self, id: JobId) -> Result<Option<EmailJob>>;
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<EmailJob>>;
    async fn find_by_provider_message_id(&self, message_id: &str) -> Result<Option<EmailJob>>;
    /// Pending jobs due at `now`, highest priority first
    async fn fetch_ready(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<EmailJob>>;
    /// pending -> processing
    async fn claim(&self, id: JobId) -> Result<bool>;
    /// processing -> sent; the provider may not have returned an id
    async fn mark_sent(&self, id: JobId, provider_message_id: Option<&str>) -> Result<bool>;
    /// processing -> pending, with the attempt recorded
    async fn schedule_retry(
        &self,
        id: JobId,
        attempts: i32,
        next_run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool>;
    /// processing -> failed
    async fn mark_failed(&self, id: JobId, error: &str) -> Result<bool>;
    /// processing -> dead_letter
    async fn mark_dead_letter(&self, id: JobId, attempts: i32, error: &str) -> Result<bool>;
    /// processing -> cancelled
    async fn mark_skipped(&self, id: JobId, reason: &str) -> Result<bool>;
    /// pending -> cancelled
    async fn cancel(&self, id: JobId) -> Result<bool>;
    async fn cancel_by_campaign(&self, campaign_id: &str) -> Result<u64>;
    /// processing claims older than `claimed_before` -> pending, counting the
    /// lost attempt; claims on their last attempt -> dead_letter
    async fn release_stale(
        &self,
        claimed_before: DateTime<Utc>,
        error: &str,
    ) -> Result<StaleRelease>;
    async fn stats(&self) -> Result<QueueStats>;
}

/// Database job repository
pub struct DbJobRepository {
    pool: DatabasePool,
}

impl DbJobRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn transition(&self, sql: &str, id: JobId, message: &str) -> Result<bool> {
        let result = sqlx::query(sql)
            .bind(id)
            .bind(message)
            .execute(self.pool.pool())
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl JobRepository for DbJobRepository {
    async fn insert(&self, input: CreateEmailJob) -> Result<JobInsert> {
        let job = EmailJob::from_create(Uuid::now_v7(), input, Utc::now());

        let inserted = sqlx::query_as::<_, EmailJob>(
            r#"
            INSERT INTO email_jobs (
                id, to_address, from_address, subject, body, headers,
                campaign_id, lead_id, client_id, priority, attempts, max_attempts,
                status, scheduled_for, next_run_at, idempotency_key, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(&job.to_address)
        .bind(&job.from_address)
        .bind(&job.subject)
        .bind(&job.body)
        .bind(&job.headers)
        .bind(&job.campaign_id)
        .bind(&job.lead_id)
        .bind(&job.client_id)
        .bind(job.priority)
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(&job.status)
        .bind(job.scheduled_for)
        .bind(job.next_run_at)
        .bind(&job.idempotency_key)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_error)?;

        if let Some(job) = inserted {
            return Ok(JobInsert { job, created: true });
        }

        // Conflict: the key already belongs to another job
        let key = job.idempotency_key.as_deref().unwrap_or_default();
        let existing = self.find_by_idempotency_key(key).await?.ok_or_else(|| {
            Error::Internal(format!("Job insert conflicted on missing key {:?}", key))
        })?;

        Ok(JobInsert {
            job: existing,
            created: false,
        })
    }

    async fn get(&self, id: JobId) -> Result<Option<EmailJob>> {
        sqlx::query_as::<_, EmailJob>("SELECT * FROM email_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_error)
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<EmailJob>> {
        sqlx::query_as::<_, EmailJob>("SELECT * FROM email_jobs WHERE idempotency_key = $1")
            .bind(key)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_error)
    }

    async fn find_by_provider_message_id(&self, message_id: &str) -> Result<Option<EmailJob>> {
        sqlx::query_as::<_, EmailJob>(
            "SELECT * FROM email_jobs WHERE provider_message_id = $1 LIMIT 1",
        )
        .bind(message_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn fetch_ready(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<EmailJob>> {
        sqlx::query_as::<_, EmailJob>(
            r#"
            SELECT * FROM email_jobs
            WHERE status = 'pending'
              AND scheduled_for <= $1
              AND next_run_at <= $1
            ORDER BY priority DESC, next_run_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn claim(&self, id: JobId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE email_jobs SET
                status = 'processing',
                claimed_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_sent(&self, id: JobId, provider_message_id: Option<&str>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE email_jobs SET
                status = 'sent',
                provider_message_id = $2,
                error_message = NULL,
                sent_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(provider_message_id)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn schedule_retry(
        &self,
        id: JobId,
        attempts: i32,
        next_run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE email_jobs SET
                status = 'pending',
                attempts = $2,
                next_run_at = $3,
                error_message = $4,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND $2 < max_attempts
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(next_run_at)
        .bind(error)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: JobId, error: &str) -> Result<bool> {
        self.transition(
            r#"
            UPDATE email_jobs SET
                status = 'failed',
                error_message = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
            id,
            error,
        )
        .await
    }

    async fn mark_dead_letter(&self, id: JobId, attempts: i32, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE email_jobs SET
                status = 'dead_letter',
                attempts = LEAST($2, max_attempts),
                error_message = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(attempts)
        .bind(error)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_skipped(&self, id: JobId, reason: &str) -> Result<bool> {
        self.transition(
            r#"
            UPDATE email_jobs SET
                status = 'cancelled',
                error_message = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
            id,
            reason,
        )
        .await
    }

    async fn cancel(&self, id: JobId) -> Result<bool> {
        self.transition(
            r#"
            UPDATE email_jobs SET
                status = 'cancelled',
                error_message = $2,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
            id,
            "cancelled",
        )
        .await
    }

    async fn cancel_by_campaign(&self, campaign_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE email_jobs SET
                status = 'cancelled',
                error_message = 'campaign cancelled',
                updated_at = NOW()
            WHERE campaign_id = $1 AND status = 'pending'
            "#,
        )
        .bind(campaign_id)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn release_stale(
        &self,
        claimed_before: DateTime<Utc>,
        error: &str,
    ) -> Result<StaleRelease> {
        let dead_lettered = sqlx::query_as::<_, EmailJob>(
            r#"
            UPDATE email_jobs SET
                status = 'dead_letter',
                attempts = max_attempts,
                error_message = $2,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE status = 'processing' AND claimed_at < $1
              AND attempts + 1 >= max_attempts
            RETURNING *
            "#,
        )
        .bind(claimed_before)
        .bind(error)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)?;

        let requeued = sqlx::query(
            r#"
            UPDATE email_jobs SET
                status = 'pending',
                attempts = attempts + 1,
                error_message = $2,
                claimed_at = NULL,
                updated_at = NOW()
            WHERE status = 'processing' AND claimed_at < $1
            "#,
        )
        .bind(claimed_before)
        .bind(error)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?
        .rows_affected();

        Ok(StaleRelease {
            requeued,
            dead_lettered,
        })
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM email_jobs GROUP BY status")
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_error)?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            if let Ok(status) = status.parse::<JobStatus>() {
                stats.add(status, count);
            }
        }

        Ok(stats)
    }
}

//! Dead-letter repository

use crate::db::{db_error, DatabasePool};
use crate::models::{DeadLetter, EmailJob};
use async_trait::async_trait;
use chrono::Utc;
use outpost_common::types::{DeadLetterId, JobId};
use outpost_common::{Error, Result};
use uuid::Uuid;

/// Dead-letter repository trait
#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    /// Store a snapshot of an exhausted job
    async fn insert(&self, job: &EmailJob, error: &str) -> Result<DeadLetter>;
    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetter>>;
    /// Most recent first
    async fn list(&self, limit: i64) -> Result<Vec<DeadLetter>>;
    /// Record a replay; false if the entry was already replayed
    async fn mark_replayed(&self, id: DeadLetterId, replay_job_id: JobId) -> Result<bool>;
}

/// Database dead-letter repository
pub struct DbDeadLetterRepository {
    pool: DatabasePool,
}

impl DbDeadLetterRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterRepository for DbDeadLetterRepository {
    async fn insert(&self, job: &EmailJob, error: &str) -> Result<DeadLetter> {
        let payload = serde_json::to_value(job)
            .map_err(|e| Error::Internal(format!("Failed to encode job snapshot: {}", e)))?;

        sqlx::query_as::<_, DeadLetter>(
            r#"
            INSERT INTO dead_letters (id, job_id, payload, error_message, attempts, dead_lettered_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(job.id)
        .bind(&payload)
        .bind(error)
        .bind(job.attempts)
        .bind(Utc::now())
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetter>> {
        sqlx::query_as::<_, DeadLetter>("SELECT * FROM dead_letters WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_error)
    }

    async fn list(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        sqlx::query_as::<_, DeadLetter>(
            "SELECT * FROM dead_letters ORDER BY dead_lettered_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn mark_replayed(&self, id: DeadLetterId, replay_job_id: JobId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dead_letters SET
                replayed_at = NOW(),
                replay_job_id = $2
            WHERE id = $1 AND replayed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(replay_job_id)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }
}

//! Suppression list repository

use crate::db::{db_error, DatabasePool};
use crate::models::{NewSuppression, SuppressionEntry, SuppressionWrite};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outpost_common::{Error, Result};
use uuid::Uuid;

/// Suppression repository trait
///
/// Emails are stored normalized; callers pass normalized addresses. An entry
/// with `client_id = None` applies to every client.
#[async_trait]
pub trait SuppressionRepository: Send + Sync {
    /// Entry in exactly this scope, active or not
    async fn get(&self, email: &str, client_id: Option<&str>) -> Result<Option<SuppressionEntry>>;
    /// Strongest active entry that applies to `client_id` (its own or global)
    async fn find_active(
        &self,
        email: &str,
        client_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<SuppressionEntry>>;
    /// Write the entry unless an active entry it may not replace exists
    async fn upsert_if_stricter(
        &self,
        input: NewSuppression,
        now: DateTime<Utc>,
    ) -> Result<SuppressionWrite>;
    async fn delete(&self, email: &str, client_id: Option<&str>) -> Result<bool>;
    async fn list(&self, client_id: Option<&str>, limit: i64) -> Result<Vec<SuppressionEntry>>;
    /// Subset of `emails` that are actively suppressed
    async fn filter_active(
        &self,
        emails: &[String],
        client_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>>;
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Database suppression repository
pub struct DbSuppressionRepository {
    pool: DatabasePool,
}

impl DbSuppressionRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SuppressionRepository for DbSuppressionRepository {
    async fn get(&self, email: &str, client_id: Option<&str>) -> Result<Option<SuppressionEntry>> {
        sqlx::query_as::<_, SuppressionEntry>(
            r#"
            SELECT * FROM suppressions
            WHERE email = $1 AND COALESCE(client_id, '') = COALESCE($2, '')
            "#,
        )
        .bind(email)
        .bind(client_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn find_active(
        &self,
        email: &str,
        client_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<SuppressionEntry>> {
        sqlx::query_as::<_, SuppressionEntry>(
            r#"
            SELECT * FROM suppressions
            WHERE email = $1
              AND (client_id IS NULL OR client_id = $2)
              AND (expires_at IS NULL OR expires_at > $3)
            ORDER BY (expires_at IS NULL) DESC, severity DESC
            LIMIT 1
            "#,
        )
        .bind(email)
        .bind(client_id)
        .bind(now)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn upsert_if_stricter(
        &self,
        input: NewSuppression,
        now: DateTime<Utc>,
    ) -> Result<SuppressionWrite> {
        let email = input.email.clone();
        let client_id = input.client_id.clone();
        let entry = SuppressionEntry::from_new(Uuid::now_v7(), input, now);

        // Same order as SuppressionStrength, evaluated atomically
        let written = sqlx::query_as::<_, SuppressionEntry>(
            r#"
            INSERT INTO suppressions (
                id, email, suppression_type, bounce_type, severity, reason,
                client_id, expires_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (email, (COALESCE(client_id, ''))) DO UPDATE SET
                suppression_type = EXCLUDED.suppression_type,
                bounce_type = EXCLUDED.bounce_type,
                severity = EXCLUDED.severity,
                reason = EXCLUDED.reason,
                expires_at = EXCLUDED.expires_at,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at
            WHERE (suppressions.expires_at IS NOT NULL AND suppressions.expires_at <= $9)
               OR (EXCLUDED.expires_at IS NULL, EXCLUDED.severity)
                  > (suppressions.expires_at IS NULL, suppressions.severity)
            RETURNING *
            "#,
        )
        .bind(entry.id)
        .bind(&entry.email)
        .bind(&entry.suppression_type)
        .bind(&entry.bounce_type)
        .bind(entry.severity)
        .bind(&entry.reason)
        .bind(&entry.client_id)
        .bind(entry.expires_at)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_error)?;

        if let Some(written) = written {
            return Ok(SuppressionWrite::Written(written));
        }

        let existing = self
            .get(&email, client_id.as_deref())
            .await?
            .ok_or_else(|| Error::Internal("Suppression upsert conflicted without a row".to_string()))?;

        Ok(SuppressionWrite::Kept(existing))
    }

    async fn delete(&self, email: &str, client_id: Option<&str>) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM suppressions WHERE email = $1 AND COALESCE(client_id, '') = COALESCE($2, '')",
        )
        .bind(email)
        .bind(client_id)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, client_id: Option<&str>, limit: i64) -> Result<Vec<SuppressionEntry>> {
        match client_id {
            Some(cid) => sqlx::query_as::<_, SuppressionEntry>(
                r#"
                SELECT * FROM suppressions
                WHERE client_id = $1 OR client_id IS NULL
                ORDER BY updated_at DESC
                LIMIT $2
                "#,
            )
            .bind(cid)
            .bind(limit)
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_error),
            None => sqlx::query_as::<_, SuppressionEntry>(
                "SELECT * FROM suppressions ORDER BY updated_at DESC LIMIT $1",
            )
            .bind(limit)
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_error),
        }
    }

    async fn filter_active(
        &self,
        emails: &[String],
        client_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let result: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT email FROM suppressions
            WHERE email = ANY($1)
              AND (client_id IS NULL OR client_id = $2)
              AND (expires_at IS NULL OR expires_at > $3)
            "#,
        )
        .bind(emails)
        .bind(client_id)
        .bind(now)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.into_iter().map(|(email,)| email).collect())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM suppressions WHERE expires_at IS NOT NULL AND expires_at <= $1",
        )
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }
}

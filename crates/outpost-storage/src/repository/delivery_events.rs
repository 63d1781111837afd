//! Delivery event repository

use crate::db::{db_error, DatabasePool};
use crate::models::{DeliveryEventRecord, NewDeliveryEvent};
use async_trait::async_trait;
use chrono::Utc;
use outpost_common::Result;
use uuid::Uuid;

/// Delivery event repository trait
#[async_trait]
pub trait DeliveryEventRepository: Send + Sync {
    async fn insert(&self, input: NewDeliveryEvent) -> Result<DeliveryEventRecord>;
    async fn list_by_message(&self, message_id: &str) -> Result<Vec<DeliveryEventRecord>>;
    async fn list_by_campaign(
        &self,
        campaign_id: &str,
        limit: i64,
    ) -> Result<Vec<DeliveryEventRecord>>;
}

/// Database delivery event repository
pub struct DbDeliveryEventRepository {
    pool: DatabasePool,
}

impl DbDeliveryEventRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliveryEventRepository for DbDeliveryEventRepository {
    async fn insert(&self, input: NewDeliveryEvent) -> Result<DeliveryEventRecord> {
        sqlx::query_as::<_, DeliveryEventRecord>(
            r#"
            INSERT INTO delivery_events (
                id, event_type, recipient, message_id, campaign_id, lead_id,
                client_id, severity, description, occurred_at, received_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.event_type.to_string())
        .bind(&input.recipient)
        .bind(&input.message_id)
        .bind(&input.campaign_id)
        .bind(&input.lead_id)
        .bind(&input.client_id)
        .bind(&input.severity)
        .bind(&input.description)
        .bind(input.occurred_at)
        .bind(Utc::now())
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn list_by_message(&self, message_id: &str) -> Result<Vec<DeliveryEventRecord>> {
        sqlx::query_as::<_, DeliveryEventRecord>(
            "SELECT * FROM delivery_events WHERE message_id = $1 ORDER BY occurred_at ASC",
        )
        .bind(message_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn list_by_campaign(
        &self,
        campaign_id: &str,
        limit: i64,
    ) -> Result<Vec<DeliveryEventRecord>> {
        sqlx::query_as::<_, DeliveryEventRecord>(
            r#"
            SELECT * FROM delivery_events
            WHERE campaign_id = $1
            ORDER BY occurred_at DESC
            LIMIT $2
            "#,
        )
        .bind(campaign_id)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)
    }
}

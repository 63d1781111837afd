//! Campaign delivery metrics repository

use crate::db::{db_error, DatabasePool};
use crate::models::{CampaignCounter, CampaignMetrics};
use async_trait::async_trait;
use outpost_common::Result;

/// Campaign metrics repository trait
#[async_trait]
pub trait CampaignMetricsRepository: Send + Sync {
    /// Atomically add one to `counter`, creating the row if needed
    async fn increment(&self, campaign_id: &str, counter: CampaignCounter) -> Result<()>;
    async fn get(&self, campaign_id: &str) -> Result<Option<CampaignMetrics>>;
}

/// Database campaign metrics repository
pub struct DbCampaignMetricsRepository {
    pool: DatabasePool,
}

impl DbCampaignMetricsRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CampaignMetricsRepository for DbCampaignMetricsRepository {
    async fn increment(&self, campaign_id: &str, counter: CampaignCounter) -> Result<()> {
        // Column names come from a closed enum, never from input
        let column = counter.column();
        let sql = format!(
            r#"
            INSERT INTO campaign_metrics (campaign_id, {column}, updated_at)
            VALUES ($1, 1, NOW())
            ON CONFLICT (campaign_id) DO UPDATE SET
                {column} = campaign_metrics.{column} + 1,
                updated_at = NOW()
            "#
        );

        sqlx::query(&sql)
            .bind(campaign_id)
            .execute(self.pool.pool())
            .await
            .map_err(db_error)?;

        Ok(())
    }

    async fn get(&self, campaign_id: &str) -> Result<Option<CampaignMetrics>> {
        sqlx::query_as::<_, CampaignMetrics>(
            "SELECT * FROM campaign_metrics WHERE campaign_id = $1",
        )
        .bind(campaign_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_error)
    }
}

//! Delivery events - Normalized provider events and their in-process bus

mod bus;

pub use bus::{EventBus, EventHandler, PublishReport};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outpost_common::types::{email_domain, JobId};
use outpost_common::Result;
use outpost_storage::models::{DeliveryEventKind, NewDeliveryEvent};
use serde::{Deserialize, Serialize};

/// Provider event after verification and normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub kind: DeliveryEventKind,
    /// Normalized recipient address
    pub recipient: String,
    pub message_id: Option<String>,
    /// Job id echoed back through the `jobId` user variable
    pub job_id: Option<JobId>,
    pub campaign_id: Option<String>,
    pub lead_id: Option<String>,
    pub client_id: Option<String>,
    pub severity: Option<String>,
    pub description: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl DeliveryEvent {
    /// Recipient domain, lowercased
    pub fn domain(&self) -> Option<String> {
        email_domain(&self.recipient)
    }

    pub fn to_record(&self) -> NewDeliveryEvent {
        NewDeliveryEvent {
            event_type: self.kind,
            recipient: self.recipient.clone(),
            message_id: self.message_id.clone(),
            campaign_id: self.campaign_id.clone(),
            lead_id: self.lead_id.clone(),
            client_id: self.client_id.clone(),
            severity: self.severity.clone(),
            description: self.description.clone(),
            occurred_at: self.occurred_at,
        }
    }
}

/// External consumer of engagement events (opens and clicks)
#[async_trait]
pub trait ConversationSink: Send + Sync {
    async fn forward(&self, event: &DeliveryEvent) -> Result<()>;
}

/// External control over campaign sending
#[async_trait]
pub trait CampaignControl: Send + Sync {
    async fn pause_campaign(&self, campaign_id: &str, reason: &str) -> Result<()>;
}

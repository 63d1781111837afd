//! Built-in subscribers for webhook events

use crate::deliverability::DeliverabilityMonitor;
use crate::events::{CampaignControl, ConversationSink, DeliveryEvent, EventHandler};
use crate::suppression::{BounceSeverity, SuppressionRegistry};
use async_trait::async_trait;
use outpost_common::Result;
use outpost_storage::models::{CampaignCounter, DeliveryEventKind};
use outpost_storage::repository::{CampaignMetricsRepository, JobRepository};
use std::sync::Arc;
use tracing::{debug, info};

/// Turns failures, complaints and unsubscribes into suppressions.
///
/// Bounces describe the mailbox itself and are recorded globally; complaints
/// and unsubscribes are scoped to the client that sent the message.
pub struct SuppressionSubscriber {
    registry: Arc<SuppressionRegistry>,
}

impl SuppressionSubscriber {
    pub fn new(registry: Arc<SuppressionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventHandler for SuppressionSubscriber {
    fn name(&self) -> &str {
        "suppression"
    }

    fn accepts(&self, kind: DeliveryEventKind) -> bool {
        matches!(
            kind,
            DeliveryEventKind::Failed
                | DeliveryEventKind::Bounced
                | DeliveryEventKind::Complained
                | DeliveryEventKind::Unsubscribed
        )
    }

    async fn handle(&self, event: &DeliveryEvent) -> Result<()> {
        match event.kind {
            DeliveryEventKind::Failed | DeliveryEventKind::Bounced => {
                let severity = BounceSeverity::from_provider(event.severity.as_deref());
                self.registry
                    .record_bounce(&event.recipient, severity, event.description.clone(), None)
                    .await?;
            }
            DeliveryEventKind::Complained => {
                self.registry
                    .record_complaint(
                        &event.recipient,
                        event.description.clone(),
                        event.client_id.clone(),
                    )
                    .await?;
            }
            DeliveryEventKind::Unsubscribed => {
                self.registry
                    .record_unsubscribe(
                        &event.recipient,
                        event.description.clone(),
                        event.client_id.clone(),
                    )
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Feeds per-domain health counters
pub struct DeliverabilitySubscriber {
    monitor: Arc<DeliverabilityMonitor>,
    jobs: Arc<dyn JobRepository>,
}

impl DeliverabilitySubscriber {
    pub fn new(monitor: Arc<DeliverabilityMonitor>, jobs: Arc<dyn JobRepository>) -> Self {
        Self { monitor, jobs }
    }

    /// Milliseconds from our send to the provider's delivery event.
    ///
    /// The job is found by provider message id, or by the echoed job id when
    /// the provider never returned a message id.
    async fn latency_ms(&self, event: &DeliveryEvent) -> Result<Option<u64>> {
        let mut job = match event.message_id.as_deref() {
            Some(id) => self.jobs.find_by_provider_message_id(id).await?,
            None => None,
        };
        if job.is_none() {
            if let Some(job_id) = event.job_id {
                job = self.jobs.get(job_id).await?;
            }
        }
        let sent_at = job.and_then(|job| job.sent_at);

        Ok(sent_at.and_then(|sent_at| {
            u64::try_from((event.occurred_at - sent_at).num_milliseconds()).ok()
        }))
    }
}

#[async_trait]
impl EventHandler for DeliverabilitySubscriber {
    fn name(&self) -> &str {
        "deliverability"
    }

    fn accepts(&self, kind: DeliveryEventKind) -> bool {
        matches!(
            kind,
            DeliveryEventKind::Failed
                | DeliveryEventKind::Bounced
                | DeliveryEventKind::Complained
                | DeliveryEventKind::Delivered
        )
    }

    async fn handle(&self, event: &DeliveryEvent) -> Result<()> {
        let domain = match event.domain() {
            Some(domain) => domain,
            None => {
                debug!(recipient = %event.recipient, "Event without recipient domain");
                return Ok(());
            }
        };

        match event.kind {
            DeliveryEventKind::Failed | DeliveryEventKind::Bounced => {
                self.monitor.record_bounce(&domain).await
            }
            DeliveryEventKind::Complained => self.monitor.record_complaint(&domain).await,
            DeliveryEventKind::Delivered => {
                let latency = self.latency_ms(event).await?;
                self.monitor.record_delivery(&domain, latency).await
            }
            _ => Ok(()),
        }
    }
}

/// Maintains per-campaign delivery counters
pub struct CampaignMetricsSubscriber {
    repo: Arc<dyn CampaignMetricsRepository>,
}

impl CampaignMetricsSubscriber {
    pub fn new(repo: Arc<dyn CampaignMetricsRepository>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl EventHandler for CampaignMetricsSubscriber {
    fn name(&self) -> &str {
        "campaign-metrics"
    }

    fn accepts(&self, _kind: DeliveryEventKind) -> bool {
        true
    }

    async fn handle(&self, event: &DeliveryEvent) -> Result<()> {
        match event.campaign_id.as_deref() {
            Some(campaign_id) => {
                self.repo
                    .increment(campaign_id, CampaignCounter::for_event(event.kind))
                    .await
            }
            None => Ok(()),
        }
    }
}

/// Forwards opens and clicks to the conversation collaborator
pub struct ConversationForwarder {
    sink: Arc<dyn ConversationSink>,
}

impl ConversationForwarder {
    pub fn new(sink: Arc<dyn ConversationSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl EventHandler for ConversationForwarder {
    fn name(&self) -> &str {
        "conversation"
    }

    fn accepts(&self, kind: DeliveryEventKind) -> bool {
        matches!(kind, DeliveryEventKind::Opened | DeliveryEventKind::Clicked)
    }

    async fn handle(&self, event: &DeliveryEvent) -> Result<()> {
        self.sink.forward(event).await
    }
}

/// Pauses a campaign on the first complaint it receives
pub struct AutoPauseSubscriber {
    control: Arc<dyn CampaignControl>,
}

impl AutoPauseSubscriber {
    pub fn new(control: Arc<dyn CampaignControl>) -> Self {
        Self { control }
    }
}

#[async_trait]
impl EventHandler for AutoPauseSubscriber {
    fn name(&self) -> &str {
        "auto-pause"
    }

    fn accepts(&self, kind: DeliveryEventKind) -> bool {
        kind == DeliveryEventKind::Complained
    }

    async fn handle(&self, event: &DeliveryEvent) -> Result<()> {
        if let Some(campaign_id) = event.campaign_id.as_deref() {
            info!(campaign_id = %campaign_id, recipient = %event.recipient, "Pausing campaign after complaint");
            self.control
                .pause_campaign(campaign_id, "spam complaint received")
                .await?;
        }
        Ok(())
    }
}

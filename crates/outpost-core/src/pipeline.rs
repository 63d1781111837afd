//! Pipeline - Wires the components together and runs periodic maintenance

use crate::deliverability::{AlertSink, DeliverabilityMonitor, InMemoryDomainMetricsStore};
use crate::events::{CampaignControl, ConversationSink, EventBus};
use crate::metrics::PipelineMetrics;
use crate::provider::EmailProvider;
use crate::queue::{DeliveryWorker, QueueManager, WorkerDeps};
use crate::suppression::SuppressionRegistry;
use crate::webhook::{
    AutoPauseSubscriber, CampaignMetricsSubscriber, ConversationForwarder, DedupCache,
    DeliverabilitySubscriber, InMemoryDedupCache, SuppressionSubscriber, WebhookIngestor,
};
use outpost_common::config::Config;
use outpost_common::Result;
use outpost_storage::db::DatabasePool;
use outpost_storage::repository::{
    CampaignMetricsRepository, DbCampaignMetricsRepository, DbDeadLetterRepository,
    DbDeliveryEventRepository, DbJobRepository, DbSuppressionRepository, DeadLetterRepository,
    DeliveryEventRepository, JobRepository, SuppressionRepository,
};
use outpost_storage::{
    InMemoryCampaignMetricsRepository, InMemoryDeadLetterRepository,
    InMemoryDeliveryEventRepository, InMemoryJobRepository, InMemorySuppressionRepository,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Durable stores used by the pipeline
#[derive(Clone)]
pub struct Repositories {
    pub jobs: Arc<dyn JobRepository>,
    pub dead_letters: Arc<dyn DeadLetterRepository>,
    pub suppressions: Arc<dyn SuppressionRepository>,
    pub delivery_events: Arc<dyn DeliveryEventRepository>,
    pub campaign_metrics: Arc<dyn CampaignMetricsRepository>,
}

impl Repositories {
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            jobs: Arc::new(DbJobRepository::new(pool.clone())),
            dead_letters: Arc::new(DbDeadLetterRepository::new(pool.clone())),
            suppressions: Arc::new(DbSuppressionRepository::new(pool.clone())),
            delivery_events: Arc::new(DbDeliveryEventRepository::new(pool.clone())),
            campaign_metrics: Arc::new(DbCampaignMetricsRepository::new(pool)),
        }
    }

    /// Process-local stores; state is lost on restart
    pub fn in_memory() -> Self {
        Self {
            jobs: Arc::new(InMemoryJobRepository::new()),
            dead_letters: Arc::new(InMemoryDeadLetterRepository::new()),
            suppressions: Arc::new(InMemorySuppressionRepository::new()),
            delivery_events: Arc::new(InMemoryDeliveryEventRepository::new()),
            campaign_metrics: Arc::new(InMemoryCampaignMetricsRepository::new()),
        }
    }
}

/// Counts from one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub expired_suppressions: u64,
    pub evicted_domains: usize,
    pub purged_dedup_keys: usize,
    pub released_jobs: u64,
}

/// Pipeline builder
pub struct PipelineBuilder {
    config: Config,
    repos: Repositories,
    provider: Arc<dyn EmailProvider>,
    conversation: Option<Arc<dyn ConversationSink>>,
    campaign_control: Option<Arc<dyn CampaignControl>>,
    alert_sink: Option<Arc<dyn AlertSink>>,
}

impl PipelineBuilder {
    pub fn new(config: Config, repos: Repositories, provider: Arc<dyn EmailProvider>) -> Self {
        Self {
            config,
            repos,
            provider,
            conversation: None,
            campaign_control: None,
            alert_sink: None,
        }
    }

    /// Receiver for opens and clicks
    pub fn with_conversation_sink(mut self, sink: Arc<dyn ConversationSink>) -> Self {
        self.conversation = Some(sink);
        self
    }

    /// Campaign pauser used when `webhook.auto_pause_on_complaint` is set
    pub fn with_campaign_control(mut self, control: Arc<dyn CampaignControl>) -> Self {
        self.campaign_control = Some(control);
        self
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    pub async fn build(self) -> Result<Pipeline> {
        let config = self.config;
        let repos = self.repos;
        let metrics = Arc::new(PipelineMetrics::new()?);

        let suppression = Arc::new(SuppressionRegistry::new(
            repos.suppressions.clone(),
            &config.suppression,
        ));

        let mut monitor = DeliverabilityMonitor::new(
            Arc::new(InMemoryDomainMetricsStore::new(
                config.deliverability.latency_window,
            )),
            config.deliverability.clone(),
        );
        if let Some(sink) = self.alert_sink {
            monitor = monitor.with_alert_sink(sink);
        }
        let monitor = Arc::new(monitor);

        let bus = Arc::new(EventBus::new(config.webhook.handler_timeout()));
        bus.subscribe(Arc::new(SuppressionSubscriber::new(suppression.clone())))
            .await;
        bus.subscribe(Arc::new(DeliverabilitySubscriber::new(
            monitor.clone(),
            repos.jobs.clone(),
        )))
        .await;
        bus.subscribe(Arc::new(CampaignMetricsSubscriber::new(
            repos.campaign_metrics.clone(),
        )))
        .await;
        if let Some(sink) = self.conversation {
            bus.subscribe(Arc::new(ConversationForwarder::new(sink))).await;
        }
        if config.webhook.auto_pause_on_complaint {
            match self.campaign_control {
                Some(control) => {
                    bus.subscribe(Arc::new(AutoPauseSubscriber::new(control)))
                        .await
                }
                None => warn!("auto_pause_on_complaint is set but no campaign control is wired"),
            }
        }

        let dedup: Arc<dyn DedupCache> =
            Arc::new(InMemoryDedupCache::new(config.webhook.dedup_ttl()));
        let ingestor = Arc::new(WebhookIngestor::new(
            &config.webhook,
            dedup.clone(),
            repos.delivery_events.clone(),
            bus.clone(),
            metrics.clone(),
        ));

        let queue = Arc::new(QueueManager::new(
            repos.jobs.clone(),
            repos.dead_letters.clone(),
            suppression.clone(),
            metrics.clone(),
            config.queue.clone(),
            config.retry.clone(),
        ));

        let worker = Arc::new(DeliveryWorker::new(
            WorkerDeps {
                jobs: repos.jobs.clone(),
                dead_letters: repos.dead_letters.clone(),
                suppression: suppression.clone(),
                monitor: monitor.clone(),
                campaign_metrics: repos.campaign_metrics.clone(),
                provider: self.provider,
                metrics: metrics.clone(),
            },
            &config.queue,
            &config.retry,
        ));

        info!(subscribers = bus.handler_count().await, "Delivery pipeline assembled");

        Ok(Pipeline {
            queue,
            worker,
            suppression,
            monitor,
            ingestor,
            bus,
            metrics,
            repos,
            dedup,
            maintenance_interval: config.maintenance.interval(),
        })
    }
}

/// Assembled delivery pipeline
pub struct Pipeline {
    pub queue: Arc<QueueManager>,
    pub worker: Arc<DeliveryWorker>,
    pub suppression: Arc<SuppressionRegistry>,
    pub monitor: Arc<DeliverabilityMonitor>,
    pub ingestor: Arc<WebhookIngestor>,
    pub bus: Arc<EventBus>,
    pub metrics: Arc<PipelineMetrics>,
    pub repos: Repositories,
    dedup: Arc<dyn DedupCache>,
    maintenance_interval: Duration,
}

impl Pipeline {
    /// One maintenance pass. A failing step is logged and the rest still run.
    pub async fn run_maintenance_once(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match self.suppression.cleanup_expired().await {
            Ok(count) => report.expired_suppressions = count,
            Err(e) => error!(error = %e, "Suppression cleanup failed"),
        }
        match self.monitor.cleanup_inactive().await {
            Ok(count) => report.evicted_domains = count,
            Err(e) => error!(error = %e, "Domain metrics eviction failed"),
        }
        match self.dedup.purge_expired().await {
            Ok(count) => report.purged_dedup_keys = count,
            Err(e) => error!(error = %e, "Dedup purge failed"),
        }
        match self.queue.release_stale().await {
            Ok(count) => report.released_jobs = count,
            Err(e) => error!(error = %e, "Stale claim recovery failed"),
        }

        debug!(?report, "Maintenance pass finished");
        report
    }

    /// Run maintenance every `maintenance.interval_secs` until `shutdown`
    pub async fn run_maintenance(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.maintenance_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = self.maintenance_interval.as_secs(),
            "Maintenance loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_maintenance_once().await;
                }
            }
        }

        info!("Maintenance loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DeliveryEvent;
    use crate::provider::{OutboundEmail, ProviderError, SendReceipt};
    use crate::queue::EnqueueRequest;
    use crate::webhook::{compute_signature, IngestOutcome};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use outpost_storage::models::{
        soft_bounce_expiry, DeliveryEventKind, JobStatus, NewSuppression, SuppressionEntry,
        SuppressionType,
    };
    use pretty_assertions::assert_eq;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    struct AcceptingProvider;

    #[async_trait]
    impl EmailProvider for AcceptingProvider {
        async fn send(
            &self,
            _email: &OutboundEmail,
        ) -> std::result::Result<SendReceipt, ProviderError> {
            Ok(SendReceipt {
                provider_message_id: Some("msg-1@mg.example.com".to_string()),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<DeliveryEvent>>,
    }

    #[async_trait]
    impl ConversationSink for RecordingSink {
        async fn forward(&self, event: &DeliveryEvent) -> Result<()> {
            self.events.lock().await.push(event.clone());
            Ok(())
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.webhook.signing_key = Some("whsec-test".to_string());
        config.retry.backoff_base_ms = 0;
        config.retry.jitter_max_ms = 0;
        config
    }

    fn signed_payload(event: &str, recipient: &str, token: &str) -> serde_json::Value {
        let timestamp = Utc::now().timestamp().to_string();
        serde_json::json!({
            "signature": {
                "timestamp": timestamp,
                "token": token,
                "signature": compute_signature("whsec-test", &timestamp, token),
            },
            "event-data": {
                "event": event,
                "recipient": recipient,
                "severity": "permanent",
                "message": { "headers": { "message-id": "<msg-1@mg.example.com>" } },
                "user-variables": { "campaignId": "camp-1", "leadId": "lead-1" }
            }
        })
    }

    #[tokio::test]
    async fn test_send_then_bounce_blocks_next_enqueue() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = PipelineBuilder::new(config(), Repositories::in_memory(), Arc::new(AcceptingProvider))
            .with_conversation_sink(sink.clone())
            .build()
            .await
            .unwrap();

        let id = pipeline
            .queue
            .enqueue(EnqueueRequest {
                to: "lead@example.com".to_string(),
                from: "sales@sender.io".to_string(),
                subject: "Hi".to_string(),
                body: "Hello".to_string(),
                campaign_id: Some("camp-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        pipeline.worker.run_once().await.unwrap();
        let job = pipeline.queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status_enum(), Some(JobStatus::Sent));

        let opened = signed_payload("opened", "lead@example.com", "tok-open");
        let outcome = pipeline
            .ingestor
            .ingest_bytes(opened.to_string().as_bytes())
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Processed(DeliveryEventKind::Opened));
        assert_eq!(sink.events.lock().await.len(), 1);

        let failed = signed_payload("failed", "lead@example.com", "tok-fail");
        pipeline
            .ingestor
            .ingest_bytes(failed.to_string().as_bytes())
            .await
            .unwrap();

        assert!(pipeline
            .suppression
            .is_suppressed("lead@example.com", None)
            .await
            .unwrap());
        let health = pipeline
            .monitor
            .domain_health("example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(health.sent, 1);
        assert_eq!(health.bounces, 1);

        let campaign = pipeline
            .repos
            .campaign_metrics
            .get("camp-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(campaign.sent, 1);
        assert_eq!(campaign.opened, 1);
        assert_eq!(campaign.bounced, 1);

        let err = pipeline
            .queue
            .enqueue(EnqueueRequest {
                to: "lead@example.com".to_string(),
                from: "sales@sender.io".to_string(),
                subject: "Follow up".to_string(),
                body: "Hello again".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::queue::EnqueueError::Suppressed(_)));
    }

    #[tokio::test]
    async fn test_maintenance_pass() {
        let repos = Repositories::in_memory();
        let suppressions = Arc::new(InMemorySuppressionRepository::new());
        let repos = Repositories {
            suppressions: suppressions.clone(),
            ..repos
        };
        let pipeline = PipelineBuilder::new(config(), repos, Arc::new(AcceptingProvider))
            .build()
            .await
            .unwrap();

        let created = Utc::now() - ChronoDuration::days(8);
        suppressions
            .put(SuppressionEntry::from_new(
                Uuid::now_v7(),
                NewSuppression {
                    email: "old@example.com".to_string(),
                    suppression_type: SuppressionType::Bounce,
                    bounce_type: Some(outpost_storage::models::BounceType::Soft),
                    reason: None,
                    client_id: None,
                    expires_at: Some(soft_bounce_expiry(created, 7)),
                },
                created,
            ))
            .await;

        let report = pipeline.run_maintenance_once().await;
        assert_eq!(report.expired_suppressions, 1);
        assert_eq!(report.released_jobs, 0);
    }
}

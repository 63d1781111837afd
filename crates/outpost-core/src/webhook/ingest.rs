//! Webhook ingestion
//!
//! verify -> classify -> dedup -> persist -> publish. Nothing is mutated
//! before the signature check passes, and a duplicate stops before the
//! event is stored or published.

use super::dedup::{dedup_key, DedupCache};
use super::payload::WebhookPayload;
use super::signature::SignatureVerifier;
use super::WebhookError;
use crate::events::EventBus;
use crate::metrics::{PipelineMetrics, WebhookOutcome};
use chrono::{DateTime, Utc};
use outpost_common::config::WebhookConfig;
use outpost_storage::models::DeliveryEventKind;
use outpost_storage::repository::DeliveryEventRepository;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of an accepted webhook
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored and published
    Processed(DeliveryEventKind),
    /// Seen within the dedup window; no state changed
    Duplicate,
    /// Authentic, but an event type the pipeline does not act on
    Ignored(String),
}

/// Webhook ingestor
pub struct WebhookIngestor {
    verifier: SignatureVerifier,
    dedup: Arc<dyn DedupCache>,
    events: Arc<dyn DeliveryEventRepository>,
    bus: Arc<EventBus>,
    metrics: Arc<PipelineMetrics>,
}

impl WebhookIngestor {
    pub fn new(
        config: &WebhookConfig,
        dedup: Arc<dyn DedupCache>,
        events: Arc<dyn DeliveryEventRepository>,
        bus: Arc<EventBus>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            verifier: SignatureVerifier::new(
                config.signing_key.clone(),
                config.replay_window_secs,
            ),
            dedup,
            events,
            bus,
            metrics,
        }
    }

    pub fn verify_signature(
        &self,
        timestamp: &str,
        token: &str,
        signature: &str,
    ) -> Result<(), WebhookError> {
        self.verifier.verify(timestamp, token, signature)
    }

    /// Check-and-set the dedup entry for `(timestamp, token)`
    pub async fn is_duplicate(&self, timestamp: &str, token: &str) -> Result<bool, WebhookError> {
        let fresh = self.dedup.check_and_set(&dedup_key(timestamp, token)).await?;
        Ok(!fresh)
    }

    /// Parse and ingest a raw request body
    pub async fn ingest_bytes(&self, body: &[u8]) -> Result<IngestOutcome, WebhookError> {
        let payload = WebhookPayload::from_slice(body).map_err(|e| {
            self.metrics.webhook(WebhookOutcome::Rejected);
            e
        })?;
        self.ingest(payload).await
    }

    pub async fn ingest(&self, payload: WebhookPayload) -> Result<IngestOutcome, WebhookError> {
        self.ingest_at(payload, Utc::now()).await
    }

    pub async fn ingest_at(
        &self,
        payload: WebhookPayload,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, WebhookError> {
        let signature = &payload.signature;
        if let Err(e) =
            self.verifier
                .verify_at(&signature.timestamp, &signature.token, &signature.signature, now)
        {
            warn!(error = %e, event = %payload.event_data.event, "Webhook rejected");
            self.metrics.webhook(WebhookOutcome::Rejected);
            return Err(e);
        }

        let kind = match payload.kind() {
            Some(kind) => kind,
            None => {
                debug!(event = %payload.event_data.event, "Ignoring webhook event");
                self.metrics.webhook(WebhookOutcome::Ignored);
                return Ok(IngestOutcome::Ignored(payload.event_data.event.clone()));
            }
        };

        let event = payload.to_event(kind).map_err(|e| {
            self.metrics.webhook(WebhookOutcome::Rejected);
            e
        })?;

        let key = dedup_key(&signature.timestamp, &signature.token);
        if !self.dedup.check_and_set(&key).await? {
            debug!(event = %kind, recipient = %event.recipient, "Duplicate webhook");
            self.metrics.webhook(WebhookOutcome::Duplicate);
            return Ok(IngestOutcome::Duplicate);
        }

        if let Err(e) = self.events.insert(event.to_record()).await {
            // Let the provider's redelivery through
            if let Err(forget_err) = self.dedup.forget(&key).await {
                error!(error = %forget_err, "Failed to release dedup key");
            }
            return Err(WebhookError::Storage(e));
        }

        let report = self.bus.publish(&event).await;
        self.metrics.webhook(WebhookOutcome::Processed);

        info!(
            event = %kind,
            recipient = %event.recipient,
            message_id = ?event.message_id,
            campaign_id = ?event.campaign_id,
            handlers = report.handled.len(),
            failed_handlers = report.failed.len(),
            "Webhook processed"
        );

        Ok(IngestOutcome::Processed(kind))
    }
}

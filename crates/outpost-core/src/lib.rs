//! Outpost Core - Email delivery reliability pipeline
//!
//! This crate provides the job queue and delivery worker, the provider
//! adapter, the suppression registry, the per-domain deliverability monitor,
//! webhook ingestion with its event bus, and the A/B template selector.

pub mod deliverability;
pub mod events;
pub mod metrics;
pub mod pipeline;
pub mod provider;
pub mod queue;
pub mod suppression;
pub mod template;
pub mod webhook;

pub use deliverability::{DeliverabilityMonitor, DomainHealth, HealthSummary};
pub use events::{CampaignControl, ConversationSink, DeliveryEvent, EventBus, EventHandler};
pub use metrics::PipelineMetrics;
pub use pipeline::{MaintenanceReport, Pipeline, PipelineBuilder, Repositories};
pub use provider::{EmailProvider, HttpProvider, ProviderError};
pub use queue::{DeliveryWorker, EnqueueError, EnqueueRequest, QueueManager};
pub use suppression::{BounceSeverity, SuppressionRegistry};
pub use template::{hash_to_bucket, select_template_version, Template};
pub use webhook::{IngestOutcome, WebhookError, WebhookIngestor};

//! Webhook Ingestion - Verified, deduplicated provider events

mod dedup;
mod handlers;
mod ingest;
mod payload;
mod signature;

pub use dedup::{dedup_key, DedupCache, InMemoryDedupCache};
pub use handlers::{
    AutoPauseSubscriber, CampaignMetricsSubscriber, ConversationForwarder,
    DeliverabilitySubscriber, SuppressionSubscriber,
};
pub use ingest::{IngestOutcome, WebhookIngestor};
pub use payload::{
    DeliveryStatus, EventData, EventMessage, MessageHeaders, UserVariables, WebhookPayload,
    WebhookSignature,
};
pub use signature::{compute_signature, SignatureVerifier};

use thiserror::Error;

/// Webhook rejection reasons
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("Webhook signing key is not configured")]
    MissingSecret,

    #[error("Webhook timestamp outside replay window ({age_secs}s)")]
    StaleTimestamp { age_secs: i64 },

    #[error("Webhook signature mismatch")]
    InvalidSignature,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error(transparent)]
    Storage(#[from] outpost_common::Error),
}

impl WebhookError {
    /// Signature failures are rejected; everything else is a bad request or a retryable fault
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            WebhookError::MissingSecret
                | WebhookError::StaleTimestamp { .. }
                | WebhookError::InvalidSignature
        )
    }

    pub fn status_code(&self) -> u16 {
        match self {
            WebhookError::MissingSecret => 401,
            WebhookError::StaleTimestamp { .. } => 401,
            WebhookError::InvalidSignature => 401,
            WebhookError::MalformedPayload(_) => 400,
            WebhookError::Storage(e) => e.status_code(),
        }
    }
}

impl From<WebhookError> for outpost_common::Error {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::Storage(e) => e,
            WebhookError::MalformedPayload(msg) => outpost_common::Error::Validation(msg),
            other => outpost_common::Error::Signature(other.to_string()),
        }
    }
}

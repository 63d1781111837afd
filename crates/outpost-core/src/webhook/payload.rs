//! Provider webhook payload

use super::WebhookError;
use crate::events::DeliveryEvent;
use crate::provider::normalize_message_id;
use chrono::{DateTime, TimeZone, Utc};
use outpost_common::types::{is_valid_email, normalize_email};
use outpost_storage::models::DeliveryEventKind;
use serde::{Deserialize, Deserializer, Serialize};

/// Signed webhook body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub signature: WebhookSignature,
    #[serde(rename = "event-data")]
    pub event_data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSignature {
    /// Unix seconds; some providers send it as a number
    #[serde(deserialize_with = "string_or_number")]
    pub timestamp: String,
    pub token: String,
    pub signature: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventData {
    pub event: String,
    #[serde(default)]
    pub recipient: Option<String>,
    /// "permanent" or "temporary" for failures
    #[serde(default)]
    pub severity: Option<String>,
    /// Unix seconds with fractional part
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<EventMessage>,
    #[serde(rename = "delivery-status", default)]
    pub delivery_status: Option<DeliveryStatus>,
    #[serde(rename = "user-variables", default)]
    pub user_variables: UserVariables,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(default)]
    pub headers: MessageHeaders,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageHeaders {
    #[serde(rename = "message-id", default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryStatus {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Correlation ids attached at send time
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserVariables {
    #[serde(rename = "campaignId", default)]
    pub campaign_id: Option<String>,
    #[serde(rename = "leadId", default)]
    pub lead_id: Option<String>,
    #[serde(rename = "clientId", default)]
    pub client_id: Option<String>,
    #[serde(rename = "jobId", default)]
    pub job_id: Option<String>,
}

impl WebhookPayload {
    pub fn from_slice(body: &[u8]) -> Result<Self, WebhookError> {
        serde_json::from_slice(body).map_err(|e| WebhookError::MalformedPayload(e.to_string()))
    }

    /// Event kind, if it is one the pipeline acts on
    pub fn kind(&self) -> Option<DeliveryEventKind> {
        self.event_data.event.trim().to_ascii_lowercase().parse().ok()
    }

    /// Normalize into a [`DeliveryEvent`]
    pub fn to_event(&self, kind: DeliveryEventKind) -> Result<DeliveryEvent, WebhookError> {
        let data = &self.event_data;

        let recipient = data
            .recipient
            .as_deref()
            .map(normalize_email)
            .filter(|email| is_valid_email(email))
            .ok_or_else(|| WebhookError::MalformedPayload("missing or invalid recipient".into()))?;

        let message_id = data
            .message
            .as_ref()
            .and_then(|m| m.headers.message_id.as_deref())
            .map(normalize_message_id)
            .filter(|id| !id.is_empty());

        let description = data
            .delivery_status
            .as_ref()
            .and_then(|s| {
                non_empty(s.description.as_deref()).or_else(|| non_empty(s.message.as_deref()))
            })
            .or_else(|| non_empty(data.reason.as_deref()));

        Ok(DeliveryEvent {
            kind,
            recipient,
            message_id,
            job_id: data
                .user_variables
                .job_id
                .as_deref()
                .and_then(|id| id.trim().parse().ok()),
            campaign_id: non_empty(data.user_variables.campaign_id.as_deref()),
            lead_id: non_empty(data.user_variables.lead_id.as_deref()),
            client_id: non_empty(data.user_variables.client_id.as_deref()),
            severity: data.severity.as_deref().map(|s| s.trim().to_ascii_lowercase()),
            description,
            occurred_at: self.occurred_at(),
        })
    }

    /// Event time, falling back to the signature timestamp
    fn occurred_at(&self) -> DateTime<Utc> {
        let from_event = self.event_data.timestamp.and_then(|ts| {
            let millis = (ts * 1000.0).round() as i64;
            Utc.timestamp_millis_opt(millis).single()
        });
        let from_signature = || {
            self.signature
                .timestamp
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        };
        from_event.or_else(from_signature).unwrap_or_else(Utc::now)
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(i64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Int(n) => n.to_string(),
    })
}

//! Email provider abstraction

pub mod http;

pub use http::HttpProvider;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Message handed to the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: String,
    pub from: String,
    pub subject: String,
    pub body: String,
    /// Extra MIME headers
    pub headers: BTreeMap<String, String>,
    /// Provider-side variables echoed back in webhooks
    pub variables: BTreeMap<String, String>,
}

/// Accepted send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Normalized provider id; `None` when the provider accepted the message
    /// without returning a usable id
    pub provider_message_id: Option<String>,
}

/// Provider failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Transient provider error ({status:?}): {message}")]
    Transient {
        status: Option<u16>,
        message: String,
    },

    #[error("Permanent provider error ({status:?}): {message}")]
    Permanent {
        status: Option<u16>,
        message: String,
    },

    #[error("Provider call timed out")]
    Timeout,
}

impl ProviderError {
    /// Classify an HTTP error status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if is_retryable_status(status) {
            ProviderError::Transient {
                status: Some(status),
                message,
            }
        } else {
            ProviderError::Permanent {
                status: Some(status),
                message,
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Permanent { .. })
    }
}

/// 408, 429 and 5xx are worth retrying
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

/// Strip the angle brackets providers put around message ids
pub fn normalize_message_id(id: &str) -> String {
    id.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

/// Outbound email transport
#[async_trait]
pub trait EmailProvider: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_status_classification() {
        for status in [408, 429, 500, 502, 503, 599] {
            assert!(ProviderError::from_status(status, "x").is_retryable(), "{}", status);
        }
        for status in [400, 401, 403, 404, 413, 422] {
            assert!(!ProviderError::from_status(status, "x").is_retryable(), "{}", status);
        }
        assert!(ProviderError::Timeout.is_retryable());
    }

    #[test]
    fn test_normalize_message_id() {
        assert_eq!(
            normalize_message_id(" <20130503.1@mg.example.com> "),
            "20130503.1@mg.example.com"
        );
        assert_eq!(normalize_message_id("plain@id"), "plain@id");
    }
}

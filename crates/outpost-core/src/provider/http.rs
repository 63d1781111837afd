//! HTTP provider adapter
//!
//! Posts each message as a form to `{base_url}/{domain}/messages` using basic
//! auth. Custom headers travel as `h:<Name>` fields and correlation variables
//! as `v:<name>` fields.

use super::{normalize_message_id, EmailProvider, OutboundEmail, ProviderError, SendReceipt};
use async_trait::async_trait;
use outpost_common::config::ProviderConfig;
use outpost_common::{Error, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Provider reached over its HTTP API
pub struct HttpProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| Error::Config("provider.api_key is required".to_string()))?;
        if config.domain.is_empty() {
            return Err(Error::Config("provider.domain is required".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/{}/messages",
                config.base_url.trim_end_matches('/'),
                config.domain
            ),
            api_key,
        })
    }

    fn form(email: &OutboundEmail) -> Vec<(String, String)> {
        let mut form = vec![
            ("from".to_string(), email.from.clone()),
            ("to".to_string(), email.to.clone()),
            ("subject".to_string(), email.subject.clone()),
            ("html".to_string(), email.body.clone()),
        ];
        form.extend(
            email
                .headers
                .iter()
                .map(|(name, value)| (format!("h:{}", name), value.clone())),
        );
        form.extend(
            email
                .variables
                .iter()
                .map(|(name, value)| (format!("v:{}", name), value.clone())),
        );
        form
    }
}

#[async_trait]
impl EmailProvider for HttpProvider {
    async fn send(&self, email: &OutboundEmail) -> std::result::Result<SendReceipt, ProviderError> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth("api", Some(&self.api_key))
            .form(&Self::form(email))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout
                } else {
                    ProviderError::Transient {
                        status: None,
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        // Accepted from here on: a bad body must not cause a resend
        let body = match response.json::<SendResponse>().await {
            Ok(body) => body,
            Err(e) => {
                warn!(status = status.as_u16(), error = %e, "Unreadable provider response");
                return Ok(SendReceipt {
                    provider_message_id: None,
                });
            }
        };

        let id = body
            .id
            .map(|id| normalize_message_id(&id))
            .filter(|id| !id.is_empty());
        match &id {
            Some(id) => debug!(message_id = %id, response = ?body.message, "Provider accepted message"),
            None => warn!(response = ?body.message, "Provider accepted message without an id"),
        }

        Ok(SendReceipt {
            provider_message_id: id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer, timeout: Duration) -> HttpProvider {
        HttpProvider::new(
            &ProviderConfig {
                base_url: server.uri(),
                api_key: Some("key-test".to_string()),
                domain: "mg.example.com".to_string(),
            },
            timeout,
        )
        .unwrap()
    }

    fn email() -> OutboundEmail {
        let mut headers = BTreeMap::new();
        headers.insert("X-Outpost-Job-Id".to_string(), "job-1".to_string());
        let mut variables = BTreeMap::new();
        variables.insert("campaignId".to_string(), "camp-1".to_string());
        OutboundEmail {
            to: "lead@example.com".to_string(),
            from: "sales@sender.io".to_string(),
            subject: "Hello".to_string(),
            body: "<p>Hi</p>".to_string(),
            headers,
            variables,
        }
    }

    #[tokio::test]
    async fn test_send_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mg.example.com/messages"))
            .and(header("authorization", "Basic YXBpOmtleS10ZXN0"))
            .and(body_string_contains("h%3AX-Outpost-Job-Id=job-1"))
            .and(body_string_contains("v%3AcampaignId=camp-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "<20240101.1@mg.example.com>",
                "message": "Queued. Thank you."
            })))
            .expect(1)
            .mount(&server)
            .await;

        let receipt = provider(&server, Duration::from_secs(5))
            .send(&email())
            .await
            .unwrap();
        assert_eq!(
            receipt.provider_message_id.as_deref(),
            Some("20240101.1@mg.example.com")
        );
    }

    #[tokio::test]
    async fn test_rate_limited_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = provider(&server, Duration::from_secs(5))
            .send(&email())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProviderError::Transient {
                status: Some(429),
                message: "slow down".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = provider(&server, Duration::from_secs(5))
            .send(&email())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_bad_request_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("'to' parameter is not a valid address"))
            .mount(&server)
            .await;

        let err = provider(&server, Duration::from_secs(5))
            .send(&email())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Permanent { status: Some(400), .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_accepted_without_id_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "message": "Queued. Thank you." })),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202).set_body_string("<html>ok</html>"))
            .mount(&server)
            .await;

        let provider = provider(&server, Duration::from_secs(5));
        let receipt = provider.send(&email()).await.unwrap();
        assert_eq!(receipt.provider_message_id, None);

        let receipt = provider.send(&email()).await.unwrap();
        assert_eq!(receipt.provider_message_id, None);
    }

    #[tokio::test]
    async fn test_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let err = provider(&server, Duration::from_millis(100))
            .send(&email())
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Timeout);
    }

    #[test]
    fn test_requires_api_key() {
        let result = HttpProvider::new(
            &ProviderConfig {
                api_key: None,
                domain: "mg.example.com".to_string(),
                ..ProviderConfig::default()
            },
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}

//! Webhook signature verification
//!
//! The provider signs `timestamp || token` with HMAC-SHA256 and sends the hex
//! digest. Signatures are compared in constant time and old timestamps are
//! rejected whatever the signature says.

use super::WebhookError;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of `timestamp || token`
pub fn compute_signature(signing_key: &str, timestamp: &str, token: &str) -> String {
    // HMAC accepts keys of any length, so construction cannot fail
    let mut mac = match HmacSha256::new_from_slice(signing_key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(timestamp.as_bytes());
    mac.update(token.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Verifies signed webhook requests
#[derive(Clone)]
pub struct SignatureVerifier {
    signing_key: Option<String>,
    replay_window_secs: i64,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("signing_key", &self.signing_key.as_ref().map(|_| "<redacted>"))
            .field("replay_window_secs", &self.replay_window_secs)
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(signing_key: Option<String>, replay_window_secs: i64) -> Self {
        Self {
            signing_key: signing_key.filter(|key| !key.is_empty()),
            replay_window_secs,
        }
    }

    pub fn verify(&self, timestamp: &str, token: &str, signature: &str) -> Result<(), WebhookError> {
        self.verify_at(timestamp, token, signature, Utc::now())
    }

    pub fn verify_at(
        &self,
        timestamp: &str,
        token: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        let key = self.signing_key.as_deref().ok_or(WebhookError::MissingSecret)?;

        let sent_at: i64 = timestamp.trim().parse().map_err(|_| {
            WebhookError::MalformedPayload(format!("invalid signature timestamp: {}", timestamp))
        })?;
        let age = (now.timestamp() - sent_at).abs();
        if age > self.replay_window_secs {
            return Err(WebhookError::StaleTimestamp { age_secs: age });
        }

        let expected = compute_signature(key, timestamp, token);
        let received = signature.trim().to_ascii_lowercase();
        if !constant_time_eq(expected.as_bytes(), received.as_bytes()) {
            return Err(WebhookError::InvalidSignature);
        }

        Ok(())
    }
}

//! Suppression registry
//!
//! Wraps a [`SuppressionRepository`] with address normalization, the
//! bounce-severity mapping and upgrade-only writes. Every send path asks
//! [`SuppressionRegistry::is_suppressed`] before handing mail to the provider.

use chrono::{DateTime, Utc};
use outpost_common::config::SuppressionConfig;
use outpost_common::types::{is_valid_email, normalize_email};
use outpost_common::{Error, Result};
use outpost_storage::models::{
    soft_bounce_expiry, BounceType, NewSuppression, SuppressionEntry, SuppressionType,
    SuppressionWrite,
};
use outpost_storage::repository::SuppressionRepository;
use std::sync::Arc;
use tracing::{debug, info};

/// Bounce severity reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BounceSeverity {
    Permanent,
    Temporary,
}

impl BounceSeverity {
    /// Parse the provider's severity; anything but "temporary" is permanent
    pub fn from_provider(severity: Option<&str>) -> Self {
        match severity.map(|s| s.trim().to_ascii_lowercase()) {
            Some(s) if s == "temporary" => BounceSeverity::Temporary,
            _ => BounceSeverity::Permanent,
        }
    }

    pub fn bounce_type(self) -> BounceType {
        match self {
            BounceSeverity::Permanent => BounceType::Hard,
            BounceSeverity::Temporary => BounceType::Soft,
        }
    }
}

/// Suppression registry
pub struct SuppressionRegistry {
    repo: Arc<dyn SuppressionRepository>,
    soft_bounce_ttl_days: i64,
}

impl SuppressionRegistry {
    pub fn new(repo: Arc<dyn SuppressionRepository>, config: &SuppressionConfig) -> Self {
        Self {
            repo,
            soft_bounce_ttl_days: config.soft_bounce_ttl_days,
        }
    }

    /// Add an entry unless a stricter (or equal) active entry already exists
    pub async fn add(&self, entry: NewSuppression) -> Result<SuppressionWrite> {
        self.add_at(entry, Utc::now()).await
    }

    async fn add_at(
        &self,
        mut entry: NewSuppression,
        now: DateTime<Utc>,
    ) -> Result<SuppressionWrite> {
        entry.email = Self::normalize(&entry.email)?;
        if entry.suppression_type != SuppressionType::Bounce {
            entry.bounce_type = None;
        }

        let write = self.repo.upsert_if_stricter(entry.clone(), now).await?;

        match &write {
            SuppressionWrite::Written(stored) => {
                info!(
                    email = %stored.email,
                    suppression_type = %stored.suppression_type,
                    client_id = ?stored.client_id,
                    expires_at = ?stored.expires_at,
                    "Address suppressed"
                );
            }
            SuppressionWrite::Kept(existing) => {
                info!(
                    email = %existing.email,
                    existing = %existing.suppression_type,
                    attempted = %entry.suppression_type,
                    "Ignoring suppression downgrade"
                );
            }
        }

        Ok(write)
    }

    /// Whether `email` is blocked for `client_id` right now
    pub async fn is_suppressed(&self, email: &str, client_id: Option<&str>) -> Result<bool> {
        self.is_suppressed_at(email, client_id, Utc::now()).await
    }

    pub async fn is_suppressed_at(
        &self,
        email: &str,
        client_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.find_active_at(email, client_id, now).await?.is_some())
    }

    /// Strongest entry currently blocking `email`
    pub async fn find_active_at(
        &self,
        email: &str,
        client_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<SuppressionEntry>> {
        let email = normalize_email(email);
        self.repo.find_active(&email, client_id, now).await
    }

    /// Record a bounce; permanent bounces never expire, temporary ones do
    pub async fn record_bounce(
        &self,
        email: &str,
        severity: BounceSeverity,
        reason: Option<String>,
        client_id: Option<String>,
    ) -> Result<SuppressionWrite> {
        let now = Utc::now();
        let expires_at = match severity {
            BounceSeverity::Permanent => None,
            BounceSeverity::Temporary => Some(soft_bounce_expiry(now, self.soft_bounce_ttl_days)),
        };

        self.add_at(
            NewSuppression {
                email: email.to_string(),
                suppression_type: SuppressionType::Bounce,
                bounce_type: Some(severity.bounce_type()),
                reason,
                client_id,
                expires_at,
            },
            now,
        )
        .await
    }

    pub async fn record_complaint(
        &self,
        email: &str,
        reason: Option<String>,
        client_id: Option<String>,
    ) -> Result<SuppressionWrite> {
        self.add(Self::permanent(email, SuppressionType::Complaint, reason, client_id))
            .await
    }

    pub async fn record_unsubscribe(
        &self,
        email: &str,
        reason: Option<String>,
        client_id: Option<String>,
    ) -> Result<SuppressionWrite> {
        self.add(Self::permanent(email, SuppressionType::Unsubscribe, reason, client_id))
            .await
    }

    /// Operator-initiated block
    pub async fn add_manual(
        &self,
        email: &str,
        reason: Option<String>,
        client_id: Option<String>,
    ) -> Result<SuppressionWrite> {
        self.add(Self::permanent(email, SuppressionType::Manual, reason, client_id))
            .await
    }

    /// Explicit removal; the only way a permanent entry goes away
    pub async fn remove(&self, email: &str, client_id: Option<&str>) -> Result<bool> {
        let email = normalize_email(email);
        let removed = self.repo.delete(&email, client_id).await?;
        if removed {
            info!(email = %email, client_id = ?client_id, "Suppression removed");
        }
        Ok(removed)
    }

    pub async fn get(&self, email: &str, client_id: Option<&str>) -> Result<Option<SuppressionEntry>> {
        self.repo.get(&normalize_email(email), client_id).await
    }

    pub async fn list(&self, client_id: Option<&str>, limit: i64) -> Result<Vec<SuppressionEntry>> {
        self.repo.list(client_id, limit).await
    }

    /// Normalized addresses from `emails` that are currently blocked
    pub async fn filter_suppressed(
        &self,
        emails: &[String],
        client_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut normalized: Vec<String> = emails.iter().map(|e| normalize_email(e)).collect();
        normalized.sort();
        normalized.dedup();
        self.repo.filter_active(&normalized, client_id, Utc::now()).await
    }

    /// Delete expired entries
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let removed = self.repo.delete_expired(Utc::now()).await?;
        if removed > 0 {
            debug!(removed, "Expired suppressions removed");
        }
        Ok(removed)
    }

    fn permanent(
        email: &str,
        suppression_type: SuppressionType,
        reason: Option<String>,
        client_id: Option<String>,
    ) -> NewSuppression {
        NewSuppression {
            email: email.to_string(),
            suppression_type,
            bounce_type: None,
            reason,
            client_id,
            expires_at: None,
        }
    }

    fn normalize(email: &str) -> Result<String> {
        let email = normalize_email(email);
        if !is_valid_email(&email) {
            return Err(Error::Validation(format!("Invalid email address: {}", email)));
        }
        Ok(email)
    }
}

//! Common types for Outpost

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

/// Unique identifier for queued email jobs
pub type JobId = Uuid;

/// Unique identifier for dead-letter entries
pub type DeadLetterId = Uuid;

/// Campaign identifier, owned by the campaign service
pub type CampaignId = String;

/// Lead identifier, owned by the lead service
pub type LeadId = String;

/// Client (tenant) identifier
pub type ClientId = String;

fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[^\s@<>()\[\],;:]+@[^\s@<>()\[\],;:]+\.[^\s@<>()\[\],;:.]+$")
            .expect("address pattern is a valid regex")
    })
}

/// Email address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    pub local: String,
    pub domain: String,
}

impl EmailAddress {
    /// Create a new email address
    pub fn new(local: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            domain: domain.into(),
        }
    }

    /// Parse an email address from a string
    ///
    /// Surrounding whitespace is ignored; the domain must contain a dot.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() > 254 || !address_pattern().is_match(s) {
            return None;
        }
        let (local, domain) = s.rsplit_once('@')?;
        if local.len() > 64 {
            return None;
        }
        Some(Self::new(local, domain))
    }

    /// Lowercased form used as a suppression key
    pub fn normalized(&self) -> String {
        format!("{}@{}", self.local, self.domain).to_lowercase()
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}

impl std::str::FromStr for EmailAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
            .ok_or_else(|| crate::Error::Validation(format!("Invalid email address: {}", s)))
    }
}

/// Whether `s` is a syntactically valid address
pub fn is_valid_email(s: &str) -> bool {
    EmailAddress::parse(s).is_some()
}

/// Trimmed, lowercased address
pub fn normalize_email(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Lowercased domain part of an address, if any
pub fn email_domain(s: &str) -> Option<String> {
    s.trim()
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_lowercase())
        .filter(|domain| !domain.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let addr = EmailAddress::parse("  Jane.Doe@Example.COM ").unwrap();
        assert_eq!(addr.local, "Jane.Doe");
        assert_eq!(addr.domain, "Example.COM");
        assert_eq!(addr.normalized(), "jane.doe@example.com");
        assert_eq!(addr.to_string(), "Jane.Doe@Example.COM");
    }

    #[test]
    fn test_parse_invalid() {
        for input in [
            "",
            "plainaddress",
            "@example.com",
            "user@",
            "user@localhost",
            "user name@example.com",
            "user@@example.com",
            "user@example.",
            "<user@example.com>",
        ] {
            assert!(!is_valid_email(input), "{input:?} should be rejected");
        }
    }

    #[test]
    fn test_from_str_reports_validation() {
        let err = "nope".parse::<EmailAddress>().unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_domain_helpers() {
        assert_eq!(email_domain("a@Gmail.com"), Some("gmail.com".to_string()));
        assert_eq!(email_domain("missing-at"), None);
        assert_eq!(normalize_email(" A@B.Co "), "a@b.co");
    }
}

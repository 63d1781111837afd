//! A/B variant selection
//!
//! A lead is assigned to a bucket in `[0, 100)` from a SHA-256 digest of its
//! identifier, so the assignment only depends on the input string and is
//! stable across restarts and instances.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A renderable template variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVersion {
    pub subject: String,
    pub body: String,
}

/// Traffic share declared for one version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbShare {
    pub version: String,
    pub percentage: f64,
}

/// Template with its versions and an optional A/B split
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    /// Version key -> content
    pub versions: BTreeMap<String, TemplateVersion>,
    /// Split in declaration order; empty means "always the latest version"
    #[serde(default)]
    pub ab_split: Vec<AbShare>,
}

impl Template {
    /// Lexicographically-last version key, treated as the latest
    pub fn latest(&self) -> Option<(&str, &TemplateVersion)> {
        self.versions
            .iter()
            .next_back()
            .map(|(key, version)| (key.as_str(), version))
    }
}

/// Outcome of a selection
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedVersion<'a> {
    pub key: &'a str,
    pub version: &'a TemplateVersion,
    pub bucket: u8,
}

/// Map an identifier to a bucket in `[0, 100)`
pub fn hash_to_bucket(lead_id: &str) -> u8 {
    let digest = Sha256::digest(lead_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 100) as u8
}

/// Pick the version of `template` that `lead_id` should receive.
///
/// Returns `None` only when the template has no versions.
pub fn select_template_version<'a>(
    template: &'a Template,
    lead_id: &str,
) -> Option<SelectedVersion<'a>> {
    let (latest_key, latest) = template.latest()?;
    let bucket = hash_to_bucket(lead_id);

    let latest_selection = SelectedVersion {
        key: latest_key,
        version: latest,
        bucket,
    };

    let chosen = match split_choice(&template.ab_split, bucket) {
        Some(key) => key,
        None => return Some(latest_selection),
    };

    match template.versions.get_key_value(chosen) {
        Some((key, version)) => Some(SelectedVersion {
            key: key.as_str(),
            version,
            bucket,
        }),
        None => Some(latest_selection),
    }
}

/// Walk the normalized split and return the share covering `bucket`
fn split_choice(split: &[AbShare], bucket: u8) -> Option<&str> {
    let total: f64 = split
        .iter()
        .map(|share| share.percentage.max(0.0))
        .sum();
    if total <= 0.0 {
        return None;
    }

    let bucket = f64::from(bucket);
    let mut cumulative = 0.0;
    for share in split {
        cumulative += share.percentage.max(0.0) * 100.0 / total;
        if cumulative > bucket {
            return Some(share.version.as_str());
        }
    }

    // Rounding can leave the running total a hair under 100
    split
        .iter()
        .rev()
        .find(|share| share.percentage > 0.0)
        .map(|share| share.version.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn template(keys: &[&str], split: &[(&str, f64)]) -> Template {
        Template {
            name: "welcome".to_string(),
            versions: keys
                .iter()
                .map(|key| {
                    (
                        key.to_string(),
                        TemplateVersion {
                            subject: format!("Subject {}", key),
                            body: format!("Body {}", key),
                        },
                    )
                })
                .collect(),
            ab_split: split
                .iter()
                .map(|(version, percentage)| AbShare {
                    version: version.to_string(),
                    percentage: *percentage,
                })
                .collect(),
        }
    }

    #[test]
    fn test_bucket_is_deterministic() {
        let first = hash_to_bucket("lead-42");
        for _ in 0..10 {
            assert_eq!(hash_to_bucket("lead-42"), first);
        }
        assert!(first < 100);
    }

    #[test]
    fn test_buckets_spread_over_range() {
        let distinct: std::collections::HashSet<u8> =
            (0..1000).map(|i| hash_to_bucket(&format!("lead-{}", i))).collect();
        assert!(distinct.len() > 90);
    }

    #[test]
    fn test_no_split_returns_latest() {
        let t = template(&["v1", "v3", "v2"], &[]);
        let selected = select_template_version(&t, "lead-1").unwrap();
        assert_eq!(selected.key, "v3");
    }

    #[test]
    fn test_empty_template() {
        let t = template(&[], &[("A", 50.0)]);
        assert!(select_template_version(&t, "lead-1").is_none());
    }

    #[test]
    fn test_fifty_fifty_split_is_balanced() {
        let t = template(&["A", "B"], &[("A", 50.0), ("B", 50.0)]);
        let mut a = 0;
        let mut b = 0;
        for i in 0..1000 {
            match select_template_version(&t, &format!("lead-{}", i)).unwrap().key {
                "A" => a += 1,
                "B" => b += 1,
                other => panic!("unexpected variant {}", other),
            }
        }
        assert!((400..=600).contains(&a), "A got {}", a);
        assert!((400..=600).contains(&b), "B got {}", b);
    }

    #[test]
    fn test_percentages_are_normalized() {
        // 1:3 declared as 10/30 behaves like 25/75
        let t = template(&["A", "B"], &[("A", 10.0), ("B", 30.0)]);
        for i in 0..200 {
            let lead = format!("lead-{}", i);
            let bucket = hash_to_bucket(&lead);
            let expected = if bucket < 25 { "A" } else { "B" };
            assert_eq!(select_template_version(&t, &lead).unwrap().key, expected);
        }
    }

    #[test]
    fn test_declaration_order_is_respected() {
        // "B" is declared first, so it owns the low buckets
        let t = template(&["A", "B"], &[("B", 100.0), ("A", 0.0)]);
        for i in 0..50 {
            assert_eq!(
                select_template_version(&t, &format!("lead-{}", i)).unwrap().key,
                "B"
            );
        }
    }

    #[test]
    fn test_missing_variant_falls_back_to_latest() {
        let t = template(&["v1", "v2"], &[("gone", 100.0)]);
        assert_eq!(select_template_version(&t, "lead-7").unwrap().key, "v2");
    }

    #[test]
    fn test_split_deserializes_in_declaration_order() {
        let t: Template = serde_json::from_str(
            r#"{
                "name": "promo",
                "versions": {
                    "a": {"subject": "s", "body": "b"},
                    "b": {"subject": "s", "body": "b"}
                },
                "ab_split": [
                    {"version": "b", "percentage": 70},
                    {"version": "a", "percentage": 30}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(t.ab_split[0].version, "b");
        assert_eq!(t.latest().unwrap().0, "b");
    }
}

//! Per-domain counters
//!
//! The monitor only talks to [`DomainMetricsStore`]; the in-memory store is a
//! single-process approximation and a shared store can replace it without
//! touching the call sites.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outpost_common::Result;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// One observation for a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainSignal {
    Send,
    Bounce,
    Complaint,
    Delivery { latency_ms: Option<u64> },
}

/// Counters for a destination domain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainMetrics {
    pub domain: String,
    pub sent: u64,
    pub bounces: u64,
    pub complaints: u64,
    pub deliveries: u64,
    /// Most recent delivery latencies, oldest first
    pub latencies_ms: VecDeque<u64>,
    pub last_event_at: DateTime<Utc>,
    pub alerted: bool,
}

impl DomainMetrics {
    pub fn new(domain: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            domain: domain.into(),
            sent: 0,
            bounces: 0,
            complaints: 0,
            deliveries: 0,
            latencies_ms: VecDeque::new(),
            last_event_at: now,
            alerted: false,
        }
    }

    /// Apply a signal, keeping at most `latency_window` latencies
    pub fn apply(&mut self, signal: DomainSignal, latency_window: usize, now: DateTime<Utc>) {
        match signal {
            DomainSignal::Send => self.sent += 1,
            DomainSignal::Bounce => self.bounces += 1,
            DomainSignal::Complaint => self.complaints += 1,
            DomainSignal::Delivery { latency_ms } => {
                self.deliveries += 1;
                if let Some(latency) = latency_ms {
                    if latency_window > 0 {
                        while self.latencies_ms.len() >= latency_window {
                            self.latencies_ms.pop_front();
                        }
                        self.latencies_ms.push_back(latency);
                    }
                }
            }
        }
        self.last_event_at = now;
    }

    pub fn bounce_rate(&self) -> f64 {
        ratio(self.bounces, self.sent)
    }

    pub fn complaint_rate(&self) -> f64 {
        ratio(self.complaints, self.sent)
    }

    pub fn avg_latency_ms(&self) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        let total: u64 = self.latencies_ms.iter().sum();
        Some(total as f64 / self.latencies_ms.len() as f64)
    }

    /// Nearest-rank 95th percentile
    pub fn p95_latency_ms(&self) -> Option<u64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = self.latencies_ms.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted.get(rank.saturating_sub(1)).copied()
    }
}

fn ratio(n: u64, sent: u64) -> f64 {
    if sent == 0 {
        0.0
    } else {
        n as f64 / sent as f64
    }
}

/// Storage for domain metrics
#[async_trait]
pub trait DomainMetricsStore: Send + Sync {
    /// Apply a signal and return the updated counters
    async fn record(
        &self,
        domain: &str,
        signal: DomainSignal,
        now: DateTime<Utc>,
    ) -> Result<DomainMetrics>;
    async fn snapshot(&self, domain: &str) -> Result<Option<DomainMetrics>>;
    async fn snapshots(&self) -> Result<Vec<DomainMetrics>>;
    /// Set the alert latch; true only for the call that set it
    async fn latch_alert(&self, domain: &str) -> Result<bool>;
    /// Drop domains with no events since `before`
    async fn evict_inactive(&self, before: DateTime<Utc>) -> Result<usize>;
    async fn clear(&self) -> Result<()>;
}

/// Process-local domain metrics
#[derive(Clone)]
pub struct InMemoryDomainMetricsStore {
    latency_window: usize,
    domains: Arc<RwLock<HashMap<String, DomainMetrics>>>,
}

impl InMemoryDomainMetricsStore {
    pub fn new(latency_window: usize) -> Self {
        Self {
            latency_window,
            domains: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl DomainMetricsStore for InMemoryDomainMetricsStore {
    async fn record(
        &self,
        domain: &str,
        signal: DomainSignal,
        now: DateTime<Utc>,
    ) -> Result<DomainMetrics> {
        let mut domains = self.domains.write().await;
        let metrics = domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainMetrics::new(domain, now));
        metrics.apply(signal, self.latency_window, now);
        Ok(metrics.clone())
    }

    async fn snapshot(&self, domain: &str) -> Result<Option<DomainMetrics>> {
        Ok(self.domains.read().await.get(domain).cloned())
    }

    async fn snapshots(&self) -> Result<Vec<DomainMetrics>> {
        let mut all: Vec<DomainMetrics> = self.domains.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(all)
    }

    async fn latch_alert(&self, domain: &str) -> Result<bool> {
        let mut domains = self.domains.write().await;
        match domains.get_mut(domain) {
            Some(metrics) if !metrics.alerted => {
                metrics.alerted = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn evict_inactive(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut domains = self.domains.write().await;
        let count = domains.len();
        domains.retain(|_, metrics| metrics.last_event_at >= before);
        Ok(count - domains.len())
    }

    async fn clear(&self) -> Result<()> {
        self.domains.write().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_latency_ring_buffer_is_bounded() {
        let now = Utc::now();
        let mut metrics = DomainMetrics::new("example.com", now);
        for latency in 1..=5 {
            metrics.apply(
                DomainSignal::Delivery {
                    latency_ms: Some(latency),
                },
                3,
                now,
            );
        }
        assert_eq!(metrics.deliveries, 5);
        assert_eq!(metrics.latencies_ms, VecDeque::from(vec![3, 4, 5]));
        assert_eq!(metrics.avg_latency_ms(), Some(4.0));
    }

    #[test]
    fn test_p95_latency() {
        let now = Utc::now();
        let mut metrics = DomainMetrics::new("example.com", now);
        assert_eq!(metrics.p95_latency_ms(), None);
        for latency in 1..=100 {
            metrics.apply(
                DomainSignal::Delivery {
                    latency_ms: Some(latency),
                },
                100,
                now,
            );
        }
        assert_eq!(metrics.p95_latency_ms(), Some(95));
    }

    #[test]
    fn test_rates_without_sends() {
        let metrics = DomainMetrics::new("example.com", Utc::now());
        assert_eq!(metrics.bounce_rate(), 0.0);
        assert_eq!(metrics.complaint_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_latch_fires_once() {
        let store = InMemoryDomainMetricsStore::new(10);
        assert!(!store.latch_alert("example.com").await.unwrap());

        store
            .record("example.com", DomainSignal::Send, Utc::now())
            .await
            .unwrap();
        assert!(store.latch_alert("example.com").await.unwrap());
        assert!(!store.latch_alert("example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_evict_inactive() {
        let store = InMemoryDomainMetricsStore::new(10);
        let now = Utc::now();
        store
            .record("old.com", DomainSignal::Send, now - Duration::hours(48))
            .await
            .unwrap();
        store.record("new.com", DomainSignal::Send, now).await.unwrap();

        assert_eq!(
            store.evict_inactive(now - Duration::hours(24)).await.unwrap(),
            1
        );
        let domains: Vec<String> = store
            .snapshots()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.domain)
            .collect();
        assert_eq!(domains, vec!["new.com".to_string()]);
    }
}

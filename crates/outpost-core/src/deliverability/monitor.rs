//! Deliverability Monitor - Per-domain health and adaptive throttling

use super::store::{DomainMetrics, DomainMetricsStore, DomainSignal};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use outpost_common::config::DeliverabilityConfig;
use outpost_common::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Complaints weigh this much more than bounces when sizing the delay
const COMPLAINT_WEIGHT: f64 = 20.0;

/// Raised once per domain when a rate crosses the alert threshold
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliverabilityAlert {
    pub domain: String,
    pub sent: u64,
    pub bounce_rate: f64,
    pub complaint_rate: f64,
    pub threshold: f64,
}

/// Destination for deliverability alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert: &DeliverabilityAlert);
}

/// Sink that only logs
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, alert: &DeliverabilityAlert) {
        warn!(
            domain = %alert.domain,
            sent = alert.sent,
            bounce_rate = alert.bounce_rate,
            complaint_rate = alert.complaint_rate,
            threshold = alert.threshold,
            "Deliverability alert"
        );
    }
}

/// Health view of one domain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainHealth {
    pub domain: String,
    pub sent: u64,
    pub bounces: u64,
    pub complaints: u64,
    pub deliveries: u64,
    pub bounce_rate: f64,
    pub complaint_rate: f64,
    pub avg_latency_ms: Option<f64>,
    pub p95_latency_ms: Option<u64>,
    pub slowdown: bool,
    pub recommended_delay_ms: u64,
    pub alerted: bool,
}

/// Health view of every tracked domain
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub domains: Vec<DomainHealth>,
    pub total_sent: u64,
    pub total_bounces: u64,
    pub total_complaints: u64,
    pub throttled_domains: usize,
}

/// Deliverability monitor
pub struct DeliverabilityMonitor {
    store: Arc<dyn DomainMetricsStore>,
    alert_sink: Arc<dyn AlertSink>,
    config: DeliverabilityConfig,
}

impl DeliverabilityMonitor {
    pub fn new(store: Arc<dyn DomainMetricsStore>, config: DeliverabilityConfig) -> Self {
        Self {
            store,
            alert_sink: Arc::new(LogAlertSink),
            config,
        }
    }

    /// Replace the default logging sink
    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = sink;
        self
    }

    pub async fn record_send(&self, domain: &str) -> Result<()> {
        self.record(domain, DomainSignal::Send).await.map(|_| ())
    }

    pub async fn record_bounce(&self, domain: &str) -> Result<()> {
        self.record(domain, DomainSignal::Bounce).await?;
        self.check_alerts(domain).await.map(|_| ())
    }

    pub async fn record_complaint(&self, domain: &str) -> Result<()> {
        self.record(domain, DomainSignal::Complaint).await?;
        self.check_alerts(domain).await.map(|_| ())
    }

    pub async fn record_delivery(&self, domain: &str, latency_ms: Option<u64>) -> Result<()> {
        self.record(domain, DomainSignal::Delivery { latency_ms })
            .await
            .map(|_| ())
    }

    async fn record(&self, domain: &str, signal: DomainSignal) -> Result<DomainMetrics> {
        let domain = domain.trim().to_ascii_lowercase();
        self.store.record(&domain, signal, Utc::now()).await
    }

    /// Whether sends to `domain` should be slowed down
    pub async fn should_slowdown(&self, domain: &str) -> Result<bool> {
        Ok(self
            .snapshot(domain)
            .await?
            .map_or(false, |metrics| self.is_unhealthy(&metrics)))
    }

    /// Delay to wait before the next send to `domain`; zero when healthy
    pub async fn get_recommended_delay(&self, domain: &str) -> Result<Duration> {
        Ok(self
            .snapshot(domain)
            .await?
            .map_or(Duration::ZERO, |metrics| self.delay_for(&metrics)))
    }

    /// Wait out the recommended delay for `domain`
    pub async fn apply_send_rate(&self, domain: &str) -> Result<Duration> {
        let delay = self.get_recommended_delay(domain).await?;
        if !delay.is_zero() {
            debug!(domain = %domain, delay_ms = delay.as_millis() as u64, "Throttling send");
            tokio::time::sleep(delay).await;
        }
        Ok(delay)
    }

    /// Raise an alert if `domain` crossed the alert threshold.
    ///
    /// Fires at most once per domain until [`DeliverabilityMonitor::reset`].
    pub async fn check_alerts(&self, domain: &str) -> Result<bool> {
        let metrics = match self.snapshot(domain).await? {
            Some(metrics) => metrics,
            None => return Ok(false),
        };

        let threshold = self.config.alert_threshold;
        let breached = metrics.sent >= self.config.min_sample
            && (metrics.bounce_rate() >= threshold || metrics.complaint_rate() >= threshold);
        if !breached || metrics.alerted {
            return Ok(false);
        }

        if !self.store.latch_alert(&metrics.domain).await? {
            return Ok(false);
        }

        self.alert_sink
            .notify(&DeliverabilityAlert {
                domain: metrics.domain.clone(),
                sent: metrics.sent,
                bounce_rate: metrics.bounce_rate(),
                complaint_rate: metrics.complaint_rate(),
                threshold,
            })
            .await;

        Ok(true)
    }

    /// Forget every domain, including alert latches
    pub async fn reset(&self) -> Result<()> {
        self.store.clear().await
    }

    /// Evict domains with no events in the last `older_than_hours`
    pub async fn cleanup(&self, older_than_hours: i64) -> Result<usize> {
        let cutoff = Utc::now() - ChronoDuration::hours(older_than_hours);
        let evicted = self.store.evict_inactive(cutoff).await?;
        if evicted > 0 {
            debug!(evicted, "Inactive domains evicted");
        }
        Ok(evicted)
    }

    /// Cleanup with the configured inactivity window
    pub async fn cleanup_inactive(&self) -> Result<usize> {
        self.cleanup(self.config.inactivity_eviction_hours).await
    }

    pub async fn domain_health(&self, domain: &str) -> Result<Option<DomainHealth>> {
        Ok(self
            .snapshot(domain)
            .await?
            .map(|metrics| self.health_of(&metrics)))
    }

    pub async fn health_summary(&self) -> Result<HealthSummary> {
        let domains: Vec<DomainHealth> = self
            .store
            .snapshots()
            .await?
            .iter()
            .map(|metrics| self.health_of(metrics))
            .collect();

        Ok(HealthSummary {
            total_sent: domains.iter().map(|d| d.sent).sum(),
            total_bounces: domains.iter().map(|d| d.bounces).sum(),
            total_complaints: domains.iter().map(|d| d.complaints).sum(),
            throttled_domains: domains.iter().filter(|d| d.slowdown).count(),
            domains,
        })
    }

    async fn snapshot(&self, domain: &str) -> Result<Option<DomainMetrics>> {
        self.store
            .snapshot(&domain.trim().to_ascii_lowercase())
            .await
    }

    fn is_unhealthy(&self, metrics: &DomainMetrics) -> bool {
        metrics.sent >= self.config.min_sample.max(1)
            && (metrics.bounce_rate() >= self.config.bounce_threshold
                || metrics.complaint_rate() >= self.config.complaint_threshold)
    }

    fn delay_for(&self, metrics: &DomainMetrics) -> Duration {
        if !self.is_unhealthy(metrics) {
            return Duration::ZERO;
        }
        let base = self.config.slowdown_base_ms as f64;
        let severity = metrics
            .bounce_rate()
            .max(metrics.complaint_rate() * COMPLAINT_WEIGHT);
        let delay_ms = (severity * base).ceil().min(3.0 * base);
        Duration::from_millis(delay_ms as u64)
    }

    fn health_of(&self, metrics: &DomainMetrics) -> DomainHealth {
        DomainHealth {
            domain: metrics.domain.clone(),
            sent: metrics.sent,
            bounces: metrics.bounces,
            complaints: metrics.complaints,
            deliveries: metrics.deliveries,
            bounce_rate: metrics.bounce_rate(),
            complaint_rate: metrics.complaint_rate(),
            avg_latency_ms: metrics.avg_latency_ms(),
            p95_latency_ms: metrics.p95_latency_ms(),
            slowdown: self.is_unhealthy(metrics),
            recommended_delay_ms: self.delay_for(metrics).as_millis() as u64,
            alerted: metrics.alerted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deliverability::InMemoryDomainMetricsStore;
    use pretty_assertions::assert_eq;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        alerts: Mutex<Vec<DeliverabilityAlert>>,
    }

    #[async_trait]
    impl AlertSink for RecordingSink {
        async fn notify(&self, alert: &DeliverabilityAlert) {
            self.alerts.lock().await.push(alert.clone());
        }
    }

    fn monitor() -> DeliverabilityMonitor {
        let config = DeliverabilityConfig::default();
        DeliverabilityMonitor::new(
            Arc::new(InMemoryDomainMetricsStore::new(config.latency_window)),
            config,
        )
    }

    async fn seed(monitor: &DeliverabilityMonitor, domain: &str, sent: u32, bounces: u32) {
        for _ in 0..sent {
            monitor.record_send(domain).await.unwrap();
        }
        for _ in 0..bounces {
            monitor.record_bounce(domain).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_six_percent_bounces_slow_down() {
        let monitor = monitor();
        seed(&monitor, "example.com", 100, 6).await;

        assert!(monitor.should_slowdown("example.com").await.unwrap());
        let delay = monitor.get_recommended_delay("example.com").await.unwrap();
        assert!(delay > Duration::ZERO);
        // ceil(0.06 * 1000)
        assert!(delay >= Duration::from_millis(60) && delay <= Duration::from_millis(61));
    }

    #[tokio::test]
    async fn test_one_percent_bounces_is_healthy() {
        let monitor = monitor();
        seed(&monitor, "example.com", 100, 1).await;

        assert!(!monitor.should_slowdown("example.com").await.unwrap());
        assert_eq!(
            monitor.get_recommended_delay("example.com").await.unwrap(),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_complaints_are_weighted() {
        let monitor = monitor();
        seed(&monitor, "example.com", 100, 0).await;
        monitor.record_complaint("example.com").await.unwrap();

        // 1% complaints: severity 0.2 -> 200ms at a 1000ms base
        assert!(monitor.should_slowdown("example.com").await.unwrap());
        let delay = monitor.get_recommended_delay("example.com").await.unwrap();
        assert!(delay >= Duration::from_millis(200) && delay <= Duration::from_millis(201));
    }

    #[tokio::test]
    async fn test_delay_is_capped() {
        let monitor = monitor();
        seed(&monitor, "example.com", 10, 0).await;
        for _ in 0..10 {
            monitor.record_complaint("example.com").await.unwrap();
        }
        assert_eq!(
            monitor.get_recommended_delay("example.com").await.unwrap(),
            Duration::from_millis(3000)
        );
    }

    #[tokio::test]
    async fn test_unknown_domain_is_healthy() {
        let monitor = monitor();
        assert!(!monitor.should_slowdown("nowhere.com").await.unwrap());
        assert!(monitor.domain_health("nowhere.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_alert_latches_until_reset() {
        let sink = Arc::new(RecordingSink::default());
        let config = DeliverabilityConfig::default();
        let monitor = DeliverabilityMonitor::new(
            Arc::new(InMemoryDomainMetricsStore::new(config.latency_window)),
            config,
        )
        .with_alert_sink(sink.clone());

        seed(&monitor, "example.com", 10, 2).await;
        seed(&monitor, "example.com", 0, 3).await;
        assert_eq!(sink.alerts.lock().await.len(), 1);
        assert!(!monitor.check_alerts("example.com").await.unwrap());

        monitor.reset().await.unwrap();
        seed(&monitor, "example.com", 10, 2).await;
        assert_eq!(sink.alerts.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_domain_is_case_insensitive() {
        let monitor = monitor();
        monitor.record_send("Example.COM").await.unwrap();
        let health = monitor.domain_health("example.com").await.unwrap().unwrap();
        assert_eq!(health.sent, 1);
    }

    #[tokio::test]
    async fn test_health_summary() {
        let monitor = monitor();
        seed(&monitor, "bad.com", 100, 10).await;
        seed(&monitor, "good.com", 50, 0).await;
        monitor.record_delivery("good.com", Some(120)).await.unwrap();
        monitor.record_delivery("good.com", Some(80)).await.unwrap();

        let summary = monitor.health_summary().await.unwrap();
        assert_eq!(summary.total_sent, 150);
        assert_eq!(summary.total_bounces, 10);
        assert_eq!(summary.throttled_domains, 1);

        let good = &summary.domains[1];
        assert_eq!(good.domain, "good.com");
        assert_eq!(good.avg_latency_ms, Some(100.0));
        assert_eq!(good.p95_latency_ms, Some(120));
        assert!(summary.domains[0].alerted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_send_rate_waits() {
        let monitor = monitor();
        seed(&monitor, "example.com", 100, 6).await;

        let start = tokio::time::Instant::now();
        let delay = monitor.apply_send_rate("example.com").await.unwrap();
        assert!(delay > Duration::ZERO);
        assert!(start.elapsed() >= delay);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_domains() {
        let monitor = monitor();
        monitor.record_send("example.com").await.unwrap();
        assert_eq!(monitor.cleanup(24).await.unwrap(), 0);
        assert_eq!(monitor.cleanup(-1).await.unwrap(), 1);
    }
}

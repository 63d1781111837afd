//! Deliverability - Per-domain health counters and adaptive throttling

mod monitor;
mod store;

pub use monitor::{
    AlertSink, DeliverabilityAlert, DeliverabilityMonitor, DomainHealth, HealthSummary,
    LogAlertSink,
};
pub use store::{DomainMetrics, DomainMetricsStore, DomainSignal, InMemoryDomainMetricsStore};

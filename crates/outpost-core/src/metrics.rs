//! Pipeline metrics exposed in the Prometheus text format

use outpost_common::{Error, Result};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

const PROVIDER_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Job lifecycle outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Enqueued,
    Sent,
    Retried,
    Failed,
    DeadLettered,
    Suppressed,
}

impl JobOutcome {
    fn label(self) -> &'static str {
        match self {
            JobOutcome::Enqueued => "enqueued",
            JobOutcome::Sent => "sent",
            JobOutcome::Retried => "retried",
            JobOutcome::Failed => "failed",
            JobOutcome::DeadLettered => "dead_lettered",
            JobOutcome::Suppressed => "suppressed",
        }
    }
}

/// Webhook outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Duplicate,
    Rejected,
    Ignored,
}

impl WebhookOutcome {
    fn label(self) -> &'static str {
        match self {
            WebhookOutcome::Processed => "processed",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Rejected => "rejected",
            WebhookOutcome::Ignored => "ignored",
        }
    }
}

/// Counters for the delivery pipeline
pub struct PipelineMetrics {
    registry: Registry,
    jobs_total: IntCounterVec,
    webhooks_total: IntCounterVec,
    provider_duration: Histogram,
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("Metrics error: {}", e))
}

impl PipelineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("outpost".to_string()), None)
            .map_err(metric_error)?;

        let jobs_total = IntCounterVec::new(
            Opts::new("jobs_total", "Email jobs by lifecycle outcome"),
            &["outcome"],
        )
        .map_err(metric_error)?;

        let webhooks_total = IntCounterVec::new(
            Opts::new("webhooks_total", "Provider webhooks by outcome"),
            &["outcome"],
        )
        .map_err(metric_error)?;

        let provider_duration = Histogram::with_opts(
            HistogramOpts::new(
                "provider_request_duration_seconds",
                "Latency of provider send calls",
            )
            .buckets(PROVIDER_BUCKETS.to_vec()),
        )
        .map_err(metric_error)?;

        registry
            .register(Box::new(jobs_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(webhooks_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(provider_duration.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            registry,
            jobs_total,
            webhooks_total,
            provider_duration,
        })
    }

    pub fn job(&self, outcome: JobOutcome) {
        self.jobs_total.with_label_values(&[outcome.label()]).inc();
    }

    pub fn webhook(&self, outcome: WebhookOutcome) {
        self.webhooks_total.with_label_values(&[outcome.label()]).inc();
    }

    pub fn observe_provider_call(&self, elapsed: Duration) {
        self.provider_duration.observe(elapsed.as_secs_f64());
    }

    pub fn job_count(&self, outcome: JobOutcome) -> u64 {
        self.jobs_total.with_label_values(&[outcome.label()]).get()
    }

    pub fn webhook_count(&self, outcome: WebhookOutcome) -> u64 {
        self.webhooks_total.with_label_values(&[outcome.label()]).get()
    }

    /// Text exposition of every metric
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metric_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

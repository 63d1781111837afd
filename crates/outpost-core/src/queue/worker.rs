//! Delivery Worker - Claims ready jobs and hands them to the provider

use super::backoff::BackoffPolicy;
use super::send_window;
use crate::deliverability::DeliverabilityMonitor;
use crate::metrics::{JobOutcome, PipelineMetrics};
use crate::provider::{EmailProvider, OutboundEmail, ProviderError, SendReceipt};
use crate::suppression::SuppressionRegistry;
use chrono::Utc;
use outpost_common::config::{QueueConfig, RetryConfig, SendWindow};
use outpost_common::types::email_domain;
use outpost_common::Result;
use outpost_storage::models::{CampaignCounter, EmailJob};
use outpost_storage::repository::{CampaignMetricsRepository, DeadLetterRepository, JobRepository};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Header carrying the job id on every provider call
pub const JOB_ID_HEADER: &str = "X-Outpost-Job-Id";

/// Header carrying the caller's idempotency key, or the job id
pub const IDEMPOTENCY_HEADER: &str = "X-Outpost-Idempotency-Key";

/// Collaborators the worker needs for a send
pub struct WorkerDeps {
    pub jobs: Arc<dyn JobRepository>,
    pub dead_letters: Arc<dyn DeadLetterRepository>,
    pub suppression: Arc<SuppressionRegistry>,
    pub monitor: Arc<DeliverabilityMonitor>,
    pub campaign_metrics: Arc<dyn CampaignMetricsRepository>,
    pub provider: Arc<dyn EmailProvider>,
    pub metrics: Arc<PipelineMetrics>,
}

struct Shared {
    deps: WorkerDeps,
    backoff: BackoffPolicy,
    send_window: Option<SendWindow>,
    provider_timeout: Duration,
}

/// Delivery worker
pub struct DeliveryWorker {
    shared: Arc<Shared>,
    /// Maximum concurrent sends
    concurrency_limit: usize,
    /// Jobs fetched per poll
    batch_size: i64,
    poll_interval: Duration,
}

impl DeliveryWorker {
    pub fn new(deps: WorkerDeps, queue: &QueueConfig, retry: &RetryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                deps,
                backoff: BackoffPolicy::new(retry),
                send_window: queue.send_window,
                provider_timeout: queue.provider_timeout(),
            }),
            concurrency_limit: queue.workers.max(1),
            batch_size: queue.batch_size.max(1),
            poll_interval: queue.poll_interval(),
        }
    }

    /// Poll until `shutdown` fires, then wait for in-flight sends
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));
        let mut tasks = JoinSet::new();

        info!(
            concurrency = self.concurrency_limit,
            batch = self.batch_size,
            interval_ms = self.poll_interval.as_millis() as u64,
            "Delivery worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.dispatch(&semaphore, &mut tasks).await {
                        error!(error = %e, "Error dispatching ready jobs");
                    }
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = result {
                        error!(error = %e, "Delivery task error");
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "Delivery worker stopping");
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Delivery task error");
            }
        }
        info!("Delivery worker stopped");
    }

    /// Dispatch one batch and wait for it to finish. Returns the number of
    /// jobs claimed.
    pub async fn run_once(&self) -> Result<usize> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));
        let mut tasks = JoinSet::new();
        let dispatched = self.dispatch(&semaphore, &mut tasks).await?;

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Delivery task error");
            }
        }

        Ok(dispatched)
    }

    async fn dispatch(&self, semaphore: &Arc<Semaphore>, tasks: &mut JoinSet<()>) -> Result<usize> {
        let available = semaphore.available_permits();
        if available == 0 {
            return Ok(0);
        }

        let limit = self.batch_size.min(available as i64);
        let jobs = self.shared.deps.jobs.fetch_ready(Utc::now(), limit).await?;
        if jobs.is_empty() {
            return Ok(0);
        }

        debug!("Dispatching {} ready jobs", jobs.len());

        let mut dispatched = 0;
        for job in jobs {
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };

            if !self.shared.deps.jobs.claim(job.id).await? {
                // Already picked up by another worker
                continue;
            }

            let shared = self.shared.clone();
            tasks.spawn(async move {
                shared.process(job).await;
                drop(permit);
            });
            dispatched += 1;
        }

        Ok(dispatched)
    }
}

impl Shared {
    /// Send one claimed job
    async fn process(&self, job: EmailJob) {
        let attempt = job.attempts + 1;

        match self
            .deps
            .suppression
            .is_suppressed(&job.to_address, job.client_id.as_deref())
            .await
        {
            Ok(true) => {
                self.skip_suppressed(&job).await;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                // No send without a suppression answer; try again later
                warn!(job_id = %job.id, error = %e, "Suppression check failed, deferring job");
                let next_run_at = Utc::now() + to_chrono(self.backoff.base_delay(attempt));
                if let Err(e) = self
                    .deps
                    .jobs
                    .schedule_retry(job.id, job.attempts, next_run_at, &e.to_string())
                    .await
                {
                    error!(job_id = %job.id, error = %e, "Failed to defer job");
                }
                return;
            }
        }

        let domain = email_domain(&job.to_address);
        if let Some(domain) = &domain {
            match self.deps.monitor.apply_send_rate(domain).await {
                Ok(delay) if !delay.is_zero() => {
                    debug!(job_id = %job.id, domain = %domain, delay_ms = delay.as_millis() as u64, "Throttled send");
                }
                Ok(_) => {}
                Err(e) => warn!(domain = %domain, error = %e, "Send-rate lookup failed"),
            }
        }

        let email = outbound_email(&job);
        let started = Instant::now();
        let result = match timeout(self.provider_timeout, self.deps.provider.send(&email)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        };
        self.deps.metrics.observe_provider_call(started.elapsed());

        match result {
            Ok(receipt) => self.handle_sent(&job, domain.as_deref(), receipt).await,
            Err(err) if err.is_retryable() => self.handle_transient(&job, err).await,
            Err(err) => self.handle_permanent(&job, err).await,
        }
    }

    async fn skip_suppressed(&self, job: &EmailJob) {
        match self.deps.jobs.mark_skipped(job.id, "suppressed").await {
            Ok(true) => {
                self.deps.metrics.job(JobOutcome::Suppressed);
                info!(
                    job_id = %job.id,
                    campaign_id = ?job.campaign_id,
                    reason = "suppressed",
                    "Send skipped"
                );
            }
            Ok(false) => warn!(job_id = %job.id, "Job left processing before it could be skipped"),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to mark job skipped"),
        }
    }

    async fn handle_sent(&self, job: &EmailJob, domain: Option<&str>, receipt: SendReceipt) {
        match self
            .deps
            .jobs
            .mark_sent(job.id, receipt.provider_message_id.as_deref())
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %job.id, "Job left processing before the send completed"),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to mark job sent"),
        }

        self.deps.metrics.job(JobOutcome::Sent);
        info!(
            job_id = %job.id,
            attempt = job.attempts + 1,
            provider_message_id = ?receipt.provider_message_id,
            "Email sent"
        );

        if let Some(domain) = domain {
            if let Err(e) = self.deps.monitor.record_send(domain).await {
                warn!(domain = %domain, error = %e, "Failed to record send");
            }
        }

        if let Some(campaign_id) = job.campaign_id.as_deref() {
            if let Err(e) = self
                .deps
                .campaign_metrics
                .increment(campaign_id, CampaignCounter::Sent)
                .await
            {
                warn!(campaign_id = %campaign_id, error = %e, "Failed to update campaign metrics");
            }
        }
    }

    async fn handle_transient(&self, job: &EmailJob, err: ProviderError) {
        let attempts = job.attempts + 1;
        let message = err.to_string();

        if attempts >= job.max_attempts {
            self.dead_letter(job, attempts, &message).await;
            return;
        }

        let delay = self.backoff.delay(attempts);
        let mut next_run_at = Utc::now() + to_chrono(delay);
        if let Some(window) = &self.send_window {
            next_run_at = send_window::next_open(window, next_run_at);
        }

        match self
            .deps
            .jobs
            .schedule_retry(job.id, attempts, next_run_at, &message)
            .await
        {
            Ok(true) => {
                self.deps.metrics.job(JobOutcome::Retried);
                warn!(
                    job_id = %job.id,
                    attempt = attempts,
                    max_attempts = job.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %message,
                    "Transient send failure, retry scheduled"
                );
            }
            Ok(false) => warn!(job_id = %job.id, "Job left processing before retry was scheduled"),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to schedule retry"),
        }
    }

    async fn dead_letter(&self, job: &EmailJob, attempts: i32, message: &str) {
        match self.deps.jobs.mark_dead_letter(job.id, attempts, message).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job.id, "Job left processing before it could be dead-lettered");
                return;
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to dead-letter job");
                return;
            }
        }

        self.deps.metrics.job(JobOutcome::DeadLettered);
        error!(
            job_id = %job.id,
            attempt = attempts,
            error = %message,
            "Retry budget exhausted, job dead-lettered"
        );

        let snapshot = match self.deps.jobs.get(job.id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => job.clone(),
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to load job for dead-letter store");
                return;
            }
        };
        if let Err(e) = self.deps.dead_letters.insert(&snapshot, message).await {
            error!(job_id = %job.id, error = %e, "Failed to store dead letter");
        }
    }

    async fn handle_permanent(&self, job: &EmailJob, err: ProviderError) {
        let message = err.to_string();
        match self.deps.jobs.mark_failed(job.id, &message).await {
            Ok(true) => {
                self.deps.metrics.job(JobOutcome::Failed);
                error!(
                    job_id = %job.id,
                    attempt = job.attempts + 1,
                    error = %message,
                    "Permanent send failure"
                );
            }
            Ok(false) => warn!(job_id = %job.id, "Job left processing before it could be failed"),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to mark job failed"),
        }
    }
}

/// Provider message for a job, with correlation headers and variables
pub fn outbound_email(job: &EmailJob) -> OutboundEmail {
    let mut headers: BTreeMap<String, String> = job
        .headers
        .as_object()
        .map(|object| {
            object
                .iter()
                .map(|(name, value)| {
                    let value = match value.as_str() {
                        Some(s) => s.to_string(),
                        None => value.to_string(),
                    };
                    (name.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default();

    let job_id = job.id.to_string();
    headers.insert(JOB_ID_HEADER.to_string(), job_id.clone());
    headers.insert(
        IDEMPOTENCY_HEADER.to_string(),
        job.idempotency_key.clone().unwrap_or_else(|| job_id.clone()),
    );

    let mut variables = BTreeMap::new();
    if let Some(campaign_id) = &job.campaign_id {
        variables.insert("campaignId".to_string(), campaign_id.clone());
    }
    if let Some(lead_id) = &job.lead_id {
        variables.insert("leadId".to_string(), lead_id.clone());
    }
    if let Some(client_id) = &job.client_id {
        variables.insert("clientId".to_string(), client_id.clone());
    }
    variables.insert("jobId".to_string(), job_id);

    OutboundEmail {
        to: job.to_address.clone(),
        from: job.from_address.clone(),
        subject: job.subject.clone(),
        body: job.body.clone(),
        headers,
        variables,
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}

//! Queue Manager - Accepts jobs and administers their lifecycle

use super::send_window;
use crate::metrics::{JobOutcome, PipelineMetrics};
use crate::suppression::SuppressionRegistry;
use crate::template::{select_template_version, Template};
use chrono::{DateTime, Duration, Utc};
use outpost_common::config::{QueueConfig, RetryConfig};
use outpost_common::types::{is_valid_email, CampaignId, ClientId, DeadLetterId, JobId, LeadId};
use outpost_common::{Error, Result};
use outpost_storage::models::{CreateEmailJob, DeadLetter, EmailJob, QueueStats};
use outpost_storage::repository::{DeadLetterRepository, JobRepository};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const STALE_CLAIM_ERROR: &str = "processing lease expired";

/// Header naming the template variant a job was rendered from
pub const TEMPLATE_VERSION_HEADER: &str = "X-Outpost-Template-Version";

/// Send request accepted by [`QueueManager::enqueue`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub to: String,
    pub from: String,
    pub subject: String,
    /// HTML or plain text
    pub body: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub campaign_id: Option<CampaignId>,
    pub lead_id: Option<LeadId>,
    pub client_id: Option<ClientId>,
    #[serde(default)]
    pub priority: i32,
    /// Defaults to `retry.max_attempts`
    pub max_attempts: Option<i32>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
}

impl EnqueueRequest {
    /// Fill subject and body from the variant of `template` assigned to this
    /// request's lead (the recipient when no lead is set).
    ///
    /// The chosen version is recorded in the `X-Outpost-Template-Version`
    /// header as `name/version` and its key is returned.
    pub fn apply_template(&mut self, template: &Template) -> std::result::Result<String, EnqueueError> {
        let lead = self.lead_id.as_deref().unwrap_or(&self.to);
        let selected = select_template_version(template, lead).ok_or_else(|| {
            EnqueueError::Validation(format!("Template {} has no versions", template.name))
        })?;

        self.subject = selected.version.subject.clone();
        self.body = selected.version.body.clone();
        self.headers.insert(
            TEMPLATE_VERSION_HEADER.to_string(),
            format!("{}/{}", template.name, selected.key),
        );

        Ok(selected.key.to_string())
    }
}

/// Enqueue rejections
#[derive(Error, Debug)]
pub enum EnqueueError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Recipient is suppressed: {0}")]
    Suppressed(String),

    #[error(transparent)]
    Storage(#[from] Error),
}

impl From<EnqueueError> for Error {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::Validation(msg) => Error::Validation(msg),
            EnqueueError::Suppressed(email) => Error::Suppressed(email),
            EnqueueError::Storage(e) => e,
        }
    }
}

/// Queue Manager
pub struct QueueManager {
    jobs: Arc<dyn JobRepository>,
    dead_letters: Arc<dyn DeadLetterRepository>,
    suppression: Arc<SuppressionRegistry>,
    metrics: Arc<PipelineMetrics>,
    queue: QueueConfig,
    retry: RetryConfig,
}

impl QueueManager {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        dead_letters: Arc<dyn DeadLetterRepository>,
        suppression: Arc<SuppressionRegistry>,
        metrics: Arc<PipelineMetrics>,
        queue: QueueConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            jobs,
            dead_letters,
            suppression,
            metrics,
            queue,
            retry,
        }
    }

    /// Validate, check suppression and persist a job.
    ///
    /// A request whose idempotency key is already known returns the existing
    /// job id without creating a second record.
    pub async fn enqueue(&self, request: EnqueueRequest) -> std::result::Result<JobId, EnqueueError> {
        let to = request.to.trim().to_string();
        if !is_valid_email(&to) {
            return Err(EnqueueError::Validation(format!(
                "Invalid recipient address: {}",
                request.to
            )));
        }
        if !is_valid_email(&request.from) {
            return Err(EnqueueError::Validation(format!(
                "Invalid sender address: {}",
                request.from
            )));
        }
        let max_attempts = request.max_attempts.unwrap_or(self.retry.max_attempts);
        if max_attempts < 1 {
            return Err(EnqueueError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        // A known key answers with its job even if the recipient was
        // suppressed after the first submission
        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(existing) = self.jobs.find_by_idempotency_key(key).await? {
                debug!(
                    job_id = %existing.id,
                    idempotency_key = %key,
                    "Idempotency key matched existing job"
                );
                return Ok(existing.id);
            }
        }

        if self
            .suppression
            .is_suppressed(&to, request.client_id.as_deref())
            .await?
        {
            self.metrics.job(JobOutcome::Suppressed);
            info!(
                to = %to,
                campaign_id = ?request.campaign_id,
                reason = "suppressed",
                "Enqueue skipped"
            );
            return Err(EnqueueError::Suppressed(to));
        }

        let mut scheduled_for = request.scheduled_for.unwrap_or_else(Utc::now);
        if let Some(window) = &self.queue.send_window {
            scheduled_for = send_window::next_open(window, scheduled_for);
        }

        let headers = serde_json::to_value(&request.headers)
            .map_err(|e| Error::Internal(format!("Failed to encode headers: {}", e)))?;

        let inserted = self
            .jobs
            .insert(CreateEmailJob {
                to_address: to,
                from_address: request.from.trim().to_string(),
                subject: request.subject,
                body: request.body,
                headers: Some(headers),
                campaign_id: request.campaign_id,
                lead_id: request.lead_id,
                client_id: request.client_id,
                priority: request.priority,
                max_attempts,
                scheduled_for,
                idempotency_key: request.idempotency_key,
            })
            .await?;

        let job = inserted.job;
        if inserted.created {
            self.metrics.job(JobOutcome::Enqueued);
            info!(
                job_id = %job.id,
                campaign_id = ?job.campaign_id,
                scheduled_for = %job.scheduled_for,
                "Job enqueued"
            );
        } else {
            debug!(
                job_id = %job.id,
                idempotency_key = ?job.idempotency_key,
                "Idempotency key matched existing job"
            );
        }

        Ok(job.id)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<EmailJob>> {
        self.jobs.get(id).await
    }

    /// Cancel a pending job. In-flight and finished jobs are left alone.
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        let job = self
            .jobs
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Job {}", id)))?;

        if self.jobs.cancel(id).await? {
            info!(job_id = %id, "Job cancelled");
            return Ok(());
        }

        // Re-read: the job may have been claimed since the first lookup
        let status = self
            .jobs
            .get(id)
            .await?
            .map(|job| job.status)
            .unwrap_or(job.status);
        Err(Error::InvalidState(format!(
            "Job {} cannot be cancelled while {}",
            id, status
        )))
    }

    /// Cancel every pending job of a campaign
    pub async fn cancel_by_campaign(&self, campaign_id: &str) -> Result<u64> {
        let count = self.jobs.cancel_by_campaign(campaign_id).await?;
        if count > 0 {
            info!(campaign_id = %campaign_id, count, "Cancelled pending campaign jobs");
        }
        Ok(count)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.jobs.stats().await
    }

    pub async fn list_dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        self.dead_letters.list(limit).await
    }

    /// Queue a fresh copy of a dead-lettered job. Each entry replays once.
    pub async fn replay_dead_letter(&self, id: DeadLetterId) -> Result<JobId> {
        let entry = self
            .dead_letters
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Dead letter {}", id)))?;

        if entry.is_replayed() {
            return Err(Error::InvalidState(format!(
                "Dead letter {} was already replayed",
                id
            )));
        }

        let original = entry
            .job()
            .map_err(|e| Error::Internal(format!("Corrupt dead-letter payload: {}", e)))?;

        let replay = self
            .jobs
            .insert(CreateEmailJob::replay_of(&original, Utc::now()))
            .await?
            .job;

        if !self.dead_letters.mark_replayed(id, replay.id).await? {
            // Lost a race with a concurrent replay
            self.jobs.cancel(replay.id).await?;
            return Err(Error::InvalidState(format!(
                "Dead letter {} was already replayed",
                id
            )));
        }

        info!(
            dead_letter_id = %id,
            original_job_id = %original.id,
            job_id = %replay.id,
            "Dead letter replayed"
        );
        self.metrics.job(JobOutcome::Enqueued);

        Ok(replay.id)
    }

    /// Recover jobs whose claim outlived the processing lease.
    ///
    /// The abandoned attempt counts against the retry budget, so a job that
    /// keeps killing its worker ends in the dead-letter store. Returns the
    /// number of recovered jobs.
    pub async fn release_stale(&self) -> Result<u64> {
        let claimed_before = Utc::now() - Duration::seconds(self.queue.processing_lease_secs);
        let release = self
            .jobs
            .release_stale(claimed_before, STALE_CLAIM_ERROR)
            .await?;

        if release.requeued > 0 {
            warn!(count = release.requeued, "Released stale job claims");
        }
        for job in &release.dead_lettered {
            self.metrics.job(JobOutcome::DeadLettered);
            error!(
                job_id = %job.id,
                attempt = job.attempts,
                "Stale claim used the last attempt, job dead-lettered"
            );
            self.dead_letters.insert(job, STALE_CLAIM_ERROR).await?;
        }

        Ok(release.requeued + release.dead_lettered.len() as u64)
    }
}

//! In-memory repositories
//!
//! Process-local implementations of the repository traits. They back the test
//! suites and single-process deployments that run without PostgreSQL, and
//! follow the same conditional-transition rules as the database versions.

use crate::models::{
    CampaignCounter, CampaignMetrics, CreateEmailJob, DeadLetter, DeliveryEventRecord, EmailJob,
    JobInsert, JobStatus, NewDeliveryEvent, NewSuppression, QueueStats, StaleRelease,
    SuppressionEntry, SuppressionWrite,
};
use crate::repository::{
    CampaignMetricsRepository, DeadLetterRepository, DeliveryEventRepository, JobRepository,
    SuppressionRepository,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outpost_common::types::{DeadLetterId, JobId};
use outpost_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct JobTable {
    jobs: HashMap<JobId, EmailJob>,
    by_key: HashMap<String, JobId>,
}

/// In-memory email job repository
#[derive(Clone, Default)]
pub struct InMemoryJobRepository {
    data: Arc<RwLock<JobTable>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply `update` if the job is currently in `from`
    async fn transition<F>(&self, id: JobId, from: JobStatus, update: F) -> Result<bool>
    where
        F: FnOnce(&mut EmailJob) + Send,
    {
        let mut table = self.data.write().await;
        match table.jobs.get_mut(&id) {
            Some(job) if job.status_enum() == Some(from) => {
                update(job);
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn insert(&self, input: CreateEmailJob) -> Result<JobInsert> {
        let mut table = self.data.write().await;

        if let Some(key) = &input.idempotency_key {
            if let Some(existing) = table.by_key.get(key).and_then(|id| table.jobs.get(id)) {
                return Ok(JobInsert {
                    job: existing.clone(),
                    created: false,
                });
            }
        }

        let job = EmailJob::from_create(Uuid::now_v7(), input, Utc::now());
        if let Some(key) = &job.idempotency_key {
            table.by_key.insert(key.clone(), job.id);
        }
        table.jobs.insert(job.id, job.clone());

        Ok(JobInsert { job, created: true })
    }

    async fn get(&self, id: JobId) -> Result<Option<EmailJob>> {
        Ok(self.data.read().await.jobs.get(&id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<EmailJob>> {
        let table = self.data.read().await;
        Ok(table.by_key.get(key).and_then(|id| table.jobs.get(id)).cloned())
    }

    async fn find_by_provider_message_id(&self, message_id: &str) -> Result<Option<EmailJob>> {
        let table = self.data.read().await;
        Ok(table
            .jobs
            .values()
            .find(|job| job.provider_message_id.as_deref() == Some(message_id))
            .cloned())
    }

    async fn fetch_ready(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<EmailJob>> {
        let table = self.data.read().await;
        let mut ready: Vec<EmailJob> = table
            .jobs
            .values()
            .filter(|job| job.is_ready(now))
            .cloned()
            .collect();

        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.next_run_at.cmp(&b.next_run_at))
        });
        ready.truncate(usize::try_from(limit).unwrap_or(0));

        Ok(ready)
    }

    async fn claim(&self, id: JobId) -> Result<bool> {
        self.transition(id, JobStatus::Pending, |job| {
            job.status = JobStatus::Processing.to_string();
            job.claimed_at = Some(Utc::now());
        })
        .await
    }

    async fn mark_sent(&self, id: JobId, provider_message_id: Option<&str>) -> Result<bool> {
        let message_id = provider_message_id.map(str::to_string);
        self.transition(id, JobStatus::Processing, move |job| {
            job.status = JobStatus::Sent.to_string();
            job.provider_message_id = message_id;
            job.error_message = None;
            job.sent_at = Some(Utc::now());
        })
        .await
    }

    async fn schedule_retry(
        &self,
        id: JobId,
        attempts: i32,
        next_run_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool> {
        let mut table = self.data.write().await;
        match table.jobs.get_mut(&id) {
            Some(job)
                if job.status_enum() == Some(JobStatus::Processing)
                    && attempts < job.max_attempts =>
            {
                job.status = JobStatus::Pending.to_string();
                job.attempts = attempts;
                job.next_run_at = next_run_at;
                job.error_message = Some(error.to_string());
                job.claimed_at = None;
                job.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(&self, id: JobId, error: &str) -> Result<bool> {
        let error = error.to_string();
        self.transition(id, JobStatus::Processing, move |job| {
            job.status = JobStatus::Failed.to_string();
            job.error_message = Some(error);
        })
        .await
    }

    async fn mark_dead_letter(&self, id: JobId, attempts: i32, error: &str) -> Result<bool> {
        let error = error.to_string();
        self.transition(id, JobStatus::Processing, move |job| {
            job.status = JobStatus::DeadLetter.to_string();
            job.attempts = attempts.min(job.max_attempts);
            job.error_message = Some(error);
        })
        .await
    }

    async fn mark_skipped(&self, id: JobId, reason: &str) -> Result<bool> {
        let reason = reason.to_string();
        self.transition(id, JobStatus::Processing, move |job| {
            job.status = JobStatus::Cancelled.to_string();
            job.error_message = Some(reason);
        })
        .await
    }

    async fn cancel(&self, id: JobId) -> Result<bool> {
        self.transition(id, JobStatus::Pending, |job| {
            job.status = JobStatus::Cancelled.to_string();
            job.error_message = Some("cancelled".to_string());
        })
        .await
    }

    async fn cancel_by_campaign(&self, campaign_id: &str) -> Result<u64> {
        let mut table = self.data.write().await;
        let now = Utc::now();
        let mut count = 0;
        for job in table.jobs.values_mut() {
            if job.campaign_id.as_deref() == Some(campaign_id)
                && job.status_enum() == Some(JobStatus::Pending)
            {
                job.status = JobStatus::Cancelled.to_string();
                job.error_message = Some("campaign cancelled".to_string());
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn release_stale(
        &self,
        claimed_before: DateTime<Utc>,
        error: &str,
    ) -> Result<StaleRelease> {
        let mut table = self.data.write().await;
        let now = Utc::now();
        let mut release = StaleRelease::default();
        for job in table.jobs.values_mut() {
            let stale = job.status_enum() == Some(JobStatus::Processing)
                && job.claimed_at.map_or(false, |claimed| claimed < claimed_before);
            if !stale {
                continue;
            }
            job.attempts = (job.attempts + 1).min(job.max_attempts);
            job.error_message = Some(error.to_string());
            job.claimed_at = None;
            job.updated_at = now;
            if job.attempts >= job.max_attempts {
                job.status = JobStatus::DeadLetter.to_string();
                release.dead_lettered.push(job.clone());
            } else {
                job.status = JobStatus::Pending.to_string();
                release.requeued += 1;
            }
        }
        Ok(release)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let table = self.data.read().await;
        let mut stats = QueueStats::default();
        for job in table.jobs.values() {
            if let Some(status) = job.status_enum() {
                stats.add(status, 1);
            }
        }
        Ok(stats)
    }
}

/// In-memory dead-letter repository
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterRepository {
    data: Arc<RwLock<HashMap<DeadLetterId, DeadLetter>>>,
}

impl InMemoryDeadLetterRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterRepository for InMemoryDeadLetterRepository {
    async fn insert(&self, job: &EmailJob, error: &str) -> Result<DeadLetter> {
        let payload = serde_json::to_value(job)
            .map_err(|e| Error::Internal(format!("Failed to encode job snapshot: {}", e)))?;
        let entry = DeadLetter {
            id: Uuid::now_v7(),
            job_id: job.id,
            payload,
            error_message: Some(error.to_string()),
            attempts: job.attempts,
            dead_lettered_at: Utc::now(),
            replayed_at: None,
            replay_job_id: None,
        };
        self.data.write().await.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetter>> {
        Ok(self.data.read().await.get(&id).cloned())
    }

    async fn list(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        let mut entries: Vec<DeadLetter> = self.data.read().await.values().cloned().collect();
        entries.sort_by(|a, b| b.dead_lettered_at.cmp(&a.dead_lettered_at));
        entries.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(entries)
    }

    async fn mark_replayed(&self, id: DeadLetterId, replay_job_id: JobId) -> Result<bool> {
        let mut map = self.data.write().await;
        match map.get_mut(&id) {
            Some(entry) if entry.replayed_at.is_none() => {
                entry.replayed_at = Some(Utc::now());
                entry.replay_job_id = Some(replay_job_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

type SuppressionKey = (String, Option<String>);

/// In-memory suppression repository
#[derive(Clone, Default)]
pub struct InMemorySuppressionRepository {
    data: Arc<RwLock<HashMap<SuppressionKey, SuppressionEntry>>>,
}

impl InMemorySuppressionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(email: &str, client_id: Option<&str>) -> SuppressionKey {
        (email.to_string(), client_id.map(str::to_string))
    }

    /// Store an entry as-is, bypassing the upgrade rules
    pub async fn put(&self, entry: SuppressionEntry) {
        let key = Self::key(&entry.email, entry.client_id.as_deref());
        self.data.write().await.insert(key, entry);
    }

    fn applies(entry: &SuppressionEntry, client_id: Option<&str>, now: DateTime<Utc>) -> bool {
        (entry.client_id.is_none() || entry.client_id.as_deref() == client_id)
            && entry.is_active_at(now)
    }
}

#[async_trait]
impl SuppressionRepository for InMemorySuppressionRepository {
    async fn get(&self, email: &str, client_id: Option<&str>) -> Result<Option<SuppressionEntry>> {
        Ok(self
            .data
            .read()
            .await
            .get(&Self::key(email, client_id))
            .cloned())
    }

    async fn find_active(
        &self,
        email: &str,
        client_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<SuppressionEntry>> {
        let map = self.data.read().await;
        let scoped = client_id.and_then(|cid| map.get(&Self::key(email, Some(cid))));
        let global = map.get(&Self::key(email, None));

        Ok([scoped, global]
            .into_iter()
            .flatten()
            .filter(|entry| Self::applies(entry, client_id, now))
            .max_by_key(|entry| entry.strength())
            .cloned())
    }

    async fn upsert_if_stricter(
        &self,
        input: NewSuppression,
        now: DateTime<Utc>,
    ) -> Result<SuppressionWrite> {
        let key = Self::key(&input.email, input.client_id.as_deref());
        let mut map = self.data.write().await;

        if let Some(existing) = map.get(&key) {
            if !existing.may_be_replaced_by(&input, now) {
                return Ok(SuppressionWrite::Kept(existing.clone()));
            }
        }

        let entry = SuppressionEntry::from_new(Uuid::now_v7(), input, now);
        map.insert(key, entry.clone());
        Ok(SuppressionWrite::Written(entry))
    }

    async fn delete(&self, email: &str, client_id: Option<&str>) -> Result<bool> {
        Ok(self
            .data
            .write()
            .await
            .remove(&Self::key(email, client_id))
            .is_some())
    }

    async fn list(&self, client_id: Option<&str>, limit: i64) -> Result<Vec<SuppressionEntry>> {
        let map = self.data.read().await;
        let mut entries: Vec<SuppressionEntry> = map
            .values()
            .filter(|entry| match client_id {
                Some(cid) => entry.client_id.is_none() || entry.client_id.as_deref() == Some(cid),
                None => true,
            })
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        entries.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(entries)
    }

    async fn filter_active(
        &self,
        emails: &[String],
        client_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let map = self.data.read().await;
        let mut matched: Vec<String> = emails
            .iter()
            .filter(|email| {
                map.values().any(|entry| {
                    entry.email == email.as_str() && Self::applies(entry, client_id, now)
                })
            })
            .cloned()
            .collect();
        matched.dedup();
        Ok(matched)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut map = self.data.write().await;
        let before = map.len();
        map.retain(|_, entry| entry.is_active_at(now));
        Ok((before - map.len()) as u64)
    }
}

/// In-memory delivery event repository
#[derive(Clone, Default)]
pub struct InMemoryDeliveryEventRepository {
    data: Arc<RwLock<Vec<DeliveryEventRecord>>>,
}

impl InMemoryDeliveryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait]
impl DeliveryEventRepository for InMemoryDeliveryEventRepository {
    async fn insert(&self, input: NewDeliveryEvent) -> Result<DeliveryEventRecord> {
        let record = DeliveryEventRecord {
            id: Uuid::now_v7(),
            event_type: input.event_type.to_string(),
            recipient: input.recipient,
            message_id: input.message_id,
            campaign_id: input.campaign_id,
            lead_id: input.lead_id,
            client_id: input.client_id,
            severity: input.severity,
            description: input.description,
            occurred_at: input.occurred_at,
            received_at: Utc::now(),
        };
        self.data.write().await.push(record.clone());
        Ok(record)
    }

    async fn list_by_message(&self, message_id: &str) -> Result<Vec<DeliveryEventRecord>> {
        let mut records: Vec<DeliveryEventRecord> = self
            .data
            .read()
            .await
            .iter()
            .filter(|r| r.message_id.as_deref() == Some(message_id))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at));
        Ok(records)
    }

    async fn list_by_campaign(
        &self,
        campaign_id: &str,
        limit: i64,
    ) -> Result<Vec<DeliveryEventRecord>> {
        let mut records: Vec<DeliveryEventRecord> = self
            .data
            .read()
            .await
            .iter()
            .filter(|r| r.campaign_id.as_deref() == Some(campaign_id))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        records.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(records)
    }
}

/// In-memory campaign metrics repository
#[derive(Clone, Default)]
pub struct InMemoryCampaignMetricsRepository {
    data: Arc<RwLock<HashMap<String, CampaignMetrics>>>,
}

impl InMemoryCampaignMetricsRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CampaignMetricsRepository for InMemoryCampaignMetricsRepository {
    async fn increment(&self, campaign_id: &str, counter: CampaignCounter) -> Result<()> {
        let now = Utc::now();
        let mut map = self.data.write().await;
        let metrics = map
            .entry(campaign_id.to_string())
            .or_insert_with(|| CampaignMetrics::new(campaign_id.to_string(), now));
        *metrics.counter_mut(counter) += 1;
        metrics.updated_at = now;
        Ok(())
    }

    async fn get(&self, campaign_id: &str) -> Result<Option<CampaignMetrics>> {
        Ok(self.data.read().await.get(campaign_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BounceType, SuppressionType};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn create_job(key: Option<&str>) -> CreateEmailJob {
        CreateEmailJob {
            to_address: "lead@example.com".to_string(),
            from_address: "sales@sender.io".to_string(),
            subject: "Hello".to_string(),
            body: "<p>Hi</p>".to_string(),
            headers: None,
            campaign_id: Some("camp-1".to_string()),
            lead_id: Some("lead-1".to_string()),
            client_id: None,
            priority: 0,
            max_attempts: 3,
            scheduled_for: Utc::now() - Duration::seconds(1),
            idempotency_key: key.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_idempotent_insert() {
        let repo = InMemoryJobRepository::new();
        let first = repo.insert(create_job(Some("X"))).await.unwrap();
        let second = repo.insert(create_job(Some("X"))).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.job.id, second.job.id);
        assert_eq!(repo.stats().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let repo = InMemoryJobRepository::new();
        let job = repo.insert(create_job(None)).await.unwrap().job;

        assert!(repo.claim(job.id).await.unwrap());
        assert!(!repo.claim(job.id).await.unwrap());
        assert!(repo.fetch_ready(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_states_are_final() {
        let repo = InMemoryJobRepository::new();
        let job = repo.insert(create_job(None)).await.unwrap().job;

        repo.claim(job.id).await.unwrap();
        assert!(repo.mark_sent(job.id, Some("msg-1")).await.unwrap());
        assert!(!repo.mark_failed(job.id, "late").await.unwrap());
        assert!(!repo.cancel(job.id).await.unwrap());

        let stored = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status_enum(), Some(JobStatus::Sent));
        assert_eq!(stored.provider_message_id.as_deref(), Some("msg-1"));
    }

    #[tokio::test]
    async fn test_retry_never_exceeds_budget() {
        let repo = InMemoryJobRepository::new();
        let job = repo.insert(create_job(None)).await.unwrap().job;

        repo.claim(job.id).await.unwrap();
        assert!(!repo
            .schedule_retry(job.id, 3, Utc::now(), "boom")
            .await
            .unwrap());
        assert!(repo
            .schedule_retry(job.id, 2, Utc::now(), "boom")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_fetch_ready_orders_by_priority() {
        let repo = InMemoryJobRepository::new();
        let low = repo.insert(create_job(None)).await.unwrap().job;
        let mut urgent = create_job(None);
        urgent.priority = 10;
        let high = repo.insert(urgent).await.unwrap().job;
        let mut later = create_job(None);
        later.scheduled_for = Utc::now() + Duration::hours(1);
        repo.insert(later).await.unwrap();

        let ready = repo.fetch_ready(Utc::now(), 10).await.unwrap();
        let ids: Vec<JobId> = ready.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![high.id, low.id]);
    }

    #[tokio::test]
    async fn test_release_stale_claims() {
        let repo = InMemoryJobRepository::new();
        let job = repo.insert(create_job(None)).await.unwrap().job;
        repo.claim(job.id).await.unwrap();

        let release = repo
            .release_stale(Utc::now() - Duration::hours(1), "lease expired")
            .await
            .unwrap();
        assert_eq!(release.requeued, 0);

        let release = repo
            .release_stale(Utc::now() + Duration::seconds(1), "lease expired")
            .await
            .unwrap();
        assert_eq!(release.requeued, 1);
        assert!(release.dead_lettered.is_empty());

        let stored = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status_enum(), Some(JobStatus::Pending));
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.error_message.as_deref(), Some("lease expired"));
    }

    #[tokio::test]
    async fn test_release_stale_exhausts_budget() {
        let repo = InMemoryJobRepository::new();
        let job = repo.insert(create_job(None)).await.unwrap().job;

        for _ in 0..2 {
            repo.claim(job.id).await.unwrap();
            let release = repo
                .release_stale(Utc::now() + Duration::seconds(1), "lease expired")
                .await
                .unwrap();
            assert_eq!(release.requeued, 1);
        }

        repo.claim(job.id).await.unwrap();
        let release = repo
            .release_stale(Utc::now() + Duration::seconds(1), "lease expired")
            .await
            .unwrap();
        assert_eq!(release.requeued, 0);
        assert_eq!(release.dead_lettered.len(), 1);
        assert_eq!(release.dead_lettered[0].attempts, 3);

        let stored = repo.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status_enum(), Some(JobStatus::DeadLetter));
        assert!(repo.fetch_ready(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_by_idempotency_key() {
        let repo = InMemoryJobRepository::new();
        let job = repo.insert(create_job(Some("X"))).await.unwrap().job;

        let found = repo.find_by_idempotency_key("X").await.unwrap().unwrap();
        assert_eq!(found.id, job.id);
        assert!(repo.find_by_idempotency_key("Y").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dead_letter_replay_once() {
        let jobs = InMemoryJobRepository::new();
        let job = jobs.insert(create_job(None)).await.unwrap().job;
        let dlq = InMemoryDeadLetterRepository::new();

        let entry = dlq.insert(&job, "exhausted").await.unwrap();
        assert_eq!(entry.job().unwrap().id, job.id);
        assert!(dlq.mark_replayed(entry.id, Uuid::now_v7()).await.unwrap());
        assert!(!dlq.mark_replayed(entry.id, Uuid::now_v7()).await.unwrap());
    }

    #[tokio::test]
    async fn test_suppression_scopes() {
        let repo = InMemorySuppressionRepository::new();
        let now = Utc::now();
        repo.upsert_if_stricter(
            NewSuppression {
                email: "a@example.com".into(),
                suppression_type: SuppressionType::Bounce,
                bounce_type: Some(BounceType::Hard),
                reason: None,
                client_id: Some("client-a".into()),
                expires_at: None,
            },
            now,
        )
        .await
        .unwrap();

        assert!(repo
            .find_active("a@example.com", Some("client-a"), now)
            .await
            .unwrap()
            .is_some());
        assert!(repo
            .find_active("a@example.com", Some("client-b"), now)
            .await
            .unwrap()
            .is_none());
        assert!(repo
            .find_active("a@example.com", None, now)
            .await
            .unwrap()
            .is_none());

        let filtered = repo
            .filter_active(
                &["a@example.com".to_string(), "b@example.com".to_string()],
                Some("client-a"),
                now,
            )
            .await
            .unwrap();
        assert_eq!(filtered, vec!["a@example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_campaign_metrics_increment() {
        let repo = InMemoryCampaignMetricsRepository::new();
        repo.increment("c1", CampaignCounter::Sent).await.unwrap();
        repo.increment("c1", CampaignCounter::Sent).await.unwrap();
        repo.increment("c1", CampaignCounter::Opened).await.unwrap();

        let metrics = repo.get("c1").await.unwrap().unwrap();
        assert_eq!(metrics.sent, 2);
        assert_eq!(metrics.opened, 1);
        assert!(repo.get("c2").await.unwrap().is_none());
    }
}

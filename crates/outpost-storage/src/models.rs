//! Database models

use chrono::{DateTime, Duration, Utc};
use outpost_common::types::{CampaignId, ClientId, JobId, LeadId};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::cmp::Ordering;
use uuid::Uuid;

/// Email job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    DeadLetter,
    Cancelled,
}

impl JobStatus {
    /// Terminal states are never left once entered
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Sent | JobStatus::Failed | JobStatus::DeadLetter | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Sent => write!(f, "sent"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::DeadLetter => write!(f, "dead_letter"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "sent" => Ok(JobStatus::Sent),
            "failed" => Ok(JobStatus::Failed),
            "dead_letter" => Ok(JobStatus::DeadLetter),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Queued email job
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EmailJob {
    pub id: JobId,
    pub to_address: String,
    pub from_address: String,
    pub subject: String,
    pub body: String,
    pub headers: serde_json::Value,
    pub campaign_id: Option<CampaignId>,
    pub lead_id: Option<LeadId>,
    pub client_id: Option<ClientId>,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub status: String,
    pub scheduled_for: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
    pub idempotency_key: Option<String>,
    pub error_message: Option<String>,
    pub provider_message_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailJob {
    /// Get status enum
    pub fn status_enum(&self) -> Option<JobStatus> {
        self.status.parse().ok()
    }

    /// Whether the job may be picked up at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status_enum() == Some(JobStatus::Pending)
            && self.scheduled_for <= now
            && self.next_run_at <= now
    }

    /// Build a job record from creation input
    pub fn from_create(id: JobId, input: CreateEmailJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            to_address: input.to_address,
            from_address: input.from_address,
            subject: input.subject,
            body: input.body,
            headers: input.headers.unwrap_or_else(|| serde_json::json!({})),
            campaign_id: input.campaign_id,
            lead_id: input.lead_id,
            client_id: input.client_id,
            priority: input.priority,
            attempts: 0,
            max_attempts: input.max_attempts,
            status: JobStatus::Pending.to_string(),
            scheduled_for: input.scheduled_for,
            next_run_at: input.scheduled_for,
            idempotency_key: input.idempotency_key,
            error_message: None,
            provider_message_id: None,
            claimed_at: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Create email job input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEmailJob {
    pub to_address: String,
    pub from_address: String,
    pub subject: String,
    pub body: String,
    pub headers: Option<serde_json::Value>,
    pub campaign_id: Option<CampaignId>,
    pub lead_id: Option<LeadId>,
    pub client_id: Option<ClientId>,
    pub priority: i32,
    pub max_attempts: i32,
    pub scheduled_for: DateTime<Utc>,
    pub idempotency_key: Option<String>,
}

impl CreateEmailJob {
    /// Copy of a previously queued job, used when replaying a dead letter
    pub fn replay_of(job: &EmailJob, now: DateTime<Utc>) -> Self {
        Self {
            to_address: job.to_address.clone(),
            from_address: job.from_address.clone(),
            subject: job.subject.clone(),
            body: job.body.clone(),
            headers: Some(job.headers.clone()),
            campaign_id: job.campaign_id.clone(),
            lead_id: job.lead_id.clone(),
            client_id: job.client_id.clone(),
            priority: job.priority,
            max_attempts: job.max_attempts,
            scheduled_for: now,
            idempotency_key: None,
        }
    }
}

/// Result of an idempotent job insert
#[derive(Debug, Clone)]
pub struct JobInsert {
    pub job: EmailJob,
    /// False when an existing job with the same idempotency key was returned
    pub created: bool,
}

/// Jobs recovered from abandoned claims
#[derive(Debug, Clone, Default)]
pub struct StaleRelease {
    /// Returned to `pending` with the lost attempt counted
    pub requeued: u64,
    /// Claims that used up the last attempt, now `dead_letter`
    pub dead_lettered: Vec<EmailJob>,
}

/// Job counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
    pub dead_letter: i64,
    pub cancelled: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.sent + self.failed + self.dead_letter + self.cancelled
    }

    pub(crate) fn add(&mut self, status: JobStatus, count: i64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Sent => self.sent += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::DeadLetter => self.dead_letter += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }
}

/// Dead-lettered job retained for inspection or replay
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub job_id: JobId,
    /// Snapshot of the job at the time it was dead-lettered
    pub payload: serde_json::Value,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub dead_lettered_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
    pub replay_job_id: Option<JobId>,
}

impl DeadLetter {
    pub fn is_replayed(&self) -> bool {
        self.replayed_at.is_some()
    }

    /// Decode the job snapshot
    pub fn job(&self) -> Result<EmailJob, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Why an address is suppressed.
///
/// Variants are declared from weakest to strictest; [`SuppressionType::rank`]
/// is the single source of the ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionType {
    Unsubscribe,
    Bounce,
    Complaint,
    Manual,
}

impl SuppressionType {
    pub fn rank(self) -> u8 {
        match self {
            SuppressionType::Unsubscribe => 1,
            SuppressionType::Bounce => 2,
            SuppressionType::Complaint => 3,
            SuppressionType::Manual => 4,
        }
    }
}

impl PartialOrd for SuppressionType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SuppressionType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl std::fmt::Display for SuppressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuppressionType::Unsubscribe => write!(f, "unsubscribe"),
            SuppressionType::Bounce => write!(f, "bounce"),
            SuppressionType::Complaint => write!(f, "complaint"),
            SuppressionType::Manual => write!(f, "manual"),
        }
    }
}

impl std::str::FromStr for SuppressionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsubscribe" => Ok(SuppressionType::Unsubscribe),
            "bounce" => Ok(SuppressionType::Bounce),
            "complaint" => Ok(SuppressionType::Complaint),
            "manual" => Ok(SuppressionType::Manual),
            _ => Err(format!("Invalid suppression type: {}", s)),
        }
    }
}

/// Bounce classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BounceType {
    Hard,
    Soft,
}

impl std::fmt::Display for BounceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BounceType::Hard => write!(f, "hard"),
            BounceType::Soft => write!(f, "soft"),
        }
    }
}

impl std::str::FromStr for BounceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hard" => Ok(BounceType::Hard),
            "soft" => Ok(BounceType::Soft),
            _ => Err(format!("Invalid bounce type: {}", s)),
        }
    }
}

/// Suppression list entry
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub id: Uuid,
    pub email: String,
    pub suppression_type: String,
    pub bounce_type: Option<String>,
    /// Stored copy of `SuppressionType::rank`, used for conditional upserts
    pub severity: i16,
    pub reason: Option<String>,
    pub client_id: Option<ClientId>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SuppressionEntry {
    pub fn type_enum(&self) -> Option<SuppressionType> {
        self.suppression_type.parse().ok()
    }

    pub fn bounce_type_enum(&self) -> Option<BounceType> {
        self.bounce_type.as_deref().and_then(|b| b.parse().ok())
    }

    pub fn is_permanent(&self) -> bool {
        self.expires_at.is_none()
    }

    /// Active entries block sends
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires| expires > now)
    }

    /// Upgrade order of this entry, see [`SuppressionStrength`]
    pub fn strength(&self) -> SuppressionStrength {
        SuppressionStrength {
            permanent: self.is_permanent(),
            severity: self.severity,
        }
    }

    /// Whether `candidate` may overwrite this entry.
    ///
    /// Expired entries are always replaceable. Otherwise the candidate must be
    /// strictly stronger: a permanent entry outranks any expiring one, so a
    /// hard bounce or an unsubscribe replaces an active soft bounce.
    pub fn may_be_replaced_by(&self, candidate: &NewSuppression, now: DateTime<Utc>) -> bool {
        !self.is_active_at(now) || candidate.strength() > self.strength()
    }

    pub fn from_new(id: Uuid, input: NewSuppression, now: DateTime<Utc>) -> Self {
        Self {
            id,
            email: input.email,
            suppression_type: input.suppression_type.to_string(),
            bounce_type: input.bounce_type.map(|b| b.to_string()),
            severity: i16::from(input.suppression_type.rank()),
            reason: input.reason,
            client_id: input.client_id,
            expires_at: input.expires_at,
            created_at: now,
            updated_at: now,
        }
    }
}

/// New suppression entry; `email` is expected to be normalized already
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSuppression {
    pub email: String,
    pub suppression_type: SuppressionType,
    pub bounce_type: Option<BounceType>,
    pub reason: Option<String>,
    pub client_id: Option<ClientId>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewSuppression {
    pub fn strength(&self) -> SuppressionStrength {
        SuppressionStrength {
            permanent: self.expires_at.is_none(),
            severity: i16::from(self.suppression_type.rank()),
        }
    }
}

/// Total order used for suppression upgrades.
///
/// Permanence is compared first, then the type rank. The suppressions
/// upsert evaluates the same order as `(expires_at IS NULL, severity)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SuppressionStrength {
    pub permanent: bool,
    pub severity: i16,
}

/// Outcome of a conditional suppression upsert
#[derive(Debug, Clone)]
pub enum SuppressionWrite {
    /// The entry was inserted or replaced a weaker one
    Written(SuppressionEntry),
    /// A stronger (or equally strong) active entry was kept
    Kept(SuppressionEntry),
}

/// Provider delivery event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryEventKind {
    Delivered,
    Opened,
    Clicked,
    Failed,
    Bounced,
    Complained,
    Unsubscribed,
}

impl std::fmt::Display for DeliveryEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryEventKind::Delivered => write!(f, "delivered"),
            DeliveryEventKind::Opened => write!(f, "opened"),
            DeliveryEventKind::Clicked => write!(f, "clicked"),
            DeliveryEventKind::Failed => write!(f, "failed"),
            DeliveryEventKind::Bounced => write!(f, "bounced"),
            DeliveryEventKind::Complained => write!(f, "complained"),
            DeliveryEventKind::Unsubscribed => write!(f, "unsubscribed"),
        }
    }
}

impl std::str::FromStr for DeliveryEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivered" => Ok(DeliveryEventKind::Delivered),
            "opened" => Ok(DeliveryEventKind::Opened),
            "clicked" => Ok(DeliveryEventKind::Clicked),
            "failed" => Ok(DeliveryEventKind::Failed),
            "bounced" => Ok(DeliveryEventKind::Bounced),
            "complained" => Ok(DeliveryEventKind::Complained),
            "unsubscribed" => Ok(DeliveryEventKind::Unsubscribed),
            _ => Err(format!("Invalid delivery event: {}", s)),
        }
    }
}

/// Persisted provider event
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryEventRecord {
    pub id: Uuid,
    pub event_type: String,
    pub recipient: String,
    pub message_id: Option<String>,
    pub campaign_id: Option<CampaignId>,
    pub lead_id: Option<LeadId>,
    pub client_id: Option<ClientId>,
    pub severity: Option<String>,
    pub description: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// New delivery event record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDeliveryEvent {
    pub event_type: DeliveryEventKind,
    pub recipient: String,
    pub message_id: Option<String>,
    pub campaign_id: Option<CampaignId>,
    pub lead_id: Option<LeadId>,
    pub client_id: Option<ClientId>,
    pub severity: Option<String>,
    pub description: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Per-campaign delivery counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignCounter {
    Sent,
    Delivered,
    Bounced,
    Opened,
    Clicked,
    Unsubscribed,
    Complained,
}

impl CampaignCounter {
    /// Column holding this counter
    pub fn column(self) -> &'static str {
        match self {
            CampaignCounter::Sent => "sent",
            CampaignCounter::Delivered => "delivered",
            CampaignCounter::Bounced => "bounced",
            CampaignCounter::Opened => "opened",
            CampaignCounter::Clicked => "clicked",
            CampaignCounter::Unsubscribed => "unsubscribed",
            CampaignCounter::Complained => "complained",
        }
    }

    /// Counter moved by a provider event
    pub fn for_event(kind: DeliveryEventKind) -> Self {
        match kind {
            DeliveryEventKind::Delivered => CampaignCounter::Delivered,
            DeliveryEventKind::Opened => CampaignCounter::Opened,
            DeliveryEventKind::Clicked => CampaignCounter::Clicked,
            DeliveryEventKind::Failed | DeliveryEventKind::Bounced => CampaignCounter::Bounced,
            DeliveryEventKind::Complained => CampaignCounter::Complained,
            DeliveryEventKind::Unsubscribed => CampaignCounter::Unsubscribed,
        }
    }
}

/// Aggregate delivery metrics for a campaign
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CampaignMetrics {
    pub campaign_id: CampaignId,
    pub sent: i64,
    pub delivered: i64,
    pub bounced: i64,
    pub opened: i64,
    pub clicked: i64,
    pub unsubscribed: i64,
    pub complained: i64,
    pub updated_at: DateTime<Utc>,
}

impl CampaignMetrics {
    pub fn new(campaign_id: CampaignId, now: DateTime<Utc>) -> Self {
        Self {
            campaign_id,
            sent: 0,
            delivered: 0,
            bounced: 0,
            opened: 0,
            clicked: 0,
            unsubscribed: 0,
            complained: 0,
            updated_at: now,
        }
    }

    pub fn counter_mut(&mut self, counter: CampaignCounter) -> &mut i64 {
        match counter {
            CampaignCounter::Sent => &mut self.sent,
            CampaignCounter::Delivered => &mut self.delivered,
            CampaignCounter::Bounced => &mut self.bounced,
            CampaignCounter::Opened => &mut self.opened,
            CampaignCounter::Clicked => &mut self.clicked,
            CampaignCounter::Unsubscribed => &mut self.unsubscribed,
            CampaignCounter::Complained => &mut self.complained,
        }
    }

    /// Rates relative to `sent`; all zero before the first send
    pub fn rates(&self) -> CampaignRates {
        let ratio = |n: i64| {
            if self.sent > 0 {
                n as f64 / self.sent as f64
            } else {
                0.0
            }
        };
        CampaignRates {
            delivery_rate: ratio(self.delivered),
            bounce_rate: ratio(self.bounced),
            open_rate: ratio(self.opened),
            click_rate: ratio(self.clicked),
            unsubscribe_rate: ratio(self.unsubscribed),
            complaint_rate: ratio(self.complained),
        }
    }
}

/// Derived campaign rates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CampaignRates {
    pub delivery_rate: f64,
    pub bounce_rate: f64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub unsubscribe_rate: f64,
    pub complaint_rate: f64,
}

/// Expiry for a soft bounce recorded at `now`
pub fn soft_bounce_expiry(now: DateTime<Utc>, ttl_days: i64) -> DateTime<Utc> {
    now + Duration::days(ttl_days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn entry(kind: SuppressionType, expires_at: Option<DateTime<Utc>>) -> SuppressionEntry {
        SuppressionEntry::from_new(
            Uuid::new_v4(),
            NewSuppression {
                email: "a@example.com".into(),
                suppression_type: kind,
                bounce_type: None,
                reason: None,
                client_id: None,
                expires_at,
            },
            Utc::now(),
        )
    }

    fn candidate(kind: SuppressionType, expires_at: Option<DateTime<Utc>>) -> NewSuppression {
        NewSuppression {
            email: "a@example.com".into(),
            suppression_type: kind,
            bounce_type: None,
            reason: None,
            client_id: None,
            expires_at,
        }
    }

    #[test]
    fn test_suppression_order_is_total() {
        use SuppressionType::*;
        assert!(Manual > Complaint);
        assert!(Complaint > Bounce);
        assert!(Bounce > Unsubscribe);
        let mut kinds = vec![Complaint, Unsubscribe, Manual, Bounce];
        kinds.sort();
        assert_eq!(kinds, vec![Unsubscribe, Bounce, Complaint, Manual]);
    }

    #[test]
    fn test_replacement_rules() {
        let now = Utc::now();
        let bounce = entry(SuppressionType::Bounce, None);
        assert!(bounce.may_be_replaced_by(&candidate(SuppressionType::Complaint, None), now));
        assert!(!bounce.may_be_replaced_by(&candidate(SuppressionType::Bounce, None), now));
        assert!(!bounce.may_be_replaced_by(&candidate(SuppressionType::Unsubscribe, None), now));

        // permanent unsubscribe is not swapped for an expiring soft bounce
        let unsub = entry(SuppressionType::Unsubscribe, None);
        let soft = candidate(SuppressionType::Bounce, Some(now + Duration::days(7)));
        assert!(!unsub.may_be_replaced_by(&soft, now));

        // soft bounce gives way to anything permanent
        let soft_entry = entry(SuppressionType::Bounce, Some(now + Duration::days(7)));
        assert!(soft_entry.may_be_replaced_by(&candidate(SuppressionType::Bounce, None), now));
        assert!(soft_entry.may_be_replaced_by(&candidate(SuppressionType::Unsubscribe, None), now));
        assert!(!soft_entry.may_be_replaced_by(
            &candidate(SuppressionType::Bounce, Some(now + Duration::days(7))),
            now
        ));

        let expired = entry(SuppressionType::Bounce, Some(now - Duration::seconds(1)));
        assert!(expired.may_be_replaced_by(&candidate(SuppressionType::Unsubscribe, None), now));
    }

    #[test]
    fn test_job_status_round_trip_and_terminal() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Sent,
            JobStatus::Failed,
            JobStatus::DeadLetter,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::DeadLetter.is_terminal());
    }

    #[test]
    fn test_campaign_rates() {
        let mut metrics = CampaignMetrics::new("c1".into(), Utc::now());
        assert_eq!(metrics.rates().bounce_rate, 0.0);

        metrics.sent = 200;
        metrics.delivered = 190;
        metrics.bounced = 10;
        metrics.opened = 50;
        let rates = metrics.rates();
        assert_eq!(rates.delivery_rate, 0.95);
        assert_eq!(rates.bounce_rate, 0.05);
        assert_eq!(rates.open_rate, 0.25);
        assert_eq!(rates.click_rate, 0.0);
    }
}

//! Repository layer for data access

pub mod campaign_metrics;
pub mod dead_letters;
pub mod delivery_events;
pub mod jobs;
pub mod suppressions;

// Re-export concrete repository implementations
pub use campaign_metrics::DbCampaignMetricsRepository;
pub use dead_letters::DbDeadLetterRepository;
pub use delivery_events::DbDeliveryEventRepository;
pub use jobs::DbJobRepository;
pub use suppressions::DbSuppressionRepository;

// Re-export repository traits
pub use campaign_metrics::CampaignMetricsRepository;
pub use dead_letters::DeadLetterRepository;
pub use delivery_events::DeliveryEventRepository;
pub use jobs::JobRepository;
pub use suppressions::SuppressionRepository;

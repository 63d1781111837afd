//! Queue - Durable email jobs, retries and dead-lettering

pub mod backoff;
pub mod manager;
pub mod send_window;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use manager::{EnqueueError, EnqueueRequest, QueueManager, TEMPLATE_VERSION_HEADER};
pub use worker::{DeliveryWorker, WorkerDeps, IDEMPOTENCY_HEADER, JOB_ID_HEADER};

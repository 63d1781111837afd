//! Outpost Storage - Durable records for the delivery pipeline
//!
//! This crate provides the record models, repository traits and their
//! PostgreSQL and in-memory implementations.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use memory::{
    InMemoryCampaignMetricsRepository, InMemoryDeadLetterRepository,
    InMemoryDeliveryEventRepository, InMemoryJobRepository, InMemorySuppressionRepository,
};
pub use models::*;
pub use repository::*;

//! Suppression Registry - Addresses that must not receive mail

mod registry;

pub use registry::{BounceSeverity, SuppressionRegistry};

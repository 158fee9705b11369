//! # attestor-core
//!
//! Core types, traits, and abstractions for the attestor background tier.
//!
//! This crate provides the domain models, store and notifier traits,
//! configuration and metrics sinks that the scan and job crates depend on.

pub mod config;
pub mod defaults;
pub mod error;
pub mod events;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use config::{ScanSettings, Settings, WebhookSettings};
pub use error::{Error, Result};
pub use events::{BroadcastNotifier, LogNotifier};
pub use memory::{
    InMemoryEvidenceStore, InMemoryPolicyStore, InMemoryScanRecordStore, InMemoryScheduleStore,
};
pub use metrics::{InMemoryMetrics, NoopMetrics, PrometheusMetrics};
pub use models::*;
pub use traits::*;

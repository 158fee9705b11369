//! # attestor-jobs
//!
//! Background processing for the attestor worker tier.
//!
//! This crate provides:
//! - A named in-process job queue with a bounded worker pool
//! - The evidence ingestion pipeline (fetch, scan, quarantine, auto-release)
//! - The schedule runner and its per-type handlers
//! - Signed webhook delivery for notifications and automation dispatch
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use attestor_jobs::{EvidenceIngestionHandler, IngestionPipeline, JobQueue};
//!
//! let queue = JobQueue::new(8);
//! queue
//!     .register_processor("evidence.ingest", Arc::new(EvidenceIngestionHandler::new(pipeline)))
//!     .await?;
//!
//! let handle = queue.enqueue("evidence.ingest", payload).await?;
//! let job = handle.wait().await?;
//! ```

pub mod dispatch;
pub mod handler;
pub mod ingestion;
pub mod queue;
pub mod release;
pub mod schedule;
pub mod webhook;

// Re-export core types
pub use attestor_core::*;

pub use dispatch::WebhookDispatchHandler;
pub use handler::{JobContext, JobHandler, JobResult};
pub use ingestion::{
    enqueue_ingestion, EvidenceIngestionHandler, IngestionDeps, IngestionOutcome, IngestionPipeline,
    IngestionPolicy,
};
pub use queue::{JobHandle, JobQueue, QueueEvent};
pub use release::{resolve_release, ReleaseDecision};
pub use schedule::{
    EnqueueJobHandler, HealthCheckHandler, ScheduleHandler, ScheduleHandlers, ScheduleRunner,
};
pub use webhook::{sign_payload, WebhookClient, WebhookNotifier};

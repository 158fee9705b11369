//! Core traits for the attestor worker.
//!
//! Persistence, notification and metrics are collaborators injected into the
//! queue, the schedule runner and the ingestion pipeline. The in-memory
//! implementations in [`crate::memory`] back the worker binary and the tests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// SCHEDULE STORE
// =============================================================================

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// All schedules with `is_active = true`.
    async fn list_active(&self) -> Result<Vec<Schedule>>;

    /// Fetch one schedule.
    async fn get(&self, id: Uuid) -> Result<Schedule>;

    /// Persist `last_run`, `next_run` and the result of a successful firing,
    /// returning the updated schedule.
    async fn record_execution(&self, id: Uuid, execution: ScheduleExecution) -> Result<Schedule>;
}

// =============================================================================
// EVIDENCE STORE
// =============================================================================

#[async_trait]
pub trait EvidenceStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<EvidenceItem>;

    /// Set `ingestion_status = PROCESSING`.
    async fn mark_processing(&self, id: Uuid) -> Result<()>;

    /// Record the ingestion outcome and scan summary without touching `status`
    /// or the history.
    async fn record_ingestion(
        &self,
        id: Uuid,
        ingestion_status: IngestionStatus,
        last_scan: LastScan,
    ) -> Result<()>;

    /// Change `status` and append the matching history entry atomically.
    ///
    /// `from_status` on the returned entry is the status observed at the
    /// moment of the write.
    async fn transition(&self, id: Uuid, transition: StatusTransition)
        -> Result<StatusHistoryEntry>;

    /// Most recent history entry whose `to_status` is `QUARANTINED`.
    async fn latest_quarantine_entry(&self, id: Uuid) -> Result<Option<StatusHistoryEntry>>;

    /// Full history for an item, oldest first.
    async fn history(&self, id: Uuid) -> Result<Vec<StatusHistoryEntry>>;
}

// =============================================================================
// SCAN RECORD STORE
// =============================================================================

#[async_trait]
pub trait ScanRecordStore: Send + Sync {
    /// Create or update the record in the `RUNNING` state.
    async fn mark_running(
        &self,
        scan_id: Uuid,
        evidence_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Write terminal values. Fails with `InvalidState` if the record is
    /// already terminal; creates the record if it does not exist.
    async fn finalize(
        &self,
        scan_id: Uuid,
        evidence_id: Uuid,
        finalization: ScanFinalization,
    ) -> Result<ScanRecord>;

    async fn get(&self, scan_id: Uuid) -> Result<ScanRecord>;
}

// =============================================================================
// POLICY / NOTIFICATIONS / METRICS
// =============================================================================

#[async_trait]
pub trait OrganizationPolicyStore: Send + Sync {
    /// Auto-release strategy for an organization, if one is configured.
    async fn auto_release_strategy(&self, organization_id: Uuid)
        -> Result<Option<AutoReleaseStrategy>>;
}

/// Delivers quarantine/release events to the external notification service.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &EvidenceNotification) -> Result<()>;
}

/// Named metric with string labels.
pub type MetricLabels<'a> = &'a [(&'a str, &'a str)];

/// Counter and duration sink.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str, labels: MetricLabels<'_>);

    fn record_duration(&self, name: &str, duration: Duration, labels: MetricLabels<'_>);
}

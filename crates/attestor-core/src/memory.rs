//! In-memory store implementations.
//!
//! Used by the worker binary when no external persistence is wired, and by
//! the test suites. All state sits behind a tokio `RwLock`; multi-field
//! updates take the write lock once so they are observed atomically.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::*;
use crate::traits::*;

// =============================================================================
// SCHEDULES
// =============================================================================

#[derive(Clone, Default)]
pub struct InMemoryScheduleStore {
    schedules: Arc<RwLock<HashMap<Uuid, Schedule>>>,
    executions: Arc<RwLock<Vec<(Uuid, ScheduleExecution)>>>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a schedule.
    pub async fn upsert(&self, schedule: Schedule) {
        self.schedules.write().await.insert(schedule.id, schedule);
    }

    pub async fn remove(&self, id: Uuid) -> Option<Schedule> {
        self.schedules.write().await.remove(&id)
    }

    /// Every recorded execution, in order.
    pub async fn executions(&self) -> Vec<(Uuid, ScheduleExecution)> {
        self.executions.read().await.clone()
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn list_active(&self) -> Result<Vec<Schedule>> {
        let mut active: Vec<Schedule> = self
            .schedules
            .read()
            .await
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect();
        active.sort_by_key(|s| s.next_run);
        Ok(active)
    }

    async fn get(&self, id: Uuid) -> Result<Schedule> {
        self.schedules
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::ScheduleNotFound(id))
    }

    async fn record_execution(&self, id: Uuid, execution: ScheduleExecution) -> Result<Schedule> {
        let mut schedules = self.schedules.write().await;
        let schedule = schedules.get_mut(&id).ok_or(Error::ScheduleNotFound(id))?;
        schedule.last_run = Some(execution.executed_at);
        schedule.next_run = execution.next_run;
        let updated = schedule.clone();
        self.executions.write().await.push((id, execution));
        Ok(updated)
    }
}

// =============================================================================
// EVIDENCE
// =============================================================================

#[derive(Default)]
struct EvidenceState {
    items: HashMap<Uuid, EvidenceItem>,
    history: HashMap<Uuid, Vec<StatusHistoryEntry>>,
}

#[derive(Clone, Default)]
pub struct InMemoryEvidenceStore {
    state: Arc<RwLock<EvidenceState>>,
}

impl InMemoryEvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, item: EvidenceItem) {
        self.state.write().await.items.insert(item.id, item);
    }

    /// Seed a history entry, e.g. the transition that put an item into quarantine.
    pub async fn push_history(&self, entry: StatusHistoryEntry) {
        self.state
            .write()
            .await
            .history
            .entry(entry.evidence_id)
            .or_default()
            .push(entry);
    }
}

#[async_trait]
impl EvidenceStore for InMemoryEvidenceStore {
    async fn get(&self, id: Uuid) -> Result<EvidenceItem> {
        self.state
            .read()
            .await
            .items
            .get(&id)
            .cloned()
            .ok_or(Error::EvidenceNotFound(id))
    }

    async fn mark_processing(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.write().await;
        let item = state.items.get_mut(&id).ok_or(Error::EvidenceNotFound(id))?;
        item.ingestion_status = Some(IngestionStatus::Processing);
        Ok(())
    }

    async fn record_ingestion(
        &self,
        id: Uuid,
        ingestion_status: IngestionStatus,
        last_scan: LastScan,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let item = state.items.get_mut(&id).ok_or(Error::EvidenceNotFound(id))?;
        item.ingestion_status = Some(ingestion_status);
        item.last_scan = Some(last_scan);
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        transition: StatusTransition,
    ) -> Result<StatusHistoryEntry> {
        let mut state = self.state.write().await;
        let item = state.items.get_mut(&id).ok_or(Error::EvidenceNotFound(id))?;
        let from = item.status;
        item.status = transition.to_status;
        item.ingestion_status = Some(transition.ingestion_status);
        item.last_scan = Some(transition.last_scan);

        let entry = StatusHistoryEntry::new(
            id,
            Some(from),
            transition.to_status,
            Some(transition.note),
            transition.changed_by_id,
        );
        state.history.entry(id).or_default().push(entry.clone());
        Ok(entry)
    }

    async fn latest_quarantine_entry(&self, id: Uuid) -> Result<Option<StatusHistoryEntry>> {
        Ok(self
            .state
            .read()
            .await
            .history
            .get(&id)
            .and_then(|entries| {
                entries
                    .iter()
                    .rev()
                    .find(|e| e.to_status == EvidenceStatus::Quarantined)
                    .cloned()
            }))
    }

    async fn history(&self, id: Uuid) -> Result<Vec<StatusHistoryEntry>> {
        Ok(self
            .state
            .read()
            .await
            .history
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }
}

// =============================================================================
// SCAN RECORDS
// =============================================================================

#[derive(Clone, Default)]
pub struct InMemoryScanRecordStore {
    records: Arc<RwLock<HashMap<Uuid, ScanRecord>>>,
}

impl InMemoryScanRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<ScanRecord> {
        self.records.read().await.values().cloned().collect()
    }
}

fn is_terminal(status: ScanStatus) -> bool {
    status != ScanStatus::Running
}

#[async_trait]
impl ScanRecordStore for InMemoryScanRecordStore {
    async fn mark_running(
        &self,
        scan_id: Uuid,
        evidence_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(&scan_id) {
            if is_terminal(existing.status) {
                return Err(Error::InvalidState(format!(
                    "scan {} already finalized as {}",
                    scan_id, existing.status
                )));
            }
        }
        records.insert(scan_id, ScanRecord::running(scan_id, evidence_id, started_at));
        Ok(())
    }

    async fn finalize(
        &self,
        scan_id: Uuid,
        evidence_id: Uuid,
        finalization: ScanFinalization,
    ) -> Result<ScanRecord> {
        if !is_terminal(finalization.status) {
            return Err(Error::InvalidInput(
                "finalization status must be terminal".to_string(),
            ));
        }
        let mut records = self.records.write().await;
        let record = records
            .entry(scan_id)
            .or_insert_with(|| ScanRecord::running(scan_id, evidence_id, finalization.completed_at));
        if is_terminal(record.status) {
            return Err(Error::InvalidState(format!(
                "scan {} already finalized as {}",
                scan_id, record.status
            )));
        }
        record.status = finalization.status;
        record.completed_at = Some(finalization.completed_at);
        record.duration_ms = finalization.duration_ms;
        record.bytes_scanned = finalization.bytes_scanned;
        record.engine_version = finalization.engine_version;
        record.signature_version = finalization.signature_version;
        record.findings = finalization.findings;
        record.failure_reason = finalization.failure_reason;
        record.quarantined = finalization.quarantined;
        Ok(record.clone())
    }

    async fn get(&self, scan_id: Uuid) -> Result<ScanRecord> {
        self.records
            .read()
            .await
            .get(&scan_id)
            .cloned()
            .ok_or(Error::ScanNotFound(scan_id))
    }
}

// =============================================================================
// ORGANIZATION POLICY
// =============================================================================

/// Per-organization auto-release strategies held in memory.
#[derive(Clone, Default)]
pub struct InMemoryPolicyStore {
    strategies: Arc<RwLock<HashMap<Uuid, AutoReleaseStrategy>>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, organization_id: Uuid, strategy: AutoReleaseStrategy) {
        self.strategies.write().await.insert(organization_id, strategy);
    }
}

#[async_trait]
impl OrganizationPolicyStore for InMemoryPolicyStore {
    async fn auto_release_strategy(
        &self,
        organization_id: Uuid,
    ) -> Result<Option<AutoReleaseStrategy>> {
        Ok(self.strategies.read().await.get(&organization_id).copied())
    }
}

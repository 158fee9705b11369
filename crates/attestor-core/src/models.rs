//! Domain models shared by the job queue, the schedule runner and the
//! evidence ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::defaults::JOB_ATTEMPT_FIELD;
use crate::error::{Error, Result};

// =============================================================================
// JOBS
// =============================================================================

/// Lifecycle of a queued job. Transitions are monotonic:
/// `Queued -> Running -> {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether the job has finished (successfully or not).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `next` is the single legal successor of this status.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A one-shot unit of asynchronous work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub payload: JsonValue,
    pub status: JobStatus,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
}

impl Job {
    /// Create a freshly queued job with a time-ordered id.
    pub fn new(name: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            payload,
            status: JobStatus::Queued,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// The 1-based attempt counter carried in the payload (defaults to 1).
    pub fn attempt(&self) -> u32 {
        self.payload
            .get(JOB_ATTEMPT_FIELD)
            .and_then(|v| v.as_u64())
            .map(|v| v.max(1) as u32)
            .unwrap_or(1)
    }
}

/// Queue statistics summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.queued + self.running + self.completed + self.failed
    }
}

// =============================================================================
// SCHEDULES
// =============================================================================

/// How a schedule's `next_run` advances after a successful execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Custom,
}

impl Frequency {
    /// Compute the run after `from`.
    ///
    /// Advances from the previous *scheduled* time rather than from "now", so
    /// late firings never accumulate drift. `Custom` requires
    /// `options.interval_days > 0`.
    pub fn advance(&self, from: DateTime<Utc>, options: &ScheduleOptions) -> Result<DateTime<Utc>> {
        match self {
            Frequency::Daily => add_days(from, 1),
            Frequency::Weekly => add_days(from, 7),
            Frequency::Monthly => add_months(from, 1),
            Frequency::Quarterly => add_months(from, 3),
            Frequency::Custom => {
                let days = options
                    .interval_days
                    .filter(|d| *d > 0)
                    .ok_or_else(|| {
                        Error::InvalidInput(
                            "custom frequency requires a positive intervalDays option".to_string(),
                        )
                    })?;
                add_days(from, i64::from(days))
            }
        }
    }
}

fn add_days(from: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|delta| from.checked_add_signed(delta))
        .ok_or_else(|| Error::InvalidInput(format!("cannot add {} days to {}", days, from)))
}

fn add_months(from: DateTime<Utc>, months: u32) -> Result<DateTime<Utc>> {
    from.checked_add_months(Months::new(months))
        .ok_or_else(|| Error::InvalidInput(format!("cannot add {} months to {}", months, from)))
}

impl FromStr for Frequency {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            "quarterly" => Ok(Frequency::Quarterly),
            "custom" => Ok(Frequency::Custom),
            other => Err(Error::InvalidInput(format!("unknown frequency '{}'", other))),
        }
    }
}

/// Which automation a schedule runs.
///
/// Dispatch on this enum is exhaustive: adding a variant is a compile error
/// until a handler is wired for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// Remind owners about evidence awaiting review.
    EvidenceReminder,
    /// Emit queue/worker health metrics.
    HealthCheck,
    /// Draft a control re-assessment.
    ReassessmentDraft,
    /// Publish a framework crosswalk snapshot.
    FrameworkPublish,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleType::EvidenceReminder => "evidence_reminder",
            ScheduleType::HealthCheck => "health_check",
            ScheduleType::ReassessmentDraft => "reassessment_draft",
            ScheduleType::FrameworkPublish => "framework_publish",
        }
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "evidence_reminder" => Ok(ScheduleType::EvidenceReminder),
            "health_check" => Ok(ScheduleType::HealthCheck),
            "reassessment_draft" => Ok(ScheduleType::ReassessmentDraft),
            "framework_publish" => Ok(ScheduleType::FrameworkPublish),
            other => Err(Error::InvalidInput(format!("unknown schedule type '{}'", other))),
        }
    }
}

/// Free-form schedule options. `intervalDays` drives `Frequency::Custom`;
/// everything else is passed through to the handler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_days: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl ScheduleOptions {
    pub fn with_interval_days(days: u32) -> Self {
        Self {
            interval_days: Some(days),
            extra: Map::new(),
        }
    }
}

/// A named, recurring automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub schedule_type: ScheduleType,
    pub frequency: Frequency,
    pub next_run: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    pub is_active: bool,
    #[serde(default)]
    pub options: ScheduleOptions,
}

impl Schedule {
    /// Time left until the schedule is due, clamped at zero.
    pub fn delay_until_due(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.next_run - now).to_std().unwrap_or(std::time::Duration::ZERO)
    }

    /// The run after the current `next_run`.
    pub fn following_run(&self) -> Result<DateTime<Utc>> {
        self.frequency.advance(self.next_run, &self.options)
    }
}

/// Result of a successful schedule firing, persisted through the schedule store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleExecution {
    pub executed_at: DateTime<Utc>,
    pub next_run: DateTime<Utc>,
    pub result: JsonValue,
}

// =============================================================================
// EVIDENCE
// =============================================================================

/// Analyst-visible lifecycle of an evidence item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceStatus {
    Pending,
    Approved,
    Archived,
    Quarantined,
}

impl EvidenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceStatus::Pending => "PENDING",
            EvidenceStatus::Approved => "APPROVED",
            EvidenceStatus::Archived => "ARCHIVED",
            EvidenceStatus::Quarantined => "QUARANTINED",
        }
    }
}

impl fmt::Display for EvidenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scanning sub-lifecycle of an evidence item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestionStatus {
    Processing,
    Completed,
    Quarantined,
}

/// Denormalised summary of the most recent scan, kept on the evidence item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastScan {
    pub scan_id: Uuid,
    pub status: ScanStatus,
    pub scanned_at: DateTime<Utc>,
    pub engine_version: Option<String>,
    pub signature_version: Option<String>,
    pub signature: Option<String>,
}

/// An uploaded artifact subject to malware scanning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceItem {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub status: EvidenceStatus,
    pub file_size: Option<u64>,
    pub original_filename: Option<String>,
    pub ingestion_status: Option<IngestionStatus>,
    pub last_scan: Option<LastScan>,
}

impl EvidenceItem {
    /// New evidence awaiting its first scan.
    pub fn new(organization_id: Uuid, status: EvidenceStatus) -> Self {
        Self {
            id: Uuid::now_v7(),
            organization_id,
            status,
            file_size: None,
            original_filename: None,
            ingestion_status: None,
            last_scan: None,
        }
    }

    pub fn is_quarantined(&self) -> bool {
        self.status == EvidenceStatus::Quarantined
    }
}

/// Verdict state of one scan attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStatus {
    Running,
    Clean,
    Infected,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Running => "RUNNING",
            ScanStatus::Clean => "CLEAN",
            ScanStatus::Infected => "INFECTED",
            ScanStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scan record per ingestion attempt. `findings` is opaque outside the
/// ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    pub id: Uuid,
    pub evidence_id: Uuid,
    pub status: ScanStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub bytes_scanned: Option<u64>,
    pub engine_version: Option<String>,
    pub signature_version: Option<String>,
    pub findings: Option<JsonValue>,
    pub failure_reason: Option<String>,
    pub quarantined: bool,
}

impl ScanRecord {
    /// A record in the `Running` state.
    pub fn running(id: Uuid, evidence_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            evidence_id,
            status: ScanStatus::Running,
            started_at: Some(started_at),
            completed_at: None,
            duration_ms: None,
            bytes_scanned: None,
            engine_version: None,
            signature_version: None,
            findings: None,
            failure_reason: None,
            quarantined: false,
        }
    }
}

/// Terminal values written to a scan record exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanFinalization {
    pub status: ScanStatus,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub bytes_scanned: Option<u64>,
    pub engine_version: Option<String>,
    pub signature_version: Option<String>,
    pub findings: Option<JsonValue>,
    pub failure_reason: Option<String>,
    pub quarantined: bool,
}

impl ScanFinalization {
    /// A `Failed` finalization with only a reason.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: ScanStatus::Failed,
            completed_at: Utc::now(),
            duration_ms: None,
            bytes_scanned: None,
            engine_version: None,
            signature_version: None,
            findings: None,
            failure_reason: Some(reason.into()),
            quarantined: false,
        }
    }
}

/// Append-only audit entry for evidence status changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusHistoryEntry {
    pub id: Uuid,
    pub evidence_id: Uuid,
    pub from_status: Option<EvidenceStatus>,
    pub to_status: EvidenceStatus,
    pub note: Option<String>,
    pub changed_by_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl StatusHistoryEntry {
    pub fn new(
        evidence_id: Uuid,
        from_status: Option<EvidenceStatus>,
        to_status: EvidenceStatus,
        note: Option<String>,
        changed_by_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            evidence_id,
            from_status,
            to_status,
            note,
            changed_by_id,
            created_at: Utc::now(),
        }
    }
}

/// A status change applied atomically with its history entry.
///
/// The store reads the current status as `from_status`, writes `to_status`,
/// `ingestion_status` and `last_scan`, and appends the history entry in one
/// step.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTransition {
    pub to_status: EvidenceStatus,
    pub ingestion_status: IngestionStatus,
    pub last_scan: LastScan,
    pub note: String,
    pub changed_by_id: Option<String>,
}

/// Per-organization policy for leaving quarantine after a clean re-scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoReleaseStrategy {
    /// Never auto-release; an operator must act.
    Manual,
    /// Release to `PENDING`.
    Pending,
    /// Restore the status held before quarantine, else `PENDING`.
    Previous,
}

impl AutoReleaseStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoReleaseStrategy::Manual => "manual",
            AutoReleaseStrategy::Pending => "pending",
            AutoReleaseStrategy::Previous => "previous",
        }
    }
}

impl fmt::Display for AutoReleaseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AutoReleaseStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "manual" => Ok(AutoReleaseStrategy::Manual),
            "pending" => Ok(AutoReleaseStrategy::Pending),
            "previous" => Ok(AutoReleaseStrategy::Previous),
            other => Err(Error::InvalidInput(format!(
                "unknown auto-release strategy '{}'",
                other
            ))),
        }
    }
}

// =============================================================================
// STORAGE REFERENCES
// =============================================================================

/// Where an artifact's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageProvider {
    /// Local filesystem, `key` relative to the storage root.
    Local,
    /// Network object storage reachable through `uri`.
    #[serde(alias = "s3", alias = "object")]
    ObjectStorage,
}

impl fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageProvider::Local => f.write_str("local"),
            StorageProvider::ObjectStorage => f.write_str("object_storage"),
        }
    }
}

/// Storage reference handed over by the upload API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageReference {
    pub provider: StorageProvider,
    pub key: String,
    #[serde(default)]
    pub uri: Option<String>,
}

// =============================================================================
// JOB PAYLOADS
// =============================================================================

/// Payload of an `evidence.ingest` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestEvidencePayload {
    pub evidence_id: Uuid,
    pub scan_id: Uuid,
    pub storage: StorageReference,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub original_filename: Option<String>,
    #[serde(default)]
    pub requested_by: Option<String>,
}

// =============================================================================
// NOTIFICATIONS
// =============================================================================

/// Notification kind sent toward the external notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Quarantined,
    Released,
}

impl NotificationStatus {
    pub fn event_type(&self) -> &'static str {
        match self {
            NotificationStatus::Quarantined => "evidence.quarantined",
            NotificationStatus::Released => "evidence.released",
        }
    }
}

/// Structured event emitted on quarantine and release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvidenceNotification {
    pub evidence_id: Uuid,
    pub organization_id: Uuid,
    pub scan_id: Uuid,
    pub status: NotificationStatus,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub findings: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

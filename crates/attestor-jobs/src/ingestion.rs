//! Evidence ingestion pipeline.
//!
//! Drives one evidence item through
//! `ingestion_status: none -> PROCESSING -> {COMPLETED, QUARANTINED}`:
//!
//! 1. Missing evidence finalizes the scan as `FAILED` and stops.
//! 2. The item is marked `PROCESSING` and the scan record `RUNNING`.
//! 3. With scanning disabled a synthetic clean verdict is used.
//! 4. Otherwise the artifact is fetched and scanned.
//! 5. Clean results release quarantined items per the organization's
//!    auto-release strategy.
//! 6. Infected results quarantine the item.
//! 7. Engine failures quarantine the item when `quarantine_on_error` is set,
//!    keeping the failure category in the scan findings.
//!
//! Scan failures never escape this module as errors; only store failures do.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, instrument, warn};

use attestor_core::defaults::{JOB_EVIDENCE_INGEST, SCAN_DISABLED_ENGINE};
use attestor_core::metrics::{AUTO_RELEASE_TOTAL, QUARANTINE_TOTAL, SCAN_DURATION, SCAN_TOTAL};
use attestor_core::{
    AutoReleaseStrategy, Error, EvidenceItem, EvidenceNotification, EvidenceStatus, EvidenceStore,
    IngestEvidencePayload, IngestionStatus, LastScan, MetricsSink, NotificationStatus, Notifier,
    OrganizationPolicyStore, Result, ScanFinalization, ScanRecordStore, ScanSettings, ScanStatus,
    StatusTransition,
};
use attestor_scan::{ArtifactFetcher, ScanContext, ScanError, ScanOutcome, Scanner};

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::queue::{JobHandle, JobQueue};
use crate::release::{resolve_release, ReleaseDecision};

/// Deployment-level ingestion policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestionPolicy {
    pub scan_enabled: bool,
    pub quarantine_on_error: bool,
    /// Used when the organization has no strategy configured.
    pub default_strategy: AutoReleaseStrategy,
}

impl Default for IngestionPolicy {
    fn default() -> Self {
        Self {
            scan_enabled: true,
            quarantine_on_error: true,
            default_strategy: AutoReleaseStrategy::Pending,
        }
    }
}

impl From<&ScanSettings> for IngestionPolicy {
    fn from(settings: &ScanSettings) -> Self {
        Self {
            scan_enabled: settings.enabled,
            quarantine_on_error: settings.quarantine_on_error,
            default_strategy: settings.default_auto_release,
        }
    }
}

/// How an ingestion attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestionOutcome {
    EvidenceMissing,
    Clean {
        status: EvidenceStatus,
        released: bool,
    },
    Infected {
        signature: Option<String>,
    },
    ScanFailed {
        category: String,
        reason: String,
        quarantined: bool,
    },
}

/// Collaborators for [`IngestionPipeline`].
#[derive(Clone)]
pub struct IngestionDeps {
    pub evidence: Arc<dyn EvidenceStore>,
    pub scans: Arc<dyn ScanRecordStore>,
    pub policies: Arc<dyn OrganizationPolicyStore>,
    pub fetcher: Arc<dyn ArtifactFetcher>,
    pub scanner: Arc<dyn Scanner>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Arc<dyn MetricsSink>,
}

pub struct IngestionPipeline {
    deps: IngestionDeps,
    policy: IngestionPolicy,
}

/// Shared inputs for the state-changing tail of an ingestion.
struct Attempt<'a> {
    item: &'a EvidenceItem,
    payload: &'a IngestEvidencePayload,
}

impl IngestionPipeline {
    pub fn new(deps: IngestionDeps, policy: IngestionPolicy) -> Self {
        Self { deps, policy }
    }

    pub fn policy(&self) -> IngestionPolicy {
        self.policy
    }

    #[instrument(skip(self, payload), fields(evidence_id = %payload.evidence_id, scan_id = %payload.scan_id))]
    pub async fn ingest(&self, payload: &IngestEvidencePayload) -> Result<IngestionOutcome> {
        let evidence_id = payload.evidence_id;
        let scan_id = payload.scan_id;

        let item = match self.deps.evidence.get(evidence_id).await {
            Ok(item) => item,
            Err(Error::EvidenceNotFound(_)) => {
                warn!("Evidence not found, finalizing scan as failed");
                self.deps
                    .scans
                    .finalize(scan_id, evidence_id, ScanFinalization::failed("evidence not found"))
                    .await?;
                return Ok(IngestionOutcome::EvidenceMissing);
            }
            Err(e) => return Err(e),
        };

        self.deps.evidence.mark_processing(evidence_id).await?;
        self.deps
            .scans
            .mark_running(scan_id, evidence_id, Utc::now())
            .await?;

        let (engine, scanned) = if self.policy.scan_enabled {
            (self.deps.scanner.engine_name().to_string(), self.run_scan(payload).await)
        } else {
            debug!("Scanning disabled, recording synthetic clean result");
            (SCAN_DISABLED_ENGINE.to_string(), Ok(synthetic_clean(&item)))
        };

        let attempt = Attempt {
            item: &item,
            payload,
        };
        match scanned {
            Ok(outcome) => {
                self.record_scan_metrics(&engine, outcome.status, outcome.duration_ms);
                if outcome.is_infected() {
                    self.on_infected(&attempt, outcome).await
                } else {
                    self.on_clean(&attempt, outcome).await
                }
            }
            Err(e) => {
                self.record_scan_metrics(&engine, ScanStatus::Failed, 0);
                self.on_scan_error(&attempt, &engine, e).await
            }
        }
    }

    async fn run_scan(&self, payload: &IngestEvidencePayload) -> std::result::Result<ScanOutcome, ScanError> {
        let artifact = self.deps.fetcher.fetch(&payload.storage).await?;
        let ctx = ScanContext {
            evidence_id: payload.evidence_id,
            scan_id: payload.scan_id,
            checksum: payload.checksum.clone(),
            original_filename: payload.original_filename.clone(),
        };
        self.deps.scanner.scan(artifact, &ctx).await
    }

    // =========================================================================
    // OUTCOME PATHS
    // =========================================================================

    async fn on_clean(&self, attempt: &Attempt<'_>, outcome: ScanOutcome) -> Result<IngestionOutcome> {
        let last_scan = self.finalize(attempt, &outcome, false).await?;
        let item = attempt.item;

        if !item.is_quarantined() {
            self.deps
                .evidence
                .record_ingestion(item.id, IngestionStatus::Completed, last_scan)
                .await?;
            info!(status = %item.status, "Evidence scanned clean");
            return Ok(IngestionOutcome::Clean {
                status: item.status,
                released: false,
            });
        }

        let strategy = self
            .deps
            .policies
            .auto_release_strategy(item.organization_id)
            .await?
            .unwrap_or(self.policy.default_strategy);

        match resolve_release(strategy, item.id, self.deps.evidence.as_ref()).await? {
            ReleaseDecision::Hold => {
                self.deps
                    .evidence
                    .record_ingestion(item.id, IngestionStatus::Completed, last_scan)
                    .await?;
                info!(%strategy, "Clean re-scan, evidence held in quarantine");
                Ok(IngestionOutcome::Clean {
                    status: EvidenceStatus::Quarantined,
                    released: false,
                })
            }
            ReleaseDecision::Release(target) => {
                // Status and history commit together; side effects follow the commit
                self.deps
                    .evidence
                    .transition(
                        item.id,
                        StatusTransition {
                            to_status: target,
                            ingestion_status: IngestionStatus::Completed,
                            last_scan,
                            note: format!("Auto-released after clean re-scan ({} strategy)", strategy),
                            changed_by_id: None,
                        },
                    )
                    .await?;

                self.send_notification(EvidenceNotification {
                    evidence_id: item.id,
                    organization_id: item.organization_id,
                    scan_id: attempt.payload.scan_id,
                    status: NotificationStatus::Released,
                    reason: format!("clean re-scan, released to {}", target),
                    findings: None,
                    requested_by: attempt.payload.requested_by.clone(),
                })
                .await;
                self.deps.metrics.increment(
                    AUTO_RELEASE_TOTAL,
                    &[("strategy", strategy.as_str()), ("status", target.as_str())],
                );
                info!(%strategy, to_status = %target, "Evidence auto-released");
                Ok(IngestionOutcome::Clean {
                    status: target,
                    released: true,
                })
            }
        }
    }

    async fn on_infected(&self, attempt: &Attempt<'_>, outcome: ScanOutcome) -> Result<IngestionOutcome> {
        let last_scan = self.finalize(attempt, &outcome, true).await?;
        let signature = outcome.signature.clone();
        let reason = match &signature {
            Some(sig) => format!("malware detected: {}", sig),
            None => "malware detected".to_string(),
        };
        self.quarantine(attempt, last_scan, reason, "infected", Some(outcome.findings))
            .await?;
        Ok(IngestionOutcome::Infected { signature })
    }

    async fn on_scan_error(
        &self,
        attempt: &Attempt<'_>,
        engine: &str,
        error: ScanError,
    ) -> Result<IngestionOutcome> {
        let category = error.category();
        let reason = error.to_string();
        let quarantined = self.policy.quarantine_on_error;
        let findings = json!({
            "engine": engine,
            "errorCategory": category,
            "error": reason,
        });
        warn!(category, error = %reason, quarantined, "Scan failed");

        let finalization = ScanFinalization {
            findings: Some(findings.clone()),
            quarantined,
            ..ScanFinalization::failed(reason.clone())
        };
        self.deps
            .scans
            .finalize(attempt.payload.scan_id, attempt.item.id, finalization)
            .await?;

        let last_scan = LastScan {
            scan_id: attempt.payload.scan_id,
            status: ScanStatus::Failed,
            scanned_at: Utc::now(),
            engine_version: None,
            signature_version: None,
            signature: None,
        };

        if quarantined {
            self.quarantine(
                attempt,
                last_scan,
                format!("scan failed ({}): {}", category, reason),
                category,
                Some(findings),
            )
            .await?;
        } else {
            self.deps
                .evidence
                .record_ingestion(attempt.item.id, IngestionStatus::Completed, last_scan)
                .await?;
        }

        Ok(IngestionOutcome::ScanFailed {
            category: category.to_string(),
            reason,
            quarantined,
        })
    }

    // =========================================================================
    // SHARED STEPS
    // =========================================================================

    /// Finalize the scan record from a definitive outcome.
    async fn finalize(
        &self,
        attempt: &Attempt<'_>,
        outcome: &ScanOutcome,
        quarantined: bool,
    ) -> Result<LastScan> {
        let completed_at = Utc::now();
        let mut findings = outcome.findings.clone();
        if !outcome.notes.is_empty() {
            if let Some(map) = findings.as_object_mut() {
                map.insert("notes".to_string(), json!(outcome.notes));
            }
        }

        self.deps
            .scans
            .finalize(
                attempt.payload.scan_id,
                attempt.item.id,
                ScanFinalization {
                    status: outcome.status,
                    completed_at,
                    duration_ms: Some(outcome.duration_ms),
                    bytes_scanned: Some(outcome.bytes_scanned),
                    engine_version: outcome.engine_version.clone(),
                    signature_version: outcome.signature_version.clone(),
                    findings: Some(findings),
                    failure_reason: None,
                    quarantined,
                },
            )
            .await?;

        Ok(LastScan {
            scan_id: attempt.payload.scan_id,
            status: outcome.status,
            scanned_at: completed_at,
            engine_version: outcome.engine_version.clone(),
            signature_version: outcome.signature_version.clone(),
            signature: outcome.signature.clone(),
        })
    }

    /// Move the item into quarantine and notify.
    ///
    /// An item already quarantined keeps its status and gets no new history
    /// entry; the notification is still sent.
    async fn quarantine(
        &self,
        attempt: &Attempt<'_>,
        last_scan: LastScan,
        reason: String,
        metric_reason: &str,
        findings: Option<JsonValue>,
    ) -> Result<()> {
        let item = attempt.item;
        if item.is_quarantined() {
            self.deps
                .evidence
                .record_ingestion(item.id, IngestionStatus::Quarantined, last_scan)
                .await?;
        } else {
            self.deps
                .evidence
                .transition(
                    item.id,
                    StatusTransition {
                        to_status: EvidenceStatus::Quarantined,
                        ingestion_status: IngestionStatus::Quarantined,
                        last_scan,
                        note: reason.clone(),
                        changed_by_id: None,
                    },
                )
                .await?;
        }

        self.deps
            .metrics
            .increment(QUARANTINE_TOTAL, &[("reason", metric_reason)]);
        info!(from_status = %item.status, %reason, "Evidence quarantined");

        self.send_notification(EvidenceNotification {
            evidence_id: item.id,
            organization_id: item.organization_id,
            scan_id: attempt.payload.scan_id,
            status: NotificationStatus::Quarantined,
            reason,
            findings,
            requested_by: attempt.payload.requested_by.clone(),
        })
        .await;
        Ok(())
    }

    async fn send_notification(&self, notification: EvidenceNotification) {
        if let Err(e) = self.deps.notifier.notify(&notification).await {
            warn!(
                event_type = notification.status.event_type(),
                error = %e,
                "Failed to deliver evidence notification"
            );
        }
    }

    fn record_scan_metrics(&self, engine: &str, status: ScanStatus, duration_ms: u64) {
        let status = status.as_str().to_lowercase();
        let labels = [("engine", engine), ("status", status.as_str())];
        self.deps.metrics.increment(SCAN_TOTAL, &labels);
        self.deps
            .metrics
            .record_duration(SCAN_DURATION, Duration::from_millis(duration_ms), &labels);
    }
}

fn synthetic_clean(item: &EvidenceItem) -> ScanOutcome {
    ScanOutcome {
        status: ScanStatus::Clean,
        duration_ms: 0,
        bytes_scanned: item.file_size.unwrap_or(0),
        engine_version: None,
        signature_version: None,
        notes: vec!["scanning disabled".to_string()],
        findings: json!({ "engine": SCAN_DISABLED_ENGINE, "skipped": true }),
        signature: None,
    }
}

// =============================================================================
// JOB HANDLER
// =============================================================================

/// `evidence.ingest` job processor.
pub struct EvidenceIngestionHandler {
    pipeline: Arc<IngestionPipeline>,
}

impl EvidenceIngestionHandler {
    pub fn new(pipeline: Arc<IngestionPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl JobHandler for EvidenceIngestionHandler {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        let payload: IngestEvidencePayload = match ctx.parse_payload() {
            Ok(p) => p,
            Err(e) => return JobResult::Failed(format!("invalid ingestion payload: {}", e)),
        };

        match self.pipeline.ingest(&payload).await {
            Ok(IngestionOutcome::EvidenceMissing) => {
                JobResult::Failed(format!("evidence {} not found", payload.evidence_id))
            }
            Ok(outcome) => JobResult::Success(serde_json::to_value(&outcome).ok()),
            Err(e) => JobResult::Failed(e.to_string()),
        }
    }
}

/// Convenience for producers: enqueue an ingestion job.
pub async fn enqueue_ingestion(
    queue: &JobQueue,
    payload: &IngestEvidencePayload,
) -> Result<JobHandle> {
    queue
        .enqueue(JOB_EVIDENCE_INGEST, serde_json::to_value(payload)?)
        .await
}

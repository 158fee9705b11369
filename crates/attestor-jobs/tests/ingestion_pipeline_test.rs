//! Evidence ingestion pipeline tests against in-memory stores and a scripted
//! scanner.
//!
//! Covers:
//! - clean, infected and engine-failure paths
//! - auto-release strategies (manual, pending, previous, deployment default)
//! - missing evidence and disabled scanning
//! - the `evidence.ingest` job wired through the queue

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::broadcast::Receiver;
use uuid::Uuid;

use attestor_core::metrics::{AUTO_RELEASE_TOTAL, QUARANTINE_TOTAL, SCAN_TOTAL};
use attestor_jobs::{
    enqueue_ingestion, AutoReleaseStrategy, BroadcastNotifier, EvidenceIngestionHandler,
    EvidenceItem, EvidenceNotification, EvidenceStatus, EvidenceStore, IngestEvidencePayload,
    IngestionDeps, IngestionOutcome, IngestionPipeline, IngestionPolicy, IngestionStatus,
    InMemoryEvidenceStore, InMemoryMetrics, InMemoryPolicyStore, InMemoryScanRecordStore,
    JobQueue, JobStatus, NotificationStatus, ScanRecordStore, ScanStatus, StatusHistoryEntry,
    StorageProvider, StorageReference,
};
use attestor_scan::{
    ArtifactFetcher, ArtifactHandle, ScanContext, ScanError, ScanOutcome, ScanResult, Scanner,
};

// =============================================================================
// TEST DOUBLES
// =============================================================================

/// Serves the same bytes for every reference.
struct StaticFetcher(&'static [u8]);

#[async_trait]
impl ArtifactFetcher for StaticFetcher {
    async fn fetch(&self, _reference: &StorageReference) -> ScanResult<ArtifactHandle> {
        Ok(ArtifactHandle::from_bytes(self.0.to_vec()))
    }
}

#[derive(Clone, Copy)]
enum Script {
    Clean,
    Infected(&'static str),
    TimedOut,
    Garbled,
}

/// Scanner that returns a scripted verdict and counts invocations.
struct ScriptedScanner {
    script: Mutex<Script>,
    calls: AtomicUsize,
}

impl ScriptedScanner {
    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            calls: AtomicUsize::new(0),
        })
    }

    fn set(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scanner for ScriptedScanner {
    fn engine_name(&self) -> &str {
        "scripted"
    }

    async fn scan(&self, artifact: ArtifactHandle, _ctx: &ScanContext) -> ScanResult<ScanOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = *self.script.lock().unwrap();
        let outcome = |status, signature: Option<&str>| ScanOutcome {
            status,
            duration_ms: 12,
            bytes_scanned: artifact.size.unwrap_or(0),
            engine_version: Some("1.3.1".into()),
            signature_version: Some("27412".into()),
            notes: vec![],
            findings: json!({ "engine": "scripted" }),
            signature: signature.map(str::to_string),
        };
        match script {
            Script::Clean => Ok(outcome(ScanStatus::Clean, None)),
            Script::Infected(sig) => Ok(outcome(ScanStatus::Infected, Some(sig))),
            Script::TimedOut => Err(ScanError::EngineUnavailable(
                "scanner timed out after 500ms".into(),
            )),
            Script::Garbled => Err(ScanError::UnparseableResponse("???".into())),
        }
    }
}

struct Harness {
    evidence: Arc<InMemoryEvidenceStore>,
    scans: Arc<InMemoryScanRecordStore>,
    policies: Arc<InMemoryPolicyStore>,
    scanner: Arc<ScriptedScanner>,
    metrics: Arc<InMemoryMetrics>,
    notifications: Receiver<EvidenceNotification>,
    pipeline: Arc<IngestionPipeline>,
}

fn harness(script: Script, policy: IngestionPolicy) -> Harness {
    let evidence = Arc::new(InMemoryEvidenceStore::new());
    let scans = Arc::new(InMemoryScanRecordStore::new());
    let policies = Arc::new(InMemoryPolicyStore::new());
    let scanner = ScriptedScanner::new(script);
    let metrics = Arc::new(InMemoryMetrics::new());
    let notifier = Arc::new(BroadcastNotifier::new(16));
    let notifications = notifier.subscribe();

    let pipeline = Arc::new(IngestionPipeline::new(
        IngestionDeps {
            evidence: evidence.clone(),
            scans: scans.clone(),
            policies: policies.clone(),
            fetcher: Arc::new(StaticFetcher(b"quarterly access review")),
            scanner: scanner.clone(),
            notifier,
            metrics: metrics.clone(),
        },
        policy,
    ));

    Harness {
        evidence,
        scans,
        policies,
        scanner,
        metrics,
        notifications,
        pipeline,
    }
}

impl Harness {
    async fn seed(&self, status: EvidenceStatus) -> EvidenceItem {
        let mut item = EvidenceItem::new(Uuid::new_v4(), status);
        item.file_size = Some(23);
        self.evidence.insert(item.clone()).await;
        item
    }

    /// Seed an item already quarantined from `prior`.
    async fn seed_quarantined(&self, prior: EvidenceStatus) -> EvidenceItem {
        let item = self.seed(EvidenceStatus::Quarantined).await;
        self.evidence
            .push_history(StatusHistoryEntry::new(
                item.id,
                Some(prior),
                EvidenceStatus::Quarantined,
                Some("malware detected".into()),
                None,
            ))
            .await;
        item
    }

    fn drain_notifications(&mut self) -> Vec<EvidenceNotification> {
        let mut out = Vec::new();
        loop {
            match self.notifications.try_recv() {
                Ok(n) => out.push(n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return out,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
    }
}

fn payload(item: &EvidenceItem) -> IngestEvidencePayload {
    IngestEvidencePayload {
        evidence_id: item.id,
        scan_id: Uuid::new_v4(),
        storage: StorageReference {
            provider: StorageProvider::Local,
            key: format!("evidence/{}.pdf", item.id),
            uri: None,
        },
        checksum: None,
        original_filename: Some("Access Review.pdf".into()),
        requested_by: Some("auditor@example.com".into()),
    }
}

// =============================================================================
// CLEAN PATH
// =============================================================================

#[tokio::test]
async fn test_clean_scan_leaves_status_untouched() {
    let mut h = harness(Script::Clean, IngestionPolicy::default());
    let item = h.seed(EvidenceStatus::Approved).await;
    let p = payload(&item);

    let outcome = h.pipeline.ingest(&p).await.unwrap();
    assert_eq!(
        outcome,
        IngestionOutcome::Clean {
            status: EvidenceStatus::Approved,
            released: false
        }
    );

    let stored = h.evidence.get(item.id).await.unwrap();
    assert_eq!(stored.status, EvidenceStatus::Approved);
    assert_eq!(stored.ingestion_status, Some(IngestionStatus::Completed));
    let last_scan = stored.last_scan.unwrap();
    assert_eq!(last_scan.status, ScanStatus::Clean);
    assert_eq!(last_scan.scan_id, p.scan_id);

    let record = h.scans.get(p.scan_id).await.unwrap();
    assert_eq!(record.status, ScanStatus::Clean);
    assert_eq!(record.bytes_scanned, Some(23));
    assert!(!record.quarantined);

    assert!(h.evidence.history(item.id).await.unwrap().is_empty());
    assert!(h.drain_notifications().is_empty());

    let scans = h.metrics.named(SCAN_TOTAL);
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].label("engine"), Some("scripted"));
    assert_eq!(scans[0].label("status"), Some("clean"));
}

#[tokio::test]
async fn test_scanning_disabled_short_circuits_to_clean() {
    let policy = IngestionPolicy {
        scan_enabled: false,
        ..IngestionPolicy::default()
    };
    let h = harness(Script::Infected("never-seen"), policy);
    let item = h.seed(EvidenceStatus::Pending).await;
    let p = payload(&item);

    let outcome = h.pipeline.ingest(&p).await.unwrap();
    assert!(matches!(outcome, IngestionOutcome::Clean { .. }));
    assert_eq!(h.scanner.calls(), 0);

    let record = h.scans.get(p.scan_id).await.unwrap();
    assert_eq!(record.status, ScanStatus::Clean);
    assert_eq!(record.bytes_scanned, Some(23));
    assert_eq!(record.duration_ms, Some(0));
    assert_eq!(h.metrics.named(SCAN_TOTAL)[0].label("engine"), Some("disabled"));
    assert_eq!(
        h.evidence.get(item.id).await.unwrap().ingestion_status,
        Some(IngestionStatus::Completed)
    );
}

// =============================================================================
// INFECTED PATH
// =============================================================================

#[tokio::test]
async fn test_infected_scan_quarantines_with_one_history_entry() {
    let mut h = harness(Script::Infected("XYZ-Test-Signature"), IngestionPolicy::default());
    let item = h.seed(EvidenceStatus::Approved).await;
    let p = payload(&item);

    let outcome = h.pipeline.ingest(&p).await.unwrap();
    assert_eq!(
        outcome,
        IngestionOutcome::Infected {
            signature: Some("XYZ-Test-Signature".into())
        }
    );

    let stored = h.evidence.get(item.id).await.unwrap();
    assert_eq!(stored.status, EvidenceStatus::Quarantined);
    assert_eq!(stored.ingestion_status, Some(IngestionStatus::Quarantined));
    assert_eq!(
        stored.last_scan.unwrap().signature.as_deref(),
        Some("XYZ-Test-Signature")
    );

    let history = h.evidence.history(item.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from_status, Some(EvidenceStatus::Approved));
    assert_eq!(history[0].to_status, EvidenceStatus::Quarantined);

    let record = h.scans.get(p.scan_id).await.unwrap();
    assert_eq!(record.status, ScanStatus::Infected);
    assert!(record.quarantined);

    let notifications = h.drain_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].status, NotificationStatus::Quarantined);
    assert!(notifications[0].reason.contains("XYZ-Test-Signature"));
    assert_eq!(notifications[0].requested_by.as_deref(), Some("auditor@example.com"));

    let quarantines = h.metrics.named(QUARANTINE_TOTAL);
    assert_eq!(quarantines.len(), 1);
    assert_eq!(quarantines[0].label("reason"), Some("infected"));
}

#[tokio::test]
async fn test_infected_rescan_of_quarantined_item_adds_no_history() {
    let mut h = harness(Script::Infected("XYZ-Test-Signature"), IngestionPolicy::default());
    let item = h.seed_quarantined(EvidenceStatus::Pending).await;

    h.pipeline.ingest(&payload(&item)).await.unwrap();

    assert_eq!(h.evidence.history(item.id).await.unwrap().len(), 1);
    let stored = h.evidence.get(item.id).await.unwrap();
    assert_eq!(stored.status, EvidenceStatus::Quarantined);
    assert_eq!(stored.ingestion_status, Some(IngestionStatus::Quarantined));
    assert_eq!(h.drain_notifications().len(), 1);
}

// =============================================================================
// ENGINE FAILURE PATH
// =============================================================================

#[tokio::test]
async fn test_timeout_quarantines_when_policy_requires() {
    let mut h = harness(Script::TimedOut, IngestionPolicy::default());
    let item = h.seed(EvidenceStatus::Pending).await;
    let p = payload(&item);

    let outcome = h.pipeline.ingest(&p).await.unwrap();
    match outcome {
        IngestionOutcome::ScanFailed {
            category,
            quarantined,
            ..
        } => {
            assert_eq!(category, "engine_unavailable");
            assert!(quarantined);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    let stored = h.evidence.get(item.id).await.unwrap();
    assert_eq!(stored.status, EvidenceStatus::Quarantined);
    assert_eq!(h.evidence.history(item.id).await.unwrap().len(), 1);

    let record = h.scans.get(p.scan_id).await.unwrap();
    assert_eq!(record.status, ScanStatus::Failed);
    assert!(record.failure_reason.unwrap().contains("timed out"));
    assert_eq!(record.findings.unwrap()["errorCategory"], "engine_unavailable");

    let notifications = h.drain_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(
        notifications[0].findings.as_ref().unwrap()["errorCategory"],
        "engine_unavailable"
    );
    assert_eq!(h.metrics.named(SCAN_TOTAL)[0].label("status"), Some("failed"));
}

#[tokio::test]
async fn test_engine_failure_without_quarantine_policy_completes() {
    let policy = IngestionPolicy {
        quarantine_on_error: false,
        ..IngestionPolicy::default()
    };
    let mut h = harness(Script::Garbled, policy);
    let item = h.seed(EvidenceStatus::Approved).await;
    let p = payload(&item);

    let outcome = h.pipeline.ingest(&p).await.unwrap();
    assert!(matches!(
        outcome,
        IngestionOutcome::ScanFailed {
            quarantined: false,
            ..
        }
    ));

    let stored = h.evidence.get(item.id).await.unwrap();
    assert_eq!(stored.status, EvidenceStatus::Approved);
    assert_eq!(stored.ingestion_status, Some(IngestionStatus::Completed));
    assert_eq!(stored.last_scan.unwrap().status, ScanStatus::Failed);

    let record = h.scans.get(p.scan_id).await.unwrap();
    assert_eq!(record.findings.unwrap()["errorCategory"], "unparseable_response");
    assert!(h.drain_notifications().is_empty());
    assert!(h.evidence.history(item.id).await.unwrap().is_empty());
}

// =============================================================================
// AUTO-RELEASE
// =============================================================================

#[tokio::test]
async fn test_previous_strategy_restores_prior_status() {
    let mut h = harness(Script::Clean, IngestionPolicy::default());
    let item = h.seed_quarantined(EvidenceStatus::Approved).await;
    h.policies.set(item.organization_id, AutoReleaseStrategy::Previous).await;

    let outcome = h.pipeline.ingest(&payload(&item)).await.unwrap();
    assert_eq!(
        outcome,
        IngestionOutcome::Clean {
            status: EvidenceStatus::Approved,
            released: true
        }
    );

    let stored = h.evidence.get(item.id).await.unwrap();
    assert_eq!(stored.status, EvidenceStatus::Approved);
    assert_eq!(stored.ingestion_status, Some(IngestionStatus::Completed));

    let history = h.evidence.history(item.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].from_status, Some(EvidenceStatus::Quarantined));
    assert_eq!(history[1].to_status, EvidenceStatus::Approved);

    let notifications = h.drain_notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].status, NotificationStatus::Released);

    let releases = h.metrics.named(AUTO_RELEASE_TOTAL);
    assert_eq!(releases.len(), 1);
    assert_eq!(releases[0].label("strategy"), Some("previous"));
    assert_eq!(releases[0].label("status"), Some("APPROVED"));
}

#[tokio::test]
async fn test_previous_strategy_without_history_falls_back_to_pending() {
    let h = harness(Script::Clean, IngestionPolicy::default());
    let item = h.seed(EvidenceStatus::Quarantined).await;
    h.policies.set(item.organization_id, AutoReleaseStrategy::Previous).await;

    h.pipeline.ingest(&payload(&item)).await.unwrap();
    assert_eq!(
        h.evidence.get(item.id).await.unwrap().status,
        EvidenceStatus::Pending
    );
}

#[tokio::test]
async fn test_manual_strategy_holds_quarantine() {
    let mut h = harness(Script::Clean, IngestionPolicy::default());
    let item = h.seed_quarantined(EvidenceStatus::Approved).await;
    h.policies.set(item.organization_id, AutoReleaseStrategy::Manual).await;

    let outcome = h.pipeline.ingest(&payload(&item)).await.unwrap();
    assert_eq!(
        outcome,
        IngestionOutcome::Clean {
            status: EvidenceStatus::Quarantined,
            released: false
        }
    );

    let stored = h.evidence.get(item.id).await.unwrap();
    assert_eq!(stored.status, EvidenceStatus::Quarantined);
    assert_eq!(stored.ingestion_status, Some(IngestionStatus::Completed));
    assert_eq!(h.evidence.history(item.id).await.unwrap().len(), 1);
    assert!(h.drain_notifications().is_empty());
    assert!(h.metrics.named(AUTO_RELEASE_TOTAL).is_empty());
}

#[tokio::test]
async fn test_deployment_default_strategy_applies_without_org_policy() {
    let policy = IngestionPolicy {
        default_strategy: AutoReleaseStrategy::Manual,
        ..IngestionPolicy::default()
    };
    let h = harness(Script::Clean, policy);
    let item = h.seed_quarantined(EvidenceStatus::Approved).await;

    h.pipeline.ingest(&payload(&item)).await.unwrap();
    assert_eq!(
        h.evidence.get(item.id).await.unwrap().status,
        EvidenceStatus::Quarantined
    );
}

#[tokio::test]
async fn test_quarantine_then_release_round() {
    let mut h = harness(Script::Infected("Eicar-Test-Signature"), IngestionPolicy::default());
    let item = h.seed(EvidenceStatus::Approved).await;
    h.policies.set(item.organization_id, AutoReleaseStrategy::Previous).await;

    h.pipeline.ingest(&payload(&item)).await.unwrap();
    h.scanner.set(Script::Clean);
    h.pipeline.ingest(&payload(&item)).await.unwrap();

    let history = h.evidence.history(item.id).await.unwrap();
    let into: Vec<_> = history
        .iter()
        .filter(|e| e.to_status == EvidenceStatus::Quarantined)
        .collect();
    let out_of: Vec<_> = history
        .iter()
        .filter(|e| e.from_status == Some(EvidenceStatus::Quarantined))
        .collect();
    assert_eq!(into.len(), 1);
    assert_eq!(out_of.len(), 1);
    assert_eq!(
        h.evidence.get(item.id).await.unwrap().status,
        EvidenceStatus::Approved
    );

    let kinds: Vec<_> = h.drain_notifications().into_iter().map(|n| n.status).collect();
    assert_eq!(
        kinds,
        vec![NotificationStatus::Quarantined, NotificationStatus::Released]
    );
}

// =============================================================================
// MISSING EVIDENCE / JOB WIRING
// =============================================================================

#[tokio::test]
async fn test_missing_evidence_fails_scan_record() {
    let h = harness(Script::Clean, IngestionPolicy::default());
    let ghost = EvidenceItem::new(Uuid::new_v4(), EvidenceStatus::Pending);
    let p = payload(&ghost);

    let outcome = h.pipeline.ingest(&p).await.unwrap();
    assert_eq!(outcome, IngestionOutcome::EvidenceMissing);
    assert_eq!(h.scanner.calls(), 0);

    let record = h.scans.get(p.scan_id).await.unwrap();
    assert_eq!(record.status, ScanStatus::Failed);
    assert_eq!(record.failure_reason.as_deref(), Some("evidence not found"));
}

#[tokio::test]
async fn test_ingest_job_through_queue() {
    let h = harness(Script::Infected("XYZ-Test-Signature"), IngestionPolicy::default());
    let queue = JobQueue::new(4);
    queue
        .register_processor(
            "evidence.ingest",
            Arc::new(EvidenceIngestionHandler::new(h.pipeline.clone())),
        )
        .await
        .unwrap();

    let item = h.seed(EvidenceStatus::Pending).await;
    let job = enqueue_ingestion(&queue, &payload(&item))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.unwrap();
    assert_eq!(result["outcome"], "infected");
    assert_eq!(result["signature"], "XYZ-Test-Signature");

    // Missing evidence fails the job without retry
    let ghost = EvidenceItem::new(Uuid::new_v4(), EvidenceStatus::Pending);
    let job = enqueue_ingestion(&queue, &payload(&ghost))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("not found"));
    assert_eq!(queue.list("evidence.ingest").await.len(), 2);
}

#[tokio::test]
async fn test_malformed_payload_fails_job() {
    let h = harness(Script::Clean, IngestionPolicy::default());
    let queue = JobQueue::new(1);
    queue
        .register_processor(
            "evidence.ingest",
            Arc::new(EvidenceIngestionHandler::new(h.pipeline.clone())),
        )
        .await
        .unwrap();

    let job = queue
        .enqueue("evidence.ingest", json!({ "evidenceId": "not-a-uuid" }))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.unwrap().contains("invalid ingestion payload"));
}

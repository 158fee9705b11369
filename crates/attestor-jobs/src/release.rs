//! Auto-release policy for evidence leaving quarantine after a clean re-scan.

use uuid::Uuid;

use attestor_core::{AutoReleaseStrategy, EvidenceStatus, EvidenceStore, Result};

/// What to do with a quarantined item whose re-scan came back clean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseDecision {
    /// Stay quarantined until an operator acts.
    Hold,
    /// Move to the given status.
    Release(EvidenceStatus),
}

/// Resolve the release target for `evidence_id` under `strategy`.
///
/// `Previous` restores the `from_status` of the most recent history entry
/// into `QUARANTINED`, falling back to `PENDING` when there is none.
pub async fn resolve_release(
    strategy: AutoReleaseStrategy,
    evidence_id: Uuid,
    store: &dyn EvidenceStore,
) -> Result<ReleaseDecision> {
    match strategy {
        AutoReleaseStrategy::Manual => Ok(ReleaseDecision::Hold),
        AutoReleaseStrategy::Pending => Ok(ReleaseDecision::Release(EvidenceStatus::Pending)),
        AutoReleaseStrategy::Previous => {
            let restored = store
                .latest_quarantine_entry(evidence_id)
                .await?
                .and_then(|entry| entry.from_status)
                .filter(|status| *status != EvidenceStatus::Quarantined)
                .unwrap_or(EvidenceStatus::Pending);
            Ok(ReleaseDecision::Release(restored))
        }
    }
}

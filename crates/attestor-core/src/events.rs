//! In-process notifiers for evidence quarantine and release events.
//!
//! [`BroadcastNotifier`] fans notifications out over a tokio broadcast
//! channel so several consumers (webhooks, audit, tests) can subscribe
//! independently. [`LogNotifier`] only records the event in the log.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::Result;
use crate::models::EvidenceNotification;
use crate::traits::Notifier;

/// Broadcast-backed notifier.
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<EvidenceNotification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Each subscriber gets its own independent stream.
    pub fn subscribe(&self) -> broadcast::Receiver<EvidenceNotification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl Notifier for BroadcastNotifier {
    async fn notify(&self, notification: &EvidenceNotification) -> Result<()> {
        tracing::debug!(
            event_type = notification.status.event_type(),
            evidence_id = %notification.evidence_id,
            subscriber_count = self.tx.receiver_count(),
            "Notification broadcast"
        );
        // No subscribers is not an error
        let _ = self.tx.send(notification.clone());
        Ok(())
    }
}

/// Notifier that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &EvidenceNotification) -> Result<()> {
        info!(
            event_type = notification.status.event_type(),
            evidence_id = %notification.evidence_id,
            organization_id = %notification.organization_id,
            scan_id = %notification.scan_id,
            reason = %notification.reason,
            "Evidence notification"
        );
        Ok(())
    }
}

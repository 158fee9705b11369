//! Per-type schedule handlers.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use attestor_core::defaults::{JOB_EVIDENCE_REMINDER, JOB_FRAMEWORK_PUBLISH, JOB_REASSESSMENT_DRAFT};
use attestor_core::metrics::HEALTH_CHECK_TOTAL;
use attestor_core::{MetricsSink, Result, Schedule, ScheduleType};

use crate::queue::JobQueue;

/// Executes one firing of a schedule.
///
/// The returned value is persisted as the execution result. An error leaves
/// the schedule's `next_run` untouched.
#[async_trait]
pub trait ScheduleHandler: Send + Sync {
    async fn handle(&self, schedule: &Schedule) -> Result<JsonValue>;
}

/// One handler per [`ScheduleType`].
#[derive(Clone)]
pub struct ScheduleHandlers {
    pub evidence_reminder: Arc<dyn ScheduleHandler>,
    pub health_check: Arc<dyn ScheduleHandler>,
    pub reassessment_draft: Arc<dyn ScheduleHandler>,
    pub framework_publish: Arc<dyn ScheduleHandler>,
}

impl ScheduleHandlers {
    /// Standard wiring: automation types become jobs on `queue`, health checks
    /// report queue statistics.
    pub fn standard(queue: JobQueue, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            evidence_reminder: Arc::new(EnqueueJobHandler::new(queue.clone(), JOB_EVIDENCE_REMINDER)),
            health_check: Arc::new(HealthCheckHandler::new(queue.clone(), metrics)),
            reassessment_draft: Arc::new(EnqueueJobHandler::new(queue.clone(), JOB_REASSESSMENT_DRAFT)),
            framework_publish: Arc::new(EnqueueJobHandler::new(queue, JOB_FRAMEWORK_PUBLISH)),
        }
    }

    pub fn for_type(&self, schedule_type: ScheduleType) -> &Arc<dyn ScheduleHandler> {
        match schedule_type {
            ScheduleType::EvidenceReminder => &self.evidence_reminder,
            ScheduleType::HealthCheck => &self.health_check,
            ScheduleType::ReassessmentDraft => &self.reassessment_draft,
            ScheduleType::FrameworkPublish => &self.framework_publish,
        }
    }

    pub async fn handle(&self, schedule: &Schedule) -> Result<JsonValue> {
        self.for_type(schedule.schedule_type).handle(schedule).await
    }
}

// =============================================================================
// ENQUEUE
// =============================================================================

/// Hands the firing to a named job. The job payload carries the schedule
/// identity and options so the job handler needs no schedule lookup.
pub struct EnqueueJobHandler {
    queue: JobQueue,
    job_name: &'static str,
}

impl EnqueueJobHandler {
    pub fn new(queue: JobQueue, job_name: &'static str) -> Self {
        Self { queue, job_name }
    }
}

#[async_trait]
impl ScheduleHandler for EnqueueJobHandler {
    async fn handle(&self, schedule: &Schedule) -> Result<JsonValue> {
        let payload = json!({
            "scheduleId": schedule.id,
            "organizationId": schedule.organization_id,
            "scheduleName": schedule.name,
            "scheduleType": schedule.schedule_type,
            "owner": schedule.owner,
            "dueAt": schedule.next_run,
            "options": schedule.options,
        });
        let handle = self.queue.enqueue(self.job_name, payload).await?;
        debug!(
            schedule_id = %schedule.id,
            job_name = self.job_name,
            job_id = %handle.id(),
            "Schedule enqueued job"
        );
        Ok(json!({ "jobName": self.job_name, "jobId": handle.id() }))
    }
}

// =============================================================================
// HEALTH CHECK
// =============================================================================

pub struct HealthCheckHandler {
    queue: JobQueue,
    metrics: Arc<dyn MetricsSink>,
}

impl HealthCheckHandler {
    pub fn new(queue: JobQueue, metrics: Arc<dyn MetricsSink>) -> Self {
        Self { queue, metrics }
    }
}

#[async_trait]
impl ScheduleHandler for HealthCheckHandler {
    async fn handle(&self, schedule: &Schedule) -> Result<JsonValue> {
        let stats = self.queue.stats().await;
        let status = if self.queue.is_closed() { "degraded" } else { "ok" };
        self.metrics.increment(HEALTH_CHECK_TOTAL, &[("status", status)]);
        info!(
            schedule_id = %schedule.id,
            status,
            queued = stats.queued,
            running = stats.running,
            completed = stats.completed,
            failed = stats.failed,
            "Worker health check"
        );
        Ok(json!({
            "status": status,
            "queue": stats,
            "maxConcurrent": self.queue.max_concurrent(),
        }))
    }
}

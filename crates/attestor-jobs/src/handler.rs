//! Job handler trait and the context handed to each invocation.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use tracing::{info, warn};

use attestor_core::defaults::JOB_ATTEMPT_FIELD;
use attestor_core::{Job, Result};

use crate::queue::{JobHandle, JobQueue};

/// Context provided to job handlers.
pub struct JobContext {
    /// Read view of the job being processed.
    pub job: Job,
    queue: JobQueue,
}

impl JobContext {
    pub(crate) fn new(job: Job, queue: JobQueue) -> Self {
        Self { job, queue }
    }

    pub fn payload(&self) -> &JsonValue {
        &self.job.payload
    }

    /// Deserialize the payload into a typed struct.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.job.payload.clone())?)
    }

    /// 1-based attempt counter carried in the payload.
    pub fn attempt(&self) -> u32 {
        self.job.attempt()
    }

    /// Queue the job is running on, for handlers that fan out further work.
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Re-enqueue this job's payload under the same name with the attempt
    /// counter incremented.
    ///
    /// Returns `Ok(None)` once `max_attempts` has been reached. The retry is a
    /// new job with a new id; this job still ends as failed.
    pub async fn requeue(&self, max_attempts: u32) -> Result<Option<JobHandle>> {
        let attempt = self.attempt();
        if attempt >= max_attempts {
            warn!(
                job_id = %self.job.id,
                job_name = %self.job.name,
                attempt,
                max_attempts,
                "Retry budget exhausted, not requeueing"
            );
            return Ok(None);
        }

        let mut payload = match self.job.payload.clone() {
            JsonValue::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        payload.insert(JOB_ATTEMPT_FIELD.to_string(), JsonValue::from(attempt + 1));

        let handle = self
            .queue
            .enqueue(&self.job.name, JsonValue::Object(payload))
            .await?;
        info!(
            job_id = %self.job.id,
            retry_job_id = %handle.id(),
            job_name = %self.job.name,
            next_attempt = attempt + 1,
            "Job requeued"
        );
        Ok(Some(handle))
    }
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    /// Job completed successfully with optional result data.
    Success(Option<JsonValue>),
    /// Job failed with an error message.
    Failed(String),
}

/// Trait for job handlers.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job.
    async fn execute(&self, ctx: JobContext) -> JobResult;
}

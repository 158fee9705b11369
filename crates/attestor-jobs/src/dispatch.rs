//! Automation dispatch job: hands reminders, re-assessment drafts and
//! framework publications to an external webhook, re-enqueueing itself on
//! failure up to a bounded attempt count.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::handler::{JobContext, JobHandler, JobResult};
use crate::webhook::WebhookClient;

pub struct WebhookDispatchHandler {
    client: Option<WebhookClient>,
    max_attempts: u32,
}

impl WebhookDispatchHandler {
    /// With `client = None` jobs are logged and completed without delivery.
    pub fn new(client: Option<WebhookClient>, max_attempts: u32) -> Self {
        Self {
            client,
            max_attempts: max_attempts.max(1),
        }
    }
}

#[async_trait]
impl JobHandler for WebhookDispatchHandler {
    async fn execute(&self, ctx: JobContext) -> JobResult {
        let attempt = ctx.attempt();
        let Some(client) = &self.client else {
            info!(
                job_id = %ctx.job.id,
                job_name = %ctx.job.name,
                "No automation webhook configured, dispatch skipped"
            );
            return JobResult::Success(Some(json!({ "delivered": false })));
        };

        match client.deliver(&ctx.job.name, ctx.payload()).await {
            Ok(status) => JobResult::Success(Some(json!({
                "delivered": true,
                "status": status,
                "attempt": attempt,
            }))),
            Err(e) => match ctx.requeue(self.max_attempts).await {
                Ok(Some(retry)) => JobResult::Failed(format!(
                    "attempt {} failed: {}; requeued as {}",
                    attempt,
                    e,
                    retry.id()
                )),
                Ok(None) => JobResult::Failed(format!(
                    "attempt {} failed: {}; giving up after {} attempts",
                    attempt, e, self.max_attempts
                )),
                Err(requeue_err) => JobResult::Failed(format!(
                    "attempt {} failed: {}; requeue failed: {}",
                    attempt, e, requeue_err
                )),
            },
        }
    }
}

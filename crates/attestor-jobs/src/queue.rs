//! In-process named job queue.
//!
//! Producers enqueue `(name, payload)`; the queue resolves the registered
//! handler for that name and runs it on its own task. Running handlers are
//! bounded by a semaphore sized from `JOB_MAX_CONCURRENT`; jobs waiting for a
//! permit stay `queued`. Only the most recent terminal jobs are retained.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, oneshot, RwLock, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use attestor_core::defaults::{EVENT_BUS_CAPACITY, JOB_RETAINED_TERMINAL};
use attestor_core::{Error, Job, JobStatus, QueueStats, Result};

use crate::handler::{JobContext, JobHandler, JobResult};

/// Event emitted by the job queue.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    JobQueued { job_id: Uuid, name: String },
    JobStarted { job_id: Uuid, name: String },
    JobCompleted { job_id: Uuid, name: String },
    JobFailed { job_id: Uuid, name: String, error: String },
}

/// Awaitable handle returned by [`JobQueue::enqueue`].
#[derive(Debug)]
pub struct JobHandle {
    id: Uuid,
    done: oneshot::Receiver<Job>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the job to reach a terminal status.
    pub async fn wait(self) -> Result<Job> {
        self.done
            .await
            .map_err(|_| Error::Job(format!("job {} dropped before completion", self.id)))
    }
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<Uuid, Job>,
    order: Vec<Uuid>,
    terminal: usize,
}

impl JobTable {
    /// Drop the oldest terminal jobs until at most `retain` remain.
    fn prune_terminal(&mut self, retain: usize) -> usize {
        let mut excess = self.terminal.saturating_sub(retain);
        if excess == 0 {
            return 0;
        }
        let pruned = excess;
        let jobs = &mut self.jobs;
        self.order.retain(|id| {
            if excess == 0 {
                return true;
            }
            match jobs.get(id) {
                Some(job) if job.status.is_terminal() => {
                    jobs.remove(id);
                    excess -= 1;
                    false
                }
                _ => true,
            }
        });
        self.terminal -= pruned;
        pruned
    }
}

struct QueueInner {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    table: RwLock<JobTable>,
    permits: Arc<Semaphore>,
    event_tx: broadcast::Sender<QueueEvent>,
    max_concurrent: usize,
    retained_terminal: usize,
}

/// Named job dispatcher. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self::with_retention(max_concurrent, JOB_RETAINED_TERMINAL)
    }

    /// Like [`JobQueue::new`], keeping at most `retained_terminal` completed
    /// or failed jobs.
    pub fn with_retention(max_concurrent: usize, retained_terminal: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            inner: Arc::new(QueueInner {
                handlers: RwLock::new(HashMap::new()),
                table: RwLock::new(JobTable::default()),
                permits: Arc::new(Semaphore::new(max_concurrent)),
                event_tx,
                max_concurrent,
                retained_terminal,
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Bind a handler to a job name. Re-registering a name is an error.
    pub async fn register_processor(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<()> {
        let name = name.into();
        let mut handlers = self.inner.handlers.write().await;
        if handlers.contains_key(&name) {
            return Err(Error::DuplicateProcessor(name));
        }
        debug!(job_name = %name, "Registered job processor");
        handlers.insert(name, handler);
        Ok(())
    }

    /// Names with a registered processor, sorted.
    pub async fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Create a queued job and schedule its execution without waiting for it.
    ///
    /// Fails immediately with [`Error::UnknownProcessor`] when no handler is
    /// registered for `name`.
    pub async fn enqueue(&self, name: &str, payload: JsonValue) -> Result<JobHandle> {
        let handler = self
            .inner
            .handlers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownProcessor(name.to_string()))?;

        let job = Job::new(name, payload);
        let job_id = job.id;
        {
            let mut table = self.inner.table.write().await;
            table.order.push(job_id);
            table.jobs.insert(job_id, job);
        }
        debug!(%job_id, job_name = name, "Job enqueued");
        let _ = self.inner.event_tx.send(QueueEvent::JobQueued {
            job_id,
            name: name.to_string(),
        });

        let (done_tx, done_rx) = oneshot::channel();
        let queue = self.clone();
        tokio::spawn(async move {
            queue.run_job(job_id, handler, done_tx).await;
        });

        Ok(JobHandle {
            id: job_id,
            done: done_rx,
        })
    }

    pub async fn get(&self, id: Uuid) -> Option<Job> {
        self.inner.table.read().await.jobs.get(&id).cloned()
    }

    /// Jobs with the given name, in enqueue order.
    pub async fn list(&self, name: &str) -> Vec<Job> {
        let table = self.inner.table.read().await;
        table
            .order
            .iter()
            .filter_map(|id| table.jobs.get(id))
            .filter(|job| job.name == name)
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> QueueStats {
        let table = self.inner.table.read().await;
        let mut stats = QueueStats::default();
        for job in table.jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Subscribe to queue lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Stop starting new jobs. Jobs still waiting for a permit fail; running
    /// jobs finish normally.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    async fn run_job(
        &self,
        job_id: Uuid,
        handler: Arc<dyn JobHandler>,
        done_tx: oneshot::Sender<Job>,
    ) {
        let _permit = match self.inner.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                // Queue closed while waiting: skip straight to failed
                if let Some(job) = self.mark_running(job_id).await {
                    debug!(%job_id, job_name = %job.name, "Queue closed before job started");
                }
                let job = self
                    .finish(job_id, JobResult::Failed("job queue closed".to_string()))
                    .await;
                if let Some(job) = job {
                    let _ = done_tx.send(job);
                }
                return;
            }
        };

        let Some(job) = self.mark_running(job_id).await else {
            error!(%job_id, "Job vanished before execution");
            return;
        };
        let name = job.name.clone();
        let start = Instant::now();
        info!(%job_id, job_name = %name, attempt = job.attempt(), "Processing job");
        let _ = self.inner.event_tx.send(QueueEvent::JobStarted {
            job_id,
            name: name.clone(),
        });

        // Inner task so a panicking handler surfaces as a JoinError
        let ctx = JobContext::new(job, self.clone());
        let result = match tokio::spawn(async move { handler.execute(ctx).await }).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                error!(%job_id, job_name = %name, panic = %message, "Job handler panicked");
                JobResult::Failed(format!("handler panicked: {}", message))
            }
            Err(e) => JobResult::Failed(format!("handler task cancelled: {}", e)),
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            JobResult::Success(_) => {
                info!(%job_id, job_name = %name, duration_ms, "Job completed successfully")
            }
            JobResult::Failed(error) => {
                warn!(%job_id, job_name = %name, %error, duration_ms, "Job failed")
            }
        }

        if let Some(job) = self.finish(job_id, result).await {
            let _ = done_tx.send(job);
        }
    }

    async fn mark_running(&self, job_id: Uuid) -> Option<Job> {
        let status = JobStatus::Running;
        let mut table = self.inner.table.write().await;
        let job = table.jobs.get_mut(&job_id)?;
        if !job.status.can_transition_to(status) {
            error!(%job_id, from = %job.status, to = %status, "Illegal job transition");
            return None;
        }
        job.status = status;
        job.started_at = Some(Utc::now());
        Some(job.clone())
    }

    async fn finish(&self, job_id: Uuid, result: JobResult) -> Option<Job> {
        let job = {
            let mut table = self.inner.table.write().await;
            let job = table.jobs.get_mut(&job_id)?;
            let status = match result {
                JobResult::Success(_) => JobStatus::Completed,
                JobResult::Failed(_) => JobStatus::Failed,
            };
            if !job.status.can_transition_to(status) {
                error!(%job_id, from = %job.status, to = %status, "Illegal job transition");
                return None;
            }
            job.status = status;
            job.completed_at = Some(Utc::now());
            match result {
                JobResult::Success(data) => job.result = data,
                JobResult::Failed(error) => job.error = Some(error),
            }
            let job = job.clone();
            table.terminal += 1;
            let pruned = table.prune_terminal(self.inner.retained_terminal);
            if pruned > 0 {
                debug!(pruned, "Pruned retained terminal jobs");
            }
            job
        };

        let event = match job.status {
            JobStatus::Completed => QueueEvent::JobCompleted {
                job_id,
                name: job.name.clone(),
            },
            _ => QueueEvent::JobFailed {
                job_id,
                name: job.name.clone(),
                error: job.error.clone().unwrap_or_default(),
            },
        };
        let _ = self.inner.event_tx.send(event);
        Some(job)
    }
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

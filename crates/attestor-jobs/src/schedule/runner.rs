//! Timer-per-schedule runner.
//!
//! Each active schedule owns one timer task, armed for
//! `max(0, next_run - now)` and tied to a child of the runner's root
//! [`CancellationToken`]. A timer that wakes re-checks its token under the
//! timer-map lock before firing, so a cancelled timer never fires.
//!
//! On handler success the runner advances `next_run` from the previous
//! `next_run` (not from the wall clock), persists the execution and re-arms
//! from the schedule the store returns. On handler failure the entry stays
//! in the map, inert, until the next refresh re-arms it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use attestor_core::{Error, Result, Schedule, ScheduleExecution, ScheduleStore};

use super::handlers::ScheduleHandlers;
use crate::queue::panic_message;

struct TimerEntry {
    token: CancellationToken,
    generation: u64,
    firing: bool,
    /// Fired without advancing; the next refresh re-arms it.
    spent: bool,
    /// Schedule this timer was armed with.
    armed: Schedule,
}

enum FireFailure {
    Handler(Error),
    Panic(String),
    Persist(Error),
}

#[derive(Default)]
struct TimerTable {
    entries: HashMap<Uuid, TimerEntry>,
    next_generation: u64,
}

struct RunnerInner {
    store: Arc<dyn ScheduleStore>,
    handlers: ScheduleHandlers,
    refresh_interval: Duration,
    root: CancellationToken,
    timers: Mutex<TimerTable>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

/// Fires schedule handlers on their own cadence.
#[derive(Clone)]
pub struct ScheduleRunner {
    inner: Arc<RunnerInner>,
}

impl ScheduleRunner {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        handlers: ScheduleHandlers,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                store,
                handlers,
                refresh_interval,
                root: CancellationToken::new(),
                timers: Mutex::new(TimerTable::default()),
                refresh_task: Mutex::new(None),
            }),
        }
    }

    /// Load active schedules, arm their timers and start the refresh loop.
    ///
    /// Returns the number of schedules armed. A failure of this first listing
    /// is returned to the caller; later refresh failures are only logged.
    pub async fn start(&self) -> Result<usize> {
        let armed = self.inner.refresh().await?;
        info!(
            armed,
            refresh_interval_secs = self.inner.refresh_interval.as_secs(),
            "Schedule runner started"
        );

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move { inner.refresh_loop().await });
        if let Some(previous) = self.inner.lock_refresh_task().replace(task) {
            previous.abort();
        }
        Ok(armed)
    }

    /// Re-list active schedules now.
    pub async fn refresh(&self) -> Result<usize> {
        self.inner.refresh().await
    }

    /// Arm (or re-arm) the timer for one schedule. Inactive schedules are
    /// removed instead.
    pub fn register(&self, schedule: Schedule) {
        self.inner.register(schedule, false);
    }

    /// Cancel and forget the timer for `id`.
    pub fn unregister(&self, id: Uuid) -> bool {
        self.inner.remove(id)
    }

    /// Ids with an armed or firing timer, sorted.
    pub fn registered_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.inner.lock_timers().entries.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    /// Cancel every timer and the refresh loop.
    ///
    /// Synchronous: once this returns no timer will start a new firing.
    /// Firings already in progress run to completion but do not re-arm.
    pub fn shutdown(&self) {
        let mut timers = self.inner.lock_timers();
        self.inner.root.cancel();
        let cancelled = timers.entries.len();
        timers.entries.clear();
        drop(timers);

        if let Some(task) = self.inner.lock_refresh_task().take() {
            task.abort();
        }
        info!(cancelled, "Schedule runner stopped");
    }
}

impl RunnerInner {
    fn lock_timers(&self) -> MutexGuard<'_, TimerTable> {
        // Critical sections never panic; recover the table if one ever does
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_refresh_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.refresh_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn refresh_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; start() already refreshed
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = self.root.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        error!(error = %e, "Schedule refresh failed");
                    }
                }
            }
        }
        debug!("Schedule refresh loop stopped");
    }

    /// Cancel timers for schedules no longer active and re-arm the rest.
    /// Returns the number of timers (re)armed.
    #[instrument(skip(self))]
    async fn refresh(self: &Arc<Self>) -> Result<usize> {
        let schedules = self.store.list_active().await?;
        let active: HashSet<Uuid> = schedules.iter().map(|s| s.id).collect();

        {
            let mut timers = self.lock_timers();
            timers.entries.retain(|id, entry| {
                let keep = active.contains(id);
                if !keep {
                    entry.token.cancel();
                    info!(schedule_id = %id, "Schedule no longer active, timer cancelled");
                }
                keep
            });
        }

        let mut armed = 0;
        for schedule in schedules {
            if self.register(schedule, true) {
                armed += 1;
            }
        }
        debug!(active = active.len(), armed, "Schedules refreshed");
        Ok(armed)
    }

    /// Returns whether a timer was (re)armed.
    ///
    /// From a refresh, an existing timer is left alone while it is firing
    /// (it re-arms itself). A timer that is not spent is also left alone when
    /// armed with the same schedule or from an execution newer than the
    /// listed snapshot.
    fn register(self: &Arc<Self>, schedule: Schedule, from_refresh: bool) -> bool {
        let mut timers = self.lock_timers();
        if self.root.is_cancelled() {
            return false;
        }

        if let Some(existing) = timers.entries.get(&schedule.id) {
            let unchanged = existing.firing
                || (!existing.spent
                    && (existing.armed == schedule
                        || existing.armed.last_run > schedule.last_run));
            if from_refresh && unchanged {
                return false;
            }
        }
        if let Some(old) = timers.entries.remove(&schedule.id) {
            old.token.cancel();
        }
        if !schedule.is_active {
            debug!(schedule_id = %schedule.id, "Inactive schedule not armed");
            return false;
        }

        let token = self.root.child_token();
        let generation = timers.next_generation;
        timers.next_generation += 1;
        timers.entries.insert(
            schedule.id,
            TimerEntry {
                token: token.clone(),
                generation,
                firing: false,
                spent: false,
                armed: schedule.clone(),
            },
        );
        drop(timers);

        let delay = schedule.delay_until_due(Utc::now());
        debug!(
            schedule_id = %schedule.id,
            schedule_type = %schedule.schedule_type,
            next_run = %schedule.next_run,
            delay_ms = delay.as_millis() as u64,
            "Schedule timer armed"
        );
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_timer(schedule, token, generation, delay).await });
        true
    }

    fn remove(&self, id: Uuid) -> bool {
        match self.lock_timers().entries.remove(&id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_timer(
        self: Arc<Self>,
        schedule: Schedule,
        token: CancellationToken,
        generation: u64,
        delay: Duration,
    ) {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        if !self.begin_firing(schedule.id, &token, generation) {
            return;
        }
        self.fire(schedule, token, generation).await;
    }

    /// Mark the entry as firing, unless it was cancelled or replaced while
    /// the timer slept.
    fn begin_firing(&self, id: Uuid, token: &CancellationToken, generation: u64) -> bool {
        let mut timers = self.lock_timers();
        if token.is_cancelled() {
            return false;
        }
        match timers.entries.get_mut(&id) {
            Some(entry) if entry.generation == generation => {
                entry.firing = true;
                true
            }
            _ => false,
        }
    }

    fn mark_spent(&self, id: Uuid, generation: u64) {
        if let Some(entry) = self.lock_timers().entries.get_mut(&id) {
            if entry.generation == generation {
                entry.firing = false;
                entry.spent = true;
            }
        }
    }

    #[instrument(skip_all, fields(schedule_id = %schedule.id, schedule_type = %schedule.schedule_type))]
    async fn fire(self: &Arc<Self>, schedule: Schedule, token: CancellationToken, generation: u64) {
        let started = Instant::now();

        // Inner task so a panicking handler surfaces as a JoinError
        let inner = Arc::clone(self);
        let firing = schedule.clone();
        let task = tokio::spawn(async move {
            match inner.handlers.handle(&firing).await {
                Ok(value) => inner
                    .reschedule(&firing, value)
                    .await
                    .map_err(FireFailure::Persist),
                Err(e) => Err(FireFailure::Handler(e)),
            }
        });
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(FireFailure::Panic(panic_message(e.into_panic()))),
            Err(e) => Err(FireFailure::Panic(format!("firing task cancelled: {}", e))),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(updated) => {
                info!(duration_ms, next_run = %updated.next_run, "Schedule executed");
                if token.is_cancelled() {
                    debug!("Timer cancelled during firing, not re-arming");
                    return;
                }
                self.register(updated, false);
            }
            Err(FireFailure::Handler(e)) => {
                warn!(duration_ms, error = %e, "Schedule handler failed, next_run left unchanged");
                self.mark_spent(schedule.id, generation);
            }
            Err(FireFailure::Panic(message)) => {
                error!(duration_ms, panic = %message, "Schedule handler panicked, next_run left unchanged");
                self.mark_spent(schedule.id, generation);
            }
            Err(FireFailure::Persist(e)) => {
                error!(duration_ms, error = %e, "Failed to persist schedule execution");
                self.mark_spent(schedule.id, generation);
            }
        }
    }

    async fn reschedule(&self, schedule: &Schedule, result: JsonValue) -> Result<Schedule> {
        let next_run = schedule.following_run()?;
        self.store
            .record_execution(
                schedule.id,
                ScheduleExecution {
                    executed_at: Utc::now(),
                    next_run,
                    result,
                },
            )
            .await
    }
}

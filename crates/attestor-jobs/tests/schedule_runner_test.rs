//! Schedule runner behaviour on a paused tokio clock.
//!
//! Schedule deadlines are computed from the wall clock, timers run on tokio
//! time, so each test advances tokio time well past the next deadline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use attestor_jobs::{
    Frequency, InMemoryMetrics, InMemoryScheduleStore, JobQueue, Result, Schedule,
    ScheduleHandler, ScheduleHandlers, ScheduleOptions, ScheduleRunner, ScheduleStore,
    ScheduleType,
};

#[derive(Default)]
struct CountingHandler {
    calls: AtomicUsize,
}

impl CountingHandler {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScheduleHandler for CountingHandler {
    async fn handle(&self, schedule: &Schedule) -> Result<JsonValue> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "schedule": schedule.name }))
    }
}

fn all_types(handler: Arc<CountingHandler>) -> ScheduleHandlers {
    ScheduleHandlers {
        evidence_reminder: handler.clone(),
        health_check: handler.clone(),
        reassessment_draft: handler.clone(),
        framework_publish: handler,
    }
}

fn schedule(frequency: Frequency, next_run: chrono::DateTime<Utc>) -> Schedule {
    Schedule {
        id: Uuid::new_v4(),
        organization_id: Uuid::new_v4(),
        name: format!("{:?} reminder", frequency),
        schedule_type: ScheduleType::EvidenceReminder,
        frequency,
        next_run,
        last_run: None,
        owner: Some("compliance@example.com".into()),
        is_active: true,
        options: ScheduleOptions::default(),
    }
}

async fn settle() {
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// RESCHEDULING
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_weekly_schedule_does_not_drift() {
    let store = Arc::new(InMemoryScheduleStore::new());
    let initial = Utc::now() - chrono::Duration::days(3);
    let weekly = schedule(Frequency::Weekly, initial);
    store.upsert(weekly.clone()).await;

    let handler = Arc::new(CountingHandler::default());
    let runner = ScheduleRunner::new(store.clone(), all_types(handler.clone()), DAY * 365);
    runner.start().await.unwrap();
    settle().await;
    assert_eq!(handler.calls(), 1);

    // Every later firing happens days after its due time
    for _ in 0..3 {
        tokio::time::advance(DAY * 30).await;
        settle().await;
    }

    let n = handler.calls();
    assert_eq!(n, 4);
    let stored = store.get(weekly.id).await.unwrap();
    assert_eq!(stored.next_run, initial + chrono::Duration::weeks(n as i64));
    assert!(stored.last_run.is_some());

    let executions = store.executions().await;
    assert_eq!(executions.len(), n);
    for (i, (id, execution)) in executions.iter().enumerate() {
        assert_eq!(*id, weekly.id);
        assert_eq!(
            execution.next_run,
            initial + chrono::Duration::weeks(i as i64 + 1)
        );
    }
    runner.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_custom_frequency_uses_interval_days() {
    let store = Arc::new(InMemoryScheduleStore::new());
    let initial = Utc::now() - chrono::Duration::hours(1);
    let mut custom = schedule(Frequency::Custom, initial);
    custom.options = ScheduleOptions::with_interval_days(10);
    store.upsert(custom.clone()).await;

    let handler = Arc::new(CountingHandler::default());
    let runner = ScheduleRunner::new(store.clone(), all_types(handler.clone()), DAY * 365);
    runner.start().await.unwrap();
    settle().await;

    assert_eq!(handler.calls(), 1);
    assert_eq!(
        store.get(custom.id).await.unwrap().next_run,
        initial + chrono::Duration::days(10)
    );
    runner.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_custom_frequency_without_interval_is_not_rescheduled() {
    let store = Arc::new(InMemoryScheduleStore::new());
    let initial = Utc::now() - chrono::Duration::hours(1);
    let custom = schedule(Frequency::Custom, initial);
    store.upsert(custom.clone()).await;

    let handler = Arc::new(CountingHandler::default());
    let runner = ScheduleRunner::new(store.clone(), all_types(handler.clone()), DAY * 365);
    runner.start().await.unwrap();
    settle().await;

    assert_eq!(handler.calls(), 1);
    assert!(store.executions().await.is_empty());
    assert_eq!(store.get(custom.id).await.unwrap().next_run, initial);
    runner.shutdown();
}

// =============================================================================
// REFRESH
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_deactivated_schedule_stops_after_refresh() {
    let store = Arc::new(InMemoryScheduleStore::new());
    let due = Utc::now() + chrono::Duration::minutes(2);
    let mut retired = schedule(Frequency::Daily, due);
    let kept = schedule(Frequency::Daily, due);
    store.upsert(retired.clone()).await;
    store.upsert(kept.clone()).await;

    let retired_handler = Arc::new(CountingHandler::default());
    let kept_handler = Arc::new(CountingHandler::default());
    // Route by type so each schedule has its own counter
    retired.schedule_type = ScheduleType::FrameworkPublish;
    store.upsert(retired.clone()).await;
    let handlers = ScheduleHandlers {
        evidence_reminder: kept_handler.clone(),
        health_check: kept_handler.clone(),
        reassessment_draft: kept_handler.clone(),
        framework_publish: retired_handler.clone(),
    };

    let runner = ScheduleRunner::new(store.clone(), handlers, Duration::from_secs(60));
    assert_eq!(runner.start().await.unwrap(), 2);

    retired.is_active = false;
    store.upsert(retired.clone()).await;

    // Next refresh drops the deactivated schedule
    tokio::time::advance(Duration::from_secs(61)).await;
    settle().await;
    assert_eq!(runner.registered_ids(), vec![kept.id]);

    tokio::time::advance(Duration::from_secs(10 * 60)).await;
    settle().await;
    assert_eq!(retired_handler.calls(), 0);
    assert_eq!(kept_handler.calls(), 1);

    // History and the record itself survive deactivation
    assert!(!store.get(retired.id).await.unwrap().is_active);
    runner.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_refresh_picks_up_new_schedules() {
    let store = Arc::new(InMemoryScheduleStore::new());
    let handler = Arc::new(CountingHandler::default());
    let runner = ScheduleRunner::new(store.clone(), all_types(handler.clone()), Duration::from_secs(60));
    assert_eq!(runner.start().await.unwrap(), 0);

    let added = schedule(Frequency::Monthly, Utc::now() - chrono::Duration::minutes(5));
    store.upsert(added.clone()).await;

    tokio::time::advance(Duration::from_secs(61)).await;
    settle().await;
    assert_eq!(handler.calls(), 1);
    assert_eq!(runner.registered_ids(), vec![added.id]);

    // A later refresh does not fire it again for the same slot
    tokio::time::advance(Duration::from_secs(61)).await;
    settle().await;
    assert_eq!(handler.calls(), 1);
    runner.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_refresh_loop() {
    let store = Arc::new(InMemoryScheduleStore::new());
    let handler = Arc::new(CountingHandler::default());
    let runner = ScheduleRunner::new(store.clone(), all_types(handler.clone()), Duration::from_secs(60));
    runner.start().await.unwrap();
    runner.shutdown();

    store
        .upsert(schedule(Frequency::Daily, Utc::now() - chrono::Duration::minutes(1)))
        .await;
    tokio::time::advance(Duration::from_secs(600)).await;
    settle().await;

    assert_eq!(handler.calls(), 0);
    assert!(runner.registered_ids().is_empty());
}

// =============================================================================
// STANDARD HANDLERS
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_health_check_schedule_records_result() {
    let store = Arc::new(InMemoryScheduleStore::new());
    let mut check = schedule(Frequency::Daily, Utc::now() - chrono::Duration::minutes(1));
    check.schedule_type = ScheduleType::HealthCheck;
    store.upsert(check.clone()).await;

    let queue = JobQueue::new(2);
    let handlers = ScheduleHandlers::standard(queue, Arc::new(InMemoryMetrics::new()));
    let runner = ScheduleRunner::new(store.clone(), handlers, DAY);
    runner.start().await.unwrap();
    settle().await;

    let executions = store.executions().await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].1.result["status"], "ok");
    runner.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_enqueue_failure_leaves_schedule_due() {
    let store = Arc::new(InMemoryScheduleStore::new());
    let reminder = schedule(Frequency::Daily, Utc::now() - chrono::Duration::minutes(1));
    store.upsert(reminder.clone()).await;

    // No processor registered for evidence.reminder
    let queue = JobQueue::new(2);
    let handlers = ScheduleHandlers::standard(queue, Arc::new(InMemoryMetrics::new()));
    let runner = ScheduleRunner::new(store.clone(), handlers, DAY);
    runner.start().await.unwrap();
    settle().await;

    assert!(store.executions().await.is_empty());
    assert_eq!(store.get(reminder.id).await.unwrap().next_run, reminder.next_run);
    runner.shutdown();
}

//! attestor-worker: runs the job queue and the schedule runner in one process.
//!
//! Persistence is in-memory in this binary: the evidence, scan, policy and
//! schedule stores start empty and nothing in this process enqueues
//! ingestion jobs or creates schedules. Until a persistent store backs the
//! runner, the worker idles after startup apart from its refresh loop.

use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use attestor_core::defaults::{
    JOB_EVIDENCE_INGEST, JOB_EVIDENCE_REMINDER, JOB_FRAMEWORK_PUBLISH, JOB_REASSESSMENT_DRAFT,
};
use attestor_core::{
    InMemoryEvidenceStore, InMemoryPolicyStore, InMemoryScanRecordStore, InMemoryScheduleStore,
    LogNotifier, Notifier, PrometheusMetrics, Settings,
};
use attestor_jobs::{
    EvidenceIngestionHandler, IngestionDeps, IngestionPipeline, IngestionPolicy, JobHandler,
    JobQueue, ScheduleHandlers, ScheduleRunner, WebhookClient, WebhookDispatchHandler,
    WebhookNotifier,
};
use attestor_scan::{ClamScanEngine, HttpObjectFetcher, LocalFileFetcher, RoutingFetcher, ScannerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing();

    let settings = Settings::from_env();
    info!(
        max_concurrent_jobs = settings.max_concurrent_jobs,
        refresh_interval_secs = settings.schedule_refresh_interval.as_secs(),
        "Settings loaded"
    );

    let metrics = Arc::new(PrometheusMetrics::new(prometheus::Registry::new()));

    // Notifications
    let notifier: Arc<dyn Notifier> = match &settings.webhooks.notify_url {
        Some(url) => {
            let client = WebhookClient::new(url.clone(), settings.webhooks.secret.clone())
                .context("building notification webhook client")?;
            info!(url = %client.url(), signed = settings.webhooks.secret.is_some(), "Notification webhook enabled");
            Arc::new(WebhookNotifier::new(client))
        }
        None => {
            warn!("NOTIFY_WEBHOOK_URL not set, notifications are only logged");
            Arc::new(LogNotifier)
        }
    };

    // Scanning
    let fetcher = RoutingFetcher::new(Arc::new(LocalFileFetcher::new(settings.scan.storage_root.clone())))
        .with_object_storage(Arc::new(
            HttpObjectFetcher::new(settings.scan.timeout).context("building object storage client")?,
        ));
    let scanner = ClamScanEngine::new(ScannerConfig::from(&settings.scan));
    info!(
        bin = %scanner.config().bin,
        timeout_secs = scanner.config().timeout.as_secs(),
        "Scan engine configured"
    );

    let pipeline = Arc::new(IngestionPipeline::new(
        IngestionDeps {
            evidence: Arc::new(InMemoryEvidenceStore::new()),
            scans: Arc::new(InMemoryScanRecordStore::new()),
            policies: Arc::new(InMemoryPolicyStore::new()),
            fetcher: Arc::new(fetcher),
            scanner: Arc::new(scanner),
            notifier,
            metrics: metrics.clone(),
        },
        IngestionPolicy::from(&settings.scan),
    ));
    let policy = pipeline.policy();
    info!(
        scan_enabled = policy.scan_enabled,
        quarantine_on_error = policy.quarantine_on_error,
        default_strategy = %policy.default_strategy,
        "Ingestion pipeline ready"
    );

    // Job queue
    let queue = JobQueue::with_retention(
        settings.max_concurrent_jobs,
        settings.retained_terminal_jobs,
    );
    queue
        .register_processor(JOB_EVIDENCE_INGEST, Arc::new(EvidenceIngestionHandler::new(pipeline)))
        .await?;

    let automation = match &settings.webhooks.automation_url {
        Some(url) => Some(
            WebhookClient::new(url.clone(), settings.webhooks.secret.clone())
                .context("building automation webhook client")?,
        ),
        None => None,
    };
    let dispatch: Arc<dyn JobHandler> = Arc::new(WebhookDispatchHandler::new(
        automation,
        settings.dispatch_max_attempts,
    ));
    for name in [JOB_EVIDENCE_REMINDER, JOB_REASSESSMENT_DRAFT, JOB_FRAMEWORK_PUBLISH] {
        queue.register_processor(name, dispatch.clone()).await?;
    }
    info!(processors = ?queue.registered_names().await, "Job processors registered");

    // Schedules
    let runner = ScheduleRunner::new(
        Arc::new(InMemoryScheduleStore::new()),
        ScheduleHandlers::standard(queue.clone(), metrics.clone()),
        settings.schedule_refresh_interval,
    );
    runner.start().await.context("starting schedule runner")?;

    info!("attestor-worker running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    runner.shutdown();
    queue.close();

    let stats = queue.stats().await;
    info!(
        queued = stats.queued,
        running = stats.running,
        completed = stats.completed,
        failed = stats.failed,
        "Job queue closed"
    );
    match metrics.gather_text() {
        Ok(text) => debug!(metrics = %text, "Final metrics"),
        Err(e) => warn!(error = %e, "Failed to encode metrics"),
    }
    Ok(())
}

/// Initialize tracing.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, daily rotation)
///   LOG_ANSI    - "true"/"false" override ANSI colors
///   RUST_LOG    - standard env filter
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "attestor_worker=debug,attestor_jobs=debug,attestor_scan=info,attestor_core=info".into()
    });
    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("attestor-worker.log");
        let (writer, guard) =
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));

        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry.with(tracing_subscriber::fmt::layer().json()).init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );
    guard
}

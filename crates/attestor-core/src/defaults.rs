//! Centralized default constants for the attestor worker.
//!
//! Every crate references these instead of defining its own magic numbers.
//! Organized by domain area.

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Maximum number of job handlers running at the same time.
pub const JOB_MAX_CONCURRENT: usize = 8;

/// Completed and failed jobs kept for `get`/`list`; older ones are dropped.
pub const JOB_RETAINED_TERMINAL: usize = 1000;

/// Default attempt ceiling for jobs that re-enqueue themselves on failure.
pub const JOB_DISPATCH_MAX_ATTEMPTS: u32 = 3;

/// Broadcast capacity for queue lifecycle events.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Payload field carrying the 1-based attempt counter.
pub const JOB_ATTEMPT_FIELD: &str = "attempt";

/// Job name for evidence ingestion.
pub const JOB_EVIDENCE_INGEST: &str = "evidence.ingest";

/// Job name for evidence review reminders.
pub const JOB_EVIDENCE_REMINDER: &str = "evidence.reminder";

/// Job name for re-assessment draft generation.
pub const JOB_REASSESSMENT_DRAFT: &str = "assessment.draft";

/// Job name for framework publication.
pub const JOB_FRAMEWORK_PUBLISH: &str = "framework.publish";

// =============================================================================
// SCHEDULES
// =============================================================================

/// Period between schedule list resynchronisations, in seconds.
pub const SCHEDULE_REFRESH_INTERVAL_SECS: u64 = 300;

// =============================================================================
// SCANNING
// =============================================================================

/// Scanner executable name (resolved through `PATH`).
pub const SCANNER_BIN: &str = "clamscan";

/// Flags passed before the file path.
pub const SCANNER_ARGS: &[&str] = &["--no-summary"];

/// Highest exit code that still represents a scan verdict.
/// ClamAV: 0 = clean, 1 = virus found, 2+ = engine error.
pub const SCANNER_FOUND_EXIT_CODE: i32 = 1;

/// Wall-clock limit for a single scanner invocation, in seconds.
pub const SCAN_TIMEOUT_SECS: u64 = 120;

/// Engine label recorded when scanning is disabled by configuration.
pub const SCAN_DISABLED_ENGINE: &str = "disabled";

/// Maximum length of the sanitized on-disk artifact name.
pub const SCAN_FILENAME_MAX_LEN: usize = 64;

/// Prefix for the private per-scan temp directory.
pub const SCAN_TEMP_PREFIX: &str = "attestor-scan-";

/// Local storage root for the filesystem artifact fetcher.
pub const STORAGE_ROOT: &str = "./storage";

// =============================================================================
// NOTIFICATIONS / WEBHOOKS
// =============================================================================

/// Webhook HTTP request timeout in seconds.
pub const WEBHOOK_TIMEOUT_SECS: u64 = 10;

/// Header carrying the event kind on outbound webhooks.
pub const WEBHOOK_EVENT_HEADER: &str = "X-Attestor-Event";

/// Header carrying the HMAC-SHA256 body signature.
pub const WEBHOOK_SIGNATURE_HEADER: &str = "X-Attestor-Signature";

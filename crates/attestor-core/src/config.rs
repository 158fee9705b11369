//! Environment-driven configuration for the worker tier.
//!
//! Every setting has a default in [`crate::defaults`]. Values that fail to
//! parse fall back to the default and log a warning instead of aborting.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::defaults;
use crate::models::AutoReleaseStrategy;

/// Ingestion and scanner settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettings {
    /// When false, ingestion records a synthetic clean verdict.
    pub enabled: bool,
    /// Quarantine the evidence when the scanner itself fails.
    pub quarantine_on_error: bool,
    /// Strategy used when the organization has none configured.
    pub default_auto_release: AutoReleaseStrategy,
    pub timeout: Duration,
    pub scanner_bin: String,
    pub scanner_args: Vec<String>,
    pub found_exit_code: i32,
    pub storage_root: PathBuf,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            quarantine_on_error: true,
            default_auto_release: AutoReleaseStrategy::Pending,
            timeout: Duration::from_secs(defaults::SCAN_TIMEOUT_SECS),
            scanner_bin: defaults::SCANNER_BIN.to_string(),
            scanner_args: defaults::SCANNER_ARGS.iter().map(|s| s.to_string()).collect(),
            found_exit_code: defaults::SCANNER_FOUND_EXIT_CODE,
            storage_root: PathBuf::from(defaults::STORAGE_ROOT),
        }
    }
}

/// Outbound webhook endpoints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebhookSettings {
    /// Receives quarantine/release notifications.
    pub notify_url: Option<String>,
    /// HMAC key for signing outbound bodies.
    pub secret: Option<String>,
    /// Receives dispatched automation jobs (reminders, drafts, publication).
    pub automation_url: Option<String>,
}

/// Top-level worker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub scan: ScanSettings,
    pub webhooks: WebhookSettings,
    pub schedule_refresh_interval: Duration,
    pub max_concurrent_jobs: usize,
    pub retained_terminal_jobs: usize,
    pub dispatch_max_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            scan: ScanSettings::default(),
            webhooks: WebhookSettings::default(),
            schedule_refresh_interval: Duration::from_secs(defaults::SCHEDULE_REFRESH_INTERVAL_SECS),
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            retained_terminal_jobs: defaults::JOB_RETAINED_TERMINAL,
            dispatch_max_attempts: defaults::JOB_DISPATCH_MAX_ATTEMPTS,
        }
    }
}

impl Settings {
    /// Load settings from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let base = Self::default();
        let env = Env { lookup: &lookup };

        let scan = ScanSettings {
            enabled: env.flag("EVIDENCE_SCAN_ENABLED", base.scan.enabled),
            quarantine_on_error: env
                .flag("EVIDENCE_QUARANTINE_ON_ERROR", base.scan.quarantine_on_error),
            default_auto_release: env.parsed(
                "EVIDENCE_AUTO_RELEASE_STRATEGY",
                base.scan.default_auto_release,
            ),
            timeout: Duration::from_secs(
                env.parsed("EVIDENCE_SCAN_TIMEOUT_SECS", base.scan.timeout.as_secs())
                    .max(1),
            ),
            scanner_bin: env
                .string("EVIDENCE_SCANNER_BIN")
                .unwrap_or(base.scan.scanner_bin),
            scanner_args: env
                .raw("EVIDENCE_SCANNER_ARGS")
                .map(|v| v.split_whitespace().map(String::from).collect())
                .unwrap_or(base.scan.scanner_args),
            found_exit_code: env.parsed(
                "EVIDENCE_SCANNER_FOUND_EXIT_CODE",
                base.scan.found_exit_code,
            ),
            storage_root: env
                .string("EVIDENCE_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(base.scan.storage_root),
        };

        let webhooks = WebhookSettings {
            notify_url: env.string("NOTIFY_WEBHOOK_URL"),
            secret: env.string("NOTIFY_WEBHOOK_SECRET"),
            automation_url: env.string("AUTOMATION_WEBHOOK_URL"),
        };

        Self {
            scan,
            webhooks,
            schedule_refresh_interval: Duration::from_secs(
                env.parsed(
                    "SCHEDULE_REFRESH_INTERVAL_SECS",
                    base.schedule_refresh_interval.as_secs(),
                )
                .max(1),
            ),
            max_concurrent_jobs: env
                .parsed("JOB_MAX_CONCURRENT", base.max_concurrent_jobs)
                .max(1),
            retained_terminal_jobs: env
                .parsed("JOB_RETAINED_TERMINAL", base.retained_terminal_jobs),
            dispatch_max_attempts: env
                .parsed("JOB_DISPATCH_MAX_ATTEMPTS", base.dispatch_max_attempts)
                .max(1),
        }
    }

    /// Enable or disable scanning.
    pub fn with_scan_enabled(mut self, enabled: bool) -> Self {
        self.scan.enabled = enabled;
        self
    }

    /// Set the scanner timeout.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan.timeout = timeout;
        self
    }

    /// Set the default auto-release strategy.
    pub fn with_default_auto_release(mut self, strategy: AutoReleaseStrategy) -> Self {
        self.scan.default_auto_release = strategy;
        self
    }

    /// Set maximum concurrent jobs.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max.max(1);
        self
    }

    /// Set the schedule refresh period.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.schedule_refresh_interval = interval;
        self
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    /// Non-empty trimmed value.
    fn string(&self, key: &str) -> Option<String> {
        self.raw(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.string(key).map(|v| v.to_lowercase()) {
            None => default,
            Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => true,
            Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => false,
            Some(v) => {
                warn!(key, value = %v, default, "Invalid boolean setting, using default");
                default
            }
        }
    }

    fn parsed<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + std::fmt::Debug,
    {
        match self.string(key) {
            None => default,
            Some(v) => match v.parse::<T>() {
                Ok(parsed) => parsed,
                Err(_) => {
                    warn!(key, value = %v, default = ?default, "Invalid setting, using default");
                    default
                }
            },
        }
    }
}

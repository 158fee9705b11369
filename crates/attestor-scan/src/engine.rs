//! Subprocess scan engine.
//!
//! Each scan gets a private temp directory. The artifact is streamed into a
//! sanitized file inside it, the scanner executable runs against that file
//! under a hard timeout, and the directory plus the artifact's own cleanup
//! action are released on every exit path.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use attestor_core::defaults::SCAN_TEMP_PREFIX;
use attestor_core::{ScanSettings, ScanStatus};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{ScanError, ScanResult};
use crate::fetcher::ArtifactHandle;
use crate::sanitize::sanitize_filename;
use crate::verdict::{parse_verdict, parse_version, verdict_line, EngineVersion, Verdict};

const COPY_BUFFER_SIZE: usize = 64 * 1024;
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const RAW_OUTPUT_LIMIT: usize = 4096;

/// Per-scan context.
#[derive(Debug, Clone, Default)]
pub struct ScanContext {
    pub evidence_id: Uuid,
    pub scan_id: Uuid,
    /// Expected sha256 hex digest, optionally prefixed with `sha256:`.
    pub checksum: Option<String>,
    pub original_filename: Option<String>,
}

/// Definitive scan result.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    /// `Clean` or `Infected`.
    pub status: ScanStatus,
    pub duration_ms: u64,
    pub bytes_scanned: u64,
    pub engine_version: Option<String>,
    pub signature_version: Option<String>,
    pub notes: Vec<String>,
    pub findings: JsonValue,
    pub signature: Option<String>,
}

impl ScanOutcome {
    pub fn is_infected(&self) -> bool {
        self.status == ScanStatus::Infected
    }
}

/// A malware scanner. Never retries internally.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// Label used in metrics and findings.
    fn engine_name(&self) -> &str;

    async fn scan(&self, artifact: ArtifactHandle, ctx: &ScanContext) -> ScanResult<ScanOutcome>;
}

/// Scanner executable settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannerConfig {
    pub bin: String,
    /// Arguments placed before the file path.
    pub args: Vec<String>,
    /// Highest exit code that still carries a verdict.
    pub found_exit_code: i32,
    pub timeout: Duration,
}

impl From<&ScanSettings> for ScannerConfig {
    fn from(settings: &ScanSettings) -> Self {
        Self {
            bin: settings.scanner_bin.clone(),
            args: settings.scanner_args.clone(),
            found_exit_code: settings.found_exit_code,
            timeout: settings.timeout,
        }
    }
}

/// ClamAV-compatible command-line scanner (`clamscan`, `clamdscan`).
pub struct ClamScanEngine {
    config: ScannerConfig,
    version: OnceCell<EngineVersion>,
}

impl ClamScanEngine {
    pub fn new(config: ScannerConfig) -> Self {
        Self {
            config,
            version: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    /// Engine and signature versions, probed once and cached. A failed probe
    /// caches unknown versions.
    pub async fn version(&self) -> EngineVersion {
        self.version
            .get_or_init(|| async {
                self.probe_version().await.unwrap_or_else(|e| {
                    warn!(bin = %self.config.bin, error = %e, "Scanner version probe failed, versions unknown");
                    EngineVersion::default()
                })
            })
            .await
            .clone()
    }

    async fn probe_version(&self) -> ScanResult<EngineVersion> {
        let output = tokio::time::timeout(
            VERSION_PROBE_TIMEOUT,
            Command::new(&self.config.bin)
                .args(&self.config.args)
                .arg("--version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ScanError::EngineUnavailable("version probe timed out".to_string()))?
        .map_err(|e| ScanError::EngineUnavailable(format!("version probe failed: {}", e)))?;

        if !output.status.success() {
            return Err(ScanError::EngineUnavailable(format!(
                "version probe exited with {}",
                output.status
            )));
        }
        Ok(parse_version(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Run the scanner against `path`, killing it if the timeout elapses.
    async fn run(&self, path: &Path) -> ScanResult<(ExitStatus, String, String)> {
        let mut child = Command::new(&self.config.bin)
            .args(&self.config.args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ScanError::EngineUnavailable(format!(
                    "failed to spawn scanner '{}': {}",
                    self.config.bin, e
                ))
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let collect = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let (r1, r2) = tokio::join!(read_all(stdout, &mut out), read_all(stderr, &mut err));
            r1?;
            r2?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out, err))
        };

        let waited = tokio::time::timeout(self.config.timeout, collect).await;
        match waited {
            Ok(Ok((status, out, err))) => Ok((
                status,
                String::from_utf8_lossy(&out).into_owned(),
                String::from_utf8_lossy(&err).into_owned(),
            )),
            Ok(Err(e)) => Err(ScanError::EngineUnavailable(format!(
                "scanner I/O failed: {}",
                e
            ))),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed-out scanner");
                }
                Err(ScanError::EngineUnavailable(format!(
                    "scanner timed out after {:?}",
                    self.config.timeout
                )))
            }
        }
    }

    async fn scan_in_dir(
        &self,
        dir: &Path,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        ctx: &ScanContext,
        started: Instant,
    ) -> ScanResult<ScanOutcome> {
        let path = dir.join(sanitize_filename(ctx.original_filename.as_deref()));
        let (bytes_scanned, digest) = materialize(reader, &path).await?;
        debug!(
            evidence_id = %ctx.evidence_id,
            scan_id = %ctx.scan_id,
            bytes_scanned,
            "Artifact materialized for scanning"
        );

        let (status, stdout, stderr) = self.run(&path).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let code = status.code().ok_or_else(|| {
            ScanError::EngineUnavailable("scanner terminated by signal".to_string())
        })?;
        if code > self.config.found_exit_code {
            return Err(ScanError::EngineUnavailable(format!(
                "scanner exited with code {}: {}",
                code,
                truncate(stderr.trim(), 500)
            )));
        }

        let verdict = parse_verdict(&stdout)?;
        let version = self.version().await;

        let mut notes = Vec::new();
        let checksum_matched = ctx.checksum.as_deref().map(|expected| {
            let expected = expected.trim().trim_start_matches("sha256:").to_lowercase();
            let matched = expected == digest;
            if !matched {
                notes.push(format!(
                    "checksum mismatch: expected {}, computed {}",
                    expected, digest
                ));
            }
            matched
        });

        let (scan_status, signature) = match verdict {
            Verdict::Clean => (ScanStatus::Clean, None),
            Verdict::Infected { signature } => (ScanStatus::Infected, Some(signature)),
        };

        let findings = json!({
            "engine": self.engine_name(),
            "exitCode": code,
            "verdictLine": verdict_line(&stdout),
            "signature": signature,
            "sha256": digest,
            "checksumMatched": checksum_matched,
            "rawOutput": truncate(&stdout, RAW_OUTPUT_LIMIT),
        });

        Ok(ScanOutcome {
            status: scan_status,
            duration_ms,
            bytes_scanned,
            engine_version: version.engine,
            signature_version: version.signatures,
            notes,
            findings,
            signature,
        })
    }
}

#[async_trait]
impl Scanner for ClamScanEngine {
    fn engine_name(&self) -> &str {
        "clamav"
    }

    #[instrument(skip(self, artifact, ctx), fields(evidence_id = %ctx.evidence_id, scan_id = %ctx.scan_id))]
    async fn scan(&self, artifact: ArtifactHandle, ctx: &ScanContext) -> ScanResult<ScanOutcome> {
        let started = Instant::now();
        let ArtifactHandle {
            mut reader,
            cleanup,
            ..
        } = artifact;

        let result = match tempfile::Builder::new().prefix(SCAN_TEMP_PREFIX).tempdir() {
            Ok(dir) => {
                let result = self
                    .scan_in_dir(dir.path(), &mut reader, ctx, started)
                    .await;
                if let Err(e) = dir.close() {
                    warn!(error = %e, "Failed to remove scan temp directory");
                }
                result
            }
            Err(e) => Err(ScanError::Io(e)),
        };

        // Release the handle before running its cleanup
        drop(reader);
        if let Some(cleanup) = cleanup {
            if let Err(e) = cleanup.await {
                warn!(error = %e, "Artifact cleanup failed");
            }
        }

        match &result {
            Ok(outcome) => info!(
                status = %outcome.status,
                signature = ?outcome.signature,
                duration_ms = outcome.duration_ms,
                bytes_scanned = outcome.bytes_scanned,
                "Scan completed"
            ),
            Err(e) => warn!(category = e.category(), error = %e, "Scan failed"),
        }
        result
    }
}

/// Copy `reader` to `path`, returning bytes written and the sha256 hex digest.
async fn materialize(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    path: &Path,
) -> ScanResult<(u64, String)> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok((total, hex::encode(hasher.finalize())))
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>, buf: &mut Vec<u8>) -> std::io::Result<()> {
    if let Some(mut r) = reader {
        r.read_to_end(buf).await?;
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

//! Scanner output classification.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{ScanError, ScanResult};

/// Marker at the end of a clean per-file verdict line.
pub const CLEAN_MARKER: &str = "OK";

/// Classified scanner verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    Infected { signature: String },
}

fn found_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":\s+(.+?)\s+FOUND$").ok())
        .as_ref()
}

/// Last non-blank line of the scanner's stdout.
pub fn verdict_line(stdout: &str) -> Option<&str> {
    stdout.lines().map(str::trim).rfind(|l| !l.is_empty())
}

/// Classify scanner stdout.
///
/// The last non-blank line decides: ending in the clean marker is
/// [`Verdict::Clean`], `<path>: <signature> FOUND` is [`Verdict::Infected`],
/// anything else is [`ScanError::UnparseableResponse`].
pub fn parse_verdict(stdout: &str) -> ScanResult<Verdict> {
    let line = verdict_line(stdout)
        .ok_or_else(|| ScanError::UnparseableResponse("scanner produced no output".to_string()))?;

    if let Some(caps) = found_pattern().and_then(|re| re.captures(line)) {
        let signature = caps
            .get(1)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        return Ok(Verdict::Infected { signature });
    }

    if line.ends_with(CLEAN_MARKER) {
        return Ok(Verdict::Clean);
    }

    Err(ScanError::UnparseableResponse(truncate(line, 200)))
}

/// Engine and signature database versions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineVersion {
    pub engine: Option<String>,
    pub signatures: Option<String>,
}

/// Parse `ClamAV 1.3.1/27412/Mon Oct 12 08:22:01 2026` style version output.
pub fn parse_version(output: &str) -> EngineVersion {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
    let mut parts = line.split('/');
    let engine = parts
        .next()
        .map(|p| p.trim())
        .map(|p| p.rsplit(' ').next().unwrap_or(p).to_string())
        .filter(|p| !p.is_empty());
    let signatures = parts
        .next()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());
    EngineVersion { engine, signatures }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}

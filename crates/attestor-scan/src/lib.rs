//! # attestor-scan
//!
//! Artifact fetching and malware scanning for evidence ingestion.
//!
//! - [`fetcher`] resolves storage references to byte streams
//! - [`engine`] runs a ClamAV-compatible scanner as a subprocess
//! - [`verdict`] classifies scanner output

pub mod engine;
pub mod error;
pub mod fetcher;
pub mod sanitize;
pub mod verdict;

pub use engine::{ClamScanEngine, ScanContext, ScanOutcome, Scanner, ScannerConfig};
pub use error::{ScanError, ScanResult};
pub use fetcher::{
    ArtifactFetcher, ArtifactHandle, Cleanup, HttpObjectFetcher, LocalFileFetcher, RoutingFetcher,
};
pub use sanitize::sanitize_filename;
pub use verdict::{parse_verdict, EngineVersion, Verdict};

//! Artifact fetchers: resolve a storage reference to a readable byte stream.

use std::io::Cursor;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use attestor_core::{StorageProvider, StorageReference};
use futures::future::BoxFuture;
use futures::TryStreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::error::{ScanError, ScanResult};

/// Deferred cleanup for a fetched artifact.
pub type Cleanup = BoxFuture<'static, std::io::Result<()>>;

/// A readable artifact plus optional size and cleanup action.
pub struct ArtifactHandle {
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
    pub size: Option<u64>,
    pub cleanup: Option<Cleanup>,
}

impl ArtifactHandle {
    pub fn new(reader: impl AsyncRead + Send + 'static, size: Option<u64>) -> Self {
        Self {
            reader: Box::pin(reader),
            size,
            cleanup: None,
        }
    }

    /// In-memory artifact.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        let size = bytes.len() as u64;
        Self::new(Cursor::new(bytes), Some(size))
    }

    pub fn with_cleanup(mut self, cleanup: Cleanup) -> Self {
        self.cleanup = Some(cleanup);
        self
    }
}

impl std::fmt::Debug for ArtifactHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactHandle")
            .field("size", &self.size)
            .field("has_cleanup", &self.cleanup.is_some())
            .finish()
    }
}

#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, reference: &StorageReference) -> ScanResult<ArtifactHandle>;
}

// =============================================================================
// LOCAL FILESYSTEM
// =============================================================================

/// Reads artifacts below a fixed storage root.
#[derive(Debug, Clone)]
pub struct LocalFileFetcher {
    root: PathBuf,
}

impl LocalFileFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Join `key` onto the root, refusing anything that could escape it.
    pub fn resolve(&self, key: &str) -> ScanResult<PathBuf> {
        let relative = Path::new(key);
        if key.is_empty() {
            return Err(ScanError::Fetch("empty storage key".to_string()));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(ScanError::Fetch(format!(
                        "storage key '{}' escapes the storage root",
                        key
                    )))
                }
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactFetcher for LocalFileFetcher {
    async fn fetch(&self, reference: &StorageReference) -> ScanResult<ArtifactHandle> {
        let path = self.resolve(&reference.key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| ScanError::Fetch(format!("open {}: {}", path.display(), e)))?;
        let size = file.metadata().await.ok().map(|m| m.len());
        debug!(path = %path.display(), size, "Opened local artifact");
        Ok(ArtifactHandle::new(file, size))
    }
}

// =============================================================================
// HTTP OBJECT STORAGE
// =============================================================================

/// Streams artifacts from object storage over HTTP(S) using the reference `uri`.
#[derive(Debug, Clone)]
pub struct HttpObjectFetcher {
    client: reqwest::Client,
}

impl HttpObjectFetcher {
    pub fn new(timeout: Duration) -> ScanResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArtifactFetcher for HttpObjectFetcher {
    async fn fetch(&self, reference: &StorageReference) -> ScanResult<ArtifactHandle> {
        let uri = reference.uri.as_deref().ok_or_else(|| {
            ScanError::Fetch(format!("object reference '{}' has no uri", reference.key))
        })?;

        let response = self.client.get(uri).send().await?.error_for_status()?;
        let size = response.content_length();
        debug!(key = %reference.key, size, "Streaming object artifact");

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(ArtifactHandle::new(StreamReader::new(stream), size))
    }
}

// =============================================================================
// ROUTING
// =============================================================================

/// Dispatches on the reference's provider tag.
#[derive(Clone)]
pub struct RoutingFetcher {
    local: Arc<dyn ArtifactFetcher>,
    object: Option<Arc<dyn ArtifactFetcher>>,
}

impl RoutingFetcher {
    pub fn new(local: Arc<dyn ArtifactFetcher>) -> Self {
        Self {
            local,
            object: None,
        }
    }

    pub fn with_object_storage(mut self, object: Arc<dyn ArtifactFetcher>) -> Self {
        self.object = Some(object);
        self
    }
}

#[async_trait]
impl ArtifactFetcher for RoutingFetcher {
    async fn fetch(&self, reference: &StorageReference) -> ScanResult<ArtifactHandle> {
        match reference.provider {
            StorageProvider::Local => self.local.fetch(reference).await,
            StorageProvider::ObjectStorage => match &self.object {
                Some(object) => object.fetch(reference).await,
                None => Err(ScanError::Fetch(
                    "object storage is not configured".to_string(),
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn local_ref(key: &str) -> StorageReference {
        StorageReference {
            provider: StorageProvider::Local,
            key: key.to_string(),
            uri: None,
        }
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let fetcher = LocalFileFetcher::new("/srv/storage");
        assert!(fetcher.resolve("../etc/passwd").is_err());
        assert!(fetcher.resolve("org/../../x").is_err());
        assert!(fetcher.resolve("/etc/passwd").is_err());
        assert!(fetcher.resolve("").is_err());
        assert_eq!(
            fetcher.resolve("org/a.pdf").unwrap(),
            PathBuf::from("/srv/storage/org/a.pdf")
        );
    }

    #[tokio::test]
    async fn test_local_fetch_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("org")).unwrap();
        std::fs::write(dir.path().join("org/a.txt"), b"hello evidence").unwrap();

        let fetcher = LocalFileFetcher::new(dir.path());
        let mut handle = fetcher.fetch(&local_ref("org/a.txt")).await.unwrap();
        assert_eq!(handle.size, Some(14));

        let mut buf = String::new();
        handle.reader.read_to_string(&mut buf).await.unwrap();
        assert_eq!(buf, "hello evidence");
    }

    #[tokio::test]
    async fn test_local_fetch_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = LocalFileFetcher::new(dir.path());
        let err = fetcher.fetch(&local_ref("missing.pdf")).await.unwrap_err();
        assert_eq!(err.category(), "fetch_failed");
    }

    #[tokio::test]
    async fn test_routing_without_object_storage() {
        let dir = tempfile::tempdir().unwrap();
        let router = RoutingFetcher::new(Arc::new(LocalFileFetcher::new(dir.path())));
        let reference = StorageReference {
            provider: StorageProvider::ObjectStorage,
            key: "org/a.pdf".into(),
            uri: Some("https://objects.example.com/org/a.pdf".into()),
        };
        assert!(matches!(
            router.fetch(&reference).await,
            Err(ScanError::Fetch(_))
        ));
    }

    #[tokio::test]
    async fn test_object_fetch_requires_uri() {
        let fetcher = HttpObjectFetcher::with_client(reqwest::Client::new());
        let reference = StorageReference {
            provider: StorageProvider::ObjectStorage,
            key: "org/a.pdf".into(),
            uri: None,
        };
        assert!(matches!(
            fetcher.fetch(&reference).await,
            Err(ScanError::Fetch(_))
        ));
    }

    #[tokio::test]
    async fn test_from_bytes_handle() {
        let mut handle = ArtifactHandle::from_bytes(b"abc".to_vec());
        assert_eq!(handle.size, Some(3));
        let mut buf = Vec::new();
        handle.reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"abc");
    }
}

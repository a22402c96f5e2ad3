//! Storage backends for the metadata document

use super::schema::MetadataDocument;
use crate::error::MetadataError;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// Durable home of the metadata document.
///
/// `store` is a compare-and-swap on the document version: it succeeds only
/// if the stored document still has version `expected` (`None` = absent)
/// and returns the new version.
#[async_trait::async_trait]
pub trait MetadataBackend: Send + Sync {
    async fn load(&self) -> Result<Option<MetadataDocument>, MetadataError>;

    async fn store(&self, expected: Option<u64>, document: &MetadataDocument) -> Result<u64, MetadataError>;
}

fn check_expected(current: Option<u64>, expected: Option<u64>) -> Result<u64, MetadataError> {
    if current != expected {
        return Err(MetadataError::VersionMismatch {
            expected,
            actual: current,
        });
    }
    Ok(expected.unwrap_or(0) + 1)
}

/// In-process backend with fault injection
#[derive(Debug)]
pub struct MemoryBackend {
    document: Mutex<Option<MetadataDocument>>,
    available: AtomicBool,
    drop_next_ack: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            document: Mutex::new(None),
            available: AtomicBool::new(true),
            drop_next_ack: AtomicBool::new(false),
        }
    }

    /// Simulate loss of the metadata-holding member
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Apply the next write but report it as failed
    pub fn drop_next_ack(&self) {
        self.drop_next_ack.store(true, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), MetadataError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MetadataError::Unavailable("metadata server is not reachable".to_string()))
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MetadataBackend for MemoryBackend {
    async fn load(&self) -> Result<Option<MetadataDocument>, MetadataError> {
        self.ensure_available()?;
        Ok(self.document.lock().await.clone())
    }

    async fn store(&self, expected: Option<u64>, document: &MetadataDocument) -> Result<u64, MetadataError> {
        self.ensure_available()?;
        let mut current = self.document.lock().await;
        let version = check_expected(current.as_ref().map(|d| d.version), expected)?;

        let mut stored = document.clone();
        stored.version = version;
        *current = Some(stored);

        if self.drop_next_ack.swap(false, Ordering::SeqCst) {
            return Err(MetadataError::Unavailable(
                "connection lost before the commit was acknowledged".to_string(),
            ));
        }
        Ok(version)
    }
}

/// JSON document on local disk, replaced atomically on every store
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileBackend {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Option<MetadataDocument>, MetadataError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl MetadataBackend for FileBackend {
    async fn load(&self) -> Result<Option<MetadataDocument>, MetadataError> {
        let _guard = self.guard.lock().await;
        self.read().await
    }

    async fn store(&self, expected: Option<u64>, document: &MetadataDocument) -> Result<u64, MetadataError> {
        let _guard = self.guard.lock().await;
        let current = self.read().await?;
        let version = check_expected(current.map(|d| d.version), expected)?;

        let mut stored = document.clone();
        stored.version = version;
        let bytes = serde_json::to_vec_pretty(&stored)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        file.write_all(&bytes)?;
        file.as_file().sync_all()?;
        file.persist(&self.path).map_err(|e| MetadataError::Io(e.error))?;

        tracing::debug!("Stored metadata document version {} to {:?}", version, self.path);
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_cas() {
        let backend = MemoryBackend::new();
        let doc = MetadataDocument::new();

        assert_eq!(backend.store(None, &doc).await.unwrap(), 1);
        assert!(matches!(
            backend.store(None, &doc).await,
            Err(MetadataError::VersionMismatch { .. })
        ));
        assert_eq!(backend.store(Some(1), &doc).await.unwrap(), 2);
        assert_eq!(backend.load().await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_memory_backend_lost_ack_still_applies() {
        let backend = MemoryBackend::new();
        backend.drop_next_ack();

        let err = backend.store(None, &MetadataDocument::new()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(backend.load().await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_file_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path().join("topology.json"));

        assert!(backend.load().await.unwrap().is_none());
        backend.store(None, &MetadataDocument::new()).await.unwrap();

        let reopened = FileBackend::new(backend.path());
        let doc = reopened.load().await.unwrap().unwrap();
        assert_eq!(doc.version, 1);
        assert!(matches!(
            reopened.store(Some(7), &doc).await,
            Err(MetadataError::VersionMismatch { .. })
        ));
    }
}

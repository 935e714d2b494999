//! Artifact store for payloads too large to live in state.
//!
//! Price series, transcripts and full reports are written here; state and
//! wire events carry only an [`ArtifactRef`] plus a short preview.
//! Artifacts are keyed `(thread_id, artifact_id)` and owned by their
//! thread; deletion runs through a retention window so references in the
//! latest checkpoints never dangle.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Artifact store error
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// Unknown thread or artifact id
    #[error("Artifact not found: {0}")]
    NotFound(String),

    /// Filesystem failure
    #[error("Artifact I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reference stored in state in place of the payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRef {
    /// Opaque id within the owning thread
    pub artifact_id: String,
    /// Content kind, e.g. `"json"`, `"text"`
    #[serde(rename = "type")]
    pub kind: String,
    /// Short preview for immediate rendering
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Blob storage keyed by `(thread_id, artifact_id)`
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store a payload and return its reference
    async fn put(
        &self,
        thread_id: &str,
        kind: &str,
        summary: Option<String>,
        bytes: Vec<u8>,
    ) -> Result<ArtifactRef, ArtifactError>;

    /// Fetch a payload
    async fn get(&self, thread_id: &str, artifact_id: &str) -> Result<Vec<u8>, ArtifactError>;

    /// Drop all artifacts of a thread (after the retention window)
    async fn delete_thread(&self, thread_id: &str) -> Result<(), ArtifactError>;
}

/// Filesystem-backed store: `<root>/<thread_id>/<artifact_id>`
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `root`, creating the directory if needed
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        thread_id: &str,
        kind: &str,
        summary: Option<String>,
        bytes: Vec<u8>,
    ) -> Result<ArtifactRef, ArtifactError> {
        let artifact_id = Uuid::new_v4().to_string();
        let dir = self.root.join(thread_id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&artifact_id), bytes).await?;
        tracing::debug!(thread_id, artifact_id = %artifact_id, kind, "artifact stored");
        Ok(ArtifactRef {
            artifact_id,
            kind: kind.to_string(),
            summary,
        })
    }

    async fn get(&self, thread_id: &str, artifact_id: &str) -> Result<Vec<u8>, ArtifactError> {
        // Ids are server-generated UUIDs; refuse anything path-like.
        if artifact_id.contains(['/', '\\', '.']) || thread_id.contains(['/', '\\', '.']) {
            return Err(ArtifactError::NotFound(artifact_id.to_string()));
        }
        let path = self.root.join(thread_id).join(artifact_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(artifact_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), ArtifactError> {
        let dir = self.root.join(thread_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store for tests and embedded engines
#[derive(Default)]
pub struct MemoryArtifactStore {
    blobs: DashMap<(String, String), Vec<u8>>,
}

impl MemoryArtifactStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        thread_id: &str,
        kind: &str,
        summary: Option<String>,
        bytes: Vec<u8>,
    ) -> Result<ArtifactRef, ArtifactError> {
        let artifact_id = Uuid::new_v4().to_string();
        self.blobs
            .insert((thread_id.to_string(), artifact_id.clone()), bytes);
        Ok(ArtifactRef {
            artifact_id,
            kind: kind.to_string(),
            summary,
        })
    }

    async fn get(&self, thread_id: &str, artifact_id: &str) -> Result<Vec<u8>, ArtifactError> {
        self.blobs
            .get(&(thread_id.to_string(), artifact_id.to_string()))
            .map(|entry| entry.clone())
            .ok_or_else(|| ArtifactError::NotFound(artifact_id.to_string()))
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), ArtifactError> {
        self.blobs.retain(|(owner, _), _| owner != thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();
        let reference = store
            .put("t1", "json", Some("price series".to_string()), b"[1,2,3]".to_vec())
            .await
            .unwrap();
        let bytes = store.get("t1", &reference.artifact_id).await.unwrap();
        assert_eq!(bytes, b"[1,2,3]");
    }

    #[tokio::test]
    async fn test_fs_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.get("t1", "no-such-id").await,
            Err(ArtifactError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.get("t1", "../../etc/passwd").await,
            Err(ArtifactError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_thread_scopes_to_owner() {
        let store = MemoryArtifactStore::new();
        let kept = store.put("t2", "text", None, b"keep".to_vec()).await.unwrap();
        store.put("t1", "text", None, b"drop".to_vec()).await.unwrap();

        store.delete_thread("t1").await.unwrap();
        assert!(store.get("t2", &kept.artifact_id).await.is_ok());
    }
}

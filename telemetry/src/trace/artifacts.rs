//! Content-addressed artifact store.
//!
//! Screenshots, HTML snapshots and JSON payloads live next to the trace as
//! `<run_dir>/artifacts/<sha256>.<ext>`. Trace events only carry an
//! [`ArtifactRef`]; the report loads the referenced content back through
//! [`ArtifactStore::collect`].

use sha2::{Digest, Sha256};
use shared_types::{ArtifactKind, ArtifactRef};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::tree::ActionTree;

pub const ARTIFACTS_DIR_NAME: &str = "artifacts";

#[derive(Debug, thiserror::Error, Clone)]
pub enum ArtifactError {
    #[error("Artifact I/O error: {0}")]
    Io(String),

    #[error("Not a SHA-256 content hash: {0:?}")]
    InvalidHash(String),

    #[error("Artifact {expected} is corrupt (content hashes to {actual})")]
    HashMismatch { expected: String, actual: String },
}

impl From<std::io::Error> for ArtifactError {
    fn from(e: std::io::Error) -> Self {
        ArtifactError::Io(e.to_string())
    }
}

pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Lowercase hex SHA-256, the only form `put` produces. Anything else read
/// back from a trace never becomes part of a path.
pub fn is_content_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactContent {
    Inline(Vec<u8>),
    /// Stored elsewhere; only the location is known
    Pointer(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub reference: ArtifactRef,
    pub content: ArtifactContent,
}

/// Artifacts available to the report renderer, keyed by content hash
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactSet {
    entries: BTreeMap<String, Artifact>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_inline(&mut self, reference: ArtifactRef, content: Vec<u8>) {
        self.entries.insert(
            reference.content_hash.clone(),
            Artifact {
                reference,
                content: ArtifactContent::Inline(content),
            },
        );
    }

    pub fn insert_pointer(&mut self, reference: ArtifactRef, location: impl Into<String>) {
        self.entries.insert(
            reference.content_hash.clone(),
            Artifact {
                reference,
                content: ArtifactContent::Pointer(location.into()),
            },
        );
    }

    pub fn get(&self, content_hash: &str) -> Option<&Artifact> {
        self.entries.get(content_hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn for_run_dir(run_dir: &Path) -> Self {
        Self {
            root: run_dir.join(ARTIFACTS_DIR_NAME),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, content_hash: &str, kind: ArtifactKind) -> PathBuf {
        self.root
            .join(format!("{content_hash}.{}", kind.extension()))
    }

    /// Store content and return its reference. Storing the same bytes twice
    /// is a no-op.
    pub async fn put(
        &self,
        kind: ArtifactKind,
        mime: &str,
        name: Option<&str>,
        content: &[u8],
    ) -> Result<ArtifactRef, ArtifactError> {
        let hash = content_hash(content);
        let path = self.path_for(&hash, kind);

        if fs::try_exists(&path).await.unwrap_or(false) {
            tracing::debug!(content_hash = %hash, "Artifact already stored");
        } else {
            fs::create_dir_all(&self.root).await?;
            let tmp_path = path.with_extension(format!("{}.tmp", kind.extension()));
            fs::write(&tmp_path, content).await?;
            fs::rename(&tmp_path, &path).await?;
            tracing::debug!(
                content_hash = %hash,
                bytes = content.len(),
                path = %path.display(),
                "Stored artifact"
            );
        }

        Ok(ArtifactRef {
            content_hash: hash,
            kind,
            mime: mime.to_string(),
            name: name.map(str::to_string),
        })
    }

    /// Load and verify an artifact; `None` when it is not in the store.
    pub async fn get(&self, reference: &ArtifactRef) -> Result<Option<Vec<u8>>, ArtifactError> {
        if !is_content_hash(&reference.content_hash) {
            return Err(ArtifactError::InvalidHash(reference.content_hash.clone()));
        }
        let path = self.path_for(&reference.content_hash, reference.kind);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let actual = content_hash(&content);
        if actual != reference.content_hash {
            return Err(ArtifactError::HashMismatch {
                expected: reference.content_hash.clone(),
                actual,
            });
        }
        Ok(Some(content))
    }

    /// Load every artifact referenced by events of the tree. Missing or
    /// corrupt artifacts are left out; the report shows a placeholder.
    pub async fn collect(&self, tree: &ActionTree) -> ArtifactSet {
        let mut set = ArtifactSet::new();
        for event in tree.events() {
            let Some(reference) = &event.artifact_ref else {
                continue;
            };
            if set.get(&reference.content_hash).is_some() {
                continue;
            }
            match self.get(reference).await {
                Ok(Some(content)) => set.insert_inline(reference.clone(), content),
                Ok(None) => {
                    tracing::warn!(
                        content_hash = %reference.content_hash,
                        sequence_no = event.sequence_no,
                        "Referenced artifact is missing"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        content_hash = %reference.content_hash,
                        error = %e,
                        "Skipping unreadable artifact"
                    );
                }
            }
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_is_content_addressed() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::for_run_dir(dir.path());

        let first = store
            .put(ArtifactKind::Json, "application/json", Some("fields"), br#"{"a":1}"#)
            .await
            .unwrap();
        let second = store
            .put(ArtifactKind::Json, "application/json", None, br#"{"a":1}"#)
            .await
            .unwrap();
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.content_hash, content_hash(br#"{"a":1}"#));

        let loaded = store.get(&first).await.unwrap();
        assert_eq!(loaded.as_deref(), Some(&br#"{"a":1}"#[..]));

        let entries = std::fs::read_dir(store.root()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_get_detects_corruption_and_absence() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::for_run_dir(dir.path());

        let reference = store
            .put(ArtifactKind::Text, "text/plain", None, b"hello")
            .await
            .unwrap();
        std::fs::write(store.path_for(&reference.content_hash, ArtifactKind::Text), b"tampered")
            .unwrap();
        assert!(matches!(
            store.get(&reference).await,
            Err(ArtifactError::HashMismatch { .. })
        ));

        let missing = ArtifactRef {
            content_hash: content_hash(b"never stored"),
            kind: ArtifactKind::Image,
            mime: "image/png".to_string(),
            name: None,
        };
        assert_eq!(store.get(&missing).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_rejects_malformed_hashes() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::for_run_dir(dir.path());
        std::fs::write(dir.path().join("secret.txt"), b"not an artifact").unwrap();

        let uppercase = "AB".repeat(32);
        for hash in ["../secret", "a\u{20ac}\u{20ac}\u{20ac}\u{20ac}\u{20ac}", uppercase.as_str()] {
            let reference = ArtifactRef {
                content_hash: hash.to_string(),
                kind: ArtifactKind::Text,
                mime: "text/plain".to_string(),
                name: None,
            };
            assert!(matches!(
                store.get(&reference).await,
                Err(ArtifactError::InvalidHash(_))
            ));
        }
        assert!(is_content_hash(&content_hash(b"x")));
    }
}

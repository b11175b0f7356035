//! Filesystem object storage for original uploads.
//!
//! Each upload is written under `<root>/<uuid>/<filename>` and the handle
//! is that relative path. Bytes are stored and returned unchanged.

use anyhow::{Context, Result};
use async_trait::async_trait;
use casesheet_core::error::PipelineError;
use casesheet_core::providers::ObjectStore;
use std::path::{Component, Path, PathBuf};

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a handle, refusing anything that would escape the root.
    fn path_for(&self, handle: &str) -> Result<PathBuf> {
        let rel = Path::new(handle);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if handle.is_empty() || escapes {
            return Err(PipelineError::not_found("object", handle).into());
        }
        Ok(self.root.join(rel))
    }

    /// Open the stored file for streaming.
    pub async fn open(&self, handle: &str) -> Result<tokio::fs::File> {
        let path = self.path_for(handle)?;
        match tokio::fs::File::open(&path).await {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PipelineError::not_found("object", handle).into())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to open {}", path.display())),
        }
    }
}

/// Keep a filename usable as a single path component.
fn sanitize(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<String> {
        let handle = format!("{}/{}", uuid::Uuid::new_v4(), sanitize(name));
        let path = self.root.join(&handle);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(handle)
    }

    async fn get(&self, handle: &str) -> Result<Vec<u8>> {
        let path = self.path_for(handle)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PipelineError::not_found("object", handle).into())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    async fn delete(&self, handle: &str) -> Result<()> {
        let path = self.path_for(handle)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to delete {}", path.display()))
            }
        }
        if let Some(parent) = path.parent() {
            // Only the per-upload directory; fails harmlessly if not empty.
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_get_is_byte_exact() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        let bytes: Vec<u8> = (0..=255u8).collect();
        let handle = store.put("recibo nómina.pdf", &bytes).await.unwrap();
        assert!(handle.ends_with("/recibo_nómina.pdf"));
        assert_eq!(store.get(&handle).await.unwrap(), bytes);
    }

    #[tokio::test]
    async fn test_delete_then_get_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path());
        let handle = store.put("a.txt", b"hola").await.unwrap();
        store.delete(&handle).await.unwrap();
        store.delete(&handle).await.unwrap();
        let err = store.get(&handle).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejects_escaping_handle() {
        let dir = TempDir::new().unwrap();
        let store = FsObjectStore::new(dir.path().join("files"));
        assert!(store.get("../secret").await.is_err());
        assert!(store.get("/etc/passwd").await.is_err());
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("../../x/contrato 2021.pdf"), "contrato_2021.pdf");
        assert_eq!(sanitize(".."), "upload");
    }
}

//! Storage for uploaded product and post images.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::errors::ShopError;

const ALLOWED_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "gif", "webp", "svg"];

/// Where uploaded files live. Implementations return the public URL of a
/// saved file and accept that same URL for deletion.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn save(&self, original_name: &str, bytes: &[u8]) -> Result<String>;

    /// Returns `false` when `url` does not name a stored file.
    async fn delete(&self, url: &str) -> Result<bool>;
}

/// Files on local disk, served by the router under `url_prefix`.
pub struct LocalMediaStore {
    dir: PathBuf,
    url_prefix: String,
    max_bytes: usize,
}

impl LocalMediaStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            url_prefix: "/uploads".to_string(),
            max_bytes,
        }
    }

    /// File name under `dir` for a URL this store produced.
    fn file_name_for(&self, url: &str) -> Option<String> {
        let name = url.strip_prefix(&self.url_prefix)?.strip_prefix('/')?;
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            && !name.starts_with('.');
        valid.then(|| name.to_string())
    }
}

fn extension_of(original_name: &str) -> Result<String, ShopError> {
    let ext = std::path::Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(ShopError::Validation(format!(
            "Unsupported file type '{}'; allowed: {}",
            original_name,
            ALLOWED_EXTENSIONS.join(", ")
        )));
    }
    Ok(ext)
}

#[async_trait]
impl MediaStore for LocalMediaStore {
    async fn save(&self, original_name: &str, bytes: &[u8]) -> Result<String> {
        if bytes.is_empty() {
            return Err(ShopError::Validation("Uploaded file is empty".into()).into());
        }
        if bytes.len() > self.max_bytes {
            return Err(ShopError::Validation(format!(
                "File is {} bytes; the limit is {}",
                bytes.len(),
                self.max_bytes
            ))
            .into());
        }
        let ext = extension_of(original_name)?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create uploads dir {}", self.dir.display()))?;
        let name = format!("{}.{}", uuid::Uuid::new_v4(), ext);
        let path = self.dir.join(&name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write upload {}", path.display()))?;

        tracing::info!(file = %name, size = bytes.len(), "Stored upload");
        Ok(format!("{}/{}", self.url_prefix, name))
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        let Some(name) = self.file_name_for(url) else {
            return Ok(false);
        };
        match tokio::fs::remove_file(self.dir.join(&name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(anyhow::Error::new(e).context("Failed to delete upload")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMediaStore::new(dir.path().join("uploads"), 1024);

        let url = store.save("Cao Dán.PNG", b"\x89PNG").await.unwrap();
        assert!(url.starts_with("/uploads/"));
        assert!(url.ends_with(".png"));
        let name = url.trim_start_matches("/uploads/");
        assert!(store.dir.join(name).exists());

        assert!(store.delete(&url).await.unwrap());
        assert!(!store.delete(&url).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_disallowed_extension_and_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMediaStore::new(dir.path(), 4);

        let err = store.save("run.exe", b"MZ").await.unwrap_err();
        assert!(err.downcast_ref::<ShopError>().is_some());

        let err = store.save("big.png", b"12345").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ShopError>(),
            Some(ShopError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_ignores_foreign_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalMediaStore::new(dir.path(), 1024);
        assert!(!store.delete("/uploads/../secret.txt").await.unwrap());
        assert!(!store.delete("https://cdn.example.com/a.png").await.unwrap());
    }
}

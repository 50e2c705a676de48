use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::{debug, info};

/// Where uploaded media bytes end up. Returns the public URL of the object.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, data: Bytes, content_type: &str) -> Result<String>;
}

/// Stores objects as flat files under `{dir}/{key}` and hands out URLs
/// served from `{public_url}/files/{key}`.
pub struct LocalObjectStore {
    dir: PathBuf,
    public_url: String,
}

impl LocalObjectStore {
    pub async fn new(dir: PathBuf, public_url: impl Into<String>) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Object storage directory: {}", dir.display());
        Ok(Self {
            dir,
            public_url: public_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            bail!("Refusing object key outside storage root: {}", key);
        }
        Ok(self.dir.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put_object(&self, key: &str, data: Bytes, content_type: &str) -> Result<String> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &data).await?;

        debug!("Stored {} ({} bytes, {})", key, data.len(), content_type);
        Ok(format!("{}/files/{}", self.public_url, key))
    }
}

/// Reduce a client-supplied file name to something safe to embed in a key.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("circle-store-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_put_object_writes_file_and_returns_url() {
        let dir = scratch_dir();
        let store = LocalObjectStore::new(dir.clone(), "http://localhost:3000/")
            .await
            .unwrap();

        let url = store
            .put_object("uploads/u1/1_cat.png", Bytes::from_static(b"png"), "image/png")
            .await
            .unwrap();

        assert_eq!(url, "http://localhost:3000/files/uploads/u1/1_cat.png");
        assert_eq!(std::fs::read(dir.join("uploads/u1/1_cat.png")).unwrap(), b"png");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_put_object_rejects_traversal() {
        let dir = scratch_dir();
        let store = LocalObjectStore::new(dir.clone(), "http://x").await.unwrap();
        let result = store
            .put_object("../escape.txt", Bytes::from_static(b"x"), "text/plain")
            .await;
        assert!(result.is_err());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("holiday photo.jpg"), "holiday_photo.jpg");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename(".."), "upload");
        assert_eq!(sanitize_filename(""), "upload");
    }
}

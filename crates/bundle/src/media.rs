//! Media bucket
//!
//! Content-addressed asset store. An asset's id is the SHA-256 of its
//! bytes plus the original extension, so identical assets from different
//! plugins share one file.

use crate::error::{BundleError, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct MediaBucket {
    root: PathBuf,
}

impl MediaBucket {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Id the bucket assigns to `content` uploaded under `name`.
    pub fn media_id(name: &str, content: &[u8]) -> String {
        let digest = hex::encode(Sha256::digest(content));
        match Path::new(name).extension().and_then(|e| e.to_str()) {
            Some(ext) if !ext.is_empty() => format!("{digest}.{}", ext.to_ascii_lowercase()),
            _ => digest,
        }
    }

    /// Store `content`; returns its id. Existing content is not rewritten.
    pub async fn upload(&self, name: &str, content: &[u8]) -> Result<String> {
        let id = Self::media_id(name, content);
        let target = self.root.join(&id);
        if tokio::fs::try_exists(&target).await? {
            return Ok(id);
        }

        let staging = self.root.join(format!(".{id}.tmp"));
        tokio::fs::write(&staging, content).await?;
        tokio::fs::rename(&staging, &target).await?;
        debug!("Stored media {} ({} bytes) for {}", id, content.len(), name);
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_of(id)?;
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns whether something was removed.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let path = self.path_of(id)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn path_of(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && !id.starts_with('.')
            && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '.');
        if !valid {
            return Err(BundleError::InvalidMediaId(id.to_string()));
        }
        Ok(self.root.join(id))
    }
}

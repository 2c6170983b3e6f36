//! Filesystem blob store for extracted images. Layout is
//! `{base}/{session_id}/{document_id}/{image_index}.{ext}`; deletion is by
//! document or session directory.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

pub struct ImageStore {
    base: PathBuf,
    max_file_size_bytes: usize,
}

impl ImageStore {
    pub fn new(base: impl Into<PathBuf>, max_file_size_bytes: usize) -> Self {
        Self {
            base: base.into(),
            max_file_size_bytes,
        }
    }

    fn document_dir(&self, session_id: Uuid, document_id: Uuid) -> PathBuf {
        self.base.join(session_id.to_string()).join(document_id.to_string())
    }

    pub fn extension_for_mime(mime: &str) -> &'static str {
        match mime {
            "image/png" => "png",
            "image/jpeg" => "jpg",
            "image/gif" => "gif",
            "image/webp" => "webp",
            _ => "bin",
        }
    }

    /// Write one image; `None` when the image exceeds the size cap (skipped
    /// with a warning, not an error).
    pub async fn save(
        &self,
        session_id: Uuid,
        document_id: Uuid,
        image_index: usize,
        mime: &str,
        bytes: &[u8],
    ) -> Result<Option<PathBuf>> {
        if bytes.len() > self.max_file_size_bytes {
            warn!(
                size = bytes.len(),
                max = self.max_file_size_bytes,
                image_index,
                "image exceeds size cap, skipping"
            );
            return Ok(None);
        }

        let dir = self.document_dir(session_id, document_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating image dir {}", dir.display()))?;

        let path = dir.join(format!(
            "{image_index}.{}",
            Self::extension_for_mime(mime)
        ));
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing image {}", path.display()))?;

        debug!(path = %path.display(), size = bytes.len(), "image stored");
        Ok(Some(path))
    }

    pub async fn load(&self, path: &Path) -> Result<Vec<u8>> {
        tokio::fs::read(path)
            .await
            .with_context(|| format!("reading image {}", path.display()))
    }

    pub async fn delete_document(&self, session_id: Uuid, document_id: Uuid) -> Result<()> {
        let dir = self.document_dir(session_id, document_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", dir.display())),
        }
    }

    pub async fn delete_session(&self, session_id: Uuid) -> Result<()> {
        let dir = self.base.join(session_id.to_string());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", dir.display())),
        }
    }

    pub async fn session_is_empty(&self, session_id: Uuid) -> bool {
        let dir = self.base.join(session_id.to_string());
        match tokio::fs::read_dir(&dir).await {
            Ok(mut entries) => entries.next_entry().await.ok().flatten().is_none(),
            Err(_) => true,
        }
    }
}

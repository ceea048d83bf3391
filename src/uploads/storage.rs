use anyhow::{bail, Context, Result};
use std::io::ErrorKind;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use tokio::fs;

const CHUNK_ROOT: &str = "temp/chunk_uploads";

/// Blob storage rooted at one directory: stored files, chunk bytes and
/// suggestion bundles all live under it, addressed by relative path.
#[derive(Debug, Clone)]
pub struct BlobStorage {
    base_dir: PathBuf,
}

impl BlobStorage {
    pub fn from_path(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Absolute path for a relative one. Rejects `..` and absolute inputs.
    pub fn absolute_path(&self, rel_path: &str) -> Result<PathBuf> {
        let rel = Path::new(rel_path);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("Refusing path outside storage root: {rel_path}");
        }
        Ok(self.base_dir.join(rel))
    }

    /// Write bytes to `rel_path`, creating parent directories. The bytes land
    /// in a sibling temp file first and are renamed into place.
    pub async fn put(&self, rel_path: &str, data: &[u8]) -> Result<PathBuf> {
        let abs_path = self.absolute_path(rel_path)?;
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp = abs_path.with_extension(format!("part-{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, data)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &abs_path)
            .await
            .with_context(|| format!("Failed to move file into {}", abs_path.display()))?;
        Ok(abs_path)
    }

    pub async fn read(&self, rel_path: &str) -> Result<Vec<u8>> {
        let abs = self.absolute_path(rel_path)?;
        fs::read(&abs)
            .await
            .with_context(|| format!("Failed to read {}", abs.display()))
    }

    /// Delete a file; a missing file is not an error.
    pub async fn delete(&self, rel_path: &str) -> Result<()> {
        let abs = self.absolute_path(rel_path)?;
        match fs::remove_file(&abs).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", abs.display())),
        }
    }

    pub async fn exists(&self, rel_path: &str) -> Result<bool> {
        let abs = self.absolute_path(rel_path)?;
        Ok(fs::try_exists(&abs).await?)
    }

    // ── chunk bytes ──────────────────────────────────────────────

    /// One directory per identifier, named by its SHA-256 so that distinct
    /// identifiers never share a directory and none of them can name the
    /// chunk root itself.
    fn chunk_dir(identifier: &str) -> String {
        format!("{CHUNK_ROOT}/{}", hex::encode(Sha256::digest(identifier.as_bytes())))
    }

    /// Relative path of one chunk of an upload session.
    pub fn chunk_path(identifier: &str, index: u32) -> String {
        format!("{}/chunk_{index}", Self::chunk_dir(identifier))
    }

    /// Persist one chunk, overwriting any earlier bytes for the same index.
    pub async fn put_chunk(&self, identifier: &str, index: u32, data: &[u8]) -> Result<String> {
        let rel = Self::chunk_path(identifier, index);
        self.put(&rel, data).await?;
        Ok(rel)
    }

    /// Chunk bytes, or `None` when the chunk file is gone.
    pub async fn read_chunk(&self, identifier: &str, index: u32) -> Result<Option<Vec<u8>>> {
        let abs = self.absolute_path(&Self::chunk_path(identifier, index))?;
        match fs::read(&abs).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", abs.display())),
        }
    }

    /// Remove every chunk of a session. Missing directories are fine.
    pub async fn discard_chunks(&self, identifier: &str) -> Result<()> {
        let abs = self.absolute_path(&Self::chunk_dir(identifier))?;
        match fs::remove_dir_all(&abs).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", abs.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn put_read_delete() {
        let tmp = TempDir::new().unwrap();
        let storage = BlobStorage::from_path(tmp.path().to_path_buf());
        storage.put("wordpress/php/site/a.php", b"<?php").await.unwrap();
        assert_eq!(storage.read("wordpress/php/site/a.php").await.unwrap(), b"<?php");
        storage.delete("wordpress/php/site/a.php").await.unwrap();
        storage.delete("wordpress/php/site/a.php").await.unwrap();
        assert!(!storage.exists("wordpress/php/site/a.php").await.unwrap());
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let storage = BlobStorage::from_path(tmp.path().to_path_buf());
        assert!(storage.put("../escape", b"x").await.is_err());
        assert!(storage.read("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn chunk_overwrite_and_discard() {
        let tmp = TempDir::new().unwrap();
        let storage = BlobStorage::from_path(tmp.path().to_path_buf());
        storage.put_chunk("up/1", 0, b"old").await.unwrap();
        storage.put_chunk("up/1", 0, b"new").await.unwrap();
        assert_eq!(storage.read_chunk("up/1", 0).await.unwrap().unwrap(), b"new");
        assert!(storage.read_chunk("up/1", 1).await.unwrap().is_none());
        storage.discard_chunks("up/1").await.unwrap();
        storage.discard_chunks("up/1").await.unwrap();
        assert!(storage.read_chunk("up/1", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lookalike_identifiers_keep_separate_chunks() {
        let tmp = TempDir::new().unwrap();
        let storage = BlobStorage::from_path(tmp.path().to_path_buf());
        storage.put_chunk("a/b", 0, b"XXXX").await.unwrap();
        storage.put_chunk("a_b", 0, b"YYYY").await.unwrap();
        assert_eq!(storage.read_chunk("a/b", 0).await.unwrap().unwrap(), b"XXXX");
        assert_eq!(storage.read_chunk("a_b", 0).await.unwrap().unwrap(), b"YYYY");

        storage.discard_chunks("a_b").await.unwrap();
        assert_eq!(storage.read_chunk("a/b", 0).await.unwrap().unwrap(), b"XXXX");
    }

    #[tokio::test]
    async fn dot_and_empty_identifiers_stay_inside_their_own_directory() {
        let tmp = TempDir::new().unwrap();
        let storage = BlobStorage::from_path(tmp.path().to_path_buf());
        storage.put_chunk("victim", 0, b"AAAA").await.unwrap();
        storage.discard_chunks("").await.unwrap();
        storage.discard_chunks(".").await.unwrap();
        storage.discard_chunks("..").await.unwrap();
        assert_eq!(storage.read_chunk("victim", 0).await.unwrap().unwrap(), b"AAAA");
    }
}

//! Blob storage seam used for archive groups.
//!
//! Archive blobs are content addressed: the id is the BLAKE3 hash of the
//! encoded bytes, so writing the same range twice yields the same blob.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use parley_shared::types::BlobId;
use parley_shared::CommunicationError;
use tokio::fs;

type BlobResult<T> = std::result::Result<T, CommunicationError>;

#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn put(&self, id: &BlobId, data: &[u8]) -> BlobResult<()>;
    /// Fails with [`CommunicationError::NotFound`] when the blob is absent.
    async fn get(&self, id: &BlobId) -> BlobResult<Vec<u8>>;
    /// Deleting a missing blob is not an error.
    async fn delete(&self, id: &BlobId) -> BlobResult<()>;
}

/// Content address of a blob.
pub fn blob_id_for(data: &[u8]) -> BlobId {
    BlobId::new(hex::encode(blake3::hash(data).as_bytes()))
}

/// Blob ids become file names; only a conservative character set passes.
pub fn validate_blob_id(id: &BlobId) -> BlobResult<()> {
    let s = id.as_str();
    let ok = !s.is_empty()
        && s.len() <= 128
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(CommunicationError::Validation(vec![format!(
            "invalid blob id {s:?}"
        )]))
    }
}

/// Blobs stored as flat files under one directory.
#[derive(Debug, Clone)]
pub struct FsBlobStorage {
    base_path: PathBuf,
}

impl FsBlobStorage {
    pub async fn new(base_path: impl Into<PathBuf>) -> BlobResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await.map_err(|e| {
            io_error(format!("create blob directory '{}'", base_path.display()), e)
        })?;
        tracing::debug!(path = %base_path.display(), "blob directory ready");
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Every stored blob with its last modification time.
    pub async fn list(&self) -> BlobResult<Vec<(BlobId, SystemTime)>> {
        let mut blobs = Vec::new();
        let mut entries = fs::read_dir(&self.base_path)
            .await
            .map_err(|e| io_error("list blobs".into(), e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("read blob directory entry".into(), e))?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            // Partially written files are not blobs yet.
            if name.ends_with(".tmp") {
                continue;
            }
            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            blobs.push((BlobId::new(name), modified));
        }
        Ok(blobs)
    }

    fn path_for(&self, id: &BlobId) -> BlobResult<PathBuf> {
        validate_blob_id(id)?;
        Ok(self.base_path.join(id.as_str()))
    }
}

#[async_trait]
impl BlobStorage for FsBlobStorage {
    async fn put(&self, id: &BlobId, data: &[u8]) -> BlobResult<()> {
        let path = self.path_for(id)?;
        let tmp = path.with_extension("tmp");

        fs::write(&tmp, data)
            .await
            .map_err(|e| io_error(format!("write blob {id}"), e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(format!("commit blob {id}"), e))?;

        tracing::debug!(blob = %id, size = data.len(), "stored blob");
        Ok(())
    }

    async fn get(&self, id: &BlobId) -> BlobResult<Vec<u8>> {
        let path = self.path_for(id)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CommunicationError::NotFound(format!("blob {id}")))
            }
            Err(e) => Err(io_error(format!("read blob {id}"), e)),
        }
    }

    async fn delete(&self, id: &BlobId) -> BlobResult<()> {
        let path = self.path_for(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(blob = %id, "deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(format!("delete blob {id}"), e)),
        }
    }
}

fn io_error(what: String, e: std::io::Error) -> CommunicationError {
    CommunicationError::Remote {
        status: 500,
        message: format!("{what}: {e}"),
    }
}

/// In-process blob storage for tests and the offline client.
#[derive(Debug, Default)]
pub struct MemoryBlobStorage {
    blobs: Mutex<HashMap<BlobId, Vec<u8>>>,
}

impl MemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: &BlobId) -> bool {
        self.lock().contains_key(id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BlobId, Vec<u8>>> {
        self.blobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl BlobStorage for MemoryBlobStorage {
    async fn put(&self, id: &BlobId, data: &[u8]) -> BlobResult<()> {
        self.lock().insert(id.clone(), data.to_vec());
        Ok(())
    }

    async fn get(&self, id: &BlobId) -> BlobResult<Vec<u8>> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| CommunicationError::NotFound(format!("blob {id}")))
    }

    async fn delete(&self, id: &BlobId) -> BlobResult<()> {
        self.lock().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn fs_store_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStorage::new(dir.path()).await.unwrap();
        let data = b"fromDate: 2024-01-01";
        let id = blob_id_for(data);

        store.put(&id, data).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), data);
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.delete(&id).await.unwrap();
        assert!(store.get(&id).await.unwrap_err().is_not_found());
        store.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn traversal_ids_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStorage::new(dir.path()).await.unwrap();
        let err = store.get(&BlobId::from("../etc/passwd")).await.unwrap_err();
        assert!(matches!(err, CommunicationError::Validation(_)));
    }

    #[test]
    fn content_address_is_stable() {
        assert_eq!(blob_id_for(b"abc"), blob_id_for(b"abc"));
        assert_ne!(blob_id_for(b"abc"), blob_id_for(b"abd"));
        assert_eq!(blob_id_for(b"abc").as_str().len(), 64);
    }

    #[tokio::test]
    async fn memory_store_reports_missing() {
        let store = MemoryBlobStorage::new();
        let err = store.get(&BlobId::from("nope")).await.unwrap_err();
        assert!(err.is_not_found());
    }
}

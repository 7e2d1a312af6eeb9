use crate::error::ServiceError;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Filesystem area holding raw video bytes, addressed by generated
/// filename. Records and blobs are created together by the lifecycle
/// manager; nothing else writes into this directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a blob name to a path, rejecting anything that could escape
    /// the storage root.
    pub fn blob_path(&self, name: &str) -> Result<PathBuf, ServiceError> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(ServiceError::Storage(format!(
                "invalid blob name: {:?}",
                name
            )));
        }
        Ok(self.root.join(name))
    }

    /// Create a zero-length blob. Fails if a blob with this name already
    /// exists, which keeps generated filenames collision-safe.
    #[instrument(skip(self), err)]
    pub async fn create_empty(&self, name: &str) -> Result<(), ServiceError> {
        let path = self.blob_path(name)?;
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| {
                ServiceError::Storage(format!(
                    "failed to create blob {}: {}",
                    name, e
                ))
            })?;
        debug!("created empty blob at {}", path.display());
        Ok(())
    }

    /// Append bytes to an existing blob, in arrival order. The blob must
    /// already exist; appending to an unknown name is a storage error, not
    /// an implicit create.
    #[instrument(skip(self, bytes), fields(len = bytes.len()), err)]
    pub async fn append(
        &self,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), ServiceError> {
        let path = self.blob_path(name)?;
        if !fs::try_exists(&path).await? {
            return Err(ServiceError::Storage(format!(
                "blob {} does not exist",
                name
            )));
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                ServiceError::Storage(format!(
                    "failed to open blob {} for append: {}",
                    name, e
                ))
            })?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    /// Move a temporary file into the store under its final name. Refuses
    /// to clobber an existing blob.
    #[instrument(skip(self), err)]
    pub async fn move_into(
        &self,
        temp_path: &Path,
        name: &str,
    ) -> Result<(), ServiceError> {
        let dest = self.blob_path(name)?;
        if fs::try_exists(&dest).await? {
            return Err(ServiceError::Storage(format!(
                "blob {} already exists",
                name
            )));
        }
        fs::rename(temp_path, &dest).await.map_err(|e| {
            ServiceError::Storage(format!(
                "failed to move upload into blob {}: {}",
                name, e
            ))
        })?;
        Ok(())
    }

    /// Write a complete blob: bytes land in a temp file inside the storage
    /// root, then move into place under the final name.
    pub async fn store(
        &self,
        name: &str,
        bytes: &[u8],
    ) -> Result<(), ServiceError> {
        let temp_path = self.root.join(format!(".upload-{}", Uuid::new_v4()));
        fs::write(&temp_path, bytes).await.map_err(|e| {
            ServiceError::Storage(format!(
                "failed to write upload temp file: {}",
                e
            ))
        })?;
        match self.move_into(&temp_path, name).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&temp_path).await {
                    warn!(
                        "failed to remove upload temp file {}: {}",
                        temp_path.display(),
                        cleanup
                    );
                }
                Err(e)
            }
        }
    }

    pub async fn read(&self, name: &str) -> Result<Vec<u8>, ServiceError> {
        let path = self.blob_path(name)?;
        fs::read(&path).await.map_err(|e| {
            ServiceError::Storage(format!(
                "failed to read blob {}: {}",
                name, e
            ))
        })
    }

    pub async fn len(&self, name: &str) -> Result<u64, ServiceError> {
        let path = self.blob_path(name)?;
        let meta = fs::metadata(&path).await.map_err(|e| {
            ServiceError::Storage(format!("failed to stat blob {}: {}", name, e))
        })?;
        Ok(meta.len())
    }

    /// Remove a blob. Used for compensating cleanup when a record insert
    /// fails after the blob was created.
    pub async fn remove(&self, name: &str) -> Result<(), ServiceError> {
        let path = self.blob_path(name)?;
        fs::remove_file(&path).await.map_err(|e| {
            ServiceError::Storage(format!(
                "failed to remove blob {}: {}",
                name, e
            ))
        })
    }
}

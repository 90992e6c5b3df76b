use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Store for uploaded billing files, backed by a local directory.
///
/// Inputs carry PHI and must not persist past processing; the worker deletes
/// each file once its run reaches a terminal state.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Ensure the upload directory exists.
    pub async fn init(&self) -> Result<(), FileStoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| FileStoreError::Io(self.root.display().to_string(), e))?;
        Ok(())
    }

    /// Persist uploaded bytes under a fresh key; returns the stored path.
    pub async fn save(&self, original_filename: &str, data: &[u8]) -> Result<String, FileStoreError> {
        let extension = Path::new(original_filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("csv");
        let path = self.root.join(format!("{}.{}", Uuid::new_v4(), extension));

        tokio::fs::write(&path, data)
            .await
            .map_err(|e| FileStoreError::Io(path.display().to_string(), e))?;

        Ok(path.display().to_string())
    }

    pub async fn exists(&self, path: &str) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>, FileStoreError> {
        tokio::fs::read(path)
            .await
            .map_err(|e| FileStoreError::Io(path.to_string(), e))
    }

    pub async fn size(&self, path: &str) -> Result<u64, FileStoreError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| FileStoreError::Io(path.to_string(), e))?;
        Ok(meta.len())
    }

    /// Delete a stored file. Callers treat failures as non-fatal but loggable.
    pub async fn delete(&self, path: &str) -> Result<(), FileStoreError> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| FileStoreError::Io(path.to_string(), e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("file operation failed on {0}: {1}")]
    Io(String, #[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_read_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.init().await.unwrap();

        let path = store.save("claims.csv", b"a;b;c\n").await.unwrap();
        assert!(store.exists(&path).await);
        assert_eq!(store.read(&path).await.unwrap(), b"a;b;c\n");
        assert_eq!(store.size(&path).await.unwrap(), 6);

        store.delete(&path).await.unwrap();
        assert!(!store.exists(&path).await);
    }

    #[tokio::test]
    async fn delete_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        assert!(store.delete("/nonexistent/file.csv").await.is_err());
    }
}

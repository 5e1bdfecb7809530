//! Blobs as plain files under a root directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{normalize_name, validate_name, BlobAttributes, BlobStore, StorageError};

/// Prefix of the scratch file an upload writes before renaming into place.
const PARTIAL_PREFIX: &str = ".partial-";

/// Stores each blob as a file; `/` in a name maps to nested directories.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    /// Opens the store rooted at `root`, creating the directory if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(validate_name(name)?))
    }
}

fn not_found(name: &str, err: std::io::Error) -> StorageError {
    if err.kind() == ErrorKind::NotFound {
        StorageError::NotFound(name.to_string())
    } else {
        StorageError::Io(err)
    }
}

#[async_trait]
impl BlobStore for FilesystemStore {
    async fn upload(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let path = self.blob_path(name)?;
        let parent = path.parent().unwrap_or(self.root.as_path()).to_path_buf();
        fs::create_dir_all(&parent).await?;

        // Readers never see a half-written blob.
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let scratch = parent.join(format!("{PARTIAL_PREFIX}{file_name}"));
        fs::write(&scratch, data).await?;
        fs::rename(&scratch, &path).await?;

        debug!(blob = %name, bytes = data.len(), "blob written");
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.blob_path(name)?;
        fs::read(&path).await.map_err(|e| not_found(name, e))
    }

    async fn iter(&self) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                if !file_type.is_file()
                    || entry.file_name().to_string_lossy().starts_with(PARTIAL_PREFIX)
                {
                    continue;
                }

                let path = entry.path();
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                if let Ok(name) = normalize_name(&relative.to_string_lossy()) {
                    names.push(name);
                }
            }
        }

        names.sort();
        Ok(names)
    }

    async fn attributes(&self, name: &str) -> Result<BlobAttributes, StorageError> {
        let path = self.blob_path(name)?;
        let meta = fs::metadata(&path).await.map_err(|e| not_found(name, e))?;
        if !meta.is_file() {
            return Err(StorageError::NotFound(name.to_string()));
        }
        Ok(BlobAttributes { size: meta.len() })
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        let path = self.blob_path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn nested_names_land_in_subdirectories() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemStore::open(tmp.path()).unwrap();

        store.upload("prod/2024.state", b"[]").await.unwrap();

        assert!(tmp.path().join("prod").join("2024.state").is_file());
        assert_eq!(store.iter().await.unwrap(), vec!["prod/2024.state"]);
    }

    #[tokio::test]
    async fn scratch_files_are_not_listed() {
        let tmp = TempDir::new().unwrap();
        let store = FilesystemStore::open(tmp.path()).unwrap();
        std::fs::write(tmp.path().join(".partial-x.state"), b"[").unwrap();
        store.upload("y.state", b"[]").await.unwrap();

        assert_eq!(store.iter().await.unwrap(), vec!["y.state"]);
    }

    #[tokio::test]
    async fn open_creates_missing_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("a").join("b");
        let store = FilesystemStore::open(&root).unwrap();

        assert!(root.is_dir());
        assert_eq!(store.root(), root.as_path());
    }
}

//! Blob storage used for snapshots.
//!
//! The snapshotter only needs upload / get / list / stat / delete, so any
//! object store can sit behind [`BlobStore`]. Two backends ship with the
//! crate: a directory on the local filesystem and an in-memory map.

mod filesystem;
mod memory;

pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::StorageConfig;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid blob name: {0}")]
    InvalidName(String),

    #[error("storage kind `{0}` is not supported")]
    Unsupported(String),
}

/// Metadata returned by [`BlobStore::attributes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobAttributes {
    pub size: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Stores `data` under `name`, replacing any previous blob.
    async fn upload(&self, name: &str, data: &[u8]) -> Result<(), StorageError>;

    async fn get(&self, name: &str) -> Result<Vec<u8>, StorageError>;

    /// Names of every stored blob, sorted.
    async fn iter(&self) -> Result<Vec<String>, StorageError>;

    async fn attributes(&self, name: &str) -> Result<BlobAttributes, StorageError>;

    /// Removes a blob. Returns `false` if it was already gone.
    async fn delete(&self, name: &str) -> Result<bool, StorageError>;
}

/// Builds the store described by `config`.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn BlobStore>, StorageError> {
    match config.kind.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "filesystem" => {
            let dir = config
                .dir
                .as_ref()
                .ok_or_else(|| StorageError::InvalidName("storage.dir is not set".into()))?;
            Ok(Arc::new(FilesystemStore::open(dir)?))
        }
        other => Err(StorageError::Unsupported(other.to_string())),
    }
}

/// Normalises a blob name into a relative path, rejecting anything that
/// could escape the store root.
pub(crate) fn validate_name(name: &str) -> Result<PathBuf, StorageError> {
    if name.is_empty() {
        return Err(StorageError::InvalidName("name cannot be empty".into()));
    }

    let path = Path::new(name);
    if path.is_absolute() {
        return Err(StorageError::InvalidName(format!("{name} is absolute")));
    }

    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::InvalidName(format!(
                    "{name} escapes the store root"
                )))
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(StorageError::InvalidName(format!("{name} is empty")));
    }
    Ok(normalized)
}

/// The canonical `/`-separated key for a validated name.
pub(crate) fn normalize_name(name: &str) -> Result<String, StorageError> {
    let path = validate_name(name)?;
    Ok(path.to_string_lossy().replace('\\', "/"))
}

//! Non-persistent blob store, handy for tests and throwaway brokers.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{normalize_name, BlobAttributes, BlobStore, StorageError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn upload(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let key = normalize_name(name)?;
        self.blobs.insert(key, data.to_vec());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let key = normalize_name(name)?;
        self.blobs
            .get(&key)
            .map(|blob| blob.value().clone())
            .ok_or(StorageError::NotFound(key))
    }

    async fn iter(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self.blobs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn attributes(&self, name: &str) -> Result<BlobAttributes, StorageError> {
        let key = normalize_name(name)?;
        self.blobs
            .get(&key)
            .map(|blob| BlobAttributes {
                size: blob.value().len() as u64,
            })
            .ok_or(StorageError::NotFound(key))
    }

    async fn delete(&self, name: &str) -> Result<bool, StorageError> {
        let key = normalize_name(name)?;
        Ok(self.blobs.remove(&key).is_some())
    }
}

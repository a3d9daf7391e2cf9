//! Sled-based persistence backend for page records.
//!
//! Records are stored as JSON documents keyed by record id, with a separate
//! metadata tree (bincode) tracking owner, timestamps and revision. It
//! supports:
//! - Create and owner-checked update saves
//! - Existence/permission checks
//! - Record listing and deletion

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    access_url, AccessCheck, PersistenceBackend, PersistenceError, PersistenceResult,
    SaveOutcome, SaveRequest, SaveStrategy,
};
use crate::document::Document;
use crate::identity::RecordId;

/// Tree names for different data types
const TREE_RECORDS: &str = "records";
const TREE_RECORD_META: &str = "record_meta";

/// Configuration for the sled backend
#[derive(Debug, Clone)]
pub struct SledConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 64MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = immediate)
    pub flush_interval_ms: u64,
    /// Largest accepted serialized document
    pub max_record_bytes: usize,
    /// Base for access URLs returned on save
    pub public_base_url: String,
}

impl Default for SledConfig {
    fn default() -> Self {
        Self {
            path: "./data/site-editor.sled".to_string(),
            cache_size: 64 * 1024 * 1024,
            flush_interval_ms: 500,
            max_record_bytes: 5 * 1024 * 1024, // 5MB
            public_base_url: "http://localhost:3000".to_string(),
        }
    }
}

impl SledConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_public_base_url(mut self, url: impl Into<String>) -> Self {
        self.public_base_url = url.into();
        self
    }

    pub fn with_max_record_bytes(mut self, max: usize) -> Self {
        self.max_record_bytes = max;
        self
    }
}

/// Metadata stored alongside each record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMeta {
    pub record_id: String,
    pub owner_id: String,
    /// Unix timestamp of creation
    pub created_at: i64,
    /// Unix timestamp of last modification
    pub updated_at: i64,
    /// Number of saves applied
    pub revision: u64,
    pub size_bytes: u64,
}

/// Statistics about the storage
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub record_count: usize,
    pub total_size_bytes: u64,
}

/// Embedded record store
#[derive(Clone)]
pub struct SledBackend {
    db: Arc<Db>,
    records: Tree,
    meta: Tree,
    config: SledConfig,
}

impl From<sled::Error> for PersistenceError {
    fn from(err: sled::Error) -> Self {
        PersistenceError::Storage(err.to_string())
    }
}

impl From<bincode::Error> for PersistenceError {
    fn from(err: bincode::Error) -> Self {
        PersistenceError::Storage(format!("Metadata serialization: {}", err))
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Storage(format!("Record serialization: {}", err))
    }
}

impl SledBackend {
    /// Open or create a record store at the configured path
    pub fn open(config: SledConfig) -> PersistenceResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PersistenceError::Storage(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let records = db.open_tree(TREE_RECORDS)?;
        let meta = db.open_tree(TREE_RECORD_META)?;

        info!(path = %config.path, records = records.len(), "Record store opened");

        Ok(Self {
            db: Arc::new(db),
            records,
            meta,
            config,
        })
    }

    pub fn config(&self) -> &SledConfig {
        &self.config
    }

    fn store_record(
        &self,
        id: &RecordId,
        document: &Document,
        owner: &str,
    ) -> PersistenceResult<RecordMeta> {
        let bytes = serde_json::to_vec(&document.without_metadata())?;
        if bytes.len() > self.config.max_record_bytes {
            return Err(PersistenceError::Validation(format!(
                "Document is {} bytes, limit is {}",
                bytes.len(),
                self.config.max_record_bytes
            )));
        }

        let now = chrono::Utc::now().timestamp();
        let meta = match self.record_meta(id)? {
            Some(mut meta) => {
                meta.updated_at = now;
                meta.revision += 1;
                meta.size_bytes = bytes.len() as u64;
                meta
            }
            None => RecordMeta {
                record_id: id.to_string(),
                owner_id: owner.to_string(),
                created_at: now,
                updated_at: now,
                revision: 1,
                size_bytes: bytes.len() as u64,
            },
        };

        self.records.insert(id.as_str().as_bytes(), bytes)?;
        self.meta
            .insert(id.as_str().as_bytes(), bincode::serialize(&meta)?)?;
        Ok(meta)
    }

    /// Load record metadata
    pub fn record_meta(&self, id: &RecordId) -> PersistenceResult<Option<RecordMeta>> {
        match self.meta.get(id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// List all records with metadata
    pub fn list_records(&self) -> PersistenceResult<Vec<RecordMeta>> {
        let mut records = Vec::new();
        for item in self.meta.iter() {
            let (_, value) = item?;
            records.push(bincode::deserialize(&value)?);
        }
        Ok(records)
    }

    /// Delete a record and its metadata
    pub fn delete_record(&self, id: &RecordId) -> PersistenceResult<bool> {
        let key = id.as_str().as_bytes();
        let existed = self.records.remove(key)?.is_some();
        self.meta.remove(key)?;
        Ok(existed)
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> PersistenceResult<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            record_count: self.records.len(),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
        }
    }
}

#[async_trait]
impl PersistenceBackend for SledBackend {
    async fn save(&self, request: SaveRequest) -> PersistenceResult<SaveOutcome> {
        let (id, created) = match &request.strategy {
            SaveStrategy::Create => (RecordId::generate(), true),
            SaveStrategy::Update(id) => {
                let meta = self
                    .record_meta(id)?
                    .ok_or_else(|| PersistenceError::NotFound(id.clone()))?;
                if meta.owner_id != request.actor {
                    return Err(PersistenceError::Forbidden(id.clone()));
                }
                (id.clone(), false)
            }
        };

        let meta = self.store_record(&id, &request.document, &request.actor)?;
        debug!(record_id = %id, revision = meta.revision, created, "Record saved");

        Ok(SaveOutcome {
            access_url: access_url(&self.config.public_base_url, &id),
            record_id: id,
            created,
        })
    }

    async fn read(&self, id: &RecordId) -> PersistenceResult<Option<Document>> {
        match self.records.get(id.as_str().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn check_access(&self, id: &RecordId, actor: &str) -> PersistenceResult<AccessCheck> {
        Ok(match self.record_meta(id)? {
            Some(meta) => AccessCheck {
                exists: true,
                permitted: meta.owner_id == actor,
            },
            None => AccessCheck::missing(),
        })
    }
}

impl Drop for SledBackend {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn test_backend() -> (tempfile::TempDir, SledBackend) {
        let dir = tempdir().unwrap();
        let config = SledConfig::new(dir.path().join("test.sled").to_string_lossy().to_string())
            .with_public_base_url("https://sites.test");
        let backend = SledBackend::open(config).unwrap();
        (dir, backend)
    }

    fn doc() -> Document {
        Document::from_value(json!({"businessName": "Acme", "_recordId": "stale"})).unwrap()
    }

    fn request(strategy: SaveStrategy, actor: &str) -> SaveRequest {
        SaveRequest {
            document: doc(),
            strategy,
            actor: actor.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_then_read() {
        let (_dir, backend) = test_backend();
        let outcome = backend.save(request(SaveStrategy::Create, "user-1")).await.unwrap();

        assert!(outcome.created);
        assert_eq!(
            outcome.access_url,
            format!("https://sites.test/site/{}", outcome.record_id)
        );

        let stored = backend.read(&outcome.record_id).await.unwrap().unwrap();
        assert_eq!(stored.get("businessName"), Some(&json!("Acme")));
        assert!(stored.record_id().is_none(), "metadata is not persisted");
    }

    #[tokio::test]
    async fn test_update_requires_existing_owned_record() {
        let (_dir, backend) = test_backend();
        let missing = RecordId::generate();
        let err = backend
            .save(request(SaveStrategy::Update(missing.clone()), "user-1"))
            .await
            .unwrap_err();
        assert_eq!(err, PersistenceError::NotFound(missing));

        let created = backend.save(request(SaveStrategy::Create, "user-1")).await.unwrap();
        let err = backend
            .save(request(SaveStrategy::Update(created.record_id.clone()), "user-2"))
            .await
            .unwrap_err();
        assert_eq!(err, PersistenceError::Forbidden(created.record_id.clone()));

        let updated = backend
            .save(request(SaveStrategy::Update(created.record_id.clone()), "user-1"))
            .await
            .unwrap();
        assert!(!updated.created);
        assert_eq!(backend.record_meta(&created.record_id).unwrap().unwrap().revision, 2);
    }

    #[tokio::test]
    async fn test_check_access() {
        let (_dir, backend) = test_backend();
        let created = backend.save(request(SaveStrategy::Create, "user-1")).await.unwrap();

        assert_eq!(
            backend.check_access(&created.record_id, "user-1").await.unwrap(),
            AccessCheck::allowed()
        );
        let other = backend.check_access(&created.record_id, "user-2").await.unwrap();
        assert!(other.exists && !other.permitted);
        assert_eq!(
            backend.check_access(&RecordId::generate(), "user-1").await.unwrap(),
            AccessCheck::missing()
        );
    }

    #[tokio::test]
    async fn test_oversized_record_rejected() {
        let dir = tempdir().unwrap();
        let config = SledConfig::new(dir.path().join("small.sled").to_string_lossy().to_string())
            .with_max_record_bytes(8);
        let backend = SledBackend::open(config).unwrap();

        let err = backend.save(request(SaveStrategy::Create, "user-1")).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (_dir, backend) = test_backend();
        let a = backend.save(request(SaveStrategy::Create, "user-1")).await.unwrap();
        backend.save(request(SaveStrategy::Create, "user-1")).await.unwrap();

        assert_eq!(backend.list_records().unwrap().len(), 2);
        assert!(backend.delete_record(&a.record_id).unwrap());
        assert!(backend.read(&a.record_id).await.unwrap().is_none());
        assert_eq!(backend.stats().record_count, 1);
    }
}

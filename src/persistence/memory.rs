//! In-process record store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use super::{
    access_url, AccessCheck, PersistenceBackend, PersistenceError, PersistenceResult,
    SaveOutcome, SaveRequest, SaveStrategy,
};
use crate::document::Document;
use crate::identity::RecordId;

#[derive(Debug, Clone)]
struct StoredRecord {
    owner: String,
    document: Document,
    revision: u64,
}

/// Volatile backend with the same create/update/ownership rules as
/// [`super::SledBackend`]
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    records: Arc<DashMap<RecordId, StoredRecord>>,
    base_url: String,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new("http://localhost:3000")
    }
}

impl MemoryBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            base_url: base_url.into(),
        }
    }

    /// Seed a record owned by `owner`
    pub fn insert(&self, id: RecordId, owner: impl Into<String>, document: Document) {
        self.records.insert(
            id,
            StoredRecord {
                owner: owner.into(),
                document: document.without_metadata(),
                revision: 1,
            },
        );
    }

    pub fn revision(&self, id: &RecordId) -> Option<u64> {
        self.records.get(id).map(|r| r.revision)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn save(&self, request: SaveRequest) -> PersistenceResult<SaveOutcome> {
        let document = request.document.without_metadata();
        let (id, created) = match request.strategy {
            SaveStrategy::Create => {
                let id = RecordId::generate();
                self.records.insert(
                    id.clone(),
                    StoredRecord {
                        owner: request.actor,
                        document,
                        revision: 1,
                    },
                );
                (id, true)
            }
            SaveStrategy::Update(id) => {
                let mut record = self
                    .records
                    .get_mut(&id)
                    .ok_or_else(|| PersistenceError::NotFound(id.clone()))?;
                if record.owner != request.actor {
                    return Err(PersistenceError::Forbidden(id.clone()));
                }
                record.document = document;
                record.revision += 1;
                drop(record);
                (id, false)
            }
        };

        Ok(SaveOutcome {
            access_url: access_url(&self.base_url, &id),
            record_id: id,
            created,
        })
    }

    async fn read(&self, id: &RecordId) -> PersistenceResult<Option<Document>> {
        Ok(self.records.get(id).map(|r| r.document.clone()))
    }

    async fn check_access(&self, id: &RecordId, actor: &str) -> PersistenceResult<AccessCheck> {
        Ok(match self.records.get(id) {
            Some(record) => AccessCheck {
                exists: true,
                permitted: record.owner == actor,
            },
            None => AccessCheck::missing(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_and_update() {
        let backend = MemoryBackend::new("https://pages.test");
        let doc = Document::from_value(json!({"businessName": "Acme"})).unwrap();

        let created = backend
            .save(SaveRequest {
                document: doc.clone(),
                strategy: SaveStrategy::Create,
                actor: "alice".into(),
            })
            .await
            .unwrap();
        assert!(created.created);
        assert_eq!(backend.len(), 1);

        let updated = backend
            .save(SaveRequest {
                document: doc.clone(),
                strategy: SaveStrategy::Update(created.record_id.clone()),
                actor: "alice".into(),
            })
            .await
            .unwrap();
        assert_eq!(updated.record_id, created.record_id);
        assert_eq!(backend.revision(&created.record_id), Some(2));

        let err = backend
            .save(SaveRequest {
                document: doc,
                strategy: SaveStrategy::Update(created.record_id.clone()),
                actor: "mallory".into(),
            })
            .await
            .unwrap_err();
        assert!(err.is_identity_rejection());
    }

    #[tokio::test]
    async fn test_seeded_record_access() {
        let backend = MemoryBackend::default();
        let id = RecordId::generate();
        backend.insert(id.clone(), "alice", Document::new());

        assert_eq!(
            backend.check_access(&id, "alice").await.unwrap(),
            AccessCheck::allowed()
        );
        assert!(!backend.check_access(&id, "bob").await.unwrap().permitted);
        assert!(backend.read(&id).await.unwrap().is_some());
    }
}

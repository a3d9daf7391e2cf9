//! Persistence backend contract.
//!
//! The remote record store is an external collaborator consumed through
//! [`PersistenceBackend`]: save a full snapshot under a create/update
//! strategy, read a record back, and check that a record exists and the
//! acting user may write it. Two implementations ship with the crate:
//! - [`SledBackend`]: embedded on-disk records with owner checks
//! - [`MemoryBackend`]: in-process records for tests and demos

mod memory;
mod sled_backend;

pub use memory::MemoryBackend;
pub use sled_backend::{SledBackend, SledConfig, StorageStats};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::Document;
use crate::identity::RecordId;

/// Errors reported by a persistence backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PersistenceError {
    /// Payload rejected before or by the backend; never retried
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unauthorized: {message}")]
    Unauthorized {
        message: String,
        reauth_required: bool,
    },

    /// Update target does not exist
    #[error("Record not found: {0}")]
    NotFound(RecordId),

    /// Update target exists but belongs to someone else
    #[error("Record not owned by actor: {0}")]
    Forbidden(RecordId),

    /// Network, timeout or server-side failure
    #[error("Transient backend error: {0}")]
    Transient(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl PersistenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PersistenceError::Transient(_) | PersistenceError::Storage(_)
        )
    }

    /// The update target was rejected (missing or not owned)
    pub fn is_identity_rejection(&self) -> bool {
        matches!(
            self,
            PersistenceError::NotFound(_) | PersistenceError::Forbidden(_)
        )
    }

    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            PersistenceError::Unauthorized {
                reauth_required: true,
                ..
            }
        )
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// How a save should be applied on the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "id", rename_all = "lowercase")]
pub enum SaveStrategy {
    Create,
    Update(RecordId),
}

/// A save operation sent to the backend
#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub document: Document,
    pub strategy: SaveStrategy,
    pub actor: String,
}

/// A successful save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveOutcome {
    pub record_id: RecordId,
    /// Canonical URL where the saved page can be accessed
    pub access_url: String,
    pub created: bool,
}

/// Result of an existence/permission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessCheck {
    pub exists: bool,
    pub permitted: bool,
}

impl AccessCheck {
    pub fn allowed() -> Self {
        Self {
            exists: true,
            permitted: true,
        }
    }

    pub fn missing() -> Self {
        Self {
            exists: false,
            permitted: false,
        }
    }
}

/// Remote persisted-record store
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Persist a full document snapshot
    async fn save(&self, request: SaveRequest) -> PersistenceResult<SaveOutcome>;

    /// Read a stored document
    async fn read(&self, id: &RecordId) -> PersistenceResult<Option<Document>>;

    /// Check that `id` exists and `actor` may update it
    async fn check_access(&self, id: &RecordId, actor: &str) -> PersistenceResult<AccessCheck>;
}

/// Build the public URL for a record
pub(crate) fn access_url(base_url: &str, id: &RecordId) -> String {
    format!("{}/site/{}", base_url.trim_end_matches('/'), id)
}

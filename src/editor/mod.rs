//! Editing-session facade.
//!
//! An [`EditorSession`] wires one document store, change bus, identity
//! resolver and auto-save controller together and exposes the calls the
//! quick-edit and full-screen surfaces make. [`EditorView`] is the read
//! side: everything a surface renders from.

mod session;

pub use session::EditorSession;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::autosave::{SaveError, SaveStatus};
use crate::config::ConfigError;
use crate::document::{Document, DocumentError, ElementDescriptor};
use crate::identity::{IdentityError, RecordId};
use crate::persistence::PersistenceError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Save error: {0}")]
    Save(#[from] SaveError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Record not found: {0}")]
    RecordNotFound(RecordId),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Snapshot of everything an editing surface renders
#[derive(Debug, Clone)]
pub struct EditorView {
    pub document: Arc<Document>,
    pub status: SaveStatus,
    pub can_undo: bool,
    pub can_redo: bool,
    pub undo_description: Option<String>,
    pub redo_description: Option<String>,
    pub selection: Option<ElementDescriptor>,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reauth_required: bool,
    pub pending_changes: usize,
    pub record_id: Option<RecordId>,
    pub access_url: Option<String>,
}

//! Site Editor Sync - editor state synchronization and auto-persistence
//!
//! Keeps the quick-edit panel and the full-screen editor of a visual
//! website builder working on one document:
//! - Document store with undo/redo history and batched edits
//! - Change event bus with surface-scoped delivery and conflict detection
//! - Debounced auto-save with retries, timeouts and conflict policies
//! - Identity recovery so saves keep updating the same record
//! - Sled embedded database as the default persistence backend

pub mod autosave;
pub mod bus;
pub mod config;
pub mod document;
pub mod editor;
pub mod identity;
pub mod persistence;

#[cfg(test)]
mod testing;

pub use autosave::{
    AutoSaveConfig, AutoSaveController, ConflictPolicy, ConflictSide, ExternalOutcome, SaveError,
    SaveReceipt, SaveState, SaveStatus,
};
pub use bus::{BusConfig, BusEvent, BusPayload, ChangeBus, EventKind, Subscription};
pub use config::{ConfigError, EditorConfig};
pub use document::{
    ChangeEvent, Document, DocumentError, DocumentStore, EditSource, ElementDescriptor,
    HistoryConfig, UpdateMeta,
};
pub use editor::{EditorSession, EditorView, SessionError, SessionResult};
pub use identity::{IdentityConfig, MemorySessionStore, RecordId, SessionStore};
pub use persistence::{
    MemoryBackend, PersistenceBackend, PersistenceError, SaveStrategy, SledBackend, SledConfig,
};

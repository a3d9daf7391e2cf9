//! Auto-persistence of the edited document.
//!
//! The [`AutoSaveController`] watches change events, debounces them and
//! saves the document through the identity resolver and a
//! [`PersistenceBackend`](crate::persistence::PersistenceBackend). It owns
//! every save-related timer: debounce, max-wait, the periodic safety net,
//! the "saved" display window and retry backoff.

pub mod controller;
pub mod retry;

pub use controller::AutoSaveController;
pub use retry::Backoff;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::document::{keys, Document};
use crate::identity::RecordId;
use crate::persistence::{PersistenceError, SaveStrategy};

/// Errors surfaced by a save
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SaveError {
    /// Rejected before any backend call; never retried
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not authorized: {message}")]
    Unauthorized {
        message: String,
        reauth_required: bool,
    },

    /// Automatic recovery gave up
    #[error("Save failed after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("A write conflict is waiting to be resolved")]
    ConflictUnresolved,

    #[error("No conflict to resolve")]
    NoConflict,

    #[error("Document store rejected update: {0}")]
    Store(String),
}

impl SaveError {
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            SaveError::Unauthorized {
                reauth_required: true,
                ..
            }
        )
    }
}

pub type SaveResult<T> = Result<T, SaveError>;

/// How an incoming external update is reconciled with local pending changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Local pending changes win
    Local,
    /// External data overwrites local pending changes
    External,
    /// Field-by-field union, external wins on overlap
    Merge,
    /// Stop auto-saving until resolved explicitly
    Manual,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::Local => write!(f, "local"),
            ConflictPolicy::External => write!(f, "external"),
            ConflictPolicy::Merge => write!(f, "merge"),
            ConflictPolicy::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(ConflictPolicy::Local),
            "external" => Ok(ConflictPolicy::External),
            "merge" => Ok(ConflictPolicy::Merge),
            "manual" => Ok(ConflictPolicy::Manual),
            other => Err(format!("unknown conflict policy {:?}", other)),
        }
    }
}

/// Which side wins when resolving a manual conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSide {
    Local,
    External,
}

/// Settings for the auto-save controller
#[derive(Debug, Clone)]
pub struct AutoSaveConfig {
    /// Quiet time after the last change before saving
    pub debounce: Duration,
    /// Longest a change may stay unsaved while edits keep coming
    pub max_wait: Duration,
    /// Safety-net save interval
    pub periodic_interval: Duration,
    /// Attempts per save cycle, first try included
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// How long `saved` is shown before returning to `idle`
    pub saved_display: Duration,
    /// Backend calls running longer than this count as transient failures
    pub save_timeout: Duration,
    /// Fields that skip the debounce
    pub critical_fields: HashSet<String>,
    /// Fields that must be present and non-empty before saving
    pub required_fields: Vec<String>,
    pub conflict_policy: ConflictPolicy,
    /// Hold saves while the user is typing quickly
    pub typing_awareness: bool,
    pub typing_quiet_period: Duration,
    /// Save attempts kept for diagnostics
    pub save_log_capacity: usize,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
            periodic_interval: Duration::from_secs(15),
            max_attempts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            saved_display: Duration::from_secs(2),
            save_timeout: Duration::from_secs(30),
            critical_fields: [keys::BUSINESS_NAME, keys::PRIMARY_COLOR]
                .into_iter()
                .map(String::from)
                .collect(),
            required_fields: vec![keys::BUSINESS_NAME.to_string()],
            conflict_policy: ConflictPolicy::Local,
            typing_awareness: false,
            typing_quiet_period: Duration::from_millis(1500),
            save_log_capacity: 20,
        }
    }
}

impl AutoSaveConfig {
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_save_timeout(mut self, timeout: Duration) -> Self {
        self.save_timeout = timeout;
        self
    }

    pub fn with_critical_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.critical_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn with_typing_awareness(mut self, quiet_period: Duration) -> Self {
        self.typing_awareness = true;
        self.typing_quiet_period = quiet_period;
        self
    }

    pub fn is_critical(&self, field: &str) -> bool {
        self.critical_fields.contains(field)
    }

    /// Check the required fields of a snapshot
    pub fn validate_document(&self, document: &Document) -> SaveResult<()> {
        for field in &self.required_fields {
            let present = match document.get(field) {
                None | Some(serde_json::Value::Null) => false,
                Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
                Some(_) => true,
            };
            if !present {
                return Err(SaveError::Validation(format!(
                    "Missing required field: {}",
                    field
                )));
            }
        }
        Ok(())
    }
}

/// Auto-save state machine status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SaveStatus {
    #[default]
    Idle,
    Pending,
    Saving,
    Saved,
    Error,
    Conflict,
    Paused,
}

impl fmt::Display for SaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SaveStatus::Idle => "idle",
            SaveStatus::Pending => "pending",
            SaveStatus::Saving => "saving",
            SaveStatus::Saved => "saved",
            SaveStatus::Error => "error",
            SaveStatus::Conflict => "conflict",
            SaveStatus::Paused => "paused",
        };
        f.write_str(text)
    }
}

/// What started a save cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveTrigger {
    Debounce,
    MaxWait,
    Critical,
    Periodic,
    Manual,
    Resume,
    ConflictResolved,
    Detach,
}

/// One backend save try, kept in the bounded save log
#[derive(Debug, Clone)]
pub struct SaveAttempt {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub trigger: SaveTrigger,
    /// 1-based attempt number within its save cycle
    pub attempt: u32,
    pub strategy: SaveStrategy,
    pub snapshot: Arc<Document>,
    pub error: Option<String>,
}

/// Observable auto-save state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaveState {
    pub status: SaveStatus,
    pub last_saved_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reauth_required: bool,
    pub save_count: u64,
    /// Change events not yet covered by a successful save
    pub pending: usize,
    pub record_id: Option<RecordId>,
    pub access_url: Option<String>,
}

/// A completed save
#[derive(Debug, Clone, PartialEq)]
pub struct SaveReceipt {
    pub record_id: RecordId,
    pub access_url: String,
    pub created: bool,
    pub trigger: SaveTrigger,
    pub attempts: u32,
    pub saved_at: DateTime<Utc>,
}

/// What happened to an external document update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalOutcome {
    /// No local pending changes; applied as-is
    Applied,
    /// Local pending changes kept; update dropped
    Ignored,
    /// Local content replaced by the external document
    Overwritten,
    /// Fields merged, external winning on overlap
    Merged { fields: usize },
    /// Held until [`AutoSaveController::resolve_conflict`]
    Conflict,
}

impl From<PersistenceError> for SaveError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::Validation(msg) => SaveError::Validation(msg),
            PersistenceError::Unauthorized {
                message,
                reauth_required,
            } => SaveError::Unauthorized {
                message,
                reauth_required,
            },
            other => SaveError::Exhausted {
                attempts: 1,
                last_error: other.to_string(),
            },
        }
    }
}

//! Aggregate configuration for an editing session.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::autosave::{AutoSaveConfig, ConflictPolicy};
use crate::bus::BusConfig;
use crate::document::HistoryConfig;
use crate::identity::IdentityConfig;
use crate::persistence::SledConfig;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Everything an [`EditorSession`](crate::editor::EditorSession) needs
#[derive(Debug, Clone, Default)]
pub struct EditorConfig {
    pub bus: BusConfig,
    pub history: HistoryConfig,
    pub autosave: AutoSaveConfig,
    pub identity: IdentityConfig,
    pub storage: SledConfig,
}

impl EditorConfig {
    /// Defaults overridden by environment variables. Call
    /// `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, "EDITOR_DEBOUNCE_MS")? {
            config.autosave.debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "EDITOR_MAX_WAIT_MS")? {
            config.autosave.max_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "EDITOR_PERIODIC_MS")? {
            config.autosave.periodic_interval = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_var::<u32, _>(&lookup, "EDITOR_MAX_ATTEMPTS")? {
            config.autosave.max_attempts = attempts;
        }
        if let Some(policy) = parse_var::<ConflictPolicy, _>(&lookup, "EDITOR_CONFLICT_POLICY")? {
            config.autosave.conflict_policy = policy;
        }
        if let Some(actor) = lookup("EDITOR_ACTOR_ID") {
            config.identity.actor_id = actor;
        }
        if let Some(path) = lookup("STORAGE_PATH") {
            config.storage.path = path;
        }
        if let Some(url) = lookup("PUBLIC_BASE_URL") {
            config.storage.public_base_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.bus.batch_size == 0 {
            return Err(ConfigError::Invalid("bus batch size must be positive".into()));
        }
        let autosave = &self.autosave;
        if autosave.max_attempts == 0 {
            return Err(ConfigError::Invalid("at least one save attempt is required".into()));
        }
        if autosave.periodic_interval.is_zero() {
            return Err(ConfigError::Invalid("periodic interval must be positive".into()));
        }
        if autosave.debounce > autosave.max_wait {
            return Err(ConfigError::Invalid(format!(
                "debounce ({}ms) exceeds max wait ({}ms)",
                autosave.debounce.as_millis(),
                autosave.max_wait.as_millis()
            )));
        }
        if self.identity.actor_id.trim().is_empty() {
            return Err(ConfigError::Invalid("actor id is empty".into()));
        }
        if self.storage.path.is_empty() {
            return Err(ConfigError::Invalid("storage path is empty".into()));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> ConfigResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

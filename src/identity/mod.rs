//! Persisted-record identity.
//!
//! A document only updates an existing record when its identifier can be
//! recovered and confirmed. This module provides:
//! - [`RecordId`]: the strict identifier format
//! - Query-string candidate extraction from the page URL
//! - The recovery resolver and the session-scoped recovery store

pub mod resolver;
pub mod session_store;

pub use resolver::{IdentityConfig, IdentityResolver, StrategyDecision, StrategyReason};
pub use session_store::{
    business_name_key, MemorySessionStore, RecoveryPayload, SessionStore,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Errors raised while handling record identities
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdentityError {
    #[error("Malformed record id: {0:?}")]
    Malformed(String),

    #[error("Invalid page URL: {0}")]
    InvalidUrl(String),

    #[error("Session store error: {0}")]
    Session(String),
}

pub type IdentityResult<T> = Result<T, IdentityError>;

/// Length of the canonical hyphenated form
const RECORD_ID_LEN: usize = 36;

/// Identifier of a persisted page record.
///
/// Only the lowercase hyphenated UUID form is accepted; braced, URN and
/// simple forms are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RecordId(String);

impl RecordId {
    pub fn parse(candidate: &str) -> IdentityResult<Self> {
        let trimmed = candidate.trim();
        if trimmed.len() != RECORD_ID_LEN || trimmed.chars().filter(|c| *c == '-').count() != 4 {
            return Err(IdentityError::Malformed(candidate.to_string()));
        }
        Uuid::parse_str(trimmed)
            .map(|uuid| Self(uuid.hyphenated().to_string()))
            .map_err(|_| IdentityError::Malformed(candidate.to_string()))
    }

    /// A fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4().hyphenated().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RecordId {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RecordId::parse(&value)
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.0
    }
}

impl std::str::FromStr for RecordId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordId::parse(s)
    }
}

/// Where a recovered identifier came from, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoverySource {
    Explicit,
    Document,
    Session,
    Url,
}

impl fmt::Display for RecoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoverySource::Explicit => write!(f, "explicit"),
            RecoverySource::Document => write!(f, "document"),
            RecoverySource::Session => write!(f, "session"),
            RecoverySource::Url => write!(f, "url"),
        }
    }
}

/// An identifier accepted by recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredId {
    pub id: RecordId,
    pub source: RecoverySource,
}

/// Values of the named query parameters, in `params` order.
///
/// Relative URLs (`/editor?id=...`, `?id=...`) are accepted.
pub fn query_candidates(page_url: &str, params: &[String]) -> IdentityResult<Vec<String>> {
    let url = match Url::parse(page_url) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => Url::parse("http://localhost/")
            .and_then(|base| base.join(page_url))
            .map_err(|e| IdentityError::InvalidUrl(e.to_string()))?,
        Err(e) => return Err(IdentityError::InvalidUrl(e.to_string())),
    };

    let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    Ok(params
        .iter()
        .flat_map(|param| {
            pairs
                .iter()
                .filter(move |(k, _)| k == param)
                .map(|(_, v)| v.clone())
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_format() {
        let id = RecordId::parse("6F1C2A4E-8D1B-4C11-9B43-1F0F6F7A9B10").unwrap();
        assert_eq!(id.as_str(), "6f1c2a4e-8d1b-4c11-9b43-1f0f6f7a9b10");

        for bad in [
            "",
            "undefined",
            "null",
            "6f1c2a4e8d1b4c119b431f0f6f7a9b10",
            "{6f1c2a4e-8d1b-4c11-9b43-1f0f6f7a9b10}",
            "6f1c2a4e-8d1b-4c11-9b43-1f0f6f7a9bzz",
        ] {
            assert!(RecordId::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_record_id_serde_validates() {
        let id = RecordId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(serde_json::from_str::<RecordId>(&json).unwrap(), id);
        assert!(serde_json::from_str::<RecordId>("\"not-an-id\"").is_err());
    }

    #[test]
    fn test_query_candidates() {
        let params = vec!["id".to_string(), "siteId".to_string()];

        let found = query_candidates("https://app.test/editor?siteId=b&id=a&x=1", &params).unwrap();
        assert_eq!(found, vec!["a".to_string(), "b".to_string()]);

        let relative = query_candidates("/editor?id=rel", &params).unwrap();
        assert_eq!(relative, vec!["rel".to_string()]);

        assert!(query_candidates("https://app.test/editor", &params)
            .unwrap()
            .is_empty());
    }
}

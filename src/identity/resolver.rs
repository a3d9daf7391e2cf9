//! Identity recovery and save-strategy selection.
//!
//! Recovery looks for a record id in priority order: an explicit id, the
//! document's own metadata, session recovery entries, then the page URL.
//! Every candidate must pass [`RecordId::parse`]; malformed ones are skipped
//! and the search continues.
//!
//! Strategy selection only chooses `update` when the caller says it is
//! editing an existing record and the backend confirms the record exists
//! and the actor may write it. Every other outcome is a `create`.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::session_store::{
    business_key_entry, business_name_key, latest_entry, read_payload, write_payload,
    RecoveryPayload, SessionStore,
};
use super::{query_candidates, IdentityResult, RecordId, RecoveredId, RecoverySource};
use crate::document::Document;
use crate::persistence::{PersistenceBackend, SaveStrategy};

/// Identity recovery settings
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Prefix of every session recovery key
    pub recovery_prefix: String,
    /// Query parameters that may carry a record id, in priority order
    pub url_params: Vec<String>,
    /// Actor used for permission checks
    pub actor_id: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            recovery_prefix: "siteEditor:recovery:".to_string(),
            url_params: vec!["id".into(), "recordId".into(), "siteId".into()],
            actor_id: "anonymous".to_string(),
        }
    }
}

impl IdentityConfig {
    pub fn with_recovery_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.recovery_prefix = prefix.into();
        self
    }

    pub fn with_url_params(mut self, params: Vec<String>) -> Self {
        self.url_params = params;
        self
    }

    pub fn with_actor_id(mut self, actor: impl Into<String>) -> Self {
        self.actor_id = actor.into();
        self
    }
}

/// Why a strategy was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyReason {
    ForceCreate,
    NoRecordId,
    NotEditingExisting,
    Verified,
    RecordMissing,
    PermissionDenied,
    CheckFailed,
}

impl StrategyReason {
    /// A create chosen although an id was available
    pub fn is_fallback(&self) -> bool {
        matches!(
            self,
            StrategyReason::RecordMissing
                | StrategyReason::PermissionDenied
                | StrategyReason::CheckFailed
        )
    }
}

impl fmt::Display for StrategyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StrategyReason::ForceCreate => "force create requested",
            StrategyReason::NoRecordId => "no record id",
            StrategyReason::NotEditingExisting => "not editing an existing record",
            StrategyReason::Verified => "record verified",
            StrategyReason::RecordMissing => "record does not exist",
            StrategyReason::PermissionDenied => "actor may not update record",
            StrategyReason::CheckFailed => "access check failed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyDecision {
    pub strategy: SaveStrategy,
    pub reason: StrategyReason,
}

impl StrategyDecision {
    fn create(reason: StrategyReason) -> Self {
        Self {
            strategy: SaveStrategy::Create,
            reason,
        }
    }
}

/// Recovers record identities and picks create/update for saves
pub struct IdentityResolver {
    config: IdentityConfig,
    session: Arc<dyn SessionStore>,
    backend: Arc<dyn PersistenceBackend>,
    page_url: RwLock<Option<String>>,
}

impl IdentityResolver {
    pub fn new(
        config: IdentityConfig,
        session: Arc<dyn SessionStore>,
        backend: Arc<dyn PersistenceBackend>,
    ) -> Self {
        Self {
            config,
            session,
            backend,
            page_url: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &IdentityConfig {
        &self.config
    }

    pub fn actor(&self) -> &str {
        &self.config.actor_id
    }

    /// Set the URL the editor was opened from
    pub fn set_page_url(&self, url: Option<String>) {
        *self.page_url.write() = url;
    }

    pub fn page_url(&self) -> Option<String> {
        self.page_url.read().clone()
    }

    /// Find the record id `document` most likely belongs to
    pub fn recover_id(&self, document: &Document, explicit: Option<&str>) -> Option<RecoveredId> {
        let accept = |candidate: &str, source: RecoverySource| match RecordId::parse(candidate) {
            Ok(id) => Some(RecoveredId { id, source }),
            Err(e) => {
                debug!(%source, error = %e, "Skipping malformed id candidate");
                None
            }
        };

        explicit
            .and_then(|c| accept(c, RecoverySource::Explicit))
            .or_else(|| {
                document
                    .record_id()
                    .and_then(|c| accept(c, RecoverySource::Document))
            })
            .or_else(|| {
                self.session_candidates(document)
                    .iter()
                    .find_map(|c| accept(c, RecoverySource::Session))
            })
            .or_else(|| {
                self.url_candidates()
                    .iter()
                    .find_map(|c| accept(c, RecoverySource::Url))
            })
    }

    fn session_candidates(&self, document: &Document) -> Vec<String> {
        let prefix = &self.config.recovery_prefix;
        let doc_key = document.business_name().map(business_name_key);
        let mut candidates = Vec::new();

        if let Some(key) = &doc_key {
            if let Some(payload) = read_payload(&*self.session, &business_key_entry(prefix, key)) {
                candidates.push(payload.id);
            }
        }

        if let Some(payload) = read_payload(&*self.session, &latest_entry(prefix)) {
            // The latest entry may belong to a different business
            let mismatch = matches!(
                (&doc_key, &payload.business_name_key),
                (Some(doc), Some(saved)) if doc != saved
            );
            if mismatch {
                debug!("Ignoring latest recovery entry for a different business");
            } else {
                candidates.push(payload.id);
            }
        }

        candidates
    }

    fn url_candidates(&self) -> Vec<String> {
        let Some(url) = self.page_url.read().clone() else {
            return Vec::new();
        };
        match query_candidates(&url, &self.config.url_params) {
            Ok(candidates) => candidates,
            Err(e) => {
                debug!(error = %e, "Page URL not usable for recovery");
                Vec::new()
            }
        }
    }

    /// Decide whether a save should create a record or update `id`
    pub async fn determine_strategy(
        &self,
        id: Option<&RecordId>,
        editing_existing: bool,
        force_create: bool,
        actor: &str,
    ) -> StrategyDecision {
        if force_create {
            return StrategyDecision::create(StrategyReason::ForceCreate);
        }
        let Some(id) = id else {
            return StrategyDecision::create(StrategyReason::NoRecordId);
        };
        if !editing_existing {
            return StrategyDecision::create(StrategyReason::NotEditingExisting);
        }

        let reason = match self.backend.check_access(id, actor).await {
            Ok(check) if check.exists && check.permitted => {
                return StrategyDecision {
                    strategy: SaveStrategy::Update(id.clone()),
                    reason: StrategyReason::Verified,
                };
            }
            Ok(check) if !check.exists => StrategyReason::RecordMissing,
            Ok(_) => StrategyReason::PermissionDenied,
            Err(e) => {
                warn!(record_id = %id, error = %e, "Access check errored");
                StrategyReason::CheckFailed
            }
        };

        warn!(record_id = %id, %reason, "Falling back to create");
        StrategyDecision::create(reason)
    }

    /// Write recovery entries for a record `document` was just saved to
    pub fn remember(&self, document: &Document, id: &RecordId) -> IdentityResult<()> {
        let prefix = &self.config.recovery_prefix;
        let payload = RecoveryPayload::new(id.as_str(), document.business_name());

        if let Some(key) = &payload.business_name_key {
            write_payload(&*self.session, &business_key_entry(prefix, key), &payload)?;
        }
        write_payload(&*self.session, &latest_entry(prefix), &payload)?;

        info!(record_id = %id, "Recovery entry stored");
        Ok(())
    }

    /// Remove every recovery entry pointing at `id`
    pub fn forget(&self, id: &RecordId) {
        for key in self.session.keys(&self.config.recovery_prefix) {
            if read_payload(&*self.session, &key).map_or(false, |p| p.id == id.as_str()) {
                self.session.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemorySessionStore;
    use crate::persistence::MemoryBackend;
    use crate::testing::ScriptedBackend;
    use serde_json::json;

    const A: &str = "aaaaaaaa-aaaa-4aaa-8aaa-aaaaaaaaaaaa";
    const B: &str = "bbbbbbbb-bbbb-4bbb-8bbb-bbbbbbbbbbbb";
    const C: &str = "cccccccc-cccc-4ccc-8ccc-cccccccccccc";

    fn resolver_with(
        backend: Arc<dyn PersistenceBackend>,
    ) -> (IdentityResolver, MemorySessionStore) {
        let session = MemorySessionStore::new();
        let resolver = IdentityResolver::new(
            IdentityConfig::default().with_actor_id("alice"),
            Arc::new(session.clone()),
            backend,
        );
        (resolver, session)
    }

    fn resolver() -> (IdentityResolver, MemorySessionStore) {
        resolver_with(Arc::new(MemoryBackend::default()))
    }

    fn doc(value: serde_json::Value) -> Document {
        Document::from_value(value).unwrap()
    }

    fn seed_latest(resolver: &IdentityResolver, session: &MemorySessionStore, id: &str) {
        let payload = RecoveryPayload::new(id, None);
        let key = latest_entry(&resolver.config().recovery_prefix);
        write_payload(session, &key, &payload).unwrap();
    }

    #[test]
    fn test_session_wins_over_url() {
        let (resolver, session) = resolver();
        seed_latest(&resolver, &session, A);
        resolver.set_page_url(Some(format!("https://app.test/editor?id={B}")));

        let recovered = resolver.recover_id(&Document::new(), None).unwrap();
        assert_eq!(recovered.id.as_str(), A);
        assert_eq!(recovered.source, RecoverySource::Session);
    }

    #[test]
    fn test_url_used_when_session_empty() {
        let (resolver, _session) = resolver();
        resolver.set_page_url(Some(format!("/editor?id={B}")));

        let recovered = resolver.recover_id(&Document::new(), None).unwrap();
        assert_eq!(recovered.id.as_str(), B);
        assert_eq!(recovered.source, RecoverySource::Url);
    }

    #[test]
    fn test_priority_and_malformed_candidates() {
        let (resolver, session) = resolver();
        seed_latest(&resolver, &session, A);

        let with_doc_id = doc(json!({"_recordId": C}));
        let recovered = resolver.recover_id(&with_doc_id, Some(B)).unwrap();
        assert_eq!(recovered.source, RecoverySource::Explicit);

        let recovered = resolver.recover_id(&with_doc_id, Some("undefined")).unwrap();
        assert_eq!(recovered.id.as_str(), C);
        assert_eq!(recovered.source, RecoverySource::Document);

        let bad_doc = doc(json!({"_recordId": "temp-123"}));
        let recovered = resolver.recover_id(&bad_doc, None).unwrap();
        assert_eq!(recovered.id.as_str(), A);
    }

    #[test]
    fn test_nothing_recovered() {
        let (resolver, _session) = resolver();
        resolver.set_page_url(Some("https://app.test/editor?id=nope".into()));
        assert!(resolver.recover_id(&Document::new(), None).is_none());
    }

    #[test]
    fn test_remember_keys_by_business_name() {
        let (resolver, session) = resolver();
        let acme = doc(json!({"businessName": "Acme"}));
        let other = doc(json!({"businessName": "Globex"}));
        let id = RecordId::parse(A).unwrap();

        resolver.remember(&acme, &id).unwrap();
        assert_eq!(session.len(), 2);

        assert_eq!(resolver.recover_id(&acme, None).unwrap().id, id);
        // The latest entry belongs to another business
        assert!(resolver.recover_id(&other, None).is_none());

        resolver.forget(&id);
        assert!(session.is_empty());
    }

    #[tokio::test]
    async fn test_strategy_short_circuits() {
        let (resolver, _session) = resolver();
        let id = RecordId::parse(A).unwrap();

        let d = resolver.determine_strategy(Some(&id), true, true, "alice").await;
        assert_eq!(d.reason, StrategyReason::ForceCreate);
        let d = resolver.determine_strategy(None, true, false, "alice").await;
        assert_eq!(d.reason, StrategyReason::NoRecordId);
        let d = resolver.determine_strategy(Some(&id), false, false, "alice").await;
        assert_eq!(d, StrategyDecision::create(StrategyReason::NotEditingExisting));
    }

    #[tokio::test]
    async fn test_strategy_checks_backend() {
        let backend = MemoryBackend::default();
        let owned = RecordId::parse(A).unwrap();
        backend.insert(owned.clone(), "alice", Document::new());
        let (resolver, _session) = resolver_with(Arc::new(backend));

        let d = resolver.determine_strategy(Some(&owned), true, false, "alice").await;
        assert_eq!(d.strategy, SaveStrategy::Update(owned.clone()));
        assert_eq!(d.reason, StrategyReason::Verified);

        let d = resolver.determine_strategy(Some(&owned), true, false, "bob").await;
        assert_eq!(d.strategy, SaveStrategy::Create);
        assert_eq!(d.reason, StrategyReason::PermissionDenied);

        let missing = RecordId::parse(B).unwrap();
        let d = resolver.determine_strategy(Some(&missing), true, false, "alice").await;
        assert_eq!(d.reason, StrategyReason::RecordMissing);
        assert!(d.reason.is_fallback());
    }

    #[tokio::test]
    async fn test_strategy_check_error_degrades_to_create() {
        let backend = ScriptedBackend::new();
        backend.fail_access_checks();
        let (resolver, _session) = resolver_with(Arc::new(backend));
        let id = RecordId::parse(A).unwrap();

        let d = resolver.determine_strategy(Some(&id), true, false, "alice").await;
        assert_eq!(d.strategy, SaveStrategy::Create);
        assert_eq!(d.reason, StrategyReason::CheckFailed);
    }
}

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{EditorView, SessionError, SessionResult};
use crate::autosave::{
    AutoSaveController, ConflictSide, ExternalOutcome, SaveReceipt, SaveResult, SaveState,
};
use crate::bus::{BusEvent, ChangeBus, EventKind, ListenerResult, Subscription};
use crate::config::EditorConfig;
use crate::document::{
    keys, ChangeEvent, Document, DocumentStore, EditSource, ElementDescriptor, StoreListener,
    UpdateMeta,
};
use crate::identity::{IdentityResolver, RecordId, RecoveredId, SessionStore};
use crate::persistence::PersistenceBackend;

/// One editing session over one document.
///
/// Both editing surfaces talk to the same session; every mutation goes
/// through the document store so history, change events and auto-save stay
/// consistent.
pub struct EditorSession {
    config: EditorConfig,
    bus: Arc<ChangeBus>,
    store: Arc<DocumentStore>,
    resolver: Arc<IdentityResolver>,
    backend: Arc<dyn PersistenceBackend>,
    autosave: Arc<AutoSaveController>,
}

impl EditorSession {
    /// Session over an empty document
    pub fn new(
        config: EditorConfig,
        backend: Arc<dyn PersistenceBackend>,
        session_store: Arc<dyn SessionStore>,
    ) -> SessionResult<Self> {
        Self::with_document(config, backend, session_store, Document::new())
    }

    /// Session seeded with `document`; nothing is recorded in history
    pub fn with_document(
        config: EditorConfig,
        backend: Arc<dyn PersistenceBackend>,
        session_store: Arc<dyn SessionStore>,
        document: Document,
    ) -> SessionResult<Self> {
        config.validate()?;

        let bus = ChangeBus::new(config.bus.clone());
        let store = Arc::new(DocumentStore::with_document(
            bus.clone(),
            &config.history,
            document,
        ));
        let resolver = Arc::new(IdentityResolver::new(
            config.identity.clone(),
            session_store,
            backend.clone(),
        ));
        let autosave = AutoSaveController::new(
            config.autosave.clone(),
            bus.clone(),
            store.clone(),
            resolver.clone(),
            backend.clone(),
        );

        Ok(Self {
            config,
            bus,
            store,
            resolver,
            backend,
            autosave,
        })
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<ChangeBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn autosave(&self) -> &Arc<AutoSaveController> {
        &self.autosave
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start auto-saving
    pub fn attach(&self) {
        self.autosave.attach();
    }

    /// Stop auto-saving, saving unsaved work one last time
    pub async fn detach(&self) -> SaveResult<Option<SaveReceipt>> {
        self.autosave.detach().await
    }

    /// Load a persisted record into the session.
    ///
    /// The loaded content replaces the document without creating history,
    /// and later saves update this record.
    pub async fn open(&self, id: &str) -> SessionResult<()> {
        let id = RecordId::parse(id)?;
        let document = self
            .backend
            .read(&id)
            .await?
            .ok_or_else(|| SessionError::RecordNotFound(id.clone()))?;

        let events = self.store.replace_document(document, EditSource::External);
        self.store.apply_field_update(
            keys::RECORD_ID,
            json!(id.as_str()),
            EditSource::External,
            UpdateMeta::default(),
        )?;
        self.autosave.bind_record(id.clone(), true);

        info!(record_id = %id, fields = events.len(), "Record opened");
        Ok(())
    }

    /// Page URL consulted for a record id during identity recovery
    pub fn set_page_url(&self, url: Option<String>) {
        self.resolver.set_page_url(url);
    }

    /// Look for a record id this session should keep saving to, and bind it
    /// when found. `explicit` takes priority over every other source.
    pub fn recover_identity(&self, explicit: Option<&str>) -> Option<RecoveredId> {
        let recovered = self.resolver.recover_id(&self.store.snapshot(), explicit)?;
        debug!(record_id = %recovered.id, source = %recovered.source, "Identity recovered");
        self.autosave.bind_record(recovered.id.clone(), false);
        Some(recovered)
    }

    /// Whether saves should update the bound record (after the existence and
    /// permission check) instead of creating a new one
    pub fn set_editing_existing(&self, editing_existing: bool) {
        if let Some(id) = self.autosave.record_id() {
            self.autosave.bind_record(id, editing_existing);
        }
    }

    pub fn set_force_create(&self, force: bool) {
        self.autosave.set_force_create(force);
    }

    // ------------------------------------------------------------------
    // Inbound from editing surfaces
    // ------------------------------------------------------------------

    pub fn update_data(
        &self,
        partial: Value,
        source: EditSource,
        meta: UpdateMeta,
    ) -> SessionResult<Vec<ChangeEvent>> {
        Ok(self.store.apply_update(partial, source, meta)?)
    }

    pub fn update_property(
        &self,
        field: &str,
        value: Value,
        source: EditSource,
        meta: UpdateMeta,
    ) -> SessionResult<Vec<ChangeEvent>> {
        Ok(self.store.apply_field_update(field, value, source, meta)?)
    }

    pub fn select_element(&self, selection: Option<ElementDescriptor>, source: EditSource) {
        self.store.select_element(selection, source);
    }

    /// Undo on behalf of `source`; the reverted values are saved like any
    /// other edit from that surface
    pub fn undo(&self, source: EditSource) -> bool {
        self.store.undo(source)
    }

    pub fn redo(&self, source: EditSource) -> bool {
        self.store.redo(source)
    }

    pub fn start_batch(&self) {
        self.store.start_batch();
    }

    /// Close the current batch. Returns `true` when the outermost batch
    /// closed with changes and became a history entry.
    pub fn end_batch(&self, description: Option<String>) -> SessionResult<bool> {
        Ok(self.store.end_batch(description)?)
    }

    /// Save now, bypassing the debounce
    pub async fn save(&self) -> SaveResult<SaveReceipt> {
        self.autosave.save().await
    }

    pub fn pause(&self) {
        self.autosave.pause();
    }

    pub fn resume(&self) {
        self.autosave.resume();
    }

    pub fn note_keystroke(&self) {
        self.autosave.note_keystroke();
    }

    /// Reconcile a version of the document loaded from elsewhere
    pub fn apply_external(&self, document: Document) -> SaveResult<ExternalOutcome> {
        self.autosave.apply_external(document)
    }

    pub fn resolve_conflict(&self, side: ConflictSide) -> SaveResult<()> {
        self.autosave.resolve_conflict(side)
    }

    // ------------------------------------------------------------------
    // Outbound to editing surfaces
    // ------------------------------------------------------------------

    pub fn document(&self) -> Arc<Document> {
        self.store.snapshot()
    }

    pub fn view(&self) -> EditorView {
        let state = self.autosave.state();
        EditorView {
            document: self.store.snapshot(),
            status: state.status,
            can_undo: self.store.can_undo(),
            can_redo: self.store.can_redo(),
            undo_description: self.store.undo_description(),
            redo_description: self.store.redo_description(),
            selection: self.store.selection(),
            last_saved_at: state.last_saved_at,
            last_error: state.last_error,
            reauth_required: state.reauth_required,
            pending_changes: state.pending,
            record_id: state.record_id,
            access_url: state.access_url,
        }
    }

    pub fn watch_state(&self) -> watch::Receiver<SaveState> {
        self.autosave.watch_state()
    }

    /// Called with every new document snapshot
    pub fn subscribe(&self, listener: StoreListener) -> u64 {
        self.store.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.store.unsubscribe(id)
    }

    /// Bus subscription for an editing surface; the surface never receives
    /// events it emitted itself
    pub fn on_surface<F>(&self, kind: EventKind, surface: EditSource, listener: F) -> Subscription
    where
        F: Fn(&BusEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.bus.on_surface(kind, surface, listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autosave::{ConflictPolicy, SaveStatus};
    use crate::bus::BusPayload;
    use crate::identity::{MemorySessionStore, RecoverySource};
    use crate::persistence::{MemoryBackend, SaveStrategy};
    use crate::testing::ScriptedBackend;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::time::sleep;
    use tokio_test::{assert_err, assert_ok};

    const RECORD: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";

    fn session_with(backend: Arc<ScriptedBackend>, config: EditorConfig) -> EditorSession {
        let document = Document::from_value(json!({"businessName": "Acme"})).unwrap();
        EditorSession::with_document(
            config,
            backend,
            Arc::new(MemorySessionStore::new()),
            document,
        )
        .unwrap()
    }

    fn session() -> (EditorSession, Arc<ScriptedBackend>) {
        let backend = Arc::new(ScriptedBackend::new());
        (session_with(backend.clone(), EditorConfig::default()), backend)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = EditorConfig::default();
        config.autosave.max_attempts = 0;
        let result = EditorSession::new(
            config,
            Arc::new(MemoryBackend::default()),
            Arc::new(MemorySessionStore::new()),
        );
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[tokio::test]
    async fn test_edits_undo_and_redo() {
        let (session, _) = session();

        session
            .update_property("tagline", json!("fresh bread"), EditSource::Quick, UpdateMeta::new())
            .unwrap();
        let view = session.view();
        assert!(view.can_undo);
        assert!(!view.can_redo);
        assert_eq!(view.document.get("tagline"), Some(&json!("fresh bread")));

        assert!(session.undo(EditSource::Quick));
        let view = session.view();
        assert_eq!(view.document.get("tagline"), None);
        assert!(view.can_redo);

        assert!(session.redo(EditSource::Quick));
        assert_eq!(session.document().get("tagline"), Some(&json!("fresh bread")));
    }

    #[tokio::test]
    async fn test_batch_is_one_undo_step() {
        let (session, _) = session();

        session.start_batch();
        session
            .update_data(
                json!({"tagline": "a", "primaryColor": "#112233"}),
                EditSource::Fullscreen,
                UpdateMeta::new(),
            )
            .unwrap();
        session
            .update_property("footer", json!("b"), EditSource::Fullscreen, UpdateMeta::new())
            .unwrap();
        assert!(session.end_batch(Some("Theme".into())).unwrap());
        assert_eq!(session.view().undo_description.as_deref(), Some("Theme"));

        assert!(session.undo(EditSource::Quick));
        let doc = session.document();
        assert_eq!(doc.get("tagline"), None);
        assert_eq!(doc.get("footer"), None);
        assert!(!session.view().can_undo);
    }

    #[tokio::test]
    async fn test_selection_is_shared() {
        let (session, _) = session();
        session.select_element(Some(ElementDescriptor::new("hero")), EditSource::Quick);
        assert_eq!(session.view().selection, Some(ElementDescriptor::new("hero")));
    }

    #[tokio::test]
    async fn test_surface_does_not_receive_own_changes() {
        let (session, _) = session();
        let quick_seen = Arc::new(Mutex::new(Vec::new()));
        let full_seen = Arc::new(Mutex::new(Vec::new()));

        let seen = quick_seen.clone();
        let _quick = session.on_surface(EventKind::Change, EditSource::Quick, move |event| {
            if let BusPayload::Change(change) = &event.payload {
                seen.lock().push(change.field.clone());
            }
            Ok(())
        });
        let seen = full_seen.clone();
        let _full = session.on_surface(EventKind::Change, EditSource::Fullscreen, move |event| {
            if let BusPayload::Change(change) = &event.payload {
                seen.lock().push(change.field.clone());
            }
            Ok(())
        });

        session
            .update_property("tagline", json!("x"), EditSource::Quick, UpdateMeta::new())
            .unwrap();
        session.bus().flush_now();

        assert!(quick_seen.lock().is_empty());
        assert_eq!(*full_seen.lock(), vec!["tagline".to_string()]);
    }

    #[tokio::test]
    async fn test_open_loads_without_history() {
        let (session, backend) = session();
        let id = RecordId::parse(RECORD).unwrap();
        backend.inner().insert(
            id.clone(),
            "anonymous",
            Document::from_value(json!({"businessName": "Stored Co", "tagline": "kept"}))
                .unwrap(),
        );

        assert_ok!(session.open(RECORD).await);

        let view = session.view();
        assert_eq!(view.document.business_name(), Some("Stored Co"));
        assert_eq!(view.document.record_id(), Some(RECORD));
        assert_eq!(view.record_id, Some(id));
        assert!(!view.can_undo);
        assert_eq!(view.pending_changes, 0);
    }

    #[tokio::test]
    async fn test_open_then_save_updates_record() {
        let (session, backend) = session();
        let id = RecordId::parse(RECORD).unwrap();
        backend.inner().insert(
            id.clone(),
            "anonymous",
            Document::from_value(json!({"businessName": "Stored Co"})).unwrap(),
        );
        session.open(RECORD).await.unwrap();

        session
            .update_property("tagline", json!("new"), EditSource::Fullscreen, UpdateMeta::new())
            .unwrap();
        let receipt = assert_ok!(session.save().await);

        assert_eq!(receipt.record_id, id);
        assert!(!receipt.created);
        assert_eq!(backend.requests()[0].strategy, SaveStrategy::Update(id.clone()));
        assert_eq!(backend.inner().revision(&id), Some(2));
    }

    #[tokio::test]
    async fn test_open_missing_or_malformed() {
        let (session, _) = session();
        assert!(matches!(
            session.open(RECORD).await,
            Err(SessionError::RecordNotFound(_))
        ));
        let err = assert_err!(session.open("not-a-record").await);
        assert!(matches!(err, SessionError::Identity(_)));
    }

    #[tokio::test]
    async fn test_recover_identity_from_page_url() {
        let (session, _) = session();
        session.set_page_url(Some(format!("https://builder.example.com/edit?id={RECORD}")));

        let recovered = session.recover_identity(None).unwrap();
        assert_eq!(recovered.source, RecoverySource::Url);
        assert_eq!(session.view().record_id, Some(recovered.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_edit_detach_persists() {
        let (session, backend) = session();
        session.attach();

        session
            .update_property("tagline", json!("draft"), EditSource::Quick, UpdateMeta::new())
            .unwrap();
        session.bus().flush_now();
        assert_eq!(session.view().status, SaveStatus::Pending);

        let receipt = session.detach().await.unwrap().unwrap();
        assert!(receipt.created);
        assert_eq!(backend.save_calls(), 1);

        let view = session.view();
        assert_eq!(view.record_id, Some(receipt.record_id));
        assert_eq!(view.access_url, Some(receipt.access_url));
        assert!(view.last_saved_at.is_some());
        assert_eq!(view.pending_changes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_save_through_session() {
        let (session, backend) = session();
        session.attach();

        session
            .update_property("tagline", json!("one"), EditSource::Quick, UpdateMeta::new())
            .unwrap();
        sleep(Duration::from_millis(1200)).await;

        assert_eq!(backend.save_calls(), 1);
        assert_eq!(session.view().status, SaveStatus::Saved);
        let _ = session.detach().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_update_under_merge_policy() {
        let mut config = EditorConfig::default();
        config.autosave = config.autosave.with_conflict_policy(ConflictPolicy::Merge);
        let session = session_with(Arc::new(ScriptedBackend::new()), config);
        session.attach();

        session
            .update_property("tagline", json!("local"), EditSource::Quick, UpdateMeta::new())
            .unwrap();
        session.bus().flush_now();
        let outcome = session
            .apply_external(
                Document::from_value(json!({"businessName": "Acme", "footer": "remote"}))
                    .unwrap(),
            )
            .unwrap();

        assert_eq!(outcome, ExternalOutcome::Merged { fields: 1 });
        let doc = session.document();
        assert_eq!(doc.get("tagline"), Some(&json!("local")));
        assert_eq!(doc.get("footer"), Some(&json!("remote")));
        let _ = session.detach().await;
    }

    #[tokio::test]
    async fn test_store_listener_sees_snapshots() {
        let (session, _) = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = session.subscribe(Arc::new(move |doc: &Arc<Document>| {
            sink.lock().push(doc.get("tagline").cloned());
        }));

        session
            .update_property("tagline", json!("v1"), EditSource::Quick, UpdateMeta::new())
            .unwrap();
        assert!(session.unsubscribe(id));
        session
            .update_property("tagline", json!("v2"), EditSource::Quick, UpdateMeta::new())
            .unwrap();

        assert_eq!(*seen.lock(), vec![Some(json!("v1"))]);
    }
}

//! The document store: single source of truth for page content.
//!
//! All mutations go through [`DocumentStore::apply_update`]. The store:
//! - Emits one change event per field whose value actually changes
//! - Groups the events of one call (or one open batch) into a history entry
//! - Publishes immutable `Arc<Document>` snapshots to its listeners
//!
//! Metadata fields (`_`-prefixed) travel the same path but are never
//! recorded in history and survive undo/redo untouched.

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::history::{HistoryConfig, HistoryManager};
use super::{
    is_metadata_field, ChangeCategory, ChangeEvent, Document, DocumentError, DocumentResult,
    EditSource, ElementDescriptor, UpdateMeta, REPLAY_FLAG,
};
use crate::bus::{BusPayload, ChangeBus};

/// Callback invoked with the new snapshot after every document mutation
pub type StoreListener = Arc<dyn Fn(&Arc<Document>) + Send + Sync>;

/// A single call touching more fields than this is categorised as bulk
const BULK_THRESHOLD: usize = 5;

/// Whether the document has changed since the last confirmed save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Synced,
    Syncing,
}

/// Mutations buffered while a batch is open
struct PendingBatch {
    depth: usize,
    before: Arc<Document>,
    events: Vec<ChangeEvent>,
}

struct StoreState {
    document: Arc<Document>,
    history: HistoryManager,
    batch: Option<PendingBatch>,
    selection: Option<ElementDescriptor>,
    sync_status: SyncStatus,
    /// Incremented on every content mutation
    revision: u64,
}

/// Owner of the canonical document and its history
pub struct DocumentStore {
    state: Mutex<StoreState>,
    bus: Arc<ChangeBus>,
    listeners: RwLock<Vec<(u64, StoreListener)>>,
    next_listener_id: AtomicU64,
}

impl DocumentStore {
    pub fn new(bus: Arc<ChangeBus>, history: &HistoryConfig) -> Self {
        Self::with_document(bus, history, Document::new())
    }

    pub fn with_document(bus: Arc<ChangeBus>, history: &HistoryConfig, document: Document) -> Self {
        Self {
            state: Mutex::new(StoreState {
                document: Arc::new(document),
                history: HistoryManager::new(history),
                batch: None,
                selection: None,
                sync_status: SyncStatus::Synced,
                revision: 0,
            }),
            bus,
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Current immutable snapshot
    pub fn snapshot(&self) -> Arc<Document> {
        self.state.lock().document.clone()
    }

    /// Snapshot together with the revision it was taken at
    pub fn versioned_snapshot(&self) -> (Arc<Document>, u64) {
        let state = self.state.lock();
        (state.document.clone(), state.revision)
    }

    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.state.lock().sync_status
    }

    /// Mark the store synced if nothing changed since `revision` was read
    pub fn mark_synced(&self, revision: u64) {
        let mut state = self.state.lock();
        if state.revision == revision {
            state.sync_status = SyncStatus::Synced;
        }
    }

    /// Register a snapshot listener; returns an id for [`DocumentStore::unsubscribe`]
    pub fn subscribe(&self, listener: StoreListener) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Apply a partial document. Fields whose value is unchanged produce no
    /// event; the remaining events become one history entry unless a batch
    /// is open.
    pub fn apply_update(
        &self,
        partial: Value,
        source: EditSource,
        meta: UpdateMeta,
    ) -> DocumentResult<Vec<ChangeEvent>> {
        let partial = Document::from_value(partial)?;

        let (events, snapshot, recorded) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let before = state.document.clone();

            let content_changes = partial
                .iter()
                .filter(|(field, value)| {
                    !is_metadata_field(field) && before.get(field) != Some(*value)
                })
                .count();
            let meta = if meta.category.is_none() && content_changes > BULK_THRESHOLD {
                meta.with_category(ChangeCategory::Bulk)
            } else {
                meta
            };

            let mut document = (*before).clone();
            let mut events = Vec::new();
            for (field, value) in partial.iter() {
                if document.get(field) == Some(value) {
                    continue;
                }
                let previous = document.set(field.clone(), value.clone());
                events.push(ChangeEvent::new(
                    field.clone(),
                    previous,
                    Some(value.clone()),
                    source,
                    &meta,
                ));
            }

            if events.is_empty() {
                return Ok(events);
            }

            let document = Arc::new(document);
            state.document = document.clone();

            let content: Vec<ChangeEvent> =
                events.iter().filter(|e| !e.is_metadata()).cloned().collect();
            let mut recorded = false;
            if !content.is_empty() {
                state.revision += 1;
                state.sync_status = SyncStatus::Syncing;
                match state.batch.as_mut() {
                    Some(batch) => batch.events.extend(content),
                    None => {
                        let entry = state.history.record(content, before, document.clone(), None);
                        debug!(description = %entry.description, "History entry recorded");
                        recorded = true;
                    }
                }
            }

            (events, document, recorded)
        };

        self.publish(&events, source, &snapshot);
        if recorded {
            self.emit_history_state();
        }
        Ok(events)
    }

    /// Single-field form of [`DocumentStore::apply_update`]
    pub fn apply_field_update(
        &self,
        field: &str,
        value: Value,
        source: EditSource,
        meta: UpdateMeta,
    ) -> DocumentResult<Vec<ChangeEvent>> {
        let mut partial = serde_json::Map::new();
        partial.insert(field.to_string(), value);
        self.apply_update(Value::Object(partial), source, meta)
    }

    /// Replace the whole content (metadata kept) without recording history.
    /// Used when loading a persisted record.
    pub fn replace_document(&self, document: Document, source: EditSource) -> Vec<ChangeEvent> {
        let (events, snapshot) = {
            let mut state = self.state.lock();
            let mut next = (*state.document).clone();
            next.restore_content_from(&document);
            let events = diff_events(&state.document, &next, source, &UpdateMeta::default());
            state.document = Arc::new(next);
            state.history.clear();
            state.batch = None;
            state.sync_status = SyncStatus::Synced;
            state.revision += 1;
            (events, state.document.clone())
        };
        self.publish(&events, source, &snapshot);
        self.emit_history_state();
        events
    }

    /// Replace the whole content (metadata kept) as one undoable update.
    /// Fields missing from `document` are removed.
    pub fn overwrite_content(
        &self,
        document: Document,
        source: EditSource,
        meta: UpdateMeta,
    ) -> Vec<ChangeEvent> {
        let (events, snapshot, recorded) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let before = state.document.clone();
            let mut next = (*before).clone();
            next.restore_content_from(&document);

            let events = diff_events(&before, &next, source, &meta);
            if events.is_empty() {
                return events;
            }

            let next = Arc::new(next);
            state.document = next.clone();
            state.revision += 1;
            state.sync_status = SyncStatus::Syncing;
            let recorded = match state.batch.as_mut() {
                Some(batch) => {
                    batch.events.extend(events.iter().cloned());
                    false
                }
                None => {
                    state
                        .history
                        .record(events.clone(), before, next.clone(), None);
                    true
                }
            };
            (events, next, recorded)
        };

        debug!(changes = events.len(), %source, "Content overwritten");
        self.publish(&events, source, &snapshot);
        if recorded {
            self.emit_history_state();
        }
        events
    }

    /// Open a batch; nested batches fold into the outermost one
    pub fn start_batch(&self) {
        let mut state = self.state.lock();
        match state.batch.as_mut() {
            Some(batch) => batch.depth += 1,
            None => {
                let before = state.document.clone();
                state.batch = Some(PendingBatch {
                    depth: 1,
                    before,
                    events: Vec::new(),
                });
            }
        }
    }

    pub fn in_batch(&self) -> bool {
        self.state.lock().batch.is_some()
    }

    /// Close the batch. The outermost close records exactly one history
    /// entry spanning document-before-batch to the current document.
    pub fn end_batch(&self, description: Option<String>) -> DocumentResult<bool> {
        let recorded = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let batch = state.batch.as_mut().ok_or(DocumentError::NoOpenBatch)?;
            if batch.depth > 1 {
                batch.depth -= 1;
                return Ok(false);
            }
            let Some(batch) = state.batch.take() else {
                return Err(DocumentError::NoOpenBatch);
            };
            if batch.events.is_empty() {
                false
            } else {
                let after = state.document.clone();
                let entry = state
                    .history
                    .record(batch.events, batch.before, after, description);
                debug!(
                    description = %entry.description,
                    changes = entry.changes.len(),
                    "Batch recorded"
                );
                true
            }
        };
        if recorded {
            self.emit_history_state();
        }
        Ok(recorded)
    }

    /// Revert the entry at the cursor. Returns whether an undo occurred.
    ///
    /// The resulting change events are attributed to `source`, the surface
    /// that asked for the undo, whoever wrote the reverted values.
    pub fn undo(&self, source: EditSource) -> bool {
        self.step(true, source)
    }

    /// Reapply the entry after the cursor. Returns whether a redo occurred.
    pub fn redo(&self, source: EditSource) -> bool {
        self.step(false, source)
    }

    fn step(&self, backwards: bool, source: EditSource) -> bool {
        let (events, snapshot) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.batch.is_some() {
                warn!("Undo/redo ignored while a batch is open");
                return false;
            }
            let entry = if backwards {
                state.history.step_back()
            } else {
                state.history.step_forward()
            };
            let Some(entry) = entry else {
                return false;
            };
            let target = if backwards {
                entry.before.clone()
            } else {
                entry.after.clone()
            };

            let mut next = (*state.document).clone();
            next.restore_content_from(&target);
            let meta = UpdateMeta::default().with_extra(REPLAY_FLAG, Value::Bool(true));
            let events = diff_events(&state.document, &next, source, &meta);

            state.document = Arc::new(next);
            state.revision += 1;
            state.sync_status = SyncStatus::Syncing;
            (events, state.document.clone())
        };

        self.publish(&events, source, &snapshot);
        self.emit_history_state();
        true
    }

    pub fn can_undo(&self) -> bool {
        self.state.lock().history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.state.lock().history.can_redo()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.state.lock().history.undo_description().map(str::to_string)
    }

    pub fn redo_description(&self) -> Option<String> {
        self.state.lock().history.redo_description().map(str::to_string)
    }

    pub fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    /// Run `f` against the history (read-only)
    pub fn with_history<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&HistoryManager) -> R,
    {
        f(&self.state.lock().history)
    }

    /// Track the selected element. Selection is UI context: no change event,
    /// no history.
    pub fn select_element(&self, selection: Option<ElementDescriptor>, source: EditSource) {
        {
            let mut state = self.state.lock();
            if state.selection == selection {
                return;
            }
            state.selection = selection.clone();
        }
        self.bus.emit(BusPayload::Selection(selection), source, None);
    }

    pub fn selection(&self) -> Option<ElementDescriptor> {
        self.state.lock().selection.clone()
    }

    fn publish(&self, events: &[ChangeEvent], source: EditSource, snapshot: &Arc<Document>) {
        if events.is_empty() {
            return;
        }
        for event in events {
            self.bus
                .emit(BusPayload::Change(event.clone()), source, None);
        }

        let listeners: Vec<StoreListener> =
            self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(snapshot);
        }
    }

    fn emit_history_state(&self) {
        let (can_undo, can_redo) = {
            let state = self.state.lock();
            (state.history.can_undo(), state.history.can_redo())
        };
        self.bus.emit(
            BusPayload::History { can_undo, can_redo },
            EditSource::External,
            None,
        );
    }
}

fn diff_events(
    current: &Document,
    next: &Document,
    source: EditSource,
    meta: &UpdateMeta,
) -> Vec<ChangeEvent> {
    current
        .content_diff(next)
        .into_iter()
        .map(|(field, previous, value)| ChangeEvent::new(field, previous, value, source, meta))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConfig, EventKind};
    use serde_json::json;

    fn store() -> DocumentStore {
        let bus = ChangeBus::new(BusConfig::default());
        DocumentStore::with_document(
            bus,
            &HistoryConfig::default(),
            Document::from_value(json!({"businessName": "Acme", "heroTitle": "Welcome"})).unwrap(),
        )
    }

    fn edit(store: &DocumentStore, field: &str, value: Value, source: EditSource) {
        store
            .apply_field_update(field, value, source, UpdateMeta::default())
            .unwrap();
    }

    #[test]
    fn test_noop_update_produces_nothing() {
        let store = store();
        let events = store
            .apply_update(
                json!({"businessName": "Acme", "heroTitle": "Welcome"}),
                EditSource::Quick,
                UpdateMeta::default(),
            )
            .unwrap();

        assert!(events.is_empty());
        assert_eq!(store.history_len(), 0);
        assert_eq!(store.revision(), 0);
        assert_eq!(store.sync_status(), SyncStatus::Synced);
    }

    #[test]
    fn test_update_emits_only_changed_fields() {
        let store = store();
        let events = store
            .apply_update(
                json!({"businessName": "Acme", "heroTitle": "Hello", "tagline": "Fresh"}),
                EditSource::Fullscreen,
                UpdateMeta::default().with_section("hero"),
            )
            .unwrap();

        let fields: Vec<&str> = events.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["heroTitle", "tagline"]);
        assert_eq!(events[0].previous, Some(json!("Welcome")));
        assert_eq!(events[1].previous, None);
        assert_eq!(events[0].section.as_deref(), Some("hero"));
        assert_eq!(store.history_len(), 1);
        assert_eq!(store.sync_status(), SyncStatus::Syncing);
    }

    #[test]
    fn test_undo_redo_round_trip() {
        let store = store();
        let original = store.snapshot();

        for i in 0..4 {
            edit(&store, "heroTitle", json!(format!("v{}", i)), EditSource::Quick);
        }
        edit(&store, "primaryColor", json!("#112233"), EditSource::Fullscreen);
        let edited = store.snapshot();

        for _ in 0..5 {
            assert!(store.undo(EditSource::Quick));
        }
        assert!(!store.undo(EditSource::Quick));
        assert_eq!(*store.snapshot(), *original);

        for _ in 0..5 {
            assert!(store.redo(EditSource::Quick));
        }
        assert!(!store.redo(EditSource::Quick));
        assert_eq!(*store.snapshot(), *edited);
    }

    #[test]
    fn test_batch_is_one_history_entry() {
        let store = store();
        let before = store.snapshot();

        store.start_batch();
        edit(&store, "primaryColor", json!("#000000"), EditSource::Fullscreen);
        edit(&store, "fontFamily", json!("Inter"), EditSource::Fullscreen);
        edit(&store, "heroTitle", json!("Bold"), EditSource::Fullscreen);
        assert_eq!(store.history_len(), 0);
        assert!(store.end_batch(Some("Apply preset".into())).unwrap());
        let after = store.snapshot();

        assert_eq!(store.history_len(), 1);
        store.with_history(|history| {
            let entry = history.entries().next().unwrap();
            assert_eq!(entry.before, before);
            assert_eq!(entry.after, after);
            assert_eq!(entry.changes.len(), 3);
            assert_eq!(entry.description, "Apply preset");
        });

        assert!(store.undo(EditSource::Quick));
        assert_eq!(*store.snapshot(), *before);
    }

    #[test]
    fn test_nested_batches_fold() {
        let store = store();
        store.start_batch();
        store.start_batch();
        edit(&store, "heroTitle", json!("A"), EditSource::Quick);
        assert!(!store.end_batch(None).unwrap());
        edit(&store, "tagline", json!("B"), EditSource::Quick);
        assert!(store.end_batch(None).unwrap());

        assert_eq!(store.history_len(), 1);
        assert!(matches!(store.end_batch(None), Err(DocumentError::NoOpenBatch)));
    }

    #[test]
    fn test_new_edit_after_undo_discards_redo() {
        let store = store();
        for title in ["a", "b", "c"] {
            edit(&store, "heroTitle", json!(title), EditSource::Quick);
        }
        assert!(store.undo(EditSource::Quick));
        assert!(store.undo(EditSource::Quick));
        edit(&store, "tagline", json!("new branch"), EditSource::Quick);

        assert!(!store.redo(EditSource::Quick));
        assert!(!store.can_redo());
    }

    #[test]
    fn test_metadata_is_not_undoable() {
        let store = store();
        edit(&store, "heroTitle", json!("Edited"), EditSource::Quick);
        store
            .apply_field_update(
                "_recordId",
                json!("6f1c2a4e-8d1b-4c11-9b43-1f0f6f7a9b10"),
                EditSource::External,
                UpdateMeta::default(),
            )
            .unwrap();
        assert_eq!(store.history_len(), 1);

        assert!(store.undo(EditSource::Quick));
        let doc = store.snapshot();
        assert_eq!(doc.get("heroTitle"), Some(&json!("Welcome")));
        assert_eq!(doc.record_id(), Some("6f1c2a4e-8d1b-4c11-9b43-1f0f6f7a9b10"));
    }

    #[test]
    fn test_selection_is_not_content() {
        let store = store();
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        store.bus.on(EventKind::Change, move |_| {
            *counter.lock() += 1;
            Ok(())
        });

        store.select_element(Some(ElementDescriptor::new("hero")), EditSource::Quick);
        store.bus.flush_now();

        assert_eq!(*seen.lock(), 0);
        assert_eq!(store.history_len(), 0);
        assert_eq!(store.selection(), Some(ElementDescriptor::new("hero")));
    }

    #[test]
    fn test_bulk_category_for_wide_updates() {
        let store = store();
        let events = store
            .apply_update(
                json!({"a": "1", "b": "2", "c": "3", "d": "4", "e": "5", "f": "6"}),
                EditSource::Fullscreen,
                UpdateMeta::default(),
            )
            .unwrap();
        assert!(events.iter().all(|e| e.category == ChangeCategory::Bulk));
    }

    #[test]
    fn test_undo_events_are_flagged_replay() {
        let store = store();
        edit(&store, "heroTitle", json!("Edited"), EditSource::Quick);
        let replays = Arc::new(Mutex::new(Vec::new()));
        let sink = replays.clone();
        store.bus.on(EventKind::Change, move |event| {
            if let BusPayload::Change(change) = &event.payload {
                sink.lock().push(change.is_replay());
            }
            Ok(())
        });
        store.bus.flush_now();
        replays.lock().clear();

        store.undo(EditSource::Quick);
        store.bus.flush_now();
        assert_eq!(*replays.lock(), vec![true]);
    }

    #[test]
    fn test_subscribers_see_snapshots() {
        let store = store();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.subscribe(Arc::new(move |doc: &Arc<Document>| {
            sink.lock().push(doc.get("heroTitle").cloned());
        }));

        edit(&store, "heroTitle", json!("One"), EditSource::Quick);
        edit(&store, "heroTitle", json!("One"), EditSource::Quick);

        assert_eq!(*seen.lock(), vec![Some(json!("One"))]);
    }

    #[test]
    fn test_undo_is_attributed_to_invoking_surface() {
        let store = store();
        edit(&store, "heroTitle", json!("From outside"), EditSource::External);
        store.bus.flush_now();

        let quick = Arc::new(Mutex::new(Vec::new()));
        let full = Arc::new(Mutex::new(Vec::new()));
        let sink = quick.clone();
        let _quick = store.bus.on_surface(EventKind::Change, EditSource::Quick, move |event| {
            sink.lock().push(event.source);
            Ok(())
        });
        let sink = full.clone();
        let _full = store
            .bus
            .on_surface(EventKind::Change, EditSource::Fullscreen, move |event| {
                if let BusPayload::Change(change) = &event.payload {
                    sink.lock().push(change.source);
                }
                Ok(())
            });

        assert!(store.undo(EditSource::Quick));
        store.bus.flush_now();

        assert_eq!(store.snapshot().get("heroTitle"), Some(&json!("Welcome")));
        assert!(quick.lock().is_empty());
        assert_eq!(*full.lock(), vec![EditSource::Quick]);
    }

    #[test]
    fn test_overwrite_replaces_content_and_keeps_metadata() {
        let store = store();
        edit(&store, "tagline", json!("mine"), EditSource::Quick);
        let record_id = json!("6f1c2a4e-8d1b-4c11-9b43-1f0f6f7a9b10");
        edit(&store, "_recordId", record_id, EditSource::External);

        let incoming =
            Document::from_value(json!({"businessName": "Acme", "heroTitle": "Theirs"})).unwrap();
        let events = store.overwrite_content(incoming, EditSource::External, UpdateMeta::default());

        let fields: Vec<&str> = events.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["heroTitle", "tagline"]);
        let doc = store.snapshot();
        assert_eq!(doc.get("tagline"), None);
        assert_eq!(doc.get("heroTitle"), Some(&json!("Theirs")));
        assert_eq!(doc.record_id(), Some("6f1c2a4e-8d1b-4c11-9b43-1f0f6f7a9b10"));
        assert_eq!(store.history_len(), 2);

        assert!(store.undo(EditSource::Fullscreen));
        assert_eq!(store.snapshot().get("tagline"), Some(&json!("mine")));
    }
}

//! The auto-save state machine.
//!
//! `idle -> pending -> saving -> saved | error -> idle`, with `paused` and
//! `conflict` layered on top. A single driver task (spawned by
//! [`AutoSaveController::attach`]) owns the debounce, max-wait, periodic
//! and "saved" display timers. Saves themselves run as one shared future:
//! concurrent requests join the save already in flight.

use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::retry::Backoff;
use super::{
    AutoSaveConfig, ConflictPolicy, ConflictSide, ExternalOutcome, SaveAttempt, SaveError,
    SaveReceipt, SaveResult, SaveState, SaveStatus, SaveTrigger,
};
use crate::bus::{
    BusPayload, ChangeBus, EventKind, FieldConflict, FieldWrite, ListenerError, Subscription,
};
use crate::document::{
    keys, ChangeEvent, Document, DocumentStore, EditSource, UpdateMeta, RESOLUTION_FLAG,
};
use crate::identity::{IdentityResolver, RecordId};
use crate::persistence::{
    PersistenceBackend, PersistenceError, PersistenceResult, SaveOutcome, SaveRequest,
    SaveStrategy,
};

type SharedSave = Shared<BoxFuture<'static, SaveResult<SaveReceipt>>>;

/// A conflict held under the `manual` policy
#[derive(Debug, Clone)]
enum HeldConflict {
    Field(FieldConflict),
    Document(Document),
}

struct ControllerState {
    status: SaveStatus,
    paused: bool,
    /// Set after exhausted retries or an auth failure; suppresses automatic saves
    blocked: bool,
    conflict: Option<HeldConflict>,
    /// Change events not yet covered by a successful save
    pending: Vec<ChangeEvent>,
    debounce_at: Option<Instant>,
    max_wait_at: Option<Instant>,
    immediate: Option<SaveTrigger>,
    saved_until: Option<Instant>,
    typing_hold_until: Option<Instant>,
    last_keystroke: Option<Instant>,
    record_id: Option<RecordId>,
    editing_existing: bool,
    force_create: bool,
    access_url: Option<String>,
    last_saved_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    reauth_required: bool,
    save_count: u64,
    log: VecDeque<SaveAttempt>,
}

impl ControllerState {
    fn new() -> Self {
        Self {
            status: SaveStatus::Idle,
            paused: false,
            blocked: false,
            conflict: None,
            pending: Vec::new(),
            debounce_at: None,
            max_wait_at: None,
            immediate: None,
            saved_until: None,
            typing_hold_until: None,
            last_keystroke: None,
            record_id: None,
            editing_existing: false,
            force_create: false,
            access_url: None,
            last_saved_at: None,
            last_error: None,
            reauth_required: false,
            save_count: 0,
            log: VecDeque::new(),
        }
    }

    fn visible_status(&self) -> SaveStatus {
        if self.conflict.is_some() {
            SaveStatus::Conflict
        } else if self.paused {
            SaveStatus::Paused
        } else {
            self.status
        }
    }

    fn auto_save_allowed(&self) -> bool {
        !self.paused && !self.blocked && self.conflict.is_none()
    }

    fn clear_timers(&mut self) {
        self.debounce_at = None;
        self.max_wait_at = None;
        self.immediate = None;
    }

    /// Restart the debounce; start the max-wait clock if it is not running
    fn arm(&mut self, now: Instant, config: &AutoSaveConfig) {
        self.debounce_at = Some(now + config.debounce);
        if self.max_wait_at.is_none() {
            self.max_wait_at = Some(now + config.max_wait);
        }
    }

    /// When the next automatic save is due, and why
    fn save_due_at(&self, now: Instant) -> Option<(Instant, SaveTrigger)> {
        if self.pending.is_empty() {
            return None;
        }
        if let Some(trigger) = self.immediate {
            return Some((now, trigger));
        }

        // Typing holds the debounce but never the max-wait
        let debounce = self.debounce_at.map(|at| match self.typing_hold_until {
            Some(hold) if hold > at => hold,
            _ => at,
        });
        match (debounce, self.max_wait_at) {
            (Some(d), Some(m)) if m <= d => Some((m, SaveTrigger::MaxWait)),
            (Some(d), _) => Some((d, SaveTrigger::Debounce)),
            (None, Some(m)) => Some((m, SaveTrigger::MaxWait)),
            (None, None) => None,
        }
    }

    fn to_save_state(&self) -> SaveState {
        SaveState {
            status: self.visible_status(),
            last_saved_at: self.last_saved_at,
            last_error: self.last_error.clone(),
            reauth_required: self.reauth_required,
            save_count: self.save_count,
            pending: self.pending.len(),
            record_id: self.record_id.clone(),
            access_url: self.access_url.clone(),
        }
    }
}

/// Debounced, retrying persistence of one document
pub struct AutoSaveController {
    config: AutoSaveConfig,
    bus: Arc<ChangeBus>,
    store: Arc<DocumentStore>,
    resolver: Arc<IdentityResolver>,
    backend: Arc<dyn PersistenceBackend>,
    backoff: Backoff,
    state: Mutex<ControllerState>,
    in_flight: Mutex<Option<SharedSave>>,
    state_tx: watch::Sender<SaveState>,
    wake: Notify,
    shutdown_tx: broadcast::Sender<()>,
    driver: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl AutoSaveController {
    pub fn new(
        config: AutoSaveConfig,
        bus: Arc<ChangeBus>,
        store: Arc<DocumentStore>,
        resolver: Arc<IdentityResolver>,
        backend: Arc<dyn PersistenceBackend>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SaveState::default());
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            backoff: Backoff::new(config.backoff_base, config.backoff_max),
            config,
            bus,
            store,
            resolver,
            backend,
            state: Mutex::new(ControllerState::new()),
            in_flight: Mutex::new(None),
            state_tx,
            wake: Notify::new(),
            shutdown_tx,
            driver: Mutex::new(None),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &AutoSaveConfig {
        &self.config
    }

    /// Subscribe to the bus and start the timer driver
    pub fn attach(self: &Arc<Self>) {
        let mut driver = self.driver.lock();
        if driver.is_some() {
            return;
        }

        let weak = Arc::downgrade(self);
        let on_change = self.bus.on(EventKind::Change, move |event| {
            if let (Some(controller), BusPayload::Change(change)) =
                (weak.upgrade(), &event.payload)
            {
                controller.handle_change(change);
            }
            Ok(())
        });
        let weak = Arc::downgrade(self);
        let on_conflict = self.bus.on(EventKind::Conflict, move |event| {
            match (weak.upgrade(), &event.payload) {
                (Some(controller), BusPayload::Conflict(conflict)) => controller
                    .handle_conflict(conflict)
                    .map_err(|e| ListenerError::new(e.to_string())),
                _ => Ok(()),
            }
        });
        self.subscriptions.lock().extend([on_change, on_conflict]);

        let shutdown = self.shutdown_tx.subscribe();
        *driver = Some(tokio::spawn(self.clone().run_driver(shutdown)));
        info!(policy = %self.config.conflict_policy, "Auto-save attached");
    }

    pub fn is_attached(&self) -> bool {
        self.driver.lock().is_some()
    }

    /// Stop every timer, unsubscribe, and save unsaved work one last time
    pub async fn detach(self: &Arc<Self>) -> SaveResult<Option<SaveReceipt>> {
        let handle = self.driver.lock().take();
        if let Some(handle) = handle {
            let _ = self.shutdown_tx.send(());
            if let Err(e) = handle.await {
                warn!(error = %e, "Auto-save driver ended abnormally");
            }
        }

        // Changes still queued on the bus belong to this session
        self.bus.flush_now();
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }

        let in_flight = self.in_flight.lock().clone();
        if let Some(save) = in_flight {
            let _ = save.await;
        }

        let needs_save = {
            let mut state = self.state.lock();
            state.clear_timers();
            state.saved_until = None;
            !state.pending.is_empty() && state.conflict.is_none() && !state.reauth_required
        };
        if !needs_save {
            info!("Auto-save detached");
            return Ok(None);
        }

        info!("Final save before detach");
        self.request_save(SaveTrigger::Detach).await.map(Some)
    }

    pub fn watch_state(&self) -> watch::Receiver<SaveState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> SaveState {
        self.state.lock().to_save_state()
    }

    pub fn status(&self) -> SaveStatus {
        self.state.lock().visible_status()
    }

    pub fn pending_changes(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn has_conflict(&self) -> bool {
        self.state.lock().conflict.is_some()
    }

    /// Recent save attempts, oldest first
    pub fn save_log(&self) -> Vec<SaveAttempt> {
        self.state.lock().log.iter().cloned().collect()
    }

    pub fn record_id(&self) -> Option<RecordId> {
        self.state.lock().record_id.clone()
    }

    /// Bind the session to a persisted record
    pub fn bind_record(&self, id: RecordId, editing_existing: bool) {
        {
            let mut state = self.state.lock();
            state.record_id = Some(id);
            state.editing_existing = editing_existing;
        }
        self.publish_state();
    }

    /// Make the next save create a new record regardless of recovered ids
    pub fn set_force_create(&self, force: bool) {
        self.state.lock().force_create = force;
    }

    /// Queue a change for saving and (re)arm the timers
    pub fn handle_change(&self, change: &ChangeEvent) {
        if change.source == EditSource::External || change.is_metadata() {
            return;
        }

        let now = Instant::now();
        {
            let mut state = self.state.lock();
            state.pending.push(change.clone());
            if !state.paused {
                state.arm(now, &self.config);
                if self.config.is_critical(&change.field) {
                    state.immediate = Some(SaveTrigger::Critical);
                }
            }
            match state.status {
                SaveStatus::Idle | SaveStatus::Saved => {
                    state.status = SaveStatus::Pending;
                    state.saved_until = None;
                }
                SaveStatus::Error if !state.blocked => state.status = SaveStatus::Pending,
                _ => {}
            }
        }

        debug!(field = %change.field, source = %change.source, "Change queued for save");
        self.publish_state();
        self.wake.notify_one();
    }

    /// Apply the configured policy to a field-level write conflict
    pub fn handle_conflict(&self, conflict: &FieldConflict) -> SaveResult<()> {
        let policy = self.config.conflict_policy;
        let (first, second) = conflict.sources();

        if policy == ConflictPolicy::Manual {
            {
                let mut state = self.state.lock();
                state.conflict = Some(HeldConflict::Field(conflict.clone()));
                state.clear_timers();
            }
            warn!(
                field = %conflict.field,
                %first,
                %second,
                "Write conflict held for manual resolution"
            );
            self.publish_state();
            return Ok(());
        }

        if first != EditSource::External && second != EditSource::External {
            debug!(
                field = %conflict.field,
                %first,
                %second,
                "Surfaces wrote the same field; last write kept"
            );
            return Ok(());
        }

        let winner = match policy {
            ConflictPolicy::Local => conflict.local_write(),
            _ => conflict.external_write(),
        };
        if winner.event_id == conflict.second.event_id {
            // The winning value is already current
            return Ok(());
        }

        info!(
            field = %conflict.field,
            %policy,
            winner = %winner.source,
            "Resolving write conflict"
        );
        self.reapply(&conflict.field, winner)
    }

    fn reapply(&self, field: &str, write: &FieldWrite) -> SaveResult<()> {
        let meta = UpdateMeta::new().with_extra(
            RESOLUTION_FLAG,
            json!(self.config.conflict_policy.to_string()),
        );
        self.store
            .apply_field_update(
                field,
                write.value.clone().unwrap_or(Value::Null),
                write.source,
                meta,
            )
            .map(|_| ())
            .map_err(|e| SaveError::Store(e.to_string()))
    }

    /// Reconcile an externally loaded version of the document with local
    /// pending changes
    pub fn apply_external(&self, document: Document) -> SaveResult<ExternalOutcome> {
        let policy = self.config.conflict_policy;
        let has_pending = !self.state.lock().pending.is_empty();

        if !has_pending {
            self.write_external(&document)?;
            return Ok(ExternalOutcome::Applied);
        }

        let outcome = match policy {
            ConflictPolicy::Local => {
                info!("External update ignored; local changes pending");
                ExternalOutcome::Ignored
            }
            ConflictPolicy::External => {
                let (fields, dropped) = self.overwrite_external(document);
                info!(fields, dropped, "External update overwrote local changes");
                ExternalOutcome::Overwritten
            }
            ConflictPolicy::Merge => {
                let fields = self.write_external(&document)?;
                info!(fields, "External update merged");
                ExternalOutcome::Merged { fields }
            }
            ConflictPolicy::Manual => {
                {
                    let mut state = self.state.lock();
                    state.conflict = Some(HeldConflict::Document(document));
                    state.clear_timers();
                }
                warn!("External update held for manual resolution");
                ExternalOutcome::Conflict
            }
        };

        self.publish_state();
        Ok(outcome)
    }

    /// Replace the content with `document` and discard every local pending
    /// change. Returns the number of changed fields and dropped changes.
    ///
    /// A save already in flight still carries the discarded changes, so the
    /// overwrite itself is queued to be saved after it.
    fn overwrite_external(&self, document: Document) -> (usize, usize) {
        let meta = UpdateMeta::new().with_extra(
            RESOLUTION_FLAG,
            json!(self.config.conflict_policy.to_string()),
        );
        let events = self.store.overwrite_content(document, EditSource::External, meta);

        let saving = self.saving();
        let resave = saving && !events.is_empty();
        let dropped = {
            let mut state = self.state.lock();
            let dropped = std::mem::take(&mut state.pending).len();
            if resave {
                state.pending.extend(events.iter().cloned());
                if !state.paused {
                    state.arm(Instant::now(), &self.config);
                }
                if state.status != SaveStatus::Saving {
                    state.status = SaveStatus::Pending;
                }
            } else {
                state.clear_timers();
                if state.status == SaveStatus::Pending {
                    state.status = SaveStatus::Idle;
                }
            }
            dropped
        };
        if resave {
            self.wake.notify_one();
        }
        (events.len(), dropped)
    }

    fn write_external(&self, document: &Document) -> SaveResult<usize> {
        let meta = UpdateMeta::new().with_extra(
            RESOLUTION_FLAG,
            json!(self.config.conflict_policy.to_string()),
        );
        self.store
            .apply_update(document.without_metadata().to_value(), EditSource::External, meta)
            .map(|events| events.len())
            .map_err(|e| SaveError::Store(e.to_string()))
    }

    /// Settle a conflict held under the `manual` policy and re-arm saving
    pub fn resolve_conflict(&self, side: ConflictSide) -> SaveResult<()> {
        let held = self
            .state
            .lock()
            .conflict
            .take()
            .ok_or(SaveError::NoConflict)?;

        match (held, side) {
            (HeldConflict::Field(conflict), ConflictSide::Local) => {
                self.reapply(&conflict.field, conflict.local_write())?
            }
            (HeldConflict::Field(conflict), ConflictSide::External) => {
                self.reapply(&conflict.field, conflict.external_write())?
            }
            (HeldConflict::Document(_), ConflictSide::Local) => {}
            (HeldConflict::Document(document), ConflictSide::External) => {
                self.overwrite_external(document);
            }
        }

        {
            let mut state = self.state.lock();
            if !state.pending.is_empty() {
                state.immediate = Some(SaveTrigger::ConflictResolved);
                if state.status != SaveStatus::Saving {
                    state.status = SaveStatus::Pending;
                }
            }
        }
        info!(?side, "Conflict resolved");
        self.publish_state();
        self.wake.notify_one();
        Ok(())
    }

    /// Cancel timers; changes keep queueing but nothing saves automatically
    pub fn pause(&self) {
        {
            let mut state = self.state.lock();
            state.paused = true;
            state.clear_timers();
        }
        info!("Auto-save paused");
        self.publish_state();
        self.wake.notify_one();
    }

    /// Re-arm saving; unsaved changes are saved right away
    pub fn resume(&self) {
        {
            let mut state = self.state.lock();
            state.paused = false;
            state.blocked = false;
            state.reauth_required = false;
            if !state.pending.is_empty() {
                state.immediate = Some(SaveTrigger::Resume);
                if state.status != SaveStatus::Saving {
                    state.status = SaveStatus::Pending;
                }
            } else if state.status == SaveStatus::Error {
                state.status = SaveStatus::Idle;
            }
        }
        info!("Auto-save resumed");
        self.publish_state();
        self.wake.notify_one();
    }

    /// Report a keystroke; bursts hold the debounce until typing goes quiet
    pub fn note_keystroke(&self) {
        if !self.config.typing_awareness {
            return;
        }
        let now = Instant::now();
        let quiet = self.config.typing_quiet_period;
        {
            let mut state = self.state.lock();
            let rapid = state
                .last_keystroke
                .map_or(false, |prev| now.saturating_duration_since(prev) < quiet);
            state.last_keystroke = Some(now);
            if rapid {
                state.typing_hold_until = Some(now + quiet);
            }
        }
        self.wake.notify_one();
    }

    /// Save now. Clears a blocked state; joins a save already in flight.
    pub async fn save(self: &Arc<Self>) -> SaveResult<SaveReceipt> {
        {
            let mut state = self.state.lock();
            if state.conflict.is_some() {
                return Err(SaveError::ConflictUnresolved);
            }
            state.blocked = false;
        }
        self.request_save(SaveTrigger::Manual).await
    }

    /// Start a save cycle, or join the one in flight
    fn request_save(self: &Arc<Self>, trigger: SaveTrigger) -> SharedSave {
        let mut slot = self.in_flight.lock();
        if let Some(save) = slot.as_ref() {
            debug!(?trigger, "Joining in-flight save");
            return save.clone();
        }

        let controller = self.clone();
        let save = async move {
            let result = controller.clone().run_save_cycle(trigger).await;
            *controller.in_flight.lock() = None;
            controller.wake.notify_one();
            result
        }
        .boxed()
        .shared();

        *slot = Some(save.clone());
        tokio::spawn(save.clone());
        save
    }

    async fn run_save_cycle(self: Arc<Self>, trigger: SaveTrigger) -> SaveResult<SaveReceipt> {
        // Changes queued before the snapshot is taken are all in it
        let (covered, bound_id, editing_existing, force_create) = {
            let mut state = self.state.lock();
            state.clear_timers();
            state.status = SaveStatus::Saving;
            state.saved_until = None;
            (
                state.pending.iter().map(|change| change.id).collect::<HashSet<Uuid>>(),
                state.record_id.clone(),
                state.editing_existing,
                state.force_create,
            )
        };
        let (snapshot, revision) = self.store.versioned_snapshot();
        self.publish_state();
        info!(?trigger, pending = covered.len(), "Save started");

        if let Err(err) = self.config.validate_document(&snapshot) {
            self.log_attempt(trigger, 1, SaveStrategy::Create, &snapshot, Some(err.to_string()));
            warn!(error = %err, "Save rejected by validation");
            return Err(self.fail(err, false));
        }

        let recovered = self
            .resolver
            .recover_id(&snapshot, bound_id.as_ref().map(RecordId::as_str));
        let decision = self
            .resolver
            .determine_strategy(
                recovered.as_ref().map(|r| &r.id),
                editing_existing,
                force_create,
                self.resolver.actor(),
            )
            .await;
        debug!(strategy = ?decision.strategy, reason = %decision.reason, "Save strategy chosen");

        let mut strategy = decision.strategy;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.persist(&snapshot, &strategy).await {
                Ok(outcome) => {
                    self.log_attempt(trigger, attempt, strategy, &snapshot, None);
                    return self.complete(trigger, &snapshot, revision, &covered, outcome, attempt);
                }
                Err(err) => err,
            };
            self.log_attempt(trigger, attempt, strategy.clone(), &snapshot, Some(err.to_string()));

            // A rejected update target is retried once as a create, outside the budget
            if err.is_identity_rejection() {
                if let SaveStrategy::Update(stale) = &strategy {
                    warn!(
                        record_id = %stale,
                        error = %err,
                        "Update target rejected, retrying as create"
                    );
                    self.drop_stale_id(stale);
                    strategy = SaveStrategy::Create;
                    continue;
                }
            }

            match err {
                PersistenceError::Validation(_) => {
                    warn!(error = %err, "Save rejected by backend validation");
                    return Err(self.fail(err.into(), false));
                }
                PersistenceError::Unauthorized { .. } => {
                    error!(error = %err, "Save not authorized");
                    return Err(self.fail(err.into(), true));
                }
                _ if err.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Save failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => {
                    error!(attempts = attempt, error = %err, "Save failed, giving up");
                    return Err(self.fail(
                        SaveError::Exhausted {
                            attempts: attempt,
                            last_error: err.to_string(),
                        },
                        true,
                    ));
                }
            }
        }
    }

    async fn persist(
        &self,
        snapshot: &Document,
        strategy: &SaveStrategy,
    ) -> PersistenceResult<SaveOutcome> {
        let request = SaveRequest {
            document: snapshot.without_metadata(),
            strategy: strategy.clone(),
            actor: self.resolver.actor().to_string(),
        };
        let timeout = self.config.save_timeout;
        match tokio::time::timeout(timeout, self.backend.save(request)).await {
            Ok(result) => result,
            Err(_) => Err(PersistenceError::Transient(format!(
                "save timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }

    fn complete(
        &self,
        trigger: SaveTrigger,
        snapshot: &Document,
        revision: u64,
        covered: &HashSet<Uuid>,
        outcome: SaveOutcome,
        attempts: u32,
    ) -> SaveResult<SaveReceipt> {
        let saved_at = Utc::now();

        // Bookkeeping goes through the store like any other write
        let mut bookkeeping = Map::new();
        bookkeeping.insert(keys::RECORD_ID.to_string(), json!(outcome.record_id.as_str()));
        bookkeeping.insert(keys::LAST_SAVED.to_string(), json!(saved_at.to_rfc3339()));
        bookkeeping.insert(keys::ACCESS_URL.to_string(), json!(outcome.access_url));
        self.store
            .apply_update(Value::Object(bookkeeping), EditSource::External, UpdateMeta::default())
            .map_err(|e| self.fail(SaveError::Store(e.to_string()), false))?;

        if let Err(e) = self.resolver.remember(snapshot, &outcome.record_id) {
            warn!(error = %e, "Failed to store recovery entry");
        }
        self.store.mark_synced(revision);

        let now = Instant::now();
        {
            let mut state = self.state.lock();
            state.pending.retain(|change| !covered.contains(&change.id));
            state.record_id = Some(outcome.record_id.clone());
            state.access_url = Some(outcome.access_url.clone());
            state.editing_existing = true;
            state.force_create = false;
            state.blocked = false;
            state.reauth_required = false;
            state.last_error = None;
            state.save_count += 1;
            state.last_saved_at = Some(saved_at);

            if state.pending.is_empty() {
                state.status = SaveStatus::Saved;
                state.saved_until = Some(now + self.config.saved_display);
            } else {
                // Changes made while saving go into the next cycle
                state.status = SaveStatus::Pending;
                if !state.paused && state.debounce_at.is_none() {
                    state.arm(now, &self.config);
                }
            }
        }

        info!(
            record_id = %outcome.record_id,
            created = outcome.created,
            attempts,
            ?trigger,
            "Document saved"
        );
        self.publish_state();

        Ok(SaveReceipt {
            record_id: outcome.record_id,
            access_url: outcome.access_url,
            created: outcome.created,
            trigger,
            attempts,
            saved_at,
        })
    }

    fn fail(&self, err: SaveError, block: bool) -> SaveError {
        {
            let mut state = self.state.lock();
            state.status = SaveStatus::Error;
            state.last_error = Some(err.to_string());
            state.reauth_required = err.requires_reauth();
            if block {
                state.blocked = true;
            }
        }
        self.publish_state();
        err
    }

    fn drop_stale_id(&self, stale: &RecordId) {
        self.resolver.forget(stale);
        let mut state = self.state.lock();
        if state.record_id.as_ref() == Some(stale) {
            state.record_id = None;
            state.editing_existing = false;
        }
    }

    fn log_attempt(
        &self,
        trigger: SaveTrigger,
        attempt: u32,
        strategy: SaveStrategy,
        snapshot: &Arc<Document>,
        error: Option<String>,
    ) {
        let mut state = self.state.lock();
        state.log.push_back(SaveAttempt {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            trigger,
            attempt,
            strategy,
            snapshot: snapshot.clone(),
            error,
        });
        while state.log.len() > self.config.save_log_capacity {
            state.log.pop_front();
        }
    }

    fn publish_state(&self) {
        let state = self.state.lock().to_save_state();
        self.state_tx.send_replace(state);
    }

    async fn run_driver(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.periodic_interval;
        let mut periodic = tokio::time::interval_at(Instant::now() + period, period);
        periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.next_deadline();
            let sleep = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = sleep => self.on_deadline(),
                _ = periodic.tick() => self.on_periodic(),
                _ = self.wake.notified() => {}
                _ = shutdown.recv() => {
                    debug!("Auto-save driver shutting down");
                    break;
                }
            }
        }
    }

    fn saving(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    fn next_deadline(&self) -> Option<Instant> {
        let saving = self.saving();
        let state = self.state.lock();
        let save_at = if saving || !state.auto_save_allowed() {
            None
        } else {
            state.save_due_at(Instant::now()).map(|(at, _)| at)
        };
        match (state.saved_until, save_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn on_deadline(self: &Arc<Self>) {
        let now = Instant::now();
        let saving = self.saving();
        let trigger = {
            let mut state = self.state.lock();
            if state.saved_until.map_or(false, |at| at <= now) {
                state.saved_until = None;
                if state.status == SaveStatus::Saved {
                    state.status = if state.pending.is_empty() {
                        SaveStatus::Idle
                    } else {
                        SaveStatus::Pending
                    };
                }
            }
            if saving || !state.auto_save_allowed() {
                None
            } else {
                state
                    .save_due_at(now)
                    .filter(|(at, _)| *at <= now)
                    .map(|(_, trigger)| trigger)
            }
        };

        self.publish_state();
        if let Some(trigger) = trigger {
            debug!(?trigger, "Auto-save due");
            let _ = self.request_save(trigger);
        }
    }

    fn on_periodic(self: &Arc<Self>) {
        let now = Instant::now();
        let saving = self.saving();
        let due = {
            let state = self.state.lock();
            let typing = state.typing_hold_until.map_or(false, |hold| hold > now);
            !saving
                && !typing
                && state.auto_save_allowed()
                && state.status != SaveStatus::Error
                && !state.pending.is_empty()
        };
        if due {
            debug!("Periodic save");
            let _ = self.request_save(SaveTrigger::Periodic);
        }
    }
}

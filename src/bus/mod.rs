//! Change event bus connecting editing surfaces, history and auto-save.
//!
//! Events are queued on [`ChangeBus::emit`] and delivered in fixed-size
//! batches after a short delay, coalescing bursts from rapid typing or drag
//! operations. Batching never reorders or drops events. Field writes are
//! also fed to a [`ConflictDetector`]; a conflict is queued right behind the
//! write that caused it.
//!
//! A failing listener (an `Err` return or a panic) is logged and reported as
//! an [`EventKind::Error`] event; delivery to the remaining listeners goes on.

pub mod conflict;

pub use conflict::{ConflictDetector, FieldConflict, FieldWrite};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

use crate::document::{ChangeEvent, EditSource, ElementDescriptor};

/// Error returned by a listener that failed to handle an event
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type ListenerResult = Result<(), ListenerError>;

/// Listener callback
pub type Listener = Arc<dyn Fn(&BusEvent) -> ListenerResult + Send + Sync>;

/// Configuration for batching and conflict detection
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Maximum events delivered per flush
    pub batch_size: usize,
    /// Delay before each batch is flushed
    pub flush_delay: Duration,
    /// Two sources writing one field within this window is a conflict
    pub conflict_window: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            flush_delay: Duration::from_millis(16), // one frame
            conflict_window: Duration::from_secs(1),
        }
    }
}

impl BusConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }

    pub fn with_conflict_window(mut self, window: Duration) -> Self {
        self.conflict_window = window;
        self
    }
}

/// Event types listeners subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Change,
    Conflict,
    Selection,
    History,
    Error,
}

/// Event body
#[derive(Debug, Clone)]
pub enum BusPayload {
    Change(ChangeEvent),
    Conflict(FieldConflict),
    Selection(Option<ElementDescriptor>),
    History { can_undo: bool, can_redo: bool },
    Error { message: String, failed: EventKind },
}

impl BusPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            BusPayload::Change(_) => EventKind::Change,
            BusPayload::Conflict(_) => EventKind::Conflict,
            BusPayload::Selection(_) => EventKind::Selection,
            BusPayload::History { .. } => EventKind::History,
            BusPayload::Error { .. } => EventKind::Error,
        }
    }
}

/// An event travelling through the bus
#[derive(Debug, Clone)]
pub struct BusEvent {
    /// Emission sequence number (strictly increasing)
    pub seq: u64,
    pub payload: BusPayload,
    pub source: EditSource,
    /// Restricts surface-scoped listeners to one surface
    pub target: Option<EditSource>,
    pub emitted_at: DateTime<Utc>,
}

impl BusEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

struct Registration {
    id: u64,
    surface: Option<EditSource>,
    listener: Listener,
}

impl Registration {
    fn accepts(&self, event: &BusEvent) -> bool {
        match self.surface {
            None => true,
            Some(surface) => {
                event.source != surface && event.target.map_or(true, |t| t == surface)
            }
        }
    }
}

/// Handle returned by [`ChangeBus::on`]
pub struct Subscription {
    bus: Weak<ChangeBus>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    /// Stop receiving events. Returns whether the listener was still registered.
    pub fn unsubscribe(&self) -> bool {
        match self.bus.upgrade() {
            Some(bus) => bus.remove_listener(self.kind, self.id),
            None => false,
        }
    }
}

/// Batching publish/subscribe channel
pub struct ChangeBus {
    config: BusConfig,
    queue: Mutex<VecDeque<BusEvent>>,
    listeners: RwLock<HashMap<EventKind, Vec<Registration>>>,
    detector: Mutex<ConflictDetector>,
    /// Serializes delivery so batches never interleave
    delivery: ReentrantMutex<()>,
    flush_scheduled: AtomicBool,
    next_seq: AtomicU64,
    next_listener_id: AtomicU64,
}

impl ChangeBus {
    pub fn new(config: BusConfig) -> Arc<Self> {
        Arc::new(Self {
            detector: Mutex::new(ConflictDetector::new(config.conflict_window)),
            config,
            queue: Mutex::new(VecDeque::new()),
            listeners: RwLock::new(HashMap::new()),
            delivery: ReentrantMutex::new(()),
            flush_scheduled: AtomicBool::new(false),
            next_seq: AtomicU64::new(1),
            next_listener_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Subscribe to one event type
    pub fn on<F>(self: &Arc<Self>, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&BusEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.register(kind, None, Arc::new(listener))
    }

    /// Subscribe on behalf of an editing surface: events the surface emitted
    /// itself are skipped, and targeted events only reach their target.
    pub fn on_surface<F>(
        self: &Arc<Self>,
        kind: EventKind,
        surface: EditSource,
        listener: F,
    ) -> Subscription
    where
        F: Fn(&BusEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.register(kind, Some(surface), Arc::new(listener))
    }

    fn register(
        self: &Arc<Self>,
        kind: EventKind,
        surface: Option<EditSource>,
        listener: Listener,
    ) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push(Registration {
                id,
                surface,
                listener,
            });
        Subscription {
            bus: Arc::downgrade(self),
            kind,
            id,
        }
    }

    fn remove_listener(&self, kind: EventKind, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        match listeners.get_mut(&kind) {
            Some(regs) => {
                let before = regs.len();
                regs.retain(|r| r.id != id);
                regs.len() != before
            }
            None => false,
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    /// Queue an event for delivery, returning its sequence number.
    ///
    /// Inside a tokio runtime a delayed flush is scheduled automatically;
    /// otherwise the caller drives delivery with [`ChangeBus::flush_now`].
    pub fn emit(
        self: &Arc<Self>,
        payload: BusPayload,
        source: EditSource,
        target: Option<EditSource>,
    ) -> u64 {
        let conflict = match &payload {
            BusPayload::Change(change)
                if !change.is_metadata() && !change.is_replay() && !change.is_resolution() =>
            {
                self.detector
                    .lock()
                    .observe(change, tokio::time::Instant::now())
            }
            _ => None,
        };

        let seq = self.enqueue(payload, source, target);
        if let Some(conflict) = conflict {
            debug!(
                field = %conflict.field,
                first = %conflict.first.source,
                second = %conflict.second.source,
                "Write conflict detected"
            );
            self.enqueue(BusPayload::Conflict(conflict), source, None);
        }

        self.schedule_flush();
        seq
    }

    fn enqueue(&self, payload: BusPayload, source: EditSource, target: Option<EditSource>) -> u64 {
        let mut queue = self.queue.lock();
        // Sequence numbers are taken under the queue lock so they match queue order
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        queue.push_back(BusEvent {
            seq,
            payload,
            source,
            target,
            emitted_at: Utc::now(),
        });
        seq
    }

    fn schedule_flush(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let bus = Arc::downgrade(self);
        let delay = self.config.flush_delay;
        handle.spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                let Some(bus) = bus.upgrade() else {
                    return;
                };
                if bus.deliver_batch() {
                    continue;
                }
                bus.flush_scheduled.store(false, Ordering::Release);
                // An emit may have raced the flag reset
                if bus.pending() == 0 || bus.flush_scheduled.swap(true, Ordering::AcqRel) {
                    return;
                }
            }
        });
    }

    /// Number of queued, undelivered events
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Deliver every queued event now, batch by batch. Returns the number of
    /// events delivered.
    pub fn flush_now(&self) -> usize {
        let _guard = self.delivery.lock();
        let mut delivered = 0;
        loop {
            let batch = self.take_batch();
            if batch.is_empty() {
                return delivered;
            }
            delivered += batch.len();
            self.deliver(batch);
        }
    }

    /// Deliver one batch; returns whether more events remain queued.
    fn deliver_batch(&self) -> bool {
        let _guard = self.delivery.lock();
        let batch = self.take_batch();
        self.deliver(batch);
        self.pending() > 0
    }

    fn take_batch(&self) -> Vec<BusEvent> {
        let mut queue = self.queue.lock();
        let n = self.config.batch_size.max(1).min(queue.len());
        queue.drain(..n).collect()
    }

    fn deliver(&self, batch: Vec<BusEvent>) {
        if batch.is_empty() {
            return;
        }
        debug!(events = batch.len(), "Flushing bus batch");

        for event in &batch {
            let kind = event.kind();
            let targets: Vec<Listener> = self
                .listeners
                .read()
                .get(&kind)
                .map(|regs| {
                    regs.iter()
                        .filter(|r| r.accepts(event))
                        .map(|r| r.listener.clone())
                        .collect()
                })
                .unwrap_or_default();

            for listener in targets {
                let outcome = catch_unwind(AssertUnwindSafe(|| listener(event)));
                let failure = match outcome {
                    Ok(Ok(())) => continue,
                    Ok(Err(err)) => err.0,
                    Err(panic) => panic_message(panic.as_ref()),
                };

                error!(kind = ?kind, seq = event.seq, "Bus listener failed: {}", failure);
                if kind != EventKind::Error {
                    self.enqueue(
                        BusPayload::Error {
                            message: failure,
                            failed: kind,
                        },
                        event.source,
                        None,
                    );
                }
            }
        }

        self.detector
            .lock()
            .prune(tokio::time::Instant::now());
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_string()
    }
}

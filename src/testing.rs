//! Test doubles shared by unit tests across modules.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::document::Document;
use crate::identity::RecordId;
use crate::persistence::{
    AccessCheck, MemoryBackend, PersistenceBackend, PersistenceError, PersistenceResult,
    SaveOutcome, SaveRequest,
};

/// Backend wrapping a [`MemoryBackend`] that fails on demand and records
/// every save request it receives
#[derive(Default)]
pub struct ScriptedBackend {
    inner: MemoryBackend,
    failures: Mutex<VecDeque<PersistenceError>>,
    always: Mutex<Option<PersistenceError>>,
    delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<SaveRequest>>,
    save_calls: AtomicUsize,
    grant_access: AtomicBool,
    fail_access: AtomicBool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Fail the next save with `err`; queued failures are used in order
    pub fn fail_next(&self, err: PersistenceError) {
        self.failures.lock().push_back(err);
    }

    pub fn fail_always(&self, err: PersistenceError) {
        *self.always.lock() = Some(err);
    }

    pub fn recover(&self) {
        *self.always.lock() = None;
        self.failures.lock().clear();
    }

    /// Every save takes this long
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Report every record as existing and writable
    pub fn grant_all_access(&self) {
        self.grant_access.store(true, Ordering::SeqCst);
    }

    pub fn fail_access_checks(&self) {
        self.fail_access.store(true, Ordering::SeqCst);
    }

    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<SaveRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl PersistenceBackend for ScriptedBackend {
    async fn save(&self, request: SaveRequest) -> PersistenceResult<SaveOutcome> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.failures.lock().pop_front();
        if let Some(err) = scripted.or_else(|| self.always.lock().clone()) {
            return Err(err);
        }
        self.inner.save(request).await
    }

    async fn read(&self, id: &RecordId) -> PersistenceResult<Option<Document>> {
        self.inner.read(id).await
    }

    async fn check_access(&self, id: &RecordId, actor: &str) -> PersistenceResult<AccessCheck> {
        if self.fail_access.load(Ordering::SeqCst) {
            return Err(PersistenceError::Transient("access check unavailable".into()));
        }
        if self.grant_access.load(Ordering::SeqCst) {
            return Ok(AccessCheck::allowed());
        }
        self.inner.check_access(id, actor).await
    }
}

//! Sliding-window detection of concurrent writes to the same field.
//!
//! For each field the detector remembers the most recent write per source.
//! A write from a second, different source inside the window yields a
//! [`FieldConflict`]; tracking for that field then starts over, so one pair
//! of writes produces exactly one conflict. Writes older than the window are
//! forgotten.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::document::{ChangeEvent, EditSource};

/// One observed write to a field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldWrite {
    pub event_id: Uuid,
    pub source: EditSource,
    pub value: Option<Value>,
    pub written_at: DateTime<Utc>,
    observed: Instant,
}

impl FieldWrite {
    fn from_event(event: &ChangeEvent, observed: Instant) -> Self {
        Self {
            event_id: event.id,
            source: event.source,
            value: event.value.clone(),
            written_at: event.timestamp,
            observed,
        }
    }
}

/// Two different sources wrote the same field within the detection window
#[derive(Debug, Clone, PartialEq)]
pub struct FieldConflict {
    pub field: String,
    /// The earlier write
    pub first: FieldWrite,
    /// The later write (the value currently in the document)
    pub second: FieldWrite,
    pub detected_at: DateTime<Utc>,
}

impl FieldConflict {
    /// The write made inside this session: a non-external source, the later
    /// one when both qualify.
    pub fn local_write(&self) -> &FieldWrite {
        if self.second.source != EditSource::External {
            &self.second
        } else {
            &self.first
        }
    }

    /// The write coming from outside this session; when neither source is
    /// external, the earlier write plays that role.
    pub fn external_write(&self) -> &FieldWrite {
        if self.second.source == EditSource::External {
            &self.second
        } else {
            &self.first
        }
    }

    pub fn sources(&self) -> (EditSource, EditSource) {
        (self.first.source, self.second.source)
    }
}

/// Per-field, per-source tracker of recent writes
#[derive(Debug)]
pub struct ConflictDetector {
    window: Duration,
    recent: HashMap<String, HashMap<EditSource, FieldWrite>>,
}

impl ConflictDetector {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            recent: HashMap::new(),
        }
    }

    /// Record a write; returns a conflict if another source wrote the same
    /// field within the window.
    pub fn observe(&mut self, event: &ChangeEvent, now: Instant) -> Option<FieldConflict> {
        let window = self.window;
        let writes = self.recent.entry(event.field.clone()).or_default();
        writes.retain(|_, w| now.saturating_duration_since(w.observed) <= window);

        let rival = writes
            .values()
            .filter(|w| w.source != event.source)
            .max_by_key(|w| w.observed)
            .cloned();

        let write = FieldWrite::from_event(event, now);
        match rival {
            Some(first) => {
                self.recent.remove(&event.field);
                Some(FieldConflict {
                    field: event.field.clone(),
                    first,
                    second: write,
                    detected_at: Utc::now(),
                })
            }
            None => {
                writes.insert(event.source, write);
                None
            }
        }
    }

    /// Forget every write older than the window
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.recent.retain(|_, writes| {
            writes.retain(|_, w| now.saturating_duration_since(w.observed) <= window);
            !writes.is_empty()
        });
    }

    /// Number of fields with at least one tracked write
    pub fn tracked_fields(&self) -> usize {
        self.recent.len()
    }
}

//! Undo/redo history for the document store.
//!
//! Entries form a linear, truncating stack:
//! - Each entry groups the change events of one logical user action
//! - Each entry keeps full before/after snapshots so undo and redo jump
//!   directly to either state
//! - Recording a new entry discards everything after the cursor
//! - The stack is capped; the oldest entry is dropped first

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use uuid::Uuid;

use super::{ChangeCategory, ChangeEvent, Document};

/// Configuration for history bounding
#[derive(Debug, Clone)]
pub struct HistoryConfig {
    /// Maximum number of retained entries (0 = unlimited)
    pub max_entries: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { max_entries: 50 }
    }
}

impl HistoryConfig {
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }
}

/// One undoable unit, possibly spanning several change events
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub changes: Vec<ChangeEvent>,
    pub before: Arc<Document>,
    pub after: Arc<Document>,
    /// Human-readable label (presentation only)
    pub description: String,
}

/// Linear undo/redo stack with a cursor
#[derive(Debug)]
pub struct HistoryManager {
    entries: VecDeque<HistoryEntry>,
    /// Number of entries currently applied; `0` means at the start
    cursor: usize,
    max_entries: usize,
}

impl HistoryManager {
    pub fn new(config: &HistoryConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            cursor: 0,
            max_entries: config.max_entries,
        }
    }

    /// Record a new entry, truncating any redo branch
    pub fn record(
        &mut self,
        changes: Vec<ChangeEvent>,
        before: Arc<Document>,
        after: Arc<Document>,
        description: Option<String>,
    ) -> &HistoryEntry {
        self.entries.truncate(self.cursor);

        let description = description.unwrap_or_else(|| describe(&changes));
        self.entries.push_back(HistoryEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            changes,
            before,
            after,
            description,
        });

        if self.max_entries > 0 && self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
        self.cursor = self.entries.len();

        &self.entries[self.cursor - 1]
    }

    /// Move the cursor back one step, returning the entry to revert
    pub fn step_back(&mut self) -> Option<&HistoryEntry> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        self.entries.get(self.cursor)
    }

    /// Move the cursor forward one step, returning the entry to reapply
    pub fn step_forward(&mut self) -> Option<&HistoryEntry> {
        if self.cursor >= self.entries.len() {
            return None;
        }
        self.cursor += 1;
        self.entries.get(self.cursor - 1)
    }

    pub fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub fn can_redo(&self) -> bool {
        self.cursor < self.entries.len()
    }

    /// Label of the entry `undo` would revert
    pub fn undo_description(&self) -> Option<&str> {
        self.cursor
            .checked_sub(1)
            .and_then(|i| self.entries.get(i))
            .map(|e| e.description.as_str())
    }

    /// Label of the entry `redo` would reapply
    pub fn redo_description(&self) -> Option<&str> {
        self.entries.get(self.cursor).map(|e| e.description.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }
}

/// Derive a label from the dominant change category
pub fn describe(changes: &[ChangeEvent]) -> String {
    match changes {
        [] => "No changes".to_string(),
        [change] => {
            let section = change.section.as_deref().unwrap_or(&change.field);
            match change.category {
                ChangeCategory::Text => format!("Edit {} content", section),
                ChangeCategory::Color => format!("Change {} color", section),
                ChangeCategory::Image => format!("Replace {} image", section),
                ChangeCategory::Style => format!("Update {} style", section),
                ChangeCategory::Structure => format!("Rearrange {}", section),
                ChangeCategory::Bulk => format!("Update {}", section),
            }
        }
        [first, rest @ ..] => {
            let n = changes.len();
            if rest.iter().all(|c| c.category == first.category) {
                let label = match first.category {
                    ChangeCategory::Text => "Edit text",
                    ChangeCategory::Color => "Change colors",
                    ChangeCategory::Image => "Replace images",
                    ChangeCategory::Style => "Update styles",
                    ChangeCategory::Structure => "Rearrange sections",
                    ChangeCategory::Bulk => "Bulk update",
                };
                format!("{} ({} items)", label, n)
            } else {
                format!("Multiple changes ({} items)", n)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{EditSource, UpdateMeta};
    use serde_json::json;

    fn change(field: &str, value: serde_json::Value) -> ChangeEvent {
        ChangeEvent::new(field, None, Some(value), EditSource::Quick, &UpdateMeta::default())
    }

    fn snapshot(n: i64) -> Arc<Document> {
        Arc::new(Document::from_value(json!({ "n": n })).unwrap())
    }

    #[test]
    fn test_record_and_step() {
        let mut history = HistoryManager::new(&HistoryConfig::default());
        history.record(vec![change("n", json!(1))], snapshot(0), snapshot(1), None);
        history.record(vec![change("n", json!(2))], snapshot(1), snapshot(2), None);

        assert!(history.can_undo());
        assert!(!history.can_redo());

        let entry = history.step_back().unwrap();
        assert_eq!(entry.before, snapshot(1));
        assert!(history.can_redo());

        let entry = history.step_forward().unwrap();
        assert_eq!(entry.after, snapshot(2));
        assert!(history.step_forward().is_none());
    }

    #[test]
    fn test_record_truncates_redo_branch() {
        let mut history = HistoryManager::new(&HistoryConfig::default());
        for i in 1..=3 {
            history.record(vec![change("n", json!(i))], snapshot(i - 1), snapshot(i), None);
        }
        history.step_back();
        history.step_back();
        history.record(vec![change("n", json!(9))], snapshot(1), snapshot(9), None);

        assert_eq!(history.len(), 2);
        assert!(!history.can_redo());
    }

    #[test]
    fn test_cap_drops_oldest() {
        let mut history = HistoryManager::new(&HistoryConfig::default().with_max_entries(3));
        for i in 1..=5 {
            history.record(vec![change("n", json!(i))], snapshot(i - 1), snapshot(i), None);
        }

        assert_eq!(history.len(), 3);
        assert_eq!(history.cursor(), 3);

        let mut undone = 0;
        while history.step_back().is_some() {
            undone += 1;
        }
        assert_eq!(undone, 3);
        assert_eq!(history.entries().next().unwrap().before, snapshot(2));
    }

    #[test]
    fn test_describe() {
        let text = change("heroTitle", json!("Hi"));
        assert_eq!(describe(&[text.clone()]), "Edit heroTitle content");

        let mut color = change("primaryColor", json!("#000000"));
        color.section = Some("hero".to_string());
        assert_eq!(describe(&[color.clone()]), "Change hero color");

        assert_eq!(
            describe(&[color.clone(), color.clone()]),
            "Change colors (2 items)"
        );
        assert_eq!(
            describe(&[text, color, change("logoImage", json!("a.png"))]),
            "Multiple changes (3 items)"
        );
    }

    #[test]
    fn test_descriptions_follow_cursor() {
        let mut history = HistoryManager::new(&HistoryConfig::default());
        history.record(vec![change("n", json!(1))], snapshot(0), snapshot(1), Some("first".into()));

        assert_eq!(history.undo_description(), Some("first"));
        assert_eq!(history.redo_description(), None);

        history.step_back();
        assert_eq!(history.undo_description(), None);
        assert_eq!(history.redo_description(), Some("first"));
    }
}

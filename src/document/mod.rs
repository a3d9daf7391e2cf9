//! Page-content document model.
//!
//! A [`Document`] is a flat mapping from field name to JSON value holding one
//! page's entire editable content. This module provides:
//! - The document type and its metadata conventions
//! - Change events with provenance and inferred category
//! - The document store (single source of truth) and its undo history

pub mod history;
pub mod store;

pub use history::{HistoryConfig, HistoryEntry, HistoryManager};
pub use store::{DocumentStore, StoreListener};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during document operations
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Document must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("No batch is open")]
    NoOpenBatch,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type DocumentResult<T> = Result<T, DocumentError>;

/// Well-known field names
pub mod keys {
    /// Fields starting with this prefix are internal bookkeeping, not content
    pub const METADATA_PREFIX: &str = "_";

    pub const RECORD_ID: &str = "_recordId";
    pub const LAST_SAVED: &str = "_lastSaved";
    pub const ACCESS_URL: &str = "_accessUrl";

    pub const BUSINESS_NAME: &str = "businessName";
    pub const PRIMARY_COLOR: &str = "primaryColor";
}

/// Whether a field holds internal bookkeeping rather than page content
pub fn is_metadata_field(field: &str) -> bool {
    field.starts_with(keys::METADATA_PREFIX)
}

/// One page's editable content, keyed by field name.
///
/// Nested values (testimonial lists, story items) are opaque: they are
/// compared and replaced wholesale, never merged element-wise.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a document from a JSON object
    pub fn from_value(value: Value) -> DocumentResult<Self> {
        match value {
            Value::Object(map) => Ok(Self {
                fields: map.into_iter().collect(),
            }),
            other => Err(DocumentError::NotAnObject(json_type_name(&other))),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone().into_iter().collect())
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Content fields only (metadata excluded)
    pub fn content(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter().filter(|(k, _)| !is_metadata_field(k))
    }

    /// A copy of this document with every metadata field removed
    pub fn without_metadata(&self) -> Self {
        Self {
            fields: self
                .content()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// The persisted-record identifier bound into this document, if any
    pub fn record_id(&self) -> Option<&str> {
        self.fields.get(keys::RECORD_ID).and_then(Value::as_str)
    }

    pub fn business_name(&self) -> Option<&str> {
        self.fields
            .get(keys::BUSINESS_NAME)
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
    }

    pub(crate) fn set(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(field.into(), value)
    }

    /// Content fields whose values differ between `self` and `target`.
    ///
    /// Each entry is `(field, value in self, value in target)`; `None` marks
    /// an absent field.
    pub fn content_diff(&self, target: &Document) -> Vec<(String, Option<Value>, Option<Value>)> {
        let mut diff = Vec::new();
        for (field, value) in self.content() {
            match target.get(field) {
                Some(other) if other == value => {}
                other => diff.push((field.clone(), Some(value.clone()), other.cloned())),
            }
        }
        for (field, value) in target.content() {
            if !self.contains(field) {
                diff.push((field.clone(), None, Some(value.clone())));
            }
        }
        diff
    }

    /// Replace this document's content with `snapshot`'s content, keeping the
    /// current metadata fields.
    pub(crate) fn restore_content_from(&mut self, snapshot: &Document) {
        self.fields.retain(|k, _| is_metadata_field(k));
        for (field, value) in snapshot.content() {
            self.fields.insert(field.clone(), value.clone());
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The editing surface a mutation originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditSource {
    /// Lightweight quick-edit panel
    Quick,
    /// Full-screen professional editor
    Fullscreen,
    /// Anything outside this session: backend reloads, other tabs, bookkeeping
    External,
}

impl fmt::Display for EditSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditSource::Quick => write!(f, "quick"),
            EditSource::Fullscreen => write!(f, "fullscreen"),
            EditSource::External => write!(f, "external"),
        }
    }
}

/// Inferred kind of a field change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeCategory {
    Text,
    Color,
    Image,
    Style,
    Structure,
    Bulk,
}

impl ChangeCategory {
    /// Infer a category from the field name and its new value
    pub fn infer(field: &str, value: Option<&Value>) -> Self {
        let name = field.to_ascii_lowercase();

        if matches!(value, Some(Value::Array(_)) | Some(Value::Object(_))) {
            return ChangeCategory::Structure;
        }
        if name.contains("color") || name.contains("colour") || value.map_or(false, is_hex_color) {
            return ChangeCategory::Color;
        }
        if ["image", "logo", "photo", "gallery", "avatar", "background"]
            .iter()
            .any(|hint| name.contains(hint))
        {
            return ChangeCategory::Image;
        }
        if ["font", "style", "theme", "layout", "spacing", "radius"]
            .iter()
            .any(|hint| name.contains(hint))
        {
            return ChangeCategory::Style;
        }
        ChangeCategory::Text
    }
}

fn is_hex_color(value: &Value) -> bool {
    value.as_str().map_or(false, |s| {
        let hex = s.strip_prefix('#').unwrap_or("");
        matches!(hex.len(), 3 | 6 | 8) && hex.chars().all(|c| c.is_ascii_hexdigit())
    })
}

/// Caller-supplied context for an update
#[derive(Debug, Clone, Default)]
pub struct UpdateMeta {
    /// Page section the edit belongs to (e.g. "hero")
    pub section: Option<String>,
    /// Element within the section
    pub element: Option<String>,
    /// Overrides the inferred category
    pub category: Option<ChangeCategory>,
    /// Free-form metadata copied onto every produced event
    pub extra: Map<String, Value>,
}

impl UpdateMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn with_element(mut self, element: impl Into<String>) -> Self {
        self.element = Some(element.into());
        self
    }

    pub fn with_category(mut self, category: ChangeCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Metadata key set on events produced by undo/redo
pub const REPLAY_FLAG: &str = "historyReplay";

/// Metadata key set on writes that settle a conflict
pub const RESOLUTION_FLAG: &str = "conflictResolution";

/// Immutable record of one field's value transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: EditSource,
    pub category: ChangeCategory,
    pub section: Option<String>,
    pub element: Option<String>,
    pub field: String,
    /// Value before the change (`None` if the field was absent)
    pub previous: Option<Value>,
    /// Value after the change (`None` if the field was removed)
    pub value: Option<Value>,
    pub metadata: Map<String, Value>,
}

impl ChangeEvent {
    pub(crate) fn new(
        field: impl Into<String>,
        previous: Option<Value>,
        value: Option<Value>,
        source: EditSource,
        meta: &UpdateMeta,
    ) -> Self {
        let field = field.into();
        let category = meta
            .category
            .unwrap_or_else(|| ChangeCategory::infer(&field, value.as_ref()));
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source,
            category,
            section: meta.section.clone(),
            element: meta.element.clone(),
            field,
            previous,
            value,
            metadata: meta.extra.clone(),
        }
    }

    pub fn is_metadata(&self) -> bool {
        is_metadata_field(&self.field)
    }

    /// Produced by undo/redo rather than a fresh user edit
    pub fn is_replay(&self) -> bool {
        self.metadata
            .get(REPLAY_FLAG)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Written by the auto-save controller to settle a conflict
    pub fn is_resolution(&self) -> bool {
        self.metadata.contains_key(RESOLUTION_FLAG)
    }
}

/// Currently selected element (UI context, never undoable)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDescriptor {
    pub section: String,
    pub element: Option<String>,
    pub kind: Option<String>,
}

impl ElementDescriptor {
    pub fn new(section: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            element: None,
            kind: None,
        }
    }

    pub fn with_element(mut self, element: impl Into<String>) -> Self {
        self.element = Some(element.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
}

//! Explicit mutation metadata for the delta codec.
//!
//! The delta encoder never diffs two documents. Callers describe what
//! happened: which fields were created, replaced, removed, or mutated in
//! place, and for in-place container mutations, the ordered event log plus
//! any recursive changes to still-present elements.

use indexmap::IndexMap;

use crate::value::Value;

/// What happened to one field of a document.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldChange {
    /// The field did not exist before.
    Created,
    /// The field existed and its value was swapped wholesale.
    Replaced,
    /// The field was removed.
    Removed,
    /// The field's container or embedded document was mutated in place.
    Changed(ChangedPayload),
}

/// The incremental payload of an in-place mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangedPayload {
    /// An embedded document changed; recurse.
    Document(DocumentChanges),
    /// A list, set, or map (embedded or link flavored) changed.
    Container(ContainerChanges),
    /// A link bag changed; its event log lives on the bag value itself.
    Bag,
}

/// All field changes of one document, in a stable order.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct DocumentChanges {
    pub fields: IndexMap<String, FieldChange>,
}

impl DocumentChanges {
    pub fn new() -> Self {
        DocumentChanges::default()
    }

    pub fn created(mut self, name: &str) -> Self {
        self.fields.insert(name.to_owned(), FieldChange::Created);
        self
    }

    pub fn replaced(mut self, name: &str) -> Self {
        self.fields.insert(name.to_owned(), FieldChange::Replaced);
        self
    }

    pub fn removed(mut self, name: &str) -> Self {
        self.fields.insert(name.to_owned(), FieldChange::Removed);
        self
    }

    pub fn changed(mut self, name: &str, payload: ChangedPayload) -> Self {
        self.fields
            .insert(name.to_owned(), FieldChange::Changed(payload));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Ordered event log plus recursive element changes for one container.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ContainerChanges {
    pub events: Vec<ChangeEvent>,
    /// Changes inside elements that are still present, keyed by the
    /// element's current position (lists, sets) or key (maps).
    pub nested: Vec<(NestedKey, ChangedPayload)>,
}

impl ContainerChanges {
    pub fn new() -> Self {
        ContainerChanges::default()
    }

    pub fn event(mut self, event: ChangeEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn nested(mut self, key: NestedKey, payload: ChangedPayload) -> Self {
        self.nested.push((key, payload));
        self
    }
}

/// Addresses a nested element inside a container.
#[derive(Clone, Debug, PartialEq)]
pub enum NestedKey {
    Index(usize),
    Name(String),
}

/// One structural mutation of a container.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent {
    /// An element was appended (lists, sets) or inserted under a key
    /// (maps). The value is read from the container itself at encode time
    /// for keyed containers; positional containers carry it here.
    Added {
        key: Option<NestedKey>,
        value: Option<Value>,
    },
    /// An element at a position or key was overwritten.
    Updated {
        key: NestedKey,
        value: Option<Value>,
    },
    /// An element was removed. Positional containers address it by index,
    /// sets by the removed value, maps by key.
    Removed {
        key: Option<NestedKey>,
        value: Option<Value>,
    },
}

impl ChangeEvent {
    pub fn added(value: Option<Value>) -> Self {
        ChangeEvent::Added { key: None, value }
    }

    pub fn added_at(key: NestedKey, value: Option<Value>) -> Self {
        ChangeEvent::Added {
            key: Some(key),
            value,
        }
    }

    pub fn updated(key: NestedKey, value: Option<Value>) -> Self {
        ChangeEvent::Updated { key, value }
    }

    pub fn removed_at(key: NestedKey) -> Self {
        ChangeEvent::Removed {
            key: Some(key),
            value: None,
        }
    }

    pub fn removed_value(value: Option<Value>) -> Self {
        ChangeEvent::Removed { key: None, value }
    }
}

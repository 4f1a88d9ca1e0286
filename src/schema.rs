//! Immutable schema snapshots.
//!
//! The codec consults a snapshot for two things: global properties, which
//! let headers replace a field name with a compact negated id, and linked
//! element types, which pin the element type of an embedded collection for
//! a given class and field.

use std::collections::HashMap;

use crate::typetag::TypeTag;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalProperty {
    pub id: u32,
    pub name: String,
    pub tag: TypeTag,
}

#[derive(Clone, Debug, Default)]
pub struct SchemaSnapshot {
    properties: Vec<GlobalProperty>,
    by_id: HashMap<u32, usize>,
    by_name: HashMap<String, usize>,
    linked: HashMap<(String, String), TypeTag>,
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        SchemaSnapshot::default()
    }

    /// Registers a global property. A re-registration under the same id or
    /// name shadows the earlier one.
    pub fn define(&mut self, id: u32, name: &str, tag: TypeTag) {
        let at = self.properties.len();
        self.properties.push(GlobalProperty {
            id,
            name: name.to_owned(),
            tag,
        });
        self.by_id.insert(id, at);
        self.by_name.insert(name.to_owned(), at);
    }

    /// Pins the element type of an embedded collection field.
    pub fn define_linked_type(&mut self, class: &str, field: &str, tag: TypeTag) {
        self.linked
            .insert((class.to_owned(), field.to_owned()), tag);
    }

    pub fn property_by_id(&self, id: u32) -> Option<&GlobalProperty> {
        self.by_id.get(&id).map(|&at| &self.properties[at])
    }

    pub fn property_by_name(&self, name: &str) -> Option<&GlobalProperty> {
        self.by_name.get(name).map(|&at| &self.properties[at])
    }

    /// Linked element type for an embedded collection field, if declared.
    /// Only the embedded collection kinds may carry one.
    pub fn linked_type(
        &self,
        class: Option<&str>,
        container: TypeTag,
        field: &str,
    ) -> Option<TypeTag> {
        if !container.is_embedded_collection() {
            return None;
        }
        let class = class?;
        self.linked
            .get(&(class.to_owned(), field.to_owned()))
            .copied()
    }
}

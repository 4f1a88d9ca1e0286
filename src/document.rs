//! In-memory documents.
//!
//! A document is an optional class name plus an insertion-ordered map of
//! nullable fields. Field order is significant: headers are written in
//! insertion order and round-trip byte-for-byte. A field slot may also pin
//! a declared type, which overrides runtime inference during encoding
//! (a `Short` stays a `Short` even though the value widens in memory).

use indexmap::IndexMap;

use crate::typetag::TypeTag;
use crate::value::Value;

#[derive(Clone, Debug, PartialEq, Default)]
pub struct FieldSlot {
    pub value: Option<Value>,
    pub declared: Option<TypeTag>,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct Document {
    class_name: Option<String>,
    fields: IndexMap<String, FieldSlot>,
}

impl Document {
    pub fn new() -> Self {
        Document::default()
    }

    pub fn with_class(class_name: &str) -> Self {
        Document {
            class_name: Some(class_name.to_owned()),
            fields: IndexMap::new(),
        }
    }

    pub fn class_name(&self) -> Option<&str> {
        self.class_name.as_deref()
    }

    pub fn set_class_name(&mut self, class_name: Option<String>) {
        self.class_name = class_name;
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.set_slot(name, Some(value.into()), None);
    }

    pub fn set_null(&mut self, name: &str) {
        self.set_slot(name, None, None);
    }

    /// Sets a field with a pinned declared type.
    pub fn set_typed(&mut self, name: &str, value: Option<Value>, declared: TypeTag) {
        self.set_slot(name, value, Some(declared));
    }

    pub fn set_slot(&mut self, name: &str, value: Option<Value>, declared: Option<TypeTag>) {
        self.fields
            .insert(name.to_owned(), FieldSlot { value, declared });
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldSlot> {
        self.fields.shift_remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// The field's value; `None` for both a null field and a missing one.
    /// Use [`contains`](Document::contains) to tell the two apart.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields
            .get_mut(name)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn slot(&self, name: &str) -> Option<&FieldSlot> {
        self.fields.get(name)
    }

    pub fn declared_tag(&self, name: &str) -> Option<TypeTag> {
        self.fields.get(name).and_then(|slot| slot.declared)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldSlot)> {
        self.fields.iter().map(|(name, slot)| (name.as_str(), slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rid::Rid;

    #[test]
    fn fields_keep_insertion_order() {
        let mut doc = Document::with_class("Person");
        doc.set("name", "Jon");
        doc.set("age", 20);
        doc.set("friend", Rid::new(9, 4));
        let names: Vec<&str> = doc.field_names().collect();
        assert_eq!(names, vec!["name", "age", "friend"]);
    }

    #[test]
    fn null_differs_from_missing() {
        let mut doc = Document::new();
        doc.set_null("gone");
        assert!(doc.contains("gone"));
        assert_eq!(doc.get("gone"), None);
        assert!(!doc.contains("never"));
    }

    #[test]
    fn declared_tag_survives_overwrite_of_value() {
        let mut doc = Document::new();
        doc.set_typed("count", Some(Value::Short(5)), TypeTag::Short);
        assert_eq!(doc.declared_tag("count"), Some(TypeTag::Short));
        doc.set("count", 6);
        assert_eq!(doc.declared_tag("count"), None);
    }

    #[test]
    fn remove_reports_previous_slot() {
        let mut doc = Document::new();
        doc.set("x", 1);
        let slot = doc.remove("x").unwrap();
        assert_eq!(slot.value, Some(Value::Integer(1)));
        assert!(doc.is_empty());
    }
}

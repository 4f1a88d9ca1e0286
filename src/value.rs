//! Runtime values.
//!
//! `Value` covers every semantic kind the wire format can carry. Container
//! elements are `Option`al so nulls inside collections survive a round
//! trip; a null field slot is modeled at the document level instead.

use chrono::{DateTime, NaiveDate, Utc};
use indexmap::IndexMap;
use rust_decimal::Decimal;

use crate::bag::RidBag;
use crate::document::Document;
use crate::rid::Rid;
use crate::typetag::TypeTag;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Integer(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Decimal(Decimal),
    String(String),
    Binary(Vec<u8>),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Embedded(Document),
    EmbeddedList(Vec<Option<Value>>),
    EmbeddedSet(Vec<Option<Value>>),
    EmbeddedMap(IndexMap<String, Option<Value>>),
    Link(Rid),
    LinkList(Vec<Option<Rid>>),
    LinkSet(Vec<Option<Rid>>),
    LinkMap(IndexMap<String, Option<Rid>>),
    LinkBag(RidBag),
    /// Application-defined payload: a marker class name plus opaque bytes.
    Custom { class: String, data: Vec<u8> },
}

impl Value {
    /// The semantic type inferred from the runtime representation.
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Boolean(_) => TypeTag::Boolean,
            Value::Byte(_) => TypeTag::Byte,
            Value::Short(_) => TypeTag::Short,
            Value::Integer(_) => TypeTag::Integer,
            Value::Long(_) => TypeTag::Long,
            Value::Float(_) => TypeTag::Float,
            Value::Double(_) => TypeTag::Double,
            Value::Decimal(_) => TypeTag::Decimal,
            Value::String(_) => TypeTag::String,
            Value::Binary(_) => TypeTag::Binary,
            Value::Date(_) => TypeTag::Date,
            Value::DateTime(_) => TypeTag::DateTime,
            Value::Embedded(_) => TypeTag::Embedded,
            Value::EmbeddedList(_) => TypeTag::EmbeddedList,
            Value::EmbeddedSet(_) => TypeTag::EmbeddedSet,
            Value::EmbeddedMap(_) => TypeTag::EmbeddedMap,
            Value::Link(_) => TypeTag::Link,
            Value::LinkList(_) => TypeTag::LinkList,
            Value::LinkSet(_) => TypeTag::LinkSet,
            Value::LinkMap(_) => TypeTag::LinkMap,
            Value::LinkBag(_) => TypeTag::LinkBag,
            Value::Custom { .. } => TypeTag::Custom,
        }
    }

    /// Short kind name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Boolean(_) => "boolean",
            Value::Byte(_) => "byte",
            Value::Short(_) => "short",
            Value::Integer(_) => "integer",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Decimal(_) => "decimal",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::Embedded(_) => "embedded",
            Value::EmbeddedList(_) => "embedded-list",
            Value::EmbeddedSet(_) => "embedded-set",
            Value::EmbeddedMap(_) => "embedded-map",
            Value::Link(_) => "link",
            Value::LinkList(_) => "link-list",
            Value::LinkSet(_) => "link-set",
            Value::LinkMap(_) => "link-map",
            Value::LinkBag(_) => "link-bag",
            Value::Custom { .. } => "custom",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Widens any integral variant to `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Byte(v) => Some(i64::from(*v)),
            Value::Short(v) => Some(i64::from(*v)),
            Value::Integer(v) => Some(i64::from(*v)),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<Rid> {
        match self {
            Value::Link(rid) => Some(*rid),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Embedded(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_document_mut(&mut self) -> Option<&mut Document> {
        match self {
            Value::Embedded(doc) => Some(doc),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<Rid> for Value {
    fn from(v: Rid) -> Self {
        Value::Link(v)
    }
}

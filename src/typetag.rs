//! The closed set of semantic value types.
//!
//! Tag ids are part of the wire format and never change. `0xFF` is the
//! nullable-tag sentinel used by the delta and flat encodings for null
//! slots.

use std::fmt;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::error::{Error, Result};

/// Byte standing for "no tag" wherever a nullable tag is written.
pub const NULLABLE_TAG_SENTINEL: u8 = 0xFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    Boolean = 0,
    Integer = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    DateTime = 6,
    String = 7,
    Binary = 8,
    Embedded = 9,
    EmbeddedList = 10,
    EmbeddedSet = 11,
    EmbeddedMap = 12,
    Link = 13,
    LinkList = 14,
    LinkSet = 15,
    LinkMap = 16,
    Byte = 17,
    Transient = 18,
    Date = 19,
    Custom = 20,
    Decimal = 21,
    LinkBag = 22,
    Any = 23,
}

impl TypeTag {
    pub fn from_u8(byte: u8) -> Option<TypeTag> {
        use TypeTag::*;
        Some(match byte {
            0 => Boolean,
            1 => Integer,
            2 => Short,
            3 => Long,
            4 => Float,
            5 => Double,
            6 => DateTime,
            7 => String,
            8 => Binary,
            9 => Embedded,
            10 => EmbeddedList,
            11 => EmbeddedSet,
            12 => EmbeddedMap,
            13 => Link,
            14 => LinkList,
            15 => LinkSet,
            16 => LinkMap,
            17 => Byte,
            18 => Transient,
            19 => Date,
            20 => Custom,
            21 => Decimal,
            22 => LinkBag,
            23 => Any,
            _ => return None,
        })
    }

    pub fn into_u8(self) -> u8 {
        self as u8
    }

    /// True for the container kinds that hold multiple elements.
    pub fn is_multi_value(self) -> bool {
        use TypeTag::*;
        matches!(
            self,
            EmbeddedList | EmbeddedSet | EmbeddedMap | LinkList | LinkSet | LinkMap | LinkBag
        )
    }

    /// True for the embedded collections whose element type may be pinned
    /// by a schema linked type.
    pub fn is_embedded_collection(self) -> bool {
        use TypeTag::*;
        matches!(self, EmbeddedList | EmbeddedSet | EmbeddedMap)
    }
}

impl From<TypeTag> for u8 {
    fn from(tag: TypeTag) -> u8 {
        tag.into_u8()
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub fn write_tag(buf: &mut WriteBuffer, tag: TypeTag) {
    buf.push(tag.into_u8());
}

pub fn read_tag(cur: &mut ReadBuffer) -> Result<TypeTag> {
    let offset = cur.offset();
    let byte = cur.read_u8()?;
    TypeTag::from_u8(byte).ok_or(Error::UnknownTypeTag { tag: byte, offset })
}

pub fn write_nullable_tag(buf: &mut WriteBuffer, tag: Option<TypeTag>) {
    match tag {
        Some(tag) => buf.push(tag.into_u8()),
        None => buf.push(NULLABLE_TAG_SENTINEL),
    }
}

pub fn read_nullable_tag(cur: &mut ReadBuffer) -> Result<Option<TypeTag>> {
    let offset = cur.offset();
    let byte = cur.read_u8()?;
    if byte == NULLABLE_TAG_SENTINEL {
        return Ok(None);
    }
    TypeTag::from_u8(byte)
        .map(Some)
        .ok_or(Error::UnknownTypeTag { tag: byte, offset })
}

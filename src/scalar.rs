//! Per-kind value encoding shared by both document formats.
//!
//! Integral scalars, counters, and temporal values are varints; float and
//! double are fixed-width big-endian bit patterns; strings and binary are
//! length-prefixed. Container kinds carry a per-element tag so nulls and
//! heterogeneous elements survive. Embedded documents recurse through the
//! active [`DocumentFormat`].

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use uuid::Uuid;

use crate::bag::{BagChange, BagChangeKind, BagPointer, BagRepr, RidBag, NO_SYNC_ID};
use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::decimal::{read_decimal, write_decimal};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::registry::{DecodeContext, DocumentFormat, EncodeContext};
use crate::rid::{read_link, write_link, LinkResolver, ResolvePolicy, Rid};
use crate::typetag::{
    read_nullable_tag, read_tag, write_tag, TypeTag, NULLABLE_TAG_SENTINEL,
};
use crate::value::Value;
use crate::varint::{read_len, read_varint, read_varint_i32, write_varint};

const BAG_EMBEDDED_FLAG: u8 = 0x01;

/// Tag under which a field slot is serialized: the declared type wins
/// unless it is Any; null slots fall back to Any.
pub(crate) fn field_tag(slot: &crate::document::FieldSlot) -> TypeTag {
    match (&slot.value, slot.declared) {
        (Some(v), None) | (Some(v), Some(TypeTag::Any)) => v.tag(),
        (Some(_), Some(t)) => t,
        (None, Some(t)) => t,
        (None, None) => TypeTag::Any,
    }
}

fn kind_mismatch(value: &Value) -> Error {
    Error::UnserializableValue(value.kind_name())
}

pub(crate) fn write_string(buf: &mut WriteBuffer, s: &str) {
    write_varint(buf, s.len() as i64);
    buf.write(s.as_bytes());
}

pub(crate) fn read_string(cur: &mut ReadBuffer) -> Result<String> {
    let len = read_len(cur)?;
    let offset = cur.offset();
    let bytes = cur.read_exact(len)?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| Error::BadString { offset })
}

pub(crate) fn write_date(buf: &mut WriteBuffer, date: &NaiveDate) {
    let days = date.signed_duration_since(NaiveDate::default()).num_days();
    write_varint(buf, days);
}

pub(crate) fn read_date(cur: &mut ReadBuffer) -> Result<NaiveDate> {
    let offset = cur.offset();
    let days = read_varint(cur)?;
    Duration::try_days(days)
        .and_then(|d| NaiveDate::default().checked_add_signed(d))
        .ok_or(Error::BadTemporal { offset })
}

pub(crate) fn write_datetime(buf: &mut WriteBuffer, dt: &DateTime<Utc>) {
    write_varint(buf, dt.timestamp_millis());
}

pub(crate) fn read_datetime(cur: &mut ReadBuffer) -> Result<DateTime<Utc>> {
    let offset = cur.offset();
    let millis = read_varint(cur)?;
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or(Error::BadTemporal { offset })
}

/// True for the kinds whose encoding is identical in the document formats
/// and the delta stream.
pub(crate) fn is_primitive(tag: TypeTag) -> bool {
    use TypeTag::*;
    matches!(
        tag,
        Boolean
            | Byte
            | Short
            | Integer
            | Long
            | Float
            | Double
            | Decimal
            | String
            | Binary
            | Date
            | DateTime
            | Link
            | Custom
    )
}

pub(crate) fn write_primitive(
    buf: &mut WriteBuffer,
    value: &Value,
    tag: TypeTag,
    resolver: &dyn LinkResolver,
    policy: ResolvePolicy,
) -> Result<()> {
    match tag {
        TypeTag::Boolean => match value {
            Value::Boolean(b) => buf.push(u8::from(*b)),
            _ => return Err(kind_mismatch(value)),
        },
        TypeTag::Byte => {
            let v = value.as_i64().ok_or_else(|| kind_mismatch(value))?;
            buf.push(v as u8);
        }
        TypeTag::Short | TypeTag::Integer | TypeTag::Long => {
            let v = value.as_i64().ok_or_else(|| kind_mismatch(value))?;
            write_varint(buf, v);
        }
        TypeTag::Float => match value {
            Value::Float(f) => buf.write_f32_be(*f),
            _ => return Err(kind_mismatch(value)),
        },
        TypeTag::Double => match value {
            Value::Double(f) => buf.write_f64_be(*f),
            _ => return Err(kind_mismatch(value)),
        },
        TypeTag::Decimal => match value {
            Value::Decimal(d) => write_decimal(buf, d),
            _ => return Err(kind_mismatch(value)),
        },
        TypeTag::String => {
            let s = value.as_str().ok_or_else(|| kind_mismatch(value))?;
            write_string(buf, s);
        }
        TypeTag::Binary => match value {
            Value::Binary(bytes) => {
                write_varint(buf, bytes.len() as i64);
                buf.write(bytes);
            }
            _ => return Err(kind_mismatch(value)),
        },
        TypeTag::Date => match value {
            Value::Date(d) => write_date(buf, d),
            _ => return Err(kind_mismatch(value)),
        },
        TypeTag::DateTime => match value {
            Value::DateTime(dt) => write_datetime(buf, dt),
            _ => return Err(kind_mismatch(value)),
        },
        TypeTag::Link => match value {
            Value::Link(rid) => write_link(buf, Some(*rid), resolver, policy)?,
            _ => return Err(kind_mismatch(value)),
        },
        TypeTag::Custom => match value {
            Value::Custom { class, data } => {
                write_string(buf, class);
                write_varint(buf, data.len() as i64);
                buf.write(data);
            }
            _ => return Err(kind_mismatch(value)),
        },
        _ => return Err(kind_mismatch(value)),
    }
    Ok(())
}

pub(crate) fn read_primitive(
    cur: &mut ReadBuffer,
    tag: TypeTag,
    resolver: &dyn LinkResolver,
) -> Result<Value> {
    Ok(match tag {
        TypeTag::Boolean => Value::Boolean(cur.read_u8()? != 0),
        TypeTag::Byte => Value::Byte(cur.read_u8()? as i8),
        TypeTag::Short => Value::Short(read_varint(cur)? as i16),
        TypeTag::Integer => Value::Integer(read_varint(cur)? as i32),
        TypeTag::Long => Value::Long(read_varint(cur)?),
        TypeTag::Float => Value::Float(cur.read_f32_be()?),
        TypeTag::Double => Value::Double(cur.read_f64_be()?),
        TypeTag::Decimal => Value::Decimal(read_decimal(cur)?),
        TypeTag::String => Value::String(read_string(cur)?),
        TypeTag::Binary => {
            let len = read_len(cur)?;
            Value::Binary(cur.read_exact(len)?.to_vec())
        }
        TypeTag::Date => Value::Date(read_date(cur)?),
        TypeTag::DateTime => Value::DateTime(read_datetime(cur)?),
        TypeTag::Link => Value::Link(read_link(cur, resolver)?.unwrap_or(Rid::NULL)),
        TypeTag::Custom => {
            let class = read_string(cur)?;
            let len = read_len(cur)?;
            Value::Custom {
                class,
                data: cur.read_exact(len)?.to_vec(),
            }
        }
        other => {
            return Err(Error::UnknownTypeTag {
                tag: other.into_u8(),
                offset: cur.offset(),
            })
        }
    })
}

/// Tag written for a collection element. A schema linked type is honored
/// when the runtime value can be carried under it unchanged.
fn element_tag(linked: Option<TypeTag>, value: &Value) -> TypeTag {
    use TypeTag::*;
    let actual = value.tag();
    match linked {
        Some(t) if t == actual => t,
        Some(t) if matches!(t, Short | Integer | Long) && matches!(actual, Short | Integer | Long) => t,
        _ => actual,
    }
}

/// Writes one value in the storage layout.
pub(crate) fn write_value(
    buf: &mut WriteBuffer,
    value: &Value,
    tag: TypeTag,
    linked: Option<TypeTag>,
    fmt: &dyn DocumentFormat,
    ctx: &EncodeContext,
) -> Result<()> {
    if is_primitive(tag) {
        return write_primitive(buf, value, tag, ctx.resolver, ctx.policy);
    }
    match tag {
        TypeTag::Embedded => {
            let doc = value.as_document().ok_or_else(|| kind_mismatch(value))?;
            fmt.serialize(buf, doc, ctx)?;
        }
        TypeTag::EmbeddedList | TypeTag::EmbeddedSet => {
            let items = match value {
                Value::EmbeddedList(items) | Value::EmbeddedSet(items) => items,
                _ => return Err(kind_mismatch(value)),
            };
            write_varint(buf, items.len() as i64);
            // collection-level tag slot, always Any
            write_tag(buf, TypeTag::Any);
            for item in items {
                match item {
                    // a null element is a bare Any tag
                    None => write_tag(buf, TypeTag::Any),
                    Some(v) => {
                        let et = element_tag(linked, v);
                        write_tag(buf, et);
                        write_value(buf, v, et, None, fmt, ctx)?;
                    }
                }
            }
        }
        TypeTag::EmbeddedMap => {
            let map = match value {
                Value::EmbeddedMap(map) => map,
                _ => return Err(kind_mismatch(value)),
            };
            write_varint(buf, map.len() as i64);
            for (key, item) in map {
                write_tag(buf, TypeTag::String);
                write_string(buf, key);
                match item {
                    None => buf.push(NULLABLE_TAG_SENTINEL),
                    Some(v) => {
                        let et = v.tag();
                        write_tag(buf, et);
                        write_value(buf, v, et, None, fmt, ctx)?;
                    }
                }
            }
        }
        TypeTag::LinkList | TypeTag::LinkSet => {
            let links = match value {
                Value::LinkList(links) | Value::LinkSet(links) => links,
                _ => return Err(kind_mismatch(value)),
            };
            write_varint(buf, links.len() as i64);
            for link in links {
                write_link(buf, *link, ctx.resolver, ctx.policy)?;
            }
        }
        TypeTag::LinkMap => {
            let map = match value {
                Value::LinkMap(map) => map,
                _ => return Err(kind_mismatch(value)),
            };
            write_varint(buf, map.len() as i64);
            for (key, link) in map {
                write_tag(buf, TypeTag::String);
                write_string(buf, key);
                write_link(buf, *link, ctx.resolver, ctx.policy)?;
            }
        }
        TypeTag::LinkBag => {
            let bag = match value {
                Value::LinkBag(bag) => bag,
                _ => return Err(kind_mismatch(value)),
            };
            write_bag_storage(buf, bag, ctx)?;
        }
        _ => return Err(kind_mismatch(value)),
    }
    Ok(())
}

/// Reads one value in the storage layout.
pub(crate) fn read_value(
    cur: &mut ReadBuffer,
    tag: TypeTag,
    fmt: &dyn DocumentFormat,
    ctx: &DecodeContext,
) -> Result<Value> {
    if is_primitive(tag) {
        return read_primitive(cur, tag, ctx.resolver);
    }
    Ok(match tag {
        TypeTag::Embedded => {
            let mut doc = Document::new();
            fmt.deserialize(cur, &mut doc, ctx)?;
            Value::Embedded(doc)
        }
        TypeTag::EmbeddedList | TypeTag::EmbeddedSet => {
            let n = read_len(cur)?;
            let _collection_tag = read_tag(cur)?;
            // each element costs at least one byte; a lying count must hit
            // UnexpectedEof, not a capacity overflow
            let mut items = Vec::with_capacity(n.min(cur.remaining()));
            for _ in 0..n {
                let et = read_tag(cur)?;
                if et == TypeTag::Any {
                    items.push(None);
                } else {
                    items.push(Some(read_value(cur, et, fmt, ctx)?));
                }
            }
            if tag == TypeTag::EmbeddedList {
                Value::EmbeddedList(items)
            } else {
                Value::EmbeddedSet(items)
            }
        }
        TypeTag::EmbeddedMap => {
            let n = read_len(cur)?;
            let mut map = indexmap::IndexMap::with_capacity(n.min(cur.remaining()));
            for _ in 0..n {
                let _key_tag = read_tag(cur)?;
                let key = read_string(cur)?;
                let item = match read_nullable_tag(cur)? {
                    None => None,
                    Some(et) => Some(read_value(cur, et, fmt, ctx)?),
                };
                map.insert(key, item);
            }
            Value::EmbeddedMap(map)
        }
        TypeTag::LinkList | TypeTag::LinkSet => {
            let n = read_len(cur)?;
            let mut links = Vec::with_capacity(n.min(cur.remaining()));
            for _ in 0..n {
                links.push(read_link(cur, ctx.resolver)?);
            }
            if tag == TypeTag::LinkList {
                Value::LinkList(links)
            } else {
                Value::LinkSet(links)
            }
        }
        TypeTag::LinkMap => {
            let n = read_len(cur)?;
            let mut map = indexmap::IndexMap::with_capacity(n.min(cur.remaining()));
            for _ in 0..n {
                let _key_tag = read_tag(cur)?;
                let key = read_string(cur)?;
                map.insert(key, read_link(cur, ctx.resolver)?);
            }
            Value::LinkMap(map)
        }
        TypeTag::LinkBag => Value::LinkBag(read_bag_storage(cur, ctx)?),
        other => {
            return Err(Error::UnknownTypeTag {
                tag: other.into_u8(),
                offset: cur.offset(),
            })
        }
    })
}

/// Writes a sync id as 16 raw bytes; `None` becomes the all-set sentinel.
pub(crate) fn write_sync_id(buf: &mut WriteBuffer, sync: Option<Uuid>) {
    buf.write(sync.unwrap_or(NO_SYNC_ID).as_bytes());
}

pub(crate) fn read_sync_id(cur: &mut ReadBuffer) -> Result<Option<Uuid>> {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(cur.read_exact(16)?);
    let id = Uuid::from_bytes(raw);
    Ok(if id == NO_SYNC_ID { None } else { Some(id) })
}

/// Storage layout for bags: one config byte, the sync id, then either the
/// inline entries or the tree pointer with its pending change-set.
pub(crate) fn write_bag_storage(
    buf: &mut WriteBuffer,
    bag: &RidBag,
    ctx: &EncodeContext,
) -> Result<()> {
    let mut config = 0u8;
    if bag.is_embedded() {
        config |= BAG_EMBEDDED_FLAG;
    }
    buf.push(config);
    write_sync_id(buf, ctx.tree.sync_id_for(bag.sync_id()));
    match bag.repr() {
        BagRepr::Embedded { entries } => {
            write_varint(buf, entries.len() as i64);
            for link in entries {
                write_link(buf, *link, ctx.resolver, ctx.policy)?;
            }
        }
        BagRepr::Tree {
            pointer,
            size,
            changes,
        } => {
            let p = pointer.unwrap_or(BagPointer::INVALID);
            write_varint(buf, p.file_id);
            write_varint(buf, p.page_index);
            write_varint(buf, i64::from(p.page_offset));
            write_varint(buf, i64::from(*size));
            write_varint(buf, changes.len() as i64);
            for (rid, change) in changes {
                write_link(buf, Some(*rid), ctx.resolver, ctx.policy)?;
                buf.push(change.kind as u8);
                buf.write_i32_be(change.value);
            }
        }
    }
    Ok(())
}

pub(crate) fn read_bag_storage(cur: &mut ReadBuffer, ctx: &DecodeContext) -> Result<RidBag> {
    let config = cur.read_u8()?;
    let sync_id = read_sync_id(cur)?;
    let mut bag = if config & BAG_EMBEDDED_FLAG != 0 {
        let n = read_len(cur)?;
        let mut entries = Vec::with_capacity(n.min(cur.remaining()));
        for _ in 0..n {
            entries.push(read_link(cur, ctx.resolver)?);
        }
        RidBag::embedded_with(entries)
    } else {
        let file_id = read_varint(cur)?;
        let page_index = read_varint(cur)?;
        let page_offset = read_varint_i32(cur)?;
        let size = read_varint_i32(cur)?;
        let n = read_len(cur)?;
        let mut changes = Vec::with_capacity(n.min(cur.remaining()));
        for _ in 0..n {
            let rid = read_link(cur, ctx.resolver)?.unwrap_or(Rid::NULL);
            let kind_offset = cur.offset();
            let kind_byte = cur.read_u8()?;
            let kind = BagChangeKind::from_u8(kind_byte).ok_or(Error::UnknownTypeTag {
                tag: kind_byte,
                offset: kind_offset,
            })?;
            let value = cur.read_i32_be()?;
            changes.push((rid, BagChange { kind, value }));
        }
        let pointer = if file_id < 0 {
            None
        } else {
            Some(BagPointer::new(file_id, page_index, page_offset))
        };
        RidBag::tree(pointer, size, changes)
    };
    bag.set_sync_id(sync_id);
    Ok(bag)
}

//! Change-log serialization.
//!
//! A delta stream carries the class name, the number of changed fields,
//! and one tagged record per field: created and replaced fields ship
//! their full value, removed fields ship only the name, and in-place
//! container mutations ship a type-specific incremental payload. Replay
//! is side effecting: the decoder mutates a local document copy.
//!
//! The same module carries the flat snapshot layout (name, nullable tag,
//! value per field) used when a whole document travels alongside deltas.
//! Both encodings write null slots as the `0xFF` nullable-tag sentinel
//! and per-element nullable tags inside collections, unlike the storage
//! formats.

use tracing::debug;

use crate::bag::{BagChange, BagChangeKind, BagEvent, BagPointer, BagRepr, RidBag};
use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::registry::{DecodeContext, EncodeContext};
use crate::rid::{read_link, write_link, Rid};
use crate::scalar::{self, field_tag};
use crate::track::{ChangeEvent, ChangedPayload, DocumentChanges, FieldChange, NestedKey};
use crate::typetag::{read_nullable_tag, write_nullable_tag, write_tag, TypeTag};
use crate::value::Value;
use crate::varint::{read_len, read_varint, read_varint_i32, write_varint};

const CREATED: u8 = 1;
const REPLACED: u8 = 2;
const CHANGED: u8 = 3;
const REMOVED: u8 = 4;

const BAG_REPR_EMBEDDED: u8 = 1;
const BAG_REPR_TREE: u8 = 2;

// ---------------------------------------------------------------------------
// flat snapshot layout

pub(crate) fn serialize_snapshot_into(
    buf: &mut WriteBuffer,
    doc: &Document,
    ctx: &EncodeContext,
) -> Result<()> {
    scalar::write_string(buf, doc.class_name().unwrap_or(""));
    let count = doc
        .iter()
        .filter(|(_, slot)| slot.declared != Some(TypeTag::Transient))
        .count();
    write_varint(buf, count as i64);
    for (name, slot) in doc.iter() {
        if slot.declared == Some(TypeTag::Transient) {
            continue;
        }
        scalar::write_string(buf, name);
        match &slot.value {
            None => write_nullable_tag(buf, None),
            Some(value) => {
                let tag = field_tag(slot);
                write_nullable_tag(buf, Some(tag));
                write_flat_value(buf, value, tag, ctx)?;
            }
        }
    }
    Ok(())
}

pub(crate) fn deserialize_snapshot_into(
    cur: &mut ReadBuffer,
    doc: &mut Document,
    ctx: &DecodeContext,
) -> Result<()> {
    let class = scalar::read_string(cur)?;
    if !class.is_empty() {
        doc.set_class_name(Some(class));
    }
    let count = read_len(cur)?;
    for _ in 0..count {
        let name = scalar::read_string(cur)?;
        let value = read_nullable_value(cur, ctx)?;
        doc.set_slot(&name, value, None);
    }
    Ok(())
}

fn write_nullable_value(
    buf: &mut WriteBuffer,
    value: &Option<Value>,
    ctx: &EncodeContext,
) -> Result<()> {
    match value {
        None => write_nullable_tag(buf, None),
        Some(v) => {
            let tag = v.tag();
            write_nullable_tag(buf, Some(tag));
            write_flat_value(buf, v, tag, ctx)?;
        }
    }
    Ok(())
}

fn read_nullable_value(cur: &mut ReadBuffer, ctx: &DecodeContext) -> Result<Option<Value>> {
    match read_nullable_tag(cur)? {
        None => Ok(None),
        Some(tag) => Ok(Some(read_flat_value(cur, tag, ctx)?)),
    }
}

fn write_flat_value(
    buf: &mut WriteBuffer,
    value: &Value,
    tag: TypeTag,
    ctx: &EncodeContext,
) -> Result<()> {
    if scalar::is_primitive(tag) {
        return scalar::write_primitive(buf, value, tag, ctx.resolver, ctx.policy);
    }
    match (tag, value) {
        (TypeTag::Embedded, Value::Embedded(doc)) => serialize_snapshot_into(buf, doc, ctx)?,
        (TypeTag::EmbeddedList, Value::EmbeddedList(items))
        | (TypeTag::EmbeddedSet, Value::EmbeddedSet(items)) => {
            write_varint(buf, items.len() as i64);
            for item in items {
                write_nullable_value(buf, item, ctx)?;
            }
        }
        (TypeTag::EmbeddedMap, Value::EmbeddedMap(map)) => {
            write_varint(buf, map.len() as i64);
            for (key, item) in map {
                scalar::write_string(buf, key);
                write_nullable_value(buf, item, ctx)?;
            }
        }
        (TypeTag::LinkList, Value::LinkList(links))
        | (TypeTag::LinkSet, Value::LinkSet(links)) => {
            write_varint(buf, links.len() as i64);
            for link in links {
                write_link(buf, *link, ctx.resolver, ctx.policy)?;
            }
        }
        (TypeTag::LinkMap, Value::LinkMap(map)) => {
            write_varint(buf, map.len() as i64);
            for (key, link) in map {
                write_tag(buf, TypeTag::String);
                scalar::write_string(buf, key);
                write_link(buf, *link, ctx.resolver, ctx.policy)?;
            }
        }
        (TypeTag::LinkBag, Value::LinkBag(bag)) => write_bag_full(buf, bag, ctx)?,
        _ => return Err(Error::UnserializableValue(value.kind_name())),
    }
    Ok(())
}

fn read_flat_value(cur: &mut ReadBuffer, tag: TypeTag, ctx: &DecodeContext) -> Result<Value> {
    if scalar::is_primitive(tag) {
        return scalar::read_primitive(cur, tag, ctx.resolver);
    }
    Ok(match tag {
        TypeTag::Embedded => {
            let mut doc = Document::new();
            deserialize_snapshot_into(cur, &mut doc, ctx)?;
            Value::Embedded(doc)
        }
        TypeTag::EmbeddedList | TypeTag::EmbeddedSet => {
            let n = read_len(cur)?;
            let mut items = Vec::with_capacity(n.min(cur.remaining()));
            for _ in 0..n {
                items.push(read_nullable_value(cur, ctx)?);
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
                let key = scalar::read_string(cur)?;
                map.insert(key, read_nullable_value(cur, ctx)?);
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
                let _key_tag = crate::typetag::read_tag(cur)?;
                let key = scalar::read_string(cur)?;
                map.insert(key, read_link(cur, ctx.resolver)?);
            }
            Value::LinkMap(map)
        }
        TypeTag::LinkBag => Value::LinkBag(read_bag_full(cur, ctx)?),
        other => return Err(Error::DeltaUnsupported(other)),
    })
}

/// Full bag value in the delta layout: 16 uuid bytes first, then the
/// representation discriminator and its body. Pending tree changes ride
/// along as varints here, unlike the storage form.
fn write_bag_full(buf: &mut WriteBuffer, bag: &RidBag, ctx: &EncodeContext) -> Result<()> {
    scalar::write_sync_id(buf, ctx.tree.sync_id_for(bag.sync_id()));
    match bag.repr() {
        BagRepr::Embedded { entries } => {
            buf.push(BAG_REPR_EMBEDDED);
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
            buf.push(BAG_REPR_TREE);
            let p = pointer.unwrap_or(BagPointer::INVALID);
            write_varint(buf, p.file_id);
            write_varint(buf, p.page_index);
            write_varint(buf, i64::from(p.page_offset));
            write_varint(buf, i64::from(*size));
            write_varint(buf, changes.len() as i64);
            for (rid, change) in changes {
                write_link(buf, Some(*rid), ctx.resolver, ctx.policy)?;
                buf.push(change.kind as u8);
                write_varint(buf, i64::from(change.value));
            }
        }
    }
    Ok(())
}

fn read_bag_full(cur: &mut ReadBuffer, ctx: &DecodeContext) -> Result<RidBag> {
    let sync_id = scalar::read_sync_id(cur)?;
    let mut bag = match cur.read_u8()? {
        BAG_REPR_EMBEDDED => {
            let n = read_len(cur)?;
            let mut entries = Vec::with_capacity(n.min(cur.remaining()));
            for _ in 0..n {
                entries.push(read_link(cur, ctx.resolver)?);
            }
            RidBag::embedded_with(entries)
        }
        BAG_REPR_TREE => {
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
                let value = read_varint_i32(cur)?;
                changes.push((rid, BagChange { kind, value }));
            }
            let pointer = if file_id < 0 {
                None
            } else {
                Some(BagPointer::new(file_id, page_index, page_offset))
            };
            RidBag::tree(pointer, size, changes)
        }
        _ => return Err(Error::BadChangeRecord("unknown bag representation")),
    };
    bag.set_sync_id(sync_id);
    Ok(bag)
}

// ---------------------------------------------------------------------------
// delta encoding

pub(crate) fn serialize_delta_into(
    buf: &mut WriteBuffer,
    doc: &Document,
    changes: &DocumentChanges,
    ctx: &EncodeContext,
) -> Result<()> {
    scalar::write_string(buf, doc.class_name().unwrap_or(""));
    write_varint(buf, changes.fields.len() as i64);
    for (name, change) in &changes.fields {
        match change {
            FieldChange::Created => {
                buf.push(CREATED);
                write_snapshot_field(buf, doc, name, ctx)?;
            }
            FieldChange::Replaced => {
                buf.push(REPLACED);
                write_snapshot_field(buf, doc, name, ctx)?;
            }
            FieldChange::Removed => {
                buf.push(REMOVED);
                scalar::write_string(buf, name);
            }
            FieldChange::Changed(payload) => {
                buf.push(CHANGED);
                scalar::write_string(buf, name);
                let value = doc
                    .get(name)
                    .ok_or(Error::BadChangeRecord("changed field missing from document"))?;
                let tag = value.tag();
                write_nullable_tag(buf, Some(tag));
                write_changed_payload(buf, tag, value, payload, ctx)?;
            }
        }
    }
    Ok(())
}

fn write_snapshot_field(
    buf: &mut WriteBuffer,
    doc: &Document,
    name: &str,
    ctx: &EncodeContext,
) -> Result<()> {
    let slot = doc
        .slot(name)
        .ok_or(Error::BadChangeRecord("created field missing from document"))?;
    scalar::write_string(buf, name);
    match &slot.value {
        None => write_nullable_tag(buf, None),
        Some(value) => {
            let tag = field_tag(slot);
            write_nullable_tag(buf, Some(tag));
            write_flat_value(buf, value, tag, ctx)?;
        }
    }
    Ok(())
}

fn event_link(value: &Option<Value>) -> Result<Option<Rid>> {
    match value {
        None => Ok(None),
        Some(Value::Link(rid)) => Ok(Some(*rid)),
        Some(_) => Err(Error::BadChangeRecord("link change carries a non-link value")),
    }
}

fn write_changed_payload(
    buf: &mut WriteBuffer,
    tag: TypeTag,
    value: &Value,
    payload: &ChangedPayload,
    ctx: &EncodeContext,
) -> Result<()> {
    match payload {
        ChangedPayload::Document(doc_changes) => {
            let doc = value
                .as_document()
                .ok_or(Error::BadChangeRecord("document change on a non-document"))?;
            serialize_delta_into(buf, doc, doc_changes, ctx)
        }
        ChangedPayload::Bag => {
            let bag = match value {
                Value::LinkBag(bag) => bag,
                _ => return Err(Error::BadChangeRecord("bag change on a non-bag")),
            };
            scalar::write_sync_id(buf, ctx.tree.sync_id_for(bag.sync_id()));
            // representation tag lets the receiving side converge
            buf.push(if bag.is_embedded() {
                BAG_REPR_EMBEDDED
            } else {
                BAG_REPR_TREE
            });
            write_varint(buf, bag.timeline().len() as i64);
            for event in bag.timeline() {
                match event {
                    BagEvent::Add(rid) => {
                        buf.push(CREATED);
                        write_link(buf, Some(*rid), ctx.resolver, ctx.policy)?;
                    }
                    BagEvent::Remove(rid) => {
                        buf.push(REMOVED);
                        write_link(buf, Some(*rid), ctx.resolver, ctx.policy)?;
                    }
                }
            }
            Ok(())
        }
        ChangedPayload::Container(container) => match tag {
            TypeTag::EmbeddedList => {
                write_varint(buf, container.events.len() as i64);
                for event in &container.events {
                    match event {
                        ChangeEvent::Added { key: None, value } => {
                            buf.push(CREATED);
                            write_nullable_value(buf, value, ctx)?;
                        }
                        ChangeEvent::Updated {
                            key: NestedKey::Index(at),
                            value,
                        } => {
                            buf.push(REPLACED);
                            write_varint(buf, *at as i64);
                            write_nullable_value(buf, value, ctx)?;
                        }
                        ChangeEvent::Removed {
                            key: Some(NestedKey::Index(at)),
                            ..
                        } => {
                            buf.push(REMOVED);
                            write_varint(buf, *at as i64);
                        }
                        _ => return Err(Error::BadChangeRecord("list change needs an index")),
                    }
                }
                write_nested(buf, value, container, ctx)
            }
            TypeTag::EmbeddedSet => {
                write_varint(buf, container.events.len() as i64);
                for event in &container.events {
                    match event {
                        ChangeEvent::Added { key: None, value } => {
                            buf.push(CREATED);
                            write_nullable_value(buf, value, ctx)?;
                        }
                        ChangeEvent::Removed { key: None, value } => {
                            buf.push(REMOVED);
                            write_nullable_value(buf, value, ctx)?;
                        }
                        _ => {
                            return Err(Error::BadChangeRecord(
                                "set change addresses elements by value",
                            ))
                        }
                    }
                }
                write_nested(buf, value, container, ctx)
            }
            TypeTag::EmbeddedMap => {
                write_varint(buf, container.events.len() as i64);
                for event in &container.events {
                    match event {
                        ChangeEvent::Added {
                            key: Some(NestedKey::Name(key)),
                            value,
                        } => {
                            buf.push(CREATED);
                            scalar::write_string(buf, key);
                            write_nullable_value(buf, value, ctx)?;
                        }
                        ChangeEvent::Updated {
                            key: NestedKey::Name(key),
                            value,
                        } => {
                            buf.push(REPLACED);
                            scalar::write_string(buf, key);
                            write_nullable_value(buf, value, ctx)?;
                        }
                        ChangeEvent::Removed {
                            key: Some(NestedKey::Name(key)),
                            ..
                        } => {
                            buf.push(REMOVED);
                            scalar::write_string(buf, key);
                        }
                        _ => return Err(Error::BadChangeRecord("map change needs a key")),
                    }
                }
                write_nested(buf, value, container, ctx)
            }
            TypeTag::LinkList => {
                if !container.nested.is_empty() {
                    return Err(Error::BadChangeRecord("link collections cannot nest"));
                }
                write_varint(buf, container.events.len() as i64);
                for event in &container.events {
                    match event {
                        ChangeEvent::Added { key: None, value } => {
                            buf.push(CREATED);
                            write_link(buf, event_link(value)?, ctx.resolver, ctx.policy)?;
                        }
                        ChangeEvent::Updated {
                            key: NestedKey::Index(at),
                            value,
                        } => {
                            buf.push(REPLACED);
                            write_varint(buf, *at as i64);
                            write_link(buf, event_link(value)?, ctx.resolver, ctx.policy)?;
                        }
                        ChangeEvent::Removed { key: None, value } => {
                            buf.push(REMOVED);
                            write_link(buf, event_link(value)?, ctx.resolver, ctx.policy)?;
                        }
                        _ => return Err(Error::BadChangeRecord("bad link list change")),
                    }
                }
                Ok(())
            }
            TypeTag::LinkSet => {
                if !container.nested.is_empty() {
                    return Err(Error::BadChangeRecord("link collections cannot nest"));
                }
                write_varint(buf, container.events.len() as i64);
                for event in &container.events {
                    match event {
                        ChangeEvent::Added { key: None, value } => {
                            buf.push(CREATED);
                            write_link(buf, event_link(value)?, ctx.resolver, ctx.policy)?;
                        }
                        ChangeEvent::Removed { key: None, value } => {
                            buf.push(REMOVED);
                            write_link(buf, event_link(value)?, ctx.resolver, ctx.policy)?;
                        }
                        _ => return Err(Error::BadChangeRecord("bad link set change")),
                    }
                }
                Ok(())
            }
            TypeTag::LinkMap => {
                if !container.nested.is_empty() {
                    return Err(Error::BadChangeRecord("link collections cannot nest"));
                }
                write_varint(buf, container.events.len() as i64);
                for event in &container.events {
                    match event {
                        ChangeEvent::Added {
                            key: Some(NestedKey::Name(key)),
                            value,
                        } => {
                            buf.push(CREATED);
                            scalar::write_string(buf, key);
                            write_link(buf, event_link(value)?, ctx.resolver, ctx.policy)?;
                        }
                        ChangeEvent::Updated {
                            key: NestedKey::Name(key),
                            value,
                        } => {
                            buf.push(REPLACED);
                            scalar::write_string(buf, key);
                            write_link(buf, event_link(value)?, ctx.resolver, ctx.policy)?;
                        }
                        ChangeEvent::Removed {
                            key: Some(NestedKey::Name(key)),
                            ..
                        } => {
                            buf.push(REMOVED);
                            scalar::write_string(buf, key);
                        }
                        _ => return Err(Error::BadChangeRecord("map change needs a key")),
                    }
                }
                Ok(())
            }
            other => Err(Error::DeltaUnsupported(other)),
        },
    }
}

/// Recursive changes to elements still present in the container. Lists
/// and sets address elements by position, maps by key.
fn write_nested(
    buf: &mut WriteBuffer,
    value: &Value,
    container: &crate::track::ContainerChanges,
    ctx: &EncodeContext,
) -> Result<()> {
    write_varint(buf, container.nested.len() as i64);
    for (key, payload) in &container.nested {
        buf.push(CHANGED);
        let element = match (key, value) {
            (NestedKey::Index(at), Value::EmbeddedList(items))
            | (NestedKey::Index(at), Value::EmbeddedSet(items)) => {
                write_varint(buf, *at as i64);
                items
                    .get(*at)
                    .and_then(Option::as_ref)
                    .ok_or(Error::BadChangeRecord("nested index addresses no element"))?
            }
            (NestedKey::Name(key), Value::EmbeddedMap(map)) => {
                scalar::write_string(buf, key);
                map.get(key)
                    .and_then(Option::as_ref)
                    .ok_or(Error::BadChangeRecord("nested key addresses no element"))?
            }
            _ => return Err(Error::BadChangeRecord("nested change key mismatch")),
        };
        let tag = element.tag();
        write_nullable_tag(buf, Some(tag));
        write_changed_payload(buf, tag, element, payload, ctx)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// delta replay

pub(crate) fn deserialize_delta_into(
    cur: &mut ReadBuffer,
    doc: &mut Document,
    ctx: &DecodeContext,
) -> Result<()> {
    let class = scalar::read_string(cur)?;
    if !class.is_empty() {
        doc.set_class_name(Some(class));
    }
    let count = read_len(cur)?;
    debug!(count, "replaying delta");
    for _ in 0..count {
        let op = cur.read_u8()?;
        match op {
            CREATED | REPLACED => {
                let name = scalar::read_string(cur)?;
                let value = read_nullable_value(cur, ctx)?;
                doc.set_slot(&name, value, None);
            }
            CHANGED => {
                let name = scalar::read_string(cur)?;
                let tag = read_nullable_tag(cur)?
                    .ok_or(Error::BadChangeRecord("changed field without a type"))?;
                let value = doc
                    .get_mut(&name)
                    .ok_or(Error::BadChangeRecord("changed field missing locally"))?;
                apply_changed(cur, tag, value, ctx)?;
            }
            REMOVED => {
                let name = scalar::read_string(cur)?;
                doc.remove(&name);
            }
            _ => return Err(Error::BadChangeRecord("unknown change op")),
        }
    }
    Ok(())
}

fn apply_changed(
    cur: &mut ReadBuffer,
    tag: TypeTag,
    value: &mut Value,
    ctx: &DecodeContext,
) -> Result<()> {
    match tag {
        TypeTag::Embedded => {
            let doc = value
                .as_document_mut()
                .ok_or(Error::BadChangeRecord("document change on a non-document"))?;
            deserialize_delta_into(cur, doc, ctx)
        }
        TypeTag::LinkBag => apply_bag_changed(cur, value, ctx),
        TypeTag::EmbeddedList | TypeTag::EmbeddedSet => {
            let is_list = tag == TypeTag::EmbeddedList;
            let items = match value {
                Value::EmbeddedList(items) | Value::EmbeddedSet(items) => items,
                _ => return Err(Error::BadChangeRecord("collection change on a non-collection")),
            };
            let events = read_len(cur)?;
            for _ in 0..events {
                let op = cur.read_u8()?;
                match (op, is_list) {
                    (CREATED, _) => {
                        let item = read_nullable_value(cur, ctx)?;
                        if is_list || !items.contains(&item) {
                            items.push(item);
                        }
                    }
                    (REPLACED, true) => {
                        let at = read_len(cur)?;
                        let item = read_nullable_value(cur, ctx)?;
                        let slot = items
                            .get_mut(at)
                            .ok_or(Error::BadChangeRecord("replace past the end"))?;
                        *slot = item;
                    }
                    (REMOVED, true) => {
                        let at = read_len(cur)?;
                        if at >= items.len() {
                            return Err(Error::BadChangeRecord("remove past the end"));
                        }
                        items.remove(at);
                    }
                    (REMOVED, false) => {
                        let item = read_nullable_value(cur, ctx)?;
                        if let Some(at) = items.iter().position(|e| *e == item) {
                            items.remove(at);
                        }
                    }
                    _ => return Err(Error::BadChangeRecord("bad collection change op")),
                }
            }
            apply_nested_positional(cur, items, ctx)
        }
        TypeTag::EmbeddedMap => {
            let map = match value {
                Value::EmbeddedMap(map) => map,
                _ => return Err(Error::BadChangeRecord("map change on a non-map")),
            };
            let events = read_len(cur)?;
            for _ in 0..events {
                let op = cur.read_u8()?;
                match op {
                    CREATED | REPLACED => {
                        let key = scalar::read_string(cur)?;
                        let item = read_nullable_value(cur, ctx)?;
                        map.insert(key, item);
                    }
                    REMOVED => {
                        let key = scalar::read_string(cur)?;
                        map.shift_remove(&key);
                    }
                    _ => return Err(Error::BadChangeRecord("bad map change op")),
                }
            }
            let nested = read_len(cur)?;
            for _ in 0..nested {
                let op = cur.read_u8()?;
                if op != CHANGED {
                    return Err(Error::BadChangeRecord("nested change expected"));
                }
                let key = scalar::read_string(cur)?;
                let tag = read_nullable_tag(cur)?
                    .ok_or(Error::BadChangeRecord("nested change without a type"))?;
                let element = map
                    .get_mut(&key)
                    .and_then(Option::as_mut)
                    .ok_or(Error::BadChangeRecord("nested key addresses no element"))?;
                apply_changed(cur, tag, element, ctx)?;
            }
            Ok(())
        }
        TypeTag::LinkList | TypeTag::LinkSet => {
            let is_list = tag == TypeTag::LinkList;
            let links = match value {
                Value::LinkList(links) | Value::LinkSet(links) => links,
                _ => return Err(Error::BadChangeRecord("link change on a non-link value")),
            };
            let events = read_len(cur)?;
            for _ in 0..events {
                let op = cur.read_u8()?;
                match (op, is_list) {
                    (CREATED, _) => {
                        let link = read_link(cur, ctx.resolver)?;
                        if is_list || !links.contains(&link) {
                            links.push(link);
                        }
                    }
                    (REPLACED, true) => {
                        let at = read_len(cur)?;
                        let link = read_link(cur, ctx.resolver)?;
                        let slot = links
                            .get_mut(at)
                            .ok_or(Error::BadChangeRecord("replace past the end"))?;
                        *slot = link;
                    }
                    (REMOVED, _) => {
                        let link = read_link(cur, ctx.resolver)?;
                        if let Some(at) = links.iter().position(|e| *e == link) {
                            links.remove(at);
                        }
                    }
                    _ => return Err(Error::BadChangeRecord("bad link collection change op")),
                }
            }
            Ok(())
        }
        TypeTag::LinkMap => {
            let map = match value {
                Value::LinkMap(map) => map,
                _ => return Err(Error::BadChangeRecord("link map change on a non-map")),
            };
            let events = read_len(cur)?;
            for _ in 0..events {
                let op = cur.read_u8()?;
                match op {
                    CREATED | REPLACED => {
                        let key = scalar::read_string(cur)?;
                        let link = read_link(cur, ctx.resolver)?;
                        map.insert(key, link);
                    }
                    REMOVED => {
                        let key = scalar::read_string(cur)?;
                        map.shift_remove(&key);
                    }
                    _ => return Err(Error::BadChangeRecord("bad link map change op")),
                }
            }
            Ok(())
        }
        other => Err(Error::DeltaUnsupported(other)),
    }
}

fn apply_nested_positional(
    cur: &mut ReadBuffer,
    items: &mut [Option<Value>],
    ctx: &DecodeContext,
) -> Result<()> {
    let nested = read_len(cur)?;
    for _ in 0..nested {
        let op = cur.read_u8()?;
        if op != CHANGED {
            return Err(Error::BadChangeRecord("nested change expected"));
        }
        let at = read_len(cur)?;
        let tag = read_nullable_tag(cur)?
            .ok_or(Error::BadChangeRecord("nested change without a type"))?;
        let element = items
            .get_mut(at)
            .and_then(Option::as_mut)
            .ok_or(Error::BadChangeRecord("nested index addresses no element"))?;
        apply_changed(cur, tag, element, ctx)?;
    }
    Ok(())
}

fn apply_bag_changed(cur: &mut ReadBuffer, value: &mut Value, ctx: &DecodeContext) -> Result<()> {
    let bag = match value {
        Value::LinkBag(bag) => bag,
        _ => return Err(Error::BadChangeRecord("bag change on a non-bag")),
    };
    bag.set_sync_id(scalar::read_sync_id(cur)?);
    match cur.read_u8()? {
        BAG_REPR_EMBEDDED => bag.force_embedded(ctx.tree),
        BAG_REPR_TREE => bag.force_tree(),
        _ => return Err(Error::BadChangeRecord("unknown bag representation")),
    }
    let events = read_len(cur)?;
    for _ in 0..events {
        let op = cur.read_u8()?;
        let link = read_link(cur, ctx.resolver)?;
        match (op, link) {
            (CREATED, Some(rid)) => bag.add(rid),
            (REMOVED, Some(rid)) => bag.remove(rid),
            (_, None) => {}
            _ => return Err(Error::BadChangeRecord("bad bag change op")),
        }
    }
    // replay must not look like fresh local mutations
    bag.clear_timeline();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bag::{NoTreeStore, TreeStore};
    use crate::registry::{apply_delta, decode_snapshot, encode_delta, encode_snapshot};
    use crate::schema::SchemaSnapshot;
    use crate::track::ContainerChanges;
    use indexmap::IndexMap;
    use uuid::Uuid;

    fn encode(doc: &Document, changes: &DocumentChanges) -> Vec<u8> {
        let schema = SchemaSnapshot::new();
        encode_delta(doc, changes, &EncodeContext::new(&schema)).unwrap()
    }

    fn apply(bytes: &[u8], doc: &mut Document) {
        let schema = SchemaSnapshot::new();
        apply_delta(bytes, doc, &DecodeContext::new(&schema)).unwrap()
    }

    #[test]
    fn created_replaced_removed_round_trip() {
        let mut before = Document::with_class("Person");
        before.set("name", "Jon");
        before.set("age", 20);
        before.set("city", "Oslo");

        let mut after = before.clone();
        after.set("age", 21);
        after.set("email", "jon@example.com");
        after.remove("city");

        let changes = DocumentChanges::new()
            .replaced("age")
            .created("email")
            .removed("city");
        let bytes = encode(&after, &changes);

        let mut local = before.clone();
        apply(&bytes, &mut local);
        assert_eq!(local, after);

        // replaying the same delta again changes nothing
        apply(&bytes, &mut local);
        assert_eq!(local, after);
    }

    #[test]
    fn created_null_field_round_trips() {
        let mut after = Document::new();
        after.set_null("note");
        let bytes = encode(&after, &DocumentChanges::new().created("note"));
        let mut local = Document::new();
        apply(&bytes, &mut local);
        assert!(local.contains("note"));
        assert_eq!(local.get("note"), None);
    }

    #[test]
    fn list_events_replay_in_order() {
        let mut before = Document::new();
        before.set(
            "nums",
            Value::EmbeddedList(vec![
                Some(Value::Integer(1)),
                Some(Value::Integer(2)),
                Some(Value::Integer(3)),
            ]),
        );

        // replace [0] with 9, remove [1], append 4
        let mut after = before.clone();
        after.set(
            "nums",
            Value::EmbeddedList(vec![
                Some(Value::Integer(9)),
                Some(Value::Integer(3)),
                Some(Value::Integer(4)),
            ]),
        );
        let container = ContainerChanges::new()
            .event(ChangeEvent::updated(
                NestedKey::Index(0),
                Some(Value::Integer(9)),
            ))
            .event(ChangeEvent::removed_at(NestedKey::Index(1)))
            .event(ChangeEvent::added(Some(Value::Integer(4))));
        let changes =
            DocumentChanges::new().changed("nums", ChangedPayload::Container(container));
        let bytes = encode(&after, &changes);

        let mut local = before.clone();
        apply(&bytes, &mut local);
        assert_eq!(local, after);
    }

    #[test]
    fn set_events_address_by_value() {
        let mut before = Document::new();
        before.set(
            "words",
            Value::EmbeddedSet(vec![
                Some(Value::String("a".into())),
                Some(Value::String("b".into())),
            ]),
        );
        let mut after = before.clone();
        after.set(
            "words",
            Value::EmbeddedSet(vec![
                Some(Value::String("a".into())),
                Some(Value::String("c".into())),
            ]),
        );
        let container = ContainerChanges::new()
            .event(ChangeEvent::removed_value(Some(Value::String("b".into()))))
            .event(ChangeEvent::added(Some(Value::String("c".into()))));
        let changes =
            DocumentChanges::new().changed("words", ChangedPayload::Container(container));
        let bytes = encode(&after, &changes);

        let mut local = before.clone();
        apply(&bytes, &mut local);
        assert_eq!(local, after);
    }

    #[test]
    fn map_events_and_nested_document_change() {
        let mut inner = Document::new();
        inner.set("street", "Old");
        let mut map = IndexMap::new();
        map.insert("home".to_string(), Some(Value::Embedded(inner)));
        map.insert("stale".to_string(), Some(Value::Integer(0)));
        let mut before = Document::new();
        before.set("places", Value::EmbeddedMap(map));

        let mut inner_after = Document::new();
        inner_after.set("street", "New");
        let mut map_after = IndexMap::new();
        map_after.insert("home".to_string(), Some(Value::Embedded(inner_after)));
        let mut after = Document::new();
        after.set("places", Value::EmbeddedMap(map_after));

        let nested_change = DocumentChanges::new().replaced("street");
        let container = ContainerChanges::new()
            .event(ChangeEvent::removed_at(NestedKey::Name("stale".into())))
            .nested(
                NestedKey::Name("home".into()),
                ChangedPayload::Document(nested_change),
            );
        let changes =
            DocumentChanges::new().changed("places", ChangedPayload::Container(container));
        let bytes = encode(&after, &changes);

        let mut local = before.clone();
        apply(&bytes, &mut local);
        assert_eq!(local, after);
    }

    #[test]
    fn nested_list_element_document_change() {
        let mut inner = Document::new();
        inner.set("n", 1);
        let mut before = Document::new();
        before.set(
            "docs",
            Value::EmbeddedList(vec![Some(Value::Embedded(inner))]),
        );

        let mut inner_after = Document::new();
        inner_after.set("n", 2);
        let mut after = Document::new();
        after.set(
            "docs",
            Value::EmbeddedList(vec![Some(Value::Embedded(inner_after))]),
        );

        let container = ContainerChanges::new().nested(
            NestedKey::Index(0),
            ChangedPayload::Document(DocumentChanges::new().replaced("n")),
        );
        let changes =
            DocumentChanges::new().changed("docs", ChangedPayload::Container(container));
        let bytes = encode(&after, &changes);

        let mut local = before.clone();
        apply(&bytes, &mut local);
        assert_eq!(local, after);
    }

    #[test]
    fn link_collections_replay() {
        let a = Rid::new(1, 1);
        let b = Rid::new(1, 2);
        let c = Rid::new(1, 3);

        let mut before = Document::new();
        before.set("ll", Value::LinkList(vec![Some(a), Some(b)]));
        before.set("ls", Value::LinkSet(vec![Some(a)]));
        let mut lm = IndexMap::new();
        lm.insert("x".to_string(), Some(a));
        before.set("lm", Value::LinkMap(lm));

        let mut after = Document::new();
        after.set("ll", Value::LinkList(vec![Some(c), Some(b)]));
        after.set("ls", Value::LinkSet(vec![Some(a), Some(c)]));
        let mut lm_after = IndexMap::new();
        lm_after.insert("y".to_string(), Some(b));
        after.set("lm", Value::LinkMap(lm_after));

        let changes = DocumentChanges::new()
            .changed(
                "ll",
                ChangedPayload::Container(ContainerChanges::new().event(
                    ChangeEvent::updated(NestedKey::Index(0), Some(Value::Link(c))),
                )),
            )
            .changed(
                "ls",
                ChangedPayload::Container(
                    ContainerChanges::new().event(ChangeEvent::added(Some(Value::Link(c)))),
                ),
            )
            .changed(
                "lm",
                ChangedPayload::Container(
                    ContainerChanges::new()
                        .event(ChangeEvent::removed_at(NestedKey::Name("x".into())))
                        .event(ChangeEvent::added_at(
                            NestedKey::Name("y".into()),
                            Some(Value::Link(b)),
                        )),
                ),
            );
        let bytes = encode(&after, &changes);

        let mut local = before.clone();
        apply(&bytes, &mut local);
        assert_eq!(local, after);
    }

    #[test]
    fn bag_delta_replays_timeline_and_sync_id() {
        let r1 = Rid::new(2, 1);
        let r2 = Rid::new(2, 2);

        let mut before = Document::new();
        before.set("refs", Value::LinkBag(RidBag::embedded_with(vec![Some(r1)])));

        let mut mutated_bag = RidBag::embedded_with(vec![Some(r1)]);
        mutated_bag.add(r2);
        mutated_bag.remove(r1);
        let sync = Uuid::new_v4();
        mutated_bag.set_sync_id(Some(sync));
        let mut after = Document::new();
        after.set("refs", Value::LinkBag(mutated_bag));

        let changes = DocumentChanges::new().changed("refs", ChangedPayload::Bag);
        let bytes = encode(&after, &changes);

        let mut local = before.clone();
        apply(&bytes, &mut local);
        let bag = match local.get("refs") {
            Some(Value::LinkBag(bag)) => bag,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(bag.entries().unwrap(), &[Some(r2)]);
        assert_eq!(bag.sync_id(), Some(sync));
        assert!(bag.timeline().is_empty());
    }

    #[test]
    fn bag_delta_forces_remote_representation() {
        struct OneTree;
        impl TreeStore for OneTree {
            fn resolve_pointer(&self, _p: &BagPointer) -> Option<Vec<Rid>> {
                Some(vec![Rid::new(3, 3)])
            }
            fn sync_id_for(&self, current: Option<Uuid>) -> Option<Uuid> {
                current
            }
        }

        // sender's bag is embedded; local copy is still tree backed
        let mut after = Document::new();
        let mut sender_bag = RidBag::embedded_with(vec![Some(Rid::new(3, 3))]);
        sender_bag.add(Rid::new(3, 4));
        after.set("refs", Value::LinkBag(sender_bag));
        let changes = DocumentChanges::new().changed("refs", ChangedPayload::Bag);
        let bytes = encode(&after, &changes);

        let mut local = Document::new();
        local.set(
            "refs",
            Value::LinkBag(RidBag::tree(Some(BagPointer::new(1, 1, 1)), 1, Vec::new())),
        );
        let schema = SchemaSnapshot::new();
        let ctx = DecodeContext::new(&schema).with_tree(&OneTree);
        apply_delta(&bytes, &mut local, &ctx).unwrap();

        let bag = match local.get("refs") {
            Some(Value::LinkBag(bag)) => bag,
            other => panic!("unexpected {other:?}"),
        };
        assert!(bag.is_embedded());
        assert_eq!(
            bag.entries().unwrap(),
            &[Some(Rid::new(3, 3)), Some(Rid::new(3, 4))]
        );
    }

    #[test]
    fn tree_bag_delta_appends_pending_changes() {
        let r = Rid::new(5, 9);
        let pointer = BagPointer::new(2, 4, 256);

        let mut sender_bag = RidBag::tree(Some(pointer), 3, Vec::new());
        sender_bag.add(r);
        let mut after = Document::new();
        after.set("refs", Value::LinkBag(sender_bag));
        let changes = DocumentChanges::new().changed("refs", ChangedPayload::Bag);
        let bytes = encode(&after, &changes);

        let mut local = Document::new();
        local.set("refs", Value::LinkBag(RidBag::tree(Some(pointer), 3, Vec::new())));
        apply(&bytes, &mut local);

        let bag = match local.get("refs") {
            Some(Value::LinkBag(bag)) => bag,
            other => panic!("unexpected {other:?}"),
        };
        assert!(!bag.is_embedded());
        assert_eq!(bag.size(), 4);
        match bag.repr() {
            BagRepr::Tree { changes, .. } => {
                assert_eq!(changes, &[(r, BagChange::diff(1))]);
            }
            other => panic!("unexpected repr {other:?}"),
        }
        assert!(bag.timeline().is_empty());
    }

    #[test]
    fn embedded_field_delta_recurses() {
        let mut inner_before = Document::with_class("Address");
        inner_before.set("city", "Oslo");
        let mut before = Document::new();
        before.set("home", Value::Embedded(inner_before));

        let mut inner_after = Document::with_class("Address");
        inner_after.set("city", "Bergen");
        let mut after = Document::new();
        after.set("home", Value::Embedded(inner_after));

        let changes = DocumentChanges::new().changed(
            "home",
            ChangedPayload::Document(DocumentChanges::new().replaced("city")),
        );
        let bytes = encode(&after, &changes);

        let mut local = before.clone();
        apply(&bytes, &mut local);
        assert_eq!(local, after);
    }

    #[test]
    fn snapshot_round_trips_containers_and_nulls() {
        let schema = SchemaSnapshot::new();
        let mut inner = Document::with_class("Inner");
        inner.set("k", 5);
        let mut doc = Document::with_class("Outer");
        doc.set("title", "t");
        doc.set_null("missing");
        doc.set(
            "list",
            Value::EmbeddedList(vec![Some(Value::String("a".into())), None]),
        );
        doc.set("inner", Value::Embedded(inner));
        doc.set(
            "bag",
            Value::LinkBag(RidBag::embedded_with(vec![Some(Rid::new(4, 4)), None])),
        );

        let bytes = encode_snapshot(&doc, &EncodeContext::new(&schema)).unwrap();
        let back = decode_snapshot(&bytes, &DecodeContext::new(&schema)).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn snapshot_of_tree_bag_keeps_pending_changes() {
        let schema = SchemaSnapshot::new();
        let mut doc = Document::new();
        doc.set(
            "bag",
            Value::LinkBag(RidBag::tree(
                Some(BagPointer::new(8, 2, 96)),
                12,
                vec![(Rid::new(6, 6), BagChange::diff(-1))],
            )),
        );
        let bytes = encode_snapshot(&doc, &EncodeContext::new(&schema)).unwrap();
        let back = decode_snapshot(&bytes, &DecodeContext::new(&schema)).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn unknown_change_op_is_rejected() {
        let schema = SchemaSnapshot::new();
        let mut doc = Document::new();
        let mut buf = WriteBuffer::new();
        buf.push(crate::registry::DELTA_RECORD);
        scalar::write_string(&mut buf, "");
        write_varint(&mut buf, 1);
        buf.push(9); // not a change op
        let err = apply_delta(
            &buf.into_bytes(),
            &mut doc,
            &DecodeContext::new(&schema),
        )
        .unwrap_err();
        assert!(matches!(err, Error::BadChangeRecord(_)));
    }

    #[test]
    fn changed_field_missing_locally_is_rejected() {
        let mut after = Document::new();
        after.set(
            "nums",
            Value::EmbeddedList(vec![Some(Value::Integer(1))]),
        );
        let container =
            ContainerChanges::new().event(ChangeEvent::added(Some(Value::Integer(1))));
        let changes =
            DocumentChanges::new().changed("nums", ChangedPayload::Container(container));
        let bytes = encode(&after, &changes);

        let schema = SchemaSnapshot::new();
        let mut local = Document::new();
        let err = apply_delta(&bytes, &mut local, &DecodeContext::new(&schema)).unwrap_err();
        assert!(matches!(err, Error::BadChangeRecord(_)));
    }

    #[test]
    fn delta_is_smaller_than_snapshot_for_small_changes() {
        let schema = SchemaSnapshot::new();
        let mut doc = Document::new();
        doc.set("blob", Value::Binary(vec![7u8; 4096]));
        doc.set("counter", 1);
        let changes = DocumentChanges::new().replaced("counter");
        let delta = encode_delta(&doc, &changes, &EncodeContext::new(&schema)).unwrap();
        let snapshot = encode_snapshot(&doc, &EncodeContext::new(&schema)).unwrap();
        assert!(delta.len() < snapshot.len() / 10);
    }

    #[test]
    fn snapshot_with_lying_list_count_errors_out() {
        let schema = SchemaSnapshot::new();
        let mut buf = WriteBuffer::new();
        buf.push(crate::registry::DELTA_RECORD);
        scalar::write_string(&mut buf, "");
        write_varint(&mut buf, 1);
        scalar::write_string(&mut buf, "nums");
        write_nullable_tag(&mut buf, Some(TypeTag::EmbeddedList));
        // claims 2^60 elements, record ends here
        write_varint(&mut buf, 1i64 << 60);
        let bytes = buf.into_bytes();
        let err = decode_snapshot(&bytes, &DecodeContext::new(&schema)).unwrap_err();
        assert!(matches!(err, Error::UnexpectedEof { .. }));
    }

    #[test]
    fn unused_tree_store_defaults_are_inert() {
        assert!(NoTreeStore.resolve_pointer(&BagPointer::INVALID).is_none());
        assert_eq!(NoTreeStore.sync_id_for(None), None);
    }
}

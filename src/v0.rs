//! Document format V0: pointer-interleaved header.
//!
//! Layout: class name, then one header entry per field, then a zero
//! varint terminator, then the values. An entry is a literal name or a
//! negated global property id, a 4-byte big-endian absolute pointer to
//! the value, and one tag byte unless the property pins a non-Any type.
//! Pointers count from the start of the whole record, version byte
//! included; a zero pointer is a null field. The pointers are reserved
//! while writing the header and patched once the values land.

use tracing::warn;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::debug::{DecodeReport, FieldReport};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::registry::{DecodeContext, DocumentFormat, EncodeContext};
use crate::scalar::{self, field_tag};
use crate::typetag::{read_tag, TypeTag};
use crate::value::Value;
use crate::varint::{read_varint, write_varint};

pub struct V0Format;

struct HeaderEntry {
    name: String,
    tag: TypeTag,
    pointer: usize,
    is_null: bool,
}

fn read_header_entry(
    cur: &mut ReadBuffer,
    first: i64,
    ctx: &DecodeContext,
) -> Result<HeaderEntry> {
    let (name, tag, pointer) = if first > 0 {
        let offset = cur.offset();
        let bytes = cur.read_exact(first as usize)?;
        let name = std::str::from_utf8(bytes)
            .map_err(|_| Error::BadString { offset })?
            .to_owned();
        let pointer = cur.read_i32_be()?;
        let tag = read_tag(cur)?;
        (name, tag, pointer)
    } else {
        let id = (-first - 1) as u32;
        let prop = ctx
            .schema
            .property_by_id(id)
            .ok_or(Error::UnknownGlobalProperty { id })?;
        let pointer = cur.read_i32_be()?;
        let tag = if prop.tag == TypeTag::Any {
            read_tag(cur)?
        } else {
            prop.tag
        };
        (prop.name.clone(), tag, pointer)
    };
    if pointer < 0 {
        return Err(Error::BadLength {
            len: i64::from(pointer),
            offset: cur.offset(),
        });
    }
    Ok(HeaderEntry {
        name,
        tag,
        pointer: pointer as usize,
        is_null: pointer == 0,
    })
}

impl DocumentFormat for V0Format {
    fn version(&self) -> u8 {
        0
    }

    fn serialize(&self, buf: &mut WriteBuffer, doc: &Document, ctx: &EncodeContext) -> Result<()> {
        scalar::write_string(buf, doc.class_name().unwrap_or(""));

        // header pass: names and reserved pointer/tag spans
        let mut pending = Vec::new();
        for (name, slot) in doc.iter() {
            if slot.declared == Some(TypeTag::Transient) {
                continue;
            }
            // a zero-length name varint is the header terminator
            if name.is_empty() {
                return Err(Error::UnserializableValue("unnamed field"));
            }
            let tag = field_tag(slot);
            let prop = ctx
                .schema
                .property_by_name(name)
                .filter(|p| p.tag == tag);
            match prop {
                Some(p) => write_varint(buf, -(i64::from(p.id) + 1)),
                None => scalar::write_string(buf, name),
            }
            let pointer_at = buf.alloc(4);
            let tag_at = match prop {
                Some(p) if p.tag != TypeTag::Any => None,
                _ => Some(buf.alloc(1)),
            };
            if let Some(value) = &slot.value {
                let linked = ctx.schema.linked_type(doc.class_name(), tag, name);
                pending.push((pointer_at, tag_at, tag, linked, value));
            }
            // null fields keep the zero pointer and a zero tag byte
        }
        write_varint(buf, 0);

        // value pass: write, then patch the reserved spans
        for (pointer_at, tag_at, tag, linked, value) in pending {
            let value_pos = buf.offset();
            scalar::write_value(buf, value, tag, linked, self, ctx)?;
            buf.patch_i32_be(pointer_at, value_pos as i32);
            if let Some(at) = tag_at {
                buf.patch_u8(at, tag.into_u8());
            }
        }
        Ok(())
    }

    fn deserialize(
        &self,
        cur: &mut ReadBuffer,
        doc: &mut Document,
        ctx: &DecodeContext,
    ) -> Result<()> {
        let class = scalar::read_string(cur)?;
        if !class.is_empty() {
            doc.set_class_name(Some(class));
        }
        let mut last_end = 0usize;
        loop {
            let first = read_varint(cur)?;
            if first == 0 {
                break;
            }
            let entry = read_header_entry(cur, first, ctx)?;
            if doc.contains(&entry.name) {
                continue;
            }
            if entry.is_null {
                doc.set_slot(&entry.name, None, None);
                continue;
            }
            let header_pos = cur.offset();
            cur.seek(entry.pointer);
            let value = scalar::read_value(cur, entry.tag, self, ctx)?;
            last_end = last_end.max(cur.offset());
            cur.seek(header_pos);
            doc.set_slot(&entry.name, Some(value), None);
        }
        if last_end > cur.offset() {
            cur.seek(last_end);
        }
        Ok(())
    }

    fn deserialize_partial(
        &self,
        cur: &mut ReadBuffer,
        doc: &mut Document,
        fields: &[&str],
        ctx: &DecodeContext,
    ) -> Result<()> {
        let class = scalar::read_string(cur)?;
        if !class.is_empty() {
            doc.set_class_name(Some(class));
        }
        let mut found = 0usize;
        while found < fields.len() {
            let first = read_varint(cur)?;
            if first == 0 {
                break;
            }
            let (matched, tag, pointer) = if first > 0 {
                let offset = cur.offset();
                let bytes = cur.read_exact(first as usize)?;
                // length check first; non-matching names are never decoded
                let matched = fields
                    .iter()
                    .find(|f| f.len() == bytes.len() && f.as_bytes() == bytes)
                    .map(|f| f.to_string());
                if matched.is_none() && std::str::from_utf8(bytes).is_err() {
                    return Err(Error::BadString { offset });
                }
                let pointer = cur.read_i32_be()?;
                let tag = read_tag(cur)?;
                (matched, tag, pointer)
            } else {
                let id = (-first - 1) as u32;
                let prop = ctx
                    .schema
                    .property_by_id(id)
                    .ok_or(Error::UnknownGlobalProperty { id })?;
                let pointer = cur.read_i32_be()?;
                let tag = if prop.tag == TypeTag::Any {
                    read_tag(cur)?
                } else {
                    prop.tag
                };
                let matched = fields
                    .iter()
                    .any(|f| *f == prop.name)
                    .then(|| prop.name.clone());
                (matched, tag, pointer)
            };
            if let Some(name) = matched {
                found += 1;
                if !doc.contains(&name) {
                    if pointer == 0 {
                        doc.set_slot(&name, None, None);
                    } else {
                        let header_pos = cur.offset();
                        cur.seek(pointer as usize);
                        let value = scalar::read_value(cur, tag, self, ctx)?;
                        cur.seek(header_pos);
                        doc.set_slot(&name, Some(value), None);
                    }
                }
            }
        }
        Ok(())
    }

    fn deserialize_field(
        &self,
        cur: &mut ReadBuffer,
        name: &str,
        ctx: &DecodeContext,
    ) -> Result<Option<Option<Value>>> {
        scalar::read_string(cur)?;
        loop {
            let first = read_varint(cur)?;
            if first == 0 {
                return Ok(None);
            }
            let (matched, tag, pointer) = if first > 0 {
                let bytes = cur.read_exact(first as usize)?;
                let matched = bytes.len() == name.len() && bytes == name.as_bytes();
                let pointer = cur.read_i32_be()?;
                let tag = read_tag(cur)?;
                (matched, tag, pointer)
            } else {
                let id = (-first - 1) as u32;
                let prop = ctx
                    .schema
                    .property_by_id(id)
                    .ok_or(Error::UnknownGlobalProperty { id })?;
                let pointer = cur.read_i32_be()?;
                let tag = if prop.tag == TypeTag::Any {
                    read_tag(cur)?
                } else {
                    prop.tag
                };
                (prop.name == name, tag, pointer)
            };
            if matched {
                if pointer == 0 {
                    return Ok(Some(None));
                }
                cur.seek(pointer as usize);
                return Ok(Some(Some(scalar::read_value(cur, tag, self, ctx)?)));
            }
        }
    }

    fn field_names(&self, cur: &mut ReadBuffer, ctx: &DecodeContext) -> Result<Vec<String>> {
        scalar::read_string(cur)?;
        let mut names = Vec::new();
        loop {
            let first = read_varint(cur)?;
            if first == 0 {
                return Ok(names);
            }
            let entry = read_header_entry(cur, first, ctx)?;
            names.push(entry.name);
        }
    }

    fn debug_walk(&self, cur: &mut ReadBuffer, ctx: &DecodeContext) -> DecodeReport {
        let mut report = DecodeReport::default();
        match scalar::read_string(cur) {
            Ok(class) => {
                if !class.is_empty() {
                    report.class_name = Some(class);
                }
            }
            Err(err) => {
                report.fail(cur.offset(), &err);
                return report;
            }
        }
        loop {
            let first = match read_varint(cur) {
                Ok(0) => break,
                Ok(v) => v,
                Err(err) => {
                    report.fail(cur.offset(), &err);
                    break;
                }
            };
            let mut field = FieldReport::default();
            let parsed: Result<(TypeTag, i32)> = if first > 0 {
                match cur.read_exact(first as usize) {
                    Ok(bytes) => {
                        field.name = Some(String::from_utf8_lossy(bytes).into_owned());
                        cur.read_i32_be().and_then(|p| Ok((read_tag(cur)?, p)))
                    }
                    Err(err) => Err(err),
                }
            } else {
                let id = (-first - 1) as u32;
                field.global_id = Some(id);
                match ctx.schema.property_by_id(id) {
                    Some(prop) => {
                        field.name = Some(prop.name.clone());
                        cur.read_i32_be().and_then(|p| {
                            let tag = if prop.tag == TypeTag::Any {
                                read_tag(cur)?
                            } else {
                                prop.tag
                            };
                            Ok((tag, p))
                        })
                    }
                    None => Err(Error::UnknownGlobalProperty { id }),
                }
            };
            let (tag, pointer) = match parsed {
                Ok(parts) => parts,
                Err(err) => {
                    // tag-byte presence is unknowable without the property,
                    // so the header walk cannot continue past this entry
                    warn!(offset = cur.offset(), "header entry unreadable: {err}");
                    field.fail(cur.offset(), &err);
                    report.fields.push(field);
                    break;
                }
            };
            field.tag = Some(tag);
            if pointer > 0 {
                field.value_offset = Some(pointer as usize);
                let header_pos = cur.offset();
                cur.seek(pointer as usize);
                match scalar::read_value(cur, tag, self, ctx) {
                    Ok(value) => field.value = Some(value),
                    Err(err) => {
                        warn!(offset = cur.offset(), "field value unreadable: {err}");
                        field.fail(cur.offset(), &err);
                    }
                }
                cur.seek(header_pos);
            }
            report.fields.push(field);
        }
        report
    }
}

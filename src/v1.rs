//! Document format V1: length-prefixed header, split value region.
//!
//! Layout: class name (length-prefixed, empty when absent), header byte
//! length, then the header entries, then every value back to back. An
//! entry is either a literal name (positive name length) or a negated
//! global property id, followed by the value byte length and, unless the
//! property pins a non-Any type, one tag byte. A zero value length is a
//! null field. Value positions are never stored; readers accumulate the
//! lengths, which is what makes header-only walks cheap.

use tracing::warn;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::debug::{DecodeReport, FieldReport};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::registry::{DecodeContext, DocumentFormat, EncodeContext};
use crate::scalar::{self, field_tag};
use crate::typetag::{read_tag, TypeTag};
use crate::value::Value;
use crate::varint::{read_len, read_varint, write_varint};

pub struct V1Format;

/// One parsed header entry.
struct HeaderEntry {
    name: String,
    tag: TypeTag,
    value_len: usize,
}

fn read_header_entry(cur: &mut ReadBuffer, ctx: &DecodeContext) -> Result<HeaderEntry> {
    let first = read_varint(cur)?;
    if first >= 0 {
        let offset = cur.offset();
        let bytes = cur.read_exact(first as usize)?;
        let name = std::str::from_utf8(bytes)
            .map_err(|_| Error::BadString { offset })?
            .to_owned();
        let value_len = read_len(cur)?;
        let tag = read_tag(cur)?;
        Ok(HeaderEntry {
            name,
            tag,
            value_len,
        })
    } else {
        let id = (-first - 1) as u32;
        let prop = ctx
            .schema
            .property_by_id(id)
            .ok_or(Error::UnknownGlobalProperty { id })?;
        let value_len = read_len(cur)?;
        let tag = if prop.tag == TypeTag::Any {
            read_tag(cur)?
        } else {
            prop.tag
        };
        Ok(HeaderEntry {
            name: prop.name.clone(),
            tag,
            value_len,
        })
    }
}

impl DocumentFormat for V1Format {
    fn version(&self) -> u8 {
        1
    }

    fn serialize(&self, buf: &mut WriteBuffer, doc: &Document, ctx: &EncodeContext) -> Result<()> {
        scalar::write_string(buf, doc.class_name().unwrap_or(""));

        let mut header = WriteBuffer::new();
        let mut values = WriteBuffer::new();
        for (name, slot) in doc.iter() {
            if slot.declared == Some(TypeTag::Transient) {
                continue;
            }
            let tag = field_tag(slot);
            let prop = ctx
                .schema
                .property_by_name(name)
                .filter(|p| p.tag == tag);
            match prop {
                Some(p) => write_varint(&mut header, -(i64::from(p.id) + 1)),
                None => scalar::write_string(&mut header, name),
            }
            let value_len = match &slot.value {
                Some(value) => {
                    let start = values.offset();
                    let linked = ctx.schema.linked_type(doc.class_name(), tag, name);
                    scalar::write_value(&mut values, value, tag, linked, self, ctx)?;
                    (values.offset() - start) as i64
                }
                None => 0,
            };
            write_varint(&mut header, value_len);
            let tag_byte_needed = match prop {
                Some(p) => p.tag == TypeTag::Any,
                None => true,
            };
            if tag_byte_needed {
                let written = if slot.value.is_some() {
                    tag
                } else {
                    TypeTag::Any
                };
                header.push(written.into_u8());
            }
        }

        write_varint(buf, header.offset() as i64);
        buf.append(&header);
        buf.append(&values);
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
        let header_len = read_len(cur)?;
        let header_end = cur.offset() + header_len;
        let mut value_pos = header_end;
        while cur.offset() < header_end {
            let entry = read_header_entry(cur, ctx)?;
            if entry.value_len == 0 {
                if !doc.contains(&entry.name) {
                    doc.set_slot(&entry.name, None, None);
                }
                continue;
            }
            if !doc.contains(&entry.name) {
                let header_pos = cur.offset();
                cur.seek(value_pos);
                let value = scalar::read_value(cur, entry.tag, self, ctx)?;
                cur.seek(header_pos);
                doc.set_slot(&entry.name, Some(value), None);
            }
            value_pos += entry.value_len;
        }
        cur.seek(value_pos);
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
        let header_len = read_len(cur)?;
        let header_end = cur.offset() + header_len;
        let mut value_pos = header_end;
        let mut found = 0usize;
        while cur.offset() < header_end && found < fields.len() {
            let first = read_varint(cur)?;
            let (matched, tag, value_len) = if first >= 0 {
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
                let value_len = read_len(cur)?;
                let tag = read_tag(cur)?;
                (matched, tag, value_len)
            } else {
                let id = (-first - 1) as u32;
                let prop = ctx
                    .schema
                    .property_by_id(id)
                    .ok_or(Error::UnknownGlobalProperty { id })?;
                let value_len = read_len(cur)?;
                let tag = if prop.tag == TypeTag::Any {
                    read_tag(cur)?
                } else {
                    prop.tag
                };
                let matched = fields
                    .iter()
                    .any(|f| *f == prop.name)
                    .then(|| prop.name.clone());
                (matched, tag, value_len)
            };
            if let Some(name) = matched {
                found += 1;
                if !doc.contains(&name) {
                    if value_len == 0 {
                        doc.set_slot(&name, None, None);
                    } else {
                        let header_pos = cur.offset();
                        cur.seek(value_pos);
                        let value = scalar::read_value(cur, tag, self, ctx)?;
                        cur.seek(header_pos);
                        doc.set_slot(&name, Some(value), None);
                    }
                }
            }
            value_pos += value_len;
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
        let header_len = read_len(cur)?;
        let header_end = cur.offset() + header_len;
        let mut value_pos = header_end;
        while cur.offset() < header_end {
            let first = read_varint(cur)?;
            let (matched, tag, value_len) = if first >= 0 {
                let bytes = cur.read_exact(first as usize)?;
                let matched = bytes.len() == name.len() && bytes == name.as_bytes();
                let value_len = read_len(cur)?;
                let tag = read_tag(cur)?;
                (matched, tag, value_len)
            } else {
                let id = (-first - 1) as u32;
                let prop = ctx
                    .schema
                    .property_by_id(id)
                    .ok_or(Error::UnknownGlobalProperty { id })?;
                let value_len = read_len(cur)?;
                let tag = if prop.tag == TypeTag::Any {
                    read_tag(cur)?
                } else {
                    prop.tag
                };
                (prop.name == name, tag, value_len)
            };
            if matched {
                if value_len == 0 {
                    return Ok(Some(None));
                }
                cur.seek(value_pos);
                return Ok(Some(Some(scalar::read_value(cur, tag, self, ctx)?)));
            }
            value_pos += value_len;
        }
        Ok(None)
    }

    fn field_names(&self, cur: &mut ReadBuffer, ctx: &DecodeContext) -> Result<Vec<String>> {
        scalar::read_string(cur)?;
        let header_len = read_len(cur)?;
        let header_end = cur.offset() + header_len;
        let mut names = Vec::new();
        while cur.offset() < header_end {
            let entry = read_header_entry(cur, ctx)?;
            names.push(entry.name);
        }
        Ok(names)
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
        let header_len = match read_len(cur) {
            Ok(len) => len,
            Err(err) => {
                report.fail(cur.offset(), &err);
                return report;
            }
        };
        let header_end = cur.offset() + header_len;
        let mut value_pos = header_end;
        while cur.offset() < header_end {
            let mut field = FieldReport::default();
            let first = match read_varint(cur) {
                Ok(v) => v,
                Err(err) => {
                    report.fail(cur.offset(), &err);
                    break;
                }
            };
            let parsed: Result<(TypeTag, usize)> = if first >= 0 {
                match cur.read_exact(first as usize) {
                    Ok(bytes) => {
                        field.name = Some(String::from_utf8_lossy(bytes).into_owned());
                        read_len(cur).and_then(|len| Ok((read_tag(cur)?, len)))
                    }
                    Err(err) => Err(err),
                }
            } else {
                let id = (-first - 1) as u32;
                field.global_id = Some(id);
                match ctx.schema.property_by_id(id) {
                    Some(prop) => {
                        field.name = Some(prop.name.clone());
                        read_len(cur).and_then(|len| {
                            let tag = if prop.tag == TypeTag::Any {
                                read_tag(cur)?
                            } else {
                                prop.tag
                            };
                            Ok((tag, len))
                        })
                    }
                    None => Err(Error::UnknownGlobalProperty { id }),
                }
            };
            let (tag, value_len) = match parsed {
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
            if value_len > 0 {
                field.value_offset = Some(value_pos);
                let header_pos = cur.offset();
                cur.seek(value_pos);
                match scalar::read_value(cur, tag, self, ctx) {
                    Ok(value) => field.value = Some(value),
                    Err(err) => {
                        warn!(offset = cur.offset(), "field value unreadable: {err}");
                        field.fail(cur.offset(), &err);
                    }
                }
                cur.seek(header_pos);
                value_pos += value_len;
            }
            report.fields.push(field);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{
        decode_document, decode_document_partial, decode_field, encode_document, field_names,
        EncodeContext, FORMAT_V1,
    };
    use crate::rid::Rid;
    use crate::schema::SchemaSnapshot;

    fn person_doc() -> Document {
        let mut doc = Document::new();
        doc.set("name", "Jon");
        doc.set("age", 20);
        doc.set(
            "tags",
            Value::EmbeddedList(vec![
                Some(Value::String("a".into())),
                Some(Value::String("b".into())),
            ]),
        );
        doc.set("friend", Rid::new(9, 4));
        doc
    }

    #[test]
    fn concrete_layout_starts_with_empty_class_name() {
        let schema = SchemaSnapshot::new();
        let bytes = encode_document(&person_doc(), FORMAT_V1, &EncodeContext::new(&schema)).unwrap();
        assert_eq!(bytes[0], FORMAT_V1);
        // class-name length 0
        assert_eq!(bytes[1], 0);
        // header length varint, then the first entry: the literal name "name"
        let mut cur = ReadBuffer::new(&bytes);
        cur.seek(2);
        let header_len = read_len(&mut cur).unwrap();
        let header_start = cur.offset();
        assert_eq!(bytes[header_start], 8, "zigzag varint of length 4");
        assert_eq!(&bytes[header_start + 1..header_start + 5], b"name");
        // the value region fills the rest of the record
        assert!(header_start + header_len < bytes.len());

        let back = decode_document(&bytes, &DecodeContext::new(&schema)).unwrap();
        assert_eq!(back, person_doc());
    }

    #[test]
    fn partial_decode_equals_full_decode_on_those_fields() {
        let schema = SchemaSnapshot::new();
        let bytes = encode_document(&person_doc(), FORMAT_V1, &EncodeContext::new(&schema)).unwrap();
        let ctx = DecodeContext::new(&schema);
        let full = decode_document(&bytes, &ctx).unwrap();
        let partial = decode_document_partial(&bytes, &["age", "friend"], &ctx).unwrap();
        assert_eq!(partial.len(), 2);
        assert_eq!(partial.get("age"), full.get("age"));
        assert_eq!(partial.get("friend"), full.get("friend"));
        assert!(!partial.contains("name"));
    }

    #[test]
    fn field_listing_never_reads_the_value_region() {
        let schema = SchemaSnapshot::new();
        let bytes = encode_document(&person_doc(), FORMAT_V1, &EncodeContext::new(&schema)).unwrap();
        let ctx = DecodeContext::new(&schema);
        let names = field_names(&bytes, &ctx).unwrap();
        assert_eq!(names, vec!["name", "age", "tags", "friend"]);

        // chop the whole value region off; listing still works
        let full = decode_document(&bytes, &ctx).unwrap();
        let mut truncated = bytes.clone();
        let shortest = encode_document(&Document::new(), FORMAT_V1, &EncodeContext::new(&schema))
            .unwrap()
            .len();
        assert!(full.len() > 0 && truncated.len() > shortest);
        // find the value region start: header length varint is bytes[2..]
        let mut cur = ReadBuffer::new(&bytes);
        cur.seek(2);
        let header_len = read_len(&mut cur).unwrap();
        truncated.truncate(cur.offset() + header_len);
        assert_eq!(field_names(&truncated, &ctx).unwrap(), names);
    }

    #[test]
    fn typed_field_extraction_distinguishes_null_and_missing() {
        let schema = SchemaSnapshot::new();
        let mut doc = person_doc();
        doc.set_null("nickname");
        let bytes = encode_document(&doc, FORMAT_V1, &EncodeContext::new(&schema)).unwrap();
        let ctx = DecodeContext::new(&schema);

        assert_eq!(
            decode_field(&bytes, "age", &ctx).unwrap(),
            Some(Some(Value::Integer(20)))
        );
        assert_eq!(decode_field(&bytes, "nickname", &ctx).unwrap(), Some(None));
        assert_eq!(decode_field(&bytes, "salary", &ctx).unwrap(), None);
    }

    #[test]
    fn global_properties_shrink_the_record() {
        let mut schema = SchemaSnapshot::new();
        schema.define(0, "name", TypeTag::String);
        schema.define(1, "age", TypeTag::Integer);
        schema.define(2, "tags", TypeTag::EmbeddedList);
        schema.define(3, "friend", TypeTag::Link);
        let bare = SchemaSnapshot::new();

        let doc = person_doc();
        let with_props = encode_document(&doc, FORMAT_V1, &EncodeContext::new(&schema)).unwrap();
        let named = encode_document(&doc, FORMAT_V1, &EncodeContext::new(&bare)).unwrap();
        assert!(
            with_props.len() < named.len(),
            "{} vs {}",
            with_props.len(),
            named.len()
        );

        let back = decode_document(&with_props, &DecodeContext::new(&schema)).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn unknown_global_property_fails_decoding() {
        let mut schema = SchemaSnapshot::new();
        schema.define(5, "name", TypeTag::String);
        let mut doc = Document::new();
        doc.set("name", "x");
        let bytes = encode_document(&doc, FORMAT_V1, &EncodeContext::new(&schema)).unwrap();

        let empty = SchemaSnapshot::new();
        assert!(matches!(
            decode_document(&bytes, &DecodeContext::new(&empty)),
            Err(Error::UnknownGlobalProperty { id: 5 })
        ));
    }

    #[test]
    fn transient_fields_are_not_written() {
        let schema = SchemaSnapshot::new();
        let mut doc = Document::new();
        doc.set("kept", 1);
        doc.set_typed("scratch", Some(Value::Integer(2)), TypeTag::Transient);
        let bytes = encode_document(&doc, FORMAT_V1, &EncodeContext::new(&schema)).unwrap();
        let back = decode_document(&bytes, &DecodeContext::new(&schema)).unwrap();
        assert!(back.contains("kept"));
        assert!(!back.contains("scratch"));
    }

    #[test]
    fn nested_embedded_documents_round_trip() {
        let schema = SchemaSnapshot::new();
        let mut inner = Document::with_class("Address");
        inner.set("city", "Reykjavík");
        let mut doc = Document::with_class("Person");
        doc.set("name", "Jon");
        doc.set("home", Value::Embedded(inner.clone()));
        let bytes = encode_document(&doc, FORMAT_V1, &EncodeContext::new(&schema)).unwrap();
        let back = decode_document(&bytes, &DecodeContext::new(&schema)).unwrap();
        assert_eq!(back.get("home").unwrap().as_document(), Some(&inner));
    }

    #[test]
    fn declared_short_keeps_its_width_on_the_wire() {
        let schema = SchemaSnapshot::new();
        let mut doc = Document::new();
        doc.set_typed("count", Some(Value::Short(12)), TypeTag::Short);
        let bytes = encode_document(&doc, FORMAT_V1, &EncodeContext::new(&schema)).unwrap();
        let back = decode_document(&bytes, &DecodeContext::new(&schema)).unwrap();
        assert_eq!(back.get("count"), Some(&Value::Short(12)));
    }

    #[test]
    fn debug_walk_reports_corrupted_value_but_lists_all_fields() {
        let schema = SchemaSnapshot::new();
        let mut doc = Document::new();
        doc.set("first", "hello");
        doc.set("second", 7);
        let mut bytes =
            encode_document(&doc, FORMAT_V1, &EncodeContext::new(&schema)).unwrap();
        // find the value region and corrupt the first value's string length
        let mut cur = ReadBuffer::new(&bytes);
        cur.seek(2);
        let header_len = read_len(&mut cur).unwrap();
        let values_start = cur.offset() + header_len;
        bytes[values_start] = 0x80; // truncated varint

        let report = crate::registry::decode_debug(&bytes, &DecodeContext::new(&schema));
        assert_eq!(report.fields.len(), 2);
        assert!(report.fields[0].failure.is_some());
        assert_eq!(report.fields[1].value, Some(Value::Integer(7)));
        assert!(!report.is_clean());
        assert!(report.failure.is_none());
    }
}

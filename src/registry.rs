//! Versioned format dispatch and the top-level codec API.
//!
//! Every serialized record starts with one discriminator byte: `0` and `1`
//! select a document format, `10` marks a delta stream. The byte stays in
//! the buffer during decoding, so format V0's absolute value pointers are
//! offsets into the full record.

use tracing::trace;

use crate::bag::{NoTreeStore, TreeStore};
use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::debug::DecodeReport;
use crate::delta;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::rid::{LinkResolver, NoResolver, ResolvePolicy};
use crate::schema::SchemaSnapshot;
use crate::track::DocumentChanges;
use crate::v0::V0Format;
use crate::v1::V1Format;
use crate::value::Value;

pub const FORMAT_V0: u8 = 0;
pub const FORMAT_V1: u8 = 1;
pub const CURRENT_FORMAT: u8 = FORMAT_V1;
/// Record-type byte for delta streams and flat snapshots.
pub const DELTA_RECORD: u8 = 10;

/// Collaborators threaded through every encode.
pub struct EncodeContext<'a> {
    pub schema: &'a SchemaSnapshot,
    pub resolver: &'a dyn LinkResolver,
    pub tree: &'a dyn TreeStore,
    pub policy: ResolvePolicy,
}

impl<'a> EncodeContext<'a> {
    pub fn new(schema: &'a SchemaSnapshot) -> Self {
        EncodeContext {
            schema,
            resolver: &NoResolver,
            tree: &NoTreeStore,
            policy: ResolvePolicy::default(),
        }
    }

    pub fn with_resolver(mut self, resolver: &'a dyn LinkResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_tree(mut self, tree: &'a dyn TreeStore) -> Self {
        self.tree = tree;
        self
    }

    pub fn with_policy(mut self, policy: ResolvePolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Collaborators threaded through every decode.
pub struct DecodeContext<'a> {
    pub schema: &'a SchemaSnapshot,
    pub resolver: &'a dyn LinkResolver,
    pub tree: &'a dyn TreeStore,
}

impl<'a> DecodeContext<'a> {
    pub fn new(schema: &'a SchemaSnapshot) -> Self {
        DecodeContext {
            schema,
            resolver: &NoResolver,
            tree: &NoTreeStore,
        }
    }

    pub fn with_resolver(mut self, resolver: &'a dyn LinkResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_tree(mut self, tree: &'a dyn TreeStore) -> Self {
        self.tree = tree;
        self
    }
}

/// One wire layout for whole documents. Implementations are stateless;
/// the version byte has already been consumed when these run, but cursors
/// keep absolute offsets over the full record.
pub trait DocumentFormat {
    fn version(&self) -> u8;

    fn serialize(&self, buf: &mut WriteBuffer, doc: &Document, ctx: &EncodeContext) -> Result<()>;

    /// Full decode. Leaves the cursor exactly past the document, which is
    /// what lets embedded documents nest.
    fn deserialize(
        &self,
        cur: &mut ReadBuffer,
        doc: &mut Document,
        ctx: &DecodeContext,
    ) -> Result<()>;

    /// Decodes only the named fields; already-present fields are skipped.
    fn deserialize_partial(
        &self,
        cur: &mut ReadBuffer,
        doc: &mut Document,
        fields: &[&str],
        ctx: &DecodeContext,
    ) -> Result<()>;

    /// Single-field extraction. `None` means absent; `Some(None)` means
    /// present but null.
    fn deserialize_field(
        &self,
        cur: &mut ReadBuffer,
        name: &str,
        ctx: &DecodeContext,
    ) -> Result<Option<Option<Value>>>;

    /// Header-only field name listing; never touches the value region.
    fn field_names(&self, cur: &mut ReadBuffer, ctx: &DecodeContext) -> Result<Vec<String>>;

    /// Forensic walk: records per-field outcomes instead of failing fast.
    fn debug_walk(&self, cur: &mut ReadBuffer, ctx: &DecodeContext) -> DecodeReport;
}

fn format_for(version: u8) -> Result<&'static dyn DocumentFormat> {
    match version {
        FORMAT_V0 => Ok(&V0Format),
        FORMAT_V1 => Ok(&V1Format),
        other => Err(Error::UnknownVersion(other)),
    }
}

pub fn encode_document(doc: &Document, version: u8, ctx: &EncodeContext) -> Result<Vec<u8>> {
    let fmt = format_for(version)?;
    let mut buf = WriteBuffer::new();
    buf.push(version);
    fmt.serialize(&mut buf, doc, ctx)?;
    trace!(version, bytes = buf.offset(), "encoded document");
    Ok(buf.into_bytes())
}

pub fn decode_document(bytes: &[u8], ctx: &DecodeContext) -> Result<Document> {
    let mut cur = ReadBuffer::new(bytes);
    let version = cur.read_u8()?;
    let fmt = format_for(version)?;
    let mut doc = Document::new();
    fmt.deserialize(&mut cur, &mut doc, ctx)?;
    trace!(version, fields = doc.len(), "decoded document");
    Ok(doc)
}

pub fn decode_document_partial(
    bytes: &[u8],
    fields: &[&str],
    ctx: &DecodeContext,
) -> Result<Document> {
    let mut cur = ReadBuffer::new(bytes);
    let version = cur.read_u8()?;
    let fmt = format_for(version)?;
    let mut doc = Document::new();
    fmt.deserialize_partial(&mut cur, &mut doc, fields, ctx)?;
    Ok(doc)
}

/// Extracts one field without materializing the rest of the record.
pub fn decode_field(bytes: &[u8], name: &str, ctx: &DecodeContext) -> Result<Option<Option<Value>>> {
    let mut cur = ReadBuffer::new(bytes);
    let version = cur.read_u8()?;
    let fmt = format_for(version)?;
    fmt.deserialize_field(&mut cur, name, ctx)
}

pub fn field_names(bytes: &[u8], ctx: &DecodeContext) -> Result<Vec<String>> {
    let mut cur = ReadBuffer::new(bytes);
    let version = cur.read_u8()?;
    let fmt = format_for(version)?;
    fmt.field_names(&mut cur, ctx)
}

/// Walks a possibly corrupted record, reporting whatever could be read.
pub fn decode_debug(bytes: &[u8], ctx: &DecodeContext) -> DecodeReport {
    let mut report = DecodeReport::default();
    let mut cur = ReadBuffer::new(bytes);
    let version = match cur.read_u8() {
        Ok(v) => v,
        Err(err) => {
            report.fail(0, &err);
            return report;
        }
    };
    report.version = Some(version);
    match format_for(version) {
        Ok(fmt) => {
            let mut walked = fmt.debug_walk(&mut cur, ctx);
            walked.version = Some(version);
            walked
        }
        Err(err) => {
            report.fail(0, &err);
            report
        }
    }
}

/// Encodes a change log for a document, tagged as a delta record.
pub fn encode_delta(
    doc: &Document,
    changes: &DocumentChanges,
    ctx: &EncodeContext,
) -> Result<Vec<u8>> {
    let mut buf = WriteBuffer::new();
    buf.push(DELTA_RECORD);
    delta::serialize_delta_into(&mut buf, doc, changes, ctx)?;
    trace!(bytes = buf.offset(), changes = changes.fields.len(), "encoded delta");
    Ok(buf.into_bytes())
}

/// Replays a delta record onto a local document copy.
pub fn apply_delta(bytes: &[u8], doc: &mut Document, ctx: &DecodeContext) -> Result<()> {
    let mut cur = ReadBuffer::new(bytes);
    let version = cur.read_u8()?;
    if version != DELTA_RECORD {
        return Err(Error::UnknownVersion(version));
    }
    delta::deserialize_delta_into(&mut cur, doc, ctx)
}

/// Encodes a whole document in the flat snapshot layout used alongside
/// deltas for replication.
pub fn encode_snapshot(doc: &Document, ctx: &EncodeContext) -> Result<Vec<u8>> {
    let mut buf = WriteBuffer::new();
    buf.push(DELTA_RECORD);
    delta::serialize_snapshot_into(&mut buf, doc, ctx)?;
    Ok(buf.into_bytes())
}

pub fn decode_snapshot(bytes: &[u8], ctx: &DecodeContext) -> Result<Document> {
    let mut cur = ReadBuffer::new(bytes);
    let version = cur.read_u8()?;
    if version != DELTA_RECORD {
        return Err(Error::UnknownVersion(version));
    }
    let mut doc = Document::new();
    delta::deserialize_snapshot_into(&mut cur, &mut doc, ctx)?;
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rid::Rid;

    #[test]
    fn unknown_version_is_rejected() {
        let schema = SchemaSnapshot::new();
        let ctx = DecodeContext::new(&schema);
        assert!(matches!(
            decode_document(&[9, 0], &ctx),
            Err(Error::UnknownVersion(9))
        ));
    }

    #[test]
    fn empty_input_is_rejected() {
        let schema = SchemaSnapshot::new();
        let ctx = DecodeContext::new(&schema);
        assert!(matches!(
            decode_document(&[], &ctx),
            Err(Error::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn both_formats_round_trip_the_same_document() {
        let schema = SchemaSnapshot::new();
        let mut doc = Document::with_class("Person");
        doc.set("name", "Jon");
        doc.set("age", 20);
        doc.set("friend", Rid::new(9, 4));
        doc.set_null("nickname");

        for version in [FORMAT_V0, FORMAT_V1] {
            let bytes =
                encode_document(&doc, version, &EncodeContext::new(&schema)).unwrap();
            assert_eq!(bytes[0], version);
            let back = decode_document(&bytes, &DecodeContext::new(&schema)).unwrap();
            assert_eq!(back, doc, "version {version}");
        }
    }

    #[test]
    fn four_levels_of_embedded_documents_round_trip() {
        let schema = SchemaSnapshot::new();
        let mut level4 = Document::with_class("Leaf");
        level4.set("depth", 4);
        let mut level3 = Document::new();
        level3.set("depth", 3);
        level3.set("child", Value::Embedded(level4));
        let mut level2 = Document::new();
        level2.set("depth", 2);
        level2.set("child", Value::Embedded(level3));
        let mut doc = Document::with_class("Root");
        doc.set("depth", 1);
        doc.set("child", Value::Embedded(level2));
        // a trailing field catches a cursor left inside the nested region
        doc.set("after", "tail");

        for version in [FORMAT_V0, FORMAT_V1] {
            let bytes =
                encode_document(&doc, version, &EncodeContext::new(&schema)).unwrap();
            let back = decode_document(&bytes, &DecodeContext::new(&schema)).unwrap();
            assert_eq!(back, doc, "version {version}");
        }
    }

    #[test]
    fn random_scalar_documents_round_trip_in_both_formats() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);
        let schema = SchemaSnapshot::new();
        for _ in 0..50 {
            let mut doc = Document::new();
            let fields = rng.gen_range(0..8);
            for i in 0..fields {
                let name = format!("f{i}");
                match rng.gen_range(0..5) {
                    0 => doc.set(&name, rng.gen::<i64>()),
                    1 => doc.set(&name, rng.gen::<i32>()),
                    2 => doc.set(&name, rng.gen::<bool>()),
                    3 => doc.set(&name, Rid::new(rng.gen_range(0..64), rng.gen_range(0..1 << 40))),
                    _ => doc.set_null(&name),
                }
            }
            for version in [FORMAT_V0, FORMAT_V1] {
                let bytes =
                    encode_document(&doc, version, &EncodeContext::new(&schema)).unwrap();
                let back = decode_document(&bytes, &DecodeContext::new(&schema)).unwrap();
                assert_eq!(back, doc, "version {version}");
            }
        }
    }

    #[test]
    fn delta_record_is_not_a_document() {
        let schema = SchemaSnapshot::new();
        let doc = Document::new();
        let bytes = encode_delta(
            &doc,
            &DocumentChanges::new(),
            &EncodeContext::new(&schema),
        )
        .unwrap();
        assert_eq!(bytes[0], DELTA_RECORD);
        assert!(matches!(
            decode_document(&bytes, &DecodeContext::new(&schema)),
            Err(Error::UnknownVersion(DELTA_RECORD))
        ));
    }
}

//! Binary serialization for schemaful, link-bearing documents.
//!
//! `docpack` encodes documents (ordered maps of typed fields, optionally
//! bound to a class) into compact, versioned binary records, and decodes
//! them whole or piecemeal. Two record layouts coexist behind one version
//! byte:
//!
//! - **V1** (current): a length-prefixed header of field entries followed
//!   by a contiguous value region. Entry lengths let readers skip straight
//!   to one field's bytes without touching the rest.
//! - **V0** (legacy): field entries interleaved with absolute value
//!   pointers, terminated by a zero varint. Still fully readable and
//!   writable.
//!
//! Records bound to a schema snapshot can replace field names and type
//! bytes with negated global property ids, shrinking every record that
//! uses a declared property.
//!
//! # Reading less than everything
//!
//! [`decode_field`] pulls a single value out of a record and
//! [`decode_document_partial`] materializes a chosen subset, both without
//! decoding unrelated fields. [`field_names`] lists a record's fields from
//! the header alone, and [`decode_debug`] walks a possibly corrupted
//! record, reporting per-field outcomes instead of failing on the first
//! bad byte.
//!
//! # Links and bags
//!
//! Fields can reference other records by [`Rid`]. Temporary identities
//! assigned before a transaction commits are rewritten through a
//! [`LinkResolver`] at encode time. Many-link fields use [`RidBag`], which
//! stores small collections inline and spills large ones into an external
//! tree, carrying only a pointer and a pending change-set in the record.
//!
//! # Deltas
//!
//! [`encode_delta`] serializes an explicit change log ([`DocumentChanges`])
//! instead of the whole document; [`apply_delta`] replays it onto another
//! copy. Container mutations travel as ordered event logs that recurse
//! into nested elements, and bag mutations replay their add/remove
//! timeline.
//!
//! ```
//! use docpack::{
//!     decode_document, encode_document, Document, EncodeContext, DecodeContext,
//!     Rid, SchemaSnapshot, CURRENT_FORMAT,
//! };
//!
//! # fn main() -> docpack::Result<()> {
//! let schema = SchemaSnapshot::new();
//! let mut doc = Document::with_class("Person");
//! doc.set("name", "Jon");
//! doc.set("age", 20);
//! doc.set("friend", Rid::new(9, 4));
//!
//! let bytes = encode_document(&doc, CURRENT_FORMAT, &EncodeContext::new(&schema))?;
//! let back = decode_document(&bytes, &DecodeContext::new(&schema))?;
//! assert_eq!(back, doc);
//! # Ok(())
//! # }
//! ```

mod bag;
mod buffer;
mod debug;
mod decimal;
mod delta;
mod document;
mod error;
mod registry;
mod rid;
mod scalar;
mod schema;
mod track;
mod typetag;
mod v0;
mod v1;
mod value;
mod varint;

pub use bag::{
    BagChange, BagChangeKind, BagEvent, BagPointer, BagRepr, NoTreeStore, RidBag, TreeStore,
    NO_SYNC_ID,
};
pub use buffer::{ReadBuffer, WriteBuffer};
pub use debug::{DecodeFailure, DecodeReport, FieldReport};
pub use document::{Document, FieldSlot};
pub use error::{Error, Result};
pub use registry::{
    apply_delta, decode_debug, decode_document, decode_document_partial, decode_field,
    decode_snapshot, encode_delta, encode_document, encode_snapshot, field_names, DecodeContext,
    DocumentFormat, EncodeContext, CURRENT_FORMAT, DELTA_RECORD, FORMAT_V0, FORMAT_V1,
};
pub use rid::{LinkResolver, NoResolver, ResolvePolicy, Rid};
pub use schema::{GlobalProperty, SchemaSnapshot};
pub use track::{
    ChangeEvent, ChangedPayload, ContainerChanges, DocumentChanges, FieldChange, NestedKey,
};
pub use typetag::TypeTag;
pub use value::Value;

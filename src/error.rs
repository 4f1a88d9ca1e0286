use crate::rid::Rid;
use crate::typetag::TypeTag;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors raised while encoding or decoding documents and deltas.
///
/// Format errors carry the byte offset at which decoding went wrong, so a
/// corrupted record can be located in the raw bytes. Resolution errors are
/// separate variants so callers (notably the debug walker) can treat them
/// as per-field conditions instead of aborting the whole record.
#[derive(Debug, Error)]
pub enum Error {
    /// The input ended before a complete value could be read.
    #[error("unexpected end of input at offset {offset}, needed {needed} more byte(s)")]
    UnexpectedEof { offset: usize, needed: usize },

    /// A variable-length integer was truncated or overlong.
    #[error("malformed varint at offset {offset}")]
    BadVarInt { offset: usize },

    /// A length or count field decoded to a negative value.
    #[error("negative length {len} at offset {offset}")]
    BadLength { len: i64, offset: usize },

    /// The byte at the given offset is not a known type tag.
    #[error("unknown type tag {tag:#04x} at offset {offset}")]
    UnknownTypeTag { tag: u8, offset: usize },

    /// The leading discriminator byte selects no known serializer version.
    #[error("unknown serializer version {0}")]
    UnknownVersion(u8),

    /// A length-prefixed string was not valid UTF-8.
    #[error("invalid UTF-8 in string at offset {offset}")]
    BadString { offset: usize },

    /// A decimal payload cannot be represented (unscaled part too wide).
    #[error("decimal value out of range at offset {offset}")]
    BadDecimal { offset: usize },

    /// A date or datetime payload was outside the representable range.
    #[error("temporal value out of range at offset {offset}")]
    BadTemporal { offset: usize },

    /// No global property is registered under the negated header id.
    #[error("no global property registered for id {id}")]
    UnknownGlobalProperty { id: u32 },

    /// A temporary link could not be swapped for a durable identity under
    /// the strict resolution policy.
    #[error("link {0} has no durable identity")]
    UnresolvedLink(Rid),

    /// A runtime value has no semantic type mapping.
    #[error("cannot serialize value of kind {0}")]
    UnserializableValue(&'static str),

    /// Incremental payloads exist only for the structured container kinds.
    #[error("delta encoding is not supported for type {0}")]
    DeltaUnsupported(TypeTag),

    /// A change record's shape does not match the container family it
    /// targets, or it addresses an element that is not there.
    #[error("malformed change record: {0}")]
    BadChangeRecord(&'static str),
}

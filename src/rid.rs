//! Record identifiers and link encoding.
//!
//! A link is a `(cluster, position)` pair written as two varints. The pair
//! `(-2, -2)` is the null-link sentinel; positions below `-1` mark
//! temporary identities that a resolver may swap for durable ones at
//! encode time.

use std::fmt;

use crate::buffer::{ReadBuffer, WriteBuffer};
use crate::error::{Error, Result};
use crate::varint::{read_varint, read_varint_i32, write_varint};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Rid {
    pub cluster: i32,
    pub position: i64,
}

impl Rid {
    /// Wire sentinel standing for an absent link.
    pub const NULL: Rid = Rid {
        cluster: -2,
        position: -2,
    };

    pub fn new(cluster: i32, position: i64) -> Self {
        Rid { cluster, position }
    }

    /// A not-yet-persisted identity handed out inside a transaction.
    pub fn is_temporary(&self) -> bool {
        self.position < -1
    }

    pub fn is_persistent(&self) -> bool {
        self.cluster > -1 && self.position > -1
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}:{}", self.cluster, self.position)
    }
}

/// Maps temporary record identities to their durable ones.
///
/// Typically backed by the transaction that created the temporary records.
pub trait LinkResolver {
    fn current_identity(&self, rid: Rid) -> Option<Rid>;
}

/// Resolver for contexts with no transaction in flight.
pub struct NoResolver;

impl LinkResolver for NoResolver {
    fn current_identity(&self, _rid: Rid) -> Option<Rid> {
        None
    }
}

/// What to do when a temporary link cannot be resolved at encode time.
///
/// `Lenient` writes the temporary identity as-is (wire transfer, where the
/// peer resolves it later); `Strict` fails the encode (durable storage,
/// where a temporary identity must never hit disk).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ResolvePolicy {
    Lenient,
    #[default]
    Strict,
}

/// Writes a link, resolving temporary identities first.
pub fn write_link(
    buf: &mut WriteBuffer,
    link: Option<Rid>,
    resolver: &dyn LinkResolver,
    policy: ResolvePolicy,
) -> Result<()> {
    let rid = match link {
        None => Rid::NULL,
        Some(rid) if rid.is_temporary() && rid != Rid::NULL => {
            match resolver.current_identity(rid) {
                Some(durable) => durable,
                None => match policy {
                    ResolvePolicy::Lenient => rid,
                    ResolvePolicy::Strict => return Err(Error::UnresolvedLink(rid)),
                },
            }
        }
        Some(rid) => rid,
    };
    write_varint(buf, i64::from(rid.cluster));
    write_varint(buf, rid.position);
    Ok(())
}

/// Reads a link; the null sentinel decodes to `None`. Temporary identities
/// are refreshed through the resolver when it knows a durable one.
pub fn read_link(cur: &mut ReadBuffer, resolver: &dyn LinkResolver) -> Result<Option<Rid>> {
    let cluster = read_varint_i32(cur)?;
    let position = read_varint(cur)?;
    let rid = Rid { cluster, position };
    if rid == Rid::NULL {
        return Ok(None);
    }
    if rid.is_temporary() {
        if let Some(durable) = resolver.current_identity(rid) {
            return Ok(Some(durable));
        }
    }
    Ok(Some(rid))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapResolver(Rid, Rid);

    impl LinkResolver for MapResolver {
        fn current_identity(&self, rid: Rid) -> Option<Rid> {
            (rid == self.0).then_some(self.1)
        }
    }

    #[test]
    fn null_round_trips_as_sentinel() {
        let mut buf = WriteBuffer::new();
        write_link(&mut buf, None, &NoResolver, ResolvePolicy::Strict).unwrap();
        let bytes = buf.into_bytes();
        let mut cur = ReadBuffer::new(&bytes);
        assert_eq!(read_link(&mut cur, &NoResolver).unwrap(), None);
    }

    #[test]
    fn persistent_link_round_trips() {
        let rid = Rid::new(12, 8_000_000_000);
        let mut buf = WriteBuffer::new();
        write_link(&mut buf, Some(rid), &NoResolver, ResolvePolicy::Strict).unwrap();
        let bytes = buf.into_bytes();
        let mut cur = ReadBuffer::new(&bytes);
        assert_eq!(read_link(&mut cur, &NoResolver).unwrap(), Some(rid));
    }

    #[test]
    fn strict_rejects_unresolvable_temporary() {
        let temp = Rid::new(3, -7);
        let mut buf = WriteBuffer::new();
        let err = write_link(&mut buf, Some(temp), &NoResolver, ResolvePolicy::Strict).unwrap_err();
        assert!(matches!(err, Error::UnresolvedLink(r) if r == temp));
    }

    #[test]
    fn lenient_writes_temporary_as_is() {
        let temp = Rid::new(3, -7);
        let mut buf = WriteBuffer::new();
        write_link(&mut buf, Some(temp), &NoResolver, ResolvePolicy::Lenient).unwrap();
        let bytes = buf.into_bytes();
        let mut cur = ReadBuffer::new(&bytes);
        assert_eq!(read_link(&mut cur, &NoResolver).unwrap(), Some(temp));
    }

    #[test]
    fn resolver_swaps_temporary_for_durable() {
        let temp = Rid::new(3, -7);
        let durable = Rid::new(3, 41);
        let resolver = MapResolver(temp, durable);

        let mut buf = WriteBuffer::new();
        write_link(&mut buf, Some(temp), &resolver, ResolvePolicy::Strict).unwrap();
        let bytes = buf.into_bytes();
        let mut cur = ReadBuffer::new(&bytes);
        assert_eq!(read_link(&mut cur, &NoResolver).unwrap(), Some(durable));

        // decode-side refresh
        let mut buf = WriteBuffer::new();
        write_link(&mut buf, Some(temp), &NoResolver, ResolvePolicy::Lenient).unwrap();
        let bytes = buf.into_bytes();
        let mut cur = ReadBuffer::new(&bytes);
        assert_eq!(read_link(&mut cur, &resolver).unwrap(), Some(durable));
    }

    #[test]
    fn temporary_detection() {
        assert!(Rid::new(1, -2).is_temporary());
        assert!(!Rid::new(1, -1).is_temporary());
        assert!(Rid::new(1, 5).is_persistent());
        assert!(!Rid::NULL.is_persistent());
    }
}

//! Hybrid reference collections.
//!
//! A `RidBag` holds many links in one of two representations: small bags
//! embed their entries directly in the owning document; large bags live in
//! an external tree and the document only carries a pointer plus a pending
//! change-set that has not been merged into the tree yet. The owner does
//! not see representation switches; codecs must handle both.

use uuid::Uuid;

use crate::rid::Rid;

/// Sync id meaning "no concurrent synchronization in progress".
pub const NO_SYNC_ID: Uuid = Uuid::from_u64_pair(u64::MAX, u64::MAX);

/// Location of a tree-backed bag in external storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BagPointer {
    pub file_id: i64,
    pub page_index: i64,
    pub page_offset: i32,
}

impl BagPointer {
    /// All-`-1` pointer standing for "no tree allocated yet".
    pub const INVALID: BagPointer = BagPointer {
        file_id: -1,
        page_index: -1,
        page_offset: -1,
    };

    pub fn new(file_id: i64, page_index: i64, page_offset: i32) -> Self {
        BagPointer {
            file_id,
            page_index,
            page_offset,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.file_id >= 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum BagChangeKind {
    /// Adjust the reference count by a signed delta.
    Diff = 0,
    /// Set the reference count outright.
    Absolute = 1,
}

impl BagChangeKind {
    pub fn from_u8(byte: u8) -> Option<BagChangeKind> {
        match byte {
            0 => Some(BagChangeKind::Diff),
            1 => Some(BagChangeKind::Absolute),
            _ => None,
        }
    }
}

/// A pending per-link adjustment not yet merged into the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BagChange {
    pub kind: BagChangeKind,
    pub value: i32,
}

impl BagChange {
    pub fn diff(value: i32) -> Self {
        BagChange {
            kind: BagChangeKind::Diff,
            value,
        }
    }

    pub fn absolute(value: i32) -> Self {
        BagChange {
            kind: BagChangeKind::Absolute,
            value,
        }
    }

    pub fn apply(&self, current: i32) -> i32 {
        match self.kind {
            BagChangeKind::Diff => current + self.value,
            BagChangeKind::Absolute => self.value,
        }
    }
}

/// One bag mutation, in the order it happened. The delta codec replays
/// this log on the remote copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BagEvent {
    Add(Rid),
    Remove(Rid),
}

#[derive(Clone, Debug, PartialEq)]
pub enum BagRepr {
    Embedded {
        entries: Vec<Option<Rid>>,
    },
    Tree {
        pointer: Option<BagPointer>,
        size: i32,
        changes: Vec<(Rid, BagChange)>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RidBag {
    repr: BagRepr,
    sync_id: Option<Uuid>,
    timeline: Vec<BagEvent>,
}

impl RidBag {
    pub fn embedded() -> Self {
        RidBag {
            repr: BagRepr::Embedded {
                entries: Vec::new(),
            },
            sync_id: None,
            timeline: Vec::new(),
        }
    }

    pub fn embedded_with(entries: Vec<Option<Rid>>) -> Self {
        RidBag {
            repr: BagRepr::Embedded { entries },
            sync_id: None,
            timeline: Vec::new(),
        }
    }

    pub fn tree(pointer: Option<BagPointer>, size: i32, changes: Vec<(Rid, BagChange)>) -> Self {
        RidBag {
            repr: BagRepr::Tree {
                pointer,
                size,
                changes,
            },
            sync_id: None,
            timeline: Vec::new(),
        }
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self.repr, BagRepr::Embedded { .. })
    }

    pub fn repr(&self) -> &BagRepr {
        &self.repr
    }

    pub fn size(&self) -> usize {
        match &self.repr {
            BagRepr::Embedded { entries } => entries.len(),
            BagRepr::Tree { size, .. } => (*size).max(0) as usize,
        }
    }

    pub fn entries(&self) -> Option<&[Option<Rid>]> {
        match &self.repr {
            BagRepr::Embedded { entries } => Some(entries),
            BagRepr::Tree { .. } => None,
        }
    }

    pub fn pointer(&self) -> Option<BagPointer> {
        match &self.repr {
            BagRepr::Tree { pointer, .. } => *pointer,
            BagRepr::Embedded { .. } => None,
        }
    }

    pub fn sync_id(&self) -> Option<Uuid> {
        self.sync_id
    }

    pub fn set_sync_id(&mut self, sync_id: Option<Uuid>) {
        self.sync_id = sync_id;
    }

    /// Adds a link and logs the mutation.
    pub fn add(&mut self, rid: Rid) {
        match &mut self.repr {
            BagRepr::Embedded { entries } => entries.push(Some(rid)),
            BagRepr::Tree { size, changes, .. } => {
                *size += 1;
                changes.push((rid, BagChange::diff(1)));
            }
        }
        self.timeline.push(BagEvent::Add(rid));
    }

    /// Removes one occurrence of a link and logs the mutation.
    pub fn remove(&mut self, rid: Rid) {
        match &mut self.repr {
            BagRepr::Embedded { entries } => {
                if let Some(at) = entries.iter().position(|e| *e == Some(rid)) {
                    entries.remove(at);
                }
            }
            BagRepr::Tree { size, changes, .. } => {
                *size = (*size - 1).max(0);
                changes.push((rid, BagChange::diff(-1)));
            }
        }
        self.timeline.push(BagEvent::Remove(rid));
    }

    pub fn timeline(&self) -> &[BagEvent] {
        &self.timeline
    }

    pub fn clear_timeline(&mut self) {
        self.timeline.clear();
    }

    /// Forces this bag into the given representation so both replicas
    /// converge. Tree-to-embedded materializes entries through the store;
    /// embedded-to-tree keeps the entries as a pending change-set until a
    /// tree is allocated.
    pub fn force_embedded(&mut self, store: &dyn TreeStore) {
        if let BagRepr::Tree { pointer, .. } = &self.repr {
            let entries = pointer
                .as_ref()
                .and_then(|p| store.resolve_pointer(p))
                .unwrap_or_default();
            self.repr = BagRepr::Embedded {
                entries: entries.into_iter().map(Some).collect(),
            };
        }
    }

    pub fn force_tree(&mut self) {
        if let BagRepr::Embedded { entries } = &self.repr {
            let changes: Vec<(Rid, BagChange)> = entries
                .iter()
                .flatten()
                .map(|rid| (*rid, BagChange::diff(1)))
                .collect();
            let size = changes.len() as i32;
            self.repr = BagRepr::Tree {
                pointer: None,
                size,
                changes,
            };
        }
    }
}

/// External tree storage consulted by the codecs.
pub trait TreeStore {
    /// Materializes the links a tree pointer refers to, if the tree exists.
    fn resolve_pointer(&self, pointer: &BagPointer) -> Option<Vec<Rid>>;

    /// Allocates or reuses a synchronization id for a bag about to be
    /// shipped to another replica.
    fn sync_id_for(&self, current: Option<Uuid>) -> Option<Uuid>;
}

/// Store for contexts without external trees (embedded-only deployments).
pub struct NoTreeStore;

impl TreeStore for NoTreeStore {
    fn resolve_pointer(&self, _pointer: &BagPointer) -> Option<Vec<Rid>> {
        None
    }

    fn sync_id_for(&self, current: Option<Uuid>) -> Option<Uuid> {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_add_remove_keeps_timeline() {
        let mut bag = RidBag::embedded();
        let a = Rid::new(1, 1);
        let b = Rid::new(1, 2);
        bag.add(a);
        bag.add(b);
        bag.remove(a);
        assert_eq!(bag.entries().unwrap(), &[Some(b)]);
        assert_eq!(
            bag.timeline(),
            &[BagEvent::Add(a), BagEvent::Add(b), BagEvent::Remove(a)]
        );
    }

    #[test]
    fn tree_mutations_accumulate_changes() {
        let mut bag = RidBag::tree(Some(BagPointer::new(4, 9, 128)), 10, Vec::new());
        let rid = Rid::new(7, 3);
        bag.add(rid);
        bag.remove(rid);
        assert_eq!(bag.size(), 10);
        match bag.repr() {
            BagRepr::Tree { changes, .. } => {
                assert_eq!(
                    changes,
                    &[(rid, BagChange::diff(1)), (rid, BagChange::diff(-1))]
                );
            }
            other => panic!("unexpected repr: {other:?}"),
        }
    }

    #[test]
    fn change_application() {
        assert_eq!(BagChange::diff(-2).apply(5), 3);
        assert_eq!(BagChange::absolute(9).apply(5), 9);
    }

    #[test]
    fn invalid_pointer_sentinel() {
        assert!(!BagPointer::INVALID.is_valid());
        assert!(BagPointer::new(0, 0, 0).is_valid());
    }

    #[test]
    fn representation_forcing() {
        struct OneTree;
        impl TreeStore for OneTree {
            fn resolve_pointer(&self, _p: &BagPointer) -> Option<Vec<Rid>> {
                Some(vec![Rid::new(2, 2)])
            }
            fn sync_id_for(&self, current: Option<Uuid>) -> Option<Uuid> {
                current
            }
        }

        let mut bag = RidBag::tree(Some(BagPointer::new(1, 1, 1)), 1, Vec::new());
        bag.force_embedded(&OneTree);
        assert_eq!(bag.entries().unwrap(), &[Some(Rid::new(2, 2))]);

        bag.force_tree();
        assert!(!bag.is_embedded());
        assert_eq!(bag.size(), 1);
        assert_eq!(bag.pointer(), None);
    }
}

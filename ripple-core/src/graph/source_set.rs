//! Source Provenance Sets
//!
//! A provenance set records which source nodes a turn (or a node's ancestry)
//! touches. It only needs membership, insertion and a disjointness test, so
//! it is stored as a sorted, deduplicated small vector: most sets hold a
//! handful of ids and never spill to the heap.

use smallvec::SmallVec;

use super::node::NodeId;

/// A compact set of source node ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceIdSet {
    ids: SmallVec<[NodeId; 4]>,
}

impl SourceIdSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a single id. Returns `true` if it was not present yet.
    pub fn insert(&mut self, id: NodeId) -> bool {
        match self.ids.binary_search(&id) {
            Ok(_) => false,
            Err(pos) => {
                self.ids.insert(pos, id);
                true
            }
        }
    }

    /// Merge every id of `other` into this set.
    pub fn extend_from(&mut self, other: &SourceIdSet) {
        if other.ids.is_empty() {
            return;
        }
        if self.ids.is_empty() {
            self.ids = other.ids.clone();
            return;
        }

        let mut merged = SmallVec::with_capacity(self.ids.len() + other.ids.len());
        let (mut a, mut b) = (self.ids.iter().peekable(), other.ids.iter().peekable());
        loop {
            match (a.peek(), b.peek()) {
                (Some(&&x), Some(&&y)) => {
                    if x < y {
                        merged.push(x);
                        a.next();
                    } else if y < x {
                        merged.push(y);
                        b.next();
                    } else {
                        merged.push(x);
                        a.next();
                        b.next();
                    }
                }
                (Some(&&x), None) => {
                    merged.push(x);
                    a.next();
                }
                (None, Some(&&y)) => {
                    merged.push(y);
                    b.next();
                }
                (None, None) => break,
            }
        }
        self.ids = merged;
    }

    /// Whether `id` is a member.
    pub fn contains(&self, id: NodeId) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    /// Whether the two sets share at least one id.
    ///
    /// Both sides are sorted, so this is a single merge walk.
    pub fn intersects(&self, other: &SourceIdSet) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.ids.len() && j < other.ids.len() {
            let (x, y) = (self.ids[i], other.ids[j]);
            if x == y {
                return true;
            }
            if x < y {
                i += 1;
            } else {
                j += 1;
            }
        }
        false
    }

    /// Whether the two sets share no id.
    pub fn is_disjoint(&self, other: &SourceIdSet) -> bool {
        !self.intersects(other)
    }

    /// Remove every id.
    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterate the ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.ids.iter().copied()
    }
}

impl FromIterator<NodeId> for SourceIdSet {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        let mut ids: SmallVec<[NodeId; 4]> = iter.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self { ids }
    }
}

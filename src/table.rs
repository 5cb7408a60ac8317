//! The transposition table: hash-keyed ownership of every shared position.
//!
//! Positions live in a concurrent map from 64-bit position hash to a boxed
//! [`PositionNode`]; the box pins each node so references handed out stay
//! valid across shard rehashing. Hash collisions are treated as identity
//! (the hash is Zobrist-grade; the rules engine is the ground truth for
//! equality). Interning races resolve inside the map's entry API: both
//! callers get the same node, exactly one sees `created`.
//!
//! Lifetime of a handed-out reference is bounded by the parent-count
//! protocol: a position stays put at least as long as `num_parents > 0`,
//! and [`TranspositionTable::maintenance`], which runs only between
//! searches under external quiescence, is the only thing that removes
//! entries.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::node::PositionNode;

/// Concurrent mapping from position hash to owned position.
#[derive(Default)]
pub struct TranspositionTable {
    map: DashMap<u64, Box<PositionNode>>,
}

impl TranspositionTable {
    pub fn new() -> Self {
        TranspositionTable::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Look up the position for `hash`.
    pub fn find(&self, hash: u64) -> Option<&PositionNode> {
        self.map.get(&hash).map(|entry| {
            let node: *const PositionNode = entry.value().as_ref();
            // SAFETY: the box pins the node; removal requires external
            // quiescence, which the caller's epoch participation provides.
            unsafe { &*node }
        })
    }

    /// The position for `hash`, interning an empty one if absent. Returns
    /// whether this call created it; concurrent creators resolve to a
    /// single winner, and only the winner may evaluate the node.
    pub fn get_or_create(&self, hash: u64) -> (&PositionNode, bool) {
        self.get_or_create_with(hash, PositionNode::new)
    }

    /// Like [`Self::get_or_create`], but a creating call inserts the node
    /// `init` builds, fully initialized before anyone else can see it.
    pub fn get_or_create_with(
        &self,
        hash: u64,
        init: impl FnOnce() -> PositionNode,
    ) -> (&PositionNode, bool) {
        match self.map.entry(hash) {
            Entry::Occupied(entry) => {
                let node: *const PositionNode = entry.get().as_ref();
                // SAFETY: as in `find`.
                (unsafe { &*node }, false)
            }
            Entry::Vacant(entry) => {
                let boxed = Box::new(init());
                let node: *const PositionNode = boxed.as_ref();
                entry.insert(boxed);
                // SAFETY: as in `find`.
                (unsafe { &*node }, true)
            }
        }
    }

    /// Evict every position that is unreachable (`num_parents == 0`) and
    /// carries no pending in-flight visits, cascading until nothing more
    /// frees up: releasing a position's children may orphan further
    /// positions, which the next sweep collects. Requires external
    /// quiescence. Returns how many positions were evicted.
    pub fn maintenance(&self) -> usize {
        let mut evicted = 0;
        loop {
            let victims: Vec<u64> = self
                .map
                .iter()
                .filter(|entry| {
                    let node = entry.value();
                    node.num_parents() == 0 && quiescent(node)
                })
                .map(|entry| *entry.key())
                .collect();
            if victims.is_empty() {
                break;
            }
            for hash in victims {
                if let Some((_, node)) = self.map.remove(&hash) {
                    node.release_children();
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            debug!(evicted, remaining = self.map.len(), "transposition table swept");
        }
        evicted
    }

    /// Drop every entry. Callers guarantee no outstanding references and
    /// no pending visits; no parent accounting happens here.
    pub fn clear(&self) {
        self.map.clear();
    }
}

/// No in-flight visits on the position or any of its realized children.
fn quiescent(node: &PositionNode) -> bool {
    node.n_in_flight() == 0
        && (0..node.num_edges())
            .filter_map(|index| node.get_child_at(index))
            .all(|child| child.n_in_flight() == 0)
}

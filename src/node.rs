//! The two vertex types of the search DAG.
//!
//! Terminology, following the edge/arc split the whole crate is built on:
//!
//! * [`Edge`]: a potential arc: a move and a prior (see [`crate::edge`]).
//! * [`MoveNode`]: a realized arc: visit statistics and a link to the
//!   position the move leads to.
//! * [`PositionNode`]: a position: an immutable edge array, realized
//!   children stored index-parallel to it, aggregated statistics, terminal
//!   status and a parent count. Positions reachable by more than one move
//!   order are shared (transpositions), so the structure is a DAG.
//!
//! Realized children live in a fixed inline array of [`INLINE_CHILDREN`]
//! move nodes plus one spill array allocated on demand for the higher
//! indices. Slots start default-constructed; realization claims a slot by
//! CAS-ing its `index` field from the CONSTRUCTED sentinel to ASSIGNING,
//! fills it in, and publishes with a release store of the final index.
//! A reader that observes a realized index therefore observes a fully
//! initialized node.
//!
//! ```text
//!  PositionNode
//!  +-----------+          +------------------------------+
//!  | edges     |--------->| Nf3 | Bc5 | a4 | Qxf7 | a3   |
//!  | inline[2] |          +------------------------------+
//!  |  [0] -----+--> MoveNode{index: 1 (Bc5), wl: 0.5, child}
//!  |  [1]      |    (slot unclaimed)
//!  | spill ----+--> MoveNode[3] for indices 2..5, on demand
//!  +-----------+
//! ```
//!
//! Statistics fields are atomics. Visit-count and value updates on one
//! node are serialized by the search discipline (only the thread whose
//! `try_start_score_update` succeeded finalizes or cancels that visit);
//! `n_in_flight` is contended and uses read-modify-write operations.

use std::fmt;
use std::ptr;
use std::sync::atomic::{
    AtomicBool, AtomicPtr, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering,
};

use tracing::warn;

use crate::edge::Edge;
use crate::game::{Bounds, GameResult, Move, MoveList, NetworkEval, Terminal};
use crate::iter::{EdgeIter, VisitedChildIter};

/// How many realized children are stored inline in every position before
/// the spill array is touched.
pub const INLINE_CHILDREN: usize = 2;

/// `index` sentinel: slot is default-constructed, not yet realized.
pub(crate) const INDEX_CONSTRUCTED: u16 = u16::MAX;
/// `index` sentinel: realization in progress; readers spin or back off.
pub(crate) const INDEX_ASSIGNING: u16 = 32767;

// Flag byte layout shared by both node types: terminal kind in bits 0-1,
// lower bound in bits 2-3, upper bound in bits 4-5.
const FLAGS_DEFAULT: u8 =
    (GameResult::BlackWon as u8) << 2 | (GameResult::WhiteWon as u8) << 4;

fn pack_flags(terminal: Terminal, lower: GameResult, upper: GameResult) -> u8 {
    terminal as u8 | (lower as u8) << 2 | (upper as u8) << 4
}

/// A realized arc of the DAG: one move actually taken by the search, with
/// the visit statistics selection feeds on. Owned by the parent
/// [`PositionNode`]'s child storage; links to the target position through
/// a non-owning pointer reference-counted by the target's parent count.
pub struct MoveNode {
    /// Mean W-minus-L over the visited subtree, from the point of view of
    /// the player who just played this move. f64 bits.
    wl: AtomicU64,
    /// Target position, null until linked.
    child: AtomicPtr<PositionNode>,
    /// Mean draw probability. f32 bits.
    d: AtomicU32,
    /// Mean estimated remaining plies. f32 bits.
    m: AtomicU32,
    /// Completed visits.
    n: AtomicU32,
    /// Visits started but not finished (virtual loss).
    n_in_flight: AtomicU32,
    /// Copy of the parent's edge at `index`, packed move|prior, so the
    /// selection hot loop touches one cache line.
    edge: AtomicU32,
    /// Own index in the parent's edge array; doubles as lifecycle state
    /// through the CONSTRUCTED/ASSIGNING sentinels.
    index: AtomicU16,
    /// Terminal kind and result bounds.
    flags: AtomicU8,
}

const _: () = assert!(std::mem::size_of::<MoveNode>() <= 64, "MoveNode exceeds a cache line");

impl Default for MoveNode {
    fn default() -> Self {
        MoveNode {
            wl: AtomicU64::new(0f64.to_bits()),
            child: AtomicPtr::new(ptr::null_mut()),
            d: AtomicU32::new(0),
            m: AtomicU32::new(0),
            n: AtomicU32::new(0),
            n_in_flight: AtomicU32::new(0),
            edge: AtomicU32::new(0),
            index: AtomicU16::new(INDEX_CONSTRUCTED),
            flags: AtomicU8::new(FLAGS_DEFAULT),
        }
    }
}

impl MoveNode {
    /// A standalone realized node carrying the null move; the game-begin
    /// anchor of a tree.
    pub(crate) fn new_root() -> Self {
        let node = MoveNode::default();
        node.index.store(0, Ordering::Release);
        node
    }

    /// Edge index in the parent, if realized.
    pub fn index(&self) -> Option<u16> {
        let idx = self.index.load(Ordering::Acquire);
        (idx < INDEX_ASSIGNING).then_some(idx)
    }

    pub fn is_realized(&self) -> bool {
        self.index.load(Ordering::Acquire) < INDEX_ASSIGNING
    }

    /// The move this arc plays, optionally from the opponent's view.
    pub fn mv(&self, as_opponent: bool) -> Move {
        let mv = Move::from_raw(self.edge.load(Ordering::Relaxed) as u16);
        if as_opponent {
            mv.flipped()
        } else {
            mv
        }
    }

    /// Prior of this arc's own edge copy.
    pub fn p(&self) -> f32 {
        let edge = self.edge.load(Ordering::Relaxed);
        crate::edge::decompress_p((edge >> 16) as u16)
    }

    /// Rewrite the prior on this arc's own edge copy (root noise).
    pub fn set_p(&self, p: f32) {
        let mv = self.edge.load(Ordering::Relaxed) & 0xffff;
        self.edge
            .store(mv | (crate::edge::compress_p(p) as u32) << 16, Ordering::Relaxed);
    }

    pub fn n(&self) -> u32 {
        self.n.load(Ordering::Acquire)
    }

    pub fn n_in_flight(&self) -> u32 {
        self.n_in_flight.load(Ordering::Acquire)
    }

    /// Completed plus in-flight visits; what selection ranks against, so
    /// that concurrent descents spread out.
    pub fn n_started(&self) -> u32 {
        self.n() + self.n_in_flight()
    }

    pub fn wl(&self) -> f64 {
        f64::from_bits(self.wl.load(Ordering::Relaxed))
    }

    pub fn d(&self) -> f32 {
        f32::from_bits(self.d.load(Ordering::Relaxed))
    }

    pub fn m(&self) -> f32 {
        f32::from_bits(self.m.load(Ordering::Relaxed))
    }

    /// Value with the given draw score folded in.
    pub fn q(&self, draw_score: f32) -> f32 {
        self.wl() as f32 + draw_score * self.d()
    }

    pub fn terminal_type(&self) -> Terminal {
        Terminal::from_bits(self.flags.load(Ordering::Relaxed) & 0x3)
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_type() != Terminal::NonTerminal
    }

    pub fn is_tb_terminal(&self) -> bool {
        self.terminal_type() == Terminal::Tablebase
    }

    pub fn bounds(&self) -> Bounds {
        let flags = self.flags.load(Ordering::Relaxed);
        (
            GameResult::from_bits(flags >> 2 & 0x3),
            GameResult::from_bits(flags >> 4 & 0x3),
        )
    }

    pub fn set_bounds(&self, lower: GameResult, upper: GameResult) {
        debug_assert!(lower <= upper);
        let terminal = self.flags.load(Ordering::Relaxed) & 0x3;
        self.flags
            .store(terminal | (lower as u8) << 2 | (upper as u8) << 4, Ordering::Relaxed);
    }

    /// The position this arc leads to, if already linked.
    pub fn child(&self) -> Option<&PositionNode> {
        // SAFETY: a non-null child pointer targets a position owned by the
        // transposition table (or the tree's detached collection) whose
        // lifetime is held open by this node's parent count until an
        // exclusive release path severs the link.
        unsafe { self.child.load(Ordering::Acquire).as_ref() }
    }

    /// Link this arc to its target position, taking a parent slot on it.
    /// One-shot: the arc must be unlinked.
    pub fn set_child(&self, child: &PositionNode) {
        child.add_parent();
        let prev = self
            .child
            .swap(child as *const PositionNode as *mut PositionNode, Ordering::AcqRel);
        debug_assert!(prev.is_null(), "child linked twice");
    }

    /// Sever the child link and give back the parent slot. Requires
    /// quiescence (no concurrent descent through this node).
    pub fn unset_child(&self) {
        let prev = self.child.swap(ptr::null_mut(), Ordering::AcqRel);
        if !prev.is_null() {
            // SAFETY: see `child`; the target is still table-owned.
            unsafe { (*prev).remove_parent() };
        }
    }

    /// Iterate over the target position's edges (empty if unlinked).
    pub fn edges(&self) -> EdgeIter<'_> {
        EdgeIter::new(self.child())
    }

    /// Iterate over the target position's realized children with at least
    /// one completed visit (empty if unlinked).
    pub fn visited_children(&self) -> VisitedChildIter<'_> {
        VisitedChildIter::new(self.child())
    }

    /// Claim a visit through this node. Fails exactly when the node has
    /// never completed a visit and another thread is already expanding it
    /// (`n == 0` with in-flight visits); succeeding increments the virtual
    /// loss by one.
    pub fn try_start_score_update(&self) -> bool {
        let mut in_flight = self.n_in_flight.load(Ordering::Acquire);
        loop {
            if self.n.load(Ordering::Acquire) == 0 && in_flight > 0 {
                return false;
            }
            match self.n_in_flight.compare_exchange_weak(
                in_flight,
                in_flight + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => in_flight = current,
            }
        }
    }

    /// Abandon `multivisit` started visits (collision, cancelled
    /// evaluation). Pairs with `try_start_score_update` /
    /// `increment_n_in_flight`.
    pub fn cancel_score_update(&self, multivisit: u32) {
        debug_assert!(self.n_in_flight() >= multivisit, "unpaired cancel");
        self.n_in_flight.fetch_sub(multivisit, Ordering::AcqRel);
    }

    /// Fold a new evaluation into the running means with weight
    /// `multivisit`, complete that many visits and retire their virtual
    /// loss. `v` is relative to the player who just played this move.
    ///
    /// Value updates on one node are serialized by the visit discipline;
    /// only `n_in_flight` is contended here.
    pub fn finalize_score_update(&self, v: f32, d: f32, m: f32, multivisit: u32) {
        let n = self.n.load(Ordering::Relaxed);
        let total = (n + multivisit) as f64;
        let wl = self.wl();
        self.wl
            .store((wl + multivisit as f64 * (v as f64 - wl) / total).to_bits(), Ordering::Relaxed);
        let old_d = self.d();
        self.d
            .store((old_d + multivisit as f32 * (d - old_d) / total as f32).to_bits(), Ordering::Relaxed);
        let old_m = self.m();
        self.m
            .store((old_m + multivisit as f32 * (m - old_m) / total as f32).to_bits(), Ordering::Relaxed);
        self.n.store(n + multivisit, Ordering::Release);
        debug_assert!(self.n_in_flight() >= multivisit, "unpaired finalize");
        self.n_in_flight.fetch_sub(multivisit, Ordering::AcqRel);
    }

    /// Shift the running means by the given deltas over `multivisit` of
    /// the existing visits, leaving `n` unchanged. Used when a node is
    /// re-classified as terminal mid-search.
    pub fn adjust_for_terminal(&self, v_delta: f32, d_delta: f32, m_delta: f32, multivisit: u32) {
        let n = self.n.load(Ordering::Relaxed);
        debug_assert!(n > 0, "adjust_for_terminal on unvisited node");
        let n = n as f64;
        let wl = self.wl();
        self.wl
            .store((wl + multivisit as f64 * v_delta as f64 / n).to_bits(), Ordering::Relaxed);
        let old_d = self.d();
        self.d
            .store((old_d + multivisit as f32 * d_delta / n as f32).to_bits(), Ordering::Relaxed);
        let old_m = self.m();
        self.m
            .store((old_m + multivisit as f32 * m_delta / n as f32).to_bits(), Ordering::Relaxed);
    }

    /// Amplify one visit to `multivisit` pseudo-visits (collision or
    /// terminal revisit batching).
    pub fn increment_n_in_flight(&self, multivisit: u32) {
        self.n_in_flight.fetch_add(multivisit, Ordering::AcqRel);
    }

    /// Mark this arc as leading to a proved result and store the exact
    /// score: `wl` from the result, `d = 1` only for draws, `m` from the
    /// plies left, bounds collapsed to the result itself.
    pub fn make_terminal(&self, result: GameResult, plies_left: f32, kind: Terminal) {
        self.wl.store(result.wl().to_bits(), Ordering::Relaxed);
        self.d
            .store(if result == GameResult::Draw { 1f32 } else { 0f32 }.to_bits(), Ordering::Relaxed);
        self.m.store(plies_left.to_bits(), Ordering::Relaxed);
        self.flags.store(pack_flags(kind, result, result), Ordering::Relaxed);
    }

    /// Undo a terminal marking: widen bounds back to the full interval and
    /// rebuild the running means from the target position's visited
    /// children, seeding the first-visit slot with the previous terminal
    /// value. Propagates to the target position when `also_child` is set.
    pub fn make_not_terminal(&self, also_child: bool) {
        self.flags.store(FLAGS_DEFAULT, Ordering::Relaxed);

        if let Some(child) = self.child() {
            // The previous values stand in for the creation visit's share.
            let mut n = 1u32;
            let mut wl = self.wl();
            let mut d = self.d();
            let mut m = self.m();
            for grandchild in VisitedChildIter::new(Some(child)) {
                let gn = grandchild.n();
                n += gn;
                wl += -grandchild.wl() * gn as f64;
                d += grandchild.d() * gn as f32;
                m += (grandchild.m() + 1.0) * gn as f32;
            }
            self.wl.store((wl / n as f64).to_bits(), Ordering::Relaxed);
            self.d.store((d / n as f32).to_bits(), Ordering::Relaxed);
            self.m.store((m / n as f32).to_bits(), Ordering::Relaxed);
            self.n.store(n, Ordering::Release);
            if also_child {
                child.make_not_terminal(self);
            }
        }
    }

    /// Clear per-search state (statistics, virtual loss, terminal status)
    /// while keeping the edge, the index and the child link, so a fresh
    /// search from this node starts clean without losing the structure
    /// below it.
    pub fn reset_for_search(&self) {
        debug_assert_eq!(self.n_in_flight(), 0, "reset during search");
        self.wl.store(0f64.to_bits(), Ordering::Relaxed);
        self.d.store(0, Ordering::Relaxed);
        self.m.store(0, Ordering::Relaxed);
        self.n.store(0, Ordering::Relaxed);
        self.n_in_flight.store(0, Ordering::Relaxed);
        self.flags.store(FLAGS_DEFAULT, Ordering::Relaxed);
    }

    /// Return the slot to the default-constructed state, severing the
    /// child link with parent accounting. Requires quiescence.
    pub(crate) fn reset(&self) {
        self.unset_child();
        self.reset_for_search();
        self.edge.store(0, Ordering::Relaxed);
        self.index.store(INDEX_CONSTRUCTED, Ordering::Release);
    }

    /// Check that every node reachable from here has retired all its
    /// in-flight visits, logging offenders. The oracle for "the search
    /// terminated cleanly".
    pub fn all_quiescent(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        self.quiescent_walk(&mut seen)
    }

    fn quiescent_walk(&self, seen: &mut std::collections::HashSet<*const PositionNode>) -> bool {
        let mut clean = true;
        if self.n_in_flight() != 0 {
            warn!(node = %self, in_flight = self.n_in_flight(), "pending visits on move node");
            clean = false;
        }
        if let Some(child) = self.child() {
            if !seen.insert(child as *const PositionNode) {
                return clean;
            }
            if child.n_in_flight() != 0 {
                warn!(node = %child, in_flight = child.n_in_flight(), "pending visits on position");
                clean = false;
            }
            for index in 0..child.num_edges() {
                if let Some(node) = child.get_child_at(index) {
                    clean &= node.quiescent_walk(seen);
                }
            }
        }
        clean
    }
}

impl fmt::Display for MoveNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} p={:.4} n={} nif={} wl={:+.5} d={:.3} m={:.1}",
            self.mv(false),
            self.p(),
            self.n(),
            self.n_in_flight(),
            self.wl(),
            self.d(),
            self.m(),
        )?;
        if self.is_terminal() {
            let (lower, upper) = self.bounds();
            write!(f, " terminal={:?} bounds=[{:?},{:?}]", self.terminal_type(), lower, upper)?;
        }
        Ok(())
    }
}

/// A position of the game: the vertex type of the DAG.
///
/// Owned by the transposition table (or the tree's detached collection for
/// positions that must not be shared); linked to by move nodes that count
/// themselves in `num_parents`. Statistics aggregate the whole visited
/// subtree and are visible identically through every parent, which is the
/// point of interning transpositions.
pub struct PositionNode {
    /// First [`INLINE_CHILDREN`] realized-child slots, always present.
    inline: [MoveNode; INLINE_CHILDREN],
    /// Mean W-minus-L, from the view of the player who just moved into
    /// this position. f64 bits.
    wl: AtomicU64,
    /// Edge array; null until the move list (or evaluation) arrives, then
    /// immutable in length and membership.
    edges: AtomicPtr<Edge>,
    /// Spill array for realized-child slots at indices >= INLINE_CHILDREN;
    /// null until first needed, then sized for every remaining edge.
    spill: AtomicPtr<MoveNode>,
    d: AtomicU32,
    m: AtomicU32,
    n: AtomicU32,
    n_in_flight: AtomicU32,
    /// High-water mark of slots currently backed by memory.
    allocated_children: AtomicU16,
    /// Move nodes currently pointing here.
    num_parents: AtomicU16,
    num_edges: AtomicU8,
    flags: AtomicU8,
    /// Latched forever once a second parent appears.
    is_transposition: AtomicBool,
}

const _: () =
    assert!(std::mem::size_of::<PositionNode>() <= 128, "PositionNode exceeds two cache lines");

impl Default for PositionNode {
    fn default() -> Self {
        PositionNode {
            inline: std::array::from_fn(|_| MoveNode::default()),
            wl: AtomicU64::new(0f64.to_bits()),
            edges: AtomicPtr::new(ptr::null_mut()),
            spill: AtomicPtr::new(ptr::null_mut()),
            d: AtomicU32::new(0),
            m: AtomicU32::new(0),
            n: AtomicU32::new(0),
            n_in_flight: AtomicU32::new(0),
            allocated_children: AtomicU16::new(INLINE_CHILDREN as u16),
            num_parents: AtomicU16::new(0),
            num_edges: AtomicU8::new(0),
            flags: AtomicU8::new(FLAGS_DEFAULT),
            is_transposition: AtomicBool::new(false),
        }
    }
}

impl PositionNode {
    /// An empty position: no edges yet. Filled in by [`Self::set_eval`]
    /// once the network answers; the table creates positions in this state
    /// so interning never waits on evaluation.
    pub fn new() -> Self {
        PositionNode::default()
    }

    /// A position with edges for the given moves, zero priors.
    pub fn from_moves(moves: &MoveList) -> Self {
        let node = PositionNode::default();
        node.publish_edges(Edge::from_moves(moves));
        node
    }

    /// A position with edges for the given moves, eagerly realizing the
    /// child at `index`.
    pub fn from_moves_with_child(moves: &MoveList, index: usize) -> Self {
        let node = PositionNode::from_moves(moves);
        node.insert_child_at(index);
        node
    }

    /// A fresh copy of another position's edges and network output, with
    /// no visits, no children and no parents. Detached copies carry
    /// search-only prior noise without contaminating the shared original.
    pub fn detached_clone(&self) -> Self {
        let node = PositionNode::default();
        let copies: Box<[Edge]> = self.edges_slice().iter().map(Edge::copy).collect();
        node.publish_edges(copies);
        node.wl.store(self.wl.load(Ordering::Relaxed), Ordering::Relaxed);
        node.d.store(self.d.load(Ordering::Relaxed), Ordering::Relaxed);
        node.m.store(self.m.load(Ordering::Relaxed), Ordering::Relaxed);
        node
    }

    /// Publish the edge array. One-shot; the length is frozen with it.
    fn publish_edges(&self, edges: Box<[Edge]>) {
        debug_assert!(self.edges.load(Ordering::Relaxed).is_null(), "edges published twice");
        debug_assert!(edges.len() <= u8::MAX as usize);
        self.num_edges.store(edges.len() as u8, Ordering::Relaxed);
        let thin = Box::into_raw(edges) as *mut Edge;
        self.edges.store(thin, Ordering::Release);
    }

    /// Adopt a network evaluation: build edges for `moves` with the
    /// returned priors and store the value triple. One-shot, performed by
    /// the thread that won creation of this position; other threads watch
    /// [`Self::has_edges`] flip.
    pub fn set_eval(&self, moves: &MoveList, eval: &NetworkEval) {
        debug_assert_eq!(moves.len(), eval.priors.len(), "one prior per legal move");
        debug_assert_eq!(self.n(), 0, "evaluation after visits");
        let edges = Edge::from_moves(moves);
        for (edge, &p) in edges.iter().zip(&eval.priors) {
            edge.set_p(p.clamp(0.0, 1.0));
        }
        self.wl.store((eval.value as f64).to_bits(), Ordering::Relaxed);
        self.d.store(eval.draw.to_bits(), Ordering::Relaxed);
        self.m.store(eval.moves_left.to_bits(), Ordering::Relaxed);
        self.publish_edges(edges);
    }

    pub fn has_edges(&self) -> bool {
        !self.edges.load(Ordering::Acquire).is_null()
    }

    pub fn num_edges(&self) -> usize {
        if self.has_edges() {
            self.num_edges.load(Ordering::Relaxed) as usize
        } else {
            0
        }
    }

    /// The edge array (empty until published).
    pub fn edges_slice(&self) -> &[Edge] {
        let ptr = self.edges.load(Ordering::Acquire);
        if ptr.is_null() {
            return &[];
        }
        let len = self.num_edges.load(Ordering::Relaxed) as usize;
        // SAFETY: published once via `publish_edges` with this length and
        // freed only on drop, which requires exclusive ownership.
        unsafe { std::slice::from_raw_parts(ptr, len) }
    }

    /// Sort edges by descending prior. Legal only while no child has been
    /// realized; selection relies on the order afterwards, and the
    /// visited-child iterator's early exit depends on it.
    pub fn sort_edges(&self) {
        debug_assert_eq!(self.n(), 0, "sorting after visits");
        debug_assert!(!self.has_realized_children(), "sorting after child realization");
        Edge::sort_slice(self.edges_slice());
    }

    pub(crate) fn has_realized_children(&self) -> bool {
        (0..self.num_edges()).any(|i| self.get_child_at(i).is_some())
    }

    pub fn n(&self) -> u32 {
        self.n.load(Ordering::Acquire)
    }

    pub fn n_in_flight(&self) -> u32 {
        self.n_in_flight.load(Ordering::Acquire)
    }

    pub fn n_started(&self) -> u32 {
        self.n() + self.n_in_flight()
    }

    /// Visits that continued into children: everything but the visit that
    /// created this position.
    pub fn children_visits(&self) -> u32 {
        self.n().saturating_sub(1)
    }

    pub fn wl(&self) -> f64 {
        f64::from_bits(self.wl.load(Ordering::Relaxed))
    }

    pub fn d(&self) -> f32 {
        f32::from_bits(self.d.load(Ordering::Relaxed))
    }

    pub fn m(&self) -> f32 {
        f32::from_bits(self.m.load(Ordering::Relaxed))
    }

    pub fn q(&self, draw_score: f32) -> f32 {
        self.wl() as f32 + draw_score * self.d()
    }

    /// Sum of priors over children with at least one completed visit.
    pub fn visited_policy(&self) -> f32 {
        VisitedChildIter::new(Some(self)).map(|node| node.p()).sum()
    }

    pub fn terminal_type(&self) -> Terminal {
        Terminal::from_bits(self.flags.load(Ordering::Relaxed) & 0x3)
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_type() != Terminal::NonTerminal
    }

    pub fn bounds(&self) -> Bounds {
        let flags = self.flags.load(Ordering::Relaxed);
        (
            GameResult::from_bits(flags >> 2 & 0x3),
            GameResult::from_bits(flags >> 4 & 0x3),
        )
    }

    pub fn set_bounds(&self, lower: GameResult, upper: GameResult) {
        debug_assert!(lower <= upper);
        let terminal = self.flags.load(Ordering::Relaxed) & 0x3;
        self.flags
            .store(terminal | (lower as u8) << 2 | (upper as u8) << 4, Ordering::Relaxed);
    }

    pub fn num_parents(&self) -> u16 {
        self.num_parents.load(Ordering::Acquire)
    }

    /// Whether more than one parent has ever pointed here. Latched: stays
    /// true for the rest of this position's life.
    pub fn is_transposition(&self) -> bool {
        self.is_transposition.load(Ordering::Relaxed)
    }

    pub(crate) fn add_parent(&self) {
        let before = self.num_parents.fetch_add(1, Ordering::AcqRel);
        if before >= 1 {
            self.is_transposition.store(true, Ordering::Relaxed);
        }
    }

    pub(crate) fn remove_parent(&self) {
        let before = self.num_parents.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "parent count underflow");
    }

    /// How many realized-child slots are currently backed by memory.
    pub fn allocated_children(&self) -> u16 {
        self.allocated_children.load(Ordering::Acquire)
    }

    /// The realized child at edge index `index`, if any. Slots mid-claim
    /// by another thread read as absent.
    pub fn get_child_at(&self, index: usize) -> Option<&MoveNode> {
        let slot = self.child_slot(index)?;
        slot.is_realized().then_some(slot)
    }

    /// Realize the child at edge index `index`, or return it if another
    /// thread got there first. Claims the slot with a CAS on its `index`
    /// field; losers spin for the winner's bounded publish window and then
    /// observe the same node.
    pub fn insert_child_at(&self, index: usize) -> &MoveNode {
        debug_assert!(index < self.num_edges(), "realizing past the edge array");
        let slot = self
            .child_slot_or_allocate(index)
            .expect("index checked against num_edges");
        loop {
            match slot.index.compare_exchange(
                INDEX_CONSTRUCTED,
                INDEX_ASSIGNING,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    slot.edge
                        .store(self.edges_slice()[index].packed(), Ordering::Relaxed);
                    slot.index.store(index as u16, Ordering::Release);
                    return slot;
                }
                Err(INDEX_ASSIGNING) => std::hint::spin_loop(),
                Err(published) => {
                    debug_assert_eq!(published, index as u16);
                    return slot;
                }
            }
        }
    }

    /// Storage slot for `index` without allocating: inline, or in the
    /// spill if it exists.
    fn child_slot(&self, index: usize) -> Option<&MoveNode> {
        if index >= self.num_edges() {
            return None;
        }
        if index < INLINE_CHILDREN {
            return Some(&self.inline[index]);
        }
        let spill = self.spill.load(Ordering::Acquire);
        if spill.is_null() {
            return None;
        }
        // SAFETY: the spill covers every index in INLINE_CHILDREN..num_edges
        // and is freed only on exclusive release paths.
        Some(unsafe { &*spill.add(index - INLINE_CHILDREN) })
    }

    fn child_slot_or_allocate(&self, index: usize) -> Option<&MoveNode> {
        if index >= self.num_edges() {
            return None;
        }
        if index < INLINE_CHILDREN {
            return Some(&self.inline[index]);
        }
        let mut spill = self.spill.load(Ordering::Acquire);
        if spill.is_null() {
            spill = self.allocate_spill();
        }
        // SAFETY: as in `child_slot`.
        Some(unsafe { &*spill.add(index - INLINE_CHILDREN) })
    }

    /// Allocate the spill in one piece, sized for every edge beyond the
    /// inline slots. A single CAS decides the winner; the loser frees its
    /// attempt and adopts the published array. Growth is monotonic during
    /// search, so handed-out slot references stay valid.
    fn allocate_spill(&self) -> *mut MoveNode {
        let len = self.num_edges() - INLINE_CHILDREN;
        let fresh: Box<[MoveNode]> = (0..len).map(|_| MoveNode::default()).collect();
        let ptr = Box::into_raw(fresh) as *mut MoveNode;
        match self.spill.compare_exchange(
            ptr::null_mut(),
            ptr,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.allocated_children
                    .store(self.num_edges() as u16, Ordering::Release);
                ptr
            }
            Err(winner) => {
                // SAFETY: `ptr` is ours alone; nobody saw it.
                unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(ptr, len))) };
                winner
            }
        }
    }

    fn free_spill(&self) {
        let spill = self.spill.swap(ptr::null_mut(), Ordering::AcqRel);
        if !spill.is_null() {
            let len = self.num_edges() - INLINE_CHILDREN;
            // SAFETY: exclusive release path; allocated with this length.
            unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(spill, len))) };
            self.allocated_children
                .store(INLINE_CHILDREN as u16, Ordering::Release);
        }
    }

    /// Iterate over edges paired with their realized children.
    pub fn edges_iter(&self) -> EdgeIter<'_> {
        EdgeIter::new(Some(self))
    }

    /// Iterate over realized children with at least one completed visit.
    pub fn visited_children(&self) -> VisitedChildIter<'_> {
        VisitedChildIter::new(Some(self))
    }

    /// Book a descent through this position; retired by
    /// [`Self::finalize_score_update`] or [`Self::cancel_score_update`].
    pub fn increment_n_in_flight(&self, multivisit: u32) {
        self.n_in_flight.fetch_add(multivisit, Ordering::AcqRel);
    }

    pub fn cancel_score_update(&self, multivisit: u32) {
        debug_assert!(self.n_in_flight() >= multivisit, "unpaired cancel");
        self.n_in_flight.fetch_sub(multivisit, Ordering::AcqRel);
    }

    /// Same update as [`MoveNode::finalize_score_update`]; transposed
    /// positions accumulate joint statistics here, visible through every
    /// parent.
    pub fn finalize_score_update(&self, v: f32, d: f32, m: f32, multivisit: u32) {
        let n = self.n.load(Ordering::Relaxed);
        let total = (n + multivisit) as f64;
        let wl = self.wl();
        self.wl
            .store((wl + multivisit as f64 * (v as f64 - wl) / total).to_bits(), Ordering::Relaxed);
        let old_d = self.d();
        self.d
            .store((old_d + multivisit as f32 * (d - old_d) / total as f32).to_bits(), Ordering::Relaxed);
        let old_m = self.m();
        self.m
            .store((old_m + multivisit as f32 * (m - old_m) / total as f32).to_bits(), Ordering::Relaxed);
        self.n.store(n + multivisit, Ordering::Release);
        debug_assert!(self.n_in_flight() >= multivisit, "unpaired finalize");
        self.n_in_flight.fetch_sub(multivisit, Ordering::AcqRel);
    }

    pub fn adjust_for_terminal(&self, v_delta: f32, d_delta: f32, m_delta: f32, multivisit: u32) {
        let n = self.n.load(Ordering::Relaxed);
        debug_assert!(n > 0, "adjust_for_terminal on unvisited position");
        let n = n as f64;
        let wl = self.wl();
        self.wl
            .store((wl + multivisit as f64 * v_delta as f64 / n).to_bits(), Ordering::Relaxed);
        let old_d = self.d();
        self.d
            .store((old_d + multivisit as f32 * d_delta / n as f32).to_bits(), Ordering::Relaxed);
        let old_m = self.m();
        self.m
            .store((old_m + multivisit as f32 * m_delta / n as f32).to_bits(), Ordering::Relaxed);
    }

    /// Mark the position as proved and store its exact score.
    pub fn make_terminal(&self, result: GameResult, plies_left: f32, kind: Terminal) {
        self.wl.store(result.wl().to_bits(), Ordering::Relaxed);
        self.d
            .store(if result == GameResult::Draw { 1f32 } else { 0f32 }.to_bits(), Ordering::Relaxed);
        self.m.store(plies_left.to_bits(), Ordering::Relaxed);
        let terminal = pack_flags(kind, result, result);
        self.flags.store(terminal, Ordering::Relaxed);
    }

    /// Undo a terminal marking: widen the bounds back to the full interval
    /// and take visits and values from the supplied parent arc's view
    /// (same perspective: both speak for the player who just moved).
    pub fn make_not_terminal(&self, via: &MoveNode) {
        self.flags.store(FLAGS_DEFAULT, Ordering::Relaxed);
        self.wl.store(via.wl().to_bits(), Ordering::Relaxed);
        self.d.store(via.d().to_bits(), Ordering::Relaxed);
        self.m.store(via.m().to_bits(), Ordering::Relaxed);
        self.n.store(via.n(), Ordering::Release);
    }

    /// Destroy every realized child, returning their parent slots on the
    /// positions they pointed to. Requires quiescence below this position.
    pub fn release_children(&self) {
        for index in 0..self.num_edges() {
            if let Some(node) = self.get_child_at(index) {
                node.reset();
            }
        }
        self.free_spill();
    }

    /// Destroy every realized child except the one at `save`. The saved
    /// child keeps its slot (the spill is retained when it lives there),
    /// so pointers to it remain valid. Requires quiescence below this
    /// position.
    pub fn release_children_except_one(&self, save: usize) {
        for index in 0..self.num_edges() {
            if index == save {
                continue;
            }
            if let Some(node) = self.get_child_at(index) {
                node.reset();
            }
        }
        if save < INLINE_CHILDREN {
            self.free_spill();
        }
    }
}

impl Drop for PositionNode {
    fn drop(&mut self) {
        // Plain memory reclamation; parent accounting on children is the
        // release paths' business, not the destructor's.
        let num_edges = *self.num_edges.get_mut() as usize;
        let spill = *self.spill.get_mut();
        if !spill.is_null() {
            let len = num_edges - INLINE_CHILDREN;
            // SAFETY: allocated by `allocate_spill` with this length.
            unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(spill, len))) };
        }
        let edges = *self.edges.get_mut();
        if !edges.is_null() {
            // SAFETY: allocated by `publish_edges` with this length.
            unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(edges, num_edges))) };
        }
    }
}

impl fmt::Display for PositionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "edges={} parents={} n={} nif={} wl={:+.5} d={:.3} m={:.1}",
            self.num_edges(),
            self.num_parents(),
            self.n(),
            self.n_in_flight(),
            self.wl(),
            self.d(),
            self.m(),
        )?;
        if self.is_transposition() {
            write!(f, " transposition")?;
        }
        if self.is_terminal() {
            let (lower, upper) = self.bounds();
            write!(f, " terminal={:?} bounds=[{:?},{:?}]", self.terminal_type(), lower, upper)?;
        }
        Ok(())
    }
}

//! Tree lifecycle: the game-begin anchor, the current head, the move
//! history, and the reuse/release machinery around them.
//!
//! The tree owns the transposition table and a small side collection of
//! detached positions (root-like copies carrying search-only prior noise,
//! never interned and never shared). Searches run against `&Tree` (the
//! head and the table are all a worker needs) while every lifecycle
//! operation takes `&mut self` and so runs under external quiescence, the
//! same division the concurrency model prescribes.

use std::ptr::NonNull;

use thiserror::Error;
use tracing::{debug, trace};

use crate::game::{GameRules, Move, RulesError};
use crate::node::{MoveNode, PositionNode};
use crate::table::TranspositionTable;

/// Errors from tree lifecycle operations.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error(transparent)]
    Rules(#[from] RulesError),

    #[error("move {0} does not match any edge at the head position")]
    UnknownMove(Move),
}

/// The search graph with its lifecycle state.
pub struct Tree<R: GameRules> {
    rules: R,
    /// Anchor arc above the starting position; never released while the
    /// tree lives.
    gamebegin: Box<MoveNode>,
    /// The arc whose target position searches currently start from.
    head: NonNull<MoveNode>,
    start_fen: String,
    /// One state per ply, starting position first.
    history: Vec<R::State>,
    moves: Vec<Move>,
    table: TranspositionTable,
    /// Positions excluded from interning (noise-carrying copies); owned
    /// here, reclaimed when their last parent lets go.
    detached: Vec<Box<PositionNode>>,
}

// SAFETY: `head` points into allocations owned by this tree (the gamebegin
// box or a box pinned inside the table), and all shared node state is
// atomic. Lifecycle mutation requires `&mut Tree`.
unsafe impl<R: GameRules + Send> Send for Tree<R> where R::State: Send {}
unsafe impl<R: GameRules + Sync> Sync for Tree<R> where R::State: Sync {}

impl<R: GameRules> Tree<R> {
    /// A tree rooted at the position `fen` describes.
    pub fn new(rules: R, fen: &str) -> Result<Self, TreeError> {
        let start = rules.starting_state(fen)?;
        let gamebegin = Box::new(MoveNode::new_root());
        let head = NonNull::from(gamebegin.as_ref());
        Ok(Tree {
            rules,
            gamebegin,
            head,
            start_fen: fen.to_string(),
            history: vec![start],
            moves: Vec::new(),
            table: TranspositionTable::new(),
            detached: Vec::new(),
        })
    }

    pub fn rules(&self) -> &R {
        &self.rules
    }

    pub fn table(&self) -> &TranspositionTable {
        &self.table
    }

    /// The arc searches descend from.
    pub fn head(&self) -> &MoveNode {
        // SAFETY: `head` tracks an arc the lifecycle operations keep
        // alive: the gamebegin box, or a slot that every
        // `release_children_except_one` along the walk preserved.
        unsafe { self.head.as_ref() }
    }

    /// The anchor arc above the starting position.
    pub fn gamebegin(&self) -> &MoveNode {
        &self.gamebegin
    }

    pub fn head_state(&self) -> &R::State {
        self.history.last().expect("history holds at least the start")
    }

    pub fn head_hash(&self) -> u64 {
        self.rules.hash(self.head_state())
    }

    /// Plies played since the starting position.
    pub fn ply_count(&self) -> usize {
        self.moves.len()
    }

    pub fn moves(&self) -> &[Move] {
        &self.moves
    }

    pub fn start_fen(&self) -> &str {
        &self.start_fen
    }

    /// Advance the head one ply along `mv`, preserving exactly the arc for
    /// that move and freeing all sibling subtrees. Freed siblings give up
    /// their parent slots; a later [`Self::maintenance`] reclaims the
    /// orphaned positions.
    pub fn make_move(&mut self, mv: Move) -> Result<(), TreeError> {
        let state = self.head_state().clone();
        let next_head = {
            let head = self.head();
            let position = match head.child() {
                Some(position) => position,
                None => {
                    // The head was never expanded; intern its position so
                    // the walk has edges to follow.
                    let moves = self.rules.legal_moves(&state);
                    let hash = self.rules.hash(&state);
                    let (position, created) = self
                        .table
                        .get_or_create_with(hash, || PositionNode::from_moves(&moves));
                    if created {
                        trace!(hash, "interned head position for tree walk");
                    }
                    head.set_child(position);
                    position
                }
            };
            let index = position
                .edges_slice()
                .iter()
                .position(|edge| edge.mv(false) == mv)
                .ok_or(TreeError::UnknownMove(mv))?;
            let node = position.insert_child_at(index);
            position.release_children_except_one(index);
            NonNull::from(node)
        };
        self.head = next_head;
        let next = self.rules.apply(&state, mv);
        self.history.push(next);
        self.moves.push(mv);
        trace!(mv = %mv, ply = self.moves.len(), "head advanced");
        Ok(())
    }

    /// Point the tree at the position `fen` plus `moves` describes. When
    /// the new history extends the current one, the head walks forward and
    /// the subtree reachable from the new head survives; otherwise the
    /// whole graph is rebuilt. Returns whether the tree was reused.
    pub fn reset_to_position(&mut self, fen: &str, moves: &[Move]) -> Result<bool, TreeError> {
        let reusable = self.start_fen == fen
            && self.moves.len() <= moves.len()
            && moves[..self.moves.len()] == self.moves[..];
        if !reusable {
            let start = self.rules.starting_state(fen)?;
            debug!(fen, "rebuilding tree from scratch");
            self.detached.clear();
            self.table.clear();
            self.gamebegin = Box::new(MoveNode::new_root());
            self.head = NonNull::from(self.gamebegin.as_ref());
            self.start_fen = fen.to_string();
            self.history = vec![start];
            self.moves.clear();
        }
        let tail: Vec<Move> = moves[self.moves.len()..].to_vec();
        for mv in tail {
            self.make_move(mv)?;
        }
        Ok(reusable)
    }

    /// Clear per-search state from the head arc so a fresh search starts
    /// clean, keeping the structure below it for reuse.
    pub fn trim_head(&mut self) {
        self.head().reset_for_search();
    }

    /// A detached copy of `source`: same edges and network output, not
    /// interned, never shared between parents. The copy is owned by the
    /// tree and reclaimed by [`Self::maintenance`] once unreferenced.
    pub fn add_detached_clone(&mut self, source: &PositionNode) -> &PositionNode {
        let boxed = Box::new(source.detached_clone());
        let node: *const PositionNode = boxed.as_ref();
        self.detached.push(boxed);
        // SAFETY: the box was just moved into `detached`, which only
        // `maintenance` (on unreferenced nodes) and rebuilds empty.
        unsafe { &*node }
    }

    /// Reclaim unreachable positions: detached copies first (dropping one
    /// may orphan interned positions), then a cascading table sweep.
    /// Requires external quiescence. Returns how many positions were
    /// freed.
    pub fn maintenance(&mut self) -> usize {
        let before = self.detached.len();
        self.detached.retain(|node| {
            if node.num_parents() == 0 {
                node.release_children();
                false
            } else {
                true
            }
        });
        let dropped = before - self.detached.len();
        if dropped > 0 {
            debug!(dropped, "detached positions reclaimed");
        }
        dropped + self.table.maintenance()
    }
}

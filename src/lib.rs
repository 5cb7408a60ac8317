//! Shared search DAG for neural-network-guided Monte Carlo Tree Search.
//!
//! This crate is the data-structure core of an MCTS engine for two-player
//! zero-sum games: a directed acyclic graph whose vertices are game
//! positions and whose arcs are moves, shared by many worker threads that
//! concurrently select leaves, expand them, hand them to an evaluator and
//! propagate the returned values back toward the root.
//!
//! # Structure
//!
//! Three storage tiers make up the graph:
//!
//! 1. [`Edge`]: a potential move with a policy prior, compressed to four
//!    bytes.
//! 2. [`MoveNode`]: a realized move: visit counts, running value means,
//!    virtual loss, and a link to the resulting position. One cache line.
//! 3. [`PositionNode`]: a position: its edge array, realized children
//!    stored inline-plus-spill, aggregated statistics and terminal state.
//!    Two cache lines. Positions are interned by hash in the
//!    [`TranspositionTable`], so a position reached along different move
//!    orders is one shared vertex.
//!
//! [`Tree`] ties the tiers to a game: it holds the root anchor, the
//! current search head, the move history, the table, and the lifecycle
//! operations (advancing the head, releasing unreachable subtrees,
//! resetting to new positions).
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                            Tree                              |
//! +--------------------------------------------------------------+
//! |  gamebegin --> head            TranspositionTable            |
//! |      |          |              hash -> PositionNode          |
//! |      v          v                        ^   ^               |
//! |  MoveNode -> PositionNode -> MoveNode ---+   |               |
//! |                  |                           |               |
//! |                  +-> MoveNode ---------------+  (shared)     |
//! +--------------------------------------------------------------+
//! ```
//!
//! # Concurrency
//!
//! Workers roam the whole graph; there is no per-thread partitioning and
//! no lock inside a node. The protocol rests on three mechanisms:
//!
//! * **Virtual loss**: [`MoveNode::try_start_score_update`] books a
//!   descent, inflating the node's started-visit count so concurrent
//!   selection spreads out; every booking is retired by exactly one
//!   [`MoveNode::finalize_score_update`] or
//!   [`MoveNode::cancel_score_update`].
//! * **CAS realization**: a child slot is claimed by compare-and-swap on
//!   its index field and published with a release store, so racing
//!   realizers converge on one node and readers never see a half-built
//!   one.
//! * **Interning**: [`TranspositionTable::get_or_create`] resolves racing
//!   creators to a single winner, who alone evaluates the position.
//!
//! Lifecycle operations (everything on [`Tree`], plus table maintenance)
//! require external quiescence: no descents in flight. That split, hot
//! paths lock-free and cold paths exclusive, is what the API's `&self` /
//! `&mut self` signatures encode.
//!
//! The crate deliberately stops at the graph: move generation, evaluation,
//! selection scoring, batching and time control are collaborators behind
//! the narrow interfaces in [`game`].

pub mod dot;
pub mod edge;
pub mod game;
pub mod iter;
pub mod node;
pub mod table;
pub mod tree;

#[cfg(test)]
pub(crate) mod testing;

pub use edge::Edge;
pub use game::{Bounds, GameResult, GameRules, Move, MoveList, NetworkEval, Promotion, RulesError, Terminal};
pub use iter::{EdgeAndNode, EdgeIter, VisitedChildIter};
pub use node::{MoveNode, PositionNode, INLINE_CHILDREN};
pub use table::TranspositionTable;
pub use tree::{Tree, TreeError};

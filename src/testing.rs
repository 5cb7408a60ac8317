//! Shared test support: a tiny deterministic game and a worker-style
//! visit loop driving the full descend/expand/finalize protocol.

use std::sync::Mutex;

use crate::game::{GameResult, GameRules, Move, MoveList, NetworkEval, RulesError, Terminal};
use crate::node::{MoveNode, PositionNode};
use crate::tree::Tree;

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, &b| (h ^ b as u64).wrapping_mul(0x100_0000_01b3))
}

/// A game whose moves are ids playable once each, in any order. With the
/// default order-independent (Zobrist-style XOR) hash, move-order swaps
/// reconverge and transpositions arise naturally; the `line` variant
/// hashes the order in, so every move sequence is a distinct position.
pub(crate) struct SetGame {
    fanout: u8,
    transposing: bool,
}

#[derive(Clone)]
pub(crate) struct SetState {
    base: u64,
    played: Vec<u8>,
}

impl SetGame {
    pub fn new(fanout: u8) -> Self {
        SetGame { fanout, transposing: true }
    }

    pub fn line(fanout: u8) -> Self {
        SetGame { fanout, transposing: false }
    }

    /// The move carrying id `id`.
    pub fn mv(id: u8) -> Move {
        Move::new(id, id + 8)
    }
}

impl GameRules for SetGame {
    type State = SetState;

    fn starting_state(&self, fen: &str) -> Result<SetState, RulesError> {
        if fen.is_empty() {
            return Err(RulesError::InvalidFen(fen.to_string()));
        }
        Ok(SetState { base: fnv1a(fen.as_bytes()), played: Vec::new() })
    }

    fn legal_moves(&self, state: &SetState) -> MoveList {
        (0..self.fanout)
            .filter(|id| !state.played.contains(id))
            .map(Self::mv)
            .collect()
    }

    fn apply(&self, state: &SetState, mv: Move) -> SetState {
        let mut next = state.clone();
        next.played.push(mv.from_square());
        if self.transposing {
            next.played.sort_unstable();
        }
        next
    }

    fn hash(&self, state: &SetState) -> u64 {
        if self.transposing {
            state
                .played
                .iter()
                .fold(state.base, |h, &id| h ^ splitmix64(id as u64 + 1))
        } else {
            state
                .played
                .iter()
                .fold(state.base, |h, &id| splitmix64(h ^ (id as u64 + 1)))
        }
    }
}

/// `n` distinct moves, handy for building bare positions.
pub(crate) fn move_ids(n: usize) -> MoveList {
    (0..n as u8).map(SetGame::mv).collect()
}

pub(crate) fn tiny_tree(fanout: u8) -> Tree<SetGame> {
    Tree::new(SetGame::new(fanout), "start").expect("valid fen")
}

/// Deterministic stand-in for the network's value head.
pub(crate) fn eval_value(hash: u64) -> f32 {
    (hash >> 16 & 0xffff) as f32 / 65535.0 - 0.5
}

pub(crate) fn uniform_eval(hash: u64, num_moves: usize) -> NetworkEval {
    NetworkEval {
        value: eval_value(hash),
        draw: 0.25,
        moves_left: num_moves as f32,
        priors: vec![1.0 / num_moves as f32; num_moves],
    }
}

/// One full worker visit: descend from the head with virtual loss, expand
/// or adopt at the frontier, then finalize (or cancel on collision) every
/// node the descent claimed. Returns whether the visit completed.
pub(crate) fn run_uniform_visit(tree: &Tree<SetGame>) -> bool {
    let backprop = Mutex::new(());
    run_uniform_visit_guarded(tree, &backprop)
}

/// As [`run_uniform_visit`], with finalization serialized through the
/// caller's lock so many workers can share one tree: value updates on a
/// node require a single writer at a time, and the lock is how the search
/// layer provides one.
pub(crate) fn run_uniform_visit_guarded(tree: &Tree<SetGame>, backprop: &Mutex<()>) -> bool {
    let rules = tree.rules();
    let mut state = tree.head_state().clone();
    // Arcs claimed on the way down, each with the position finalized
    // beneath it (none for adopted transpositions and collisions).
    let mut path: Vec<(&MoveNode, Option<&PositionNode>)> = Vec::new();
    let mut current: &MoveNode = tree.head();

    let (v, d, m) = loop {
        if !current.try_start_score_update() {
            for (node, position) in path.iter().rev() {
                node.cancel_score_update(1);
                if let Some(position) = position {
                    position.cancel_score_update(1);
                }
            }
            return false;
        }

        match current.child() {
            Some(position) if position.is_terminal() => {
                // Terminal revisit: both sides of the arc take the visit.
                position.increment_n_in_flight(1);
                path.push((current, Some(position)));
                break (position.wl() as f32, position.d(), position.m());
            }
            Some(position) if position.n() == 0 => {
                // The creation visit for a walk-built position.
                position.increment_n_in_flight(1);
                path.push((current, Some(position)));
                break (position.wl() as f32, position.d(), position.m());
            }
            Some(position) => {
                // Interior: book the position and descend by PUCT.
                position.increment_n_in_flight(1);
                path.push((current, Some(position)));
                let numerator = 1.25 * (position.n().max(1) as f32).sqrt();
                let mut best = (0usize, f32::NEG_INFINITY);
                for pair in position.edges_iter() {
                    let score = pair.q(0.1, 0.0) + pair.u(numerator);
                    if score > best.1 {
                        best = (pair.index(), score);
                    }
                }
                let index = best.0;
                let mv = position.edges_slice()[index].mv(false);
                let node = position.insert_child_at(index);
                state = rules.apply(&state, mv);
                current = node;
            }
            None => {
                // Frontier: intern (or adopt) the position behind `state`.
                let hash = rules.hash(&state);
                let moves = rules.legal_moves(&state);
                if moves.is_empty() {
                    let (position, created) = tree.table().get_or_create_with(hash, || {
                        let p = PositionNode::new();
                        p.make_terminal(GameResult::Draw, 0.0, Terminal::EndOfGame);
                        p
                    });
                    current.set_child(position);
                    current.make_terminal(GameResult::Draw, 0.0, Terminal::EndOfGame);
                    if created {
                        position.increment_n_in_flight(1);
                        path.push((current, Some(position)));
                    } else {
                        path.push((current, None));
                    }
                    break (0.0, 1.0, 0.0);
                }
                let (position, created) = tree.table().get_or_create_with(hash, || {
                    let p = PositionNode::new();
                    p.set_eval(&moves, &uniform_eval(hash, moves.len()));
                    p.sort_edges();
                    p
                });
                current.set_child(position);
                if created {
                    position.increment_n_in_flight(1);
                    path.push((current, Some(position)));
                } else {
                    // Transposition: adopt the shared value; the position's
                    // own counters belong to visits that pass through it.
                    path.push((current, None));
                }
                break (position.wl() as f32, position.d(), position.m());
            }
        }
    };

    let _guard = backprop.lock().expect("backprop lock poisoned");
    let mut value = v;
    let mut plies = m;
    for (node, position) in path.iter().rev() {
        node.finalize_score_update(value, d, plies, 1);
        if let Some(position) = position {
            position.finalize_score_update(value, d, plies, 1);
        }
        value = -value;
        plies += 1.0;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;
    use std::collections::HashSet;

    /// Strict aggregate check for trees without transpositions: every
    /// non-terminal visited position satisfies `n == 1 + sum(child n)`,
    /// and its value is the visit-weighted mean of the creation eval and
    /// the (flipped) child values.
    fn check_line_aggregates(game: &SetGame, position: &PositionNode, state: &SetState) {
        if position.is_terminal() || position.n() == 0 {
            return;
        }
        let mut child_visits = 0u32;
        let mut flipped_sum = 0.0f64;
        for index in 0..position.num_edges() {
            if let Some(node) = position.get_child_at(index) {
                child_visits += node.n();
                flipped_sum += -node.wl() * node.n() as f64;
                if let Some(below) = node.child() {
                    let next = game.apply(state, node.mv(false));
                    check_line_aggregates(game, below, &next);
                }
            }
        }
        assert_eq!(position.n(), 1 + child_visits, "visit accounting drifted");
        let creation = eval_value(game.hash(state)) as f64;
        let total = position.wl() * position.n() as f64;
        assert!(
            (total - (creation + flipped_sum)).abs() < 1e-3,
            "value accounting drifted: {total} vs {}",
            creation + flipped_sum
        );
    }

    /// Visit-count check that tolerates shared positions.
    fn check_dag_visit_counts(position: &PositionNode, seen: &mut HashSet<*const PositionNode>) {
        if !seen.insert(position as *const PositionNode) {
            return;
        }
        if !position.is_terminal() && position.n() > 0 {
            let child_visits: u32 = (0..position.num_edges())
                .filter_map(|i| position.get_child_at(i))
                .map(MoveNode::n)
                .sum();
            assert_eq!(position.n(), 1 + child_visits);
        }
        for index in 0..position.num_edges() {
            if let Some(below) = position.get_child_at(index).and_then(MoveNode::child) {
                check_dag_visit_counts(below, seen);
            }
        }
    }

    #[test]
    fn test_simulated_search_line_game_aggregates() {
        let tree = Tree::new(SetGame::line(4), "start").unwrap();
        for _ in 0..120 {
            assert!(run_uniform_visit(&tree));
        }
        assert!(tree.head().all_quiescent());
        let root = tree.head().child().expect("expanded");
        check_line_aggregates(tree.rules(), root, tree.head_state());
        // Single-parent positions mirror their arc exactly.
        assert_eq!(tree.head().n(), root.n());
        assert!((tree.head().wl() - root.wl()).abs() < 1e-9);
    }

    #[test]
    fn test_simulated_search_transposing_aggregates() {
        let tree = tiny_tree(4);
        for _ in 0..200 {
            assert!(run_uniform_visit(&tree));
        }
        assert!(tree.head().all_quiescent());
        let root = tree.head().child().expect("expanded");
        let mut seen = HashSet::new();
        check_dag_visit_counts(root, &mut seen);
        // One interned position per move subset, and some of them must
        // have been reached along more than one move order.
        assert!(seen.len() <= 1 << 4, "more positions than move subsets");
        assert_eq!(tree.table().len(), seen.len());
        let transposed = seen
            .iter()
            // SAFETY (test): table-owned positions, tree is idle.
            .filter(|position| unsafe { &***position }.is_transposition())
            .count();
        assert!(transposed > 0, "move-order swaps should share positions");
    }

    #[test]
    fn test_randomized_shapes_stay_consistent() {
        let mut rng = ChaCha20Rng::seed_from_u64(0xdecaf);
        for _ in 0..12 {
            let fanout = rng.gen_range(2..=6);
            let visits = rng.gen_range(1..=80);
            let tree = Tree::new(SetGame::line(fanout), "start").unwrap();
            for _ in 0..visits {
                assert!(run_uniform_visit(&tree));
            }
            assert!(tree.head().all_quiescent());
            if let Some(root) = tree.head().child() {
                check_line_aggregates(tree.rules(), root, tree.head_state());
            }
        }
    }

    #[test]
    fn test_multithreaded_visits_reach_quiescence() {
        let tree = tiny_tree(5);
        let backprop = Mutex::new(());
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let mut completed = 0;
                    while completed < 40 {
                        if run_uniform_visit_guarded(&tree, &backprop) {
                            completed += 1;
                        }
                    }
                });
            }
        });
        assert!(tree.head().all_quiescent(), "every start must be paired with an end");
        assert!(tree.head().n() >= 320 - 8, "amplified terminals aside, visits must land");
        assert!(!tree.table().is_empty());
        let mut seen = HashSet::new();
        // Counts may legitimately include racing creation visits on shared
        // positions, but the walk itself must be safe and every counter
        // settled.
        let root = tree.head().child().expect("expanded");
        collect_positions(root, &mut seen);
        for position in &seen {
            // SAFETY (test): positions are table-owned and the tree is idle.
            let position = unsafe { &**position };
            assert_eq!(position.n_in_flight(), 0);
        }
    }

    fn collect_positions(position: &PositionNode, seen: &mut HashSet<*const PositionNode>) {
        if !seen.insert(position as *const PositionNode) {
            return;
        }
        for index in 0..position.num_edges() {
            if let Some(below) = position.get_child_at(index).and_then(MoveNode::child) {
                collect_positions(below, seen);
            }
        }
    }

    #[test]
    fn test_collision_paths_cancel_cleanly() {
        let tree = tiny_tree(3);
        // Claim the head by hand so every visit collides at the top.
        assert!(tree.head().try_start_score_update());
        assert!(!run_uniform_visit(&tree));
        assert_eq!(tree.head().n_in_flight(), 1);
        tree.head().cancel_score_update(1);
        assert!(tree.head().all_quiescent());
        // With the claim gone, visits flow again.
        assert!(run_uniform_visit(&tree));
    }

    #[test]
    fn test_set_game_transposes() {
        let game = SetGame::new(3);
        let start = game.starting_state("start").unwrap();
        let ab = game.apply(&game.apply(&start, SetGame::mv(0)), SetGame::mv(1));
        let ba = game.apply(&game.apply(&start, SetGame::mv(1)), SetGame::mv(0));
        assert_eq!(game.hash(&ab), game.hash(&ba));

        let line = SetGame::line(3);
        let start = line.starting_state("start").unwrap();
        let ab = line.apply(&line.apply(&start, SetGame::mv(0)), SetGame::mv(1));
        let ba = line.apply(&line.apply(&start, SetGame::mv(1)), SetGame::mv(0));
        assert_ne!(line.hash(&ab), line.hash(&ba));
    }
}

//! Types at the boundary between the search graph and its collaborators.
//!
//! The graph itself never generates moves, hashes positions or runs a
//! network. Those jobs belong to the rules engine and the evaluator, and
//! this module defines the narrow data types they exchange with the graph:
//! [`Move`], [`GameResult`], [`NetworkEval`] and the [`GameRules`] trait.

use std::fmt;

use thiserror::Error;

/// Errors reported by a [`GameRules`] implementation.
#[derive(Debug, Error)]
pub enum RulesError {
    #[error("invalid FEN: {0}")]
    InvalidFen(String),

    #[error("move {0} is not legal in this position")]
    IllegalMove(Move),
}

/// A move packed into 16 bits: from-square (bits 0-5), to-square
/// (bits 6-11), promotion piece (bits 12-14).
///
/// Moves are stored from the point of view of the player making them, so
/// black's e7e5 is held as e2e4. [`Move::flipped`] recovers the opponent
/// view. The null move a1a1 marks "no move" (used by the game-begin node).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Move(u16);

/// Promotion piece encoding inside a [`Move`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    None = 0,
    Knight = 1,
    Bishop = 2,
    Rook = 3,
    Queen = 4,
}

impl Move {
    pub const NULL: Move = Move(0);

    pub fn new(from: u8, to: u8) -> Self {
        debug_assert!(from < 64 && to < 64);
        Move(from as u16 | (to as u16) << 6)
    }

    pub fn with_promotion(from: u8, to: u8, promo: Promotion) -> Self {
        Move(from as u16 | (to as u16) << 6 | (promo as u16) << 12)
    }

    pub fn from_square(self) -> u8 {
        (self.0 & 0x3f) as u8
    }

    pub fn to_square(self) -> u8 {
        (self.0 >> 6 & 0x3f) as u8
    }

    pub fn promotion(self) -> Promotion {
        match self.0 >> 12 & 0x7 {
            1 => Promotion::Knight,
            2 => Promotion::Bishop,
            3 => Promotion::Rook,
            4 => Promotion::Queen,
            _ => Promotion::None,
        }
    }

    /// The same move seen from the other side of the board (ranks
    /// mirrored, files unchanged).
    pub fn flipped(self) -> Move {
        Move(self.0 & 0x7000 | (self.0 ^ 0x0e38) & 0x0fff)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Raw 16-bit payload, for compact storage alongside other fields.
    pub(crate) fn raw(self) -> u16 {
        self.0
    }

    pub(crate) fn from_raw(raw: u16) -> Self {
        Move(raw)
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sq = |s: u8| [(b'a' + s % 8) as char, (b'1' + s / 8) as char];
        let [ff, fr] = sq(self.from_square());
        let [tf, tr] = sq(self.to_square());
        write!(f, "{ff}{fr}{tf}{tr}")?;
        match self.promotion() {
            Promotion::None => Ok(()),
            Promotion::Knight => write!(f, "n"),
            Promotion::Bishop => write!(f, "b"),
            Promotion::Rook => write!(f, "r"),
            Promotion::Queen => write!(f, "q"),
        }
    }
}

/// Ordered list of legal moves for one position, as produced by the rules
/// engine.
pub type MoveList = Vec<Move>;

/// Outcome of a game, from the perspective of the player the enclosing
/// node speaks for. The ordering `BlackWon < Draw < WhiteWon` is what
/// terminal bounds arithmetic relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GameResult {
    BlackWon = 0,
    Draw = 1,
    WhiteWon = 2,
}

impl GameResult {
    /// The result as seen by the other player.
    pub fn flipped(self) -> GameResult {
        match self {
            GameResult::BlackWon => GameResult::WhiteWon,
            GameResult::Draw => GameResult::Draw,
            GameResult::WhiteWon => GameResult::BlackWon,
        }
    }

    /// W-minus-L value of a proven result.
    pub fn wl(self) -> f64 {
        match self {
            GameResult::BlackWon => -1.0,
            GameResult::Draw => 0.0,
            GameResult::WhiteWon => 1.0,
        }
    }

    pub(crate) fn from_bits(bits: u8) -> GameResult {
        match bits {
            0 => GameResult::BlackWon,
            1 => GameResult::Draw,
            _ => GameResult::WhiteWon,
        }
    }
}

/// How a node came to be terminal, if it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    NonTerminal = 0,
    EndOfGame = 1,
    Tablebase = 2,
}

impl Terminal {
    pub(crate) fn from_bits(bits: u8) -> Terminal {
        match bits {
            1 => Terminal::EndOfGame,
            2 => Terminal::Tablebase,
            _ => Terminal::NonTerminal,
        }
    }
}

/// Proved best/worst outcome for a node: `(lower, upper)`.
pub type Bounds = (GameResult, GameResult);

/// What the evaluator returns for one position: a value in [-1, 1] for the
/// side that just moved, a draw probability, an estimate of remaining
/// plies, and one prior per legal move (`priors.len() == num_edges`).
#[derive(Debug, Clone)]
pub struct NetworkEval {
    pub value: f32,
    pub draw: f32,
    pub moves_left: f32,
    pub priors: Vec<f32>,
}

/// The rules engine as the graph sees it: enough to reconstruct a history
/// from a FEN plus moves, enumerate legal moves and hash positions.
///
/// Hashes are trusted for identity (Zobrist-grade); the implementation is
/// the ground truth for position equality.
pub trait GameRules {
    type State: Clone;

    fn starting_state(&self, fen: &str) -> Result<Self::State, RulesError>;

    fn legal_moves(&self, state: &Self::State) -> MoveList;

    fn apply(&self, state: &Self::State, mv: Move) -> Self::State;

    fn hash(&self, state: &Self::State) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_pack_round_trip() {
        let mv = Move::new(12, 28); // e2e4
        assert_eq!(mv.from_square(), 12);
        assert_eq!(mv.to_square(), 28);
        assert_eq!(mv.promotion(), Promotion::None);
        assert_eq!(mv.to_string(), "e2e4");
    }

    #[test]
    fn test_move_promotion() {
        let mv = Move::with_promotion(52, 60, Promotion::Queen); // e7e8q
        assert_eq!(mv.promotion(), Promotion::Queen);
        assert_eq!(mv.to_string(), "e7e8q");
    }

    #[test]
    fn test_move_flip_mirrors_ranks() {
        let mv = Move::new(12, 28); // e2e4
        let flipped = mv.flipped(); // e7e5
        assert_eq!(flipped.to_string(), "e7e5");
        assert_eq!(flipped.flipped(), mv);
    }

    #[test]
    fn test_null_move() {
        assert!(Move::NULL.is_null());
        assert_eq!(Move::NULL.to_string(), "a1a1");
        assert!(!Move::new(0, 1).is_null());
    }

    #[test]
    fn test_game_result_order_and_flip() {
        assert!(GameResult::BlackWon < GameResult::Draw);
        assert!(GameResult::Draw < GameResult::WhiteWon);
        assert_eq!(GameResult::WhiteWon.flipped(), GameResult::BlackWon);
        assert_eq!(GameResult::Draw.flipped(), GameResult::Draw);
        assert!((GameResult::WhiteWon.wl() - 1.0).abs() < f64::EPSILON);
    }
}

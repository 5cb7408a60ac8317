//! Potential arcs out of a position: a move plus a compressed prior.
//!
//! An [`Edge`] is 4 bytes: the packed move and the policy prior squeezed
//! into a 16-bit minifloat (5-bit exponent, 11-bit significand). Both
//! halves sit in atomics so priors can be rewritten in place (network
//! output arriving, root noise) and the whole array can be sorted through
//! shared references during the window in which the owning position has no
//! realized children yet.

use std::sync::atomic::{AtomicU16, Ordering};

use crate::game::{Move, MoveList};

/// Compress a prior in [0, 1] to 16 bits: drop the low 12 mantissa bits of
/// the f32, rebias the exponent by 3<<28 and round at the cut. Exact for
/// the representable set, monotonic everywhere, so compressed values
/// compare the same way the floats do.
pub(crate) fn compress_p(p: f32) -> u16 {
    debug_assert!((0.0..=1.0).contains(&p), "prior {p} outside [0, 1]");
    const ROUNDING: i32 = (1 << 11) - (3 << 28);
    let bits = (p.to_bits() as i32).wrapping_add(ROUNDING);
    if bits < 0 {
        0
    } else {
        (bits >> 12) as u16
    }
}

pub(crate) fn decompress_p(p: u16) -> f32 {
    f32::from_bits(((p as u32) << 12).wrapping_add(3 << 28))
}

/// One potential move out of a position, with its policy prior.
///
/// Created in bulk by [`Edge::from_moves`] with zero priors; the prior is
/// filled in once the network answers.
#[derive(Debug)]
pub struct Edge {
    mv: AtomicU16,
    p: AtomicU16,
}

impl Edge {
    /// Build the edge array for a move list, all priors zero.
    pub fn from_moves(moves: &MoveList) -> Box<[Edge]> {
        moves
            .iter()
            .map(|mv| Edge {
                mv: AtomicU16::new(mv.raw()),
                p: AtomicU16::new(0),
            })
            .collect()
    }

    /// The move, from the mover's point of view, or from the opponent's if
    /// `as_opponent` is set.
    pub fn mv(&self, as_opponent: bool) -> Move {
        let mv = Move::from_raw(self.mv.load(Ordering::Relaxed));
        if as_opponent {
            mv.flipped()
        } else {
            mv
        }
    }

    /// Decompressed policy prior in [0, 1].
    pub fn p(&self) -> f32 {
        decompress_p(self.p.load(Ordering::Relaxed))
    }

    /// Store a prior; lossy, see [`compress_p`].
    pub fn set_p(&self, p: f32) {
        self.p.store(compress_p(p), Ordering::Relaxed);
    }

    /// Packed (move, prior) pair; what a realized child copies into its
    /// own cache line.
    pub(crate) fn packed(&self) -> u32 {
        self.mv.load(Ordering::Relaxed) as u32 | (self.p.load(Ordering::Relaxed) as u32) << 16
    }

    /// Explicit copy; the atomic fields keep `Edge` out of `Clone`.
    pub(crate) fn copy(&self) -> Edge {
        Edge {
            mv: AtomicU16::new(self.mv.load(Ordering::Relaxed)),
            p: AtomicU16::new(self.p.load(Ordering::Relaxed)),
        }
    }

    /// Sort a position's edges by descending prior, in place.
    ///
    /// Only legal while the owning position has no realized children; the
    /// caller holds that contract. Compressed priors order like the floats
    /// they encode, so the raw u16 is the sort key. The sort is stable, so
    /// equal priors keep generation order and selection tie-breaks stay
    /// deterministic.
    pub(crate) fn sort_slice(edges: &[Edge]) {
        let mut keyed: Vec<(u16, u16)> = edges
            .iter()
            .map(|e| (e.p.load(Ordering::Relaxed), e.mv.load(Ordering::Relaxed)))
            .collect();
        keyed.sort_by(|a, b| b.0.cmp(&a.0));
        for (slot, (p, mv)) in edges.iter().zip(keyed) {
            slot.mv.store(mv, Ordering::Relaxed);
            slot.p.store(p, Ordering::Relaxed);
        }
    }
}

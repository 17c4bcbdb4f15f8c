//! Rebasing concurrent operations.
//!
//! Given `a` and `b` built against the same text, `transform(a, b, side)`
//! yields `a'` that applies after `b`, with
//!
//! ```text
//! apply(apply(S, b), transform(a, b, side)) == apply(apply(S, a), transform(b, a, side.flip()))
//! ```
//!
//! Rules, per overlapping region:
//!
//! | `a` \ `b` | insert | delete |
//! |-----------|--------|--------|
//! | insert | same offset: `side` picks who goes first; otherwise shift past | inside the deleted range: clamp to its start |
//! | delete | split around the inserted text | overlap removed once; an emptied delete disappears |
//!
//! The tie-break must be computed the same way by both peers. Use
//! [`Side::from_ids`] with the two operations' origin ids: the lower id's
//! insert lands first, whoever runs the transform.

use serde::{Deserialize, Serialize};

use crate::operation::Operation;
use crate::span::Spans;

/// Which operation wins an insert/insert tie at the same offset.
///
/// `Left` means the operation being transformed inserts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn flip(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    /// Tie-break for an operation from `own` being transformed against one
    /// from `other`.
    ///
    /// The lower id goes first. `from_ids(a, b) == from_ids(b, a).flip()` for
    /// any two distinct ids. Equal ids cannot be concurrent (one connection
    /// never races itself) and resolve to `Left`.
    pub fn from_ids<T: Ord + ?Sized>(own: &T, other: &T) -> Self {
        if own <= other {
            Side::Left
        } else {
            Side::Right
        }
    }
}

/// Rebase `op` so it applies after `against`.
pub fn transform(op: &Operation, against: &Operation, side: Side) -> Operation {
    if op.is_noop() || against.is_noop() {
        return op.clone();
    }
    let rebased = Spans::from_components(op.components())
        .transform(&Spans::from_components(against.components()), side);
    Operation::new(rebased.to_components())
}

/// Both directions at once: `(a', b')`, where `side` is `a`'s.
pub fn transform_pair(a: &Operation, b: &Operation, side: Side) -> (Operation, Operation) {
    (transform(a, b, side), transform(b, a, side.flip()))
}

//! The four input-mutation analyses.
//!
//! All four share the same shape: `start` binds the analysis to a leaf,
//! `generate_next_input` emits the next candidate bit sequence,
//! `process_execution_results` feeds the resulting trace back, and the
//! analysis flips to ready once it has nothing more to try. The scheduler
//! drives exactly one of them at a time through a tagged variant, so each
//! can hold differently shaped state.

pub mod bitshare;
pub mod minimization;
pub mod sensitivity;
pub mod typed_minimization;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use quarry_wire::BranchingCoverageInfo;

use crate::trace::ExecutionPath;

pub use bitshare::BitshareAnalysis;
pub use minimization::MinimizationAnalysis;
pub use sensitivity::SensitivityAnalysis;
pub use typed_minimization::TypedMinimizationAnalysis;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnalysisState {
    Ready,
    Busy,
}

/// What a candidate execution revealed about the attacked leaf.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LeafObservation {
    /// The candidate diverged before reaching the leaf.
    NotReached,
    /// The leaf was reached and took its usual direction.
    Value(f64),
    /// The leaf was reached and took the opposite direction.
    Flipped,
}

/// Walk `trace` in lockstep with the stored `path` (root to leaf,
/// inclusive) and report what happened at the leaf.
pub fn observe_leaf(path: &ExecutionPath, trace: &[BranchingCoverageInfo]) -> LeafObservation {
    let leaf_index = match path.len().checked_sub(1) {
        Some(i) => i,
        None => return LeafObservation::NotReached,
    };
    for (k, (id, direction)) in path.iter().enumerate() {
        let step = match trace.get(k) {
            Some(step) => step,
            None => return LeafObservation::NotReached,
        };
        if step.id != *id {
            return LeafObservation::NotReached;
        }
        if k == leaf_index {
            return if step.direction == *direction {
                LeafObservation::Value(step.value)
            } else {
                LeafObservation::Flipped
            };
        }
        if step.direction != *direction {
            return LeafObservation::NotReached;
        }
    }
    LeafObservation::NotReached
}

/// Fingerprint of a candidate bit vector, for duplicate suppression.
pub fn bits_fingerprint(bits: &[bool]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bits.hash(&mut hasher);
    hasher.finish()
}

/// `new` is a real improvement over `old`. Branching values are never
/// compared for equality; this is the one tolerance used everywhere.
pub fn improves(old: f64, new: f64) -> bool {
    if !old.is_finite() {
        return new.is_finite();
    }
    new < old - 1e-12 * old.abs().max(1.0)
}

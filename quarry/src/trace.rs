//! Execution traces and their projection to paths.

use quarry_wire::{BranchingCoverageInfo, LocationId};

use crate::stdin_bits::StdinBitsAndTypes;

pub type ExecutionTrace = Vec<BranchingCoverageInfo>;

/// `(location, taken direction)` pairs; two traces define the same path
/// iff their projections are equal elementwise.
pub type ExecutionPath = Vec<(LocationId, bool)>;

pub fn execution_path(trace: &[BranchingCoverageInfo]) -> ExecutionPath {
    trace.iter().map(|info| (info.id, info.direction)).collect()
}

fn hash_combine(seed: &mut u64, value: u64) {
    *seed ^= value
        .wrapping_add(0x9e3779b9)
        .wrapping_add(*seed << 6)
        .wrapping_add(*seed >> 2);
}

/// Stable fingerprint of a path, independent of the tree's node identity.
pub fn path_hash(path: &ExecutionPath) -> u64 {
    let mut result = 0u64;
    for (id, direction) in path {
        hash_combine(&mut result, id.id as u64);
        hash_combine(&mut result, id.context_hash as u64);
        hash_combine(&mut result, if *direction { 1033 } else { 7919 });
    }
    result
}

/// One execution's replayed input together with the trace it produced.
/// Shared by every tree node whose best value it set.
#[derive(Debug)]
pub struct TraceInput {
    pub input: StdinBitsAndTypes,
    pub trace: ExecutionTrace,
}

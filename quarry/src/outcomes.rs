//! Run budget and final outcome bookkeeping.

use std::collections::HashMap;

use quarry_wire::LocationId;

use crate::analysis::bitshare::BitshareStats;
use crate::analysis::minimization::MinimizationStats;
use crate::analysis::sensitivity::SensitivityStats;
use crate::analysis::typed_minimization::TypedMinimizationStats;
use crate::optimizer::OptimizerStats;
use crate::record::OutputStatistics;
use crate::tree::TreeStats;

/// Budget for a fuzzing run.
#[derive(Clone, Copy, Debug)]
pub struct TerminationInfo {
    pub max_executions: u32,
    pub max_seconds: u64,
}

impl Default for TerminationInfo {
    fn default() -> Self {
        Self {
            max_executions: u32::MAX,
            max_seconds: u64::MAX,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationType {
    Normal,
    ServerInternalError,
    ClientCommunicationError,
}

/// Why a normally terminated run stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    AllReachableBranchingsCovered,
    AllTestsWereProcessed,
    TimeBudgetDepleted,
    Interrupted,
}

#[derive(Clone, Debug, Default)]
pub struct FuzzerStats {
    pub executions: u64,
    pub max_trace_length: usize,
    pub max_input_bits: usize,
    pub leaves_attacked: u64,
    pub leaves_closed: u64,
    pub crashes: u64,
    pub boundary_violations: u64,
    pub communication_retries: u64,
    pub br_instrs_covered: u64,
}

/// Everything a finished run reports back to the caller.
#[derive(Debug)]
pub struct AnalysisOutcomes {
    pub termination_type: TerminationType,
    /// Valid only when `termination_type == Normal`.
    pub termination_reason: TerminationReason,
    /// Valid only when `termination_type != Normal`.
    pub error_message: String,
    pub num_executions: u64,
    pub num_elapsed_seconds: f64,
    /// Locations with both directions covered, sorted.
    pub covered_branchings: Vec<LocationId>,
    /// `(location, missing direction)` pairs, sorted.
    pub uncovered_branchings: Vec<(LocationId, bool)>,
    pub sensitivity_statistics: SensitivityStats,
    pub typed_minimization_statistics: TypedMinimizationStats,
    pub minimization_statistics: MinimizationStats,
    pub bitshare_statistics: BitshareStats,
    pub fuzzer_statistics: FuzzerStats,
    pub tree_statistics: TreeStats,
    pub optimizer_statistics: OptimizerStats,
    pub output_statistics: HashMap<String, OutputStatistics>,
}

impl Default for AnalysisOutcomes {
    fn default() -> Self {
        Self {
            termination_type: TerminationType::Normal,
            termination_reason: TerminationReason::AllReachableBranchingsCovered,
            error_message: String::new(),
            num_executions: 0,
            num_elapsed_seconds: 0.0,
            covered_branchings: Vec::new(),
            uncovered_branchings: Vec::new(),
            sensitivity_statistics: SensitivityStats::default(),
            typed_minimization_statistics: TypedMinimizationStats::default(),
            minimization_statistics: MinimizationStats::default(),
            bitshare_statistics: BitshareStats::default(),
            fuzzer_statistics: FuzzerStats::default(),
            tree_statistics: TreeStats::default(),
            optimizer_statistics: OptimizerStats::default(),
            output_statistics: HashMap::new(),
        }
    }
}

impl AnalysisOutcomes {
    /// Fully covered means every discovered branching has both directions
    /// covered.
    pub fn is_fully_covered(&self) -> bool {
        self.uncovered_branchings.is_empty()
    }
}

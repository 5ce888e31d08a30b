//! Sensitivity analysis: one bit flip per execution.
//!
//! For the input that reached the attacked leaf, every bit is flipped in
//! turn. A flipped bit that changes the branching value of any node on the
//! shared trace prefix is recorded as sensitive for that node; the walk
//! stops at the first direction divergence. All bits are probed, so the
//! later phases see a complete sensitivity set.

use std::sync::Arc;

use log::debug;

use crate::analysis::AnalysisState;
use crate::stdin_bits::Bits;
use crate::trace::{ExecutionTrace, TraceInput};
use crate::tree::{BranchingTree, NodeId};

#[derive(Debug, Default, Clone)]
pub struct SensitivityStats {
    pub generated_inputs: u64,
    pub max_bits: usize,
    pub start_calls: u64,
    pub stop_calls_regular: u64,
    pub stop_calls_early: u64,
}

pub struct SensitivityAnalysis {
    state: AnalysisState,
    node: Option<NodeId>,
    /// Nodes on the path root -> leaf, aligned with the stored trace.
    path: Vec<NodeId>,
    trace_input: Option<Arc<TraceInput>>,
    mutated_bit_index: usize,
    stats: SensitivityStats,
}

impl Default for SensitivityAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

impl SensitivityAnalysis {
    pub fn new() -> Self {
        Self {
            state: AnalysisState::Ready,
            node: None,
            path: Vec::new(),
            trace_input: None,
            mutated_bit_index: 0,
            stats: SensitivityStats::default(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == AnalysisState::Ready
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn stats(&self) -> &SensitivityStats {
        &self.stats
    }

    /// Bind to a leaf. Returns false when the leaf has no reaching input
    /// to mutate (nothing to do).
    pub fn start(&mut self, tree: &BranchingTree, node: NodeId) -> bool {
        debug_assert!(self.is_ready());
        let trace_input = match tree.best_input_reaching(node) {
            Some(input) => input,
            None => return false,
        };
        self.path = tree.path_to_root(node);
        self.stats.max_bits = self.stats.max_bits.max(trace_input.input.num_bits());
        self.trace_input = Some(trace_input);
        self.node = Some(node);
        self.mutated_bit_index = 0;
        self.state = AnalysisState::Busy;
        self.stats.start_calls += 1;
        true
    }

    pub fn stop(&mut self) {
        if self.state != AnalysisState::Busy {
            return;
        }
        let total = self
            .trace_input
            .as_ref()
            .map(|t| t.input.num_bits())
            .unwrap_or(0);
        if self.mutated_bit_index < total {
            self.stats.stop_calls_early += 1;
        } else {
            self.stats.stop_calls_regular += 1;
        }
        self.state = AnalysisState::Ready;
    }

    /// Next candidate: the reaching input with one more bit flipped. Once
    /// every bit has been probed the whole path is marked as analysed and
    /// the analysis stops.
    pub fn generate_next_input(&mut self, tree: &mut BranchingTree) -> Option<Bits> {
        if self.state != AnalysisState::Busy {
            return None;
        }
        let trace_input = self.trace_input.as_ref()?;
        if self.mutated_bit_index == trace_input.input.num_bits() {
            for id in &self.path {
                tree.node_mut(*id).sensitivity_performed = true;
            }
            debug!(
                "sensitivity done for node guid {} over {} bits",
                self.node.map(|n| tree.node(n).guid).unwrap_or(0),
                trace_input.input.num_bits()
            );
            self.stop();
            return None;
        }
        let mut bits = trace_input.input.bits().clone();
        bits[self.mutated_bit_index] = !bits[self.mutated_bit_index];
        self.mutated_bit_index += 1;
        self.stats.generated_inputs += 1;
        Some(bits)
    }

    /// Lockstep walk of the candidate trace against the stored one. The
    /// probed bit becomes sensitive for every prefix node whose value
    /// changed; the walk ends at the first direction divergence. A
    /// candidate whose very first branching differs is discarded here (the
    /// tree has already integrated whatever it produced).
    pub fn process_execution_results(&mut self, tree: &mut BranchingTree, trace: &ExecutionTrace) {
        debug_assert!(self.state == AnalysisState::Busy);
        let trace_input = match self.trace_input.as_ref() {
            Some(t) => t,
            None => return,
        };
        let probed_bit = match self.mutated_bit_index.checked_sub(1) {
            Some(index) => index as u32,
            None => return,
        };
        for (k, node_id) in self.path.iter().enumerate() {
            let orig = match trace_input.trace.get(k) {
                Some(step) => step,
                None => break,
            };
            let curr = match trace.get(k) {
                Some(step) => step,
                None => break,
            };
            if orig.id != curr.id {
                break;
            }
            if orig.value != curr.value {
                tree.node_mut(*node_id).sensitive_stdin_bits.insert(probed_bit);
            }
            if orig.direction != curr.direction {
                break;
            }
        }
    }
}

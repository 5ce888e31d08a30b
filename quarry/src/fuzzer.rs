//! The scheduler: picks the next leaf and analysis, drives one target
//! execution per step, and routes the results back into the tree and the
//! active analysis.
//!
//! The engine is single-threaded and cooperative. The only suspension
//! points are the executor call and the budget/cancellation check at the
//! top of the loop; per-analysis state lives in the four analysis structs
//! and only the tree persists across them.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use anyhow::anyhow;
use log::{debug, info, warn};

use quarry_wire::TargetTermination;

use crate::analysis::{
    BitshareAnalysis, MinimizationAnalysis, SensitivityAnalysis, TypedMinimizationAnalysis,
};
use crate::executor::{ExecutionResult, TargetExecutor};
use crate::optimizer::{self, CoveragePair, SuiteCandidate};
use crate::outcomes::{
    AnalysisOutcomes, FuzzerStats, TerminationInfo, TerminationReason, TerminationType,
};
use crate::progress::ProgressRecorder;
use crate::record::{ExecutionRecord, ExecutionRecordWriter};
use crate::stdin_bits::{Bits, StdinBitsAndTypes};
use crate::trace::{execution_path, TraceInput};
use crate::tree::{BranchingTree, NodeId};

/// Which analysis currently owns the attacked leaf.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ActiveKind {
    Sensitivity,
    TypedMinimization,
    Minimization,
    Bitshare,
}

impl ActiveKind {
    fn name(self) -> &'static str {
        match self {
            ActiveKind::Sensitivity => "sensitivity",
            ActiveKind::TypedMinimization => "typed_minimization",
            ActiveKind::Minimization => "minimization",
            ActiveKind::Bitshare => "bitshare",
        }
    }
}

/// Frontier entry; the heap yields the smallest (value, depth, guid).
struct FrontierEntry {
    value: f64,
    depth: u32,
    guid: u64,
    node: NodeId,
    /// Weak snapshot of the reaching input; a dead handle means the input
    /// was superseded and the entry is stale.
    input: Weak<TraceInput>,
}

impl FrontierEntry {
    fn key_cmp(&self, other: &Self) -> Ordering {
        self.value
            .total_cmp(&other.value)
            .then(self.depth.cmp(&other.depth))
            .then(self.guid.cmp(&other.guid))
    }
}

impl PartialEq for FrontierEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key_cmp(other) == Ordering::Equal
    }
}

impl Eq for FrontierEntry {}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert to pop the smallest key.
        other.key_cmp(self)
    }
}

enum RunError {
    Communication(anyhow::Error),
    Internal(anyhow::Error),
}

pub struct Fuzzer<E: TargetExecutor> {
    executor: E,
    termination: TerminationInfo,
    tree: BranchingTree,
    frontier: BinaryHeap<FrontierEntry>,
    sensitivity: SensitivityAnalysis,
    typed_minimization: TypedMinimizationAnalysis,
    minimization: MinimizationAnalysis,
    bitshare: BitshareAnalysis,
    active: Option<(ActiveKind, NodeId)>,
    writer: Option<ExecutionRecordWriter>,
    progress: Option<ProgressRecorder>,
    cancel: Arc<AtomicBool>,
    stats: FuzzerStats,
    suite_candidates: Vec<SuiteCandidate>,
    pre_covered: HashSet<CoveragePair>,
    br_instr_coverage: HashSet<(u64, bool)>,
}

impl<E: TargetExecutor> Fuzzer<E> {
    pub fn new(
        executor: E,
        termination: TerminationInfo,
        writer: Option<ExecutionRecordWriter>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            executor,
            termination,
            tree: BranchingTree::new(),
            frontier: BinaryHeap::new(),
            sensitivity: SensitivityAnalysis::new(),
            typed_minimization: TypedMinimizationAnalysis::new(),
            minimization: MinimizationAnalysis::new(),
            bitshare: BitshareAnalysis::new(),
            active: None,
            writer,
            progress: None,
            cancel,
            stats: FuzzerStats::default(),
            suite_candidates: Vec::new(),
            pre_covered: HashSet::new(),
            br_instr_coverage: HashSet::new(),
        }
    }

    pub fn tree(&self) -> &BranchingTree {
        &self.tree
    }

    pub fn set_progress_recorder(&mut self, recorder: ProgressRecorder) {
        self.progress = Some(recorder);
    }

    /// Run to completion and assemble the outcomes.
    pub async fn run(&mut self) -> AnalysisOutcomes {
        let started = Instant::now();
        let mut outcomes = AnalysisOutcomes::default();
        match self.fuzz_loop(started).await {
            Ok(reason) => {
                outcomes.termination_type = TerminationType::Normal;
                outcomes.termination_reason = reason;
            }
            Err(RunError::Communication(err)) => {
                outcomes.termination_type = TerminationType::ClientCommunicationError;
                outcomes.error_message = format!("{err:#}");
            }
            Err(RunError::Internal(err)) => {
                outcomes.termination_type = TerminationType::ServerInternalError;
                outcomes.error_message = format!("{err:#}");
            }
        }
        self.stop_active_early();
        outcomes.optimizer_statistics = self.write_minimized_suite();

        let mut coverage: Vec<_> = self.tree.coverage_by_location().into_iter().collect();
        coverage.sort_by_key(|(id, _)| *id);
        for (id, [false_covered, true_covered]) in coverage {
            if false_covered && true_covered {
                outcomes.covered_branchings.push(id);
            } else if !true_covered {
                outcomes.uncovered_branchings.push((id, true));
            } else {
                outcomes.uncovered_branchings.push((id, false));
            }
        }

        outcomes.num_executions = self.stats.executions;
        outcomes.num_elapsed_seconds = started.elapsed().as_secs_f64();
        outcomes.sensitivity_statistics = self.sensitivity.stats().clone();
        outcomes.typed_minimization_statistics = self.typed_minimization.stats().clone();
        outcomes.minimization_statistics = self.minimization.stats().clone();
        outcomes.bitshare_statistics = self.bitshare.stats().clone();
        outcomes.tree_statistics = self.tree.stats().clone();
        self.stats.br_instrs_covered = self.br_instr_coverage.len() as u64;
        outcomes.fuzzer_statistics = self.stats.clone();
        if let Some(writer) = &self.writer {
            outcomes
                .output_statistics
                .insert("default".to_string(), writer.statistics().clone());
        }
        info!(
            "run finished: {:?} after {} executions, {} branchings covered, {} uncovered",
            outcomes.termination_reason,
            outcomes.num_executions,
            outcomes.covered_branchings.len(),
            outcomes.uncovered_branchings.len(),
        );
        outcomes
    }

    async fn fuzz_loop(&mut self, started: Instant) -> Result<TerminationReason, RunError> {
        // Bootstrap: one empty input discovers the entry branching and the
        // consumed input shape.
        self.execute_and_integrate(Vec::new()).await?;

        loop {
            if self.cancel.load(AtomicOrdering::Relaxed) {
                info!("cancellation requested, exiting loop");
                return Ok(TerminationReason::Interrupted);
            }
            if started.elapsed().as_secs() >= self.termination.max_seconds {
                return Ok(TerminationReason::TimeBudgetDepleted);
            }
            if self.stats.executions >= self.termination.max_executions as u64 {
                return Ok(TerminationReason::AllTestsWereProcessed);
            }

            if self.active.is_none() {
                if !self.select_attack()? {
                    return Ok(TerminationReason::AllReachableBranchingsCovered);
                }
                continue;
            }

            let bits = match self.generate_active() {
                Some(bits) => bits,
                None => {
                    self.finish_active();
                    continue;
                }
            };
            let trace = self.execute_and_integrate(bits).await?;
            self.process_active(&trace);
        }
    }

    /// Fixed analysis order, gated on the per-node phase flags and each
    /// analysis' precondition. A precondition that can never hold marks
    /// the phase as performed and falls through to the next one. A leaf
    /// that exhausted all four phases without a flip is proven unflippable
    /// and closed.
    fn select_attack(&mut self) -> Result<bool, RunError> {
        loop {
            let entry = match self.frontier.pop() {
                Some(entry) => entry,
                None => {
                    self.rebuild_frontier();
                    match self.frontier.pop() {
                        Some(entry) => entry,
                        None => return Ok(false),
                    }
                }
            };
            let node = entry.node;
            if (node.0 as usize) >= self.tree.len() {
                return Err(RunError::Internal(anyhow!("frontier entry out of arena")));
            }
            if self.tree.node(node).closed || self.tree.node(node).uncovered_direction().is_none()
            {
                continue;
            }
            if entry.input.upgrade().is_none() {
                // Superseded input; re-enter with a fresh snapshot.
                self.push_node(node);
                continue;
            }

            let (sensitivity_done, no_sensitive_bits, typed_done, minimization_done, bitshare_done) = {
                let n = self.tree.node(node);
                (
                    n.sensitivity_performed,
                    n.sensitive_stdin_bits.is_empty(),
                    n.typed_minimization_performed,
                    n.minimization_performed,
                    n.bitshare_performed,
                )
            };
            let kind = if !sensitivity_done {
                if self.sensitivity.start(&self.tree, node) {
                    ActiveKind::Sensitivity
                } else {
                    // A leaf with a covered direction always has a
                    // reaching input; its absence is an engine bug.
                    return Err(RunError::Internal(anyhow!(
                        "leaf guid {} has no reaching input",
                        self.tree.node(node).guid
                    )));
                }
            } else if no_sensitive_bits {
                // Sensitivity proved no input bit reaches this branching:
                // it cannot be flipped.
                self.close_leaf(node);
                continue;
            } else if !typed_done {
                if self.typed_minimization.start(&self.tree, node) {
                    ActiveKind::TypedMinimization
                } else {
                    self.tree.node_mut(node).typed_minimization_performed = true;
                    self.push_node(node);
                    continue;
                }
            } else if !minimization_done {
                if self.minimization.start(&self.tree, node) {
                    ActiveKind::Minimization
                } else {
                    self.tree.node_mut(node).minimization_performed = true;
                    self.push_node(node);
                    continue;
                }
            } else if !bitshare_done {
                if self.bitshare.start(&self.tree, node) {
                    ActiveKind::Bitshare
                } else {
                    self.tree.node_mut(node).bitshare_performed = true;
                    self.push_node(node);
                    continue;
                }
            } else {
                // All phases ran and the direction stayed uncovered.
                self.close_leaf(node);
                continue;
            };

            debug!(
                "attacking node guid {} (location {:?}) with {:?}",
                self.tree.node(node).guid,
                self.tree.node(node).id,
                kind
            );
            self.active = Some((kind, node));
            self.stats.leaves_attacked += 1;
            if let Some(progress) = &mut self.progress {
                progress.analysis_started(
                    kind.name(),
                    self.tree.node(node).guid,
                    self.tree.node(node).id.id,
                );
            }
            return Ok(true);
        }
    }

    fn close_leaf(&mut self, node: NodeId) {
        self.tree.mark_closed(node);
        self.stats.leaves_closed += 1;
        if let Some(progress) = &mut self.progress {
            progress.leaf_closed(self.tree.node(node).guid);
        }
    }

    fn generate_active(&mut self) -> Option<Bits> {
        match self.active {
            Some((ActiveKind::Sensitivity, _)) => {
                self.sensitivity.generate_next_input(&mut self.tree)
            }
            Some((ActiveKind::TypedMinimization, _)) => {
                self.typed_minimization.generate_next_input(&mut self.tree)
            }
            Some((ActiveKind::Minimization, _)) => {
                self.minimization.generate_next_input(&mut self.tree)
            }
            Some((ActiveKind::Bitshare, _)) => self.bitshare.generate_next_input(&mut self.tree),
            None => None,
        }
    }

    fn process_active(&mut self, trace: &Arc<TraceInput>) {
        match self.active {
            Some((ActiveKind::Sensitivity, _)) => self
                .sensitivity
                .process_execution_results(&mut self.tree, &trace.trace),
            Some((ActiveKind::TypedMinimization, _)) => self
                .typed_minimization
                .process_execution_results(&mut self.tree, &trace.trace),
            Some((ActiveKind::Minimization, _)) => self
                .minimization
                .process_execution_results(&mut self.tree, &trace.trace),
            Some((ActiveKind::Bitshare, _)) => {
                self.bitshare.process_execution_results(&mut self.tree)
            }
            None => {}
        }
    }

    fn finish_active(&mut self) {
        let (kind, node) = match self.active.take() {
            Some(active) => active,
            None => return,
        };
        match kind {
            ActiveKind::Sensitivity => self.sensitivity.stop(),
            ActiveKind::TypedMinimization => {
                self.tree.node_mut(node).typed_minimization_performed = true;
                self.typed_minimization.stop();
            }
            ActiveKind::Minimization => {
                self.tree.node_mut(node).minimization_performed = true;
                self.minimization.stop();
            }
            ActiveKind::Bitshare => {
                self.tree.node_mut(node).bitshare_performed = true;
                self.bitshare.stop();
            }
        }
        if let Some(progress) = &mut self.progress {
            progress.analysis_finished(kind.name(), self.tree.node(node).guid);
        }
        if (node.0 as usize) < self.tree.len() {
            self.push_node(node);
        }
    }

    fn stop_active_early(&mut self) {
        self.sensitivity.stop();
        self.typed_minimization.stop();
        self.minimization.stop();
        self.bitshare.stop();
        self.active = None;
    }

    fn push_node(&mut self, node: NodeId) {
        let n = self.tree.node(node);
        if n.closed || n.uncovered_direction().is_none() {
            return;
        }
        let input = match self.tree.best_input_reaching(node) {
            Some(input) => Arc::downgrade(&input),
            None => return,
        };
        self.frontier.push(FrontierEntry {
            value: n.min_best_value(),
            depth: self.tree.depth(node),
            guid: n.guid,
            node,
            input,
        });
    }

    fn rebuild_frontier(&mut self) {
        let candidates: Vec<NodeId> = self
            .tree
            .leaves()
            .filter(|id| self.tree.node(*id).uncovered_direction().is_some())
            .collect();
        for node in candidates {
            self.push_node(node);
        }
    }

    async fn execute_with_retry(&mut self, bits: &Bits) -> Result<ExecutionResult, RunError> {
        match self.executor.execute(bits).await {
            Ok(result) => Ok(result),
            Err(err) => {
                warn!("executor failed ({err:#}), retrying once");
                self.stats.communication_retries += 1;
                self.executor
                    .execute(bits)
                    .await
                    .map_err(RunError::Communication)
            }
        }
    }

    /// One execution: run the target, fold the trace into the tree, emit
    /// records for discoveries, flips, crashes and violations, and feed
    /// successful flips to the bitshare cache.
    async fn execute_and_integrate(&mut self, bits: Bits) -> Result<Arc<TraceInput>, RunError> {
        let result = self.execute_with_retry(&bits).await?;
        self.stats.executions += 1;

        let termination = result
            .termination
            .unwrap_or(TargetTermination::BoundaryConditionViolation);
        let consumed_bits: usize = result
            .stdin_types
            .iter()
            .map(|ty| ty.num_bits() as usize)
            .sum();
        if consumed_bits != result.stdin_bytes.len() * 8 {
            return Err(RunError::Internal(anyhow!(
                "executor reported {} bytes but {} chunk bits",
                result.stdin_bytes.len(),
                consumed_bits
            )));
        }
        let trace_input = Arc::new(TraceInput {
            input: StdinBitsAndTypes::new(&result.stdin_bytes, result.stdin_types.clone()),
            trace: result.trace,
        });

        self.stats.max_trace_length = self.stats.max_trace_length.max(trace_input.trace.len());
        self.stats.max_input_bits = self
            .stats
            .max_input_bits
            .max(trace_input.input.num_bits());
        match termination {
            TargetTermination::Crash => self.stats.crashes += 1,
            TargetTermination::Timeout | TargetTermination::BoundaryConditionViolation => {
                self.stats.boundary_violations += 1
            }
            TargetTermination::Normal => {}
        }

        for info in &result.br_instr_trace {
            self.br_instr_coverage
                .insert((info.id.uid(), info.covered_branch));
        }

        let outcome = self.tree.integrate(&trace_input, termination);
        let mut flags = ExecutionRecord::termination_flags(termination);
        for (node, direction) in &outcome.newly_covered {
            if Some(*node) == outcome.new_leaf {
                continue;
            }
            // A previously uncovered direction of an existing node was
            // taken: this input flipped the branching.
            flags |= ExecutionRecord::BRANCH_COVERED;
            let location = self.tree.node(*node).id.id;
            self.bitshare.bits_available_for_branching(
                location,
                !*direction,
                trace_input.input.bits().clone(),
            );
        }
        if let Some(new_leaf) = outcome.new_leaf {
            flags |= ExecutionRecord::BRANCH_DISCOVERED;
            self.push_node(new_leaf);
        }
        if let Some(progress) = &mut self.progress {
            progress.execution(
                self.stats.executions,
                termination,
                trace_input.trace.len(),
                outcome.new_leaf.map(|id| self.tree.node(id).guid),
            );
        }

        if flags != 0 && self.writer.is_some() {
            let record = ExecutionRecord {
                flags,
                stdin_bytes: trace_input.input.bytes(),
                stdin_types: trace_input.input.types().to_vec(),
                path: execution_path(&trace_input.trace),
            };
            let faulting = flags
                & (ExecutionRecord::EXECUTION_CRASHES
                    | ExecutionRecord::BOUNDARY_CONDITION_VIOLATION)
                != 0;
            if faulting {
                // Crashes and violations are persisted right away and
                // count as pre-covered for the final suite.
                self.pre_covered.extend(optimizer::coverage_of(&record.path));
                if let Some(writer) = &mut self.writer {
                    if let Err(err) = writer.write(&record) {
                        warn!("failed to write execution record: {err:#}");
                    }
                }
            } else {
                self.suite_candidates.push(SuiteCandidate::new(record));
            }
        }
        Ok(trace_input)
    }

    /// Reduce the collected coverage records to a minimal covering subset
    /// and write it out.
    fn write_minimized_suite(&mut self) -> optimizer::OptimizerStats {
        let writer = match &mut self.writer {
            Some(writer) => writer,
            None => return optimizer::OptimizerStats::default(),
        };
        let mut universe: HashSet<CoveragePair> = HashSet::new();
        for (id, [false_covered, true_covered]) in self.tree.coverage_by_location() {
            if false_covered {
                universe.insert((id.uid(), false));
            }
            if true_covered {
                universe.insert((id.uid(), true));
            }
        }
        let candidates = std::mem::take(&mut self.suite_candidates);
        let (selected, stats) = optimizer::minimize(candidates, &universe, &self.pre_covered);
        for record in &selected {
            if let Err(err) = writer.write(record) {
                warn!("failed to write suite record: {err:#}");
            }
        }
        info!(
            "suite minimised: {} of {} candidate records kept",
            stats.num_selected, stats.num_candidates
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quarry_wire::{BranchingCoverageInfo, InputType, LocationId};

    /// Simulated target: one branching on `x == 7` over a single u8.
    struct EqTarget;

    #[async_trait(?Send)]
    impl TargetExecutor for EqTarget {
        async fn execute(&mut self, bits: &Bits) -> anyhow::Result<ExecutionResult> {
            let bytes = crate::stdin_bits::bits_to_bytes(bits);
            let x = *bytes.first().unwrap_or(&0x55);
            let taken = x == 7;
            let value = if taken { 1.0 } else { (x as f64 - 7.0).abs() };
            Ok(ExecutionResult {
                termination: Some(TargetTermination::Normal),
                trace: vec![BranchingCoverageInfo {
                    id: LocationId::new(1, 0),
                    direction: taken,
                    value,
                    idx_to_br_instr: 0,
                }],
                br_instr_trace: Vec::new(),
                stdin_types: vec![InputType::U8],
                stdin_bytes: vec![x],
            })
        }
    }

    /// Always fails, to exercise the retry-then-abort path.
    struct BrokenExecutor;

    #[async_trait(?Send)]
    impl TargetExecutor for BrokenExecutor {
        async fn execute(&mut self, _bits: &Bits) -> anyhow::Result<ExecutionResult> {
            anyhow::bail!("segment vanished")
        }
    }

    #[tokio::test]
    async fn covers_a_single_equality_branch() {
        let mut fuzzer = Fuzzer::new(
            EqTarget,
            TerminationInfo {
                max_executions: 200,
                max_seconds: 60,
            },
            None,
            Arc::new(AtomicBool::new(false)),
        );
        let outcomes = fuzzer.run().await;
        assert_eq!(outcomes.termination_type, TerminationType::Normal);
        assert_eq!(
            outcomes.termination_reason,
            TerminationReason::AllReachableBranchingsCovered
        );
        assert_eq!(outcomes.covered_branchings, vec![LocationId::new(1, 0)]);
        assert!(outcomes.uncovered_branchings.is_empty());
        assert!(outcomes.num_executions <= 200);
    }

    #[tokio::test]
    async fn communication_failure_aborts_after_one_retry() {
        let mut fuzzer = Fuzzer::new(
            BrokenExecutor,
            TerminationInfo::default(),
            None,
            Arc::new(AtomicBool::new(false)),
        );
        let outcomes = fuzzer.run().await;
        assert_eq!(
            outcomes.termination_type,
            TerminationType::ClientCommunicationError
        );
        assert!(outcomes.error_message.contains("segment vanished"));
        assert_eq!(outcomes.fuzzer_statistics.communication_retries, 1);
    }

    #[tokio::test]
    async fn cancellation_exits_normally() {
        let cancel = Arc::new(AtomicBool::new(true));
        let mut fuzzer = Fuzzer::new(
            EqTarget,
            TerminationInfo::default(),
            None,
            Arc::clone(&cancel),
        );
        let outcomes = fuzzer.run().await;
        assert_eq!(outcomes.termination_type, TerminationType::Normal);
        assert_eq!(outcomes.termination_reason, TerminationReason::Interrupted);
        // Mid-iteration work is not interrupted; only the bootstrap ran.
        assert_eq!(outcomes.num_executions, 1);
    }

    #[tokio::test]
    async fn execution_budget_reports_all_tests_processed() {
        let mut fuzzer = Fuzzer::new(
            EqTarget,
            TerminationInfo {
                max_executions: 3,
                max_seconds: 60,
            },
            None,
            Arc::new(AtomicBool::new(false)),
        );
        let outcomes = fuzzer.run().await;
        assert_eq!(
            outcomes.termination_reason,
            TerminationReason::AllTestsWereProcessed
        );
        assert_eq!(outcomes.num_executions, 3);
    }
}

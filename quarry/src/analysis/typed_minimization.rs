//! Typed minimization: gradient descent over the typed chunks feeding a
//! leaf, driving its branching value towards zero until the direction
//! flips.
//!
//! The search runs seed by seed. For the active point it probes every
//! sensitive chunk at `v ± δ` (partials), takes a clamped steepest-descent
//! step, and on an overshoot retries once with rescaled per-chunk deltas
//! (extended partials) before giving the seed up. Seed order is fixed by a
//! PRNG keyed on the leaf guid, so reruns on the same build reproduce.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use quarry_wire::InputType;

use crate::analysis::{improves, observe_leaf, AnalysisState, LeafObservation};
use crate::stdin_bits::Bits;
use crate::trace::{execution_path, ExecutionPath, ExecutionTrace, TraceInput};
use crate::tree::{BranchingTree, NodeId};

/// Randomised seeds tried after the original input.
const MAX_RANDOM_SEEDS: usize = 4;
/// Accepted descent steps per seed before moving on.
const MAX_ITERATIONS_PER_SEED: u32 = 8;
/// Hard execution budget, scaled by the number of attacked chunks.
const EXECUTIONS_PER_CHUNK: u32 = 60;

#[derive(Debug, Default, Clone)]
pub struct TypedMinimizationStats {
    pub generated_inputs: u64,
    pub seeds_processed: u64,
    pub gradient_steps: u64,
    pub flips: u64,
    pub start_calls: u64,
    pub stop_calls_regular: u64,
    pub stop_calls_early: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    TakeNextSeed,
    ExecuteSeed,
    Step,
    Partials,
    PartialsExtended,
}

#[derive(Clone, Debug)]
enum Probe {
    Seed(Vec<f64>),
    Partial {
        chunk_pos: usize,
        positive: bool,
        values: Vec<f64>,
    },
    Step(Vec<f64>),
}

#[derive(Clone, Copy, Debug, Default)]
struct PartialSlot {
    delta: f64,
    plus: Option<f64>,
    minus: Option<f64>,
}

pub struct TypedMinimizationAnalysis {
    state: AnalysisState,
    node: Option<NodeId>,
    path: ExecutionPath,
    input: Option<Arc<TraceInput>>,
    /// Indices of the typed chunks holding at least one sensitive bit.
    chunks: Vec<usize>,
    stage: Stage,
    pending: VecDeque<Probe>,
    in_flight: Option<Probe>,
    seeds: VecDeque<Vec<f64>>,
    current: Vec<f64>,
    current_value: f64,
    partials: Vec<PartialSlot>,
    awaiting_partials: usize,
    bit_max_changes: Vec<f64>,
    iterations_this_seed: u32,
    executions: u32,
    execution_cap: u32,
    success: bool,
    stats: TypedMinimizationStats,
}

impl Default for TypedMinimizationAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

impl TypedMinimizationAnalysis {
    pub fn new() -> Self {
        Self {
            state: AnalysisState::Ready,
            node: None,
            path: Vec::new(),
            input: None,
            chunks: Vec::new(),
            stage: Stage::TakeNextSeed,
            pending: VecDeque::new(),
            in_flight: None,
            seeds: VecDeque::new(),
            current: Vec::new(),
            current_value: f64::INFINITY,
            partials: Vec::new(),
            awaiting_partials: 0,
            bit_max_changes: Vec::new(),
            iterations_this_seed: 0,
            executions: 0,
            execution_cap: 0,
            success: false,
            stats: TypedMinimizationStats::default(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == AnalysisState::Ready
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn succeeded(&self) -> bool {
        self.success
    }

    pub fn stats(&self) -> &TypedMinimizationStats {
        &self.stats
    }

    /// The precondition: sensitivity ran and flagged at least one bit
    /// inside a typed (non-opaque) chunk.
    pub fn sensitive_typed_chunks(tree: &BranchingTree, node: NodeId) -> Vec<usize> {
        let input = match tree.best_input_reaching(node) {
            Some(input) => input,
            None => return Vec::new(),
        };
        let mut chunks: Vec<usize> = tree
            .node(node)
            .sensitive_stdin_bits
            .iter()
            .map(|bit| input.input.type_index(*bit))
            .filter(|ci| input.input.types()[*ci].is_known())
            .collect();
        chunks.sort_unstable();
        chunks.dedup();
        chunks
    }

    pub fn start(&mut self, tree: &BranchingTree, node: NodeId) -> bool {
        debug_assert!(self.is_ready());
        let input = match tree.best_input_reaching(node) {
            Some(input) => input,
            None => return false,
        };
        let chunks = Self::sensitive_typed_chunks(tree, node);
        if chunks.is_empty() {
            return false;
        }
        let depth = tree.path_to_root(node).len();
        let mut path = execution_path(&input.trace);
        path.truncate(depth);
        if path.len() < depth {
            return false;
        }

        let origin: Vec<f64> = chunks
            .iter()
            .map(|ci| input.input.decode_chunk(input.input.bits(), *ci))
            .collect();
        let mut rng = StdRng::seed_from_u64(tree.node(node).guid);
        let mut seeds = VecDeque::new();
        seeds.push_back(origin);
        for _ in 0..MAX_RANDOM_SEEDS {
            let seed = chunks
                .iter()
                .map(|ci| random_chunk_value(&mut rng, input.input.types()[*ci]))
                .collect();
            seeds.push_back(seed);
        }

        self.bit_max_changes = chunks
            .iter()
            .map(|ci| {
                let ty = input.input.types()[*ci];
                (ty.max_value() - ty.min_value()) / 2.0
            })
            .collect();
        self.partials = vec![PartialSlot::default(); chunks.len()];
        self.execution_cap = EXECUTIONS_PER_CHUNK * chunks.len() as u32;
        self.node = Some(node);
        self.path = path;
        self.input = Some(input);
        self.chunks = chunks;
        self.stage = Stage::TakeNextSeed;
        self.pending.clear();
        self.in_flight = None;
        self.seeds = seeds;
        self.executions = 0;
        self.success = false;
        self.state = AnalysisState::Busy;
        self.stats.start_calls += 1;
        self.take_next_seed();
        true
    }

    pub fn stop(&mut self) {
        if self.state != AnalysisState::Busy {
            return;
        }
        if self.success || (self.pending.is_empty() && self.in_flight.is_none()) {
            self.stats.stop_calls_regular += 1;
        } else {
            self.stats.stop_calls_early += 1;
        }
        self.state = AnalysisState::Ready;
    }

    pub fn generate_next_input(&mut self, _tree: &mut BranchingTree) -> Option<Bits> {
        if self.state != AnalysisState::Busy || self.success {
            return None;
        }
        if self.executions >= self.execution_cap {
            self.pending.clear();
        }
        let probe = self.pending.pop_front()?;
        let input = self.input.as_ref()?;
        let values = match &probe {
            Probe::Seed(v) | Probe::Step(v) => v,
            Probe::Partial { values, .. } => values,
        };
        let mut bits = input.input.bits().clone();
        for (pos, ci) in self.chunks.iter().enumerate() {
            input.input.encode_chunk(&mut bits, *ci, values[pos]);
        }
        self.in_flight = Some(probe);
        self.executions += 1;
        self.stats.generated_inputs += 1;
        Some(bits)
    }

    pub fn process_execution_results(&mut self, _tree: &mut BranchingTree, trace: &ExecutionTrace) {
        debug_assert!(self.state == AnalysisState::Busy);
        let probe = match self.in_flight.take() {
            Some(probe) => probe,
            None => return,
        };
        let value = match observe_leaf(&self.path, trace) {
            LeafObservation::Flipped => {
                self.success = true;
                self.stats.flips += 1;
                self.pending.clear();
                debug!("typed minimization flipped the leaf");
                return;
            }
            LeafObservation::Value(v) => Some(v),
            LeafObservation::NotReached => None,
        };
        match probe {
            Probe::Seed(values) => match value {
                Some(v) => {
                    self.current = values;
                    self.current_value = v;
                    self.iterations_this_seed = 0;
                    self.queue_partials(Stage::Partials);
                }
                None => self.take_next_seed(),
            },
            Probe::Partial {
                chunk_pos,
                positive,
                ..
            } => {
                if positive {
                    self.partials[chunk_pos].plus = value;
                } else {
                    self.partials[chunk_pos].minus = value;
                }
                self.awaiting_partials -= 1;
                if self.awaiting_partials == 0 {
                    self.finish_partials();
                }
            }
            Probe::Step(values) => {
                let improved = matches!(value, Some(v) if improves(self.current_value, v));
                if improved {
                    self.current = values;
                    self.current_value = value.unwrap_or(self.current_value);
                    self.iterations_this_seed += 1;
                    if self.iterations_this_seed >= MAX_ITERATIONS_PER_SEED {
                        self.take_next_seed();
                    } else {
                        self.queue_partials(Stage::Partials);
                    }
                } else {
                    for budget in &mut self.bit_max_changes {
                        *budget = (*budget / 2.0).max(1.0);
                    }
                    if self.stage == Stage::Step {
                        self.queue_partials(Stage::PartialsExtended);
                    } else {
                        self.take_next_seed();
                    }
                }
            }
        }
    }

    fn take_next_seed(&mut self) {
        self.pending.clear();
        match self.seeds.pop_front() {
            Some(seed) => {
                self.stage = Stage::ExecuteSeed;
                self.stats.seeds_processed += 1;
                self.pending.push_back(Probe::Seed(seed));
            }
            None => {
                // Nothing left to try; generate_next_input now returns
                // None and the scheduler retires the analysis.
                self.stage = Stage::TakeNextSeed;
            }
        }
    }

    fn chunk_type(&self, chunk_pos: usize) -> InputType {
        let input = self.input.as_ref().expect("analysis is bound to an input");
        input.input.types()[self.chunks[chunk_pos]]
    }

    fn partial_delta(&self, chunk_pos: usize, extended: bool) -> f64 {
        let ty = self.chunk_type(chunk_pos);
        if ty.is_float() {
            let magnitude = self.current[chunk_pos].abs().max(1.0);
            if extended {
                magnitude / 2.0
            } else {
                magnitude / 8.0
            }
        } else if extended {
            (self.bit_max_changes[chunk_pos] / 2.0).round().max(1.0)
        } else {
            1.0
        }
    }

    fn queue_partials(&mut self, stage: Stage) {
        self.stage = stage;
        let extended = stage == Stage::PartialsExtended;
        self.pending.clear();
        self.awaiting_partials = 0;
        for chunk_pos in 0..self.chunks.len() {
            let delta = self.partial_delta(chunk_pos, extended);
            self.partials[chunk_pos] = PartialSlot {
                delta,
                plus: None,
                minus: None,
            };
            for positive in [true, false] {
                let mut values = self.current.clone();
                values[chunk_pos] += if positive { delta } else { -delta };
                self.sanitize(&mut values);
                self.pending.push_back(Probe::Partial {
                    chunk_pos,
                    positive,
                    values,
                });
                self.awaiting_partials += 1;
            }
        }
    }

    /// All partial results are in: estimate the gradient and queue the
    /// descent step, or fall through when the landscape is flat here.
    fn finish_partials(&mut self) {
        let mut gradient = vec![0.0f64; self.chunks.len()];
        let mut any = false;
        for (pos, slot) in self.partials.iter().enumerate() {
            let g = match (slot.plus, slot.minus) {
                (Some(p), Some(m)) => (p - m) / (2.0 * slot.delta),
                (Some(p), None) => (p - self.current_value) / slot.delta,
                (None, Some(m)) => (self.current_value - m) / slot.delta,
                (None, None) => 0.0,
            };
            if g != 0.0 {
                any = true;
            }
            gradient[pos] = g;
        }
        if !any {
            if self.stage == Stage::Partials {
                self.queue_partials(Stage::PartialsExtended);
            } else {
                self.take_next_seed();
            }
            return;
        }

        let norm_sq: f64 = gradient.iter().map(|g| g * g).sum();
        let mut alpha = self.current_value / norm_sq;
        for (pos, g) in gradient.iter().enumerate() {
            let magnitude = (alpha * g).abs();
            if magnitude > self.bit_max_changes[pos] {
                alpha *= self.bit_max_changes[pos] / magnitude;
            }
        }
        let mut values = self.current.clone();
        for (pos, g) in gradient.iter().enumerate() {
            values[pos] -= alpha * g;
        }
        self.sanitize(&mut values);
        self.stats.gradient_steps += 1;
        let was_extended = self.stage == Stage::PartialsExtended;
        self.stage = if was_extended {
            Stage::PartialsExtended
        } else {
            Stage::Step
        };
        self.pending.push_back(Probe::Step(values));
    }

    /// Snap integer chunks onto representable values and clamp everything
    /// into its type range, so probes and steps stay well-formed.
    fn sanitize(&self, values: &mut [f64]) {
        for (pos, value) in values.iter_mut().enumerate() {
            let ty = self.chunk_type(pos);
            if value.is_nan() {
                *value = 0.0;
            }
            if ty.is_float() {
                *value = value.clamp(ty.min_value(), ty.max_value());
            } else {
                *value = value.round().clamp(ty.min_value(), ty.max_value());
            }
        }
    }
}

fn random_chunk_value(rng: &mut StdRng, ty: InputType) -> f64 {
    if ty.is_float() {
        rng.gen_range(-1.0e6..1.0e6)
    } else if ty == InputType::Boolean {
        rng.gen_range(0..=1) as f64
    } else if ty.is_signed() {
        rng.gen_range(ty.min_value() as i64..=ty.max_value() as i64) as f64
    } else {
        // u64::MAX as f64 rounds up; sample in i64 space and reinterpret.
        rng.gen_range(0..=ty.max_value().min(u64::MAX as f64) as u64) as f64
    }
}

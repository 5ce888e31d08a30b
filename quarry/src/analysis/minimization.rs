//! Bit-level minimization: the descent of typed minimization restated over
//! the raw sensitive bits, for leaves whose typed form failed or whose
//! sensitive bits fall outside typed chunks.
//!
//! Partials flip one sensitive bit at a time; a step flips every improving
//! bit at once, bounded by a Hamming budget that starts at half the bit
//! count and halves on non-progress. Fingerprints of generated patterns
//! suppress re-submission of inputs this phase already tried.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::analysis::{bits_fingerprint, improves, observe_leaf, AnalysisState, LeafObservation};
use crate::stdin_bits::Bits;
use crate::trace::{execution_path, ExecutionPath, ExecutionTrace, TraceInput};
use crate::tree::{BranchingTree, NodeId};

const MAX_RANDOM_SEEDS: usize = 4;
const MAX_ITERATIONS_PER_SEED: u32 = 50;
const EXECUTIONS_PER_BIT: u32 = 1200;

#[derive(Debug, Default, Clone)]
pub struct MinimizationStats {
    pub generated_inputs: u64,
    pub suppressed_repetitions: u64,
    pub max_bits: usize,
    pub seeds_processed: u64,
    pub gradient_steps: u64,
    pub flips: u64,
    pub start_calls: u64,
    pub stop_calls_regular: u64,
    pub stop_calls_early: u64,
}

#[derive(Clone, Debug)]
enum BitProbe {
    Seed(Vec<bool>),
    Partial { local: usize, pattern: Vec<bool> },
    Step(Vec<bool>),
}

pub struct MinimizationAnalysis {
    state: AnalysisState,
    node: Option<NodeId>,
    path: ExecutionPath,
    input: Option<Arc<TraceInput>>,
    /// Local index -> global bit index of the sensitive bits.
    bit_translation: Vec<u32>,
    pending: VecDeque<BitProbe>,
    in_flight: Option<(BitProbe, u64)>,
    seeds: VecDeque<Vec<bool>>,
    current: Vec<bool>,
    current_value: f64,
    partials: Vec<Option<f64>>,
    awaiting_partials: usize,
    hamming_budget: usize,
    extended_round: bool,
    iterations_this_seed: u32,
    executions: u32,
    execution_cap: u32,
    /// Fingerprint -> observed leaf value of every pattern this phase has
    /// generated. Duplicates are answered from here instead of re-running.
    fingerprints: HashMap<u64, Option<f64>>,
    success: bool,
    stats: MinimizationStats,
}

impl Default for MinimizationAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

impl MinimizationAnalysis {
    pub fn new() -> Self {
        Self {
            state: AnalysisState::Ready,
            node: None,
            path: Vec::new(),
            input: None,
            bit_translation: Vec::new(),
            pending: VecDeque::new(),
            in_flight: None,
            seeds: VecDeque::new(),
            current: Vec::new(),
            current_value: f64::INFINITY,
            partials: Vec::new(),
            awaiting_partials: 0,
            hamming_budget: 0,
            extended_round: false,
            iterations_this_seed: 0,
            executions: 0,
            execution_cap: 0,
            fingerprints: HashMap::new(),
            success: false,
            stats: MinimizationStats::default(),
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

    pub fn stats(&self) -> &MinimizationStats {
        &self.stats
    }

    pub fn start(&mut self, tree: &BranchingTree, node: NodeId) -> bool {
        debug_assert!(self.is_ready());
        let input = match tree.best_input_reaching(node) {
            Some(input) => input,
            None => return false,
        };
        let bit_translation: Vec<u32> = tree
            .node(node)
            .sensitive_stdin_bits
            .iter()
            .copied()
            .filter(|bit| (*bit as usize) < input.input.num_bits())
            .collect();
        if bit_translation.is_empty() {
            return false;
        }
        let depth = tree.path_to_root(node).len();
        let mut path = execution_path(&input.trace);
        path.truncate(depth);
        if path.len() < depth {
            return false;
        }

        let origin: Vec<bool> = bit_translation
            .iter()
            .map(|bit| input.input.bits()[*bit as usize])
            .collect();
        let mut rng = StdRng::seed_from_u64(tree.node(node).guid);
        let mut seeds = VecDeque::new();
        seeds.push_back(origin);
        for _ in 0..MAX_RANDOM_SEEDS {
            seeds.push_back((0..bit_translation.len()).map(|_| rng.gen()).collect());
        }

        self.stats.max_bits = self.stats.max_bits.max(bit_translation.len());
        self.execution_cap = EXECUTIONS_PER_BIT.saturating_mul(bit_translation.len() as u32);
        self.hamming_budget = (bit_translation.len() / 2).max(1);
        self.partials = vec![None; bit_translation.len()];
        self.node = Some(node);
        self.path = path;
        self.input = Some(input);
        self.bit_translation = bit_translation;
        self.pending.clear();
        self.in_flight = None;
        self.seeds = seeds;
        self.extended_round = false;
        self.executions = 0;
        self.fingerprints.clear();
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

    /// Pops probes until one fingerprints as novel; duplicates are counted
    /// and answered from the value cache without reaching the executor.
    pub fn generate_next_input(&mut self, _tree: &mut BranchingTree) -> Option<Bits> {
        if self.state != AnalysisState::Busy || self.success {
            return None;
        }
        loop {
            if self.executions >= self.execution_cap {
                self.pending.clear();
            }
            let probe = self.pending.pop_front()?;
            let bits = self.apply_pattern(probe_pattern(&probe));
            let fingerprint = bits_fingerprint(&bits);
            match self.fingerprints.get(&fingerprint) {
                None => {
                    self.in_flight = Some((probe, fingerprint));
                    self.executions += 1;
                    self.stats.generated_inputs += 1;
                    return Some(bits);
                }
                Some(cached) => {
                    self.stats.suppressed_repetitions += 1;
                    let cached = *cached;
                    self.route(probe, cached);
                }
            }
        }
    }

    pub fn process_execution_results(&mut self, _tree: &mut BranchingTree, trace: &ExecutionTrace) {
        debug_assert!(self.state == AnalysisState::Busy);
        let (probe, fingerprint) = match self.in_flight.take() {
            Some(in_flight) => in_flight,
            None => return,
        };
        let value = match observe_leaf(&self.path, trace) {
            LeafObservation::Flipped => {
                self.success = true;
                self.stats.flips += 1;
                self.fingerprints.insert(fingerprint, None);
                self.pending.clear();
                debug!("bit-level minimization flipped the leaf");
                return;
            }
            LeafObservation::Value(v) => Some(v),
            LeafObservation::NotReached => None,
        };
        self.fingerprints.insert(fingerprint, value);
        self.route(probe, value);
    }

    fn route(&mut self, probe: BitProbe, value: Option<f64>) {
        match probe {
            BitProbe::Seed(pattern) => match value {
                Some(v) => {
                    self.current = pattern;
                    self.current_value = v;
                    self.iterations_this_seed = 0;
                    self.extended_round = false;
                    self.queue_partials();
                }
                None => self.take_next_seed(),
            },
            BitProbe::Partial { local, .. } => {
                self.partials[local] = value;
                self.awaiting_partials -= 1;
                if self.awaiting_partials == 0 {
                    self.finish_partials();
                }
            }
            BitProbe::Step(pattern) => {
                let improved = matches!(value, Some(v) if improves(self.current_value, v));
                if improved {
                    self.current = pattern;
                    self.current_value = value.unwrap_or(self.current_value);
                    self.iterations_this_seed += 1;
                    self.extended_round = false;
                    if self.iterations_this_seed >= MAX_ITERATIONS_PER_SEED {
                        self.take_next_seed();
                    } else {
                        self.queue_partials();
                    }
                } else {
                    self.hamming_budget = (self.hamming_budget / 2).max(1);
                    if !self.extended_round {
                        self.extended_round = true;
                        self.queue_extended_step();
                    } else {
                        self.take_next_seed();
                    }
                }
            }
        }
    }

    fn take_next_seed(&mut self) {
        self.pending.clear();
        if let Some(seed) = self.seeds.pop_front() {
            self.stats.seeds_processed += 1;
            self.hamming_budget = (self.bit_translation.len() / 2).max(1);
            self.pending.push_back(BitProbe::Seed(seed));
        }
    }

    fn queue_partials(&mut self) {
        self.pending.clear();
        self.partials.iter_mut().for_each(|p| *p = None);
        self.awaiting_partials = self.bit_translation.len();
        for local in 0..self.bit_translation.len() {
            let mut pattern = self.current.clone();
            pattern[local] = !pattern[local];
            self.pending.push_back(BitProbe::Partial { local, pattern });
        }
    }

    /// Flip every improving bit at once, most promising first, capped by
    /// the Hamming budget.
    fn finish_partials(&mut self) {
        let current_value = self.current_value;
        let mut improving: Vec<(usize, f64)> = self
            .partials
            .iter()
            .enumerate()
            .filter_map(|(local, v)| (*v).filter(|v| improves(current_value, *v)).map(|v| (local, v)))
            .collect();
        if improving.is_empty() {
            self.take_next_seed();
            return;
        }
        improving.sort_by(|a, b| a.1.total_cmp(&b.1));
        improving.truncate(self.hamming_budget);
        let mut pattern = self.current.clone();
        for (local, _) in &improving {
            pattern[*local] = !pattern[*local];
        }
        self.stats.gradient_steps += 1;
        self.pending.push_back(BitProbe::Step(pattern));
    }

    /// Fallback after a failed multi-bit step: flip only the single most
    /// promising bit.
    fn queue_extended_step(&mut self) {
        let best = self
            .partials
            .iter()
            .enumerate()
            .filter_map(|(local, v)| (*v).map(|v| (local, v)))
            .min_by(|a, b| a.1.total_cmp(&b.1));
        match best {
            Some((local, _)) => {
                let mut pattern = self.current.clone();
                pattern[local] = !pattern[local];
                self.pending.push_back(BitProbe::Step(pattern));
            }
            None => self.take_next_seed(),
        }
    }

    /// Project a local sensitive-bit pattern onto the full input bits.
    fn apply_pattern(&self, pattern: &[bool]) -> Bits {
        let input = self.input.as_ref().expect("analysis is bound to an input");
        let mut bits = input.input.bits().clone();
        for (local, global) in self.bit_translation.iter().enumerate() {
            bits[*global as usize] = pattern[local];
        }
        bits
    }
}

fn probe_pattern(probe: &BitProbe) -> &[bool] {
    match probe {
        BitProbe::Seed(p) | BitProbe::Step(p) => p,
        BitProbe::Partial { pattern, .. } => pattern,
    }
}

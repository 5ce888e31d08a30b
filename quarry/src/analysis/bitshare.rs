//! Bitshare: replay of bit patterns that flipped a location before.
//!
//! The same static location tends to occur at many tree nodes, and a
//! pattern that flipped it once often flips it again. Successful flips
//! feed a per-location cache, two FIFO deques per location keyed by the
//! source direction; fresh leaves of the same location replay the cached
//! patterns most-recent-first until one hits or the deque is exhausted.

use std::collections::{HashMap, VecDeque};

use log::debug;

use crate::analysis::AnalysisState;
use crate::stdin_bits::Bits;
use crate::tree::{BranchingTree, NodeId};

const MAX_DEQUE_SIZE: usize = 10;

#[derive(Debug, Default, Clone)]
pub struct BitshareStats {
    pub generated_inputs: u64,
    pub hits: u64,
    pub misses: u64,
    pub start_calls: u64,
    pub stop_calls_regular: u64,
    pub stop_calls_early: u64,
    pub stop_calls_instant: u64,
    pub num_locations: u64,
    pub num_insertions: u64,
    pub num_deletions: u64,
}

pub struct BitshareAnalysis {
    state: AnalysisState,
    cache: HashMap<u32, [VecDeque<Bits>; 2]>,
    node: Option<NodeId>,
    target_direction: bool,
    /// Patterns snapshot for the bound leaf, most recent first.
    replay: Vec<Bits>,
    next_index: usize,
    success: bool,
    stats: BitshareStats,
}

impl Default for BitshareAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

impl BitshareAnalysis {
    pub fn new() -> Self {
        Self {
            state: AnalysisState::Ready,
            cache: HashMap::new(),
            node: None,
            target_direction: false,
            replay: Vec::new(),
            next_index: 0,
            success: false,
            stats: BitshareStats::default(),
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

    pub fn stats(&self) -> &BitshareStats {
        &self.stats
    }

    /// Record a pattern that flipped `location` away from
    /// `source_direction`. FIFO eviction beyond the per-deque cap.
    pub fn bits_available_for_branching(
        &mut self,
        location: u32,
        source_direction: bool,
        bits: Bits,
    ) {
        let deques = self.cache.entry(location).or_default();
        let deque = &mut deques[source_direction as usize];
        if deque.back() == Some(&bits) {
            return;
        }
        deque.push_back(bits);
        self.stats.num_insertions += 1;
        if deque.len() > MAX_DEQUE_SIZE {
            deque.pop_front();
            self.stats.num_deletions += 1;
        }
        self.stats.num_locations = self.cache.len() as u64;
    }

    /// Bind to a leaf. Fails instantly when the cache holds nothing for
    /// the leaf's location and source direction.
    pub fn start(&mut self, tree: &BranchingTree, node: NodeId) -> bool {
        debug_assert!(self.is_ready());
        let target_direction = match tree.node(node).uncovered_direction() {
            Some(direction) => direction,
            None => return false,
        };
        let source_direction = !target_direction;
        let location = tree.node(node).id.id;
        let replay: Vec<Bits> = match self.cache.get(&location) {
            Some(deques) => deques[source_direction as usize]
                .iter()
                .rev()
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        if replay.is_empty() {
            self.stats.stop_calls_instant += 1;
            return false;
        }
        self.node = Some(node);
        self.target_direction = target_direction;
        self.replay = replay;
        self.next_index = 0;
        self.success = false;
        self.state = AnalysisState::Busy;
        self.stats.start_calls += 1;
        true
    }

    pub fn stop(&mut self) {
        if self.state != AnalysisState::Busy {
            return;
        }
        if self.success || self.next_index == self.replay.len() {
            self.stats.stop_calls_regular += 1;
        } else {
            self.stats.stop_calls_early += 1;
        }
        self.replay.clear();
        self.state = AnalysisState::Ready;
    }

    pub fn generate_next_input(&mut self, _tree: &mut BranchingTree) -> Option<Bits> {
        if self.state != AnalysisState::Busy || self.success {
            return None;
        }
        if self.next_index == self.replay.len() {
            self.stats.misses += 1;
            return None;
        }
        let bits = self.replay[self.next_index].clone();
        self.next_index += 1;
        self.stats.generated_inputs += 1;
        Some(bits)
    }

    /// A hit is visible in the tree: the leaf's uncovered direction got
    /// covered by the replayed pattern. First hit short-circuits.
    pub fn process_execution_results(&mut self, tree: &mut BranchingTree) {
        debug_assert!(self.state == AnalysisState::Busy);
        let node = match self.node {
            Some(node) => node,
            None => return,
        };
        if tree.node(node).covered(self.target_direction) {
            self.success = true;
            self.stats.hits += 1;
            debug!(
                "bitshare hit at location {} (guid {})",
                tree.node(node).id.id,
                tree.node(node).guid
            );
        }
    }
}

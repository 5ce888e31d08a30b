//! Persistent tree of every branching observed so far.
//!
//! Nodes live in an arena and refer to each other by index; the path from
//! the root to a node is the `(location, direction)` prefix of every trace
//! that reached it, so cycles cannot form. Each execution extends the tree
//! by at most one node, attached at the first point the trace leaves the
//! known frontier.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use quarry_wire::{LocationId, TargetTermination};

use crate::trace::TraceInput;

/// Arena index of a branching node. Stable for the whole run.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// What is known about one outgoing direction of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Successor {
    /// Direction never extended; possibly never even taken.
    Unexplored,
    /// Some execution ended right after taking this direction.
    End(EndKind),
    /// The next branching on this direction.
    Node(NodeId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndKind {
    Normal,
    Crash,
}

#[derive(Debug)]
pub struct BranchingNode {
    pub id: LocationId,
    pub predecessor: Option<NodeId>,
    pub direction_from_parent: bool,
    successors: [Successor; 2],
    best_value: [f64; 2],
    best_input: [Option<Arc<TraceInput>>; 2],
    /// Input bit indices proven able to change this node's branching value.
    pub sensitive_stdin_bits: BTreeSet<u32>,
    pub sensitivity_performed: bool,
    pub typed_minimization_performed: bool,
    pub minimization_performed: bool,
    pub bitshare_performed: bool,
    pub closed: bool,
    /// A trace truncated by the executor ended at this node at least once.
    pub boundary_hit: bool,
    pub guid: u64,
}

impl BranchingNode {
    fn new(id: LocationId, predecessor: Option<NodeId>, direction_from_parent: bool, guid: u64) -> Self {
        Self {
            id,
            predecessor,
            direction_from_parent,
            successors: [Successor::Unexplored; 2],
            best_value: [f64::INFINITY; 2],
            best_input: [None, None],
            sensitive_stdin_bits: BTreeSet::new(),
            sensitivity_performed: false,
            typed_minimization_performed: false,
            minimization_performed: false,
            bitshare_performed: false,
            closed: false,
            boundary_hit: false,
            guid,
        }
    }

    pub fn successor(&self, direction: bool) -> Successor {
        self.successors[direction as usize]
    }

    pub fn best_value(&self, direction: bool) -> f64 {
        self.best_value[direction as usize]
    }

    pub fn best_input(&self, direction: bool) -> Option<&Arc<TraceInput>> {
        self.best_input[direction as usize].as_ref()
    }

    /// A direction is covered once some execution took it.
    pub fn covered(&self, direction: bool) -> bool {
        self.best_value[direction as usize].is_finite()
    }

    /// The direction no execution has taken yet, if any.
    pub fn uncovered_direction(&self) -> Option<bool> {
        if !self.covered(false) {
            Some(false)
        } else if !self.covered(true) {
            Some(true)
        } else {
            None
        }
    }

    pub fn is_leaf(&self) -> bool {
        !self.closed
            && self
                .successors
                .iter()
                .any(|s| matches!(s, Successor::Unexplored))
    }

    /// Smallest best value over both directions; the priority the
    /// scheduler sorts on.
    pub fn min_best_value(&self) -> f64 {
        self.best_value[0].min(self.best_value[1])
    }
}

#[derive(Debug, Default, Clone)]
pub struct TreeStats {
    pub nodes_created: u64,
    pub incompatible_traces: u64,
    pub divergent_traces: u64,
}

/// What one `integrate` call changed.
#[derive(Debug, Default)]
pub struct IntegrationOutcome {
    pub new_leaf: Option<NodeId>,
    pub last_visited: Option<NodeId>,
    /// `(node, direction)` pairs that went from uncovered to covered.
    pub newly_covered: Vec<(NodeId, bool)>,
}

pub struct BranchingTree {
    nodes: Vec<BranchingNode>,
    root: Option<NodeId>,
    next_guid: u64,
    stats: TreeStats,
}

impl Default for BranchingTree {
    fn default() -> Self {
        Self::new()
    }
}

impl BranchingTree {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
            next_guid: 0,
            stats: TreeStats::default(),
        }
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &BranchingNode {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut BranchingNode {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn stats(&self) -> &TreeStats {
        &self.stats
    }

    fn fresh_node(
        &mut self,
        id: LocationId,
        predecessor: Option<NodeId>,
        direction_from_parent: bool,
    ) -> NodeId {
        self.next_guid += 1;
        let guid = self.next_guid;
        let node_id = NodeId(self.nodes.len() as u32);
        self.nodes
            .push(BranchingNode::new(id, predecessor, direction_from_parent, guid));
        self.stats.nodes_created += 1;
        node_id
    }

    /// Fold one execution into the tree.
    ///
    /// Walks the trace from the root, updating the best value and input of
    /// every visited node, and attaches at most one new node at the first
    /// point the trace leaves the known structure. Truncated traces
    /// (timeout or boundary violation) are integrated only up to their
    /// final entry and never produce an end marker there.
    pub fn integrate(
        &mut self,
        trace_input: &Arc<TraceInput>,
        termination: TargetTermination,
    ) -> IntegrationOutcome {
        let mut outcome = IntegrationOutcome::default();
        let trace = &trace_input.trace;
        if trace.is_empty() {
            return outcome;
        }
        let truncated = matches!(
            termination,
            TargetTermination::Timeout | TargetTermination::BoundaryConditionViolation
        );
        let end_kind = match termination {
            TargetTermination::Crash => EndKind::Crash,
            _ => EndKind::Normal,
        };

        let mut cur = match self.root {
            None => {
                let root = self.fresh_node(trace[0].id, None, false);
                self.root = Some(root);
                outcome.new_leaf = Some(root);
                root
            }
            Some(root) => {
                if self.node(root).id != trace[0].id {
                    self.stats.incompatible_traces += 1;
                    return outcome;
                }
                root
            }
        };

        let mut i = 0usize;
        loop {
            let step = &trace[i];
            if self.node(cur).id != step.id {
                // Nondeterministic target behaviour; keep what matched.
                self.stats.divergent_traces += 1;
                break;
            }
            let dir = step.direction as usize;
            {
                let node = self.node_mut(cur);
                if !node.best_value[dir].is_finite() {
                    outcome.newly_covered.push((cur, step.direction));
                }
                if step.value < node.best_value[dir] {
                    node.best_value[dir] = step.value;
                    node.best_input[dir] = Some(Arc::clone(trace_input));
                }
            }
            outcome.last_visited = Some(cur);

            if i + 1 == trace.len() {
                if truncated {
                    self.node_mut(cur).boundary_hit = true;
                } else if matches!(self.node(cur).successor(step.direction), Successor::Unexplored)
                {
                    self.node_mut(cur).successors[dir] = Successor::End(end_kind);
                    self.try_close_upward(cur);
                }
                break;
            }

            match self.node(cur).successor(step.direction) {
                Successor::Node(child) => {
                    cur = child;
                    i += 1;
                }
                Successor::Unexplored | Successor::End(_) => {
                    if outcome.new_leaf.is_some() {
                        // This execution already discovered a node.
                        break;
                    }
                    let child = self.fresh_node(trace[i + 1].id, Some(cur), step.direction);
                    self.node_mut(cur).successors[dir] = Successor::Node(child);
                    let child_step = &trace[i + 1];
                    let child_dir = child_step.direction as usize;
                    {
                        let node = self.node_mut(child);
                        node.best_value[child_dir] = child_step.value;
                        node.best_input[child_dir] = Some(Arc::clone(trace_input));
                    }
                    outcome.newly_covered.push((child, child_step.direction));
                    outcome.new_leaf = Some(child);
                    outcome.last_visited = Some(child);
                    break;
                }
            }
        }
        outcome
    }

    fn side_closed(&self, node: NodeId, direction: bool) -> bool {
        match self.node(node).successor(direction) {
            Successor::Unexplored => false,
            Successor::End(_) => true,
            Successor::Node(child) => self.node(child).closed,
        }
    }

    fn try_close_upward(&mut self, start: NodeId) {
        let mut cur = Some(start);
        while let Some(id) = cur {
            if self.node(id).closed {
                cur = self.node(id).predecessor;
                continue;
            }
            if self.side_closed(id, false) && self.side_closed(id, true) {
                self.node_mut(id).closed = true;
                cur = self.node(id).predecessor;
            } else {
                break;
            }
        }
    }

    /// Close a node explicitly (proven unflippable) and propagate upward:
    /// a parent closes once both of its sides are closed.
    pub fn mark_closed(&mut self, id: NodeId) {
        if !self.node(id).closed {
            self.node_mut(id).closed = true;
        }
        if let Some(parent) = self.node(id).predecessor {
            self.try_close_upward(parent);
        }
    }

    /// Current non-closed frontier.
    pub fn leaves(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_leaf())
            .map(|(i, _)| NodeId(i as u32))
    }

    /// The input to mutate when attacking `id`: the one observed with the
    /// smallest branching value at this node. With one direction still
    /// uncovered this is the input that reached the node; with both
    /// covered it is the closer of the two.
    pub fn best_input_reaching(&self, id: NodeId) -> Option<Arc<TraceInput>> {
        let node = self.node(id);
        let side = if node.best_value[0] <= node.best_value[1] {
            0
        } else {
            1
        };
        node.best_input[side].clone()
    }

    /// Node ids on the path from the root to `id`, root first.
    pub fn path_to_root(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut cur = id;
        while let Some(pred) = self.node(cur).predecessor {
            path.push(pred);
            cur = pred;
        }
        path.reverse();
        path
    }

    pub fn depth(&self, id: NodeId) -> u32 {
        let mut depth = 1u32;
        let mut cur = id;
        while let Some(pred) = self.node(cur).predecessor {
            depth += 1;
            cur = pred;
        }
        depth
    }

    /// Per-location coverage of both directions, aggregated over all nodes
    /// sharing the location.
    pub fn coverage_by_location(&self) -> HashMap<LocationId, [bool; 2]> {
        let mut map: HashMap<LocationId, [bool; 2]> = HashMap::new();
        for node in &self.nodes {
            let entry = map.entry(node.id).or_default();
            entry[0] |= node.covered(false);
            entry[1] |= node.covered(true);
        }
        map
    }
}

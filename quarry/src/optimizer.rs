//! Test-suite minimisation.
//!
//! During the run every coverage-bearing execution becomes a suite
//! candidate. At the end a greedy set cover picks the smallest subset of
//! candidates that still covers every `(location, direction)` pair the
//! run covered, and only that subset is written out. Crash and
//! boundary-violation records are written the moment they happen and count
//! as pre-covered here.

use std::collections::HashSet;

use log::warn;

use crate::record::ExecutionRecord;
use crate::trace::ExecutionPath;

/// One `(location uid, direction)` coverage pair.
pub type CoveragePair = (u64, bool);

pub fn coverage_of(path: &ExecutionPath) -> HashSet<CoveragePair> {
    path.iter().map(|(id, direction)| (id.uid(), *direction)).collect()
}

pub struct SuiteCandidate {
    pub record: ExecutionRecord,
    pub coverage: HashSet<CoveragePair>,
}

impl SuiteCandidate {
    pub fn new(record: ExecutionRecord) -> Self {
        let coverage = coverage_of(&record.path);
        Self { record, coverage }
    }
}

#[derive(Clone, Debug, Default)]
pub struct OptimizerStats {
    pub num_candidates: u32,
    pub num_selected: u32,
    pub num_coverage_pairs: u32,
    pub num_pre_covered_pairs: u32,
}

/// Greedy set cover over the candidates: repeatedly take the record
/// covering the most still-uncovered pairs, earliest record on ties.
pub fn minimize(
    candidates: Vec<SuiteCandidate>,
    universe: &HashSet<CoveragePair>,
    pre_covered: &HashSet<CoveragePair>,
) -> (Vec<ExecutionRecord>, OptimizerStats) {
    let mut stats = OptimizerStats {
        num_candidates: candidates.len() as u32,
        num_selected: 0,
        num_coverage_pairs: universe.len() as u32,
        num_pre_covered_pairs: pre_covered.len() as u32,
    };
    let mut remaining: HashSet<CoveragePair> =
        universe.difference(pre_covered).copied().collect();
    let mut available: Vec<Option<SuiteCandidate>> = candidates.into_iter().map(Some).collect();
    let mut selected = Vec::new();

    while !remaining.is_empty() {
        let mut best: Option<(usize, usize)> = None;
        for (index, candidate) in available.iter().enumerate() {
            let candidate = match candidate {
                Some(candidate) => candidate,
                None => continue,
            };
            let gain = candidate.coverage.intersection(&remaining).count();
            if gain > 0 && best.map(|(_, g)| gain > g).unwrap_or(true) {
                best = Some((index, gain));
            }
        }
        match best.and_then(|(index, _)| available[index].take()) {
            Some(candidate) => {
                for pair in &candidate.coverage {
                    remaining.remove(pair);
                }
                selected.push(candidate.record);
                stats.num_selected += 1;
            }
            None => {
                // Pairs covered only by a pruned trace; nothing can
                // witness them, keep what we have.
                warn!("{} coverage pairs have no candidate record", remaining.len());
                break;
            }
        }
    }
    (selected, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_wire::LocationId;

    fn record_with_path(tag: u8, steps: &[(u32, bool)]) -> ExecutionRecord {
        ExecutionRecord {
            flags: ExecutionRecord::BRANCH_DISCOVERED,
            stdin_bytes: vec![tag],
            stdin_types: vec![quarry_wire::InputType::U8],
            path: steps
                .iter()
                .map(|(id, direction)| (LocationId::new(*id, 0), *direction))
                .collect(),
        }
    }

    fn universe_of(records: &[&ExecutionRecord]) -> HashSet<CoveragePair> {
        records
            .iter()
            .flat_map(|r| coverage_of(&r.path))
            .collect()
    }

    #[test]
    fn redundant_records_are_dropped() {
        let a = record_with_path(1, &[(1, false)]);
        let b = record_with_path(2, &[(1, false), (2, false)]);
        let c = record_with_path(3, &[(1, true)]);
        let universe = universe_of(&[&a, &b, &c]);
        let candidates = vec![
            SuiteCandidate::new(a),
            SuiteCandidate::new(b),
            SuiteCandidate::new(c),
        ];
        let (selected, stats) = minimize(candidates, &universe, &HashSet::new());
        // `b` subsumes `a`; `c` is needed for the true direction.
        assert_eq!(selected.len(), 2);
        assert_eq!(stats.num_selected, 2);
        assert_eq!(stats.num_candidates, 3);
        let covered: HashSet<CoveragePair> = selected
            .iter()
            .flat_map(|r| coverage_of(&r.path))
            .collect();
        assert_eq!(covered, universe);
    }

    #[test]
    fn pre_covered_pairs_need_no_candidate() {
        let a = record_with_path(1, &[(1, false)]);
        let universe: HashSet<CoveragePair> =
            [(LocationId::new(1, 0).uid(), false), (LocationId::new(1, 0).uid(), true)]
                .into_iter()
                .collect();
        let pre: HashSet<CoveragePair> =
            [(LocationId::new(1, 0).uid(), true)].into_iter().collect();
        let (selected, stats) = minimize(vec![SuiteCandidate::new(a)], &universe, &pre);
        assert_eq!(selected.len(), 1);
        assert_eq!(stats.num_pre_covered_pairs, 1);
    }

    #[test]
    fn uncoverable_pairs_do_not_loop() {
        let universe: HashSet<CoveragePair> =
            [(LocationId::new(9, 0).uid(), true)].into_iter().collect();
        let (selected, stats) = minimize(Vec::new(), &universe, &HashSet::new());
        assert!(selected.is_empty());
        assert_eq!(stats.num_selected, 0);
    }

    #[test]
    fn ties_keep_the_earliest_record() {
        let a = record_with_path(1, &[(1, false)]);
        let b = record_with_path(2, &[(1, false)]);
        let first_bytes = a.stdin_bytes.clone();
        let universe = universe_of(&[&a, &b]);
        let (selected, _) = minimize(
            vec![SuiteCandidate::new(a), SuiteCandidate::new(b)],
            &universe,
            &HashSet::new(),
        );
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].stdin_bytes, first_bytes);
    }
}

//! End-to-end coverage scenarios against simulated instrumented targets.

mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use common::{load_native_records, SimulatedTarget, TargetIo};
use quarry::fuzzer::Fuzzer;
use quarry::outcomes::{TerminationInfo, TerminationReason, TerminationType};
use quarry::record::{ExecutionRecord, ExecutionRecordWriter, TestType};
use quarry_wire::{LocationId, TargetTermination};

fn budget(max_executions: u32) -> TerminationInfo {
    TerminationInfo {
        max_executions,
        max_seconds: 300,
    }
}

fn no_cancel() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

fn writer_in(dir: &std::path::Path) -> ExecutionRecordWriter {
    ExecutionRecordWriter::new(dir.to_path_buf(), "target", "0.2.0", TestType::Native).unwrap()
}

#[tokio::test]
async fn u16_equality_is_covered_via_typed_minimization() {
    let dir = tempfile::tempdir().unwrap();
    let target = SimulatedTarget::new(|io: &mut TargetIo| {
        let x = io.read_u16();
        io.cmp_eq(1, x as i64, 12345);
        TargetTermination::Normal
    });
    let mut fuzzer = Fuzzer::new(target, budget(500), Some(writer_in(dir.path())), no_cancel());
    let outcomes = fuzzer.run().await;

    assert_eq!(outcomes.termination_type, TerminationType::Normal);
    assert_eq!(
        outcomes.termination_reason,
        TerminationReason::AllReachableBranchingsCovered
    );
    assert_eq!(outcomes.covered_branchings, vec![LocationId::new(1, 0)]);
    assert!(outcomes.uncovered_branchings.is_empty());
    // One initial run plus one probe per input bit before minimization.
    assert_eq!(outcomes.sensitivity_statistics.generated_inputs, 16);
    // Both branch-instruction edges of the single conditional were hit.
    assert_eq!(outcomes.fuzzer_statistics.br_instrs_covered, 2);

    let records = load_native_records(dir.path());
    let witness = records
        .iter()
        .find(|(_, _, path)| path.contains(&(1, true)))
        .expect("a record covers the equality direction");
    let x = u16::from_le_bytes([witness.1[0], witness.1[1]]);
    assert_eq!(x, 12345);
}

#[tokio::test]
async fn f32_equality_converges_to_the_constant() {
    const TARGET: f32 = -123.4567;
    let dir = tempfile::tempdir().unwrap();
    let target = SimulatedTarget::new(|io: &mut TargetIo| {
        let x = io.read_f32();
        io.cmp_eq_f64(2, x as f64, TARGET as f64);
        TargetTermination::Normal
    });
    let mut fuzzer = Fuzzer::new(target, budget(2000), Some(writer_in(dir.path())), no_cancel());
    let outcomes = fuzzer.run().await;

    assert!(outcomes.uncovered_branchings.is_empty());
    let records = load_native_records(dir.path());
    let witness = records
        .iter()
        .find(|(_, _, path)| path.contains(&(2, true)))
        .expect("a record covers the equality direction");
    let x = f32::from_le_bytes([witness.1[0], witness.1[1], witness.1[2], witness.1[3]]);
    assert!((x - TARGET).abs() < 1e-4, "witness {x} too far from {TARGET}");
}

#[tokio::test]
async fn nested_char_comparisons_cover_all_branches() {
    let word = *b"bad!";
    let target = SimulatedTarget::new(move |io: &mut TargetIo| {
        for (i, expected) in word.iter().enumerate() {
            let c = io.read_u8();
            if !io.cmp_eq(10 + i as u32, c as i64, *expected as i64) {
                return TargetTermination::Normal;
            }
        }
        TargetTermination::Normal
    });
    let mut fuzzer = Fuzzer::new(target, budget(300), None, no_cancel());
    let outcomes = fuzzer.run().await;

    assert_eq!(
        outcomes.termination_reason,
        TerminationReason::AllReachableBranchingsCovered
    );
    let covered: Vec<u32> = outcomes.covered_branchings.iter().map(|id| id.id).collect();
    assert_eq!(covered, vec![10, 11, 12, 13]);
    assert!(outcomes.uncovered_branchings.is_empty());
    assert!(outcomes.num_executions <= 300);
}

fn hash_combine(seed: &mut u32, x: i8) {
    *seed ^= (x as u32)
        .wrapping_mul(977)
        .wrapping_add(0x9e37_79b9)
        .wrapping_add(*seed << 6)
        .wrapping_add(*seed >> 2);
}

fn hash_combine3(x: i8, y: i8, z: i8) -> u32 {
    let mut seed = 73_910u32;
    hash_combine(&mut seed, x);
    hash_combine(&mut seed, y);
    hash_combine(&mut seed, z);
    seed
}

#[tokio::test]
async fn hash_combine_witnesses_always_satisfy_the_equality() {
    let goal = hash_combine3(-24, 56, -120);
    let dir = tempfile::tempdir().unwrap();
    let target = SimulatedTarget::new(move |io: &mut TargetIo| {
        let x = io.read_i8();
        let y = io.read_i8();
        let z = io.read_i8();
        io.cmp_eq(20, hash_combine3(x, y, z) as i64, goal as i64);
        TargetTermination::Normal
    });
    let mut fuzzer = Fuzzer::new(target, budget(2000), Some(writer_in(dir.path())), no_cancel());
    let outcomes = fuzzer.run().await;

    assert_eq!(outcomes.termination_type, TerminationType::Normal);
    assert!(outcomes.num_executions <= 2000);
    // Any witness the search produced must genuinely satisfy the
    // equality; the canonical triple is not required.
    for (_, bytes, path) in load_native_records(dir.path()) {
        if path.contains(&(20, true)) {
            let (x, y, z) = (bytes[0] as i8, bytes[1] as i8, bytes[2] as i8);
            assert_eq!(hash_combine3(x, y, z), goal);
        }
    }
}

/// Mirror of a little `x=<int>;y=<int>` parser: every comparison is its
/// own branching, loop branchings repeat their location.
fn parse_int(io: &mut TargetIo, s: &[u8], mut idx: usize, which: u8, terminal: u8, base: u32) -> Option<usize> {
    let at = |i: usize| s.get(i).copied().unwrap_or(0) as i64;
    if io.cmp_eq(base, at(idx), 0) {
        return None;
    }
    if !io.cmp_eq(base + 1, at(idx), which as i64) {
        return None;
    }
    idx += 1;
    if io.cmp_eq(base + 2, at(idx), 0) {
        return None;
    }
    if !io.cmp_eq(base + 3, at(idx), b'=' as i64) {
        return None;
    }
    idx += 1;
    if io.cmp_eq(base + 4, at(idx), 0) {
        return None;
    }
    if io.cmp_eq(base + 5, at(idx), b'-' as i64) {
        idx += 1;
    } else if io.cmp_eq(base + 6, at(idx), b'+' as i64) {
        idx += 1;
    }
    let end = idx;
    loop {
        if io.cmp_eq(base + 7, at(idx), terminal as i64) {
            break;
        }
        if io.cmp_eq(base + 8, at(idx), 0) {
            return None;
        }
        if io.cmp_lt(base + 9, at(idx), b'0' as i64) {
            return None;
        }
        if io.cmp_lt(base + 10, b'9' as i64, at(idx)) {
            return None;
        }
        idx += 1;
        if io.cmp_lt(base + 11, 3, (idx - end) as i64) {
            return None;
        }
    }
    if io.cmp_eq(base + 12, idx as i64, end as i64) {
        return None;
    }
    Some(idx)
}

fn matches_witness(s: &[u8]) -> bool {
    fn int(s: &[u8], mut i: usize) -> Option<usize> {
        if matches!(s.get(i), Some(b'+') | Some(b'-')) {
            i += 1;
        }
        let start = i;
        while i < s.len() && s[i].is_ascii_digit() {
            i += 1;
        }
        if i == start || i - start > 3 {
            return None;
        }
        Some(i)
    }
    let mut i = 0;
    if s.get(i) != Some(&b'x') || s.get(i + 1) != Some(&b'=') {
        return false;
    }
    i = match int(s, i + 2) {
        Some(i) => i,
        None => return false,
    };
    if s.get(i) != Some(&b';') || s.get(i + 1) != Some(&b'y') || s.get(i + 2) != Some(&b'=') {
        return false;
    }
    i = match int(s, i + 3) {
        Some(i) => i,
        None => return false,
    };
    s.get(i) == Some(&0)
}

#[tokio::test]
async fn parser_success_path_is_reached_with_a_wellformed_witness() {
    let dir = tempfile::tempdir().unwrap();
    let target = SimulatedTarget::new(|io: &mut TargetIo| {
        let n = io.read_i16() as i64;
        if !io.cmp_lt(30, 0, n) {
            return TargetTermination::Normal;
        }
        if !io.cmp_lt(31, n, 50) {
            return TargetTermination::Normal;
        }
        let n = n as usize;
        let mut s = Vec::with_capacity(n);
        for _ in 0..n {
            s.push(io.read_u8());
        }
        if !io.cmp_eq(32, s[n - 1] as i64, 0) {
            return TargetTermination::Normal;
        }
        let x_end = match parse_int(io, &s, 0, b'x', b';', 40) {
            Some(end) => end,
            None => return TargetTermination::Normal,
        };
        if parse_int(io, &s, x_end + 1, b'y', 0, 60).is_none() {
            return TargetTermination::Normal;
        }
        io.cmp_eq(99, 1, 1);
        TargetTermination::Normal
    });
    let mut fuzzer = Fuzzer::new(target, budget(60_000), Some(writer_in(dir.path())), no_cancel());
    let outcomes = fuzzer.run().await;

    assert_eq!(outcomes.termination_type, TerminationType::Normal);
    let reached_success = outcomes
        .covered_branchings
        .iter()
        .any(|id| id.id == 99)
        || outcomes
            .uncovered_branchings
            .iter()
            .any(|(id, _)| id.id == 99);
    assert!(reached_success, "parser success path was never reached");

    let records = load_native_records(dir.path());
    let witness = records
        .iter()
        .find(|(_, _, path)| path.contains(&(99, true)))
        .expect("a record reaches the success branching");
    assert!(
        matches_witness(&witness.1[2..]),
        "witness {:?} is not x=<int>;y=<int>",
        String::from_utf8_lossy(&witness.1[2..])
    );
}

#[tokio::test]
async fn crash_inputs_are_recorded_and_fuzzing_continues() {
    let dir = tempfile::tempdir().unwrap();
    let target = SimulatedTarget::new(|io: &mut TargetIo| {
        let x = io.read_u8();
        if io.cmp_eq(50, x as i64, 7) {
            return TargetTermination::Crash;
        }
        TargetTermination::Normal
    });
    let mut fuzzer = Fuzzer::new(target, budget(500), Some(writer_in(dir.path())), no_cancel());
    let outcomes = fuzzer.run().await;

    assert_eq!(outcomes.termination_type, TerminationType::Normal);
    assert!(outcomes.fuzzer_statistics.crashes >= 1);
    assert!(outcomes.uncovered_branchings.is_empty());
    let records = load_native_records(dir.path());
    let crash = records
        .iter()
        .find(|(flags, _, _)| flags & ExecutionRecord::EXECUTION_CRASHES != 0)
        .expect("crash record written");
    assert_eq!(crash.1[0], 7);
    let stats = &outcomes.output_statistics["default"];
    assert!(stats.num_crashes >= 1);
}

#[tokio::test]
async fn truncated_traces_never_grow_leaves_past_the_boundary() {
    let target = SimulatedTarget::with_max_trace_length(
        |io: &mut TargetIo| {
            let _x = io.read_u8();
            for i in 0..100 {
                io.cmp_eq(60, i, 200);
            }
            TargetTermination::Normal
        },
        10,
    );
    let mut fuzzer = Fuzzer::new(target, budget(200), None, no_cancel());
    let outcomes = fuzzer.run().await;

    assert_eq!(outcomes.termination_type, TerminationType::Normal);
    assert!(outcomes.fuzzer_statistics.boundary_violations >= 1);
    // Every execution truncates at ten branchings, so the tree can never
    // hold more than ten nodes of this straight-line path.
    assert!(fuzzer.tree().len() <= 10);
    assert_eq!(
        outcomes.fuzzer_statistics.boundary_violations,
        outcomes.num_executions
    );
}

#[tokio::test]
async fn a_target_without_branchings_finishes_immediately() {
    let target = SimulatedTarget::new(|_io: &mut TargetIo| TargetTermination::Normal);
    let mut fuzzer = Fuzzer::new(target, budget(100), None, no_cancel());
    let outcomes = fuzzer.run().await;

    assert_eq!(
        outcomes.termination_reason,
        TerminationReason::AllReachableBranchingsCovered
    );
    assert_eq!(outcomes.num_executions, 1);
    assert!(outcomes.covered_branchings.is_empty());
    assert!(outcomes.uncovered_branchings.is_empty());
}

#[tokio::test]
async fn untyped_input_falls_through_to_bit_level_minimization() {
    // The chunk is opaque, so typed minimization has nothing to work on;
    // the Hamming-friendly objective lets the bit-level descent flip it.
    const SECRET: u8 = 0b1101_0110;
    let target = SimulatedTarget::new(|io: &mut TargetIo| {
        let c = io.read_untyped8();
        let distance = (c ^ SECRET).count_ones() as i64;
        io.cmp_eq(80, distance, 0);
        TargetTermination::Normal
    });
    let mut fuzzer = Fuzzer::new(target, budget(2000), None, no_cancel());
    let outcomes = fuzzer.run().await;

    assert!(outcomes.uncovered_branchings.is_empty());
    assert_eq!(outcomes.typed_minimization_statistics.start_calls, 0);
    assert_eq!(outcomes.minimization_statistics.flips, 1);
}

#[tokio::test]
async fn successful_flips_feed_the_bitshare_cache() {
    // The same comparison location guards two consecutive reads; every
    // flip of it lands its achieving pattern in the bitshare cache.
    let target = SimulatedTarget::new(|io: &mut TargetIo| {
        for _ in 0..2 {
            let c = io.read_u8();
            if !io.cmp_eq(70, c as i64, 9) {
                return TargetTermination::Normal;
            }
        }
        TargetTermination::Normal
    });
    let mut fuzzer = Fuzzer::new(target, budget(1000), None, no_cancel());
    let outcomes = fuzzer.run().await;

    assert!(outcomes.uncovered_branchings.is_empty());
    assert!(outcomes.bitshare_statistics.num_insertions >= 1);
}

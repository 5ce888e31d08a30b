#![allow(dead_code)]

//! Simulated instrumented targets for driving the engine in-process.
//!
//! A [`SimulatedTarget`] stands in for the external executor: it replays
//! the candidate bytes through the default stdin model (replayed bytes,
//! then 0x55 repeated), records one branching per comparison with the
//! branching-function values the real instrumentation would produce, and
//! reports the consumed typed chunks back.

use anyhow::Result;
use async_trait::async_trait;
use quarry::executor::{ExecutionResult, TargetExecutor};
use quarry::stdin_bits::{bits_to_bytes, Bits};
use quarry_wire::{BrInstrCoverageInfo, BranchingCoverageInfo, InputType, LocationId, TargetTermination};

/// Byte served once the replayed input is exhausted.
pub const FILL_BYTE: u8 = 0x55;

pub struct TargetIo {
    replayed: Vec<u8>,
    cursor: usize,
    consumed_bytes: Vec<u8>,
    consumed_types: Vec<InputType>,
    trace: Vec<BranchingCoverageInfo>,
    br_instr_trace: Vec<BrInstrCoverageInfo>,
}

impl TargetIo {
    fn new(replayed: Vec<u8>) -> Self {
        Self {
            replayed,
            cursor: 0,
            consumed_bytes: Vec::new(),
            consumed_types: Vec::new(),
            trace: Vec::new(),
            br_instr_trace: Vec::new(),
        }
    }

    fn read_raw(&mut self, ty: InputType) -> u64 {
        let width = ty.num_bytes() as usize;
        let mut raw = [0u8; 8];
        for slot in raw.iter_mut().take(width) {
            let byte = self
                .replayed
                .get(self.cursor)
                .copied()
                .unwrap_or(FILL_BYTE);
            self.cursor += 1;
            self.consumed_bytes.push(byte);
            *slot = byte;
        }
        self.consumed_types.push(ty);
        u64::from_le_bytes(raw)
    }

    pub fn read_u8(&mut self) -> u8 {
        self.read_raw(InputType::U8) as u8
    }

    pub fn read_i8(&mut self) -> i8 {
        self.read_raw(InputType::S8) as i8
    }

    pub fn read_u16(&mut self) -> u16 {
        self.read_raw(InputType::U16) as u16
    }

    pub fn read_i16(&mut self) -> i16 {
        self.read_raw(InputType::S16) as i16
    }

    pub fn read_f32(&mut self) -> f32 {
        f32::from_bits(self.read_raw(InputType::F32) as u32)
    }

    /// A read the engine sees as an opaque byte.
    pub fn read_untyped8(&mut self) -> u8 {
        self.read_raw(InputType::Untyped8) as u8
    }

    fn push(&mut self, loc: u32, direction: bool, value: f64) {
        self.br_instr_trace.push(BrInstrCoverageInfo {
            id: LocationId::new(loc, 0),
            covered_branch: direction,
        });
        self.trace.push(BranchingCoverageInfo {
            id: LocationId::new(loc, 0),
            direction,
            value,
            idx_to_br_instr: self.br_instr_trace.len() as u32 - 1,
        });
    }

    /// Branch on `a == b` over integers; the value measures how far the
    /// alternate direction was.
    pub fn cmp_eq(&mut self, loc: u32, a: i64, b: i64) -> bool {
        let diff = (a as i128 - b as i128).unsigned_abs() as f64;
        let taken = a == b;
        self.push(loc, taken, if taken { diff + 1.0 } else { diff });
        taken
    }

    /// Branch on `a < b` over integers.
    pub fn cmp_lt(&mut self, loc: u32, a: i64, b: i64) -> bool {
        let taken = a < b;
        let value = if taken {
            (b as i128 - a as i128) as f64
        } else {
            (a as i128 - b as i128) as f64 + 1.0
        };
        self.push(loc, taken, value);
        taken
    }

    /// Branch on `a == b` over floats; NaN distances become +inf like the
    /// instrumentation callback makes them.
    pub fn cmp_eq_f64(&mut self, loc: u32, a: f64, b: f64) -> bool {
        let diff = (a - b).abs();
        let diff = if diff.is_nan() { f64::INFINITY } else { diff };
        let taken = a == b;
        self.push(loc, taken, if taken { 1.0 } else { diff.max(f64::MIN_POSITIVE) });
        taken
    }
}

/// The program under test plus the executor-side limits.
pub struct SimulatedTarget<F> {
    program: F,
    max_trace_length: usize,
    pub executions: u64,
}

impl<F> SimulatedTarget<F>
where
    F: FnMut(&mut TargetIo) -> TargetTermination,
{
    pub fn new(program: F) -> Self {
        Self {
            program,
            max_trace_length: 10_000,
            executions: 0,
        }
    }

    pub fn with_max_trace_length(program: F, max_trace_length: usize) -> Self {
        Self {
            program,
            max_trace_length,
            executions: 0,
        }
    }
}

#[async_trait(?Send)]
impl<F> TargetExecutor for SimulatedTarget<F>
where
    F: FnMut(&mut TargetIo) -> TargetTermination,
{
    async fn execute(&mut self, bits: &Bits) -> Result<ExecutionResult> {
        self.executions += 1;
        let mut io = TargetIo::new(bits_to_bytes(bits));
        let mut termination = (self.program)(&mut io);
        if io.trace.len() > self.max_trace_length {
            io.trace.truncate(self.max_trace_length);
            termination = TargetTermination::BoundaryConditionViolation;
        }
        Ok(ExecutionResult {
            termination: Some(termination),
            trace: io.trace,
            br_instr_trace: io.br_instr_trace,
            stdin_types: io.consumed_types,
            stdin_bytes: io.consumed_bytes,
        })
    }
}

/// Decode one test record written by the native writer.
pub fn load_native_records(dir: &std::path::Path) -> Vec<(u8, Vec<u8>, Vec<(u32, bool)>)> {
    let mut records = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
        .collect();
    entries.sort();
    for path in entries {
        let doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let flags = doc["flags"].as_u64().unwrap() as u8;
        let hex = doc["stdin_bytes"].as_str().unwrap();
        let bytes: Vec<u8> = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
            .collect();
        let path_steps: Vec<(u32, bool)> = doc["path"]
            .as_array()
            .unwrap()
            .iter()
            .map(|step| {
                (
                    step[0].as_u64().unwrap() as u32,
                    step[2].as_bool().unwrap(),
                )
            })
            .collect();
        records.push((flags, bytes, path_steps));
    }
    records
}

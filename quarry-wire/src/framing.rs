//! Little-endian framing of the shared-memory segment.
//!
//! Request (engine -> target): two length-prefixed records. The first is
//! the configuration record, the second the stdin bytes record terminated
//! by a 0u16 sentinel.
//!
//! Result (target -> engine): a two-byte termination header
//! `(DataRecordId::Termination, TargetTermination)` followed by tagged
//! records until the first `Invalid` tag or the end of the segment.

use bytes::{Buf, BufMut};

use crate::types::{
    BrInstrCoverageInfo, BranchingCoverageInfo, DataRecordId, InputType, LocationId,
    TargetTermination,
};

/// Size of the `(record id, termination)` header the target writes first.
pub const TERMINATION_HEADER_BYTES: usize = 2;

/// Configuration record handed to the target runtime on every run.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetConfig {
    pub max_trace_length: u32,
    pub max_br_instr_trace_length: u32,
    pub max_stack_size: u8,
    pub max_stdin_bytes: u16,
    pub stdin_model_name: String,
    pub stdout_model_name: String,
}

impl TargetConfig {
    fn encoded_len(&self) -> usize {
        4 + 4 + 1 + 2 + 2 + self.stdin_model_name.len() + 2 + self.stdout_model_name.len()
    }
}

fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut impl Buf) -> Result<String, FramingError> {
    if buf.remaining() < 2 {
        return Err(FramingError::Truncated("string length"));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(FramingError::Truncated("string bytes"));
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| FramingError::Malformed("non-utf8 model name"))
}

/// A framing problem on either side of the segment.
#[derive(Debug, PartialEq, Eq)]
pub enum FramingError {
    Truncated(&'static str),
    Malformed(&'static str),
}

impl std::fmt::Display for FramingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingError::Truncated(what) => write!(f, "payload truncated at {what}"),
            FramingError::Malformed(what) => write!(f, "malformed payload: {what}"),
        }
    }
}

impl std::error::Error for FramingError {}

/// Serialise the per-run request into `buf`.
pub fn write_request(buf: &mut impl BufMut, config: &TargetConfig, stdin_bytes: &[u8]) {
    buf.put_u32_le(config.encoded_len() as u32);
    buf.put_u32_le(config.max_trace_length);
    buf.put_u32_le(config.max_br_instr_trace_length);
    buf.put_u8(config.max_stack_size);
    buf.put_u16_le(config.max_stdin_bytes);
    put_string(buf, &config.stdin_model_name);
    put_string(buf, &config.stdout_model_name);

    buf.put_u32_le((2 + stdin_bytes.len() + 2) as u32);
    buf.put_u16_le(stdin_bytes.len() as u16);
    buf.put_slice(stdin_bytes);
    buf.put_u16_le(0);
}

/// Parse a request back out of a segment. Exercised by the engine's own
/// tests and by target runtimes written in Rust.
pub fn read_request(buf: &mut impl Buf) -> Result<(TargetConfig, Vec<u8>), FramingError> {
    if buf.remaining() < 4 {
        return Err(FramingError::Truncated("config record length"));
    }
    let _config_len = buf.get_u32_le();
    if buf.remaining() < 11 {
        return Err(FramingError::Truncated("config record"));
    }
    let config = TargetConfig {
        max_trace_length: buf.get_u32_le(),
        max_br_instr_trace_length: buf.get_u32_le(),
        max_stack_size: buf.get_u8(),
        max_stdin_bytes: buf.get_u16_le(),
        stdin_model_name: get_string(buf)?,
        stdout_model_name: get_string(buf)?,
    };
    if buf.remaining() < 4 + 2 {
        return Err(FramingError::Truncated("stdin record"));
    }
    let _stdin_len = buf.get_u32_le();
    let count = buf.get_u16_le() as usize;
    if buf.remaining() < count + 2 {
        return Err(FramingError::Truncated("stdin bytes"));
    }
    let mut bytes = vec![0u8; count];
    buf.copy_to_slice(&mut bytes);
    if buf.get_u16_le() != 0 {
        return Err(FramingError::Malformed("missing stdin sentinel"));
    }
    Ok((config, bytes))
}

/// Everything the target reported back for one run.
#[derive(Clone, Debug, Default)]
pub struct ResultPayload {
    pub termination: Option<TargetTermination>,
    pub trace: Vec<BranchingCoverageInfo>,
    pub br_instr_trace: Vec<BrInstrCoverageInfo>,
    pub stdin_types: Vec<InputType>,
    pub stdin_bytes: Vec<u8>,
}

/// Branching values must be strictly positive; the runtime callback maps
/// NaN to +inf, and the parser repeats the normalisation so a misbehaving
/// runtime cannot leak NaN or non-positive values into the engine.
fn normalize_value(raw: f64) -> f64 {
    if raw.is_nan() {
        f64::INFINITY
    } else if raw <= 0.0 {
        f64::MIN_POSITIVE
    } else {
        raw
    }
}

/// Serialise a result payload into `buf`. Used by Rust target runtimes and
/// by the engine's simulated targets.
pub fn write_result(buf: &mut impl BufMut, payload: &ResultPayload) {
    buf.put_u8(DataRecordId::Termination.to_wire());
    buf.put_u8(
        payload
            .termination
            .unwrap_or(TargetTermination::Crash)
            .to_wire(),
    );
    for info in &payload.trace {
        buf.put_u8(DataRecordId::Condition.to_wire());
        buf.put_u32_le(info.id.id);
        buf.put_u32_le(info.id.context_hash);
        buf.put_u8(info.direction as u8);
        buf.put_f64_le(info.value);
        buf.put_u32_le(info.idx_to_br_instr);
    }
    for info in &payload.br_instr_trace {
        buf.put_u8(DataRecordId::BrInstr.to_wire());
        buf.put_u32_le(info.id.id);
        buf.put_u32_le(info.id.context_hash);
        buf.put_u8(info.covered_branch as u8);
    }
    buf.put_u8(DataRecordId::StdinBytes.to_wire());
    buf.put_u16_le(payload.stdin_types.len() as u16);
    let mut offset = 0usize;
    for ty in &payload.stdin_types {
        buf.put_u8(ty.to_wire());
        let width = ty.num_bytes() as usize;
        buf.put_slice(&payload.stdin_bytes[offset..offset + width]);
        offset += width;
    }
    buf.put_u8(DataRecordId::Invalid.to_wire());
}

/// Parse the result payload the target flushed to the segment.
///
/// A timed-out target may have flushed only a prefix; parsing stops at the
/// first `Invalid` tag, the end of the buffer, or a record that no longer
/// fits, returning whatever was complete up to that point.
pub fn read_result(buf: &mut impl Buf) -> Result<ResultPayload, FramingError> {
    let mut payload = ResultPayload::default();
    if buf.remaining() < TERMINATION_HEADER_BYTES {
        return Err(FramingError::Truncated("termination header"));
    }
    if DataRecordId::from_wire(buf.get_u8()) != Some(DataRecordId::Termination) {
        return Err(FramingError::Malformed("missing termination header"));
    }
    payload.termination = TargetTermination::from_wire(buf.get_u8());
    if payload.termination.is_none() {
        return Err(FramingError::Malformed("unknown termination kind"));
    }

    while buf.has_remaining() {
        let tag = match DataRecordId::from_wire(buf.get_u8()) {
            Some(DataRecordId::Invalid) | None => break,
            Some(tag) => tag,
        };
        match tag {
            DataRecordId::Condition => {
                if buf.remaining() < 4 + 4 + 1 + 8 + 4 {
                    break;
                }
                let id = LocationId::new(buf.get_u32_le(), buf.get_u32_le());
                let direction = buf.get_u8() != 0;
                let value = normalize_value(buf.get_f64_le());
                let idx_to_br_instr = buf.get_u32_le();
                payload.trace.push(BranchingCoverageInfo {
                    id,
                    direction,
                    value,
                    idx_to_br_instr,
                });
            }
            DataRecordId::BrInstr => {
                if buf.remaining() < 4 + 4 + 1 {
                    break;
                }
                let id = LocationId::new(buf.get_u32_le(), buf.get_u32_le());
                let covered_branch = buf.get_u8() != 0;
                payload.br_instr_trace.push(BrInstrCoverageInfo {
                    id,
                    covered_branch,
                });
            }
            DataRecordId::StdinBytes => {
                if buf.remaining() < 2 {
                    break;
                }
                let count = buf.get_u16_le() as usize;
                for _ in 0..count {
                    if buf.remaining() < 1 {
                        break;
                    }
                    let ty = InputType::from_wire(buf.get_u8())
                        .ok_or(FramingError::Malformed("unknown input type"))?;
                    let width = ty.num_bytes() as usize;
                    if buf.remaining() < width {
                        break;
                    }
                    let start = payload.stdin_bytes.len();
                    payload.stdin_bytes.resize(start + width, 0);
                    buf.copy_to_slice(&mut payload.stdin_bytes[start..]);
                    payload.stdin_types.push(ty);
                }
            }
            DataRecordId::Termination | DataRecordId::Invalid => break,
        }
    }
    Ok(payload)
}

/// Worst-case segment size for a run under `config`, with headroom for the
/// record tags and the stdin echo.
pub fn required_shared_memory_size(config: &TargetConfig) -> usize {
    let condition = 1 + 4 + 4 + 1 + 8 + 4;
    let br_instr = 1 + 4 + 4 + 1;
    let stdin = 1 + 2 + config.max_stdin_bytes as usize * (1 + 8);
    let request = 4 + config.encoded_len() + 4 + 2 + config.max_stdin_bytes as usize + 2;
    let result = TERMINATION_HEADER_BYTES
        + config.max_trace_length as usize * condition
        + config.max_br_instr_trace_length as usize * br_instr
        + stdin
        + 1;
    request.max(result) + 64
}

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one conditional branching in the target.
///
/// `id` names the static instruction, `context_hash` the dynamic calling
/// context, so the same source-level branching reached through different
/// call chains counts as a different location.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocationId {
    pub id: u32,
    pub context_hash: u32,
}

impl LocationId {
    pub const fn new(id: u32, context_hash: u32) -> Self {
        Self { id, context_hash }
    }

    /// Packed form used for ordering and logging.
    pub fn uid(self) -> u64 {
        ((self.context_hash as u64) << 32) | self.id as u64
    }
}

impl fmt::Debug for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:x}", self.id, self.context_hash)
    }
}

/// One observed conditional branching on an execution trace.
///
/// `value` is the branching function: strictly positive, and the closer to
/// zero the closer the *other* direction was to being taken. The runtime
/// callback normalises NaN to +inf before it reaches the wire; the parser
/// in [`crate::framing`] enforces it again on the way in.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BranchingCoverageInfo {
    pub id: LocationId,
    pub direction: bool,
    pub value: f64,
    pub idx_to_br_instr: u32,
}

/// One covered branch instruction, as reported by the `br_instr` record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrInstrCoverageInfo {
    pub id: LocationId,
    pub covered_branch: bool,
}

/// How the target run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetTermination {
    /// Target code finished normally.
    Normal,
    /// Target code crashed or called the error-reaching hook.
    Crash,
    /// The executor killed the target after the wall-clock timeout.
    Timeout,
    /// Trace too long, stack too deep, stdin exhausted beyond the limit, ...
    BoundaryConditionViolation,
}

impl TargetTermination {
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Normal),
            1 => Some(Self::Crash),
            2 => Some(Self::Timeout),
            3 => Some(Self::BoundaryConditionViolation),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Crash => 1,
            Self::Timeout => 2,
            Self::BoundaryConditionViolation => 3,
        }
    }
}

/// Tag of one record in the result payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataRecordId {
    Invalid,
    Termination,
    Condition,
    BrInstr,
    StdinBytes,
}

impl DataRecordId {
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Invalid),
            1 => Some(Self::Termination),
            2 => Some(Self::Condition),
            3 => Some(Self::BrInstr),
            4 => Some(Self::StdinBytes),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Invalid => 0,
            Self::Termination => 1,
            Self::Condition => 2,
            Self::BrInstr => 3,
            Self::StdinBytes => 4,
        }
    }
}

/// Reinterpretation rule for one contiguous chunk of input bits.
///
/// The target runtime reports the type of every read it serviced; the
/// engine mutates inputs chunk-wise under these types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Boolean,
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
    U64,
    S64,
    F32,
    F64,
    Untyped8,
}

impl InputType {
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Boolean),
            1 => Some(Self::U8),
            2 => Some(Self::S8),
            3 => Some(Self::U16),
            4 => Some(Self::S16),
            5 => Some(Self::U32),
            6 => Some(Self::S32),
            7 => Some(Self::U64),
            8 => Some(Self::S64),
            9 => Some(Self::F32),
            10 => Some(Self::F64),
            11 => Some(Self::Untyped8),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Boolean => 0,
            Self::U8 => 1,
            Self::S8 => 2,
            Self::U16 => 3,
            Self::S16 => 4,
            Self::U32 => 5,
            Self::S32 => 6,
            Self::U64 => 7,
            Self::S64 => 8,
            Self::F32 => 9,
            Self::F64 => 10,
            Self::Untyped8 => 11,
        }
    }

    pub fn num_bits(self) -> u32 {
        match self {
            Self::Boolean | Self::U8 | Self::S8 | Self::Untyped8 => 8,
            Self::U16 | Self::S16 => 16,
            Self::U32 | Self::S32 | Self::F32 => 32,
            Self::U64 | Self::S64 | Self::F64 => 64,
        }
    }

    pub fn num_bytes(self) -> u32 {
        self.num_bits() / 8
    }

    /// Untyped chunks carry no reinterpretation rule the mutation analyses
    /// could exploit.
    pub fn is_known(self) -> bool {
        !matches!(self, Self::Untyped8)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Self::S8 | Self::S16 | Self::S32 | Self::S64)
    }

    /// Smallest representable value, as the engine's working domain.
    pub fn min_value(self) -> f64 {
        match self {
            Self::Boolean => 0.0,
            Self::U8 | Self::U16 | Self::U32 | Self::U64 | Self::Untyped8 => 0.0,
            Self::S8 => i8::MIN as f64,
            Self::S16 => i16::MIN as f64,
            Self::S32 => i32::MIN as f64,
            Self::S64 => i64::MIN as f64,
            Self::F32 => f32::MIN as f64,
            Self::F64 => f64::MIN,
        }
    }

    /// Largest representable value, as the engine's working domain.
    pub fn max_value(self) -> f64 {
        match self {
            Self::Boolean => 1.0,
            Self::U8 | Self::Untyped8 => u8::MAX as f64,
            Self::U16 => u16::MAX as f64,
            Self::U32 => u32::MAX as f64,
            Self::U64 => u64::MAX as f64,
            Self::S8 => i8::MAX as f64,
            Self::S16 => i16::MAX as f64,
            Self::S32 => i32::MAX as f64,
            Self::S64 => i64::MAX as f64,
            Self::F32 => f32::MAX as f64,
            Self::F64 => f64::MAX,
        }
    }

    /// The C spelling used by the test-comp test format.
    pub fn c_type_string(self) -> &'static str {
        match self {
            Self::Boolean => "_Bool",
            Self::U8 => "unsigned char",
            Self::S8 => "char",
            Self::U16 => "unsigned short",
            Self::S16 => "short",
            Self::U32 => "unsigned int",
            Self::S32 => "int",
            Self::U64 => "unsigned long long",
            Self::S64 => "long long",
            Self::F32 => "float",
            Self::F64 => "double",
            Self::Untyped8 => "unsigned char",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_uid_orders_by_both_fields() {
        let a = LocationId::new(1, 0);
        let b = LocationId::new(1, 1);
        let c = LocationId::new(2, 0);
        assert_ne!(a, b);
        assert_ne!(a.uid(), b.uid());
        assert!(a < b && b.id == c.id - 1);
    }

    #[test]
    fn input_type_wire_roundtrip() {
        for raw in 0..=11u8 {
            let ty = InputType::from_wire(raw).unwrap();
            assert_eq!(ty.to_wire(), raw);
            assert_eq!(ty.num_bits() % 8, 0);
        }
        assert!(InputType::from_wire(12).is_none());
    }

    #[test]
    fn termination_wire_roundtrip() {
        for raw in 0..=3u8 {
            let t = TargetTermination::from_wire(raw).unwrap();
            assert_eq!(t.to_wire(), raw);
        }
        assert!(TargetTermination::from_wire(4).is_none());
    }

    #[test]
    fn type_names_serialize_lowercase() {
        let json = serde_json::to_string(&InputType::U16).unwrap();
        assert_eq!(json, "\"u16\"");
    }
}

//! The I/O models both sides must agree on by name.
//!
//! The configuration record carries the model names as strings; the target
//! runtime refuses names it does not implement, and the engine validates
//! them up front so a typo fails the run before any execution.

use std::fmt;

/// How the target services reads once the replayed bytes run out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StdinModel {
    /// Replay the configured bytes, then serve 0x55 forever.
    ReplayBytesThenRepeat85,
    /// Replay the configured bytes, then serve zeros forever.
    ReplayBytesThenRepeatZero,
}

impl StdinModel {
    pub const ALL: [StdinModel; 2] = [
        StdinModel::ReplayBytesThenRepeat85,
        StdinModel::ReplayBytesThenRepeatZero,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "stdin_replay_bytes_then_repeat_85" => Some(Self::ReplayBytesThenRepeat85),
            "stdin_replay_bytes_then_repeat_zero" => Some(Self::ReplayBytesThenRepeatZero),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ReplayBytesThenRepeat85 => "stdin_replay_bytes_then_repeat_85",
            Self::ReplayBytesThenRepeatZero => "stdin_replay_bytes_then_repeat_zero",
        }
    }

    /// The byte served for reads past the replayed input.
    pub fn fill_byte(self) -> u8 {
        match self {
            Self::ReplayBytesThenRepeat85 => 0x55,
            Self::ReplayBytesThenRepeatZero => 0x00,
        }
    }
}

impl fmt::Display for StdinModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the target does with its stdout bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StdoutModel {
    /// Drop everything.
    Void,
}

impl StdoutModel {
    pub const ALL: [StdoutModel; 1] = [StdoutModel::Void];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "stdout_void" => Some(Self::Void),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Void => "stdout_void",
        }
    }
}

impl fmt::Display for StdoutModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

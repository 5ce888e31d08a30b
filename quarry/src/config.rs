use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

use quarry_wire::TargetConfig;

use crate::record::TestType;

const DEFAULT_CONFIG_PATH: &str = "/etc/quarry/quarry.toml";
const ENV_CONFIG_PATH: &str = "QUARRY_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub target: TargetSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub output: OutputSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `QUARRY_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }

    /// The configuration record handed to the target runtime.
    pub fn target_config(&self) -> TargetConfig {
        TargetConfig {
            max_trace_length: self.limits.max_trace_length,
            max_br_instr_trace_length: self.limits.max_br_instr_trace_length,
            max_stack_size: self.limits.max_stack_size,
            max_stdin_bytes: self.limits.max_stdin_bytes,
            stdin_model_name: self.target.stdin_model.clone(),
            stdout_model_name: self.target.stdout_model.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TargetSection {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_stdin_model")]
    pub stdin_model: String,
    #[serde(default = "default_stdout_model")]
    pub stdout_model: String,
}

impl Default for TargetSection {
    fn default() -> Self {
        Self {
            path: None,
            port: default_port(),
            stdin_model: default_stdin_model(),
            stdout_model: default_stdout_model(),
        }
    }
}

fn default_port() -> u16 {
    42085
}
fn default_stdin_model() -> String {
    "stdin_replay_bytes_then_repeat_85".to_string()
}
fn default_stdout_model() -> String {
    "stdout_void".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsSection {
    #[serde(default = "default_max_executions")]
    pub max_executions: u32,
    #[serde(default = "default_max_seconds")]
    pub max_seconds: u64,
    #[serde(default = "default_max_trace_length")]
    pub max_trace_length: u32,
    #[serde(default = "default_max_br_instr_trace_length")]
    pub max_br_instr_trace_length: u32,
    #[serde(default = "default_max_stack_size")]
    pub max_stack_size: u8,
    #[serde(default = "default_max_stdin_bytes")]
    pub max_stdin_bytes: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_executions: default_max_executions(),
            max_seconds: default_max_seconds(),
            max_trace_length: default_max_trace_length(),
            max_br_instr_trace_length: default_max_br_instr_trace_length(),
            max_stack_size: default_max_stack_size(),
            max_stdin_bytes: default_max_stdin_bytes(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_max_executions() -> u32 {
    u32::MAX
}
fn default_max_seconds() -> u64 {
    u64::MAX
}
fn default_max_trace_length() -> u32 {
    10_000
}
fn default_max_br_instr_trace_length() -> u32 {
    30_000
}
fn default_max_stack_size() -> u8 {
    25
}
fn default_max_stdin_bytes() -> u16 {
    // Standard page: 60 * 30 chars.
    1_800
}
fn default_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputSection {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_test_type")]
    pub test_type: TestType,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            test_type: default_test_type(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("quarry-tests")
}
fn default_test_type() -> TestType {
    TestType::Native
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingSection {
    /// NDJSON progress log; disabled when unset.
    #[serde(default)]
    pub progress_file: Option<PathBuf>,
    /// Text dump of the branching tree at run end; disabled when unset.
    #[serde(default)]
    pub tree_dump_file: Option<PathBuf>,
}

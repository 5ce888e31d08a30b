//! The seam to the instrumented target.
//!
//! The engine only consumes this contract: hand over a bit sequence, get
//! back the termination kind, the branching trace, and the typed bytes the
//! target actually consumed. The production implementation owns a shared
//! memory segment and a child process per run; tests plug in simulated
//! targets.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use memmap2::MmapMut;
use quarry_wire::{
    read_result, required_shared_memory_size, write_request, BrInstrCoverageInfo, DataRecordId,
    InputType, TargetConfig, TargetTermination,
};
use tokio::process::Command;

use crate::stdin_bits::{bits_to_bytes, Bits};
use crate::trace::ExecutionTrace;

/// One run of the target, as the engine sees it.
#[derive(Clone, Debug, Default)]
pub struct ExecutionResult {
    pub termination: Option<TargetTermination>,
    pub trace: ExecutionTrace,
    pub br_instr_trace: Vec<BrInstrCoverageInfo>,
    pub stdin_types: Vec<InputType>,
    pub stdin_bytes: Vec<u8>,
}

#[async_trait(?Send)]
pub trait TargetExecutor {
    async fn execute(&mut self, bits: &Bits) -> Result<ExecutionResult>;
}

/// Runs the target binary against a shared-memory segment.
///
/// The segment starts with a two-byte termination area, followed by the
/// framed request. The target loads the request, streams its result
/// records into the same area, and writes the termination header last, so
/// a present header means a complete payload.
pub struct SharedMemoryExecutor {
    target_config: TargetConfig,
    path_to_target: PathBuf,
    port: u16,
    timeout: Duration,
    shm_path: PathBuf,
    map: MmapMut,
    _file: std::fs::File,
}

impl SharedMemoryExecutor {
    pub fn new(
        target_config: TargetConfig,
        path_to_target: PathBuf,
        port: u16,
        timeout: Duration,
    ) -> Result<Self> {
        let shm_path =
            PathBuf::from(format!("/dev/shm/quarry-{}-{}", std::process::id(), port));
        let size = required_shared_memory_size(&target_config);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&shm_path)
            .with_context(|| format!("creating shared memory at {}", shm_path.display()))?;
        file.set_len(size as u64)
            .context("sizing shared memory segment")?;
        let map = unsafe { MmapMut::map_mut(&file) }.context("mapping shared memory segment")?;
        debug!(
            "shared memory segment {} mapped ({} bytes)",
            shm_path.display(),
            size
        );
        Ok(Self {
            target_config,
            path_to_target,
            port,
            timeout,
            shm_path,
            map,
            _file: file,
        })
    }

    fn write_request_into_segment(&mut self, stdin_bytes: &[u8]) {
        self.map[0] = DataRecordId::Invalid.to_wire();
        self.map[1] = 0;
        let mut cursor = &mut self.map[2..];
        write_request(&mut cursor, &self.target_config, stdin_bytes);
    }

    /// Recover whatever the child flushed. A written termination header
    /// means a complete payload; otherwise the records area is parsed as a
    /// prefix when it plausibly holds records rather than our own request.
    fn read_segment(&self, fallback: TargetTermination) -> ExecutionResult {
        let header = DataRecordId::from_wire(self.map[0]);
        if header == Some(DataRecordId::Termination) {
            if let Ok(payload) = read_result(&mut &self.map[..]) {
                return ExecutionResult {
                    termination: payload.termination,
                    trace: payload.trace,
                    br_instr_trace: payload.br_instr_trace,
                    stdin_types: payload.stdin_types,
                    stdin_bytes: payload.stdin_bytes,
                };
            }
        }
        let records = &self.map[2..];
        let prefix_is_records = matches!(
            DataRecordId::from_wire(records[0]),
            Some(DataRecordId::Condition)
                | Some(DataRecordId::BrInstr)
                | Some(DataRecordId::StdinBytes)
                | Some(DataRecordId::Invalid)
        );
        if prefix_is_records {
            let mut framed = Vec::with_capacity(2 + records.len());
            framed.push(DataRecordId::Termination.to_wire());
            framed.push(fallback.to_wire());
            framed.extend_from_slice(records);
            if let Ok(payload) = read_result(&mut framed.as_slice()) {
                return ExecutionResult {
                    termination: Some(fallback),
                    trace: payload.trace,
                    br_instr_trace: payload.br_instr_trace,
                    stdin_types: payload.stdin_types,
                    stdin_bytes: payload.stdin_bytes,
                };
            }
        }
        ExecutionResult {
            termination: Some(fallback),
            ..ExecutionResult::default()
        }
    }
}

#[async_trait(?Send)]
impl TargetExecutor for SharedMemoryExecutor {
    async fn execute(&mut self, bits: &Bits) -> Result<ExecutionResult> {
        let stdin_bytes = bits_to_bytes(bits);
        self.write_request_into_segment(&stdin_bytes);

        let mut child = Command::new(&self.path_to_target)
            .env("QUARRY_SHM", &self.shm_path)
            .env("QUARRY_PORT", self.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning target {}", self.path_to_target.display()))?;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status.context("waiting for target")?,
            Err(_) => {
                warn!(
                    "target exceeded {}ms, killing child",
                    self.timeout.as_millis()
                );
                child.kill().await.context("killing timed-out target")?;
                return Ok(self.read_segment(TargetTermination::Timeout));
            }
        };

        let result = self.read_segment(TargetTermination::Crash);
        if result.termination == Some(TargetTermination::Normal) && !status.success() {
            // The runtime flushed a normal header but the process still
            // died; trust the exit status.
            let mut result = result;
            result.termination = Some(TargetTermination::Crash);
            return Ok(result);
        }
        Ok(result)
    }
}

impl Drop for SharedMemoryExecutor {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.shm_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stdin_bits::bytes_to_bits;
    use quarry_wire::read_request;

    fn sample_config() -> TargetConfig {
        TargetConfig {
            max_trace_length: 100,
            max_br_instr_trace_length: 100,
            max_stack_size: 25,
            max_stdin_bytes: 64,
            stdin_model_name: "stdin_replay_bytes_then_repeat_85".to_string(),
            stdout_model_name: "stdout_void".to_string(),
        }
    }

    #[test]
    fn request_lands_in_the_segment_after_the_header() {
        let mut executor = SharedMemoryExecutor::new(
            sample_config(),
            PathBuf::from("/bin/true"),
            42085,
            Duration::from_millis(100),
        )
        .unwrap();
        executor.write_request_into_segment(&[1, 2, 3]);
        assert_eq!(executor.map[0], DataRecordId::Invalid.to_wire());
        let (config, stdin) = read_request(&mut &executor.map[2..]).unwrap();
        assert_eq!(config, sample_config());
        assert_eq!(stdin, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn timed_out_target_reports_timeout() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("hang.sh");
        {
            let mut f = std::fs::File::create(&script).unwrap();
            writeln!(f, "#!/bin/sh\nsleep 5").unwrap();
        }
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut executor = SharedMemoryExecutor::new(
            sample_config(),
            script,
            42086,
            Duration::from_millis(50),
        )
        .unwrap();
        // The script ignores the segment entirely, so the engine sees a
        // truncated run with no flushed records.
        let result = executor.execute(&bytes_to_bits(&[5u8])).await.unwrap();
        assert_eq!(result.termination, Some(TargetTermination::Timeout));
        assert!(result.trace.is_empty());
    }

    #[tokio::test]
    async fn silent_exit_counts_as_crash() {
        let mut executor = SharedMemoryExecutor::new(
            sample_config(),
            PathBuf::from("/bin/true"),
            42087,
            Duration::from_millis(1000),
        )
        .unwrap();
        let result = executor.execute(&bytes_to_bits(&[0u8])).await.unwrap();
        assert_eq!(result.termination, Some(TargetTermination::Crash));
        assert!(result.trace.is_empty());
    }

    #[test]
    fn flushed_payload_is_recovered_from_the_segment() {
        use quarry_wire::{write_result, BranchingCoverageInfo, LocationId, ResultPayload};

        let mut executor = SharedMemoryExecutor::new(
            sample_config(),
            PathBuf::from("/bin/true"),
            42089,
            Duration::from_millis(100),
        )
        .unwrap();
        let payload = ResultPayload {
            termination: Some(TargetTermination::Normal),
            trace: vec![BranchingCoverageInfo {
                id: LocationId::new(11, 0),
                direction: false,
                value: 3.5,
                idx_to_br_instr: 0,
            }],
            br_instr_trace: Vec::new(),
            stdin_types: vec![quarry_wire::InputType::U8],
            stdin_bytes: vec![0x2a],
        };
        let mut buf = Vec::new();
        write_result(&mut buf, &payload);
        executor.map[..buf.len()].copy_from_slice(&buf);

        let result = executor.read_segment(TargetTermination::Crash);
        assert_eq!(result.termination, Some(TargetTermination::Normal));
        assert_eq!(result.trace, payload.trace);
        assert_eq!(result.stdin_bytes, vec![0x2a]);
    }

    #[tokio::test]
    async fn missing_target_is_a_spawn_error() {
        let mut executor = SharedMemoryExecutor::new(
            sample_config(),
            PathBuf::from("/nonexistent/quarry-target"),
            42088,
            Duration::from_millis(100),
        )
        .unwrap();
        assert!(executor.execute(&Vec::new()).await.is_err());
    }
}

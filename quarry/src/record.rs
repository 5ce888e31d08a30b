//! Execution records and the test-suite writer.
//!
//! A record is the persistent artefact of one interesting execution: the
//! replayed bytes with their types, the path taken, and flag bits saying
//! why it was kept. The writer serialises records either as native JSON
//! files or as test-comp XML test cases under a `test-suite/` directory.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::info;
use quarry_wire::{InputType, TargetTermination};
use serde_json::json;

use crate::trace::ExecutionPath;

#[derive(Clone, Debug, Default)]
pub struct ExecutionRecord {
    pub flags: u8,
    pub stdin_bytes: Vec<u8>,
    pub stdin_types: Vec<InputType>,
    pub path: ExecutionPath,
}

impl ExecutionRecord {
    pub const BRANCH_DISCOVERED: u8 = 1 << 0;
    pub const BRANCH_COVERED: u8 = 1 << 1;
    pub const EXECUTION_CRASHES: u8 = 1 << 2;
    pub const BOUNDARY_CONDITION_VIOLATION: u8 = 1 << 3;

    pub fn termination_flags(termination: TargetTermination) -> u8 {
        match termination {
            TargetTermination::Normal => 0,
            TargetTermination::Crash => Self::EXECUTION_CRASHES,
            TargetTermination::Timeout | TargetTermination::BoundaryConditionViolation => {
                Self::BOUNDARY_CONDITION_VIOLATION
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    Native,
    Testcomp,
}

/// Per-writer counters reported in the run outcomes.
#[derive(Clone, Debug, Default)]
pub struct OutputStatistics {
    pub num_generated_tests: u32,
    pub num_crashes: u32,
    pub num_boundary_violations: u32,
}

pub struct ExecutionRecordWriter {
    test_type: TestType,
    output_dir: PathBuf,
    test_name_prefix: String,
    test_counter: u32,
    statistics: OutputStatistics,
}

impl ExecutionRecordWriter {
    pub fn new(
        output_dir: PathBuf,
        target_name: &str,
        program_version: &str,
        test_type: TestType,
    ) -> Result<Self> {
        let output_dir = match test_type {
            TestType::Native => output_dir,
            TestType::Testcomp => output_dir.join("test-suite"),
        };
        fs::create_dir_all(&output_dir)
            .with_context(|| format!("creating output directory {}", output_dir.display()))?;
        if test_type == TestType::Testcomp {
            let metadata = testcomp_metadata(program_version, target_name);
            fs::write(output_dir.join("metadata.xml"), metadata)
                .context("writing test-comp metadata")?;
        }
        info!("writing tests to {}", output_dir.display());
        Ok(Self {
            test_type,
            output_dir,
            test_name_prefix: format!("{target_name}_test_"),
            test_counter: 0,
            statistics: OutputStatistics::default(),
        })
    }

    pub fn statistics(&self) -> &OutputStatistics {
        &self.statistics
    }

    pub fn write(&mut self, record: &ExecutionRecord) -> Result<()> {
        self.test_counter += 1;
        let suffix = match self.test_type {
            TestType::Native => "json",
            TestType::Testcomp => "xml",
        };
        let path = self.output_dir.join(format!(
            "{}{}.{}",
            self.test_name_prefix, self.test_counter, suffix
        ));
        let mut file = fs::File::create(&path)
            .with_context(|| format!("creating test file {}", path.display()))?;
        match self.test_type {
            TestType::Native => save_native_test(&mut file, record)?,
            TestType::Testcomp => save_testcomp_test(&mut file, record)?,
        }
        self.statistics.num_generated_tests += 1;
        if record.flags & ExecutionRecord::EXECUTION_CRASHES != 0 {
            self.statistics.num_crashes += 1;
        }
        if record.flags & ExecutionRecord::BOUNDARY_CONDITION_VIOLATION != 0 {
            self.statistics.num_boundary_violations += 1;
        }
        Ok(())
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn save_native_test(out: &mut impl Write, record: &ExecutionRecord) -> Result<()> {
    let doc = json!({
        "flags": record.flags,
        "stdin_bytes": hex_string(&record.stdin_bytes),
        "stdin_types": record.stdin_types,
        "path": record
            .path
            .iter()
            .map(|(id, direction)| json!([id.id, id.context_hash, direction]))
            .collect::<Vec<_>>(),
    });
    serde_json::to_writer_pretty(&mut *out, &doc).context("serialising native test")?;
    Ok(())
}

/// One `<input>` element per consumed chunk, values decoded in the chunk's
/// own type.
pub fn save_testcomp_test(out: &mut impl Write, record: &ExecutionRecord) -> Result<()> {
    writeln!(out, "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"no\"?>")?;
    writeln!(
        out,
        "<!DOCTYPE testcase PUBLIC \"+//IDN sosy-lab.org//DTD test-format testcase \
         1.1//EN\" \"https://sosy-lab.org/test-format/testcase-1.1.dtd\">"
    )?;
    writeln!(out, "<testcase>")?;
    let mut offset = 0usize;
    for ty in &record.stdin_types {
        let width = ty.num_bytes() as usize;
        let chunk = &record.stdin_bytes[offset..offset + width];
        if ty.is_known() {
            writeln!(
                out,
                "  <input type=\"{}\">{}</input>",
                ty.c_type_string(),
                format_chunk_value(*ty, chunk)
            )?;
        } else {
            writeln!(out, "  <input>{}</input>", format_chunk_value(*ty, chunk))?;
        }
        offset += width;
    }
    write!(out, "</testcase>")?;
    Ok(())
}

fn format_chunk_value(ty: InputType, chunk: &[u8]) -> String {
    let mut raw = [0u8; 8];
    raw[..chunk.len()].copy_from_slice(chunk);
    let unsigned = u64::from_le_bytes(raw);
    match ty {
        InputType::F32 => format!("{}", f32::from_bits(unsigned as u32)),
        InputType::F64 => format!("{}", f64::from_bits(unsigned)),
        _ if ty.is_signed() => {
            let shift = 64 - ty.num_bits();
            format!("{}", ((unsigned << shift) as i64) >> shift)
        }
        _ => format!("{unsigned}"),
    }
}

fn testcomp_metadata(program_version: &str, program_file: &str) -> String {
    let creation = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    format!(
        "<?xml version='1.0' encoding='UTF-8' standalone='no'?>\n\
         <!DOCTYPE test-metadata PUBLIC \"+//IDN sosy-lab.org//DTD \
         test-format test-metadata 1.1//EN\" \
         \"https://sosy-lab.org/test-format/test-metadata-1.1.dtd\">\n\
         <test-metadata>\n\
         \x20 <sourcecodelang>C</sourcecodelang>\n\
         \x20 <producer>quarry {program_version}</producer>\n\
         \x20 <specification>COVER( init(main()), FQL(COVER EDGES(@DECISIONEDGE)) )</specification>\n\
         \x20 <programfile>{program_file}</programfile>\n\
         \x20 <programhash>null</programhash>\n\
         \x20 <entryfunction>main</entryfunction>\n\
         \x20 <architecture>32bit</architecture>\n\
         \x20 <creationtime>{creation}</creationtime>\n\
         </test-metadata>"
    )
}

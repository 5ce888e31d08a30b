//! NDJSON progress log of the run, one event per line.
//!
//! Intended for post-mortem inspection of long campaigns: which leaf was
//! attacked by which analysis, what every execution returned, when leaves
//! closed. Write failures disable the recorder with a single warning
//! instead of aborting the run.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;
use serde_json::json;

use quarry_wire::TargetTermination;

pub struct ProgressRecorder {
    out: Option<BufWriter<File>>,
    events: u64,
}

impl ProgressRecorder {
    pub fn to_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening progress log {}", path.display()))?;
        Ok(Self {
            out: Some(BufWriter::new(file)),
            events: 0,
        })
    }

    pub fn events_written(&self) -> u64 {
        self.events
    }

    fn emit(&mut self, event: serde_json::Value) {
        let out = match self.out.as_mut() {
            Some(out) => out,
            None => return,
        };
        let failed = writeln!(out, "{event}").is_err() || out.flush().is_err();
        if failed {
            warn!("progress log write failed, disabling recorder");
            self.out = None;
            return;
        }
        self.events += 1;
    }

    pub fn analysis_started(&mut self, analysis: &str, guid: u64, location: u32) {
        self.emit(json!({
            "event": "analysis_started",
            "analysis": analysis,
            "guid": guid,
            "location": location,
        }));
    }

    pub fn analysis_finished(&mut self, analysis: &str, guid: u64) {
        self.emit(json!({
            "event": "analysis_finished",
            "analysis": analysis,
            "guid": guid,
        }));
    }

    pub fn execution(
        &mut self,
        number: u64,
        termination: TargetTermination,
        trace_length: usize,
        discovered_guid: Option<u64>,
    ) {
        self.emit(json!({
            "event": "execution",
            "n": number,
            "termination": termination,
            "trace_length": trace_length,
            "discovered_guid": discovered_guid,
        }));
    }

    pub fn leaf_closed(&mut self, guid: u64) {
        self.emit(json!({ "event": "leaf_closed", "guid": guid }));
    }
}

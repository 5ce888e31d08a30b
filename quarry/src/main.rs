use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};

use quarry::config::Config;
use quarry::dump::dump_tree;
use quarry::executor::SharedMemoryExecutor;
use quarry::fuzzer::Fuzzer;
use quarry::outcomes::{TerminationInfo, TerminationType};
use quarry::progress::ProgressRecorder;
use quarry::record::{ExecutionRecordWriter, TestType};
use quarry_wire::{StdinModel, StdoutModel};

#[derive(Parser, Debug)]
#[command(name = "quarry")]
#[command(about = "Search-based coverage-driven fuzzer for instrumented targets")]
struct Args {
    /// Instrumented target binary to fuzz
    #[arg(long = "path_to_target", value_name = "PATH")]
    path_to_target: Option<PathBuf>,
    #[arg(long = "max_executions")]
    max_executions: Option<u32>,
    #[arg(long = "max_seconds")]
    max_seconds: Option<u64>,
    #[arg(long = "max_trace_length")]
    max_trace_length: Option<u32>,
    #[arg(long = "max_stdin_bytes")]
    max_stdin_bytes: Option<u16>,
    #[arg(long = "stdin_model")]
    stdin_model: Option<String>,
    #[arg(long = "stdout_model")]
    stdout_model: Option<String>,
    #[arg(long = "output_dir", value_name = "PATH")]
    output_dir: Option<PathBuf>,
    #[arg(long = "port")]
    port: Option<u16>,
    /// Test-suite format: native or testcomp
    #[arg(long = "test_type")]
    test_type: Option<String>,
}

fn merge(config: &mut Config, args: &Args) -> anyhow::Result<()> {
    if let Some(path) = &args.path_to_target {
        config.target.path = Some(path.clone());
    }
    if let Some(v) = args.max_executions {
        config.limits.max_executions = v;
    }
    if let Some(v) = args.max_seconds {
        config.limits.max_seconds = v;
    }
    if let Some(v) = args.max_trace_length {
        config.limits.max_trace_length = v;
    }
    if let Some(v) = args.max_stdin_bytes {
        config.limits.max_stdin_bytes = v;
    }
    if let Some(v) = &args.stdin_model {
        config.target.stdin_model = v.clone();
    }
    if let Some(v) = &args.stdout_model {
        config.target.stdout_model = v.clone();
    }
    if let Some(v) = &args.output_dir {
        config.output.dir = v.clone();
    }
    if let Some(v) = args.port {
        config.target.port = v;
    }
    if let Some(v) = &args.test_type {
        config.output.test_type = match v.as_str() {
            "native" => TestType::Native,
            "testcomp" => TestType::Testcomp,
            other => anyhow::bail!("unknown test type {other:?} (expected native or testcomp)"),
        };
    }
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<TerminationType> {
    let path_to_target = config
        .target
        .path
        .clone()
        .context("no target given; pass --path_to_target")?;
    let target_name = path_to_target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "target".to_string());

    StdinModel::from_name(&config.target.stdin_model)
        .with_context(|| format!("unknown stdin model {:?}", config.target.stdin_model))?;
    StdoutModel::from_name(&config.target.stdout_model)
        .with_context(|| format!("unknown stdout model {:?}", config.target.stdout_model))?;

    let writer = ExecutionRecordWriter::new(
        config.output.dir.clone(),
        &target_name,
        env!("CARGO_PKG_VERSION"),
        config.output.test_type,
    )?;
    let executor = SharedMemoryExecutor::new(
        config.target_config(),
        path_to_target,
        config.target.port,
        Duration::from_millis(config.limits.timeout_ms),
    )?;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || {
            cancel.store(true, Ordering::Relaxed);
        })
        .context("installing signal handler")?;
    }

    let termination = TerminationInfo {
        max_executions: config.limits.max_executions,
        max_seconds: config.limits.max_seconds,
    };
    let mut fuzzer = Fuzzer::new(executor, termination, Some(writer), cancel);
    if let Some(path) = &config.logging.progress_file {
        fuzzer.set_progress_recorder(ProgressRecorder::to_file(path)?);
    }
    let outcomes = fuzzer.run().await;

    if let Some(path) = &config.logging.tree_dump_file {
        let mut out = std::fs::File::create(path)
            .with_context(|| format!("creating tree dump {}", path.display()))?;
        dump_tree(fuzzer.tree(), &mut out).context("writing tree dump")?;
    }

    if outcomes.termination_type != TerminationType::Normal {
        warn!(
            "run aborted: {:?}: {}",
            outcomes.termination_type, outcomes.error_message
        );
    }
    info!(
        "executions={} elapsed={:.1}s covered={} uncovered={} tests={}",
        outcomes.num_executions,
        outcomes.num_elapsed_seconds,
        outcomes.covered_branchings.len(),
        outcomes.uncovered_branchings.len(),
        outcomes
            .output_statistics
            .values()
            .map(|s| s.num_generated_tests)
            .sum::<u32>(),
    );
    Ok(outcomes.termination_type)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    let mut config = Config::load();
    if let Err(err) = merge(&mut config, &args) {
        eprintln!("quarry: {err:#}");
        return ExitCode::from(2);
    }
    match run(config).await {
        Ok(TerminationType::Normal) => ExitCode::SUCCESS,
        Ok(TerminationType::ServerInternalError) => ExitCode::from(1),
        Ok(TerminationType::ClientCommunicationError) => ExitCode::from(2),
        Err(err) => {
            eprintln!("quarry: {err:#}");
            ExitCode::from(1)
        }
    }
}

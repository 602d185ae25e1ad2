use probefuzz_core::config::ProbeFuzzConfig;
use probefuzz_core::crash::DmesgSnapshot;
use probefuzz_core::fuzzer::{Fuzzer, SessionEnd};
use probefuzz_core::{GdbRemoteProbe, NvmeCliChannel};

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

const STATS_FILE: &str = "session_stats.json";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(short = 'n', long)]
    max_executions: Option<u64>,
    #[clap(long)]
    max_duration_secs: Option<u64>,
    #[clap(short, long)]
    output_dir: Option<PathBuf>,
    #[clap(long)]
    seed_dir: Option<PathBuf>,
    #[clap(long)]
    resume_coverage: Option<PathBuf>,
    #[clap(long)]
    rng_seed: Option<u64>,
    /// Fuzz every known command, including destructive ones.
    #[clap(long)]
    all_commands: bool,
}

fn load_config(cli: &Cli) -> Result<ProbeFuzzConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            ProbeFuzzConfig::load_from_file(path)?
        }
        None => {
            let default_path = PathBuf::from("probefuzz.toml");
            if default_path.exists() {
                info!("No config file specified, loading {:?}", default_path);
                ProbeFuzzConfig::load_from_file(&default_path)?
            } else {
                info!("No config file specified and {:?} not found, using built-in defaults", default_path);
                ProbeFuzzConfig::default()
            }
        }
    };

    if let Some(n) = cli.max_executions {
        config.fuzzer.max_executions = Some(n);
    }
    if let Some(secs) = cli.max_duration_secs {
        config.fuzzer.max_duration_secs = secs;
    }
    if let Some(dir) = &cli.output_dir {
        config.fuzzer.output_dir = dir.clone();
    }
    if let Some(dir) = &cli.seed_dir {
        config.fuzzer.seed_dir = Some(dir.clone());
    }
    if let Some(dir) = &cli.resume_coverage {
        config.fuzzer.resume_coverage = Some(dir.clone());
    }
    if cli.rng_seed.is_some() {
        config.fuzzer.rng_seed = cli.rng_seed;
    }
    if cli.all_commands {
        config.fuzzer.all_commands = true;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<ExitCode, anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    log::debug!("Effective configuration: {config:#?}");

    let probe = GdbRemoteProbe::connect(
        &config.probe.address,
        config.probe.pc_register,
        Duration::from_millis(config.probe.io_timeout_ms),
    )
    .with_context(|| format!("cannot reach the GDB server at {}", config.probe.address))?;
    let channel = NvmeCliChannel::new(config.channel.clone());
    let output_dir = config.fuzzer.output_dir.clone();

    let mut fuzzer = Fuzzer::new(config, probe, channel, Box::new(DmesgSnapshot::default()))?;
    let report = fuzzer.run()?;

    let stats_path = output_dir.join(STATS_FILE);
    match serde_json::to_vec_pretty(&report.stats) {
        Ok(bytes) => {
            if let Err(e) = std::fs::write(&stats_path, bytes) {
                warn!("Failed to write {:?}: {}", stats_path, e);
            }
        }
        Err(e) => warn!("Failed to encode session statistics: {}", e),
    }

    match report.end {
        SessionEnd::Completed => {
            info!("Session completed");
            Ok(ExitCode::SUCCESS)
        }
        SessionEnd::TargetHung(artifact) => {
            error!(
                "Target hung on {} ({}). It was not reset; inspect it over the debug probe before power-cycling.",
                artifact.encoded.label, artifact.reason
            );
            Ok(ExitCode::from(2))
        }
    }
}

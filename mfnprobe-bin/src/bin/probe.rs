use std::{
    fs::File,
    io::{BufWriter, Write},
    time::{Duration, Instant},
};

use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use mfnprobe_bin::{ProbeResult, init_logging_with_progress, run_probe};
use mfnprobe_core::exchange::{ExchangePolicy, ExchangeVerdict};
use mfnprobe_core::util::{AbortFlag, abort_after};
use mfnprobe_core::{SearchConfig, SearchState};
use mfnprobe_sim::SimConfig;
use serde::Serialize;

fn parse_policy(s: &str) -> Result<ExchangePolicy, String> {
    match s {
        "defective" => Ok(ExchangePolicy::Defective),
        "guarded" => Ok(ExchangePolicy::Guarded),
        _ => Err(format!("unknown policy {:?}, expected defective or guarded", s)),
    }
}

/// CLI arguments for the `probe` binary.
///
/// Values given on the command line override the JSON config files.
#[derive(Debug, Parser, Serialize, Clone)]
struct CliArgs {
    /// Search config file (JSON).
    #[clap(long = "config")]
    config: Option<String>,
    /// Simulated guest config file (JSON).
    #[clap(long = "sim-config")]
    sim_config: Option<String>,
    /// Number of pages that must be machine contiguous.
    #[clap(long = "prefix-pages")]
    prefix_pages: Option<usize>,
    /// Maximum number of allocation attempts per repetition.
    #[clap(long = "attempts")]
    attempts: Option<u64>,
    /// Exchange policy: `defective` exchanges the whole block, `guarded` only verified blocks.
    #[clap(long = "policy", value_parser = parse_policy)]
    policy: Option<ExchangePolicy>,
    /// Seed of the simulated guest. Repetition `n` uses `seed + n`.
    #[clap(long = "seed")]
    seed: Option<u64>,
    /// Number of guest page frames.
    #[clap(long = "guest-frames")]
    guest_frames: Option<usize>,
    /// Number of machine frames.
    #[clap(long = "machine-frames")]
    machine_frames: Option<usize>,
    /// Probability that a guest frame starts a new machine run.
    #[clap(long = "fragmentation")]
    fragmentation: Option<f64>,
    /// Share of free machine frames owned by other tenants.
    #[clap(long = "foreign-fraction")]
    foreign_fraction: Option<f64>,
    /// Probability that an allocation fails.
    #[clap(long = "failure-rate")]
    failure_rate: Option<f64>,
    /// Repeat the search this many times, each on a fresh guest.
    #[clap(long = "repeat", default_value = "1")]
    repeat: usize,
    /// The timeout in seconds for all repetitions.
    #[clap(long = "timeout")]
    timeout: Option<u64>,
    /// Output file for results (JSON format).
    #[clap(long = "output")]
    output: Option<String>,
    /// Include all diagnostic records in the results.
    #[clap(long = "records")]
    records: bool,
}

impl CliArgs {
    fn search_config(&self) -> Result<SearchConfig> {
        let mut config = match &self.config {
            Some(path) => SearchConfig::from_jsonfile(path)?,
            None => SearchConfig::default(),
        };
        if let Some(prefix_pages) = self.prefix_pages {
            config.prefix_pages = prefix_pages;
        }
        if let Some(attempts) = self.attempts {
            config.max_attempts = attempts;
        }
        if let Some(policy) = self.policy {
            config.policy = policy;
        }
        config.validate()?;
        Ok(config)
    }

    fn sim_config(&self) -> Result<SimConfig> {
        let mut config = match &self.sim_config {
            Some(path) => SimConfig::from_jsonfile(path)?,
            None => SimConfig::default(),
        };
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(guest_frames) = self.guest_frames {
            config.guest_frames = guest_frames;
        }
        if let Some(machine_frames) = self.machine_frames {
            config.machine_frames = machine_frames;
        }
        if let Some(fragmentation) = self.fragmentation {
            config.fragmentation = fragmentation;
        }
        if let Some(foreign_fraction) = self.foreign_fraction {
            config.foreign_fraction = foreign_fraction;
        }
        if let Some(failure_rate) = self.failure_rate {
            config.allocation_failure_rate = failure_rate;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Serialize)]
struct ProbeResults {
    args: CliArgs,
    search_config: SearchConfig,
    results: Vec<ProbeResult>,
}

impl ProbeResults {
    fn save_to_file(&self, filename: &str) -> Result<()> {
        let file = File::create(filename)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        info!("Results saved to {}", filename);
        Ok(())
    }
}

fn main() -> Result<()> {
    let progress = init_logging_with_progress()?;

    let args = CliArgs::parse();
    info!("CLI args: {:?}", args);
    let search_config = args.search_config()?;
    let sim_config = args.sim_config()?;

    let abort = AbortFlag::new();
    if let Some(timeout) = args.timeout {
        let _watchdog = abort_after(&abort, Duration::from_secs(timeout));
    }
    let start_time = Instant::now();

    let mut results = ProbeResults {
        args: args.clone(),
        search_config: search_config.clone(),
        results: vec![],
    };
    for rep in 0..args.repeat {
        if abort.is_aborted() {
            warn!("Timeout reached after {} repetitions", rep);
            break;
        }
        info!("Starting repetition {}/{}", rep + 1, args.repeat);
        let sim_config = SimConfig {
            seed: sim_config.seed.wrapping_add(rep as u64),
            ..sim_config.clone()
        };
        match run_probe(
            rep,
            search_config.clone(),
            sim_config,
            abort.clone(),
            Some(progress.clone()),
            args.records,
        ) {
            Ok(result) => results.results.push(result),
            Err(e) => warn!("Repetition {} failed: {:?}", rep, e),
        }
    }

    if let Some(output_file) = &args.output {
        results.save_to_file(output_file)?;
    }

    let found = results
        .results
        .iter()
        .filter(|r| r.report.state == SearchState::Found)
        .count();
    let anomalies = results
        .results
        .iter()
        .filter_map(|r| r.report.found.as_ref())
        .filter(|f| f.outcome.verdict == ExchangeVerdict::NotRelocated)
        .count();
    let corrupted: u64 = results
        .results
        .iter()
        .map(|r| r.sim_stats.corrupted_frames)
        .sum();
    info!("=== PROBE SUMMARY ===");
    info!("Repetitions: {}", results.results.len());
    info!("Candidates found: {}", found);
    info!("Candidate exchanges not relocated: {}", anomalies);
    info!("Corrupted machine frames: {}", corrupted);
    info!(
        "Total probe time: {:.2}s",
        start_time.elapsed().as_secs_f64()
    );

    Ok(())
}

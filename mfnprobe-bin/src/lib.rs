//! # mfnprobe driver
//!
//! Runs the region exchange search against a simulated guest and collects
//! timestamped results.
//!
//! ```sh
//! cargo run --release --bin=probe -- --attempts 1000 --fragmentation 0.3
//! ```
//!
//! Use `probe --help` to see available options. Log output is controlled via
//! `RUST_LOG` and defaults to `info`; `RUST_LOG=trace` shows every attempt.

use std::cell::RefCell;
use std::rc::Rc;

use indicatif::MultiProgress;
use indicatif_log_bridge::LogWrapper;
use log::info;
use mfnprobe_core::diagnostic::{DiagnosticRecord, LogSink, Tee};
use mfnprobe_core::util::AbortFlag;
use mfnprobe_core::{Search, SearchConfig, SearchReport};
use mfnprobe_sim::{SimConfig, SimGuest, SimStats};
use serde::Serialize;

pub fn init_logging_with_progress() -> anyhow::Result<MultiProgress> {
    let logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
    let progress = MultiProgress::new();
    LogWrapper::new(progress.clone(), logger).try_init()?;
    Ok(progress)
}

/// Result of one search against a fresh simulated guest.
#[derive(Debug, Serialize)]
pub struct ProbeResult {
    pub date: String,
    pub repetition: usize,
    pub sim_config: SimConfig,
    pub report: SearchReport,
    pub sim_stats: SimStats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<DiagnosticRecord>,
}

/// Runs one search against a new guest built from `sim_config`.
///
/// With `collect_records`, every diagnostic record is kept in the result in
/// addition to being logged.
pub fn run_probe(
    repetition: usize,
    search_config: SearchConfig,
    sim_config: SimConfig,
    abort: AbortFlag,
    progress: Option<MultiProgress>,
    collect_records: bool,
) -> anyhow::Result<ProbeResult> {
    let guest = SimGuest::new(sim_config.clone())?;
    let mut builder = Search::builder()
        .allocator(guest.clone())
        .translator(guest.clone())
        .exchanger(guest.clone())
        .abort_flag(abort)
        .config(search_config);
    if let Some(progress) = progress {
        builder = builder.progress(progress);
    }
    let records = Rc::new(RefCell::new(Vec::<DiagnosticRecord>::new()));
    if collect_records {
        builder = builder.sink(Tee(LogSink, records.clone()));
    }
    let report = builder.build()?.run();
    let sim_stats = guest.stats();
    info!(
        "Repetition {}: {:?} after {} attempts, {} exchanges rejected, {} frames corrupted",
        repetition,
        report.state,
        report.stats.attempts,
        sim_stats.rejected_exchanges,
        sim_stats.corrupted_frames
    );
    Ok(ProbeResult {
        date: chrono::Local::now().to_rfc3339(),
        repetition,
        sim_config,
        report,
        sim_stats,
        records: records.take(),
    })
}

//! The allocation search loop.
//!
//! [`Search`] repeatedly allocates blocks of `2^order` pages and classifies each
//! block twice: over the first `prefix_pages` pages and over the full block.
//! A block whose prefix is machine contiguous while the full block is not is a
//! defect candidate. Trusting the prefix for the full block is exactly the
//! mistake the harness reproduces, so the candidate is exchanged with the full
//! order and the outcome is verified.
//!
//! ```text
//!              allocate + classify
//!            ┌─────────────────────┐
//!            ▼                     │ fully contiguous (exchange) / fragmented /
//!       ┌──────────┐               │ allocation failure
//!       │Searching │───────────────┘
//!       └──────────┘
//!        │   │   └── abort flag raised ──────────▶ Aborted
//!        │   └────── attempt budget spent ───────▶ Exhausted
//!        └────────── prefix-only contiguous ─────▶ Found
//! ```

use std::ops::Range;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::allocator::PageAllocator;
use crate::config::{self, SearchConfig};
use crate::diagnostic::{DiagnosticRecord, DiagnosticSink, LogSink};
use crate::exchange::{ExchangeOutcome, ExchangeVerifier, RegionExchange};
use crate::memory::{
    ContiguityResult, FrameMapping, FrameTranslator, MachineAddr, Mfn, PAGE_SIZE, PageBlock,
    PhysAddr, check_range_contiguous, frame_table, machine_runs, phys_to_machine,
};
use crate::util::{AbortFlag, NamedProgress};

/// State of a search.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchState {
    /// Still looking for a candidate
    Searching,
    /// A candidate was found and exchanged
    Found,
    /// The attempt budget was spent without a candidate
    Exhausted,
    /// The abort flag was raised
    Aborted,
}

impl SearchState {
    /// Whether the search has ended.
    pub fn is_terminal(&self) -> bool {
        *self != SearchState::Searching
    }
}

/// Classification of an allocated block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    /// The full block is machine contiguous
    FullyContiguous,
    /// Only the prefix is machine contiguous
    PrefixOnly,
    /// Not even the prefix is machine contiguous
    Fragmented,
}

impl SampleKind {
    /// Classifies a block from its prefix and full contiguity checks.
    pub fn classify(prefix: ContiguityResult, full: ContiguityResult) -> Self {
        match (prefix.contiguous, full.contiguous) {
            (_, true) => SampleKind::FullyContiguous,
            (true, false) => SampleKind::PrefixOnly,
            (false, false) => SampleKind::Fragmented,
        }
    }
}

/// Counters of a single search.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SearchStats {
    /// Allocation attempts, including failed ones
    pub attempts: u64,
    /// Attempts where the allocator failed
    pub allocation_failures: u64,
    /// Blocks that were not even prefix contiguous
    pub non_matching: u64,
    /// Fully contiguous blocks that were exchanged
    pub contiguous_exchanges: u64,
    /// Exchanges of fully contiguous blocks that did not relocate memory
    pub contiguous_anomalies: u64,
}

/// The block that ended a search in [`SearchState::Found`].
#[derive(Clone, Debug, Serialize)]
pub struct FoundSample {
    /// Zero-based attempt index
    pub attempt: u64,
    /// Virtual base address
    pub virt: usize,
    /// Physical base address
    pub phys: PhysAddr,
    /// Machine base address
    pub machine: MachineAddr,
    /// Prefix contiguity check
    pub prefix: ContiguityResult,
    /// Full block contiguity check
    pub full: ContiguityResult,
    /// Frame table taken before the exchange
    pub frames: Vec<FrameMapping>,
    /// Machine-contiguous runs of the block before the exchange
    pub runs: Vec<Range<Mfn>>,
    /// Exchange verification
    pub outcome: ExchangeOutcome,
}

/// Summary of a finished search.
#[derive(Clone, Debug, Serialize)]
pub struct SearchReport {
    /// Final state
    pub state: SearchState,
    /// Configuration the search ran with
    pub config: SearchConfig,
    /// Counters
    pub stats: SearchStats,
    /// The candidate, if one was found
    pub found: Option<FoundSample>,
}

/// Uninhabited allocator error of a [`SearchBuilder`] without allocator.
#[derive(Debug, Error)]
pub enum NoAllocator {}

/// Search for blocks exposing the prefix contiguity defect.
///
/// All state of one search (counters, current state, the found sample) lives in
/// this value. Use [`Search::builder()`] to construct it.
///
/// # Type Parameters
///
/// * `AE` - Allocator error type
pub struct Search<AE: std::error::Error> {
    allocator: Box<dyn PageAllocator<Error = AE>>,
    translator: Box<dyn FrameTranslator>,
    exchanger: Box<dyn RegionExchange>,
    sink: Box<dyn DiagnosticSink>,
    verifier: ExchangeVerifier,
    abort: AbortFlag,
    progress: Option<ProgressBar>,
    config: SearchConfig,
    state: SearchState,
    stats: SearchStats,
    found: Option<FoundSample>,
}

impl Search<NoAllocator> {
    /// Creates a new search builder.
    pub fn builder() -> SearchBuilder<NoAllocator> {
        SearchBuilder::default()
    }
}

impl<AE: std::error::Error> Search<AE> {
    /// Current state.
    pub fn state(&self) -> SearchState {
        self.state
    }

    /// Counters so far.
    pub fn stats(&self) -> &SearchStats {
        &self.stats
    }

    /// Configuration.
    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Runs a single attempt and returns the resulting state.
    ///
    /// Does nothing once the search is in a terminal state. The abort flag is
    /// checked before allocating, so a raised flag stops the search without
    /// touching the allocator again.
    pub fn step(&mut self) -> SearchState {
        if self.state.is_terminal() {
            return self.state;
        }
        if self.abort.is_aborted() {
            info!("Abort requested. Stopping.");
            return self.finish(SearchState::Aborted);
        }
        if self.stats.attempts >= self.config.max_attempts {
            return self.finish(SearchState::Exhausted);
        }

        let attempt = self.stats.attempts;
        self.stats.attempts += 1;
        if let Some(progress) = &self.progress {
            progress.inc(1);
        }

        let order = self.config.order();
        let kind = match self.allocator.allocate(order) {
            Ok(block) => Some(self.sample(attempt, block)),
            Err(e) => {
                self.stats.allocation_failures += 1;
                self.sink.record(DiagnosticRecord::AllocationFailed {
                    attempt,
                    order,
                    error: e.to_string(),
                });
                None
            }
        };

        if kind == Some(SampleKind::PrefixOnly) {
            return self.finish(SearchState::Found);
        }
        if self.stats.attempts >= self.config.max_attempts {
            return self.finish(SearchState::Exhausted);
        }
        self.state
    }

    /// Steps until the search ends and returns its report.
    pub fn run(mut self) -> SearchReport {
        info!(
            "Searching for blocks with {} of {} pages machine contiguous ({} attempts max)",
            self.config.prefix_pages,
            self.config.full_pages(),
            self.config.max_attempts
        );
        while !self.step().is_terminal() {}
        self.into_report()
    }

    /// Consumes the search and returns its report.
    pub fn into_report(self) -> SearchReport {
        SearchReport {
            state: self.state,
            config: self.config,
            stats: self.stats,
            found: self.found,
        }
    }

    /// Classifies an allocated block, handles it and releases it.
    ///
    /// This is the only place a block is released, after both checks and any
    /// exchange are done.
    fn sample(&mut self, attempt: u64, block: PageBlock) -> SampleKind {
        let prefix_pages = self.config.prefix_pages;
        let full_pages = self.config.full_pages();
        debug_assert_eq!(block.page_count(), full_pages);

        let translator = self.translator.as_ref();
        let full = check_range_contiguous(translator, block.pfn(), 0, full_pages * PAGE_SIZE);
        let prefix = check_range_contiguous(translator, block.pfn(), 0, prefix_pages * PAGE_SIZE);
        self.sink.record(DiagnosticRecord::Attempt {
            attempt,
            pfn: block.pfn(),
            prefix_contiguous: prefix.contiguous,
            full_contiguous: full.contiguous,
        });

        let kind = SampleKind::classify(prefix, full);
        match kind {
            SampleKind::FullyContiguous => {
                let outcome = self
                    .verifier
                    .verify_exchange(self.exchanger.as_mut(), &block, full_pages);
                self.stats.contiguous_exchanges += 1;
                if outcome.is_anomaly() {
                    self.stats.contiguous_anomalies += 1;
                }
                self.sink.record(DiagnosticRecord::Exchange {
                    attempt,
                    candidate: false,
                    outcome,
                });
            }
            SampleKind::PrefixOnly => {
                let found = self.exchange_candidate(attempt, &block, prefix, full);
                self.found = Some(found);
            }
            SampleKind::Fragmented => {
                self.stats.non_matching += 1;
                debug!("({}) {:?} is not machine contiguous, retrying", attempt, block);
            }
        }
        self.allocator.release(block);
        kind
    }

    fn exchange_candidate(
        &mut self,
        attempt: u64,
        block: &PageBlock,
        prefix: ContiguityResult,
        full: ContiguityResult,
    ) -> FoundSample {
        let prefix_pages = self.config.prefix_pages;
        let full_pages = self.config.full_pages();
        let frames = frame_table(self.translator.as_ref(), block.pfn(), full_pages);
        let runs = machine_runs(self.translator.as_ref(), block.pfn(), full_pages);
        let phys = block.phys_addr();
        let machine = phys_to_machine(self.translator.as_ref(), phys);
        self.sink.record(DiagnosticRecord::Candidate {
            attempt,
            prefix_pages,
            full_pages,
            virt: block.ptr() as usize,
            phys,
            machine,
            frames: frames.clone(),
            runs: runs.clone(),
        });

        let outcome = self
            .verifier
            .verify_exchange(self.exchanger.as_mut(), block, prefix_pages);
        if outcome.exceeds_verified() && outcome.observed.is_some() {
            warn!(
                "({}) exchanged {} pages of which only {} were verified machine contiguous",
                attempt, outcome.requested_pages, outcome.verified_pages
            );
        }
        self.sink.record(DiagnosticRecord::Exchange {
            attempt,
            candidate: true,
            outcome,
        });

        FoundSample {
            attempt,
            virt: block.ptr() as usize,
            phys,
            machine,
            prefix,
            full,
            frames,
            runs,
            outcome,
        }
    }

    fn finish(&mut self, state: SearchState) -> SearchState {
        self.state = state;
        if let Some(progress) = self.progress.take() {
            progress.finish_with_message(format!("{:?}", state));
        }
        self.sink.record(DiagnosticRecord::Finished {
            state,
            attempts: self.stats.attempts,
        });
        state
    }
}

/// Builder for [`Search`].
pub struct SearchBuilder<AE: std::error::Error> {
    allocator: Option<Box<dyn PageAllocator<Error = AE>>>,
    translator: Option<Box<dyn FrameTranslator>>,
    exchanger: Option<Box<dyn RegionExchange>>,
    sink: Option<Box<dyn DiagnosticSink>>,
    abort: AbortFlag,
    progress: Option<MultiProgress>,
    config: SearchConfig,
}

impl Default for SearchBuilder<NoAllocator> {
    fn default() -> Self {
        SearchBuilder {
            allocator: None,
            translator: None,
            exchanger: None,
            sink: None,
            abort: AbortFlag::new(),
            progress: None,
            config: SearchConfig::default(),
        }
    }
}

impl<AE: std::error::Error> SearchBuilder<AE> {
    /// Sets the page allocator.
    pub fn allocator<A: PageAllocator + 'static>(self, allocator: A) -> SearchBuilder<A::Error> {
        SearchBuilder {
            allocator: Some(Box::new(allocator)),
            translator: self.translator,
            exchanger: self.exchanger,
            sink: self.sink,
            abort: self.abort,
            progress: self.progress,
            config: self.config,
        }
    }

    /// Sets the physical-to-machine translator.
    pub fn translator(mut self, translator: impl FrameTranslator + 'static) -> Self {
        self.translator = Some(Box::new(translator));
        self
    }

    /// Sets the region exchange service.
    pub fn exchanger(mut self, exchanger: impl RegionExchange + 'static) -> Self {
        self.exchanger = Some(Box::new(exchanger));
        self
    }

    /// Sets the diagnostic sink. Defaults to [`LogSink`].
    pub fn sink(mut self, sink: impl DiagnosticSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Sets the abort flag checked once per attempt.
    pub fn abort_flag(mut self, abort: AbortFlag) -> Self {
        self.abort = abort;
        self
    }

    /// Shows a progress bar over the attempt budget.
    pub fn progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Sets the configuration.
    pub fn config(mut self, config: SearchConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the search.
    ///
    /// # Errors
    ///
    /// Returns an error if a collaborator is missing or the config is invalid.
    pub fn build(self) -> Result<Search<AE>, Error> {
        self.config.validate()?;
        if self.config.prefix_pages.is_power_of_two() {
            warn!(
                "prefix_pages = {} is a power of two: the prefix covers the whole block and no candidate can be found",
                self.config.prefix_pages
            );
        }
        let progress = self.progress.map(|p| {
            let progress = p.add(ProgressBar::new(self.config.max_attempts));
            progress.set_style(ProgressStyle::named_bar("Search attempts"));
            progress
        });
        Ok(Search {
            allocator: self.allocator.ok_or(Error::Allocator)?,
            translator: self.translator.ok_or(Error::Translator)?,
            exchanger: self.exchanger.ok_or(Error::Exchanger)?,
            sink: self.sink.unwrap_or_else(|| Box::new(LogSink)),
            verifier: ExchangeVerifier::new(self.config.sentinel, self.config.policy),
            abort: self.abort,
            progress,
            config: self.config,
            state: SearchState::Searching,
            stats: SearchStats::default(),
            found: None,
        })
    }
}

/// Errors that can occur when building a [`Search`].
#[derive(Debug, Error)]
pub enum Error {
    /// No allocator was set
    #[error("No allocator specified")]
    Allocator,
    /// No translator was set
    #[error("No translator specified")]
    Translator,
    /// No exchanger was set
    #[error("No exchanger specified")]
    Exchanger,
    /// The configuration is invalid
    #[error(transparent)]
    InvalidConfig(#[from] config::Error),
}

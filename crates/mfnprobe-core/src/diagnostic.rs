//! Diagnostic records emitted by the search.
//!
//! The harness reports what it observes instead of failing. Every observation
//! becomes a [`DiagnosticRecord`] handed to a [`DiagnosticSink`]. The default
//! sink, [`LogSink`], forwards records to the `log` facade.

use std::cell::RefCell;
use std::ops::Range;
use std::rc::Rc;

use log::{debug, info, trace, warn};
use serde::Serialize;

use crate::exchange::ExchangeOutcome;
use crate::memory::{FormatFrames, FrameMapping, MachineAddr, Mfn, PhysAddr, Pfn};
use crate::search::SearchState;
use crate::util::Order;

/// A structured observation made during a search.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticRecord {
    /// Both contiguity checks of one attempt completed
    Attempt {
        /// Zero-based attempt index
        attempt: u64,
        /// First frame of the allocated block
        pfn: Pfn,
        /// Whether the prefix is machine contiguous
        prefix_contiguous: bool,
        /// Whether the full block is machine contiguous
        full_contiguous: bool,
    },
    /// The allocator could not satisfy a request
    AllocationFailed {
        /// Zero-based attempt index
        attempt: u64,
        /// Requested order
        order: Order,
        /// Allocator error message
        error: String,
    },
    /// A block whose prefix is machine contiguous while the full block is not
    Candidate {
        /// Zero-based attempt index
        attempt: u64,
        /// Pages verified contiguous
        prefix_pages: usize,
        /// Pages in the block
        full_pages: usize,
        /// Virtual base address
        virt: usize,
        /// Physical base address
        phys: PhysAddr,
        /// Machine base address
        machine: MachineAddr,
        /// Per-page frame table of the full block
        frames: Vec<FrameMapping>,
        /// Machine-contiguous runs of the full block
        runs: Vec<Range<Mfn>>,
    },
    /// A verified exchange
    Exchange {
        /// Zero-based attempt index
        attempt: u64,
        /// Whether the exchanged block was a defect candidate
        candidate: bool,
        /// Verifier outcome
        outcome: ExchangeOutcome,
    },
    /// The search reached a terminal state
    Finished {
        /// Terminal state
        state: SearchState,
        /// Number of attempts made
        attempts: u64,
    },
}

/// Trait for consumers of [`DiagnosticRecord`]s.
pub trait DiagnosticSink {
    /// Consumes one record.
    fn record(&mut self, record: DiagnosticRecord);
}

/// Sink writing records to the `log` facade.
///
/// Routine records go to `trace`/`debug`, candidates and the final state to
/// `info`, exchange anomalies and allocation failures to `warn`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn record(&mut self, record: DiagnosticRecord) {
        match record {
            DiagnosticRecord::Attempt {
                attempt,
                pfn,
                prefix_contiguous,
                full_contiguous,
            } => trace!(
                "({}) pfn = 0x{:x}: prefix contiguous = {}, full contiguous = {}",
                attempt, pfn, prefix_contiguous, full_contiguous
            ),
            DiagnosticRecord::AllocationFailed {
                attempt,
                order,
                error,
            } => warn!("({}) failed to allocate {}: {}", attempt, order, error),
            DiagnosticRecord::Candidate {
                attempt,
                prefix_pages,
                full_pages,
                virt,
                phys,
                machine,
                frames,
                runs,
            } => info!(
                "({}) first {} out of {} pages are machine contiguous ({} runs): va={:#x}, pa={:p}, ma={:p}\n{}",
                attempt,
                prefix_pages,
                full_pages,
                runs.len(),
                virt,
                phys,
                machine,
                frames.format_frames()
            ),
            DiagnosticRecord::Exchange {
                attempt,
                candidate,
                outcome,
            } => {
                if outcome.is_anomaly() {
                    warn!(
                        "({}) exchange anomaly: {} pages requested, {} verified, sentinel 0x{:02x} survived",
                        attempt,
                        outcome.requested_pages,
                        outcome.verified_pages,
                        outcome.sentinel.value
                    );
                } else if candidate {
                    info!(
                        "({}) exchange of {} pages ({} verified): {:?}",
                        attempt, outcome.requested_pages, outcome.verified_pages, outcome.verdict
                    );
                } else {
                    debug!(
                        "({}) exchange of contiguous block: {:?}",
                        attempt, outcome.verdict
                    );
                }
            }
            DiagnosticRecord::Finished { state, attempts } => {
                info!("Search finished in state {:?} after {} attempts", state, attempts)
            }
        }
    }
}

impl DiagnosticSink for Vec<DiagnosticRecord> {
    fn record(&mut self, record: DiagnosticRecord) {
        self.push(record);
    }
}

/// Shared sinks, so the caller can inspect what a boxed sink collected.
impl<S: DiagnosticSink + ?Sized> DiagnosticSink for Rc<RefCell<S>> {
    fn record(&mut self, record: DiagnosticRecord) {
        self.borrow_mut().record(record);
    }
}

/// Sink forwarding every record to two sinks.
pub struct Tee<A, B>(pub A, pub B);

impl<A: DiagnosticSink, B: DiagnosticSink> DiagnosticSink for Tee<A, B> {
    fn record(&mut self, record: DiagnosticRecord) {
        self.0.record(record.clone());
        self.1.record(record);
    }
}

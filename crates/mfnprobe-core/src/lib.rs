//! # mfnprobe Core
//!
//! `mfnprobe-core` is the foundation of a harness reproducing a defect in
//! paravirtualized guests: a block of `2^order` pages is handed to the region
//! exchange service after only a prefix of it was verified machine contiguous.
//!
//! ## Architecture Overview
//!
//! The harness talks to the guest through three traits:
//!
//! - [`allocator::PageAllocator`] - Allocates and releases blocks of `2^order`
//!   pages with a known first page frame number.
//!
//! - [`memory::FrameTranslator`] - Translates guest page frame numbers to the
//!   machine frame numbers backing them.
//!
//! - [`exchange::RegionExchange`] - Asks the host to exchange the machine frames
//!   backing a physical range.
//!
//! ## Main Components
//!
//! - [`Search`] - The search loop combining the three to find and exchange a block
//!   whose prefix is machine contiguous while the full block is not.
//!
//! - [`memory`] module - Frame number newtypes, [`memory::PageBlock`] and the
//!   contiguity checks.
//!
//! - [`exchange`] module - Sentinel based verification of exchanges.
//!
//! - [`diagnostic`] module - Structured records of everything the search observes.
//!
//! ## Platform Support
//!
//! The core only depends on the traits above. The `mfnprobe-sim` crate provides a
//! simulated guest implementing all three.

#![warn(missing_docs)]

pub mod allocator;
pub mod config;
pub mod diagnostic;
pub mod exchange;
pub mod memory;
mod search;
#[cfg(test)]
mod testing;
pub mod util;

pub use config::SearchConfig;
pub use search::{
    Error, FoundSample, NoAllocator, SampleKind, Search, SearchBuilder, SearchReport,
    SearchState, SearchStats,
};

//! Simulated paravirtualized guest.
//!
//! This crate models a guest whose physical frames are backed by machine frames
//! that are only contiguous in runs, the situation in which the region exchange
//! defect shows. [`SimGuest`] implements all collaborator traits of
//! `mfnprobe-core`:
//!
//! - [`mfnprobe_core::allocator::PageAllocator`] over an mmap'ed page arena
//! - [`mfnprobe_core::memory::FrameTranslator`] over a physical-to-machine table
//! - [`mfnprobe_core::exchange::RegionExchange`] behaving like the hypervisor
//!   exchange of the machine extent `[mfn(pfn), mfn(pfn) + 2^order)`
//!
//! Everything is deterministic for a given [`SimConfig::seed`].

#![warn(missing_docs)]

mod arena;
mod config;
mod error;
mod guest;
mod machine;
mod rng;

pub use config::SimConfig;
pub use error::SimError;
pub use guest::SimGuest;
pub use machine::{Owner, SimStats};
pub use rng::SimRng;

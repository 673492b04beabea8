//! # mfnprobe
//!
//! Harness reproducing a defect in paravirtualized guests: a block of `2^order`
//! pages is exchanged with the hypervisor after only its first pages were
//! verified machine contiguous.
//!
//! This crate re-exports [`mfnprobe_core`]. With the `sim` feature, the
//! simulated guest backend is available as [`sim`].
//!
//! ```no_run
//! # #[cfg(feature = "sim")]
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use mfnprobe::{Search, SearchState};
//! use mfnprobe::sim::{SimConfig, SimGuest};
//!
//! let guest = SimGuest::new(SimConfig::default())?;
//! let report = Search::builder()
//!     .allocator(guest.clone())
//!     .translator(guest.clone())
//!     .exchanger(guest.clone())
//!     .build()?
//!     .run();
//! if report.state == SearchState::Found {
//!     println!("{:?}", report.found);
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "sim"))]
//! # fn main() {}
//! ```

pub use mfnprobe_core::*;

#[cfg(feature = "sim")]
pub use mfnprobe_sim as sim;

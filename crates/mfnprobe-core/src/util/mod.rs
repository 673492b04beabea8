//! Utility types used throughout mfnprobe.
//!
//! - [`Order`] - allocation order of a page block
//! - [`AbortFlag`] - cooperative cancellation of a running search
//! - [`NamedProgress`] - progress bar styling

mod abort;
mod order;
mod progress;

pub use self::abort::{AbortFlag, abort_after};
pub use self::order::{MAX_ORDER, Order};
pub use self::progress::NamedProgress;

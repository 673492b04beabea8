//! The `memory` module provides the frame-level view of guest memory.
//!
//! - [`Pfn`], [`Mfn`], [`PhysAddr`], [`MachineAddr`]: newtypes for guest physical
//!   and machine frames and addresses.
//! - [`FrameTranslator`]: the physical-to-machine translation boundary.
//! - [`is_contiguous`], [`check_contiguous`] and [`check_range_contiguous`]: the
//!   contiguity classifier.
//! - [`PageBlock`]: an owned block of `2^order` pages.
//!
//! The module also provides helpers for diagnostics:
//! - [`frame_table`] and [`FormatFrames`]: per-page pfn/mfn tables.
//! - [`machine_runs`]: the machine-contiguous runs of a frame range.
//! - [`phys_to_machine`]: bus address of a physical address.
mod contiguity;
mod frame;
mod page_block;
mod translate;

pub use self::contiguity::{
    ContiguityResult, FormatFrames, check_contiguous, check_range_contiguous, is_contiguous,
    machine_runs, pages_spanned,
};
pub use self::frame::{MachineAddr, Mfn, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, Pfn, PhysAddr};
pub use self::page_block::PageBlock;
pub use self::translate::{FrameMapping, FrameTranslator, frame_table, phys_to_machine};

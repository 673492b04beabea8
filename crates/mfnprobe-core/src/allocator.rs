//! Page allocation boundary.
//!
//! This module defines the [`PageAllocator`] trait through which the search loop
//! obtains and returns [`PageBlock`]s.

use crate::memory::PageBlock;
use crate::util::Order;

/// Trait for page allocators handing out naturally aligned blocks of `2^order` pages.
///
/// The allocator is opaque to the harness: it is only asked for blocks and
/// given them back. Which frames it picks, and whether those frames happen to be
/// machine contiguous, is not its concern.
///
/// # Associated Types
///
/// * `Error` - The error type returned when a request cannot be satisfied.
///
/// # Required Methods
///
/// * [`allocate()`](PageAllocator::allocate) - Hands out a block of the given order
/// * [`release()`](PageAllocator::release) - Takes a block back
///
/// # Examples
///
/// See `mfnprobe-sim` for an allocator backed by a simulated guest.
pub trait PageAllocator {
    /// The error type returned by allocation requests.
    type Error: std::error::Error;

    /// Allocates a block of `2^order` pages.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be satisfied. Failing allocations
    /// hold no resources.
    fn allocate(&mut self, order: Order) -> Result<PageBlock, Self::Error>;

    /// Returns a block to the allocator.
    ///
    /// Consumes the block, so a block cannot be released twice.
    fn release(&mut self, block: PageBlock);
}

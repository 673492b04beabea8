use serde::{Deserialize, Serialize};

use crate::memory::PAGE_SHIFT;

/// Allocation order, i.e. the log2 of a block's page count.
///
/// Blocks of order `n` hold `2^n` pages and are naturally aligned to their size.
///
/// # Examples
///
/// ```
/// use mfnprobe_core::util::Order;
///
/// let order = Order::for_pages(3);
/// assert_eq!(order, Order::new(2));
/// assert_eq!(order.pages(), 4);
/// assert_eq!(order.bytes(), 4 * 4096);
/// ```
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Order(u32);

/// Largest order the page allocator contract supports (4 MB blocks).
pub const MAX_ORDER: Order = Order(10);

impl Order {
    /// Creates an order from its raw log2 value.
    pub const fn new(order: u32) -> Self {
        Order(order)
    }

    /// Returns the smallest order whose blocks hold at least `pages` pages.
    ///
    /// Zero pages round up to order 0.
    pub fn for_pages(pages: usize) -> Self {
        Order(pages.max(1).next_power_of_two().trailing_zeros())
    }

    /// Returns the raw log2 value.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Number of pages in a block of this order.
    pub const fn pages(&self) -> usize {
        1 << self.0
    }

    /// Number of bytes in a block of this order.
    pub const fn bytes(&self) -> usize {
        1 << (self.0 as usize + PAGE_SHIFT)
    }
}

impl std::fmt::Display for Order {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "order {} ({} pages)", self.0, self.pages())
    }
}

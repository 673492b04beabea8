use std::fmt;

use super::{PhysAddr, Pfn};
use crate::util::Order;

/// A block of `2^order` pages handed out by a [`PageAllocator`](crate::allocator::PageAllocator).
///
/// The block is virtually contiguous and backed by the physically contiguous
/// frames `pfn..pfn + 2^order`. Whether those frames are also *machine*
/// contiguous is exactly what the harness checks.
///
/// A `PageBlock` is neither `Clone` nor `Copy`: it has exactly one owner, and
/// [`PageAllocator::release`](crate::allocator::PageAllocator::release) consumes it.
pub struct PageBlock {
    ptr: *mut u8,
    order: Order,
    pfn: Pfn,
}

unsafe impl Send for PageBlock {}

impl PageBlock {
    /// Creates a new page block.
    ///
    /// # Safety
    ///
    /// * `ptr` must be valid for reads and writes of `order.bytes()` bytes until
    ///   the block is released.
    /// * `pfn` must be the physical frame backing the first page at `ptr`.
    pub unsafe fn new(ptr: *mut u8, order: Order, pfn: Pfn) -> Self {
        PageBlock { ptr, order, pfn }
    }

    /// Virtual base address.
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Allocation order.
    pub fn order(&self) -> Order {
        self.order
    }

    /// Number of pages in this block.
    pub fn page_count(&self) -> usize {
        self.order.pages()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.order.bytes()
    }

    /// Always false, blocks hold at least one page.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// First physical frame.
    pub fn pfn(&self) -> Pfn {
        self.pfn
    }

    /// Physical base address.
    pub fn phys_addr(&self) -> PhysAddr {
        self.pfn.phys_addr()
    }

    /// Returns a pointer to the byte at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is outside of the block.
    pub fn addr(&self, offset: usize) -> *mut u8 {
        assert!(
            offset < self.len(),
            "PageBlock::addr failed. Offset {} >= {}",
            offset,
            self.len()
        );
        unsafe { self.ptr.byte_add(offset) }
    }

    /// Volatile write of a single byte.
    pub fn write_byte(&self, offset: usize, value: u8) {
        unsafe { std::ptr::write_volatile(self.addr(offset), value) }
    }

    /// Volatile read of a single byte.
    ///
    /// The read always goes to memory, so a remapping of the backing frame done
    /// behind our back is observed.
    pub fn read_byte(&self, offset: usize) -> u8 {
        unsafe { std::ptr::read_volatile(self.addr(offset)) }
    }
}

impl fmt::Debug for PageBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBlock")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("order", &self.order.as_u32())
            .field("pfn", &format_args!("{:#x}", self.pfn))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PAGE_SIZE;

    #[test]
    fn test_page_block_accessors() {
        let mut buf = vec![0u8; Order::new(1).bytes()];
        let block = unsafe { PageBlock::new(buf.as_mut_ptr(), Order::new(1), Pfn::new(0x2c6d4)) };
        assert_eq!(block.page_count(), 2);
        assert_eq!(block.len(), 2 * PAGE_SIZE);
        assert_eq!(block.phys_addr(), PhysAddr::new(0x2c6d4000));
        block.write_byte(1, b'a');
        assert_eq!(block.read_byte(1), b'a');
        assert_eq!(buf[1], b'a');
    }

    #[test]
    #[should_panic]
    fn test_out_of_bounds() {
        let mut buf = vec![0u8; PAGE_SIZE];
        let block = unsafe { PageBlock::new(buf.as_mut_ptr(), Order::new(0), Pfn::new(1)) };
        block.read_byte(PAGE_SIZE);
    }
}

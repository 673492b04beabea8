//! Scripted guest used by the unit tests.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use thiserror::Error;

use crate::allocator::PageAllocator;
use crate::exchange::RegionExchange;
use crate::memory::{FrameTranslator, Mfn, PAGE_SIZE, PageBlock, PhysAddr, Pfn};
use crate::util::Order;

/// Frames reserved per allocation slot.
pub const SLOT_FRAMES: usize = 16;
/// First frame of slot 0.
pub const BASE_PFN: usize = 100;

#[derive(Debug, Error)]
#[error("scripted allocation failure")]
pub struct MockError;

pub struct MockState {
    /// Machine frames per slot; allocation `n` uses `layouts[n % len]`
    layouts: Vec<Vec<usize>>,
    /// Whether an exchange clears the block's memory
    pub relocate: bool,
    /// Which allocation requests fail
    pub fail_when: fn(usize) -> bool,
    pub requests: usize,
    pub allocations: usize,
    pub releases: usize,
    pub exchanges: Vec<(PhysAddr, Order)>,
    live: HashMap<Pfn, (*mut u8, Layout)>,
}

/// Guest whose allocation `n` lands in slot `n`, backed by real heap pages.
#[derive(Clone)]
pub struct MockGuest(Rc<RefCell<MockState>>);

impl MockGuest {
    pub fn new(layouts: &[&[usize]]) -> Self {
        MockGuest(Rc::new(RefCell::new(MockState {
            layouts: layouts.iter().map(|l| l.to_vec()).collect(),
            relocate: true,
            fail_when: |_| false,
            requests: 0,
            allocations: 0,
            releases: 0,
            exchanges: vec![],
            live: HashMap::new(),
        })))
    }

    pub fn relocating(self, relocate: bool) -> Self {
        self.0.borrow_mut().relocate = relocate;
        self
    }

    pub fn failing(self, fail_when: fn(usize) -> bool) -> Self {
        self.0.borrow_mut().fail_when = fail_when;
        self
    }

    pub fn state(&self) -> Ref<'_, MockState> {
        self.0.borrow()
    }

    pub fn live_blocks(&self) -> usize {
        self.0.borrow().live.len()
    }
}

impl PageAllocator for MockGuest {
    type Error = MockError;

    fn allocate(&mut self, order: Order) -> Result<PageBlock, Self::Error> {
        let mut state = self.0.borrow_mut();
        let request = state.requests;
        state.requests += 1;
        if (state.fail_when)(request) {
            return Err(MockError);
        }
        assert!(order.pages() <= SLOT_FRAMES);
        let slot = state.allocations;
        state.allocations += 1;
        let layout = Layout::from_size_align(order.bytes(), PAGE_SIZE).expect("layout");
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        let pfn = Pfn::new(BASE_PFN + slot * SLOT_FRAMES);
        state.live.insert(pfn, (ptr, layout));
        Ok(unsafe { PageBlock::new(ptr, order, pfn) })
    }

    fn release(&mut self, block: PageBlock) {
        let mut state = self.0.borrow_mut();
        let (ptr, layout) = state
            .live
            .remove(&block.pfn())
            .expect("released a block that is not live");
        assert_eq!(ptr, block.ptr());
        unsafe { dealloc(ptr, layout) };
        state.releases += 1;
    }
}

impl FrameTranslator for MockGuest {
    fn physical_to_machine(&self, pfn: Pfn) -> Mfn {
        let state = self.0.borrow();
        let index = pfn.as_usize() - BASE_PFN;
        let layout = &state.layouts[(index / SLOT_FRAMES) % state.layouts.len()];
        Mfn::new(layout[index % SLOT_FRAMES])
    }
}

impl RegionExchange for MockGuest {
    fn exchange(&mut self, phys: PhysAddr, order: Order) {
        let mut state = self.0.borrow_mut();
        state.exchanges.push((phys, order));
        if state.relocate {
            let (ptr, _) = state.live[&phys.pfn()];
            unsafe { std::ptr::write_bytes(ptr, 0, order.bytes()) };
        }
    }
}

use std::cell::RefCell;
use std::rc::Rc;

use log::info;
use mfnprobe_core::allocator::PageAllocator;
use mfnprobe_core::exchange::RegionExchange;
use mfnprobe_core::memory::{FrameTranslator, Mfn, PageBlock, Pfn, PhysAddr};
use mfnprobe_core::util::Order;

use crate::machine::{Owner, SimMachine, SimStats};
use crate::{SimConfig, SimError};

/// Handle to a simulated guest.
///
/// Clones share the same guest, so one instance can be handed to the search
/// as allocator, translator and exchanger while the caller keeps another to
/// inspect [`SimStats`] afterwards.
///
/// Blocks handed out by the allocator point into the guest's page arena and
/// must be released before the last handle is dropped.
///
/// # Panics
///
/// Translating a frame that is not a guest frame panics.
#[derive(Clone)]
pub struct SimGuest(Rc<RefCell<SimMachine>>);

impl SimGuest {
    /// Creates a guest with a random physical-to-machine table.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the page arena cannot be mapped.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        info!(
            "Simulating guest of {} frames on {} machine frames (seed 0x{:x})",
            config.guest_frames, config.machine_frames, config.seed
        );
        Ok(SimGuest(Rc::new(RefCell::new(SimMachine::random(config)?))))
    }

    /// Creates a guest with an explicit physical-to-machine table.
    ///
    /// Guest frame `base_pfn + i` is backed by machine frame `mfns[i]`. The
    /// machine frames in `foreign` belong to other tenants.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidLayout`] if a machine frame is assigned twice or
    /// lies outside of `machine_frames`.
    pub fn from_layout(
        base_pfn: usize,
        mfns: &[usize],
        foreign: &[usize],
        machine_frames: usize,
        seed: u64,
    ) -> Result<Self, SimError> {
        let machine = SimMachine::from_layout(base_pfn, mfns, foreign, machine_frames, seed)?;
        Ok(SimGuest(Rc::new(RefCell::new(machine))))
    }

    /// Counters so far.
    pub fn stats(&self) -> SimStats {
        self.0.borrow().stats()
    }

    /// Configuration of the guest.
    pub fn config(&self) -> SimConfig {
        self.0.borrow().config().clone()
    }

    /// Owner of a machine frame, `None` outside of machine memory.
    pub fn owner(&self, mfn: Mfn) -> Option<Owner> {
        self.0.borrow().owner(mfn)
    }
}

impl PageAllocator for SimGuest {
    type Error = SimError;

    fn allocate(&mut self, order: Order) -> Result<PageBlock, Self::Error> {
        self.0.borrow_mut().allocate(order)
    }

    fn release(&mut self, block: PageBlock) {
        self.0.borrow_mut().release(block)
    }
}

impl FrameTranslator for SimGuest {
    fn physical_to_machine(&self, pfn: Pfn) -> Mfn {
        self.0.borrow().translate(pfn)
    }
}

impl RegionExchange for SimGuest {
    fn exchange(&mut self, phys: PhysAddr, order: Order) {
        self.0.borrow_mut().exchange(phys, order)
    }
}

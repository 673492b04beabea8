use std::collections::HashMap;

use log::{debug, error, trace, warn};
use mfnprobe_core::memory::{Mfn, PageBlock, Pfn, PhysAddr};
use mfnprobe_core::util::{MAX_ORDER, Order};
use rand::Rng;
use serde::Serialize;

use crate::arena::Arena;
use crate::{SimConfig, SimError, SimRng};

/// Owner of a machine frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    /// Not assigned to anyone
    Free,
    /// Assigned to the simulated guest, recorded with the guest frame it was given for
    Guest(Pfn),
    /// Assigned to another tenant
    Foreign,
}

/// Counters of a simulated guest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SimStats {
    /// Successful allocations
    pub allocations: u64,
    /// Allocation requests that failed
    pub failed_allocations: u64,
    /// Accepted releases
    pub releases: u64,
    /// Releases of blocks the allocator did not hand out
    pub invalid_releases: u64,
    /// Blocks currently allocated
    pub live_blocks: usize,
    /// Exchange requests
    pub exchanges: u64,
    /// Exchange requests rejected by the hypervisor
    pub rejected_exchanges: u64,
    /// Machine frames taken away from a different guest page by an exchange
    pub corrupted_frames: u64,
    /// Machine frames left owned but unmapped by an exchange
    pub leaked_frames: u64,
}

/// State of the host and the guest.
pub(crate) struct SimMachine {
    config: SimConfig,
    rng: SimRng,
    arena: Arena,
    /// Physical-to-machine table, indexed by `pfn - base_pfn`
    p2m: Vec<Mfn>,
    owners: Vec<Owner>,
    used: Vec<bool>,
    live: HashMap<Pfn, Order>,
    stats: SimStats,
}

/// Finds the first free machine frame at or after `start`, wrapping around.
fn find_free(owners: &[Owner], start: usize) -> Option<usize> {
    (0..owners.len())
        .map(|i| (start + i) % owners.len())
        .find(|&m| owners[m] == Owner::Free)
}

impl SimMachine {
    /// Builds a machine with a random physical-to-machine table.
    ///
    /// Guest frames continue the machine run of their predecessor unless the
    /// run is broken with probability `fragmentation` or the next machine frame
    /// is taken. Free frames are then handed to other tenants with probability
    /// `foreign_fraction`.
    pub(crate) fn random(config: SimConfig) -> Result<Self, SimError> {
        config.validate()?;
        let mut rng = SimRng::from_seed(config.seed);
        let mut owners = vec![Owner::Free; config.machine_frames];
        let mut p2m = Vec::with_capacity(config.guest_frames);
        let mut prev: Option<Mfn> = None;
        for i in 0..config.guest_frames {
            let pfn = Pfn::new(config.base_pfn + i);
            let next = prev
                .map(|m| m + 1)
                .filter(|m| m.as_usize() < owners.len() && owners[m.as_usize()] == Owner::Free);
            let mfn = match next {
                Some(m) if !rng.random_bool(config.fragmentation) => m,
                _ => {
                    let start = rng.random_range(0..owners.len());
                    Mfn::new(find_free(&owners, start).ok_or_else(|| {
                        SimError::InvalidLayout("machine frames exhausted".into())
                    })?)
                }
            };
            owners[mfn.as_usize()] = Owner::Guest(pfn);
            p2m.push(mfn);
            prev = Some(mfn);
        }
        for owner in owners.iter_mut() {
            if *owner == Owner::Free && rng.random_bool(config.foreign_fraction) {
                *owner = Owner::Foreign;
            }
        }
        Self::with_parts(config, rng, p2m, owners)
    }

    /// Builds a machine from an explicit table.
    ///
    /// Guest frame `base_pfn + i` is backed by `mfns[i]`, the frames in
    /// `foreign` belong to other tenants, all others are free.
    pub(crate) fn from_layout(
        base_pfn: usize,
        mfns: &[usize],
        foreign: &[usize],
        machine_frames: usize,
        seed: u64,
    ) -> Result<Self, SimError> {
        let config = SimConfig {
            guest_frames: mfns.len(),
            machine_frames,
            base_pfn,
            fragmentation: 0.0,
            foreign_fraction: 0.0,
            allocation_failure_rate: 0.0,
            seed,
        };
        config.validate()?;
        let mut owners = vec![Owner::Free; machine_frames];
        let assignments = mfns
            .iter()
            .enumerate()
            .map(|(i, &m)| (m, Owner::Guest(Pfn::new(base_pfn + i))))
            .chain(foreign.iter().map(|&m| (m, Owner::Foreign)));
        for (mfn, owner) in assignments {
            match owners.get_mut(mfn) {
                Some(slot) if *slot == Owner::Free => *slot = owner,
                Some(slot) => {
                    return Err(SimError::InvalidLayout(format!(
                        "machine frame 0x{:x} assigned twice ({:?}, {:?})",
                        mfn, slot, owner
                    )));
                }
                None => {
                    return Err(SimError::InvalidLayout(format!(
                        "machine frame 0x{:x} outside of {} machine frames",
                        mfn, machine_frames
                    )));
                }
            }
        }
        let p2m = mfns.iter().map(|&m| Mfn::new(m)).collect();
        Self::with_parts(config, SimRng::from_seed(seed), p2m, owners)
    }

    fn with_parts(
        config: SimConfig,
        rng: SimRng,
        p2m: Vec<Mfn>,
        owners: Vec<Owner>,
    ) -> Result<Self, SimError> {
        let arena = Arena::map(config.guest_frames)?;
        Ok(SimMachine {
            used: vec![false; config.guest_frames],
            config,
            rng,
            arena,
            p2m,
            owners,
            live: HashMap::new(),
            stats: SimStats::default(),
        })
    }

    pub(crate) fn config(&self) -> &SimConfig {
        &self.config
    }

    pub(crate) fn stats(&self) -> SimStats {
        SimStats {
            live_blocks: self.live.len(),
            ..self.stats
        }
    }

    pub(crate) fn owner(&self, mfn: Mfn) -> Option<Owner> {
        self.owners.get(mfn.as_usize()).copied()
    }

    /// Index of `pfn` into the guest tables.
    fn index(&self, pfn: Pfn) -> Option<usize> {
        pfn.as_usize()
            .checked_sub(self.config.base_pfn)
            .filter(|&i| i < self.config.guest_frames)
    }

    pub(crate) fn translate(&self, pfn: Pfn) -> Mfn {
        match self.index(pfn) {
            Some(i) => self.p2m[i],
            None => panic!("{:?} is not a guest frame", pfn),
        }
    }

    pub(crate) fn allocate(&mut self, order: Order) -> Result<PageBlock, SimError> {
        if order > MAX_ORDER || order.pages() > self.config.guest_frames {
            self.stats.failed_allocations += 1;
            return Err(SimError::OrderTooLarge(order));
        }
        let pages = order.pages();
        if self.config.allocation_failure_rate > 0.0
            && self.rng.random_bool(self.config.allocation_failure_rate)
        {
            self.stats.failed_allocations += 1;
            return Err(SimError::Injected);
        }

        let base = self.config.base_pfn;
        let end = base + self.config.guest_frames;
        let free: Vec<usize> = (base.next_multiple_of(pages)..end)
            .step_by(pages)
            .filter(|pfn| pfn + pages <= end)
            .filter(|pfn| self.used[pfn - base..pfn - base + pages].iter().all(|u| !u))
            .collect();
        if free.is_empty() {
            self.stats.failed_allocations += 1;
            return Err(SimError::OutOfMemory(order));
        }
        let pfn = free[self.rng.random_range(0..free.len())];
        let index = pfn - base;
        self.used[index..index + pages].fill(true);
        self.live.insert(Pfn::new(pfn), order);
        self.stats.allocations += 1;
        trace!("Allocated {} at pfn 0x{:x}", order, pfn);
        // SAFETY: the pages stay mapped as long as the arena, and the block is
        // the only handle to them until it is released
        Ok(unsafe { PageBlock::new(self.arena.page(index), order, Pfn::new(pfn)) })
    }

    pub(crate) fn release(&mut self, block: PageBlock) {
        let pfn = block.pfn();
        let known = self
            .live
            .get(&pfn)
            .copied()
            .zip(self.index(pfn))
            .filter(|&(order, index)| {
                order == block.order() && self.arena.page(index) == block.ptr()
            });
        match known {
            Some((order, index)) => {
                self.live.remove(&pfn);
                self.used[index..index + order.pages()].fill(false);
                self.stats.releases += 1;
                trace!("Released {:?}", block);
            }
            None => {
                warn!("Ignoring release of a block not handed out: {:?}", block);
                self.stats.invalid_releases += 1;
            }
        }
    }

    /// Exchanges the machine extent `[mfn(pfn), mfn(pfn) + 2^order)`.
    ///
    /// The extent is derived from the first frame only. Frames of the extent that
    /// back other guest pages are taken away from them; frames of the block
    /// outside of the extent stay with the guest, unmapped.
    pub(crate) fn exchange(&mut self, phys: PhysAddr, order: Order) {
        self.stats.exchanges += 1;
        let pfn = phys.pfn();
        let pages = order.pages();
        let Some(first) = self
            .index(pfn)
            .filter(|&i| i + pages <= self.config.guest_frames)
        else {
            warn!("Rejected exchange of {} at {:p}: not guest memory", order, phys);
            self.stats.rejected_exchanges += 1;
            return;
        };

        let extent = self.p2m[first].as_usize();
        let owned = (extent..extent + pages)
            .all(|m| matches!(self.owner(Mfn::new(m)), Some(Owner::Guest(_))));
        if !owned {
            debug!(
                "Hypervisor rejected exchange of extent 0x{:x}..0x{:x}: not owned by the guest",
                extent,
                extent + pages
            );
            self.stats.rejected_exchanges += 1;
            return;
        }

        let leaked = self.p2m[first..first + pages]
            .iter()
            .filter(|m| !(extent..extent + pages).contains(&m.as_usize()))
            .count();
        self.stats.leaked_frames += leaked as u64;
        for (i, mfn) in (extent..extent + pages).enumerate() {
            match self.owners[mfn] {
                Owner::Guest(owner) if owner != pfn + i => {
                    warn!(
                        "Exchange of {:?} took machine frame 0x{:x} from {:?}",
                        pfn, mfn, owner
                    );
                    self.stats.corrupted_frames += 1;
                }
                _ => {}
            }
            self.owners[mfn] = Owner::Free;
        }

        for i in 0..pages {
            let start = self.rng.random_range(0..self.owners.len());
            let Some(mfn) = find_free(&self.owners, start) else {
                error!("No free machine frame left for {:?}", pfn + i);
                return;
            };
            self.owners[mfn] = Owner::Guest(pfn + i);
            self.p2m[first + i] = Mfn::new(mfn);
        }
        self.arena.clear(first, pages);
        debug!(
            "Exchanged extent 0x{:x}..0x{:x} of {:?} for fresh frames",
            extent,
            extent + pages,
            pfn
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mfnprobe_core::memory::PAGE_SIZE;

    fn defect_machine(foreign: &[usize]) -> SimMachine {
        SimMachine::from_layout(100, &[500, 501, 502, 999], foreign, 1024, 1).expect("layout")
    }

    #[test]
    fn test_random_layout_is_consistent() -> anyhow::Result<()> {
        let config = SimConfig {
            guest_frames: 256,
            machine_frames: 1024,
            ..Default::default()
        };
        let machine = SimMachine::random(config.clone())?;
        for i in 0..config.guest_frames {
            let pfn = Pfn::new(config.base_pfn + i);
            let mfn = machine.translate(pfn);
            assert_eq!(machine.owner(mfn), Some(Owner::Guest(pfn)));
        }
        let guest = machine
            .owners
            .iter()
            .filter(|o| matches!(o, Owner::Guest(_)))
            .count();
        assert_eq!(guest, config.guest_frames);
        Ok(())
    }

    #[test]
    fn test_random_layout_is_reproducible() -> anyhow::Result<()> {
        let config = SimConfig {
            guest_frames: 64,
            machine_frames: 256,
            ..Default::default()
        };
        let a = SimMachine::random(config.clone())?;
        let b = SimMachine::random(config)?;
        assert_eq!(a.p2m, b.p2m);
        assert_eq!(a.owners, b.owners);
        Ok(())
    }

    #[test]
    fn test_unfragmented_layout_is_one_run() -> anyhow::Result<()> {
        let config = SimConfig {
            guest_frames: 32,
            machine_frames: 4096,
            fragmentation: 0.0,
            ..Default::default()
        };
        let machine = SimMachine::random(config)?;
        let first = machine.p2m[0].as_usize();
        // a single run unless it hits the end of machine memory
        if first + 32 <= 4096 {
            for (i, mfn) in machine.p2m.iter().enumerate() {
                assert_eq!(mfn.as_usize(), first + i);
            }
        }
        Ok(())
    }

    #[test]
    fn test_invalid_layouts() {
        assert!(matches!(
            SimMachine::from_layout(100, &[1, 1], &[], 16, 0),
            Err(SimError::InvalidLayout(_))
        ));
        assert!(matches!(
            SimMachine::from_layout(100, &[1, 2], &[2], 16, 0),
            Err(SimError::InvalidLayout(_))
        ));
        assert!(matches!(
            SimMachine::from_layout(100, &[1, 20], &[], 16, 0),
            Err(SimError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_allocate_until_out_of_memory() -> anyhow::Result<()> {
        let mfns = [10, 11, 12, 13, 20, 21, 22, 23];
        let mut machine = SimMachine::from_layout(0x100, &mfns, &[], 64, 1)?;
        let a = machine.allocate(Order::new(2))?;
        let b = machine.allocate(Order::new(2))?;
        assert_ne!(a.pfn(), b.pfn());
        assert_eq!(a.pfn().as_usize() % 4, 0);
        assert!(matches!(
            machine.allocate(Order::new(2)),
            Err(SimError::OutOfMemory(_))
        ));
        assert!(matches!(
            machine.allocate(Order::new(4)),
            Err(SimError::OrderTooLarge(_))
        ));
        assert_eq!(machine.stats().live_blocks, 2);
        machine.release(a);
        machine.release(b);
        let stats = machine.stats();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.releases, 2);
        assert_eq!(stats.failed_allocations, 2);
        assert_eq!(stats.live_blocks, 0);
        Ok(())
    }

    #[test]
    fn test_release_of_unknown_block_is_ignored() -> anyhow::Result<()> {
        let mut machine = defect_machine(&[]);
        let mut buf = vec![0u8; Order::new(2).bytes()];
        let forged = unsafe { PageBlock::new(buf.as_mut_ptr(), Order::new(2), Pfn::new(100)) };
        machine.release(forged);
        assert_eq!(machine.stats().invalid_releases, 1);
        assert_eq!(machine.stats().releases, 0);
        Ok(())
    }

    #[test]
    fn test_injected_failures() -> anyhow::Result<()> {
        let config = SimConfig {
            guest_frames: 16,
            machine_frames: 64,
            allocation_failure_rate: 1.0,
            ..Default::default()
        };
        let mut machine = SimMachine::random(config)?;
        assert!(matches!(
            machine.allocate(Order::new(0)),
            Err(SimError::Injected)
        ));
        assert_eq!(machine.stats().failed_allocations, 1);
        Ok(())
    }

    #[test]
    fn test_exchange_with_foreign_frame_is_rejected() -> anyhow::Result<()> {
        let mut machine = defect_machine(&[503]);
        let block = machine.allocate(Order::new(2))?;
        block.write_byte(1, 0xAA);
        machine.exchange(block.phys_addr(), block.order());
        assert_eq!(block.read_byte(1), 0xAA);
        assert_eq!(machine.translate(Pfn::new(100)), Mfn::new(500));
        let stats = machine.stats();
        assert_eq!(stats.exchanges, 1);
        assert_eq!(stats.rejected_exchanges, 1);
        machine.release(block);
        Ok(())
    }

    #[test]
    fn test_exchange_with_free_frame_is_rejected() -> anyhow::Result<()> {
        let mut machine = defect_machine(&[]);
        assert_eq!(machine.owner(Mfn::new(503)), Some(Owner::Free));
        let block = machine.allocate(Order::new(2))?;
        machine.exchange(block.phys_addr(), block.order());
        assert_eq!(machine.stats().rejected_exchanges, 1);
        machine.release(block);
        Ok(())
    }

    #[test]
    fn test_exchange_of_contiguous_block_relocates() -> anyhow::Result<()> {
        let mut machine = SimMachine::from_layout(100, &[500, 501, 502, 503], &[], 1024, 1)?;
        let block = machine.allocate(Order::new(2))?;
        block.write_byte(1, 0xAA);
        block.write_byte(3 * PAGE_SIZE, 0x55);
        machine.exchange(block.phys_addr(), block.order());
        assert_eq!(block.read_byte(1), 0);
        assert_eq!(block.read_byte(3 * PAGE_SIZE), 0);
        for i in 0..4 {
            let pfn = Pfn::new(100 + i);
            assert_eq!(machine.owner(machine.translate(pfn)), Some(Owner::Guest(pfn)));
        }
        let stats = machine.stats();
        assert_eq!(stats.rejected_exchanges, 0);
        assert_eq!(stats.corrupted_frames, 0);
        assert_eq!(stats.leaked_frames, 0);
        machine.release(block);
        Ok(())
    }

    #[test]
    fn test_exchange_takes_frame_of_other_page() -> anyhow::Result<()> {
        // machine frame 503 backs guest frame 104
        let mut machine = SimMachine::from_layout(
            100,
            &[500, 501, 502, 999, 503, 600, 601, 602],
            &[],
            1024,
            1,
        )?;
        let mut block = machine.allocate(Order::new(2))?;
        while block.pfn() != Pfn::new(100) {
            let other = machine.allocate(Order::new(2))?;
            machine.release(block);
            block = other;
        }
        machine.exchange(block.phys_addr(), block.order());
        let stats = machine.stats();
        assert_eq!(stats.rejected_exchanges, 0);
        assert_eq!(stats.corrupted_frames, 1);
        assert_eq!(stats.leaked_frames, 1);
        assert_eq!(machine.owner(Mfn::new(999)), Some(Owner::Guest(Pfn::new(103))));
        assert_ne!(machine.owner(Mfn::new(503)), Some(Owner::Guest(Pfn::new(104))));
        machine.release(block);
        Ok(())
    }
}

//! Region exchange and its verification.
//!
//! The [`RegionExchange`] trait is the boundary to the privileged remapping
//! service. It has no return value: whether an exchange took effect is only
//! observable through the memory itself. [`ExchangeVerifier`] makes that
//! observation explicit by planting a [`Sentinel`] before the exchange and reading
//! it back afterwards.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::memory::{PAGE_SIZE, PageBlock, PhysAddr};
use crate::util::Order;

/// Trait for the region exchange service.
///
/// An exchange asks the host to give the guest new machine frames for the
/// physical range starting at `phys` spanning `2^order` pages. The service
/// assumes the range is currently backed by a single machine extent.
pub trait RegionExchange {
    /// Exchanges the `2^order` pages starting at `phys`.
    fn exchange(&mut self, phys: PhysAddr, order: Order);
}

impl<F> RegionExchange for F
where
    F: FnMut(PhysAddr, Order),
{
    fn exchange(&mut self, phys: PhysAddr, order: Order) {
        self(phys, order)
    }
}

/// A known byte planted inside a block to detect relocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentinel {
    /// Byte offset inside the block's first page
    pub offset: usize,
    /// Value written before the exchange
    pub value: u8,
}

impl Default for Sentinel {
    fn default() -> Self {
        Self {
            offset: 1,
            value: 0xAA,
        }
    }
}

impl Sentinel {
    /// Whether the sentinel fits into the first page of any block.
    pub fn is_valid(&self) -> bool {
        self.offset < PAGE_SIZE
    }
}

/// How the verifier treats exchanges larger than the verified range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangePolicy {
    /// Exchange the whole block, even if only a prefix was verified contiguous.
    /// This reproduces the defect.
    #[default]
    Defective,
    /// Never exchange more pages than were verified contiguous.
    Guarded,
}

/// Classification of an exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeVerdict {
    /// The sentinel changed: the backing memory was swapped
    Relocated,
    /// The sentinel survived: the exchange did not swap the backing memory
    NotRelocated,
    /// The exchange was not issued because it exceeded the verified range
    Withheld,
}

/// Result of one verified exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ExchangeOutcome {
    /// Classification
    pub verdict: ExchangeVerdict,
    /// Sentinel written before the exchange
    pub sentinel: Sentinel,
    /// Value read back at the sentinel offset, if the exchange was issued
    pub observed: Option<u8>,
    /// Pages covered by the exchange request
    pub requested_pages: usize,
    /// Pages verified machine contiguous before the exchange
    pub verified_pages: usize,
}

impl ExchangeOutcome {
    /// Whether the outcome is the reproduced symptom, i.e. an issued exchange
    /// that left the memory in place.
    pub fn is_anomaly(&self) -> bool {
        self.verdict == ExchangeVerdict::NotRelocated
    }

    /// Whether the request covered pages that were never verified contiguous.
    pub fn exceeds_verified(&self) -> bool {
        self.requested_pages > self.verified_pages
    }
}

/// Runs exchanges with sentinel verification.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExchangeVerifier {
    sentinel: Sentinel,
    policy: ExchangePolicy,
}

impl ExchangeVerifier {
    /// Creates a new verifier.
    pub fn new(sentinel: Sentinel, policy: ExchangePolicy) -> Self {
        Self { sentinel, policy }
    }

    /// Exchanges `block` and checks whether its memory was relocated.
    ///
    /// The exchange always covers the whole block, i.e. `block.order()`.
    /// `committed_pages` is the number of pages verified machine contiguous; under
    /// [`ExchangePolicy::Guarded`] a block larger than that is not exchanged.
    ///
    /// The block is only borrowed; releasing it stays with the caller.
    pub fn verify_exchange<X: RegionExchange + ?Sized>(
        &self,
        exchanger: &mut X,
        block: &PageBlock,
        committed_pages: usize,
    ) -> ExchangeOutcome {
        let requested_pages = block.page_count();
        let mut outcome = ExchangeOutcome {
            verdict: ExchangeVerdict::Withheld,
            sentinel: self.sentinel,
            observed: None,
            requested_pages,
            verified_pages: committed_pages,
        };
        if self.policy == ExchangePolicy::Guarded && outcome.exceeds_verified() {
            info!(
                "Withholding exchange of {} pages at {:p}, only {} verified contiguous",
                requested_pages,
                block.phys_addr(),
                committed_pages
            );
            return outcome;
        }

        block.write_byte(self.sentinel.offset, self.sentinel.value);
        debug!(
            "Exchanging {} at {:p} (sentinel 0x{:02x} at +{})",
            block.order(),
            block.phys_addr(),
            self.sentinel.value,
            self.sentinel.offset
        );
        exchanger.exchange(block.phys_addr(), block.order());
        let observed = block.read_byte(self.sentinel.offset);
        outcome.observed = Some(observed);
        outcome.verdict = if observed == self.sentinel.value {
            warn!(
                "Sentinel survived exchange of {} pages at {:p}: perhaps failed to exchange memory",
                requested_pages,
                block.phys_addr()
            );
            ExchangeVerdict::NotRelocated
        } else {
            debug!("Sentinel changed to 0x{:02x}, memory relocated", observed);
            ExchangeVerdict::Relocated
        };
        outcome
    }
}

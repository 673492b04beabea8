use serde::Serialize;

use super::{MachineAddr, Mfn, PhysAddr, Pfn};

/// Trait for translating guest physical frames to machine frames.
///
/// This is the boundary to the virtualization layer's physical-to-machine
/// table. Implementors must be pure: translating the same frame twice yields
/// the same machine frame as long as nobody remaps it in between.
///
/// Only frames that belong to a live allocation may be translated. Translating
/// anything else is outside the contract; implementors are free to panic or to
/// return garbage.
pub trait FrameTranslator {
    /// Returns the machine frame backing `pfn`.
    fn physical_to_machine(&self, pfn: Pfn) -> Mfn;
}

impl<F> FrameTranslator for F
where
    F: Fn(Pfn) -> Mfn,
{
    fn physical_to_machine(&self, pfn: Pfn) -> Mfn {
        self(pfn)
    }
}

/// One row of a frame table: a guest frame and the machine frame behind it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FrameMapping {
    /// Page index relative to the start of the table
    pub index: usize,
    /// Guest physical frame
    pub pfn: Pfn,
    /// Machine frame backing `pfn`
    pub mfn: Mfn,
}

/// Translates a guest physical address to its machine address, keeping the
/// offset inside the page.
pub fn phys_to_machine<T: FrameTranslator + ?Sized>(
    translator: &T,
    addr: PhysAddr,
) -> MachineAddr {
    let mfn = translator.physical_to_machine(addr.pfn());
    MachineAddr::new(mfn.machine_addr().as_usize() | addr.page_offset())
}

/// Builds the frame table for `count` frames starting at `start`.
pub fn frame_table<T: FrameTranslator + ?Sized>(
    translator: &T,
    start: Pfn,
    count: usize,
) -> Vec<FrameMapping> {
    (0..count)
        .map(|index| {
            let pfn = start + index;
            FrameMapping {
                index,
                pfn,
                mfn: translator.physical_to_machine(pfn),
            }
        })
        .collect()
}

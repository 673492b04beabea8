use std::fmt::{Debug, Formatter};
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// Page shift value (12 bits) for 4KB pages
pub const PAGE_SHIFT: usize = 12;
/// Standard page size (4096 bytes)
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Mask for extracting page offset
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

macro_rules! newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(
            Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
        )]
        pub struct $name(usize);

        impl $name {
            #[doc = concat!("Creates a new [`", stringify!($name), "`].")]
            pub const fn new(value: usize) -> Self {
                $name(value)
            }

            /// Returns the raw value.
            pub const fn as_usize(&self) -> usize {
                self.0
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "(0x{:x})"), self.0)
            }
        }

        impl std::fmt::LowerHex for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                std::fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl From<$name> for usize {
            fn from(value: $name) -> usize {
                value.0
            }
        }

        impl Add<usize> for $name {
            type Output = $name;

            fn add(self, rhs: usize) -> Self::Output {
                $name(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = $name;

            fn sub(self, rhs: usize) -> Self::Output {
                assert!(self.0 >= rhs);
                $name(self.0 - rhs)
            }
        }
    };
}

newtype!(
    /// Guest physical frame number.
    Pfn
);
newtype!(
    /// Machine frame number, i.e. a frame in the host's physical address space.
    Mfn
);
newtype!(
    /// Guest physical address.
    PhysAddr
);
newtype!(
    /// Machine (bus) address.
    MachineAddr
);

impl Pfn {
    /// Physical address of the first byte in this frame.
    pub const fn phys_addr(&self) -> PhysAddr {
        PhysAddr(self.0 << PAGE_SHIFT)
    }
}

impl Mfn {
    /// Machine address of the first byte in this frame.
    pub const fn machine_addr(&self) -> MachineAddr {
        MachineAddr(self.0 << PAGE_SHIFT)
    }

    /// Whether `self` is the machine frame directly after `prev`.
    pub fn follows(&self, prev: Mfn) -> bool {
        prev.0.checked_add(1) == Some(self.0)
    }
}

impl PhysAddr {
    /// Frame containing this address.
    pub const fn pfn(&self) -> Pfn {
        Pfn(self.0 >> PAGE_SHIFT)
    }

    /// Byte offset of this address inside its frame.
    pub const fn page_offset(&self) -> usize {
        self.0 & PAGE_MASK
    }
}

impl std::fmt::Pointer for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:p}", self.0 as *const u8)
    }
}

impl std::fmt::Pointer for MachineAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:p}", self.0 as *const u8)
    }
}

//! Two-dimensional memory subsystem.
//!
//! A guest-physical address space is a stack of three layers:
//!
//! - [`RamBlock`] — a contiguous user-virtual range whose pages are pinned
//!   lazily, 2 MiB [`Chunk`] at a time.
//! - [`MemSlot`] — a guest-frame range mapped onto a block offset. The slot
//!   list is sorted and disjoint; `set_ram` calls replace slices of it.
//! - [`GpaSpace`] — the facade: GFN resolution, kernel-mapped access to
//!   guest pages, bulk read/write, and the page-protection bitmap.
//!
//! Slot changes are propagated to listeners (the EPT engine) so stale
//! translations never outlive the mapping they were derived from.

pub mod chunk;
pub mod gpa_space;
pub mod memslot;
pub mod ramblock;

pub use chunk::Chunk;
pub use gpa_space::{GpaSpace, GPA_PROT_ALL, GPA_PROT_NONE, INVALID_PFN};
pub use memslot::{MemSlot, MemSlotFlags, MemSlotListener};
pub use ramblock::{RamBlock, RamBlockList};

/// Guest physical address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Gpa(u64);

impl Gpa {
    /// Create a new guest physical address with a range check.
    #[inline]
    pub const fn new(addr: u64) -> Option<Self> {
        if addr < 1 << 52 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Build from a guest frame number.
    #[inline]
    pub const fn from_gfn(gfn: u64) -> Self {
        Self(gfn << 12)
    }

    /// Guest frame number of this address.
    #[inline]
    pub const fn gfn(self) -> u64 {
        self.0 >> 12
    }

    /// Offset within the containing page.
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & 0xfff
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }
}

/// Guest virtual address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
pub struct Gva(u64);

impl Gva {
    /// Create a new guest virtual address with a canonicality check.
    #[inline(always)]
    pub const fn new(addr: u64) -> Option<Self> {
        match addr & 0xffff_8000_0000_0000 {
            m if m == 0xffff_8000_0000_0000 || m == 0 => Some(Self(addr)),
            _ => None,
        }
    }

    /// Offset within the containing page.
    #[inline]
    pub const fn page_offset(self) -> u64 {
        self.0 & 0xfff
    }

    /// Cast into u64.
    #[inline]
    pub const fn into_u64(self) -> u64 {
        self.0
    }
}

macro_rules! impl_arith {
    ($t: ty) => {
        impl core::ops::Add<u64> for $t {
            type Output = Self;

            fn add(self, other: u64) -> Self::Output {
                Self(self.0 + other)
            }
        }
        impl core::ops::AddAssign<u64> for $t {
            fn add_assign(&mut self, other: u64) {
                self.0 = self.0 + other
            }
        }
        impl core::ops::Sub<u64> for $t {
            type Output = Self;

            fn sub(self, other: u64) -> Self::Output {
                Self(self.0 - other)
            }
        }
        impl core::ops::BitAnd<u64> for $t {
            type Output = Self;

            fn bitand(self, other: u64) -> Self {
                Self(self.0 & other)
            }
        }
    };
}

impl_arith!(Gpa);
impl_arith!(Gva);

impl core::fmt::Debug for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Gpa {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gpa(0x{:x})", self.0)
    }
}
impl core::fmt::Debug for Gva {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gva(0x{:x})", self.0)
    }
}
impl core::fmt::Display for Gva {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Gva(0x{:x})", self.0)
    }
}

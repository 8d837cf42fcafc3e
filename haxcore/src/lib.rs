//! Hardware-assisted virtualization engine core for Intel VT-x hosts.
//!
//! The engine exposes an ioctl-style control surface ([`api`]) through which
//! a user-space device model constructs virtual machines, installs guest
//! memory, and drives virtual CPUs through a run/exit loop. Guest code runs
//! in VMX non-root mode on real host cores; every transition goes through
//! this crate.
//!
//! The four load-bearing subsystems:
//!
//! - [`vmx`] — per-pCPU VMXON lifecycle, per-vCPU VMCS management, the
//!   guest-entry/VM-exit machinery.
//! - [`memory`] — RAM blocks of lazily pinned user pages, the memory-slot
//!   list mapping guest frames to user memory, and the guest-physical
//!   address space facade.
//! - [`ept`] — the four-level extended page table, its fault handlers, and
//!   INVEPT broadcast.
//! - [`mmio`] — the instruction decoder behind the fast MMIO exit path.
//!
//! Host-OS services are reached exclusively through [`haxhal::HostApi`],
//! which the platform driver installs before calling [`api::init`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate haxhal;

pub mod api;
pub mod config;
pub mod cpuid;
pub mod ept;
pub mod interrupt;
pub mod memory;
pub mod mmio;
pub mod paging;
pub mod probe;
pub mod tunnel;
pub mod vcpu;
pub mod vm;
pub mod vmexit;
pub mod vmx;

pub use memory::{Gpa, Gva};

use vmx::vmcs::InstructionError;

/// Errors of the engine, mapped onto errno at the control surface.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Error {
    /// Null argument, bad id, overlapping range, malformed request.
    InvalidParam,
    /// Allocation, pinning, or mapping failure.
    NoMemory,
    /// Write to a read-only slot, or an access the policy forbids.
    Access,
    /// Access hit a protected guest frame; carries the offending GFN.
    ProtectedPage(u64),
    /// The entity already exists (vCPU id, EPT leaf).
    Exists,
    /// The operation races with an ongoing one.
    Busy,
    /// The host lacks a required feature (VT, NX, EPT caps).
    NoDevice,
    /// A VMX instruction failed.
    Vmx(InstructionError),
}

impl Error {
    /// The errno presented to the device model.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidParam => -22, // -EINVAL
            Error::NoMemory => -12,     // -ENOMEM
            Error::Access => -13,       // -EACCES
            Error::ProtectedPage(_) => -14, // -EFAULT
            Error::Exists => -17,       // -EEXIST
            Error::Busy => -16,         // -EBUSY
            Error::NoDevice => -19,     // -ENODEV
            Error::Vmx(_) => -5,        // -EIO
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::InvalidParam => write!(f, "invalid parameter"),
            Error::NoMemory => write!(f, "out of memory"),
            Error::Access => write!(f, "access denied"),
            Error::ProtectedPage(gfn) => write!(f, "protected gfn 0x{:x}", gfn),
            Error::Exists => write!(f, "already exists"),
            Error::Busy => write!(f, "busy"),
            Error::NoDevice => write!(f, "missing host feature"),
            Error::Vmx(e) => write!(f, "vmx instruction error: {:?}", e),
        }
    }
}

/// Engine result type.
pub type Result<T> = core::result::Result<T, Error>;

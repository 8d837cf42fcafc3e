//! The tunnel: a dual-mapped page carrying exit payloads to user space.

use crate::config::HAX_IO_BUF_PAGES;
use crate::{Error, Result};
use haxhal::host::host;
use haxhal::mm::ContigBuffer;
use haxhal::{PageFrame, PAGE_SIZE};

/// Exit statuses reported through the tunnel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ExitStatus {
    /// Port I/O request; data in the I/O buffer or the payload.
    Io = 1,
    /// Generic MMIO request the decoder could not handle.
    Mmio = 2,
    /// The guest left protected mode on a host without unrestricted guest.
    RealMode = 3,
    /// A host interrupt interrupted guest execution; re-enter when ready.
    Interrupt = 4,
    /// Unclassified exit.
    Unknown = 5,
    /// The guest executed HLT with no interrupt pending.
    Hlt = 6,
    /// The vCPU panicked; state change details in the payload.
    StateChange = 7,
    /// The vCPU was paused by another thread.
    Paused = 8,
    /// Decoded MMIO request on the fast path.
    FastMmio = 9,
    /// Write to a protected guest frame.
    PageFault = 10,
    /// Guest debug event (breakpoint, single-step).
    Debug = 11,
}

/// Port-I/O payload.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct IoPayload {
    pub direction: u8,
    pub df: u8,
    pub size: u16,
    pub port: u16,
    pub count: u16,
    pub flags: u8,
    pub pad0: u8,
    pub pad1: u16,
    pub pad2: u32,
    pub vaddr: u64,
}

/// Fast-path MMIO payload. `direction` 0 = read, 1 = write, 2 = copy from
/// `gpa` to `gpa2` (both MMIO; requires the fastmmio-extra feature).
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct FastMmioPayload {
    pub gpa: u64,
    /// Value for reads/writes, or the destination GPA for direction 2.
    pub value: u64,
    pub size: u8,
    pub direction: u8,
    pub reg_index: u16,
    pub pad0: u32,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
}

/// Fallback MMIO payload: the guest linear address of the access.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct MmioPayload {
    pub gla: u64,
}

/// Protection-fault payload.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct PageFaultPayload {
    pub gpa: u64,
    pub access: u32,
    pub pad: u32,
}

/// Debug-exit payload.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct DebugPayload {
    pub rip: u64,
    pub dr6: u64,
    pub dr7: u64,
}

/// The per-exit payload union.
#[repr(C)]
pub union TunnelPayload {
    pub io: IoPayload,
    pub mmio: MmioPayload,
    pub fastmmio: FastMmioPayload,
    pub pagefault: PageFaultPayload,
    pub debug: DebugPayload,
}

/// Layout of the tunnel page, shared verbatim with user space.
#[repr(C)]
pub struct TunnelPage {
    pub exit_reason: u32,
    pub pad0: u32,
    pub exit_status: u32,
    /// Set by user space to ask for an early exit.
    pub user_event_pending: u32,
    pub ready_for_interrupt_injection: i32,
    pub request_interrupt_window: i32,
    pub apic_base: u64,
    pub payload: TunnelPayload,
}

/// The dual-mapped tunnel page plus the I/O buffer of one vCPU.
pub struct Tunnel {
    frame: PageFrame,
    user_va: u64,
    io_buf: ContigBuffer,
    io_user_va: u64,
}

impl Tunnel {
    /// Allocate and dual-map the tunnel and the I/O buffer.
    pub fn new() -> Result<Self> {
        let frame = PageFrame::new().ok_or(Error::NoMemory)?;
        let io_buf = ContigBuffer::new(HAX_IO_BUF_PAGES).ok_or(Error::NoMemory)?;
        let user_va = host()
            .map_to_user(frame.va(), 1)
            .ok_or(Error::NoMemory)?;
        let io_user_va = match host().map_to_user(io_buf.va(), HAX_IO_BUF_PAGES) {
            Some(va) => va,
            None => {
                host().unmap_from_user(user_va, 1);
                return Err(Error::NoMemory);
            }
        };
        Ok(Self {
            frame,
            user_va,
            io_buf,
            io_user_va,
        })
    }

    /// UVA of the tunnel page in the device model.
    #[inline]
    pub fn user_va(&self) -> u64 {
        self.user_va
    }

    /// UVA of the I/O buffer in the device model.
    #[inline]
    pub fn io_user_va(&self) -> u64 {
        self.io_user_va
    }

    /// Size of the tunnel mapping.
    #[inline]
    pub fn size(&self) -> usize {
        PAGE_SIZE
    }

    /// The shared page.
    ///
    /// The vCPU thread is the only kernel-side writer; user space writes
    /// only `user_event_pending` and the payload value on re-entry.
    #[allow(clippy::mut_from_ref)]
    pub fn page(&self) -> &mut TunnelPage {
        unsafe { &mut *(self.frame.va().into_usize() as *mut TunnelPage) }
    }

    /// The I/O data buffer.
    #[allow(clippy::mut_from_ref)]
    pub fn io_buf(&self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(
                self.io_buf.va().into_usize() as *mut u8,
                self.io_buf.len(),
            )
        }
    }

    /// Publish an exit to user space.
    pub fn set_exit(&self, reason: u32, status: ExitStatus) {
        let page = self.page();
        page.exit_reason = reason;
        page.exit_status = status as u32;
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        host().unmap_from_user(self.user_va, 1);
        host().unmap_from_user(self.io_user_va, HAX_IO_BUF_PAGES);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haxhal::mock::install_mock;

    #[test]
    fn tunnel_layout_offsets() {
        // The layout is ABI with the device model; pin the hot offsets.
        assert_eq!(core::mem::offset_of!(TunnelPage, exit_reason), 0);
        assert_eq!(core::mem::offset_of!(TunnelPage, exit_status), 8);
        assert_eq!(core::mem::offset_of!(TunnelPage, user_event_pending), 12);
        assert_eq!(core::mem::offset_of!(TunnelPage, apic_base), 24);
        assert_eq!(core::mem::offset_of!(TunnelPage, payload), 32);
        assert!(core::mem::size_of::<TunnelPage>() <= PAGE_SIZE);
        assert_eq!(core::mem::size_of::<FastMmioPayload>(), 56);
    }

    #[test]
    fn tunnel_round_trip() {
        install_mock();
        let tunnel = Tunnel::new().unwrap();
        tunnel.set_exit(12, ExitStatus::Hlt);
        assert_eq!(tunnel.page().exit_status, ExitStatus::Hlt as u32);
        assert_eq!(tunnel.page().exit_reason, 12);
        // The mock maps kernel pages to user space at identity.
        assert_eq!(tunnel.user_va(), tunnel.page() as *const _ as u64);
        tunnel.io_buf()[0] = 0xaa;
        assert_eq!(tunnel.io_buf().len(), HAX_IO_BUF_PAGES * PAGE_SIZE);
    }
}

//! Port-I/O exits.

use super::{ExitAction, ExitInfo};
use crate::tunnel::ExitStatus;
use crate::vcpu::{PendingIo, Vcpu};
use crate::vmx::controls::IoQual;
use crate::vmx::entry::gpr;
use crate::Result;

/// Direction values of the tunnel `io` payload.
pub const IO_OUT: u8 = 0;
pub const IO_IN: u8 = 1;

const RFLAGS_DF: u64 = 1 << 10;

pub fn handle_io(vcpu: &mut Vcpu, exit: &ExitInfo) -> Result<ExitAction> {
    let qual = IoQual::from_raw(exit.qualification);
    let size = qual.size();
    let port = qual.port();
    let df = vcpu.state.rflags & RFLAGS_DF != 0;
    let direction = if qual.is_in() { IO_IN } else { IO_OUT };

    let count = if qual.is_string() {
        handle_string_io(vcpu, exit, &qual, df)?
    } else {
        handle_immediate_io(vcpu, exit, &qual)?
    };

    let io = crate::tunnel::IoPayload {
        direction,
        df: df as u8,
        size: size as u16,
        port,
        count,
        flags: qual.is_string() as u8,
        vaddr: exit.guest_linear,
        ..Default::default()
    };
    vcpu.set_io_exit(io);
    Ok(ExitAction::ExitToUser(ExitStatus::Io))
}

/// IN/OUT through AL/AX/EAX: the datum travels in the I/O buffer.
fn handle_immediate_io(vcpu: &mut Vcpu, exit: &ExitInfo, qual: &IoQual) -> Result<u16> {
    let size = qual.size();
    if qual.is_in() {
        vcpu.set_pending_io(PendingIo::RegIn { size });
    } else {
        let value = vcpu.state.gprs.read_sized(gpr::RAX, size);
        vcpu.io_buf_write(&value.to_le_bytes()[..size as usize]);
    }
    vcpu.advance_rip(exit);
    Ok(1)
}

/// INS/OUTS: data moves between guest memory and the I/O buffer; REP
/// batches up to a buffer's worth of elements per exit.
fn handle_string_io(vcpu: &mut Vcpu, exit: &ExitInfo, qual: &IoQual, df: bool) -> Result<u16> {
    let size = qual.size() as u64;
    let max_elems = (vcpu.io_buf_len() as u64) / size;
    let rcx = if qual.has_rep() {
        vcpu.state.gprs.regs[gpr::RCX]
    } else {
        1
    };
    if rcx == 0 {
        // REP with an exhausted count retires without an access.
        vcpu.advance_rip(exit);
        return Ok(0);
    }
    let count = rcx.min(max_elems);
    let va = exit.guest_linear;

    if qual.is_in() {
        // Data lands in the buffer; the copy into guest memory happens on
        // re-entry, after the device model filled it in.
        vcpu.set_pending_io(PendingIo::StringIn {
            va,
            count,
            size: size as u8,
            df,
        });
        vcpu.state.gprs.regs[gpr::RDI] = advance_string_reg(
            vcpu.state.gprs.regs[gpr::RDI],
            count,
            size,
            df,
        );
    } else {
        // Gather from guest memory now.
        let mut offset = 0usize;
        for i in 0..count {
            let elem_va = string_element_va(va, i, size, df);
            let mut buf = [0u8; 8];
            vcpu.read_guest_virtual(elem_va, &mut buf[..size as usize])?;
            vcpu.io_buf_write_at(offset, &buf[..size as usize]);
            offset += size as usize;
        }
        vcpu.state.gprs.regs[gpr::RSI] = advance_string_reg(
            vcpu.state.gprs.regs[gpr::RSI],
            count,
            size,
            df,
        );
    }

    if qual.has_rep() {
        let remaining = rcx - count;
        vcpu.state.gprs.regs[gpr::RCX] = remaining;
        if remaining == 0 {
            vcpu.advance_rip(exit);
        }
    } else {
        vcpu.advance_rip(exit);
    }
    Ok(count as u16)
}

pub(crate) fn string_element_va(base: u64, index: u64, size: u64, df: bool) -> u64 {
    if df {
        base.wrapping_sub(index * size)
    } else {
        base.wrapping_add(index * size)
    }
}

fn advance_string_reg(reg: u64, count: u64, size: u64, df: bool) -> u64 {
    if df {
        reg.wrapping_sub(count * size)
    } else {
        reg.wrapping_add(count * size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_addressing_follows_df() {
        assert_eq!(string_element_va(0x1000, 0, 2, false), 0x1000);
        assert_eq!(string_element_va(0x1000, 3, 2, false), 0x1006);
        assert_eq!(string_element_va(0x1000, 3, 2, true), 0xffa);
        assert_eq!(advance_string_reg(0x1000, 4, 2, false), 0x1008);
        assert_eq!(advance_string_reg(0x1000, 4, 2, true), 0xff8);
    }
}

//! Debug-register exits.

use super::{ExitAction, ExitInfo};
use crate::vcpu::Vcpu;
use crate::vmx::controls::DrQual;
use crate::Result;

const CR4_DE: u64 = 1 << 3;
const DR6_BD: u64 = 1 << 13;
const DR7_GD: u64 = 1 << 13;

pub fn handle_dr_access(vcpu: &mut Vcpu, exit: &ExitInfo) -> Result<ExitAction> {
    let qual = DrQual::from_raw(exit.qualification);
    let mut dr = qual.dr();

    // DR4/5 alias DR6/7 unless CR4.DE turns them into #UD.
    if dr == 4 || dr == 5 {
        if vcpu.state.cr4 & CR4_DE != 0 {
            vcpu.inject_exception(6, None);
            return Ok(ExitAction::Resume);
        }
        dr += 2;
    }

    // DR7.GD traps every debug-register access as #DB with DR6.BD.
    if vcpu.state.dr7 & DR7_GD != 0 {
        vcpu.state.dr7 &= !DR7_GD;
        vcpu.state.dr6 |= DR6_BD;
        vcpu.stage_dr7();
        vcpu.inject_exception(1, None);
        return Ok(ExitAction::Resume);
    }

    let gpr = qual.gpr();
    if qual.is_read() {
        let value = match dr {
            0 => vcpu.state.dr0,
            1 => vcpu.state.dr1,
            2 => vcpu.state.dr2,
            3 => vcpu.state.dr3,
            6 => vcpu.state.dr6,
            _ => vcpu.state.dr7,
        };
        vcpu.state.gprs.regs[gpr] = value;
    } else {
        let value = vcpu.state.gprs.regs[gpr];
        match dr {
            0 => vcpu.state.dr0 = value,
            1 => vcpu.state.dr1 = value,
            2 => vcpu.state.dr2 = value,
            3 => vcpu.state.dr3 = value,
            // The fixed bits of DR6/DR7 read back as the ISA defines them.
            6 => vcpu.state.dr6 = (value & 0xffff_0ff2) | 0xffff_0ff0,
            _ => {
                vcpu.state.dr7 = (value & 0xffff_2bff) | 0x400;
                vcpu.stage_dr7();
            }
        }
    }
    vcpu.advance_rip(exit);
    Ok(ExitAction::Resume)
}

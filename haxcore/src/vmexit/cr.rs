//! Control-register exits.

use super::{ExitAction, ExitInfo};
use crate::memory::Gpa;
use crate::tunnel::ExitStatus;
use crate::vcpu::Vcpu;
use crate::vmx::controls::{CrAccessType, CrQual};
use crate::Result;

const CR0_PE: u64 = 1 << 0;
const CR0_TS: u64 = 1 << 3;
const CR0_NW: u64 = 1 << 29;
const CR0_CD: u64 = 1 << 30;
const CR0_PG: u64 = 1 << 31;
const CR4_PAE: u64 = 1 << 5;
const EFER_LME: u64 = 1 << 8;
const EFER_LMA: u64 = 1 << 10;

pub fn handle_cr_access(vcpu: &mut Vcpu, exit: &ExitInfo) -> Result<ExitAction> {
    let qual = CrQual::from_raw(exit.qualification);
    let action = match qual.access_type() {
        CrAccessType::MovToCr => {
            let value = vcpu.state.gprs.regs[qual.gpr()];
            match qual.cr() {
                0 => return write_cr0(vcpu, exit, value),
                3 => {
                    vcpu.set_guest_cr3(value);
                    ExitAction::Resume
                }
                4 => return write_cr4(vcpu, exit, value),
                8 => {
                    // The default APIC arbitration keeps TPR in the device
                    // model; nothing to mirror here.
                    ExitAction::Resume
                }
                cr => {
                    warning!("vcpu {}: MOV to CR{} ignored", vcpu.vcpu_id, cr);
                    ExitAction::Resume
                }
            }
        }
        CrAccessType::MovFromCr => {
            let value = match qual.cr() {
                0 => vcpu.state.cr0,
                3 => vcpu.state.cr3,
                4 => vcpu.state.cr4,
                8 => 0,
                cr => {
                    warning!("vcpu {}: MOV from CR{} reads 0", vcpu.vcpu_id, cr);
                    0
                }
            };
            vcpu.state.gprs.regs[qual.gpr()] = value;
            ExitAction::Resume
        }
        CrAccessType::Clts => {
            vcpu.set_guest_cr0(vcpu.state.cr0 & !CR0_TS);
            ExitAction::Resume
        }
        CrAccessType::Lmsw => {
            // LMSW updates CR0[3:0] and can never clear PE.
            let low = (qual.lmsw_source() as u64) & 0xf;
            let new = (vcpu.state.cr0 & !0xe) | (low & 0xe) | (vcpu.state.cr0 & CR0_PE) | (low & CR0_PE);
            vcpu.set_guest_cr0(new);
            ExitAction::Resume
        }
    };
    vcpu.advance_rip(exit);
    Ok(action)
}

fn write_cr0(vcpu: &mut Vcpu, exit: &ExitInfo, value: u64) -> Result<ExitAction> {
    let old = vcpu.state.cr0;

    // Architectural invariants: PG requires PE, CD=0 forbids NW=1.
    if value & CR0_PG != 0 && value & CR0_PE == 0
        || value & CR0_NW != 0 && value & CR0_CD == 0
    {
        vcpu.inject_exception(13, Some(0));
        return Ok(ExitAction::Resume);
    }
    // Enabling paging in IA-32e mode requires PAE.
    if value & CR0_PG != 0
        && vcpu.msrs.efer & EFER_LME != 0
        && vcpu.state.cr4 & CR4_PAE == 0
    {
        vcpu.inject_exception(13, Some(0));
        return Ok(ExitAction::Resume);
    }

    // Leaving protected mode without unrestricted guest needs the device
    // model's real-mode emulation.
    if old & CR0_PE != 0 && value & CR0_PE == 0 && !vcpu.unrestricted_guest() {
        vcpu.advance_rip(exit);
        vcpu.set_guest_cr0(value);
        vcpu.tunnel_exit(ExitStatus::RealMode);
        return Ok(ExitAction::ExitToUser(ExitStatus::RealMode));
    }

    // IA-32e activation/deactivation follows PG.
    if vcpu.msrs.efer & EFER_LME != 0 {
        if value & CR0_PG != 0 && old & CR0_PG == 0 {
            vcpu.set_guest_efer(vcpu.msrs.efer | EFER_LMA);
        } else if value & CR0_PG == 0 && old & CR0_PG != 0 {
            vcpu.set_guest_efer(vcpu.msrs.efer & !EFER_LMA);
        }
    }

    // Turning on PAE paging outside long mode reloads the PDPTE registers
    // from guest CR3.
    if value & CR0_PG != 0
        && vcpu.state.cr4 & CR4_PAE != 0
        && vcpu.msrs.efer & EFER_LMA == 0
    {
        let cr3 = vcpu.state.cr3;
        load_pae_pdptes(vcpu, cr3)?;
    }

    vcpu.set_guest_cr0(value);
    vcpu.advance_rip(exit);
    Ok(ExitAction::Resume)
}

fn write_cr4(vcpu: &mut Vcpu, exit: &ExitInfo, value: u64) -> Result<ExitAction> {
    let old = vcpu.state.cr4;

    // Clearing PAE in long mode is illegal.
    if old & CR4_PAE != 0 && value & CR4_PAE == 0 && vcpu.msrs.efer & EFER_LMA != 0 {
        vcpu.inject_exception(13, Some(0));
        return Ok(ExitAction::Resume);
    }
    // Setting PAE under active 32-bit paging reloads the PDPTEs.
    if value & CR4_PAE != 0
        && vcpu.state.cr0 & CR0_PG != 0
        && vcpu.msrs.efer & EFER_LMA == 0
    {
        let cr3 = vcpu.state.cr3;
        load_pae_pdptes(vcpu, cr3)?;
    }

    vcpu.set_guest_cr4(value);
    vcpu.advance_rip(exit);
    Ok(ExitAction::Resume)
}

/// Read the four PDPTE registers from guest CR3 (PAE mode) and stage them
/// into the VMCS.
fn load_pae_pdptes(vcpu: &mut Vcpu, cr3: u64) -> Result<()> {
    let mut pdptes = [0u64; 4];
    let base = cr3 & 0xffff_ffe0;
    for (i, slot) in pdptes.iter_mut().enumerate() {
        let mut buf = [0u8; 8];
        let gpa = Gpa::new(base + (i as u64) * 8).ok_or(crate::Error::InvalidParam)?;
        if vcpu.gpa_space().read_data(gpa, &mut buf)? != 8 {
            return Err(crate::Error::InvalidParam);
        }
        *slot = u64::from_le_bytes(buf);
    }
    vcpu.set_guest_pdptes(pdptes);
    Ok(())
}

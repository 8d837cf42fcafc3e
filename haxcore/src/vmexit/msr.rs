//! RDMSR/WRMSR exits.

use super::{ExitAction, ExitInfo};
use crate::vcpu::Vcpu;
use crate::vmx::entry::gpr;
use crate::Result;
use haxhal::x86;

/// Guest-visible MSR state of one vCPU. Loaded/stored around guest entry
/// where the VMCS does not carry the value itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct GuestMsrs {
    pub efer: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sf_mask: u64,
    pub kernel_gs_base: u64,
    pub tsc_offset: u64,
    pub apic_base: u64,
    pub pat: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub misc_enable: u64,
    pub mtrr_def_type: u64,
    pub mtrr_fixed: [u64; 11],
    pub mtrr_var: [u64; 16],
}

impl GuestMsrs {
    /// Reset-time values.
    pub fn at_reset() -> Self {
        Self {
            // xAPIC enabled at the architectural default base, BSP bit set.
            apic_base: 0xfee0_0000 | (1 << 11) | (1 << 8),
            pat: 0x0007_0406_0007_0406,
            misc_enable: 1,
            ..Self::default()
        }
    }
}

const MTRR_PHYS_BASE0: u32 = 0x200;
const MTRR_PHYS_MASK15: u32 = 0x21f;
const MTRR_FIX64K_00000: u32 = 0x250;
const MTRR_FIX16K_80000: u32 = 0x258;
const MTRR_FIX16K_A0000: u32 = 0x259;
const MTRR_FIX4K_C0000: u32 = 0x268;
const MTRR_FIX4K_F8000: u32 = 0x26f;
const MTRR_CAP: u32 = 0xfe;
const MTRR_DEF_TYPE: u32 = 0x2ff;
const MCG_CAP: u32 = 0x179;
const MCG_STATUS: u32 = 0x17a;
const MCG_CTL: u32 = 0x17b;
const MC0_CTL: u32 = 0x400;
const MC4_MISC: u32 = 0x413;
const BIOS_SIGN_ID: u32 = 0x8b;

fn mtrr_fixed_index(msr: u32) -> Option<usize> {
    match msr {
        MTRR_FIX64K_00000 => Some(0),
        MTRR_FIX16K_80000..=MTRR_FIX16K_A0000 => Some(1 + (msr - MTRR_FIX16K_80000) as usize),
        MTRR_FIX4K_C0000..=MTRR_FIX4K_F8000 => Some(3 + (msr - MTRR_FIX4K_C0000) as usize),
        _ => None,
    }
}

/// Read one guest MSR; `None` means "unknown, inject #GP".
pub fn read_msr(vcpu: &Vcpu, msr: u32) -> Option<u64> {
    let msrs = &vcpu.msrs;
    Some(match msr {
        x86::IA32_TSC => unsafe { core::arch::x86_64::_rdtsc() }.wrapping_add(msrs.tsc_offset),
        x86::IA32_EFER => msrs.efer,
        x86::IA32_STAR => msrs.star,
        x86::IA32_LSTAR => msrs.lstar,
        x86::IA32_CSTAR => msrs.cstar,
        x86::IA32_SF_MASK => msrs.sf_mask,
        x86::IA32_KERNEL_GS_BASE => msrs.kernel_gs_base,
        x86::IA32_APIC_BASE => msrs.apic_base,
        x86::IA32_PAT => msrs.pat,
        x86::IA32_SYSENTER_CS => msrs.sysenter_cs,
        x86::IA32_SYSENTER_ESP => msrs.sysenter_esp,
        x86::IA32_SYSENTER_EIP => msrs.sysenter_eip,
        x86::IA32_FS_BASE => vcpu.state.fs.base,
        x86::IA32_GS_BASE => vcpu.state.gs.base,
        x86::IA32_MISC_ENABLE => msrs.misc_enable,
        BIOS_SIGN_ID => 0,
        // Fixed-range + 16 variable-range MTRRs, write-back default.
        MTRR_CAP => 0x508,
        MTRR_DEF_TYPE => msrs.mtrr_def_type,
        m @ MTRR_PHYS_BASE0..=MTRR_PHYS_MASK15 => msrs.mtrr_var[(m - MTRR_PHYS_BASE0) as usize >> 1],
        m if mtrr_fixed_index(m).is_some() => msrs.mtrr_fixed[mtrr_fixed_index(m).unwrap()],
        // Machine-check banks read as zero.
        MCG_CAP | MCG_STATUS | MCG_CTL => 0,
        m @ MC0_CTL..=MC4_MISC => {
            let _ = m;
            0
        }
        _ => return None,
    })
}

/// Write one guest MSR; `false` means "unknown, inject #GP".
pub fn write_msr(vcpu: &mut Vcpu, msr: u32, value: u64) -> bool {
    match msr {
        x86::IA32_TSC => {
            vcpu.msrs.tsc_offset =
                value.wrapping_sub(unsafe { core::arch::x86_64::_rdtsc() });
        }
        x86::IA32_EFER => vcpu.set_guest_efer(value),
        x86::IA32_STAR => vcpu.msrs.star = value,
        x86::IA32_LSTAR => vcpu.msrs.lstar = value,
        x86::IA32_CSTAR => vcpu.msrs.cstar = value,
        x86::IA32_SF_MASK => vcpu.msrs.sf_mask = value,
        x86::IA32_KERNEL_GS_BASE => vcpu.msrs.kernel_gs_base = value,
        x86::IA32_APIC_BASE => {
            // Only the enable bit may move; the base stays at the default.
            vcpu.msrs.apic_base = (vcpu.msrs.apic_base & !(1 << 11)) | (value & (1 << 11));
        }
        x86::IA32_PAT => vcpu.msrs.pat = value,
        x86::IA32_SYSENTER_CS => vcpu.msrs.sysenter_cs = value,
        x86::IA32_SYSENTER_ESP => vcpu.msrs.sysenter_esp = value,
        x86::IA32_SYSENTER_EIP => vcpu.msrs.sysenter_eip = value,
        x86::IA32_FS_BASE => {
            vcpu.state.fs.base = value;
            vcpu.stage_fs_base();
        }
        x86::IA32_GS_BASE => {
            vcpu.state.gs.base = value;
            vcpu.stage_gs_base();
        }
        x86::IA32_MISC_ENABLE => {}
        BIOS_SIGN_ID => {}
        MTRR_DEF_TYPE => vcpu.msrs.mtrr_def_type = value,
        m @ MTRR_PHYS_BASE0..=MTRR_PHYS_MASK15 => {
            vcpu.msrs.mtrr_var[(m - MTRR_PHYS_BASE0) as usize >> 1] = value;
        }
        m if mtrr_fixed_index(m).is_some() => {
            vcpu.msrs.mtrr_fixed[mtrr_fixed_index(m).unwrap()] = value;
        }
        MCG_CAP | MCG_STATUS | MCG_CTL => {}
        m if (MC0_CTL..=MC4_MISC).contains(&m) => {}
        _ => return false,
    }
    true
}

pub fn handle_rdmsr(vcpu: &mut Vcpu, exit: &ExitInfo) -> Result<ExitAction> {
    let msr = vcpu.state.gprs.regs[gpr::RCX] as u32;
    match read_msr(vcpu, msr) {
        Some(value) => {
            vcpu.state.gprs.regs[gpr::RAX] = value & 0xffff_ffff;
            vcpu.state.gprs.regs[gpr::RDX] = value >> 32;
            vcpu.advance_rip(exit);
        }
        None => {
            warning!("vcpu {}: rdmsr of unknown 0x{:x}", vcpu.vcpu_id, msr);
            vcpu.inject_exception(13, Some(0));
        }
    }
    Ok(ExitAction::Resume)
}

pub fn handle_wrmsr(vcpu: &mut Vcpu, exit: &ExitInfo) -> Result<ExitAction> {
    let msr = vcpu.state.gprs.regs[gpr::RCX] as u32;
    let value = (vcpu.state.gprs.regs[gpr::RDX] << 32)
        | (vcpu.state.gprs.regs[gpr::RAX] & 0xffff_ffff);
    if write_msr(vcpu, msr, value) {
        vcpu.advance_rip(exit);
    } else {
        warning!("vcpu {}: wrmsr of unknown 0x{:x}", vcpu.vcpu_id, msr);
        vcpu.inject_exception(13, Some(0));
    }
    Ok(ExitAction::Resume)
}

//! INVEPT broadcast.

use super::Eptp;
use crate::probe::{self, EptVpidCaps};
use crate::vmx::percpu::{self, ResultSlots};
use crate::vmx::VmxResult;
use crate::Result;
use core::arch::asm;
use core::sync::atomic::Ordering;
use haxhal::host::host;

/// INVEPT invalidation scope.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u64)]
pub enum InveptType {
    /// Flush translations derived from one EPTP.
    SingleContext = 1,
    /// Flush translations of every EPT context.
    AllContext = 2,
}

#[repr(C)]
struct InveptDesc {
    eptp: u64,
    reserved: u64,
}

/// Execute INVEPT on the calling pCPU (which must be in VMX root).
unsafe fn asm_invept(ty: InveptType, desc: &InveptDesc) -> VmxResult {
    let (cf, zf): (u8, u8);
    asm!(
        "invept {}, [{}]",
        "setc {}",
        "setz {}",
        in(reg) ty as u64,
        in(reg) desc,
        out(reg_byte) cf,
        out(reg_byte) zf,
    );
    VmxResult::from_flags(cf, zf)
}

/// Pick the widest-preferred supported invalidation type: single-context
/// when the capability bit is set, otherwise all-contexts. The ratified
/// capabilities guarantee at least all-contexts support.
pub fn preferred_type() -> InveptType {
    if probe::ept_caps().contains(EptVpidCaps::INVEPT_SINGLE_CONTEXT) {
        InveptType::SingleContext
    } else {
        InveptType::AllContext
    }
}

/// IPI every online pCPU to flush EPT-derived translations for `eptp`.
///
/// The callbacks store their INVEPT result into the per-pCPU result slots
/// (the host logger is off-limits in IPI context); the initiator scans the
/// slots and logs failures once the broadcast has completed.
pub fn invept(eptp: Eptp, ty: InveptType) -> Result<()> {
    match ty {
        InveptType::SingleContext | InveptType::AllContext => {}
    }
    let desc = InveptDesc {
        eptp: match ty {
            InveptType::SingleContext => eptp.raw(),
            InveptType::AllContext => 0,
        },
        reserved: 0,
    };

    for cpu in 0..percpu::cpu_count() {
        percpu::results(cpu).invept_res.store(-1, Ordering::Release);
    }

    host().broadcast(&|| {
        let pcpu = unsafe { percpu::current() };
        let slot = &percpu::results(pcpu.cpu_id).invept_res;
        if percpu::vmxroot_enter(pcpu).is_err() {
            ResultSlots::record(slot, VmxResult::FailInvalid);
            return;
        }
        let r = unsafe { asm_invept(ty, &desc) };
        ResultSlots::record(slot, r);
        percpu::vmxroot_leave(pcpu);
    });

    for cpu in 0..percpu::cpu_count() {
        match percpu::results(cpu).invept_res.load(Ordering::Acquire) {
            0 => {}
            -1 => warning!("invept: pCPU {} did not run the callback", cpu),
            r => error!("invept: pCPU {} failed: result {}", cpu, r),
        }
    }
    Ok(())
}

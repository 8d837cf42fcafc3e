//! VM-exit dispatch.
//!
//! The exit state is snapshotted from the VMCS while it is still loaded
//! (`ExitInfo`), the VMCS is put, and only then does the dispatcher run:
//! handlers operate on the snapshot plus the cached vCPU state, and stage
//! guest-state changes as pending VMCS writes applied on the next entry.

pub mod cr;
pub mod dr;
pub mod io;
pub mod msr;

use crate::tunnel::ExitStatus;
use crate::vcpu::Vcpu;
use crate::vmx::controls::{EptViolationQual, InterruptionInfo, Interruptibility};
use crate::{Error, Result};
use num_enum::TryFromPrimitive;

/// Basic exit reasons (Intel SDM Vol. 3D, Appendix C).
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum BasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    Sipi = 4,
    IoSmi = 5,
    OtherSmi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmxoff = 26,
    Vmxon = 27,
    CrAccess = 28,
    DrAccess = 29,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    EntryFailGuestState = 33,
    EntryFailMsrLoading = 34,
    Mwait = 36,
    MonitorTrapFlag = 37,
    Monitor = 39,
    Pause = 40,
    EntryFailMachineCheck = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    GdtrIdtrAccess = 46,
    LdtrTrAccess = 47,
    EptViolation = 48,
    EptMisconfig = 49,
    Invept = 50,
    Rdtscp = 51,
    PreemptionTimer = 52,
    Invvpid = 53,
    Wbinvd = 54,
    Xsetbv = 55,
}

const NR_EXIT_REASONS: usize = 64;

/// Exit state captured from the VMCS before `put_vmcs`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExitInfo {
    /// Raw exit-reason field (entry-failure bit included).
    pub reason: u32,
    pub qualification: u64,
    pub guest_physical: u64,
    pub guest_linear: u64,
    pub intr_info: InterruptionInfo,
    pub intr_error_code: u32,
    pub idt_vectoring: InterruptionInfo,
    pub idt_error_code: u32,
    pub instruction_length: u32,
    pub interruptibility: u32,
}

impl ExitInfo {
    /// Basic reason number, bits 15:0.
    #[inline]
    pub fn basic(&self) -> u16 {
        self.reason as u16
    }

    /// Whether the exit reflects a failed VM entry (bit 31).
    #[inline]
    pub fn is_entry_failure(&self) -> bool {
        self.reason & (1 << 31) != 0
    }

    /// Typed interruptibility state.
    #[inline]
    pub fn interruptibility(&self) -> Interruptibility {
        Interruptibility::from_bits_truncate(self.interruptibility)
    }
}

/// What the dispatcher should do after a handler ran.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitAction {
    /// Re-enter the guest.
    Resume,
    /// Surface the exit recorded in the tunnel to user space.
    ExitToUser(ExitStatus),
}

/// Uniform handler signature.
pub type Handler = fn(&mut Vcpu, &ExitInfo) -> Result<ExitAction>;

/// Unknown reasons land here: architecture bugs, not guest bugs.
fn null_handler(vcpu: &mut Vcpu, exit: &ExitInfo) -> Result<ExitAction> {
    error!(
        "vcpu {}: unhandled exit reason {} (qual 0x{:x})",
        vcpu.vcpu_id,
        exit.basic(),
        exit.qualification
    );
    vcpu.set_panicked();
    Ok(ExitAction::ExitToUser(ExitStatus::StateChange))
}

const fn build_table() -> [Handler; NR_EXIT_REASONS] {
    let mut t = [null_handler as Handler; NR_EXIT_REASONS];
    t[BasicExitReason::ExceptionOrNmi as usize] = handle_exception_nmi;
    t[BasicExitReason::ExternalInterrupt as usize] = handle_external_interrupt;
    t[BasicExitReason::TripleFault as usize] = handle_triple_fault;
    t[BasicExitReason::InterruptWindow as usize] = handle_interrupt_window;
    t[BasicExitReason::NmiWindow as usize] = handle_interrupt_window;
    t[BasicExitReason::Cpuid as usize] = handle_cpuid;
    t[BasicExitReason::Hlt as usize] = handle_hlt;
    t[BasicExitReason::Invlpg as usize] = handle_invlpg;
    t[BasicExitReason::CrAccess as usize] = cr::handle_cr_access;
    t[BasicExitReason::DrAccess as usize] = dr::handle_dr_access;
    t[BasicExitReason::IoInstruction as usize] = io::handle_io;
    t[BasicExitReason::Rdmsr as usize] = msr::handle_rdmsr;
    t[BasicExitReason::Wrmsr as usize] = msr::handle_wrmsr;
    t[BasicExitReason::EntryFailGuestState as usize] = handle_invalid_guest_state;
    t[BasicExitReason::EptViolation as usize] = handle_ept_violation;
    t[BasicExitReason::EptMisconfig as usize] = handle_ept_misconfig;
    t
}

/// Dense handler table indexed by basic reason.
pub static HANDLER_TABLE: [Handler; NR_EXIT_REASONS] = build_table();

/// Route one exit.
pub fn dispatch(vcpu: &mut Vcpu, exit: &ExitInfo) -> Result<ExitAction> {
    let basic = exit.basic() as usize;
    if exit.is_entry_failure() {
        error!(
            "vcpu {}: VM-entry failure, basic reason {}",
            vcpu.vcpu_id, basic
        );
        vcpu.set_panicked();
        return Ok(ExitAction::ExitToUser(ExitStatus::StateChange));
    }
    let handler = HANDLER_TABLE
        .get(basic)
        .copied()
        .unwrap_or(null_handler as Handler);
    handler(vcpu, exit)
}

// -- simple per-reason handlers ---------------------------------------------

fn handle_exception_nmi(vcpu: &mut Vcpu, exit: &ExitInfo) -> Result<ExitAction> {
    let info = exit.intr_info;
    if !info.is_valid() {
        return Ok(ExitAction::Resume);
    }
    use crate::vmx::controls::EventType;
    if info.event_type() == EventType::Nmi {
        // Forward the NMI to the host.
        unsafe { core::arch::asm!("int 2", options(nostack)) };
        return Ok(ExitAction::Resume);
    }
    match info.vector() {
        // #NM: the guest touched the FPU; hand it back.
        7 => {
            vcpu.clear_cr0_ts();
            Ok(ExitAction::Resume)
        }
        // #MC is host-fatal for this guest.
        18 => {
            error!("vcpu {}: machine check in guest", vcpu.vcpu_id);
            vcpu.set_panicked();
            Ok(ExitAction::ExitToUser(ExitStatus::StateChange))
        }
        // #DB / #BP belong to the guest debugger when armed.
        1 | 3 if vcpu.debug_armed() => {
            vcpu.report_debug_exit(exit);
            Ok(ExitAction::ExitToUser(ExitStatus::Debug))
        }
        vector => {
            // Everything else is reflected back into the guest.
            let error_code = info.has_error_code().then_some(exit.intr_error_code);
            vcpu.inject_exception(vector, error_code);
            Ok(ExitAction::Resume)
        }
    }
}

fn handle_external_interrupt(vcpu: &mut Vcpu, _exit: &ExitInfo) -> Result<ExitAction> {
    // The host vector was delivered when interrupts were re-enabled after
    // the exit; user space just gets a chance to run.
    vcpu.tunnel_exit(ExitStatus::Interrupt);
    Ok(ExitAction::ExitToUser(ExitStatus::Interrupt))
}

fn handle_triple_fault(vcpu: &mut Vcpu, _exit: &ExitInfo) -> Result<ExitAction> {
    error!(
        "vcpu {}: triple fault at rip 0x{:x}",
        vcpu.vcpu_id, vcpu.state.rip
    );
    vcpu.set_panicked();
    Ok(ExitAction::ExitToUser(ExitStatus::StateChange))
}

fn handle_interrupt_window(vcpu: &mut Vcpu, _exit: &ExitInfo) -> Result<ExitAction> {
    // The window is open; the pending event goes in on the next entry.
    vcpu.clear_interrupt_window_request();
    Ok(ExitAction::Resume)
}

fn handle_cpuid(vcpu: &mut Vcpu, exit: &ExitInfo) -> Result<ExitAction> {
    use crate::vmx::entry::gpr;
    let function = vcpu.state.gprs.regs[gpr::RAX] as u32;
    let index = vcpu.state.gprs.regs[gpr::RCX] as u32;
    let out = vcpu.guest_cpuid(function, index);
    vcpu.state.gprs.regs[gpr::RAX] = out.eax as u64;
    vcpu.state.gprs.regs[gpr::RBX] = out.ebx as u64;
    vcpu.state.gprs.regs[gpr::RCX] = out.ecx as u64;
    vcpu.state.gprs.regs[gpr::RDX] = out.edx as u64;
    vcpu.advance_rip(exit);
    Ok(ExitAction::Resume)
}

fn handle_hlt(vcpu: &mut Vcpu, exit: &ExitInfo) -> Result<ExitAction> {
    vcpu.advance_rip(exit);
    if vcpu.has_pending_interrupt() {
        return Ok(ExitAction::Resume);
    }
    vcpu.tunnel_exit(ExitStatus::Hlt);
    Ok(ExitAction::ExitToUser(ExitStatus::Hlt))
}

fn handle_invlpg(vcpu: &mut Vcpu, exit: &ExitInfo) -> Result<ExitAction> {
    // Linear translations are EPT-tagged; only the fetch cache can go
    // stale.
    vcpu.invalidate_fetch_cache();
    vcpu.advance_rip(exit);
    Ok(ExitAction::Resume)
}

fn handle_invalid_guest_state(vcpu: &mut Vcpu, _exit: &ExitInfo) -> Result<ExitAction> {
    error!("vcpu {}: VM entry rejected the guest state", vcpu.vcpu_id);
    vcpu.set_panicked();
    Ok(ExitAction::ExitToUser(ExitStatus::StateChange))
}

fn handle_ept_violation(vcpu: &mut Vcpu, exit: &ExitInfo) -> Result<ExitAction> {
    use crate::ept::fault::{self, Violation};
    let qual = EptViolationQual::from_raw(exit.qualification);
    let gpa = crate::memory::Gpa::new(exit.guest_physical).ok_or(Error::InvalidParam)?;
    match fault::handle_access_violation(vcpu.gpa_space(), vcpu.ept_tree(), qual, gpa) {
        Ok(Violation::Filled(_)) => Ok(ExitAction::Resume),
        Ok(Violation::Mmio) => vcpu.handle_mmio_exit(exit, gpa),
        Err(Error::ProtectedPage(gfn)) => {
            vcpu.report_protection_fault(gfn, qual);
            Ok(ExitAction::ExitToUser(ExitStatus::PageFault))
        }
        Err(e) => Err(e),
    }
}

fn handle_ept_misconfig(vcpu: &mut Vcpu, exit: &ExitInfo) -> Result<ExitAction> {
    use crate::ept::fault;
    let gpa = crate::memory::Gpa::new(exit.guest_physical).ok_or(Error::InvalidParam)?;
    let fixed = fault::handle_misconfiguration(
        vcpu.gpa_space(),
        vcpu.ept_tree(),
        gpa,
        crate::cpuid::paging_reserved_mask(),
    )?;
    if fixed == 0 {
        error!(
            "vcpu {}: unfixable EPT misconfiguration at gpa 0x{:x}",
            vcpu.vcpu_id, exit.guest_physical
        );
        vcpu.set_panicked();
        return Ok(ExitAction::ExitToUser(ExitStatus::StateChange));
    }
    Ok(ExitAction::Resume)
}

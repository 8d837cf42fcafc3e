//! Guest entry/exit: register block, host-state save, and the VMX run shim.

use core::arch::{asm, naked_asm};
use haxhal::x86::{self, HostSelectors, Msr};

/// Guest general-purpose registers, indexable by the x86 register number
/// used in exit qualifications and ModRM encodings (0 = RAX ... 15 = R15).
/// The RSP slot (4) is a placeholder: the architectural guest RSP lives in
/// the VMCS. Guest CR2 rides along because it must be swapped around the
/// world switch.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct GuestGprs {
    pub regs: [u64; 16],
    pub cr2: u64,
}

/// x86 register numbers.
#[allow(missing_docs)]
pub mod gpr {
    pub const RAX: usize = 0;
    pub const RCX: usize = 1;
    pub const RDX: usize = 2;
    pub const RBX: usize = 3;
    pub const RSP: usize = 4;
    pub const RBP: usize = 5;
    pub const RSI: usize = 6;
    pub const RDI: usize = 7;
}

impl GuestGprs {
    /// Read register `index` truncated to `size` bytes.
    pub fn read_sized(&self, index: usize, size: u8) -> u64 {
        let v = self.regs[index];
        match size {
            1 => v & 0xff,
            2 => v & 0xffff,
            4 => v & 0xffff_ffff,
            _ => v,
        }
    }

    /// Write register `index` with `size`-byte semantics: 8/16-bit writes
    /// merge, 32-bit writes zero-extend, 64-bit writes replace.
    pub fn write_sized(&mut self, index: usize, size: u8, value: u64) {
        let old = self.regs[index];
        self.regs[index] = match size {
            1 => (old & !0xff) | (value & 0xff),
            2 => (old & !0xffff) | (value & 0xffff),
            4 => value & 0xffff_ffff,
            _ => value,
        };
    }
}

/// Host state not covered by the VMCS host-state area, saved before each
/// guest entry and restored after the exit.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostState {
    pub selectors: HostSelectors,
    pub fs_base: u64,
    pub gs_base: u64,
    pub kernel_gs_base: u64,
    /// DS/ES carried an LDT selector or non-zero RPL and must be reloaded
    /// by hand after the exit (the VMCS restores only the base fields).
    pub fix_ds: bool,
    pub fix_es: bool,
}

#[inline]
fn selector_needs_fix(sel: u16) -> bool {
    // TI (LDT) bit or non-zero RPL: VM exit loads a null-based flat
    // selector image, so the original must be put back explicitly. Dead on
    // hosts without LDT-based TLS, kept for bug-compatible behavior.
    sel & 0x7 != 0
}

impl HostState {
    /// Capture the current pCPU's volatile host state.
    pub fn capture() -> Self {
        let selectors = HostSelectors::read();
        Self {
            selectors,
            fs_base: Msr::<{ x86::IA32_FS_BASE }>::read(),
            gs_base: Msr::<{ x86::IA32_GS_BASE }>::read(),
            kernel_gs_base: Msr::<{ x86::IA32_KERNEL_GS_BASE }>::read(),
            fix_ds: selector_needs_fix(selectors.ds),
            fix_es: selector_needs_fix(selectors.es),
        }
    }

    /// Restore what the VM exit did not.
    ///
    /// # Safety
    /// Must run on the pCPU [`HostState::capture`] ran on, with preemption
    /// still disabled.
    pub unsafe fn restore(&self) {
        if self.fix_ds {
            asm!("mov ds, {0:x}", in(reg) self.selectors.ds, options(nostack));
        }
        if self.fix_es {
            asm!("mov es, {0:x}", in(reg) self.selectors.es, options(nostack));
        }
        Msr::<{ x86::IA32_FS_BASE }>::write(self.fs_base);
        Msr::<{ x86::IA32_GS_BASE }>::write(self.gs_base);
        Msr::<{ x86::IA32_KERNEL_GS_BASE }>::write(self.kernel_gs_base);
    }
}

/// Result of [`asm_vmxrun`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum VmxRunResult {
    /// The guest ran and exited; the exit state is in the VMCS.
    Exited = 0,
    /// VMWRITE of the host RSP failed before entry.
    HostRspFail = 1,
    /// VMLAUNCH/VMRESUME fell through; consult the instruction error.
    EntryFail = 2,
}

impl VmxRunResult {
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            0 => VmxRunResult::Exited,
            1 => VmxRunResult::HostRspFail,
            _ => VmxRunResult::EntryFail,
        }
    }
}

/// World switch: load guest GPRs/CR2, VMLAUNCH or VMRESUME, and on exit
/// store them back. `launched` selects VMRESUME (non-zero) over VMLAUNCH.
///
/// # Safety
/// The calling pCPU must hold the target vCPU's VMCS as current, with
/// interrupts and preemption disabled, and all guest-state/control fields
/// valid for entry.
#[unsafe(naked)]
pub unsafe extern "C" fn asm_vmxrun(_gprs: *mut GuestGprs, _launched: u64) -> u8 {
    naked_asm!(
        // Callee-saved host registers.
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // The register block pointer, recovered by the exit stub.
        "push rdi",
        "clc",
        "mov rax, 0x6c14", // Field::HostRsp
        "vmwrite rax, rsp",
        "setna al",
        "cmp al, 0",
        "je 2f",
        // Host-RSP write failed: unwind and report.
        "pop rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "mov al, 1",
        "ret",
        "2:",
        "cmp rsi, 0",
        // Guest CR2 and GPRs (RSP comes from the VMCS; RDI goes last).
        "mov rax, [rdi + 0x80]",
        "mov cr2, rax",
        "mov rax, [rdi + 0x00]",
        "mov rcx, [rdi + 0x08]",
        "mov rdx, [rdi + 0x10]",
        "mov rbx, [rdi + 0x18]",
        "mov rbp, [rdi + 0x28]",
        "mov rsi, [rdi + 0x30]",
        "mov r8,  [rdi + 0x40]",
        "mov r9,  [rdi + 0x48]",
        "mov r10, [rdi + 0x50]",
        "mov r11, [rdi + 0x58]",
        "mov r12, [rdi + 0x60]",
        "mov r13, [rdi + 0x68]",
        "mov r14, [rdi + 0x70]",
        "mov r15, [rdi + 0x78]",
        "mov rdi, [rdi + 0x38]",
        "je 3f",
        "vmresume",
        "jmp 4f",
        "3:",
        "vmlaunch",
        "4:",
        // Only reached when entry itself failed.
        "pop rdi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "mov al, 2",
        "ret",
    )
}

/// VM-exit landing point (the VMCS `HostRip`). Stores the guest registers
/// into the block pushed by [`asm_vmxrun`] and returns 0 from it.
#[unsafe(naked)]
pub unsafe extern "C" fn asm_vmexit_handler() {
    naked_asm!(
        // Stack: [rsp] = regs ptr, then saved host callee regs.
        "sub rsp, 8",
        "mov [rsp], rdi",       // park guest RDI
        "mov rdi, [rsp + 8]",   // regs ptr
        "mov [rdi + 0x00], rax",
        "mov rax, cr2",
        "mov [rdi + 0x80], rax",
        "mov [rdi + 0x08], rcx",
        "mov [rdi + 0x10], rdx",
        "mov [rdi + 0x18], rbx",
        "mov [rdi + 0x28], rbp",
        "mov [rdi + 0x30], rsi",
        "mov [rdi + 0x40], r8",
        "mov [rdi + 0x48], r9",
        "mov [rdi + 0x50], r10",
        "mov [rdi + 0x58], r11",
        "mov [rdi + 0x60], r12",
        "mov [rdi + 0x68], r13",
        "mov [rdi + 0x70], r14",
        "mov [rdi + 0x78], r15",
        "mov rax, [rsp]",
        "mov [rdi + 0x38], rax", // guest RDI
        "add rsp, 16",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "xor rax, rax",
        "ret",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sized_register_writes() {
        let mut gprs = GuestGprs::default();
        gprs.regs[gpr::RAX] = 0x1122_3344_5566_7788;
        // 8-bit write merges into AL only.
        gprs.write_sized(gpr::RAX, 1, 0xab);
        assert_eq!(gprs.regs[gpr::RAX], 0x1122_3344_5566_77ab);
        // 16-bit write merges into AX.
        gprs.write_sized(gpr::RAX, 2, 0xcdef);
        assert_eq!(gprs.regs[gpr::RAX], 0x1122_3344_5566_cdef);
        // 32-bit write zero-extends.
        gprs.write_sized(gpr::RAX, 4, 0x9999_8888);
        assert_eq!(gprs.regs[gpr::RAX], 0x9999_8888);
        // 64-bit write replaces.
        gprs.write_sized(gpr::RAX, 8, u64::MAX);
        assert_eq!(gprs.regs[gpr::RAX], u64::MAX);
    }

    #[test]
    fn sized_register_reads() {
        let mut gprs = GuestGprs::default();
        gprs.regs[gpr::RDX] = 0xaabb_ccdd_eeff_0011;
        assert_eq!(gprs.read_sized(gpr::RDX, 1), 0x11);
        assert_eq!(gprs.read_sized(gpr::RDX, 2), 0x0011);
        assert_eq!(gprs.read_sized(gpr::RDX, 4), 0xeeff_0011);
        assert_eq!(gprs.read_sized(gpr::RDX, 8), 0xaabb_ccdd_eeff_0011);
    }
}

//! VM-execution control words and exit descriptors.
//!
//! Every ISA-defined bit field travels as a typed wrapper; raw `u64`s from
//! VMREAD never reach handler logic undecoded. See Intel SDM Vol. 3C,
//! chapters 24-28 for the field definitions.

bitflags::bitflags! {
    /// Pin-based VM-execution controls (SDM Table 24-5).
    pub struct PinBasedCtls: u32 {
        /// External interrupts cause VM exits.
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        /// NMIs cause VM exits.
        const NMI_EXITING = 1 << 3;
        /// NMIs are never blocked; virtual-NMI blocking is tracked in the
        /// interruptibility state.
        const VIRTUAL_NMIS = 1 << 5;
        /// The VMX-preemption timer counts down in non-root operation.
        const ACTIVE_VMX_PREEMPTION_TIMER = 1 << 6;
        /// Posted-interrupt processing.
        const PROCESS_POSTED_INTERRUPT = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Primary processor-based VM-execution controls (SDM Table 24-6).
    pub struct PrimaryCtls: u32 {
        /// VM exit at the first instruction with RFLAGS.IF = 1 and no
        /// interrupt blocking.
        const INTERRUPT_WINDOW_EXITING = 1 << 2;
        /// RDTSC/RDTSCP/IA32_TIME_STAMP_COUNTER reads honor the TSC offset.
        const USE_TSC_OFFSETTING = 1 << 3;
        /// HLT causes VM exits.
        const HLT_EXITING = 1 << 7;
        /// INVLPG causes VM exits.
        const INVLPG_EXITING = 1 << 9;
        /// MWAIT causes VM exits.
        const MWAIT_EXITING = 1 << 10;
        /// RDPMC causes VM exits.
        const RDPMC_EXITING = 1 << 11;
        /// RDTSC causes VM exits.
        const RDTSC_EXITING = 1 << 12;
        /// MOV to CR3 causes VM exits.
        const CR3_LOAD_EXITING = 1 << 15;
        /// MOV from CR3 causes VM exits.
        const CR3_STORE_EXITING = 1 << 16;
        /// MOV to CR8 causes VM exits.
        const CR8_LOAD_EXITING = 1 << 19;
        /// MOV from CR8 causes VM exits.
        const CR8_STORE_EXITING = 1 << 20;
        /// TPR virtualization.
        const USE_TPR_SHADOW = 1 << 21;
        /// VM exit at the first instruction without virtual-NMI blocking.
        const NMI_WINDOW_EXITING = 1 << 22;
        /// MOV DR causes VM exits.
        const MOV_DR_EXITING = 1 << 23;
        /// I/O instructions cause VM exits unconditionally.
        const UNCOND_IO_EXITING = 1 << 24;
        /// I/O bitmaps restrict I/O exiting.
        const USE_IO_BITMAPS = 1 << 25;
        /// Monitor trap flag.
        const MONITOR_TRAP_FLAG = 1 << 27;
        /// MSR bitmaps restrict RDMSR/WRMSR exiting.
        const USE_MSR_BITMAPS = 1 << 28;
        /// MONITOR causes VM exits.
        const MONITOR_EXITING = 1 << 29;
        /// PAUSE causes VM exits.
        const PAUSE_EXITING = 1 << 30;
        /// The secondary controls are consulted.
        const ACTIVATE_SECONDARY_CTLS = 1 << 31;
    }
}

bitflags::bitflags! {
    /// Secondary processor-based VM-execution controls (SDM Table 24-7).
    pub struct SecondaryCtls: u32 {
        /// Accesses to the APIC-access page are treated specially.
        const VIRTUALIZE_APIC_ACCESSES = 1 << 0;
        /// Extended page tables are enabled.
        const ENABLE_EPT = 1 << 1;
        /// Descriptor-table instructions cause VM exits.
        const DESCRIPTOR_TABLE_EXITING = 1 << 2;
        /// RDTSCP does not #UD.
        const ENABLE_RDTSCP = 1 << 3;
        /// Cached linear translations are tagged with a VPID.
        const ENABLE_VPID = 1 << 5;
        /// WBINVD causes VM exits.
        const WBINVD_EXITING = 1 << 6;
        /// Guest may run in unpaged protected or real-address mode.
        const UNRESTRICTED_GUEST = 1 << 7;
        /// A PAUSE loop can cause VM exits.
        const PAUSE_LOOP_EXITING = 1 << 10;
        /// INVPCID does not #UD.
        const ENABLE_INVPCID = 1 << 12;
        /// VMCS shadowing.
        const VMCS_SHADOWING = 1 << 14;
        /// XSAVES/XRSTORS do not #UD.
        const ENABLE_XSAVES_XRSTORS = 1 << 20;
    }
}

bitflags::bitflags! {
    /// VM-entry controls (SDM Table 24-15).
    pub struct EntryCtls: u32 {
        /// DR7 and IA32_DEBUGCTL are loaded on entry.
        const LOAD_DEBUG_CTLS = 1 << 2;
        /// The processor is in IA-32e mode after entry.
        const IA32E_MODE_GUEST = 1 << 9;
        /// Entry to SMM.
        const ENTRY_TO_SMM = 1 << 10;
        /// Default SMI/SMM treatment after entry.
        const DEACTIVATE_DUAL_MONITOR = 1 << 11;
        /// IA32_PERF_GLOBAL_CTRL is loaded on entry.
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 13;
        /// IA32_PAT is loaded on entry.
        const LOAD_IA32_PAT = 1 << 14;
        /// IA32_EFER is loaded on entry.
        const LOAD_IA32_EFER = 1 << 15;
    }
}

bitflags::bitflags! {
    /// VM-exit controls (SDM Table 24-13).
    pub struct ExitCtls: u32 {
        /// DR7 and IA32_DEBUGCTL are saved on exit.
        const SAVE_DEBUG_CTLS = 1 << 2;
        /// The processor is in 64-bit mode after exit.
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        /// IA32_PERF_GLOBAL_CTRL is loaded on exit.
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 12;
        /// Acknowledge the interrupt controller on external-interrupt exits
        /// so the vector lands in the exit interruption-information field.
        const ACK_INTR_ON_EXIT = 1 << 15;
        /// IA32_PAT is saved on exit.
        const SAVE_IA32_PAT = 1 << 18;
        /// IA32_PAT is loaded on exit.
        const LOAD_IA32_PAT = 1 << 19;
        /// IA32_EFER is saved on exit.
        const SAVE_IA32_EFER = 1 << 20;
        /// IA32_EFER is loaded on exit.
        const LOAD_IA32_EFER = 1 << 21;
        /// The preemption timer is saved on exit.
        const SAVE_PREEMPTION_TIMER = 1 << 22;
    }
}

bitflags::bitflags! {
    /// Guest interruptibility state (SDM Table 24-3).
    pub struct Interruptibility: u32 {
        /// Blocking by STI.
        const STI_BLOCKING = 1 << 0;
        /// Blocking by MOV SS.
        const MOV_SS_BLOCKING = 1 << 1;
        /// Blocking by SMI.
        const SMI_BLOCKING = 1 << 2;
        /// Blocking by NMI.
        const NMI_BLOCKING = 1 << 3;
    }
}

/// Event type carried in interruption-information fields.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum EventType {
    ExternalInterrupt = 0,
    Nmi = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivSoftwareException = 5,
    SoftwareException = 6,
    Other = 7,
}

impl EventType {
    fn from_bits(bits: u32) -> Self {
        match bits & 7 {
            0 => EventType::ExternalInterrupt,
            2 => EventType::Nmi,
            3 => EventType::HardwareException,
            4 => EventType::SoftwareInterrupt,
            5 => EventType::PrivSoftwareException,
            6 => EventType::SoftwareException,
            _ => EventType::Other,
        }
    }
}

/// VM-exit / VM-entry / IDT-vectoring interruption information
/// (SDM Tables 24-16..24-18: same layout in all three fields).
#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
pub struct InterruptionInfo(u32);

impl InterruptionInfo {
    /// An empty (invalid) field.
    pub const NONE: Self = Self(0);

    /// Reconstruct from the raw field.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Build a valid event of `ty` with `vector`.
    pub fn new(ty: EventType, vector: u8, deliver_error_code: bool) -> Self {
        let mut raw = vector as u32 | ((ty as u32) << 8) | (1 << 31);
        if deliver_error_code {
            raw |= 1 << 11;
        }
        Self(raw)
    }

    /// The raw field value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Valid bit (31).
    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 & (1 << 31) != 0
    }

    /// Vector, bits 7:0.
    #[inline]
    pub fn vector(self) -> u8 {
        self.0 as u8
    }

    /// Event type, bits 10:8.
    #[inline]
    pub fn event_type(self) -> EventType {
        EventType::from_bits(self.0 >> 8)
    }

    /// Error-code-valid bit (11).
    #[inline]
    pub fn has_error_code(self) -> bool {
        self.0 & (1 << 11) != 0
    }
}

impl Default for InterruptionInfo {
    fn default() -> Self {
        Self::NONE
    }
}

impl core::fmt::Debug for InterruptionInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_valid() {
            write!(
                f,
                "InterruptionInfo({:?} vec={})",
                self.event_type(),
                self.vector()
            )
        } else {
            write!(f, "InterruptionInfo(invalid)")
        }
    }
}

/// Exit qualification for EPT violations (SDM Table 28-7).
#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
pub struct EptViolationQual(u64);

impl EptViolationQual {
    /// Reconstruct from the raw qualification.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw qualification.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The access was a data read.
    #[inline]
    pub fn is_read(self) -> bool {
        self.0 & (1 << 0) != 0
    }

    /// The access was a data write.
    #[inline]
    pub fn is_write(self) -> bool {
        self.0 & (1 << 1) != 0
    }

    /// The access was an instruction fetch.
    #[inline]
    pub fn is_fetch(self) -> bool {
        self.0 & (1 << 2) != 0
    }

    /// Combined page permissions of the translation, bits 5:3. Zero means
    /// no leaf was present.
    #[inline]
    pub fn combined_perm(self) -> u64 {
        (self.0 >> 3) & 7
    }

    /// Whether the guest linear-address field is valid (bit 7).
    #[inline]
    pub fn gla_valid(self) -> bool {
        self.0 & (1 << 7) != 0
    }
}

/// Exit qualification for I/O instructions (SDM Table 27-5).
#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
pub struct IoQual(u64);

impl IoQual {
    /// Reconstruct from the raw qualification.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Access size in bytes (1, 2, or 4).
    #[inline]
    pub fn size(self) -> u8 {
        (self.0 as u8 & 7) + 1
    }

    /// Direction: true = IN (port to memory/register).
    #[inline]
    pub fn is_in(self) -> bool {
        self.0 & (1 << 3) != 0
    }

    /// String instruction (INS/OUTS).
    #[inline]
    pub fn is_string(self) -> bool {
        self.0 & (1 << 4) != 0
    }

    /// REP prefixed.
    #[inline]
    pub fn has_rep(self) -> bool {
        self.0 & (1 << 5) != 0
    }

    /// Port operand was an immediate.
    #[inline]
    pub fn is_imm(self) -> bool {
        self.0 & (1 << 6) != 0
    }

    /// Port number, bits 31:16.
    #[inline]
    pub fn port(self) -> u16 {
        (self.0 >> 16) as u16
    }
}

/// Access type of a control-register exit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CrAccessType {
    /// MOV to CR.
    MovToCr,
    /// MOV from CR.
    MovFromCr,
    /// CLTS.
    Clts,
    /// LMSW.
    Lmsw,
}

/// Exit qualification for control-register accesses (SDM Table 27-3).
#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
pub struct CrQual(u64);

impl CrQual {
    /// Reconstruct from the raw qualification.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Control register number, bits 3:0.
    #[inline]
    pub fn cr(self) -> u8 {
        self.0 as u8 & 0xf
    }

    /// Access type, bits 5:4.
    #[inline]
    pub fn access_type(self) -> CrAccessType {
        match (self.0 >> 4) & 3 {
            0 => CrAccessType::MovToCr,
            1 => CrAccessType::MovFromCr,
            2 => CrAccessType::Clts,
            _ => CrAccessType::Lmsw,
        }
    }

    /// GPR operand of a MOV, bits 11:8 (x86 register numbering).
    #[inline]
    pub fn gpr(self) -> usize {
        ((self.0 >> 8) & 0xf) as usize
    }

    /// Source data of LMSW, bits 31:16.
    #[inline]
    pub fn lmsw_source(self) -> u16 {
        (self.0 >> 16) as u16
    }
}

/// Exit qualification for debug-register accesses (SDM Table 27-4).
#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
pub struct DrQual(u64);

impl DrQual {
    /// Reconstruct from the raw qualification.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Debug register number, bits 2:0.
    #[inline]
    pub fn dr(self) -> u8 {
        self.0 as u8 & 7
    }

    /// Direction: true = MOV from DR (DR to GPR).
    #[inline]
    pub fn is_read(self) -> bool {
        self.0 & (1 << 4) != 0
    }

    /// GPR operand, bits 11:8.
    #[inline]
    pub fn gpr(self) -> usize {
        ((self.0 >> 8) & 0xf) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interruption_info_round_trip() {
        let info = InterruptionInfo::new(EventType::HardwareException, 14, true);
        assert!(info.is_valid());
        assert_eq!(info.vector(), 14);
        assert_eq!(info.event_type(), EventType::HardwareException);
        assert!(info.has_error_code());
        assert_eq!(info.raw(), 14 | (3 << 8) | (1 << 11) | (1 << 31));
    }

    #[test]
    fn io_qual_fields() {
        // OUT DX, AX with REP: size 2, out, string, rep, port 0x3f8.
        let q = IoQual::from_raw(0x03f8_0031);
        assert_eq!(q.size(), 2);
        assert!(!q.is_in());
        assert!(q.is_string());
        assert!(q.has_rep());
        assert_eq!(q.port(), 0x3f8);
    }

    #[test]
    fn cr_qual_fields() {
        // MOV CR0 <- RBX.
        let q = CrQual::from_raw(0x300);
        assert_eq!(q.cr(), 0);
        assert_eq!(q.access_type(), CrAccessType::MovToCr);
        assert_eq!(q.gpr(), 3);
    }
}

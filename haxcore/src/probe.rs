//! Host CPU feature probe and VMX capability cache.

use crate::{Error, Result};
use core::sync::atomic::{AtomicU64, Ordering};
use haxhal::x86::{self, cpuid_count, FeatureControl, Msr};

bitflags::bitflags! {
    /// Per-pCPU feature word published by [`cpu_init_vmx`].
    pub struct CpuFeatures: u32 {
        /// The word has been filled in.
        const VALID = 1 << 0;
        /// The pCPU supports VT-x.
        const SUPPORT_VT = 1 << 1;
        /// The pCPU supports NX.
        const SUPPORT_NX = 1 << 2;
        /// The pCPU supports Intel 64.
        const SUPPORT_EM64T = 1 << 3;
        /// VT-x is enabled (firmware permitting).
        const ENABLE_VT = 1 << 8;
        /// NX is enabled.
        const ENABLE_NX = 1 << 9;
        /// Intel 64 is enabled.
        const ENABLE_EM64T = 1 << 10;
        /// Per-pCPU VMX initialization completed.
        const INITIALIZED = 1 << 15;
    }
}

bitflags::bitflags! {
    /// IA32_VMX_EPT_VPID_CAP bits the engine consumes.
    pub struct EptVpidCaps: u64 {
        /// Execute-only translations supported.
        const EXEC_ONLY = 1 << 0;
        /// 4-level EPT walk supported.
        const WALK_LENGTH_4 = 1 << 6;
        /// Uncacheable EPT structure memory type.
        const MEMTYPE_UC = 1 << 8;
        /// Write-back EPT structure memory type.
        const MEMTYPE_WB = 1 << 14;
        /// 2 MiB EPT pages (unused; the tree maps 4 KiB leaves only).
        const PAGE_2M = 1 << 16;
        /// INVEPT supported.
        const INVEPT = 1 << 20;
        /// EPT accessed/dirty flags.
        const EPT_AD = 1 << 21;
        /// Single-context INVEPT.
        const INVEPT_SINGLE_CONTEXT = 1 << 25;
        /// All-contexts INVEPT.
        const INVEPT_ALL_CONTEXT = 1 << 26;
        /// INVVPID supported.
        const INVVPID = 1 << 32;
    }
}

/// The VMX capability MSRs of one pCPU, read once at init.
#[derive(Clone, Copy, Debug)]
pub struct VmxCapabilities {
    pub basic: u64,
    pub pin_ctls: u64,
    pub proc_ctls: u64,
    pub proc_ctls2: u64,
    pub exit_ctls: u64,
    pub entry_ctls: u64,
    pub misc: u64,
    pub cr0_fixed0: u64,
    pub cr0_fixed1: u64,
    pub cr4_fixed0: u64,
    pub cr4_fixed1: u64,
    pub ept_vpid: EptVpidCaps,
}

impl VmxCapabilities {
    /// Read all capability MSRs of the current pCPU.
    pub fn read() -> Self {
        Self {
            basic: Msr::<{ x86::IA32_VMX_BASIC }>::read(),
            pin_ctls: Msr::<{ x86::IA32_VMX_PINBASED_CTLS }>::read(),
            proc_ctls: Msr::<{ x86::IA32_VMX_PROC_BASED_CTLS }>::read(),
            proc_ctls2: Msr::<{ x86::IA32_VMX_PROC_BASED_CTLS2 }>::read(),
            exit_ctls: Msr::<{ x86::IA32_VMX_EXIT_CTLS }>::read(),
            entry_ctls: Msr::<{ x86::IA32_VMX_ENTRY_CTLS }>::read(),
            misc: Msr::<{ x86::IA32_VMX_MISC }>::read(),
            cr0_fixed0: Msr::<{ x86::IA32_VMX_CR0_FIXED0 }>::read(),
            cr0_fixed1: Msr::<{ x86::IA32_VMX_CR0_FIXED1 }>::read(),
            cr4_fixed0: Msr::<{ x86::IA32_VMX_CR4_FIXED0 }>::read(),
            cr4_fixed1: Msr::<{ x86::IA32_VMX_CR4_FIXED1 }>::read(),
            ept_vpid: EptVpidCaps::from_bits_truncate(
                Msr::<{ x86::IA32_VMX_EPT_VPID_CAP }>::read(),
            ),
        }
    }

    /// VMCS revision identifier (bits 30:0 of IA32_VMX_BASIC).
    #[inline]
    pub fn revision_id(&self) -> u32 {
        self.basic as u32 & 0x7fff_ffff
    }

    /// Combine `enabled` with a capability MSR image: must-be-one bits from
    /// the low word forced in, unsupported bits from the high word masked
    /// out (SDM A.3).
    pub fn apply(cap_msr: u64, enabled: u32) -> u32 {
        (enabled | cap_msr as u32) & (cap_msr >> 32) as u32
    }

    /// Whether the secondary control word can enable EPT + unrestricted
    /// guest.
    pub fn supports_ept_ug(&self) -> bool {
        let allowed1 = (self.proc_ctls2 >> 32) as u32;
        allowed1 & (1 << 1) != 0 && allowed1 & (1 << 7) != 0
    }
}

/// Probe the current pCPU and enable VMX prerequisites.
///
/// Sets the FEATURE_CONTROL lock and VMX-outside-SMX bits when the firmware
/// left the MSR unlocked. The pCPU is left in VMX-off. Returns the feature
/// word; the caller stores it per-pCPU and fails engine init if any pCPU
/// misses `SUPPORT_VT`/`SUPPORT_NX` or has them firmware-disabled.
pub fn cpu_init_vmx() -> (CpuFeatures, Option<VmxCapabilities>) {
    let mut features = CpuFeatures::VALID;

    let leaf1 = cpuid_count(1, 0);
    if leaf1.ecx & (1 << 5) != 0 {
        features |= CpuFeatures::SUPPORT_VT;
    }
    let ext1 = cpuid_count(0x8000_0001, 0);
    if ext1.edx & (1 << 20) != 0 {
        features |= CpuFeatures::SUPPORT_NX | CpuFeatures::ENABLE_NX;
    }
    if ext1.edx & (1 << 29) != 0 {
        features |= CpuFeatures::SUPPORT_EM64T | CpuFeatures::ENABLE_EM64T;
    }
    if !features.contains(CpuFeatures::SUPPORT_VT) {
        return (features, None);
    }

    let mut fc = FeatureControl::from_bits_truncate(
        Msr::<{ x86::IA32_FEATURE_CONTROL }>::read(),
    );
    if !fc.contains(FeatureControl::LOCK) {
        // Unlocked: lock it with VMX-outside-SMX enabled.
        fc |= FeatureControl::LOCK | FeatureControl::VMXON_OUT_SMX;
        unsafe { Msr::<{ x86::IA32_FEATURE_CONTROL }>::write(fc.bits()) };
    }
    if fc.contains(FeatureControl::VMXON_OUT_SMX) {
        features |= CpuFeatures::ENABLE_VT;
    } else {
        // Locked with VMX disabled: only the firmware can change that.
        return (features, None);
    }

    let caps = VmxCapabilities::read();
    features |= CpuFeatures::INITIALIZED;
    (features, Some(caps))
}

// Capability snapshot of the boot pCPU, used where any pCPU's value will
// do (the probe fails engine init on heterogeneous capabilities).
static GLOBAL_CAPS: haxhal::SpinLock<Option<VmxCapabilities>> = haxhal::SpinLock::new(None);

/// Publish the engine-wide capability snapshot at init.
pub fn set_global_caps(caps: VmxCapabilities) {
    *GLOBAL_CAPS.lock() = Some(caps);
}

/// The engine-wide capability snapshot.
pub fn global_caps() -> Option<VmxCapabilities> {
    *GLOBAL_CAPS.lock()
}

// The ratified EPT capabilities, shared by every pCPU. Zero = not ratified.
static EPT_CAPS: AtomicU64 = AtomicU64::new(0);

/// Ratify the EPT capabilities advertised by one pCPU.
///
/// The engine requires write-back EPT structures and all-contexts INVEPT.
/// The first pCPU's value is cached process-wide; later pCPUs must match it
/// exactly (heterogeneous VMX capabilities are not supported).
pub fn ept_set_caps(caps: EptVpidCaps) -> Result<()> {
    let required = EptVpidCaps::MEMTYPE_WB | EptVpidCaps::INVEPT | EptVpidCaps::INVEPT_ALL_CONTEXT;
    if !caps.contains(required) {
        error!("ept_set_caps: unusable EPT capabilities 0x{:x}", caps.bits());
        return Err(Error::NoDevice);
    }
    match EPT_CAPS.compare_exchange(0, caps.bits(), Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => Ok(()),
        Err(cur) if cur == caps.bits() => Ok(()),
        Err(cur) => {
            error!(
                "ept_set_caps: pCPU disagrees: cached 0x{:x}, new 0x{:x}",
                cur,
                caps.bits()
            );
            Err(Error::NoDevice)
        }
    }
}

/// The ratified EPT capabilities.
pub fn ept_caps() -> EptVpidCaps {
    EptVpidCaps::from_bits_truncate(EPT_CAPS.load(Ordering::Acquire))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_honors_capability_msr() {
        // allowed-0 = 0x16 (must be one), allowed-1 = 0xffff.
        let cap = 0x0000_ffff_0000_0016u64;
        assert_eq!(VmxCapabilities::apply(cap, 0), 0x16);
        assert_eq!(VmxCapabilities::apply(cap, 0x80), 0x96);
        // Unsupported bits are dropped.
        assert_eq!(VmxCapabilities::apply(cap, 0x10_0000), 0x16);
    }

    #[test]
    fn ept_caps_require_wb_and_all_context() {
        assert_eq!(
            ept_set_caps(EptVpidCaps::MEMTYPE_WB),
            Err(Error::NoDevice)
        );
        let good = EptVpidCaps::MEMTYPE_WB
            | EptVpidCaps::INVEPT
            | EptVpidCaps::INVEPT_ALL_CONTEXT
            | EptVpidCaps::INVEPT_SINGLE_CONTEXT;
        ept_set_caps(good).unwrap();
        // Same value ratifies again; a different one is refused.
        ept_set_caps(good).unwrap();
        assert_eq!(
            ept_set_caps(good | EptVpidCaps::PAGE_2M),
            Err(Error::NoDevice)
        );
        assert_eq!(ept_caps(), good);
    }
}

//! CPUID virtualization.
//!
//! Each VM carries a cached guest view of the CPUID leaves the engine
//! virtualizes. `KCPUID_MANAGER` lists those leaves with an optional
//! transform over the host values; `KCPUID_CONTROLLER` lists the leaves
//! the device model may override, each with a merge function that filters
//! the request down to what the engine can actually virtualize.

use core::sync::atomic::{AtomicU32, Ordering};
use haxhal::x86::{cpuid_count, CpuidArgs};

/// Highest basic leaf exposed to guests.
const MAX_BASIC_CPUID: u32 = 0x16;
/// Highest extended leaf exposed to guests.
const MAX_EXTENDED_CPUID: u32 = 0x8000_0008;

// Leaf 1 ECX feature bits the engine virtualizes.
const SUPPORTED_1_ECX: u32 = (1 << 0)   // SSE3
    | (1 << 1)                          // PCLMULQDQ
    | (1 << 9)                          // SSSE3
    | (1 << 13)                         // CMPXCHG16B
    | (1 << 19)                         // SSE4.1
    | (1 << 20)                         // SSE4.2
    | (1 << 22)                         // MOVBE
    | (1 << 23)                         // POPCNT
    | (1 << 25); // AESNI

// Leaf 1 EDX feature bits the engine virtualizes.
const SUPPORTED_1_EDX: u32 = (1 << 0)   // FPU
    | (1 << 1)                          // VME
    | (1 << 2)                          // DE
    | (1 << 3)                          // PSE
    | (1 << 4)                          // TSC
    | (1 << 5)                          // MSR
    | (1 << 6)                          // PAE
    | (1 << 7)                          // MCE
    | (1 << 8)                          // CX8
    | (1 << 9)                          // APIC
    | (1 << 11)                         // SEP
    | (1 << 12)                         // MTRR
    | (1 << 13)                         // PGE
    | (1 << 14)                         // MCA
    | (1 << 15)                         // CMOV
    | (1 << 16)                         // PAT
    | (1 << 19)                         // CLFSH
    | (1 << 23)                         // MMX
    | (1 << 24)                         // FXSR
    | (1 << 25)                         // SSE
    | (1 << 26)                         // SSE2
    | (1 << 27)                         // SS
    | (1 << 28); // HTT

// Leaf 0x80000001 EDX feature bits the engine virtualizes.
const SUPPORTED_8000_0001_EDX: u32 = (1 << 11) // SYSCALL
    | (1 << 20)                                // NX
    | (1 << 27)                                // RDTSCP
    | (1 << 29); // EM64T

/// Leaf 1 ECX "hypervisor present" bit, always reported.
const FEATURE_HYPERVISOR: u32 = 1 << 31;

/// Leaf 1 EDX features forced on after a device-model override: flags the
/// guest kernel relies on being present.
const FIXED_FEATURES_1_EDX: u32 = (1 << 7)  // MCE
    | (1 << 9)                              // APIC
    | (1 << 12)                             // MTRR
    | (1 << 16); // PAT

/// One guest CPUID leaf image, also the wire format of `SET_CPUID`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct CpuidEntry {
    pub function: u32,
    pub index: u32,
    pub flags: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub pad: [u32; 1],
}

impl CpuidEntry {
    fn from_args(function: u32, args: &CpuidArgs) -> Self {
        Self {
            function,
            eax: args.eax,
            ebx: args.ebx,
            ecx: args.ecx,
            edx: args.edx,
            ..Self::default()
        }
    }

    fn to_args(self) -> CpuidArgs {
        CpuidArgs {
            eax: self.eax,
            ebx: self.ebx,
            ecx: self.ecx,
            edx: self.edx,
        }
    }
}

struct CpuidManager {
    leaf: u32,
    /// `None`: raw host values.
    execute: Option<fn(&mut CpuidArgs)>,
}

static KCPUID_MANAGER: &[CpuidManager] = &[
    // Basic CPUID information.
    CpuidManager { leaf: 0x0000_0000, execute: Some(execute_0000_0000) },
    CpuidManager { leaf: 0x0000_0001, execute: Some(execute_0000_0001) },
    CpuidManager { leaf: 0x0000_0002, execute: Some(execute_0000_0002) },
    CpuidManager { leaf: 0x0000_000a, execute: Some(execute_0000_000a) },
    CpuidManager { leaf: 0x0000_0015, execute: None },
    CpuidManager { leaf: 0x0000_0016, execute: None },
    // Unimplemented by real Intel CPUs; the VMM vendor leaf.
    CpuidManager { leaf: 0x4000_0000, execute: Some(execute_4000_0000) },
    // Extended function CPUID information.
    CpuidManager { leaf: 0x8000_0000, execute: Some(execute_8000_0000) },
    CpuidManager { leaf: 0x8000_0001, execute: Some(execute_8000_0001) },
    CpuidManager { leaf: 0x8000_0002, execute: Some(execute_8000_0002) },
    CpuidManager { leaf: 0x8000_0003, execute: Some(execute_8000_0003) },
    CpuidManager { leaf: 0x8000_0004, execute: Some(execute_8000_0003) },
    CpuidManager { leaf: 0x8000_0006, execute: Some(execute_8000_0006) },
    CpuidManager { leaf: 0x8000_0008, execute: Some(execute_8000_0008) },
];

struct CpuidController {
    leaf: u32,
    /// `None`: copy the user entry verbatim.
    set_leaf: Option<fn(&mut CpuidEntry, &CpuidEntry)>,
}

static KCPUID_CONTROLLER: &[CpuidController] = &[
    CpuidController { leaf: 0x0000_0001, set_leaf: Some(set_leaf_0000_0001) },
    CpuidController { leaf: 0x0000_0015, set_leaf: Some(set_leaf_0000_0015) },
    CpuidController { leaf: 0x0000_0016, set_leaf: Some(set_leaf_0000_0016) },
    CpuidController { leaf: 0x8000_0001, set_leaf: Some(set_leaf_8000_0001) },
];

/// The per-VM guest CPUID view.
pub struct GuestCpuid {
    entries: alloc::vec::Vec<CpuidEntry>,
    features_mask: u64,
}

impl GuestCpuid {
    /// Build the initial view from (transformed) host values.
    pub fn init() -> Self {
        let entries = KCPUID_MANAGER
            .iter()
            .map(|m| {
                let mut args = cpuid_count(m.leaf, 0);
                if let Some(execute) = m.execute {
                    execute(&mut args);
                }
                CpuidEntry::from_args(m.leaf, &args)
            })
            .collect();
        Self {
            entries,
            features_mask: !0,
        }
    }

    /// Serve a guest CPUID instruction: cached entry for known leaves, all
    /// zeroes otherwise.
    pub fn execute(&self, function: u32, _index: u32) -> CpuidArgs {
        self.get(function)
            .map(|e| e.to_args())
            .unwrap_or_default()
    }

    /// The cached entry for `function`.
    pub fn get(&self, function: u32) -> Option<&CpuidEntry> {
        self.entries.iter().find(|e| e.function == function)
    }

    /// Apply a device-model override (`SET_CPUID`): only controlled leaves
    /// are touched, each through its merge function.
    pub fn set_guest_features(&mut self, user: &[CpuidEntry]) {
        for ctl in KCPUID_CONTROLLER {
            let Some(src) = user.iter().find(|e| e.function == ctl.leaf && e.index == 0)
            else {
                continue;
            };
            let Some(dest) = self
                .entries
                .iter_mut()
                .find(|e| e.function == ctl.leaf && e.index == 0)
            else {
                continue;
            };
            let before = *dest;
            match ctl.set_leaf {
                Some(set_leaf) => set_leaf(dest, src),
                None => *dest = *src,
            }
            if dest != &before && (src.eax != dest.eax || src.ebx != dest.ebx
                || src.ecx != dest.ecx || src.edx != dest.edx)
            {
                warning!(
                    "set_guest_features: filtered flags on leaf {:08x}: \
                     ecx ^ {:08x}, edx ^ {:08x}",
                    ctl.leaf,
                    src.ecx ^ dest.ecx,
                    src.edx ^ dest.edx
                );
            }
        }
    }

    /// The VTLB-era feature mask; no ioctl sets it independently.
    pub fn features_mask(&self) -> u64 {
        self.features_mask
    }
}

fn execute_0000_0000(args: &mut CpuidArgs) {
    args.eax = args.eax.min(MAX_BASIC_CPUID);
}

/// Family/model virtualization and feature masking for leaf 1.
///
/// When the hardware reports family 6 with a model above 0x1f, the
/// version information is rewritten to 06_1FH stepping 1 (an old Core i7):
/// newer model numbers make guest kernels enable extended features (e.g.
/// SNB-EP performance monitoring) that the engine does not virtualize.
fn adjust_0000_0001(args: &mut CpuidArgs) {
    const VIRT_FAMILY: u32 = 0x06;
    const VIRT_MODEL: u32 = 0x1f;
    const VIRT_STEPPING: u32 = 0x01;

    let family_id = (args.eax >> 8) & 0xf;
    let ext_family_id = (args.eax >> 20) & 0xff;
    let model = (args.eax >> 4) & 0xf;
    let ext_model_id = (args.eax >> 16) & 0xf;

    let hw_family = if family_id != 0xf {
        family_id
    } else {
        family_id + (ext_family_id << 4)
    };
    let hw_model = if family_id == 0x6 || family_id == 0xf {
        (ext_model_id << 4) + model
    } else {
        model
    };
    if hw_family == VIRT_FAMILY && hw_model > VIRT_MODEL {
        args.eax = ((VIRT_FAMILY & 0xff0) << 16)
            | ((VIRT_FAMILY & 0xf) << 8)
            | ((VIRT_MODEL & 0xf0) << 12)
            | ((VIRT_MODEL & 0xf) << 4)
            | (VIRT_STEPPING & 0xf);
    }

    // EBX[23:16]: one logical processor per package; EBX[15:8]: 64-byte
    // CLFLUSH line; EBX[7:0]: no brand index.
    args.ebx = (0x01 << 16) | (0x08 << 8);

    args.ecx = (args.ecx & SUPPORTED_1_ECX) | FEATURE_HYPERVISOR;
    args.edx &= SUPPORTED_1_EDX;
}

fn execute_0000_0001(args: &mut CpuidArgs) {
    adjust_0000_0001(args);
}

fn execute_0000_0002(args: &mut CpuidArgs) {
    // Hard-coded cache/TLB descriptors.
    args.eax = 0x0302_0101;
    args.ebx = 0;
    args.ecx = 0;
    args.edx = 0x0c04_0844;
}

fn execute_0000_000a(args: &mut CpuidArgs) {
    let pmu = pmu_info();
    args.eax = pmu.eax;
    args.ebx = pmu.ebx;
    args.ecx = 0;
    args.edx = pmu.edx;
}

fn execute_4000_0000(args: &mut CpuidArgs) {
    // The VMM vendor-id leaf, "HAXMHAXMHAXM". Reported even when running
    // nested on top of another VMM, overriding the underlying VMM's id.
    const SIGNATURE: u32 = u32::from_le_bytes(*b"HAXM");
    args.eax = 0x4000_0000;
    args.ebx = SIGNATURE;
    args.ecx = SIGNATURE;
    args.edx = SIGNATURE;
}

fn execute_8000_0000(args: &mut CpuidArgs) {
    args.eax = MAX_EXTENDED_CPUID;
    args.ebx = 0;
    args.ecx = 0;
    args.edx = 0;
}

fn adjust_8000_0001(args: &mut CpuidArgs) {
    args.eax = 0;
    args.ebx = 0;
    args.ecx = 0;
    args.edx &= SUPPORTED_8000_0001_EDX;
}

fn execute_8000_0001(args: &mut CpuidArgs) {
    adjust_8000_0001(args);
}

// The brand string reports "Virtual CPU " and then nothing: leaves
// 0x80000003/4 are zeroed, truncating whatever the hardware advertises.

fn execute_8000_0002(args: &mut CpuidArgs) {
    args.eax = 0x7472_6956; // "Virt"
    args.ebx = 0x206c_6175; // "ual "
    args.ecx = 0x2055_5043; // "CPU "
    args.edx = 0;
}

fn execute_8000_0003(args: &mut CpuidArgs) {
    args.eax = 0;
    args.ebx = 0;
    args.ecx = 0;
    args.edx = 0;
}

fn execute_8000_0006(args: &mut CpuidArgs) {
    args.eax = 0;
    args.ebx = 0;
    args.edx = 0;
    args.ecx = 0x0400_8040;
}

fn execute_8000_0008(args: &mut CpuidArgs) {
    // Cache the reserved-bits mask for paging-structure validation.
    let physical_address_size = args.eax & 0xff;
    let mask = if physical_address_size >= 32 {
        !((1u32 << (physical_address_size - 32)) - 1)
    } else {
        !0
    };
    PW_RESERVED_HIGH.store(mask, Ordering::Release);
    args.ebx = 0;
    args.ecx = 0;
    args.edx = 0;
}

// Reserved high-dword mask of paging-structure physical addresses, from
// MAXPHYADDR (leaf 0x80000008). Defaults to a 36-bit address space.
static PW_RESERVED_HIGH: AtomicU32 = AtomicU32::new(0xffff_fff0);

/// High-dword reserved-bits mask for guest paging entries.
pub fn pw_reserved_bits_high_mask() -> u32 {
    PW_RESERVED_HIGH.load(Ordering::Acquire)
}

/// 64-bit reserved mask over a paging-structure / EPT entry physical
/// address field (bits above MAXPHYADDR, below bit 52).
pub fn paging_reserved_mask() -> u64 {
    ((pw_reserved_bits_high_mask() as u64) << 32) & 0x000f_ffff_0000_0000
}

/// Cached host PMU leaf (0xA), read once at engine init.
#[derive(Clone, Copy, Debug, Default)]
pub struct PmuInfo {
    pub eax: u32,
    pub ebx: u32,
    pub edx: u32,
}

static PMU: AtomicU32 = AtomicU32::new(0);
static PMU_EBX: AtomicU32 = AtomicU32::new(0);
static PMU_EDX: AtomicU32 = AtomicU32::new(0);

/// Snapshot the architectural PMU leaf on the init pCPU.
pub fn pmu_init() {
    let args = cpuid_count(0xa, 0);
    // Cap the architectural PMU version; later versions would promise
    // MSRs the engine does not expose.
    let version = (args.eax & 0xff).min(2);
    PMU.store((args.eax & !0xff) | version, Ordering::Release);
    PMU_EBX.store(args.ebx, Ordering::Release);
    PMU_EDX.store(args.edx, Ordering::Release);
}

fn pmu_info() -> PmuInfo {
    PmuInfo {
        eax: PMU.load(Ordering::Acquire),
        ebx: PMU_EBX.load(Ordering::Acquire),
        edx: PMU_EDX.load(Ordering::Acquire),
    }
}

fn set_leaf_0000_0001(dest: &mut CpuidEntry, src: &CpuidEntry) {
    let mut args = src.to_args();
    adjust_0000_0001(&mut args);
    dest.eax = args.eax;
    dest.ebx = args.ebx;
    dest.ecx = args.ecx;
    dest.edx = args.edx | FIXED_FEATURES_1_EDX;
}

fn set_leaf_0000_0015(dest: &mut CpuidEntry, src: &CpuidEntry) {
    if src.eax == 0 || src.ebx == 0 {
        error!("set_leaf_0000_0015: invalid TSC/crystal-clock ratio");
        return;
    }
    *dest = *src;
}

fn set_leaf_0000_0016(dest: &mut CpuidEntry, src: &CpuidEntry) {
    if src.eax == 0 {
        error!("set_leaf_0000_0016: invalid base frequency");
        return;
    }
    *dest = *src;
}

fn set_leaf_8000_0001(dest: &mut CpuidEntry, src: &CpuidEntry) {
    let mut args = src.to_args();
    adjust_8000_0001(&mut args);
    dest.eax = args.eax;
    dest.ebx = args.ebx;
    dest.ecx = args.ecx;
    dest.edx = args.edx;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf1_masks_and_hypervisor_bit() {
        let mut args = CpuidArgs {
            eax: 0x000a_06f2, // family 6, model 0x6f (> 0x1f)
            ebx: 0xdead_beef,
            ecx: !0,
            edx: !0,
        };
        adjust_0000_0001(&mut args);
        // Clamped to family 6 model 0x1f stepping 1.
        assert_eq!(args.eax, 0x0001_06f1);
        assert_eq!(args.ebx, (0x01 << 16) | (0x08 << 8));
        assert_eq!(args.ecx, SUPPORTED_1_ECX | FEATURE_HYPERVISOR);
        assert_eq!(args.edx, SUPPORTED_1_EDX);
    }

    #[test]
    fn leaf1_small_model_untouched() {
        let mut args = CpuidArgs {
            eax: 0x0000_0650, // family 6, model 5
            ebx: 0,
            ecx: 0,
            edx: 0,
        };
        adjust_0000_0001(&mut args);
        assert_eq!(args.eax, 0x0000_0650);
        // The hypervisor bit is set even with no host features.
        assert_eq!(args.ecx, FEATURE_HYPERVISOR);
    }

    #[test]
    fn vendor_leaf_signature() {
        let mut args = CpuidArgs::default();
        execute_4000_0000(&mut args);
        assert_eq!(args.eax, 0x4000_0000);
        let mut sig = [0u8; 12];
        sig[0..4].copy_from_slice(&args.ebx.to_le_bytes());
        sig[4..8].copy_from_slice(&args.ecx.to_le_bytes());
        sig[8..12].copy_from_slice(&args.edx.to_le_bytes());
        assert_eq!(&sig, b"HAXMHAXMHAXM");
    }

    #[test]
    fn brand_string_is_virtual_cpu() {
        let mut args = CpuidArgs::default();
        execute_8000_0002(&mut args);
        let mut s = [0u8; 16];
        s[0..4].copy_from_slice(&args.eax.to_le_bytes());
        s[4..8].copy_from_slice(&args.ebx.to_le_bytes());
        s[8..12].copy_from_slice(&args.ecx.to_le_bytes());
        assert_eq!(&s[0..12], b"Virtual CPU ");
        // The rest of the brand string stays truncated.
        let mut rest = CpuidArgs { eax: 1, ebx: 2, ecx: 3, edx: 4 };
        execute_8000_0003(&mut rest);
        assert_eq!(rest, CpuidArgs::default());
    }

    #[test]
    fn guest_view_serves_cached_and_zeros() {
        let cpuid = GuestCpuid::init();
        // A known leaf returns the cached transform.
        let leaf1 = cpuid.execute(1, 0);
        assert_ne!(leaf1.ecx & FEATURE_HYPERVISOR, 0);
        // An absent leaf reads as all zeroes.
        assert_eq!(cpuid.execute(0x7, 0), CpuidArgs::default());
        assert_eq!(cpuid.execute(0x4000_0001, 0), CpuidArgs::default());
    }

    #[test]
    fn set_cpuid_merge_applies_fixed_features() {
        let mut cpuid = GuestCpuid::init();
        let user = [CpuidEntry {
            function: 1,
            eax: 0x0000_0650,
            ecx: 0,
            edx: 0,
            ..CpuidEntry::default()
        }];
        cpuid.set_guest_features(&user);
        let merged = cpuid.get(1).unwrap();
        // MCE/APIC/MTRR/PAT are guaranteed present.
        assert_eq!(merged.edx & FIXED_FEATURES_1_EDX, FIXED_FEATURES_1_EDX);
        assert_ne!(merged.ecx & FEATURE_HYPERVISOR, 0);
    }

    #[test]
    fn set_cpuid_rejects_bad_tsc_leaf() {
        let mut cpuid = GuestCpuid::init();
        let before = *cpuid.get(0x15).unwrap();
        let user = [CpuidEntry {
            function: 0x15,
            eax: 0,
            ebx: 0,
            ..CpuidEntry::default()
        }];
        cpuid.set_guest_features(&user);
        assert_eq!(*cpuid.get(0x15).unwrap(), before);
    }

    #[test]
    fn address_width_mask() {
        let mut args = CpuidArgs {
            eax: 39, // MAXPHYADDR = 39
            ..CpuidArgs::default()
        };
        execute_8000_0008(&mut args);
        assert_eq!(pw_reserved_bits_high_mask(), !((1u32 << 7) - 1));
        assert_eq!(args.ebx, 0);
    }
}

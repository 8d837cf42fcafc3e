//! Per-pCPU VMXON lifecycle and VMCS load/put.

use super::entry::HostState;
use super::vmcs::{self, Vmcs};
use super::VmxResult;
use crate::probe::{self, CpuFeatures, VmxCapabilities};
use crate::{Error, Result};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{fence, AtomicI32, AtomicPtr, Ordering};
use haxhal::x86::{Cr4, FeatureControl, Msr};
use haxhal::{host, x86, Pa, PageFrame, PreemptGuard};

/// Identity of a vCPU for the current-VMCS bookkeeping.
pub type VcpuKey = (u32, u32);

bitflags::bitflags! {
    /// Who owns VMX root on this pCPU.
    struct VmmFlags: u32 {
        /// This engine executed VMXON here and must VMXOFF on leave.
        const VMXON_HAX = 1 << 0;
    }
}

#[derive(Clone, Copy)]
struct CurrentVcpu {
    key: VcpuKey,
    vmcs_pa: Pa,
}

/// Per-pCPU engine state. Only the owning pCPU touches its cell, with
/// preemption disabled (or from IPI context).
pub struct PerCpu {
    pub cpu_id: usize,
    /// Feature word from the probe broadcast.
    pub features: CpuFeatures,
    /// VMX capability MSRs, read on this pCPU.
    pub caps: Option<VmxCapabilities>,
    /// The VMXON region, allocated before SMP bring-up.
    vmxon: Option<PageFrame>,
    vmm_flag: VmmFlags,
    host_cr4_vmxe: bool,
    nested: u32,
    current: Option<CurrentVcpu>,
    /// Host state saved across one guest entry.
    pub host_state: HostState,
}

/// Results of the last VMX instructions, stored from broadcast callbacks
/// where logging is not safe. `-1` = untouched.
pub struct ResultSlots {
    pub vmxon_res: AtomicI32,
    pub vmxoff_res: AtomicI32,
    pub invept_res: AtomicI32,
}

impl ResultSlots {
    const fn new() -> Self {
        Self {
            vmxon_res: AtomicI32::new(-1),
            vmxoff_res: AtomicI32::new(-1),
            invept_res: AtomicI32::new(-1),
        }
    }

    pub(crate) fn record(slot: &AtomicI32, r: VmxResult) {
        slot.store(
            match r {
                VmxResult::Succeed => 0,
                VmxResult::FailValid => 1,
                VmxResult::FailInvalid => 2,
            },
            Ordering::Release,
        );
    }
}

struct PerCpuArray {
    cells: Box<[UnsafeCell<PerCpu>]>,
    results: Box<[ResultSlots]>,
}

// Cells are only touched by their own pCPU; results are atomics.
unsafe impl Sync for PerCpuArray {}

static CPUS: AtomicPtr<PerCpuArray> = AtomicPtr::new(core::ptr::null_mut());

fn array() -> Option<&'static PerCpuArray> {
    unsafe { CPUS.load(Ordering::Acquire).as_ref() }
}

/// Allocate the per-pCPU array and the VMXON regions. Runs once, from the
/// engine init thread (not IPI context: it allocates).
pub fn init(cpu_count: usize) -> Result<()> {
    if array().is_some() {
        return Err(Error::Busy);
    }
    let mut cells = Vec::with_capacity(cpu_count);
    let mut results = Vec::with_capacity(cpu_count);
    for cpu_id in 0..cpu_count {
        let vmxon = PageFrame::new().ok_or(Error::NoMemory)?;
        cells.push(UnsafeCell::new(PerCpu {
            cpu_id,
            features: CpuFeatures::empty(),
            caps: None,
            vmxon: Some(vmxon),
            vmm_flag: VmmFlags::empty(),
            host_cr4_vmxe: false,
            nested: 0,
            current: None,
            host_state: HostState::default(),
        }));
        results.push(ResultSlots::new());
    }
    let array = Box::new(PerCpuArray {
        cells: cells.into_boxed_slice(),
        results: results.into_boxed_slice(),
    });
    CPUS.store(Box::into_raw(array), Ordering::Release);
    Ok(())
}

/// Number of managed pCPUs.
pub fn cpu_count() -> usize {
    array().map_or(0, |a| a.cells.len())
}

/// The calling pCPU's cell.
///
/// # Safety
/// Preemption must be disabled (or the caller runs in IPI context), and the
/// reference must not outlive that condition.
pub unsafe fn current() -> &'static mut PerCpu {
    let a = array().expect("per-cpu array not initialized");
    &mut *a.cells[host::host().cpu_id()].get()
}

/// The result slots of pCPU `cpu_id`.
pub fn results(cpu_id: usize) -> &'static ResultSlots {
    &array().expect("per-cpu array not initialized").results[cpu_id]
}

/// Probe callback run on every pCPU at engine init.
pub fn init_on_cpu() {
    // IPI context: no allocation, no logging.
    let pcpu = unsafe { current() };
    let (features, caps) = probe::cpu_init_vmx();
    pcpu.features = features;
    pcpu.caps = caps;
}

/// Whether every pCPU probed usable (VT + NX enabled).
pub fn all_cpus_usable() -> bool {
    let a = match array() {
        Some(a) => a,
        None => return false,
    };
    a.cells.iter().all(|c| {
        let pcpu = unsafe { &*c.get() };
        pcpu.features
            .contains(CpuFeatures::ENABLE_VT | CpuFeatures::ENABLE_NX | CpuFeatures::INITIALIZED)
    })
}

/// Enter VMX root operation on the calling pCPU.
///
/// When VMXON fails with `FailInvalid` while the host already had
/// `CR4.VMXE` set, probe with VMPTRST whether another VMM holds VMX root;
/// if so the root is shared: the engine must not VMXOFF on leave.
pub fn vmxroot_enter(pcpu: &mut PerCpu) -> Result<()> {
    let cr4 = Cr4::current();
    pcpu.host_cr4_vmxe = cr4.contains(Cr4::VMXE);
    unsafe { (cr4 | Cr4::VMXE).apply() };

    // The firmware may have left FEATURE_CONTROL unlocked; retry the lock.
    let fc = FeatureControl::from_bits_truncate(Msr::<{ x86::IA32_FEATURE_CONTROL }>::read());
    if !fc.contains(FeatureControl::LOCK) {
        unsafe {
            Msr::<{ x86::IA32_FEATURE_CONTROL }>::write(
                (fc | FeatureControl::LOCK | FeatureControl::VMXON_OUT_SMX).bits(),
            )
        };
    }

    let caps = pcpu.caps.as_ref().ok_or(Error::NoDevice)?;
    let vmxon = pcpu.vmxon.as_mut().ok_or(Error::NoDevice)?;
    unsafe {
        vmxon.inner_mut()[..4].copy_from_slice(&caps.revision_id().to_le_bytes());
    }
    let result = unsafe { vmcs::vmxon(vmxon.pa()) };
    ResultSlots::record(&results(pcpu.cpu_id).vmxon_res, result);
    match result {
        VmxResult::Succeed => {
            pcpu.vmm_flag |= VmmFlags::VMXON_HAX;
            Ok(())
        }
        VmxResult::FailInvalid if pcpu.host_cr4_vmxe => {
            // CR4.VMXE was already set: another VMM may be in VMX root.
            // VMPTRST succeeds only in VMX operation.
            if unsafe { vmcs::vmptrst() }.is_ok() {
                pcpu.vmm_flag &= !VmmFlags::VMXON_HAX;
                Ok(())
            } else {
                restore_cr4(pcpu);
                Err(Error::Vmx(vmcs::instruction_error()))
            }
        }
        _ => {
            restore_cr4(pcpu);
            Err(Error::Vmx(vmcs::instruction_error()))
        }
    }
}

/// Leave VMX root operation: VMXOFF only if this engine entered.
pub fn vmxroot_leave(pcpu: &mut PerCpu) {
    if pcpu.vmm_flag.contains(VmmFlags::VMXON_HAX) {
        let result = unsafe { vmcs::vmxoff() };
        ResultSlots::record(&results(pcpu.cpu_id).vmxoff_res, result);
        pcpu.vmm_flag &= !VmmFlags::VMXON_HAX;
    }
    restore_cr4(pcpu);
}

fn restore_cr4(pcpu: &PerCpu) {
    if !pcpu.host_cr4_vmxe {
        unsafe { (Cr4::current() - Cr4::VMXE).apply() };
    }
}

/// Token of a loaded VMCS. While it lives, preemption stays disabled and
/// the vCPU's VMCS is current on this pCPU; dropping the token VMCLEARs
/// (outermost level only) and re-enables preemption.
pub struct LoadedVmcs {
    key: VcpuKey,
    _guard: PreemptGuard,
}

impl LoadedVmcs {
    /// Accessor for VMREAD/VMWRITE on the loaded VMCS.
    #[inline]
    pub fn vmcs(&self) -> super::vmcs::ActiveVmcs {
        super::vmcs::ActiveVmcs::assume_loaded()
    }

    /// The pCPU the VMCS is loaded on.
    #[inline]
    pub fn cpu_id(&self) -> usize {
        self._guard.cpu_id()
    }

    /// The vCPU identity this token is for.
    #[inline]
    pub fn key(&self) -> VcpuKey {
        self.key
    }
}

/// Make `vmcs` current on the calling pCPU.
///
/// Re-entrant: if the same vCPU's VMCS is already loaded here, only the
/// per-pCPU nesting counter grows, so inner helpers can acquire the VMCS
/// without a second VMPTRLD.
pub fn load_vmcs(vmcs_page: &Vmcs, key: VcpuKey) -> Result<LoadedVmcs> {
    let guard = PreemptGuard::new();
    fence(Ordering::SeqCst);
    let pcpu = unsafe { current() };
    if let Some(cur) = pcpu.current {
        if cur.key == key {
            pcpu.nested += 1;
            return Ok(LoadedVmcs { key, _guard: guard });
        }
        // A different vCPU's VMCS is loaded here; the caller raced a
        // migration it should not have.
        return Err(Error::Busy);
    }
    vmxroot_enter(pcpu)?;
    if let Err(e) = vmcs_page.load() {
        error!("load_vmcs: VMPTRLD failed: {}", e);
        vmxroot_leave(pcpu);
        return Err(e);
    }
    pcpu.current = Some(CurrentVcpu {
        key,
        vmcs_pa: vmcs_page.pa(),
    });
    Ok(LoadedVmcs { key, _guard: guard })
}

impl Drop for LoadedVmcs {
    fn drop(&mut self) {
        let pcpu = unsafe { current() };
        if pcpu.nested > 0 {
            pcpu.nested -= 1;
            return;
        }
        if let Some(cur) = pcpu.current.take() {
            if super::vmcs::vmx_clear_pa(cur.vmcs_pa) != VmxResult::Succeed {
                error!("put_vmcs: VMCLEAR failed on cpu {}", pcpu.cpu_id);
            }
        }
        vmxroot_leave(pcpu);
        // The preemption guard drops last.
    }
}

/// Capability snapshot of pCPU `cpu_id`, valid after the probe broadcast.
pub fn caps_of(cpu_id: usize) -> Option<VmxCapabilities> {
    let a = array()?;
    let pcpu = unsafe { &*a.cells.get(cpu_id)?.get() };
    pcpu.caps
}

/// Feature word of pCPU `cpu_id`, valid after the probe broadcast.
pub fn features_of(cpu_id: usize) -> Option<CpuFeatures> {
    let a = array()?;
    let pcpu = unsafe { &*a.cells.get(cpu_id)?.get() };
    Some(pcpu.features)
}

/// The vCPU whose VMCS is current on `cpu_id`, for invariants and debugging.
pub fn current_vcpu_on(cpu_id: usize) -> Option<VcpuKey> {
    let a = array()?;
    // Racy read; only used for diagnostics.
    let pcpu = unsafe { &*a.cells[cpu_id].get() };
    pcpu.current.map(|c| c.key)
}

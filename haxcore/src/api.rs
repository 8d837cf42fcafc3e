//! Engine control surface.
//!
//! The functions here are what the per-OS device nodes dispatch their
//! ioctls to; the nodes themselves (file objects, copy-in/out) live in the
//! platform glue and are out of scope.

use crate::config::{HAX_COMPAT_VERSION, HAX_CUR_VERSION, HAX_MAX_VMS};
use crate::probe;
use crate::vm::Vm;
use crate::vmx::percpu;
use crate::{Error, Result};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use haxhal::host::host;
use haxhal::SpinLock;

/// `VERSION` reply.
#[derive(Clone, Copy, Debug)]
pub struct VersionInfo {
    pub cur: u32,
    pub compat: u32,
}

bitflags::bitflags! {
    /// `CAPABILITY` feature word.
    pub struct CapFlags: u32 {
        /// The engine initialized and can run guests.
        const WORKING = 1 << 0;
        /// Fast MMIO exits are produced.
        const FASTMMIO = 1 << 1;
        /// EPT is in use.
        const EPT = 1 << 2;
        /// Unrestricted guest (real mode without emulation).
        const UG = 1 << 3;
        /// `PROTECT_RAM` is available.
        const RAM_PROTECTION = 1 << 4;
        /// The `DEBUG` ioctl is available.
        const DEBUG = 1 << 5;
        /// `SET_RAM2` 64-bit ranges are accepted.
        const SETRAM_64 = 1 << 6;
    }
}

/// `CAPABILITY` reply.
#[derive(Clone, Copy, Debug)]
pub struct CapabilityInfo {
    pub wstatus: u32,
    pub winfo: u32,
    pub mem_quota: u64,
}

struct Engine {
    vms: SpinLock<Vec<Option<Arc<Vm>>>>,
    initialized: core::sync::atomic::AtomicBool,
}

static ENGINE: Engine = Engine {
    vms: SpinLock::new(Vec::new()),
    initialized: core::sync::atomic::AtomicBool::new(false),
};

// Advisory memory quota; zero = unlimited.
static MEM_QUOTA: AtomicU64 = AtomicU64::new(0);
static MEM_USED: AtomicU64 = AtomicU64::new(0);

/// Account registered guest RAM against the advisory quota. Never fails;
/// the quota exists for the controlling process's bookkeeping, not as a
/// hard limit.
pub(crate) fn charge_ram_quota(bytes: u64) {
    let used = MEM_USED.fetch_add(bytes, Ordering::SeqCst) + bytes;
    let quota = MEM_QUOTA.load(Ordering::Acquire);
    if quota != 0 && used > quota {
        warning!(
            "guest RAM above the advisory quota: used 0x{:x}, quota 0x{:x}",
            used,
            quota
        );
    }
}

/// Bring the engine up: probe every pCPU, ratify the EPT capabilities, and
/// cache the capability snapshot. Fails when any pCPU lacks VT or NX, or
/// when the firmware disabled them.
pub fn init() -> Result<()> {
    let cpus = host().cpu_count();
    percpu::init(cpus)?;
    host().broadcast(&percpu::init_on_cpu);

    if !percpu::all_cpus_usable() {
        for cpu in 0..cpus {
            if let Some(f) = percpu::features_of(cpu) {
                error!("cpu {}: feature word 0x{:x}", cpu, f.bits());
            }
        }
        return Err(Error::NoDevice);
    }

    let caps = percpu::caps_of(0).ok_or(Error::NoDevice)?;
    if !caps.supports_ept_ug() {
        error!("init: EPT + unrestricted guest unavailable");
        return Err(Error::NoDevice);
    }
    // Every pCPU must agree on (usable) EPT capabilities.
    for cpu in 0..cpus {
        let cpu_caps = percpu::caps_of(cpu).ok_or(Error::NoDevice)?;
        probe::ept_set_caps(cpu_caps.ept_vpid)?;
    }
    probe::set_global_caps(caps);
    crate::cpuid::pmu_init();

    ENGINE.initialized.store(true, Ordering::Release);
    info!("engine initialized on {} pCPUs", cpus);
    Ok(())
}

/// `VERSION`.
pub fn version() -> VersionInfo {
    VersionInfo {
        cur: HAX_CUR_VERSION,
        compat: HAX_COMPAT_VERSION,
    }
}

/// `CAPABILITY`.
pub fn capability() -> CapabilityInfo {
    let mut winfo = CapFlags::FASTMMIO
        | CapFlags::EPT
        | CapFlags::UG
        | CapFlags::RAM_PROTECTION
        | CapFlags::DEBUG
        | CapFlags::SETRAM_64;
    let wstatus = if ENGINE.initialized.load(Ordering::Acquire) {
        winfo |= CapFlags::WORKING;
        CapFlags::WORKING.bits()
    } else {
        0
    };
    CapabilityInfo {
        wstatus,
        winfo: winfo.bits(),
        mem_quota: MEM_QUOTA.load(Ordering::Acquire),
    }
}

/// `SET_MEMLIMIT`: advisory quota, rejected once a VM exists.
pub fn set_memlimit(limit_bytes: u64) -> Result<()> {
    let vms = ENGINE.vms.lock();
    if vms.iter().any(|v| v.is_some()) {
        return Err(Error::Busy);
    }
    MEM_QUOTA.store(limit_bytes, Ordering::Release);
    Ok(())
}

/// `CREATE_VM`: returns the new VM id.
pub fn create_vm() -> Result<u32> {
    let mut vms = ENGINE.vms.lock();
    let id = match vms.iter().position(|v| v.is_none()) {
        Some(free) => free,
        None if vms.len() < HAX_MAX_VMS => {
            vms.push(None);
            vms.len() - 1
        }
        None => return Err(Error::NoMemory),
    };
    let vm = Vm::new(id as u32)?;
    vms[id] = Some(vm);
    info!("created vm {}", id);
    Ok(id as u32)
}

/// Resolve a VM id.
pub fn get_vm(vm_id: u32) -> Option<Arc<Vm>> {
    ENGINE
        .vms
        .lock()
        .get(vm_id as usize)
        .and_then(|v| v.clone())
}

/// Tear down a VM (its device node closed). Refuses while vCPUs live.
pub fn destroy_vm(vm_id: u32) -> Result<()> {
    let mut vms = ENGINE.vms.lock();
    let slot = vms
        .get_mut(vm_id as usize)
        .ok_or(Error::InvalidParam)?;
    let vm = slot.take().ok_or(Error::InvalidParam)?;
    if vm.vcpu_count() != 0 {
        *slot = Some(vm);
        return Err(Error::Busy);
    }
    drop(vms);
    vm.deref();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use haxhal::mock::install_mock;

    #[test]
    fn version_and_capability_report() {
        install_mock();
        let v = version();
        assert_eq!(v.cur, HAX_CUR_VERSION);
        assert!(v.compat <= v.cur);
        let cap = capability();
        assert_ne!(cap.winfo & CapFlags::EPT.bits(), 0);
        assert_ne!(cap.winfo & CapFlags::FASTMMIO.bits(), 0);
    }

    // One test drives the whole surface: the engine registry is process
    // global, and concurrent test threads would race each other's VMs.
    #[test]
    fn engine_surface() {
        install_mock();
        set_memlimit(1 << 30).unwrap();

        let id = create_vm().unwrap();
        let vm = get_vm(id).unwrap();
        assert_eq!(vm.vm_id, id);

        // The quota is frozen while a VM exists.
        assert_eq!(set_memlimit(2 << 30).err(), Some(Error::Busy));

        // A live vCPU blocks destruction.
        vm.create_vcpu(0).unwrap();
        assert_eq!(destroy_vm(id).err(), Some(Error::Busy));
        vm.destroy_vcpu(0).unwrap();
        destroy_vm(id).unwrap();
        assert!(get_vm(id).is_none());

        // Ids are recycled.
        let id2 = create_vm().unwrap();
        assert_eq!(id2, id);
        destroy_vm(id2).unwrap();

        set_memlimit(0).unwrap();
    }
}

//! Virtual machines.

use crate::config::HAX_MAX_VCPUS;
use crate::cpuid::{CpuidEntry, GuestCpuid};
use crate::ept::EptTree;
use crate::memory::{GpaSpace, MemSlotFlags, MemSlotListener};
use crate::vcpu::{Vcpu, VcpuShared};
use crate::{Error, Result};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use haxhal::SpinLock;

bitflags::bitflags! {
    /// Features negotiated with the device model.
    pub struct VmFeatures: u32 {
        /// Decoded fast-MMIO exits.
        const FASTMMIO_BASIC = 1 << 0;
        /// Direct MMIO-to-MMIO copy requests.
        const FASTMMIO_EXTRA = 1 << 1;
    }
}

/// Keeps the EPT coherent with the memory-slot list: any slot change or
/// protection flip invalidates the affected range, raising the sticky
/// INVEPT marker the run loop consumes before the next entry.
struct EptInvalidator {
    ept: Arc<EptTree>,
}

impl EptInvalidator {
    fn invalidate(&self, start_gfn: u64, npages: u64) {
        if let Err(e) = self.ept.invalidate_entries(start_gfn, npages) {
            error!(
                "ept invalidate [0x{:x}, +0x{:x}) failed: {}",
                start_gfn, npages, e
            );
        }
    }
}

impl MemSlotListener for EptInvalidator {
    fn mapping_added(&self, start_gfn: u64, npages: u64) {
        self.invalidate(start_gfn, npages);
    }
    fn mapping_removed(&self, start_gfn: u64, npages: u64) {
        self.invalidate(start_gfn, npages);
    }
    fn mapping_changed(&self, start_gfn: u64, npages: u64) {
        self.invalidate(start_gfn, npages);
    }
}

struct VcpuSlot {
    id: u32,
    vpid: u16,
    shared: Arc<VcpuShared>,
    vcpu: Arc<SpinLock<Vcpu>>,
}

/// One virtual machine: the address space, the EPT, the guest CPUID view,
/// and the vCPU list.
pub struct Vm {
    pub vm_id: u32,
    gpa_space: Arc<GpaSpace>,
    ept: Arc<EptTree>,
    cpuid: Arc<SpinLock<GuestCpuid>>,
    vcpus: SpinLock<Vec<VcpuSlot>>,
    /// One bit per allocated VPID slot.
    vpid_bitmap: AtomicU64,
    features: AtomicU32,
    ref_count: AtomicU32,
}

impl Vm {
    pub(crate) fn new(vm_id: u32) -> Result<Arc<Self>> {
        let gpa_space = Arc::new(GpaSpace::new());
        let ept = Arc::new(EptTree::new()?);
        gpa_space.register_listener(Arc::new(EptInvalidator { ept: ept.clone() }));
        Ok(Arc::new(Self {
            vm_id,
            gpa_space,
            ept,
            cpuid: Arc::new(SpinLock::new(GuestCpuid::init())),
            vcpus: SpinLock::new(Vec::new()),
            vpid_bitmap: AtomicU64::new(0),
            features: AtomicU32::new(0),
            ref_count: AtomicU32::new(1),
        }))
    }

    /// The VM's guest-physical address space.
    pub fn gpa_space(&self) -> &Arc<GpaSpace> {
        &self.gpa_space
    }

    /// The VM's extended page table.
    pub fn ept(&self) -> &Arc<EptTree> {
        &self.ept
    }

    /// Negotiated device-model features.
    pub fn features(&self) -> VmFeatures {
        VmFeatures::from_bits_truncate(self.features.load(Ordering::Acquire))
    }

    // -- vCPUs --------------------------------------------------------------

    fn alloc_vpid(&self) -> Result<u16> {
        loop {
            let cur = self.vpid_bitmap.load(Ordering::Acquire);
            let slot = (!cur).trailing_zeros();
            if slot >= 63 {
                return Err(Error::NoMemory);
            }
            if self
                .vpid_bitmap
                .compare_exchange(cur, cur | (1 << slot), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Non-zero and unique across VMs for the bitmap width.
                return Ok((((self.vm_id as u16) & 0x3f) << 6) | (slot as u16 + 1));
            }
        }
    }

    fn free_vpid(&self, vpid: u16) {
        let slot = (vpid & 0x3f) - 1;
        self.vpid_bitmap
            .fetch_and(!(1u64 << slot), Ordering::AcqRel);
    }

    /// `VCPU_CREATE`: exactly one vCPU per `(vm, id)`.
    pub fn create_vcpu(&self, vcpu_id: u32) -> Result<Arc<SpinLock<Vcpu>>> {
        if vcpu_id as usize >= HAX_MAX_VCPUS {
            return Err(Error::InvalidParam);
        }
        let mut vcpus = self.vcpus.lock();
        if vcpus.iter().any(|s| s.id == vcpu_id) {
            return Err(Error::Exists);
        }
        let vpid = self.alloc_vpid()?;
        let revision_id = crate::probe::global_caps()
            .map(|c| c.revision_id())
            .unwrap_or(1);
        let shared = Arc::new(VcpuShared::new());
        let mut vcpu = Vcpu::new(
            self.vm_id,
            vcpu_id,
            vpid,
            revision_id,
            shared.clone(),
            self.gpa_space.clone(),
            self.ept.clone(),
            self.cpuid.clone(),
        )
        .map_err(|e| {
            self.free_vpid(vpid);
            e
        })?;
        vcpu.mmio_extra = self.features().contains(VmFeatures::FASTMMIO_EXTRA);
        let vcpu = Arc::new(SpinLock::new(vcpu));
        vcpus.push(VcpuSlot {
            id: vcpu_id,
            vpid,
            shared,
            vcpu: vcpu.clone(),
        });
        self.ref_count.fetch_add(1, Ordering::SeqCst);
        info!("vm {}: created vcpu {} (vpid 0x{:x})", self.vm_id, vcpu_id, vpid);
        Ok(vcpu)
    }

    /// Look up a vCPU.
    pub fn vcpu(&self, vcpu_id: u32) -> Option<Arc<SpinLock<Vcpu>>> {
        self.vcpus
            .lock()
            .iter()
            .find(|s| s.id == vcpu_id)
            .map(|s| s.vcpu.clone())
    }

    /// The lock-free control block of a vCPU (pause/interrupt).
    pub fn vcpu_shared(&self, vcpu_id: u32) -> Option<Arc<VcpuShared>> {
        self.vcpus
            .lock()
            .iter()
            .find(|s| s.id == vcpu_id)
            .map(|s| s.shared.clone())
    }

    /// Tear down one vCPU (its device node closed).
    pub fn destroy_vcpu(&self, vcpu_id: u32) -> Result<()> {
        let mut vcpus = self.vcpus.lock();
        let index = vcpus
            .iter()
            .position(|s| s.id == vcpu_id)
            .ok_or(Error::InvalidParam)?;
        let slot = vcpus.remove(index);
        drop(vcpus);
        self.free_vpid(slot.vpid);
        self.deref();
        Ok(())
    }

    /// Live vCPU count.
    pub fn vcpu_count(&self) -> usize {
        self.vcpus.lock().len()
    }

    // -- memory -------------------------------------------------------------

    /// `ALLOC_RAM` / `ADD_RAMBLOCK`.
    pub fn add_ramblock(&self, base_uva: u64, size: u64) -> Result<()> {
        self.gpa_space.add_ramblock(base_uva, size)?;
        crate::api::charge_ram_quota(size);
        Ok(())
    }

    /// `SET_RAM` / `SET_RAM2`.
    pub fn set_ram(&self, start_gpa: u64, size: u64, uva: u64, flags: u32) -> Result<()> {
        if start_gpa & 0xfff != 0 || size == 0 || size & 0xfff != 0 {
            return Err(Error::InvalidParam);
        }
        let flags = MemSlotFlags::from_bits(flags).ok_or(Error::InvalidParam)?;
        self.gpa_space
            .set_ram(start_gpa >> 12, size >> 12, uva, flags)
    }

    /// `PROTECT_RAM`.
    pub fn protect_ram(&self, start_gpa: u64, size: u64, flags: u32) -> Result<()> {
        if start_gpa & 0xfff != 0 || size == 0 || size & 0xfff != 0 {
            return Err(Error::InvalidParam);
        }
        let gpa = crate::memory::Gpa::new(start_gpa).ok_or(Error::InvalidParam)?;
        self.gpa_space.protect_range(gpa, size, flags)
    }

    // -- negotiation --------------------------------------------------------

    /// `NOTIFY_QEMU_VERSION`: feature handshake by device-model version.
    pub fn notify_qemu_version(&self, cur: u32, _least: u32) -> Result<()> {
        let mut features = VmFeatures::empty();
        if cur >= 2 {
            features |= VmFeatures::FASTMMIO_BASIC;
        }
        if cur >= 4 {
            features |= VmFeatures::FASTMMIO_EXTRA;
        }
        self.features.store(features.bits(), Ordering::Release);
        let extra = features.contains(VmFeatures::FASTMMIO_EXTRA);
        for slot in self.vcpus.lock().iter() {
            slot.vcpu.lock().mmio_extra = extra;
        }
        info!(
            "vm {}: device model version {} (features 0x{:x})",
            self.vm_id,
            cur,
            features.bits()
        );
        Ok(())
    }

    /// `SET_CPUID`: device-model override of the guest CPUID view.
    pub fn set_cpuid(&self, entries: &[CpuidEntry]) -> Result<()> {
        if entries.is_empty() {
            return Err(Error::InvalidParam);
        }
        self.cpuid.lock().set_guest_features(entries);
        Ok(())
    }

    // -- lifecycle ----------------------------------------------------------

    /// Take a reference (a device node opened on this VM).
    pub fn ref_vm(&self) {
        self.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one reference; at zero (which requires every vCPU torn down
    /// first) the memory map is dismantled.
    pub fn deref(&self) -> bool {
        if self.ref_count.fetch_sub(1, Ordering::SeqCst) != 1 {
            return false;
        }
        debug_assert_eq!(self.vcpu_count(), 0);
        self.gpa_space.teardown();
        info!("vm {}: destroyed", self.vm_id);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haxhal::mock::install_mock;

    #[test]
    fn vcpu_ids_are_unique() {
        install_mock();
        let vm = Vm::new(3).unwrap();
        vm.create_vcpu(0).unwrap();
        assert_eq!(vm.create_vcpu(0).err(), Some(Error::Exists));
        vm.create_vcpu(1).unwrap();
        assert_eq!(vm.vcpu_count(), 2);
        assert!(vm.vcpu(1).is_some());
        assert!(vm.vcpu(7).is_none());
        assert_eq!(
            vm.create_vcpu(HAX_MAX_VCPUS as u32).err(),
            Some(Error::InvalidParam)
        );
    }

    #[test]
    fn vpids_are_nonzero_and_distinct() {
        install_mock();
        let vm = Vm::new(2).unwrap();
        vm.create_vcpu(0).unwrap();
        vm.create_vcpu(1).unwrap();
        {
            let vcpus = vm.vcpus.lock();
            assert_ne!(vcpus[0].vpid, 0);
            assert_ne!(vcpus[1].vpid, 0);
            assert_ne!(vcpus[0].vpid, vcpus[1].vpid);
        }
        assert_eq!(vm.vpid_bitmap.load(Ordering::SeqCst), 0b11);
        // Freeing the slot makes the vpid reusable.
        vm.destroy_vcpu(0).unwrap();
        assert_eq!(vm.vpid_bitmap.load(Ordering::SeqCst), 0b10);
    }

    #[test]
    fn version_handshake_sets_features() {
        install_mock();
        let vm = Vm::new(4).unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();
        assert!(!vcpu.lock().mmio_extra);

        vm.notify_qemu_version(1, 1).unwrap();
        assert!(vm.features().is_empty());

        vm.notify_qemu_version(2, 1).unwrap();
        assert_eq!(vm.features(), VmFeatures::FASTMMIO_BASIC);

        vm.notify_qemu_version(4, 1).unwrap();
        assert!(vm.features().contains(VmFeatures::FASTMMIO_EXTRA));
        // Existing vCPUs pick up the negotiated feature.
        assert!(vcpu.lock().mmio_extra);
    }

    #[test]
    fn set_ram_validates_alignment() {
        install_mock();
        let vm = Vm::new(5).unwrap();
        assert_eq!(
            vm.set_ram(0x123, 0x1000, 0x1000, 0).err(),
            Some(Error::InvalidParam)
        );
        assert_eq!(
            vm.set_ram(0x1000, 0x800, 0x1000, 0).err(),
            Some(Error::InvalidParam)
        );
    }

    #[test]
    fn slot_change_invalidates_ept() {
        // Scenario: populate EPT leaves, unmap the slot, observe the
        // invalidation marker.
        let mock = install_mock();
        let uva = mock.alloc_user(0x40_0000);
        let vm = Vm::new(6).unwrap();
        vm.add_ramblock(uva, 0x40_0000).unwrap();
        vm.set_ram(0, 0x40_0000, uva, 0).unwrap();
        // Fault-in the second chunk by hand.
        let space = vm.gpa_space();
        let slot = space.slot_for(0x200).unwrap();
        let block = slot.block().clone();
        let chunk = block.get_chunk(0x20_0000, true).unwrap().unwrap();
        vm.ept()
            .create_entries(0x200, 0x200, crate::ept::EptPerm::FULL, |i| {
                chunk.pfn_at(i << 12)
            })
            .unwrap();
        assert!(vm.ept().get_entry(0x250).unwrap().is_present());
        assert!(!vm.ept().invept_pending());

        // Unmap [0x200000, 0x400000): leaves cleared, marker raised.
        vm.set_ram(0x20_0000, 0x20_0000, 0, MemSlotFlags::INVALID.bits())
            .unwrap();
        assert!(!vm.ept().get_entry(0x250).unwrap().is_present());
        assert!(vm.ept().invept_pending());
        // The next lookup treats the range as unbacked.
        assert!(space.slot_for(0x250).is_none());
    }

    #[test]
    fn refcount_gates_destruction() {
        install_mock();
        let vm = Vm::new(7).unwrap();
        vm.create_vcpu(0).unwrap();
        // One ref for the VM node, one for the vCPU.
        assert!(!vm.deref());
        vm.ref_vm();
        vm.destroy_vcpu(0).unwrap();
        assert!(vm.deref());
    }
}

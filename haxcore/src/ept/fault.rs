//! EPT fault handling: access violations and misconfiguration repair.

use super::{Epte, EptPerm, EptTree};
use crate::memory::{Gpa, GpaSpace};
use crate::vmx::controls::EptViolationQual;
use crate::{Error, Result};
use core::sync::atomic::Ordering;

/// Outcome of an access-violation exit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Violation {
    /// The GPA has no RAM backing (or is a ROM write): hand it to the MMIO
    /// path.
    Mmio,
    /// The missing translation was installed; re-enter the guest.
    Filled(u64),
}

/// Handle an EPT access violation at `gpa`.
///
/// Classifies the fault against the memory model: unbacked → MMIO, ROM
/// write → MMIO (the device model owns ROM write semantics), protected
/// chunk → fault reported to user space, plain lazy miss → pin the chunk
/// and install leaves for the whole slot/chunk intersection in one go.
pub fn handle_access_violation(
    space: &GpaSpace,
    tree: &EptTree,
    qual: EptViolationQual,
    gpa: Gpa,
) -> Result<Violation> {
    let gfn = gpa.gfn();
    let Some(slot) = space.slot_for(gfn) else {
        return Ok(Violation::Mmio);
    };

    let combined = qual.combined_perm();
    if combined != 0 {
        // The leaf was present. The only expected case is a write to a
        // read-only mapping, which belongs to the device model.
        if qual.is_write() && slot.is_readonly() {
            return Ok(Violation::Mmio);
        }
        error!(
            "ept: permission violation with present leaf: gpa={}, qual=0x{:x}",
            gpa,
            qual.raw()
        );
        return Err(Error::Access);
    }

    if let Some(fault_gfn) = space.is_chunk_protected(gfn) {
        return Err(Error::ProtectedPage(fault_gfn));
    }

    // Pin the backing chunk and map the full intersection of the slot with
    // the chunk window, so neighbouring accesses do not fault again.
    let block = slot.block().clone();
    let uva_offset = slot.uva_for(gfn) - block.base_uva();
    let chunk = block.get_chunk(uva_offset, true)?.ok_or(Error::NoMemory)?;
    let (start_gfn, npages) = space.chunk_gfn_range(&slot, gfn);
    let base_offset = slot.uva_for(start_gfn) - chunk.base_uva();
    let perm = if slot.is_readonly() {
        EptPerm::RX
    } else {
        EptPerm::FULL
    };
    let created = tree.create_entries(start_gfn, npages, perm, |i| {
        chunk.pfn_at(base_offset + (i << 12))
    })?;
    Ok(Violation::Filled(created))
}

/// Repair the translation path of `gpa` after an EPT-misconfiguration exit.
///
/// Every entry on the walk is checked: a non-present entry with stray bits
/// is cleared, a present entry whose reserved bits violate `reserved_mask`
/// (derived from MAXPHYADDR) is rewritten to its canonical form, preserving
/// the PFN and the accessed flag. All repairs go through CAS so concurrent
/// fixers cannot double-apply. Returns the number of entries fixed.
pub fn handle_misconfiguration(
    space: &GpaSpace,
    tree: &EptTree,
    gpa: Gpa,
    reserved_mask: u64,
) -> Result<u64> {
    let gfn = gpa.gfn();
    let mut fixed = 0;
    tree.walk(gfn, |level, entry| {
        let old = Epte::from_raw(entry.load(Ordering::Acquire));
        let canonical = if !old.is_present() {
            if old.raw() == 0 {
                return;
            }
            // Stray bits in a non-present entry (stale sentinel).
            Epte::ZERO
        } else if old.raw() & reserved_mask != 0 {
            if level == 0 {
                match space.slot_for(gfn) {
                    Some(slot) => {
                        let perm = if slot.is_readonly() {
                            EptPerm::RX
                        } else {
                            EptPerm::FULL
                        };
                        let mut e = Epte::leaf(old.pfn(), perm);
                        if old.accessed() {
                            e = Epte::from_raw(e.raw() | (1 << 8));
                        }
                        e
                    }
                    // Unbacked frame: the leaf must not exist at all.
                    None => Epte::ZERO,
                }
            } else {
                Epte::table(old.pfn())
            }
        } else {
            return;
        };
        // The violating bits live inside the PFN field; strip them from the
        // canonical image as well.
        let canonical = Epte::from_raw(canonical.raw() & !reserved_mask);
        if entry
            .compare_exchange(
                old.raw(),
                canonical.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            fixed += 1;
        }
    })?;
    Ok(fixed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemSlotFlags;
    use haxhal::mock::install_mock;

    fn ram_space(npages: u64) -> (GpaSpace, u64) {
        let mock = install_mock();
        let uva = mock.alloc_user((npages << 12) as usize);
        let space = GpaSpace::new();
        space.add_ramblock(uva, npages << 12).unwrap();
        space.set_ram(0, npages, uva, MemSlotFlags::empty()).unwrap();
        (space, uva)
    }

    #[test]
    fn miss_on_unbacked_gpa_is_mmio() {
        let (space, _) = ram_space(0x100);
        let tree = EptTree::new().unwrap();
        let r = handle_access_violation(
            &space,
            &tree,
            EptViolationQual::from_raw(0x2), // write, no perms
            Gpa::new(0xf000_0000).unwrap(),
        )
        .unwrap();
        assert_eq!(r, Violation::Mmio);
    }

    #[test]
    fn lazy_miss_installs_whole_chunk() {
        // A 4 MiB mapping is two chunks; fault in the second one.
        let (space, uva) = ram_space(0x400);
        let tree = EptTree::new().unwrap();
        let r = handle_access_violation(
            &space,
            &tree,
            EptViolationQual::from_raw(0x2),
            Gpa::new(0x20_0000).unwrap(),
        )
        .unwrap();
        // All 512 frames of chunk 1, installed in one call.
        assert_eq!(r, Violation::Filled(0x200));
        assert!(!tree.get_entry(0x1ff).unwrap().is_present());
        let leaf = tree.get_entry(0x200).unwrap();
        assert!(leaf.is_present());
        assert_eq!(leaf.pfn(), (uva >> 12) + 0x200);
        assert!(tree.get_entry(0x3ff).unwrap().is_present());
    }

    #[test]
    fn rom_write_goes_to_device_model() {
        let mock = install_mock();
        let uva = mock.alloc_user(0x10000);
        let space = GpaSpace::new();
        space.add_ramblock(uva, 0x10000).unwrap();
        space.set_ram(0, 0x10, uva, MemSlotFlags::READONLY).unwrap();
        let tree = EptTree::new().unwrap();
        // Write access, leaf was present readable/executable.
        let qual = EptViolationQual::from_raw(0x2 | (0x5 << 3));
        let r = handle_access_violation(&space, &tree, qual, Gpa::new(0).unwrap()).unwrap();
        assert_eq!(r, Violation::Mmio);
    }

    #[test]
    fn present_leaf_violation_is_access_error() {
        let (space, _) = ram_space(0x10);
        let tree = EptTree::new().unwrap();
        let qual = EptViolationQual::from_raw(0x2 | (0x7 << 3));
        assert_eq!(
            handle_access_violation(&space, &tree, qual, Gpa::new(0).unwrap()),
            Err(Error::Access)
        );
    }

    #[test]
    fn protected_chunk_reports_fault_gfn() {
        let (space, _) = ram_space(0x200);
        let tree = EptTree::new().unwrap();
        space
            .protect_range(Gpa::new(0x7000).unwrap(), 0x1000, crate::memory::GPA_PROT_NONE)
            .unwrap();
        // A fault anywhere in the chunk reports the protected frame.
        assert_eq!(
            handle_access_violation(
                &space,
                &tree,
                EptViolationQual::from_raw(0x1),
                Gpa::new(0x100_000).unwrap()
            ),
            Err(Error::ProtectedPage(7))
        );
    }

    #[test]
    fn misconfigured_leaf_repaired() {
        let (space, uva) = ram_space(0x10);
        let tree = EptTree::new().unwrap();
        let pfn = (uva >> 12) + 3;
        // A leaf with bits above MAXPHYADDR set.
        let mask = 0x000f_0000_0000_0000u64;
        let bad = Epte::from_raw(Epte::leaf(pfn, EptPerm::FULL).raw() | mask);
        tree.create_entry(3, bad).unwrap();
        let fixed = handle_misconfiguration(&space, &tree, Gpa::new(0x3000).unwrap(), mask)
            .unwrap();
        assert_eq!(fixed, 1);
        let leaf = tree.get_entry(3).unwrap();
        assert_eq!(leaf.raw() & mask, 0);
        assert_eq!(leaf.pfn(), pfn);
        assert!(leaf.perm().contains(EptPerm::FULL));
    }
}

//! Guest-physical address space facade.

use super::memslot::{self, MemSlot, MemSlotFlags, MemSlotListener, SlotChange};
use super::ramblock::RamBlockList;
use super::Gpa;
use crate::config::HAX_CHUNK_PAGES;
use crate::{Error, Result};
use alloc::sync::Arc;
use alloc::vec::Vec;
use haxhal::mm::KvaMapping;
use haxhal::{SpinLock, PAGE_SIZE};

/// PFN returned for guest frames with no RAM backing.
pub const INVALID_PFN: u64 = u64::MAX;

/// `protect_range` flags value meaning "no access".
pub const GPA_PROT_NONE: u32 = 0;
/// `protect_range` flags value meaning "clear protection".
pub const GPA_PROT_ALL: u32 = 0x7;

struct Inner {
    blocks: RamBlockList,
    slots: Vec<MemSlot>,
}

/// One per VM: RAM blocks, memory slots, listeners, protection bitmap.
pub struct GpaSpace {
    inner: SpinLock<Inner>,
    listeners: SpinLock<Vec<Arc<dyn MemSlotListener>>>,
    // One bit per GFN; grows monotonically as higher GFNs get protected.
    prot: SpinLock<Vec<u64>>,
}

impl GpaSpace {
    /// Create an empty address space.
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(Inner {
                blocks: RamBlockList::new(),
                slots: Vec::new(),
            }),
            listeners: SpinLock::new(Vec::new()),
            prot: SpinLock::new(Vec::new()),
        }
    }

    /// Register a listener for mapping changes.
    pub fn register_listener(&self, listener: Arc<dyn MemSlotListener>) {
        self.listeners.lock().push(listener);
    }

    /// Register a RAM block covering `[base_uva, base_uva + size)`.
    pub fn add_ramblock(&self, base_uva: u64, size: u64) -> Result<()> {
        self.inner.lock().blocks.add(base_uva, size).map(|_| ())
    }

    /// Install, replace, or remove the mapping of a GFN range (the
    /// `SET_RAM` semantics). Listener callbacks fire after the list
    /// settles.
    pub fn set_ram(
        &self,
        start_gfn: u64,
        npages: u64,
        uva: u64,
        flags: MemSlotFlags,
    ) -> Result<()> {
        let changes = {
            let mut inner = self.inner.lock();
            let Inner { blocks, slots } = &mut *inner;
            memslot::set_mapping(slots, blocks, start_gfn, npages, uva, flags)?
        };
        self.notify(&changes);
        Ok(())
    }

    fn notify(&self, changes: &[SlotChange]) {
        use super::memslot::MappingChange;
        let listeners = self.listeners.lock().clone();
        for c in changes {
            for l in &listeners {
                match c.change {
                    MappingChange::Added => l.mapping_added(c.start_gfn, c.npages),
                    MappingChange::Removed => l.mapping_removed(c.start_gfn, c.npages),
                    MappingChange::Changed => l.mapping_changed(c.start_gfn, c.npages),
                }
            }
        }
    }

    /// A detached copy of the slot covering `gfn`.
    pub fn slot_for(&self, gfn: u64) -> Option<MemSlot> {
        let inner = self.inner.lock();
        memslot::find(&inner.slots, gfn).cloned()
    }

    /// Number of installed slots.
    pub fn slot_count(&self) -> usize {
        self.inner.lock().slots.len()
    }

    /// Resolve `gfn` to a host PFN, pinning the backing chunk on demand.
    /// Returns `INVALID_PFN` (with empty flags) for unbacked frames.
    pub fn get_pfn(&self, gfn: u64) -> (u64, MemSlotFlags) {
        let Some(slot) = self.slot_for(gfn) else {
            return (INVALID_PFN, MemSlotFlags::empty());
        };
        match self.pfn_of(&slot, gfn) {
            Ok(pfn) => (pfn, slot.flags()),
            Err(_) => (INVALID_PFN, slot.flags()),
        }
    }

    fn pfn_of(&self, slot: &MemSlot, gfn: u64) -> Result<u64> {
        let uva = slot.uva_for(gfn);
        let block = slot.block();
        let uva_offset = uva - block.base_uva();
        let chunk = block
            .get_chunk(uva_offset, true)?
            .ok_or(Error::NoMemory)?;
        Ok(chunk.pfn_at(uva - chunk.base_uva()))
    }

    /// Map one guest frame into kernel space. The caller drops the mapping
    /// when done; `writable` reflects the slot protection.
    pub fn map_page(&self, gfn: u64) -> Result<(KvaMapping, bool)> {
        let slot = self.slot_for(gfn).ok_or(Error::InvalidParam)?;
        let pfn = self.pfn_of(&slot, gfn)?;
        let kmap = KvaMapping::new(pfn).ok_or(Error::NoMemory)?;
        Ok((kmap, !slot.is_readonly()))
    }

    /// Copy guest memory into `dst`, walking slots and chunks. Returns the
    /// byte count actually copied; an error on the first page is an error,
    /// a later failure is a short read.
    pub fn read_data(&self, start_gpa: Gpa, dst: &mut [u8]) -> Result<usize> {
        self.copy_data(start_gpa, dst.len(), |kva, off, n, copied| unsafe {
            core::ptr::copy_nonoverlapping(
                (kva.into_usize() + off) as *const u8,
                dst[copied..].as_mut_ptr(),
                n,
            );
        }, false)
    }

    /// Copy `src` into guest memory. Writes to a read-only slot fail with
    /// `Access`. Short writes are reported by the return value.
    pub fn write_data(&self, start_gpa: Gpa, src: &[u8]) -> Result<usize> {
        self.copy_data(start_gpa, src.len(), |kva, off, n, copied| unsafe {
            core::ptr::copy_nonoverlapping(
                src[copied..].as_ptr(),
                (kva.into_usize() + off) as *mut u8,
                n,
            );
        }, true)
    }

    fn copy_data(
        &self,
        start_gpa: Gpa,
        len: usize,
        mut copy: impl FnMut(haxhal::Va, usize, usize, usize),
        is_write: bool,
    ) -> Result<usize> {
        let mut copied = 0usize;
        let mut gpa = start_gpa;
        while copied < len {
            let page_off = gpa.page_offset() as usize;
            let n = (PAGE_SIZE - page_off).min(len - copied);
            let r = (|| -> Result<KvaMapping> {
                let slot = self.slot_for(gpa.gfn()).ok_or(Error::InvalidParam)?;
                if is_write && slot.is_readonly() {
                    return Err(Error::Access);
                }
                let pfn = self.pfn_of(&slot, gpa.gfn())?;
                KvaMapping::new(pfn).ok_or(Error::NoMemory)
            })();
            match r {
                Ok(kmap) => copy(kmap.va(), page_off, n, copied),
                Err(e) if copied == 0 => return Err(e),
                Err(_) => break,
            }
            copied += n;
            gpa += n as u64;
        }
        Ok(copied)
    }

    // -- page protection ----------------------------------------------------

    /// Flip protection bits over `[start_gpa, start_gpa + len)`. `flags` of
    /// `GPA_PROT_NONE` protects (no access); `GPA_PROT_ALL` clears. The
    /// affected translations are invalidated through the listeners so the
    /// next guest access faults.
    pub fn protect_range(&self, start_gpa: Gpa, len: u64, flags: u32) -> Result<()> {
        if len == 0 {
            return Err(Error::InvalidParam);
        }
        let protect = match flags {
            GPA_PROT_NONE => true,
            GPA_PROT_ALL => false,
            _ => return Err(Error::InvalidParam),
        };
        let first_gfn = start_gpa.gfn();
        let last_gfn = (start_gpa.into_u64() + len - 1) >> 12;
        {
            let mut prot = self.prot.lock();
            let need = (last_gfn / 64 + 1) as usize;
            if prot.len() < need {
                prot.resize(need, 0);
            }
            for gfn in first_gfn..=last_gfn {
                let (word, bit) = ((gfn / 64) as usize, gfn % 64);
                if protect {
                    prot[word] |= 1 << bit;
                } else {
                    prot[word] &= !(1 << bit);
                }
            }
        }
        if protect {
            let listeners = self.listeners.lock().clone();
            for l in &listeners {
                l.mapping_changed(first_gfn, last_gfn - first_gfn + 1);
            }
        }
        Ok(())
    }

    /// Whether `gfn` is currently protected.
    pub fn is_page_protected(&self, gfn: u64) -> bool {
        let prot = self.prot.lock();
        let (word, bit) = ((gfn / 64) as usize, gfn % 64);
        prot.get(word).map_or(false, |w| w & (1 << bit) != 0)
    }

    /// Scan the whole 2 MiB chunk containing `gfn`; if any frame in it is
    /// protected, return that frame. The check is chunk-coarse because the
    /// pinning granularity is a chunk, not a page: installing EPT entries
    /// for any page of the chunk would expose all of it.
    pub fn is_chunk_protected(&self, gfn: u64) -> Option<u64> {
        let slot = self.slot_for(gfn)?;
        let (start_gfn, npages) = self.chunk_gfn_range(&slot, gfn);
        (start_gfn..start_gfn + npages).find(|&g| self.is_page_protected(g))
    }

    /// The GFN image of the chunk containing `gfn`: the intersection of the
    /// slot's GFN range with the backing chunk's UVA window.
    pub fn chunk_gfn_range(&self, slot: &MemSlot, gfn: u64) -> (u64, u64) {
        let block = slot.block();
        let uva_offset = slot.uva_for(gfn) - block.base_uva();
        let chunk_lo = uva_offset & !((HAX_CHUNK_PAGES << 12) - 1);
        let chunk_hi = (chunk_lo + (HAX_CHUNK_PAGES << 12)).min(block.size());
        let slot_lo = slot.offset_within_block();
        let slot_hi = slot_lo + (slot.npages() << 12);
        let lo = chunk_lo.max(slot_lo);
        let hi = chunk_hi.min(slot_hi);
        let start_gfn = slot.base_gfn() + ((lo - slot_lo) >> 12);
        (start_gfn, (hi - lo) >> 12)
    }

    /// Tear down all slots and blocks (VM destruction).
    pub fn teardown(&self) {
        let mut inner = self.inner.lock();
        let Inner { blocks, slots } = &mut *inner;
        for s in slots.drain(..) {
            blocks.deref_block(s.block());
        }
    }
}

impl Default for GpaSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU64, Ordering};
    use haxhal::mock::install_mock;

    fn space_with_ram(npages: u64) -> (GpaSpace, u64) {
        let mock = install_mock();
        let uva = mock.alloc_user((npages << 12) as usize);
        let space = GpaSpace::new();
        space.add_ramblock(uva, npages << 12).unwrap();
        space
            .set_ram(0, npages, uva, MemSlotFlags::empty())
            .unwrap();
        (space, uva)
    }

    #[test]
    fn read_write_round_trip() {
        let (space, _) = space_with_ram(0x200);
        let gpa = Gpa::new(0x1ffe).unwrap(); // straddles a page boundary
        let data = [0xde, 0xad, 0xbe, 0xef, 0x55];
        assert_eq!(space.write_data(gpa, &data).unwrap(), data.len());
        let mut back = [0u8; 5];
        assert_eq!(space.read_data(gpa, &mut back).unwrap(), back.len());
        assert_eq!(back, data);
    }

    #[test]
    fn write_to_rom_denied() {
        let mock = install_mock();
        let uva = mock.alloc_user(0x10000);
        let space = GpaSpace::new();
        space.add_ramblock(uva, 0x10000).unwrap();
        space.set_ram(0, 0x10, uva, MemSlotFlags::READONLY).unwrap();
        let gpa = Gpa::new(0).unwrap();
        assert_eq!(space.write_data(gpa, &[1, 2, 3]), Err(Error::Access));
        // Reads still work.
        let mut b = [0u8; 3];
        assert_eq!(space.read_data(gpa, &mut b).unwrap(), 3);
    }

    #[test]
    fn mmio_access_is_invalid() {
        let (space, _) = space_with_ram(0x100);
        let gpa = Gpa::new(0x100 << 12).unwrap();
        let mut b = [0u8; 4];
        assert_eq!(space.read_data(gpa, &mut b), Err(Error::InvalidParam));
        assert_eq!(space.get_pfn(0x100).0, INVALID_PFN);
    }

    #[test]
    fn short_read_at_slot_end() {
        let (space, _) = space_with_ram(0x10);
        let gpa = Gpa::new(0xf000).unwrap();
        let mut b = [0u8; 0x2000];
        // One page of RAM, then the hole: short read.
        assert_eq!(space.read_data(gpa, &mut b).unwrap(), 0x1000);
    }

    #[test]
    fn protect_and_clear() {
        let (space, _) = space_with_ram(0x400);
        space
            .protect_range(Gpa::new(0x5000).unwrap(), 0x3000, GPA_PROT_NONE)
            .unwrap();
        assert!(space.is_page_protected(5));
        assert!(space.is_page_protected(7));
        assert!(!space.is_page_protected(8));
        // Any page of the containing chunk reports the protected frame.
        assert_eq!(space.is_chunk_protected(0x100), Some(5));
        space
            .protect_range(Gpa::new(0x5000).unwrap(), 0x3000, GPA_PROT_ALL)
            .unwrap();
        assert_eq!(space.is_chunk_protected(0x100), None);
    }

    #[test]
    fn protect_notifies_listeners() {
        struct Counter(AtomicU64);
        impl MemSlotListener for Counter {
            fn mapping_changed(&self, start_gfn: u64, npages: u64) {
                self.0.store((start_gfn << 32) | npages, Ordering::SeqCst);
            }
        }
        let (space, _) = space_with_ram(0x100);
        let counter = Arc::new(Counter(AtomicU64::new(0)));
        space.register_listener(counter.clone());
        space
            .protect_range(Gpa::new(0x4000).unwrap(), 0x2000, GPA_PROT_NONE)
            .unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), (4 << 32) | 2);
    }

    #[test]
    fn get_pfn_resolves_ram() {
        let (space, uva) = space_with_ram(0x100);
        let (pfn, flags) = space.get_pfn(0x42);
        assert_eq!(pfn, (uva >> 12) + 0x42);
        assert!(!flags.contains(MemSlotFlags::READONLY));
    }
}

//! Memory slots: the GFN → UVA mapping.

use super::ramblock::{RamBlock, RamBlockList};
use crate::{Error, Result};
use alloc::sync::Arc;
use alloc::vec::Vec;

bitflags::bitflags! {
    /// Flags of one `set_ram` request / installed slot.
    pub struct MemSlotFlags: u32 {
        /// The range is mapped read-only (ROM).
        const READONLY = 1 << 0;
        /// Create a disposable RAM block for this slot implicitly.
        const STANDALONE = 1 << 6;
        /// The range is unmapped (MMIO hole); `uva` must be zero.
        const INVALID = 1 << 7;
    }
}

/// How one GFN range of a `set_ram` call changed, for listener dispatch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MappingChange {
    /// MMIO hole became RAM/ROM.
    Added,
    /// RAM/ROM became an MMIO hole.
    Removed,
    /// RAM/ROM stayed RAM/ROM but UVA or protection changed.
    Changed,
}

/// One GFN sub-range affected by a `set_ram` call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SlotChange {
    pub start_gfn: u64,
    pub npages: u64,
    pub change: MappingChange,
}

/// Observer of slot-list changes. The EPT engine registers one to shoot
/// down stale translations; every callback invalidates, the taxonomy is
/// kept for future listeners.
pub trait MemSlotListener: Send + Sync {
    fn mapping_added(&self, _start_gfn: u64, _npages: u64) {}
    fn mapping_removed(&self, _start_gfn: u64, _npages: u64) {}
    fn mapping_changed(&self, _start_gfn: u64, _npages: u64) {}
}

/// A guest-frame range backed by an offset into a RAM block.
///
/// Cloning hands out a detached copy for lock-free use: the backing block
/// stays alive through the `Arc`, while the memslot reference count stays
/// owned by the slot list.
#[derive(Clone)]
pub struct MemSlot {
    base_gfn: u64,
    npages: u64,
    block: Arc<RamBlock>,
    offset_within_block: u64,
    flags: MemSlotFlags,
}

impl MemSlot {
    /// First GFN of the slot.
    #[inline]
    pub fn base_gfn(&self) -> u64 {
        self.base_gfn
    }

    /// Number of guest pages.
    #[inline]
    pub fn npages(&self) -> u64 {
        self.npages
    }

    /// One past the last GFN.
    #[inline]
    pub fn end_gfn(&self) -> u64 {
        self.base_gfn + self.npages
    }

    /// Slot flags.
    #[inline]
    pub fn flags(&self) -> MemSlotFlags {
        self.flags
    }

    /// Whether guest writes must fault.
    #[inline]
    pub fn is_readonly(&self) -> bool {
        self.flags.contains(MemSlotFlags::READONLY)
    }

    /// Backing block.
    #[inline]
    pub fn block(&self) -> &Arc<RamBlock> {
        &self.block
    }

    /// Byte offset of the slot's first page within the block.
    #[inline]
    pub fn offset_within_block(&self) -> u64 {
        self.offset_within_block
    }

    /// UVA backing `gfn`, which must fall inside the slot.
    #[inline]
    pub fn uva_for(&self, gfn: u64) -> u64 {
        debug_assert!(gfn >= self.base_gfn && gfn < self.end_gfn());
        self.block.base_uva() + self.offset_within_block + ((gfn - self.base_gfn) << 12)
    }

    fn contains(&self, gfn: u64) -> bool {
        gfn >= self.base_gfn && gfn < self.end_gfn()
    }

    /// Whether `other` can be glued to the end of `self`: same block, same
    /// flags, and UVA-offset progression matching the GFN progression.
    fn same_type_adjacent(&self, other: &MemSlot) -> bool {
        Arc::ptr_eq(&self.block, &other.block)
            && self.flags == other.flags
            && self.end_gfn() == other.base_gfn
            && self.offset_within_block + (self.npages << 12) == other.offset_within_block
    }
}

/// Find the slot covering `gfn`.
pub fn find(slots: &[MemSlot], gfn: u64) -> Option<&MemSlot> {
    let pos = slots.partition_point(|s| s.end_gfn() <= gfn);
    slots.get(pos).filter(|s| s.contains(gfn))
}

/// REPLACE `[start_gfn, start_gfn + npages)` with a new mapping (or a hole).
///
/// Walks the sorted slot list, splitting/trimming/deleting whatever the
/// target range overlaps, inserts the new slot if the request is valid, and
/// coalesces same-type neighbors. Returns the per-sub-range changes for the
/// caller to broadcast.
pub fn set_mapping(
    slots: &mut Vec<MemSlot>,
    blocks: &mut RamBlockList,
    start_gfn: u64,
    npages: u64,
    uva: u64,
    flags: MemSlotFlags,
) -> Result<Vec<SlotChange>> {
    if npages == 0 {
        return Err(Error::InvalidParam);
    }
    let end_gfn = start_gfn + npages;
    let is_valid = !flags.contains(MemSlotFlags::INVALID);
    if !is_valid && uva != 0 {
        return Err(Error::InvalidParam);
    }

    // Resolve the backing block first so argument errors leave the list
    // untouched.
    let new_block = if is_valid {
        let block = if flags.contains(MemSlotFlags::STANDALONE) {
            let block = blocks.add(uva, npages << 12)?;
            block.set_standalone();
            block
        } else {
            blocks.find(uva).ok_or_else(|| {
                error!("set_ram: no RAM block covers uva 0x{:x}", uva);
                Error::InvalidParam
            })?
        };
        let offset = uva - block.base_uva();
        if offset + (npages << 12) > block.size() {
            return Err(Error::InvalidParam);
        }
        Some((block, offset))
    } else {
        None
    };

    // Snapshot the old coverage of the target range.
    let mut old_segs: Vec<(u64, u64, Option<(u64, MemSlotFlags)>)> = Vec::new();
    let mut cursor = start_gfn;
    for s in slots.iter() {
        if s.end_gfn() <= start_gfn || s.base_gfn >= end_gfn {
            continue;
        }
        let s0 = s.base_gfn.max(start_gfn);
        let s1 = s.end_gfn().min(end_gfn);
        if s0 > cursor {
            old_segs.push((cursor, s0, None));
        }
        old_segs.push((s0, s1, Some((s.uva_for(s0), s.flags))));
        cursor = s1;
    }
    if cursor < end_gfn {
        old_segs.push((cursor, end_gfn, None));
    }

    // Split, trim, or delete every overlapped slot.
    let mut i = 0;
    while i < slots.len() {
        let (s_base, s_end) = (slots[i].base_gfn, slots[i].end_gfn());
        if s_end <= start_gfn {
            i += 1;
            continue;
        }
        if s_base >= end_gfn {
            break;
        }
        if s_base < start_gfn && s_end > end_gfn {
            // Straddles both edges: keep the head, split off the tail.
            let tail_pages = s_end - end_gfn;
            let tail = {
                let s = &slots[i];
                blocks.ref_block(&s.block);
                MemSlot {
                    base_gfn: end_gfn,
                    npages: tail_pages,
                    block: s.block.clone(),
                    offset_within_block: s.offset_within_block
                        + ((end_gfn - s_base) << 12),
                    flags: s.flags,
                }
            };
            slots[i].npages = start_gfn - s_base;
            slots.insert(i + 1, tail);
            i += 2;
        } else if s_base < start_gfn {
            // Head survives.
            slots[i].npages = start_gfn - s_base;
            i += 1;
        } else if s_end > end_gfn {
            // Tail survives.
            let s = &mut slots[i];
            s.offset_within_block += (end_gfn - s_base) << 12;
            s.base_gfn = end_gfn;
            s.npages = s_end - end_gfn;
            i += 1;
        } else {
            // Fully covered.
            let s = slots.remove(i);
            blocks.deref_block(&s.block);
        }
    }

    // Install the replacement and coalesce at the seams.
    if let Some((block, offset)) = new_block {
        blocks.ref_block(&block);
        let slot = MemSlot {
            base_gfn: start_gfn,
            npages,
            block,
            offset_within_block: offset,
            flags,
        };
        let pos = slots.partition_point(|s| s.end_gfn() <= start_gfn);
        slots.insert(pos, slot);

        if pos + 1 < slots.len() && slots[pos].same_type_adjacent(&slots[pos + 1]) {
            let next = slots.remove(pos + 1);
            slots[pos].npages += next.npages;
            blocks.deref_block(&next.block);
        }
        if pos > 0 && slots[pos - 1].same_type_adjacent(&slots[pos]) {
            let cur = slots.remove(pos);
            slots[pos - 1].npages += cur.npages;
            blocks.deref_block(&cur.block);
        }
    }

    // Turn the old/new coverage diff into listener events.
    let mut changes = Vec::new();
    for (s0, s1, old) in old_segs {
        let change = match (old, is_valid) {
            (Some(_), false) => Some(MappingChange::Removed),
            (None, true) => Some(MappingChange::Added),
            (Some((old_uva, old_flags)), true) => {
                let new_uva = uva + ((s0 - start_gfn) << 12);
                let ro_changed = (old_flags ^ flags).contains(MemSlotFlags::READONLY);
                (old_uva != new_uva || ro_changed).then(|| MappingChange::Changed)
            }
            (None, false) => None,
        };
        if let Some(change) = change {
            changes.push(SlotChange {
                start_gfn: s0,
                npages: s1 - s0,
                change,
            });
        }
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use haxhal::mock::install_mock;

    struct Fixture {
        slots: Vec<MemSlot>,
        blocks: RamBlockList,
        uva: u64,
    }

    impl Fixture {
        fn new(size: u64) -> Self {
            let mock = install_mock();
            let uva = mock.alloc_user(size as usize);
            let mut blocks = RamBlockList::new();
            blocks.add(uva, size).unwrap();
            Self {
                slots: Vec::new(),
                blocks,
                uva,
            }
        }

        fn set(
            &mut self,
            start_gfn: u64,
            npages: u64,
            uva: u64,
            flags: MemSlotFlags,
        ) -> Result<Vec<SlotChange>> {
            set_mapping(&mut self.slots, &mut self.blocks, start_gfn, npages, uva, flags)
        }

        fn assert_sorted_disjoint(&self) {
            for w in self.slots.windows(2) {
                assert!(w[0].end_gfn() <= w[1].base_gfn());
            }
        }
    }

    #[test]
    fn install_and_find() {
        let mut f = Fixture::new(0x40_0000);
        f.set(0x100, 0x100, f.uva, MemSlotFlags::empty()).unwrap();
        assert!(find(&f.slots, 0xff).is_none());
        let s = find(&f.slots, 0x180).unwrap();
        assert_eq!(s.base_gfn(), 0x100);
        assert_eq!(s.uva_for(0x180), f.uva + (0x80 << 12));
        assert!(find(&f.slots, 0x200).is_none());
    }

    #[test]
    fn adjacent_same_type_slots_coalesce() {
        let mut f = Fixture::new(0x20_0000);
        f.set(0, 0x100, f.uva, MemSlotFlags::empty()).unwrap();
        f.set(0x100, 0x100, f.uva + 0x10_0000, MemSlotFlags::empty())
            .unwrap();
        assert_eq!(f.slots.len(), 1);
        assert_eq!(f.slots[0].base_gfn(), 0);
        assert_eq!(f.slots[0].npages(), 0x200);
        f.assert_sorted_disjoint();
    }

    #[test]
    fn different_uva_progression_does_not_coalesce() {
        let mut f = Fixture::new(0x30_0000);
        f.set(0, 0x100, f.uva, MemSlotFlags::empty()).unwrap();
        // GFN-adjacent but skips a block page run.
        f.set(0x100, 0x100, f.uva + 0x20_0000, MemSlotFlags::empty())
            .unwrap();
        assert_eq!(f.slots.len(), 2);
    }

    #[test]
    fn readonly_does_not_coalesce_with_ram() {
        let mut f = Fixture::new(0x20_0000);
        f.set(0, 0x100, f.uva, MemSlotFlags::empty()).unwrap();
        f.set(0x100, 0x100, f.uva + 0x10_0000, MemSlotFlags::READONLY)
            .unwrap();
        assert_eq!(f.slots.len(), 2);
    }

    #[test]
    fn replace_middle_splits_slot() {
        let mut f = Fixture::new(0x40_0000);
        f.set(0, 0x400, f.uva, MemSlotFlags::empty()).unwrap();
        let changes = f.set(0x100, 0x100, 0, MemSlotFlags::INVALID).unwrap();
        assert_eq!(f.slots.len(), 2);
        f.assert_sorted_disjoint();
        assert_eq!(f.slots[0].base_gfn(), 0);
        assert_eq!(f.slots[0].npages(), 0x100);
        assert_eq!(f.slots[1].base_gfn(), 0x200);
        assert_eq!(f.slots[1].npages(), 0x200);
        // The tail keeps its UVA progression.
        assert_eq!(f.slots[1].uva_for(0x200), f.uva + (0x200 << 12));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change, MappingChange::Removed);
        assert_eq!((changes[0].start_gfn, changes[0].npages), (0x100, 0x100));
    }

    #[test]
    fn unmap_then_remap_equals_single_set() {
        let mut f = Fixture::new(0x40_0000);
        f.set(0, 0x400, f.uva, MemSlotFlags::empty()).unwrap();
        f.set(0x100, 0x200, 0, MemSlotFlags::INVALID).unwrap();
        f.set(0x100, 0x200, f.uva + (0x100 << 12), MemSlotFlags::empty())
            .unwrap();
        // Same state as if only the full mapping had been issued.
        assert_eq!(f.slots.len(), 1);
        assert_eq!(f.slots[0].base_gfn(), 0);
        assert_eq!(f.slots[0].npages(), 0x400);
    }

    #[test]
    fn invalid_rejects_nonzero_uva() {
        let mut f = Fixture::new(0x10_0000);
        assert_eq!(
            f.set(0, 0x10, f.uva, MemSlotFlags::INVALID),
            Err(Error::InvalidParam)
        );
    }

    #[test]
    fn change_events_for_retype() {
        let mut f = Fixture::new(0x40_0000);
        f.set(0, 0x400, f.uva, MemSlotFlags::empty()).unwrap();
        // Same UVA, flip to ROM: a changed event, not add/remove.
        let changes = f
            .set(0x100, 0x100, f.uva + (0x100 << 12), MemSlotFlags::READONLY)
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change, MappingChange::Changed);

        // Identical re-install: no events at all.
        let changes = f
            .set(0x100, 0x100, f.uva + (0x100 << 12), MemSlotFlags::READONLY)
            .unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn add_event_covers_hole_only() {
        let mut f = Fixture::new(0x40_0000);
        f.set(0, 0x100, f.uva, MemSlotFlags::empty()).unwrap();
        // [0x80, 0x180): first half overlaps RAM with the same UVA window,
        // second half fills a hole.
        let changes = f
            .set(0x80, 0x100, f.uva + (0x80 << 12), MemSlotFlags::empty())
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change, MappingChange::Added);
        assert_eq!((changes[0].start_gfn, changes[0].npages), (0x100, 0x80));
        assert_eq!(f.slots.len(), 1);
        assert_eq!(f.slots[0].npages(), 0x180);
    }

    #[test]
    fn block_refcount_follows_slots() {
        let mut f = Fixture::new(0x40_0000);
        f.set(0, 0x400, f.uva, MemSlotFlags::empty()).unwrap();
        let block = f.slots[0].block().clone();
        assert_eq!(block.ref_count(), 1);
        // Punch a hole: one slot becomes two, both referencing the block.
        f.set(0x100, 0x100, 0, MemSlotFlags::INVALID).unwrap();
        assert_eq!(block.ref_count(), 2);
        // Remove everything.
        f.set(0, 0x400, 0, MemSlotFlags::INVALID).unwrap();
        assert_eq!(block.ref_count(), 0);
        assert!(f.slots.is_empty());
    }

    #[test]
    fn standalone_slot_creates_and_destroys_block() {
        let mock = install_mock();
        let mut f = Fixture::new(0x10_0000);
        let lone_uva = mock.alloc_user(0x10_0000);
        f.set(0x1000, 0x100, lone_uva, MemSlotFlags::STANDALONE)
            .unwrap();
        assert_eq!(f.blocks.len(), 2);
        f.set(0x1000, 0x100, 0, MemSlotFlags::INVALID).unwrap();
        assert_eq!(f.blocks.len(), 1);
    }
}

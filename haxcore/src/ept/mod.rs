//! Extended page table engine.
//!
//! A four-level table using 4 KiB pages at every level (no huge pages),
//! populated lazily from EPT-violation exits. Creation of missing tables
//! and leaves is lock-free: a 64-bit CAS publishes either the final entry
//! or a transient sentinel that marks "table under construction". The spin
//! lock only serializes non-CAS-friendly mutations (range invalidation) and
//! the owned page list.

pub mod fault;
pub mod invept;

use crate::config::{HAX_EPT_FREQ_PAGE_COUNT, SPIN_LIMIT};
use crate::{Error, Result};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use haxhal::mm::KvaMapping;
use haxhal::{PageFrame, SpinLock, Va};

bitflags::bitflags! {
    /// Permission bits of an EPT entry (Intel SDM Vol. 3C, Table 29-6).
    pub struct EptPerm: u64 {
        /// Reads allowed.
        const READ = 1 << 0;
        /// Writes allowed.
        const WRITE = 1 << 1;
        /// Instruction fetches allowed.
        const EXECUTE = 1 << 2;

        const RX = Self::READ.bits() | Self::EXECUTE.bits();
        const FULL = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

/// EPT memory type for leaf entries, bits 5:3.
const EPT_MEMTYPE_WB: u64 = 6 << 3;
/// Accessed flag, bit 8.
const EPT_ACCESSED: u64 = 1 << 8;
/// Field mask of the PFN, bits 51:12.
const EPT_PFN_MASK: u64 = 0x000f_ffff_ffff_f000;

/// One EPT entry. All accesses go through the typed accessors; raw
/// arithmetic on the numeric representation is forbidden by construction.
#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
pub struct Epte(u64);

impl Epte {
    /// The empty (not-present) entry.
    pub const ZERO: Self = Self(0);

    /// The under-construction sentinel: a full PFN field with every
    /// permission bit clear. Not-present to the hardware, non-zero to the
    /// CAS protocol.
    pub const INVALID: Self = Self(EPT_PFN_MASK);

    /// A leaf mapping `pfn` with write-back memory type.
    pub fn leaf(pfn: u64, perm: EptPerm) -> Self {
        Self(((pfn << 12) & EPT_PFN_MASK) | perm.bits() | EPT_MEMTYPE_WB)
    }

    /// A non-leaf entry referencing the table at `pfn`. Memory-type and
    /// ignore-PAT are reserved in non-leaf entries.
    pub fn table(pfn: u64) -> Self {
        Self(((pfn << 12) & EPT_PFN_MASK) | EptPerm::FULL.bits())
    }

    /// Reconstruct from a raw table word.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw table word.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether any permission bit is set.
    #[inline]
    pub fn is_present(self) -> bool {
        self.0 & EptPerm::FULL.bits() != 0
    }

    /// Permission bits.
    #[inline]
    pub fn perm(self) -> EptPerm {
        EptPerm::from_bits_truncate(self.0)
    }

    /// Referenced host frame.
    #[inline]
    pub fn pfn(self) -> u64 {
        (self.0 & EPT_PFN_MASK) >> 12
    }

    /// Accessed flag.
    #[inline]
    pub fn accessed(self) -> bool {
        self.0 & EPT_ACCESSED != 0
    }
}

impl core::fmt::Debug for Epte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Epte(0x{:x})", self.0)
    }
}

/// The EPT pointer (VMCS `Eptptr` field): write-back, 4-level walk.
#[derive(Clone, Copy, Eq, PartialEq)]
#[repr(transparent)]
pub struct Eptp(u64);

impl Eptp {
    /// Build from the PML4 frame.
    pub fn new(root_pfn: u64) -> Self {
        // memory type WB (6), walk length - 1 = 3 in bits 5:3.
        Self((root_pfn << 12) | (3 << 3) | 6)
    }

    /// The raw VMCS field value.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

const LEVEL_PML4: usize = 3;
const LEVEL_PT: usize = 0;
const TABLE_ENTRIES: u64 = 512;

#[inline]
fn table_index(gfn: u64, level: usize) -> usize {
    ((gfn >> (9 * level)) & (TABLE_ENTRIES - 1)) as usize
}

/// Frequently-used page cache slot for the table at `level` reached while
/// translating `gfn`, if it has one: the PML4 itself, PDPT[0], and the
/// first PDs under PDPT[0].
fn freq_slot(gfn: u64, level: usize) -> Option<usize> {
    match level {
        LEVEL_PML4 => Some(0),
        2 if table_index(gfn, LEVEL_PML4) == 0 => Some(1),
        1 if table_index(gfn, LEVEL_PML4) == 0
            && table_index(gfn, 2) < HAX_EPT_FREQ_PAGE_COUNT - 2 =>
        {
            Some(2 + table_index(gfn, 2))
        }
        _ => None,
    }
}

/// A handle to one EPT table page: either a permanent KVA from the
/// frequently-used cache or a temporary mapping for the walk.
enum TableHandle {
    Cached(Va),
    Temp(KvaMapping),
}

impl TableHandle {
    #[inline]
    fn entry(&self, index: usize) -> &AtomicU64 {
        let base = match self {
            TableHandle::Cached(va) => va.into_usize(),
            TableHandle::Temp(kmap) => kmap.va().into_usize(),
        };
        debug_assert!(index < TABLE_ENTRIES as usize);
        unsafe { &*((base as *const AtomicU64).add(index)) }
    }
}

struct Owned {
    /// Every allocated table page, freed en bloc at tear-down.
    pages: Vec<PageFrame>,
}

/// The per-VM extended page table.
pub struct EptTree {
    lock: SpinLock<Owned>,
    root_pfn: u64,
    /// KVAs of the frequently-used pages; 0 = not yet allocated.
    freq_kva: [AtomicUsize; HAX_EPT_FREQ_PAGE_COUNT],
    invept_pending: AtomicBool,
}

impl EptTree {
    /// Allocate the root table.
    pub fn new() -> Result<Self> {
        const NONE: AtomicUsize = AtomicUsize::new(0);
        let root = PageFrame::new().ok_or(Error::NoMemory)?;
        let tree = Self {
            root_pfn: root.pfn(),
            freq_kva: [NONE; HAX_EPT_FREQ_PAGE_COUNT],
            invept_pending: AtomicBool::new(false),
            lock: SpinLock::new(Owned { pages: Vec::new() }),
        };
        tree.freq_kva[0].store(root.va().into_usize(), Ordering::Release);
        tree.lock.lock().pages.push(root);
        Ok(tree)
    }

    /// The EPT pointer for this tree.
    pub fn eptp(&self) -> Eptp {
        Eptp::new(self.root_pfn)
    }

    /// Sticky invalidation marker: set when entries were dropped but INVEPT
    /// has not been broadcast yet.
    pub fn invept_pending(&self) -> bool {
        self.invept_pending.load(Ordering::Acquire)
    }

    /// Consume the invalidation marker (before the next guest entry).
    pub fn take_invept_pending(&self) -> bool {
        self.invept_pending.swap(false, Ordering::AcqRel)
    }

    fn table_for(&self, pfn: u64, slot: Option<usize>) -> Result<TableHandle> {
        if let Some(slot) = slot {
            let kva = self.freq_kva[slot].load(Ordering::Acquire);
            if kva != 0 {
                return Ok(TableHandle::Cached(Va::new(kva).ok_or(Error::NoMemory)?));
            }
        }
        KvaMapping::new(pfn)
            .map(TableHandle::Temp)
            .ok_or(Error::NoMemory)
    }

    fn alloc_table(&self, slot: Option<usize>) -> Result<u64> {
        let frame = PageFrame::new().ok_or(Error::NoMemory)?;
        let pfn = frame.pfn();
        if let Some(slot) = slot {
            self.freq_kva[slot].store(frame.va().into_usize(), Ordering::Release);
        }
        self.lock.lock().pages.push(frame);
        Ok(pfn)
    }

    /// Resolve (optionally creating) the child table behind `parent[index]`.
    ///
    /// Creation publishes [`Epte::INVALID`] first; the thread that wins the
    /// CAS allocates the page and overwrites the sentinel with the real
    /// entry, everyone else spins on the sentinel until publication.
    fn next_table(
        &self,
        parent: &TableHandle,
        index: usize,
        child_slot: Option<usize>,
        create: bool,
    ) -> Result<Option<u64>> {
        let entry = parent.entry(index);
        let cur = Epte::from_raw(entry.load(Ordering::Acquire));
        if cur.is_present() {
            return Ok(Some(cur.pfn()));
        }
        if !create {
            return Ok(None);
        }
        match entry.compare_exchange(
            Epte::ZERO.raw(),
            Epte::INVALID.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let pfn = match self.alloc_table(child_slot) {
                    Ok(pfn) => pfn,
                    Err(e) => {
                        entry.store(Epte::ZERO.raw(), Ordering::Release);
                        return Err(e);
                    }
                };
                entry.store(Epte::table(pfn).raw(), Ordering::Release);
                Ok(Some(pfn))
            }
            Err(_) => {
                let mut spins: u64 = 0;
                loop {
                    let cur = Epte::from_raw(entry.load(Ordering::Acquire));
                    if cur.is_present() {
                        return Ok(Some(cur.pfn()));
                    }
                    if cur == Epte::ZERO {
                        // The creator gave up; retry from scratch.
                        return self.next_table(parent, index, child_slot, create);
                    }
                    spins += 1;
                    if spins == SPIN_LIMIT {
                        error!("ept: stuck waiting for table publication");
                        return Err(Error::Busy);
                    }
                    core::hint::spin_loop();
                }
            }
        }
    }

    /// Descend to the page table (level 0) covering `gfn`.
    fn pt_for(&self, gfn: u64, create: bool) -> Result<Option<TableHandle>> {
        let mut handle = self.table_for(self.root_pfn, Some(0))?;
        for level in (LEVEL_PT + 1..=LEVEL_PML4).rev() {
            let index = table_index(gfn, level);
            let child_slot = freq_slot(gfn, level - 1);
            match self.next_table(&handle, index, child_slot, create)? {
                Some(pfn) => handle = self.table_for(pfn, child_slot)?,
                None => return Ok(None),
            }
        }
        Ok(Some(handle))
    }

    /// Install one leaf. Fails with `Exists` if a different mapping is
    /// already present.
    pub fn create_entry(&self, gfn: u64, value: Epte) -> Result<()> {
        let pt = self.pt_for(gfn, true)?.ok_or(Error::NoMemory)?;
        let entry = pt.entry(table_index(gfn, LEVEL_PT));
        match entry.compare_exchange(
            Epte::ZERO.raw(),
            value.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(cur) if cur == value.raw() => Ok(()),
            Err(_) => Err(Error::Exists),
        }
    }

    /// Install leaves for `npages` frames starting at `start_gfn`, taking
    /// PFNs from `pfn_at(page_index)`. Returns the number of leaves created
    /// (racing identical installs are benign).
    pub fn create_entries(
        &self,
        start_gfn: u64,
        npages: u64,
        perm: EptPerm,
        mut pfn_at: impl FnMut(u64) -> u64,
    ) -> Result<u64> {
        let mut created = 0;
        let mut gfn = start_gfn;
        let end = start_gfn + npages;
        while gfn < end {
            // One PT covers a 512-frame aligned span.
            let span = (TABLE_ENTRIES - (gfn & (TABLE_ENTRIES - 1))).min(end - gfn);
            let pt = self.pt_for(gfn, true)?.ok_or(Error::NoMemory)?;
            for i in 0..span {
                let value = Epte::leaf(pfn_at(gfn + i - start_gfn), perm);
                let entry = pt.entry(table_index(gfn + i, LEVEL_PT));
                match entry.compare_exchange(
                    Epte::ZERO.raw(),
                    value.raw(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => created += 1,
                    Err(cur) if cur == value.raw() => {}
                    Err(cur) => {
                        error!(
                            "ept: gfn 0x{:x} maps 0x{:x}, refusing 0x{:x}",
                            gfn + i,
                            cur,
                            value.raw()
                        );
                        return Err(Error::Exists);
                    }
                }
            }
            gfn += span;
        }
        Ok(created)
    }

    /// The leaf covering `gfn`, or `Epte::ZERO`.
    pub fn get_entry(&self, gfn: u64) -> Result<Epte> {
        match self.pt_for(gfn, false)? {
            Some(pt) => Ok(Epte::from_raw(
                pt.entry(table_index(gfn, LEVEL_PT)).load(Ordering::Acquire),
            )),
            None => Ok(Epte::ZERO),
        }
    }

    /// Clear every present leaf in `[start_gfn, start_gfn + npages)`. If any
    /// was cleared, the sticky `invept_pending` marker is raised. Returns
    /// the number of cleared leaves.
    pub fn invalidate_entries(&self, start_gfn: u64, npages: u64) -> Result<u64> {
        let _guard = self.lock.lock();
        let mut cleared = 0;
        let mut gfn = start_gfn;
        let end = start_gfn + npages;
        while gfn < end {
            let span = (TABLE_ENTRIES - (gfn & (TABLE_ENTRIES - 1))).min(end - gfn);
            match self.pt_for(gfn, false)? {
                Some(pt) => {
                    for i in 0..span {
                        let entry = pt.entry(table_index(gfn + i, LEVEL_PT));
                        let old = Epte::from_raw(entry.swap(0, Ordering::AcqRel));
                        if old.is_present() {
                            cleared += 1;
                        }
                    }
                }
                None => {}
            }
            gfn += span;
        }
        if cleared > 0 {
            self.invept_pending.fetch_or(true, Ordering::AcqRel);
        }
        Ok(cleared)
    }

    /// Root-to-leaf walk applying `visit` to the entry at every level
    /// (PML4 = 3 down to PT = 0). The visitor may mutate entries via the
    /// atomic reference; the walk stops early below a non-present entry.
    pub fn walk(
        &self,
        gfn: u64,
        mut visit: impl FnMut(usize, &AtomicU64),
    ) -> Result<()> {
        let mut handle = self.table_for(self.root_pfn, Some(0))?;
        for level in (LEVEL_PT..=LEVEL_PML4).rev() {
            let entry = handle.entry(table_index(gfn, level));
            visit(level, entry);
            if level == LEVEL_PT {
                break;
            }
            let cur = Epte::from_raw(entry.load(Ordering::Acquire));
            if !cur.is_present() {
                break;
            }
            handle = self.table_for(cur.pfn(), freq_slot(gfn, level - 1))?;
        }
        Ok(())
    }

    /// Number of table pages currently owned (root included).
    pub fn page_count(&self) -> usize {
        self.lock.lock().pages.len()
    }
}

// Table pages are only reachable through the tree.
unsafe impl Send for EptTree {}
unsafe impl Sync for EptTree {}

#[cfg(test)]
mod tests {
    use super::*;
    use haxhal::mock::install_mock;

    #[test]
    fn create_and_get_entry() {
        install_mock();
        let tree = EptTree::new().unwrap();
        assert!(!tree.get_entry(0x1234).unwrap().is_present());

        let leaf = Epte::leaf(0xabcd, EptPerm::FULL);
        tree.create_entry(0x1234, leaf).unwrap();
        let got = tree.get_entry(0x1234).unwrap();
        assert_eq!(got, leaf);
        assert_eq!(got.pfn(), 0xabcd);
        assert!(got.perm().contains(EptPerm::WRITE));
        // PML4 + PDPT + PD + PT.
        assert_eq!(tree.page_count(), 4);
    }

    #[test]
    fn duplicate_leaf_is_rejected() {
        install_mock();
        let tree = EptTree::new().unwrap();
        tree.create_entry(5, Epte::leaf(100, EptPerm::FULL)).unwrap();
        // Same value: benign.
        tree.create_entry(5, Epte::leaf(100, EptPerm::FULL)).unwrap();
        // Different value: at most one leaf may map a GFN.
        assert_eq!(
            tree.create_entry(5, Epte::leaf(101, EptPerm::FULL)),
            Err(Error::Exists)
        );
    }

    #[test]
    fn create_entries_spans_tables() {
        install_mock();
        let tree = EptTree::new().unwrap();
        // 512 frames crossing a PT boundary.
        let created = tree
            .create_entries(0x1f0, 0x200, EptPerm::FULL, |i| 0x1000 + i)
            .unwrap();
        assert_eq!(created, 0x200);
        assert_eq!(tree.get_entry(0x1f0).unwrap().pfn(), 0x1000);
        assert_eq!(tree.get_entry(0x3ef).unwrap().pfn(), 0x11ff);
        assert!(!tree.get_entry(0x3f0).unwrap().is_present());
    }

    #[test]
    fn rom_leaves_are_read_execute() {
        install_mock();
        let tree = EptTree::new().unwrap();
        tree.create_entries(0, 1, EptPerm::RX, |_| 7).unwrap();
        let e = tree.get_entry(0).unwrap();
        assert!(e.perm().contains(EptPerm::READ));
        assert!(!e.perm().contains(EptPerm::WRITE));
    }

    #[test]
    fn invalidate_sets_pending() {
        install_mock();
        let tree = EptTree::new().unwrap();
        tree.create_entries(0x100, 0x80, EptPerm::FULL, |i| 0x2000 + i)
            .unwrap();
        assert!(!tree.invept_pending());

        let cleared = tree.invalidate_entries(0x100, 0x40).unwrap();
        assert_eq!(cleared, 0x40);
        assert!(tree.invept_pending());
        assert!(!tree.get_entry(0x100).unwrap().is_present());
        assert!(tree.get_entry(0x140).unwrap().is_present());

        // Consuming the marker clears it.
        assert!(tree.take_invept_pending());
        assert!(!tree.invept_pending());

        // Invalidating an already-empty range raises nothing.
        assert_eq!(tree.invalidate_entries(0x100, 0x40).unwrap(), 0);
        assert!(!tree.invept_pending());
    }

    #[test]
    fn walk_visits_each_level() {
        install_mock();
        let tree = EptTree::new().unwrap();
        tree.create_entry(0x42, Epte::leaf(0x99, EptPerm::FULL))
            .unwrap();
        let mut levels = std::vec::Vec::new();
        tree.walk(0x42, |level, entry| {
            levels.push((level, Epte::from_raw(entry.load(Ordering::Relaxed)).is_present()));
        })
        .unwrap();
        assert_eq!(levels, vec![(3, true), (2, true), (1, true), (0, true)]);
    }

    #[test]
    fn eptp_layout() {
        let eptp = Eptp::new(0x1234);
        // WB memory type, 4-level walk, PFN in bits 51:12.
        assert_eq!(eptp.raw(), (0x1234 << 12) | (3 << 3) | 6);
    }
}

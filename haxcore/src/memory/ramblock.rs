//! RAM blocks: lazily pinned user memory.

use super::Chunk;
use crate::config::{HAX_CHUNK_SHIFT, HAX_CHUNK_SIZE, SPIN_LIMIT, SPIN_LOG_INTERVAL};
use crate::{Error, Result};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

/// A contiguous, page-aligned user-virtual range registered as guest RAM
/// backing. The range is decomposed into 2 MiB chunks pinned on first use.
///
/// `chunks_bitmap` arbitrates lazy pinning: the thread that flips bit `i`
/// from 0 to 1 owns the allocation of `chunks[i]`; everyone else spins until
/// the owner publishes the chunk (or gives the bit back on failure).
pub struct RamBlock {
    base_uva: u64,
    size: u64,
    chunks: Box<[AtomicPtr<Chunk>]>,
    chunks_bitmap: Box<[AtomicU64]>,
    ref_count: AtomicU32,
    is_standalone: AtomicBool,
}

impl core::fmt::Debug for RamBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RamBlock")
            .field("base_uva", &self.base_uva)
            .field("size", &self.size)
            .finish()
    }
}

impl PartialEq for RamBlock {
    fn eq(&self, other: &Self) -> bool {
        self.base_uva == other.base_uva && self.size == other.size
    }
}

impl RamBlock {
    fn new(base_uva: u64, size: u64) -> Result<Self> {
        if base_uva == 0 || size == 0 || base_uva & 0xfff != 0 || size & 0xfff != 0 {
            return Err(Error::InvalidParam);
        }
        let nchunks = ((size - 1) >> HAX_CHUNK_SHIFT) + 1;
        let chunks = (0..nchunks)
            .map(|_| AtomicPtr::new(core::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let chunks_bitmap = (0..(nchunks + 63) / 64)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            base_uva,
            size,
            chunks,
            chunks_bitmap,
            ref_count: AtomicU32::new(0),
            is_standalone: AtomicBool::new(false),
        })
    }

    /// Base UVA of the block.
    #[inline]
    pub fn base_uva(&self) -> u64 {
        self.base_uva
    }

    /// Length of the block in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether `uva` falls inside the block.
    #[inline]
    pub fn contains(&self, uva: u64) -> bool {
        uva >= self.base_uva && uva < self.base_uva + self.size
    }

    /// Number of chunk windows.
    #[inline]
    pub fn nchunks(&self) -> u64 {
        self.chunks.len() as u64
    }

    /// Whether the block was implicitly created for a standalone memslot.
    #[inline]
    pub fn is_standalone(&self) -> bool {
        self.is_standalone.load(Ordering::Relaxed)
    }

    pub(crate) fn set_standalone(&self) {
        self.is_standalone.store(true, Ordering::Relaxed);
    }

    /// Current reference count (memslots referencing the block).
    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::SeqCst)
    }

    #[inline]
    fn bitmap_test_and_set(&self, index: usize) -> bool {
        let (word, bit) = (index / 64, index % 64);
        self.chunks_bitmap[word].fetch_or(1 << bit, Ordering::SeqCst) & (1 << bit) != 0
    }

    #[inline]
    fn bitmap_clear(&self, index: usize) {
        let (word, bit) = (index / 64, index % 64);
        self.chunks_bitmap[word].fetch_and(!(1 << bit), Ordering::SeqCst);
    }

    #[inline]
    fn bitmap_test(&self, index: usize) -> bool {
        let (word, bit) = (index / 64, index % 64);
        self.chunks_bitmap[word].load(Ordering::SeqCst) & (1 << bit) != 0
    }

    /// The chunk covering `uva_offset`, pinning it first if `alloc` is set.
    ///
    /// Exactly one caller succeeds in pinning each chunk; concurrent callers
    /// either observe the same chunk or the pin failure.
    pub fn get_chunk(&self, uva_offset: u64, alloc: bool) -> Result<Option<&Chunk>> {
        if uva_offset >= self.size {
            warning!(
                "get_chunk: uva_offset=0x{:x} >= block size 0x{:x}",
                uva_offset,
                self.size
            );
            return Err(Error::InvalidParam);
        }
        let index = (uva_offset >> HAX_CHUNK_SHIFT) as usize;
        if !alloc {
            return Ok(unsafe { self.chunks[index].load(Ordering::Acquire).as_ref() });
        }

        if !self.bitmap_test_and_set(index) {
            // The bit was clear: this thread pins the chunk.
            let offset_low = (index as u64) << HAX_CHUNK_SHIFT;
            // The last chunk may be smaller than HAX_CHUNK_SIZE.
            let chunk_size = HAX_CHUNK_SIZE.min(self.size - offset_low);
            match Chunk::pin(self.base_uva + offset_low, chunk_size) {
                Ok(chunk) => {
                    let ptr = Box::into_raw(Box::new(chunk));
                    self.chunks[index].store(ptr, Ordering::Release);
                    Ok(Some(unsafe { &*ptr }))
                }
                Err(e) => {
                    self.bitmap_clear(index);
                    error!(
                        "get_chunk: failed to pin chunk {}: base_uva=0x{:x}, err={:?}",
                        index, self.base_uva, e
                    );
                    Err(e)
                }
            }
        } else {
            // Another caller owns the allocation; wait for publication.
            let mut spins: u64 = 0;
            loop {
                let ptr = self.chunks[index].load(Ordering::Acquire);
                if !ptr.is_null() {
                    return Ok(Some(unsafe { &*ptr }));
                }
                if !self.bitmap_test(index) {
                    // The owner reset the bit: the pin failed.
                    return Err(Error::NoMemory);
                }
                spins += 1;
                if spins % SPIN_LOG_INTERVAL == 0 {
                    info!("get_chunk: still waiting on chunk {} ({} spins)", index, spins);
                    if spins == SPIN_LIMIT {
                        error!("get_chunk: giving up on chunk {}", index);
                        return Err(Error::Busy);
                    }
                }
                core::hint::spin_loop();
            }
        }
    }

    /// Whether chunk `index` is currently pinned.
    pub fn chunk_present(&self, index: usize) -> bool {
        !self.chunks[index].load(Ordering::Acquire).is_null()
    }

    /// Unpin every chunk, keeping the descriptor and arrays ready for
    /// re-pinning on the next reference.
    fn free_chunks(&self) {
        for index in 0..self.chunks.len() {
            let ptr = self.chunks[index].swap(core::ptr::null_mut(), Ordering::AcqRel);
            if ptr.is_null() {
                continue;
            }
            // Clear the bit after the pointer so a racing get_chunk never
            // observes bit-set with a stale pointer.
            self.bitmap_clear(index);
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

impl Drop for RamBlock {
    fn drop(&mut self) {
        self.free_chunks();
    }
}

/// The per-VM list of RAM blocks, UVA-sorted and pairwise disjoint.
pub struct RamBlockList {
    blocks: Vec<Arc<RamBlock>>,
}

impl RamBlockList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    /// Register a new block. Rejects overlap with any existing block.
    pub fn add(&mut self, base_uva: u64, size: u64) -> Result<Arc<RamBlock>> {
        let block = Arc::new(RamBlock::new(base_uva, size)?);
        let pos = self
            .blocks
            .partition_point(|b| b.base_uva + b.size <= base_uva);
        if let Some(next) = self.blocks.get(pos) {
            if next.base_uva < base_uva + size {
                error!(
                    "ramblock add: 0x{:x}+0x{:x} overlaps block at 0x{:x}+0x{:x}",
                    base_uva, size, next.base_uva, next.size
                );
                return Err(Error::InvalidParam);
            }
        }
        info!("ramblock add: base_uva 0x{:x}, size 0x{:x}", base_uva, size);
        self.blocks.insert(pos, block.clone());
        Ok(block)
    }

    /// The block containing `uva`, if any.
    pub fn find(&self, uva: u64) -> Option<Arc<RamBlock>> {
        let pos = self.blocks.partition_point(|b| b.base_uva + b.size <= uva);
        self.blocks
            .get(pos)
            .filter(|b| b.contains(uva))
            .cloned()
    }

    /// Take a memslot reference on `block`.
    pub fn ref_block(&mut self, block: &Arc<RamBlock>) {
        block.ref_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop a memslot reference. On the last drop a standalone block is
    /// removed and destroyed; a normal block keeps its descriptor but
    /// unpins all chunks.
    pub fn deref_block(&mut self, block: &Arc<RamBlock>) {
        let prev = block.ref_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
        if prev != 1 {
            return;
        }
        if block.is_standalone() {
            self.blocks.retain(|b| !Arc::ptr_eq(b, block));
        } else {
            block.free_chunks();
        }
    }

    /// Number of registered blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haxhal::mock::install_mock;

    #[test]
    fn add_rejects_overlap() {
        install_mock();
        let mut list = RamBlockList::new();
        list.add(0x10_0000, 0x40_0000).unwrap();
        assert_eq!(list.add(0x20_0000, 0x1000), Err(Error::InvalidParam));
        assert_eq!(list.add(0x4f_f000, 0x2000), Err(Error::InvalidParam));
        list.add(0x50_0000, 0x1000).unwrap();
        list.add(0xf_f000, 0x1000).unwrap();
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn find_locates_containing_block() {
        install_mock();
        let mut list = RamBlockList::new();
        list.add(0x10_0000, 0x20_0000).unwrap();
        assert!(list.find(0x10_0000).is_some());
        assert!(list.find(0x2f_ffff).is_some());
        assert!(list.find(0x30_0000).is_none());
        assert!(list.find(0xf_ffff).is_none());
    }

    #[test]
    fn chunk_bitmap_tracks_presence() {
        let mock = install_mock();
        let uva = mock.alloc_user(0x40_0000);
        let mut list = RamBlockList::new();
        let block = list.add(uva, 0x40_0000).unwrap();
        assert_eq!(block.nchunks(), 2);
        assert!(!block.chunk_present(0));
        assert!(!block.chunk_present(1));

        // No allocation requested: absent chunk stays absent.
        assert!(block.get_chunk(0, false).unwrap().is_none());

        let chunk = block.get_chunk(0x20_0000, true).unwrap().unwrap();
        assert_eq!(chunk.base_uva(), uva + 0x20_0000);
        assert_eq!(chunk.size(), 0x20_0000);
        assert!(block.chunk_present(1));
        assert!(!block.chunk_present(0));
        // Bitmap bit i set iff chunks[i] != null once quiescent.
        assert!(block.bitmap_test(1));
        assert!(!block.bitmap_test(0));
    }

    #[test]
    fn tail_chunk_is_partial() {
        let mock = install_mock();
        let uva = mock.alloc_user(0x30_0000);
        let mut list = RamBlockList::new();
        let block = list.add(uva, 0x30_0000).unwrap();
        let chunk = block.get_chunk(0x2f_f000, true).unwrap().unwrap();
        assert_eq!(chunk.size(), 0x10_0000);
    }

    #[test]
    fn deref_unpins_but_keeps_descriptor() {
        let mock = install_mock();
        let uva = mock.alloc_user(0x20_0000);
        let mut list = RamBlockList::new();
        let block = list.add(uva, 0x20_0000).unwrap();
        list.ref_block(&block);
        block.get_chunk(0, true).unwrap().unwrap();
        assert!(block.chunk_present(0));

        list.deref_block(&block);
        assert!(!block.chunk_present(0));
        assert_eq!(list.len(), 1);

        // Re-reference and re-pin.
        list.ref_block(&block);
        assert!(block.get_chunk(0, true).unwrap().is_some());
    }

    #[test]
    fn standalone_block_destroyed_on_last_deref() {
        let mock = install_mock();
        let uva = mock.alloc_user(0x20_0000);
        let mut list = RamBlockList::new();
        let block = list.add(uva, 0x20_0000).unwrap();
        block.set_standalone();
        list.ref_block(&block);
        list.deref_block(&block);
        assert!(list.is_empty());
    }
}

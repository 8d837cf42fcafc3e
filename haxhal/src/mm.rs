//! Owned host memory.

use crate::addressing::{Pa, Va, PAGE_SIZE};
use crate::host::{host, RawFrame};

/// An owned, zero-filled 4 KiB host page frame with a permanent kernel
/// mapping. Freed back to the host allocator on drop.
pub struct PageFrame {
    raw: RawFrame,
}

impl PageFrame {
    /// Allocate a frame.
    #[inline]
    pub fn new() -> Option<Self> {
        host().alloc_page_frame().map(|raw| Self { raw })
    }

    /// Kernel virtual address of this frame.
    #[inline]
    pub fn va(&self) -> Va {
        self.raw.kva
    }

    /// Host physical address of this frame.
    #[inline]
    pub fn pa(&self) -> Pa {
        Pa::from_pfn(self.raw.pfn)
    }

    /// Host frame number of this frame.
    #[inline]
    pub fn pfn(&self) -> u64 {
        self.raw.pfn
    }

    /// Byte view of the frame.
    ///
    /// # Safety
    /// The caller must ensure no concurrent writer exists.
    pub unsafe fn inner(&self) -> &[u8] {
        core::slice::from_raw_parts(self.va().into_usize() as *const u8, PAGE_SIZE)
    }

    /// Mutable byte view of the frame.
    ///
    /// # Safety
    /// The caller must ensure exclusive access.
    pub unsafe fn inner_mut(&mut self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.va().into_usize() as *mut u8, PAGE_SIZE)
    }
}

// The kernel mapping is global, not thread-bound.
unsafe impl Send for PageFrame {}
unsafe impl Sync for PageFrame {}

impl Drop for PageFrame {
    fn drop(&mut self) {
        host().free_page_frame(self.raw);
    }
}

/// An owned run of physically contiguous kernel pages.
pub struct ContigBuffer {
    raw: RawFrame,
    npages: usize,
}

impl ContigBuffer {
    /// Allocate `npages` contiguous zero-filled pages.
    pub fn new(npages: usize) -> Option<Self> {
        host().alloc_contig(npages).map(|raw| Self { raw, npages })
    }

    /// Kernel virtual address of the buffer.
    #[inline]
    pub fn va(&self) -> Va {
        self.raw.kva
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.npages * PAGE_SIZE
    }

    /// Whether the buffer is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.npages == 0
    }

    /// Number of pages.
    #[inline]
    pub fn npages(&self) -> usize {
        self.npages
    }

    /// Byte view of the buffer.
    ///
    /// # Safety
    /// The caller must ensure no concurrent writer exists.
    pub unsafe fn inner(&self) -> &[u8] {
        core::slice::from_raw_parts(self.va().into_usize() as *const u8, self.len())
    }

    /// Mutable byte view of the buffer.
    ///
    /// # Safety
    /// The caller must ensure exclusive access.
    pub unsafe fn inner_mut(&mut self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.va().into_usize() as *mut u8, self.len())
    }
}

unsafe impl Send for ContigBuffer {}
unsafe impl Sync for ContigBuffer {}

impl Drop for ContigBuffer {
    fn drop(&mut self) {
        host().free_contig(self.raw, self.npages);
    }
}

/// A short-lived kernel alias of an arbitrary host frame.
///
/// Wraps [`HostApi::map_page_frame`] with guaranteed unmap on drop.
///
/// [`HostApi::map_page_frame`]: crate::host::HostApi::map_page_frame
pub struct KvaMapping {
    kva: Va,
}

impl KvaMapping {
    /// Map `pfn` into kernel space.
    pub fn new(pfn: u64) -> Option<Self> {
        host().map_page_frame(pfn).map(|kva| Self { kva })
    }

    /// Kernel virtual address of the mapping.
    #[inline]
    pub fn va(&self) -> Va {
        self.kva
    }
}

impl Drop for KvaMapping {
    fn drop(&mut self) {
        host().unmap_page_frame(self.kva);
    }
}

//! `std`-backed [`HostApi`] for unit tests.
//!
//! Frames come from the process heap with 4 KiB alignment, so a "PFN" is
//! just the heap address shifted right and every mapping is the identity.
//! The machine has one mock pCPU unless configured otherwise; `broadcast`
//! runs the callback on the calling thread once per mock pCPU.

use crate::addressing::Va;
use crate::host::{HostApi, PinError, PinnedPages, RawFrame};
use crate::kprint::LogLevel;
use crate::PAGE_SIZE;
use alloc::boxed::Box;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::eprintln;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::vec::Vec;

fn page_layout(npages: usize) -> Layout {
    Layout::from_size_align(npages * PAGE_SIZE, PAGE_SIZE).unwrap()
}

/// Test host. Install with [`install_mock`].
pub struct MockHost {
    cpus: usize,
    preempt_depth: AtomicUsize,
    user_arenas: Mutex<Vec<(usize, Layout)>>,
    kicks: Mutex<Vec<usize>>,
}

impl MockHost {
    fn new(cpus: usize) -> Self {
        Self {
            cpus,
            preempt_depth: AtomicUsize::new(0),
            user_arenas: Mutex::new(Vec::new()),
            kicks: Mutex::new(Vec::new()),
        }
    }

    /// Allocate page-aligned "user" memory and return its address, standing
    /// in for a device-model UVA.
    pub fn alloc_user(&self, size: usize) -> u64 {
        let npages = (size + PAGE_SIZE - 1) / PAGE_SIZE;
        let layout = page_layout(npages);
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        self.user_arenas.lock().unwrap().push((ptr as usize, layout));
        ptr as u64
    }

    /// CPUs this mock claims to have.
    pub fn cpus(&self) -> usize {
        self.cpus
    }

    /// Drain the list of kicked pCPU ids.
    pub fn take_kicks(&self) -> Vec<usize> {
        std::mem::take(&mut *self.kicks.lock().unwrap())
    }

    /// Current preemption-disable depth.
    pub fn preempt_depth(&self) -> usize {
        self.preempt_depth.load(Ordering::SeqCst)
    }
}

struct MockPin {
    base_uva: u64,
    size: u64,
}

impl PinnedPages for MockPin {
    fn base_uva(&self) -> u64 {
        self.base_uva
    }
    fn size(&self) -> u64 {
        self.size
    }
    fn pfn_at(&self, uva_offset: u64) -> u64 {
        (self.base_uva + uva_offset) >> 12
    }
}

impl HostApi for MockHost {
    fn alloc_page_frame(&self) -> Option<RawFrame> {
        let ptr = unsafe { alloc_zeroed(page_layout(1)) };
        if ptr.is_null() {
            return None;
        }
        Some(RawFrame {
            kva: Va::from_ptr(ptr),
            pfn: (ptr as u64) >> 12,
        })
    }

    fn free_page_frame(&self, frame: RawFrame) {
        unsafe { dealloc(frame.kva.into_usize() as *mut u8, page_layout(1)) };
    }

    fn alloc_contig(&self, npages: usize) -> Option<RawFrame> {
        let ptr = unsafe { alloc_zeroed(page_layout(npages)) };
        if ptr.is_null() {
            return None;
        }
        Some(RawFrame {
            kva: Va::from_ptr(ptr),
            pfn: (ptr as u64) >> 12,
        })
    }

    fn free_contig(&self, frame: RawFrame, npages: usize) {
        unsafe { dealloc(frame.kva.into_usize() as *mut u8, page_layout(npages)) };
    }

    fn pin_user_pages(
        &self,
        start_uva: u64,
        size: u64,
    ) -> Result<Box<dyn PinnedPages>, PinError> {
        if start_uva == 0 {
            return Err(PinError::BadAddress);
        }
        Ok(Box::new(MockPin {
            base_uva: start_uva,
            size,
        }))
    }

    fn map_page_frame(&self, pfn: u64) -> Option<Va> {
        Va::new((pfn << 12) as usize)
    }

    fn unmap_page_frame(&self, _kva: Va) {}

    fn map_to_user(&self, kva: Va, _npages: usize) -> Option<u64> {
        Some(kva.into_usize() as u64)
    }

    fn unmap_from_user(&self, _uva: u64, _npages: usize) {}

    fn cpu_count(&self) -> usize {
        self.cpus
    }

    fn cpu_id(&self) -> usize {
        0
    }

    fn broadcast(&self, f: &(dyn Fn() + Sync)) {
        for _ in 0..self.cpus {
            f();
        }
    }

    fn kick_cpu(&self, cpu_id: usize) {
        self.kicks.lock().unwrap().push(cpu_id);
    }

    fn preempt_disable(&self) {
        self.preempt_depth.fetch_add(1, Ordering::SeqCst);
    }

    fn preempt_enable(&self) {
        self.preempt_depth.fetch_sub(1, Ordering::SeqCst);
    }

    fn log(&self, level: LogLevel, args: core::fmt::Arguments<'_>) {
        eprintln!("[{:?}] {}", level, args);
    }
}

static INSTALL: Once = Once::new();
static mut MOCK: Option<&'static MockHost> = None;

/// Install a process-wide mock host (idempotent) and return it.
pub fn install_mock() -> &'static MockHost {
    INSTALL.call_once(|| {
        let mock: &'static MockHost = Box::leak(Box::new(MockHost::new(1)));
        crate::host::install(mock);
        unsafe { MOCK = Some(mock) };
    });
    unsafe { MOCK.unwrap() }
}

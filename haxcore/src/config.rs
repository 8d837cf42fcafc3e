//! Engine-wide tunables.

/// Shift of the lazy-pinning granule: RAM blocks pin user memory in 2 MiB
/// chunks.
pub const HAX_CHUNK_SHIFT: u64 = 21;
/// Size of one pinned chunk.
pub const HAX_CHUNK_SIZE: u64 = 1 << HAX_CHUNK_SHIFT;
/// Guest pages per chunk.
pub const HAX_CHUNK_PAGES: u64 = HAX_CHUNK_SIZE >> 12;

/// EPT pages kept permanently mapped: the PML4, PDPT[0], and the first
/// `HAX_EPT_FREQ_PAGE_COUNT - 2` PD tables, covering the first GiBs of
/// guest RAM without per-walk temporary mappings.
pub const HAX_EPT_FREQ_PAGE_COUNT: usize = 10;

/// Upper bound for "another thread is mid-allocation" spin waits. These
/// bounds defend against livelock bugs, not user-visible deadlines.
pub const SPIN_LIMIT: u64 = 100_000_000;
/// Spin iterations between progress log lines while waiting.
pub const SPIN_LOG_INTERVAL: u64 = 100_000;

/// Maximum vCPUs per VM.
pub const HAX_MAX_VCPUS: usize = 16;
/// Maximum VMs per engine instance.
pub const HAX_MAX_VMS: usize = 64;
/// Maximum MSR entries per SET_MSRS/GET_MSRS call.
pub const HAX_MAX_MSR_ARRAY: usize = 32;

/// Pages of the per-vCPU I/O buffer (64 KiB): bounds string I/O batching.
pub const HAX_IO_BUF_PAGES: usize = 16;

/// Current and compatible interface versions reported to the device model.
pub const HAX_CUR_VERSION: u32 = 4;
pub const HAX_COMPAT_VERSION: u32 = 1;

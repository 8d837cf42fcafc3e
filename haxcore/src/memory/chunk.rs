//! Pinned host memory for one 2 MiB window of a RAM block.

use crate::{Error, Result};
use alloc::boxed::Box;
use haxhal::host::{host, PinError, PinnedPages};

/// A pinned host-memory descriptor covering a 2 MiB (or final partial)
/// user-virtual window of a [`RamBlock`].
///
/// The pin handle is host-OS specific; all the engine ever asks of it is the
/// PFN backing a given offset.
///
/// [`RamBlock`]: super::RamBlock
pub struct Chunk {
    base_uva: u64,
    size: u64,
    pin: Box<dyn PinnedPages>,
}

impl Chunk {
    /// Pin `size` bytes of user memory at `base_uva`.
    pub fn pin(base_uva: u64, size: u64) -> Result<Self> {
        if base_uva == 0 || size == 0 || base_uva & 0xfff != 0 || size & 0xfff != 0 {
            return Err(Error::InvalidParam);
        }
        let pin = host()
            .pin_user_pages(base_uva, size)
            .map_err(|e| match e {
                PinError::BadAddress => Error::InvalidParam,
                PinError::NoMemory => Error::NoMemory,
            })?;
        Ok(Self { base_uva, size, pin })
    }

    /// Base UVA of the pinned window.
    #[inline]
    pub fn base_uva(&self) -> u64 {
        self.base_uva
    }

    /// Length of the pinned window in bytes.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Host PFN backing `uva_offset` (byte offset into this chunk).
    #[inline]
    pub fn pfn_at(&self, uva_offset: u64) -> u64 {
        debug_assert!(uva_offset < self.size);
        self.pin.pfn_at(uva_offset)
    }
}

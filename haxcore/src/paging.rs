//! Guest page-table walker.
//!
//! Translates guest-virtual to guest-physical addresses by reading the
//! guest's own paging structures through the GPA space. Used for
//! instruction fetch on MMIO exits and for string-I/O addresses; the
//! second dimension (GPA to host) is the EPT engine's business.

use crate::cpuid;
use crate::memory::{Gpa, GpaSpace, Gva};
use crate::{Error, Result};

const PTE_P: u64 = 1 << 0;
const PTE_PS: u64 = 1 << 7;
const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// Guest paging mode, derived from CR0/CR4/EFER.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PagingMode {
    /// CR0.PG = 0: physical addressing.
    Flat,
    /// 32-bit two-level paging.
    Legacy,
    /// PAE three-level paging.
    Pae,
    /// IA-32e four-level paging.
    Long,
}

/// Control-register view needed for a walk.
#[derive(Clone, Copy, Debug, Default)]
pub struct PagingView {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}

impl PagingView {
    /// The active paging mode.
    pub fn mode(&self) -> PagingMode {
        if self.cr0 & (1 << 31) == 0 {
            PagingMode::Flat
        } else if self.efer & (1 << 10) != 0 {
            // EFER.LMA
            PagingMode::Long
        } else if self.cr4 & (1 << 5) != 0 {
            // CR4.PAE
            PagingMode::Pae
        } else {
            PagingMode::Legacy
        }
    }
}

fn read_u64(space: &GpaSpace, gpa: u64) -> Result<u64> {
    let mut buf = [0u8; 8];
    if space.read_data(Gpa::new(gpa).ok_or(Error::InvalidParam)?, &mut buf)? != 8 {
        return Err(Error::InvalidParam);
    }
    Ok(u64::from_le_bytes(buf))
}

fn read_u32(space: &GpaSpace, gpa: u64) -> Result<u32> {
    let mut buf = [0u8; 4];
    if space.read_data(Gpa::new(gpa).ok_or(Error::InvalidParam)?, &mut buf)? != 4 {
        return Err(Error::InvalidParam);
    }
    Ok(u32::from_le_bytes(buf))
}

fn check_reserved(entry: u64) -> Result<()> {
    if entry & cpuid::paging_reserved_mask() != 0 {
        return Err(Error::Access);
    }
    Ok(())
}

/// Translate `gva` under the guest paging configuration in `view`.
///
/// A non-present entry or a reserved-bits violation reports `Access`; the
/// callers fall back to the full-MMIO path (instruction fetch) or fail the
/// I/O request, they never inject the #PF themselves.
pub fn gva_to_gpa(space: &GpaSpace, view: &PagingView, gva: Gva) -> Result<Gpa> {
    let va = gva.into_u64();
    match view.mode() {
        PagingMode::Flat => Gpa::new(va).ok_or(Error::InvalidParam),
        PagingMode::Long => {
            let mut table = view.cr3 & ADDR_MASK;
            for level in (0..4).rev() {
                let index = (va >> (12 + 9 * level)) & 0x1ff;
                let entry = read_u64(space, table + index * 8)?;
                if entry & PTE_P == 0 {
                    return Err(Error::Access);
                }
                check_reserved(entry)?;
                if level > 0 && entry & PTE_PS != 0 {
                    // 1 GiB or 2 MiB page.
                    let page_shift = 12 + 9 * level;
                    let base = entry & ADDR_MASK & !((1 << page_shift) - 1);
                    return Gpa::new(base | (va & ((1 << page_shift) - 1)))
                        .ok_or(Error::InvalidParam);
                }
                if level == 0 {
                    return Gpa::new((entry & ADDR_MASK) | (va & 0xfff))
                        .ok_or(Error::InvalidParam);
                }
                table = entry & ADDR_MASK;
            }
            unreachable!()
        }
        PagingMode::Pae => {
            let va = va as u32 as u64;
            // PDPT: 4 entries at CR3[31:5].
            let pdpte = read_u64(space, (view.cr3 & 0xffff_ffe0) + ((va >> 30) & 3) * 8)?;
            if pdpte & PTE_P == 0 {
                return Err(Error::Access);
            }
            check_reserved(pdpte)?;
            let pde = read_u64(space, (pdpte & ADDR_MASK) + ((va >> 21) & 0x1ff) * 8)?;
            if pde & PTE_P == 0 {
                return Err(Error::Access);
            }
            check_reserved(pde)?;
            if pde & PTE_PS != 0 {
                return Gpa::new((pde & ADDR_MASK & !0x1f_ffff) | (va & 0x1f_ffff))
                    .ok_or(Error::InvalidParam);
            }
            let pte = read_u64(space, (pde & ADDR_MASK) + ((va >> 12) & 0x1ff) * 8)?;
            if pte & PTE_P == 0 {
                return Err(Error::Access);
            }
            check_reserved(pte)?;
            Gpa::new((pte & ADDR_MASK) | (va & 0xfff)).ok_or(Error::InvalidParam)
        }
        PagingMode::Legacy => {
            let va = va as u32;
            let pde = read_u32(space, ((view.cr3 & 0xffff_f000) + ((va >> 22) * 4) as u64) as u64)?;
            if pde as u64 & PTE_P == 0 {
                return Err(Error::Access);
            }
            if pde as u64 & PTE_PS != 0 && view.cr4 & (1 << 4) != 0 {
                // 4 MiB page (CR4.PSE).
                return Gpa::new(((pde & 0xffc0_0000) as u64) | (va & 0x3f_ffff) as u64)
                    .ok_or(Error::InvalidParam);
            }
            let pte = read_u32(
                space,
                ((pde & 0xffff_f000) as u64) + (((va >> 12) & 0x3ff) * 4) as u64,
            )?;
            if pte as u64 & PTE_P == 0 {
                return Err(Error::Access);
            }
            Gpa::new(((pte & 0xffff_f000) as u64) | (va & 0xfff) as u64)
                .ok_or(Error::InvalidParam)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemSlotFlags;
    use haxhal::mock::install_mock;

    fn ram_space(npages: u64) -> GpaSpace {
        let mock = install_mock();
        let uva = mock.alloc_user((npages << 12) as usize);
        let space = GpaSpace::new();
        space.add_ramblock(uva, npages << 12).unwrap();
        space.set_ram(0, npages, uva, MemSlotFlags::empty()).unwrap();
        space
    }

    fn write_u64(space: &GpaSpace, gpa: u64, v: u64) {
        space
            .write_data(Gpa::new(gpa).unwrap(), &v.to_le_bytes())
            .unwrap();
    }

    #[test]
    fn flat_mode_is_identity() {
        let space = ram_space(0x10);
        let view = PagingView::default();
        assert_eq!(view.mode(), PagingMode::Flat);
        let gpa = gva_to_gpa(&space, &view, Gva::new(0x1234).unwrap()).unwrap();
        assert_eq!(gpa.into_u64(), 0x1234);
    }

    #[test]
    fn long_mode_4k_walk() {
        let space = ram_space(0x100);
        // Identity-ish mapping: PML4 at 0x1000, PDPT 0x2000, PD 0x3000,
        // PT 0x4000, data page 0x42000 for VA 0x5000.
        write_u64(&space, 0x1000, 0x2000 | PTE_P | 2);
        write_u64(&space, 0x2000, 0x3000 | PTE_P | 2);
        write_u64(&space, 0x3000, 0x4000 | PTE_P | 2);
        write_u64(&space, 0x4000 + 5 * 8, 0x42000 | PTE_P | 2);
        let view = PagingView {
            cr0: 1 << 31,
            cr3: 0x1000,
            cr4: 1 << 5,
            efer: 1 << 10,
        };
        assert_eq!(view.mode(), PagingMode::Long);
        let gpa = gva_to_gpa(&space, &view, Gva::new(0x5123).unwrap()).unwrap();
        assert_eq!(gpa.into_u64(), 0x42123);
        // Unmapped VA faults.
        assert_eq!(
            gva_to_gpa(&space, &view, Gva::new(0x9000).unwrap()),
            Err(Error::Access)
        );
    }

    #[test]
    fn long_mode_2m_page() {
        let space = ram_space(0x100);
        write_u64(&space, 0x1000, 0x2000 | PTE_P | 2);
        write_u64(&space, 0x2000, 0x3000 | PTE_P | 2);
        // PD[1]: 2 MiB page at 0x40_0000.
        write_u64(&space, 0x3000 + 8, 0x40_0000 | PTE_P | PTE_PS | 2);
        let view = PagingView {
            cr0: 1 << 31,
            cr3: 0x1000,
            cr4: 1 << 5,
            efer: 1 << 10,
        };
        let gpa = gva_to_gpa(&space, &view, Gva::new(0x2a_bcde).unwrap()).unwrap();
        assert_eq!(gpa.into_u64(), 0x4a_bcde);
    }

    #[test]
    fn legacy_mode_walk() {
        let space = ram_space(0x100);
        // PD at 0x1000; PD[0] -> PT 0x2000; PT[3] -> page 0x7000.
        space
            .write_data(Gpa::new(0x1000).unwrap(), &0x2003u32.to_le_bytes())
            .unwrap();
        space
            .write_data(Gpa::new(0x2000 + 3 * 4).unwrap(), &0x7003u32.to_le_bytes())
            .unwrap();
        let view = PagingView {
            cr0: 1 << 31,
            cr3: 0x1000,
            ..PagingView::default()
        };
        assert_eq!(view.mode(), PagingMode::Legacy);
        let gpa = gva_to_gpa(&space, &view, Gva::new(0x3abc).unwrap()).unwrap();
        assert_eq!(gpa.into_u64(), 0x7abc);
    }
}

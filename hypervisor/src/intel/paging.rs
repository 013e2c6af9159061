//! 4 KiB paging structures and the page-table walk.
//!
//! The walk mirrors what the MMU does for an ordinary 4-level translation:
//! it descends PML4 → PDPT → PD → PT and stops early when it hits a
//! non-present entry or a large page, returning a pointer to the entry it
//! stopped at. Callers inspect the entry to decide what that means for them.

use bitfield::bitfield;

use crate::intel::addresses::{Pa, PagingLevel, Va};

bitfield! {
    /// One entry of any 4-level paging structure (PML4E/PDPTE/PDE/PTE).
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
    /// Table 4-19. Format of a Page-Table Entry that Maps a 4-KByte Page
    #[derive(Clone, Copy)]
    pub struct PageEntry(u64);

    impl Debug;

    pub get_present, set_present: 0, 0;
    pub get_writable, set_writable: 1, 1;
    pub get_user, set_user: 2, 2;
    pub get_write_through, set_write_through: 3, 3;
    pub get_cache_disable, set_cache_disable: 4, 4;
    pub get_accessed, set_accessed: 5, 5;
    pub get_dirty, set_dirty: 6, 6;

    /// PS in a PDPTE/PDE (1 GiB / 2 MiB page); PAT in a PTE.
    pub get_large, set_large: 7, 7;

    /// Not flushed from the TLB on a CR3 switch.
    pub get_global, set_global: 8, 8;

    pub get_pfn, set_pfn: 51, 12;

    pub get_nx, set_nx: 63, 63;
}

impl PageEntry {
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn is_present(&self) -> bool {
        self.get_present() != 0
    }

    pub fn is_large(&self) -> bool {
        self.get_large() != 0
    }
}

/// Physical address of the paging-structure root named by a CR3 value.
#[inline]
pub fn cr3_table(cr3: u64) -> Pa {
    Pa::from_pfn((cr3 & 0x000f_ffff_ffff_f000) >> 12)
}

#[inline]
fn table_entry(table: Pa, index: usize) -> *mut PageEntry {
    // The direct map makes every paging structure addressable by its PA.
    unsafe { table.va().cast::<PageEntry>().add(index) }
}

impl Va {
    /// Resolves the page-table entry backing this virtual address under the
    /// paging hierarchy rooted at `cr3`, descending at most down to `level`.
    ///
    /// Stops early at a non-present entry or a large page and returns the
    /// entry it stopped at, so the caller sees exactly what the MMU would.
    pub fn pt_entry(self, cr3: u64, level: PagingLevel) -> *mut PageEntry {
        let pml4e = table_entry(cr3_table(cr3), self.index(PagingLevel::Pml4));
        let entry = unsafe { *pml4e };
        if !entry.is_present() || level == PagingLevel::Pml4 {
            return pml4e;
        }

        let pdpte = table_entry(Pa::from_pfn(entry.get_pfn()), self.index(PagingLevel::Pdpt));
        let entry = unsafe { *pdpte };
        if !entry.is_present() || entry.is_large() || level == PagingLevel::Pdpt {
            return pdpte;
        }

        let pde = table_entry(Pa::from_pfn(entry.get_pfn()), self.index(PagingLevel::Pd));
        let entry = unsafe { *pde };
        if !entry.is_present() || entry.is_large() || level == PagingLevel::Pd {
            return pde;
        }

        table_entry(Pa::from_pfn(entry.get_pfn()), self.index(PagingLevel::Pt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock;

    #[test]
    fn entry_bit_layout() {
        let mut entry = PageEntry::from_bits(0);
        entry.set_present(1);
        entry.set_writable(1);
        entry.set_global(1);
        entry.set_pfn(0xabcde);
        assert_eq!(entry.bits(), (0xabcde << 12) | (1 << 8) | 0b11);

        entry.clear();
        assert_eq!(entry.bits(), 0);
        assert!(!entry.is_present());
    }

    #[test]
    fn walk_resolves_a_mapped_page() {
        let va = 0x0000_6f12_3456_7000u64;
        let pa = 0x4242_0000u64;
        mock::map_page(va, pa);

        let pte = Va::new(va).pt_entry(mock::current_cr3(), PagingLevel::Pt);
        let entry = unsafe { *pte };
        assert!(entry.is_present());
        assert_eq!(entry.get_pfn(), pa >> 12);
    }

    #[test]
    fn translation_keeps_the_page_offset() {
        let page = 0x0000_5abc_def0_0000u64;
        let va = page | 0x123;
        let pa = 0x1_2345_6000u64;
        mock::map_page(page, pa);

        let translated = Pa::from_va_with_cr3(va as *const u8, mock::current_cr3());
        assert_eq!(translated, Pa::new(pa | 0x123));

        // An unmapped address translates to zero.
        let missing = Pa::from_va_with_cr3(0x0000_4000_0000_0000u64 as *const u8, mock::current_cr3());
        assert_eq!(missing, Pa::new(0));
    }

    #[test]
    fn walk_stops_at_non_present_entry() {
        // Nothing mapped anywhere near this address; the walk must hand back
        // the PML4 entry it stalled on.
        let va = Va::new(0x0000_1111_2222_3000);
        let stopped = va.pt_entry(mock::current_cr3(), PagingLevel::Pt);
        let entry = unsafe { *stopped };
        assert!(!entry.is_present());

        let pml4e = va.pt_entry(mock::current_cr3(), PagingLevel::Pml4);
        assert_eq!(stopped, pml4e);
    }
}

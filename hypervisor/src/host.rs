//! Primitives the surrounding host environment supplies to the core.
//!
//! The core never allocates address space, walks an address space it does not
//! know, or queries firmware on its own; it goes through this seam. The
//! production backend assumes the environment the boot glue sets up: physical
//! memory identity-mapped into the host virtual address space and a boot-time
//! record of the firmware RAM map. A Windows-driver build would reimplement
//! these five entry points on top of the kernel's MM exports.
//!
//! Under `cfg(test)` the backend is a mock: identity translation, heap-backed
//! window pages, and a hand-built 4-level paging hierarchy, so the paging and
//! mapping code above this seam runs unmodified in unit tests.

use crate::intel::{
    addresses::{Pa, PagingLevel, Va, PAGE_SIZE},
    memory::MemoryRange,
    support::native,
};

#[cfg(not(test))]
use crate::intel::memory::MAX_RANGE_COUNT;

/// Translates a host virtual address through the current address space.
/// Returns a zero address when the translation does not exist.
pub fn pa_from_va(va: Va) -> Pa {
    // The mock address space is flat: a heap pointer is its own PA.
    native!(
        pa_from_va_with_cr3(va, crate::intel::support::cr3()),
        Pa::new(va.value())
    )
}

/// Translates a virtual address under an explicit CR3 (e.g. a guest address
/// space) by walking its paging hierarchy through the direct map.
/// Returns a zero address when the translation does not exist.
pub fn pa_from_va_with_cr3(va: Va, cr3: u64) -> Pa {
    let pte = va.pt_entry(cr3, PagingLevel::Pt);
    let entry = unsafe { *pte };

    if !entry.is_present() {
        return Pa::new(0);
    }

    Pa::from_pfn(entry.get_pfn()) + va.offset()
}

/// The host virtual address a physical address is reachable at.
///
/// The boot glue identity-maps physical memory, so the direct map is the
/// identity; a host-OS port would return the OS's physmem mapping instead.
pub fn va_from_pa(pa: Pa) -> *mut u8 {
    pa.value() as *mut u8
}

/// Reserves `size` bytes of page-aligned host virtual address space backed by
/// present, writable page-table entries. Returns null on failure.
pub fn mapping_allocate(size: usize) -> *mut u8 {
    native!(
        unsafe { alloc::alloc::alloc_zeroed(page_layout(size)) },
        mock::mapping_allocate(size)
    )
}

/// Releases a reservation made by [`mapping_allocate`].
pub fn mapping_free(va: *mut u8, size: usize) {
    native!(
        unsafe { alloc::alloc::dealloc(va, page_layout(size)) },
        mock::mapping_free(va, size)
    )
}

/// Invalidates the TLB entry for one page on the current processor.
pub fn tlb_flush_one(va: *mut u8) {
    native!(unsafe { x86::tlb::flush(va as usize) }, {
        let _ = va;
    })
}

#[cfg(not(test))]
fn page_layout(size: usize) -> core::alloc::Layout {
    // The window is always whole pages; anything else is a caller bug.
    core::alloc::Layout::from_size_align(size, PAGE_SIZE).expect("page-aligned layout")
}

/// Copies the boot-recorded physical memory map into `out`, at most
/// `out.len()` ranges, and returns how many ranges the firmware reported in
/// total (which may exceed what was copied). `None` if the map was never
/// recorded.
pub fn check_physical_memory(out: &mut [MemoryRange]) -> Option<usize> {
    native!(
        {
            let snapshot = MEMORY_MAP.get()?;
            let stored = snapshot.stored.min(out.len());
            out[..stored].copy_from_slice(&snapshot.ranges[..stored]);
            Some(snapshot.reported)
        },
        mock::check_physical_memory(out)
    )
}

#[cfg(not(test))]
struct MemoryMapSnapshot {
    ranges: [MemoryRange; MAX_RANGE_COUNT],
    /// Ranges actually captured (≤ MAX_RANGE_COUNT).
    stored: usize,
    /// Ranges the firmware reported.
    reported: usize,
}

#[cfg(not(test))]
static MEMORY_MAP: spin::Once<MemoryMapSnapshot> = spin::Once::new();

/// Records the firmware RAM map. Called once by the boot glue, before any
/// [`crate::intel::memory::PhysicalMemoryDescriptor`] is constructed; later
/// calls are ignored.
#[cfg(not(test))]
pub fn record_physical_memory_map(reported: &[MemoryRange]) {
    MEMORY_MAP.call_once(|| {
        let mut snapshot = MemoryMapSnapshot {
            ranges: [MemoryRange::default(); MAX_RANGE_COUNT],
            stored: reported.len().min(MAX_RANGE_COUNT),
            reported: reported.len(),
        };
        snapshot.ranges[..snapshot.stored].copy_from_slice(&reported[..snapshot.stored]);
        snapshot
    });
}

#[cfg(test)]
pub(crate) mod mock {
    //! Test backend: a flat address space over the test process heap plus a
    //! thread-local fake CR3 hierarchy built from real heap pages, so the
    //! crate's walk code runs against genuine paging structures.

    use std::{
        alloc::{alloc_zeroed, dealloc, Layout},
        cell::RefCell,
        vec::Vec,
    };

    use super::*;
    use crate::intel::paging::{cr3_table, PageEntry};

    thread_local! {
        static CR3_ROOT: RefCell<u64> = const { RefCell::new(0) };
        static MEMORY_MAP: RefCell<Option<Vec<MemoryRange>>> = const { RefCell::new(None) };
        static FAIL_NEXT_ALLOCATION: RefCell<bool> = const { RefCell::new(false) };
    }

    fn page_layout() -> Layout {
        Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
    }

    fn alloc_table_page() -> u64 {
        unsafe { alloc_zeroed(page_layout()) as u64 }
    }

    /// The fake CR3 for this test thread, creating an empty root on first use.
    pub fn current_cr3() -> u64 {
        CR3_ROOT.with(|root| {
            let mut root = root.borrow_mut();
            if *root == 0 {
                *root = alloc_table_page();
            }
            *root
        })
    }

    /// Installs a 4 KiB translation `va` → `pa` into the fake hierarchy,
    /// allocating intermediate tables as needed.
    pub fn map_page(va: u64, pa: u64) {
        let va = Va::new(va);
        let mut table = cr3_table(current_cr3());

        for level in [PagingLevel::Pml4, PagingLevel::Pdpt, PagingLevel::Pd] {
            let slot = unsafe { table.va().cast::<PageEntry>().add(va.index(level)) };
            let mut entry = unsafe { *slot };
            if !entry.is_present() {
                entry.set_pfn(alloc_table_page() >> 12);
                entry.set_present(1);
                entry.set_writable(1);
                unsafe { *slot = entry };
            }
            table = Pa::from_pfn(entry.get_pfn());
        }

        let slot = unsafe { table.va().cast::<PageEntry>().add(va.index(PagingLevel::Pt)) };
        let mut entry = PageEntry::from_bits(0);
        entry.set_pfn(pa >> 12);
        entry.set_present(1);
        entry.set_writable(1);
        unsafe { *slot = entry };
    }

    pub fn mapping_allocate(size: usize) -> *mut u8 {
        assert_eq!(size, PAGE_SIZE);

        if FAIL_NEXT_ALLOCATION.with(|f| f.replace(false)) {
            return core::ptr::null_mut();
        }

        let va = unsafe { alloc_zeroed(page_layout()) };
        // Give the window a backing PTE so pt_entry() can find it.
        map_page(va as u64, va as u64);
        va
    }

    pub fn mapping_free(va: *mut u8, size: usize) {
        assert_eq!(size, PAGE_SIZE);
        unsafe { dealloc(va, page_layout()) };
    }

    pub fn fail_next_allocation() {
        FAIL_NEXT_ALLOCATION.with(|f| *f.borrow_mut() = true);
    }

    pub fn set_physical_memory_map(ranges: &[MemoryRange]) {
        MEMORY_MAP.with(|map| *map.borrow_mut() = Some(ranges.to_vec()));
    }

    pub fn check_physical_memory(out: &mut [MemoryRange]) -> Option<usize> {
        MEMORY_MAP.with(|map| {
            let map = map.borrow();
            let ranges = map.as_ref()?;
            let stored = ranges.len().min(out.len());
            out[..stored].copy_from_slice(&ranges[..stored]);
            Some(ranges.len())
        })
    }
}

//! Per-vCPU transient mapping of arbitrary physical frames.
//!
//! Guest physical memory is not, in general, addressable from the hypervisor.
//! Each vCPU therefore reserves a single page of host virtual address space
//! at construction and repoints that page's PTE at whatever frame it needs to
//! touch, one frame at a time, paying one local TLB invalidation per frame.

use log::trace;

use crate::{
    error::HypervisorError,
    host,
    intel::{
        addresses::{Pa, PagingLevel, Va, PAGE_SIZE},
        paging::PageEntry,
        support,
    },
};

/// A one-page window into physical memory.
///
/// Owns the reserved virtual page and the pointer to its PTE; the raw
/// pointers also make the type `!Send`/`!Sync`, which is deliberate — the
/// window belongs to a vCPU pinned to one processor, and the `invlpg` issued
/// by [`map`](Self::map) only reaches that processor's TLB.
pub struct TransientMapping {
    va: *mut u8,
    pte: *mut PageEntry,
}

impl TransientMapping {
    /// Reserves the window and locates the page-table entry backing it.
    pub fn new() -> Result<Self, HypervisorError> {
        let va = host::mapping_allocate(PAGE_SIZE);
        if va.is_null() {
            return Err(HypervisorError::MappingReservationFailed);
        }

        let pte = Va::from_ptr(va).pt_entry(support::cr3(), PagingLevel::Pt);
        if pte.is_null() || !unsafe { *pte }.is_present() {
            host::mapping_free(va, PAGE_SIZE);
            return Err(HypervisorError::MappingPteNotFound);
        }

        trace!("transient mapping window at {:#x}", va as u64);
        Ok(Self { va, pte })
    }

    /// Points the window at `pa`'s frame and returns a pointer to `pa`'s
    /// byte within it.
    pub fn map(&mut self, pa: Pa) -> *mut u8 {
        let mut entry = PageEntry::from_bits(0);
        entry.set_present(1);
        entry.set_writable(1);
        // Keep the translation across CR3 switches; we invalidate by hand.
        entry.set_global(1);
        entry.set_pfn(pa.pfn());
        unsafe { *self.pte = entry };

        host::tlb_flush_one(self.va);

        unsafe { self.va.add(pa.offset() as usize) }
    }

    /// Tears the window translation down.
    pub fn unmap(&mut self) {
        unsafe { (*self.pte).clear() };
        host::tlb_flush_one(self.va);
    }

    /// Copies `buffer.len()` bytes out of physical memory starting at `pa`,
    /// which may span any number of frames.
    pub fn read(&mut self, pa: Pa, buffer: &mut [u8]) {
        self.read_write(pa, buffer.as_mut_ptr(), buffer.len(), false);
    }

    /// Copies `buffer` into physical memory starting at `pa`, which may span
    /// any number of frames.
    pub fn write(&mut self, pa: Pa, buffer: &[u8]) {
        self.read_write(pa, buffer.as_ptr() as *mut u8, buffer.len(), true);
    }

    fn read_write(&mut self, mut pa: Pa, mut buffer: *mut u8, mut remaining: usize, write: bool) {
        while remaining != 0 {
            let window = self.map(pa);
            let chunk = bytes_until_page_end(pa, remaining);

            unsafe {
                if write {
                    core::ptr::copy_nonoverlapping(buffer, window, chunk);
                } else {
                    core::ptr::copy_nonoverlapping(window, buffer, chunk);
                }
                buffer = buffer.add(chunk);
            }

            pa += chunk as u64;
            remaining -= chunk;

            self.unmap();
        }
    }
}

/// How many bytes fit between `pa` and the end of its page, capped at
/// `remaining`.
#[inline]
fn bytes_until_page_end(pa: Pa, remaining: usize) -> usize {
    (PAGE_SIZE - pa.offset() as usize).min(remaining)
}

impl Drop for TransientMapping {
    fn drop(&mut self) {
        self.unmap();
        host::mapping_free(self.va, PAGE_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_honors_page_boundaries() {
        assert_eq!(bytes_until_page_end(Pa::new(0x1000), 10), 10);
        assert_eq!(bytes_until_page_end(Pa::new(0x1000), 0x2000), 0x1000);
        assert_eq!(bytes_until_page_end(Pa::new(0x1ff0), 0x2000), 0x10);
        assert_eq!(bytes_until_page_end(Pa::new(0x1fff), 1), 1);
    }

    #[test]
    fn map_programs_the_pte_and_unmap_clears_it() {
        let mut mapping = TransientMapping::new().unwrap();

        let target = Pa::new(0x0012_3456);
        let window = mapping.map(target);
        assert_eq!(window as u64 & 0xfff, target.offset());

        let entry = unsafe { *mapping.pte };
        assert!(entry.is_present());
        assert_eq!(entry.get_writable(), 1);
        assert_eq!(entry.get_global(), 1);
        assert_eq!(entry.get_pfn(), target.pfn());

        mapping.unmap();
        assert_eq!(unsafe { *mapping.pte }.bits(), 0);
    }

    #[test]
    fn write_then_read_round_trips_across_a_page_boundary() {
        let mut mapping = TransientMapping::new().unwrap();

        // Spans two frames: the two chunks land at disjoint window offsets.
        let pa = Pa::new(0x7000_0f80);
        let data: alloc::vec::Vec<u8> = (0..=255).collect();
        mapping.write(pa, &data);

        let mut readback = [0u8; 256];
        mapping.read(pa, &mut readback);
        assert_eq!(readback.as_slice(), data.as_slice());
    }

    #[test]
    fn reservation_failure_is_reported() {
        crate::host::mock::fail_next_allocation();
        assert!(matches!(
            TransientMapping::new(),
            Err(HypervisorError::MappingReservationFailed)
        ));
    }
}

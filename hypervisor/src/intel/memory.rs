//! Boot-time snapshot of the host's physical RAM layout.
//!
//! The EPT identity map is sized from this descriptor, so it is captured once
//! during startup and never changes afterwards.

use log::{info, warn};

use crate::{error::HypervisorError, host, intel::addresses::Pa};

/// Upper bound on ranges the descriptor keeps. Firmware reporting more than
/// this is exotic; the excess is dropped (loudly — see
/// [`PhysicalMemoryDescriptor::new`]).
pub const MAX_RANGE_COUNT: usize = 32;

/// A half-open range `[begin, end)` of physical addresses.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    begin: Pa,
    end: Pa,
}

impl MemoryRange {
    pub fn new(begin: Pa, end: Pa) -> Self {
        debug_assert!(begin <= end);
        Self { begin, end }
    }

    pub fn begin(&self) -> Pa {
        self.begin
    }

    pub fn end(&self) -> Pa {
        self.end
    }

    pub fn size(&self) -> u64 {
        self.end.value() - self.begin.value()
    }

    pub fn contains(&self, pa: Pa) -> bool {
        pa >= self.begin && pa < self.end
    }
}

/// Ordered, immutable list of the RAM ranges populated at boot.
pub struct PhysicalMemoryDescriptor {
    ranges: [MemoryRange; MAX_RANGE_COUNT],
    count: usize,
}

impl PhysicalMemoryDescriptor {
    /// Snapshots the boot-recorded memory map.
    ///
    /// Fails only if the boot glue never recorded a map. If the firmware
    /// reported more than [`MAX_RANGE_COUNT`] ranges the tail is dropped and
    /// a warning logged; the identity maps built from this descriptor simply
    /// will not cover the dropped tail.
    pub fn new() -> Result<Self, HypervisorError> {
        let mut ranges = [MemoryRange::default(); MAX_RANGE_COUNT];
        let reported = host::check_physical_memory(&mut ranges)
            .ok_or(HypervisorError::PhysicalMemoryMapMissing)?;

        if reported > MAX_RANGE_COUNT {
            warn!(
                "physical memory map has {} ranges, dropping {}",
                reported,
                reported - MAX_RANGE_COUNT
            );
        }

        let count = reported.min(MAX_RANGE_COUNT);

        // The firmware map is sorted and disjoint; a violation here means the
        // boot glue mangled it.
        debug_assert!(ranges[..count].windows(2).all(|pair| pair[0].end() <= pair[1].begin()));

        Ok(Self { ranges, count })
    }

    pub fn ranges(&self) -> &[MemoryRange] {
        &self.ranges[..self.count]
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Total bytes of RAM across all kept ranges.
    pub fn total_physical_memory_size(&self) -> u64 {
        self.ranges().iter().map(MemoryRange::size).sum()
    }

    pub fn dump(&self) {
        info!("physical memory ranges ({})", self.count);

        for (i, range) in self.ranges().iter().enumerate() {
            info!(
                "  {:3}) [{:#012x} - {:#012x}] ({:8} kb)",
                i,
                range.begin(),
                range.end(),
                range.size() / 1024
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock;

    fn range(begin: u64, end: u64) -> MemoryRange {
        MemoryRange::new(Pa::new(begin), Pa::new(end))
    }

    #[test]
    fn missing_map_is_an_error() {
        assert!(matches!(
            PhysicalMemoryDescriptor::new(),
            Err(HypervisorError::PhysicalMemoryMapMissing)
        ));
    }

    #[test]
    fn snapshot_preserves_order_and_sizes() {
        mock::set_physical_memory_map(&[
            range(0x0, 0x9f000),
            range(0x100000, 0x7fe0000),
            range(0x100000000, 0x180000000),
        ]);

        let descriptor = PhysicalMemoryDescriptor::new().unwrap();
        assert_eq!(descriptor.count(), 3);

        let ranges = descriptor.ranges();
        assert!(ranges.windows(2).all(|pair| pair[0].end() <= pair[1].begin()));
        assert_eq!(
            descriptor.total_physical_memory_size(),
            0x9f000 + (0x7fe0000 - 0x100000) + 0x80000000
        );

        assert!(ranges[1].contains(Pa::new(0x200000)));
        assert!(!ranges[1].contains(Pa::new(0x7fe0000)));
    }

    #[test]
    fn overflowing_map_is_truncated() {
        let mut reported = alloc::vec::Vec::new();
        for i in 0..40u64 {
            reported.push(range(i * 0x10000, i * 0x10000 + 0x8000));
        }
        mock::set_physical_memory_map(&reported);

        let descriptor = PhysicalMemoryDescriptor::new().unwrap();
        assert_eq!(descriptor.count(), MAX_RANGE_COUNT);
        assert_eq!(
            descriptor.total_physical_memory_size(),
            (MAX_RANGE_COUNT as u64) * 0x8000
        );
    }
}

//! Error type shared by the fallible parts of the core.
//!
//! The hypervisor runs at a privilege level where most failures are fatal:
//! programming errors are asserted, hardware refusals halt the processor.
//! `HypervisorError` covers the small set of conditions a caller can actually
//! react to.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    /// The host refused to reserve the one-page transient mapping window.
    #[error("failed to reserve the transient mapping window")]
    MappingReservationFailed,

    /// The reserved window resolved to no (or an unmapped) page-table entry.
    #[error("the transient mapping window has no backing page-table entry")]
    MappingPteNotFound,

    /// `PhysicalMemoryDescriptor::new` ran before the boot glue recorded the
    /// firmware memory map.
    #[error("the boot-time physical memory map was never recorded")]
    PhysicalMemoryMapMissing,
}

//! Core of a thin, blue-pill style hypervisor for Intel VT-x.
//!
//! The crate virtualizes an already-running operating system: the driver glue
//! pins itself to each logical processor, enters VMX operation, and hands the
//! freshly loaded VMCS to a [`intel::vcpu::Vcpu`], which programs the initial
//! guest/host/control state and from then on services every VM-exit through
//! its typed VMCS accessors and the pending-interrupt injection engine.
//!
//! Entry/exit assembly stubs, EPT construction and exit-handler policy live in
//! the surrounding driver; this crate is the per-processor state machine they
//! talk to.
//!
//! Production builds are `no_std`. Under `cfg(test)` the privileged
//! instruction wrappers in [`intel::support`] and the host primitives in
//! [`host`] are swapped for simulated backends so the unit tests exercise the
//! real control-surface and injection code on a development machine.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
extern crate static_assertions;

pub mod error;
pub mod host;
pub mod intel;
pub mod logger;

pub use error::HypervisorError;

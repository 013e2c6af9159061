//! Thin wrappers over the privileged instructions the core leans on.
//!
//! Everything that touches the current VMCS, an MSR or a system register goes
//! through here. That keeps the unsafe surface in one place and gives the
//! unit tests a single seam: under `cfg(test)` each wrapper is backed by the
//! thread-local simulated store in [`sim`] instead of the CPU, so the
//! control-surface code above runs untouched.
//!
//! `vmread`/`vmwrite` target the *current* VMCS of the executing processor,
//! an implicit per-CPU global; the vCPU that owns it is pinned to that
//! processor for its whole life, so no further synchronization is needed.

use x86::segmentation::SegmentSelector;

use crate::intel::segmentation::DescriptorTable;

/// Expands to the first expression in production builds and the second
/// (simulated) one under `cfg(test)`.
macro_rules! native {
    ($real:expr, $simulated:expr) => {{
        #[cfg(not(test))]
        {
            $real
        }
        #[cfg(test)]
        {
            $simulated
        }
    }};
}
pub(crate) use native;

/// Reads a field from the current VMCS.
///
/// Returns 0 if the field could not be read; a fault here means the driver
/// broke the current-VMCS invariant, which nothing at this layer can fix.
pub fn vmread(field: u32) -> u64 {
    native!(
        unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or(0),
        sim::vmcs_read(field)
    )
}

/// Writes a field of the current VMCS.
///
/// A VMWRITE failure is a programming error (bad field encoding, read-only
/// field, no current VMCS) and halts.
pub fn vmwrite<T: Into<u64>>(field: u32, value: T) {
    native!(
        unsafe { x86::bits64::vmx::vmwrite(field, value.into()) }.expect("VMWRITE failed"),
        sim::vmcs_write(field, value.into())
    )
}

pub fn rdmsr(msr: u32) -> u64 {
    native!(unsafe { x86::msr::rdmsr(msr) }, sim::read_msr(msr))
}

pub fn cr0() -> u64 {
    // Simulated value: PG | WP | NE | ET | MP | PE.
    native!(x86_64::registers::control::Cr0::read_raw(), 0x8005_0033)
}

pub fn cr3() -> u64 {
    native!(unsafe { x86::controlregs::cr3() }, crate::host::mock::current_cr3())
}

pub fn cr4() -> u64 {
    native!(x86_64::registers::control::Cr4::read_raw(), 0x0006_26f8)
}

pub fn dr7() -> u64 {
    native!(unsafe { x86::debugregs::dr7().0 as u64 }, 0x400)
}

pub fn sgdt() -> DescriptorTable {
    native!(
        {
            let mut gdtr = x86::dtables::DescriptorTablePointer::<u64>::default();
            unsafe { x86::dtables::sgdt(&mut gdtr) };
            DescriptorTable {
                base: gdtr.base as u64,
                limit: gdtr.limit,
            }
        },
        DescriptorTable {
            base: sim::fake_gdt().as_ptr() as u64,
            limit: (core::mem::size_of::<[u64; 16]>() - 1) as u16,
        }
    )
}

pub fn sidt() -> DescriptorTable {
    native!(
        {
            let mut idtr = x86::dtables::DescriptorTablePointer::<u64>::default();
            unsafe { x86::dtables::sidt(&mut idtr) };
            DescriptorTable {
                base: idtr.base as u64,
                limit: idtr.limit,
            }
        },
        DescriptorTable {
            base: 0x7400_1000,
            limit: 0xfff,
        }
    )
}

/// Current task register selector.
pub fn tr() -> SegmentSelector {
    native!(unsafe { x86::task::tr() }, SegmentSelector::from_raw(0x40))
}

/// Current LDT selector.
pub fn ldtr() -> SegmentSelector {
    native!(unsafe { x86::dtables::ldtr() }, SegmentSelector::from_raw(0))
}

pub fn inb(port: u16) -> u8 {
    // Simulated line status reads "transmitter empty" so the serial writer
    // never spins.
    native!(unsafe { x86::io::inb(port) }, {
        let _ = port;
        0x20
    })
}

pub fn outb(port: u16, value: u8) {
    native!(
        unsafe { x86::io::outb(port, value) },
        sim::record_port_write(port, value)
    )
}

/// Simulated backend for unit tests. One store per test thread; the standard
/// test harness runs every `#[test]` on its own thread, so tests never share
/// simulated hardware state.
#[cfg(test)]
pub(crate) mod sim {
    use std::{cell::RefCell, collections::BTreeMap, vec::Vec};

    use x86::msr;

    thread_local! {
        static VMCS: RefCell<BTreeMap<u32, u64>> = const { RefCell::new(BTreeMap::new()) };
        static MSRS: RefCell<BTreeMap<u32, u64>> = const { RefCell::new(BTreeMap::new()) };
        static PORT_WRITES: RefCell<Vec<(u16, u8)>> = const { RefCell::new(Vec::new()) };
    }

    pub fn vmcs_read(field: u32) -> u64 {
        VMCS.with(|vmcs| vmcs.borrow().get(&field).copied().unwrap_or(0))
    }

    pub fn vmcs_write(field: u32, value: u64) {
        VMCS.with(|vmcs| {
            vmcs.borrow_mut().insert(field, value);
        });
    }

    pub fn set_msr(msr: u32, value: u64) {
        MSRS.with(|msrs| {
            msrs.borrow_mut().insert(msr, value);
        });
    }

    pub fn read_msr(msr: u32) -> u64 {
        MSRS.with(|msrs| msrs.borrow().get(&msr).copied()).unwrap_or_else(|| default_msr(msr))
    }

    /// Capability defaults: the TRUE control MSRs exist and constrain nothing
    /// (no bit forced on, every bit allowed), so adjusted writes read back as
    /// requested unless a test installs stricter masks.
    fn default_msr(msr: u32) -> u64 {
        const ALLOW_EVERYTHING: u64 = 0xffff_ffff_0000_0000;
        match msr {
            msr::IA32_VMX_BASIC => 1 << 55,
            msr::IA32_VMX_TRUE_PINBASED_CTLS
            | msr::IA32_VMX_TRUE_PROCBASED_CTLS
            | msr::IA32_VMX_TRUE_EXIT_CTLS
            | msr::IA32_VMX_TRUE_ENTRY_CTLS
            | msr::IA32_VMX_PROCBASED_CTLS2 => ALLOW_EVERYTHING,
            _ => 0,
        }
    }

    pub fn record_port_write(port: u16, value: u8) {
        PORT_WRITES.with(|writes| writes.borrow_mut().push((port, value)));
    }

    pub fn port_writes(port: u16) -> Vec<u8> {
        PORT_WRITES.with(|writes| {
            writes
                .borrow()
                .iter()
                .filter(|(p, _)| *p == port)
                .map(|(_, b)| *b)
                .collect()
        })
    }

    /// A plausible GDT for the fake machine: null, kernel code/data, and a
    /// busy 64-bit TSS at selector 0x40.
    pub fn fake_gdt() -> &'static [u64; 16] {
        use std::sync::OnceLock;
        static GDT: OnceLock<[u64; 16]> = OnceLock::new();
        GDT.get_or_init(|| {
            let mut gdt = [0u64; 16];
            gdt[1] = 0x00af_9b00_0000_ffff; // 64-bit ring-0 code
            gdt[2] = 0x00cf_9300_0000_ffff; // ring-0 data
            let tss_base = 0x7400_2000u64;
            gdt[8] = (0x0000_8b00_0000_0067u64)
                | ((tss_base & 0x00ff_ffff) << 16)
                | ((tss_base & 0xff00_0000) << 32);
            gdt[9] = tss_base >> 32;
            gdt
        })
    }
}

//! VMX control-field adjustment against the capability MSRs.
//!
//! Every bit of the pin-based, processor-based (primary and secondary),
//! VM-entry and VM-exit control fields is classified by the VMX capability
//! MSRs as flexible, fixed to 0 or fixed to 1. VM entry fails if a written
//! value disagrees with the fixed bits, so every write of one of these five
//! fields is routed through [`adjust_vmx_controls`] first.

use x86::msr;

use crate::intel::support::rdmsr;

/// The five VMCS control fields whose reserved bits are dictated by
/// capability MSRs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxControl {
    PinBased,
    ProcessorBased,
    ProcessorBased2,
    VmEntry,
    VmExit,
}

/// Forces the reserved-fixed-1 bits on and the reserved-fixed-0 bits off in
/// `requested_value`, per the relevant capability MSR.
///
/// The lower 32 bits of a capability MSR are the "allowed-0" settings (a set
/// bit there means the control may be 0 — a clear bit means it is fixed to 1
/// and gets OR-ed in), the upper 32 bits are the "allowed-1" settings (a
/// clear bit means fixed to 0 and gets masked off).
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
/// A.3 VM-EXECUTION CONTROLS
pub fn adjust_vmx_controls(control: VmxControl, requested_value: u64) -> u64 {
    const IA32_VMX_BASIC_TRUE_CONTROLS_FLAG: u64 = 1 << 55;

    // When IA32_VMX_BASIC[55] is set, the TRUE capability MSRs report the
    // actual constraints (the legacy ones pessimize a few default1 bits).
    // There is no TRUE MSR for the secondary processor-based controls.
    let vmx_basic = rdmsr(msr::IA32_VMX_BASIC);
    let true_controls = (vmx_basic & IA32_VMX_BASIC_TRUE_CONTROLS_FLAG) != 0;

    let capability_msr = match (control, true_controls) {
        (VmxControl::PinBased, true) => msr::IA32_VMX_TRUE_PINBASED_CTLS,
        (VmxControl::PinBased, false) => msr::IA32_VMX_PINBASED_CTLS,
        (VmxControl::ProcessorBased, true) => msr::IA32_VMX_TRUE_PROCBASED_CTLS,
        (VmxControl::ProcessorBased, false) => msr::IA32_VMX_PROCBASED_CTLS,
        (VmxControl::VmEntry, true) => msr::IA32_VMX_TRUE_ENTRY_CTLS,
        (VmxControl::VmEntry, false) => msr::IA32_VMX_ENTRY_CTLS,
        (VmxControl::VmExit, true) => msr::IA32_VMX_TRUE_EXIT_CTLS,
        (VmxControl::VmExit, false) => msr::IA32_VMX_EXIT_CTLS,
        (VmxControl::ProcessorBased2, _) => msr::IA32_VMX_PROCBASED_CTLS2,
    };

    let capabilities = rdmsr(capability_msr);
    let fixed1 = capabilities as u32; // low word: bits that must be 1
    let allowed1 = (capabilities >> 32) as u32; // high word: bits that may be 1

    let mut effective = requested_value as u32;
    effective |= fixed1;
    effective &= allowed1;
    u64::from(effective)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intel::support::sim;

    #[test]
    fn adjust_forces_fixed_bits() {
        // Bits 0x16 fixed to 1; bit 31 fixed to 0; the rest flexible.
        let allowed0: u32 = 0x16;
        let allowed1: u32 = !(1 << 31);
        sim::set_msr(msr::IA32_VMX_TRUE_PINBASED_CTLS, ((allowed1 as u64) << 32) | allowed0 as u64);

        let adjusted = adjust_vmx_controls(VmxControl::PinBased, 1 << 31);
        assert_eq!(adjusted, 0x16);

        let adjusted = adjust_vmx_controls(VmxControl::PinBased, 1 << 3);
        assert_eq!(adjusted, 0x16 | (1 << 3));
    }

    #[test]
    fn legacy_capability_msr_is_used_without_basic_bit_55() {
        sim::set_msr(msr::IA32_VMX_BASIC, 0);
        sim::set_msr(msr::IA32_VMX_PINBASED_CTLS, 0xffff_ffff_0000_0001);
        sim::set_msr(msr::IA32_VMX_TRUE_PINBASED_CTLS, 0xffff_ffff_0000_0000);

        assert_eq!(adjust_vmx_controls(VmxControl::PinBased, 0), 1);
    }

    #[test]
    fn secondary_controls_have_no_true_msr() {
        sim::set_msr(msr::IA32_VMX_PROCBASED_CTLS2, 0x0000_0002_0000_0000);
        assert_eq!(adjust_vmx_controls(VmxControl::ProcessorBased2, 0xff), 0x2);
    }
}

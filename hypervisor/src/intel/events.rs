//! Event-injection formats and the pending-event record.
//!
//! A VM-entry delivers at most one event, described by the interruption-
//! information field; everything the injection engine queues or writes is an
//! [`InterruptInfo`]: that field, the optional error code, and how much
//! instruction length to charge the guest for software events.

use bitfield::bitfield;

use crate::intel::vmerror::{ExceptionInterrupt, InterruptionType};

bitfield! {
    /// The VM-entry interruption-information field. The exit-interruption and
    /// IDT-vectoring information fields share the same layout.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
    /// Table 25-17. Format of the VM-Entry Interruption-Information Field
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct EventInjection(u32);

    impl Debug;

    /// Vector of interrupt or exception
    pub get_vector, set_vector: 7, 0;

    /// Interruption type:
    /// 0: External interrupt
    /// 2: Non-maskable interrupt (NMI)
    /// 3: Hardware exception (e.g. #PF)
    /// 4: Software interrupt (INT n)
    /// 5: Privileged software exception (INT1)
    /// 6: Software exception (INT3 or INTO)
    /// 7: Other event
    pub get_type, set_type: 10, 8;

    /// Deliver error code (0 = do not deliver; 1 = deliver)
    pub get_deliver_error_code, set_deliver_error_code: 11, 11;

    // Reserved: 30:12

    /// Valid
    pub get_valid, set_valid: 31, 31;
}

impl EventInjection {
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }
}

bitfield! {
    /// Guest interruptibility state. Any set bit forbids event delivery on
    /// the next VM entry.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
    /// Table 25-3. Format of Interruptibility State
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct InterruptibilityState(u32);

    impl Debug;

    pub get_blocking_by_sti, set_blocking_by_sti: 0, 0;
    pub get_blocking_by_mov_ss, set_blocking_by_mov_ss: 1, 1;
    pub get_blocking_by_smi, set_blocking_by_smi: 2, 2;
    pub get_blocking_by_nmi, set_blocking_by_nmi: 3, 3;
    pub get_enclave_interruption, set_enclave_interruption: 4, 4;
}

impl InterruptibilityState {
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// True when some blocking condition is active.
    pub const fn is_blocking(&self) -> bool {
        self.0 != 0
    }
}

/// Instruction length to charge the guest when injecting a software event:
/// either the exit-instruction length the processor reported for the current
/// VM-exit, or an explicit byte count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RipAdjust {
    FromExitLength,
    Explicit(u32),
}

/// One injectable (or queued) event: interruption information, the error
/// code when the vector delivers one, and the RIP accounting for software
/// event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptInfo {
    pub(crate) info: EventInjection,
    pub(crate) error_code: Option<u32>,
    pub(crate) rip_adjust: RipAdjust,
}

use InterruptionType::*;
use RipAdjust::FromExitLength;

impl InterruptInfo {
    /// Not-valid filler for queue slots.
    pub(crate) const EMPTY: Self = Self {
        info: EventInjection(0),
        error_code: None,
        rip_adjust: FromExitLength,
    };

    pub fn new(
        interruption_type: InterruptionType,
        vector: u8,
        error_code: Option<u32>,
        rip_adjust: RipAdjust,
    ) -> Self {
        let mut info = EventInjection(0);
        info.set_vector(u32::from(vector));
        info.set_type(interruption_type as u32);
        if error_code.is_some() {
            info.set_deliver_error_code(1);
        }
        info.set_valid(1);

        Self {
            info,
            error_code,
            rip_adjust,
        }
    }

    /// Rebuilds a record from raw exit/vectoring information fields.
    pub(crate) fn from_raw(info: EventInjection, error_code: Option<u32>, rip_adjust: RipAdjust) -> Self {
        Self {
            info,
            error_code,
            rip_adjust,
        }
    }

    /// An external interrupt, e.g. a device vector the host wants reflected
    /// into the guest.
    pub fn external(vector: u8) -> Self {
        Self::new(ExternalInterrupt, vector, None, FromExitLength)
    }

    pub fn nmi() -> Self {
        Self::new(NonMaskableInterrupt, ExceptionInterrupt::NonMaskableInterrupt as u8, None, FromExitLength)
    }

    /// A hardware exception without an error code (#UD, #DB, ...).
    pub fn hardware_exception(vector: ExceptionInterrupt) -> Self {
        Self::new(HardwareException, vector as u8, None, FromExitLength)
    }

    pub fn general_protection(error_code: u32) -> Self {
        Self::new(HardwareException, ExceptionInterrupt::GeneralProtectionFault as u8, Some(error_code), FromExitLength)
    }

    pub fn page_fault(error_code: u32) -> Self {
        Self::new(HardwareException, ExceptionInterrupt::PageFault as u8, Some(error_code), FromExitLength)
    }

    /// #DF always pushes a zero error code.
    pub fn double_fault() -> Self {
        Self::new(HardwareException, ExceptionInterrupt::DoubleFault as u8, Some(0), FromExitLength)
    }

    pub fn invalid_opcode() -> Self {
        Self::new(HardwareException, ExceptionInterrupt::InvalidOpcode as u8, None, FromExitLength)
    }

    /// INT3. A software exception, so the guest's saved RIP is advanced past
    /// the breakpoint instruction.
    pub fn breakpoint() -> Self {
        Self::new(SoftwareException, ExceptionInterrupt::Breakpoint as u8, None, FromExitLength)
    }

    /// INT n.
    pub fn software_interrupt(vector: u8) -> Self {
        Self::new(SoftwareInterrupt, vector, None, FromExitLength)
    }

    pub fn is_valid(&self) -> bool {
        self.info.get_valid() != 0
    }

    pub fn vector(&self) -> u8 {
        self.info.get_vector() as u8
    }

    pub fn interruption_type(&self) -> InterruptionType {
        InterruptionType::from_u32(self.info.get_type())
    }

    pub fn error_code(&self) -> Option<u32> {
        self.error_code
    }

    pub fn rip_adjust(&self) -> RipAdjust {
        self.rip_adjust
    }

    /// The raw interruption-information doubleword.
    pub fn info_bits(&self) -> u32 {
        self.info.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injection_field_packing() {
        let gp = InterruptInfo::general_protection(0x42);
        let bits = gp.info_bits();

        assert_eq!(bits & 0xff, 13); // vector
        assert_eq!((bits >> 8) & 0b111, InterruptionType::HardwareException as u32);
        assert_eq!((bits >> 11) & 1, 1); // deliver error code
        assert_eq!(bits >> 31, 1); // valid
        assert_eq!(gp.error_code(), Some(0x42));
    }

    #[test]
    fn event_kinds() {
        assert_eq!(InterruptInfo::nmi().interruption_type(), InterruptionType::NonMaskableInterrupt);
        assert_eq!(InterruptInfo::nmi().vector(), 2);

        let bp = InterruptInfo::breakpoint();
        assert_eq!(bp.interruption_type(), InterruptionType::SoftwareException);
        assert!(bp.interruption_type().is_software());
        assert_eq!(bp.error_code(), None);
        assert_eq!((bp.info_bits() >> 11) & 1, 0);

        let ext = InterruptInfo::external(0x30);
        assert_eq!(ext.vector(), 0x30);
        assert!(ext.is_valid());

        assert_eq!(InterruptInfo::double_fault().error_code(), Some(0));
        assert!(!InterruptInfo::invalid_opcode().interruption_type().is_software());
    }

    #[test]
    fn interruptibility_blocking() {
        let mut state = InterruptibilityState::from_bits(0);
        assert!(!state.is_blocking());
        state.set_blocking_by_mov_ss(1);
        assert!(state.is_blocking());
        assert_eq!(state.bits(), 0b10);
    }

    #[test]
    fn empty_slot_is_not_valid() {
        assert!(!InterruptInfo::EMPTY.is_valid());
    }
}

//! Enumerations for VM-exit reasons, VM-instruction errors, exception
//! vectors and event interruption types.

/// Defines a `u32`-backed enum plus `from_u32`, which matches after masking
/// with the given mask (exit reasons carry flag bits in their upper half).
macro_rules! u32_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident (mask $mask:literal) {
            $($variant:ident = $value:literal,)*
        }
    ) => {
        $(#[$meta])*
        #[allow(missing_docs)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $value,)*
        }

        impl $name {
            pub fn from_u32(value: u32) -> Option<Self> {
                match value & $mask {
                    $($value => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

u32_enum! {
    /// Basic VM-exit reason (low 16 bits of the exit-reason field).
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
    /// Appendix C, VMX Basic Exit Reasons
    pub enum VmxBasicExitReason (mask 0xffff) {
        ExceptionOrNmi = 0,
        ExternalInterrupt = 1,
        TripleFault = 2,
        InitSignal = 3,
        StartupIpi = 4,
        IoSystemManagementInterrupt = 5,
        OtherSmi = 6,
        InterruptWindow = 7,
        NmiWindow = 8,
        TaskSwitch = 9,
        Cpuid = 10,
        Getsec = 11,
        Hlt = 12,
        Invd = 13,
        Invlpg = 14,
        Rdpmc = 15,
        Rdtsc = 16,
        Rsm = 17,
        Vmcall = 18,
        Vmclear = 19,
        Vmlaunch = 20,
        Vmptrld = 21,
        Vmptrst = 22,
        Vmread = 23,
        Vmresume = 24,
        Vmwrite = 25,
        Vmxoff = 26,
        Vmxon = 27,
        ControlRegisterAccesses = 28,
        MovDr = 29,
        IoInstruction = 30,
        Rdmsr = 31,
        Wrmsr = 32,
        VmEntryFailureInvalidGuestState = 33,
        VmEntryFailureMsrLoading = 34,
        Mwait = 36,
        MonitorTrapFlag = 37,
        Monitor = 39,
        Pause = 40,
        VmEntryFailureMachineCheckEvent = 41,
        TprBelowThreshold = 43,
        ApicAccess = 44,
        VirtualizedEoi = 45,
        AccessToGdtrOrIdtr = 46,
        AccessToLdtrOrTr = 47,
        EptViolation = 48,
        EptMisconfiguration = 49,
        Invept = 50,
        Rdtscp = 51,
        VmxPreemptionTimerExpired = 52,
        Invvpid = 53,
        WbinvdOrWbnoinvd = 54,
        Xsetbv = 55,
        ApicWrite = 56,
        Rdrand = 57,
        Invpcid = 58,
        Vmfunc = 59,
        Encls = 60,
        Rdseed = 61,
        PageModificationLogFull = 62,
        Xsaves = 63,
        Xrstors = 64,
        Umwait = 67,
        Tpause = 68,
    }
}

u32_enum! {
    /// VM-instruction error numbers, read from the VM-instruction-error
    /// field after a failed VMX instruction.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
    /// Table 31-1. VM-Instruction Error Numbers
    pub enum VmInstructionError (mask 0xffff_ffff) {
        VmcallInVmxRootOperation = 1,
        VmclearWithInvalidPhysicalAddress = 2,
        VmclearWithVmxonPointer = 3,
        VmlaunchWithNonClearVmcs = 4,
        VmresumeWithNonLaunchedVmcs = 5,
        VmresumeAfterVmxoff = 6,
        VmEntryWithInvalidControlFields = 7,
        VmEntryWithInvalidHostStateFields = 8,
        VmptrldWithInvalidPhysicalAddress = 9,
        VmptrldWithVmxonPointer = 10,
        VmptrldWithIncorrectRevisionIdentifier = 11,
        VmreadVmwriteToUnsupportedComponent = 12,
        VmwriteToReadOnlyComponent = 13,
        VmxonInVmxRootOperation = 15,
        VmEntryWithInvalidExecutiveVmcsPointer = 16,
        VmEntryWithNonLaunchedExecutiveVmcs = 17,
        VmEntryWithExecutiveVmcsPointer = 18,
        VmcallWithNonClearVmcs = 19,
        VmcallWithInvalidVmExitControlFields = 20,
        VmcallWithIncorrectMsegRevisionIdentifier = 22,
        VmxoffUnderDualMonitorTreatment = 23,
        VmcallWithInvalidSmmMonitorFeatures = 24,
        VmEntryWithInvalidVmExecutionControlFields = 25,
        VmEntryWithEventsBlockedByMovSs = 26,
        InvalidOperandToInveptInvvpid = 28,
    }
}

/// Architectural exception and interrupt vectors 0-20.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionInterrupt {
    DivideError = 0,
    Debug = 1,
    NonMaskableInterrupt = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRangeExceeded = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    CoprocessorSegmentOverrun = 9,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackSegmentFault = 12,
    GeneralProtectionFault = 13,
    PageFault = 14,
    X87FloatingPoint = 16,
    AlignmentCheck = 17,
    MachineCheck = 18,
    SimdFloatingPoint = 19,
    Virtualization = 20,
}

/// Interruption type in event-injection and exit/vectoring information
/// fields (bits 10:8).
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
/// Table 25-17. Format of the VM-Entry Interruption-Information Field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum InterruptionType {
    ExternalInterrupt = 0,
    Reserved = 1,
    NonMaskableInterrupt = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
    OtherEvent = 7,
}

impl InterruptionType {
    pub fn from_u32(value: u32) -> Self {
        match value & 0b111 {
            0 => Self::ExternalInterrupt,
            1 => Self::Reserved,
            2 => Self::NonMaskableInterrupt,
            3 => Self::HardwareException,
            4 => Self::SoftwareInterrupt,
            5 => Self::PrivilegedSoftwareException,
            6 => Self::SoftwareException,
            _ => Self::OtherEvent,
        }
    }

    /// Event types for which VM entry pushes the length-advanced RIP rather
    /// than the current one.
    pub fn is_software(self) -> bool {
        matches!(
            self,
            Self::SoftwareInterrupt | Self::PrivilegedSoftwareException | Self::SoftwareException
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reason_decoding_strips_flag_bits() {
        assert_eq!(VmxBasicExitReason::from_u32(7), Some(VmxBasicExitReason::InterruptWindow));
        assert_eq!(
            VmxBasicExitReason::from_u32(0x8000_0021),
            Some(VmxBasicExitReason::VmEntryFailureInvalidGuestState)
        );
        assert_eq!(VmxBasicExitReason::from_u32(35), None);
    }

    #[test]
    fn instruction_error_decoding() {
        assert_eq!(
            VmInstructionError::from_u32(13),
            Some(VmInstructionError::VmwriteToReadOnlyComponent)
        );
        assert_eq!(VmInstructionError::from_u32(14), None);
    }

    #[test]
    fn interruption_type_round_trip() {
        for raw in 0..8 {
            assert_eq!(InterruptionType::from_u32(raw) as u32, raw);
        }
        assert!(InterruptionType::SoftwareException.is_software());
        assert!(!InterruptionType::HardwareException.is_software());
    }
}

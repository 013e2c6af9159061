//! Guest general-purpose register context.
//!
//! The VM-exit assembly stub in the driver spills the guest's GPRs into this
//! structure before calling into Rust, and reloads them on the way back into
//! the guest. RSP, RIP and RFLAGS live in the VMCS across the transition and
//! are refreshed into the cached copy after each exit.

/// Snapshot of the guest's general-purpose state at the last VM-exit.
///
/// The struct is `#[repr(C)]` with the first sixteen fields in hardware
/// register-encoding order (REG field values 0-15); [`gpr`](Self::gpr) and
/// [`set_gpr`](Self::set_gpr) index that prefix directly.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl GuestRegisters {
    /// Register read by hardware encoding. Index 4 is the cached RSP.
    pub fn gpr(&self, index: usize) -> u64 {
        assert!(index < 16, "register index {index} out of range");
        unsafe { (self as *const Self as *const u64).add(index).read() }
    }

    /// Register write by hardware encoding.
    pub fn set_gpr(&mut self, index: usize, value: u64) {
        assert!(index < 16, "register index {index} out of range");
        unsafe { (self as *mut Self as *mut u64).add(index).write(value) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpr_indexing_follows_the_hardware_encoding() {
        let mut registers = GuestRegisters::default();
        for index in 0..16 {
            registers.set_gpr(index, 0x1000 + index as u64);
        }

        assert_eq!(registers.rax, 0x1000);
        assert_eq!(registers.rcx, 0x1001);
        assert_eq!(registers.rsp, 0x1004);
        assert_eq!(registers.rdi, 0x1007);
        assert_eq!(registers.r15, 0x100f);

        for index in 0..16 {
            assert_eq!(registers.gpr(index), 0x1000 + index as u64);
        }
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn gpr_index_out_of_range_panics() {
        GuestRegisters::default().gpr(16);
    }
}

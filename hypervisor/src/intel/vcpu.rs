//! The per-processor virtual CPU.
//!
//! One `Vcpu` exists per logical processor and is pinned to it for its whole
//! life: VMREAD/VMWRITE address the processor's *current* VMCS, so the typed
//! accessors below are only meaningful on the owning CPU. That pinning also
//! means no locking — exit handling runs with interrupts disabled from exit
//! to re-entry.
//!
//! Three jobs live here: the typed VMCS control surface (with the
//! capability-MSR `adjust` applied to every control-field write), the
//! interrupt-injection engine that adapts "deliver this event, whenever
//! possible" to the hardware's one-event-per-entry contract, and decoding of
//! memory operands from exit-instruction information.

use alloc::boxed::Box;
use bitfield::bitfield;
use log::{debug, trace};
use x86::{
    bits64::rflags::RFlags,
    msr,
    segmentation::{cs, ds, es, fs, gs, ss, SegmentSelector},
    vmx::vmcs,
};

use crate::{
    error::HypervisorError,
    intel::{
        addresses::{Pa, Va},
        bitmap::{IoBitmap, MsrBitmap},
        capture::GuestRegisters,
        controls::{adjust_vmx_controls, VmxControl},
        events::{EventInjection, InterruptInfo, InterruptibilityState, RipAdjust},
        mapping::TransientMapping,
        segmentation::{self, DescriptorTable, SegmentDescriptor},
        support::{self, vmread, vmwrite},
        vmerror::{ExceptionInterrupt, InterruptionType, VmInstructionError, VmxBasicExitReason},
    },
};

/// Capacity of the pending-event ring; enqueue and dequeue indices wrap
/// modulo this size.
pub const PENDING_INTERRUPT_QUEUE_SIZE: usize = 16;

/// Guest segment registers in VMCS encoding order (stride 2 from the ES
/// fields).
pub const SEG_ES: usize = 0;
pub const SEG_CS: usize = 1;
pub const SEG_SS: usize = 2;
pub const SEG_DS: usize = 3;
pub const SEG_FS: usize = 4;
pub const SEG_GS: usize = 5;
pub const SEG_LDTR: usize = 6;
pub const SEG_TR: usize = 7;

const SEG_MIN: usize = SEG_ES;
const SEG_MAX: usize = SEG_TR;

// Control bits the core touches.
const PROCBASED_CTLS_INTERRUPT_WINDOW_EXITING: u64 = 1 << 2;
const PROCBASED_CTLS_USE_IO_BITMAPS: u64 = 1 << 25;
const PROCBASED_CTLS_USE_MSR_BITMAPS: u64 = 1 << 28;
const PROCBASED_CTLS_ACTIVATE_SECONDARY_CONTROLS: u64 = 1 << 31;
const PROCBASED_CTLS2_ENABLE_VPID: u64 = 1 << 5;
const PROCBASED_CTLS2_ENABLE_RDTSCP: u64 = 1 << 3;
const PROCBASED_CTLS2_ENABLE_INVPCID: u64 = 1 << 12;
const PROCBASED_CTLS2_ENABLE_XSAVES: u64 = 1 << 20;
const VMENTRY_CTLS_IA32E_MODE_GUEST: u64 = 1 << 9;
const VMEXIT_CTLS_HOST_ADDRESS_SPACE_SIZE: u64 = 1 << 9;

/// Linear-address width masks indexed by the instruction-information
/// address-size field (16/32/64 bit).
const ADDRESS_SIZE_MASK: [u64; 3] = [0xffff, 0xffff_ffff, u64::MAX];

bitfield! {
    /// VM-exit instruction information for instructions with a memory
    /// operand.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
    /// Table 28-9. Format of the VM-Exit Instruction-Information Field
    #[derive(Clone, Copy)]
    pub struct InstructionInfo(u32);

    impl Debug;

    pub get_scaling, set_scaling: 1, 0;

    /// 0: 16-bit, 1: 32-bit, 2: 64-bit
    pub get_address_size, set_address_size: 9, 7;

    /// 0: ES .. 5: GS
    pub get_segment_register, set_segment_register: 17, 15;

    pub get_index_register, set_index_register: 21, 18;
    pub get_index_register_invalid, set_index_register_invalid: 22, 22;
    pub get_base_register, set_base_register: 26, 23;
    pub get_base_register_invalid, set_base_register_invalid: 27, 27;
    pub get_register2, set_register2: 31, 28;
}

/// Field encoding of one guest-segment component, stride 2 from the ES
/// instance of that component.
fn segment_field(es_field: u32, index: usize) -> u32 {
    assert!(
        (SEG_MIN..=SEG_MAX).contains(&index),
        "segment index {index} out of range"
    );
    es_field + ((index as u32) << 1)
}

/// Read/write accessor pair for one VMCS field.
macro_rules! vmcs_accessors {
    ($($(#[$doc:meta])* $ty:ty, $get:ident, $set:ident, $field:expr;)*) => {
        $(
            $(#[$doc])*
            pub fn $get(&self) -> $ty {
                vmread($field) as $ty
            }

            pub fn $set(&mut self, value: $ty) {
                vmwrite($field, value);
            }
        )*
    };
}

/// Read-only accessors for exit-information fields.
macro_rules! vmcs_readers {
    ($($(#[$doc:meta])* $ty:ty, $get:ident, $field:expr;)*) => {
        $(
            $(#[$doc])*
            pub fn $get(&self) -> $ty {
                vmread($field) as $ty
            }
        )*
    };
}

/// Accessor pair for a control field whose writes pass through
/// [`adjust_vmx_controls`].
macro_rules! vmcs_control_accessors {
    ($($get:ident, $set:ident, $field:expr, $control:expr;)*) => {
        $(
            pub fn $get(&self) -> u64 {
                vmread($field)
            }

            pub fn $set(&mut self, controls: u64) {
                vmwrite($field, adjust_vmx_controls($control, controls));
            }
        )*
    };
}

/// Accessor pair for a host selector field. Only the index part of a host
/// selector is architecturally meaningful; RPL and TI must be zero on VM
/// entry, so the writer masks the selector to `index * 8`.
macro_rules! host_selector_accessors {
    ($($get:ident, $set:ident, $field:expr;)*) => {
        $(
            pub fn $get(&self) -> SegmentSelector {
                SegmentSelector::from_raw(vmread($field) as u16)
            }

            pub fn $set(&mut self, selector: SegmentSelector) {
                vmwrite($field, u64::from(selector.index()) * 8);
            }
        )*
    };
}

/// Accessor pair for a descriptor-table register stored as base + limit.
macro_rules! descriptor_table_accessors {
    ($($get:ident, $set:ident, $base:expr, $limit:expr;)*) => {
        $(
            pub fn $get(&self) -> DescriptorTable {
                DescriptorTable {
                    base: vmread($base),
                    limit: vmread($limit) as u16,
                }
            }

            pub fn $set(&mut self, table: DescriptorTable) {
                vmwrite($base, table.base);
                vmwrite($limit, u64::from(table.limit));
            }
        )*
    };
}

/// Accessor pair for one component of the guest segment at `index`.
macro_rules! guest_segment_component_accessors {
    ($($ty:ty, $get:ident, $set:ident, $es_field:expr;)*) => {
        $(
            pub fn $get(&self, index: usize) -> $ty {
                vmread(segment_field($es_field, index)) as $ty
            }

            pub fn $set(&mut self, index: usize, value: $ty) {
                vmwrite(segment_field($es_field, index), value);
            }
        )*
    };
}

macro_rules! guest_segment_accessors {
    ($($get:ident, $set:ident, $index:expr;)*) => {
        $(
            pub fn $get(&self) -> SegmentDescriptor {
                self.guest_segment($index)
            }

            pub fn $set(&mut self, segment: SegmentDescriptor) {
                self.set_guest_segment($index, segment);
            }
        )*
    };
}

/// Per-processor virtual CPU state.
///
/// Owns the intercept bitmaps the VMCS points at (their backing pages must
/// stay pinned as long as the VMCS is live) and the transient window used to
/// reach guest physical memory. The VMCS region itself is hardware-managed;
/// only its physical address is kept. Holding a [`TransientMapping`] makes
/// the type `!Send`/`!Sync`, matching the pin-to-one-processor model.
pub struct Vcpu {
    /// Physical address of this processor's VMCS region.
    vmcs: Pa,

    /// Guest GPR context spilled by the exit stub, plus RIP/RSP/RFLAGS
    /// refreshed from the VMCS after each exit.
    guest_registers: GuestRegisters,

    /// Ring of events that could not be delivered yet.
    pending_interrupt: [InterruptInfo; PENDING_INTERRUPT_QUEUE_SIZE],
    pending_interrupt_first: usize,
    pending_interrupt_count: usize,

    msr_bitmap: Box<MsrBitmap>,
    io_bitmap: Box<IoBitmap>,

    /// Window for copy-in/copy-out of guest physical memory.
    mapping: TransientMapping,
}

impl Vcpu {
    /// Creates the vCPU for the VMCS at `vmcs`. The region must already be
    /// VMCLEARed and made current (VMPTRLD) by the driver on this processor.
    pub fn new(vmcs: Pa) -> Result<Self, HypervisorError> {
        trace!("creating vcpu (vmcs at {vmcs})");

        Ok(Self {
            vmcs,
            guest_registers: GuestRegisters::default(),
            pending_interrupt: [InterruptInfo::EMPTY; PENDING_INTERRUPT_QUEUE_SIZE],
            pending_interrupt_first: 0,
            pending_interrupt_count: 0,
            msr_bitmap: MsrBitmap::new(),
            io_bitmap: IoBitmap::new(),
            mapping: TransientMapping::new()?,
        })
    }

    pub fn vmcs_pa(&self) -> Pa {
        self.vmcs
    }

    pub fn guest_registers(&self) -> &GuestRegisters {
        &self.guest_registers
    }

    pub fn guest_registers_mut(&mut self) -> &mut GuestRegisters {
        &mut self.guest_registers
    }

    /// Refreshes the VMCS-resident registers into the cached context; the
    /// exit stub calls this right after spilling the GPRs.
    pub fn refresh_cached_registers(&mut self) {
        self.guest_registers.rip = self.guest_rip();
        self.guest_registers.rsp = self.guest_rsp();
        self.guest_registers.rflags = self.guest_rflags().bits();
    }

    pub fn msr_bitmap(&self) -> &MsrBitmap {
        &self.msr_bitmap
    }

    pub fn msr_bitmap_mut(&mut self) -> &mut MsrBitmap {
        &mut self.msr_bitmap
    }

    pub fn io_bitmap(&self) -> &IoBitmap {
        &self.io_bitmap
    }

    pub fn io_bitmap_mut(&mut self) -> &mut IoBitmap {
        &mut self.io_bitmap
    }

    /// The guest-physical-memory window.
    pub fn mapping_mut(&mut self) -> &mut TransientMapping {
        &mut self.mapping
    }

    //
    // Initial VMCS programming.
    //

    /// Writes the initial VMCS for blue-pilling the running system: guest
    /// state mirrors the processor's current state (with RIP/RSP/RFLAGS from
    /// the captured `context`), host state names the driver's exit entry
    /// point, and the control fields carry this vCPU's bitmaps.
    pub fn setup(
        &mut self,
        context: &GuestRegisters,
        host_rip: u64,
        host_rsp: u64,
    ) -> Result<(), HypervisorError> {
        debug!("programming initial VMCS (region at {})", self.vmcs);

        self.guest_registers = *context;
        self.setup_control_fields();
        self.setup_guest_state(context);
        self.setup_host_state(host_rip, host_rsp);

        debug!("initial VMCS programmed");
        Ok(())
    }

    fn setup_control_fields(&mut self) {
        self.set_vpid(1);

        // No shadow VMCS: the link pointer must read all-ones.
        self.set_vmcs_link_pointer(Pa::new(u64::MAX));

        vmwrite(
            vmcs::control::MSR_BITMAPS_ADDR_FULL,
            Pa::from_va(&*self.msr_bitmap as *const MsrBitmap).value(),
        );
        vmwrite(
            vmcs::control::IO_BITMAP_A_ADDR_FULL,
            Pa::from_va(self.io_bitmap.a.as_ptr()).value(),
        );
        vmwrite(
            vmcs::control::IO_BITMAP_B_ADDR_FULL,
            Pa::from_va(self.io_bitmap.b.as_ptr()).value(),
        );

        self.set_pin_based_controls(0);
        self.set_processor_based_controls(
            PROCBASED_CTLS_USE_MSR_BITMAPS
                | PROCBASED_CTLS_USE_IO_BITMAPS
                | PROCBASED_CTLS_ACTIVATE_SECONDARY_CONTROLS,
        );
        // The guest ran on bare metal a moment ago; keep the instructions it
        // may already depend on enabled.
        self.set_processor_based_controls2(
            PROCBASED_CTLS2_ENABLE_VPID
                | PROCBASED_CTLS2_ENABLE_RDTSCP
                | PROCBASED_CTLS2_ENABLE_INVPCID
                | PROCBASED_CTLS2_ENABLE_XSAVES,
        );
        self.set_vm_entry_controls(VMENTRY_CTLS_IA32E_MODE_GUEST);
        self.set_vm_exit_controls(VMEXIT_CTLS_HOST_ADDRESS_SPACE_SIZE);

        self.set_exception_bitmap(0);
        self.set_pagefault_error_code_mask(0);
        self.set_pagefault_error_code_match(0);

        self.set_cr0_guest_host_mask(0);
        self.set_cr0_shadow(support::cr0());
        self.set_cr4_guest_host_mask(0);
        self.set_cr4_shadow(support::cr4());
    }

    fn setup_guest_state(&mut self, context: &GuestRegisters) {
        self.set_guest_cr0(support::cr0());
        self.set_guest_cr3(support::cr3());
        self.set_guest_cr4(support::cr4());
        self.set_guest_dr7(support::dr7());
        self.set_guest_debugctl(support::rdmsr(msr::IA32_DEBUGCTL));

        self.set_guest_rsp(context.rsp);
        self.set_guest_rip(context.rip);
        self.set_guest_rflags(RFlags::from_bits_truncate(context.rflags));

        let gdtr = support::sgdt();
        self.set_guest_gdtr(gdtr);
        self.set_guest_idtr(support::sidt());

        let selectors = [
            (SEG_ES, es()),
            (SEG_CS, cs()),
            (SEG_SS, ss()),
            (SEG_DS, ds()),
            (SEG_LDTR, support::ldtr()),
            (SEG_TR, support::tr()),
        ];
        for (index, selector) in selectors {
            self.set_guest_segment(index, SegmentDescriptor::from_selector(selector, &gdtr));
        }

        // FS/GS bases live in MSRs, not the descriptor table.
        let mut fs_segment = SegmentDescriptor::from_selector(fs(), &gdtr);
        fs_segment.base = support::rdmsr(msr::IA32_FS_BASE);
        self.set_guest_segment(SEG_FS, fs_segment);

        let mut gs_segment = SegmentDescriptor::from_selector(gs(), &gdtr);
        gs_segment.base = support::rdmsr(msr::IA32_GS_BASE);
        self.set_guest_segment(SEG_GS, gs_segment);

        self.set_guest_interruptibility_state(InterruptibilityState::from_bits(0));
    }

    fn setup_host_state(&mut self, host_rip: u64, host_rsp: u64) {
        self.set_host_cr0(support::cr0());
        self.set_host_cr3(support::cr3());
        self.set_host_cr4(support::cr4());

        self.set_host_rsp(host_rsp);
        self.set_host_rip(host_rip);

        let gdtr = support::sgdt();
        self.set_host_gdtr(gdtr);
        self.set_host_idtr(support::sidt());

        self.set_host_cs(cs());
        self.set_host_ss(ss());
        self.set_host_ds(ds());
        self.set_host_es(es());
        self.set_host_fs(fs());
        self.set_host_gs(gs());
        self.set_host_tr(support::tr());
        self.set_host_fs_base(support::rdmsr(msr::IA32_FS_BASE));
        self.set_host_gs_base(support::rdmsr(msr::IA32_GS_BASE));
        self.set_host_tr_base(segmentation::segment_base(&gdtr, support::tr()));
    }

    //
    // Control state.
    //

    vmcs_accessors! {
        u16, vpid, set_vpid, vmcs::control::VPID;
        /// EPT pointer; the hierarchy itself is built by the driver's EPT code.
        u64, ept_pointer, set_ept_pointer, vmcs::control::EPTP_FULL;
        u32, exception_bitmap, set_exception_bitmap, vmcs::control::EXCEPTION_BITMAP;
        u32, pagefault_error_code_mask, set_pagefault_error_code_mask, vmcs::control::PAGE_FAULT_ERR_CODE_MASK;
        u32, pagefault_error_code_match, set_pagefault_error_code_match, vmcs::control::PAGE_FAULT_ERR_CODE_MATCH;
        u64, cr0_guest_host_mask, set_cr0_guest_host_mask, vmcs::control::CR0_GUEST_HOST_MASK;
        u64, cr0_shadow, set_cr0_shadow, vmcs::control::CR0_READ_SHADOW;
        u64, cr4_guest_host_mask, set_cr4_guest_host_mask, vmcs::control::CR4_GUEST_HOST_MASK;
        u64, cr4_shadow, set_cr4_shadow, vmcs::control::CR4_READ_SHADOW;
        u32, entry_interruption_error_code, set_entry_interruption_error_code, vmcs::control::VMENTRY_EXCEPTION_ERR_CODE;
        u32, entry_instruction_length, set_entry_instruction_length, vmcs::control::VMENTRY_INSTRUCTION_LEN;
    }

    vmcs_control_accessors! {
        pin_based_controls, set_pin_based_controls, vmcs::control::PINBASED_EXEC_CONTROLS, VmxControl::PinBased;
        processor_based_controls, set_processor_based_controls, vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS, VmxControl::ProcessorBased;
        processor_based_controls2, set_processor_based_controls2, vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS, VmxControl::ProcessorBased2;
        vm_entry_controls, set_vm_entry_controls, vmcs::control::VMENTRY_CONTROLS, VmxControl::VmEntry;
        vm_exit_controls, set_vm_exit_controls, vmcs::control::VMEXIT_CONTROLS, VmxControl::VmExit;
    }

    pub fn vmcs_link_pointer(&self) -> Pa {
        Pa::new(vmread(vmcs::guest::LINK_PTR_FULL))
    }

    pub fn set_vmcs_link_pointer(&mut self, pointer: Pa) {
        vmwrite(vmcs::guest::LINK_PTR_FULL, pointer.value());
    }

    pub fn msr_bitmap_address(&self) -> Pa {
        Pa::new(vmread(vmcs::control::MSR_BITMAPS_ADDR_FULL))
    }

    pub fn io_bitmap_addresses(&self) -> (Pa, Pa) {
        (
            Pa::new(vmread(vmcs::control::IO_BITMAP_A_ADDR_FULL)),
            Pa::new(vmread(vmcs::control::IO_BITMAP_B_ADDR_FULL)),
        )
    }

    pub fn entry_interruption_info(&self) -> EventInjection {
        EventInjection::from_bits(vmread(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD) as u32)
    }

    pub fn set_entry_interruption_info(&mut self, info: EventInjection) {
        vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, info.bits());
    }

    //
    // Exit state (read-only fields).
    //

    vmcs_readers! {
        /// Full exit reason; bit 31 flags a failed VM entry.
        u32, exit_reason, vmcs::ro::EXIT_REASON;
        u64, exit_qualification, vmcs::ro::EXIT_QUALIFICATION;
        u32, exit_instruction_length, vmcs::ro::VMEXIT_INSTRUCTION_LEN;
        u32, exit_interruption_error_code, vmcs::ro::VMEXIT_INTERRUPTION_ERR_CODE;
    }

    pub fn basic_exit_reason(&self) -> Option<VmxBasicExitReason> {
        VmxBasicExitReason::from_u32(self.exit_reason())
    }

    pub fn exit_instruction_error(&self) -> Option<VmInstructionError> {
        VmInstructionError::from_u32(vmread(vmcs::ro::VM_INSTRUCTION_ERROR) as u32)
    }

    pub fn exit_instruction_info(&self) -> InstructionInfo {
        InstructionInfo(vmread(vmcs::ro::VMEXIT_INSTRUCTION_INFO) as u32)
    }

    pub fn exit_interruption_info(&self) -> EventInjection {
        EventInjection::from_bits(vmread(vmcs::ro::VMEXIT_INTERRUPTION_INFO) as u32)
    }

    pub fn exit_guest_physical_address(&self) -> Pa {
        Pa::new(vmread(vmcs::ro::GUEST_PHYSICAL_ADDR_FULL))
    }

    pub fn exit_guest_linear_address(&self) -> Va {
        Va::new(vmread(vmcs::ro::GUEST_LINEAR_ADDR))
    }

    /// An interruption record from a pair of info/error-code fields, bundled
    /// with the exit instruction length; `None` when the info is not valid.
    fn bundled_interrupt_info(&self, info_field: u32, error_code_field: u32) -> Option<InterruptInfo> {
        let info = EventInjection::from_bits(vmread(info_field) as u32);
        if info.get_valid() == 0 {
            return None;
        }

        let error_code =
            (info.get_deliver_error_code() != 0).then(|| vmread(error_code_field) as u32);

        Some(InterruptInfo::from_raw(
            info,
            error_code,
            RipAdjust::Explicit(self.exit_instruction_length()),
        ))
    }

    /// The event whose delivery caused this exit (exception/NMI exits).
    pub fn exit_interrupt_info(&self) -> Option<InterruptInfo> {
        self.bundled_interrupt_info(
            vmcs::ro::VMEXIT_INTERRUPTION_INFO,
            vmcs::ro::VMEXIT_INTERRUPTION_ERR_CODE,
        )
    }

    /// The event the processor was delivering when the exit occurred, ready
    /// to be handed back to [`inject`](Self::inject).
    pub fn idt_vectoring_info(&self) -> Option<InterruptInfo> {
        self.bundled_interrupt_info(vmcs::ro::IDT_VECTORING_INFO, vmcs::ro::IDT_VECTORING_ERR_CODE)
    }

    /// Guest linear address of the memory operand described by the
    /// exit-instruction information and qualification.
    pub fn exit_instruction_info_guest_va(&self) -> Va {
        let info = self.exit_instruction_info();
        let displacement = self.exit_qualification();

        let base = if info.get_base_register_invalid() != 0 {
            0
        } else {
            self.guest_registers.gpr(info.get_base_register() as usize)
        };

        let index = if info.get_index_register_invalid() != 0 {
            0
        } else {
            self.guest_registers.gpr(info.get_index_register() as usize)
        };

        let segment_base = self.guest_segment_base(info.get_segment_register() as usize);

        let mut linear = segment_base
            .wrapping_add(base)
            .wrapping_add(index)
            .wrapping_add(displacement);
        linear &= ADDRESS_SIZE_MASK[info.get_address_size() as usize];

        Va::new(linear)
    }

    //
    // Guest state.
    //

    vmcs_accessors! {
        u64, guest_cr0, set_guest_cr0, vmcs::guest::CR0;
        u64, guest_cr3, set_guest_cr3, vmcs::guest::CR3;
        u64, guest_cr4, set_guest_cr4, vmcs::guest::CR4;
        u64, guest_dr7, set_guest_dr7, vmcs::guest::DR7;
        u64, guest_debugctl, set_guest_debugctl, vmcs::guest::IA32_DEBUGCTL_FULL;
        u64, guest_rsp, set_guest_rsp, vmcs::guest::RSP;
        u64, guest_rip, set_guest_rip, vmcs::guest::RIP;
    }

    pub fn guest_rflags(&self) -> RFlags {
        RFlags::from_bits_truncate(vmread(vmcs::guest::RFLAGS))
    }

    pub fn set_guest_rflags(&mut self, rflags: RFlags) {
        vmwrite(vmcs::guest::RFLAGS, rflags.bits());
    }

    descriptor_table_accessors! {
        guest_gdtr, set_guest_gdtr, vmcs::guest::GDTR_BASE, vmcs::guest::GDTR_LIMIT;
        guest_idtr, set_guest_idtr, vmcs::guest::IDTR_BASE, vmcs::guest::IDTR_LIMIT;
    }

    pub fn guest_segment_selector(&self, index: usize) -> SegmentSelector {
        SegmentSelector::from_raw(vmread(segment_field(vmcs::guest::ES_SELECTOR, index)) as u16)
    }

    pub fn set_guest_segment_selector(&mut self, index: usize, selector: SegmentSelector) {
        vmwrite(
            segment_field(vmcs::guest::ES_SELECTOR, index),
            u64::from(selector.bits()),
        );
    }

    guest_segment_component_accessors! {
        u64, guest_segment_base, set_guest_segment_base, vmcs::guest::ES_BASE;
        u32, guest_segment_limit, set_guest_segment_limit, vmcs::guest::ES_LIMIT;
        u32, guest_segment_access_rights, set_guest_segment_access_rights, vmcs::guest::ES_ACCESS_RIGHTS;
    }

    /// One guest segment register, all four components.
    pub fn guest_segment(&self, index: usize) -> SegmentDescriptor {
        SegmentDescriptor {
            selector: self.guest_segment_selector(index),
            base: self.guest_segment_base(index),
            limit: self.guest_segment_limit(index),
            access_rights: self.guest_segment_access_rights(index),
        }
    }

    pub fn set_guest_segment(&mut self, index: usize, segment: SegmentDescriptor) {
        self.set_guest_segment_selector(index, segment.selector);
        self.set_guest_segment_base(index, segment.base);
        self.set_guest_segment_limit(index, segment.limit);
        self.set_guest_segment_access_rights(index, segment.access_rights);
    }

    guest_segment_accessors! {
        guest_es, set_guest_es, SEG_ES;
        guest_cs, set_guest_cs, SEG_CS;
        guest_ss, set_guest_ss, SEG_SS;
        guest_ds, set_guest_ds, SEG_DS;
        guest_fs, set_guest_fs, SEG_FS;
        guest_gs, set_guest_gs, SEG_GS;
        guest_ldtr, set_guest_ldtr, SEG_LDTR;
        guest_tr, set_guest_tr, SEG_TR;
    }

    pub fn guest_interruptibility_state(&self) -> InterruptibilityState {
        InterruptibilityState::from_bits(vmread(vmcs::guest::INTERRUPTIBILITY_STATE) as u32)
    }

    pub fn set_guest_interruptibility_state(&mut self, state: InterruptibilityState) {
        vmwrite(vmcs::guest::INTERRUPTIBILITY_STATE, state.bits());
    }

    //
    // Host state.
    //

    vmcs_accessors! {
        u64, host_cr0, set_host_cr0, vmcs::host::CR0;
        u64, host_cr3, set_host_cr3, vmcs::host::CR3;
        u64, host_cr4, set_host_cr4, vmcs::host::CR4;
        u64, host_rsp, set_host_rsp, vmcs::host::RSP;
        u64, host_rip, set_host_rip, vmcs::host::RIP;
        u64, host_fs_base, set_host_fs_base, vmcs::host::FS_BASE;
        u64, host_gs_base, set_host_gs_base, vmcs::host::GS_BASE;
        u64, host_tr_base, set_host_tr_base, vmcs::host::TR_BASE;
    }

    host_selector_accessors! {
        host_cs, set_host_cs, vmcs::host::CS_SELECTOR;
        host_ss, set_host_ss, vmcs::host::SS_SELECTOR;
        host_ds, set_host_ds, vmcs::host::DS_SELECTOR;
        host_es, set_host_es, vmcs::host::ES_SELECTOR;
        host_fs, set_host_fs, vmcs::host::FS_SELECTOR;
        host_gs, set_host_gs, vmcs::host::GS_SELECTOR;
        host_tr, set_host_tr, vmcs::host::TR_SELECTOR;
    }

    /// Host GDTR. The limit is not a VMCS field: hardware forces it to
    /// 0xFFFF on every VM exit, so the getter synthesizes that value.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
    /// 28.5.2 Loading Host Segment and Descriptor-Table Registers
    pub fn host_gdtr(&self) -> DescriptorTable {
        DescriptorTable {
            base: vmread(vmcs::host::GDTR_BASE),
            limit: 0xffff,
        }
    }

    pub fn set_host_gdtr(&mut self, gdtr: DescriptorTable) {
        vmwrite(vmcs::host::GDTR_BASE, gdtr.base);
    }

    /// Host IDTR; same forced limit as [`host_gdtr`](Self::host_gdtr).
    pub fn host_idtr(&self) -> DescriptorTable {
        DescriptorTable {
            base: vmread(vmcs::host::IDTR_BASE),
            limit: 0xffff,
        }
    }

    pub fn set_host_idtr(&mut self, idtr: DescriptorTable) {
        vmwrite(vmcs::host::IDTR_BASE, idtr.base);
    }

    //
    // Interrupt injection.
    //

    /// True when the guest can accept an event on the next VM entry.
    fn guest_interruptible(&self) -> bool {
        !self.guest_interruptibility_state().is_blocking()
            && self.guest_rflags().contains(RFlags::FLAGS_IF)
    }

    /// Requests delivery of `interrupt` to the guest.
    ///
    /// If the guest is interruptible the event is written to the VM-entry
    /// fields immediately and `true` is returned. Otherwise it is queued
    /// (at the front when `first` is set, e.g. for a re-injected
    /// IDT-vectoring event that must precede anything already waiting),
    /// interrupt-window exiting is armed so the next opportunity causes an
    /// exit, and `false` is returned.
    pub fn inject(&mut self, interrupt: InterruptInfo, first: bool) -> bool {
        if self.guest_interruptible() {
            self.inject_force(interrupt);
            return true;
        }

        assert!(
            self.pending_interrupt_count < PENDING_INTERRUPT_QUEUE_SIZE,
            "pending-interrupt queue overflow"
        );

        if first {
            self.pending_interrupt_first = if self.pending_interrupt_first == 0 {
                PENDING_INTERRUPT_QUEUE_SIZE - 1
            } else {
                self.pending_interrupt_first - 1
            };
            self.pending_interrupt[self.pending_interrupt_first] = interrupt;
        } else {
            let index = (self.pending_interrupt_first + self.pending_interrupt_count)
                % PENDING_INTERRUPT_QUEUE_SIZE;
            self.pending_interrupt[index] = interrupt;
        }
        self.pending_interrupt_count += 1;

        trace!(
            "guest not interruptible, queued vector {:#x} ({} pending)",
            interrupt.vector(),
            self.pending_interrupt_count
        );

        let controls = self.processor_based_controls();
        self.set_processor_based_controls(controls | PROCBASED_CTLS_INTERRUPT_WINDOW_EXITING);

        false
    }

    /// Delivers the oldest queued event. Called from the interrupt-window
    /// exit handler; once the queue drains the handler disarms
    /// interrupt-window exiting again.
    pub fn inject_pending(&mut self) {
        assert!(
            self.interrupt_is_pending()
                && self.pending_interrupt_count <= PENDING_INTERRUPT_QUEUE_SIZE,
            "no pending interrupt to inject"
        );

        let interrupt = self.pending_interrupt[self.pending_interrupt_first];

        self.pending_interrupt_first += 1;
        self.pending_interrupt_count -= 1;

        if self.pending_interrupt_count == 0
            || self.pending_interrupt_first == PENDING_INTERRUPT_QUEUE_SIZE
        {
            self.pending_interrupt_first = 0;
        }

        self.inject_force(interrupt);
    }

    pub fn interrupt_is_pending(&self) -> bool {
        self.pending_interrupt_count > 0
    }

    /// Writes `interrupt` to the VM-entry fields unconditionally.
    ///
    /// Error codes accompany only the hardware exceptions that push one:
    /// #TS, #NP, #SS, #GP and #PF take the caller's code, #DF and #AC always
    /// push zero. For software event types the guest RIP pushed by delivery
    /// is advanced by the entry instruction length, resolved from
    /// [`RipAdjust`]; external interrupts, NMIs and hardware exceptions push
    /// the current RIP and leave the length field alone.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual:
    /// 27.6.1.1 Details of Vectored-Event Injection
    pub fn inject_force(&mut self, interrupt: InterruptInfo) {
        const INVALID_TSS: u8 = ExceptionInterrupt::InvalidTss as u8;
        const SEGMENT_NOT_PRESENT: u8 = ExceptionInterrupt::SegmentNotPresent as u8;
        const STACK_SEGMENT_FAULT: u8 = ExceptionInterrupt::StackSegmentFault as u8;
        const GENERAL_PROTECTION: u8 = ExceptionInterrupt::GeneralProtectionFault as u8;
        const PAGE_FAULT: u8 = ExceptionInterrupt::PageFault as u8;
        const DOUBLE_FAULT: u8 = ExceptionInterrupt::DoubleFault as u8;
        const ALIGNMENT_CHECK: u8 = ExceptionInterrupt::AlignmentCheck as u8;

        self.set_entry_interruption_info(interrupt.info);

        if !interrupt.is_valid() {
            return;
        }

        if interrupt.interruption_type() == InterruptionType::HardwareException {
            match interrupt.vector() {
                INVALID_TSS | SEGMENT_NOT_PRESENT | STACK_SEGMENT_FAULT | GENERAL_PROTECTION
                | PAGE_FAULT | DOUBLE_FAULT | ALIGNMENT_CHECK => {
                    let Some(error_code) = interrupt.error_code() else {
                        panic!(
                            "hardware exception vector {} requires an error code",
                            interrupt.vector()
                        );
                    };
                    if matches!(interrupt.vector(), DOUBLE_FAULT | ALIGNMENT_CHECK) {
                        assert!(
                            error_code == 0,
                            "vector {} always delivers a zero error code",
                            interrupt.vector()
                        );
                    }
                    self.set_entry_interruption_error_code(error_code);
                }
                _ => {}
            }
        }

        if interrupt.interruption_type().is_software() {
            let length = match interrupt.rip_adjust() {
                RipAdjust::FromExitLength => self.exit_instruction_length(),
                RipAdjust::Explicit(length) => length,
            };

            if length > 0 {
                self.set_entry_instruction_length(length);
            }
        }
    }
}

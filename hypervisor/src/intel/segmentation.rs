//! Segment descriptors and descriptor-table registers as the VMCS sees them.

use bit_field::BitField;
use x86::segmentation::SegmentSelector;

/// A GDTR/IDTR value: linear base plus limit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

/// VMX access-rights "unusable" bit: the segment register is not loaded.
pub const ACCESS_RIGHTS_UNUSABLE: u32 = 1 << 16;

/// One segment register in the four-field form the guest-state area stores:
/// selector, base, limit and VMX-format access rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub selector: SegmentSelector,
    pub base: u64,
    pub limit: u32,
    pub access_rights: u32,
}

impl SegmentDescriptor {
    /// An unloaded segment register.
    pub fn invalid() -> Self {
        Self {
            selector: SegmentSelector::from_raw(0),
            base: 0,
            limit: 0,
            access_rights: ACCESS_RIGHTS_UNUSABLE,
        }
    }

    /// Captures the state of a currently loaded segment register: access
    /// rights and limit from the descriptor cache (LAR/LSL), base parsed out
    /// of the descriptor table for system segments.
    ///
    /// FS/GS bases live in MSRs rather than the descriptor; the caller
    /// overrides [`base`](Self::base) for those two.
    pub fn from_selector(selector: SegmentSelector, gdtr: &DescriptorTable) -> Self {
        if selector.bits() & !0x7 == 0 {
            // Null (any RPL) — nothing is loaded through it.
            return Self::invalid();
        }

        Self {
            selector,
            base: segment_base(gdtr, selector),
            limit: segment_limit(selector),
            access_rights: access_rights(selector),
        }
    }
}

/// Queries the descriptor cache with LAR or LSL; `None` when the
/// instruction refuses the selector (not accessible at the current CPL, bad
/// type).
macro_rules! descriptor_cache_read {
    ($instruction:literal, $selector:expr) => {{
        let value: u64;
        let ok: u8;
        unsafe {
            core::arch::asm!(
                concat!("xor {value}, {value}\n", $instruction, " {value}, {selector}"),
                "setz {ok}",
                value = out(reg) value,
                selector = in(reg) u64::from($selector.bits()),
                ok = out(reg_byte) ok,
                options(nomem, nostack),
            );
        }
        if ok == 0 { None } else { Some(value) }
    }};
}

/// VMX-format access rights for a loaded selector, via LAR.
///
/// LAR yields the descriptor's access byte in bits 15:8 and the G/D/L/AVL
/// flags in bits 23:20; the VMCS wants those at bits 7:0 and 15:12, which is
/// a shift-right-by-8 away (reserved bits 11:8 cleared). A refused selector
/// is reported unusable.
pub fn access_rights(selector: SegmentSelector) -> u32 {
    match descriptor_cache_read!("lar", selector) {
        Some(value) => ((value >> 8) as u32) & 0xf0ff,
        None => ACCESS_RIGHTS_UNUSABLE,
    }
}

/// Segment limit for a loaded selector, via LSL. Zero when LSL refuses.
pub fn segment_limit(selector: SegmentSelector) -> u32 {
    descriptor_cache_read!("lsl", selector).unwrap_or(0) as u32
}

/// Base address parsed from the descriptor table entry `selector` names.
///
/// Code and data segment bases are architecturally zero in 64-bit mode; this
/// matters for the system segments (TSS, LDT), whose 16-byte descriptors
/// carry a full 64-bit base.
pub fn segment_base(gdtr: &DescriptorTable, selector: SegmentSelector) -> u64 {
    if selector.bits() & !0x7 == 0 {
        return 0;
    }

    if selector.bits().get_bit(2) {
        // TI set: the selector names the LDT, which the blue-pill host does
        // not use.
        return 0;
    }

    let descriptor =
        unsafe { *((gdtr.base + u64::from(selector.index()) * 8) as *const u64) };

    let mut base = descriptor.get_bits(16..40) | (descriptor.get_bits(56..64) << 24);

    let system = !descriptor.get_bit(44);
    if system {
        let upper = unsafe {
            *((gdtr.base + u64::from(selector.index()) * 8 + 8) as *const u64)
        };
        base |= upper.get_bits(0..32) << 32;
    }

    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intel::support;

    #[test]
    fn null_selector_is_invalid() {
        let gdtr = support::sgdt();
        let segment = SegmentDescriptor::from_selector(SegmentSelector::from_raw(0), &gdtr);
        assert_eq!(segment.access_rights, ACCESS_RIGHTS_UNUSABLE);
        assert_eq!(segment.base, 0);

        // RPL bits alone still make a null selector.
        let segment = SegmentDescriptor::from_selector(SegmentSelector::from_raw(3), &gdtr);
        assert_eq!(segment.access_rights, ACCESS_RIGHTS_UNUSABLE);
    }

    #[test]
    fn system_segment_base_spans_sixteen_bytes() {
        // Selector 0x40 points at the fake GDT's 64-bit TSS descriptor.
        let gdtr = support::sgdt();
        let base = segment_base(&gdtr, SegmentSelector::from_raw(0x40));
        assert_eq!(base, 0x7400_2000);
    }

    #[test]
    fn code_segment_base_is_flat() {
        let gdtr = support::sgdt();
        assert_eq!(segment_base(&gdtr, SegmentSelector::from_raw(0x08)), 0);
    }
}

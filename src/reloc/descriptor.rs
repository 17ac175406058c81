//! Relocation descriptors.
//!
//! One immutable descriptor per relocation type code captures the
//! bit-manipulation contract: how far the value is shifted before
//! insertion, how wide the stored field is, which bits of the instruction
//! word it occupies, whether the field is pc-relative and which overflow
//! complaint applies. Two tables exist — the standard ABI stores 32-bit
//! addends inside the instruction word (`partial_inplace`), VxWorks
//! carries them in the relocation record — and the table choice is a pure
//! function of the target ABI.

use crate::abi::{self, is_invalid_reloc};

/// Overflow-checking policy for a relocated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Any value fits (the field is as wide as the address space).
    None,
    /// The shifted value must fit the field as an unsigned number.
    Unsigned,
    /// The shifted value must fit the field as a signed number.
    Signed,
    /// Either signed or unsigned interpretation may fit (address
    /// bitfields such as 32-bit words on a 32-bit target).
    Bitfield,
}

/// The bit-manipulation contract for one relocation type.
#[derive(Debug, Clone, Copy)]
pub struct RelocDescriptor {
    pub r_type: u32,
    pub name: &'static str,
    /// Bits discarded before insertion (instruction displacements are
    /// scaled by 2 or 4).
    pub rightshift: u8,
    /// Storage size in bytes: 0 (marker), 1, 2, 4 or 8.
    pub size: u8,
    /// Width of the inserted field in bits.
    pub bitsize: u8,
    pub pc_relative: bool,
    pub overflow: Overflow,
    /// The addend is pre-added into the instruction bytes rather than
    /// carried in the relocation record.
    pub partial_inplace: bool,
    /// Bits of the existing word that contribute to the value.
    pub src_mask: u32,
    /// Bits of the word the relocated value occupies.
    pub dst_mask: u32,
}

/// Which descriptor table an object resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableVariant {
    #[default]
    Default,
    VxWorks,
}

const fn entry(
    r_type: u32,
    name: &'static str,
    rightshift: u8,
    size: u8,
    bitsize: u8,
    pc_relative: bool,
    overflow: Overflow,
    partial_inplace: bool,
    src_mask: u32,
    dst_mask: u32,
) -> RelocDescriptor {
    RelocDescriptor {
        r_type,
        name,
        rightshift,
        size,
        bitsize,
        pc_relative,
        overflow,
        partial_inplace,
        src_mask,
        dst_mask,
    }
}

/// A 32-bit data descriptor whose in-place behavior is the only thing the
/// VxWorks table changes.
const fn entry32(
    r_type: u32,
    name: &'static str,
    pc_relative: bool,
    overflow: Overflow,
    partial32: bool,
) -> RelocDescriptor {
    entry(
        r_type,
        name,
        0,
        4,
        32,
        pc_relative,
        overflow,
        partial32,
        if partial32 { 0xffffffff } else { 0 },
        0xffffffff,
    )
}

/// A relaxation/scheduling marker; never applied to instruction bytes by
/// the resolver.
const fn marker(r_type: u32, name: &'static str) -> RelocDescriptor {
    entry(r_type, name, 0, 0, 0, false, Overflow::None, false, 0, 0)
}

const TABLE_LEN: usize = 52;

const fn build_table(partial32: bool) -> [RelocDescriptor; TABLE_LEN] {
    use Overflow::*;
    use crate::abi::*;
    [
        marker(R_SH_NONE, "R_SH_NONE"),
        entry32(R_SH_DIR32, "R_SH_DIR32", false, Bitfield, partial32),
        entry32(R_SH_REL32, "R_SH_REL32", true, Signed, partial32),
        entry(R_SH_DIR8WPN, "R_SH_DIR8WPN", 1, 2, 8, true, Signed, true, 0xff, 0xff),
        entry(R_SH_IND12W, "R_SH_IND12W", 1, 2, 12, true, Signed, true, 0xfff, 0xfff),
        entry(R_SH_DIR8WPL, "R_SH_DIR8WPL", 2, 2, 8, true, Unsigned, true, 0xff, 0xff),
        entry(R_SH_DIR8WPZ, "R_SH_DIR8WPZ", 1, 2, 8, true, Unsigned, true, 0xff, 0xff),
        entry(R_SH_DIR8BP, "R_SH_DIR8BP", 2, 2, 8, false, Unsigned, true, 0, 0xff),
        entry(R_SH_DIR8W, "R_SH_DIR8W", 1, 2, 8, false, Signed, true, 0, 0xff),
        entry(R_SH_DIR8L, "R_SH_DIR8L", 2, 2, 8, false, Signed, true, 0, 0xff),
        entry(R_SH_LOOP_START, "R_SH_LOOP_START", 1, 2, 8, false, Signed, true, 0xff, 0xff),
        entry(R_SH_LOOP_END, "R_SH_LOOP_END", 1, 2, 8, false, Signed, true, 0xff, 0xff),
        entry(R_SH_SWITCH8, "R_SH_SWITCH8", 0, 1, 8, false, Unsigned, true, 0xff, 0xff),
        entry(R_SH_SWITCH16, "R_SH_SWITCH16", 0, 2, 16, false, Unsigned, true, 0xffff, 0xffff),
        entry(R_SH_SWITCH32, "R_SH_SWITCH32", 0, 4, 32, false, Unsigned, true, 0xffffffff, 0xffffffff),
        marker(R_SH_USES, "R_SH_USES"),
        marker(R_SH_COUNT, "R_SH_COUNT"),
        marker(R_SH_ALIGN, "R_SH_ALIGN"),
        marker(R_SH_CODE, "R_SH_CODE"),
        marker(R_SH_DATA, "R_SH_DATA"),
        marker(R_SH_LABEL, "R_SH_LABEL"),
        marker(R_SH_GNU_VTINHERIT, "R_SH_GNU_VTINHERIT"),
        marker(R_SH_GNU_VTENTRY, "R_SH_GNU_VTENTRY"),
        entry(R_SH_DIR16, "R_SH_DIR16", 0, 2, 16, false, None, true, 0, 0xffff),
        entry(R_SH_DIR8, "R_SH_DIR8", 0, 1, 8, false, None, true, 0, 0xff),
        entry(R_SH_DIR8UL, "R_SH_DIR8UL", 2, 2, 8, false, Unsigned, true, 0, 0xff),
        entry(R_SH_DIR8UW, "R_SH_DIR8UW", 1, 2, 8, false, Unsigned, true, 0, 0xff),
        entry(R_SH_DIR8U, "R_SH_DIR8U", 0, 2, 8, false, Unsigned, true, 0, 0xff),
        entry(R_SH_DIR8SW, "R_SH_DIR8SW", 1, 2, 8, false, Signed, true, 0, 0xff),
        entry(R_SH_DIR8S, "R_SH_DIR8S", 0, 2, 8, false, Signed, true, 0, 0xff),
        entry(R_SH_DIR4UL, "R_SH_DIR4UL", 2, 2, 4, false, Unsigned, true, 0, 0x0f),
        entry(R_SH_DIR4UW, "R_SH_DIR4UW", 1, 2, 4, false, Unsigned, true, 0, 0x0f),
        entry(R_SH_DIR4U, "R_SH_DIR4U", 0, 2, 4, false, Unsigned, true, 0, 0x0f),
        entry(R_SH_PSHA, "R_SH_PSHA", 0, 2, 7, false, Signed, true, 0, 0xff),
        entry(R_SH_PSHL, "R_SH_PSHL", 0, 2, 5, false, Signed, true, 0, 0xff),
        entry32(R_SH_TLS_GD_32, "R_SH_TLS_GD_32", false, Bitfield, partial32),
        entry32(R_SH_TLS_LD_32, "R_SH_TLS_LD_32", false, Bitfield, partial32),
        entry32(R_SH_TLS_LDO_32, "R_SH_TLS_LDO_32", false, Bitfield, partial32),
        entry32(R_SH_TLS_IE_32, "R_SH_TLS_IE_32", false, Bitfield, partial32),
        entry32(R_SH_TLS_LE_32, "R_SH_TLS_LE_32", false, Bitfield, partial32),
        entry32(R_SH_TLS_DTPMOD32, "R_SH_TLS_DTPMOD32", false, Bitfield, partial32),
        entry32(R_SH_TLS_DTPOFF32, "R_SH_TLS_DTPOFF32", false, Bitfield, partial32),
        entry32(R_SH_TLS_TPOFF32, "R_SH_TLS_TPOFF32", false, Bitfield, partial32),
        entry32(R_SH_GOT32, "R_SH_GOT32", false, Bitfield, partial32),
        entry32(R_SH_PLT32, "R_SH_PLT32", true, Bitfield, partial32),
        entry32(R_SH_GOTOFF, "R_SH_GOTOFF", false, Bitfield, partial32),
        entry32(R_SH_GOTPC, "R_SH_GOTPC", true, Bitfield, partial32),
        entry32(R_SH_GOTPLT32, "R_SH_GOTPLT32", false, Bitfield, partial32),
        // movi20 fields; applied through the dedicated installer.
        entry(R_SH_GOT20, "R_SH_GOT20", 0, 4, 20, false, Signed, false, 0, 0x00f0ffff),
        entry(R_SH_GOTOFF20, "R_SH_GOTOFF20", 0, 4, 20, false, Signed, false, 0, 0x00f0ffff),
        entry32(R_SH_GOTFUNCDESC, "R_SH_GOTFUNCDESC", false, Bitfield, false),
        entry32(R_SH_GOTOFFFUNCDESC, "R_SH_GOTOFFFUNCDESC", false, Bitfield, false),
    ]
}

static DEFAULT_TABLE: [RelocDescriptor; TABLE_LEN] = build_table(true);
static VXWORKS_TABLE: [RelocDescriptor; TABLE_LEN] = build_table(false);

/// Look up the descriptor for `r_type`, or `None` when the code falls in
/// one of the reserved ranges (or simply has no descriptor here).
///
/// The movi20/descriptor FDPIC codes not present in the table
/// (`R_SH_GOTFUNCDESC20` and friends, `R_SH_FUNCDESC`) are resolved
/// through dedicated paths; they still answer with the matching base
/// descriptor so diagnostics and addend handling stay uniform.
pub fn lookup(r_type: u32, variant: TableVariant) -> Option<&'static RelocDescriptor> {
    if is_invalid_reloc(r_type) {
        return None;
    }
    // The 20-bit and descriptor-valued FDPIC codes share contracts with
    // table entries.
    let key = match r_type {
        abi::R_SH_GOTFUNCDESC20 => abi::R_SH_GOT20,
        abi::R_SH_GOTOFFFUNCDESC20 => abi::R_SH_GOTOFF20,
        abi::R_SH_FUNCDESC | abi::R_SH_FUNCDESC_VALUE => abi::R_SH_GOTFUNCDESC,
        abi::R_SH_COPY | abi::R_SH_GLOB_DAT | abi::R_SH_JMP_SLOT | abi::R_SH_RELATIVE => {
            abi::R_SH_DIR32
        }
        other => other,
    };
    let table: &'static [RelocDescriptor] = match variant {
        TableVariant::Default => &DEFAULT_TABLE,
        TableVariant::VxWorks => &VXWORKS_TABLE,
    };
    table.iter().find(|d| d.r_type == key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi;

    #[test]
    fn reserved_codes_have_no_descriptor() {
        for r in [12, 24, 36, 52, 100, 155, 180, 209, 4096] {
            assert!(lookup(r, TableVariant::Default).is_none());
            assert!(lookup(r, TableVariant::VxWorks).is_none());
        }
    }

    #[test]
    fn variant_only_changes_inplace_32bit_relocs() {
        let d = lookup(abi::R_SH_DIR32, TableVariant::Default).unwrap();
        let v = lookup(abi::R_SH_DIR32, TableVariant::VxWorks).unwrap();
        assert!(d.partial_inplace && !v.partial_inplace);
        assert_eq!(d.src_mask, 0xffffffff);
        assert_eq!(v.src_mask, 0);

        let d = lookup(abi::R_SH_IND12W, TableVariant::Default).unwrap();
        let v = lookup(abi::R_SH_IND12W, TableVariant::VxWorks).unwrap();
        assert_eq!(d.partial_inplace, v.partial_inplace);
        assert_eq!(d.dst_mask, 0xfff);
    }

    #[test]
    fn branch_descriptors_scale_displacements() {
        let ind12 = lookup(abi::R_SH_IND12W, TableVariant::Default).unwrap();
        assert_eq!((ind12.rightshift, ind12.bitsize), (1, 12));
        assert!(ind12.pc_relative);
        let wpl = lookup(abi::R_SH_DIR8WPL, TableVariant::Default).unwrap();
        assert_eq!(wpl.rightshift, 2);
        assert_eq!(wpl.overflow, Overflow::Unsigned);
    }

    #[test]
    fn dynamic_codes_share_dir32_contract() {
        for r in [
            abi::R_SH_GLOB_DAT,
            abi::R_SH_JMP_SLOT,
            abi::R_SH_RELATIVE,
            abi::R_SH_COPY,
        ] {
            let d = lookup(r, TableVariant::Default).unwrap();
            assert_eq!((d.size, d.bitsize), (4, 32));
        }
    }
}

//! SuperH-specific ELF ABI constants.
//!
//! Generic ELF constants come from `elf::abi`; everything SH-specific —
//! relocation type codes (including the reserved gaps interspersed among
//! them), `e_flags` bits and the handful of instruction encodings the
//! engine synthesizes — lives here.

/// The ELF machine type for SuperH.
pub const EM_ARCH: u16 = elf::abi::EM_SH;

// ── Relocation type codes ────────────────────────────────────────────────
//
// The numbering is fixed ABI; the gaps between the ranges below are
// reserved and must be rejected, not ignored.

pub const R_SH_NONE: u32 = 0;
pub const R_SH_DIR32: u32 = 1;
pub const R_SH_REL32: u32 = 2;
/// 8-bit pc-relative branch displacement, in words (`bt`/`bf`).
pub const R_SH_DIR8WPN: u32 = 3;
/// 12-bit pc-relative branch displacement, in words (`bra`/`bsr`).
pub const R_SH_IND12W: u32 = 4;
/// 8-bit pc-relative displacement, in longwords (`mov.l @(disp,pc)`).
pub const R_SH_DIR8WPL: u32 = 5;
/// 8-bit pc-relative displacement, in words, zero-based (`mov.w`).
pub const R_SH_DIR8WPZ: u32 = 6;
/// 8-bit GBR-relative displacement.
pub const R_SH_DIR8BP: u32 = 7;
pub const R_SH_DIR8W: u32 = 8;
pub const R_SH_DIR8L: u32 = 9;
/// Start address of a zero-overhead loop (SH-DSP `repeat`).
pub const R_SH_LOOP_START: u32 = 10;
/// End address of a zero-overhead loop.
pub const R_SH_LOOP_END: u32 = 11;

/// Jump-table entry deltas patched during relaxation.
pub const R_SH_SWITCH16: u32 = 25;
pub const R_SH_SWITCH32: u32 = 26;
/// Marks a `mov.l` register load feeding an indirect `jsr`/`jmp`.
pub const R_SH_USES: u32 = 27;
/// Number of call sites sharing one literal-pool address word.
pub const R_SH_COUNT: u32 = 28;
/// Alignment barrier; the addend is the alignment power.
pub const R_SH_ALIGN: u32 = 29;
pub const R_SH_CODE: u32 = 30;
pub const R_SH_DATA: u32 = 31;
/// Branch target; instruction scheduling never swaps across one.
pub const R_SH_LABEL: u32 = 32;
pub const R_SH_SWITCH8: u32 = 33;
pub const R_SH_GNU_VTINHERIT: u32 = 34;
pub const R_SH_GNU_VTENTRY: u32 = 35;

// SH-2A immediate-field relocations.
pub const R_SH_DIR16: u32 = 53;
pub const R_SH_DIR8: u32 = 54;
pub const R_SH_DIR8UL: u32 = 55;
pub const R_SH_DIR8UW: u32 = 56;
pub const R_SH_DIR8U: u32 = 57;
pub const R_SH_DIR8SW: u32 = 58;
pub const R_SH_DIR8S: u32 = 59;
pub const R_SH_DIR4UL: u32 = 60;
pub const R_SH_DIR4UW: u32 = 61;
pub const R_SH_DIR4U: u32 = 62;
/// DSP `psha` immediate shift, range -32..=32.
pub const R_SH_PSHA: u32 = 63;
/// DSP `pshl` immediate shift, range -16..=16.
pub const R_SH_PSHL: u32 = 64;

pub const R_SH_TLS_GD_32: u32 = 144;
pub const R_SH_TLS_LD_32: u32 = 145;
pub const R_SH_TLS_LDO_32: u32 = 146;
pub const R_SH_TLS_IE_32: u32 = 147;
pub const R_SH_TLS_LE_32: u32 = 148;
pub const R_SH_TLS_DTPMOD32: u32 = 149;
pub const R_SH_TLS_DTPOFF32: u32 = 150;
pub const R_SH_TLS_TPOFF32: u32 = 151;

pub const R_SH_GOT32: u32 = 160;
pub const R_SH_PLT32: u32 = 161;
pub const R_SH_COPY: u32 = 162;
pub const R_SH_GLOB_DAT: u32 = 163;
pub const R_SH_JMP_SLOT: u32 = 164;
pub const R_SH_RELATIVE: u32 = 165;
pub const R_SH_GOTOFF: u32 = 166;
pub const R_SH_GOTPC: u32 = 167;
pub const R_SH_GOTPLT32: u32 = 168;

// FDPIC relocations. The `20` variants target the SH-2A movi20 field.
pub const R_SH_GOT20: u32 = 201;
pub const R_SH_GOTOFF20: u32 = 202;
pub const R_SH_GOTFUNCDESC: u32 = 203;
pub const R_SH_GOTFUNCDESC20: u32 = 204;
pub const R_SH_GOTOFFFUNCDESC: u32 = 205;
pub const R_SH_GOTOFFFUNCDESC20: u32 = 206;
pub const R_SH_FUNCDESC: u32 = 207;
pub const R_SH_FUNCDESC_VALUE: u32 = 208;

/// One past the largest assigned relocation code.
pub const R_SH_MAX: u32 = 209;

/// Returns true for codes inside one of the reserved gaps (or past the
/// end of the assigned space). These are hard link errors, never no-ops.
pub fn is_invalid_reloc(r_type: u32) -> bool {
    matches!(
        r_type,
        12..=24 | 36..=52 | 65..=143 | 152..=159 | 169..=200
    ) || r_type >= R_SH_MAX
}

/// Relocations in this range only assist relaxation and instruction
/// scheduling; the final resolver ignores them.
pub fn is_marker_reloc(r_type: u32) -> bool {
    (R_SH_SWITCH16..=R_SH_GNU_VTENTRY).contains(&r_type)
}

/// Map relocation codes to human readable names.
pub fn reloc_name(r_type: u32) -> &'static str {
    match r_type {
        R_SH_NONE => "R_SH_NONE",
        R_SH_DIR32 => "R_SH_DIR32",
        R_SH_REL32 => "R_SH_REL32",
        R_SH_DIR8WPN => "R_SH_DIR8WPN",
        R_SH_IND12W => "R_SH_IND12W",
        R_SH_DIR8WPL => "R_SH_DIR8WPL",
        R_SH_DIR8WPZ => "R_SH_DIR8WPZ",
        R_SH_DIR8BP => "R_SH_DIR8BP",
        R_SH_DIR8W => "R_SH_DIR8W",
        R_SH_DIR8L => "R_SH_DIR8L",
        R_SH_LOOP_START => "R_SH_LOOP_START",
        R_SH_LOOP_END => "R_SH_LOOP_END",
        R_SH_SWITCH16 => "R_SH_SWITCH16",
        R_SH_SWITCH32 => "R_SH_SWITCH32",
        R_SH_USES => "R_SH_USES",
        R_SH_COUNT => "R_SH_COUNT",
        R_SH_ALIGN => "R_SH_ALIGN",
        R_SH_CODE => "R_SH_CODE",
        R_SH_DATA => "R_SH_DATA",
        R_SH_LABEL => "R_SH_LABEL",
        R_SH_SWITCH8 => "R_SH_SWITCH8",
        R_SH_GNU_VTINHERIT => "R_SH_GNU_VTINHERIT",
        R_SH_GNU_VTENTRY => "R_SH_GNU_VTENTRY",
        R_SH_DIR16 => "R_SH_DIR16",
        R_SH_DIR8 => "R_SH_DIR8",
        R_SH_DIR8UL => "R_SH_DIR8UL",
        R_SH_DIR8UW => "R_SH_DIR8UW",
        R_SH_DIR8U => "R_SH_DIR8U",
        R_SH_DIR8SW => "R_SH_DIR8SW",
        R_SH_DIR8S => "R_SH_DIR8S",
        R_SH_DIR4UL => "R_SH_DIR4UL",
        R_SH_DIR4UW => "R_SH_DIR4UW",
        R_SH_DIR4U => "R_SH_DIR4U",
        R_SH_PSHA => "R_SH_PSHA",
        R_SH_PSHL => "R_SH_PSHL",
        R_SH_TLS_GD_32 => "R_SH_TLS_GD_32",
        R_SH_TLS_LD_32 => "R_SH_TLS_LD_32",
        R_SH_TLS_LDO_32 => "R_SH_TLS_LDO_32",
        R_SH_TLS_IE_32 => "R_SH_TLS_IE_32",
        R_SH_TLS_LE_32 => "R_SH_TLS_LE_32",
        R_SH_TLS_DTPMOD32 => "R_SH_TLS_DTPMOD32",
        R_SH_TLS_DTPOFF32 => "R_SH_TLS_DTPOFF32",
        R_SH_TLS_TPOFF32 => "R_SH_TLS_TPOFF32",
        R_SH_GOT32 => "R_SH_GOT32",
        R_SH_PLT32 => "R_SH_PLT32",
        R_SH_COPY => "R_SH_COPY",
        R_SH_GLOB_DAT => "R_SH_GLOB_DAT",
        R_SH_JMP_SLOT => "R_SH_JMP_SLOT",
        R_SH_RELATIVE => "R_SH_RELATIVE",
        R_SH_GOTOFF => "R_SH_GOTOFF",
        R_SH_GOTPC => "R_SH_GOTPC",
        R_SH_GOTPLT32 => "R_SH_GOTPLT32",
        R_SH_GOT20 => "R_SH_GOT20",
        R_SH_GOTOFF20 => "R_SH_GOTOFF20",
        R_SH_GOTFUNCDESC => "R_SH_GOTFUNCDESC",
        R_SH_GOTFUNCDESC20 => "R_SH_GOTFUNCDESC20",
        R_SH_GOTOFFFUNCDESC => "R_SH_GOTOFFFUNCDESC",
        R_SH_GOTOFFFUNCDESC20 => "R_SH_GOTOFFFUNCDESC20",
        R_SH_FUNCDESC => "R_SH_FUNCDESC",
        R_SH_FUNCDESC_VALUE => "R_SH_FUNCDESC_VALUE",
        _ => "UNKNOWN",
    }
}

// ── e_flags ──────────────────────────────────────────────────────────────

/// Mask over the machine-variant bits of `e_flags`.
pub const EF_SH_MACH_MASK: u32 = 0x1f;
pub const EF_SH1: u32 = 1;
pub const EF_SH2: u32 = 2;
pub const EF_SH3: u32 = 3;
/// DSP instruction set; incompatible with the FPU variants below.
pub const EF_SH_DSP: u32 = 4;
pub const EF_SH3_DSP: u32 = 5;
pub const EF_SH3E: u32 = 8;
pub const EF_SH4: u32 = 9;
pub const EF_SH2A: u32 = 0x0d;
/// The output requires PIC-style load-time treatment.
pub const EF_SH_PIC: u32 = 0x100;
/// The output follows the FDPIC ABI.
pub const EF_SH_FDPIC: u32 = 0x8000;

/// True when the machine variant includes DSP instructions.
pub fn mach_has_dsp(mach: u32) -> bool {
    matches!(mach, EF_SH_DSP | EF_SH3_DSP)
}

/// True when the machine variant includes floating point.
pub fn mach_has_fp(mach: u32) -> bool {
    matches!(mach, EF_SH3E | EF_SH4)
}

// ── Instruction encodings the engine writes ──────────────────────────────

/// `nop`
pub const NOP_OPCODE: u16 = 0x0009;
/// `bra disp12` with a zero displacement field.
pub const BRA_OPCODE: u16 = 0xa000;
/// `bsr disp12` with a zero displacement field.
pub const BSR_OPCODE: u16 = 0xb000;
/// Top nibble of `mov.l @(disp,pc),rN`.
pub const MOVL_PCREL_MASK: u16 = 0xf000;
pub const MOVL_PCREL_OPCODE: u16 = 0xd000;
/// The `jsr @rN`/`jmp @rN` bit distinguishing call from jump.
pub const JSR_BIT: u16 = 0x0020;

/// SH-DSP parallel-processing instruction test used by the
/// zero-overhead-loop span walk.
pub fn is_ppi(insn: u16) -> bool {
    (insn & 0xfc00) == 0xf800
}

// ── Byte order ───────────────────────────────────────────────────────────

/// Target byte order. SH supports both; templates and field insertion are
/// selected by this at run time rather than by near-duplicate tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    Big,
    #[default]
    Little,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_gaps_are_invalid() {
        for r in [12, 24, 36, 52, 65, 143, 152, 159, 169, 200, 209, 255] {
            assert!(is_invalid_reloc(r), "{r} should be reserved");
        }
        for r in [
            R_SH_NONE,
            R_SH_DIR32,
            R_SH_LOOP_END,
            R_SH_SWITCH16,
            R_SH_GNU_VTENTRY,
            R_SH_DIR16,
            R_SH_PSHL,
            R_SH_TLS_GD_32,
            R_SH_TLS_TPOFF32,
            R_SH_GOT32,
            R_SH_GOTPLT32,
            R_SH_GOT20,
            R_SH_FUNCDESC_VALUE,
        ] {
            assert!(!is_invalid_reloc(r), "{r} should be valid");
        }
    }

    #[test]
    fn marker_range_excludes_branches() {
        assert!(is_marker_reloc(R_SH_ALIGN));
        assert!(is_marker_reloc(R_SH_USES));
        assert!(!is_marker_reloc(R_SH_IND12W));
        assert!(!is_marker_reloc(R_SH_TLS_GD_32));
    }
}

//! Load/store alignment scheduling.
//!
//! On SH parts other than the SH4, a 32-bit load or store that crosses a
//! longword boundary costs an extra cycle. Within each span of code
//! delimited by `R_SH_CODE`/`R_SH_DATA` markers, a misaligned `mov.l` is
//! pulled onto a 4-byte boundary by exchanging it with the preceding
//! 2-byte instruction — but only when no `R_SH_LABEL` branch target sits
//! between the pair and neither instruction depends on the other.
//! Swapping moves relocation sites by two bytes, so every displacement
//! relocation on the pair is re-biased and re-checked for overflow.

use crate::abi;
use crate::linker::LinkConfig;
use crate::object::{InputObject, RelocEntry};
use crate::reloc::patch::{get_16, put_16};
use crate::{Error, Result};
use alloc::vec::Vec;

/// Walk the section's code spans and swap whatever is profitable.
pub fn align_loads(
    objects: &mut [InputObject],
    obj_idx: usize,
    sec_idx: usize,
    cfg: &LinkConfig,
) -> Result<bool> {
    let mut swapped = false;

    // Addresses with labels on them; the assembler emits relocs in
    // address order, so this is already sorted.
    let labels: Vec<u32> = objects[obj_idx].sections[sec_idx]
        .relocs
        .iter()
        .filter(|r| r.r_type == abi::R_SH_LABEL)
        .map(|r| r.offset)
        .collect();

    // Collect the CODE..DATA spans up front; the swap rewrites contents
    // but never moves the markers.
    let spans: Vec<(u32, u32)> = {
        let sec = &objects[obj_idx].sections[sec_idx];
        let mut spans = Vec::new();
        let mut iter = sec.relocs.iter().peekable();
        while let Some(rel) = iter.next() {
            if rel.r_type != abi::R_SH_CODE {
                continue;
            }
            let start = rel.offset;
            let mut stop = sec.size();
            for next in iter.by_ref() {
                if next.r_type == abi::R_SH_DATA {
                    stop = next.offset;
                    break;
                }
            }
            spans.push((start, stop));
        }
        spans
    };

    for (start, stop) in spans {
        swapped |= align_load_span(objects, obj_idx, sec_idx, &labels, start, stop, cfg)?;
    }
    Ok(swapped)
}

/// True for the `mov.l` forms that perform a 32-bit memory access and
/// profit from longword alignment.
fn is_long_access(insn: u16) -> bool {
    match insn & 0xf000 {
        // mov.l @(disp,pc),rN
        0xd000 => true,
        // mov.l @(disp,rM),rN / mov.l rM,@(disp,rN)
        0x5000 | 0x1000 => true,
        0x6000 | 0x2000 => {
            // mov.l @rM,rN / mov.l @rM+,rN / mov.l rM,@rN / mov.l rM,@-rN
            matches!(insn & 0x000f, 0x2 | 0x6)
        }
        _ => false,
    }
}

/// The general-purpose register an instruction writes: `None` when the
/// encoding is not understood (such instructions are never moved),
/// `Some(None)` when it writes no general register.
fn written_register(insn: u16) -> Option<Option<u8>> {
    let n = ((insn >> 8) & 0xf) as u8;
    match insn & 0xf000 {
        // mov #imm,rN / add #imm,rN
        0xe000 | 0x7000 => Some(Some(n)),
        // mov.l @(disp,pc),rN / mov.l @(disp,rM),rN
        0xd000 | 0x5000 => Some(Some(n)),
        // mov.l @rM,rN / mov rM,rN; post-increment forms stay unknown
        0x6000 if matches!(insn & 0xf, 0x2 | 0x3) => Some(Some(n)),
        // ALU rM,rN
        0x3000 => Some(Some(n)),
        // mov.l rM,@(disp,rN) / mov.l rM,@rN stores
        0x1000 => Some(None),
        0x2000 if insn & 0xf == 0x2 => Some(None),
        _ => None,
    }
}

/// Registers an instruction reads, or `None` when undecidable.
fn read_registers(insn: u16) -> Option<(Option<u8>, Option<u8>)> {
    let n = ((insn >> 8) & 0xf) as u8;
    let m = ((insn >> 4) & 0xf) as u8;
    match insn & 0xf000 {
        0xe000 | 0xd000 => Some((None, None)),
        0x7000 => Some((Some(n), None)),
        0x5000 => Some((Some(m), None)),
        0x6000 if matches!(insn & 0xf, 0x2 | 0x3) => Some((Some(m), None)),
        0x3000 => Some((Some(m), Some(n))),
        0x1000 => Some((Some(m), Some(n))),
        0x2000 if insn & 0xf == 0x2 => Some((Some(m), Some(n))),
        _ => None,
    }
}

/// Branches, delay-slot owners and anything pc-relative stay put.
fn is_unswappable(insn: u16) -> bool {
    match insn & 0xf000 {
        // bra/bsr and the bt/bf family
        0xa000 | 0xb000 | 0x8000 => true,
        // jsr/jmp/rts/rte and other system forms
        0x4000 => matches!(insn & 0x00ff, 0x0b | 0x2b),
        0x0000 => matches!(insn & 0x00ff, 0x0b | 0x2b | 0x09) && insn != abi::NOP_OPCODE,
        // pc-relative loads move their own displacement; mova too
        0xc000 => (insn & 0x0f00) == 0x0700,
        _ => false,
    }
}

fn has_label(labels: &[u32], addr: u32) -> bool {
    labels.binary_search(&addr).is_ok()
}

fn align_load_span(
    objects: &mut [InputObject],
    obj_idx: usize,
    sec_idx: usize,
    labels: &[u32],
    start: u32,
    stop: u32,
    cfg: &LinkConfig,
) -> Result<bool> {
    let endian = cfg.endian;
    let mut swapped = false;

    let mut i = start;
    while i + 4 <= stop {
        // Look at the second instruction of each candidate pair: a
        // misaligned long access at an odd word address.
        let addr = i + 2;
        if addr & 3 == 0 {
            i += 2;
            continue;
        }
        let (first, second) = {
            let contents = &objects[obj_idx].sections[sec_idx].contents;
            if (addr + 2) as usize > contents.len() {
                break;
            }
            (
                get_16(contents, i as usize, endian),
                get_16(contents, addr as usize, endian),
            )
        };

        if !is_long_access(second)
            || is_unswappable(first)
            || is_unswappable(second)
            || has_label(labels, addr)
            || has_label(labels, i)
        {
            i += 2;
            continue;
        }

        // Both data dependencies must be decidable and absent.
        let (Some(w1), Some(w2), Some((r1a, r1b)), Some((r2a, r2b))) = (
            written_register(first),
            written_register(second),
            read_registers(first),
            read_registers(second),
        ) else {
            i += 2;
            continue;
        };
        let conflict = (w1.is_some() && [r2a, r2b].contains(&w1))
            || (w2.is_some() && [r1a, r1b].contains(&w2))
            || (w1.is_some() && w1 == w2);
        if conflict {
            i += 2;
            continue;
        }

        swap_insns(objects, obj_idx, sec_idx, i, cfg)?;
        swapped = true;
        i += 4;
    }

    Ok(swapped)
}

/// Exchange the two 16-bit instructions at `addr` and `addr + 2`,
/// repairing every relocation attached to either.
pub(crate) fn swap_insns(
    objects: &mut [InputObject],
    obj_idx: usize,
    sec_idx: usize,
    addr: u32,
    cfg: &LinkConfig,
) -> Result<()> {
    let endian = cfg.endian;

    {
        let contents = &mut objects[obj_idx].sections[sec_idx].contents;
        let i1 = get_16(contents, addr as usize, endian);
        let i2 = get_16(contents, (addr + 2) as usize, endian);
        put_16(contents, addr as usize, endian, i2);
        put_16(contents, (addr + 2) as usize, endian, i1);
    }

    let nrelocs = objects[obj_idx].sections[sec_idx].relocs.len();
    for r in 0..nrelocs {
        let rel: RelocEntry = objects[obj_idx].sections[sec_idx].relocs[r];

        // Marker relocs describe addresses, not the instructions at
        // them; they stay put.
        if matches!(
            rel.r_type,
            abi::R_SH_ALIGN | abi::R_SH_CODE | abi::R_SH_DATA | abi::R_SH_LABEL
        ) {
            continue;
        }

        // A USES pointing at either swapped address must follow its
        // load; a jump, in contrast, wants both instructions executed
        // after it, and labels were avoided above.
        if rel.r_type == abi::R_SH_USES {
            let off = rel.offset.wrapping_add(4).wrapping_add(rel.addend as u32);
            if off == addr {
                objects[obj_idx].sections[sec_idx].relocs[r].offset += 2;
            } else if off == addr + 2 {
                objects[obj_idx].sections[sec_idx].relocs[r].offset -= 2;
            }
        }
        let rel = objects[obj_idx].sections[sec_idx].relocs[r];

        let add: i32 = if rel.offset == addr {
            objects[obj_idx].sections[sec_idx].relocs[r].offset += 2;
            -2
        } else if rel.offset == addr + 2 {
            objects[obj_idx].sections[sec_idx].relocs[r].offset -= 2;
            2
        } else {
            0
        };

        if add != 0 {
            let loc = objects[obj_idx].sections[sec_idx].relocs[r].offset as usize;
            let sec = &mut objects[obj_idx].sections[sec_idx];
            let mut overflow = false;
            match rel.r_type {
                abi::R_SH_DIR8WPN | abi::R_SH_DIR8WPZ => {
                    let insn = get_16(&sec.contents, loc, endian);
                    let new = insn.wrapping_add((add / 2) as u16);
                    if insn & 0xff00 != new & 0xff00 {
                        overflow = true;
                    }
                    put_16(&mut sec.contents, loc, endian, new);
                }
                abi::R_SH_IND12W => {
                    let insn = get_16(&sec.contents, loc, endian);
                    let new = insn.wrapping_add((add / 2) as u16);
                    if insn & 0xf000 != new & 0xf000 {
                        overflow = true;
                    }
                    put_16(&mut sec.contents, loc, endian, new);
                }
                abi::R_SH_DIR8WPL => {
                    // The displacement ignores the low bits of the pc, so
                    // a swap at an even longword boundary changes
                    // nothing; at an odd one the site crosses the
                    // boundary and must be re-biased.
                    if addr & 3 != 0 {
                        let insn = get_16(&sec.contents, loc, endian);
                        let new = insn.wrapping_add((add / 2) as u16);
                        if insn & 0xff00 != new & 0xff00 {
                            overflow = true;
                        }
                        put_16(&mut sec.contents, loc, endian, new);
                    }
                }
                _ => {}
            }

            if overflow {
                return Err(Error::RelaxOverflow {
                    object: objects[obj_idx].name.clone(),
                    section: objects[obj_idx].sections[sec_idx].name.clone(),
                    offset: rel.offset,
                });
            }
        }
    }

    Ok(())
}

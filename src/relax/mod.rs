//! Branch relaxation.
//!
//! An indirect call sequence
//!
//! ```text
//!     mov.l  .Lpool,r1      ! R_SH_USES points here
//!     ...
//!     jsr    @r1
//!     ...
//! .Lpool:
//!     .long  target         ! R_SH_DIR32 + R_SH_COUNT
//! ```
//!
//! becomes a single `bsr target` when the displacement is provably within
//! the 12-bit branch range. The dead register load (2 bytes) is deleted
//! immediately; the literal-pool word (4 bytes) follows once its
//! `R_SH_COUNT` use count drains to zero. Deletion shifts everything after
//! it, so every relocation, local and global symbol, jump-table delta and
//! embedded displacement in the section is repaired, bounded by the next
//! `R_SH_ALIGN` marker big enough to absorb the gap.
//!
//! Each successful conversion can unlock more, so the driver iterates to a
//! fixed point.

pub mod align;

use crate::abi::{self};
use crate::linker::LinkConfig;
use crate::object::{GlobalSymbol, InputObject, SymbolDef, SymbolRef};
use crate::reloc::descriptor::lookup;
use crate::reloc::patch::{get_16, get_32, put_16, put_32};
use crate::{Error, Result};
use alloc::vec::Vec;

#[cfg(feature = "log")]
use crate::abi::reloc_name;

/// Relax one section. Returns `true` when at least one call sequence was
/// shortened, requesting another whole-link iteration.
pub fn relax_section(
    objects: &mut [InputObject],
    obj_idx: usize,
    sec_idx: usize,
    globals: &mut [GlobalSymbol],
    cfg: &LinkConfig,
) -> Result<bool> {
    let endian = cfg.endian;
    let variant = cfg.table_variant();
    let mut again = false;
    let mut have_code = false;

    let nrelocs = objects[obj_idx].sections[sec_idx].relocs.len();
    for i in 0..nrelocs {
        let (r_type, offset, addend) = {
            let rel = &objects[obj_idx].sections[sec_idx].relocs[i];
            (rel.r_type, rel.offset, rel.addend)
        };
        if r_type == abi::R_SH_CODE {
            have_code = true;
        }
        if r_type != abi::R_SH_USES {
            continue;
        }

        // The USES addend is laid out like a jump offset, based from four
        // bytes past the instruction.
        let laddr = offset.wrapping_add(4).wrapping_add(addend as u32);
        let sec_size = objects[obj_idx].sections[sec_idx].size();
        if laddr >= sec_size {
            warn_site(&objects[obj_idx], sec_idx, offset, "bad R_SH_USES offset");
            continue;
        }
        let insn = get_16(
            &objects[obj_idx].sections[sec_idx].contents,
            laddr as usize,
            endian,
        );
        if insn & abi::MOVL_PCREL_MASK != abi::MOVL_PCREL_OPCODE {
            warn_site(
                &objects[obj_idx],
                sec_idx,
                offset,
                "R_SH_USES points to unrecognized insn",
            );
            continue;
        }

        // The mov.l displacement is quadrupled and based from the
        // longword-aligned address four bytes on.
        let paddr = (u32::from(insn) & 0xff) * 4 + ((laddr + 4) & !3u32);
        if paddr >= sec_size {
            warn_site(&objects[obj_idx], sec_idx, offset, "bad R_SH_USES load offset");
            continue;
        }

        // The DIR32 on the literal word names the real call target.
        let Some(fn_idx) = objects[obj_idx].sections[sec_idx]
            .relocs
            .iter()
            .position(|r| r.offset == paddr && r.r_type == abi::R_SH_DIR32)
        else {
            warn_site(&objects[obj_idx], sec_idx, paddr, "could not find expected reloc");
            continue;
        };

        let target = objects[obj_idx].sections[sec_idx].relocs[fn_idx].symbol;
        let mut symval = match target {
            SymbolRef::Local(l) => {
                let isym = &objects[obj_idx].locals[l];
                if isym.section != Some(sec_idx) {
                    warn_site(&objects[obj_idx], sec_idx, paddr, "symbol in unexpected section");
                    continue;
                }
                objects[obj_idx].sections[sec_idx].vma + isym.value
            }
            SymbolRef::Global(g) => match globals[g].def {
                SymbolDef::Defined {
                    object,
                    section,
                    value,
                } => objects[object].sections[section].vma + value,
                // Undefined here; the regular reloc pass will complain.
                _ => continue,
            },
        };

        let partial = lookup(abi::R_SH_DIR32, variant)
            .map(|d| d.partial_inplace)
            .unwrap_or(true);
        let pool_word = get_32(
            &objects[obj_idx].sections[sec_idx].contents,
            paddr as usize,
            endian,
        );
        if partial {
            symval = symval.wrapping_add(pool_word);
        } else {
            symval =
                symval.wrapping_add(objects[obj_idx].sections[sec_idx].relocs[fn_idx].addend as u32);
        }

        // Displacement from four bytes past the call site. Keep slack for
        // an .align beyond us that stays put while bytes behind us go.
        let foff = i64::from(symval)
            - i64::from(objects[obj_idx].sections[sec_idx].vma + offset + 4);
        if !(-0x1000..0x1000 - 8).contains(&foff) {
            continue;
        }

        #[cfg(feature = "log")]
        log::debug!(
            "{}:{}: shortening call at {:#x} ({})",
            objects[obj_idx].name,
            objects[obj_idx].sections[sec_idx].name,
            offset,
            reloc_name(r_type)
        );

        // Rewrite jsr/jmp into bsr/bra and retype the USES into the
        // branch relocation; resolution happens at final link.
        {
            let sec = &mut objects[obj_idx].sections[sec_idx];
            let call = get_16(&sec.contents, offset as usize, endian);
            let short = if call & abi::JSR_BIT != 0 {
                abi::BRA_OPCODE
            } else {
                abi::BSR_OPCODE
            };
            put_16(&mut sec.contents, offset as usize, endian, short);
            let rel = &mut sec.relocs[i];
            rel.symbol = target;
            rel.r_type = abi::R_SH_IND12W;
            // The branch does not encode the constant-pool word the DIR32
            // carried, so fold it into the addend.
            rel.addend = (-4i32).wrapping_add(pool_word as i32);
        }

        // Another call may still depend on this register load.
        let shared = objects[obj_idx].sections[sec_idx]
            .relocs
            .iter()
            .enumerate()
            .any(|(k, r)| {
                k != i
                    && r.r_type == abi::R_SH_USES
                    && laddr == r.offset.wrapping_add(4).wrapping_add(r.addend as u32)
            });
        if shared {
            continue;
        }

        // Locate the COUNT before deleting anything, while addresses are
        // still meaningful.
        let count_idx = objects[obj_idx].sections[sec_idx]
            .relocs
            .iter()
            .position(|r| r.offset == paddr && r.r_type == abi::R_SH_COUNT);

        delete_bytes(objects, obj_idx, sec_idx, globals, laddr, 2, cfg)?;
        again = true;

        let Some(count_idx) = count_idx else {
            warn_site(&objects[obj_idx], sec_idx, paddr, "could not find expected COUNT reloc");
            continue;
        };
        if objects[obj_idx].sections[sec_idx].relocs[count_idx].addend == 0 {
            warn_site(&objects[obj_idx], sec_idx, paddr, "bad count");
            continue;
        }
        objects[obj_idx].sections[sec_idx].relocs[count_idx].addend -= 1;

        // The literal word dies with its last use. Its address may have
        // shifted, so reload it from the DIR32 record.
        if objects[obj_idx].sections[sec_idx].relocs[count_idx].addend == 0 {
            let pool = objects[obj_idx].sections[sec_idx].relocs[fn_idx].offset;
            delete_bytes(objects, obj_idx, sec_idx, globals, pool, 4, cfg)?;
        }
    }

    // Align 32-bit loads and stores when the machine benefits.
    if cfg.align_loads
        && have_code
        && (objects[obj_idx].e_flags & abi::EF_SH_MACH_MASK) != abi::EF_SH4
    {
        align::align_loads(objects, obj_idx, sec_idx, cfg)?;
    }

    Ok(again)
}

fn warn_site(obj: &InputObject, sec_idx: usize, offset: u32, _msg: &str) {
    #[cfg(feature = "log")]
    log::warn!(
        "{}:{}: {:#x}: warning: {}",
        obj.name,
        obj.sections[sec_idx].name,
        offset,
        _msg
    );
    #[cfg(not(feature = "log"))]
    let _ = (obj, sec_idx, offset);
}

fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Delete `count` bytes at `addr` while relaxing, repairing every
/// relocation, symbol and embedded displacement the move disturbs.
///
/// Deletion stops at the next `R_SH_ALIGN` whose alignment power exceeds
/// the byte count; when such a marker bounds the gap the range is padded
/// with `nop` instead of shrinking the section.
pub(crate) fn delete_bytes(
    objects: &mut [InputObject],
    obj_idx: usize,
    sec_idx: usize,
    globals: &mut [GlobalSymbol],
    addr: u32,
    count: u32,
    cfg: &LinkConfig,
) -> Result<()> {
    debug_assert!(count & 1 == 0, "deletions are whole instructions");
    let endian = cfg.endian;
    let variant = cfg.table_variant();
    let dir32_partial = lookup(abi::R_SH_DIR32, variant)
        .map(|d| d.partial_inplace)
        .unwrap_or(true);

    // Snapshot of the local symbol table; the values themselves are
    // adjusted only after the relocation scans, like the relocations'
    // view of them.
    let local_info: Vec<(Option<usize>, u32)> = objects[obj_idx]
        .locals
        .iter()
        .map(|l| (l.section, l.value))
        .collect();

    // The deletion must stop at the next ALIGN reloc for an alignment
    // power larger than the number of bytes we are deleting.
    let (align_idx, toaddr) = {
        let sec = &objects[obj_idx].sections[sec_idx];
        let mut found = None;
        let mut toaddr = sec.size();
        for (k, rel) in sec.relocs.iter().enumerate() {
            let power = rel.addend as u32;
            if rel.r_type == abi::R_SH_ALIGN
                && rel.offset > addr
                && (power >= 32 || count < (1u32 << power))
            {
                found = Some(k);
                toaddr = rel.offset;
                break;
            }
        }
        (found, toaddr)
    };

    // Actually delete the bytes.
    {
        let sec = &mut objects[obj_idx].sections[sec_idx];
        let contents = &mut sec.contents;
        contents.copy_within((addr + count) as usize..toaddr as usize, addr as usize);
        if align_idx.is_none() {
            contents.truncate((toaddr - count) as usize);
        } else {
            let mut i = toaddr - count;
            while i < toaddr {
                put_16(contents, i as usize, endian, abi::NOP_OPCODE);
                i += 2;
            }
        }
    }

    // Adjust all the relocs.
    let nrelocs = objects[obj_idx].sections[sec_idx].relocs.len();
    for r in 0..nrelocs {
        let sec = &mut objects[obj_idx].sections[sec_idx];
        let (r_type, r_offset, r_addend) = {
            let rel = &sec.relocs[r];
            (rel.r_type, rel.offset, rel.addend)
        };

        let mut nraddr = r_offset;
        if (r_offset > addr && r_offset < toaddr)
            || (r_type == abi::R_SH_ALIGN && r_offset == toaddr)
        {
            nraddr -= count;
        }

        // A reloc inside the deleted range is dead, unless it represents
        // an address rather than an instruction field.
        if r_offset >= addr
            && r_offset < addr + count
            && !matches!(
                r_type,
                abi::R_SH_ALIGN | abi::R_SH_CODE | abi::R_SH_DATA | abi::R_SH_LABEL
            )
        {
            sec.relocs[r].r_type = abi::R_SH_NONE;
        }
        let r_type = sec.relocs[r].r_type;

        // For pc-relative relocs, work out the span the displacement
        // covers so one-sided overlaps with the hole can be re-biased.
        let mut insn: u32 = 0;
        let mut start = i64::from(addr);
        let mut stop = i64::from(addr);
        let mut voff: i64 = 0;
        if matches!(
            r_type,
            abi::R_SH_DIR8WPN | abi::R_SH_IND12W | abi::R_SH_DIR8WPZ | abi::R_SH_DIR8WPL
        ) {
            start = i64::from(r_offset);
            insn = u32::from(get_16(&sec.contents, nraddr as usize, endian));
        }

        match r_type {
            abi::R_SH_DIR32 => {
                // A DIR32 against a local symbol that stays put may point
                // into the moved range; re-bias the stored value or the
                // addend, whichever carries it.
                if let SymbolRef::Local(l) = sec.relocs[r].symbol {
                    let (lsec, lval) = local_info[l];
                    if lsec == Some(sec_idx) && (lval <= addr || lval >= toaddr) {
                        if dir32_partial {
                            let val = get_32(&sec.contents, nraddr as usize, endian)
                                .wrapping_add(lval);
                            if val > addr && val < toaddr {
                                put_32(
                                    &mut sec.contents,
                                    nraddr as usize,
                                    endian,
                                    val - count - lval,
                                );
                            }
                        } else {
                            let val = lval.wrapping_add(r_addend as u32);
                            if val > addr && val < toaddr {
                                sec.relocs[r].addend -= count as i32;
                            }
                        }
                    }
                }
            }
            abi::R_SH_DIR8WPN => {
                let off = sign_extend(insn & 0xff, 8);
                stop = start + 4 + i64::from(off) * 2;
            }
            abi::R_SH_IND12W => {
                let off = insn & 0xfff;
                if off == 0 {
                    // Made by a previous relaxation; the final link
                    // resolves it against the external symbol.
                    start = i64::from(addr);
                    stop = start;
                } else {
                    let off = sign_extend(off, 12);
                    stop = start + 4 + i64::from(off) * 2;
                    // The addend tracks the section symbol, so adjust it
                    // when the target sits past the hole.
                    if stop > i64::from(addr) && stop < i64::from(toaddr) {
                        sec.relocs[r].addend -= count as i32;
                    }
                }
            }
            abi::R_SH_DIR8WPZ => {
                let off = insn & 0xff;
                stop = start + 4 + i64::from(off) * 2;
            }
            abi::R_SH_DIR8WPL => {
                let off = insn & 0xff;
                stop = (start & !3) + 4 + i64::from(off) * 4;
            }
            abi::R_SH_SWITCH8 | abi::R_SH_SWITCH16 | abi::R_SH_SWITCH32 => {
                // These represent `.word L2-L1`: the addend holds the
                // distance back to L1, the stored delta reaches L2. Both
                // the record and the in-place delta need repair.
                stop = i64::from(r_offset);
                start = stop - i64::from(r_addend);

                if start > i64::from(addr)
                    && start < i64::from(toaddr)
                    && (stop <= i64::from(addr) || stop >= i64::from(toaddr))
                {
                    sec.relocs[r].addend += count as i32;
                } else if stop > i64::from(addr)
                    && stop < i64::from(toaddr)
                    && (start <= i64::from(addr) || start >= i64::from(toaddr))
                {
                    sec.relocs[r].addend -= count as i32;
                }

                voff = match r_type {
                    abi::R_SH_SWITCH8 => i64::from(sec.contents[nraddr as usize]),
                    abi::R_SH_SWITCH16 => {
                        i64::from(get_16(&sec.contents, nraddr as usize, endian) as i16)
                    }
                    _ => i64::from(get_32(&sec.contents, nraddr as usize, endian) as i32),
                };
                stop = start + voff;
            }
            abi::R_SH_USES => {
                start = i64::from(r_offset);
                stop = start + i64::from(r_addend) + 4;
            }
            _ => {}
        }

        let adjust: i64 = if start > i64::from(addr)
            && start < i64::from(toaddr)
            && (stop <= i64::from(addr) || stop >= i64::from(toaddr))
        {
            i64::from(count)
        } else if stop > i64::from(addr)
            && stop < i64::from(toaddr)
            && (start <= i64::from(addr) || start >= i64::from(toaddr))
        {
            -i64::from(count)
        } else {
            0
        };

        if adjust != 0 {
            let oinsn = insn;
            let mut overflow = false;
            match r_type {
                abi::R_SH_DIR8WPN | abi::R_SH_DIR8WPZ => {
                    insn = insn.wrapping_add((adjust / 2) as u32);
                    if (oinsn & 0xff00) != (insn & 0xff00) {
                        overflow = true;
                    }
                    put_16(&mut sec.contents, nraddr as usize, endian, insn as u16);
                }
                abi::R_SH_IND12W => {
                    insn = insn.wrapping_add((adjust / 2) as u32);
                    if (oinsn & 0xf000) != (insn & 0xf000) {
                        overflow = true;
                    }
                    put_16(&mut sec.contents, nraddr as usize, endian, insn as u16);
                }
                abi::R_SH_DIR8WPL => {
                    // The offset is scaled by 4 and the pc is rounded
                    // down, so deletions smaller than 4 only matter when
                    // the site sat on a longword boundary.
                    debug_assert!(adjust == i64::from(count) || count >= 4);
                    if count >= 4 {
                        insn = insn.wrapping_add((adjust / 4) as u32);
                    } else if (r_offset & 3) == 0 {
                        insn += 1;
                    }
                    if (oinsn & 0xff00) != (insn & 0xff00) {
                        overflow = true;
                    }
                    put_16(&mut sec.contents, nraddr as usize, endian, insn as u16);
                }
                abi::R_SH_SWITCH8 => {
                    voff += adjust;
                    if !(0..0xff).contains(&voff) {
                        overflow = true;
                    }
                    sec.contents[nraddr as usize] = voff as u8;
                }
                abi::R_SH_SWITCH16 => {
                    voff += adjust;
                    if !(-0x8000..0x8000).contains(&voff) {
                        overflow = true;
                    }
                    put_16(&mut sec.contents, nraddr as usize, endian, voff as u16);
                }
                abi::R_SH_SWITCH32 => {
                    voff += adjust;
                    put_32(&mut sec.contents, nraddr as usize, endian, voff as u32);
                }
                abi::R_SH_USES => {
                    sec.relocs[r].addend += adjust as i32;
                }
                _ => {
                    return Err(Error::RelaxOverflow {
                        object: objects[obj_idx].name.clone(),
                        section: objects[obj_idx].sections[sec_idx].name.clone(),
                        offset: r_offset,
                    });
                }
            }

            if overflow {
                return Err(Error::RelaxOverflow {
                    object: objects[obj_idx].name.clone(),
                    section: objects[obj_idx].sections[sec_idx].name.clone(),
                    offset: r_offset,
                });
            }
        }

        objects[obj_idx].sections[sec_idx].relocs[r].offset = nraddr;
    }

    // Other sections may hold DIR32s (and dwarf line-number SWITCH32s)
    // against local symbols of the shrunk section.
    let nsections = objects[obj_idx].sections.len();
    for o in 0..nsections {
        if o == sec_idx {
            continue;
        }
        let nrelocs = objects[obj_idx].sections[o].relocs.len();
        for r in 0..nrelocs {
            let osec = &mut objects[obj_idx].sections[o];
            let rel = osec.relocs[r];

            if rel.r_type == abi::R_SH_SWITCH32 {
                let stop0 = i64::from(rel.offset);
                let start = stop0 - i64::from(rel.addend);

                // The stored delta reaches into the shrunk section; the
                // reloc site itself is elsewhere and never moves.
                if start > i64::from(addr) && start < i64::from(toaddr) {
                    osec.relocs[r].addend += count as i32;
                }

                let voff = i64::from(get_32(&osec.contents, rel.offset as usize, endian) as i32);
                let stop = start + voff;

                if start > i64::from(addr)
                    && start < i64::from(toaddr)
                    && (stop <= i64::from(addr) || stop >= i64::from(toaddr))
                {
                    put_32(
                        &mut osec.contents,
                        rel.offset as usize,
                        endian,
                        (voff + i64::from(count)) as u32,
                    );
                } else if stop > i64::from(addr)
                    && stop < i64::from(toaddr)
                    && (start <= i64::from(addr) || start >= i64::from(toaddr))
                {
                    put_32(
                        &mut osec.contents,
                        rel.offset as usize,
                        endian,
                        (voff - i64::from(count)) as u32,
                    );
                }
            }

            if rel.r_type != abi::R_SH_DIR32 {
                continue;
            }
            let SymbolRef::Local(l) = rel.symbol else {
                continue;
            };
            let (lsec, lval) = local_info[l];
            if lsec == Some(sec_idx) && (lval <= addr || lval >= toaddr) {
                let val = get_32(&osec.contents, rel.offset as usize, endian).wrapping_add(lval);
                if val > addr && val < toaddr {
                    put_32(
                        &mut osec.contents,
                        rel.offset as usize,
                        endian,
                        val - count - lval,
                    );
                }
            }
        }
    }

    // Adjust the local symbols defined in this section.
    for local in objects[obj_idx].locals.iter_mut() {
        if local.section == Some(sec_idx) && local.value > addr && local.value < toaddr {
            local.value -= count;
        }
    }

    // Now the global symbols.
    for global in globals.iter_mut() {
        if let SymbolDef::Defined {
            object,
            section,
            value,
        } = &mut global.def
        {
            if *object == obj_idx && *section == sec_idx && *value > addr && *value < toaddr {
                *value -= count;
            }
        }
    }

    // See if the bounding ALIGN marker can move forward; its offset was
    // adjusted above.
    if let Some(k) = align_idx {
        let (power, new_offset) = {
            let rel = &objects[obj_idx].sections[sec_idx].relocs[k];
            (rel.addend as u32, rel.offset)
        };
        let mask = (1u32 << power) - 1;
        let alignto = (toaddr + mask) & !mask;
        let alignaddr = (new_offset + mask) & !mask;
        if alignto != alignaddr {
            // Tail recursion.
            return delete_bytes(
                objects,
                obj_idx,
                sec_idx,
                globals,
                alignaddr,
                alignto - alignaddr,
                cfg,
            );
        }
    }

    Ok(())
}

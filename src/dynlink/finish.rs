//! Dynamic section finalization.
//!
//! Runs once, after every section has been relocated and all output
//! addresses are final: fills each PLT entry from its template, writes
//! the reserved `.got.plt` words and PLT0, patches the dynamic tags that
//! depend on final addresses, appends the `.rofixup` terminator, and
//! asserts that every byte of reserved relocation space was spent —
//! a mismatch means the allocator and the resolver disagreed, which is
//! a linker bug, not an input error.

use super::plt::{self, NO_FIELD};
use super::{DynSections, GotKind, Rela, RELA_SIZE, SymbolState, symbol_references_local, will_finish_dynamic};
use crate::abi;
use crate::linker::LinkConfig;
use crate::object::{GlobalSymbol, InputObject, SymbolDef};
use crate::reloc::patch::{install_movi20_field, install_plt_field, put_16, put_32};
use crate::{Error, Result};
use elf::abi::{DT_JMPREL, DT_PLTGOT, DT_PLTRELSZ, STV_DEFAULT};

/// Fill in the PLT entry, `.got.plt` words and dynamic relocation
/// records for one symbol.
pub fn finish_symbol(
    cfg: &LinkConfig,
    objects: &[InputObject],
    globals: &[GlobalSymbol],
    states: &[SymbolState],
    dynsec: &mut DynSections,
    desc: &'static plt::PltDescriptor,
    id: usize,
) -> Result<()> {
    let endian = cfg.endian;
    let pic = cfg.is_pic();
    let fdpic = cfg.is_fdpic();
    let h = &globals[id];
    let state = &states[id];

    if let Some(plt_offset) = state.plt.offset() {
        let dynindx = h.dynindx.expect("PLT entry for a non-dynamic symbol");
        let plt_index = plt::plt_index_for_offset(desc, plt_offset);
        let entry = plt::entry_descriptor(desc, plt_offset);

        // The .got.plt word backing this entry: FDPIC descriptors are
        // addressed backwards from the _GLOBAL_OFFSET_TABLE_ anchor at
        // the section's end.
        let got_offset: i32 = if fdpic {
            (plt_index * 8) as i32 + 12 - dynsec.gotplt.size() as i32
        } else {
            ((plt_index + 3) * 4) as i32
        };

        let start = plt_offset as usize;
        dynsec.plt.bytes[start..start + entry.symbol_entry.len()]
            .copy_from_slice(entry.symbol_entry);

        if pic || fdpic {
            let field = start + entry.symbol_fields.got_entry as usize;
            if entry.symbol_fields.got20 {
                let status =
                    install_movi20_field(&mut dynsec.plt.bytes, field, endian, got_offset as u32);
                if !status.is_ok() {
                    return Err(crate::error::reloc_error(
                        &globals[id].name,
                        ".plt",
                        plt_offset,
                        "movi20 PLT field overflow",
                    ));
                }
            } else {
                install_plt_field(&mut dynsec.plt.bytes, field, endian, got_offset as u32);
            }
        } else {
            let field = start + entry.symbol_fields.got_entry as usize;
            install_plt_field(
                &mut dynsec.plt.bytes,
                field,
                endian,
                dynsec.gotplt.vma.wrapping_add_signed(got_offset),
            );

            if cfg.is_vxworks() {
                // Entries branch back to the resolver in PLT0; distant
                // ones hop through the previous group's trampoline.
                let reachable_plts = (4096
                    - desc.plt0_size()
                    - (entry.symbol_fields.plt + 4))
                    / entry.entry_size()
                    + 1;
                let plts_per_4k = 4096 / entry.entry_size();
                let distance: i32 = if plt_index < reachable_plts {
                    -((plt_offset + entry.symbol_fields.plt) as i32)
                } else {
                    -((((plt_index - reachable_plts) % plts_per_4k + 1) * entry.entry_size())
                        as i32)
                };
                let insn = abi::BRA_OPCODE | (0x0fff & ((distance - 4) / 2) as u16);
                put_16(
                    &mut dynsec.plt.bytes,
                    start + entry.symbol_fields.plt as usize,
                    endian,
                    insn,
                );
            } else if entry.symbol_fields.plt != NO_FIELD {
                install_plt_field(
                    &mut dynsec.plt.bytes,
                    start + entry.symbol_fields.plt as usize,
                    endian,
                    dynsec.plt.vma,
                );
            }
        }

        // From here on the offset is relative to .got.plt's start.
        let got_offset: u32 = if fdpic {
            plt_index * 8
        } else {
            got_offset as u32
        };

        if entry.symbol_fields.reloc_offset != NO_FIELD {
            install_plt_field(
                &mut dynsec.plt.bytes,
                start + entry.symbol_fields.reloc_offset as usize,
                endian,
                plt_index * RELA_SIZE,
            );
        }

        // Point the .got.plt slot at the lazy resolver stub.
        put_32(
            &mut dynsec.gotplt.bytes,
            got_offset as usize,
            endian,
            dynsec.plt.vma + plt_offset + entry.symbol_resolve_offset,
        );
        if fdpic {
            let seg = dynsec.plt.segment.map(|s| s as u32).unwrap_or(0);
            put_32(
                &mut dynsec.gotplt.bytes,
                got_offset as usize + 4,
                endian,
                seg,
            );
        }

        dynsec.rela_plt.push(Rela {
            offset: dynsec.gotplt.vma + got_offset,
            sym: dynindx,
            r_type: if fdpic {
                abi::R_SH_FUNCDESC_VALUE
            } else {
                abi::R_SH_JMP_SLOT
            },
            addend: 0,
        });

        if cfg.is_vxworks() && !pic {
            // The static loader rebases the PLT's pointer to the
            // .got.plt slot, and the slot's pointer back into .plt.
            dynsec.rela_plt_unloaded.push(Rela {
                offset: dynsec.plt.vma + plt_offset + entry.symbol_fields.got_entry,
                sym: 0,
                r_type: abi::R_SH_DIR32,
                addend: got_offset as i32,
            });
            dynsec.rela_plt_unloaded.push(Rela {
                offset: dynsec.gotplt.vma + got_offset,
                sym: 0,
                r_type: abi::R_SH_DIR32,
                addend: 0,
            });
        }
    }

    // The ordinary GOT entry; TLS and descriptor kinds were fully
    // handled during resolution.
    if let Some(got_offset) = state.got.offset() {
        if state.got_kind == GotKind::Normal
            && cfg.dynamic_sections()
            && (h.visibility == STV_DEFAULT || !h.is_undefweak())
            && (pic || will_finish_dynamic(h, true, false))
        {
            let slot_vma = dynsec.got.vma + got_offset;
            let defined_locally = matches!(h.def, SymbolDef::Defined { .. })
                && symbol_references_local(cfg, h);

            let rela = if pic && defined_locally {
                // The word already holds the link-time value; the
                // loader only rebases it.
                let SymbolDef::Defined {
                    object,
                    section,
                    value,
                } = h.def
                else {
                    unreachable!()
                };
                let tsec = &objects[object].sections[section];
                if fdpic {
                    Rela {
                        offset: slot_vma,
                        sym: tsec.dynindx.unwrap_or(0),
                        r_type: abi::R_SH_DIR32,
                        addend: value as i32,
                    }
                } else {
                    Rela {
                        offset: slot_vma,
                        sym: 0,
                        r_type: abi::R_SH_RELATIVE,
                        addend: (tsec.vma + value) as i32,
                    }
                }
            } else {
                put_32(&mut dynsec.got.bytes, got_offset as usize, endian, 0);
                Rela {
                    offset: slot_vma,
                    sym: h.dynindx.expect("GLOB_DAT for a non-dynamic symbol"),
                    r_type: abi::R_SH_GLOB_DAT,
                    addend: 0,
                }
            };
            dynsec.rela_got.push(rela);
        }
    }

    if h.needs_copy {
        let SymbolDef::DynBss { offset } = h.def else {
            return Err(Error::AccountingMismatch {
                section: ".rela.bss",
                reserved: dynsec.rela_bss.reserved as usize,
                emitted: dynsec.rela_bss.entries.len(),
            });
        };
        dynsec.rela_bss.push(Rela {
            offset: dynsec.dynbss.vma + offset,
            sym: h.dynindx.expect("copy relocation for a non-dynamic symbol"),
            r_type: abi::R_SH_COPY,
            addend: 0,
        });
    }

    Ok(())
}

/// Patch PLT0, the reserved `.got.plt` words and the address-dependent
/// dynamic tags, then verify the allocation ledger.
pub fn finish_sections(
    cfg: &LinkConfig,
    dynsec: &mut DynSections,
    desc: &'static plt::PltDescriptor,
    dynamic_tags: &mut [(i64, u32)],
) -> Result<()> {
    let endian = cfg.endian;

    if cfg.dynamic_sections() {
        for (tag, value) in dynamic_tags.iter_mut() {
            match *tag {
                DT_PLTGOT => *value = dynsec.got_anchor_vma(),
                DT_JMPREL => *value = dynsec.rela_plt.vma,
                DT_PLTRELSZ => *value = dynsec.rela_plt.size(),
                _ => {}
            }
        }

        // PLT0.
        if dynsec.plt.size() > 0 && !desc.plt0_entry.is_empty() {
            dynsec.plt.bytes[..desc.plt0_entry.len()].copy_from_slice(desc.plt0_entry);
            for (i, field) in desc.plt0_got_fields.iter().enumerate() {
                if *field != NO_FIELD {
                    install_plt_field(
                        &mut dynsec.plt.bytes,
                        *field as usize,
                        endian,
                        dynsec.gotplt.vma + (i as u32) * 4,
                    );
                }
            }

            if cfg.is_vxworks() && !cfg.is_pic() {
                // PLT0's pointer to _GLOBAL_OFFSET_TABLE_ + 8, applied
                // by the static loader; it precedes the per-entry pairs.
                dynsec.rela_plt_unloaded.entries.insert(
                    0,
                    Rela {
                        offset: dynsec.plt.vma + desc.plt0_got_fields[2],
                        sym: 0,
                        r_type: abi::R_SH_DIR32,
                        addend: 8,
                    },
                );
            }
        }
    }

    // The reserved header of a non-FDPIC .got.plt: the address of
    // .dynamic, then two words for the loader.
    if !cfg.is_fdpic() && dynsec.gotplt.size() > 0 {
        put_32(&mut dynsec.gotplt.bytes, 0, endian, dynsec.dynamic_vma);
        put_32(&mut dynsec.gotplt.bytes, 4, endian, 0);
        put_32(&mut dynsec.gotplt.bytes, 8, endian, 0);
    }

    // The .rofixup terminator: a pointer to the GOT itself, so the
    // static loader can find it without a symbol table.
    if cfg.is_fdpic() {
        let anchor = dynsec.got_anchor_vma();
        dynsec.rofixup.push(anchor);
        dynsec.rofixup.check()?;
    }

    dynsec.rela_got.check(".rela.got")?;
    dynsec.rela_funcdesc.check(".rela.got.funcdesc")?;
    dynsec.rela_plt.check(".rela.plt")?;
    dynsec.rela_bss.check(".rela.bss")?;
    dynsec.rela_plt_unloaded.check(".rela.plt.unloaded")?;
    for buf in dynsec.section_rela.values() {
        buf.check(".rela(section)")?;
    }

    #[cfg(feature = "log")]
    log::info!(
        "dynamic sections finalized: {} plt entries, {} got relocations, {} fixups",
        if desc.entry_size() > 0 && dynsec.plt.size() > desc.plt0_size() {
            (dynsec.plt.size() - desc.plt0_size()) / desc.entry_size()
        } else {
            0
        },
        dynsec.rela_got.entries.len(),
        dynsec.rofixup.entries.len(),
    );

    Ok(())
}

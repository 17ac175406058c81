//! The per-section relocation resolver.
//!
//! For every relocation in an input section this computes the final
//! value, runs the PLT/GOT/TLS/function-descriptor logic against the
//! state the allocation passes built, emits dynamic relocations or
//! read-only fixups where load-time work remains, and funnels every
//! plain field insertion through the instruction patcher. Each branch
//! produces an explicit outcome — either "patch this value" or "fully
//! handled" — so the apply step exists exactly once.

use crate::abi::{self, Endian};
use crate::dynlink::{
    DynSections, GotKind, LocalState, Rela, SymbolState, symbol_calls_local,
    symbol_funcdesc_local, symbol_references_local,
};
use crate::dynlink::plt::{PltDescriptor, plt_index_for_offset};
use crate::error::reloc_error;
use crate::linker::{LinkConfig, OutputFlags, UnresolvedPolicy};
use crate::object::{GlobalSymbol, InputObject, RelocEntry, Segment, SymbolDef, SymbolRef};
use crate::reloc::descriptor::{RelocDescriptor, lookup};
use crate::reloc::loops::{self, LoopPair};
use crate::reloc::patch::{self, PatchStatus, install_movi20_field, put_32};
use crate::reloc::tls::{self, TlsTransition};
use crate::{Error, Result};
use elf::abi::STV_DEFAULT;
use hashbrown::HashMap;

/// Everything the resolver reads and writes, short of the section
/// contents being relocated (those are handed in separately so the rest
/// of the object tree stays readable for symbol lookups).
pub struct ResolveContext<'a> {
    pub cfg: &'a LinkConfig,
    pub objects: &'a [InputObject],
    pub globals: &'a [GlobalSymbol],
    pub states: &'a mut [SymbolState],
    pub locals: &'a mut [LocalState],
    pub dynsec: &'a mut DynSections,
    pub segments: &'a [Segment],
    pub output_flags: &'a mut OutputFlags,
    pub plt_desc: &'static PltDescriptor,
}

/// A resolved relocation target.
struct Resolved {
    value: u32,
    global: Option<usize>,
    /// Defining (object, section) when the target lives in an input.
    target: Option<(usize, usize)>,
    resolved_to_zero: bool,
}

enum Outcome {
    /// Feed `value`/`addend` to the shared descriptor apply step.
    Patch { value: u32, addend: i32 },
    /// The branch finished the job (or emitted records instead).
    Done,
}

impl ResolveContext<'_> {
    fn segment_of_vma(&self, vma: u32) -> Option<usize> {
        self.segments
            .iter()
            .position(|s| vma >= s.start && vma < s.end)
    }

    fn segment_writable(&self, seg: Option<usize>) -> bool {
        seg.map(|s| self.segments[s].is_writable()).unwrap_or(true)
    }

    fn resolve(&self, obj_idx: usize, rel: &RelocEntry) -> Resolved {
        match rel.symbol {
            SymbolRef::Local(l) => {
                let local = &self.objects[obj_idx].locals[l];
                match local.section {
                    Some(s) => Resolved {
                        value: self.objects[obj_idx].sections[s].vma + local.value,
                        global: None,
                        target: Some((obj_idx, s)),
                        resolved_to_zero: false,
                    },
                    None => Resolved {
                        value: local.value,
                        global: None,
                        target: None,
                        resolved_to_zero: false,
                    },
                }
            }
            SymbolRef::Global(g) => {
                let h = &self.globals[g];
                let (value, target) = match h.def {
                    SymbolDef::Defined {
                        object,
                        section,
                        value,
                    } => (
                        self.objects[object].sections[section].vma + value,
                        Some((object, section)),
                    ),
                    SymbolDef::PltStub { offset } => (self.dynsec.plt.vma + offset, None),
                    SymbolDef::DynBss { offset } => (self.dynsec.dynbss.vma + offset, None),
                    SymbolDef::Dynamic | SymbolDef::Undefined => (0, None),
                };
                Resolved {
                    value,
                    global: Some(g),
                    target,
                    resolved_to_zero: h.resolves_to_zero(),
                }
            }
        }
    }

    fn got_slot_mut(&mut self, obj_idx: usize, symbol: SymbolRef) -> &mut crate::dynlink::Slot {
        match symbol {
            SymbolRef::Global(g) => &mut self.states[g].got,
            SymbolRef::Local(l) => &mut self.locals[obj_idx].got[l],
        }
    }

    fn got_kind(&self, obj_idx: usize, symbol: SymbolRef) -> GotKind {
        match symbol {
            SymbolRef::Global(g) => self.states[g].got_kind,
            SymbolRef::Local(l) => self.locals[obj_idx].got_kind[l],
        }
    }

    fn funcdesc_slot_mut(&mut self, obj_idx: usize, symbol: SymbolRef) -> &mut crate::dynlink::Slot {
        match symbol {
            SymbolRef::Global(g) => &mut self.states[g].funcdesc,
            SymbolRef::Local(l) => &mut self.locals[obj_idx].funcdesc[l],
        }
    }

    fn symbol_name(&self, obj_idx: usize, symbol: SymbolRef) -> &str {
        match symbol {
            SymbolRef::Global(g) => &self.globals[g].name,
            SymbolRef::Local(l) => &self.objects[obj_idx].locals[l].name,
        }
    }

    /// Write the two words of a function descriptor and whatever
    /// load-time record its placement demands. Called at most once per
    /// descriptor.
    fn initialize_funcdesc(
        &mut self,
        obj_idx: usize,
        symbol: SymbolRef,
        desc_off: u32,
    ) -> Result<()> {
        let endian = self.cfg.endian;
        let pic = self.cfg.is_pic();

        let (local_call, target, value, dynindx, undefweak) = match symbol {
            SymbolRef::Global(g) => {
                let h = &self.globals[g];
                let local = symbol_calls_local(self.cfg, h);
                if local {
                    match h.def {
                        SymbolDef::Defined {
                            object,
                            section,
                            value,
                        } => (true, Some((object, section)), value, None, h.is_undefweak()),
                        _ => (true, None, 0, None, h.is_undefweak()),
                    }
                } else {
                    (false, None, 0, h.dynindx, h.is_undefweak())
                }
            }
            SymbolRef::Local(l) => {
                let local = &self.objects[obj_idx].locals[l];
                (true, local.section.map(|s| (obj_idx, s)), local.value, None, false)
            }
        };

        let (mut addr, mut seg, record_dynindx) = if local_call {
            let seg = target
                .and_then(|(o, s)| self.objects[o].sections[s].segment)
                .map(|s| s as u32)
                .unwrap_or(0);
            let section_dynindx = target
                .and_then(|(o, s)| self.objects[o].sections[s].dynindx)
                .unwrap_or(0);
            (value, seg, section_dynindx)
        } else {
            (0, 0, dynindx.unwrap_or(0))
        };

        let desc_vma = self.dynsec.funcdesc.vma + desc_off;
        if !pic && local_call {
            if !undefweak {
                self.dynsec.rofixup.push(desc_vma);
                self.dynsec.rofixup.push(desc_vma + 4);
            }
            // No load-time records, so store the final address and the
            // GOT pointer the calling convention expects in r12.
            if let Some((o, s)) = target {
                addr = addr.wrapping_add(self.objects[o].sections[s].vma);
            }
            seg = self.dynsec.got_anchor_vma();
        } else {
            self.dynsec.rela_funcdesc.push(Rela {
                offset: desc_vma,
                sym: record_dynindx,
                r_type: abi::R_SH_FUNCDESC_VALUE,
                addend: 0,
            });
        }

        put_32(&mut self.dynsec.funcdesc.bytes, desc_off as usize, endian, addr);
        put_32(
            &mut self.dynsec.funcdesc.bytes,
            desc_off as usize + 4,
            endian,
            seg,
        );
        Ok(())
    }
}

/// Relocate one input section. `contents` is the section's byte buffer,
/// detached from the object tree for the duration of the pass.
pub fn relocate_section(
    ctx: &mut ResolveContext<'_>,
    obj_idx: usize,
    sec_idx: usize,
    contents: &mut [u8],
) -> Result<()> {
    let endian = ctx.cfg.endian;
    let variant = ctx.cfg.table_variant();
    let pic = ctx.cfg.is_pic();
    let fdpic = ctx.cfg.is_fdpic();
    let dyn_created = ctx.cfg.dynamic_sections();
    let sec_vma = ctx.objects[obj_idx].sections[sec_idx].vma;
    let sec_alloc = ctx.objects[obj_idx].sections[sec_idx].is_alloc();
    let obj_name = ctx.objects[obj_idx].name.clone();
    let sec_name = ctx.objects[obj_idx].sections[sec_idx].name.clone();

    let isec_segment = ctx.objects[obj_idx].sections[sec_idx].segment;
    let got_segment = ctx.dynsec.got.segment;
    let plt_segment = ctx.dynsec.plt.segment;

    // Zero-overhead loop relocations need both ends before either can
    // be patched; pair them up front.
    let (loop_pairs, loop_orphan) =
        loops::pair_loop_relocs(&ctx.objects[obj_idx].sections[sec_idx].relocs);
    if let Some(orphan) = loop_orphan {
        let rel = ctx.objects[obj_idx].sections[sec_idx].relocs[orphan];
        return Err(reloc_error(
            &obj_name,
            &sec_name,
            rel.offset,
            "unpaired zero-overhead loop relocation",
        ));
    }
    let loop_ends: HashMap<usize, LoopPair> =
        loop_pairs.iter().map(|p| (p.end, *p)).collect();
    let mut loop_starts: HashMap<usize, u32> = HashMap::new();

    let nrelocs = ctx.objects[obj_idx].sections[sec_idx].relocs.len();
    for r in 0..nrelocs {
        let rel = ctx.objects[obj_idx].sections[sec_idx].relocs[r];
        let r_type = rel.r_type;

        if r_type == abi::R_SH_NONE || abi::is_marker_reloc(r_type) {
            continue;
        }
        let Some(howto) = lookup(r_type, variant) else {
            return Err(Error::BadRelocType {
                object: obj_name.clone(),
                r_type,
            });
        };

        // Relocs that are not partial-inplace carry their addend in the
        // record.
        let mut addend: i32 = if howto.partial_inplace { 0 } else { rel.addend };

        let resolved = ctx.resolve(obj_idx, &rel);
        let relocation = resolved.value;
        let h = resolved.global;

        // A reference into a discarded section is zeroed out and the
        // link carries on.
        if let Some((o, s)) = resolved.target {
            if ctx.objects[o].sections[s].discarded {
                zero_field(howto, contents, rel.offset as usize);
                continue;
            }
        }

        // Genuinely undefined symbols go through the caller's policy.
        if let Some(g) = h {
            let sym = &ctx.globals[g];
            if sym.is_undefined() && !sym.weak && !sym.def_dynamic {
                match ctx.cfg.unresolved {
                    UnresolvedPolicy::Ignore => {}
                    UnresolvedPolicy::Warn => {
                        #[cfg(feature = "log")]
                        log::warn!("{}: undefined reference to `{}'", obj_name, sym.name);
                    }
                    UnresolvedPolicy::Error => {
                        return Err(Error::Undefined {
                            object: obj_name.clone(),
                            symbol: sym.name.clone(),
                        });
                    }
                }
            }
        }

        // Inter-segment consistency for FDPIC outputs: most relocations
        // connect the site to the target symbol.
        let mut check_segment: (Option<usize>, Option<usize>) = (
            isec_segment,
            resolved
                .target
                .and_then(|(o, s)| ctx.objects[o].sections[s].segment),
        );

        let outcome: Outcome = match r_type {
            // The branch field and the record addend are both live: the
            // assembler encodes in-range displacements in place, while
            // relaxation folds the deleted literal into the addend.
            abi::R_SH_IND12W => Outcome::Patch {
                value: relocation,
                addend: rel.addend,
            },

            abi::R_SH_DIR8WPN | abi::R_SH_DIR8WPZ | abi::R_SH_DIR8WPL => {
                // Against the start of this section the assembler has
                // already encoded the branch; the reloc only assists
                // relaxation. Otherwise it targets an external symbol
                // and is resolved here.
                if sec_vma == relocation {
                    Outcome::Done
                } else {
                    let disp = relocation
                        .wrapping_sub(sec_vma)
                        .wrapping_sub(rel.offset);
                    let mask = if r_type == abi::R_SH_DIR8WPL { 3 } else { 1 };
                    if disp & mask != 0 {
                        return Err(reloc_error(
                            &obj_name,
                            &sec_name,
                            rel.offset,
                            "unaligned branch target for relax-support relocation",
                        ));
                    }
                    Outcome::Patch {
                        value: relocation.wrapping_sub(4),
                        addend,
                    }
                }
            }

            abi::R_SH_DIR16 | abi::R_SH_DIR8 | abi::R_SH_DIR8U | abi::R_SH_DIR8S
            | abi::R_SH_DIR4U => Outcome::Patch {
                value: relocation,
                addend,
            },

            abi::R_SH_DIR8UL | abi::R_SH_DIR4UL => {
                if relocation & 3 != 0 {
                    return Err(unaligned(&obj_name, &sec_name, rel.offset, howto, relocation));
                }
                Outcome::Patch {
                    value: relocation,
                    addend,
                }
            }

            abi::R_SH_DIR8UW | abi::R_SH_DIR8SW | abi::R_SH_DIR4UW => {
                if relocation & 1 != 0 {
                    return Err(unaligned(&obj_name, &sec_name, rel.offset, howto, relocation));
                }
                Outcome::Patch {
                    value: relocation,
                    addend,
                }
            }

            abi::R_SH_PSHA => {
                if !(-32..=32).contains(&(relocation as i32)) {
                    return Err(reloc_error(
                        &obj_name,
                        &sec_name,
                        rel.offset,
                        "R_SH_PSHA relocation not in range -32..32",
                    ));
                }
                Outcome::Patch {
                    value: relocation,
                    addend,
                }
            }
            abi::R_SH_PSHL => {
                if !(-16..=16).contains(&(relocation as i32)) {
                    return Err(reloc_error(
                        &obj_name,
                        &sec_name,
                        rel.offset,
                        "R_SH_PSHL relocation not in range -16..16",
                    ));
                }
                Outcome::Patch {
                    value: relocation,
                    addend,
                }
            }

            abi::R_SH_DIR32 | abi::R_SH_REL32 => {
                let symbol_visible = match h {
                    None => true,
                    Some(g) => {
                        let sym = &ctx.globals[g];
                        (sym.visibility == STV_DEFAULT && !resolved.resolved_to_zero)
                            || !sym.is_undefweak()
                    }
                };
                let copy_into_output = pic
                    && symbol_visible
                    && sec_alloc
                    && (r_type == abi::R_SH_DIR32
                        || h.map_or(true, |g| !symbol_calls_local(ctx.cfg, &ctx.globals[g])));

                if copy_into_output {
                    // These are resolved at run time; copy them out.
                    let out_offset = sec_vma + rel.offset;
                    let inplace = if howto.partial_inplace {
                        patch::get_32(contents, rel.offset as usize, endian) as i32
                    } else {
                        addend
                    };
                    let mut relocate_in_place = false;

                    let outrel = if r_type == abi::R_SH_REL32 {
                        let g = h.expect("pc-relative dynamic reloc needs a symbol");
                        let dynindx = ctx.globals[g]
                            .dynindx
                            .expect("dynamic symbol without an index");
                        Rela {
                            offset: out_offset,
                            sym: dynindx,
                            r_type: abi::R_SH_REL32,
                            addend: inplace,
                        }
                    } else if fdpic
                        && h.map_or(true, |g| {
                            let sym = &ctx.globals[g];
                            (ctx.cfg.symbolic || sym.dynindx.is_none()) && sym.def_regular
                        })
                    {
                        // Segments relocate independently, so locally
                        // resolved words still need section-relative
                        // load-time treatment.
                        let (o, s) = resolved
                            .target
                            .expect("fdpic section-relative reloc without a target");
                        let tsec = &ctx.objects[o].sections[s];
                        Rela {
                            offset: out_offset,
                            sym: tsec.dynindx.unwrap_or(0),
                            r_type: abi::R_SH_DIR32,
                            addend: (relocation as i32)
                                .wrapping_add(inplace)
                                .wrapping_sub(tsec.vma as i32),
                        }
                    } else if h.map_or(true, |g| {
                        let sym = &ctx.globals[g];
                        (ctx.cfg.symbolic || sym.dynindx.is_none()) && sym.def_regular
                    }) {
                        relocate_in_place = howto.partial_inplace;
                        Rela {
                            offset: out_offset,
                            sym: 0,
                            r_type: abi::R_SH_RELATIVE,
                            addend: (relocation as i32).wrapping_add(inplace),
                        }
                    } else {
                        let g = h.expect("dynamic DIR32 needs a symbol");
                        let dynindx = ctx.globals[g]
                            .dynindx
                            .expect("dynamic symbol without an index");
                        Rela {
                            offset: out_offset,
                            sym: dynindx,
                            r_type: abi::R_SH_DIR32,
                            addend: (relocation as i32).wrapping_add(inplace),
                        }
                    };
                    ctx.dynsec.section_rela_mut(obj_idx, sec_idx).push(outrel);
                    check_segment = (None, None);

                    if relocate_in_place {
                        Outcome::Patch {
                            value: relocation,
                            addend,
                        }
                    } else {
                        // Leave the addend alone for the loader.
                        Outcome::Done
                    }
                } else if fdpic && !pic && r_type == abi::R_SH_DIR32 && sec_alloc {
                    if !ctx.segment_writable(isec_segment) {
                        return Err(Error::ReadOnlyFixup {
                            object: obj_name.clone(),
                            section: sec_name.clone(),
                            offset: rel.offset,
                            symbol: ctx.symbol_name(obj_idx, rel.symbol).into(),
                        });
                    }
                    ctx.dynsec.rofixup.push(sec_vma + rel.offset);
                    check_segment = (None, None);
                    Outcome::Patch {
                        value: relocation,
                        addend,
                    }
                } else {
                    // Pointer comparisons against undefined weaks are
                    // guarded anyway; no segment complaint for them.
                    if r_type == abi::R_SH_REL32
                        && h.map_or(false, |g| ctx.globals[g].is_undefweak())
                    {
                        check_segment = (None, None);
                    }
                    Outcome::Patch {
                        value: relocation,
                        addend,
                    }
                }
            }

            abi::R_SH_GOTPLT32 => {
                let use_gotplt = h.is_some_and(|g| {
                    let sym = &ctx.globals[g];
                    !sym.forced_local
                        && pic
                        && !ctx.cfg.symbolic
                        && sym.dynindx.is_some()
                        && ctx.states[g].plt.is_allocated()
                        && !ctx.states[g].got.is_allocated()
                });
                if use_gotplt {
                    let g = h.unwrap();
                    let plt_offset = ctx.states[g].plt.offset().unwrap();
                    let index = plt_index_for_offset(ctx.plt_desc, plt_offset);
                    check_segment = (None, None);
                    let value = ctx
                        .dynsec
                        .gotplt
                        .vma
                        .wrapping_add((index + 3) * 4)
                        .wrapping_sub(ctx.dynsec.got_anchor_vma());
                    Outcome::Patch { value, addend }
                } else {
                    got_entry(
                        ctx,
                        obj_idx,
                        &rel,
                        relocation,
                        addend,
                        &mut check_segment,
                        contents,
                        r_type,
                        &obj_name,
                        &sec_name,
                    )?
                }
            }

            abi::R_SH_GOT32 | abi::R_SH_GOT20 => got_entry(
                ctx,
                obj_idx,
                &rel,
                relocation,
                addend,
                &mut check_segment,
                contents,
                r_type,
                &obj_name,
                &sec_name,
            )?,

            abi::R_SH_GOTOFF | abi::R_SH_GOTOFF20 => {
                // Relative to _GLOBAL_OFFSET_TABLE_, which sits at the
                // start of .got.plt (or before the FDPIC reserved words).
                check_segment = (got_segment, check_segment.1);
                let value = relocation.wrapping_sub(ctx.dynsec.got_anchor_vma());
                addend = rel.addend;
                if r_type == abi::R_SH_GOTOFF20 {
                    movi20(
                        contents,
                        rel.offset,
                        endian,
                        value.wrapping_add(addend as u32),
                        &obj_name,
                        &sec_name,
                    )?;
                    Outcome::Done
                } else {
                    Outcome::Patch { value, addend }
                }
            }

            abi::R_SH_GOTPC => {
                addend = rel.addend;
                Outcome::Patch {
                    value: ctx.dynsec.gotplt.vma,
                    addend,
                }
            }

            abi::R_SH_PLT32 => {
                match h {
                    None => Outcome::Patch {
                        value: relocation,
                        addend,
                    },
                    Some(g) => {
                        if ctx.globals[g].is_undefweak() {
                            check_segment = (None, None);
                        }
                        match ctx.states[g].plt.offset() {
                            // Statically linked PIC, forced-local or
                            // -Bsymbolic: call the function directly.
                            None => Outcome::Patch {
                                value: relocation,
                                addend,
                            },
                            Some(plt_offset) if ctx.globals[g].forced_local => {
                                let _ = plt_offset;
                                Outcome::Patch {
                                    value: relocation,
                                    addend,
                                }
                            }
                            Some(plt_offset) => {
                                check_segment.1 = plt_segment;
                                addend = rel.addend;
                                Outcome::Patch {
                                    value: ctx.dynsec.plt.vma + plt_offset,
                                    addend,
                                }
                            }
                        }
                    }
                }
            }

            abi::R_SH_FUNCDESC | abi::R_SH_GOTFUNCDESC | abi::R_SH_GOTFUNCDESC20 => funcdesc_entry(
                ctx,
                obj_idx,
                sec_idx,
                &rel,
                &resolved,
                &mut check_segment,
                contents,
                r_type,
                sec_vma,
                &obj_name,
                &sec_name,
            )?,

            abi::R_SH_GOTOFFFUNCDESC | abi::R_SH_GOTOFFFUNCDESC20 => {
                check_segment = (None, None);
                addend = rel.addend;
                if h.is_some_and(|g| {
                    ctx.globals[g].is_undefweak()
                        || !symbol_funcdesc_local(ctx.cfg, &ctx.globals[g])
                }) {
                    return Err(reloc_error(
                        &obj_name,
                        &sec_name,
                        rel.offset,
                        "GOT-relative descriptor relocation against external symbol",
                    ));
                }
                let desc_off = ensure_funcdesc(ctx, obj_idx, rel.symbol)?;
                let value = ctx
                    .dynsec
                    .funcdesc
                    .vma
                    .wrapping_add(desc_off)
                    .wrapping_sub(ctx.dynsec.got_anchor_vma());
                if r_type == abi::R_SH_GOTOFFFUNCDESC20 {
                    movi20(
                        contents,
                        rel.offset,
                        endian,
                        value.wrapping_add(addend as u32),
                        &obj_name,
                        &sec_name,
                    )?;
                    Outcome::Done
                } else {
                    Outcome::Patch { value, addend }
                }
            }

            abi::R_SH_LOOP_START => {
                let (o, s) = resolved.target.unwrap_or((obj_idx, sec_idx));
                let start = relocation
                    .wrapping_add(rel.addend as u32)
                    .wrapping_sub(ctx.objects[o].sections[s].vma);
                loop_starts.insert(rel.offset as usize, start);
                Outcome::Done
            }
            abi::R_SH_LOOP_END => {
                let pair = loop_ends
                    .get(&r)
                    .copied()
                    .ok_or_else(|| {
                        reloc_error(
                            &obj_name,
                            &sec_name,
                            rel.offset,
                            "unpaired zero-overhead loop relocation",
                        )
                    })?;
                let start_rel = ctx.objects[obj_idx].sections[sec_idx].relocs[pair.start];
                let start = *loop_starts.get(&(start_rel.offset as usize)).ok_or_else(|| {
                    reloc_error(
                        &obj_name,
                        &sec_name,
                        rel.offset,
                        "zero-overhead loop end precedes its start",
                    )
                })?;
                let (o, s) = resolved.target.unwrap_or((obj_idx, sec_idx));
                let end = relocation
                    .wrapping_add(rel.addend as u32)
                    .wrapping_sub(ctx.objects[o].sections[s].vma);
                let bias = i64::from(ctx.objects[o].sections[s].vma) - i64::from(sec_vma);
                let status =
                    loops::apply_loop(contents, rel.offset, start, end, bias, endian);
                patch_status(status, &obj_name, &sec_name, rel.offset, howto)?;
                Outcome::Done
            }

            abi::R_SH_TLS_GD_32 | abi::R_SH_TLS_IE_32 => {
                check_segment = (None, None);
                tls_got_entry(
                    ctx,
                    obj_idx,
                    &rel,
                    relocation,
                    contents,
                    r_type,
                    dyn_created,
                    &obj_name,
                    &sec_name,
                )?
            }

            abi::R_SH_TLS_LD_32 => {
                check_segment = (None, None);
                if !pic {
                    tls::rewrite_sequence(
                        TlsTransition::LdToLe,
                        contents,
                        rel.offset,
                        endian,
                        &obj_name,
                        &sec_name,
                    )?;
                    Outcome::Done
                } else {
                    let (off, first) = ctx
                        .dynsec
                        .tls_ldm
                        .begin_init()
                        .ok_or_else(|| {
                            reloc_error(&obj_name, &sec_name, rel.offset, "missing TLS module slot")
                        })?;
                    if first {
                        let slot_vma = ctx.dynsec.got.vma + off;
                        ctx.dynsec.rela_got.push(Rela {
                            offset: slot_vma,
                            sym: 0,
                            r_type: abi::R_SH_TLS_DTPMOD32,
                            addend: 0,
                        });
                    }
                    addend = rel.addend;
                    Outcome::Patch {
                        value: ctx.dynsec.got_base_offset().wrapping_add(off),
                        addend,
                    }
                }
            }

            abi::R_SH_TLS_LDO_32 => {
                check_segment = (None, None);
                addend = rel.addend;
                let value = if !pic {
                    tls::tpoff(ctx.dynsec.tls, relocation)
                } else {
                    relocation.wrapping_sub(tls::dtpoff_base(ctx.dynsec.tls))
                };
                Outcome::Patch { value, addend }
            }

            abi::R_SH_TLS_LE_32 => {
                check_segment = (None, None);
                if !ctx.cfg.is_shared() {
                    addend = rel.addend;
                    Outcome::Patch {
                        value: tls::tpoff(ctx.dynsec.tls, relocation),
                        addend,
                    }
                } else {
                    // The module cannot know its TLS offsets; defer.
                    let dynindx = h.and_then(|g| ctx.globals[g].dynindx).unwrap_or(0);
                    let out_addend = if dynindx == 0 {
                        relocation.wrapping_sub(tls::dtpoff_base(ctx.dynsec.tls)) as i32
                    } else {
                        0
                    };
                    let out = Rela {
                        offset: sec_vma + rel.offset,
                        sym: dynindx,
                        r_type: abi::R_SH_TLS_TPOFF32,
                        addend: out_addend,
                    };
                    ctx.dynsec.section_rela_mut(obj_idx, sec_idx).push(out);
                    Outcome::Done
                }
            }

            _ => {
                return Err(Error::BadRelocType {
                    object: obj_name.clone(),
                    r_type,
                });
            }
        };

        // FDPIC: a relocation whose target landed in another segment
        // cannot be expressed once segments move independently.
        if fdpic
            && check_segment.0.is_some()
            && check_segment.0 != check_segment.1
        {
            let undefined = h.map_or(false, |g| ctx.globals[g].is_undefined());
            if !undefined {
                if pic {
                    return Err(reloc_error(
                        &obj_name,
                        &sec_name,
                        rel.offset,
                        "relocation references a different segment",
                    ));
                }
                #[cfg(feature = "log")]
                log::warn!(
                    "{}({}+{:#x}): warning: relocation to `{}' references a different segment",
                    obj_name,
                    sec_name,
                    rel.offset,
                    ctx.symbol_name(obj_idx, rel.symbol)
                );
                *ctx.output_flags |= OutputFlags::PIC;
            }
        }

        if let Outcome::Patch { value, addend } = outcome {
            let pc = sec_vma + rel.offset;
            let status = patch::apply(
                howto,
                contents,
                rel.offset as usize,
                endian,
                value,
                addend,
                pc,
            );
            patch_status(status, &obj_name, &sec_name, rel.offset, howto)?;
        }
    }

    Ok(())
}

fn unaligned(
    object: &str,
    section: &str,
    offset: u32,
    howto: &RelocDescriptor,
    relocation: u32,
) -> Error {
    Error::Reloc {
        object: object.into(),
        section: section.into(),
        offset,
        message: alloc::format!(
            "fatal: unaligned {} relocation {relocation:#x}",
            howto.name
        ),
    }
}

fn patch_status(
    status: PatchStatus,
    object: &str,
    section: &str,
    offset: u32,
    howto: &RelocDescriptor,
) -> Result<()> {
    match status {
        PatchStatus::Ok => Ok(()),
        PatchStatus::Overflow => Err(Error::Reloc {
            object: object.into(),
            section: section.into(),
            offset,
            message: alloc::format!("{} relocation overflow", howto.name),
        }),
        PatchStatus::OutOfRange => Err(Error::Reloc {
            object: object.into(),
            section: section.into(),
            offset,
            message: alloc::format!("{} relocation offset out of range", howto.name),
        }),
    }
}

fn movi20(
    contents: &mut [u8],
    offset: u32,
    endian: Endian,
    value: u32,
    object: &str,
    section: &str,
) -> Result<()> {
    let status = install_movi20_field(contents, offset as usize, endian, value);
    match status {
        PatchStatus::Ok => Ok(()),
        PatchStatus::Overflow => Err(reloc_error(
            object,
            section,
            offset,
            "movi20 relocation overflow",
        )),
        PatchStatus::OutOfRange => Err(reloc_error(
            object,
            section,
            offset,
            "movi20 relocation offset out of range",
        )),
    }
}

/// Zero the storage unit of a relocation against a discarded section.
fn zero_field(howto: &RelocDescriptor, contents: &mut [u8], offset: usize) {
    let size = howto.size as usize;
    if size > 0 && offset + size <= contents.len() {
        contents[offset..offset + size].fill(0);
    }
}

/// Shared GOT-entry resolution for `R_SH_GOT32`/`R_SH_GOT20` and the
/// degraded `R_SH_GOTPLT32`. Initializes the slot exactly once, emits
/// the load-time record its placement demands, and yields the entry's
/// GOT-relative address.
fn got_entry(
    ctx: &mut ResolveContext<'_>,
    obj_idx: usize,
    rel: &RelocEntry,
    relocation: u32,
    addend: i32,
    check_segment: &mut (Option<usize>, Option<usize>),
    contents: &mut [u8],
    r_type: u32,
    obj_name: &str,
    sec_name: &str,
) -> Result<Outcome> {
    let endian = ctx.cfg.endian;
    let pic = ctx.cfg.is_pic();
    let fdpic = ctx.cfg.is_fdpic();
    let dyn_created = ctx.cfg.dynamic_sections();
    *check_segment = (None, None);

    let kind = ctx.got_kind(obj_idx, rel.symbol);
    let init_here = match rel.symbol {
        SymbolRef::Global(g) => {
            let sym = &ctx.globals[g];
            !crate::dynlink::will_finish_dynamic(sym, dyn_created, pic)
                || (pic && symbol_references_local(ctx.cfg, sym))
                || ((sym.visibility != STV_DEFAULT || sym.resolves_to_zero())
                    && sym.is_undefweak())
        }
        SymbolRef::Local(_) => true,
    };

    let slot = ctx.got_slot_mut(obj_idx, rel.symbol);
    let (off, first) = slot.begin_init().ok_or_else(|| {
        reloc_error(obj_name, sec_name, rel.offset, "GOT slot was never reserved")
    })?;

    if init_here {
        if first {
            let slot_vma = ctx.dynsec.got.vma + off;
            put_32(&mut ctx.dynsec.got.bytes, off as usize, endian, relocation);
            match rel.symbol {
                SymbolRef::Global(g) => {
                    // Bound at link time; FDPIC still self-relocates the
                    // address at load.
                    if fdpic
                        && !pic
                        && kind == GotKind::Normal
                        && (ctx.globals[g].visibility == STV_DEFAULT
                            || !ctx.globals[g].is_undefweak())
                    {
                        ctx.dynsec.rofixup.push(slot_vma);
                    }
                }
                SymbolRef::Local(_) => {
                    if pic {
                        if fdpic {
                            let (o, s) = ctx
                                .resolve(obj_idx, rel)
                                .target
                                .expect("local GOT entry without a section");
                            let tsec = &ctx.objects[o].sections[s];
                            ctx.dynsec.rela_got.push(Rela {
                                offset: slot_vma,
                                sym: tsec.dynindx.unwrap_or(0),
                                r_type: abi::R_SH_DIR32,
                                addend: (relocation as i32).wrapping_sub(tsec.vma as i32),
                            });
                        } else {
                            ctx.dynsec.rela_got.push(Rela {
                                offset: slot_vma,
                                sym: 0,
                                r_type: abi::R_SH_RELATIVE,
                                addend: relocation as i32,
                            });
                        }
                    } else if fdpic && kind == GotKind::Normal {
                        ctx.dynsec.rofixup.push(slot_vma);
                    }
                }
            }
        }
    } else if first {
        // The dynamic linker fills the slot; put the reservation back so
        // the finalizer sees a virgin entry.
        *ctx.got_slot_mut(obj_idx, rel.symbol) = crate::dynlink::Slot::Reserved(off);
    }

    let value = ctx.dynsec.got_base_offset().wrapping_add(off);
    if r_type == abi::R_SH_GOT20 {
        movi20(
            contents,
            rel.offset,
            endian,
            value.wrapping_add(addend as u32),
            obj_name,
            sec_name,
        )?;
        Ok(Outcome::Done)
    } else {
        Ok(Outcome::Patch { value, addend })
    }
}

/// Make sure the symbol's private function descriptor exists and is
/// initialized, returning its offset in `.got.funcdesc`.
fn ensure_funcdesc(ctx: &mut ResolveContext<'_>, obj_idx: usize, symbol: SymbolRef) -> Result<u32> {
    let slot = ctx.funcdesc_slot_mut(obj_idx, symbol);
    let Some((off, first)) = slot.begin_init() else {
        return Err(Error::Reloc {
            object: ctx.objects[obj_idx].name.clone(),
            section: "".into(),
            offset: 0,
            message: "function descriptor was never reserved".into(),
        });
    };
    if first {
        ctx.initialize_funcdesc(obj_idx, symbol, off)?;
    }
    Ok(off)
}

/// The function-descriptor family: resolve to a canonical descriptor,
/// local or dynamic-linker-owned, optionally through the GOT.
fn funcdesc_entry(
    ctx: &mut ResolveContext<'_>,
    obj_idx: usize,
    sec_idx: usize,
    rel: &RelocEntry,
    resolved: &Resolved,
    check_segment: &mut (Option<usize>, Option<usize>),
    contents: &mut [u8],
    r_type: u32,
    sec_vma: u32,
    obj_name: &str,
    sec_name: &str,
) -> Result<Outcome> {
    let _ = sec_idx;
    let endian = ctx.cfg.endian;
    let pic = ctx.cfg.is_pic();
    let dyn_created = ctx.cfg.dynamic_sections();
    *check_segment = (None, None);

    let h = resolved.global;
    let is_got_resident = r_type != abi::R_SH_FUNCDESC;

    // Where the descriptor's address gets stored: the symbol's GOT slot,
    // or the relocation site itself for bare FUNCDESC.
    let (store_vma, got_off) = if is_got_resident {
        let slot = ctx.got_slot_mut(obj_idx, rel.symbol);
        let Some((off, first)) = slot.begin_init() else {
            return Err(reloc_error(
                obj_name,
                sec_name,
                rel.offset,
                "GOT slot was never reserved",
            ));
        };
        if !first {
            // Initialized by an earlier relocation sharing the slot.
            let value = ctx.dynsec.got_base_offset().wrapping_add(off);
            return finish_got_funcdesc(contents, rel, r_type, value, endian, obj_name, sec_name);
        }
        (ctx.dynsec.got.vma + off, Some(off))
    } else {
        (sec_vma + rel.offset, None)
    };

    let mut relocation: u32 = 0;
    let mut dyn_sym: u32 = 0;
    let mut dyn_type = abi::R_SH_FUNCDESC;
    let mut leave_zero = false;
    let mut desc_is_local = false;

    let funcdesc_local = match h {
        Some(g) => symbol_funcdesc_local(ctx.cfg, &ctx.globals[g]),
        None => true,
    };
    let calls_local = match h {
        Some(g) => symbol_calls_local(ctx.cfg, &ctx.globals[g]),
        None => true,
    };

    if h.is_some_and(|g| {
        ctx.globals[g].is_undefweak()
            && (symbol_calls_local(ctx.cfg, &ctx.globals[g]) || !dyn_created)
    }) {
        // Never resolved dynamically; the descriptor pointer stays zero.
        leave_zero = true;
    } else if calls_local && !funcdesc_local {
        // Protected visibility: bound locally, descriptor owned by the
        // dynamic linker. Decay the record to section+offset.
        let g = h.expect("protected binding implies a global symbol");
        let (o, s, value) = match ctx.globals[g].def {
            SymbolDef::Defined {
                object,
                section,
                value,
            } => (object, section, value),
            _ => {
                return Err(reloc_error(
                    obj_name,
                    sec_name,
                    rel.offset,
                    "descriptor for an undefined protected symbol",
                ));
            }
        };
        dyn_sym = ctx.objects[o].sections[s].dynindx.unwrap_or(0);
        relocation = value;
    } else if !funcdesc_local {
        // The dynamic linker allocates the canonical descriptor.
        let g = h.expect("dynamic descriptor implies a global symbol");
        dyn_sym = ctx.globals[g]
            .dynindx
            .expect("dynamic symbol without an index");
    } else {
        // A private descriptor in this output; reference it directly.
        dyn_type = abi::R_SH_DIR32;
        dyn_sym = ctx.dynsec.funcdesc.dynindx.unwrap_or(0);
        let off = ensure_funcdesc(ctx, obj_idx, rel.symbol)?;
        desc_is_local = true;
        relocation = off;
    }

    if !leave_zero {
        if !pic && funcdesc_local {
            // Static FDPIC: the slot holding the descriptor address is
            // self-relocated by the loader.
            let seg = ctx.segment_of_vma(store_vma);
            if !ctx.segment_writable(seg) {
                return Err(Error::ReadOnlyFixup {
                    object: obj_name.into(),
                    section: sec_name.into(),
                    offset: rel.offset,
                    symbol: ctx.symbol_name(obj_idx, rel.symbol).into(),
                });
            }
            ctx.dynsec.rofixup.push(store_vma);
            if desc_is_local {
                relocation = relocation.wrapping_add(ctx.dynsec.funcdesc.vma);
            }
        } else {
            // Load-time record for the slot, wherever it lives.
            ctx.dynsec.rela_got.push(Rela {
                offset: store_vma,
                sym: dyn_sym,
                r_type: dyn_type,
                addend: relocation as i32,
            });
            if r_type == abi::R_SH_FUNCDESC {
                return Ok(Outcome::Done);
            }
            relocation = 0;
        }
    }

    if is_got_resident {
        let off = got_off.expect("GOT-resident descriptor without a slot");
        put_32(&mut ctx.dynsec.got.bytes, off as usize, endian, relocation);
        let value = ctx.dynsec.got_base_offset().wrapping_add(off);
        finish_got_funcdesc(contents, rel, r_type, value, endian, obj_name, sec_name)
    } else {
        // Bare FUNCDESC: the descriptor address lands in the word
        // itself.
        Ok(Outcome::Patch {
            value: relocation,
            addend: 0,
        })
    }
}

fn finish_got_funcdesc(
    contents: &mut [u8],
    rel: &RelocEntry,
    r_type: u32,
    value: u32,
    endian: Endian,
    obj_name: &str,
    sec_name: &str,
) -> Result<Outcome> {
    if r_type == abi::R_SH_GOTFUNCDESC20 {
        movi20(
            contents,
            rel.offset,
            endian,
            value.wrapping_add(rel.addend as u32),
            obj_name,
            sec_name,
        )?;
        Ok(Outcome::Done)
    } else {
        Ok(Outcome::Patch { value, addend: 0 })
    }
}

/// `R_SH_TLS_GD_32` / `R_SH_TLS_IE_32`: apply the model decided during
/// scanning, rewriting the access sequence when it was downgraded.
fn tls_got_entry(
    ctx: &mut ResolveContext<'_>,
    obj_idx: usize,
    rel: &RelocEntry,
    relocation: u32,
    contents: &mut [u8],
    orig_type: u32,
    dyn_created: bool,
    obj_name: &str,
    sec_name: &str,
) -> Result<Outcome> {
    let endian = ctx.cfg.endian;
    let pic = ctx.cfg.is_pic();

    let h = match rel.symbol {
        SymbolRef::Global(g) => Some(g),
        SymbolRef::Local(_) => None,
    };
    let mut r_type = tls::optimized_tls_reloc(ctx.cfg, orig_type, h.is_none());
    let kind = ctx.got_kind(obj_idx, rel.symbol);
    if let Some(g) = h {
        let sym = &ctx.globals[g];
        if !pic && (sym.dynindx.is_none() || sym.def_regular) {
            r_type = abi::R_SH_TLS_LE_32;
        }
    }
    if r_type == abi::R_SH_TLS_GD_32 && kind == GotKind::TlsIe {
        r_type = abi::R_SH_TLS_IE_32;
    }

    if r_type == abi::R_SH_TLS_LE_32 {
        let transition = if orig_type == abi::R_SH_TLS_GD_32 {
            TlsTransition::GdToLe
        } else {
            TlsTransition::IeToLe
        };
        tls::rewrite_sequence(transition, contents, rel.offset, endian, obj_name, sec_name)?;
        put_32(
            contents,
            rel.offset as usize,
            endian,
            tls::tpoff(ctx.dynsec.tls, relocation),
        );
        return Ok(Outcome::Done);
    }

    // Statically-linked initial exec: resolve the GOT word now.
    if r_type == abi::R_SH_TLS_IE_32 && !dyn_created {
        let slot = ctx.got_slot_mut(obj_idx, rel.symbol);
        let (off, _) = slot.begin_init().ok_or_else(|| {
            reloc_error(obj_name, sec_name, rel.offset, "GOT slot was never reserved")
        })?;
        let tp = tls::tpoff(ctx.dynsec.tls, relocation);
        put_32(&mut ctx.dynsec.got.bytes, off as usize, endian, tp);
        put_32(
            contents,
            rel.offset as usize,
            endian,
            ctx.dynsec.got_base_offset().wrapping_add(off),
        );
        return Ok(Outcome::Done);
    }

    let indx = h.and_then(|g| ctx.globals[g].dynindx).unwrap_or(0);
    let slot = ctx.got_slot_mut(obj_idx, rel.symbol);
    let (off, first) = slot.begin_init().ok_or_else(|| {
        reloc_error(obj_name, sec_name, rel.offset, "GOT slot was never reserved")
    })?;

    if first {
        let slot_vma = ctx.dynsec.got.vma + off;
        let dr_type = if r_type == abi::R_SH_TLS_GD_32 {
            abi::R_SH_TLS_DTPMOD32
        } else {
            abi::R_SH_TLS_TPOFF32
        };
        let out_addend = if dr_type == abi::R_SH_TLS_TPOFF32 && indx == 0 {
            relocation.wrapping_sub(tls::dtpoff_base(ctx.dynsec.tls)) as i32
        } else {
            0
        };
        ctx.dynsec.rela_got.push(Rela {
            offset: slot_vma,
            sym: indx,
            r_type: dr_type,
            addend: out_addend,
        });

        if r_type == abi::R_SH_TLS_GD_32 {
            if indx == 0 {
                let dtp = relocation.wrapping_sub(tls::dtpoff_base(ctx.dynsec.tls));
                put_32(&mut ctx.dynsec.got.bytes, off as usize + 4, endian, dtp);
            } else {
                ctx.dynsec.rela_got.push(Rela {
                    offset: slot_vma + 4,
                    sym: indx,
                    r_type: abi::R_SH_TLS_DTPOFF32,
                    addend: 0,
                });
            }
        }
    }

    if r_type == orig_type {
        Ok(Outcome::Patch {
            value: ctx.dynsec.got_base_offset().wrapping_add(off),
            addend: rel.addend,
        })
    } else {
        // GD access to an IE-classified symbol: shorten the sequence and
        // point it at the GOT entry.
        tls::rewrite_sequence(
            TlsTransition::GdToIe,
            contents,
            rel.offset,
            endian,
            obj_name,
            sec_name,
        )?;
        put_32(
            contents,
            rel.offset as usize,
            endian,
            ctx.dynsec.got_base_offset().wrapping_add(off),
        );
        Ok(Outcome::Done)
    }
}

//! GOT, PLT and function-descriptor allocation.
//!
//! Dynamic-linking state is accumulated in two passes that must both
//! complete for *all* inputs before any output byte is written:
//!
//! 1. **check relocations** ([`check_relocs`]) tallies GOT/PLT/TLS and
//!    function-descriptor reference counts per symbol and classifies each
//!    symbol's GOT use — mixing incompatible classes is a hard error.
//! 2. **size dynamic sections** ([`size_dynamic_sections`]) turns counts
//!    into byte offsets inside `.got`, `.got.plt`, `.plt`,
//!    `.got.funcdesc` and reserves exact space in the `.rela.*` and
//!    `.rofixup` outputs. The finalizer later asserts the reservation was
//!    spent exactly.
//!
//! All bookkeeping lives in side tables keyed by symbol index, away from
//! the semantic symbol fields, and slot lifecycle is an explicit
//! tri-state ([`Slot`]) rather than offset bit-stealing.

pub mod finish;
pub mod plt;

use crate::abi;
use crate::linker::{LinkConfig, OutputFlags};
use crate::object::{GlobalSymbol, InputObject, SymbolDef, SymbolRef, TlsRegion};
use crate::reloc::tls;
use crate::{Error, Result};
use alloc::{string::String, vec, vec::Vec};
use elf::abi::{STV_DEFAULT, STV_HIDDEN, STV_INTERNAL, STV_PROTECTED};
use hashbrown::HashMap;
use self::plt::{PltDescriptor, entry_descriptor};

/// Size of one RELA record in the 32-bit encoding.
pub const RELA_SIZE: u32 = 12;

/// Lifecycle of a GOT/PLT/descriptor slot. Reservation happens during
/// sizing; initialization happens at most once, during resolution, no
/// matter how many relocations share the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Slot {
    #[default]
    Unallocated,
    Reserved(u32),
    Initialized(u32),
}

impl Slot {
    pub fn offset(self) -> Option<u32> {
        match self {
            Slot::Unallocated => None,
            Slot::Reserved(off) | Slot::Initialized(off) => Some(off),
        }
    }

    pub fn is_allocated(self) -> bool {
        !matches!(self, Slot::Unallocated)
    }

    /// Take the slot for initialization. Returns the offset and whether
    /// this call was the first; the slot is marked initialized.
    pub fn begin_init(&mut self) -> Option<(u32, bool)> {
        match *self {
            Slot::Unallocated => None,
            Slot::Reserved(off) => {
                *self = Slot::Initialized(off);
                Some((off, true))
            }
            Slot::Initialized(off) => Some((off, false)),
        }
    }
}

/// How a symbol uses its GOT slot. One symbol may not mix classes;
/// the single exception is that GD and IE may coexist, collapsing to IE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GotKind {
    #[default]
    Unknown,
    Normal,
    TlsGd,
    TlsIe,
    FuncDesc,
}

/// Per-(section) count of dynamic relocations a symbol will need.
#[derive(Debug, Clone)]
pub struct DynRelocCount {
    pub object: usize,
    pub section: usize,
    pub count: u32,
    pub pc_count: u32,
}

/// Dynamic-linking side state for one global symbol.
#[derive(Debug, Clone, Default)]
pub struct SymbolState {
    pub got_refs: u32,
    pub plt_refs: u32,
    /// PLT-via-GOT references; folded into `got_refs` once the symbol
    /// turns out not to need a real PLT entry.
    pub gotplt_refs: u32,
    pub funcdesc_refs: u32,
    /// How many of those were bare `R_SH_FUNCDESC`, each needing a fixup
    /// or dynamic relocation of its own.
    pub abs_funcdesc_refs: u32,
    pub got: Slot,
    pub plt: Slot,
    pub funcdesc: Slot,
    pub got_kind: GotKind,
    pub dyn_relocs: Vec<DynRelocCount>,
}

/// Dynamic-linking side state for one object's local symbols.
#[derive(Debug, Default)]
pub struct LocalState {
    pub got_refs: Vec<u32>,
    pub got_kind: Vec<GotKind>,
    pub got: Vec<Slot>,
    pub funcdesc_refs: Vec<u32>,
    pub funcdesc: Vec<Slot>,
    /// Pending dynamic-relocation counts per section: (count, pc_count).
    pub section_dyn_relocs: Vec<(u32, u32)>,
}

impl LocalState {
    pub fn for_object(obj: &InputObject) -> Self {
        let n = obj.locals.len();
        Self {
            got_refs: vec![0; n],
            got_kind: vec![GotKind::Unknown; n],
            got: vec![Slot::Unallocated; n],
            funcdesc_refs: vec![0; n],
            funcdesc: vec![Slot::Unallocated; n],
            section_dyn_relocs: vec![(0, 0); obj.sections.len()],
        }
    }
}

/// A linker-created output section, filled by the resolver/finalizer.
#[derive(Debug, Default)]
pub struct SectionBuf {
    pub bytes: Vec<u8>,
    pub vma: u32,
    pub segment: Option<usize>,
    /// Section dynamic-symbol index, for FDPIC section-relative records.
    pub dynindx: Option<u32>,
}

impl SectionBuf {
    /// Reserve `n` zeroed bytes, returning their offset.
    pub fn alloc(&mut self, n: u32) -> u32 {
        let off = self.bytes.len() as u32;
        self.bytes.resize((off + n) as usize, 0);
        off
    }

    pub fn size(&self) -> u32 {
        self.bytes.len() as u32
    }
}

/// One dynamic relocation record destined for a `.rela.*` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rela {
    pub offset: u32,
    /// Dynamic symbol index (0 for none/section-less records).
    pub sym: u32,
    pub r_type: u32,
    pub addend: i32,
}

impl Rela {
    /// Standard ELF32 RELA encoding.
    pub fn encode(&self, endian: abi::Endian) -> [u8; RELA_SIZE as usize] {
        let mut out = [0u8; RELA_SIZE as usize];
        let info = (self.sym << 8) | (self.r_type & 0xff);
        let words = [self.offset, info, self.addend as u32];
        for (i, w) in words.iter().enumerate() {
            let b = match endian {
                abi::Endian::Big => w.to_be_bytes(),
                abi::Endian::Little => w.to_le_bytes(),
            };
            out[i * 4..i * 4 + 4].copy_from_slice(&b);
        }
        out
    }
}

/// A `.rela.*` output with its reservation ledger.
#[derive(Debug, Default)]
pub struct RelaBuf {
    pub reserved: u32,
    pub entries: Vec<Rela>,
    pub vma: u32,
}

impl RelaBuf {
    pub fn push(&mut self, rela: Rela) -> u32 {
        debug_assert!((self.entries.len() as u32) < self.reserved);
        self.entries.push(rela);
        (self.entries.len() as u32 - 1) * RELA_SIZE
    }

    pub fn size(&self) -> u32 {
        self.reserved * RELA_SIZE
    }

    pub fn check(&self, name: &'static str) -> Result<()> {
        if self.entries.len() as u32 != self.reserved {
            return Err(Error::AccountingMismatch {
                section: name,
                reserved: self.reserved as usize,
                emitted: self.entries.len(),
            });
        }
        Ok(())
    }

    pub fn encode(&self, endian: abi::Endian) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * RELA_SIZE as usize);
        for rela in &self.entries {
            out.extend_from_slice(&rela.encode(endian));
        }
        out
    }
}

/// The FDPIC `.rofixup` output: a flat array of addresses the static
/// loader self-relocates. The last entry is always the GOT's own
/// address.
#[derive(Debug, Default)]
pub struct RofixupBuf {
    pub reserved: u32,
    pub entries: Vec<u32>,
    pub vma: u32,
}

impl RofixupBuf {
    pub fn push(&mut self, addr: u32) {
        debug_assert!((self.entries.len() as u32) < self.reserved);
        self.entries.push(addr);
    }

    /// Give back one speculative reservation.
    pub fn unreserve(&mut self, n: u32) {
        self.reserved = self.reserved.saturating_sub(n);
    }

    pub fn size(&self) -> u32 {
        self.reserved * 4
    }

    pub fn check(&self) -> Result<()> {
        if self.entries.len() as u32 != self.reserved {
            return Err(Error::AccountingMismatch {
                section: ".rofixup",
                reserved: self.reserved as usize,
                emitted: self.entries.len(),
            });
        }
        Ok(())
    }
}

/// All linker-created dynamic output artifacts.
#[derive(Debug, Default)]
pub struct DynSections {
    pub got: SectionBuf,
    pub gotplt: SectionBuf,
    pub plt: SectionBuf,
    /// `.got.funcdesc`: 8-byte (address, segment) descriptors.
    pub funcdesc: SectionBuf,
    pub dynbss: SectionBuf,
    pub rela_got: RelaBuf,
    pub rela_plt: RelaBuf,
    pub rela_funcdesc: RelaBuf,
    pub rela_bss: RelaBuf,
    /// VxWorks: relocations applied by the static loader before the
    /// dynamic linker runs.
    pub rela_plt_unloaded: RelaBuf,
    pub rofixup: RofixupBuf,
    /// Per input section `.rela` buckets for copied DIR32/REL32/TPOFF
    /// relocations, keyed by (object, section).
    pub section_rela: HashMap<(usize, usize), RelaBuf>,
    /// Offset of `_GLOBAL_OFFSET_TABLE_` inside `.got.plt` (zero except
    /// for FDPIC, where the reserved words sit at the end).
    pub got_anchor: u32,
    /// The one shared GOT slot pair for local-dynamic TLS.
    pub tls_ldm_refs: u32,
    pub tls_ldm: Slot,
    /// Address of `.dynamic`, for the `.got.plt` header word.
    pub dynamic_vma: u32,
    /// TLS template placement, for `tpoff`/`dtpoff` computation.
    pub tls: Option<TlsRegion>,
}

impl DynSections {
    /// Value of the `_GLOBAL_OFFSET_TABLE_` symbol.
    pub fn got_anchor_vma(&self) -> u32 {
        self.gotplt.vma + self.got_anchor
    }

    /// Offset of `.got`'s start from `_GLOBAL_OFFSET_TABLE_`; GOT-relative
    /// relocations resolve through this.
    pub fn got_base_offset(&self) -> u32 {
        self.got.vma.wrapping_sub(self.got_anchor_vma())
    }

    pub fn section_rela_mut(&mut self, object: usize, section: usize) -> &mut RelaBuf {
        self.section_rela.entry((object, section)).or_default()
    }
}

/// `SYMBOL_REFERENCES_LOCAL`: data references to the symbol resolve
/// inside this output.
pub fn symbol_references_local(cfg: &LinkConfig, h: &GlobalSymbol) -> bool {
    refs_local(cfg, h, false)
}

/// `SYMBOL_CALLS_LOCAL`: calls resolve inside this output (protected
/// visibility counts as local).
pub fn symbol_calls_local(cfg: &LinkConfig, h: &GlobalSymbol) -> bool {
    refs_local(cfg, h, true)
}

fn refs_local(cfg: &LinkConfig, h: &GlobalSymbol, protected_counts: bool) -> bool {
    if h.forced_local {
        return true;
    }
    if !h.def_regular {
        return false;
    }
    if !cfg.is_pic() || cfg.symbolic || h.dynindx.is_none() {
        return true;
    }
    match h.visibility {
        STV_DEFAULT => false,
        STV_PROTECTED => protected_counts,
        _ => true,
    }
}

/// A reference to a symbol's function descriptor can be satisfied by a
/// descriptor allocated in this output. Protected symbols bind locally
/// but their canonical descriptor still belongs to the dynamic linker.
pub fn symbol_funcdesc_local(cfg: &LinkConfig, h: &GlobalSymbol) -> bool {
    symbol_references_local(cfg, h) || !cfg.dynamic_sections()
}

/// `WILL_CALL_FINISH_DYNAMIC_SYMBOL` with the given pic setting.
pub fn will_finish_dynamic(h: &GlobalSymbol, dyn_created: bool, pic: bool) -> bool {
    dyn_created && (pic || !h.forced_local) && (h.dynindx.is_some() || h.forced_local)
}

/// Everything the allocation passes read and write. Borrowed from the
/// [`crate::Linker`] for the duration of one pass.
pub struct DynContext<'a> {
    pub cfg: &'a LinkConfig,
    pub objects: &'a [InputObject],
    pub globals: &'a mut [GlobalSymbol],
    pub states: &'a mut [SymbolState],
    pub locals: &'a mut [LocalState],
    pub dynsec: &'a mut DynSections,
    pub next_dynindx: &'a mut u32,
    pub output_flags: &'a mut OutputFlags,
    pub plt_desc: &'static PltDescriptor,
}

impl DynContext<'_> {
    fn record_dynamic(&mut self, id: usize) {
        let h = &mut self.globals[id];
        if h.dynindx.is_none() && !h.forced_local {
            h.dynindx = Some(*self.next_dynindx);
            *self.next_dynindx += 1;
        }
    }

    fn got_kind_for(&self, symbol: SymbolRef, obj_idx: usize) -> GotKind {
        match symbol {
            SymbolRef::Global(g) => self.states[g].got_kind,
            SymbolRef::Local(l) => self.locals[obj_idx].got_kind[l],
        }
    }

    fn symbol_name(&self, symbol: SymbolRef, obj_idx: usize) -> String {
        match symbol {
            SymbolRef::Global(g) => self.globals[g].name.clone(),
            SymbolRef::Local(l) => self.objects[obj_idx].locals[l].name.clone(),
        }
    }
}

fn conflict_message(old: GotKind, new: GotKind) -> &'static str {
    let fd = GotKind::FuncDesc;
    let normal = GotKind::Normal;
    if (old == fd || new == fd) && (old == normal || new == normal) {
        "accessed both as normal and FDPIC symbol"
    } else if old == fd || new == fd {
        "accessed both as FDPIC and thread local symbol"
    } else {
        "accessed both as normal and thread local symbol"
    }
}

/// Pass A: scan one section's relocations, accumulating reference
/// counts, GOT classes and pending dynamic-relocation tallies.
pub fn check_relocs(ctx: &mut DynContext<'_>, obj_idx: usize, sec_idx: usize) -> Result<()> {
    let pic = ctx.cfg.is_pic();
    let fdpic = ctx.cfg.is_fdpic();
    let sec_alloc = ctx.objects[obj_idx].sections[sec_idx].is_alloc();
    let nrelocs = ctx.objects[obj_idx].sections[sec_idx].relocs.len();

    for r in 0..nrelocs {
        let rel = ctx.objects[obj_idx].sections[sec_idx].relocs[r];
        let global = match rel.symbol {
            SymbolRef::Global(g) => Some(g),
            SymbolRef::Local(_) => None,
        };

        let mut r_type = tls::optimized_tls_reloc(ctx.cfg, rel.r_type, global.is_none());
        if let Some(g) = global {
            let h = &ctx.globals[g];
            if !pic
                && r_type == abi::R_SH_TLS_IE_32
                && !h.is_undefined()
                && (h.dynindx.is_none() || h.def_regular)
            {
                r_type = abi::R_SH_TLS_LE_32;
            }
        }

        // FDPIC descriptor references make even executable-local
        // symbols visible to the dynamic linker.
        if fdpic
            && matches!(
                r_type,
                abi::R_SH_GOTOFFFUNCDESC
                    | abi::R_SH_GOTOFFFUNCDESC20
                    | abi::R_SH_FUNCDESC
                    | abi::R_SH_GOTFUNCDESC
                    | abi::R_SH_GOTFUNCDESC20
            )
        {
            if let Some(g) = global {
                if ctx.globals[g].dynindx.is_none()
                    && !matches!(ctx.globals[g].visibility, STV_INTERNAL | STV_HIDDEN)
                {
                    ctx.record_dynamic(g);
                }
            }
        }

        match r_type {
            abi::R_SH_TLS_IE_32 => {
                if pic {
                    *ctx.output_flags |= OutputFlags::STATIC_TLS;
                }
                account_got(ctx, obj_idx, rel.symbol, GotKind::TlsIe)?;
            }
            abi::R_SH_TLS_GD_32 => {
                account_got(ctx, obj_idx, rel.symbol, GotKind::TlsGd)?;
            }
            abi::R_SH_GOT32 | abi::R_SH_GOT20 => {
                account_got(ctx, obj_idx, rel.symbol, GotKind::Normal)?;
            }
            abi::R_SH_GOTFUNCDESC | abi::R_SH_GOTFUNCDESC20 => {
                account_got(ctx, obj_idx, rel.symbol, GotKind::FuncDesc)?;
            }
            abi::R_SH_TLS_LD_32 => {
                ctx.dynsec.tls_ldm_refs += 1;
            }
            abi::R_SH_FUNCDESC | abi::R_SH_GOTOFFFUNCDESC | abi::R_SH_GOTOFFFUNCDESC20 => {
                if rel.addend != 0 {
                    return Err(Error::FuncDescAddend {
                        object: ctx.objects[obj_idx].name.clone(),
                        symbol: ctx.symbol_name(rel.symbol, obj_idx),
                    });
                }
                match rel.symbol {
                    SymbolRef::Local(l) => {
                        ctx.locals[obj_idx].funcdesc_refs[l] += 1;
                        if r_type == abi::R_SH_FUNCDESC {
                            if pic {
                                ctx.dynsec.rela_got.reserved += 1;
                            } else {
                                ctx.dynsec.rofixup.reserved += 1;
                            }
                        }
                    }
                    SymbolRef::Global(g) => {
                        ctx.states[g].funcdesc_refs += 1;
                        if r_type == abi::R_SH_FUNCDESC {
                            ctx.states[g].abs_funcdesc_refs += 1;
                        }
                        // A descriptor reference forbids any non-FDPIC use.
                        let old = ctx.states[g].got_kind;
                        if old != GotKind::FuncDesc && old != GotKind::Unknown {
                            return Err(Error::GotTypeConflict {
                                object: ctx.objects[obj_idx].name.clone(),
                                symbol: ctx.globals[g].name.clone(),
                                message: conflict_message(old, GotKind::FuncDesc),
                            });
                        }
                    }
                }
            }
            abi::R_SH_GOTPLT32 => {
                // Resolved without a PLT when the target cannot or need
                // not be lazily bound; plain GOT accounting then.
                let force_got = match global {
                    None => true,
                    Some(g) => {
                        let h = &ctx.globals[g];
                        h.forced_local || !pic || ctx.cfg.symbolic || h.dynindx.is_none()
                    }
                };
                if force_got {
                    account_got(ctx, obj_idx, rel.symbol, GotKind::Normal)?;
                } else {
                    let g = global.unwrap();
                    ctx.globals[g].needs_plt = true;
                    ctx.states[g].plt_refs += 1;
                    ctx.states[g].gotplt_refs += 1;
                }
            }
            abi::R_SH_PLT32 => {
                // Local targets resolve directly; the entry decision for
                // globals waits until symbol adjustment, since PIC code
                // may never be referenced dynamically at all.
                let Some(g) = global else { continue };
                if ctx.globals[g].forced_local {
                    continue;
                }
                ctx.globals[g].needs_plt = true;
                ctx.states[g].plt_refs += 1;
            }
            abi::R_SH_DIR32 | abi::R_SH_REL32 => {
                if let Some(g) = global {
                    if !pic {
                        ctx.globals[g].non_got_ref = true;
                        ctx.states[g].plt_refs += 1;
                    }
                }

                // Relocations that must be re-resolved at load time are
                // tallied now and sized later, once it is known whether
                // the symbol stays dynamic.
                let needs_dyn = if pic {
                    sec_alloc
                        && (r_type != abi::R_SH_REL32
                            || global.map_or(false, |g| {
                                let h = &ctx.globals[g];
                                !ctx.cfg.symbolic || h.weak || !h.def_regular
                            }))
                } else {
                    sec_alloc
                        && global.map_or(false, |g| {
                            let h = &ctx.globals[g];
                            (h.weak && h.def_dynamic) || !h.def_regular
                        })
                };
                if needs_dyn {
                    match global {
                        Some(g) => {
                            let list = &mut ctx.states[g].dyn_relocs;
                            let head = match list.last_mut() {
                                Some(p) if p.object == obj_idx && p.section == sec_idx => p,
                                _ => {
                                    list.push(DynRelocCount {
                                        object: obj_idx,
                                        section: sec_idx,
                                        count: 0,
                                        pc_count: 0,
                                    });
                                    list.last_mut().unwrap()
                                }
                            };
                            head.count += 1;
                            if r_type == abi::R_SH_REL32 {
                                head.pc_count += 1;
                            }
                        }
                        None => {
                            let counts =
                                &mut ctx.locals[obj_idx].section_dyn_relocs[sec_idx];
                            counts.0 += 1;
                            if r_type == abi::R_SH_REL32 {
                                counts.1 += 1;
                            }
                        }
                    }
                }

                // Reserve the fixup regardless; generating a relocation
                // instead gives the space back.
                if fdpic && !pic && r_type == abi::R_SH_DIR32 && sec_alloc {
                    ctx.dynsec.rofixup.reserved += 1;
                }
            }
            abi::R_SH_TLS_LE_32 => {
                if ctx.cfg.is_shared() {
                    return Err(Error::TlsLocalExecInShared {
                        object: ctx.objects[obj_idx].name.clone(),
                    });
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn account_got(
    ctx: &mut DynContext<'_>,
    obj_idx: usize,
    symbol: SymbolRef,
    mut kind: GotKind,
) -> Result<()> {
    match symbol {
        SymbolRef::Global(g) => ctx.states[g].got_refs += 1,
        SymbolRef::Local(l) => ctx.locals[obj_idx].got_refs[l] += 1,
    }

    let old = ctx.got_kind_for(symbol, obj_idx);

    // Once a TLS symbol is seen through IE there is no point keeping the
    // dynamic model for it.
    if old != kind && old != GotKind::Unknown && !(old == GotKind::TlsGd && kind == GotKind::TlsIe)
    {
        if old == GotKind::TlsIe && kind == GotKind::TlsGd {
            kind = GotKind::TlsIe;
        } else {
            return Err(Error::GotTypeConflict {
                object: ctx.objects[obj_idx].name.clone(),
                symbol: ctx.symbol_name(symbol, obj_idx),
                message: conflict_message(old, kind),
            });
        }
    }

    if old != kind {
        match symbol {
            SymbolRef::Global(g) => ctx.states[g].got_kind = kind,
            SymbolRef::Local(l) => ctx.locals[obj_idx].got_kind[l] = kind,
        }
    }
    Ok(())
}

/// Decide, per global symbol, whether it keeps a PLT entry and whether a
/// copy relocation is needed. Runs between the two passes.
pub fn adjust_dynamic_symbols(ctx: &mut DynContext<'_>) -> Result<()> {
    let pic = ctx.cfg.is_pic();
    for id in 0..ctx.globals.len() {
        let is_func = ctx.globals[id].is_function() || ctx.globals[id].needs_plt;
        if is_func {
            let h = &ctx.globals[id];
            if ctx.states[id].plt_refs == 0
                || symbol_calls_local(ctx.cfg, h)
                || (h.visibility != STV_DEFAULT && h.is_undefweak())
            {
                // A PLT reloc was seen but the symbol is never referred
                // to by a dynamic object; a direct relocation does.
                ctx.states[id].plt_refs = 0;
                ctx.globals[id].needs_plt = false;
            }
            continue;
        }

        // Not a function: the speculative PLT references from direct
        // relocations never materialize.
        ctx.states[id].plt_refs = 0;

        // Only data symbols defined by a dynamic object and addressed
        // directly from non-PIC code need a copy into .dynbss.
        if pic || !ctx.globals[id].non_got_ref {
            continue;
        }
        let h = &ctx.globals[id];
        if h.def_regular || !h.def_dynamic || h.size == 0 {
            continue;
        }
        let offset = ctx.dynsec.dynbss.alloc(h.size);
        ctx.dynsec.rela_bss.reserved += 1;
        let h = &mut ctx.globals[id];
        h.needs_copy = true;
        h.def = SymbolDef::DynBss { offset };
    }
    Ok(())
}

/// Pass B: convert reference counts into offsets and exact reservation
/// sizes. Local symbols first (input order), then globals in interning
/// order; layouts are link-reproducible.
pub fn size_dynamic_sections(ctx: &mut DynContext<'_>) -> Result<()> {
    let pic = ctx.cfg.is_pic();
    let fdpic = ctx.cfg.is_fdpic();
    let dyn_created = ctx.cfg.dynamic_sections();

    // The non-FDPIC .got.plt leads with three reserved words (the
    // .dynamic pointer and two loader scratch slots). FDPIC moves them
    // to the end, after all descriptors.
    if !fdpic && dyn_created {
        ctx.dynsec.gotplt.alloc(12);
    }

    // Pending local dynamic relocations, minus those whose section was
    // discarded.
    for o in 0..ctx.objects.len() {
        for s in 0..ctx.objects[o].sections.len() {
            let (count, pc_count) = ctx.locals[o].section_dyn_relocs[s];
            if count == 0 {
                continue;
            }
            let sec = &ctx.objects[o].sections[s];
            if sec.discarded {
                continue;
            }
            ctx.dynsec.section_rela_mut(o, s).reserved += count;
            if sec.is_alloc() && !sec.is_writable() {
                *ctx.output_flags |= OutputFlags::TEXTREL;
                #[cfg(feature = "log")]
                log::info!(
                    "{}: dynamic relocation in read-only section `{}'",
                    ctx.objects[o].name,
                    sec.name
                );
            }
            if fdpic && !pic {
                ctx.dynsec.rofixup.unreserve(count - pc_count);
            }
        }
    }

    // Local GOT slots.
    for o in 0..ctx.objects.len() {
        for l in 0..ctx.locals[o].got_refs.len() {
            if ctx.locals[o].got_refs[l] == 0 {
                continue;
            }
            let off = ctx.dynsec.got.alloc(4);
            if ctx.locals[o].got_kind[l] == GotKind::TlsGd {
                ctx.dynsec.got.alloc(4);
            }
            ctx.locals[o].got[l] = Slot::Reserved(off);
            if pic {
                ctx.dynsec.rela_got.reserved += 1;
            } else if fdpic {
                ctx.dynsec.rofixup.reserved += 1;
            }
            if ctx.locals[o].got_kind[l] == GotKind::FuncDesc {
                ctx.locals[o].funcdesc_refs[l] += 1;
            }
        }

        // Local function descriptors.
        for l in 0..ctx.locals[o].funcdesc_refs.len() {
            if ctx.locals[o].funcdesc_refs[l] == 0 {
                continue;
            }
            let off = ctx.dynsec.funcdesc.alloc(8);
            ctx.locals[o].funcdesc[l] = Slot::Reserved(off);
            if pic {
                ctx.dynsec.rela_funcdesc.reserved += 1;
            } else {
                ctx.dynsec.rofixup.reserved += 2;
            }
        }
    }

    // The shared local-dynamic TLS block slot: two GOT words and one
    // module-id relocation.
    if ctx.dynsec.tls_ldm_refs > 0 {
        let off = ctx.dynsec.got.alloc(8);
        ctx.dynsec.tls_ldm = Slot::Reserved(off);
        ctx.dynsec.rela_got.reserved += 1;
    }

    // Global symbols, in interning order.
    for id in 0..ctx.globals.len() {
        allocate_dynrelocs(ctx, id)?;
    }

    // FDPIC: reserved words and the _GLOBAL_OFFSET_TABLE_ anchor sit at
    // the end of .got.plt.
    if fdpic {
        ctx.dynsec.got_anchor = ctx.dynsec.gotplt.size();
        ctx.dynsec.gotplt.alloc(12);
        // The terminating self-pointer to the GOT.
        ctx.dynsec.rofixup.reserved += 1;
    }

    #[cfg(feature = "log")]
    log::debug!(
        "sized dynamic sections: .got {}B, .got.plt {}B, .plt {}B, .got.funcdesc {}B, .rela.got {}, .rela.plt {}, .rofixup {}",
        ctx.dynsec.got.size(),
        ctx.dynsec.gotplt.size(),
        ctx.dynsec.plt.size(),
        ctx.dynsec.funcdesc.size(),
        ctx.dynsec.rela_got.reserved,
        ctx.dynsec.rela_plt.reserved,
        ctx.dynsec.rofixup.reserved,
    );

    Ok(())
}

/// Allocate `.plt`, `.got` and relocation space for one global symbol.
fn allocate_dynrelocs(ctx: &mut DynContext<'_>, id: usize) -> Result<()> {
    let pic = ctx.cfg.is_pic();
    let fdpic = ctx.cfg.is_fdpic();
    let vxworks = ctx.cfg.is_vxworks();
    let dyn_created = ctx.cfg.dynamic_sections();

    // The symbol was forced local, or has direct GOT references: every
    // PLT-via-GOT reference degrades to a plain GOT reference.
    if (ctx.states[id].got_refs > 0 || ctx.globals[id].forced_local)
        && ctx.states[id].gotplt_refs > 0
    {
        let gotplt = ctx.states[id].gotplt_refs;
        ctx.states[id].got_refs += gotplt;
        ctx.states[id].plt_refs = ctx.states[id].plt_refs.saturating_sub(gotplt);
    }

    if dyn_created
        && ctx.states[id].plt_refs > 0
        && (ctx.globals[id].visibility == STV_DEFAULT || !ctx.globals[id].is_undefweak())
    {
        ctx.record_dynamic(id);

        if pic || will_finish_dynamic(&ctx.globals[id], true, false) {
            // The very first entry makes room for PLT0.
            if ctx.dynsec.plt.size() == 0 {
                let plt0 = ctx.plt_desc.plt0_size();
                ctx.dynsec.plt.alloc(plt0);
            }
            let offset = ctx.dynsec.plt.size();
            ctx.states[id].plt = Slot::Reserved(offset);

            // Without a regular definition in a non-PIC link the symbol
            // *is* its PLT entry, so function pointers compare equal
            // across the executable and shared libraries. FDPIC function
            // addresses are canonical descriptors instead.
            if !fdpic && !pic && !ctx.globals[id].def_regular {
                ctx.globals[id].def = SymbolDef::PltStub { offset };
            }

            let entry = entry_descriptor(ctx.plt_desc, offset);
            ctx.dynsec.plt.alloc(entry.entry_size());

            ctx.dynsec.gotplt.alloc(if fdpic { 8 } else { 4 });
            ctx.dynsec.rela_plt.reserved += 1;

            if vxworks && !pic {
                // The kernel loader applies its own relocations to each
                // PLT entry before the dynamic linker exists.
                if offset == ctx.plt_desc.plt0_size() {
                    ctx.dynsec.rela_plt_unloaded.reserved += 1;
                }
                ctx.dynsec.rela_plt_unloaded.reserved += 2;
            }
        } else {
            ctx.states[id].plt = Slot::Unallocated;
            ctx.globals[id].needs_plt = false;
        }
    } else {
        ctx.states[id].plt = Slot::Unallocated;
        ctx.globals[id].needs_plt = false;
    }

    if ctx.states[id].got_refs > 0 {
        ctx.record_dynamic(id);

        let off = ctx.dynsec.got.alloc(4);
        ctx.states[id].got = Slot::Reserved(off);
        let kind = ctx.states[id].got_kind;
        if kind == GotKind::TlsGd {
            ctx.dynsec.got.alloc(4);
        }

        let h = &ctx.globals[id];
        if !dyn_created {
            // Static output; FDPIC still self-relocates address slots.
            if fdpic && !pic && !h.is_undefweak() && matches!(kind, GotKind::Normal | GotKind::FuncDesc)
            {
                ctx.dynsec.rofixup.reserved += 1;
            }
        } else if kind == GotKind::TlsIe && !h.def_dynamic && !pic {
            // IE collapses to LE; no dynamic relocation at all.
        } else if (kind == GotKind::TlsGd && h.dynindx.is_none()) || kind == GotKind::TlsIe {
            ctx.dynsec.rela_got.reserved += 1;
        } else if kind == GotKind::TlsGd {
            ctx.dynsec.rela_got.reserved += 2;
        } else if kind == GotKind::FuncDesc {
            if !pic && symbol_funcdesc_local(ctx.cfg, h) {
                ctx.dynsec.rofixup.reserved += 1;
            } else {
                ctx.dynsec.rela_got.reserved += 1;
            }
        } else if (h.visibility == STV_DEFAULT || !h.is_undefweak())
            && (pic || will_finish_dynamic(h, dyn_created, false))
        {
            ctx.dynsec.rela_got.reserved += 1;
        } else if fdpic
            && !pic
            && kind == GotKind::Normal
            && (h.visibility == STV_DEFAULT || !h.is_undefweak())
        {
            ctx.dynsec.rofixup.reserved += 1;
        }
    }

    // Bare FUNCDESC references need a fixup or relocation each, unless
    // the target resolves to zero for good.
    if ctx.states[id].abs_funcdesc_refs > 0
        && (!ctx.globals[id].is_undefweak()
            || (dyn_created && !symbol_calls_local(ctx.cfg, &ctx.globals[id])))
    {
        let refs = ctx.states[id].abs_funcdesc_refs;
        if !pic && symbol_funcdesc_local(ctx.cfg, &ctx.globals[id]) {
            ctx.dynsec.rofixup.reserved += refs;
        } else {
            ctx.dynsec.rela_got.reserved += refs;
        }
    }

    // A canonical descriptor in this output, unless the dynamic linker
    // owns it. A .got.plt descriptor may exist too, but when the
    // canonical one can live here there is no PLT entry at all.
    if (ctx.states[id].funcdesc_refs > 0
        || (ctx.states[id].got.is_allocated() && ctx.states[id].got_kind == GotKind::FuncDesc))
        && !ctx.globals[id].is_undefweak()
        && symbol_funcdesc_local(ctx.cfg, &ctx.globals[id])
    {
        let off = ctx.dynsec.funcdesc.alloc(8);
        ctx.states[id].funcdesc = Slot::Reserved(off);
        if !pic && symbol_calls_local(ctx.cfg, &ctx.globals[id]) {
            ctx.dynsec.rofixup.reserved += 2;
        } else {
            ctx.dynsec.rela_funcdesc.reserved += 1;
        }
    }

    if ctx.states[id].dyn_relocs.is_empty() {
        return Ok(());
    }

    if pic {
        // Locally-bound pc-relative references need no load-time help.
        if symbol_calls_local(ctx.cfg, &ctx.globals[id]) {
            let list = &mut ctx.states[id].dyn_relocs;
            for p in list.iter_mut() {
                p.count -= p.pc_count;
                p.pc_count = 0;
            }
            list.retain(|p| p.count != 0);
        }

        if vxworks {
            // VxWorks .tls_vars relocations are the loader's business.
            let objects = ctx.objects;
            ctx.states[id]
                .dyn_relocs
                .retain(|p| objects[p.object].sections[p.section].name != ".tls_vars");
        }

        if ctx.globals[id].is_undefweak() {
            if ctx.globals[id].visibility != STV_DEFAULT
                || ctx.globals[id].resolves_to_zero()
            {
                ctx.states[id].dyn_relocs.clear();
            } else {
                // Keep undefined weak symbols dynamic in PIEs.
                ctx.record_dynamic(id);
            }
        }
    } else {
        // Keep relocations only for symbols that stay genuinely
        // dynamic; everything else resolved locally or got a copy.
        let h = &ctx.globals[id];
        let keep = !h.non_got_ref
            && ((h.def_dynamic && !h.def_regular)
                || (dyn_created && (h.is_undefined() || h.is_undefweak())));
        if keep {
            ctx.record_dynamic(id);
        }
        if !(keep && ctx.globals[id].dynindx.is_some()) {
            ctx.states[id].dyn_relocs.clear();
        }
    }

    let list = core::mem::take(&mut ctx.states[id].dyn_relocs);
    for p in &list {
        ctx.dynsec.section_rela_mut(p.object, p.section).reserved += p.count;
        // Relocations supersede fixups.
        if fdpic && !pic {
            ctx.dynsec.rofixup.unreserve(p.count - p.pc_count);
        }
    }
    ctx.states[id].dyn_relocs = list;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_initializes_exactly_once() {
        let mut slot = Slot::Reserved(8);
        let mut inits = 0;
        for _ in 0..5 {
            let (off, first) = slot.begin_init().unwrap();
            assert_eq!(off, 8);
            if first {
                inits += 1;
            }
        }
        assert_eq!(inits, 1);
        assert_eq!(Slot::Unallocated.begin_init(), None);
    }

    #[test]
    fn rela_encoding_is_elf32_rela() {
        let rela = Rela {
            offset: 0x1000,
            sym: 3,
            r_type: abi::R_SH_GLOB_DAT,
            addend: -4,
        };
        let le = rela.encode(abi::Endian::Little);
        assert_eq!(&le[0..4], &0x1000u32.to_le_bytes());
        assert_eq!(&le[4..8], &((3u32 << 8) | abi::R_SH_GLOB_DAT).to_le_bytes());
        assert_eq!(&le[8..12], &(-4i32 as u32).to_le_bytes());
        let be = rela.encode(abi::Endian::Big);
        assert_eq!(&be[0..4], &0x1000u32.to_be_bytes());
    }

    #[test]
    fn rela_buf_checks_reservation() {
        let mut buf = RelaBuf::default();
        buf.reserved = 2;
        buf.push(Rela {
            offset: 0,
            sym: 0,
            r_type: abi::R_SH_RELATIVE,
            addend: 0,
        });
        assert!(buf.check(".rela.got").is_err());
        buf.push(Rela {
            offset: 4,
            sym: 0,
            r_type: abi::R_SH_RELATIVE,
            addend: 0,
        });
        assert!(buf.check(".rela.got").is_ok());
    }
}

//! The link driver.
//!
//! [`Linker`] owns the inputs, the interned global symbol table, the
//! dynamic-linking side state and the output artifacts, and sequences
//! the engine's phases:
//!
//! 1. [`Linker::add_object`] — collect inputs, merge machine flags.
//! 2. [`Linker::relax`] — iterate branch relaxation to a fixed point.
//! 3. [`Linker::scan_relocations`] — tally GOT/PLT/TLS/descriptor use.
//! 4. [`Linker::layout`] — size dynamic sections, place everything.
//! 5. [`Linker::relocate_all`] — resolve and patch every section.
//! 6. [`Linker::finish`] — PLT/GOT finalization and ledger checks.

use crate::abi::{self, Endian};
use crate::dynlink::{
    self, DynContext, DynSections, LocalState, SymbolState, finish,
    plt::{self, PltDescriptor, PltStyle},
};
use crate::object::{
    GlobalSymbol, InputObject, Segment, SymbolDef, TlsRegion,
};
use crate::relax;
use crate::reloc::descriptor::TableVariant;
use crate::reloc::resolve::{ResolveContext, relocate_section};
use crate::{Error, Result};
use alloc::{string::String, vec::Vec};
use bitflags::bitflags;
use elf::abi::{DT_JMPREL, DT_PLTGOT, DT_PLTRELSZ, PF_R, PF_W, PF_X};
use hashbrown::HashMap;

/// What kind of output the link produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputKind {
    #[default]
    Executable,
    PieExecutable,
    SharedObject,
}

/// Which SH ELF ABI flavor the output follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Abi {
    #[default]
    Standard,
    VxWorks,
    Fdpic,
}

/// What to do about references to symbols nothing defines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnresolvedPolicy {
    Ignore,
    Warn,
    #[default]
    Error,
}

bitflags! {
    /// Conditions the link discovered about its output.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OutputFlags: u32 {
        /// The output needs PIC-style load treatment (FDPIC
        /// inter-segment references from non-PIC code).
        const PIC = 1 << 0;
        /// Dynamic relocations landed in read-only sections.
        const TEXTREL = 1 << 1;
        /// Initial-exec TLS in a shared object.
        const STATIC_TLS = 1 << 2;
    }
}

/// Link-wide configuration, fixed before the first input is added.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub output: OutputKind,
    pub abi: Abi,
    pub endian: Endian,
    /// The output may use SH-2A encodings (movi20, short FDPIC PLT).
    pub sh2a: bool,
    /// `-Bsymbolic`: bind global references inside the shared object.
    pub symbolic: bool,
    /// The link involves shared libraries at run time.
    pub dynamic: bool,
    /// Schedule misaligned 32-bit loads/stores during relaxation.
    pub align_loads: bool,
    pub unresolved: UnresolvedPolicy,
    /// Safety valve for the relaxation fixed point; `None` runs to
    /// convergence.
    pub relax_iteration_cap: Option<u32>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            output: OutputKind::Executable,
            abi: Abi::Standard,
            endian: Endian::Little,
            sh2a: false,
            symbolic: false,
            dynamic: false,
            align_loads: false,
            unresolved: UnresolvedPolicy::Error,
            relax_iteration_cap: None,
        }
    }
}

impl LinkConfig {
    pub fn is_pic(&self) -> bool {
        !matches!(self.output, OutputKind::Executable)
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.output, OutputKind::SharedObject)
    }

    pub fn is_fdpic(&self) -> bool {
        matches!(self.abi, Abi::Fdpic)
    }

    pub fn is_vxworks(&self) -> bool {
        matches!(self.abi, Abi::VxWorks)
    }

    /// Whether the output carries dynamic sections at all.
    pub fn dynamic_sections(&self) -> bool {
        self.dynamic || self.is_pic()
    }

    pub fn table_variant(&self) -> TableVariant {
        if self.is_vxworks() {
            TableVariant::VxWorks
        } else {
            TableVariant::Default
        }
    }

    fn plt_style(&self) -> PltStyle {
        match self.abi {
            Abi::Standard => PltStyle::Standard,
            Abi::VxWorks => PltStyle::VxWorks,
            Abi::Fdpic => PltStyle::Fdpic { sh2a: self.sh2a },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Input,
    Scanned,
    Laid,
    Relocated,
    Finished,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Input => "input",
            Phase::Scanned => "scan",
            Phase::Laid => "layout",
            Phase::Relocated => "relocate",
            Phase::Finished => "finish",
        }
    }
}

/// The SH ELF32 link-time relocation engine.
pub struct Linker {
    cfg: LinkConfig,
    objects: Vec<InputObject>,
    globals: Vec<GlobalSymbol>,
    names: HashMap<String, usize>,
    states: Vec<SymbolState>,
    locals: Vec<LocalState>,
    dynsec: DynSections,
    segments: Vec<Segment>,
    output_flags: OutputFlags,
    next_dynindx: u32,
    plt_desc: &'static PltDescriptor,
    dynamic_tags: Vec<(i64, u32)>,
    merged_mach: Option<u32>,
    phase: Phase,
}

impl Linker {
    pub fn new(cfg: LinkConfig) -> Self {
        let plt_desc = plt::select(cfg.plt_style(), cfg.endian, cfg.is_pic());
        Self {
            cfg,
            objects: Vec::new(),
            globals: Vec::new(),
            names: HashMap::new(),
            states: Vec::new(),
            locals: Vec::new(),
            dynsec: DynSections::default(),
            segments: Vec::new(),
            output_flags: OutputFlags::empty(),
            next_dynindx: 1,
            plt_desc,
            dynamic_tags: Vec::new(),
            merged_mach: None,
            phase: Phase::Input,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.cfg
    }

    fn expect_phase(&self, expected: Phase) -> Result<()> {
        if self.phase != expected {
            return Err(Error::Phase {
                expected: expected.name(),
                current: self.phase.name(),
            });
        }
        Ok(())
    }

    /// Add one relocatable input. Machine feature sets are merged; DSP
    /// objects cannot be mixed with floating-point ones.
    pub fn add_object(&mut self, object: InputObject) -> Result<usize> {
        self.expect_phase(Phase::Input)?;
        let mach = object.e_flags & abi::EF_SH_MACH_MASK;
        match self.merged_mach {
            None => self.merged_mach = Some(mach),
            Some(merged) => {
                let conflict = (abi::mach_has_dsp(mach) && abi::mach_has_fp(merged))
                    || (abi::mach_has_fp(mach) && abi::mach_has_dsp(merged));
                if conflict {
                    return Err(Error::IncompatibleFlags {
                        object: object.name.clone(),
                        e_flags: mach,
                        merged,
                    });
                }
                self.merged_mach = Some(merged.max(mach));
            }
        }
        self.locals.push(LocalState::for_object(&object));
        self.objects.push(object);
        Ok(self.objects.len() - 1)
    }

    /// Intern a global symbol by name, creating an undefined entry on
    /// first sight.
    pub fn intern_symbol(&mut self, name: &str) -> usize {
        if let Some(&id) = self.names.get(name) {
            return id;
        }
        let id = self.globals.len();
        self.globals.push(GlobalSymbol::undefined(name));
        self.states.push(SymbolState::default());
        self.names.insert(name.into(), id);
        id
    }

    /// Define an interned symbol inside an input section.
    pub fn define_symbol(&mut self, id: usize, object: usize, section: usize, value: u32) {
        let h = &mut self.globals[id];
        h.def = SymbolDef::Defined {
            object,
            section,
            value,
        };
        h.def_regular = true;
    }

    /// Mark an interned symbol as defined by a shared library.
    pub fn define_dynamic_symbol(&mut self, id: usize, size: u32) {
        let h = &mut self.globals[id];
        h.def = SymbolDef::Dynamic;
        h.def_dynamic = true;
        h.size = size;
        if h.dynindx.is_none() {
            h.dynindx = Some(self.next_dynindx);
            self.next_dynindx += 1;
        }
    }

    pub fn global(&self, id: usize) -> &GlobalSymbol {
        &self.globals[id]
    }

    pub fn global_mut(&mut self, id: usize) -> &mut GlobalSymbol {
        &mut self.globals[id]
    }

    pub fn object(&self, idx: usize) -> &InputObject {
        &self.objects[idx]
    }

    pub fn object_mut(&mut self, idx: usize) -> &mut InputObject {
        &mut self.objects[idx]
    }

    pub fn symbol_state(&self, id: usize) -> &SymbolState {
        &self.states[id]
    }

    pub fn dyn_sections(&self) -> &DynSections {
        &self.dynsec
    }

    pub fn output_flags(&self) -> OutputFlags {
        self.output_flags
    }

    /// The output's `e_flags`.
    pub fn e_flags(&self) -> u32 {
        let mut flags = self.merged_mach.unwrap_or(0);
        if self.cfg.is_fdpic() {
            flags |= abi::EF_SH_FDPIC;
        }
        if self.output_flags.contains(OutputFlags::PIC) {
            flags |= abi::EF_SH_PIC;
        }
        flags
    }

    /// The finalized `.dynamic` entries the engine owns.
    pub fn dynamic_tags(&self) -> &[(i64, u32)] {
        &self.dynamic_tags
    }

    /// Iterate relaxation over every section until no further call
    /// sequence shortens (or the configured iteration cap strikes).
    pub fn relax(&mut self) -> Result<()> {
        self.expect_phase(Phase::Input)?;
        let mut iterations = 0u32;
        loop {
            let mut again = false;
            for o in 0..self.objects.len() {
                for s in 0..self.objects[o].sections.len() {
                    if self.objects[o].sections[s].relocs.is_empty()
                        || self.objects[o].sections[s].discarded
                    {
                        continue;
                    }
                    again |= relax::relax_section(
                        &mut self.objects,
                        o,
                        s,
                        &mut self.globals,
                        &self.cfg,
                    )?;
                }
            }
            iterations += 1;
            if !again {
                break;
            }
            if let Some(cap) = self.cfg.relax_iteration_cap {
                if iterations >= cap {
                    #[cfg(feature = "log")]
                    log::warn!("relaxation stopped by iteration cap ({cap})");
                    break;
                }
            }
        }
        #[cfg(feature = "log")]
        log::debug!("relaxation converged after {iterations} pass(es)");
        Ok(())
    }

    fn dyn_context(&mut self) -> DynContext<'_> {
        DynContext {
            cfg: &self.cfg,
            objects: &self.objects,
            globals: &mut self.globals,
            states: &mut self.states,
            locals: &mut self.locals,
            dynsec: &mut self.dynsec,
            next_dynindx: &mut self.next_dynindx,
            output_flags: &mut self.output_flags,
            plt_desc: self.plt_desc,
        }
    }

    /// Pass A: scan every input relocation, then settle PLT and copy
    /// relocation decisions per symbol.
    pub fn scan_relocations(&mut self) -> Result<()> {
        self.expect_phase(Phase::Input)?;
        for o in 0..self.objects.len() {
            for s in 0..self.objects[o].sections.len() {
                if self.objects[o].sections[s].discarded {
                    continue;
                }
                let mut ctx = self.dyn_context();
                dynlink::check_relocs(&mut ctx, o, s)?;
            }
        }
        let mut ctx = self.dyn_context();
        dynlink::adjust_dynamic_symbols(&mut ctx)?;
        self.phase = Phase::Scanned;
        Ok(())
    }

    /// Pass B plus placement: size every dynamic section, then assign
    /// addresses and program segments starting at `base`.
    pub fn layout(&mut self, base: u32) -> Result<()> {
        self.expect_phase(Phase::Scanned)?;
        {
            let mut ctx = self.dyn_context();
            dynlink::size_dynamic_sections(&mut ctx)?;
        }

        if self.cfg.dynamic_sections() {
            self.dynamic_tags = alloc::vec![(DT_PLTGOT, 0), (DT_JMPREL, 0), (DT_PLTRELSZ, 0)];
        }

        fn align_to(value: u32, power: u8) -> u32 {
            let mask = (1u32 << power) - 1;
            (value + mask) & !mask
        }

        let mut vma = base;
        let text_start = vma;

        // Read-only, executable segment: code and read-only data first,
        // then the PLT, the relocation tables and the fixup array.
        for obj in self.objects.iter_mut() {
            for sec in obj.sections.iter_mut() {
                if sec.discarded || !sec.is_alloc() || sec.is_writable() || sec.is_tls() {
                    continue;
                }
                vma = align_to(vma, sec.align_power);
                sec.vma = vma;
                sec.segment = Some(0);
                vma += sec.size();
            }
        }
        if self.dynsec.plt.size() > 0 {
            vma = align_to(vma, 2);
            self.dynsec.plt.vma = vma;
            self.dynsec.plt.segment = Some(0);
            vma += self.dynsec.plt.size();
        }
        for rela in [
            &mut self.dynsec.rela_plt,
            &mut self.dynsec.rela_got,
            &mut self.dynsec.rela_funcdesc,
            &mut self.dynsec.rela_bss,
            &mut self.dynsec.rela_plt_unloaded,
        ] {
            if rela.reserved > 0 {
                vma = align_to(vma, 2);
                rela.vma = vma;
                vma += rela.size();
            }
        }
        if self.dynsec.rofixup.reserved > 0 {
            vma = align_to(vma, 2);
            self.dynsec.rofixup.vma = vma;
            vma += self.dynsec.rofixup.size();
        }
        let text_end = vma;

        // Writable segment on a fresh page: data, TLS template, GOT,
        // descriptors and the dynamic bookkeeping.
        vma = align_to(vma, 12);
        let data_start = vma;
        let mut tls: Option<TlsRegion> = None;
        for obj in self.objects.iter_mut() {
            for sec in obj.sections.iter_mut() {
                if sec.discarded || !sec.is_alloc() || !(sec.is_writable() || sec.is_tls()) {
                    continue;
                }
                vma = align_to(vma, sec.align_power);
                sec.vma = vma;
                sec.segment = Some(1);
                if sec.is_tls() {
                    match &mut tls {
                        None => {
                            tls = Some(TlsRegion {
                                base: vma,
                                align_power: sec.align_power,
                            })
                        }
                        Some(t) => t.align_power = t.align_power.max(sec.align_power),
                    }
                }
                vma += sec.size();
            }
        }
        for buf in [
            &mut self.dynsec.got,
            &mut self.dynsec.gotplt,
            &mut self.dynsec.funcdesc,
            &mut self.dynsec.dynbss,
        ] {
            if buf.size() > 0 {
                vma = align_to(vma, 2);
                buf.vma = vma;
                buf.segment = Some(1);
                vma += buf.size();
            }
        }
        if !self.dynamic_tags.is_empty() {
            vma = align_to(vma, 2);
            self.dynsec.dynamic_vma = vma;
            vma += (self.dynamic_tags.len() as u32 + 1) * 8;
        }
        let data_end = vma;

        // Everything else (debug info and friends) sits outside any
        // segment.
        for obj in self.objects.iter_mut() {
            for sec in obj.sections.iter_mut() {
                if sec.discarded || sec.is_alloc() {
                    continue;
                }
                vma = align_to(vma, sec.align_power);
                sec.vma = vma;
                vma += sec.size();
            }
        }

        self.segments = alloc::vec![
            Segment {
                start: text_start,
                end: text_end.max(text_start + 1),
                flags: PF_R | PF_X,
            },
            Segment {
                start: data_start,
                end: data_end.max(data_start + 1),
                flags: PF_R | PF_W,
            },
        ];
        self.dynsec.tls = tls;

        // FDPIC emits section-relative dynamic relocations; give every
        // placed section a dynamic symbol index.
        if self.cfg.is_fdpic() {
            for obj in self.objects.iter_mut() {
                for sec in obj.sections.iter_mut() {
                    if sec.is_alloc() && !sec.discarded {
                        sec.dynindx = Some(self.next_dynindx);
                        self.next_dynindx += 1;
                    }
                }
            }
            for buf in [&mut self.dynsec.funcdesc, &mut self.dynsec.got] {
                buf.dynindx = Some(self.next_dynindx);
                self.next_dynindx += 1;
            }
        }

        self.phase = Phase::Laid;
        Ok(())
    }

    /// Resolve every relocation against final addresses, patching the
    /// section contents and emitting dynamic relocations and fixups.
    pub fn relocate_all(&mut self) -> Result<()> {
        self.expect_phase(Phase::Laid)?;
        for o in 0..self.objects.len() {
            for s in 0..self.objects[o].sections.len() {
                let sec = &self.objects[o].sections[s];
                if sec.discarded || sec.relocs.is_empty() {
                    continue;
                }
                let mut contents = core::mem::take(&mut self.objects[o].sections[s].contents);
                let result = {
                    let mut ctx = ResolveContext {
                        cfg: &self.cfg,
                        objects: &self.objects,
                        globals: &self.globals,
                        states: &mut self.states,
                        locals: &mut self.locals,
                        dynsec: &mut self.dynsec,
                        segments: &self.segments,
                        output_flags: &mut self.output_flags,
                        plt_desc: self.plt_desc,
                    };
                    relocate_section(&mut ctx, o, s, &mut contents)
                };
                self.objects[o].sections[s].contents = contents;
                result?;
            }
        }
        self.phase = Phase::Relocated;
        Ok(())
    }

    /// Finalize PLT entries, reserved GOT words and dynamic tags, then
    /// verify the allocation ledger balances.
    pub fn finish(&mut self) -> Result<()> {
        self.expect_phase(Phase::Relocated)?;
        for id in 0..self.globals.len() {
            finish::finish_symbol(
                &self.cfg,
                &self.objects,
                &self.globals,
                &self.states,
                &mut self.dynsec,
                self.plt_desc,
                id,
            )?;
        }
        finish::finish_sections(
            &self.cfg,
            &mut self.dynsec,
            self.plt_desc,
            &mut self.dynamic_tags,
        )?;
        self.phase = Phase::Finished;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{InputSection, LocalSymbol};

    #[test]
    fn phases_enforce_order() {
        let mut linker = Linker::new(LinkConfig::default());
        assert!(matches!(
            linker.layout(0x1000),
            Err(Error::Phase { .. })
        ));
        assert!(matches!(linker.finish(), Err(Error::Phase { .. })));
    }

    #[test]
    fn dsp_and_fpu_objects_do_not_mix() {
        let mut linker = Linker::new(LinkConfig::default());
        let mut a = InputObject::new("dsp.o");
        a.e_flags = abi::EF_SH_DSP;
        let mut b = InputObject::new("fpu.o");
        b.e_flags = abi::EF_SH4;
        linker.add_object(a).unwrap();
        assert!(matches!(
            linker.add_object(b),
            Err(Error::IncompatibleFlags { .. })
        ));
    }

    #[test]
    fn layout_places_text_before_data() {
        let mut linker = Linker::new(LinkConfig::default());
        let mut obj = InputObject::new("a.o");
        let text = obj.add_section(InputSection::code(".text", alloc::vec![0; 32]));
        let data = obj.add_section(InputSection::data(".data", alloc::vec![0; 8]));
        obj.add_local(LocalSymbol::in_section("x", text, 0));
        let o = linker.add_object(obj).unwrap();
        linker.scan_relocations().unwrap();
        linker.layout(0x400000).unwrap();
        let obj = linker.object(o);
        assert_eq!(obj.sections[text].vma, 0x400000);
        assert_eq!(obj.sections[text].segment, Some(0));
        assert!(obj.sections[data].vma > obj.sections[text].vma);
        assert_eq!(obj.sections[data].segment, Some(1));
    }
}

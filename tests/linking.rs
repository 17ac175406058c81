use shlink::abi;
use shlink::dynlink::GotKind;
use shlink::object::{InputObject, InputSection, LocalSymbol, RelocEntry, SymbolRef};
use shlink::reloc::patch::{get_16, get_32, put_16, put_32};
use shlink::{Error, LinkConfig, Linker, OutputKind};

const E: abi::Endian = abi::Endian::Little;

const BASE: u32 = 0x0040_0000;

fn reloc(offset: u32, symbol: SymbolRef, r_type: u32, addend: i32) -> RelocEntry {
    RelocEntry::new(offset, symbol, r_type, addend)
}

/// A call site the relaxation engine can shorten:
///
/// ```text
/// 0:  mov.l  8f,r1        ! disp 1 -> pool at 8
/// 2:  jsr    @r1          ! R_SH_USES -6 (load is at 0)
/// 4:  nop
/// 6:  nop
/// 8:  .long  0            ! R_SH_DIR32 callee + R_SH_COUNT 1
/// ```
fn relaxable_caller(callee: SymbolRef) -> InputSection {
    let mut code = vec![0u8; 12];
    put_16(&mut code, 0, E, 0xd101); // mov.l @(4,pc),r1
    put_16(&mut code, 2, E, 0x410b); // jsr @r1
    put_16(&mut code, 4, E, abi::NOP_OPCODE);
    put_16(&mut code, 6, E, abi::NOP_OPCODE);

    let mut sec = InputSection::code(".text", code);
    sec.relocs = vec![
        reloc(2, callee, abi::R_SH_USES, -6),
        reloc(8, callee, abi::R_SH_DIR32, 0),
        reloc(8, callee, abi::R_SH_COUNT, 1),
    ];
    sec
}

#[test]
fn relaxation_shortens_in_range_call() {
    let mut linker = Linker::new(LinkConfig::default());

    let mut callee_obj = InputObject::new("a.o");
    let a_text = callee_obj.add_section(InputSection::code(".text", vec![0x09, 0x00, 0x0b, 0x00]));
    let a = linker.add_object(callee_obj).unwrap();
    let foo = linker.intern_symbol("foo");
    linker.define_symbol(foo, a, a_text, 0);

    let mut caller_obj = InputObject::new("b.o");
    let b_text = caller_obj.add_section(relaxable_caller(SymbolRef::Global(foo)));
    let b = linker.add_object(caller_obj).unwrap();

    // Provisional addresses: the callee lands about 0x100 before the
    // call site, well within the 12-bit branch range.
    linker.object_mut(a).sections[a_text].vma = BASE;
    linker.object_mut(b).sections[b_text].vma = BASE + 0x100;

    linker.relax().unwrap();

    {
        let sec = &linker.object(b).sections[b_text];
        // The register load (2 bytes) and the literal pool word (4
        // bytes) are both gone.
        assert_eq!(sec.size(), 6);
        // jsr @r1 became bsr, now at the shifted call site.
        assert_eq!(get_16(&sec.contents, 0, E) & 0xf000, abi::BSR_OPCODE);
        // The USES record turned into the branch relocation, addend -4.
        let ind12 = sec
            .relocs
            .iter()
            .find(|r| r.r_type == abi::R_SH_IND12W)
            .expect("converted branch reloc");
        assert_eq!(ind12.offset, 0);
        assert_eq!(ind12.addend, -4);
        assert_eq!(ind12.symbol, SymbolRef::Global(foo));
        // The pool's DIR32 and COUNT died with their bytes.
        assert!(sec.relocs.iter().all(|r| r.r_type != abi::R_SH_DIR32));
    }

    // Relaxing the already-relaxed output converts nothing further.
    linker.relax().unwrap();
    assert_eq!(linker.object(b).sections[b_text].size(), 6);

    linker.scan_relocations().unwrap();
    linker.layout(BASE).unwrap();
    linker.relocate_all().unwrap();
    linker.finish().unwrap();

    // The branch displacement reaches foo from the final addresses.
    let a_vma = linker.object(a).sections[a_text].vma;
    let b_vma = linker.object(b).sections[b_text].vma;
    let insn = get_16(&linker.object(b).sections[b_text].contents, 0, E);
    assert_eq!(insn & 0xf000, abi::BSR_OPCODE);
    let disp = ((insn & 0xfff) as i32) << 20 >> 20;
    assert_eq!(b_vma.wrapping_add(4).wrapping_add((disp * 2) as u32), a_vma);
}

#[test]
fn shared_literal_dies_only_when_count_drains() {
    let mut linker = Linker::new(LinkConfig::default());

    let mut obj = InputObject::new("a.o");
    // Two call sites share one literal, kept on a longword boundary by
    // an alignment marker; the pool survives the first conversion and
    // dies with the second.
    let mut code = vec![0u8; 16];
    put_16(&mut code, 0, E, 0xd102); // mov.l @(8,pc),r1 -> pool at 12
    put_16(&mut code, 2, E, 0x410b); // jsr @r1
    put_16(&mut code, 4, E, 0xd101); // mov.l @(4,pc),r1 -> pool at 12
    put_16(&mut code, 6, E, 0x410b); // jsr @r1
    put_16(&mut code, 8, E, abi::NOP_OPCODE);
    put_16(&mut code, 10, E, abi::NOP_OPCODE);
    let text = obj.add_section(InputSection::code(".text", code));
    let target = obj.add_section(InputSection::code(".text.f", vec![0x0b, 0x00, 0x09, 0x00]));
    let o = linker.add_object(obj).unwrap();
    let f = linker.intern_symbol("f");
    linker.define_symbol(f, o, target, 0);

    {
        let sec = &mut linker.object_mut(o).sections[text];
        // The later call site first, so its deletion cannot disturb the
        // other load's pc-relative displacement.
        sec.relocs = vec![
            reloc(6, SymbolRef::Global(f), abi::R_SH_USES, -6),
            reloc(2, SymbolRef::Global(f), abi::R_SH_USES, -6),
            reloc(12, SymbolRef::Global(f), abi::R_SH_DIR32, 0),
            reloc(12, SymbolRef::Global(f), abi::R_SH_COUNT, 2),
            reloc(12, SymbolRef::Global(f), abi::R_SH_ALIGN, 2),
        ];
        sec.vma = BASE;
    }
    linker.object_mut(o).sections[target].vma = BASE + 0x40;

    linker.relax().unwrap();

    let sec = &linker.object(o).sections[text];
    // Both call sites converted; both loads and the pool are gone.
    assert_eq!(sec.size(), 8);
    assert_eq!(
        sec.relocs
            .iter()
            .filter(|r| r.r_type == abi::R_SH_IND12W)
            .count(),
        2
    );
    assert_eq!(get_16(&sec.contents, 0, E) & 0xf000, abi::BSR_OPCODE);
    assert_eq!(get_16(&sec.contents, 2, E) & 0xf000, abi::BSR_OPCODE);
}

fn pic_config() -> LinkConfig {
    LinkConfig {
        output: OutputKind::SharedObject,
        dynamic: true,
        ..LinkConfig::default()
    }
}

/// A pc-relative GOT load plus its literal word.
fn got_user(sym: SymbolRef, r_type: u32) -> InputSection {
    let mut code = vec![0u8; 8];
    put_16(&mut code, 0, E, 0xd001); // mov.l @(4,pc),r0
    put_16(&mut code, 2, E, 0x000e); // mov.l @(r0,r12),r0
    let mut sec = InputSection::code(".text", code);
    sec.relocs = vec![reloc(4, sym, r_type, 0)];
    sec
}

#[test]
fn got32_against_shared_symbol_emits_glob_dat() {
    let mut linker = Linker::new(pic_config());
    let mut obj = InputObject::new("a.o");
    let text = obj.add_section(got_user(SymbolRef::Global(0), abi::R_SH_GOT32));
    let o = linker.add_object(obj).unwrap();
    let bar = linker.intern_symbol("bar");
    assert_eq!(bar, 0);
    linker.define_dynamic_symbol(bar, 0);

    linker.scan_relocations().unwrap();
    assert_eq!(linker.symbol_state(bar).got_refs, 1);
    assert_eq!(linker.symbol_state(bar).got_kind, GotKind::Normal);

    linker.layout(BASE).unwrap();
    linker.relocate_all().unwrap();
    linker.finish().unwrap();

    let dynsec = linker.dyn_sections();
    // Exactly one GOT slot and one dynamic relocation initializing it.
    assert_eq!(dynsec.got.size(), 4);
    assert_eq!(dynsec.rela_got.entries.len(), 1);
    let rela = dynsec.rela_got.entries[0];
    assert_eq!(rela.r_type, abi::R_SH_GLOB_DAT);
    assert_eq!(rela.offset, dynsec.got.vma);
    assert_eq!(Some(rela.sym), linker.global(bar).dynindx);

    // The instruction's literal holds the slot's GOT-relative address.
    let word = get_32(&linker.object(o).sections[text].contents, 4, E);
    assert_eq!(
        word,
        dynsec.got.vma.wrapping_sub(dynsec.gotplt.vma)
    );
}

#[test]
fn got32_against_local_symbol_emits_relative() {
    let mut linker = Linker::new(pic_config());
    let mut obj = InputObject::new("a.o");
    let data = obj.add_section(InputSection::data(".data", vec![0; 8]));
    let text = obj.add_section(got_user(SymbolRef::Local(0), abi::R_SH_GOT32));
    obj.add_local(LocalSymbol::in_section("x", data, 4));
    let o = linker.add_object(obj).unwrap();

    linker.scan_relocations().unwrap();
    linker.layout(BASE).unwrap();
    linker.relocate_all().unwrap();
    linker.finish().unwrap();

    let dynsec = linker.dyn_sections();
    assert_eq!(dynsec.rela_got.entries.len(), 1);
    let rela = dynsec.rela_got.entries[0];
    assert_eq!(rela.r_type, abi::R_SH_RELATIVE);
    let x_vma = linker.object(o).sections[data].vma + 4;
    assert_eq!(rela.addend, x_vma as i32);
    // The slot already holds the link-time address.
    assert_eq!(get_32(&dynsec.got.bytes, 0, E), x_vma);
}

#[test]
fn got_slot_is_initialized_exactly_once() {
    let mut linker = Linker::new(pic_config());
    let mut obj = InputObject::new("a.o");
    let data = obj.add_section(InputSection::data(".data", vec![0; 4]));
    obj.add_local(LocalSymbol::in_section("x", data, 0));

    // Two independent references to the same slot.
    let mut code = vec![0u8; 12];
    put_16(&mut code, 0, E, 0xd001);
    put_16(&mut code, 2, E, 0xd101);
    let mut sec = InputSection::code(".text", code);
    sec.relocs = vec![
        reloc(4, SymbolRef::Local(0), abi::R_SH_GOT32, 0),
        reloc(8, SymbolRef::Local(0), abi::R_SH_GOT32, 0),
    ];
    obj.add_section(sec);
    linker.add_object(obj).unwrap();

    linker.scan_relocations().unwrap();
    linker.layout(BASE).unwrap();
    linker.relocate_all().unwrap();
    linker.finish().unwrap();

    // One slot, one RELATIVE record despite two referencing relocations.
    let dynsec = linker.dyn_sections();
    assert_eq!(dynsec.got.size(), 4);
    assert_eq!(dynsec.rela_got.entries.len(), 1);
}

#[test]
fn plt_call_builds_stub_and_jmp_slot() {
    let mut linker = Linker::new(LinkConfig {
        dynamic: true,
        ..LinkConfig::default()
    });
    let mut obj = InputObject::new("a.o");
    let mut code = vec![0u8; 8];
    put_16(&mut code, 0, E, 0xd001); // mov.l @(4,pc),r0
    put_16(&mut code, 2, E, 0x400b); // jsr @r0
    let mut sec = InputSection::code(".text", code);
    sec.relocs = vec![reloc(4, SymbolRef::Global(0), abi::R_SH_PLT32, 0)];
    let text = obj.add_section(sec);
    let o = linker.add_object(obj).unwrap();
    let ext = linker.intern_symbol("ext_func");
    linker.define_dynamic_symbol(ext, 0);
    linker.global_mut(ext).st_type = elf::abi::STT_FUNC;

    linker.scan_relocations().unwrap();
    linker.layout(BASE).unwrap();
    linker.relocate_all().unwrap();
    linker.finish().unwrap();

    let dynsec = linker.dyn_sections();
    // PLT0 plus one 28-byte stub.
    assert_eq!(dynsec.plt.size(), 56);
    assert_eq!(dynsec.rela_plt.entries.len(), 1);
    let rela = dynsec.rela_plt.entries[0];
    assert_eq!(rela.r_type, abi::R_SH_JMP_SLOT);
    // The slot sits past the three reserved .got.plt words and points
    // at the entry's lazy resolver stub.
    assert_eq!(rela.offset, dynsec.gotplt.vma + 12);
    assert_eq!(
        get_32(&dynsec.gotplt.bytes, 12, E),
        dynsec.plt.vma + 28 + 8
    );

    // The literal resolves the pc-relative call to the stub.
    let pool_pc = linker.object(o).sections[text].vma + 4;
    let word = get_32(&linker.object(o).sections[text].contents, 4, E);
    assert_eq!(word, (dynsec.plt.vma + 28).wrapping_sub(pool_pc));

    // The address-dependent dynamic tags are final.
    let tags = linker.dynamic_tags();
    assert!(tags.contains(&(elf::abi::DT_PLTGOT, dynsec.gotplt.vma)));
    assert!(tags.contains(&(elf::abi::DT_JMPREL, dynsec.rela_plt.vma)));
    assert!(tags.contains(&(elf::abi::DT_PLTRELSZ, 12)));
}

#[test]
fn tls_gd_collapses_to_le_in_executable() {
    let mut linker = Linker::new(LinkConfig::default());
    let mut obj = InputObject::new("a.o");

    let mut code = vec![0u8; 20];
    put_16(&mut code, 0, E, 0xd403); // mov.l 1f,r4
    put_16(&mut code, 2, E, 0xc704); // mova 2f,r0
    put_16(&mut code, 4, E, 0xd105); // mov.l 2f,r1
    put_16(&mut code, 6, E, 0x310c); // add r0,r1
    put_16(&mut code, 8, E, 0x410b); // jsr @r1
    put_16(&mut code, 10, E, 0x34cc); // add r12,r4
    put_16(&mut code, 12, E, 0xa002); // bra 3f
    put_16(&mut code, 14, E, abi::NOP_OPCODE);
    let mut text = InputSection::code(".text", code);
    text.relocs = vec![reloc(16, SymbolRef::Global(0), abi::R_SH_TLS_GD_32, 0)];
    let text = obj.add_section(text);

    let mut tdata = InputSection::data(".tdata", vec![0u8; 16]);
    tdata.sh_flags |= elf::abi::SHF_TLS as u64;
    let tdata = obj.add_section(tdata);

    let o = linker.add_object(obj).unwrap();
    let tvar = linker.intern_symbol("tvar");
    linker.define_symbol(tvar, o, tdata, 4);

    linker.scan_relocations().unwrap();
    // The downgrade means no GOT slot at all.
    assert_eq!(linker.symbol_state(tvar).got_refs, 0);

    linker.layout(BASE).unwrap();
    linker.relocate_all().unwrap();
    linker.finish().unwrap();

    let sec = &linker.object(o).sections[text];
    // The documented local-exec sequence, word for word.
    assert_eq!(get_16(&sec.contents, 0, E), 0xd403);
    assert_eq!(get_16(&sec.contents, 2, E), 0x0012);
    assert_eq!(get_16(&sec.contents, 4, E), 0x304c);
    for off in [6, 8, 10] {
        assert_eq!(get_16(&sec.contents, off, E), abi::NOP_OPCODE);
    }
    // The literal now holds the thread-pointer offset: symbol offset
    // plus the two-pointer TCB rounded to the template alignment.
    assert_eq!(get_32(&sec.contents, 16, E), 4 + 8);
}

fn fdpic_config() -> LinkConfig {
    LinkConfig {
        abi: shlink::linker::Abi::Fdpic,
        dynamic: true,
        output: OutputKind::Executable,
        ..LinkConfig::default()
    }
}

#[test]
fn funcdesc_with_addend_is_rejected() {
    let mut linker = Linker::new(fdpic_config());
    let mut obj = InputObject::new("a.o");
    let mut data = InputSection::data(".data", vec![0; 4]);
    data.relocs = vec![reloc(0, SymbolRef::Global(0), abi::R_SH_FUNCDESC, 8)];
    obj.add_section(data);
    let f = obj.add_section(InputSection::code(".text.baz", vec![0x0b, 0x00, 0x09, 0x00]));
    let o = linker.add_object(obj).unwrap();
    let baz = linker.intern_symbol("baz");
    linker.define_symbol(baz, o, f, 0);

    // The link dies during scanning, before any output exists.
    let err = linker.scan_relocations().unwrap_err();
    assert!(matches!(err, Error::FuncDescAddend { .. }));
    assert_eq!(linker.dyn_sections().funcdesc.size(), 0);
}

#[test]
fn mixed_normal_and_funcdesc_access_is_rejected() {
    let mut linker = Linker::new(fdpic_config());
    let mut obj = InputObject::new("a.o");
    let mut code = vec![0u8; 12];
    put_16(&mut code, 0, E, 0xd001);
    put_16(&mut code, 2, E, 0xd101);
    let mut sec = InputSection::code(".text", code);
    sec.relocs = vec![
        reloc(4, SymbolRef::Global(0), abi::R_SH_GOTFUNCDESC, 0),
        reloc(8, SymbolRef::Global(0), abi::R_SH_GOT32, 0),
    ];
    obj.add_section(sec);
    let f = obj.add_section(InputSection::code(".text.g", vec![0x0b, 0x00, 0x09, 0x00]));
    let o = linker.add_object(obj).unwrap();
    let g = linker.intern_symbol("g");
    linker.define_symbol(g, o, f, 0);

    let err = linker.scan_relocations().unwrap_err();
    match err {
        Error::GotTypeConflict { message, .. } => {
            assert_eq!(message, "accessed both as normal and FDPIC symbol");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn fdpic_static_funcdesc_gets_fixups_and_terminator() {
    let mut linker = Linker::new(LinkConfig {
        abi: shlink::linker::Abi::Fdpic,
        dynamic: false,
        ..LinkConfig::default()
    });
    let mut obj = InputObject::new("a.o");
    let mut data = InputSection::data(".data", vec![0; 4]);
    data.relocs = vec![reloc(0, SymbolRef::Global(0), abi::R_SH_FUNCDESC, 0)];
    obj.add_section(data);
    let f = obj.add_section(InputSection::code(".text.h", vec![0x0b, 0x00, 0x09, 0x00]));
    let o = linker.add_object(obj).unwrap();
    let h = linker.intern_symbol("h");
    linker.define_symbol(h, o, f, 0);

    linker.scan_relocations().unwrap();
    linker.layout(BASE).unwrap();
    linker.relocate_all().unwrap();
    linker.finish().unwrap();

    let dynsec = linker.dyn_sections();
    // One eight-byte descriptor: function address plus GOT pointer.
    assert_eq!(dynsec.funcdesc.size(), 8);
    let fn_vma = linker.object(o).sections[f].vma;
    assert_eq!(get_32(&dynsec.funcdesc.bytes, 0, E), fn_vma);

    // Fixups: the descriptor's two words, the referencing data word,
    // and the terminating GOT self-pointer.
    assert_eq!(dynsec.rofixup.entries.len(), 4);
    assert_eq!(
        *dynsec.rofixup.entries.last().unwrap(),
        dynsec.gotplt.vma + dynsec.got_anchor
    );

    // The data word holds the descriptor's address.
    let word = get_32(&linker.object(o).sections[0].contents, 0, E);
    assert_eq!(word, dynsec.funcdesc.vma);
}

#[test]
fn undefined_symbol_policy_is_callers_choice() {
    let build = |policy| {
        let mut linker = Linker::new(LinkConfig {
            unresolved: policy,
            ..LinkConfig::default()
        });
        let mut obj = InputObject::new("a.o");
        let mut data = InputSection::data(".data", vec![0; 4]);
        data.relocs = vec![reloc(0, SymbolRef::Global(0), abi::R_SH_DIR32, 0)];
        obj.add_section(data);
        linker.add_object(obj).unwrap();
        linker.intern_symbol("missing");
        linker.scan_relocations().unwrap();
        linker.layout(BASE).unwrap();
        linker.relocate_all()
    };

    assert!(build(shlink::UnresolvedPolicy::Ignore).is_ok());
    let err = build(shlink::UnresolvedPolicy::Error).unwrap_err();
    assert!(matches!(err, Error::Undefined { .. }));
}

#[test]
fn discarded_section_references_are_zeroed() {
    let mut linker = Linker::new(LinkConfig::default());
    let mut obj = InputObject::new("a.o");
    let dead = obj.add_section(InputSection::code(".text.dead", vec![0; 4]));
    obj.sections[dead].discarded = true;
    obj.add_local(LocalSymbol::in_section("gone", dead, 0));

    let mut data = InputSection::data(".data", vec![0xff; 4]);
    data.relocs = vec![reloc(0, SymbolRef::Local(0), abi::R_SH_DIR32, 0)];
    obj.add_section(data);
    let o = linker.add_object(obj).unwrap();

    linker.scan_relocations().unwrap();
    linker.layout(BASE).unwrap();
    linker.relocate_all().unwrap();
    linker.finish().unwrap();

    assert_eq!(get_32(&linker.object(o).sections[1].contents, 0, E), 0);
}

#[test]
fn delete_bytes_keeps_following_relocations_consistent() {
    // A switch-style delta across a deleted range: the record's addend
    // and the stored delta both shrink with the hole.
    let mut linker = Linker::new(LinkConfig::default());
    let mut obj = InputObject::new("a.o");

    let mut code = vec![0u8; 20];
    put_16(&mut code, 0, E, 0xd102); // mov.l @(8,pc),r1 -> pool at 12
    put_16(&mut code, 2, E, 0x410b); // jsr @r1
    put_16(&mut code, 4, E, abi::NOP_OPCODE);
    put_16(&mut code, 6, E, abi::NOP_OPCODE);
    put_16(&mut code, 8, E, abi::NOP_OPCODE);
    put_16(&mut code, 10, E, abi::NOP_OPCODE);
    // 12: literal pool (4 bytes), 16: a word datum.
    put_32(&mut code, 16, E, 0);

    let mut sec = InputSection::code(".text", code);
    sec.relocs = vec![
        reloc(2, SymbolRef::Local(0), abi::R_SH_USES, -6),
        reloc(12, SymbolRef::Local(0), abi::R_SH_DIR32, 0),
        reloc(12, SymbolRef::Local(0), abi::R_SH_COUNT, 1),
        reloc(16, SymbolRef::Local(1), abi::R_SH_DIR32, 0),
    ];
    let text = obj.add_section(sec);
    obj.add_local(LocalSymbol::in_section("callee", text, 8));
    obj.add_local(LocalSymbol::in_section("datum", text, 16));
    let o = linker.add_object(obj).unwrap();
    linker.object_mut(o).sections[text].vma = BASE;

    linker.relax().unwrap();

    let sec = &linker.object(o).sections[text];
    assert_eq!(sec.size(), 14);
    // The callee symbol moved down with the deleted load; the datum
    // moved down by the load and the pool.
    assert_eq!(linker.object(o).locals[0].value, 6);
    assert_eq!(linker.object(o).locals[1].value, 10);
    // The trailing DIR32's site shifted by the full six bytes.
    assert!(
        sec.relocs
            .iter()
            .any(|r| r.offset == 10 && r.r_type == abi::R_SH_DIR32)
    );
}

// Checks on the resource table that must hold whatever sequence of placements the allocator
// goes through: a pinned resource is never handed out or stolen, every occupied register or
// frame slot is held by a member of its owner's buddy ring, and stealing a value's only copy
// moves it somewhere else instead of losing it. The context is wired up by hand the way
// Compiler::compile does it, so these tests reach the allocator without going through events.

//! Resource table invariants under add, steal and freeze.

use bumpalo::Bump;

use sitealloc::arch::{Architecture, Client, TernaryOp, ThunkOp};
use sitealloc::core::value::ReadKind;
use sitealloc::core::{
    AllocatorConfig, CompilationSession, CompileError, Compiler, Context, EventGraph, FrameHome,
    FrameLayout, PromiseTable, ResourceId, Site, SiteMask, ValueId, ValueTable, ValueType,
};
use sitealloc::trace::TraceAssembler;
use sitealloc::x86::{X86Architecture, X86Assembler};

fn with_context<R>(f: impl FnOnce(&mut Context<'_, '_>) -> R) -> R {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X86Architecture::x86_64();
    let mut values = ValueTable::new();
    let mut events = EventGraph::new();
    let mut promises = PromiseTable::new();
    let mut asm = TraceAssembler::new(X86Assembler::new(&arch).unwrap());
    let layout = FrameLayout::new(arch.stack_register(), arch.word_size(), 1, 2, 0, 0, 4, 4, 0);
    let mut context = Context::new(
        &arch,
        &session,
        AllocatorConfig::default(),
        &mut values,
        &mut events,
        &mut promises,
        layout,
        &mut asm,
    );
    f(&mut context)
}

/// A value that is still wanted somewhere later.
fn live_value(c: &mut Context<'_, '_>) -> ValueId {
    let v = c.values.create(ValueType::Integer, 8);
    c.values.append_read(v, ReadKind::Single { mask: SiteMask::any() }, None);
    v
}

fn assert_single_occupancy(c: &Context<'_, '_>) {
    for (resource, owner) in c.registers.occupied() {
        let held = c
            .values
            .ring_sites(owner)
            .iter()
            .any(|(_, site)| c.resource_of(site) == Some(resource));
        assert!(held, "{resource} owned by {owner} which holds no matching site");
    }
    for value in c.values.ids() {
        for site in &c.values.get(value).sites {
            if let Some(resource) = c.resource_of(site) {
                let owner = c.registers.owner(resource);
                assert!(
                    owner.is_some_and(|o| c.values.is_buddy(o, value)),
                    "{value} holds {site} but {resource} belongs to {owner:?}"
                );
            }
        }
    }
}

#[test]
fn test_pinned_register_is_never_handed_out() {
    let _ = env_logger::builder().is_test(true).try_init();
    with_context(|c| {
        let holder = live_value(c);
        c.add_site(holder, Site::Register(0)).unwrap();
        c.freeze(Site::Register(0)).unwrap();

        let v = live_value(c);
        let err = c
            .pick_target(v, SiteMask::fixed_register(0), None, 0, &[])
            .unwrap_err();
        assert!(matches!(err, CompileError::NoSiteAvailable { .. }), "{err}");

        let err = c.add_site(v, Site::Register(0)).unwrap_err();
        assert!(matches!(err, CompileError::PinnedResource { .. }), "{err}");
        assert_eq!(c.registers.owner(ResourceId::Register(0)), Some(holder));

        c.thaw(Site::Register(0)).unwrap();
        c.add_site(v, Site::Register(0)).unwrap();
        assert_eq!(c.registers.owner(ResourceId::Register(0)), Some(v));
        assert_eq!(c.registers.total_freezes(), 0);
    });
}

#[test]
fn test_steals_keep_single_occupancy() {
    let _ = env_logger::builder().is_test(true).try_init();
    with_context(|c| {
        let values: Vec<ValueId> = (0..6).map(|_| live_value(c)).collect();
        for (i, v) in values.iter().enumerate() {
            c.add_site(*v, Site::Register((i % 3) as u8)).unwrap();
            assert_single_occupancy(c);
        }
        // Every value still has somewhere to live.
        for v in &values {
            assert!(!c.values.get(*v).sites.is_empty(), "{v} lost its only copy");
        }

        let alias = c.values.create(ValueType::Integer, 8);
        c.values.add_buddy(values[5], alias);
        c.add_site(alias, Site::Register(2)).unwrap();
        assert_single_occupancy(c);
        assert_eq!(c.registers.total_freezes(), 0);
    });
}

#[test]
fn test_stolen_copy_is_dropped_when_another_remains() {
    with_context(|c| {
        let v = live_value(c);
        c.add_site(v, Site::Register(1)).unwrap();
        let slot = c.layout.home_site(FrameHome::Local(0));
        c.add_site(v, slot).unwrap();

        let thief = live_value(c);
        c.add_site(thief, Site::Register(1)).unwrap();
        assert_eq!(c.values.get(v).sites, vec![slot]);
        assert_eq!(c.values.get(thief).sites, vec![Site::Register(1)]);
        assert_single_occupancy(c);
    });
}

struct NoHelpers;

impl Client for NoHelpers {
    fn thunk(&self, _op: ThunkOp, _result_size: u32) -> i64 {
        0x2000
    }
}

#[test]
fn test_register_pressure_spills_to_frame() {
    let _ = env_logger::builder().is_test(true).try_init();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X86Architecture::x86();
    let mut c = Compiler::new(&session, &arch, &NoHelpers, AllocatorConfig::default());

    // More live sums than 32-bit x86 has registers.
    c.init(1, 2, 2).unwrap();
    c.start_logical_ip(0).unwrap();
    let a = c.init_local(4, 0, ValueType::Integer).unwrap();
    let b = c.init_local(4, 1, ValueType::Integer).unwrap();
    for k in 0..9 {
        let k = c.constant(4, k);
        let sum = c.binary_op(TernaryOp::Add, 4, k, a).unwrap();
        c.push(4, sum).unwrap();
    }
    let mut total = b;
    for _ in 0..9 {
        let top = c.pop(4).unwrap();
        total = c.binary_op(TernaryOp::Add, 4, top, total).unwrap();
    }
    c.return_(4, Some(total)).unwrap();

    let mut asm = TraceAssembler::new(X86Assembler::new(&arch).unwrap());
    let length = c.compile(&mut asm).unwrap();
    let mut out = vec![0; length];
    c.write(&mut asm, 0x1000, &mut out).unwrap();
    assert_eq!(out.last(), Some(&0xc3));
    assert!(c.stats().moves_inserted > 0);
}

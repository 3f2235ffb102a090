// These tests drive the public Compiler API through control flow merges on x86-64 and check
// the operations recorded by TraceAssembler. The first unit merges two paths that hold the
// same frame slot in different places (a register on one path, the caller's parameter slot
// on the other): the table agreed when the first edge is resolved keeps the register, so the
// edge arriving with the value in the frame is the only one that moves anything, and the
// second edge reuses the table instead of building another. The second unit is a counting
// loop whose back edge arrives with every slot already where the header's table expects it,
// and whose exit is entered out of sequence through a snapshot. The remaining units cover a
// junction reached from three edges, a branch whose taken and fall-through targets both need
// tables (the second table must reuse the first's site for the slot they share) and a jump
// that no path links to its target.

//! Junction resolution through the front end API.

use bumpalo::Bump;

use sitealloc::arch::{BranchOp, Client, TernaryOp, ThunkOp};
use sitealloc::core::{AllocatorConfig, CompilationSession, CompileError, Compiler, ValueType};
use sitealloc::trace::TraceAssembler;
use sitealloc::x86::{X86Architecture, X86Assembler};

struct NoHelpers;

impl Client for NoHelpers {
    fn thunk(&self, _op: ThunkOp, _result_size: u32) -> i64 {
        0
    }
}

fn position(lines: &[String], prefix: &str) -> usize {
    lines
        .iter()
        .position(|l| l.starts_with(prefix))
        .unwrap_or_else(|| panic!("no line starting with {prefix:?} in {lines:#?}"))
}

fn moves(lines: &[String]) -> Vec<&String> {
    lines.iter().filter(|l| l.starts_with("Move ")).collect()
}

#[test]
fn test_merge_moves_only_on_the_disagreeing_edge() {
    let _ = env_logger::builder().is_test(true).try_init();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X86Architecture::x86_64();
    let mut c = Compiler::new(&session, &arch, &NoHelpers, AllocatorConfig::default());

    // Seven parameters: the first six arrive in registers, the last in the frame.
    c.init(3, 7, 7).unwrap();
    c.start_logical_ip(0).unwrap();
    let first = c.init_local(8, 0, ValueType::Integer).unwrap();
    c.init_local(8, 6, ValueType::Integer).unwrap();
    let zero = c.constant(8, 0);
    let join = c.machine_ip(2);
    c.cond_jump(BranchOp::JumpIfEqual, 8, zero, first, join).unwrap();
    let fork = c.save_state();

    // Fall-through path: local 0 takes the frame-passed parameter.
    c.start_logical_ip(1).unwrap();
    let last = c.load_local(8, 6).unwrap();
    c.store_local(8, last, 0).unwrap();
    c.jmp(join).unwrap();

    c.start_logical_ip(2).unwrap();
    let x = c.load_local(8, 0).unwrap();
    let y = c.load_local(8, 6).unwrap();
    let sum = c.binary_op(TernaryOp::Add, 8, y, x).unwrap();
    c.return_(8, Some(sum)).unwrap();

    // Taken path: local 0 still holds the first parameter.
    c.restore_state(&fork);
    c.visit_logical_ip(2).unwrap();

    let mut asm = TraceAssembler::new(X86Assembler::new(&arch).unwrap());
    let length = c.compile(&mut asm).unwrap();
    let lines = asm.lines().to_vec();

    let branch = position(&lines, "JumpIfEqual");
    let jump = position(&lines, "Jump #");
    assert!(
        moves(&lines[..branch]).is_empty(),
        "taken edge should need no moves: {lines:#?}"
    );
    let fall_through = moves(&lines[branch + 1..jump]);
    assert_eq!(fall_through.len(), 1, "{lines:#?}");
    assert!(fall_through[0].ends_with("-> r7/8"), "{lines:#?}");

    assert_eq!(c.stats().junctions_resolved, 1);
    let mut out = vec![0; length];
    c.write(&mut asm, 0x40_0000, &mut out).unwrap();
}

#[test]
fn test_loop_back_edge_arrives_in_place() {
    let _ = env_logger::builder().is_test(true).try_init();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X86Architecture::x86_64();
    let config = AllocatorConfig::default().with_loop_header_alignment(Some(16));
    let mut c = Compiler::new(&session, &arch, &NoHelpers, config);

    c.init(4, 1, 2).unwrap();
    c.start_logical_ip(0).unwrap();
    c.init_local(8, 0, ValueType::Integer).unwrap();
    let zero = c.constant(8, 0);
    c.store_local(8, zero, 1).unwrap();

    c.start_logical_ip(1).unwrap();
    let n = c.load_local(8, 0).unwrap();
    let zero = c.constant(8, 0);
    let exit = c.machine_ip(3);
    c.cond_jump(BranchOp::JumpIfLessOrEqual, 8, zero, n, exit).unwrap();
    let fork = c.save_state();

    c.start_logical_ip(2).unwrap();
    let n = c.load_local(8, 0).unwrap();
    let total = c.load_local(8, 1).unwrap();
    let total = c.binary_op(TernaryOp::Add, 8, n, total).unwrap();
    c.store_local(8, total, 1).unwrap();
    let one = c.constant(8, 1);
    let n = c.binary_op(TernaryOp::Subtract, 8, one, n).unwrap();
    c.store_local(8, n, 0).unwrap();
    let header = c.machine_ip(1);
    c.jmp(header).unwrap();
    c.visit_logical_ip(1).unwrap();

    c.restore_state(&fork);
    c.start_logical_ip(3).unwrap();
    let total = c.load_local(8, 1).unwrap();
    c.return_(8, Some(total)).unwrap();

    let mut asm = TraceAssembler::new(X86Assembler::new(&arch).unwrap());
    let length = c.compile(&mut asm).unwrap();
    let lines = asm.lines().to_vec();

    let jump = position(&lines, "Jump #");
    assert!(
        lines[jump - 1].starts_with("Subtract"),
        "back edge should need no moves: {lines:#?}"
    );
    assert_eq!(lines.last().map(String::as_str), Some("Return"));

    let stats = c.stats();
    assert_eq!(stats.junctions_resolved, 1);
    assert_eq!(stats.snapshots_restored, 1);

    let layout = c.code_layout().unwrap();
    assert_eq!(layout.block_starts.len(), 3);
    assert_eq!(layout.block_starts[1] % 16, 0);

    let mut out = vec![0; length];
    c.write(&mut asm, 0x1000, &mut out).unwrap();
    assert_eq!(out[length - 1], 0xc3);
}

#[test]
fn test_visit_before_start_is_rejected() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X86Architecture::x86_64();
    let mut c = Compiler::new(&session, &arch, &NoHelpers, AllocatorConfig::default());
    c.init(2, 0, 0).unwrap();
    c.start_logical_ip(0).unwrap();
    assert!(c.visit_logical_ip(1).is_err());
}

#[test]
fn test_three_edges_share_one_table() {
    let _ = env_logger::builder().is_test(true).try_init();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X86Architecture::x86_64();
    let mut c = Compiler::new(&session, &arch, &NoHelpers, AllocatorConfig::default());

    c.init(4, 2, 2).unwrap();
    c.start_logical_ip(0).unwrap();
    let a = c.init_local(8, 0, ValueType::Integer).unwrap();
    c.init_local(8, 1, ValueType::Integer).unwrap();
    let zero = c.constant(8, 0);
    let join = c.machine_ip(3);
    c.cond_jump(BranchOp::JumpIfEqual, 8, zero, a, join).unwrap();
    let first = c.save_state();

    c.start_logical_ip(1).unwrap();
    let b = c.load_local(8, 1).unwrap();
    c.store_local(8, b, 0).unwrap();
    let zero = c.constant(8, 0);
    c.cond_jump(BranchOp::JumpIfEqual, 8, zero, b, join).unwrap();
    let second = c.save_state();

    c.start_logical_ip(2).unwrap();
    let x = c.load_local(8, 0).unwrap();
    let y = c.load_local(8, 1).unwrap();
    let sum = c.binary_op(TernaryOp::Add, 8, y, x).unwrap();
    c.store_local(8, sum, 0).unwrap();
    c.jmp(join).unwrap();

    c.start_logical_ip(3).unwrap();
    let result = c.load_local(8, 0).unwrap();
    c.return_(8, Some(result)).unwrap();

    c.restore_state(&second);
    c.visit_logical_ip(3).unwrap();
    c.restore_state(&first);
    c.visit_logical_ip(3).unwrap();

    let mut asm = TraceAssembler::new(X86Assembler::new(&arch).unwrap());
    let length = c.compile(&mut asm).unwrap();
    let lines = asm.lines().to_vec();
    assert_eq!(lines.iter().filter(|l| l.starts_with("JumpIfEqual")).count(), 2);
    assert_eq!(lines.last().map(String::as_str), Some("Return"));

    let stats = c.stats();
    assert_eq!(stats.junctions_resolved, 1);
    assert_eq!(stats.snapshots_restored, 0);

    let mut out = vec![0; length];
    c.write(&mut asm, 0x1000, &mut out).unwrap();
    assert_eq!(out[length - 1], 0xc3);
}

#[test]
fn test_sibling_tables_agree_on_shared_slot() {
    let _ = env_logger::builder().is_test(true).try_init();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X86Architecture::x86_64();
    let mut c = Compiler::new(&session, &arch, &NoHelpers, AllocatorConfig::default());

    c.init(4, 1, 2).unwrap();
    c.start_logical_ip(0).unwrap();
    c.init_local(8, 0, ValueType::Integer).unwrap();
    let zero = c.constant(8, 0);
    c.store_local(8, zero, 1).unwrap();
    let n = c.load_local(8, 0).unwrap();
    let zero = c.constant(8, 0);
    let exit = c.machine_ip(3);
    // Falls into the loop header, jumps to the exit: both need tables.
    c.cond_jump(BranchOp::JumpIfLessOrEqual, 8, zero, n, exit).unwrap();
    let skip_loop = c.save_state();

    c.start_logical_ip(1).unwrap();
    let n = c.load_local(8, 0).unwrap();
    let total = c.load_local(8, 1).unwrap();
    let total = c.binary_op(TernaryOp::Add, 8, n, total).unwrap();
    c.store_local(8, total, 1).unwrap();
    let one = c.constant(8, 1);
    let n = c.binary_op(TernaryOp::Subtract, 8, one, n).unwrap();
    c.store_local(8, n, 0).unwrap();
    let zero = c.constant(8, 0);
    let header = c.machine_ip(1);
    c.cond_jump(BranchOp::JumpIfGreater, 8, zero, n, header).unwrap();
    let repeat = c.save_state();

    c.start_logical_ip(2).unwrap();
    c.start_logical_ip(3).unwrap();
    let total = c.load_local(8, 1).unwrap();
    c.return_(8, Some(total)).unwrap();

    c.restore_state(&repeat);
    c.visit_logical_ip(1).unwrap();
    c.restore_state(&skip_loop);
    c.visit_logical_ip(3).unwrap();

    let mut asm = TraceAssembler::new(X86Assembler::new(&arch).unwrap());
    let length = c.compile(&mut asm).unwrap();
    let lines = asm.lines().to_vec();

    // The back edge already left the running total where the exit expects it.
    let back = lines
        .iter()
        .rposition(|l| l.starts_with("JumpIfGreater"))
        .unwrap();
    let exit_moves = moves(&lines[back + 1..]);
    assert!(
        exit_moves.iter().all(|m| m.ends_with("-> r0/8")),
        "{lines:#?}"
    );

    let stats = c.stats();
    assert_eq!(stats.junctions_resolved, 2);
    assert_eq!(stats.snapshots_restored, 0);

    let mut out = vec![0; length];
    c.write(&mut asm, 0x1000, &mut out).unwrap();
    assert_eq!(out[length - 1], 0xc3);
}

#[test]
fn test_jump_without_linked_target_is_rejected() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X86Architecture::x86_64();
    let mut c = Compiler::new(&session, &arch, &NoHelpers, AllocatorConfig::default());

    c.init(3, 1, 1).unwrap();
    c.start_logical_ip(0).unwrap();
    c.init_local(8, 0, ValueType::Integer).unwrap();
    let end = c.machine_ip(2);
    c.jmp(end).unwrap();
    // The path continues into 1, never into 2.
    c.start_logical_ip(1).unwrap();
    c.start_logical_ip(2).unwrap();
    let x = c.load_local(8, 0).unwrap();
    c.return_(8, Some(x)).unwrap();

    let mut asm = X86Assembler::new(&arch).unwrap();
    let err = c.compile(&mut asm).unwrap_err();
    assert!(matches!(err, CompileError::InvalidState { .. }), "{err}");
}

// Two-word values on 32-bit x86. A wide add keeps both halves in a register pair; narrowing
// the sum to one word hands the low half on and leaves the high register unused from then on.
// A wide multiply has no inline form, so the compiler turns it into a call to a helper that
// the client supplies, with the operands passed word by word through the outgoing area.

//! Wide values and helper calls on 32-bit x86.

use bumpalo::Bump;

use sitealloc::arch::{Client, TernaryOp, ThunkOp};
use sitealloc::core::{AllocatorConfig, CompilationSession, Compiler, ValueType};
use sitealloc::trace::TraceAssembler;
use sitealloc::x86::{X86Architecture, X86Assembler};

struct FixedHelper(i64);

impl Client for FixedHelper {
    fn thunk(&self, _op: ThunkOp, _result_size: u32) -> i64 {
        self.0
    }
}

/// Register names mentioned on a trace line.
fn registers(line: &str) -> Vec<&str> {
    line.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| {
            token.len() > 1
                && token.starts_with('r')
                && token[1..].chars().all(|c| c.is_ascii_digit())
        })
        .collect()
}

#[test]
fn test_narrowed_sum_releases_high_half() {
    let _ = env_logger::builder().is_test(true).try_init();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X86Architecture::x86();
    let mut c = Compiler::new(&session, &arch, &FixedHelper(0), AllocatorConfig::default());

    c.init(1, 4, 4).unwrap();
    c.start_logical_ip(0).unwrap();
    let a = c.init_local(8, 0, ValueType::Integer).unwrap();
    let b = c.init_local(8, 2, ValueType::Integer).unwrap();
    let sum = c.binary_op(TernaryOp::Add, 8, a, b).unwrap();
    let low = c.load(8, sum, 4).unwrap();
    c.return_(4, Some(low)).unwrap();

    let mut asm = TraceAssembler::new(X86Assembler::new(&arch).unwrap());
    let length = c.compile(&mut asm).unwrap();
    let lines = asm.lines().to_vec();

    let add = lines
        .iter()
        .position(|l| l.starts_with("Add "))
        .unwrap_or_else(|| panic!("no Add in {lines:#?}"));
    let target = lines[add]
        .rsplit("-> ")
        .next()
        .and_then(|t| t.strip_suffix("/8"))
        .unwrap();
    let (high, low_register) = target
        .split_once(':')
        .unwrap_or_else(|| panic!("sum should live in a register pair: {}", lines[add]));

    for line in &lines[add + 1..] {
        assert!(
            !registers(line).contains(&high),
            "high half {high} still in use: {lines:#?}"
        );
    }
    assert!(
        low_register == "r0"
            || lines[add + 1..]
                .iter()
                .any(|l| l.starts_with("Move ") && l.ends_with("-> r0/4")),
        "low half should reach r0: {lines:#?}"
    );
    assert_eq!(lines.last().map(String::as_str), Some("Return"));

    let mut out = vec![0; length];
    c.write(&mut asm, 0x1000, &mut out).unwrap();
}

#[test]
fn test_wide_multiply_calls_helper() {
    let _ = env_logger::builder().is_test(true).try_init();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X86Architecture::x86();
    let mut c = Compiler::new(
        &session,
        &arch,
        &FixedHelper(0x1000),
        AllocatorConfig::default(),
    );

    c.init(1, 0, 0).unwrap();
    c.start_logical_ip(0).unwrap();
    let three = c.constant(8, 3);
    let four = c.constant(8, 4);
    let product = c.binary_op(TernaryOp::Multiply, 8, three, four).unwrap();
    c.return_(8, Some(product)).unwrap();

    let mut asm = TraceAssembler::new(X86Assembler::new(&arch).unwrap());
    let length = c.compile(&mut asm).unwrap();
    let lines = asm.lines().to_vec();

    let call = lines
        .iter()
        .position(|l| l.starts_with("Call "))
        .unwrap_or_else(|| panic!("no Call in {lines:#?}"));
    assert_eq!(lines[call], "Call #4096/4");

    // Arguments are passed in reverse: the second operand's words come first.
    let before: Vec<&str> = lines[..call].iter().map(String::as_str).collect();
    for expected in [
        "Move #4/4 -> [r4+0]/4",
        "Move #0/4 -> [r4+4]/4",
        "Move #3/4 -> [r4+8]/4",
        "Move #0/4 -> [r4+12]/4",
    ] {
        assert!(before.contains(&expected), "missing {expected:?} in {lines:#?}");
    }
    assert_eq!(c.stats().thunks_used, 1);

    let mut out = vec![0; length];
    c.write(&mut asm, 0, &mut out).unwrap();
    assert_eq!(out.last(), Some(&0xc3));
}

#[test]
fn test_wide_constant_splits_into_words() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X86Architecture::x86();
    let mut c = Compiler::new(&session, &arch, &FixedHelper(0), AllocatorConfig::default());

    c.init(1, 0, 0).unwrap();
    c.start_logical_ip(0).unwrap();
    let value = c.constant(8, 0x1_0000_0002);
    c.return_(8, Some(value)).unwrap();

    let mut asm = TraceAssembler::new(X86Assembler::new(&arch).unwrap());
    c.compile(&mut asm).unwrap();
    let lines = asm.lines().join("\n");
    assert!(lines.contains("#2/4"), "{lines}");
    assert!(lines.contains("#1/4"), "{lines}");
}

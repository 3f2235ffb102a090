// End-to-end output checks on x86-64: the machine code produced for a small unit, the ELF
// object wrapping it, the errors write reports for a short buffer or an unresolved promise,
// and where the constant pool lands for a given base address.

//! Final bytes and object output.

use bumpalo::Bump;
use object::{Object, ObjectSection, ObjectSymbol};

use sitealloc::arch::{Client, TernaryOp, ThunkOp};
use sitealloc::core::{AllocatorConfig, CompilationSession, CompileError, Compiler, ValueType};
use sitealloc::object_file::write_elf;
use sitealloc::x86::{X86Architecture, X86Assembler};

struct NoHelpers;

impl Client for NoHelpers {
    fn thunk(&self, _op: ThunkOp, _result_size: u32) -> i64 {
        0
    }
}

fn build_sum(c: &mut Compiler<'_>) {
    c.init(1, 2, 2).unwrap();
    c.start_logical_ip(0).unwrap();
    let a = c.init_local(8, 0, ValueType::Integer).unwrap();
    let b = c.init_local(8, 1, ValueType::Integer).unwrap();
    let sum = c.binary_op(TernaryOp::Add, 8, a, b).unwrap();
    c.return_(8, Some(sum)).unwrap();
}

#[test]
fn test_sum_bytes() {
    let _ = env_logger::builder().is_test(true).try_init();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X86Architecture::x86_64();
    let mut c = Compiler::new(&session, &arch, &NoHelpers, AllocatorConfig::default());
    build_sum(&mut c);

    let mut asm = X86Assembler::new(&arch).unwrap();
    let length = c.compile(&mut asm).unwrap();
    let mut code = vec![0; length];
    c.write(&mut asm, 0x1000, &mut code).unwrap();

    #[rustfmt::skip]
    let expected = [
        0x48, 0x83, 0xec, 0x18, // sub rsp, 24
        0x48, 0x01, 0xfe,       // add rsi, rdi
        0x48, 0x89, 0xf0,       // mov rax, rsi
        0x48, 0x83, 0xc4, 0x18, // add rsp, 24
        0xc3,                   // ret
    ];
    assert_eq!(code, expected);
}

#[test]
fn test_sum_as_elf_object() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X86Architecture::x86_64();
    let mut c = Compiler::new(&session, &arch, &NoHelpers, AllocatorConfig::default());
    build_sum(&mut c);

    let mut asm = X86Assembler::new(&arch).unwrap();
    let length = c.compile(&mut asm).unwrap();
    let mut code = vec![0; length];
    c.write(&mut asm, 0, &mut code).unwrap();

    let bytes = write_elf("sum", &arch, &code).unwrap();
    let file = object::File::parse(&*bytes).unwrap();
    assert_eq!(file.format(), object::BinaryFormat::Elf);
    let text = file.section_by_name(".text").unwrap();
    assert_eq!(text.data().unwrap(), code.as_slice());
    let symbol = file.symbol_by_name("sum").unwrap();
    assert_eq!(symbol.size(), length as u64);
    assert_eq!(symbol.kind(), object::SymbolKind::Text);
}

#[test]
fn test_write_rejects_short_buffer() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X86Architecture::x86_64();
    let mut c = Compiler::new(&session, &arch, &NoHelpers, AllocatorConfig::default());
    build_sum(&mut c);

    let mut asm = X86Assembler::new(&arch).unwrap();
    let length = c.compile(&mut asm).unwrap();
    let mut code = vec![0; length - 1];
    let err = c.write(&mut asm, 0, &mut code).unwrap_err();
    assert!(matches!(err, CompileError::Encoding { .. }), "{err}");
}

#[test]
fn test_unresolved_promise_is_reported() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X86Architecture::x86_64();
    let mut c = Compiler::new(&session, &arch, &NoHelpers, AllocatorConfig::default());
    c.init(2, 0, 0).unwrap();
    c.start_logical_ip(0).unwrap();

    // A pool entry for a logical instruction that never gets code.
    let nowhere = c.machine_ip(1);
    c.pool_append(nowhere);
    c.return_(0, None).unwrap();

    let mut asm = X86Assembler::new(&arch).unwrap();
    let length = c.compile(&mut asm).unwrap();
    assert_eq!(length % 8, 0);
    let mut code = vec![0; length];
    let err = c.write(&mut asm, 0, &mut code).unwrap_err();
    assert!(matches!(err, CompileError::UnresolvedPromise { .. }), "{err}");
}

#[test]
fn test_pool_follows_code_at_word_boundary() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X86Architecture::x86_64();
    let mut c = Compiler::new(&session, &arch, &NoHelpers, AllocatorConfig::default());
    c.init(1, 0, 0).unwrap();
    c.start_logical_ip(0).unwrap();
    c.pool_append_value(0x1122_3344_5566_7788);
    c.return_(0, None).unwrap();

    let mut asm = X86Assembler::new(&arch).unwrap();
    let length = c.compile(&mut asm).unwrap();
    let mut code = vec![0xff; length];
    c.write(&mut asm, 0, &mut code).unwrap();

    let layout = c.code_layout().unwrap();
    assert_eq!(layout.pool_offset % 8, 0);
    assert_eq!(length, layout.pool_offset + 8);
    assert!(code[layout.code_length..layout.pool_offset].iter().all(|b| *b == 0));
    assert_eq!(
        code[layout.pool_offset..],
        0x1122_3344_5566_7788u64.to_le_bytes()
    );
}

#[test]
fn test_pool_address_follows_base_on_rewrite() {
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let arch = X86Architecture::x86_64();
    let mut c = Compiler::new(&session, &arch, &NoHelpers, AllocatorConfig::default());
    c.init(1, 0, 0).unwrap();
    c.start_logical_ip(0).unwrap();
    let entry = c.machine_ip(0);
    c.pool_append(entry);
    c.return_(0, None).unwrap();

    let mut asm = X86Assembler::new(&arch).unwrap();
    let length = c.compile(&mut asm).unwrap();
    let pool_word = |code: &[u8]| {
        let start = length - 8;
        u64::from_le_bytes(code[start..].try_into().unwrap())
    };

    let mut low = vec![0; length];
    c.write(&mut asm, 0, &mut low).unwrap();
    let mut high = vec![0; length];
    c.write(&mut asm, 0x1000, &mut high).unwrap();
    assert_eq!(pool_word(&high), pool_word(&low) + 0x1000);
}

//! Demo driver for the allocator.
//!
//! Builds one of a few small built-in units through the front end API,
//! compiles it for the selected x86 flavour and prints the machine code,
//! optionally with the recorded operations and as an ELF object.

use std::fs;
use std::process;

use bumpalo::Bump;
use clap::{Parser, ValueEnum};

use sitealloc::arch::{Architecture, BranchOp, Client, TernaryOp, ThunkOp};
use sitealloc::core::{
    AllocatorConfig, CompilationSession, CompileResult, Compiler, ValueType,
};
use sitealloc::object_file::write_elf;
use sitealloc::trace::TraceAssembler;
use sitealloc::x86::{X86Architecture, X86Assembler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Target {
    X86,
    #[value(name = "x86-64")]
    X86_64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Demo {
    /// Add two parameters and return the sum
    Sum,
    /// Sum the integers from n down to 1 in a loop
    Loop,
    /// Two-word add and multiply; the multiply is a helper call on x86
    Wide,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(long, value_enum, default_value = "x86-64", help = "Target to compile for")]
    target: Target,

    #[arg(long, value_enum, default_value = "loop", help = "Built-in unit to compile")]
    demo: Demo,

    #[arg(long, help = "Print every operation handed to the assembler")]
    trace: bool,

    #[arg(long, default_value_t = 0x1000, help = "Address the code is written for")]
    base_address: u64,

    #[arg(short, long, help = "Write an ELF object defining the unit to this path")]
    output: Option<String>,

    #[arg(long, help = "Registers kept free while resolving junctions")]
    resolve_reserve: Option<u32>,

    #[arg(long, help = "Registers kept free while relocating a stolen value")]
    steal_reserve: Option<u32>,

    #[arg(long, help = "Free registers at or below which registers get pricier")]
    low_register_threshold: Option<u32>,

    #[arg(long, help = "Alignment of loop header blocks")]
    loop_alignment: Option<u32>,
}

/// Hands out fixed, distinct addresses for runtime helpers.
struct DemoHelpers;

impl Client for DemoHelpers {
    fn thunk(&self, op: ThunkOp, result_size: u32) -> i64 {
        let index = match op {
            ThunkOp::Unary(op) => op as i64,
            ThunkOp::Binary(op) => 0x40 + op as i64,
            ThunkOp::Branch(op) => 0x80 + op as i64,
        };
        0x7000_0000 + (index << 8) + i64::from(result_size)
    }
}

fn build_sum(c: &mut Compiler<'_>, word: u32) -> CompileResult<()> {
    c.init(1, 2, 2)?;
    c.start_logical_ip(0)?;
    let a = c.init_local(word, 0, ValueType::Integer)?;
    let b = c.init_local(word, 1, ValueType::Integer)?;
    let sum = c.binary_op(TernaryOp::Add, word, a, b)?;
    c.return_(word, Some(sum))
}

fn build_loop(c: &mut Compiler<'_>, word: u32) -> CompileResult<()> {
    c.init(4, 1, 2)?;
    c.start_logical_ip(0)?;
    c.init_local(word, 0, ValueType::Integer)?;
    let zero = c.constant(word, 0);
    c.store_local(word, zero, 1)?;

    c.start_logical_ip(1)?;
    let n = c.load_local(word, 0)?;
    let zero = c.constant(word, 0);
    let exit = c.machine_ip(3);
    c.cond_jump(BranchOp::JumpIfLessOrEqual, word, zero, n, exit)?;
    let fork = c.save_state();

    c.start_logical_ip(2)?;
    let n = c.load_local(word, 0)?;
    let total = c.load_local(word, 1)?;
    let total = c.binary_op(TernaryOp::Add, word, n, total)?;
    c.store_local(word, total, 1)?;
    let one = c.constant(word, 1);
    let n = c.binary_op(TernaryOp::Subtract, word, one, n)?;
    c.store_local(word, n, 0)?;
    let header = c.machine_ip(1);
    c.jmp(header)?;
    c.visit_logical_ip(1)?;

    c.restore_state(&fork);
    c.start_logical_ip(3)?;
    let total = c.load_local(word, 1)?;
    c.return_(word, Some(total))
}

fn build_wide(c: &mut Compiler<'_>, word: u32) -> CompileResult<()> {
    let words = 8 / word;
    c.init(1, 2 * words, 2 * words)?;
    c.start_logical_ip(0)?;
    let a = c.init_local(8, 0, ValueType::Integer)?;
    let b = c.init_local(8, words, ValueType::Integer)?;
    let sum = c.binary_op(TernaryOp::Add, 8, a, b)?;
    let product = c.binary_op(TernaryOp::Multiply, 8, sum, b)?;
    c.return_(8, Some(product))
}

fn hex_dump(bytes: &[u8], base: u64) {
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let text: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
        println!("{:08x}  {}", base + (row * 16) as u64, text.join(" "));
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let arch = match cli.target {
        Target::X86 => X86Architecture::x86(),
        Target::X86_64 => X86Architecture::x86_64(),
    };
    let mut config = AllocatorConfig::from_env()
        .with_loop_header_alignment(cli.loop_alignment);
    if let Some(reserve) = cli.resolve_reserve {
        config = config.with_resolve_register_reserve(reserve);
    }
    if let Some(reserve) = cli.steal_reserve {
        config = config.with_steal_register_reserve(reserve);
    }
    if let Some(threshold) = cli.low_register_threshold {
        config = config.with_low_register_threshold(threshold);
    }

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut compiler = Compiler::new(&session, &arch, &DemoHelpers, config);
    let word = arch.word_size();
    match cli.demo {
        Demo::Sum => build_sum(&mut compiler, word)?,
        Demo::Loop => build_loop(&mut compiler, word)?,
        Demo::Wide => build_wide(&mut compiler, word)?,
    }
    log::info!(
        "{:?} on {}: {} events, {} values",
        cli.demo,
        arch.name(),
        compiler.events().len(),
        compiler.values().len()
    );

    let mut asm = TraceAssembler::new(X86Assembler::new(&arch)?);
    let length = compiler.compile(&mut asm)?;
    let mut code = vec![0; length];
    compiler.write(&mut asm, cli.base_address, &mut code)?;

    if cli.trace {
        for line in asm.lines() {
            println!("    {line}");
        }
    }
    hex_dump(&code, cli.base_address);
    println!("{}", compiler.stats());

    if let Some(path) = &cli.output {
        let name = format!("{:?}", cli.demo).to_lowercase();
        let object = write_elf(&name, &arch, &code)?;
        fs::write(path, object)?;
        log::info!("wrote {path}");
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(err) = run(&cli) {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}

//! sitealloc - register and stack-slot allocation for a single-pass method compiler.
//!
//! A front end describes one compilation unit as a sequence of events over
//! abstract values. The allocator walks the events once, giving every value
//! a concrete site (constant, address, register or frame slot) wherever it is
//! read, inserting the moves needed to get it there and reconciling placements
//! where control flow merges.
//!
//! # Primary Usage
//!
//! ```ignore
//! use sitealloc::core::{AllocatorConfig, CompilationSession, Compiler};
//! use sitealloc::x86::{X86Architecture, X86Assembler};
//! use bumpalo::Bump;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let arch = X86Architecture::x86_64();
//! let mut compiler = Compiler::new(&session, &arch, &client, AllocatorConfig::default());
//! compiler.init(1, 2, 2)?;
//! // ... build events ...
//! let mut asm = X86Assembler::new(&arch)?;
//! let length = compiler.compile(&mut asm)?;
//! let mut code = vec![0; length];
//! compiler.write(&mut asm, base_address, &mut code)?;
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Target-independent allocation engine and front-end API
//! - [`arch`] - Interfaces a target implements
//! - [`x86`] - x86 and x86-64 target using iced-x86
//! - [`trace`] - Assembler wrapper recording every operation
//! - [`object_file`] - ELF object output

pub mod arch;
pub mod core;
pub mod object_file;
pub mod trace;
pub mod x86;

pub use crate::core::{
    AllocatorConfig, CompilationSession, CompileError, CompileResult, Compiler, SessionStats,
};

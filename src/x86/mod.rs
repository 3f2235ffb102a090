//! x86 target, 32-bit and 64-bit.
//!
//! This module contains all x86 specific code:
//! - Register numbering and the calling conventions (System V on 64-bit,
//!   stack-only cdecl on 32-bit)
//! - Operand legality plans consumed by the allocator
//! - Instruction encoding using iced-x86

pub mod arch;
pub mod assembler;

pub use arch::X86Architecture;
pub use assembler::X86Assembler;

use crate::arch::Register;

pub const RAX: Register = 0;
pub const RCX: Register = 1;
pub const RDX: Register = 2;
pub const RBX: Register = 3;
pub const RSP: Register = 4;
pub const RBP: Register = 5;
pub const RSI: Register = 6;
pub const RDI: Register = 7;
pub const R8: Register = 8;
pub const R9: Register = 9;
pub const R10: Register = 10;
pub const R11: Register = 11;
pub const R12: Register = 12;
pub const R13: Register = 13;
pub const R14: Register = 14;
pub const R15: Register = 15;

/// Scratch register the 64-bit assembler uses for wide immediates and
/// absolute call targets.
pub const SCRATCH: Register = R11;

/// Registers a System V callee must preserve. The 64-bit target never
/// allocates them.
pub const CALLEE_SAVED_64: [Register; 6] = [RBX, RBP, R12, R13, R14, R15];

/// Registers a cdecl callee must preserve. The 32-bit prologue pushes them
/// in this order and the epilogue pops them in reverse.
pub const CALLEE_SAVED_32: [Register; 4] = [RBP, RBX, RSI, RDI];

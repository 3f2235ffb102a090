// This module defines the three interfaces the allocator consumes from the outside world:
// Architecture (register masks, calling convention and per-operation operand legality
// "plans"), Assembler (turns an operation plus concrete operand descriptions into code,
// hands out code positions and writes the final bytes) and Client (supplies addresses of
// runtime helper routines for operations a target cannot encode natively). It also defines
// the operation enums, the operand kind bit masks and the concrete Operand description that
// crosses the Assembler boundary. Everything here is target independent; the bundled x86
// implementation lives in crate::x86.

//! Interfaces between the allocator and its target.

use crate::core::error::CompileResult;
use crate::core::promise::{CodeLayout, CodeOffset, PromiseId, PromiseTable};

/// Physical register number.
pub type Register = u8;

/// Operand kinds; each has a bit in [`OperandMask::kinds`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    Constant = 0,
    Address = 1,
    Register = 2,
    Memory = 3,
}

impl OperandKind {
    pub const fn bit(self) -> u8 {
        1 << self as u8
    }
}

pub const CONSTANT_MASK: u8 = OperandKind::Constant.bit();
pub const ADDRESS_MASK: u8 = OperandKind::Address.bit();
pub const REGISTER_MASK: u8 = OperandKind::Register.bit();
pub const MEMORY_MASK: u8 = OperandKind::Memory.bit();
pub const ANY_KIND_MASK: u8 = CONSTANT_MASK | ADDRESS_MASK | REGISTER_MASK | MEMORY_MASK;

/// Legal operand kinds plus the register subset allowed for register operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandMask {
    pub kinds: u8,
    pub registers: u64,
}

impl OperandMask {
    pub const fn new(kinds: u8, registers: u64) -> Self {
        Self { kinds, registers }
    }

    pub const fn none() -> Self {
        Self::new(0, 0)
    }

    pub const fn register(registers: u64) -> Self {
        Self::new(REGISTER_MASK, registers)
    }

    pub const fn fixed_register(register: Register) -> Self {
        Self::new(REGISTER_MASK, 1u64 << register)
    }

    pub fn allows(&self, kind: OperandKind) -> bool {
        self.kinds & kind.bit() != 0
    }
}

/// Operations without operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NullaryOp {
    Return,
    LoadBarrier,
    StoreStoreBarrier,
    StoreLoadBarrier,
    Trap,
}

/// Control transfers taking a single target operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Call,
    Jump,
}

/// Two-operand operations: moves and unary arithmetic (`a` to `b`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// Copy with sign extension when the destination is wider.
    Move,
    /// Copy with zero extension when the destination is wider.
    MoveZ,
    Negate,
    Absolute,
    FloatNegate,
    FloatAbsolute,
    FloatSquareRoot,
    Float2Int,
    Int2Float,
}

impl BinaryOp {
    pub fn is_move(self) -> bool {
        matches!(self, Self::Move | Self::MoveZ)
    }
}

/// Three-operand arithmetic: `c = b op a`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TernaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    ShiftLeft,
    ShiftRight,
    UnsignedShiftRight,
    And,
    Or,
    Xor,
    FloatAdd,
    FloatSubtract,
    FloatMultiply,
    FloatDivide,
}

/// Compare-and-branch operations: jump to the target if `b op a`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchOp {
    JumpIfEqual,
    JumpIfNotEqual,
    JumpIfLess,
    JumpIfGreater,
    JumpIfLessOrEqual,
    JumpIfGreaterOrEqual,
    JumpIfUnsignedLess,
    JumpIfUnsignedGreater,
    JumpIfUnsignedLessOrEqual,
    JumpIfUnsignedGreaterOrEqual,
    JumpIfFloatEqual,
    JumpIfFloatNotEqual,
    JumpIfFloatLess,
    JumpIfFloatGreater,
}

impl BranchOp {
    pub fn is_float(self) -> bool {
        matches!(
            self,
            Self::JumpIfFloatEqual
                | Self::JumpIfFloatNotEqual
                | Self::JumpIfFloatLess
                | Self::JumpIfFloatGreater
        )
    }
}

/// An operation whose planned encoding is a call to a runtime helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThunkOp {
    Unary(BinaryOp),
    Binary(TernaryOp),
    Branch(BranchOp),
}

/// Immediate value, either known or deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constant {
    Value(i64),
    Promise(PromiseId),
}

impl Constant {
    /// Known value, looking deferred ones up in `promises`.
    pub fn resolve(&self, promises: &PromiseTable) -> Option<i64> {
        match *self {
            Constant::Value(value) => Some(value),
            Constant::Promise(id) => promises.value(id),
        }
    }
}

/// Concrete operand handed to the [`Assembler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Constant(Constant),
    Address(Constant),
    /// `high` is set for two-word values on narrow targets.
    Register { low: Register, high: Option<Register> },
    /// The high word of a two-word memory operand sits one word above.
    Memory {
        base: Register,
        offset: i32,
        index: Option<Register>,
        scale: u8,
    },
}

impl Operand {
    pub fn kind(&self) -> OperandKind {
        match self {
            Operand::Constant(_) => OperandKind::Constant,
            Operand::Address(_) => OperandKind::Address,
            Operand::Register { .. } => OperandKind::Register,
            Operand::Memory { .. } => OperandKind::Memory,
        }
    }
}

/// Operand plus its size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandInfo {
    pub size: u32,
    pub operand: Operand,
}

impl OperandInfo {
    pub fn new(size: u32, operand: Operand) -> Self {
        Self { size, operand }
    }
}

/// Legal operands for a move from `source` to `destination`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovePlan {
    pub source: OperandMask,
    pub destination: OperandMask,
    /// Whether a memory source may be moved straight into memory.
    pub memory_to_memory: bool,
}

/// Legal operands for a [`BinaryOp`] used as unary arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnaryPlan {
    pub operand: OperandMask,
    pub result: OperandMask,
    /// Result must be produced in the operand's own location.
    pub in_place: bool,
    pub thunk: bool,
}

/// Legal operands for a [`TernaryOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryPlan {
    pub first: OperandMask,
    pub second: OperandMask,
    pub result: OperandMask,
    /// Result must be produced in the second operand's location.
    pub in_place: bool,
    /// Registers overwritten by the instruction besides the result.
    pub clobbers: u64,
    pub thunk: bool,
}

/// Legal operands for a [`BranchOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchPlan {
    pub first: OperandMask,
    pub second: OperandMask,
    pub target: OperandMask,
    pub thunk: bool,
}

/// Register file, calling convention and operand legality of a target.
pub trait Architecture {
    fn name(&self) -> &'static str;

    /// Machine word size in bytes.
    fn word_size(&self) -> u32;

    fn register_count(&self) -> u32;

    /// Registers usable for integer values.
    fn general_registers(&self) -> u64;

    /// Registers usable for floating point values (0 if none are modelled).
    fn float_registers(&self) -> u64 {
        0
    }

    /// Registers the allocator must never hand out.
    fn reserved(&self, register: Register) -> bool;

    fn stack_register(&self) -> Register;

    fn return_low(&self) -> Register;

    /// Upper word of two-word results on narrow targets.
    fn return_high(&self) -> Option<Register>;

    fn argument_registers(&self) -> &[Register];

    /// Registers a call may overwrite.
    fn caller_saved(&self) -> u64 {
        self.general_registers()
    }

    /// Words between the local frame and the caller's argument area.
    fn frame_header_size(&self) -> u32;

    fn stack_alignment_in_words(&self) -> u32;

    fn plan_move(&self, op: BinaryOp, source_size: u32, destination_size: u32) -> MovePlan;

    fn plan_unary(&self, op: BinaryOp, size: u32, result_size: u32) -> UnaryPlan;

    fn plan_binary(&self, op: TernaryOp, size: u32, result_size: u32) -> BinaryPlan;

    fn plan_branch(&self, op: BranchOp, size: u32) -> BranchPlan;

    /// Legal operands for a call target.
    fn plan_call(&self) -> OperandMask;
}

/// Code emitter for one compilation unit.
pub trait Assembler {
    /// Emit the prologue reserving `footprint` words of frame.
    fn push_frame(&mut self, footprint: u32) -> CompileResult<()>;

    /// Emit the epilogue matching [`Assembler::push_frame`].
    fn pop_frame(&mut self, footprint: u32) -> CompileResult<()>;

    fn apply0(&mut self, op: NullaryOp) -> CompileResult<()>;

    fn apply1(&mut self, op: UnaryOp, a: OperandInfo) -> CompileResult<()>;

    fn apply2(&mut self, op: BinaryOp, a: OperandInfo, b: OperandInfo) -> CompileResult<()>;

    fn apply3(
        &mut self,
        op: TernaryOp,
        a: OperandInfo,
        b: OperandInfo,
        c: OperandInfo,
    ) -> CompileResult<()>;

    fn apply_branch(
        &mut self,
        op: BranchOp,
        a: OperandInfo,
        b: OperandInfo,
        target: OperandInfo,
    ) -> CompileResult<()>;

    /// Current position, usable as a branch target.
    fn offset(&mut self) -> CodeOffset;

    /// Close the current block; open another if `start_new`.
    fn end_block(&mut self, start_new: bool) -> usize;

    fn block_length(&self, block: usize) -> usize;

    /// Copy the blocks to their final places in `out`, patching every
    /// reference to a promise.
    fn write(
        &mut self,
        layout: &CodeLayout,
        promises: &PromiseTable,
        out: &mut [u8],
    ) -> CompileResult<()>;
}

/// Runtime services the compiled code may call.
pub trait Client {
    /// Address of the helper implementing `op` for `result_size` bytes.
    fn thunk(&self, op: ThunkOp, result_size: u32) -> i64;
}

// This module implements the Assembler interface for x86 using the iced-x86 code assembler.
// Every operation the allocator applies is encoded immediately into the current block, one
// instruction at a time: the CodeAssembler is fed a single instruction, assembled at address
// zero (nothing emitted through it is position dependent) and reset. References to values not
// known until layout (code promises used as jump, branch and call targets, deferred
// constants and pool addresses used as immediates) are encoded with a placeholder and leave a
// fixup behind: rel32 displacements for direct branches and calls, absolute 32/64-bit fields
// for immediates. write() copies each block to its final offset, fills alignment gaps with
// NOPs and patches every fixup from the promise table, failing if a promise is unresolved.
// On 64-bit, immediates that do not fit a sign-extended 32-bit field and absolute call
// targets go through R11, which the architecture withholds from allocation. On 32-bit the
// frame is bracketed by pushes and pops of the callee-saved registers.

//! x86 instruction encoding using iced-x86.

use iced_x86::code_asm::registers::cl;
use iced_x86::code_asm::*;
use iced_x86::IcedError;

use crate::arch::{
    Assembler, BinaryOp, BranchOp, Constant, NullaryOp, Operand, OperandInfo, Register, TernaryOp,
    UnaryOp,
};
use crate::core::error::{CompileError, CompileResult};
use crate::core::promise::{CodeLayout, CodeOffset, PromiseTable};

use super::{X86Architecture, CALLEE_SAVED_32, RAX, RDX, RSP};

/// Forces the imm64 form of `mov r64, imm`.
const PLACEHOLDER_64: i64 = 0x7fff_ffff_ffff_0000;
/// Forces the imm32 form of 32-bit immediates.
const PLACEHOLDER_32: i32 = 0x7fff_0000;

const NOP: u8 = 0x90;

const GP64: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];
const GP32: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];
const GP16: [AsmRegister16; 16] = [
    ax, cx, dx, bx, sp, bp, si, di, r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
];
const GP8: [AsmRegister8; 16] = [
    al, cl, dl, bl, spl, bpl, sil, dil, r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
];

fn gpr64(register: Register) -> CompileResult<AsmRegister64> {
    GP64.get(register as usize)
        .copied()
        .ok_or_else(|| CompileError::encoding(format!("no 64-bit register r{register}")))
}

fn gpr32(register: Register) -> CompileResult<AsmRegister32> {
    GP32.get(register as usize)
        .copied()
        .ok_or_else(|| CompileError::encoding(format!("no 32-bit register r{register}")))
}

fn gpr16(register: Register) -> CompileResult<AsmRegister16> {
    GP16.get(register as usize)
        .copied()
        .ok_or_else(|| CompileError::encoding(format!("no 16-bit register r{register}")))
}

fn gpr8(register: Register) -> CompileResult<AsmRegister8> {
    GP8.get(register as usize)
        .copied()
        .ok_or_else(|| CompileError::encoding(format!("no 8-bit register r{register}")))
}

fn sized_ptr(size: u32, memory: AsmMemoryOperand) -> AsmMemoryOperand {
    match size {
        1 => byte_ptr(memory),
        2 => word_ptr(memory),
        4 => dword_ptr(memory),
        _ => qword_ptr(memory),
    }
}

fn iced(err: IcedError) -> CompileError {
    CompileError::encoding(err.to_string())
}

/// Sign or zero extend the low `size` bytes of `value`.
fn extend_constant(op: BinaryOp, size: u32, value: i64) -> i64 {
    if size >= 8 {
        return value;
    }
    let shift = 64 - size * 8;
    match op {
        BinaryOp::MoveZ => ((value as u64) << shift >> shift) as i64,
        _ => (value << shift) >> shift,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FixupKind {
    Relative32,
    Absolute32,
    Absolute64,
}

#[derive(Debug, Clone, Copy)]
struct Fixup {
    /// Offset of the patched field inside its block.
    at: usize,
    kind: FixupKind,
    target: Constant,
}

#[derive(Debug, Default)]
struct Block {
    bytes: Vec<u8>,
    fixups: Vec<Fixup>,
}

/// Lowered operand.
#[derive(Debug, Clone, Copy)]
enum Loc {
    Reg(Register),
    Mem(AsmMemoryOperand),
    Imm(i64),
    Deferred(Constant),
}

/// Register-destination arithmetic with any lowered source.
macro_rules! alu {
    ($self:ident, $method:ident, $size:expr, $dst:expr, $src:expr) => {{
        let dst = $dst;
        match ($size, $src) {
            (8, Loc::Reg(src)) => {
                let (d, s) = (gpr64(dst)?, gpr64(src)?);
                $self.emit(|a| a.$method(d, s))
            }
            (_, Loc::Reg(src)) => {
                let (d, s) = (gpr32(dst)?, gpr32(src)?);
                $self.emit(|a| a.$method(d, s))
            }
            (8, Loc::Mem(m)) => {
                let d = gpr64(dst)?;
                $self.emit(|a| a.$method(d, qword_ptr(m)))
            }
            (_, Loc::Mem(m)) => {
                let d = gpr32(dst)?;
                $self.emit(|a| a.$method(d, dword_ptr(m)))
            }
            (8, Loc::Imm(value)) => match i32::try_from(value) {
                Ok(value) => {
                    let d = gpr64(dst)?;
                    $self.emit(|a| a.$method(d, value))
                }
                Err(_) => {
                    $self.load_scratch(Loc::Imm(value))?;
                    let d = gpr64(dst)?;
                    $self.emit(|a| a.$method(d, r11))
                }
            },
            (_, Loc::Imm(value)) => {
                let d = gpr32(dst)?;
                $self.emit(|a| a.$method(d, value as i32))
            }
            (8, Loc::Deferred(constant)) => {
                $self.load_scratch(Loc::Deferred(constant))?;
                let d = gpr64(dst)?;
                $self.emit(|a| a.$method(d, r11))
            }
            (_, Loc::Deferred(constant)) => {
                let d = gpr32(dst)?;
                $self.emit_fixup(|a| a.$method(d, PLACEHOLDER_32), FixupKind::Absolute32, constant)
            }
        }
    }};
}

/// x86 code emitter.
pub struct X86Assembler {
    bits: u32,
    code: CodeAssembler,
    blocks: Vec<Block>,
}

impl X86Assembler {
    pub fn new(arch: &X86Architecture) -> CompileResult<Self> {
        let code = CodeAssembler::new(arch.bits()).map_err(iced)?;
        Ok(Self {
            bits: arch.bits(),
            code,
            blocks: vec![Block::default()],
        })
    }

    fn is_64(&self) -> bool {
        self.bits == 64
    }

    fn current(&mut self) -> &mut Block {
        if self.blocks.is_empty() {
            self.blocks.push(Block::default());
        }
        let last = self.blocks.len() - 1;
        &mut self.blocks[last]
    }

    /// Encode the instruction `f` adds and append it to the current block.
    fn emit(
        &mut self,
        f: impl FnOnce(&mut CodeAssembler) -> Result<(), IcedError>,
    ) -> CompileResult<()> {
        f(&mut self.code).map_err(iced)?;
        let bytes = self.code.assemble(0).map_err(iced)?;
        self.code.reset();
        self.current().bytes.extend_from_slice(&bytes);
        Ok(())
    }

    /// Like [`X86Assembler::emit`], patching the trailing immediate later.
    fn emit_fixup(
        &mut self,
        f: impl FnOnce(&mut CodeAssembler) -> Result<(), IcedError>,
        kind: FixupKind,
        target: Constant,
    ) -> CompileResult<()> {
        self.emit(f)?;
        let width = if kind == FixupKind::Absolute64 { 8 } else { 4 };
        let block = self.current();
        let at = block.bytes.len() - width;
        block.fixups.push(Fixup { at, kind, target });
        Ok(())
    }

    /// Direct branch or call with a rel32 displacement to `target`.
    fn emit_relative(&mut self, opcode: &[u8], target: Constant) {
        let block = self.current();
        block.bytes.extend_from_slice(opcode);
        let at = block.bytes.len();
        block.bytes.extend_from_slice(&[0; 4]);
        block.fixups.push(Fixup {
            at,
            kind: FixupKind::Relative32,
            target,
        });
    }

    fn memory(
        &self,
        base: Register,
        offset: i32,
        index: Option<Register>,
        scale: u8,
    ) -> CompileResult<AsmMemoryOperand> {
        macro_rules! address {
            ($gpr:ident) => {{
                let base = $gpr(base)?;
                match index {
                    None => base + offset,
                    Some(index) => {
                        let index = $gpr(index)?;
                        match scale {
                            1 => base + index + offset,
                            2 => base + index * 2 + offset,
                            4 => base + index * 4 + offset,
                            8 => base + index * 8 + offset,
                            _ => {
                                return Err(CompileError::encoding(format!(
                                    "invalid scale {scale}"
                                )))
                            }
                        }
                    }
                }
            }};
        }
        Ok(if self.is_64() {
            address!(gpr64)
        } else {
            address!(gpr32)
        })
    }

    fn lower(&self, operand: &Operand) -> CompileResult<Loc> {
        Ok(match *operand {
            Operand::Register { low, .. } => Loc::Reg(low),
            Operand::Memory {
                base,
                offset,
                index,
                scale,
            } => Loc::Mem(self.memory(base, offset, index, scale)?),
            Operand::Constant(Constant::Value(value)) | Operand::Address(Constant::Value(value)) => {
                Loc::Imm(value)
            }
            Operand::Constant(constant) | Operand::Address(constant) => Loc::Deferred(constant),
        })
    }

    fn register(&self, info: &OperandInfo) -> CompileResult<Register> {
        match info.operand {
            Operand::Register { low, .. } => Ok(low),
            other => Err(CompileError::encoding(format!(
                "expected a register operand, got {other:?}"
            ))),
        }
    }

    /// Load an immediate into the 64-bit scratch register.
    fn load_scratch(&mut self, value: Loc) -> CompileResult<()> {
        match value {
            Loc::Imm(value) => self.emit(|a| a.mov(r11, value)),
            Loc::Deferred(constant) => self.emit_fixup(
                |a| a.mov(r11, PLACEHOLDER_64),
                FixupKind::Absolute64,
                constant,
            ),
            _ => Err(CompileError::encoding("scratch load of a non-immediate")),
        }
    }

    fn copy_register(&mut self, size: u32, source: Register, destination: Register) -> CompileResult<()> {
        if source == destination {
            return Ok(());
        }
        if size == 8 {
            let (d, s) = (gpr64(destination)?, gpr64(source)?);
            self.emit(|a| a.mov(d, s))
        } else {
            let (d, s) = (gpr32(destination)?, gpr32(source)?);
            self.emit(|a| a.mov(d, s))
        }
    }

    fn extend(
        &mut self,
        op: BinaryOp,
        source_size: u32,
        source: Loc,
        destination_size: u32,
        destination: Register,
    ) -> CompileResult<()> {
        let wide = destination_size == 8;
        match (op, source_size, source) {
            (BinaryOp::Move, 1, Loc::Reg(s)) if wide => {
                let (d, s) = (gpr64(destination)?, gpr8(s)?);
                self.emit(|a| a.movsx(d, s))
            }
            (BinaryOp::Move, 1, Loc::Reg(s)) => {
                let (d, s) = (gpr32(destination)?, gpr8(s)?);
                self.emit(|a| a.movsx(d, s))
            }
            (BinaryOp::Move, 2, Loc::Reg(s)) if wide => {
                let (d, s) = (gpr64(destination)?, gpr16(s)?);
                self.emit(|a| a.movsx(d, s))
            }
            (BinaryOp::Move, 2, Loc::Reg(s)) => {
                let (d, s) = (gpr32(destination)?, gpr16(s)?);
                self.emit(|a| a.movsx(d, s))
            }
            (BinaryOp::Move, 4, Loc::Reg(s)) => {
                let (d, s) = (gpr64(destination)?, gpr32(s)?);
                self.emit(|a| a.movsxd(d, s))
            }
            (BinaryOp::MoveZ, 1, Loc::Reg(s)) => {
                let (d, s) = (gpr32(destination)?, gpr8(s)?);
                self.emit(|a| a.movzx(d, s))
            }
            (BinaryOp::MoveZ, 2, Loc::Reg(s)) => {
                let (d, s) = (gpr32(destination)?, gpr16(s)?);
                self.emit(|a| a.movzx(d, s))
            }
            (BinaryOp::MoveZ, 4, Loc::Reg(s)) => self.copy_register(4, s, destination),

            (BinaryOp::Move, 1 | 2, Loc::Mem(m)) if wide => {
                let d = gpr64(destination)?;
                self.emit(|a| a.movsx(d, sized_ptr(source_size, m)))
            }
            (BinaryOp::Move, 1 | 2, Loc::Mem(m)) => {
                let d = gpr32(destination)?;
                self.emit(|a| a.movsx(d, sized_ptr(source_size, m)))
            }
            (BinaryOp::Move, 4, Loc::Mem(m)) => {
                let d = gpr64(destination)?;
                self.emit(|a| a.movsxd(d, dword_ptr(m)))
            }
            (BinaryOp::MoveZ, 1 | 2, Loc::Mem(m)) => {
                let d = gpr32(destination)?;
                self.emit(|a| a.movzx(d, sized_ptr(source_size, m)))
            }
            (BinaryOp::MoveZ, 4, Loc::Mem(m)) => {
                let d = gpr32(destination)?;
                self.emit(|a| a.mov(d, dword_ptr(m)))
            }

            (_, _, Loc::Imm(value)) => self.load_immediate(
                destination_size,
                extend_constant(op, source_size, value),
                destination,
            ),
            (_, _, Loc::Deferred(constant)) => {
                self.move_value(op, destination_size, Loc::Deferred(constant), destination_size, Loc::Reg(destination))
            }
            _ => Err(CompileError::encoding(format!(
                "cannot extend {source_size} bytes to {destination_size} with {op:?}"
            ))),
        }
    }

    fn load_immediate(&mut self, size: u32, value: i64, destination: Register) -> CompileResult<()> {
        if size == 8 {
            let d = gpr64(destination)?;
            self.emit(|a| a.mov(d, value))
        } else {
            let d = gpr32(destination)?;
            self.emit(|a| a.mov(d, value as i32))
        }
    }

    fn move_value(
        &mut self,
        op: BinaryOp,
        source_size: u32,
        source: Loc,
        destination_size: u32,
        destination: Loc,
    ) -> CompileResult<()> {
        match (source, destination) {
            (_, Loc::Reg(d)) if destination_size > source_size => {
                self.extend(op, source_size, source, destination_size, d)
            }
            (Loc::Reg(s), Loc::Reg(d)) => {
                self.copy_register(if destination_size == 8 { 8 } else { 4 }, s, d)
            }
            (Loc::Mem(m), Loc::Reg(d)) => match destination_size {
                8 => {
                    let d = gpr64(d)?;
                    self.emit(|a| a.mov(d, qword_ptr(m)))
                }
                4 => {
                    let d = gpr32(d)?;
                    self.emit(|a| a.mov(d, dword_ptr(m)))
                }
                size => {
                    let d = gpr32(d)?;
                    self.emit(|a| a.movzx(d, sized_ptr(size, m)))
                }
            },
            (Loc::Reg(s), Loc::Mem(m)) => match destination_size {
                8 => {
                    let s = gpr64(s)?;
                    self.emit(|a| a.mov(qword_ptr(m), s))
                }
                4 => {
                    let s = gpr32(s)?;
                    self.emit(|a| a.mov(dword_ptr(m), s))
                }
                2 => {
                    let s = gpr16(s)?;
                    self.emit(|a| a.mov(word_ptr(m), s))
                }
                _ => {
                    let s = gpr8(s)?;
                    self.emit(|a| a.mov(byte_ptr(m), s))
                }
            },
            (Loc::Imm(value), Loc::Reg(d)) => self.load_immediate(destination_size, value, d),
            (Loc::Deferred(constant), Loc::Reg(d)) => {
                if destination_size == 8 {
                    let d = gpr64(d)?;
                    self.emit_fixup(|a| a.mov(d, PLACEHOLDER_64), FixupKind::Absolute64, constant)
                } else {
                    let d = gpr32(d)?;
                    self.emit_fixup(|a| a.mov(d, PLACEHOLDER_32), FixupKind::Absolute32, constant)
                }
            }
            (Loc::Imm(value), Loc::Mem(m)) => match destination_size {
                8 => match i32::try_from(value) {
                    Ok(value) => self.emit(|a| a.mov(qword_ptr(m), value)),
                    Err(_) => {
                        self.load_scratch(Loc::Imm(value))?;
                        self.emit(|a| a.mov(qword_ptr(m), r11))
                    }
                },
                4 => self.emit(|a| a.mov(dword_ptr(m), value as i32)),
                2 => self.emit(|a| a.mov(word_ptr(m), value as i16 as i32)),
                _ => self.emit(|a| a.mov(byte_ptr(m), value as i8 as i32)),
            },
            (Loc::Deferred(constant), Loc::Mem(m)) => {
                if destination_size == 8 {
                    self.load_scratch(Loc::Deferred(constant))?;
                    self.emit(|a| a.mov(qword_ptr(m), r11))
                } else {
                    self.emit_fixup(
                        |a| a.mov(dword_ptr(m), PLACEHOLDER_32),
                        FixupKind::Absolute32,
                        constant,
                    )
                }
            }
            (source, destination) => Err(CompileError::encoding(format!(
                "illegal move {source:?} -> {destination:?}"
            ))),
        }
    }

    /// Two-word arithmetic on 32-bit register pairs.
    fn combine_pairs(&mut self, op: TernaryOp, a: &OperandInfo, b: &OperandInfo) -> CompileResult<()> {
        let (
            Operand::Register {
                low: a_lo,
                high: Some(a_hi),
            },
            Operand::Register {
                low: b_lo,
                high: Some(b_hi),
            },
        ) = (a.operand, b.operand)
        else {
            return Err(CompileError::encoding("two-word operation needs register pairs"));
        };
        let (a_lo, a_hi, b_lo, b_hi) = (gpr32(a_lo)?, gpr32(a_hi)?, gpr32(b_lo)?, gpr32(b_hi)?);
        match op {
            TernaryOp::Add => {
                self.emit(|x| x.add(b_lo, a_lo))?;
                self.emit(|x| x.adc(b_hi, a_hi))
            }
            TernaryOp::Subtract => {
                self.emit(|x| x.sub(b_lo, a_lo))?;
                self.emit(|x| x.sbb(b_hi, a_hi))
            }
            TernaryOp::And => {
                self.emit(|x| x.and(b_lo, a_lo))?;
                self.emit(|x| x.and(b_hi, a_hi))
            }
            TernaryOp::Or => {
                self.emit(|x| x.or(b_lo, a_lo))?;
                self.emit(|x| x.or(b_hi, a_hi))
            }
            TernaryOp::Xor => {
                self.emit(|x| x.xor(b_lo, a_lo))?;
                self.emit(|x| x.xor(b_hi, a_hi))
            }
            other => Err(CompileError::encoding(format!(
                "{other:?} has no two-word encoding"
            ))),
        }
    }

    fn shift(&mut self, op: TernaryOp, size: u32, count: Loc, destination: Register) -> CompileResult<()> {
        macro_rules! by {
            ($method:ident) => {
                match (size, count) {
                    (8, Loc::Reg(_)) => {
                        let d = gpr64(destination)?;
                        self.emit(|a| a.$method(d, cl))
                    }
                    (_, Loc::Reg(_)) => {
                        let d = gpr32(destination)?;
                        self.emit(|a| a.$method(d, cl))
                    }
                    (8, Loc::Imm(count)) => {
                        let d = gpr64(destination)?;
                        self.emit(|a| a.$method(d, (count & 63) as i32))
                    }
                    (_, Loc::Imm(count)) => {
                        let d = gpr32(destination)?;
                        self.emit(|a| a.$method(d, (count & 31) as i32))
                    }
                    _ => Err(CompileError::encoding("shift count must be cl or an immediate")),
                }
            };
        }
        match op {
            TernaryOp::ShiftLeft => by!(shl),
            TernaryOp::ShiftRight => by!(sar),
            _ => by!(shr),
        }
    }

    fn multiply(&mut self, size: u32, source: Loc, destination: Register) -> CompileResult<()> {
        match (size, source) {
            (8, Loc::Reg(s)) => {
                let (d, s) = (gpr64(destination)?, gpr64(s)?);
                self.emit(|a| a.imul_2(d, s))
            }
            (_, Loc::Reg(s)) => {
                let (d, s) = (gpr32(destination)?, gpr32(s)?);
                self.emit(|a| a.imul_2(d, s))
            }
            (8, Loc::Mem(m)) => {
                let d = gpr64(destination)?;
                self.emit(|a| a.imul_2(d, qword_ptr(m)))
            }
            (_, Loc::Mem(m)) => {
                let d = gpr32(destination)?;
                self.emit(|a| a.imul_2(d, dword_ptr(m)))
            }
            (8, Loc::Imm(value)) if i32::try_from(value).is_ok() => {
                let d = gpr64(destination)?;
                self.emit(|a| a.imul_3(d, d, value as i32))
            }
            (8, immediate) => {
                self.load_scratch(immediate)?;
                let d = gpr64(destination)?;
                self.emit(|a| a.imul_2(d, r11))
            }
            (_, Loc::Imm(value)) => {
                let d = gpr32(destination)?;
                self.emit(|a| a.imul_3(d, d, value as i32))
            }
            (_, Loc::Deferred(constant)) => {
                let d = gpr32(destination)?;
                self.emit_fixup(|a| a.imul_3(d, d, PLACEHOLDER_32), FixupKind::Absolute32, constant)
            }
        }
    }

    fn divide(&mut self, op: TernaryOp, size: u32, divisor: Loc, result: Register) -> CompileResult<()> {
        match (size, divisor) {
            (8, Loc::Reg(s)) => {
                let s = gpr64(s)?;
                self.emit(|a| a.cqo())?;
                self.emit(|a| a.idiv(s))?;
            }
            (_, Loc::Reg(s)) => {
                let s = gpr32(s)?;
                self.emit(|a| a.cdq())?;
                self.emit(|a| a.idiv(s))?;
            }
            (8, Loc::Mem(m)) => {
                self.emit(|a| a.cqo())?;
                self.emit(|a| a.idiv(qword_ptr(m)))?;
            }
            (_, Loc::Mem(m)) => {
                self.emit(|a| a.cdq())?;
                self.emit(|a| a.idiv(dword_ptr(m)))?;
            }
            _ => return Err(CompileError::encoding("divisor must be a register or memory")),
        }
        let produced = if op == TernaryOp::Divide { RAX } else { RDX };
        self.copy_register(size.max(4), produced, result)
    }

    fn compare(&mut self, size: u32, a: Loc, b: Loc) -> CompileResult<()> {
        let size = if size == 8 { 8 } else { 4 };
        match b {
            Loc::Reg(b) => alu!(self, cmp, size, b, a),
            Loc::Mem(m) => match a {
                Loc::Reg(a) if size == 8 => {
                    let a = gpr64(a)?;
                    self.emit(|x| x.cmp(qword_ptr(m), a))
                }
                Loc::Reg(a) => {
                    let a = gpr32(a)?;
                    self.emit(|x| x.cmp(dword_ptr(m), a))
                }
                Loc::Imm(value) if i32::try_from(value).is_ok() || size == 4 => {
                    self.emit(|x| x.cmp(sized_ptr(size, m), value as i32))
                }
                Loc::Deferred(constant) if size == 4 => self.emit_fixup(
                    |x| x.cmp(dword_ptr(m), PLACEHOLDER_32),
                    FixupKind::Absolute32,
                    constant,
                ),
                immediate @ (Loc::Imm(_) | Loc::Deferred(_)) => {
                    self.load_scratch(immediate)?;
                    self.emit(|x| x.cmp(qword_ptr(m), r11))
                }
                Loc::Mem(_) => Err(CompileError::encoding("memory to memory compare")),
            },
            _ => Err(CompileError::encoding("compare needs a register or memory operand")),
        }
    }

    /// Number of instruction bytes emitted so far, across blocks.
    pub fn code_length(&self) -> usize {
        self.blocks.iter().map(|b| b.bytes.len()).sum()
    }
}

fn condition(op: BranchOp) -> CompileResult<u8> {
    Ok(match op {
        BranchOp::JumpIfEqual => 0x84,
        BranchOp::JumpIfNotEqual => 0x85,
        BranchOp::JumpIfLess => 0x8c,
        BranchOp::JumpIfGreater => 0x8f,
        BranchOp::JumpIfLessOrEqual => 0x8e,
        BranchOp::JumpIfGreaterOrEqual => 0x8d,
        BranchOp::JumpIfUnsignedLess => 0x82,
        BranchOp::JumpIfUnsignedGreater => 0x87,
        BranchOp::JumpIfUnsignedLessOrEqual => 0x86,
        BranchOp::JumpIfUnsignedGreaterOrEqual => 0x83,
        float => {
            return Err(CompileError::encoding(format!(
                "{float:?} must be lowered to a helper call"
            )))
        }
    })
}

impl Assembler for X86Assembler {
    fn push_frame(&mut self, footprint: u32) -> CompileResult<()> {
        if !self.is_64() {
            for register in CALLEE_SAVED_32 {
                let saved = gpr32(register)?;
                self.emit(|a| a.push(saved))?;
            }
        }
        if footprint == 0 {
            return Ok(());
        }
        let bytes = (footprint * self.bits / 8) as i32;
        if self.is_64() {
            let stack = gpr64(RSP)?;
            self.emit(|a| a.sub(stack, bytes))
        } else {
            let stack = gpr32(RSP)?;
            self.emit(|a| a.sub(stack, bytes))
        }
    }

    fn pop_frame(&mut self, footprint: u32) -> CompileResult<()> {
        if footprint != 0 {
            let bytes = (footprint * self.bits / 8) as i32;
            if self.is_64() {
                let stack = gpr64(RSP)?;
                self.emit(|a| a.add(stack, bytes))?;
            } else {
                let stack = gpr32(RSP)?;
                self.emit(|a| a.add(stack, bytes))?;
            }
        }
        if !self.is_64() {
            for register in CALLEE_SAVED_32.into_iter().rev() {
                let saved = gpr32(register)?;
                self.emit(|a| a.pop(saved))?;
            }
        }
        Ok(())
    }

    fn apply0(&mut self, op: NullaryOp) -> CompileResult<()> {
        match op {
            NullaryOp::Return => self.emit(|a| a.ret()),
            NullaryOp::StoreLoadBarrier => self.emit(|a| a.mfence()),
            NullaryOp::Trap => self.emit(|a| a.int3()),
            // x86 keeps loads and stores ordered otherwise.
            NullaryOp::LoadBarrier | NullaryOp::StoreStoreBarrier => Ok(()),
        }
    }

    fn apply1(&mut self, op: UnaryOp, a: OperandInfo) -> CompileResult<()> {
        let call = op == UnaryOp::Call;
        match (a.operand, self.lower(&a.operand)?) {
            (Operand::Constant(target @ Constant::Promise(_)), _) => {
                self.emit_relative(if call { &[0xe8] } else { &[0xe9] }, target);
                Ok(())
            }
            (_, target @ (Loc::Imm(_) | Loc::Deferred(_))) if self.is_64() => {
                self.load_scratch(target)?;
                if call {
                    self.emit(|x| x.call(r11))
                } else {
                    self.emit(|x| x.jmp(r11))
                }
            }
            (_, Loc::Imm(value)) => {
                self.emit_relative(if call { &[0xe8] } else { &[0xe9] }, Constant::Value(value));
                Ok(())
            }
            (_, Loc::Deferred(target)) => {
                self.emit_relative(if call { &[0xe8] } else { &[0xe9] }, target);
                Ok(())
            }
            (_, Loc::Reg(r)) if self.is_64() => {
                let r = gpr64(r)?;
                if call {
                    self.emit(|x| x.call(r))
                } else {
                    self.emit(|x| x.jmp(r))
                }
            }
            (_, Loc::Reg(r)) => {
                let r = gpr32(r)?;
                if call {
                    self.emit(|x| x.call(r))
                } else {
                    self.emit(|x| x.jmp(r))
                }
            }
            (_, Loc::Mem(m)) => {
                let target = if self.is_64() { qword_ptr(m) } else { dword_ptr(m) };
                if call {
                    self.emit(|x| x.call(target))
                } else {
                    self.emit(|x| x.jmp(target))
                }
            }
        }
    }

    fn apply2(&mut self, op: BinaryOp, a: OperandInfo, b: OperandInfo) -> CompileResult<()> {
        match op {
            BinaryOp::Move | BinaryOp::MoveZ => {
                let (source, destination) = (self.lower(&a.operand)?, self.lower(&b.operand)?);
                self.move_value(op, a.size, source, b.size, destination)
            }
            BinaryOp::Negate => {
                let (source, destination) = (self.register(&a)?, self.register(&b)?);
                let size = if b.size == 8 { 8 } else { 4 };
                self.copy_register(size, source, destination)?;
                if size == 8 {
                    let d = gpr64(destination)?;
                    self.emit(|x| x.neg(d))
                } else {
                    let d = gpr32(destination)?;
                    self.emit(|x| x.neg(d))
                }
            }
            other => Err(CompileError::encoding(format!(
                "{other:?} must be lowered to a helper call"
            ))),
        }
    }

    fn apply3(
        &mut self,
        op: TernaryOp,
        a: OperandInfo,
        b: OperandInfo,
        c: OperandInfo,
    ) -> CompileResult<()> {
        if matches!(b.operand, Operand::Register { high: Some(_), .. }) {
            if b.operand != c.operand {
                return Err(CompileError::encoding("two-word result must reuse its operand"));
            }
            return self.combine_pairs(op, &a, &b);
        }

        let size = if b.size.max(c.size) == 8 { 8 } else { 4 };
        let first = self.lower(&a.operand)?;
        let second = self.register(&b)?;
        let result = self.register(&c)?;

        match op {
            TernaryOp::Divide | TernaryOp::Remainder => {
                if second != RAX {
                    return Err(CompileError::encoding("dividend must be in rax"));
                }
                return self.divide(op, size, first, result);
            }
            _ => self.copy_register(size, second, result)?,
        }

        match op {
            TernaryOp::Add => alu!(self, add, size, result, first),
            TernaryOp::Subtract => alu!(self, sub, size, result, first),
            TernaryOp::And => alu!(self, and, size, result, first),
            TernaryOp::Or => alu!(self, or, size, result, first),
            TernaryOp::Xor => alu!(self, xor, size, result, first),
            TernaryOp::Multiply => self.multiply(size, first, result),
            TernaryOp::ShiftLeft | TernaryOp::ShiftRight | TernaryOp::UnsignedShiftRight => {
                self.shift(op, size, first, result)
            }
            other => Err(CompileError::encoding(format!(
                "{other:?} must be lowered to a helper call"
            ))),
        }
    }

    fn apply_branch(
        &mut self,
        op: BranchOp,
        a: OperandInfo,
        b: OperandInfo,
        target: OperandInfo,
    ) -> CompileResult<()> {
        let cc = condition(op)?;
        let Operand::Constant(target) = target.operand else {
            return Err(CompileError::encoding("branch target must be a constant"));
        };
        let (first, second) = (self.lower(&a.operand)?, self.lower(&b.operand)?);
        self.compare(b.size.max(a.size), first, second)?;
        self.emit_relative(&[0x0f, cc], target);
        Ok(())
    }

    fn offset(&mut self) -> CodeOffset {
        let block = self.blocks.len().saturating_sub(1);
        let offset = self.current().bytes.len();
        CodeOffset { block, offset }
    }

    fn end_block(&mut self, start_new: bool) -> usize {
        self.current();
        let index = self.blocks.len() - 1;
        if start_new {
            self.blocks.push(Block::default());
        }
        index
    }

    fn block_length(&self, block: usize) -> usize {
        self.blocks.get(block).map_or(0, |b| b.bytes.len())
    }

    fn write(
        &mut self,
        layout: &CodeLayout,
        promises: &PromiseTable,
        out: &mut [u8],
    ) -> CompileResult<()> {
        let code_end = layout.code_length.min(out.len());
        out[..code_end].fill(NOP);

        for (index, block) in self.blocks.iter().enumerate() {
            let start = *layout.block_starts.get(index).ok_or_else(|| {
                CompileError::invalid(format!("no layout for block {index}"))
            })?;
            let end = start + block.bytes.len();
            if end > out.len() {
                return Err(CompileError::encoding(format!(
                    "block {index} ends at {end}, past the {}-byte buffer",
                    out.len()
                )));
            }
            out[start..end].copy_from_slice(&block.bytes);

            for fixup in &block.fixups {
                let value = match fixup.target {
                    Constant::Value(value) => value,
                    Constant::Promise(id) => promises
                        .value(id)
                        .ok_or(CompileError::UnresolvedPromise { promise: id.0 })?,
                };
                let at = start + fixup.at;
                match fixup.kind {
                    FixupKind::Relative32 => {
                        let next = layout.base_address as i64 + (at + 4) as i64;
                        let displacement = if self.bits == 32 {
                            value.wrapping_sub(next) as i32
                        } else {
                            i32::try_from(value - next).map_err(|_| {
                                CompileError::encoding(format!(
                                    "branch target {value:#x} out of rel32 range"
                                ))
                            })?
                        };
                        out[at..at + 4].copy_from_slice(&displacement.to_le_bytes());
                    }
                    FixupKind::Absolute32 => {
                        out[at..at + 4].copy_from_slice(&(value as u32).to_le_bytes())
                    }
                    FixupKind::Absolute64 => out[at..at + 8].copy_from_slice(&value.to_le_bytes()),
                }
            }
        }
        Ok(())
    }
}

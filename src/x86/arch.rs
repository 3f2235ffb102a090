// This module implements the Architecture interface for x86 in both 32-bit and 64-bit modes.
// Registers are numbered like their hardware encodings (rax=0 .. r15=15). On 64-bit the
// System V convention applies: integer arguments in RDI, RSI, RDX, RCX, R8, R9, results in
// RAX, and R11 is withheld from allocation as the assembler's scratch register along with the
// callee-saved RBX, RBP and R12-R15. On 32-bit all arguments travel on the stack, two-word
// results come back in EDX:EAX and only EAX..EBX have byte-sized forms; there are too few
// registers to give up the callee-saved ones, so the prologue saves EBP, EBX, ESI and EDI
// above the frame and they count as part of the frame header. The plan_* functions describe which operand kinds and registers each
// operation accepts: two-address arithmetic computes in place in its second operand, division
// is pinned to RAX/RDX, variable shifts take their count in RCX, and everything the bundled
// encoder does not emit natively (floating point, wide multiply/divide/shift and wide compares
// on 32-bit) is planned as a thunk so the front end lowers it to a helper call.

//! x86 register masks, calling conventions and operand plans.

use crate::arch::{
    Architecture, BinaryOp, BinaryPlan, BranchOp, BranchPlan, MovePlan, OperandMask, Register,
    TernaryOp, UnaryPlan, ADDRESS_MASK, ANY_KIND_MASK, CONSTANT_MASK, MEMORY_MASK, REGISTER_MASK,
};

use super::{CALLEE_SAVED_32, CALLEE_SAVED_64, R11, R8, R9, RAX, RCX, RDI, RDX, RSI, RSP};

const ARGUMENTS_64: [Register; 6] = [RDI, RSI, RDX, RCX, R8, R9];

/// Registers with byte forms in 32-bit mode (al, cl, dl, bl).
const BYTE_REGISTERS_32: u64 = 0x0f;

/// x86 target description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X86Architecture {
    bits: u32,
}

impl X86Architecture {
    pub fn x86_64() -> Self {
        Self { bits: 64 }
    }

    pub fn x86() -> Self {
        Self { bits: 32 }
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn is_64(&self) -> bool {
        self.bits == 64
    }

    fn all_registers(&self) -> u64 {
        if self.is_64() {
            0xffff
        } else {
            0xff
        }
    }

    /// Registers allowed for an operand of `size` bytes.
    fn sized_registers(&self, size: u32) -> u64 {
        if size == 1 && !self.is_64() {
            BYTE_REGISTERS_32
        } else {
            self.general_registers()
        }
    }

    fn thunk_binary() -> BinaryPlan {
        BinaryPlan {
            first: OperandMask::none(),
            second: OperandMask::none(),
            result: OperandMask::none(),
            in_place: false,
            clobbers: 0,
            thunk: true,
        }
    }
}

impl Architecture for X86Architecture {
    fn name(&self) -> &'static str {
        if self.is_64() {
            "x86-64"
        } else {
            "x86"
        }
    }

    fn word_size(&self) -> u32 {
        self.bits / 8
    }

    fn register_count(&self) -> u32 {
        if self.is_64() {
            16
        } else {
            8
        }
    }

    fn general_registers(&self) -> u64 {
        self.all_registers() & !(1u64 << RSP)
    }

    fn reserved(&self, register: Register) -> bool {
        register == RSP
            || (self.is_64() && (register == R11 || CALLEE_SAVED_64.contains(&register)))
    }

    fn stack_register(&self) -> Register {
        RSP
    }

    fn return_low(&self) -> Register {
        RAX
    }

    fn return_high(&self) -> Option<Register> {
        (!self.is_64()).then_some(RDX)
    }

    fn argument_registers(&self) -> &[Register] {
        if self.is_64() {
            &ARGUMENTS_64
        } else {
            &[]
        }
    }

    fn caller_saved(&self) -> u64 {
        if self.is_64() {
            (1 << RAX)
                | (1 << RCX)
                | (1 << RDX)
                | (1 << RSI)
                | (1 << RDI)
                | (1 << R8)
                | (1 << R9)
                | (1 << 10)
                | (1 << R11)
        } else {
            (1 << RAX) | (1 << RCX) | (1 << RDX)
        }
    }

    /// Return address, plus the saved registers on 32-bit.
    fn frame_header_size(&self) -> u32 {
        if self.is_64() {
            1
        } else {
            1 + CALLEE_SAVED_32.len() as u32
        }
    }

    fn stack_alignment_in_words(&self) -> u32 {
        16 / self.word_size()
    }

    fn plan_move(&self, _op: BinaryOp, source_size: u32, destination_size: u32) -> MovePlan {
        let source_registers = self.sized_registers(source_size);
        let destination_registers = self.sized_registers(destination_size);
        if destination_size > source_size {
            // Extensions only produce registers.
            MovePlan {
                source: OperandMask::new(
                    REGISTER_MASK | MEMORY_MASK | CONSTANT_MASK | ADDRESS_MASK,
                    source_registers,
                ),
                destination: OperandMask::register(destination_registers),
                memory_to_memory: false,
            }
        } else {
            MovePlan {
                source: OperandMask::new(ANY_KIND_MASK, source_registers & destination_registers),
                destination: OperandMask::new(
                    REGISTER_MASK | MEMORY_MASK,
                    destination_registers,
                ),
                memory_to_memory: false,
            }
        }
    }

    fn plan_unary(&self, op: BinaryOp, size: u32, _result_size: u32) -> UnaryPlan {
        let general = self.general_registers();
        match op {
            BinaryOp::Negate if size <= self.word_size() => UnaryPlan {
                operand: OperandMask::register(general),
                result: OperandMask::register(general),
                in_place: true,
                thunk: false,
            },
            BinaryOp::Move | BinaryOp::MoveZ => UnaryPlan {
                operand: OperandMask::new(ANY_KIND_MASK, general),
                result: OperandMask::new(REGISTER_MASK | MEMORY_MASK, general),
                in_place: false,
                thunk: false,
            },
            _ => UnaryPlan {
                operand: OperandMask::none(),
                result: OperandMask::none(),
                in_place: false,
                thunk: true,
            },
        }
    }

    fn plan_binary(&self, op: TernaryOp, size: u32, _result_size: u32) -> BinaryPlan {
        let general = self.general_registers();
        let wide = size > self.word_size();
        let flexible = OperandMask::new(REGISTER_MASK | CONSTANT_MASK | MEMORY_MASK, general);
        let in_place = |first: OperandMask| BinaryPlan {
            first,
            second: OperandMask::register(general),
            result: OperandMask::register(general),
            in_place: true,
            clobbers: 0,
            thunk: false,
        };

        match op {
            TernaryOp::FloatAdd
            | TernaryOp::FloatSubtract
            | TernaryOp::FloatMultiply
            | TernaryOp::FloatDivide => Self::thunk_binary(),

            // Register pairs, combined word by word.
            TernaryOp::Add | TernaryOp::Subtract | TernaryOp::And | TernaryOp::Or | TernaryOp::Xor
                if wide =>
            {
                in_place(OperandMask::register(general))
            }
            _ if wide => Self::thunk_binary(),

            TernaryOp::Add
            | TernaryOp::Subtract
            | TernaryOp::And
            | TernaryOp::Or
            | TernaryOp::Xor
            | TernaryOp::Multiply => in_place(flexible),

            TernaryOp::ShiftLeft | TernaryOp::ShiftRight | TernaryOp::UnsignedShiftRight => {
                in_place(OperandMask::new(REGISTER_MASK | CONSTANT_MASK, 1 << RCX))
            }

            TernaryOp::Divide => BinaryPlan {
                first: OperandMask::register(general & !((1 << RAX) | (1 << RDX))),
                second: OperandMask::fixed_register(RAX),
                result: OperandMask::fixed_register(RAX),
                in_place: true,
                clobbers: 1 << RDX,
                thunk: false,
            },
            TernaryOp::Remainder => BinaryPlan {
                first: OperandMask::register(general & !((1 << RAX) | (1 << RDX))),
                second: OperandMask::fixed_register(RAX),
                result: OperandMask::fixed_register(RDX),
                in_place: false,
                clobbers: (1 << RAX) | (1 << RDX),
                thunk: false,
            },
        }
    }

    fn plan_branch(&self, op: BranchOp, size: u32) -> BranchPlan {
        if op.is_float() || size > self.word_size() {
            return BranchPlan {
                first: OperandMask::none(),
                second: OperandMask::none(),
                target: OperandMask::none(),
                thunk: true,
            };
        }
        let general = self.sized_registers(size);
        BranchPlan {
            first: OperandMask::new(REGISTER_MASK | CONSTANT_MASK | MEMORY_MASK, general),
            second: OperandMask::register(general),
            target: OperandMask::new(CONSTANT_MASK, 0),
            thunk: false,
        }
    }

    fn plan_call(&self) -> OperandMask {
        OperandMask::new(
            REGISTER_MASK | MEMORY_MASK | CONSTANT_MASK | ADDRESS_MASK,
            self.general_registers(),
        )
    }
}

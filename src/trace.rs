//! Recording assembler.
//!
//! [`TraceAssembler`] wraps any [`Assembler`] and keeps a textual line for
//! every operation applied through it before forwarding the call. Tests use
//! the lines to check which moves the allocator inserted; the CLI prints
//! them with `--trace`.

use std::fmt::Write as _;

use crate::arch::{
    Assembler, BinaryOp, BranchOp, Constant, NullaryOp, Operand, OperandInfo, TernaryOp, UnaryOp,
};
use crate::core::error::CompileResult;
use crate::core::promise::{CodeLayout, CodeOffset, PromiseTable};

/// Render an operand as `r0`, `[r4+16]`, `#5`, `&p3`, with its size.
pub fn describe(info: &OperandInfo) -> String {
    let mut text = String::new();
    let constant = |c: &Constant| match c {
        Constant::Value(value) => value.to_string(),
        Constant::Promise(id) => id.to_string(),
    };
    let _ = match &info.operand {
        Operand::Constant(c) => write!(text, "#{}", constant(c)),
        Operand::Address(c) => write!(text, "&{}", constant(c)),
        Operand::Register { low, high: None } => write!(text, "r{low}"),
        Operand::Register {
            low,
            high: Some(high),
        } => write!(text, "r{high}:r{low}"),
        Operand::Memory {
            base,
            offset,
            index: None,
            ..
        } => write!(text, "[r{base}{offset:+}]"),
        Operand::Memory {
            base,
            offset,
            index: Some(index),
            scale,
        } => write!(text, "[r{base}+r{index}*{scale}{offset:+}]"),
    };
    let _ = write!(text, "/{}", info.size);
    text
}

pub struct TraceAssembler<A> {
    inner: A,
    lines: Vec<String>,
}

impl<A: Assembler> TraceAssembler<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            lines: Vec::new(),
        }
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    pub fn into_inner(self) -> A {
        self.inner
    }

    fn record(&mut self, line: String) {
        log::trace!("asm: {line}");
        self.lines.push(line);
    }
}

impl<A: Assembler> Assembler for TraceAssembler<A> {
    fn push_frame(&mut self, footprint: u32) -> CompileResult<()> {
        self.record(format!("push_frame {footprint}"));
        self.inner.push_frame(footprint)
    }

    fn pop_frame(&mut self, footprint: u32) -> CompileResult<()> {
        self.record(format!("pop_frame {footprint}"));
        self.inner.pop_frame(footprint)
    }

    fn apply0(&mut self, op: NullaryOp) -> CompileResult<()> {
        self.record(format!("{op:?}"));
        self.inner.apply0(op)
    }

    fn apply1(&mut self, op: UnaryOp, a: OperandInfo) -> CompileResult<()> {
        self.record(format!("{op:?} {}", describe(&a)));
        self.inner.apply1(op, a)
    }

    fn apply2(&mut self, op: BinaryOp, a: OperandInfo, b: OperandInfo) -> CompileResult<()> {
        self.record(format!("{op:?} {} -> {}", describe(&a), describe(&b)));
        self.inner.apply2(op, a, b)
    }

    fn apply3(
        &mut self,
        op: TernaryOp,
        a: OperandInfo,
        b: OperandInfo,
        c: OperandInfo,
    ) -> CompileResult<()> {
        self.record(format!(
            "{op:?} {}, {} -> {}",
            describe(&a),
            describe(&b),
            describe(&c)
        ));
        self.inner.apply3(op, a, b, c)
    }

    fn apply_branch(
        &mut self,
        op: BranchOp,
        a: OperandInfo,
        b: OperandInfo,
        target: OperandInfo,
    ) -> CompileResult<()> {
        self.record(format!(
            "{op:?} {}, {} -> {}",
            describe(&a),
            describe(&b),
            describe(&target)
        ));
        self.inner.apply_branch(op, a, b, target)
    }

    fn offset(&mut self) -> CodeOffset {
        self.inner.offset()
    }

    fn end_block(&mut self, start_new: bool) -> usize {
        let block = self.inner.end_block(start_new);
        if start_new {
            self.record(format!("block {}", block + 1));
        }
        block
    }

    fn block_length(&self, block: usize) -> usize {
        self.inner.block_length(block)
    }

    fn write(
        &mut self,
        layout: &CodeLayout,
        promises: &PromiseTable,
        out: &mut [u8],
    ) -> CompileResult<()> {
        self.inner.write(layout, promises, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86::{X86Architecture, X86Assembler};

    #[test]
    fn test_operand_rendering() {
        let memory = OperandInfo::new(
            8,
            Operand::Memory {
                base: 4,
                offset: -8,
                index: None,
                scale: 1,
            },
        );
        assert_eq!(describe(&memory), "[r4-8]/8");
        let pair = OperandInfo::new(
            8,
            Operand::Register {
                low: 0,
                high: Some(2),
            },
        );
        assert_eq!(describe(&pair), "r2:r0/8");
    }

    #[test]
    fn test_records_and_forwards() {
        let arch = X86Architecture::x86_64();
        let mut asm = TraceAssembler::new(X86Assembler::new(&arch).unwrap());
        asm.apply2(
            BinaryOp::Move,
            OperandInfo::new(8, Operand::Constant(Constant::Value(7))),
            OperandInfo::new(8, Operand::Register { low: 1, high: None }),
        )
        .unwrap();
        asm.apply0(NullaryOp::Return).unwrap();
        assert_eq!(asm.lines(), &["Move #7/8 -> r1/8", "Return"]);
        assert!(asm.inner().code_length() > 1);
    }
}

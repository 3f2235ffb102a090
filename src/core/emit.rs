// This module turns each event into machine operations once the driver has established the
// allocation state at its entry. Every handler follows the same shape: bind the event's reads
// in declaration order (moving values where a read's mask demands it) and pin the bound sites,
// empty whatever the instruction overwrites while preserving occupants that are still needed,
// choose the result site, emit through the Assembler, then unpin. The driver pops the event's
// reads afterwards, which is what releases dying operands. Two-word values on 32-bit targets
// travel as separate low/high values and are handed to the assembler as register pairs.

//! Per-event code emission.

use crate::arch::{
    BinaryOp, BranchOp, Constant, NullaryOp, Operand, OperandInfo, TernaryOp, UnaryOp,
    MEMORY_MASK,
};

use super::allocator::Context;
use super::error::{CompileError, CompileResult};
use super::event::{EventId, EventKind};
use super::promise::PromiseId;
use super::site::{Site, SiteMask};
use super::value::{ReadId, ValueId};

fn read_at(reads: &[ReadId], index: usize) -> CompileResult<ReadId> {
    reads
        .get(index)
        .copied()
        .ok_or_else(|| CompileError::invalid(format!("event is missing read #{index}")))
}

fn info(size: u32, site: Site) -> OperandInfo {
    OperandInfo::new(size, site.to_operand())
}

/// Operand for one site, or a register pair for a two-word value.
fn operand(size: u32, sites: &[Site]) -> CompileResult<OperandInfo> {
    match *sites {
        [single] => Ok(info(size, single)),
        [Site::Register(low), Site::Register(high)] => Ok(OperandInfo::new(
            size,
            Operand::Register {
                low,
                high: Some(high),
            },
        )),
        _ => Err(CompileError::invalid(
            "two-word operand must live in a register pair",
        )),
    }
}

fn registers_in(mask: u64) -> impl Iterator<Item = u8> {
    (0..64u8).filter(move |r| mask & (1u64 << r) != 0)
}

/// Interpret `value` as a `size`-byte integer.
fn truncate(value: i64, size: u32, signed: bool) -> i64 {
    let bits = size * 8;
    if bits >= 64 {
        return value;
    }
    let shift = 64 - bits;
    if signed {
        (value << shift) >> shift
    } else {
        ((value as u64) << shift >> shift) as i64
    }
}

/// Outcome of `second op first` for known operands.
pub(crate) fn evaluate(op: BranchOp, size: u32, first: i64, second: i64) -> Option<bool> {
    let (sa, sb) = (truncate(first, size, true), truncate(second, size, true));
    let (ua, ub) = (
        truncate(first, size, false) as u64,
        truncate(second, size, false) as u64,
    );
    Some(match op {
        BranchOp::JumpIfEqual => sb == sa,
        BranchOp::JumpIfNotEqual => sb != sa,
        BranchOp::JumpIfLess => sb < sa,
        BranchOp::JumpIfGreater => sb > sa,
        BranchOp::JumpIfLessOrEqual => sb <= sa,
        BranchOp::JumpIfGreaterOrEqual => sb >= sa,
        BranchOp::JumpIfUnsignedLess => ub < ua,
        BranchOp::JumpIfUnsignedGreater => ub > ua,
        BranchOp::JumpIfUnsignedLessOrEqual => ub <= ua,
        BranchOp::JumpIfUnsignedGreaterOrEqual => ub >= ua,
        _ => return None,
    })
}

impl<'c, 'a> Context<'c, 'a> {
    /// Emit code for event `id` and consume its reads.
    pub fn compile_event(&mut self, id: EventId) -> CompileResult<()> {
        self.current = id;
        let event = self.events.get(id);
        let kind = event.kind.clone();
        let reads = event.reads.clone();
        let name = kind.name();
        log::trace!("{id}: {name}");

        match kind {
            EventKind::Dummy => {}
            EventKind::FrameSite { value, home } => {
                let site = self.layout.home_site(home);
                self.add_site(value, site)?;
            }
            EventKind::RegisterSite { value, register } => {
                self.add_site(value, Site::Register(register))?;
            }
            EventKind::Move {
                op,
                source_size,
                source,
                destination_size,
                result,
            } => self.compile_move(op, source_size, source, destination_size, result, &reads)?,
            EventKind::Store {
                op,
                source_size,
                destination_size,
                ..
            } => self.compile_store(op, source_size, destination_size, &reads)?,
            EventKind::Combine {
                op,
                size,
                result_size,
                result,
                ..
            } => self.compile_combine(op, size, result_size, result, &reads)?,
            EventKind::Translate {
                op,
                size,
                result_size,
                result,
                ..
            } => self.compile_translate(op, size, result_size, result, &reads)?,
            EventKind::Branch {
                op,
                size,
                first,
                second,
                target,
            } => self.compile_branch(op, size, first, second, target, &reads)?,
            EventKind::Jump { target } => {
                self.resolve_edges(id)?;
                let word = self.word_size();
                self.asm.apply1(
                    UnaryOp::Jump,
                    OperandInfo::new(word, Operand::Constant(Constant::Promise(target))),
                )?;
            }
            EventKind::Call {
                result_size,
                result,
                ..
            } => self.compile_call(result_size, result, &reads)?,
            EventKind::Return { value, .. } => self.compile_return(value, &reads)?,
            EventKind::BoundsCheck {
                length_offset,
                index,
                handler,
                ..
            } => self.compile_bounds_check(length_offset, index, handler, &reads)?,
            EventKind::Memory {
                displacement,
                index,
                scale,
                result,
                ..
            } => self.compile_memory(displacement, index.is_some(), scale, result, &reads)?,
            EventKind::Operation { op } => self.asm.apply0(op)?,
        }

        self.pop_reads(&reads)?;
        self.session.record_event_compiled(name);
        Ok(())
    }

    /// Bind `read` and pin the resulting site until `release`.
    fn bind(&mut self, read: ReadId, pinned: &mut Vec<Site>) -> CompileResult<Site> {
        let site = self.read_source(read)?;
        self.freeze(site)?;
        pinned.push(site);
        Ok(site)
    }

    fn release(&mut self, pinned: Vec<Site>) -> CompileResult<()> {
        for site in pinned.into_iter().rev() {
            self.thaw(site)?;
        }
        Ok(())
    }

    /// Known integer value of `value`, if it sits in a resolvable constant.
    pub(crate) fn constant_value(&self, value: ValueId) -> Option<i64> {
        self.values
            .ring_sites(value)
            .into_iter()
            .find_map(|(_, site)| match site {
                Site::Constant(constant) => constant.resolve(&*self.promises),
                _ => None,
            })
    }

    /// Empty every resource in `sites` ahead of an instruction that
    /// overwrites them. Occupants that are read later and would lose their
    /// last copy move somewhere that survives first. The emptied resources
    /// stay pinned until `release`.
    fn clobber(&mut self, sites: &[Site], pinned: &mut Vec<Site>) -> CompileResult<()> {
        for site in sites {
            let Some(id) = self.resource_of(site) else {
                continue;
            };
            if let Some(occupant) = self.registers.owner(id) {
                let survives = self
                    .values
                    .ring_sites(occupant)
                    .iter()
                    .any(|(_, s)| !sites.contains(s));
                if !survives && self.live_after(occupant, self.current) {
                    let target = self.spill_target(occupant, sites)?;
                    log::debug!("{}: preserving {occupant} in {target}", self.current);
                    self.move_value(occupant, *site, target)?;
                }
                self.remove_site(occupant, *site)?;
            }
            self.freeze(*site)?;
            pinned.push(*site);
        }
        Ok(())
    }

    /// Somewhere outside `avoid` to keep a copy of `value`.
    fn spill_target(&mut self, value: ValueId, avoid: &[Site]) -> CompileResult<Site> {
        let avoided = avoid
            .iter()
            .filter_map(Site::register)
            .fold(0u64, |mask, r| mask | (1u64 << r));
        let mask = SiteMask::register_or_memory(self.registers.allocatable() & !avoided);
        let home = self.home_of(value);
        match self.pick_target(value, mask, home, 0, avoid) {
            Ok(site) => Ok(site),
            Err(error) => (self.layout.outgoing_footprint..self.layout.frame_count())
                .filter(|index| self.registers.is_frame_available(*index))
                .map(|index| self.layout.site(index))
                .find(|site| !avoid.contains(site))
                .ok_or(error),
        }
    }

    fn compile_move(
        &mut self,
        op: BinaryOp,
        source_size: u32,
        source: ValueId,
        destination_size: u32,
        result: ValueId,
        reads: &[ReadId],
    ) -> CompileResult<()> {
        let word = self.word_size();
        let read = read_at(reads, 0)?;

        if source_size > word {
            if destination_size > word {
                self.values.add_buddy(source, result);
                let highs = (self.values.get(source).high, self.values.get(result).high);
                if let (Some(from), Some(to)) = highs {
                    self.values.add_buddy(from, to);
                }
                return Ok(());
            }
            // Narrowing a pair keeps only its low word.
            if destination_size == word {
                self.values.add_buddy(source, result);
                return Ok(());
            }
            return self.move_part(op, word, read, destination_size, result);
        }

        if destination_size > word {
            if source_size == word {
                self.values.add_buddy(source, result);
            } else {
                self.move_part(op, source_size, read, word, result)?;
            }
            let high = self.values.get(result).high.ok_or_else(|| {
                CompileError::invalid(format!("{result} has no high word to extend into"))
            })?;
            if op == BinaryOp::MoveZ {
                // The high word was created as a zero constant.
                return Ok(());
            }
            return self.sign_extend_high(result, high);
        }

        if source_size == destination_size && op.is_move() {
            self.values.add_buddy(source, result);
            return Ok(());
        }
        self.move_part(op, source_size, read, destination_size, result)
    }

    fn move_part(
        &mut self,
        op: BinaryOp,
        source_size: u32,
        read: ReadId,
        destination_size: u32,
        result: ValueId,
    ) -> CompileResult<()> {
        let mut pinned = Vec::new();
        let plan = self.arch.plan_move(op, source_size, destination_size);
        let source = self.bind(read, &mut pinned)?;
        let mut mask = SiteMask::from_operand_mask(plan.destination);
        if matches!(source, Site::Memory { .. }) && !plan.memory_to_memory {
            mask.kinds &= !MEMORY_MASK;
        }
        let home = self.home_of(result);
        let target = self.pick_target(result, mask, home, 0, &[])?;
        self.add_site(result, target)?;
        self.asm
            .apply2(op, info(source_size, source), info(destination_size, target))?;
        self.release(pinned)
    }

    /// Fill `high` with copies of the sign bit of `low`.
    fn sign_extend_high(&mut self, low: ValueId, high: ValueId) -> CompileResult<()> {
        let word = self.word_size();
        let source = self
            .cheapest_site(low, None)
            .ok_or(CompileError::NoSource { value: low.0 })?;
        let general = SiteMask::register(self.arch.general_registers());
        let target = self.with_frozen(&[source], |c| {
            let target = c.pick_target(high, general, None, 0, &[])?;
            c.add_site(high, target)?;
            Ok(target)
        })?;
        self.asm
            .apply2(BinaryOp::Move, info(word, source), info(word, target))?;
        let shift = OperandInfo::new(
            word,
            Operand::Constant(Constant::Value(i64::from(word * 8 - 1))),
        );
        self.asm.apply3(
            TernaryOp::ShiftRight,
            shift,
            info(word, target),
            info(word, target),
        )
    }

    fn compile_store(
        &mut self,
        op: BinaryOp,
        source_size: u32,
        destination_size: u32,
        reads: &[ReadId],
    ) -> CompileResult<()> {
        let word = self.word_size();
        let mut pinned = Vec::new();
        if source_size > word {
            let low = self.bind(read_at(reads, 0)?, &mut pinned)?;
            let high = self.bind(read_at(reads, 1)?, &mut pinned)?;
            let target = self.bind(read_at(reads, 2)?, &mut pinned)?;
            let upper = target
                .copy_high(word)
                .ok_or_else(|| CompileError::invalid("two-word store needs a memory target"))?;
            self.asm.apply2(op, info(word, low), info(word, target))?;
            self.asm.apply2(op, info(word, high), info(word, upper))?;
        } else {
            let value = self.bind(read_at(reads, 0)?, &mut pinned)?;
            let target = self.bind(read_at(reads, 1)?, &mut pinned)?;
            self.asm
                .apply2(op, info(source_size, value), info(destination_size, target))?;
        }
        self.release(pinned)
    }

    fn compile_combine(
        &mut self,
        op: TernaryOp,
        size: u32,
        result_size: u32,
        result: ValueId,
        reads: &[ReadId],
    ) -> CompileResult<()> {
        let plan = self.arch.plan_binary(op, size, result_size);
        let parts = if size > self.word_size() { 2 } else { 1 };
        let mut pinned = Vec::new();

        let mut first = Vec::with_capacity(parts);
        for i in 0..parts {
            first.push(self.bind(read_at(reads, i)?, &mut pinned)?);
        }
        let mut second = Vec::with_capacity(parts);
        for i in parts..2 * parts {
            second.push(self.bind(read_at(reads, i)?, &mut pinned)?);
        }

        let mut destroyed: Vec<Site> = registers_in(plan.clobbers).map(Site::Register).collect();
        if plan.in_place {
            for site in &second {
                if !destroyed.contains(site) {
                    destroyed.push(*site);
                }
            }
        }
        self.clobber(&destroyed, &mut pinned)?;

        let targets = if plan.in_place {
            second.clone()
        } else {
            let mask = SiteMask::from_operand_mask(plan.result);
            match destroyed.iter().find(|s| s.matches(&mask, &self.layout)) {
                Some(site) => vec![*site],
                None => {
                    let home = self.home_of(result);
                    vec![self.pick_target(result, mask, home, 0, &[])?]
                }
            }
        };
        self.add_site(result, targets[0])?;
        if let (Some(high), Some(site)) = (self.values.get(result).high, targets.get(1)) {
            self.add_site(high, *site)?;
        }

        self.asm.apply3(
            op,
            operand(size, &first)?,
            operand(size, &second)?,
            operand(result_size, &targets)?,
        )?;
        self.release(pinned)
    }

    fn compile_translate(
        &mut self,
        op: BinaryOp,
        size: u32,
        result_size: u32,
        result: ValueId,
        reads: &[ReadId],
    ) -> CompileResult<()> {
        let plan = self.arch.plan_unary(op, size, result_size);
        let mut pinned = Vec::new();
        let source = self.bind(read_at(reads, 0)?, &mut pinned)?;
        let target = if plan.in_place {
            self.clobber(&[source], &mut pinned)?;
            source
        } else {
            let mut mask = SiteMask::from_operand_mask(plan.result);
            if matches!(source, Site::Memory { .. }) {
                mask.kinds &= !MEMORY_MASK;
            }
            let home = self.home_of(result);
            self.pick_target(result, mask, home, 0, &[])?
        };
        self.add_site(result, target)?;
        self.asm
            .apply2(op, info(size, source), info(result_size, target))?;
        self.release(pinned)
    }

    fn compile_branch(
        &mut self,
        op: BranchOp,
        size: u32,
        first: ValueId,
        second: ValueId,
        target: PromiseId,
        reads: &[ReadId],
    ) -> CompileResult<()> {
        let word = self.word_size();
        let destination = OperandInfo::new(word, Operand::Constant(Constant::Promise(target)));
        let folded = match (self.constant_value(first), self.constant_value(second)) {
            (Some(a), Some(b)) => evaluate(op, size, a, b),
            _ => None,
        };

        if let Some(taken) = folded {
            log::debug!(
                "{}: branch folded, {}",
                self.current,
                if taken { "always taken" } else { "never taken" }
            );
            self.session.record_branch_folded();
            self.resolve_edges(self.current)?;
            if taken {
                self.asm.apply1(UnaryOp::Jump, destination)?;
            }
            return Ok(());
        }

        let mut pinned = Vec::new();
        let a = self.bind(read_at(reads, 0)?, &mut pinned)?;
        let b = self.bind(read_at(reads, 1)?, &mut pinned)?;
        self.resolve_edges(self.current)?;
        self.asm
            .apply_branch(op, info(size, a), info(size, b), destination)?;
        self.release(pinned)
    }

    /// Resources a call destroys: caller-saved registers and the outgoing
    /// argument area.
    fn call_clobbers(&self) -> Vec<Site> {
        let saved = self.arch.caller_saved() & self.registers.allocatable();
        registers_in(saved)
            .map(Site::Register)
            .chain((0..self.layout.outgoing_footprint).map(|i| self.layout.site(i)))
            .collect()
    }

    fn compile_call(
        &mut self,
        result_size: u32,
        result: Option<ValueId>,
        reads: &[ReadId],
    ) -> CompileResult<()> {
        let word = self.word_size();
        let (address_read, arguments) = reads
            .split_last()
            .ok_or_else(|| CompileError::invalid("call without an address read"))?;
        let mut pinned = Vec::new();
        for read in arguments {
            self.bind(*read, &mut pinned)?;
        }
        let address = self.bind(*address_read, &mut pinned)?;

        let clobbered = self.call_clobbers();
        self.clobber(&clobbered, &mut pinned)?;
        self.asm.apply1(UnaryOp::Call, info(word, address))?;
        self.release(pinned)?;

        if let Some(result) = result {
            self.add_site(result, Site::Register(self.arch.return_low()))?;
            let high = self.values.get(result).high;
            if let (Some(high), Some(register)) = (high, self.arch.return_high()) {
                if result_size > word {
                    self.add_site(high, Site::Register(register))?;
                }
            }
        }
        Ok(())
    }

    fn compile_return(&mut self, value: Option<ValueId>, reads: &[ReadId]) -> CompileResult<()> {
        let mut pinned = Vec::new();
        if value.is_some() {
            for read in reads {
                self.bind(*read, &mut pinned)?;
            }
        }
        self.asm.pop_frame(self.layout.aligned_words)?;
        self.asm.apply0(NullaryOp::Return)?;
        self.release(pinned)
    }

    fn compile_bounds_check(
        &mut self,
        length_offset: i32,
        index: ValueId,
        handler: i64,
        reads: &[ReadId],
    ) -> CompileResult<()> {
        let word = self.word_size();
        let handler = OperandInfo::new(word, Operand::Constant(Constant::Value(handler)));
        if self.constant_value(index).is_some_and(|v| v < 0) {
            return self.asm.apply1(UnaryOp::Call, handler);
        }

        let mut pinned = Vec::new();
        let object = self.bind(read_at(reads, 0)?, &mut pinned)?;
        let index = self.bind(read_at(reads, 1)?, &mut pinned)?;
        let base = object
            .register()
            .ok_or_else(|| CompileError::invalid("bounds check object must be in a register"))?;
        let length = Site::Memory {
            base,
            offset: length_offset,
            index: None,
            scale: 1,
        };
        let skip = self.promises.code();
        self.asm.apply_branch(
            BranchOp::JumpIfUnsignedGreater,
            info(4, index),
            info(4, length),
            OperandInfo::new(word, Operand::Constant(Constant::Promise(skip))),
        )?;
        self.asm.apply1(UnaryOp::Call, handler)?;
        let offset = self.asm.offset();
        self.promises.set_code_offset(skip, offset);
        self.release(pinned)
    }

    fn compile_memory(
        &mut self,
        displacement: i32,
        indexed: bool,
        scale: u8,
        result: ValueId,
        reads: &[ReadId],
    ) -> CompileResult<()> {
        let mut pinned = Vec::new();
        let base = self.bind(read_at(reads, 0)?, &mut pinned)?;
        let base = base
            .register()
            .ok_or_else(|| CompileError::invalid("memory base must be in a register"))?;
        let index = if indexed {
            let site = self.bind(read_at(reads, 1)?, &mut pinned)?;
            Some(
                site.register()
                    .ok_or_else(|| CompileError::invalid("memory index must be in a register"))?,
            )
        } else {
            None
        };
        self.add_site(
            result,
            Site::Memory {
                base,
                offset: displacement,
                index,
                scale,
            },
        )?;
        self.release(pinned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluate_respects_size_and_signedness() {
        assert_eq!(evaluate(BranchOp::JumpIfLess, 8, 5, 3), Some(true));
        assert_eq!(evaluate(BranchOp::JumpIfUnsignedLess, 8, 5, -1), Some(false));
        // 0xffff_ffff is -1 as a 4-byte integer.
        assert_eq!(
            evaluate(BranchOp::JumpIfLess, 4, 0, 0xffff_ffff),
            Some(true)
        );
        assert_eq!(evaluate(BranchOp::JumpIfFloatLess, 8, 1, 0), None);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate(0x1ff, 1, false), 0xff);
        assert_eq!(truncate(0x1ff, 1, true), -1);
        assert_eq!(truncate(-5, 8, false), -5);
    }
}

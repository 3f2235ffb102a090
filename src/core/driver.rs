// This module walks the event list of a unit in creation order and turns it into machine code.
// For every event the driver opens a new assembler block when control cannot simply fall in
// from the previous event, reconstructs the allocation state on entry (junction table,
// snapshot of an out-of-sequence single predecessor, or nothing for straight-line code),
// resolves the code promise of the event, compiles it, resolves outgoing junction edges and
// captures snapshots for successors entered later. Stub reads keep slot values alive until
// the predecessor has done both; they are consumed right after it, since from then on the
// successor's entry state comes from its table or snapshot. Every event must leave the
// freeze count where it found it.
//
// Compiler::compile then lays the blocks out back to back, honouring the alignment each block
// asked for, and places the constant pool (if any) after the code at a word boundary.
// Compiler::write installs the layout for a chosen base address, collects each pool word
// through a listener on its promise and copies the bytes out.

//! Driver loop, block layout and final byte output.

use std::cell::RefCell;
use std::rc::Rc;

use crate::arch::Assembler;

use super::allocator::Context;
use super::compiler::Compiler;
use super::error::{CompileError, CompileResult};
use super::event::EventId;
use super::promise::CodeLayout;
use super::value::ReadId;

fn align_up(offset: usize, alignment: u32) -> usize {
    let alignment = alignment.max(1) as usize;
    offset.div_ceil(alignment) * alignment
}

impl<'c, 'a> Context<'c, 'a> {
    /// Compile every event; returns the requested alignment of each block.
    pub fn run(&mut self) -> CompileResult<Vec<u32>> {
        self.set_stub_targets();
        self.asm.push_frame(self.layout.aligned_words)?;
        let mut alignments = vec![1];

        let ids: Vec<EventId> = self.events.ids().collect();
        for id in ids {
            if id.0 != 0 && self.events.starts_block(id) {
                self.asm.end_block(true);
                let alignment = if self.events.has_back_edge(id) {
                    self.config.loop_header_alignment.unwrap_or(1)
                } else {
                    1
                };
                alignments.push(alignment);
            }

            self.current = id;
            self.enter(id)?;

            if let Some(promise) = self.events.get(id).promise {
                let offset = self.asm.offset();
                self.promises.set_code_offset(promise, offset);
            }

            let baseline = self.registers.total_freezes();
            self.compile_event(id)?;

            let fork_reads = self.events.get(id).fork_reads.clone();
            self.pop_reads(&fork_reads)?;
            if !self.events.get(id).kind.is_branch() {
                self.resolve_edges(id)?;
            }
            self.capture_snapshots(id);
            let stubs = self.outgoing_stubs(id);
            self.pop_reads(&stubs)?;

            let after = self.registers.total_freezes();
            if after != baseline {
                return Err(CompileError::FreezeImbalance {
                    resource: format!("event {id}"),
                    reason: format!(
                        "{} outstanding freezes ({} before, {after} after)",
                        after.abs_diff(baseline),
                        baseline
                    ),
                });
            }
        }

        self.asm.end_block(false);
        log::debug!(
            "compiled {} events into {} blocks",
            self.events.len(),
            alignments.len()
        );
        Ok(alignments)
    }

    /// Reconstruct the allocation state on entry to `id`.
    fn enter(&mut self, id: EventId) -> CompileResult<()> {
        if self.events.needs_table(id) {
            return self.enter_junction(id);
        }
        match self.events.predecessor_events(id).as_slice() {
            [predecessor] if predecessor.0 + 1 != id.0 && *predecessor < id => {
                self.restore_snapshot(id)
            }
            [] if id.0 != 0 => {
                log::trace!("{id}: unreachable from earlier events");
                self.reset_sites();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Point each stub at the read it keeps alive past its edge.
    fn set_stub_targets(&mut self) {
        let ids: Vec<EventId> = self.events.ids().collect();
        for id in ids {
            let links = self.events.get(id).predecessors.clone();
            let frame = self.events.get(id).frame_before;
            for link in links {
                let stubs = self.events.link(link).stubs.clone();
                for (home, stub) in stubs {
                    let target = frame
                        .slot(home)
                        .and_then(|value| self.values.first_read_from(value, id));
                    self.values.set_stub_target(stub, target);
                }
            }
        }
    }

    /// Stub reads on the links leaving `id`.
    fn outgoing_stubs(&self, id: EventId) -> Vec<ReadId> {
        self.events
            .get(id)
            .successors
            .iter()
            .flat_map(|link| self.events.link(*link).stubs.iter().map(|(_, stub)| *stub))
            .collect()
    }
}

impl<'a> Compiler<'a> {
    /// Compile the unit into `asm`; returns the total length in bytes,
    /// constant pool included.
    pub fn compile(&mut self, asm: &mut dyn Assembler) -> CompileResult<usize> {
        if self.events.is_empty() {
            return Err(CompileError::invalid("nothing to compile"));
        }
        if self.code_layout.is_some() {
            return Err(CompileError::invalid("unit compiled twice"));
        }
        if let Some((id, target)) = self.events.unlinked_target() {
            return Err(CompileError::invalid(format!(
                "{id} jumps to {target}, which no path links it to"
            )));
        }
        let frame = self.frame_layout();
        let alignments = {
            let mut context = Context::new(
                self.arch,
                self.session,
                self.config,
                &mut self.values,
                &mut self.events,
                &mut self.promises,
                frame,
                &mut *asm,
            );
            context.run()?
        };

        let mut block_starts = Vec::with_capacity(alignments.len());
        let mut offset = 0;
        for (block, alignment) in alignments.iter().enumerate() {
            offset = align_up(offset, *alignment);
            block_starts.push(offset);
            offset += asm.block_length(block);
        }
        let word = self.arch.word_size();
        let pool_offset = if self.promises.pool_entries().is_empty() {
            offset
        } else {
            align_up(offset, word)
        };
        let layout = CodeLayout {
            base_address: 0,
            block_starts,
            code_length: offset,
            pool_offset,
            word_size: word,
        };
        let total = layout.total_length(self.promises.pool_entries().len());
        self.session.record_unit_compiled(total);
        log::debug!(
            "unit laid out: {} code bytes, {} pool entries, {total} bytes total",
            layout.code_length,
            self.promises.pool_entries().len()
        );
        self.code_layout = Some(layout);
        Ok(total)
    }

    /// Resolve every promise for code placed at `base_address` and write
    /// the unit to `out`, which must hold the length `compile` returned.
    pub fn write(
        &mut self,
        asm: &mut dyn Assembler,
        base_address: u64,
        out: &mut [u8],
    ) -> CompileResult<()> {
        let mut layout = self
            .code_layout
            .clone()
            .ok_or_else(|| CompileError::invalid("write before compile"))?;
        layout.base_address = base_address;
        let entries = self.promises.pool_entries().to_vec();
        let total = layout.total_length(entries.len());
        if out.len() < total {
            return Err(CompileError::encoding(format!(
                "{total} bytes needed, buffer holds {}",
                out.len()
            )));
        }

        // The layout goes in first so that a rewrite at another base address
        // never sees addresses from the previous one.
        self.promises.set_layout(layout.clone());
        let words: Rc<RefCell<Vec<(usize, i64)>>> = Rc::default();
        for (index, entry) in entries.iter().enumerate() {
            let words = Rc::clone(&words);
            self.promises.listen(
                *entry,
                Box::new(move |value| words.borrow_mut().push((index, value))),
            );
        }
        if let Some(promise) = self.promises.first_unresolved() {
            return Err(CompileError::UnresolvedPromise { promise: promise.0 });
        }
        asm.write(&layout, &self.promises, out)?;

        out[layout.code_length..layout.pool_offset].fill(0);
        let word = layout.word_size as usize;
        for (index, value) in words.borrow().iter() {
            let start = layout.pool_offset + index * word;
            out[start..start + word].copy_from_slice(&value.to_le_bytes()[..word]);
        }
        self.code_layout = Some(layout);
        Ok(())
    }
}

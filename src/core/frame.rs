// This module models the abstract frame the front end manipulates while building events and
// the concrete frame layout the driver derives from it. The abstract frame is a logical
// operand stack plus an array of local slots, both holding value ids. Stack entries are
// persistent linked nodes and local arrays are copy-on-write slices; both are allocated in the
// session's bumpalo arena so that save_state/restore_state and the per-event snapshots that
// junction resolution consumes are O(1) pointer copies. FrameLayout maps logical homes
// (local index, stack depth) and outgoing argument slots onto word-sized frame indices and
// stack-pointer relative offsets: outgoing argument slots sit at the bottom of the frame,
// followed by non-parameter locals and operand stack homes, then alignment padding, the
// frame header (return address) and finally the parameters in the caller's area.

//! Abstract frame state and concrete frame layout.

use bumpalo::Bump;

use crate::arch::Register;

use super::event::EventId;
use super::site::Site;
use super::value::{FrameHome, ReadId, ValueId};

/// Entry of the persistent operand stack.
#[derive(Debug)]
pub struct StackNode<'a> {
    pub value: ValueId,
    /// Depth of this entry, counted from the bottom.
    pub index: u32,
    pub next: Option<&'a StackNode<'a>>,
}

/// Snapshot of the logical operand stack and locals.
#[derive(Debug, Clone, Copy)]
pub struct FrameState<'a> {
    pub stack: Option<&'a StackNode<'a>>,
    pub locals: &'a [Option<ValueId>],
}

impl<'a> FrameState<'a> {
    pub fn new(arena: &'a Bump, local_count: usize) -> Self {
        Self {
            stack: None,
            locals: arena.alloc_slice_fill_copy(local_count, None),
        }
    }

    pub fn depth(&self) -> u32 {
        self.stack.map_or(0, |node| node.index + 1)
    }

    pub fn push(self, arena: &'a Bump, value: ValueId) -> Self {
        let node = arena.alloc(StackNode {
            value,
            index: self.depth(),
            next: self.stack,
        });
        Self {
            stack: Some(node),
            locals: self.locals,
        }
    }

    pub fn pop(self) -> Option<(ValueId, Self)> {
        let node = self.stack?;
        Some((
            node.value,
            Self {
                stack: node.next,
                locals: self.locals,
            },
        ))
    }

    /// Value `depth` entries below the top of the stack.
    pub fn peek(&self, depth: u32) -> Option<ValueId> {
        let mut node = self.stack?;
        for _ in 0..depth {
            node = node.next?;
        }
        Some(node.value)
    }

    pub fn local(&self, index: u32) -> Option<ValueId> {
        self.locals.get(index as usize).copied().flatten()
    }

    pub fn store_local(self, arena: &'a Bump, index: u32, value: Option<ValueId>) -> Self {
        let locals = arena.alloc_slice_copy(self.locals);
        if let Some(slot) = locals.get_mut(index as usize) {
            *slot = value;
        }
        Self {
            stack: self.stack,
            locals,
        }
    }

    /// Value held in the slot named by `home`.
    pub fn slot(&self, home: FrameHome) -> Option<ValueId> {
        match home {
            FrameHome::Local(index) => self.local(index),
            FrameHome::Stack(index) => {
                let mut node = self.stack;
                while let Some(n) = node {
                    if n.index == index {
                        return Some(n.value);
                    }
                    node = n.next;
                }
                None
            }
        }
    }

    /// Every occupied slot of the abstract frame, locals first.
    pub fn slots(&self) -> Vec<(FrameHome, ValueId)> {
        let mut slots: Vec<_> = self
            .locals
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (FrameHome::Local(i as u32), v)))
            .collect();
        let base = slots.len();
        let mut node = self.stack;
        while let Some(n) = node {
            slots.push((FrameHome::Stack(n.index), n.value));
            node = n.next;
        }
        slots[base..].reverse();
        slots
    }
}

/// State captured by `save_state` and reinstated by `restore_state`.
#[derive(Debug, Clone)]
pub struct ForkState<'a> {
    pub frame: FrameState<'a>,
    pub predecessor: Option<EventId>,
    /// Multi reads added to the live values at the fork point.
    pub multi_reads: Vec<(ValueId, ReadId)>,
}

/// Word-granular layout of a compiled frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    pub stack_register: Register,
    pub word_size: u32,
    pub outgoing_footprint: u32,
    /// Leading parameters passed in registers; their homes are ordinary locals.
    pub register_parameters: u32,
    /// Parameters passed on the stack, living in the caller's area.
    pub parameter_footprint: u32,
    /// Locals including parameters.
    pub local_footprint: u32,
    pub stack_capacity: u32,
    pub frame_header_size: u32,
    /// Words reserved below the header, padded for alignment.
    pub aligned_words: u32,
}

impl FrameLayout {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stack_register: Register,
        word_size: u32,
        frame_header_size: u32,
        alignment_in_words: u32,
        register_parameters: u32,
        parameter_footprint: u32,
        local_footprint: u32,
        stack_capacity: u32,
        outgoing_footprint: u32,
    ) -> Self {
        let local_footprint = local_footprint.max(register_parameters + parameter_footprint);
        let body = outgoing_footprint + (local_footprint - parameter_footprint) + stack_capacity;
        let alignment = alignment_in_words.max(1);
        let mut aligned_words = body;
        while (aligned_words + frame_header_size) % alignment != 0 {
            aligned_words += 1;
        }
        Self {
            stack_register,
            word_size,
            outgoing_footprint,
            register_parameters,
            parameter_footprint,
            local_footprint,
            stack_capacity,
            frame_header_size,
            aligned_words,
        }
    }

    /// Small layout for unit tests: two outgoing slots, one stack parameter,
    /// three locals and four stack entries.
    #[cfg(test)]
    pub fn for_test(stack_register: Register, word_size: u32) -> Self {
        Self::new(stack_register, word_size, 1, 2, 0, 1, 3, 4, 2)
    }

    /// Number of addressable frame indices.
    pub fn frame_count(&self) -> u32 {
        self.aligned_words + self.parameter_footprint
    }

    pub fn index_to_offset(&self, index: u32) -> i32 {
        let words = if index < self.aligned_words {
            index
        } else {
            index + self.frame_header_size
        };
        (words * self.word_size) as i32
    }

    pub fn offset_to_index(&self, offset: i32) -> Option<u32> {
        if offset < 0 || offset as u32 % self.word_size != 0 {
            return None;
        }
        let words = offset as u32 / self.word_size;
        if words < self.aligned_words {
            return Some(words);
        }
        let index = words.checked_sub(self.frame_header_size)?;
        (index >= self.aligned_words && index < self.frame_count()).then_some(index)
    }

    /// Frame index of a logical home.
    pub fn home_index(&self, home: FrameHome) -> u32 {
        let first_stack_parameter = self.register_parameters;
        let end_stack_parameters = first_stack_parameter + self.parameter_footprint;
        match home {
            FrameHome::Local(local) if (first_stack_parameter..end_stack_parameters).contains(&local) => {
                self.aligned_words + local - first_stack_parameter
            }
            FrameHome::Local(local) if local < first_stack_parameter => {
                self.outgoing_footprint + local
            }
            FrameHome::Local(local) => {
                self.outgoing_footprint + local - self.parameter_footprint
            }
            FrameHome::Stack(depth) => {
                self.outgoing_footprint + self.local_footprint - self.parameter_footprint + depth
            }
        }
    }

    pub fn site(&self, index: u32) -> Site {
        Site::frame(self.stack_register, self.index_to_offset(index))
    }

    pub fn home_site(&self, home: FrameHome) -> Site {
        self.site(self.home_index(home))
    }

    /// Slot for the `index`th stack-passed call argument.
    pub fn outgoing_site(&self, index: u32) -> Site {
        self.site(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistent_stack() {
        let arena = Bump::new();
        let empty = FrameState::new(&arena, 2);
        let one = empty.push(&arena, ValueId(1));
        let two = one.push(&arena, ValueId(2));

        assert_eq!(empty.depth(), 0);
        assert_eq!(two.depth(), 2);
        assert_eq!(two.peek(0), Some(ValueId(2)));
        assert_eq!(two.peek(1), Some(ValueId(1)));

        let (top, rest) = two.pop().unwrap();
        assert_eq!(top, ValueId(2));
        assert_eq!(rest.depth(), 1);
        // Older snapshots are untouched.
        assert_eq!(one.peek(0), Some(ValueId(1)));
        assert!(empty.pop().is_none());
    }

    #[test]
    fn test_copy_on_write_locals() {
        let arena = Bump::new();
        let base = FrameState::new(&arena, 3);
        let stored = base.store_local(&arena, 1, Some(ValueId(7)));
        assert_eq!(stored.local(1), Some(ValueId(7)));
        assert_eq!(base.local(1), None);
        assert_eq!(stored.local(9), None);
    }

    #[test]
    fn test_slots_order() {
        let arena = Bump::new();
        let state = FrameState::new(&arena, 2)
            .store_local(&arena, 1, Some(ValueId(5)))
            .push(&arena, ValueId(8))
            .push(&arena, ValueId(9));
        assert_eq!(
            state.slots(),
            vec![
                (FrameHome::Local(1), ValueId(5)),
                (FrameHome::Stack(0), ValueId(8)),
                (FrameHome::Stack(1), ValueId(9)),
            ]
        );
        assert_eq!(state.slot(FrameHome::Stack(0)), Some(ValueId(8)));
        assert_eq!(state.slot(FrameHome::Local(1)), Some(ValueId(5)));
        assert_eq!(state.slot(FrameHome::Stack(2)), None);
    }

    #[test]
    fn test_layout_indices() {
        let layout = FrameLayout::for_test(4, 8);
        // 2 outgoing + 2 locals + 4 stack = 8 words, padded so that the header
        // keeps the frame two-word aligned.
        assert_eq!(layout.aligned_words, 9);
        assert_eq!(layout.frame_count(), 10);

        assert_eq!(layout.home_index(FrameHome::Local(1)), 2);
        assert_eq!(layout.home_index(FrameHome::Stack(0)), 4);
        assert_eq!(layout.home_index(FrameHome::Local(0)), 9);

        // Parameters live above the return address.
        assert_eq!(layout.index_to_offset(9), 80);
        assert_eq!(layout.offset_to_index(80), Some(9));
        assert_eq!(layout.offset_to_index(72), None);
        assert_eq!(layout.offset_to_index(12), None);
        assert_eq!(layout.outgoing_site(1), Site::frame(4, 8));
    }

    #[test]
    fn test_register_parameters_get_local_homes() {
        // Two register parameters, one stack parameter, four locals in all.
        let layout = FrameLayout::new(4, 8, 1, 2, 2, 1, 4, 0, 0);
        assert_eq!(layout.home_index(FrameHome::Local(0)), 0);
        assert_eq!(layout.home_index(FrameHome::Local(1)), 1);
        assert_eq!(layout.home_index(FrameHome::Local(3)), 2);
        assert_eq!(layout.home_index(FrameHome::Local(2)), layout.aligned_words);
    }
}

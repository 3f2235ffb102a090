//! Deferred integers resolved once the final code layout is known.
//!
//! Code offsets, constant pool addresses and values derived from them are
//! handed out as [`PromiseId`]s while events are still being compiled. Once
//! the driver has placed every block, the table is given a [`CodeLayout`]
//! and each promise can produce its final value. Listeners registered on a
//! promise fire exactly once, when that value first becomes known.

use std::fmt;

/// Handle to a promise in a [`PromiseTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(pub usize);

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Position inside an assembler block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeOffset {
    pub block: usize,
    pub offset: usize,
}

/// Final placement of blocks and the constant pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeLayout {
    pub base_address: u64,
    pub block_starts: Vec<usize>,
    pub code_length: usize,
    pub pool_offset: usize,
    pub word_size: u32,
}

impl CodeLayout {
    pub fn total_length(&self, pool_entries: usize) -> usize {
        self.pool_offset + pool_entries * self.word_size as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promise {
    Resolved(i64),
    /// Machine position of an event; `None` until the event is compiled.
    Code(Option<CodeOffset>),
    /// Address of a constant pool entry.
    Pool(usize),
    /// `(base >> shift) & mask`, used to split deferred wide constants.
    ShiftMask { base: PromiseId, shift: u32, mask: i64 },
}

/// Callback invoked with the final value of a promise.
pub type Listener = Box<dyn FnMut(i64)>;

/// Arena of promises for one compilation unit.
#[derive(Default)]
pub struct PromiseTable {
    promises: Vec<Promise>,
    listeners: Vec<(PromiseId, Listener)>,
    layout: Option<CodeLayout>,
    pool: Vec<PromiseId>,
}

impl fmt::Debug for PromiseTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseTable")
            .field("promises", &self.promises)
            .field("listeners", &self.listeners.len())
            .field("layout", &self.layout)
            .field("pool", &self.pool)
            .finish()
    }
}

impl PromiseTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, promise: Promise) -> PromiseId {
        self.promises.push(promise);
        PromiseId(self.promises.len() - 1)
    }

    pub fn resolved(&mut self, value: i64) -> PromiseId {
        self.push(Promise::Resolved(value))
    }

    /// A code position to be filled in by [`PromiseTable::set_code_offset`].
    pub fn code(&mut self) -> PromiseId {
        self.push(Promise::Code(None))
    }

    pub fn shift_mask(&mut self, base: PromiseId, shift: u32, mask: i64) -> PromiseId {
        self.push(Promise::ShiftMask { base, shift, mask })
    }

    /// Append a word holding `value` to the constant pool and return the
    /// promise of its address.
    pub fn pool_append(&mut self, value: PromiseId) -> PromiseId {
        self.pool.push(value);
        let index = self.pool.len() - 1;
        self.push(Promise::Pool(index))
    }

    pub fn pool_entries(&self) -> &[PromiseId] {
        &self.pool
    }

    pub fn get(&self, id: PromiseId) -> Option<&Promise> {
        self.promises.get(id.0)
    }

    pub fn set_code_offset(&mut self, id: PromiseId, offset: CodeOffset) {
        if let Some(slot) = self.promises.get_mut(id.0) {
            *slot = Promise::Code(Some(offset));
        }
    }

    /// Code offset recorded for `id`, if it is a placed code promise.
    pub fn code_offset(&self, id: PromiseId) -> Option<CodeOffset> {
        match self.promises.get(id.0) {
            Some(Promise::Code(offset)) => *offset,
            _ => None,
        }
    }

    /// Whether the final value of `id` can be computed right now.
    pub fn is_resolved(&self, id: PromiseId) -> bool {
        self.value(id).is_some()
    }

    /// Final value, or `None` while layout (or the event) is still pending.
    pub fn value(&self, id: PromiseId) -> Option<i64> {
        match *self.promises.get(id.0)? {
            Promise::Resolved(value) => Some(value),
            Promise::Code(offset) => {
                let offset = offset?;
                let layout = self.layout.as_ref()?;
                let start = *layout.block_starts.get(offset.block)?;
                Some((layout.base_address + (start + offset.offset) as u64) as i64)
            }
            Promise::Pool(index) => {
                let layout = self.layout.as_ref()?;
                let entry = layout.pool_offset + index * layout.word_size as usize;
                Some((layout.base_address + entry as u64) as i64)
            }
            Promise::ShiftMask { base, shift, mask } => Some((self.value(base)? >> shift) & mask),
        }
    }

    /// Register a callback for the final value of `id`.
    ///
    /// Fires immediately if the value is already known.
    pub fn listen(&mut self, id: PromiseId, mut listener: Listener) {
        match self.value(id) {
            Some(value) => listener(value),
            None => self.listeners.push((id, listener)),
        }
    }

    pub fn layout(&self) -> Option<&CodeLayout> {
        self.layout.as_ref()
    }

    /// Install the final layout and notify every listener that can now
    /// compute its value.
    pub fn set_layout(&mut self, layout: CodeLayout) {
        self.layout = Some(layout);
        let pending = std::mem::take(&mut self.listeners);
        for (id, mut listener) in pending {
            match self.value(id) {
                Some(value) => listener(value),
                None => self.listeners.push((id, listener)),
            }
        }
    }

    /// First promise whose value is still unknown, if any listeners or pool
    /// entries depend on one.
    pub fn first_unresolved(&self) -> Option<PromiseId> {
        self.listeners
            .iter()
            .map(|(id, _)| *id)
            .chain(self.pool.iter().copied())
            .find(|id| !self.is_resolved(*id))
    }

    pub fn len(&self) -> usize {
        self.promises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.promises.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn layout() -> CodeLayout {
        CodeLayout {
            base_address: 0x1000,
            block_starts: vec![0, 32],
            code_length: 48,
            pool_offset: 48,
            word_size: 8,
        }
    }

    #[test]
    fn test_resolved_and_derived() {
        let mut table = PromiseTable::new();
        let wide = table.resolved(0x1234_5678_9abc_def0);
        let low = table.shift_mask(wide, 0, 0xffff_ffff);
        let high = table.shift_mask(wide, 32, 0xffff_ffff);
        assert_eq!(table.value(low), Some(0x9abc_def0));
        assert_eq!(table.value(high), Some(0x1234_5678));
    }

    #[test]
    fn test_code_offset_waits_for_layout() {
        let mut table = PromiseTable::new();
        let ip = table.code();
        assert_eq!(table.value(ip), None);

        table.set_code_offset(ip, CodeOffset { block: 1, offset: 4 });
        assert_eq!(table.value(ip), None);

        table.set_layout(layout());
        assert_eq!(table.value(ip), Some(0x1000 + 36));
    }

    #[test]
    fn test_pool_addresses() {
        let mut table = PromiseTable::new();
        let a = table.resolved(7);
        let b = table.resolved(9);
        let first = table.pool_append(a);
        let second = table.pool_append(b);
        table.set_layout(layout());
        assert_eq!(table.value(first), Some(0x1000 + 48));
        assert_eq!(table.value(second), Some(0x1000 + 56));
        assert_eq!(table.pool_entries(), &[a, b]);
    }

    #[test]
    fn test_listener_fires_once_on_layout() {
        let mut table = PromiseTable::new();
        let ip = table.code();
        table.set_code_offset(ip, CodeOffset { block: 0, offset: 8 });

        let seen = Rc::new(Cell::new(0i64));
        let hits = Rc::new(Cell::new(0u32));
        let (seen2, hits2) = (seen.clone(), hits.clone());
        table.listen(
            ip,
            Box::new(move |value| {
                seen2.set(value);
                hits2.set(hits2.get() + 1);
            }),
        );
        assert_eq!(hits.get(), 0);

        table.set_layout(layout());
        assert_eq!(seen.get(), 0x1008);
        assert_eq!(hits.get(), 1);
        assert_eq!(table.first_unresolved(), None);
    }

    #[test]
    fn test_unresolved_listener_reported() {
        let mut table = PromiseTable::new();
        let never = table.code();
        table.listen(never, Box::new(|_| {}));
        table.set_layout(layout());
        assert_eq!(table.first_unresolved(), Some(never));
    }
}

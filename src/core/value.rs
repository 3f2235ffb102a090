// This module implements the value and read tables for the allocator. A Value is an abstract
// operand: it tracks the sites it currently occupies, the chain of reads that will consume it
// (FIFO in declaration order, except that stubs may be dropped early), its buddy ring (other
// values provably holding the same bits right now, linked by index), the value holding its
// upper word on narrow targets, and its home frame slot. Fixed placements are expressed as
// single-site read masks rather than stored on the value. A Read is a consumption request:
// single reads carry a SiteMask, multi reads aggregate the first reads of each control flow
// path leaving a fork, and stub reads keep a value alive across a junction edge until the
// consumer on the other side is known. Everything is stored in index-addressed vectors so
// buddy rings and read chains never dangle.

//! Values, reads and buddy rings.

use std::fmt;

use super::error::{CompileError, CompileResult};
use super::event::EventId;
use super::site::{Site, SiteMask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub usize);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValueType {
    #[default]
    Integer,
    Float,
}

/// Logical home of a value in the abstract frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameHome {
    Local(u32),
    Stack(u32),
}

#[derive(Debug, Clone)]
pub struct Value {
    pub ty: ValueType,
    /// Bytes held by this value; one word at most per part.
    pub size: u32,
    pub sites: Vec<Site>,
    /// Next unconsumed read.
    pub reads: Option<ReadId>,
    pub last_read: Option<ReadId>,
    /// Next member of the buddy ring; `self` when alone.
    pub buddy: ValueId,
    /// Upper word of a two-word value on a narrow target.
    pub high: Option<ValueId>,
    pub home: Option<FrameHome>,
    /// Multi read waiting for the first read along the current path.
    pub pending_multi: Option<ReadId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadKind {
    Single { mask: SiteMask },
    Multi { alternatives: Vec<ReadId> },
    Stub { target: Option<ReadId> },
}

#[derive(Debug, Clone)]
pub struct Read {
    pub kind: ReadKind,
    pub value: ValueId,
    pub event: Option<EventId>,
    pub next: Option<ReadId>,
    pub popped: bool,
}

/// Arena of values and reads for one compilation unit.
#[derive(Debug, Default)]
pub struct ValueTable {
    values: Vec<Value>,
    reads: Vec<Read>,
}

impl ValueTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, ty: ValueType, size: u32) -> ValueId {
        let id = ValueId(self.values.len());
        self.values.push(Value {
            ty,
            size,
            sites: Vec::new(),
            reads: None,
            last_read: None,
            buddy: id,
            high: None,
            home: None,
            pending_multi: None,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, id: ValueId) -> &Value {
        &self.values[id.0]
    }

    pub fn get_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.values[id.0]
    }

    pub fn read(&self, id: ReadId) -> &Read {
        &self.reads[id.0]
    }

    pub fn read_mut(&mut self, id: ReadId) -> &mut Read {
        &mut self.reads[id.0]
    }

    /// Append a read to the end of `value`'s chain.
    pub fn append_read(
        &mut self,
        value: ValueId,
        kind: ReadKind,
        event: Option<EventId>,
    ) -> ReadId {
        let id = ReadId(self.reads.len());
        let single = matches!(kind, ReadKind::Single { .. });
        self.reads.push(Read {
            kind,
            value,
            event,
            next: None,
            popped: false,
        });

        if single {
            if let Some(multi) = self.values[value.0].pending_multi.take() {
                if let ReadKind::Multi { alternatives } = &mut self.reads[multi.0].kind {
                    alternatives.push(id);
                }
            }
        }

        let v = &mut self.values[value.0];
        match v.last_read {
            Some(last) => self.reads[last.0].next = Some(id),
            None => v.reads = Some(id),
        }
        self.values[value.0].last_read = Some(id);
        id
    }

    pub fn head(&self, value: ValueId) -> Option<ReadId> {
        self.values[value.0].reads
    }

    /// Consume `read`.
    ///
    /// Single and multi reads must be at the head of their value's chain.
    /// Stub reads may be unlinked from anywhere: a link created after the
    /// successor's code was built appends its stubs behind later reads.
    pub fn pop_read(&mut self, read: ReadId) -> CompileResult<()> {
        let value = self.reads[read.0].value;
        let head = self.values[value.0].reads;
        let next = self.reads[read.0].next;
        if head == Some(read) {
            self.values[value.0].reads = next;
        } else {
            let stub = matches!(self.reads[read.0].kind, ReadKind::Stub { .. });
            let previous = self.previous_read(value, read).filter(|_| stub);
            let Some(previous) = previous else {
                return Err(CompileError::invalid(format!(
                    "read {} of {value} consumed out of order",
                    read.0
                )));
            };
            self.reads[previous.0].next = next;
            if next.is_none() {
                self.values[value.0].last_read = Some(previous);
            }
        }
        self.reads[read.0].popped = true;
        self.reads[read.0].next = None;
        if self.values[value.0].reads.is_none() {
            self.values[value.0].last_read = None;
        }
        Ok(())
    }

    fn previous_read(&self, value: ValueId, read: ReadId) -> Option<ReadId> {
        let mut cursor = self.values[value.0].reads;
        while let Some(current) = cursor {
            let next = self.reads[current.0].next;
            if next == Some(read) {
                return Some(current);
            }
            cursor = next;
        }
        None
    }

    pub fn valid(&self, read: ReadId) -> bool {
        let r = &self.reads[read.0];
        if r.popped {
            return false;
        }
        match &r.kind {
            ReadKind::Single { .. } | ReadKind::Stub { .. } => true,
            ReadKind::Multi { alternatives } => {
                alternatives.is_empty() || alternatives.iter().any(|a| !self.reads[a.0].popped)
            }
        }
    }

    /// Constraint carried by `read`, `None` meaning unconstrained.
    pub fn mask(&self, read: ReadId) -> Option<SiteMask> {
        match &self.reads[read.0].kind {
            ReadKind::Single { mask } => Some(*mask),
            ReadKind::Stub { target } => target.and_then(|t| self.mask(t)),
            ReadKind::Multi { alternatives } => {
                let mut result: Option<SiteMask> = None;
                for alternative in alternatives {
                    if let Some(mask) = self.mask(*alternative) {
                        result = Some(match result {
                            Some(acc) => acc.intersect(&mask),
                            None => mask,
                        });
                    }
                }
                result
            }
        }
    }

    /// Resolve a stub read to the consumer it stands in for.
    pub fn set_stub_target(&mut self, stub: ReadId, target: Option<ReadId>) {
        if let ReadKind::Stub { target: slot } = &mut self.reads[stub.0].kind {
            *slot = target;
        }
    }

    /// First read of `value` whose event is at or after `event`.
    pub fn first_read_from(&self, value: ValueId, event: EventId) -> Option<ReadId> {
        let mut cursor = self.values[value.0].reads;
        while let Some(read) = cursor {
            let r = &self.reads[read.0];
            if matches!(r.kind, ReadKind::Single { .. }) && r.event.is_some_and(|e| e >= event) {
                return Some(read);
            }
            cursor = r.next;
        }
        None
    }

    /// Members of `value`'s buddy ring, starting with `value`.
    pub fn ring(&self, value: ValueId) -> Vec<ValueId> {
        let mut members = vec![value];
        let mut cursor = self.values[value.0].buddy;
        while cursor != value {
            members.push(cursor);
            cursor = self.values[cursor.0].buddy;
        }
        members
    }

    pub fn is_buddy(&self, a: ValueId, b: ValueId) -> bool {
        a == b || self.ring(a).contains(&b)
    }

    /// Whether any member of the ring still has a valid read.
    pub fn live(&self, value: ValueId) -> bool {
        self.ring(value)
            .into_iter()
            .any(|member| self.head(member).is_some_and(|r| self.valid(r)))
    }

    /// Link `buddy` into `original`'s ring.
    pub fn add_buddy(&mut self, original: ValueId, buddy: ValueId) {
        if self.is_buddy(original, buddy) {
            return;
        }
        self.remove_buddy(buddy);
        let next = self.values[original.0].buddy;
        self.values[buddy.0].buddy = next;
        self.values[original.0].buddy = buddy;
    }

    /// Unlink `value` from its ring, returning the member that followed it.
    pub fn remove_buddy(&mut self, value: ValueId) -> Option<ValueId> {
        let next = self.values[value.0].buddy;
        if next == value {
            return None;
        }
        let mut previous = next;
        while self.values[previous.0].buddy != value {
            previous = self.values[previous.0].buddy;
        }
        self.values[previous.0].buddy = next;
        self.values[value.0].buddy = value;
        Some(next)
    }

    /// Every site held by any member of the ring.
    pub fn ring_sites(&self, value: ValueId) -> Vec<(ValueId, Site)> {
        self.ring(value)
            .into_iter()
            .flat_map(|member| {
                self.values[member.0]
                    .sites
                    .iter()
                    .map(move |site| (member, *site))
            })
            .collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = ValueId> {
        (0..self.values.len()).map(ValueId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::REGISTER_MASK;
    use crate::core::site::FrameConstraint;

    fn single(registers: u64) -> ReadKind {
        ReadKind::Single {
            mask: SiteMask::new(REGISTER_MASK, registers, FrameConstraint::None),
        }
    }

    #[test]
    fn test_reads_are_fifo() {
        let mut table = ValueTable::new();
        let v = table.create(ValueType::Integer, 8);
        let r1 = table.append_read(v, single(1), Some(EventId(0)));
        let r2 = table.append_read(v, single(2), Some(EventId(1)));

        assert_eq!(table.head(v), Some(r1));
        assert!(table.pop_read(r2).is_err());
        table.pop_read(r1).unwrap();
        assert_eq!(table.head(v), Some(r2));
        table.pop_read(r2).unwrap();
        assert_eq!(table.head(v), None);
        assert!(!table.live(v));

        // The chain restarts cleanly after being drained.
        let r3 = table.append_read(v, single(4), Some(EventId(2)));
        assert_eq!(table.head(v), Some(r3));
    }

    #[test]
    fn test_buddy_ring() {
        let mut table = ValueTable::new();
        let a = table.create(ValueType::Integer, 8);
        let b = table.create(ValueType::Integer, 8);
        let c = table.create(ValueType::Integer, 8);
        table.add_buddy(a, b);
        table.add_buddy(a, c);
        assert_eq!(table.ring(a).len(), 3);
        assert!(table.is_buddy(b, c));

        assert!(table.remove_buddy(b).is_some());
        assert!(!table.is_buddy(a, b));
        assert!(table.is_buddy(a, c));
        assert_eq!(table.ring(b), vec![b]);
    }

    #[test]
    fn test_liveness_through_buddy() {
        let mut table = ValueTable::new();
        let a = table.create(ValueType::Integer, 8);
        let b = table.create(ValueType::Integer, 8);
        table.add_buddy(a, b);
        table.append_read(b, single(1), Some(EventId(0)));
        assert!(table.live(a));
        table.remove_buddy(b);
        assert!(!table.live(a));
    }

    #[test]
    fn test_multi_read_collects_alternatives() {
        let mut table = ValueTable::new();
        let v = table.create(ValueType::Integer, 8);
        let multi = table.append_read(
            v,
            ReadKind::Multi {
                alternatives: Vec::new(),
            },
            None,
        );
        table.get_mut(v).pending_multi = Some(multi);
        let left = table.append_read(v, single(0b0110), Some(EventId(1)));
        table.get_mut(v).pending_multi = Some(multi);
        let right = table.append_read(v, single(0b0011), Some(EventId(2)));

        match &table.read(multi).kind {
            ReadKind::Multi { alternatives } => assert_eq!(alternatives, &vec![left, right]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(table.mask(multi).unwrap().registers, 0b0010);
        assert!(table.valid(multi));
    }

    #[test]
    fn test_stub_takes_target_mask() {
        let mut table = ValueTable::new();
        let v = table.create(ValueType::Integer, 8);
        let w = table.create(ValueType::Integer, 8);
        let target = table.append_read(w, single(0b1000), Some(EventId(5)));
        let stub = table.append_read(v, ReadKind::Stub { target: None }, None);
        assert_eq!(table.mask(stub), None);
        table.set_stub_target(stub, Some(target));
        assert_eq!(table.mask(stub).unwrap().registers, 0b1000);
        assert_eq!(table.first_read_from(w, EventId(3)), Some(target));
        assert_eq!(table.first_read_from(w, EventId(6)), None);
    }

    #[test]
    fn test_late_stub_unlinks_from_tail() {
        let mut table = ValueTable::new();
        let v = table.create(ValueType::Integer, 8);
        let early = table.append_read(v, single(1), Some(EventId(4)));
        let stub = table.append_read(v, ReadKind::Stub { target: None }, Some(EventId(1)));

        table.pop_read(stub).unwrap();
        assert_eq!(table.head(v), Some(early));
        let later = table.append_read(v, single(2), Some(EventId(5)));
        table.pop_read(early).unwrap();
        assert_eq!(table.head(v), Some(later));
    }
}

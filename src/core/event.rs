// This module defines the event graph built by the front end and walked by the compile
// driver. Every operation the front end requests becomes an Event appended to a linear list;
// the list order is the compile order and, except for junction moves, the code order. Each
// event owns the reads it declared at construction (in declaration order), the abstract frame
// state before it, an optional code position promise, and links to predecessors and
// successors. Links into the first event of a logical instruction carry one stub read per
// occupied frame slot, keeping the predecessor's slot values alive until the edge has been
// resolved. Junction events (more than one predecessor) lazily receive a table mapping frame
// slots to agreed sites; single-predecessor events reached out of order receive a snapshot
// of every value's sites and buddy link captured when their predecessor was compiled.

//! The event graph.

use std::fmt;

use crate::arch::{BinaryOp, BranchOp, NullaryOp, Register, TernaryOp};

use super::frame::FrameState;
use super::promise::PromiseId;
use super::site::Site;
use super::value::{FrameHome, ReadId, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub usize);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub usize);

/// Sized argument of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallArgument {
    pub size: u32,
    pub value: ValueId,
}

/// Operation performed by an event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// Marks the start of a logical instruction; emits nothing.
    Dummy,
    /// Parameter arriving in its home frame slot.
    FrameSite { value: ValueId, home: FrameHome },
    /// Value arriving in a fixed register.
    RegisterSite { value: ValueId, register: Register },
    Move {
        op: BinaryOp,
        source_size: u32,
        source: ValueId,
        destination_size: u32,
        result: ValueId,
    },
    Store {
        op: BinaryOp,
        source_size: u32,
        source: ValueId,
        destination_size: u32,
        destination: ValueId,
    },
    Combine {
        op: TernaryOp,
        size: u32,
        first: ValueId,
        second: ValueId,
        result_size: u32,
        result: ValueId,
    },
    Translate {
        op: BinaryOp,
        size: u32,
        source: ValueId,
        result_size: u32,
        result: ValueId,
    },
    Branch {
        op: BranchOp,
        size: u32,
        first: ValueId,
        second: ValueId,
        target: PromiseId,
    },
    Jump { target: PromiseId },
    Call {
        address: ValueId,
        arguments: Vec<CallArgument>,
        result_size: u32,
        result: Option<ValueId>,
    },
    Return { size: u32, value: Option<ValueId> },
    BoundsCheck {
        object: ValueId,
        length_offset: i32,
        index: ValueId,
        handler: i64,
    },
    Memory {
        base: ValueId,
        displacement: i32,
        index: Option<ValueId>,
        scale: u8,
        result: ValueId,
    },
    Operation { op: NullaryOp },
}

impl EventKind {
    /// Short name used in logs and statistics.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Dummy => "dummy",
            EventKind::FrameSite { .. } => "frame-site",
            EventKind::RegisterSite { .. } => "register-site",
            EventKind::Move { .. } => "move",
            EventKind::Store { .. } => "store",
            EventKind::Combine { .. } => "combine",
            EventKind::Translate { .. } => "translate",
            EventKind::Branch { .. } => "branch",
            EventKind::Jump { .. } => "jump",
            EventKind::Call { .. } => "call",
            EventKind::Return { .. } => "return",
            EventKind::BoundsCheck { .. } => "bounds-check",
            EventKind::Memory { .. } => "memory",
            EventKind::Operation { .. } => "operation",
        }
    }

    /// Events whose outgoing edges are resolved before the instruction is
    /// emitted, because control leaves through the instruction itself.
    pub fn is_branch(&self) -> bool {
        matches!(self, EventKind::Branch { .. } | EventKind::Jump { .. })
    }

    /// Control never falls through to the next event.
    pub fn ends_flow(&self) -> bool {
        matches!(self, EventKind::Jump { .. } | EventKind::Return { .. })
    }
}

/// Agreed site of one frame slot at a junction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JunctionSite {
    pub home: FrameHome,
    pub site: Site,
}

/// Saved placement of one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub value: ValueId,
    pub buddy: ValueId,
    pub sites: Vec<Site>,
}

/// Control flow edge.
#[derive(Debug, Clone)]
pub struct Link<'a> {
    pub predecessor: EventId,
    pub successor: EventId,
    /// Abstract frame on the predecessor side.
    pub frame: FrameState<'a>,
    /// Stub reads keeping the predecessor's slot values alive.
    pub stubs: Vec<(FrameHome, ReadId)>,
}

#[derive(Debug, Clone)]
pub struct Event<'a> {
    pub kind: EventKind,
    pub reads: Vec<ReadId>,
    pub frame_before: FrameState<'a>,
    pub predecessors: Vec<LinkId>,
    pub successors: Vec<LinkId>,
    /// Code position of the event, if anything refers to it.
    pub promise: Option<PromiseId>,
    pub logical_ip: Option<u32>,
    pub junction: Option<Vec<JunctionSite>>,
    pub snapshot: Option<Vec<SnapshotEntry>>,
    /// Multi reads added when the front end saved state after this event.
    pub fork_reads: Vec<ReadId>,
}

impl<'a> Event<'a> {
    pub fn new(kind: EventKind, frame_before: FrameState<'a>) -> Self {
        Self {
            kind,
            reads: Vec::new(),
            frame_before,
            predecessors: Vec::new(),
            successors: Vec::new(),
            promise: None,
            logical_ip: None,
            junction: None,
            snapshot: None,
            fork_reads: Vec::new(),
        }
    }
}

/// Events and links of one compilation unit.
#[derive(Debug, Default)]
pub struct EventGraph<'a> {
    events: Vec<Event<'a>>,
    links: Vec<Link<'a>>,
}

impl<'a> EventGraph<'a> {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn append(&mut self, event: Event<'a>) -> EventId {
        self.events.push(event);
        EventId(self.events.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, id: EventId) -> &Event<'a> {
        &self.events[id.0]
    }

    pub fn get_mut(&mut self, id: EventId) -> &mut Event<'a> {
        &mut self.events[id.0]
    }

    pub fn link(&self, id: LinkId) -> &Link<'a> {
        &self.links[id.0]
    }

    pub fn add_link(
        &mut self,
        predecessor: EventId,
        successor: EventId,
        frame: FrameState<'a>,
        stubs: Vec<(FrameHome, ReadId)>,
    ) -> LinkId {
        let id = LinkId(self.links.len());
        self.links.push(Link {
            predecessor,
            successor,
            frame,
            stubs,
        });
        self.events[predecessor.0].successors.push(id);
        self.events[successor.0].predecessors.push(id);
        id
    }

    pub fn is_junction(&self, id: EventId) -> bool {
        self.events[id.0].predecessors.len() > 1
    }

    /// Whether entering `id` goes through a junction table: several
    /// predecessors, or a predecessor compiled no earlier than `id` itself.
    pub fn needs_table(&self, id: EventId) -> bool {
        self.is_junction(id) || self.has_back_edge(id)
    }

    pub fn predecessor_events(&self, id: EventId) -> Vec<EventId> {
        self.events[id.0]
            .predecessors
            .iter()
            .map(|l| self.links[l.0].predecessor)
            .collect()
    }

    pub fn successor_events(&self, id: EventId) -> Vec<EventId> {
        self.events[id.0]
            .successors
            .iter()
            .map(|l| self.links[l.0].successor)
            .collect()
    }

    /// Whether some predecessor of `id` comes at or after it in compile order.
    pub fn has_back_edge(&self, id: EventId) -> bool {
        self.predecessor_events(id).into_iter().any(|p| p >= id)
    }

    /// Whether code for `id` cannot simply continue the previous event's.
    pub fn starts_block(&self, id: EventId) -> bool {
        if id.0 == 0 {
            return true;
        }
        let previous = EventId(id.0 - 1);
        if self.events[previous.0].kind.ends_flow() {
            return true;
        }
        let predecessors = self.predecessor_events(id);
        predecessors.len() != 1 || predecessors[0] != previous
    }

    /// First branch or jump none of whose successors starts at its target.
    pub fn unlinked_target(&self) -> Option<(EventId, PromiseId)> {
        self.ids().find_map(|id| {
            let target = match self.events[id.0].kind {
                EventKind::Branch { target, .. } | EventKind::Jump { target } => target,
                _ => return None,
            };
            let linked = self
                .successor_events(id)
                .into_iter()
                .any(|s| self.events[s.0].promise == Some(target));
            (!linked).then_some((id, target))
        })
    }

    pub fn ids(&self) -> impl Iterator<Item = EventId> {
        (0..self.events.len()).map(EventId)
    }
}

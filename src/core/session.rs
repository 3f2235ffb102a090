// This module provides arena-based compilation session management using the bumpalo crate.
// CompilationSession owns a reference to the arena that backs the persistent operand stack
// nodes and copy-on-write local arrays of the abstract frame, so every FrameState snapshot
// taken while building events shares the session lifetime and can be copied freely. The
// session also accumulates SessionStats across every unit compiled with it: events compiled
// per kind, reconciling moves inserted, steals, junctions resolved, snapshots restored,
// thunks used, branches folded at compile time and total code size. Statistics are kept in a
// RefCell so the compiler can record them through a shared reference.

//! Arena-based compilation session management.
//!
//! All frame state is tied to the session lifetime, eliminating complex
//! lifetime propagation.

use bumpalo::Bump;
use hashbrown::HashMap;
use std::cell::RefCell;
use std::fmt;

/// Arena-based compilation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for frame state.
    arena: &'arena Bump,

    /// Session statistics for debugging and tuning.
    stats: RefCell<SessionStats>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new compilation session with the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Get access to the arena allocator.
    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    /// Record that a unit was compiled.
    pub fn record_unit_compiled(&self, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.units_compiled += 1;
        stats.total_code_size += code_size;
        stats.largest_unit_size = stats.largest_unit_size.max(code_size);
    }

    /// Record an event compilation.
    pub fn record_event_compiled(&self, kind: &'static str) {
        let mut stats = self.stats.borrow_mut();
        stats.events_compiled += 1;
        *stats.event_counts.entry(kind).or_insert(0) += 1;
    }

    pub fn record_move(&self) {
        self.stats.borrow_mut().moves_inserted += 1;
    }

    pub fn record_steal(&self) {
        self.stats.borrow_mut().steals += 1;
    }

    pub fn record_junction_resolved(&self) {
        self.stats.borrow_mut().junctions_resolved += 1;
    }

    pub fn record_snapshot_restored(&self) {
        self.stats.borrow_mut().snapshots_restored += 1;
    }

    pub fn record_thunk(&self) {
        self.stats.borrow_mut().thunks_used += 1;
    }

    pub fn record_branch_folded(&self) {
        self.stats.borrow_mut().branches_folded += 1;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of units compiled.
    pub units_compiled: usize,

    /// Total code size generated (bytes), constant pools included.
    pub total_code_size: usize,

    pub largest_unit_size: usize,

    /// Number of events compiled.
    pub events_compiled: usize,

    /// Count of each event kind compiled.
    pub event_counts: HashMap<&'static str, usize>,

    /// Moves inserted by the allocator (reads, steals, junctions).
    pub moves_inserted: usize,

    /// Occupants evicted to hand out their resource.
    pub steals: usize,

    /// Junction tables built.
    pub junctions_resolved: usize,

    /// Branch snapshots restored.
    pub snapshots_restored: usize,

    /// Operations lowered to helper calls.
    pub thunks_used: usize,

    /// Conditional branches decided at compile time.
    pub branches_folded: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Session Statistics:")?;
        writeln!(f, "  Units compiled: {}", self.units_compiled)?;
        writeln!(f, "  Events compiled: {}", self.events_compiled)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(f, "  Moves inserted: {}", self.moves_inserted)?;
        writeln!(f, "  Steals: {}", self.steals)?;
        writeln!(f, "  Junctions resolved: {}", self.junctions_resolved)?;
        writeln!(f, "  Snapshots restored: {}", self.snapshots_restored)?;
        writeln!(f, "  Thunks used: {}", self.thunks_used)?;
        writeln!(f, "  Branches folded: {}", self.branches_folded)?;

        if !self.event_counts.is_empty() {
            writeln!(f, "  Event breakdown:")?;
            let mut sorted: Vec<_> = self.event_counts.iter().collect();
            sorted.sort_by_key(|(kind, count)| (std::cmp::Reverse(**count), **kind));

            for (kind, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", kind, count)?;
            }
        }

        Ok(())
    }
}

// This module reconciles allocation state across control flow edges. A junction (an event
// with several predecessors, or one reached by a back edge) gets a table assigning one site to
// every frame slot that is still read from the junction on; the table is fixed at the first
// edge resolved into it and every predecessor moves its slot values into those sites before
// leaving. Tables are built slot by slot: reuse a site agreed for a sibling successor of the
// same event, otherwise keep a register or home slot the value already occupies, otherwise
// price a fresh target, falling back to the slot's home. Entering a junction forgets all
// resource-holding sites and reinstates only the table. Successors with a single predecessor
// that is not the previous event instead get a snapshot of every placed value, captured when
// the predecessor finished and replayed on entry.

//! Junction tables, edge resolution and state snapshots.

use crate::arch::{MEMORY_MASK, REGISTER_MASK};

use super::allocator::Context;
use super::error::{CompileError, CompileResult};
use super::event::{EventId, JunctionSite, LinkId, SnapshotEntry};
use super::frame::FrameState;
use super::site::{Site, SiteMask};
use super::value::ValueId;

/// Stand-in owner for agreed sites whose slot is empty on this side.
const UNKNOWN_VALUE: ValueId = ValueId(usize::MAX);

impl<'c, 'a> Context<'c, 'a> {
    /// Move the values of `id`'s outgoing junction edges into their agreed
    /// sites, agreeing on sites first where no table exists yet.
    pub fn resolve_edges(&mut self, id: EventId) -> CompileResult<()> {
        let junctions: Vec<LinkId> = self
            .events
            .get(id)
            .successors
            .iter()
            .copied()
            .filter(|link| self.events.needs_table(self.events.link(*link).successor))
            .collect();
        if junctions.is_empty() {
            return Ok(());
        }

        let mut merged: Vec<JunctionSite> = Vec::new();
        for link in &junctions {
            let successor = self.events.link(*link).successor;
            if let Some(table) = self.events.get(successor).junction.clone() {
                for entry in table {
                    merge(&mut merged, entry, successor)?;
                }
            }
        }

        for link in &junctions {
            let (successor, frame) = {
                let link = self.events.link(*link);
                (link.successor, link.frame)
            };
            if self.events.get(successor).junction.is_some() {
                continue;
            }
            if successor <= id {
                return Err(CompileError::invalid(format!(
                    "back edge {id} -> {successor} reached before its junction was entered"
                )));
            }
            let table = self.build_table(successor, frame, &merged)?;
            for entry in &table {
                merge(&mut merged, *entry, successor)?;
            }
            log::debug!(
                "{id}: junction table for {successor} with {} slots",
                table.len()
            );
            self.events.get_mut(successor).junction = Some(table);
            self.session.record_junction_resolved();
        }

        let mut filled = Vec::new();
        for link in &junctions {
            let (successor, frame) = {
                let link = self.events.link(*link);
                (link.successor, link.frame)
            };
            let table = self.events.get(successor).junction.clone().unwrap_or_default();
            self.apply_table(successor, frame, &table, &mut filled)?;
        }
        for site in filled.into_iter().rev() {
            self.thaw(site)?;
        }
        Ok(())
    }

    /// Agree on a site for every slot of `successor` that is read again,
    /// given the predecessor-side `frame`.
    fn build_table(
        &mut self,
        successor: EventId,
        frame: FrameState<'a>,
        merged: &[JunctionSite],
    ) -> CompileResult<Vec<JunctionSite>> {
        let entry_frame = self.events.get(successor).frame_before;
        let mut used: Vec<(Site, ValueId)> = merged
            .iter()
            .map(|j| (j.site, entry_frame.slot(j.home).unwrap_or(UNKNOWN_VALUE)))
            .collect();
        let mut table = Vec::new();

        for (home, sv) in entry_frame.slots() {
            let Some(read) = self.values.first_read_from(sv, successor) else {
                continue;
            };
            let Some(pv) = frame.slot(home) else {
                continue;
            };
            if let Some(agreed) = merged.iter().find(|j| j.home == home) {
                table.push(*agreed);
                continue;
            }

            let mask = self.values.mask(read).unwrap_or_else(SiteMask::any);
            let home_site = self.layout.home_site(home);
            let taken: Vec<Site> = used
                .iter()
                .filter(|(_, owner)| *owner != sv)
                .map(|(site, _)| *site)
                .collect();

            let current = self
                .values
                .ring_sites(pv)
                .into_iter()
                .map(|(_, site)| site)
                .filter(|site| matches!(site, Site::Register(_)) || *site == home_site)
                .filter(|site| site.matches(&mask, &self.layout))
                .filter(|site| !taken.contains(site))
                .filter(|site| {
                    // A pin held by pv's own ring (a branch operand) still leaves pv there.
                    self.resource_of(site).map_or(true, |id| {
                        !self.registers.is_frozen(id)
                            || self
                                .registers
                                .owner(id)
                                .is_some_and(|owner| self.values.is_buddy(owner, pv))
                    })
                })
                .min_by_key(|site| site.copy_cost(None));

            let site = match current {
                Some(site) => site,
                None => {
                    let restricted = SiteMask::new(
                        mask.kinds & (REGISTER_MASK | MEMORY_MASK),
                        mask.registers,
                        mask.frame,
                    );
                    let reserve = self.config.resolve_register_reserve;
                    match self.pick_target(pv, restricted, Some(home), reserve, &taken) {
                        Ok(site) => site,
                        Err(CompileError::NoSiteAvailable { .. }) => home_site,
                        Err(err) => return Err(err),
                    }
                }
            };
            log::trace!("{successor}: slot {home:?} of {sv} at {site}");
            used.push((site, sv));
            table.push(JunctionSite { home, site });
        }
        Ok(table)
    }

    /// Move each predecessor-side slot value into its agreed site, leaving
    /// the filled sites pinned in `filled`.
    fn apply_table(
        &mut self,
        successor: EventId,
        frame: FrameState<'a>,
        table: &[JunctionSite],
        filled: &mut Vec<Site>,
    ) -> CompileResult<()> {
        for entry in table {
            let Some(pv) = frame.slot(entry.home) else {
                continue;
            };
            if !self.has_site(pv, &entry.site) {
                if let Some(id) = self.resource_of(&entry.site) {
                    let blocked = self.registers.is_frozen(id)
                        && self
                            .registers
                            .owner(id)
                            .is_some_and(|owner| !self.values.is_buddy(owner, pv));
                    if blocked {
                        return Err(CompileError::JunctionConflict {
                            event: successor.0,
                            reason: format!(
                                "{} is pinned while {pv} must move into it",
                                entry.site
                            ),
                        });
                    }
                }
                let source = self
                    .cheapest_site(pv, None)
                    .ok_or(CompileError::NoSource { value: pv.0 })?;
                self.move_value(pv, source, entry.site)?;
            }
            self.freeze(entry.site)?;
            filled.push(entry.site);
        }
        Ok(())
    }

    /// Reinstate the junction table of `id` as the only resource-holding
    /// placement.
    pub fn enter_junction(&mut self, id: EventId) -> CompileResult<()> {
        let frame = self.events.get(id).frame_before;
        if self.events.get(id).junction.is_none() {
            // Only back edges lead here: agree on what the fall-in state has.
            if self.events.predecessor_events(id).iter().any(|p| *p < id) {
                return Err(CompileError::invalid(format!(
                    "junction {id} entered before any incoming edge was resolved"
                )));
            }
            let table = self.build_table(id, frame, &[])?;
            let mut filled = Vec::new();
            self.apply_table(id, frame, &table, &mut filled)?;
            for site in filled.into_iter().rev() {
                self.thaw(site)?;
            }
            self.events.get_mut(id).junction = Some(table);
            self.session.record_junction_resolved();
        }

        let table = self.events.get(id).junction.clone().unwrap_or_default();
        let placements: Vec<(ValueId, Site)> = table
            .iter()
            .filter_map(|j| frame.slot(j.home).map(|sv| (sv, j.site)))
            .collect();
        self.reset_sites();
        // Constants of slot values may differ per path; only the table holds.
        for (sv, _) in &placements {
            self.values.get_mut(*sv).sites.clear();
        }
        for (sv, site) in placements {
            self.add_site(sv, site)?;
        }
        log::debug!("{id}: entered junction with {} slots", table.len());
        Ok(())
    }

    /// Record the current placement for every successor of `id` that will
    /// be entered from `id` alone, out of sequence.
    pub fn capture_snapshots(&mut self, id: EventId) {
        let targets: Vec<EventId> = self
            .events
            .successor_events(id)
            .into_iter()
            .filter(|s| {
                *s > id
                    && s.0 != id.0 + 1
                    && self.events.predecessor_events(*s).len() == 1
                    && !self.events.needs_table(*s)
            })
            .collect();
        if targets.is_empty() {
            return;
        }
        let entries: Vec<SnapshotEntry> = self
            .placed_values()
            .into_iter()
            .map(|value| {
                let v = self.values.get(value);
                SnapshotEntry {
                    value,
                    buddy: v.buddy,
                    sites: v.sites.clone(),
                }
            })
            .collect();
        for target in targets {
            log::trace!("{id}: snapshot for {target} ({} values)", entries.len());
            self.events.get_mut(target).snapshot = Some(entries.clone());
        }
    }

    /// Replay the snapshot captured for `id`.
    pub fn restore_snapshot(&mut self, id: EventId) -> CompileResult<()> {
        let snapshot = self.events.get(id).snapshot.clone().ok_or_else(|| {
            CompileError::invalid(format!("no snapshot captured for {id}"))
        })?;
        self.reset_sites();
        for entry in &snapshot {
            let value = self.values.get_mut(entry.value);
            value.sites.clear();
            value.buddy = entry.buddy;
        }
        for entry in &snapshot {
            for site in &entry.sites {
                self.add_site(entry.value, *site)?;
            }
        }
        self.session.record_snapshot_restored();
        Ok(())
    }
}

/// Fold `entry` into `merged`, failing if its slot already has another site.
fn merge(
    merged: &mut Vec<JunctionSite>,
    entry: JunctionSite,
    successor: EventId,
) -> CompileResult<()> {
    match merged.iter().find(|j| j.home == entry.home) {
        Some(existing) if existing.site != entry.site => Err(CompileError::JunctionConflict {
            event: successor.0,
            reason: format!(
                "slot {:?} agreed at {} and {}",
                entry.home, existing.site, entry.site
            ),
        }),
        Some(_) => Ok(()),
        None => {
            merged.push(entry);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{Event, EventKind};
    use crate::core::register_file::ResourceId;
    use crate::core::test_utils::test::TestContext;
    use crate::core::value::{FrameHome, ReadKind};

    #[test]
    fn test_unplaceable_slot_falls_back_to_home() {
        let _ = env_logger::builder().is_test(true).try_init();
        TestContext::new().with_allocator(|c| {
            let holder = c.values.create(Default::default(), 8);
            c.values
                .append_read(holder, ReadKind::Single { mask: SiteMask::any() }, None);
            c.add_site(holder, Site::Register(2)).unwrap();
            c.freeze(Site::Register(2)).unwrap();

            let sv = c.values.create(Default::default(), 8);
            let arena = c.session.arena();
            let frame = FrameState::new(arena, 1).store_local(arena, 0, Some(sv));
            let join = c.events.append(Event::new(EventKind::Dummy, frame));
            c.values.append_read(
                sv,
                ReadKind::Single {
                    mask: SiteMask::fixed_register(2),
                },
                Some(join),
            );

            let table = c.build_table(join, frame, &[]).unwrap();
            let home = FrameHome::Local(0);
            assert_eq!(
                table,
                vec![JunctionSite {
                    home,
                    site: c.layout.home_site(home),
                }]
            );
            c.thaw(Site::Register(2)).unwrap();
        });
    }

    #[test]
    fn test_pinned_agreed_site_is_a_conflict() {
        TestContext::new().with_allocator(|c| {
            let holder = c.values.create(Default::default(), 8);
            c.values
                .append_read(holder, ReadKind::Single { mask: SiteMask::any() }, None);
            c.add_site(holder, Site::Register(2)).unwrap();
            c.freeze(Site::Register(2)).unwrap();

            let v = c.values.create(Default::default(), 8);
            c.values
                .append_read(v, ReadKind::Single { mask: SiteMask::any() }, None);
            c.add_site(v, Site::Register(1)).unwrap();

            let arena = c.session.arena();
            let frame = FrameState::new(arena, 1).store_local(arena, 0, Some(v));
            let table = [JunctionSite {
                home: FrameHome::Local(0),
                site: Site::Register(2),
            }];
            let mut filled = Vec::new();
            let err = c
                .apply_table(EventId(0), frame, &table, &mut filled)
                .unwrap_err();
            assert!(matches!(err, CompileError::JunctionConflict { event: 0, .. }), "{err}");
            assert!(filled.is_empty());
            assert_eq!(c.registers.owner(ResourceId::Register(2)), Some(holder));
            c.thaw(Site::Register(2)).unwrap();
        });
    }

    #[test]
    fn test_merge_rejects_second_site_for_a_slot() {
        let home = FrameHome::Local(0);
        let mut merged = Vec::new();
        let agreed = JunctionSite {
            home,
            site: Site::Register(0),
        };
        merge(&mut merged, agreed, EventId(4)).unwrap();
        merge(&mut merged, agreed, EventId(4)).unwrap();
        assert_eq!(merged, vec![agreed]);

        let other = JunctionSite {
            home,
            site: Site::Register(2),
        };
        let err = merge(&mut merged, other, EventId(4)).unwrap_err();
        assert!(matches!(err, CompileError::JunctionConflict { event: 4, .. }), "{err}");
        assert_eq!(merged, vec![agreed]);
    }
}

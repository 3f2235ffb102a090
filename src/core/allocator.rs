// This module holds the compile-time allocation context and its core operations: adding and
// removing sites (binding the underlying register or frame resource), the steal protocol that
// relocates an occupant before its resource is handed to someone else, freeze/thaw pinning,
// the target selection heuristic that prices register, home slot and frame scan candidates,
// read-source binding that materialises a value where a read wants it, and the cleanup that
// hands a dying value's sites to its next buddy or releases them. Per-event emission, junction
// resolution and the driver loop are further impl blocks on the same Context in sibling
// modules.

//! Target selection, acquire/steal and read-source binding.

use crate::arch::{
    Architecture, Assembler, BinaryOp, OperandInfo, REGISTER_MASK, MEMORY_MASK,
};

use super::config::AllocatorConfig;
use super::error::{CompileError, CompileResult};
use super::event::{EventGraph, EventId};
use super::frame::FrameLayout;
use super::promise::PromiseTable;
use super::register_file::{RegisterFile, ResourceId};
use super::session::CompilationSession;
use super::site::{FrameConstraint, Site, SiteMask};
use super::value::{FrameHome, ReadId, ReadKind, ValueId, ValueTable};

/// Cost marking a candidate that cannot be used.
const IMPOSSIBLE: u32 = u32::MAX;

/// Mutable state of one compile pass.
pub struct Context<'c, 'a> {
    pub arch: &'a dyn Architecture,
    pub session: &'a CompilationSession<'a>,
    pub config: AllocatorConfig,
    pub values: &'c mut ValueTable,
    pub events: &'c mut EventGraph<'a>,
    pub promises: &'c mut PromiseTable,
    pub registers: RegisterFile,
    pub layout: FrameLayout,
    pub asm: &'c mut dyn Assembler,
    /// Event being compiled.
    pub current: EventId,
}

/// A priced placement candidate.
#[derive(Debug, Clone, Copy)]
struct Target {
    site: Site,
    cost: u32,
}

impl<'c, 'a> Context<'c, 'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        arch: &'a dyn Architecture,
        session: &'a CompilationSession<'a>,
        config: AllocatorConfig,
        values: &'c mut ValueTable,
        events: &'c mut EventGraph<'a>,
        promises: &'c mut PromiseTable,
        layout: FrameLayout,
        asm: &'c mut dyn Assembler,
    ) -> Self {
        let usable = arch.general_registers() | arch.float_registers();
        let allocatable = (0..arch.register_count())
            .filter(|r| usable & (1u64 << r) != 0 && !arch.reserved(*r as u8))
            .fold(0u64, |mask, r| mask | (1u64 << r));
        let mut registers = RegisterFile::new(arch.register_count() as usize, allocatable);
        registers.set_frame_count(layout.frame_count());
        Self {
            arch,
            session,
            config,
            values,
            events,
            promises,
            registers,
            layout,
            asm,
            current: EventId(0),
        }
    }

    pub fn word_size(&self) -> u32 {
        self.arch.word_size()
    }

    /// Resource backing `site`, if it holds one.
    pub fn resource_of(&self, site: &Site) -> Option<ResourceId> {
        match *site {
            Site::Register(register) => Some(ResourceId::Register(register)),
            Site::Memory { .. } => site.frame_index(&self.layout).map(ResourceId::Frame),
            _ => None,
        }
    }

    /// Ring member of `value` whose site list contains `site`.
    pub fn holder(&self, value: ValueId, site: &Site) -> Option<ValueId> {
        self.values
            .ring_sites(value)
            .into_iter()
            .find(|(_, s)| s == site)
            .map(|(member, _)| member)
    }

    pub fn has_site(&self, value: ValueId, site: &Site) -> bool {
        self.holder(value, site).is_some()
    }

    /// Registers referenced by a non-frame memory site.
    fn memory_references(&self, site: &Site) -> Vec<u8> {
        match *site {
            Site::Memory { base, index, .. } if site.frame_index(&self.layout).is_none() => {
                std::iter::once(base).chain(index).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Record `site` as a location of `value`, stealing its resource from
    /// any other occupant first.
    pub fn add_site(&mut self, value: ValueId, site: Site) -> CompileResult<()> {
        if self.has_site(value, &site) {
            return Ok(());
        }
        if let Some(id) = self.resource_of(&site) {
            if let Some(occupant) = self.registers.owner(id) {
                if !self.values.is_buddy(occupant, value) {
                    self.steal(id)?;
                }
            }
            self.registers.claim(id, value, site)?;
        }
        for register in self.memory_references(&site) {
            self.registers.increment_reference(register)?;
        }
        self.values.get_mut(value).sites.push(site);
        Ok(())
    }

    /// Drop `site` from whichever ring member of `value` holds it.
    pub fn remove_site(&mut self, value: ValueId, site: Site) -> CompileResult<()> {
        let Some(holder) = self.holder(value, &site) else {
            return Ok(());
        };
        self.values.get_mut(holder).sites.retain(|s| *s != site);
        self.release_resource(holder, &site)
    }

    fn release_resource(&mut self, holder: ValueId, site: &Site) -> CompileResult<()> {
        if let Some(id) = self.resource_of(site) {
            if self.registers.owner(id) == Some(holder) {
                self.registers.release(id, holder)?;
            }
        }
        for register in self.memory_references(site) {
            self.registers.decrement_reference(register)?;
        }
        Ok(())
    }

    pub fn freeze(&mut self, site: Site) -> CompileResult<()> {
        if let Some(id) = self.resource_of(&site) {
            self.registers.freeze(id)?;
        }
        Ok(())
    }

    pub fn thaw(&mut self, site: Site) -> CompileResult<()> {
        if let Some(id) = self.resource_of(&site) {
            self.registers
                .thaw(id)
                .map_err(|_| CompileError::FreezeImbalance {
                    resource: id.to_string(),
                    reason: "thaw without matching freeze".into(),
                })?;
        }
        Ok(())
    }

    /// Run `f` with every site in `sites` pinned, thawing them afterwards.
    pub fn with_frozen<T>(
        &mut self,
        sites: &[Site],
        f: impl FnOnce(&mut Self) -> CompileResult<T>,
    ) -> CompileResult<T> {
        for site in sites {
            self.freeze(*site)?;
        }
        let result = f(self);
        for site in sites.iter().rev() {
            self.thaw(*site)?;
        }
        result
    }

    pub fn home_of(&self, value: ValueId) -> Option<FrameHome> {
        self.values
            .ring(value)
            .into_iter()
            .find_map(|member| self.values.get(member).home)
    }

    /// Whether `value` itself still has a valid read pending.
    pub fn has_reads(&self, value: ValueId) -> bool {
        self.values
            .head(value)
            .is_some_and(|read| self.values.valid(read))
    }

    /// Whether the ring of `value` is read by anything after `event`.
    ///
    /// Stubs of `event`'s own outgoing links count: the value still has to
    /// reach the successor.
    pub fn live_after(&self, value: ValueId, event: EventId) -> bool {
        self.values.ring(value).into_iter().any(|member| {
            let mut cursor = self.values.head(member);
            while let Some(read) = cursor {
                let r = self.values.read(read);
                let later = r.event != Some(event) || matches!(r.kind, ReadKind::Stub { .. });
                if later && self.values.valid(read) {
                    return true;
                }
                cursor = r.next;
            }
            false
        })
    }

    /// Constraint of the next read of any ring member of `value`.
    pub fn read_mask(&self, value: ValueId) -> SiteMask {
        self.values
            .ring(value)
            .into_iter()
            .filter_map(|member| self.values.head(member))
            .find(|read| self.values.valid(*read))
            .and_then(|read| self.values.mask(read))
            .unwrap_or_else(SiteMask::any)
    }

    fn register_cost(&self, value: ValueId, register: u8) -> u32 {
        let Ok(resource) = self.registers.get(ResourceId::Register(register)) else {
            return IMPOSSIBLE;
        };
        if !resource.is_stealable() {
            return IMPOSSIBLE;
        }
        match resource.value {
            None => 0,
            Some(occupant) if self.values.is_buddy(occupant, value) => 0,
            Some(occupant) => self.occupant_cost(occupant),
        }
    }

    fn frame_slot_cost(&self, value: ValueId, index: u32, free_cost: u32) -> u32 {
        let Ok(resource) = self.registers.get(ResourceId::Frame(index)) else {
            return IMPOSSIBLE;
        };
        if !resource.is_stealable() {
            return IMPOSSIBLE;
        }
        match resource.value {
            None => free_cost,
            Some(occupant) if self.values.is_buddy(occupant, value) => 0,
            Some(occupant) => self.occupant_cost(occupant),
        }
    }

    fn occupant_cost(&self, occupant: ValueId) -> u32 {
        if self.values.ring_sites(occupant).len() > 1 {
            self.config.steal_cost
        } else {
            self.config.steal_unique_cost
        }
    }

    /// Choose a site for `value` satisfying `mask`.
    ///
    /// Registers are priced first, then the home frame slot, then (only when
    /// nothing cheap turned up and no register is free) every frame slot.
    /// Ties keep the earlier family.
    pub fn pick_target(
        &mut self,
        value: ValueId,
        mask: SiteMask,
        home: Option<FrameHome>,
        reserve: u32,
        exclude: &[Site],
    ) -> CompileResult<Site> {
        let mut best: Option<Target> = None;
        let consider = |candidate: Target, best: &mut Option<Target>| {
            if candidate.cost == IMPOSSIBLE || exclude.contains(&candidate.site) {
                return;
            }
            if best.map_or(true, |b| candidate.cost < b.cost) {
                *best = Some(candidate);
            }
        };

        let allocatable = self.registers.allocatable();
        let available = self.registers.available_registers(allocatable);
        if mask.kinds & REGISTER_MASK != 0 {
            let penalty = if available <= reserve + self.config.low_register_threshold {
                self.config.low_register_penalty
            } else {
                0
            };
            let candidates = mask.registers & allocatable;
            for register in 0..self.registers.register_count() as u8 {
                if candidates & (1u64 << register) == 0 {
                    continue;
                }
                let cost = self.register_cost(value, register);
                let cost = if cost == IMPOSSIBLE {
                    cost
                } else {
                    cost + penalty
                };
                consider(
                    Target {
                        site: Site::Register(register),
                        cost,
                    },
                    &mut best,
                );
            }
        }

        if mask.kinds & MEMORY_MASK != 0 {
            match mask.frame {
                FrameConstraint::Exactly(index) => {
                    let cost = self.frame_slot_cost(value, index, self.config.frame_cost);
                    consider(
                        Target {
                            site: self.layout.site(index),
                            cost,
                        },
                        &mut best,
                    );
                }
                FrameConstraint::Any => {
                    if let Some(home) = home {
                        let index = self.layout.home_index(home);
                        let cost = self.frame_slot_cost(value, index, self.config.frame_cost);
                        consider(
                            Target {
                                site: self.layout.site(index),
                                cost,
                            },
                            &mut best,
                        );
                    }

                    let cheap = best.is_some_and(|b| b.cost <= self.config.frame_scan_threshold);
                    if !cheap && available == 0 {
                        for index in self.layout.outgoing_footprint..self.layout.frame_count() {
                            if self.registers.is_frame_available(index) {
                                consider(
                                    Target {
                                        site: self.layout.site(index),
                                        cost: self.config.frame_cost,
                                    },
                                    &mut best,
                                );
                            }
                        }
                    }
                }
                FrameConstraint::None => {}
            }
        }

        match best {
            Some(target) => {
                log::trace!(
                    "{}: target {} for {value} (cost {})",
                    self.current,
                    target.site,
                    target.cost
                );
                Ok(target.site)
            }
            None => Err(CompileError::NoSiteAvailable {
                value: value.0,
                event: self.current.0,
                reason: format!(
                    "no candidate for mask kinds {:#06b} registers {:#x}",
                    mask.kinds, mask.registers
                ),
            }),
        }
    }

    /// Evict the occupant of `id`, relocating it if this was its only copy.
    pub fn steal(&mut self, id: ResourceId) -> CompileResult<()> {
        let resource = self.registers.get(id)?.clone();
        let (Some(occupant), Some(site)) = (resource.value, resource.site) else {
            return Ok(());
        };
        if !resource.is_stealable() {
            return Err(CompileError::PinnedResource {
                resource: id.to_string(),
                value: occupant.0,
            });
        }
        self.session.record_steal();

        if self.values.ring_sites(occupant).len() > 1 || !self.values.live(occupant) {
            log::trace!("{}: dropping {site} from {occupant}", self.current);
            return self.remove_site(occupant, site);
        }

        let wanted = self.read_mask(occupant);
        let mask = SiteMask::new(
            (wanted.kinds & REGISTER_MASK) | MEMORY_MASK,
            wanted.registers,
            FrameConstraint::Any,
        );
        let home = self.home_of(occupant);
        let reserve = self.config.steal_register_reserve;
        log::debug!("{}: stealing {id} from {occupant}", self.current);
        self.with_frozen(&[site], |c| {
            let target = c.pick_target(occupant, mask, home, reserve, &[])?;
            c.move_value(occupant, site, target)
        })?;
        self.remove_site(occupant, site)
    }

    /// Copy `value` from `source` into `destination`, acquiring the latter.
    pub fn move_value(
        &mut self,
        value: ValueId,
        source: Site,
        destination: Site,
    ) -> CompileResult<()> {
        if source == destination || self.has_site(value, &destination) {
            return Ok(());
        }
        let word = self.word_size();
        let mut source = source;
        if matches!(source, Site::Memory { .. })
            && matches!(destination, Site::Memory { .. })
            && !self.arch.plan_move(BinaryOp::Move, word, word).memory_to_memory
        {
            let general = SiteMask::register(self.arch.general_registers());
            let scratch = self.with_frozen(&[source, destination], |c| {
                c.pick_target(value, general, None, 0, &[])
            })?;
            self.move_value(value, source, scratch)?;
            source = scratch;
        }

        self.with_frozen(&[source], |c| c.add_site(value, destination))?;
        self.emit_move(BinaryOp::Move, word, source, word, destination)
    }

    pub fn emit_move(
        &mut self,
        op: BinaryOp,
        source_size: u32,
        source: Site,
        destination_size: u32,
        destination: Site,
    ) -> CompileResult<()> {
        log::trace!("{}: move {source} -> {destination}", self.current);
        self.session.record_move();
        self.asm.apply2(
            op,
            OperandInfo::new(source_size, source.to_operand()),
            OperandInfo::new(destination_size, destination.to_operand()),
        )
    }

    /// Cheapest existing site of `value`, if any.
    pub fn cheapest_site(&self, value: ValueId, mask: Option<&SiteMask>) -> Option<Site> {
        self.values
            .ring_sites(value)
            .into_iter()
            .map(|(_, site)| site)
            .filter(|site| mask.map_or(true, |m| site.matches(m, &self.layout)))
            .min_by_key(|site| site.copy_cost(None))
    }

    /// Bind a concrete site satisfying `read`, moving the value if none of
    /// its current sites qualifies.
    pub fn read_source(&mut self, read: ReadId) -> CompileResult<Site> {
        let value = self.values.read(read).value;
        let mask = self.values.mask(read).unwrap_or_else(SiteMask::any);
        if let Some(site) = self.cheapest_site(value, Some(&mask)) {
            return Ok(site);
        }
        let source = self
            .cheapest_site(value, None)
            .ok_or(CompileError::NoSource { value: value.0 })?;
        let home = self.home_of(value);
        let target = self.with_frozen(&[source], |c| c.pick_target(value, mask, home, 0, &[]))?;
        self.move_value(value, source, target)?;
        Ok(target)
    }

    /// Release `value`'s sites once it has no pending read, handing them to
    /// the next buddy when one remains.
    pub fn clean(&mut self, value: ValueId) -> CompileResult<()> {
        if self.has_reads(value) {
            return Ok(());
        }
        let sites = std::mem::take(&mut self.values.get_mut(value).sites);
        match self.values.remove_buddy(value) {
            Some(next) => {
                for site in sites {
                    if let Some(id) = self.resource_of(&site) {
                        self.registers.transfer(id, value, next)?;
                    }
                    if !self.values.get(next).sites.contains(&site) {
                        self.values.get_mut(next).sites.push(site);
                    }
                }
            }
            None => {
                for site in sites {
                    self.release_resource(value, &site)?;
                }
            }
        }
        Ok(())
    }

    /// Consume `reads` in order, then clean up the values they belonged to.
    pub fn pop_reads(&mut self, reads: &[ReadId]) -> CompileResult<()> {
        let mut touched = Vec::with_capacity(reads.len());
        for read in reads {
            if self.values.read(*read).popped {
                continue;
            }
            self.values.pop_read(*read)?;
            touched.push(self.values.read(*read).value);
        }
        for value in touched {
            self.clean(value)?;
        }
        Ok(())
    }

    /// Forget every resource-holding site and buddy link.
    pub fn reset_sites(&mut self) {
        self.registers.reset();
        let ids: Vec<ValueId> = self.values.ids().collect();
        for id in ids {
            let value = self.values.get_mut(id);
            value
                .sites
                .retain(|s| matches!(s, Site::Constant(_) | Site::Address(_)));
            value.buddy = id;
        }
    }

    /// Concrete site lists of every value currently placed somewhere.
    pub fn placed_values(&self) -> Vec<ValueId> {
        self.values
            .ids()
            .filter(|id| {
                let value = self.values.get(*id);
                !value.sites.is_empty() || value.buddy != *id
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::TestContext;

    #[test]
    fn test_free_register_preferred() {
        TestContext::new().with_allocator(|c| {
            let v = c.values.create(Default::default(), 8);
            let site = c
                .pick_target(v, SiteMask::register(0b1111), None, 0, &[])
                .unwrap();
            assert_eq!(site, Site::Register(0));
        });
    }

    #[test]
    fn test_buddy_register_costs_nothing() {
        TestContext::new().with_allocator(|c| {
            let a = c.values.create(Default::default(), 8);
            let b = c.values.create(Default::default(), 8);
            c.values.append_read(a, ReadKind::Single { mask: SiteMask::any() }, None);
            c.add_site(a, Site::Register(2)).unwrap();
            c.values.add_buddy(a, b);
            // r2 is held by a buddy; it wins over the free r3 by priority order.
            let site = c
                .pick_target(b, SiteMask::register(0b1100), None, 0, &[])
                .unwrap();
            assert_eq!(site, Site::Register(2));
        });
    }

    #[test]
    fn test_home_slot_beats_stealing() {
        TestContext::new().with_allocator(|c| {
            let occupant = c.values.create(Default::default(), 8);
            c.values
                .append_read(occupant, ReadKind::Single { mask: SiteMask::any() }, None);
            c.add_site(occupant, Site::Register(1)).unwrap();

            let v = c.values.create(Default::default(), 8);
            let mask = SiteMask::register_or_memory(0b10);
            let site = c
                .pick_target(v, mask, Some(FrameHome::Stack(0)), 0, &[])
                .unwrap();
            assert_eq!(site, c.layout.home_site(FrameHome::Stack(0)));
        });
    }

    #[test]
    fn test_steal_relocates_unique_occupant() {
        let _ = env_logger::builder().is_test(true).try_init();
        TestContext::new().with_allocator(|c| {
            let occupant = c.values.create(Default::default(), 8);
            c.values
                .append_read(occupant, ReadKind::Single { mask: SiteMask::any() }, None);
            c.add_site(occupant, Site::Register(0)).unwrap();

            let v = c.values.create(Default::default(), 8);
            c.values.append_read(v, ReadKind::Single { mask: SiteMask::any() }, None);
            c.add_site(v, Site::Register(0)).unwrap();

            assert_eq!(c.registers.owner(ResourceId::Register(0)), Some(v));
            let sites = &c.values.get(occupant).sites;
            assert_eq!(sites.len(), 1);
            assert_ne!(sites[0], Site::Register(0));
            assert_eq!(c.registers.total_freezes(), 0);
        });
    }

    #[test]
    fn test_pinned_single_register_is_fatal() {
        TestContext::new().with_allocator(|c| {
            c.freeze(Site::Register(3)).unwrap();
            let v = c.values.create(Default::default(), 8);
            let err = c
                .pick_target(v, SiteMask::fixed_register(3), None, 0, &[])
                .unwrap_err();
            assert!(matches!(err, CompileError::NoSiteAvailable { .. }));
            c.thaw(Site::Register(3)).unwrap();
            assert!(c.thaw(Site::Register(3)).is_err());
        });
    }

    #[test]
    fn test_clean_hands_sites_to_buddy() {
        TestContext::new().with_allocator(|c| {
            let a = c.values.create(Default::default(), 8);
            let b = c.values.create(Default::default(), 8);
            let read = c
                .values
                .append_read(a, ReadKind::Single { mask: SiteMask::any() }, None);
            c.values
                .append_read(b, ReadKind::Single { mask: SiteMask::any() }, None);
            c.add_site(a, Site::Register(1)).unwrap();
            c.values.add_buddy(a, b);

            c.pop_reads(&[read]).unwrap();
            assert!(c.values.get(a).sites.is_empty());
            assert_eq!(c.values.get(b).sites, vec![Site::Register(1)]);
            assert_eq!(c.registers.owner(ResourceId::Register(1)), Some(b));
        });
    }
}

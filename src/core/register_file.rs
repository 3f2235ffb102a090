//! Resource table for registers and frame slots.
//!
//! This module implements the bookkeeping half of allocation: one [`Resource`]
//! record per physical register and one per word-sized frame slot. Each record
//! tracks the value currently occupying it (together with the exact site the
//! value holds it through), a freeze count pinning it against eviction while an
//! instruction touching it is emitted, and a reference count for registers used
//! as the base or index of a memory operand. Eviction policy (the steal
//! protocol) lives in the allocator; the table only enforces single occupancy
//! and balanced pins.

use std::fmt;

use thiserror::Error;

use crate::arch::Register;

use super::site::Site;
use super::value::ValueId;

/// Maximum number of registers a target may expose.
pub const MAX_REGISTERS: usize = 64;

/// A register or a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Register(Register),
    Frame(u32),
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Register(register) => write!(f, "r{register}"),
            ResourceId::Frame(index) => write!(f, "frame[{index}]"),
        }
    }
}

/// Occupancy record of one register or frame slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resource {
    /// Value whose `sites` contains `site`.
    pub value: Option<ValueId>,
    pub site: Option<Site>,
    pub freeze_count: u32,
    pub reference_count: u32,
    /// Never handed out (stack pointer, scratch registers).
    pub reserved: bool,
}

impl Resource {
    fn reserved() -> Self {
        Self {
            reserved: true,
            ..Self::default()
        }
    }

    /// Free and not pinned in any way.
    pub fn is_available(&self) -> bool {
        self.value.is_none() && self.freeze_count == 0 && self.reference_count == 0 && !self.reserved
    }

    /// Whether the occupant may be evicted to hand this resource out.
    pub fn is_stealable(&self) -> bool {
        self.freeze_count == 0 && self.reference_count == 0 && !self.reserved
    }
}

/// Error types for the resource table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegAllocError {
    #[error("invalid register r{0}")]
    InvalidRegister(Register),
    #[error("invalid frame slot {0}")]
    InvalidFrameSlot(u32),
    #[error("{resource} already holds {value}")]
    Occupied { resource: ResourceId, value: ValueId },
    #[error("{resource} is not held by {value}")]
    NotOwner { resource: ResourceId, value: ValueId },
    #[error("thaw of unfrozen {0}")]
    ThawUnderflow(ResourceId),
    #[error("reference count underflow on r{0}")]
    ReferenceUnderflow(Register),
}

/// One record per register and per frame slot of the unit being compiled.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    registers: Vec<Resource>,
    frame: Vec<Resource>,
    /// Registers the allocator may hand out.
    allocatable: u64,
}

impl RegisterFile {
    /// Create a table for `register_count` registers; registers outside
    /// `allocatable` are marked reserved.
    pub fn new(register_count: usize, allocatable: u64) -> Self {
        let register_count = register_count.min(MAX_REGISTERS);
        let registers = (0..register_count)
            .map(|r| {
                if allocatable & (1u64 << r) != 0 {
                    Resource::default()
                } else {
                    Resource::reserved()
                }
            })
            .collect();
        Self {
            registers,
            frame: Vec::new(),
            allocatable,
        }
    }

    /// Resize the frame part of the table, dropping all frame occupancy.
    pub fn set_frame_count(&mut self, count: u32) {
        self.frame = vec![Resource::default(); count as usize];
    }

    pub fn register_count(&self) -> usize {
        self.registers.len()
    }

    pub fn frame_count(&self) -> u32 {
        self.frame.len() as u32
    }

    pub fn allocatable(&self) -> u64 {
        self.allocatable
    }

    pub fn get(&self, id: ResourceId) -> Result<&Resource, RegAllocError> {
        match id {
            ResourceId::Register(r) => self
                .registers
                .get(r as usize)
                .ok_or(RegAllocError::InvalidRegister(r)),
            ResourceId::Frame(i) => self
                .frame
                .get(i as usize)
                .ok_or(RegAllocError::InvalidFrameSlot(i)),
        }
    }

    fn get_mut(&mut self, id: ResourceId) -> Result<&mut Resource, RegAllocError> {
        match id {
            ResourceId::Register(r) => self
                .registers
                .get_mut(r as usize)
                .ok_or(RegAllocError::InvalidRegister(r)),
            ResourceId::Frame(i) => self
                .frame
                .get_mut(i as usize)
                .ok_or(RegAllocError::InvalidFrameSlot(i)),
        }
    }

    pub fn owner(&self, id: ResourceId) -> Option<ValueId> {
        self.get(id).ok().and_then(|r| r.value)
    }

    /// Bind `id` to `value` through `site`. The resource must be free or
    /// already held by `value`.
    pub fn claim(&mut self, id: ResourceId, value: ValueId, site: Site) -> Result<(), RegAllocError> {
        let resource = self.get_mut(id)?;
        match resource.value {
            Some(occupant) if occupant != value => Err(RegAllocError::Occupied {
                resource: id,
                value: occupant,
            }),
            _ => {
                resource.value = Some(value);
                resource.site = Some(site);
                Ok(())
            }
        }
    }

    /// Unbind `id` from `value`.
    pub fn release(&mut self, id: ResourceId, value: ValueId) -> Result<(), RegAllocError> {
        let resource = self.get_mut(id)?;
        if resource.value != Some(value) {
            return Err(RegAllocError::NotOwner { resource: id, value });
        }
        resource.value = None;
        resource.site = None;
        Ok(())
    }

    /// Hand `id` over from `from` to `to` without touching pins.
    pub fn transfer(&mut self, id: ResourceId, from: ValueId, to: ValueId) -> Result<(), RegAllocError> {
        let resource = self.get_mut(id)?;
        if resource.value != Some(from) {
            return Err(RegAllocError::NotOwner {
                resource: id,
                value: from,
            });
        }
        resource.value = Some(to);
        Ok(())
    }

    pub fn freeze(&mut self, id: ResourceId) -> Result<(), RegAllocError> {
        self.get_mut(id)?.freeze_count += 1;
        Ok(())
    }

    pub fn thaw(&mut self, id: ResourceId) -> Result<(), RegAllocError> {
        let resource = self.get_mut(id)?;
        if resource.freeze_count == 0 {
            return Err(RegAllocError::ThawUnderflow(id));
        }
        resource.freeze_count -= 1;
        Ok(())
    }

    pub fn is_frozen(&self, id: ResourceId) -> bool {
        self.get(id).is_ok_and(|r| r.freeze_count > 0)
    }

    pub fn increment_reference(&mut self, register: Register) -> Result<(), RegAllocError> {
        self.get_mut(ResourceId::Register(register))?.reference_count += 1;
        Ok(())
    }

    pub fn decrement_reference(&mut self, register: Register) -> Result<(), RegAllocError> {
        let resource = self.get_mut(ResourceId::Register(register))?;
        if resource.reference_count == 0 {
            return Err(RegAllocError::ReferenceUnderflow(register));
        }
        resource.reference_count -= 1;
        Ok(())
    }

    /// Register is neither occupied nor pinned.
    pub fn is_register_available(&self, register: Register) -> bool {
        self.registers
            .get(register as usize)
            .is_some_and(Resource::is_available)
    }

    /// Number of available registers within `mask`.
    pub fn available_registers(&self, mask: u64) -> u32 {
        self.registers
            .iter()
            .enumerate()
            .filter(|(r, resource)| mask & (1u64 << r) != 0 && resource.is_available())
            .count() as u32
    }

    pub fn is_frame_available(&self, index: u32) -> bool {
        self.frame
            .get(index as usize)
            .is_some_and(Resource::is_available)
    }

    /// Sum of outstanding freezes across the table.
    pub fn total_freezes(&self) -> u32 {
        self.registers
            .iter()
            .chain(self.frame.iter())
            .map(|r| r.freeze_count)
            .sum()
    }

    /// Resources with an outstanding freeze.
    pub fn frozen(&self) -> Vec<ResourceId> {
        let registers = self
            .registers
            .iter()
            .enumerate()
            .filter(|(_, r)| r.freeze_count > 0)
            .map(|(i, _)| ResourceId::Register(i as Register));
        let frame = self
            .frame
            .iter()
            .enumerate()
            .filter(|(_, r)| r.freeze_count > 0)
            .map(|(i, _)| ResourceId::Frame(i as u32));
        registers.chain(frame).collect()
    }

    /// Every occupied resource with its occupant.
    pub fn occupied(&self) -> Vec<(ResourceId, ValueId)> {
        let registers = self
            .registers
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.value.map(|v| (ResourceId::Register(i as Register), v)));
        let frame = self
            .frame
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.value.map(|v| (ResourceId::Frame(i as u32), v)));
        registers.chain(frame).collect()
    }

    /// Drop all occupancy and pins, keeping reservations.
    pub fn reset(&mut self) {
        for resource in self.registers.iter_mut().chain(self.frame.iter_mut()) {
            let reserved = resource.reserved;
            *resource = Resource {
                reserved,
                ..Resource::default()
            };
        }
    }
}

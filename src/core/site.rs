//! Locations a value can occupy.
//!
//! A [`Site`] is a closed variant: constant, absolute address, register or
//! memory. Sites are small `Copy` descriptors; the binding of a register or
//! frame site to its owning value lives in the register file, not here.
//! [`SiteMask`] is the constraint a read places on where it accepts its
//! operand from.

use std::fmt;

use crate::arch::{
    Constant, Operand, OperandKind, OperandMask, Register, ADDRESS_MASK, ANY_KIND_MASK,
    CONSTANT_MASK, MEMORY_MASK, REGISTER_MASK,
};

use super::frame::FrameLayout;

pub const CONSTANT_COPY_COST: u32 = 1;
pub const REGISTER_COPY_COST: u32 = 1;
pub const ADDRESS_COPY_COST: u32 = 2;
pub const MEMORY_COPY_COST: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameConstraint {
    /// Any frame slot, or memory off any base.
    Any,
    /// Memory allowed, but not a frame slot.
    None,
    /// Exactly this frame slot.
    Exactly(u32),
}

/// Where a read accepts its operand from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteMask {
    pub kinds: u8,
    pub registers: u64,
    pub frame: FrameConstraint,
}

impl SiteMask {
    pub const fn new(kinds: u8, registers: u64, frame: FrameConstraint) -> Self {
        Self {
            kinds,
            registers,
            frame,
        }
    }

    pub const fn any() -> Self {
        Self::new(ANY_KIND_MASK, !0, FrameConstraint::Any)
    }

    pub const fn register(registers: u64) -> Self {
        Self::new(REGISTER_MASK, registers, FrameConstraint::None)
    }

    pub const fn fixed_register(register: Register) -> Self {
        Self::register(1u64 << register)
    }

    pub const fn frame_slot(index: u32) -> Self {
        Self::new(MEMORY_MASK, 0, FrameConstraint::Exactly(index))
    }

    pub const fn register_or_memory(registers: u64) -> Self {
        Self::new(REGISTER_MASK | MEMORY_MASK, registers, FrameConstraint::Any)
    }

    /// Widen an operand mask from a plan into a site mask.
    pub fn from_operand_mask(mask: OperandMask) -> Self {
        Self::new(mask.kinds, mask.registers, FrameConstraint::Any)
    }

    pub fn allows(&self, kind: OperandKind) -> bool {
        self.kinds & kind.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.kinds == 0 || (self.kinds == REGISTER_MASK && self.registers == 0)
    }

    /// Sites accepted by both masks.
    pub fn intersect(&self, other: &SiteMask) -> SiteMask {
        let frame = match (self.frame, other.frame) {
            (FrameConstraint::Any, f) | (f, FrameConstraint::Any) => f,
            (FrameConstraint::Exactly(a), FrameConstraint::Exactly(b)) if a == b => {
                FrameConstraint::Exactly(a)
            }
            (FrameConstraint::None, FrameConstraint::None) => FrameConstraint::None,
            _ => {
                // Incompatible frame requirements rule out memory entirely.
                return SiteMask::new(
                    self.kinds & other.kinds & !MEMORY_MASK,
                    self.registers & other.registers,
                    FrameConstraint::None,
                );
            }
        };
        SiteMask::new(
            self.kinds & other.kinds,
            self.registers & other.registers,
            frame,
        )
    }
}

/// Concrete or symbolic location of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Site {
    Constant(Constant),
    Address(Constant),
    Register(Register),
    Memory {
        base: Register,
        offset: i32,
        index: Option<Register>,
        scale: u8,
    },
}

impl Site {
    pub fn kind(&self) -> OperandKind {
        match self {
            Site::Constant(_) => OperandKind::Constant,
            Site::Address(_) => OperandKind::Address,
            Site::Register(_) => OperandKind::Register,
            Site::Memory { .. } => OperandKind::Memory,
        }
    }

    pub fn frame(base: Register, offset: i32) -> Self {
        Site::Memory {
            base,
            offset,
            index: None,
            scale: 1,
        }
    }

    pub fn register(&self) -> Option<Register> {
        match *self {
            Site::Register(register) => Some(register),
            _ => None,
        }
    }

    /// Frame slot backing this site, if it is a stack-based memory site.
    pub fn frame_index(&self, layout: &FrameLayout) -> Option<u32> {
        match *self {
            Site::Memory {
                base,
                offset,
                index: None,
                ..
            } if base == layout.stack_register => layout.offset_to_index(offset),
            _ => None,
        }
    }

    /// Whether this site satisfies `mask`.
    pub fn matches(&self, mask: &SiteMask, layout: &FrameLayout) -> bool {
        match *self {
            Site::Constant(_) => mask.kinds & CONSTANT_MASK != 0,
            Site::Address(_) => mask.kinds & ADDRESS_MASK != 0,
            Site::Register(register) => {
                mask.kinds & REGISTER_MASK != 0 && mask.registers & (1u64 << register) != 0
            }
            Site::Memory { .. } => {
                if mask.kinds & MEMORY_MASK == 0 {
                    return false;
                }
                match (self.frame_index(layout), mask.frame) {
                    (_, FrameConstraint::Any) => true,
                    (Some(index), FrameConstraint::Exactly(wanted)) => index == wanted,
                    (Some(_), FrameConstraint::None) => false,
                    (None, FrameConstraint::None) => true,
                    (None, FrameConstraint::Exactly(_)) => false,
                }
            }
        }
    }

    /// Cost of copying this site into `other`; zero when they coincide.
    pub fn copy_cost(&self, other: Option<&Site>) -> u32 {
        if other == Some(self) {
            return 0;
        }
        match self {
            Site::Constant(_) => CONSTANT_COPY_COST,
            Site::Address(_) => ADDRESS_COPY_COST,
            Site::Register(_) => REGISTER_COPY_COST,
            Site::Memory { .. } => MEMORY_COPY_COST,
        }
    }

    /// Site covering the upper word of a two-word value.
    ///
    /// Deferred constants and addresses cannot be split here; the caller
    /// derives them through the promise table instead.
    pub fn copy_high(&self, word_size: u32) -> Option<Site> {
        match *self {
            Site::Constant(Constant::Value(value)) => {
                Some(Site::Constant(Constant::Value((value >> 32) & 0xffff_ffff)))
            }
            Site::Memory {
                base,
                offset,
                index,
                scale,
            } => Some(Site::Memory {
                base,
                offset: offset + word_size as i32,
                index,
                scale,
            }),
            _ => None,
        }
    }

    pub fn to_operand(&self) -> Operand {
        match *self {
            Site::Constant(constant) => Operand::Constant(constant),
            Site::Address(address) => Operand::Address(address),
            Site::Register(register) => Operand::Register {
                low: register,
                high: None,
            },
            Site::Memory {
                base,
                offset,
                index,
                scale,
            } => Operand::Memory {
                base,
                offset,
                index,
                scale,
            },
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Site::Constant(Constant::Value(value)) => write!(f, "#{value}"),
            Site::Constant(Constant::Promise(id)) => write!(f, "#{id}"),
            Site::Address(Constant::Value(value)) => write!(f, "&{value:#x}"),
            Site::Address(Constant::Promise(id)) => write!(f, "&{id}"),
            Site::Register(register) => write!(f, "r{register}"),
            Site::Memory {
                base,
                offset,
                index: None,
                ..
            } => write!(f, "[r{base}{offset:+}]"),
            Site::Memory {
                base,
                offset,
                index: Some(index),
                scale,
            } => write!(f, "[r{base}+r{index}*{scale}{offset:+}]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> FrameLayout {
        FrameLayout::for_test(4, 8)
    }

    #[test]
    fn test_register_match() {
        let layout = layout();
        let site = Site::Register(2);
        assert!(site.matches(&SiteMask::register(0b100), &layout));
        assert!(!site.matches(&SiteMask::register(0b010), &layout));
        assert!(!site.matches(&SiteMask::frame_slot(0), &layout));
    }

    #[test]
    fn test_frame_match() {
        let layout = layout();
        let slot = Site::frame(layout.stack_register, layout.index_to_offset(3));
        assert_eq!(slot.frame_index(&layout), Some(3));
        assert!(slot.matches(&SiteMask::frame_slot(3), &layout));
        assert!(!slot.matches(&SiteMask::frame_slot(2), &layout));
        assert!(slot.matches(&SiteMask::register_or_memory(0), &layout));

        let heap = Site::Memory {
            base: 0,
            offset: 8,
            index: None,
            scale: 1,
        };
        assert!(heap.matches(&SiteMask::new(MEMORY_MASK, 0, FrameConstraint::None), &layout));
        assert!(!heap.matches(&SiteMask::frame_slot(3), &layout));
    }

    #[test]
    fn test_copy_cost() {
        let a = Site::Register(1);
        assert_eq!(a.copy_cost(Some(&Site::Register(1))), 0);
        assert_eq!(a.copy_cost(Some(&Site::Register(2))), REGISTER_COPY_COST);
        let m = Site::frame(4, 16);
        assert_eq!(m.copy_cost(None), MEMORY_COPY_COST);
        assert!(Site::Constant(Constant::Value(1)).copy_cost(None) < m.copy_cost(None));
    }

    #[test]
    fn test_high_word() {
        let wide = Site::Constant(Constant::Value(0x0000_0001_ffff_fffe));
        assert_eq!(wide.copy_high(4), Some(Site::Constant(Constant::Value(1))));

        let slot = Site::frame(4, 8);
        assert_eq!(slot.copy_high(4), Some(Site::frame(4, 12)));
        assert_eq!(Site::Register(0).copy_high(4), None);
        assert_eq!(Site::Address(Constant::Value(0x10)).copy_high(4), None);
    }

    #[test]
    fn test_mask_intersection() {
        let a = SiteMask::register_or_memory(0b0110);
        let b = SiteMask::frame_slot(2);
        let both = a.intersect(&b);
        assert_eq!(both.kinds, MEMORY_MASK);
        assert_eq!(both.frame, FrameConstraint::Exactly(2));

        let c = SiteMask::frame_slot(5);
        assert_eq!(b.intersect(&c).kinds & MEMORY_MASK, 0);
    }
}

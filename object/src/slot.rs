use crate::shape::ShapeId;
use crate::Value;

/// Identifies a named field. Bytecode carries it as an instruction immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SlotId(pub u32);

impl core::fmt::Display for SlotId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a slot may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoreType {
    /// Any tagged value.
    Value,
    Int48,
    Ref,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotType {
    pub core: CoreType,
}

impl SlotType {
    pub const VALUE: Self = Self {
        core: CoreType::Value,
    };

    #[inline(always)]
    pub const fn new(core: CoreType) -> Self {
        Self { core }
    }

    #[inline]
    pub fn accepts(self, value: Value) -> bool {
        match self.core {
            CoreType::Value => true,
            CoreType::Int48 => value.is_int48(),
            CoreType::Ref => value.is_ref(),
        }
    }
}

/// One (slot id, slot type) pair of a [`Shape`](crate::Shape).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotSpec {
    pub id: SlotId,
    pub ty: SlotType,
}

impl SlotSpec {
    #[inline(always)]
    pub const fn new(id: SlotId, ty: SlotType) -> Self {
        Self { id, ty }
    }

    #[inline(always)]
    pub const fn value(id: SlotId) -> Self {
        Self::new(id, SlotType::VALUE)
    }
}

/// The result of resolving a slot id against a shape.
///
/// `index` is the storage position inside any object of `shape`. A
/// descriptor is only meaningful while the object still has `shape`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotDescriptor {
    pub shape: ShapeId,
    pub index: u32,
    pub ty: SlotType,
}

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::slot::{SlotDescriptor, SlotId, SlotSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ShapeId(pub u32);

impl ShapeId {
    /// The shape of a freshly allocated object: no slots.
    pub const EMPTY: Self = Self(0);
}

/// An immutable slot layout.
///
/// Slots are stored in insertion order; a slot's position in `slots` is its
/// storage index inside every object of this shape.
#[derive(Debug)]
pub struct Shape {
    id: ShapeId,
    parent: Option<ShapeId>,
    slots: Box<[SlotSpec]>,
}

impl Shape {
    #[inline(always)]
    pub fn id(&self) -> ShapeId {
        self.id
    }

    /// The shape this one was derived from by adding its last slot.
    #[inline(always)]
    pub fn parent(&self) -> Option<ShapeId> {
        self.parent
    }

    #[inline(always)]
    pub fn slots(&self) -> &[SlotSpec] {
        &self.slots
    }

    #[inline(always)]
    pub fn slot_count(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn lookup(&self, id: SlotId) -> Option<SlotDescriptor> {
        self.slots
            .iter()
            .position(|spec| spec.id == id)
            .map(|index| SlotDescriptor {
                shape: self.id,
                index: index as u32,
                ty: self.slots[index].ty,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    UnknownShape(ShapeId),
    /// The slot already exists in the source shape.
    DuplicateSlot { shape: ShapeId, slot: SlotId },
    /// A transition for this slot id exists but was recorded with another type.
    ConflictingSlotType { shape: ShapeId, slot: SlotId },
}

impl core::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UnknownShape(id) => write!(f, "unknown shape {}", id.0),
            Self::DuplicateSlot { shape, slot } => {
                write!(f, "shape {} already has slot {slot}", shape.0)
            }
            Self::ConflictingSlotType { shape, slot } => write!(
                f,
                "slot {slot} was added to shape {} with a different type",
                shape.0
            ),
        }
    }
}

impl std::error::Error for ShapeError {}

#[derive(Debug)]
struct ShapeTableInner {
    shapes: Vec<Arc<Shape>>,
    transitions: HashMap<(ShapeId, SlotId), ShapeId>,
}

/// All shapes of a heap plus the memoized transitions between them.
///
/// Cloning yields another handle to the same table. Lookups take a read
/// lock; creating a shape takes the write lock and re-checks the
/// transition first, so racing inserts of the same `(shape, slot)` pair
/// agree on one target.
#[derive(Debug, Clone)]
pub struct ShapeTable(Arc<RwLock<ShapeTableInner>>);

impl Default for ShapeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ShapeTable {
    pub fn new() -> Self {
        let empty = Arc::new(Shape {
            id: ShapeId::EMPTY,
            parent: None,
            slots: Box::new([]),
        });
        Self(Arc::new(RwLock::new(ShapeTableInner {
            shapes: vec![empty],
            transitions: HashMap::new(),
        })))
    }

    pub fn len(&self) -> usize {
        self.0.read().shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        // the empty shape always exists
        false
    }

    pub fn get(&self, id: ShapeId) -> Result<Arc<Shape>, ShapeError> {
        self.0
            .read()
            .shapes
            .get(id.0 as usize)
            .cloned()
            .ok_or(ShapeError::UnknownShape(id))
    }

    /// The cached target of adding `slot` to `from`, if any.
    pub fn cached_transition(&self, from: ShapeId, slot: SlotId) -> Option<ShapeId> {
        self.0.read().transitions.get(&(from, slot)).copied()
    }

    /// The shape reached by adding `spec` to `from`, creating it on first use.
    pub fn transition(&self, from: ShapeId, spec: SlotSpec) -> Result<ShapeId, ShapeError> {
        {
            let inner = self.0.read();
            if let Some(&target) = inner.transitions.get(&(from, spec.id)) {
                return Self::check_cached(&inner, from, target, spec);
            }
        }

        let mut inner = self.0.write();
        if let Some(&target) = inner.transitions.get(&(from, spec.id)) {
            return Self::check_cached(&inner, from, target, spec);
        }

        let source = inner
            .shapes
            .get(from.0 as usize)
            .cloned()
            .ok_or(ShapeError::UnknownShape(from))?;
        if source.lookup(spec.id).is_some() {
            return Err(ShapeError::DuplicateSlot {
                shape: from,
                slot: spec.id,
            });
        }

        let id = ShapeId(inner.shapes.len() as u32);
        let mut slots = Vec::with_capacity(source.slots.len() + 1);
        slots.extend_from_slice(&source.slots);
        slots.push(spec);
        inner.shapes.push(Arc::new(Shape {
            id,
            parent: Some(from),
            slots: slots.into_boxed_slice(),
        }));
        inner.transitions.insert((from, spec.id), id);

        log::debug!(
            "shape {} + slot {} -> new shape {}",
            from.0,
            spec.id,
            id.0
        );
        Ok(id)
    }

    /// Apply [`transition`](Self::transition) for each spec in order.
    pub fn transition_all(
        &self,
        from: ShapeId,
        specs: &[SlotSpec],
    ) -> Result<ShapeId, ShapeError> {
        specs
            .iter()
            .try_fold(from, |shape, &spec| self.transition(shape, spec))
    }

    fn check_cached(
        inner: &ShapeTableInner,
        from: ShapeId,
        target: ShapeId,
        spec: SlotSpec,
    ) -> Result<ShapeId, ShapeError> {
        let shape = &inner.shapes[target.0 as usize];
        match shape.slots.last() {
            Some(last) if last.ty == spec.ty => Ok(target),
            _ => Err(ShapeError::ConflictingSlotType {
                shape: from,
                slot: spec.id,
            }),
        }
    }
}

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use object::{
    ObjectRef, ShapeError, ShapeId, ShapeTable, SlotDescriptor, SlotId, SlotSpec, Value,
};
use parking_lot::{Condvar, Mutex};

use crate::marking::{Marker, RootProvider, RootVisitor};
use crate::mutator::World;
use crate::root::RootRef;

// ── Heap settings ─────────────────────────────────────────────────────

/// Sizing and collection policy of a [`Heap`].
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Number of object cells reserved up front.
    pub initial_capacity: usize,
    /// Allocation units (one per object, one per slot added by a shape
    /// transition) between two automatic collections.
    pub collect_threshold: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            initial_capacity: 1024,
            collect_threshold: 64 * 1024,
        }
    }
}

impl HeapSettings {
    #[inline]
    fn validate(&self) -> Result<(), &'static str> {
        if self.collect_threshold == 0 {
            return Err("collect_threshold must be > 0");
        }
        if self.initial_capacity > u32::MAX as usize {
            return Err("initial_capacity exceeds the addressable cell count");
        }
        Ok(())
    }
}

// ── Errors ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    /// The referenced cell was reclaimed or never allocated.
    DanglingReference(ObjectRef),
    /// The descriptor was resolved against a shape the object no longer has.
    StaleDescriptor { expected: ShapeId, actual: ShapeId },
    SlotTypeMismatch { slot: u32, value: Value },
    /// The root handle does not belong to this heap.
    ReleasedHandle,
    Shape(ShapeError),
}

impl core::fmt::Display for HeapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::DanglingReference(r) => write!(
                f,
                "dangling object reference {}@{}",
                r.index(),
                r.generation()
            ),
            Self::StaleDescriptor { expected, actual } => write!(
                f,
                "slot descriptor for shape {} used on object of shape {}",
                expected.0, actual.0
            ),
            Self::SlotTypeMismatch { slot, value } => {
                write!(f, "slot {slot} cannot hold {value:?}")
            }
            Self::ReleasedHandle => write!(f, "root handle is not registered"),
            Self::Shape(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for HeapError {}

impl From<ShapeError> for HeapError {
    fn from(err: ShapeError) -> Self {
        Self::Shape(err)
    }
}

// ── Statistics ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub collections: usize,
    pub objects_allocated: usize,
    pub objects_freed: usize,
    /// Root edges reported during the most recent collection.
    pub root_edges: usize,
    /// Object-to-object edges traced during the most recent collection.
    pub edges: usize,
    /// Cells taken out of use because their generation ran out.
    pub retired_cells: usize,
}

// ── Cells ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ObjectData {
    shape: ShapeId,
    values: Vec<Value>,
}

#[derive(Debug)]
pub(crate) struct Cell {
    generation: u16,
    object: Option<ObjectData>,
}

impl Cell {
    #[inline(always)]
    pub(crate) fn holds(&self, r: ObjectRef) -> bool {
        self.generation == r.generation() && self.object.is_some()
    }

    /// Field values of the object in this cell.
    #[inline(always)]
    pub(crate) fn values(&self) -> &[Value] {
        self.object.as_ref().map_or(&[], |o| o.values.as_slice())
    }
}

#[derive(Debug, Default)]
struct HeapState {
    cells: Vec<Cell>,
    free: Vec<u32>,
    live: usize,
    allocated_since_gc: usize,
    handles: Vec<Option<ObjectRef>>,
    free_handles: Vec<usize>,
    stats: GcStats,
}

impl HeapState {
    fn object(&self, r: ObjectRef) -> Result<&ObjectData, HeapError> {
        self.cells
            .get(r.index() as usize)
            .filter(|cell| cell.generation == r.generation())
            .and_then(|cell| cell.object.as_ref())
            .ok_or(HeapError::DanglingReference(r))
    }

    fn object_mut(&mut self, r: ObjectRef) -> Result<&mut ObjectData, HeapError> {
        self.cells
            .get_mut(r.index() as usize)
            .filter(|cell| cell.generation == r.generation())
            .and_then(|cell| cell.object.as_mut())
            .ok_or(HeapError::DanglingReference(r))
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct HeapInner {
    settings: HeapSettings,
    shapes: ShapeTable,
    state: Mutex<HeapState>,
    pub(crate) world: Mutex<World>,
    pub(crate) world_changed: Condvar,
    /// Mirrors `World::stopping` for the safepoint fast path.
    pub(crate) stopping: AtomicBool,
}

/// A garbage-collected object heap.
///
/// Cloning is cheap and yields another handle to the same heap; every
/// operation takes the heap lock for its duration. Operations that may
/// allocate take a [`RootProvider`] so a collection they trigger can find
/// the caller's live references. The roots of every other registered
/// [`Mutator`](crate::Mutator) are gathered by stopping it first.
#[derive(Debug, Clone)]
pub struct Heap(Arc<HeapInner>);

impl Deref for Heap {
    type Target = HeapInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Heap {
    #[must_use]
    pub fn new(settings: HeapSettings) -> Self {
        settings.validate().expect("Invalid Heap Settings");

        let state = HeapState {
            cells: Vec::with_capacity(settings.initial_capacity),
            ..Default::default()
        };
        Self(Arc::new(HeapInner {
            settings,
            shapes: ShapeTable::new(),
            state: Mutex::new(state),
            world: Mutex::new(World::default()),
            world_changed: Condvar::new(),
            stopping: AtomicBool::new(false),
        }))
    }

    pub(crate) fn same_heap(&self, other: &Heap) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    pub fn shapes(&self) -> &ShapeTable {
        &self.shapes
    }

    pub fn stats(&self) -> GcStats {
        self.state.lock().stats
    }

    pub fn live_objects(&self) -> usize {
        self.state.lock().live
    }

    pub fn is_live(&self, object: ObjectRef) -> bool {
        self.state.lock().object(object).is_ok()
    }

    /// Allocate an object with the empty shape.
    pub fn allocate_empty_object(&self, roots: &dyn RootProvider) -> ObjectRef {
        self.account(roots, 1);
        let mut state = self.state.lock();

        let data = ObjectData {
            shape: ShapeId::EMPTY,
            values: Vec::new(),
        };
        let object = match state.free.pop() {
            Some(index) => {
                let cell = &mut state.cells[index as usize];
                cell.object = Some(data);
                ObjectRef::new(index, cell.generation)
            }
            None => {
                let index = state.cells.len() as u32;
                state.cells.push(Cell {
                    generation: 0,
                    object: Some(data),
                });
                ObjectRef::new(index, 0)
            }
        };
        state.live += 1;
        state.stats.objects_allocated += 1;
        log::trace!("allocated object {}@{}", object.index(), object.generation());
        object
    }

    /// Move the rooted object to the shape that extends its current one by
    /// `spec`.
    ///
    /// May run a collection first; the object survives it because `rooted`
    /// keeps it alive. Descriptors resolved before the call are stale
    /// afterwards.
    pub fn transition_layout(
        &self,
        roots: &dyn RootProvider,
        rooted: &RootRef,
        spec: SlotSpec,
    ) -> Result<ShapeId, HeapError> {
        self.account(roots, 1);
        let mut state = self.state.lock();

        let object = state
            .handles
            .get(rooted.slot())
            .copied()
            .flatten()
            .ok_or(HeapError::ReleasedHandle)?;
        let current = state.object(object)?.shape;
        let target = self.shapes.transition(current, spec)?;
        let slot_count = self.shapes.get(target)?.slot_count() as usize;

        let data = state.object_mut(object)?;
        data.values.resize(slot_count, Value::UNINITIALIZED);
        data.shape = target;
        Ok(target)
    }

    pub fn shape_of(&self, object: ObjectRef) -> Result<ShapeId, HeapError> {
        Ok(self.state.lock().object(object)?.shape)
    }

    pub fn lookup_slot(
        &self,
        object: ObjectRef,
        id: SlotId,
    ) -> Result<Option<SlotDescriptor>, HeapError> {
        let shape = self.shape_of(object)?;
        Ok(self.shapes.get(shape)?.lookup(id))
    }

    pub fn get_value(
        &self,
        object: ObjectRef,
        descriptor: SlotDescriptor,
    ) -> Result<Value, HeapError> {
        let state = self.state.lock();
        let data = state.object(object)?;
        Self::check_descriptor(data, descriptor)?;
        Ok(data.values[descriptor.index as usize])
    }

    pub fn set_value(
        &self,
        object: ObjectRef,
        descriptor: SlotDescriptor,
        value: Value,
    ) -> Result<(), HeapError> {
        if !descriptor.ty.accepts(value) {
            return Err(HeapError::SlotTypeMismatch {
                slot: descriptor.index,
                value,
            });
        }
        let mut state = self.state.lock();
        let data = state.object_mut(object)?;
        Self::check_descriptor(data, descriptor)?;
        data.values[descriptor.index as usize] = value;
        Ok(())
    }

    /// Run a full collection now, or take part in the one under way.
    pub fn request_full_collection(&self, roots: &dyn RootProvider) {
        self.stop_the_world(roots);
    }

    /// Keep `object` alive until the returned handle is dropped.
    pub fn root(&self, object: ObjectRef) -> RootRef {
        let mut state = self.state.lock();
        let slot = match state.free_handles.pop() {
            Some(slot) => {
                state.handles[slot] = Some(object);
                slot
            }
            None => {
                state.handles.push(Some(object));
                state.handles.len() - 1
            }
        };
        RootRef::new(self.clone(), slot)
    }

    pub(crate) fn handle(&self, slot: usize) -> Option<ObjectRef> {
        self.state.lock().handles.get(slot).copied().flatten()
    }

    pub(crate) fn release_handle(&self, slot: usize) {
        let mut state = self.state.lock();
        if let Some(entry) = state.handles.get_mut(slot) {
            *entry = None;
            state.free_handles.push(slot);
        }
    }

    fn check_descriptor(data: &ObjectData, descriptor: SlotDescriptor) -> Result<(), HeapError> {
        if data.shape != descriptor.shape {
            return Err(HeapError::StaleDescriptor {
                expected: descriptor.shape,
                actual: data.shape,
            });
        }
        Ok(())
    }

    /// Charge `units` and collect first when the threshold is reached.
    ///
    /// Runs before the heap lock is taken: a collection waits for the other
    /// mutators, which may themselves be about to take it.
    fn account(&self, roots: &dyn RootProvider, units: usize) {
        let due = {
            let mut state = self.state.lock();
            state.allocated_since_gc += units;
            state.allocated_since_gc >= self.settings.collect_threshold
        };
        if due {
            self.stop_the_world(roots);
        }
    }

    /// Mark from `roots`, the `published` roots of stopped mutators and the
    /// handle table, then sweep.
    pub(crate) fn collect_with(&self, roots: &dyn RootProvider, published: &[Value]) {
        let mut state = self.state.lock();
        Self::collect(&mut state, roots, published);
    }

    fn collect(state: &mut HeapState, roots: &dyn RootProvider, published: &[Value]) {
        let mut marker = Marker::new(&state.cells);
        roots.visit_roots(&mut marker);
        for &value in published {
            marker.root_edge(value);
        }
        for handle in state.handles.iter().flatten() {
            marker.root_edge(Value::from_ref(*handle));
        }
        marker.trace();
        let (marks, root_edges, edges) = marker.finish();

        let mut freed = 0;
        let mut retired = 0;
        for (index, cell) in state.cells.iter_mut().enumerate() {
            if cell.object.is_some() && !marks[index] {
                cell.object = None;
                freed += 1;
                // A wrapped generation would let stale references alias the
                // next occupant, so the cell is never handed out again.
                match cell.generation.checked_add(1) {
                    Some(generation) => {
                        cell.generation = generation;
                        state.free.push(index as u32);
                    }
                    None => retired += 1,
                }
            }
        }

        state.live -= freed;
        state.allocated_since_gc = 0;
        state.stats.collections += 1;
        state.stats.objects_freed += freed;
        state.stats.retired_cells += retired;
        state.stats.root_edges = root_edges;
        state.stats.edges = edges;

        log::debug!(
            "gc #{}: {} root edges, {} edges, freed {}, live {}",
            state.stats.collections,
            root_edges,
            edges,
            freed,
            state.live
        );
    }
}

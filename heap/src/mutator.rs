use std::sync::atomic::Ordering;

use object::{ObjectRef, Value};
use parking_lot::MutexGuard;

use crate::Heap;
use crate::marking::{RootProvider, RootVisitor};

// ── Mutator registry ──────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Entry {
    /// Inside a run; its roots are only consistent at a safepoint.
    running: bool,
    /// Waiting at a safepoint for the current collection to finish.
    parked: bool,
    /// Roots as of the last time this mutator stopped or parked.
    roots: Vec<Value>,
}

#[derive(Debug, Default)]
pub(crate) struct World {
    entries: Vec<Option<Entry>>,
    free: Vec<usize>,
    stopping: bool,
}

impl World {
    /// Mutators that are executing and have not reached a safepoint.
    fn busy(&self) -> usize {
        self.entries
            .iter()
            .flatten()
            .filter(|entry| entry.running && !entry.parked)
            .count()
    }

    fn entry_mut(&mut self, id: usize) -> Option<&mut Entry> {
        self.entries.get_mut(id).and_then(Option::as_mut)
    }

    fn published_roots(&self, except: Option<usize>) -> Vec<Value> {
        self.entries
            .iter()
            .enumerate()
            .filter(|&(id, _)| Some(id) != except)
            .filter_map(|(_, entry)| entry.as_ref())
            .flat_map(|entry| entry.roots.iter().copied())
            .collect()
    }
}

/// Copies the reference roots a provider reports.
#[derive(Default)]
struct Snapshot(Vec<Value>);

impl RootVisitor for Snapshot {
    fn root_edge(&mut self, value: Value) {
        if value.is_ref() {
            self.0.push(value);
        }
    }

    fn edge(&mut self, _from: ObjectRef, _to: Value) {}
}

fn snapshot(roots: &dyn RootProvider) -> Vec<Value> {
    let mut snapshot = Snapshot::default();
    roots.visit_roots(&mut snapshot);
    snapshot.0
}

/// One execution thread registered with a [`Heap`].
///
/// Collections are stop-the-world: a collection starts only once every
/// registered mutator is either stopped or parked at a safepoint. A stopped
/// mutator is represented by the roots it published when it stopped; a
/// parked one publishes them as it parks. Values held outside a mutator's
/// roots are not seen by collections and need a [`RootRef`](crate::RootRef).
///
/// A thread drives at most one running mutator at a time: a collection
/// waits for every running mutator, so one that is running but not making
/// progress blocks it. Dropping the handle unregisters the mutator.
#[derive(Debug)]
pub struct Mutator {
    heap: Heap,
    id: usize,
}

impl Mutator {
    pub fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn belongs_to(&self, heap: &Heap) -> bool {
        self.heap.same_heap(heap)
    }

    /// Start executing. From here on collections wait for this mutator to
    /// reach a [`safepoint`](Self::safepoint) or [`leave`](Self::leave).
    pub fn enter(&self) {
        let mut world = self.heap.world.lock();
        if let Some(entry) = world.entry_mut(self.id) {
            entry.running = true;
        }
    }

    /// Stop executing; `roots` stand for this mutator until it enters again.
    pub fn leave(&self, roots: &dyn RootProvider) {
        let roots = snapshot(roots);
        let mut world = self.heap.world.lock();
        if let Some(entry) = world.entry_mut(self.id) {
            entry.running = false;
            entry.roots = roots;
        }
        self.heap.world_changed.notify_all();
    }

    /// Replace the roots published by a stopped mutator.
    pub fn publish(&self, roots: &dyn RootProvider) {
        let roots = snapshot(roots);
        let mut world = self.heap.world.lock();
        if let Some(entry) = world.entry_mut(self.id) {
            entry.roots = roots;
        }
    }

    /// Park until the pending collection is done, if there is one.
    ///
    /// Call only where every live reference of this mutator is visible to
    /// `roots`.
    #[inline(always)]
    pub fn safepoint(&self, roots: &dyn RootProvider) {
        if self.heap.stopping.load(Ordering::Acquire) {
            let mut world = self.heap.world.lock();
            self.heap.park(&mut world, self.id, roots);
        }
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        let mut world = self.heap.world.lock();
        if let Some(entry) = world.entries.get_mut(self.id) {
            if entry.take().is_some() {
                world.free.push(self.id);
            }
        }
        self.heap.world_changed.notify_all();
    }
}

impl Heap {
    /// Register a new, stopped mutator with no roots.
    pub fn register_mutator(&self) -> Mutator {
        let mut world = self.world.lock();
        let id = match world.free.pop() {
            Some(id) => {
                world.entries[id] = Some(Entry::default());
                id
            }
            None => {
                world.entries.push(Some(Entry::default()));
                world.entries.len() - 1
            }
        };
        log::trace!("registered mutator {id}");
        Mutator {
            heap: self.clone(),
            id,
        }
    }

    pub fn mutator_count(&self) -> usize {
        self.world.lock().entries.iter().flatten().count()
    }

    fn park(&self, world: &mut MutexGuard<'_, World>, id: usize, roots: &dyn RootProvider) {
        if !world.stopping {
            return;
        }
        let published = snapshot(roots);
        if let Some(entry) = world.entry_mut(id) {
            entry.roots = published;
            entry.parked = true;
        }
        self.world_changed.notify_all();
        while world.stopping {
            self.world_changed.wait(world);
        }
        if let Some(entry) = world.entry_mut(id) {
            entry.parked = false;
        }
    }

    /// Collect once every other mutator is stopped or parked.
    ///
    /// When another collection is already under way, a registered caller
    /// parks and takes part in it instead of starting its own.
    pub(crate) fn stop_the_world(&self, roots: &dyn RootProvider) {
        let me = roots
            .mutator()
            .filter(|mutator| mutator.belongs_to(self))
            .map(Mutator::id);

        let mut world = self.world.lock();
        while world.stopping {
            if let Some(id) = me {
                self.park(&mut world, id, roots);
                return;
            }
            self.world_changed.wait(&mut world);
        }

        world.stopping = true;
        self.stopping.store(true, Ordering::Release);
        if let Some(entry) = me.and_then(|id| world.entry_mut(id)) {
            entry.parked = true;
        }
        while world.busy() > 0 {
            self.world_changed.wait(&mut world);
        }

        let published = world.published_roots(me);
        self.collect_with(roots, &published);

        if let Some(entry) = me.and_then(|id| world.entry_mut(id)) {
            entry.parked = false;
        }
        world.stopping = false;
        self.stopping.store(false, Ordering::Release);
        self.world_changed.notify_all();
    }
}

use object::ObjectRef;

use crate::Heap;

/// A registered GC root.
///
/// While a `RootRef` is alive its object survives every collection. Read
/// the reference back with [`get`](Self::get) after any call that may
/// collect instead of holding on to an earlier copy.
#[derive(Debug)]
pub struct RootRef {
    heap: Heap,
    slot: usize,
}

impl RootRef {
    pub(crate) fn new(heap: Heap, slot: usize) -> Self {
        Self { heap, slot }
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    /// The rooted object, as currently recorded by the heap.
    pub fn get(&self) -> Option<ObjectRef> {
        self.heap.handle(self.slot)
    }
}

impl Drop for RootRef {
    fn drop(&mut self) {
        self.heap.release_handle(self.slot);
    }
}

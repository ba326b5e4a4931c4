use object::{ObjectRef, Value};

use crate::heap::Cell;
use crate::mutator::Mutator;

/// Receives the edges discovered while tracing.
///
/// Root edges come from outside the heap (interpreter stacks, handles);
/// ordinary edges go from one heap object to a value stored in it. Values
/// that are not references are ignored.
pub trait RootVisitor {
    fn root_edge(&mut self, value: Value);
    fn edge(&mut self, from: ObjectRef, to: Value);
}

/// Consumers implement this to provide GC roots.
///
/// Called during every collection to discover live roots from the caller's
/// current state; nothing is cached between collections.
pub trait RootProvider {
    fn visit_roots(&self, visitor: &mut dyn RootVisitor);

    /// The registered mutator these roots belong to, if any.
    ///
    /// A collection started through a provider that names its mutator does
    /// not wait for that mutator to reach a safepoint.
    fn mutator(&self) -> Option<&Mutator> {
        None
    }
}

/// A provider with no roots of its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRoots;

impl RootProvider for NoRoots {
    fn visit_roots(&self, _visitor: &mut dyn RootVisitor) {}
}

/// The collector's mark routine.
pub(crate) struct Marker<'a> {
    cells: &'a [Cell],
    marks: Vec<bool>,
    worklist: Vec<ObjectRef>,
    root_edges: usize,
    edges: usize,
}

impl<'a> Marker<'a> {
    pub(crate) fn new(cells: &'a [Cell]) -> Self {
        Self {
            cells,
            marks: vec![false; cells.len()],
            worklist: Vec::new(),
            root_edges: 0,
            edges: 0,
        }
    }

    /// Whether `value` references a live cell; marks it on first sight.
    fn mark(&mut self, value: Value) -> bool {
        let Some(object) = value.as_object() else {
            return false;
        };
        let index = object.index() as usize;
        match self.cells.get(index) {
            Some(cell) if cell.holds(object) => {
                if !self.marks[index] {
                    self.marks[index] = true;
                    self.worklist.push(object);
                }
                true
            }
            _ => false,
        }
    }

    /// Follow object-to-object edges until every reachable cell is marked.
    pub(crate) fn trace(&mut self) {
        while let Some(object) = self.worklist.pop() {
            let cells = self.cells;
            for &value in cells[object.index() as usize].values() {
                self.edge(object, value);
            }
        }
    }

    /// Mark bits per cell plus the (root, ordinary) edge counts.
    pub(crate) fn finish(self) -> (Vec<bool>, usize, usize) {
        (self.marks, self.root_edges, self.edges)
    }
}

impl RootVisitor for Marker<'_> {
    fn root_edge(&mut self, value: Value) {
        if self.mark(value) {
            self.root_edges += 1;
        }
    }

    fn edge(&mut self, _from: ObjectRef, to: Value) {
        if self.mark(to) {
            self.edges += 1;
        }
    }
}

use heap::{Mutator, RootProvider, RootVisitor};

use crate::ExecutionContext;

/// Roots are recomputed from the live stack on every call.
///
/// Saved frame state is skipped: instruction and base pointers are
/// PTR-tagged stack positions and function indices are UINT48.
impl RootProvider for ExecutionContext {
    fn visit_roots(&self, visitor: &mut dyn RootVisitor) {
        for &value in self.stack().as_slice() {
            if value.is_ref() {
                visitor.root_edge(value);
            }
        }
    }

    fn mutator(&self) -> Option<&Mutator> {
        Some(ExecutionContext::mutator(self))
    }
}

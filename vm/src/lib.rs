pub mod config;
pub mod demos;
pub mod error;
pub mod frame;
pub mod interpreter;
pub mod jit;
pub mod marking;
pub mod stack;

use std::sync::Arc;

use bytecode::FunctionDef;
use heap::{Heap, HeapSettings};
use object::Value;

pub use config::{CallingConvention, Config};
pub use error::RuntimeError;
pub use frame::Frame;
pub use interpreter::ExecutionContext;
pub use jit::JitFunction;
pub use stack::Stack;

/// A built-in called by `PRIMITIVE_CALL`. It works directly on the
/// context's stack and may re-enter the interpreter.
pub type PrimitiveFunction = fn(&mut ExecutionContext) -> Result<(), RuntimeError>;

#[derive(Debug, Clone)]
struct Primitive {
    name: String,
    function: PrimitiveFunction,
}

/// Function, primitive and JIT tables plus the heap they run against.
///
/// Populated up front, then shared behind an [`Arc`] by any number of
/// [`ExecutionContext`]s.
pub struct VirtualMachine {
    config: Config,
    heap: Heap,
    functions: Vec<FunctionDef>,
    primitives: Vec<Primitive>,
    jit_functions: Vec<Option<JitFunction>>,
}

impl VirtualMachine {
    pub fn new(config: Config) -> Self {
        Self::with_heap_settings(config, HeapSettings::default())
    }

    pub fn with_heap_settings(config: Config, settings: HeapSettings) -> Self {
        Self {
            config,
            heap: Heap::new(settings),
            functions: Vec::new(),
            primitives: Vec::new(),
            jit_functions: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    // ── functions ──────────────────────────────────────────────────

    /// Add a function and return its index.
    pub fn load_function(&mut self, function: FunctionDef) -> usize {
        log::debug!(
            "loaded '{}' as #{} (nargs={}, nregs={})",
            function.name,
            self.functions.len(),
            function.nargs,
            function.nregs
        );
        self.functions.push(function);
        self.jit_functions.push(None);
        self.functions.len() - 1
    }

    pub fn get_function(&self, index: usize) -> Result<&FunctionDef, RuntimeError> {
        self.functions
            .get(index)
            .ok_or(RuntimeError::UnknownFunction(index))
    }

    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    // ── primitives ─────────────────────────────────────────────────

    pub fn register_primitive(
        &mut self,
        name: impl Into<String>,
        function: PrimitiveFunction,
    ) -> usize {
        self.primitives.push(Primitive {
            name: name.into(),
            function,
        });
        self.primitives.len() - 1
    }

    pub fn get_primitive(&self, index: usize) -> Result<PrimitiveFunction, RuntimeError> {
        self.primitives
            .get(index)
            .map(|p| p.function)
            .ok_or(RuntimeError::UnknownPrimitive(index))
    }

    pub fn primitive_index(&self, name: &str) -> Option<usize> {
        self.primitives.iter().position(|p| p.name == name)
    }

    // ── jit entries ────────────────────────────────────────────────

    pub fn set_jit_function(
        &mut self,
        index: usize,
        jit: JitFunction,
    ) -> Result<(), RuntimeError> {
        let entry = self
            .jit_functions
            .get_mut(index)
            .ok_or(RuntimeError::UnknownFunction(index))?;
        *entry = Some(jit);
        Ok(())
    }

    pub fn jit_function(&self, index: usize) -> Option<JitFunction> {
        self.jit_functions.get(index).copied().flatten()
    }

    /// Run the named function on a fresh context.
    pub fn run(self: &Arc<Self>, name: &str, args: &[Value]) -> Result<Value, RuntimeError> {
        let target = self
            .function_index(name)
            .ok_or_else(|| RuntimeError::UnknownFunctionName(name.to_string()))?;
        let mut context = ExecutionContext::new(Arc::clone(self));
        let result = context.run(target, args)?;
        if self.config.verbose {
            log::info!("{name} returned {result}");
        }
        Ok(result)
    }
}

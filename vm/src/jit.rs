use object::Value;

use crate::{CallingConvention, ExecutionContext, RuntimeError};

pub type JitFunction0 = extern "C" fn(*mut ExecutionContext) -> u64;
pub type JitFunction1 = extern "C" fn(*mut ExecutionContext, u64) -> u64;
pub type JitFunction2 = extern "C" fn(*mut ExecutionContext, u64, u64) -> u64;
pub type JitFunction3 = extern "C" fn(*mut ExecutionContext, u64, u64, u64) -> u64;

/// A native entry point for a function.
///
/// Arguments and the result are raw [`Value`] words.
#[derive(Debug, Clone, Copy)]
pub enum JitFunction {
    Arity0(JitFunction0),
    Arity1(JitFunction1),
    Arity2(JitFunction2),
    Arity3(JitFunction3),
}

impl JitFunction {
    pub const MAX_ARITY: usize = 3;

    pub fn arity(self) -> usize {
        match self {
            Self::Arity0(_) => 0,
            Self::Arity1(_) => 1,
            Self::Arity2(_) => 2,
            Self::Arity3(_) => 3,
        }
    }
}

impl ExecutionContext {
    /// Invoke `jit` for a callee taking `nargs` arguments that are already on
    /// the stack.
    ///
    /// Under [`CallingConvention::PassParams`] the arguments are popped and
    /// passed in push order. Under [`CallingConvention::StackOnly`] only the
    /// context is passed and the entry must be nullary.
    pub fn call_jit_function(
        &mut self,
        jit: JitFunction,
        nargs: usize,
    ) -> Result<Value, RuntimeError> {
        let convention = self.config().calling_convention();
        if self.config().verbose {
            log::info!("transition to jit: {jit:?} ({convention:?})");
        } else {
            log::debug!("transition to jit: {jit:?} ({convention:?})");
        }

        let raw = match convention {
            CallingConvention::PassParams => {
                if nargs > JitFunction::MAX_ARITY {
                    return Err(RuntimeError::UnsupportedJitArity(nargs));
                }
                if jit.arity() != nargs {
                    return Err(RuntimeError::JitArity {
                        expected: jit.arity(),
                        got: nargs,
                    });
                }
                match jit {
                    JitFunction::Arity0(f) => f(self),
                    JitFunction::Arity1(f) => {
                        let p1 = self.pop()?;
                        f(self, p1.raw())
                    }
                    JitFunction::Arity2(f) => {
                        let p2 = self.pop()?;
                        let p1 = self.pop()?;
                        f(self, p1.raw(), p2.raw())
                    }
                    JitFunction::Arity3(f) => {
                        let p3 = self.pop()?;
                        let p2 = self.pop()?;
                        let p1 = self.pop()?;
                        f(self, p1.raw(), p2.raw(), p3.raw())
                    }
                }
            }
            CallingConvention::StackOnly => match jit {
                JitFunction::Arity0(f) => f(self),
                other => {
                    return Err(RuntimeError::JitArity {
                        expected: other.arity(),
                        got: 0,
                    });
                }
            },
        };

        Ok(Value::from_raw(raw))
    }
}

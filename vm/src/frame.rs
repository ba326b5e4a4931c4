use bytecode::FunctionDef;

use crate::RuntimeError;

/// Saved caller state slots between a frame's variables and its base
/// pointer: function index, instruction pointer, base pointer.
pub const SAVED_STATE_SLOTS: usize = 3;

/// Layout of one call frame on the stack.
///
/// ```text
///   base                                             bp
///   |  args (nargs)  |  locals (nregs)  | fn | ip | bp |  operands ...
/// ```
///
/// Variables are numbered from `base`: arguments first, then locals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    bp: usize,
    nargs: u32,
    nregs: u32,
}

impl Frame {
    pub fn new(bp: usize, function: &FunctionDef) -> Self {
        Self {
            bp,
            nargs: function.nargs,
            nregs: function.nregs,
        }
    }

    #[inline]
    pub fn bp(&self) -> usize {
        self.bp
    }

    #[inline]
    pub fn nvars(&self) -> u32 {
        self.nargs + self.nregs
    }

    /// Position of the first argument.
    pub fn base(&self) -> Result<usize, RuntimeError> {
        self.bp
            .checked_sub(SAVED_STATE_SLOTS + self.nvars() as usize)
            .ok_or(RuntimeError::StackUnderflow)
    }

    /// Stack position of variable `index`.
    pub fn local(&self, index: i32) -> Result<usize, RuntimeError> {
        let nvars = self.nvars();
        match u32::try_from(index) {
            Ok(i) if i < nvars => Ok(self.base()? + i as usize),
            _ => Err(RuntimeError::VariableOutOfRange { index, nvars }),
        }
    }

    pub fn saved_function_slot(&self) -> usize {
        self.bp - SAVED_STATE_SLOTS
    }

    pub fn saved_ip_slot(&self) -> usize {
        self.bp - 2
    }

    pub fn saved_bp_slot(&self) -> usize {
        self.bp - 1
    }
}

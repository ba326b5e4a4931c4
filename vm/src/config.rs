/// How the JIT bridge hands arguments to native code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    /// Pop the callee's arguments and pass them as raw words.
    PassParams,
    /// Pass only the context; the callee reads the stack itself.
    StackOnly,
}

/// Per-context interpreter settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Call through registered JIT entries instead of interpreting.
    pub jit: bool,
    pub pass_param: bool,
    /// Report JIT transitions and collections at `info` level.
    pub verbose: bool,
    /// Stack capacity in values.
    pub stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            jit: false,
            pass_param: true,
            verbose: false,
            stack_size: 1000,
        }
    }
}

impl Config {
    #[inline]
    pub fn calling_convention(&self) -> CallingConvention {
        if self.pass_param {
            CallingConvention::PassParams
        } else {
            CallingConvention::StackOnly
        }
    }
}

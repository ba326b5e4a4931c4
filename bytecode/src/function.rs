use crate::Instruction;

/// A loaded function: its code and frame dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDef {
    pub name: String,
    /// Arguments the caller pushes before the call.
    pub nargs: u32,
    /// Locals reserved by the callee on entry.
    pub nregs: u32,
    /// Normally terminated by [`Instruction::END_SECTION`].
    pub instructions: Vec<Instruction>,
}

impl FunctionDef {
    pub fn new(
        name: impl Into<String>,
        nargs: u32,
        nregs: u32,
        instructions: Vec<Instruction>,
    ) -> Self {
        Self {
            name: name.into(),
            nargs,
            nregs,
            instructions,
        }
    }

    /// Arguments plus locals; the valid range of variable indices.
    #[inline]
    pub fn nvars(&self) -> u32 {
        self.nargs + self.nregs
    }

    /// Render one instruction per line, prefixed with its position.
    pub fn disassemble(&self) -> String {
        let mut out = format!(
            "{} (nargs={}, nregs={})\n",
            self.name, self.nargs, self.nregs
        );
        for (pos, instruction) in self.instructions.iter().enumerate() {
            out.push_str(&format!("{pos:4}: {instruction}\n"));
        }
        out
    }
}

use core::fmt;

use crate::function::FunctionDef;
use crate::instruction::Instruction;
use crate::op::OpCode;

/// An immediate that does not fit the 24-bit field of its instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImmediateOutOfRange {
    pub op: OpCode,
    /// Position of the offending instruction.
    pub pos: usize,
    pub value: i64,
}

impl fmt::Display for ImmediateOutOfRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "immediate {} of {} at {} is outside {}..={}",
            self.value,
            self.op,
            self.pos,
            Instruction::IMMEDIATE_MIN,
            Instruction::IMMEDIATE_MAX
        )
    }
}

impl std::error::Error for ImmediateOutOfRange {}

/// A forward jump whose offset has not yet been resolved.
///
/// Created by [`FunctionBuilder::jmp`] and the conditional jump emitters.
/// Resolve it with [`FunctionBuilder::bind`].
#[derive(Debug)]
#[must_use = "an unbound label leaves a jump to the next instruction"]
pub struct Label {
    /// Position of the jump instruction.
    pos: usize,
    op: OpCode,
}

/// Builds the instruction array of one function.
///
/// Jump immediates are self-relative: a jump at position `p` with
/// immediate `i` lands on `p + i + 1`. The first immediate that does not fit
/// is reported by [`finish`](Self::finish).
pub struct FunctionBuilder {
    name: String,
    nargs: u32,
    nregs: u32,
    code: Vec<Instruction>,
    error: Option<ImmediateOutOfRange>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, nargs: u32, nregs: u32) -> Self {
        Self {
            name: name.into(),
            nargs,
            nregs,
            code: Vec::new(),
            error: None,
        }
    }

    /// Position the next instruction will be emitted at.
    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    /// Append [`Instruction::END_SECTION`] and produce the function.
    pub fn finish(mut self) -> Result<FunctionDef, ImmediateOutOfRange> {
        self.code.push(Instruction::END_SECTION);
        self.finish_unterminated()
    }

    /// Produce the function exactly as emitted, without a terminator.
    pub fn finish_unterminated(self) -> Result<FunctionDef, ImmediateOutOfRange> {
        if let Some(err) = self.error {
            return Err(err);
        }
        Ok(FunctionDef::new(self.name, self.nargs, self.nregs, self.code))
    }

    // ── emit helpers ───────────────────────────────────────────────

    pub fn emit(&mut self, op: OpCode, immediate: i32) -> &mut Self {
        self.emit_wide(op, immediate as i64)
    }

    fn emit_index(&mut self, op: OpCode, index: u32) -> &mut Self {
        self.emit_wide(op, index as i64)
    }

    fn emit_wide(&mut self, op: OpCode, value: i64) -> &mut Self {
        let pos = self.code.len();
        let immediate = self.checked(op, pos, value);
        self.code.push(Instruction::new(op, immediate));
        self
    }

    /// `value` as an immediate, or 0 after recording the first overflow.
    fn checked(&mut self, op: OpCode, pos: usize, value: i64) -> i32 {
        if Instruction::fits_immediate(value) {
            return value as i32;
        }
        if self.error.is_none() {
            self.error = Some(ImmediateOutOfRange { op, pos, value });
        }
        0
    }

    pub fn function_call(&mut self, target: u32) -> &mut Self {
        self.emit_index(OpCode::FunctionCall, target)
    }

    pub fn function_return(&mut self) -> &mut Self {
        self.emit(OpCode::FunctionReturn, 0)
    }

    pub fn primitive_call(&mut self, index: u32) -> &mut Self {
        self.emit_index(OpCode::PrimitiveCall, index)
    }

    pub fn duplicate(&mut self) -> &mut Self {
        self.emit(OpCode::Duplicate, 0)
    }

    pub fn drop_top(&mut self) -> &mut Self {
        self.emit(OpCode::Drop, 0)
    }

    pub fn push_from_var(&mut self, index: u32) -> &mut Self {
        self.emit_index(OpCode::PushFromVar, index)
    }

    pub fn pop_into_var(&mut self, index: u32) -> &mut Self {
        self.emit_index(OpCode::PopIntoVar, index)
    }

    pub fn int_push_constant(&mut self, value: i32) -> &mut Self {
        self.emit(OpCode::IntPushConstant, value)
    }

    pub fn int_add(&mut self) -> &mut Self {
        self.emit(OpCode::IntAdd, 0)
    }

    pub fn int_sub(&mut self) -> &mut Self {
        self.emit(OpCode::IntSub, 0)
    }

    pub fn int_mul(&mut self) -> &mut Self {
        self.emit(OpCode::IntMul, 0)
    }

    pub fn int_div(&mut self) -> &mut Self {
        self.emit(OpCode::IntDiv, 0)
    }

    pub fn int_not(&mut self) -> &mut Self {
        self.emit(OpCode::IntNot, 0)
    }

    pub fn str_push_constant(&mut self, index: u32) -> &mut Self {
        self.emit_index(OpCode::StrPushConstant, index)
    }

    pub fn new_object(&mut self) -> &mut Self {
        self.emit(OpCode::NewObject, 0)
    }

    pub fn push_from_object(&mut self, slot: u32) -> &mut Self {
        self.emit_index(OpCode::PushFromObject, slot)
    }

    pub fn pop_into_object(&mut self, slot: u32) -> &mut Self {
        self.emit_index(OpCode::PopIntoObject, slot)
    }

    pub fn call_indirect(&mut self) -> &mut Self {
        self.emit(OpCode::CallIndirect, 0)
    }

    pub fn system_collect(&mut self) -> &mut Self {
        self.emit(OpCode::SystemCollect, 0)
    }

    // ── jumps ──────────────────────────────────────────────────────

    /// Emit an unconditional forward jump. Returns a [`Label`] that must be
    /// resolved later with [`bind`](Self::bind).
    pub fn jmp(&mut self) -> Label {
        self.emit_jump_placeholder(OpCode::Jmp)
    }

    /// Emit a forward conditional jump (`op` must be one of the `IntJmp*`
    /// opcodes).
    pub fn jump_if(&mut self, op: OpCode) -> Label {
        debug_assert!(op.is_jump(), "{op} is not a jump");
        self.emit_jump_placeholder(op)
    }

    /// Bind a forward jump label to the current position.
    pub fn bind(&mut self, label: Label) {
        let target = self.code.len();
        let offset = self.checked(label.op, label.pos, Self::offset(label.pos, target));
        self.code[label.pos] = Instruction::new(label.op, offset);
    }

    /// Emit a jump (`op` must be a jump opcode) to an already known position,
    /// typically one obtained from [`current_offset`](Self::current_offset).
    pub fn jump_to(&mut self, op: OpCode, target: usize) -> &mut Self {
        debug_assert!(op.is_jump(), "{op} is not a jump");
        let pos = self.code.len();
        self.emit_wide(op, Self::offset(pos, target))
    }

    fn emit_jump_placeholder(&mut self, op: OpCode) -> Label {
        let pos = self.code.len();
        self.emit(op, 0);
        Label { pos, op }
    }

    fn offset(pos: usize, target: usize) -> i64 {
        target as i64 - pos as i64 - 1
    }
}

/// Bytecode opcodes.
///
/// Every instruction is one word: the opcode in the top byte and a signed
/// 24-bit immediate below it. Stack effects are written `( before -- after )`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Terminates a function's instruction array. Never executed.
    EndSection = 0x00,

    /// Call the function whose index is the immediate. Arguments must
    /// already be on the stack.
    FunctionCall,

    /// `( result -- )` tear down the current frame, then push `result` in
    /// the caller.
    FunctionReturn,

    /// Call the primitive whose index is the immediate.
    PrimitiveCall,

    /// Relative jump: `ip += immediate + 1`.
    Jmp,

    /// `( a -- a a )`
    Duplicate,

    /// `( a -- )`
    Drop,

    /// `( -- value )` push argument/local number `immediate`.
    PushFromVar,

    /// `( value -- )` store into argument/local number `immediate`.
    PopIntoVar,

    /// `( -- n )` push the immediate as an integer.
    IntPushConstant,

    /// `( left right -- left-right )`
    IntSub,

    /// `( left right -- left+right )`
    IntAdd,

    /// `( left right -- left*right )`
    IntMul,

    /// `( left right -- left/right )`
    IntDiv,

    /// `( n -- !n )` logical negation.
    IntNot,

    /// `( left right -- )` jump if `left == right`.
    IntJmpEq,

    /// `( left right -- )` jump if `left != right`.
    IntJmpNeq,

    /// `( left right -- )` jump if `left > right`.
    IntJmpGt,

    /// `( left right -- )` jump if `left >= right`.
    IntJmpGe,

    /// `( left right -- )` jump if `left < right`.
    IntJmpLt,

    /// `( left right -- )` jump if `left <= right`.
    IntJmpLe,

    /// `( -- handle )` push a string constant-pool index.
    StrPushConstant,

    /// `( -- object )` allocate an object with the empty shape.
    NewObject,

    /// `( object -- value )` read slot `immediate`.
    PushFromObject,

    /// `( value object -- )` write slot `immediate`, adding it if needed.
    PopIntoObject,

    /// Not supported by the interpreter.
    CallIndirect,

    /// Run a full garbage collection.
    SystemCollect,
}

impl OpCode {
    pub const COUNT: usize = OpCode::SystemCollect as usize + 1;

    pub const fn name(self) -> &'static str {
        match self {
            OpCode::EndSection => "END_SECTION",
            OpCode::FunctionCall => "FUNCTION_CALL",
            OpCode::FunctionReturn => "FUNCTION_RETURN",
            OpCode::PrimitiveCall => "PRIMITIVE_CALL",
            OpCode::Jmp => "JMP",
            OpCode::Duplicate => "DUPLICATE",
            OpCode::Drop => "DROP",
            OpCode::PushFromVar => "PUSH_FROM_VAR",
            OpCode::PopIntoVar => "POP_INTO_VAR",
            OpCode::IntPushConstant => "INT_PUSH_CONSTANT",
            OpCode::IntSub => "INT_SUB",
            OpCode::IntAdd => "INT_ADD",
            OpCode::IntMul => "INT_MUL",
            OpCode::IntDiv => "INT_DIV",
            OpCode::IntNot => "INT_NOT",
            OpCode::IntJmpEq => "INT_JMP_EQ",
            OpCode::IntJmpNeq => "INT_JMP_NEQ",
            OpCode::IntJmpGt => "INT_JMP_GT",
            OpCode::IntJmpGe => "INT_JMP_GE",
            OpCode::IntJmpLt => "INT_JMP_LT",
            OpCode::IntJmpLe => "INT_JMP_LE",
            OpCode::StrPushConstant => "STR_PUSH_CONSTANT",
            OpCode::NewObject => "NEW_OBJECT",
            OpCode::PushFromObject => "PUSH_FROM_OBJECT",
            OpCode::PopIntoObject => "POP_INTO_OBJECT",
            OpCode::CallIndirect => "CALL_INDIRECT",
            OpCode::SystemCollect => "SYSTEM_COLLECT",
        }
    }

    /// Whether the immediate is a relative jump offset.
    pub const fn is_jump(self) -> bool {
        matches!(
            self,
            OpCode::Jmp
                | OpCode::IntJmpEq
                | OpCode::IntJmpNeq
                | OpCode::IntJmpGt
                | OpCode::IntJmpGe
                | OpCode::IntJmpLt
                | OpCode::IntJmpLe
        )
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: OpCode is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, OpCode>(byte) })
        } else {
            Err(byte)
        }
    }
}

impl core::fmt::Display for OpCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

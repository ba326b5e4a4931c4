use core::fmt;

use crate::op::OpCode;

const OPCODE_SHIFT: u32 = 24;
const IMMEDIATE_MASK: u32 = (1 << OPCODE_SHIFT) - 1;

/// A single encoded instruction.
///
/// ```text
/// [opcode:8][immediate:24 (signed)]
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Instruction(u32);

impl Instruction {
    pub const IMMEDIATE_MIN: i32 = -(1 << 23);
    pub const IMMEDIATE_MAX: i32 = (1 << 23) - 1;

    /// Marks the end of a function's instruction array.
    pub const END_SECTION: Instruction = Instruction(0);

    /// Encode `op` with `immediate`, which is truncated to 24 bits.
    #[inline(always)]
    pub const fn new(op: OpCode, immediate: i32) -> Self {
        Self(((op as u32) << OPCODE_SHIFT) | (immediate as u32 & IMMEDIATE_MASK))
    }

    #[inline(always)]
    pub const fn op(op: OpCode) -> Self {
        Self::new(op, 0)
    }

    #[inline(always)]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub const fn opcode_byte(self) -> u8 {
        (self.0 >> OPCODE_SHIFT) as u8
    }

    /// The decoded opcode, or the offending byte.
    #[inline(always)]
    pub fn opcode(self) -> Result<OpCode, u8> {
        OpCode::try_from(self.opcode_byte())
    }

    /// The sign-extended immediate.
    #[inline(always)]
    pub const fn immediate(self) -> i32 {
        ((self.0 << 8) as i32) >> 8
    }

    #[inline(always)]
    pub const fn fits_immediate(value: i64) -> bool {
        value >= Self::IMMEDIATE_MIN as i64 && value <= Self::IMMEDIATE_MAX as i64
    }

    #[inline(always)]
    pub const fn is_end_section(self) -> bool {
        self.0 == Self::END_SECTION.0
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode() {
            Ok(op @ (OpCode::EndSection
            | OpCode::FunctionReturn
            | OpCode::Duplicate
            | OpCode::Drop
            | OpCode::IntSub
            | OpCode::IntAdd
            | OpCode::IntMul
            | OpCode::IntDiv
            | OpCode::IntNot
            | OpCode::NewObject
            | OpCode::CallIndirect
            | OpCode::SystemCollect)) => write!(f, "{op}"),
            Ok(op) => write!(f, "{op} {}", self.immediate()),
            Err(byte) => write!(f, "<invalid 0x{byte:02x}>"),
        }
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instruction({self})")
    }
}

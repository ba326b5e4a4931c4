use core::fmt;

use bytecode::OpCode;
use heap::HeapError;
use object::{ShapeError, SlotId, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    StackOverflow,
    StackUnderflow,
    UnknownFunction(usize),
    UnknownFunctionName(String),
    UnknownPrimitive(usize),
    /// An index immediate that is negative.
    InvalidImmediate { op: OpCode, immediate: i32 },
    UnknownOpcode { byte: u8, function: usize, ip: usize },
    /// Execution reached the end marker (or ran off the instruction array).
    UnexpectedEndOfFunction { function: usize, ip: usize },
    InvalidJump { function: usize, ip: usize, offset: i32 },
    VariableOutOfRange { index: i32, nvars: u32 },
    ArityMismatch { function: usize, expected: u32, got: usize },
    TypeMismatch { expected: &'static str, got: Value },
    NotAnObject(Value),
    NoSuchSlot(SlotId),
    DivideByZero,
    Unsupported(OpCode),
    /// The JIT entry's signature does not fit the call.
    JitArity { expected: usize, got: usize },
    UnsupportedJitArity(usize),
    Heap(HeapError),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackOverflow => write!(f, "stack overflow"),
            Self::StackUnderflow => write!(f, "stack underflow"),
            Self::UnknownFunction(index) => write!(f, "unknown function #{index}"),
            Self::UnknownFunctionName(name) => write!(f, "unknown function '{name}'"),
            Self::UnknownPrimitive(index) => write!(f, "unknown primitive #{index}"),
            Self::InvalidImmediate { op, immediate } => {
                write!(f, "{op} does not accept immediate {immediate}")
            }
            Self::UnknownOpcode { byte, function, ip } => write!(
                f,
                "unknown opcode 0x{byte:02x} in function #{function} at {ip}"
            ),
            Self::UnexpectedEndOfFunction { function, ip } => {
                write!(f, "reached end of function #{function} at {ip}")
            }
            Self::InvalidJump {
                function,
                ip,
                offset,
            } => write!(
                f,
                "jump by {offset} from {ip} leaves function #{function}"
            ),
            Self::VariableOutOfRange { index, nvars } => write!(
                f,
                "variable {index} out of range (function has {nvars})"
            ),
            Self::ArityMismatch {
                function,
                expected,
                got,
            } => write!(
                f,
                "function #{function} takes {expected} arguments, got {got}"
            ),
            Self::TypeMismatch { expected, got } => {
                write!(f, "expected {expected}, got {got:?}")
            }
            Self::NotAnObject(value) => {
                write!(f, "accessing non-object value {value:?} as an object")
            }
            Self::NoSuchSlot(slot) => write!(f, "object has no slot {slot}"),
            Self::DivideByZero => write!(f, "integer division by zero"),
            Self::Unsupported(op) => write!(f, "{op} is not supported"),
            Self::JitArity { expected, got } => write!(
                f,
                "jit entry takes {expected} arguments, call passes {got}"
            ),
            Self::UnsupportedJitArity(n) => {
                write!(f, "jit calls with {n} arguments are not supported")
            }
            Self::Heap(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<HeapError> for RuntimeError {
    fn from(err: HeapError) -> Self {
        Self::Heap(err)
    }
}

impl From<ShapeError> for RuntimeError {
    fn from(err: ShapeError) -> Self {
        Self::Heap(HeapError::Shape(err))
    }
}

mod op;
mod instruction;
mod function;
mod builder;

pub use op::OpCode;
pub use instruction::Instruction;
pub use function::FunctionDef;
pub use builder::{FunctionBuilder, ImmediateOutOfRange, Label};

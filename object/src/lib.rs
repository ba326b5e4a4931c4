mod value;
mod slot;
mod shape;

pub use value::{INT48_MAX, INT48_MIN, ObjectRef, UINT48_MAX, Value, ValueKind};
pub use slot::{CoreType, SlotDescriptor, SlotId, SlotSpec, SlotType};
pub use shape::{Shape, ShapeError, ShapeId, ShapeTable};

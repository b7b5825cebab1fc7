//! Object-graph serialization.
//!
//! A stream is a sequence of instructions; replaying them rebuilds the
//! values in order. Each value ends in a checkpoint naming the object that
//! is the value.

mod deserializer;
mod describe;
mod error;
mod operation;
#[allow(clippy::module_inception)]
mod serializer;

pub use deserializer::Deserializer;
pub use describe::{describe, DescribedInstruction, StreamDescription};
pub use error::{DeserializerError, Malformed, SerializerError};
pub use operation::{Operand, OperandKind, SerializerOperation};
pub use serializer::Serializer;

use kestrel_core::{ModuleRegistry, SpecialObjects, Value};

/// Serialize `values` into one stream, sharing structure between them.
pub fn to_bytes(
    values: &[Value],
    specials: &SpecialObjects,
    modules: &ModuleRegistry,
) -> Result<Vec<u8>, SerializerError> {
    let mut serializer = Serializer::new(Vec::new(), specials, modules);
    for value in values {
        serializer.serialize(value)?;
    }
    Ok(serializer.into_inner())
}

/// Every value in `bytes`.
pub fn from_bytes(
    bytes: &[u8],
    specials: &SpecialObjects,
    modules: &ModuleRegistry,
) -> Result<Vec<Value>, DeserializerError> {
    Deserializer::new(bytes, specials, modules).deserialize_all()
}

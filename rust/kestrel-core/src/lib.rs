//! Kestrel Core
//!
//! The value and type model shared by the dispatch engine, the level-two
//! machine and the serializer: tagged values, first-class types with their
//! lattice operations, atoms and modules, compiled code, and the registry of
//! special objects.

pub mod atoms;
pub mod code;
pub mod error;
pub mod function;
pub mod module;
pub mod special;
pub mod types;
pub mod values;
pub mod variable;

pub use atoms::{Atom, AtomRef};
pub use code::{decode_level_one, encode_level_one, CodeBuilder, CodeError, CompiledCode, L1Instruction};
pub use error::ErrorCode;
pub use function::{Continuation, Function};
pub use module::{Module, ModuleError, ModuleId, ModuleRegistry};
pub use special::{SpecialAtom, SpecialObject, SpecialObjects};
pub use types::{FunctionType, IntRange, MapType, SetType, SizeRange, TupleType, Type};
pub use values::{MapValue, SetValue, Value};
pub use variable::{Variable, VariableObserver, VariableRef};

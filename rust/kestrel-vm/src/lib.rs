//! Kestrel VM
//!
//! The level-two register machine: registers and operands, the closed
//! operation catalog with its runtime and static (type-propagation)
//! behaviours, chunks and the generation-tagged chunk arena, the translator
//! that specializes level-one code into chunks, the primitive registry, and
//! the interpreter that runs both tiers on an explicit frame stack.

pub mod arena;
pub mod chunk;
pub mod config;
pub mod context;
pub mod error;
pub mod execute;
pub mod instruction;
pub mod interpreter;
pub mod operand;
pub mod operation;
pub mod primitive;
pub mod register;
pub mod register_set;
pub mod stats;
pub mod translator;
pub mod type_flow;

pub use arena::{ChunkArena, ChunkSelection};
pub use chunk::{ChunkState, Dependency, L2Chunk};
pub use config::VmConfig;
pub use context::VmContext;
pub use error::VmError;
pub use instruction::L2Instruction;
pub use interpreter::{Interpreter, RunOutcome};
pub use operand::{L2Operand, OperandKind, ReadRegister, Selector, WriteRegister};
pub use operation::L2Operation;
pub use primitive::{
    InterpreterState, Primitive, PrimitiveFlags, PrimitiveRegistry, PrimitiveResult,
    SuspendRequest,
};
pub use register::{L2Register, RegisterAllocator, RegisterCounts, RegisterFile, RegisterKind};
pub use register_set::{RegisterInfo, RegisterSet};
pub use stats::VmStats;
pub use translator::Translator;
pub use type_flow::{propagate_types, simplify, SimplifyReport, TypeFlow};

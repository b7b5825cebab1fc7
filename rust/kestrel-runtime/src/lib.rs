//! Kestrel Runtime
//!
//! Fibers multiplexed over a pool of OS worker threads, the timer service
//! that wakes sleeping fibers, and the serializer that persists value graphs
//! (compiled code included) as replayable instruction streams.

pub mod config;
pub mod fiber;
pub mod scheduler;
pub mod serializer;
pub mod timer;

pub use config::SchedulerConfig;
pub use fiber::{Fiber, FiberId, FiberResult, FiberState, Slice};
pub use scheduler::Scheduler;
pub use serializer::{
    describe, from_bytes, to_bytes, DescribedInstruction, Deserializer, DeserializerError, Malformed,
    Operand, OperandKind, SerializerError, SerializerOperation, Serializer, StreamDescription,
};
pub use timer::{TimerHandle, TimerService, WakeFn};

//! Compiled level-two chunks.

use crate::instruction::L2Instruction;
use crate::operation::L2Operation;
use crate::register::RegisterCounts;
use kestrel_dispatch::Method;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use strum::{Display, FromRepr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[strum(serialize_all = "kebab-case")]
#[repr(u8)]
pub enum ChunkState {
    UnoptimizedDefault,
    BeingSpecialized,
    Valid,
    Invalidated,
}

/// A method a chunk assumed, with the epoch it was translated against.
#[derive(Clone)]
pub struct Dependency {
    pub method: Arc<Method>,
    pub epoch: u64,
}

impl Dependency {
    pub fn is_current(&self) -> bool {
        self.method.epoch() == self.epoch
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.method.name(), self.epoch)
    }
}

pub struct L2Chunk {
    name: Arc<str>,
    instructions: Vec<L2Instruction>,
    counts: RegisterCounts,
    dependencies: Vec<Dependency>,
    state: AtomicU8,
}

impl L2Chunk {
    pub fn new(
        name: impl Into<Arc<str>>,
        instructions: Vec<L2Instruction>,
        counts: RegisterCounts,
        dependencies: Vec<Dependency>,
    ) -> Self {
        assert!(
            instructions
                .first()
                .is_some_and(|i| i.operation() == L2Operation::EnterChunk),
            "a chunk starts with enter_chunk"
        );
        L2Chunk {
            name: name.into(),
            instructions,
            counts,
            dependencies,
            state: AtomicU8::new(ChunkState::BeingSpecialized as u8),
        }
    }

    /// The chunk every function starts in: count the invocation, translate
    /// when hot, otherwise interpret the level-one code.
    pub fn unoptimized_default() -> Arc<Self> {
        let chunk = L2Chunk {
            name: Arc::from("default"),
            instructions: vec![
                L2Instruction::new(L2Operation::EnterChunk, vec![]),
                L2Instruction::new(L2Operation::DecrementCounterAndReoptimize, vec![]),
                L2Instruction::new(L2Operation::InterpretLevelOne, vec![]),
            ],
            counts: RegisterCounts::default(),
            dependencies: Vec::new(),
            state: AtomicU8::new(ChunkState::UnoptimizedDefault as u8),
        };
        Arc::new(chunk)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &[L2Instruction] {
        &self.instructions
    }

    pub fn instruction(&self, pc: usize) -> &L2Instruction {
        &self.instructions[pc]
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn counts(&self) -> RegisterCounts {
        self.counts
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn state(&self) -> ChunkState {
        ChunkState::from_repr(self.state.load(Ordering::Acquire))
            .unwrap_or(ChunkState::Invalidated)
    }

    pub(crate) fn set_state(&self, state: ChunkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_default(&self) -> bool {
        self.state() == ChunkState::UnoptimizedDefault
    }

    /// Whether the chunk may be entered.
    pub fn is_runnable(&self) -> bool {
        matches!(
            self.state(),
            ChunkState::UnoptimizedDefault | ChunkState::Valid
        )
    }

    /// Whether any assumed method changed since translation.
    pub fn has_stale_dependency(&self) -> bool {
        self.dependencies.iter().any(|d| !d.is_current())
    }
}

impl fmt::Debug for L2Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("L2Chunk")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("instructions", &self.instructions.len())
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

impl fmt::Display for L2Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "chunk {} ({})", self.name, self.state())?;
        for (pc, instruction) in self.instructions.iter().enumerate() {
            writeln!(f, "{:4}: {}", pc, instruction)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_chunk_shape() {
        let chunk = L2Chunk::unoptimized_default();
        assert!(chunk.is_default());
        assert!(chunk.is_runnable());
        assert_eq!(
            chunk.instruction(1).operation(),
            L2Operation::DecrementCounterAndReoptimize
        );
    }

    #[test]
    fn test_invalidated_chunk_is_not_runnable() {
        let chunk = L2Chunk::new(
            "t",
            vec![L2Instruction::new(L2Operation::EnterChunk, vec![])],
            RegisterCounts::default(),
            vec![],
        );
        assert_eq!(chunk.state(), ChunkState::BeingSpecialized);
        assert!(!chunk.is_runnable());
        chunk.set_state(ChunkState::Valid);
        assert!(chunk.is_runnable());
        chunk.set_state(ChunkState::Invalidated);
        assert!(!chunk.is_runnable());
    }
}

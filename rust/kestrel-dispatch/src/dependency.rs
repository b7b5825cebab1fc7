//! Dependency edges from compiled chunks to the methods they assumed.

use crate::method::Method;
use std::fmt;
use std::sync::Arc;

/// Generation-tagged reference to a chunk slot. A handle whose generation no
/// longer matches its slot refers to a chunk that has been discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkHandle {
    pub index: u32,
    pub generation: u32,
}

impl fmt::Display for ChunkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk#{}.{}", self.index, self.generation)
    }
}

/// Called whenever a method gains or loses a definition, with every chunk
/// that recorded a dependency on it. Runs outside the method's locks.
pub trait InvalidationHook: Send + Sync {
    fn invalidate_dependents(&self, method: &Arc<Method>, chunks: &[ChunkHandle]);
}

//! Generation-tagged storage for translated chunks.
//!
//! Dependency edges point at slots through [`ChunkHandle`]s. Invalidating a
//! chunk bumps its slot's generation, so every handle to it, including the
//! one remembered by the code table, stops resolving at once.

use crate::chunk::{ChunkState, L2Chunk};
use kestrel_dispatch::{ChunkHandle, InvalidationHook, Method};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct Slot {
    generation: u32,
    chunk: Option<Arc<L2Chunk>>,
}

/// Per compiled-code bookkeeping: invocations left before translation and
/// the translated chunk, if any.
#[derive(Debug, Clone, Copy)]
struct CodeEntry {
    countdown: u32,
    handle: Option<ChunkHandle>,
}

/// The chunk a call should enter.
#[derive(Debug, Clone)]
pub struct ChunkSelection {
    pub chunk: Arc<L2Chunk>,
    pub handle: Option<ChunkHandle>,
    /// The code had a translated chunk that has since been invalidated.
    pub was_invalidated: bool,
}

pub struct ChunkArena {
    slots: RwLock<Vec<Slot>>,
    free: Mutex<Vec<u32>>,
    code_table: Mutex<HashMap<u64, CodeEntry>>,
    default_chunk: Arc<L2Chunk>,
    reoptimize_threshold: u32,
    invalidations: AtomicU64,
}

impl ChunkArena {
    pub fn new(reoptimize_threshold: u32) -> Self {
        ChunkArena {
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
            code_table: Mutex::new(HashMap::new()),
            default_chunk: L2Chunk::unoptimized_default(),
            reoptimize_threshold,
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn default_chunk(&self) -> &Arc<L2Chunk> {
        &self.default_chunk
    }

    /// Store a freshly translated chunk and register it with every method
    /// it depends on. Returns `None`, leaving nothing installed, when one of
    /// those methods changed while the chunk was being translated.
    pub fn install(&self, chunk: L2Chunk) -> Option<ChunkHandle> {
        let chunk = Arc::new(chunk);
        let handle = self.allocate(chunk.clone());
        for dependency in chunk.dependencies() {
            dependency.method.add_dependent(handle);
        }
        // A change after registration reaches us through the hook; one
        // before it shows up as a moved epoch.
        if chunk.has_stale_dependency() {
            tracing::debug!(chunk = chunk.name(), "dependencies changed during translation");
            self.invalidate(handle);
            return None;
        }
        chunk.set_state(ChunkState::Valid);
        tracing::debug!(
            chunk = chunk.name(),
            %handle,
            instructions = chunk.len(),
            "installed chunk"
        );
        Some(handle)
    }

    fn allocate(&self, chunk: Arc<L2Chunk>) -> ChunkHandle {
        let mut slots = self.slots.write();
        if let Some(index) = self.free.lock().pop() {
            let slot = &mut slots[index as usize];
            slot.chunk = Some(chunk);
            return ChunkHandle {
                index,
                generation: slot.generation,
            };
        }
        slots.push(Slot {
            generation: 0,
            chunk: Some(chunk),
        });
        ChunkHandle {
            index: (slots.len() - 1) as u32,
            generation: 0,
        }
    }

    /// The chunk behind `handle`, if it is still installed and valid.
    pub fn get(&self, handle: ChunkHandle) -> Option<Arc<L2Chunk>> {
        let slots = self.slots.read();
        let slot = slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.chunk.clone().filter(|c| c.is_runnable())
    }

    /// Discard the chunk behind `handle`. Returns whether it was live.
    pub fn invalidate(&self, handle: ChunkHandle) -> bool {
        let chunk = {
            let mut slots = self.slots.write();
            let Some(slot) = slots.get_mut(handle.index as usize) else {
                return false;
            };
            if slot.generation != handle.generation {
                return false;
            }
            slot.generation = slot.generation.wrapping_add(1);
            slot.chunk.take()
        };
        self.free.lock().push(handle.index);
        let Some(chunk) = chunk else {
            return false;
        };
        chunk.set_state(ChunkState::Invalidated);
        for dependency in chunk.dependencies() {
            dependency.method.remove_dependent(handle);
        }
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(chunk = chunk.name(), %handle, "invalidated chunk");
        true
    }

    pub fn live_chunks(&self) -> usize {
        self.slots
            .read()
            .iter()
            .filter(|s| s.chunk.is_some())
            .count()
    }

    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    // -----------------------------------------------------------------------
    // Code table
    // -----------------------------------------------------------------------

    /// Which chunk an invocation of code `code_id` should run. Checked on
    /// every entry: a stale chunk sends the call back to the default chunk
    /// and restarts the countdown.
    pub fn chunk_for(&self, code_id: u64) -> ChunkSelection {
        let mut table = self.code_table.lock();
        let entry = table.entry(code_id).or_insert(CodeEntry {
            countdown: self.reoptimize_threshold,
            handle: None,
        });
        if let Some(handle) = entry.handle {
            if let Some(chunk) = self.get(handle) {
                return ChunkSelection {
                    chunk,
                    handle: Some(handle),
                    was_invalidated: false,
                };
            }
            entry.handle = None;
            entry.countdown = self.reoptimize_threshold;
            return ChunkSelection {
                chunk: self.default_chunk.clone(),
                handle: None,
                was_invalidated: true,
            };
        }
        ChunkSelection {
            chunk: self.default_chunk.clone(),
            handle: None,
            was_invalidated: false,
        }
    }

    /// Count one invocation through the default chunk. Returns true when
    /// the code has become hot; the countdown then restarts.
    pub fn countdown(&self, code_id: u64) -> bool {
        let mut table = self.code_table.lock();
        let entry = table.entry(code_id).or_insert(CodeEntry {
            countdown: self.reoptimize_threshold,
            handle: None,
        });
        entry.countdown = entry.countdown.saturating_sub(1);
        if entry.countdown == 0 {
            entry.countdown = self.reoptimize_threshold.max(1);
            true
        } else {
            false
        }
    }

    /// Record `handle` as the optimized chunk of code `code_id`.
    pub fn set_optimized(&self, code_id: u64, handle: ChunkHandle) {
        let previous = {
            let mut table = self.code_table.lock();
            let entry = table.entry(code_id).or_insert(CodeEntry {
                countdown: self.reoptimize_threshold,
                handle: None,
            });
            entry.handle.replace(handle)
        };
        if let Some(previous) = previous.filter(|p| *p != handle) {
            self.invalidate(previous);
        }
    }

    pub fn optimized_handle(&self, code_id: u64) -> Option<ChunkHandle> {
        self.code_table
            .lock()
            .get(&code_id)
            .and_then(|e| e.handle)
            .filter(|h| self.get(*h).is_some())
    }
}

impl InvalidationHook for ChunkArena {
    fn invalidate_dependents(&self, method: &Arc<Method>, chunks: &[ChunkHandle]) {
        let count = chunks.iter().filter(|h| self.invalidate(**h)).count();
        tracing::debug!(method = %method.name(), count, "method change invalidated chunks");
    }
}

impl std::fmt::Debug for ChunkArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkArena")
            .field("live_chunks", &self.live_chunks())
            .field("invalidations", &self.invalidation_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Dependency;
    use crate::instruction::L2Instruction;
    use crate::operation::L2Operation;
    use crate::register::RegisterCounts;
    use kestrel_core::AtomRef;

    fn chunk_depending_on(method: &Arc<Method>, epoch: u64) -> L2Chunk {
        L2Chunk::new(
            "test",
            vec![L2Instruction::new(L2Operation::EnterChunk, vec![])],
            RegisterCounts::default(),
            vec![Dependency {
                method: method.clone(),
                epoch,
            }],
        )
    }

    #[test]
    fn test_install_registers_dependents() {
        let arena = ChunkArena::new(2);
        let method = Arc::new(Method::new(AtomRef::new("m", None), 0));
        let handle = arena.install(chunk_depending_on(&method, method.epoch())).unwrap();
        assert_eq!(method.dependent_count(), 1);
        assert!(arena.get(handle).is_some());

        assert!(arena.invalidate(handle));
        assert!(arena.get(handle).is_none());
        assert_eq!(method.dependent_count(), 0);
        assert!(!arena.invalidate(handle));
    }

    #[test]
    fn test_install_rejects_stale_epoch() {
        let arena = ChunkArena::new(2);
        let method = Arc::new(Method::new(AtomRef::new("m", None), 0));
        assert!(arena.install(chunk_depending_on(&method, method.epoch() + 1)).is_none());
        assert_eq!(method.dependent_count(), 0);
        assert_eq!(arena.live_chunks(), 0);
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let arena = ChunkArena::new(2);
        let method = Arc::new(Method::new(AtomRef::new("m", None), 0));
        let first = arena.install(chunk_depending_on(&method, 0)).unwrap();
        arena.invalidate(first);
        let second = arena.install(chunk_depending_on(&method, 0)).unwrap();
        assert_eq!(first.index, second.index);
        assert_ne!(first.generation, second.generation);
        assert!(arena.get(first).is_none());
    }

    #[test]
    fn test_code_table_falls_back_after_invalidation() {
        let arena = ChunkArena::new(2);
        let method = Arc::new(Method::new(AtomRef::new("m", None), 0));
        assert!(!arena.countdown(7));
        assert!(arena.countdown(7));
        let handle = arena.install(chunk_depending_on(&method, 0)).unwrap();
        arena.set_optimized(7, handle);
        assert_eq!(arena.chunk_for(7).handle, Some(handle));

        arena.invalidate(handle);
        let selection = arena.chunk_for(7);
        assert!(selection.chunk.is_default());
        assert!(selection.was_invalidated);
        assert!(!arena.chunk_for(7).was_invalidated);
    }
}

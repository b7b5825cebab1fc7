//! Per-call-site polymorphic inline cache.
//!
//! Each entry records a region of argument space (the parameter types of a
//! definition) that is known to reach exactly that definition. A call whose
//! arguments fall in a cached region skips the lookup tree. Entries are only
//! valid for the method epoch they were filled in; any change to the method
//! empties the cache on the next probe.

use crate::definition::Definition;
use crate::error::LookupError;
use crate::method::Method;
use kestrel_core::Value;
use parking_lot::Mutex;
use std::sync::Arc;

pub const DEFAULT_INLINE_CACHE_ENTRIES: usize = 4;

struct Entry {
    definition: Arc<Definition>,
    hits: u64,
}

struct CacheState {
    epoch: u64,
    entries: Vec<Entry>,
    misses: u64,
}

pub struct InlineCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InlineCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl InlineCache {
    pub fn new(capacity: usize) -> Self {
        InlineCache {
            capacity,
            state: Mutex::new(CacheState {
                epoch: u64::MAX,
                entries: Vec::with_capacity(capacity),
                misses: 0,
            }),
        }
    }

    pub fn lookup(&self, method: &Method, args: &[Value]) -> Result<Arc<Definition>, LookupError> {
        let epoch = method.epoch();
        {
            let mut state = self.state.lock();
            if state.epoch != epoch {
                state.entries.clear();
                state.epoch = epoch;
            }
            if let Some(entry) = state
                .entries
                .iter_mut()
                .find(|e| e.definition.applies_to_values(args))
            {
                entry.hits += 1;
                return Ok(entry.definition.clone());
            }
            state.misses += 1;
        }

        let definition = method.lookup_by_values(args)?;
        let region = method.definitions_at_or_below(definition.param_types());
        let cacheable = region
            .monomorphic_target()
            .is_some_and(|target| Arc::ptr_eq(target, &definition));
        if cacheable && self.capacity > 0 {
            let mut state = self.state.lock();
            if state.epoch == epoch && method.epoch() == epoch {
                if state.entries.len() >= self.capacity {
                    // Evict the least used entry.
                    if let Some(victim) = state
                        .entries
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, e)| e.hits)
                        .map(|(i, _)| i)
                    {
                        state.entries.swap_remove(victim);
                    }
                }
                state.entries.push(Entry {
                    definition: definition.clone(),
                    hits: 0,
                });
            }
        }
        Ok(definition)
    }

    pub fn stats(&self) -> InlineCacheStats {
        let state = self.state.lock();
        InlineCacheStats {
            entries: state.entries.len(),
            hits: state.entries.iter().map(|e| e.hits).sum(),
            misses: state.misses,
        }
    }
}

impl Default for InlineCache {
    fn default() -> Self {
        Self::new(DEFAULT_INLINE_CACHE_ENTRIES)
    }
}

impl std::fmt::Debug for InlineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("InlineCache")
            .field("capacity", &self.capacity)
            .field("entries", &stats.entries)
            .finish()
    }
}

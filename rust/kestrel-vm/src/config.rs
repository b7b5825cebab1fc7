//! Tuning knobs for the level-two machine.

use kestrel_dispatch::{DEFAULT_INLINE_CACHE_ENTRIES, DEFAULT_MAX_TREE_DEPTH};
use serde::{Deserialize, Serialize};

/// Configuration for translation, dispatch and the interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct VmConfig {
    /// Invocations through the default chunk before a function is translated.
    pub reoptimize_threshold: u32,
    /// Frames on one interpreter's stack before it reports overflow.
    pub max_call_depth: usize,
    /// Lookup-tree depth past which a method scans its candidates.
    pub max_lookup_tree_depth: usize,
    /// Entries in each polymorphic call-site cache.
    pub inline_cache_entries: usize,
    /// Whether functions are translated to level two at all.
    pub optimize: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            reoptimize_threshold: 10,
            max_call_depth: 10_000,
            max_lookup_tree_depth: DEFAULT_MAX_TREE_DEPTH,
            inline_cache_entries: DEFAULT_INLINE_CACHE_ENTRIES,
            optimize: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: VmConfig = toml::from_str("reoptimize_threshold = 3\noptimize = false").unwrap();
        assert_eq!(config.reoptimize_threshold, 3);
        assert!(!config.optimize);
        assert_eq!(config.max_call_depth, VmConfig::default().max_call_depth);
    }
}

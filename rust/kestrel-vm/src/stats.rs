use serde::Serialize;

/// Counters kept by one interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct VmStats {
    pub l1_instructions: u64,
    pub l2_instructions: u64,
    /// Calls that entered the shared unoptimized chunk.
    pub default_chunk_entries: u64,
    /// Calls that entered a translated chunk.
    pub optimized_chunk_entries: u64,
    pub reoptimizations: u64,
    /// Calls that found their translated chunk invalidated and fell back.
    pub invalidated_entries: u64,
    pub calls: u64,
    pub primitive_attempts: u64,
    pub primitive_failures: u64,
}

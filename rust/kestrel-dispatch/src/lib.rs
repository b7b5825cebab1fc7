//! Kestrel Dispatch
//!
//! Type-directed multiple dispatch. A [`Method`] holds a set of
//! [`Definition`]s keyed by parameter-type tuples and answers two questions:
//! which definition do these argument *values* reach (exact lookup through
//! a lazily expanded decision tree), and which definitions could arguments
//! bounded by these *types* reach (upper-bound lookup, used by the
//! optimiser). Compiled chunks that rely on an answer register themselves as
//! dependents and are invalidated through the [`InvalidationHook`] when the
//! method changes.

pub mod definition;
pub mod dependency;
pub mod error;
pub mod inline_cache;
mod lookup_tree;
pub mod method;
pub mod registry;

pub use definition::{Definition, DefinitionBody};
pub use dependency::{ChunkHandle, InvalidationHook};
pub use error::{DispatchError, LookupError};
pub use inline_cache::{InlineCache, InlineCacheStats, DEFAULT_INLINE_CACHE_ENTRIES};
pub use lookup_tree::{most_specific, Solution};
pub use method::{Method, UpperBound, DEFAULT_MAX_TREE_DEPTH};
pub use registry::MethodRegistry;

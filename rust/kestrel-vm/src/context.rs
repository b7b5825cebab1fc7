//! Shared services every interpreter and translator runs against.

use crate::arena::ChunkArena;
use crate::config::VmConfig;
use crate::primitive::PrimitiveRegistry;
use kestrel_core::{ModuleRegistry, SpecialObjects};
use kestrel_dispatch::MethodRegistry;
use std::sync::Arc;

pub struct VmContext {
    pub modules: ModuleRegistry,
    pub specials: Arc<SpecialObjects>,
    pub methods: MethodRegistry,
    pub chunks: Arc<ChunkArena>,
    pub primitives: PrimitiveRegistry,
    pub config: VmConfig,
}

impl VmContext {
    pub fn new(config: VmConfig) -> Arc<Self> {
        Self::with_specials(config, Arc::new(SpecialObjects::standard()))
    }

    pub fn with_specials(config: VmConfig, specials: Arc<SpecialObjects>) -> Arc<Self> {
        let chunks = Arc::new(ChunkArena::new(config.reoptimize_threshold));
        let methods = MethodRegistry::with_max_tree_depth(config.max_lookup_tree_depth);
        methods.set_invalidation_hook(chunks.clone());
        let primitives = PrimitiveRegistry::standard(&specials);
        tracing::debug!(
            primitives = primitives.len(),
            threshold = config.reoptimize_threshold,
            "created vm context"
        );
        Arc::new(VmContext {
            modules: ModuleRegistry::new(),
            specials,
            methods,
            chunks,
            primitives,
            config,
        })
    }
}

impl std::fmt::Debug for VmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmContext")
            .field("methods", &self.methods.len())
            .field("chunks", &self.chunks)
            .field("primitives", &self.primitives)
            .field("config", &self.config)
            .finish()
    }
}

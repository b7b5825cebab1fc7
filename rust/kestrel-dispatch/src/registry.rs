//! The method registry: every method by name, plus the invalidation hook.

use crate::definition::Definition;
use crate::dependency::InvalidationHook;
use crate::error::DispatchError;
use crate::method::{Method, DEFAULT_MAX_TREE_DEPTH};
use kestrel_core::{AtomRef, FunctionType};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub struct MethodRegistry {
    methods: RwLock<HashMap<AtomRef, Arc<Method>>>,
    hook: RwLock<Option<Arc<dyn InvalidationHook>>>,
    max_tree_depth: usize,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::with_max_tree_depth(DEFAULT_MAX_TREE_DEPTH)
    }

    pub fn with_max_tree_depth(max_tree_depth: usize) -> Self {
        MethodRegistry {
            methods: RwLock::new(HashMap::new()),
            hook: RwLock::new(None),
            max_tree_depth,
        }
    }

    pub fn set_invalidation_hook(&self, hook: Arc<dyn InvalidationHook>) {
        *self.hook.write() = Some(hook);
    }

    pub fn method(&self, name: &AtomRef) -> Option<Arc<Method>> {
        self.methods.read().get(name).cloned()
    }

    /// The method called `name`, created empty if it does not exist yet.
    pub fn method_or_create(&self, name: &AtomRef, num_args: usize) -> Arc<Method> {
        if let Some(method) = self.method(name) {
            return method;
        }
        self.methods
            .write()
            .entry(name.clone())
            .or_insert_with(|| {
                Arc::new(Method::with_max_tree_depth(
                    name.clone(),
                    num_args,
                    self.max_tree_depth,
                ))
            })
            .clone()
    }

    pub fn add_definition(
        &self,
        name: &AtomRef,
        definition: Definition,
    ) -> Result<Arc<Method>, DispatchError> {
        let method = self.method_or_create(name, definition.param_types().len());
        method.add_definition(definition)?;
        self.notify(&method);
        Ok(method)
    }

    pub fn remove_definition(
        &self,
        name: &AtomRef,
        signature: &FunctionType,
    ) -> Result<Arc<Definition>, DispatchError> {
        let method = self
            .method(name)
            .ok_or_else(|| DispatchError::NoSuchDefinition {
                name: name.name().to_string(),
                signature: signature.to_string(),
            })?;
        let removed = method.remove_definition(signature)?;
        self.notify(&method);
        Ok(removed)
    }

    fn notify(&self, method: &Arc<Method>) {
        let chunks = method.take_dependents();
        if chunks.is_empty() {
            return;
        }
        tracing::debug!(
            method = %method.name(),
            chunks = chunks.len(),
            "invalidating dependent chunks"
        );
        let hook = self.hook.read().clone();
        match hook {
            Some(hook) => hook.invalidate_dependents(method, &chunks),
            None => tracing::warn!(
                method = %method.name(),
                "definition changed with dependents but no invalidation hook installed"
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.methods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

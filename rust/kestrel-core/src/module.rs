//! Modules and the module registry.
//!
//! A module issues atoms and imports other modules. An atom is visible from
//! a module when its issuer is that module or one of its transitive
//! ancestors; the serializer relies on this to refuse streams that could not
//! be replayed into a different module graph.

use crate::atoms::AtomRef;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModuleError {
    #[error("a module named '{0}' already exists")]
    DuplicateName(String),
    #[error("module '{module}' imports unknown module '{import}'")]
    UnknownImport { module: String, import: String },
}

pub struct Module {
    id: ModuleId,
    name: Arc<str>,
    ancestors: HashSet<ModuleId>,
    atoms: RwLock<HashMap<Arc<str>, AtomRef>>,
}

impl Module {
    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// This module and everything it transitively imports.
    pub fn ancestors(&self) -> &HashSet<ModuleId> {
        &self.ancestors
    }

    /// The atom this module issued under `name`, issuing it on first use.
    pub fn atom_named(&self, name: &str) -> AtomRef {
        if let Some(atom) = self.atoms.read().get(name) {
            return atom.clone();
        }
        let mut atoms = self.atoms.write();
        atoms
            .entry(Arc::from(name))
            .or_insert_with(|| AtomRef::new(name, Some(self.id)))
            .clone()
    }

    pub fn lookup_atom(&self, name: &str) -> Option<AtomRef> {
        self.atoms.read().get(name).cloned()
    }

    pub fn can_see(&self, atom: &AtomRef) -> bool {
        atom.issuing_module()
            .is_some_and(|issuer| self.ancestors.contains(&issuer))
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Default)]
struct RegistryInner {
    modules: Vec<Arc<Module>>,
    by_name: HashMap<Arc<str>, ModuleId>,
}

/// Every loaded module, by id and by name.
#[derive(Default)]
pub struct ModuleRegistry {
    inner: RwLock<RegistryInner>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_module(&self, name: &str, imports: &[&str]) -> Result<Arc<Module>, ModuleError> {
        let mut inner = self.inner.write();
        if inner.by_name.contains_key(name) {
            return Err(ModuleError::DuplicateName(name.to_string()));
        }
        let id = ModuleId(inner.modules.len() as u32);
        let mut ancestors = HashSet::from([id]);
        for import in imports {
            let import_id = inner
                .by_name
                .get(*import)
                .copied()
                .ok_or_else(|| ModuleError::UnknownImport {
                    module: name.to_string(),
                    import: import.to_string(),
                })?;
            ancestors.extend(inner.modules[import_id.0 as usize].ancestors.iter().copied());
        }
        let module = Arc::new(Module {
            id,
            name: Arc::from(name),
            ancestors,
            atoms: RwLock::new(HashMap::new()),
        });
        inner.modules.push(module.clone());
        inner.by_name.insert(module.name.clone(), id);
        tracing::debug!(module = name, id = id.0, "module added");
        Ok(module)
    }

    pub fn module(&self, id: ModuleId) -> Option<Arc<Module>> {
        self.inner.read().modules.get(id.0 as usize).cloned()
    }

    pub fn module_named(&self, name: &str) -> Option<Arc<Module>> {
        let inner = self.inner.read();
        let id = inner.by_name.get(name)?;
        inner.modules.get(id.0 as usize).cloned()
    }

    /// The atom `atom_name` issued by the module called `module_name`.
    pub fn resolve_atom(&self, module_name: &str, atom_name: &str) -> Option<AtomRef> {
        self.module_named(module_name)
            .map(|m| m.atom_named(atom_name))
    }

    pub fn len(&self) -> usize {
        self.inner.read().modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atom_named_is_stable() {
        let registry = ModuleRegistry::new();
        let m = registry.add_module("Base", &[]).unwrap();
        let a = m.atom_named("x");
        assert_eq!(a, m.atom_named("x"));
        assert_eq!(m.lookup_atom("x"), Some(a.clone()));
        assert_eq!(a.issuing_module(), Some(m.id()));
    }

    #[test]
    fn test_visibility_follows_imports() {
        let registry = ModuleRegistry::new();
        let base = registry.add_module("Base", &[]).unwrap();
        let mid = registry.add_module("Mid", &["Base"]).unwrap();
        let top = registry.add_module("Top", &["Mid"]).unwrap();
        let other = registry.add_module("Other", &[]).unwrap();

        let base_atom = base.atom_named("b");
        assert!(top.can_see(&base_atom));
        assert!(mid.can_see(&base_atom));
        assert!(!other.can_see(&base_atom));
        assert!(!base.can_see(&top.atom_named("t")));
        assert!(!base.can_see(&AtomRef::new("loose", None)));
    }

    #[test]
    fn test_registry_errors() {
        let registry = ModuleRegistry::new();
        registry.add_module("A", &[]).unwrap();
        assert_eq!(
            registry.add_module("A", &[]).err(),
            Some(ModuleError::DuplicateName("A".into()))
        );
        assert!(matches!(
            registry.add_module("B", &["Missing"]),
            Err(ModuleError::UnknownImport { .. })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_atom() {
        let registry = ModuleRegistry::new();
        let m = registry.add_module("Base", &[]).unwrap();
        let a = m.atom_named("y");
        assert_eq!(registry.resolve_atom("Base", "y"), Some(a));
        assert_eq!(registry.resolve_atom("Nope", "y"), None);
    }
}

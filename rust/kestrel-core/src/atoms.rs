//! Atoms: identity tokens issued by modules.

use crate::module::ModuleId;
use crate::values::Value;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_ATOM_ID: AtomicU64 = AtomicU64::new(1);

/// An atom is equal only to itself. Two atoms with the same name issued by
/// the same module are never created; see [`crate::Module::atom_named`].
pub struct Atom {
    id: u64,
    name: Arc<str>,
    module: Option<ModuleId>,
    properties: RwLock<HashMap<Value, Value>>,
}

impl Atom {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    /// The module that issued this atom, if any. Special atoms have none.
    pub fn issuing_module(&self) -> Option<ModuleId> {
        self.module
    }

    pub fn property(&self, key: &Value) -> Option<Value> {
        self.properties.read().get(key).cloned()
    }

    pub fn set_property(&self, key: Value, value: Value) {
        self.properties.write().insert(key, value);
    }

    pub fn remove_property(&self, key: &Value) -> Option<Value> {
        self.properties.write().remove(key)
    }
}

/// Shared handle to an [`Atom`], compared and hashed by identity.
#[derive(Clone)]
pub struct AtomRef(Arc<Atom>);

impl AtomRef {
    pub fn new(name: impl Into<Arc<str>>, module: Option<ModuleId>) -> Self {
        AtomRef(Arc::new(Atom {
            id: NEXT_ATOM_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            module,
            properties: RwLock::new(HashMap::new()),
        }))
    }

    pub fn ptr_eq(&self, other: &AtomRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for AtomRef {
    type Target = Atom;

    fn deref(&self) -> &Atom {
        &self.0
    }
}

impl PartialEq for AtomRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for AtomRef {}

impl Hash for AtomRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for AtomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Atom({}#{})", self.0.name, self.0.id)
    }
}

impl fmt::Display for AtomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atoms_compare_by_identity() {
        let a = AtomRef::new("foo", None);
        let b = AtomRef::new("foo", None);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_properties() {
        let a = AtomRef::new("foo", None);
        let key = Value::string("color");
        assert!(a.property(&key).is_none());
        a.set_property(key.clone(), Value::string("red"));
        assert_eq!(a.property(&key), Some(Value::string("red")));
        assert_eq!(a.remove_property(&key), Some(Value::string("red")));
    }
}

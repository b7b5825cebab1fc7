//! Mutable, typed cells.

use crate::error::ErrorCode;
use crate::types::Type;
use crate::values::Value;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_VARIABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Notified after every successful write to a variable.
pub trait VariableObserver: Send + Sync {
    fn variable_changed(&self, variable: &VariableRef, new_value: Option<&Value>);
}

pub struct Variable {
    id: u64,
    content_type: Type,
    value: RwLock<Option<Value>>,
    observers: Mutex<Vec<Arc<dyn VariableObserver>>>,
}

impl Variable {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn content_type(&self) -> &Type {
        &self.content_type
    }

    pub fn is_assigned(&self) -> bool {
        self.value.read().is_some()
    }

    pub fn get(&self) -> Result<Value, ErrorCode> {
        self.value
            .read()
            .clone()
            .ok_or(ErrorCode::CannotReadUnassignedVariable)
    }

    /// The current value, or `None` when unassigned.
    pub fn peek(&self) -> Option<Value> {
        self.value.read().clone()
    }
}

/// Shared handle to a [`Variable`], compared and hashed by identity.
#[derive(Clone)]
pub struct VariableRef(Arc<Variable>);

impl VariableRef {
    pub fn new(content_type: Type) -> Self {
        VariableRef(Arc::new(Variable {
            id: NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed),
            content_type,
            value: RwLock::new(None),
            observers: Mutex::new(Vec::new()),
        }))
    }

    pub fn with_value(content_type: Type, value: Value) -> Result<Self, ErrorCode> {
        let var = VariableRef::new(content_type);
        var.set(value)?;
        Ok(var)
    }

    pub fn ptr_eq(&self, other: &VariableRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn add_observer(&self, observer: Arc<dyn VariableObserver>) {
        self.0.observers.lock().push(observer);
    }

    pub fn set(&self, value: Value) -> Result<(), ErrorCode> {
        if !self.0.content_type.contains(&value) {
            return Err(ErrorCode::CannotStoreIncorrectlyTypedValue);
        }
        *self.0.value.write() = Some(value.clone());
        self.notify(Some(&value));
        Ok(())
    }

    /// Store `new` only if the current value equals `expected`. Returns the
    /// previous value.
    pub fn compare_and_swap(&self, expected: &Value, new: Value) -> Result<Value, ErrorCode> {
        if !self.0.content_type.contains(&new) {
            return Err(ErrorCode::CannotStoreIncorrectlyTypedValue);
        }
        let previous = {
            let mut slot = self.0.value.write();
            let previous = slot.clone().ok_or(ErrorCode::CannotReadUnassignedVariable)?;
            if previous != *expected {
                return Err(ErrorCode::CannotSwapMismatchedValue);
            }
            *slot = Some(new.clone());
            previous
        };
        self.notify(Some(&new));
        Ok(previous)
    }

    pub fn clear(&self) {
        *self.0.value.write() = None;
        self.notify(None);
    }

    fn notify(&self, value: Option<&Value>) {
        let observers = self.0.observers.lock().clone();
        for observer in observers {
            observer.variable_changed(self, value);
        }
    }
}

impl Deref for VariableRef {
    type Target = Variable;

    fn deref(&self) -> &Variable {
        &self.0
    }
}

impl PartialEq for VariableRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for VariableRef {}

impl Hash for VariableRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

// Contents are not printed; a variable may hold itself.
impl fmt::Debug for VariableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "var#{}: {}", self.0.id, self.0.content_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_unassigned_read_fails() {
        let v = VariableRef::new(Type::integer());
        assert_eq!(v.get(), Err(ErrorCode::CannotReadUnassignedVariable));
        v.set(Value::from(4)).unwrap();
        assert_eq!(v.get(), Ok(Value::from(4)));
        v.clear();
        assert!(!v.is_assigned());
    }

    #[test]
    fn test_set_checks_content_type() {
        let v = VariableRef::new(Type::natural_number());
        assert_eq!(
            v.set(Value::from(0)),
            Err(ErrorCode::CannotStoreIncorrectlyTypedValue)
        );
    }

    #[test]
    fn test_compare_and_swap() {
        let v = VariableRef::with_value(Type::integer(), Value::from(1)).unwrap();
        assert_eq!(
            v.compare_and_swap(&Value::from(2), Value::from(3)),
            Err(ErrorCode::CannotSwapMismatchedValue)
        );
        assert_eq!(v.compare_and_swap(&Value::from(1), Value::from(3)), Ok(Value::from(1)));
        assert_eq!(v.get(), Ok(Value::from(3)));
    }

    struct Counter(AtomicUsize);

    impl VariableObserver for Counter {
        fn variable_changed(&self, _: &VariableRef, _: Option<&Value>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_observers_see_writes() {
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let v = VariableRef::new(Type::Top);
        v.add_observer(counter.clone());
        v.set(Value::Nil).unwrap();
        v.clear();
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_self_referential_debug_terminates() {
        let v = VariableRef::new(Type::Top);
        v.set(Value::tuple(vec![Value::Variable(v.clone())])).unwrap();
        let text = format!("{:?}", Value::Variable(v.clone()));
        assert!(text.starts_with("var#"));
        v.clear();
    }
}

//! Tagged value representation.
//!
//! Values are immutable by convention. Compound values share structure
//! through `Arc`; the only mutable cells are [`Variable`](crate::Variable)s,
//! which are compared by identity so equality and hashing never chase a
//! cycle.

use crate::atoms::AtomRef;
use crate::code::CompiledCode;
use crate::function::{Continuation, Function};
use crate::types::{MapType, SetType, SizeRange, TupleType, Type};
use crate::variable::VariableRef;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Runtime values.
#[derive(Clone)]
pub enum Value {
    Nil,
    Int(BigInt),
    Float(f64),
    String(Arc<str>),
    Atom(AtomRef),
    Tuple(Arc<Vec<Value>>),
    Set(Arc<SetValue>),
    Map(Arc<MapValue>),
    Function(Arc<Function>),
    Code(Arc<CompiledCode>),
    Variable(VariableRef),
    Continuation(Arc<Continuation>),
    Type(Arc<Type>),
}

/// A persistent set; equality and hashing ignore iteration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetValue(HashSet<Value>);

/// A persistent map; equality and hashing ignore iteration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapValue(HashMap<Value, Value>);

fn hash_one<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

impl SetValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, value: &Value) -> bool {
        self.0.contains(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.0.iter()
    }

    /// A new set with `value` added; `self` is left untouched.
    pub fn with(&self, value: Value) -> SetValue {
        let mut copy = self.0.clone();
        copy.insert(value);
        SetValue(copy)
    }

    pub fn union(&self, other: &SetValue) -> SetValue {
        SetValue(self.0.union(&other.0).cloned().collect())
    }
}

impl FromIterator<Value> for SetValue {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        SetValue(iter.into_iter().collect())
    }
}

impl Hash for SetValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let combined = self.0.iter().fold(0u64, |acc, v| acc ^ hash_one(v));
        self.0.len().hash(state);
        combined.hash(state);
    }
}

impl MapValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.0.iter()
    }

    pub fn with(&self, key: Value, value: Value) -> MapValue {
        let mut copy = self.0.clone();
        copy.insert(key, value);
        MapValue(copy)
    }
}

impl FromIterator<(Value, Value)> for MapValue {
    fn from_iter<I: IntoIterator<Item = (Value, Value)>>(iter: I) -> Self {
        MapValue(iter.into_iter().collect())
    }
}

impl Hash for MapValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let combined = self
            .0
            .iter()
            .fold(0u64, |acc, entry| acc ^ hash_one(&entry));
        self.0.len().hash(state);
        combined.hash(state);
    }
}

impl Value {
    pub fn string(s: impl AsRef<str>) -> Value {
        Value::String(Arc::from(s.as_ref()))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(Arc::new(items))
    }

    pub fn set(items: impl IntoIterator<Item = Value>) -> Value {
        Value::Set(Arc::new(items.into_iter().collect()))
    }

    pub fn map(entries: impl IntoIterator<Item = (Value, Value)>) -> Value {
        Value::Map(Arc::new(entries.into_iter().collect()))
    }

    pub fn of_type(ty: Type) -> Value {
        Value::Type(Arc::new(ty))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_int(&self) -> Option<&BigInt> {
        match self {
            Value::Int(n) => Some(n),
            _ => None,
        }
    }

    /// The integer as an `i64`, if it is one and fits.
    pub fn as_i64(&self) -> Option<i64> {
        self.as_int().and_then(|n| n.to_i64())
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_atom(&self) -> Option<&AtomRef> {
        match self {
            Value::Atom(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_type(&self) -> Option<&Type> {
        match self {
            Value::Type(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Arc<Function>> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_variable(&self) -> Option<&VariableRef> {
        match self {
            Value::Variable(v) => Some(v),
            _ => None,
        }
    }

    /// The most specific type containing exactly this value.
    pub fn instance_type(&self) -> Type {
        match self {
            Value::Int(n) => Type::int_range(Some(n.clone()), Some(n.clone())),
            _ => Type::enumeration([self.clone()]),
        }
    }

    /// The most specific type of this value that is not an enumeration.
    pub fn kind(&self) -> Type {
        match self {
            Value::Nil => Type::Top,
            Value::Int(n) => Type::int_range(Some(n.clone()), Some(n.clone())),
            Value::Float(_) => Type::Float,
            Value::String(_) => Type::String,
            Value::Atom(_) => Type::Atom,
            Value::Tuple(items) => TupleType::new(
                SizeRange::exactly(items.len() as u64),
                items.iter().map(Value::kind).collect(),
                Type::Bottom,
            ),
            Value::Set(set) => SetType::new(
                SizeRange::exactly(set.len() as u64),
                set.iter().fold(Type::Bottom, |acc, v| acc.union(&v.kind())),
            ),
            Value::Map(map) => {
                let (keys, values) = map.iter().fold(
                    (Type::Bottom, Type::Bottom),
                    |(k, v), (key, value)| (k.union(&key.kind()), v.union(&value.kind())),
                );
                MapType::new(SizeRange::exactly(map.len() as u64), keys, values)
            }
            Value::Function(f) => Type::Function(f.code().function_type_arc()),
            Value::Code(c) => Type::Code(c.function_type_arc()),
            Value::Variable(v) => Type::variable(v.content_type().clone()),
            Value::Continuation(c) => Type::Continuation(c.function().code().function_type_arc()),
            Value::Type(t) => Type::meta((**t).clone()),
        }
    }

    fn discriminant(&self) -> u8 {
        match self {
            Value::Nil => 0,
            Value::Int(_) => 1,
            Value::Float(_) => 2,
            Value::String(_) => 3,
            Value::Atom(_) => 4,
            Value::Tuple(_) => 5,
            Value::Set(_) => 6,
            Value::Map(_) => 7,
            Value::Function(_) => 8,
            Value::Code(_) => 9,
            Value::Variable(_) => 10,
            Value::Continuation(_) => 11,
            Value::Type(_) => 12,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(BigInt::from(n))
    }
}

impl From<BigInt> for Value {
    fn from(n: BigInt) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<Type> for Value {
    fn from(t: Type) -> Self {
        Value::of_type(t)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Atom(a), Value::Atom(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::Set(a), Value::Set(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::Map(a), Value::Map(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::Code(a), Value::Code(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::Variable(a), Value::Variable(b)) => a == b,
            (Value::Continuation(a), Value::Continuation(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::Type(a), Value::Type(b)) => Arc::ptr_eq(a, b) || a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.discriminant().hash(state);
        match self {
            Value::Nil => {}
            Value::Int(n) => n.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Atom(a) => a.hash(state),
            Value::Tuple(items) => items.hash(state),
            Value::Set(set) => set.hash(state),
            Value::Map(map) => map.hash(state),
            Value::Function(f) => f.hash(state),
            Value::Code(c) => c.hash(state),
            Value::Variable(v) => v.hash(state),
            Value::Continuation(c) => c.hash(state),
            Value::Type(t) => t.hash(state),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{:?}", x),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Atom(a) => write!(f, "{}", a),
            Value::Tuple(items) => {
                write!(f, "<")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ">")
            }
            Value::Set(set) => {
                let mut items: Vec<String> = set.iter().map(|v| v.to_string()).collect();
                items.sort();
                write!(f, "{{{}}}", items.join(", "))
            }
            Value::Map(map) => {
                let mut entries: Vec<String> =
                    map.iter().map(|(k, v)| format!("{} → {}", k, v)).collect();
                entries.sort();
                write!(f, "{{{}}}", entries.join(", "))
            }
            Value::Function(func) => write!(f, "function {}", func.code().name()),
            Value::Code(code) => write!(f, "code {}", code.name()),
            Value::Variable(v) => write!(f, "{:?}", v),
            Value::Continuation(c) => {
                write!(f, "continuation of {} @{}", c.function().code().name(), c.pc())
            }
            Value::Type(t) => write!(f, "{}", t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sets_ignore_order() {
        let a = Value::set([Value::from(1), Value::from(2), Value::from(3)]);
        let b = Value::set([Value::from(3), Value::from(1), Value::from(2)]);
        assert_eq!(a, b);
        assert_eq!(hash_one(&a), hash_one(&b));
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
    }

    #[test]
    fn test_kind_of_tuple() {
        let t = Value::tuple(vec![Value::from(1), Value::string("x")]);
        let kind = t.kind();
        assert!(kind.contains(&t));
        assert!(kind.is_subtype_of(&Type::most_general_tuple()));
    }

    #[test]
    fn test_instance_type_is_singleton() {
        let v = Value::string("hello");
        let ty = v.instance_type();
        assert!(ty.contains(&v));
        assert!(!ty.contains(&Value::string("bye")));
    }

    #[test]
    fn test_display() {
        let v = Value::tuple(vec![Value::from(1), Value::string("a"), Value::Nil]);
        assert_eq!(v.to_string(), "<1, \"a\", nil>");
    }
}

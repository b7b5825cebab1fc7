//! Static knowledge about registers at one program point.

use crate::register::{L2Register, RegisterKind};
use kestrel_core::{Type, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterInfo {
    pub ty: Type,
    pub constant: Option<Value>,
}

impl RegisterInfo {
    pub fn of_type(ty: Type) -> Self {
        RegisterInfo { ty, constant: None }
    }

    pub fn of_constant(value: Value) -> Self {
        RegisterInfo {
            ty: value.instance_type(),
            constant: Some(value),
        }
    }
}

/// Types and known constants of the registers written on the paths reaching
/// a program point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterSet {
    registers: BTreeMap<L2Register, RegisterInfo>,
}

impl RegisterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, register: L2Register) -> Option<&RegisterInfo> {
        self.registers.get(&register)
    }

    /// The register's static type; unknown registers are as wide as their
    /// kind allows.
    pub fn type_of(&self, register: L2Register) -> Type {
        match self.registers.get(&register) {
            Some(info) => info.ty.clone(),
            None => match register.kind {
                RegisterKind::Boxed => Type::Top,
                RegisterKind::Int => Type::int64(),
                RegisterKind::Float => Type::Float,
            },
        }
    }

    pub fn constant_of(&self, register: L2Register) -> Option<&Value> {
        self.registers
            .get(&register)
            .and_then(|info| info.constant.as_ref())
    }

    pub fn set_type(&mut self, register: L2Register, ty: Type) {
        let constant = match &ty {
            Type::Integers(range) => range.single().cloned().map(Value::from),
            Type::Enumeration(set) if set.len() == 1 => set.iter().next().cloned(),
            _ => None,
        };
        self.registers.insert(register, RegisterInfo { ty, constant });
    }

    pub fn set_constant(&mut self, register: L2Register, value: Value) {
        self.registers
            .insert(register, RegisterInfo::of_constant(value));
    }

    /// Narrow a register already present to its intersection with `ty`.
    pub fn strengthen(&mut self, register: L2Register, ty: &Type) {
        let narrowed = self.type_of(register).intersection(ty);
        match self.constant_of(register).cloned() {
            Some(value) if narrowed.contains(&value) => self.set_constant(register, value),
            _ => self.set_type(register, narrowed),
        }
    }

    /// Combine the facts of two paths meeting at a join. A register written
    /// on only one side keeps that side's facts: only a phi reads it past the
    /// join, and only when it was written.
    pub fn merge(&self, other: &RegisterSet) -> RegisterSet {
        let mut merged = other.clone();
        for (register, mine) in &self.registers {
            let info = match other.registers.get(register) {
                Some(theirs) => RegisterInfo {
                    ty: mine.ty.union(&theirs.ty),
                    constant: match (&mine.constant, &theirs.constant) {
                        (Some(a), Some(b)) if a == b => Some(a.clone()),
                        _ => None,
                    },
                },
                None => mine.clone(),
            };
            merged.registers.insert(*register, info);
        }
        merged
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_unions_types_and_keeps_equal_constants() {
        let r = L2Register::boxed(0);
        let s = L2Register::boxed(1);
        let mut a = RegisterSet::new();
        let mut b = RegisterSet::new();
        a.set_constant(r, Value::from(1));
        b.set_constant(r, Value::from(3));
        a.set_constant(s, Value::from(7));
        b.set_constant(s, Value::from(7));
        let m = a.merge(&b);
        assert_eq!(m.type_of(r), Type::int_range_i64(1, 3));
        assert_eq!(m.constant_of(r), None);
        assert_eq!(m.constant_of(s), Some(&Value::from(7)));

        let mut c = RegisterSet::new();
        c.set_constant(L2Register::boxed(2), Value::Nil);
        assert_eq!(a.merge(&c).len(), 3);
    }

    #[test]
    fn test_singleton_type_implies_constant() {
        let mut set = RegisterSet::new();
        set.set_type(L2Register::int(0), Type::int_range_i64(4, 4));
        assert_eq!(set.constant_of(L2Register::int(0)), Some(&Value::from(4)));
    }

    #[test]
    fn test_strengthen_narrows() {
        let r = L2Register::boxed(0);
        let mut set = RegisterSet::new();
        set.set_type(r, Type::integer());
        set.strengthen(r, &Type::int_range_i64(0, 9));
        assert_eq!(set.type_of(r), Type::int_range_i64(0, 9));
    }
}

//! Level-two registers and the per-frame register file.
//!
//! Registers are numbered separately per kind. Within one chunk every
//! register is written at most once on any execution path; the first
//! `num_args` boxed registers hold the arguments on entry.

use kestrel_core::Value;
use std::fmt;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[strum(serialize_all = "lowercase")]
pub enum RegisterKind {
    Boxed,
    Int,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct L2Register {
    pub kind: RegisterKind,
    pub index: u32,
}

impl L2Register {
    pub fn boxed(index: u32) -> Self {
        L2Register {
            kind: RegisterKind::Boxed,
            index,
        }
    }

    pub fn int(index: u32) -> Self {
        L2Register {
            kind: RegisterKind::Int,
            index,
        }
    }

    pub fn float(index: u32) -> Self {
        L2Register {
            kind: RegisterKind::Float,
            index,
        }
    }
}

impl fmt::Display for L2Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            RegisterKind::Boxed => "r",
            RegisterKind::Int => "i",
            RegisterKind::Float => "f",
        };
        write!(f, "{}{}", prefix, self.index)
    }
}

/// Number of registers of each kind a chunk uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegisterCounts {
    pub boxed: u32,
    pub ints: u32,
    pub floats: u32,
}

impl RegisterCounts {
    pub fn note(&mut self, register: L2Register) {
        let slot = match register.kind {
            RegisterKind::Boxed => &mut self.boxed,
            RegisterKind::Int => &mut self.ints,
            RegisterKind::Float => &mut self.floats,
        };
        *slot = (*slot).max(register.index + 1);
    }
}

/// Issues fresh registers during translation.
#[derive(Debug, Default)]
pub struct RegisterAllocator {
    counts: RegisterCounts,
}

impl RegisterAllocator {
    /// An allocator whose first boxed registers are the arguments.
    pub fn with_arguments(num_args: usize) -> Self {
        RegisterAllocator {
            counts: RegisterCounts {
                boxed: num_args as u32,
                ..RegisterCounts::default()
            },
        }
    }

    pub fn next(&mut self, kind: RegisterKind) -> L2Register {
        let slot = match kind {
            RegisterKind::Boxed => &mut self.counts.boxed,
            RegisterKind::Int => &mut self.counts.ints,
            RegisterKind::Float => &mut self.counts.floats,
        };
        let register = L2Register { kind, index: *slot };
        *slot += 1;
        register
    }

    pub fn counts(&self) -> RegisterCounts {
        self.counts
    }
}

/// Live register contents for one level-two frame.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    boxed: Vec<Option<Value>>,
    ints: Vec<Option<i64>>,
    floats: Vec<Option<f64>>,
}

impl RegisterFile {
    pub fn new(counts: RegisterCounts, args: Vec<Value>) -> Self {
        let mut boxed: Vec<Option<Value>> = args.into_iter().map(Some).collect();
        let wanted = (counts.boxed as usize).max(boxed.len());
        boxed.resize(wanted, None);
        RegisterFile {
            boxed,
            ints: vec![None; counts.ints as usize],
            floats: vec![None; counts.floats as usize],
        }
    }

    /// The first `n` boxed registers, which held the arguments on entry.
    pub fn arguments(&self, n: usize) -> Vec<Value> {
        self.boxed
            .iter()
            .take(n)
            .map(|v| v.clone().unwrap_or(Value::Nil))
            .collect()
    }

    pub fn boxed_values(&self) -> Vec<Value> {
        self.boxed
            .iter()
            .map(|v| v.clone().unwrap_or(Value::Nil))
            .collect()
    }

    pub fn boxed(&self, register: L2Register) -> &Value {
        assert_eq!(register.kind, RegisterKind::Boxed);
        match self.boxed.get(register.index as usize) {
            Some(Some(value)) => value,
            _ => panic!("read of unwritten register {}", register),
        }
    }

    pub fn boxed_if_written(&self, register: L2Register) -> Option<&Value> {
        assert_eq!(register.kind, RegisterKind::Boxed);
        self.boxed.get(register.index as usize).and_then(Option::as_ref)
    }

    pub fn int(&self, register: L2Register) -> i64 {
        assert_eq!(register.kind, RegisterKind::Int);
        match self.ints.get(register.index as usize) {
            Some(Some(value)) => *value,
            _ => panic!("read of unwritten register {}", register),
        }
    }

    pub fn float(&self, register: L2Register) -> f64 {
        assert_eq!(register.kind, RegisterKind::Float);
        match self.floats.get(register.index as usize) {
            Some(Some(value)) => *value,
            _ => panic!("read of unwritten register {}", register),
        }
    }

    pub fn set_boxed(&mut self, register: L2Register, value: Value) {
        assert_eq!(register.kind, RegisterKind::Boxed);
        let slot = &mut self.boxed[register.index as usize];
        assert!(slot.is_none(), "second write to register {}", register);
        *slot = Some(value);
    }

    pub fn set_int(&mut self, register: L2Register, value: i64) {
        assert_eq!(register.kind, RegisterKind::Int);
        let slot = &mut self.ints[register.index as usize];
        assert!(slot.is_none(), "second write to register {}", register);
        *slot = Some(value);
    }

    pub fn set_float(&mut self, register: L2Register, value: f64) {
        assert_eq!(register.kind, RegisterKind::Float);
        let slot = &mut self.floats[register.index as usize];
        assert!(slot.is_none(), "second write to register {}", register);
        *slot = Some(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_starts_after_arguments() {
        let mut alloc = RegisterAllocator::with_arguments(2);
        assert_eq!(alloc.next(RegisterKind::Boxed), L2Register::boxed(2));
        assert_eq!(alloc.next(RegisterKind::Int), L2Register::int(0));
        assert_eq!(alloc.counts().boxed, 3);
    }

    #[test]
    #[should_panic(expected = "second write")]
    fn test_double_write_is_a_defect() {
        let mut file = RegisterFile::new(
            RegisterCounts {
                boxed: 1,
                ints: 0,
                floats: 0,
            },
            vec![],
        );
        file.set_boxed(L2Register::boxed(0), Value::Nil);
        file.set_boxed(L2Register::boxed(0), Value::Nil);
    }

    #[test]
    fn test_arguments_fill_first_registers() {
        let file = RegisterFile::new(RegisterCounts::default(), vec![Value::from(1)]);
        assert_eq!(file.boxed(L2Register::boxed(0)), &Value::from(1));
        assert_eq!(file.arguments(1), vec![Value::from(1)]);
    }
}

//! Level-two operands.
//!
//! An operand is an immutable descriptor attached to one instruction. Reads
//! and writes of a register are distinct types so a writer can never be
//! mistaken for a reader when an instruction is built or rewritten.

use crate::register::{L2Register, RegisterKind};
use kestrel_core::Value;
use kestrel_dispatch::{InlineCache, Method};
use std::fmt;
use std::sync::Arc;
use strum::{Display, IntoStaticStr};

/// What an operand position of an operation accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "kebab-case")]
pub enum OperandKind {
    Constant,
    Immediate,
    Pc,
    Primitive,
    Comment,
    ReadBoxed,
    ReadInt,
    ReadFloat,
    WriteBoxed,
    WriteInt,
    WriteFloat,
    ReadBoxedVector,
    Selector,
}

impl OperandKind {
    fn read_of(kind: RegisterKind) -> Self {
        match kind {
            RegisterKind::Boxed => OperandKind::ReadBoxed,
            RegisterKind::Int => OperandKind::ReadInt,
            RegisterKind::Float => OperandKind::ReadFloat,
        }
    }

    fn write_of(kind: RegisterKind) -> Self {
        match kind {
            RegisterKind::Boxed => OperandKind::WriteBoxed,
            RegisterKind::Int => OperandKind::WriteInt,
            RegisterKind::Float => OperandKind::WriteFloat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadRegister(pub L2Register);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteRegister(pub L2Register);

/// A call-site selector: the method being sent plus the site's cache.
///
/// The method is also the dependency edge recorded by the owning chunk.
#[derive(Clone)]
pub struct Selector {
    pub method: Arc<Method>,
    pub cache: Arc<InlineCache>,
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({})", self.method.name())
    }
}

#[derive(Debug, Clone)]
pub enum L2Operand {
    Constant(Value),
    Immediate(i64),
    /// Index of an instruction in the same chunk.
    Pc(usize),
    Primitive(u16),
    Comment(Arc<str>),
    Read(ReadRegister),
    Write(WriteRegister),
    /// Boxed reads whose length is fixed when the instruction is built.
    ReadBoxedVector(Arc<[L2Register]>),
    Selector(Selector),
}

impl L2Operand {
    pub fn read(register: L2Register) -> Self {
        L2Operand::Read(ReadRegister(register))
    }

    pub fn write(register: L2Register) -> Self {
        L2Operand::Write(WriteRegister(register))
    }

    pub fn vector(registers: impl IntoIterator<Item = L2Register>) -> Self {
        let registers: Vec<L2Register> = registers.into_iter().collect();
        assert!(
            registers.iter().all(|r| r.kind == RegisterKind::Boxed),
            "register vectors hold boxed registers only"
        );
        L2Operand::ReadBoxedVector(registers.into())
    }

    pub fn selector(method: Arc<Method>, cache: Arc<InlineCache>) -> Self {
        L2Operand::Selector(Selector { method, cache })
    }

    pub fn kind(&self) -> OperandKind {
        match self {
            L2Operand::Constant(_) => OperandKind::Constant,
            L2Operand::Immediate(_) => OperandKind::Immediate,
            L2Operand::Pc(_) => OperandKind::Pc,
            L2Operand::Primitive(_) => OperandKind::Primitive,
            L2Operand::Comment(_) => OperandKind::Comment,
            L2Operand::Read(ReadRegister(r)) => OperandKind::read_of(r.kind),
            L2Operand::Write(WriteRegister(r)) => OperandKind::write_of(r.kind),
            L2Operand::ReadBoxedVector(_) => OperandKind::ReadBoxedVector,
            L2Operand::Selector(_) => OperandKind::Selector,
        }
    }

    /// Registers this operand reads.
    pub fn source_registers(&self) -> Vec<L2Register> {
        match self {
            L2Operand::Read(ReadRegister(r)) => vec![*r],
            L2Operand::ReadBoxedVector(regs) => regs.to_vec(),
            _ => Vec::new(),
        }
    }

    pub fn destination_register(&self) -> Option<L2Register> {
        match self {
            L2Operand::Write(WriteRegister(r)) => Some(*r),
            _ => None,
        }
    }
}

impl fmt::Display for L2Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            L2Operand::Constant(v) => write!(f, "#{}", v),
            L2Operand::Immediate(n) => write!(f, "${}", n),
            L2Operand::Pc(pc) => write!(f, "@{}", pc),
            L2Operand::Primitive(n) => write!(f, "prim{}", n),
            L2Operand::Comment(text) => write!(f, "\"{}\"", text),
            L2Operand::Read(ReadRegister(r)) => write!(f, "{}", r),
            L2Operand::Write(WriteRegister(r)) => write!(f, "->{}", r),
            L2Operand::ReadBoxedVector(regs) => {
                write!(f, "<")?;
                for (i, r) in regs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", r)?;
                }
                write!(f, ">")
            }
            L2Operand::Selector(s) => write!(f, "`{}`", s.method.name()),
        }
    }
}

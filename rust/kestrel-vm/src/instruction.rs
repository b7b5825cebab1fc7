//! Level-two instructions: an operation plus operands matching its
//! signature.

use crate::operand::{L2Operand, ReadRegister, Selector, WriteRegister};
use crate::operation::L2Operation;
use crate::register::L2Register;
use kestrel_core::Value;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct L2Instruction {
    operation: L2Operation,
    operands: Vec<L2Operand>,
}

impl L2Instruction {
    /// Panics if the operands do not match the operation's signature; that
    /// is a translator defect, never a user error.
    pub fn new(operation: L2Operation, operands: Vec<L2Operand>) -> Self {
        let signature = operation.signature();
        assert_eq!(
            signature.len(),
            operands.len(),
            "{} takes {} operands",
            operation,
            signature.len()
        );
        for (i, (expected, operand)) in signature.iter().zip(&operands).enumerate() {
            assert_eq!(
                *expected,
                operand.kind(),
                "{} operand {} must be {}",
                operation,
                i,
                expected
            );
        }
        L2Instruction {
            operation,
            operands,
        }
    }

    pub fn operation(&self) -> L2Operation {
        self.operation
    }

    pub fn operands(&self) -> &[L2Operand] {
        &self.operands
    }

    pub fn read_register(&self, index: usize) -> L2Register {
        match &self.operands[index] {
            L2Operand::Read(ReadRegister(r)) => *r,
            other => panic!("{} operand {} is not a read: {}", self.operation, index, other),
        }
    }

    pub fn write_register(&self, index: usize) -> L2Register {
        match &self.operands[index] {
            L2Operand::Write(WriteRegister(r)) => *r,
            other => panic!("{} operand {} is not a write: {}", self.operation, index, other),
        }
    }

    pub fn constant(&self, index: usize) -> &Value {
        match &self.operands[index] {
            L2Operand::Constant(v) => v,
            other => panic!("{} operand {} is not a constant: {}", self.operation, index, other),
        }
    }

    pub fn immediate(&self, index: usize) -> i64 {
        match &self.operands[index] {
            L2Operand::Immediate(n) => *n,
            other => panic!("{} operand {} is not an immediate: {}", self.operation, index, other),
        }
    }

    pub fn pc(&self, index: usize) -> usize {
        match &self.operands[index] {
            L2Operand::Pc(pc) => *pc,
            other => panic!("{} operand {} is not a pc: {}", self.operation, index, other),
        }
    }

    pub fn primitive(&self, index: usize) -> u16 {
        match &self.operands[index] {
            L2Operand::Primitive(n) => *n,
            other => panic!("{} operand {} is not a primitive: {}", self.operation, index, other),
        }
    }

    pub fn vector(&self, index: usize) -> &Arc<[L2Register]> {
        match &self.operands[index] {
            L2Operand::ReadBoxedVector(regs) => regs,
            other => panic!("{} operand {} is not a vector: {}", self.operation, index, other),
        }
    }

    pub fn selector(&self, index: usize) -> &Selector {
        match &self.operands[index] {
            L2Operand::Selector(s) => s,
            other => panic!("{} operand {} is not a selector: {}", self.operation, index, other),
        }
    }

    /// Every register this instruction reads.
    pub fn sources(&self) -> Vec<L2Register> {
        self.operands
            .iter()
            .flat_map(L2Operand::source_registers)
            .collect()
    }

    /// Every register this instruction writes.
    pub fn destinations(&self) -> Vec<L2Register> {
        self.operands
            .iter()
            .filter_map(L2Operand::destination_register)
            .collect()
    }

    /// Program counters this instruction may branch to, in operand order.
    pub fn targets(&self) -> Vec<usize> {
        self.operands
            .iter()
            .filter_map(|op| match op {
                L2Operand::Pc(pc) => Some(*pc),
                _ => None,
            })
            .collect()
    }

    /// All control-flow successors of the instruction at `pc`, in the order
    /// type propagation reports them: fall-through first, then each target.
    pub fn successors(&self, pc: usize) -> Vec<usize> {
        let mut successors = Vec::new();
        if !self.operation.is_terminal() {
            successors.push(pc + 1);
        }
        successors.extend(self.targets());
        successors
    }

    /// The same instruction with every pc operand passed through `remap`.
    pub fn with_remapped_targets(&self, remap: impl Fn(usize) -> usize) -> Self {
        let operands = self
            .operands
            .iter()
            .map(|op| match op {
                L2Operand::Pc(pc) => L2Operand::Pc(remap(*pc)),
                other => other.clone(),
            })
            .collect();
        L2Instruction {
            operation: self.operation,
            operands,
        }
    }
}

impl fmt::Display for L2Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.operation)?;
        for (i, operand) in self.operands.iter().enumerate() {
            if i == 0 {
                write!(f, " {}", operand)?;
            } else {
                write!(f, ", {}", operand)?;
            }
        }
        Ok(())
    }
}

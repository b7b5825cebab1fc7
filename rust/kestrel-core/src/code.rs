//! Compiled code and the level-one instruction set.
//!
//! Level one is a small stack machine produced by the (external) compiler.
//! A [`CompiledCode`] bundles the instruction list with its literal pool and
//! declared function type; it is the unit the level-two translator
//! specialises and the serializer persists.

use crate::types::{FunctionType, Type};
use crate::values::Value;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

static NEXT_CODE_ID: AtomicU64 = AtomicU64::new(1);

/// Level-one instructions. Operands index the literal pool, the frame's
/// argument-then-local slots, or the function's captured outers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L1Instruction {
    PushLiteral(u32),
    PushLocal(u32),
    PushOuter(u32),
    /// Pop the top of stack into a local slot.
    SetLocal(u32),
    /// Pop `n` values and push them as a tuple.
    MakeTuple(u32),
    Pop,
    /// Pop `arity` arguments and send them to the method named by the atom
    /// literal `message`; the answer must satisfy the type literal
    /// `expected`.
    Call { message: u32, arity: u32, expected: u32 },
    Return,
}

impl L1Instruction {
    fn opcode(&self) -> u8 {
        match self {
            L1Instruction::PushLiteral(_) => 0,
            L1Instruction::PushLocal(_) => 1,
            L1Instruction::PushOuter(_) => 2,
            L1Instruction::SetLocal(_) => 3,
            L1Instruction::MakeTuple(_) => 4,
            L1Instruction::Pop => 5,
            L1Instruction::Call { .. } => 6,
            L1Instruction::Return => 7,
        }
    }

    /// Values popped, then pushed.
    pub fn stack_effect(&self) -> (usize, usize) {
        match *self {
            L1Instruction::PushLiteral(_)
            | L1Instruction::PushLocal(_)
            | L1Instruction::PushOuter(_) => (0, 1),
            L1Instruction::SetLocal(_) | L1Instruction::Pop => (1, 0),
            L1Instruction::MakeTuple(n) => (n as usize, 1),
            L1Instruction::Call { arity, .. } => (arity as usize, 1),
            L1Instruction::Return => (1, 0),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodeError {
    #[error("unknown level-one opcode {0}")]
    UnknownOpcode(u8),
    #[error("level-one stream truncated at byte {0}")]
    Truncated(usize),
    #[error("literal index {index} out of range at pc {pc}")]
    LiteralOutOfRange { pc: usize, index: u32 },
    #[error("local index {index} out of range at pc {pc}")]
    LocalOutOfRange { pc: usize, index: u32 },
    #[error("outer index {index} out of range at pc {pc}")]
    OuterOutOfRange { pc: usize, index: u32 },
    #[error("literal {index} used at pc {pc} is not {expected}")]
    WrongLiteralKind {
        pc: usize,
        index: u32,
        expected: &'static str,
    },
    #[error("operand stack underflow at pc {0}")]
    StackUnderflow(usize),
    #[error("code does not end with a return")]
    MissingReturn,
}

pub struct CompiledCode {
    id: u64,
    name: Arc<str>,
    function_type: Arc<FunctionType>,
    num_locals: usize,
    num_outers: usize,
    primitive: Option<u16>,
    literals: Vec<Value>,
    instructions: Vec<L1Instruction>,
}

/// Incremental construction of a [`CompiledCode`].
pub struct CodeBuilder {
    name: Arc<str>,
    function_type: FunctionType,
    num_locals: usize,
    num_outers: usize,
    primitive: Option<u16>,
    literals: Vec<Value>,
    instructions: Vec<L1Instruction>,
}

impl CodeBuilder {
    pub fn locals(mut self, count: usize) -> Self {
        self.num_locals = count;
        self
    }

    pub fn outers(mut self, count: usize) -> Self {
        self.num_outers = count;
        self
    }

    pub fn primitive(mut self, number: u16) -> Self {
        self.primitive = Some(number);
        self
    }

    pub fn literal(mut self, value: Value) -> Self {
        self.literals.push(value);
        self
    }

    pub fn instruction(mut self, instruction: L1Instruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    pub fn instructions(mut self, instructions: impl IntoIterator<Item = L1Instruction>) -> Self {
        self.instructions.extend(instructions);
        self
    }

    pub fn build(self) -> Result<CompiledCode, CodeError> {
        CompiledCode::from_parts(
            self.name,
            Arc::new(self.function_type),
            self.num_locals,
            self.num_outers,
            self.primitive,
            self.literals,
            self.instructions,
        )
    }
}

impl CompiledCode {
    pub fn builder(name: impl Into<Arc<str>>, args: Vec<Type>, result: Type) -> CodeBuilder {
        CodeBuilder {
            name: name.into(),
            function_type: FunctionType::new(args, result),
            num_locals: 0,
            num_outers: 0,
            primitive: None,
            literals: Vec::new(),
            instructions: Vec::new(),
        }
    }

    /// Assemble and validate code from its persisted parts.
    pub fn from_parts(
        name: Arc<str>,
        function_type: Arc<FunctionType>,
        num_locals: usize,
        num_outers: usize,
        primitive: Option<u16>,
        literals: Vec<Value>,
        instructions: Vec<L1Instruction>,
    ) -> Result<CompiledCode, CodeError> {
        let code = CompiledCode {
            id: NEXT_CODE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            function_type,
            num_locals,
            num_outers,
            primitive,
            literals,
            instructions,
        };
        code.validate()?;
        Ok(code)
    }

    /// Process-unique identity, used to key invocation counters.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn name_arc(&self) -> &Arc<str> {
        &self.name
    }

    pub fn num_args(&self) -> usize {
        self.function_type.args.len()
    }

    pub fn num_locals(&self) -> usize {
        self.num_locals
    }

    pub fn num_outers(&self) -> usize {
        self.num_outers
    }

    /// Arguments followed by locals.
    pub fn num_slots(&self) -> usize {
        self.num_args() + self.num_locals
    }

    pub fn primitive(&self) -> Option<u16> {
        self.primitive
    }

    pub fn literal_at(&self, index: usize) -> Option<&Value> {
        self.literals.get(index)
    }

    pub fn literals(&self) -> &[Value] {
        &self.literals
    }

    pub fn instructions(&self) -> &[L1Instruction] {
        &self.instructions
    }

    pub fn function_type(&self) -> &FunctionType {
        &self.function_type
    }

    pub fn function_type_arc(&self) -> Arc<FunctionType> {
        self.function_type.clone()
    }

    pub fn encode_level_one(&self) -> Vec<u8> {
        encode_level_one(&self.instructions)
    }

    fn validate(&self) -> Result<(), CodeError> {
        // A primitive with no fallback body never runs level one.
        if self.instructions.is_empty() && self.primitive.is_some() {
            return Ok(());
        }
        let mut depth = 0usize;
        for (pc, instruction) in self.instructions.iter().enumerate() {
            match *instruction {
                L1Instruction::PushLiteral(index) => {
                    self.check_literal(pc, index)?;
                }
                L1Instruction::PushLocal(index) | L1Instruction::SetLocal(index) => {
                    if index as usize >= self.num_slots() {
                        return Err(CodeError::LocalOutOfRange { pc, index });
                    }
                }
                L1Instruction::PushOuter(index) => {
                    if index as usize >= self.num_outers {
                        return Err(CodeError::OuterOutOfRange { pc, index });
                    }
                }
                L1Instruction::Call {
                    message, expected, ..
                } => {
                    if !matches!(self.check_literal(pc, message)?, Value::Atom(_)) {
                        return Err(CodeError::WrongLiteralKind {
                            pc,
                            index: message,
                            expected: "an atom",
                        });
                    }
                    if !matches!(self.check_literal(pc, expected)?, Value::Type(_)) {
                        return Err(CodeError::WrongLiteralKind {
                            pc,
                            index: expected,
                            expected: "a type",
                        });
                    }
                }
                L1Instruction::MakeTuple(_) | L1Instruction::Pop | L1Instruction::Return => {}
            }
            let (pops, pushes) = instruction.stack_effect();
            depth = depth
                .checked_sub(pops)
                .ok_or(CodeError::StackUnderflow(pc))?
                + pushes;
        }
        match self.instructions.last() {
            Some(L1Instruction::Return) => Ok(()),
            _ => Err(CodeError::MissingReturn),
        }
    }

    fn check_literal(&self, pc: usize, index: u32) -> Result<&Value, CodeError> {
        self.literals
            .get(index as usize)
            .ok_or(CodeError::LiteralOutOfRange { pc, index })
    }
}

impl PartialEq for CompiledCode {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.function_type == other.function_type
            && self.num_locals == other.num_locals
            && self.num_outers == other.num_outers
            && self.primitive == other.primitive
            && self.literals == other.literals
            && self.instructions == other.instructions
    }
}

impl Eq for CompiledCode {}

impl Hash for CompiledCode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.num_args().hash(state);
        self.primitive.hash(state);
        self.instructions.len().hash(state);
    }
}

impl fmt::Debug for CompiledCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledCode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type", &self.function_type.to_string())
            .field("primitive", &self.primitive)
            .field("instructions", &self.instructions)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Compact byte form: opcode byte, then LEB128 operands.
// ---------------------------------------------------------------------------

fn write_varint(out: &mut Vec<u8>, mut n: u32) {
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u32, CodeError> {
    let mut result = 0u32;
    let mut shift = 0;
    loop {
        let byte = *bytes.get(*pos).ok_or(CodeError::Truncated(*pos))?;
        *pos += 1;
        if shift >= 32 {
            return Err(CodeError::Truncated(*pos));
        }
        result |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

pub fn encode_level_one(instructions: &[L1Instruction]) -> Vec<u8> {
    let mut out = Vec::with_capacity(instructions.len() * 2);
    for instruction in instructions {
        out.push(instruction.opcode());
        match *instruction {
            L1Instruction::PushLiteral(n)
            | L1Instruction::PushLocal(n)
            | L1Instruction::PushOuter(n)
            | L1Instruction::SetLocal(n)
            | L1Instruction::MakeTuple(n) => write_varint(&mut out, n),
            L1Instruction::Call {
                message,
                arity,
                expected,
            } => {
                write_varint(&mut out, message);
                write_varint(&mut out, arity);
                write_varint(&mut out, expected);
            }
            L1Instruction::Pop | L1Instruction::Return => {}
        }
    }
    out
}

pub fn decode_level_one(bytes: &[u8]) -> Result<Vec<L1Instruction>, CodeError> {
    let mut pos = 0;
    let mut instructions = Vec::new();
    while pos < bytes.len() {
        let opcode = bytes[pos];
        pos += 1;
        let instruction = match opcode {
            0 => L1Instruction::PushLiteral(read_varint(bytes, &mut pos)?),
            1 => L1Instruction::PushLocal(read_varint(bytes, &mut pos)?),
            2 => L1Instruction::PushOuter(read_varint(bytes, &mut pos)?),
            3 => L1Instruction::SetLocal(read_varint(bytes, &mut pos)?),
            4 => L1Instruction::MakeTuple(read_varint(bytes, &mut pos)?),
            5 => L1Instruction::Pop,
            6 => L1Instruction::Call {
                message: read_varint(bytes, &mut pos)?,
                arity: read_varint(bytes, &mut pos)?,
                expected: read_varint(bytes, &mut pos)?,
            },
            7 => L1Instruction::Return,
            other => return Err(CodeError::UnknownOpcode(other)),
        };
        instructions.push(instruction);
    }
    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::AtomRef;

    fn sample_with(plus: &AtomRef) -> CompiledCode {
        CompiledCode::builder("double", vec![Type::integer()], Type::integer())
            .literal(Value::Atom(plus.clone()))
            .literal(Value::of_type(Type::integer()))
            .instructions([
                L1Instruction::PushLocal(0),
                L1Instruction::PushLocal(0),
                L1Instruction::Call {
                    message: 0,
                    arity: 2,
                    expected: 1,
                },
                L1Instruction::Return,
            ])
            .build()
            .unwrap()
    }

    fn sample() -> CompiledCode {
        sample_with(&AtomRef::new("_+_", None))
    }

    #[test]
    fn test_accessors() {
        let code = sample();
        assert_eq!(code.num_args(), 1);
        assert!(matches!(code.literal_at(1), Some(Value::Type(_))));
        assert!(code.literal_at(2).is_none());
        assert_eq!(code.function_type().result, Type::integer());
    }

    #[test]
    fn test_level_one_bytes() {
        let code = sample();
        let bytes = code.encode_level_one();
        assert_eq!(bytes, vec![1, 0, 1, 0, 6, 0, 2, 1, 7]);
        assert_eq!(decode_level_one(&bytes).unwrap(), code.instructions());
        assert_eq!(decode_level_one(&[6, 0]), Err(CodeError::Truncated(2)));
        assert_eq!(decode_level_one(&[99]), Err(CodeError::UnknownOpcode(99)));
    }

    #[test]
    fn test_large_operand_uses_several_bytes() {
        let bytes = encode_level_one(&[L1Instruction::PushLiteral(300)]);
        assert_eq!(bytes, vec![0, 0xac, 0x02]);
    }

    #[test]
    fn test_validation_rejects_bad_code() {
        let underflow = CompiledCode::builder("bad", vec![], Type::Top)
            .instruction(L1Instruction::Pop)
            .instruction(L1Instruction::Return)
            .build();
        assert_eq!(underflow.err(), Some(CodeError::StackUnderflow(0)));

        let no_return = CompiledCode::builder("bad", vec![Type::Top], Type::Top)
            .instruction(L1Instruction::PushLocal(0))
            .build();
        assert_eq!(no_return.err(), Some(CodeError::MissingReturn));

        let wrong_literal = CompiledCode::builder("bad", vec![], Type::Top)
            .literal(Value::from(1))
            .literal(Value::from(2))
            .instruction(L1Instruction::Call {
                message: 0,
                arity: 0,
                expected: 1,
            })
            .instruction(L1Instruction::Return)
            .build();
        assert!(matches!(
            wrong_literal.err(),
            Some(CodeError::WrongLiteralKind { index: 0, .. })
        ));
    }

    #[test]
    fn test_equality_ignores_identity() {
        let plus = AtomRef::new("_+_", None);
        let a = sample_with(&plus);
        let b = sample_with(&plus);
        assert_ne!(a.id(), b.id());
        assert_eq!(a, b);
        assert_ne!(a, sample());
    }
}

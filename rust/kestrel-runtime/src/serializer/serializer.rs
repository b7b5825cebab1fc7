//! Linearizes value graphs into a replayable instruction stream.
//!
//! Tracing runs off an explicit work stack, never native recursion, so graph
//! depth is bounded only by memory. Shared compound values are recognized
//! by address, so neither lookups nor the special-object check hash a
//! subtree. Each distinct value gets exactly one
//! instruction, looked up or inserted in one step, and is written after
//! everything it refers to. Variables are written as empty shells; their
//! contents are assigned once every structural instruction of the value is
//! out, which is what lets a variable hold a value that refers back to it.
//! A variable's content is only traced once the work stack is empty, so
//! anything the content refers back to has already been written.

use super::error::SerializerError;
use super::operation::{CountingWriter, Operand, SerializerOperation};
use kestrel_core::{
    AtomRef, Module, ModuleRegistry, SpecialObjects, Type, Value, VariableRef,
};
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::sync::Arc;

type Op = SerializerOperation;

struct Instruction {
    operation: SerializerOperation,
    /// Cleared once written.
    operands: Vec<Operand<Value>>,
    /// Assigned when the instruction is actually written.
    index: Option<u32>,
}

enum Action {
    Trace(Value),
    Write(usize),
}

/// A traced value as the session remembers it.
///
/// Compound values behind an `Arc` are keyed by address, so a lookup never
/// walks a subtree. The key owns its value, which keeps the address from
/// being reused while the session lives. Everything else is keyed by value.
struct TraceKey(Value);

impl TraceKey {
    fn address(&self) -> Option<(u8, usize)> {
        fn addr<T>(arc: &Arc<T>) -> usize {
            Arc::as_ptr(arc) as *const () as usize
        }
        match &self.0 {
            Value::Tuple(a) => Some((0, addr(a))),
            Value::Set(a) => Some((1, addr(a))),
            Value::Map(a) => Some((2, addr(a))),
            Value::Function(a) => Some((3, addr(a))),
            Value::Code(a) => Some((4, addr(a))),
            Value::Continuation(a) => Some((5, addr(a))),
            _ => None,
        }
    }
}

impl PartialEq for TraceKey {
    fn eq(&self, other: &Self) -> bool {
        match (self.address(), other.address()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.0 == other.0,
            _ => false,
        }
    }
}

impl Eq for TraceKey {}

impl Hash for TraceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.address() {
            Some(address) => address.hash(state),
            None => self.0.hash(state),
        }
    }
}

/// A serialization session.
///
/// State accumulates across [`Serializer::serialize`] calls: values written
/// by an earlier call are referred back to, not written again. A session must
/// be driven by one thread at a time.
pub struct Serializer<'a, W: Write> {
    output: W,
    specials: &'a SpecialObjects,
    modules: &'a ModuleRegistry,
    scope: Option<Arc<Module>>,
    instructions: Vec<Instruction>,
    traced: HashMap<TraceKey, usize>,
    next_index: u32,
    stack: Vec<Action>,
    /// Variables whose content is traced once the stack drains, when every
    /// pending write has happened.
    deferred: VecDeque<VariableRef>,
    assignments: Vec<(VariableRef, Value)>,
    bytes_written: u64,
}

impl<'a, W: Write> Serializer<'a, W> {
    pub fn new(output: W, specials: &'a SpecialObjects, modules: &'a ModuleRegistry) -> Self {
        Serializer {
            output,
            specials,
            modules,
            scope: None,
            instructions: Vec::new(),
            traced: HashMap::new(),
            next_index: 0,
            stack: Vec::new(),
            deferred: VecDeque::new(),
            assignments: Vec::new(),
            bytes_written: 0,
        }
    }

    /// Only accept atoms issued by `module` or one of its ancestors.
    pub fn with_module(mut self, module: Arc<Module>) -> Self {
        self.scope = Some(module);
        self
    }

    /// Objects written so far in this session.
    pub fn objects_written(&self) -> u32 {
        self.next_index
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn get_ref(&self) -> &W {
        &self.output
    }

    pub fn into_inner(self) -> W {
        self.output
    }

    /// Append `value` to the stream, followed by a checkpoint.
    ///
    /// On failure nothing of this call reaches the output and the session is
    /// as it was before the call.
    pub fn serialize(&mut self, value: &Value) -> Result<(), SerializerError> {
        let mark = self.instructions.len();
        let first_index = self.next_index;
        let mut buffer = CountingWriter::new(Vec::new());
        let result = self.encode(value, &mut buffer).and_then(|()| {
            let length = buffer.written();
            self.output.write_all(&buffer.into_inner())?;
            Ok(length)
        });
        match result {
            Ok(length) => {
                self.bytes_written += length;
                tracing::debug!(
                    objects = self.next_index - first_index,
                    bytes = length,
                    "serialized value"
                );
                Ok(())
            }
            Err(e) => {
                self.roll_back(mark, first_index);
                Err(e)
            }
        }
    }

    /// Flush the underlying writer.
    pub fn flush(&mut self) -> Result<(), SerializerError> {
        Ok(self.output.flush()?)
    }

    fn encode(
        &mut self,
        root: &Value,
        out: &mut CountingWriter<Vec<u8>>,
    ) -> Result<(), SerializerError> {
        self.stack.push(Action::Trace(root.clone()));
        loop {
            while let Some(action) = self.stack.pop() {
                match action {
                    Action::Trace(value) => self.trace(value)?,
                    Action::Write(slot) => self.write(slot, out)?,
                }
            }
            let Some(variable) = self.deferred.pop_front() else {
                break;
            };
            if let Some(content) = variable.peek() {
                self.assignments.push((variable, content.clone()));
                self.stack.push(Action::Trace(content));
            }
        }
        for (variable, content) in std::mem::take(&mut self.assignments) {
            let operands = [
                Operand::Object(self.index_of(&Value::Variable(variable))),
                Operand::Object(self.index_of(&content)),
            ];
            write_instruction(out, Op::AssignVariable, &operands)?;
        }
        let root_index = self.index_of(root);
        write_instruction(out, Op::Checkpoint, &[Operand::Object(root_index)])?;
        Ok(())
    }

    /// Forget everything created since `mark`.
    fn roll_back(&mut self, mark: usize, first_index: u32) {
        self.stack.clear();
        self.deferred.clear();
        self.assignments.clear();
        self.instructions.truncate(mark);
        self.traced.retain(|_, slot| *slot < mark);
        self.next_index = first_index;
    }

    fn trace(&mut self, value: Value) -> Result<(), SerializerError> {
        // Already traced: either written, or its write is still queued.
        let key = TraceKey(value.clone());
        if self.traced.contains_key(&key) {
            return Ok(());
        }
        let (operation, operands) = self.decompose(&value)?;
        let slot = self.instructions.len();
        let children: Vec<Value> = operands
            .iter()
            .flat_map(|operand| operand.objects().iter().cloned())
            .collect();
        self.instructions.push(Instruction {
            operation,
            operands,
            index: None,
        });
        self.traced.insert(key, slot);
        if let Value::Variable(variable) = &value {
            self.deferred.push_back(variable.clone());
        }
        self.stack.push(Action::Write(slot));
        // Last pushed runs first; keep children in stream order.
        self.stack
            .extend(children.into_iter().rev().map(Action::Trace));
        Ok(())
    }

    fn write(&mut self, slot: usize, out: &mut CountingWriter<Vec<u8>>) -> Result<(), SerializerError> {
        let operands = std::mem::take(&mut self.instructions[slot].operands);
        let encoded: Vec<Operand<u32>> = operands
            .iter()
            .map(|operand| operand.map(|child| self.index_of(child)))
            .collect();
        let operation = self.instructions[slot].operation;
        write_instruction(out, operation, &encoded)?;
        self.instructions[slot].index = Some(self.next_index);
        self.next_index += 1;
        Ok(())
    }

    /// The stream index of a written value.
    fn index_of(&self, value: &Value) -> u32 {
        let slot = self.traced.get(&TraceKey(value.clone())).copied();
        match slot.and_then(|s| self.instructions[s].index) {
            Some(index) => index,
            None => panic!("{} referenced before it was written", value),
        }
    }

    fn check_provenance(&self, atom: &AtomRef) -> Result<(), SerializerError> {
        match &self.scope {
            Some(module) if !module.can_see(atom) => Err(SerializerError::ForeignAtom {
                atom: atom.name().to_string(),
                module: module.name().to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// The instruction that rebuilds `value`, with its children as object
    /// operands.
    fn decompose(
        &self,
        value: &Value,
    ) -> Result<(SerializerOperation, Vec<Operand<Value>>), SerializerError> {
        if let Some(ordinal) = self.specials.object_ordinal(value) {
            return Ok((Op::SpecialObject, vec![Operand::Byte(ordinal)]));
        }
        Ok(match value {
            Value::Atom(atom) => {
                if let Some(ordinal) = self.specials.atom_ordinal(atom) {
                    return Ok((Op::SpecialAtom, vec![Operand::Byte(ordinal)]));
                }
                self.check_provenance(atom)?;
                match atom.issuing_module() {
                    None => (Op::ModulelessAtom, vec![Operand::Utf8(atom.name().to_string())]),
                    Some(id) => {
                        let module = self.modules.module(id).ok_or(SerializerError::UnsupportedValue {
                            kind: "atom",
                            reason: "issued by an unregistered module",
                        })?;
                        (
                            Op::Atom,
                            vec![
                                Operand::Utf8(atom.name().to_string()),
                                Operand::Utf8(module.name().to_string()),
                            ],
                        )
                    }
                }
            }
            Value::Int(n) => integer(n),
            Value::Float(f) => (Op::Float, vec![Operand::Long(f.to_bits())]),
            Value::String(s) => (Op::String, vec![Operand::Utf8(s.to_string())]),
            Value::Tuple(items) => (Op::Tuple, vec![Operand::Objects(items.to_vec())]),
            Value::Set(set) => (Op::Set, vec![Operand::Objects(set.iter().cloned().collect())]),
            Value::Map(map) => {
                let flat = map
                    .iter()
                    .flat_map(|(k, v)| [k.clone(), v.clone()])
                    .collect();
                (Op::Map, vec![Operand::Objects(flat)])
            }
            Value::Variable(variable) => (
                Op::Variable,
                vec![Operand::Object(Value::of_type(variable.content_type().clone()))],
            ),
            Value::Type(ty) => decompose_type(ty)?,
            Value::Code(code) => {
                let count = |n: usize| {
                    u16::try_from(n).map_err(|_| SerializerError::UnsupportedValue {
                        kind: "compiled code",
                        reason: "more than 65535 locals or outers",
                    })
                };
                let primitive = code
                    .primitive()
                    .map_or(Value::Nil, |p| Value::from(p as i64));
                (
                    Op::CompiledCode,
                    vec![
                        Operand::Utf8(code.name().to_string()),
                        Operand::Object(Value::of_type(Type::Function(code.function_type_arc()))),
                        Operand::Short(count(code.num_locals())?),
                        Operand::Short(count(code.num_outers())?),
                        Operand::Object(primitive),
                        Operand::Objects(code.literals().to_vec()),
                        Operand::Bytes(code.encode_level_one()),
                    ],
                )
            }
            Value::Function(function) => (
                Op::Function,
                vec![
                    Operand::Object(Value::Code(function.code().clone())),
                    Operand::Objects(function.outers().to_vec()),
                ],
            ),
            Value::Continuation(continuation) => {
                if continuation.level_two_offset().is_some() {
                    return Err(SerializerError::UnsupportedValue {
                        kind: "continuation",
                        reason: "frame was reified from an optimized chunk",
                    });
                }
                let caller = continuation
                    .caller()
                    .map_or(Value::Nil, |c| Value::Continuation(c.clone()));
                (
                    Op::Continuation,
                    vec![
                        Operand::Object(caller),
                        Operand::Object(Value::Function(continuation.function().clone())),
                        Operand::Object(Value::from(BigInt::from(continuation.pc()))),
                        Operand::Objects(continuation.slots().to_vec()),
                    ],
                )
            }
            // Nil is always special.
            Value::Nil => {
                return Err(SerializerError::UnsupportedValue {
                    kind: "nil",
                    reason: "missing from the special-object table",
                })
            }
        })
    }
}

impl<W: Write> std::fmt::Debug for Serializer<'_, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Serializer")
            .field("objects_written", &self.next_index)
            .field("bytes_written", &self.bytes_written)
            .field("scope", &self.scope.as_ref().map(|m| m.name().to_string()))
            .finish()
    }
}

fn write_instruction(
    out: &mut CountingWriter<Vec<u8>>,
    operation: SerializerOperation,
    operands: &[Operand<u32>],
) -> Result<(), SerializerError> {
    debug_assert_eq!(
        operands.iter().map(Operand::kind).collect::<Vec<_>>(),
        operation.operand_kinds(),
        "operands of {:?}",
        operation
    );
    out.u8(operation.opcode())?;
    for operand in operands {
        out.operand(operand)?;
    }
    Ok(())
}

fn integer(n: &BigInt) -> (SerializerOperation, Vec<Operand<Value>>) {
    if let Some(b) = n.to_u8() {
        (Op::ByteInteger, vec![Operand::Byte(b)])
    } else if let Some(s) = n.to_u16() {
        (Op::ShortInteger, vec![Operand::Short(s)])
    } else if let Some(i) = n.to_i32() {
        (Op::Int32, vec![Operand::Int(i)])
    } else {
        (Op::BigInteger, vec![Operand::Bytes(n.to_signed_bytes_be())])
    }
}

fn type_value(ty: &Type) -> Value {
    Value::of_type(ty.clone())
}

fn bound(n: &Option<BigInt>) -> Value {
    n.clone().map_or(Value::Nil, Value::from)
}

fn types(ts: &[Type]) -> Operand<Value> {
    Operand::Objects(ts.iter().map(type_value).collect())
}

fn decompose_type(ty: &Type) -> Result<(SerializerOperation, Vec<Operand<Value>>), SerializerError> {
    let size_bounds = |min: u64, max: Option<u64>| {
        [
            Operand::Object(Value::from(BigInt::from(min))),
            Operand::Object(max.map_or(Value::Nil, |m| Value::from(BigInt::from(m)))),
        ]
    };
    Ok(match ty {
        Type::Integers(range) => (
            Op::IntegerRangeType,
            vec![
                Operand::Object(bound(&range.lower)),
                Operand::Object(bound(&range.upper)),
            ],
        ),
        Type::Enumeration(values) => (
            Op::EnumerationType,
            vec![Operand::Objects(values.iter().cloned().collect())],
        ),
        Type::Tuple(t) => {
            let mut operands = size_bounds(t.sizes.min, t.sizes.max).to_vec();
            operands.push(types(&t.leading));
            operands.push(Operand::Object(type_value(&t.default)));
            (Op::TupleType, operands)
        }
        Type::Set(t) => {
            let mut operands = size_bounds(t.sizes.min, t.sizes.max).to_vec();
            operands.push(Operand::Object(type_value(&t.element)));
            (Op::SetType, operands)
        }
        Type::Map(t) => {
            let mut operands = size_bounds(t.sizes.min, t.sizes.max).to_vec();
            operands.push(Operand::Object(type_value(&t.key)));
            operands.push(Operand::Object(type_value(&t.value)));
            (Op::MapType, operands)
        }
        Type::Function(f) | Type::Continuation(f) | Type::Code(f) => {
            let operation = match ty {
                Type::Function(_) => Op::FunctionType,
                Type::Continuation(_) => Op::ContinuationType,
                _ => Op::CodeType,
            };
            (
                operation,
                vec![types(&f.args), Operand::Object(type_value(&f.result))],
            )
        }
        Type::Variable(content) => (Op::VariableType, vec![Operand::Object(type_value(content))]),
        Type::Meta(inner) => (Op::MetaType, vec![Operand::Object(type_value(inner))]),
        Type::Bottom | Type::Top | Type::Any | Type::Float | Type::String | Type::Atom => {
            return Err(SerializerError::UnsupportedValue {
                kind: "type",
                reason: "primitive type missing from the special-object table",
            })
        }
    })
}

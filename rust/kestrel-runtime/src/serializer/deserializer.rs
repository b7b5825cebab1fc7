//! Replays a serialized stream back into values.

use super::error::{DeserializerError, Malformed};
use super::operation::{Operand, SerializerOperation, StreamReader};
use kestrel_core::{
    decode_level_one, AtomRef, CompiledCode, Continuation, Function, FunctionType, MapType,
    ModuleRegistry, SetType, SizeRange, SpecialObjects, TupleType, Type, Value, VariableRef,
};
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use std::io::Read;
use std::sync::Arc;

type Op = SerializerOperation;

/// Reads the values of a stream one checkpoint at a time.
///
/// Objects produced by earlier values stay available to later ones, matching
/// the session the stream was written by.
pub struct Deserializer<'a, R: Read> {
    input: StreamReader<R>,
    specials: &'a SpecialObjects,
    modules: &'a ModuleRegistry,
    objects: Vec<Value>,
}

impl<'a, R: Read> Deserializer<'a, R> {
    pub fn new(input: R, specials: &'a SpecialObjects, modules: &'a ModuleRegistry) -> Self {
        Deserializer {
            input: StreamReader::new(input),
            specials,
            modules,
            objects: Vec::new(),
        }
    }

    pub fn objects_read(&self) -> usize {
        self.objects.len()
    }

    pub fn offset(&self) -> u64 {
        self.input.offset()
    }

    /// The next complete value, or `None` once the stream is exhausted.
    pub fn deserialize(&mut self) -> Result<Option<Value>, DeserializerError> {
        loop {
            let start = self.input.offset();
            let Some((operation, operands)) = self.input.instruction()? else {
                return Ok(None);
            };
            let at = |reason| DeserializerError::Malformed {
                offset: start,
                reason,
            };
            match (operation, operands.as_slice()) {
                (Op::Checkpoint, [Operand::Object(root)]) => {
                    let value = self.object(*root).map_err(at)?;
                    tracing::trace!(objects = self.objects.len(), "deserialized value");
                    return Ok(Some(value));
                }
                (Op::AssignVariable, [Operand::Object(variable), Operand::Object(content)]) => {
                    self.assign(*variable, *content).map_err(at)?;
                }
                _ => {
                    let value = self.build(operation, &operands).map_err(at)?;
                    self.objects.push(value);
                }
            }
        }
    }

    /// Every remaining value of the stream.
    pub fn deserialize_all(&mut self) -> Result<Vec<Value>, DeserializerError> {
        let mut values = Vec::new();
        while let Some(value) = self.deserialize()? {
            values.push(value);
        }
        Ok(values)
    }

    fn object(&self, index: u32) -> Result<Value, Malformed> {
        self.objects
            .get(index as usize)
            .cloned()
            .ok_or(Malformed::BadBackReference {
                index,
                written: self.objects.len(),
            })
    }

    fn objects(&self, indices: &[u32]) -> Result<Vec<Value>, Malformed> {
        indices.iter().map(|i| self.object(*i)).collect()
    }

    fn assign(&self, variable: u32, content: u32) -> Result<(), Malformed> {
        let variable = match self.object(variable)? {
            Value::Variable(v) => v,
            _ => return Err(wrong_kind(Op::AssignVariable, "a variable")),
        };
        variable
            .set(self.object(content)?)
            .map_err(Malformed::BadAssignment)
    }

    fn ty(&self, operation: Op, index: u32) -> Result<Type, Malformed> {
        match self.object(index)? {
            Value::Type(t) => Ok((*t).clone()),
            _ => Err(wrong_kind(operation, "a type")),
        }
    }

    fn types(&self, operation: Op, indices: &[u32]) -> Result<Vec<Type>, Malformed> {
        indices.iter().map(|i| self.ty(operation, *i)).collect()
    }

    fn bound(&self, operation: Op, index: u32) -> Result<Option<BigInt>, Malformed> {
        match self.object(index)? {
            Value::Nil => Ok(None),
            Value::Int(n) => Ok(Some(n)),
            _ => Err(wrong_kind(operation, "an integer or nil")),
        }
    }

    fn sizes(&self, operation: Op, min: u32, max: u32) -> Result<SizeRange, Malformed> {
        let size = |n: BigInt| n.to_u64().ok_or(wrong_kind(operation, "a size"));
        let min = self
            .bound(operation, min)?
            .ok_or(wrong_kind(operation, "a size"))
            .and_then(size)?;
        let max = self.bound(operation, max)?.map(size).transpose()?;
        Ok(SizeRange { min, max })
    }

    fn build(&self, operation: Op, operands: &[Operand<u32>]) -> Result<Value, Malformed> {
        use Operand::*;
        Ok(match (operation, operands) {
            (Op::SpecialObject, [Byte(ordinal)]) => self
                .specials
                .object(*ordinal)
                .cloned()
                .ok_or(Malformed::UnknownSpecialObject(*ordinal))?,
            (Op::SpecialAtom, [Byte(ordinal)]) => self
                .specials
                .atom(*ordinal)
                .cloned()
                .map(Value::Atom)
                .ok_or(Malformed::UnknownSpecialAtom(*ordinal))?,
            (Op::ByteInteger, [Byte(b)]) => Value::from(*b as i64),
            (Op::ShortInteger, [Short(s)]) => Value::from(*s as i64),
            (Op::Int32, [Int(i)]) => Value::from(*i as i64),
            (Op::BigInteger, [Bytes(bytes)]) => Value::from(BigInt::from_signed_bytes_be(bytes)),
            (Op::Float, [Long(bits)]) => Value::Float(f64::from_bits(*bits)),
            (Op::String, [Utf8(s)]) => Value::string(s),
            (Op::Tuple, [Objects(items)]) => Value::tuple(self.objects(items)?),
            (Op::Set, [Objects(items)]) => Value::set(self.objects(items)?),
            (Op::Map, [Objects(flat)]) => {
                if flat.len() % 2 != 0 {
                    return Err(Malformed::UnpairedMapKey);
                }
                let entries = flat
                    .chunks_exact(2)
                    .map(|pair| Ok((self.object(pair[0])?, self.object(pair[1])?)))
                    .collect::<Result<Vec<_>, Malformed>>()?;
                Value::map(entries)
            }
            (Op::Atom, [Utf8(name), Utf8(module)]) => {
                let module = self
                    .modules
                    .module_named(module)
                    .ok_or_else(|| Malformed::UnknownModule(module.clone()))?;
                Value::Atom(module.atom_named(name))
            }
            (Op::ModulelessAtom, [Utf8(name)]) => Value::Atom(AtomRef::new(name.as_str(), None)),
            (Op::Variable, [Object(content)]) => {
                Value::Variable(VariableRef::new(self.ty(operation, *content)?))
            }
            (Op::IntegerRangeType, [Object(lower), Object(upper)]) => Value::of_type(Type::int_range(
                self.bound(operation, *lower)?,
                self.bound(operation, *upper)?,
            )),
            (Op::EnumerationType, [Objects(members)]) => {
                Value::of_type(Type::enumeration(self.objects(members)?))
            }
            (Op::TupleType, [Object(min), Object(max), Objects(leading), Object(default)]) => {
                Value::of_type(TupleType::new(
                    self.sizes(operation, *min, *max)?,
                    self.types(operation, leading)?,
                    self.ty(operation, *default)?,
                ))
            }
            (Op::SetType, [Object(min), Object(max), Object(element)]) => Value::of_type(SetType::new(
                self.sizes(operation, *min, *max)?,
                self.ty(operation, *element)?,
            )),
            (Op::MapType, [Object(min), Object(max), Object(key), Object(value)]) => {
                Value::of_type(MapType::new(
                    self.sizes(operation, *min, *max)?,
                    self.ty(operation, *key)?,
                    self.ty(operation, *value)?,
                ))
            }
            (Op::FunctionType | Op::ContinuationType | Op::CodeType, [Objects(args), Object(result)]) => {
                let signature = Arc::new(FunctionType::new(
                    self.types(operation, args)?,
                    self.ty(operation, *result)?,
                ));
                Value::of_type(match operation {
                    Op::FunctionType => Type::Function(signature),
                    Op::ContinuationType => Type::Continuation(signature),
                    _ => Type::Code(signature),
                })
            }
            (Op::VariableType, [Object(content)]) => {
                Value::of_type(Type::variable(self.ty(operation, *content)?))
            }
            (Op::MetaType, [Object(inner)]) => Value::of_type(Type::meta(self.ty(operation, *inner)?)),
            (
                Op::CompiledCode,
                [Utf8(name), Object(signature), Short(locals), Short(outers), Object(primitive), Objects(literals), Bytes(code)],
            ) => {
                let Type::Function(signature) = self.ty(operation, *signature)? else {
                    return Err(wrong_kind(operation, "a function type"));
                };
                let primitive = self
                    .bound(operation, *primitive)?
                    .map(|n| n.to_u16().ok_or(wrong_kind(operation, "a primitive number")))
                    .transpose()?;
                let code = CompiledCode::from_parts(
                    Arc::from(name.as_str()),
                    signature,
                    *locals as usize,
                    *outers as usize,
                    primitive,
                    self.objects(literals)?,
                    decode_level_one(code)?,
                )?;
                Value::Code(Arc::new(code))
            }
            (Op::Function, [Object(code), Objects(outers)]) => {
                let Value::Code(code) = self.object(*code)? else {
                    return Err(wrong_kind(operation, "a compiled code"));
                };
                if outers.len() != code.num_outers() {
                    return Err(Malformed::OuterCount {
                        expected: code.num_outers(),
                        actual: outers.len(),
                    });
                }
                Value::Function(Arc::new(Function::new(code, self.objects(outers)?)))
            }
            (Op::Continuation, [Object(caller), Object(function), Object(pc), Objects(slots)]) => {
                let caller = match self.object(*caller)? {
                    Value::Nil => None,
                    Value::Continuation(c) => Some(c),
                    _ => return Err(wrong_kind(operation, "a continuation or nil")),
                };
                let Value::Function(function) = self.object(*function)? else {
                    return Err(wrong_kind(operation, "a function"));
                };
                let pc = self
                    .bound(operation, *pc)?
                    .and_then(|n| n.to_usize())
                    .ok_or(wrong_kind(operation, "a program counter"))?;
                let code = function.code();
                if pc > code.instructions().len() {
                    return Err(wrong_kind(operation, "a program counter within its code"));
                }
                // Level-one frames hold every slot of their code, then the
                // operand stack.
                if slots.len() < code.num_slots() {
                    return Err(wrong_kind(operation, "a slot for every argument and local"));
                }
                Value::Continuation(Arc::new(Continuation::new(
                    caller,
                    function,
                    pc,
                    self.objects(slots)?,
                )))
            }
            (operation, operands) => panic!(
                "{:?} read with operands {:?} that do not match its declaration",
                operation, operands
            ),
        })
    }
}

impl<R: Read> std::fmt::Debug for Deserializer<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deserializer")
            .field("offset", &self.input.offset())
            .field("objects_read", &self.objects.len())
            .finish()
    }
}

fn wrong_kind(operation: Op, expected: &'static str) -> Malformed {
    Malformed::WrongKind {
        operation: operation.name(),
        expected,
    }
}

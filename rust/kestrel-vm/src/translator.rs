//! Lowering of level-one code into a specialized level-two chunk.
//!
//! The translator simulates the level-one operand stack with registers.
//! At every call site it asks the dispatch engine which definitions the
//! statically known argument types could reach, and picks the cheapest
//! correct way to make the call:
//!
//! * no candidates: report the failure and stop;
//! * one certain primitive target: fold it, run it inline, or take an
//!   integer fast path with a full call as fallback;
//! * one certain target otherwise: call that function directly;
//! * several candidates: look up by values at run time, then invoke.
//!
//! Every method consulted becomes a dependency of the chunk, so a later
//! definition change invalidates it.

use crate::chunk::{Dependency, L2Chunk};
use crate::context::VmContext;
use crate::error::VmError;
use crate::instruction::L2Instruction;
use crate::operand::L2Operand;
use crate::operation::L2Operation;
use crate::primitive::{numbers, InterpreterState, Primitive, PrimitiveResult};
use crate::register::{L2Register, RegisterAllocator, RegisterCounts, RegisterKind};
use crate::register_set::RegisterSet;
use crate::type_flow::{simplify, TypeFlow};
use kestrel_core::{
    AtomRef, CompiledCode, Continuation, ErrorCode, Function, L1Instruction, SpecialObjects, Type,
    Value,
};
use kestrel_dispatch::{DefinitionBody, InlineCache, Method};
use std::sync::Arc;

/// Placeholder pc operands hold label numbers until [`Translator::finish`].
type Label = usize;

struct FoldState<'a>(&'a SpecialObjects);

impl InterpreterState for FoldState<'_> {
    fn specials(&self) -> &SpecialObjects {
        self.0
    }

    fn reify_caller(&self) -> Option<Arc<Continuation>> {
        None
    }
}

pub struct Translator<'a> {
    context: &'a VmContext,
    code: Arc<CompiledCode>,
    instructions: Vec<L2Instruction>,
    labels: Vec<Option<usize>>,
    allocator: RegisterAllocator,
    known: RegisterSet,
    slots: Vec<L2Register>,
    stack: Vec<L2Register>,
    dependencies: Vec<Dependency>,
}

impl<'a> Translator<'a> {
    pub fn new(context: &'a VmContext, code: Arc<CompiledCode>) -> Self {
        let num_args = code.num_args();
        Translator {
            context,
            instructions: Vec::new(),
            labels: Vec::new(),
            allocator: RegisterAllocator::with_arguments(num_args),
            known: RegisterSet::new(),
            slots: Vec::with_capacity(code.num_slots()),
            stack: Vec::new(),
            dependencies: Vec::new(),
            code,
        }
    }

    /// Translate `code` into a chunk ready for [`crate::ChunkArena::install`].
    pub fn translate(context: &VmContext, code: Arc<CompiledCode>) -> Result<L2Chunk, VmError> {
        if code.primitive().is_some() {
            return Err(VmError::Untranslatable {
                name: code.name().to_string(),
                reason: "primitive code runs its primitive directly",
            });
        }
        let mut translator = Translator::new(context, code);
        translator.lower()?;
        Ok(translator.finish())
    }

    fn emit(&mut self, operation: L2Operation, operands: Vec<L2Operand>) {
        self.instructions.push(L2Instruction::new(operation, operands));
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        self.labels.len() - 1
    }

    fn place(&mut self, label: Label, name: &str) {
        self.labels[label] = Some(self.instructions.len());
        self.emit(L2Operation::Label, vec![L2Operand::Comment(Arc::from(name))]);
    }

    fn fresh(&mut self, kind: RegisterKind) -> L2Register {
        self.allocator.next(kind)
    }

    fn move_constant(&mut self, value: Value) -> L2Register {
        let register = self.fresh(RegisterKind::Boxed);
        self.emit(
            L2Operation::MoveConstant,
            vec![L2Operand::Constant(value.clone()), L2Operand::write(register)],
        );
        self.known.set_constant(register, value);
        register
    }

    fn pop(&mut self) -> L2Register {
        match self.stack.pop() {
            Some(register) => register,
            None => panic!("validated level-one code underflowed in {}", self.code.name()),
        }
    }

    fn pop_n(&mut self, n: usize) -> Vec<L2Register> {
        let at = self.stack.len().saturating_sub(n);
        self.stack.split_off(at)
    }

    fn literal(&self, index: u32) -> Result<&Value, VmError> {
        self.code
            .literal_at(index as usize)
            .ok_or_else(|| VmError::Untranslatable {
                name: self.code.name().to_string(),
                reason: "literal index out of range",
            })
    }

    fn report_failure(&mut self, code: ErrorCode) {
        let register = self.move_constant(code.as_value());
        self.emit(L2Operation::ReportFailure, vec![L2Operand::read(register)]);
    }

    fn lower(&mut self) -> Result<(), VmError> {
        self.emit(L2Operation::EnterChunk, vec![]);
        let function_type = self.code.function_type_arc();
        for (i, ty) in function_type.args.iter().enumerate() {
            let register = L2Register::boxed(i as u32);
            self.known.set_type(register, ty.clone());
            self.slots.push(register);
        }
        for _ in 0..self.code.num_locals() {
            let register = self.move_constant(Value::Nil);
            self.slots.push(register);
        }

        let code = self.code.clone();
        for instruction in code.instructions() {
            match *instruction {
                L1Instruction::PushLiteral(index) => {
                    let value = self.literal(index)?.clone();
                    let register = self.move_constant(value);
                    self.stack.push(register);
                }
                L1Instruction::PushLocal(index) => {
                    self.stack.push(self.slots[index as usize]);
                }
                L1Instruction::PushOuter(index) => {
                    let register = self.fresh(RegisterKind::Boxed);
                    self.emit(
                        L2Operation::MoveOuter,
                        vec![L2Operand::Immediate(i64::from(index)), L2Operand::write(register)],
                    );
                    self.known.set_type(register, Type::Top);
                    self.stack.push(register);
                }
                L1Instruction::SetLocal(index) => {
                    let register = self.pop();
                    self.slots[index as usize] = register;
                }
                L1Instruction::MakeTuple(n) => {
                    let elements = self.pop_n(n as usize);
                    let types = elements.iter().map(|r| self.known.type_of(*r)).collect();
                    let register = self.fresh(RegisterKind::Boxed);
                    self.emit(
                        L2Operation::CreateTuple,
                        vec![L2Operand::vector(elements), L2Operand::write(register)],
                    );
                    self.known.set_type(register, Type::tuple_of(types));
                    self.stack.push(register);
                }
                L1Instruction::Pop => {
                    self.pop();
                }
                L1Instruction::Call {
                    message,
                    arity,
                    expected,
                } => {
                    let Some(atom) = self.literal(message)?.as_atom().cloned() else {
                        return Err(VmError::Untranslatable {
                            name: self.code.name().to_string(),
                            reason: "call message is not an atom",
                        });
                    };
                    let expected = self.literal(expected)?.as_type().cloned().unwrap_or(Type::Top);
                    let args = self.pop_n(arity as usize);
                    match self.translate_call(&atom, args, &expected) {
                        Some(result) => self.stack.push(result),
                        // The call always fails; nothing after it runs.
                        None => return Ok(()),
                    }
                }
                L1Instruction::Return => {
                    let register = self.pop();
                    self.emit(L2Operation::Return, vec![L2Operand::read(register)]);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn depend_on(&mut self, method: &Arc<Method>) {
        if !self
            .dependencies
            .iter()
            .any(|d| Arc::ptr_eq(&d.method, method))
        {
            self.dependencies.push(Dependency {
                method: method.clone(),
                epoch: method.epoch(),
            });
        }
    }

    /// Emit a call and answer the register holding its checked result, or
    /// `None` when the call is known to fail.
    fn translate_call(
        &mut self,
        atom: &AtomRef,
        args: Vec<L2Register>,
        expected: &Type,
    ) -> Option<L2Register> {
        // Created empty if need be, so the first definition invalidates this
        // chunk. That definition also fixes the method's arity.
        let method = self.context.methods.method_or_create(atom, args.len());
        // Record the epoch before asking, so a change racing the question
        // is caught at install time.
        self.depend_on(&method);
        if method.definition_count() == 0 {
            self.report_failure(ErrorCode::NoMethodDefinition);
            return None;
        }
        if method.num_args() != args.len() {
            self.report_failure(ErrorCode::IncorrectNumberOfArguments);
            return None;
        }
        let arg_types: Vec<Type> = args.iter().map(|r| self.known.type_of(*r)).collect();
        let bound = method.definitions_at_or_below(&arg_types);
        if bound.is_empty() {
            tracing::trace!(method = %atom, "call site has no applicable definition");
            self.report_failure(ErrorCode::NoMethodDefinition);
            return None;
        }

        let (result, result_type) = match bound.monomorphic_target().map(|d| d.body().clone()) {
            Some(DefinitionBody::Forward) => {
                self.report_failure(ErrorCode::ForwardMethodDefinition);
                return None;
            }
            Some(DefinitionBody::Abstract) => {
                self.report_failure(ErrorCode::AbstractMethodDefinition);
                return None;
            }
            Some(DefinitionBody::Method(function)) => {
                self.translate_known_call(&function, &args, &arg_types)
            }
            None => {
                let cache = Arc::new(InlineCache::new(self.context.config.inline_cache_entries));
                let callee = self.fresh(RegisterKind::Boxed);
                self.emit(
                    L2Operation::LookupByValues,
                    vec![
                        L2Operand::selector(method.clone(), cache),
                        L2Operand::vector(args.iter().copied()),
                        L2Operand::write(callee),
                    ],
                );
                let result = self.fresh(RegisterKind::Boxed);
                self.emit(
                    L2Operation::Invoke,
                    vec![
                        L2Operand::read(callee),
                        L2Operand::vector(args.iter().copied()),
                        L2Operand::write(result),
                    ],
                );
                (result, bound.result_type())
            }
        };
        self.known.set_type(result, result_type.clone());
        if !result_type.is_subtype_of(expected) {
            self.guard_result(result, expected);
        }
        Some(result)
    }

    fn guard_result(&mut self, result: L2Register, expected: &Type) {
        let ok = self.new_label();
        let mismatch = self.new_label();
        self.emit(
            L2Operation::JumpIfKindOfConstant,
            vec![
                L2Operand::read(result),
                L2Operand::Constant(Value::of_type(expected.clone())),
                L2Operand::Pc(ok),
                L2Operand::Pc(mismatch),
            ],
        );
        self.place(mismatch, "result type mismatch");
        self.report_failure(ErrorCode::ResultTypeMismatch);
        self.place(ok, "result checked");
        self.known.strengthen(result, expected);
    }

    fn translate_known_call(
        &mut self,
        function: &Arc<Function>,
        args: &[L2Register],
        arg_types: &[Type],
    ) -> (L2Register, Type) {
        let declared = function.code().function_type().result.clone();
        let primitive = function
            .code()
            .primitive()
            .and_then(|n| self.context.primitives.get(n).cloned());
        let Some(primitive) = primitive else {
            return (self.invoke_constant(function, args), declared);
        };
        let flags = primitive.flags();
        let narrowed = primitive.return_type_for(arg_types).intersection(&declared);

        if flags.can_fold {
            if let Some(value) = self.fold(primitive.as_ref(), args) {
                let ty = value.instance_type();
                return (self.move_constant(value), ty);
            }
        }
        if let Some(result) = self.int_fast_path(primitive.number(), function, args, arg_types) {
            let ty = if flags.cannot_fail { narrowed } else { narrowed.union(&declared) };
            return (result, ty);
        }
        if flags.can_inline && flags.cannot_fail {
            let result = self.fresh(RegisterKind::Boxed);
            self.emit(
                L2Operation::RunInfalliblePrimitive,
                vec![
                    L2Operand::Primitive(primitive.number()),
                    L2Operand::vector(args.iter().copied()),
                    L2Operand::write(result),
                ],
            );
            return (result, narrowed);
        }
        if flags.can_inline {
            let slow = self.new_label();
            let join = self.new_label();
            let fast = self.fresh(RegisterKind::Boxed);
            self.emit(
                L2Operation::AttemptPrimitive,
                vec![
                    L2Operand::Primitive(primitive.number()),
                    L2Operand::vector(args.iter().copied()),
                    L2Operand::write(fast),
                    L2Operand::Pc(slow),
                ],
            );
            self.emit(L2Operation::Jump, vec![L2Operand::Pc(join)]);
            self.place(slow, "primitive failed");
            let slow_result = self.invoke_constant(function, args);
            self.place(join, "primitive joined");
            let result = self.phi(&[fast, slow_result]);
            return (result, narrowed.union(&declared));
        }
        let ty = if flags.cannot_fail { narrowed } else { declared };
        (self.invoke_constant(function, args), ty)
    }

    fn fold(&self, primitive: &dyn Primitive, args: &[L2Register]) -> Option<Value> {
        let values: Vec<Value> = args
            .iter()
            .map(|r| self.known.constant_of(*r).cloned())
            .collect::<Option<_>>()?;
        match primitive.attempt(&values, &FoldState(&self.context.specials)) {
            PrimitiveResult::Success(value) => {
                tracing::trace!(primitive = primitive.name(), "folded call");
                Some(value)
            }
            _ => None,
        }
    }

    /// Unboxed arithmetic for integer primitives whose arguments are known
    /// to fit in 64 bits; overflow or a zero divisor takes the full call.
    fn int_fast_path(
        &mut self,
        number: u16,
        function: &Arc<Function>,
        args: &[L2Register],
        arg_types: &[Type],
    ) -> Option<L2Register> {
        let operation = match number {
            numbers::ADD_INTEGERS => L2Operation::AddIntToInt,
            numbers::SUBTRACT_INTEGERS => L2Operation::SubtractIntFromInt,
            numbers::MULTIPLY_INTEGERS => L2Operation::MultiplyIntByInt,
            numbers::DIVIDE_INTEGERS => L2Operation::DivideIntByInt,
            _ => return None,
        };
        let int64 = Type::int64();
        if args.len() != 2 || !arg_types.iter().all(|t| t.is_subtype_of(&int64)) {
            return None;
        }
        let slow = self.new_label();
        let join = self.new_label();
        let mut unboxed = Vec::with_capacity(2);
        for (register, ty) in args.iter().zip(arg_types) {
            let int = self.fresh(RegisterKind::Int);
            match self.known.constant_of(*register).and_then(Value::as_i64) {
                Some(n) => self.emit(
                    L2Operation::MoveIntConstant,
                    vec![L2Operand::Immediate(n), L2Operand::write(int)],
                ),
                None => {
                    let unboxed_ok = self.new_label();
                    self.emit(
                        L2Operation::JumpIfUnboxInt,
                        vec![
                            L2Operand::read(*register),
                            L2Operand::write(int),
                            L2Operand::Pc(unboxed_ok),
                            L2Operand::Pc(slow),
                        ],
                    );
                    self.place(unboxed_ok, "unboxed");
                }
            }
            self.known.set_type(int, ty.clone());
            unboxed.push(int);
        }
        let sum = self.fresh(RegisterKind::Int);
        let computed = self.new_label();
        self.emit(
            operation,
            vec![
                L2Operand::read(unboxed[0]),
                L2Operand::read(unboxed[1]),
                L2Operand::write(sum),
                L2Operand::Pc(computed),
                L2Operand::Pc(slow),
            ],
        );
        self.place(computed, "fast path");
        let fast = self.fresh(RegisterKind::Boxed);
        self.emit(
            L2Operation::BoxInt,
            vec![L2Operand::read(sum), L2Operand::write(fast)],
        );
        self.emit(L2Operation::Jump, vec![L2Operand::Pc(join)]);
        self.place(slow, "slow path");
        let slow_result = self.invoke_constant(function, args);
        self.place(join, "arithmetic joined");
        Some(self.phi(&[fast, slow_result]))
    }

    fn invoke_constant(&mut self, function: &Arc<Function>, args: &[L2Register]) -> L2Register {
        let result = self.fresh(RegisterKind::Boxed);
        self.emit(
            L2Operation::InvokeConstantFunction,
            vec![
                L2Operand::Constant(Value::Function(function.clone())),
                L2Operand::vector(args.iter().copied()),
                L2Operand::write(result),
            ],
        );
        self.known
            .set_type(result, function.code().function_type().result.clone());
        result
    }

    fn phi(&mut self, sources: &[L2Register]) -> L2Register {
        let result = self.fresh(RegisterKind::Boxed);
        self.emit(
            L2Operation::Phi,
            vec![L2Operand::vector(sources.iter().copied()), L2Operand::write(result)],
        );
        result
    }

    fn finish(self) -> L2Chunk {
        let labels = self.labels;
        let patched: Vec<L2Instruction> = self
            .instructions
            .iter()
            .map(|instr| {
                instr.with_remapped_targets(|label| match labels.get(label).copied().flatten() {
                    Some(pc) => pc,
                    None => panic!("label {} was never placed", label),
                })
            })
            .collect();

        let mut entry = RegisterSet::new();
        for (i, ty) in self.code.function_type().args.iter().enumerate() {
            entry.set_type(L2Register::boxed(i as u32), ty.clone());
        }
        let flow = TypeFlow::analyze(&patched, entry, &self.context.primitives);
        let (instructions, report) = simplify(&patched, &flow);

        let mut counts = RegisterCounts {
            boxed: self.code.num_args() as u32,
            ..RegisterCounts::default()
        };
        for instr in &instructions {
            for register in instr.sources().into_iter().chain(instr.destinations()) {
                counts.note(register);
            }
        }
        tracing::debug!(
            code = self.code.name(),
            instructions = instructions.len(),
            removed = report.removed,
            folded_tests = report.folded_tests,
            dependencies = self.dependencies.len(),
            "translated to level two"
        );
        L2Chunk::new(
            self.code.name_arc().clone(),
            instructions,
            counts,
            self.dependencies,
        )
    }
}

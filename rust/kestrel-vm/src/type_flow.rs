//! Static type propagation over level-two code.
//!
//! [`propagate_types`] is the per-operation transfer function: given what is
//! known about registers before an instruction, it reports what is known
//! along each outgoing edge, or `None` for an edge that cannot be taken.
//! [`TypeFlow`] runs it over a whole instruction list and [`simplify`] uses
//! the result to fold decided tests and drop unreachable code.

use crate::instruction::L2Instruction;
use crate::operand::L2Operand;
use crate::operation::L2Operation;
use crate::primitive::PrimitiveRegistry;
use crate::register::L2Register;
use crate::register_set::RegisterSet;
use kestrel_core::{IntRange, Type, Value};
use num_bigint::BigInt;
use std::collections::HashSet;
use std::sync::Arc;

fn fits_int64(ty: &Type) -> bool {
    ty.is_subtype_of(&Type::int64())
}

/// Facts after an unconditional fall-through that writes one register.
fn with_type(input: &RegisterSet, register: L2Register, ty: Type) -> Vec<Option<RegisterSet>> {
    let mut out = input.clone();
    out.set_type(register, ty);
    vec![Some(out)]
}

fn with_constant(input: &RegisterSet, register: L2Register, value: Value) -> Vec<Option<RegisterSet>> {
    let mut out = input.clone();
    out.set_constant(register, value);
    vec![Some(out)]
}

/// Split `input` on whether `register` holds an instance of `ty`: the
/// facts on the passing edge, then on the failing edge.
fn split_on_type(
    input: &RegisterSet,
    register: L2Register,
    ty: &Type,
) -> (Option<RegisterSet>, Option<RegisterSet>) {
    if let Some(value) = input.constant_of(register) {
        return if ty.contains(value) {
            (Some(input.clone()), None)
        } else {
            (None, Some(input.clone()))
        };
    }
    let known = input.type_of(register);
    if known.is_subtype_of(ty) {
        return (Some(input.clone()), None);
    }
    if !known.could_intersect(ty) {
        return (None, Some(input.clone()));
    }
    let mut pass = input.clone();
    pass.strengthen(register, ty);
    (Some(pass), Some(input.clone()))
}

fn int_arithmetic(
    instr: &L2Instruction,
    input: &RegisterSet,
    op: fn(&BigInt, &BigInt) -> BigInt,
) -> Vec<Option<RegisterSet>> {
    let a = input.type_of(instr.read_register(0));
    let b = input.type_of(instr.read_register(1));
    let exact = match (a.as_int_range(), b.as_int_range()) {
        (Some(a), Some(b)) => a.combine_corners(b, op).map(Type::Integers),
        _ => None,
    };
    let destination = instr.write_register(2);
    match exact {
        Some(result) if fits_int64(&result) => {
            let mut ok = input.clone();
            ok.set_type(destination, result);
            vec![Some(ok), None]
        }
        Some(result) => {
            let mut ok = input.clone();
            ok.set_type(destination, result.intersection(&Type::int64()));
            vec![Some(ok), Some(input.clone())]
        }
        None => {
            let mut ok = input.clone();
            ok.set_type(destination, Type::int64());
            vec![Some(ok), Some(input.clone())]
        }
    }
}

fn int_division(instr: &L2Instruction, input: &RegisterSet) -> Vec<Option<RegisterSet>> {
    let a = input.type_of(instr.read_register(0));
    let b = input.type_of(instr.read_register(1));
    let zero = Value::from(0);
    let minus_one = Value::from(-1);
    let can_fail = b.contains(&zero) || (b.contains(&minus_one) && a.contains(&Value::from(i64::MIN)));
    let divisor_is_zero = b.as_int_range().and_then(IntRange::single) == Some(&BigInt::from(0));
    let ok = (!divisor_is_zero).then(|| {
        let mut ok = input.clone();
        ok.set_type(instr.write_register(2), Type::int64());
        ok
    });
    vec![ok, can_fail.then(|| input.clone())]
}

fn comparison(instr: &L2Instruction, input: &RegisterSet) -> Vec<Option<RegisterSet>> {
    let a = input.type_of(instr.read_register(0));
    let b = input.type_of(instr.read_register(1));
    let (Some(a), Some(b)) = (a.as_int_range(), b.as_int_range()) else {
        return vec![Some(input.clone()), Some(input.clone())];
    };
    let always = matches!((&a.upper, &b.lower), (Some(hi), Some(lo)) if hi < lo);
    let never = matches!((&a.lower, &b.upper), (Some(lo), Some(hi)) if lo >= hi);
    vec![
        (!never).then(|| input.clone()),
        (!always).then(|| input.clone()),
    ]
}

fn result_type_of_function(ty: &Type, constant: Option<&Value>) -> Type {
    match (constant, ty) {
        (Some(Value::Function(f)), _) => f.code().function_type().result.clone(),
        (_, Type::Function(ft)) => ft.result.clone(),
        _ => Type::Top,
    }
}

fn vector_types(instr: &L2Instruction, index: usize, input: &RegisterSet) -> Vec<Type> {
    instr
        .vector(index)
        .iter()
        .map(|r| input.type_of(*r))
        .collect()
}

/// Facts along each successor of `instr`, in [`L2Instruction::successors`]
/// order.
pub fn propagate_types(
    instr: &L2Instruction,
    input: &RegisterSet,
    primitives: &PrimitiveRegistry,
) -> Vec<Option<RegisterSet>> {
    match instr.operation() {
        L2Operation::EnterChunk
        | L2Operation::Label
        | L2Operation::SetVariable
        | L2Operation::DecrementCounterAndReoptimize => vec![Some(input.clone())],
        L2Operation::Return
        | L2Operation::ReportFailure
        | L2Operation::InterpretLevelOne
        | L2Operation::Unreachable => Vec::new(),
        L2Operation::MoveConstant => {
            with_constant(input, instr.write_register(1), instr.constant(0).clone())
        }
        L2Operation::MoveIntConstant => {
            with_constant(input, instr.write_register(1), Value::from(instr.immediate(0)))
        }
        L2Operation::MoveFloatConstant => {
            with_type(input, instr.write_register(1), Type::Float)
        }
        L2Operation::Move | L2Operation::BoxInt => {
            let source = instr.read_register(0);
            match input.constant_of(source) {
                Some(value) => with_constant(input, instr.write_register(1), value.clone()),
                None => with_type(input, instr.write_register(1), input.type_of(source)),
            }
        }
        L2Operation::BoxFloat => with_type(input, instr.write_register(1), Type::Float),
        L2Operation::MoveOuter => with_type(input, instr.write_register(1), Type::Top),
        L2Operation::JumpIfUnboxInt => {
            let source = instr.read_register(0);
            let (pass, fail) = split_on_type(input, source, &Type::int64());
            let pass = pass.map(|mut set| {
                let ty = set.type_of(source);
                set.set_type(instr.write_register(1), ty);
                set
            });
            vec![pass, fail]
        }
        L2Operation::JumpIfUnboxFloat => {
            let (pass, fail) = split_on_type(input, instr.read_register(0), &Type::Float);
            let pass = pass.map(|mut set| {
                set.set_type(instr.write_register(1), Type::Float);
                set
            });
            vec![pass, fail]
        }
        L2Operation::AddIntToInt => int_arithmetic(instr, input, |a, b| a + b),
        L2Operation::SubtractIntFromInt => int_arithmetic(instr, input, |a, b| a - b),
        L2Operation::MultiplyIntByInt => int_arithmetic(instr, input, |a, b| a * b),
        L2Operation::DivideIntByInt => int_division(instr, input),
        L2Operation::AddFloatToFloat => with_type(input, instr.write_register(2), Type::Float),
        L2Operation::JumpIfLessThanInt => comparison(instr, input),
        L2Operation::Jump => vec![Some(input.clone())],
        L2Operation::JumpIfKindOfConstant => {
            let ty = instr.constant(1).as_type().cloned().unwrap_or(Type::Top);
            let (pass, fail) = split_on_type(input, instr.read_register(0), &ty);
            vec![pass, fail]
        }
        L2Operation::JumpIfEqualsConstant => {
            let source = instr.read_register(0);
            let expected = instr.constant(1);
            let (pass, fail) = split_on_type(input, source, &expected.instance_type());
            let pass = pass.map(|mut set| {
                set.set_constant(source, expected.clone());
                set
            });
            let fail = match input.constant_of(source) {
                Some(value) if value == expected => None,
                _ => Some(input.clone()),
            };
            vec![pass, fail]
        }
        L2Operation::CreateTuple => {
            let sources = instr.vector(0);
            let constants: Option<Vec<Value>> = sources
                .iter()
                .map(|r| input.constant_of(*r).cloned())
                .collect();
            match constants {
                Some(items) => with_constant(input, instr.write_register(1), Value::tuple(items)),
                None => with_type(
                    input,
                    instr.write_register(1),
                    Type::tuple_of(vector_types(instr, 0, input)),
                ),
            }
        }
        L2Operation::TupleAtConstant => {
            let index = usize::try_from(instr.immediate(1)).unwrap_or(0);
            let ty = match input.type_of(instr.read_register(0)) {
                Type::Tuple(t) if index >= 1 => t.type_at(index - 1).clone(),
                _ => Type::Top,
            };
            with_type(input, instr.write_register(2), ty)
        }
        L2Operation::CreateVariable => {
            let content = instr.constant(0).as_type().cloned().unwrap_or(Type::Top);
            with_type(input, instr.write_register(1), Type::variable(content))
        }
        L2Operation::GetVariable => {
            let ty = match input.type_of(instr.read_register(0)) {
                Type::Variable(content) => (*content).clone(),
                _ => Type::Top,
            };
            with_type(input, instr.write_register(1), ty)
        }
        L2Operation::CreateFunction => {
            let ty = match instr.constant(0) {
                Value::Code(code) => Type::Function(code.function_type_arc()),
                _ => Type::Any,
            };
            with_type(input, instr.write_register(2), ty)
        }
        L2Operation::LookupByValues => {
            let selector = instr.selector(0);
            let bound = selector
                .method
                .definitions_at_or_below(&vector_types(instr, 1, input));
            if bound.is_empty() {
                return vec![None];
            }
            let destination = instr.write_register(2);
            match bound.monomorphic_target().and_then(|d| d.function()) {
                Some(f) => with_constant(input, destination, Value::Function(f.clone())),
                None => {
                    let ty = bound.candidates.iter().fold(Type::Bottom, |acc, d| {
                        acc.union(&Type::Function(Arc::new(d.signature().clone())))
                    });
                    with_type(input, destination, ty)
                }
            }
        }
        L2Operation::Invoke => {
            let callee = instr.read_register(0);
            let ty = result_type_of_function(&input.type_of(callee), input.constant_of(callee));
            with_type(input, instr.write_register(2), ty)
        }
        L2Operation::InvokeConstantFunction => {
            let ty = result_type_of_function(&Type::Top, Some(instr.constant(0)));
            with_type(input, instr.write_register(2), ty)
        }
        L2Operation::RunInfalliblePrimitive | L2Operation::AttemptPrimitive => {
            let ty = primitives
                .get(instr.primitive(0))
                .map_or(Type::Top, |p| p.return_type_for(&vector_types(instr, 1, input)));
            let mut ok = with_type(input, instr.write_register(2), ty);
            if instr.operation() == L2Operation::AttemptPrimitive {
                ok.push(Some(input.clone()));
            }
            ok
        }
        L2Operation::Phi => {
            let ty = instr
                .vector(0)
                .iter()
                .filter_map(|r| input.get(*r))
                .fold(Type::Bottom, |acc, info| acc.union(&info.ty));
            let ty = if ty.is_bottom() { Type::Top } else { ty };
            with_type(input, instr.write_register(1), ty)
        }
    }
}

/// The facts reaching every instruction of a forward-branching
/// instruction list.
#[derive(Debug)]
pub struct TypeFlow {
    inputs: Vec<Option<RegisterSet>>,
    live_edges: HashSet<(usize, usize)>,
}

impl TypeFlow {
    /// Level-two code only branches forward, so one pass in program order
    /// sees every predecessor of an instruction before the instruction.
    pub fn analyze(
        instructions: &[L2Instruction],
        entry: RegisterSet,
        primitives: &PrimitiveRegistry,
    ) -> Self {
        let mut inputs: Vec<Option<RegisterSet>> = vec![None; instructions.len()];
        let mut live_edges = HashSet::new();
        if let Some(first) = inputs.first_mut() {
            *first = Some(entry);
        }
        for pc in 0..instructions.len() {
            let Some(input) = inputs[pc].clone() else {
                continue;
            };
            let instr = &instructions[pc];
            let outputs = propagate_types(instr, &input, primitives);
            let successors = instr.successors(pc);
            debug_assert_eq!(outputs.len(), successors.len(), "{}", instr);
            for (successor, output) in successors.into_iter().zip(outputs) {
                let Some(output) = output else {
                    continue;
                };
                assert!(successor > pc, "backward branch at {}: {}", pc, instr);
                if successor >= instructions.len() {
                    continue;
                }
                live_edges.insert((pc, successor));
                inputs[successor] = Some(match inputs[successor].take() {
                    Some(existing) => existing.merge(&output),
                    None => output,
                });
            }
        }
        TypeFlow { inputs, live_edges }
    }

    pub fn input(&self, pc: usize) -> Option<&RegisterSet> {
        self.inputs.get(pc).and_then(Option::as_ref)
    }

    pub fn is_reachable(&self, pc: usize) -> bool {
        self.input(pc).is_some()
    }

    pub fn is_live_edge(&self, from: usize, to: usize) -> bool {
        self.live_edges.contains(&(from, to))
    }
}

/// Counts of what [`simplify`] changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimplifyReport {
    pub removed: usize,
    pub folded_tests: usize,
}

/// Replace tests whose outcome is decided with jumps and drop unreachable
/// instructions. Dead edges of surviving instructions are pointed at a
/// trailing `unreachable`.
pub fn simplify(
    instructions: &[L2Instruction],
    flow: &TypeFlow,
) -> (Vec<L2Instruction>, SimplifyReport) {
    let mut report = SimplifyReport::default();
    let mut kept: Vec<(usize, L2Instruction)> = Vec::with_capacity(instructions.len());
    for (pc, instr) in instructions.iter().enumerate() {
        if !flow.is_reachable(pc) {
            report.removed += 1;
            continue;
        }
        if instr.operation().is_pure_test() {
            let live: Vec<usize> = instr
                .targets()
                .into_iter()
                .filter(|t| flow.is_live_edge(pc, *t))
                .collect();
            if let [only] = live.as_slice() {
                report.folded_tests += 1;
                kept.push((pc, L2Instruction::new(L2Operation::Jump, vec![L2Operand::Pc(*only)])));
                continue;
            }
        }
        kept.push((pc, instr.clone()));
    }

    let mut new_index = vec![None; instructions.len()];
    for (i, (pc, _)) in kept.iter().enumerate() {
        new_index[*pc] = Some(i);
    }
    let trap = kept.len();
    let remap = |target: usize| new_index.get(target).copied().flatten().unwrap_or(trap);
    let needs_trap = kept
        .iter()
        .flat_map(|(_, instr)| instr.targets())
        .any(|target| remap(target) == trap);
    let mut result: Vec<L2Instruction> = kept
        .iter()
        .map(|(_, instr)| instr.with_remapped_targets(remap))
        .collect();
    if needs_trap {
        result.push(L2Instruction::new(L2Operation::Unreachable, vec![]));
    }
    tracing::trace!(
        removed = report.removed,
        folded = report.folded_tests,
        "simplified level-two code"
    );
    (result, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::SpecialObjects;

    fn primitives() -> PrimitiveRegistry {
        PrimitiveRegistry::standard(&SpecialObjects::standard())
    }

    fn entry(arg: Type) -> RegisterSet {
        let mut set = RegisterSet::new();
        set.set_type(L2Register::boxed(0), arg);
        set
    }

    /// enter; kind test r0 ∈ integer; fail block; ok block returning r0.
    fn guarded() -> Vec<L2Instruction> {
        let r0 = L2Register::boxed(0);
        let code = L2Register::boxed(1);
        vec![
            L2Instruction::new(L2Operation::EnterChunk, vec![]),
            L2Instruction::new(
                L2Operation::JumpIfKindOfConstant,
                vec![
                    L2Operand::read(r0),
                    L2Operand::Constant(Value::of_type(Type::integer())),
                    L2Operand::Pc(4),
                    L2Operand::Pc(2),
                ],
            ),
            L2Instruction::new(
                L2Operation::MoveConstant,
                vec![L2Operand::Constant(Value::from(10)), L2Operand::write(code)],
            ),
            L2Instruction::new(L2Operation::ReportFailure, vec![L2Operand::read(code)]),
            L2Instruction::new(L2Operation::Return, vec![L2Operand::read(r0)]),
        ]
    }

    #[test]
    fn test_proven_guard_is_folded_and_failure_block_dropped() {
        let code = guarded();
        let flow = TypeFlow::analyze(&code, entry(Type::byte()), &primitives());
        assert!(!flow.is_reachable(2));
        let (simplified, report) = simplify(&code, &flow);
        assert_eq!(report.folded_tests, 1);
        assert_eq!(report.removed, 2);
        assert_eq!(simplified.len(), 3);
        assert_eq!(simplified[1].operation(), L2Operation::Jump);
        assert_eq!(simplified[1].pc(0), 2);
        assert_eq!(simplified[2].operation(), L2Operation::Return);
    }

    #[test]
    fn test_undecided_guard_is_kept() {
        let code = guarded();
        let flow = TypeFlow::analyze(&code, entry(Type::Any), &primitives());
        let (simplified, report) = simplify(&code, &flow);
        assert_eq!(report.folded_tests, 0);
        assert_eq!(simplified.len(), code.len());
        let after = flow.input(4).unwrap();
        assert_eq!(after.type_of(L2Register::boxed(0)), Type::integer());
    }

    #[test]
    fn test_bounded_addition_cannot_overflow() {
        let mut set = RegisterSet::new();
        set.set_type(L2Register::int(0), Type::int_range_i64(1, 10));
        set.set_type(L2Register::int(1), Type::int_range_i64(-5, 5));
        let add = L2Instruction::new(
            L2Operation::AddIntToInt,
            vec![
                L2Operand::read(L2Register::int(0)),
                L2Operand::read(L2Register::int(1)),
                L2Operand::write(L2Register::int(2)),
                L2Operand::Pc(1),
                L2Operand::Pc(2),
            ],
        );
        let out = propagate_types(&add, &set, &primitives());
        assert!(out[1].is_none());
        let ok = out[0].as_ref().unwrap();
        assert_eq!(ok.type_of(L2Register::int(2)), Type::int_range_i64(-4, 15));

        let mut wide = RegisterSet::new();
        wide.set_type(L2Register::int(0), Type::int64());
        wide.set_type(L2Register::int(1), Type::int_range_i64(1, 1));
        assert!(propagate_types(&add, &wide, &primitives())[1].is_some());
    }

    #[test]
    fn test_dead_edge_targets_trailing_trap() {
        let r0 = L2Register::boxed(0);
        let i0 = L2Register::int(0);
        let code = vec![
            L2Instruction::new(L2Operation::EnterChunk, vec![]),
            L2Instruction::new(
                L2Operation::JumpIfUnboxInt,
                vec![L2Operand::read(r0), L2Operand::write(i0), L2Operand::Pc(2), L2Operand::Pc(3)],
            ),
            L2Instruction::new(L2Operation::Return, vec![L2Operand::read(r0)]),
            L2Instruction::new(L2Operation::Return, vec![L2Operand::read(r0)]),
        ];
        let flow = TypeFlow::analyze(&code, entry(Type::byte()), &primitives());
        let (simplified, _) = simplify(&code, &flow);
        assert_eq!(simplified.len(), 4);
        assert_eq!(simplified[1].pc(3), 3);
        assert_eq!(simplified[3].operation(), L2Operation::Unreachable);
    }
}

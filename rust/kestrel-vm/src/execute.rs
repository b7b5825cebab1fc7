//! Runtime effect of each level-two operation.

use crate::context::VmContext;
use crate::instruction::L2Instruction;
use crate::operation::L2Operation;
use crate::primitive::{InterpreterState, PrimitiveResult};
use crate::register::{L2Register, RegisterFile};
use crate::stats::VmStats;
use kestrel_core::{Continuation, ErrorCode, Function, SpecialObjects, Value, VariableRef};
use kestrel_dispatch::DefinitionBody;
use std::sync::Arc;

/// What the interpreter should do after one instruction.
#[derive(Debug)]
pub enum Step {
    Next,
    Jump(usize),
    /// Push a frame for `function`; its answer goes to `destination`.
    Call {
        function: Arc<Function>,
        args: Vec<Value>,
        destination: L2Register,
    },
    Return(Value),
    Fail(ErrorCode),
    /// The running code became hot: translate it and re-enter.
    Reoptimize,
    InterpretLevelOne,
}

pub struct ExecEnv<'a> {
    pub registers: &'a mut RegisterFile,
    pub function: &'a Arc<Function>,
    pub context: &'a VmContext,
    pub stats: &'a mut VmStats,
}

/// Primitives run inline never need the caller's continuation.
struct InlineState<'a>(&'a SpecialObjects);

impl InterpreterState for InlineState<'_> {
    fn specials(&self) -> &SpecialObjects {
        self.0
    }

    fn reify_caller(&self) -> Option<Arc<Continuation>> {
        None
    }
}

fn floor_div_i64(a: i64, b: i64) -> Option<i64> {
    let q = a.checked_div(b)?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        q.checked_sub(1)
    } else {
        Some(q)
    }
}

fn vector_values(instr: &L2Instruction, index: usize, registers: &RegisterFile) -> Vec<Value> {
    instr
        .vector(index)
        .iter()
        .map(|r| registers.boxed(*r).clone())
        .collect()
}

fn run_inline_primitive(instr: &L2Instruction, env: &mut ExecEnv<'_>) -> PrimitiveResult {
    let number = instr.primitive(0);
    let args = vector_values(instr, 1, env.registers);
    env.stats.primitive_attempts += 1;
    let Some(primitive) = env.context.primitives.get(number) else {
        panic!("{} names unknown primitive {}", instr, number);
    };
    let result = primitive.attempt(&args, &InlineState(&env.context.specials));
    if let PrimitiveResult::Failure(_) = result {
        env.stats.primitive_failures += 1;
    }
    result
}

pub fn execute(instr: &L2Instruction, env: &mut ExecEnv<'_>) -> Step {
    let regs = &mut *env.registers;
    match instr.operation() {
        L2Operation::EnterChunk | L2Operation::Label => Step::Next,
        L2Operation::MoveConstant => {
            regs.set_boxed(instr.write_register(1), instr.constant(0).clone());
            Step::Next
        }
        L2Operation::MoveIntConstant => {
            regs.set_int(instr.write_register(1), instr.immediate(0));
            Step::Next
        }
        L2Operation::MoveFloatConstant => {
            let Some(f) = instr.constant(0).as_float() else {
                panic!("{} needs a float constant", instr);
            };
            regs.set_float(instr.write_register(1), f);
            Step::Next
        }
        L2Operation::Move => {
            let value = regs.boxed(instr.read_register(0)).clone();
            regs.set_boxed(instr.write_register(1), value);
            Step::Next
        }
        L2Operation::MoveOuter => {
            let index = instr.immediate(0) as usize;
            let Some(value) = env.function.outer(index) else {
                panic!("{} reads missing outer {}", instr, index);
            };
            regs.set_boxed(instr.write_register(1), value.clone());
            Step::Next
        }
        L2Operation::BoxInt => {
            let n = regs.int(instr.read_register(0));
            regs.set_boxed(instr.write_register(1), Value::from(n));
            Step::Next
        }
        L2Operation::JumpIfUnboxInt => match regs.boxed(instr.read_register(0)).as_i64() {
            Some(n) => {
                regs.set_int(instr.write_register(1), n);
                Step::Jump(instr.pc(2))
            }
            None => Step::Jump(instr.pc(3)),
        },
        L2Operation::BoxFloat => {
            let f = regs.float(instr.read_register(0));
            regs.set_boxed(instr.write_register(1), Value::from(f));
            Step::Next
        }
        L2Operation::JumpIfUnboxFloat => match regs.boxed(instr.read_register(0)).as_float() {
            Some(f) => {
                regs.set_float(instr.write_register(1), f);
                Step::Jump(instr.pc(2))
            }
            None => Step::Jump(instr.pc(3)),
        },
        op @ (L2Operation::AddIntToInt
        | L2Operation::SubtractIntFromInt
        | L2Operation::MultiplyIntByInt
        | L2Operation::DivideIntByInt) => {
            let a = regs.int(instr.read_register(0));
            let b = regs.int(instr.read_register(1));
            let result = match op {
                L2Operation::AddIntToInt => a.checked_add(b),
                L2Operation::SubtractIntFromInt => a.checked_sub(b),
                L2Operation::MultiplyIntByInt => a.checked_mul(b),
                _ => floor_div_i64(a, b),
            };
            match result {
                Some(n) => {
                    regs.set_int(instr.write_register(2), n);
                    Step::Jump(instr.pc(3))
                }
                None => Step::Jump(instr.pc(4)),
            }
        }
        L2Operation::AddFloatToFloat => {
            let sum = regs.float(instr.read_register(0)) + regs.float(instr.read_register(1));
            regs.set_float(instr.write_register(2), sum);
            Step::Next
        }
        L2Operation::JumpIfLessThanInt => {
            if regs.int(instr.read_register(0)) < regs.int(instr.read_register(1)) {
                Step::Jump(instr.pc(2))
            } else {
                Step::Jump(instr.pc(3))
            }
        }
        L2Operation::Jump => Step::Jump(instr.pc(0)),
        L2Operation::JumpIfKindOfConstant => {
            let Some(ty) = instr.constant(1).as_type() else {
                panic!("{} needs a type constant", instr);
            };
            if ty.contains(regs.boxed(instr.read_register(0))) {
                Step::Jump(instr.pc(2))
            } else {
                Step::Jump(instr.pc(3))
            }
        }
        L2Operation::JumpIfEqualsConstant => {
            if regs.boxed(instr.read_register(0)) == instr.constant(1) {
                Step::Jump(instr.pc(2))
            } else {
                Step::Jump(instr.pc(3))
            }
        }
        L2Operation::CreateTuple => {
            let items = vector_values(instr, 0, regs);
            regs.set_boxed(instr.write_register(1), Value::tuple(items));
            Step::Next
        }
        L2Operation::TupleAtConstant => {
            let Some(items) = regs.boxed(instr.read_register(0)).as_tuple() else {
                return Step::Fail(ErrorCode::IncorrectArgumentType);
            };
            let index = instr.immediate(1);
            let item = usize::try_from(index)
                .ok()
                .and_then(|i| i.checked_sub(1))
                .and_then(|i| items.get(i))
                .cloned();
            match item {
                Some(item) => {
                    regs.set_boxed(instr.write_register(2), item);
                    Step::Next
                }
                None => Step::Fail(ErrorCode::SubscriptOutOfBounds),
            }
        }
        L2Operation::CreateVariable => {
            let Some(ty) = instr.constant(0).as_type() else {
                panic!("{} needs a type constant", instr);
            };
            let var = VariableRef::new(ty.clone());
            regs.set_boxed(instr.write_register(1), Value::Variable(var));
            Step::Next
        }
        L2Operation::GetVariable => {
            let Some(var) = regs.boxed(instr.read_register(0)).as_variable() else {
                return Step::Fail(ErrorCode::IncorrectArgumentType);
            };
            match var.get() {
                Ok(value) => {
                    regs.set_boxed(instr.write_register(1), value);
                    Step::Next
                }
                Err(code) => Step::Fail(code),
            }
        }
        L2Operation::SetVariable => {
            let Some(var) = regs.boxed(instr.read_register(0)).as_variable() else {
                return Step::Fail(ErrorCode::IncorrectArgumentType);
            };
            match var.set(regs.boxed(instr.read_register(1)).clone()) {
                Ok(()) => Step::Next,
                Err(code) => Step::Fail(code),
            }
        }
        L2Operation::CreateFunction => {
            let Value::Code(code) = instr.constant(0) else {
                panic!("{} needs a code constant", instr);
            };
            let outers = vector_values(instr, 1, regs);
            let function = Function::new(code.clone(), outers);
            regs.set_boxed(instr.write_register(2), Value::Function(Arc::new(function)));
            Step::Next
        }
        L2Operation::LookupByValues => {
            let selector = instr.selector(0);
            let args = vector_values(instr, 1, regs);
            match selector.cache.lookup(&selector.method, &args) {
                Ok(definition) => match definition.body() {
                    DefinitionBody::Method(f) => {
                        regs.set_boxed(instr.write_register(2), Value::Function(f.clone()));
                        Step::Next
                    }
                    DefinitionBody::Forward => Step::Fail(ErrorCode::ForwardMethodDefinition),
                    DefinitionBody::Abstract => Step::Fail(ErrorCode::AbstractMethodDefinition),
                },
                Err(e) => Step::Fail(e.error_code()),
            }
        }
        L2Operation::Invoke => {
            let Some(function) = regs.boxed(instr.read_register(0)).as_function().cloned() else {
                return Step::Fail(ErrorCode::IncorrectArgumentType);
            };
            Step::Call {
                function,
                args: vector_values(instr, 1, regs),
                destination: instr.write_register(2),
            }
        }
        L2Operation::InvokeConstantFunction => {
            let Some(function) = instr.constant(0).as_function().cloned() else {
                panic!("{} needs a function constant", instr);
            };
            Step::Call {
                function,
                args: vector_values(instr, 1, regs),
                destination: instr.write_register(2),
            }
        }
        L2Operation::RunInfalliblePrimitive => match run_inline_primitive(instr, env) {
            PrimitiveResult::Success(value) => {
                env.registers.set_boxed(instr.write_register(2), value);
                Step::Next
            }
            PrimitiveResult::Failure(code) => Step::Fail(code),
            other => panic!("inline primitive {} answered {:?}", instr, other),
        },
        L2Operation::AttemptPrimitive => match run_inline_primitive(instr, env) {
            PrimitiveResult::Success(value) => {
                env.registers.set_boxed(instr.write_register(2), value);
                Step::Next
            }
            PrimitiveResult::Failure(_) => Step::Jump(instr.pc(3)),
            other => panic!("inline primitive {} answered {:?}", instr, other),
        },
        L2Operation::Phi => {
            let Some(value) = instr
                .vector(0)
                .iter()
                .find_map(|r| regs.boxed_if_written(*r))
                .cloned()
            else {
                panic!("{} found no written source", instr);
            };
            regs.set_boxed(instr.write_register(1), value);
            Step::Next
        }
        L2Operation::Return => Step::Return(regs.boxed(instr.read_register(0)).clone()),
        L2Operation::ReportFailure => {
            let code = regs
                .boxed(instr.read_register(0))
                .as_i64()
                .and_then(|n| u32::try_from(n).ok())
                .and_then(ErrorCode::from_code)
                .unwrap_or(ErrorCode::IncorrectArgumentType);
            Step::Fail(code)
        }
        L2Operation::DecrementCounterAndReoptimize => {
            if env.context.config.optimize
                && env.context.chunks.countdown(env.function.code().id())
            {
                Step::Reoptimize
            } else {
                Step::Next
            }
        }
        L2Operation::InterpretLevelOne => Step::InterpretLevelOne,
        L2Operation::Unreachable => panic!("reached unreachable instruction"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_division() {
        assert_eq!(floor_div_i64(7, 2), Some(3));
        assert_eq!(floor_div_i64(-7, 2), Some(-4));
        assert_eq!(floor_div_i64(7, -2), Some(-4));
        assert_eq!(floor_div_i64(-8, 2), Some(-4));
        assert_eq!(floor_div_i64(1, 0), None);
        assert_eq!(floor_div_i64(i64::MIN, -1), None);
    }
}

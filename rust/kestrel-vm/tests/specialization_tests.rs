//! End-to-end tests: level-one code run through the interpreter, translated
//! into level-two chunks, and invalidated by method changes.

use kestrel_core::{
    AtomRef, CompiledCode, Continuation, ErrorCode, Function, L1Instruction, Type, Value,
};
use kestrel_dispatch::Definition;
use kestrel_vm::primitive::numbers;
use kestrel_vm::{
    Interpreter, L2Operation, RunOutcome, SuspendRequest, Translator, VmConfig, VmContext, VmError,
};
use std::sync::Arc;
use std::time::Duration;

fn context(threshold: u32) -> Arc<VmContext> {
    VmContext::new(VmConfig {
        reoptimize_threshold: threshold,
        ..VmConfig::default()
    })
}

/// `name(args…)` answering `message` applied to its arguments.
fn caller(name: &str, args: Vec<Type>, message: &AtomRef, expected: Type) -> Arc<Function> {
    let arity = args.len() as u32;
    let code = CompiledCode::builder(name, args, Type::Top)
        .literal(Value::Atom(message.clone()))
        .literal(Value::of_type(expected))
        .instructions((0..arity).map(L1Instruction::PushLocal))
        .instruction(L1Instruction::Call {
            message: 0,
            arity,
            expected: 1,
        })
        .instruction(L1Instruction::Return)
        .build()
        .unwrap();
    Function::from_code(Arc::new(code))
}

fn constant_body(name: &str, args: Vec<Type>, answer: Value) -> Arc<Function> {
    let code = CompiledCode::builder(name, args, Type::Top)
        .literal(answer)
        .instruction(L1Instruction::PushLiteral(0))
        .instruction(L1Instruction::Return)
        .build()
        .unwrap();
    Function::from_code(Arc::new(code))
}

fn define(context: &VmContext, name: &AtomRef, function: Arc<Function>) {
    context
        .methods
        .add_definition(name, Definition::method(None, function))
        .unwrap();
}

fn primitive(context: &VmContext, number: u16) -> Arc<Function> {
    context.primitives.function(number).unwrap()
}

fn operations(function: &Function, context: &VmContext) -> Vec<L2Operation> {
    Translator::translate(context, function.code().clone())
        .unwrap()
        .instructions()
        .iter()
        .map(|i| i.operation())
        .collect()
}

#[test]
fn test_new_definition_invalidates_specialized_caller() {
    let context = context(2);
    let f = AtomRef::new("f_", None);
    define(&context, &f, constant_body("f [1..10]", vec![Type::int_range_i64(1, 10)], Value::from(1)));
    let main = caller("main", vec![Type::int_range_i64(1, 10)], &f, Type::Top);
    let mut interpreter = Interpreter::new(context.clone());

    for _ in 0..3 {
        assert_eq!(interpreter.call(main.clone(), vec![Value::from(5)]).unwrap(), Value::from(1));
    }
    let before = interpreter.stats();
    assert!(before.reoptimizations >= 1);
    assert!(before.optimized_chunk_entries >= 1);
    assert!(context.chunks.optimized_handle(main.code().id()).is_some());

    define(&context, &f, constant_body("f [5..5]", vec![Type::int_range_i64(5, 5)], Value::from(2)));
    assert!(context.chunks.invalidation_count() >= 1);

    let answer = interpreter.call(main.clone(), vec![Value::from(5)]).unwrap();
    assert_eq!(answer, Value::from(2));
    let after = interpreter.stats();
    assert_eq!(after.invalidated_entries, before.invalidated_entries + 1);
    assert!(after.default_chunk_entries > before.default_chunk_entries);
    assert_eq!(interpreter.call(main, vec![Value::from(3)]).unwrap(), Value::from(1));
}

#[test]
fn test_constant_arguments_fold_at_translation() {
    let context = context(1);
    let plus = AtomRef::new("_+_", None);
    define(&context, &plus, primitive(&context, numbers::ADD_INTEGERS));
    let code = CompiledCode::builder("main", vec![], Type::Top)
        .literal(Value::from(2))
        .literal(Value::from(3))
        .literal(Value::Atom(plus.clone()))
        .literal(Value::of_type(Type::Top))
        .instructions([
            L1Instruction::PushLiteral(0),
            L1Instruction::PushLiteral(1),
            L1Instruction::Call {
                message: 2,
                arity: 2,
                expected: 3,
            },
            L1Instruction::Return,
        ])
        .build()
        .unwrap();
    let main = Function::from_code(Arc::new(code));

    let ops = operations(&main, &context);
    assert!(!ops.iter().any(|op| matches!(
        op,
        L2Operation::InvokeConstantFunction | L2Operation::AddIntToInt | L2Operation::RunInfalliblePrimitive
    )));
    assert_eq!(ops.last(), Some(&L2Operation::Return));

    let mut interpreter = Interpreter::new(context);
    assert_eq!(interpreter.call(main, vec![]).unwrap(), Value::from(5));
}

#[test]
fn test_bounded_addition_drops_overflow_path() {
    let context = context(1);
    let plus = AtomRef::new("_+_", None);
    define(&context, &plus, primitive(&context, numbers::ADD_INTEGERS));
    let small = Type::int_range_i64(1, 10);
    let main = caller("main", vec![small.clone(), small], &plus, Type::Top);

    let ops = operations(&main, &context);
    assert!(ops.contains(&L2Operation::AddIntToInt));
    assert!(!ops.contains(&L2Operation::InvokeConstantFunction));

    let mut interpreter = Interpreter::new(context);
    let answer = interpreter.call(main, vec![Value::from(3), Value::from(4)]).unwrap();
    assert_eq!(answer, Value::from(7));
    assert_eq!(interpreter.stats().reoptimizations, 1);
}

#[test]
fn test_unbounded_addition_keeps_slow_path() {
    let context = context(1);
    let plus = AtomRef::new("_+_", None);
    define(&context, &plus, primitive(&context, numbers::ADD_INTEGERS));
    let main = caller("main", vec![Type::int64(), Type::int64()], &plus, Type::Top);

    let ops = operations(&main, &context);
    assert!(ops.contains(&L2Operation::AddIntToInt));
    assert!(ops.contains(&L2Operation::InvokeConstantFunction));
    assert!(ops.contains(&L2Operation::Phi));

    let mut interpreter = Interpreter::new(context);
    let answer = interpreter
        .call(main, vec![Value::from(i64::MAX), Value::from(1)])
        .unwrap();
    assert_eq!(answer, Value::from(num_bigint::BigInt::from(i64::MAX) + 1));
}

#[test]
fn test_proven_result_needs_no_guard() {
    let context = context(1);
    let plus = AtomRef::new("_+_", None);
    define(&context, &plus, primitive(&context, numbers::ADD_INTEGERS));
    let byte = Type::byte();
    let guarded = caller("guarded", vec![byte.clone(), byte.clone()], &plus, Type::int_range_i64(0, 100));
    let proven = caller("proven", vec![byte.clone(), byte], &plus, Type::integer());

    assert!(operations(&guarded, &context).contains(&L2Operation::JumpIfKindOfConstant));
    assert!(!operations(&proven, &context).contains(&L2Operation::JumpIfKindOfConstant));

    let mut interpreter = Interpreter::new(context);
    let err = interpreter
        .call(guarded.clone(), vec![Value::from(200), Value::from(1)])
        .unwrap_err();
    assert_eq!(err, VmError::Failed(ErrorCode::ResultTypeMismatch));
    assert_eq!(
        interpreter.call(guarded, vec![Value::from(20), Value::from(1)]).unwrap(),
        Value::from(21)
    );
}

#[test]
fn test_polymorphic_site_looks_up_by_value() {
    let context = context(1);
    let f = AtomRef::new("f_", None);
    define(&context, &f, constant_body("f integer", vec![Type::integer()], Value::from("int")));
    define(&context, &f, constant_body("f string", vec![Type::String], Value::from("str")));
    let main = caller("main", vec![Type::Any], &f, Type::Top);

    let ops = operations(&main, &context);
    assert!(ops.contains(&L2Operation::LookupByValues));
    assert!(ops.contains(&L2Operation::Invoke));

    let mut interpreter = Interpreter::new(context);
    assert_eq!(interpreter.call(main.clone(), vec![Value::from(1)]).unwrap(), Value::from("int"));
    assert_eq!(interpreter.call(main.clone(), vec![Value::from("x")]).unwrap(), Value::from("str"));
    let err = interpreter.call(main, vec![Value::from(1.5)]).unwrap_err();
    assert_eq!(err.error_code(), Some(ErrorCode::NoMethodDefinition));
}

#[test]
fn test_failed_primitive_runs_fallback_code() {
    let context = context(1);
    let div = AtomRef::new("_÷_", None);
    let code = CompiledCode::builder("divide", vec![Type::integer(), Type::integer()], Type::integer())
        .primitive(numbers::DIVIDE_INTEGERS)
        .locals(1)
        .instructions([L1Instruction::PushLocal(2), L1Instruction::Return])
        .build()
        .unwrap();
    define(&context, &div, Function::from_code(Arc::new(code)));
    let main = caller(
        "main",
        vec![Type::int_range_i64(-10, 10), Type::int_range_i64(0, 3)],
        &div,
        Type::Top,
    );

    let ops = operations(&main, &context);
    assert!(ops.contains(&L2Operation::DivideIntByInt));
    assert!(ops.contains(&L2Operation::InvokeConstantFunction));

    let mut interpreter = Interpreter::new(context);
    assert_eq!(
        interpreter.call(main.clone(), vec![Value::from(-7), Value::from(2)]).unwrap(),
        Value::from(-4)
    );
    assert_eq!(
        interpreter.call(main, vec![Value::from(7), Value::from(0)]).unwrap(),
        ErrorCode::CannotDivideByZero.as_value()
    );
    assert_eq!(interpreter.stats().primitive_failures, 1);
}

#[test]
fn test_level_one_checks_declared_result() {
    let context = VmContext::new(VmConfig {
        optimize: false,
        ..VmConfig::default()
    });
    let g = AtomRef::new("g", None);
    define(&context, &g, constant_body("g", vec![], Value::from("text")));
    let main = caller("main", vec![], &g, Type::integer());
    let mut interpreter = Interpreter::new(context);
    let err = interpreter.call(main, vec![]).unwrap_err();
    assert_eq!(err, VmError::Failed(ErrorCode::ResultTypeMismatch));
    assert_eq!(interpreter.stats().l2_instructions, 0);
    assert_eq!(interpreter.depth(), 0);
}

#[test]
fn test_ambiguous_and_missing_methods_differ() {
    let context = context(10);
    let h = AtomRef::new("h__", None);
    let pair = |a: Type, b: Type| vec![a, b];
    define(&context, &h, constant_body("h1", pair(Type::natural_number(), Type::integer()), Value::from(1)));
    define(&context, &h, constant_body("h2", pair(Type::integer(), Type::natural_number()), Value::from(2)));
    let main = caller("main", pair(Type::integer(), Type::integer()), &h, Type::Top);
    let mut interpreter = Interpreter::new(context.clone());

    let err = interpreter.call(main.clone(), vec![Value::from(1), Value::from(1)]).unwrap_err();
    assert_eq!(err.error_code(), Some(ErrorCode::AmbiguousMethodDefinition));
    let err = interpreter.call(main.clone(), vec![Value::from(-1), Value::from(-1)]).unwrap_err();
    assert_eq!(err.error_code(), Some(ErrorCode::NoMethodDefinition));
    assert_eq!(interpreter.call(main, vec![Value::from(1), Value::from(-1)]).unwrap(), Value::from(1));

    let nothing = AtomRef::new("nothing", None);
    let empty = caller("empty", vec![], &nothing, Type::Top);
    let err = interpreter.call(empty, vec![]).unwrap_err();
    assert_eq!(err.error_code(), Some(ErrorCode::NoMethodDefinition));
}

#[test]
fn test_runaway_recursion_overflows() {
    let context = VmContext::new(VmConfig {
        max_call_depth: 50,
        ..VmConfig::default()
    });
    let spin = AtomRef::new("spin_", None);
    define(&context, &spin, caller("spin", vec![Type::integer()], &spin, Type::Top));
    let main = caller("main", vec![Type::integer()], &spin, Type::Top);
    let mut interpreter = Interpreter::new(context);
    let err = interpreter.call(main, vec![Value::from(0)]).unwrap_err();
    assert_eq!(err, VmError::StackOverflow(50));
    assert_eq!(err.error_code(), None);
}

#[test]
fn test_suspension_resumes_with_answer() {
    let context = context(10);
    let sleep = AtomRef::new("sleep_", None);
    define(&context, &sleep, primitive(&context, numbers::SLEEP));
    let main = caller("main", vec![Type::whole_number()], &sleep, Type::Top);
    let mut interpreter = Interpreter::new(context);

    interpreter.start(main.clone(), vec![Value::from(25)]);
    let outcome = interpreter.run().unwrap();
    assert_eq!(outcome, RunOutcome::Suspended(SuspendRequest::Sleep(Duration::from_millis(25))));
    assert!(interpreter.is_suspended());
    assert_eq!(interpreter.run(), Err(VmError::Idle));
    assert!(interpreter.is_suspended());

    interpreter.resume(Value::from(9)).unwrap();
    assert_eq!(interpreter.run().unwrap(), RunOutcome::Completed(Value::from(9)));
    assert_eq!(interpreter.resume(Value::Nil), Err(VmError::NotSuspended));

    interpreter.start(main, vec![Value::from(1_000)]);
    assert!(matches!(interpreter.run().unwrap(), RunOutcome::Suspended(_)));
    interpreter.request_termination();
    interpreter.resume(Value::Nil).unwrap();
    let err = interpreter.run().unwrap_err();
    assert_eq!(err, VmError::Terminated);
    assert_eq!(err.error_code(), Some(ErrorCode::FiberTerminated));
}

#[test]
fn test_current_continuation_names_caller() {
    let context = context(10);
    let here = AtomRef::new("here", None);
    define(&context, &here, primitive(&context, numbers::CURRENT_CONTINUATION));
    let main = caller("main", vec![], &here, Type::Top);
    let mut interpreter = Interpreter::new(context);

    let answer = interpreter.call(main.clone(), vec![]).unwrap();
    let Value::Continuation(continuation) = answer else {
        panic!("expected a continuation, got {answer:?}");
    };
    assert!(Arc::ptr_eq(continuation.function(), &main));
    assert_eq!(continuation.depth(), 1);
    assert_eq!(continuation.pc(), 1);
}

#[test]
fn test_restart_rejects_continuation_missing_its_arguments() {
    let context = context(10);
    let restart = primitive(&context, numbers::RESTART_CONTINUATION);
    let body = constant_body("one", vec![Type::Top], Value::from(1));
    let mut interpreter = Interpreter::new(context);

    let short = Continuation::new(None, body.clone(), 0, vec![]);
    let err = interpreter
        .call(restart.clone(), vec![Value::Continuation(Arc::new(short))])
        .unwrap_err();
    assert_eq!(err, VmError::Failed(ErrorCode::IncorrectArgumentType));

    let whole = Continuation::new(None, body, 0, vec![Value::from(7)]);
    let answer = interpreter
        .call(restart, vec![Value::Continuation(Arc::new(whole))])
        .unwrap();
    assert_eq!(answer, Value::from(1));
}

#[test]
fn test_call_site_does_not_fix_arity_of_undefined_method() {
    let context = context(10);
    let g = AtomRef::new("g", None);
    let main = caller("main", vec![Type::integer(), Type::integer()], &g, Type::Top);
    // Translating the call site creates `g` empty, so its first definition
    // invalidates the chunk.
    operations(&main, &context);
    let empty = context.methods.method(&g).unwrap();
    assert_eq!(empty.definition_count(), 0);
    let mut interpreter = Interpreter::new(context.clone());
    let err = interpreter.call(main.clone(), vec![Value::from(1), Value::from(2)]).unwrap_err();
    assert_eq!(err.error_code(), Some(ErrorCode::NoMethodDefinition));

    define(&context, &g, constant_body("g", vec![Type::integer()], Value::from(3)));
    assert_eq!(empty.num_args(), 1);
    let unary = caller("unary", vec![Type::integer()], &g, Type::Top);
    assert_eq!(interpreter.call(unary, vec![Value::from(4)]).unwrap(), Value::from(3));
    assert!(interpreter.call(main, vec![Value::from(1), Value::from(2)]).is_err());
}

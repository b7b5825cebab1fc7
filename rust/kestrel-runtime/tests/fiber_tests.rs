//! Fibers run on the work-stealing scheduler: sleeping, yielding,
//! termination and failure, plus capturing a sleeping fiber's stack.

use kestrel_core::{AtomRef, CompiledCode, ErrorCode, Function, L1Instruction, Type, Value};
use kestrel_dispatch::Definition;
use kestrel_runtime::{from_bytes, to_bytes, FiberState, Scheduler, SchedulerConfig};
use kestrel_vm::primitive::numbers;
use kestrel_vm::{VmConfig, VmContext, VmError};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn context(optimize: bool) -> Arc<VmContext> {
    VmContext::new(VmConfig {
        optimize,
        ..VmConfig::default()
    })
}

fn scheduler(context: Arc<VmContext>) -> Scheduler {
    Scheduler::new(context, &SchedulerConfig { workers: 2 }).unwrap()
}

/// Binds `name` to the primitive `number` and answers the atom.
fn define_primitive(context: &VmContext, name: &str, number: u16) -> AtomRef {
    let atom = AtomRef::new(name, None);
    let function = context.primitives.function(number).unwrap();
    context
        .methods
        .add_definition(&atom, Definition::method(None, function))
        .unwrap();
    atom
}

/// Sends `message` with `args` as literals, drops the answer, then answers
/// `answer`.
fn then_answer(message: &AtomRef, args: Vec<Value>, answer: i64) -> Arc<Function> {
    let arity = args.len() as u32;
    let mut builder = CompiledCode::builder("then answer", vec![], Type::integer())
        .literal(Value::Atom(message.clone()))
        .literal(Value::of_type(Type::Top))
        .literal(Value::from(answer));
    for arg in args {
        builder = builder.literal(arg);
    }
    let code = builder
        .instructions((0..arity).map(|i| L1Instruction::PushLiteral(3 + i)))
        .instructions([
            L1Instruction::Call {
                message: 0,
                arity,
                expected: 1,
            },
            L1Instruction::Pop,
            L1Instruction::PushLiteral(2),
            L1Instruction::Return,
        ])
        .build()
        .unwrap();
    Function::from_code(Arc::new(code))
}

fn wait_for_state(fiber: &kestrel_runtime::Fiber, state: FiberState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while fiber.state() != state {
        assert!(Instant::now() < deadline, "fiber stuck in {}", fiber.state());
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_sleeping_fiber_completes_after_its_deadline() {
    let context = context(true);
    let sleep = define_primitive(&context, "sleep", numbers::SLEEP);
    let sched = scheduler(context);
    let started = Instant::now();
    let fiber = sched.spawn(then_answer(&sleep, vec![Value::from(30)], 42), vec![]);
    assert_eq!(fiber.join_timeout(Duration::from_secs(5)), Some(Ok(Value::from(42))));
    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(fiber.state(), FiberState::Completed);
}

#[test]
fn test_sleep_primitive_alone_answers_nil() {
    let context = context(true);
    let sleep = context.primitives.function(numbers::SLEEP).unwrap();
    let sched = scheduler(context);
    let fiber = sched.spawn(sleep, vec![Value::from(1)]);
    assert_eq!(fiber.join_timeout(Duration::from_secs(5)), Some(Ok(Value::Nil)));
}

#[test]
fn test_yielding_fibers_all_finish() {
    let context = context(true);
    let yield_atom = define_primitive(&context, "yield", numbers::YIELD);
    let sched = scheduler(context);
    let fibers: Vec<_> = (0..50)
        .map(|i| sched.spawn(then_answer(&yield_atom, vec![], i), vec![]))
        .collect();
    assert_eq!(sched.wait_for_completion(50, Duration::from_secs(10)), 50);
    for (i, fiber) in fibers.iter().enumerate() {
        assert_eq!(fiber.result(), Some(Ok(Value::from(i as i64))));
    }
}

#[test]
fn test_terminating_a_sleeper_wakes_it() {
    let context = context(true);
    let sleep = define_primitive(&context, "sleep", numbers::SLEEP);
    let sched = scheduler(context);
    let fiber = sched.spawn(then_answer(&sleep, vec![Value::from(600_000)], 1), vec![]);
    wait_for_state(&fiber, FiberState::Suspended);

    let requested = Instant::now();
    assert!(sched.terminate(fiber.id()));
    assert_eq!(
        fiber.join_timeout(Duration::from_secs(5)),
        Some(Err(VmError::Terminated))
    );
    assert!(requested.elapsed() < Duration::from_secs(5));
    assert_eq!(fiber.state(), FiberState::Terminated);
}

#[test]
fn test_failing_primitive_fails_the_fiber() {
    let context = context(true);
    let divide = context.primitives.function(numbers::DIVIDE_INTEGERS).unwrap();
    let sched = scheduler(context);
    let fiber = sched.spawn(divide, vec![Value::from(1), Value::from(0)]);
    assert_eq!(
        fiber.join_timeout(Duration::from_secs(5)),
        Some(Err(VmError::Failed(ErrorCode::CannotDivideByZero)))
    );
    assert_eq!(fiber.state(), FiberState::Failed);
    assert_eq!(sched.wait_for_completion(1, Duration::from_secs(5)), 1);
}

#[test]
fn test_sleeping_fiber_stack_survives_serialization() {
    let context = context(false);
    let sleep = define_primitive(&context, "sleep", numbers::SLEEP);
    let sched = scheduler(context.clone());
    let fiber = sched.spawn(then_answer(&sleep, vec![Value::from(600_000)], 7), vec![]);
    wait_for_state(&fiber, FiberState::Suspended);

    let stack = Value::Continuation(fiber.continuation().unwrap());
    let bytes = to_bytes(std::slice::from_ref(&stack), &context.specials, &context.modules).unwrap();
    let copy = from_bytes(&bytes, &context.specials, &context.modules).unwrap();
    assert_eq!(copy.len(), 1);
    let Value::Continuation(copy) = &copy[0] else {
        panic!("expected a continuation");
    };
    assert_eq!(copy.depth(), 1);
    assert_eq!(copy.function().code().name(), "then answer");

    sched.terminate(fiber.id());
    assert!(fiber.join_timeout(Duration::from_secs(5)).is_some());
}

//! Primitives: numbered built-in operations invoked by primitive-bearing
//! code.
//!
//! The translator reads each primitive's flags to decide whether a call
//! site may be folded at translation time, run inline, or must keep a full
//! call so the interpreter can suspend or replace the continuation.

use kestrel_core::{
    CompiledCode, Continuation, ErrorCode, Function, FunctionType, SpecialObjects, Type, Value,
    VariableRef,
};
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrimitiveFlags {
    /// May be evaluated at translation time when every argument is known.
    pub can_fold: bool,
    /// May run directly from a level-two instruction.
    pub can_inline: bool,
    pub cannot_fail: bool,
    pub has_side_effect: bool,
    /// May suspend the fiber or replace its continuation.
    pub can_suspend: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendRequest {
    Sleep(Duration),
    Yield,
}

#[derive(Debug, Clone)]
pub enum PrimitiveResult {
    Success(Value),
    Failure(ErrorCode),
    Suspended(SuspendRequest),
    /// Abandon the current frames and continue from this continuation.
    ContinuationChanged(Arc<Continuation>),
}

/// What a primitive may ask of the interpreter running it.
pub trait InterpreterState {
    fn specials(&self) -> &SpecialObjects;

    /// The continuation of the frame that invoked the primitive, if the
    /// interpreter can provide one here.
    fn reify_caller(&self) -> Option<Arc<Continuation>>;
}

pub trait Primitive: Send + Sync {
    fn name(&self) -> &'static str;
    fn number(&self) -> u16;
    fn block_type(&self) -> &FunctionType;
    fn flags(&self) -> PrimitiveFlags;
    fn attempt(&self, args: &[Value], state: &dyn InterpreterState) -> PrimitiveResult;

    /// The result type given static argument types. Never wider than the
    /// declared block type's result.
    fn return_type_for(&self, _arg_types: &[Type]) -> Type {
        self.block_type().result.clone()
    }
}

type AttemptFn = fn(&[Value], &dyn InterpreterState) -> PrimitiveResult;
type ReturnTypeFn = fn(&[Type], &FunctionType) -> Type;

/// A primitive defined by a pair of plain functions.
struct StandardPrimitive {
    number: u16,
    name: &'static str,
    block_type: FunctionType,
    flags: PrimitiveFlags,
    attempt: AttemptFn,
    return_type: Option<ReturnTypeFn>,
}

impl Primitive for StandardPrimitive {
    fn name(&self) -> &'static str {
        self.name
    }

    fn number(&self) -> u16 {
        self.number
    }

    fn block_type(&self) -> &FunctionType {
        &self.block_type
    }

    fn flags(&self) -> PrimitiveFlags {
        self.flags
    }

    fn attempt(&self, args: &[Value], state: &dyn InterpreterState) -> PrimitiveResult {
        if args.len() != self.block_type.args.len() {
            return PrimitiveResult::Failure(ErrorCode::IncorrectNumberOfArguments);
        }
        (self.attempt)(args, state)
    }

    fn return_type_for(&self, arg_types: &[Type]) -> Type {
        match self.return_type {
            Some(f) => f(arg_types, &self.block_type).intersection(&self.block_type.result),
            None => self.block_type.result.clone(),
        }
    }
}

pub mod numbers {
    pub const ADD_INTEGERS: u16 = 1;
    pub const SUBTRACT_INTEGERS: u16 = 2;
    pub const MULTIPLY_INTEGERS: u16 = 3;
    pub const DIVIDE_INTEGERS: u16 = 4;
    pub const LESS_THAN: u16 = 5;
    pub const TUPLE_SIZE: u16 = 6;
    pub const TUPLE_AT: u16 = 7;
    pub const CREATE_VARIABLE: u16 = 8;
    pub const GET_VARIABLE: u16 = 9;
    pub const SET_VARIABLE: u16 = 10;
    pub const TYPE_OF: u16 = 11;
    pub const IS_INSTANCE_OF: u16 = 12;
    pub const ADD_FLOATS: u16 = 13;
    pub const SLEEP: u16 = 14;
    pub const YIELD: u16 = 15;
    pub const RESTART_CONTINUATION: u16 = 16;
    pub const CURRENT_CONTINUATION: u16 = 17;
}

const PURE: PrimitiveFlags = PrimitiveFlags {
    can_fold: true,
    can_inline: true,
    cannot_fail: true,
    has_side_effect: false,
    can_suspend: false,
};

const PURE_FALLIBLE: PrimitiveFlags = PrimitiveFlags {
    cannot_fail: false,
    ..PURE
};

const EFFECTFUL: PrimitiveFlags = PrimitiveFlags {
    can_fold: false,
    can_inline: true,
    cannot_fail: false,
    has_side_effect: true,
    can_suspend: false,
};

const SUSPENDING: PrimitiveFlags = PrimitiveFlags {
    can_fold: false,
    can_inline: false,
    cannot_fail: false,
    has_side_effect: true,
    can_suspend: true,
};

fn int_pair(args: &[Value]) -> Result<(&BigInt, &BigInt), ErrorCode> {
    match (args[0].as_int(), args[1].as_int()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(ErrorCode::IncorrectArgumentType),
    }
}

fn arithmetic(args: &[Value], op: fn(&BigInt, &BigInt) -> BigInt) -> PrimitiveResult {
    match int_pair(args) {
        Ok((a, b)) => PrimitiveResult::Success(Value::from(op(a, b))),
        Err(code) => PrimitiveResult::Failure(code),
    }
}

fn arithmetic_type(args: &[Type], op: fn(&BigInt, &BigInt) -> BigInt) -> Type {
    match (args[0].as_int_range(), args[1].as_int_range()) {
        (Some(a), Some(b)) => a
            .combine_corners(b, op)
            .map_or_else(Type::integer, Type::Integers),
        _ => Type::integer(),
    }
}

/// Quotient rounded toward negative infinity.
pub fn floor_divide(a: &BigInt, b: &BigInt) -> Option<BigInt> {
    if b.is_zero() {
        return None;
    }
    let quotient = a / b;
    let remainder = a % b;
    if !remainder.is_zero() && (remainder.is_negative() != b.is_negative()) {
        Some(quotient - 1)
    } else {
        Some(quotient)
    }
}

fn add_integers(args: &[Value], _: &dyn InterpreterState) -> PrimitiveResult {
    arithmetic(args, |a, b| a + b)
}

fn subtract_integers(args: &[Value], _: &dyn InterpreterState) -> PrimitiveResult {
    arithmetic(args, |a, b| a - b)
}

fn multiply_integers(args: &[Value], _: &dyn InterpreterState) -> PrimitiveResult {
    arithmetic(args, |a, b| a * b)
}

fn divide_integers(args: &[Value], _: &dyn InterpreterState) -> PrimitiveResult {
    match int_pair(args) {
        Ok((a, b)) => match floor_divide(a, b) {
            Some(q) => PrimitiveResult::Success(Value::from(q)),
            None => PrimitiveResult::Failure(ErrorCode::CannotDivideByZero),
        },
        Err(code) => PrimitiveResult::Failure(code),
    }
}

fn less_than(args: &[Value], state: &dyn InterpreterState) -> PrimitiveResult {
    match int_pair(args) {
        Ok((a, b)) => PrimitiveResult::Success(state.specials().boolean(a < b)),
        Err(code) => PrimitiveResult::Failure(code),
    }
}

fn tuple_size(args: &[Value], _: &dyn InterpreterState) -> PrimitiveResult {
    match args[0].as_tuple() {
        Some(items) => PrimitiveResult::Success(Value::from(items.len() as i64)),
        None => PrimitiveResult::Failure(ErrorCode::IncorrectArgumentType),
    }
}

fn tuple_at(args: &[Value], _: &dyn InterpreterState) -> PrimitiveResult {
    let (Some(items), Some(index)) = (args[0].as_tuple(), args[1].as_int()) else {
        return PrimitiveResult::Failure(ErrorCode::IncorrectArgumentType);
    };
    match index
        .to_usize()
        .and_then(|i| i.checked_sub(1))
        .and_then(|i| items.get(i))
    {
        Some(item) => PrimitiveResult::Success(item.clone()),
        None => PrimitiveResult::Failure(ErrorCode::SubscriptOutOfBounds),
    }
}

fn tuple_at_type(args: &[Type], _: &FunctionType) -> Type {
    match &args[0] {
        Type::Tuple(t) => t
            .leading
            .iter()
            .fold(t.default.clone(), |acc, ty| acc.union(ty)),
        _ => Type::Top,
    }
}

fn create_variable(args: &[Value], _: &dyn InterpreterState) -> PrimitiveResult {
    match args[0].as_type() {
        Some(ty) => PrimitiveResult::Success(Value::Variable(VariableRef::new(ty.clone()))),
        None => PrimitiveResult::Failure(ErrorCode::IncorrectArgumentType),
    }
}

fn create_variable_type(args: &[Type], _: &FunctionType) -> Type {
    match &args[0] {
        Type::Enumeration(set) if set.len() == 1 => set
            .iter()
            .next()
            .and_then(Value::as_type)
            .map_or(Type::Any, |content| Type::variable(content.clone())),
        _ => Type::Any,
    }
}

fn get_variable(args: &[Value], _: &dyn InterpreterState) -> PrimitiveResult {
    match args[0].as_variable() {
        Some(var) => match var.get() {
            Ok(value) => PrimitiveResult::Success(value),
            Err(code) => PrimitiveResult::Failure(code),
        },
        None => PrimitiveResult::Failure(ErrorCode::IncorrectArgumentType),
    }
}

fn get_variable_type(args: &[Type], _: &FunctionType) -> Type {
    match &args[0] {
        Type::Variable(content) => (**content).clone(),
        _ => Type::Top,
    }
}

fn set_variable(args: &[Value], _: &dyn InterpreterState) -> PrimitiveResult {
    match args[0].as_variable() {
        Some(var) => match var.set(args[1].clone()) {
            Ok(()) => PrimitiveResult::Success(Value::Nil),
            Err(code) => PrimitiveResult::Failure(code),
        },
        None => PrimitiveResult::Failure(ErrorCode::IncorrectArgumentType),
    }
}

fn type_of(args: &[Value], _: &dyn InterpreterState) -> PrimitiveResult {
    PrimitiveResult::Success(Value::of_type(args[0].kind()))
}

fn is_instance_of(args: &[Value], state: &dyn InterpreterState) -> PrimitiveResult {
    match args[1].as_type() {
        Some(ty) => PrimitiveResult::Success(state.specials().boolean(ty.contains(&args[0]))),
        None => PrimitiveResult::Failure(ErrorCode::IncorrectArgumentType),
    }
}

fn add_floats(args: &[Value], _: &dyn InterpreterState) -> PrimitiveResult {
    match (args[0].as_float(), args[1].as_float()) {
        (Some(a), Some(b)) => PrimitiveResult::Success(Value::from(a + b)),
        _ => PrimitiveResult::Failure(ErrorCode::IncorrectArgumentType),
    }
}

fn sleep(args: &[Value], _: &dyn InterpreterState) -> PrimitiveResult {
    match args[0].as_int().and_then(|n| n.to_u64()) {
        Some(millis) => {
            PrimitiveResult::Suspended(SuspendRequest::Sleep(Duration::from_millis(millis)))
        }
        None => PrimitiveResult::Failure(ErrorCode::IncorrectArgumentType),
    }
}

fn yield_fiber(_: &[Value], _: &dyn InterpreterState) -> PrimitiveResult {
    PrimitiveResult::Suspended(SuspendRequest::Yield)
}

fn restart_continuation(args: &[Value], _: &dyn InterpreterState) -> PrimitiveResult {
    match &args[0] {
        Value::Continuation(c) => PrimitiveResult::ContinuationChanged(c.clone()),
        _ => PrimitiveResult::Failure(ErrorCode::IncorrectArgumentType),
    }
}

fn current_continuation(_: &[Value], state: &dyn InterpreterState) -> PrimitiveResult {
    match state.reify_caller() {
        Some(c) => PrimitiveResult::Success(Value::Continuation(c)),
        None => PrimitiveResult::Failure(ErrorCode::IncorrectArgumentType),
    }
}

/// Primitives by number.
pub struct PrimitiveRegistry {
    primitives: BTreeMap<u16, Arc<dyn Primitive>>,
}

impl PrimitiveRegistry {
    pub fn new() -> Self {
        PrimitiveRegistry {
            primitives: BTreeMap::new(),
        }
    }

    /// The standard set. Boolean-producing primitives take the boolean type
    /// from `specials`.
    pub fn standard(specials: &SpecialObjects) -> Self {
        use self::numbers::*;
        let int2 = || vec![Type::integer(), Type::integer()];
        let boolean = specials.boolean_type();
        let table = vec![
            StandardPrimitive {
                number: ADD_INTEGERS,
                name: "add integers",
                block_type: FunctionType::new(int2(), Type::integer()),
                flags: PURE,
                attempt: add_integers,
                return_type: Some(|args, _| arithmetic_type(args, |a, b| a + b)),
            },
            StandardPrimitive {
                number: SUBTRACT_INTEGERS,
                name: "subtract integers",
                block_type: FunctionType::new(int2(), Type::integer()),
                flags: PURE,
                attempt: subtract_integers,
                return_type: Some(|args, _| arithmetic_type(args, |a, b| a - b)),
            },
            StandardPrimitive {
                number: MULTIPLY_INTEGERS,
                name: "multiply integers",
                block_type: FunctionType::new(int2(), Type::integer()),
                flags: PURE,
                attempt: multiply_integers,
                return_type: Some(|args, _| arithmetic_type(args, |a, b| a * b)),
            },
            StandardPrimitive {
                number: DIVIDE_INTEGERS,
                name: "divide integers",
                block_type: FunctionType::new(int2(), Type::integer()),
                flags: PURE_FALLIBLE,
                attempt: divide_integers,
                return_type: None,
            },
            StandardPrimitive {
                number: LESS_THAN,
                name: "less than",
                block_type: FunctionType::new(int2(), boolean),
                flags: PURE,
                attempt: less_than,
                return_type: None,
            },
            StandardPrimitive {
                number: TUPLE_SIZE,
                name: "tuple size",
                block_type: FunctionType::new(vec![Type::most_general_tuple()], Type::whole_number()),
                flags: PURE,
                attempt: tuple_size,
                return_type: Some(|args, block| {
                    args[0]
                        .tuple_size_type()
                        .unwrap_or_else(|| block.result.clone())
                }),
            },
            StandardPrimitive {
                number: TUPLE_AT,
                name: "tuple at",
                block_type: FunctionType::new(
                    vec![Type::most_general_tuple(), Type::natural_number()],
                    Type::Top,
                ),
                flags: PURE_FALLIBLE,
                attempt: tuple_at,
                return_type: Some(tuple_at_type),
            },
            StandardPrimitive {
                number: CREATE_VARIABLE,
                name: "create variable",
                block_type: FunctionType::new(vec![Type::meta(Type::Top)], Type::Any),
                flags: PrimitiveFlags {
                    cannot_fail: true,
                    ..EFFECTFUL
                },
                attempt: create_variable,
                return_type: Some(create_variable_type),
            },
            StandardPrimitive {
                number: GET_VARIABLE,
                name: "get variable",
                block_type: FunctionType::new(vec![Type::Any], Type::Top),
                flags: EFFECTFUL,
                attempt: get_variable,
                return_type: Some(get_variable_type),
            },
            StandardPrimitive {
                number: SET_VARIABLE,
                name: "set variable",
                block_type: FunctionType::new(vec![Type::Any, Type::Top], Type::Top),
                flags: EFFECTFUL,
                attempt: set_variable,
                return_type: None,
            },
            StandardPrimitive {
                number: TYPE_OF,
                name: "type of",
                block_type: FunctionType::new(vec![Type::Top], Type::meta(Type::Top)),
                flags: PURE,
                attempt: type_of,
                return_type: None,
            },
            StandardPrimitive {
                number: IS_INSTANCE_OF,
                name: "is instance of",
                block_type: FunctionType::new(
                    vec![Type::Top, Type::meta(Type::Top)],
                    specials.boolean_type(),
                ),
                flags: PURE,
                attempt: is_instance_of,
                return_type: None,
            },
            StandardPrimitive {
                number: ADD_FLOATS,
                name: "add floats",
                block_type: FunctionType::new(vec![Type::Float, Type::Float], Type::Float),
                flags: PURE,
                attempt: add_floats,
                return_type: None,
            },
            StandardPrimitive {
                number: SLEEP,
                name: "sleep",
                block_type: FunctionType::new(vec![Type::whole_number()], Type::Top),
                flags: SUSPENDING,
                attempt: sleep,
                return_type: None,
            },
            StandardPrimitive {
                number: YIELD,
                name: "yield",
                block_type: FunctionType::new(vec![], Type::Top),
                flags: SUSPENDING,
                attempt: yield_fiber,
                return_type: None,
            },
            StandardPrimitive {
                number: RESTART_CONTINUATION,
                name: "restart continuation",
                block_type: FunctionType::new(vec![Type::Any], Type::Bottom),
                flags: SUSPENDING,
                attempt: restart_continuation,
                return_type: None,
            },
            StandardPrimitive {
                number: CURRENT_CONTINUATION,
                name: "current continuation",
                block_type: FunctionType::new(vec![], Type::Any),
                flags: SUSPENDING,
                attempt: current_continuation,
                return_type: None,
            },
        ];
        let mut registry = PrimitiveRegistry::new();
        for primitive in table {
            registry.register(Arc::new(primitive));
        }
        registry
    }

    /// Panics on a duplicate number; the table is fixed at startup.
    pub fn register(&mut self, primitive: Arc<dyn Primitive>) {
        let number = primitive.number();
        let previous = self.primitives.insert(number, primitive);
        assert!(previous.is_none(), "duplicate primitive number {}", number);
    }

    pub fn get(&self, number: u16) -> Option<&Arc<dyn Primitive>> {
        self.primitives.get(&number)
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Primitive>> {
        self.primitives.values()
    }

    /// A function whose code is just the primitive, with no fallback body.
    pub fn function(&self, number: u16) -> Option<Arc<Function>> {
        let primitive = self.get(number)?;
        let block = primitive.block_type();
        let code = CompiledCode::builder(primitive.name(), block.args.clone(), block.result.clone())
            .primitive(number)
            .build()
            .ok()?;
        Some(Function::from_code(Arc::new(code)))
    }
}

impl Default for PrimitiveRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PrimitiveRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.primitives.iter().map(|(n, p)| (n, p.name())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain(SpecialObjects);

    impl InterpreterState for Plain {
        fn specials(&self) -> &SpecialObjects {
            &self.0
        }

        fn reify_caller(&self) -> Option<Arc<Continuation>> {
            None
        }
    }

    fn run(number: u16, args: &[Value]) -> PrimitiveResult {
        let state = Plain(SpecialObjects::standard());
        let registry = PrimitiveRegistry::standard(&state.0);
        registry.get(number).unwrap().attempt(args, &state)
    }

    #[test]
    fn test_standard_set_is_complete() {
        let registry = PrimitiveRegistry::standard(&SpecialObjects::standard());
        assert_eq!(registry.len(), 17);
        for n in 1..=17 {
            assert!(registry.get(n).is_some(), "primitive {}", n);
        }
    }

    #[test]
    fn test_division_floors_and_fails_on_zero() {
        assert!(matches!(
            run(numbers::DIVIDE_INTEGERS, &[Value::from(7), Value::from(0)]),
            PrimitiveResult::Failure(ErrorCode::CannotDivideByZero)
        ));
        match run(numbers::DIVIDE_INTEGERS, &[Value::from(-7), Value::from(2)]) {
            PrimitiveResult::Success(v) => assert_eq!(v, Value::from(-4)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_tuple_at_is_one_based() {
        let tuple = Value::tuple(vec![Value::from(10), Value::from(20)]);
        match run(numbers::TUPLE_AT, &[tuple.clone(), Value::from(2)]) {
            PrimitiveResult::Success(v) => assert_eq!(v, Value::from(20)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            run(numbers::TUPLE_AT, &[tuple, Value::from(3)]),
            PrimitiveResult::Failure(ErrorCode::SubscriptOutOfBounds)
        ));
    }

    #[test]
    fn test_addition_narrows_result_type() {
        let registry = PrimitiveRegistry::standard(&SpecialObjects::standard());
        let add = registry.get(numbers::ADD_INTEGERS).unwrap();
        let ty = add.return_type_for(&[Type::int_range_i64(1, 3), Type::int_range_i64(10, 20)]);
        assert_eq!(ty, Type::int_range_i64(11, 23));
        assert_eq!(
            add.return_type_for(&[Type::integer(), Type::byte()]),
            Type::integer()
        );
    }

    #[test]
    fn test_sleep_requests_suspension() {
        assert!(matches!(
            run(numbers::SLEEP, &[Value::from(5)]),
            PrimitiveResult::Suspended(SuspendRequest::Sleep(d)) if d == Duration::from_millis(5)
        ));
    }
}

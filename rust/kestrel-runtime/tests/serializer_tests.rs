//! Serializer and deserializer behavior on whole streams.

use kestrel_core::{
    AtomRef, CompiledCode, Continuation, Function, L1Instruction, ModuleRegistry, SizeRange,
    SpecialObjects, Type, Value, VariableRef,
};
use kestrel_runtime::{
    describe, from_bytes, to_bytes, Deserializer, Malformed, SerializerError, SerializerOperation,
    Serializer,
};
use num_bigint::BigInt;
use std::sync::Arc;

fn fixtures() -> (SpecialObjects, ModuleRegistry) {
    let modules = ModuleRegistry::new();
    modules.add_module("base", &[]).unwrap();
    modules.add_module("app", &["base"]).unwrap();
    modules.add_module("other", &[]).unwrap();
    (SpecialObjects::standard(), modules)
}

fn round_trip(value: &Value, specials: &SpecialObjects, modules: &ModuleRegistry) -> Value {
    let bytes = to_bytes(std::slice::from_ref(value), specials, modules).unwrap();
    let mut values = from_bytes(&bytes, specials, modules).unwrap();
    assert_eq!(values.len(), 1);
    values.remove(0)
}

fn adder(modules: &ModuleRegistry) -> Arc<Function> {
    let plus = modules.resolve_atom("base", "+").unwrap();
    let code = CompiledCode::builder("adder", vec![Type::integer()], Type::integer())
        .outers(1)
        .literal(Value::Atom(plus))
        .literal(Value::of_type(Type::integer()))
        .instructions([
            L1Instruction::PushLocal(0),
            L1Instruction::PushOuter(0),
            L1Instruction::Call {
                message: 0,
                arity: 2,
                expected: 1,
            },
            L1Instruction::Return,
        ])
        .build()
        .unwrap();
    Arc::new(Function::new(Arc::new(code), vec![Value::from(3)]))
}

#[test]
fn test_round_trip_of_every_value_kind() {
    let (specials, modules) = fixtures();
    let base = modules.module_named("base").unwrap();
    let big = BigInt::from(i64::MAX) * BigInt::from(1_000_000);
    let values = vec![
        Value::from(7),
        Value::from(300),
        Value::from(-5),
        Value::from(1_i64 << 40),
        Value::from(big.clone()),
        Value::from(-big),
        Value::Float(-0.5),
        Value::string("héllo"),
        Value::Atom(base.atom_named("colour")),
        Value::tuple(vec![Value::from(1), Value::tuple(vec![Value::string("x")])]),
        Value::set([Value::from(1), Value::Float(2.5), Value::string("s")]),
        Value::map([
            (Value::Atom(base.atom_named("k")), Value::from(1)),
            (Value::from(2), Value::tuple(vec![])),
        ]),
        Value::of_type(Type::int_range_i64(-5, 70_000)),
        Value::of_type(Type::tuple_type(
            SizeRange { min: 1, max: Some(3) },
            vec![Type::String],
            Type::Float,
        )),
        Value::of_type(Type::set_of(SizeRange::at_least(1), Type::byte())),
        Value::of_type(Type::map_of(SizeRange::ANY, Type::String, Type::integer())),
        Value::of_type(Type::function(vec![Type::integer()], Type::String)),
        Value::of_type(Type::enumeration([Value::string("a"), Value::string("b")])),
        Value::of_type(Type::meta(Type::String)),
        Value::of_type(Type::variable(Type::natural_number())),
        Value::Function(adder(&modules)),
    ];
    for value in &values {
        assert_eq!(&round_trip(value, &specials, &modules), value, "round trip of {}", value);
    }
}

#[test]
fn test_round_trip_of_continuation_chain() {
    let (specials, modules) = fixtures();
    let function = adder(&modules);
    let outer = Arc::new(Continuation::new(None, function.clone(), 3, vec![Value::from(1)]));
    let inner = Continuation::new(Some(outer), function, 1, vec![Value::from(2), Value::from(5)]);
    let value = Value::Continuation(Arc::new(inner));
    let copy = round_trip(&value, &specials, &modules);
    assert_eq!(copy, value);
    let Value::Continuation(copy) = copy else {
        panic!("expected a continuation");
    };
    assert_eq!(copy.depth(), 2);
    assert_eq!(copy.caller().unwrap().pc(), 3);
}

#[test]
fn test_variable_holding_itself() {
    let (specials, modules) = fixtures();
    let variable = VariableRef::new(Type::Top);
    variable
        .set(Value::tuple(vec![Value::Variable(variable.clone()), Value::from(1)]))
        .unwrap();

    let copy = round_trip(&Value::Variable(variable), &specials, &modules);
    let Value::Variable(copy) = copy else {
        panic!("expected a variable");
    };
    let content = copy.get().unwrap();
    let items = content.as_tuple().unwrap();
    assert!(items[0].as_variable().unwrap().ptr_eq(&copy));
    assert_eq!(items[1], Value::from(1));
}

#[test]
fn test_variable_content_may_refer_back_to_an_enclosing_tuple() {
    let (specials, modules) = fixtures();
    let variable = VariableRef::new(Type::Top);
    let outer = Value::tuple(vec![Value::Variable(variable.clone())]);
    variable.set(Value::tuple(vec![outer.clone(), Value::from(7)])).unwrap();

    let copy = round_trip(&outer, &specials, &modules);
    let inner_variable = copy.as_tuple().unwrap()[0].as_variable().unwrap().clone();
    let content = inner_variable.get().unwrap();
    let items = content.as_tuple().unwrap();
    assert_eq!(items[1], Value::from(7));
    let back = items[0].as_tuple().unwrap()[0].as_variable().unwrap().clone();
    assert!(back.ptr_eq(&inner_variable));
}

#[test]
fn test_assignments_follow_structure_and_precede_checkpoint() {
    let (specials, modules) = fixtures();
    let variable = VariableRef::with_value(Type::integer(), Value::from(1_000)).unwrap();
    let bytes = to_bytes(&[Value::Variable(variable)], &specials, &modules).unwrap();
    let ops: Vec<_> = describe(&bytes)
        .unwrap()
        .instructions
        .iter()
        .map(|i| i.operation)
        .collect();
    assert_eq!(
        ops,
        vec![
            SerializerOperation::SpecialObject,
            SerializerOperation::Variable,
            SerializerOperation::ShortInteger,
            SerializerOperation::AssignVariable,
            SerializerOperation::Checkpoint,
        ]
    );
}

#[test]
fn test_retracing_in_one_session_writes_only_a_checkpoint() {
    let (specials, modules) = fixtures();
    let shared = Value::tuple((0..50).map(Value::from).collect());
    let value = Value::tuple(vec![shared.clone(), Value::string("payload")]);

    let standalone = to_bytes(std::slice::from_ref(&value), &specials, &modules).unwrap();
    let mut serializer = Serializer::new(Vec::new(), &specials, &modules);
    serializer.serialize(&value).unwrap();
    let first = serializer.bytes_written();
    let objects = serializer.objects_written();
    serializer.serialize(&value).unwrap();
    let second = serializer.bytes_written() - first;
    assert_eq!(first, standalone.len() as u64);
    assert!(second < first);
    assert_eq!(serializer.objects_written(), objects);

    // A value sharing a written sub-object only writes what is new.
    let sibling = Value::tuple(vec![shared, Value::from(7)]);
    serializer.serialize(&sibling).unwrap();
    assert_eq!(serializer.objects_written(), objects + 1);

    let bytes = serializer.into_inner();
    let values = from_bytes(&bytes, &specials, &modules).unwrap();
    assert_eq!(values, vec![value.clone(), value, sibling]);
}

#[test]
fn test_special_objects_are_one_byte_ordinals() {
    let (specials, modules) = fixtures();
    let bytes = to_bytes(&[Value::Nil], &specials, &modules).unwrap();
    assert_eq!(
        bytes,
        vec![
            SerializerOperation::SpecialObject.opcode(),
            0,
            SerializerOperation::Checkpoint.opcode(),
            0
        ]
    );
    let truth = specials.boolean(true);
    let description = describe(&to_bytes(&[truth.clone()], &specials, &modules).unwrap()).unwrap();
    assert_eq!(description.instructions[0].operation, SerializerOperation::SpecialAtom);
    assert_eq!(description.instructions[0].special, Some("true"));
    assert_eq!(round_trip(&truth, &specials, &modules), truth);
}

#[test]
fn test_moduleless_atoms_keep_identity_within_a_stream() {
    let (specials, modules) = fixtures();
    let loose = Value::Atom(AtomRef::new("loose", None));
    let copy = round_trip(&Value::tuple(vec![loose.clone(), loose.clone()]), &specials, &modules);
    let items = copy.as_tuple().unwrap();
    assert_eq!(items[0], items[1]);
    assert_ne!(items[0], loose);
    assert_eq!(items[0].as_atom().unwrap().name(), "loose");
}

#[test]
fn test_deep_nesting_does_not_recurse() {
    const DEPTH: i64 = 100_000;
    let (specials, modules) = fixtures();
    let mut value = Value::from(-1);
    for i in 0..DEPTH {
        value = Value::tuple(vec![value, Value::from(i % 100)]);
    }

    let copy = round_trip(&value, &specials, &modules);
    // Walk down by hand; comparing with `==` would recurse.
    let mut depth = 0;
    let mut cursor = &copy;
    while let Some(items) = cursor.as_tuple() {
        assert_eq!(items[1], Value::from((DEPTH - 1 - depth) % 100));
        cursor = &items[0];
        depth += 1;
    }
    assert_eq!(depth, DEPTH);
    assert_eq!(*cursor, Value::from(-1));

    // Dropping either chain would recurse as deep as it was built.
    std::mem::forget(copy);
    std::mem::forget(value);
}

#[test]
fn test_distinct_equal_tuples_are_written_separately() {
    let (specials, modules) = fixtures();
    let a = Value::tuple(vec![Value::from(1), Value::from(2)]);
    let b = Value::tuple(vec![Value::from(1), Value::from(2)]);
    let value = Value::tuple(vec![a.clone(), b, a]);

    let bytes = to_bytes(std::slice::from_ref(&value), &specials, &modules).unwrap();
    let tuples = describe(&bytes)
        .unwrap()
        .instructions
        .iter()
        .filter(|i| i.operation == SerializerOperation::Tuple)
        .count();
    // The shared `a` once, `b` once, the outer tuple once.
    assert_eq!(tuples, 3);
    assert_eq!(round_trip(&value, &specials, &modules), value);
}

#[test]
fn test_back_reference_one_past_the_end_is_malformed() {
    let (specials, modules) = fixtures();
    let bytes = [
        SerializerOperation::ByteInteger.opcode(),
        7,
        SerializerOperation::Tuple.opcode(),
        2,
        0,
        1,
    ];
    let err = from_bytes(&bytes, &specials, &modules).unwrap_err();
    assert_eq!(
        err.malformed_reason(),
        Some(&Malformed::BadBackReference { index: 1, written: 1 })
    );
    assert!(describe(&bytes).unwrap_err().is_malformed());
}

#[test]
fn test_unknown_special_object_is_malformed() {
    let (specials, modules) = fixtures();
    let bytes = [SerializerOperation::SpecialObject.opcode(), 200];
    let err = from_bytes(&bytes, &specials, &modules).unwrap_err();
    assert_eq!(err.malformed_reason(), Some(&Malformed::UnknownSpecialObject(200)));
    assert!(err.to_string().contains("unknown special object 200"));
}

#[test]
fn test_unknown_operation_and_truncation_are_malformed() {
    let (specials, modules) = fixtures();
    let err = from_bytes(&[250], &specials, &modules).unwrap_err();
    assert_eq!(err.malformed_reason(), Some(&Malformed::UnknownOperation(250)));

    let mut bytes = to_bytes(&[Value::string("truncate me")], &specials, &modules).unwrap();
    bytes.truncate(bytes.len() - 4);
    let err = from_bytes(&bytes, &specials, &modules).unwrap_err();
    assert_eq!(err.malformed_reason(), Some(&Malformed::UnexpectedEnd));
}

#[test]
fn test_assignment_type_is_checked_on_replay() {
    let (specials, modules) = fixtures();
    // Variable of natural numbers assigned 0.
    let bytes = [
        SerializerOperation::SpecialObject.opcode(),
        5,
        SerializerOperation::Variable.opcode(),
        0,
        SerializerOperation::ByteInteger.opcode(),
        0,
        SerializerOperation::AssignVariable.opcode(),
        1,
        2,
    ];
    let err = from_bytes(&bytes, &specials, &modules).unwrap_err();
    assert!(matches!(err.malformed_reason(), Some(Malformed::BadAssignment(_))));
}

#[test]
fn test_atoms_outside_the_module_scope_are_rejected() {
    let (specials, modules) = fixtures();
    let base = modules.module_named("base").unwrap();
    let app = modules.module_named("app").unwrap();
    let other = modules.module_named("other").unwrap();

    let mut scoped = Serializer::new(Vec::new(), &specials, &modules).with_module(app.clone());
    scoped.serialize(&Value::Atom(base.atom_named("inherited"))).unwrap();
    scoped.serialize(&Value::Atom(app.atom_named("own"))).unwrap();
    let written = scoped.bytes_written();

    let foreign = Value::tuple(vec![Value::from(1), Value::Atom(other.atom_named("foreign"))]);
    let err = scoped.serialize(&foreign).unwrap_err();
    assert!(matches!(
        &err,
        SerializerError::ForeignAtom { atom, module } if atom == "foreign" && module == "app"
    ));
    // The failed call left nothing behind.
    assert_eq!(scoped.bytes_written(), written);
    scoped.serialize(&Value::from(1)).unwrap();
    let bytes = scoped.into_inner();
    assert_eq!(bytes.len() as u64, written + 4);
    assert_eq!(from_bytes(&bytes, &specials, &modules).unwrap().len(), 3);

    let mut narrow = Serializer::new(Vec::new(), &specials, &modules).with_module(base);
    assert!(narrow.serialize(&Value::Atom(app.atom_named("own"))).is_err());
    assert!(narrow.serialize(&Value::Atom(AtomRef::new("loose", None))).is_err());
}

#[test]
fn test_unknown_module_on_replay() {
    let (specials, modules) = fixtures();
    let bytes = to_bytes(
        &[Value::Atom(modules.resolve_atom("other", "x").unwrap())],
        &specials,
        &modules,
    )
    .unwrap();
    let elsewhere = ModuleRegistry::new();
    let err = from_bytes(&bytes, &specials, &elsewhere).unwrap_err();
    assert_eq!(
        err.malformed_reason(),
        Some(&Malformed::UnknownModule("other".to_string()))
    );
}

#[test]
fn test_optimized_frames_are_not_serializable() {
    let (specials, modules) = fixtures();
    let frame = Continuation::new(None, adder(&modules), 0, vec![Value::from(1)]).with_level_two_offset(4);
    let err = to_bytes(&[Value::Continuation(Arc::new(frame))], &specials, &modules).unwrap_err();
    assert!(matches!(err, SerializerError::UnsupportedValue { kind: "continuation", .. }));
}

#[test]
fn test_continuation_must_fit_its_function_on_replay() {
    let (specials, modules) = fixtures();
    let function = adder(&modules);
    let short = Continuation::new(None, function.clone(), 0, vec![]);
    let past_end = Continuation::new(None, function, 99, vec![Value::from(1)]);

    for frame in [short, past_end] {
        let bytes = to_bytes(&[Value::Continuation(Arc::new(frame))], &specials, &modules).unwrap();
        let err = from_bytes(&bytes, &specials, &modules).unwrap_err();
        assert!(
            matches!(
                err.malformed_reason(),
                Some(Malformed::WrongKind { operation: "continuation", .. })
            ),
            "{}",
            err
        );
    }
}

#[test]
fn test_deserializer_reads_one_value_per_checkpoint() {
    let (specials, modules) = fixtures();
    let bytes = to_bytes(&[Value::from(1), Value::string("two")], &specials, &modules).unwrap();
    let mut deserializer = Deserializer::new(bytes.as_slice(), &specials, &modules);
    assert_eq!(deserializer.deserialize().unwrap(), Some(Value::from(1)));
    assert_eq!(deserializer.deserialize().unwrap(), Some(Value::string("two")));
    assert_eq!(deserializer.deserialize().unwrap(), None);
    assert_eq!(deserializer.offset(), bytes.len() as u64);
}

#[test]
fn test_description_lists_and_serializes() {
    let (specials, modules) = fixtures();
    let bytes = to_bytes(
        &[Value::tuple(vec![Value::from(1), Value::Nil])],
        &specials,
        &modules,
    )
    .unwrap();
    let description = describe(&bytes).unwrap();
    assert_eq!(description.objects, 3);
    assert_eq!(description.checkpoints, 1);
    assert_eq!(description.bytes, bytes.len() as u64);
    let listing = description.to_string();
    assert!(listing.contains("tuple [#0, #1]"), "{}", listing);
    assert!(listing.contains("; nil"), "{}", listing);
    let json = serde_json::to_value(&description).unwrap();
    assert_eq!(json["instructions"][2]["operation"], "tuple");
}

//! Special objects and special atoms.
//!
//! A fixed, ordinal-indexed catalog of well-known values. The serializer
//! writes a member of either table as a single ordinal byte, so the order
//! of [`SpecialObject`] and [`SpecialAtom`] is part of the stream format:
//! append only, never reorder.

use crate::atoms::AtomRef;
use crate::types::Type;
use crate::values::Value;
use std::collections::HashMap;
use strum::{EnumCount, EnumIter, IntoEnumIterator, IntoStaticStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum SpecialObject {
    Nil,
    Top,
    Any,
    Bottom,
    Integer,
    NaturalNumber,
    WholeNumber,
    Byte,
    Float,
    String,
    Atom,
    Boolean,
    EmptyTuple,
    EmptySet,
    EmptyMap,
    MostGeneralTuple,
    MostGeneralSet,
    MostGeneralMap,
    /// The type of all types.
    Type,
    MostGeneralVariable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum SpecialAtom {
    True,
    False,
    Exception,
}

/// The two special tables plus reverse indices.
///
/// Built once at startup and shared read-only by the dispatch engine, the
/// level-two machine and the serializer.
pub struct SpecialObjects {
    objects: Vec<Value>,
    atoms: Vec<AtomRef>,
    object_ordinals: HashMap<Value, u8>,
    atom_ordinals: HashMap<AtomRef, u8>,
}

impl SpecialObjects {
    pub fn standard() -> Self {
        let atoms: Vec<AtomRef> = SpecialAtom::iter()
            .map(|a| AtomRef::new(<&'static str>::from(a), None))
            .collect();
        let boolean = Type::enumeration([
            Value::Atom(atoms[SpecialAtom::True as usize].clone()),
            Value::Atom(atoms[SpecialAtom::False as usize].clone()),
        ]);
        let objects: Vec<Value> = SpecialObject::iter()
            .map(|o| match o {
                SpecialObject::Nil => Value::Nil,
                SpecialObject::Top => Value::of_type(Type::Top),
                SpecialObject::Any => Value::of_type(Type::Any),
                SpecialObject::Bottom => Value::of_type(Type::Bottom),
                SpecialObject::Integer => Value::of_type(Type::integer()),
                SpecialObject::NaturalNumber => Value::of_type(Type::natural_number()),
                SpecialObject::WholeNumber => Value::of_type(Type::whole_number()),
                SpecialObject::Byte => Value::of_type(Type::byte()),
                SpecialObject::Float => Value::of_type(Type::Float),
                SpecialObject::String => Value::of_type(Type::String),
                SpecialObject::Atom => Value::of_type(Type::Atom),
                SpecialObject::Boolean => Value::of_type(boolean.clone()),
                SpecialObject::EmptyTuple => Value::tuple(Vec::new()),
                SpecialObject::EmptySet => Value::set([]),
                SpecialObject::EmptyMap => Value::map([]),
                SpecialObject::MostGeneralTuple => Value::of_type(Type::most_general_tuple()),
                SpecialObject::MostGeneralSet => Value::of_type(Type::most_general_set()),
                SpecialObject::MostGeneralMap => Value::of_type(Type::most_general_map()),
                SpecialObject::Type => Value::of_type(Type::meta(Type::Any)),
                SpecialObject::MostGeneralVariable => Value::of_type(Type::variable(Type::Top)),
            })
            .collect();

        let mut object_ordinals = HashMap::with_capacity(objects.len());
        for (ordinal, value) in objects.iter().enumerate() {
            let previous = object_ordinals.insert(value.clone(), ordinal as u8);
            assert!(previous.is_none(), "duplicate special object {}", value);
        }
        let atom_ordinals = atoms
            .iter()
            .enumerate()
            .map(|(ordinal, atom)| (atom.clone(), ordinal as u8))
            .collect();
        SpecialObjects {
            objects,
            atoms,
            object_ordinals,
            atom_ordinals,
        }
    }

    pub fn object(&self, ordinal: u8) -> Option<&Value> {
        self.objects.get(ordinal as usize)
    }

    pub fn atom(&self, ordinal: u8) -> Option<&AtomRef> {
        self.atoms.get(ordinal as usize)
    }

    pub fn special(&self, which: SpecialObject) -> &Value {
        &self.objects[which as usize]
    }

    pub fn special_atom(&self, which: SpecialAtom) -> &AtomRef {
        &self.atoms[which as usize]
    }

    pub fn object_ordinal(&self, value: &Value) -> Option<u8> {
        // The only compound specials are empty, so a populated value is
        // rejected without hashing its contents.
        let candidate = match value {
            Value::Tuple(items) => items.is_empty(),
            Value::Set(set) => set.is_empty(),
            Value::Map(map) => map.is_empty(),
            Value::Function(_) | Value::Code(_) | Value::Continuation(_) | Value::Variable(_) => false,
            _ => true,
        };
        if !candidate {
            return None;
        }
        self.object_ordinals.get(value).copied()
    }

    pub fn atom_ordinal(&self, atom: &AtomRef) -> Option<u8> {
        self.atom_ordinals.get(atom).copied()
    }

    pub fn true_atom(&self) -> &AtomRef {
        self.special_atom(SpecialAtom::True)
    }

    pub fn false_atom(&self) -> &AtomRef {
        self.special_atom(SpecialAtom::False)
    }

    pub fn boolean(&self, b: bool) -> Value {
        Value::Atom(if b { self.true_atom() } else { self.false_atom() }.clone())
    }

    pub fn boolean_type(&self) -> Type {
        match self.special(SpecialObject::Boolean) {
            Value::Type(t) => (**t).clone(),
            _ => Type::Atom,
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn atom_count(&self) -> usize {
        self.atoms.len()
    }
}

impl Default for SpecialObjects {
    fn default() -> Self {
        Self::standard()
    }
}

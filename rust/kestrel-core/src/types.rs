//! First-class types and the subtype lattice.
//!
//! Every constructor in this module returns a canonical form: empty
//! compound types collapse to [`Type::Bottom`], contiguous integer
//! enumerations become ranges, and tuple types drop redundant leading
//! elements. Structural equality on canonical forms is therefore good enough
//! for hashing types used as map keys and dispatch-tree tests.
//!
//! ```text
//!                        ⊤ (top, includes nil)
//!                        |
//!                       any
//!      ┌────────┬───────┼──────────┬───────────┐
//!   integers  float   tuples ... functions   metatypes
//!      └────────┴───────┼──────────┴───────────┘
//!                        ⊥
//! ```

use crate::values::{SetValue, Value};
use num_bigint::BigInt;
use std::fmt;
use std::sync::Arc;

/// Largest finite integer range that is compared element-wise against an
/// enumeration.
const MAX_ENUMERATED_RANGE: u64 = 256;

// ---------------------------------------------------------------------------
// Ranges
// ---------------------------------------------------------------------------

/// An inclusive integer range; `None` bounds are unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IntRange {
    pub lower: Option<BigInt>,
    pub upper: Option<BigInt>,
}

impl IntRange {
    pub fn contains(&self, n: &BigInt) -> bool {
        self.lower.as_ref().is_none_or(|lo| lo <= n) && self.upper.as_ref().is_none_or(|hi| n <= hi)
    }

    fn is_empty(&self) -> bool {
        matches!((&self.lower, &self.upper), (Some(lo), Some(hi)) if lo > hi)
    }

    pub fn is_subrange_of(&self, other: &IntRange) -> bool {
        let lower_ok = match (&other.lower, &self.lower) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(o), Some(s)) => o <= s,
        };
        let upper_ok = match (&other.upper, &self.upper) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(o), Some(s)) => s <= o,
        };
        lower_ok && upper_ok
    }

    pub fn hull(&self, other: &IntRange) -> IntRange {
        let lower = match (&self.lower, &other.lower) {
            (Some(a), Some(b)) => Some(a.min(b).clone()),
            _ => None,
        };
        let upper = match (&self.upper, &other.upper) {
            (Some(a), Some(b)) => Some(a.max(b).clone()),
            _ => None,
        };
        IntRange { lower, upper }
    }

    pub fn intersect(&self, other: &IntRange) -> Option<IntRange> {
        let lower = match (&self.lower, &other.lower) {
            (Some(a), Some(b)) => Some(a.max(b).clone()),
            (Some(a), None) | (None, Some(a)) => Some(a.clone()),
            (None, None) => None,
        };
        let upper = match (&self.upper, &other.upper) {
            (Some(a), Some(b)) => Some(a.min(b).clone()),
            (Some(a), None) | (None, Some(a)) => Some(a.clone()),
            (None, None) => None,
        };
        let range = IntRange { lower, upper };
        (!range.is_empty()).then_some(range)
    }

    /// Number of members, if finite.
    pub fn len(&self) -> Option<BigInt> {
        match (&self.lower, &self.upper) {
            (Some(lo), Some(hi)) => Some(hi - lo + 1),
            _ => None,
        }
    }

    /// Whether the range holds exactly one integer.
    pub fn single(&self) -> Option<&BigInt> {
        match (&self.lower, &self.upper) {
            (Some(lo), Some(hi)) if lo == hi => Some(lo),
            _ => None,
        }
    }

    /// The range of the pairwise results of `op`, given that `op` is
    /// monotone in both arguments (addition) or needs corner evaluation.
    pub fn combine_corners(
        &self,
        other: &IntRange,
        op: impl Fn(&BigInt, &BigInt) -> BigInt,
    ) -> Option<IntRange> {
        let (a_lo, a_hi, b_lo, b_hi) = (
            self.lower.as_ref()?,
            self.upper.as_ref()?,
            other.lower.as_ref()?,
            other.upper.as_ref()?,
        );
        let corners = [op(a_lo, b_lo), op(a_lo, b_hi), op(a_hi, b_lo), op(a_hi, b_hi)];
        let lower = corners.iter().min().cloned();
        let upper = corners.iter().max().cloned();
        Some(IntRange { lower, upper })
    }
}

/// An inclusive range of collection sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SizeRange {
    pub min: u64,
    pub max: Option<u64>,
}

impl SizeRange {
    pub const ANY: SizeRange = SizeRange { min: 0, max: None };

    pub fn exactly(n: u64) -> SizeRange {
        SizeRange { min: n, max: Some(n) }
    }

    pub fn at_least(n: u64) -> SizeRange {
        SizeRange { min: n, max: None }
    }

    pub fn contains(&self, n: u64) -> bool {
        n >= self.min && self.max.is_none_or(|m| n <= m)
    }

    pub fn is_subrange_of(&self, other: &SizeRange) -> bool {
        self.min >= other.min
            && match (self.max, other.max) {
                (_, None) => true,
                (None, Some(_)) => false,
                (Some(a), Some(b)) => a <= b,
            }
    }

    pub fn hull(&self, other: &SizeRange) -> SizeRange {
        SizeRange {
            min: self.min.min(other.min),
            max: match (self.max, other.max) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            },
        }
    }

    pub fn intersect(&self, other: &SizeRange) -> Option<SizeRange> {
        let min = self.min.max(other.min);
        let max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        };
        max.is_none_or(|m| m >= min).then_some(SizeRange { min, max })
    }

    fn as_int_range(&self) -> IntRange {
        IntRange {
            lower: Some(BigInt::from(self.min)),
            upper: self.max.map(BigInt::from),
        }
    }
}

// ---------------------------------------------------------------------------
// Compound type descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TupleType {
    pub sizes: SizeRange,
    pub leading: Vec<Type>,
    pub default: Type,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SetType {
    pub sizes: SizeRange,
    pub element: Type,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MapType {
    pub sizes: SizeRange,
    pub key: Type,
    pub value: Type,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    pub args: Vec<Type>,
    pub result: Type,
}

impl TupleType {
    /// Build a canonical tuple type, or `Bottom` if no tuple can satisfy it.
    ///
    /// In canonical form a bounded tuple type's default is the type of its
    /// last possible element, and no trailing leading type equals the
    /// default.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(sizes: SizeRange, leading: Vec<Type>, default: Type) -> Type {
        let mut sizes = sizes;
        let mut leading = leading;
        let mut default = default;
        if let Some(pos) = leading.iter().position(Type::is_bottom) {
            if (pos as u64) < sizes.min {
                return Type::Bottom;
            }
            leading.truncate(pos);
            default = Type::Bottom;
        }
        if default.is_bottom() {
            let cap = leading.len() as u64;
            sizes.max = Some(sizes.max.map_or(cap, |m| m.min(cap)));
        }
        if let Some(max) = sizes.max {
            if max < sizes.min {
                return Type::Bottom;
            }
            let max = max as usize;
            leading.truncate(max);
            if max == 0 {
                default = Type::Bottom;
            } else if leading.len() == max {
                default = leading[max - 1].clone();
            }
        }
        while leading.last().is_some_and(|last| *last == default) {
            leading.pop();
        }
        Type::Tuple(Arc::new(TupleType {
            sizes,
            leading,
            default,
        }))
    }

    pub fn type_at(&self, index: usize) -> &Type {
        self.leading.get(index).unwrap_or(&self.default)
    }

    fn can_have_index(&self, index: usize) -> bool {
        self.sizes.max.is_none_or(|m| (index as u64) < m)
    }

    fn is_subtype_of(&self, other: &TupleType) -> bool {
        if !self.sizes.is_subrange_of(&other.sizes) {
            return false;
        }
        let limit = self.leading.len().max(other.leading.len());
        (0..=limit)
            .filter(|&i| self.can_have_index(i))
            .all(|i| self.type_at(i).is_subtype_of(other.type_at(i)))
    }

    fn union(&self, other: &TupleType) -> Type {
        let limit = self.leading.len().max(other.leading.len());
        let leading = (0..limit)
            .map(|i| self.type_at(i).union(other.type_at(i)))
            .collect();
        TupleType::new(
            self.sizes.hull(&other.sizes),
            leading,
            self.default.union(&other.default),
        )
    }

    fn intersection(&self, other: &TupleType) -> Type {
        let Some(sizes) = self.sizes.intersect(&other.sizes) else {
            return Type::Bottom;
        };
        let limit = self.leading.len().max(other.leading.len());
        let leading = (0..limit)
            .map(|i| self.type_at(i).intersection(other.type_at(i)))
            .collect();
        TupleType::new(sizes, leading, self.default.intersection(&other.default))
    }
}

impl SetType {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(sizes: SizeRange, element: Type) -> Type {
        let mut sizes = sizes;
        let mut element = element;
        if element.is_bottom() || sizes.max == Some(0) {
            if sizes.min > 0 {
                return Type::Bottom;
            }
            sizes = SizeRange::exactly(0);
            element = Type::Bottom;
        }
        if let Some(max) = sizes.max {
            if max < sizes.min {
                return Type::Bottom;
            }
        }
        Type::Set(Arc::new(SetType { sizes, element }))
    }
}

impl MapType {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(sizes: SizeRange, key: Type, value: Type) -> Type {
        let mut sizes = sizes;
        let (mut key, mut value) = (key, value);
        if key.is_bottom() || value.is_bottom() || sizes.max == Some(0) {
            if sizes.min > 0 {
                return Type::Bottom;
            }
            sizes = SizeRange::exactly(0);
            key = Type::Bottom;
            value = Type::Bottom;
        }
        if let Some(max) = sizes.max {
            if max < sizes.min {
                return Type::Bottom;
            }
        }
        Type::Map(Arc::new(MapType { sizes, key, value }))
    }
}

impl FunctionType {
    pub fn new(args: Vec<Type>, result: Type) -> FunctionType {
        FunctionType { args, result }
    }

    pub fn is_subtype_of(&self, other: &FunctionType) -> bool {
        self.args.len() == other.args.len()
            && other
                .args
                .iter()
                .zip(&self.args)
                .all(|(theirs, ours)| theirs.is_subtype_of(ours))
            && self.result.is_subtype_of(&other.result)
    }

    fn union(&self, other: &FunctionType) -> Option<FunctionType> {
        (self.args.len() == other.args.len()).then(|| FunctionType {
            args: self
                .args
                .iter()
                .zip(&other.args)
                .map(|(a, b)| a.intersection(b))
                .collect(),
            result: self.result.union(&other.result),
        })
    }

    fn intersection(&self, other: &FunctionType) -> Option<FunctionType> {
        (self.args.len() == other.args.len()).then(|| FunctionType {
            args: self
                .args
                .iter()
                .zip(&other.args)
                .map(|(a, b)| a.union(b))
                .collect(),
            result: self.result.intersection(&other.result),
        })
    }
}

// ---------------------------------------------------------------------------
// Type
// ---------------------------------------------------------------------------

/// The range covering `set` when it holds only integers with no gaps.
fn contiguous_range(set: &SetValue) -> Option<IntRange> {
    let mut ints: Vec<&BigInt> = set.iter().map(Value::as_int).collect::<Option<_>>()?;
    ints.sort();
    let lo = *ints.first()?;
    let hi = *ints.last()?;
    (hi - lo + 1 == BigInt::from(ints.len())).then(|| IntRange {
        lower: Some(lo.clone()),
        upper: Some(hi.clone()),
    })
}

/// A first-class type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Bottom,
    /// Every value, including nil.
    Top,
    /// Every value except nil.
    Any,
    Integers(IntRange),
    Float,
    String,
    Atom,
    /// A finite set of instances.
    Enumeration(Arc<SetValue>),
    Tuple(Arc<TupleType>),
    Set(Arc<SetType>),
    Map(Arc<MapType>),
    Function(Arc<FunctionType>),
    /// Variables whose declared content type is exactly this type.
    Variable(Arc<Type>),
    Continuation(Arc<FunctionType>),
    Code(Arc<FunctionType>),
    /// The metatype whose instances are all subtypes of the inner type.
    Meta(Arc<Type>),
}

impl Type {
    pub fn int_range(lower: Option<BigInt>, upper: Option<BigInt>) -> Type {
        let range = IntRange { lower, upper };
        if range.is_empty() {
            Type::Bottom
        } else {
            Type::Integers(range)
        }
    }

    pub fn int_range_i64(lower: i64, upper: i64) -> Type {
        Type::int_range(Some(BigInt::from(lower)), Some(BigInt::from(upper)))
    }

    pub fn integer() -> Type {
        Type::int_range(None, None)
    }

    pub fn natural_number() -> Type {
        Type::int_range(Some(BigInt::from(1)), None)
    }

    pub fn whole_number() -> Type {
        Type::int_range(Some(BigInt::from(0)), None)
    }

    pub fn byte() -> Type {
        Type::int_range_i64(0, 255)
    }

    /// Integers representable in a machine `i64`.
    pub fn int64() -> Type {
        Type::int_range_i64(i64::MIN, i64::MAX)
    }

    pub fn enumeration(values: impl IntoIterator<Item = Value>) -> Type {
        let set: SetValue = values.into_iter().collect();
        if set.is_empty() {
            return Type::Bottom;
        }
        match contiguous_range(&set) {
            Some(range) => Type::Integers(range),
            None => Type::Enumeration(Arc::new(set)),
        }
    }

    pub fn tuple_of(elements: Vec<Type>) -> Type {
        TupleType::new(SizeRange::exactly(elements.len() as u64), elements, Type::Bottom)
    }

    pub fn tuple_type(sizes: SizeRange, leading: Vec<Type>, default: Type) -> Type {
        TupleType::new(sizes, leading, default)
    }

    pub fn most_general_tuple() -> Type {
        TupleType::new(SizeRange::ANY, Vec::new(), Type::Any)
    }

    pub fn set_of(sizes: SizeRange, element: Type) -> Type {
        SetType::new(sizes, element)
    }

    pub fn most_general_set() -> Type {
        SetType::new(SizeRange::ANY, Type::Any)
    }

    pub fn map_of(sizes: SizeRange, key: Type, value: Type) -> Type {
        MapType::new(sizes, key, value)
    }

    pub fn most_general_map() -> Type {
        MapType::new(SizeRange::ANY, Type::Any, Type::Any)
    }

    pub fn function(args: Vec<Type>, result: Type) -> Type {
        Type::Function(Arc::new(FunctionType::new(args, result)))
    }

    pub fn variable(content: Type) -> Type {
        Type::Variable(Arc::new(content))
    }

    pub fn meta(inner: Type) -> Type {
        Type::Meta(Arc::new(inner))
    }

    pub fn is_bottom(&self) -> bool {
        matches!(self, Type::Bottom)
    }

    pub fn as_int_range(&self) -> Option<&IntRange> {
        match self {
            Type::Integers(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionType> {
        match self {
            Type::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Whether `value` is an instance of this type.
    pub fn contains(&self, value: &Value) -> bool {
        match self {
            Type::Bottom => false,
            Type::Top => true,
            Type::Any => !value.is_nil(),
            Type::Integers(range) => value.as_int().is_some_and(|n| range.contains(n)),
            Type::Float => matches!(value, Value::Float(_)),
            Type::String => matches!(value, Value::String(_)),
            Type::Atom => matches!(value, Value::Atom(_)),
            Type::Enumeration(set) => set.contains(value),
            Type::Tuple(t) => match value {
                Value::Tuple(items) => {
                    t.sizes.contains(items.len() as u64)
                        && items
                            .iter()
                            .enumerate()
                            .all(|(i, item)| t.type_at(i).contains(item))
                }
                _ => false,
            },
            Type::Set(t) => match value {
                Value::Set(set) => {
                    t.sizes.contains(set.len() as u64) && set.iter().all(|e| t.element.contains(e))
                }
                _ => false,
            },
            Type::Map(t) => match value {
                Value::Map(map) => {
                    t.sizes.contains(map.len() as u64)
                        && map
                            .iter()
                            .all(|(k, v)| t.key.contains(k) && t.value.contains(v))
                }
                _ => false,
            },
            Type::Function(ft) => match value {
                Value::Function(f) => f.code().function_type().is_subtype_of(ft),
                _ => false,
            },
            Type::Code(ft) => match value {
                Value::Code(c) => c.function_type().is_subtype_of(ft),
                _ => false,
            },
            Type::Variable(content) => match value {
                Value::Variable(v) => {
                    v.content_type().is_subtype_of(content) && content.is_subtype_of(v.content_type())
                }
                _ => false,
            },
            Type::Continuation(ft) => match value {
                Value::Continuation(c) => c.function().code().function_type().is_subtype_of(ft),
                _ => false,
            },
            Type::Meta(inner) => match value {
                Value::Type(t) => t.is_subtype_of(inner),
                _ => false,
            },
        }
    }

    pub fn is_subtype_of(&self, other: &Type) -> bool {
        if self == other {
            return true;
        }
        match (self, other) {
            (Type::Bottom, _) => true,
            (_, Type::Top) => true,
            (_, Type::Bottom) | (Type::Top, _) => false,
            (Type::Enumeration(set), _) => set.iter().all(|v| other.contains(v)),
            (Type::Any, _) => false,
            (_, Type::Any) => true,
            (Type::Integers(range), Type::Enumeration(set)) => {
                match (&range.lower, range.len()) {
                    (Some(lo), Some(len)) if len <= BigInt::from(MAX_ENUMERATED_RANGE) => {
                        let mut n = lo.clone();
                        let mut remaining = len;
                        while remaining > BigInt::from(0) {
                            if !set.contains(&Value::Int(n.clone())) {
                                return false;
                            }
                            n += 1;
                            remaining -= 1;
                        }
                        true
                    }
                    _ => false,
                }
            }
            (Type::Meta(inner), Type::Enumeration(set)) => {
                inner.is_bottom() && set.contains(&Value::of_type(Type::Bottom))
            }
            (_, Type::Enumeration(_)) => false,
            (Type::Integers(a), Type::Integers(b)) => a.is_subrange_of(b),
            (Type::Tuple(a), Type::Tuple(b)) => a.is_subtype_of(b),
            (Type::Set(a), Type::Set(b)) => {
                a.sizes.is_subrange_of(&b.sizes) && a.element.is_subtype_of(&b.element)
            }
            (Type::Map(a), Type::Map(b)) => {
                a.sizes.is_subrange_of(&b.sizes)
                    && a.key.is_subtype_of(&b.key)
                    && a.value.is_subtype_of(&b.value)
            }
            (Type::Function(a), Type::Function(b)) => a.is_subtype_of(b),
            (Type::Code(a), Type::Code(b)) => a.is_subtype_of(b),
            (Type::Continuation(a), Type::Continuation(b)) => a.is_subtype_of(b),
            (Type::Variable(a), Type::Variable(b)) => a.is_subtype_of(b) && b.is_subtype_of(a),
            (Type::Meta(a), Type::Meta(b)) => a.is_subtype_of(b),
            _ => false,
        }
    }

    /// The smallest canonical type containing both types.
    pub fn union(&self, other: &Type) -> Type {
        if self.is_subtype_of(other) {
            return other.clone();
        }
        if other.is_subtype_of(self) {
            return self.clone();
        }
        match (self, other) {
            (Type::Enumeration(a), Type::Enumeration(b)) => {
                Type::enumeration(a.union(b).iter().cloned())
            }
            (Type::Enumeration(set), other) | (other, Type::Enumeration(set)) => set
                .iter()
                .filter(|v| !other.contains(v))
                .fold(other.clone(), |acc, v| acc.union(&v.kind())),
            (Type::Integers(a), Type::Integers(b)) => Type::Integers(a.hull(b)),
            (Type::Tuple(a), Type::Tuple(b)) => a.union(b),
            (Type::Set(a), Type::Set(b)) => {
                SetType::new(a.sizes.hull(&b.sizes), a.element.union(&b.element))
            }
            (Type::Map(a), Type::Map(b)) => MapType::new(
                a.sizes.hull(&b.sizes),
                a.key.union(&b.key),
                a.value.union(&b.value),
            ),
            (Type::Function(a), Type::Function(b)) => a
                .union(b)
                .map_or(Type::Any, |f| Type::Function(Arc::new(f))),
            (Type::Code(a), Type::Code(b)) => {
                a.union(b).map_or(Type::Any, |f| Type::Code(Arc::new(f)))
            }
            (Type::Continuation(a), Type::Continuation(b)) => a
                .union(b)
                .map_or(Type::Any, |f| Type::Continuation(Arc::new(f))),
            (Type::Meta(a), Type::Meta(b)) => Type::meta(a.union(b)),
            _ => Type::Any,
        }
    }

    /// The largest canonical type contained in both types.
    pub fn intersection(&self, other: &Type) -> Type {
        if self.is_subtype_of(other) {
            return self.clone();
        }
        if other.is_subtype_of(self) {
            return other.clone();
        }
        match (self, other) {
            (Type::Enumeration(set), other) | (other, Type::Enumeration(set)) => {
                Type::enumeration(set.iter().filter(|v| other.contains(v)).cloned())
            }
            (Type::Integers(a), Type::Integers(b)) => {
                a.intersect(b).map_or(Type::Bottom, Type::Integers)
            }
            (Type::Tuple(a), Type::Tuple(b)) => a.intersection(b),
            (Type::Set(a), Type::Set(b)) => match a.sizes.intersect(&b.sizes) {
                Some(sizes) => SetType::new(sizes, a.element.intersection(&b.element)),
                None => Type::Bottom,
            },
            (Type::Map(a), Type::Map(b)) => match a.sizes.intersect(&b.sizes) {
                Some(sizes) => MapType::new(
                    sizes,
                    a.key.intersection(&b.key),
                    a.value.intersection(&b.value),
                ),
                None => Type::Bottom,
            },
            (Type::Function(a), Type::Function(b)) => a
                .intersection(b)
                .map_or(Type::Bottom, |f| Type::Function(Arc::new(f))),
            (Type::Code(a), Type::Code(b)) => a
                .intersection(b)
                .map_or(Type::Bottom, |f| Type::Code(Arc::new(f))),
            (Type::Continuation(a), Type::Continuation(b)) => a
                .intersection(b)
                .map_or(Type::Bottom, |f| Type::Continuation(Arc::new(f))),
            (Type::Meta(a), Type::Meta(b)) => Type::meta(a.intersection(b)),
            _ => Type::Bottom,
        }
    }

    /// Whether some value could be an instance of both types.
    pub fn could_intersect(&self, other: &Type) -> bool {
        !self.intersection(other).is_bottom()
    }

    /// Size range of a tuple type as an integer range type, used when
    /// propagating the result of a size query.
    pub fn tuple_size_type(&self) -> Option<Type> {
        match self {
            Type::Tuple(t) => Some(Type::Integers(t.sizes.as_int_range())),
            _ => None,
        }
    }
}

impl fmt::Display for IntRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.lower, &self.upper) {
            (None, None) => write!(f, "integer"),
            (Some(lo), None) if *lo == BigInt::from(1) => write!(f, "natural number"),
            (Some(lo), None) if *lo == BigInt::from(0) => write!(f, "whole number"),
            (Some(lo), Some(hi)) => write!(f, "[{}..{}]", lo, hi),
            (Some(lo), None) => write!(f, "[{}..∞)", lo),
            (None, Some(hi)) => write!(f, "(-∞..{}]", hi),
        }
    }
}

impl fmt::Display for SizeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) if max == self.min => write!(f, "{}", max),
            Some(max) => write!(f, "{}..{}", self.min, max),
            None => write!(f, "{}..∞", self.min),
        }
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        write!(f, "[{}]→{}", args.join(", "), self.result)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bottom => write!(f, "⊥"),
            Type::Top => write!(f, "⊤"),
            Type::Any => write!(f, "any"),
            Type::Integers(r) => write!(f, "{}", r),
            Type::Float => write!(f, "float"),
            Type::String => write!(f, "string"),
            Type::Atom => write!(f, "atom"),
            Type::Enumeration(set) => {
                let mut items: Vec<String> = set.iter().map(|v| v.to_string()).collect();
                items.sort();
                write!(f, "{{{}}}ᵀ", items.join(", "))
            }
            Type::Tuple(t) => {
                let mut parts: Vec<String> = t.leading.iter().map(|e| e.to_string()).collect();
                if !t.default.is_bottom() {
                    parts.push(format!("{}…", t.default));
                }
                write!(f, "<{}|{}>", parts.join(", "), t.sizes)
            }
            Type::Set(t) => write!(f, "{{{}|{}}}", t.element, t.sizes),
            Type::Map(t) => write!(f, "{{{}→{}|{}}}", t.key, t.value, t.sizes),
            Type::Function(ft) => write!(f, "{}", ft),
            Type::Code(ft) => write!(f, "code {}", ft),
            Type::Continuation(ft) => write!(f, "$[{}]", ft),
            Type::Variable(content) => write!(f, "↑{}", content),
            Type::Meta(inner) => write!(f, "{}'s type", inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(lo: i64, hi: i64) -> Type {
        Type::int_range_i64(lo, hi)
    }

    #[test]
    fn test_integer_ranges_nest() {
        assert!(range(1, 10).is_subtype_of(&Type::natural_number()));
        assert!(Type::natural_number().is_subtype_of(&Type::whole_number()));
        assert!(Type::whole_number().is_subtype_of(&Type::integer()));
        assert!(!Type::integer().is_subtype_of(&Type::natural_number()));
        assert!(Type::integer().is_subtype_of(&Type::Any));
        assert!(Type::Any.is_subtype_of(&Type::Top));
        assert!(!Type::Top.is_subtype_of(&Type::Any));
    }

    #[test]
    fn test_range_union_and_intersection() {
        assert_eq!(range(1, 5).union(&range(3, 10)), range(1, 10));
        assert_eq!(range(1, 5).intersection(&range(3, 10)), range(3, 5));
        assert_eq!(range(1, 2).intersection(&range(5, 6)), Type::Bottom);
        assert!(!range(1, 2).could_intersect(&range(5, 6)));
        assert!(range(1, 10).could_intersect(&Type::integer()));
    }

    #[test]
    fn test_contiguous_enumeration_becomes_range() {
        let ty = Type::enumeration([Value::from(3), Value::from(1), Value::from(2)]);
        assert_eq!(ty, range(1, 3));
        let gappy = Type::enumeration([Value::from(1), Value::from(3)]);
        assert!(matches!(gappy, Type::Enumeration(_)));
        assert!(gappy.is_subtype_of(&range(1, 3)));
        assert!(!range(1, 3).is_subtype_of(&gappy));
    }

    #[test]
    fn test_enumeration_intersection_filters_instances() {
        let e = Type::enumeration([Value::from(1), Value::string("a"), Value::Nil]);
        assert_eq!(
            e.intersection(&Type::String),
            Type::enumeration([Value::string("a")])
        );
        assert!(!e.is_subtype_of(&Type::Any));
        assert!(e.is_subtype_of(&Type::Top));
    }

    #[test]
    fn test_tuple_types() {
        let pair = Type::tuple_of(vec![Type::integer(), Type::String]);
        let general = Type::most_general_tuple();
        assert!(pair.is_subtype_of(&general));
        assert!(!general.is_subtype_of(&pair));
        assert!(pair.contains(&Value::tuple(vec![Value::from(3), Value::string("x")])));
        assert!(!pair.contains(&Value::tuple(vec![Value::from(3)])));

        let ints = Type::tuple_type(SizeRange::ANY, vec![], Type::integer());
        let nats = Type::tuple_type(SizeRange::at_least(1), vec![], Type::natural_number());
        assert!(nats.is_subtype_of(&ints));
        assert_eq!(ints.intersection(&nats), nats);
    }

    #[test]
    fn test_impossible_tuple_is_bottom() {
        let t = Type::tuple_type(SizeRange::exactly(2), vec![Type::integer(), Type::Bottom], Type::Any);
        assert_eq!(t, Type::Bottom);
        let a = Type::tuple_of(vec![Type::integer()]);
        let b = Type::tuple_of(vec![Type::String]);
        assert_eq!(a.intersection(&b), Type::Bottom);
    }

    #[test]
    fn test_function_types_are_contravariant() {
        let wide = Type::function(vec![Type::integer()], range(0, 1));
        let narrow = Type::function(vec![Type::natural_number()], Type::integer());
        assert!(wide.is_subtype_of(&narrow));
        assert!(!narrow.is_subtype_of(&wide));
    }

    #[test]
    fn test_variable_types_are_invariant() {
        let a = Type::variable(Type::integer());
        let b = Type::variable(Type::natural_number());
        assert!(!a.is_subtype_of(&b));
        assert!(!b.is_subtype_of(&a));
        assert_eq!(a.intersection(&b), Type::Bottom);
    }

    #[test]
    fn test_metatypes() {
        let meta = Type::meta(Type::integer());
        assert!(meta.contains(&Value::of_type(Type::natural_number())));
        assert!(!meta.contains(&Value::of_type(Type::String)));
        assert!(Type::meta(Type::natural_number()).is_subtype_of(&meta));
        assert_eq!(
            Value::of_type(Type::integer()).kind(),
            Type::meta(Type::integer())
        );
    }

    #[test]
    fn test_union_of_unrelated_kinds_is_any() {
        assert_eq!(Type::integer().union(&Type::String), Type::Any);
        assert_eq!(Type::Float.intersection(&Type::String), Type::Bottom);
    }

    #[test]
    fn test_set_and_map_types() {
        let s = Type::set_of(SizeRange::ANY, Type::integer());
        assert!(s.contains(&Value::set([Value::from(1), Value::from(2)])));
        assert!(!s.contains(&Value::set([Value::string("x")])));
        let empty_only = Type::set_of(SizeRange::ANY, Type::Bottom);
        assert!(empty_only.contains(&Value::set([])));
        let m = Type::map_of(SizeRange::ANY, Type::String, Type::integer());
        assert!(m.contains(&Value::map([(Value::string("a"), Value::from(1))])));
        assert!(m.is_subtype_of(&Type::most_general_map()));
    }
}

//! Method definitions.

use kestrel_core::{Function, FunctionType, ModuleId, Type, Value};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinitionBody {
    Method(Arc<Function>),
    /// Declared now, defined later in the same module.
    Forward,
    /// Must be overridden by a more specific definition.
    Abstract,
}

/// One overload of a method: a signature plus a body or a marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    module: Option<ModuleId>,
    signature: Arc<FunctionType>,
    body: DefinitionBody,
}

impl Definition {
    pub fn method(module: Option<ModuleId>, function: Arc<Function>) -> Self {
        Definition {
            module,
            signature: function.code().function_type_arc(),
            body: DefinitionBody::Method(function),
        }
    }

    pub fn forward(module: Option<ModuleId>, signature: FunctionType) -> Self {
        Definition {
            module,
            signature: Arc::new(signature),
            body: DefinitionBody::Forward,
        }
    }

    pub fn abstract_method(module: Option<ModuleId>, signature: FunctionType) -> Self {
        Definition {
            module,
            signature: Arc::new(signature),
            body: DefinitionBody::Abstract,
        }
    }

    pub fn module(&self) -> Option<ModuleId> {
        self.module
    }

    pub fn signature(&self) -> &FunctionType {
        &self.signature
    }

    pub fn param_types(&self) -> &[Type] {
        &self.signature.args
    }

    pub fn result_type(&self) -> &Type {
        &self.signature.result
    }

    pub fn body(&self) -> &DefinitionBody {
        &self.body
    }

    pub fn function(&self) -> Option<&Arc<Function>> {
        match &self.body {
            DefinitionBody::Method(f) => Some(f),
            _ => None,
        }
    }

    pub fn is_forward(&self) -> bool {
        matches!(self.body, DefinitionBody::Forward)
    }

    /// Whether every parameter type is a subtype of the corresponding one in
    /// `other`, and the two signatures are not equivalent.
    pub fn is_more_specific_than(&self, other: &Definition) -> bool {
        let mine = self.param_types();
        let theirs = other.param_types();
        mine.len() == theirs.len()
            && mine.iter().zip(theirs).all(|(a, b)| a.is_subtype_of(b))
            && !theirs.iter().zip(mine).all(|(b, a)| b.is_subtype_of(a))
    }

    pub fn applies_to_values(&self, args: &[Value]) -> bool {
        args.len() == self.param_types().len()
            && self
                .param_types()
                .iter()
                .zip(args)
                .all(|(ty, arg)| ty.contains(arg))
    }

    /// Not provably inapplicable to arguments bounded by `types`.
    pub fn could_apply_to_types(&self, types: &[Type]) -> bool {
        types.len() == self.param_types().len()
            && self
                .param_types()
                .iter()
                .zip(types)
                .all(|(param, ty)| param.could_intersect(ty))
    }

    /// Applies to every argument tuple bounded by `types`.
    pub fn certainly_applies_to_types(&self, types: &[Type]) -> bool {
        types.len() == self.param_types().len()
            && self
                .param_types()
                .iter()
                .zip(types)
                .all(|(param, ty)| ty.is_subtype_of(param))
    }
}

impl fmt::Display for Definition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.body {
            DefinitionBody::Method(_) => "method",
            DefinitionBody::Forward => "forward",
            DefinitionBody::Abstract => "abstract",
        };
        write!(f, "{} {}", kind, self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(args: Vec<Type>) -> FunctionType {
        FunctionType::new(args, Type::Top)
    }

    #[test]
    fn test_specificity_is_strict() {
        let nat = Definition::forward(None, sig(vec![Type::natural_number(), Type::integer()]));
        let int = Definition::forward(None, sig(vec![Type::integer(), Type::integer()]));
        assert!(nat.is_more_specific_than(&int));
        assert!(!int.is_more_specific_than(&nat));
        assert!(!nat.is_more_specific_than(&nat));
    }

    #[test]
    fn test_incomparable_signatures() {
        let a = Definition::forward(None, sig(vec![Type::natural_number(), Type::integer()]));
        let b = Definition::forward(None, sig(vec![Type::integer(), Type::natural_number()]));
        assert!(!a.is_more_specific_than(&b));
        assert!(!b.is_more_specific_than(&a));
    }

    #[test]
    fn test_applicability() {
        let d = Definition::forward(None, sig(vec![Type::int_range_i64(1, 10)]));
        assert!(d.applies_to_values(&[Value::from(5)]));
        assert!(!d.applies_to_values(&[Value::from(11)]));
        assert!(d.could_apply_to_types(&[Type::integer()]));
        assert!(!d.certainly_applies_to_types(&[Type::integer()]));
        assert!(d.certainly_applies_to_types(&[Type::int_range_i64(2, 3)]));
        assert!(!d.could_apply_to_types(&[Type::String]));
    }
}

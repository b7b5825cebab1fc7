//! Methods: named, multiply dispatched overload sets.

use crate::definition::Definition;
use crate::dependency::ChunkHandle;
use crate::error::{DispatchError, LookupError};
use crate::lookup_tree::{most_specific, LookupNode, Solution, Walk};
use kestrel_core::{AtomRef, FunctionType, Type, Value};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const DEFAULT_MAX_TREE_DEPTH: usize = 64;

struct MethodState {
    /// Fixed by the first definition. A method created empty by a call
    /// site only guesses it, and takes whatever its first definition says.
    num_args: usize,
    definitions: Vec<Arc<Definition>>,
    tree: LookupNode,
}

pub struct Method {
    name: AtomRef,
    max_tree_depth: usize,
    state: RwLock<MethodState>,
    dependents: Mutex<HashSet<ChunkHandle>>,
    epoch: AtomicU64,
}

/// The definitions that could apply to arguments bounded by some static
/// types.
#[derive(Debug, Clone)]
pub struct UpperBound {
    pub candidates: Vec<Arc<Definition>>,
    /// Whether the sole candidate, if there is one, applies to every
    /// argument tuple within the bounds.
    pub certain: bool,
}

impl UpperBound {
    /// The definition every call within the bounds reaches.
    pub fn monomorphic_target(&self) -> Option<&Arc<Definition>> {
        match self.candidates.as_slice() {
            [only] if self.certain => Some(only),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Union of the candidates' declared result types.
    pub fn result_type(&self) -> Type {
        self.candidates
            .iter()
            .fold(Type::Bottom, |acc, d| acc.union(d.result_type()))
    }
}

impl Method {
    pub fn new(name: AtomRef, num_args: usize) -> Self {
        Self::with_max_tree_depth(name, num_args, DEFAULT_MAX_TREE_DEPTH)
    }

    pub fn with_max_tree_depth(name: AtomRef, num_args: usize, max_tree_depth: usize) -> Self {
        Method {
            name,
            max_tree_depth,
            state: RwLock::new(MethodState {
                num_args,
                definitions: Vec::new(),
                tree: LookupNode::root(&[], num_args),
            }),
            dependents: Mutex::new(HashSet::new()),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &AtomRef {
        &self.name
    }

    pub fn num_args(&self) -> usize {
        self.state.read().num_args
    }

    /// Bumped on every change to the definition set.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn definitions(&self) -> Vec<Arc<Definition>> {
        self.state.read().definitions.clone()
    }

    pub fn definition_count(&self) -> usize {
        self.state.read().definitions.len()
    }

    pub fn expanded_tree_nodes(&self) -> usize {
        self.state.read().tree.expanded_nodes()
    }

    // -----------------------------------------------------------------------
    // Definition changes (driven by MethodRegistry, which notifies dependents)
    // -----------------------------------------------------------------------

    pub(crate) fn add_definition(&self, definition: Definition) -> Result<(), DispatchError> {
        let arity = definition.param_types().len();
        let mut state = self.state.write();
        if arity != state.num_args {
            if !state.definitions.is_empty() {
                return Err(DispatchError::ArityMismatch {
                    name: self.name.name().to_string(),
                    expected: state.num_args,
                    actual: arity,
                });
            }
            tracing::debug!(
                method = %self.name,
                guessed = state.num_args,
                arity,
                "first definition fixes the arity"
            );
            state.num_args = arity;
        }
        let existing = state
            .definitions
            .iter()
            .position(|d| d.param_types() == definition.param_types());
        match existing {
            Some(i) if state.definitions[i].is_forward() && !definition.is_forward() => {
                state.definitions[i] = Arc::new(definition);
            }
            Some(_) => {
                return Err(DispatchError::DuplicateDefinition {
                    name: self.name.name().to_string(),
                    signature: definition.signature().to_string(),
                });
            }
            None => state.definitions.push(Arc::new(definition)),
        }
        self.reset_tree(&mut state);
        tracing::debug!(
            method = %self.name,
            definitions = state.definitions.len(),
            "definition added"
        );
        Ok(())
    }

    pub(crate) fn remove_definition(
        &self,
        signature: &FunctionType,
    ) -> Result<Arc<Definition>, DispatchError> {
        let mut state = self.state.write();
        let index = state
            .definitions
            .iter()
            .position(|d| d.param_types() == signature.args.as_slice())
            .ok_or_else(|| DispatchError::NoSuchDefinition {
                name: self.name.name().to_string(),
                signature: signature.to_string(),
            })?;
        let removed = state.definitions.remove(index);
        self.reset_tree(&mut state);
        tracing::debug!(method = %self.name, "definition removed");
        Ok(removed)
    }

    fn reset_tree(&self, state: &mut MethodState) {
        state.tree = LookupNode::root(&state.definitions, state.num_args);
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Find the most specific definition applicable to `args`.
    pub fn lookup_by_values(&self, args: &[Value]) -> Result<Arc<Definition>, LookupError> {
        {
            let state = self.state.read();
            self.check_call(&state, args)?;
            if let Walk::Solved(solution) = state.tree.walk(&state.definitions, args) {
                return self.resolve(&state.definitions, solution);
            }
        }
        let mut state = self.state.write();
        // The definitions may have changed between the locks.
        self.check_call(&state, args)?;
        let MethodState {
            definitions, tree, ..
        } = &mut *state;
        let solution = tree.walk_expanding(definitions, args, self.max_tree_depth);
        self.resolve(definitions, solution)
    }

    /// A method without definitions has no arity yet, so it answers
    /// `NoMethod` for any argument count.
    fn check_call(&self, state: &MethodState, args: &[Value]) -> Result<(), LookupError> {
        if state.definitions.is_empty() {
            return Err(LookupError::NoMethod {
                name: self.name.name().to_string(),
            });
        }
        if args.len() != state.num_args {
            return Err(LookupError::WrongArity {
                name: self.name.name().to_string(),
                expected: state.num_args,
                actual: args.len(),
            });
        }
        Ok(())
    }

    /// Reference answer by pairwise comparison of every definition.
    pub fn lookup_by_scan(&self, args: &[Value]) -> Result<Arc<Definition>, LookupError> {
        let state = self.state.read();
        let applicable: Vec<usize> = (0..state.definitions.len())
            .filter(|&d| state.definitions[d].applies_to_values(args))
            .collect();
        let solution = most_specific(&state.definitions, &applicable);
        self.resolve(&state.definitions, solution)
    }

    fn resolve(
        &self,
        definitions: &[Arc<Definition>],
        solution: Solution,
    ) -> Result<Arc<Definition>, LookupError> {
        match solution {
            Solution::Unique(d) => Ok(definitions[d].clone()),
            Solution::Ambiguous(ds) => Err(LookupError::Ambiguous {
                name: self.name.name().to_string(),
                count: ds.len(),
            }),
            Solution::None => Err(LookupError::NoMethod {
                name: self.name.name().to_string(),
            }),
        }
    }

    /// Every definition not provably inapplicable to arguments bounded by
    /// `types`, minus those that are strictly less specific than a
    /// definition certain to apply.
    ///
    /// Narrowing `types` can only shrink the answer: a definition certain
    /// for wider bounds stays certain for narrower ones.
    pub fn definitions_at_or_below(&self, types: &[Type]) -> UpperBound {
        let state = self.state.read();
        let candidates: Vec<&Arc<Definition>> = state
            .definitions
            .iter()
            .filter(|d| d.could_apply_to_types(types))
            .collect();
        let certain: Vec<&Arc<Definition>> = candidates
            .iter()
            .copied()
            .filter(|d| d.certainly_applies_to_types(types))
            .collect();
        let survivors: Vec<Arc<Definition>> = candidates
            .into_iter()
            .filter(|d| !certain.iter().any(|c| c.is_more_specific_than(d)))
            .cloned()
            .collect();
        let is_certain = matches!(survivors.as_slice(), [only] if only.certainly_applies_to_types(types));
        UpperBound {
            candidates: survivors,
            certain: is_certain,
        }
    }

    // -----------------------------------------------------------------------
    // Dependents
    // -----------------------------------------------------------------------

    pub fn add_dependent(&self, chunk: ChunkHandle) {
        self.dependents.lock().insert(chunk);
    }

    pub fn remove_dependent(&self, chunk: ChunkHandle) {
        self.dependents.lock().remove(&chunk);
    }

    pub fn dependent_count(&self) -> usize {
        self.dependents.lock().len()
    }

    pub(crate) fn take_dependents(&self) -> Vec<ChunkHandle> {
        let mut chunks: Vec<ChunkHandle> = self.dependents.lock().drain().collect();
        chunks.sort();
        chunks
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("num_args", &self.num_args())
            .field("epoch", &self.epoch())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Definition;

    fn method_with(sigs: Vec<Vec<Type>>) -> Method {
        let method = Method::new(AtomRef::new("m", None), sigs[0].len());
        for args in sigs {
            method
                .add_definition(Definition::forward(None, FunctionType::new(args, Type::Top)))
                .unwrap();
        }
        method
    }

    #[test]
    fn test_duplicate_signature_rejected() {
        let method = method_with(vec![vec![Type::integer()]]);
        let again = Definition::forward(None, FunctionType::new(vec![Type::integer()], Type::Top));
        assert!(matches!(
            method.add_definition(again),
            Err(DispatchError::DuplicateDefinition { .. })
        ));
    }

    #[test]
    fn test_arity_mismatch_rejected() {
        let method = method_with(vec![vec![Type::integer()]]);
        let wide = Definition::forward(
            None,
            FunctionType::new(vec![Type::integer(), Type::integer()], Type::Top),
        );
        assert!(matches!(
            method.add_definition(wide),
            Err(DispatchError::ArityMismatch { expected: 1, actual: 2, .. })
        ));
    }

    #[test]
    fn test_empty_method_takes_arity_of_first_definition() {
        let method = Method::new(AtomRef::new("m", None), 3);
        assert!(matches!(
            method.lookup_by_values(&[Value::from(1)]),
            Err(LookupError::NoMethod { .. })
        ));
        method
            .add_definition(Definition::forward(None, FunctionType::new(vec![Type::integer()], Type::Top)))
            .unwrap();
        assert_eq!(method.num_args(), 1);
        assert!(method.lookup_by_values(&[Value::from(1)]).is_ok());
        assert!(matches!(
            method.lookup_by_values(&[Value::from(1), Value::from(2), Value::from(3)]),
            Err(LookupError::WrongArity { expected: 1, actual: 3, .. })
        ));
    }

    #[test]
    fn test_epoch_moves_on_change() {
        let method = method_with(vec![vec![Type::integer()]]);
        let before = method.epoch();
        method
            .remove_definition(&FunctionType::new(vec![Type::integer()], Type::Top))
            .unwrap();
        assert!(method.epoch() > before);
        assert_eq!(method.definition_count(), 0);
    }

    #[test]
    fn test_upper_bound_prunes_dominated_definitions() {
        let method = method_with(vec![vec![Type::int_range_i64(1, 10)], vec![Type::integer()]]);
        let narrow = method.definitions_at_or_below(&[Type::int_range_i64(1, 10)]);
        assert_eq!(narrow.candidates.len(), 1);
        assert!(narrow.monomorphic_target().is_some());

        let wide = method.definitions_at_or_below(&[Type::integer()]);
        assert_eq!(wide.candidates.len(), 2);
        assert!(wide.monomorphic_target().is_none());
    }

    #[test]
    fn test_wrong_arity_lookup() {
        let method = method_with(vec![vec![Type::integer()]]);
        assert!(matches!(
            method.lookup_by_values(&[]),
            Err(LookupError::WrongArity { .. })
        ));
    }
}

//! Lazily expanded decision tree for exact-value lookup.
//!
//! Each internal node asks "is argument `i` an instance of `T`?". A node
//! starts out unexpanded, carrying what is already known about the
//! arguments that reach it; it is expanded the first time a lookup walks
//! into it. Past the depth limit a node falls back to scanning its
//! remaining candidates, memoising results per argument tuple.

use crate::definition::Definition;
use kestrel_core::{Type, Value};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Memoised linear-scan results per node before the memo is reset.
const MAX_SCAN_MEMO: usize = 1024;

/// The outcome of a lookup, as indices into the method's definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Solution {
    Unique(usize),
    Ambiguous(Vec<usize>),
    None,
}

/// Pick the most specific of `applicable`.
///
/// In a finite partial order a single minimal element is below every other
/// element, so one minimal definition is the answer and several minimal
/// definitions are ambiguous.
pub fn most_specific(definitions: &[Arc<Definition>], applicable: &[usize]) -> Solution {
    let mut minimal: Vec<usize> = applicable
        .iter()
        .copied()
        .filter(|&d| {
            !applicable
                .iter()
                .any(|&e| e != d && definitions[e].is_more_specific_than(&definitions[d]))
        })
        .collect();
    minimal.sort_unstable();
    match minimal.as_slice() {
        [] => Solution::None,
        [single] => Solution::Unique(*single),
        _ => Solution::Ambiguous(minimal),
    }
}

pub(crate) enum LookupNode {
    Unexpanded {
        /// Definitions that certainly apply to arguments reaching here.
        positive: Vec<usize>,
        /// Definitions that may or may not apply.
        undecided: Vec<usize>,
        /// Upper bounds on the argument types reaching here.
        known: Vec<Type>,
        depth: usize,
    },
    Test {
        arg: usize,
        ty: Type,
        if_true: Box<LookupNode>,
        if_false: Box<LookupNode>,
    },
    Leaf(Solution),
    Scan {
        candidates: Vec<usize>,
        memo: Mutex<HashMap<Vec<Value>, Solution>>,
    },
}

pub(crate) enum Walk {
    Solved(Solution),
    /// The walk reached an unexpanded node; retry under the write lock.
    NeedsExpansion,
}

impl LookupNode {
    pub(crate) fn root(definitions: &[Arc<Definition>], num_args: usize) -> LookupNode {
        let known = vec![Type::Top; num_args];
        let all = (0..definitions.len()).collect();
        let (positive, undecided) = classify(definitions, &known, all, Vec::new());
        LookupNode::Unexpanded {
            positive,
            undecided,
            known,
            depth: 0,
        }
    }

    /// Walk without mutating the tree.
    pub(crate) fn walk(&self, definitions: &[Arc<Definition>], args: &[Value]) -> Walk {
        let mut node = self;
        loop {
            match node {
                LookupNode::Test {
                    arg,
                    ty,
                    if_true,
                    if_false,
                } => {
                    node = if ty.contains(&args[*arg]) {
                        &**if_true
                    } else {
                        &**if_false
                    };
                }
                LookupNode::Leaf(solution) => return Walk::Solved(solution.clone()),
                LookupNode::Scan { candidates, memo } => {
                    return Walk::Solved(scan(definitions, candidates, memo, args));
                }
                LookupNode::Unexpanded { .. } => return Walk::NeedsExpansion,
            }
        }
    }

    /// Walk, expanding every unexpanded node on the path.
    pub(crate) fn walk_expanding(
        &mut self,
        definitions: &[Arc<Definition>],
        args: &[Value],
        max_depth: usize,
    ) -> Solution {
        let mut node = self;
        loop {
            if matches!(*node, LookupNode::Unexpanded { .. }) {
                node.expand(definitions, max_depth);
            }
            match node {
                LookupNode::Test {
                    arg,
                    ty,
                    if_true,
                    if_false,
                } => {
                    node = if ty.contains(&args[*arg]) {
                        &mut **if_true
                    } else {
                        &mut **if_false
                    };
                }
                LookupNode::Leaf(solution) => return solution.clone(),
                LookupNode::Scan { candidates, memo } => {
                    return scan(definitions, candidates, memo, args);
                }
                LookupNode::Unexpanded { .. } => unreachable!("node was just expanded"),
            }
        }
    }

    fn expand(&mut self, definitions: &[Arc<Definition>], max_depth: usize) {
        let LookupNode::Unexpanded {
            positive,
            undecided,
            known,
            depth,
        } = self
        else {
            return;
        };
        let replacement = if undecided.is_empty() {
            LookupNode::Leaf(most_specific(definitions, positive))
        } else if *depth >= max_depth {
            tracing::debug!(depth = *depth, "lookup tree depth limit reached, scanning");
            let mut candidates = positive.clone();
            candidates.extend(undecided.iter().copied());
            LookupNode::Scan {
                candidates,
                memo: Mutex::new(HashMap::new()),
            }
        } else {
            let pivot = &definitions[undecided[0]];
            let arg = known
                .iter()
                .zip(pivot.param_types())
                .position(|(k, p)| !k.is_subtype_of(p))
                .unwrap_or(0);
            let ty = pivot.param_types()[arg].clone();

            let mut true_known = known.clone();
            true_known[arg] = known[arg].intersection(&ty);
            let (true_positive, true_undecided) =
                classify(definitions, &true_known, undecided.clone(), positive.clone());

            let false_undecided: Vec<usize> = undecided
                .iter()
                .copied()
                .filter(|&d| !definitions[d].param_types()[arg].is_subtype_of(&ty))
                .collect();

            tracing::trace!(arg, ty = %ty, depth = *depth, "expanding lookup node");
            LookupNode::Test {
                arg,
                ty,
                if_true: Box::new(LookupNode::Unexpanded {
                    positive: true_positive,
                    undecided: true_undecided,
                    known: true_known,
                    depth: *depth + 1,
                }),
                if_false: Box::new(LookupNode::Unexpanded {
                    positive: positive.clone(),
                    undecided: false_undecided,
                    known: known.clone(),
                    depth: *depth + 1,
                }),
            }
        };
        *self = replacement;
    }

    /// Number of expanded nodes, for diagnostics.
    pub(crate) fn expanded_nodes(&self) -> usize {
        match self {
            LookupNode::Test {
                if_true, if_false, ..
            } => 1 + if_true.expanded_nodes() + if_false.expanded_nodes(),
            LookupNode::Leaf(_) | LookupNode::Scan { .. } => 1,
            LookupNode::Unexpanded { .. } => 0,
        }
    }
}

/// Split `candidates` into certain and undecided definitions under `known`,
/// dropping the ones that cannot apply and the ones dominated by a certain
/// definition.
fn classify(
    definitions: &[Arc<Definition>],
    known: &[Type],
    candidates: Vec<usize>,
    mut positive: Vec<usize>,
) -> (Vec<usize>, Vec<usize>) {
    let mut undecided = Vec::new();
    for d in candidates {
        let def = &definitions[d];
        if def.certainly_applies_to_types(known) {
            positive.push(d);
        } else if def.could_apply_to_types(known) {
            undecided.push(d);
        }
    }
    undecided.retain(|&d| {
        !positive
            .iter()
            .any(|&p| definitions[p].is_more_specific_than(&definitions[d]))
    });
    (positive, undecided)
}

fn scan(
    definitions: &[Arc<Definition>],
    candidates: &[usize],
    memo: &Mutex<HashMap<Vec<Value>, Solution>>,
    args: &[Value],
) -> Solution {
    if let Some(hit) = memo.lock().get(args) {
        return hit.clone();
    }
    let applicable: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|&d| definitions[d].applies_to_values(args))
        .collect();
    let solution = most_specific(definitions, &applicable);
    let mut memo = memo.lock();
    if memo.len() >= MAX_SCAN_MEMO {
        memo.clear();
    }
    memo.insert(args.to_vec(), solution.clone());
    solution
}

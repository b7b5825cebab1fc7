//! Closures and reified call frames.

use crate::code::CompiledCode;
use crate::values::Value;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Compiled code closed over captured outer values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    code: Arc<CompiledCode>,
    outers: Vec<Value>,
}

impl Function {
    pub fn new(code: Arc<CompiledCode>, outers: Vec<Value>) -> Self {
        assert_eq!(
            outers.len(),
            code.num_outers(),
            "function for {} built with the wrong number of outers",
            code.name()
        );
        Function { code, outers }
    }

    /// A function with no captured values.
    pub fn from_code(code: Arc<CompiledCode>) -> Arc<Self> {
        Arc::new(Function::new(code, Vec::new()))
    }

    pub fn code(&self) -> &Arc<CompiledCode> {
        &self.code
    }

    pub fn outers(&self) -> &[Value] {
        &self.outers
    }

    pub fn outer(&self, index: usize) -> Option<&Value> {
        self.outers.get(index)
    }
}

impl Hash for Function {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.code.hash(state);
        self.outers.hash(state);
    }
}

/// A reified call frame.
///
/// `slots` holds the arguments, then the locals, then the operand stack up to
/// `stack_pointer`. Frames reified from an optimised chunk also remember the
/// level-two offset they were suspended at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Continuation {
    caller: Option<Arc<Continuation>>,
    function: Arc<Function>,
    pc: usize,
    stack_pointer: usize,
    slots: Vec<Value>,
    level_two_offset: Option<usize>,
}

impl Continuation {
    pub fn new(
        caller: Option<Arc<Continuation>>,
        function: Arc<Function>,
        pc: usize,
        slots: Vec<Value>,
    ) -> Self {
        let stack_pointer = slots.len();
        Continuation {
            caller,
            function,
            pc,
            stack_pointer,
            slots,
            level_two_offset: None,
        }
    }

    pub fn with_level_two_offset(mut self, offset: usize) -> Self {
        self.level_two_offset = Some(offset);
        self
    }

    pub fn caller(&self) -> Option<&Arc<Continuation>> {
        self.caller.as_ref()
    }

    pub fn function(&self) -> &Arc<Function> {
        &self.function
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn stack_pointer(&self) -> usize {
        self.stack_pointer
    }

    pub fn slots(&self) -> &[Value] {
        &self.slots
    }

    pub fn level_two_offset(&self) -> Option<usize> {
        self.level_two_offset
    }

    /// Number of frames in this chain, including this one.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut frame = self.caller.as_deref();
        while let Some(c) = frame {
            depth += 1;
            frame = c.caller.as_deref();
        }
        depth
    }
}

impl Hash for Continuation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.function.hash(state);
        self.pc.hash(state);
        self.stack_pointer.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::L1Instruction;
    use crate::types::Type;

    fn constant_code() -> Arc<CompiledCode> {
        Arc::new(
            CompiledCode::builder("seven", vec![], Type::integer())
                .literal(Value::from(7))
                .instruction(L1Instruction::PushLiteral(0))
                .instruction(L1Instruction::Return)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_functions_compare_structurally() {
        let code = constant_code();
        let a = Function::from_code(code.clone());
        let b = Function::from_code(code);
        assert_eq!(Value::Function(a), Value::Function(b));
    }

    #[test]
    fn test_continuation_depth() {
        let f = Function::from_code(constant_code());
        let outer = Arc::new(Continuation::new(None, f.clone(), 0, vec![]));
        let inner = Continuation::new(Some(outer), f, 1, vec![Value::from(1)]);
        assert_eq!(inner.depth(), 2);
        assert_eq!(inner.stack_pointer(), 1);
        assert!(inner.level_two_offset().is_none());
    }
}

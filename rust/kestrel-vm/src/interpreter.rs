//! The interpreter: an explicit stack of level-one and level-two frames.
//!
//! Calls never recurse on the native stack. Every invocation selects a chunk
//! through the arena, which checks validity on entry, so a chunk invalidated
//! by a method change is never run again; the call goes through the default
//! chunk instead and may be translated afresh once hot.

use crate::chunk::L2Chunk;
use crate::context::VmContext;
use crate::error::VmError;
use crate::execute::{execute, ExecEnv, Step};
use crate::primitive::{InterpreterState, PrimitiveResult, SuspendRequest};
use crate::register::{L2Register, RegisterFile};
use crate::stats::VmStats;
use crate::translator::Translator;
use kestrel_core::{Continuation, ErrorCode, Function, L1Instruction, SpecialObjects, Type, Value};
use kestrel_dispatch::DefinitionBody;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct L1Frame {
    function: Arc<Function>,
    pc: usize,
    /// Arguments then locals.
    slots: Vec<Value>,
    stack: Vec<Value>,
    /// Declared type of the answer the current call must produce.
    pending_expected: Option<Type>,
}

#[derive(Debug)]
struct L2Frame {
    function: Arc<Function>,
    chunk: Arc<L2Chunk>,
    pc: usize,
    registers: RegisterFile,
    awaiting: Option<L2Register>,
}

#[derive(Debug)]
enum Frame {
    L1(L1Frame),
    L2(L2Frame),
}

impl Frame {
    fn function(&self) -> &Arc<Function> {
        match self {
            Frame::L1(f) => &f.function,
            Frame::L2(f) => &f.function,
        }
    }

    fn reify(&self, caller: Option<Arc<Continuation>>) -> Continuation {
        match self {
            Frame::L1(f) => {
                let mut slots = f.slots.clone();
                slots.extend(f.stack.iter().cloned());
                Continuation::new(caller, f.function.clone(), f.pc, slots)
            }
            // Only the arguments survive; such a continuation can restart
            // its function but not resume mid-chunk.
            Frame::L2(f) => {
                let args = f.registers.arguments(f.function.code().num_args());
                Continuation::new(caller, f.function.clone(), 0, args).with_level_two_offset(f.pc)
            }
        }
    }
}

/// Why [`Interpreter::run`] returned without an error.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(Value),
    /// A primitive asked to suspend; call [`Interpreter::resume`] with its
    /// answer to continue.
    Suspended(SuspendRequest),
}

enum Pending {
    Call(Arc<Function>, Vec<Value>),
    Deliver(Value),
}

enum Flow {
    Continue,
    Done(Value),
    Suspend(SuspendRequest),
}

/// Primitives invoked by a real call may see their caller's frames.
struct CallState<'a> {
    specials: &'a SpecialObjects,
    interpreter: &'a Interpreter,
}

impl InterpreterState for CallState<'_> {
    fn specials(&self) -> &SpecialObjects {
        self.specials
    }

    fn reify_caller(&self) -> Option<Arc<Continuation>> {
        self.interpreter.reify()
    }
}

pub struct Interpreter {
    context: Arc<VmContext>,
    frames: Vec<Frame>,
    pending: Option<Pending>,
    suspended: bool,
    terminate: Arc<AtomicBool>,
    stats: VmStats,
}

impl Interpreter {
    pub fn new(context: Arc<VmContext>) -> Self {
        Interpreter {
            context,
            frames: Vec::new(),
            pending: None,
            suspended: false,
            terminate: Arc::new(AtomicBool::new(false)),
            stats: VmStats::default(),
        }
    }

    pub fn context(&self) -> &Arc<VmContext> {
        &self.context
    }

    pub fn stats(&self) -> VmStats {
        self.stats
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Shared flag another thread may set to stop this interpreter at its
    /// next instruction or resumption.
    pub fn termination_flag(&self) -> Arc<AtomicBool> {
        self.terminate.clone()
    }

    pub fn request_termination(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    pub fn termination_requested(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Prepare to call `function`; nothing runs until [`Interpreter::run`].
    pub fn start(&mut self, function: Arc<Function>, args: Vec<Value>) {
        self.frames.clear();
        self.suspended = false;
        self.pending = Some(Pending::Call(function, args));
    }

    /// Hand a suspended interpreter the answer of the primitive that
    /// suspended it.
    pub fn resume(&mut self, value: Value) -> Result<(), VmError> {
        if !self.suspended {
            return Err(VmError::NotSuspended);
        }
        self.suspended = false;
        self.pending = Some(Pending::Deliver(value));
        Ok(())
    }

    /// Call `function` to completion on this thread, sleeping through any
    /// suspension.
    pub fn call(&mut self, function: Arc<Function>, args: Vec<Value>) -> Result<Value, VmError> {
        self.start(function, args);
        loop {
            match self.run()? {
                RunOutcome::Completed(value) => return Ok(value),
                RunOutcome::Suspended(SuspendRequest::Sleep(duration)) => {
                    std::thread::sleep(duration);
                    self.resume(Value::Nil)?;
                }
                RunOutcome::Suspended(SuspendRequest::Yield) => {
                    std::thread::yield_now();
                    self.resume(Value::Nil)?;
                }
            }
        }
    }

    /// Run until the outermost call completes or a primitive suspends. Any
    /// error unwinds every frame.
    pub fn run(&mut self) -> Result<RunOutcome, VmError> {
        if self.suspended {
            // Waiting for resume; the frames stay intact.
            return Err(VmError::Idle);
        }
        let result = self.run_frames();
        if result.is_err() {
            self.frames.clear();
            self.suspended = false;
        }
        result
    }

    fn run_frames(&mut self) -> Result<RunOutcome, VmError> {
        let mut flow = match self.pending.take() {
            Some(Pending::Call(function, args)) => self.call_function(function, args)?,
            Some(Pending::Deliver(value)) => {
                if self.termination_requested() {
                    return Err(VmError::Terminated);
                }
                self.deliver(value)?
            }
            None if self.frames.is_empty() => return Err(VmError::Idle),
            None => Flow::Continue,
        };
        loop {
            match flow {
                Flow::Done(value) => return Ok(RunOutcome::Completed(value)),
                Flow::Suspend(request) => {
                    self.suspended = true;
                    return Ok(RunOutcome::Suspended(request));
                }
                Flow::Continue => {}
            }
            if self.termination_requested() {
                return Err(VmError::Terminated);
            }
            flow = match self.frames.last() {
                Some(Frame::L1(_)) => self.step_level_one()?,
                Some(Frame::L2(_)) => self.step_level_two()?,
                None => return Err(VmError::Idle),
            };
        }
    }

    /// The continuation of the running frame, linked to its callers.
    pub fn reify(&self) -> Option<Arc<Continuation>> {
        self.frames
            .iter()
            .fold(None, |caller, frame| Some(Arc::new(frame.reify(caller))))
    }

    fn call_function(&mut self, function: Arc<Function>, args: Vec<Value>) -> Result<Flow, VmError> {
        if self.termination_requested() {
            return Err(VmError::Terminated);
        }
        let code = function.code().clone();
        if args.len() != code.num_args() {
            return Err(VmError::Failed(ErrorCode::IncorrectNumberOfArguments));
        }
        if !code
            .function_type()
            .args
            .iter()
            .zip(&args)
            .all(|(ty, arg)| ty.contains(arg))
        {
            return Err(VmError::Failed(ErrorCode::IncorrectArgumentType));
        }
        let max_depth = self.context.config.max_call_depth;
        if self.frames.len() >= max_depth {
            return Err(VmError::StackOverflow(max_depth));
        }
        self.stats.calls += 1;

        if let Some(number) = code.primitive() {
            return self.call_primitive(number, function, args);
        }
        if !self.context.config.optimize {
            self.push_level_one(function, args, None);
            return Ok(Flow::Continue);
        }
        self.push_level_two(function, args);
        Ok(Flow::Continue)
    }

    fn call_primitive(
        &mut self,
        number: u16,
        function: Arc<Function>,
        args: Vec<Value>,
    ) -> Result<Flow, VmError> {
        let context = self.context.clone();
        let primitive = context
            .primitives
            .get(number)
            .ok_or(VmError::UnknownPrimitive(number))?;
        self.stats.primitive_attempts += 1;
        let result = primitive.attempt(
            &args,
            &CallState {
                specials: &context.specials,
                interpreter: self,
            },
        );
        match result {
            PrimitiveResult::Success(value) => self.deliver(value),
            PrimitiveResult::Failure(code) => {
                self.stats.primitive_failures += 1;
                if function.code().instructions().is_empty() {
                    return Err(VmError::Failed(code));
                }
                tracing::trace!(primitive = primitive.name(), %code, "running fallback code");
                self.push_level_one(function, args, Some(code.as_value()));
                Ok(Flow::Continue)
            }
            PrimitiveResult::Suspended(request) => Ok(Flow::Suspend(request)),
            PrimitiveResult::ContinuationChanged(continuation) => self.restart(&continuation),
        }
    }

    /// Abandon the frames above `continuation`'s callers and call its
    /// function again with its original arguments.
    fn restart(&mut self, continuation: &Continuation) -> Result<Flow, VmError> {
        let callers = continuation.depth() - 1;
        if callers > self.frames.len() {
            return Err(VmError::Failed(ErrorCode::IncorrectArgumentType));
        }
        let function = continuation.function().clone();
        // A replayed continuation may carry fewer slots than its arguments.
        let Some(args) = continuation.slots().get(..function.code().num_args()) else {
            return Err(VmError::Failed(ErrorCode::IncorrectArgumentType));
        };
        let args = args.to_vec();
        self.frames.truncate(callers);
        self.call_function(function, args)
    }

    fn push_level_one(&mut self, function: Arc<Function>, args: Vec<Value>, failure: Option<Value>) {
        let code = function.code();
        let mut slots = args;
        slots.resize(code.num_slots(), Value::Nil);
        if let Some(failure) = failure {
            if code.num_locals() > 0 {
                slots[code.num_args()] = failure;
            }
        }
        self.frames.push(Frame::L1(L1Frame {
            function,
            pc: 0,
            slots,
            stack: Vec::new(),
            pending_expected: None,
        }));
    }

    fn push_level_two(&mut self, function: Arc<Function>, args: Vec<Value>) {
        let selection = self.context.chunks.chunk_for(function.code().id());
        if selection.was_invalidated {
            self.stats.invalidated_entries += 1;
            tracing::debug!(code = function.code().name(), "entered invalidated chunk; using default");
        }
        if selection.chunk.is_default() {
            self.stats.default_chunk_entries += 1;
        } else {
            self.stats.optimized_chunk_entries += 1;
        }
        let registers = RegisterFile::new(selection.chunk.counts(), args);
        self.frames.push(Frame::L2(L2Frame {
            function,
            chunk: selection.chunk,
            pc: 0,
            registers,
            awaiting: None,
        }));
    }

    /// Pass a call's answer to the frame that made the call.
    fn deliver(&mut self, value: Value) -> Result<Flow, VmError> {
        match self.frames.last_mut() {
            None => Ok(Flow::Done(value)),
            Some(Frame::L1(frame)) => {
                if let Some(expected) = frame.pending_expected.take() {
                    if !expected.contains(&value) {
                        return Err(VmError::Failed(ErrorCode::ResultTypeMismatch));
                    }
                }
                frame.stack.push(value);
                Ok(Flow::Continue)
            }
            Some(Frame::L2(frame)) => {
                let Some(destination) = frame.awaiting.take() else {
                    panic!("level-two frame in {} got an answer it did not ask for", frame.chunk);
                };
                frame.registers.set_boxed(destination, value);
                Ok(Flow::Continue)
            }
        }
    }

    fn return_value(&mut self, value: Value) -> Result<Flow, VmError> {
        self.frames.pop();
        self.deliver(value)
    }

    fn step_level_one(&mut self) -> Result<Flow, VmError> {
        let Some(Frame::L1(frame)) = self.frames.last_mut() else {
            unreachable!("step_level_one without a level-one frame");
        };
        let code = frame.function.code().clone();
        let Some(instruction) = code.instructions().get(frame.pc).copied() else {
            panic!("{} ran off the end of its instructions", code.name());
        };
        frame.pc += 1;
        self.stats.l1_instructions += 1;

        let literal = |index: u32| match code.literal_at(index as usize) {
            Some(value) => value.clone(),
            None => panic!("{} has no literal {}", code.name(), index),
        };
        let pop = |stack: &mut Vec<Value>| match stack.pop() {
            Some(value) => value,
            None => panic!("{} underflowed its stack", code.name()),
        };

        match instruction {
            L1Instruction::PushLiteral(index) => frame.stack.push(literal(index)),
            L1Instruction::PushLocal(index) => {
                let value = frame.slots[index as usize].clone();
                frame.stack.push(value);
            }
            L1Instruction::PushOuter(index) => match frame.function.outer(index as usize) {
                Some(value) => {
                    let value = value.clone();
                    frame.stack.push(value);
                }
                None => panic!("{} reads missing outer {}", code.name(), index),
            },
            L1Instruction::SetLocal(index) => {
                let value = pop(&mut frame.stack);
                frame.slots[index as usize] = value;
            }
            L1Instruction::MakeTuple(n) => {
                let at = frame.stack.len() - n as usize;
                let items = frame.stack.split_off(at);
                frame.stack.push(Value::tuple(items));
            }
            L1Instruction::Pop => {
                pop(&mut frame.stack);
            }
            L1Instruction::Call {
                message,
                arity,
                expected,
            } => {
                let at = frame.stack.len() - arity as usize;
                let args = frame.stack.split_off(at);
                let expected = literal(expected).as_type().cloned().unwrap_or(Type::Top);
                frame.pending_expected = (expected != Type::Top).then_some(expected);
                let message = literal(message);
                let Some(atom) = message.as_atom() else {
                    panic!("{} calls a non-atom message", code.name());
                };
                let method = self
                    .context
                    .methods
                    .method(atom)
                    .ok_or(VmError::Failed(ErrorCode::NoMethodDefinition))?;
                let definition = method.lookup_by_values(&args)?;
                return match definition.body() {
                    DefinitionBody::Method(function) => self.call_function(function.clone(), args),
                    DefinitionBody::Forward => {
                        Err(VmError::Failed(ErrorCode::ForwardMethodDefinition))
                    }
                    DefinitionBody::Abstract => {
                        Err(VmError::Failed(ErrorCode::AbstractMethodDefinition))
                    }
                };
            }
            L1Instruction::Return => {
                let value = pop(&mut frame.stack);
                return self.return_value(value);
            }
        }
        Ok(Flow::Continue)
    }

    fn step_level_two(&mut self) -> Result<Flow, VmError> {
        let Some(Frame::L2(frame)) = self.frames.last_mut() else {
            unreachable!("step_level_two without a level-two frame");
        };
        let chunk = frame.chunk.clone();
        let step = execute(
            chunk.instruction(frame.pc),
            &mut ExecEnv {
                registers: &mut frame.registers,
                function: &frame.function,
                context: &self.context,
                stats: &mut self.stats,
            },
        );
        self.stats.l2_instructions += 1;

        match step {
            Step::Next => frame.pc += 1,
            Step::Jump(target) => frame.pc = target,
            Step::Call {
                function,
                args,
                destination,
            } => {
                frame.pc += 1;
                frame.awaiting = Some(destination);
                return self.call_function(function, args);
            }
            Step::Return(value) => return self.return_value(value),
            Step::Fail(code) => return Err(VmError::Failed(code)),
            Step::Reoptimize => {
                frame.pc += 1;
                self.reoptimize();
            }
            Step::InterpretLevelOne => {
                let function = frame.function.clone();
                let args = frame.registers.arguments(function.code().num_args());
                self.frames.pop();
                self.push_level_one(function, args, None);
            }
        }
        Ok(Flow::Continue)
    }

    /// Translate the running function and move its frame onto the new chunk.
    /// The default chunk has done nothing observable yet, so the new chunk
    /// may start from the top. On failure the frame carries on unoptimized.
    fn reoptimize(&mut self) {
        let Some(Frame::L2(frame)) = self.frames.last() else {
            return;
        };
        let function = frame.function.clone();
        let code = function.code().clone();
        let chunk = match Translator::translate(&self.context, code.clone()) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(code = code.name(), error = %e, "translation failed");
                return;
            }
        };
        let chunks = &self.context.chunks;
        let Some(handle) = chunks.install(chunk) else {
            tracing::debug!(code = code.name(), "translated chunk was stale on arrival");
            return;
        };
        chunks.set_optimized(code.id(), handle);
        self.stats.reoptimizations += 1;
        let Some(chunk) = chunks.get(handle) else {
            return;
        };
        tracing::debug!(code = code.name(), chunk = %chunk, "reoptimized");
        let args = match self.frames.pop() {
            Some(Frame::L2(frame)) => frame.registers.arguments(code.num_args()),
            _ => unreachable!("reoptimize checked the top frame"),
        };
        self.stats.optimized_chunk_entries += 1;
        let registers = RegisterFile::new(chunk.counts(), args);
        self.frames.push(Frame::L2(L2Frame {
            function,
            chunk,
            pc: 0,
            registers,
            awaiting: None,
        }));
    }

    /// The function of the running frame.
    pub fn current_function(&self) -> Option<&Arc<Function>> {
        self.frames.last().map(Frame::function)
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("depth", &self.frames.len())
            .field("suspended", &self.suspended)
            .field("stats", &self.stats)
            .finish()
    }
}

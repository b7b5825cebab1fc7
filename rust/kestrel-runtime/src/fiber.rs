//! Fibers: interpreters scheduled as lightweight threads.
//!
//! A fiber owns one [`Interpreter`] and is run in slices by whichever worker
//! picks it up. A slice ends when the fiber finishes or a primitive asks to
//! suspend; the interpreter's frames stay in the fiber between slices, so
//! resumption may happen on any worker.

use kestrel_core::{Continuation, Function, Value};
use kestrel_vm::{Interpreter, RunOutcome, SuspendRequest, VmContext, VmError, VmStats};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// FiberId
// ---------------------------------------------------------------------------

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(u64);

impl FiberId {
    pub fn next() -> Self {
        Self(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({})", self.0)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// FiberState
// ---------------------------------------------------------------------------

/// ```text
/// Unstarted ─► Running ⇄ Suspended
///                 │
///                 ├─► Completed
///                 ├─► Failed
///                 └─► Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum FiberState {
    Unstarted,
    Running,
    Suspended,
    Completed,
    Failed,
    Terminated,
}

impl FiberState {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            FiberState::Completed | FiberState::Failed | FiberState::Terminated
        )
    }
}

pub type FiberResult = Result<Value, VmError>;

/// How a slice of execution ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Slice {
    Finished(FiberState),
    Suspended(SuspendRequest),
}

// ---------------------------------------------------------------------------
// Fiber
// ---------------------------------------------------------------------------

pub struct Fiber {
    id: FiberId,
    name: Option<String>,
    priority: u8,
    created_at: Instant,
    interpreter: Mutex<Interpreter>,
    terminate: Arc<AtomicBool>,
    state: Mutex<FiberState>,
    result: Mutex<Option<FiberResult>>,
    finished: Condvar,
}

impl Fiber {
    /// A fiber that will call `function` with `args` when first run.
    pub fn new(context: Arc<VmContext>, function: Arc<Function>, args: Vec<Value>) -> Self {
        let mut interpreter = Interpreter::new(context);
        interpreter.start(function, args);
        let terminate = interpreter.termination_flag();
        Fiber {
            id: FiberId::next(),
            name: None,
            priority: 0,
            created_at: Instant::now(),
            interpreter: Mutex::new(interpreter),
            terminate,
            state: Mutex::new(FiberState::Unstarted),
            result: Mutex::new(None),
            finished: Condvar::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn state(&self) -> FiberState {
        *self.state.lock()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Ask the fiber to stop. A running fiber stops at its next instruction;
    /// a suspended one when it is next resumed.
    pub fn request_termination(&self) {
        self.terminate.store(true, Ordering::Release);
    }

    pub fn termination_requested(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> VmStats {
        self.interpreter.lock().stats()
    }

    /// The fiber's reified stack, while it is suspended or not yet finished.
    pub fn continuation(&self) -> Option<Arc<Continuation>> {
        self.interpreter.lock().reify()
    }

    /// Run until the fiber finishes or suspends. Must not be called by two
    /// threads at once; the scheduler guarantees that by holding the only
    /// queued task for the fiber.
    pub fn run_slice(&self) -> Slice {
        let mut interpreter = self.interpreter.lock();
        {
            let mut state = self.state.lock();
            if state.is_finished() {
                return Slice::Finished(*state);
            }
            *state = FiberState::Running;
        }
        match interpreter.run() {
            Ok(RunOutcome::Completed(value)) => self.finish(FiberState::Completed, Ok(value)),
            Ok(RunOutcome::Suspended(request)) => {
                *self.state.lock() = FiberState::Suspended;
                tracing::trace!(fiber = %self.id, ?request, "fiber suspended");
                Slice::Suspended(request)
            }
            Err(VmError::Terminated) => self.finish(FiberState::Terminated, Err(VmError::Terminated)),
            Err(e) => self.finish(FiberState::Failed, Err(e)),
        }
    }

    /// Deliver the answer of the primitive the fiber is suspended in.
    pub fn resume(&self, value: Value) -> Result<(), VmError> {
        self.interpreter.lock().resume(value)
    }

    fn finish(&self, state: FiberState, result: FiberResult) -> Slice {
        match &result {
            Ok(_) => tracing::debug!(fiber = %self.id, %state, "fiber finished"),
            Err(e) => tracing::debug!(fiber = %self.id, %state, error = %e, "fiber finished"),
        }
        *self.state.lock() = state;
        *self.result.lock() = Some(result);
        self.finished.notify_all();
        Slice::Finished(state)
    }

    /// The outcome, if the fiber has finished.
    pub fn result(&self) -> Option<FiberResult> {
        self.result.lock().clone()
    }

    /// Block until the fiber finishes.
    pub fn join(&self) -> FiberResult {
        let mut result = self.result.lock();
        loop {
            if let Some(outcome) = result.as_ref() {
                return outcome.clone();
            }
            self.finished.wait(&mut result);
        }
    }

    /// Block until the fiber finishes or `timeout` elapses.
    pub fn join_timeout(&self, timeout: Duration) -> Option<FiberResult> {
        let deadline = Instant::now() + timeout;
        let mut result = self.result.lock();
        loop {
            if let Some(outcome) = result.as_ref() {
                return Some(outcome.clone());
            }
            if self.finished.wait_until(&mut result, deadline).timed_out() {
                return result.clone();
            }
        }
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state())
            .finish()
    }
}

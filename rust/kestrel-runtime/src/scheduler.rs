//! M:N work-stealing fiber scheduler.
//!
//! A pool of OS worker threads runs fibers in slices. Each worker has a
//! local work-stealing deque; new and resumed fibers enter through a global
//! injection queue. A fiber is on at most one queue at a time, so no two
//! workers ever run the same fiber's instructions concurrently.
//!
//! # Work-stealing algorithm
//!
//! Each worker thread runs a loop with the following priority:
//! 1. Pop from local FIFO deque.
//! 2. Steal a batch from the global [`Injector`] queue into the local deque.
//! 3. Steal from a random peer worker's [`Stealer`].
//! 4. Park briefly (1 ms), then retry.
//!
//! # Suspension
//!
//! When a slice ends in a suspension the fiber leaves the queues. A yield
//! re-enqueues it immediately; a sleep registers it with the
//! [`TimerService`], which re-enqueues it when the deadline passes. A sleep
//! requested while termination is pending is not performed: the fiber is
//! resumed at once and ends terminated.

use crate::config::SchedulerConfig;
use crate::fiber::{Fiber, FiberId, Slice};
use crate::timer::{TimerHandle, TimerService};
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use kestrel_core::{Function, Value};
use kestrel_vm::{SuspendRequest, VmContext};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A fiber waiting for a slice of a worker's time.
struct Task {
    fiber: Arc<Fiber>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("fiber", &self.fiber.id()).finish()
    }
}

/// Resume a suspended fiber and queue it again.
fn requeue(global: &Injector<Task>, fiber: Arc<Fiber>) {
    if let Err(e) = fiber.resume(Value::Nil) {
        tracing::warn!(fiber = %fiber.id(), error = %e, "could not resume fiber");
        return;
    }
    global.push(Task { fiber });
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct WorkerHandle {
    join_handle: Option<thread::JoinHandle<()>>,
}

pub struct Scheduler {
    context: Arc<VmContext>,
    /// New and resumed fibers land here.
    global_queue: Arc<Injector<Task>>,
    workers: Vec<WorkerHandle>,
    shutdown: Arc<AtomicBool>,
    worker_count: usize,
    /// Fibers that have finished, in any final state.
    completed_count: Arc<AtomicUsize>,
    fibers: Arc<Mutex<HashMap<FiberId, Arc<Fiber>>>>,
    timers: TimerService,
}

impl Scheduler {
    pub fn new(context: Arc<VmContext>, config: &SchedulerConfig) -> io::Result<Self> {
        let num_workers = config.worker_count();
        let global_queue = Arc::new(Injector::<Task>::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let completed_count = Arc::new(AtomicUsize::new(0));

        let wake_queue = Arc::clone(&global_queue);
        let timers = TimerService::start(Arc::new(move |fiber| requeue(&wake_queue, fiber)))?;

        let mut local_workers: Vec<Worker<Task>> = Vec::with_capacity(num_workers);
        let mut stealers: Vec<Stealer<Task>> = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let w = Worker::new_fifo();
            stealers.push(w.stealer());
            local_workers.push(w);
        }
        let stealers = Arc::new(stealers);

        let mut scheduler = Self {
            context,
            global_queue,
            workers: Vec::with_capacity(num_workers),
            shutdown,
            worker_count: num_workers,
            completed_count,
            fibers: Arc::new(Mutex::new(HashMap::new())),
            timers,
        };
        for (idx, local) in local_workers.into_iter().enumerate() {
            let global = Arc::clone(&scheduler.global_queue);
            let shutdown_flag = Arc::clone(&scheduler.shutdown);
            let peer_stealers = Arc::clone(&stealers);
            let completed = Arc::clone(&scheduler.completed_count);
            let timers = scheduler.timers.handle();
            // On failure the workers already started are stopped by drop.
            let jh = thread::Builder::new()
                .name(format!("kestrel-worker-{}", idx))
                .spawn(move || {
                    Self::worker_loop(idx, local, global, peer_stealers, shutdown_flag, completed, timers);
                })?;
            scheduler.workers.push(WorkerHandle {
                join_handle: Some(jh),
            });
        }
        tracing::debug!(workers = num_workers, "scheduler started");
        Ok(scheduler)
    }

    pub fn context(&self) -> &Arc<VmContext> {
        &self.context
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn completed_count(&self) -> usize {
        self.completed_count.load(Ordering::Acquire)
    }

    /// Start a fiber calling `function` with `args`.
    pub fn spawn(&self, function: Arc<Function>, args: Vec<Value>) -> Arc<Fiber> {
        self.spawn_fiber(Fiber::new(self.context.clone(), function, args))
    }

    /// Register `fiber` and queue its first slice.
    pub fn spawn_fiber(&self, fiber: Fiber) -> Arc<Fiber> {
        let fiber = Arc::new(fiber);
        // Register before queueing so lookups are valid as soon as this
        // returns.
        self.fibers.lock().insert(fiber.id(), Arc::clone(&fiber));
        tracing::debug!(fiber = %fiber.id(), name = fiber.name(), "fiber spawned");
        self.global_queue.push(Task {
            fiber: Arc::clone(&fiber),
        });
        fiber
    }

    pub fn fiber(&self, id: FiberId) -> Option<Arc<Fiber>> {
        self.fibers.lock().get(&id).cloned()
    }

    pub fn fiber_count(&self) -> usize {
        self.fibers.lock().len()
    }

    /// Drop finished fibers from the registry; returns how many.
    pub fn reap(&self) -> usize {
        let mut fibers = self.fibers.lock();
        let before = fibers.len();
        fibers.retain(|_, fiber| !fiber.is_finished());
        before - fibers.len()
    }

    /// Ask a fiber to terminate, waking it if it is asleep. Returns `false`
    /// for an unknown fiber.
    pub fn terminate(&self, id: FiberId) -> bool {
        let Some(fiber) = self.fiber(id) else {
            return false;
        };
        fiber.request_termination();
        self.timers.handle().wake_now(id);
        tracing::debug!(fiber = %id, "termination requested");
        true
    }

    /// Block until at least `expected` fibers have finished, or `timeout`
    /// elapses. Returns the finished count when the wait ended.
    pub fn wait_for_completion(&self, expected: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.completed_count.load(Ordering::Acquire);
            if current >= expected || Instant::now() >= deadline {
                return current;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Stop the workers and the timer. Queued and sleeping fibers are
    /// abandoned.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for w in &mut self.workers {
            if let Some(jh) = w.join_handle.take() {
                let _ = jh.join();
            }
        }
        self.timers.shutdown();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // -- internal worker loop ---------------------------------------------

    /// xorshift32, one state per worker.
    fn xorshift32(state: &mut u32) -> u32 {
        let mut x = *state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        *state = x;
        x
    }

    /// Run one slice of a fiber and route it by how the slice ended.
    fn run_task(task: Task, global: &Injector<Task>, completed: &AtomicUsize, timers: &TimerHandle) {
        let fiber = task.fiber;
        match fiber.run_slice() {
            Slice::Finished(_) => {
                completed.fetch_add(1, Ordering::Release);
            }
            Slice::Suspended(SuspendRequest::Yield) => requeue(global, fiber),
            Slice::Suspended(SuspendRequest::Sleep(duration)) => {
                if fiber.termination_requested() {
                    requeue(global, fiber);
                    return;
                }
                let id = fiber.id();
                timers.sleep(Arc::clone(&fiber), duration);
                // Termination requested between the check and the
                // registration still has to cut the sleep short.
                if fiber.termination_requested() {
                    timers.wake_now(id);
                }
            }
        }
    }

    fn worker_loop(
        idx: usize,
        local: Worker<Task>,
        global: Arc<Injector<Task>>,
        stealers: Arc<Vec<Stealer<Task>>>,
        shutdown: Arc<AtomicBool>,
        completed: Arc<AtomicUsize>,
        timers: TimerHandle,
    ) {
        // Avoid zero (xorshift32 fixpoint).
        let mut rng_state: u32 = (idx as u32).wrapping_mul(2654435761).max(1);

        loop {
            if shutdown.load(Ordering::Acquire) {
                return;
            }

            if let Some(task) = local.pop() {
                Self::run_task(task, &global, &completed, &timers);
                continue;
            }

            match global.steal_batch_and_pop(&local) {
                Steal::Success(task) => {
                    Self::run_task(task, &global, &completed, &timers);
                    continue;
                }
                Steal::Retry => {
                    thread::yield_now();
                    continue;
                }
                Steal::Empty => {}
            }

            let num_peers = stealers.len();
            if num_peers > 1 {
                let start = Self::xorshift32(&mut rng_state) as usize % num_peers;
                let stolen = (0..num_peers)
                    .map(|offset| (start + offset) % num_peers)
                    .filter(|&peer| peer != idx)
                    .find_map(|peer| match stealers[peer].steal_batch_and_pop(&local) {
                        Steal::Success(task) => Some(task),
                        Steal::Retry | Steal::Empty => None,
                    });
                if let Some(task) = stolen {
                    Self::run_task(task, &global, &completed, &timers);
                    continue;
                }
            }

            thread::park_timeout(Duration::from_millis(1));
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.is_shutdown() {
            self.shutdown();
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("worker_count", &self.worker_count)
            .field("completed_count", &self.completed_count())
            .field("fibers", &self.fiber_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{CompiledCode, L1Instruction, Type};
    use kestrel_vm::VmConfig;

    fn scheduler(workers: usize) -> Scheduler {
        Scheduler::new(VmContext::new(VmConfig::default()), &SchedulerConfig { workers }).unwrap()
    }

    fn constant(value: i64) -> Arc<Function> {
        let code = CompiledCode::builder("constant", vec![], Type::integer())
            .literal(Value::from(value))
            .instructions([L1Instruction::PushLiteral(0), L1Instruction::Return])
            .build()
            .unwrap();
        Function::from_code(Arc::new(code))
    }

    #[test]
    fn scheduler_creates_requested_workers() {
        let mut sched = scheduler(2);
        assert_eq!(sched.worker_count(), 2);
        sched.shutdown();
        assert!(sched.is_shutdown());
    }

    #[test]
    fn scheduler_default_workers_nonzero() {
        let sched = scheduler(0);
        assert!(sched.worker_count() >= 1);
    }

    #[test]
    fn scheduler_runs_many_fibers() {
        let sched = scheduler(4);
        let fibers: Vec<_> = (0..100).map(|i| sched.spawn(constant(i), vec![])).collect();
        assert_eq!(sched.wait_for_completion(100, Duration::from_secs(10)), 100);
        for (i, fiber) in fibers.iter().enumerate() {
            assert_eq!(fiber.join(), Ok(Value::from(i as i64)));
        }
        assert_eq!(sched.fiber_count(), 100);
        assert_eq!(sched.reap(), 100);
        assert_eq!(sched.fiber_count(), 0);
    }

    #[test]
    fn terminate_unknown_fiber() {
        let sched = scheduler(1);
        assert!(!sched.terminate(FiberId::next()));
    }

    #[test]
    fn xorshift32_never_returns_zero_from_nonzero() {
        let mut state = 1u32;
        for _ in 0..1000 {
            assert_ne!(Scheduler::xorshift32(&mut state), 0);
        }
    }
}

//! Wakes sleeping fibers.
//!
//! One background thread owns a deadline heap and is driven over a
//! `crossbeam-channel`. A fiber is registered at most once; waking it early
//! (for a termination request) removes the registration, so every sleeping
//! fiber is woken exactly once.

use crate::fiber::{Fiber, FiberId};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Called on the timer thread with each fiber whose sleep is over.
pub type WakeFn = Arc<dyn Fn(Arc<Fiber>) + Send + Sync>;

enum Command {
    Sleep { fiber: Arc<Fiber>, deadline: Instant },
    WakeNow(FiberId),
    Shutdown,
}

/// Registers sleeps with a running [`TimerService`].
#[derive(Clone)]
pub struct TimerHandle {
    commands: Sender<Command>,
}

impl TimerHandle {
    /// Wake `fiber` once `duration` has passed.
    pub fn sleep(&self, fiber: Arc<Fiber>, duration: Duration) {
        let deadline = Instant::now() + duration;
        // A closed channel means the service is shutting down; the fiber
        // stays suspended, as every other queued fiber does.
        let _ = self.commands.send(Command::Sleep { fiber, deadline });
    }

    /// Wake a sleeping fiber now. Does nothing if it is not sleeping.
    pub fn wake_now(&self, id: FiberId) {
        let _ = self.commands.send(Command::WakeNow(id));
    }
}

pub struct TimerService {
    handle: TimerHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl TimerService {
    pub fn start(wake: WakeFn) -> io::Result<Self> {
        let (commands, receiver) = crossbeam_channel::unbounded();
        let thread = thread::Builder::new()
            .name("kestrel-timer".to_string())
            .spawn(move || timer_loop(receiver, wake))?;
        Ok(TimerService {
            handle: TimerHandle { commands },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    pub fn shutdown(&mut self) {
        let _ = self.handle.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("running", &self.thread.is_some())
            .finish()
    }
}

fn timer_loop(commands: Receiver<Command>, wake: WakeFn) {
    // Heap entries outlive early wakes; a stale entry's sequence number no
    // longer matches the registration and is skipped.
    let mut deadlines: BinaryHeap<Reverse<(Instant, u64, FiberId)>> = BinaryHeap::new();
    let mut sleeping: HashMap<FiberId, (u64, Arc<Fiber>)> = HashMap::new();
    let mut sequence = 0u64;
    loop {
        let command = match deadlines.peek() {
            Some(Reverse((deadline, _, _))) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                match commands.recv_timeout(timeout) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match commands.recv() {
                Ok(command) => Some(command),
                Err(_) => return,
            },
        };
        match command {
            Some(Command::Sleep { fiber, deadline }) => {
                sequence += 1;
                deadlines.push(Reverse((deadline, sequence, fiber.id())));
                sleeping.insert(fiber.id(), (sequence, fiber));
            }
            Some(Command::WakeNow(id)) => {
                if let Some((_, fiber)) = sleeping.remove(&id) {
                    tracing::trace!(fiber = %id, "woken early");
                    wake(fiber);
                }
            }
            Some(Command::Shutdown) => return,
            None => {}
        }
        let now = Instant::now();
        while let Some(Reverse((deadline, seq, id))) = deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            deadlines.pop();
            if sleeping.get(&id).is_some_and(|(registered, _)| *registered == seq) {
                if let Some((_, fiber)) = sleeping.remove(&id) {
                    wake(fiber);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::{CompiledCode, Function, L1Instruction, Type, Value};
    use kestrel_vm::{VmConfig, VmContext};

    fn idle_fiber(context: &Arc<VmContext>) -> Arc<Fiber> {
        let code = CompiledCode::builder("idle", vec![], Type::Top)
            .literal(Value::Nil)
            .instructions([L1Instruction::PushLiteral(0), L1Instruction::Return])
            .build()
            .unwrap();
        Arc::new(Fiber::new(context.clone(), Function::from_code(Arc::new(code)), vec![]))
    }

    #[test]
    fn test_wakes_in_deadline_order_and_early() {
        let context = VmContext::new(VmConfig::default());
        let (woken_tx, woken_rx) = crossbeam_channel::unbounded();
        let mut service = TimerService::start(Arc::new(move |fiber: Arc<Fiber>| {
            woken_tx.send(fiber.id()).unwrap();
        }))
        .unwrap();
        let timers = service.handle();
        let (late, soon, forever) = (idle_fiber(&context), idle_fiber(&context), idle_fiber(&context));
        timers.sleep(late.clone(), Duration::from_millis(40));
        timers.sleep(soon.clone(), Duration::from_millis(5));
        timers.sleep(forever.clone(), Duration::from_secs(3600));

        let timeout = Duration::from_secs(5);
        assert_eq!(woken_rx.recv_timeout(timeout).unwrap(), soon.id());
        assert_eq!(woken_rx.recv_timeout(timeout).unwrap(), late.id());
        timers.wake_now(forever.id());
        assert_eq!(woken_rx.recv_timeout(timeout).unwrap(), forever.id());
        // Already woken: a second early wake does nothing.
        timers.wake_now(forever.id());
        assert!(woken_rx.recv_timeout(Duration::from_millis(20)).is_err());
        service.shutdown();
    }
}

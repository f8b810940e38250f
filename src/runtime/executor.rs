use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

/// Error returned when submitting a task fails.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("executor {name} is shut down")]
    Shutdown { name: String },
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct ScheduledTask {
    due: Instant,
    sequence: u64,
    task: Task,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    // Reversed so the earliest due task surfaces first on the max-heap.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct ExecutorState {
    queue: BinaryHeap<ScheduledTask>,
    next_sequence: u64,
    shutdown: bool,
}

struct ExecutorShared {
    name: String,
    state: Mutex<ExecutorState>,
    cv: Condvar,
}

/// Fixed-size thread pool executing immediate and delayed tasks.
///
/// Handles are cheap to clone and share the same worker threads. Pending
/// tasks are discarded on shutdown; tasks already running finish first.
#[derive(Clone)]
pub struct TaskExecutor {
    shared: Arc<ExecutorShared>,
    workers: Arc<Mutex<Vec<thread::JoinHandle<()>>>>,
}

impl TaskExecutor {
    pub fn new(name: impl Into<String>, threads: usize) -> Self {
        let shared = Arc::new(ExecutorShared {
            name: name.into(),
            state: Mutex::new(ExecutorState {
                queue: BinaryHeap::new(),
                next_sequence: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
        });
        let mut workers = Vec::new();
        for index in 0..threads.max(1) {
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{}_{}", shared.name, index))
                .spawn(move || worker_loop(&worker_shared))
                .expect("failed to spawn executor worker");
            workers.push(handle);
        }
        Self {
            shared,
            workers: Arc::new(Mutex::new(workers)),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Submits a task for immediate execution.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> Result<(), ExecutorError> {
        self.schedule(Duration::ZERO, task)
    }

    /// Submits a task to run once the delay has elapsed.
    pub fn schedule(
        &self,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ExecutorError> {
        let mut state = self.shared.state.lock().unwrap();
        if state.shutdown {
            return Err(ExecutorError::Shutdown {
                name: self.shared.name.clone(),
            });
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.queue.push(ScheduledTask {
            due: Instant::now() + delay,
            sequence,
            task: Box::new(task),
        });
        self.shared.cv.notify_one();
        Ok(())
    }

    /// Stops the workers, discarding tasks that have not started yet.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.queue.clear();
        }
        self.shared.cv.notify_all();
        let current = thread::current().id();
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(shared: &ExecutorShared) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        match state.queue.peek().map(|entry| entry.due) {
            Some(due) if due <= now => {
                if let Some(entry) = state.queue.pop() {
                    drop(state);
                    (entry.task)();
                    state = shared.state.lock().unwrap();
                }
            }
            Some(due) => {
                let (next, _) = shared.cv.wait_timeout(state, due - now).unwrap();
                state = next;
            }
            None => {
                state = shared.cv.wait(state).unwrap();
            }
        }
    }
}

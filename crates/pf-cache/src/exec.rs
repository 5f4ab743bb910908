//! Task execution and time seams.
//!
//! Writer and reader callbacks run on a caller-supplied [`Executor`], never
//! under the service lock. [`RelativeClock`] supplies the monotonic
//! millisecond ticks used by the replacement policy; tests substitute a
//! deterministic counter.

use parking_lot::{Condvar, Mutex};
use pf_error::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, warn};

/// Unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Accepts tasks for asynchronous execution.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Runs each task inline on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallerThreadExecutor;

impl Executor for CallerThreadExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}

struct PoolShared {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    task_ready: Condvar,
    stop: AtomicBool,
}

/// Fixed-size worker pool draining a FIFO task queue.
///
/// Tasks submitted after shutdown are dropped; droppable state inside a task
/// (gap handles, listeners) is responsible for failing its own waiters.
pub struct ThreadPoolExecutor {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPoolExecutor {
    pub fn new(name: &str, threads: usize) -> Result<Arc<Self>> {
        assert!(threads > 0, "thread pool needs at least one worker");
        let shared = Arc::new(PoolShared {
            name: name.to_owned(),
            queue: Mutex::new(VecDeque::new()),
            task_ready: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let shared = Arc::clone(&shared);
            let worker = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(&shared))?;
            workers.push(worker);
        }
        debug!(
            target: "pf::exec",
            event = "pool_started",
            pool = name,
            threads
        );
        Ok(Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
        }))
    }

    /// Stops accepting tasks, lets the workers drain the queue, and joins
    /// them.
    pub fn shutdown(&self) {
        if self.shared.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.task_ready.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
        let dropped = self.shared.queue.lock().len();
        if dropped > 0 {
            warn!(
                target: "pf::exec",
                event = "pool_dropped_tasks",
                pool = %self.shared.name,
                dropped
            );
        }
        debug!(target: "pf::exec", event = "pool_stopped", pool = %self.shared.name);
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                if shared.stop.load(Ordering::SeqCst) {
                    return;
                }
                shared.task_ready.wait(&mut queue);
            }
        };
        task();
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, task: Task) {
        if self.shared.stop.load(Ordering::SeqCst) {
            warn!(
                target: "pf::exec",
                event = "task_rejected",
                pool = %self.shared.name
            );
            drop(task);
            return;
        }
        self.shared.queue.lock().push_back(task);
        self.shared.task_ready.notify_one();
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("name", &self.shared.name)
            .field("stopped", &self.shared.stop.load(Ordering::SeqCst))
            .finish()
    }
}

/// Source of relative monotonic milliseconds.
pub trait RelativeClock: Send + Sync {
    fn relative_millis(&self) -> u64;
}

/// Wall-clock backed [`RelativeClock`] counting from construction.
#[derive(Debug)]
pub struct MonotonicClock {
    started: Instant,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl RelativeClock for MonotonicClock {
    fn relative_millis(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

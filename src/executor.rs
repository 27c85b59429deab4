use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{panic_message, ExecutorError, Result};

/// A unit of blocking work, usually serving one connection from start to end.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// A thread pool that runs blocking tasks.
///
/// The pool has the following behaviour:
/// - It grows on demand up to a maximum number of workers
/// - Workers exit after a period of inactivity
/// - Idle workers are woken through a condition variable when work is queued
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

/// Internal state shared between the executor and its worker threads
struct Inner {
    /// Duration a worker thread will wait for new tasks before shutting down
    keep_alive: Duration,
    /// Shared state protected by a mutex
    shared: Mutex<Shared>,
    /// Maximum number of worker threads allowed
    max_workers: usize,
    /// Condition variable for worker thread synchronization
    condvar: Condvar,
}

/// Shared state for the thread pool
struct Shared {
    /// Queue of pending tasks
    queue: VecDeque<Task>,
    /// Current number of worker threads
    workers: usize,
    /// Number of idle worker threads
    idle: usize,
    /// Number of workers that have been notified of new work
    notified: usize,
}

impl Executor {
    /// Creates a new executor with the specified configuration.
    ///
    /// # Arguments
    /// * `max_workers` - Optional maximum number of worker threads. Defaults to 15 * CPU cores
    /// * `keep_alive` - Optional duration workers will wait for new tasks. Defaults to 6 seconds
    pub fn new(max_workers: Option<usize>, keep_alive: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    notified: 0,
                }),
                condvar: Condvar::new(),
                keep_alive: keep_alive.unwrap_or_else(|| Duration::from_secs(6)),
                max_workers: max_workers.unwrap_or_else(|| num_cpus::get() * 15).max(1),
            }),
        }
    }

    /// Queues a task, waking an idle worker or spawning a new one if needed.
    ///
    /// When every worker is busy and the pool is at its limit the task waits
    /// in the queue until a worker frees up.
    ///
    /// # Errors
    /// Returns an error if the lock is poisoned or a worker thread cannot be
    /// spawned while the pool has no workers at all. The task is dropped in
    /// both cases.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut shared = self
            .inner
            .shared
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?;

        shared.queue.push_back(Box::new(task));

        if shared.idle == 0 && shared.workers < self.inner.max_workers {
            shared.workers += 1;
            if let Err(e) = self.spawn_worker() {
                shared.workers -= 1;
                if shared.workers == 0 {
                    shared.queue.pop_back();
                    return Err(e);
                }
                log::warn!("Failed to grow worker pool, task queued: {}", e);
            }
        } else if shared.idle > 0 {
            shared.idle -= 1;
            shared.notified += 1;
            self.inner.condvar.notify_one();
        }
        Ok(())
    }

    /// Number of live worker threads.
    pub fn workers(&self) -> usize {
        self.inner
            .shared
            .lock()
            .map(|shared| shared.workers)
            .unwrap_or(0)
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Spawns a new worker thread that will process tasks from the queue.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    fn spawn_worker(&self) -> Result<()> {
        let inner = self.inner.clone();
        std::thread::Builder::new()
            .name("trellis-worker".to_owned())
            .spawn(move || {
                if let Err(e) = inner.run() {
                    log::error!("Worker thread error: {}", e);
                }
            })
            .map_err(ExecutorError::ThreadSpawn)?;
        Ok(())
    }
}

impl Inner {
    /// Main worker thread loop.
    ///
    /// The worker will:
    /// 1. Process all available tasks in the queue
    /// 2. Wait for new tasks using a condition variable
    /// 3. Exit if no tasks arrive within the keep-alive duration
    ///
    /// A panicking task is logged and does not take the worker down.
    ///
    /// # Errors
    /// Returns an error if mutex operations fail
    fn run(&self) -> Result<()> {
        let mut shared = self
            .shared
            .lock()
            .map_err(|_| ExecutorError::LockPoisoned)?;

        'alive: loop {
            while let Some(task) = shared.queue.pop_front() {
                drop(shared);
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                    log::error!(
                        "{}",
                        ExecutorError::TaskPanicked(panic_message(payload.as_ref()))
                    );
                }
                shared = self
                    .shared
                    .lock()
                    .map_err(|_| ExecutorError::LockPoisoned)?;
            }

            shared.idle += 1;

            loop {
                let result = self
                    .condvar
                    .wait_timeout(shared, self.keep_alive)
                    .map_err(|_| ExecutorError::LockPoisoned)?;

                shared = result.0;
                let timeout = result.1;

                if shared.notified != 0 {
                    shared.notified -= 1;
                    continue 'alive;
                }

                if timeout.timed_out() {
                    break 'alive;
                }
            }
        }

        shared.workers -= 1;
        shared.idle -= 1;
        Ok(())
    }
}

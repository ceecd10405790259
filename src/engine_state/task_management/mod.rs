//! # Task Management System
//!
//! Admission-controlled dispatch of work onto a shared worker pool, with a
//! lock-free completion queue carrying results back to the main thread.
//!
//! ## Architecture Overview
//!
//! - `TaskManager`: owns a `rayon` thread pool, the in-flight counter, and a
//!   `crossbeam` `SegQueue` of completed outputs.
//! - `Task`: a unit of work consumed on a worker thread.
//!
//! ## Admission Control
//! [`TaskManager::can_enqueue_task`] is a hard gate, not a buffer: callers
//! check it before publishing and keep their own backlog when it says no. The
//! in-flight count covers a task from publication until its output has been
//! drained, so results waiting in the queue still count against the limit.
//!
//! ## Draining
//! [`TaskManager::drain`] pops at most as many outputs as are in flight when
//! it starts, so it terminates even while workers keep producing.
//!
//! ## Reset
//! A full world reset calls [`TaskManager::wait_idle`] to let every running
//! task finish, then [`TaskManager::clear`] to discard what they produced.
//!
//! ## Example Usage
//! ```ignore
//! let manager = TaskManager::new(4, 32)?;
//! while manager.can_enqueue_task() {
//!     let Some(task) = backlog.pop_front() else { break };
//!     manager.publish_task(task);
//! }
//! for output in manager.drain() {
//!     apply(output);
//! }
//! ```

pub mod task;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use log::{error, info};
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::error::TaskError;
use task::Task;

/// Tracks tasks that have been handed to the pool and not yet finished running.
#[derive(Default)]
struct Outstanding {
    running: Mutex<usize>,
    idle: Condvar,
}

impl Outstanding {
    fn start(&self) {
        *self.running.lock() += 1;
    }

    fn finish(&self) {
        let mut running = self.running.lock();
        *running -= 1;
        if *running == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut running = self.running.lock();
        while *running > 0 {
            self.idle.wait(&mut running);
        }
    }
}

/// Bounded dispatcher of tasks producing outputs of type `R`.
pub struct TaskManager<R: Send + 'static> {
    pool: Arc<ThreadPool>,
    completed: Arc<SegQueue<R>>,
    outstanding: Arc<Outstanding>,
    panics: Arc<AtomicUsize>,
    in_flight: usize,
    max_in_flight: usize,
}

impl<R: Send + 'static> TaskManager<R> {
    /// Creates a manager over a fresh pool of `num_workers` threads.
    ///
    /// # Arguments
    /// * `num_workers` - pool threads
    /// * `max_in_flight` - admission limit
    pub fn new(num_workers: usize, max_in_flight: usize) -> Result<Self, TaskError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .thread_name(|i| format!("terrain-worker-{i}"))
            .build()?;
        info!("Worker pool started with {} threads", pool.current_num_threads());
        Ok(Self::with_pool(Arc::new(pool), max_in_flight))
    }

    /// Creates a manager over an existing pool.
    pub fn with_pool(pool: Arc<ThreadPool>, max_in_flight: usize) -> Self {
        Self {
            pool,
            completed: Arc::new(SegQueue::new()),
            outstanding: Arc::new(Outstanding::default()),
            panics: Arc::new(AtomicUsize::new(0)),
            in_flight: 0,
            max_in_flight,
        }
    }

    /// Whether another task may be published.
    pub fn can_enqueue_task(&self) -> bool {
        self.in_flight < self.max_in_flight
    }

    /// Counts one unit of work as dispatched.
    pub fn inc_in_flight(&mut self) {
        self.in_flight += 1;
    }

    /// Counts one unit of work as consumed.
    pub fn dec_in_flight(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Tasks published whose outputs have not been drained.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// The admission limit.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Tasks that panicked and delivered their fallback output.
    pub fn panic_count(&self) -> usize {
        self.panics.load(Ordering::Relaxed)
    }

    /// Dispatches `task` onto the pool. Callers check [`Self::can_enqueue_task`] first.
    pub fn publish_task<T>(&mut self, task: T)
    where
        T: Task<Output = R>,
    {
        self.inc_in_flight();
        self.outstanding.start();

        let completed = Arc::clone(&self.completed);
        let outstanding = Arc::clone(&self.outstanding);
        let panics = Arc::clone(&self.panics);
        self.pool.spawn(move || {
            let fallback = task.panic_output();
            let output = match catch_unwind(AssertUnwindSafe(|| task.process())) {
                Ok(output) => output,
                Err(_) => {
                    error!("Worker task panicked, delivering fallback output");
                    panics.fetch_add(1, Ordering::Relaxed);
                    fallback
                }
            };
            completed.push(output);
            outstanding.finish();
        });
    }

    /// Pops completed outputs without blocking.
    ///
    /// # Returns
    /// Outputs in completion order. At most [`Self::in_flight`] of them.
    pub fn drain(&mut self) -> Vec<R> {
        let budget = self.in_flight;
        let mut outputs = Vec::new();
        for _ in 0..budget {
            match self.completed.pop() {
                Some(output) => {
                    self.dec_in_flight();
                    outputs.push(output);
                }
                None => break,
            }
        }
        outputs
    }

    /// Blocks until no dispatched task is still running.
    pub fn wait_idle(&self) {
        self.outstanding.wait_idle();
    }

    /// Discards all pending outputs and zeroes the in-flight count.
    ///
    /// # Returns
    /// The discarded outputs, so the caller can release what they reference.
    pub fn clear(&mut self) -> Vec<R> {
        let mut discarded = Vec::new();
        while let Some(output) = self.completed.pop() {
            discarded.push(output);
        }
        self.in_flight = 0;
        discarded
    }
}

impl<R: Send + 'static> Drop for TaskManager<R> {
    fn drop(&mut self) {
        self.wait_idle();
    }
}

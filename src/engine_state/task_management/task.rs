//! # Task System Core Trait
//!
//! A `Task` is one self-contained unit of work executed on a pool thread. It
//! owns everything it needs (shared state comes in through `Arc`s) and is
//! consumed by [`Task::process`], whose output travels back to the main thread
//! over the completion queue.
//!
//! ## Task Lifecycle
//! 1. The main thread checks `TaskManager::can_enqueue_task()`
//! 2. The task is handed to `TaskManager::publish_task()`
//! 3. `process()` runs on a worker thread
//! 4. The output is pushed to the completion queue
//! 5. The main thread picks it up in `TaskManager::drain()`
//!
//! ## Panics
//! Before `process()` runs, the pool asks the task for its
//! [`Task::panic_output`]. If `process()` unwinds, that value is delivered
//! instead, so the consumer always receives exactly one output per task.

/// A unit of work that runs on a pool thread.
pub trait Task: Send + 'static {
    /// Value delivered to the main thread.
    type Output: Send + 'static;

    /// Performs the work.
    fn process(self) -> Self::Output;

    /// Output delivered if `process` panics.
    fn panic_output(&self) -> Self::Output;
}

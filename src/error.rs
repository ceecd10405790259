//! # Error Types
//!
//! Every subsystem surfaces its failures as a dedicated error enum. The
//! streaming context wraps them in [`StreamingError`] so a caller driving the
//! per-tick update only has to deal with one type.
//!
//! ## Taxonomy
//!
//! * Capacity exhaustion ([`AllocatorError::OutOfCapacity`]) is recoverable:
//!   the chunk mesh manager grows the backing buffer and retries.
//! * Stale results are not errors at all. They are detected by liveness checks
//!   and discarded silently.
//! * Device loss ([`GpuError::DeviceLost`]) is fatal for the session.
//! * Invariant violations ([`AllocatorError::Corrupted`]) indicate a logic bug
//!   and are reported in release builds as well.

use thiserror::Error;

/// Failures reported by the free-list allocator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocatorError {
    /// No free block is large enough. The caller is expected to grow and retry.
    #[error("cannot allocate {requested} units, largest free block holds {largest_free}")]
    OutOfCapacity {
        /// Requested size after alignment rounding.
        requested: u32,
        /// Size of the largest free block at the time of the request.
        largest_free: u32,
    },
    /// Zero-sized allocations are rejected.
    #[error("zero-sized allocation requested")]
    ZeroSize,
    /// The handle does not name a live allocation.
    #[error("handle {0} does not refer to a live allocation")]
    UnknownHandle(u32),
    /// The allocator only ever grows its address space.
    #[error("cannot shrink capacity from {current} to {requested}")]
    Shrink {
        /// Capacity before the call.
        current: u32,
        /// Capacity that was asked for.
        requested: u32,
    },
    /// An internal invariant no longer holds.
    #[error("allocator invariant violated: {0}")]
    Corrupted(String),
}

/// Failures reported by the staging ring buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StagingError {
    /// Empty copies carry nothing to upload.
    #[error("attempted to stage an empty copy")]
    Empty,
    /// The copy can never fit, no matter how many handles are released.
    #[error("copy of {requested} bytes exceeds ring capacity of {capacity} bytes")]
    TooLarge {
        /// Requested size in bytes.
        requested: usize,
        /// Total ring capacity in bytes.
        capacity: usize,
    },
    /// The region the cursor would hand out is still referenced by a live copy.
    #[error("staging ring has no free region for {requested} bytes")]
    Exhausted {
        /// Requested size in bytes.
        requested: usize,
    },
    /// The copy handle was already released or belongs to a previous generation.
    #[error("copy handle is stale")]
    StaleHandle,
}

/// Failures reported by object pools.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// A fixed-size pool has every object checked out.
    #[error("object pool exhausted ({capacity} objects checked out)")]
    Exhausted {
        /// Number of objects the pool was created with.
        capacity: usize,
    },
}

/// Failures reported while setting up the bounded task pool.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The worker thread pool could not be created.
    #[error("failed to build worker pool: {0}")]
    PoolBuild(#[from] rayon::ThreadPoolBuildError),
}

/// Failures reported by a GPU backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpuError {
    /// The device is gone. There is no recovery path.
    #[error("gpu device lost: {0}")]
    DeviceLost(String),
    /// No adapter or device could be obtained.
    #[error("no gpu device available: {0}")]
    Unavailable(String),
    /// A buffer id that the backend never handed out, or already destroyed.
    #[error("unknown device buffer {0}")]
    UnknownBuffer(u64),
    /// A staging buffer id that the backend never handed out.
    #[error("unknown staging buffer {0}")]
    UnknownStagingBuffer(u64),
    /// A copy command reaches past the end of its source or destination.
    #[error("copy of {size} bytes at offset {offset} exceeds buffer of {len} bytes")]
    OutOfRange {
        /// Start of the accessed range.
        offset: u64,
        /// Length of the accessed range.
        size: u64,
        /// Length of the buffer.
        len: u64,
    },
}

/// Failures reported while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the file failed.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid JSON for the config schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    /// A value is out of its accepted range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Umbrella error for the streaming context.
#[derive(Debug, Error)]
pub enum StreamingError {
    /// See [`AllocatorError`].
    #[error(transparent)]
    Allocator(#[from] AllocatorError),
    /// See [`StagingError`].
    #[error(transparent)]
    Staging(#[from] StagingError),
    /// See [`GpuError`].
    #[error(transparent)]
    Gpu(#[from] GpuError),
    /// See [`TaskError`].
    #[error(transparent)]
    Task(#[from] TaskError),
    /// See [`ConfigError`].
    #[error(transparent)]
    Config(#[from] ConfigError),
}
